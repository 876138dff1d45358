//! Downloaded-document storage, rate-limited fetching, the durable note
//! store and the singleton lease lock.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod breaker;
pub mod fetch;
pub mod lock;
pub mod retry;
pub mod store;

pub use breaker::{Admission, BreakerConfig, BreakerPermit, BreakerPhase, CircuitBreaker};
pub use fetch::{
    FetchError, Fetched, FetcherConfig, HttpClientConfig, RateLimitedFetcher, ReqwestTransport,
    TokenBucketConfig, Transport, TransportError, TransportResponse,
};
pub use lock::{LeaseGuard, LeaseLock, LeaseOwner, LockError};
pub use retry::{classify_status, RetryDisposition, RetryPolicy};
pub use store::memory::MemoryStore;
pub use store::postgres::PgStore;
pub use store::{
    CommitReport, CommitRequest, NoteStore, ReconcileReport, ReconcileRequest, StoreError,
};

pub const CRATE_NAME: &str = "notesync-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once storage for snapshot documents and boundary
/// geometry payloads.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<namespace>/<YYYYMMDD>/<hash>.<ext>`; the day bucket keeps snapshot
    /// history browsable while the hash keeps identical payloads deduplicated.
    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        namespace: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(namespace)
            .join(day)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Writes through a temp file and an atomic rename, so readers never see
    /// a partially written document.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        namespace: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.artifact_relative_path(fetched_at, namespace, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    pub async fn read_bytes(&self, artifact: &StoredArtifact) -> anyhow::Result<Vec<u8>> {
        fs::read(&artifact.absolute_path)
            .await
            .with_context(|| format!("reading artifact {}", artifact.absolute_path.display()))
    }
}
