//! HTTP sources routed through the rate-limited fetcher, and file-backed
//! fixture sources with the same contracts.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use notesync_core::ZoneKind;
use notesync_storage::RateLimitedFetcher;
use tracing::debug;

use crate::{BoundarySource, IncrementalSource, SnapshotSource, SourceError};

/// Query API for notes updated since a timestamp. The API caps its own
/// result size at `limit`.
#[derive(Debug, Clone)]
pub struct HttpIncrementalSource {
    fetcher: Arc<RateLimitedFetcher>,
    endpoint: String,
    limit: usize,
}

impl HttpIncrementalSource {
    pub fn new(
        fetcher: Arc<RateLimitedFetcher>,
        endpoint: impl Into<String>,
        limit: usize,
    ) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
            limit,
        }
    }

    pub fn url_since(&self, since: DateTime<Utc>) -> String {
        format!(
            "{}?limit={}&closed=-1&sort=updated_at&order=oldest&from={}",
            self.endpoint.trim_end_matches('?'),
            self.limit,
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

#[async_trait]
impl IncrementalSource for HttpIncrementalSource {
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<u8>, SourceError> {
        let url = self.url_since(since);
        debug!(%url, "fetching incremental notes");
        Ok(self.fetcher.fetch(&url).await?.body)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    fetcher: Arc<RateLimitedFetcher>,
    url: String,
}

impl HttpSnapshotSource {
    pub fn new(fetcher: Arc<RateLimitedFetcher>, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_snapshot(&self) -> Result<Vec<u8>, SourceError> {
        Ok(self.fetcher.fetch(&self.url).await?.body)
    }
}

/// Boundary mirror laid out as `<base>/<kind>/<id>.json`.
#[derive(Debug, Clone)]
pub struct HttpBoundarySource {
    fetcher: Arc<RateLimitedFetcher>,
    base_url: String,
}

impl HttpBoundarySource {
    pub fn new(fetcher: Arc<RateLimitedFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }

    pub fn url_for(&self, kind: ZoneKind, id: i64) -> String {
        format!("{}/{}/{id}.json", self.base_url.trim_end_matches('/'), kind.as_str())
    }
}

#[async_trait]
impl BoundarySource for HttpBoundarySource {
    async fn fetch_boundary(&self, kind: ZoneKind, id: i64) -> Result<Vec<u8>, SourceError> {
        Ok(self.fetcher.fetch(&self.url_for(kind, id)).await?.body)
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>, SourceError> {
    tokio::fs::read(path).await.map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serves queued documents in order, then keeps serving the last one.
/// Every requested `since` is recorded.
#[derive(Debug, Default)]
pub struct FixtureIncrementalSource {
    documents: Mutex<VecDeque<Vec<u8>>>,
    last: Mutex<Option<Vec<u8>>>,
    requested: Mutex<Vec<DateTime<Utc>>>,
}

impl FixtureIncrementalSource {
    pub fn new(documents: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            documents: Mutex::new(documents.into_iter().collect()),
            ..Self::default()
        }
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        Ok(Self::new([read_file(path.as_ref()).await?]))
    }

    pub fn push(&self, document: Vec<u8>) {
        lock(&self.documents).push_back(document);
    }

    pub fn requested_since(&self) -> Vec<DateTime<Utc>> {
        lock(&self.requested).clone()
    }
}

#[async_trait]
impl IncrementalSource for FixtureIncrementalSource {
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<u8>, SourceError> {
        lock(&self.requested).push(since);
        let next = lock(&self.documents).pop_front();
        let mut last = lock(&self.last);
        match next {
            Some(doc) => {
                *last = Some(doc.clone());
                Ok(doc)
            }
            None => last.clone().ok_or(SourceError::Exhausted),
        }
    }
}

#[derive(Debug, Default)]
pub struct FixtureSnapshotSource {
    document: Mutex<Vec<u8>>,
}

impl FixtureSnapshotSource {
    pub fn new(document: Vec<u8>) -> Self {
        Self {
            document: Mutex::new(document),
        }
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        Ok(Self::new(read_file(path.as_ref()).await?))
    }

    pub fn replace(&self, document: Vec<u8>) {
        *lock(&self.document) = document;
    }
}

#[async_trait]
impl SnapshotSource for FixtureSnapshotSource {
    async fn fetch_snapshot(&self) -> Result<Vec<u8>, SourceError> {
        Ok(lock(&self.document).clone())
    }
}

/// Reads `<dir>/<kind>/<id>.json`.
#[derive(Debug, Clone)]
pub struct FixtureBoundarySource {
    dir: PathBuf,
}

impl FixtureBoundarySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl BoundarySource for FixtureBoundarySource {
    async fn fetch_boundary(&self, kind: ZoneKind, id: i64) -> Result<Vec<u8>, SourceError> {
        read_file(&self.dir.join(kind.as_str()).join(format!("{id}.json"))).await
    }
}
