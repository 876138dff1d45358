//! Concurrent refresh of reference boundary geometries.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use notesync_core::ZoneKind;
use notesync_storage::ArtifactStore;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::BoundarySource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BoundaryTarget {
    pub kind: ZoneKind,
    pub id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadedBoundary {
    pub target: BoundaryTarget,
    pub relative_path: PathBuf,
    pub bytes: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedBoundary {
    pub target: BoundaryTarget,
    pub error: String,
}

/// Every requested target appears in exactly one of the two lists.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BoundaryRefreshReport {
    pub downloaded: Vec<DownloadedBoundary>,
    pub failed: Vec<FailedBoundary>,
}

impl BoundaryRefreshReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct BoundaryRefresher {
    source: Arc<dyn BoundarySource>,
    artifacts: ArtifactStore,
}

impl BoundaryRefresher {
    pub fn new(source: Arc<dyn BoundarySource>, artifacts: ArtifactStore) -> Self {
        Self { source, artifacts }
    }

    /// Fans every target out at once; the source's fetcher is what bounds
    /// how many are actually on the wire.
    pub async fn refresh(&self, targets: &[BoundaryTarget]) -> BoundaryRefreshReport {
        let mut tasks = JoinSet::new();
        for target in targets.iter().copied() {
            let source = Arc::clone(&self.source);
            let artifacts = self.artifacts.clone();
            tasks.spawn(async move {
                let outcome = match source.fetch_boundary(target.kind, target.id).await {
                    Ok(payload) => artifacts
                        .store_bytes(
                            Utc::now(),
                            &format!("boundaries/{}", target.kind.as_str()),
                            "json",
                            &payload,
                        )
                        .await
                        .map_err(|err| format!("{err:#}")),
                    Err(err) => Err(err.to_string()),
                };
                (target, outcome)
            });
        }

        let mut report = BoundaryRefreshReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((target, Ok(stored))) => report.downloaded.push(DownloadedBoundary {
                    target,
                    relative_path: stored.relative_path,
                    bytes: stored.byte_size,
                    deduplicated: stored.deduplicated,
                }),
                Ok((target, Err(error))) => {
                    warn!(
                        kind = target.kind.as_str(),
                        id = target.id,
                        %error,
                        "boundary download failed"
                    );
                    report.failed.push(FailedBoundary { target, error });
                }
                Err(join_err) => {
                    warn!(error = %join_err, "boundary task aborted");
                }
            }
        }

        // A panicked task loses its target; account for it so nothing is dropped.
        for target in targets {
            let seen = report.downloaded.iter().any(|d| d.target == *target)
                || report.failed.iter().any(|f| f.target == *target);
            if !seen {
                report.failed.push(FailedBoundary {
                    target: *target,
                    error: "download task aborted".to_string(),
                });
            }
        }

        report.downloaded.sort_by_key(|d| (d.target.kind.as_str(), d.target.id));
        report.failed.sort_by_key(|f| (f.target.kind.as_str(), f.target.id));
        info!(
            downloaded = report.downloaded.len(),
            failed = report.failed.len(),
            "boundary refresh finished"
        );
        report
    }
}
