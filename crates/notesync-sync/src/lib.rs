//! Cycle orchestration: partitioning, the parallel transform, the
//! loader/committer, the failed marker, reports and the gap reconciler.

use std::path::PathBuf;

use notesync_storage::{LeaseOwner, LockError};
use serde::Serialize;
use thiserror::Error;

pub mod alert;
pub mod config;
pub mod loader;
pub mod marker;
pub mod orchestrator;
pub mod partition;
pub mod reconcile;
pub mod report;
pub mod transform;

pub use alert::{Alert, AlertSink, LogAlertSink, WebhookAlertSink};
pub use config::{ConfigError, SyncConfig};
pub use loader::{LoadOutcome, Loader};
pub use marker::{FailedMarker, FailedMarkerFile, MarkerError};
pub use orchestrator::{adaptive_sleep, CycleOutcome, SyncOrchestrator};
pub use partition::{count_records, Partition, Partitioner};
pub use reconcile::{build_scheduler, GapReconciler, ReconcileRun};
pub use report::{CycleMode, CycleReport, CycleState};
pub use transform::{plan_workers, ParallelTransformError, ParallelTransformer, WorkerPlan};

pub const CRATE_NAME: &str = "notesync-sync";

/// Pipeline step a fatal error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStage {
    Checkpoint,
    FetchIncremental,
    FetchSnapshot,
    Transform,
    Commit,
    Reconcile,
}

impl CycleStage {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStage::Checkpoint => "checkpoint",
            CycleStage::FetchIncremental => "fetch_incremental",
            CycleStage::FetchSnapshot => "fetch_snapshot",
            CycleStage::Transform => "transform",
            CycleStage::Commit => "commit",
            CycleStage::Reconcile => "reconcile",
        }
    }
}

impl std::fmt::Display for CycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("lock {} is held by pid {} on {} since {}", .path.display(), .holder.pid, .holder.host, .holder.acquired_at)]
    LockContention { path: PathBuf, holder: LeaseOwner },
    #[error(transparent)]
    Lock(LockError),
    #[error("failed marker {} present (cycle {} failed at {}: {}); clear it to resume", .path.display(), .marker.cycle_id, .marker.stage, .marker.cause)]
    FailedMarkerPresent { path: PathBuf, marker: FailedMarker },
    #[error(transparent)]
    Marker(#[from] MarkerError),
    #[error("{stage} failed: {source:#}")]
    Stage {
        stage: CycleStage,
        #[source]
        source: anyhow::Error,
    },
    #[error("shutdown requested")]
    Cancelled,
}

impl From<LockError> for SyncError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Contended { path, holder } => SyncError::LockContention { path, holder },
            other => SyncError::Lock(other),
        }
    }
}

impl SyncError {
    pub fn stage(stage: CycleStage, source: impl Into<anyhow::Error>) -> Self {
        SyncError::Stage {
            stage,
            source: source.into(),
        }
    }

    /// 0 is success; 2 configuration, 3 lock contention, 4 integrity halt.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Config(_) => 2,
            SyncError::LockContention { .. } => 3,
            SyncError::FailedMarkerPresent { .. } | SyncError::Stage { .. } => 4,
            SyncError::Cancelled => 0,
            SyncError::Lock(_) | SyncError::Marker(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn exit_codes_separate_operator_cases() {
        let config = SyncError::Config(ConfigError::Invalid("zero cadence".into()));
        assert_eq!(config.exit_code(), 2);

        let holder = LeaseOwner {
            holder_id: Uuid::new_v4(),
            pid: 42,
            host: "worker-1".into(),
            purpose: "sync".into(),
            acquired_at: Utc::now(),
            heartbeat_at: Utc::now(),
        };
        let contended: SyncError = LockError::Contended {
            path: PathBuf::from("state/notesync.lock"),
            holder,
        }
        .into();
        assert_eq!(contended.exit_code(), 3);

        let marker = FailedMarker::new(Uuid::new_v4(), "commit", "boom");
        let present = SyncError::FailedMarkerPresent {
            path: PathBuf::from("state/failed_execution.json"),
            marker,
        };
        assert_eq!(present.exit_code(), 4);
        assert_eq!(
            SyncError::stage(CycleStage::Commit, anyhow::anyhow!("deadlock")).exit_code(),
            4
        );
    }
}
