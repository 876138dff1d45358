//! Loader/committer: hands a cycle's rows to the store's transactional
//! commit and reports what the integrity gate decided.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use notesync_core::{IntegrityGate, RegionLookup, RowBatch};
use notesync_storage::{CommitReport, CommitRequest, NoteStore, StoreError};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub integrity_ratio: f64,
    pub commit: CommitReport,
}

pub struct Loader {
    store: Arc<dyn NoteStore>,
    gate: IntegrityGate,
    window: chrono::Duration,
    regions: Arc<dyn RegionLookup>,
}

impl Loader {
    pub fn new(
        store: Arc<dyn NoteStore>,
        gate: IntegrityGate,
        window: chrono::Duration,
        regions: Arc<dyn RegionLookup>,
    ) -> Self {
        Self {
            store,
            gate,
            window,
            regions,
        }
    }

    pub async fn load(
        &self,
        cycle_id: Uuid,
        started_at: DateTime<Utc>,
        batch: &RowBatch,
    ) -> Result<LoadOutcome, StoreError> {
        let commit = self
            .store
            .commit_cycle(CommitRequest {
                cycle_id,
                started_at,
                batch,
                integrity_window: self.window,
                gate: &self.gate,
                regions: self.regions.as_ref(),
            })
            .await?;

        let decision = &commit.decision;
        if !decision.passed() {
            warn!(
                %cycle_id,
                ratio = decision.ratio,
                threshold = self.gate.fail_threshold(),
                missing = commit.integrity.recent_without_annotations,
                recent = commit.integrity.recent_records,
                "integrity check failed, checkpoint withheld"
            );
        } else if let Some(gap) = &decision.gap {
            warn!(
                %cycle_id,
                gap_id = %gap.id,
                affected = gap.affected_count,
                percentage = gap.percentage,
                "records without annotations recorded for reconciliation"
            );
        } else if decision.permissive {
            info!(%cycle_id, "annotation store empty, integrity check skipped");
        }

        Ok(LoadOutcome {
            inserted: commit.inserted_records,
            updated: commit.updated_records,
            integrity_ratio: decision.ratio,
            commit,
        })
    }
}
