//! Durable note store: staged bulk load, idempotent merge and the
//! integrity-gated checkpoint update, all inside one transactional scope.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use notesync_core::{
    Annotation, GapRecord, GateDecision, IntegrityGate, IntegrityReport, Record, RegionLookup,
    RowBatch, SyncCheckpoint,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

/// Affected identifiers listed on one gap row.
pub const MAX_GAP_IDS: usize = 10_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store invariant violated: {0}")]
    Invariant(String),
}

/// Everything one cycle's commit needs. The gate is applied before the
/// transaction commits, against the transaction's own view of the data.
pub struct CommitRequest<'a> {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub batch: &'a RowBatch,
    pub integrity_window: Duration,
    pub gate: &'a IntegrityGate,
    pub regions: &'a dyn RegionLookup,
}

impl CommitRequest<'_> {
    pub fn window_start(&self) -> DateTime<Utc> {
        self.started_at - self.integrity_window
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitReport {
    pub inserted_records: u64,
    pub updated_records: u64,
    pub inserted_annotations: u64,
    pub orphan_annotations: u64,
    pub regions_resolved: u64,
    pub integrity: IntegrityReport,
    pub decision: GateDecision,
}

pub struct ReconcileRequest<'a> {
    pub run_id: Uuid,
    /// Only rows created strictly before this instant are compared.
    pub cutoff: DateTime<Utc>,
    pub snapshot: &'a RowBatch,
    pub regions: &'a dyn RegionLookup,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub inserted_record_ids: Vec<i64>,
    pub inserted_annotations: u64,
    pub hidden_record_ids: Vec<i64>,
    pub gaps_processed: u64,
}

impl ReconcileReport {
    pub fn writes(&self) -> u64 {
        self.inserted_record_ids.len() as u64
            + self.inserted_annotations
            + self.hidden_record_ids.len() as u64
            + self.gaps_processed
    }
}

#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn checkpoint(&self) -> Result<SyncCheckpoint, StoreError>;

    /// Stages and merges `request.batch`, evaluates the gate and persists its
    /// decision. Nothing is visible to other sessions unless all of it is.
    async fn commit_cycle(&self, request: CommitRequest<'_>) -> Result<CommitReport, StoreError>;

    /// Repairs the store against an authoritative snapshot. A gap is marked
    /// processed only once none of its records is still waiting for repair,
    /// i.e. each is annotated, hidden, or old enough to have been compared.
    async fn reconcile(
        &self,
        request: ReconcileRequest<'_>,
    ) -> Result<ReconcileReport, StoreError>;

    async fn unprocessed_gaps(&self) -> Result<Vec<GapRecord>, StoreError>;
}

/// Collapses duplicate rows from overlapping sources: the record with the
/// latest activity wins, the first annotation for a key wins.
pub(crate) fn dedup_batch(batch: &RowBatch) -> (Vec<&Record>, Vec<&Annotation>) {
    let mut records: HashMap<i64, &Record> = HashMap::with_capacity(batch.records.len());
    for record in &batch.records {
        records
            .entry(record.id)
            .and_modify(|current| {
                if record.latest_activity() > current.latest_activity() {
                    *current = record;
                }
            })
            .or_insert(record);
    }
    let mut records: Vec<&Record> = records.into_values().collect();
    records.sort_by_key(|r| r.id);

    let mut annotations: HashMap<(i64, i32), &Annotation> =
        HashMap::with_capacity(batch.annotations.len());
    for annotation in &batch.annotations {
        annotations.entry(annotation.key()).or_insert(annotation);
    }
    let mut annotations: Vec<&Annotation> = annotations.into_values().collect();
    annotations.sort_by_key(|a| a.key());

    (records, annotations)
}

/// Newest activity per record in a batch: its own timestamps or any of its
/// annotations. An incoming row older than the stored record's activity must
/// not roll back status or closure.
pub(crate) fn batch_activity(
    records: &[&Record],
    annotations: &[&Annotation],
) -> HashMap<i64, DateTime<Utc>> {
    let mut activity: HashMap<i64, DateTime<Utc>> = records
        .iter()
        .map(|record| (record.id, record.latest_activity()))
        .collect();
    for annotation in annotations {
        if let Some(at) = activity.get_mut(&annotation.record_id) {
            if annotation.at > *at {
                *at = annotation.at;
            }
        }
    }
    activity
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use notesync_core::{AnnotationKind, NoteStatus};

    #[test]
    fn dedup_keeps_latest_record_state() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        let open = Record {
            id: 5,
            lat: 1.0,
            lon: 2.0,
            created_at: created,
            closed_at: None,
            status: NoteStatus::Open,
            region_id: None,
        };
        let closed = Record {
            closed_at: Some(created + Duration::hours(1)),
            status: NoteStatus::Closed,
            ..open.clone()
        };
        let comment = Annotation {
            record_id: 5,
            sequence: 1,
            kind: AnnotationKind::Opened,
            at: created,
            actor_id: None,
            actor_name: None,
            body: None,
        };
        let batch = RowBatch {
            records: vec![closed.clone(), open],
            annotations: vec![comment.clone(), comment],
        };

        let (records, annotations) = dedup_batch(&batch);
        assert_eq!(records, vec![&closed]);
        assert_eq!(annotations.len(), 1);
    }

    #[test]
    fn activity_includes_annotations() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        let reopened = Record {
            id: 6,
            lat: 1.0,
            lon: 2.0,
            created_at: created,
            closed_at: None,
            status: NoteStatus::Reopened,
            region_id: None,
        };
        let event = Annotation {
            record_id: 6,
            sequence: 3,
            kind: AnnotationKind::Reopened,
            at: created + Duration::hours(5),
            actor_id: None,
            actor_name: None,
            body: None,
        };
        let stray = Annotation {
            record_id: 99,
            ..event.clone()
        };

        let activity = batch_activity(&[&reopened], &[&event, &stray]);
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[&6], created + Duration::hours(5));
    }
}
