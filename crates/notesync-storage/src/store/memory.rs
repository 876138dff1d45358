//! In-process store backend. The whole state sits behind one async mutex,
//! which makes every operation a serializable transaction; work happens on
//! a copy that replaces the live state only when the operation succeeds.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notesync_core::{
    Annotation, GapRecord, IntegrityReport, NoteStatus, Record, RowBatch, SyncCheckpoint,
};
use tokio::sync::Mutex;

use super::{
    batch_activity, dedup_batch, CommitReport, CommitRequest, NoteStore, ReconcileReport,
    ReconcileRequest, StoreError, MAX_GAP_IDS,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryState {
    pub records: BTreeMap<i64, Record>,
    pub annotations: BTreeMap<(i64, i32), Annotation>,
    pub checkpoint: SyncCheckpoint,
    pub checkpoint_history: Vec<SyncCheckpoint>,
    pub gaps: Vec<GapRecord>,
}

impl MemoryState {
    fn activity_of(&self, id: i64) -> Option<DateTime<Utc>> {
        let record = self.records.get(&id)?;
        self.annotations
            .range((id, i32::MIN)..=(id, i32::MAX))
            .map(|(_, annotation)| annotation.at)
            .chain(std::iter::once(record.latest_activity()))
            .max()
    }

    /// Waiting for repair: recent, visible and still without annotations.
    fn awaits_repair(&self, id: i64, cutoff: DateTime<Utc>) -> bool {
        self.records.get(&id).is_some_and(|record| {
            record.created_at >= cutoff
                && record.status != NoteStatus::Hidden
                && self
                    .annotations
                    .range((id, i32::MIN)..=(id, i32::MAX))
                    .next()
                    .is_none()
        })
    }

    fn integrity(&self, window_start: chrono::DateTime<Utc>) -> IntegrityReport {
        let annotated: HashSet<i64> = self.annotations.keys().map(|(id, _)| *id).collect();
        let mut recent_records = 0u64;
        let mut affected_ids = Vec::new();
        let mut missing = 0u64;
        for record in self.records.values() {
            if record.created_at < window_start || record.status == NoteStatus::Hidden {
                continue;
            }
            recent_records += 1;
            if !annotated.contains(&record.id) {
                missing += 1;
                if affected_ids.len() < MAX_GAP_IDS {
                    affected_ids.push(record.id);
                }
            }
        }
        IntegrityReport {
            window_start,
            recent_records,
            recent_without_annotations: missing,
            affected_ids,
            store_annotations: self.annotations.len() as u64,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes rows directly, bypassing staging and the gate.
    pub async fn seed(&self, batch: RowBatch) {
        let mut state = self.state.lock().await;
        for record in batch.records {
            state.records.insert(record.id, record);
        }
        for annotation in batch.annotations {
            state.annotations.insert(annotation.key(), annotation);
        }
    }

    pub async fn remove_record(&self, id: i64) {
        let mut state = self.state.lock().await;
        state.records.remove(&id);
        state.annotations.retain(|(record_id, _), _| *record_id != id);
    }

    pub async fn contents(&self) -> MemoryState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl NoteStore for MemoryStore {
    async fn checkpoint(&self) -> Result<SyncCheckpoint, StoreError> {
        Ok(self.state.lock().await.checkpoint)
    }

    async fn commit_cycle(&self, request: CommitRequest<'_>) -> Result<CommitReport, StoreError> {
        let mut live = self.state.lock().await;
        let mut tx = live.clone();

        let (staged_records, staged_annotations) = dedup_batch(request.batch);
        let activity = batch_activity(&staged_records, &staged_annotations);

        let mut inserted_records = 0u64;
        let mut updated_records = 0u64;
        let mut regions_resolved = 0u64;
        for incoming in staged_records {
            let stored_activity = tx.activity_of(incoming.id);
            match tx.records.get_mut(&incoming.id) {
                Some(existing) => {
                    let region_id = incoming.region_id.or(existing.region_id);
                    let fresh = stored_activity.map_or(true, |stored| {
                        activity.get(&incoming.id).is_some_and(|at| *at >= stored)
                    });
                    let (status, closed_at) = if fresh {
                        (incoming.status, incoming.closed_at)
                    } else {
                        (existing.status, existing.closed_at)
                    };
                    if existing.status != status
                        || existing.closed_at != closed_at
                        || existing.region_id != region_id
                    {
                        existing.status = status;
                        existing.closed_at = closed_at;
                        existing.region_id = region_id;
                        updated_records += 1;
                    }
                }
                None => {
                    let mut record = incoming.clone();
                    if record.region_id.is_none() {
                        record.region_id = request.regions.region_of(record.lat, record.lon);
                        if record.region_id.is_some() {
                            regions_resolved += 1;
                        }
                    }
                    tx.records.insert(record.id, record);
                    inserted_records += 1;
                }
            }
        }

        let mut inserted_annotations = 0u64;
        let mut orphan_annotations = 0u64;
        for annotation in staged_annotations {
            if !tx.records.contains_key(&annotation.record_id) {
                orphan_annotations += 1;
                continue;
            }
            if !tx.annotations.contains_key(&annotation.key()) {
                tx.annotations.insert(annotation.key(), annotation.clone());
                inserted_annotations += 1;
            }
        }

        let integrity = tx.integrity(request.window_start());
        let decision = request.gate.decide(
            &integrity,
            &tx.checkpoint,
            request.batch.newest_timestamp(),
            request.cycle_id,
            Utc::now(),
        );
        if decision.checkpoint.timestamp < tx.checkpoint.timestamp {
            return Err(StoreError::Invariant(format!(
                "checkpoint would regress from {} to {}",
                tx.checkpoint.timestamp, decision.checkpoint.timestamp
            )));
        }
        tx.checkpoint = decision.checkpoint;
        tx.checkpoint_history.push(decision.checkpoint);
        if let Some(gap) = &decision.gap {
            tx.gaps.push(gap.clone());
        }

        *live = tx;
        Ok(CommitReport {
            inserted_records,
            updated_records,
            inserted_annotations,
            orphan_annotations,
            regions_resolved,
            integrity,
            decision,
        })
    }

    async fn reconcile(
        &self,
        request: ReconcileRequest<'_>,
    ) -> Result<ReconcileReport, StoreError> {
        let mut live = self.state.lock().await;
        let mut tx = live.clone();
        let mut report = ReconcileReport::default();

        let (snapshot_records, snapshot_annotations) = dedup_batch(request.snapshot);
        let upstream: HashSet<i64> = snapshot_records.iter().map(|r| r.id).collect();

        for incoming in snapshot_records {
            if incoming.created_at >= request.cutoff || tx.records.contains_key(&incoming.id) {
                continue;
            }
            let mut record = incoming.clone();
            if record.region_id.is_none() {
                record.region_id = request.regions.region_of(record.lat, record.lon);
            }
            report.inserted_record_ids.push(record.id);
            tx.records.insert(record.id, record);
        }

        for annotation in snapshot_annotations {
            let Some(record) = tx.records.get(&annotation.record_id) else {
                continue;
            };
            if record.created_at >= request.cutoff
                || tx.annotations.contains_key(&annotation.key())
            {
                continue;
            }
            tx.annotations.insert(annotation.key(), annotation.clone());
            report.inserted_annotations += 1;
        }

        for record in tx.records.values_mut() {
            if record.created_at < request.cutoff
                && record.status != NoteStatus::Hidden
                && !upstream.contains(&record.id)
            {
                record.status = NoteStatus::Hidden;
                report.hidden_record_ids.push(record.id);
            }
        }

        let repaired: Vec<usize> = tx
            .gaps
            .iter()
            .enumerate()
            .filter(|(_, gap)| !gap.processed)
            .filter(|(_, gap)| {
                !gap.affected_ids
                    .iter()
                    .any(|id| tx.awaits_repair(*id, request.cutoff))
            })
            .map(|(index, _)| index)
            .collect();
        for index in repaired {
            tx.gaps[index].processed = true;
            report.gaps_processed += 1;
        }

        *live = tx;
        Ok(report)
    }

    async fn unprocessed_gaps(&self) -> Result<Vec<GapRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .gaps
            .iter()
            .filter(|g| !g.processed)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use notesync_core::{AnnotationKind, IntegrityGate, NoRegionLookup, RegionLookup};
    use uuid::Uuid;

    struct FixedRegion(i64);

    impl RegionLookup for FixedRegion {
        fn region_of(&self, _lat: f64, _lon: f64) -> Option<i64> {
            Some(self.0)
        }
    }

    fn at(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap() + Duration::hours(hour)
    }

    fn record(id: i64, created: DateTime<Utc>) -> Record {
        Record {
            id,
            lat: 48.85,
            lon: 2.35,
            created_at: created,
            closed_at: None,
            status: NoteStatus::Open,
            region_id: None,
        }
    }

    fn opened(id: i64, when: DateTime<Utc>) -> Annotation {
        Annotation {
            record_id: id,
            sequence: 1,
            kind: AnnotationKind::Opened,
            at: when,
            actor_id: Some(7),
            actor_name: Some("mapper".into()),
            body: Some("bench missing".into()),
        }
    }

    fn request<'a>(
        batch: &'a RowBatch,
        gate: &'a IntegrityGate,
        regions: &'a dyn RegionLookup,
    ) -> CommitRequest<'a> {
        CommitRequest {
            cycle_id: Uuid::new_v4(),
            started_at: at(30),
            batch,
            integrity_window: Duration::days(1),
            gate,
            regions,
        }
    }

    #[tokio::test]
    async fn loading_the_same_batch_twice_is_idempotent() {
        let store = MemoryStore::new();
        let gate = IntegrityGate::default();
        let batch = RowBatch {
            records: vec![record(1, at(20)), record(2, at(21))],
            annotations: vec![opened(1, at(20)), opened(2, at(21))],
        };

        let first = store.commit_cycle(request(&batch, &gate, &FixedRegion(3))).await.unwrap();
        let after_first = store.contents().await;
        let second = store.commit_cycle(request(&batch, &gate, &FixedRegion(3))).await.unwrap();
        let after_second = store.contents().await;

        assert_eq!(first.inserted_records, 2);
        assert_eq!(first.inserted_annotations, 2);
        assert_eq!(second.inserted_records, 0);
        assert_eq!(second.updated_records, 0);
        assert_eq!(second.inserted_annotations, 0);
        assert_eq!(after_first.records, after_second.records);
        assert_eq!(after_first.annotations, after_second.annotations);
        assert_eq!(after_first.checkpoint.timestamp, after_second.checkpoint.timestamp);
    }

    #[tokio::test]
    async fn update_keeps_assigned_region_and_skips_lookup() {
        let store = MemoryStore::new();
        let gate = IntegrityGate::default();
        let first = RowBatch {
            records: vec![record(9, at(25))],
            annotations: vec![opened(9, at(25))],
        };
        store.commit_cycle(request(&first, &gate, &FixedRegion(44))).await.unwrap();

        let mut closed = record(9, at(25));
        closed.status = NoteStatus::Closed;
        closed.closed_at = Some(at(26));
        let second = RowBatch {
            records: vec![closed],
            annotations: vec![],
        };
        let report = store
            .commit_cycle(request(&second, &gate, &FixedRegion(99)))
            .await
            .unwrap();

        assert_eq!(report.updated_records, 1);
        assert_eq!(report.regions_resolved, 0);
        let state = store.contents().await;
        let stored = &state.records[&9];
        assert_eq!(stored.region_id, Some(44));
        assert_eq!(stored.status, NoteStatus::Closed);
    }

    #[tokio::test]
    async fn orphan_annotations_are_counted_not_stored() {
        let store = MemoryStore::new();
        let gate = IntegrityGate::default();
        let batch = RowBatch {
            records: vec![],
            annotations: vec![opened(404, at(20))],
        };
        let report = store.commit_cycle(request(&batch, &gate, &NoRegionLookup)).await.unwrap();
        assert_eq!(report.orphan_annotations, 1);
        assert!(store.contents().await.annotations.is_empty());
    }

    #[tokio::test]
    async fn failed_gate_keeps_previous_checkpoint_but_commits_rows() {
        let store = MemoryStore::new();
        let gate = IntegrityGate::new(0.05);
        store
            .seed(RowBatch {
                records: vec![record(1, at(1))],
                annotations: vec![opened(1, at(1))],
            })
            .await;

        let batch = RowBatch {
            records: vec![record(2, at(20)), record(3, at(21)), record(4, at(22))],
            annotations: vec![opened(2, at(20))],
        };
        let report = store.commit_cycle(request(&batch, &gate, &NoRegionLookup)).await.unwrap();

        assert!(!report.decision.passed());
        let state = store.contents().await;
        assert_eq!(state.checkpoint.timestamp, SyncCheckpoint::initial().timestamp);
        assert!(!state.checkpoint.integrity_passed);
        assert_eq!(state.records.len(), 4);
        assert_eq!(state.gaps.len(), 1);
        assert_eq!(state.gaps[0].affected_ids, vec![3, 4]);
    }

    fn event(id: i64, sequence: i32, kind: AnnotationKind, when: DateTime<Utc>) -> Annotation {
        Annotation {
            sequence,
            kind,
            ..opened(id, when)
        }
    }

    #[tokio::test]
    async fn stale_rows_do_not_roll_back_a_closure() {
        let store = MemoryStore::new();
        let gate = IntegrityGate::default();
        let first = RowBatch {
            records: vec![record(9, at(25))],
            annotations: vec![opened(9, at(25))],
        };
        store.commit_cycle(request(&first, &gate, &NoRegionLookup)).await.unwrap();

        let mut closed = record(9, at(25));
        closed.status = NoteStatus::Closed;
        closed.closed_at = Some(at(28));
        let closing = RowBatch {
            records: vec![closed],
            annotations: vec![event(9, 2, AnnotationKind::Closed, at(28))],
        };
        store.commit_cycle(request(&closing, &gate, &NoRegionLookup)).await.unwrap();

        // An overlapping source still carrying the note as open.
        let stale = store.commit_cycle(request(&first, &gate, &NoRegionLookup)).await.unwrap();
        assert_eq!(stale.updated_records, 0);
        let state = store.contents().await;
        assert_eq!(state.records[&9].status, NoteStatus::Closed);
        assert_eq!(state.records[&9].closed_at, Some(at(28)));

        let mut reopened = record(9, at(25));
        reopened.status = NoteStatus::Reopened;
        let reopening = RowBatch {
            records: vec![reopened],
            annotations: vec![event(9, 3, AnnotationKind::Reopened, at(29))],
        };
        let report = store
            .commit_cycle(request(&reopening, &gate, &NoRegionLookup))
            .await
            .unwrap();
        assert_eq!(report.updated_records, 1);
        let state = store.contents().await;
        assert_eq!(state.records[&9].status, NoteStatus::Reopened);
        assert_eq!(state.records[&9].closed_at, None);
    }

    #[tokio::test]
    async fn same_day_gap_stays_open_until_its_records_are_repaired() {
        let store = MemoryStore::new();
        let gate = IntegrityGate::new(0.05);
        let batch = RowBatch {
            records: vec![record(2, at(25)), record(3, at(26)), record(4, at(27))],
            annotations: vec![opened(2, at(25))],
        };
        let report = store.commit_cycle(request(&batch, &gate, &NoRegionLookup)).await.unwrap();
        assert!(!report.decision.passed());
        assert_eq!(store.unprocessed_gaps().await.unwrap()[0].affected_ids, vec![3, 4]);

        let snapshot = RowBatch {
            records: vec![record(2, at(25)), record(3, at(26)), record(4, at(27))],
            annotations: vec![opened(2, at(25)), opened(3, at(26)), opened(4, at(27))],
        };
        let same_day = store
            .reconcile(ReconcileRequest {
                run_id: Uuid::new_v4(),
                cutoff: at(24),
                snapshot: &snapshot,
                regions: &NoRegionLookup,
            })
            .await
            .unwrap();
        assert_eq!(same_day.gaps_processed, 0);
        assert_eq!(same_day.inserted_annotations, 0);
        assert_eq!(store.unprocessed_gaps().await.unwrap().len(), 1);

        let next_day = store
            .reconcile(ReconcileRequest {
                run_id: Uuid::new_v4(),
                cutoff: at(48),
                snapshot: &snapshot,
                regions: &NoRegionLookup,
            })
            .await
            .unwrap();
        assert_eq!(next_day.inserted_annotations, 2);
        assert_eq!(next_day.gaps_processed, 1);
        assert!(next_day.hidden_record_ids.is_empty());
        assert!(store.unprocessed_gaps().await.unwrap().is_empty());
    }
}
