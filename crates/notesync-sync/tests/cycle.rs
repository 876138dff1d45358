mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notesync_adapters::{FixtureIncrementalSource, FixtureSnapshotSource};
use notesync_core::{GateVerdict, SyncCheckpoint};
use notesync_storage::{LeaseLock, MemoryStore, NoteStore};
use notesync_sync::marker::FailedMarkerFile;
use notesync_sync::{
    Alert, AlertSink, CycleMode, CycleState, FailedMarker, SyncConfig, SyncError, SyncOrchestrator,
};
use tokio::sync::watch;
use uuid::Uuid;

use common::{annotated, config, document, note_xml, secs};

struct Harness {
    _dir: tempfile::TempDir,
    config: SyncConfig,
    store: Arc<MemoryStore>,
    incremental: Arc<FixtureIncrementalSource>,
    snapshot: Arc<FixtureSnapshotSource>,
}

impl Harness {
    fn new(docs: Vec<Vec<u8>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        Self {
            _dir: dir,
            config,
            store: Arc::new(MemoryStore::new()),
            incremental: Arc::new(FixtureIncrementalSource::new(docs)),
            snapshot: Arc::new(FixtureSnapshotSource::new(document(&[]))),
        }
    }

    fn orchestrator(&self) -> SyncOrchestrator {
        SyncOrchestrator::new(
            self.config.clone(),
            self.store.clone(),
            self.incremental.clone(),
            self.snapshot.clone(),
        )
    }
}

fn running() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[derive(Default)]
struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_new_records_with_two_unannotated_pass_and_log_a_gap() {
    let now = secs(Utc::now());
    let h = Harness::new(vec![document(&[
        note_xml(1001, now - chrono::Duration::minutes(30), 1),
        note_xml(1002, now - chrono::Duration::minutes(20), 0),
        note_xml(1003, now - chrono::Duration::minutes(10), 0),
    ])]);
    h.store
        .seed(annotated(1..=100, now - chrono::Duration::hours(2)))
        .await;

    let outcome = h.orchestrator().run_cycle(running()).await.unwrap();
    let report = &outcome.report;

    assert_eq!(report.mode, CycleMode::Incremental);
    assert_eq!(report.inserted_records, 3);
    assert_eq!(report.verdict, GateVerdict::Pass);
    assert!(!report.permissive);
    assert!((report.integrity_ratio - 2.0 / 103.0).abs() < 1e-9);
    assert_eq!(report.checkpoint_before, SyncCheckpoint::initial());
    assert_eq!(
        report.checkpoint_after.timestamp,
        now - chrono::Duration::minutes(10)
    );
    assert!(report.checkpoint_after.integrity_passed);
    assert_eq!(
        report.states,
        vec![
            CycleState::Idle,
            CycleState::FetchingIncremental,
            CycleState::ProcessingIncremental,
            CycleState::Committing,
            CycleState::Idle,
        ]
    );

    let gaps = h.store.unprocessed_gaps().await.unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(Some(gaps[0].id), report.gap_id);
    assert_eq!(gaps[0].affected_count, 2);
    assert_eq!(gaps[0].total_count, 103);
    let mut affected = gaps[0].affected_ids.clone();
    affected.sort_unstable();
    assert_eq!(affected, vec![1002, 1003]);

    let written = outcome.report_path.expect("cycle report written");
    assert!(written.ends_with(format!("{}/cycle.json", report.cycle_id)));
    let json: serde_json::Value = serde_json::from_slice(&std::fs::read(written).unwrap()).unwrap();
    assert_eq!(json["verdict"], "pass");
    assert_eq!(json["mode"], "incremental");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn checkpoint_is_monotonic_and_held_while_integrity_fails() {
    let now = secs(Utc::now());
    let h = Harness::new(vec![
        document(&[
            note_xml(201, now - chrono::Duration::minutes(50), 1),
            note_xml(202, now - chrono::Duration::minutes(40), 2),
        ]),
        document(&(301..=305)
            .map(|id| note_xml(id, now - chrono::Duration::minutes(30), 0))
            .collect::<Vec<_>>()),
        document(&(301..=305)
            .map(|id| note_xml(id, now - chrono::Duration::minutes(30), 2))
            .collect::<Vec<_>>()),
    ]);
    h.store
        .seed(annotated(1..=10, now - chrono::Duration::hours(2)))
        .await;
    let orchestrator = h.orchestrator();

    let first = orchestrator.run_cycle(running()).await.unwrap().report;
    assert_eq!(first.verdict, GateVerdict::Pass);
    let advanced_to = now - chrono::Duration::minutes(39);
    assert_eq!(first.checkpoint_after.timestamp, advanced_to);

    let second = orchestrator.run_cycle(running()).await.unwrap().report;
    assert_eq!(second.verdict, GateVerdict::Fail);
    assert!((second.integrity_ratio - 5.0 / 17.0).abs() < 1e-9);
    assert_eq!(second.checkpoint_after.timestamp, advanced_to);
    assert!(!second.checkpoint_after.integrity_passed);

    let third = orchestrator.run_cycle(running()).await.unwrap().report;
    assert_eq!(third.verdict, GateVerdict::Pass);
    assert_eq!(third.integrity_ratio, 0.0);
    assert_eq!(
        third.checkpoint_after.timestamp,
        now - chrono::Duration::minutes(29)
    );

    // The window after a failed cycle is fetched again.
    let since: Vec<DateTime<Utc>> = h.incremental.requested_since();
    assert_eq!(since, vec![DateTime::<Utc>::UNIX_EPOCH, advanced_to, advanced_to]);

    let history = h.store.contents().await.checkpoint_history;
    assert_eq!(history.len(), 3);
    for pair in history.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reaching_the_ceiling_delegates_to_full_resync() {
    let now = secs(Utc::now());
    let mut h = Harness::new(vec![document(&(1..=3)
        .map(|id| note_xml(id, now - chrono::Duration::minutes(5), 1))
        .collect::<Vec<_>>())]);
    h.config.incremental_ceiling = 3;
    let snapshot = document(&(1..=5)
        .map(|id| note_xml(id, now - chrono::Duration::hours(3), 1))
        .collect::<Vec<_>>());
    h.snapshot.replace(snapshot.clone());

    let report = h.orchestrator().run_cycle(running()).await.unwrap().report;

    assert_eq!(report.mode, CycleMode::FullResync);
    assert!(report.states.contains(&CycleState::DelegatingFullResync));
    assert!(!report.states.contains(&CycleState::ProcessingIncremental));
    assert_eq!(report.record_markers, 3);
    assert_eq!(report.fetched_bytes, snapshot.len());
    assert_eq!(report.inserted_records, 5);
    assert_eq!(report.verdict, GateVerdict::Pass);

    let artifact = report.snapshot_artifact.expect("snapshot retained");
    assert!(h.config.artifacts_dir.join(&artifact).exists());
    assert_eq!(h.store.contents().await.records.len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn held_lock_means_contention_and_no_side_effects() {
    let now = secs(Utc::now());
    let h = Harness::new(vec![document(&[note_xml(1, now, 1)])]);
    let other = LeaseLock::new(h.config.lock_path(), Duration::from_secs(600), "other");
    let _held = other.try_acquire().unwrap();

    let err = h.orchestrator().run_cycle(running()).await.unwrap_err();
    assert!(matches!(err, SyncError::LockContention { .. }), "{err}");
    assert_eq!(err.exit_code(), 3);

    assert!(h.incremental.requested_since().is_empty());
    assert_eq!(h.store.contents().await, Default::default());
    assert!(!h.config.marker_path().exists());
    assert!(!h.config.reports_dir.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_invocations_run_exactly_one_cycle() {
    let now = secs(Utc::now());
    let h = Harness::new(vec![document(&(1..=20)
        .map(|id| note_xml(id, now, 1))
        .collect::<Vec<_>>())]);
    let a = h.orchestrator();
    let b = h.orchestrator();

    let (ra, rb) = tokio::join!(a.run_cycle(running()), b.run_cycle(running()));
    let results = [ra, rb];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let contended = results
        .iter()
        .filter(|r| matches!(r, Err(SyncError::LockContention { .. })))
        .count();
    assert_eq!((ok, contended), (1, 1));
    assert_eq!(h.incremental.requested_since().len(), 1);
    assert!(LeaseLock::read_owner(&h.config.lock_path()).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_marker_blocks_cycles_until_cleared() {
    let now = secs(Utc::now());
    let h = Harness::new(vec![document(&[note_xml(1, now, 1)])]);
    let marker = FailedMarkerFile::new(h.config.marker_path());
    marker
        .write(&FailedMarker::new(Uuid::new_v4(), "commit", "connection reset"))
        .unwrap();

    let err = h.orchestrator().run_cycle(running()).await.unwrap_err();
    assert!(matches!(err, SyncError::FailedMarkerPresent { .. }));
    assert_eq!(err.exit_code(), 4);
    assert!(h.incremental.requested_since().is_empty());

    marker.clear().unwrap();
    h.orchestrator().run_cycle(running()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fatal_stage_error_writes_marker_alerts_and_releases_lock() {
    let now = secs(Utc::now());
    let mut bad = document(&[note_xml(1, now, 1)]);
    bad.extend_from_slice(b"<note id=\"not-a-number\" lat=\"0\" lon=\"0\" created_at=\"2026-01-01T00:00:00Z\"></note>\n");
    let h = Harness::new(vec![bad]);
    let sink = Arc::new(RecordingSink::default());
    let orchestrator = h.orchestrator().with_alerts(sink.clone());

    let err = orchestrator.run_cycle(running()).await.unwrap_err();
    assert!(matches!(err, SyncError::Stage { .. }), "{err}");
    assert_eq!(err.exit_code(), 4);

    let marker = orchestrator.marker().read().unwrap().expect("marker written");
    assert_eq!(marker.stage, "transform");
    let alerts = sink.alerts.lock().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].cycle_id, marker.cycle_id);

    assert_eq!(h.store.checkpoint().await.unwrap(), SyncCheckpoint::initial());
    assert!(LeaseLock::read_owner(&h.config.lock_path()).unwrap().is_none());

    let again = orchestrator.run_cycle(running()).await.unwrap_err();
    assert!(matches!(again, SyncError::FailedMarkerPresent { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_signal_ends_the_loop_without_a_marker() {
    let now = secs(Utc::now());
    let h = Harness::new(vec![document(&[note_xml(1, now, 1)])]);
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    h.orchestrator().run_loop(false, rx).await.unwrap();
    assert!(!h.config.marker_path().exists());
    assert!(LeaseLock::read_owner(&h.config.lock_path()).unwrap().is_none());
    assert_eq!(h.store.checkpoint().await.unwrap(), SyncCheckpoint::initial());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn once_runs_a_single_cycle() {
    let now = secs(Utc::now());
    let h = Harness::new(vec![document(&[note_xml(1, now, 1)])]);
    h.orchestrator().run_loop(true, running()).await.unwrap();
    assert_eq!(h.incremental.requested_since().len(), 1);
    assert_eq!(h.store.contents().await.records.len(), 1);
}
