//! The sync cycle state machine and its cadence loop.
//!
//! One cycle: refuse while a failed marker exists, take the singleton lock,
//! fetch changes since the checkpoint, fall back to the full snapshot when
//! the incremental result reaches the ceiling, then transform and commit.
//! A fatal stage error writes the failed marker and raises an alert.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use notesync_adapters::{ExtractTransform, IncrementalSource, NoteXmlTransform, SnapshotSource};
use notesync_core::{NoRegionLookup, RegionLookup};
use notesync_storage::{ArtifactStore, LeaseLock, NoteStore};
use tokio::sync::watch;
use tracing::{error, field, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::alert::{Alert, AlertSink, LogAlertSink};
use crate::config::SyncConfig;
use crate::loader::Loader;
use crate::marker::{FailedMarker, FailedMarkerFile};
use crate::partition::count_records;
use crate::report::{write_cycle_report, CycleMode, CycleReport, CycleState};
use crate::transform::{transform_document, ParallelTransformError};
use crate::{CycleStage, SyncError};

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub report: CycleReport,
    pub report_path: Option<PathBuf>,
}

/// Time left of `cadence` after a cycle that took `elapsed`.
pub fn adaptive_sleep(cadence: Duration, elapsed: Duration) -> Duration {
    cadence.saturating_sub(elapsed)
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    store: Arc<dyn NoteStore>,
    incremental: Arc<dyn IncrementalSource>,
    snapshot: Arc<dyn SnapshotSource>,
    transform: Arc<dyn ExtractTransform>,
    regions: Arc<dyn RegionLookup>,
    alerts: Arc<dyn AlertSink>,
    artifacts: ArtifactStore,
    marker: FailedMarkerFile,
    lock: LeaseLock,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn NoteStore>,
        incremental: Arc<dyn IncrementalSource>,
        snapshot: Arc<dyn SnapshotSource>,
    ) -> Self {
        let artifacts = ArtifactStore::new(config.artifacts_dir.clone());
        let marker = FailedMarkerFile::new(config.marker_path());
        let lock = LeaseLock::new(config.lock_path(), config.lock_stale_after(), "sync");
        Self {
            config,
            store,
            incremental,
            snapshot,
            transform: Arc::new(NoteXmlTransform),
            regions: Arc::new(NoRegionLookup),
            alerts: Arc::new(LogAlertSink),
            artifacts,
            marker,
            lock,
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn ExtractTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_regions(mut self, regions: Arc<dyn RegionLookup>) -> Self {
        self.regions = regions;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn marker(&self) -> &FailedMarkerFile {
        &self.marker
    }

    /// Runs one cycle. Contention and a present marker return before anything
    /// is read or written.
    pub async fn run_cycle(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<CycleOutcome, SyncError> {
        if let Some(marker) = self.marker.read()? {
            return Err(SyncError::FailedMarkerPresent {
                path: self.marker.path().to_path_buf(),
                marker,
            });
        }
        let guard = self.lock.try_acquire()?;

        let cycle_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %cycle_id, mode = field::Empty);
        let result = self.cycle(cycle_id, shutdown).instrument(span).await;
        let result = match result {
            Err(SyncError::Stage { stage, source }) => {
                self.halt(cycle_id, stage, &source).await;
                Err(SyncError::Stage { stage, source })
            }
            other => other,
        };
        drop(guard);
        result
    }

    async fn cycle(
        &self,
        cycle_id: Uuid,
        shutdown: watch::Receiver<bool>,
    ) -> Result<CycleOutcome, SyncError> {
        let started_at = Utc::now();
        let mut states = vec![CycleState::Idle, CycleState::FetchingIncremental];

        let before = self
            .store
            .checkpoint()
            .await
            .map_err(|e| SyncError::stage(CycleStage::Checkpoint, e))?;
        if *shutdown.borrow() {
            return Err(SyncError::Cancelled);
        }

        let incremental = self
            .incremental
            .fetch_since(before.timestamp)
            .await
            .map_err(|e| SyncError::stage(CycleStage::FetchIncremental, e))?;
        let record_markers = count_records(&incremental, self.transform.record_marker());
        let ceiling = self.config.incremental_ceiling;

        let (mode, doc, snapshot_artifact) = if record_markers >= ceiling {
            states.push(CycleState::DelegatingFullResync);
            Span::current().record("mode", CycleMode::FullResync.as_str());
            warn!(
                records = record_markers,
                ceiling, "incremental result reached the ceiling, running full resync"
            );
            drop(incremental);
            let snapshot = self
                .snapshot
                .fetch_snapshot()
                .await
                .map_err(|e| SyncError::stage(CycleStage::FetchSnapshot, e))?;
            let stored = self
                .artifacts
                .store_bytes(started_at, "snapshots", "xml", &snapshot)
                .await
                .map_err(|e| SyncError::stage(CycleStage::FetchSnapshot, e))?;
            (
                CycleMode::FullResync,
                snapshot,
                Some(stored.relative_path.display().to_string()),
            )
        } else {
            states.push(CycleState::ProcessingIncremental);
            Span::current().record("mode", CycleMode::Incremental.as_str());
            (CycleMode::Incremental, incremental, None)
        };
        let fetched_bytes = doc.len();
        info!(bytes = fetched_bytes, records = record_markers, "fetched");

        let (worker_plan, output) = transform_document(
            Arc::new(doc),
            Arc::clone(&self.transform),
            &self.config.transform,
            self.config.partition_search_window_bytes,
            shutdown,
        )
        .await
        .map_err(|e| match e {
            ParallelTransformError::Cancelled { .. } => SyncError::Cancelled,
            other => SyncError::stage(CycleStage::Transform, other),
        })?;

        states.push(CycleState::Committing);
        let loader = Loader::new(
            Arc::clone(&self.store),
            self.config.gate(),
            self.config.integrity_window(),
            Arc::clone(&self.regions),
        );
        let outcome = loader
            .load(cycle_id, started_at, &output.batch)
            .await
            .map_err(|e| SyncError::stage(CycleStage::Commit, e))?;
        states.push(CycleState::Idle);

        let decision = &outcome.commit.decision;
        let report = CycleReport {
            cycle_id,
            mode,
            states,
            started_at,
            finished_at: Utc::now(),
            fetched_bytes,
            record_markers,
            snapshot_artifact,
            worker_plan,
            partitions: output.partitions,
            inserted_records: outcome.inserted,
            updated_records: outcome.updated,
            inserted_annotations: outcome.commit.inserted_annotations,
            orphan_annotations: outcome.commit.orphan_annotations,
            regions_resolved: outcome.commit.regions_resolved,
            integrity_ratio: outcome.integrity_ratio,
            verdict: decision.verdict,
            permissive: decision.permissive,
            gap_id: decision.gap.as_ref().map(|g| g.id),
            checkpoint_before: before,
            checkpoint_after: decision.checkpoint,
        };

        // The commit is durable at this point; a missing report is not a halt.
        let report_path = match write_cycle_report(&self.config.reports_dir, &report).await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to write cycle report");
                None
            }
        };

        info!(
            inserted = report.inserted_records,
            updated = report.updated_records,
            ratio = report.integrity_ratio,
            verdict = ?report.verdict,
            checkpoint = %report.checkpoint_after.timestamp,
            "cycle committed"
        );
        Ok(CycleOutcome { report, report_path })
    }

    async fn halt(&self, cycle_id: Uuid, stage: CycleStage, source: &anyhow::Error) {
        let cause = format!("{source:#}");
        error!(%cycle_id, %stage, %cause, "cycle failed, writing failed marker");
        let marker = FailedMarker::new(cycle_id, stage.as_str(), cause.clone());
        if let Err(err) = self.marker.write(&marker) {
            error!(
                error = %err,
                path = %self.marker.path().display(),
                "failed to write failed marker"
            );
        }
        let alert = Alert {
            subject: format!("notesync cycle halted at {stage}"),
            cycle_id,
            stage: stage.as_str().to_string(),
            cause,
            raised_at: Utc::now(),
        };
        if let Err(err) = self.alerts.notify(&alert).await {
            warn!(error = %format!("{err:#}"), "alert delivery failed");
        }
    }

    /// Runs cycles at the configured cadence until shutdown, an error, or
    /// after one cycle when `once` is set.
    pub async fn run_loop(
        &self,
        once: bool,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        loop {
            let began = Instant::now();
            match self.run_cycle(shutdown.clone()).await {
                Ok(_) => {}
                Err(SyncError::Cancelled) => {
                    info!("shutdown requested, leaving sync loop");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
            if once || *shutdown.borrow() {
                return Ok(());
            }

            let pause = adaptive_sleep(self.config.cadence(), began.elapsed());
            if pause.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => {
                            info!("shutdown requested, leaving sync loop");
                            return Ok(());
                        }
                        Ok(()) => {}
                        // Nobody can signal any more; finish the pause.
                        Err(_) => tokio::time::sleep(pause).await,
                    }
                }
            }
        }
    }
}
