//! Gap reconciler: compares the store with a fresh authoritative snapshot
//! and repairs it. Runs outside the ingestion loop under its own lock.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use notesync_adapters::{ExtractTransform, NoteXmlTransform, SnapshotSource};
use notesync_core::{NoRegionLookup, RegionLookup};
use notesync_storage::{ArtifactStore, LeaseLock, NoteStore, ReconcileReport, ReconcileRequest};
use serde::Serialize;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::{SyncConfig, TransformSettings};
use crate::report::export_reconcile_parquet;
use crate::transform::{transform_document, ParallelTransformError, WorkerPlan};
use crate::{CycleStage, SyncError};

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub snapshot_artifact: PathBuf,
    pub snapshot_deduplicated: bool,
    pub snapshot_records: usize,
    pub worker_plan: WorkerPlan,
    pub report: ReconcileReport,
    pub manifest_path: PathBuf,
}

/// Start of the UTC day containing `at`. Rows created on or after it belong
/// to the ingestion loop.
pub fn day_cutoff(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

pub struct GapReconciler {
    store: Arc<dyn NoteStore>,
    snapshot: Arc<dyn SnapshotSource>,
    transform: Arc<dyn ExtractTransform>,
    regions: Arc<dyn RegionLookup>,
    artifacts: ArtifactStore,
    reports_dir: PathBuf,
    lock: LeaseLock,
    settings: TransformSettings,
    search_window: usize,
}

impl GapReconciler {
    pub fn new(
        config: &SyncConfig,
        store: Arc<dyn NoteStore>,
        snapshot: Arc<dyn SnapshotSource>,
    ) -> Self {
        Self {
            store,
            snapshot,
            transform: Arc::new(NoteXmlTransform),
            regions: Arc::new(NoRegionLookup),
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            reports_dir: config.reports_dir.clone(),
            lock: LeaseLock::new(
                config.reconcile_lock_path(),
                config.lock_stale_after(),
                "reconcile",
            ),
            settings: config.transform.clone(),
            search_window: config.partition_search_window_bytes,
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

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<ReconcileRun, SyncError> {
        self.run_at(Utc::now(), shutdown).await
    }

    /// Runs with the day cut-off taken from `started_at`.
    pub async fn run_at(
        &self,
        started_at: DateTime<Utc>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ReconcileRun, SyncError> {
        let _guard = self.lock.try_acquire()?;
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id);
        self.reconcile(run_id, started_at, shutdown)
            .instrument(span)
            .await
    }

    async fn reconcile(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ReconcileRun, SyncError> {
        let cutoff = day_cutoff(started_at);
        info!(%cutoff, "reconcile started");

        let doc = self
            .snapshot
            .fetch_snapshot()
            .await
            .map_err(|e| SyncError::stage(CycleStage::FetchSnapshot, e))?;
        let stored = self
            .artifacts
            .store_bytes(started_at, "snapshots", "xml", &doc)
            .await
            .map_err(|e| SyncError::stage(CycleStage::FetchSnapshot, e))?;
        info!(
            bytes = stored.byte_size,
            path = %stored.relative_path.display(),
            deduplicated = stored.deduplicated,
            "snapshot stored"
        );

        let (worker_plan, output) = transform_document(
            Arc::new(doc),
            Arc::clone(&self.transform),
            &self.settings,
            self.search_window,
            shutdown,
        )
        .await
        .map_err(|e| match e {
            ParallelTransformError::Cancelled { .. } => SyncError::Cancelled,
            other => SyncError::stage(CycleStage::Transform, other),
        })?;

        let report = self
            .store
            .reconcile(ReconcileRequest {
                run_id,
                cutoff,
                snapshot: &output.batch,
                regions: self.regions.as_ref(),
            })
            .await
            .map_err(|e| SyncError::stage(CycleStage::Reconcile, e))?;

        let finished_at = Utc::now();
        let dir = self.reports_dir.join(format!("reconcile-{run_id}"));
        let manifest_path = export_reconcile_parquet(
            &dir,
            run_id,
            &output.batch.records,
            &report.inserted_record_ids,
            &report.hidden_record_ids,
            finished_at,
        )
        .map_err(|e| SyncError::stage(CycleStage::Reconcile, e))?;

        info!(
            inserted = report.inserted_record_ids.len(),
            inserted_annotations = report.inserted_annotations,
            hidden = report.hidden_record_ids.len(),
            gaps_processed = report.gaps_processed,
            "reconcile finished"
        );

        Ok(ReconcileRun {
            run_id,
            started_at,
            finished_at,
            cutoff,
            snapshot_artifact: stored.relative_path,
            snapshot_deduplicated: stored.deduplicated,
            snapshot_records: output.batch.records.len(),
            worker_plan,
            report,
            manifest_path,
        })
    }
}

/// Scheduler running `reconciler` on `cron`. The caller starts it.
pub async fn build_scheduler(
    cron: &str,
    reconciler: Arc<GapReconciler>,
    shutdown: watch::Receiver<bool>,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let reconciler = Arc::clone(&reconciler);
        let shutdown = shutdown.clone();
        Box::pin(async move {
            match reconciler.run(shutdown).await {
                Ok(run) => info!(
                    run_id = %run.run_id,
                    writes = run.report.writes(),
                    "scheduled reconcile done"
                ),
                Err(SyncError::LockContention { .. }) => {
                    info!("previous reconcile still running, skipping this slot")
                }
                Err(err) => error!(error = %err, "scheduled reconcile failed"),
            }
        })
    })
    .with_context(|| format!("creating reconcile job for cron {cron}"))?;
    sched.add(job).await.context("adding reconcile job")?;
    Ok(sched)
}
