//! Bounded worker pool running the extraction transform over partitions.
//!
//! Workers pull partitions from one shared queue, so a worker that drew
//! cheap partitions keeps taking more. Each transform runs on the blocking
//! pool. A shutdown signal stops workers from taking new partitions while
//! in-flight ones finish.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use notesync_adapters::{ExtractTransform, TransformError};
use notesync_core::{BatchSummary, RowBatch};
use serde::Serialize;
use sysinfo::System;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::TransformSettings;
use crate::partition::{Partition, Partitioner};

#[derive(Debug, Error)]
pub enum ParallelTransformError {
    #[error("partition {index} [{start}, {end}) failed: {source}")]
    Partition {
        index: usize,
        start: usize,
        end: usize,
        #[source]
        source: TransformError,
    },
    #[error("shutdown requested with {remaining} partitions not started")]
    Cancelled { remaining: usize },
    #[error("transform worker panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Pool sizing decided before a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerPlan {
    pub workers: usize,
    pub degraded: bool,
    pub available_memory_mb: Option<u64>,
}

impl WorkerPlan {
    pub fn serial() -> Self {
        Self {
            workers: 1,
            degraded: false,
            available_memory_mb: None,
        }
    }
}

/// `available cores - reserve`, at least one; collapses to one worker when
/// available memory is under the configured floor.
pub fn plan_workers(settings: &TransformSettings) -> WorkerPlan {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let mut system = System::new();
    system.refresh_memory();
    let available_mb = system.available_memory() / (1024 * 1024);
    plan_for(settings, cores, Some(available_mb))
}

fn plan_for(
    settings: &TransformSettings,
    cores: usize,
    available_memory_mb: Option<u64>,
) -> WorkerPlan {
    let mut workers = cores.saturating_sub(settings.reserve_cores).max(1);
    if let Some(cap) = settings.max_workers {
        workers = workers.min(cap.max(1));
    }
    let low_memory = matches!(
        available_memory_mb,
        Some(mb) if mb > 0 && mb < settings.min_available_memory_mb
    );
    if low_memory && workers > 1 {
        warn!(
            available_mb = available_memory_mb,
            floor_mb = settings.min_available_memory_mb,
            "low memory, running transform serially"
        );
        return WorkerPlan {
            workers: 1,
            degraded: true,
            available_memory_mb,
        };
    }
    WorkerPlan {
        workers,
        degraded: false,
        available_memory_mb,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionSummary {
    pub index: usize,
    pub bytes: usize,
    pub rows: BatchSummary,
}

#[derive(Debug, Default)]
pub struct TransformOutput {
    pub batch: RowBatch,
    pub partitions: Vec<PartitionSummary>,
}

pub struct ParallelTransformer {
    transform: Arc<dyn ExtractTransform>,
    workers: usize,
}

type Queue = Arc<Mutex<VecDeque<Partition>>>;
type WorkerResult = Result<(Partition, RowBatch), ParallelTransformError>;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ParallelTransformer {
    pub fn new(transform: Arc<dyn ExtractTransform>, workers: usize) -> Self {
        Self {
            transform,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Batches are concatenated in partition order.
    pub async fn run(
        &self,
        doc: Arc<Vec<u8>>,
        partitions: Vec<Partition>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<TransformOutput, ParallelTransformError> {
        let total = partitions.len();
        let queue: Queue = Arc::new(Mutex::new(partitions.into_iter().collect()));
        let pool = self.workers.min(total.max(1));

        let mut workers = JoinSet::new();
        for worker in 0..pool {
            let queue = Arc::clone(&queue);
            let doc = Arc::clone(&doc);
            let transform = Arc::clone(&self.transform);
            let shutdown = shutdown.clone();
            workers.spawn(async move { work(worker, queue, doc, transform, shutdown).await });
        }

        let mut done: Vec<(Partition, RowBatch)> = Vec::with_capacity(total);
        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let results = match joined {
                Ok(results) => results,
                Err(err) => {
                    first_error.get_or_insert(ParallelTransformError::Join(err));
                    continue;
                }
            };
            for result in results {
                match result {
                    Ok(item) => done.push(item),
                    Err(err) => {
                        // Drain so the remaining workers stop early.
                        lock(&queue).clear();
                        first_error.get_or_insert(err);
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let remaining = lock(&queue).len();
        if remaining > 0 || done.len() < total {
            return Err(ParallelTransformError::Cancelled {
                remaining: total - done.len(),
            });
        }

        done.sort_by_key(|(p, _)| p.index);
        let mut output = TransformOutput::default();
        for (partition, batch) in done {
            output.partitions.push(PartitionSummary {
                index: partition.index,
                bytes: partition.len(),
                rows: batch.summary(),
            });
            output.batch.extend(batch);
        }
        info!(
            partitions = total,
            workers = pool,
            records = output.batch.records.len(),
            annotations = output.batch.annotations.len(),
            "transform finished"
        );
        Ok(output)
    }
}

/// Sizes the pool for this host, splits `doc` at `partitions_per_worker`
/// partitions per worker and transforms every partition.
pub async fn transform_document(
    doc: Arc<Vec<u8>>,
    transform: Arc<dyn ExtractTransform>,
    settings: &TransformSettings,
    search_window: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<(WorkerPlan, TransformOutput), ParallelTransformError> {
    let plan = plan_workers(settings);
    let target = plan.workers * settings.partitions_per_worker.max(1);
    let partitions =
        Partitioner::new(search_window).split(
            &doc,
            target,
            transform.record_marker(),
            plan.workers,
        );
    debug!(
        bytes = doc.len(),
        target,
        partitions = partitions.len(),
        workers = plan.workers,
        "document partitioned"
    );
    let output = ParallelTransformer::new(transform, plan.workers)
        .run(doc, partitions, shutdown)
        .await?;
    Ok((plan, output))
}

async fn work(
    worker: usize,
    queue: Queue,
    doc: Arc<Vec<u8>>,
    transform: Arc<dyn ExtractTransform>,
    shutdown: watch::Receiver<bool>,
) -> Vec<WorkerResult> {
    let mut results = Vec::new();
    loop {
        if *shutdown.borrow() {
            debug!(worker, "shutdown requested, not taking more partitions");
            break;
        }
        let Some(partition) = lock(&queue).pop_front() else {
            break;
        };

        let doc = Arc::clone(&doc);
        let transform = Arc::clone(&transform);
        let outcome = tokio::task::spawn_blocking(move || {
            transform.transform(&doc[partition.range()])
        })
        .await;

        match outcome {
            Ok(Ok(batch)) => {
                debug!(
                    worker,
                    partition = partition.index,
                    records = batch.records.len(),
                    "partition transformed"
                );
                results.push(Ok((partition, batch)));
            }
            Ok(Err(source)) => {
                results.push(Err(ParallelTransformError::Partition {
                    index: partition.index,
                    start: partition.start,
                    end: partition.end,
                    source,
                }));
                break;
            }
            Err(join) => {
                results.push(Err(ParallelTransformError::Join(join)));
                break;
            }
        }
    }
    results
}
