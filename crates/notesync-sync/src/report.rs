//! Per-cycle JSON reports and the Parquet exports written by the
//! reconciler.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use notesync_core::{GateVerdict, Record, SyncCheckpoint};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::transform::{PartitionSummary, WorkerPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleMode {
    Incremental,
    FullResync,
}

impl CycleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleMode::Incremental => "incremental",
            CycleMode::FullResync => "full_resync",
        }
    }
}

/// States the orchestrator walks through in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    FetchingIncremental,
    ProcessingIncremental,
    DelegatingFullResync,
    Committing,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub mode: CycleMode,
    pub states: Vec<CycleState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_bytes: usize,
    pub record_markers: usize,
    pub snapshot_artifact: Option<String>,
    pub worker_plan: WorkerPlan,
    pub partitions: Vec<PartitionSummary>,
    pub inserted_records: u64,
    pub updated_records: u64,
    pub inserted_annotations: u64,
    pub orphan_annotations: u64,
    pub regions_resolved: u64,
    pub integrity_ratio: f64,
    pub verdict: GateVerdict,
    pub permissive: bool,
    pub gap_id: Option<Uuid>,
    pub checkpoint_before: SyncCheckpoint,
    pub checkpoint_after: SyncCheckpoint,
}

/// Writes `<reports_dir>/<cycle_id>/cycle.json` and returns its path.
pub async fn write_cycle_report(reports_dir: &Path, report: &CycleReport) -> Result<PathBuf> {
    let dir = reports_dir.join(report.cycle_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("cycle.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing cycle report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Writes `inserted.parquet`, `hidden.parquet` and `manifest.json` into
/// `dir`. `inserted` rows are looked up in `snapshot` by id.
pub fn export_reconcile_parquet(
    dir: &Path,
    run_id: Uuid,
    snapshot: &[Record],
    inserted_ids: &[i64],
    hidden_ids: &[i64],
    hidden_at: DateTime<Utc>,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let by_id: HashMap<i64, &Record> = snapshot.iter().map(|r| (r.id, r)).collect();
    let inserted: Vec<&Record> = inserted_ids
        .iter()
        .filter_map(|id| by_id.get(id).copied())
        .collect();

    let inserted_path = dir.join("inserted.parquet");
    let hidden_path = dir.join("hidden.parquet");
    write_inserted_parquet(&inserted_path, &inserted)?;
    write_hidden_parquet(&hidden_path, hidden_ids, hidden_at)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id,
        files: vec![
            manifest_entry("inserted", dir, &inserted_path, inserted.len())?,
            manifest_entry("hidden", dir, &hidden_path, hidden_ids.len())?,
        ],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_inserted_parquet(path: &Path, records: &[&Record]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("lat", DataType::Float64, false),
        ArrowField::new("lon", DataType::Float64, false),
        ArrowField::new("created_at", DataType::Utf8, false),
        ArrowField::new("closed_at", DataType::Utf8, true),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("region_id", DataType::Int64, true),
    ]));

    let ids = Int64Array::from(records.iter().map(|r| r.id).collect::<Vec<_>>());
    let lats = Float64Array::from(records.iter().map(|r| r.lat).collect::<Vec<_>>());
    let lons = Float64Array::from(records.iter().map(|r| r.lon).collect::<Vec<_>>());
    let created = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.created_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let closed = StringArray::from(
        records
            .iter()
            .map(|r| r.closed_at.map(|t| t.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.status.as_str()))
            .collect::<Vec<_>>(),
    );
    let regions = Int64Array::from(records.iter().map(|r| r.region_id).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(lats),
            Arc::new(lons),
            Arc::new(created),
            Arc::new(closed),
            Arc::new(statuses),
            Arc::new(regions),
        ],
    )
    .context("building inserted records batch")?;
    write_parquet(path, batch)
}

fn write_hidden_parquet(path: &Path, ids: &[i64], hidden_at: DateTime<Utc>) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("hidden_at", DataType::Utf8, false),
    ]));
    let stamp = hidden_at.to_rfc3339();
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(ids.to_vec())),
            Arc::new(StringArray::from(vec![stamp.as_str(); ids.len()])),
        ],
    )
    .context("building hidden records batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}
