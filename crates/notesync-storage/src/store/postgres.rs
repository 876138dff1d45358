//! Postgres backend. Staging tables are truncated, never recreated, and are
//! only touched by the holder of the singleton lease.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notesync_core::{
    Annotation, GapKind, GapRecord, IntegrityReport, Record, RegionLookup, SyncCheckpoint,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};

use super::{
    batch_activity, dedup_batch, CommitReport, CommitRequest, NoteStore, ReconcileReport,
    ReconcileRequest, StoreError, MAX_GAP_IDS,
};

// Postgres caps a statement at 65535 bind parameters.
const RECORD_CHUNK: usize = 8_000;
const ANNOTATION_CHUNK: usize = 8_000;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

async fn stage_records(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    records: &[&Record],
    activity: &HashMap<i64, DateTime<Utc>>,
) -> Result<(), StoreError> {
    for chunk in records.chunks(RECORD_CHUNK) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {table} \
             (id, lat, lon, created_at, closed_at, status, region_id, activity_at) "
        ));
        qb.push_values(chunk, |mut row, record| {
            row.push_bind(record.id)
                .push_bind(record.lat)
                .push_bind(record.lon)
                .push_bind(record.created_at)
                .push_bind(record.closed_at)
                .push_bind(record.status.as_str())
                .push_bind(record.region_id)
                .push_bind(activity.get(&record.id).copied());
        });
        qb.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn stage_annotations(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    annotations: &[&Annotation],
) -> Result<(), StoreError> {
    for chunk in annotations.chunks(ANNOTATION_CHUNK) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {table} (note_id, sequence, action, created_at, actor_id, actor_name, body) "
        ));
        qb.push_values(chunk, |mut row, annotation| {
            row.push_bind(annotation.record_id)
                .push_bind(annotation.sequence)
                .push_bind(annotation.kind.as_str())
                .push_bind(annotation.at)
                .push_bind(annotation.actor_id)
                .push_bind(annotation.actor_name.as_deref())
                .push_bind(annotation.body.as_deref());
        });
        qb.build().execute(&mut **tx).await?;
    }
    Ok(())
}

/// Resolves regions for staged rows that have none, returning `(id, region)`
/// pairs. `missing_sql` selects `id, lat, lon` of the candidates.
async fn resolve_regions(
    tx: &mut Transaction<'_, Postgres>,
    missing_sql: &str,
    cutoff: Option<DateTime<Utc>>,
    regions: &dyn RegionLookup,
) -> Result<(Vec<i64>, Vec<i64>), StoreError> {
    let mut query = sqlx::query(missing_sql);
    if let Some(cutoff) = cutoff {
        query = query.bind(cutoff);
    }
    let rows = query.fetch_all(&mut **tx).await?;
    let mut ids = Vec::new();
    let mut region_ids = Vec::new();
    for row in rows {
        let id: i64 = row.try_get("id")?;
        let lat: f64 = row.try_get("lat")?;
        let lon: f64 = row.try_get("lon")?;
        if let Some(region) = regions.region_of(lat, lon) {
            ids.push(id);
            region_ids.push(region);
        }
    }
    Ok((ids, region_ids))
}

async fn read_checkpoint(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<SyncCheckpoint, StoreError> {
    let row = sqlx::query(
        "SELECT timestamp, integrity_passed, updated_at FROM sync_checkpoint WHERE id = 1 FOR UPDATE",
    )
    .fetch_optional(&mut **tx)
    .await?;
    match row {
        Some(row) => Ok(SyncCheckpoint {
            timestamp: row.try_get("timestamp")?,
            integrity_passed: row.try_get("integrity_passed")?,
            updated_at: row.try_get("updated_at")?,
        }),
        None => Ok(SyncCheckpoint::initial()),
    }
}

async fn integrity_report(
    tx: &mut Transaction<'_, Postgres>,
    window_start: DateTime<Utc>,
) -> Result<IntegrityReport, StoreError> {
    let counts = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS recent,
            COUNT(*) FILTER (
                WHERE NOT EXISTS (SELECT 1 FROM note_comments c WHERE c.note_id = n.id)
            ) AS missing
        FROM notes n
        WHERE n.created_at >= $1 AND n.status <> 'hidden'
        "#,
    )
    .bind(window_start)
    .fetch_one(&mut **tx)
    .await?;
    let recent: i64 = counts.try_get("recent")?;
    let missing: i64 = counts.try_get("missing")?;

    let affected_ids: Vec<i64> = if missing > 0 {
        sqlx::query_scalar(
            r#"
            SELECT n.id FROM notes n
            WHERE n.created_at >= $1 AND n.status <> 'hidden'
              AND NOT EXISTS (SELECT 1 FROM note_comments c WHERE c.note_id = n.id)
            ORDER BY n.id
            LIMIT $2
            "#,
        )
        .bind(window_start)
        .bind(MAX_GAP_IDS as i64)
        .fetch_all(&mut **tx)
        .await?
    } else {
        Vec::new()
    };

    let store_annotations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM note_comments")
        .fetch_one(&mut **tx)
        .await?;

    Ok(IntegrityReport {
        window_start,
        recent_records: recent as u64,
        recent_without_annotations: missing as u64,
        affected_ids,
        store_annotations: store_annotations as u64,
    })
}

async fn insert_gap(tx: &mut Transaction<'_, Postgres>, gap: &GapRecord) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO data_gaps
            (id, cycle_id, kind, affected_count, total_count, percentage, affected_ids, processed, detected_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(gap.id)
    .bind(gap.cycle_id)
    .bind(gap.kind.as_str())
    .bind(gap.affected_count as i64)
    .bind(gap.total_count as i64)
    .bind(gap.percentage)
    .bind(&gap.affected_ids)
    .bind(gap.processed)
    .bind(gap.detected_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl NoteStore for PgStore {
    async fn checkpoint(&self) -> Result<SyncCheckpoint, StoreError> {
        let row = sqlx::query(
            "SELECT timestamp, integrity_passed, updated_at FROM sync_checkpoint WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(SyncCheckpoint {
                timestamp: row.try_get("timestamp")?,
                integrity_passed: row.try_get("integrity_passed")?,
                updated_at: row.try_get("updated_at")?,
            }),
            None => Ok(SyncCheckpoint::initial()),
        }
    }

    async fn commit_cycle(&self, request: CommitRequest<'_>) -> Result<CommitReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let previous = read_checkpoint(&mut tx).await?;

        sqlx::query("TRUNCATE staging_notes, staging_note_comments")
            .execute(&mut *tx)
            .await?;
        let (records, annotations) = dedup_batch(request.batch);
        let activity = batch_activity(&records, &annotations);
        stage_records(&mut tx, "staging_notes", &records, &activity).await?;
        stage_annotations(&mut tx, "staging_note_comments", &annotations).await?;
        debug!(
            cycle_id = %request.cycle_id,
            records = records.len(),
            annotations = annotations.len(),
            "staged batch"
        );

        let (ids, region_ids) = resolve_regions(
            &mut tx,
            r#"
            SELECT s.id, s.lat, s.lon FROM staging_notes s
            WHERE s.region_id IS NULL
              AND NOT EXISTS (SELECT 1 FROM notes n WHERE n.id = s.id)
            "#,
            None,
            request.regions,
        )
        .await?;
        let regions_resolved = ids.len() as u64;
        if !ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE staging_notes s SET region_id = r.region_id
                FROM UNNEST($1::bigint[], $2::bigint[]) AS r(id, region_id)
                WHERE s.id = r.id
                "#,
            )
            .bind(&ids)
            .bind(&region_ids)
            .execute(&mut *tx)
            .await?;
        }

        // Rows older than what is stored keep the stored status and closure.
        let stale = sqlx::query(
            r#"
            UPDATE staging_notes s SET status = n.status, closed_at = n.closed_at
            FROM notes n
            WHERE n.id = s.id
              AND s.activity_at < GREATEST(
                  n.created_at,
                  n.closed_at,
                  (SELECT MAX(c.created_at) FROM note_comments c WHERE c.note_id = n.id)
              )
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if stale > 0 {
            debug!(cycle_id = %request.cycle_id, stale, "kept newer stored state");
        }

        let merged: Vec<bool> = sqlx::query_scalar(
            r#"
            INSERT INTO notes (id, lat, lon, created_at, closed_at, status, region_id)
            SELECT id, lat, lon, created_at, closed_at, status, region_id FROM staging_notes
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                closed_at = EXCLUDED.closed_at,
                region_id = COALESCE(EXCLUDED.region_id, notes.region_id)
            WHERE notes.status IS DISTINCT FROM EXCLUDED.status
               OR notes.closed_at IS DISTINCT FROM EXCLUDED.closed_at
               OR (EXCLUDED.region_id IS NOT NULL AND notes.region_id IS DISTINCT FROM EXCLUDED.region_id)
            RETURNING (xmax = 0)
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;
        let inserted_records = merged.iter().filter(|inserted| **inserted).count() as u64;
        let updated_records = merged.len() as u64 - inserted_records;

        let orphan_annotations: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM staging_note_comments c
            WHERE NOT EXISTS (SELECT 1 FROM notes n WHERE n.id = c.note_id)
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        let inserted_annotations = sqlx::query(
            r#"
            INSERT INTO note_comments (note_id, sequence, action, created_at, actor_id, actor_name, body)
            SELECT c.note_id, c.sequence, c.action, c.created_at, c.actor_id, c.actor_name, c.body
            FROM staging_note_comments c
            WHERE EXISTS (SELECT 1 FROM notes n WHERE n.id = c.note_id)
            ON CONFLICT (note_id, sequence) DO NOTHING
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let integrity = integrity_report(&mut tx, request.window_start()).await?;
        let decision = request.gate.decide(
            &integrity,
            &previous,
            request.batch.newest_timestamp(),
            request.cycle_id,
            Utc::now(),
        );
        if decision.checkpoint.timestamp < previous.timestamp {
            return Err(StoreError::Invariant(format!(
                "checkpoint would regress from {} to {}",
                previous.timestamp, decision.checkpoint.timestamp
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO sync_checkpoint (id, timestamp, integrity_passed, updated_at)
            VALUES (1, $1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                timestamp = GREATEST(sync_checkpoint.timestamp, EXCLUDED.timestamp),
                integrity_passed = EXCLUDED.integrity_passed,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(decision.checkpoint.timestamp)
        .bind(decision.checkpoint.integrity_passed)
        .bind(decision.checkpoint.updated_at)
        .execute(&mut *tx)
        .await?;
        if let Some(gap) = &decision.gap {
            insert_gap(&mut tx, gap).await?;
        }

        tx.commit().await?;
        info!(
            cycle_id = %request.cycle_id,
            inserted_records,
            updated_records,
            inserted_annotations,
            verdict = ?decision.verdict,
            "cycle committed"
        );

        Ok(CommitReport {
            inserted_records,
            updated_records,
            inserted_annotations,
            orphan_annotations: orphan_annotations as u64,
            regions_resolved,
            integrity,
            decision,
        })
    }

    async fn reconcile(
        &self,
        request: ReconcileRequest<'_>,
    ) -> Result<ReconcileReport, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("TRUNCATE snapshot_notes, snapshot_note_comments")
            .execute(&mut *tx)
            .await?;
        let (records, annotations) = dedup_batch(request.snapshot);
        let activity = batch_activity(&records, &annotations);
        stage_records(&mut tx, "snapshot_notes", &records, &activity).await?;
        stage_annotations(&mut tx, "snapshot_note_comments", &annotations).await?;

        let (ids, region_ids) = resolve_regions(
            &mut tx,
            r#"
            SELECT s.id, s.lat, s.lon FROM snapshot_notes s
            WHERE s.created_at < $1 AND s.region_id IS NULL
              AND NOT EXISTS (SELECT 1 FROM notes n WHERE n.id = s.id)
            "#,
            Some(request.cutoff),
            request.regions,
        )
        .await?;

        let mut inserted_record_ids: Vec<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO notes (id, lat, lon, created_at, closed_at, status, region_id)
            SELECT s.id, s.lat, s.lon, s.created_at, s.closed_at, s.status,
                   COALESCE(s.region_id, r.region_id)
            FROM snapshot_notes s
            LEFT JOIN UNNEST($2::bigint[], $3::bigint[]) AS r(id, region_id) ON r.id = s.id
            WHERE s.created_at < $1
              AND NOT EXISTS (SELECT 1 FROM notes n WHERE n.id = s.id)
            ON CONFLICT (id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(request.cutoff)
        .bind(&ids)
        .bind(&region_ids)
        .fetch_all(&mut *tx)
        .await?;
        inserted_record_ids.sort_unstable();

        let inserted_annotations = sqlx::query(
            r#"
            INSERT INTO note_comments (note_id, sequence, action, created_at, actor_id, actor_name, body)
            SELECT c.note_id, c.sequence, c.action, c.created_at, c.actor_id, c.actor_name, c.body
            FROM snapshot_note_comments c
            JOIN notes n ON n.id = c.note_id
            WHERE n.created_at < $1
            ON CONFLICT (note_id, sequence) DO NOTHING
            "#,
        )
        .bind(request.cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let mut hidden_record_ids: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE notes n SET status = 'hidden'
            WHERE n.created_at < $1 AND n.status <> 'hidden'
              AND NOT EXISTS (SELECT 1 FROM snapshot_notes s WHERE s.id = n.id)
            RETURNING n.id
            "#,
        )
        .bind(request.cutoff)
        .fetch_all(&mut *tx)
        .await?;
        hidden_record_ids.sort_unstable();

        let gaps_processed = sqlx::query(
            r#"
            UPDATE data_gaps g SET processed = TRUE
            WHERE NOT g.processed
              AND NOT EXISTS (
                  SELECT 1 FROM notes n
                  WHERE n.id = ANY (g.affected_ids)
                    AND n.created_at >= $1
                    AND n.status <> 'hidden'
                    AND NOT EXISTS (SELECT 1 FROM note_comments c WHERE c.note_id = n.id)
              )
            "#,
        )
        .bind(request.cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        info!(
            run_id = %request.run_id,
            inserted = inserted_record_ids.len(),
            inserted_annotations,
            hidden = hidden_record_ids.len(),
            gaps_processed,
            "reconcile committed"
        );

        Ok(ReconcileReport {
            inserted_record_ids,
            inserted_annotations,
            hidden_record_ids,
            gaps_processed,
        })
    }

    async fn unprocessed_gaps(&self) -> Result<Vec<GapRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, cycle_id, kind, affected_count, total_count, percentage, affected_ids, processed, detected_at
            FROM data_gaps
            WHERE NOT processed
            ORDER BY detected_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<GapRecord, StoreError> {
                let kind: String = row.try_get("kind")?;
                let kind: GapKind = kind.parse().map_err(|err: notesync_core::UnknownVariant| {
                    StoreError::Invariant(err.to_string())
                })?;
                let affected_count: i64 = row.try_get("affected_count")?;
                let total_count: i64 = row.try_get("total_count")?;
                Ok(GapRecord {
                    id: row.try_get("id")?,
                    cycle_id: row.try_get("cycle_id")?,
                    kind,
                    affected_count: affected_count as u64,
                    total_count: total_count as u64,
                    percentage: row.try_get("percentage")?,
                    affected_ids: row.try_get("affected_ids")?,
                    processed: row.try_get("processed")?,
                    detected_at: row.try_get("detected_at")?,
                })
            })
            .collect()
    }
}
