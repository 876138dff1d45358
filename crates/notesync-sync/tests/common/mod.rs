#![allow(dead_code)]

use std::path::Path;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use notesync_core::{Annotation, AnnotationKind, NoteStatus, Record, RowBatch};
use notesync_sync::config::TransformSettings;
use notesync_sync::SyncConfig;

/// Whole-second instant, so values survive the XML round trip unchanged.
pub fn secs(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(at.timestamp(), 0).single().unwrap()
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `<note>` element with `comments` comments, the first at `created`, then
/// one minute apart.
pub fn note_xml(id: i64, created: DateTime<Utc>, comments: usize) -> String {
    let mut out = format!(
        "  <note id=\"{id}\" lat=\"48.85\" lon=\"2.35\" created_at=\"{}\" status=\"open\">\n",
        stamp(created)
    );
    for i in 0..comments {
        let action = if i == 0 { "opened" } else { "commented" };
        let at = created + chrono::Duration::minutes(i as i64);
        out.push_str(&format!(
            "    <comment action=\"{action}\" timestamp=\"{}\" uid=\"7\" user=\"mapper\">note {id} #{i}</comment>\n",
            stamp(at)
        ));
    }
    out.push_str("  </note>\n");
    out
}

pub fn document(notes: &[String]) -> Vec<u8> {
    let mut doc = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<osm-notes>\n");
    for note in notes {
        doc.push_str(note);
    }
    doc.push_str("</osm-notes>\n");
    doc.into_bytes()
}

pub fn record(id: i64, created: DateTime<Utc>) -> Record {
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

/// Records `ids`, each with one opening annotation.
pub fn annotated(ids: impl IntoIterator<Item = i64>, created: DateTime<Utc>) -> RowBatch {
    let mut batch = RowBatch::default();
    for id in ids {
        batch.records.push(record(id, created));
        batch.annotations.push(Annotation {
            record_id: id,
            sequence: 1,
            kind: AnnotationKind::Opened,
            at: created,
            actor_id: Some(7),
            actor_name: Some("mapper".into()),
            body: None,
        });
    }
    batch
}

pub fn config(root: &Path) -> SyncConfig {
    SyncConfig {
        state_dir: root.join("state"),
        artifacts_dir: root.join("artifacts"),
        reports_dir: root.join("reports"),
        incremental_ceiling: 1_000,
        partition_search_window_bytes: 4096,
        transform: TransformSettings {
            reserve_cores: 0,
            partitions_per_worker: 2,
            min_available_memory_mb: 0,
            max_workers: Some(2),
        },
        ..SyncConfig::default()
    }
}
