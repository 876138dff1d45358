//! Core data model for the notes synchronization engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod gate;

pub use gate::{GateDecision, GateVerdict, IntegrityGate, IntegrityReport};

pub const CRATE_NAME: &str = "notesync-core";

/// Lifecycle state of a feed record. `Hidden` is only ever assigned locally,
/// when the authoritative snapshot no longer carries the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    Open,
    Closed,
    Reopened,
    Hidden,
}

impl NoteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NoteStatus::Open => "open",
            NoteStatus::Closed => "closed",
            NoteStatus::Reopened => "reopened",
            NoteStatus::Hidden => "hidden",
        }
    }
}

impl fmt::Display for NoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} `{}`", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for NoteStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(NoteStatus::Open),
            "closed" | "close" => Ok(NoteStatus::Closed),
            "reopened" | "reopen" => Ok(NoteStatus::Reopened),
            "hidden" | "hide" => Ok(NoteStatus::Hidden),
            other => Err(UnknownVariant {
                kind: "note status",
                value: other.to_string(),
            }),
        }
    }
}

/// Event type of an annotation attached to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Opened,
    Commented,
    Closed,
    Reopened,
    Hidden,
}

impl AnnotationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnnotationKind::Opened => "opened",
            AnnotationKind::Commented => "commented",
            AnnotationKind::Closed => "closed",
            AnnotationKind::Reopened => "reopened",
            AnnotationKind::Hidden => "hidden",
        }
    }
}

impl FromStr for AnnotationKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "opened" | "open" => Ok(AnnotationKind::Opened),
            "commented" | "comment" => Ok(AnnotationKind::Commented),
            "closed" | "close" => Ok(AnnotationKind::Closed),
            "reopened" | "reopen" => Ok(AnnotationKind::Reopened),
            "hidden" | "hide" => Ok(AnnotationKind::Hidden),
            other => Err(UnknownVariant {
                kind: "annotation kind",
                value: other.to_string(),
            }),
        }
    }
}

/// One feed item. `id` is issued by the upstream source and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: NoteStatus,
    pub region_id: Option<i64>,
}

impl Record {
    pub fn latest_activity(&self) -> DateTime<Utc> {
        match self.closed_at {
            Some(closed) if closed > self.created_at => closed,
            _ => self.created_at,
        }
    }
}

/// Ordered event attached to a [`Record`]. `(record_id, sequence)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub record_id: i64,
    pub sequence: i32,
    pub kind: AnnotationKind,
    pub at: DateTime<Utc>,
    pub actor_id: Option<i64>,
    pub actor_name: Option<String>,
    pub body: Option<String>,
}

impl Annotation {
    pub fn key(&self) -> (i64, i32) {
        (self.record_id, self.sequence)
    }
}

/// Typed rows produced by the extraction transform for one input range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowBatch {
    pub records: Vec<Record>,
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub records: usize,
    pub annotations: usize,
}

impl RowBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.annotations.is_empty()
    }

    pub fn extend(&mut self, other: RowBatch) {
        self.records.extend(other.records);
        self.annotations.extend(other.annotations);
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            records: self.records.len(),
            annotations: self.annotations.len(),
        }
    }

    /// Newest source timestamp carried by any row of the batch.
    pub fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        let records = self.records.iter().map(Record::latest_activity);
        let annotations = self.annotations.iter().map(|a| a.at);
        records.chain(annotations).max()
    }
}

/// High-water mark of verified ingestion. Single row in the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub timestamp: DateTime<Utc>,
    pub integrity_passed: bool,
    pub updated_at: DateTime<Utc>,
}

impl SyncCheckpoint {
    pub fn initial() -> Self {
        Self {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            integrity_passed: true,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl Default for SyncCheckpoint {
    fn default() -> Self {
        Self::initial()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapKind {
    RecordsWithoutAnnotations,
    RecordsMissingUpstream,
}

impl GapKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GapKind::RecordsWithoutAnnotations => "records_without_annotations",
            GapKind::RecordsMissingUpstream => "records_missing_upstream",
        }
    }
}

impl FromStr for GapKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "records_without_annotations" => Ok(GapKind::RecordsWithoutAnnotations),
            "records_missing_upstream" => Ok(GapKind::RecordsMissingUpstream),
            other => Err(UnknownVariant {
                kind: "gap kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Bounded completeness shortfall deferred to the gap reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapRecord {
    pub id: Uuid,
    pub cycle_id: Option<Uuid>,
    pub kind: GapKind,
    pub affected_count: u64,
    pub total_count: u64,
    pub percentage: f64,
    pub affected_ids: Vec<i64>,
    pub processed: bool,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Queued,
    Active,
    Done,
    Failed,
}

/// Admission record for one download through the rate-limited fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTicket {
    pub resource: String,
    pub order: u64,
    pub state: TicketState,
    pub retries: u32,
}

/// Kind of reference boundary maintained alongside the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneKind {
    Country,
    Maritime,
}

impl ZoneKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ZoneKind::Country => "country",
            ZoneKind::Maritime => "maritime",
        }
    }
}

/// Point-in-region capability. Called once per genuinely new record.
pub trait RegionLookup: Send + Sync {
    fn region_of(&self, lat: f64, lon: f64) -> Option<i64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoRegionLookup;

impl RegionLookup for NoRegionLookup {
    fn region_of(&self, _lat: f64, _lon: f64) -> Option<i64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).single().unwrap()
    }

    #[test]
    fn newest_timestamp_covers_closures_and_annotations() {
        let batch = RowBatch {
            records: vec![Record {
                id: 1,
                lat: 4.6,
                lon: -74.1,
                created_at: ts(1),
                closed_at: Some(ts(5)),
                status: NoteStatus::Closed,
                region_id: None,
            }],
            annotations: vec![Annotation {
                record_id: 1,
                sequence: 1,
                kind: AnnotationKind::Opened,
                at: ts(3),
                actor_id: None,
                actor_name: None,
                body: None,
            }],
        };
        assert_eq!(batch.newest_timestamp(), Some(ts(5)));
        assert_eq!(RowBatch::default().newest_timestamp(), None);
    }

    #[test]
    fn status_parsing_accepts_action_verbs() {
        assert_eq!("reopen".parse::<NoteStatus>().unwrap(), NoteStatus::Reopened);
        assert_eq!("Closed".parse::<NoteStatus>().unwrap(), NoteStatus::Closed);
        assert!("deleted".parse::<NoteStatus>().is_err());
        assert_eq!(
            "comment".parse::<AnnotationKind>().unwrap(),
            AnnotationKind::Commented
        );
    }

    #[test]
    fn gap_kind_round_trips_through_storage_name() {
        let kind = GapKind::RecordsWithoutAnnotations;
        assert_eq!(kind.as_str().parse::<GapKind>().unwrap(), kind);
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, "\"records_without_annotations\"");
    }
}
