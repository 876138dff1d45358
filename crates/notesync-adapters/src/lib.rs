//! Feed, snapshot and boundary sources, the notes extraction transform and
//! region lookups.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notesync_core::{RowBatch, ZoneKind};
use notesync_storage::FetchError;
use thiserror::Error;

pub mod boundaries;
pub mod region;
pub mod sources;
pub mod transform;

pub use boundaries::{
    BoundaryRefreshReport, BoundaryRefresher, BoundaryTarget, DownloadedBoundary, FailedBoundary,
};
pub use region::{BoundingBoxRegionLookup, RegionBox};
pub use sources::{
    FixtureBoundarySource, FixtureIncrementalSource, FixtureSnapshotSource, HttpBoundarySource,
    HttpIncrementalSource, HttpSnapshotSource,
};
pub use transform::NoteXmlTransform;

pub const CRATE_NAME: &str = "notesync-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("fixture source has no document left")]
    Exhausted,
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("input is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("invalid selector `{0}`")]
    Selector(String),
    #[error("<{element}> is missing attribute `{attribute}`")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },
    #[error("attribute `{attribute}` has invalid value `{value}`")]
    InvalidValue {
        attribute: &'static str,
        value: String,
    },
}

/// Rate-bounded feed of records changed since a timestamp.
#[async_trait]
pub trait IncrementalSource: Send + Sync {
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<u8>, SourceError>;
}

/// Complete dataset as of its publication.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<Vec<u8>, SourceError>;
}

#[async_trait]
pub trait BoundarySource: Send + Sync {
    async fn fetch_boundary(&self, kind: ZoneKind, id: i64) -> Result<Vec<u8>, SourceError>;
}

/// Pure extraction step run once per partition. Implementations hold no
/// state shared across calls.
pub trait ExtractTransform: Send + Sync {
    /// Byte sequence that starts every record in the raw document.
    fn record_marker(&self) -> &'static [u8];

    fn transform(&self, input: &[u8]) -> Result<RowBatch, TransformError>;
}
