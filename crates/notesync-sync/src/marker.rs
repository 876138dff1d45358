//! Durable failed-execution marker. While it exists no cycle may start.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("marker io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt marker {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMarker {
    pub cycle_id: Uuid,
    pub stage: String,
    pub cause: String,
    pub failed_at: DateTime<Utc>,
    pub pid: u32,
}

impl FailedMarker {
    pub fn new(cycle_id: Uuid, stage: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            cycle_id,
            stage: stage.into(),
            cause: cause.into(),
            failed_at: Utc::now(),
            pid: std::process::id(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailedMarkerFile {
    path: PathBuf,
}

impl FailedMarkerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io(&self, source: std::io::Error) -> MarkerError {
        MarkerError::Io {
            path: self.path.clone(),
            source,
        }
    }

    pub fn read(&self) -> Result<Option<FailedMarker>, MarkerError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| MarkerError::Corrupt {
                    path: self.path.clone(),
                    source,
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io(err)),
        }
    }

    pub fn write(&self, marker: &FailedMarker) -> Result<(), MarkerError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io(e))?;
        }
        let bytes = serde_json::to_vec_pretty(marker).map_err(|source| MarkerError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension(format!("json.{}.tmp", std::process::id()));
        std::fs::write(&tmp, bytes).map_err(|e| self.io(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io(e))
    }

    /// Returns the cleared marker, if there was one.
    pub fn clear(&self) -> Result<Option<FailedMarker>, MarkerError> {
        let existing = match self.read() {
            Ok(existing) => existing,
            // An unreadable marker is still a marker; clearing removes it.
            Err(MarkerError::Corrupt { .. }) => None,
            Err(err) => return Err(err),
        };
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(existing),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_clear() {
        let dir = tempfile::tempdir().unwrap();
        let file = FailedMarkerFile::new(dir.path().join("state").join("failed_execution.json"));
        assert_eq!(file.read().unwrap(), None);

        let marker = FailedMarker::new(Uuid::new_v4(), "load", "connection reset");
        file.write(&marker).unwrap();
        assert_eq!(file.read().unwrap(), Some(marker.clone()));

        assert_eq!(file.clear().unwrap(), Some(marker));
        assert_eq!(file.read().unwrap(), None);
        assert_eq!(file.clear().unwrap(), None);
    }

    #[test]
    fn corrupt_marker_still_blocks_and_can_be_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let file = FailedMarkerFile::new(dir.path().join("failed_execution.json"));
        std::fs::write(file.path(), b"{not json").unwrap();
        assert!(matches!(file.read(), Err(MarkerError::Corrupt { .. })));
        file.clear().unwrap();
        assert!(!file.path().exists());
    }
}
