//! Bounding-box region lookup over downloaded boundary payloads.
//!
//! Payloads are JSON objects carrying at least `id` and a GeoJSON-style
//! `bbox` of `[min_lon, min_lat, max_lon, max_lat]`. When several boxes
//! contain a point the smallest wins, so a country inside a larger
//! maritime zone is preferred.

use std::path::Path;

use anyhow::{Context, Result};
use notesync_core::{RegionLookup, ZoneKind};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub struct RegionBox {
    pub region_id: i64,
    pub kind: ZoneKind,
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl RegionBox {
    fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    fn area(&self) -> f64 {
        (self.max_lat - self.min_lat) * (self.max_lon - self.min_lon)
    }
}

#[derive(Debug, Deserialize)]
struct BoundaryPayload {
    id: i64,
    #[serde(default = "default_kind")]
    kind: ZoneKind,
    bbox: [f64; 4],
}

fn default_kind() -> ZoneKind {
    ZoneKind::Country
}

#[derive(Debug, Clone, Default)]
pub struct BoundingBoxRegionLookup {
    boxes: Vec<RegionBox>,
}

impl BoundingBoxRegionLookup {
    pub fn new(boxes: Vec<RegionBox>) -> Self {
        Self { boxes }
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn push_payload(&mut self, payload: &[u8]) -> Result<()> {
        let parsed: BoundaryPayload =
            serde_json::from_slice(payload).context("parsing boundary payload")?;
        let [min_lon, min_lat, max_lon, max_lat] = parsed.bbox;
        self.boxes.push(RegionBox {
            region_id: parsed.id,
            kind: parsed.kind,
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        });
        Ok(())
    }

    /// Loads every `*.json` payload under `dir`, recursively.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let mut lookup = Self::default();
        let mut pending = vec![dir.as_ref().to_path_buf()];
        while let Some(current) = pending.pop() {
            let entries = std::fs::read_dir(&current)
                .with_context(|| format!("reading {}", current.display()))?;
            for entry in entries {
                let path = entry
                    .with_context(|| format!("listing {}", current.display()))?
                    .path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "json") {
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    lookup
                        .push_payload(&bytes)
                        .with_context(|| format!("loading {}", path.display()))?;
                }
            }
        }
        Ok(lookup)
    }
}

impl RegionLookup for BoundingBoxRegionLookup {
    fn region_of(&self, lat: f64, lon: f64) -> Option<i64> {
        self.boxes
            .iter()
            .filter(|b| b.contains(lat, lon))
            .min_by(|a, b| a.area().total_cmp(&b.area()))
            .map(|b| b.region_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_containing_box_wins() {
        let mut lookup = BoundingBoxRegionLookup::default();
        lookup
            .push_payload(br#"{"id": 9001, "kind": "maritime", "bbox": [-20.0, 30.0, 20.0, 60.0]}"#)
            .unwrap();
        lookup
            .push_payload(br#"{"id": 51477, "bbox": [5.8, 47.2, 15.1, 55.1]}"#)
            .unwrap();

        assert_eq!(lookup.region_of(52.5, 13.4), Some(51477));
        assert_eq!(lookup.region_of(40.0, -10.0), Some(9001));
        assert_eq!(lookup.region_of(-33.9, 151.2), None);
    }

    #[test]
    fn load_dir_walks_kind_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("country")).unwrap();
        std::fs::write(
            dir.path().join("country").join("1.json"),
            br#"{"id": 1, "bbox": [0.0, 0.0, 1.0, 1.0]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.txt"), b"ignored").unwrap();

        let lookup = BoundingBoxRegionLookup::load_dir(dir.path()).unwrap();
        assert_eq!(lookup.len(), 1);
        assert_eq!(lookup.region_of(0.5, 0.5), Some(1));
    }
}
