//! Splitting a raw document into byte ranges that start on a record marker.
//!
//! Cuts are only ever placed at the first byte of a marker, so every record
//! lies entirely inside one partition. Partitions are contiguous, never
//! overlap, and together cover `[0, len)`.

use std::ops::Range;

use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub worker: usize,
}

impl Partition {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    search_window: usize,
}

impl Partitioner {
    pub fn new(search_window: usize) -> Self {
        Self {
            search_window: search_window.max(1),
        }
    }

    /// Splits `doc` into at most `target` partitions assigned round-robin
    /// over `workers`. A candidate cut with no marker within the search
    /// window is dropped; if every candidate is dropped the document is one
    /// partition.
    pub fn split(
        &self,
        doc: &[u8],
        target: usize,
        marker: &[u8],
        workers: usize,
    ) -> Vec<Partition> {
        let target = target.max(1);
        let workers = workers.max(1);
        let len = doc.len();

        let mut cuts = Vec::with_capacity(target);
        if target > 1 && !marker.is_empty() {
            for k in 1..target {
                let candidate = k * len / target;
                match self.nearest_marker(doc, candidate, marker) {
                    Some(cut)
                        if cut > 0 && cut < len && cuts.last().map_or(true, |last| cut > *last) =>
                    {
                        cuts.push(cut)
                    }
                    Some(_) => {}
                    None => debug!(candidate, "no record boundary near candidate cut"),
                }
            }
            if cuts.is_empty() && len > 0 {
                warn!(
                    bytes = len,
                    target,
                    window = self.search_window,
                    "no record boundary found, processing document as a single partition"
                );
            }
        }

        let mut bounds = Vec::with_capacity(cuts.len() + 2);
        bounds.push(0);
        bounds.extend(cuts);
        bounds.push(len);

        bounds
            .windows(2)
            .enumerate()
            .map(|(index, pair)| Partition {
                index,
                start: pair[0],
                end: pair[1],
                worker: index % workers,
            })
            .collect()
    }

    fn nearest_marker(&self, doc: &[u8], candidate: usize, marker: &[u8]) -> Option<usize> {
        let forward = find_forward(doc, candidate, self.search_window, marker);
        let backward = find_backward(doc, candidate, self.search_window, marker);
        match (backward, forward) {
            (Some(b), Some(f)) => Some(if candidate - b <= f - candidate { b } else { f }),
            (b, f) => b.or(f),
        }
    }
}

/// First marker starting in `[from, from + window]`.
fn find_forward(doc: &[u8], from: usize, window: usize, marker: &[u8]) -> Option<usize> {
    if from >= doc.len() {
        return None;
    }
    let end = from
        .saturating_add(window)
        .saturating_add(marker.len())
        .min(doc.len());
    doc[from..end]
        .windows(marker.len())
        .position(|w| w == marker)
        .map(|pos| from + pos)
}

/// Last marker starting in `[from - window, from]`.
fn find_backward(doc: &[u8], from: usize, window: usize, marker: &[u8]) -> Option<usize> {
    let start = from.saturating_sub(window);
    let end = from.saturating_add(marker.len()).min(doc.len());
    if start >= end {
        return None;
    }
    doc[start..end]
        .windows(marker.len())
        .rposition(|w| w == marker)
        .map(|pos| start + pos)
}

/// Number of record markers in `doc`.
pub fn count_records(doc: &[u8], marker: &[u8]) -> usize {
    if marker.is_empty() || doc.len() < marker.len() {
        return 0;
    }
    doc.windows(marker.len()).filter(|w| *w == marker).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &[u8] = b"<note ";

    fn document(n: usize) -> Vec<u8> {
        let mut doc = b"<osm-notes>\n".to_vec();
        for i in 0..n {
            let body = "x".repeat(i % 7 * 5);
            doc.extend_from_slice(
                format!("<note id=\"{i}\"><comment action=\"opened\">{body}</comment></note>\n").as_bytes(),
            );
        }
        doc.extend_from_slice(b"</osm-notes>\n");
        doc
    }

    fn assert_covers(doc: &[u8], parts: &[Partition]) {
        assert_eq!(parts.first().unwrap().start, 0);
        assert_eq!(parts.last().unwrap().end, doc.len());
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn cuts_land_on_record_markers() {
        let doc = document(40);
        let parts = Partitioner::new(4096).split(&doc, 6, MARKER, 2);

        assert_eq!(parts.len(), 6);
        assert_covers(&doc, &parts);
        for part in &parts[1..] {
            assert!(doc[part.start..].starts_with(MARKER));
        }
        assert_eq!(parts[3].worker, 1);
        let total: usize = parts.iter().map(|p| count_records(&doc[p.range()], MARKER)).sum();
        assert_eq!(total, 40);
    }

    #[test]
    fn more_targets_than_records_collapses_duplicate_cuts() {
        let doc = document(2);
        let parts = Partitioner::new(4096).split(&doc, 16, MARKER, 4);
        assert!(parts.len() <= 3);
        assert_covers(&doc, &parts);
    }

    #[test]
    fn no_marker_in_window_degrades_to_single_partition() {
        let doc = vec![b'a'; 10_000];
        let parts = Partitioner::new(64).split(&doc, 8, MARKER, 4);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].range(), 0..10_000);
    }

    #[test]
    fn empty_document_is_one_empty_partition() {
        let parts = Partitioner::new(64).split(b"", 4, MARKER, 2);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_empty());
    }

    #[test]
    fn counts_markers() {
        assert_eq!(count_records(&document(13), MARKER), 13);
        assert_eq!(count_records(b"<notes></notes>", MARKER), 0);
    }
}
