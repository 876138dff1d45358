//! Extraction of records and annotations from the notes XML dump and the
//! incremental API, which share one document shape:
//!
//! ```text
//! <osm-notes>
//!   <note id="42" lat="51.5" lon="-0.12" created_at="2026-03-01T10:00:00Z" status="open">
//!     <comment action="opened" timestamp="2026-03-01T10:00:00Z" uid="7" user="mapper">Bench gone</comment>
//!   </note>
//! </osm-notes>
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use notesync_core::{Annotation, AnnotationKind, NoteStatus, Record, RowBatch};
use scraper::{ElementRef, Html, Selector};

use crate::{ExtractTransform, TransformError};

#[derive(Debug, Clone, Copy, Default)]
pub struct NoteXmlTransform;

impl NoteXmlTransform {
    pub fn new() -> Self {
        Self
    }
}

fn selector(raw: &str) -> Result<Selector, TransformError> {
    Selector::parse(raw).map_err(|e| TransformError::Selector(format!("{raw}: {e}")))
}

fn required<'a>(
    el: &'a ElementRef<'_>,
    element: &'static str,
    attribute: &'static str,
) -> Result<&'a str, TransformError> {
    el.value()
        .attr(attribute)
        .ok_or(TransformError::MissingAttribute { element, attribute })
}

fn parse_number<T: std::str::FromStr>(
    attribute: &'static str,
    raw: &str,
) -> Result<T, TransformError> {
    raw.trim().parse().map_err(|_| TransformError::InvalidValue {
        attribute,
        value: raw.to_string(),
    })
}

/// Accepts RFC 3339 and the `2026-03-01 10:00:00 UTC` form of the dump.
fn parse_timestamp(attribute: &'static str, raw: &str) -> Result<DateTime<Utc>, TransformError> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S UTC")
        .map(|naive| naive.and_utc())
        .map_err(|_| TransformError::InvalidValue {
            attribute,
            value: raw.to_string(),
        })
}

fn parse_note(note: &ElementRef<'_>) -> Result<Record, TransformError> {
    let id = parse_number("id", required(note, "note", "id")?)?;
    let lat = parse_number("lat", required(note, "note", "lat")?)?;
    let lon = parse_number("lon", required(note, "note", "lon")?)?;
    let created_at = parse_timestamp("created_at", required(note, "note", "created_at")?)?;
    let closed_at = note
        .value()
        .attr("closed_at")
        .filter(|v| !v.trim().is_empty())
        .map(|v| parse_timestamp("closed_at", v))
        .transpose()?;
    let status = match note.value().attr("status") {
        Some(raw) => raw.parse::<NoteStatus>().map_err(|_| TransformError::InvalidValue {
            attribute: "status",
            value: raw.to_string(),
        })?,
        None if closed_at.is_some() => NoteStatus::Closed,
        None => NoteStatus::Open,
    };

    Ok(Record {
        id,
        lat,
        lon,
        created_at,
        closed_at,
        status,
        region_id: None,
    })
}

fn parse_comment(
    record_id: i64,
    sequence: i32,
    comment: &ElementRef<'_>,
) -> Result<Annotation, TransformError> {
    let action = required(comment, "comment", "action")?;
    let kind = action.parse::<AnnotationKind>().map_err(|_| TransformError::InvalidValue {
        attribute: "action",
        value: action.to_string(),
    })?;
    let at = parse_timestamp("timestamp", required(comment, "comment", "timestamp")?)?;
    let actor_id = comment
        .value()
        .attr("uid")
        .map(|v| parse_number("uid", v))
        .transpose()?;
    let actor_name = comment.value().attr("user").map(str::to_string);
    let body = comment.text().collect::<String>();
    let body = body.trim();

    Ok(Annotation {
        record_id,
        sequence,
        kind,
        at,
        actor_id,
        actor_name,
        body: (!body.is_empty()).then(|| body.to_string()),
    })
}

impl ExtractTransform for NoteXmlTransform {
    fn record_marker(&self) -> &'static [u8] {
        b"<note "
    }

    fn transform(&self, input: &[u8]) -> Result<RowBatch, TransformError> {
        let text = std::str::from_utf8(input)?;
        let fragment = Html::parse_fragment(text);
        let note_sel = selector("note")?;
        let comment_sel = selector("comment")?;

        let mut batch = RowBatch::default();
        for note in fragment.select(&note_sel) {
            let record = parse_note(&note)?;
            for (idx, comment) in note.select(&comment_sel).enumerate() {
                batch
                    .annotations
                    .push(parse_comment(record.id, idx as i32 + 1, &comment)?);
            }
            batch.records.push(record);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm-notes>
<note id="101" lat="-33.86" lon="151.2" created_at="2026-03-01 09:15:00 UTC" closed_at="2026-03-02 11:00:00 UTC">
  <comment action="opened" timestamp="2026-03-01 09:15:00 UTC" uid="12" user="surveyor">Footpath &amp; steps missing</comment>
  <comment action="closed" timestamp="2026-03-02 11:00:00 UTC" uid="40" user="fixer">added</comment>
</note>
<note id="102" lat="40.4" lon="-3.7" created_at="2026-03-01T10:00:00Z" status="reopened">
  <comment action="opened" timestamp="2026-03-01T10:00:00Z"></comment>
</note>
</osm-notes>"#;

    #[test]
    fn extracts_records_and_ordered_comments() {
        let batch = NoteXmlTransform.transform(DOC.as_bytes()).unwrap();

        assert_eq!(batch.records.len(), 2);
        let first = &batch.records[0];
        assert_eq!(first.id, 101);
        assert_eq!(first.status, NoteStatus::Closed);
        assert_eq!(
            first.closed_at,
            Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).single()
        );
        assert_eq!(batch.records[1].status, NoteStatus::Reopened);

        assert_eq!(batch.annotations.len(), 3);
        let opened = &batch.annotations[0];
        assert_eq!(opened.key(), (101, 1));
        assert_eq!(opened.body.as_deref(), Some("Footpath & steps missing"));
        assert_eq!(opened.actor_id, Some(12));
        assert_eq!(batch.annotations[1].kind, AnnotationKind::Closed);
        assert_eq!(batch.annotations[2].key(), (102, 1));
        assert_eq!(batch.annotations[2].body, None);
        assert_eq!(batch.annotations[2].actor_name, None);
    }

    #[test]
    fn missing_coordinates_are_reported() {
        let err = NoteXmlTransform
            .transform(br#"<note id="5" lat="1.0" created_at="2026-03-01T10:00:00Z"></note>"#)
            .unwrap_err();
        assert!(matches!(
            err,
            TransformError::MissingAttribute { attribute: "lon", .. }
        ));
    }

    #[test]
    fn fragment_without_header_still_parses() {
        let tail = &DOC[DOC.find("<note id=\"102\"").unwrap()..];
        let batch = NoteXmlTransform.transform(tail.as_bytes()).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].id, 102);
    }
}
