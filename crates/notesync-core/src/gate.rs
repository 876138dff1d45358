//! Integrity gate: decides whether a cycle may advance the sync checkpoint.
//!
//! The loader computes an [`IntegrityReport`] inside the same transaction as
//! its merge and hands it to [`IntegrityGate::decide`]. The resulting
//! [`GateDecision`] carries the checkpoint row and optional gap row that the
//! store persists before committing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{GapKind, GapRecord, SyncCheckpoint};

pub const DEFAULT_FAIL_THRESHOLD: f64 = 0.05;

/// Post-merge completeness figures for the recent window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub window_start: DateTime<Utc>,
    pub recent_records: u64,
    pub recent_without_annotations: u64,
    pub affected_ids: Vec<i64>,
    pub store_annotations: u64,
}

impl IntegrityReport {
    pub fn ratio(&self) -> f64 {
        if self.recent_records == 0 {
            return 0.0;
        }
        self.recent_without_annotations as f64 / self.recent_records as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub verdict: GateVerdict,
    pub ratio: f64,
    pub permissive: bool,
    pub checkpoint: SyncCheckpoint,
    pub gap: Option<GapRecord>,
}

impl GateDecision {
    pub fn passed(&self) -> bool {
        self.verdict == GateVerdict::Pass
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IntegrityGate {
    fail_threshold: f64,
}

impl Default for IntegrityGate {
    fn default() -> Self {
        Self::new(DEFAULT_FAIL_THRESHOLD)
    }
}

impl IntegrityGate {
    pub fn new(fail_threshold: f64) -> Self {
        Self { fail_threshold }
    }

    pub fn fail_threshold(&self) -> f64 {
        self.fail_threshold
    }

    /// Ratios at or below the threshold pass; the checkpoint only moves forward.
    pub fn decide(
        &self,
        report: &IntegrityReport,
        previous: &SyncCheckpoint,
        newest: Option<DateTime<Utc>>,
        cycle_id: Uuid,
        now: DateTime<Utc>,
    ) -> GateDecision {
        let ratio = report.ratio();

        if report.store_annotations == 0 {
            return GateDecision {
                verdict: GateVerdict::Pass,
                ratio,
                permissive: true,
                checkpoint: advanced(previous, newest, now),
                gap: None,
            };
        }

        let gap = (report.recent_without_annotations > 0).then(|| GapRecord {
            id: Uuid::new_v4(),
            cycle_id: Some(cycle_id),
            kind: GapKind::RecordsWithoutAnnotations,
            affected_count: report.recent_without_annotations,
            total_count: report.recent_records,
            percentage: ratio * 100.0,
            affected_ids: report.affected_ids.clone(),
            processed: false,
            detected_at: now,
        });

        if ratio > self.fail_threshold {
            GateDecision {
                verdict: GateVerdict::Fail,
                ratio,
                permissive: false,
                checkpoint: SyncCheckpoint {
                    timestamp: previous.timestamp,
                    integrity_passed: false,
                    updated_at: now,
                },
                gap,
            }
        } else {
            GateDecision {
                verdict: GateVerdict::Pass,
                ratio,
                permissive: false,
                checkpoint: advanced(previous, newest, now),
                gap,
            }
        }
    }
}

fn advanced(
    previous: &SyncCheckpoint,
    newest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> SyncCheckpoint {
    let timestamp = match newest {
        Some(ts) if ts > previous.timestamp => ts,
        _ => previous.timestamp,
    };
    SyncCheckpoint {
        timestamp,
        integrity_passed: true,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).single().unwrap()
    }

    fn report(total: u64, missing: u64, annotations: u64) -> IntegrityReport {
        IntegrityReport {
            window_start: now() - Duration::days(1),
            recent_records: total,
            recent_without_annotations: missing,
            affected_ids: (1..=missing as i64).collect(),
            store_annotations: annotations,
        }
    }

    fn previous() -> SyncCheckpoint {
        SyncCheckpoint {
            timestamp: now() - Duration::hours(2),
            integrity_passed: true,
            updated_at: now() - Duration::hours(2),
        }
    }

    #[test]
    fn small_shortfall_passes_and_records_gap() {
        let gate = IntegrityGate::default();
        let newest = now() - Duration::minutes(5);
        let decision = gate.decide(
            &report(103, 2, 101),
            &previous(),
            Some(newest),
            Uuid::nil(),
            now(),
        );

        assert_eq!(decision.verdict, GateVerdict::Pass);
        assert!((decision.ratio - 2.0 / 103.0).abs() < 1e-9);
        assert_eq!(decision.checkpoint.timestamp, newest);
        let gap = decision.gap.expect("non-blocking gap");
        assert_eq!(gap.affected_count, 2);
        assert_eq!(gap.total_count, 103);
        assert!(!gap.processed);
    }

    #[test]
    fn shortfall_above_threshold_withholds_checkpoint() {
        let gate = IntegrityGate::new(0.05);
        let decision = gate.decide(
            &report(10, 3, 40),
            &previous(),
            Some(now()),
            Uuid::nil(),
            now(),
        );

        assert_eq!(decision.verdict, GateVerdict::Fail);
        assert_eq!(decision.checkpoint.timestamp, previous().timestamp);
        assert!(!decision.checkpoint.integrity_passed);
        assert_eq!(decision.gap.unwrap().affected_ids, vec![1, 2, 3]);
    }

    #[test]
    fn empty_annotation_store_is_permissive() {
        let gate = IntegrityGate::default();
        let decision = gate.decide(
            &report(50, 50, 0),
            &previous(),
            Some(now()),
            Uuid::nil(),
            now(),
        );

        assert!(decision.passed());
        assert!(decision.permissive);
        assert!(decision.gap.is_none());
        assert_eq!(decision.checkpoint.timestamp, now());
    }

    #[test]
    fn checkpoint_never_moves_backwards() {
        let gate = IntegrityGate::default();
        let older = previous().timestamp - Duration::days(3);
        let decision = gate.decide(&report(4, 0, 4), &previous(), Some(older), Uuid::nil(), now());

        assert!(decision.passed());
        assert_eq!(decision.checkpoint.timestamp, previous().timestamp);
        assert!(decision.gap.is_none());
    }

    #[test]
    fn ratio_exactly_at_threshold_passes() {
        let gate = IntegrityGate::new(0.25);
        let decision = gate.decide(&report(4, 1, 3), &previous(), None, Uuid::nil(), now());
        assert!(decision.passed());
        assert_eq!(decision.checkpoint.timestamp, previous().timestamp);
    }
}
