use std::collections::{BTreeMap, BTreeSet};

use budget_core::{
    AlertState, HandoffSnapshot, SnapshotReason, SourceCursor, StoreError, WindowKind,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::aggregator::WindowAggregator;
use crate::alerts::AlertEngine;

#[derive(Debug, Error)]
pub enum ContinuityError {
    #[error("snapshot {sequence} is a replay; last applied is {last_applied}")]
    Replay { sequence: u64, last_applied: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a snapshot could not be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RehydrateError {
    #[error("configuration changed: {0}")]
    ConfigMismatch(String),
    #[error("bucket starting at {0} is not aligned to the bucket width")]
    MisalignedBucket(DateTime<Utc>),
    #[error("buckets are not strictly ordered")]
    UnsortedBuckets,
    #[error("open block starting at {0} overlaps the previously closed block")]
    OverlappingBlock(DateTime<Utc>),
    #[error("snapshot has no {0} window")]
    MissingWindow(WindowKind),
    #[error("{0} window does not match the recorded aggregator state")]
    WindowMismatch(WindowKind),
    #[error("alert states are inconsistent: {0}")]
    InvalidAlerts(String),
}

/// Assigns snapshot sequence numbers and rejects replays.
#[derive(Debug, Clone, Default)]
pub struct ContinuityRecorder {
    last_sequence: u64,
}

impl ContinuityRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn capture(
        &mut self,
        reason: SnapshotReason,
        created_at: DateTime<Utc>,
        aggregator: &WindowAggregator,
        alerts: &AlertEngine,
        cursors: &BTreeMap<String, SourceCursor>,
    ) -> HandoffSnapshot {
        self.last_sequence = self.last_sequence.saturating_add(1);
        HandoffSnapshot {
            sequence_number: self.last_sequence,
            created_at,
            reason,
            windows: WindowKind::ALL
                .iter()
                .map(|kind| aggregator.snapshot(*kind, created_at))
                .collect(),
            aggregator: aggregator.state(),
            alerts: alerts.states(),
            cursors: cursors.clone(),
        }
    }

    pub fn check_replay(&self, snapshot: &HandoffSnapshot) -> Result<(), ContinuityError> {
        if snapshot.sequence_number <= self.last_sequence {
            return Err(ContinuityError::Replay {
                sequence: snapshot.sequence_number,
                last_applied: self.last_sequence,
            });
        }
        Ok(())
    }

    /// Marks `sequence` as applied. Later captures continue after it.
    pub fn accept(&mut self, sequence: u64) {
        self.last_sequence = self.last_sequence.max(sequence);
    }
}

/// Checks that `aggregator`, already restored from `snapshot`, reproduces the recorded windows.
pub fn validate_restored(
    snapshot: &HandoffSnapshot,
    aggregator: &WindowAggregator,
) -> Result<(), RehydrateError> {
    for kind in WindowKind::ALL {
        let recorded = snapshot
            .window(kind)
            .ok_or(RehydrateError::MissingWindow(kind))?;
        let recomputed = aggregator.snapshot(kind, snapshot.created_at);
        let same = recorded.anchor == recomputed.anchor
            && recorded.totals == recomputed.totals
            && recorded.event_count == recomputed.event_count
            && recorded.last_event_time == recomputed.last_event_time
            && recorded.by_model == recomputed.by_model;
        if !same {
            return Err(RehydrateError::WindowMismatch(kind));
        }
    }
    validate_alerts(&snapshot.alerts)
}

fn validate_alerts(states: &[AlertState]) -> Result<(), RehydrateError> {
    let mut seen = BTreeSet::new();
    for state in states {
        if !seen.insert((state.kind, state.tier)) {
            return Err(RehydrateError::InvalidAlerts(format!(
                "duplicate state for {} {}",
                state.kind, state.tier
            )));
        }
        if state.fire_count == 0 && state.last_fired_at.is_some() {
            return Err(RehydrateError::InvalidAlerts(format!(
                "{} {} fired without a count",
                state.kind, state.tier
            )));
        }
    }
    Ok(())
}
