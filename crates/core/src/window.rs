use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::usage::TokenUsage;

/// Accumulation boundary tracked by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Resetting block, opened by the first event after the previous block closed.
    ShortBlock,
    /// Continuously sliding quota window.
    LongQuota,
}

impl WindowKind {
    pub const ALL: [WindowKind; 2] = [WindowKind::ShortBlock, WindowKind::LongQuota];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShortBlock => "short_block",
            Self::LongQuota => "long_quota",
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub usage: TokenUsage,
    pub event_count: u64,
    /// Wall-clock seconds of buckets in which the model was active (LongQuota only).
    #[serde(default)]
    pub active_seconds: u64,
}

impl ModelUsage {
    pub fn record(&mut self, usage: TokenUsage) {
        self.usage = self.usage.saturating_add(usage);
        self.event_count = self.event_count.saturating_add(1);
    }

    pub fn merge(&mut self, other: &ModelUsage) {
        self.usage = self.usage.saturating_add(other.usage);
        self.event_count = self.event_count.saturating_add(other.event_count);
        self.active_seconds = self.active_seconds.saturating_add(other.active_seconds);
    }
}

/// Read-only view of one window at `as_of`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingWindow {
    pub kind: WindowKind,
    pub length_secs: i64,
    /// Start of the current instance. `None` when no ShortBlock is open.
    pub anchor: Option<DateTime<Utc>>,
    pub totals: TokenUsage,
    pub event_count: u64,
    pub last_event_time: Option<DateTime<Utc>>,
    pub by_model: BTreeMap<String, ModelUsage>,
    pub as_of: DateTime<Utc>,
}

impl RollingWindow {
    pub fn empty(kind: WindowKind, length: Duration, as_of: DateTime<Utc>) -> Self {
        Self {
            kind,
            length_secs: length.num_seconds(),
            anchor: None,
            totals: TokenUsage::default(),
            event_count: 0,
            last_event_time: None,
            by_model: BTreeMap::new(),
            as_of,
        }
    }

    pub fn length(&self) -> Duration {
        Duration::seconds(self.length_secs)
    }

    pub fn is_active(&self) -> bool {
        self.anchor.is_some()
    }

    /// End of an open ShortBlock. The sliding quota never resets.
    pub fn resets_at(&self) -> Option<DateTime<Utc>> {
        match self.kind {
            WindowKind::ShortBlock => self.anchor.map(|anchor| anchor + self.length()),
            WindowKind::LongQuota => None,
        }
    }

    pub fn counted_tokens(&self) -> u64 {
        self.totals.counted_tokens()
    }

    pub fn elapsed_since_anchor(&self) -> Duration {
        match self.anchor {
            Some(anchor) if self.as_of > anchor => self.as_of - anchor,
            _ => Duration::zero(),
        }
    }
}

/// Events the aggregator refused, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropCounters {
    /// Older than the open ShortBlock (still counted by LongQuota when inside its horizon).
    pub backfill: u64,
    /// Older than every tracked window.
    pub beyond_horizon: u64,
    /// Too far ahead of the wall clock.
    pub clock_skew: u64,
    pub duplicate: u64,
}

impl DropCounters {
    pub fn total(&self) -> u64 {
        self.backfill
            .saturating_add(self.beyond_horizon)
            .saturating_add(self.clock_skew)
            .saturating_add(self.duplicate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortBlockState {
    pub anchor: DateTime<Utc>,
    pub totals: TokenUsage,
    pub event_count: u64,
    pub last_event_time: Option<DateTime<Utc>>,
    pub by_model: BTreeMap<String, ModelUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState {
    pub start: DateTime<Utc>,
    pub totals: TokenUsage,
    pub event_count: u64,
    pub last_event_time: Option<DateTime<Utc>>,
    pub by_model: BTreeMap<String, ModelUsage>,
}

/// Complete, serializable aggregator state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorState {
    pub short_block_length_secs: i64,
    pub long_quota_length_secs: i64,
    pub bucket_width_secs: i64,
    pub short_block: Option<ShortBlockState>,
    /// End of the most recently closed ShortBlock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_closed_end: Option<DateTime<Utc>>,
    /// Sorted by `start`, oldest first.
    pub buckets: Vec<BucketState>,
    pub drops: DropCounters,
}
