use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::AlertState;
use crate::budget::LimitUsage;
use crate::projection::Projection;
use crate::window::{DropCounters, RollingWindow};

/// Whether the monitor can vouch for its numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Known,
    /// Sources unreadable or state rebuilt from nothing; callers must treat as unsafe.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStatus {
    pub window: RollingWindow,
    pub projection: Projection,
    pub limits: Vec<LimitUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source: String,
    pub offset: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub events_ingested: u64,
    pub parse_errors: u64,
    pub recoverable_parse_errors: u64,
    pub source_errors: u64,
    pub store_errors: u64,
    pub notifier_dropped: u64,
    pub drops: DropCounters,
    pub sources: Vec<SourceHealth>,
    pub last_snapshot_sequence: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStatus {
    pub as_of: DateTime<Utc>,
    pub status: UsageStatus,
    pub windows: Vec<WindowStatus>,
    pub active_alerts: Vec<AlertState>,
    pub health: HealthSnapshot,
}
