use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::window::WindowKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTier {
    Info,
    Warning,
    Critical,
}

impl AlertTier {
    /// Ascending severity.
    pub const ALL: [AlertTier; 3] = [AlertTier::Info, AlertTier::Warning, AlertTier::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn default_threshold_percent(&self) -> f64 {
        match self {
            Self::Info => 25.0,
            Self::Warning => 50.0,
            Self::Critical => 90.0,
        }
    }
}

impl fmt::Display for AlertTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPhase {
    Idle,
    Fired,
    Acknowledged,
    Suppressed,
}

impl AlertPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fired => "fired",
            Self::Acknowledged => "acknowledged",
            Self::Suppressed => "suppressed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertState {
    pub kind: WindowKind,
    pub tier: AlertTier,
    pub phase: AlertPhase,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub acknowledged: bool,
    pub suppress_until: Option<DateTime<Utc>>,
    pub fire_count: u64,
}

impl AlertState {
    pub fn idle(kind: WindowKind, tier: AlertTier) -> Self {
        Self {
            kind,
            tier,
            phase: AlertPhase::Idle,
            last_fired_at: None,
            acknowledged: false,
            suppress_until: None,
            fire_count: 0,
        }
    }

    pub fn is_suppressed_at(&self, now: DateTime<Utc>) -> bool {
        self.suppress_until.is_some_and(|until| now < until)
    }
}

/// One state change produced by the alert engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTransition {
    pub kind: WindowKind,
    pub tier: AlertTier,
    pub from: AlertPhase,
    pub to: AlertPhase,
    pub at: DateTime<Utc>,
    pub percent_used: Option<f64>,
    /// The transition must reach the notifier.
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub tier: AlertTier,
    pub window: WindowKind,
    pub message: String,
    pub at: DateTime<Utc>,
    pub percent_used: Option<f64>,
}
