use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::window::WindowKind;

/// Derived burn-rate view of one window. Never stored on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub kind: WindowKind,
    pub as_of: DateTime<Utc>,
    /// Exponentially-weighted tokens per minute.
    pub rate_per_minute: f64,
    /// Rate observed over the latest sample interval.
    pub instantaneous_rate_per_minute: f64,
    /// Raw ratio, not clamped.
    pub cache_efficiency_percent: f64,
    /// Raw ratio against the binding limit, not clamped. `None` without a configured limit.
    pub percent_of_limit_used: Option<f64>,
    /// Label of the limit that produced `percent_of_limit_used`.
    pub binding_limit: Option<String>,
    /// Units left under the binding limit; negative once past it.
    pub remaining: Option<i64>,
    /// `None` means not approaching the limit at the current rate.
    pub estimated_exhaustion_time: Option<DateTime<Utc>>,
    /// The binding limit is already used up. `estimated_exhaustion_time` is then the
    /// last event's time, at or before `as_of`; equal to it when that event is the newest input.
    pub already_exhausted: bool,
    pub window_resets_at: Option<DateTime<Utc>>,
}

impl Projection {
    pub fn display_percent_used(&self) -> Option<f64> {
        self.percent_of_limit_used.map(clamp_percent)
    }

    pub fn display_cache_efficiency(&self) -> f64 {
        clamp_percent(self.cache_efficiency_percent)
    }
}

pub fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}
