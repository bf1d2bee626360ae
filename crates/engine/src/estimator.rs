use std::collections::HashMap;

use budget_core::{LimitUnit, LimitUsage, Projection, RollingWindow, WindowKind};
use chrono::{DateTime, Duration, Utc};

use crate::policy;

#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorConfig {
    /// Weight of the newest sample in the moving average.
    pub alpha: f64,
    pub min_sample_interval: Duration,
    /// Projections further out than this are reported as this far out.
    pub max_projection: Duration,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            min_sample_interval: Duration::seconds(60),
            max_projection: Duration::days(365),
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(format!("alpha must be in (0, 1], got {}", self.alpha));
        }
        if self.min_sample_interval < Duration::zero() {
            return Err("min sample interval must not be negative".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct RateTrack {
    anchor: Option<DateTime<Utc>>,
    rate: f64,
    instantaneous: f64,
    last_sample_at: DateTime<Utc>,
    last_counted: u64,
}

/// EWMA burn rate per window kind.
#[derive(Debug, Clone, Default)]
pub struct RateEstimator {
    config: EstimatorConfig,
    tracks: HashMap<WindowKind, RateTrack>,
}

impl RateEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
        }
    }

    pub fn reset(&mut self, kind: WindowKind) {
        self.tracks.remove(&kind);
    }

    /// Current rate in tokens per minute, sampling the window if enough time has passed.
    pub fn rate(&mut self, window: &RollingWindow, now: DateTime<Utc>) -> (f64, f64) {
        if !window.is_active() {
            self.tracks.remove(&window.kind);
            return (0.0, 0.0);
        }
        let counted = window.counted_tokens();
        // The sliding quota never restarts, so only ShortBlock anchors trigger a reseed.
        let anchor = match window.kind {
            WindowKind::ShortBlock => window.anchor,
            WindowKind::LongQuota => None,
        };
        match self.tracks.get_mut(&window.kind) {
            Some(track) if track.anchor == anchor => {
                let elapsed = now - track.last_sample_at;
                if elapsed >= self.config.min_sample_interval && elapsed > Duration::zero() {
                    let minutes = elapsed.num_milliseconds() as f64 / 60_000.0;
                    let delta = counted.saturating_sub(track.last_counted) as f64;
                    track.instantaneous = delta / minutes;
                    track.rate = self.config.alpha * track.instantaneous
                        + (1.0 - self.config.alpha) * track.rate;
                    track.last_sample_at = now;
                    track.last_counted = counted;
                }
                (track.rate, track.instantaneous)
            }
            _ => {
                let minutes =
                    (window.elapsed_since_anchor().num_milliseconds() as f64 / 60_000.0).max(1.0);
                let seed = counted as f64 / minutes;
                self.tracks.insert(
                    window.kind,
                    RateTrack {
                        anchor,
                        rate: seed,
                        instantaneous: seed,
                        last_sample_at: now,
                        last_counted: counted,
                    },
                );
                (seed, seed)
            }
        }
    }

    /// Projects when the binding limit reaches `ceiling_percent` of itself.
    ///
    /// `percent_of_limit_used` stays relative to the full limit; `remaining` is
    /// what is left below the ceiling.
    pub fn project(
        &mut self,
        window: &RollingWindow,
        limits: &[LimitUsage],
        ceiling_percent: f64,
        now: DateTime<Utc>,
    ) -> Projection {
        let (rate, instantaneous) = self.rate(window, now);
        let binding = limits
            .iter()
            .max_by(|a, b| a.percent().total_cmp(&b.percent()));
        let mut projection = Projection {
            kind: window.kind,
            as_of: now,
            rate_per_minute: rate,
            instantaneous_rate_per_minute: instantaneous,
            cache_efficiency_percent: window.totals.cache_efficiency_percent(),
            percent_of_limit_used: None,
            binding_limit: None,
            remaining: None,
            estimated_exhaustion_time: None,
            already_exhausted: false,
            window_resets_at: window.resets_at(),
        };
        let Some(binding) = binding else {
            return projection;
        };
        let usable = policy::usable_budget(binding.limit, ceiling_percent);
        let remaining = i64::try_from(usable)
            .unwrap_or(i64::MAX)
            .saturating_sub(i64::try_from(binding.used).unwrap_or(i64::MAX));
        projection.percent_of_limit_used = Some(binding.percent());
        projection.binding_limit = Some(binding.label.clone());
        projection.remaining = Some(remaining);

        // Exhausted by the most recent event, so never later than `now`.
        if remaining <= 0 {
            projection.already_exhausted = true;
            projection.estimated_exhaustion_time = window
                .last_event_time
                .or(window.anchor)
                .or(Some(now));
            return projection;
        }
        let seconds_left = match binding.unit {
            LimitUnit::Tokens if rate > 0.0 => Some(remaining as f64 / rate * 60.0),
            LimitUnit::Seconds if rate > 0.0 => Some(remaining as f64),
            _ => None,
        };
        let Some(seconds_left) = seconds_left else {
            return projection;
        };
        let cap = self.config.max_projection.num_seconds() as f64;
        let at = now + Duration::seconds(seconds_left.min(cap).ceil() as i64);
        projection.estimated_exhaustion_time = match projection.window_resets_at {
            Some(resets_at) if resets_at < at => None,
            _ => Some(at),
        };
        projection
    }
}

#[cfg(test)]
mod tests {
    use budget_core::TokenUsage;
    use chrono::TimeZone;

    use super::*;

    fn window(anchor: DateTime<Utc>, counted: u64, as_of: DateTime<Utc>) -> RollingWindow {
        let mut window = RollingWindow::empty(WindowKind::ShortBlock, Duration::hours(5), as_of);
        window.anchor = Some(anchor);
        window.totals = TokenUsage {
            input_tokens: counted,
            ..TokenUsage::default()
        };
        window.event_count = 1;
        window.last_event_time = Some(as_of);
        window
    }

    fn tokens(used: u64, limit: u64) -> Vec<LimitUsage> {
        vec![LimitUsage {
            label: "short_block".to_string(),
            used,
            limit,
            unit: LimitUnit::Tokens,
        }]
    }

    #[test]
    fn seeds_from_elapsed_minutes_and_smooths() {
        let anchor = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let mut estimator = RateEstimator::default();
        let now = anchor + Duration::minutes(100);
        let (rate, _) = estimator.rate(&window(anchor, 10_000, now), now);
        assert!((rate - 100.0).abs() < 1e-9);

        // Too soon for a new sample.
        let soon = now + Duration::seconds(30);
        let (rate, _) = estimator.rate(&window(anchor, 50_000, soon), soon);
        assert!((rate - 100.0).abs() < 1e-9);

        let later = now + Duration::minutes(10);
        let (rate, instantaneous) = estimator.rate(&window(anchor, 12_000, later), later);
        assert!((instantaneous - 200.0).abs() < 1e-9);
        assert!((rate - (0.3 * 200.0 + 0.7 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn reseeds_when_anchor_changes() {
        let anchor = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let mut estimator = RateEstimator::new(EstimatorConfig::default());
        let now = anchor + Duration::minutes(10);
        estimator.rate(&window(anchor, 10_000, now), now);
        let new_anchor = anchor + Duration::hours(5);
        let now = new_anchor + Duration::seconds(20);
        let (rate, _) = estimator.rate(&window(new_anchor, 30, now), now);
        assert!((rate - 30.0).abs() < 1e-9);
    }

    #[test]
    fn exhausted_window_reports_last_event_time() {
        let anchor = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let now = anchor + Duration::hours(1);
        let mut w = window(anchor, 250_000, now);
        w.last_event_time = Some(now - Duration::minutes(3));
        let mut estimator = RateEstimator::default();
        let projection = estimator.project(&w, &tokens(250_000, 200_000), 100.0, now);
        assert!(projection.already_exhausted);
        assert_eq!(projection.remaining, Some(-50_000));
        assert_eq!(
            projection.estimated_exhaustion_time,
            Some(now - Duration::minutes(3))
        );
        assert!(projection.percent_of_limit_used.expect("percent") > 100.0);
        assert_eq!(projection.display_percent_used(), Some(100.0));
    }

    #[test]
    fn projection_is_null_when_block_resets_first() {
        let anchor = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let now = anchor + Duration::minutes(60);
        let mut estimator = RateEstimator::default();
        // 1000 tokens/min with 100k left lands at 11:00 + 100 min, before the 15:00 reset.
        let projection = estimator.project(&window(anchor, 60_000, now), &tokens(60_000, 160_000), 100.0, now);
        assert_eq!(
            projection.estimated_exhaustion_time,
            Some(now + Duration::minutes(100))
        );
        assert!(!projection.already_exhausted);

        // 10 tokens/min would need far longer than the block has left.
        let mut estimator = RateEstimator::default();
        let projection = estimator.project(&window(anchor, 600, now), &tokens(600, 160_000), 100.0, now);
        assert_eq!(projection.estimated_exhaustion_time, None);
        assert_eq!(projection.window_resets_at, Some(anchor + Duration::hours(5)));
    }

    #[test]
    fn no_limits_means_no_percent() {
        let anchor = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let now = anchor + Duration::minutes(5);
        let mut estimator = RateEstimator::default();
        let projection = estimator.project(&window(anchor, 10, now), &[], 90.0, now);
        assert_eq!(projection.percent_of_limit_used, None);
        assert_eq!(projection.estimated_exhaustion_time, None);
    }

    #[test]
    fn ceiling_counts_as_exhaustion() {
        let anchor = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let now = anchor + Duration::hours(2);
        let mut estimator = RateEstimator::default();
        let projection =
            estimator.project(&window(anchor, 181_000, now), &tokens(181_000, 200_000), 90.0, now);
        assert!(projection.already_exhausted);
        assert_eq!(projection.remaining, Some(-1_000));
        assert!((projection.percent_of_limit_used.expect("percent") - 90.5).abs() < 1e-9);
        assert_eq!(projection.estimated_exhaustion_time, Some(now));
    }
}
