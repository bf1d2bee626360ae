use std::collections::BTreeMap;

use budget_core::{
    AlertPhase, AlertState, AlertTier, AlertTransition, Notification, Projection, WindowKind,
};
use chrono::{DateTime, Duration, Utc};

/// Upper bound for the Critical cooldown and any Critical snooze.
pub const MAX_CRITICAL_COOLDOWN_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct AlertConfig {
    pub info_percent: f64,
    pub warning_percent: f64,
    pub critical_percent: f64,
    /// Points below a threshold before a fired tier re-arms.
    pub hysteresis_percent: f64,
    pub info_cooldown: Duration,
    pub warning_cooldown: Duration,
    pub critical_cooldown: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            info_percent: AlertTier::Info.default_threshold_percent(),
            warning_percent: AlertTier::Warning.default_threshold_percent(),
            critical_percent: AlertTier::Critical.default_threshold_percent(),
            hysteresis_percent: 5.0,
            info_cooldown: Duration::seconds(60),
            warning_cooldown: Duration::seconds(180),
            critical_cooldown: Duration::seconds(MAX_CRITICAL_COOLDOWN_SECS),
        }
    }
}

impl AlertConfig {
    /// Caps the Critical threshold at the safety ceiling.
    pub fn with_ceiling(mut self, ceiling_percent: f64) -> Self {
        if ceiling_percent.is_finite() {
            self.critical_percent = self.critical_percent.min(ceiling_percent);
        }
        self
    }

    pub fn threshold(&self, tier: AlertTier) -> f64 {
        match tier {
            AlertTier::Info => self.info_percent,
            AlertTier::Warning => self.warning_percent,
            AlertTier::Critical => self.critical_percent,
        }
    }

    pub fn cooldown(&self, tier: AlertTier) -> Duration {
        match tier {
            AlertTier::Info => self.info_cooldown,
            AlertTier::Warning => self.warning_cooldown,
            AlertTier::Critical => self
                .critical_cooldown
                .min(Duration::seconds(MAX_CRITICAL_COOLDOWN_SECS)),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let thresholds = [self.info_percent, self.warning_percent, self.critical_percent];
        if thresholds.iter().any(|value| !value.is_finite() || *value <= 0.0) {
            return Err("alert thresholds must be positive".to_string());
        }
        if !(self.info_percent <= self.warning_percent
            && self.warning_percent <= self.critical_percent)
        {
            return Err("alert thresholds must increase with severity".to_string());
        }
        if !self.hysteresis_percent.is_finite() || self.hysteresis_percent < 0.0 {
            return Err("hysteresis must not be negative".to_string());
        }
        if [self.info_cooldown, self.warning_cooldown, self.critical_cooldown]
            .iter()
            .any(|cooldown| *cooldown < Duration::zero())
        {
            return Err("cooldowns must not be negative".to_string());
        }
        Ok(())
    }
}

/// One state machine per (window kind, tier).
#[derive(Debug, Clone)]
pub struct AlertEngine {
    config: AlertConfig,
    states: BTreeMap<(WindowKind, AlertTier), AlertState>,
}

impl AlertEngine {
    pub fn new(config: AlertConfig) -> Self {
        let mut states = BTreeMap::new();
        for kind in WindowKind::ALL {
            for tier in AlertTier::ALL {
                states.insert((kind, tier), AlertState::idle(kind, tier));
            }
        }
        Self { config, states }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: AlertConfig) {
        self.config = config;
    }

    /// Advances every tier of `projection.kind`, lowest tier first.
    pub fn evaluate(&mut self, projection: &Projection) -> Vec<AlertTransition> {
        let now = projection.as_of;
        let percent = projection
            .percent_of_limit_used
            .filter(|value| !value.is_nan())
            .unwrap_or(0.0);
        let mut transitions = Vec::new();
        for tier in AlertTier::ALL {
            let threshold = self.config.threshold(tier);
            let cooldown = self.config.cooldown(tier);
            let hysteresis = self.config.hysteresis_percent;
            let state = self
                .states
                .entry((projection.kind, tier))
                .or_insert_with(|| AlertState::idle(projection.kind, tier));
            let from = state.phase;
            match from {
                AlertPhase::Idle => {
                    if percent >= threshold && !state.is_suppressed_at(now) {
                        fire(state, now, cooldown);
                        transitions.push(transition(state, from, now, Some(percent), true));
                    }
                }
                AlertPhase::Fired | AlertPhase::Acknowledged | AlertPhase::Suppressed => {
                    if percent < threshold - hysteresis {
                        state.phase = AlertPhase::Idle;
                        state.acknowledged = false;
                        transitions.push(transition(state, from, now, Some(percent), false));
                    } else if tier == AlertTier::Critical
                        && percent >= threshold
                        && !state.is_suppressed_at(now)
                    {
                        fire(state, now, cooldown);
                        transitions.push(transition(state, from, now, Some(percent), true));
                    }
                }
            }
        }
        transitions
    }

    pub fn acknowledge(
        &mut self,
        kind: WindowKind,
        tier: AlertTier,
        now: DateTime<Utc>,
    ) -> Option<AlertTransition> {
        let state = self.states.get_mut(&(kind, tier))?;
        if state.phase != AlertPhase::Fired {
            return None;
        }
        let from = state.phase;
        state.phase = AlertPhase::Acknowledged;
        state.acknowledged = true;
        Some(transition(state, from, now, None, false))
    }

    /// Snoozes a tier until `until`. Critical snoozes are capped at five minutes.
    pub fn suppress(
        &mut self,
        kind: WindowKind,
        tier: AlertTier,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<AlertTransition> {
        let until = match tier {
            AlertTier::Critical => until.min(now + Duration::seconds(MAX_CRITICAL_COOLDOWN_SECS)),
            _ => until,
        };
        let state = self.states.get_mut(&(kind, tier))?;
        state.suppress_until = Some(until);
        if state.phase == AlertPhase::Idle {
            return None;
        }
        let from = state.phase;
        state.phase = AlertPhase::Suppressed;
        state.acknowledged = true;
        Some(transition(state, from, now, None, false))
    }

    /// Re-arms every tier of a window that just closed.
    pub fn reset_window(&mut self, kind: WindowKind, now: DateTime<Utc>) -> Vec<AlertTransition> {
        let mut transitions = Vec::new();
        for tier in AlertTier::ALL {
            if let Some(state) = self.states.get_mut(&(kind, tier)) {
                let from = state.phase;
                state.suppress_until = None;
                state.acknowledged = false;
                if from != AlertPhase::Idle {
                    state.phase = AlertPhase::Idle;
                    transitions.push(transition(state, from, now, None, false));
                }
            }
        }
        transitions
    }

    pub fn states(&self) -> Vec<AlertState> {
        self.states.values().cloned().collect()
    }

    pub fn active(&self) -> Vec<AlertState> {
        self.states
            .values()
            .filter(|state| state.phase != AlertPhase::Idle)
            .cloned()
            .collect()
    }

    /// Loads states saved at `saved_at`. A Critical snooze never outlasts the
    /// bounded cooldown measured from that save.
    pub fn restore(&mut self, states: &[AlertState], saved_at: DateTime<Utc>) {
        let critical_cap = saved_at + self.config.cooldown(AlertTier::Critical);
        for state in states {
            let mut state = state.clone();
            if state.tier == AlertTier::Critical
                && let Some(until) = state.suppress_until
            {
                state.suppress_until = Some(until.min(critical_cap));
            }
            self.states.insert((state.kind, state.tier), state);
        }
    }

    pub fn notification_for(&self, transition: &AlertTransition) -> Notification {
        let threshold = self.config.threshold(transition.tier);
        let message = match transition.percent_used {
            Some(percent) => format!(
                "{} usage at {:.1}% reached the {} threshold of {:.0}%",
                transition.kind, percent, transition.tier, threshold
            ),
            None => format!(
                "{} usage reached the {} threshold of {:.0}%",
                transition.kind, transition.tier, threshold
            ),
        };
        Notification {
            tier: transition.tier,
            window: transition.kind,
            message,
            at: transition.at,
            percent_used: transition.percent_used,
        }
    }
}

fn fire(state: &mut AlertState, now: DateTime<Utc>, cooldown: Duration) {
    state.phase = AlertPhase::Fired;
    state.acknowledged = false;
    state.last_fired_at = Some(now);
    state.suppress_until = Some(now + cooldown);
    state.fire_count = state.fire_count.saturating_add(1);
}

fn transition(
    state: &AlertState,
    from: AlertPhase,
    at: DateTime<Utc>,
    percent_used: Option<f64>,
    notify: bool,
) -> AlertTransition {
    AlertTransition {
        kind: state.kind,
        tier: state.tier,
        from,
        to: state.phase,
        at,
        percent_used,
        notify,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn projection(percent: f64, at: DateTime<Utc>) -> Projection {
        Projection {
            kind: WindowKind::ShortBlock,
            as_of: at,
            rate_per_minute: 0.0,
            instantaneous_rate_per_minute: 0.0,
            cache_efficiency_percent: 0.0,
            percent_of_limit_used: Some(percent),
            binding_limit: Some("short_block".to_string()),
            remaining: None,
            estimated_exhaustion_time: None,
            already_exhausted: false,
            window_resets_at: None,
        }
    }

    fn fired(transitions: &[AlertTransition]) -> Vec<AlertTier> {
        transitions
            .iter()
            .filter(|transition| transition.notify)
            .map(|transition| transition.tier)
            .collect()
    }

    #[test]
    fn escalates_once_per_tier() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let mut engine = AlertEngine::new(AlertConfig::default());
        assert!(fired(&engine.evaluate(&projection(10.0, t0))).is_empty());
        assert_eq!(
            fired(&engine.evaluate(&projection(30.0, t0 + Duration::minutes(1)))),
            vec![AlertTier::Info]
        );
        assert!(fired(&engine.evaluate(&projection(40.0, t0 + Duration::minutes(5)))).is_empty());
        assert_eq!(
            fired(&engine.evaluate(&projection(95.0, t0 + Duration::minutes(6)))),
            vec![AlertTier::Warning, AlertTier::Critical]
        );
    }

    #[test]
    fn critical_refires_after_bounded_cooldown_even_when_acknowledged() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let config = AlertConfig {
            critical_cooldown: Duration::hours(2),
            ..AlertConfig::default()
        };
        let mut engine = AlertEngine::new(config);
        engine.evaluate(&projection(92.0, t0));
        assert!(engine
            .acknowledge(WindowKind::ShortBlock, AlertTier::Critical, t0)
            .is_some());
        let soon = engine.evaluate(&projection(93.0, t0 + Duration::minutes(4)));
        assert!(fired(&soon).is_empty());
        let later = engine.evaluate(&projection(93.0, t0 + Duration::minutes(5)));
        assert_eq!(fired(&later), vec![AlertTier::Critical]);
    }

    #[test]
    fn rearms_below_hysteresis_and_respects_cooldown() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let mut engine = AlertEngine::new(AlertConfig::default());
        engine.evaluate(&projection(26.0, t0));
        // Inside the hysteresis band: stays fired.
        engine.evaluate(&projection(21.0, t0 + Duration::seconds(10)));
        assert_eq!(engine.active().len(), 1);
        engine.evaluate(&projection(19.0, t0 + Duration::seconds(20)));
        assert!(engine.active().is_empty());
        // Re-armed but still cooling down.
        assert!(fired(&engine.evaluate(&projection(26.0, t0 + Duration::seconds(30)))).is_empty());
        assert_eq!(
            fired(&engine.evaluate(&projection(26.0, t0 + Duration::seconds(61)))),
            vec![AlertTier::Info]
        );
    }

    #[test]
    fn critical_snooze_is_capped() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let mut engine = AlertEngine::new(AlertConfig::default());
        engine.evaluate(&projection(95.0, t0));
        engine.suppress(
            WindowKind::ShortBlock,
            AlertTier::Critical,
            t0 + Duration::hours(3),
            t0,
        );
        let state = engine
            .states()
            .into_iter()
            .find(|state| state.tier == AlertTier::Critical && state.kind == WindowKind::ShortBlock)
            .expect("critical state");
        assert_eq!(state.phase, AlertPhase::Suppressed);
        assert_eq!(state.suppress_until, Some(t0 + Duration::minutes(5)));
    }

    #[test]
    fn ceiling_caps_critical_threshold() {
        let config = AlertConfig::default().with_ceiling(80.0);
        assert_eq!(config.threshold(AlertTier::Critical), 80.0);
        let config = AlertConfig::default().with_ceiling(99.0);
        assert_eq!(config.threshold(AlertTier::Critical), 90.0);
    }

    #[test]
    fn reset_window_rearms_all_tiers() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let mut engine = AlertEngine::new(AlertConfig::default());
        engine.evaluate(&projection(60.0, t0));
        let transitions = engine.reset_window(WindowKind::ShortBlock, t0 + Duration::minutes(1));
        assert_eq!(transitions.len(), 2);
        assert!(engine.active().is_empty());
        assert_eq!(
            fired(&engine.evaluate(&projection(30.0, t0 + Duration::minutes(2)))),
            vec![AlertTier::Info]
        );
    }

    #[test]
    fn restored_critical_snooze_is_capped_from_save_time() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let mut states = vec![
            AlertState::idle(WindowKind::ShortBlock, AlertTier::Critical),
            AlertState::idle(WindowKind::ShortBlock, AlertTier::Warning),
        ];
        for state in &mut states {
            state.phase = AlertPhase::Fired;
            state.last_fired_at = Some(t0);
            state.suppress_until = Some(t0 + Duration::hours(3));
        }

        let mut engine = AlertEngine::new(AlertConfig::default());
        engine.restore(&states, t0);
        let restored = engine.states();
        let critical = restored
            .iter()
            .find(|state| state.kind == WindowKind::ShortBlock && state.tier == AlertTier::Critical)
            .expect("critical");
        assert_eq!(
            critical.suppress_until,
            Some(t0 + Duration::seconds(MAX_CRITICAL_COOLDOWN_SECS))
        );
        let warning = restored
            .iter()
            .find(|state| state.kind == WindowKind::ShortBlock && state.tier == AlertTier::Warning)
            .expect("warning");
        assert_eq!(warning.suppress_until, Some(t0 + Duration::hours(3)));

        let refired = engine.evaluate(&projection(95.0, t0 + Duration::minutes(5)));
        assert!(fired(&refired).contains(&AlertTier::Critical));
        assert!(!fired(&refired).contains(&AlertTier::Warning));
    }
}
