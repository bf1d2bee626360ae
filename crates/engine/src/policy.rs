use budget_core::{
    BudgetLimits, LimitUnit, LimitUsage, QuotaLimit, RollingWindow, SafetyVerdict, WindowKind,
    model_matches_pattern,
};

const MICROS_PER_PERCENT: u128 = 1_000_000;

/// Usage of `window` against every limit configured for its kind.
pub fn limit_usages(window: &RollingWindow, limits: &BudgetLimits) -> Vec<LimitUsage> {
    match window.kind {
        WindowKind::ShortBlock => vec![LimitUsage {
            label: "short_block".to_string(),
            used: window.counted_tokens(),
            limit: limits.short_block_token_limit,
            unit: LimitUnit::Tokens,
        }],
        WindowKind::LongQuota => {
            let mut usages = Vec::new();
            if let Some(limit) = limits.long_quota_token_limit {
                usages.push(LimitUsage {
                    label: "long_quota".to_string(),
                    used: window.counted_tokens(),
                    limit,
                    unit: LimitUnit::Tokens,
                });
            }
            for quota in &limits.long_quota_per_model {
                let matching = window
                    .by_model
                    .iter()
                    .filter(|(model, _)| model_matches_pattern(model, &quota.model_pattern));
                let label = format!("long_quota:{}", quota.model_pattern);
                let usage = match quota.limit {
                    QuotaLimit::Tokens(limit) => LimitUsage {
                        label,
                        used: matching.map(|(_, usage)| usage.usage.counted_tokens()).sum(),
                        limit,
                        unit: LimitUnit::Tokens,
                    },
                    QuotaLimit::Hours(hours) => LimitUsage {
                        label,
                        used: matching.map(|(_, usage)| usage.active_seconds).sum(),
                        limit: (hours.max(0.0) * 3600.0).floor() as u64,
                        unit: LimitUnit::Seconds,
                    },
                };
                usages.push(usage);
            }
            usages
        }
    }
}

/// `used / limit >= ceiling`, decided in integer micro-percent.
///
/// Usage rounds up and the ceiling rounds down, so float error can only make
/// the answer more conservative. A zero limit always exceeds.
pub fn exceeds_ceiling(used: u64, limit: u64, ceiling_percent: f64) -> bool {
    if limit == 0 {
        return true;
    }
    if !ceiling_percent.is_finite() || ceiling_percent <= 0.0 {
        return true;
    }
    let scaled = used as u128 * 100 * MICROS_PER_PERCENT;
    let limit = limit as u128;
    let used_micros = scaled.div_ceil(limit);
    let ceiling_micros = (ceiling_percent * MICROS_PER_PERCENT as f64).floor() as u128;
    used_micros >= ceiling_micros
}

/// Largest usage that stays below `ceiling_percent` of `limit`, in the same micro-percent terms.
pub fn usable_budget(limit: u64, ceiling_percent: f64) -> u64 {
    if !ceiling_percent.is_finite() || ceiling_percent <= 0.0 {
        return 0;
    }
    let ceiling_micros = (ceiling_percent.min(100.0) * MICROS_PER_PERCENT as f64).floor() as u128;
    let usable = limit as u128 * ceiling_micros / (100 * MICROS_PER_PERCENT);
    u64::try_from(usable).unwrap_or(u64::MAX)
}

pub fn check_safety(window: &RollingWindow, limits: &BudgetLimits) -> SafetyVerdict {
    let ceiling = limits.safety_ceiling_percent;
    let usages = limit_usages(window, limits);
    let verdicts = usages.iter().map(|usage| {
        let ok = !exceeds_ceiling(usage.used, usage.limit, ceiling);
        let reason = if usage.limit == 0 {
            format!("{} limit is zero", usage.label)
        } else if ok {
            format!(
                "{} at {:.3}% of {}, below the {}% ceiling",
                usage.label,
                usage.percent(),
                usage.limit,
                ceiling
            )
        } else {
            format!(
                "{} at {:.3}% of {}, at or above the {}% ceiling",
                usage.label,
                usage.percent(),
                usage.limit,
                ceiling
            )
        };
        SafetyVerdict {
            ok,
            percent_used: usage.percent(),
            reason,
            window: Some(window.kind),
        }
    });
    most_restrictive(verdicts).unwrap_or_else(|| SafetyVerdict {
        ok: true,
        percent_used: 0.0,
        reason: "no limit configured".to_string(),
        window: Some(window.kind),
    })
}

/// Combines windows; any unsafe window makes the verdict unsafe.
pub fn check_windows(windows: &[RollingWindow], limits: &BudgetLimits) -> SafetyVerdict {
    most_restrictive(windows.iter().map(|window| check_safety(window, limits))).unwrap_or_else(
        || SafetyVerdict {
            ok: true,
            percent_used: 0.0,
            reason: "no limit configured".to_string(),
            window: None,
        },
    )
}

pub fn unknown_usage_verdict() -> SafetyVerdict {
    SafetyVerdict {
        ok: false,
        percent_used: 0.0,
        reason: "usage unknown".to_string(),
        window: None,
    }
}

fn most_restrictive(verdicts: impl Iterator<Item = SafetyVerdict>) -> Option<SafetyVerdict> {
    verdicts.max_by(|a, b| {
        b.ok.cmp(&a.ok)
            .then_with(|| a.percent_used.total_cmp(&b.percent_used))
    })
}

#[cfg(test)]
mod tests {
    use budget_core::{ModelQuota, ModelUsage, TokenUsage};
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    fn short_block(counted: u64) -> RollingWindow {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let mut window = RollingWindow::empty(WindowKind::ShortBlock, Duration::hours(5), now);
        window.anchor = Some(now - Duration::hours(1));
        window.totals = TokenUsage {
            input_tokens: counted,
            cache_read_tokens: 10_000_000,
            ..TokenUsage::default()
        };
        window
    }

    #[test]
    fn ceiling_boundary_is_exact() {
        assert!(!exceeds_ceiling(89_999, 100_000, 90.0));
        assert!(exceeds_ceiling(90_000, 100_000, 90.0));
        assert!(!exceeds_ceiling(179_999, 200_000, 90.0));
        assert!(exceeds_ceiling(180_000, 200_000, 90.0));
        assert!(exceeds_ceiling(2, 3, 66.5));
        assert!(!exceeds_ceiling(2, 3, 67.0));
        assert!(exceeds_ceiling(0, 0, 90.0));
    }

    #[test]
    fn usable_budget_matches_the_ceiling() {
        assert_eq!(usable_budget(200_000, 90.0), 180_000);
        assert_eq!(usable_budget(3, 66.5), 1);
        assert_eq!(usable_budget(1_000, 100.0), 1_000);
        assert_eq!(usable_budget(1_000, 0.0), 0);
        assert!(exceeds_ceiling(usable_budget(200_000, 90.0), 200_000, 90.0));
    }

    #[test]
    fn cache_tokens_do_not_count() {
        let verdict = check_safety(&short_block(100_000), &BudgetLimits::default());
        assert!(verdict.ok);
        assert!((verdict.percent_used - 50.0).abs() < 1e-9);
    }

    #[test]
    fn zero_limit_is_unsafe() {
        let limits = BudgetLimits {
            short_block_token_limit: 0,
            ..BudgetLimits::default()
        };
        let verdict = check_safety(&short_block(0), &limits);
        assert!(!verdict.ok);
        assert!(verdict.reason.contains("zero"));
    }

    #[test]
    fn long_quota_without_limits_is_ok() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let window = RollingWindow::empty(WindowKind::LongQuota, Duration::days(7), now);
        let verdict = check_safety(&window, &BudgetLimits::default());
        assert!(verdict.ok);
        assert_eq!(verdict.reason, "no limit configured");
    }

    #[test]
    fn per_model_quotas_use_tokens_or_hours() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let mut window = RollingWindow::empty(WindowKind::LongQuota, Duration::days(7), now);
        window.by_model.insert(
            "claude-opus-4".to_string(),
            ModelUsage {
                usage: TokenUsage {
                    input_tokens: 900,
                    output_tokens: 100,
                    ..TokenUsage::default()
                },
                event_count: 4,
                active_seconds: 3 * 3600,
            },
        );
        window.by_model.insert(
            "claude-sonnet-4".to_string(),
            ModelUsage {
                usage: TokenUsage {
                    input_tokens: 5,
                    ..TokenUsage::default()
                },
                event_count: 1,
                active_seconds: 3600,
            },
        );
        let limits = BudgetLimits {
            long_quota_per_model: vec![
                ModelQuota {
                    model_pattern: "*opus*".to_string(),
                    limit: QuotaLimit::Hours(3.0),
                },
                ModelQuota {
                    model_pattern: "claude-*".to_string(),
                    limit: QuotaLimit::Tokens(2_000),
                },
            ],
            ..BudgetLimits::default()
        };
        let usages = limit_usages(&window, &limits);
        assert_eq!(usages.len(), 2);
        assert_eq!(usages[0].used, 3 * 3600);
        assert_eq!(usages[0].limit, 10_800);
        assert_eq!(usages[0].unit, LimitUnit::Seconds);
        assert_eq!(usages[1].used, 1_005);

        let verdict = check_safety(&window, &limits);
        assert!(!verdict.ok);
        assert!(verdict.reason.starts_with("long_quota:*opus*"));
    }

    #[test]
    fn most_restrictive_window_wins() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let long = RollingWindow::empty(WindowKind::LongQuota, Duration::days(7), now);
        let verdict = check_windows(&[long, short_block(190_000)], &BudgetLimits::default());
        assert!(!verdict.ok);
        assert_eq!(verdict.window, Some(WindowKind::ShortBlock));
        assert!(!unknown_usage_verdict().ok);
    }
}
