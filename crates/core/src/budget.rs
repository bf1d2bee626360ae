use serde::{Deserialize, Serialize};

use crate::window::WindowKind;

pub const DEFAULT_SHORT_BLOCK_TOKEN_LIMIT: u64 = 200_000;
pub const DEFAULT_SAFETY_CEILING_PERCENT: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaLimit {
    Tokens(u64),
    /// Active hours, measured in LongQuota buckets in which the model was used.
    Hours(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelQuota {
    pub model_pattern: String,
    pub limit: QuotaLimit,
}

/// Hard limits. Loaded at startup and replaced as a whole on reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub short_block_token_limit: u64,
    pub long_quota_token_limit: Option<u64>,
    pub long_quota_per_model: Vec<ModelQuota>,
    pub safety_ceiling_percent: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            short_block_token_limit: DEFAULT_SHORT_BLOCK_TOKEN_LIMIT,
            long_quota_token_limit: None,
            long_quota_per_model: Vec::new(),
            safety_ceiling_percent: DEFAULT_SAFETY_CEILING_PERCENT,
        }
    }
}

impl BudgetLimits {
    pub fn validate(&self) -> Result<(), String> {
        let ceiling = self.safety_ceiling_percent;
        if !ceiling.is_finite() || ceiling <= 0.0 || ceiling > 100.0 {
            return Err(format!(
                "safety_ceiling_percent must be in (0, 100], got {}",
                ceiling
            ));
        }
        for quota in &self.long_quota_per_model {
            if quota.model_pattern.trim().is_empty() {
                return Err("long_quota_per_model entry has an empty model_pattern".to_string());
            }
            if let QuotaLimit::Hours(hours) = quota.limit
                && (!hours.is_finite() || hours < 0.0)
            {
                return Err(format!(
                    "hours limit for {} must be a non-negative number",
                    quota.model_pattern
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitUnit {
    Tokens,
    Seconds,
}

/// Usage measured against one configured limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitUsage {
    pub label: String,
    pub used: u64,
    pub limit: u64,
    pub unit: LimitUnit,
}

impl LimitUsage {
    /// Raw percentage for display and alerting; infinite against a zero limit.
    pub fn percent(&self) -> f64 {
        if self.limit == 0 {
            return if self.used == 0 { 0.0 } else { f64::INFINITY };
        }
        (self.used as f64 / self.limit as f64) * 100.0
    }

    pub fn remaining(&self) -> i64 {
        let remaining = self.limit as i128 - self.used as i128;
        remaining.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub ok: bool,
    pub percent_used: f64,
    pub reason: String,
    pub window: Option<WindowKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_valid() {
        let limits = BudgetLimits::default();
        assert_eq!(limits.safety_ceiling_percent, 90.0);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn ceiling_outside_range_is_rejected() {
        for ceiling in [0.0, -1.0, 100.5, f64::NAN] {
            let limits = BudgetLimits {
                safety_ceiling_percent: ceiling,
                ..BudgetLimits::default()
            };
            assert!(limits.validate().is_err(), "ceiling {ceiling} accepted");
        }
    }

    #[test]
    fn limit_usage_percent_handles_zero_limit() {
        let usage = LimitUsage {
            label: "short_block".to_string(),
            used: 10,
            limit: 0,
            unit: LimitUnit::Tokens,
        };
        assert!(usage.percent().is_infinite());
        assert_eq!(usage.remaining(), -10);
    }
}
