mod reload;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use budget_core::{BudgetLimits, SourceFormat};
use budget_engine::{AggregatorConfig, AlertConfig, BlockAnchor, EngineConfig, EstimatorConfig};
use chrono::Duration;
use ingest::{DEFAULT_MAX_BATCH_BYTES, SourceRoot, default_source_roots};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub use reload::{LimitsWatcher, watch_limits};

const MAX_SHORT_BLOCK_HOURS: f64 = 24.0 * 7.0;
const MAX_LONG_QUOTA_DAYS: f64 = 366.0;
const MAX_PROJECTION_DAYS: u32 = 3650;
/// Longest skew, sampling interval or cooldown accepted, in seconds.
const MAX_SETTING_SECS: u64 = 366 * 24 * 3600;

/// Everything read from `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub log_level: String,
    pub limits: BudgetLimits,
    pub windows: WindowSettings,
    pub estimator: EstimatorSettings,
    pub alerts: AlertSettings,
    pub runtime: RuntimeSettings,
    pub store: StoreSettings,
    /// Explicit log locations. Empty means the standard Claude and Codex directories.
    pub sources: Vec<SourceSettings>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            limits: BudgetLimits::default(),
            windows: WindowSettings::default(),
            estimator: EstimatorSettings::default(),
            alerts: AlertSettings::default(),
            runtime: RuntimeSettings::default(),
            store: StoreSettings::default(),
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    pub short_block_hours: f64,
    pub long_quota_days: f64,
    pub bucket_minutes: u32,
    pub max_future_skew_secs: u64,
    pub anchor: BlockAnchor,
    pub dedupe_capacity: usize,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            short_block_hours: 5.0,
            long_quota_days: 7.0,
            bucket_minutes: 60,
            max_future_skew_secs: 600,
            anchor: BlockAnchor::FirstEvent,
            dedupe_capacity: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorSettings {
    pub alpha: f64,
    pub min_sample_secs: u64,
    pub max_projection_days: u32,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            min_sample_secs: 60,
            max_projection_days: 365,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub info_percent: f64,
    pub warning_percent: f64,
    pub critical_percent: f64,
    pub hysteresis_percent: f64,
    pub info_cooldown_secs: u64,
    pub warning_cooldown_secs: u64,
    pub critical_cooldown_secs: u64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            info_percent: 25.0,
            warning_percent: 50.0,
            critical_percent: 90.0,
            hysteresis_percent: 5.0,
            info_cooldown_secs: 60,
            warning_cooldown_secs: 180,
            critical_cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub event_queue_capacity: usize,
    pub notification_queue_capacity: usize,
    pub command_queue_capacity: usize,
    pub poll_interval_ms: u64,
    pub max_backoff_secs: u64,
    pub tick_interval_secs: u64,
    pub discovery_interval_secs: u64,
    pub max_batch_bytes: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            event_queue_capacity: 1024,
            notification_queue_capacity: 64,
            command_queue_capacity: 32,
            poll_interval_ms: 500,
            max_backoff_secs: 10,
            tick_interval_secs: 30,
            discovery_interval_secs: 15,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
        }
    }
}

impl RuntimeSettings {
    pub fn poll_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.poll_interval_ms)
    }

    pub fn max_backoff(&self) -> StdDuration {
        StdDuration::from_secs(self.max_backoff_secs).max(self.poll_interval())
    }

    pub fn tick_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.tick_interval_secs)
    }

    pub fn discovery_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.discovery_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Handoff snapshots kept after each save.
    pub keep_snapshots: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self { keep_snapshots: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub path: PathBuf,
    /// Forces a dialect; detected from the path when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<SourceFormat>,
}

impl MonitorConfig {
    pub fn engine_config(&self) -> EngineConfig {
        let windows = &self.windows;
        let alerts = &self.alerts;
        EngineConfig {
            aggregator: AggregatorConfig {
                short_block_length: hours(windows.short_block_hours),
                long_quota_length: hours(windows.long_quota_days * 24.0),
                bucket_width: Duration::minutes(i64::from(windows.bucket_minutes)),
                max_future_skew: Duration::seconds(windows.max_future_skew_secs as i64),
                anchor: windows.anchor,
                dedupe_capacity: windows.dedupe_capacity,
            },
            estimator: EstimatorConfig {
                alpha: self.estimator.alpha,
                min_sample_interval: Duration::seconds(self.estimator.min_sample_secs as i64),
                max_projection: Duration::days(i64::from(self.estimator.max_projection_days)),
            },
            alerts: AlertConfig {
                info_percent: alerts.info_percent,
                warning_percent: alerts.warning_percent,
                critical_percent: alerts.critical_percent,
                hysteresis_percent: alerts.hysteresis_percent,
                info_cooldown: Duration::seconds(alerts.info_cooldown_secs as i64),
                warning_cooldown: Duration::seconds(alerts.warning_cooldown_secs as i64),
                critical_cooldown: Duration::seconds(alerts.critical_cooldown_secs as i64),
            },
        }
    }

    pub fn source_roots(&self) -> Vec<SourceRoot> {
        if self.sources.is_empty() {
            return default_source_roots();
        }
        self.sources
            .iter()
            .map(|source| match source.format {
                Some(format) => SourceRoot::with_format(&source.path, format),
                None => SourceRoot::new(&source.path),
            })
            .collect()
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        self.limits.validate()?;
        let windows = &self.windows;
        if !(windows.short_block_hours.is_finite() && windows.short_block_hours > 0.0) {
            return Err("windows.short_block_hours must be positive".to_string());
        }
        if windows.short_block_hours > MAX_SHORT_BLOCK_HOURS {
            return Err(format!(
                "windows.short_block_hours must be at most {}",
                MAX_SHORT_BLOCK_HOURS
            ));
        }
        if !(windows.long_quota_days.is_finite() && windows.long_quota_days > 0.0) {
            return Err("windows.long_quota_days must be positive".to_string());
        }
        if windows.long_quota_days > MAX_LONG_QUOTA_DAYS {
            return Err(format!(
                "windows.long_quota_days must be at most {}",
                MAX_LONG_QUOTA_DAYS
            ));
        }
        if windows.bucket_minutes == 0 {
            return Err("windows.bucket_minutes must be positive".to_string());
        }
        if self.estimator.max_projection_days > MAX_PROJECTION_DAYS {
            return Err(format!(
                "estimator.max_projection_days must be at most {}",
                MAX_PROJECTION_DAYS
            ));
        }
        let alerts = &self.alerts;
        for (name, secs) in [
            ("windows.max_future_skew_secs", windows.max_future_skew_secs),
            ("estimator.min_sample_secs", self.estimator.min_sample_secs),
            ("alerts.info_cooldown_secs", alerts.info_cooldown_secs),
            ("alerts.warning_cooldown_secs", alerts.warning_cooldown_secs),
            ("alerts.critical_cooldown_secs", alerts.critical_cooldown_secs),
        ] {
            if secs > MAX_SETTING_SECS {
                return Err(format!("{} must be at most {}", name, MAX_SETTING_SECS));
            }
        }
        let runtime = &self.runtime;
        if runtime.event_queue_capacity == 0
            || runtime.notification_queue_capacity == 0
            || runtime.command_queue_capacity == 0
        {
            return Err("runtime queue capacities must be positive".to_string());
        }
        if runtime.poll_interval_ms == 0 || runtime.tick_interval_secs == 0 {
            return Err("runtime poll and tick intervals must be positive".to_string());
        }
        if runtime.discovery_interval_secs == 0 {
            return Err("runtime.discovery_interval_secs must be positive".to_string());
        }
        if runtime.max_batch_bytes == 0 {
            return Err("runtime.max_batch_bytes must be positive".to_string());
        }
        self.engine_config().validate()
    }
}

fn hours(value: f64) -> Duration {
    Duration::milliseconds((value * 3_600_000.0).round() as i64)
}

#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: MonitorConfig,
    pub path: PathBuf,
    pub created: bool,
}

/// Parses and validates the config at `path`.
pub fn load(path: &Path) -> Result<MonitorConfig> {
    let contents = fs::read_to_string(path)
        .map_err(|err| AppError::Config(format!("read config {}: {}", path.display(), err)))?;
    parse(&contents).map_err(|err| AppError::Config(format!("{}: {}", path.display(), err)))
}

pub fn parse(contents: &str) -> std::result::Result<MonitorConfig, String> {
    let config: MonitorConfig =
        toml::from_str(contents).map_err(|err| format!("parse config: {}", err))?;
    config.validate()?;
    Ok(config)
}

/// Loads `path`, writing the defaults there first if it does not exist.
pub fn load_or_create(path: &Path) -> Result<ConfigLoad> {
    if path.exists() {
        return Ok(ConfigLoad {
            config: load(path)?,
            path: path.to_path_buf(),
            created: false,
        });
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|err| {
            AppError::Config(format!("create config dir {}: {}", dir.display(), err))
        })?;
    }
    let config = MonitorConfig::default();
    let contents = toml::to_string_pretty(&config)
        .map_err(|err| AppError::Config(format!("serialize config: {}", err)))?;
    fs::write(path, contents)
        .map_err(|err| AppError::Config(format!("write config {}: {}", path.display(), err)))?;
    Ok(ConfigLoad {
        config,
        path: path.to_path_buf(),
        created: true,
    })
}
