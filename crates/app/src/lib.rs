pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod monitor;
pub mod notifier;
pub mod startup;

pub use config::{ConfigLoad, LimitsWatcher, MonitorConfig, load_or_create, watch_limits};
pub use error::{AppError, Result};
pub use health::HealthTracker;
pub use monitor::{Monitor, MonitorHandle, StartupReport};
pub use notifier::{LogNotifier, NotificationQueue, Notifier, spawn_dispatcher};
pub use startup::{AppPaths, ensure_app_data_dir};
