use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use budget_core::BudgetLimits;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;

use crate::error::{AppError, Result};

/// Keeps the config file watcher alive. Dropping it stops reloads.
pub struct LimitsWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl LimitsWatcher {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Re-reads `path` on every change and publishes its `[limits]` table.
///
/// A file that fails to parse or validate is logged and ignored; the limits
/// already published stay in force.
pub fn watch_limits(
    path: &Path,
    sender: Arc<watch::Sender<Arc<BudgetLimits>>>,
) -> Result<LimitsWatcher> {
    let file_name: OsString = path
        .file_name()
        .ok_or_else(|| AppError::Config(format!("{} is not a file path", path.display())))?
        .to_os_string();
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let config_path = path.to_path_buf();

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "config watcher error");
                return;
            }
        };
        if matches!(event.kind, EventKind::Access(_) | EventKind::Remove(_)) {
            return;
        }
        let touches_config = event
            .paths
            .iter()
            .any(|changed| changed.file_name() == Some(file_name.as_os_str()));
        if touches_config {
            reload_limits(&config_path, &sender);
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    tracing::info!(path = %path.display(), "watching config for limit changes");

    Ok(LimitsWatcher {
        _watcher: watcher,
        path: path.to_path_buf(),
    })
}

/// Returns true when new limits were published.
pub(crate) fn reload_limits(path: &Path, sender: &watch::Sender<Arc<BudgetLimits>>) -> bool {
    let config = match super::load(path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "config reload rejected; keeping current limits");
            return false;
        }
    };
    let limits = config.limits;
    let changed = sender.send_if_modified(|current| {
        if **current == limits {
            return false;
        }
        *current = Arc::new(limits.clone());
        true
    });
    if changed {
        tracing::info!(
            short_block_token_limit = limits.short_block_token_limit,
            safety_ceiling_percent = limits.safety_ceiling_percent,
            "budget limits reloaded"
        );
    }
    changed
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn valid_changes_are_published_and_invalid_ones_ignored() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        let (sender, receiver) = watch::channel(Arc::new(BudgetLimits::default()));

        fs::write(&path, "[limits]\nshort_block_token_limit = 1000\n").expect("write");
        assert!(reload_limits(&path, &sender));
        assert_eq!(receiver.borrow().short_block_token_limit, 1_000);

        assert!(!reload_limits(&path, &sender), "unchanged file republished");

        fs::write(&path, "[limits]\nsafety_ceiling_percent = 0.0\n").expect("write");
        assert!(!reload_limits(&path, &sender));
        assert_eq!(receiver.borrow().short_block_token_limit, 1_000);
        assert_eq!(receiver.borrow().safety_ceiling_percent, 90.0);
    }
}
