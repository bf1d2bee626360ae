use std::path::{Path, PathBuf};

use budget_core::SourceFormat;

/// Directory scanned for usage logs. `format` overrides path-based detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRoot {
    pub path: PathBuf,
    pub format: Option<SourceFormat>,
}

impl SourceRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: None,
        }
    }

    pub fn with_format(path: impl Into<PathBuf>, format: SourceFormat) -> Self {
        Self {
            path: path.into(),
            format: Some(format),
        }
    }
}

pub fn default_source_roots() -> Vec<SourceRoot> {
    default_source_roots_from(|key| std::env::var(key).ok())
}

pub(crate) fn default_source_roots_from<F>(env: F) -> Vec<SourceRoot>
where
    F: Fn(&str) -> Option<String>,
{
    let mut roots = Vec::new();
    let home = env("HOME").map(PathBuf::from);

    match env("CLAUDE_CONFIG_DIR").filter(|value| !value.trim().is_empty()) {
        Some(dirs) => {
            for dir in dirs.split(',').map(str::trim).filter(|dir| !dir.is_empty()) {
                roots.push(SourceRoot::with_format(
                    PathBuf::from(dir).join("projects"),
                    SourceFormat::ClaudeJsonl,
                ));
            }
        }
        None => {
            if let Some(home) = &home {
                roots.push(SourceRoot::with_format(
                    home.join(".claude").join("projects"),
                    SourceFormat::ClaudeJsonl,
                ));
                roots.push(SourceRoot::with_format(
                    home.join(".config").join("claude").join("projects"),
                    SourceFormat::ClaudeJsonl,
                ));
            }
        }
    }

    let codex_home = env("CODEX_HOME")
        .map(PathBuf::from)
        .or_else(|| home.as_ref().map(|home| home.join(".codex")));
    if let Some(codex_home) = codex_home {
        roots.push(SourceRoot::with_format(
            codex_home.join("sessions"),
            SourceFormat::CodexJsonl,
        ));
    }

    roots.dedup();
    roots
}

/// Format from path metadata alone: Codex rollouts live under `sessions/` as `rollout-*.jsonl`.
pub fn detect_format(path: &Path) -> SourceFormat {
    let is_rollout = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("rollout-"));
    let under_sessions = path
        .components()
        .any(|component| component.as_os_str() == "sessions");
    if is_rollout || under_sessions {
        SourceFormat::CodexJsonl
    } else {
        SourceFormat::ClaudeJsonl
    }
}

pub(crate) fn is_log_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|value| value.to_str()),
        Some("jsonl") | Some("ndjson")
    )
}
