use std::path::PathBuf;

const DB_FILE_NAME: &str = "budget-monitor.sqlite";

#[derive(Debug, Clone)]
pub struct DataDirResolution {
    pub dir: PathBuf,
    pub matched_existing: bool,
}

pub fn resolve_data_dir() -> Result<DataDirResolution, String> {
    resolve_from(|key| std::env::var(key).ok())
}

fn resolve_from<F>(env: F) -> Result<DataDirResolution, String>
where
    F: Fn(&str) -> Option<String>,
{
    let xdg = env("XDG_DATA_HOME")
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from);
    let home = env("HOME")
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from);

    let mut candidates = Vec::new();
    if let Some(xdg) = &xdg {
        candidates.push(xdg.join("budget-monitor"));
    }
    if let Some(home) = &home {
        candidates.push(home.join(".local").join("share").join("budget-monitor"));
        candidates.push(
            home.join("Library")
                .join("Application Support")
                .join("budget-monitor"),
        );
    }
    let Some(default) = candidates.first().cloned() else {
        return Err("resolve data dir: neither XDG_DATA_HOME nor HOME is set".to_string());
    };

    for candidate in candidates {
        if candidate.join(DB_FILE_NAME).exists() {
            return Ok(DataDirResolution {
                dir: candidate,
                matched_existing: true,
            });
        }
    }

    Ok(DataDirResolution {
        dir: default,
        matched_existing: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_an_existing_database() {
        let home = std::env::temp_dir().join(format!("budget-monitor-dirs-{}", std::process::id()));
        let existing = home.join("Library").join("Application Support").join("budget-monitor");
        std::fs::create_dir_all(&existing).expect("create dir");
        std::fs::write(existing.join(DB_FILE_NAME), b"").expect("touch db");

        let home_str = home.to_string_lossy().to_string();
        let resolved = resolve_from(|key| (key == "HOME").then(|| home_str.clone())).expect("resolve");
        assert!(resolved.matched_existing);
        assert_eq!(resolved.dir, existing);
        std::fs::remove_dir_all(&home).expect("cleanup");
    }

    #[test]
    fn xdg_wins_when_nothing_exists() {
        let resolved = resolve_from(|key| match key {
            "XDG_DATA_HOME" => Some("/nonexistent/xdg".to_string()),
            "HOME" => Some("/nonexistent/home".to_string()),
            _ => None,
        })
        .expect("resolve");
        assert!(!resolved.matched_existing);
        assert_eq!(resolved.dir, PathBuf::from("/nonexistent/xdg/budget-monitor"));
        assert!(resolve_from(|_| None).is_err());
    }
}
