use std::path::PathBuf;

use crate::Result;

const DB_FILE_NAME: &str = "budget-monitor.sqlite";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Clone, Debug)]
pub struct AppPaths {
    pub app_data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
}

impl AppPaths {
    pub fn new(app_data_dir: PathBuf) -> Self {
        let db_path = app_data_dir.join(DB_FILE_NAME);
        let config_path = app_data_dir.join(CONFIG_FILE_NAME);
        Self {
            app_data_dir,
            db_path,
            config_path,
        }
    }

    pub fn with_config_path(mut self, config_path: PathBuf) -> Self {
        self.config_path = config_path;
        self
    }
}

pub fn ensure_app_data_dir(paths: &AppPaths) -> Result<()> {
    std::fs::create_dir_all(&paths.app_data_dir)?;
    Ok(())
}
