use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("db error: {0}")]
    Db(#[from] budget_db::DbError),
    #[error("store error: {0}")]
    Store(#[from] budget_core::StoreError),
    #[error("ingest error: {0}")]
    Ingest(#[from] ingest::IngestError),
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("monitor is not running")]
    MonitorStopped,
    #[error("{0}")]
    Message(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
