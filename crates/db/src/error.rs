use budget_core::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("time parse error: {0}")]
    TimeParse(#[from] chrono::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("snapshot sequence {sequence} is not newer than stored {latest}")]
    Replay { sequence: u64, latest: u64 },
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Replay { sequence, latest } => StoreError::Replay { sequence, latest },
            DbError::Corrupt(message) => StoreError::Corrupt(message),
            DbError::Json(err) => StoreError::Corrupt(err.to_string()),
            DbError::TimeParse(err) => StoreError::Corrupt(err.to_string()),
            DbError::Sqlite(err) => StoreError::Backend(err.to_string()),
        }
    }
}
