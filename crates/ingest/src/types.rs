use std::fmt;
use std::io;
use std::path::PathBuf;

use budget_core::{SourceCursor, SourceFormat};
use serde::Serialize;

/// One append-only log known to a [`crate::UsageSource`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceHandle {
    pub id: String,
    pub path: PathBuf,
    pub format: SourceFormat,
}

/// Trailing bytes after the last newline. Not consumed by the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialLine {
    pub text: String,
    pub len: u64,
}

/// Complete lines read from one source since a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    pub lines: Vec<String>,
    /// Position after the last complete line.
    pub cursor: SourceCursor,
    pub bytes_read: u64,
    /// The file was replaced or truncated and reading restarted at 0.
    pub rotated: bool,
    /// Stopped at the byte bound with data left to read.
    pub more: bool,
    pub partial: Option<PartialLine>,
}

/// Point-in-time facts about a source, used to skip stale files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    pub len: u64,
    pub file_id: Option<u64>,
    pub modified: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    Truncated,
    InvalidJson,
    MissingField,
    InvalidTimestamp,
    InvalidNumber,
}

impl ParseErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Truncated => "truncated",
            Self::InvalidJson => "invalid_json",
            Self::MissingField => "missing_field",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::InvalidNumber => "invalid_number",
        }
    }
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A line that could not become an event. Never fatal to the stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    /// The line may complete on a later read.
    pub recoverable: bool,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self {
            recoverable: kind == ParseErrorKind::Truncated,
            kind,
            message: message.into(),
        }
    }
}

/// Summary returned after the startup backfill.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillStats {
    pub files_scanned: usize,
    pub files_skipped: usize,
    pub events_parsed: usize,
    pub events_outside_horizon: usize,
    pub bytes_read: u64,
    pub parse_errors: u64,
    pub recoverable_parse_errors: u64,
    pub issues: Vec<IngestIssue>,
}

/// Non-fatal issues encountered during ingest.
#[derive(Debug, Clone, Serialize)]
pub struct IngestIssue {
    pub file_path: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;
