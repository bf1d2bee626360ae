use std::collections::BTreeMap;
use std::time::Instant;

use budget_core::{SourceCursor, UsageEvent};
use chrono::{DateTime, Utc};
use rayon::prelude::*;

use crate::parser::StreamParser;
use crate::source::{UsageSource, cursor_is_stale};
use crate::types::{BackfillStats, IngestIssue, SourceHandle};

struct FileTask {
    handle: SourceHandle,
    cursor: SourceCursor,
}

struct ParsedFile {
    source: String,
    cursor: SourceCursor,
    events: Vec<UsageEvent>,
    outside_horizon: usize,
    bytes_read: u64,
    parse_errors: u64,
    recoverable_parse_errors: u64,
    issues: Vec<IngestIssue>,
    skipped: bool,
}

impl ParsedFile {
    fn skipped(task: FileTask, cursor: SourceCursor, issue: Option<IngestIssue>) -> Self {
        Self {
            source: task.handle.id,
            cursor,
            events: Vec::new(),
            outside_horizon: 0,
            bytes_read: 0,
            parse_errors: 0,
            recoverable_parse_errors: 0,
            issues: issue.into_iter().collect(),
            skipped: true,
        }
    }
}

/// Startup catch-up: every source read from its cursor, merged in timestamp order.
#[derive(Debug, Default)]
pub struct Backfill {
    /// Sorted by timestamp; ties keep per-source order.
    pub events: Vec<UsageEvent>,
    /// Position after the backfill for every source that was read or skipped.
    pub cursors: BTreeMap<String, SourceCursor>,
    pub stats: BackfillStats,
}

fn parse_file<S: UsageSource + ?Sized>(
    source: &S,
    task: FileTask,
    horizon: DateTime<Utc>,
) -> ParsedFile {
    let info = match source.describe(&task.handle) {
        Ok(info) => info,
        Err(err) => {
            let issue = IngestIssue {
                file_path: task.handle.id.clone(),
                message: err.to_string(),
            };
            let cursor = task.cursor.clone();
            return ParsedFile::skipped(task, cursor, Some(issue));
        }
    };
    if info.modified.is_some_and(|modified| modified < horizon) {
        // Nothing in the file can fall inside a window; start tailing at the end.
        let cursor = if cursor_is_stale(&task.cursor, info.len, info.file_id) {
            SourceCursor {
                offset: info.len,
                file_id: info.file_id,
                ..SourceCursor::default()
            }
        } else {
            SourceCursor {
                offset: info.len,
                file_id: info.file_id,
                ..task.cursor.clone()
            }
        };
        return ParsedFile::skipped(task, cursor, None);
    }

    let mut parsed = ParsedFile {
        source: task.handle.id.clone(),
        cursor: task.cursor.clone(),
        events: Vec::new(),
        outside_horizon: 0,
        bytes_read: 0,
        parse_errors: 0,
        recoverable_parse_errors: 0,
        issues: Vec::new(),
        skipped: false,
    };
    let mut parser: Option<StreamParser> = None;
    loop {
        let batch = match source.read_since(&task.handle, &parsed.cursor) {
            Ok(batch) => batch,
            Err(err) => {
                parsed.issues.push(IngestIssue {
                    file_path: task.handle.id.clone(),
                    message: err.to_string(),
                });
                break;
            }
        };
        if batch.rotated || parser.is_none() {
            parser = Some(StreamParser::new(&task.handle, &batch.cursor));
        }
        let Some(stream) = parser.as_mut() else {
            break;
        };
        let lines = stream.parse_lines(&batch.lines);
        parsed.parse_errors += lines.fatal_errors();
        parsed.recoverable_parse_errors += lines.recoverable_errors();
        for event in lines.events {
            if event.timestamp < horizon {
                parsed.outside_horizon += 1;
            } else {
                parsed.events.push(event);
            }
        }
        parsed.bytes_read = parsed.bytes_read.saturating_add(batch.bytes_read);
        parsed.cursor = batch.cursor;
        stream.carry_into(&mut parsed.cursor);
        if !batch.more {
            break;
        }
    }
    parsed
}

/// Reads every handle from its stored cursor in parallel.
///
/// Files last modified before `horizon` are not read; their cursor moves to the end.
pub fn backfill<S: UsageSource + ?Sized>(
    source: &S,
    handles: &[SourceHandle],
    cursors: &BTreeMap<String, SourceCursor>,
    horizon: DateTime<Utc>,
) -> Backfill {
    let started = Instant::now();
    let tasks = handles
        .iter()
        .map(|handle| FileTask {
            handle: handle.clone(),
            cursor: cursors.get(&handle.id).cloned().unwrap_or_default(),
        })
        .collect::<Vec<_>>();

    let parsed_files = tasks
        .into_par_iter()
        .map(|task| parse_file(source, task, horizon))
        .collect::<Vec<_>>();

    let mut result = Backfill::default();
    for parsed in parsed_files {
        result.stats.files_scanned += 1;
        if parsed.skipped {
            result.stats.files_skipped += 1;
        }
        result.stats.bytes_read += parsed.bytes_read;
        result.stats.parse_errors += parsed.parse_errors;
        result.stats.recoverable_parse_errors += parsed.recoverable_parse_errors;
        result.stats.events_outside_horizon += parsed.outside_horizon;
        result.stats.issues.extend(parsed.issues);
        result.events.extend(parsed.events);
        result.cursors.insert(parsed.source, parsed.cursor);
    }
    result.events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    result.stats.events_parsed = result.events.len();

    tracing::debug!(
        files = result.stats.files_scanned,
        skipped = result.stats.files_skipped,
        events = result.stats.events_parsed,
        bytes = result.stats.bytes_read,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "backfill complete"
    );
    result
}
