use std::collections::BTreeMap;

use budget_core::{HealthSnapshot, SourceHealth};
use ingest::BackfillStats;

/// Error counters and per-source positions owned by the consumer task.
#[derive(Debug, Clone, Default)]
pub struct HealthTracker {
    parse_errors: u64,
    recoverable_parse_errors: u64,
    source_errors: u64,
    store_errors: u64,
    sources: BTreeMap<String, SourceHealth>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_backfill(&mut self, stats: &BackfillStats) {
        self.parse_errors += stats.parse_errors;
        self.recoverable_parse_errors += stats.recoverable_parse_errors;
        self.source_errors += stats.issues.len() as u64;
        for issue in &stats.issues {
            self.entry(&issue.file_path).last_error = Some(issue.message.clone());
        }
    }

    pub fn record_batch(
        &mut self,
        source: &str,
        offset: u64,
        parse_errors: u64,
        recoverable_parse_errors: u64,
    ) {
        self.parse_errors += parse_errors;
        self.recoverable_parse_errors += recoverable_parse_errors;
        let entry = self.entry(source);
        entry.offset = offset;
        entry.last_error = None;
    }

    pub fn record_source_error(&mut self, source: &str, message: &str) {
        self.source_errors += 1;
        self.entry(source).last_error = Some(message.to_string());
    }

    pub fn record_store_error(&mut self) {
        self.store_errors += 1;
    }

    pub fn store_errors(&self) -> u64 {
        self.store_errors
    }

    /// Engine-owned fields are filled in by the engine itself.
    pub fn snapshot(&self, notifier_dropped: u64) -> HealthSnapshot {
        HealthSnapshot {
            parse_errors: self.parse_errors,
            recoverable_parse_errors: self.recoverable_parse_errors,
            source_errors: self.source_errors,
            store_errors: self.store_errors,
            notifier_dropped,
            sources: self.sources.values().cloned().collect(),
            ..HealthSnapshot::default()
        }
    }

    fn entry(&mut self, source: &str) -> &mut SourceHealth {
        self.sources
            .entry(source.to_string())
            .or_insert_with(|| SourceHealth {
                source: source.to_string(),
                ..SourceHealth::default()
            })
    }
}
