#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use budget_core::{
    AggregatorState, AlertState, AlertTier, DropCounters, HandoffSnapshot, ModelUsage,
    RollingWindow, ShortBlockState, SnapshotReason, SourceCursor, TokenUsage, WindowKind,
};
use budget_db::Db;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

pub struct TestDb {
    pub _dir: TempDir,
    pub db: Db,
    pub path: PathBuf,
}

pub fn setup_db() -> TestDb {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("test.sqlite");
    let mut db = Db::open(&path).expect("open db");
    db.migrate().expect("migrate db");
    TestDb {
        _dir: dir,
        db,
        path,
    }
}

pub fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 2, hour, minute, 0).unwrap()
}

pub fn usage(input: u64, output: u64) -> TokenUsage {
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        cache_read_tokens: 10,
        cache_creation_tokens: 0,
    }
}

pub fn block_window(anchor: DateTime<Utc>, totals: TokenUsage, events: u64) -> RollingWindow {
    let mut window = RollingWindow::empty(
        WindowKind::ShortBlock,
        Duration::hours(5),
        anchor + Duration::hours(5),
    );
    window.anchor = Some(anchor);
    window.totals = totals;
    window.event_count = events;
    window.last_event_time = Some(anchor + Duration::minutes(30));
    window.by_model.insert(
        "claude-sonnet-4".to_string(),
        ModelUsage {
            usage: totals,
            event_count: events,
            active_seconds: 3600,
        },
    );
    window
}

pub fn make_snapshot(sequence: u64, created_at: DateTime<Utc>) -> HandoffSnapshot {
    let anchor = created_at - Duration::hours(1);
    let totals = usage(1_000, 200);
    let short = block_window(anchor, totals, 3);
    let long = RollingWindow {
        kind: WindowKind::LongQuota,
        length_secs: Duration::days(7).num_seconds(),
        ..short.clone()
    };
    let mut cursors = BTreeMap::new();
    cursors.insert(
        "/logs/a.jsonl".to_string(),
        SourceCursor {
            offset: 4_096,
            file_id: Some(11),
            last_model: Some("gpt-5".to_string()),
            last_total: Some(TokenUsage {
                input_tokens: 400,
                output_tokens: 50,
                cache_read_tokens: 600,
                cache_creation_tokens: 0,
            }),
        },
    );
    HandoffSnapshot {
        sequence_number: sequence,
        created_at,
        reason: SnapshotReason::Explicit,
        windows: vec![short, long],
        aggregator: AggregatorState {
            short_block_length_secs: Duration::hours(5).num_seconds(),
            long_quota_length_secs: Duration::days(7).num_seconds(),
            bucket_width_secs: 3600,
            short_block: Some(ShortBlockState {
                anchor,
                totals,
                event_count: 3,
                last_event_time: Some(anchor + Duration::minutes(30)),
                by_model: BTreeMap::new(),
            }),
            last_closed_end: Some(anchor - Duration::hours(1)),
            buckets: Vec::new(),
            drops: DropCounters {
                clock_skew: 1,
                ..DropCounters::default()
            },
        },
        alerts: vec![AlertState::idle(WindowKind::ShortBlock, AlertTier::Info)],
        cursors,
    }
}
