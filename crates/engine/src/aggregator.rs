use std::collections::{BTreeMap, HashSet, VecDeque};

use budget_core::{
    AggregatorState, DropCounters, HandoffSnapshot, RollingWindow, ShortBlockState, UsageEvent,
    WindowKind,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::buckets::BucketHistogram;
use crate::continuity::RehydrateError;

/// How a new ShortBlock picks its start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockAnchor {
    /// The timestamp of the event that opened the block.
    #[default]
    FirstEvent,
    /// That timestamp truncated to the hour.
    HourFloor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    pub short_block_length: Duration,
    pub long_quota_length: Duration,
    pub bucket_width: Duration,
    pub max_future_skew: Duration,
    pub anchor: BlockAnchor,
    /// Recent event ids remembered for de-duplication.
    pub dedupe_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            short_block_length: Duration::hours(5),
            long_quota_length: Duration::days(7),
            bucket_width: Duration::hours(1),
            max_future_skew: Duration::minutes(10),
            anchor: BlockAnchor::FirstEvent,
            dedupe_capacity: 100_000,
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.short_block_length <= Duration::zero() {
            return Err("short block length must be positive".to_string());
        }
        if self.bucket_width < Duration::seconds(1) {
            return Err("bucket width must be at least one second".to_string());
        }
        if self.long_quota_length < self.short_block_length {
            return Err("long quota length must not be shorter than the short block".to_string());
        }
        if self.long_quota_length < self.bucket_width {
            return Err("long quota length must cover at least one bucket".to_string());
        }
        if self.max_future_skew < Duration::zero() {
            return Err("max future skew must not be negative".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Backfill,
    BeyondHorizon,
    ClockSkew,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted {
        /// ShortBlock closed by this event.
        closed: Option<RollingWindow>,
        /// Older than the open ShortBlock; counted by LongQuota only.
        backfilled: bool,
    },
    Dropped(DropReason),
}

#[derive(Debug, Clone, Default)]
struct RecentIds {
    capacity: usize,
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if self.capacity == 0 || !self.set.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.set.clear();
        self.order.clear();
    }
}

enum BlockPosition {
    Open,
    Before,
    Inside,
    After,
}

/// Owns the ShortBlock and LongQuota accumulators.
#[derive(Debug, Clone)]
pub struct WindowAggregator {
    config: AggregatorConfig,
    short_block: Option<ShortBlockState>,
    last_closed_end: Option<DateTime<Utc>>,
    long: BucketHistogram,
    drops: DropCounters,
    recent: RecentIds,
}

impl WindowAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let long = BucketHistogram::new(config.bucket_width, config.long_quota_length);
        let recent = RecentIds::new(config.dedupe_capacity);
        Self {
            config,
            short_block: None,
            last_closed_end: None,
            long,
            drops: DropCounters::default(),
            recent,
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn drops(&self) -> DropCounters {
        self.drops
    }

    pub fn ingest(&mut self, event: &UsageEvent, now: DateTime<Utc>) -> IngestOutcome {
        let ts = event.timestamp;
        if ts > now + self.config.max_future_skew {
            self.drops.clock_skew += 1;
            return IngestOutcome::Dropped(DropReason::ClockSkew);
        }
        if self.recent.contains(&event.id) {
            self.drops.duplicate += 1;
            return IngestOutcome::Dropped(DropReason::Duplicate);
        }
        self.long.evict(now);
        let in_long = self.long.accepts(ts, now);
        if !in_long && ts + self.config.short_block_length <= now {
            self.drops.beyond_horizon += 1;
            return IngestOutcome::Dropped(DropReason::BeyondHorizon);
        }
        self.recent.insert(&event.id);

        // A closed block's span is never reopened.
        let closed_before = self.last_closed_end.is_some_and(|end| ts < end);
        let position = match &self.short_block {
            _ if closed_before => BlockPosition::Before,
            None => BlockPosition::Open,
            Some(block) if ts < block.anchor => BlockPosition::Before,
            Some(block) if ts >= block.anchor + self.config.short_block_length => {
                BlockPosition::After
            }
            Some(_) => BlockPosition::Inside,
        };
        let mut closed = None;
        let mut backfilled = false;
        match position {
            BlockPosition::Open => self.open_block(event),
            BlockPosition::After => {
                closed = self.close_block();
                self.open_block(event);
            }
            BlockPosition::Inside => {
                if let Some(block) = self.short_block.as_mut() {
                    record(block, event);
                }
            }
            BlockPosition::Before => {
                backfilled = true;
                self.drops.backfill += 1;
            }
        }

        if in_long {
            self.long.add(event);
        } else if backfilled {
            return IngestOutcome::Dropped(DropReason::Backfill);
        }
        IngestOutcome::Accepted { closed, backfilled }
    }

    /// Closes the ShortBlock once wall-clock time passes its end and evicts stale buckets.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<RollingWindow> {
        self.long.evict(now);
        let expired = self
            .short_block
            .as_ref()
            .is_some_and(|block| now >= block.anchor + self.config.short_block_length);
        if expired { self.close_block() } else { None }
    }

    pub fn snapshot(&self, kind: WindowKind, now: DateTime<Utc>) -> RollingWindow {
        match kind {
            WindowKind::ShortBlock => match &self.short_block {
                Some(block) if now < block.anchor + self.config.short_block_length => {
                    self.block_window(block, now)
                }
                _ => RollingWindow::empty(kind, self.config.short_block_length, now),
            },
            WindowKind::LongQuota => {
                let view = self.long.view(now);
                let mut window =
                    RollingWindow::empty(kind, self.config.long_quota_length, now);
                if view.event_count == 0 {
                    return window;
                }
                let horizon = now - self.config.long_quota_length;
                window.anchor = view.oldest_start.map(|oldest| oldest.max(horizon));
                window.totals = view.totals;
                window.event_count = view.event_count;
                window.last_event_time = view.last_event_time;
                window.by_model = view.by_model;
                window
            }
        }
    }

    pub fn state(&self) -> AggregatorState {
        AggregatorState {
            short_block_length_secs: self.config.short_block_length.num_seconds(),
            long_quota_length_secs: self.config.long_quota_length.num_seconds(),
            bucket_width_secs: self.config.bucket_width.num_seconds(),
            short_block: self.short_block.clone(),
            last_closed_end: self.last_closed_end,
            buckets: self.long.states(),
            drops: self.drops,
        }
    }

    pub fn rehydrate(&mut self, snapshot: &HandoffSnapshot) -> Result<(), RehydrateError> {
        self.restore_state(&snapshot.aggregator)
    }

    /// Replaces all accumulators with `state`. Leaves `self` untouched on error.
    pub fn restore_state(&mut self, state: &AggregatorState) -> Result<(), RehydrateError> {
        let expected = (
            self.config.short_block_length.num_seconds(),
            self.config.long_quota_length.num_seconds(),
            self.config.bucket_width.num_seconds(),
        );
        let found = (
            state.short_block_length_secs,
            state.long_quota_length_secs,
            state.bucket_width_secs,
        );
        if expected != found {
            return Err(RehydrateError::ConfigMismatch(format!(
                "window lengths {:?} do not match configured {:?}",
                found, expected
            )));
        }
        if let (Some(block), Some(end)) = (&state.short_block, state.last_closed_end)
            && block.anchor < end
        {
            return Err(RehydrateError::OverlappingBlock(block.anchor));
        }
        let mut long = BucketHistogram::new(self.config.bucket_width, self.config.long_quota_length);
        long.restore(&state.buckets)?;
        self.long = long;
        self.short_block = state.short_block.clone();
        self.last_closed_end = state.last_closed_end;
        self.drops = state.drops;
        self.recent.clear();
        Ok(())
    }

    fn anchor_for(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self.config.anchor {
            BlockAnchor::FirstEvent => ts,
            BlockAnchor::HourFloor => {
                let secs = ts.timestamp();
                DateTime::<Utc>::from_timestamp(secs - secs.rem_euclid(3600), 0).unwrap_or(ts)
            }
        }
    }

    fn open_block(&mut self, event: &UsageEvent) {
        let mut block = ShortBlockState {
            anchor: self.anchor_for(event.timestamp).max(
                self.last_closed_end.unwrap_or(DateTime::<Utc>::MIN_UTC),
            ),
            totals: Default::default(),
            event_count: 0,
            last_event_time: None,
            by_model: BTreeMap::new(),
        };
        record(&mut block, event);
        self.short_block = Some(block);
    }

    fn close_block(&mut self) -> Option<RollingWindow> {
        let block = self.short_block.take()?;
        let end = block.anchor + self.config.short_block_length;
        self.last_closed_end = self.last_closed_end.max(Some(end));
        Some(self.block_window(&block, end))
    }

    fn block_window(&self, block: &ShortBlockState, as_of: DateTime<Utc>) -> RollingWindow {
        RollingWindow {
            kind: WindowKind::ShortBlock,
            length_secs: self.config.short_block_length.num_seconds(),
            anchor: Some(block.anchor),
            totals: block.totals,
            event_count: block.event_count,
            last_event_time: block.last_event_time,
            by_model: block.by_model.clone(),
            as_of,
        }
    }
}

fn record(block: &mut ShortBlockState, event: &UsageEvent) {
    block.totals = block.totals.saturating_add(event.usage);
    block.event_count = block.event_count.saturating_add(1);
    block.last_event_time = block.last_event_time.max(Some(event.timestamp));
    block
        .by_model
        .entry(event.model.clone())
        .or_default()
        .record(event.usage);
}

#[cfg(test)]
mod tests {
    use budget_core::{EventOrigin, TokenUsage};
    use chrono::TimeZone;

    use super::*;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, hour, minute, 0).unwrap()
    }

    fn event(id: &str, ts: DateTime<Utc>, input: u64, output: u64) -> UsageEvent {
        UsageEvent {
            id: id.to_string(),
            session_id: "s".to_string(),
            timestamp: ts,
            model: "claude-sonnet-4".to_string(),
            usage: TokenUsage {
                input_tokens: input,
                output_tokens: output,
                ..TokenUsage::default()
            },
            source: "test".to_string(),
            origin: EventOrigin::Claude {
                message_id: None,
                request_id: None,
            },
        }
    }

    #[test]
    fn event_at_block_end_opens_new_block() {
        let mut aggregator = WindowAggregator::new(AggregatorConfig::default());
        let now = at(23, 0);
        aggregator.ingest(&event("a", at(8, 0), 100, 0), now);
        aggregator.ingest(&event("b", at(12, 59), 50, 0), now);
        let outcome = aggregator.ingest(&event("c", at(13, 0), 7, 0), now);
        let IngestOutcome::Accepted {
            closed: Some(closed),
            backfilled: false,
        } = outcome
        else {
            panic!("expected a closed block, got {:?}", outcome);
        };
        assert_eq!(closed.anchor, Some(at(8, 0)));
        assert_eq!(closed.counted_tokens(), 150);
        assert_eq!(closed.as_of, at(13, 0));

        let current = aggregator.snapshot(WindowKind::ShortBlock, at(14, 0));
        assert_eq!(current.anchor, Some(at(13, 0)));
        assert_eq!(current.counted_tokens(), 7);
        let long = aggregator.snapshot(WindowKind::LongQuota, at(14, 0));
        assert_eq!(long.counted_tokens(), 157);
        assert_eq!(long.event_count, 3);
    }

    #[test]
    fn drops_are_counted_by_reason() {
        let mut aggregator = WindowAggregator::new(AggregatorConfig::default());
        let now = at(12, 0);
        aggregator.ingest(&event("a", at(11, 0), 10, 0), now);
        assert_eq!(
            aggregator.ingest(&event("a", at(11, 0), 10, 0), now),
            IngestOutcome::Dropped(DropReason::Duplicate)
        );
        assert_eq!(
            aggregator.ingest(&event("future", now + Duration::minutes(11), 10, 0), now),
            IngestOutcome::Dropped(DropReason::ClockSkew)
        );
        assert_eq!(
            aggregator.ingest(&event("ancient", now - Duration::days(8), 10, 0), now),
            IngestOutcome::Dropped(DropReason::BeyondHorizon)
        );
        assert_eq!(
            aggregator.ingest(&event("late", at(10, 0), 5, 0), now),
            IngestOutcome::Accepted {
                closed: None,
                backfilled: true
            }
        );
        let drops = aggregator.drops();
        assert_eq!(
            (drops.duplicate, drops.clock_skew, drops.beyond_horizon, drops.backfill),
            (1, 1, 1, 1)
        );
        assert_eq!(aggregator.snapshot(WindowKind::ShortBlock, now).counted_tokens(), 10);
        assert_eq!(aggregator.snapshot(WindowKind::LongQuota, now).counted_tokens(), 15);
    }

    #[test]
    fn tick_closes_expired_block_only_on_wall_clock() {
        let mut aggregator = WindowAggregator::new(AggregatorConfig::default());
        aggregator.ingest(&event("a", at(8, 0), 10, 0), at(8, 0));
        assert!(aggregator.tick(at(12, 59)).is_none());
        assert!(aggregator.snapshot(WindowKind::ShortBlock, at(12, 59)).is_active());
        assert!(!aggregator.snapshot(WindowKind::ShortBlock, at(13, 0)).is_active());
        let closed = aggregator.tick(at(13, 0)).expect("closed");
        assert_eq!(closed.counted_tokens(), 10);
        assert!(aggregator.tick(at(14, 0)).is_none());
    }

    #[test]
    fn late_event_after_tick_close_does_not_reopen_the_block() {
        let mut aggregator = WindowAggregator::new(AggregatorConfig::default());
        aggregator.ingest(&event("a", at(8, 0), 50, 0), at(8, 0));
        assert!(aggregator.tick(at(13, 1)).is_some());

        let outcome = aggregator.ingest(&event("late", at(10, 0), 7, 0), at(13, 2));
        assert_eq!(
            outcome,
            IngestOutcome::Accepted {
                closed: None,
                backfilled: true
            }
        );
        assert!(!aggregator.snapshot(WindowKind::ShortBlock, at(13, 2)).is_active());
        assert_eq!(aggregator.drops().backfill, 1);
        assert_eq!(aggregator.snapshot(WindowKind::LongQuota, at(13, 2)).counted_tokens(), 57);

        let old = at(13, 3) - Duration::days(3);
        aggregator.ingest(&event("old", old, 9, 0), at(13, 3));
        let outcome = aggregator.ingest(&event("live", at(13, 4), 1, 0), at(13, 4));
        assert_eq!(
            outcome,
            IngestOutcome::Accepted {
                closed: None,
                backfilled: false
            }
        );
        let current = aggregator.snapshot(WindowKind::ShortBlock, at(13, 4));
        assert_eq!(current.anchor, Some(at(13, 4)));
        assert_eq!(current.counted_tokens(), 1);
    }

    #[test]
    fn closed_block_end_survives_restore() {
        let mut source = WindowAggregator::new(AggregatorConfig::default());
        source.ingest(&event("a", at(8, 0), 10, 0), at(8, 0));
        source.tick(at(13, 0));
        let state = source.state();
        assert_eq!(state.last_closed_end, Some(at(13, 0)));

        let mut restored = WindowAggregator::new(AggregatorConfig::default());
        restored.restore_state(&state).expect("restore");
        let outcome = restored.ingest(&event("late", at(12, 0), 5, 0), at(13, 30));
        assert!(matches!(
            outcome,
            IngestOutcome::Accepted {
                backfilled: true,
                ..
            }
        ));
        assert!(!restored.snapshot(WindowKind::ShortBlock, at(13, 30)).is_active());

        let mut overlapping = state.clone();
        overlapping.short_block = Some(ShortBlockState {
            anchor: at(12, 0),
            totals: Default::default(),
            event_count: 0,
            last_event_time: None,
            by_model: BTreeMap::new(),
        });
        assert!(matches!(
            WindowAggregator::new(AggregatorConfig::default()).restore_state(&overlapping),
            Err(RehydrateError::OverlappingBlock(_))
        ));
    }

    #[test]
    fn hour_floor_anchoring_truncates() {
        let config = AggregatorConfig {
            anchor: BlockAnchor::HourFloor,
            ..AggregatorConfig::default()
        };
        let mut aggregator = WindowAggregator::new(config);
        aggregator.ingest(&event("a", at(8, 42), 10, 0), at(9, 0));
        let window = aggregator.snapshot(WindowKind::ShortBlock, at(9, 0));
        assert_eq!(window.anchor, Some(at(8, 0)));
        assert_eq!(window.resets_at(), Some(at(13, 0)));
    }

    #[test]
    fn restore_rejects_mismatched_lengths() {
        let mut source = WindowAggregator::new(AggregatorConfig::default());
        source.ingest(&event("a", at(8, 0), 10, 0), at(8, 0));
        let state = source.state();
        let mut other = WindowAggregator::new(AggregatorConfig {
            short_block_length: Duration::hours(4),
            ..AggregatorConfig::default()
        });
        assert!(matches!(
            other.restore_state(&state),
            Err(RehydrateError::ConfigMismatch(_))
        ));
        let mut same = WindowAggregator::new(AggregatorConfig::default());
        same.restore_state(&state).expect("restore");
        assert_eq!(
            same.snapshot(WindowKind::ShortBlock, at(9, 0)),
            source.snapshot(WindowKind::ShortBlock, at(9, 0))
        );
    }
}
