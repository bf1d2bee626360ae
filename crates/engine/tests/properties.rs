use std::sync::Arc;

use budget_core::{
    AlertTier, BudgetLimits, EventOrigin, SnapshotReason, SourceCursor, TokenUsage, UsageEvent,
    WindowKind,
};
use budget_engine::policy::exceeds_ceiling;
use budget_engine::{
    AggregatorConfig, BudgetEngine, EngineConfig, IngestOutcome, RehydrateOutcome,
    WindowAggregator,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

fn origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
}

fn events_from(steps: &[(i64, u64, u64)]) -> Vec<UsageEvent> {
    let mut ts = origin();
    steps
        .iter()
        .enumerate()
        .map(|(index, (gap, input, output))| {
            ts += Duration::seconds(*gap);
            UsageEvent {
                id: format!("event-{index}"),
                session_id: "session".to_string(),
                timestamp: ts,
                model: if index % 2 == 0 { "model-a" } else { "model-b" }.to_string(),
                usage: TokenUsage {
                    input_tokens: *input,
                    output_tokens: *output,
                    ..TokenUsage::default()
                },
                source: "source.jsonl".to_string(),
                origin: EventOrigin::Codex { turn_id: None },
            }
        })
        .collect()
}

fn step_strategy(max_gap: i64, max_tokens: u64) -> impl Strategy<Value = (i64, u64, u64)> {
    (0..=max_gap, 0..=max_tokens, 0..=max_tokens)
}

proptest! {
    #[test]
    fn closed_and_open_blocks_conserve_tokens(
        steps in prop::collection::vec(step_strategy(3 * 3600, 50_000), 1..40)
    ) {
        let events = events_from(&steps);
        let mut aggregator = WindowAggregator::new(AggregatorConfig::default());
        let mut closed_total = 0u64;
        for event in &events {
            match aggregator.ingest(event, event.timestamp) {
                IngestOutcome::Accepted { closed, backfilled } => {
                    prop_assert!(!backfilled);
                    closed_total += closed.map(|window| window.counted_tokens()).unwrap_or(0);
                }
                IngestOutcome::Dropped(reason) => {
                    return Err(TestCaseError::fail(format!("unexpected drop {reason:?}")));
                }
            }
        }
        let now = events.last().map(|event| event.timestamp).unwrap_or_else(origin);
        let expected: u64 = events.iter().map(|event| event.usage.counted_tokens()).sum();
        let open = aggregator.snapshot(WindowKind::ShortBlock, now).counted_tokens();
        prop_assert_eq!(closed_total + open, expected);

        let long = aggregator.snapshot(WindowKind::LongQuota, now);
        prop_assert_eq!(long.counted_tokens(), expected);
        let per_model: u64 = long.by_model.values().map(|usage| usage.usage.counted_tokens()).sum();
        prop_assert_eq!(per_model, expected);
    }

    #[test]
    fn event_at_block_end_opens_the_next_block(hours in 1i64..12, extra in 0i64..3600) {
        let config = AggregatorConfig {
            short_block_length: Duration::hours(hours),
            long_quota_length: Duration::days(7).max(Duration::hours(hours)),
            ..AggregatorConfig::default()
        };
        let mut aggregator = WindowAggregator::new(config);
        let events = events_from(&[(0, 10, 0), (hours * 3600, 20, 0), (extra, 30, 0)]);
        let first = aggregator.ingest(&events[0], events[0].timestamp);
        prop_assert!(
            matches!(first, IngestOutcome::Accepted { closed: None, .. }),
            "expected first ingest to be Accepted with closed: None, got {:?}",
            first
        );
        let at_end = aggregator.ingest(&events[1], events[1].timestamp);
        let closed = match at_end {
            IngestOutcome::Accepted { closed: Some(window), .. } => window,
            other => return Err(TestCaseError::fail(format!("block did not close: {other:?}"))),
        };
        prop_assert_eq!(closed.counted_tokens(), 10);
        aggregator.ingest(&events[2], events[2].timestamp);
        let open = aggregator.snapshot(WindowKind::ShortBlock, events[2].timestamp);
        prop_assert_eq!(open.anchor, Some(events[1].timestamp));
        prop_assert_eq!(open.counted_tokens(), 50);
    }

    #[test]
    fn rehydrate_reproduces_every_window(
        steps in prop::collection::vec(step_strategy(2 * 3600, 20_000), 1..30),
        later in 0i64..7200
    ) {
        let events = events_from(&steps);
        let mut engine = BudgetEngine::new(EngineConfig::default(), Arc::new(BudgetLimits::default()));
        let last = events.last().map(|event| event.timestamp).unwrap_or_else(origin);
        engine.ingest_batch("source.jsonl", &events, SourceCursor { offset: 42, ..SourceCursor::default() }, last);
        let saved_at = last + Duration::seconds(later);
        engine.tick(saved_at);
        let snapshot = engine.save(SnapshotReason::Explicit, saved_at);

        let mut restored = BudgetEngine::new(EngineConfig::default(), Arc::new(BudgetLimits::default()));
        let outcome = restored.rehydrate(&snapshot).map_err(|err| TestCaseError::fail(err.to_string()))?;
        prop_assert_eq!(outcome, RehydrateOutcome::Restored { sequence: snapshot.sequence_number });
        for window in &snapshot.windows {
            let again = restored.window(window.kind, snapshot.created_at);
            prop_assert_eq!(&again.totals, &window.totals);
            prop_assert_eq!(again.event_count, window.event_count);
            prop_assert_eq!(again.anchor, window.anchor);
        }
        prop_assert_eq!(restored.cursors(), engine.cursors());
    }

    #[test]
    fn alerts_escalate_once_per_tier_in_order(
        increments in prop::collection::vec((0i64..=10, 0u64..=30_000), 1..25)
    ) {
        let steps = increments.iter().map(|(gap, input)| (*gap, *input, 0)).collect::<Vec<_>>();
        let events = events_from(&steps);
        let mut engine = BudgetEngine::new(EngineConfig::default(), Arc::new(BudgetLimits::default()));
        let mut tiers = Vec::new();
        for event in &events {
            let step = engine.ingest_events(std::slice::from_ref(event), event.timestamp);
            tiers.extend(step.notifications.iter().map(|notification| notification.tier));
        }
        let total: u64 = events.iter().map(|event| event.usage.counted_tokens()).sum();
        let percent = total as f64 / 200_000.0 * 100.0;
        let expected = AlertTier::ALL
            .into_iter()
            .filter(|tier| percent >= tier.default_threshold_percent())
            .collect::<Vec<_>>();
        prop_assert_eq!(tiers, expected);
    }

    #[test]
    fn ceiling_is_never_crossed_silently(limit in 1u64..1_000_000_000, used in 0u64..2_000_000_000) {
        let scaled = u128::from(used) * 100 * 1_000_000;
        if u128::from(used) * 100 >= u128::from(limit) * 90 {
            prop_assert!(exceeds_ceiling(used, limit, 90.0));
        }
        if scaled <= u128::from(limit) * (90 * 1_000_000 - 1) {
            prop_assert!(!exceeds_ceiling(used, limit, 90.0));
        }
    }
}

#[test]
fn verdict_flips_between_89_999_and_90_000_percent() {
    let limits = Arc::new(BudgetLimits {
        short_block_token_limit: 100_000,
        ..BudgetLimits::default()
    });
    let now = origin();
    for (used, ok) in [(89_999u64, true), (90_000, false)] {
        let mut engine = BudgetEngine::new(EngineConfig::default(), limits.clone());
        engine.mark_usage_known(true);
        engine.ingest_events(&events_from(&[(0, used, 0)]), now);
        assert_eq!(engine.budget_verdict(now).ok, ok, "used {used}");
    }
}
