use std::collections::BTreeMap;

use budget_core::{BucketState, ModelUsage, TokenUsage, UsageEvent};
use chrono::{DateTime, Duration, Utc};

use crate::continuity::RehydrateError;

/// Fixed-width histogram behind the LongQuota window.
///
/// A bucket stays live until its end falls at or before `now - length`, so the
/// window over-counts by at most one bucket width and never under-counts.
#[derive(Debug, Clone)]
pub(crate) struct BucketHistogram {
    width_secs: i64,
    length_secs: i64,
    buckets: BTreeMap<i64, BucketState>,
}

#[derive(Debug, Default)]
pub(crate) struct HistogramView {
    pub totals: TokenUsage,
    pub event_count: u64,
    pub last_event_time: Option<DateTime<Utc>>,
    pub by_model: BTreeMap<String, ModelUsage>,
    pub oldest_start: Option<DateTime<Utc>>,
}

impl BucketHistogram {
    pub fn new(width: Duration, length: Duration) -> Self {
        Self {
            width_secs: width.num_seconds().max(1),
            length_secs: length.num_seconds().max(1),
            buckets: BTreeMap::new(),
        }
    }

    fn index_of(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.width_secs)
    }

    fn start_of(&self, index: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(index.saturating_mul(self.width_secs), 0)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn is_live(&self, index: i64, now: DateTime<Utc>) -> bool {
        let bucket_end = index.saturating_add(1).saturating_mul(self.width_secs);
        bucket_end > now.timestamp().saturating_sub(self.length_secs)
    }

    /// The event's bucket is still inside the horizon at `now`.
    pub fn accepts(&self, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.is_live(self.index_of(ts), now)
    }

    pub fn add(&mut self, event: &UsageEvent) {
        let index = self.index_of(event.timestamp);
        let start = self.start_of(index);
        let bucket = self.buckets.entry(index).or_insert_with(|| BucketState {
            start,
            totals: TokenUsage::default(),
            event_count: 0,
            last_event_time: None,
            by_model: BTreeMap::new(),
        });
        bucket.totals = bucket.totals.saturating_add(event.usage);
        bucket.event_count = bucket.event_count.saturating_add(1);
        bucket.last_event_time = bucket.last_event_time.max(Some(event.timestamp));
        bucket
            .by_model
            .entry(event.model.clone())
            .or_default()
            .record(event.usage);
    }

    pub fn evict(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.buckets.len();
        let width = self.width_secs;
        let cutoff = now.timestamp().saturating_sub(self.length_secs);
        self.buckets
            .retain(|index, _| index.saturating_add(1).saturating_mul(width) > cutoff);
        before - self.buckets.len()
    }

    pub fn view(&self, now: DateTime<Utc>) -> HistogramView {
        let mut view = HistogramView::default();
        for (index, bucket) in &self.buckets {
            if !self.is_live(*index, now) {
                continue;
            }
            view.oldest_start = view.oldest_start.or(Some(bucket.start));
            view.totals = view.totals.saturating_add(bucket.totals);
            view.event_count = view.event_count.saturating_add(bucket.event_count);
            view.last_event_time = view.last_event_time.max(bucket.last_event_time);
            for (model, usage) in &bucket.by_model {
                let mut contribution = usage.clone();
                contribution.active_seconds = self.width_secs as u64;
                view.by_model
                    .entry(model.clone())
                    .or_default()
                    .merge(&contribution);
            }
        }
        view
    }

    pub fn states(&self) -> Vec<BucketState> {
        self.buckets.values().cloned().collect()
    }

    pub fn restore(&mut self, states: &[BucketState]) -> Result<(), RehydrateError> {
        let mut restored = BTreeMap::new();
        let mut previous: Option<i64> = None;
        for state in states {
            let index = self.index_of(state.start);
            if self.start_of(index) != state.start {
                return Err(RehydrateError::MisalignedBucket(state.start));
            }
            if previous.is_some_and(|previous| previous >= index) {
                return Err(RehydrateError::UnsortedBuckets);
            }
            previous = Some(index);
            restored.insert(index, state.clone());
        }
        self.buckets = restored;
        Ok(())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}
