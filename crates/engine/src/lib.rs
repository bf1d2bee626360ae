pub mod aggregator;
pub mod alerts;
mod buckets;
pub mod continuity;
pub mod estimator;
pub mod policy;

use std::collections::BTreeMap;
use std::sync::Arc;

use budget_core::{
    AlertTier, AlertTransition, BudgetLimits, HandoffSnapshot, HealthSnapshot, LiveStatus,
    Notification, Projection, RollingWindow, SafetyVerdict, SnapshotReason, SourceCursor,
    UsageEvent, UsageStatus, WindowKind, WindowStatus,
};
use chrono::{DateTime, Utc};

pub use aggregator::{AggregatorConfig, BlockAnchor, DropReason, IngestOutcome, WindowAggregator};
pub use alerts::{AlertConfig, AlertEngine, MAX_CRITICAL_COOLDOWN_SECS};
pub use continuity::{ContinuityError, ContinuityRecorder, RehydrateError};
pub use estimator::{EstimatorConfig, RateEstimator};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub aggregator: AggregatorConfig,
    pub estimator: EstimatorConfig,
    pub alerts: AlertConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.aggregator.validate()?;
        self.estimator.validate()?;
        self.alerts.validate()
    }
}

/// Everything one engine call produced.
#[derive(Debug, Clone, Default)]
pub struct EngineStep {
    pub accepted: u64,
    pub dropped: u64,
    pub transitions: Vec<AlertTransition>,
    pub notifications: Vec<Notification>,
    pub closed_windows: Vec<RollingWindow>,
    pub snapshots: Vec<HandoffSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RehydrateOutcome {
    Restored { sequence: u64 },
    /// State discarded; cursors start at 0 so sources are read again.
    FailedClosed { sequence: u64, error: RehydrateError },
}

/// Aggregator, estimator, alerts and recorder behind a single owner.
#[derive(Debug, Clone)]
pub struct BudgetEngine {
    config: EngineConfig,
    limits: Arc<BudgetLimits>,
    aggregator: WindowAggregator,
    estimator: RateEstimator,
    alerts: AlertEngine,
    recorder: ContinuityRecorder,
    cursors: BTreeMap<String, SourceCursor>,
    projections: BTreeMap<WindowKind, Projection>,
    events_ingested: u64,
    usage_known: bool,
}

impl BudgetEngine {
    pub fn new(config: EngineConfig, limits: Arc<BudgetLimits>) -> Self {
        let alerts = AlertEngine::new(
            config
                .alerts
                .clone()
                .with_ceiling(limits.safety_ceiling_percent),
        );
        Self {
            aggregator: WindowAggregator::new(config.aggregator.clone()),
            estimator: RateEstimator::new(config.estimator.clone()),
            alerts,
            recorder: ContinuityRecorder::new(),
            cursors: BTreeMap::new(),
            projections: BTreeMap::new(),
            events_ingested: 0,
            usage_known: false,
            config,
            limits,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn limits(&self) -> &Arc<BudgetLimits> {
        &self.limits
    }

    /// Swaps in a new limit set and re-evaluates alerts against it.
    pub fn set_limits(&mut self, limits: Arc<BudgetLimits>, now: DateTime<Utc>) -> EngineStep {
        self.alerts.set_config(
            self.config
                .alerts
                .clone()
                .with_ceiling(limits.safety_ceiling_percent),
        );
        self.limits = limits;
        let mut step = EngineStep::default();
        self.refresh(now, &mut step);
        step
    }

    /// Ingests events from one source, then records `cursor` as that source's position.
    pub fn ingest_batch(
        &mut self,
        source: &str,
        events: &[UsageEvent],
        cursor: SourceCursor,
        now: DateTime<Utc>,
    ) -> EngineStep {
        let mut step = self.apply_events(events, now);
        self.cursors.insert(source.to_string(), cursor);
        self.finish_step(&mut step, now);
        step
    }

    /// Ingests events without moving any cursor.
    pub fn ingest_events(&mut self, events: &[UsageEvent], now: DateTime<Utc>) -> EngineStep {
        let mut step = self.apply_events(events, now);
        self.finish_step(&mut step, now);
        step
    }

    pub fn update_cursor(&mut self, source: &str, cursor: SourceCursor) {
        self.cursors.insert(source.to_string(), cursor);
    }

    pub fn update_cursors(&mut self, cursors: BTreeMap<String, SourceCursor>) {
        self.cursors.extend(cursors);
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> EngineStep {
        let mut step = EngineStep::default();
        if let Some(closed) = self.aggregator.tick(now) {
            step.closed_windows.push(closed);
        }
        self.finish_step(&mut step, now);
        step
    }

    pub fn window(&self, kind: WindowKind, now: DateTime<Utc>) -> RollingWindow {
        self.aggregator.snapshot(kind, now)
    }

    pub fn projection(&self, kind: WindowKind) -> Option<&Projection> {
        self.projections.get(&kind)
    }

    pub fn live_status(&mut self, now: DateTime<Utc>, mut health: HealthSnapshot) -> LiveStatus {
        let mut windows = Vec::new();
        for kind in WindowKind::ALL {
            let window = self.aggregator.snapshot(kind, now);
            let limits = policy::limit_usages(&window, &self.limits);
            let projection = self
                .estimator
                .project(&window, &limits, self.limits.safety_ceiling_percent, now);
            self.projections.insert(kind, projection.clone());
            windows.push(WindowStatus {
                window,
                projection,
                limits,
            });
        }
        health.events_ingested = self.events_ingested;
        health.drops = self.aggregator.drops();
        let last = self.recorder.last_sequence();
        health.last_snapshot_sequence = (last > 0).then_some(last);
        LiveStatus {
            as_of: now,
            status: self.usage_status(),
            windows,
            active_alerts: self.alerts.active(),
            health,
        }
    }

    /// Synchronous safety check for callers about to consume more budget.
    pub fn budget_verdict(&self, now: DateTime<Utc>) -> SafetyVerdict {
        if !self.usage_known {
            return policy::unknown_usage_verdict();
        }
        let windows = WindowKind::ALL
            .iter()
            .map(|kind| self.aggregator.snapshot(*kind, now))
            .collect::<Vec<_>>();
        policy::check_windows(&windows, &self.limits)
    }

    pub fn save(&mut self, reason: SnapshotReason, now: DateTime<Utc>) -> HandoffSnapshot {
        self.recorder
            .capture(reason, now, &self.aggregator, &self.alerts, &self.cursors)
    }

    /// Restores state from `snapshot`, or starts over if it does not validate.
    pub fn rehydrate(
        &mut self,
        snapshot: &HandoffSnapshot,
    ) -> Result<RehydrateOutcome, ContinuityError> {
        self.recorder.check_replay(snapshot)?;
        let sequence = snapshot.sequence_number;
        let mut aggregator = WindowAggregator::new(self.config.aggregator.clone());
        let restored = aggregator
            .rehydrate(snapshot)
            .and_then(|()| continuity::validate_restored(snapshot, &aggregator));
        self.recorder.accept(sequence);
        match restored {
            Ok(()) => {
                self.aggregator = aggregator;
                self.alerts = AlertEngine::new(self.alerts.config().clone());
                self.alerts.restore(&snapshot.alerts, snapshot.created_at);
                self.estimator = RateEstimator::new(self.config.estimator.clone());
                self.cursors = snapshot.cursors.clone();
                self.projections.clear();
                self.usage_known = true;
                tracing::info!(
                    sequence,
                    reason = %snapshot.reason,
                    sources = self.cursors.len(),
                    "rehydrated from handoff snapshot"
                );
                Ok(RehydrateOutcome::Restored { sequence })
            }
            Err(error) => {
                tracing::error!(
                    sequence,
                    error = %error,
                    "handoff snapshot failed validation; starting fresh"
                );
                self.reset_fresh();
                Ok(RehydrateOutcome::FailedClosed { sequence, error })
            }
        }
    }

    /// Discards all accumulated state after an unusable snapshot.
    pub fn fail_closed(&mut self, reason: &str) {
        tracing::error!(reason, "discarding state; sources will be read from the start");
        self.reset_fresh();
    }

    /// Continues numbering after `sequence` when the snapshot itself was unreadable.
    pub fn resume_after(&mut self, sequence: u64) {
        self.recorder.accept(sequence);
    }

    pub fn acknowledge(
        &mut self,
        kind: WindowKind,
        tier: AlertTier,
        now: DateTime<Utc>,
    ) -> Option<AlertTransition> {
        self.alerts.acknowledge(kind, tier, now)
    }

    pub fn suppress(
        &mut self,
        kind: WindowKind,
        tier: AlertTier,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<AlertTransition> {
        self.alerts.suppress(kind, tier, until, now)
    }

    pub fn mark_usage_known(&mut self, known: bool) {
        self.usage_known = known;
    }

    pub fn usage_status(&self) -> UsageStatus {
        if self.usage_known {
            UsageStatus::Known
        } else {
            UsageStatus::Unknown
        }
    }

    pub fn cursors(&self) -> &BTreeMap<String, SourceCursor> {
        &self.cursors
    }

    pub fn cursor(&self, source: &str) -> Option<&SourceCursor> {
        self.cursors.get(source)
    }

    pub fn events_ingested(&self) -> u64 {
        self.events_ingested
    }

    pub fn last_snapshot_sequence(&self) -> u64 {
        self.recorder.last_sequence()
    }

    fn apply_events(&mut self, events: &[UsageEvent], now: DateTime<Utc>) -> EngineStep {
        let mut step = EngineStep::default();
        for event in events {
            match self.aggregator.ingest(event, now) {
                IngestOutcome::Accepted { closed, .. } => {
                    step.accepted += 1;
                    self.events_ingested = self.events_ingested.saturating_add(1);
                    if let Some(closed) = closed {
                        step.closed_windows.push(closed);
                    }
                }
                IngestOutcome::Dropped(reason) => {
                    step.dropped += 1;
                    tracing::trace!(id = %event.id, ?reason, "event dropped");
                }
            }
        }
        step
    }

    fn finish_step(&mut self, step: &mut EngineStep, now: DateTime<Utc>) {
        let closed_any = !step.closed_windows.is_empty();
        if closed_any {
            self.estimator.reset(WindowKind::ShortBlock);
            step.transitions
                .extend(self.alerts.reset_window(WindowKind::ShortBlock, now));
        }
        self.refresh(now, step);
        if closed_any {
            step.snapshots.push(self.save(SnapshotReason::BlockClosed, now));
        }
    }

    fn refresh(&mut self, now: DateTime<Utc>, step: &mut EngineStep) {
        for kind in WindowKind::ALL {
            let window = self.aggregator.snapshot(kind, now);
            let limits = policy::limit_usages(&window, &self.limits);
            let projection = self
                .estimator
                .project(&window, &limits, self.limits.safety_ceiling_percent, now);
            for transition in self.alerts.evaluate(&projection) {
                if transition.notify {
                    step.notifications
                        .push(self.alerts.notification_for(&transition));
                }
                step.transitions.push(transition);
            }
            self.projections.insert(kind, projection);
        }
    }

    fn reset_fresh(&mut self) {
        self.aggregator = WindowAggregator::new(self.config.aggregator.clone());
        self.alerts = AlertEngine::new(self.alerts.config().clone());
        self.estimator = RateEstimator::new(self.config.estimator.clone());
        self.cursors.clear();
        self.projections.clear();
        self.events_ingested = 0;
        self.usage_known = false;
    }
}
