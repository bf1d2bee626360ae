use std::sync::Arc;
use std::time::Duration;

use budget_core::{BudgetLimits, HandoffSnapshot, HandoffStore, SnapshotReason, StoreError};
use budget_engine::{BudgetEngine, EngineStep};
use chrono::Utc;
use tokio::sync::{mpsc, watch};

use super::Command;
use super::producer::ConsumerMessage;
use crate::health::HealthTracker;
use crate::notifier::NotificationQueue;

/// Sole owner of the engine and the store.
pub(crate) struct Consumer {
    pub engine: BudgetEngine,
    pub store: Box<dyn HandoffStore>,
    pub health: HealthTracker,
    pub queue: Arc<NotificationQueue>,
    pub keep_snapshots: usize,
}

impl Consumer {
    /// Carries an engine step's side effects out to the store and the notifier.
    pub(crate) fn apply_step(&mut self, step: EngineStep) {
        for window in &step.closed_windows {
            if let Err(err) = self.store.record_closed_window(window) {
                self.health.record_store_error();
                tracing::error!(error = %err, kind = %window.kind, "failed to record closed window");
            }
        }
        for snapshot in &step.snapshots {
            let _ = self.persist(snapshot);
        }
        for notification in step.notifications {
            self.queue.push(notification);
        }
    }

    pub(crate) fn persist(&mut self, snapshot: &HandoffSnapshot) -> Result<u64, StoreError> {
        let saved = self.store.save(snapshot);
        match &saved {
            Ok(sequence) => {
                tracing::debug!(sequence, reason = %snapshot.reason, "handoff snapshot saved");
                if self.keep_snapshots > 0
                    && let Err(err) = self.store.prune(self.keep_snapshots)
                {
                    self.health.record_store_error();
                    tracing::warn!(error = %err, "failed to prune old snapshots");
                }
            }
            Err(err) => {
                self.health.record_store_error();
                tracing::error!(
                    sequence = snapshot.sequence_number,
                    error = %err,
                    "failed to save handoff snapshot"
                );
            }
        }
        saved
    }

    fn handle_message(&mut self, message: ConsumerMessage) {
        match message {
            ConsumerMessage::Batch(batch) => {
                self.health.record_batch(
                    &batch.source,
                    batch.cursor.offset,
                    batch.parse_errors,
                    batch.recoverable_parse_errors,
                );
                if batch.rotated {
                    tracing::info!(source = %batch.source, "source rotated");
                }
                self.engine.mark_usage_known(true);
                let step =
                    self.engine
                        .ingest_batch(&batch.source, &batch.events, batch.cursor, Utc::now());
                if step.dropped > 0 {
                    tracing::debug!(
                        source = %batch.source,
                        accepted = step.accepted,
                        dropped = step.dropped,
                        "batch ingested with drops"
                    );
                }
                self.apply_step(step);
            }
            ConsumerMessage::SourceError { source, message } => {
                self.health.record_source_error(&source, &message);
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        let now = Utc::now();
        match command {
            Command::LiveStatus { reply } => {
                let health = self.health.snapshot(self.queue.dropped());
                let _ = reply.send(self.engine.live_status(now, health));
            }
            Command::Verdict { reply } => {
                let _ = reply.send(self.engine.budget_verdict(now));
            }
            Command::Save { reply } => {
                let snapshot = self.engine.save(SnapshotReason::Explicit, now);
                let _ = reply.send(self.persist(&snapshot));
            }
            Command::Acknowledge { kind, tier, reply } => {
                let _ = reply.send(self.engine.acknowledge(kind, tier, now));
            }
            Command::Suppress {
                kind,
                tier,
                until,
                reply,
            } => {
                let _ = reply.send(self.engine.suppress(kind, tier, until, now));
            }
        }
    }

    /// Runs until every producer has hung up, then writes a shutdown snapshot.
    pub(crate) async fn run(
        mut self,
        mut messages: mpsc::Receiver<ConsumerMessage>,
        mut commands: mpsc::Receiver<Command>,
        mut limits: watch::Receiver<Arc<BudgetLimits>>,
        tick_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut commands_open = true;
        let mut limits_open = true;

        loop {
            tokio::select! {
                biased;
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => commands_open = false,
                },
                message = messages.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                changed = limits.changed(), if limits_open => {
                    if changed.is_err() {
                        limits_open = false;
                        continue;
                    }
                    let next = limits.borrow_and_update().clone();
                    let step = self.engine.set_limits(next, Utc::now());
                    self.apply_step(step);
                },
                _ = ticker.tick() => {
                    let step = self.engine.tick(Utc::now());
                    self.apply_step(step);
                }
            }
        }

        // Answer anything that raced the shutdown before dropping the channel.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            self.handle_command(command);
        }

        let snapshot = self.engine.save(SnapshotReason::Shutdown, Utc::now());
        if self.persist(&snapshot).is_ok() {
            tracing::info!(
                sequence = snapshot.sequence_number,
                events = self.engine.events_ingested(),
                "monitor stopped"
            );
        }
        self.queue.close();
    }
}
