//! The running monitor: producers per source, one consumer owning the engine,
//! and a dispatcher feeding the notifier.

mod consumer;
mod producer;

use std::sync::Arc;

use budget_core::{
    AlertTier, AlertTransition, BudgetLimits, HandoffStore, LiveStatus, SafetyVerdict,
    SnapshotReason, SourceCursor, StoreError, WindowKind,
};
use budget_engine::{BudgetEngine, RehydrateOutcome};
use chrono::{DateTime, Utc};
use ingest::{SourceHandle, UsageSource};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::MonitorConfig;
use crate::error::{AppError, Result};
use crate::health::HealthTracker;
use crate::notifier::{NotificationQueue, Notifier, spawn_dispatcher};

use consumer::Consumer;
use producer::{ProducerContext, supervise};

pub(crate) enum Command {
    LiveStatus {
        reply: oneshot::Sender<LiveStatus>,
    },
    Verdict {
        reply: oneshot::Sender<SafetyVerdict>,
    },
    Save {
        reply: oneshot::Sender<std::result::Result<u64, StoreError>>,
    },
    Acknowledge {
        kind: WindowKind,
        tier: AlertTier,
        reply: oneshot::Sender<Option<AlertTransition>>,
    },
    Suppress {
        kind: WindowKind,
        tier: AlertTier,
        until: DateTime<Utc>,
        reply: oneshot::Sender<Option<AlertTransition>>,
    },
}

/// Cheap, cloneable query surface. Every call is answered by the consumer task.
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::Sender<Command>,
}

impl MonitorHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| AppError::MonitorStopped)?;
        response.await.map_err(|_| AppError::MonitorStopped)
    }

    pub async fn live_status(&self) -> Result<LiveStatus> {
        self.request(|reply| Command::LiveStatus { reply }).await
    }

    /// Never fails: an unreachable monitor answers "not safe".
    pub async fn budget_verdict(&self) -> SafetyVerdict {
        match self.request(|reply| Command::Verdict { reply }).await {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!(error = %err, "budget verdict unavailable");
                SafetyVerdict {
                    ok: false,
                    percent_used: 0.0,
                    reason: "monitor unreachable; usage unknown".to_string(),
                    window: None,
                }
            }
        }
    }

    /// Writes an explicit handoff snapshot and returns its sequence number.
    pub async fn save_snapshot(&self) -> Result<u64> {
        let saved = self.request(|reply| Command::Save { reply }).await?;
        Ok(saved?)
    }

    pub async fn acknowledge(
        &self,
        kind: WindowKind,
        tier: AlertTier,
    ) -> Result<Option<AlertTransition>> {
        self.request(|reply| Command::Acknowledge { kind, tier, reply })
            .await
    }

    pub async fn suppress(
        &self,
        kind: WindowKind,
        tier: AlertTier,
        until: DateTime<Utc>,
    ) -> Result<Option<AlertTransition>> {
        self.request(|reply| Command::Suppress {
            kind,
            tier,
            until,
            reply,
        })
        .await
    }
}

/// What startup found before the live loop began.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub restored_sequence: Option<u64>,
    pub failed_closed: bool,
    pub sources: usize,
    pub backfilled_events: usize,
}

pub struct Monitor {
    handle: MonitorHandle,
    limits: Arc<watch::Sender<Arc<BudgetLimits>>>,
    shutdown: watch::Sender<bool>,
    queue: Arc<NotificationQueue>,
    report: StartupReport,
    supervisor: JoinHandle<()>,
    consumer: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Monitor {
    /// Restores the last snapshot, backfills every source, then starts the
    /// producer, consumer and dispatcher tasks.
    pub async fn start(
        config: &MonitorConfig,
        store: Box<dyn HandoffStore>,
        source: Arc<dyn UsageSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate().map_err(AppError::Config)?;
        let runtime = config.runtime.clone();
        let now = Utc::now();

        let queue = Arc::new(NotificationQueue::new(runtime.notification_queue_capacity));
        let mut consumer = Consumer {
            engine: BudgetEngine::new(config.engine_config(), Arc::new(config.limits.clone())),
            store,
            health: HealthTracker::new(),
            queue: Arc::clone(&queue),
            keep_snapshots: config.store.keep_snapshots,
        };
        let mut report = restore(&mut consumer);

        let list_source = Arc::clone(&source);
        let handles = tokio::task::spawn_blocking(move || list_source.list_sources())
            .await
            .map_err(|err| AppError::Message(format!("source discovery task failed: {err}")))??;
        report.sources = handles.len();

        let horizon = now - consumer.engine.config().aggregator.long_quota_length;
        let cursors = consumer.engine.cursors().clone();
        let backfill_source = Arc::clone(&source);
        let backfill_handles = handles.clone();
        let backfill = tokio::task::spawn_blocking(move || {
            ingest::backfill(
                backfill_source.as_ref(),
                &backfill_handles,
                &cursors,
                horizon,
            )
        })
        .await
        .map_err(|err| AppError::Message(format!("backfill task failed: {err}")))?;

        consumer.health.record_backfill(&backfill.stats);
        report.backfilled_events = backfill.events.len();
        let mut step = consumer.engine.ingest_events(&backfill.events, now);
        consumer.engine.update_cursors(backfill.cursors);
        if !handles.is_empty() || report.restored_sequence.is_some() {
            consumer.engine.mark_usage_known(true);
        }
        // Snapshots taken mid-backfill carry pre-backfill cursors; replace them.
        let closed_during_backfill = !step.snapshots.is_empty();
        step.snapshots.clear();
        consumer.apply_step(step);
        if closed_during_backfill {
            let snapshot = consumer.engine.save(SnapshotReason::BlockClosed, now);
            let _ = consumer.persist(&snapshot);
        }
        tracing::info!(
            sources = report.sources,
            events = report.backfilled_events,
            parse_errors = backfill.stats.parse_errors,
            skipped = backfill.stats.files_skipped,
            "backfill applied"
        );

        let initial = initial_producers(handles, &consumer.engine);
        let (tx, messages) = mpsc::channel(runtime.event_queue_capacity);
        let (commands_tx, commands) = mpsc::channel(runtime.command_queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (limits_tx, limits_rx) = watch::channel(Arc::clone(consumer.engine.limits()));

        let dispatcher = spawn_dispatcher(Arc::clone(&queue), notifier);
        let consumer = tokio::spawn(consumer.run(
            messages,
            commands,
            limits_rx,
            runtime.tick_interval(),
        ));
        let ctx = ProducerContext {
            source,
            tx,
            shutdown: shutdown_rx,
            poll_interval: runtime.poll_interval(),
            max_backoff: runtime.max_backoff(),
        };
        let supervisor = tokio::spawn(supervise(ctx, initial, runtime));

        Ok(Self {
            handle: MonitorHandle {
                commands: commands_tx,
            },
            limits: Arc::new(limits_tx),
            shutdown,
            queue,
            report,
            supervisor,
            consumer,
            dispatcher,
        })
    }

    pub fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }

    /// Publishing here reaches the consumer as a whole new limit set.
    pub fn limits_sender(&self) -> Arc<watch::Sender<Arc<BudgetLimits>>> {
        Arc::clone(&self.limits)
    }

    pub fn report(&self) -> &StartupReport {
        &self.report
    }

    /// Stops producers (each flushes its trailing line), lets the consumer
    /// drain and write a shutdown snapshot, then drains pending notifications.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let supervisor = self.supervisor.await;
        let consumer = self.consumer.await;
        self.queue.close();
        let dispatcher = self.dispatcher.await;
        for (task, joined) in [
            ("supervisor", supervisor),
            ("consumer", consumer),
            ("dispatcher", dispatcher),
        ] {
            if let Err(err) = joined {
                return Err(AppError::Message(format!("{task} task failed: {err}")));
            }
        }
        Ok(())
    }
}

fn restore(consumer: &mut Consumer) -> StartupReport {
    let mut report = StartupReport::default();
    match consumer.store.load_latest() {
        Ok(Some(snapshot)) => match consumer.engine.rehydrate(&snapshot) {
            Ok(RehydrateOutcome::Restored { sequence }) => {
                report.restored_sequence = Some(sequence);
            }
            Ok(RehydrateOutcome::FailedClosed { .. }) => report.failed_closed = true,
            Err(err) => {
                consumer.engine.fail_closed(&err.to_string());
                report.failed_closed = true;
            }
        },
        Ok(None) => tracing::info!("no handoff snapshot; starting fresh"),
        Err(err) => {
            consumer.health.record_store_error();
            consumer.engine.fail_closed(&err.to_string());
            report.failed_closed = true;
            match consumer.store.latest_sequence() {
                Ok(Some(sequence)) => consumer.engine.resume_after(sequence),
                Ok(None) => {}
                Err(err) => {
                    consumer.health.record_store_error();
                    tracing::error!(error = %err, "cannot read latest snapshot sequence");
                }
            }
        }
    }
    report
}

fn initial_producers(
    handles: Vec<SourceHandle>,
    engine: &BudgetEngine,
) -> Vec<(SourceHandle, SourceCursor)> {
    handles
        .into_iter()
        .map(|handle| {
            let cursor = engine.cursor(&handle.id).cloned().unwrap_or_default();
            (handle, cursor)
        })
        .collect()
}
