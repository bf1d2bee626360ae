use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use budget_core::{SourceCursor, UsageEvent};
use ingest::{ParsedLine, SourceHandle, SourceWatch, StreamParser, UsageSource};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::config::RuntimeSettings;

/// Events parsed from one read of one source, plus where the next read starts.
#[derive(Debug, Clone)]
pub(crate) struct SourceBatch {
    pub source: String,
    pub events: Vec<UsageEvent>,
    pub cursor: SourceCursor,
    pub bytes_read: u64,
    pub rotated: bool,
    pub parse_errors: u64,
    pub recoverable_parse_errors: u64,
    pub more: bool,
}

#[derive(Debug)]
pub(crate) enum ConsumerMessage {
    Batch(SourceBatch),
    SourceError { source: String, message: String },
}

/// Reads and parses once from `cursor`.
///
/// With `flush_partial`, a trailing line without a newline is parsed too and
/// consumed unless it looks truncated.
pub(crate) fn read_and_parse(
    source: &dyn UsageSource,
    handle: &SourceHandle,
    cursor: &SourceCursor,
    flush_partial: bool,
) -> ingest::Result<SourceBatch> {
    let batch = source.read_since(handle, cursor)?;
    let mut parser = StreamParser::new(handle, &batch.cursor);
    let mut parsed = parser.parse_lines(&batch.lines);
    let mut next = batch.cursor;
    let mut bytes_read = batch.bytes_read;

    if flush_partial
        && !batch.more
        && let Some(partial) = batch.partial
    {
        let consume = match parser.parse_line(&partial.text) {
            Ok(ParsedLine::Usage(event)) => {
                parsed.events.push(event);
                true
            }
            Ok(_) => true,
            Err(err) if err.recoverable => {
                tracing::debug!(source = %handle.id, error = %err, "leaving truncated trailing line");
                false
            }
            Err(err) => {
                tracing::warn!(source = %handle.id, error = %err, "skipping malformed trailing line");
                parsed.errors.push(err);
                true
            }
        };
        if consume {
            next.offset = next.offset.saturating_add(partial.len);
            bytes_read = bytes_read.saturating_add(partial.len);
        }
    }
    parser.carry_into(&mut next);

    Ok(SourceBatch {
        source: handle.id.clone(),
        parse_errors: parsed.fatal_errors(),
        recoverable_parse_errors: parsed.recoverable_errors(),
        events: parsed.events,
        cursor: next,
        bytes_read,
        rotated: batch.rotated,
        more: batch.more,
    })
}

#[derive(Clone)]
pub(crate) struct ProducerContext {
    pub source: Arc<dyn UsageSource>,
    pub tx: mpsc::Sender<ConsumerMessage>,
    pub shutdown: watch::Receiver<bool>,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
}

enum Drain {
    Progressed,
    Idle,
    Closed,
}

/// Follows one source until shutdown, then flushes its trailing line once.
pub(crate) async fn run_producer(
    mut ctx: ProducerContext,
    handle: SourceHandle,
    mut cursor: SourceCursor,
) {
    let mut changes = match ctx.source.watch(&handle) {
        Ok(changes) => changes,
        Err(err) => {
            tracing::debug!(source = %handle.id, error = %err, "watch unavailable; polling");
            SourceWatch::polling()
        }
    };
    let mut backoff = ctx.poll_interval;
    let mut last_error: Option<String> = None;

    loop {
        match drain(&ctx, &handle, &mut cursor, false, &mut last_error).await {
            Drain::Closed => return,
            Drain::Progressed => backoff = ctx.poll_interval,
            Drain::Idle => backoff = (backoff * 2).min(ctx.max_backoff),
        }

        tokio::select! {
            biased;
            result = ctx.shutdown.changed() => {
                if result.is_err() || *ctx.shutdown.borrow() {
                    break;
                }
            }
            alive = changes.changed() => {
                if alive {
                    backoff = ctx.poll_interval;
                } else {
                    tracing::debug!(source = %handle.id, "watcher closed; polling");
                    changes = SourceWatch::polling();
                }
            }
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    drain(&ctx, &handle, &mut cursor, true, &mut last_error).await;
    tracing::debug!(source = %handle.id, offset = cursor.offset, "producer stopped");
}

async fn drain(
    ctx: &ProducerContext,
    handle: &SourceHandle,
    cursor: &mut SourceCursor,
    flush_partial: bool,
    last_error: &mut Option<String>,
) -> Drain {
    let mut progressed = false;
    loop {
        let source = Arc::clone(&ctx.source);
        let read_handle = handle.clone();
        let read_cursor = cursor.clone();
        let read = tokio::task::spawn_blocking(move || {
            read_and_parse(source.as_ref(), &read_handle, &read_cursor, flush_partial)
        })
        .await;

        let batch = match read {
            Ok(Ok(batch)) => batch,
            Ok(Err(err)) => {
                let message = err.to_string();
                if last_error.as_deref() != Some(message.as_str()) {
                    tracing::warn!(source = %handle.id, error = %message, "source read failed; retrying");
                    *last_error = Some(message.clone());
                    let report = ConsumerMessage::SourceError {
                        source: handle.id.clone(),
                        message,
                    };
                    if ctx.tx.send(report).await.is_err() {
                        return Drain::Closed;
                    }
                }
                break;
            }
            Err(err) => {
                tracing::error!(source = %handle.id, error = %err, "source read task failed");
                break;
            }
        };
        *last_error = None;

        let more = batch.more;
        let moved = batch.bytes_read > 0 || batch.rotated || batch.cursor != *cursor;
        *cursor = batch.cursor.clone();
        if moved {
            progressed = true;
            if ctx.tx.send(ConsumerMessage::Batch(batch)).await.is_err() {
                return Drain::Closed;
            }
        }
        if !more {
            break;
        }
    }
    if progressed {
        Drain::Progressed
    } else {
        Drain::Idle
    }
}

/// Runs one producer per source and starts new ones as files appear.
pub(crate) async fn supervise(
    ctx: ProducerContext,
    initial: Vec<(SourceHandle, SourceCursor)>,
    runtime: RuntimeSettings,
) {
    let mut shutdown = ctx.shutdown.clone();
    let mut producers = JoinSet::new();
    let mut known = HashSet::new();
    for (handle, cursor) in initial {
        known.insert(handle.id.clone());
        producers.spawn(run_producer(ctx.clone(), handle, cursor));
    }
    tracing::info!(sources = known.len(), "producers started");

    let mut discovery = tokio::time::interval(runtime.discovery_interval());
    discovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    discovery.tick().await;

    loop {
        tokio::select! {
            biased;
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(joined) = producers.join_next(), if !producers.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "producer task failed");
                }
            }
            _ = discovery.tick() => {
                let source = Arc::clone(&ctx.source);
                let listed = tokio::task::spawn_blocking(move || source.list_sources()).await;
                let handles = match listed {
                    Ok(Ok(handles)) => handles,
                    Ok(Err(err)) => {
                        tracing::warn!(error = %err, "source discovery failed");
                        continue;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "source discovery task failed");
                        continue;
                    }
                };
                for handle in handles {
                    if known.insert(handle.id.clone()) {
                        tracing::info!(source = %handle.id, "new source discovered");
                        producers.spawn(run_producer(ctx.clone(), handle, SourceCursor::default()));
                    }
                }
            }
        }
    }

    while let Some(joined) = producers.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "producer task failed during shutdown");
        }
    }
    tracing::debug!("all producers stopped");
}
