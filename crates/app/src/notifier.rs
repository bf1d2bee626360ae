use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use budget_core::{AlertTier, Notification};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Delivers alert notifications somewhere a person will see them.
///
/// Called from the dispatcher task only, one notification at a time.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Writes notifications to the log at a level matching their tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) {
        let percent = notification.percent_used.unwrap_or_default();
        match notification.tier {
            AlertTier::Info => tracing::info!(
                window = %notification.window,
                percent,
                "{}",
                notification.message
            ),
            AlertTier::Warning => tracing::warn!(
                window = %notification.window,
                percent,
                "{}",
                notification.message
            ),
            AlertTier::Critical => tracing::error!(
                window = %notification.window,
                percent,
                "{}",
                notification.message
            ),
        }
    }
}

/// Bounded hand-off between the consumer and a slow notifier.
///
/// Pushing never blocks; when full the oldest pending notification is dropped
/// and counted.
pub struct NotificationQueue {
    items: Mutex<VecDeque<Notification>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    ready: Notify,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            ready: Notify::new(),
        }
    }

    pub fn push(&self, notification: Notification) {
        {
            let mut items = self.lock();
            while items.len() >= self.capacity {
                if let Some(oldest) = items.pop_front() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        tier = %oldest.tier,
                        window = %oldest.window,
                        "notification queue full; dropped oldest"
                    );
                }
            }
            items.push_back(notification);
        }
        self.ready.notify_one();
    }

    /// Next notification, or `None` once closed and drained.
    pub async fn pop(&self) -> Option<Notification> {
        loop {
            let ready = self.ready.notified();
            if let Some(item) = self.lock().pop_front() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            ready.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Notification>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drains `queue` into `notifier` until the queue is closed and empty.
pub fn spawn_dispatcher(
    queue: Arc<NotificationQueue>,
    notifier: Arc<dyn Notifier>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = queue.pop().await {
            notifier.notify(&notification);
        }
        tracing::debug!("notification dispatcher stopped");
    })
}
