use opguard_core::QueueFullError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::debug;
use validator::Validate;

/// What a full queue does with a new item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Refuse the new item
    #[default]
    Reject,
    /// Evict the oldest item to make room
    DropOldest,
    /// Silently discard the new item
    DropNewest,
}

/// Capacity and overflow behavior of one queue
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct QueueSettings {
    #[validate(range(min = 1))]
    pub max_size: usize,
    #[serde(default)]
    pub drop_policy: DropPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: 1000,
            drop_policy: DropPolicy::Reject,
        }
    }
}

/// Counters exposed by [`BoundedQueue::stats`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    pub size: usize,
    pub max_size: usize,
    pub drop_policy: DropPolicy,
    pub enqueued: u64,
    pub dequeued: u64,
    pub rejected: u64,
    pub dropped: u64,
}

/// FIFO queue with a fixed capacity.
///
/// The size never exceeds `max_size`. On overflow the [`DropPolicy`] decides
/// whether the new item is refused, the oldest item is evicted, or the new
/// item is discarded. Evicted and discarded items are handed back to the
/// caller from [`put`](Self::put).
#[derive(Debug)]
pub struct BoundedQueue<T = Value> {
    name: String,
    max_size: usize,
    drop_policy: DropPolicy,
    items: Mutex<VecDeque<T>>,
    available: Notify,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: impl Into<String>, max_size: usize, drop_policy: DropPolicy) -> Self {
        let max_size = max_size.max(1);
        Self {
            name: name.into(),
            max_size,
            drop_policy,
            items: Mutex::new(VecDeque::with_capacity(max_size.min(1024))),
            available: Notify::new(),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn from_settings(name: impl Into<String>, settings: QueueSettings) -> Self {
        Self::new(name, settings.max_size, settings.drop_policy)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }

    /// Add an item.
    ///
    /// Returns `Ok(None)` when the item was appended, `Ok(Some(item))` with
    /// the item that was dropped to honor the policy, or [`QueueFullError`]
    /// under [`DropPolicy::Reject`].
    pub fn put(&self, item: T) -> Result<Option<T>, QueueFullError> {
        let mut items = self.lock();

        if items.len() < self.max_size {
            items.push_back(item);
            drop(items);
            self.enqueued.fetch_add(1, Ordering::Relaxed);
            self.available.notify_one();
            return Ok(None);
        }

        match self.drop_policy {
            DropPolicy::Reject => {
                let current_size = items.len();
                drop(items);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(QueueFullError {
                    queue_name: self.name.clone(),
                    capacity: self.max_size,
                    current_size,
                })
            }
            DropPolicy::DropOldest => {
                let evicted = items.pop_front();
                items.push_back(item);
                drop(items);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                self.available.notify_one();
                debug!(queue = %self.name, "Queue full, evicted oldest item");
                Ok(evicted)
            }
            DropPolicy::DropNewest => {
                drop(items);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %self.name, "Queue full, discarded new item");
                Ok(Some(item))
            }
        }
    }

    /// Remove the oldest item without waiting
    pub fn try_get(&self) -> Option<T> {
        let item = self.lock().pop_front();
        if item.is_some() {
            self.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Remove the oldest item, waiting until one is available
    pub async fn get(&self) -> T {
        loop {
            if let Some(item) = self.try_get() {
                return item;
            }
            self.available.notified().await;
        }
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.max_size
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            name: self.name.clone(),
            size: self.size(),
            max_size: self.max_size,
            drop_policy: self.drop_policy,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
