// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Multi-consumer broadcast with per-subscriber bounded inboxes.
//!
//! The producer never blocks: each subscriber owns a small inbox and, when it
//! is full, the oldest queued item is dropped to make room for the newest.
//! A subscriber whose delivery fails is removed so one broken consumer cannot
//! affect the others or the producer loop.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

/// Default inbox capacity per subscriber.
pub const DEFAULT_INBOX_CAPACITY: usize = 10;

/// Why a delivery attempt failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscriber closed")]
    Closed,

    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Receiving side of a broadcast.
pub trait Subscriber<T>: Send + Sync {
    /// Accept one item. Must not block.
    fn deliver(&self, item: T) -> Result<(), DeliveryError>;

    /// Called once when the hub goes away.
    fn close(&self) {}
}

impl<T, F> Subscriber<T> for F
where
    F: Fn(T) -> Result<(), DeliveryError> + Send + Sync,
{
    fn deliver(&self, item: T) -> Result<(), DeliveryError> {
        self(item)
    }
}

/// Opaque handle identifying a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

type Registry<T> = Vec<(SubscriberId, Arc<dyn Subscriber<T>>)>;

/// Fan-out point shared by a producer and any number of subscribers.
pub struct BroadcastHub<T> {
    subscribers: Mutex<Registry<T>>,
    capacity: usize,
}

impl<T> fmt::Debug for BroadcastHub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Default for BroadcastHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BroadcastHub<T> {
    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    /// Unregister a subscriber. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.registry();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        let removed = subscribers.len() != before;
        if removed {
            info!("Subscriber {} removed. Total subscribers: {}", id, subscribers.len());
        }
        removed
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry<T>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> BroadcastHub<T> {
    /// Create a hub whose inboxes hold [`DEFAULT_INBOX_CAPACITY`] items.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INBOX_CAPACITY)
    }

    /// Create a hub with a custom inbox capacity (at least 1).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a custom subscriber.
    pub fn add_subscriber(&self, subscriber: Arc<dyn Subscriber<T>>) -> SubscriberId {
        let id = SubscriberId::new();
        let mut subscribers = self.registry();
        subscribers.push((id, subscriber));
        info!("Subscriber {} added. Total subscribers: {}", id, subscribers.len());
        id
    }

    /// Register a new bounded inbox and return its receiving end.
    pub fn subscribe(&self) -> Inbox<T> {
        let shared = Arc::new(InboxShared::new(self.capacity));
        let id = self.add_subscriber(Arc::clone(&shared) as Arc<dyn Subscriber<T>>);
        Inbox { id, shared }
    }

    /// Deliver `item` to every subscriber, in registration order.
    ///
    /// Iterates over a snapshot, so subscribers may be added or removed
    /// concurrently. Subscribers that fail (or panic) are removed. Returns the
    /// number of successful deliveries.
    pub fn publish(&self, item: &T) -> usize {
        let snapshot: Registry<T> = self.registry().clone();
        let mut failed = Vec::new();

        for (id, subscriber) in &snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| subscriber.deliver(item.clone())));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(DeliveryError::Closed)) => {
                    debug!("Subscriber {} closed", id);
                    failed.push(*id);
                }
                Ok(Err(e)) => {
                    warn!("Error broadcasting to subscriber {}: {}", id, e);
                    failed.push(*id);
                }
                Err(_) => {
                    warn!("Subscriber {} panicked during delivery", id);
                    failed.push(*id);
                }
            }
        }

        if !failed.is_empty() {
            let mut subscribers = self.registry();
            subscribers.retain(|(id, _)| !failed.contains(id));
            info!(
                "Removed {} failed subscriber(s). Total subscribers: {}",
                failed.len(),
                subscribers.len()
            );
        }

        snapshot.len() - failed.len()
    }
}

impl<T> Drop for BroadcastHub<T> {
    fn drop(&mut self) {
        for (_, subscriber) in self.registry().drain(..) {
            subscriber.close();
        }
    }
}

struct InboxShared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    receiver_gone: AtomicBool,
    hub_gone: AtomicBool,
    dropped: AtomicU64,
}

impl<T> InboxShared<T> {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            receiver_gone: AtomicBool::new(false),
            hub_gone: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send> Subscriber<T> for InboxShared<T> {
    fn deliver(&self, item: T) -> Result<(), DeliveryError> {
        if self.receiver_gone.load(Ordering::Acquire) {
            return Err(DeliveryError::Closed);
        }

        {
            let mut queue = self.queue();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(item);
        }

        self.notify.notify_one();
        Ok(())
    }

    fn close(&self) {
        self.hub_gone.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Receiving end of a bounded, drop-oldest inbox.
///
/// Dropping the inbox unregisters it on the hub's next publish.
pub struct Inbox<T> {
    id: SubscriberId,
    shared: Arc<InboxShared<T>>,
}

impl<T> fmt::Debug for Inbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T> Inbox<T> {
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next item. Returns `None` once the hub is gone and the
    /// inbox is drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            if let Some(item) = self.try_recv() {
                return Some(item);
            }
            if self.shared.hub_gone.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Take the oldest queued item without waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<T> {
        self.shared.queue().pop_front()
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.queue().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items discarded because the inbox was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for Inbox<T> {
    fn drop(&mut self) {
        self.shared.receiver_gone.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_full_inbox_drops_oldest() {
        let hub = BroadcastHub::new();
        let inbox = hub.subscribe();

        for i in 0..10 {
            hub.publish(&i);
        }
        assert_eq!(inbox.len(), 10);

        hub.publish(&10);
        assert_eq!(inbox.len(), 10);
        assert_eq!(inbox.dropped(), 1);

        let items: Vec<i32> = std::iter::from_fn(|| inbox.try_recv()).collect();
        assert_eq!(items, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_every_subscriber_receives() {
        let hub = BroadcastHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();

        assert_eq!(hub.publish(&"frame"), 2);
        assert_eq!(a.try_recv(), Some("frame"));
        assert_eq!(b.try_recv(), Some("frame"));
    }

    #[test]
    fn test_failing_subscriber_removed() {
        let hub: BroadcastHub<u32> = BroadcastHub::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        hub.add_subscriber(Arc::new(move |_item: u32| -> Result<(), DeliveryError> {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError::Failed("socket closed".to_string()))
        }));
        let healthy = hub.subscribe();

        assert_eq!(hub.publish(&1), 1);
        assert_eq!(hub.subscriber_count(), 1);
        hub.publish(&2);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.len(), 2);
    }

    #[test]
    fn test_panicking_subscriber_removed() {
        let hub: BroadcastHub<u32> = BroadcastHub::new();
        hub.add_subscriber(Arc::new(|_item: u32| -> Result<(), DeliveryError> {
            panic!("consumer bug")
        }));
        let healthy = hub.subscribe();

        assert_eq!(hub.publish(&7), 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(healthy.try_recv(), Some(7));
    }

    #[test]
    fn test_dropped_inbox_pruned_on_publish() {
        let hub = BroadcastHub::new();
        let inbox = hub.subscribe();
        drop(inbox);
        assert_eq!(hub.subscriber_count(), 1);

        assert_eq!(hub.publish(&1), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe_during_publish() {
        let hub: Arc<BroadcastHub<u32>> = Arc::new(BroadcastHub::new());
        let victim = hub.subscribe();
        let victim_id = victim.id();

        let hub_clone = Arc::clone(&hub);
        hub.add_subscriber(Arc::new(move |_item: u32| -> Result<(), DeliveryError> {
            hub_clone.unsubscribe(victim_id);
            Ok(())
        }));
        let last = hub.subscribe();

        // The snapshot still covers the victim for this round.
        assert_eq!(hub.publish(&1), 3);
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(last.try_recv(), Some(1));
        assert_eq!(victim.try_recv(), Some(1));

        hub.publish(&2);
        assert!(victim.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let hub: Arc<BroadcastHub<u32>> = Arc::new(BroadcastHub::new());
        let inbox = hub.subscribe();

        let producer = Arc::clone(&hub);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.publish(&42);
        });

        let item = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap();
        assert_eq!(item, Some(42));
    }

    #[tokio::test]
    async fn test_recv_ends_when_hub_dropped() {
        let hub: BroadcastHub<u32> = BroadcastHub::new();
        let inbox = hub.subscribe();
        hub.publish(&1);
        drop(hub);

        assert_eq!(inbox.recv().await, Some(1));
        assert_eq!(inbox.recv().await, None);
    }
}
