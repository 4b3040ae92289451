// =============================================================================
// Regime-change notification bus
// =============================================================================
//
// Fan-out of accepted regime changes to any number of subscribers.
//
//   - one bounded tokio mpsc queue per subscriber
//   - publish never awaits: `try_send`, a full queue drops the event for that
//     subscriber only and bumps its `dropped` counter
//   - subscribers whose receiver is gone are pruned on the next publish
//   - the last `recent_capacity` changes are kept for the HTTP surface
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::runtime_config::NotifyConfig;
use crate::types::RegimeChange;

/// Receiving end handed to a subscriber.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<RegimeChange>,
}

struct Subscriber {
    id: u64,
    name: String,
    sender: mpsc::Sender<RegimeChange>,
    delivered: u64,
    dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStats {
    pub id: u64,
    pub name: String,
    pub delivered: u64,
    pub dropped: u64,
    /// Events waiting in the subscriber's queue.
    pub queued: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub pruned: usize,
}

pub struct EventBus {
    queue_capacity: usize,
    recent_capacity: usize,
    subscribers: RwLock<Vec<Subscriber>>,
    recent: RwLock<VecDeque<RegimeChange>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl EventBus {
    pub fn new(config: &NotifyConfig) -> Self {
        Self {
            queue_capacity: config.subscriber_queue_capacity.max(1),
            recent_capacity: config.recent_capacity,
            subscribers: RwLock::new(Vec::new()),
            recent: RwLock::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let name = name.into();
        info!(id, name = %name, capacity = self.queue_capacity, "notification subscriber added");
        self.subscribers.write().push(Subscriber {
            id,
            name,
            sender,
            delivered: 0,
            dropped: 0,
        });
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Deliver `change` to every subscriber without waiting on any of them.
    pub fn publish(&self, change: &RegimeChange) -> PublishReport {
        self.published.fetch_add(1, Ordering::SeqCst);
        {
            let mut recent = self.recent.write();
            recent.push_back(change.clone());
            while recent.len() > self.recent_capacity {
                recent.pop_front();
            }
        }

        let mut report = PublishReport::default();
        let mut subs = self.subscribers.write();
        subs.retain_mut(|sub| match sub.sender.try_send(change.clone()) {
            Ok(()) => {
                sub.delivered += 1;
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                sub.dropped += 1;
                report.dropped += 1;
                warn!(
                    subscriber = %sub.name,
                    dropped = sub.dropped,
                    "subscriber queue full, regime change dropped"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                report.pruned += 1;
                debug!(subscriber = %sub.name, "subscriber closed, pruning");
                false
            }
        });

        debug!(
            from = %change.old_regime,
            to = %change.new_regime,
            delivered = report.delivered,
            dropped = report.dropped,
            pruned = report.pruned,
            "regime change published"
        );
        report
    }

    /// Most recent `limit` changes, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<RegimeChange> {
        let recent = self.recent.read();
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> Vec<SubscriberStats> {
        self.subscribers
            .read()
            .iter()
            .map(|s| SubscriberStats {
                id: s.id,
                name: s.name.clone(),
                delivered: s.delivered,
                dropped: s.dropped,
                queued: self.queue_capacity - s.sender.capacity(),
            })
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.published())
            .finish()
    }
}
