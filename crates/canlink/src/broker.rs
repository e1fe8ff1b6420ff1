// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 Western Formula Racing

//! Named-channel fan-out to streaming subscribers
//!
//! Each subscription owns a bounded queue; `publish` serializes once and
//! enqueues without blocking. A full queue drops that message for that
//! subscription only, never the subscription itself, so one stuck consumer
//! cannot slow the others. The broker holds only the sending halves under a
//! single mutex; the receiving halves live with the endpoints, which release
//! their slot on drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

/// Channel carrying one decoded record per message (live tail).
pub const CHANNEL_DECODED: &str = "can";

/// Channel carrying one JSON array per received batch.
pub const CHANNEL_CAN_MESSAGES: &str = "can_messages";

/// Channel carrying per-second link counters.
pub const CHANNEL_STATS: &str = "system_stats";

/// One published message, shared cheaply across subscribers.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: &'static str,
    /// Event correlation id (the CAN id on [`CHANNEL_DECODED`], the batch
    /// sequence on [`CHANNEL_CAN_MESSAGES`]).
    pub id: u64,
    pub payload: Arc<str>,
}

struct SubscriberSlot {
    channel: String,
    tx: mpsc::Sender<ChannelMessage>,
    dropped: u64,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<u64, SubscriberSlot>,
    closed: bool,
}

/// Multi-subscriber broadcaster with non-blocking backpressure.
pub struct Broker {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    queue_cap: usize,
}

impl Broker {
    pub fn new(queue_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            queue_cap: queue_cap.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::debug!("broker lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register a subscription for one named channel.
    ///
    /// After [`Broker::close`], the returned subscription observes immediate
    /// end-of-stream.
    pub fn subscribe(self: &Arc<Self>, channel: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_cap);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut registry = self.lock();
        if !registry.closed {
            registry.slots.insert(
                id,
                SubscriberSlot {
                    channel: channel.to_string(),
                    tx,
                    dropped: 0,
                },
            );
        }
        drop(registry);

        tracing::debug!(id, channel, "subscriber registered");
        Subscription {
            id,
            rx,
            broker: Arc::clone(self),
        }
    }

    /// Remove a subscription; safe to call more than once.
    pub fn unsubscribe(&self, id: u64) {
        if self.lock().slots.remove(&id).is_some() {
            tracing::debug!(id, "subscriber released");
        }
    }

    /// Fan a message out to every subscription on `channel`.
    ///
    /// Returns the number of queues the message was enqueued on. Full queues
    /// count a per-subscription drop; closed receivers are pruned.
    pub fn publish(&self, channel: &'static str, id: u64, payload: Arc<str>) -> usize {
        let msg = ChannelMessage {
            channel,
            id,
            payload,
        };

        let mut registry = self.lock();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (slot_id, slot) in registry.slots.iter_mut() {
            if slot.channel != channel {
                continue;
            }
            match slot.tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.dropped += 1;
                    if slot.dropped.is_power_of_two() {
                        tracing::debug!(
                            subscriber = *slot_id,
                            dropped = slot.dropped,
                            "slow subscriber, dropping messages"
                        );
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*slot_id),
            }
        }
        for slot_id in dead {
            registry.slots.remove(&slot_id);
        }
        delivered
    }

    /// Messages dropped so far for one subscription.
    pub fn dropped(&self, id: u64) -> Option<u64> {
        self.lock().slots.get(&id).map(|s| s.dropped)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().slots.len()
    }

    /// Drop every sender so all subscribers observe end-of-stream, and
    /// refuse future registrations.
    pub fn close(&self) {
        let mut registry = self.lock();
        registry.closed = true;
        registry.slots.clear();
    }
}

/// A live subscription; receiving end of one bounded queue.
///
/// Dropping the subscription releases its broker slot.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<ChannelMessage>,
    broker: Arc<Broker>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or `None` once the broker is closed.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for drain loops and tests.
    pub fn try_recv(&mut self) -> Option<ChannelMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.unsubscribe(self.id);
    }
}
