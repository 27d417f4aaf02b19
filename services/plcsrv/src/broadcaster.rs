//! Update broadcaster
//!
//! Keeps the latest record per device and fans every successful poll out to
//! subscribers. Each subscriber owns a bounded queue; when it is full the
//! oldest update is dropped, so a slow consumer never holds up a poll loop.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use crate::error::{CatalogError, PlcError, Result};
use crate::translator::DomainRecord;
use crate::value::DeviceId;

/// Reason reported for devices that have not been polled yet
pub const AWAITING_FIRST_POLL: &str = "awaiting first poll";

/// Queue depth of pending on-demand requests per device
const ON_DEMAND_QUEUE: usize = 8;

/// One published record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Update {
    pub device: DeviceId,
    /// Per-device, strictly increasing
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub record: DomainRecord,
}

/// Answer to a `latest` query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Latest {
    Available(Update),
    Unavailable {
        reason: String,
        since: DateTime<Utc>,
        /// Reconnection gave up after the configured number of cycles
        persistent: bool,
    },
}

impl Latest {
    pub fn is_available(&self) -> bool {
        matches!(self, Latest::Available(_))
    }

    pub fn is_persistent_failure(&self) -> bool {
        matches!(self, Latest::Unavailable { persistent: true, .. })
    }

    pub fn update(&self) -> Option<&Update> {
        match self {
            Latest::Available(update) => Some(update),
            Latest::Unavailable { .. } => None,
        }
    }
}

fn awaiting_first_poll() -> Latest {
    Latest::Unavailable {
        reason: AWAITING_FIRST_POLL.to_string(),
        since: Utc::now(),
        persistent: false,
    }
}

/// One-shot read served by a device's scheduler
#[derive(Debug)]
pub struct OnDemandRequest {
    pub reply: oneshot::Sender<Result<DomainRecord>>,
}

// ============================================================================
// Subscriber queues
// ============================================================================

#[derive(Debug)]
struct SubscriberQueue {
    items: Mutex<VecDeque<Update>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
    /// The receiver is gone; the broadcaster prunes the entry
    detached: AtomicBool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    /// Enqueue without waiting; returns true when an old update was dropped
    fn push(&self, update: Update) -> bool {
        let overflowed = {
            let mut items = self.items.lock();
            let overflowed = items.len() >= self.capacity;
            if overflowed {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(update);
            overflowed
        };
        self.notify.notify_one();
        overflowed
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

/// Receiving end of a queue subscription
#[derive(Debug)]
pub struct UpdateReceiver {
    queue: Arc<SubscriberQueue>,
}

impl UpdateReceiver {
    /// Next update, or `None` once unsubscribed and drained
    pub async fn recv(&mut self) -> Option<Update> {
        loop {
            if let Some(update) = self.try_recv() {
                return Some(update);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Update> {
        self.queue.items.lock().pop_front()
    }

    /// Updates discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.items.lock().len()
    }
}

impl Drop for UpdateReceiver {
    fn drop(&mut self) {
        self.queue.detached.store(true, Ordering::Release);
    }
}

/// Identifies a subscription for `unsubscribe`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    device: DeviceId,
}

impl SubscriptionHandle {
    pub fn device(&self) -> &DeviceId {
        &self.device
    }
}

struct Subscriber {
    id: u64,
    device: DeviceId,
    queue: Arc<SubscriberQueue>,
}

// ============================================================================
// Broadcaster
// ============================================================================

struct DeviceEntry {
    latest: Latest,
    next_sequence: u64,
}

/// Latest-record store plus per-device subscriptions
pub struct UpdateBroadcaster {
    queue_capacity: usize,
    devices: DashMap<DeviceId, DeviceEntry>,
    subscribers: RwLock<Vec<Subscriber>>,
    on_demand: DashMap<DeviceId, mpsc::Sender<OnDemandRequest>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for UpdateBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateBroadcaster")
            .field("devices", &self.devices.len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

impl UpdateBroadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            devices: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            on_demand: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start tracking a device and open its on-demand channel
    ///
    /// The device reports unavailable until its first publish. The returned
    /// receiver belongs to the device's scheduler.
    pub fn register_device(&self, device: DeviceId) -> mpsc::Receiver<OnDemandRequest> {
        let (tx, rx) = mpsc::channel(ON_DEMAND_QUEUE);
        self.devices.entry(device.clone()).or_insert_with(|| DeviceEntry {
            latest: awaiting_first_poll(),
            next_sequence: 1,
        });
        self.on_demand.insert(device, tx);
        rx
    }

    /// Devices registered so far
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Store a fresh record and hand it to every subscriber of the device
    ///
    /// Never waits on a subscriber.
    pub fn publish(&self, device: &DeviceId, record: DomainRecord) -> Update {
        let mut entry = self
            .devices
            .entry(device.clone())
            .or_insert_with(|| DeviceEntry {
                latest: awaiting_first_poll(),
                next_sequence: 1,
            });

        let update = Update {
            device: device.clone(),
            sequence: entry.next_sequence,
            timestamp: Utc::now(),
            record,
        };
        entry.next_sequence += 1;
        entry.latest = Latest::Available(update.clone());

        // Fan out under the entry lock so concurrent publishers of one device
        // cannot reorder updates in a queue
        let mut detached = false;
        for subscriber in self.subscribers.read().iter() {
            if subscriber.device != *device {
                continue;
            }
            if subscriber.queue.is_detached() {
                detached = true;
            } else if subscriber.queue.push(update.clone()) {
                debug!(
                    "Subscriber {} of {} is lagging, dropped oldest update",
                    subscriber.id, device
                );
            }
        }
        if detached {
            self.prune_detached();
        }
        update
    }

    fn prune_detached(&self) {
        self.subscribers.write().retain(|subscriber| {
            let keep = !subscriber.queue.is_detached();
            if !keep {
                debug!(
                    "Subscription {} on {} dropped its receiver, removed",
                    subscriber.id, subscriber.device
                );
            }
            keep
        });
    }

    /// Replace the device's latest record with an explicit unavailable marker
    ///
    /// `since` keeps the time the device first became unavailable.
    pub fn mark_unavailable(&self, device: &DeviceId, reason: impl Into<String>) {
        self.set_unavailable(device, reason.into(), false);
    }

    /// Report that reconnection gave up on the device
    ///
    /// Stays flagged until the next successful publish.
    pub fn mark_persistent_failure(&self, device: &DeviceId, reason: impl Into<String>) {
        self.set_unavailable(device, reason.into(), true);
    }

    fn set_unavailable(&self, device: &DeviceId, reason: String, persistent: bool) {
        let mut entry = self
            .devices
            .entry(device.clone())
            .or_insert_with(|| DeviceEntry {
                latest: awaiting_first_poll(),
                next_sequence: 1,
            });

        let (since, was_persistent) = match &entry.latest {
            Latest::Unavailable {
                since, persistent, ..
            } => (*since, *persistent),
            Latest::Available(_) => {
                warn!("{} unavailable: {}", device, reason);
                (Utc::now(), false)
            },
        };
        entry.latest = Latest::Unavailable {
            reason,
            since,
            persistent: persistent || was_persistent,
        };
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Latest record of a device, or why there is none
    pub fn latest(&self, device: &str) -> Latest {
        match self.devices.get(device) {
            Some(entry) => entry.latest.clone(),
            None => Latest::Unavailable {
                reason: format!("device {} is not monitored", device),
                since: Utc::now(),
                persistent: false,
            },
        }
    }

    /// Read a device now, outside its poll cadence
    ///
    /// The request is served by the device's scheduler between polls, so the
    /// result is also published in feed order.
    pub async fn request_on_demand(&self, device: &str) -> Result<DomainRecord> {
        let tx = self
            .on_demand
            .get(device)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CatalogError::UnknownDevice(device.to_string()))?;

        let (reply, response) = oneshot::channel();
        tx.send(OnDemandRequest { reply })
            .await
            .map_err(|_| PlcError::unavailable(device, "scheduler stopped"))?;
        response
            .await
            .map_err(|_| PlcError::unavailable(device, "scheduler dropped the request"))?
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe with a bounded queue the caller drains
    pub fn subscribe_queue(
        &self,
        device: impl Into<DeviceId>,
    ) -> (SubscriptionHandle, UpdateReceiver) {
        let device = device.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.queue_capacity));

        self.subscribers.write().push(Subscriber {
            id,
            device: device.clone(),
            queue: Arc::clone(&queue),
        });
        debug!("Subscription {} opened on {}", id, device);

        (SubscriptionHandle { id, device }, UpdateReceiver { queue })
    }

    /// Subscribe with a callback run on its own dispatch task
    pub fn subscribe<F>(&self, device: impl Into<DeviceId>, consumer: F) -> SubscriptionHandle
    where
        F: Fn(Update) + Send + Sync + 'static,
    {
        let (handle, mut rx) = self.subscribe_queue(device);
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                consumer(update);
            }
        });
        handle
    }

    /// Stop a subscription; its receiver drains what is queued, then ends
    ///
    /// Returns false when the handle was already unsubscribed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.write();
        match subscribers.iter().position(|s| s.id == handle.id) {
            Some(idx) => {
                let subscriber = subscribers.swap_remove(idx);
                subscriber.queue.close();
                debug!("Subscription {} on {} closed", handle.id, handle.device);
                true
            },
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Close every subscription and on-demand channel
    pub fn close(&self) {
        for subscriber in self.subscribers.write().drain(..) {
            subscriber.queue.close();
        }
        self.on_demand.clear();
    }
}
