//! Process-wide broadcast of persistence-change events.
//!
//! [`EventBus`] fans each [`ChangeEvent`] out to every registered subscriber
//! through a bounded per-subscriber queue.
//!
//! ## Rules
//! - **Snapshot dispatch**: `publish` copies the subscriber set under a read
//!   lock and releases it before sending, so concurrent `subscribe` or
//!   `unsubscribe` never blocks on, or races with, an in-flight dispatch.
//! - **Registration order**: subscribers are visited in the order they joined.
//! - **Non-blocking**: `publish` uses `try_send`; a full queue drops that
//!   subscriber only, which later observes a source fault.
//! - **No persistence**: events published with no subscribers are lost.

use crate::error::FeedError;
use crate::store::WriteHook;
use crate::types::ChangeEvent;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Default per-subscriber queue capacity.
pub const DEFAULT_BUS_BUFFER: usize = 1000;

/// Identifier of a bus registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusSubscriberId(pub u64);

struct Subscriber {
    sender: Sender<ChangeEvent>,
    overflowed: Arc<AtomicBool>,
}

struct BusInner {
    subscribers: RwLock<BTreeMap<BusSubscriberId, Subscriber>>,
    next_id: AtomicU64,
    buffer_size: usize,
    closed: AtomicBool,
}

impl BusInner {
    fn remove(&self, id: BusSubscriberId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }
}

/// Broadcast channel for change events.
///
/// Cheap to clone; all clones share one subscriber set.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the default queue capacity.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUS_BUFFER)
    }

    /// Create a bus whose subscribers buffer up to `buffer_size` events.
    /// The minimum capacity is 1.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                buffer_size: buffer_size.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a new subscriber. It only sees events published after this
    /// call returns.
    pub fn subscribe(&self) -> BusSubscription {
        let id = BusSubscriberId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.inner.buffer_size);
        let overflowed = Arc::new(AtomicBool::new(false));

        if self.inner.closed.load(Ordering::SeqCst) {
            // Sender dropped here: the subscription completes immediately
            drop(sender);
        } else {
            self.inner.subscribers.write().insert(
                id,
                Subscriber {
                    sender,
                    overflowed: Arc::clone(&overflowed),
                },
            );
            tracing::debug!(subscriber = id.0, "bus subscriber registered");
        }

        BusSubscription {
            id,
            receiver,
            overflowed,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber. Unknown or already removed ids are a no-op.
    pub fn unsubscribe(&self, id: BusSubscriberId) {
        if self.inner.remove(id) {
            tracing::debug!(subscriber = id.0, "bus subscriber removed");
        }
    }

    /// Deliver an event to every subscriber registered right now.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let snapshot: Vec<(BusSubscriberId, Sender<ChangeEvent>, Arc<AtomicBool>)> = {
            let subs = self.inner.subscribers.read();
            subs.iter()
                .map(|(id, sub)| (*id, sub.sender.clone(), Arc::clone(&sub.overflowed)))
                .collect()
        };

        let mut delivered = 0;
        let mut to_remove = Vec::new();

        for (id, sender, overflowed) in snapshot {
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    overflowed.store(true, Ordering::SeqCst);
                    to_remove.push(id);
                }
                Err(TrySendError::Disconnected(_)) => to_remove.push(id),
            }
        }

        // Drop overflowed and abandoned subscribers
        if !to_remove.is_empty() {
            let mut subs = self.inner.subscribers.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    if sub.overflowed.load(Ordering::SeqCst) {
                        tracing::warn!(subscriber = id.0, "dropping slow bus subscriber");
                    }
                }
            }
        }

        delivered
    }

    /// Detach every subscriber and refuse new ones. Their streams end
    /// normally once drained.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let dropped = std::mem::take(&mut *self.inner.subscribers.write());
        tracing::info!(subscribers = dropped.len(), "event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteHook for EventBus {
    fn after_write(&self, event: &ChangeEvent) {
        self.publish(event.clone());
    }
}

/// A live registration on the bus. Dropping it unsubscribes.
pub struct BusSubscription {
    id: BusSubscriberId,
    receiver: Receiver<ChangeEvent>,
    overflowed: Arc<AtomicBool>,
    bus: Weak<BusInner>,
}

impl BusSubscription {
    pub fn id(&self) -> BusSubscriberId {
        self.id
    }

    /// Channel side, for use in `select!`.
    pub fn receiver(&self) -> &Receiver<ChangeEvent> {
        &self.receiver
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ChangeEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<ChangeEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Why the stream ended, once the channel has disconnected.
    ///
    /// `None` means the bus closed normally.
    pub fn end_error(&self) -> Option<FeedError> {
        if self.overflowed.load(Ordering::SeqCst) {
            Some(FeedError::SourceFault("event buffer overflow".into()))
        } else {
            None
        }
    }

    /// Detached handle that can drop this registration from another thread.
    pub fn releaser(&self) -> BusReleaser {
        BusReleaser {
            id: self.id,
            bus: Weak::clone(&self.bus),
        }
    }

    /// Release the registration now rather than on drop. Idempotent.
    pub fn release(&self) {
        self.releaser().release();
    }
}

/// Unregisters a [`BusSubscription`] without owning it.
#[derive(Clone)]
pub struct BusReleaser {
    id: BusSubscriberId,
    bus: Weak<BusInner>,
}

impl BusReleaser {
    /// Idempotent; a no-op once the bus itself is gone.
    pub fn release(&self) {
        if let Some(bus) = self.bus.upgrade() {
            if bus.remove(self.id) {
                tracing::debug!(subscriber = self.id.0, "bus subscriber released");
            }
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.release();
    }
}
