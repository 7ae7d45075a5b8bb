//! Per-connection subscription registry.
//!
//! Each started subscription gets a slot keyed by its client id and a
//! worker thread that pulls from the pipeline and delivers through the
//! connection's [`TransportSession`].
//!
//! ## Rules
//! - **Ordered**: one worker per subscription, so payloads leave in the
//!   order the source emitted them.
//! - **Gate**: the worker checks the state and delivers while holding the
//!   slot lock; `stop` takes the same lock, so once `stop` returns no further
//!   delivery can start.
//! - **Release first**: the source is released and the worker joined before
//!   the slot enters `Cancelled`.
//! - **Isolation**: a fault ends only its own subscription.
//! - **Disconnect**: a `TransportClosed` seen by any worker cancels every
//!   subscription of the connection and refuses new ones.

use crate::error::{FeedError, Result};
use crate::resolvers::ReadingSelection;
use crate::transport::TransportSession;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use super::pipeline::{Next, Pipeline, SourceReleaser};
use super::types::{SubscriptionId, SubscriptionState};

/// State shared between a slot and its worker.
struct Shared {
    state: Mutex<SubscriptionState>,
    /// Set under the state lock when a stop begins.
    stopping: AtomicBool,
}

struct Slot {
    shared: Arc<Shared>,
    cancel: Option<Sender<()>>,
    releaser: Option<SourceReleaser>,
    worker: Option<JoinHandle<()>>,
}

impl Slot {
    fn pending() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SubscriptionState::Pending),
                stopping: AtomicBool::new(false),
            }),
            cancel: None,
            releaser: None,
            worker: None,
        }
    }

    fn state(&self) -> SubscriptionState {
        self.shared.state.lock().clone()
    }

    fn take_parts(&mut self) -> StopParts {
        StopParts {
            shared: Arc::clone(&self.shared),
            cancel: self.cancel.take(),
            releaser: self.releaser.take(),
            worker: self.worker.take(),
        }
    }
}

/// What a stop needs, moved out of a slot so only one caller joins a worker.
struct StopParts {
    shared: Arc<Shared>,
    cancel: Option<Sender<()>>,
    releaser: Option<SourceReleaser>,
    worker: Option<JoinHandle<()>>,
}

impl StopParts {
    fn stop(self) {
        stop_worker(&self.shared, self.cancel, self.releaser, self.worker);
    }
}

/// Registry state reachable from the workers.
struct RegistryInner {
    slots: RwLock<HashMap<SubscriptionId, Slot>>,
    transport_gone: AtomicBool,
}

impl RegistryInner {
    /// Cancel every live slot in place; cancelled slots stay visible.
    fn cancel_all_in_place(&self) -> usize {
        let parts: Vec<StopParts> = {
            let mut slots = self.slots.write();
            slots
                .values_mut()
                .filter(|slot| !slot.state().is_terminal())
                .map(Slot::take_parts)
                .collect()
        };
        let cancelled = parts.len();
        for part in parts {
            part.stop();
        }
        cancelled
    }
}

/// Tracks the subscriptions of one connection.
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
    session: Arc<dyn TransportSession>,
}

impl SubscriptionRegistry {
    pub fn new(session: Arc<dyn TransportSession>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: RwLock::new(HashMap::new()),
                transport_gone: AtomicBool::new(false),
            }),
            session,
        }
    }

    /// True once a delivery found the client gone.
    pub fn is_transport_closed(&self) -> bool {
        self.inner.transport_gone.load(Ordering::SeqCst)
    }

    /// Start a subscription.
    ///
    /// `attach` builds the pipeline; if it fails the slot is left `Failed`
    /// and the error is returned for the caller to report. An id that is
    /// still pending or active is rejected with `SubscriptionExists`.
    /// Terminal slots are pruned here. Once the transport is closed every
    /// start fails with `TransportClosed`.
    pub fn start<F>(&self, id: SubscriptionId, selection: ReadingSelection, attach: F) -> Result<()>
    where
        F: FnOnce() -> Result<Pipeline>,
    {
        let shared = {
            let mut slots = self.inner.slots.write();
            if self.is_transport_closed() {
                return Err(FeedError::TransportClosed);
            }
            slots.retain(|_, slot| !slot.state().is_terminal());
            if slots.contains_key(&id) {
                return Err(FeedError::SubscriptionExists(id.to_string()));
            }
            let slot = Slot::pending();
            let shared = Arc::clone(&slot.shared);
            slots.insert(id.clone(), slot);
            shared
        };

        let pipeline = match attach() {
            Ok(pipeline) => pipeline,
            Err(e) => {
                *shared.state.lock() = SubscriptionState::Failed(e.to_string());
                tracing::debug!(subscription = %id, error = %e, "subscription failed to attach");
                return Err(e);
            }
        };

        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let releaser = pipeline.releaser();
        let source = pipeline.source_kind();

        // Active before the worker can deliver anything
        *shared.state.lock() = SubscriptionState::Active;

        let spawned = {
            let shared = Arc::clone(&shared);
            let session = Arc::clone(&self.session);
            let registry = Arc::downgrade(&self.inner);
            let id = id.clone();
            thread::Builder::new()
                .name(format!("subscription-{}", id))
                .spawn(move || {
                    run_worker(id, pipeline, selection, cancel_rx, shared, session, registry)
                })
        };
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                releaser.release();
                *shared.state.lock() = SubscriptionState::Failed(e.to_string());
                return Err(e.into());
            }
        };

        let mut parts = Some((cancel_tx, releaser, worker));
        let mut slots = self.inner.slots.write();
        let gone = self.is_transport_closed();
        if let Some(slot) = slots.get_mut(&id) {
            if Arc::ptr_eq(&slot.shared, &shared) && !gone {
                if let Some((cancel_tx, releaser, worker)) = parts.take() {
                    slot.cancel = Some(cancel_tx);
                    slot.releaser = Some(releaser);
                    slot.worker = Some(worker);
                }
            }
        }
        drop(slots);

        if let Some((cancel_tx, releaser, worker)) = parts {
            // Slot vanished or transport closed meanwhile
            stop_worker(&shared, Some(cancel_tx), Some(releaser), Some(worker));
            return Err(FeedError::TransportClosed);
        }

        tracing::debug!(subscription = %id, source, "subscription active");
        Ok(())
    }

    /// Cancel a subscription. Unknown or finished ids are a no-op.
    ///
    /// Returns true if a pending or active subscription was cancelled.
    pub fn stop(&self, id: &SubscriptionId) -> bool {
        let slot = self.inner.slots.write().remove(id);
        match slot {
            Some(slot) => {
                let cancelled = cancel_slot(slot);
                if cancelled {
                    tracing::debug!(subscription = %id, "subscription cancelled");
                }
                cancelled
            }
            None => false,
        }
    }

    /// Cancel everything, e.g. on disconnect.
    pub fn close_all(&self) {
        let slots: Vec<(SubscriptionId, Slot)> = self.inner.slots.write().drain().collect();
        let mut cancelled = 0;
        for (_, slot) in slots {
            if cancel_slot(slot) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::debug!(cancelled, "closed all subscriptions");
        }
    }

    /// Current state, if the id is known. Stopped ids are forgotten.
    pub fn state(&self, id: &SubscriptionId) -> Option<SubscriptionState> {
        self.inner.slots.read().get(id).map(Slot::state)
    }

    /// Number of pending or active subscriptions.
    pub fn active_count(&self) -> usize {
        self.inner
            .slots
            .read()
            .values()
            .filter(|slot| !slot.state().is_terminal())
            .count()
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn cancel_slot(mut slot: Slot) -> bool {
    let was_live = !slot.state().is_terminal();
    stop_worker(
        &slot.shared,
        slot.cancel.take(),
        slot.releaser.take(),
        slot.worker.take(),
    );
    was_live
}

/// Close the gate, release the source, join the worker, then mark
/// `Cancelled` unless the subscription had already ended.
fn stop_worker(
    shared: &Shared,
    cancel: Option<Sender<()>>,
    releaser: Option<SourceReleaser>,
    worker: Option<JoinHandle<()>>,
) {
    {
        let _gate = shared.state.lock();
        shared.stopping.store(true, Ordering::SeqCst);
    }

    drop(cancel);
    if let Some(releaser) = releaser {
        releaser.release();
    }

    if let Some(worker) = worker {
        // A worker stopping its own connection cannot join itself
        if worker.thread().id() != thread::current().id() {
            if worker.join().is_err() {
                tracing::warn!("subscription worker panicked");
            }
        }
    }

    let mut state = shared.state.lock();
    if !state.is_terminal() {
        *state = SubscriptionState::Cancelled;
    }
}

fn run_worker(
    id: SubscriptionId,
    mut pipeline: Pipeline,
    selection: ReadingSelection,
    cancel: Receiver<()>,
    shared: Arc<Shared>,
    session: Arc<dyn TransportSession>,
    registry: Weak<RegistryInner>,
) {
    loop {
        match pipeline.pull(&cancel) {
            Next::Payload(reading) => {
                let payload = selection.render(Some(&reading));

                let state = shared.state.lock();
                if shared.stopping.load(Ordering::SeqCst) || *state != SubscriptionState::Active {
                    break;
                }
                if let Err(e) = session.deliver(&id, payload) {
                    drop(state);
                    finish_transport_gone(&id, &shared, &e);
                    if matches!(e, FeedError::TransportClosed) {
                        close_connection(&id, &registry);
                    }
                    break;
                }
            }
            Next::Cancelled => break,
            Next::Completed => {
                pipeline.releaser().release();
                let mut state = shared.state.lock();
                if shared.stopping.load(Ordering::SeqCst) || state.is_terminal() {
                    break;
                }
                *state = SubscriptionState::Completed;
                if let Err(e) = session.complete(&id) {
                    tracing::debug!(subscription = %id, error = %e, "complete not delivered");
                }
                tracing::debug!(subscription = %id, "subscription completed");
                break;
            }
            Next::Failed(e) => {
                pipeline.releaser().release();
                let mut state = shared.state.lock();
                if shared.stopping.load(Ordering::SeqCst) || state.is_terminal() {
                    break;
                }
                *state = SubscriptionState::Failed(e.to_string());
                tracing::warn!(subscription = %id, error = %e, "subscription failed");
                if let Err(send_err) = session.fail(&id, &e) {
                    tracing::debug!(subscription = %id, error = %send_err, "failure not delivered");
                }
                break;
            }
        }
    }
    // Pipeline dropped here: timer released, bus registration removed
}

/// The client is gone: stop quietly.
fn finish_transport_gone(id: &SubscriptionId, shared: &Shared, error: &FeedError) {
    let mut state = shared.state.lock();
    shared.stopping.store(true, Ordering::SeqCst);
    if !state.is_terminal() {
        *state = SubscriptionState::Cancelled;
    }
    tracing::debug!(subscription = %id, error = %error, "transport gone, subscription cancelled");
}

/// The client is gone for every subscription: cancel the siblings too.
fn close_connection(id: &SubscriptionId, registry: &Weak<RegistryInner>) {
    if let Some(inner) = registry.upgrade() {
        if !inner.transport_gone.swap(true, Ordering::SeqCst) {
            let cancelled = inner.cancel_all_in_place();
            tracing::debug!(subscription = %id, cancelled, "transport closed, connection torn down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::query::Operation;
    use crate::resolvers::{resolve_creation_subscription, resolve_timer_subscription};
    use crate::types::{ChangeEvent, Reading, Timestamp};
    use serde_json::Value;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum Sent {
        Data(SubscriptionId, Value),
        Error(SubscriptionId, String),
        Complete(SubscriptionId),
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Sent>>,
        closed: AtomicBool,
    }

    impl TransportSession for Recorder {
        fn deliver(&self, id: &SubscriptionId, payload: Value) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(FeedError::TransportClosed);
            }
            self.sent.lock().push(Sent::Data(id.clone(), payload));
            Ok(())
        }

        fn fail(&self, id: &SubscriptionId, error: &FeedError) -> Result<()> {
            self.sent.lock().push(Sent::Error(id.clone(), error.to_string()));
            Ok(())
        }

        fn complete(&self, id: &SubscriptionId) -> Result<()> {
            self.sent.lock().push(Sent::Complete(id.clone()));
            Ok(())
        }
    }

    fn selection() -> ReadingSelection {
        let op = Operation::parse("subscription { readingCreated { value } }").unwrap();
        ReadingSelection::from_field(&op.field).unwrap()
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not met in time");
    }

    fn created(value: i32) -> ChangeEvent {
        ChangeEvent::created(Reading::synthetic(Timestamp(1000), value))
    }

    #[test]
    fn test_start_deliver_stop() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let registry = SubscriptionRegistry::new(recorder.clone());
        let id = SubscriptionId::Num(1);

        registry
            .start(id.clone(), selection(), || Ok(resolve_creation_subscription(&bus)))
            .unwrap();
        assert_eq!(registry.state(&id), Some(SubscriptionState::Active));
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(created(20));
        wait_for(|| recorder.sent.lock().len() == 1);

        assert!(registry.stop(&id));
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(registry.active_count(), 0);

        bus.publish(created(21));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            *recorder.sent.lock(),
            vec![Sent::Data(id, serde_json::json!({"readingCreated": {"value": 20}}))]
        );
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let bus = EventBus::new();
        let registry = SubscriptionRegistry::new(Arc::new(Recorder::default()));
        let id = SubscriptionId::from("a");

        registry
            .start(id.clone(), selection(), || Ok(resolve_creation_subscription(&bus)))
            .unwrap();
        let second = registry.start(id.clone(), selection(), || {
            Ok(resolve_creation_subscription(&bus))
        });
        assert!(matches!(second, Err(FeedError::SubscriptionExists(_))));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_attach_failure_marks_failed() {
        let registry = SubscriptionRegistry::new(Arc::new(Recorder::default()));
        let id = SubscriptionId::Num(9);

        let result = registry.start(id.clone(), selection(), || {
            resolve_timer_subscription(Duration::ZERO)
        });
        assert!(result.is_err());
        assert!(matches!(
            registry.state(&id),
            Some(SubscriptionState::Failed(_))
        ));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_fault_isolated_to_one_subscription() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let registry = SubscriptionRegistry::new(recorder.clone());
        let bad = SubscriptionId::Num(1);
        let good = SubscriptionId::Num(2);

        registry
            .start(bad.clone(), selection(), || {
                Ok(Pipeline::new(
                    crate::subscriptions::Source::Bus(bus.subscribe()),
                    |_| -> Result<Reading> { panic!("map exploded") },
                ))
            })
            .unwrap();
        registry
            .start(good.clone(), selection(), || Ok(resolve_creation_subscription(&bus)))
            .unwrap();

        bus.publish(created(5));
        bus.publish(created(6));

        wait_for(|| recorder.sent.lock().len() == 3);
        wait_for(|| bus.subscriber_count() == 1);

        let sent = recorder.sent.lock();
        assert!(sent.contains(&Sent::Error(
            bad.clone(),
            "Subscription fault: map exploded".to_string()
        )));
        let good_values: Vec<&Value> = sent
            .iter()
            .filter_map(|s| match s {
                Sent::Data(id, v) if *id == good => Some(v),
                _ => None,
            })
            .collect();
        assert_eq!(good_values.len(), 2);
        drop(sent);

        assert!(matches!(
            registry.state(&bad),
            Some(SubscriptionState::Failed(_))
        ));
        assert_eq!(registry.state(&good), Some(SubscriptionState::Active));
    }

    #[test]
    fn test_bus_close_completes() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let registry = SubscriptionRegistry::new(recorder.clone());
        let id = SubscriptionId::Num(4);

        registry
            .start(id.clone(), selection(), || Ok(resolve_creation_subscription(&bus)))
            .unwrap();
        bus.close();

        wait_for(|| registry.state(&id) == Some(SubscriptionState::Completed));
        assert_eq!(*recorder.sent.lock(), vec![Sent::Complete(id)]);
    }

    #[test]
    fn test_transport_closed_cancels_quietly() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        recorder.closed.store(true, Ordering::SeqCst);
        let registry = SubscriptionRegistry::new(recorder.clone());
        let id = SubscriptionId::Num(5);

        registry
            .start(id.clone(), selection(), || Ok(resolve_creation_subscription(&bus)))
            .unwrap();
        bus.publish(created(1));

        wait_for(|| registry.state(&id) == Some(SubscriptionState::Cancelled));
        wait_for(|| bus.subscriber_count() == 0);
        assert!(recorder.sent.lock().is_empty());
    }

    #[test]
    fn test_transport_closed_cancels_idle_siblings() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let registry = SubscriptionRegistry::new(recorder.clone());
        let timer = SubscriptionId::Num(1);
        let created_id = SubscriptionId::Num(2);

        registry
            .start(created_id.clone(), selection(), || {
                Ok(resolve_creation_subscription(&bus))
            })
            .unwrap();
        recorder.closed.store(true, Ordering::SeqCst);
        registry
            .start(timer.clone(), selection(), || {
                resolve_timer_subscription(Duration::from_millis(5))
            })
            .unwrap();

        // No writes: only the timer ever sees the closed transport
        wait_for(|| bus.subscriber_count() == 0);
        wait_for(|| registry.active_count() == 0);

        assert!(registry.is_transport_closed());
        assert_eq!(registry.state(&timer), Some(SubscriptionState::Cancelled));
        assert_eq!(registry.state(&created_id), Some(SubscriptionState::Cancelled));
        assert!(recorder.sent.lock().is_empty());

        let late = registry.start(SubscriptionId::Num(3), selection(), || {
            Ok(resolve_creation_subscription(&bus))
        });
        assert!(matches!(late, Err(FeedError::TransportClosed)));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_close_all_releases_timers_and_bus() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let registry = SubscriptionRegistry::new(recorder.clone());

        registry
            .start(SubscriptionId::Num(1), selection(), || {
                resolve_timer_subscription(Duration::from_millis(5))
            })
            .unwrap();
        registry
            .start(SubscriptionId::Num(2), selection(), || {
                Ok(resolve_creation_subscription(&bus))
            })
            .unwrap();
        assert_eq!(registry.active_count(), 2);

        wait_for(|| !recorder.sent.lock().is_empty());
        registry.close_all();

        assert_eq!(registry.active_count(), 0);
        assert_eq!(bus.subscriber_count(), 0);

        let delivered = recorder.sent.lock().len();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(recorder.sent.lock().len(), delivered);
    }
}
