//! Protocol driver for one client connection.
//!
//! Decodes inbound frames, answers queries inline and hands subscriptions to
//! the connection's [`SubscriptionRegistry`].

use crate::bus::EventBus;
use crate::error::{FeedError, Result};
use crate::protocol::{self, ClientMessage, ErrorPayload, ServerMessage, StartPayload};
use crate::query::Operation;
use crate::resolvers::{
    resolve_creation_subscription, resolve_current_reading, resolve_timer_subscription,
    ReadingSelection, Resolver,
};
use crate::store::Store;
use crate::subscriptions::{SubscriptionId, SubscriptionRegistry, SubscriptionState};
use crate::transport::{FrameSession, FrameSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One client connection.
pub struct Connection {
    store: Arc<Store>,
    bus: EventBus,
    tick_interval: Duration,
    sink: Arc<dyn FrameSink>,
    registry: SubscriptionRegistry,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        tick_interval: Duration,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let session = Arc::new(FrameSession::new(Arc::clone(&sink)));
        Self {
            store,
            bus,
            tick_interval,
            sink,
            registry: SubscriptionRegistry::new(session),
            closed: AtomicBool::new(false),
        }
    }

    /// Handle one inbound text frame.
    ///
    /// A frame that does not decode is answered with `connection_error`; the
    /// connection stays open.
    pub fn handle_text(&self, text: &str) -> Result<()> {
        match protocol::decode(text) {
            Ok(message) => self.handle(message),
            Err(e) => {
                tracing::debug!(error = %e, "rejected client frame");
                self.send(ServerMessage::ConnectionError {
                    payload: ErrorPayload::from(&e),
                })
            }
        }
    }

    /// Handle one decoded frame.
    ///
    /// Errors are returned only when the transport is gone; everything else
    /// is reported to the client as a frame.
    pub fn handle(&self, message: ClientMessage) -> Result<()> {
        if self.is_closed() {
            return Err(FeedError::TransportClosed);
        }

        match message {
            ClientMessage::ConnectionInit { .. } => self.send(ServerMessage::ConnectionAck),
            ClientMessage::Start { id, payload } => self.start(id, payload),
            ClientMessage::Stop { id } => {
                self.registry.stop(&id);
                Ok(())
            }
            ClientMessage::ConnectionTerminate => {
                self.close();
                Ok(())
            }
        }
    }

    fn start(&self, id: SubscriptionId, payload: StartPayload) -> Result<()> {
        let (resolver, selection) = match prepare(&payload) {
            Ok(prepared) => prepared,
            Err(e) => return self.send(ServerMessage::error(id, &e)),
        };

        if !resolver.is_subscription() {
            return self.answer_query(id, &selection);
        }

        let started = self.registry.start(id.clone(), selection, || match resolver {
            Resolver::TimerSubscription => resolve_timer_subscription(self.tick_interval),
            Resolver::CreationSubscription => Ok(resolve_creation_subscription(&self.bus)),
            Resolver::CurrentReading => Err(FeedError::InvalidOperation(
                "query resolved as a subscription".into(),
            )),
        });

        match started {
            Ok(()) => Ok(()),
            // Stopped while starting, or the client is gone
            Err(FeedError::TransportClosed) => Ok(()),
            Err(e) => self.send(ServerMessage::error(id, &e)),
        }
    }

    /// One `data` frame, then `complete`.
    fn answer_query(&self, id: SubscriptionId, selection: &ReadingSelection) -> Result<()> {
        let data = match resolve_current_reading(&self.store) {
            Ok(reading) => selection.render(Some(&reading)),
            Err(FeedError::NotFound) => selection.render(None),
            Err(e) => return self.send(ServerMessage::error(id, &e)),
        };

        self.send(ServerMessage::data(id.clone(), data))?;
        self.send(ServerMessage::Complete { id })
    }

    fn send(&self, frame: ServerMessage) -> Result<()> {
        let result = self.sink.send(frame);
        if let Err(FeedError::TransportClosed) = result {
            self.close();
        }
        result
    }

    /// Cancel every subscription. Further frames are refused.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.registry.close_all();
            tracing::debug!("connection closed");
        }
    }

    /// Closed by the client, by `close`, or because a delivery found the
    /// transport gone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.registry.is_transport_closed()
    }

    pub fn subscription_state(&self, id: &SubscriptionId) -> Option<SubscriptionState> {
        self.registry.state(id)
    }

    /// Number of pending or active subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.registry.active_count()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn prepare(payload: &StartPayload) -> Result<(Resolver, ReadingSelection)> {
    let operation = Operation::parse(&payload.query)?;
    let resolver = Resolver::select(&operation)?;
    let selection = ReadingSelection::from_field(&operation.field)?;
    Ok((resolver, selection))
}
