//! Seams between the subscription core and the physical connection.
//!
//! A [`FrameSink`] carries server frames to the client; whatever owns the
//! socket implements it. [`TransportSession`] is the narrower view the
//! subscription registry needs: deliver a payload, fail, or complete one id.

use crate::error::{FeedError, Result};
use crate::protocol::{self, ServerMessage};
use crate::subscriptions::SubscriptionId;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::Value;
use std::sync::Arc;

/// Outbound half of a connection.
pub trait FrameSink: Send + Sync {
    /// Send one frame. Returns [`FeedError::TransportClosed`] once the peer
    /// is gone.
    ///
    /// Must not block for long: subscription workers call this while holding
    /// their delivery gate, so a stalled send also stalls `stop` and `start`
    /// on the same connection. Hand frames to a queue or writer task instead.
    fn send(&self, frame: ServerMessage) -> Result<()>;
}

/// Per-subscription delivery used by the registry.
pub trait TransportSession: Send + Sync {
    fn deliver(&self, id: &SubscriptionId, payload: Value) -> Result<()>;

    /// Report the terminal error of a subscription.
    fn fail(&self, id: &SubscriptionId, error: &FeedError) -> Result<()>;

    fn complete(&self, id: &SubscriptionId) -> Result<()>;
}

/// [`TransportSession`] over a [`FrameSink`].
pub struct FrameSession {
    sink: Arc<dyn FrameSink>,
}

impl FrameSession {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self { sink }
    }
}

impl TransportSession for FrameSession {
    fn deliver(&self, id: &SubscriptionId, payload: Value) -> Result<()> {
        self.sink.send(ServerMessage::data(id.clone(), payload))
    }

    fn fail(&self, id: &SubscriptionId, error: &FeedError) -> Result<()> {
        self.sink.send(ServerMessage::error(id.clone(), error))
    }

    fn complete(&self, id: &SubscriptionId) -> Result<()> {
        self.sink.send(ServerMessage::Complete { id: id.clone() })
    }
}

/// In-process transport backed by a channel. The receiver is the client side.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: Sender<ServerMessage>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, Receiver<ServerMessage>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelTransport {
    fn send(&self, frame: ServerMessage) -> Result<()> {
        self.tx.send(frame).map_err(|_| FeedError::TransportClosed)
    }
}

/// Transport that writes encoded JSON text through a callback, e.g. onto a
/// websocket owned elsewhere.
pub struct TextTransport<W> {
    write: W,
}

impl<W> TextTransport<W>
where
    W: Fn(String) -> Result<()> + Send + Sync,
{
    pub fn new(write: W) -> Self {
        Self { write }
    }
}

impl<W> FrameSink for TextTransport<W>
where
    W: Fn(String) -> Result<()> + Send + Sync,
{
    fn send(&self, frame: ServerMessage) -> Result<()> {
        let text = protocol::encode(&frame)?;
        (self.write)(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_channel_transport_closed() {
        let (transport, rx) = ChannelTransport::pair();
        transport.send(ServerMessage::ConnectionAck).unwrap();
        assert_eq!(rx.recv().unwrap(), ServerMessage::ConnectionAck);

        drop(rx);
        assert!(matches!(
            transport.send(ServerMessage::ConnectionAck),
            Err(FeedError::TransportClosed)
        ));
    }

    #[test]
    fn test_frame_session_frames() {
        let (transport, rx) = ChannelTransport::pair();
        let session = FrameSession::new(Arc::new(transport));
        let id = SubscriptionId::Num(3);

        session.deliver(&id, json!({"k": 1})).unwrap();
        session.fail(&id, &FeedError::SourceFault("x".into())).unwrap();
        session.complete(&id).unwrap();

        let frames: Vec<ServerMessage> = rx.try_iter().collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], ServerMessage::data(id.clone(), json!({"k": 1})));
        assert!(matches!(frames[1], ServerMessage::Error { .. }));
        assert_eq!(frames[2], ServerMessage::Complete { id });
    }

    #[test]
    fn test_text_transport_encodes() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let written = Arc::clone(&written);
            TextTransport::new(move |text: String| {
                written.lock().push(text);
                Ok(())
            })
        };

        sink.send(ServerMessage::ConnectionAck).unwrap();
        assert_eq!(
            *written.lock(),
            vec![r#"{"type":"connection_ack"}"#.to_string()]
        );
    }
}
