//! # Reading Feed
//!
//! A persisted temperature reading exposed through queries and live
//! subscriptions, multiplexed over one connection per client.
//!
//! ## Core Concepts
//!
//! - **Store**: Append-only reading log with post-write hooks
//! - **EventBus**: Broadcast of change events from the write path
//! - **TimerStream**: Synthetic readings on a fixed interval
//! - **Subscriptions**: Per-connection pipelines (source, filter, map)
//!   delivered through a transport session
//!
//! ## Example
//!
//! ```ignore
//! use reading_feed::{ChannelTransport, Feed, FeedConfig, ReadingInput};
//!
//! let feed = Feed::open(FeedConfig::at("./readings"))?;
//!
//! let (transport, frames) = ChannelTransport::pair();
//! let conn = feed.connect(Arc::new(transport));
//! conn.handle_text(r#"{"type":"start","id":1,
//!     "payload":{"query":"subscription { readingCreated { value } }"}}"#)?;
//!
//! feed.create_reading(ReadingInput::new(20))?;
//! let frame = frames.recv()?; // data {id: 1, payload: {readingCreated: {value: 20}}}
//! ```

pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod feed;
pub mod protocol;
pub mod query;
pub mod readings;
pub mod resolvers;
pub mod store;
pub mod subscriptions;
pub mod timer;
pub mod transport;
pub mod types;

// Re-exports
pub use bus::{BusReleaser, BusSubscriberId, BusSubscription, EventBus};
pub use config::FeedConfig;
pub use connection::Connection;
pub use error::{FeedError, Result};
pub use feed::Feed;
pub use protocol::{ClientMessage, ServerMessage, StartPayload};
pub use query::{Operation, OperationKind};
pub use readings::{ReadingIndex, ReadingLog};
pub use resolvers::{ReadingSelection, Resolver};
pub use store::{Store, StoreConfig, WriteHook};
pub use subscriptions::{
    Next, Pipeline, Source, SourceItem, SubscriptionId, SubscriptionRegistry, SubscriptionState,
};
pub use timer::{Tick, TimerStream};
pub use transport::{ChannelTransport, FrameSession, FrameSink, TextTransport, TransportSession};
pub use types::*;
