//! Live subscriptions over a client connection.
//!
//! A subscription is a [`Pipeline`] (one source, an optional filter and a
//! map to readings) driven by the [`SubscriptionRegistry`] of the connection
//! that started it:
//!
//! - timer sources emit synthetic readings on a fixed interval
//! - bus sources emit readings as they are written to the store
//!
//! Each subscription is cancelled independently by `stop`, and all of a
//! connection's subscriptions are cancelled when it closes.
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new(session);
//! registry.start(id.clone(), selection, || Ok(resolve_creation_subscription(&bus)))?;
//!
//! // Later
//! registry.stop(&id);
//! ```

mod pipeline;
mod registry;
mod types;

pub use pipeline::{FilterFn, MapFn, Next, Pipeline, Source, SourceItem, SourceReleaser};
pub use registry::SubscriptionRegistry;
pub use types::{SubscriptionId, SubscriptionState};
