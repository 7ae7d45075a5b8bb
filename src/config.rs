//! Feed configuration.

use crate::bus::DEFAULT_BUS_BUFFER;
use crate::store::StoreConfig;
use crate::timer::DEFAULT_TICK_INTERVAL;
use std::time::Duration;

/// Path the subscription endpoint is mounted under.
pub const DEFAULT_LISTEN_PATH: &str = "graphql-playground/";

/// Top-level configuration.
#[derive(Clone, Debug)]
pub struct FeedConfig {
    pub store: StoreConfig,

    /// Period of `currentReadingSubscribe`.
    pub tick_interval: Duration,

    /// Route the transport layer mounts connections under.
    pub listen_path: String,

    /// Per-subscriber queue capacity on the event bus.
    pub bus_buffer: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            listen_path: DEFAULT_LISTEN_PATH.to_string(),
            bus_buffer: DEFAULT_BUS_BUFFER,
        }
    }
}

impl FeedConfig {
    /// Defaults with the store rooted at `path`.
    pub fn at(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            store: StoreConfig {
                path: path.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}
