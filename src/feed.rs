//! Top-level handle: owns the store and the event bus, and opens connections.

use crate::bus::EventBus;
use crate::config::FeedConfig;
use crate::connection::Connection;
use crate::error::{FeedError, Result};
use crate::resolvers;
use crate::store::Store;
use crate::transport::FrameSink;
use crate::types::{Reading, ReadingId, ReadingInput, StoreStats};
use std::sync::Arc;

/// A reading feed.
///
/// Every write goes through the store, which publishes the resulting change
/// on the bus before the write call returns.
pub struct Feed {
    config: FeedConfig,
    store: Arc<Store>,
    bus: EventBus,
}

impl Feed {
    pub fn open(config: FeedConfig) -> Result<Self> {
        let store = Arc::new(Store::open_or_create(config.store.clone())?);
        let bus = EventBus::with_buffer_size(config.bus_buffer);
        store.add_hook(Arc::new(bus.clone()));

        tracing::info!(
            listen_path = %config.listen_path,
            tick_interval = ?config.tick_interval,
            "feed ready"
        );

        Ok(Self { config, store, bus })
    }

    pub fn create_reading(&self, input: ReadingInput) -> Result<Reading> {
        self.store.create(input)
    }

    pub fn update_reading(&self, id: ReadingId, input: ReadingInput) -> Result<Reading> {
        self.store.update(id, input)
    }

    pub fn delete_reading(&self, id: ReadingId) -> Result<Reading> {
        self.store.delete(id)
    }

    /// Latest reading, `None` when nothing has been stored.
    pub fn current_reading(&self) -> Result<Option<Reading>> {
        match resolvers::resolve_current_reading(&self.store) {
            Ok(reading) => Ok(Some(reading)),
            Err(FeedError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn list_readings(&self) -> Result<Vec<Reading>> {
        resolvers::list_readings(&self.store)
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Open a connection whose frames go to `sink`.
    pub fn connect(&self, sink: Arc<dyn FrameSink>) -> Connection {
        Connection::new(
            Arc::clone(&self.store),
            self.bus.clone(),
            self.config.tick_interval,
            sink,
        )
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn listen_path(&self) -> &str {
        &self.config.listen_path
    }

    /// Close the bus: creation subscriptions on every connection complete.
    pub fn shutdown(&self) -> Result<()> {
        self.bus.close();
        self.store.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use tempfile::TempDir;

    #[test]
    fn test_write_path_publishes() {
        let dir = TempDir::new().unwrap();
        let feed = Feed::open(FeedConfig::at(dir.path())).unwrap();
        let sub = feed.bus().subscribe();

        let reading = feed
            .create_reading(ReadingInput::new(20).at(Timestamp(1000)))
            .unwrap();

        let event = sub.try_recv().unwrap();
        assert_eq!(event.instance.as_reading(), Some(&reading));
        assert_eq!(feed.current_reading().unwrap(), Some(reading));
    }

    #[test]
    fn test_current_reading_empty() {
        let dir = TempDir::new().unwrap();
        let feed = Feed::open(FeedConfig::at(dir.path())).unwrap();

        assert_eq!(feed.current_reading().unwrap(), None);
        assert!(feed.list_readings().unwrap().is_empty());
        assert_eq!(feed.listen_path(), "graphql-playground/");
    }
}
