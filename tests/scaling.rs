//! Scaling tests: many readings, many connections, many subscriptions.
//!
//! Measures:
//! - Store population and reopen (index rebuild)
//! - Fan-out of store writes to subscribed connections
//! - Subscription start/stop churn on one connection

use reading_feed::{ChannelTransport, Feed, FeedConfig, ReadingId, ReadingInput, ServerMessage};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const READING_COUNT: usize = 10_000;

fn test_config(dir: &TempDir) -> FeedConfig {
    let mut config = FeedConfig::at(dir.path());
    config.store.sync_interval = 1000;
    config
}

/// Timing helper
struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    fn report(&self) {
        println!("  {} took {:.2}ms", self.name, self.elapsed_ms());
    }

    fn report_with_count(&self, count: usize) {
        let ms = self.elapsed_ms();
        println!(
            "  {} took {:.2}ms ({} items, {:.0} items/sec)",
            self.name,
            ms,
            count,
            if ms > 0.0 { count as f64 / (ms / 1000.0) } else { 0.0 }
        );
    }
}

// =============================================================================
// Test: 10k readings, reopen
// =============================================================================

#[test]
fn test_scaling_store_population() {
    println!("\n=== 10k Readings ===");

    let dir = TempDir::new().unwrap();

    let timer = Timer::new("Create 10k readings");
    {
        let feed = Feed::open(test_config(&dir)).unwrap();
        for i in 0..READING_COUNT {
            feed.create_reading(ReadingInput::new((i % 37) as i32)).unwrap();
        }
        feed.shutdown().unwrap();
    }
    timer.report_with_count(READING_COUNT);

    let timer = Timer::new("Reopen feed (rebuild index)");
    let feed = Feed::open(test_config(&dir)).unwrap();
    timer.report();

    let stats = feed.stats();
    assert_eq!(stats.reading_count, READING_COUNT as u64);
    assert_eq!(stats.latest, Some(ReadingId(READING_COUNT as u64)));

    let timer = Timer::new("List all readings");
    let readings = feed.list_readings().unwrap();
    timer.report_with_count(readings.len());
    assert_eq!(readings.len(), READING_COUNT);
}

// =============================================================================
// Test: fan-out to many connections
// =============================================================================

#[test]
fn test_scaling_fan_out() {
    println!("\n=== Fan-out: 50 connections x 200 writes ===");

    const CONNECTIONS: usize = 50;
    const WRITES: usize = 200;

    let dir = TempDir::new().unwrap();
    let feed = Feed::open(test_config(&dir)).unwrap();

    let timer = Timer::new("Open and subscribe connections");
    let clients: Vec<_> = (0..CONNECTIONS)
        .map(|_| {
            let (transport, frames) = ChannelTransport::pair();
            let conn = feed.connect(Arc::new(transport));
            conn.handle_text(
                &json!({
                    "type": "start",
                    "id": 1,
                    "payload": {"query": "subscription { readingCreated { id } }"}
                })
                .to_string(),
            )
            .unwrap();
            (conn, frames)
        })
        .collect();
    timer.report_with_count(CONNECTIONS);
    assert_eq!(feed.bus().subscriber_count(), CONNECTIONS);

    let timer = Timer::new("Write and deliver");
    for i in 0..WRITES {
        feed.create_reading(ReadingInput::new((i % 37) as i32)).unwrap();
    }

    for (_, frames) in &clients {
        for i in 0..WRITES {
            match frames.recv_timeout(Duration::from_secs(5)).unwrap() {
                ServerMessage::Data { payload, .. } => {
                    assert_eq!(payload.data, json!({"readingCreated": {"id": i as u64 + 1}}));
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }
    timer.report_with_count(CONNECTIONS * WRITES);

    drop(clients);
    assert_eq!(feed.bus().subscriber_count(), 0);
}

// =============================================================================
// Test: start/stop churn
// =============================================================================

#[test]
fn test_scaling_subscription_churn() {
    println!("\n=== Churn: 1000 start/stop ===");

    let dir = TempDir::new().unwrap();
    let feed = Feed::open(test_config(&dir)).unwrap();
    let (transport, _frames) = ChannelTransport::pair();
    let conn = feed.connect(Arc::new(transport));

    let timer = Timer::new("Start and stop 1000 subscriptions");
    for id in 0..1000 {
        conn.handle_text(
            &json!({
                "type": "start",
                "id": id,
                "payload": {"query": "subscription { readingCreated { value } }"}
            })
            .to_string(),
        )
        .unwrap();
        conn.handle_text(&json!({"type": "stop", "id": id}).to_string())
            .unwrap();
    }
    timer.report_with_count(1000);

    assert_eq!(conn.active_subscriptions(), 0);
    assert_eq!(feed.bus().subscriber_count(), 0);
}
