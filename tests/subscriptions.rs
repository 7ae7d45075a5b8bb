//! Bus fan-out and subscription lifecycle under concurrency.

use proptest::prelude::*;
use reading_feed::resolvers::resolve_creation_subscription;
use reading_feed::{
    ChangeEvent, EventBus, Next, Reading, ReadingInput, Store, StoreConfig, Timestamp,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn created(value: i32) -> ChangeEvent {
    ChangeEvent::created(Reading::synthetic(Timestamp(1000), value))
}

fn sequenced(seq: i64) -> ChangeEvent {
    ChangeEvent::created(Reading::synthetic(Timestamp(seq), 0))
}

#[test]
fn test_concurrent_subscribe_during_publish() {
    init_tracing();
    let bus = EventBus::new();
    let running = Arc::new(AtomicBool::new(true));

    let publisher = {
        let bus = bus.clone();
        let running = Arc::clone(&running);
        thread::spawn(move || {
            let mut seq = 0;
            while running.load(Ordering::SeqCst) {
                bus.publish(sequenced(seq));
                seq += 1;
            }
            seq
        })
    };

    let churners: Vec<_> = (0..4)
        .map(|_| {
            let bus = bus.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let sub = bus.subscribe();
                    let mut last = None;
                    while let Ok(event) = sub.try_recv() {
                        let seq = event.instance.as_reading().map(|r| r.timestamp.0);
                        // Strictly increasing: in order and never delivered twice
                        assert!(seq > last, "{:?} after {:?}", seq, last);
                        last = seq;
                    }
                    drop(sub);
                }
            })
        })
        .collect();

    for churner in churners {
        churner.join().unwrap();
    }
    running.store(false, Ordering::SeqCst);
    let published = publisher.join().unwrap();

    assert!(published > 0);
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn test_no_double_delivery_under_churn() {
    let bus = EventBus::new();
    let mut stable = resolve_creation_subscription(&bus);

    let churn = {
        let bus = bus.clone();
        thread::spawn(move || {
            for _ in 0..500 {
                let sub = bus.subscribe();
                sub.release();
                sub.release();
            }
        })
    };

    for value in 0..200 {
        bus.publish(created(value % 37));
    }
    churn.join().unwrap();

    for value in 0..200 {
        match stable.pull_timeout(Duration::from_secs(1)) {
            Next::Payload(reading) => assert_eq!(reading.value, value % 37),
            other => panic!("expected payload {}, got {:?}", value, other),
        }
    }
    assert!(matches!(
        stable.pull_timeout(Duration::from_millis(20)),
        Next::Cancelled
    ));
}

#[test]
fn test_store_writes_fan_out_to_all_subscribers() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = Store::create_new(StoreConfig {
        path: dir.path().to_path_buf(),
        ..Default::default()
    })
    .unwrap();
    let bus = EventBus::new();
    store.add_hook(Arc::new(bus.clone()));

    let mut pipelines: Vec<_> = (0..8).map(|_| resolve_creation_subscription(&bus)).collect();

    let written: Vec<Reading> = (0..20)
        .map(|value| store.create(ReadingInput::new(value)).unwrap())
        .collect();

    for pipeline in &mut pipelines {
        for expected in &written {
            match pipeline.pull_timeout(Duration::from_secs(1)) {
                Next::Payload(reading) => assert_eq!(&reading, expected),
                other => panic!("expected payload, got {:?}", other),
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_creation_stream_matches_writes(values in prop::collection::vec(-99i32..=999, 0..40)) {
        let dir = TempDir::new().unwrap();
        let store = Store::create_new(StoreConfig {
            path: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let bus = EventBus::new();
        store.add_hook(Arc::new(bus.clone()));
        let mut pipeline = resolve_creation_subscription(&bus);

        let mut written = Vec::new();
        for (i, value) in values.iter().enumerate() {
            let reading = store.create(ReadingInput::new(*value).at(Timestamp(i as i64))).unwrap();
            written.push(reading);
            if i % 3 == 0 {
                // Interleaved updates never reach the creation stream
                let id = written[i].id.unwrap();
                store.update(id, ReadingInput::new(0)).unwrap();
            }
        }

        for expected in &written {
            match pipeline.pull_timeout(Duration::from_secs(1)) {
                Next::Payload(reading) => prop_assert_eq!(&reading, expected),
                other => prop_assert!(false, "expected payload, got {:?}", other),
            }
        }
        prop_assert!(matches!(pipeline.pull_timeout(Duration::from_millis(5)), Next::Cancelled));
    }
}
