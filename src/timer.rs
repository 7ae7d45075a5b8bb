//! Interval-driven synthetic reading generator.

use crate::error::{FeedError, Result};
use crate::types::{Reading, Timestamp};
use crossbeam_channel::{tick, Receiver};
use rand::Rng;
use std::time::{Duration, Instant, SystemTime};

/// Default interval between ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

/// Inclusive range of synthetic values.
pub const SYNTHETIC_MIN: i32 = 0;
pub const SYNTHETIC_MAX: i32 = 36;

/// One emission of a [`TimerStream`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tick {
    /// 0 for the first tick, then +1 per tick.
    pub index: u64,
    /// Wall-clock time of emission.
    pub at: SystemTime,
}

impl Tick {
    /// Demo data: a uniformly random value in `0..=36` stamped with the
    /// tick time.
    pub fn synthetic_reading(&self) -> Reading {
        let value = rand::thread_rng().gen_range(SYNTHETIC_MIN..=SYNTHETIC_MAX);
        Reading::synthetic(Timestamp::from_system_time(self.at), value)
    }
}

/// Infinite sequence of ticks at a fixed interval.
///
/// Each `start` is independent and begins at index 0. The first tick fires
/// one interval after start. Dropping the stream releases the timer.
pub struct TimerStream {
    ticker: Receiver<Instant>,
    interval: Duration,
    next_index: u64,
}

impl TimerStream {
    pub fn start(interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(FeedError::InvalidOperation(
                "timer interval must be positive".into(),
            ));
        }

        Ok(Self {
            ticker: tick(interval),
            interval,
            next_index: 0,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Channel side, for use in `select!`. Pair each received instant with
    /// [`TimerStream::advance`].
    pub fn receiver(&self) -> &Receiver<Instant> {
        &self.ticker
    }

    /// Produce the next tick after the ticker fired.
    pub fn advance(&mut self) -> Tick {
        let tick = Tick {
            index: self.next_index,
            at: SystemTime::now(),
        };
        self.next_index += 1;
        tick
    }
}

impl Iterator for TimerStream {
    type Item = Tick;

    /// Blocks until the next tick. Never returns `None`.
    fn next(&mut self) -> Option<Tick> {
        self.ticker.recv().ok()?;
        Some(self.advance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_rejected() {
        assert!(matches!(
            TimerStream::start(Duration::ZERO),
            Err(FeedError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_indexes_increase() {
        let stream = TimerStream::start(Duration::from_millis(5)).unwrap();
        let indexes: Vec<u64> = stream.take(4).map(|t| t.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_streams_are_independent() {
        let mut first = TimerStream::start(Duration::from_millis(5)).unwrap();
        first.next();
        first.next();

        let mut second = TimerStream::start(Duration::from_millis(5)).unwrap();
        assert_eq!(second.next().unwrap().index, 0);
    }

    #[test]
    fn test_ticks_are_spaced() {
        let interval = Duration::from_millis(20);
        let started = Instant::now();
        let stream = TimerStream::start(interval).unwrap();
        let _: Vec<Tick> = stream.take(3).collect();
        assert!(started.elapsed() >= interval * 3);
    }

    #[test]
    fn test_synthetic_reading_in_range() {
        let tick = Tick {
            index: 0,
            at: SystemTime::now(),
        };
        for _ in 0..200 {
            let reading = tick.synthetic_reading();
            assert!((SYNTHETIC_MIN..=SYNTHETIC_MAX).contains(&reading.value));
            assert_eq!(reading.unit, "Fahrenheit");
            assert!(reading.id.is_none());
        }
    }
}
