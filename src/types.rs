//! Core types for the reading feed.

use crate::error::{FeedError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default unit for readings.
pub const DEFAULT_UNIT: &str = "Fahrenheit";

/// Max characters of a stored reading value.
pub const MAX_VALUE_CHARS: usize = 3;

/// Max characters of a stored unit.
pub const MAX_UNIT_CHARS: usize = 12;

/// Storage-assigned identifier for a reading.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReadingId(pub u64);

impl fmt::Debug for ReadingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReadingId({})", self.0)
    }
}

impl fmt::Display for ReadingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Convert a wall-clock instant, clamping pre-epoch times to zero.
    pub fn from_system_time(at: SystemTime) -> Self {
        let secs = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Timestamp(secs)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A temperature reading.
///
/// Stored readings carry the id the store assigned; synthetic readings
/// produced by the timer stream have none.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub id: Option<ReadingId>,
    pub timestamp: Timestamp,
    pub value: i32,
    pub unit: String,
}

impl Reading {
    /// A reading that was never written to the store.
    pub fn synthetic(timestamp: Timestamp, value: i32) -> Self {
        Self {
            id: None,
            timestamp,
            value,
            unit: DEFAULT_UNIT.to_string(),
        }
    }
}

/// Input for writing a reading (before id assigned).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadingInput {
    /// None = time of the write.
    pub timestamp: Option<Timestamp>,
    pub value: i32,
    /// None = [`DEFAULT_UNIT`].
    pub unit: Option<String>,
}

impl ReadingInput {
    pub fn new(value: i32) -> Self {
        Self {
            timestamp: None,
            value,
            unit: None,
        }
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Check storage limits.
    pub fn validate(&self) -> Result<()> {
        let chars = self.value.to_string().chars().count();
        if chars > MAX_VALUE_CHARS {
            return Err(FeedError::InvalidReading(format!(
                "value {} exceeds {} characters",
                self.value, MAX_VALUE_CHARS
            )));
        }

        if let Some(ref unit) = self.unit {
            if unit.is_empty() {
                return Err(FeedError::InvalidReading("unit is empty".into()));
            }
            if unit.chars().count() > MAX_UNIT_CHARS {
                return Err(FeedError::InvalidReading(format!(
                    "unit {:?} exceeds {} characters",
                    unit, MAX_UNIT_CHARS
                )));
            }
        }

        Ok(())
    }

    /// Resolve defaults into a reading with the given id.
    pub(crate) fn into_reading(self, id: ReadingId) -> Reading {
        Reading {
            id: Some(id),
            timestamp: self.timestamp.unwrap_or_else(Timestamp::now),
            value: self.value,
            unit: self.unit.unwrap_or_else(|| DEFAULT_UNIT.to_string()),
        }
    }
}

/// Kind of persistence mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOperation {
    Created,
    Updated,
    Deleted,
}

/// The persisted object a change refers to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum Instance {
    Reading(Reading),
    /// Some other persisted model sharing the bus.
    Other {
        name: String,
        data: serde_json::Value,
    },
}

impl Instance {
    pub fn as_reading(&self) -> Option<&Reading> {
        match self {
            Instance::Reading(reading) => Some(reading),
            Instance::Other { .. } => None,
        }
    }
}

/// Ephemeral notification of a persistence mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub instance: Instance,
}

impl ChangeEvent {
    pub fn created(reading: Reading) -> Self {
        Self {
            operation: ChangeOperation::Created,
            instance: Instance::Reading(reading),
        }
    }

    pub fn updated(reading: Reading) -> Self {
        Self {
            operation: ChangeOperation::Updated,
            instance: Instance::Reading(reading),
        }
    }

    pub fn deleted(reading: Reading) -> Self {
        Self {
            operation: ChangeOperation::Deleted,
            instance: Instance::Reading(reading),
        }
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub reading_count: u64,
    pub log_size: u64,
    pub latest: Option<ReadingId>,
}
