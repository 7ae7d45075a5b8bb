//! Error types for the reading feed.

use crate::types::ReadingId;
use thiserror::Error;

/// Main error type for store and subscription operations.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No reading exists yet. Queries surface this as a null result.
    #[error("Reading not found")]
    NotFound,

    #[error("Reading not found: {0}")]
    ReadingNotFound(ReadingId),

    /// A subscription's filter or map stage failed.
    #[error("Subscription fault: {0}")]
    SubscriptionFault(String),

    /// The event bus or timer backing a subscription failed.
    #[error("Source fault: {0}")]
    SourceFault(String),

    /// The delivery target is gone.
    #[error("Transport closed")]
    TransportClosed,

    #[error("Subscription already active: {0}")]
    SubscriptionExists(String),

    #[error("Invalid reading: {0}")]
    InvalidReading(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),
}

impl FeedError {
    /// True for errors that end a single subscription rather than the connection.
    pub fn is_subscription_terminal(&self) -> bool {
        matches!(
            self,
            FeedError::SubscriptionFault(_) | FeedError::SourceFault(_)
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for FeedError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FeedError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FeedError::Deserialization(e.to_string())
    }
}

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;
