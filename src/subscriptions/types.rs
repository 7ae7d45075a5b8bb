//! Subscription types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-assigned subscription id, unique per connection.
///
/// Clients send either numbers or strings; both are kept as sent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubscriptionId {
    Num(i64),
    Str(String),
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionId::Num(n) => write!(f, "{}", n),
            SubscriptionId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for SubscriptionId {
    fn from(n: i64) -> Self {
        SubscriptionId::Num(n)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        SubscriptionId::Str(s.to_string())
    }
}

/// Lifecycle of one subscription.
///
/// `Pending → Active → {Completed, Cancelled, Failed}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Resolver selected, source not attached yet.
    Pending,
    /// Source attached, items flowing.
    Active,
    /// Source ended on its own.
    Completed,
    /// Stopped by the client or by disconnect.
    Cancelled,
    /// Terminated by a fault; holds the message sent to the client.
    Failed(String),
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Completed
                | SubscriptionState::Cancelled
                | SubscriptionState::Failed(_)
        )
    }
}
