//! Control frames exchanged over a subscription connection.
//!
//! Frames are JSON objects tagged by `type`:
//!
//! ```text
//! client: connection_init | start {id, payload} | stop {id} | connection_terminate
//! server: connection_ack | connection_error {payload}
//!         | data {id, payload} | error {id, payload} | complete {id}
//! ```

use crate::error::{FeedError, Result};
use crate::subscriptions::SubscriptionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of a `start` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
}

impl StartPayload {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_name: None,
        }
    }
}

/// Frames sent by the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Start {
        id: SubscriptionId,
        payload: StartPayload,
    },
    Stop {
        id: SubscriptionId,
    },
    ConnectionTerminate,
}

/// Result body of a `data` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPayload {
    pub data: Value,
    pub errors: Option<Vec<ErrorPayload>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

impl From<&FeedError> for ErrorPayload {
    fn from(e: &FeedError) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

/// Frames sent by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAck,
    ConnectionError {
        payload: ErrorPayload,
    },
    Data {
        id: SubscriptionId,
        payload: DataPayload,
    },
    Error {
        id: SubscriptionId,
        payload: ErrorPayload,
    },
    Complete {
        id: SubscriptionId,
    },
}

impl ServerMessage {
    pub fn data(id: SubscriptionId, data: Value) -> Self {
        ServerMessage::Data {
            id,
            payload: DataPayload { data, errors: None },
        }
    }

    pub fn error(id: SubscriptionId, error: &FeedError) -> Self {
        ServerMessage::Error {
            id,
            payload: error.into(),
        }
    }

    /// Subscription this frame belongs to, if any.
    pub fn id(&self) -> Option<&SubscriptionId> {
        match self {
            ServerMessage::Data { id, .. }
            | ServerMessage::Error { id, .. }
            | ServerMessage::Complete { id } => Some(id),
            ServerMessage::ConnectionAck | ServerMessage::ConnectionError { .. } => None,
        }
    }
}

/// Decode one client frame.
pub fn decode(text: &str) -> Result<ClientMessage> {
    serde_json::from_str(text).map_err(|e| FeedError::Deserialization(e.to_string()))
}

/// Encode one server frame.
pub fn encode(frame: &ServerMessage) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}
