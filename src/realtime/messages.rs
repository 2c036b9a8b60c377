//! JSON frames exchanged over the queue WebSocket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::QueueSnapshot;

/// Inbound frame kinds. Anything else is answered with an `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    GetQueue,
    Ping,
    SyncCheck,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,

    #[error("Missing message type")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;

        let kind = match value.get("type") {
            Some(serde_json::Value::String(kind)) => kind.as_str(),
            Some(other) => return Err(ProtocolError::UnknownType(other.to_string())),
            None => return Err(ProtocolError::MissingType),
        };

        match kind {
            "get_queue" => Ok(ClientMessage::GetQueue),
            "ping" => Ok(ClientMessage::Ping),
            "sync_check" => Ok(ClientMessage::SyncCheck),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// Server-initiated: the queue was repaired or reconciled.
    SyncRequired,
    /// Reply to a client's `sync_check`.
    SyncPerformed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    QueueUpdate {
        queue: QueueSnapshot,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_play: Option<bool>,
    },
    QueueSync {
        queue: QueueSnapshot,
        action: SyncAction,
        message: String,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn update(queue: QueueSnapshot, auto_play: bool) -> Self {
        ServerMessage::QueueUpdate {
            queue,
            auto_play: auto_play.then_some(true),
        }
    }

    pub fn sync(queue: QueueSnapshot, action: SyncAction) -> Self {
        let message = match action {
            SyncAction::SyncRequired => "Queue synchronized",
            SyncAction::SyncPerformed => "Queue sync verification",
        };
        ServerMessage::QueueSync {
            queue,
            action,
            message: message.to_string(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
