//! Persistent queue connections.
//!
//! A connection authenticates once at upgrade time, joins its user's
//! broadcast group and then runs two halves: a writer task draining the
//! subscription queue (plus a keepalive ping) and a reader loop answering
//! control frames. Either half finishing ends the connection and leaves the
//! group.

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::broadcaster::{Broadcaster, GroupKey};
use super::messages::{ClientMessage, ProtocolError, ServerMessage, SyncAction};
use crate::errors::AppError;
use crate::models::UserId;
use crate::queue::SnapshotReader;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Why a connection was refused. The discriminant is the close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unauthenticated = 4001,
    InvalidGroup = 4002,
    Internal = 4003,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn description(self) -> &'static str {
        match self {
            CloseReason::Unauthenticated => "Not authenticated",
            CloseReason::InvalidGroup => "Invalid group",
            CloseReason::Internal => "Connection error",
        }
    }

    /// Close reason for a failed credential check.
    pub fn for_auth_error(err: &AppError) -> Self {
        match err {
            AppError::Auth(_) => CloseReason::Unauthenticated,
            _ => CloseReason::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Subscribed,
    Closed,
}

impl ConnectionState {
    pub fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Authenticating, Subscribed)
                | (Connecting, Closed)
                | (Authenticating, Closed)
                | (Subscribed, Closed)
        )
    }
}

/// Lifecycle bookkeeping for one connection.
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    state: ConnectionState,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`. Returns `false` (and stays put) for illegal moves.
    pub fn advance(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_become(next) {
            log::warn!(
                "[Gateway] {} ignoring transition {:?} -> {:?}",
                self.id,
                self.state,
                next
            );
            return false;
        }
        self.state = next;
        true
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Gateway {
    broadcaster: Arc<Broadcaster>,
    reader: Arc<SnapshotReader>,
}

impl Gateway {
    pub fn new(broadcaster: Arc<Broadcaster>, reader: Arc<SnapshotReader>) -> Self {
        Self {
            broadcaster,
            reader,
        }
    }

    /// Answer one inbound text frame.
    pub async fn handle_client_message(&self, user_id: UserId, text: &str) -> ServerMessage {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(ProtocolError::InvalidJson) => {
                log::warn!("[Gateway] Invalid JSON from user {}", user_id);
                return ServerMessage::error(ProtocolError::InvalidJson.to_string());
            }
            Err(e) => {
                log::warn!("[Gateway] Rejected frame from user {}: {}", user_id, e);
                return ServerMessage::error(e.to_string());
            }
        };

        match message {
            ClientMessage::Ping => ServerMessage::pong(),
            ClientMessage::GetQueue => match self.reader.read_through(user_id).await {
                Ok(snapshot) => ServerMessage::update(snapshot, false),
                Err(e) => {
                    log::error!("[Gateway] Failed to read queue of user {}: {}", user_id, e);
                    ServerMessage::error("Failed to fetch queue data")
                }
            },
            ClientMessage::SyncCheck => match self.reader.refresh(user_id).await {
                Ok(snapshot) => ServerMessage::sync(snapshot, SyncAction::SyncPerformed),
                Err(e) => {
                    log::error!("[Gateway] Sync check failed for user {}: {}", user_id, e);
                    ServerMessage::error("Failed to fetch queue data")
                }
            },
        }
    }

    /// Drive an upgraded socket until either side hangs up.
    pub async fn serve(&self, mut socket: WebSocket, auth: Result<UserId, CloseReason>) {
        let mut conn = Connection::new();
        conn.advance(ConnectionState::Authenticating);

        let group = match auth.and_then(|user_id| {
            GroupKey::for_user(user_id).ok_or(CloseReason::InvalidGroup)
        }) {
            Ok(group) => group,
            Err(reason) => {
                log::warn!(
                    "[Gateway] {} refused: {} ({})",
                    conn.id,
                    reason.description(),
                    reason.code()
                );
                let frame = CloseFrame {
                    code: reason.code(),
                    reason: Utf8Bytes::from_static(reason.description()),
                };
                let _ = socket.send(Message::Close(Some(frame))).await;
                conn.advance(ConnectionState::Closed);
                return;
            }
        };

        let subscription = self.broadcaster.subscribe(&group);
        let subscription_id = subscription.id;
        let user_id = subscription.user_id;
        let replies = subscription.sender;
        let mut outbound = subscription.receiver;
        conn.advance(ConnectionState::Subscribed);
        log::info!("[Gateway] {} connected to {}", conn.id, group.name);

        let (mut ws_tx, mut ws_rx) = socket.split();

        let mut writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.tick().await;

            loop {
                tokio::select! {
                    message = outbound.recv() => {
                        let Some(message) = message else { break };
                        let text = match message.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                log::error!("[Gateway] Failed to encode frame: {}", e);
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = ping.tick() => {
                        if ws_tx.send(Message::Ping(Default::default())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let read_loop = async {
            while let Some(frame) = ws_rx.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            if replies
                                .send(ServerMessage::error(ProtocolError::InvalidJson.to_string()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        log::debug!("[Gateway] Socket error for user {}: {}", user_id, e);
                        break;
                    }
                };

                let reply = self.handle_client_message(user_id, &text).await;
                if replies.send(reply).await.is_err() {
                    break;
                }
            }
        };

        tokio::select! {
            _ = &mut writer => {}
            _ = read_loop => {}
        }
        writer.abort();

        self.broadcaster.unsubscribe(user_id, subscription_id);
        conn.advance(ConnectionState::Closed);
        log::info!("[Gateway] {} disconnected from {}", conn.id, group.name);
    }
}
