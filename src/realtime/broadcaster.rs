//! Per-user publish/subscribe groups for live queue connections.
//!
//! Each subscriber owns a bounded send queue drained by its connection's
//! writer task. Publishing never awaits a subscriber: a full queue drops the
//! frame for that subscriber only, a closed one is unsubscribed on the spot.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use super::messages::{ServerMessage, SyncAction};
use crate::errors::AppError;
use crate::models::UserId;
use crate::queue::SnapshotReader;

const MAX_GROUP_NAME_LEN: usize = 100;

/// Name of a user's broadcast group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupKey {
    pub user_id: UserId,
    pub name: String,
}

impl GroupKey {
    /// `None` when the user id cannot form a valid group.
    pub fn for_user(user_id: UserId) -> Option<Self> {
        if user_id <= 0 {
            return None;
        }
        let name = format!("queue_{}", user_id);
        if name.len() >= MAX_GROUP_NAME_LEN {
            return None;
        }
        Some(Self { user_id, name })
    }
}

/// A connection's membership in its user's group.
pub struct Subscription {
    pub id: Uuid,
    pub user_id: UserId,
    pub receiver: mpsc::Receiver<ServerMessage>,
    /// Direct replies to this connection go through the same queue.
    pub sender: mpsc::Sender<ServerMessage>,
}

struct Subscriber {
    id: Uuid,
    sender: mpsc::Sender<ServerMessage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

pub struct Broadcaster {
    groups: RwLock<HashMap<UserId, Vec<Subscriber>>>,
    reader: Arc<SnapshotReader>,
    buffer: usize,
}

impl Broadcaster {
    pub fn new(reader: Arc<SnapshotReader>, buffer: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            reader,
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self, group: &GroupKey) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();

        let mut groups = self.groups.write();
        let members = groups.entry(group.user_id).or_default();
        members.push(Subscriber {
            id,
            sender: sender.clone(),
        });
        log::info!(
            "[Broadcaster] {} joined {} ({} connection(s))",
            id,
            group.name,
            members.len()
        );

        Subscription {
            id,
            user_id: group.user_id,
            receiver,
            sender,
        }
    }

    pub fn unsubscribe(&self, user_id: UserId, id: Uuid) {
        let mut groups = self.groups.write();
        if let Some(members) = groups.get_mut(&user_id) {
            members.retain(|s| s.id != id);
            if members.is_empty() {
                groups.remove(&user_id);
            }
            log::info!("[Broadcaster] {} left queue_{}", id, user_id);
        }
    }

    pub fn subscriber_count(&self, user_id: UserId) -> usize {
        self.groups.read().get(&user_id).map_or(0, Vec::len)
    }

    /// Push a frame to every connection of the user.
    pub fn publish(&self, user_id: UserId, message: &ServerMessage) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut gone = Vec::new();

        {
            let groups = self.groups.read();
            let Some(members) = groups.get(&user_id) else {
                return report;
            };
            for member in members {
                match member.sender.try_send(message.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        log::warn!(
                            "[Broadcaster] Send queue full for {}, dropping frame",
                            member.id
                        );
                        report.dropped += 1;
                    }
                    Err(TrySendError::Closed(_)) => {
                        report.closed += 1;
                        gone.push(member.id);
                    }
                }
            }
        }

        for id in gone {
            self.unsubscribe(user_id, id);
        }
        report
    }

    /// Re-read the queue bypassing the cache (which repopulates it) and push
    /// a `queue_update`.
    pub async fn publish_update(
        &self,
        user_id: UserId,
        auto_play: bool,
    ) -> Result<DeliveryReport, AppError> {
        let snapshot = self.reader.refresh(user_id).await?;
        let report = self.publish(user_id, &ServerMessage::update(snapshot, auto_play));
        log::debug!(
            "[Broadcaster] queue_update for user {}: {:?}",
            user_id,
            report
        );
        Ok(report)
    }

    /// Force every connection of the user to resynchronize.
    pub async fn publish_sync(&self, user_id: UserId) -> Result<DeliveryReport, AppError> {
        let snapshot = self.reader.refresh(user_id).await?;
        let report = self.publish(
            user_id,
            &ServerMessage::sync(snapshot, SyncAction::SyncRequired),
        );
        log::info!(
            "[Broadcaster] queue_sync for user {}: {:?}",
            user_id,
            report
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::queue::{MemorySnapshotCache, QueueSnapshot, QueueStore};
    use crate::test_support::{self, USER_ID};
    use std::time::Duration;

    async fn broadcaster(buffer: usize) -> Broadcaster {
        let db = test_support::seeded_database().await;
        let reader = SnapshotReader::new(
            Arc::new(QueueStore::new(db.pool.clone())),
            Arc::new(SqliteCatalog::new(db.pool.clone())),
            Arc::new(MemorySnapshotCache::new()),
            Duration::from_secs(300),
            Duration::from_secs(60),
        );
        Broadcaster::new(Arc::new(reader), buffer)
    }

    #[test]
    fn test_group_key_validation() {
        assert_eq!(GroupKey::for_user(7).unwrap().name, "queue_7");
        assert!(GroupKey::for_user(0).is_none());
        assert!(GroupKey::for_user(-1).is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_every_connection_of_user_only() {
        let broadcaster = broadcaster(8).await;
        let mut phone = broadcaster.subscribe(&GroupKey::for_user(USER_ID).unwrap());
        let mut laptop = broadcaster.subscribe(&GroupKey::for_user(USER_ID).unwrap());
        let mut stranger = broadcaster.subscribe(&GroupKey::for_user(2).unwrap());

        let report = broadcaster.publish(USER_ID, &ServerMessage::pong());
        assert_eq!(report.delivered, 2);

        assert!(matches!(phone.receiver.recv().await, Some(ServerMessage::Pong { .. })));
        assert!(matches!(laptop.receiver.recv().await, Some(ServerMessage::Pong { .. })));
        assert!(stranger.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_and_closed_subscribers_are_isolated() {
        let broadcaster = broadcaster(1).await;
        let group = GroupKey::for_user(USER_ID).unwrap();
        let mut healthy = broadcaster.subscribe(&group);
        let slow = broadcaster.subscribe(&group);
        let gone = broadcaster.subscribe(&group);
        drop(gone.receiver);

        // Fill the slow subscriber's single slot.
        slow.sender.try_send(ServerMessage::pong()).unwrap();

        let report = broadcaster.publish(USER_ID, &ServerMessage::pong());
        assert_eq!(
            report,
            DeliveryReport {
                delivered: 1,
                dropped: 1,
                closed: 1
            }
        );
        assert!(healthy.receiver.recv().await.is_some());
        assert_eq!(broadcaster.subscriber_count(USER_ID), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_publish_sync() {
        let broadcaster = broadcaster(4).await;
        let group = GroupKey::for_user(USER_ID).unwrap();
        let mut sub = broadcaster.subscribe(&group);

        broadcaster.publish_sync(USER_ID).await.unwrap();
        match sub.receiver.recv().await {
            Some(ServerMessage::QueueSync { action, queue, .. }) => {
                assert_eq!(action, SyncAction::SyncRequired);
                assert_eq!(queue.tracks, QueueSnapshot::empty().tracks);
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        broadcaster.unsubscribe(USER_ID, sub.id);
        assert_eq!(broadcaster.subscriber_count(USER_ID), 0);
        let report = broadcaster.publish_update(USER_ID, false).await.unwrap();
        assert_eq!(report.delivered, 0);
    }
}
