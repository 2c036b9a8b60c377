//! Materialized queue views: store rows joined with catalog metadata.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::cache::SnapshotCache;
use super::models::{clamp_index, QueueSnapshot, QueueTrackEntry, SnapshotEntry};
use super::store::QueueStore;
use crate::catalog::Catalog;
use crate::errors::AppError;
use crate::models::UserId;

pub struct SnapshotReader {
    store: Arc<QueueStore>,
    catalog: Arc<dyn Catalog>,
    cache: Arc<dyn SnapshotCache>,
    ttl: Duration,
    empty_ttl: Duration,
}

impl SnapshotReader {
    pub fn new(
        store: Arc<QueueStore>,
        catalog: Arc<dyn Catalog>,
        cache: Arc<dyn SnapshotCache>,
        ttl: Duration,
        empty_ttl: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            cache,
            ttl,
            empty_ttl,
        }
    }

    /// Cached snapshot only. Cache failures read as a miss.
    pub async fn cached(&self, user_id: UserId) -> Option<QueueSnapshot> {
        match self.cache.get(user_id).await {
            Ok(hit) => hit,
            Err(e) => {
                log::warn!("Queue cache read failed for user {}: {}", user_id, e);
                None
            }
        }
    }

    /// Cache first, then the store. A store read repopulates the cache.
    pub async fn read_through(&self, user_id: UserId) -> Result<QueueSnapshot, AppError> {
        if let Some(snapshot) = self.cached(user_id).await {
            return Ok(snapshot);
        }
        self.refresh(user_id).await
    }

    /// Rebuild from the store, ignoring whatever is cached, and cache the result.
    pub async fn refresh(&self, user_id: UserId) -> Result<QueueSnapshot, AppError> {
        // Taken before the store read so a concurrent invalidation voids our write.
        let ticket = match self.cache.ticket(user_id).await {
            Ok(ticket) => Some(ticket),
            Err(e) => {
                log::warn!("Queue cache unavailable for user {}: {}", user_id, e);
                None
            }
        };

        let snapshot = self.load_fresh(user_id).await?;

        if let Some(ticket) = ticket {
            let ttl = if snapshot.is_empty() {
                self.empty_ttl
            } else {
                self.ttl
            };
            match self.cache.put(ticket, &snapshot, ttl).await {
                Ok(true) => {}
                Ok(false) => log::debug!(
                    "Skipped caching queue of user {}, invalidated during load",
                    user_id
                ),
                Err(e) => log::warn!("Queue cache write failed for user {}: {}", user_id, e),
            }
        }

        Ok(snapshot)
    }

    /// Snapshot straight from the store. No cache involvement.
    pub async fn load_fresh(&self, user_id: UserId) -> Result<QueueSnapshot, AppError> {
        match self.store.load_user_queue(user_id).await? {
            Some((queue, entries)) => self.materialize(queue.current_index, &entries).await,
            None => Ok(QueueSnapshot::empty()),
        }
    }

    /// Join entries with their tracks. Entries whose track is gone are left
    /// out, and the visible rows are renumbered with `current_index` following
    /// the entry it pointed at.
    async fn materialize(
        &self,
        current_index: i64,
        entries: &[QueueTrackEntry],
    ) -> Result<QueueSnapshot, AppError> {
        let ids: Vec<i64> = entries.iter().map(|e| e.track_id).collect();
        let mut tracks = self.catalog.tracks(&ids).await?;

        let mut rows = Vec::with_capacity(entries.len());
        let mut current = current_index;
        for (position, entry) in entries.iter().enumerate() {
            match tracks.remove(&entry.track_id) {
                Some(track) => {
                    let order = rows.len() as i64;
                    rows.push(SnapshotEntry {
                        id: entry.id,
                        track,
                        order,
                    });
                }
                None => {
                    log::error!(
                        "Queue entry {} references missing track {}",
                        entry.id,
                        entry.track_id
                    );
                    if (position as i64) < current_index {
                        current -= 1;
                    }
                }
            }
        }

        let total_tracks = rows.len();
        Ok(QueueSnapshot {
            tracks: rows,
            current_index: clamp_index(current, total_tracks),
            timestamp: Utc::now(),
            total_tracks,
        })
    }
}
