//! Queue mutations.
//!
//! Every mutation for a user runs under that user's lock and follows the
//! same shape: acquire, invalidate the cache, apply one store transaction,
//! invalidate again, release, then broadcast the refreshed snapshot.
//!
//! Catalog lookups happen before the transaction is opened. A transaction
//! pins a pool connection for its whole lifetime, so nothing inside one may
//! go back to the pool.

use sqlx::SqliteConnection;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use super::cache::SnapshotCache;
use super::lock::Locker;
use super::models::{
    clamp_index, millis_to_datetime, now_millis, MutationResult, MutationStatus, Queue,
    QueueEntryView, QueueSnapshot,
};
use super::snapshot::SnapshotReader;
use super::store::QueueStore;
use crate::catalog::Catalog;
use crate::errors::AppError;
use crate::models::{AlbumId, PlaylistId, TrackId, UserId};
use crate::realtime::Broadcaster;

/// What a repair pass changed for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairOutcome {
    pub queues_dropped: usize,
    pub orphans_removed: u64,
    pub entries_renumbered: u64,
    pub indexes_clamped: u64,
}

impl RepairOutcome {
    pub fn changed(&self) -> bool {
        self.queues_dropped > 0
            || self.orphans_removed > 0
            || self.entries_renumbered > 0
            || self.indexes_clamped > 0
    }
}

pub struct QueueMutationService {
    store: Arc<QueueStore>,
    catalog: Arc<dyn Catalog>,
    locker: Arc<dyn Locker>,
    cache: Arc<dyn SnapshotCache>,
    reader: Arc<SnapshotReader>,
    broadcaster: Arc<Broadcaster>,
    max_queue_tracks: usize,
}

impl QueueMutationService {
    pub fn new(
        store: Arc<QueueStore>,
        catalog: Arc<dyn Catalog>,
        locker: Arc<dyn Locker>,
        cache: Arc<dyn SnapshotCache>,
        reader: Arc<SnapshotReader>,
        broadcaster: Arc<Broadcaster>,
        max_queue_tracks: usize,
    ) -> Self {
        Self {
            store,
            catalog,
            locker,
            cache,
            reader,
            broadcaster,
            max_queue_tracks,
        }
    }

    async fn invalidate(&self, user_id: UserId) {
        if let Err(e) = self.cache.invalidate(user_id).await {
            log::warn!("Failed to invalidate queue cache for user {}: {}", user_id, e);
        }
    }

    /// Run `op` while holding the user's lock.
    ///
    /// The cache is invalidated before `op` so readers fall through to the
    /// store, and again after it so a reader that loaded the pre-commit state
    /// in between cannot leave it cached.
    async fn locked<T, F>(&self, user_id: UserId, op: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        let lease = self.locker.acquire(user_id).await?;
        self.invalidate(user_id).await;

        let outcome = op.await;

        self.invalidate(user_id).await;
        if let Err(e) = self.locker.release(&lease).await {
            log::warn!("Failed to release queue lock of user {}: {}", user_id, e);
        }
        if let Err(e) = &outcome {
            log::debug!("Queue mutation for user {} aborted: {}", user_id, e);
        }
        outcome
    }

    async fn after_mutation(&self, user_id: UserId, result: &MutationResult) {
        let auto_play = result.auto_play.unwrap_or(false);
        if !result.changed && !auto_play {
            return;
        }
        if let Err(e) = self.broadcaster.publish_update(user_id, auto_play).await {
            log::warn!("Queue broadcast failed for user {}: {}", user_id, e);
        }
    }

    /// The user's single queue, created if missing. Extra queues are collapsed
    /// into the most recent one. Returns how many were dropped.
    async fn canonical_queue(
        &self,
        conn: &mut SqliteConnection,
        user_id: UserId,
        now: i64,
    ) -> Result<(Queue, usize), AppError> {
        let (kept, dropped) = self
            .store
            .reconcile_user_queues(conn, user_id, 1, now)
            .await?;
        let queue = match kept.into_iter().next() {
            Some(queue) => queue,
            None => self.store.create_queue(conn, user_id, now).await?,
        };
        Ok((queue, dropped))
    }

    fn ensure_capacity(&self, current: usize, adding: usize) -> Result<(), AppError> {
        if current + adding > self.max_queue_tracks {
            return Err(AppError::QueueFull(format!(
                "queue holds {} tracks, adding {} would exceed the limit of {}",
                current, adding, self.max_queue_tracks
            )));
        }
        Ok(())
    }

    /// Put a track that is not active at `position`, reviving its tombstone if
    /// one exists. Returns whether it was reactivated.
    async fn place_track(
        &self,
        conn: &mut SqliteConnection,
        queue_id: i64,
        track_id: TrackId,
        position: i64,
        now: i64,
    ) -> Result<bool, AppError> {
        match self.store.find_entry(conn, queue_id, track_id).await? {
            Some(entry) => {
                self.store
                    .reactivate_entry(conn, entry.id, position, now)
                    .await?;
                Ok(true)
            }
            None => {
                self.store
                    .insert_entry(conn, queue_id, track_id, position, now)
                    .await?;
                Ok(false)
            }
        }
    }

    async fn require_track(&self, track_id: TrackId) -> Result<(), AppError> {
        match self.catalog.track(track_id).await? {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(format!("Track {} not found", track_id))),
        }
    }

    pub async fn get_or_create(&self, user_id: UserId) -> Result<Queue, AppError> {
        let (queue, dropped) = self
            .locked(user_id, async {
                let now = now_millis();
                let mut tx = self.store.begin().await?;
                let found = self.canonical_queue(&mut tx, user_id, now).await?;
                tx.commit().await?;
                Ok(found)
            })
            .await?;

        if dropped > 0 {
            if let Err(e) = self.broadcaster.publish_sync(user_id).await {
                log::warn!("Queue resync broadcast failed for user {}: {}", user_id, e);
            }
        }
        Ok(queue)
    }

    /// Snapshot for reads. Served from cache when possible and never queued
    /// behind a mutation: the lock is only taken to create a missing queue or
    /// collapse duplicates, and a busy lock falls back to a plain store read.
    pub async fn current_queue(&self, user_id: UserId) -> Result<QueueSnapshot, AppError> {
        if let Some(snapshot) = self.reader.cached(user_id).await {
            return Ok(snapshot);
        }

        if self.store.queue_count(user_id).await? != 1 {
            match self.get_or_create(user_id).await {
                Ok(_) => {}
                Err(AppError::LockUnavailable(reason)) => {
                    log::warn!("Reading queue of user {} without setup: {}", user_id, reason);
                }
                Err(e) => return Err(e),
            }
        }
        self.reader.read_through(user_id).await
    }

    pub async fn add_track(
        &self,
        user_id: UserId,
        track_id: TrackId,
    ) -> Result<MutationResult, AppError> {
        self.require_track(track_id).await?;

        let result = self
            .locked(user_id, async {
                let now = now_millis();
                let mut tx = self.store.begin().await?;
                let (queue, _) = self.canonical_queue(&mut tx, user_id, now).await?;
                let total = self.store.active_entries(&mut tx, queue.id).await?.len();

                let existing = self.store.find_entry(&mut tx, queue.id, track_id).await?;
                let result = match existing {
                    Some(entry) if !entry.is_deleted => MutationResult::new(
                        MutationStatus::AlreadyQueued,
                        false,
                        queue.current_index,
                        total,
                    ),
                    _ => {
                        self.ensure_capacity(total, 1)?;
                        let reactivated = self
                            .place_track(&mut tx, queue.id, track_id, total as i64, now)
                            .await?;
                        self.store.touch(&mut tx, queue.id, now).await?;
                        let status = if reactivated {
                            MutationStatus::TrackReactivated
                        } else {
                            MutationStatus::TrackAdded
                        };
                        MutationResult::new(status, true, queue.current_index, total + 1)
                    }
                };

                tx.commit().await?;
                Ok(result)
            })
            .await?;

        self.after_mutation(user_id, &result).await;
        Ok(result)
    }

    pub async fn remove_track(
        &self,
        user_id: UserId,
        track_id: TrackId,
    ) -> Result<MutationResult, AppError> {
        let result = self
            .locked(user_id, async {
                let now = now_millis();
                let mut tx = self.store.begin().await?;
                let (queue, _) = self.canonical_queue(&mut tx, user_id, now).await?;
                let total = self.store.active_entries(&mut tx, queue.id).await?.len();

                let active = self
                    .store
                    .find_entry(&mut tx, queue.id, track_id)
                    .await?
                    .filter(|entry| !entry.is_deleted);
                let Some(entry) = active else {
                    tx.commit().await?;
                    return Ok(MutationResult::new(
                        MutationStatus::NotQueued,
                        false,
                        queue.current_index,
                        total,
                    ));
                };

                self.store.tombstone_entry(&mut tx, entry.id, now).await?;
                self.store.close_gap(&mut tx, queue.id, entry.order).await?;

                let remaining = total.saturating_sub(1);
                let mut current = queue.current_index;
                if current > entry.order {
                    current -= 1;
                }
                let current = clamp_index(current, remaining);
                self.store
                    .set_current_index(&mut tx, queue.id, current, now)
                    .await?;

                tx.commit().await?;
                Ok(MutationResult::new(
                    MutationStatus::TrackRemoved,
                    true,
                    current,
                    remaining,
                ))
            })
            .await?;

        self.after_mutation(user_id, &result).await;
        Ok(result)
    }

    /// Replace the whole queue with a playlist, in playlist order.
    pub async fn add_playlist(
        &self,
        user_id: UserId,
        playlist_id: PlaylistId,
    ) -> Result<MutationResult, AppError> {
        let mut track_ids = self
            .catalog
            .playlist_tracks(playlist_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Playlist {} not found", playlist_id)))?;

        // A track can only be queued once; keep its first occurrence.
        let mut seen = HashSet::new();
        track_ids.retain(|id| seen.insert(*id));
        self.ensure_capacity(0, track_ids.len())?;

        let result = self
            .locked(user_id, async {
                let now = now_millis();
                let mut tx = self.store.begin().await?;
                let (queue, _) = self.canonical_queue(&mut tx, user_id, now).await?;

                self.store.tombstone_all(&mut tx, queue.id, now).await?;
                for (position, track_id) in track_ids.iter().enumerate() {
                    self.place_track(&mut tx, queue.id, *track_id, position as i64, now)
                        .await?;
                }
                self.store.set_current_index(&mut tx, queue.id, 0, now).await?;

                tx.commit().await?;
                Ok(MutationResult::new(
                    MutationStatus::PlaylistLoaded,
                    true,
                    0,
                    track_ids.len(),
                ))
            })
            .await?;

        log::info!(
            "Loaded playlist {} ({} tracks) into queue of user {}",
            playlist_id,
            result.total_tracks,
            user_id
        );
        self.after_mutation(user_id, &result).await;
        Ok(result)
    }

    /// Append an album in track order. Tracks already queued stay where they are.
    pub async fn add_album(
        &self,
        user_id: UserId,
        album_id: AlbumId,
    ) -> Result<MutationResult, AppError> {
        let album_tracks = self
            .catalog
            .album_tracks(album_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Album {} not found", album_id)))?;

        let result = self
            .locked(user_id, async {
                let now = now_millis();
                let mut tx = self.store.begin().await?;
                let (queue, _) = self.canonical_queue(&mut tx, user_id, now).await?;
                let active = self.store.active_entries(&mut tx, queue.id).await?;

                let mut seen: HashSet<TrackId> = active.iter().map(|e| e.track_id).collect();
                let appended: Vec<TrackId> = album_tracks
                    .iter()
                    .copied()
                    .filter(|id| seen.insert(*id))
                    .collect();
                self.ensure_capacity(active.len(), appended.len())?;

                for (offset, track_id) in appended.iter().enumerate() {
                    let position = (active.len() + offset) as i64;
                    self.place_track(&mut tx, queue.id, *track_id, position, now)
                        .await?;
                }
                if !appended.is_empty() {
                    self.store.touch(&mut tx, queue.id, now).await?;
                }

                tx.commit().await?;
                Ok(MutationResult::new(
                    MutationStatus::AlbumAdded,
                    !appended.is_empty(),
                    queue.current_index,
                    active.len() + appended.len(),
                ))
            })
            .await?;

        self.after_mutation(user_id, &result).await;
        Ok(result)
    }

    pub async fn clear(&self, user_id: UserId) -> Result<MutationResult, AppError> {
        let result = self
            .locked(user_id, async {
                let now = now_millis();
                let mut tx = self.store.begin().await?;
                let (queue, _) = self.canonical_queue(&mut tx, user_id, now).await?;

                let removed = self.store.tombstone_all(&mut tx, queue.id, now).await?;
                self.store.set_current_index(&mut tx, queue.id, 0, now).await?;

                tx.commit().await?;
                Ok(MutationResult::new(
                    MutationStatus::Cleared,
                    removed > 0 || queue.current_index != 0,
                    0,
                    0,
                ))
            })
            .await?;

        self.after_mutation(user_id, &result).await;
        Ok(result)
    }

    /// Select a track for playback, appending it first when it is not queued.
    /// Clients are told to start playing.
    pub async fn set_current(
        &self,
        user_id: UserId,
        track_id: TrackId,
    ) -> Result<MutationResult, AppError> {
        self.require_track(track_id).await?;

        let result = self
            .locked(user_id, async {
                let now = now_millis();
                let mut tx = self.store.begin().await?;
                let (queue, _) = self.canonical_queue(&mut tx, user_id, now).await?;
                let mut total = self.store.active_entries(&mut tx, queue.id).await?.len();

                let existing = self.store.find_entry(&mut tx, queue.id, track_id).await?;
                let index = match existing {
                    Some(entry) if !entry.is_deleted => entry.order,
                    _ => {
                        self.ensure_capacity(total, 1)?;
                        let position = total as i64;
                        self.place_track(&mut tx, queue.id, track_id, position, now)
                            .await?;
                        total += 1;
                        position
                    }
                };
                self.store
                    .set_current_index(&mut tx, queue.id, index, now)
                    .await?;

                tx.commit().await?;
                Ok(MutationResult::new(MutationStatus::CurrentSet, true, index, total).with_auto_play())
            })
            .await?;

        self.after_mutation(user_id, &result).await;
        Ok(result)
    }

    /// The entry `current_index` points at. Not serialized with mutations.
    pub async fn current_track(&self, user_id: UserId) -> Result<QueueEntryView, AppError> {
        let empty = || AppError::NotFound("Queue is empty".to_string());

        let (queue, entries) = self.store.load_user_queue(user_id).await?.ok_or_else(empty)?;
        if entries.is_empty() {
            return Err(empty());
        }

        let index = clamp_index(queue.current_index, entries.len()) as usize;
        let entry = &entries[index];
        let track = self
            .catalog
            .track(entry.track_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Track {} not found", entry.track_id)))?;

        Ok(QueueEntryView {
            id: entry.id,
            track,
            order: entry.order,
            added_at: millis_to_datetime(entry.added_at),
        })
    }

    /// Bring a user's queues back in line: at most `max_queues` of them,
    /// no entries for tracks the catalog no longer has, contiguous order and
    /// an in-range `current_index`. Connected clients are told to resync when
    /// anything changed.
    pub async fn repair(
        &self,
        user_id: UserId,
        max_queues: usize,
    ) -> Result<RepairOutcome, AppError> {
        let queued = self.store.active_track_ids_for_user(user_id).await?;
        let known = self.catalog.tracks(&queued).await?;
        let orphans: HashSet<TrackId> = queued
            .into_iter()
            .filter(|id| !known.contains_key(id))
            .collect();

        let outcome = self
            .locked(user_id, async {
                let now = now_millis();
                let mut tx = self.store.begin().await?;
                let mut outcome = RepairOutcome::default();

                let (kept, dropped) = self
                    .store
                    .reconcile_user_queues(&mut tx, user_id, max_queues, now)
                    .await?;
                outcome.queues_dropped = dropped;

                for queue in &kept {
                    let entries = self.store.active_entries(&mut tx, queue.id).await?;
                    let mut remaining = entries.len();
                    let mut current = queue.current_index;
                    for (position, entry) in entries.iter().enumerate() {
                        if !orphans.contains(&entry.track_id) {
                            continue;
                        }
                        self.store.tombstone_entry(&mut tx, entry.id, now).await?;
                        outcome.orphans_removed += 1;
                        remaining -= 1;
                        if (position as i64) < queue.current_index {
                            current -= 1;
                        }
                    }
                    outcome.entries_renumbered +=
                        self.store.renumber_active(&mut tx, queue.id).await?;

                    let current = clamp_index(current, remaining);
                    if current != queue.current_index {
                        self.store
                            .set_current_index(&mut tx, queue.id, current, now)
                            .await?;
                        outcome.indexes_clamped += 1;
                    }
                }

                tx.commit().await?;
                Ok(outcome)
            })
            .await?;

        if outcome.changed() {
            log::info!("Repaired queue of user {}: {:?}", user_id, outcome);
            if let Err(e) = self.broadcaster.publish_sync(user_id).await {
                log::warn!("Queue resync broadcast failed for user {}: {}", user_id, e);
            }
        }
        Ok(outcome)
    }
}
