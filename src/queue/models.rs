use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Track, TrackId, UserId};

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Index clamped into `0..n`, or 0 for an empty queue.
pub fn clamp_index(index: i64, n: usize) -> i64 {
    if n == 0 {
        0
    } else {
        index.clamp(0, n as i64 - 1)
    }
}

pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Queue {
    pub id: i64,
    pub user_id: UserId,
    pub current_index: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueTrackEntry {
    pub id: i64,
    pub queue_id: i64,
    pub track_id: TrackId,
    #[sqlx(rename = "position")]
    pub order: i64,
    pub is_deleted: bool,
    pub deleted_at: Option<i64>,
    pub added_at: i64,
}

impl QueueTrackEntry {
    pub fn state(&self) -> EntryState {
        if self.is_deleted {
            EntryState::Tombstoned
        } else {
            EntryState::Active
        }
    }
}

/// Lifecycle of a queue entry. `Purged` rows no longer exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Active,
    Tombstoned,
    Purged,
}

impl EntryState {
    pub fn can_become(self, next: EntryState) -> bool {
        matches!(
            (self, next),
            (EntryState::Active, EntryState::Tombstoned)
                | (EntryState::Tombstoned, EntryState::Active)
                | (EntryState::Tombstoned, EntryState::Purged)
        )
    }
}

/// One row of a materialized queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: i64,
    pub track: Track,
    pub order: i64,
}

/// The ordered active entries plus `current_index`, as cached and pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub tracks: Vec<SnapshotEntry>,
    pub current_index: i64,
    pub timestamp: DateTime<Utc>,
    pub total_tracks: usize,
}

impl QueueSnapshot {
    pub fn empty() -> Self {
        Self {
            tracks: Vec::new(),
            current_index: 0,
            timestamp: Utc::now(),
            total_tracks: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.tracks.iter().map(|e| e.track.id).collect()
    }
}

/// Response body of `current-track`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntryView {
    pub id: i64,
    pub track: Track,
    pub order: i64,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    TrackAdded,
    TrackReactivated,
    AlreadyQueued,
    TrackRemoved,
    NotQueued,
    PlaylistLoaded,
    AlbumAdded,
    Cleared,
    CurrentSet,
}

impl MutationStatus {
    pub fn message(&self) -> &'static str {
        match self {
            MutationStatus::TrackAdded => "track added to queue",
            MutationStatus::TrackReactivated => "track re-added to queue",
            MutationStatus::AlreadyQueued => "track already in queue",
            MutationStatus::TrackRemoved => "track removed from queue",
            MutationStatus::NotQueued => "track not in queue",
            MutationStatus::PlaylistLoaded => "playlist added to queue",
            MutationStatus::AlbumAdded => "album added to queue",
            MutationStatus::Cleared => "queue cleared",
            MutationStatus::CurrentSet => "current track set",
        }
    }
}

/// What a mutation did. `changed == false` means the store was left untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationResult {
    pub status: String,
    #[serde(skip)]
    pub kind: MutationStatus,
    pub changed: bool,
    pub current_index: i64,
    pub total_tracks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_play: Option<bool>,
}

impl MutationResult {
    pub fn new(kind: MutationStatus, changed: bool, current_index: i64, total_tracks: usize) -> Self {
        Self {
            status: kind.message().to_string(),
            kind,
            changed,
            current_index,
            total_tracks,
            auto_play: None,
        }
    }

    pub fn with_auto_play(mut self) -> Self {
        self.auto_play = Some(true);
        self
    }
}
