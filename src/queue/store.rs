//! Durable queue state. The single source of truth for every user's queue.
//!
//! Methods taking a `conn` run inside the caller's transaction, so a whole
//! mutation (tombstones, renumbering, `current_index`) commits or rolls back
//! together.

use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::ops::{Deref, DerefMut};

use super::models::{Queue, QueueTrackEntry};
use crate::errors::AppError;
use crate::models::{TrackId, UserId};

const QUEUE_COLUMNS: &str = "id, user_id, current_index, created_at, updated_at";
const ENTRY_COLUMNS: &str = "id, queue_id, track_id, position, is_deleted, deleted_at, added_at";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub queues: i64,
    pub active_entries: i64,
    pub tombstoned_entries: i64,
    pub empty_queues: i64,
    pub large_queues: i64,
}

const TAKEN: &str = "write transaction used after commit";

/// A transaction opened with `BEGIN IMMEDIATE`.
///
/// The write lock is taken up front, so a second writer waits out the busy
/// timeout instead of failing when its read would have to become a write.
/// Dropping it without [`WriteTx::commit`] rolls back before the connection
/// goes back to the pool.
pub struct WriteTx {
    conn: Option<PoolConnection<Sqlite>>,
}

impl WriteTx {
    async fn begin(pool: &Pool<Sqlite>) -> Result<Self, AppError> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Self { conn: Some(conn) })
    }

    pub async fn commit(mut self) -> Result<(), AppError> {
        if let Some(conn) = self.conn.as_mut() {
            sqlx::query("COMMIT").execute(&mut **conn).await?;
        }
        drop(self.conn.take());
        Ok(())
    }
}

impl Deref for WriteTx {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        self.conn.as_deref().expect(TAKEN)
    }
}

impl DerefMut for WriteTx {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        self.conn.as_deref_mut().expect(TAKEN)
    }
}

impl Drop for WriteTx {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            tokio::spawn(async move {
                let rolled_back = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                if let Err(e) = rolled_back {
                    log::warn!("Failed to roll back queue transaction: {}", e);
                    // Never hand a connection with an open transaction back.
                    drop(conn.detach());
                }
            });
        }
    }
}

pub struct QueueStore {
    pool: Pool<Sqlite>,
}

impl QueueStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Open a write transaction for one queue mutation.
    pub async fn begin(&self) -> Result<WriteTx, AppError> {
        WriteTx::begin(&self.pool).await
    }

    /// All queues of a user, most recently created first.
    pub async fn queues_for_user(
        &self,
        conn: &mut SqliteConnection,
        user_id: UserId,
    ) -> Result<Vec<Queue>, AppError> {
        let sql = format!(
            "SELECT {} FROM queues WHERE user_id = ? ORDER BY created_at DESC, id DESC",
            QUEUE_COLUMNS
        );
        let queues = sqlx::query_as::<_, Queue>(&sql)
            .bind(user_id)
            .fetch_all(&mut *conn)
            .await?;
        Ok(queues)
    }

    pub async fn create_queue(
        &self,
        conn: &mut SqliteConnection,
        user_id: UserId,
        now: i64,
    ) -> Result<Queue, AppError> {
        let sql = format!(
            "INSERT INTO queues (user_id, current_index, created_at, updated_at) VALUES (?, 0, ?, ?) RETURNING {}",
            QUEUE_COLUMNS
        );
        let queue = sqlx::query_as::<_, Queue>(&sql)
            .bind(user_id)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *conn)
            .await?;

        log::info!("Created queue {} for user {}", queue.id, user_id);
        Ok(queue)
    }

    /// Collapse a user's queues down to the `keep` most recent ones.
    ///
    /// Losers have their active entries tombstoned before the queue row is
    /// dropped. Returns the surviving queues (newest first) and how many were
    /// dropped.
    pub async fn reconcile_user_queues(
        &self,
        conn: &mut SqliteConnection,
        user_id: UserId,
        keep: usize,
        now: i64,
    ) -> Result<(Vec<Queue>, usize), AppError> {
        let mut queues = self.queues_for_user(conn, user_id).await?;
        let keep = keep.max(1);
        if queues.len() <= keep {
            return Ok((queues, 0));
        }

        let losers = queues.split_off(keep);
        for loser in &losers {
            self.tombstone_all(conn, loser.id, now).await?;
            sqlx::query("DELETE FROM queues WHERE id = ?")
                .bind(loser.id)
                .execute(&mut *conn)
                .await?;
        }

        log::warn!(
            "Removed {} duplicate queue(s) for user {}",
            losers.len(),
            user_id
        );
        Ok((queues, losers.len()))
    }

    /// Active entries in queue order.
    pub async fn active_entries(
        &self,
        conn: &mut SqliteConnection,
        queue_id: i64,
    ) -> Result<Vec<QueueTrackEntry>, AppError> {
        let sql = format!(
            "SELECT {} FROM queue_tracks WHERE queue_id = ? AND is_deleted = 0 ORDER BY position ASC, added_at ASC, id ASC",
            ENTRY_COLUMNS
        );
        let entries = sqlx::query_as::<_, QueueTrackEntry>(&sql)
            .bind(queue_id)
            .fetch_all(&mut *conn)
            .await?;
        Ok(entries)
    }

    /// The entry for a track regardless of state. At most one exists per queue.
    pub async fn find_entry(
        &self,
        conn: &mut SqliteConnection,
        queue_id: i64,
        track_id: TrackId,
    ) -> Result<Option<QueueTrackEntry>, AppError> {
        let sql = format!(
            "SELECT {} FROM queue_tracks WHERE queue_id = ? AND track_id = ?",
            ENTRY_COLUMNS
        );
        let entry = sqlx::query_as::<_, QueueTrackEntry>(&sql)
            .bind(queue_id)
            .bind(track_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(entry)
    }

    pub async fn insert_entry(
        &self,
        conn: &mut SqliteConnection,
        queue_id: i64,
        track_id: TrackId,
        position: i64,
        now: i64,
    ) -> Result<QueueTrackEntry, AppError> {
        let sql = format!(
            "INSERT INTO queue_tracks (queue_id, track_id, position, is_deleted, added_at) VALUES (?, ?, ?, 0, ?) RETURNING {}",
            ENTRY_COLUMNS
        );
        let entry = sqlx::query_as::<_, QueueTrackEntry>(&sql)
            .bind(queue_id)
            .bind(track_id)
            .bind(position)
            .bind(now)
            .fetch_one(&mut *conn)
            .await?;
        Ok(entry)
    }

    pub async fn reactivate_entry(
        &self,
        conn: &mut SqliteConnection,
        entry_id: i64,
        position: i64,
        now: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE queue_tracks SET is_deleted = 0, deleted_at = NULL, position = ?, added_at = ? WHERE id = ?",
        )
        .bind(position)
        .bind(now)
        .bind(entry_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn tombstone_entry(
        &self,
        conn: &mut SqliteConnection,
        entry_id: i64,
        now: i64,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE queue_tracks SET is_deleted = 1, deleted_at = ? WHERE id = ?")
            .bind(now)
            .bind(entry_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn tombstone_all(
        &self,
        conn: &mut SqliteConnection,
        queue_id: i64,
        now: i64,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE queue_tracks SET is_deleted = 1, deleted_at = ? WHERE queue_id = ? AND is_deleted = 0",
        )
        .bind(now)
        .bind(queue_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Shift every active entry after `removed_position` one place forward.
    pub async fn close_gap(
        &self,
        conn: &mut SqliteConnection,
        queue_id: i64,
        removed_position: i64,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE queue_tracks SET position = position - 1 WHERE queue_id = ? AND is_deleted = 0 AND position > ?",
        )
        .bind(queue_id)
        .bind(removed_position)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Rewrite active positions to `0..N-1`, keeping their relative order.
    /// Returns how many entries moved.
    pub async fn renumber_active(
        &self,
        conn: &mut SqliteConnection,
        queue_id: i64,
    ) -> Result<u64, AppError> {
        let entries = self.active_entries(conn, queue_id).await?;
        let mut moved = 0;
        for (index, entry) in entries.iter().enumerate() {
            let index = index as i64;
            if entry.order != index {
                sqlx::query("UPDATE queue_tracks SET position = ? WHERE id = ?")
                    .bind(index)
                    .bind(entry.id)
                    .execute(&mut *conn)
                    .await?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    pub async fn set_current_index(
        &self,
        conn: &mut SqliteConnection,
        queue_id: i64,
        current_index: i64,
        now: i64,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE queues SET current_index = ?, updated_at = ? WHERE id = ?")
            .bind(current_index)
            .bind(now)
            .bind(queue_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn touch(
        &self,
        conn: &mut SqliteConnection,
        queue_id: i64,
        now: i64,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE queues SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(queue_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Consistent read of a user's newest queue and its active entries.
    ///
    /// Both reads share one transaction so a concurrent commit is seen either
    /// entirely or not at all.
    pub async fn load_user_queue(
        &self,
        user_id: UserId,
    ) -> Result<Option<(Queue, Vec<QueueTrackEntry>)>, AppError> {
        let mut tx = self.pool.begin().await?;
        let queue = self.queues_for_user(&mut tx, user_id).await?.into_iter().next();
        let loaded = match queue {
            Some(queue) => {
                let entries = self.active_entries(&mut tx, queue.id).await?;
                Some((queue, entries))
            }
            None => None,
        };
        tx.commit().await?;
        Ok(loaded)
    }

    /// Active track ids across all of a user's queues.
    pub async fn active_track_ids_for_user(&self, user_id: UserId) -> Result<Vec<TrackId>, AppError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT qt.track_id
            FROM queue_tracks qt
            JOIN queues q ON qt.queue_id = q.id
            WHERE q.user_id = ? AND qt.is_deleted = 0
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn queue_count(&self, user_id: UserId) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queues WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn users_with_queues(&self) -> Result<Vec<UserId>, AppError> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT DISTINCT user_id FROM queues ORDER BY user_id ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Permanently delete entries tombstoned before `cutoff` (unix millis).
    pub async fn purge_tombstones(&self, cutoff: i64) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM queue_tracks WHERE is_deleted = 1 AND deleted_at IS NOT NULL AND deleted_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            log::info!("Purged {} soft-deleted queue entries", count);
        }
        Ok(count)
    }

    pub async fn stats(&self, large_threshold: usize) -> Result<StoreStats, AppError> {
        let (queues, active_entries, tombstoned_entries, empty_queues, large_queues): (
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM queues),
                (SELECT COUNT(*) FROM queue_tracks WHERE is_deleted = 0),
                (SELECT COUNT(*) FROM queue_tracks WHERE is_deleted = 1),
                (SELECT COUNT(*) FROM queues q WHERE NOT EXISTS (
                    SELECT 1 FROM queue_tracks qt WHERE qt.queue_id = q.id AND qt.is_deleted = 0
                )),
                (SELECT COUNT(*) FROM (
                    SELECT queue_id FROM queue_tracks WHERE is_deleted = 0
                    GROUP BY queue_id HAVING COUNT(*) > ?
                ))
            "#,
        )
        .bind(large_threshold as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            queues,
            active_entries,
            tombstoned_entries,
            empty_queues,
            large_queues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::models::now_millis;
    use crate::test_support::{self, USER_ID};

    #[tokio::test]
    async fn test_reconcile_keeps_newest_queue() {
        let db = test_support::seeded_database().await;
        let store = QueueStore::new(db.pool.clone());

        let mut tx = store.begin().await.unwrap();
        let old = store.create_queue(&mut tx, USER_ID, 1_000).await.unwrap();
        store.insert_entry(&mut tx, old.id, 1, 0, 1_000).await.unwrap();
        let newest = store.create_queue(&mut tx, USER_ID, 2_000).await.unwrap();

        let (kept, dropped) = store
            .reconcile_user_queues(&mut tx, USER_ID, 1, 3_000)
            .await
            .unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, newest.id);

        let stale = store.find_entry(&mut tx, old.id, 1).await.unwrap().unwrap();
        assert!(stale.is_deleted);
        assert_eq!(stale.deleted_at, Some(3_000));
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_gap_and_renumber() {
        let db = test_support::seeded_database().await;
        let store = QueueStore::new(db.pool.clone());
        let now = now_millis();

        let mut tx = store.begin().await.unwrap();
        let queue = store.create_queue(&mut tx, USER_ID, now).await.unwrap();
        for (position, track) in [1, 2, 3].into_iter().enumerate() {
            store
                .insert_entry(&mut tx, queue.id, track, position as i64, now)
                .await
                .unwrap();
        }
        let middle = store.find_entry(&mut tx, queue.id, 2).await.unwrap().unwrap();
        store.tombstone_entry(&mut tx, middle.id, now).await.unwrap();
        assert_eq!(store.close_gap(&mut tx, queue.id, 1).await.unwrap(), 1);

        let orders: Vec<i64> = store
            .active_entries(&mut tx, queue.id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.order)
            .collect();
        assert_eq!(orders, vec![0, 1]);

        // Punch a gap directly and let renumbering repair it.
        sqlx::query("UPDATE queue_tracks SET position = 7 WHERE queue_id = ? AND track_id = 3")
            .bind(queue.id)
            .execute(&mut *tx)
            .await
            .unwrap();
        assert_eq!(store.renumber_active(&mut tx, queue.id).await.unwrap(), 1);
        let entries = store.active_entries(&mut tx, queue.id).await.unwrap();
        assert_eq!(entries.last().unwrap().order, 1);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_only_old_tombstones() {
        let db = test_support::seeded_database().await;
        let store = QueueStore::new(db.pool.clone());

        let mut tx = store.begin().await.unwrap();
        let queue = store.create_queue(&mut tx, USER_ID, 0).await.unwrap();
        let old = store.insert_entry(&mut tx, queue.id, 1, 0, 0).await.unwrap();
        let recent = store.insert_entry(&mut tx, queue.id, 2, 1, 0).await.unwrap();
        store.insert_entry(&mut tx, queue.id, 3, 2, 0).await.unwrap();
        store.tombstone_entry(&mut tx, old.id, 100).await.unwrap();
        store.tombstone_entry(&mut tx, recent.id, 10_000).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.purge_tombstones(5_000).await.unwrap(), 1);

        let stats = store.stats(100).await.unwrap();
        assert_eq!(stats.queues, 1);
        assert_eq!(stats.active_entries, 1);
        assert_eq!(stats.tombstoned_entries, 1);
        assert_eq!(stats.large_queues, 0);
    }
}
