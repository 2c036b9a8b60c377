//! Short-TTL cache of materialized queue snapshots.
//!
//! Invalidation bumps a per-user generation. A loader takes a
//! [`CacheTicket`] before reading the store and its write is dropped if the
//! generation moved in the meantime, so a reader racing a mutation can never
//! put a pre-mutation snapshot back into the cache.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::models::{now_millis, QueueSnapshot};
use crate::errors::AppError;
use crate::models::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTicket {
    pub user_id: UserId,
    pub generation: i64,
}

#[async_trait]
pub trait SnapshotCache: Send + Sync {
    /// A live (unexpired) snapshot, if any.
    async fn get(&self, user_id: UserId) -> Result<Option<QueueSnapshot>, AppError>;

    /// Record the current generation before loading from the store.
    async fn ticket(&self, user_id: UserId) -> Result<CacheTicket, AppError>;

    /// Store a snapshot loaded under `ticket`. Returns `false` when the entry
    /// was invalidated after the ticket was taken and the write was dropped.
    async fn put(
        &self,
        ticket: CacheTicket,
        snapshot: &QueueSnapshot,
        ttl: Duration,
    ) -> Result<bool, AppError>;

    async fn invalidate(&self, user_id: UserId) -> Result<(), AppError>;

    /// Drop expired snapshots. Returns how many were dropped.
    async fn evict_expired(&self) -> Result<u64, AppError>;

    /// Invalidate every user.
    async fn clear(&self) -> Result<u64, AppError>;
}

struct CachedSnapshot {
    snapshot: QueueSnapshot,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedSnapshot {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

// Slots are never removed, only emptied: forgetting a generation would let
// an old ticket match again.
#[derive(Default)]
struct Slot {
    generation: i64,
    entry: Option<CachedSnapshot>,
}

/// In-process cache. Pair it with the in-process locker.
#[derive(Default)]
pub struct MemorySnapshotCache {
    slots: Mutex<HashMap<UserId, Slot>>,
}

impl MemorySnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotCache for MemorySnapshotCache {
    async fn get(&self, user_id: UserId) -> Result<Option<QueueSnapshot>, AppError> {
        let slots = self.slots.lock();
        Ok(slots
            .get(&user_id)
            .and_then(|slot| slot.entry.as_ref())
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.snapshot.clone()))
    }

    async fn ticket(&self, user_id: UserId) -> Result<CacheTicket, AppError> {
        let generation = self
            .slots
            .lock()
            .get(&user_id)
            .map(|slot| slot.generation)
            .unwrap_or(0);
        Ok(CacheTicket {
            user_id,
            generation,
        })
    }

    async fn put(
        &self,
        ticket: CacheTicket,
        snapshot: &QueueSnapshot,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(ticket.user_id).or_default();
        if slot.generation != ticket.generation {
            return Ok(false);
        }
        slot.entry = Some(CachedSnapshot {
            snapshot: snapshot.clone(),
            cached_at: Instant::now(),
            ttl,
        });
        Ok(true)
    }

    async fn invalidate(&self, user_id: UserId) -> Result<(), AppError> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(user_id).or_default();
        slot.generation += 1;
        slot.entry = None;
        Ok(())
    }

    async fn evict_expired(&self) -> Result<u64, AppError> {
        let mut evicted = 0;
        for slot in self.slots.lock().values_mut() {
            if slot.entry.as_ref().is_some_and(|e| e.is_expired()) {
                slot.entry = None;
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    async fn clear(&self) -> Result<u64, AppError> {
        let mut cleared = 0;
        for slot in self.slots.lock().values_mut() {
            if slot.entry.take().is_some() {
                cleared += 1;
            }
            slot.generation += 1;
        }
        Ok(cleared)
    }
}

/// Cache kept in the `queue_cache` table, shared by every instance using the
/// same database.
#[derive(Debug, Clone)]
pub struct SqliteSnapshotCache {
    pool: Pool<Sqlite>,
}

impl SqliteSnapshotCache {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotCache for SqliteSnapshotCache {
    async fn get(&self, user_id: UserId) -> Result<Option<QueueSnapshot>, AppError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT snapshot_json
            FROM queue_cache
            WHERE user_id = ? AND snapshot_json IS NOT NULL AND expires_at > ?
            "#,
        )
        .bind(user_id)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn ticket(&self, user_id: UserId) -> Result<CacheTicket, AppError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT generation FROM queue_cache WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(CacheTicket {
            user_id,
            generation: row.map(|(g,)| g).unwrap_or(0),
        })
    }

    async fn put(
        &self,
        ticket: CacheTicket,
        snapshot: &QueueSnapshot,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        let now = now_millis();
        let expires_at = now + ttl.as_millis() as i64;
        let json = serde_json::to_string(snapshot)?;

        // Upsert only while the generation still matches the ticket.
        let result = sqlx::query(
            r#"
            INSERT INTO queue_cache (user_id, generation, snapshot_json, cached_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                snapshot_json = excluded.snapshot_json,
                cached_at = excluded.cached_at,
                expires_at = excluded.expires_at
            WHERE queue_cache.generation = excluded.generation
            "#,
        )
        .bind(ticket.user_id)
        .bind(ticket.generation)
        .bind(&json)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn invalidate(&self, user_id: UserId) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO queue_cache (user_id, generation) VALUES (?, 1)
            ON CONFLICT(user_id) DO UPDATE SET
                generation = queue_cache.generation + 1,
                snapshot_json = NULL,
                cached_at = NULL,
                expires_at = NULL
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn evict_expired(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_cache
            SET snapshot_json = NULL, cached_at = NULL, expires_at = NULL
            WHERE snapshot_json IS NOT NULL AND expires_at <= ?
            "#,
        )
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            log::info!("Evicted {} expired queue cache entries", count);
        }
        Ok(count)
    }

    async fn clear(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_cache
            SET generation = generation + 1, snapshot_json = NULL, cached_at = NULL, expires_at = NULL
            "#,
        )
        .execute(&self.pool)
        .await?;
        log::info!("Queue cache cleared");
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    async fn assert_generation_guard(cache: &dyn SnapshotCache) {
        let ttl = Duration::from_secs(60);

        let ticket = cache.ticket(1).await.unwrap();
        assert!(cache.put(ticket, &QueueSnapshot::empty(), ttl).await.unwrap());
        assert!(cache.get(1).await.unwrap().is_some());

        // A load that started before an invalidation must not land.
        let stale_ticket = cache.ticket(1).await.unwrap();
        cache.invalidate(1).await.unwrap();
        assert!(cache.get(1).await.unwrap().is_none());
        assert!(!cache
            .put(stale_ticket, &QueueSnapshot::empty(), ttl)
            .await
            .unwrap());
        assert!(cache.get(1).await.unwrap().is_none());

        let fresh_ticket = cache.ticket(1).await.unwrap();
        assert!(cache
            .put(fresh_ticket, &QueueSnapshot::empty(), ttl)
            .await
            .unwrap());
        assert!(cache.get(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_cache_generation_guard() {
        assert_generation_guard(&MemorySnapshotCache::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_cache_generation_guard() {
        let db = test_support::seeded_database().await;
        assert_generation_guard(&SqliteSnapshotCache::new(db.pool.clone())).await;
    }

    #[tokio::test]
    async fn test_invalidate_before_first_load_blocks_untracked_ticket() {
        let cache = MemorySnapshotCache::new();
        let ticket = cache.ticket(5).await.unwrap();
        cache.invalidate(5).await.unwrap();
        assert!(!cache
            .put(ticket, &QueueSnapshot::empty(), Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_memory_cache_expiry() {
        let cache = MemorySnapshotCache::new();
        let ticket = cache.ticket(1).await.unwrap();
        cache
            .put(ticket, &QueueSnapshot::empty(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cache.get(1).await.unwrap().is_none());
        assert_eq!(cache.evict_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_cache_roundtrips_snapshot() {
        let db = test_support::seeded_database().await;
        let cache = SqliteSnapshotCache::new(db.pool.clone());
        let mut snapshot = QueueSnapshot::empty();
        snapshot.current_index = 3;

        let ticket = cache.ticket(9).await.unwrap();
        cache
            .put(ticket, &snapshot, Duration::from_secs(60))
            .await
            .unwrap();
        let cached = cache.get(9).await.unwrap().unwrap();
        assert_eq!(cached.current_index, 3);

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(cache.get(9).await.unwrap().is_none());
    }
}
