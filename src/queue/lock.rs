//! Per-user mutual exclusion with a bounded wait and a bounded lease.
//!
//! Every queue mutation for a user runs while holding that user's lock.
//! A lease that outlives its holder (crashed task, dead process) expires
//! and can be taken over, so a lost release never wedges a queue.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::models::now_millis;
use crate::errors::AppError;
use crate::models::UserId;

/// How often the shared lock table is polled while waiting.
const SQLITE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Proof of holding a user's lock. Hand it back to [`Locker::release`].
#[derive(Debug, Clone)]
pub struct LockLease {
    pub user_id: UserId,
    pub token: String,
    acquired_at: Instant,
    lease: Duration,
}

impl LockLease {
    fn new(user_id: UserId, lease: Duration) -> Self {
        Self {
            user_id,
            token: Uuid::new_v4().to_string(),
            acquired_at: Instant::now(),
            lease,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.lease
    }
}

#[async_trait]
pub trait Locker: Send + Sync {
    /// Wait up to the configured bound for the user's lock.
    /// Fails with [`AppError::LockUnavailable`] when the bound is hit.
    async fn acquire(&self, user_id: UserId) -> Result<LockLease, AppError>;

    /// Give the lock back. Releasing a lease that already expired and was
    /// taken over by someone else is a no-op.
    async fn release(&self, lease: &LockLease) -> Result<(), AppError>;
}

fn unavailable(user_id: UserId, wait: Duration) -> AppError {
    AppError::LockUnavailable(format!(
        "could not lock queue of user {} within {}ms",
        user_id,
        wait.as_millis()
    ))
}

struct Holder {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Slot {
    holder: Mutex<Option<Holder>>,
    released: Notify,
}

enum Attempt {
    Acquired(LockLease),
    Busy { expires_at: Instant },
}

/// In-process locker. Enough when a single instance serves all users.
pub struct MemoryLocker {
    slots: Mutex<HashMap<UserId, Arc<Slot>>>,
    wait: Duration,
    lease: Duration,
}

impl MemoryLocker {
    pub fn new(wait: Duration, lease: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            wait,
            lease,
        }
    }

    fn slot(&self, user_id: UserId) -> Arc<Slot> {
        self.slots.lock().entry(user_id).or_default().clone()
    }

    fn try_take(&self, slot: &Slot, user_id: UserId) -> Attempt {
        let mut holder = slot.holder.lock();
        let now = Instant::now();

        if let Some(current) = holder.as_ref() {
            if current.expires_at > now {
                return Attempt::Busy {
                    expires_at: current.expires_at,
                };
            }
            log::warn!(
                "Lock lease for user {} expired without release, taking over",
                user_id
            );
        }

        let lease = LockLease::new(user_id, self.lease);
        *holder = Some(Holder {
            token: lease.token.clone(),
            expires_at: now + self.lease,
        });
        Attempt::Acquired(lease)
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn acquire(&self, user_id: UserId) -> Result<LockLease, AppError> {
        let slot = self.slot(user_id);
        let deadline = Instant::now() + self.wait;

        loop {
            // Register interest before looking, so a release in between is not missed.
            let released = slot.released.notified();

            let expires_at = match self.try_take(&slot, user_id) {
                Attempt::Acquired(lease) => return Ok(lease),
                Attempt::Busy { expires_at } => expires_at,
            };

            if Instant::now() >= deadline {
                log::warn!("Lock wait timed out for user {}", user_id);
                return Err(unavailable(user_id, self.wait));
            }

            tokio::select! {
                _ = released => {}
                _ = tokio::time::sleep_until(deadline.min(expires_at)) => {}
            }
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), AppError> {
        let slot = self.slot(lease.user_id);
        {
            let mut holder = slot.holder.lock();
            match holder.as_ref() {
                Some(current) if current.token == lease.token => *holder = None,
                _ => {
                    log::debug!(
                        "Ignoring release of stale lease for user {}",
                        lease.user_id
                    );
                    return Ok(());
                }
            }
        }
        slot.released.notify_waiters();
        Ok(())
    }
}

/// Locker backed by the `queue_locks` table. Every instance sharing the
/// database sees the same locks.
pub struct SqliteLocker {
    pool: Pool<Sqlite>,
    wait: Duration,
    lease: Duration,
}

impl SqliteLocker {
    pub fn new(pool: Pool<Sqlite>, wait: Duration, lease: Duration) -> Self {
        Self { pool, wait, lease }
    }

    async fn try_take(&self, lease: &LockLease) -> Result<bool, AppError> {
        let now = now_millis();
        let expires_at = now + self.lease.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO queue_locks (user_id, token, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                token = excluded.token,
                expires_at = excluded.expires_at
            WHERE queue_locks.expires_at <= ?
            "#,
        )
        .bind(lease.user_id)
        .bind(&lease.token)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl Locker for SqliteLocker {
    async fn acquire(&self, user_id: UserId) -> Result<LockLease, AppError> {
        let deadline = Instant::now() + self.wait;

        loop {
            let lease = LockLease::new(user_id, self.lease);
            if self.try_take(&lease).await? {
                return Ok(lease);
            }

            if Instant::now() >= deadline {
                log::warn!("Shared lock wait timed out for user {}", user_id);
                return Err(unavailable(user_id, self.wait));
            }
            tokio::time::sleep(SQLITE_POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM queue_locks WHERE user_id = ? AND token = ?")
            .bind(lease.user_id)
            .bind(&lease.token)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            log::debug!(
                "Ignoring release of stale lease for user {}",
                lease.user_id
            );
        }
        Ok(())
    }
}
