//! Periodic queue upkeep.
//!
//! Each run repairs every user's queues (duplicates, orphaned tracks, order
//! gaps, out-of-range `current_index`), purges tombstones past retention and
//! drops expired cache entries. A full run additionally wipes the cache and
//! tells every connected client to resync.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::app::Services;
use crate::config::AppConfig;
use crate::errors::AppError;
use crate::queue::models::now_millis;
use crate::queue::{QueueMutationService, QueueStore, SnapshotCache, StoreStats};
use crate::realtime::Broadcaster;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub users_checked: usize,
    pub users_repaired: usize,
    pub users_failed: usize,
    pub queues_dropped: usize,
    pub orphans_removed: u64,
    pub entries_renumbered: u64,
    pub indexes_clamped: u64,
    pub tombstones_purged: u64,
    pub cache_entries_dropped: u64,
    pub users_resynced: usize,
    pub stats: StoreStats,
    pub recommendations: Vec<String>,
}

pub struct MaintenanceJob {
    store: Arc<QueueStore>,
    queue: Arc<QueueMutationService>,
    cache: Arc<dyn SnapshotCache>,
    broadcaster: Arc<Broadcaster>,
    max_queues_per_user: usize,
    retention_days: i64,
    large_queue_threshold: usize,
}

impl MaintenanceJob {
    pub fn new(services: &Services, config: &AppConfig) -> Self {
        Self {
            store: services.store.clone(),
            queue: services.queue.clone(),
            cache: services.cache.clone(),
            broadcaster: services.broadcaster.clone(),
            max_queues_per_user: config.max_queues_per_user,
            retention_days: config.tombstone_retention_days,
            large_queue_threshold: config.large_queue_threshold,
        }
    }

    /// One maintenance pass. `full` also clears the whole cache and forces a
    /// resync on every user's connections.
    pub async fn run_once(&self, full: bool) -> Result<MaintenanceReport, AppError> {
        let mut report = MaintenanceReport::default();
        let users = self.store.users_with_queues().await?;
        report.users_checked = users.len();

        for user_id in &users {
            match self.queue.repair(*user_id, self.max_queues_per_user).await {
                Ok(outcome) => {
                    if outcome.changed() {
                        report.users_repaired += 1;
                    }
                    report.queues_dropped += outcome.queues_dropped;
                    report.orphans_removed += outcome.orphans_removed;
                    report.entries_renumbered += outcome.entries_renumbered;
                    report.indexes_clamped += outcome.indexes_clamped;
                }
                Err(e) => {
                    // A busy user is picked up on the next run.
                    log::warn!("[Maintenance] Skipping user {}: {}", user_id, e);
                    report.users_failed += 1;
                }
            }
        }

        let cutoff = now_millis() - self.retention_days * MILLIS_PER_DAY;
        report.tombstones_purged = self.store.purge_tombstones(cutoff).await?;

        let dropped = if full {
            self.cache.clear().await
        } else {
            self.cache.evict_expired().await
        };
        report.cache_entries_dropped = dropped.unwrap_or_else(|e| {
            log::warn!("[Maintenance] Cache cleanup failed: {}", e);
            0
        });

        if full {
            for user_id in &users {
                if self.broadcaster.subscriber_count(*user_id) == 0 {
                    continue;
                }
                match self.broadcaster.publish_sync(*user_id).await {
                    Ok(_) => report.users_resynced += 1,
                    Err(e) => log::warn!("[Maintenance] Resync of user {} failed: {}", user_id, e),
                }
            }
        }

        report.stats = self.store.stats(self.large_queue_threshold).await?;
        if report.stats.empty_queues > 0 {
            report.recommendations.push(format!(
                "{} queue(s) are empty",
                report.stats.empty_queues
            ));
        }
        if report.stats.large_queues > 0 {
            let note = format!(
                "{} queue(s) hold more than {} tracks",
                report.stats.large_queues, self.large_queue_threshold
            );
            log::warn!("[Maintenance] {}", note);
            report.recommendations.push(note);
        }

        log::info!(
            "[Maintenance] Checked {} user(s), repaired {}, purged {} tombstone(s); {} queue(s), {} active / {} deleted entries",
            report.users_checked,
            report.users_repaired,
            report.tombstones_purged,
            report.stats.queues,
            report.stats.active_entries,
            report.stats.tombstoned_entries
        );
        Ok(report)
    }

    /// Run now and then every `interval` until the task is dropped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once(false).await {
                    log::error!("[Maintenance] Run failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::{GroupKey, ServerMessage};
    use crate::test_support::{self, OTHER_USER_ID, USER_ID};

    #[tokio::test]
    async fn test_run_repairs_and_purges() {
        let db = test_support::seeded_database().await;
        let config = AppConfig::default();
        let services = Services::build(db.pool.clone(), &config);
        let store = &services.store;
        let now = now_millis();

        let mut tx = store.begin().await.unwrap();
        // Two queues for one user, the newest with an order gap and a
        // runaway current_index.
        let old = store.create_queue(&mut tx, USER_ID, now - 10_000).await.unwrap();
        store.insert_entry(&mut tx, old.id, 1, 0, now).await.unwrap();
        let newest = store.create_queue(&mut tx, USER_ID, now).await.unwrap();
        store.insert_entry(&mut tx, newest.id, 2, 0, now).await.unwrap();
        store.insert_entry(&mut tx, newest.id, 3, 5, now).await.unwrap();
        store.set_current_index(&mut tx, newest.id, 9, now).await.unwrap();

        // A tombstone well past retention for another user.
        let other = store.create_queue(&mut tx, OTHER_USER_ID, now).await.unwrap();
        let stale = store.insert_entry(&mut tx, other.id, 4, 0, 0).await.unwrap();
        store.tombstone_entry(&mut tx, stale.id, 0).await.unwrap();
        tx.commit().await.unwrap();

        let mut sub = services
            .broadcaster
            .subscribe(&GroupKey::for_user(USER_ID).unwrap());

        let job = MaintenanceJob::new(&services, &config);
        let report = job.run_once(false).await.unwrap();
        assert_eq!(report.users_checked, 2);
        assert_eq!(report.users_repaired, 1);
        assert_eq!(report.queues_dropped, 1);
        assert_eq!(report.entries_renumbered, 1);
        assert_eq!(report.indexes_clamped, 1);
        assert_eq!(report.tombstones_purged, 1);
        assert_eq!(report.stats.queues, 2);
        assert_eq!(report.stats.empty_queues, 1);

        match sub.receiver.recv().await {
            Some(ServerMessage::QueueSync { queue, .. }) => {
                assert_eq!(queue.track_ids(), vec![2, 3]);
                assert_eq!(queue.current_index, 1);
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // A second run has nothing left to fix.
        let report = job.run_once(false).await.unwrap();
        assert_eq!(report.users_repaired, 0);
        assert_eq!(report.tombstones_purged, 0);
    }

    #[tokio::test]
    async fn test_full_run_resyncs_connected_users() {
        let db = test_support::seeded_database().await;
        let config = AppConfig::default();
        let services = Services::build(db.pool.clone(), &config);
        services.queue.add_track(USER_ID, 1).await.unwrap();

        let mut sub = services
            .broadcaster
            .subscribe(&GroupKey::for_user(USER_ID).unwrap());
        let report = MaintenanceJob::new(&services, &config)
            .run_once(true)
            .await
            .unwrap();

        assert_eq!(report.users_resynced, 1);
        match sub.receiver.recv().await {
            Some(ServerMessage::QueueSync { queue, .. }) => assert_eq!(queue.track_ids(), vec![1]),
            other => panic!("unexpected frame: {:?}", other),
        }
        // The resync repopulated the cache.
        assert!(services.cache.get(USER_ID).await.unwrap().is_some());
    }
}
