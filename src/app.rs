use sqlx::{Pool, Sqlite};
use std::sync::Arc;

use crate::auth::{Authenticator, SqliteTokenAuthenticator};
use crate::catalog::{Catalog, SqliteCatalog};
use crate::config::{AppConfig, Coordination};
use crate::queue::{
    Locker, MemoryLocker, MemorySnapshotCache, QueueMutationService, QueueStore, SnapshotCache,
    SnapshotReader, SqliteLocker, SqliteSnapshotCache,
};
use crate::realtime::{Broadcaster, Gateway};

/// Everything a request handler or background job needs, wired once at startup.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<QueueStore>,
    pub catalog: Arc<dyn Catalog>,
    pub cache: Arc<dyn SnapshotCache>,
    pub reader: Arc<SnapshotReader>,
    pub broadcaster: Arc<Broadcaster>,
    pub queue: Arc<QueueMutationService>,
    pub gateway: Arc<Gateway>,
    pub auth: Arc<dyn Authenticator>,
}

impl Services {
    pub fn build(pool: Pool<Sqlite>, config: &AppConfig) -> Self {
        let (locker, cache): (Arc<dyn Locker>, Arc<dyn SnapshotCache>) = match config.coordination
        {
            Coordination::Memory => (
                Arc::new(MemoryLocker::new(config.lock_wait(), config.lock_lease())),
                Arc::new(MemorySnapshotCache::new()),
            ),
            Coordination::Sqlite => (
                Arc::new(SqliteLocker::new(
                    pool.clone(),
                    config.lock_wait(),
                    config.lock_lease(),
                )),
                Arc::new(SqliteSnapshotCache::new(pool.clone())),
            ),
        };
        log::info!("Queue coordination: {:?}", config.coordination);

        let store = Arc::new(QueueStore::new(pool.clone()));
        let catalog: Arc<dyn Catalog> = Arc::new(SqliteCatalog::new(pool.clone()));
        let reader = Arc::new(SnapshotReader::new(
            store.clone(),
            catalog.clone(),
            cache.clone(),
            config.cache_ttl(),
            config.empty_cache_ttl(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            reader.clone(),
            config.connection_send_buffer,
        ));
        let queue = Arc::new(QueueMutationService::new(
            store.clone(),
            catalog.clone(),
            locker,
            cache.clone(),
            reader.clone(),
            broadcaster.clone(),
            config.max_queue_tracks,
        ));
        let gateway = Arc::new(Gateway::new(broadcaster.clone(), reader.clone()));
        let auth: Arc<dyn Authenticator> = Arc::new(SqliteTokenAuthenticator::new(pool));

        Self {
            store,
            catalog,
            cache,
            reader,
            broadcaster,
            queue,
            gateway,
            auth,
        }
    }
}
