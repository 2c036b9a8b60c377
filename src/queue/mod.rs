pub mod cache;
pub mod lock;
pub mod models;
pub mod service;
pub mod snapshot;
pub mod store;

pub use cache::{CacheTicket, MemorySnapshotCache, SnapshotCache, SqliteSnapshotCache};
pub use lock::{LockLease, Locker, MemoryLocker, SqliteLocker};
pub use models::{
    EntryState, MutationResult, MutationStatus, Queue, QueueEntryView, QueueSnapshot,
    QueueTrackEntry, SnapshotEntry,
};
pub use service::QueueMutationService;
pub use snapshot::SnapshotReader;
pub use store::{QueueStore, StoreStats};
