//! Real-time catalog synchronization.
//!
//! Push events are filtered by scope, deduplicated, then reconciled into the
//! cache. When an event cannot be applied incrementally, or a lifecycle
//! trigger fires, the snapshot fetcher reloads whole collections. All of it
//! runs on the single task started by [`spawn`].

pub mod dedup;
pub mod engine;
pub mod fetcher;
pub mod handle;
pub mod reconciler;
pub mod scope;

pub use dedup::EventDeduplicator;
pub use engine::{spawn, SyncDeps, SyncSettings};
pub use fetcher::{SnapshotFetcher, SnapshotSource, SnapshotTarget};
pub use handle::{
    CacheChanged, CatalogView, ChangeReason, EngineStopped, Notices, Subscription, SyncHandle,
    SyncNotice, SyncStatus,
};
pub use reconciler::Trigger;
pub use scope::{ConfigScopeStore, MemoryScopeStore, ScopeStore};
