//! Offline-first data synchronization engine for the CarePoint clinical
//! client.
//!
//! Keeps a local cache of domain records usable while disconnected and
//! reconciles locally-made changes with the authoritative remote store once
//! connectivity returns. Domain payloads are opaque JSON; the remote surface
//! is exactly two operations, push and pull.
//!
//! Provides:
//! - Durable, ordered change queue for offline mutations
//! - Push/pull cycles with per-change verdicts and a pull checkpoint
//! - Conflict log with explicit client/server/merged resolution
//! - Derived status snapshots over a watch channel

pub mod cache;
pub mod conflict;
pub mod entity;
pub mod error;
pub mod manager;
pub mod queue;
pub mod store;
pub mod transport;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use tokio::sync::watch;

pub use cache::{CacheAccessor, CachedRecord};
pub use conflict::{ConflictRecord, Resolution};
pub use entity::EntityKind;
pub use error::{SyncError, SyncResult};
pub use manager::{CycleOutcome, CycleReport, SyncConfig, SyncManager, REJECT_REASON};
pub use queue::{Operation, QueueEntry, QueueStatus};
pub use store::{LocalStore, StoreConfig};
pub use transport::{HttpTransport, RemoteTransport};
pub use trigger::{SyncScheduler, SyncStatus};

/// The assembled engine: local store, cache accessor, sync manager, and
/// interval scheduler.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    cache: CacheAccessor,
    manager: Arc<SyncManager>,
    _scheduler: SyncScheduler,
}

impl SyncEngine {
    /// Open the local store and start the interval scheduler. The engine
    /// starts offline; connectivity is reported via [`SyncEngine::set_online`].
    pub async fn new(
        store_config: StoreConfig,
        sync_config: SyncConfig,
        transport: Arc<dyn RemoteTransport>,
    ) -> SyncResult<Self> {
        let store = Arc::new(LocalStore::open(store_config).await?);
        let interval = sync_config.sync_interval;
        let manager = Arc::new(SyncManager::new(store.clone(), transport, sync_config));
        let scheduler = SyncScheduler::spawn(manager.clone(), interval);

        Ok(Self {
            cache: CacheAccessor::new(store.clone()),
            store,
            manager,
            _scheduler: scheduler,
        })
    }

    /// The only read/write path for cached entities.
    pub fn cache(&self) -> &CacheAccessor {
        &self.cache
    }

    /// Stable per-installation identity included in every push and pull.
    pub async fn client_id(&self) -> SyncResult<String> {
        self.store.client_id().await
    }

    /// Run one cycle now, or get the rejection if a cycle is already
    /// running or the client is offline.
    pub async fn sync_now(&self) -> CycleOutcome {
        self.manager.sync_now().await
    }

    /// Update the connectivity belief. A transition to online starts a
    /// cycle immediately in the background.
    pub async fn set_online(&self, online: bool) {
        let went_online = self.manager.set_online(online).await;
        if went_online {
            let manager = self.manager.clone();
            tokio::spawn(async move {
                manager.sync_now().await;
            });
        }
    }

    /// Observe status snapshots.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.manager.subscribe()
    }

    /// The current status, derived from local state.
    pub async fn status(&self) -> SyncResult<SyncStatus> {
        self.manager.current_status().await
    }

    /// The report of the most recent completed cycle.
    pub async fn last_report(&self) -> Option<CycleReport> {
        self.manager.last_report().await
    }

    /// All unresolved conflicts awaiting resolution.
    pub async fn unresolved_conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        self.store.unresolved_conflicts().await
    }

    /// Resolve a conflict and clear its queue entry.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> SyncResult<()> {
        self.store.resolve_conflict(conflict_id, resolution).await?;
        self.manager.publish_status().await;

        Ok(())
    }

    /// Reset failed queue entries to pending so the next cycle retries them.
    pub async fn retry_failed(&self) -> SyncResult<u64> {
        let retried = self.store.retry_failed().await?;
        self.manager.publish_status().await;

        Ok(retried)
    }

    /// Entries that failed their last push.
    pub async fn failed_entries(&self) -> SyncResult<Vec<QueueEntry>> {
        self.store.failed_entries().await
    }

    /// Reclaim space after retention pruning.
    pub async fn vacuum(&self) -> SyncResult<()> {
        self.store.vacuum().await
    }
}
