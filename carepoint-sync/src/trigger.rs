//! Cycle scheduling and status publication.
//!
//! Decides when cycles run; performs no sync logic itself. Status is
//! derived from local state on every publication, never stored.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::manager::{CycleOutcome, SyncManager};

/// A point-in-time view of the engine, published to observers on every
/// state-changing step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    /// Queue entries awaiting push.
    pub pending_count: i64,
    /// Unresolved conflicts awaiting an explicit resolution.
    pub conflict_count: i64,
    /// Wall-clock time of the last successful cycle.
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Interval trigger: runs a cycle on a fixed period while the client is
/// online and no cycle is already running.
pub struct SyncScheduler {
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    pub fn spawn(manager: Arc<SyncManager>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of a tokio interval fires immediately; the
            // schedule starts one full period out.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if !manager.is_online() || manager.is_syncing() {
                    continue;
                }

                if let CycleOutcome::Completed(report) = manager.sync_now().await {
                    tracing::debug!(
                        success = report.success,
                        pushed = report.pushed,
                        pulled = report.pulled,
                        "Scheduled cycle finished"
                    );
                }
            }
        });

        Self { handle }
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheAccessor;
    use crate::entity::EntityKind;
    use crate::testing::{test_manager, MockTransport};
    use serde_json::json;

    /// Poll until the mock has seen at least `count` pulls.
    async fn wait_for_pulls(transport: &MockTransport, count: usize) {
        for _ in 0..500 {
            if transport.pull_count().await >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} pulls", count);
    }

    #[tokio::test]
    async fn timer_runs_cycles_while_online() {
        let transport = Arc::new(MockTransport::new());
        let (manager, _store, _file) = test_manager(transport.clone()).await;

        let _scheduler = SyncScheduler::spawn(manager, Duration::from_millis(20));

        wait_for_pulls(&transport, 2).await;
    }

    #[tokio::test]
    async fn timer_is_inert_while_offline() {
        let transport = Arc::new(MockTransport::new());
        let (manager, _store, _file) = test_manager(transport.clone()).await;
        manager.set_online(false).await;

        let _scheduler = SyncScheduler::spawn(manager, Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.pull_count().await, 0);
    }

    #[tokio::test]
    async fn dropping_the_scheduler_stops_the_timer() {
        let transport = Arc::new(MockTransport::new());
        let (manager, _store, _file) = test_manager(transport.clone()).await;

        let scheduler = SyncScheduler::spawn(manager, Duration::from_millis(20));
        wait_for_pulls(&transport, 1).await;

        drop(scheduler);
        // Let any cycle that was mid-run at abort time settle.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = transport.pull_count().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.pull_count().await, settled);
    }

    #[tokio::test]
    async fn status_snapshots_track_state_changes() {
        let transport = Arc::new(MockTransport::new());
        let (manager, store, _file) = test_manager(transport.clone()).await;
        let cache = CacheAccessor::new(store.clone());
        let mut status_rx = manager.subscribe();

        manager.set_online(false).await;
        assert!(!status_rx.borrow_and_update().is_online);

        cache
            .write(EntityKind::Patient, json!({"id": "p1"}), true)
            .await
            .unwrap();

        manager.set_online(true).await;
        {
            let status = status_rx.borrow_and_update();
            assert!(status.is_online);
            assert_eq!(status.pending_count, 1);
            assert!(status.last_sync_at.is_none());
        }

        manager.sync_now().await;
        let status = status_rx.borrow_and_update();
        assert!(!status.is_syncing);
        assert_eq!(status.pending_count, 0);
        assert!(status.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn status_is_derived_not_stored() {
        let transport = Arc::new(MockTransport::new());
        let (manager, store, _file) = test_manager(transport.clone()).await;
        let cache = CacheAccessor::new(store.clone());

        cache
            .write(EntityKind::Patient, json!({"id": "p1"}), true)
            .await
            .unwrap();
        cache
            .write(EntityKind::Order, json!({"id": "o1"}), true)
            .await
            .unwrap();

        let status = manager.current_status().await.unwrap();
        assert_eq!(status.pending_count, 2);
        assert_eq!(status.conflict_count, 0);
        assert!(status.is_online);
        assert!(!status.is_syncing);
    }
}
