//! Shared test doubles and fixtures.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, Semaphore};

use crate::error::{SyncError, SyncResult};
use crate::manager::{SyncConfig, SyncManager};
use crate::store::{LocalStore, StoreConfig};
use crate::transport::{
    PullRequest, PullResponse, PushRequest, PushResponse, RemoteTransport, Verdict, VerdictStatus,
};

/// Store config over a fresh temp file. The file handle must outlive the
/// store.
pub(crate) fn temp_store_config() -> (StoreConfig, NamedTempFile) {
    let file = NamedTempFile::new().expect("temp file");
    let config = StoreConfig {
        db_path: file.path().to_string_lossy().into_owned(),
        ..StoreConfig::default()
    };

    (config, file)
}

pub(crate) async fn temp_store() -> (Arc<LocalStore>, NamedTempFile) {
    let (config, file) = temp_store_config();
    let store = LocalStore::open(config).await.expect("open store");

    (Arc::new(store), file)
}

pub(crate) fn test_config() -> SyncConfig {
    SyncConfig {
        facility_id: "fac-1".to_string(),
        device_name: "test-client".to_string(),
        device_type: "test".to_string(),
        ..SyncConfig::default()
    }
}

/// An online manager over a fresh store and the given transport.
pub(crate) async fn test_manager(
    transport: Arc<MockTransport>,
) -> (Arc<SyncManager>, Arc<LocalStore>, NamedTempFile) {
    let (store, file) = temp_store().await;
    let manager = Arc::new(SyncManager::new(store.clone(), transport, test_config()));
    manager.set_online(true).await;

    (manager, store, file)
}

/// Scripted remote. Unscripted pushes sync every change; unscripted pulls
/// return nothing new. An optional gate holds push calls open so tests can
/// observe an in-flight cycle.
pub(crate) struct MockTransport {
    push_results: Mutex<VecDeque<SyncResult<PushResponse>>>,
    pull_results: Mutex<VecDeque<SyncResult<PullResponse>>>,
    push_seen: Mutex<Vec<PushRequest>>,
    pull_seen: Mutex<Vec<PullRequest>>,
    push_gate: Option<Arc<Semaphore>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            push_results: Mutex::new(VecDeque::new()),
            pull_results: Mutex::new(VecDeque::new()),
            push_seen: Mutex::new(Vec::new()),
            pull_seen: Mutex::new(Vec::new()),
            push_gate: None,
        }
    }

    pub(crate) fn with_push_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.push_gate = Some(gate);
        self
    }

    pub(crate) async fn expect_push(&self, result: SyncResult<PushResponse>) {
        self.push_results.lock().await.push_back(result);
    }

    pub(crate) async fn expect_pull(&self, result: SyncResult<PullResponse>) {
        self.pull_results.lock().await.push_back(result);
    }

    pub(crate) async fn push_requests(&self) -> Vec<PushRequest> {
        self.push_seen.lock().await.clone()
    }

    pub(crate) async fn pull_requests(&self) -> Vec<PullRequest> {
        self.pull_seen.lock().await.clone()
    }

    pub(crate) async fn push_count(&self) -> usize {
        self.push_seen.lock().await.len()
    }

    pub(crate) async fn pull_count(&self) -> usize {
        self.pull_seen.lock().await.len()
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn push(&self, request: PushRequest) -> SyncResult<PushResponse> {
        self.push_seen.lock().await.push(request.clone());

        if let Some(gate) = &self.push_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| SyncError::Transport("push gate closed".to_string()))?;
            permit.forget();
        }

        match self.push_results.lock().await.pop_front() {
            Some(result) => result,
            None => Ok(PushResponse {
                results: request
                    .changes
                    .iter()
                    .map(|_| Verdict {
                        status: VerdictStatus::Synced,
                        conflict_id: None,
                        server_payload: None,
                    })
                    .collect(),
            }),
        }
    }

    async fn pull(&self, request: PullRequest) -> SyncResult<PullResponse> {
        self.pull_seen.lock().await.push(request);

        match self.pull_results.lock().await.pop_front() {
            Some(result) => result,
            None => Ok(PullResponse {
                changes: vec![],
                has_more: false,
            }),
        }
    }
}
