//! Sync cycle orchestration.
//!
//! One cycle drains the change queue to the remote (push), applies remote
//! changes since the last checkpoint (pull), advances the checkpoint, and
//! prunes settled queue entries. An atomic flag guarantees at most one cycle
//! runs at a time regardless of trigger source; a start request while a
//! cycle is running or while offline is rejected, never queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::cache;
use crate::conflict::{self, ConflictRecord};
use crate::error::{SyncError, SyncResult};
use crate::queue::{Operation, QueueEntry};
use crate::store::{self, LocalStore};
use crate::transport::{
    ChangeUpload, PullRequest, PushRequest, RemoteChange, RemoteTransport, Verdict, VerdictStatus,
};
use crate::trigger::SyncStatus;

/// Rejection reason reported when a cycle cannot start.
pub const REJECT_REASON: &str = "already-syncing-or-offline";

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Facility this client belongs to; sent with every push and pull.
    pub facility_id: String,
    /// Human-readable device name, for change attribution on the remote.
    pub device_name: String,
    /// Device class (e.g. "desktop", "tablet").
    pub device_type: String,
    /// How long settled (synced) queue entries are retained, in days.
    pub retention_days: i64,
    /// Interval between timer-triggered cycles while online.
    pub sync_interval: std::time::Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            facility_id: "default".to_string(),
            device_name: "carepoint-client".to_string(),
            device_type: "desktop".to_string(),
            retention_days: 7,
            sync_interval: std::time::Duration::from_secs(300),
        }
    }
}

/// Counts and errors from one completed cycle.
///
/// `success` is false only for unrecoverable failures (transport or local
/// storage); entries landing in `conflict` or `failed` are expected,
/// recoverable states and do not fail the cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub success: bool,
    pub pushed: usize,
    pub pulled: usize,
    pub conflicts: usize,
    pub errors: Vec<String>,
}

/// Outcome of a cycle request.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// A cycle ran to completion, successfully or not.
    Completed(CycleReport),
    /// The request was rejected up front.
    Rejected { reason: &'static str },
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            CycleOutcome::Completed(report) => report.success,
            CycleOutcome::Rejected { .. } => false,
        }
    }

    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleOutcome::Completed(report) => Some(report),
            CycleOutcome::Rejected { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            CycleOutcome::Completed(_) => None,
            CycleOutcome::Rejected { reason } => Some(reason),
        }
    }
}

/// Releases the cycle flag on every exit path.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Orchestrates sync cycles against the remote.
pub struct SyncManager {
    store: Arc<LocalStore>,
    transport: Arc<dyn RemoteTransport>,
    config: SyncConfig,
    syncing: AtomicBool,
    online: AtomicBool,
    last_report: Mutex<Option<CycleReport>>,
    status_tx: watch::Sender<SyncStatus>,
}

impl SyncManager {
    pub fn new(
        store: Arc<LocalStore>,
        transport: Arc<dyn RemoteTransport>,
        config: SyncConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::default());

        Self {
            store,
            transport,
            config,
            syncing: AtomicBool::new(false),
            online: AtomicBool::new(false),
            last_report: Mutex::new(None),
            status_tx,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Update the connectivity belief. Returns true on a transition to
    /// online, which is the trigger layer's cue to start a cycle.
    pub async fn set_online(&self, online: bool) -> bool {
        let was = self.online.swap(online, Ordering::AcqRel);
        if was != online {
            tracing::info!(online, "Connectivity changed");
            self.publish_status().await;
        }

        online && !was
    }

    /// Observe status snapshots. A fresh snapshot is published on every
    /// state-changing step: cycle start, cycle end, connectivity change,
    /// conflict resolution, retry.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Derive the current status from local state.
    pub async fn current_status(&self) -> SyncResult<SyncStatus> {
        Ok(SyncStatus {
            is_online: self.is_online(),
            is_syncing: self.is_syncing(),
            pending_count: self.store.pending_count().await?,
            conflict_count: self.store.conflict_count().await?,
            last_sync_at: self.store.last_sync_at().await?,
        })
    }

    /// The report of the most recent completed cycle.
    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.lock().await.clone()
    }

    pub(crate) async fn publish_status(&self) {
        match self.current_status().await {
            Ok(status) => {
                self.status_tx.send_replace(status);
            }
            Err(e) => tracing::warn!(error = %e, "Could not publish status snapshot"),
        }
    }

    /// Run one cycle: push, pull, checkpoint, retention.
    ///
    /// The cycle itself never fails: each phase records its errors in the
    /// report so one bad phase cannot block the other, or future cycles.
    /// Callers that need the next result after a rejection should await the
    /// status stream instead of retrying blindly.
    pub async fn sync_now(&self) -> CycleOutcome {
        if !self.is_online() {
            tracing::debug!("Sync requested while offline");
            return CycleOutcome::Rejected {
                reason: REJECT_REASON,
            };
        }

        // Atomic check-and-set: exactly one caller wins the flag.
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sync requested while a cycle is running");
            return CycleOutcome::Rejected {
                reason: REJECT_REASON,
            };
        }
        let guard = FlagGuard(&self.syncing);

        self.publish_status().await;

        let mut report = CycleReport {
            success: true,
            ..CycleReport::default()
        };

        match self.store.client_id().await {
            Ok(client_id) => {
                self.push_phase(&client_id, &mut report).await;
                self.pull_phase(&client_id, &mut report).await;
            }
            Err(e) => {
                report.success = false;
                report.errors.push(format!("client identity: {}", e));
            }
        }

        self.retention_phase(&mut report).await;

        if report.success {
            if let Err(e) = self
                .store
                .set_metadata(store::META_LAST_SYNC_AT, &Utc::now().to_rfc3339())
                .await
            {
                report.errors.push(format!("record sync time: {}", e));
            }
        }

        tracing::info!(
            success = report.success,
            pushed = report.pushed,
            pulled = report.pulled,
            conflicts = report.conflicts,
            "Sync cycle finished"
        );

        *self.last_report.lock().await = Some(report.clone());

        drop(guard);
        self.publish_status().await;

        CycleOutcome::Completed(report)
    }

    async fn push_phase(&self, client_id: &str, report: &mut CycleReport) {
        let entries = match self.store.claim_for_push().await {
            Ok(entries) => entries,
            Err(e) => {
                report.success = false;
                report.errors.push(format!("push claim: {}", e));
                return;
            }
        };

        if entries.is_empty() {
            tracing::debug!("Push phase: queue empty");
            return;
        }

        let changes = entries
            .iter()
            .map(|entry| ChangeUpload {
                entity_type: entry.kind,
                entity_id: entry.entity_id.clone(),
                operation: entry.operation,
                client_version: entry.client_version,
                client_timestamp: entry.client_timestamp,
                payload: entry.payload.clone(),
                prior_payload: entry.prior_payload.clone(),
            })
            .collect();

        let request = PushRequest {
            facility_id: self.config.facility_id.clone(),
            client_id: client_id.to_string(),
            device_name: self.config.device_name.clone(),
            device_type: self.config.device_type.clone(),
            changes,
        };

        tracing::debug!(batch = entries.len(), "Push phase: submitting batch");

        let response = match self.transport.push(request).await {
            Ok(response) => response,
            Err(e) => {
                // No entry stays in_flight after a failed call.
                let message = e.to_string();
                for entry in &entries {
                    if let Err(mark_err) =
                        self.store.mark_entry_failed(entry.sequence, &message).await
                    {
                        report
                            .errors
                            .push(format!("entry {}: {}", entry.sequence, mark_err));
                    }
                }
                report.success = false;
                report.errors.push(format!("push transport: {}", message));
                return;
            }
        };

        for (index, entry) in entries.iter().enumerate() {
            let applied = match response.results.get(index) {
                Some(verdict) => self.apply_verdict(entry, verdict, report).await,
                None => {
                    report
                        .errors
                        .push(format!("entry {}: no verdict returned", entry.sequence));
                    self.store
                        .mark_entry_failed(entry.sequence, "no verdict returned")
                        .await
                }
            };

            if let Err(e) = applied {
                report.success = false;
                report.errors.push(format!("entry {}: {}", entry.sequence, e));
            }
        }
    }

    async fn apply_verdict(
        &self,
        entry: &QueueEntry,
        verdict: &Verdict,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        match verdict.status {
            VerdictStatus::Synced => {
                self.store.mark_entry_synced(entry.sequence).await?;
                if entry.operation == Operation::Delete {
                    // Delete confirmed; the tombstone has done its job.
                    self.store.purge_record(entry.kind, &entry.entity_id).await?;
                } else {
                    self.store
                        .mark_record_synced(
                            entry.kind,
                            &entry.entity_id,
                            Utc::now().timestamp_millis(),
                        )
                        .await?;
                }
                report.pushed += 1;
            }
            VerdictStatus::Conflict => {
                let conflict_id = verdict
                    .conflict_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());

                self.store
                    .mark_entry_conflict(entry.sequence, &conflict_id)
                    .await?;

                let divergent_fields = verdict
                    .server_payload
                    .as_ref()
                    .map(|server| conflict::divergent_fields(&entry.payload, server))
                    .unwrap_or_default();

                self.store
                    .record_conflict(&ConflictRecord {
                        conflict_id,
                        kind: entry.kind,
                        entity_id: entry.entity_id.clone(),
                        client_payload: entry.payload.clone(),
                        server_payload: verdict.server_payload.clone(),
                        divergent_fields,
                        detected_at: Utc::now(),
                        resolved: false,
                    })
                    .await?;

                report.conflicts += 1;
            }
            VerdictStatus::Rejected => {
                self.store
                    .mark_entry_failed(entry.sequence, "rejected by remote")
                    .await?;
                report
                    .errors
                    .push(format!("entry {}: rejected by remote", entry.sequence));
            }
        }

        Ok(())
    }

    async fn pull_phase(&self, client_id: &str, report: &mut CycleReport) {
        let mut checkpoint = match self.store.checkpoint().await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                report.success = false;
                report.errors.push(format!("pull checkpoint: {}", e));
                return;
            }
        };

        loop {
            let request = PullRequest {
                facility_id: self.config.facility_id.clone(),
                client_id: client_id.to_string(),
                since: checkpoint,
            };

            let response = match self.transport.pull(request).await {
                Ok(response) => response,
                Err(e) => {
                    report.success = false;
                    report.errors.push(format!("pull transport: {}", e));
                    return;
                }
            };

            if response.changes.is_empty() {
                if response.has_more {
                    report.success = false;
                    report
                        .errors
                        .push("pull: remote reported more pages without returning changes".to_string());
                }
                return;
            }

            let page_max = response
                .changes
                .iter()
                .map(|change| change.timestamp)
                .max()
                .unwrap_or(checkpoint);
            let next_checkpoint = checkpoint.max(page_max);

            match self.apply_pull_page(&response.changes, next_checkpoint).await {
                Ok(applied) => {
                    report.pulled += applied;
                    tracing::debug!(applied, checkpoint = next_checkpoint, "Pull page applied");
                }
                Err(e) => {
                    report.success = false;
                    report.errors.push(format!("pull apply: {}", e));
                    return;
                }
            }

            if !response.has_more {
                return;
            }
            if next_checkpoint == checkpoint {
                // A page that does not advance the cursor would request
                // itself forever.
                report.success = false;
                report
                    .errors
                    .push("pull: page did not advance the checkpoint".to_string());
                return;
            }
            checkpoint = next_checkpoint;
        }
    }

    /// Apply one pull page and advance the checkpoint, atomically. A crash
    /// mid-page advances nothing; the page is re-pulled next cycle.
    async fn apply_pull_page(
        &self,
        changes: &[RemoteChange],
        checkpoint: i64,
    ) -> SyncResult<usize> {
        let mut tx = self.store.pool().begin().await?;

        for change in changes {
            match change.operation {
                Operation::Delete => {
                    cache::apply_remote_delete(
                        &mut tx,
                        change.entity_type,
                        &change.entity_id,
                        change.timestamp,
                    )
                    .await?;
                }
                Operation::Create | Operation::Update => {
                    let payload = change.payload.as_ref().ok_or_else(|| {
                        SyncError::InvalidPayload(format!(
                            "pull change for {} {} has no payload",
                            change.entity_type, change.entity_id
                        ))
                    })?;
                    cache::apply_remote_upsert(
                        &mut tx,
                        change.entity_type,
                        &change.entity_id,
                        payload,
                        change.timestamp,
                    )
                    .await?;
                }
            }
        }

        store::write_metadata(&mut tx, store::META_CHECKPOINT, &checkpoint.to_string()).await?;

        tx.commit().await?;

        Ok(changes.len())
    }

    async fn retention_phase(&self, report: &mut CycleReport) {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);

        match self.store.prune_synced(cutoff).await {
            Ok(pruned) if pruned > 0 => {
                tracing::debug!(pruned, "Pruned settled queue entries");
            }
            Ok(_) => {}
            // Housekeeping only; the next cycle will prune again.
            Err(e) => report.errors.push(format!("retention: {}", e)),
        }
    }
}
