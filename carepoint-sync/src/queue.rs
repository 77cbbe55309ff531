//! Durable change queue: every local mutation becomes an ordered,
//! independently-retriable unit of work.
//!
//! Entries are never reordered. A push batch processes them strictly in
//! ascending sequence, and multiple entries may exist for the same entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::entity::EntityKind;
use crate::error::{SyncError, SyncResult};
use crate::store::LocalStore;

/// Operation type of a queued change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => Err(SyncError::InvalidOperation(format!(
                "Unknown operation type: {}",
                s
            ))),
        }
    }
}

/// Lifecycle status of a queue entry.
///
/// `pending → in_flight` at push start; terminal states are `synced`
/// (pruned after the retention window), `conflict` (linked to a conflict
/// record, out of the retry pool), and `failed` (eligible for explicit
/// retry, which resets it to `pending`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InFlight,
    Synced,
    Conflict,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InFlight => "in_flight",
            QueueStatus::Synced => "synced",
            QueueStatus::Conflict => "conflict",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "in_flight" => Ok(QueueStatus::InFlight),
            "synced" => Ok(QueueStatus::Synced),
            "conflict" => Ok(QueueStatus::Conflict),
            "failed" => Ok(QueueStatus::Failed),
            _ => Err(SyncError::InvalidOperation(format!(
                "Unknown queue status: {}",
                s
            ))),
        }
    }
}

/// One durable intention to mutate a remote entity.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Auto-incrementing id; defines submission order.
    pub sequence: i64,
    pub kind: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    /// Post-mutation snapshot (JSON null for a delete).
    pub payload: serde_json::Value,
    /// Pre-mutation snapshot, used for diffing/merge on the remote side.
    pub prior_payload: Option<serde_json::Value>,
    /// Cache record version at time of write.
    pub client_version: i64,
    pub client_timestamp: DateTime<Utc>,
    pub status: QueueStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    /// Set when status is `conflict`; links to the conflict log.
    pub conflict_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append a queue entry inside the caller's transaction, so a cache write
/// and its queue entry commit or roll back together.
pub(crate) async fn insert_entry(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    entity_id: &str,
    operation: Operation,
    payload: &serde_json::Value,
    prior_payload: Option<&serde_json::Value>,
    client_version: i64,
    now: DateTime<Utc>,
) -> SyncResult<()> {
    sqlx::query(
        r#"
        INSERT INTO change_queue (
            entity_type, entity_id, operation, payload, prior_payload,
            client_version, client_timestamp, status, retry_count, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?)
        "#,
    )
    .bind(kind.as_str())
    .bind(entity_id)
    .bind(operation.as_str())
    .bind(payload.to_string())
    .bind(prior_payload.map(|p| p.to_string()))
    .bind(client_version)
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(conn)
    .await?;

    tracing::debug!(
        entity_type = %kind,
        entity_id = entity_id,
        operation = ?operation,
        "Queued local change"
    );

    Ok(())
}

fn parse_timestamp(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::Internal(format!("Invalid timestamp: {}", e)))
}

fn entry_from_row(row: &SqliteRow) -> SyncResult<QueueEntry> {
    let kind: String = row.try_get("entity_type")?;
    let operation: String = row.try_get("operation")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("payload")?;
    let prior_payload: Option<String> = row.try_get("prior_payload")?;
    let client_timestamp: String = row.try_get("client_timestamp")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(QueueEntry {
        sequence: row.try_get("sequence")?,
        kind: EntityKind::from_str(&kind)?,
        entity_id: row.try_get("entity_id")?,
        operation: Operation::from_str(&operation)?,
        payload: serde_json::from_str(&payload)?,
        prior_payload: prior_payload
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        client_version: row.try_get("client_version")?,
        client_timestamp: parse_timestamp(&client_timestamp)?,
        status: QueueStatus::from_str(&status)?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        conflict_id: row.try_get("conflict_id")?,
        created_at: parse_timestamp(&created_at)?,
    })
}

impl LocalStore {
    /// Claim the push batch for this cycle: mark every pending entry
    /// `in_flight` in one statement, then read back all `in_flight` entries
    /// in sequence order. Entries left `in_flight` by an interrupted cycle
    /// are picked up again here rather than trusted as already sent.
    pub async fn claim_for_push(&self) -> SyncResult<Vec<QueueEntry>> {
        sqlx::query("UPDATE change_queue SET status = 'in_flight' WHERE status = 'pending'")
            .execute(self.pool())
            .await?;

        let rows = sqlx::query(
            "SELECT * FROM change_queue WHERE status = 'in_flight' ORDER BY sequence ASC",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Entries awaiting the next push, in sequence order.
    pub async fn pending_entries(&self) -> SyncResult<Vec<QueueEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM change_queue WHERE status = 'pending' ORDER BY sequence ASC",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Entries that failed their last push, in sequence order.
    pub async fn failed_entries(&self) -> SyncResult<Vec<QueueEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM change_queue WHERE status = 'failed' ORDER BY sequence ASC",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// All entries regardless of status, in sequence order.
    pub async fn all_entries(&self) -> SyncResult<Vec<QueueEntry>> {
        let rows = sqlx::query("SELECT * FROM change_queue ORDER BY sequence ASC")
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn pending_count(&self) -> SyncResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM change_queue WHERE status = 'pending'")
            .fetch_one(self.pool())
            .await?;

        Ok(row.try_get("n")?)
    }

    pub(crate) async fn mark_entry_synced(&self, sequence: i64) -> SyncResult<()> {
        sqlx::query("UPDATE change_queue SET status = 'synced' WHERE sequence = ?")
            .bind(sequence)
            .execute(self.pool())
            .await?;

        tracing::debug!(sequence, "Queue entry settled as synced");

        Ok(())
    }

    pub(crate) async fn mark_entry_conflict(
        &self,
        sequence: i64,
        conflict_id: &str,
    ) -> SyncResult<()> {
        sqlx::query(
            "UPDATE change_queue SET status = 'conflict', conflict_id = ? WHERE sequence = ?",
        )
        .bind(conflict_id)
        .bind(sequence)
        .execute(self.pool())
        .await?;

        tracing::debug!(sequence, conflict_id, "Queue entry settled as conflict");

        Ok(())
    }

    pub(crate) async fn mark_entry_failed(&self, sequence: i64, error: &str) -> SyncResult<()> {
        sqlx::query(
            r#"
            UPDATE change_queue
            SET status = 'failed',
                retry_count = retry_count + 1,
                last_error = ?
            WHERE sequence = ?
            "#,
        )
        .bind(error)
        .bind(sequence)
        .execute(self.pool())
        .await?;

        tracing::warn!(sequence, error, "Queue entry failed");

        Ok(())
    }

    /// Reset every failed entry to pending. Returns the number of entries
    /// made eligible again. Retries happen only through this explicit
    /// action; the engine never retries failed entries on its own.
    pub async fn retry_failed(&self) -> SyncResult<u64> {
        let result = sqlx::query(
            "UPDATE change_queue SET status = 'pending' WHERE status = 'failed'",
        )
        .execute(self.pool())
        .await?;

        let retried = result.rows_affected();
        if retried > 0 {
            tracing::info!(retried, "Failed queue entries reset to pending");
        }

        Ok(retried)
    }

    /// Remove the settled entry that produced a conflict, once resolved.
    pub(crate) async fn delete_entry_for_conflict(&self, conflict_id: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM change_queue WHERE conflict_id = ?")
            .bind(conflict_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Delete synced entries older than the cutoff. Never touches conflict
    /// or failed entries.
    pub async fn prune_synced(&self, older_than: DateTime<Utc>) -> SyncResult<u64> {
        let result = sqlx::query(
            "DELETE FROM change_queue WHERE status = 'synced' AND created_at < ?",
        )
        .bind(older_than.to_rfc3339())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }
}
