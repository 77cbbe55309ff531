//! Conflict log: detected divergences between a local change and the
//! server's current state, and their explicit resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::cache;
use crate::entity::EntityKind;
use crate::error::{SyncError, SyncResult};
use crate::store::LocalStore;

/// A detected divergence for one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: String,
    pub kind: EntityKind,
    pub entity_id: String,
    /// The losing local change as submitted.
    pub client_payload: Value,
    /// The server's state at detection time; absent until a pull supplies it.
    pub server_payload: Option<Value>,
    /// Top-level keys whose values differ between the two payloads.
    pub divergent_fields: Vec<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
}

/// How to resolve a conflict.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Keep the local change as the new authoritative local state.
    Client,
    /// Adopt the server's state.
    Server,
    /// Adopt a caller-supplied merge of the two.
    Merged(Value),
}

/// Top-level keys whose values differ between two JSON documents.
/// Non-object payloads contribute no keys.
pub fn divergent_fields(client: &Value, server: &Value) -> Vec<String> {
    let empty = serde_json::Map::new();
    let client = client.as_object().unwrap_or(&empty);
    let server = server.as_object().unwrap_or(&empty);

    let mut fields: Vec<String> = client
        .iter()
        .filter(|(key, value)| server.get(*key) != Some(value))
        .map(|(key, _)| key.clone())
        .chain(
            server
                .keys()
                .filter(|key| !client.contains_key(*key))
                .cloned(),
        )
        .collect();
    fields.sort();
    fields.dedup();

    fields
}

fn conflict_from_row(row: &SqliteRow) -> SyncResult<ConflictRecord> {
    let kind: String = row.try_get("entity_type")?;
    let client_payload: String = row.try_get("client_payload")?;
    let server_payload: Option<String> = row.try_get("server_payload")?;
    let divergent: String = row.try_get("divergent_fields")?;
    let detected_at: String = row.try_get("detected_at")?;
    let resolved: i64 = row.try_get("resolved")?;

    Ok(ConflictRecord {
        conflict_id: row.try_get("conflict_id")?,
        kind: EntityKind::from_str(&kind)?,
        entity_id: row.try_get("entity_id")?,
        client_payload: serde_json::from_str(&client_payload)?,
        server_payload: server_payload
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        divergent_fields: serde_json::from_str(&divergent)?,
        detected_at: DateTime::parse_from_rfc3339(&detected_at)
            .map_err(|e| SyncError::Internal(format!("Invalid timestamp: {}", e)))?
            .with_timezone(&Utc),
        resolved: resolved != 0,
    })
}

impl LocalStore {
    /// Record a detected conflict. Any unresolved conflict already logged
    /// for the same entity is superseded, keeping at most one unresolved
    /// conflict per entity.
    pub async fn record_conflict(&self, record: &ConflictRecord) -> SyncResult<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "DELETE FROM conflict_log WHERE entity_type = ? AND entity_id = ? AND resolved = 0",
        )
        .bind(record.kind.as_str())
        .bind(&record.entity_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO conflict_log (
                conflict_id, entity_type, entity_id, client_payload,
                server_payload, divergent_fields, detected_at, resolved
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&record.conflict_id)
        .bind(record.kind.as_str())
        .bind(&record.entity_id)
        .bind(record.client_payload.to_string())
        .bind(record.server_payload.as_ref().map(|p| p.to_string()))
        .bind(serde_json::to_string(&record.divergent_fields)?)
        .bind(record.detected_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            conflict_id = %record.conflict_id,
            entity_type = %record.kind,
            entity_id = %record.entity_id,
            "Conflict recorded"
        );

        Ok(())
    }

    /// Fetch one conflict by id.
    pub async fn conflict(&self, conflict_id: &str) -> SyncResult<Option<ConflictRecord>> {
        let row = sqlx::query("SELECT * FROM conflict_log WHERE conflict_id = ?")
            .bind(conflict_id)
            .fetch_optional(self.pool())
            .await?;

        match row {
            Some(row) => Ok(Some(conflict_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// All unresolved conflicts, oldest first.
    pub async fn unresolved_conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM conflict_log WHERE resolved = 0 ORDER BY detected_at ASC",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(conflict_from_row).collect()
    }

    pub async fn conflict_count(&self) -> SyncResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM conflict_log WHERE resolved = 0")
            .fetch_one(self.pool())
            .await?;

        Ok(row.try_get("n")?)
    }

    /// Resolve a conflict: overwrite the cached record with the chosen
    /// payload, mark the conflict resolved, and delete the originating
    /// queue entry so it is not retried. One transaction.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> SyncResult<()> {
        let conflict = self
            .conflict(conflict_id)
            .await?
            .filter(|c| !c.resolved)
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;

        let payload = match resolution {
            Resolution::Client => conflict.client_payload.clone(),
            Resolution::Server => conflict.server_payload.clone().ok_or_else(|| {
                SyncError::Resolution(format!(
                    "server payload not yet known for conflict {}",
                    conflict_id
                ))
            })?,
            Resolution::Merged(merged) => merged,
        };

        let now_ms = Utc::now().timestamp_millis();
        let mut tx = self.pool().begin().await?;

        cache::apply_remote_upsert(&mut tx, conflict.kind, &conflict.entity_id, &payload, now_ms)
            .await?;

        sqlx::query("UPDATE conflict_log SET resolved = 1 WHERE conflict_id = ?")
            .bind(conflict_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM change_queue WHERE conflict_id = ?")
            .bind(conflict_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            conflict_id,
            entity_type = %conflict.kind,
            entity_id = %conflict.entity_id,
            "Conflict resolved"
        );

        Ok(())
    }
}
