//! Cached records and the cache accessor.
//!
//! The accessor is the only path by which domain code reads or writes cached
//! entities. Every write updates the cache row and appends a change-queue
//! entry in the same transaction, so a queued change can never be lost
//! independently of the cache state it describes.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::entity::EntityKind;
use crate::error::{SyncError, SyncResult};
use crate::queue::{self, Operation};
use crate::store::LocalStore;

/// The client's last-known view of one remote entity.
#[derive(Debug, Clone)]
pub struct CachedRecord {
    /// Primary key; matches the remote identity.
    pub id: String,
    pub kind: EntityKind,
    /// Opaque domain document.
    pub payload: Value,
    /// Monotonic marker assigned at last write, in epoch milliseconds.
    pub version: i64,
    /// Last confirmed server agreement, 0 if never synced.
    pub last_synced_at: i64,
    /// Marked deleted but retained until the remote confirms the delete.
    pub tombstoned: bool,
}

fn record_from_row(kind: EntityKind, row: &SqliteRow) -> SyncResult<CachedRecord> {
    let payload: String = row.try_get("payload")?;
    let tombstoned: i64 = row.try_get("tombstoned")?;

    Ok(CachedRecord {
        id: row.try_get("id")?,
        kind,
        payload: serde_json::from_str(&payload)?,
        version: row.try_get("version")?,
        last_synced_at: row.try_get("last_synced_at")?,
        tombstoned: tombstoned != 0,
    })
}

impl LocalStore {
    /// Fetch one cached record, tombstoned or not.
    pub async fn record(&self, kind: EntityKind, id: &str) -> SyncResult<Option<CachedRecord>> {
        let row = sqlx::query(&format!(
            "SELECT * FROM {} WHERE id = ?",
            kind.cache_table()
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(row) => Ok(Some(record_from_row(kind, &row)?)),
            None => Ok(None),
        }
    }

    /// Advance a record's last confirmed server agreement.
    pub(crate) async fn mark_record_synced(
        &self,
        kind: EntityKind,
        id: &str,
        at_ms: i64,
    ) -> SyncResult<()> {
        sqlx::query(&format!(
            "UPDATE {} SET last_synced_at = ? WHERE id = ?",
            kind.cache_table()
        ))
        .bind(at_ms)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Physically delete a tombstoned record once the remote has confirmed
    /// the delete.
    pub(crate) async fn purge_record(&self, kind: EntityKind, id: &str) -> SyncResult<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ? AND tombstoned = 1",
            kind.cache_table()
        ))
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}

/// Upsert a record from a remote change or a conflict resolution. Version
/// and last sync marker both come from the change's logical time; any
/// tombstone is cleared.
pub(crate) async fn apply_remote_upsert(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &str,
    payload: &Value,
    timestamp_ms: i64,
) -> SyncResult<()> {
    sqlx::query(&format!(
        r#"
        INSERT INTO {} (id, payload, version, last_synced_at, tombstoned)
        VALUES (?, ?, ?, ?, 0)
        ON CONFLICT(id) DO UPDATE SET
            payload = excluded.payload,
            version = excluded.version,
            last_synced_at = excluded.last_synced_at,
            tombstoned = 0
        "#,
        kind.cache_table()
    ))
    .bind(id)
    .bind(payload.to_string())
    .bind(timestamp_ms)
    .bind(timestamp_ms)
    .execute(conn)
    .await?;

    Ok(())
}

/// Tombstone a record from a remote delete. A record is created if absent,
/// so a later resurrection of the entity is detectable.
pub(crate) async fn apply_remote_delete(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &str,
    timestamp_ms: i64,
) -> SyncResult<()> {
    sqlx::query(&format!(
        r#"
        INSERT INTO {} (id, payload, version, last_synced_at, tombstoned)
        VALUES (?, 'null', ?, ?, 1)
        ON CONFLICT(id) DO UPDATE SET
            version = excluded.version,
            last_synced_at = excluded.last_synced_at,
            tombstoned = 1
        "#,
        kind.cache_table()
    ))
    .bind(id)
    .bind(timestamp_ms)
    .bind(timestamp_ms)
    .execute(conn)
    .await?;

    Ok(())
}

/// CRUD façade over the local store.
///
/// Reads serve the rest of the application from the cache alone; writes
/// atomically update the cache and append to the change queue. No method
/// here performs a network call.
#[derive(Clone)]
pub struct CacheAccessor {
    store: Arc<LocalStore>,
}

impl CacheAccessor {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Fetch one entity's payload. Absent and tombstoned records both read
    /// as `None`.
    pub async fn get(&self, kind: EntityKind, id: &str) -> SyncResult<Option<Value>> {
        let record = self.store.record(kind, id).await?;

        Ok(record.filter(|r| !r.tombstoned).map(|r| r.payload))
    }

    /// All non-tombstoned payloads of one kind.
    pub async fn list(&self, kind: EntityKind) -> SyncResult<Vec<Value>> {
        self.list_filtered(kind, |_| true).await
    }

    /// Non-tombstoned payloads of one kind, filtered in-process. No server
    /// round trip.
    pub async fn list_filtered<F>(&self, kind: EntityKind, predicate: F) -> SyncResult<Vec<Value>>
    where
        F: Fn(&Value) -> bool,
    {
        let rows = sqlx::query(&format!(
            "SELECT payload FROM {} WHERE tombstoned = 0 ORDER BY id ASC",
            kind.cache_table()
        ))
        .fetch_all(self.store.pool())
        .await?;

        let mut payloads = Vec::new();
        for row in rows {
            let raw: String = row.try_get("payload")?;
            let payload: Value = serde_json::from_str(&raw)?;
            if predicate(&payload) {
                payloads.push(payload);
            }
        }

        Ok(payloads)
    }

    /// Write an entity: upsert the cache row with a fresh version and append
    /// a create/update entry to the change queue, in one transaction.
    ///
    /// The entity id is read from the payload's top-level `"id"` key.
    pub async fn write(&self, kind: EntityKind, payload: Value, is_new: bool) -> SyncResult<Value> {
        let id = entity_id(&payload)?;
        let now = Utc::now();
        let version = now.timestamp_millis();

        let mut tx = self.store.pool().begin().await?;

        let prior: Option<Value> = {
            let row = sqlx::query(&format!(
                "SELECT payload FROM {} WHERE id = ?",
                kind.cache_table()
            ))
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?;

            match row {
                Some(row) => {
                    let raw: String = row.try_get("payload")?;
                    Some(serde_json::from_str(&raw)?)
                }
                None => None,
            }
        };

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, payload, version, last_synced_at, tombstoned)
            VALUES (?, ?, ?, 0, 0)
            ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                version = excluded.version,
                tombstoned = 0
            "#,
            kind.cache_table()
        ))
        .bind(&id)
        .bind(payload.to_string())
        .bind(version)
        .execute(&mut *tx)
        .await?;

        let operation = if is_new {
            Operation::Create
        } else {
            Operation::Update
        };
        queue::insert_entry(
            &mut tx,
            kind,
            &id,
            operation,
            &payload,
            prior.as_ref(),
            version,
            now,
        )
        .await?;

        tx.commit().await?;

        Ok(payload)
    }

    /// Tombstone an entity and queue its delete. Returns `false` if the
    /// record is absent or already tombstoned; no queue entry is added then.
    pub async fn remove(&self, kind: EntityKind, id: &str) -> SyncResult<bool> {
        let now = Utc::now();
        let version = now.timestamp_millis();

        let mut tx = self.store.pool().begin().await?;

        let row = sqlx::query(&format!(
            "SELECT payload, tombstoned FROM {} WHERE id = ?",
            kind.cache_table()
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let prior: Value = match row {
            None => return Ok(false),
            Some(row) => {
                let tombstoned: i64 = row.try_get("tombstoned")?;
                if tombstoned != 0 {
                    return Ok(false);
                }
                let raw: String = row.try_get("payload")?;
                serde_json::from_str(&raw)?
            }
        };

        sqlx::query(&format!(
            "UPDATE {} SET tombstoned = 1, version = ? WHERE id = ?",
            kind.cache_table()
        ))
        .bind(version)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        queue::insert_entry(
            &mut tx,
            kind,
            id,
            Operation::Delete,
            &Value::Null,
            Some(&prior),
            version,
            now,
        )
        .await?;

        tx.commit().await?;

        Ok(true)
    }
}

fn entity_id(payload: &Value) -> SyncResult<String> {
    payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            SyncError::InvalidPayload("payload is missing a string \"id\" field".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStatus;
    use crate::testing::temp_store;
    use serde_json::json;

    fn accessor(store: &Arc<LocalStore>) -> CacheAccessor {
        CacheAccessor::new(store.clone())
    }

    #[tokio::test]
    async fn write_updates_cache_and_queues_exactly_one_entry() {
        let (store, _file) = temp_store().await;
        let cache = accessor(&store);

        cache
            .write(EntityKind::Patient, json!({"id": "p1", "name": "A"}), true)
            .await
            .unwrap();

        let cached = cache.get(EntityKind::Patient, "p1").await.unwrap().unwrap();
        assert_eq!(cached["name"], "A");

        let entries = store.pending_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, Operation::Create);
        assert_eq!(entries[0].entity_id, "p1");
        assert!(entries[0].prior_payload.is_none());
        assert_eq!(entries[0].status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn update_carries_prior_payload() {
        let (store, _file) = temp_store().await;
        let cache = accessor(&store);

        cache
            .write(EntityKind::Patient, json!({"id": "p1", "name": "A"}), true)
            .await
            .unwrap();
        cache
            .write(EntityKind::Patient, json!({"id": "p1", "name": "B"}), false)
            .await
            .unwrap();

        let entries = store.pending_entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].operation, Operation::Update);
        assert_eq!(entries[1].prior_payload.as_ref().unwrap()["name"], "A");

        let cached = cache.get(EntityKind::Patient, "p1").await.unwrap().unwrap();
        assert_eq!(cached["name"], "B");
    }

    #[tokio::test]
    async fn write_without_id_is_rejected() {
        let (store, _file) = temp_store().await;
        let cache = accessor(&store);

        let err = cache
            .write(EntityKind::Order, json!({"name": "no id"}), true)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPayload(_)));

        // Nothing was queued for the rejected write.
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_tombstones_and_queues_delete() {
        let (store, _file) = temp_store().await;
        let cache = accessor(&store);

        cache
            .write(EntityKind::Patient, json!({"id": "p1", "name": "A"}), true)
            .await
            .unwrap();

        assert!(cache.remove(EntityKind::Patient, "p1").await.unwrap());

        // Tombstoned records read as absent but stay in the store.
        assert!(cache.get(EntityKind::Patient, "p1").await.unwrap().is_none());
        let record = store.record(EntityKind::Patient, "p1").await.unwrap().unwrap();
        assert!(record.tombstoned);

        let entries = store.pending_entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].operation, Operation::Delete);
        assert_eq!(entries[1].payload, Value::Null);
        assert_eq!(entries[1].prior_payload.as_ref().unwrap()["name"], "A");
    }

    #[tokio::test]
    async fn remove_of_absent_or_tombstoned_record_is_false() {
        let (store, _file) = temp_store().await;
        let cache = accessor(&store);

        assert!(!cache.remove(EntityKind::Patient, "ghost").await.unwrap());

        cache
            .write(EntityKind::Patient, json!({"id": "p1"}), true)
            .await
            .unwrap();
        assert!(cache.remove(EntityKind::Patient, "p1").await.unwrap());
        assert!(!cache.remove(EntityKind::Patient, "p1").await.unwrap());

        // Only the create and the first delete were queued.
        assert_eq!(store.pending_entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn list_filters_tombstones_and_applies_predicate() {
        let (store, _file) = temp_store().await;
        let cache = accessor(&store);

        cache
            .write(EntityKind::Patient, json!({"id": "p1", "ward": "east"}), true)
            .await
            .unwrap();
        cache
            .write(EntityKind::Patient, json!({"id": "p2", "ward": "west"}), true)
            .await
            .unwrap();
        cache
            .write(EntityKind::Patient, json!({"id": "p3", "ward": "east"}), true)
            .await
            .unwrap();
        cache.remove(EntityKind::Patient, "p3").await.unwrap();

        let all = cache.list(EntityKind::Patient).await.unwrap();
        assert_eq!(all.len(), 2);

        let east = cache
            .list_filtered(EntityKind::Patient, |p| p["ward"] == "east")
            .await
            .unwrap();
        assert_eq!(east.len(), 1);
        assert_eq!(east[0]["id"], "p1");
    }

    #[tokio::test]
    async fn kinds_do_not_share_a_namespace() {
        let (store, _file) = temp_store().await;
        let cache = accessor(&store);

        cache
            .write(EntityKind::Patient, json!({"id": "x1"}), true)
            .await
            .unwrap();

        assert!(cache.get(EntityKind::Order, "x1").await.unwrap().is_none());
        assert_eq!(cache.list(EntityKind::Order).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn remote_upsert_and_delete_are_idempotent() {
        let (store, _file) = temp_store().await;

        let mut tx = store.pool().begin().await.unwrap();
        apply_remote_upsert(&mut tx, EntityKind::Patient, "p1", &json!({"v": 1}), 100)
            .await
            .unwrap();
        apply_remote_upsert(&mut tx, EntityKind::Patient, "p1", &json!({"v": 1}), 100)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let record = store.record(EntityKind::Patient, "p1").await.unwrap().unwrap();
        assert_eq!(record.version, 100);
        assert_eq!(record.last_synced_at, 100);

        let mut tx = store.pool().begin().await.unwrap();
        apply_remote_delete(&mut tx, EntityKind::Patient, "p1", 200)
            .await
            .unwrap();
        apply_remote_delete(&mut tx, EntityKind::Patient, "p1", 200)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let record = store.record(EntityKind::Patient, "p1").await.unwrap().unwrap();
        assert!(record.tombstoned);
        assert_eq!(record.last_synced_at, 200);
    }
}
