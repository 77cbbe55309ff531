//! Local sqlite store backing the cache, change queue, and conflict log.
//!
//! Provides:
//! - One cache table per entity kind
//! - Durable change queue for offline mutations
//! - Conflict log
//! - Key/value metadata (client identity, sync checkpoint)

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::entity::EntityKind;
use crate::error::{SyncError, SyncResult};

pub(crate) const META_CLIENT_ID: &str = "client_id";
pub(crate) const META_CHECKPOINT: &str = "checkpoint";
pub(crate) const META_LAST_SYNC_AT: &str = "last_sync_at";

/// Configuration for the local store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the database file.
    pub db_path: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Whether to enable WAL mode.
    pub enable_wal: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "carepoint_local.db".to_string(),
            max_connections: 5,
            enable_wal: true,
        }
    }
}

/// Local database handle.
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Open (or create) the local database and initialize its schema.
    pub async fn open(config: StoreConfig) -> SyncResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        // WAL mode for better concurrency between cache reads and sync writes
        if config.enable_wal {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&pool)
                .await?;
        }

        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

        let store = Self { pool };
        store.initialize_schema().await?;

        tracing::debug!(db_path = %config.db_path, "Opened local store");

        Ok(store)
    }

    /// Initialize database schema.
    async fn initialize_schema(&self) -> SyncResult<()> {
        for kind in EntityKind::ALL {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    last_synced_at INTEGER NOT NULL DEFAULT 0,
                    tombstoned INTEGER NOT NULL DEFAULT 0
                )
                "#,
                kind.cache_table()
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_queue (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                prior_payload TEXT,
                client_version INTEGER NOT NULL,
                client_timestamp TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                conflict_id TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_change_queue_status ON change_queue(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_change_queue_entity ON change_queue(entity_type, entity_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_change_queue_created ON change_queue(created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conflict_log (
                conflict_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                client_payload TEXT NOT NULL,
                server_payload TEXT,
                divergent_fields TEXT NOT NULL,
                detected_at TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_conflict_resolved ON conflict_log(resolved)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conflict_entity ON conflict_log(entity_type, entity_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Read a metadata value.
    pub async fn metadata(&self, key: &str) -> SyncResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM sync_metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    /// Write a metadata value.
    pub async fn set_metadata(&self, key: &str, value: &str) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stable per-installation identity, minted on first use.
    pub async fn client_id(&self) -> SyncResult<String> {
        if let Some(id) = self.metadata(META_CLIENT_ID).await? {
            return Ok(id);
        }

        // INSERT OR IGNORE so two racing callers settle on one identity
        sqlx::query(
            "INSERT OR IGNORE INTO sync_metadata (key, value, updated_at) VALUES (?, ?, ?)",
        )
        .bind(META_CLIENT_ID)
        .bind(Uuid::new_v4().to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.metadata(META_CLIENT_ID).await?.ok_or_else(|| {
            SyncError::Internal("client identity missing after mint".to_string())
        })
    }

    /// Logical time of the last fully-applied pull page, 0 if never pulled.
    pub async fn checkpoint(&self) -> SyncResult<i64> {
        match self.metadata(META_CHECKPOINT).await? {
            Some(value) => value.parse::<i64>().map_err(|e| {
                SyncError::Internal(format!("Invalid checkpoint value: {}", e))
            }),
            None => Ok(0),
        }
    }

    /// Wall-clock time of the last successful cycle, if any.
    pub async fn last_sync_at(&self) -> SyncResult<Option<DateTime<Utc>>> {
        match self.metadata(META_LAST_SYNC_AT).await? {
            Some(value) => {
                let parsed = DateTime::parse_from_rfc3339(&value)
                    .map_err(|e| SyncError::Internal(format!("Invalid timestamp: {}", e)))?;
                Ok(Some(parsed.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    /// Vacuum the database to reclaim space after retention pruning.
    pub async fn vacuum(&self) -> SyncResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the database connection.
    pub async fn close(self) -> SyncResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Write a metadata value inside an open transaction.
pub(crate) async fn write_metadata(
    conn: &mut SqliteConnection,
    key: &str,
    value: &str,
) -> SyncResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_metadata (key, value, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now().to_rfc3339())
    .execute(conn)
    .await?;

    Ok(())
}
