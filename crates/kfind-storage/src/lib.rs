use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kfind_core::{CacheSlot, CacheSnapshot, ContractError};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::RwLock;

pub const CACHE_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("storage task failed: {0}")]
    Task(String),
}

impl From<ContractError> for StorageError {
    fn from(err: ContractError) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Persisted slot for cache snapshots, single writer per slot.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self, slot: &CacheSlot) -> Result<Option<CacheSnapshot>, StorageError>;
    async fn save(&self, slot: &CacheSlot, snapshot: &CacheSnapshot) -> Result<(), StorageError>;
    async fn clear(&self, slot: &CacheSlot) -> Result<bool, StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshotInfo {
    pub extension_version: String,
    pub entry_count: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SqliteCacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCacheStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        self.with_conn(schema_version)
    }

    pub fn snapshot_info(&self, slot: &CacheSlot) -> Result<Option<StoredSnapshotInfo>, StorageError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "
                    SELECT extension_version, entry_count, updated_at
                    FROM kernel_cache_snapshots
                    WHERE cache_key = ?1 AND server_id = ?2 AND base_url = ?3
                    ",
                    params![
                        slot.cache_key,
                        slot.server.server_id(),
                        slot.server.base_url()
                    ],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(extension_version, entry_count, updated_at)| {
                Ok(StoredSnapshotInfo {
                    extension_version,
                    entry_count: usize::try_from(entry_count).unwrap_or_default(),
                    updated_at: parse_ts(&updated_at)?,
                })
            })
            .transpose()
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::Task("sqlite connection lock poisoned".to_string()))?;
        f(&conn)
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|err| StorageError::Task(err.to_string()))?
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn load(&self, slot: &CacheSlot) -> Result<Option<CacheSnapshot>, StorageError> {
        let slot = slot.clone();
        let payload = self
            .run_blocking(move |conn| {
                Ok(conn
                    .query_row(
                        "
                        SELECT payload_json
                        FROM kernel_cache_snapshots
                        WHERE cache_key = ?1 AND server_id = ?2 AND base_url = ?3
                        ",
                        params![
                            slot.cache_key,
                            slot.server.server_id(),
                            slot.server.base_url()
                        ],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?)
            })
            .await?;

        payload
            .map(|raw| CacheSnapshot::from_json(&raw).map_err(StorageError::from))
            .transpose()
    }

    async fn save(&self, slot: &CacheSlot, snapshot: &CacheSnapshot) -> Result<(), StorageError> {
        let slot = slot.clone();
        let payload_json = snapshot.to_json()?;
        let extension_version = snapshot.extension_version.clone();
        let entry_count = snapshot.connections.len() as i64;
        let updated_at = Utc::now().to_rfc3339();

        self.run_blocking(move |conn| {
            conn.execute(
                "
                INSERT INTO kernel_cache_snapshots (
                    cache_key,
                    server_id,
                    base_url,
                    extension_version,
                    payload_json,
                    updated_at,
                    entry_count
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(cache_key, server_id, base_url) DO UPDATE SET
                    extension_version = excluded.extension_version,
                    payload_json = excluded.payload_json,
                    updated_at = excluded.updated_at,
                    entry_count = excluded.entry_count
                ",
                params![
                    slot.cache_key,
                    slot.server.server_id(),
                    slot.server.base_url(),
                    extension_version,
                    payload_json,
                    updated_at,
                    entry_count
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear(&self, slot: &CacheSlot) -> Result<bool, StorageError> {
        let slot = slot.clone();
        self.run_blocking(move |conn| {
            let changes = conn.execute(
                "
                DELETE FROM kernel_cache_snapshots
                WHERE cache_key = ?1 AND server_id = ?2 AND base_url = ?3
                ",
                params![
                    slot.cache_key,
                    slot.server.server_id(),
                    slot.server.base_url()
                ],
            )?;
            Ok(changes > 0)
        })
        .await
    }
}

fn schema_version(conn: &Connection) -> Result<i64, StorageError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> Result<(), StorageError> {
    let mut current = schema_version(conn)?;
    if current > CACHE_SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: current,
            supported: CACHE_SCHEMA_VERSION,
        });
    }

    if current < 1 {
        let sql = include_str!("../migrations/0001_kernel_cache.sql");
        conn.execute_batch(sql)?;
        conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        current = 1;
    }

    if current < 2 {
        let sql = include_str!("../migrations/0002_snapshot_entry_count.sql");
        conn.execute_batch(sql)?;
        conn.execute("PRAGMA user_version = 2", []).map(|_| ())?;
    }

    Ok(())
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

/// Keeps encoded snapshots in memory; payloads still go through JSON so a
/// reload behaves like the SQLite store.
#[derive(Default)]
pub struct MemoryCacheStore {
    slots: RwLock<HashMap<CacheSlot, String>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn load(&self, slot: &CacheSlot) -> Result<Option<CacheSnapshot>, StorageError> {
        let slots = self.slots.read().await;
        slots
            .get(slot)
            .map(|raw| CacheSnapshot::from_json(raw).map_err(StorageError::from))
            .transpose()
    }

    async fn save(&self, slot: &CacheSlot, snapshot: &CacheSnapshot) -> Result<(), StorageError> {
        let raw = snapshot.to_json()?;
        self.slots.write().await.insert(slot.clone(), raw);
        Ok(())
    }

    async fn clear(&self, slot: &CacheSlot) -> Result<bool, StorageError> {
        Ok(self.slots.write().await.remove(slot).is_some())
    }
}
