//! Persistence for the per-phase sync cursors

use crate::busy::with_busy_retry;
use crate::models::{sql_height, BlockHeight};
use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

/// One of the four sync phase cursors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressKey {
    /// Highest height stored in the block cache
    Downloaded,
    /// Highest height scanned for wallet notes
    Scanned,
    /// Highest height whose wallet transactions were enhanced
    Enhanced,
    /// Highest height for which transparent UTXOs were fetched
    UtxoFetched,
}

impl ProgressKey {
    /// Every cursor
    pub const ALL: [ProgressKey; 4] = [
        ProgressKey::Downloaded,
        ProgressKey::Scanned,
        ProgressKey::Enhanced,
        ProgressKey::UtxoFetched,
    ];

    /// Stable storage key
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloaded => "latest_downloaded_height",
            Self::Scanned => "latest_scanned_height",
            Self::Enhanced => "latest_enhanced_height",
            Self::UtxoFetched => "latest_utxo_fetched_height",
        }
    }
}

/// Key/value persistence for sync cursors. Missing cursors read as zero.
pub trait ProgressStore: Send + Sync {
    /// Read one cursor
    fn load(&self, key: ProgressKey) -> Result<BlockHeight>;
    /// Write several cursors in one atomic step
    fn store_all(&self, values: &[(ProgressKey, BlockHeight)]) -> Result<()>;
    /// Write one cursor
    fn store(&self, key: ProgressKey, height: BlockHeight) -> Result<()> {
        self.store_all(&[(key, height)])
    }
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sync_progress (
        alias TEXT NOT NULL,
        key TEXT NOT NULL,
        height INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (alias, key)
    );";

/// SQLite-backed cursors; `alias` separates several wallets in one file
pub struct SqliteProgressStore {
    conn: Mutex<Connection>,
    alias: String,
}

impl SqliteProgressStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>, alias: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn, alias)
    }

    /// In-memory store
    pub fn open_in_memory(alias: impl Into<String>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, alias)
    }

    fn from_connection(conn: Connection, alias: impl Into<String>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            alias: alias.into(),
        })
    }

    /// Wallet alias this store reads and writes
    pub fn alias(&self) -> &str {
        &self.alias
    }
}

impl ProgressStore for SqliteProgressStore {
    fn load(&self, key: ProgressKey) -> Result<BlockHeight> {
        let conn = self.conn.lock();
        let height: Option<i64> = conn
            .query_row(
                "SELECT height FROM sync_progress WHERE alias = ?1 AND key = ?2",
                params![self.alias, key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(height.map(|h| h as u64).unwrap_or(0))
    }

    fn store_all(&self, values: &[(ProgressKey, BlockHeight)]) -> Result<()> {
        let mut conn = self.conn.lock();
        let updated_at = chrono::Utc::now().to_rfc3339();
        with_busy_retry(|| {
            let tx = conn.transaction()?;
            for (key, height) in values {
                tx.execute(
                    "INSERT OR REPLACE INTO sync_progress (alias, key, height, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![self.alias, key.as_str(), sql_height(*height)?, updated_at],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }
}

/// Volatile cursors, for tests and throwaway sessions
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    values: Mutex<HashMap<ProgressKey, BlockHeight>>,
}

impl MemoryProgressStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn load(&self, key: ProgressKey) -> Result<BlockHeight> {
        Ok(self.values.lock().get(&key).copied().unwrap_or(0))
    }

    fn store_all(&self, values: &[(ProgressKey, BlockHeight)]) -> Result<()> {
        let mut map = self.values.lock();
        for (key, height) in values {
            map.insert(*key, *height);
        }
        Ok(())
    }
}
