//! Metadata index for the filesystem block cache

use crate::busy::with_busy_retry;
use crate::models::{sql_bound, sql_height, BlockHeight, BlockMeta, BlockRange, CompactBlock};
use crate::sqlite_cache::{bounds, meta_from_row};
use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Height-indexed block metadata kept next to the block files
pub trait BlockMetadataStore: Send + Sync {
    /// Create tables if missing
    fn initialize(&self) -> Result<()>;
    /// Insert or replace metadata for `blocks` in one transaction
    fn save(&self, blocks: &[CompactBlock]) -> Result<()>;
    /// Lowest and highest indexed heights
    fn bounds(&self) -> Result<Option<(BlockHeight, BlockHeight)>>;
    /// Hash indexed at `height`
    fn hash_at(&self, height: BlockHeight) -> Result<Option<Vec<u8>>>;
    /// Indexed metadata within `range`, ascending
    fn meta_range(&self, range: BlockRange) -> Result<Vec<(BlockHeight, BlockMeta)>>;
    /// Drop entries above `height`
    fn rewind(&self, height: BlockHeight) -> Result<()>;
    /// Drop entries at or below `height`
    fn prune(&self, height: BlockHeight) -> Result<()>;
    /// Drop everything and recreate the tables
    fn clear(&self) -> Result<()>;
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS compactblocks_meta (
        height INTEGER PRIMARY KEY,
        hash BLOB NOT NULL,
        prev_hash BLOB NOT NULL,
        time INTEGER NOT NULL,
        sapling_outputs INTEGER NOT NULL,
        orchard_actions INTEGER NOT NULL
    );";

/// SQLite implementation of [`BlockMetadataStore`]
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) the index database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory index
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }
}

impl BlockMetadataStore for SqliteMetadataStore {
    fn initialize(&self) -> Result<()> {
        self.conn.lock().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn save(&self, blocks: &[CompactBlock]) -> Result<()> {
        let mut conn = self.conn.lock();
        with_busy_retry(|| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO compactblocks_meta
                        (height, hash, prev_hash, time, sapling_outputs, orchard_actions)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for block in blocks {
                    stmt.execute(params![
                        sql_height(block.height)?,
                        block.meta.hash,
                        block.meta.prev_hash,
                        block.meta.time,
                        block.meta.sapling_outputs,
                        block.meta.orchard_actions,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn bounds(&self) -> Result<Option<(BlockHeight, BlockHeight)>> {
        let conn = self.conn.lock();
        Ok(bounds(&conn, "compactblocks_meta")?)
    }

    fn hash_at(&self, height: BlockHeight) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let hash = conn
            .query_row(
                "SELECT hash FROM compactblocks_meta WHERE height = ?1",
                params![sql_bound(height)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    fn meta_range(&self, range: BlockRange) -> Result<Vec<(BlockHeight, BlockMeta)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT height, hash, prev_hash, time, sapling_outputs, orchard_actions
             FROM compactblocks_meta WHERE height BETWEEN ?1 AND ?2 ORDER BY height ASC",
        )?;
        let rows = stmt.query_map(params![sql_bound(range.lower), sql_bound(range.upper)], |row| {
            Ok((row.get::<_, i64>(0)? as u64, meta_from_row(row, 1)?))
        })?;

        let mut metas = Vec::new();
        for row in rows {
            metas.push(row?);
        }
        Ok(metas)
    }

    fn rewind(&self, height: BlockHeight) -> Result<()> {
        let conn = self.conn.lock();
        with_busy_retry(|| {
            conn.execute(
                "DELETE FROM compactblocks_meta WHERE height > ?1",
                params![sql_bound(height)],
            )?;
            Ok(())
        })
    }

    fn prune(&self, height: BlockHeight) -> Result<()> {
        let conn = self.conn.lock();
        with_busy_retry(|| {
            conn.execute(
                "DELETE FROM compactblocks_meta WHERE height <= ?1",
                params![sql_bound(height)],
            )?;
            Ok(())
        })
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("DROP TABLE IF EXISTS compactblocks_meta;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}
