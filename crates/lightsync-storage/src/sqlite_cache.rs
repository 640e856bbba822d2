//! Table-backed block cache: one row per block.

use crate::block_cache::{check_append, BlockCache};
use crate::busy::with_busy_retry;
use crate::models::{sql_bound, sql_height, BlockHeight, BlockMeta, BlockRange, CompactBlock};
use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS compactblocks (
        height INTEGER PRIMARY KEY,
        hash BLOB NOT NULL,
        prev_hash BLOB NOT NULL,
        time INTEGER NOT NULL,
        sapling_outputs INTEGER NOT NULL,
        orchard_actions INTEGER NOT NULL,
        data BLOB NOT NULL
    );";

/// Block cache storing raw blocks and metadata in a single SQLite table
pub struct SqliteBlockCache {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteBlockCache {
    /// Open (or create) a cache database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let cache = Self {
            conn: Mutex::new(conn),
            path: Some(path),
        };
        cache.initialize()?;
        Ok(cache)
    }

    /// In-memory cache, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        let cache = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        cache.initialize()?;
        Ok(cache)
    }

    /// Database file, `None` for in-memory caches
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Read the five metadata columns starting at `offset`
pub(crate) fn meta_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<BlockMeta> {
    Ok(BlockMeta {
        hash: row.get(offset)?,
        prev_hash: row.get(offset + 1)?,
        time: row.get(offset + 2)?,
        sapling_outputs: row.get(offset + 3)?,
        orchard_actions: row.get(offset + 4)?,
    })
}

pub(crate) fn bounds(conn: &Connection, table: &str) -> rusqlite::Result<Option<(u64, u64)>> {
    let sql = format!("SELECT MIN(height), MAX(height) FROM {}", table);
    let (lower, upper): (Option<i64>, Option<i64>) =
        conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(lower.zip(upper).map(|(l, u)| (l as u64, u as u64)))
}

impl BlockCache for SqliteBlockCache {
    fn initialize(&self) -> Result<()> {
        self.conn.lock().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn append(&self, blocks: &[CompactBlock]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        with_busy_retry(|| {
            let tx = conn.transaction()?;
            check_append(bounds(&tx, "compactblocks")?, blocks)?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO compactblocks
                        (height, hash, prev_hash, time, sapling_outputs, orchard_actions, data)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for block in blocks {
                    stmt.execute(params![
                        sql_height(block.height)?,
                        block.meta.hash,
                        block.meta.prev_hash,
                        block.meta.time,
                        block.meta.sapling_outputs,
                        block.meta.orchard_actions,
                        block.raw,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;

        tracing::trace!(
            lower = blocks[0].height,
            upper = blocks[blocks.len() - 1].height,
            "Appended blocks to table cache"
        );
        Ok(())
    }

    fn latest_height(&self) -> Result<Option<BlockHeight>> {
        let conn = self.conn.lock();
        Ok(bounds(&conn, "compactblocks")?.map(|(_, upper)| upper))
    }

    fn earliest_height(&self) -> Result<Option<BlockHeight>> {
        let conn = self.conn.lock();
        Ok(bounds(&conn, "compactblocks")?.map(|(lower, _)| lower))
    }

    fn rewind(&self, height: BlockHeight) -> Result<()> {
        let conn = self.conn.lock();
        with_busy_retry(|| {
            conn.execute(
                "DELETE FROM compactblocks WHERE height > ?1",
                params![sql_bound(height)],
            )?;
            Ok(())
        })
    }

    fn prune(&self, height: BlockHeight) -> Result<()> {
        let conn = self.conn.lock();
        with_busy_retry(|| {
            conn.execute(
                "DELETE FROM compactblocks WHERE height <= ?1",
                params![sql_bound(height)],
            )?;
            Ok(())
        })
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("DROP TABLE IF EXISTS compactblocks;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn load_range(&self, range: BlockRange) -> Result<Vec<CompactBlock>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT height, hash, prev_hash, time, sapling_outputs, orchard_actions, data
             FROM compactblocks WHERE height BETWEEN ?1 AND ?2 ORDER BY height ASC",
        )?;
        let rows = stmt.query_map(params![sql_bound(range.lower), sql_bound(range.upper)], |row| {
            Ok(CompactBlock {
                height: row.get::<_, i64>(0)? as u64,
                meta: meta_from_row(row, 1)?,
                raw: row.get(6)?,
            })
        })?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?);
        }
        Ok(blocks)
    }

    fn meta_range(&self, range: BlockRange) -> Result<Vec<(BlockHeight, BlockMeta)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT height, hash, prev_hash, time, sapling_outputs, orchard_actions
             FROM compactblocks WHERE height BETWEEN ?1 AND ?2 ORDER BY height ASC",
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
}

impl SqliteBlockCache {
    /// Stored block at `height`
    pub fn block(&self, height: BlockHeight) -> Result<Option<CompactBlock>> {
        let conn = self.conn.lock();
        let block = conn
            .query_row(
                "SELECT height, hash, prev_hash, time, sapling_outputs, orchard_actions, data
                 FROM compactblocks WHERE height = ?1",
                params![sql_bound(height)],
                |row| {
                    Ok(CompactBlock {
                        height: row.get::<_, i64>(0)? as u64,
                        meta: meta_from_row(row, 1)?,
                        raw: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_cache::test_support::*;
    use crate::Error;

    #[test]
    fn test_append_and_latest() {
        let cache = SqliteBlockCache::open_in_memory().unwrap();
        assert_eq!(cache.latest_height().unwrap(), None);

        cache.append(&blocks(100, 109)).unwrap();
        assert_eq!(cache.latest_height().unwrap(), Some(109));
        assert_eq!(cache.earliest_height().unwrap(), Some(100));
    }

    #[test]
    fn test_append_is_idempotent() {
        let cache = SqliteBlockCache::open_in_memory().unwrap();
        cache.append(&blocks(1, 5)).unwrap();
        cache.append(&blocks(3, 5)).unwrap();
        cache.append(&[block(5, 7)]).unwrap();

        let loaded = cache.load_range(BlockRange::new(1, 10)).unwrap();
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded[4].meta.hash, hash(5, 7));
    }

    #[test]
    fn test_append_rejects_gap() {
        let cache = SqliteBlockCache::open_in_memory().unwrap();
        cache.append(&blocks(1, 5)).unwrap();
        let err = cache.append(&blocks(7, 8)).unwrap_err();
        assert!(matches!(err, Error::NonContiguous { .. }));
        assert_eq!(cache.latest_height().unwrap(), Some(5));
    }

    #[test]
    fn test_rewind_and_prune() {
        let cache = SqliteBlockCache::open_in_memory().unwrap();
        cache.append(&blocks(1, 20)).unwrap();

        cache.rewind(15).unwrap();
        assert_eq!(cache.latest_height().unwrap(), Some(15));

        cache.prune(10).unwrap();
        assert_eq!(cache.earliest_height().unwrap(), Some(11));
        assert_eq!(cache.load_range(BlockRange::new(0, 100)).unwrap().len(), 5);

        cache.rewind(3).unwrap();
        assert_eq!(cache.latest_height().unwrap(), None);
    }

    #[test]
    fn test_clear_reinitializes() {
        let cache = SqliteBlockCache::open_in_memory().unwrap();
        cache.append(&blocks(1, 3)).unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.latest_height().unwrap(), None);
        cache.append(&blocks(50, 51)).unwrap();
        assert_eq!(cache.latest_height().unwrap(), Some(51));
    }

    #[test]
    fn test_meta_range_and_block() {
        let cache = SqliteBlockCache::open_in_memory().unwrap();
        cache.append(&blocks(1, 4)).unwrap();

        let metas = cache.meta_range(BlockRange::new(2, 3)).unwrap();
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].0, 2);
        assert_eq!(metas[0].1.prev_hash, hash(1, 0));

        let block_3 = cache.block(3).unwrap().unwrap();
        assert_eq!(block_3.raw, b"block-3-0".to_vec());
        assert!(cache.block(9).unwrap().is_none());
    }

    #[test]
    fn test_file_backed_cache_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.sqlite");
        {
            let cache = SqliteBlockCache::open(&path).unwrap();
            cache.append(&blocks(10, 12)).unwrap();
        }
        let cache = SqliteBlockCache::open(&path).unwrap();
        assert_eq!(cache.latest_height().unwrap(), Some(12));
        assert_eq!(cache.path(), Some(path.as_path()));
    }
}
