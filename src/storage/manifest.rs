//! SQLite manifest: schema, prepared statements, row mapping.
//!
//! Every distinct SQL text goes through `prepare_cached`, so statements are
//! prepared once per connection and rebound on reuse; the cache dies with
//! the connection. Keys are always bound parameters, never interpolated.

use crate::errors::{CacheError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS manifest (
    key               TEXT PRIMARY KEY,
    filename          TEXT,
    size              INTEGER NOT NULL,
    inline_data       BLOB,
    modification_time INTEGER NOT NULL,
    last_access_time  INTEGER NOT NULL,
    extended_data     BLOB
);
CREATE INDEX IF NOT EXISTS manifest_last_access ON manifest(last_access_time);
";

/// One manifest row, payload included when it was selected.
pub(crate) struct ManifestRow {
    pub filename: Option<String>,
    pub size: u64,
    pub inline_data: Option<Vec<u8>>,
    pub modification_time: i64,
    pub last_access_time: i64,
    pub extended_data: Option<Vec<u8>>,
}

pub(crate) struct Manifest {
    conn: Connection,
}

fn stmt_err(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> CacheError {
    move |source| CacheError::Manifest { operation, source }
}

impl Manifest {
    /// Open the database, creating the schema if absent and enabling
    /// write-ahead logging.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| CacheError::ManifestOpen {
            path: path.to_path_buf(),
            source: e,
        })?;
        // journal_mode returns its new value as a row, so query it
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(|e| CacheError::ManifestOpen {
                path: path.to_path_buf(),
                source: e,
            })?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")
            .map_err(|e| CacheError::ManifestOpen {
                path: path.to_path_buf(),
                source: e,
            })?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CacheError::ManifestOpen {
                path: path.to_path_buf(),
                source: e,
            })?;
        // room for every distinct statement this module issues
        conn.set_prepared_statement_cache_capacity(32);
        Ok(Self { conn })
    }

    /// Finalise cached statements, then close the connection.
    pub fn close(self) {
        self.conn.flush_prepared_statement_cache();
        if let Err((_conn, e)) = self.conn.close() {
            tracing::warn!("manifest close failed: {e}");
        }
    }

    /// Insert or replace; every field of an existing row is overwritten.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert(
        &self,
        key: &str,
        filename: Option<&str>,
        size: u64,
        inline_data: Option<&[u8]>,
        modification_time: i64,
        last_access_time: i64,
        extended_data: Option<&[u8]>,
    ) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "INSERT OR REPLACE INTO manifest \
                 (key, filename, size, inline_data, modification_time, last_access_time, extended_data) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(stmt_err("save"))?;
        stmt.execute(params![
            key,
            filename,
            size as i64,
            inline_data,
            modification_time,
            last_access_time,
            extended_data
        ])
        .map_err(stmt_err("save"))?;
        Ok(())
    }

    /// Bump the access timestamp of one row.
    pub fn touch(&self, key: &str, at: i64) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE manifest SET last_access_time = ?1 WHERE key = ?2")
            .map_err(stmt_err("touch"))?;
        stmt.execute(params![at, key]).map_err(stmt_err("touch"))?;
        Ok(())
    }

    /// Fetch one row, with or without the inline payload column.
    pub fn get(&self, key: &str, with_payload: bool) -> Result<Option<ManifestRow>> {
        let sql = if with_payload {
            "SELECT filename, size, inline_data, modification_time, last_access_time, extended_data \
             FROM manifest WHERE key = ?1"
        } else {
            "SELECT filename, size, NULL, modification_time, last_access_time, extended_data \
             FROM manifest WHERE key = ?1"
        };
        let mut stmt = self.conn.prepare_cached(sql).map_err(stmt_err("lookup"))?;
        stmt.query_row(params![key], |row| {
            Ok(ManifestRow {
                filename: row.get::<_, Option<String>>(0)?.filter(|f| !f.is_empty()),
                size: row.get::<_, i64>(1)? as u64,
                inline_data: row.get(2)?,
                modification_time: row.get(3)?,
                last_access_time: row.get(4)?,
                extended_data: row.get(5)?,
            })
        })
        .optional()
        .map_err(stmt_err("lookup"))
    }

    /// The external filename of one row. Outer `None`: no such row; inner
    /// `None`: the payload is inline.
    pub fn filename(&self, key: &str) -> Result<Option<Option<String>>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT filename FROM manifest WHERE key = ?1")
            .map_err(stmt_err("filename lookup"))?;
        stmt.query_row(params![key], |row| row.get::<_, Option<String>>(0))
            .optional()
            .map_err(stmt_err("filename lookup"))
            .map(|row| row.map(|f| f.filter(|name| !name.is_empty())))
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM manifest WHERE key = ?1")
            .map_err(stmt_err("exists"))?;
        stmt.query_row(params![key], |_| Ok(()))
            .optional()
            .map_err(stmt_err("exists"))
            .map(|row| row.is_some())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM manifest WHERE key = ?1")
            .map_err(stmt_err("delete"))?;
        stmt.execute(params![key]).map_err(stmt_err("delete"))?;
        Ok(())
    }

    pub fn delete_many(&self, keys: &[String]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(stmt_err("batch delete"))?;
        {
            let mut stmt = tx
                .prepare_cached("DELETE FROM manifest WHERE key = ?1")
                .map_err(stmt_err("batch delete"))?;
            for key in keys {
                stmt.execute(params![key]).map_err(stmt_err("batch delete"))?;
            }
        }
        tx.commit().map_err(stmt_err("batch delete"))
    }

    pub fn filenames_larger_than(&self, size: u64) -> Result<Vec<String>> {
        self.collect_filenames(
            "SELECT filename FROM manifest \
             WHERE size > ?1 AND filename IS NOT NULL AND filename != ''",
            size as i64,
        )
    }

    pub fn delete_larger_than(&self, size: u64) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM manifest WHERE size > ?1")
            .map_err(stmt_err("delete by size"))?;
        stmt.execute(params![size as i64])
            .map_err(stmt_err("delete by size"))?;
        Ok(())
    }

    pub fn filenames_earlier_than(&self, time: i64) -> Result<Vec<String>> {
        self.collect_filenames(
            "SELECT filename FROM manifest \
             WHERE last_access_time < ?1 AND filename IS NOT NULL AND filename != ''",
            time,
        )
    }

    pub fn delete_earlier_than(&self, time: i64) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM manifest WHERE last_access_time < ?1")
            .map_err(stmt_err("delete by age"))?;
        stmt.execute(params![time])
            .map_err(stmt_err("delete by age"))?;
        Ok(())
    }

    /// Oldest rows by access time, ascending; same-second ties fall back
    /// to insertion order (`INSERT OR REPLACE` refreshes the rowid).
    pub fn oldest(&self, limit: usize) -> Result<Vec<(String, Option<String>, u64)>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT key, filename, size FROM manifest \
                 ORDER BY last_access_time ASC, rowid ASC LIMIT ?1",
            )
            .map_err(stmt_err("oldest scan"))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let filename = row.get::<_, Option<String>>(1)?;
                Ok((
                    row.get(0)?,
                    filename.filter(|f| !f.is_empty()),
                    row.get::<_, i64>(2)? as u64,
                ))
            })
            .map_err(stmt_err("oldest scan"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(stmt_err("oldest scan"))
    }

    pub fn clear(&self) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM manifest")
            .map_err(stmt_err("clear"))?;
        stmt.execute([]).map_err(stmt_err("clear"))?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT COUNT(*) FROM manifest")
            .map_err(stmt_err("count"))?;
        stmt.query_row([], |row| row.get::<_, i64>(0))
            .map_err(stmt_err("count"))
            .map(|n| n as u64)
    }

    pub fn total_size(&self) -> Result<u64> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT IFNULL(SUM(size), 0) FROM manifest")
            .map_err(stmt_err("size total"))?;
        stmt.query_row([], |row| row.get::<_, i64>(0))
            .map_err(stmt_err("size total"))
            .map(|n| n as u64)
    }

    fn collect_filenames(&self, sql: &'static str, arg: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(sql).map_err(stmt_err("filename scan"))?;
        let rows = stmt
            .query_map(params![arg], |row| row.get::<_, String>(0))
            .map_err(stmt_err("filename scan"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(stmt_err("filename scan"))
    }
}
