//! Space accounting.
//!
//! All quantities are derived with queries over the shared database so that
//! every worker on the node computes them from the same state. The numbers
//! are instantaneous; anything that acts on them must re-check inside the
//! transaction that does the acting.

use anyhow::{format_err, Error};
use rusqlite::OptionalExtension;

use skein_api_types::{CacheProperty, FileState};

use crate::cache_db::CacheDb;

impl CacheDb {
    /// Total number of bytes the cache is limited to, or None if no limit
    /// was recorded yet.
    pub fn cache_limit(&self) -> Result<Option<u64>, Error> {
        Ok(self.property(CacheProperty::MaxSpace)?.map(|v| v as u64))
    }

    /// Total number of bytes of admitted files, in any state, or None when
    /// the cache has never held a file.
    pub fn cache_used(&self) -> Result<Option<u64>, Error> {
        let sum: Option<i64> =
            self.conn()
                .query_row("SELECT SUM(size) FROM files", [], |row| row.get(0))?;
        Ok(sum.map(|v| v as u64))
    }

    /// Disk reserved by jobs but not spent on immutable references to
    /// cached files. Negative when the immutable-reference credit exceeds
    /// the reservations.
    pub fn extra_job_space(&self) -> Result<i64, Error> {
        Ok(self.conn().query_row(
            "SELECT COALESCE((SELECT SUM(disk) FROM jobs), 0)
                  - COALESCE((SELECT SUM(files.size) FROM refs
                              INNER JOIN files ON refs.file_id = files.id
                              WHERE refs.state = 'immutable'), 0)",
            [],
            |row| row.get(0),
        )?)
    }

    /// Bytes still available for caching. Negative means eviction is
    /// required before anything new may take up space.
    ///
    /// A job holding an immutable reference gives its reserved bytes back
    /// to the cache: the file occupies nothing beyond what the job already
    /// reserved.
    pub fn cache_available(&self) -> Result<i64, Error> {
        Ok(self.conn().query_row(
            "SELECT COALESCE((SELECT value FROM properties WHERE name = 'maxSpace'), 0)
                  - COALESCE((SELECT SUM(size) FROM files), 0)
                  - (COALESCE((SELECT SUM(disk) FROM jobs), 0)
                     - COALESCE((SELECT SUM(files.size) FROM refs
                                 INNER JOIN files ON refs.file_id = files.id
                                 WHERE refs.state = 'immutable'), 0))",
            [],
            |row| row.get(0),
        )?)
    }

    /// Change the cache size limit.
    pub fn adjust_cache_limit(&self, new_total_bytes: u64) -> Result<(), Error> {
        self.set_property(CacheProperty::MaxSpace, new_total_bytes as i64)
    }

    /// Advisory: the file may leave the cached state right after this
    /// returns.
    pub fn file_is_cached(&self, file_id: &str) -> Result<bool, Error> {
        Ok(matches!(self.file_state(file_id)?, Some(FileState::Cached)))
    }

    /// Current state of the file's row, if it has one. Unknown state
    /// strings are rejected rather than carried along.
    pub fn file_state(&self, file_id: &str) -> Result<Option<FileState>, Error> {
        let state: Option<String> = self
            .conn()
            .query_row(
                "SELECT state FROM files WHERE id = ?1",
                [file_id],
                |row| row.get(0),
            )
            .optional()?;
        match state {
            None => Ok(None),
            Some(s) => Ok(Some(s.parse().map_err(|_| {
                format_err!("file '{file_id}' has unknown state '{s}' in the cache database")
            })?)),
        }
    }

    /// Outstanding references to the file, mutable copies included.
    pub fn file_reader_count(&self, file_id: &str) -> Result<u64, Error> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM refs WHERE file_id = ?1",
            [file_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
