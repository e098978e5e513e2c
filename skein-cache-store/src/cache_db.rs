use std::path::Path;
use std::time::Duration;

use anyhow::{format_err, Context, Error};
use rusqlite::{Connection, OptionalExtension};

use skein_api_types::CacheProperty;

/// Name of the hardlink that always points at the database of the most
/// recent workflow attempt. Shutdown only knows the cache directory, so it
/// finds the database through this pointer.
pub const CURRENT_DB_LINK_NAME: &str = "cache.db";

/// How long a worker queues on the database write lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle on the shared node cache database.
///
/// Every worker process on the node opens the same database file, and the
/// database engine's transaction isolation is the only cross-process
/// synchronization there is. Each logically atomic state change must be one
/// committed transaction; a single `execute` statement is its own
/// transaction.
pub struct CacheDb {
    conn: Connection,
}

impl CacheDb {
    /// Open (or create) the database for one workflow attempt and register
    /// it as the current one via the [`CURRENT_DB_LINK_NAME`] hardlink.
    pub fn open_attempt(cache_dir: &Path, attempt: u32) -> Result<Self, Error> {
        let db_path = cache_dir.join(format!("cache-{attempt}.db"));
        let mut db = Self::open_file(&db_path)?;
        db.ensure_tables()?;
        refresh_current_link(&db_path, &cache_dir.join(CURRENT_DB_LINK_NAME))?;
        Ok(db)
    }

    /// Open the most recent attempt's database through the hardlink, if
    /// there is one. Used by shutdown, which has no instance state.
    pub fn open_current(cache_dir: &Path) -> Result<Option<Self>, Error> {
        let link = cache_dir.join(CURRENT_DB_LINK_NAME);
        if !link.exists() {
            return Ok(None);
        }
        let mut db = Self::open_file(&link)?;
        // A worker may have died between creating the database and creating
        // the tables; recovery still has to run against it.
        db.ensure_tables()?;
        Ok(Some(db))
    }

    fn open_file(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path)
            .with_context(|| format!("unable to open cache database {path:?}"))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    /// Create any missing tables. Idempotent; every worker runs this on
    /// open. The columns are shared between worker versions within one run,
    /// so this schema is append-only.
    pub fn ensure_tables(&mut self) -> Result<(), Error> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                 id TEXT NOT NULL PRIMARY KEY,
                 path TEXT UNIQUE NOT NULL,
                 size INTEGER NOT NULL,
                 state TEXT NOT NULL,
                 owner INTEGER
             );
             CREATE TABLE IF NOT EXISTS refs (
                 path TEXT NOT NULL PRIMARY KEY,
                 file_id TEXT NOT NULL,
                 job_id TEXT NOT NULL,
                 state TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS jobs (
                 id TEXT NOT NULL PRIMARY KEY,
                 temp TEXT NOT NULL,
                 disk INTEGER NOT NULL,
                 worker INTEGER
             );
             CREATE TABLE IF NOT EXISTS properties (
                 name TEXT NOT NULL PRIMARY KEY,
                 value INTEGER NOT NULL
             );",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Record a property value unless some worker already did.
    pub fn init_property(&self, key: CacheProperty, value: i64) -> Result<(), Error> {
        self.conn.execute(
            "INSERT OR IGNORE INTO properties (name, value) VALUES (?1, ?2)",
            rusqlite::params![key.name(), value],
        )?;
        Ok(())
    }

    pub fn set_property(&self, key: CacheProperty, value: i64) -> Result<(), Error> {
        let updated = self.conn.execute(
            "UPDATE properties SET value = ?2 WHERE name = ?1",
            rusqlite::params![key.name(), value],
        )?;
        if updated == 0 {
            self.init_property(key, value)?;
        }
        Ok(())
    }

    pub fn property(&self, key: CacheProperty) -> Result<Option<i64>, Error> {
        self.conn
            .query_row(
                "SELECT value FROM properties WHERE name = ?1",
                [key.name()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| format_err!("unable to read property '{}' - {err}", key.name()))
    }
}

/// Point `link` at `db_path`, replacing whatever older attempt it referred
/// to. Losing the replace race to another worker is fine - the winner linked
/// a database of this attempt too.
fn refresh_current_link(db_path: &Path, link: &Path) -> Result<(), Error> {
    for _ in 0..2 {
        match std::fs::hard_link(db_path, link) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = std::fs::remove_file(link);
            }
            Err(err) => {
                return Err(format_err!(
                    "unable to link {db_path:?} as {link:?} - {err}"
                ))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = CacheDb::open_attempt(dir.path(), 1).unwrap();
        db.ensure_tables().unwrap();

        db.conn()
            .execute(
                "INSERT INTO files (id, path, size, state, owner)
                 VALUES ('f1', '/x/f1', 10, 'cached', NULL)",
                [],
            )
            .unwrap();
        db.ensure_tables().unwrap();

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn properties_first_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let db = CacheDb::open_attempt(dir.path(), 1).unwrap();

        assert_eq!(db.property(CacheProperty::MaxSpace).unwrap(), None);
        db.init_property(CacheProperty::MaxSpace, 1000).unwrap();
        db.init_property(CacheProperty::MaxSpace, 9999).unwrap();
        assert_eq!(db.property(CacheProperty::MaxSpace).unwrap(), Some(1000));

        db.set_property(CacheProperty::MaxSpace, 500).unwrap();
        assert_eq!(db.property(CacheProperty::MaxSpace).unwrap(), Some(500));
    }

    #[test]
    fn current_link_follows_latest_attempt() {
        let dir = tempfile::tempdir().unwrap();

        let db = CacheDb::open_attempt(dir.path(), 1).unwrap();
        db.init_property(CacheProperty::MaxSpace, 1).unwrap();
        drop(db);

        let db = CacheDb::open_attempt(dir.path(), 2).unwrap();
        db.init_property(CacheProperty::MaxSpace, 2).unwrap();
        drop(db);

        let current = CacheDb::open_current(dir.path()).unwrap().unwrap();
        assert_eq!(current.property(CacheProperty::MaxSpace).unwrap(), Some(2));
    }

    #[test]
    fn open_current_without_link() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CacheDb::open_current(dir.path()).unwrap().is_none());
    }
}
