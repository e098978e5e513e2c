use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, format_err, Context, Error};
use libc::pid_t;
use rusqlite::{params, OptionalExtension};

use skein_api_types::{CacheProperty, FileId, JobDescription, RefState};

use crate::cache_db::CacheDb;
use crate::error::CacheError;
use crate::job_store::JobStore;
use crate::liveness::current_pid;
use crate::recovery;

/// How long to pause between rounds of the admission loop and the space
/// wait, while some other worker holds the state we need.
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// A round of freeing space that does no real work counts as stalled; after
/// this many consecutive stalled rounds the node is declared overcommitted.
const FREE_SPACE_STALLED_ROUNDS: u32 = 40;
const FREE_SPACE_BACKOFF: Duration = Duration::from_millis(50);

/// Name of the node cache directory for one workflow, placed next to the
/// per-worker temp directories.
pub fn cache_dir_name(workflow_id: &str) -> String {
    format!("cache-{workflow_id}")
}

/// Node-local caching layer between running jobs and the job store.
///
/// One instance per worker process; one job runs per worker at a time. All
/// instances on the node share one database (see [`CacheDb`]) and one cache
/// directory, and everything transactional about this type exists so that
/// they can crash independently without losing each other's files.
pub struct CacheStore {
    job_store: Arc<dyn JobStore>,
    db: CacheDb,
    pid: pid_t,
    cache_dir: PathBuf,
    worker_temp_dir: PathBuf,
    /// The worker temp dir outside a job, the per-job temp dir inside one.
    local_temp_dir: PathBuf,
    job_id: Option<String>,
    job_disk_bytes: u64,
    files_to_delete: Vec<FileId>,
    jobs_to_delete: Vec<String>,
    cleanup_in_progress: bool,
    terminate: Arc<AtomicBool>,
}

impl CacheStore {
    /// Open the worker's view of the node cache.
    ///
    /// The cache directory is derived from the workflow ID and placed next
    /// to `worker_temp_dir`; the attempt-numbered database inside it is
    /// created on first open, and the cache size limit is seeded from the
    /// filesystem's free space if no worker recorded one yet.
    pub fn open(job_store: Arc<dyn JobStore>, worker_temp_dir: &Path) -> Result<Self, Error> {
        if !worker_temp_dir.is_absolute() {
            bail!("expected absolute path - got {worker_temp_dir:?}");
        }
        let parent = worker_temp_dir
            .parent()
            .ok_or_else(|| format_err!("worker temp dir {worker_temp_dir:?} has no parent"))?;

        let config = job_store.config().clone();
        let cache_dir = parent.join(cache_dir_name(&config.workflow_id));
        std::fs::create_dir_all(worker_temp_dir)?;
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("unable to create cache directory {cache_dir:?}"))?;

        let db = CacheDb::open_attempt(&cache_dir, config.workflow_attempt_number)?;

        let stat = nix::sys::statvfs::statvfs(&cache_dir)?;
        let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        db.init_property(CacheProperty::MaxSpace, free as i64)?;

        Ok(Self {
            job_store,
            db,
            pid: current_pid(),
            cache_dir,
            worker_temp_dir: worker_temp_dir.to_path_buf(),
            local_temp_dir: worker_temp_dir.to_path_buf(),
            job_id: None,
            job_disk_bytes: 0,
            files_to_delete: Vec::new(),
            jobs_to_delete: Vec::new(),
            cleanup_in_progress: false,
            terminate: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Temp directory of the currently open job, or the worker temp dir
    /// outside a job scope.
    pub fn local_temp_dir(&self) -> &Path {
        &self.local_temp_dir
    }

    /// Where the given file's bytes live while it is in the cache.
    pub fn cached_file_path(&self, id: &FileId) -> PathBuf {
        self.cache_dir.join(hex::encode(id.name()))
    }

    /// Set when a commit fails, so the rest of the node can see this worker
    /// is going down.
    pub fn termination_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminate)
    }

    /// True once the current job's scope has been exited; the remaining
    /// rows are the commit's (or, if this worker dies, recovery's) problem.
    pub fn cleanup_in_progress(&self) -> bool {
        self.cleanup_in_progress
    }

    // Accounting, delegated to the shared database.

    pub fn cache_limit(&self) -> Result<Option<u64>, Error> {
        self.db.cache_limit()
    }

    pub fn cache_used(&self) -> Result<Option<u64>, Error> {
        self.db.cache_used()
    }

    pub fn cache_available(&self) -> Result<i64, Error> {
        self.db.cache_available()
    }

    pub fn extra_job_space(&self) -> Result<i64, Error> {
        self.db.extra_job_space()
    }

    pub fn adjust_cache_limit(&self, new_total_bytes: u64) -> Result<(), Error> {
        self.db.adjust_cache_limit(new_total_bytes)
    }

    pub fn file_is_cached(&self, id: &FileId) -> Result<bool, Error> {
        self.db.file_is_cached(id.name())
    }

    pub fn file_reader_count(&self, id: &FileId) -> Result<u64, Error> {
        self.db.file_reader_count(id.name())
    }

    /// Disk bytes reserved by the currently open job.
    pub fn cache_job_requirement(&self) -> Option<u64> {
        self.job_id.as_ref().map(|_| self.job_disk_bytes)
    }

    /// Whether reading from the job store into the cache costs no extra
    /// disk. Probed once per run by writing an empty file through the store
    /// and checking the link count of the materialized copy; every later
    /// call reads the stored answer.
    pub fn caching_is_free(&mut self) -> Result<bool, Error> {
        if let Some(v) = self.db.property(CacheProperty::FreeCaching)? {
            return Ok(v == 1);
        }

        let free = if self.job_store.colocated_with(&self.cache_dir) {
            let creator = self.job_id.clone().unwrap_or_default();
            let probe_id = self.job_store.get_empty_file_store_id(&creator, true)?;

            let probe_dir = self
                .cache_dir
                .join(format!("probe-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir(&probe_dir)?;
            let probe_path = probe_dir.join("link-count-probe");
            self.job_store
                .read_file(&probe_id, &probe_path, false, false)?;

            use std::os::unix::fs::MetadataExt;
            let nlink = std::fs::metadata(&probe_path)?.nlink();

            let _ = std::fs::remove_file(&probe_path);
            let _ = std::fs::remove_dir(&probe_dir);
            self.job_store.delete_file(&probe_id)?;

            i64::from(nlink >= 2)
        } else {
            0
        };

        self.db.init_property(CacheProperty::FreeCaching, free)?;
        // Another worker may have probed concurrently; believe the table.
        Ok(self.db.property(CacheProperty::FreeCaching)? == Some(1))
    }

    // Job lifecycle.

    /// Run one job inside its cache scope.
    ///
    /// Creates the per-job temp directory, registers the job's disk
    /// reservation and evicts until the cache fits it, changes into the
    /// temp dir and runs `body`. The working directory is restored and the
    /// disk-use report emitted on every exit path; the job row itself is
    /// removed at commit time, or by recovery if this worker dies first.
    pub fn with_job<R>(
        &mut self,
        job: &JobDescription,
        body: impl FnOnce(&mut Self) -> Result<R, Error>,
    ) -> Result<R, Error> {
        // The previous working directory may already be gone (another
        // worker cleaning up a shared parent); our own temp dir is a safe
        // place to return to in that case.
        let starting_dir =
            std::env::current_dir().unwrap_or_else(|_| self.worker_temp_dir.clone());
        let job_temp = self.worker_temp_dir.join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&job_temp)?;
        self.local_temp_dir = job_temp.clone();
        self.job_id = Some(job.id.clone());
        self.job_disk_bytes = job.disk;

        let setup = (|| -> Result<(), Error> {
            // Jobs that died without cleaning up must not keep holding disk.
            recovery::remove_dead_jobs(&mut self.db, self.pid)?;
            self.db.conn().execute(
                "INSERT INTO jobs (id, temp, disk, worker) VALUES (?1, ?2, ?3, ?4)",
                params![
                    &job.id,
                    path_str(&job_temp)?,
                    job.disk as i64,
                    self.pid as i64
                ],
            )?;
            // Make room before the job starts filling its reservation.
            self.free_up_space()?;
            std::env::set_current_dir(&job_temp)?;
            Ok(())
        })();

        let result = match setup {
            Ok(()) => body(self),
            Err(err) => Err(err),
        };

        // Not a true peak, but close enough to tell the user their job
        // outgrew its reservation.
        let disk_used = dir_size(&job_temp);
        if job.disk > 0 {
            log::debug!(
                "job {} used {:.2}% of its disk reservation ({} of {} bytes) at the end of its run",
                job.id,
                disk_used as f64 / job.disk as f64 * 100.0,
                disk_used,
                job.disk
            );
        }
        if disk_used > job.disk {
            log::warn!(
                "job {} used more disk than it requested ({} > {} bytes); raise the job's disk \
                 requirement to avoid failures on constrained nodes",
                job.id,
                disk_used,
                job.disk
            );
        }
        if let Err(err) = std::env::set_current_dir(&starting_dir) {
            log::error!("unable to restore working directory {starting_dir:?} - {err}");
        }
        self.cleanup_in_progress = true;

        result
    }

    fn current_job_id(&self) -> Result<&str, Error> {
        self.job_id
            .as_deref()
            .ok_or_else(|| format_err!("no job is open on this worker"))
    }

    fn resolve_local_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.local_temp_dir.join(path)
        }
    }

    fn new_local_temp_path(&self) -> PathBuf {
        self.local_temp_dir
            .join(format!("tmp-{}", uuid::Uuid::new_v4()))
    }

    // Write path.

    /// Admit a job-local file as a global file.
    ///
    /// The file is hardlinked into the cache in `uploading` state and the
    /// actual upload deferred to a maintenance round or the commit. When
    /// the link cannot be made (cross-device, link count exhausted, no
    /// hardlinks on this filesystem) the cache is bypassed: space for a
    /// full copy cannot be guaranteed, so the file is uploaded on the spot
    /// and only the job's own mutable copy remains.
    pub fn write_global_file(&mut self, local_path: &Path, cleanup: bool) -> Result<FileId, Error> {
        let abs = self.resolve_local_path(local_path);
        if !abs.starts_with(&self.local_temp_dir) {
            return Err(CacheError::InvalidSource(abs).into());
        }
        let size = std::fs::metadata(&abs)
            .with_context(|| format!("unable to stat {abs:?}"))?
            .len();
        let creator = self.current_job_id()?.to_owned();

        let file_id = self.job_store.get_empty_file_store_id(&creator, cleanup)?;
        let cache_path = self.cached_file_path(&file_id);

        // The uploading file and the creator's immutable reference appear
        // together or not at all.
        let tx = self.db.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO files (id, path, size, state, owner)
             VALUES (?1, ?2, ?3, 'uploading', ?4)",
            params![
                file_id.name(),
                path_str(&cache_path)?,
                size as i64,
                self.pid as i64
            ],
        )?;
        tx.execute(
            "INSERT INTO refs (path, file_id, job_id, state)
             VALUES (?1, ?2, ?3, 'immutable')",
            params![path_str(&abs)?, file_id.name(), &creator],
        )?;
        tx.commit()?;

        if let Err(err) = std::fs::hard_link(&abs, &cache_path) {
            log::debug!("unable to hardlink {abs:?} into the cache, uploading directly - {err}");
            let tx = self.db.conn_mut().transaction()?;
            tx.execute(
                "UPDATE refs SET state = 'mutable' WHERE path = ?1",
                params![path_str(&abs)?],
            )?;
            tx.execute(
                "DELETE FROM files WHERE id = ?1",
                params![file_id.name()],
            )?;
            tx.commit()?;

            self.job_store.update_file(&file_id, &abs)?;
        }

        Ok(file_id.with_size(size))
    }

    // Read path.

    /// Materialize a global file for the current job.
    ///
    /// With `cache` false this is a plain job store read. Otherwise the
    /// worker races its peers for admission: exactly one becomes the
    /// downloader per file per node, everyone else attaches a reference to
    /// the cached copy or waits for the in-flight state to resolve.
    /// Immutable readers get a hardlink (or symlink, when permitted) backed
    /// by the cache; mutable readers get an independent file, produced by
    /// copy or - when space is short and nothing else holds the file - by
    /// taking the cached copy away wholesale.
    pub fn read_global_file(
        &mut self,
        file_id: &FileId,
        user_path: Option<&Path>,
        cache: bool,
        mutable: bool,
        symlink: bool,
    ) -> Result<PathBuf, Error> {
        let local_path = match user_path {
            Some(p) => {
                let abs = self.resolve_local_path(p);
                if abs.exists() {
                    return Err(CacheError::DestinationExists(abs).into());
                }
                abs
            }
            None => self.new_local_temp_path(),
        };

        if !cache {
            self.job_store
                .read_file(file_id, &local_path, mutable, symlink)?;
            return Ok(local_path);
        }

        let mut mutable = mutable;
        let cache_path = self.cached_file_path(file_id);
        let reader = self.current_job_id()?.to_owned();

        let mut own_download;
        let mut have_reference;

        loop {
            // Try to become the downloader. For non-mutable reads the
            // reference rides in the same transaction, so it is billed
            // against our job only if we won.
            let tx = self.db.conn_mut().transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO files (id, path, size, state, owner)
                 VALUES (?1, ?2, ?3, 'downloading', ?4)",
                params![
                    file_id.name(),
                    path_str(&cache_path)?,
                    file_id.size() as i64,
                    self.pid as i64
                ],
            )?;
            if !mutable {
                tx.execute(
                    "INSERT INTO refs (path, file_id, job_id, state)
                     SELECT ?1, id, ?2, 'immutable' FROM files
                      WHERE id = ?3 AND state = 'downloading' AND owner = ?4",
                    params![
                        path_str(&local_path)?,
                        &reader,
                        file_id.name(),
                        self.pid as i64
                    ],
                )?;
            }
            tx.commit()?;

            own_download = self.owns_download(file_id)?;
            if own_download {
                have_reference = !mutable;
                break;
            }

            // Not ours to download; maybe it is already cached and we can
            // hang a reference on it.
            let ref_state = if mutable {
                RefState::Copying
            } else {
                RefState::Immutable
            };
            self.db.conn().execute(
                "INSERT INTO refs (path, file_id, job_id, state)
                 SELECT ?1, id, ?2, ?3 FROM files WHERE id = ?4 AND state = 'cached'",
                params![
                    path_str(&local_path)?,
                    &reader,
                    ref_state.to_string(),
                    file_id.name()
                ],
            )?;
            have_reference = self.have_reference(&local_path)?;
            if have_reference {
                break;
            }

            // In flight by somebody else. If they died we inherit their
            // work; either way give the node a moment before retrying.
            recovery::remove_dead_jobs(&mut self.db, self.pid)?;
            recovery::steal_work_from_the_dead(&mut self.db, self.pid)?;
            self.execute_pending_deletions()?;
            std::thread::sleep(RETRY_DELAY);
        }

        if own_download {
            // The downloading ticket keeps everyone else out; make room,
            // then pull the bytes.
            self.free_up_space()?;
            self.job_store
                .read_file(file_id, &cache_path, false, false)?;
            self.db.conn().execute(
                "UPDATE files SET state = 'cached', owner = NULL WHERE id = ?1",
                params![file_id.name()],
            )?;
            own_download = false;
        }

        if !mutable {
            debug_assert!(have_reference);
            match std::fs::hard_link(&cache_path, &local_path) {
                Ok(()) => return Ok(local_path),
                Err(link_err) => {
                    if symlink {
                        if std::os::unix::fs::symlink(&cache_path, &local_path).is_ok() {
                            return Ok(local_path);
                        }
                    }
                    // No links to be had; pay for a private copy instead.
                    log::debug!(
                        "unable to link cached file {cache_path:?} to {local_path:?}, \
                         copying - {link_err}"
                    );
                    self.db.conn().execute(
                        "UPDATE refs SET state = 'copying' WHERE path = ?1",
                        params![path_str(&local_path)?],
                    )?;
                    mutable = true;
                }
            }
        }

        // Mutable read from here on.
        if !have_reference {
            self.db.conn().execute(
                "INSERT INTO refs (path, file_id, job_id, state)
                 VALUES (?1, ?2, ?3, 'copying')",
                params![path_str(&local_path)?, file_id.name(), &reader],
            )?;
        }

        while self.db.cache_available()? < 0 {
            self.try_to_free_up_space()?;
            if self.db.cache_available()? >= 0 {
                break;
            }

            // No room for a copy. If nothing but mutable references (and
            // our own) holds the cached file, take it over and give it
            // away instead of copying.
            self.db.conn().execute(
                "UPDATE files SET owner = ?1, state = 'downloading'
                  WHERE id = ?2 AND state = 'cached' AND owner IS NULL
                    AND NOT EXISTS (
                        SELECT 1 FROM refs
                         WHERE refs.file_id = files.id
                           AND refs.state != 'mutable'
                           AND refs.path != ?3
                    )",
                params![self.pid as i64, file_id.name(), path_str(&local_path)?],
            )?;
            if self.owns_download(file_id)? {
                own_download = true;
                break;
            }

            // Other jobs still hold copying or immutable references; they
            // will drop them eventually.
            std::thread::sleep(RETRY_DELAY);
        }

        if own_download {
            // Exclusive control: hand the cached copy over wholesale.
            std::fs::rename(&cache_path, &local_path)?;
            let tx = self.db.conn_mut().transaction()?;
            tx.execute(
                "UPDATE refs SET state = 'mutable' WHERE path = ?1",
                params![path_str(&local_path)?],
            )?;
            tx.execute("DELETE FROM files WHERE id = ?1", params![file_id.name()])?;
            tx.commit()?;
        } else {
            std::fs::copy(&cache_path, &local_path)
                .with_context(|| format!("unable to copy {cache_path:?} to {local_path:?}"))?;
            self.db.conn().execute(
                "UPDATE refs SET state = 'mutable' WHERE path = ?1",
                params![path_str(&local_path)?],
            )?;
        }

        Ok(local_path)
    }

    /// Stream a global file's content directly from the job store. A job
    /// keeping the stream open pays for any disk it spills to itself, so
    /// the cache stays out of it.
    pub fn read_global_file_stream(
        &self,
        file_id: &FileId,
    ) -> Result<Box<dyn std::io::Read + Send>, Error> {
        self.job_store.read_file_stream(file_id)
    }

    fn owns_download(&self, file_id: &FileId) -> Result<bool, Error> {
        let n: i64 = self.db.conn().query_row(
            "SELECT COUNT(*) FROM files WHERE id = ?1 AND state = 'downloading' AND owner = ?2",
            params![file_id.name(), self.pid as i64],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    fn have_reference(&self, local_path: &Path) -> Result<bool, Error> {
        let n: i64 = self.db.conn().query_row(
            "SELECT COUNT(*) FROM refs WHERE path = ?1",
            params![path_str(local_path)?],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    // Delete path.

    /// Drop the current job's references to a global file.
    ///
    /// The job's disk reservation no longer backs these references
    /// afterwards, so the cache may need to evict.
    pub fn delete_local_file(&mut self, file_id: &FileId) -> Result<(), Error> {
        let job_id = self.current_job_id()?.to_owned();

        let paths: Vec<String> = {
            let mut stmt = self
                .db
                .conn()
                .prepare("SELECT path FROM refs WHERE file_id = ?1 AND job_id = ?2")?;
            let rows = stmt.query_map(params![file_id.name(), &job_id], |row| row.get(0))?;
            rows.collect::<Result<Vec<String>, _>>()?
        };

        let mut missing = None;
        for path in &paths {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    // The user removed a tracked file behind our back;
                    // finish the bookkeeping before complaining.
                    missing.get_or_insert_with(|| PathBuf::from(path));
                }
                Err(err) => {
                    return Err(err).context(format!("unable to remove reference {path:?}"))
                }
            }
        }
        self.db.conn().execute(
            "DELETE FROM refs WHERE file_id = ?1 AND job_id = ?2",
            params![file_id.name(), &job_id],
        )?;

        self.free_up_space()?;

        if let Some(path) = missing {
            return Err(CacheError::IllegalDeletion(path).into());
        }
        Ok(())
    }

    /// Drop the file from this node and queue its removal from the job
    /// store at commit. Fails while any other reference to it exists.
    pub fn delete_global_file(&mut self, file_id: &FileId) -> Result<(), Error> {
        self.delete_local_file(file_id)?;

        let holder: Option<String> = self
            .db
            .conn()
            .query_row(
                "SELECT job_id FROM refs WHERE file_id = ?1 LIMIT 1",
                params![file_id.name()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(job) = holder {
            return Err(CacheError::FileInUse {
                file: file_id.name().to_owned(),
                job,
            }
            .into());
        }

        self.db.conn().execute(
            "UPDATE files SET state = 'deleting', owner = ?1 WHERE id = ?2",
            params![self.pid as i64, file_id.name()],
        )?;
        self.execute_pending_deletions()?;

        self.files_to_delete.push(file_id.clone());
        log::debug!(
            "queued global file '{}' for deletion from the job store at commit",
            file_id.name()
        );
        Ok(())
    }

    pub fn export_file(&self, file_id: &FileId, url: &str) -> Result<(), Error> {
        self.job_store.export_file(file_id, url)
    }

    // Maintenance.

    /// One round of making space: recovery, pending deletions, pending
    /// uploads, then at most one eviction. Returns whether any real work
    /// happened.
    pub fn try_to_free_up_space(&mut self) -> Result<bool, Error> {
        // Dead jobs first - they may hold references that make files look
        // used; dead workers next, their deletions become ours to finish.
        recovery::remove_dead_jobs(&mut self.db, self.pid)?;
        recovery::steal_work_from_the_dead(&mut self.db, self.pid)?;

        if self.execute_pending_deletions()? > 0 {
            return Ok(true);
        }
        if self.execute_pending_uploads()? > 0 {
            return Ok(true);
        }

        // Nothing in flight to finish, so put something new into deleting
        // state. Any candidate without non-mutable references will do;
        // eviction order is not tuned.
        let candidate: Option<String> = self
            .db
            .conn()
            .query_row(
                "SELECT files.id FROM files
                  WHERE files.state = 'cached' AND NOT EXISTS (
                      SELECT 1 FROM refs
                       WHERE refs.file_id = files.id AND refs.state != 'mutable'
                  ) LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(file_id) = candidate else {
            // Somebody else may be mid-eviction or mid-upload and will
            // free space for us too.
            return Ok(false);
        };

        // Claim it, unless a reader appeared in the meantime.
        self.db.conn().execute(
            "UPDATE files SET owner = ?1, state = 'deleting'
              WHERE id = ?2 AND state = 'cached' AND owner IS NULL
                AND NOT EXISTS (
                    SELECT 1 FROM refs
                     WHERE refs.file_id = files.id AND refs.state != 'mutable'
                )",
            params![self.pid as i64, &file_id],
        )?;
        log::debug!("evicting cached file '{file_id}'");

        Ok(self.execute_pending_deletions()? > 0)
    }

    /// Block until the cache fits its budget again, evicting as needed.
    /// Gives up once enough consecutive rounds make no progress.
    pub fn free_up_space(&mut self) -> Result<(), Error> {
        let mut stalled = 0;
        while self.db.cache_available()? < 0 {
            if self.try_to_free_up_space()? {
                stalled = 0;
                continue;
            }
            stalled += 1;
            if stalled >= FREE_SPACE_STALLED_ROUNDS {
                return Err(CacheError::Unbalanced.into());
            }
            std::thread::sleep(FREE_SPACE_BACKOFF);
        }
        Ok(())
    }

    /// Unlink and drop every file we own in deleting state. Returns how
    /// many were dropped.
    ///
    /// The row goes away even when the unlink fails: the goal is absence of
    /// the file, and a missing path means somebody (possibly a dead
    /// worker's earlier attempt) got there first.
    fn execute_pending_deletions(&mut self) -> Result<usize, Error> {
        let doomed: Vec<(String, String)> = {
            let mut stmt = self
                .db
                .conn()
                .prepare("SELECT id, path FROM files WHERE owner = ?1 AND state = 'deleting'")?;
            let rows = stmt.query_map(params![self.pid as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut deleted = 0;
        for (id, path) in doomed {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!("unable to unlink cached file {path:?} - {err}"),
            }

            // Stray references can remain from a dead downloader; they go
            // with the file.
            let tx = self.db.conn_mut().transaction()?;
            tx.execute(
                "DELETE FROM files WHERE id = ?1 AND state = 'deleting'",
                params![&id],
            )?;
            tx.execute("DELETE FROM refs WHERE file_id = ?1", params![&id])?;
            tx.commit()?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Push every file we own in uploading state to the job store, then
    /// mark it cached. Returns how many went out.
    ///
    /// A failed upload propagates with the file still in uploading state,
    /// so a later round - or another worker, after we die - can retry or
    /// recover it.
    fn execute_pending_uploads(&mut self) -> Result<usize, Error> {
        let pending: Vec<(String, String, i64)> = {
            let mut stmt = self.db.conn().prepare(
                "SELECT id, path, size FROM files WHERE state = 'uploading' AND owner = ?1",
            )?;
            let rows = stmt.query_map(params![self.pid as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut uploaded = 0;
        for (id, path, size) in pending {
            let file_id = FileId::new(id.clone(), size as u64);
            self.job_store.update_file(&file_id, Path::new(&path))?;
            self.db.conn().execute(
                "UPDATE files SET state = 'cached', owner = NULL WHERE id = ?1",
                params![&id],
            )?;
            uploaded += 1;
        }
        Ok(uploaded)
    }

    // Commit.

    /// Nothing commits in the background here, so there is never anything
    /// to wait for.
    pub fn wait_for_commit(&self) -> Result<bool, Error> {
        Ok(true)
    }

    /// Ask the job store to delete this job once the current job commits.
    pub fn queue_job_deletion<J: Into<String>>(&mut self, job_id: J) {
        self.jobs_to_delete.push(job_id.into());
    }

    /// Flush the current job's state to the job store: remaining uploads
    /// and deletions, the job wrapper with its global-delete requests, the
    /// requested deletions themselves, and finally the wrapper again with
    /// the request list cleared.
    pub fn commit_current_job(&mut self) -> Result<(), Error> {
        let result = self.commit_current_job_inner();
        if result.is_err() {
            self.terminate.store(true, Ordering::SeqCst);
        }
        result
    }

    fn commit_current_job_inner(&mut self) -> Result<(), Error> {
        let job_id = self.current_job_id()?.to_owned();

        self.execute_pending_uploads()?;
        self.execute_pending_deletions()?;

        self.job_store.update_job(&job_id, &self.files_to_delete)?;
        for job in std::mem::take(&mut self.jobs_to_delete) {
            self.job_store.delete_job(&job)?;
        }
        let doomed = std::mem::take(&mut self.files_to_delete);
        for file in &doomed {
            self.job_store.delete_file(file)?;
        }
        if !doomed.is_empty() {
            self.job_store.update_job(&job_id, &[])?;
        }

        // The job is fully persisted; its rows have nothing left to pin.
        // The temp dir itself is the engine's to remove.
        let tx = self.db.conn_mut().transaction()?;
        tx.execute("DELETE FROM refs WHERE job_id = ?1", params![&job_id])?;
        tx.execute("DELETE FROM jobs WHERE id = ?1", params![&job_id])?;
        tx.commit()?;
        self.job_id = None;

        Ok(())
    }

    // Shutdown.

    /// Tear down the node's cache directory at the end of a workflow.
    ///
    /// Runs with no instance state: the database is found through the
    /// `cache.db` hardlink if it survived, everything dead workers left
    /// behind is recovered, and then the directory goes away wholesale. A
    /// database too broken to open is not worth recovering - the directory
    /// is removed regardless.
    pub fn shutdown(cache_dir: &Path) -> Result<(), Error> {
        match CacheDb::open_current(cache_dir) {
            Ok(Some(mut db)) => {
                let pid = current_pid();
                if let Err(err) = recovery::remove_dead_jobs(&mut db, pid) {
                    log::warn!("unable to clean up dead jobs during shutdown - {err}");
                }
                if let Err(err) = recovery::steal_work_from_the_dead(&mut db, pid) {
                    log::warn!("unable to recover dead workers' files during shutdown - {err}");
                }
            }
            Ok(None) => {}
            Err(err) => log::warn!("unable to open cache database during shutdown - {err}"),
        }

        if cache_dir.exists() {
            std::fs::remove_dir_all(cache_dir)
                .with_context(|| format!("unable to remove cache directory {cache_dir:?}"))?;
        }
        Ok(())
    }
}

fn path_str(path: &Path) -> Result<&str, Error> {
    path.to_str()
        .ok_or_else(|| format_err!("non-utf8 path not supported: {path:?}"))
}

/// Recursive apparent size of a directory tree. Unreadable entries count as
/// zero - this feeds an advisory report, not accounting.
fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    for entry in walkdir::WalkDir::new(path).into_iter().flatten() {
        if let Ok(meta) = entry.metadata() {
            if meta.is_file() {
                total += meta.len();
            }
        }
    }
    total
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cache_dir_name_embeds_workflow() {
        assert_eq!(cache_dir_name("wf-123"), "cache-wf-123");
    }

    #[test]
    fn dir_size_counts_files_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 50]).unwrap();
        assert_eq!(dir_size(dir.path()), 150);
    }
}
