//! Directory-backed job store fixture and node setup shared by the
//! integration tests.

#![allow(dead_code)]

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};

use skein_api_types::{FileId, JobStoreConfig};
use skein_cache_store::{cache_dir_name, CacheDb, CacheStore, JobStore};

/// Enough of a real job store to exercise the cache: file bodies are plain
/// files in one directory, and every call is recorded for assertions.
pub struct DirJobStore {
    root: PathBuf,
    config: JobStoreConfig,
    /// Serve reads as hardlinks (a colocated store) instead of copies.
    link_on_read: bool,
    counter: Mutex<u64>,
    pub read_calls: Mutex<Vec<String>>,
    pub updated_files: Mutex<Vec<String>>,
    pub deleted_files: Mutex<Vec<String>>,
    pub updated_jobs: Mutex<Vec<(String, Vec<String>)>>,
    pub deleted_jobs: Mutex<Vec<String>>,
}

impl DirJobStore {
    pub fn new(root: &Path, link_on_read: bool) -> Self {
        std::fs::create_dir_all(root).unwrap();
        Self {
            root: root.to_path_buf(),
            config: JobStoreConfig {
                workflow_id: "wf-test".to_string(),
                workflow_attempt_number: 1,
            },
            link_on_read,
            counter: Mutex::new(0),
            read_calls: Mutex::new(Vec::new()),
            updated_files: Mutex::new(Vec::new()),
            deleted_files: Mutex::new(Vec::new()),
            updated_jobs: Mutex::new(Vec::new()),
            deleted_jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn body_path(&self, id: &FileId) -> PathBuf {
        self.root.join(id.name())
    }

    /// Plant a file body directly, as if some other node had written it.
    pub fn plant(&self, name: &str, content: &[u8]) -> FileId {
        let id = FileId::new(name, content.len() as u64);
        std::fs::write(self.body_path(&id), content).unwrap();
        id
    }
}

impl JobStore for DirJobStore {
    fn config(&self) -> &JobStoreConfig {
        &self.config
    }

    fn get_empty_file_store_id(
        &self,
        _creator_job_id: &str,
        _cleanup: bool,
    ) -> Result<FileId, Error> {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        let id = FileId::new(format!("file-{:04}", *counter), 0);
        std::fs::write(self.body_path(&id), b"")?;
        Ok(id)
    }

    fn read_file(
        &self,
        id: &FileId,
        dst: &Path,
        _mutable: bool,
        _symlink: bool,
    ) -> Result<(), Error> {
        self.read_calls.lock().unwrap().push(id.name().to_string());
        let body = self.body_path(id);
        if !body.exists() {
            return Err(format_err!("no such file '{id}' in the job store"));
        }
        if self.link_on_read {
            std::fs::hard_link(&body, dst)?;
        } else {
            std::fs::copy(&body, dst)?;
        }
        Ok(())
    }

    fn read_file_stream(&self, id: &FileId) -> Result<Box<dyn Read + Send>, Error> {
        Ok(Box::new(std::fs::File::open(self.body_path(id))?))
    }

    fn update_file(&self, id: &FileId, src: &Path) -> Result<(), Error> {
        std::fs::copy(src, self.body_path(id))?;
        self.updated_files
            .lock()
            .unwrap()
            .push(id.name().to_string());
        Ok(())
    }

    fn delete_file(&self, id: &FileId) -> Result<(), Error> {
        let _ = std::fs::remove_file(self.body_path(id));
        self.deleted_files
            .lock()
            .unwrap()
            .push(id.name().to_string());
        Ok(())
    }

    fn export_file(&self, id: &FileId, _url: &str) -> Result<(), Error> {
        if !self.body_path(id).exists() {
            return Err(format_err!("no such file '{id}' in the job store"));
        }
        Ok(())
    }

    fn update_job(&self, job_id: &str, files_to_delete: &[FileId]) -> Result<(), Error> {
        self.updated_jobs.lock().unwrap().push((
            job_id.to_string(),
            files_to_delete.iter().map(|f| f.name().to_string()).collect(),
        ));
        Ok(())
    }

    fn delete_job(&self, job_id: &str) -> Result<(), Error> {
        self.deleted_jobs.lock().unwrap().push(job_id.to_string());
        Ok(())
    }

    fn colocated_with(&self, _dir: &Path) -> bool {
        // The fixture lives in the same tempdir as the cache.
        true
    }
}

/// One simulated node: a job store and as many workers as a test needs,
/// all sharing one cache directory.
pub struct TestNode {
    pub dir: tempfile::TempDir,
    pub job_store: Arc<DirJobStore>,
}

impl TestNode {
    pub fn new() -> Self {
        Self::with_link_on_read(false)
    }

    pub fn with_link_on_read(link_on_read: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let job_store = Arc::new(DirJobStore::new(&dir.path().join("jobstore"), link_on_read));
        Self { dir, job_store }
    }

    /// Open a worker's cache store. Workers differ only by temp dir; they
    /// share the node's cache directory and database.
    pub fn worker(&self, name: &str) -> CacheStore {
        let job_store: Arc<dyn JobStore> = self.job_store.clone();
        CacheStore::open(job_store, &self.dir.path().join(name)).unwrap()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join(cache_dir_name("wf-test"))
    }

    /// A second, independent connection to the shared database - the same
    /// view another worker process would have.
    pub fn raw_db(&self) -> CacheDb {
        CacheDb::open_attempt(&self.cache_dir(), 1).unwrap()
    }
}

/// A PID guaranteed not to be running: a spawned child that already exited.
pub fn dead_pid() -> i64 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id() as i64;
    child.wait().unwrap();
    pid
}

/// Every file row must have an owner exactly when it is not cached.
pub fn assert_owner_invariant(db: &CacheDb) {
    let mut stmt = db
        .conn()
        .prepare("SELECT id, state, owner FROM files")
        .unwrap();
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })
        .unwrap();
    for row in rows {
        let (id, state, owner) = row.unwrap();
        assert_eq!(
            state == "cached",
            owner.is_none(),
            "file '{id}' violates the owner/state invariant: state={state} owner={owner:?}"
        );
    }
}
