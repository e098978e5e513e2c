use std::io::Read;
use std::path::Path;

use anyhow::Error;

use skein_api_types::{FileId, JobStoreConfig};

/// The backing store this cache front-ends.
///
/// Implementations live with the engine (filesystem, object store, ...);
/// the cache only needs this seam. Calls may block on network or disk I/O
/// for as long as they like - the caller holds the file's downloading or
/// uploading ticket in the shared database for the duration, and that is
/// the only guard required.
pub trait JobStore {
    fn config(&self) -> &JobStoreConfig;

    /// Create a fresh empty file on behalf of `creator_job_id` and return
    /// its ID.
    fn get_empty_file_store_id(&self, creator_job_id: &str, cleanup: bool)
        -> Result<FileId, Error>;

    /// Materialize the file's bytes at `dst`. `dst` must not exist yet.
    fn read_file(&self, id: &FileId, dst: &Path, mutable: bool, symlink: bool)
        -> Result<(), Error>;

    fn read_file_stream(&self, id: &FileId) -> Result<Box<dyn Read + Send>, Error>;

    /// Replace the file's stored content with the bytes at `src`.
    fn update_file(&self, id: &FileId, src: &Path) -> Result<(), Error>;

    fn delete_file(&self, id: &FileId) -> Result<(), Error>;

    fn export_file(&self, id: &FileId, url: &str) -> Result<(), Error>;

    /// Persist the job wrapper, including the files the job wants deleted
    /// once the update lands.
    fn update_job(&self, job_id: &str, files_to_delete: &[FileId]) -> Result<(), Error>;

    fn delete_job(&self, job_id: &str) -> Result<(), Error>;

    /// Whether the store's data lives on the same filesystem as `dir`.
    /// Only then is the free-caching link-count probe worth running.
    fn colocated_with(&self, dir: &Path) -> bool {
        let _ = dir;
        false
    }
}
