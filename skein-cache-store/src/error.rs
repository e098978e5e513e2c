use std::path::PathBuf;

use thiserror::Error;

/// Cache misuse and over-commitment errors surfaced to callers.
///
/// Everything else (database trouble, job store I/O) propagates as a plain
/// [`anyhow::Error`]; callers that care can `downcast_ref::<CacheError>()`.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Freeing space made no progress for too long. This usually means the
    /// jobs on the node use more disk than they requested, so their
    /// reservations cannot all be honored. Fatal for the current job.
    #[error(
        "unable to free enough space for caching - jobs are likely using more disk than requested"
    )]
    Unbalanced,

    /// A tracked reference file disappeared from disk while its job was
    /// still alive. Such files must be removed through `delete_local_file`.
    #[error("cache tracked file {0:?} was deleted without delete_local_file")]
    IllegalDeletion(PathBuf),

    /// Only files inside the job's temp directory can be admitted.
    #[error("source file {0:?} is not inside the job's temp directory")]
    InvalidSource(PathBuf),

    /// Reads never overwrite; the caller picked an occupied destination.
    #[error("destination {0:?} already exists and cannot be overwritten")]
    DestinationExists(PathBuf),

    /// `delete_global_file` while another job still holds a reference.
    #[error("global file '{file}' is still in use by job '{job}'")]
    FileInUse { file: String, job: String },
}
