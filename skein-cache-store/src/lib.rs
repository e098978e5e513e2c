//! Node-local caching layer between skein jobs and the job store.
//!
//! Jobs read and write "global" files that live in the backing job store.
//! Instead of round-tripping every access, each node keeps one cache
//! directory: files pulled from the job store are materialized once and
//! handed to jobs as hardlinks, symlinks, or copies; files written by jobs
//! are admitted by hardlink and uploaded later. Several independent worker
//! processes per node share the cache.
//!
//! # Shared state
//!
//! All coordination happens through one SQLite database in the cache
//! directory, opened by every worker. There is no in-memory locking between
//! workers at all: the database's transaction isolation provides the
//! atomicity, and filesystem primitives (`link`, `rename`, `unlink`)
//! provide the on-disk counterparts the database rows describe.
//!
//! Four tables:
//!
//! * `files` - one row per file admitted to the cache: its job store ID,
//!   its path in the cache directory, its size, its state, and the PID of
//!   the worker currently acting on it.
//! * `refs` - one row per outstanding handle a job holds on a cached file.
//! * `jobs` - one row per job running on the node, with its temp dir and
//!   disk reservation.
//! * `properties` - scalar settings: the cache size limit and whether
//!   caching is free on this node.
//!
//! # File states
//!
//! * `downloading` - being pulled into the cache by its owner. Nobody else
//!   may reference it; readers wait for `cached`. If the owner dies the
//!   file may be half-written, so it moves to `deleting`.
//! * `cached` - present and unowned. Reads attach references immediately.
//!   Claimable for eviction once no non-mutable references remain.
//! * `uploading` - present in the cache but not yet written back to the
//!   job store. If the owner dies the bytes are still good and the dead
//!   job cannot have been committed, so the file becomes `cached`.
//! * `deleting` - being removed by its owner; the row follows the bytes.
//!
//! # Crash recovery
//!
//! Workers die at arbitrary points. Any live worker about to do something
//! expensive first *steals work from the dead*: it adopts dead owners'
//! files according to the table above, releases dead workers' jobs, and
//! cleans up adopted jobs' references and temp directories. Recovery is
//! idempotent and safe to run concurrently - every adoption is a guarded
//! single-statement claim that only one worker can win.
//!
//! # Space accounting
//!
//! `available = maxSpace - Σ file sizes - (Σ job reservations - Σ sizes of
//! immutably referenced files)`. A job reading a file immutably pays for it
//! out of its own reservation, which hands the cache the same number of
//! bytes back. When `available` goes negative, workers finish pending
//! deletions and uploads and then evict unreferenced cached files until it
//! recovers.

#![deny(unsafe_op_in_unsafe_fn)]

mod cache_db;
mod error;
mod job_store;
mod liveness;
mod recovery;
mod space;
mod store;

pub use cache_db::{CacheDb, CURRENT_DB_LINK_NAME};
pub use error::CacheError;
pub use job_store::JobStore;
pub use liveness::pid_is_alive;
pub use recovery::{remove_dead_jobs, steal_work_from_the_dead};
pub use store::{cache_dir_name, CacheStore};
