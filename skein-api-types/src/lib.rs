//! Plain data types shared between the skein workers on a node.
//!
//! The string encodings defined here are written into the shared cache
//! database, and workers of different versions may open the same database
//! within one workflow run. They are therefore part of the on-disk contract:
//! variants may be added, but existing encodings must never change meaning.
//! Values that do not parse are rejected at the database boundary instead of
//! being carried along.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
/// State of a file admitted to the node cache.
pub enum FileState {
    /// Being saved into the cache by its owner. Readers wait for `Cached`.
    /// Only the downloading worker may hold a reference to it.
    Downloading,
    /// Stored in the cache, owner is null. May be claimed for deletion by
    /// anyone once no non-mutable references remain.
    Cached,
    /// In the cache and not yet written back to the job store. Owned by the
    /// worker responsible for the upload.
    Uploading,
    /// Being removed from the cache by its owner; the row disappears once
    /// the on-disk bytes are gone.
    Deleting,
}
serde_plain::derive_display_from_serialize!(FileState);
serde_plain::derive_fromstr_from_deserialize!(FileState);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
/// State of one job's reference to a cached file.
pub enum RefState {
    /// A hardlink or symlink. The job promises not to modify the bytes, and
    /// the file's size counts against the job's disk reservation, crediting
    /// the cache with the same amount.
    Immutable,
    /// A mutable copy was promised but not produced yet. Keeps the file
    /// from being evicted until resolved.
    Copying,
    /// An independent copy, detached from the cache's accounting.
    Mutable,
}
serde_plain::derive_display_from_serialize!(RefState);
serde_plain::derive_fromstr_from_deserialize!(RefState);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// Recognized keys of the properties table.
pub enum CacheProperty {
    /// Total bytes the cache may occupy, seeded from the free space under
    /// the cache directory at first init.
    MaxSpace,
    /// 0/1: whether reading from the job store into the cache costs no
    /// additional disk (same filesystem, hardlinked reads).
    FreeCaching,
}

impl CacheProperty {
    pub fn name(self) -> &'static str {
        match self {
            CacheProperty::MaxSpace => "maxSpace",
            CacheProperty::FreeCaching => "freeCaching",
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
/// Handle to a global file in the job store.
///
/// The name is opaque and assigned by the job store; the size travels with
/// the handle so the cache can account for the bytes before they exist
/// locally.
pub struct FileId {
    name: String,
    size: u64,
}

impl FileId {
    pub fn new<N: Into<String>>(name: N, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Same file, corrected size. Used when the true size becomes known
    /// after the ID was handed out.
    pub fn with_size(self, size: u64) -> Self {
        Self { size, ..self }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
/// What the scheduler tells the cache about a job it is about to run.
pub struct JobDescription {
    /// Opaque job identifier, unique on this node.
    pub id: String,
    /// Bytes of scratch plus cache disk reserved for the job.
    pub disk: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
/// Read-only configuration the job store exposes to its consumers.
pub struct JobStoreConfig {
    pub workflow_id: String,
    /// Attempts never share a cache database, only a cache directory.
    pub workflow_attempt_number: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn file_state_encoding() {
        assert_eq!(FileState::Downloading.to_string(), "downloading");
        assert_eq!(FileState::Cached.to_string(), "cached");
        assert_eq!(FileState::Uploading.to_string(), "uploading");
        assert_eq!(FileState::Deleting.to_string(), "deleting");

        assert_eq!("cached".parse::<FileState>().unwrap(), FileState::Cached);
        assert!("evicted".parse::<FileState>().is_err());
        assert!("Cached".parse::<FileState>().is_err());
    }

    #[test]
    fn ref_state_encoding() {
        assert_eq!(RefState::Immutable.to_string(), "immutable");
        assert_eq!(RefState::Copying.to_string(), "copying");
        assert_eq!(RefState::Mutable.to_string(), "mutable");
        assert!("hardlink".parse::<RefState>().is_err());
    }

    #[test]
    fn property_names() {
        assert_eq!(CacheProperty::MaxSpace.name(), "maxSpace");
        assert_eq!(CacheProperty::FreeCaching.name(), "freeCaching");
    }

    #[test]
    fn file_id_size_stamp() {
        let id = FileId::new("abc123", 0);
        assert_eq!(id.size(), 0);
        let id = id.with_size(4096);
        assert_eq!(id.name(), "abc123");
        assert_eq!(id.size(), 4096);
        assert_eq!(id.to_string(), "abc123");
    }
}
