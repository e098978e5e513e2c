//! Crash scenarios: workers dying mid-download, mid-upload, and mid-job,
//! and the node-level shutdown that has to mop up after all of them.

use rusqlite::params;

use skein_api_types::FileId;
use skein_cache_store::{steal_work_from_the_dead, CacheStore};

mod common;
use common::{assert_owner_invariant, dead_pid, TestNode};

fn job(id: &str, disk: u64) -> skein_api_types::JobDescription {
    skein_api_types::JobDescription {
        id: id.to_string(),
        disk,
    }
}

#[test]
fn reader_takes_over_a_dead_download() {
    let node = TestNode::new();
    let mut worker = node.worker("worker-b");

    // Some other worker won the download for F2, inserted its row, and got
    // killed before any bytes arrived.
    let file_id = node.job_store.plant("F2", b"crash recovery bytes");
    let cache_path = worker.cached_file_path(&file_id);
    node.raw_db()
        .conn()
        .execute(
            "INSERT INTO files VALUES ('F2', ?1, 20, 'downloading', ?2)",
            params![cache_path.to_str().unwrap(), dead_pid()],
        )
        .unwrap();

    let dst = worker
        .with_job(&job("j2", 1 << 20), |store| {
            store.read_global_file(&file_id, None, true, false, false)
        })
        .unwrap();

    // The stale row was recovered and deleted, and this worker became the
    // new downloader.
    assert_eq!(std::fs::read(&dst).unwrap(), b"crash recovery bytes");
    assert!(worker.file_is_cached(&file_id).unwrap());
    assert_eq!(*node.job_store.read_calls.lock().unwrap(), [file_id.name()]);
    assert_owner_invariant(&node.raw_db());
}

#[test]
fn dead_upload_becomes_a_cached_file() {
    let node = TestNode::new();
    let mut worker = node.worker("worker-b");
    let mut db = node.raw_db();

    // A worker wrote F3 into the cache and died before uploading it.
    let file_id = FileId::new("F3", 11);
    let cache_path = worker.cached_file_path(&file_id);
    std::fs::write(&cache_path, b"local bytes").unwrap();
    db.conn()
        .execute(
            "INSERT INTO files VALUES ('F3', ?1, 11, 'uploading', ?2)",
            params![cache_path.to_str().unwrap(), dead_pid()],
        )
        .unwrap();

    steal_work_from_the_dead(&mut db, std::process::id() as i32).unwrap();

    // The on-disk bytes are intact and the job store never confirmed the
    // upload, so the file is simply cached now - and nobody uploads it on
    // the dead worker's behalf.
    let (state, owner): (String, Option<i64>) = db
        .conn()
        .query_row(
            "SELECT state, owner FROM files WHERE id = 'F3'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!((state.as_str(), owner), ("cached", None));
    assert_eq!(std::fs::read(&cache_path).unwrap(), b"local bytes");
    assert!(node.job_store.updated_files.lock().unwrap().is_empty());

    // Reads are served from the cache; the job store has no copy to give.
    let dst = worker
        .with_job(&job("j3", 1 << 20), |store| {
            store.read_global_file(&file_id, None, true, false, false)
        })
        .unwrap();
    assert_eq!(std::fs::read(&dst).unwrap(), b"local bytes");
    assert!(node.job_store.read_calls.lock().unwrap().is_empty());
}

#[test]
fn shutdown_cleans_up_after_dead_workers() {
    let node = TestNode::new();
    let cache_dir = {
        let worker = node.worker("worker-a");
        worker.cache_dir().to_path_buf()
    };

    // Two dead workers left jobs behind: temp dirs with scratch files and
    // tracked references scattered outside them.
    let db = node.raw_db();
    let stray_ref = node.dir.path().join("stray-ref.dat");
    std::fs::write(&stray_ref, b"leftover").unwrap();
    for n in 1..=2 {
        let temp = node.dir.path().join(format!("dead-job-{n}"));
        std::fs::create_dir(&temp).unwrap();
        std::fs::write(temp.join("scratch.dat"), b"scratch").unwrap();
        db.conn()
            .execute(
                "INSERT INTO jobs VALUES (?1, ?2, 100, ?3)",
                params![format!("dj{n}"), temp.to_str().unwrap(), dead_pid()],
            )
            .unwrap();
    }
    db.conn()
        .execute(
            "INSERT INTO refs VALUES (?1, 'F9', 'dj1', 'immutable')",
            params![stray_ref.to_str().unwrap()],
        )
        .unwrap();
    drop(db);

    CacheStore::shutdown(&cache_dir).unwrap();

    assert!(!node.dir.path().join("dead-job-1").exists());
    assert!(!node.dir.path().join("dead-job-2").exists());
    assert!(!stray_ref.exists());
    assert!(!cache_dir.exists());
}

#[test]
fn shutdown_tolerates_a_directory_without_a_database() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("cache-empty");
    std::fs::create_dir(&target).unwrap();
    CacheStore::shutdown(&target).unwrap();
    assert!(!target.exists());
}
