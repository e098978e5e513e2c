//! Steal work from the dead.
//!
//! Workers die mid-download, mid-upload, and mid-job. Any live worker that
//! is about to do something expensive first adopts whatever the dead left
//! behind, so the shared state converges no matter who crashes when. These
//! are free functions over the database handle because shutdown has to run
//! them without any store instance.

use std::path::Path;

use anyhow::Error;
use libc::pid_t;
use rusqlite::{params, OptionalExtension};

use crate::cache_db::CacheDb;
use crate::liveness::pid_is_alive;

/// Adopt files whose owning workers have died.
///
/// Files are reassigned per (owner, state):
/// - deleting: we finish the deletion.
/// - downloading: unfinishable, becomes ours to delete. Any references are
///   transient ones from the dead downloader and die with the file.
/// - uploading: the on-disk bytes are intact, and since the job store never
///   acknowledged the upload the dead job cannot have been committed, so
///   nobody depends on the stored copy. Mark it cached and unowned; it gets
///   re-uploaded if needed or evicted once unreferenced.
pub fn steal_work_from_the_dead(db: &mut CacheDb, pid: pid_t) -> Result<(), Error> {
    let owners: Vec<pid_t> = {
        let mut stmt = db
            .conn()
            .prepare("SELECT DISTINCT owner FROM files WHERE owner IS NOT NULL")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.collect::<Result<Vec<i64>, _>>()?
            .into_iter()
            .map(|p| p as pid_t)
            .collect()
    };

    for owner in owners {
        if pid_is_alive(owner) {
            continue;
        }
        log::info!("adopting cached files of dead worker {owner}");

        let tx = db.conn_mut().transaction()?;
        tx.execute(
            "UPDATE files SET owner = ?1 WHERE owner = ?2 AND state = 'deleting'",
            params![pid as i64, owner as i64],
        )?;
        tx.execute(
            "UPDATE files SET owner = ?1, state = 'deleting'
              WHERE owner = ?2 AND state = 'downloading'",
            params![pid as i64, owner as i64],
        )?;
        tx.execute(
            "UPDATE files SET owner = NULL, state = 'cached'
              WHERE owner = ?1 AND state = 'uploading'",
            params![owner as i64],
        )?;
        tx.commit()?;
    }
    Ok(())
}

/// Null out dead workers on their jobs, then adopt and clean up unowned
/// jobs one at a time.
///
/// Taking one job per claim instead of all of them lets concurrent
/// recovering workers share the cleanup.
pub fn remove_dead_jobs(db: &mut CacheDb, pid: pid_t) -> Result<(), Error> {
    let workers: Vec<pid_t> = {
        let mut stmt = db
            .conn()
            .prepare("SELECT DISTINCT worker FROM jobs WHERE worker IS NOT NULL")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.collect::<Result<Vec<i64>, _>>()?
            .into_iter()
            .map(|p| p as pid_t)
            .collect()
    };

    for worker in workers {
        if pid_is_alive(worker) {
            continue;
        }
        log::info!("releasing jobs of dead worker {worker}");
        db.conn().execute(
            "UPDATE jobs SET worker = NULL WHERE worker = ?1",
            params![worker as i64],
        )?;
    }

    loop {
        let candidate: Option<String> = db
            .conn()
            .query_row("SELECT id FROM jobs WHERE worker IS NULL LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        let Some(job_id) = candidate else {
            break;
        };

        db.conn().execute(
            "UPDATE jobs SET worker = ?1 WHERE id = ?2 AND worker IS NULL",
            params![pid as i64, &job_id],
        )?;

        // Re-read to confirm the claim stuck.
        let owned: Option<String> = db
            .conn()
            .query_row(
                "SELECT temp FROM jobs WHERE id = ?1 AND worker = ?2",
                params![&job_id, pid as i64],
                |row| row.get(0),
            )
            .optional()?;
        let Some(temp) = owned else {
            // Somebody else took it; try the next one.
            continue;
        };

        cleanup_job(db, &job_id, &temp)?;
    }
    Ok(())
}

/// Unlink a dead job's reference paths, drop its rows, remove its temp dir.
/// Missing files are fine here, the job is gone either way.
fn cleanup_job(db: &mut CacheDb, job_id: &str, temp: &str) -> Result<(), Error> {
    let paths: Vec<String> = {
        let mut stmt = db
            .conn()
            .prepare("SELECT path FROM refs WHERE job_id = ?1")?;
        let rows = stmt.query_map([job_id], |row| row.get(0))?;
        rows.collect::<Result<Vec<String>, _>>()?
    };
    for path in paths {
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("unable to remove reference {path:?} of dead job {job_id} - {err}");
            }
        }
    }
    db.conn()
        .execute("DELETE FROM refs WHERE job_id = ?1", params![job_id])?;

    if let Err(err) = std::fs::remove_dir_all(Path::new(temp)) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("unable to remove temp dir {temp:?} of dead job {job_id} - {err}");
        }
    }

    db.conn()
        .execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
    Ok(())
}
