//! Background saving: a copy-on-write snapshot of the keyspace
//! serialized on a dedicated thread, with the temp-file /
//! atomic-rename protocol of the foreground save.
//!
//! The synchronous step on the calling thread clones the dictionaries'
//! bucket arrays — pointer copies and reference-count bumps, no entry
//! data — so the request path never performs work proportional to the
//! dataset. The writer thread serializes the frozen view while the
//! live keyspace keeps mutating, copying individual chain nodes the
//! first time a write touches one the snapshot still shares. Every
//! post-spawn write lands only in the live keyspace. The caller keeps
//! the dirty counter captured at start and feeds it to
//! [`Store::note_save_complete`](crate::db::Store::note_save_complete)
//! once the save succeeds, so mutations racing the save stay counted.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime};

use tracing::{debug, warn};

use crate::db::Store;
use crate::snapshot::{
    SaveOptions, SaveReport, SnapshotError, temp_snapshot_path, write_snapshot_file,
};

/// Handle to a background save in flight.
pub struct BackgroundSave {
    handle: Option<JoinHandle<Result<SaveReport, SnapshotError>>>,
    started_wall: SystemTime,
    started: Instant,
    dirty_at_start: u64,
    temp_path: PathBuf,
    dest_path: PathBuf,
}

/// Takes a copy-on-write snapshot of the keyspace (bucket-array clone,
/// no entry data copied) and spawns the writer thread. The returned
/// handle resolves once the temp file has been written, fsynced, and
/// renamed into place.
pub fn spawn_background_save(
    store: &Store,
    dest: impl AsRef<Path>,
    options: &SaveOptions,
) -> Result<BackgroundSave, SnapshotError> {
    let dest_path = dest.as_ref().to_path_buf();
    let temp_path = temp_snapshot_path(dest_path.parent().unwrap_or_else(|| Path::new(".")));

    let databases = store.clone_databases();
    let dirty_at_start = store.dirty();
    let options = options.clone();

    let thread_temp = temp_path.clone();
    let thread_dest = dest_path.clone();
    let handle = std::thread::Builder::new()
        .name("snapshot-save".to_string())
        .spawn(move || write_snapshot_file(&thread_temp, &thread_dest, &databases, &options))
        .map_err(SnapshotError::Io)?;

    debug!(dest = %dest_path.display(), dirty_at_start, "background save started");
    Ok(BackgroundSave {
        handle: Some(handle),
        started_wall: SystemTime::now(),
        started: Instant::now(),
        dirty_at_start,
        temp_path,
        dest_path,
    })
}

impl BackgroundSave {
    /// Dirty counter captured when the save began; pass to
    /// [`Store::note_save_complete`](crate::db::Store::note_save_complete)
    /// on success.
    pub fn dirty_at_start(&self) -> u64 {
        self.dirty_at_start
    }

    /// Wall-clock time the save began.
    pub fn started_at(&self) -> SystemTime {
        self.started_wall
    }

    /// Path of the in-progress temp file.
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Final snapshot path.
    pub fn dest_path(&self) -> &Path {
        &self.dest_path
    }

    /// Whether the writer thread has exited (success or failure).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Blocks until the save finishes and returns its outcome. On
    /// failure the temp file stays on disk for later cleanup.
    pub fn wait(mut self) -> Result<SaveReport, SnapshotError> {
        let outcome = match self.handle.take() {
            None => Err(SnapshotError::Corrupt("save already reaped".into())),
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(SnapshotError::Corrupt("save thread panicked".into())),
            },
        };
        let elapsed = self.started.elapsed();
        match &outcome {
            Ok(report) => debug!(
                bytes = report.bytes_written,
                elapsed_ms = elapsed.as_millis() as u64,
                "background save finished"
            ),
            Err(e) => warn!(error = %e, "background save failed"),
        }
        outcome
    }

    /// Non-blocking reap: `None` while the writer is still running.
    pub fn try_wait(&mut self) -> Option<Result<SaveReport, SnapshotError>> {
        if !self.is_finished() {
            return None;
        }
        let handle = self.handle.take()?;
        Some(match handle.join() {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::Corrupt("save thread panicked".into())),
        })
    }
}
