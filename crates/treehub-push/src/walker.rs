//! Repository walker and fingerprinter.
//!
//! A single thread traverses the repo, filters in `./objects/*`,
//! `./config*`, and `./refs/*`, computes the CRC-32C of each file, and
//! feeds the batch workers through a bounded queue.

use crate::{CancelFlag, PushError, WALK_QUEUE_SIZE};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io;
use std::path::Path;
use std::thread;
use treehub_core::{crc32c_file, is_repo_path, RepoFile};
use walkdir::WalkDir;

/// Pre-flight: the root must exist and contain a `config` regular file
/// and an `objects` subdirectory.
pub fn check_repo_dir(dir: &Path) -> Result<(), PushError> {
    if !dir.is_dir() {
        return Err(PushError::NotARepo(format!(
            "directory does not exist: {}",
            dir.display()
        )));
    }
    if !dir.join("config").is_file() {
        return Err(PushError::NotARepo(format!(
            "no config file in {}",
            dir.display()
        )));
    }
    if !dir.join("objects").is_dir() {
        return Err(PushError::NotARepo(format!(
            "no objects directory in {}",
            dir.display()
        )));
    }
    Ok(())
}

/// Spawn the walker thread. The returned queue closes when the walk
/// completes; an I/O error cancels the pipeline and is recorded on
/// `err_tx`.
pub(crate) fn walk_repo(
    repo: &Path,
    cancel: CancelFlag,
    err_tx: Sender<PushError>,
) -> Receiver<RepoFile> {
    let (tx, rx) = bounded(WALK_QUEUE_SIZE);
    let repo = repo.to_path_buf();
    thread::spawn(move || {
        if let Err(err) = walk_inner(&repo, &tx, &cancel) {
            cancel.cancel();
            let _ = err_tx.send(err);
        }
    });
    rx
}

fn walk_inner(
    repo: &Path,
    tx: &Sender<RepoFile>,
    cancel: &CancelFlag,
) -> Result<(), PushError> {
    for entry in WalkDir::new(repo) {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(repo)
            .map_err(|e| PushError::NotARepo(e.to_string()))?;
        let rel = format!("./{}", rel.display());
        if !is_repo_path(&rel) {
            continue;
        }
        let checksum = crc32c_file(entry.path())?;
        if tx.send(RepoFile::new(rel, checksum)).is_err() {
            // every consumer is gone; nothing left to feed
            return Ok(());
        }
    }
    Ok(())
}
