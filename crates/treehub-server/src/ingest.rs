//! Ingest pipeline: unpack an archive stream into staging, fan entries
//! out over the uploader pool, and collate outcomes into a `SyncReport`.
//!
//! Stage queues are bounded: unpacker output 100, splitter count 1,
//! upload status `workers * 100`. The splitter forwards every entry and
//! reports the forwarded count, which becomes `uploaded` in the report
//! (kept for wire compatibility even though the name suggests bucket
//! writes). A malformed archive aborts the whole request; per-entry
//! upload failures only increment `sync_failed`.

use crate::bucket::{Bucket, BucketError};
use crate::HubError;
use crossbeam_channel::{bounded, Receiver, Select};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::thread;
use treehub_core::{bucket_key, unpack_stream, RepoFile, SyncReport};
use tracing::{debug, info, warn};

const UNPACK_QUEUE: usize = 100;
const STATUS_QUEUE_FACTOR: usize = 100;

/// Outcome of one uploader invocation.
#[derive(Debug)]
struct UploadStatus {
    path: String,
    existed: bool,
    error: Option<String>,
}

/// Unpack `body` into a fresh staging directory under `staging_root` and
/// upload every entry, returning the collated report. The staging
/// directory is removed when the request finishes.
pub fn ingest_archive(
    bucket: &dyn Bucket,
    prefix: &str,
    staging_root: &Path,
    body: &mut dyn Read,
    workers: usize,
) -> Result<SyncReport, HubError> {
    let staging = tempfile::tempdir_in(staging_root)?;
    let staging_path = staging.path();

    thread::scope(|s| {
        let (file_tx, file_rx) = bounded::<RepoFile>(UNPACK_QUEUE);
        let (upload_tx, upload_rx) = bounded::<RepoFile>(UNPACK_QUEUE);
        let (count_tx, count_rx) = bounded::<u32>(1);
        let (status_tx, status_rx) = bounded::<UploadStatus>(workers.max(1) * STATUS_QUEUE_FACTOR);

        // splitter: forward everything, report how many went through
        s.spawn(move || {
            let mut forwarded = 0u32;
            for file in file_rx.iter() {
                forwarded += 1;
                if upload_tx.send(file).is_err() {
                    break;
                }
            }
            let _ = count_tx.send(forwarded);
        });

        for _ in 0..workers.max(1) {
            let upload_rx = upload_rx.clone();
            let status_tx = status_tx.clone();
            s.spawn(move || {
                for file in upload_rx.iter() {
                    let _ = status_tx.send(upload_entry(bucket, prefix, staging_path, &file));
                }
            });
        }
        drop(upload_rx);
        drop(status_tx);

        let aggregator = s.spawn(move || aggregate(&count_rx, &status_rx));

        let unpacked = unpack_stream(body, staging_path, |file| file_tx.send(file).is_ok());
        drop(file_tx);

        let report = aggregator.join().unwrap_or_default();
        match unpacked {
            Ok(()) => Ok(report),
            Err(err) => Err(err.into()),
        }
    })
}

/// Collate upload outcomes; final once the status stream closes. The
/// splitter count may arrive at any point and sets `uploaded`.
fn aggregate(count_rx: &Receiver<u32>, status_rx: &Receiver<UploadStatus>) -> SyncReport {
    let mut report = SyncReport::default();

    let mut sel = Select::new();
    let op_count = sel.recv(count_rx);
    let op_status = sel.recv(status_rx);
    loop {
        let op = sel.select();
        match op.index() {
            i if i == op_count => match op.recv(count_rx) {
                Ok(forwarded) => report.uploaded = forwarded,
                Err(_) => sel.remove(op_count),
            },
            i if i == op_status => match op.recv(status_rx) {
                Ok(status) => {
                    report.synced += 1;
                    if !status.existed {
                        report.upload_synced += 1;
                    }
                    if let Some(err) = &status.error {
                        report.sync_failed += 1;
                        warn!("sync failed for {}: {err}", status.path);
                    }
                }
                Err(_) => return report,
            },
            _ => unreachable!("unknown select operation"),
        }
    }
}

/// One uploader step: dedup-check objects against the bucket, then
/// stream the staged file in with the declared CRC armed (when nonzero).
fn upload_entry(
    bucket: &dyn Bucket,
    prefix: &str,
    staging: &Path,
    file: &RepoFile,
) -> UploadStatus {
    let key = bucket_key(prefix, &file.path);

    if file.is_object() {
        match bucket.attrs(&key) {
            Ok(attrs) if attrs.crc32c == file.checksum => {
                debug!("already in bucket: {key}");
                return UploadStatus {
                    path: file.path.clone(),
                    existed: true,
                    error: None,
                };
            }
            Ok(attrs) => debug!(
                "stale object {key}: declared {}, stored {}",
                file.checksum, attrs.crc32c
            ),
            Err(BucketError::NotFound(_)) => {}
            Err(err) => warn!("bucket query failed for {key}, uploading anyway: {err}"),
        }
    }

    let src = staging.join(file.path.trim_start_matches("./"));
    let mut body = match File::open(&src) {
        Ok(f) => f,
        Err(err) => {
            return UploadStatus {
                path: file.path.clone(),
                existed: false,
                error: Some(err.to_string()),
            };
        }
    };

    match bucket.write(&key, &mut body, file.checksum) {
        Ok(size) => {
            info!("uploaded {size} bytes to {key}");
            UploadStatus {
                path: file.path.clone(),
                existed: false,
                error: None,
            }
        }
        Err(err) => UploadStatus {
            path: file.path.clone(),
            existed: false,
            error: Some(err.to_string()),
        },
    }
}
