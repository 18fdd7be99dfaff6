//! Missing-set computation for the check endpoint.
//!
//! Every batch entry is compared against the bucket's server-side CRC at
//! its derived key; an entry is omitted only when the bucket already
//! holds a byte-identical copy. This is what makes a repeated push a
//! no-op. Bucket queries fan out over a bounded worker pool; the
//! response mapping is unordered. Query errors count as missing.

use crate::bucket::{Bucket, BucketError};
use crossbeam_channel::bounded;
use std::thread;
use treehub_core::{bucket_key, FileBatch, BATCH_MAX};
use tracing::{debug, warn};

/// The subset of `batch` the bucket does not already hold byte-identical.
pub fn missing_set(
    bucket: &dyn Bucket,
    prefix: &str,
    batch: &FileBatch,
    workers: usize,
) -> FileBatch {
    let (file_tx, file_rx) = bounded::<(String, u32)>(BATCH_MAX);
    let (miss_tx, miss_rx) = bounded::<(String, u32)>(BATCH_MAX);

    thread::scope(|s| {
        for _ in 0..workers.max(1) {
            let file_rx = file_rx.clone();
            let miss_tx = miss_tx.clone();
            s.spawn(move || {
                for (path, crc) in file_rx.iter() {
                    if needs_sync(bucket, prefix, &path, crc) {
                        let _ = miss_tx.send((path, crc));
                    }
                }
            });
        }
        drop(file_rx);
        drop(miss_tx);

        s.spawn(move || {
            for (path, crc) in batch {
                if file_tx.send((path.clone(), *crc)).is_err() {
                    break;
                }
            }
        });

        miss_rx.iter().collect()
    })
}

fn needs_sync(bucket: &dyn Bucket, prefix: &str, path: &str, crc: u32) -> bool {
    let key = bucket_key(prefix, path);
    match bucket.attrs(&key) {
        Ok(attrs) if attrs.crc32c == crc => false,
        Ok(attrs) => {
            debug!(
                "crc mismatch for {key}: declared {crc}, stored {}",
                attrs.crc32c
            );
            true
        }
        Err(BucketError::NotFound(_)) => true,
        Err(err) => {
            warn!("bucket query failed for {key}: {err}");
            true
        }
    }
}
