//! Abstract bucket interface backing the hub, plus the file-backed
//! implementation.
//!
//! The uploader pool only needs two operations: object attributes keyed
//! by name, and a streaming write with optional server-side CRC-32C
//! verification. A cloud bucket client plugs in behind the same trait;
//! the handle is constructed once at startup and shared as
//! `Arc<dyn Bucket>` across all workers.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("checksum mismatch for '{key}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: u32,
        actual: u32,
    },
    #[error("bucket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server-side attributes of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAttrs {
    pub crc32c: u32,
    pub size: u64,
}

pub trait Bucket: Send + Sync {
    /// Attributes of the object at `key`, or [`BucketError::NotFound`].
    fn attrs(&self, key: &str) -> Result<ObjectAttrs, BucketError>;

    /// Stream `body` into the object at `key`, returning the byte count.
    /// A nonzero `expected_crc32c` arms server-side verification: on
    /// mismatch the write fails and any existing object is left intact.
    fn write(
        &self,
        key: &str,
        body: &mut dyn Read,
        expected_crc32c: u32,
    ) -> Result<u64, BucketError>;
}

/// File-backed bucket: objects live under a root directory, keys map to
/// relative paths, attributes are computed from the stored bytes. Writes
/// are atomic via a temp file renamed into place.
pub struct FsBucket {
    root: PathBuf,
}

impl FsBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, BucketError> {
        let mut rel = PathBuf::new();
        for component in Path::new(key).components() {
            match component {
                Component::Normal(part) => rel.push(part),
                Component::CurDir => {}
                _ => return Err(BucketError::InvalidKey(key.to_owned())),
            }
        }
        if rel.as_os_str().is_empty() {
            return Err(BucketError::InvalidKey(key.to_owned()));
        }
        Ok(self.root.join(rel))
    }
}

impl Bucket for FsBucket {
    fn attrs(&self, key: &str) -> Result<ObjectAttrs, BucketError> {
        let path = self.object_path(key)?;
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BucketError::NotFound(key.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut buf = [0u8; 64 * 1024];
        let mut crc = 0u32;
        let mut size = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            crc = crc32c::crc32c_append(crc, &buf[..n]);
            size += n as u64;
        }
        Ok(ObjectAttrs { crc32c: crc, size })
    }

    fn write(
        &self,
        key: &str,
        body: &mut dyn Read,
        expected_crc32c: u32,
    ) -> Result<u64, BucketError> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&self.root)?;

        let mut tmp = NamedTempFile::new_in(&self.root)?;
        let mut buf = [0u8; 64 * 1024];
        let mut crc = 0u32;
        let mut size = 0u64;
        loop {
            let n = body.read(&mut buf)?;
            if n == 0 {
                break;
            }
            crc = crc32c::crc32c_append(crc, &buf[..n]);
            size += n as u64;
            tmp.write_all(&buf[..n])?;
        }

        if expected_crc32c != 0 && crc != expected_crc32c {
            return Err(BucketError::ChecksumMismatch {
                key: key.to_owned(),
                expected: expected_crc32c,
                actual: crc,
            });
        }

        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| BucketError::Io(e.error))?;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bucket() -> (tempfile::TempDir, FsBucket) {
        let dir = tempfile::tempdir().unwrap();
        let bucket = FsBucket::new(dir.path());
        (dir, bucket)
    }

    #[test]
    fn write_and_attrs_roundtrip() {
        let (_dir, bucket) = test_bucket();
        let payload = b"object payload";
        let crc = crc32c::crc32c(payload);

        let size = bucket
            .write("treehub/lmp/ab/cd", &mut &payload[..], crc)
            .unwrap();
        assert_eq!(size, payload.len() as u64);

        let attrs = bucket.attrs("treehub/lmp/ab/cd").unwrap();
        assert_eq!(attrs.crc32c, crc);
        assert_eq!(attrs.size, payload.len() as u64);
    }

    #[test]
    fn attrs_of_missing_object_is_not_found() {
        let (_dir, bucket) = test_bucket();
        assert!(matches!(
            bucket.attrs("treehub/lmp/missing"),
            Err(BucketError::NotFound(_))
        ));
    }

    #[test]
    fn mismatched_checksum_rejects_the_write() {
        let (_dir, bucket) = test_bucket();
        let result = bucket.write("treehub/lmp/ab", &mut &b"payload"[..], 0xDEAD_BEEF);
        assert!(matches!(result, Err(BucketError::ChecksumMismatch { .. })));
        assert!(matches!(
            bucket.attrs("treehub/lmp/ab"),
            Err(BucketError::NotFound(_))
        ));
    }

    #[test]
    fn rejected_write_leaves_existing_object_intact() {
        let (dir, bucket) = test_bucket();
        let original = b"original";
        bucket
            .write("k/obj", &mut &original[..], crc32c::crc32c(original))
            .unwrap();

        let result = bucket.write("k/obj", &mut &b"corrupted"[..], 0x1234_5678);
        assert!(result.is_err());
        assert_eq!(fs::read(dir.path().join("k/obj")).unwrap(), original);
    }

    #[test]
    fn zero_expected_crc_skips_verification() {
        let (_dir, bucket) = test_bucket();
        bucket.write("k/unverified", &mut &b"anything"[..], 0).unwrap();
        let attrs = bucket.attrs("k/unverified").unwrap();
        assert_eq!(attrs.crc32c, crc32c::crc32c(b"anything"));
    }

    #[test]
    fn nested_keys_create_directories() {
        let (dir, bucket) = test_bucket();
        bucket.write("a/b/c/d/object", &mut &b"x"[..], 0).unwrap();
        assert!(dir.path().join("a/b/c/d/object").is_file());
    }

    #[test]
    fn traversal_keys_are_rejected() {
        let (_dir, bucket) = test_bucket();
        assert!(matches!(
            bucket.attrs("../escape"),
            Err(BucketError::InvalidKey(_))
        ));
        assert!(matches!(
            bucket.write("/abs/path", &mut &b"x"[..], 0),
            Err(BucketError::InvalidKey(_))
        ));
        assert!(matches!(
            bucket.write("", &mut &b"x"[..], 0),
            Err(BucketError::InvalidKey(_))
        ));
    }

    #[test]
    fn overwrite_replaces_content_and_attrs() {
        let (_dir, bucket) = test_bucket();
        bucket.write("k/o", &mut &b"one"[..], 0).unwrap();
        bucket.write("k/o", &mut &b"two-two"[..], 0).unwrap();
        let attrs = bucket.attrs("k/o").unwrap();
        assert_eq!(attrs.size, 7);
        assert_eq!(attrs.crc32c, crc32c::crc32c(b"two-two"));
    }
}
