//! Shared data model and archive transport for the treehub sync pipeline.
//!
//! This crate provides the pieces both halves of the pipeline agree on:
//! `RepoFile` and the report types flowing through the bounded queues,
//! streaming CRC-32C fingerprinting, the PAX tape-archive encode/decode
//! that carries per-entry checksum sidebands, and the in-memory pipe used
//! to stream an archive into an HTTP request body.

pub mod archive;
pub mod checksum;
pub mod pipe;
pub mod repo;

pub use archive::{pack_repo, unpack_stream, CRC_PAX_RECORD};
pub use checksum::crc32c_file;
pub use pipe::{bounded_pipe, PipeReader, PipeWriter};
pub use repo::{
    bucket_key, is_repo_path, FileBatch, Report, RepoFile, SendReport, SyncReport, OBJECTS_PREFIX,
};

/// Maximum number of files checked per negotiation request.
pub const BATCH_MAX: usize = 500;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed archive: {0}")]
    Archive(String),
    #[error("unsupported archive entry '{path}'")]
    UnsupportedEntry { path: String },
}
