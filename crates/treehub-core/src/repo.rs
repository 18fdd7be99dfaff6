use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Prefix of content-addressed object paths inside a repo.
pub const OBJECTS_PREFIX: &str = "./objects/";

/// Repo-relative prefixes eligible for sync. The match is a plain prefix
/// check, so `./config` also admits siblings like `./config.lock`.
pub const REPO_FILTER: [&str; 3] = ["./objects/", "./config", "./refs/"];

/// One file flowing through the pipeline: a repo-relative path (always
/// beginning with `./`) and its CRC-32C. A checksum of `0` means
/// "not computed / do not verify".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    pub path: String,
    pub checksum: u32,
}

impl RepoFile {
    pub fn new(path: impl Into<String>, checksum: u32) -> Self {
        Self {
            path: path.into(),
            checksum,
        }
    }

    /// Whether this entry is a content-addressed object (participates in
    /// bucket-side dedup) rather than a ref or config file.
    pub fn is_object(&self) -> bool {
        self.path.starts_with(OBJECTS_PREFIX)
    }
}

/// Whether a repo-relative path passes the sync filter.
pub fn is_repo_path(path: &str) -> bool {
    REPO_FILTER.iter().any(|prefix| path.starts_with(prefix))
}

/// A batch of files negotiated in one check request, and equally the
/// hub's missing-set response: `path -> crc32c`.
pub type FileBatch = HashMap<String, u32>;

/// Bucket object key for a repo path. `./objects/<sub>` keeps `<sub>`
/// under the prefix; every other path lands under the prefix with its
/// leading `./` stripped.
pub fn bucket_key(prefix: &str, path: &str) -> String {
    match path.strip_prefix("./objects/") {
        Some(sub) => format!("{prefix}/{sub}"),
        None => format!("{prefix}/{}", path.trim_start_matches("./")),
    }
}

/// Counters produced by the archiver, one per batch. Additive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReport {
    pub files: u64,
    pub objects: u64,
    pub bytes: u64,
}

impl SendReport {
    pub fn absorb(&mut self, other: &SendReport) {
        self.files += other.files;
        self.objects += other.objects;
        self.bytes += other.bytes;
    }
}

/// Counters returned by the hub for one archive upload. The JSON field
/// names are the wire contract; `uploaded` is the count of files the hub
/// routed toward the uploader, not the count actually written (kept for
/// wire compatibility).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub uploaded: u32,
    pub synced: u32,
    pub upload_synced: u32,
    pub sync_failed: u32,
}

impl SyncReport {
    pub fn absorb(&mut self, other: &SyncReport) {
        self.uploaded += other.uploaded;
        self.synced += other.synced;
        self.upload_synced += other.upload_synced;
        self.sync_failed += other.sync_failed;
    }
}

/// The client's terminal aggregate over a whole push.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub checked: u64,
    pub sent: SendReport,
    pub synced: SyncReport,
}
