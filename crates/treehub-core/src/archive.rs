//! PAX tape-archive transport with per-entry checksum sidebands.
//!
//! Every regular file is written as one entry whose name is the
//! repo-relative path (leading `./` retained) and whose PAX records carry
//! `FIO.ostree.CRC = <decimal u32>`. The decoder materializes entries
//! under a staging directory and re-emits `(path, declared_checksum)`;
//! an absent or unparsable record yields a declared checksum of `0`.

use crate::repo::{FileBatch, RepoFile, SendReport, OBJECTS_PREFIX};
use crate::CoreError;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

/// PAX record key carrying the content CRC-32C of an entry.
pub const CRC_PAX_RECORD: &str = "FIO.ostree.CRC";

/// Stream `files` from `repo_root` as a PAX archive into `out`.
///
/// Entry metadata is inherited from the local file. Directories in the
/// batch are tolerated and written as header-only entries. Returns the
/// `SendReport` for the batch once the archive terminator is written.
pub fn pack_repo<W: Write>(
    repo_root: &Path,
    files: &FileBatch,
    out: W,
) -> Result<SendReport, CoreError> {
    let mut ar = tar::Builder::new(out);
    ar.follow_symlinks(false);

    let mut report = SendReport::default();
    for (path, crc) in files {
        let full = repo_root.join(path);
        let meta = fs::metadata(&full)?;

        let record = crc.to_string();
        ar.append_pax_extensions([(CRC_PAX_RECORD, record.as_bytes())])?;

        if meta.is_dir() {
            ar.append_dir(path, &full)?;
            continue;
        }

        let mut src = File::open(&full)?;
        ar.append_file(path, &mut src)?;

        if path.starts_with(OBJECTS_PREFIX) {
            report.objects += 1;
        }
        report.files += 1;
        report.bytes += meta.len();
    }

    ar.into_inner()?.flush()?;
    Ok(report)
}

/// Decode an archive from `input`, materializing entries under `staging`.
///
/// Regular files are streamed to disk and handed to `sink` together with
/// their declared checksum; directories are created without emission; any
/// other entry type aborts the stream. `sink` returning `false` means the
/// downstream consumer hung up, which also aborts.
pub fn unpack_stream<R: Read>(
    input: R,
    staging: &Path,
    mut sink: impl FnMut(RepoFile) -> bool,
) -> Result<(), CoreError> {
    let mut ar = tar::Archive::new(input);
    let entries = ar
        .entries()
        .map_err(|e| CoreError::Archive(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| CoreError::Archive(e.to_string()))?;

        let name = String::from_utf8(entry.path_bytes().into_owned())
            .map_err(|_| CoreError::Archive("non-UTF-8 entry name".to_owned()))?;
        let rel = clean_entry_path(&name)
            .ok_or_else(|| CoreError::Archive(format!("entry '{name}' escapes staging dir")))?;
        let target = staging.join(rel);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&target)?;
            }
            tar::EntryType::Regular => {
                let declared = declared_crc(&mut entry);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut dst = File::create(&target)?;
                io::copy(&mut entry, &mut dst)?;
                if !sink(RepoFile::new(name, declared)) {
                    return Err(CoreError::Archive("downstream consumer closed".to_owned()));
                }
            }
            _ => return Err(CoreError::UnsupportedEntry { path: name }),
        }
    }
    Ok(())
}

/// The `FIO.ostree.CRC` record of an entry, or `0` when absent/unparsable.
fn declared_crc<R: Read>(entry: &mut tar::Entry<'_, R>) -> u32 {
    let Ok(Some(extensions)) = entry.pax_extensions() else {
        return 0;
    };
    for ext in extensions.flatten() {
        if ext.key() == Ok(CRC_PAX_RECORD) {
            return ext
                .value()
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }
    }
    0
}

/// Normalize an entry name to a path safe to join under the staging root.
/// Rejects absolute names and any `..` component.
fn clean_entry_path(name: &str) -> Option<PathBuf> {
    let mut rel = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if rel.as_os_str().is_empty() {
        None
    } else {
        Some(rel)
    }
}
