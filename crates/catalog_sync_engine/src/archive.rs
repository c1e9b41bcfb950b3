//! Zip extraction with a path-traversal guard.

use crate::error::{SyncError, SyncResult};
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tracing::debug;
use zip::ZipArchive;

/// Resolves an archive entry name to a path inside `dest`.
///
/// The name is normalized lexically: `.` is dropped and `..` pops a
/// component. Absolute names, drive prefixes and any `..` that climbs above
/// `dest` are rejected. Backslashes are treated as separators.
///
/// Returns `None` for names that resolve to `dest` itself.
///
/// # Errors
///
/// Returns [`SyncError::PathTraversal`] if the entry escapes `dest`.
pub fn safe_entry_path(dest: &Path, entry: &str) -> SyncResult<Option<PathBuf>> {
    let normalized = entry.replace('\\', "/");
    let reject = || SyncError::PathTraversal {
        entry: entry.to_string(),
    };

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return Err(reject()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(reject());
                }
            }
            Component::Normal(part) => parts.push(part),
        }
    }

    if parts.is_empty() {
        return Ok(None);
    }
    let mut path = dest.to_path_buf();
    path.extend(parts);
    Ok(Some(path))
}

/// Extracts a zip archive into `dest` and returns the files written.
///
/// Every entry name is checked before anything is written, so a rejected
/// entry leaves `dest` untouched.
///
/// # Errors
///
/// Returns [`SyncError::PathTraversal`] for an escaping entry, or an archive
/// or I/O error.
pub fn extract_archive(archive: &Path, dest: &Path) -> SyncResult<Vec<PathBuf>> {
    extract_archive_until(archive, dest, None)
}

/// Like [`extract_archive`], but stops before the next entry once `deadline`
/// has passed.
///
/// Nothing is written after this returns. Entries written before the deadline
/// stay in `dest` for the caller to discard.
///
/// # Errors
///
/// Returns [`SyncError::Timeout`] when the deadline passes mid-extraction,
/// plus the errors of [`extract_archive`].
pub fn extract_archive_until(
    archive: &Path,
    dest: &Path,
    deadline: Option<Instant>,
) -> SyncResult<Vec<PathBuf>> {
    let expired = || deadline.is_some_and(|deadline| Instant::now() >= deadline);
    let mut zip = ZipArchive::new(File::open(archive)?)?;

    let mut targets = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let entry = zip.by_index(index)?;
        let target = safe_entry_path(dest, entry.name())?;
        targets.push((target, entry.is_dir()));
    }

    if expired() {
        return Err(SyncError::Timeout);
    }
    fs::create_dir_all(dest)?;
    let mut written = Vec::new();
    for (index, (target, is_dir)) in targets.into_iter().enumerate() {
        let Some(target) = target else { continue };
        if expired() {
            debug!(
                archive = %archive.display(),
                files = written.len(),
                "extraction deadline passed"
            );
            return Err(SyncError::Timeout);
        }
        if is_dir {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut entry = zip.by_index(index)?;
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        written.push(target);
    }

    debug!(archive = %archive.display(), files = written.len(), "archive extracted");
    Ok(written)
}
