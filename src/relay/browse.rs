//! Read-only directory listing for `file_browse` requests.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::models::outbound::DirEntry;
use crate::{AppError, Result};

/// Maximum entries returned for one directory (parent entry excluded).
pub const MAX_ENTRIES: usize = 1000;

/// Name used for the parent-directory entry.
pub const PARENT_ENTRY: &str = "..";

/// List `dir`: directories before files, each group sorted by name, hidden
/// (dot-prefixed) entries excluded, and a parent entry first unless `dir`
/// is a filesystem root.
///
/// # Errors
///
/// Returns [`AppError::Browse`] if the directory cannot be read.
pub async fn list_directory(dir: &Path) -> Result<Vec<DirEntry>> {
    let mut reader = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| AppError::Browse(format!("cannot read {}: {err}", dir.display())))?;

    let mut entries = Vec::new();
    loop {
        let entry = match reader.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                return Err(AppError::Browse(format!(
                    "cannot read {}: {err}",
                    dir.display()
                )));
            }
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }

        // Follow symlinks so linked directories browse like directories.
        let is_directory = match tokio::fs::metadata(entry.path()).await {
            Ok(meta) => meta.is_dir(),
            Err(_) => entry.file_type().await.is_ok_and(|t| t.is_dir()),
        };

        entries.push(DirEntry {
            name,
            path: entry.path().to_string_lossy().into_owned(),
            is_directory,
        });
    }

    sort_entries(&mut entries);
    if entries.len() > MAX_ENTRIES {
        debug!(dir = %dir.display(), total = entries.len(), "truncating directory listing");
        entries.truncate(MAX_ENTRIES);
    }

    if let Some(parent) = dir.parent() {
        entries.insert(
            0,
            DirEntry {
                name: PARENT_ENTRY.to_owned(),
                path: parent.to_string_lossy().into_owned(),
                is_directory: true,
            },
        );
    }

    Ok(entries)
}

/// Directories first, then by name (byte order).
pub fn sort_entries(entries: &mut [DirEntry]) {
    entries.sort_by(|a, b| match (a.is_directory, b.is_directory) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });
}

/// Resolve the directory a `file_browse` request targets: explicit `path`,
/// else the working directory, else `fallback`. Relative paths are joined
/// onto `fallback`.
#[must_use]
pub fn resolve_browse_path(
    path: Option<&str>,
    working_directory: Option<&str>,
    fallback: &Path,
) -> PathBuf {
    let requested = path
        .filter(|p| !p.trim().is_empty())
        .or(working_directory.filter(|p| !p.trim().is_empty()));
    let resolved = match requested {
        Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
        Some(p) => fallback.join(p),
        None => fallback.to_path_buf(),
    };
    normalize_lexically(&resolved)
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if out.file_name().is_some() {
                    out.pop();
                } else if !out.has_root() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
