//! Path-safety rules for destructive filesystem operations.
//!
//! Every deletion the daemon performs flows through here. The rules are
//! hard requirements:
//!
//! 1. A destructive target must resolve (symlinks expanded) to a descendant
//!    of the owning project root; anything else is a `PathEscape`.
//! 2. Mount points are never removed.
//! 3. Symlinks are removed as the link, never followed; the link itself must
//!    sit inside the project.
//! 4. Permission errors are logged and skipped — no chmod, no retries.
//! 5. Deletion is bottom-up: files first, then empty directories.

use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::errors::TumblerError;

/// Canonicalize `path` and require it to be a descendant of `root` (or the
/// root itself). Returns the resolved path.
pub fn assert_within(root: &Path, path: &Path) -> Result<PathBuf, TumblerError> {
    let root_resolved = root
        .canonicalize()
        .map_err(|e| TumblerError::Internal(format!("cannot resolve root '{}': {e}", root.display())))?;
    let resolved = path.canonicalize().map_err(|e| {
        TumblerError::Internal(format!("cannot resolve '{}': {e}", path.display()))
    })?;
    if resolved == root_resolved || resolved.starts_with(&root_resolved) {
        Ok(resolved)
    } else {
        Err(TumblerError::PathEscape {
            path: path.display().to_string(),
            root: root_resolved.display().to_string(),
        })
    }
}

/// A symlink cannot be canonicalized without following it, so validate the
/// link *location*: resolved parent + file name must be inside the project.
fn link_location_within(root_resolved: &Path, link: &Path) -> bool {
    let Some(parent) = link.parent() else { return false };
    let Ok(parent_resolved) = parent.canonicalize() else { return false };
    let location = parent_resolved.join(link.file_name().unwrap_or_default());
    location == *root_resolved || location.starts_with(root_resolved)
}

#[cfg(unix)]
fn is_mount_point(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    let Ok(meta) = path.metadata() else { return false };
    let Some(parent) = path.parent() else { return true };
    let Ok(parent_meta) = parent.metadata() else { return false };
    meta.dev() != parent_meta.dev()
}

#[cfg(not(unix))]
fn is_mount_point(_path: &Path) -> bool {
    false
}

/// Clear the contents of `target`, which must be named in `allowed_names`
/// and live inside `root`. Returns (deleted, skipped) counts.
pub fn safe_clear_dir(
    root: &Path,
    target: &Path,
    allowed_names: &[&str],
) -> Result<(usize, usize), TumblerError> {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if !allowed_names.contains(&name) {
        error!(dir = name, "Refusing to clear: not in allowlist {allowed_names:?}");
        return Err(TumblerError::InvalidRequest(format!(
            "directory '{name}' is not clearable"
        )));
    }
    let resolved = assert_within(root, target)?;
    if !resolved.is_dir() {
        return Err(TumblerError::InvalidRequest(format!(
            "'{}' is not a directory",
            resolved.display()
        )));
    }
    if is_mount_point(&resolved) {
        error!(path = %resolved.display(), "Refusing to clear mount point");
        return Err(TumblerError::InvalidRequest(format!(
            "'{}' is a mount point",
            resolved.display()
        )));
    }

    let root_resolved = root
        .canonicalize()
        .map_err(|e| TumblerError::Internal(format!("cannot resolve root: {e}")))?;
    let mut deleted = 0;
    let mut skipped = 0;
    remove_children(&root_resolved, &resolved, &mut deleted, &mut skipped);
    Ok((deleted, skipped))
}

/// Delete the whole tree at `root` including the root directory itself.
/// Returns (deleted, skipped) counts.
pub fn safe_delete_tree(root: &Path) -> Result<(usize, usize), TumblerError> {
    if !root.exists() {
        return Ok((0, 0));
    }
    let resolved = root
        .canonicalize()
        .map_err(|e| TumblerError::Internal(format!("cannot resolve '{}': {e}", root.display())))?;
    if is_mount_point(&resolved) {
        error!(path = %resolved.display(), "Refusing to delete mount point");
        return Err(TumblerError::InvalidRequest(format!(
            "'{}' is a mount point",
            resolved.display()
        )));
    }

    let mut deleted = 0;
    let mut skipped = 0;
    remove_children(&resolved, &resolved, &mut deleted, &mut skipped);
    if let Err(e) = std::fs::remove_dir(&resolved) {
        warn!(path = %resolved.display(), skipped, "Project directory not empty after cleanup: {e}");
    }
    Ok((deleted, skipped))
}

/// Bottom-up removal of a directory's children. Never follows symlinks;
/// validates containment of every entry before unlinking.
fn remove_children(root_resolved: &Path, dir: &Path, deleted: &mut usize, skipped: &mut usize) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), "Cannot read directory, skipping: {e}");
            *skipped += 1;
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), "Cannot stat, skipping: {e}");
                *skipped += 1;
                continue;
            }
        };

        if file_type.is_symlink() {
            // Remove the link itself, never the target.
            if !link_location_within(root_resolved, &path) {
                warn!(path = %path.display(), "Skipping out-of-scope symlink");
                *skipped += 1;
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => *deleted += 1,
                Err(e) => {
                    warn!(path = %path.display(), "Could not delete symlink: {e}");
                    *skipped += 1;
                }
            }
        } else if file_type.is_dir() {
            if is_mount_point(&path) {
                warn!(path = %path.display(), "Skipping mount point");
                *skipped += 1;
                continue;
            }
            match assert_within(root_resolved, &path) {
                Ok(_) => {
                    remove_children(root_resolved, &path, deleted, skipped);
                    // Only succeeds once empty; non-empty means we skipped
                    // something inside, so leave it standing.
                    let _ = std::fs::remove_dir(&path);
                }
                Err(e) => {
                    warn!("Skipping out-of-scope directory: {e}");
                    *skipped += 1;
                }
            }
        } else {
            match assert_within(root_resolved, &path) {
                Ok(resolved) => match std::fs::remove_file(&resolved) {
                    Ok(()) => *deleted += 1,
                    Err(e) => {
                        warn!(path = %resolved.display(), "Could not delete: {e}");
                        *skipped += 1;
                    }
                },
                Err(e) => {
                    warn!("Skipping out-of-scope file: {e}");
                    *skipped += 1;
                }
            }
        }
    }
}
