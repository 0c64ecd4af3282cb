//! Archive construction and extraction with containment rules.
//!
//! Everything crossing the host/container boundary goes through here, under
//! two invariants: symlinks are never archived or extracted, and every
//! path must resolve inside its workspace root. Violations skip the entry
//! with a logged warning rather than failing the run.

use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::TumblerError;

/// Build an in-memory tar of the workspace contents, rooted so extraction
/// into `/workspace` recreates the project structure.
pub fn build_tar(workspace: &Path) -> Result<Vec<u8>, TumblerError> {
    let resolved_root = workspace.canonicalize().map_err(|e| {
        TumblerError::Internal(format!("cannot resolve workspace '{}': {e}", workspace.display()))
    })?;

    let mut files = Vec::new();
    let mut skipped = 0usize;
    collect_files(&resolved_root, &resolved_root, &mut files, &mut skipped);
    files.sort();

    let mut builder = tar::Builder::new(Vec::new());
    for relative in &files {
        let full = resolved_root.join(relative);
        builder
            .append_path_with_name(&full, relative)
            .map_err(|e| TumblerError::Internal(format!("tar append '{}': {e}", full.display())))?;
    }
    if skipped > 0 {
        info!(skipped, "Tar archive skipped symlinks/out-of-scope files");
    }
    builder
        .into_inner()
        .map_err(|e| TumblerError::Internal(format!("tar finalize: {e}")))
}

/// Recursive workspace walk. Does not follow symlinks; validates that every
/// candidate file resolves inside the workspace root.
fn collect_files(root: &Path, dir: &Path, files: &mut Vec<PathBuf>, skipped: &mut usize) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), "Cannot read directory for archive: {e}");
            *skipped += 1;
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            *skipped += 1;
            continue;
        };
        if file_type.is_symlink() {
            warn!(path = %path.display(), "Skipping symlink in archive");
            *skipped += 1;
            continue;
        }
        if file_type.is_dir() {
            collect_files(root, &path, files, skipped);
            continue;
        }
        match path.canonicalize() {
            Ok(resolved) if resolved.starts_with(root) => {
                if let Ok(relative) = resolved.strip_prefix(root) {
                    files.push(relative.to_path_buf());
                }
            }
            Ok(resolved) => {
                warn!(path = %path.display(), resolved = %resolved.display(),
                    "Skipping file outside workspace");
                *skipped += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), "Cannot resolve file for archive: {e}");
                *skipped += 1;
            }
        }
    }
}

/// Unpack a tar downloaded from a container back into the workspace.
///
/// The container archive is rooted at `workspace/`; that prefix is stripped.
/// Symlinks and hard links are skipped, as is any member whose destination
/// would land outside the workspace.
pub fn unpack_container_tar(bytes: &[u8], workspace: &Path) -> Result<usize, TumblerError> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut written = 0usize;

    let entries = archive
        .entries()
        .map_err(|e| TumblerError::Internal(format!("container tar read: {e}")))?;
    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable tar member: {e}");
                continue;
            }
        };

        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            debug!("Skipping link in container tar");
            continue;
        }

        let member_path = match entry.path() {
            Ok(path) => path.into_owned(),
            Err(e) => {
                warn!("Skipping tar member with bad path: {e}");
                continue;
            }
        };
        // Strip the "workspace/" root the container export carries.
        let Ok(relative) = member_path.strip_prefix("workspace").map(Path::to_path_buf) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        if !is_clean_relative(&relative) {
            warn!(path = %relative.display(), "Skipping path traversal in container tar");
            continue;
        }

        let dest = workspace.join(&relative);
        if kind.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::new();
        if let Err(e) = entry.read_to_end(&mut contents) {
            warn!(path = %relative.display(), "Skipping unreadable tar member: {e}");
            continue;
        }
        std::fs::write(&dest, contents)?;
        written += 1;
    }
    Ok(written)
}

/// A relative path with no `..`, no root, and no drive prefix.
pub fn is_clean_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Zip the staging tree into `dest`, honoring the same symlink-skip and
/// containment rules as the tar builder. The walk is sorted so identical
/// trees produce identical member order.
pub fn zip_dir(src: &Path, dest: &Path) -> Result<usize, TumblerError> {
    let resolved_root = src.canonicalize().map_err(|e| {
        TumblerError::Internal(format!("cannot resolve '{}': {e}", src.display()))
    })?;

    let mut files = Vec::new();
    let mut skipped = 0usize;
    collect_files(&resolved_root, &resolved_root, &mut files, &mut skipped);
    files.sort();

    let file = std::fs::File::create(dest)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for relative in &files {
        let name = relative.to_string_lossy().replace('\\', "/");
        writer
            .start_file(&name, options)
            .map_err(|e| TumblerError::Internal(format!("zip start '{name}': {e}")))?;
        let contents = std::fs::read(resolved_root.join(relative))?;
        writer.write_all(&contents)?;
    }
    writer
        .finish()
        .map_err(|e| TumblerError::Internal(format!("zip finalize: {e}")))?;

    if skipped > 0 {
        info!(skipped, "Zip archive skipped symlinks/out-of-scope files");
    }
    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_tar_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(Cursor::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_tar_contains_files_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("main.py"), "print('hi')").unwrap();
        std::fs::write(dir.path().join("src/util.py"), "x = 1").unwrap();

        let bytes = build_tar(dir.path()).unwrap();
        let names = read_tar_names(&bytes);
        assert!(names.contains(&"main.py".to_string()));
        assert!(names.contains(&"src/util.py".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_tar_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("real.txt"), "data").unwrap();
        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("sneaky")).unwrap();

        let bytes = build_tar(dir.path()).unwrap();
        let names = read_tar_names(&bytes);
        assert_eq!(names, vec!["real.txt"]);
    }

    #[test]
    fn test_tar_round_trip_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let content = "def main():\n    return 42\n";
        std::fs::write(dir.path().join("app.py"), content).unwrap();

        let bytes = build_tar(dir.path()).unwrap();
        let mut archive = tar::Archive::new(Cursor::new(bytes.as_slice()));
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut extracted = String::new();
        entry.read_to_string(&mut extracted).unwrap();
        assert_eq!(extracted, content);
    }

    #[test]
    fn test_unpack_container_tar_strips_prefix_and_blocks_traversal() {
        // Build a container-shaped tar by hand: workspace/ rooted members
        // plus a traversal attempt.
        let mut builder = tar::Builder::new(Vec::new());
        let add = |builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &str| {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_bytes()).unwrap();
        };
        add(&mut builder, "workspace/node_modules/pkg/index.js", "module.exports = 1");
        add(&mut builder, "workspace/../evil.txt", "bad");
        let bytes = builder.into_inner().unwrap();

        let dest = tempfile::tempdir().unwrap();
        let written = unpack_container_tar(&bytes, dest.path()).unwrap();
        assert_eq!(written, 1);
        assert!(dest.path().join("node_modules/pkg/index.js").exists());
        assert!(!dest.path().parent().unwrap().join("evil.txt").exists());
    }

    #[test]
    fn test_is_clean_relative() {
        assert!(is_clean_relative(Path::new("src/main.py")));
        assert!(is_clean_relative(Path::new("./src/main.py")));
        assert!(!is_clean_relative(Path::new("../escape.py")));
        assert!(!is_clean_relative(Path::new("/absolute.py")));
        assert!(!is_clean_relative(Path::new("a/../../b.py")));
        assert!(!is_clean_relative(Path::new("")));
    }

    #[test]
    fn test_zip_dir_deterministic_member_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/c.txt"), "c").unwrap();

        let out = tempfile::tempdir().unwrap();
        let zip_path = out.path().join("out.zip");
        let count = zip_dir(dir.path(), &zip_path).unwrap();
        assert_eq!(count, 3);

        let file = std::fs::File::open(&zip_path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let names: Vec<String> =
            (0..archive.len()).map(|i| archive.by_index(i).unwrap().name().to_string()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub/c.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_zip_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "k").unwrap();
        std::os::unix::fs::symlink("/etc/hosts", dir.path().join("link")).unwrap();

        let out = tempfile::tempdir().unwrap();
        let zip_path = out.path().join("out.zip");
        assert_eq!(zip_dir(dir.path(), &zip_path).unwrap(), 1);
    }
}
