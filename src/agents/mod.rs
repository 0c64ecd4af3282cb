//! The three agent roles and the shared streaming runner.
//!
//! Architect, Engineer, and Verifier are not a hierarchy: each is a module
//! owning its message assembly and output parsing, and all three execute
//! through [`runner::AgentRunner`].

pub mod architect;
pub mod engineer;
pub mod runner;
pub mod verifier;

use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Architect,
    Engineer,
    Verifier,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Architect => "architect",
            AgentKind::Engineer => "engineer",
            AgentKind::Verifier => "verifier",
        }
    }

    /// Output ceiling used when neither the call nor the provider config
    /// sets one. The Engineer emits whole codebases as JSON and needs the
    /// larger budget.
    pub fn default_max_tokens(&self) -> u32 {
        match self {
            AgentKind::Engineer => 16_384,
            AgentKind::Architect | AgentKind::Verifier => 8_192,
        }
    }
}

/// File extensions never worth feeding back to a model.
const BINARY_EXTENSIONS: &[&str] = &[
    "pyc", "pyo", "so", "dll", "exe", "bin", "png", "jpg", "jpeg", "gif", "ico", "woff",
    "woff2", "ttf", "eot", "zip", "tar", "gz",
];

const MAX_LISTED_FILE_BYTES: u64 = 50_000;

/// Read the staging tree into a path → content map for agent context.
/// Binary and oversized files are represented by placeholders; the manifest
/// sentinel is excluded. BTreeMap keeps prompt assembly deterministic.
pub fn collect_code_listing(staging: &Path) -> BTreeMap<String, String> {
    let mut listing = BTreeMap::new();
    collect_into(staging, staging, &mut listing);
    listing
}

fn collect_into(root: &Path, dir: &Path, listing: &mut BTreeMap<String, String>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else { continue };
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            collect_into(root, &path, listing);
            continue;
        }
        let name = entry.file_name();
        if name == crate::state::MANIFEST_FILE {
            continue;
        }
        let relative = match path.strip_prefix(root) {
            Ok(relative) => relative.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        if BINARY_EXTENSIONS.contains(&extension.as_str()) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > MAX_LISTED_FILE_BYTES {
            listing.insert(relative, format!("[File too large: {size} bytes]"));
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                listing.insert(relative, content);
            }
            Err(_) => {
                listing.insert(relative, "[Binary or unreadable file]".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_kind_names_and_budgets() {
        assert_eq!(AgentKind::Architect.as_str(), "architect");
        assert_eq!(AgentKind::Engineer.default_max_tokens(), 16_384);
        assert_eq!(AgentKind::Verifier.default_max_tokens(), 8_192);
    }

    #[test]
    fn test_code_listing_skips_manifest_and_binaries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("main.py"), "print('x')").unwrap();
        std::fs::write(dir.path().join("src/util.py"), "y = 1").unwrap();
        std::fs::write(dir.path().join(".manifest.json"), "{}").unwrap();
        std::fs::write(dir.path().join("logo.png"), [0u8, 1, 2]).unwrap();

        let listing = collect_code_listing(dir.path());
        assert_eq!(listing.len(), 2);
        assert_eq!(listing["main.py"], "print('x')");
        assert_eq!(listing["src/util.py"], "y = 1");
    }

    #[test]
    fn test_code_listing_caps_large_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(60_000)).unwrap();
        let listing = collect_code_listing(dir.path());
        assert!(listing["big.txt"].starts_with("[File too large:"));
    }
}
