//! Manifest discovery
//!
//! Walks from the starting directory toward the filesystem root looking
//! for `envy.lua`. A manifest that does not declare `root "false"`
//! terminates the walk; sub-manifests defer to their ancestors, and when
//! only sub-manifests exist the highest one wins.

use super::directives::Directives;
use crate::error::Result;
use std::path::{Path, PathBuf};

pub const MANIFEST_NAME: &str = "envy.lua";

/// Find the governing manifest for `start_dir`, or None.
pub fn discover_manifest(start_dir: &Path) -> Result<Option<PathBuf>> {
    let mut current = start_dir
        .canonicalize()
        .unwrap_or_else(|_| start_dir.to_path_buf());
    let mut highest_sub_manifest: Option<PathBuf> = None;

    loop {
        let candidate = current.join(MANIFEST_NAME);
        if candidate.is_file() {
            let text = std::fs::read_to_string(&candidate)?;
            let directives = Directives::parse(&text)?;
            if directives.is_root() {
                return Ok(Some(candidate));
            }
            highest_sub_manifest = Some(candidate);
        }

        match current.parent() {
            Some(parent) if parent != current => current = parent.to_path_buf(),
            _ => break,
        }
    }

    Ok(highest_sub_manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_in_cwd() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(MANIFEST_NAME), "PACKAGES = {}\n").unwrap();
        let found = discover_manifest(temp.path()).unwrap().unwrap();
        assert_eq!(found, temp.path().canonicalize().unwrap().join(MANIFEST_NAME));
    }

    #[test]
    fn test_walks_up_to_ancestor() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        fs::write(temp.path().join(MANIFEST_NAME), "PACKAGES = {}\n").unwrap();
        let found = discover_manifest(&nested).unwrap().unwrap();
        assert_eq!(found, temp.path().canonicalize().unwrap().join(MANIFEST_NAME));
    }

    #[test]
    fn test_sub_manifest_defers_to_root_ancestor() {
        let temp = TempDir::new().unwrap();
        let inner = temp.path().join("sub");
        fs::create_dir_all(&inner).unwrap();
        fs::write(
            inner.join(MANIFEST_NAME),
            "-- @envy root \"false\"\nPACKAGES = {}\n",
        )
        .unwrap();
        fs::write(temp.path().join(MANIFEST_NAME), "PACKAGES = {}\n").unwrap();

        let found = discover_manifest(&inner).unwrap().unwrap();
        assert_eq!(found, temp.path().canonicalize().unwrap().join(MANIFEST_NAME));
    }

    #[test]
    fn test_root_manifest_shadows_ancestors() {
        let temp = TempDir::new().unwrap();
        let inner = temp.path().join("sub");
        fs::create_dir_all(&inner).unwrap();
        fs::write(inner.join(MANIFEST_NAME), "PACKAGES = {}\n").unwrap();
        fs::write(temp.path().join(MANIFEST_NAME), "PACKAGES = {}\n").unwrap();

        let found = discover_manifest(&inner).unwrap().unwrap();
        assert_eq!(found, inner.canonicalize().unwrap().join(MANIFEST_NAME));
    }

    #[test]
    fn test_highest_sub_manifest_wins_without_root() {
        let temp = TempDir::new().unwrap();
        let mid = temp.path().join("mid");
        let leaf = mid.join("leaf");
        fs::create_dir_all(&leaf).unwrap();
        fs::write(
            leaf.join(MANIFEST_NAME),
            "-- @envy root \"false\"\nPACKAGES = {}\n",
        )
        .unwrap();
        fs::write(
            mid.join(MANIFEST_NAME),
            "-- @envy root \"false\"\nPACKAGES = {}\n",
        )
        .unwrap();

        let found = discover_manifest(&leaf).unwrap().unwrap();
        assert_eq!(found, mid.canonicalize().unwrap().join(MANIFEST_NAME));
    }

    #[test]
    fn test_no_manifest() {
        let temp = TempDir::new().unwrap();
        // A tempdir under /tmp has no envy.lua anywhere above it in
        // practice; guard against a polluted environment anyway.
        let result = discover_manifest(temp.path()).unwrap();
        if let Some(found) = result {
            assert!(!found.starts_with(temp.path()));
        }
    }
}
