//! Content-addressed package cache
//!
//! Layout under the cache root:
//!
//! ```text
//! packages/<identity>/<platform>-<arch>-blake3-<hash>/
//!     fetch/            fetched sources (persisted)
//!     work/stage/       staging workspace (ephemeral)
//!     work/install/     install output before commit (ephemeral)
//!     work/tmp/         scratch space (ephemeral)
//!     pkg/              the committed artifact tree
//!     envy-complete     completion marker, written last
//! recipes/<identity>/   same protocol, unkeyed by variant
//! bundles/<identity>/   same protocol, payload dir is asset/
//! locks/                one lock file per entry
//! ```
//!
//! The `envy-complete` marker is the single source of truth: when present,
//! the entry is usable with no lock. When absent, callers acquire the
//! entry's lock, re-check the marker (the previous holder may have
//! finished), clean any stale staging, and build.

pub mod lock;

use crate::error::{Error, Result};
use crate::identity::Identity;
use lock::EntryLock;
use std::path::{Path, PathBuf};

/// Name of the completion marker file.
pub const COMPLETE_MARKER: &str = "envy-complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Package,
    Recipe,
    Bundle,
}

impl EntryKind {
    pub fn subroot(&self) -> &'static str {
        match self {
            EntryKind::Package => "packages",
            EntryKind::Recipe => "recipes",
            EntryKind::Bundle => "bundles",
        }
    }

    /// Name of the committed payload directory inside an entry.
    pub fn payload(&self) -> &'static str {
        match self {
            EntryKind::Package | EntryKind::Recipe => "pkg",
            EntryKind::Bundle => "asset",
        }
    }
}

/// A completed cache entry, usable without holding any lock.
#[derive(Debug, Clone)]
pub struct CompleteEntry {
    pub entry_path: PathBuf,
    pub payload_path: PathBuf,
}

/// An exclusively-locked entry being populated. Dropping this without
/// calling `mark_complete` abandons the entry: staging residue is left
/// for the next acquirer to clean, while `fetch/` survives for reuse.
pub struct LockedEntry {
    _lock: EntryLock,
    kind: EntryKind,
    pub entry_path: PathBuf,
    pub fetch_path: PathBuf,
    pub stage_path: PathBuf,
    pub install_path: PathBuf,
    pub tmp_path: PathBuf,
}

/// Outcome of `ensure_*`: either the entry is already complete, or the
/// caller now holds the build lock.
pub enum Outcome {
    FastPath(CompleteEntry),
    Locked(LockedEntry),
}

impl LockedEntry {
    pub fn payload_path(&self) -> PathBuf {
        self.entry_path.join(self.kind.payload())
    }

    /// Commit the entry: atomically promote `work/install` to the payload
    /// directory, drop the ephemeral workspace, write the completion
    /// marker, and release the lock.
    ///
    /// The promotion is a single directory rename, so observers never see
    /// a partially-populated payload.
    pub fn mark_complete(self) -> Result<CompleteEntry> {
        let payload = self.payload_path();

        fsync_dir(&self.entry_path);

        if self.install_path.exists() {
            if payload.exists() {
                std::fs::remove_dir_all(&payload).map_err(|e| {
                    Error::Cache(format!("remove stale payload {}: {}", payload.display(), e))
                })?;
            }
            std::fs::rename(&self.install_path, &payload).map_err(|e| {
                Error::Cache(format!(
                    "rename {} -> {}: {}",
                    self.install_path.display(),
                    payload.display(),
                    e
                ))
            })?;
        } else if !payload.exists() {
            return Err(Error::Cache(format!(
                "cannot complete {}: no install output and no payload",
                self.entry_path.display()
            )));
        }

        let work = self.entry_path.join("work");
        if work.exists() {
            std::fs::remove_dir_all(&work)?;
        }

        let marker = self.entry_path.join(COMPLETE_MARKER);
        std::fs::write(&marker, b"")?;
        fsync_dir(&self.entry_path);

        Ok(CompleteEntry {
            payload_path: payload,
            entry_path: self.entry_path,
        })
        // _lock drops here, releasing the file lock after the marker is
        // durable; waiters re-check the marker and take the fast path.
    }

    /// Delete the whole entry. User-managed installs leave nothing in the
    /// cache; their workspace exists only while the phases run.
    pub fn purge(self) -> Result<()> {
        if self.entry_path.exists() {
            std::fs::remove_dir_all(&self.entry_path)?;
        }
        Ok(())
    }

    /// Write the fetch sub-marker: a fully-verified fetch phase persists
    /// across rebuilds of the same entry.
    pub fn mark_fetch_complete(&self) -> Result<()> {
        std::fs::write(self.fetch_path.join(COMPLETE_MARKER), b"")?;
        fsync_dir(&self.fetch_path);
        Ok(())
    }

    pub fn fetch_is_complete(&self) -> bool {
        self.fetch_path.join(COMPLETE_MARKER).exists()
    }
}

/// The on-disk cache store rooted at one directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    platform_arch: String,
}

impl CacheStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            platform_arch: crate::platform::platform_arch(),
        }
    }

    #[cfg(test)]
    pub fn with_platform_arch(root: PathBuf, platform_arch: &str) -> Self {
        Self {
            root,
            platform_arch: platform_arch.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn platform_arch(&self) -> &str {
        &self.platform_arch
    }

    /// Variant directory name for a package instance.
    pub fn variant_dir_name(&self, variant_hash: &str) -> String {
        format!("{}-blake3-{}", self.platform_arch, variant_hash)
    }

    pub fn package_entry_path(&self, identity: &Identity, variant_hash: &str) -> PathBuf {
        self.root
            .join(EntryKind::Package.subroot())
            .join(identity.to_string())
            .join(self.variant_dir_name(variant_hash))
    }

    /// Ensure a package entry for one `(identity, variant)` pair.
    pub fn ensure_package(&self, identity: &Identity, variant_hash: &str) -> Result<Outcome> {
        let variant = self.variant_dir_name(variant_hash);
        self.ensure(EntryKind::Package, &identity.to_string(), Some(&variant))
    }

    pub fn ensure_recipe(&self, identity: &Identity) -> Result<Outcome> {
        self.ensure(EntryKind::Recipe, &identity.to_string(), None)
    }

    pub fn ensure_bundle(&self, identity: &Identity) -> Result<Outcome> {
        self.ensure(EntryKind::Bundle, &identity.to_string(), None)
    }

    fn entry_path(&self, kind: EntryKind, identity: &str, variant: Option<&str>) -> PathBuf {
        let base = self.root.join(kind.subroot()).join(identity);
        match variant {
            Some(v) => base.join(v),
            None => base,
        }
    }

    /// Lock file name, derived from the entry path components so package,
    /// recipe, and bundle locks never collide.
    fn lock_path(&self, kind: EntryKind, identity: &str, variant: Option<&str>) -> PathBuf {
        let name = match variant {
            Some(v) => format!("{}.{}.{}.lock", kind.subroot(), identity, v),
            None => format!("{}.{}.lock", kind.subroot(), identity),
        };
        self.root.join("locks").join(name)
    }

    fn ensure(&self, kind: EntryKind, identity: &str, variant: Option<&str>) -> Result<Outcome> {
        let entry_path = self.entry_path(kind, identity, variant);
        let marker = entry_path.join(COMPLETE_MARKER);

        // Fast path: the marker is the single source of truth.
        if marker.exists() {
            return Ok(Outcome::FastPath(CompleteEntry {
                payload_path: entry_path.join(kind.payload()),
                entry_path,
            }));
        }

        let lock = EntryLock::acquire(&self.lock_path(kind, identity, variant))?;

        // Double-check under the lock: the previous holder may have
        // committed while we were blocked. This collapses stampedes into
        // exactly one build.
        if marker.exists() {
            return Ok(Outcome::FastPath(CompleteEntry {
                payload_path: entry_path.join(kind.payload()),
                entry_path,
            }));
        }

        // Clean stale staging from a crashed builder. fetch/ survives so
        // verified downloads are not repeated.
        let work = entry_path.join("work");
        if work.exists() {
            std::fs::remove_dir_all(&work)?;
        }
        let payload = entry_path.join(kind.payload());
        if payload.exists() {
            // Payload without marker: crashed between rename and marker.
            std::fs::remove_dir_all(&payload)?;
        }

        let fetch_path = entry_path.join("fetch");
        let stage_path = entry_path.join("work").join("stage");
        let install_path = entry_path.join("work").join("install");
        let tmp_path = entry_path.join("work").join("tmp");
        for dir in [&fetch_path, &stage_path, &install_path, &tmp_path] {
            std::fs::create_dir_all(dir)?;
        }

        Ok(Outcome::Locked(LockedEntry {
            _lock: lock,
            kind,
            entry_path,
            fetch_path,
            stage_path,
            install_path,
            tmp_path,
        }))
    }

    /// All committed variant directories for one package identity.
    pub fn package_variants(&self, identity: &Identity) -> Result<Vec<PathBuf>> {
        let dir = self
            .root
            .join(EntryKind::Package.subroot())
            .join(identity.to_string());
        let mut variants = Vec::new();
        if !dir.exists() {
            return Ok(variants);
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && path.join(COMPLETE_MARKER).exists() {
                variants.push(path);
            }
        }
        variants.sort();
        Ok(variants)
    }
}

/// Flush directory metadata so the rename-then-marker sequence is ordered
/// on disk. Directory fsync is a no-op on Windows.
#[cfg(unix)]
fn fsync_dir(path: &Path) {
    if let Ok(dir) = std::fs::File::open(path) {
        let _ = dir.sync_all();
    }
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> CacheStore {
        CacheStore::with_platform_arch(temp.path().to_path_buf(), "linux-x86_64")
    }

    fn test_identity() -> Identity {
        "local.x@v1".parse().unwrap()
    }

    const HASH: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_first_ensure_takes_slow_path() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        match store.ensure_package(&test_identity(), HASH).unwrap() {
            Outcome::Locked(entry) => {
                assert!(entry.fetch_path.exists());
                assert!(entry.stage_path.exists());
                assert!(entry.install_path.exists());
                assert!(entry.tmp_path.exists());
                assert!(entry
                    .entry_path
                    .to_string_lossy()
                    .contains("linux-x86_64-blake3-"));
            }
            Outcome::FastPath(_) => panic!("clean cache must not fast-path"),
        }
    }

    #[test]
    fn test_complete_then_fast_path() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let identity = test_identity();

        let entry = match store.ensure_package(&identity, HASH).unwrap() {
            Outcome::Locked(e) => e,
            Outcome::FastPath(_) => panic!("expected slow path"),
        };
        fs::write(entry.install_path.join("hello"), "hello").unwrap();
        let complete = entry.mark_complete().unwrap();
        assert!(complete.payload_path.join("hello").exists());
        assert!(complete.entry_path.join(COMPLETE_MARKER).exists());
        assert!(!complete.entry_path.join("work").exists());

        // Second ensure is a fast path with the same pkg path.
        match store.ensure_package(&identity, HASH).unwrap() {
            Outcome::FastPath(fp) => {
                assert_eq!(fp.payload_path, complete.payload_path);
            }
            Outcome::Locked(_) => panic!("completed entry must fast-path"),
        }

        // Exactly one marker under the variant dir.
        let markers: Vec<_> = walkdir::WalkDir::new(&complete.entry_path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_str() == Some(COMPLETE_MARKER))
            .collect();
        assert_eq!(markers.len(), 1);
    }

    #[test]
    fn test_abandon_leaves_no_marker_and_recovers() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let identity = test_identity();

        // Simulate a crash: populate staging, then drop without commit.
        let (stale_file, entry_path) = match store.ensure_package(&identity, HASH).unwrap() {
            Outcome::Locked(entry) => {
                fs::write(entry.install_path.join("partial"), "half").unwrap();
                (entry.install_path.join("partial"), entry.entry_path.clone())
            }
            Outcome::FastPath(_) => panic!("expected slow path"),
        };
        assert!(stale_file.exists());
        assert!(!entry_path.join(COMPLETE_MARKER).exists());

        // Next acquirer cleans the stale work/ tree and restarts.
        match store.ensure_package(&identity, HASH).unwrap() {
            Outcome::Locked(entry) => {
                assert!(!entry.install_path.join("partial").exists());
                fs::write(entry.install_path.join("hello"), "hello").unwrap();
                let complete = entry.mark_complete().unwrap();
                assert!(complete.payload_path.join("hello").exists());
            }
            Outcome::FastPath(_) => panic!("incomplete entry must not fast-path"),
        }
    }

    #[test]
    fn test_stale_payload_without_marker_is_cleaned() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let identity = test_identity();

        // Fabricate a crash between payload rename and marker write.
        let entry_path = store.package_entry_path(&identity, HASH);
        fs::create_dir_all(entry_path.join("pkg")).unwrap();
        fs::write(entry_path.join("pkg").join("old"), "old").unwrap();

        match store.ensure_package(&identity, HASH).unwrap() {
            Outcome::Locked(entry) => {
                assert!(!entry.payload_path().exists());
                drop(entry);
            }
            Outcome::FastPath(_) => panic!("marker absent, must not fast-path"),
        }
    }

    #[test]
    fn test_fetch_survives_abandon() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let identity = test_identity();

        match store.ensure_package(&identity, HASH).unwrap() {
            Outcome::Locked(entry) => {
                fs::write(entry.fetch_path.join("src.tar.gz"), "bytes").unwrap();
                entry.mark_fetch_complete().unwrap();
            }
            Outcome::FastPath(_) => panic!("expected slow path"),
        };

        match store.ensure_package(&identity, HASH).unwrap() {
            Outcome::Locked(entry) => {
                assert!(entry.fetch_path.join("src.tar.gz").exists());
                assert!(entry.fetch_is_complete());
            }
            Outcome::FastPath(_) => panic!("expected slow path"),
        }
    }

    #[test]
    fn test_purge_removes_entry() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let identity = test_identity();

        let entry = match store.ensure_package(&identity, HASH).unwrap() {
            Outcome::Locked(e) => e,
            Outcome::FastPath(_) => panic!("expected slow path"),
        };
        let path = entry.entry_path.clone();
        entry.purge().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_recipe_and_bundle_lock_names_disjoint() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let identity = test_identity();

        let pkg = store.lock_path(
            EntryKind::Package,
            &identity.to_string(),
            Some("linux-x86_64-blake3-00"),
        );
        let recipe = store.lock_path(EntryKind::Recipe, &identity.to_string(), None);
        let bundle = store.lock_path(EntryKind::Bundle, &identity.to_string(), None);
        assert_ne!(pkg, recipe);
        assert_ne!(recipe, bundle);
        assert!(recipe.file_name().unwrap().to_string_lossy().starts_with("recipes."));
    }

    #[test]
    fn test_bundle_payload_is_asset() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let identity = test_identity();

        let entry = match store.ensure_bundle(&identity).unwrap() {
            Outcome::Locked(e) => e,
            Outcome::FastPath(_) => panic!("expected slow path"),
        };
        fs::write(entry.install_path.join("lib.lua"), "return {}").unwrap();
        let complete = entry.mark_complete().unwrap();
        assert!(complete.payload_path.ends_with("asset"));
        assert!(complete.payload_path.join("lib.lua").exists());
    }

    #[test]
    fn test_package_variants_lists_only_complete() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let identity = test_identity();

        let other_hash = "f".repeat(64);
        match store.ensure_package(&identity, HASH).unwrap() {
            Outcome::Locked(entry) => {
                fs::write(entry.install_path.join("a"), "a").unwrap();
                entry.mark_complete().unwrap();
            }
            Outcome::FastPath(_) => panic!(),
        }
        match store.ensure_package(&identity, &other_hash).unwrap() {
            Outcome::Locked(entry) => drop(entry), // abandoned, incomplete
            Outcome::FastPath(_) => panic!(),
        }

        let variants = store.package_variants(&identity).unwrap();
        assert_eq!(variants.len(), 1);
        assert!(variants[0].to_string_lossy().contains(HASH));
    }
}
