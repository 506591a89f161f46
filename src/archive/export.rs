//! Cache entry export and import
//!
//! An export archive is a zstd-compressed tar whose single top-level
//! directory is `pkg/` (exportable specs) or `fetch/` (everything else).
//! The filename carries the full cache coordinates:
//! `<identity>-<platform>-<arch>-blake3-<hash>.tar.zst`, which is also
//! the line format of depot manifests.

use crate::cache::{CacheStore, CompleteEntry, Outcome};
use crate::error::{Error, Result};
use crate::identity::Identity;
use std::path::{Path, PathBuf};

pub const ARCHIVE_EXTENSION: &str = ".tar.zst";

/// Parsed coordinates of an export archive filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveName {
    pub identity: Identity,
    pub platform: String,
    pub arch: String,
    pub hash: String,
}

impl ArchiveName {
    pub fn new(identity: &Identity, platform_arch: &str, hash: &str) -> Result<Self> {
        let (platform, arch) = platform_arch.split_once('-').ok_or_else(|| {
            Error::Interface(format!("malformed platform-arch '{}'", platform_arch))
        })?;
        Ok(Self {
            identity: identity.clone(),
            platform: platform.to_string(),
            arch: arch.to_string(),
            hash: hash.to_string(),
        })
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}-blake3-{}{}",
            self.identity, self.platform, self.arch, self.hash, ARCHIVE_EXTENSION
        )
    }

    /// Parse `<identity>-<platform>-<arch>-blake3-<hash>.tar.zst`.
    /// Identities may themselves contain dashes, so parsing anchors on
    /// the `-blake3-` separator from the right.
    pub fn parse(file_name: &str) -> Result<Self> {
        let stem = file_name.strip_suffix(ARCHIVE_EXTENSION).ok_or_else(|| {
            Error::Interface(format!(
                "archive name '{}' does not end with {}",
                file_name, ARCHIVE_EXTENSION
            ))
        })?;
        let (coords, hash) = stem.rsplit_once("-blake3-").ok_or_else(|| {
            Error::Interface(format!(
                "archive name '{}' is missing the '-blake3-' separator",
                file_name
            ))
        })?;
        let mut parts = coords.rsplitn(3, '-');
        let arch = parts.next().unwrap_or_default();
        let platform = parts.next().unwrap_or_default();
        let identity = parts.next().unwrap_or_default();
        if identity.is_empty() || platform.is_empty() || arch.is_empty() || hash.is_empty() {
            return Err(Error::Interface(format!(
                "archive name '{}' does not parse as identity-platform-arch-blake3-hash",
                file_name
            )));
        }
        Ok(Self {
            identity: identity.parse()?,
            platform: platform.to_string(),
            arch: arch.to_string(),
            hash: hash.to_string(),
        })
    }

    pub fn platform_arch(&self) -> String {
        format!("{}-{}", self.platform, self.arch)
    }
}

/// Serialize one committed cache entry into `<outdir>/<name>.tar.zst`.
/// `payload` names the top-level directory to archive (`pkg` or `fetch`).
pub fn export_entry(
    entry_path: &Path,
    payload: &str,
    name: &ArchiveName,
    outdir: &Path,
) -> Result<PathBuf> {
    let payload_dir = entry_path.join(payload);
    if !payload_dir.is_dir() {
        return Err(Error::Cache(format!(
            "entry {} has no {}/ to export",
            entry_path.display(),
            payload
        )));
    }
    std::fs::create_dir_all(outdir)?;
    let out_path = outdir.join(name.file_name());

    let file = std::fs::File::create(&out_path)?;
    let encoder = zstd::stream::write::Encoder::new(file, 0)
        .map_err(|e| Error::Phase(format!("zstd encoder: {}", e)))?
        .auto_finish();
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(payload, &payload_dir)
        .map_err(|e| Error::Phase(format!("archive {}: {}", payload_dir.display(), e)))?;
    builder
        .into_inner()
        .map_err(|e| Error::Phase(format!("finish archive: {}", e)))?;
    Ok(out_path)
}

/// Import one export archive into the cache store, committing under the
/// coordinates carried by its filename. Returns the completed entry, or
/// None when the entry already exists.
pub fn import_archive(store: &CacheStore, file: &Path) -> Result<Option<CompleteEntry>> {
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::Interface(format!("not a file: {}", file.display())))?;
    let name = ArchiveName::parse(&file_name)?;

    if name.platform_arch() != store.platform_arch() {
        return Err(Error::Interface(format!(
            "archive '{}' targets {} but this host is {}",
            file_name,
            name.platform_arch(),
            store.platform_arch()
        )));
    }

    let entry = match store.ensure_package(&name.identity, &name.hash)? {
        Outcome::FastPath(_) => return Ok(None),
        Outcome::Locked(entry) => entry,
    };

    // Unpack into scratch space first; the archive's top-level directory
    // tells us whether this is a pkg or fetch-only archive.
    let scratch = entry.tmp_path.join("import");
    super::extract_archive(file, &scratch, 0)?;

    let pkg_dir = scratch.join("pkg");
    let fetch_dir = scratch.join("fetch");
    if pkg_dir.is_dir() {
        std::fs::remove_dir_all(&entry.install_path)?;
        std::fs::rename(&pkg_dir, &entry.install_path)?;
    } else if fetch_dir.is_dir() {
        // Fetch-only archive: restore the fetch tree; the payload is the
        // fetched sources and the build still runs from them.
        std::fs::remove_dir_all(&entry.fetch_path)?;
        std::fs::rename(&fetch_dir, &entry.fetch_path)?;
        entry.mark_fetch_complete()?;
        drop(entry);
        return Ok(None);
    } else {
        return Err(Error::Phase(format!(
            "archive '{}' contains neither pkg/ nor fetch/ at top level",
            file_name
        )));
    }

    Ok(Some(entry.mark_complete()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const HASH: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn store(temp: &TempDir) -> CacheStore {
        CacheStore::with_platform_arch(temp.path().join("cache"), "linux-x86_64")
    }

    fn identity() -> Identity {
        "local.tool@v1".parse().unwrap()
    }

    #[test]
    fn test_archive_name_roundtrip() {
        let name = ArchiveName::new(&identity(), "linux-x86_64", HASH).unwrap();
        let file_name = name.file_name();
        assert_eq!(
            file_name,
            format!("local.tool@v1-linux-x86_64-blake3-{}{}", HASH, ARCHIVE_EXTENSION)
        );
        let parsed = ArchiveName::parse(&file_name).unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn test_archive_name_with_dashed_identity() {
        let id: Identity = "acme.my-tool@v2-rc1".parse().unwrap();
        let name = ArchiveName::new(&id, "darwin-arm64", HASH).unwrap();
        let parsed = ArchiveName::parse(&name.file_name()).unwrap();
        assert_eq!(parsed.identity, id);
        assert_eq!(parsed.platform, "darwin");
        assert_eq!(parsed.arch, "arm64");
    }

    #[test]
    fn test_parse_rejects_foreign_extension() {
        assert!(ArchiveName::parse("x-linux-x86_64-blake3-aa.tar.gz").is_err());
        assert!(ArchiveName::parse("garbage.tar.zst").is_err());
    }

    #[test]
    fn test_export_import_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        // Build an entry with known pkg content.
        let entry = match store.ensure_package(&identity(), HASH).unwrap() {
            Outcome::Locked(e) => e,
            Outcome::FastPath(_) => panic!(),
        };
        fs::create_dir_all(entry.install_path.join("bin")).unwrap();
        fs::write(entry.install_path.join("bin/tool"), "#!/bin/sh\necho hi\n").unwrap();
        let complete = entry.mark_complete().unwrap();

        // Export it.
        let name = ArchiveName::new(&identity(), "linux-x86_64", HASH).unwrap();
        let outdir = temp.path().join("out");
        let archive = export_entry(&complete.entry_path, "pkg", &name, &outdir).unwrap();
        assert!(archive.exists());

        // Wipe the cache and import.
        fs::remove_dir_all(store.root()).unwrap();
        let restored = import_archive(&store, &archive).unwrap().unwrap();
        assert_eq!(
            fs::read_to_string(restored.payload_path.join("bin/tool")).unwrap(),
            "#!/bin/sh\necho hi\n"
        );

        // Byte-for-byte identical content.
        assert_eq!(
            fs::read(complete.payload_path.join("bin/tool")).ok(),
            fs::read(restored.payload_path.join("bin/tool")).ok()
        );
    }

    #[test]
    fn test_import_existing_entry_is_noop() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        let entry = match store.ensure_package(&identity(), HASH).unwrap() {
            Outcome::Locked(e) => e,
            Outcome::FastPath(_) => panic!(),
        };
        fs::write(entry.install_path.join("f"), "v").unwrap();
        let complete = entry.mark_complete().unwrap();

        let name = ArchiveName::new(&identity(), "linux-x86_64", HASH).unwrap();
        let outdir = temp.path().join("out");
        let archive = export_entry(&complete.entry_path, "pkg", &name, &outdir).unwrap();

        assert!(import_archive(&store, &archive).unwrap().is_none());
    }

    #[test]
    fn test_import_wrong_platform_rejected() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let archive = temp.path().join(format!(
            "local.tool@v1-windows-x86_64-blake3-{}{}",
            HASH, ARCHIVE_EXTENSION
        ));
        fs::write(&archive, "junk").unwrap();
        let err = import_archive(&store, &archive).unwrap_err();
        assert!(err.to_string().contains("windows-x86_64"));
    }
}
