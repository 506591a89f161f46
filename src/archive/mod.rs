//! Archive codecs
//!
//! Extraction for the formats fetch sources arrive in (`tar`, `tar.gz`,
//! `tar.zst`, `zip`) plus the recursive tree copy used by bundle and
//! export plumbing. Entry paths are checked against escapes before
//! anything is written.

pub mod export;

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Whether a file looks like an archive `extract_all` can open.
pub fn is_archive(path: &Path) -> bool {
    let name = match path.file_name() {
        Some(n) => n.to_string_lossy().to_lowercase(),
        None => return false,
    };
    name.ends_with(".tar")
        || name.ends_with(".tar.gz")
        || name.ends_with(".tgz")
        || name.ends_with(".tar.zst")
        || name.ends_with(".zip")
}

/// Strip `strip` leading components from an entry path, verifying the
/// remainder stays inside the extraction root. Returns None when the
/// entry is entirely consumed by stripping.
fn sanitized(entry: &Path, strip: u32) -> Result<Option<PathBuf>> {
    let mut out = PathBuf::new();
    let mut skipped = 0u32;
    for component in entry.components() {
        match component {
            Component::Normal(part) => {
                if skipped < strip {
                    skipped += 1;
                } else {
                    out.push(part);
                }
            }
            Component::CurDir => {}
            _ => {
                return Err(Error::Security(format!(
                    "archive entry '{}' escapes the extraction root",
                    entry.display()
                )))
            }
        }
    }
    if out.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(out))
    }
}

/// Extract one archive into `dest`, stripping `strip` leading path
/// components from every entry.
pub fn extract_archive(archive: &Path, dest: &Path, strip: u32) -> Result<()> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    std::fs::create_dir_all(dest)?;

    let file = std::fs::File::open(archive).map_err(|e| {
        Error::Phase(format!("cannot open archive {}: {}", archive.display(), e))
    })?;

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        unpack_tar(tar::Archive::new(flate2::read::GzDecoder::new(file)), dest, strip)
    } else if name.ends_with(".tar.zst") {
        let decoder = zstd::stream::read::Decoder::new(file)
            .map_err(|e| Error::Phase(format!("zstd decode {}: {}", archive.display(), e)))?;
        unpack_tar(tar::Archive::new(decoder), dest, strip)
    } else if name.ends_with(".tar") {
        unpack_tar(tar::Archive::new(file), dest, strip)
    } else if name.ends_with(".zip") {
        unpack_zip(file, dest, strip)
    } else {
        Err(Error::Phase(format!(
            "unsupported archive format: {}",
            archive.display()
        )))
    }
}

fn unpack_tar<R: std::io::Read>(mut archive: tar::Archive<R>, dest: &Path, strip: u32) -> Result<()> {
    archive.set_preserve_permissions(true);
    for entry in archive.entries().map_err(|e| Error::Phase(format!("read tar: {}", e)))? {
        let mut entry = entry.map_err(|e| Error::Phase(format!("read tar entry: {}", e)))?;
        let raw = entry
            .path()
            .map_err(|e| Error::Phase(format!("tar entry path: {}", e)))?
            .into_owned();
        let Some(rel) = sanitized(&raw, strip)? else {
            continue;
        };
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .map_err(|e| Error::Phase(format!("unpack {}: {}", raw.display(), e)))?;
    }
    Ok(())
}

fn unpack_zip(file: std::fs::File, dest: &Path, strip: u32) -> Result<()> {
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| Error::Phase(format!("read zip: {}", e)))?;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::Phase(format!("read zip entry: {}", e)))?;
        let raw = match entry.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => {
                return Err(Error::Security(format!(
                    "archive entry '{}' escapes the extraction root",
                    entry.name()
                )))
            }
        };
        let Some(rel) = sanitized(&raw, strip)? else {
            continue;
        };
        let target = dest.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode));
            }
        }
    }
    Ok(())
}

/// Default staging: extract every archive found at the top level of
/// `src_dir` into `dest`, and copy plain files through unchanged.
/// Returns the number of archives extracted.
pub fn extract_all(src_dir: &Path, dest: &Path, strip: u32) -> Result<u32> {
    std::fs::create_dir_all(dest)?;
    let mut extracted = 0;
    let mut entries: Vec<PathBuf> = std::fs::read_dir(src_dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();
    for path in entries {
        if !path.is_file() {
            continue;
        }
        if path.file_name().and_then(|n| n.to_str()) == Some(crate::cache::COMPLETE_MARKER) {
            continue;
        }
        if is_archive(&path) {
            extract_archive(&path, dest, strip)?;
            extracted += 1;
        } else {
            let target = dest.join(path.file_name().unwrap());
            std::fs::copy(&path, &target)?;
        }
    }
    Ok(extracted)
}

/// Recursive tree copy preserving unix permissions.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields children of src");
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_symlink() {
            #[cfg(unix)]
            {
                let link = std::fs::read_link(entry.path())?;
                let _ = std::fs::remove_file(&target);
                std::os::unix::fs::symlink(link, &target)?;
            }
            #[cfg(not(unix))]
            {
                std::fs::copy(entry.path(), &target)?;
            }
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
