//! Package depot fast-path
//!
//! A depot is a plain-text manifest of pre-built cache archives, one URL
//! per line. Before building an uncached cache-managed instance from
//! source, the scheduler consults the depot index for an archive whose
//! coordinates match the instance's variant hash. Every depot failure
//! (unreachable manifest, unparseable line, corrupt archive) is logged
//! and the build falls back to source transparently.

use crate::archive::export::ArchiveName;
use crate::cache::LockedEntry;
use crate::identity::Identity;
use crate::net::HttpClient;
use colored::Colorize;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct DepotIndex {
    /// `(identity, platform-arch, variant-hash)` -> archive URL.
    map: HashMap<(String, String, String), String>,
}

impl DepotIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Fetch and merge every depot manifest named by the project
    /// manifest. Failures are reported to stderr and skipped.
    pub fn load(http: &HttpClient, urls: &[String]) -> Self {
        let mut index = Self::empty();
        for url in urls {
            match http.download_text(url) {
                Ok(text) => index.add_manifest(&text),
                Err(e) => {
                    eprintln!(
                        "{} depot manifest {} unavailable: {}",
                        "warning:".yellow(),
                        url,
                        e
                    );
                }
            }
        }
        index
    }

    /// Parse one depot manifest: one archive URL per line, `#` comments
    /// and blank lines ignored.
    pub fn add_manifest(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let file_name = line.rsplit('/').next().unwrap_or(line);
            match ArchiveName::parse(file_name) {
                Ok(name) => {
                    self.map.insert(
                        (
                            name.identity.to_string(),
                            name.platform_arch(),
                            name.hash.clone(),
                        ),
                        line.to_string(),
                    );
                }
                Err(e) => {
                    eprintln!(
                        "{} skipping depot line '{}': {}",
                        "warning:".yellow(),
                        line,
                        e
                    );
                }
            }
        }
    }

    pub fn lookup(&self, identity: &Identity, platform_arch: &str, hash: &str) -> Option<&str> {
        self.map
            .get(&(
                identity.to_string(),
                platform_arch.to_string(),
                hash.to_string(),
            ))
            .map(String::as_str)
    }

    /// Try to satisfy a freshly-locked entry from the depot: download the
    /// matching archive and unpack its `pkg/` into the entry's install
    /// area. Returns true when the entry is ready to commit; on any
    /// failure the warning is logged and the caller builds from source.
    pub fn try_restore(
        &self,
        http: &HttpClient,
        platform_arch: &str,
        identity: &Identity,
        hash: &str,
        entry: &LockedEntry,
    ) -> bool {
        let Some(url) = self.lookup(identity, platform_arch, hash) else {
            return false;
        };

        let file_name = url.rsplit('/').next().unwrap_or("depot.tar.zst");
        let download = entry.tmp_path.join(file_name);
        if let Err(e) = http.download_to_file(url, &download) {
            eprintln!(
                "{} depot archive {} failed ({}); building from source",
                "warning:".yellow(),
                url,
                e
            );
            return false;
        }

        let scratch = entry.tmp_path.join("depot-unpack");
        if let Err(e) = crate::archive::extract_archive(&download, &scratch, 0) {
            eprintln!(
                "{} depot archive {} is corrupt ({}); building from source",
                "warning:".yellow(),
                url,
                e
            );
            return false;
        }

        let pkg = scratch.join("pkg");
        if !pkg.is_dir() {
            eprintln!(
                "{} depot archive {} has no pkg/; building from source",
                "warning:".yellow(),
                url
            );
            return false;
        }
        if std::fs::remove_dir_all(&entry.install_path).is_err()
            || std::fs::rename(&pkg, &entry.install_path).is_err()
        {
            return false;
        }
        true
    }
}
