//! Checksum helpers
//!
//! SHA-256 is the integrity hash for spec files and fetched sources (and
//! the `envy hash` command). Variant hashing of resolved instances uses
//! BLAKE3 and lives with the resolver.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// SHA-256 of a byte slice, lowercase hex.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of a file's contents, streamed in 64 KiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("file does not exist: {}", path.display()),
        )));
    }
    if path.is_dir() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("path is a directory, not a file: {}", path.display()),
        )));
    }

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify a file against an expected SHA-256, yielding an integrity error
/// that carries both digests on mismatch.
pub fn verify_sha256(path: &Path, expected: &str, context: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    let expected = expected.to_lowercase();
    if actual != expected {
        return Err(Error::Integrity {
            context: context.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}
