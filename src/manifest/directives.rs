//! Manifest meta-option directives
//!
//! Leading comment lines of `envy.lua` may carry engine options:
//!
//! ```lua
//! -- @envy version "0.4.0"
//! -- @envy cache "~/.cache/envy-alt"
//! -- @envy package-depot "https://depot.example.com/manifest.txt"
//! ```
//!
//! Directive values support `~` and `$VAR` expansion. Scanning stops at
//! the first line that is neither blank nor a comment.

use crate::error::{Error, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::PathBuf;

lazy_static! {
    static ref DIRECTIVE_RE: Regex =
        Regex::new(r#"^--\s*@envy\s+([A-Za-z0-9-]+)\s+"([^"]*)"\s*$"#).unwrap();
    static ref VAR_RE: Regex = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap();
}

#[derive(Debug, Clone, Default)]
pub struct Directives {
    pub version: Option<String>,
    pub mirror: Option<String>,
    pub cache: Option<String>,
    pub cache_posix: Option<String>,
    pub cache_win: Option<String>,
    pub bin: Option<String>,
    pub root: Option<String>,
    pub deploy: Option<String>,
    pub package_depots: Vec<String>,
}

impl Directives {
    /// Lex the leading comment block of a manifest.
    pub fn parse(text: &str) -> Result<Self> {
        let mut directives = Directives::default();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !trimmed.starts_with("--") {
                break;
            }
            let Some(caps) = DIRECTIVE_RE.captures(trimmed) else {
                // Plain comment, or a malformed directive. A line that
                // names @envy but doesn't lex is an error, not a comment.
                if trimmed.contains("@envy") {
                    return Err(Error::Interface(format!(
                        "malformed @envy directive: {}",
                        trimmed
                    )));
                }
                continue;
            };
            let key = caps.get(1).unwrap().as_str();
            let value = caps.get(2).unwrap().as_str().to_string();
            match key {
                "version" => directives.version = Some(value),
                "mirror" => directives.mirror = Some(value),
                "cache" => directives.cache = Some(value),
                "cache-posix" => directives.cache_posix = Some(value),
                "cache-win" => directives.cache_win = Some(value),
                "bin" => directives.bin = Some(value),
                "root" => directives.root = Some(value),
                "deploy" => directives.deploy = Some(value),
                "package-depot" => directives.package_depots.push(value),
                other => {
                    return Err(Error::Interface(format!(
                        "unknown @envy directive key '{}'",
                        other
                    )))
                }
            }
        }
        Ok(directives)
    }

    /// `-- @envy root "false"` marks a sub-manifest that defers to an
    /// ancestor.
    pub fn is_root(&self) -> bool {
        self.root.as_deref() != Some("false")
    }

    /// The cache root this manifest requests, if any. The
    /// platform-specific key wins over the generic one.
    pub fn cache_root(&self) -> Option<PathBuf> {
        let specific = if cfg!(windows) {
            self.cache_win.as_ref()
        } else {
            self.cache_posix.as_ref()
        };
        specific
            .or(self.cache.as_ref())
            .map(|raw| PathBuf::from(expand_path(raw)))
    }
}

/// Expand `~` (leading) and `$VAR` / `${VAR}` references.
pub fn expand_path(raw: &str) -> String {
    let mut s = raw.to_string();
    if let Some(rest) = s.strip_prefix("~") {
        if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') {
            if let Some(home) = dirs::home_dir() {
                s = format!("{}{}", home.display(), rest);
            }
        }
    }
    VAR_RE
        .replace_all(&s, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_basic_directives() {
        let text = r#"-- @envy version "0.4.0"
-- @envy cache "~/.cache/envy"
-- @envy package-depot "https://a.example.com/depot.txt"
-- @envy package-depot "https://b.example.com/depot.txt"

PACKAGES = {}
"#;
        let d = Directives::parse(text).unwrap();
        assert_eq!(d.version.as_deref(), Some("0.4.0"));
        assert_eq!(d.package_depots.len(), 2);
        assert!(d.is_root());
    }

    #[test]
    fn test_root_false() {
        let d = Directives::parse("-- @envy root \"false\"\n").unwrap();
        assert!(!d.is_root());
    }

    #[test]
    fn test_directives_stop_at_code() {
        let text = "-- plain comment\nPACKAGES = {}\n-- @envy cache \"/ignored\"\n";
        let d = Directives::parse(text).unwrap();
        assert!(d.cache.is_none());
    }

    #[test]
    fn test_unknown_key_is_interface_error() {
        let err = Directives::parse("-- @envy wibble \"x\"\n").unwrap_err();
        assert!(matches!(err, Error::Interface(_)));
        assert!(err.to_string().contains("wibble"));
    }

    #[test]
    fn test_malformed_directive_is_error() {
        let err = Directives::parse("-- @envy cache no-quotes\n").unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    #[serial]
    fn test_expand_env_var() {
        std::env::set_var("ENVY_TEST_DIR", "/opt/envy");
        assert_eq!(expand_path("$ENVY_TEST_DIR/cache"), "/opt/envy/cache");
        assert_eq!(expand_path("${ENVY_TEST_DIR}/cache"), "/opt/envy/cache");
        std::env::remove_var("ENVY_TEST_DIR");
    }

    #[test]
    fn test_expand_home() {
        let expanded = expand_path("~/cache");
        assert!(!expanded.starts_with('~'));
    }

    #[test]
    #[serial]
    fn test_cache_root_platform_specific_wins() {
        let d = Directives::parse(
            "-- @envy cache \"/generic\"\n-- @envy cache-posix \"/posix\"\n-- @envy cache-win \"C:/win\"\n",
        )
        .unwrap();
        let root = d.cache_root().unwrap();
        if cfg!(windows) {
            assert_eq!(root, PathBuf::from("C:/win"));
        } else {
            assert_eq!(root, PathBuf::from("/posix"));
        }
    }
}
