//! Shared HTTP client
//!
//! One blocking client with consistent error handling, used by fetch
//! sources and the depot client.

use crate::error::{Error, Result};
use reqwest::blocking::Client;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// HTTP client timeout for all transfers.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared HTTP client for envy network operations.
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("envy/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }

    /// Download a URL and return its content as text.
    pub fn download_text(&self, url: &str) -> Result<String> {
        let response = self.send_request(url)?;
        self.check_status(&response, url)?;

        response
            .text()
            .map_err(|e| Error::Network(format!("Failed to read response: {}", e)))
    }

    /// Download a URL into a file, streamed.
    pub fn download_to_file(&self, url: &str, dest: &Path) -> Result<()> {
        let mut response = self.send_request(url)?;
        self.check_status(&response, url)?;

        let mut file = std::fs::File::create(dest)?;
        response
            .copy_to(&mut file)
            .map_err(|e| Error::Network(format!("Failed to download {}: {}", url, e)))?;
        file.flush()?;
        Ok(())
    }

    fn send_request(&self, url: &str) -> Result<reqwest::blocking::Response> {
        self.client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                Error::Network(format!("Request timed out: {}", url))
            } else if e.is_connect() {
                Error::Network(format!("Connection failed: {}", url))
            } else {
                Error::Network(format!("HTTP error: {}", e))
            }
        })
    }

    fn check_status(&self, response: &reqwest::blocking::Response, url: &str) -> Result<()> {
        if !response.status().is_success() {
            let status = response.status();
            if status.as_u16() == 404 {
                return Err(Error::Network(format!("Not found: {}", url)));
            }
            return Err(Error::Network(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }
        Ok(())
    }
}

/// Whether a fetch source string is a URL (as opposed to a local path).
pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Whether a fetch source is a git source. Git fetches are non-cacheable.
pub fn is_git_source(source: &str) -> bool {
    source.starts_with("git://")
        || source.starts_with("git+http://")
        || source.starts_with("git+https://")
        || source.ends_with(".git")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creates_successfully() {
        let _client = HttpClient::new();
    }

    #[test]
    fn test_connection_refused_returns_error() {
        let client = HttpClient::new();
        let result = client.download_text("http://127.0.0.1:1/nonexistent");
        assert!(result.is_err());
    }

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/a.tar.gz"));
        assert!(is_url("http://example.com/a.tar.gz"));
        assert!(!is_url("/tmp/a.tar.gz"));
        assert!(!is_url("relative/a.tar.gz"));
    }

    #[test]
    fn test_is_git_source() {
        assert!(is_git_source("git://example.com/repo"));
        assert!(is_git_source("https://example.com/repo.git"));
        assert!(!is_git_source("https://example.com/a.tar.gz"));
    }
}
