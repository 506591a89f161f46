//! CLI command implementations
//!
//! Each subcommand parses its own args struct; the shared engine context
//! (manifest, cache store, HTTP client, trace sink) is assembled here.

pub mod export;
pub mod hash;
pub mod import;
pub mod list;
pub mod query;
pub mod sync;

use crate::cache::CacheStore;
use crate::depot::DepotIndex;
use crate::error::{Error, Result};
use crate::manifest::{discover_manifest, load_manifest, Manifest};
use crate::net::HttpClient;
use crate::resolver::{Graph, Resolver};
use crate::trace::TraceSink;
use clap::Args;
use std::path::PathBuf;

/// Options shared by every manifest-driven command.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Override the cache root directory
    #[arg(long, value_name = "DIR")]
    pub cache_root: Option<PathBuf>,

    /// Use this manifest instead of discovering envy.lua
    #[arg(long, value_name = "FILE")]
    pub manifest: Option<PathBuf>,

    /// Worker threads (default: number of CPU cores)
    #[arg(long, short = 'j', value_name = "N")]
    pub jobs: Option<usize>,

    /// Emit structured trace events (optionally to a file: file:PATH)
    #[arg(long, value_name = "SINK", num_args = 0..=1, default_missing_value = "")]
    pub trace: Option<String>,
}

/// Everything a manifest-driven command needs.
pub struct EngineContext {
    pub manifest: Manifest,
    pub store: CacheStore,
    pub http: HttpClient,
    pub trace: TraceSink,
    pub jobs: usize,
}

impl EngineContext {
    pub fn load(global: &GlobalArgs) -> Result<Self> {
        let manifest_path = match &global.manifest {
            Some(path) => path.clone(),
            None => {
                let cwd = std::env::current_dir()?;
                discover_manifest(&cwd)?.ok_or(Error::ManifestNotFound)?
            }
        };
        let manifest = load_manifest(&manifest_path)?;

        let cache_root = global
            .cache_root
            .clone()
            .or_else(|| manifest.directives.cache_root())
            .or_else(default_cache_root)
            .ok_or_else(|| {
                Error::Cache("cannot determine a cache root; pass --cache-root".to_string())
            })?;

        let trace = TraceSink::from_cli(global.trace.as_deref())?;
        let jobs = global.jobs.unwrap_or_else(num_cpus::get);

        Ok(Self {
            manifest,
            store: CacheStore::new(cache_root),
            http: HttpClient::new(),
            trace,
            jobs,
        })
    }

    /// Resolve the manifest into the instance graph.
    pub fn resolve(&self) -> Result<Graph> {
        Resolver::new(
            &self.store,
            &self.http,
            self.manifest.dir.clone(),
            self.manifest.bundles.clone(),
        )
        .resolve(&self.manifest.packages)
    }

    /// Load every depot manifest the project names.
    pub fn depot(&self) -> DepotIndex {
        if self.manifest.directives.package_depots.is_empty() {
            DepotIndex::empty()
        } else {
            DepotIndex::load(&self.http, &self.manifest.directives.package_depots)
        }
    }
}

fn default_cache_root() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("envy"))
}
