//! Dependency resolution
//!
//! Builds the instance DAG from a manifest's package entries. Strong
//! dependencies are loaded eagerly and memoized by canonical key
//! `(identity, canonical-options)`. Weak and ref-only product
//! dependencies are bound afterwards by a fixpoint over the instance
//! pool: each pass matches unresolved edges against every declared
//! product, instantiates fallbacks when nothing matches, and stops when
//! a whole pass makes no progress. Cycles on strong edges and the
//! remote-to-local containment rule are both checked before any worker
//! starts.

pub mod hash;

use crate::cache::{CacheStore, Outcome};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::net::{is_url, HttpClient};
use crate::spec::dependency::{DependencyDecl, Phase, WeakFallback};
use crate::spec::loader::{load_bundle_manifest, load_spec, run_validate};
use crate::spec::options::{canonical_key, OptionValue};
use crate::spec::{BundleManifest, Spec};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub enum EdgeKind {
    /// Strong spec dependency (including instantiated weak fallbacks).
    Strong,
    /// Product dependency; `via_weak` marks bindings made by the
    /// fixpoint, which contribute to the consumer's variant hash.
    Product { name: String, via_weak: bool },
    /// Bundle dependency; `query` preserves the declared identity or
    /// alias for sandbox-side lookups.
    Bundle { query: String },
}

#[derive(Debug, Clone)]
pub struct ResolvedEdge {
    pub target: usize,
    pub needed_by: Phase,
    pub kind: EdgeKind,
}

impl ResolvedEdge {
    pub fn is_strong(&self) -> bool {
        matches!(
            self.kind,
            EdgeKind::Strong | EdgeKind::Product { via_weak: false, .. }
        )
    }
}

#[derive(Debug, Clone)]
pub enum NodePayload {
    Package(Spec),
    Bundle {
        manifest: BundleManifest,
        asset_path: PathBuf,
    },
}

/// One resolved instance: a spec plus canonical options plus its bound
/// dependency edges. The scheduler executes these.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: usize,
    pub identity: Identity,
    pub options: Option<OptionValue>,
    /// Canonical key, e.g. `local.gcc@v13{variant="lto"}`.
    pub key: String,
    /// Directory against which this node's relative dep sources resolve.
    pub base_dir: PathBuf,
    pub payload: NodePayload,
    pub edges: Vec<ResolvedEdge>,
    /// Canonical keys of weak fallbacks this instance instantiated.
    pub used_fallbacks: BTreeSet<String>,
    /// 64-char BLAKE3 hex naming this instance's cache variant.
    pub variant_hash: String,
    pub is_root: bool,
}

impl Node {
    pub fn spec(&self) -> Option<&Spec> {
        match &self.payload {
            NodePayload::Package(spec) => Some(spec),
            NodePayload::Bundle { .. } => None,
        }
    }

    pub fn is_bundle(&self) -> bool {
        matches!(self.payload, NodePayload::Bundle { .. })
    }

    pub fn asset_path(&self) -> Option<&Path> {
        match &self.payload {
            NodePayload::Bundle { asset_path, .. } => Some(asset_path),
            NodePayload::Package(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub key_index: HashMap<String, usize>,
}

impl Graph {
    pub fn package_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.is_bundle())
    }

    /// Fuzzy-match a query against all package instances.
    pub fn find_package(&self, query: &str) -> Result<Option<&Node>> {
        let matches: Vec<&Node> = self
            .package_nodes()
            .filter(|n| n.identity.matches_query(query))
            .collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0])),
            _ => {
                let listed: Vec<&str> = matches.iter().map(|n| n.key.as_str()).collect();
                Err(Error::Resolution(format!(
                    "query '{}' is ambiguous; candidates: {}",
                    query,
                    listed.join(", ")
                )))
            }
        }
    }
}

/// Bundle alias declared in the manifest's `BUNDLES` table.
#[derive(Debug, Clone)]
pub struct BundleAlias {
    pub identity: Identity,
    pub source: String,
}

struct PendingWeak {
    consumer: usize,
    product: String,
    fallback: Option<WeakFallback>,
    needed_by: Phase,
    fallback_instantiated: bool,
    resolved: bool,
}

pub struct Resolver<'a> {
    store: &'a CacheStore,
    http: &'a HttpClient,
    manifest_dir: PathBuf,
    bundle_aliases: BTreeMap<String, BundleAlias>,
    nodes: Vec<Node>,
    key_index: HashMap<String, usize>,
    pending: Vec<PendingWeak>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        store: &'a CacheStore,
        http: &'a HttpClient,
        manifest_dir: PathBuf,
        bundle_aliases: BTreeMap<String, BundleAlias>,
    ) -> Self {
        Self {
            store,
            http,
            manifest_dir,
            bundle_aliases,
            nodes: Vec::new(),
            key_index: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Resolve the manifest's package entries into the full DAG.
    pub fn resolve(mut self, entries: &[DependencyDecl]) -> Result<Graph> {
        let manifest_dir = self.manifest_dir.clone();
        for decl in entries {
            match decl {
                DependencyDecl::Spec {
                    spec,
                    source,
                    options,
                    ..
                } => {
                    let idx =
                        self.instantiate_spec(spec, source, options.clone(), &manifest_dir)?;
                    self.nodes[idx].is_root = true;
                }
                DependencyDecl::Bundle { bundle, source, .. } => {
                    self.materialize_bundle(bundle, source, &manifest_dir)?;
                }
                DependencyDecl::Product {
                    spec,
                    source,
                    options,
                    ..
                } => {
                    let idx =
                        self.instantiate_spec(spec, source, options.clone(), &manifest_dir)?;
                    self.nodes[idx].is_root = true;
                }
                _ => {
                    return Err(Error::Schema(
                        "manifest PACKAGES entries must name a spec or bundle".to_string(),
                    ))
                }
            }
        }

        self.run_fixpoint()?;
        self.verify_unambiguous()?;
        self.check_cycles()?;

        let mut graph = Graph {
            nodes: self.nodes,
            key_index: self.key_index,
        };
        hash::compute_variant_hashes(&mut graph);
        Ok(graph)
    }

    fn instantiate_spec(
        &mut self,
        identity: &Identity,
        source: &str,
        options: Option<OptionValue>,
        base: &Path,
    ) -> Result<usize> {
        let key = canonical_key(identity, options.as_ref());
        if let Some(&idx) = self.key_index.get(&key) {
            return Ok(idx);
        }

        let path = resolve_source_path(source, base);
        let spec = load_spec(&path, identity, None)?;
        run_validate(&spec, options.as_ref())?;

        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| base.to_path_buf());
        let idx = self.nodes.len();
        self.key_index.insert(key.clone(), idx);
        let dependencies = spec.dependencies.clone();
        self.nodes.push(Node {
            id: idx,
            identity: identity.clone(),
            options,
            key,
            base_dir,
            payload: NodePayload::Package(spec),
            edges: Vec::new(),
            used_fallbacks: BTreeSet::new(),
            variant_hash: String::new(),
            is_root: false,
        });

        for decl in &dependencies {
            self.add_dependency_edge(idx, decl)?;
        }
        Ok(idx)
    }

    fn check_containment(&self, consumer: usize, target: &Identity) -> Result<()> {
        let consumer_id = &self.nodes[consumer].identity;
        if !consumer_id.is_local() && target.is_local() {
            return Err(Error::Security(format!(
                "remote spec '{}' cannot depend on local spec '{}'",
                consumer_id, target
            )));
        }
        Ok(())
    }

    fn add_dependency_edge(&mut self, consumer: usize, decl: &DependencyDecl) -> Result<()> {
        let consumer_base = self.nodes[consumer].base_dir.clone();
        match decl {
            DependencyDecl::Spec {
                spec,
                source,
                options,
                needed_by,
            } => {
                self.check_containment(consumer, spec)?;
                let target = self.instantiate_spec(spec, source, options.clone(), &consumer_base)?;
                self.nodes[consumer].edges.push(ResolvedEdge {
                    target,
                    needed_by: *needed_by,
                    kind: EdgeKind::Strong,
                });
            }
            DependencyDecl::SpecFromBundle {
                spec,
                bundle,
                options,
                needed_by,
            } => {
                self.check_containment(consumer, spec)?;
                let bundle_idx = self.bundle_for_query(bundle, &consumer_base)?;
                let (asset_path, rel) = match &self.nodes[bundle_idx].payload {
                    NodePayload::Bundle {
                        manifest,
                        asset_path,
                    } => {
                        let rel = manifest.specs.get(&spec.to_string()).ok_or_else(|| {
                            Error::Resolution(format!(
                                "bundle '{}' does not provide spec '{}'",
                                manifest.identity, spec
                            ))
                        })?;
                        (asset_path.clone(), rel.clone())
                    }
                    NodePayload::Package(_) => unreachable!("bundle_for_query returns bundles"),
                };
                let member_path = asset_path.join(rel);
                let target = self.instantiate_spec(
                    spec,
                    &member_path.to_string_lossy(),
                    options.clone(),
                    &asset_path,
                )?;
                self.nodes[consumer].edges.push(ResolvedEdge {
                    target,
                    needed_by: *needed_by,
                    kind: EdgeKind::Strong,
                });
            }
            DependencyDecl::Product {
                product,
                spec,
                source,
                options,
                needed_by,
            } => {
                self.check_containment(consumer, spec)?;
                let target = self.instantiate_spec(spec, source, options.clone(), &consumer_base)?;
                if !self.strong_closure_declares(target, product) {
                    return Err(Error::Resolution(format!(
                        "spec '{}' does not provide product '{}' required by '{}'",
                        spec, product, self.nodes[consumer].key
                    )));
                }
                self.nodes[consumer].edges.push(ResolvedEdge {
                    target,
                    needed_by: *needed_by,
                    kind: EdgeKind::Product {
                        name: product.clone(),
                        via_weak: false,
                    },
                });
            }
            DependencyDecl::WeakProduct {
                product,
                fallback,
                needed_by,
            } => {
                self.pending.push(PendingWeak {
                    consumer,
                    product: product.clone(),
                    fallback: fallback.clone(),
                    needed_by: *needed_by,
                    fallback_instantiated: false,
                    resolved: false,
                });
            }
            DependencyDecl::Bundle {
                bundle,
                source,
                needed_by,
            } => {
                let target = self.materialize_bundle_via(bundle, source, &consumer_base)?;
                self.nodes[consumer].edges.push(ResolvedEdge {
                    target,
                    needed_by: *needed_by,
                    kind: EdgeKind::Bundle {
                        query: bundle.to_string(),
                    },
                });
            }
        }
        Ok(())
    }

    /// Resolve `{ bundle, source }` where source may be a manifest alias.
    fn materialize_bundle_via(
        &mut self,
        identity: &Identity,
        source: &str,
        base: &Path,
    ) -> Result<usize> {
        if let Some(alias) = self.bundle_aliases.get(source).cloned() {
            if alias.identity != *identity {
                return Err(Error::Security(format!(
                    "bundle alias '{}' names '{}' but the dependency expects '{}'",
                    source, alias.identity, identity
                )));
            }
            let manifest_dir = self.manifest_dir.clone();
            return self.materialize_bundle(&alias.identity, &alias.source, &manifest_dir);
        }
        self.materialize_bundle(identity, source, base)
    }

    /// Resolve a bundle reference used by `{ spec, bundle }` entries:
    /// a declared alias, or a fuzzy query against known bundles.
    fn bundle_for_query(&mut self, query: &str, _base: &Path) -> Result<usize> {
        if let Some(alias) = self.bundle_aliases.get(query).cloned() {
            let manifest_dir = self.manifest_dir.clone();
            return self.materialize_bundle(&alias.identity, &alias.source, &manifest_dir);
        }
        let matches: Vec<usize> = self
            .nodes
            .iter()
            .filter(|n| n.is_bundle() && n.identity.matches_query(query))
            .map(|n| n.id)
            .collect();
        match matches.len() {
            1 => Ok(matches[0]),
            0 => Err(Error::Interface(format!(
                "unknown bundle alias '{}' (not in BUNDLES and no materialized bundle matches)",
                query
            ))),
            _ => {
                let listed: Vec<&str> = matches.iter().map(|&i| self.nodes[i].key.as_str()).collect();
                Err(Error::Resolution(format!(
                    "bundle query '{}' is ambiguous; candidates: {}",
                    query,
                    listed.join(", ")
                )))
            }
        }
    }

    /// Materialize a bundle's contents into the cache (resolve-time, so
    /// member specs can be loaded) and add its node to the graph.
    fn materialize_bundle(
        &mut self,
        identity: &Identity,
        source: &str,
        base: &Path,
    ) -> Result<usize> {
        let key = identity.to_string();
        if let Some(&idx) = self.key_index.get(&key) {
            if !self.nodes[idx].is_bundle() {
                return Err(Error::Resolution(format!(
                    "'{}' is declared both as a spec and as a bundle",
                    key
                )));
            }
            return Ok(idx);
        }

        let asset_path = match self.store.ensure_bundle(identity)? {
            Outcome::FastPath(complete) => complete.payload_path,
            Outcome::Locked(entry) => {
                if is_url(source) {
                    let archive_name = source.rsplit('/').next().unwrap_or("bundle.tar.gz");
                    let download = entry.tmp_path.join(archive_name);
                    self.http.download_to_file(source, &download)?;
                    crate::archive::extract_archive(&download, &entry.install_path, 0)?;
                } else {
                    let path = resolve_source_path(source, base);
                    if path.is_dir() {
                        crate::archive::copy_tree(&path, &entry.install_path)?;
                    } else if crate::archive::is_archive(&path) {
                        crate::archive::extract_archive(&path, &entry.install_path, 0)?;
                    } else {
                        return Err(Error::Schema(format!(
                            "bundle source '{}' is neither a directory nor an archive",
                            path.display()
                        )));
                    }
                }
                entry.mark_complete()?.payload_path
            }
        };

        let manifest = load_bundle_manifest(&asset_path.join("envy-bundle.lua"), identity)?;

        let idx = self.nodes.len();
        self.key_index.insert(key.clone(), idx);
        self.nodes.push(Node {
            id: idx,
            identity: identity.clone(),
            options: None,
            key,
            base_dir: asset_path.clone(),
            payload: NodePayload::Bundle {
                manifest,
                asset_path,
            },
            edges: Vec::new(),
            used_fallbacks: BTreeSet::new(),
            variant_hash: String::new(),
            is_root: false,
        });
        Ok(idx)
    }

    fn product_candidates(&self, product: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|n| n.spec().map(|s| s.declares_product(product)) == Some(true))
            .map(|n| n.id)
            .collect()
    }

    /// Bind weak and ref-only product edges by fixpoint over the pool.
    fn run_fixpoint(&mut self) -> Result<()> {
        loop {
            let mut progress = false;
            for i in 0..self.pending.len() {
                if self.pending[i].resolved {
                    continue;
                }
                let product = self.pending[i].product.clone();
                let candidates = self.product_candidates(&product);
                match candidates.len() {
                    1 => {
                        let provider = candidates[0];
                        let consumer = self.pending[i].consumer;
                        let needed_by = self.pending[i].needed_by;
                        self.check_containment(consumer, &self.nodes[provider].identity.clone())?;
                        self.nodes[consumer].edges.push(ResolvedEdge {
                            target: provider,
                            needed_by,
                            kind: EdgeKind::Product {
                                name: product,
                                via_weak: true,
                            },
                        });
                        self.pending[i].resolved = true;
                        progress = true;
                    }
                    0 => {
                        if self.pending[i].fallback.is_some()
                            && !self.pending[i].fallback_instantiated
                        {
                            self.pending[i].fallback_instantiated = true;
                            let fallback = self.pending[i].fallback.clone().unwrap();
                            let consumer = self.pending[i].consumer;
                            let needed_by = self.pending[i].needed_by;
                            let consumer_base = self.nodes[consumer].base_dir.clone();
                            self.check_containment(consumer, &fallback.spec)?;
                            let fb_idx = self.instantiate_spec(
                                &fallback.spec,
                                &fallback.source,
                                None,
                                &consumer_base,
                            )?;
                            if !self.strong_closure_declares(fb_idx, &product) {
                                return Err(Error::Resolution(format!(
                                    "weak fallback '{}' does not provide product '{}' \
                                     (directly or through its strong dependencies)",
                                    fallback.spec, product
                                )));
                            }
                            let fb_key = self.nodes[fb_idx].key.clone();
                            self.nodes[consumer].edges.push(ResolvedEdge {
                                target: fb_idx,
                                needed_by,
                                kind: EdgeKind::Strong,
                            });
                            self.nodes[consumer].used_fallbacks.insert(fb_key);
                            progress = true;
                        }
                    }
                    _ => {
                        let listed: Vec<&str> =
                            candidates.iter().map(|&c| self.nodes[c].key.as_str()).collect();
                        return Err(Error::Resolution(format!(
                            "product '{}' required by '{}' is ambiguous; candidates: {}",
                            product,
                            self.nodes[self.pending[i].consumer].key,
                            listed.join(", ")
                        )));
                    }
                }
            }
            if !progress {
                break;
            }
        }

        let unresolved: Vec<String> = self
            .pending
            .iter()
            .filter(|p| !p.resolved)
            .map(|p| {
                format!(
                    "'{}' requires product '{}'",
                    self.nodes[p.consumer].key, p.product
                )
            })
            .collect();
        if !unresolved.is_empty() {
            return Err(Error::Resolution(format!(
                "{} unresolved weak dependencies (no progress): {}",
                unresolved.len(),
                unresolved.join("; ")
            )));
        }
        Ok(())
    }

    /// Reject order-dependent fixpoint outcomes: after convergence every
    /// bound product must still have exactly one provider in the final
    /// pool (later fallback instantiations can retroactively create a
    /// second provider for an already-bound edge).
    fn verify_unambiguous(&self) -> Result<()> {
        for p in &self.pending {
            let candidates = self.product_candidates(&p.product);
            if candidates.len() > 1 {
                let listed: Vec<&str> =
                    candidates.iter().map(|&c| self.nodes[c].key.as_str()).collect();
                return Err(Error::Resolution(format!(
                    "product '{}' required by '{}' is ambiguous; candidates: {}",
                    p.product,
                    self.nodes[p.consumer].key,
                    listed.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Whether `idx` or any node reachable over strong edges declares
    /// `product`. Used by weak-fallback and strong-product validation.
    fn strong_closure_declares(&self, idx: usize, product: &str) -> bool {
        let mut stack = vec![idx];
        let mut seen = BTreeSet::new();
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            if self.nodes[n].spec().map(|s| s.declares_product(product)) == Some(true) {
                return true;
            }
            for e in &self.nodes[n].edges {
                if e.is_strong() {
                    stack.push(e.target);
                }
            }
        }
        false
    }

    fn check_cycles(&self) -> Result<()> {
        // Build/install/check edges gate on full completion of the
        // dependency, so any strong cycle among them deadlocks.
        self.dfs_cycles(
            |e| e.is_strong() && matches!(e.needed_by, Phase::Build | Phase::Install | Phase::Check),
            "dependency cycle detected",
        )?;
        // Fetch/stage gates form their own ordering; cycles confined to
        // them are reported distinctly.
        self.dfs_cycles(
            |e| e.is_strong() && matches!(e.needed_by, Phase::Fetch | Phase::Stage),
            "fetch-level dependency cycle detected",
        )
    }

    fn dfs_cycles<F>(&self, follow: F, label: &str) -> Result<()>
    where
        F: Fn(&ResolvedEdge) -> bool,
    {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color = vec![Color::White; self.nodes.len()];
        let mut stack: Vec<usize> = Vec::new();

        fn visit<F: Fn(&ResolvedEdge) -> bool>(
            nodes: &[Node],
            follow: &F,
            color: &mut [Color],
            stack: &mut Vec<usize>,
            n: usize,
            label: &str,
        ) -> Result<()> {
            color[n] = Color::Gray;
            stack.push(n);
            for e in &nodes[n].edges {
                if !follow(e) {
                    continue;
                }
                match color[e.target] {
                    Color::Gray => {
                        let start = stack.iter().position(|&s| s == e.target).unwrap_or(0);
                        let mut path: Vec<&str> =
                            stack[start..].iter().map(|&i| nodes[i].key.as_str()).collect();
                        path.push(nodes[e.target].key.as_str());
                        return Err(Error::Resolution(format!(
                            "{}: {}",
                            label,
                            path.join(" -> ")
                        )));
                    }
                    Color::White => visit(nodes, follow, color, stack, e.target, label)?,
                    Color::Black => {}
                }
            }
            stack.pop();
            color[n] = Color::Black;
            Ok(())
        }

        for n in 0..self.nodes.len() {
            if color[n] == Color::White {
                visit(&self.nodes, &follow, &mut color, &mut stack, n, label)?;
            }
        }
        Ok(())
    }
}

/// Resolve a source string against a base directory. Absolute paths pass
/// through untouched.
pub fn resolve_source_path(source: &str, base: &Path) -> PathBuf {
    let path = Path::new(source);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
