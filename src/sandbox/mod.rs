//! Lua phase sandbox
//!
//! Each phase hook runs in a fresh Lua environment. The spec source is
//! re-evaluated with the load-time stubs (so top-level context calls
//! still refuse), then the `envy` table is rebound to the live phase API
//! before the hook is invoked. Context access (`package`, `product`,
//! `asset`, `loadenv_spec`) is checked against the caller's resolved
//! dependency edges and the current phase; every decision, allowed or
//! denied, emits a trace event.

use crate::cache::CacheStore;
use crate::error::{Error, Result};
use crate::net::{is_git_source, is_url, HttpClient};
use crate::resolver::{EdgeKind, Graph, Node, ResolvedEdge};
use crate::runner::{self, RunRequest, Shell, StopToken};
use crate::spec::dependency::Phase;
use crate::spec::loader::fresh_load_env;
use crate::spec::ProductDecl;
use crate::trace::{TraceEvent, TraceSink};
use mlua::{Lua, Table, Value};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// The four workspace directories a phase may touch.
#[derive(Debug, Clone)]
pub struct PhaseDirs {
    pub fetch: PathBuf,
    pub stage: PathBuf,
    pub install: PathBuf,
    pub tmp: PathBuf,
}

/// Everything one phase execution needs.
pub struct PhaseExec<'g> {
    pub graph: &'g Graph,
    pub node_id: usize,
    pub phase: Phase,
    pub store: &'g CacheStore,
    pub http: &'g HttpClient,
    pub trace: TraceSink,
    pub stop: StopToken,
    pub manifest_dir: PathBuf,
    pub dirs: PhaseDirs,
}

/// Facts the workspace driver needs back from a hook run.
#[derive(Debug, Default)]
pub struct PhaseReport {
    /// A programmatic fetch pulled from a git source; the fetch phase
    /// must not be marked cacheable.
    pub git_fetch: bool,
}

impl<'g> PhaseExec<'g> {
    pub fn node(&self) -> &Node {
        &self.graph.nodes[self.node_id]
    }

    /// Working directory for `envy.run` and shell-string hooks in this
    /// phase.
    pub fn phase_cwd(&self) -> PathBuf {
        let node = self.node();
        match self.phase {
            Phase::Check => self.manifest_dir.clone(),
            Phase::Fetch => self.dirs.tmp.clone(),
            Phase::Stage | Phase::Build => self.dirs.stage.clone(),
            Phase::Install => {
                if node.spec().map(|s| s.is_user_managed()) == Some(true) {
                    self.manifest_dir.clone()
                } else {
                    self.dirs.stage.clone()
                }
            }
        }
    }

    /// Call the node's hook function for the current phase.
    pub fn call_phase_function(&self) -> Result<PhaseReport> {
        let report = RefCell::new(PhaseReport::default());
        self.with_hook(HookMode::Plain, &report)?;
        Ok(report.into_inner())
    }

    /// Call a user-managed node's `CHECK` function and interpret its
    /// boolean result.
    pub fn call_check_function(&self) -> Result<bool> {
        let report = RefCell::new(PhaseReport::default());
        match self.with_hook(HookMode::Check, &report)? {
            OwnedResult::Bool(b) => Ok(b),
            OwnedResult::Unit => unreachable!("check mode returns a boolean"),
        }
    }

    /// Evaluate a programmatic `PRODUCTS` entry on a provider node and
    /// return its value rendered to a string (paths and scalars).
    pub fn programmatic_product(&self, provider: &Node, product: &str) -> Result<String> {
        let lua = fresh_load_env()?;
        let spec = provider
            .spec()
            .ok_or_else(|| Error::Resolution(format!("'{}' is not a package", provider.key)))?;
        lua.load(&spec.source)
            .set_name(spec.path.display().to_string())
            .exec()?;
        let products: Table = lua.globals().get("PRODUCTS")?;
        let func: mlua::Function = products.get(product)?;
        let value: Value = func.call(())?;
        lua_value_to_string(&value)
    }

    fn with_hook(&self, mode: HookMode, report: &RefCell<PhaseReport>) -> Result<OwnedResult> {
        let node = self.node();
        let spec = node
            .spec()
            .ok_or_else(|| Error::Phase(format!("'{}' has no phases", node.key)))?;

        let lua = fresh_load_env()?;
        lua.load(&spec.source)
            .set_name(spec.path.display().to_string())
            .exec()?;

        let hook_name = match self.phase {
            Phase::Check => "CHECK",
            Phase::Fetch => "FETCH",
            Phase::Stage => "STAGE",
            Phase::Build => "BUILD",
            Phase::Install => "INSTALL",
        };
        let hook: mlua::Function = lua.globals().get(hook_name).map_err(|_| {
            Error::Phase(format!(
                "spec '{}' has no {} function",
                node.identity, hook_name
            ))
        })?;

        let options_value = match &node.options {
            Some(o) => o.to_lua(&lua)?,
            None => Value::Nil,
        };

        let outcome: Cell<Option<OwnedResult>> = Cell::new(None);
        lua.scope(|scope| {
            let envy: Table = lua.globals().get("envy")?;
            self.bind_api(&lua, scope, &envy, report)?;

            let mut args: Vec<Value> = Vec::new();
            let s = |p: &Path| -> mlua::Result<Value> {
                Ok(Value::String(
                    lua.create_string(p.to_string_lossy().as_bytes())?,
                ))
            };
            match self.phase {
                Phase::Check => {
                    args.push(s(&self.manifest_dir)?);
                }
                Phase::Fetch => {
                    args.push(s(&self.dirs.tmp)?);
                }
                Phase::Stage => {
                    args.push(s(&self.dirs.fetch)?);
                    args.push(s(&self.dirs.stage)?);
                    args.push(s(&self.dirs.tmp)?);
                }
                Phase::Build => {
                    args.push(s(&self.dirs.stage)?);
                    args.push(s(&self.dirs.install)?);
                    args.push(s(&self.dirs.fetch)?);
                    args.push(s(&self.dirs.tmp)?);
                }
                Phase::Install => {
                    args.push(s(&self.dirs.install)?);
                    args.push(s(&self.dirs.stage)?);
                    args.push(s(&self.dirs.fetch)?);
                    args.push(s(&self.dirs.tmp)?);
                }
            }
            args.push(options_value.clone());

            let value: Value = hook.call(mlua::MultiValue::from_vec(args))?;
            let result = match mode {
                HookMode::Plain => OwnedResult::Unit,
                HookMode::Check => match value {
                    Value::Boolean(b) => OwnedResult::Bool(b),
                    other => {
                        return Err(Error::Phase(format!(
                            "CHECK for '{}' must return a boolean, got {}",
                            node.identity,
                            other.type_name()
                        ))
                        .into_lua())
                    }
                },
            };
            outcome.set(Some(result));
            Ok(())
        })?;

        Ok(outcome.into_inner().unwrap_or(OwnedResult::Unit))
    }

    /// Install the live `envy.*` API into the phase environment.
    fn bind_api<'scope, 'l: 'scope>(
        &'scope self,
        lua: &'l Lua,
        scope: &mlua::Scope<'l, 'scope>,
        envy: &Table<'l>,
        report: &'scope RefCell<PhaseReport>,
    ) -> mlua::Result<()> {
        let committed: RefCell<HashSet<String>> = RefCell::new(HashSet::new());

        envy.set(
            "info",
            scope.create_function(|_, msg: String| {
                eprintln!("envy: {}", msg);
                Ok(())
            })?,
        )?;

        let phase_cwd = self.phase_cwd();
        envy.set(
            "run",
            scope.create_function(move |lua, (cmd, opts): (String, Option<Table>)| {
                self.lua_run(lua, &cmd, opts, &phase_cwd)
            })?,
        )?;

        envy.set(
            "extract_all",
            scope.create_function(
                |_, (src, dest, opts): (String, String, Option<Table>)| {
                    let strip = match opts {
                        Some(t) => t.get::<_, Option<u32>>("strip")?.unwrap_or(0),
                        None => 0,
                    };
                    crate::archive::extract_all(Path::new(&src), Path::new(&dest), strip)
                        .map_err(Error::into_lua)?;
                    Ok(())
                },
            )?,
        )?;

        envy.set(
            "fetch",
            scope.create_function(move |_, (source, opts): (String, Option<Table>)| {
                self.lua_fetch(&source, opts, report)
            })?,
        )?;

        let fetch_dir = self.dirs.fetch.clone();
        envy.set(
            "commit_fetch",
            scope.create_function(move |_, (path, name): (String, Option<String>)| {
                let src = PathBuf::from(&path);
                let file_name = match name {
                    Some(n) => n,
                    None => src
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .ok_or_else(|| {
                            mlua::Error::external(format!("cannot commit '{}': no file name", path))
                        })?,
                };
                if !committed.borrow_mut().insert(file_name.clone()) {
                    return Err(Error::Phase(format!(
                        "fetch commit collision for '{}'",
                        file_name
                    ))
                    .into_lua());
                }
                let dest = fetch_dir.join(&file_name);
                std::fs::rename(&src, &dest)
                    .map_err(|e| {
                        mlua::Error::external(format!(
                            "commit_fetch {} -> {}: {}",
                            src.display(),
                            dest.display(),
                            e
                        ))
                    })?;
                Ok(dest.to_string_lossy().to_string())
            })?,
        )?;

        envy.set(
            "package",
            scope.create_function(move |_, query: String| self.lua_package(&query))?,
        )?;

        envy.set(
            "product",
            scope.create_function(move |lua, name: String| self.lua_product(lua, &name))?,
        )?;

        envy.set(
            "asset",
            scope.create_function(move |_, query: String| self.lua_asset(&query))?,
        )?;

        envy.set(
            "loadenv_spec",
            scope.create_function(move |lua, (query, subpath): (String, String)| {
                self.lua_loadenv_spec(lua, &query, &subpath)
            })?,
        )?;

        let base_dir = self.node().base_dir.clone();
        envy.set(
            "loadenv",
            scope.create_function(move |lua, subpath: String| {
                let path = base_dir.join(subpath.replace('.', "/")).with_extension("lua");
                load_lua_env(lua, &path)
            })?,
        )?;

        Ok(())
    }

    fn lua_run<'l>(
        &self,
        lua: &'l Lua,
        cmd: &str,
        opts: Option<Table>,
        phase_cwd: &Path,
    ) -> mlua::Result<Table<'l>> {
        let mut req = RunRequest::new(cmd, phase_cwd);
        req.stop = self.stop.clone();

        let mut cwd = phase_cwd.to_path_buf();
        if let Some(opts) = opts {
            if let Some(dir) = opts.get::<_, Option<String>>("cwd")? {
                let p = PathBuf::from(&dir);
                cwd = if p.is_absolute() { p } else { phase_cwd.join(p) };
            }
            if let Some(env) = opts.get::<_, Option<Table>>("env")? {
                let mut vars = BTreeMap::new();
                for pair in env.pairs::<String, String>() {
                    let (k, v) = pair?;
                    vars.insert(k, v);
                }
                req.env = vars;
            }
            if let Some(capture) = opts.get::<_, Option<bool>>("capture")? {
                req.capture = capture;
            }
            if let Some(quiet) = opts.get::<_, Option<bool>>("quiet")? {
                req.quiet = quiet;
            }
            if let Some(check) = opts.get::<_, Option<bool>>("check")? {
                req.check = check;
            }
            if let Some(shell) = opts.get::<_, Option<String>>("shell")? {
                req.shell = Shell::parse(&shell).map_err(Error::into_lua)?;
            }
        }
        req.cwd = &cwd;

        let output = runner::run(req).map_err(Error::into_lua)?;
        let result = lua.create_table()?;
        result.set("exit_code", output.exit_code)?;
        if !output.stdout.is_empty() || !output.stderr.is_empty() {
            result.set("stdout", output.stdout)?;
            result.set("stderr", output.stderr)?;
        }
        Ok(result)
    }

    fn lua_fetch(
        &self,
        source: &str,
        opts: Option<Table>,
        report: &RefCell<PhaseReport>,
    ) -> mlua::Result<String> {
        if self.phase != Phase::Fetch {
            return Err(Error::Phase(format!(
                "envy.fetch is only available during 'fetch', not '{}'",
                self.phase
            ))
            .into_lua());
        }
        let sha256 = match &opts {
            Some(t) => t.get::<_, Option<String>>("sha256")?,
            None => None,
        };

        let dest = if is_url(source) {
            let file_name = source.rsplit('/').next().unwrap_or("download");
            let dest = self.dirs.tmp.join(file_name);
            self.http
                .download_to_file(source, &dest)
                .map_err(Error::into_lua)?;
            dest
        } else if is_git_source(source) {
            report.borrow_mut().git_fetch = true;
            return Err(Error::Network(format!(
                "git transport is handled by the git fetcher, not envy.fetch: {}",
                source
            ))
            .into_lua());
        } else {
            let path = crate::resolver::resolve_source_path(source, &self.node().base_dir);
            let file_name = path.file_name().ok_or_else(|| {
                mlua::Error::external(format!("fetch source '{}' has no file name", source))
            })?;
            let dest = self.dirs.tmp.join(file_name);
            std::fs::copy(&path, &dest).map_err(|e| {
                mlua::Error::external(format!("fetch copy {}: {}", path.display(), e))
            })?;
            dest
        };

        if let Some(expected) = sha256 {
            crate::hash::verify_sha256(&dest, &expected, &format!("fetched {}", source))
                .map_err(Error::into_lua)?;
        }
        Ok(dest.to_string_lossy().to_string())
    }

    /// Find the caller's strong spec-dep edge matching `query`.
    fn find_strong_edge(&self, query: &str) -> Option<&ResolvedEdge> {
        self.node()
            .edges
            .iter()
            .find(|e| {
                matches!(e.kind, EdgeKind::Strong)
                    && self.graph.nodes[e.target].identity.matches_query(query)
            })
    }

    fn find_bundle_edge(&self, query: &str) -> Option<&ResolvedEdge> {
        self.node().edges.iter().find(|e| {
            matches!(e.kind, EdgeKind::Bundle { .. })
                && self.graph.nodes[e.target].identity.matches_query(query)
        })
    }

    fn lua_package(&self, query: &str) -> mlua::Result<String> {
        let caller = self.node().identity.to_string();
        let phase = self.phase;

        let deny = |target: String, message: String| -> mlua::Error {
            self.trace.emit(TraceEvent::LuaCtxPackageAccess {
                spec: caller.clone(),
                target,
                phase: phase.as_str().to_string(),
                allowed: false,
            });
            Error::Security(message).into_lua()
        };

        let Some(edge) = self.find_strong_edge(query) else {
            return Err(deny(
                query.to_string(),
                format!("spec '{}' has no strong dependency on '{}'", caller, query),
            ));
        };
        let target = &self.graph.nodes[edge.target];
        if edge.needed_by > phase {
            return Err(deny(
                target.identity.to_string(),
                format!(
                    "dependency '{}' has needed_by '{}' but accessed during '{}'",
                    target.identity, edge.needed_by, phase
                ),
            ));
        }
        if target.spec().map(|s| s.is_user_managed()) == Some(true) {
            return Err(deny(
                target.identity.to_string(),
                format!(
                    "dependency '{}' is user-managed and has no pkg path",
                    target.identity
                ),
            ));
        }

        self.trace.emit(TraceEvent::LuaCtxPackageAccess {
            spec: caller,
            target: target.identity.to_string(),
            phase: phase.as_str().to_string(),
            allowed: true,
        });
        let pkg = self
            .store
            .package_entry_path(&target.identity, &target.variant_hash)
            .join("pkg");
        Ok(pkg.to_string_lossy().to_string())
    }

    fn lua_product<'l>(&self, lua: &'l Lua, name: &str) -> mlua::Result<Value<'l>> {
        let caller = self.node().identity.to_string();
        let phase = self.phase;

        let deny = |target: String, message: String| -> mlua::Error {
            self.trace.emit(TraceEvent::LuaCtxProductAccess {
                spec: caller.clone(),
                target,
                product: name.to_string(),
                phase: phase.as_str().to_string(),
                allowed: false,
            });
            Error::Security(message).into_lua()
        };

        let edge = self.node().edges.iter().find(
            |e| matches!(&e.kind, EdgeKind::Product { name: n, .. } if n.as_str() == name),
        );
        let Some(edge) = edge else {
            return Err(deny(
                name.to_string(),
                format!(
                    "spec '{}' does not declare product dependency '{}'",
                    caller, name
                ),
            ));
        };
        let provider = &self.graph.nodes[edge.target];
        if edge.needed_by > phase {
            return Err(deny(
                provider.identity.to_string(),
                format!(
                    "dependency '{}' has needed_by '{}' but accessed during '{}'",
                    provider.identity, edge.needed_by, phase
                ),
            ));
        }
        if provider.spec().map(|s| s.is_user_managed()) == Some(true) {
            return Err(deny(
                provider.identity.to_string(),
                format!(
                    "provider '{}' is user-managed and has no pkg path",
                    provider.identity
                ),
            ));
        }

        self.trace.emit(TraceEvent::LuaCtxProductAccess {
            spec: caller,
            target: provider.identity.to_string(),
            product: name.to_string(),
            phase: phase.as_str().to_string(),
            allowed: true,
        });

        let decl = provider
            .spec()
            .and_then(|s| s.products.get(name))
            .cloned()
            .ok_or_else(|| {
                mlua::Error::external(format!(
                    "provider '{}' lost product '{}'",
                    provider.key, name
                ))
            })?;
        match decl {
            ProductDecl::Path(rel) => {
                let pkg = self
                    .store
                    .package_entry_path(&provider.identity, &provider.variant_hash)
                    .join("pkg")
                    .join(rel);
                Ok(Value::String(
                    lua.create_string(pkg.to_string_lossy().as_bytes())?,
                ))
            }
            ProductDecl::Function => {
                let rendered = self
                    .programmatic_product(provider, name)
                    .map_err(Error::into_lua)?;
                Ok(Value::String(lua.create_string(rendered.as_bytes())?))
            }
        }
    }

    fn lua_asset(&self, query: &str) -> mlua::Result<String> {
        let caller = self.node().identity.to_string();
        let phase = self.phase;

        let deny = |target: String, message: String| -> mlua::Error {
            self.trace.emit(TraceEvent::LuaCtxAssetAccess {
                spec: caller.clone(),
                target,
                phase: phase.as_str().to_string(),
                allowed: false,
            });
            Error::Security(message).into_lua()
        };

        if let Some(edge) = self.find_bundle_edge(query) {
            let target = &self.graph.nodes[edge.target];
            if edge.needed_by > phase {
                return Err(deny(
                    target.identity.to_string(),
                    format!(
                        "dependency '{}' has needed_by '{}' but accessed during '{}'",
                        target.identity, edge.needed_by, phase
                    ),
                ));
            }
            self.trace.emit(TraceEvent::LuaCtxAssetAccess {
                spec: caller,
                target: target.identity.to_string(),
                phase: phase.as_str().to_string(),
                allowed: true,
            });
            let asset = target
                .asset_path()
                .expect("bundle edges target bundle nodes");
            return Ok(asset.to_string_lossy().to_string());
        }

        // A strong spec dep may be asked for its asset; user-managed
        // targets have nothing on disk to hand out.
        if let Some(edge) = self.find_strong_edge(query) {
            let target = &self.graph.nodes[edge.target];
            if edge.needed_by > phase {
                return Err(deny(
                    target.identity.to_string(),
                    format!(
                        "dependency '{}' has needed_by '{}' but accessed during '{}'",
                        target.identity, edge.needed_by, phase
                    ),
                ));
            }
            if target.spec().map(|s| s.is_user_managed()) == Some(true) {
                return Err(deny(
                    target.identity.to_string(),
                    format!(
                        "dependency '{}' is user-managed and has no asset path",
                        target.identity
                    ),
                ));
            }
            self.trace.emit(TraceEvent::LuaCtxAssetAccess {
                spec: caller,
                target: target.identity.to_string(),
                phase: phase.as_str().to_string(),
                allowed: true,
            });
            let pkg = self
                .store
                .package_entry_path(&target.identity, &target.variant_hash)
                .join("pkg");
            return Ok(pkg.to_string_lossy().to_string());
        }

        Err(deny(
            query.to_string(),
            format!("spec '{}' has no strong dependency on '{}'", caller, query),
        ))
    }

    fn lua_loadenv_spec<'l>(
        &self,
        lua: &'l Lua,
        query: &str,
        subpath: &str,
    ) -> mlua::Result<Value<'l>> {
        let caller = self.node().identity.to_string();
        let phase = self.phase;

        // The trace records the caller's unresolved query string; tests
        // pin this schema.
        let emit = |allowed: bool| {
            self.trace.emit(TraceEvent::LuaCtxLoadenvSpecAccess {
                spec: caller.clone(),
                target: query.to_string(),
                phase: phase.as_str().to_string(),
                allowed,
            });
        };

        let Some(edge) = self.find_bundle_edge(query) else {
            emit(false);
            return Err(Error::Security(format!(
                "spec '{}' has no strong dependency on '{}'",
                caller, query
            ))
            .into_lua());
        };
        let target = &self.graph.nodes[edge.target];
        if edge.needed_by > phase {
            emit(false);
            return Err(Error::Security(format!(
                "dependency '{}' has needed_by '{}' but accessed during '{}'",
                target.identity, edge.needed_by, phase
            ))
            .into_lua());
        }
        emit(true);

        let asset = target
            .asset_path()
            .expect("bundle edges target bundle nodes");
        let path = asset.join(subpath.replace('.', "/")).with_extension("lua");
        load_lua_env(lua, &path)
    }
}

#[derive(Clone, Copy)]
enum HookMode {
    Plain,
    Check,
}

enum OwnedResult {
    Unit,
    Bool(bool),
}

/// Evaluate a Lua file and return its return value (module style).
fn load_lua_env<'l>(lua: &'l Lua, path: &Path) -> mlua::Result<Value<'l>> {
    let source = std::fs::read_to_string(path).map_err(|e| {
        mlua::Error::external(format!("cannot load {}: {}", path.display(), e))
    })?;
    lua.load(&source)
        .set_name(path.display().to_string())
        .eval()
}

fn lua_value_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.to_str()?.to_string()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Boolean(b) => Ok(b.to_string()),
        other => Err(Error::Phase(format!(
            "programmatic product returned unrepresentable {}",
            other.type_name()
        ))),
    }
}
