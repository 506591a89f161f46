//! Workspace driver
//!
//! Executes one instance's phases against its cache entry. The driver
//! owns the begin/phase/finish protocol:
//!
//! - `begin_cache_managed` takes the entry lock (or the fast path), and
//!   consults the depot before any source build;
//! - `begin_user_check` runs `CHECK` unlocked, then re-checks under the
//!   lock before conceding that an install is required;
//! - `run_phase` executes fetch, stage, build, and install with the
//!   declarative/programmatic split per hook kind;
//! - `finish` commits cache-managed entries and purges user-managed ones.

use crate::cache::{CacheStore, Outcome};
use crate::depot::DepotIndex;
use crate::error::{Error, Result};
use crate::net::{is_git_source, is_url, HttpClient};
use crate::resolver::{Graph, Node};
use crate::runner::{self, RunRequest, StopToken};
use crate::sandbox::{PhaseDirs, PhaseExec};
use crate::spec::dependency::Phase;
use crate::spec::{FetchDecl, HookKind, StageDecl};
use crate::trace::TraceSink;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Live execution state for one node between phases.
pub struct NodeExec {
    pub entry: crate::cache::LockedEntry,
    pub dirs: PhaseDirs,
    pub user_managed: bool,
    /// Set when a programmatic fetch used a git source; the fetch marker
    /// is withheld so the sources are re-fetched next time.
    pub git_fetch: bool,
    /// Depot archive already populated the install tree; fetch, stage,
    /// and build are skipped and finish commits directly.
    pub depot_restored: bool,
}

/// Outcome of starting a cache-managed node.
pub enum BeginOutcome {
    /// Entry was already complete, or the depot archive satisfied it.
    Complete,
    /// The lock is held; phases must run.
    Active(Box<NodeExec>),
}

/// Outcome of a user-managed node's check step.
pub enum CheckOutcome {
    /// CHECK returned true (possibly under the double-check lock).
    Passed,
    /// CHECK returned false with the lock held; install phases must run.
    NeedsInstall(Box<NodeExec>),
}

pub struct WorkspaceDriver<'g> {
    pub graph: &'g Graph,
    pub store: &'g CacheStore,
    pub http: &'g HttpClient,
    pub depot: &'g DepotIndex,
    pub trace: TraceSink,
    pub stop: StopToken,
    pub manifest_dir: PathBuf,
}

impl<'g> WorkspaceDriver<'g> {
    fn node(&self, id: usize) -> &Node {
        &self.graph.nodes[id]
    }

    fn exec_ctx<'a>(&'a self, node_id: usize, phase: Phase, dirs: &PhaseDirs) -> PhaseExec<'a> {
        PhaseExec {
            graph: self.graph,
            node_id,
            phase,
            store: self.store,
            http: self.http,
            trace: self.trace.clone(),
            stop: self.stop.clone(),
            manifest_dir: self.manifest_dir.clone(),
            dirs: dirs.clone(),
        }
    }

    fn dirs_for(entry: &crate::cache::LockedEntry) -> PhaseDirs {
        PhaseDirs {
            fetch: entry.fetch_path.clone(),
            stage: entry.stage_path.clone(),
            install: entry.install_path.clone(),
            tmp: entry.tmp_path.clone(),
        }
    }

    /// Start a cache-managed node: fast path, depot restore, or lock.
    pub fn begin_cache_managed(&self, node_id: usize) -> Result<BeginOutcome> {
        let node = self.node(node_id);
        let entry = match self.store.ensure_package(&node.identity, &node.variant_hash)? {
            Outcome::FastPath(_) => return Ok(BeginOutcome::Complete),
            Outcome::Locked(entry) => entry,
        };

        let depot_restored = self.depot.try_restore(
            self.http,
            self.store.platform_arch(),
            &node.identity,
            &node.variant_hash,
            &entry,
        );

        let dirs = Self::dirs_for(&entry);
        Ok(BeginOutcome::Active(Box::new(NodeExec {
            entry,
            dirs,
            user_managed: false,
            git_fetch: false,
            depot_restored,
        })))
    }

    /// Run a user-managed node's check step, with the double-check under
    /// the lock that collapses concurrent installers into one.
    pub fn begin_user_check(&self, node_id: usize) -> Result<CheckOutcome> {
        let node = self.node(node_id);

        // First check runs without any lock; a true result means the
        // package is already on the host and nothing else happens.
        if self.run_check(node_id)? {
            return Ok(CheckOutcome::Passed);
        }

        let entry = match self.store.ensure_package(&node.identity, &node.variant_hash)? {
            // A concurrent process may have completed and purged; the
            // marker path for user-managed entries never persists, so a
            // fast path here means stale state. Re-check decides.
            Outcome::FastPath(_) => {
                return if self.run_check(node_id)? {
                    Ok(CheckOutcome::Passed)
                } else {
                    Err(Error::Cache(format!(
                        "user-managed entry for '{}' is unexpectedly complete in the cache",
                        node.key
                    )))
                };
            }
            Outcome::Locked(entry) => entry,
        };

        // Double-check: whoever held the lock before us may have
        // installed the package already.
        if self.run_check(node_id)? {
            entry.purge()?;
            return Ok(CheckOutcome::Passed);
        }

        let dirs = Self::dirs_for(&entry);
        Ok(CheckOutcome::NeedsInstall(Box::new(NodeExec {
            entry,
            dirs,
            user_managed: true,
            git_fetch: false,
            depot_restored: false,
        })))
    }

    fn run_check(&self, node_id: usize) -> Result<bool> {
        let node = self.node(node_id);
        let spec = node
            .spec()
            .ok_or_else(|| Error::Phase(format!("'{}' has no CHECK", node.key)))?;
        let check = spec
            .hooks
            .check
            .clone()
            .ok_or_else(|| Error::Phase(format!("'{}' is not user-managed", node.key)))?;

        match check {
            HookKind::Function => {
                // CHECK gets no workspace; a scratch dir satisfies the
                // sandbox's directory plumbing.
                let scratch = tempfile::tempdir()?;
                let dirs = PhaseDirs {
                    fetch: scratch.path().to_path_buf(),
                    stage: scratch.path().to_path_buf(),
                    install: scratch.path().to_path_buf(),
                    tmp: scratch.path().to_path_buf(),
                };
                let exec = self.exec_ctx(node_id, Phase::Check, &dirs);
                exec.call_check_function()
            }
            HookKind::Shell(cmd) => {
                let mut req = RunRequest::new(&cmd, &self.manifest_dir);
                req.check = false;
                req.quiet = true;
                req.stop = self.stop.clone();
                req.env = self.phase_env(node_id, None);
                let output = runner::run(req)?;
                Ok(output.exit_code == 0)
            }
        }
    }

    /// Execute one phase of an active node.
    pub fn run_phase(&self, node_id: usize, phase: Phase, exec: &mut NodeExec) -> Result<()> {
        if exec.depot_restored {
            return Ok(());
        }
        match phase {
            Phase::Check => Ok(()), // handled by begin_user_check
            Phase::Fetch => self.run_fetch(node_id, exec),
            Phase::Stage => self.run_stage(node_id, exec),
            Phase::Build => self.run_build(node_id, exec),
            Phase::Install => self.run_install(node_id, exec),
        }
    }

    /// Commit or purge the finished node. Cache-managed entries promote
    /// `work/install` to `pkg/` and write the marker; user-managed
    /// entries leave nothing behind.
    pub fn finish(&self, _node_id: usize, exec: NodeExec) -> Result<()> {
        if exec.user_managed {
            exec.entry.purge()
        } else {
            exec.entry.mark_complete().map(|_| ())
        }
    }

    fn spec_of(&self, node_id: usize) -> Result<&crate::spec::Spec> {
        self.node(node_id)
            .spec()
            .ok_or_else(|| Error::Phase(format!("'{}' is not a package", self.node(node_id).key)))
    }

    /// Environment for shell-string hooks: the workspace directories.
    fn phase_env(&self, _node_id: usize, exec: Option<&NodeExec>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(exec) = exec {
            env.insert(
                "ENVY_FETCH_DIR".to_string(),
                exec.dirs.fetch.display().to_string(),
            );
            env.insert(
                "ENVY_STAGE_DIR".to_string(),
                exec.dirs.stage.display().to_string(),
            );
            env.insert(
                "ENVY_INSTALL_DIR".to_string(),
                exec.dirs.install.display().to_string(),
            );
            env.insert(
                "ENVY_TMP_DIR".to_string(),
                exec.dirs.tmp.display().to_string(),
            );
        }
        env.insert(
            "ENVY_PROJECT_ROOT".to_string(),
            self.manifest_dir.display().to_string(),
        );
        env
    }

    fn run_shell_phase(
        &self,
        cmd: &str,
        cwd: &Path,
        node_id: usize,
        exec: &NodeExec,
    ) -> Result<()> {
        let mut req = RunRequest::new(cmd, cwd);
        req.stop = self.stop.clone();
        req.env = self.phase_env(node_id, Some(exec));
        runner::run(req).map(|_| ())
    }

    fn run_fetch(&self, node_id: usize, exec: &mut NodeExec) -> Result<()> {
        // A fully-verified fetch from a previous generation is reused.
        if exec.entry.fetch_is_complete() {
            return Ok(());
        }
        let spec = self.spec_of(node_id)?;
        let Some(fetch) = spec.hooks.fetch.clone() else {
            return Ok(());
        };

        let mut cacheable = true;
        match fetch {
            FetchDecl::Declarative(sources) => {
                for source in &sources {
                    if is_git_source(&source.source) {
                        // Git checkouts are delegated to the external git
                        // fetcher and are never marked fetch-complete.
                        return Err(Error::Network(format!(
                            "git fetch source '{}' requires the git transport, which is not \
                             available in this build",
                            source.source
                        )));
                    }
                    let file_name = source
                        .source
                        .rsplit('/')
                        .next()
                        .filter(|s| !s.is_empty())
                        .ok_or_else(|| {
                            Error::Schema(format!(
                                "fetch source '{}' has no file name",
                                source.source
                            ))
                        })?;
                    let staged = exec.dirs.tmp.join(file_name);
                    if is_url(&source.source) {
                        self.http.download_to_file(&source.source, &staged)?;
                    } else {
                        let path = crate::resolver::resolve_source_path(
                            &source.source,
                            &self.node(node_id).base_dir,
                        );
                        std::fs::copy(&path, &staged).map_err(|e| {
                            Error::Io(std::io::Error::new(
                                e.kind(),
                                format!("fetch copy {}: {}", path.display(), e),
                            ))
                        })?;
                    }
                    if let Some(expected) = &source.sha256 {
                        crate::hash::verify_sha256(
                            &staged,
                            expected,
                            &format!("fetched {}", source.source),
                        )?;
                    }
                    let dest = exec.dirs.fetch.join(file_name);
                    std::fs::rename(&staged, &dest)?;
                }
            }
            FetchDecl::Function => {
                let ctx = self.exec_ctx(node_id, Phase::Fetch, &exec.dirs);
                let report = ctx.call_phase_function()?;
                if report.git_fetch {
                    exec.git_fetch = true;
                    cacheable = false;
                }
            }
        }

        if cacheable {
            exec.entry.mark_fetch_complete()?;
        }
        Ok(())
    }

    fn run_stage(&self, node_id: usize, exec: &mut NodeExec) -> Result<()> {
        let spec = self.spec_of(node_id)?;
        match spec.hooks.stage.clone() {
            None => {
                crate::archive::extract_all(&exec.dirs.fetch, &exec.dirs.stage, 0)?;
                Ok(())
            }
            Some(StageDecl::Strip(strip)) => {
                crate::archive::extract_all(&exec.dirs.fetch, &exec.dirs.stage, strip)?;
                Ok(())
            }
            Some(StageDecl::Shell(cmd)) => {
                let cwd = exec.dirs.stage.clone();
                self.run_shell_phase(&cmd, &cwd, node_id, exec)
            }
            Some(StageDecl::Function) => {
                let ctx = self.exec_ctx(node_id, Phase::Stage, &exec.dirs);
                ctx.call_phase_function().map(|_| ())
            }
        }
    }

    fn run_build(&self, node_id: usize, exec: &mut NodeExec) -> Result<()> {
        let spec = self.spec_of(node_id)?;
        match spec.hooks.build.clone() {
            None => Ok(()),
            Some(HookKind::Shell(cmd)) => {
                let cwd = exec.dirs.stage.clone();
                self.run_shell_phase(&cmd, &cwd, node_id, exec)
            }
            Some(HookKind::Function) => {
                let ctx = self.exec_ctx(node_id, Phase::Build, &exec.dirs);
                ctx.call_phase_function().map(|_| ())
            }
        }
    }

    fn run_install(&self, node_id: usize, exec: &mut NodeExec) -> Result<()> {
        let spec = self.spec_of(node_id)?;
        match spec.hooks.install.clone() {
            None => {
                if exec.user_managed {
                    return Err(Error::Phase(format!(
                        "user-managed spec '{}' has no INSTALL hook",
                        spec.identity
                    )));
                }
                // No INSTALL: the stage output is the package.
                promote_stage(&exec.dirs.stage, &exec.dirs.install)
            }
            Some(HookKind::Shell(cmd)) => {
                let cwd = if exec.user_managed {
                    self.manifest_dir.clone()
                } else {
                    exec.dirs.stage.clone()
                };
                self.run_shell_phase(&cmd, &cwd, node_id, exec)
            }
            Some(HookKind::Function) => {
                let ctx = self.exec_ctx(node_id, Phase::Install, &exec.dirs);
                ctx.call_phase_function().map(|_| ())
            }
        }
    }
}

/// Replace the (empty) install tree with the staged tree.
fn promote_stage(stage: &Path, install: &Path) -> Result<()> {
    if install.exists() {
        std::fs::remove_dir_all(install)?;
    }
    std::fs::rename(stage, install).map_err(|e| {
        Error::Cache(format!(
            "promote stage {} -> {}: {}",
            stage.display(),
            install.display(),
            e
        ))
    })?;
    // Keep the stage path present for later phases that resolve it.
    std::fs::create_dir_all(stage)?;
    Ok(())
}
