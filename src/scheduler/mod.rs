//! Phase scheduler
//!
//! Drives the resolved DAG to completion across a pool of worker
//! threads sharing a ready queue. Nodes are dispatched one phase at a
//! time; an edge `U -> V` with `needed_by = P` holds V's phase P until U
//! reaches the corresponding completion level. Failures propagate to
//! transitive dependents as `Unreachable` while independent subgraphs
//! keep running. Cancellation is cooperative: the shared stop token is
//! polled between phases.

pub mod state;

use crate::resolver::Graph;
use crate::runner::StopToken;
use crate::spec::dependency::Phase;
use crate::trace::{TraceEvent, TraceSink};
use crate::workspace::{BeginOutcome, CheckOutcome, NodeExec, WorkspaceDriver};
use indicatif::ProgressBar;
use state::{gate_level, level_after, NodeReport, NodeStatus, SchedState};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub struct Scheduler<'g> {
    graph: &'g Graph,
    driver: WorkspaceDriver<'g>,
    trace: TraceSink,
    stop: StopToken,
    jobs: usize,
    progress: Option<ProgressBar>,
}

struct Shared {
    state: Mutex<SchedState>,
    cv: Condvar,
}

/// Per-node phase plan. Bundles are materialized at resolve time and
/// enter the run already complete.
fn phase_plan(graph: &Graph, node: usize) -> &'static [Phase] {
    const CACHE_MANAGED: &[Phase] = &[Phase::Fetch, Phase::Stage, Phase::Build, Phase::Install];
    const USER_MANAGED: &[Phase] = &[
        Phase::Check,
        Phase::Fetch,
        Phase::Stage,
        Phase::Build,
        Phase::Install,
    ];
    match graph.nodes[node].spec() {
        None => &[],
        Some(spec) if spec.is_user_managed() => USER_MANAGED,
        Some(_) => CACHE_MANAGED,
    }
}

/// The phase of `node` that an incoming edge with this `needed_by`
/// gates: the first planned phase at or past the annotation.
fn gated_phase(plan: &[Phase], needed_by: Phase) -> Option<Phase> {
    plan.iter().copied().find(|p| *p >= needed_by)
}

impl<'g> Scheduler<'g> {
    pub fn new(
        graph: &'g Graph,
        driver: WorkspaceDriver<'g>,
        trace: TraceSink,
        stop: StopToken,
        jobs: usize,
        progress: Option<ProgressBar>,
    ) -> Self {
        Self {
            graph,
            driver,
            trace,
            stop,
            jobs: jobs.max(1),
            progress,
        }
    }

    /// Run the whole graph; returns one report per package node.
    pub fn run(self) -> Vec<NodeReport> {
        let n = self.graph.nodes.len();
        let shared = Shared {
            state: Mutex::new(SchedState::new(n)),
            cv: Condvar::new(),
        };
        let execs: Vec<Mutex<Option<NodeExec>>> =
            (0..n).map(|_| Mutex::new(None)).collect();

        // Reverse adjacency for failure propagation.
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for node in &self.graph.nodes {
            for edge in &node.edges {
                dependents[edge.target].push(node.id);
            }
        }

        {
            let mut st = shared.state.lock().unwrap();
            for node in &self.graph.nodes {
                if node.is_bundle() {
                    st.finish_node(node.id, NodeStatus::Complete);
                }
            }
            self.enqueue_startable(&mut st);
        }

        std::thread::scope(|scope| {
            for _ in 0..self.jobs {
                scope.spawn(|| self.worker(&shared, &execs, &dependents));
            }
        });

        let st = shared.state.lock().unwrap();
        self.graph
            .nodes
            .iter()
            .filter(|node| !node.is_bundle())
            .map(|node| NodeReport {
                key: node.key.clone(),
                status: st.status[node.id].clone(),
            })
            .collect()
    }

    fn worker(
        &self,
        shared: &Shared,
        execs: &[Mutex<Option<NodeExec>>],
        dependents: &[Vec<usize>],
    ) {
        let n = self.graph.nodes.len();
        loop {
            let node = {
                let mut st = shared.state.lock().unwrap();
                loop {
                    if st.all_done(n) {
                        shared.cv.notify_all();
                        return;
                    }
                    if self.stop.is_stopped() {
                        self.cancel_remaining(&mut st);
                        shared.cv.notify_all();
                        return;
                    }
                    if let Some(node) = st.queue.pop_front() {
                        if st.status[node] != NodeStatus::Queued {
                            continue;
                        }
                        st.status[node] = NodeStatus::Running;
                        st.running += 1;
                        break node;
                    }
                    if st.running == 0 {
                        // Nothing queued, nothing running, nodes remain:
                        // the gates cannot be satisfied. Fail them rather
                        // than hang.
                        self.fail_stalled(&mut st);
                        shared.cv.notify_all();
                        return;
                    }
                    st = shared.cv.wait(st).unwrap();
                }
            };

            let phase = {
                let st = shared.state.lock().unwrap();
                phase_plan(self.graph, node)[st.next_phase[node]]
            };

            let outcome = self.run_phase_unit(node, phase, &execs[node]);

            let mut st = shared.state.lock().unwrap();
            st.running -= 1;
            match outcome {
                UnitOutcome::NodeComplete => {
                    st.finish_node(node, NodeStatus::Complete);
                    if let Some(bar) = &self.progress {
                        bar.inc(1);
                        bar.set_message(self.graph.nodes[node].key.clone());
                    }
                }
                UnitOutcome::PhaseDone => {
                    // A failure elsewhere may have made us unreachable
                    // while this phase was running.
                    if st.poisoned[node] {
                        st.finish_node(node, NodeStatus::Unreachable);
                    } else {
                        st.level[node] = st.level[node].max(level_after(phase));
                        st.next_phase[node] += 1;
                        st.status[node] = NodeStatus::Pending;
                    }
                }
                UnitOutcome::Failed(message) => {
                    st.finish_node(node, NodeStatus::Failed(message));
                    self.mark_unreachable(&mut st, dependents, node);
                    if let Some(bar) = &self.progress {
                        bar.inc(1);
                    }
                }
            }
            self.enqueue_startable(&mut st);
            shared.cv.notify_all();
        }
    }

    fn run_phase_unit(
        &self,
        node: usize,
        phase: Phase,
        exec_slot: &Mutex<Option<NodeExec>>,
    ) -> UnitOutcome {
        let key = self.graph.nodes[node].identity.to_string();
        self.trace.emit(TraceEvent::PhaseStart {
            spec: key.clone(),
            phase: phase.as_str().to_string(),
        });

        let result = self.dispatch(node, phase, exec_slot);

        match result {
            Ok(outcome) => {
                self.trace.emit(TraceEvent::PhaseComplete {
                    spec: key,
                    phase: phase.as_str().to_string(),
                });
                outcome
            }
            Err(e) => UnitOutcome::Failed(e.to_string()),
        }
    }

    fn dispatch(
        &self,
        node: usize,
        phase: Phase,
        exec_slot: &Mutex<Option<NodeExec>>,
    ) -> crate::error::Result<UnitOutcome> {
        let mut slot = exec_slot.lock().unwrap();
        let plan = phase_plan(self.graph, node);
        let last_phase = *plan.last().expect("package nodes have phases");

        match phase {
            Phase::Check => {
                match self.driver.begin_user_check(node)? {
                    CheckOutcome::Passed => return Ok(UnitOutcome::NodeComplete),
                    CheckOutcome::NeedsInstall(exec) => {
                        *slot = Some(*exec);
                    }
                }
                return Ok(UnitOutcome::PhaseDone);
            }
            Phase::Fetch if slot.is_none() => {
                match self.driver.begin_cache_managed(node)? {
                    BeginOutcome::Complete => return Ok(UnitOutcome::NodeComplete),
                    BeginOutcome::Active(exec) => {
                        *slot = Some(*exec);
                    }
                }
            }
            _ => {}
        }

        let exec = slot
            .as_mut()
            .expect("active node has exec state");
        self.driver.run_phase(node, phase, exec)?;

        if phase == last_phase {
            let exec = slot.take().expect("exec present at finish");
            self.driver.finish(node, exec)?;
            return Ok(UnitOutcome::NodeComplete);
        }
        Ok(UnitOutcome::PhaseDone)
    }

    /// Enqueue every pending node whose next phase has all gates open.
    fn enqueue_startable(&self, st: &mut SchedState) {
        let mut newly: VecDeque<usize> = VecDeque::new();
        for node in &self.graph.nodes {
            if st.status[node.id] != NodeStatus::Pending {
                continue;
            }
            let plan = phase_plan(self.graph, node.id);
            if plan.is_empty() {
                continue;
            }
            let next = plan[st.next_phase[node.id]];
            let blocked = node.edges.iter().any(|edge| {
                gated_phase(plan, edge.needed_by) == Some(next)
                    && st.level[edge.target] < gate_level(edge.needed_by)
            });
            if !blocked {
                newly.push_back(node.id);
            }
        }
        for node in newly {
            st.status[node] = NodeStatus::Queued;
            st.queue.push_back(node);
        }
    }

    fn mark_unreachable(&self, st: &mut SchedState, dependents: &[Vec<usize>], failed: usize) {
        let mut stack = vec![failed];
        while let Some(n) = stack.pop() {
            for &dep in &dependents[n] {
                match st.status[dep] {
                    NodeStatus::Pending | NodeStatus::Queued => {
                        st.finish_node(dep, NodeStatus::Unreachable);
                        if let Some(bar) = &self.progress {
                            bar.inc(1);
                        }
                        stack.push(dep);
                    }
                    NodeStatus::Running => {
                        // Flag it; the owning worker resolves the status
                        // when the in-flight phase returns.
                        st.poisoned[dep] = true;
                        stack.push(dep);
                    }
                    _ => {}
                }
            }
        }
    }

    fn cancel_remaining(&self, st: &mut SchedState) {
        for id in 0..self.graph.nodes.len() {
            if matches!(st.status[id], NodeStatus::Pending | NodeStatus::Queued) {
                st.finish_node(id, NodeStatus::Cancelled);
            }
        }
        st.queue.clear();
    }

    fn fail_stalled(&self, st: &mut SchedState) {
        for id in 0..self.graph.nodes.len() {
            if matches!(st.status[id], NodeStatus::Pending | NodeStatus::Queued) {
                st.finish_node(
                    id,
                    NodeStatus::Failed(format!(
                        "phase gates for '{}' can never be satisfied",
                        self.graph.nodes[id].key
                    )),
                );
            }
        }
        st.queue.clear();
    }
}

enum UnitOutcome {
    /// The node reached its terminal state (fast path, passed check,
    /// depot restore, or committed install).
    NodeComplete,
    /// One phase finished; the node waits for its next gates.
    PhaseDone,
    Failed(String),
}
