//! `envy sync`: materialize the manifest into the cache.

use super::{EngineContext, GlobalArgs};
use crate::error::{Error, Result};
use crate::runner::StopToken;
use crate::scheduler::state::NodeStatus;
use crate::scheduler::Scheduler;
use crate::workspace::WorkspaceDriver;
use clap::Args;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Args, Debug)]
pub struct SyncArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Suppress the progress bar
    #[arg(long)]
    pub quiet: bool,
}

pub fn run(args: &SyncArgs) -> Result<()> {
    let ctx = EngineContext::load(&args.global)?;
    let graph = ctx.resolve()?;
    let depot = ctx.depot();
    let stop = StopToken::new();

    let package_count = graph.package_nodes().count();
    let progress = if args.quiet || package_count == 0 {
        None
    } else {
        let bar = ProgressBar::new(package_count as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}")
                .expect("static template parses"),
        );
        Some(bar)
    };

    let driver = WorkspaceDriver {
        graph: &graph,
        store: &ctx.store,
        http: &ctx.http,
        depot: &depot,
        trace: ctx.trace.clone(),
        stop: stop.clone(),
        manifest_dir: ctx.manifest.dir.clone(),
    };
    let scheduler = Scheduler::new(
        &graph,
        driver,
        ctx.trace.clone(),
        stop,
        ctx.jobs,
        progress.clone(),
    );
    let reports = scheduler.run();
    if let Some(bar) = progress {
        bar.finish_and_clear();
    }

    let mut first_error: Option<String> = None;
    for report in &reports {
        match &report.status {
            NodeStatus::Complete => {}
            NodeStatus::Failed(message) => {
                eprintln!("{} {}: {}", "failed:".red().bold(), report.key, message);
                if first_error.is_none() {
                    first_error = Some(format!("{}: {}", report.key, message));
                }
            }
            NodeStatus::Unreachable => {
                eprintln!(
                    "{} {}: a dependency failed",
                    "skipped:".yellow(),
                    report.key
                );
            }
            NodeStatus::Cancelled => {
                eprintln!("{} {}", "cancelled:".yellow(), report.key);
            }
            other => {
                eprintln!(
                    "{} {} ended in unexpected state {:?}",
                    "error:".red(),
                    report.key,
                    other
                );
            }
        }
    }

    match first_error {
        Some(message) => Err(Error::Phase(message)),
        None => {
            let completed = reports
                .iter()
                .filter(|r| r.status == NodeStatus::Complete)
                .count();
            eprintln!("{} {} packages ready", "envy:".green(), completed);
            Ok(())
        }
    }
}
