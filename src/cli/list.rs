//! `envy list`: print the resolved instance map.
//!
//! One `canonical-key -> variant-hash` line per package instance,
//! sorted, to stdout. Useful for diffing resolution results and for
//! asserting hash stability.

use super::{EngineContext, GlobalArgs};
use crate::error::Result;
use clap::Args;

#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub global: GlobalArgs,
}

pub fn run(args: &ListArgs) -> Result<()> {
    let ctx = EngineContext::load(&args.global)?;
    let graph = ctx.resolve()?;

    let mut lines: Vec<String> = graph
        .package_nodes()
        .map(|node| format!("{} -> {}", node.key, node.variant_hash))
        .collect();
    lines.sort();
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}
