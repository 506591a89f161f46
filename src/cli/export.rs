//! `envy export`: serialize cache entries into depot archives.

use super::{EngineContext, GlobalArgs};
use crate::archive::export::{export_entry, ArchiveName};
use crate::error::{Error, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ExportArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Directory to write archives into
    #[arg(long, default_value = "envy-export")]
    pub outdir: PathBuf,

    /// Print `<prefix><filename>` depot manifest lines to stdout
    #[arg(long, value_name = "PREFIX")]
    pub depot_prefix: Option<String>,
}

pub fn run(args: &ExportArgs) -> Result<()> {
    let ctx = EngineContext::load(&args.global)?;
    let graph = ctx.resolve()?;

    let mut exported = 0usize;
    for node in graph.package_nodes() {
        let Some(spec) = node.spec() else { continue };
        if spec.is_user_managed() {
            continue;
        }

        let entry = ctx
            .store
            .package_entry_path(&node.identity, &node.variant_hash);
        if !entry.join(crate::cache::COMPLETE_MARKER).exists() {
            eprintln!(
                "{} {} is not materialized; run `envy sync` first",
                "skipping:".yellow(),
                node.key
            );
            continue;
        }

        // Exportable packages ship their built pkg/ tree; everything
        // else ships a fetch-only archive.
        let payload = if spec.exportable { "pkg" } else { "fetch" };
        let name = ArchiveName::new(
            &node.identity,
            ctx.store.platform_arch(),
            &node.variant_hash,
        )?;
        let path = export_entry(&entry, payload, &name, &args.outdir)?;
        exported += 1;

        match &args.depot_prefix {
            Some(prefix) => println!("{}{}", prefix, name.file_name()),
            None => eprintln!("{} {}", "exported:".green(), path.display()),
        }
    }

    if exported == 0 {
        return Err(Error::Cache(
            "nothing to export; run `envy sync` first".to_string(),
        ));
    }
    Ok(())
}
