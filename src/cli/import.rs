//! `envy import`: restore exported archives into the cache.
//!
//! Archives whose coordinates match no instance of the current manifest
//! are logged and skipped; stale depot directories must not fail an
//! import run.

use super::{EngineContext, GlobalArgs};
use crate::archive::export::{import_archive, ArchiveName, ARCHIVE_EXTENSION};
use crate::error::{Error, Result};
use clap::Args;
use colored::Colorize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct ImportArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Archive file to import
    #[arg(required_unless_present = "dir", conflicts_with = "dir")]
    pub file: Option<PathBuf>,

    /// Import every archive in a directory
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

pub fn run(args: &ImportArgs) -> Result<()> {
    let ctx = EngineContext::load(&args.global)?;
    let graph = ctx.resolve()?;

    // Coordinates the current manifest can actually use.
    let expected: HashSet<(String, String)> = graph
        .package_nodes()
        .map(|n| (n.identity.to_string(), n.variant_hash.clone()))
        .collect();

    let files: Vec<PathBuf> = match (&args.file, &args.dir) {
        (Some(file), None) => vec![file.clone()],
        (None, Some(dir)) => {
            let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy().ends_with(ARCHIVE_EXTENSION))
                        .unwrap_or(false)
                })
                .collect();
            files.sort();
            files
        }
        _ => unreachable!("clap enforces exactly one of file/dir"),
    };

    if files.is_empty() {
        return Err(Error::Interface("no archives to import".to_string()));
    }

    let mut imported = 0usize;
    for file in &files {
        let name = match parse_name(file) {
            Ok(name) => name,
            Err(e) => {
                eprintln!("{} {}: {}", "skipping:".yellow(), file.display(), e);
                continue;
            }
        };
        let key = (name.identity.to_string(), name.hash.clone());
        if !expected.contains(&key) {
            eprintln!(
                "{} {} does not match any manifest instance",
                "skipping:".yellow(),
                file.display()
            );
            continue;
        }
        match import_archive(&ctx.store, file)? {
            Some(complete) => {
                imported += 1;
                eprintln!(
                    "{} {} -> {}",
                    "imported:".green(),
                    name.identity,
                    complete.entry_path.display()
                );
            }
            None => {
                eprintln!(
                    "{} {} (already cached or fetch-only)",
                    "imported:".green(),
                    name.identity
                );
                imported += 1;
            }
        }
    }

    if imported == 0 {
        eprintln!("{} nothing imported", "warning:".yellow());
    }
    Ok(())
}

fn parse_name(file: &Path) -> Result<ArchiveName> {
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::Interface(format!("not a file: {}", file.display())))?;
    ArchiveName::parse(&file_name)
}
