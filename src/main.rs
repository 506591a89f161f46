use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process;

use envy::cli;

#[derive(Parser)]
#[command(name = "envy")]
#[command(version)]
#[command(about = "Per-project toolchains through a content-addressed package cache")]
#[command(
    long_about = "envy materializes the packages a project manifest declares into a \
content-addressed cache and resolves their paths for the shell integration."
)]
#[command(after_help = "\
Getting started:
  envy sync                      Materialize every package in envy.lua
  envy list                      Show resolved instances and variant hashes
  envy package ninja             Print a package's pkg/ path
  envy hash tools/gcc.lua        Print a file's SHA-256 for pinning

Docs: https://github.com/charlesnicholson/envy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    // === Core (1-9) ===
    /// Materialize the manifest's packages into the cache
    #[command(display_order = 1)]
    Sync(cli::sync::SyncArgs),
    /// Print resolved instances as `key -> variant-hash` lines
    #[command(display_order = 2)]
    List(cli::list::ListArgs),

    // === Queries (10-19) ===
    /// Print the pkg/ path of one resolved package
    #[command(display_order = 10)]
    Package(cli::query::PackageArgs),
    /// Print the path of one resolved product
    #[command(display_order = 11)]
    Product(cli::query::ProductArgs),

    // === Archives (20-29) ===
    /// Write cache entries as depot archives
    #[command(display_order = 20)]
    Export(cli::export::ExportArgs),
    /// Restore exported archives into the cache
    #[command(display_order = 21)]
    Import(cli::import::ImportArgs),

    // === Utilities (30-39) ===
    /// Print the SHA-256 of a file
    #[command(display_order = 30)]
    Hash(cli::hash::HashArgs),
}

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Sync(args) => cli::sync::run(args),
        Commands::List(args) => cli::list::run(args),
        Commands::Package(args) => cli::query::run_package(args),
        Commands::Product(args) => cli::query::run_product(args),
        Commands::Export(args) => cli::export::run(args),
        Commands::Import(args) => cli::import::run(args),
        Commands::Hash(args) => cli::hash::run(args),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        process::exit(1);
    }
}
