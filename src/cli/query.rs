//! `envy package` / `envy product`: resolve one path query.
//!
//! The one-line result goes to stdout so shell integrations can splice
//! it into PATH or command lines.

use super::{EngineContext, GlobalArgs};
use crate::error::{Error, Result};
use crate::spec::ProductDecl;
use clap::Args;

#[derive(Args, Debug)]
pub struct PackageArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Package identity (full or fuzzy: name, name@rev, namespace.name)
    pub query: String,
}

#[derive(Args, Debug)]
pub struct ProductArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Product name
    pub name: String,
}

pub fn run_package(args: &PackageArgs) -> Result<()> {
    let ctx = EngineContext::load(&args.global)?;
    let graph = ctx.resolve()?;
    let node = graph.find_package(&args.query)?.ok_or_else(|| {
        Error::Resolution(format!(
            "no package in the manifest matches '{}'",
            args.query
        ))
    })?;
    if node.spec().map(|s| s.is_user_managed()) == Some(true) {
        return Err(Error::Interface(format!(
            "'{}' is user-managed and has no pkg path",
            node.identity
        )));
    }

    let entry = ctx
        .store
        .package_entry_path(&node.identity, &node.variant_hash);
    if !entry.join(crate::cache::COMPLETE_MARKER).exists() {
        return Err(Error::Cache(format!(
            "package '{}' is not materialized; run `envy sync` first",
            node.key
        )));
    }
    println!("{}", entry.join("pkg").display());
    Ok(())
}

pub fn run_product(args: &ProductArgs) -> Result<()> {
    let ctx = EngineContext::load(&args.global)?;
    let graph = ctx.resolve()?;

    let mut providers = graph.package_nodes().filter_map(|node| {
        node.spec()
            .and_then(|s| s.products.get(&args.name))
            .map(|decl| (node, decl))
    });
    let Some((node, decl)) = providers.next() else {
        return Err(Error::Resolution(format!(
            "no package in the manifest provides product '{}'",
            args.name
        )));
    };
    if let Some((other, _)) = providers.next() {
        return Err(Error::Resolution(format!(
            "product '{}' is ambiguous; candidates: {}, {}",
            args.name, node.key, other.key
        )));
    }

    let rel = match decl {
        ProductDecl::Path(rel) => rel.clone(),
        ProductDecl::Function => {
            return Err(Error::Interface(format!(
                "product '{}' is programmatic; it has no stable path",
                args.name
            )))
        }
    };

    let entry = ctx
        .store
        .package_entry_path(&node.identity, &node.variant_hash);
    if !entry.join(crate::cache::COMPLETE_MARKER).exists() {
        return Err(Error::Cache(format!(
            "package '{}' is not materialized; run `envy sync` first",
            node.key
        )));
    }
    println!("{}", entry.join("pkg").join(rel).display());
    Ok(())
}
