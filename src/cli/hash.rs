//! `envy hash`: print the SHA-256 of a file.
//!
//! Spec authors use this to pin FETCH sources and spec dependencies.

use crate::error::Result;
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct HashArgs {
    /// File to hash
    pub file: PathBuf,
}

pub fn run(args: &HashArgs) -> Result<()> {
    let digest = crate::hash::sha256_file(&args.file)?;
    println!("{}", digest);
    Ok(())
}
