//! Operational CLI: print the SHA-256 of a template file.
//!
//! Used when pinning a new template revision: compute the digest of the
//! file about to be uploaded under `templates/` and paste it into the
//! template registry.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sha2::{Digest, Sha256};

#[derive(Parser, Debug)]
#[command(name = "template-digest", about = "SHA-256 of a template file")]
struct Args {
    /// Template file to digest
    file: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let bytes =
        std::fs::read(&args.file).with_context(|| format!("read {}", args.file.display()))?;
    println!("{}  {}", hex::encode(Sha256::digest(&bytes)), args.file.display());
    Ok(())
}
