//! `submap-verify` subcommand.
//!
//! Validates a `civd.submap.v1` manifest: schema tag, mode, tile counts,
//! and that the sidecar file it names actually has the declared byte size.

use std::path::PathBuf;

use civd::{CivdError, verify_submap_v1};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Validate a submap manifest and its sidecar file")]
pub struct Args {
    /// Path to a submap manifest JSON file
    #[arg(long)]
    manifest: PathBuf,
}

pub fn run(args: Args) -> Result<(), CivdError> {
    let manifest = verify_submap_v1(&args.manifest)?;
    println!(
        "submap {} ({}): ok ({}/{} tiles, {} bytes)",
        manifest.time, manifest.mode, manifest.tiles_included, manifest.tiles_total, manifest.bytes_npz
    );
    Ok(())
}
