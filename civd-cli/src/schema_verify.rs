//! `schema-verify` subcommand.
//!
//! Validates one snapshot's index against every `civd.index.v1` invariant:
//! grid coverage, non-overlapping local offsets, and reference fidelity.

use std::path::PathBuf;

use civd::{CivdError, Index, World, verify_index_v1};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Validate a snapshot's index against civd.index.v1")]
pub struct Args {
    /// Snapshot name, e.g. "t003"
    #[arg(long)]
    time: String,

    /// Storage root directory
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

pub fn run(args: Args) -> Result<(), CivdError> {
    let world = World::open(args.root);
    let index_path = world.snapshot_dir(&args.time).join("index.json");
    let idx = Index::load(&index_path)?;

    let report = verify_index_v1(&idx, |name| {
        Ok(world.snapshot_dir(name).join("tiles.zstpack"))
    })?;

    println!(
        "snapshot {}: ok ({} tiles checked, {} references verified)",
        args.time, report.tiles_checked, report.references_checked
    );
    Ok(())
}
