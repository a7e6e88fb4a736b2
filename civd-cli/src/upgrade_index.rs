//! `upgrade-index` subcommand.
//!
//! Rewrites a legacy pre-v1 `index.json` in place into the canonical
//! `civd.index.v1` layout, atomically.

use std::path::PathBuf;

use civd::{CivdError, World, upgrade_index_file};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Rewrite a legacy pre-v1 index in place")]
pub struct Args {
    /// Snapshot name, e.g. "t003"
    #[arg(long)]
    time: String,

    /// Storage root directory
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Tile size to assume when a legacy document omits it entirely
    #[arg(long, default_value_t = 32)]
    default_tile_size: i64,
}

pub fn run(args: Args) -> Result<(), CivdError> {
    let world = World::open(args.root);
    let index_path = world.snapshot_dir(&args.time).join("index.json");
    upgrade_index_file(&index_path, args.default_tile_size)?;
    println!("upgraded {}", index_path.display());
    Ok(())
}
