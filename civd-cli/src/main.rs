mod schema_verify;
mod submap_verify;
mod upgrade_index;

use std::process::ExitCode;

use civd::CivdError;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "civd-cli")]
#[command(about = "Inspect and maintain civd volumetric storage roots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a snapshot's index against every civd.index.v1 invariant
    SchemaVerify(schema_verify::Args),
    /// Validate a submap manifest and its sidecar file
    SubmapVerify(submap_verify::Args),
    /// Rewrite a legacy pre-v1 index in place
    UpgradeIndex(upgrade_index::Args),
}

fn main() -> ExitCode {
    // Initialize logger from RUST_LOG environment variable
    // Example: RUST_LOG=debug civd-cli schema-verify --time t001
    env_logger::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::SchemaVerify(args) => schema_verify::run(args),
        Commands::SubmapVerify(args) => submap_verify::run(args),
        Commands::UpgradeIndex(args) => upgrade_index::run(args),
    };

    match result {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// Maps an error to the exit codes documented for the CLI: `1` for a
/// validation failure, `2` for anything that reflects the filesystem or
/// environment rather than the data itself.
fn exit_code_for(err: &CivdError) -> u8 {
    match err {
        CivdError::SchemaError { .. }
        | CivdError::ShapeError(_)
        | CivdError::CorruptTile { .. }
        | CivdError::DanglingRef { .. }
        | CivdError::MismatchedPackets(_)
        | CivdError::InvalidMode(_) => 1,
        CivdError::IoError { .. } => 2,
    }
}
