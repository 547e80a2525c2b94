//! roomcleaner - add the remove-project entries a device tree asks for
//!
//! Usage: roomcleaner <device_path>
//!
//! Run from the root of a repo-managed source tree.

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use releasetools::logging;
use releasetools::roomservice::{run_roomcleaner, RoomserviceConfig};

#[derive(Parser)]
#[command(name = "roomcleaner")]
#[command(about = "Add remove-project entries listed by a device tree to the local manifests")]
struct Args {
    /// Device tree path relative to the source root, e.g. device/lge/hammerhead
    device_path: String,

    /// Config file (default: $XDG_CONFIG_HOME/releasetools/roomservice.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            eprintln!("ERROR: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = RoomserviceConfig::load(args.config.as_deref())?;
    let root = env::current_dir().context("resolving current directory")?;
    run_roomcleaner(&root, &config, &args.device_path)?;
    Ok(())
}
