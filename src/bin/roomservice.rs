//! roomservice - add a device repository and its dependencies to the local manifest
//!
//! Usage: roomservice <product> [depsonly]
//!
//! Run from the root of a repo-managed source tree.

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use releasetools::logging;
use releasetools::preflight::{check_required_tools, ROOMSERVICE_TOOLS};
use releasetools::process::HostRunner;
use releasetools::roomservice::{ReqwestClient, RoomService, RoomserviceConfig};

#[derive(Parser)]
#[command(name = "roomservice")]
#[command(about = "Fetch a device repository and its dependencies into the local manifest")]
struct Args {
    /// Lunch product, e.g. slim_hammerhead
    product: String,

    /// Pass `depsonly` to only process the dependencies of an existing tree
    mode: Option<String>,

    /// Config file (default: $XDG_CONFIG_HOME/releasetools/roomservice.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Forge API token
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

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
    check_required_tools(ROOMSERVICE_TOOLS)?;

    let root = env::current_dir().context("resolving current directory")?;
    let http = ReqwestClient::new(args.token)?;
    let service = RoomService {
        root: &root,
        config: &config,
        http: &http,
        runner: &HostRunner,
    };
    service.run(&args.product, args.mode.is_some())?;
    Ok(())
}
