//! add_img_to_target_files - build the images of a target-files package
//!
//! Usage: add_img_to_target_files [flags] <target_files>
//!
//! `<target_files>` is a target-files zip or an unpacked directory. Images
//! that are missing are built from the partition trees it carries and
//! added under `IMAGES/`, together with the partition table, vbmeta and the
//! care map when the build info asks for them.

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;

use releasetools::process::HostRunner;
use releasetools::{add_images_to_target_files, logging, preflight, AddImagesOptions, ToolPaths};

#[derive(Parser)]
#[command(name = "add_img_to_target_files")]
#[command(about = "Build the images of a target-files package and add them to it")]
struct Args {
    /// Target-files zip archive or unpacked directory
    target_files: PathBuf,

    /// Build and add only the images that are missing
    #[arg(short = 'a', long = "add_missing")]
    add_missing: bool,

    /// Rebuild the recovery patch in SYSTEM/ and the install script
    #[arg(short = 'r', long = "rebuild_recovery")]
    rebuild_recovery: bool,

    /// Replacement verity private key (.pk8) for the boot signer
    #[arg(long = "replace_verity_private_key", value_name = "KEY")]
    replace_verity_private_key: Option<PathBuf>,

    /// Replacement verity public key (.x509.pem) for the boot signer
    #[arg(long = "replace_verity_public_key", value_name = "KEY")]
    replace_verity_public_key: Option<PathBuf>,

    /// Invoked by the signing flow: skip the userdata image
    #[arg(long = "is_signing")]
    is_signing: bool,

    /// Debug logging (RUST_LOG overrides)
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
        Ok(()) => {
            println!("done.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let options = AddImagesOptions {
        add_missing: args.add_missing,
        rebuild_recovery: args.rebuild_recovery,
        replace_verity_private_key: args.replace_verity_private_key,
        replace_verity_public_key: args.replace_verity_public_key,
        is_signing: args.is_signing,
    };
    let tools = ToolPaths::from_env();
    preflight::warn_missing_image_tools(&tools);

    let summary = add_images_to_target_files(&args.target_files, &options, &tools, &HostRunner)?;
    for (name, state) in &summary.states {
        debug!(partition = %name, state = %state, "final state");
    }
    Ok(())
}
