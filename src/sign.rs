//! Partition table and vbmeta images.

use anyhow::{Context, Result};
use std::path::Path;

use crate::context::RunContext;
use crate::image::bootable::split_args;
use crate::image::IMAGES_DIR;
use crate::output::{OutputFile, OutputSink};
use crate::process::Cmd;

/// `partition-table.img` and its `partition-table.bpt` JSON description.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    pub image: OutputFile,
    pub bpt: OutputFile,
}

impl PartitionTable {
    pub fn write(&self, sink: &mut OutputSink) -> Result<()> {
        self.image.write(sink)?;
        self.bpt.write(sink)?;
        Ok(())
    }
}

pub fn build_partition_table(ctx: &RunContext<'_>, sink: &OutputSink) -> Result<PartitionTable> {
    let image = OutputFile::new(sink, ctx.tree, ctx.scratch, IMAGES_DIR, "partition-table.img");
    let bpt = OutputFile::new(sink, ctx.tree, ctx.scratch, IMAGES_DIR, "partition-table.bpt");
    let config = &ctx.info.bpt;

    let input_files = config
        .input_files
        .as_deref()
        .context("board_bpt_input_files is required to build the partition table")?;

    let mut cmd = Cmd::new(&ctx.tools.bpttool)
        .arg("make_table")
        .arg("--output_json")
        .arg_path(bpt.path())
        .arg("--output_gpt")
        .arg_path(image.path());
    for input in input_files.split(' ') {
        cmd = cmd.arg("--input").arg(input);
    }
    if let Some(disk_size) = config.disk_size.as_deref().filter(|s| !s.is_empty()) {
        cmd = cmd.arg("--disk_size").arg(disk_size);
    }
    if let Some(args) = config.make_table_args.as_deref() {
        cmd = cmd.args(split_args("board_bpt_make_table_args", args)?);
    }
    cmd.error_msg("bpttool make_table failed")
        .run_with(ctx.runner)?;

    Ok(PartitionTable { image, bpt })
}

/// Build `vbmeta.img` from the descriptors of the boot, system and
/// (optional) vendor images.
pub fn build_vbmeta(
    ctx: &RunContext<'_>,
    sink: &OutputSink,
    boot: &Path,
    system: &Path,
    vendor: Option<&Path>,
) -> Result<OutputFile> {
    let image = OutputFile::new(sink, ctx.tree, ctx.scratch, IMAGES_DIR, "vbmeta.img");
    let info = ctx.info;

    let mut cmd = Cmd::new(&ctx.tools.avbtool)
        .arg("make_vbmeta_image")
        .arg("--output")
        .arg_path(image.path())
        .arg("--include_descriptors_from_image")
        .arg_path(boot)
        .arg("--include_descriptors_from_image")
        .arg_path(system);
    if let Some(vendor) = vendor {
        cmd = cmd.arg("--include_descriptors_from_image").arg_path(vendor);
    }
    if info.system_root_image {
        cmd = cmd.arg("--setup_rootfs_from_kernel").arg_path(system);
    }
    cmd = cmd.args(info.avb.signing_args());
    if let Some(args) = info.avb.make_vbmeta_image_args.as_deref() {
        cmd = cmd.args(split_args("board_avb_make_vbmeta_image_args", args)?);
    }
    cmd.error_msg("avbtool make_vbmeta_image failed")
        .run_with(ctx.runner)?;

    Ok(image)
}
