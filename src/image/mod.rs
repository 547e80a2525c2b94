//! Partition images built by the external image tool.
//!
//! Each partition's content directory in the tree is exposed to the tool
//! under its lowercase name (the tool derives the mount point from it), with
//! a properties file describing the filesystem to build.

pub mod bootable;
pub mod recovery_patch;
pub mod verity;

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::info::{parse_key_value, ImageFlags, InfoDict, PartitionInfo};
use crate::output::{build_timestamp, OutputFile, OutputSink};
use crate::process::Cmd;

pub use bootable::{get_bootable_image, BootableImage, BootableSource};
pub use recovery_patch::make_recovery_patch;

/// Prefix of every image inside the package.
pub const IMAGES_DIR: &str = "IMAGES";

/// Block size the adjusted partition size is expressed in.
pub const BLOCK_SIZE: u64 = 4096;

/// Filesystem partitions built from a content directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Partition {
    System,
    SystemOther,
    Vendor,
    Userdata,
}

impl Partition {
    pub fn name(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::SystemOther => "system_other",
            Self::Vendor => "vendor",
            Self::Userdata => "userdata",
        }
    }

    pub fn image_name(self) -> String {
        format!("{}.img", self.name())
    }

    /// Content directory inside the tree.
    pub fn source_dir(self) -> &'static str {
        match self {
            Self::System => "SYSTEM",
            Self::SystemOther => "SYSTEM_OTHER",
            Self::Vendor => "VENDOR",
            Self::Userdata => "DATA",
        }
    }

    /// Name the content is exposed under, which is also the fstab mount point.
    fn mount_name(self) -> &'static str {
        match self {
            Self::Userdata => "data",
            other => other.name(),
        }
    }

    /// Sidecar block map produced next to the image.
    fn block_list_name(self) -> Option<&'static str> {
        match self {
            Self::System => Some("system.map"),
            Self::Vendor => Some("vendor.map"),
            Self::SystemOther | Self::Userdata => None,
        }
    }

    fn fs_config_path(self) -> Option<String> {
        match self {
            Self::System => Some("META/filesystem_config.txt".to_string()),
            Self::SystemOther | Self::Vendor => {
                Some(format!("META/{}_filesystem_config.txt", self.name()))
            }
            Self::Userdata => None,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Properties handed to the image tool for one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageProperties {
    pub mount_point: String,
    pub fs_type: Option<String>,
    pub partition_size: Option<u64>,
    pub partition_headroom: Option<String>,
    pub journal_size: Option<u64>,
    pub verity_block_device: Option<String>,
    pub has_ext4_reserved_blocks: bool,
    pub base_fs_file: Option<String>,
    pub avb_hashtree_enable: bool,
    pub avb_add_hashtree_footer_args: Option<String>,
    pub system_root_image: bool,
    pub ramdisk_dir: Option<String>,
    pub ramdisk_fs_config: Option<String>,
    pub board_avb_enable: bool,
    pub flags: ImageFlags,
    pub timestamp: Option<i64>,
    pub fs_config: Option<PathBuf>,
    pub block_list: Option<PathBuf>,
}

impl ImageProperties {
    /// Defaults for `partition` derived from the info dictionary.
    ///
    /// `system_other` carries the system settings and mounts as `system`, so
    /// it picks up the same SELinux policy.
    pub fn from_info(info: &InfoDict, partition: Partition) -> Self {
        let mut props = Self {
            mount_point: partition.mount_name().to_string(),
            flags: info.flags.clone(),
            board_avb_enable: info.avb.enabled,
            ..Default::default()
        };

        let with_fs_type = |own: &PartitionInfo| own.fs_type.clone().or_else(|| info.fs_type.clone());
        match partition {
            Partition::System | Partition::SystemOther => {
                let system = &info.system;
                props.mount_point = "system".to_string();
                props.fs_type = with_fs_type(system);
                props.partition_headroom = system.headroom.clone();
                props.partition_size = system.size;
                props.journal_size = system.journal_size;
                props.verity_block_device = system.verity_block_device.clone();
                props.system_root_image = info.system_root_image;
                props.ramdisk_dir = info.ramdisk_dir.clone();
                props.ramdisk_fs_config = info.ramdisk_fs_config.clone();
                props.has_ext4_reserved_blocks = info.has_ext4_reserved_blocks;
                props.base_fs_file = system.base_fs_file.clone();
                props.avb_hashtree_enable = system.avb_enable;
                props.avb_add_hashtree_footer_args = system.avb_add_hashtree_footer_args.clone();
            }
            Partition::Vendor => {
                let vendor = &info.vendor;
                props.fs_type = vendor.fs_type.clone();
                props.partition_size = vendor.size;
                props.journal_size = vendor.journal_size;
                props.verity_block_device = vendor.verity_block_device.clone();
                props.has_ext4_reserved_blocks = info.has_ext4_reserved_blocks;
                props.base_fs_file = vendor.base_fs_file.clone();
                props.avb_hashtree_enable = vendor.avb_enable;
                props.avb_add_hashtree_footer_args = vendor.avb_add_hashtree_footer_args.clone();
            }
            Partition::Userdata => {
                props.fs_type = with_fs_type(&info.userdata);
                props.partition_size = info.userdata.size;
            }
        }
        props
    }

    /// Whether the tool appends verity metadata to this image.
    pub fn is_verity(&self) -> bool {
        self.verity_block_device.is_some() && self.flags.verity
    }

    /// `key=value` lines, in a stable order.
    pub fn to_prop_file(&self) -> String {
        let mut lines: Vec<(&str, String)> = Vec::new();
        let mut opt = |key: &'static str, value: Option<String>| {
            if let Some(value) = value {
                lines.push((key, value));
            }
        };
        let flag = |set: bool| set.then(|| "true".to_string());
        let flags = &self.flags;

        opt("extfs_sparse_flag", flags.extfs_sparse_flag.clone());
        opt("squashfs_sparse_flag", flags.squashfs_sparse_flag.clone());
        opt("selinux_fc", flags.selinux_fc.clone());
        opt("skip_fsck", flag(flags.skip_fsck));
        opt("verity", flag(flags.verity));
        opt("verity_key", flags.verity_key.clone());
        opt("verity_signer_cmd", flags.verity_signer_cmd.clone());
        opt("verity_fec", flag(flags.verity_fec));
        opt("board_avb_enable", flag(self.board_avb_enable));
        opt("avb_avbtool", flags.avb_avbtool.clone());
        opt("mount_point", Some(self.mount_point.clone()));
        opt("fs_type", self.fs_type.clone());
        opt("partition_headroom", self.partition_headroom.clone());
        opt("partition_size", self.partition_size.map(|v| v.to_string()));
        opt("journal_size", self.journal_size.map(|v| v.to_string()));
        opt("verity_block_device", self.verity_block_device.clone());
        opt("system_root_image", flag(self.system_root_image));
        opt("ramdisk_dir", self.ramdisk_dir.clone());
        opt("ramdisk_fs_config", self.ramdisk_fs_config.clone());
        opt("has_ext4_reserved_blocks", flag(self.has_ext4_reserved_blocks));
        opt("base_fs_file", self.base_fs_file.clone());
        opt("avb_hashtree_enable", flag(self.avb_hashtree_enable));
        opt(
            "avb_add_hashtree_footer_args",
            self.avb_add_hashtree_footer_args.clone(),
        );
        opt("timestamp", self.timestamp.map(|v| v.to_string()));
        opt(
            "fs_config",
            self.fs_config.as_ref().map(|p| p.display().to_string()),
        );
        opt(
            "block_list",
            self.block_list.as_ref().map(|p| p.display().to_string()),
        );

        lines
            .into_iter()
            .map(|(key, value)| format!("{key}={value}\n"))
            .collect()
    }
}

/// A partition image produced by this run, not yet written to the output.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub partition: Partition,
    pub image: OutputFile,
    pub block_list: Option<OutputFile>,
    /// Blocks left for filesystem data once verity metadata is reserved.
    /// Only set for verity partitions.
    pub adjusted_blocks: Option<u64>,
}

impl BuiltImage {
    pub fn path(&self) -> &Path {
        self.image.path()
    }

    pub fn write(&self, sink: &mut OutputSink) -> Result<()> {
        self.image.write(sink)?;
        // build_image only writes a block list for block-based images.
        if let Some(block_list) = self.block_list.as_ref().filter(|b| b.path().exists()) {
            block_list.write(sink)?;
        }
        Ok(())
    }
}

/// Result of asking for a partition image.
#[derive(Debug, Clone)]
pub enum ImageOutcome {
    /// Already present in the tree's `IMAGES/`; left untouched.
    Existing(PathBuf),
    Built(BuiltImage),
    /// The partition is not configured for this device.
    NotConfigured,
}

impl ImageOutcome {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Existing(path) => Some(path),
            Self::Built(image) => Some(image.path()),
            Self::NotConfigured => None,
        }
    }

    pub fn adjusted_blocks(&self) -> Option<u64> {
        match self {
            Self::Built(image) => image.adjusted_blocks,
            _ => None,
        }
    }
}

/// Build `partition` unless `IMAGES/<partition>.img` already exists in the
/// tree. An existing image is trusted as-is.
pub fn build_partition_image(
    ctx: &RunContext<'_>,
    sink: &OutputSink,
    partition: Partition,
) -> Result<ImageOutcome> {
    let image = OutputFile::new(
        sink,
        ctx.tree,
        ctx.scratch,
        IMAGES_DIR,
        &partition.image_name(),
    );
    if image.input_name().exists() {
        println!(
            "{} already exists in {}/, no need to rebuild...",
            partition.image_name(),
            IMAGES_DIR
        );
        return Ok(ImageOutcome::Existing(image.input_name().to_path_buf()));
    }

    match partition {
        Partition::Userdata => build_userdata(ctx, sink, image),
        _ => create_image(ctx, sink, partition, image).map(ImageOutcome::Built),
    }
}

fn create_image(
    ctx: &RunContext<'_>,
    sink: &OutputSink,
    partition: Partition,
    image: OutputFile,
) -> Result<BuiltImage> {
    println!("creating {}...", partition.image_name());

    let source_root = ctx.scratch.dir(&format!("{}-src-", partition.name()))?;
    let source = source_root.join(partition.name());
    let content = ctx.tree_path(partition.source_dir());
    symlink(&content, &source).with_context(|| {
        format!(
            "linking '{}' to '{}'",
            source.display(),
            content.display()
        )
    })?;

    let mut props = ImageProperties::from_info(ctx.info, partition);
    if let Some(entry) = ctx.info.fstab.get(&format!("/{}", partition.name())) {
        props.fs_type = Some(entry.fs_type.clone());
    }
    props.timestamp = Some(build_timestamp()?);
    if let Some(rel) = partition.fs_config_path() {
        let fs_config = ctx.tree_path(&rel);
        if fs_config.exists() {
            props.fs_config = Some(fs_config);
        }
    }
    let block_list = partition.block_list_name().map(|name| {
        OutputFile::new(sink, ctx.tree, ctx.scratch, IMAGES_DIR, name)
    });
    props.block_list = block_list.as_ref().map(|file| file.path().to_path_buf());

    let adjusted_blocks = run_image_tool(ctx, partition, &source, &props, image.path())?;
    Ok(BuiltImage {
        partition,
        image,
        block_list,
        adjusted_blocks,
    })
}

/// Userdata is built from an empty `data` directory unless the device asks
/// for the `DATA/` contents.
fn build_userdata(
    ctx: &RunContext<'_>,
    sink: &OutputSink,
    image: OutputFile,
) -> Result<ImageOutcome> {
    let mut props = ImageProperties::from_info(ctx.info, Partition::Userdata);
    if props.partition_size.is_none() {
        info!("userdata has no partition size, skipping userdata.img");
        return Ok(ImageOutcome::NotConfigured);
    }

    println!("creating {}...", Partition::Userdata.image_name());
    props.timestamp = Some(build_timestamp()?);

    let source_root = ctx.scratch.dir("userdata-src-")?;
    let source = source_root.join("data");
    if ctx.info.userdata_img_with_data {
        let content = ctx.tree_path(Partition::Userdata.source_dir());
        symlink(&content, &source).with_context(|| {
            format!("linking '{}' to '{}'", source.display(), content.display())
        })?;
    } else {
        fs::create_dir(&source)
            .with_context(|| format!("creating '{}'", source.display()))?;
    }

    if let Some(entry) = ctx.info.fstab.get("/data") {
        props.fs_type = Some(entry.fs_type.clone());
    }

    let adjusted_blocks =
        run_image_tool(ctx, Partition::Userdata, &source, &props, image.path())?;
    check_size(ctx.info, image.path(), &Partition::Userdata.image_name())?;

    Ok(ImageOutcome::Built(BuiltImage {
        partition: Partition::Userdata,
        image,
        block_list: None,
        adjusted_blocks,
    }))
}

/// Run the image tool and return the adjusted block count of a verity image.
fn run_image_tool(
    ctx: &RunContext<'_>,
    partition: Partition,
    source: &Path,
    props: &ImageProperties,
    output: &Path,
) -> Result<Option<u64>> {
    let prop_file = ctx.scratch.file(&format!("{}-props-", partition.name()), ".txt");
    fs::write(&prop_file, props.to_prop_file())
        .with_context(|| format!("writing image properties '{}'", prop_file.display()))?;
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }

    Cmd::new(&ctx.tools.build_image)
        .arg_path(source)
        .arg_path(&prop_file)
        .arg_path(output)
        .arg_path(ctx.tree)
        .error_msg(format!("build {} image failed", partition.image_name()))
        .run_with(ctx.runner)?;

    if !output.exists() {
        bail!(
            "build {} image failed: '{}' was not created",
            partition.image_name(),
            output.display()
        );
    }
    if !props.is_verity() {
        return Ok(None);
    }

    // A tool that reserves verity space reports the filesystem size left in
    // partition_size; one that leaves the value as configured reports nothing.
    let text = fs::read_to_string(&prop_file)
        .with_context(|| format!("reading image properties '{}'", prop_file.display()))?;
    let reported = match parse_key_value(&text).get("partition_size") {
        Some(value) => Some(
            value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid partition_size '{}' after build", value))?,
        ),
        None => None,
    };
    let adjusted = match (props.partition_size, reported) {
        (Some(configured), Some(reported)) if reported != configured => Some(reported),
        (Some(configured), _) => {
            let computed = verity::adjusted_partition_size(configured, props.flags.verity_fec);
            warn!(
                image = %partition.image_name(),
                partition_size = configured,
                adjusted_size = computed,
                "image tool did not report the verity adjusted size, computed it locally"
            );
            Some(computed)
        }
        (None, reported) => reported,
    };
    let adjusted = adjusted.map(|size| size / BLOCK_SIZE);
    debug!(partition = partition.name(), ?adjusted, "adjusted partition size");
    Ok(adjusted)
}

/// Fail when an image fills 99% of its partition and warn from 95%.
///
/// The limit is the `<device>_size` entry of the device backing the image's
/// mount point; without an fstab entry or size there is nothing to check.
pub fn check_size(info: &InfoDict, image: &Path, target: &str) -> Result<()> {
    let name = target.strip_suffix(".img").unwrap_or(target);
    let mount_point = match name {
        "userdata" => "/data".to_string(),
        other => format!("/{other}"),
    };
    let Some(entry) = info.fstab.get(&mount_point) else {
        debug!(mount_point = mount_point.as_str(), "no fstab entry, skipping size check");
        return Ok(());
    };
    let Some(limit) = info.size_for_device(&entry.device).filter(|&limit| limit > 0) else {
        debug!(device = entry.device.as_str(), "no size limit for device");
        return Ok(());
    };

    let size = fs::metadata(image)
        .with_context(|| format!("reading metadata of '{}'", image.display()))?
        .len();
    let pct = size as f64 * 100.0 / limit as f64;
    let msg = format!("{name} size ({size}) is {pct:.2}% of limit ({limit})");
    if pct >= 99.0 {
        bail!(msg);
    } else if pct >= 95.0 {
        warn!("{}", msg);
    } else {
        debug!("{}", msg);
    }
    Ok(())
}
