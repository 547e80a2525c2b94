//! Boot and recovery images.
//!
//! A prebuilt image is preferred (`BOOTABLE_IMAGES/`, then `IMAGES/`).
//! Otherwise the image is assembled from the tree's `BOOT/` or `RECOVERY/`
//! directory: the ramdisk is packed with mkbootfs and compressed with
//! minigzip, then mkbootimg combines it with the kernel.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::context::RunContext;
use crate::output::OutputSink;
use crate::process::Cmd;

use super::IMAGES_DIR;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootableSource {
    /// Taken unchanged from the package.
    Prebuilt,
    /// Assembled by this run.
    Built,
}

#[derive(Debug, Clone)]
pub struct BootableImage {
    /// File name under `IMAGES/`, e.g. `recovery-two-step.img`.
    pub name: String,
    pub path: PathBuf,
    pub source: BootableSource,
}

impl BootableImage {
    pub fn arcname(&self) -> String {
        format!("{}/{}", IMAGES_DIR, self.name)
    }

    pub fn write(&self, sink: &mut OutputSink) -> Result<bool> {
        sink.write_file(&self.path, &self.arcname())
    }
}

/// Find or build the bootable image `name` from `tree_subdir` (`BOOT` or
/// `RECOVERY`). `Ok(None)` when the tree has no kernel for it.
///
/// A two-step recovery image is the recovery loaded into `/boot` during a
/// two-step update, so it is signed for that path.
pub fn get_bootable_image(
    ctx: &RunContext<'_>,
    name: &str,
    tree_subdir: &str,
    two_step: bool,
) -> Result<Option<BootableImage>> {
    for dir in ["BOOTABLE_IMAGES", IMAGES_DIR] {
        let prebuilt = ctx.tree_path(&format!("{dir}/{name}"));
        if prebuilt.exists() {
            println!("using prebuilt {name} from {dir}...");
            return Ok(Some(BootableImage {
                name: name.to_string(),
                path: prebuilt,
                source: BootableSource::Prebuilt,
            }));
        }
    }

    println!("building image from target_files {tree_subdir}...");
    let info = ctx.info;
    let has_ramdisk =
        !info.system_root_image || name != "boot.img" || info.recovery_as_boot;
    let fs_config = ctx.tree_path(&format!(
        "META/{}_filesystem_config.txt",
        tree_subdir.to_lowercase()
    ));
    let source = ctx.tree_path(tree_subdir);

    let built = build_bootable_image(ctx, &source, &fs_config, name, has_ramdisk, two_step)?;
    Ok(built.map(|path| BootableImage {
        name: name.to_string(),
        path,
        source: BootableSource::Built,
    }))
}

fn build_bootable_image(
    ctx: &RunContext<'_>,
    source: &Path,
    fs_config: &Path,
    name: &str,
    has_ramdisk: bool,
    two_step: bool,
) -> Result<Option<PathBuf>> {
    let ramdisk_dir = source.join("RAMDISK");
    let kernel = source.join("kernel");
    if !ramdisk_dir.exists() || !kernel.exists() {
        debug!(source = %source.display(), "no kernel or ramdisk, no bootable image");
        return Ok(None);
    }

    let dir_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partition = dir_name.to_lowercase();
    let info = ctx.info;
    let tools = ctx.tools;

    let ramdisk = if has_ramdisk {
        let cpio = ctx.scratch.file("ramdisk-", ".cpio");
        let mut mkbootfs = Cmd::new(&tools.mkbootfs);
        if fs_config.exists() {
            mkbootfs = mkbootfs.arg("-f").arg_path(fs_config);
        }
        mkbootfs
            .arg_path(&ramdisk_dir)
            .stdout_to(&cpio)
            .error_msg(format!("mkbootfs of {} ramdisk failed", source.display()))
            .run_with(ctx.runner)?;

        let compressed = ctx.scratch.file("ramdisk-", ".img");
        Cmd::new(&tools.minigzip)
            .stdin_from(&cpio)
            .stdout_to(&compressed)
            .error_msg(format!("minigzip of {} ramdisk failed", source.display()))
            .run_with(ctx.runner)?;
        Some(compressed)
    } else {
        None
    };

    let img = ctx.scratch.file(&format!("{}-", name.trim_end_matches(".img")), ".img");
    let mut mkbootimg = Cmd::new(&tools.mkbootimg).arg("--kernel").arg_path(&kernel);
    let second = source.join("second");
    if second.exists() {
        mkbootimg = mkbootimg.arg("--second").arg_path(&second);
    }
    for (file, flag) in [("cmdline", "--cmdline"), ("base", "--base"), ("pagesize", "--pagesize")] {
        if let Some(value) = read_trimmed(&source.join(file))? {
            mkbootimg = mkbootimg.arg(flag).arg(value);
        }
    }
    if let Some(args) = info.mkbootimg_args.as_deref() {
        mkbootimg = mkbootimg.args(split_args("mkbootimg_args", args)?);
    }
    if let Some(ramdisk) = &ramdisk {
        mkbootimg = mkbootimg.arg("--ramdisk").arg_path(ramdisk);
    }
    mkbootimg
        .arg("--output")
        .arg_path(&img)
        .error_msg(format!("mkbootimg of {dir_name} image failed"))
        .run_with(ctx.runner)?;

    if info.boot_signer {
        if let Some(verity_key) = info.flags.verity_key.as_deref() {
            let path = if two_step {
                "/boot".to_string()
            } else {
                format!("/{partition}")
            };
            let options = ctx.options;
            let private_key = options
                .replace_verity_private_key
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("{verity_key}.pk8")));
            let public_key = options
                .replace_verity_public_key
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("{verity_key}.x509.pem")));
            Cmd::new(&tools.boot_signer)
                .arg(path.clone())
                .arg_path(&img)
                .arg_path(&private_key)
                .arg_path(&public_key)
                .arg_path(&img)
                .error_msg(format!("boot_signer of {path} image failed"))
                .run_with(ctx.runner)?;
        }
    }

    if info.avb.enabled {
        let (size, extra) = match partition.as_str() {
            "recovery" => (info.recovery_size, &info.avb.recovery_add_hash_footer_args),
            _ => (info.boot_size, &info.avb.boot_add_hash_footer_args),
        };
        let size = size.with_context(|| {
            format!("{partition}_size is required to add an AVB footer to {name}")
        })?;
        let mut avbtool = Cmd::new(&tools.avbtool)
            .arg("add_hash_footer")
            .arg("--image")
            .arg_path(&img)
            .arg("--partition_size")
            .arg(size.to_string())
            .arg("--partition_name")
            .arg(partition.clone())
            .args(info.avb.signing_args());
        if let Some(args) = extra.as_deref() {
            avbtool = avbtool.args(split_args("add_hash_footer args", args)?);
        }
        avbtool
            .error_msg(format!("avbtool add_hash_footer of {name} failed"))
            .run_with(ctx.runner)?;
    }

    Ok(Some(img))
}

fn read_trimmed(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("reading '{}'", path.display()))?;
    Ok(Some(text.trim_end_matches('\n').to_string()))
}

/// Split a configured argument string the way a POSIX shell would.
pub(crate) fn split_args(key: &str, value: &str) -> Result<Vec<String>> {
    if value.trim().is_empty() {
        return Ok(Vec::new());
    }
    shlex::split(value).with_context(|| format!("unbalanced quoting in {key}: '{value}'"))
}
