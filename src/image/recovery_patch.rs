//! Recovery-from-boot patch and its install script.
//!
//! The files are written into the tree's `SYSTEM/` directory before the
//! system image is built, so they end up inside it.

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{info, warn};

use crate::context::RunContext;
use crate::info::InfoDict;
use crate::process::Cmd;

use super::bootable::BootableImage;

const RECOVERY_RESOURCE: &str = "etc/recovery-resource.dat";
const SCRIPT_LOCATION: &str = "bin/install-recovery.sh";

const INSTALL_TAIL: &str = " log -t recovery \"Installing new recovery image: succeeded\" \
|| log -t recovery \"Installing new recovery image: failed\"
else
  log -t recovery \"Recovery image already installed\"
fi
";

/// Size and SHA-1 of an image, as applypatch checks them.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ImageDigest {
    sha1: String,
    size: u64,
}

fn sha1_file(path: &Path) -> Result<ImageDigest> {
    let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(ImageDigest {
        sha1: format!("{:x}", hasher.finalize()),
        size,
    })
}

/// Write the recovery image (or a patch producing it from boot) into
/// `SYSTEM/`, plus the script that installs it on first boot.
pub fn make_recovery_patch(
    ctx: &RunContext<'_>,
    recovery: &BootableImage,
    boot: &BootableImage,
) -> Result<()> {
    let system = ctx.tree_path("SYSTEM");
    let info = ctx.info;

    let mut bonus_args = "";
    if info.full_recovery_image {
        write_system_file(&system, "etc/recovery.img", |dest| {
            fs::copy(&recovery.path, dest).map(|_| ())
        })?;
    } else {
        let resource = system.join(RECOVERY_RESOURCE);
        let mut imgdiff = Cmd::new(&ctx.tools.imgdiff);
        if resource.exists() {
            imgdiff = imgdiff.arg("-b").arg_path(&resource);
            bonus_args = "-b /system/etc/recovery-resource.dat";
        }
        let patch = ctx.scratch.file("recovery-from-boot-", ".p");
        imgdiff
            .arg_path(&boot.path)
            .arg_path(&recovery.path)
            .arg_path(&patch)
            .error_msg("imgdiff of recovery from boot failed")
            .run_with(ctx.runner)?;
        write_system_file(&system, "recovery-from-boot.p", |dest| {
            fs::copy(&patch, dest).map(|_| ())
        })?;
    }

    let Some(script) = install_script(info, recovery, boot, bonus_args)? else {
        warn!("recovery fstab has no usable /boot and /recovery entries, not writing install script");
        return Ok(());
    };
    info!(location = SCRIPT_LOCATION, "putting install-recovery script in place");
    write_system_file(&system, SCRIPT_LOCATION, |dest| fs::write(dest, &script))
}

fn write_system_file(
    system: &Path,
    rel: &str,
    write: impl FnOnce(&Path) -> std::io::Result<()>,
) -> Result<()> {
    let dest = system.join(rel);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }
    write(&dest).with_context(|| format!("writing '{}'", dest.display()))
}

/// `(partition type, device)` of `mount_point`; `None` unless the fstab has an
/// entry with a type applypatch understands.
fn type_and_device<'a>(info: &'a InfoDict, mount_point: &str) -> Option<(&'static str, &'a str)> {
    let entry = info.fstab.get(mount_point)?;
    Some((entry.partition_type()?, entry.device.as_str()))
}

fn install_script(
    info: &InfoDict,
    recovery: &BootableImage,
    boot: &BootableImage,
    bonus_args: &str,
) -> Result<Option<String>> {
    let (Some((boot_type, boot_device)), Some((recovery_type, recovery_device))) = (
        type_and_device(info, "/boot"),
        type_and_device(info, "/recovery"),
    ) else {
        return Ok(None);
    };

    let rec = sha1_file(&recovery.path)?;
    let installed = INSTALL_TAIL;

    let script = if info.full_recovery_image {
        format!(
            "#!/system/bin/sh\n\
             if ! applypatch -c {rt}:{rd}:{rs}:{rh}; then\n  \
             applypatch /system/etc/recovery.img {rt}:{rd} {rh} {rs} &&{installed}",
            rt = recovery_type,
            rd = recovery_device,
            rs = rec.size,
            rh = rec.sha1,
        )
    } else {
        let boot_digest = sha1_file(&boot.path)?;
        let bonus = if bonus_args.is_empty() {
            String::new()
        } else {
            format!("{bonus_args} ")
        };
        format!(
            "#!/system/bin/sh\n\
             if ! applypatch -c {rt}:{rd}:{rs}:{rh}; then\n  \
             applypatch {bonus}{bt}:{bd}:{bs}:{bh} {rt}:{rd} {rh} {rs} {bh}:/system/recovery-from-boot.p &&{installed}",
            bt = boot_type,
            bd = boot_device,
            bs = boot_digest.size,
            bh = boot_digest.sha1,
            rt = recovery_type,
            rd = recovery_device,
            rs = rec.size,
            rh = rec.sha1,
        )
    };
    Ok(Some(script))
}
