//! Typed view of the build metadata stored under `META/`.
//!
//! `META/misc_info.txt` is a flat `key=value` file written by the platform
//! build. Only the keys the image flow acts on are kept; everything else is
//! ignored on load.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use tracing::warn;

/// Location of the info dictionary inside a target-files package.
pub const MISC_INFO_PATH: &str = "META/misc_info.txt";

const RECOVERY_FSTAB_PATH: &str = "RECOVERY/RAMDISK/etc/recovery.fstab";
const BOOT_FSTAB_PATH: &str = "BOOT/RAMDISK/etc/recovery.fstab";

/// Per-partition keys (`<partition>_size`, `<partition>_fs_type`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionInfo {
    pub fs_type: Option<String>,
    pub size: Option<u64>,
    pub journal_size: Option<u64>,
    pub verity_block_device: Option<String>,
    pub headroom: Option<String>,
    pub avb_enable: bool,
    pub avb_add_hashtree_footer_args: Option<String>,
    pub base_fs_file: Option<String>,
}

/// Keys copied into every image's properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageFlags {
    pub extfs_sparse_flag: Option<String>,
    pub squashfs_sparse_flag: Option<String>,
    pub selinux_fc: Option<String>,
    pub skip_fsck: bool,
    pub verity: bool,
    pub verity_key: Option<String>,
    pub verity_signer_cmd: Option<String>,
    pub verity_fec: bool,
    pub avb_avbtool: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvbConfig {
    pub enabled: bool,
    pub key_path: Option<String>,
    pub algorithm: Option<String>,
    pub make_vbmeta_image_args: Option<String>,
    pub boot_add_hash_footer_args: Option<String>,
    pub recovery_add_hash_footer_args: Option<String>,
}

impl AvbConfig {
    /// `--key`/`--algorithm`, only when both are configured.
    pub fn signing_args(&self) -> Vec<String> {
        match (&self.key_path, &self.algorithm) {
            (Some(key), Some(algorithm)) => vec![
                "--key".to_string(),
                key.clone(),
                "--algorithm".to_string(),
                algorithm.clone(),
            ],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BptConfig {
    pub enabled: bool,
    pub input_files: Option<String>,
    pub disk_size: Option<String>,
    pub make_table_args: Option<String>,
}

/// The recognized contents of `META/misc_info.txt` plus the recovery fstab.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoDict {
    pub fstab_version: u32,
    pub fstab: Fstab,
    /// Generic filesystem type, overridden by the per-partition one.
    pub fs_type: Option<String>,
    pub system: PartitionInfo,
    pub vendor: PartitionInfo,
    pub userdata: PartitionInfo,
    pub boot_size: Option<u64>,
    pub recovery_size: Option<u64>,
    pub flags: ImageFlags,
    pub avb: AvbConfig,
    pub bpt: BptConfig,
    pub system_root_image: bool,
    pub ramdisk_dir: Option<String>,
    pub ramdisk_fs_config: Option<String>,
    pub has_ext4_reserved_blocks: bool,
    pub no_recovery: bool,
    pub recovery_as_boot: bool,
    pub userdata_img_with_data: bool,
    pub full_recovery_image: bool,
    pub boot_signer: bool,
    pub mkbootimg_args: Option<String>,
}

impl InfoDict {
    /// Load the dictionary through `read`, which returns `Ok(None)` for a
    /// file that is not in the package.
    pub fn load(read: impl Fn(&str) -> Result<Option<String>>) -> Result<Self> {
        let text = read(MISC_INFO_PATH)?.ok_or_else(|| {
            anyhow::anyhow!("can't find {} in input target-files", MISC_INFO_PATH)
        })?;
        let entries = parse_key_value(&text);
        let mut info = Self::from_entries(&entries)
            .with_context(|| format!("parsing {}", MISC_INFO_PATH))?;

        let fstab_path = if info.system_root_image {
            BOOT_FSTAB_PATH
        } else {
            RECOVERY_FSTAB_PATH
        };
        info.fstab = match read(fstab_path)? {
            Some(text) => Fstab::parse(&text, info.fstab_version)
                .with_context(|| format!("parsing {}", fstab_path))?,
            None => {
                warn!(path = fstab_path, "could not find recovery fstab");
                Fstab::default()
            }
        };

        Ok(info)
    }

    pub fn from_entries(entries: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| entries.get(key).map(|value| value.trim().to_string());
        let flag = |key: &str| entries.get(key).is_some_and(|value| value.trim() == "true");
        let size = |key: &str| -> Result<Option<u64>> {
            entries
                .get(key)
                .map(|value| parse_int(key, value))
                .transpose()
        };
        let partition = |prefix: &str| -> Result<PartitionInfo> {
            Ok(PartitionInfo {
                fs_type: get(&format!("{prefix}_fs_type")),
                size: size(&format!("{prefix}_size"))?,
                journal_size: size(&format!("{prefix}_journal_size"))?,
                verity_block_device: get(&format!("{prefix}_verity_block_device")),
                headroom: get(&format!("{prefix}_headroom")),
                avb_enable: flag(&format!("{prefix}_avb_enable")),
                avb_add_hashtree_footer_args: get(&format!(
                    "{prefix}_avb_add_hashtree_footer_args"
                )),
                base_fs_file: get(&format!("{prefix}_base_fs_file")),
            })
        };

        let fstab_version = match entries.get("fstab_version") {
            Some(value) => u32::try_from(parse_int("fstab_version", value)?)
                .context("fstab_version out of range")?,
            None => 1,
        };

        Ok(Self {
            fstab_version,
            fstab: Fstab::default(),
            fs_type: get("fs_type"),
            system: partition("system")?,
            vendor: partition("vendor")?,
            userdata: partition("userdata")?,
            boot_size: size("boot_size")?,
            recovery_size: size("recovery_size")?,
            flags: ImageFlags {
                extfs_sparse_flag: get("extfs_sparse_flag"),
                squashfs_sparse_flag: get("squashfs_sparse_flag"),
                selinux_fc: get("selinux_fc"),
                skip_fsck: flag("skip_fsck"),
                verity: flag("verity"),
                verity_key: get("verity_key"),
                verity_signer_cmd: get("verity_signer_cmd"),
                verity_fec: flag("verity_fec"),
                avb_avbtool: get("avb_avbtool"),
            },
            avb: AvbConfig {
                enabled: flag("board_avb_enable"),
                key_path: get("board_avb_key_path"),
                algorithm: get("board_avb_algorithm"),
                make_vbmeta_image_args: get("board_avb_make_vbmeta_image_args"),
                boot_add_hash_footer_args: get("board_avb_boot_add_hash_footer_args"),
                recovery_add_hash_footer_args: get("board_avb_recovery_add_hash_footer_args"),
            },
            bpt: BptConfig {
                enabled: flag("board_bpt_enable"),
                input_files: get("board_bpt_input_files"),
                disk_size: get("board_bpt_disk_size"),
                make_table_args: get("board_bpt_make_table_args"),
            },
            system_root_image: flag("system_root_image"),
            ramdisk_dir: get("ramdisk_dir"),
            ramdisk_fs_config: get("ramdisk_fs_config"),
            has_ext4_reserved_blocks: flag("has_ext4_reserved_blocks"),
            no_recovery: flag("no_recovery"),
            recovery_as_boot: flag("recovery_as_boot"),
            userdata_img_with_data: flag("userdata_img_with_data"),
            full_recovery_image: flag("full_recovery_image"),
            boot_signer: flag("boot_signer"),
            mkbootimg_args: get("mkbootimg_args"),
        })
    }

    /// Size limit for the partition stored on `device` (a block device name
    /// such as `userdata`, `/dev/block/by-name/system`).
    pub fn size_for_device(&self, device: &str) -> Option<u64> {
        let name = device.rsplit('/').next().unwrap_or(device);
        match name {
            "boot" => self.boot_size,
            "recovery" => self.recovery_size,
            "system" => self.system.size,
            "vendor" => self.vendor.size,
            "userdata" => self.userdata.size,
            _ => None,
        }
    }
}

/// Parse `key=value` lines, skipping blanks and `#` comments.
///
/// Only the first `=` separates key and value; later entries win.
pub fn parse_key_value(text: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            entries.insert(key.to_string(), value.to_string());
        }
    }
    entries
}

/// Decimal or `0x`-prefixed hexadecimal integer.
fn parse_int(key: &str, value: &str) -> Result<u64> {
    let value = value.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed.with_context(|| format!("invalid integer for '{key}': '{value}'"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub mount_point: String,
    pub fs_type: String,
    pub device: String,
}

impl FstabEntry {
    /// Partition type as understood by applypatch.
    pub fn partition_type(&self) -> Option<&'static str> {
        match self.fs_type.as_str() {
            "yaffs2" | "mtd" => Some("MTD"),
            "ext4" | "emmc" | "f2fs" | "squashfs" => Some("EMMC"),
            _ => None,
        }
    }
}

/// Mount point → entry, parsed from the recovery fstab.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fstab {
    entries: BTreeMap<String, FstabEntry>,
}

impl Fstab {
    pub fn parse(text: &str, version: u32) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let pieces: Vec<&str> = line.split_whitespace().collect();
            let entry = match version {
                1 => {
                    // <mount_point> <fs_type> <device> [<device2>]
                    if !(3..=4).contains(&pieces.len()) {
                        bail!("malformed recovery.fstab line: \"{}\"", line);
                    }
                    FstabEntry {
                        mount_point: pieces[0].to_string(),
                        fs_type: pieces[1].to_string(),
                        device: pieces[2].to_string(),
                    }
                }
                2 => {
                    // <src> <mount_point> <type> <mnt_flags> <fs_mgr_flags>
                    if pieces.len() != 5 {
                        bail!("malformed recovery.fstab line: \"{}\"", line);
                    }
                    if pieces[4].contains("voldmanaged=") {
                        continue;
                    }
                    FstabEntry {
                        mount_point: pieces[1].to_string(),
                        fs_type: pieces[2].to_string(),
                        device: pieces[0].to_string(),
                    }
                }
                other => bail!("unknown fstab_version: \"{}\"", other),
            };
            entries.insert(entry.mount_point.clone(), entry);
        }
        Ok(Self { entries })
    }

    pub fn get(&self, mount_point: &str) -> Option<&FstabEntry> {
        self.entries.get(mount_point)
    }
}
