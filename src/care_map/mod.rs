//! Care maps for verified partitions.
//!
//! A care map lists the blocks of a partition image that hold data, so that
//! block-level verification on the device can skip the rest. Entries are
//! collected for system and vendor and stored as `META/care_map.txt`.

pub mod rangeset;
pub mod sparse;

use anyhow::{bail, Result};
use std::path::Path;
use tracing::debug;

pub use rangeset::RangeSet;
pub use sparse::SparseImage;

/// Relative location of the care map inside the package.
pub const CARE_MAP_PATH: &str = "META/care_map.txt";

/// Partitions that get a care map entry.
pub const CARE_MAP_PARTITIONS: &[&str] = &["system", "vendor"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CareMapEntry {
    pub partition: String,
    pub ranges: String,
}

/// Compute the care map of a sparse `image`.
///
/// With `adjusted_blocks` set, only blocks below it are kept: the verity
/// metadata appended past the filesystem is not part of the care map.
pub fn compute_care_map(
    partition: &str,
    image: &Path,
    adjusted_blocks: Option<u64>,
) -> Result<CareMapEntry> {
    if !CARE_MAP_PARTITIONS.contains(&partition) {
        bail!("care map is only computed for system and vendor, not '{}'", partition);
    }

    let sparse = SparseImage::open(image)?;
    let mut care_map = sparse.care_map;
    if let Some(blocks) = adjusted_blocks {
        if blocks == 0 {
            bail!("adjusted size of {} must be positive", partition);
        }
        care_map = care_map.intersect(&RangeSet::from_ranges([(0, blocks)]));
    }

    debug!(
        partition,
        blocks = care_map.size(),
        total = sparse.total_blocks,
        "computed care map"
    );
    Ok(CareMapEntry {
        partition: partition.to_string(),
        ranges: care_map.to_string(),
    })
}

/// Serialize entries as alternating name and range lines.
pub fn format_care_map(entries: &[CareMapEntry]) -> String {
    entries
        .iter()
        .flat_map(|entry| [entry.partition.as_str(), entry.ranges.as_str()])
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::sparse::build::{sparse_image, Chunk};
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_image(dir: &TempDir, name: &str, chunks: &[Chunk]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, sparse_image(4096, chunks)).unwrap();
        path
    }

    #[test]
    fn test_full_image_covers_all_blocks() {
        let temp = TempDir::new().unwrap();
        let image = write_image(&temp, "system.img", &[Chunk::Raw(16)]);
        let entry = compute_care_map("system", &image, None).unwrap();
        assert_eq!(entry.partition, "system");
        assert_eq!(entry.ranges, "0-15");
    }

    #[test]
    fn test_adjusted_size_truncates() {
        let temp = TempDir::new().unwrap();
        let image = write_image(&temp, "vendor.img", &[Chunk::Raw(10), Chunk::Fill(6)]);
        let entry = compute_care_map("vendor", &image, Some(12)).unwrap();
        assert_eq!(entry.ranges, "0-11");
    }

    #[test]
    fn test_gap_is_excluded() {
        let temp = TempDir::new().unwrap();
        let image = write_image(
            &temp,
            "system.img",
            &[Chunk::Raw(3), Chunk::DontCare(5), Chunk::Raw(1)],
        );
        assert_eq!(
            compute_care_map("system", &image, None).unwrap().ranges,
            "0-2,8"
        );
    }

    #[test]
    fn test_rejects_other_partitions_and_zero_size() {
        let temp = TempDir::new().unwrap();
        let image = write_image(&temp, "system.img", &[Chunk::Raw(1)]);
        assert!(compute_care_map("userdata", &image, None).is_err());
        assert!(compute_care_map("system", &image, Some(0)).is_err());
    }

    #[test]
    fn test_non_sparse_image_is_fatal() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("system.img");
        fs::write(&path, vec![0u8; 8192]).unwrap();
        assert!(compute_care_map("system", &path, None).is_err());
    }

    #[test]
    fn test_format_pairs_lines() {
        let entries = [
            CareMapEntry {
                partition: "system".into(),
                ranges: "0-9".into(),
            },
            CareMapEntry {
                partition: "vendor".into(),
                ranges: "0-3,7".into(),
            },
        ];
        assert_eq!(format_care_map(&entries), "system\n0-9\nvendor\n0-3,7");
        assert_eq!(format_care_map(&[]), "");
    }
}
