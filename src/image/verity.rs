//! Space reserved at the end of a verity partition.
//!
//! The hash tree uses SHA-256 digests over 4 KiB blocks, the metadata block
//! is a fixed 32 KiB and the optional error correction data is RS(255, 253).

use super::BLOCK_SIZE;

const HASH_SIZE: u64 = 32;
const METADATA_SIZE: u64 = 32 * 1024;
const FEC_RSM: u64 = 255;
const FEC_ROOTS: u64 = 2;

/// Bytes of hash tree covering `data_size` bytes, every level down to the
/// single root block.
pub fn tree_size(data_size: u64) -> u64 {
    let hashes_per_block = BLOCK_SIZE / HASH_SIZE;
    let mut level_blocks = data_size.div_ceil(BLOCK_SIZE);
    let mut total = 0;
    loop {
        level_blocks = level_blocks.div_ceil(hashes_per_block);
        total += level_blocks;
        if level_blocks <= 1 {
            break;
        }
    }
    total * BLOCK_SIZE
}

/// Bytes of error correction data protecting `size` bytes.
pub fn fec_size(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE).div_ceil(FEC_RSM - FEC_ROOTS) * FEC_ROOTS * BLOCK_SIZE + BLOCK_SIZE
}

/// Everything appended after `data_size` bytes of filesystem.
pub fn overhead(data_size: u64, fec: bool) -> u64 {
    let verity = tree_size(data_size) + METADATA_SIZE;
    if fec {
        verity + fec_size(data_size + verity)
    } else {
        verity
    }
}

/// Largest block-aligned filesystem size that fits in `partition_size`
/// together with its verity data.
pub fn adjusted_partition_size(partition_size: u64, fec: bool) -> u64 {
    let mut hi = partition_size / BLOCK_SIZE * BLOCK_SIZE;
    let mut lo = partition_size.saturating_sub(overhead(hi, fec));
    let mut result = lo;
    while lo < hi {
        let candidate = (lo + hi) / (2 * BLOCK_SIZE) * BLOCK_SIZE;
        if candidate + overhead(candidate, fec) <= partition_size {
            result = result.max(candidate);
            lo = candidate + BLOCK_SIZE;
        } else {
            hi = candidate;
        }
    }
    result
}
