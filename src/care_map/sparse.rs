//! Android sparse image reader.
//!
//! Only the chunk table is read: raw chunk payloads are skipped, so the cost is
//! proportional to the number of chunks, not the image size.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::rangeset::RangeSet;

pub const SPARSE_HEADER_MAGIC: u32 = 0xED26_FF3A;

const FILE_HEADER_LEN: u16 = 28;
const CHUNK_HEADER_LEN: u16 = 12;

pub const CHUNK_TYPE_RAW: u16 = 0xCAC1;
pub const CHUNK_TYPE_FILL: u16 = 0xCAC2;
pub const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;
pub const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseImage {
    pub block_size: u32,
    pub total_blocks: u32,
    /// Blocks backed by RAW or FILL chunks.
    pub care_map: RangeSet,
}

impl SparseImage {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("opening sparse image '{}'", path.display()))?;
        Self::read_from(BufReader::new(file))
            .with_context(|| format!("reading sparse image '{}'", path.display()))
    }

    pub fn read_from<R: Read + Seek>(mut reader: R) -> Result<Self> {
        let magic = read_u32(&mut reader)?;
        if magic != SPARSE_HEADER_MAGIC {
            bail!("not a sparse image (magic 0x{:08x})", magic);
        }
        let major_version = read_u16(&mut reader)?;
        let _minor_version = read_u16(&mut reader)?;
        let file_hdr_sz = read_u16(&mut reader)?;
        let chunk_hdr_sz = read_u16(&mut reader)?;
        let block_size = read_u32(&mut reader)?;
        let total_blocks = read_u32(&mut reader)?;
        let total_chunks = read_u32(&mut reader)?;
        let _image_checksum = read_u32(&mut reader)?;

        if major_version != 1 {
            bail!("unsupported sparse image major version {}", major_version);
        }
        if file_hdr_sz < FILE_HEADER_LEN {
            bail!("file header size {} is too small", file_hdr_sz);
        }
        if chunk_hdr_sz < CHUNK_HEADER_LEN {
            bail!("chunk header size {} is too small", chunk_hdr_sz);
        }
        if block_size == 0 || block_size % 4 != 0 {
            bail!("invalid block size {}", block_size);
        }
        skip(&mut reader, u64::from(file_hdr_sz - FILE_HEADER_LEN))?;

        let mut care_map = RangeSet::new();
        let mut pos: u64 = 0;
        for index in 0..total_chunks {
            let chunk_type = read_u16(&mut reader)?;
            let _reserved = read_u16(&mut reader)?;
            let chunk_blocks = u64::from(read_u32(&mut reader)?);
            let total_sz = u64::from(read_u32(&mut reader)?);
            skip(&mut reader, u64::from(chunk_hdr_sz - CHUNK_HEADER_LEN))?;
            let data_sz = total_sz
                .checked_sub(u64::from(chunk_hdr_sz))
                .with_context(|| format!("chunk {index}: total size {total_sz} is too small"))?;

            match chunk_type {
                CHUNK_TYPE_RAW => {
                    let expected = chunk_blocks * u64::from(block_size);
                    if data_sz != expected {
                        bail!(
                            "chunk {index}: raw chunk holds {data_sz} bytes, expected {expected}"
                        );
                    }
                    care_map.push(pos, pos + chunk_blocks);
                    pos += chunk_blocks;
                    skip(&mut reader, data_sz)?;
                }
                CHUNK_TYPE_FILL => {
                    if data_sz != 4 {
                        bail!("chunk {index}: fill chunk holds {data_sz} bytes, expected 4");
                    }
                    care_map.push(pos, pos + chunk_blocks);
                    pos += chunk_blocks;
                    skip(&mut reader, data_sz)?;
                }
                CHUNK_TYPE_DONT_CARE => {
                    if data_sz != 0 {
                        bail!("chunk {index}: don't-care chunk with {data_sz} payload bytes");
                    }
                    pos += chunk_blocks;
                }
                CHUNK_TYPE_CRC32 => {
                    skip(&mut reader, data_sz)?;
                }
                other => bail!("chunk {index}: unknown chunk type 0x{:04x}", other),
            }
        }

        if pos != u64::from(total_blocks) {
            bail!(
                "chunks cover {} blocks but header declares {}",
                pos,
                total_blocks
            );
        }

        Ok(Self {
            block_size,
            total_blocks,
            care_map,
        })
    }
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf).context("unexpected end of image")?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).context("unexpected end of image")?;
    Ok(u32::from_le_bytes(buf))
}

fn skip<R: Seek>(reader: &mut R, bytes: u64) -> Result<()> {
    if bytes > 0 {
        let offset = i64::try_from(bytes).context("chunk too large")?;
        reader.seek(SeekFrom::Current(offset))?;
    }
    Ok(())
}

/// Writes minimal sparse images for tests.
#[cfg(test)]
pub(crate) mod build {
    use super::*;

    pub(crate) enum Chunk {
        Raw(u32),
        Fill(u32),
        DontCare(u32),
        Crc,
    }

    pub(crate) fn sparse_image(block_size: u32, chunks: &[Chunk]) -> Vec<u8> {
        let total_blocks: u32 = chunks
            .iter()
            .map(|chunk| match chunk {
                Chunk::Raw(n) | Chunk::Fill(n) | Chunk::DontCare(n) => *n,
                Chunk::Crc => 0,
            })
            .sum();

        let mut out = Vec::new();
        out.extend_from_slice(&SPARSE_HEADER_MAGIC.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&FILE_HEADER_LEN.to_le_bytes());
        out.extend_from_slice(&CHUNK_HEADER_LEN.to_le_bytes());
        out.extend_from_slice(&block_size.to_le_bytes());
        out.extend_from_slice(&total_blocks.to_le_bytes());
        out.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        for chunk in chunks {
            let (kind, blocks, payload) = match chunk {
                Chunk::Raw(n) => (CHUNK_TYPE_RAW, *n, (*n * block_size) as usize),
                Chunk::Fill(n) => (CHUNK_TYPE_FILL, *n, 4),
                Chunk::DontCare(n) => (CHUNK_TYPE_DONT_CARE, *n, 0),
                Chunk::Crc => (CHUNK_TYPE_CRC32, 0, 4),
            };
            out.extend_from_slice(&kind.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&blocks.to_le_bytes());
            out.extend_from_slice(&(u32::from(CHUNK_HEADER_LEN) + payload as u32).to_le_bytes());
            out.resize(out.len() + payload, 0xAB);
        }
        out
    }
}
