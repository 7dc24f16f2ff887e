//! Block-compressed wire format.
//!
//! Layout: `magic u32 | version u16 | block_count u32 |
//! original_size[block_count] u32 | compressed_size[block_count] u32 |
//! payloads`. All integers little-endian. Payloads are LZ4-HC streams of
//! at most 64 KiB of original data each.

use lz4::block::{CompressionMode, compress, decompress};
use tracing::debug;

use crate::error::{VfsError, VfsResult};

const MAGIC: u32 = 0x4C5A_3432;
const VERSION: u16 = 0x0100;
const BLOCK_SIZE: usize = 64 * 1024;
const COMPRESSION_LEVEL: i32 = 9;

pub fn compress_bytes(data: &[u8]) -> VfsResult<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let blocks: Vec<&[u8]> = data.chunks(BLOCK_SIZE).collect();
    let mut payloads = Vec::with_capacity(blocks.len());
    for block in &blocks {
        let payload = compress(block, Some(CompressionMode::HIGHCOMPRESSION(COMPRESSION_LEVEL)), false)
            .map_err(|e| VfsError::Internal(format!("lz4 compression failed: {e}")))?;
        payloads.push(payload);
    }

    let header_len = 4 + 2 + 4 + blocks.len() * 8;
    let payload_len: usize = payloads.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(header_len + payload_len);

    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
    for block in &blocks {
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());
    }
    for payload in &payloads {
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    }
    for payload in &payloads {
        out.extend_from_slice(payload);
    }

    debug!(
        original = data.len(),
        compressed = out.len(),
        blocks = blocks.len(),
        "compressed payload"
    );
    Ok(out)
}

pub fn decompress_bytes(data: &[u8]) -> VfsResult<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.len() < 10 {
        return Err(VfsError::Corruption("compressed header truncated".to_string()));
    }

    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(VfsError::Corruption(format!("bad magic 0x{magic:08X}")));
    }
    let version = u16::from_le_bytes(data[4..6].try_into().unwrap());
    if version != VERSION {
        return Err(VfsError::Corruption(format!("unsupported version 0x{version:04X}")));
    }
    let block_count = u32::from_le_bytes(data[6..10].try_into().unwrap()) as usize;
    if block_count == 0 {
        return Ok(Vec::new());
    }

    let tables_len = block_count * 8;
    if data.len() < 10 + tables_len {
        return Err(VfsError::Corruption("block size tables truncated".to_string()));
    }

    let mut offset = 10;
    let mut original_sizes = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        original_sizes.push(u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize);
        offset += 4;
    }
    let mut compressed_sizes = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        compressed_sizes.push(u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize);
        offset += 4;
    }

    let mut out = Vec::with_capacity(original_sizes.iter().sum());
    for (original, compressed) in original_sizes.iter().zip(&compressed_sizes) {
        if offset + compressed > data.len() {
            return Err(VfsError::Corruption("block payload truncated".to_string()));
        }
        let block = decompress(&data[offset..offset + compressed], Some(*original as i32))
            .map_err(|e| VfsError::Corruption(format!("lz4 decompression failed: {e}")))?;
        if block.len() != *original {
            return Err(VfsError::Corruption(format!(
                "block size mismatch: expected {original}, got {}",
                block.len()
            )));
        }
        out.extend_from_slice(&block);
        offset += compressed;
    }

    Ok(out)
}
