// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! External interface consumed by the core for (de)serializing the
//! `VolumeDataLayout` and `LayerStatus` descriptors (spec §1, §6). The
//! concrete JSON implementation lives in the `vds-api` crate, which depends
//! on this one; the trait itself lives here (next to `ObjectStore`) so
//! `ChunkStore` can invoke it without creating a cycle back to `vds-api`.

use vds_utils::VdsResult;

use crate::codec::CompressionMethod;
use crate::layout::ProduceStatus;

/// One row of the `LayerStatus` array (spec §6).
#[derive(Clone, Debug)]
pub struct LayerStatus {
    pub layer_name: String,
    pub channel_name: String,
    pub dimension_group: String,
    pub lod: u32,
    pub produce_status: ProduceStatus,
    pub compression_method: CompressionMethod,
    pub compression_tolerance: f64,
    pub chunk_count: u64,
    pub chunk_metadata_page_size: u32,
    pub chunk_metadata_byte_size: u32,
    pub uncompressed_size: i64,
    pub adaptive_level_sizes: [i64; crate::layout::WAVELET_ADAPTIVE_LEVELS],
    pub has_chunk_metadata_pages: bool,
}

/// (De)serializes the layout descriptor and per-layer status array to/from
/// the wire representation (spec §4.7 `flush`, §6 `VolumeDataLayout` /
/// `LayerStatus` objects).
pub trait LayoutCodec: Send + Sync {
    fn encode_layer_status(&self, statuses: &[LayerStatus]) -> VdsResult<Vec<u8>>;
    fn decode_layer_status(&self, bytes: &[u8]) -> VdsResult<Vec<LayerStatus>>;
}
