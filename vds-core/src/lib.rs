// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The chunk-oriented storage and access engine: dimension/chunk geometry
//! (C1-C2), the layer tree (C3), the external `ObjectStore`/`LayoutCodec`
//! seams (C4), per-layer paged metadata (C5), the chunk codec (C6), the
//! chunk store (C7), the page cache (C8) and the thread-pooled request
//! processor (C9). The public façade (`AccessManager`, C10) lives in the
//! `openvds` crate one level up, the way the teacher keeps `rafs` free of
//! any FUSE/CLI-facing API surface.

pub mod chunk_indexer;
pub mod chunk_store;
pub mod codec;
pub mod data_block;
pub mod dimension_group;
pub mod layout;
pub mod layout_codec;
pub mod metadata_manager;
pub mod object_store;
pub mod page_cache;
pub mod request_processor;

pub use chunk_indexer::{Chunk, ChunkIndexer};
pub use chunk_store::{ChunkStore, StoreMode};
pub use codec::{ChunkCodec, ChunkMetadataEntry, CompressionMethod};
pub use data_block::{block_copy, byte_size, DataBlock, Format, MAX_DIMS};
pub use dimension_group::DimensionGroup;
pub use layout::{
    Axis, Channel, ChannelFlags, ChannelMapping, Layer, LayerHandle, Layout, LayoutDescriptor,
    LayoutFlags, ProduceMethod, ProduceStatus, WAVELET_ADAPTIVE_LEVELS,
};
pub use layout_codec::{LayerStatus, LayoutCodec};
pub use metadata_manager::{MetadataManager, MetadataStatus};
pub use object_store::{ByteRange, GetResult, ObjectHeaders, ObjectStore};
pub use page_cache::{Page, PageCache, PageHandle};
pub use request_processor::{ChunkProcessor, PageAccessorKey, RequestProcessor};
