// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! C7: `ChunkStore` — ties a `Layout` to an `ObjectStore` via one
//! `MetadataManager` per layer. See spec §4.7.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::warn;
use vds_utils::{VdsError, VdsResult};

use crate::chunk_indexer::Chunk;
use crate::codec::{ChunkCodec, ChunkMetadataEntry, CompressionMethod};
use crate::layout::{Layer, LayerHandle, Layout};
use crate::layout_codec::{LayerStatus, LayoutCodec};
use crate::metadata_manager::{MetadataManager, MetadataStatus, SharedMetadataManager};
use crate::object_store::{ByteRange, ObjectStore};

#[derive(Clone)]
enum DownloadState {
    Pending,
    Ready {
        bytes: Vec<u8>,
        entry: ChunkMetadataEntry,
    },
    Failed(VdsError),
}

struct PendingDownload {
    state: DownloadState,
    refcount: u32,
    page_index: u32,
}

/// Whether a `ChunkStore` was opened against a pre-existing dataset (pages
/// are fetched from the backend) or stood up for a brand-new one (pages are
/// synthesized zero-filled on first reference, spec §3 Lifecycles
/// "MetadataPage is constructed on first reference").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    Open,
    Create,
}

/// Given a `Layout` and an `ObjectStore`, mediates chunk reads/writes through
/// per-layer paged metadata (spec §4.7).
pub struct ChunkStore {
    layout: Arc<Layout>,
    store: Arc<dyn ObjectStore>,
    codec: Arc<dyn LayoutCodec>,
    mode: StoreMode,
    managers: Mutex<HashMap<LayerHandle, SharedMetadataManager>>,
    pending: Mutex<HashMap<(LayerHandle, u64), PendingDownload>>,
    pending_cv: Condvar,
    next_job_id: AtomicU64,
    warned_missing_header: AtomicBool,
    /// spec §4.5 `updateMetadataStatus`: per-layer running totals, updated in
    /// `write_chunk` from the old/new metadata-entry delta. `usize` alongside
    /// is the chunk count (entries that hold a real, non-sentinel hash).
    status: Mutex<HashMap<LayerHandle, (MetadataStatus, u64)>>,
}

impl ChunkStore {
    pub fn new(
        layout: Arc<Layout>,
        store: Arc<dyn ObjectStore>,
        codec: Arc<dyn LayoutCodec>,
        mode: StoreMode,
    ) -> ChunkStore {
        let store_for_managers = ChunkStore {
            layout,
            store,
            codec,
            mode,
            managers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            pending_cv: Condvar::new(),
            next_job_id: AtomicU64::new(1),
            warned_missing_header: AtomicBool::new(false),
            status: Mutex::new(HashMap::new()),
        };
        for handle in 0..store_for_managers.layout.layers.len() {
            store_for_managers.add_layer(handle);
        }
        store_for_managers
    }

    /// spec §4.7 `addLayer`: registers a `MetadataManager` with 8-byte or
    /// 28-byte entries depending on whether the layer's compression method is
    /// wavelet-adaptive.
    pub fn add_layer(&self, handle: LayerHandle) {
        let layer = self.layout.layer(handle);
        let entry_size = if layer.compression_method.is_wavelet() { 28 } else { 8 };
        let key = self.layout.layer_key(handle);
        let entries_per_page = layer.chunk_metadata_page_size;
        let manager = Arc::new(MetadataManager::new(key, entries_per_page, entry_size));
        self.managers.lock().unwrap().insert(handle, manager);
    }

    fn manager_for(&self, handle: LayerHandle) -> VdsResult<SharedMetadataManager> {
        self.managers
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or_else(|| VdsError::invalid_argument("no metadata manager registered for layer"))
    }

    fn layer(&self, handle: LayerHandle) -> &Layer {
        self.layout.layer(handle)
    }

    fn object_name(&self, chunk: Chunk) -> String {
        format!("{}/{}", self.layout.layer_key(chunk.layer), chunk.chunk_index)
    }

    /// spec §4.7 `prepareReadChunk`.
    pub fn prepare_read_chunk(&self, chunk: Chunk, adaptive_level: u32) -> VdsResult<()> {
        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(existing) = pending.get_mut(&(chunk.layer, chunk.chunk_index)) {
                existing.refcount += 1;
                return Ok(());
            }
        }

        let manager = self.manager_for(chunk.layer)?;
        let (page_index, entry_index) = manager.entry_location(chunk.chunk_index);
        let needs_transfer = manager.lock_page(page_index);
        if needs_transfer {
            match self.mode {
                StoreMode::Create => manager.init_page(page_index),
                StoreMode::Open => manager.initiate_transfer(page_index, self.store.as_ref()),
            }
        }

        self.pending.lock().unwrap().insert(
            (chunk.layer, chunk.chunk_index),
            PendingDownload {
                state: DownloadState::Pending,
                refcount: 1,
                page_index,
            },
        );

        let result = manager
            .wait_for_valid(page_index)
            .and_then(|_| manager.get_entry(page_index, entry_index))
            .and_then(|bytes| ChunkMetadataEntry::decode(&bytes, manager.entry_size() == 28));

        let state = match result {
            Err(err) => DownloadState::Failed(err),
            Ok(entry) => self.fetch_chunk_body(chunk, &entry, adaptive_level),
        };

        let mut pending = self.pending.lock().unwrap();
        if let Some(slot) = pending.get_mut(&(chunk.layer, chunk.chunk_index)) {
            slot.state = state;
        }
        self.pending_cv.notify_all();
        Ok(())
    }

    fn fetch_chunk_body(&self, chunk: Chunk, entry: &ChunkMetadataEntry, adaptive_level: u32) -> DownloadState {
        if entry.hash == crate::codec::HASH_NOVALUE
            || entry.hash == crate::codec::HASH_UNKNOWN
            || crate::codec::hash_as_constant(entry.hash).is_some()
        {
            return DownloadState::Ready {
                bytes: Vec::new(),
                entry: entry.clone(),
            };
        }

        let range = entry.serialized_range(adaptive_level).map(ByteRange::prefix).flatten();
        let object_name = self.object_name(chunk);
        match self.store.get(&object_name, range) {
            Ok(result) => {
                if let Some(header) = result
                    .headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("vdschunkmetadata"))
                {
                    match base64::decode(&header.1) {
                        Ok(decoded) if decoded == entry.encode() => {}
                        Ok(_) => {
                            return DownloadState::Failed(VdsError::InconsistentMetadata(format!(
                                "blob header for {object_name} does not match metadata page entry"
                            )))
                        }
                        Err(e) => {
                            return DownloadState::Failed(VdsError::ChunkCorruption(format!(
                                "malformed vdschunkmetadata header: {e}"
                            )))
                        }
                    }
                } else if !self.warned_missing_header.swap(true, Ordering::Relaxed) {
                    warn!("{object_name}: blob has no vdschunkmetadata header, trusting metadata page entry");
                }
                DownloadState::Ready {
                    bytes: result.data,
                    entry: entry.clone(),
                }
            }
            Err(err) => DownloadState::Failed(err),
        }
    }

    /// spec §4.7 `readChunk`.
    pub fn read_chunk(
        &self,
        chunk: Chunk,
    ) -> VdsResult<(Vec<u8>, ChunkMetadataEntry, CompressionMethod)> {
        let mut pending = self.pending.lock().unwrap();
        loop {
            match pending.get(&(chunk.layer, chunk.chunk_index)) {
                Some(slot) => match &slot.state {
                    DownloadState::Ready { bytes, entry } => {
                        let method = self.layer(chunk.layer).compression_method;
                        return Ok((bytes.clone(), entry.clone(), method));
                    }
                    DownloadState::Failed(err) => return Err(err.clone()),
                    DownloadState::Pending => {
                        pending = self.pending_cv.wait(pending).unwrap();
                    }
                },
                None => {
                    return Err(VdsError::invalid_argument(
                        "readChunk called without a matching prepareReadChunk",
                    ))
                }
            }
        }
    }

    /// spec §4.7 `cancelReadChunk`.
    pub fn cancel_read_chunk(&self, chunk: Chunk) -> VdsResult<()> {
        let page_index = {
            let mut pending = self.pending.lock().unwrap();
            let Some(slot) = pending.get_mut(&(chunk.layer, chunk.chunk_index)) else {
                return Ok(());
            };
            slot.refcount = slot.refcount.saturating_sub(1);
            if slot.refcount > 0 {
                return Ok(());
            }
            let slot = pending.remove(&(chunk.layer, chunk.chunk_index)).unwrap();
            slot.page_index
        };
        let manager = self.manager_for(chunk.layer)?;
        manager.unlock_page(page_index);
        Ok(())
    }

    /// spec §4.7 `writeChunk`; retries the upload up to twice before giving
    /// up (spec §7 ObjectStoreTransport policy).
    pub fn write_chunk(&self, chunk: Chunk, bytes: &[u8], entry: ChunkMetadataEntry) -> VdsResult<u64> {
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let object_name = self.object_name(chunk);
        let headers = vec![("vdschunkmetadata".to_string(), base64::encode(entry.encode()))];

        if !bytes.is_empty() {
            let mut attempt = 0;
            loop {
                match self.store.put(&object_name, bytes, headers.clone()) {
                    Ok(()) => break,
                    Err(err) if attempt < 2 => {
                        attempt += 1;
                        warn!("retrying chunk upload for {object_name} after error: {err}");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let manager = self.manager_for(chunk.layer)?;
        let (page_index, entry_index) = manager.entry_location(chunk.chunk_index);
        let needs_transfer = manager.lock_page(page_index);
        if needs_transfer {
            match self.mode {
                StoreMode::Create => manager.init_page(page_index),
                StoreMode::Open => manager.initiate_transfer(page_index, self.store.as_ref()),
            }
        }
        manager.wait_for_valid(page_index)?;
        let is_adaptive = manager.entry_size() == 28;
        let previous_entry = manager.set_entry(page_index, entry_index, &entry.encode())?;
        manager.unlock_page(page_index);

        if let Ok(old) = ChunkMetadataEntry::decode(&previous_entry, is_adaptive) {
            self.update_metadata_status(chunk.layer, &old, &entry);
        }
        Ok(job_id)
    }

    /// spec §4.5 `updateMetadataStatus`: folds the old entry out and the new
    /// entry in, so the running total always reflects the latest write per
    /// chunk rather than double-counting re-writes. `ChunkMetadataEntry`
    /// carries only one size (the stored, possibly-compressed byte count), so
    /// that's what feeds `LayerStatus::uncompressed_size` here.
    fn update_metadata_status(&self, layer: LayerHandle, old: &ChunkMetadataEntry, new: &ChunkMetadataEntry) {
        let mut status = self.status.lock().unwrap();
        let (totals, chunk_count) = status.entry(layer).or_insert((MetadataStatus::default(), 0));
        let zero_levels = [0u8; crate::layout::WAVELET_ADAPTIVE_LEVELS];
        totals.accumulate(old.serialized_size as i64, 0, true, old.adaptive_level_sizes.as_ref().unwrap_or(&zero_levels));
        totals.accumulate(new.serialized_size as i64, 0, false, new.adaptive_level_sizes.as_ref().unwrap_or(&zero_levels));

        let old_has_value = has_real_value(old);
        let new_has_value = has_real_value(new);
        if new_has_value && !old_has_value {
            *chunk_count += 1;
        } else if old_has_value && !new_has_value {
            *chunk_count = chunk_count.saturating_sub(1);
        }
    }

    /// spec §4.7 `flush`.
    pub fn flush(&self, write_updated_layer_status: bool) -> VdsResult<()> {
        let managers: Vec<SharedMetadataManager> = self.managers.lock().unwrap().values().cloned().collect();
        for manager in &managers {
            manager.upload_dirty_pages(self.store.as_ref())?;
        }

        if write_updated_layer_status {
            let statuses = self.build_layer_statuses();
            let bytes = self.codec.encode_layer_status(&statuses)?;
            self.store.put("LayerStatus", &bytes, Vec::new())?;
        }
        Ok(())
    }

    fn build_layer_statuses(&self) -> Vec<LayerStatus> {
        let managers = self.managers.lock().unwrap();
        let status = self.status.lock().unwrap();
        (0..self.layout.layers.len())
            .map(|handle| {
                let layer = self.layout.layer(handle);
                let channel = &self.layout.channels[layer.channel];
                let (totals, chunk_count) = status.get(&handle).copied().unwrap_or((MetadataStatus::default(), 0));
                let manager = managers.get(&handle);
                LayerStatus {
                    layer_name: self.layout.layer_key(handle),
                    channel_name: channel.name.clone(),
                    dimension_group: layer.dimension_group.name(),
                    lod: layer.lod,
                    produce_status: layer.produce_status,
                    compression_method: layer.compression_method,
                    compression_tolerance: layer.compression_tolerance,
                    chunk_count,
                    chunk_metadata_page_size: layer.chunk_metadata_page_size,
                    chunk_metadata_byte_size: manager.map(|m| m.entry_size()).unwrap_or(8),
                    uncompressed_size: totals.uncompressed_size,
                    adaptive_level_sizes: totals.adaptive_level_sizes,
                    has_chunk_metadata_pages: manager.is_some(),
                }
            })
            .collect()
    }
}

/// Whether a decoded metadata entry refers to a real, written chunk rather
/// than an unset/no-value sentinel (spec §4.5 `updateMetadataStatus` chunk
/// count).
fn has_real_value(entry: &ChunkMetadataEntry) -> bool {
    entry.hash != crate::codec::HASH_UNKNOWN
        && entry.hash != crate::codec::HASH_NOVALUE
        && crate::codec::hash_as_constant(entry.hash).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_block::{DataBlock, Format};
    use crate::layout::{Axis, Channel, ChannelFlags, ChannelMapping, LayoutDescriptor};
    use crate::object_store::{GetResult, ObjectHeaders};
    use std::collections::HashMap as StdHashMap;

    struct MemStore {
        objects: Mutex<StdHashMap<String, (Vec<u8>, ObjectHeaders)>>,
    }

    impl MemStore {
        fn new() -> MemStore {
            MemStore {
                objects: Mutex::new(StdHashMap::new()),
            }
        }
    }

    impl ObjectStore for MemStore {
        fn get(&self, key: &str, range: Option<ByteRange>) -> VdsResult<GetResult> {
            let objects = self.objects.lock().unwrap();
            let (data, headers) = objects
                .get(key)
                .ok_or_else(|| VdsError::ObjectStoreTransport(format!("no such object {key}")))?;
            let sliced = match range {
                Some(r) => data[..(r.end as usize).min(data.len())].to_vec(),
                None => data.clone(),
            };
            Ok(GetResult {
                data: sliced,
                headers: headers.clone(),
            })
        }
        fn put(&self, key: &str, data: &[u8], headers: ObjectHeaders) -> VdsResult<()> {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), (data.to_vec(), headers));
            Ok(())
        }
        fn exists(&self, key: &str) -> VdsResult<bool> {
            Ok(self.objects.lock().unwrap().contains_key(key))
        }
    }

    struct NoopLayoutCodec;
    impl LayoutCodec for NoopLayoutCodec {
        fn encode_layer_status(&self, statuses: &[LayerStatus]) -> VdsResult<Vec<u8>> {
            Ok(format!("{} layers", statuses.len()).into_bytes())
        }
        fn decode_layer_status(&self, _bytes: &[u8]) -> VdsResult<Vec<LayerStatus>> {
            Ok(Vec::new())
        }
    }

    fn small_layout() -> Arc<Layout> {
        let descriptor = LayoutDescriptor {
            brick_size: 8,
            ..Default::default()
        };
        let axes = (0..3)
            .map(|i| Axis {
                name: format!("axis{i}"),
                unit: "m".into(),
                sample_count: 16,
                coordinate_min: 0.0,
                coordinate_max: 15.0,
            })
            .collect();
        let channels = vec![Channel {
            name: "Amplitude".into(),
            unit: "".into(),
            format: Format::F32,
            components: 1,
            value_min: -1.0,
            value_max: 1.0,
            no_value: Some(-9999.0),
            mapping: ChannelMapping::Direct,
            flags: ChannelFlags::ALLOW_LOSSY_COMPRESSION,
            integer_scale: 1.0,
            integer_offset: 0.0,
            requested_compression: CompressionMethod::None,
            base_tolerance: 0.01,
        }];
        Arc::new(Layout::build(descriptor, axes, channels).unwrap())
    }

    #[test]
    fn write_then_read_round_trips_a_chunk() {
        let layout = small_layout();
        let handle = layout.layer_by_key("Dimensions_012LOD0").unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let codec: Arc<dyn LayoutCodec> = Arc::new(NoopLayoutCodec);
        let chunk_store = ChunkStore::new(layout.clone(), store, codec, StoreMode::Create);

        let mut block = DataBlock::new(Format::F32, 1, [8, 8, 8, 1]);
        block.write_element_from_f64([0, 0, 0, 0], 0, 3.5);
        let chunk = Chunk { layer: handle, chunk_index: 0 };
        let (bytes, entry) = ChunkCodec::encode(chunk, &block, CompressionMethod::None).unwrap();
        chunk_store.write_chunk(chunk, &bytes, entry).unwrap();
        chunk_store.flush(false).unwrap();

        chunk_store.prepare_read_chunk(chunk, 0).unwrap();
        let (read_bytes, read_entry, method) = chunk_store.read_chunk(chunk).unwrap();
        assert_eq!(method, CompressionMethod::None);
        let decoded = ChunkCodec::decode(
            chunk,
            &read_bytes,
            &read_entry,
            method,
            0,
            Format::F32,
            1,
            [8, 8, 8, 1],
            Some(-9999.0),
        )
        .unwrap();
        assert_eq!(decoded.read_element_as_f64([0, 0, 0, 0], 0), 3.5);
        chunk_store.cancel_read_chunk(chunk).unwrap();
    }

    #[test]
    fn flush_reports_chunk_count_and_serialized_size() {
        let layout = small_layout();
        let handle = layout.layer_by_key("Dimensions_012LOD0").unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let codec: Arc<dyn LayoutCodec> = Arc::new(NoopLayoutCodec);
        let chunk_store = ChunkStore::new(layout.clone(), store, codec, StoreMode::Create);

        let mut block = DataBlock::new(Format::F32, 1, [8, 8, 8, 1]);
        block.write_element_from_f64([0, 0, 0, 0], 0, 1.0);
        block.write_element_from_f64([1, 0, 0, 0], 0, 2.0);
        let chunk = Chunk { layer: handle, chunk_index: 0 };
        let (bytes, entry) = ChunkCodec::encode(chunk, &block, CompressionMethod::None).unwrap();
        let expected_size = entry.serialized_size as i64;
        chunk_store.write_chunk(chunk, &bytes, entry).unwrap();

        let statuses = chunk_store.build_layer_statuses();
        let status = statuses.iter().find(|s| s.layer_name == "Dimensions_012LOD0").unwrap();
        assert_eq!(status.chunk_count, 1);
        assert_eq!(status.uncompressed_size, expected_size);
        assert_eq!(status.adaptive_level_sizes, [0i64; crate::layout::WAVELET_ADAPTIVE_LEVELS]);
    }

    #[test]
    fn unread_chunk_is_novalue_by_default() {
        let layout = small_layout();
        let handle = layout.layer_by_key("Dimensions_012LOD0").unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let codec: Arc<dyn LayoutCodec> = Arc::new(NoopLayoutCodec);
        let chunk_store = ChunkStore::new(layout.clone(), store, codec, StoreMode::Create);
        let chunk = Chunk { layer: handle, chunk_index: 0 };
        chunk_store.prepare_read_chunk(chunk, 0).unwrap();
        let (bytes, entry, _method) = chunk_store.read_chunk(chunk).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(entry.hash, crate::codec::HASH_UNKNOWN);
    }
}
