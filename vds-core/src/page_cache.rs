// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! C8: `PageCache` (`VolumeDataPageAccessor`) — LRU of decompressed pages for
//! one `(DimensionGroup, LOD, Channel)`. See spec §4.8.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use log::warn;
use vds_utils::{VdsError, VdsResult};

use crate::chunk_indexer::{Chunk, ChunkIndexer};
use crate::chunk_store::ChunkStore;
use crate::codec::ChunkCodec;
use crate::data_block::{block_copy, DataBlock, MAX_DIMS};
use crate::layout::{Layer, LayerHandle, Layout};

bitflags::bitflags! {
    struct PageFlags: u32 {
        const READ_WRITE        = 0b0000_0001;
        const DIRTY             = 0b0000_0010;
        const REQUEST_PREPARED  = 0b0000_0100;
        const SETTING_DATA      = 0b0000_1000;
    }
}

/// One resident chunk buffer (spec §4.8 "Per `Page`").
pub struct Page {
    pub chunk_index: u64,
    data_block: Option<DataBlock>,
    pitch: [u32; MAX_DIMS],
    flags: PageFlags,
    pins: u32,
    written_min: [u32; MAX_DIMS],
    written_max: [u32; MAX_DIMS],
    has_written_region: bool,
    copied_to: Vec<u64>,
    error: Option<VdsError>,
}

impl Page {
    fn new(chunk_index: u64) -> Page {
        Page {
            chunk_index,
            data_block: None,
            pitch: [0; MAX_DIMS],
            flags: PageFlags::empty(),
            pins: 0,
            written_min: [0; MAX_DIMS],
            written_max: [0; MAX_DIMS],
            has_written_region: false,
            copied_to: Vec::new(),
            error: None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PageFlags::DIRTY)
    }
}

pub type PageHandle = u64;

struct Inner {
    pages: HashMap<PageHandle, Page>,
    /// MRU order, front = most recently used.
    mru: Vec<PageHandle>,
    by_chunk_index: HashMap<u64, PageHandle>,
    next_handle: PageHandle,
    max_pages: usize,
    commit_in_progress: bool,
}

/// Mediates read/write access to chunks of one layer (spec §4.8).
pub struct PageCache {
    layout: Arc<Layout>,
    layer_handle: LayerHandle,
    indexer: ChunkIndexer,
    chunk_store: Arc<ChunkStore>,
    writable: bool,
    no_value: Option<f64>,
    inner: Mutex<Inner>,
    page_read_cv: Condvar,
    commit_finished_cv: Condvar,
}

impl PageCache {
    pub fn new(
        layout: Arc<Layout>,
        layer_handle: LayerHandle,
        chunk_store: Arc<ChunkStore>,
        writable: bool,
        no_value: Option<f64>,
    ) -> PageCache {
        let indexer = ChunkIndexer::for_layer(&layout, layer_handle);
        PageCache {
            layout,
            layer_handle,
            indexer,
            chunk_store,
            writable,
            no_value,
            inner: Mutex::new(Inner {
                pages: HashMap::new(),
                mru: Vec::new(),
                by_chunk_index: HashMap::new(),
                next_handle: 1,
                max_pages: 8,
                commit_in_progress: false,
            }),
            page_read_cv: Condvar::new(),
            commit_finished_cv: Condvar::new(),
        }
    }

    fn layer(&self) -> &Layer {
        self.layout.layer(self.layer_handle)
    }

    pub fn indexer(&self) -> &ChunkIndexer {
        &self.indexer
    }

    /// Sets the resident-page budget and immediately evicts down to it
    /// (spec §4.9 idle-accessor cleanup thread relies on this reaching 0
    /// synchronously rather than waiting for the next unrelated `release`).
    pub fn set_max_pages(&self, max_pages: usize) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.max_pages = max_pages;
        }
        self.limit_page_list_size();
    }

    pub fn page_count(&self) -> usize {
        self.inner.lock().unwrap().pages.len()
    }

    /// Supplement over spec.md (`VolumeDataPageAccessor::GetNumberOfPages`):
    /// resident page count, exposed under the name callers coming from the
    /// original API expect.
    pub fn num_pages(&self) -> usize {
        self.page_count()
    }

    /// `VolumeDataPageAccessor::GetNumberOfChannels` (supplement).
    pub fn num_channels(&self) -> usize {
        self.layout.channels.len()
    }

    /// `VolumeDataPageAccessor::GetNumSamples` (supplement): per-axis chunk
    /// count of this accessor's grid, local-brick order.
    pub fn num_samples(&self) -> Vec<u32> {
        self.indexer.chunks_per_dim().to_vec()
    }

    pub fn layer_handle(&self) -> LayerHandle {
        self.layer_handle
    }

    fn wait_commit_finished<'a>(
        &self,
        mut guard: std::sync::MutexGuard<'a, Inner>,
    ) -> std::sync::MutexGuard<'a, Inner> {
        while guard.commit_in_progress {
            guard = self.commit_finished_cv.wait(guard).unwrap();
        }
        guard
    }

    /// spec §4.8 `prepareReadPage`.
    pub fn prepare_read_page(&self, chunk_index: u64) -> VdsResult<PageHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner = self.wait_commit_finished(inner);

        if let Some(&handle) = inner.by_chunk_index.get(&chunk_index) {
            if let Some(page) = inner.pages.get_mut(&handle) {
                page.pins += 1;
            }
            touch_mru(&mut inner.mru, handle);
            return Ok(handle);
        }

        let handle = inner.next_handle;
        inner.next_handle += 1;
        let mut page = Page::new(chunk_index);
        page.pins = 1;
        page.flags.insert(PageFlags::REQUEST_PREPARED);
        inner.pages.insert(handle, page);
        inner.by_chunk_index.insert(chunk_index, handle);
        inner.mru.insert(0, handle);
        drop(inner);

        let chunk = Chunk {
            layer: self.layer_handle,
            chunk_index,
        };
        self.chunk_store.prepare_read_chunk(chunk, self.adaptive_level())?;
        Ok(handle)
    }

    fn adaptive_level(&self) -> u32 {
        self.layer().adaptive_load_level(&self.layout)
    }

    /// spec §4.8 `readPreparedPage`: exactly one waiter decodes.
    pub fn read_prepared_page(&self, handle: PageHandle) -> VdsResult<()> {
        let should_decode = {
            let mut inner = self.inner.lock().unwrap();
            let page = inner
                .pages
                .get_mut(&handle)
                .ok_or_else(|| VdsError::invalid_argument("unknown page handle"))?;
            if !page.flags.contains(PageFlags::REQUEST_PREPARED) {
                return match &page.error {
                    Some(err) => Err(err.clone()),
                    None => Ok(()),
                };
            }
            if page.flags.contains(PageFlags::SETTING_DATA) {
                false
            } else {
                page.flags.insert(PageFlags::SETTING_DATA);
                true
            }
        };

        if !should_decode {
            let mut inner = self.inner.lock().unwrap();
            loop {
                let page = inner
                    .pages
                    .get(&handle)
                    .ok_or_else(|| VdsError::invalid_argument("unknown page handle"))?;
                if !page.flags.contains(PageFlags::REQUEST_PREPARED) {
                    return match &page.error {
                        Some(err) => Err(err.clone()),
                        None => Ok(()),
                    };
                }
                inner = self.page_read_cv.wait(inner).unwrap();
            }
        }

        let chunk_index = {
            let inner = self.inner.lock().unwrap();
            inner.pages.get(&handle).unwrap().chunk_index
        };
        let chunk = Chunk {
            layer: self.layer_handle,
            chunk_index,
        };

        let decode_result = self.chunk_store.read_chunk(chunk).and_then(|(bytes, entry, method)| {
            let layer = self.layer();
            let channel = &self.layout.channels[layer.channel];
            let size = self.page_block_size(chunk_index);
            ChunkCodec::decode(
                chunk,
                &bytes,
                &entry,
                method,
                self.adaptive_level(),
                channel.format,
                channel.components,
                size,
                channel.no_value.or(self.no_value),
            )
        });

        let mut inner = self.inner.lock().unwrap();
        let page = inner.pages.get_mut(&handle).unwrap();
        match decode_result {
            Ok(block) => {
                page.pitch = block.pitch();
                page.data_block = Some(block);
                page.flags.remove(PageFlags::REQUEST_PREPARED | PageFlags::SETTING_DATA);
            }
            Err(err) => {
                page.error = Some(err.clone());
                page.flags.remove(PageFlags::REQUEST_PREPARED | PageFlags::SETTING_DATA);
                self.page_read_cv.notify_all();
                return Err(err);
            }
        }
        self.page_read_cv.notify_all();
        Ok(())
    }

    pub fn cancel_prepared_read(&self, handle: PageHandle) -> VdsResult<()> {
        let chunk_index = {
            let mut inner = self.inner.lock().unwrap();
            let Some(page) = inner.pages.get_mut(&handle) else {
                return Ok(());
            };
            page.error.get_or_insert(VdsError::Canceled);
            page.chunk_index
        };
        self.chunk_store.cancel_read_chunk(Chunk {
            layer: self.layer_handle,
            chunk_index,
        })
    }

    fn page_block_size(&self, chunk_index: u64) -> [u32; MAX_DIMS] {
        let (min, max) = self.indexer.chunk_min_max(chunk_index, true);
        let mut size = [1u32; MAX_DIMS];
        for d in 0..min.len() {
            size[d] = max[d] - min[d];
        }
        size
    }

    /// spec §4.8 `createPage`: allocate, pre-fill via the no-value constant,
    /// mark dirty; rejects a duplicate chunk index.
    pub fn create_page(&self, chunk_index: u64) -> VdsResult<PageHandle> {
        if !self.writable {
            return Err(VdsError::invalid_argument("page cache was not opened writable"));
        }
        let mut inner = self.inner.lock().unwrap();
        inner = self.wait_commit_finished(inner);
        if inner.by_chunk_index.contains_key(&chunk_index) {
            return Err(VdsError::invalid_argument("duplicate chunk index"));
        }

        let layer = self.layer();
        let channel = &self.layout.channels[layer.channel];
        let size = self.page_block_size(chunk_index);
        let block = ChunkCodec::create_constant_value_block(
            channel.format,
            channel.components,
            size,
            channel.no_value.or(self.no_value).unwrap_or(0.0),
        );

        let handle = inner.next_handle;
        inner.next_handle += 1;
        let mut page = Page::new(chunk_index);
        page.pins = 1;
        page.pitch = block.pitch();
        page.data_block = Some(block);
        page.flags.insert(PageFlags::DIRTY);
        if self.writable {
            page.flags.insert(PageFlags::READ_WRITE);
        }
        inner.pages.insert(handle, page);
        inner.by_chunk_index.insert(chunk_index, handle);
        inner.mru.insert(0, handle);
        Ok(handle)
    }

    pub fn get_buffer(&self, handle: PageHandle) -> VdsResult<(Vec<u8>, [u32; MAX_DIMS])> {
        let inner = self.inner.lock().unwrap();
        let page = inner
            .pages
            .get(&handle)
            .ok_or_else(|| VdsError::invalid_argument("unknown page handle"))?;
        let block = page
            .data_block
            .as_ref()
            .ok_or_else(|| VdsError::invalid_argument("page has no decoded data"))?;
        Ok((block.buffer().to_vec(), page.pitch))
    }

    pub fn get_writable_buffer(&self, handle: PageHandle) -> VdsResult<()> {
        if !self.writable {
            return Err(VdsError::invalid_argument("page cache was not opened writable"));
        }
        let inner = self.inner.lock().unwrap();
        if !inner.pages.contains_key(&handle) {
            return Err(VdsError::invalid_argument("unknown page handle"));
        }
        Ok(())
    }

    /// Writes `value` into every voxel of `[min,max)` (local page
    /// coordinates) and records the written region (spec §4.8
    /// `updateWrittenRegion`).
    pub fn write_region(
        &self,
        handle: PageHandle,
        min: [u32; MAX_DIMS],
        max: [u32; MAX_DIMS],
        component: u32,
        values: &[f64],
    ) -> VdsResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let page = inner
            .pages
            .get_mut(&handle)
            .ok_or_else(|| VdsError::invalid_argument("unknown page handle"))?;
        let block = page
            .data_block
            .as_mut()
            .ok_or_else(|| VdsError::invalid_argument("page has no decoded data"))?;

        let mut i = 0usize;
        for w in min[3]..max[3] {
            for z in min[2]..max[2] {
                for y in min[1]..max[1] {
                    for x in min[0]..max[0] {
                        if i >= values.len() {
                            break;
                        }
                        block.write_element_from_f64([x, y, z, w], component, values[i]);
                        i += 1;
                    }
                }
            }
        }

        self.update_written_region(page, min, max);
        Ok(())
    }

    fn update_written_region(&self, page: &mut Page, min: [u32; MAX_DIMS], max: [u32; MAX_DIMS]) {
        if page.has_written_region {
            for d in 0..MAX_DIMS {
                page.written_min[d] = page.written_min[d].min(min[d]);
                page.written_max[d] = page.written_max[d].max(max[d]);
            }
        } else {
            page.written_min = min;
            page.written_max = max;
            page.has_written_region = true;
        }
        page.copied_to.clear();
        page.flags.insert(PageFlags::DIRTY);
    }

    /// spec §4.8 `isCopyMarginNeeded`.
    pub fn is_copy_margin_needed(&self, source: PageHandle, target: PageHandle) -> bool {
        let inner = self.inner.lock().unwrap();
        self.is_copy_margin_needed_locked(&inner, source, target)
    }

    fn is_copy_margin_needed_locked(&self, inner: &Inner, source: PageHandle, target: PageHandle) -> bool {
        let (Some(src), Some(tgt)) = (inner.pages.get(&source), inner.pages.get(&target)) else {
            return false;
        };
        if !src.has_written_region || src.copied_to.contains(&tgt.chunk_index) {
            return false;
        }
        let (tgt_min, tgt_max) = self.indexer.chunk_min_max(tgt.chunk_index, true);
        (0..tgt_min.len()).all(|d| {
            (src.written_min[d] as i64) < tgt_max[d] as i64 && (src.written_max[d] as i64) > tgt_min[d] as i64
        })
    }

    /// spec §4.8 `copyMargin`: copies the overlap of `source`'s written
    /// region into `target` via the 4-D `blockCopy`.
    pub fn copy_margin(&self, source: PageHandle, target: PageHandle) -> VdsResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.copy_margin_locked(&mut inner, source, target)
    }

    fn copy_margin_locked(&self, inner: &mut Inner, source: PageHandle, target: PageHandle) -> VdsResult<()> {
        let (src_chunk, src_origin_voxel) = {
            let page = inner.pages.get(&source).unwrap();
            (page.chunk_index, self.indexer.chunk_min_max(page.chunk_index, true).0)
        };
        let (tgt_chunk, tgt_origin_voxel) = {
            let page = inner.pages.get(&target).unwrap();
            (page.chunk_index, self.indexer.chunk_min_max(page.chunk_index, true).0)
        };

        // Overlap in absolute voxel space.
        let (src_min, src_max) = self.indexer.chunk_min_max(src_chunk, true);
        let (tgt_min, tgt_max) = self.indexer.chunk_min_max(tgt_chunk, true);
        let mut overlap_min = [0u32; MAX_DIMS];
        let mut overlap_max = [0u32; MAX_DIMS];
        for d in 0..src_min.len() {
            overlap_min[d] = src_min[d].max(tgt_min[d]);
            overlap_max[d] = src_max[d].min(tgt_max[d]);
            if overlap_max[d] <= overlap_min[d] {
                return Ok(());
            }
        }

        let mut src_local = [0u32; MAX_DIMS];
        let mut dst_local = [0u32; MAX_DIMS];
        let mut sizes = [1u32; MAX_DIMS];
        for d in 0..src_origin_voxel.len() {
            src_local[d] = overlap_min[d] - src_origin_voxel[d];
            dst_local[d] = overlap_min[d] - tgt_origin_voxel[d];
            sizes[d] = overlap_max[d] - overlap_min[d];
        }

        let src_block = inner
            .pages
            .get(&source)
            .and_then(|p| p.data_block.clone())
            .ok_or_else(|| VdsError::invalid_argument("source page has no decoded data"))?;

        // Take `target` out of the map so it can be mutated independently
        // of `source` without two live `&mut` borrows into the same map.
        let mut tgt_page = inner
            .pages
            .remove(&target)
            .ok_or_else(|| VdsError::invalid_argument("unknown target page handle"))?;
        let result = match tgt_page.data_block.as_mut() {
            Some(tgt_block) => {
                block_copy(tgt_block, dst_local, &src_block, src_local, sizes);
                tgt_page.flags.insert(PageFlags::DIRTY);
                Ok(())
            }
            None => Err(VdsError::invalid_argument("target page has no decoded data")),
        };
        inner.pages.insert(target, tgt_page);
        result?;

        if let Some(src_page) = inner.pages.get_mut(&source) {
            src_page.copied_to.push(tgt_chunk);
        }
        Ok(())
    }

    /// Releases a pin acquired by `prepare_read_page`/`create_page`.
    pub fn release(&self, handle: PageHandle) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(page) = inner.pages.get_mut(&handle) {
                page.pins = page.pins.saturating_sub(1);
            }
        }
        self.limit_page_list_size();
    }

    /// spec §4.8 eviction (`limitPageListSize`): before writing an evicted
    /// written page back, waits for any resident neighbor this page still
    /// owes a margin to but that hasn't finished its own read yet, then
    /// copies margins into every such neighbor.
    fn limit_page_list_size(&self) {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.mru.len() <= inner.max_pages {
                break;
            }
            inner = self.wait_commit_finished(inner);

            let evict_pos = inner
                .mru
                .iter()
                .rposition(|h| inner.pages.get(h).map(|p| p.pins == 0).unwrap_or(false));
            let Some(pos) = evict_pos else { break };
            let handle = inner.mru[pos];

            let is_written = inner.pages.get(&handle).map(|p| p.has_written_region).unwrap_or(false);
            if is_written {
                loop {
                    let targets: Vec<PageHandle> = inner.mru.clone();
                    let still_in_flight = targets.iter().any(|&target| {
                        target != handle
                            && self.is_copy_margin_needed_locked(&inner, handle, target)
                            && inner
                                .pages
                                .get(&target)
                                .map(|p| p.flags.contains(PageFlags::REQUEST_PREPARED))
                                .unwrap_or(false)
                    });
                    if !still_in_flight {
                        break;
                    }
                    if let Some(page) = inner.pages.get_mut(&handle) {
                        page.pins += 1;
                    }
                    inner = self.page_read_cv.wait(inner).unwrap();
                    if let Some(page) = inner.pages.get_mut(&handle) {
                        page.pins = page.pins.saturating_sub(1);
                    }
                    // Re-pinned by another caller while we released the lock
                    // to wait; abort evicting this page for now.
                    if inner.pages.get(&handle).map(|p| p.pins > 0).unwrap_or(true) {
                        break;
                    }
                }
                if inner.pages.get(&handle).map(|p| p.pins > 0).unwrap_or(true) {
                    continue;
                }

                let targets: Vec<PageHandle> = inner.mru.clone();
                for target in targets {
                    if target != handle && self.is_copy_margin_needed_locked(&inner, handle, target) {
                        let _ = self.copy_margin_locked(&mut inner, handle, target);
                    }
                }
            }

            let is_dirty = inner.pages.get(&handle).map(|p| p.is_dirty()).unwrap_or(false);
            if is_dirty {
                if let Some(page) = inner.pages.get(&handle) {
                    let chunk = Chunk {
                        layer: self.layer_handle,
                        chunk_index: page.chunk_index,
                    };
                    if let Some(block) = &page.data_block {
                        let layer = self.layer();
                        let compression = layer.compression_method;
                        match ChunkCodec::encode(chunk, block, compression) {
                            Ok((bytes, entry)) => {
                                let _ = self.chunk_store.write_chunk(chunk, &bytes, entry);
                            }
                            Err(err) => {
                                warn!("dropping page for chunk {} after encode error: {err}", page.chunk_index);
                            }
                        }
                    }
                }
            }
            inner.mru.remove(pos);
            if let Some(page) = inner.pages.remove(&handle) {
                inner.by_chunk_index.remove(&page.chunk_index);
            }
        }
    }

    /// spec §4.8 `commit`: finishes in-flight reads, copies all pending
    /// margins between resident pages, then writes back everything dirty.
    pub fn commit(&self) -> VdsResult<()> {
        let dirty_handles: Vec<PageHandle> = {
            let mut inner = self.inner.lock().unwrap();
            inner.commit_in_progress = true;

            while inner.pages.values().any(|p| p.flags.contains(PageFlags::REQUEST_PREPARED)) {
                inner = self.page_read_cv.wait(inner).unwrap();
            }

            let handles: Vec<PageHandle> = inner.mru.clone();
            for &source in &handles {
                for &target in &handles {
                    if source != target && self.is_copy_margin_needed_locked(&inner, source, target) {
                        self.copy_margin_locked(&mut inner, source, target)?;
                    }
                }
            }

            inner
                .mru
                .iter()
                .rev()
                .copied()
                .filter(|h| inner.pages.get(h).map(|p| p.is_dirty()).unwrap_or(false))
                .collect()
        };

        let mut wrote_any = false;
        for handle in dirty_handles {
            let (chunk_index, block) = {
                let inner = self.inner.lock().unwrap();
                match inner.pages.get(&handle) {
                    Some(page) => (page.chunk_index, page.data_block.clone()),
                    None => continue,
                }
            };
            let Some(block) = block else { continue };
            let chunk = Chunk {
                layer: self.layer_handle,
                chunk_index,
            };
            let layer = self.layer();
            let (bytes, entry) = ChunkCodec::encode(chunk, &block, layer.compression_method)?;
            self.chunk_store.write_chunk(chunk, &bytes, entry)?;
            wrote_any = true;
            let mut inner = self.inner.lock().unwrap();
            if let Some(page) = inner.pages.get_mut(&handle) {
                page.flags.remove(PageFlags::DIRTY);
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.commit_in_progress = false;
        }
        self.commit_finished_cv.notify_all();

        if self.writable && wrote_any {
            self.chunk_store.flush(true)?;
        }
        Ok(())
    }
}

fn touch_mru(mru: &mut Vec<PageHandle>, handle: PageHandle) {
    if let Some(pos) = mru.iter().position(|&h| h == handle) {
        mru.remove(pos);
    }
    mru.insert(0, handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::StoreMode;
    use crate::codec::CompressionMethod;
    use crate::data_block::Format;
    use crate::layout::{Axis, Channel, ChannelFlags, ChannelMapping, LayoutDescriptor};
    use crate::layout_codec::LayerStatus;
    use crate::object_store::{ByteRange, GetResult, ObjectHeaders, ObjectStore};
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
        fn encode_layer_status(&self, _statuses: &[LayerStatus]) -> VdsResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn decode_layer_status(&self, _bytes: &[u8]) -> VdsResult<Vec<LayerStatus>> {
            Ok(Vec::new())
        }
    }

    fn small_layout() -> Arc<Layout> {
        let descriptor = LayoutDescriptor {
            brick_size: 8,
            margin_neg: 2,
            margin_pos: 2,
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
    fn create_page_then_read_back_is_no_value_filled() {
        let layout = small_layout();
        let handle = layout.layer_by_key("Dimensions_012LOD0").unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let codec: Arc<dyn LayoutCodec> = Arc::new(NoopLayoutCodec);
        let chunk_store = Arc::new(ChunkStore::new(layout.clone(), store, codec, StoreMode::Create));
        let cache = PageCache::new(layout, handle, chunk_store, true, None);

        let page = cache.create_page(0).unwrap();
        let (buffer, _pitch) = cache.get_buffer(page).unwrap();
        assert!(!buffer.is_empty());
        cache.release(page);
    }

    #[test]
    fn commit_clears_dirty_flag() {
        let layout = small_layout();
        let handle = layout.layer_by_key("Dimensions_012LOD0").unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let codec: Arc<dyn LayoutCodec> = Arc::new(NoopLayoutCodec);
        let chunk_store = Arc::new(ChunkStore::new(layout.clone(), store, codec, StoreMode::Create));
        let cache = PageCache::new(layout, handle, chunk_store, true, None);

        let page = cache.create_page(0).unwrap();
        cache.write_region(page, [0, 0, 0, 0], [1, 1, 1, 1], 0, &[7.0]).unwrap();
        cache.commit().unwrap();
        {
            let inner = cache.inner.lock().unwrap();
            assert!(!inner.pages.get(&page).unwrap().is_dirty());
        }
        cache.release(page);
    }
}
