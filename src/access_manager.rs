// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! C10: `AccessManager` — the public façade tying the layout, the
//! `ObjectStore`, the `ChunkStore` and the `RequestProcessor` together. See
//! spec §4.10.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vds_api::{decode_layout, encode_layout, JsonLayoutCodec};
use vds_core::{
    block_copy, byte_size, Axis, Channel, ChunkProcessor, ChunkStore, DataBlock, Format, Layer,
    LayerHandle, Layout, LayoutCodec, LayoutDescriptor, MAX_DIMS, ObjectStore, PageAccessorKey,
    PageCache, RequestProcessor, StoreMode,
};
use vds_utils::{ErrorFifo, VdsError, VdsResult};

/// spec §4.10 `requestProjectedVolumeSubset` interpolation methods. `Cubic`
/// and `Triangular` fall back to `Linear`, `Angular` falls back to `Nearest`;
/// see DESIGN.md for why the higher-order kernels were not implemented.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterpolationMethod {
    Nearest,
    Linear,
    Cubic,
    Angular,
    Triangular,
}

fn size_of(min: [u32; MAX_DIMS], max: [u32; MAX_DIMS]) -> [u32; MAX_DIMS] {
    let mut out = [1u32; MAX_DIMS];
    for d in 0..MAX_DIMS {
        out[d] = max[d].saturating_sub(min[d]).max(1);
    }
    out
}

fn offset_of(point: [u32; MAX_DIMS], origin: [u32; MAX_DIMS]) -> [u32; MAX_DIMS] {
    let mut out = [0u32; MAX_DIMS];
    for d in 0..MAX_DIMS {
        out[d] = point[d] - origin[d];
    }
    out
}

fn widen(values: &[u32]) -> [u32; MAX_DIMS] {
    let mut out = [0u32; MAX_DIMS];
    for (d, &v) in values.iter().enumerate() {
        out[d] = v;
    }
    out
}

/// Per-format ceiling used by [`quantize`] (spec §4.10 `ChunkCodec.quantizingConverter`).
fn integer_format_max(format: Format) -> Option<f64> {
    match format {
        Format::U8 => Some(u8::MAX as f64),
        Format::U16 => Some(u16::MAX as f64),
        Format::U32 => Some(u32::MAX as f64),
        Format::U64 => Some(u64::MAX as f64),
        Format::Bit1 | Format::F32 | Format::F64 => None,
    }
}

/// `clamp(round((x - value_min) * format_max / (value_max - value_min)), 0, format_max)`
/// (spec §8 scenario S2): normalizes a float sample into an integer format's
/// full range using the channel's `(value_min, value_max)`.
fn quantize(value: f64, value_min: f64, value_max: f64, format_max: f64) -> f64 {
    if value_max <= value_min {
        return 0.0;
    }
    ((value - value_min) * format_max / (value_max - value_min))
        .round()
        .clamp(0.0, format_max)
}

/// Copies the overlap of `(src_origin, sizes)` in `src` into `dst` at
/// `dst_origin`, reading/writing through `f64` so source and destination may
/// differ in `Format`. When `src` is float and `dst` is an integer format,
/// values are quantized via [`quantize`] using `(value_min, value_max)`
/// rather than simply truncated. Integer `integer_scale`/`integer_offset`
/// rescaling between two integer formats is not applied; see DESIGN.md.
#[allow(clippy::too_many_arguments)]
fn copy_convert(
    dst: &mut DataBlock,
    dst_origin: [u32; MAX_DIMS],
    src: &DataBlock,
    src_origin: [u32; MAX_DIMS],
    sizes: [u32; MAX_DIMS],
    no_value: Option<f64>,
    replacement_no_value: Option<f64>,
    value_range: (f64, f64),
) {
    if dst.format() == src.format() && dst.components() == src.components() && replacement_no_value.is_none() {
        block_copy(dst, dst_origin, src, src_origin, sizes);
        return;
    }
    let quantize_to = if src.format().is_float() {
        integer_format_max(dst.format())
    } else {
        None
    };
    let components = src.components().min(dst.components());
    for w in 0..sizes[3].max(1) {
        for z in 0..sizes[2].max(1) {
            for y in 0..sizes[1].max(1) {
                for x in 0..sizes[0].max(1) {
                    let s = [src_origin[0] + x, src_origin[1] + y, src_origin[2] + z, src_origin[3] + w];
                    let d = [dst_origin[0] + x, dst_origin[1] + y, dst_origin[2] + z, dst_origin[3] + w];
                    for c in 0..components {
                        let mut v = src.read_element_as_f64(s, c);
                        if let (Some(nv), Some(replacement)) = (no_value, replacement_no_value) {
                            if v == nv {
                                v = replacement;
                            }
                        }
                        if let Some(format_max) = quantize_to {
                            v = quantize(v, value_range.0, value_range.1, format_max);
                        }
                        dst.write_element_from_f64(d, c, v);
                    }
                }
            }
        }
    }
}

/// `requestVolumeSubset` (and `requestVolumeSamples`/`requestVolumeTraces`,
/// whose chunks all land in the same output buffer): copies the overlap of
/// every chunk's margin-expanded voxel range with the requested region.
struct SubsetCopyProcessor {
    chunk_min_max: Arc<dyn Fn(u64) -> (Vec<u32>, Vec<u32>) + Send + Sync>,
    request_min: [u32; MAX_DIMS],
    output: Arc<Mutex<DataBlock>>,
    src_format: Format,
    src_components: u32,
    no_value: Option<f64>,
    replacement_no_value: Option<f64>,
    value_range: (f64, f64),
}

impl ChunkProcessor for SubsetCopyProcessor {
    fn process(&self, page_buffer: &[u8], _pitch: [u32; MAX_DIMS], chunk_index: u64) -> VdsResult<()> {
        let (chunk_min, chunk_max) = (self.chunk_min_max)(chunk_index);
        let chunk_min4 = widen(&chunk_min);
        let chunk_max4 = {
            let mut m = [1u32; MAX_DIMS];
            for (d, &v) in chunk_max.iter().enumerate() {
                m[d] = v;
            }
            m
        };
        let src_size = size_of(chunk_min4, chunk_max4);
        let mut src = DataBlock::new(self.src_format, self.src_components, src_size);
        let expected = src.buffer().len();
        if page_buffer.len() != expected {
            return Err(VdsError::chunk_corruption(format!(
                "decoded page size {} does not match expected {expected}",
                page_buffer.len()
            )));
        }
        src.buffer_mut().copy_from_slice(page_buffer);

        let request_max = {
            let out = self.output.lock().unwrap();
            let size = out.size();
            let mut m = [0u32; MAX_DIMS];
            for d in 0..MAX_DIMS {
                m[d] = self.request_min[d] + size[d];
            }
            m
        };

        let mut overlap_min = [0u32; MAX_DIMS];
        let mut overlap_max = [0u32; MAX_DIMS];
        for d in 0..MAX_DIMS {
            overlap_min[d] = chunk_min4[d].max(self.request_min[d]);
            overlap_max[d] = chunk_max4[d].min(request_max[d]);
            if overlap_max[d] <= overlap_min[d] {
                return Ok(());
            }
        }

        let src_origin = offset_of(overlap_min, chunk_min4);
        let dst_origin = offset_of(overlap_min, self.request_min);
        let sizes = size_of(overlap_min, overlap_max);

        let mut out = self.output.lock().unwrap();
        copy_convert(
            &mut out,
            dst_origin,
            &src,
            src_origin,
            sizes,
            self.no_value,
            self.replacement_no_value,
            self.value_range,
        );
        Ok(())
    }
}

struct IdentityProcessor;
impl ChunkProcessor for IdentityProcessor {
    fn process(&self, _page_buffer: &[u8], _pitch: [u32; MAX_DIMS], _chunk_index: u64) -> VdsResult<()> {
        Ok(())
    }
}

/// A live request handle returned by every `AccessManager::request*` call
/// (spec §4.9 `addJob`'s exposed surface).
pub struct VolumeRequest {
    processor: Arc<RequestProcessor>,
    job_id: u64,
    output: Arc<Mutex<DataBlock>>,
}

impl VolumeRequest {
    pub fn is_completed(&self) -> bool {
        self.processor.is_completed(self.job_id)
    }

    pub fn is_canceled(&self) -> bool {
        self.processor.is_canceled(self.job_id)
    }

    pub fn completion_factor(&self) -> f64 {
        self.processor.completion_factor(self.job_id)
    }

    /// spec §4.10 `getCurrentDownloadError` (scenario S4): the first error
    /// raised by any chunk task in this request, if any.
    pub fn first_error(&self) -> Option<VdsError> {
        self.processor.first_error(self.job_id)
    }

    pub fn cancel(&self) {
        self.processor.cancel(self.job_id)
    }

    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        self.processor.wait_for_completion(self.job_id, timeout)
    }

    pub fn cancel_and_wait_for_completion(&self) {
        self.processor.cancel_and_wait_for_completion(self.job_id)
    }

    /// The destination buffer, valid to read once `is_completed()`.
    pub fn buffer(&self) -> Vec<u8> {
        self.output.lock().unwrap().buffer().to_vec()
    }
}

/// Public façade over one open or newly-created volume (spec §4.10).
pub struct AccessManager {
    layout: Arc<Layout>,
    store: Arc<dyn ObjectStore>,
    chunk_store: Arc<ChunkStore>,
    processor: Arc<RequestProcessor>,
    page_caches: Mutex<HashMap<LayerHandle, Arc<PageCache>>>,
    upload_errors: ErrorFifo,
    last_download_error: Mutex<Option<VdsError>>,
}

impl AccessManager {
    /// Default idle-accessor cleanup period (spec §9 design note; see
    /// SPEC_FULL.md's Configuration section).
    const DEFAULT_IDLE_CLEANUP_PERIOD: Duration = Duration::from_secs(30);

    /// Opens a previously-created volume: fetches and decodes the
    /// `VolumeDataLayout` object, then wires up the chunk store in
    /// `StoreMode::Open`.
    pub fn open(store: Arc<dyn ObjectStore>) -> VdsResult<AccessManager> {
        Self::open_with_idle_cleanup_period(store, Self::DEFAULT_IDLE_CLEANUP_PERIOD)
    }

    /// Same as [`Self::open`] with an explicit idle-accessor cleanup period,
    /// for callers (and tests, spec §8 scenario S6) that need a tighter
    /// cleanup window than the default.
    pub fn open_with_idle_cleanup_period(store: Arc<dyn ObjectStore>, idle_cleanup_period: Duration) -> VdsResult<AccessManager> {
        let bytes = store.get("VolumeDataLayout", None)?.data;
        let layout = Arc::new(decode_layout(&bytes)?);
        Self::from_layout(layout, store, StoreMode::Open, idle_cleanup_period)
    }

    /// Builds a new layout, writes its `VolumeDataLayout` object eagerly (so
    /// a concurrent `open` of the same store sees it immediately), and wires
    /// up the chunk store in `StoreMode::Create`.
    pub fn create(
        store: Arc<dyn ObjectStore>,
        descriptor: LayoutDescriptor,
        axes: Vec<Axis>,
        channels: Vec<Channel>,
    ) -> VdsResult<AccessManager> {
        Self::create_with_idle_cleanup_period(store, descriptor, axes, channels, Self::DEFAULT_IDLE_CLEANUP_PERIOD)
    }

    /// Same as [`Self::create`] with an explicit idle-accessor cleanup
    /// period (spec §8 scenario S6).
    pub fn create_with_idle_cleanup_period(
        store: Arc<dyn ObjectStore>,
        descriptor: LayoutDescriptor,
        axes: Vec<Axis>,
        channels: Vec<Channel>,
        idle_cleanup_period: Duration,
    ) -> VdsResult<AccessManager> {
        let layout = Arc::new(Layout::build(descriptor, axes, channels)?);
        let bytes = encode_layout(&layout)?;
        store.put("VolumeDataLayout", &bytes, Vec::new())?;
        Self::from_layout(layout, store, StoreMode::Create, idle_cleanup_period)
    }

    fn from_layout(
        layout: Arc<Layout>,
        store: Arc<dyn ObjectStore>,
        mode: StoreMode,
        idle_cleanup_period: Duration,
    ) -> VdsResult<AccessManager> {
        let codec: Arc<dyn LayoutCodec> = Arc::new(JsonLayoutCodec);
        let chunk_store = Arc::new(ChunkStore::new(layout.clone(), store.clone(), codec, mode));
        let worker_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let processor = RequestProcessor::new(worker_count, idle_cleanup_period);
        Ok(AccessManager {
            layout,
            store,
            chunk_store,
            processor,
            page_caches: Mutex::new(HashMap::new()),
            upload_errors: ErrorFifo::new(),
            last_download_error: Mutex::new(None),
        })
    }

    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    fn layer_handle(&self, layer_key: &str) -> VdsResult<LayerHandle> {
        self.layout
            .layer_by_key(layer_key)
            .ok_or_else(|| VdsError::invalid_argument(format!("no such layer '{layer_key}'")))
    }

    fn layer(&self, handle: LayerHandle) -> &Layer {
        self.layout.layer(handle)
    }

    fn accessor_key(&self, handle: LayerHandle) -> PageAccessorKey {
        let layer = self.layer(handle);
        PageAccessorKey {
            dimension_group: layer.dimension_group.name(),
            lod: layer.lod,
            channel: layer.channel,
        }
    }

    fn page_cache(&self, handle: LayerHandle, writable: bool) -> Arc<PageCache> {
        let mut caches = self.page_caches.lock().unwrap();
        if let Some(existing) = caches.get(&handle) {
            return existing.clone();
        }
        let channel = &self.layout.channels[self.layer(handle).channel];
        let cache = Arc::new(PageCache::new(
            self.layout.clone(),
            handle,
            self.chunk_store.clone(),
            writable,
            channel.no_value,
        ));
        self.processor.register_accessor(self.accessor_key(handle), cache.clone());
        caches.insert(handle, cache.clone());
        cache
    }

    /// `getVolumeSubsetBufferSize` (spec §4.10): `byteSize(max-min, format,
    /// components)`.
    pub fn get_volume_subset_buffer_size(&self, layer_key: &str, min: &[u32], max: &[u32], format: Format) -> VdsResult<u64> {
        let handle = self.layer_handle(layer_key)?;
        let channel = &self.layout.channels[self.layer(handle).channel];
        if min.len() != max.len() {
            return Err(VdsError::invalid_argument("min/max length mismatch"));
        }
        let sizes: Vec<u32> = min.iter().zip(max).map(|(&a, &b)| b.saturating_sub(a)).collect();
        Ok(byte_size(&sizes, format, channel.components))
    }

    /// spec §4.10 `requestVolumeSubset`.
    pub fn request_volume_subset(
        &self,
        layer_key: &str,
        min: &[u32],
        max: &[u32],
        format: Format,
        replacement_no_value: Option<f64>,
    ) -> VdsResult<VolumeRequest> {
        let handle = self.layer_handle(layer_key)?;
        let layer_dims = self.layer(handle).dimension_group.dimensionality();
        if min.len() != max.len() || min.len() != layer_dims {
            return Err(VdsError::invalid_argument(
                "min/max dimensionality must match the layer's dimension group",
            ));
        }
        for d in 0..min.len() {
            if min[d] >= max[d] {
                return Err(VdsError::invalid_argument("min must be strictly less than max on every axis"));
            }
        }

        let channel = self.layout.channels[self.layer(handle).channel].clone();
        let cache = self.page_cache(handle, false);
        let chunks = cache.indexer().chunks_in_region(min, max)?;

        let min4 = widen(min);
        let max4 = {
            let mut m = [1u32; MAX_DIMS];
            for (d, &v) in max.iter().enumerate() {
                m[d] = v;
            }
            m
        };
        let output = Arc::new(Mutex::new(DataBlock::new(format, channel.components, size_of(min4, max4))));

        let indexer = cache.indexer().clone();
        let processor_job: Arc<dyn ChunkProcessor> = Arc::new(SubsetCopyProcessor {
            chunk_min_max: Arc::new(move |chunk_index| indexer.chunk_min_max(chunk_index, true)),
            request_min: min4,
            output: output.clone(),
            src_format: channel.format,
            src_components: channel.components,
            no_value: channel.no_value,
            replacement_no_value,
            value_range: (channel.value_min, channel.value_max),
        });

        let job_id = self.processor.add_job(self.accessor_key(handle), chunks, processor_job, false)?;
        Ok(VolumeRequest {
            processor: self.processor.clone(),
            job_id,
            output,
        })
    }

    /// spec §4.10 `requestVolumeSamples`: nearest-neighbor gather at
    /// arbitrary integer-rounded voxel positions (sub-voxel interpolation is
    /// not implemented; see DESIGN.md).
    pub fn request_volume_samples(
        &self,
        layer_key: &str,
        positions: &[Vec<f64>],
        format: Format,
        replacement_no_value: Option<f64>,
    ) -> VdsResult<VolumeRequest> {
        let handle = self.layer_handle(layer_key)?;
        let channel = self.layout.channels[self.layer(handle).channel].clone();
        let cache = self.page_cache(handle, false);
        let indexer = cache.indexer().clone();

        let mut chunks = Vec::with_capacity(positions.len());
        let mut voxel_positions = Vec::with_capacity(positions.len());
        for position in positions {
            let rounded: Vec<u32> = position.iter().map(|&v| v.round().max(0.0) as u32).collect();
            chunks.push(indexer.chunk_containing(&rounded)?);
            voxel_positions.push(rounded);
        }
        chunks.sort_unstable();
        chunks.dedup();

        let output = Arc::new(Mutex::new(DataBlock::new(
            format,
            channel.components,
            [positions.len() as u32, 1, 1, 1],
        )));

        let indexer_for_gather = indexer.clone();
        let output_for_gather = output.clone();
        let no_value = channel.no_value;
        let src_format = channel.format;
        let src_components = channel.components;
        let gather = GatherProcessor {
            indexer: indexer_for_gather,
            voxel_positions,
            output: output_for_gather,
            src_format,
            src_components,
            no_value,
            replacement_no_value,
        };

        let job_id = self
            .processor
            .add_job(self.accessor_key(handle), chunks, Arc::new(gather), true)?;
        Ok(VolumeRequest {
            processor: self.processor.clone(),
            job_id,
            output,
        })
    }

    /// spec §4.10 `requestVolumeTraces`: one sample-count-long trace per
    /// position along `trace_dimension`, single-threaded like the original
    /// (chunks land in a shared buffer).
    pub fn request_volume_traces(
        &self,
        layer_key: &str,
        positions: &[Vec<f64>],
        trace_dimension: usize,
        trace_length: u32,
        format: Format,
        replacement_no_value: Option<f64>,
    ) -> VdsResult<VolumeRequest> {
        let handle = self.layer_handle(layer_key)?;
        let channel = self.layout.channels[self.layer(handle).channel].clone();
        let cache = self.page_cache(handle, false);
        let indexer = cache.indexer().clone();
        let dims = indexer.chunk_dimensionality();
        if trace_dimension >= dims {
            return Err(VdsError::invalid_argument("trace_dimension out of range"));
        }

        let mut chunk_set = std::collections::HashSet::new();
        let mut trace_origins = Vec::with_capacity(positions.len());
        for position in positions {
            let mut rounded: Vec<u32> = position.iter().map(|&v| v.round().max(0.0) as u32).collect();
            rounded[trace_dimension] = 0;
            for t in 0..trace_length {
                let mut point = rounded.clone();
                point[trace_dimension] = t;
                chunk_set.insert(indexer.chunk_containing(&point)?);
            }
            trace_origins.push(rounded);
        }
        let mut chunks: Vec<u64> = chunk_set.into_iter().collect();
        chunks.sort_unstable();

        let output = Arc::new(Mutex::new(DataBlock::new(
            format,
            channel.components,
            [trace_length, positions.len() as u32, 1, 1],
        )));

        let gather = TraceGatherProcessor {
            indexer: indexer.clone(),
            trace_origins,
            trace_dimension,
            trace_length,
            output: output.clone(),
            src_format: channel.format,
            src_components: channel.components,
            no_value: channel.no_value,
            replacement_no_value,
        };

        let job_id = self
            .processor
            .add_job(self.accessor_key(handle), chunks, Arc::new(gather), true)?;
        Ok(VolumeRequest {
            processor: self.processor.clone(),
            job_id,
            output,
        })
    }

    /// spec §4.10 `requestProjectedVolumeSubset`: projects the 3-D region
    /// onto a 2-D plane `(a,b,c,d)` and samples the source at the plane
    /// intersection for every output pixel.
    pub fn request_projected_volume_subset(
        &self,
        layer_key: &str,
        min: &[u32],
        max: &[u32],
        plane: (f64, f64, f64, f64),
        format: Format,
        interpolation: InterpolationMethod,
        replacement_no_value: Option<f64>,
    ) -> VdsResult<VolumeRequest> {
        let handle = self.layer_handle(layer_key)?;
        let channel = self.layout.channels[self.layer(handle).channel].clone();
        let cache = self.page_cache(handle, false);
        let indexer = cache.indexer().clone();
        if indexer.chunk_dimensionality() != 3 || min.len() != 3 || max.len() != 3 {
            return Err(VdsError::invalid_argument("projected subset requires a 3-D layer"));
        }

        // Project onto the two axes with the largest plane-normal
        // components dropped, i.e. sample along the axis most aligned with
        // the normal for every (row, col) of the other two.
        let (a, b, c, d) = plane;
        let normal = [a.abs(), b.abs(), c.abs()];
        let solve_axis = (0..3).max_by(|&x, &y| normal[x].partial_cmp(&normal[y]).unwrap()).unwrap();
        let axes: Vec<usize> = (0..3).filter(|&d| d != solve_axis).collect();

        let rows = max[axes[1]] - min[axes[1]];
        let cols = max[axes[0]] - min[axes[0]];
        let output = Arc::new(Mutex::new(DataBlock::new(format, channel.components, [cols, rows, 1, 1])));

        let mut positions = Vec::with_capacity((rows * cols) as usize);
        for row in 0..rows {
            for col in 0..cols {
                let mut point = [0f64; 3];
                point[axes[0]] = (min[axes[0]] + col) as f64;
                point[axes[1]] = (min[axes[1]] + row) as f64;
                let coeff = [a, b, c][solve_axis];
                point[solve_axis] = if coeff.abs() > f64::EPSILON {
                    -(d + [a, b, c][axes[0]] * point[axes[0]] + [a, b, c][axes[1]] * point[axes[1]]) / coeff
                } else {
                    min[solve_axis] as f64
                };
                positions.push((row, col, point));
            }
        }

        let mut chunks: Vec<u64> = positions
            .iter()
            .filter_map(|(_, _, p)| {
                let rounded: Vec<u32> = p.iter().map(|&v| v.round().clamp(0.0, u32::MAX as f64) as u32).collect();
                indexer.chunk_containing(&rounded).ok()
            })
            .collect();
        chunks.sort_unstable();
        chunks.dedup();

        let gather = ProjectedGatherProcessor {
            indexer: indexer.clone(),
            positions,
            interpolation,
            output: output.clone(),
            src_format: channel.format,
            src_components: channel.components,
            no_value: channel.no_value,
            replacement_no_value,
        };

        let job_id = self
            .processor
            .add_job(self.accessor_key(handle), chunks, Arc::new(gather), true)?;
        Ok(VolumeRequest {
            processor: self.processor.clone(),
            job_id,
            output,
        })
    }

    /// spec §4.10 `prefetchVolumeChunk`: `addJob` with an identity processor.
    pub fn prefetch_volume_chunk(&self, layer_key: &str, chunk_index: u64) -> VdsResult<VolumeRequest> {
        let handle = self.layer_handle(layer_key)?;
        let cache = self.page_cache(handle, false);
        let output = Arc::new(Mutex::new(DataBlock::new(Format::U8, 1, [1, 1, 1, 1])));
        let job_id = self
            .processor
            .add_job(self.accessor_key(handle), vec![chunk_index], Arc::new(IdentityProcessor), false)?;
        let _ = &cache;
        Ok(VolumeRequest {
            processor: self.processor.clone(),
            job_id,
            output,
        })
    }

    /// spec §4.9 `countActivePages` (used by scenario S6): total pages held
    /// by any accessor registered against this volume so far.
    pub fn count_active_pages(&self) -> usize {
        self.processor.count_active_pages()
    }

    /// Commits every writable page cache opened so far and flushes the
    /// chunk store's metadata pages plus `LayerStatus` (spec §4.7 `flush`).
    pub fn flush(&self) -> VdsResult<()> {
        let caches: Vec<Arc<PageCache>> = self.page_caches.lock().unwrap().values().cloned().collect();
        for cache in caches {
            if let Err(err) = cache.commit() {
                self.last_download_error.lock().unwrap().replace(err.clone());
                self.upload_errors.push(err);
            }
        }
        self.chunk_store.flush(true)
    }

    pub fn open_write_accessor(&self, layer_key: &str) -> VdsResult<Arc<PageCache>> {
        let handle = self.layer_handle(layer_key)?;
        Ok(self.page_cache(handle, true))
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// spec §4.10 upload-error FIFO (`uploadErrorCount / getCurrentUploadError / clearUploadErrors`).
    pub fn upload_error_count(&self) -> usize {
        self.upload_errors.count()
    }

    pub fn current_upload_error(&self) -> Option<String> {
        self.upload_errors.current()
    }

    pub fn clear_upload_errors(&self) -> Option<VdsError> {
        self.upload_errors.clear()
    }

    pub fn force_clear_upload_errors(&self) {
        self.upload_errors.force_clear_all()
    }

    /// Most recent download-side error observed through `flush`/background
    /// reads, surfaced alongside the upload FIFO (spec §4.10). Checks every
    /// chunk-fetch job run by this manager's `RequestProcessor` (e.g. a
    /// corrupt metadata header hit by `requestVolumeSubset`, spec §8 scenario
    /// S4) before falling back to the last commit-time error from `flush`.
    pub fn current_download_error(&self) -> Option<VdsError> {
        self.processor
            .last_error()
            .or_else(|| self.last_download_error.lock().unwrap().clone())
    }
}

struct GatherProcessor {
    indexer: vds_core::ChunkIndexer,
    voxel_positions: Vec<Vec<u32>>,
    output: Arc<Mutex<DataBlock>>,
    src_format: Format,
    src_components: u32,
    no_value: Option<f64>,
    replacement_no_value: Option<f64>,
}

impl ChunkProcessor for GatherProcessor {
    fn process(&self, page_buffer: &[u8], _pitch: [u32; MAX_DIMS], chunk_index: u64) -> VdsResult<()> {
        let (chunk_min, chunk_max) = self.indexer.chunk_min_max(chunk_index, true);
        let size = size_of(widen(&chunk_min), {
            let mut m = [1u32; MAX_DIMS];
            for (d, &v) in chunk_max.iter().enumerate() {
                m[d] = v;
            }
            m
        });
        let mut src = DataBlock::new(self.src_format, self.src_components, size);
        if page_buffer.len() != src.buffer().len() {
            return Err(VdsError::chunk_corruption("decoded sample chunk size mismatch"));
        }
        src.buffer_mut().copy_from_slice(page_buffer);

        let mut out = self.output.lock().unwrap();
        for (i, position) in self.voxel_positions.iter().enumerate() {
            let local: Vec<i64> = position
                .iter()
                .zip(chunk_min.iter())
                .map(|(&p, &m)| p as i64 - m as i64)
                .collect();
            if local.iter().zip(size.iter()).all(|(&l, &s)| l >= 0 && (l as u32) < s) {
                let idx = widen(&local.iter().map(|&v| v as u32).collect::<Vec<_>>());
                for c in 0..self.src_components.min(out.components()) {
                    let mut v = src.read_element_as_f64(idx, c);
                    if let (Some(nv), Some(replacement)) = (self.no_value, self.replacement_no_value) {
                        if v == nv {
                            v = replacement;
                        }
                    }
                    out.write_element_from_f64([i as u32, 0, 0, 0], c, v);
                }
            }
        }
        Ok(())
    }
}

struct TraceGatherProcessor {
    indexer: vds_core::ChunkIndexer,
    trace_origins: Vec<Vec<u32>>,
    trace_dimension: usize,
    trace_length: u32,
    output: Arc<Mutex<DataBlock>>,
    src_format: Format,
    src_components: u32,
    no_value: Option<f64>,
    replacement_no_value: Option<f64>,
}

impl ChunkProcessor for TraceGatherProcessor {
    fn process(&self, page_buffer: &[u8], _pitch: [u32; MAX_DIMS], chunk_index: u64) -> VdsResult<()> {
        let (chunk_min, chunk_max) = self.indexer.chunk_min_max(chunk_index, true);
        let size = size_of(widen(&chunk_min), {
            let mut m = [1u32; MAX_DIMS];
            for (d, &v) in chunk_max.iter().enumerate() {
                m[d] = v;
            }
            m
        });
        let mut src = DataBlock::new(self.src_format, self.src_components, size);
        if page_buffer.len() != src.buffer().len() {
            return Err(VdsError::chunk_corruption("decoded trace chunk size mismatch"));
        }
        src.buffer_mut().copy_from_slice(page_buffer);

        let mut out = self.output.lock().unwrap();
        for (trace_idx, origin) in self.trace_origins.iter().enumerate() {
            for t in 0..self.trace_length {
                let mut point = origin.clone();
                point[self.trace_dimension] = t;
                let local: Vec<i64> = point
                    .iter()
                    .zip(chunk_min.iter())
                    .map(|(&p, &m)| p as i64 - m as i64)
                    .collect();
                if local.iter().zip(size.iter()).all(|(&l, &s)| l >= 0 && (l as u32) < s) {
                    let idx = widen(&local.iter().map(|&v| v as u32).collect::<Vec<_>>());
                    for c in 0..self.src_components.min(out.components()) {
                        let mut v = src.read_element_as_f64(idx, c);
                        if let (Some(nv), Some(replacement)) = (self.no_value, self.replacement_no_value) {
                            if v == nv {
                                v = replacement;
                            }
                        }
                        out.write_element_from_f64([t, trace_idx as u32, 0, 0], c, v);
                    }
                }
            }
        }
        Ok(())
    }
}

struct ProjectedGatherProcessor {
    indexer: vds_core::ChunkIndexer,
    positions: Vec<(u32, u32, [f64; 3])>,
    interpolation: InterpolationMethod,
    output: Arc<Mutex<DataBlock>>,
    src_format: Format,
    src_components: u32,
    no_value: Option<f64>,
    replacement_no_value: Option<f64>,
}

impl ChunkProcessor for ProjectedGatherProcessor {
    fn process(&self, page_buffer: &[u8], _pitch: [u32; MAX_DIMS], chunk_index: u64) -> VdsResult<()> {
        let (chunk_min, chunk_max) = self.indexer.chunk_min_max(chunk_index, true);
        let size = size_of(widen(&chunk_min), {
            let mut m = [1u32; MAX_DIMS];
            for (d, &v) in chunk_max.iter().enumerate() {
                m[d] = v;
            }
            m
        });
        let mut src = DataBlock::new(self.src_format, self.src_components, size);
        if page_buffer.len() != src.buffer().len() {
            return Err(VdsError::chunk_corruption("decoded projected-subset chunk size mismatch"));
        }
        src.buffer_mut().copy_from_slice(page_buffer);

        let mut out = self.output.lock().unwrap();
        for &(row, col, point) in &self.positions {
            let sample = match self.interpolation {
                InterpolationMethod::Nearest | InterpolationMethod::Angular => {
                    sample_nearest(&src, &chunk_min, &size, point)
                }
                InterpolationMethod::Linear | InterpolationMethod::Cubic | InterpolationMethod::Triangular => {
                    sample_trilinear(&src, &chunk_min, &size, point)
                }
            };
            if let Some(mut value) = sample {
                if let (Some(nv), Some(replacement)) = (self.no_value, self.replacement_no_value) {
                    if value == nv {
                        value = replacement;
                    }
                }
                for c in 0..self.src_components.min(out.components()) {
                    out.write_element_from_f64([col, row, 0, 0], c, value);
                }
            }
        }
        Ok(())
    }
}

fn sample_nearest(src: &DataBlock, chunk_min: &[u32], size: &[u32], point: [f64; 3]) -> Option<f64> {
    let mut local = [0u32; MAX_DIMS];
    for d in 0..3 {
        let rel = point[d].round() - chunk_min[d] as f64;
        if rel < 0.0 || rel as u32 >= size[d] {
            return None;
        }
        local[d] = rel as u32;
    }
    Some(src.read_element_as_f64(local, 0))
}

fn sample_trilinear(src: &DataBlock, chunk_min: &[u32], size: &[u32], point: [f64; 3]) -> Option<f64> {
    let mut rel = [0f64; 3];
    for d in 0..3 {
        rel[d] = point[d] - chunk_min[d] as f64;
        if rel[d] < 0.0 || rel[d] > (size[d].saturating_sub(1)) as f64 {
            return None;
        }
    }
    let lo = [rel[0].floor() as u32, rel[1].floor() as u32, rel[2].floor() as u32];
    let frac = [rel[0].fract(), rel[1].fract(), rel[2].fract()];
    let mut acc = 0.0;
    for dz in 0..2u32 {
        for dy in 0..2u32 {
            for dx in 0..2u32 {
                let x = (lo[0] + dx).min(size[0].saturating_sub(1));
                let y = (lo[1] + dy).min(size[1].saturating_sub(1));
                let z = (lo[2] + dz).min(size[2].saturating_sub(1));
                let weight = (if dx == 1 { frac[0] } else { 1.0 - frac[0] })
                    * (if dy == 1 { frac[1] } else { 1.0 - frac[1] })
                    * (if dz == 1 { frac[2] } else { 1.0 - frac[2] });
                acc += weight * src.read_element_as_f64([x, y, z, 0], 0);
            }
        }
    }
    Some(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use vds_core::{ChannelFlags, ChannelMapping, CompressionMethod};

    fn axes(n: u32) -> Vec<Axis> {
        (0..3)
            .map(|i| Axis {
                name: format!("axis{i}"),
                unit: "m".into(),
                sample_count: n,
                coordinate_min: 0.0,
                coordinate_max: (n - 1) as f64,
            })
            .collect()
    }

    fn one_channel() -> Vec<Channel> {
        vec![Channel {
            name: "Amplitude".into(),
            unit: "".into(),
            format: Format::F32,
            components: 1,
            value_min: -1.0,
            value_max: 1.0,
            no_value: Some(-9999.0),
            mapping: ChannelMapping::Direct,
            flags: ChannelFlags::ALLOW_LOSSY_COMPRESSION | ChannelFlags::RENDERABLE,
            integer_scale: 1.0,
            integer_offset: 0.0,
            requested_compression: CompressionMethod::None,
            base_tolerance: 0.01,
        }]
    }

    #[test]
    fn create_then_write_then_read_round_trips_a_subset() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let descriptor = LayoutDescriptor {
            brick_size: 16,
            ..Default::default()
        };
        let manager = AccessManager::create(store, descriptor, axes(16), one_channel()).unwrap();

        let writer = manager.open_write_accessor("Dimensions_012LOD0").unwrap();
        let page = writer.create_page(0).unwrap();
        writer
            .write_region(page, [0, 0, 0, 0], [16, 16, 16, 1], 0, &vec![5.0; 16 * 16 * 16])
            .unwrap();
        writer.release(page);
        manager.flush().unwrap();

        let request = manager
            .request_volume_subset("Dimensions_012LOD0", &[0, 0, 0], &[4, 4, 4], Format::F32, None)
            .unwrap();
        request.wait_for_completion(Some(Duration::from_secs(5)));
        assert!(request.is_completed());
        let buf = request.buffer();
        let block = {
            let mut b = DataBlock::new(Format::F32, 1, [4, 4, 4, 1]);
            b.buffer_mut().copy_from_slice(&buf);
            b
        };
        assert_eq!(block.read_element_as_f64([0, 0, 0, 0], 0), 5.0);
        assert_eq!(block.read_element_as_f64([3, 3, 3, 0], 0), 5.0);
    }

    #[test]
    fn get_volume_subset_buffer_size_matches_byte_size() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let manager = AccessManager::create(store, LayoutDescriptor::default(), axes(64), one_channel()).unwrap();
        let size = manager
            .get_volume_subset_buffer_size("Dimensions_012LOD0", &[0, 0, 0], &[4, 4, 4], Format::F32)
            .unwrap();
        assert_eq!(size, 4 * 4 * 4 * 4);
    }

    #[test]
    fn open_reads_back_the_layout_written_by_create() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let descriptor = LayoutDescriptor {
            brick_size: 16,
            ..Default::default()
        };
        let _created = AccessManager::create(store.clone(), descriptor, axes(16), one_channel()).unwrap();
        let reopened = AccessManager::open(store).unwrap();
        assert!(reopened.layout().layer_by_key("Dimensions_012LOD0").is_some());
    }
}
