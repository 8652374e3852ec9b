// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! C1 (part 2): `ChunkIndexer` — chunk-index <-> voxel-coordinate mapping for
//! one `Layer`. See spec §4.1.

use vds_utils::{VdsError, VdsResult};

use crate::layout::{ChannelMapping, Layer, LayerHandle, Layout};

/// Identifies one chunk blob: `(layer, chunkIndex)` (spec §3 Chunk).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub layer: LayerHandle,
    pub chunk_index: u64,
}

/// Derives, for one `Layer`, the geometry needed to translate between
/// `chunkIndex`, its N-D index array, and voxel ranges (spec §4.1).
#[derive(Clone, Debug)]
pub struct ChunkIndexer {
    /// Number of chunks along each chunk-dimension (length == chunk
    /// dimensionality, 2 or 3).
    chunks_per_dim: Vec<u32>,
    /// Samples per axis at this layer's LOD, in the same order as the
    /// dimension group.
    axis_samples: Vec<u32>,
    interior_brick_size: Vec<u32>,
    margin_neg: u32,
    margin_pos: u32,
}

impl ChunkIndexer {
    pub fn for_layer(layout: &Layout, handle: LayerHandle) -> ChunkIndexer {
        let layer = layout.layer(handle);
        let dims = layer.dimension_group.dimensions();
        let axis_samples: Vec<u32> = dims
            .iter()
            .map(|&d| layout.axis_sample_count_at_lod(d, layer.lod))
            .collect();
        let interior_brick_size: Vec<u32> = (0..dims.len())
            .map(|k| layer.interior_brick_size[k])
            .collect();
        let chunks_per_dim: Vec<u32> = axis_samples
            .iter()
            .zip(interior_brick_size.iter())
            .map(|(&n, &interior)| div_ceil(n, interior))
            .collect();

        ChunkIndexer {
            chunks_per_dim,
            axis_samples,
            interior_brick_size,
            margin_neg: layer.margin_neg,
            margin_pos: layer.margin_pos,
        }
    }

    pub fn chunk_dimensionality(&self) -> usize {
        self.chunks_per_dim.len()
    }

    pub fn chunks_per_dim(&self) -> &[u32] {
        &self.chunks_per_dim
    }

    pub fn interior_brick_size(&self) -> &[u32] {
        &self.interior_brick_size
    }

    pub fn axis_samples(&self) -> &[u32] {
        &self.axis_samples
    }

    /// Chunk index whose interior range contains voxel `point` (used by
    /// `requestVolumeSamples`/`requestVolumeTraces`, spec §4.10).
    pub fn chunk_containing(&self, point: &[u32]) -> VdsResult<u64> {
        if point.len() != self.chunks_per_dim.len() {
            return Err(VdsError::invalid_argument(
                "point dimensionality does not match layer's chunk dimensionality",
            ));
        }
        let mut index_array = vec![0u32; point.len()];
        for d in 0..point.len() {
            if point[d] >= self.axis_samples[d] {
                return Err(VdsError::invalid_argument("point is outside the volume"));
            }
            index_array[d] = point[d] / self.interior_brick_size[d];
        }
        Ok(self.chunk_index_from_array(&index_array))
    }

    pub fn total_chunks(&self) -> u64 {
        self.chunks_per_dim.iter().map(|&c| c as u64).product()
    }

    /// Row-major chunk index -> per-dimension index array, dimension 0
    /// fastest-varying.
    pub fn index_array(&self, chunk_index: u64) -> Vec<u32> {
        let mut remaining = chunk_index;
        let mut out = vec![0u32; self.chunks_per_dim.len()];
        for d in 0..self.chunks_per_dim.len() {
            let n = self.chunks_per_dim[d] as u64;
            out[d] = (remaining % n) as u32;
            remaining /= n;
        }
        out
    }

    pub fn chunk_index_from_array(&self, index_array: &[u32]) -> u64 {
        let mut linear: u64 = 0;
        let mut multiplier: u64 = 1;
        for d in 0..self.chunks_per_dim.len() {
            linear += index_array[d] as u64 * multiplier;
            multiplier *= self.chunks_per_dim[d] as u64;
        }
        linear
    }

    /// `[min, max)` interior (no-margin) voxel range per chunk-dimension.
    pub fn chunk_min_max_interior(&self, chunk_index: u64) -> (Vec<u32>, Vec<u32>) {
        let idx = self.index_array(chunk_index);
        let mut min = vec![0u32; idx.len()];
        let mut max = vec![0u32; idx.len()];
        for d in 0..idx.len() {
            let lo = idx[d] * self.interior_brick_size[d];
            let hi = ((idx[d] + 1) * self.interior_brick_size[d]).min(self.axis_samples[d]);
            min[d] = lo;
            max[d] = hi;
        }
        (min, max)
    }

    /// Same as [`Self::chunk_min_max_interior`] but expanded by the layer's
    /// margins and clipped to `[0, N_d)` (spec §3 Chunk).
    pub fn chunk_min_max(&self, chunk_index: u64, include_margin: bool) -> (Vec<u32>, Vec<u32>) {
        let (mut min, mut max) = self.chunk_min_max_interior(chunk_index);
        if include_margin {
            for d in 0..min.len() {
                min[d] = min[d].saturating_sub(self.margin_neg);
                max[d] = (max[d] + self.margin_pos).min(self.axis_samples[d]);
            }
        }
        (min, max)
    }

    /// Every chunk index whose interior range intersects `[min, max)`.
    pub fn chunks_in_region(&self, min: &[u32], max: &[u32]) -> VdsResult<Vec<u64>> {
        if min.len() != self.chunks_per_dim.len() || max.len() != self.chunks_per_dim.len() {
            return Err(VdsError::invalid_argument(
                "region dimensionality does not match layer's chunk dimensionality",
            ));
        }
        for d in 0..min.len() {
            if min[d] >= max[d] || max[d] > self.axis_samples[d] {
                return Err(VdsError::invalid_argument("voxel region out of range"));
            }
        }

        let mut lo = vec![0u32; min.len()];
        let mut hi = vec![0u32; min.len()];
        for d in 0..min.len() {
            lo[d] = min[d] / self.interior_brick_size[d];
            hi[d] = (max[d] - 1) / self.interior_brick_size[d];
        }

        let mut chunks = Vec::new();
        let mut cursor = lo.clone();
        loop {
            chunks.push(self.chunk_index_from_array(&cursor));
            // odometer increment
            let mut d = 0;
            loop {
                if d == cursor.len() {
                    return Ok(chunks);
                }
                cursor[d] += 1;
                if cursor[d] > hi[d] {
                    cursor[d] = lo[d];
                    d += 1;
                } else {
                    break;
                }
            }
        }
    }

    /// Remaps a primary-layer chunk index through a non-primary channel's
    /// `ChannelMapping` (spec §3 Layer: "a deterministic function of the
    /// primary layer's chunk index"). `PerTrace(count)` groups `count`
    /// consecutive primary chunks along dimension 0 into one mapped chunk;
    /// see DESIGN.md for why this particular grouping was chosen.
    pub fn map_chunk_index(mapping: ChannelMapping, primary_chunk_index: u64) -> u64 {
        match mapping {
            ChannelMapping::Direct => primary_chunk_index,
            ChannelMapping::PerTrace(count) => primary_chunk_index / count.max(1) as u64,
        }
    }
}

fn div_ceil(n: u32, d: u32) -> u32 {
    (n + d - 1) / d
}

#[allow(dead_code)]
pub(crate) fn layer_ref(layout: &Layout, handle: LayerHandle) -> &Layer {
    layout.layer(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_block::Format;
    use crate::layout::{Axis, Channel, ChannelFlags, LayoutDescriptor};
    use crate::codec::CompressionMethod;

    fn layout_60_cube(brick: u32, margin: u32) -> Layout {
        let descriptor = LayoutDescriptor {
            brick_size: brick,
            margin_neg: margin,
            margin_pos: margin,
            ..Default::default()
        };
        let axes = (0..3)
            .map(|i| Axis {
                name: format!("axis{i}"),
                unit: "m".into(),
                sample_count: 60,
                coordinate_min: 0.0,
                coordinate_max: 59.0,
            })
            .collect();
        let channels = vec![Channel {
            name: "Amplitude".into(),
            unit: "".into(),
            format: Format::F32,
            components: 1,
            value_min: -1.0,
            value_max: 1.0,
            no_value: None,
            mapping: ChannelMapping::Direct,
            flags: ChannelFlags::ALLOW_LOSSY_COMPRESSION,
            integer_scale: 1.0,
            integer_offset: 0.0,
            requested_compression: CompressionMethod::None,
            base_tolerance: 0.01,
        }];
        Layout::build(descriptor, axes, channels).unwrap()
    }

    #[test]
    fn chunk_partition_covers_every_voxel_exactly_once() {
        let layout = layout_60_cube(32, 4);
        let handle = layout.layer_by_key("Dimensions_012LOD0").unwrap();
        let indexer = ChunkIndexer::for_layer(&layout, handle);
        assert_eq!(indexer.chunk_dimensionality(), 3);

        let mut covered = std::collections::HashSet::new();
        let mut interior_volume = 0u64;
        for chunk_index in 0..indexer.total_chunks() {
            let (min, max) = indexer.chunk_min_max_interior(chunk_index);
            let volume: u64 = (0..3).map(|d| (max[d] - min[d]) as u64).product();
            interior_volume += volume;
            for x in min[0]..max[0] {
                for y in min[1]..max[1] {
                    for z in min[2]..max[2] {
                        assert!(covered.insert((x, y, z)), "voxel covered twice");
                    }
                }
            }
        }
        assert_eq!(interior_volume, 60u64.pow(3));
        assert_eq!(covered.len() as u64, 60u64.pow(3));
    }

    #[test]
    fn margin_expansion_clips_to_bounds() {
        let layout = layout_60_cube(32, 4);
        let handle = layout.layer_by_key("Dimensions_012LOD0").unwrap();
        let indexer = ChunkIndexer::for_layer(&layout, handle);
        let (min, max) = indexer.chunk_min_max(0, true);
        assert_eq!(min, vec![0, 0, 0]);
        let (interior_min, _) = indexer.chunk_min_max_interior(0);
        assert_eq!(interior_min, vec![0, 0, 0]);
        assert!(max[0] > 0);
    }

    #[test]
    fn chunks_in_region_matches_direct_scan() {
        let layout = layout_60_cube(32, 4);
        let handle = layout.layer_by_key("Dimensions_012LOD0").unwrap();
        let indexer = ChunkIndexer::for_layer(&layout, handle);
        let region_min = [10, 10, 10];
        let region_max = [50, 50, 50];
        let chunks = indexer.chunks_in_region(&region_min, &region_max).unwrap();

        let mut expected = Vec::new();
        for c in 0..indexer.total_chunks() {
            let (min, max) = indexer.chunk_min_max_interior(c);
            let intersects = (0..3).all(|d| min[d] < region_max[d] && max[d] > region_min[d]);
            if intersects {
                expected.push(c);
            }
        }
        let mut chunks_sorted = chunks.clone();
        chunks_sorted.sort_unstable();
        expected.sort_unstable();
        assert_eq!(chunks_sorted, expected);
    }
}
