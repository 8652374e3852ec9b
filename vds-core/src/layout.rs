// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! C3: `Layout` — descriptors, the layer tree, and compression policy. See
//! spec §4.3. The layer tree is a flat arena of `Layer`s addressed by
//! `LayerHandle` (a plain index), with parent/child/sibling links stored as
//! `Option<LayerHandle>` rather than owning pointers (spec §9 design note
//! "Layer tree with back-pointers").

use std::collections::HashMap;

use vds_utils::{VdsError, VdsResult};

use crate::codec::CompressionMethod;
use crate::data_block::Format;
use crate::dimension_group::DimensionGroup;

/// Number of wavelet adaptive levels tracked per chunk (spec §3 MetadataPage,
/// §6 `adaptiveLevelSizes[16]`).
pub const WAVELET_ADAPTIVE_LEVELS: usize = 16;

/// One dataset axis (spec §3 Axis).
#[derive(Clone, Debug)]
pub struct Axis {
    pub name: String,
    pub unit: String,
    pub sample_count: u32,
    pub coordinate_min: f64,
    pub coordinate_max: f64,
}

impl Axis {
    /// Maps an integer sample index to a real coordinate.
    pub fn coordinate_at(&self, sample: u32) -> f64 {
        if self.sample_count <= 1 {
            return self.coordinate_min;
        }
        let t = sample as f64 / (self.sample_count - 1) as f64;
        self.coordinate_min + t * (self.coordinate_max - self.coordinate_min)
    }
}

bitflags::bitflags! {
    pub struct ChannelFlags: u32 {
        const DISCRETE               = 0b0000_0001;
        const RENDERABLE             = 0b0000_0010;
        const ALLOW_LOSSY_COMPRESSION = 0b0000_0100;
        const USE_ZIP_FOR_LOSSLESS   = 0b0000_1000;
        const USE_NO_VALUE           = 0b0001_0000;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelMapping {
    Direct,
    PerTrace(u32),
}

/// A named scalar field on the cube (spec §3 Channel).
#[derive(Clone, Debug)]
pub struct Channel {
    pub name: String,
    pub unit: String,
    pub format: Format,
    pub components: u32,
    pub value_min: f64,
    pub value_max: f64,
    pub no_value: Option<f64>,
    pub mapping: ChannelMapping,
    pub flags: ChannelFlags,
    pub integer_scale: f64,
    pub integer_offset: f64,
    /// Compression method requested for this channel before the per-layer
    /// lossy/LOD substitution rules of spec §4.3 item 2 are applied.
    pub requested_compression: CompressionMethod,
    /// Base (LOD 0) compression tolerance before the `2^min(LOD,2)` scaling.
    pub base_tolerance: f64,
}

impl Channel {
    pub fn allows_lossy(&self) -> bool {
        self.flags.contains(ChannelFlags::ALLOW_LOSSY_COMPRESSION)
    }
}

bitflags::bitflags! {
    pub struct LayoutFlags: u32 {
        const CREATE_2D_LODS = 0b0000_0001;
        const FORCE_FULL_RESOLUTION_DIMENSION = 0b0000_0010;
    }
}

/// spec §3 LayoutDescriptor.
#[derive(Clone, Debug)]
pub struct LayoutDescriptor {
    pub brick_size: u32,
    pub margin_neg: u32,
    pub margin_pos: u32,
    pub brick_size_2d_multiplier: u32,
    pub max_lod: u32,
    pub flags: LayoutFlags,
    pub full_resolution_dimension: Option<usize>,
    /// Page size used by newly-created `MetadataManager`s (spec §3
    /// MetadataPage, default 1024).
    pub chunk_metadata_page_size: u32,
}

impl Default for LayoutDescriptor {
    fn default() -> Self {
        Self {
            brick_size: 64,
            margin_neg: 0,
            margin_pos: 0,
            brick_size_2d_multiplier: 4,
            max_lod: 0,
            flags: LayoutFlags::empty(),
            full_resolution_dimension: None,
            chunk_metadata_page_size: 1024,
        }
    }
}

impl LayoutDescriptor {
    pub fn interior_brick_size(&self) -> u32 {
        self.brick_size - self.margin_neg - self.margin_pos
    }

    pub fn validate(&self) -> VdsResult<()> {
        if self.margin_neg + self.margin_pos >= self.brick_size {
            return Err(VdsError::invalid_argument(
                "margins must leave at least one interior sample in the brick",
            ));
        }
        Ok(())
    }
}

/// Whether a `Remapped` layer is rebuilt from its `remap_from_layer` on every
/// access, or cached after first remap. Supplement over spec.md, grounded in
/// `original_source/VDS/VolumeDataLayer.h`'s `ProduceMethod` enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProduceMethod {
    AlwaysRemap,
    RemapFromCachedIfPossible,
    NeverRemap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProduceStatus {
    Normal,
    Remapped,
    Unavailable,
}

impl ProduceStatus {
    pub fn wire_name(self) -> &'static str {
        match self {
            ProduceStatus::Normal => "Normal",
            ProduceStatus::Remapped => "Remapped",
            ProduceStatus::Unavailable => "Unavailable",
        }
    }
}

pub type LayerHandle = usize;

/// One node of the layer tree: `(DimensionGroup, LOD, Channel)` (spec §3
/// Layer).
#[derive(Clone, Debug)]
pub struct Layer {
    pub dimension_group: DimensionGroup,
    pub lod: u32,
    pub channel: usize,
    pub produce_status: ProduceStatus,
    pub produce_method: ProduceMethod,
    pub parent: Option<LayerHandle>,
    pub lower_lod: Option<LayerHandle>,
    pub next_channel: Option<LayerHandle>,
    pub primary_channel_layer: Option<LayerHandle>,
    pub remap_from_layer: Option<LayerHandle>,
    pub compression_method: CompressionMethod,
    pub compression_tolerance: f64,
    pub chunk_metadata_page_size: u32,
    pub interior_brick_size: [u32; 3],
    pub margin_neg: u32,
    pub margin_pos: u32,
}

impl Layer {
    pub fn is_primary(&self) -> bool {
        self.primary_channel_layer.is_none()
    }

    /// `"<DimensionGroupName>LOD<n>"`, or `"<ChannelName><DimensionGroupName>LOD<n>"`
    /// for non-primary channels (spec §4.7 layer key).
    pub fn key_for_channel(&self, channel_name: &str) -> String {
        let dg = self.dimension_group.name();
        if self.is_primary() {
            format!("{dg}LOD{}", self.lod)
        } else {
            format!("{channel_name}{dg}LOD{}", self.lod)
        }
    }

    pub fn adaptive_load_level(&self, layout: &Layout) -> u32 {
        let base_tol = layout.channels[self.channel].base_tolerance.max(f64::MIN_POSITIVE);
        if self.compression_tolerance <= 0.0 {
            return 0;
        }
        let raw = (self.compression_tolerance / base_tol).log2().floor();
        let clamped = raw.max(0.0) as u32;
        let cap = if self.lod == 0 { WAVELET_ADAPTIVE_LEVELS as u32 - 1 } else { 4 };
        clamped.min(cap).min(WAVELET_ADAPTIVE_LEVELS as u32 - 1)
    }
}

/// The immutable, fully-built layout: descriptor, axes, channels and layer
/// tree (spec §3 Lifecycles: "immutable thereafter except for its
/// actual-value-range hint").
#[derive(Debug)]
pub struct Layout {
    pub descriptor: LayoutDescriptor,
    pub axes: Vec<Axis>,
    pub channels: Vec<Channel>,
    pub layers: Vec<Layer>,
    key_index: HashMap<String, LayerHandle>,
    /// Actual-value-range hint, the single mutable field post-construction.
    actual_value_range: std::sync::RwLock<Vec<Option<(f64, f64)>>>,
}

impl Layout {
    pub fn build(descriptor: LayoutDescriptor, axes: Vec<Axis>, channels: Vec<Channel>) -> VdsResult<Layout> {
        descriptor.validate()?;
        if axes.len() < 2 || axes.len() > crate::dimension_group::MAX_DIMENSIONALITY {
            return Err(VdsError::invalid_argument("dimensionality must be in [2,6]"));
        }
        if channels.is_empty() {
            return Err(VdsError::invalid_argument("layout needs at least one channel"));
        }

        let mut layers = Vec::new();
        let groups = DimensionGroup::enumerate(axes.len());

        for group in groups {
            if group.top_dimension() >= axes.len() {
                continue;
            }
            let chunk_dim = group.dimensionality();
            let physical_lod_levels = if chunk_dim == 3 {
                descriptor.max_lod + 1
            } else if descriptor.flags.contains(LayoutFlags::CREATE_2D_LODS) {
                descriptor.max_lod + 1
            } else {
                1
            };

            let interior = descriptor.interior_brick_size();
            let base_brick = if chunk_dim == 2 {
                interior * descriptor.brick_size_2d_multiplier
            } else {
                interior
            };

            // Build primary-channel layers for every LOD, lowest first, then
            // link lower->higher, then hang siblings for the other channels.
            let mut lower_handle: Option<LayerHandle> = None;
            let primary_channel = 0usize;
            let mut primary_handles_by_lod = Vec::new();

            for lod in 0..physical_lod_levels {
                let mut interior_brick_size = [1u32; 3];
                for k in 0..group.dimensionality() {
                    interior_brick_size[k] = base_brick;
                }
                let channel = &channels[primary_channel];
                let (method, tolerance) =
                    effective_compression(channel, lod, descriptor.flags.contains(LayoutFlags::CREATE_2D_LODS));

                let handle = layers.len();
                layers.push(Layer {
                    dimension_group: group.clone(),
                    lod,
                    channel: primary_channel,
                    produce_status: ProduceStatus::Normal,
                    produce_method: ProduceMethod::NeverRemap,
                    parent: None,
                    lower_lod: lower_handle,
                    next_channel: None,
                    primary_channel_layer: None,
                    remap_from_layer: None,
                    compression_method: method,
                    compression_tolerance: tolerance,
                    chunk_metadata_page_size: descriptor.chunk_metadata_page_size,
                    interior_brick_size,
                    margin_neg: descriptor.margin_neg,
                    margin_pos: descriptor.margin_pos,
                });
                if let Some(lower) = lower_handle {
                    layers[lower].parent = Some(handle);
                }
                lower_handle = Some(handle);
                primary_handles_by_lod.push(handle);
            }

            // Sibling (non-primary channel) layers for each LOD.
            for (lod, &primary_handle) in primary_handles_by_lod.iter().enumerate() {
                let mut prev_sibling = primary_handle;
                for (ci, channel) in channels.iter().enumerate().skip(1) {
                    let (method, tolerance) = effective_compression(
                        channel,
                        lod as u32,
                        descriptor.flags.contains(LayoutFlags::CREATE_2D_LODS),
                    );
                    let produce_status = match channel.mapping {
                        ChannelMapping::Direct => ProduceStatus::Normal,
                        ChannelMapping::PerTrace(_) => ProduceStatus::Normal,
                    };
                    let handle = layers.len();
                    layers.push(Layer {
                        dimension_group: group.clone(),
                        lod: lod as u32,
                        channel: ci,
                        produce_status,
                        produce_method: ProduceMethod::NeverRemap,
                        parent: None,
                        lower_lod: None,
                        next_channel: None,
                        primary_channel_layer: Some(primary_handle),
                        remap_from_layer: None,
                        compression_method: method,
                        compression_tolerance: tolerance,
                        chunk_metadata_page_size: descriptor.chunk_metadata_page_size,
                        interior_brick_size: layers[primary_handle].interior_brick_size,
                        margin_neg: descriptor.margin_neg,
                        margin_pos: descriptor.margin_pos,
                    });
                    layers[prev_sibling].next_channel = Some(handle);
                    prev_sibling = handle;
                }
            }
        }

        let actual_value_range = std::sync::RwLock::new(vec![None; channels.len()]);
        let mut layout = Layout {
            descriptor,
            axes,
            channels,
            layers,
            key_index: HashMap::new(),
            actual_value_range,
        };
        layout.reindex();
        Ok(layout)
    }

    fn reindex(&mut self) {
        self.key_index.clear();
        for (handle, layer) in self.layers.iter().enumerate() {
            let channel_name = self.channels[layer.channel].name.clone();
            let key = layer.key_for_channel(&channel_name);
            self.key_index.insert(key, handle);
        }
    }

    pub fn dimensionality(&self) -> usize {
        self.axes.len()
    }

    pub fn layer_by_key(&self, key: &str) -> Option<LayerHandle> {
        self.key_index.get(key).copied()
    }

    pub fn layer(&self, handle: LayerHandle) -> &Layer {
        &self.layers[handle]
    }

    pub fn layer_key(&self, handle: LayerHandle) -> String {
        let layer = &self.layers[handle];
        layer.key_for_channel(&self.channels[layer.channel].name)
    }

    pub fn find_layer(&self, group: &DimensionGroup, lod: u32, channel: usize) -> Option<LayerHandle> {
        self.layers.iter().position(|l| {
            l.dimension_group == *group && l.lod == lod && l.channel == channel
        })
    }

    /// Number of samples of axis `dim` at `lod` (spec §3 invariant):
    /// `N_i(lod) = max(1, ceil(N_i(0) / 2^lod))` unless `dim` is the declared
    /// full-resolution dimension, in which case it never shrinks.
    pub fn axis_sample_count_at_lod(&self, dim: usize, lod: u32) -> u32 {
        let n0 = self.axes[dim].sample_count;
        if Some(dim) == self.descriptor.full_resolution_dimension {
            return n0;
        }
        let divisor = 1u32 << lod;
        ((n0 as u64 + divisor as u64 - 1) / divisor as u64).max(1) as u32
    }

    pub fn set_actual_value_range(&self, channel: usize, range: (f64, f64)) {
        self.actual_value_range.write().unwrap()[channel] = Some(range);
    }

    pub fn actual_value_range(&self, channel: usize) -> Option<(f64, f64)> {
        self.actual_value_range.read().unwrap()[channel]
    }
}

/// Effective compression method + tolerance for a channel at a given LOD
/// (spec §4.3 item 2).
fn effective_compression(channel: &Channel, lod: u32, _create_2d_lods: bool) -> (CompressionMethod, f64) {
    if !channel.allows_lossy() {
        let method = if channel.flags.contains(ChannelFlags::USE_ZIP_FOR_LOSSLESS) {
            CompressionMethod::Zip
        } else {
            CompressionMethod::Rle
        };
        return (method, 0.0);
    }

    let method = if lod >= 1 && channel.requested_compression == CompressionMethod::WaveletLossless {
        CompressionMethod::Wavelet
    } else if lod >= 1 && channel.requested_compression == CompressionMethod::WaveletNormalizeBlockLossless {
        CompressionMethod::WaveletNormalizeBlock
    } else {
        channel.requested_compression
    };

    let tolerance = channel.base_tolerance.max(2.0) * 2f64.powi(lod.min(2) as i32);
    (method, tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_block::Format;

    fn cube_axes(n: u32) -> Vec<Axis> {
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
            no_value: None,
            mapping: ChannelMapping::Direct,
            flags: ChannelFlags::ALLOW_LOSSY_COMPRESSION | ChannelFlags::RENDERABLE,
            integer_scale: 1.0,
            integer_offset: 0.0,
            requested_compression: CompressionMethod::None,
            base_tolerance: 0.01,
        }]
    }

    #[test]
    fn builds_layer_tree_for_3d_cube() {
        let layout = Layout::build(LayoutDescriptor::default(), cube_axes(64), one_channel()).unwrap();
        let handle = layout.layer_by_key("Dimensions_012LOD0").unwrap();
        let layer = layout.layer(handle);
        assert_eq!(layer.lod, 0);
        assert!(layer.is_primary());
    }

    #[test]
    fn lod_sample_counts_halve() {
        let mut descriptor = LayoutDescriptor::default();
        descriptor.max_lod = 2;
        let layout = Layout::build(descriptor, cube_axes(64), one_channel()).unwrap();
        assert_eq!(layout.axis_sample_count_at_lod(0, 0), 64);
        assert_eq!(layout.axis_sample_count_at_lod(0, 1), 32);
        assert_eq!(layout.axis_sample_count_at_lod(0, 2), 16);
    }

    #[test]
    fn full_resolution_dimension_never_shrinks() {
        let mut descriptor = LayoutDescriptor::default();
        descriptor.max_lod = 2;
        descriptor.full_resolution_dimension = Some(0);
        let layout = Layout::build(descriptor, cube_axes(64), one_channel()).unwrap();
        assert_eq!(layout.axis_sample_count_at_lod(0, 2), 64);
        assert_eq!(layout.axis_sample_count_at_lod(1, 2), 16);
    }

    #[test]
    fn lossless_channel_forces_zip_or_rle() {
        let mut channels = one_channel();
        channels[0].flags.remove(ChannelFlags::ALLOW_LOSSY_COMPRESSION);
        let layout = Layout::build(LayoutDescriptor::default(), cube_axes(64), channels).unwrap();
        let handle = layout.layer_by_key("Dimensions_012LOD0").unwrap();
        assert_eq!(layout.layer(handle).compression_method, CompressionMethod::Rle);
        assert_eq!(layout.layer(handle).compression_tolerance, 0.0);
    }
}
