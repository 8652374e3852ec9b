// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! JSON (de)serialization of the `VolumeDataLayout` and `LayerStatus`
//! objects (spec §1 "the JSON (de)serialization of descriptors reduced to a
//! `LayoutCodec` interface", spec §6). `vds-core` only depends on the
//! `LayoutCodec` *trait*; this module provides the one real implementation,
//! the way the teacher keeps wire-format (de)serialization in `nydus-api`
//! rather than in `rafs` itself.

use serde::{Deserialize, Serialize};

use vds_core::{
    Axis, Channel, ChannelFlags, ChannelMapping, CompressionMethod, Format, Layout,
    LayoutDescriptor, LayoutFlags, ProduceStatus,
};
use vds_core::{LayerStatus, LayoutCodec};
use vds_utils::{VdsError, VdsResult};

#[derive(Serialize, Deserialize)]
struct AxisWire {
    name: String,
    unit: String,
    sample_count: u32,
    coordinate_min: f64,
    coordinate_max: f64,
}

#[derive(Serialize, Deserialize)]
struct ChannelWire {
    name: String,
    unit: String,
    format: String,
    components: u32,
    value_min: f64,
    value_max: f64,
    no_value: Option<f64>,
    mapping: String,
    per_trace_count: Option<u32>,
    discrete: bool,
    renderable: bool,
    allow_lossy_compression: bool,
    use_zip_for_lossless: bool,
    use_no_value: bool,
    integer_scale: f64,
    integer_offset: f64,
    requested_compression: String,
    base_tolerance: f64,
}

#[derive(Serialize, Deserialize)]
struct LayoutDescriptorWire {
    brick_size: u32,
    margin_neg: u32,
    margin_pos: u32,
    brick_size_2d_multiplier: u32,
    max_lod: u32,
    create_2d_lods: bool,
    force_full_resolution_dimension: bool,
    full_resolution_dimension: Option<usize>,
    chunk_metadata_page_size: u32,
}

#[derive(Serialize, Deserialize)]
struct VolumeDataLayoutWire {
    descriptor: LayoutDescriptorWire,
    axes: Vec<AxisWire>,
    channels: Vec<ChannelWire>,
}

#[derive(Serialize, Deserialize)]
struct LayerStatusWire {
    layer_name: String,
    channel_name: String,
    dimension_group: String,
    lod: u32,
    produce_status: String,
    compression_method: String,
    compression_tolerance: f64,
    chunk_count: u64,
    chunk_metadata_page_size: u32,
    chunk_metadata_byte_size: u32,
    uncompressed_size: i64,
    adaptive_level_sizes: Vec<i64>,
    has_chunk_metadata_pages: bool,
}

fn io_err(e: serde_json::Error) -> VdsError {
    VdsError::invalid_argument(format!("malformed JSON: {e}"))
}

/// Serializes a built `Layout` to the `VolumeDataLayout` object body (spec
/// §6). Used by `AccessManager::create` once the layout is finalized.
pub fn encode_layout(layout: &Layout) -> VdsResult<Vec<u8>> {
    let d = &layout.descriptor;
    let wire = VolumeDataLayoutWire {
        descriptor: LayoutDescriptorWire {
            brick_size: d.brick_size,
            margin_neg: d.margin_neg,
            margin_pos: d.margin_pos,
            brick_size_2d_multiplier: d.brick_size_2d_multiplier,
            max_lod: d.max_lod,
            create_2d_lods: d.flags.contains(LayoutFlags::CREATE_2D_LODS),
            force_full_resolution_dimension: d.flags.contains(LayoutFlags::FORCE_FULL_RESOLUTION_DIMENSION),
            full_resolution_dimension: d.full_resolution_dimension,
            chunk_metadata_page_size: d.chunk_metadata_page_size,
        },
        axes: layout
            .axes
            .iter()
            .map(|a| AxisWire {
                name: a.name.clone(),
                unit: a.unit.clone(),
                sample_count: a.sample_count,
                coordinate_min: a.coordinate_min,
                coordinate_max: a.coordinate_max,
            })
            .collect(),
        channels: layout
            .channels
            .iter()
            .map(|c| ChannelWire {
                name: c.name.clone(),
                unit: c.unit.clone(),
                format: c.format.wire_name().to_string(),
                components: c.components,
                value_min: c.value_min,
                value_max: c.value_max,
                no_value: c.no_value,
                mapping: match c.mapping {
                    ChannelMapping::Direct => "Direct".to_string(),
                    ChannelMapping::PerTrace(_) => "PerTrace".to_string(),
                },
                per_trace_count: match c.mapping {
                    ChannelMapping::PerTrace(n) => Some(n),
                    ChannelMapping::Direct => None,
                },
                discrete: c.flags.contains(ChannelFlags::DISCRETE),
                renderable: c.flags.contains(ChannelFlags::RENDERABLE),
                allow_lossy_compression: c.flags.contains(ChannelFlags::ALLOW_LOSSY_COMPRESSION),
                use_zip_for_lossless: c.flags.contains(ChannelFlags::USE_ZIP_FOR_LOSSLESS),
                use_no_value: c.flags.contains(ChannelFlags::USE_NO_VALUE),
                integer_scale: c.integer_scale,
                integer_offset: c.integer_offset,
                requested_compression: c.requested_compression.wire_name().to_string(),
                base_tolerance: c.base_tolerance,
            })
            .collect(),
    };
    serde_json::to_vec_pretty(&wire).map_err(io_err)
}

/// Parses a `VolumeDataLayout` object body and builds the runtime `Layout`
/// (layer tree included). Used by `AccessManager::open`.
pub fn decode_layout(bytes: &[u8]) -> VdsResult<Layout> {
    let wire: VolumeDataLayoutWire = serde_json::from_slice(bytes).map_err(io_err)?;

    let mut flags = LayoutFlags::empty();
    if wire.descriptor.create_2d_lods {
        flags.insert(LayoutFlags::CREATE_2D_LODS);
    }
    if wire.descriptor.force_full_resolution_dimension {
        flags.insert(LayoutFlags::FORCE_FULL_RESOLUTION_DIMENSION);
    }
    let descriptor = LayoutDescriptor {
        brick_size: wire.descriptor.brick_size,
        margin_neg: wire.descriptor.margin_neg,
        margin_pos: wire.descriptor.margin_pos,
        brick_size_2d_multiplier: wire.descriptor.brick_size_2d_multiplier,
        max_lod: wire.descriptor.max_lod,
        flags,
        full_resolution_dimension: wire.descriptor.full_resolution_dimension,
        chunk_metadata_page_size: wire.descriptor.chunk_metadata_page_size,
    };

    let axes = wire
        .axes
        .into_iter()
        .map(|a| Axis {
            name: a.name,
            unit: a.unit,
            sample_count: a.sample_count,
            coordinate_min: a.coordinate_min,
            coordinate_max: a.coordinate_max,
        })
        .collect();

    let channels = wire
        .channels
        .into_iter()
        .map(|c| -> VdsResult<Channel> {
            let mut flags = ChannelFlags::empty();
            if c.discrete {
                flags.insert(ChannelFlags::DISCRETE);
            }
            if c.renderable {
                flags.insert(ChannelFlags::RENDERABLE);
            }
            if c.allow_lossy_compression {
                flags.insert(ChannelFlags::ALLOW_LOSSY_COMPRESSION);
            }
            if c.use_zip_for_lossless {
                flags.insert(ChannelFlags::USE_ZIP_FOR_LOSSLESS);
            }
            if c.use_no_value {
                flags.insert(ChannelFlags::USE_NO_VALUE);
            }
            let mapping = match c.mapping.as_str() {
                "Direct" => ChannelMapping::Direct,
                "PerTrace" => ChannelMapping::PerTrace(c.per_trace_count.unwrap_or(1)),
                other => return Err(VdsError::invalid_argument(format!("unknown channel mapping '{other}'"))),
            };
            Ok(Channel {
                name: c.name,
                unit: c.unit,
                format: Format::from_wire_name(&c.format)?,
                components: c.components,
                value_min: c.value_min,
                value_max: c.value_max,
                no_value: c.no_value,
                mapping,
                flags,
                integer_scale: c.integer_scale,
                integer_offset: c.integer_offset,
                requested_compression: CompressionMethod::from_wire_name(&c.requested_compression)?,
                base_tolerance: c.base_tolerance,
            })
        })
        .collect::<VdsResult<Vec<_>>>()?;

    Layout::build(descriptor, axes, channels)
}

/// The sole real `LayoutCodec`: JSON via `serde_json` (spec §4.7/§6).
pub struct JsonLayoutCodec;

impl LayoutCodec for JsonLayoutCodec {
    fn encode_layer_status(&self, statuses: &[LayerStatus]) -> VdsResult<Vec<u8>> {
        let wire: Vec<LayerStatusWire> = statuses
            .iter()
            .map(|s| LayerStatusWire {
                layer_name: s.layer_name.clone(),
                channel_name: s.channel_name.clone(),
                dimension_group: s.dimension_group.clone(),
                lod: s.lod,
                produce_status: match s.produce_status {
                    ProduceStatus::Normal => "Normal".to_string(),
                    ProduceStatus::Remapped => "Remapped".to_string(),
                    ProduceStatus::Unavailable => "Unavailable".to_string(),
                },
                compression_method: s.compression_method.wire_name().to_string(),
                compression_tolerance: s.compression_tolerance,
                chunk_count: s.chunk_count,
                chunk_metadata_page_size: s.chunk_metadata_page_size,
                chunk_metadata_byte_size: s.chunk_metadata_byte_size,
                uncompressed_size: s.uncompressed_size,
                adaptive_level_sizes: s.adaptive_level_sizes.to_vec(),
                has_chunk_metadata_pages: s.has_chunk_metadata_pages,
            })
            .collect();
        serde_json::to_vec_pretty(&wire).map_err(io_err)
    }

    fn decode_layer_status(&self, bytes: &[u8]) -> VdsResult<Vec<LayerStatus>> {
        let wire: Vec<LayerStatusWire> = serde_json::from_slice(bytes).map_err(io_err)?;
        wire.into_iter()
            .map(|s| -> VdsResult<LayerStatus> {
                let mut adaptive = [0i64; vds_core::WAVELET_ADAPTIVE_LEVELS];
                for (slot, v) in adaptive.iter_mut().zip(s.adaptive_level_sizes.iter()) {
                    *slot = *v;
                }
                Ok(LayerStatus {
                    layer_name: s.layer_name,
                    channel_name: s.channel_name,
                    dimension_group: s.dimension_group,
                    lod: s.lod,
                    produce_status: match s.produce_status.as_str() {
                        "Normal" => ProduceStatus::Normal,
                        "Remapped" => ProduceStatus::Remapped,
                        "Unavailable" => ProduceStatus::Unavailable,
                        other => {
                            return Err(VdsError::invalid_argument(format!(
                                "unknown produce status '{other}'"
                            )))
                        }
                    },
                    compression_method: CompressionMethod::from_wire_name(&s.compression_method)?,
                    compression_tolerance: s.compression_tolerance,
                    chunk_count: s.chunk_count,
                    chunk_metadata_page_size: s.chunk_metadata_page_size,
                    chunk_metadata_byte_size: s.chunk_metadata_byte_size,
                    uncompressed_size: s.uncompressed_size,
                    adaptive_level_sizes: adaptive,
                    has_chunk_metadata_pages: s.has_chunk_metadata_pages,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vds_core::{ChannelFlags, ChannelMapping};

    fn sample_layout() -> Layout {
        let descriptor = LayoutDescriptor {
            brick_size: 32,
            margin_neg: 4,
            margin_pos: 4,
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
            no_value: Some(-9999.0),
            mapping: ChannelMapping::Direct,
            flags: ChannelFlags::ALLOW_LOSSY_COMPRESSION | ChannelFlags::RENDERABLE,
            integer_scale: 1.0,
            integer_offset: 0.0,
            requested_compression: CompressionMethod::None,
            base_tolerance: 0.01,
        }];
        Layout::build(descriptor, axes, channels).unwrap()
    }

    #[test]
    fn layout_round_trips_through_json() {
        let layout = sample_layout();
        let bytes = encode_layout(&layout).unwrap();
        let reparsed = decode_layout(&bytes).unwrap();
        assert_eq!(reparsed.dimensionality(), layout.dimensionality());
        assert_eq!(reparsed.layers.len(), layout.layers.len());
        let handle = reparsed.layer_by_key("Dimensions_012LOD0").unwrap();
        assert_eq!(reparsed.layer(handle).lod, 0);
    }

    #[test]
    fn layer_status_round_trips_through_json() {
        let codec = JsonLayoutCodec;
        let status = LayerStatus {
            layer_name: "Dimensions_012LOD0".into(),
            channel_name: "Amplitude".into(),
            dimension_group: "Dimensions_012".into(),
            lod: 0,
            produce_status: ProduceStatus::Normal,
            compression_method: CompressionMethod::None,
            compression_tolerance: 0.0,
            chunk_count: 27,
            chunk_metadata_page_size: 1024,
            chunk_metadata_byte_size: 8,
            uncompressed_size: 4096,
            adaptive_level_sizes: [0; vds_core::WAVELET_ADAPTIVE_LEVELS],
            has_chunk_metadata_pages: true,
        };
        let bytes = codec.encode_layer_status(&[status.clone()]).unwrap();
        let decoded = codec.decode_layer_status(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].layer_name, status.layer_name);
        assert_eq!(decoded[0].chunk_count, status.chunk_count);
    }
}
