// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! `vds-tool`: create, inspect and read back volumes through an
//! `AccessManager`, against either an `inmemory://` or `file://` store.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg, SubCommand};
use log::{error, info};

use openvds::{
    AccessManager, Axis, Channel, ChannelFlags, ChannelMapping, CompressionMethod, FileStore,
    Format, LayoutDescriptor, MemoryStore, ObjectStore,
};
use vds_utils::init_default_logger;

fn open_store(url: &str) -> Result<Arc<dyn ObjectStore>, String> {
    match openvds::parse_connection_url(url, "").map_err(|e| e.message)? {
        openvds::OpenOptions::File { path } => {
            Ok(Arc::new(FileStore::new(path).map_err(|e| e.to_string())?))
        }
        openvds::OpenOptions::InMemory { .. } => Ok(Arc::new(MemoryStore::new())),
        other => Err(format!("vds-tool only supports file:// and inmemory:// urls, got {:?}", other)),
    }
}

fn default_channel() -> Channel {
    Channel {
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
    }
}

fn cmd_create(url: &str, samples: u32) -> Result<(), String> {
    let store = open_store(url)?;
    let axes: Vec<Axis> = (0..3)
        .map(|i| Axis {
            name: format!("axis{i}"),
            unit: "m".into(),
            sample_count: samples,
            coordinate_min: 0.0,
            coordinate_max: (samples - 1) as f64,
        })
        .collect();
    let descriptor = LayoutDescriptor {
        brick_size: 64,
        ..Default::default()
    };
    let manager = AccessManager::create(store, descriptor, axes, vec![default_channel()])
        .map_err(|e| e.to_string())?;
    info!("created volume with {} layers", manager.layout().layers.len());
    Ok(())
}

fn cmd_info(url: &str) -> Result<(), String> {
    let store = open_store(url)?;
    let manager = AccessManager::open(store).map_err(|e| e.to_string())?;
    for (handle, layer) in manager.layout().layers.iter().enumerate() {
        println!(
            "layer {} lod={} channel={} dims={}",
            manager.layout().layer_key(handle),
            layer.lod,
            layer.channel,
            layer.dimension_group.dimensionality(),
        );
    }
    Ok(())
}

fn cmd_subset(url: &str, layer_key: &str, size: u32) -> Result<(), String> {
    let store = open_store(url)?;
    let manager = AccessManager::open(store).map_err(|e| e.to_string())?;
    let min = vec![0u32; 3];
    let max = vec![size; 3];
    let request = manager
        .request_volume_subset(layer_key, &min, &max, Format::F32, None)
        .map_err(|e| e.to_string())?;
    if !request.wait_for_completion(Some(Duration::from_secs(30))) {
        return Err("request timed out".into());
    }
    println!("read {} bytes", request.buffer().len());
    Ok(())
}

fn main() {
    init_default_logger();

    let matches = App::new("vds-tool")
        .version("0.1.0")
        .about("Create and inspect OpenVDS volumes")
        .subcommand(
            SubCommand::with_name("create")
                .about("creates a new volume")
                .arg(Arg::with_name("url").required(true))
                .arg(Arg::with_name("samples").long("samples").takes_value(true).default_value("64")),
        )
        .subcommand(
            SubCommand::with_name("info")
                .about("lists the layers of an existing volume")
                .arg(Arg::with_name("url").required(true)),
        )
        .subcommand(
            SubCommand::with_name("subset")
                .about("reads a cube-shaped subset of one layer")
                .arg(Arg::with_name("url").required(true))
                .arg(Arg::with_name("layer").long("layer").takes_value(true).required(true))
                .arg(Arg::with_name("size").long("size").takes_value(true).default_value("16")),
        )
        .get_matches();

    let result = match matches.subcommand() {
        ("create", Some(sub)) => {
            let samples: u32 = sub.value_of("samples").unwrap().parse().unwrap_or(64);
            cmd_create(sub.value_of("url").unwrap(), samples)
        }
        ("info", Some(sub)) => cmd_info(sub.value_of("url").unwrap()),
        ("subset", Some(sub)) => {
            let size: u32 = sub.value_of("size").unwrap().parse().unwrap_or(16);
            cmd_subset(sub.value_of("url").unwrap(), sub.value_of("layer").unwrap(), size)
        }
        _ => {
            eprintln!("{}", matches.usage());
            process::exit(1);
        }
    };

    if let Err(err) = result {
        error!("{}", err);
        process::exit(1);
    }
}
