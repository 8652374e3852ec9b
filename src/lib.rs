// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! `openvds`: the top-level crate over the focused `vds-core`/`vds-api`
//! crates, the way the teacher keeps `nydus-rs` as a thin top-level crate
//! and CLI over `rafs`/`nydus-api`. Provides the `AccessManager` façade
//! (C10) plus the two bundled `ObjectStore` backends used by tests, the CLI
//! and anyone embedding the library without a cloud object store handy.

pub mod access_manager;
pub mod file_store;
pub mod memory_store;

pub use access_manager::{AccessManager, InterpolationMethod, VolumeRequest};
pub use file_store::FileStore;
pub use memory_store::MemoryStore;

pub use vds_api::{parse_connection_url, ConnectionStringError, OpenOptions};
pub use vds_core::{
    Axis, Channel, ChannelFlags, ChannelMapping, CompressionMethod, Format, Layout,
    LayoutDescriptor, LayoutFlags, ObjectStore,
};
pub use vds_utils::{VdsError, VdsResult};
