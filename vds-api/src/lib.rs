// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! External-interface seams kept out of `vds-core`: URL/connection-string
//! parsing into `OpenOptions`, and the JSON `LayoutCodec` implementation.
//! Mirrors the way the teacher keeps wire formats and CLI-facing parsing in
//! `nydus-api` rather than in `rafs`.

pub mod layout_json;
pub mod url_options;

pub use layout_json::{decode_layout, encode_layout, JsonLayoutCodec};
pub use url_options::{parse as parse_connection_url, ConnectionStringError, OpenOptions};
