// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::OnceCell;

static LOGGER_GUARD: OnceCell<()> = OnceCell::new();

/// Installs a `flexi_logger` backend once per process. Safe to call from
/// `AccessManager::open`/`create` on every invocation: a host application
/// that already configured its own `log` backend is left untouched since
/// `flexi_logger` only initializes a backend if none is set yet, and we
/// additionally guard with a `OnceCell` so we never attempt it twice from
/// within this crate.
pub fn init_default_logger() {
    LOGGER_GUARD.get_or_init(|| {
        let _ = flexi_logger::Logger::try_with_env_or_str("info")
            .and_then(|logger| logger.start());
    });
}
