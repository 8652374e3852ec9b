// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! C4: `ObjectStore` — the backend transport trait the core consumes to
//! fetch/put named objects. See spec §4.4. Concrete backends (S3, Azure,
//! local file, in-memory) are façade-level concerns (spec §1, §10); this
//! module only owns the trait and the small value types around it.

use std::sync::{Arc, Mutex};

use vds_utils::VdsResult;

/// `[begin, end)` byte range within an object; `None` means "whole object".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub begin: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn whole() -> Option<ByteRange> {
        None
    }

    pub fn prefix(end: u64) -> Option<ByteRange> {
        Some(ByteRange { begin: 0, end })
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Headers attached to a `get`/`put`, e.g. the `vdschunkmetadata` header
/// carrying a layer's hash/size for a single-object chunk upload (spec §6).
pub type ObjectHeaders = Vec<(String, String)>;

pub struct GetResult {
    pub data: Vec<u8>,
    pub headers: ObjectHeaders,
}

/// A handle to an in-flight request; `cancel` is advisory — the backend may
/// still complete the transfer, but `is_canceled` lets callers stop waiting
/// on it (spec §4.4, §4.9 cancellation).
pub struct RequestHandle {
    canceled: Arc<Mutex<bool>>,
}

impl RequestHandle {
    pub fn new() -> (RequestHandle, CancelToken) {
        let canceled = Arc::new(Mutex::new(false));
        (
            RequestHandle {
                canceled: canceled.clone(),
            },
            CancelToken { canceled },
        )
    }

    pub fn cancel(&self) {
        *self.canceled.lock().unwrap() = true;
    }
}

#[derive(Clone)]
pub struct CancelToken {
    canceled: Arc<Mutex<bool>>,
}

impl CancelToken {
    pub fn is_canceled(&self) -> bool {
        *self.canceled.lock().unwrap()
    }
}

/// External backend interface the core depends on (spec §4.4).
///
/// Implementations are expected to be cheap to clone (an `Arc` around a
/// connection pool, typically) and safe to call from multiple worker
/// threads concurrently, matching the `RequestProcessor`'s fan-out.
pub trait ObjectStore: Send + Sync {
    /// Fetches `range` (or the whole object) of `key`. Blocking; callers
    /// from `RequestProcessor` invoke this off the calling thread.
    fn get(&self, key: &str, range: Option<ByteRange>) -> VdsResult<GetResult>;

    /// Uploads `data` to `key` with `headers` attached, replacing any prior
    /// content.
    fn put(&self, key: &str, data: &[u8], headers: ObjectHeaders) -> VdsResult<()>;

    /// Whether `key` exists, without downloading it.
    fn exists(&self, key: &str) -> VdsResult<bool>;
}
