// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Error kinds raised anywhere in the OpenVDS core, see spec §7.
///
/// The variant names line up 1:1 with the "Kind" column of the error table so
/// that a caller can match on `kind()` without string comparison.
#[derive(thiserror::Error, Debug)]
pub enum VdsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported compression method: {0}")]
    UnsupportedCompression(String),

    #[error("layer is not produced: {0}")]
    ProduceStatusUnavailable(String),

    #[error("object store transport error: {0}")]
    ObjectStoreTransport(String),

    #[error("failed to fetch metadata page {page_index} of layer {layer}: {message}")]
    MetadataPageFetch {
        layer: String,
        page_index: u32,
        message: String,
    },

    #[error("chunk corruption: {0}")]
    ChunkCorruption(String),

    #[error("metadata entry mismatch: {0}")]
    InconsistentMetadata(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation was canceled")]
    Canceled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VdsError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        VdsError::InvalidArgument(msg.into())
    }

    pub fn chunk_corruption(msg: impl Into<String>) -> Self {
        VdsError::ChunkCorruption(msg.into())
    }

    /// Short, stable tag used in logs and by tests; mirrors the `Kind` column
    /// of the error table rather than the human-readable `Display` text.
    pub fn kind(&self) -> &'static str {
        match self {
            VdsError::InvalidArgument(_) => "InvalidArgument",
            VdsError::UnsupportedCompression(_) => "UnsupportedCompression",
            VdsError::ProduceStatusUnavailable(_) => "ProduceStatusUnavailable",
            VdsError::ObjectStoreTransport(_) => "ObjectStoreTransport",
            VdsError::MetadataPageFetch { .. } => "MetadataPageFetch",
            VdsError::ChunkCorruption(_) => "ChunkCorruption",
            VdsError::InconsistentMetadata(_) => "InconsistentMetadata",
            VdsError::Timeout => "Timeout",
            VdsError::Canceled => "Canceled",
            VdsError::Io(_) => "Io",
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, VdsError::Canceled)
    }
}

impl Clone for VdsError {
    fn clone(&self) -> Self {
        // io::Error isn't Clone; downgrade to a message-only Io variant so the
        // error can still be parked on shared job/page state (§5 "sticky" errors).
        match self {
            VdsError::InvalidArgument(s) => VdsError::InvalidArgument(s.clone()),
            VdsError::UnsupportedCompression(s) => VdsError::UnsupportedCompression(s.clone()),
            VdsError::ProduceStatusUnavailable(s) => VdsError::ProduceStatusUnavailable(s.clone()),
            VdsError::ObjectStoreTransport(s) => VdsError::ObjectStoreTransport(s.clone()),
            VdsError::MetadataPageFetch {
                layer,
                page_index,
                message,
            } => VdsError::MetadataPageFetch {
                layer: layer.clone(),
                page_index: *page_index,
                message: message.clone(),
            },
            VdsError::ChunkCorruption(s) => VdsError::ChunkCorruption(s.clone()),
            VdsError::InconsistentMetadata(s) => VdsError::InconsistentMetadata(s.clone()),
            VdsError::Timeout => VdsError::Timeout,
            VdsError::Canceled => VdsError::Canceled,
            VdsError::Io(e) => VdsError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

pub type VdsResult<T> = std::result::Result<T, VdsError>;

/// A FIFO of errors observed on uploads, surfaced by `AccessManager`
/// (spec §4.10, §7 "Upload errors are not thrown; they accumulate").
#[derive(Default)]
pub struct ErrorFifo {
    errors: std::sync::Mutex<std::collections::VecDeque<VdsError>>,
}

impl ErrorFifo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, err: VdsError) {
        let mut guard = self.errors.lock().unwrap();
        guard.push_back(err);
    }

    pub fn count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    pub fn current(&self) -> Option<String> {
        self.errors.lock().unwrap().front().map(|e| e.to_string())
    }

    pub fn clear(&self) -> Option<VdsError> {
        self.errors.lock().unwrap().pop_front()
    }

    pub fn force_clear_all(&self) {
        self.errors.lock().unwrap().clear();
    }
}

impl fmt::Debug for ErrorFifo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorFifo({} pending)", self.count())
    }
}
