//! Error types for `GigaVector`.
//!
//! This module provides a unified error type for all `GigaVector` operations.
//! Error codes follow the pattern `VG-XXX` for easy cross-referencing in logs
//! and wire-protocol error responses.

use thiserror::Error;

/// Result type alias for `GigaVector` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in `GigaVector` operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing argument (VG-001).
    #[error("[VG-001] Invalid argument: {0}")]
    InvalidArgument(String),

    /// Vector dimension mismatch (VG-002).
    #[error("[VG-002] Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Actual dimension.
        actual: usize,
    },

    /// Id absent or tombstoned (VG-003).
    #[error("[VG-003] Vector with id '{0}' not found")]
    NotFound(u64),

    /// Reverse/forward lookup in `PointIDMap` missing (VG-004).
    #[error("[VG-004] Point id '{0}' not found")]
    PointIdNotFound(String),

    /// Collection does not exist (VG-005).
    #[error("[VG-005] Collection '{0}' not found")]
    CollectionNotFound(String),

    /// Collection already exists (VG-006).
    #[error("[VG-006] Collection '{0}' already exists")]
    CollectionExists(String),

    /// Operation attempted on an untrained `PQCodebook` (VG-007).
    #[error("[VG-007] Codebook has not been trained")]
    NotTrained,

    /// A capacity limit was exceeded (VG-008).
    #[error("[VG-008] Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Socket or file I/O failure (VG-009).
    #[error("[VG-009] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-protocol framing error (VG-010).
    #[error("[VG-010] Protocol error: {0}")]
    Protocol(String),

    /// Configuration error (VG-011).
    #[error("[VG-011] Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure (VG-012).
    #[error("[VG-012] Serialization error: {0}")]
    Serialization(String),

    /// Invariant violation, lock poisoning, or other unexpected internal
    /// failure (VG-013).
    #[error("[VG-013] Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the stable error code (e.g. "VG-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "VG-001",
            Self::DimensionMismatch { .. } => "VG-002",
            Self::NotFound(_) => "VG-003",
            Self::PointIdNotFound(_) => "VG-004",
            Self::CollectionNotFound(_) => "VG-005",
            Self::CollectionExists(_) => "VG-006",
            Self::NotTrained => "VG-007",
            Self::CapacityExceeded(_) => "VG-008",
            Self::Io(_) => "VG-009",
            Self::Protocol(_) => "VG-010",
            Self::Config(_) => "VG-011",
            Self::Serialization(_) => "VG-012",
            Self::Internal(_) => "VG-013",
        }
    }

    /// Returns true if the connection should be kept open after this error
    /// is reported to a wire-protocol client.
    ///
    /// Per spec.md §7, only `Protocol`/`Internal` errors close the
    /// connection; everything else is reported and the connection survives.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Protocol(_) | Self::Internal(_))
    }

    /// Maps this error to a stable `i32` wire error code used in `RESPONSE`
    /// payloads (msg_type = 128). `0` is reserved for success.
    #[must_use]
    pub const fn wire_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => 1,
            Self::DimensionMismatch { .. } => 2,
            Self::NotFound(_) => 3,
            Self::PointIdNotFound(_) => 4,
            Self::CollectionNotFound(_) => 5,
            Self::CollectionExists(_) => 6,
            Self::NotTrained => 7,
            Self::CapacityExceeded(_) => 8,
            Self::Io(_) => 9,
            Self::Protocol(_) => 10,
            Self::Config(_) => 11,
            Self::Serialization(_) => 12,
            Self::Internal(_) => 13,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_matches_wire_code_ordering() {
        let e = Error::NotTrained;
        assert_eq!(e.code(), "VG-007");
        assert_eq!(e.wire_code(), 7);
    }

    #[test]
    fn protocol_and_internal_are_unrecoverable() {
        assert!(!Error::Protocol("bad frame".into()).is_recoverable());
        assert!(!Error::Internal("poisoned".into()).is_recoverable());
        assert!(Error::NotFound(1).is_recoverable());
    }
}
