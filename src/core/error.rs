//! Top-level error type for sctp-engine.
//!
//! Each layer owns its own error enum (`ChunkError`, `ReassemblyError`,
//! `AssociationError`); this type unifies them for callers that do not care
//! which layer failed.

use thiserror::Error;

use crate::chunk::ChunkError;
use crate::reassembly::ReassemblyError;

#[cfg(feature = "association")]
use crate::association::AssociationError;

/// Top-level sctp-engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Wire codec error.
    #[error("codec error: {0}")]
    Chunk(#[from] ChunkError),

    /// Reassembly error.
    #[error("reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),

    /// Association error.
    #[cfg(feature = "association")]
    #[error("association error: {0}")]
    Association(#[from] AssociationError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias using the top-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
