//! Unified error type for the storage engine.

use std::time::Duration;

/// Errors raised while encoding or decoding a [`crate::value::Value`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("unsupported value type tag {0}")]
    UnknownTypeTag(u8),
    #[error("map key must be a string, found type tag {0}")]
    NonStringMapKey(u8),
    #[error("malformed length prefix: {reason}")]
    MalformedLength { reason: String },
    #[error("unexpected end of buffer while decoding")]
    UnexpectedEof,
    #[error("invalid UTF-8 in string payload")]
    InvalidUtf8,
    #[error("invalid decimal digits in bigint payload: {0}")]
    InvalidBigInt(String),
}

/// Errors raised while loading or saving an [`crate::index::OffsetIndex`].
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    #[error("truncated index file")]
    Truncated,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The crate-wide error type, one variant per error kind named in the
/// storage engine's error handling design.
#[derive(thiserror::Error, Debug)]
pub enum TruckDbError {
    /// Operation attempted before the truck was initialized.
    #[error("truck not initialized")]
    NotInitialized,

    /// Encode/decode failure in the value codec.
    #[error("codec error: {0}")]
    CodecError(#[from] CodecError),

    /// CRC mismatch on a V2 record, or any other on-disk integrity failure.
    #[error("integrity error: {reason}")]
    IntegrityError { reason: String },

    /// File-level failure on open/read/write/rename/delete.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Compare-and-swap precondition failed. Callers see this as `Ok(false)`,
    /// not as an error; the variant exists for internal plumbing only.
    #[error("compare-and-swap precondition failed")]
    CasMiss,

    /// A request/response command exceeded the worker timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Raised by the value-envelope wrapper layered on top of this crate
    /// when decryption fails or no cipher is configured. The core never
    /// constructs this variant itself; it exists so that a caller-supplied
    /// envelope layer can report failures through the same error type.
    #[error("cipher error: {0}")]
    CipherError(String),

    /// The worker that owned a truck is gone (closed or evicted) and the
    /// request could not be delivered.
    #[error("truck worker unavailable")]
    WorkerGone,
}

impl From<IndexError> for TruckDbError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Truncated => TruckDbError::IntegrityError {
                reason: "index file truncated".to_string(),
            },
            IndexError::Codec(e) => TruckDbError::CodecError(e),
            IndexError::Io(e) => TruckDbError::IoError(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, TruckDbError>;
