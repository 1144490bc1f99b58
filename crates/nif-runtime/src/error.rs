use thiserror::Error;

use crate::version::VersionNumber;

pub type NifResult<T> = Result<T, DecodeError>;

/// Errors raised while decoding a stream.
///
/// Only header problems abort a whole decode; block level failures are recovered by the
/// decoder and surface as [`DecodeDiagnostic`]s instead.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unrecognized header line {0:?}")]
    BadMagic(String),
    #[error("unsupported file version {version} (supported {min} to {max})")]
    UnsupportedVersion {
        version: VersionNumber,
        min: VersionNumber,
        max: VersionNumber,
    },
    #[error("unexpected end of stream at offset {offset} while reading {what}")]
    Truncated { offset: u64, what: &'static str },
    #[error("invalid data at offset {offset}: {message}")]
    Invalid { offset: u64, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A recovered, non-fatal problem recorded on a decoded file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodeDiagnostic {
    /// No constructor is registered for the block's type tag.
    UnknownBlockType { index: usize, type_name: String },
    /// The block's constructor failed; the block was replaced by a null placeholder.
    BlockFailed {
        index: usize,
        type_name: String,
        message: String,
    },
    /// Blocks from `first_index` on could not be located in the stream.
    Unreachable { first_index: usize, count: usize },
    /// The block consumed a different number of bytes than the size table declares.
    SizeMismatch {
        index: usize,
        declared: u32,
        consumed: u64,
    },
    /// A per-block separator that should be zero was not.
    BadSeparator { index: usize, value: u32 },
    /// The trailing root list could not be read completely.
    TruncatedRoots { read: usize, declared: u32 },
}

impl DecodeDiagnostic {
    pub fn block_index(&self) -> Option<usize> {
        match self {
            DecodeDiagnostic::UnknownBlockType { index, .. }
            | DecodeDiagnostic::BlockFailed { index, .. }
            | DecodeDiagnostic::SizeMismatch { index, .. }
            | DecodeDiagnostic::BadSeparator { index, .. } => Some(*index),
            DecodeDiagnostic::Unreachable { first_index, .. } => Some(*first_index),
            DecodeDiagnostic::TruncatedRoots { .. } => None,
        }
    }
}
