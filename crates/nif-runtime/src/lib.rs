//! Runtime support for generated Gamebryo/NetImmerse readers.
//!
//! Generated code builds on [`NifStream`], [`Readable`], [`NiObject`] and
//! [`BlockRegistry`], always naming them by full path; [`NifFile::decode`] drives a whole
//! file through a registry.

pub mod block;
pub mod decode;
pub mod error;
pub mod header;
pub mod packed;
pub mod refs;
pub mod stream;
pub mod version;

pub use block::{BlockReadFn, BlockRegistry, NiObject, ReadContext, Readable};
pub use decode::{BlockArray, DecodeState, Decoder, NifFile};
pub use error::{DecodeDiagnostic, DecodeError, NifResult};
pub use header::{BsStreamHeader, Header};
pub use packed::Packed;
pub use refs::{Ptr, Ref};
pub use stream::{
    read_array, read_prefixed_array, ByteStream, Endian, LengthPrefix, NifStream, NifString,
};
pub use version::{known, VersionNumber};
