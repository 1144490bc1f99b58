//! The decode contract.
//!
//! One linear pass over one stream: header, block table, blocks in file order, then the
//! trailing root list. Only the header can fail the whole decode; every block level
//! problem is recorded as a [`DecodeDiagnostic`] and leaves a null slot behind.

use tracing::{debug, warn};

use crate::block::{BlockRegistry, NiObject, ReadContext};
use crate::error::{DecodeDiagnostic, DecodeError, NifResult};
use crate::header::Header;
use crate::refs::{Ptr, Ref};
use crate::stream::{ByteStream, NifStream, NifString};
use crate::version::known;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeState {
    Start,
    HeaderParsed,
    BlockTableResolved,
    BlocksDecoded,
    RootsResolved,
    Done,
}

impl DecodeState {
    fn next(self) -> Option<DecodeState> {
        match self {
            DecodeState::Start => Some(DecodeState::HeaderParsed),
            DecodeState::HeaderParsed => Some(DecodeState::BlockTableResolved),
            DecodeState::BlockTableResolved => Some(DecodeState::BlocksDecoded),
            DecodeState::BlocksDecoded => Some(DecodeState::RootsResolved),
            DecodeState::RootsResolved => Some(DecodeState::Done),
            DecodeState::Done => None,
        }
    }
}

/// The arena holding every decoded block. It is the sole owner; references are indices.
#[derive(Debug, Default)]
pub struct BlockArray {
    slots: Vec<Option<Box<dyn NiObject>>>,
}

impl BlockArray {
    pub fn with_len(len: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(len, || None);
        BlockArray { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Resolves a raw index. Negative (null) and out-of-range indices yield `None`.
    pub fn get_raw(&self, index: i32) -> Option<&dyn NiObject> {
        let i = usize::try_from(index).ok()?;
        self.slots.get(i)?.as_deref()
    }

    /// The one accessor for following a [`Ref`].
    pub fn get<T: ?Sized>(&self, r: Ref<T>) -> Option<&dyn NiObject> {
        self.get_raw(r.raw())
    }

    /// The one accessor for following a [`Ptr`].
    pub fn get_ptr<T: ?Sized>(&self, p: Ptr<T>) -> Option<&dyn NiObject> {
        self.get_raw(p.raw())
    }

    /// Follows `r` and views the target as `U` (itself or one of its supertypes).
    pub fn resolve<U: NiObject>(&self, r: Ref<U>) -> Option<&U> {
        self.get(r)?.find::<U>()
    }

    pub fn resolve_ptr<U: NiObject>(&self, p: Ptr<U>) -> Option<&U> {
        self.get_ptr(p)?.find::<U>()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&dyn NiObject>> + '_ {
        self.slots.iter().map(|slot| slot.as_deref())
    }

    pub fn null_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }

    fn set(&mut self, index: usize, obj: Box<dyn NiObject>) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(obj);
        }
    }
}

/// A decoded file. Owns every block; dropped as a unit.
#[derive(Debug)]
pub struct NifFile {
    pub header: Header,
    pub blocks: BlockArray,
    roots: Vec<Ref>,
    pub diagnostics: Vec<DecodeDiagnostic>,
    states: Vec<DecodeState>,
}

impl NifFile {
    pub fn decode(bytes: &[u8], registry: &BlockRegistry) -> NifResult<NifFile> {
        let mut stream = ByteStream::new(bytes);
        Decoder::new(registry).decode(&mut stream)
    }

    pub fn read_context(&self) -> ReadContext {
        self.header.read_context()
    }

    /// Unresolved root indices as stored in the file.
    pub fn root_refs(&self) -> &[Ref] {
        &self.roots
    }

    /// Resolves root `i` on demand.
    pub fn root(&self, i: usize) -> Option<&dyn NiObject> {
        self.blocks.get(*self.roots.get(i)?)
    }

    pub fn roots(&self) -> impl Iterator<Item = Option<&dyn NiObject>> + '_ {
        self.roots.iter().map(|r| self.blocks.get(*r))
    }

    /// States visited, in order.
    pub fn states(&self) -> &[DecodeState] {
        &self.states
    }

    pub fn string<'a>(&'a self, s: &'a NifString) -> Option<&'a str> {
        s.resolve(&self.header.strings)
    }
}

/// Drives one decode.
pub struct Decoder<'r> {
    registry: &'r BlockRegistry,
    state: DecodeState,
    visited: Vec<DecodeState>,
}

impl<'r> Decoder<'r> {
    pub fn new(registry: &'r BlockRegistry) -> Self {
        Decoder {
            registry,
            state: DecodeState::Start,
            visited: vec![DecodeState::Start],
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    fn advance(&mut self, to: DecodeState) -> NifResult<()> {
        if self.state.next() != Some(to) {
            return Err(DecodeError::Invalid {
                offset: 0,
                message: format!("decoder cannot move from {:?} to {to:?}", self.state),
            });
        }
        self.state = to;
        self.visited.push(to);
        Ok(())
    }

    pub fn decode(mut self, stream: &mut dyn NifStream) -> NifResult<NifFile> {
        let header = Header::read(stream)?;
        self.advance(DecodeState::HeaderParsed)?;
        debug!(
            version = %header.version,
            user_version = header.user_version,
            num_blocks = header.num_blocks,
            "header parsed"
        );

        let num_blocks = usize::try_from(header.num_blocks).unwrap_or(usize::MAX);
        let capacity = block_capacity(&header, stream.remaining());
        if capacity < num_blocks {
            warn!(num_blocks, capacity, "header declares more blocks than the stream can hold");
        }
        let mut blocks = BlockArray::with_len(num_blocks.min(capacity));
        self.advance(DecodeState::BlockTableResolved)?;

        let mut diagnostics = Vec::new();
        let located_all =
            self.decode_blocks(stream, &header, num_blocks, &mut blocks, &mut diagnostics);
        self.advance(DecodeState::BlocksDecoded)?;

        let roots = if located_all {
            read_roots(stream, &mut diagnostics)
        } else {
            Vec::new()
        };
        self.advance(DecodeState::RootsResolved)?;
        self.advance(DecodeState::Done)?;

        Ok(NifFile {
            header,
            blocks,
            roots,
            diagnostics,
            states: self.visited,
        })
    }

    /// Decodes blocks in file order. Returns false when the stream position of some block
    /// could not be determined, in which case that block and all later ones stay null.
    fn decode_blocks(
        &self,
        stream: &mut dyn NifStream,
        header: &Header,
        num_blocks: usize,
        blocks: &mut BlockArray,
        diagnostics: &mut Vec<DecodeDiagnostic>,
    ) -> bool {
        let ctx = header.read_context();
        let has_separator =
            header.version >= known::V5_0_0_1 && header.version <= known::V10_1_0_106;

        for index in 0..num_blocks {
            let type_name = if header.has_inline_type_names() {
                match stream.read_sized_string() {
                    Ok(name) => name,
                    Err(err) => {
                        warn!(index, error = %err, "cannot read inline block type");
                        give_up(index, num_blocks, diagnostics);
                        return false;
                    }
                }
            } else {
                header.block_type_name(index).unwrap_or_default().to_string()
            };

            if has_separator {
                match stream.read_u32() {
                    Ok(0) => {}
                    Ok(value) => diagnostics.push(DecodeDiagnostic::BadSeparator { index, value }),
                    Err(err) => {
                        warn!(index, error = %err, "stream ended before block");
                        give_up(index, num_blocks, diagnostics);
                        return false;
                    }
                }
            }

            let start = stream.position();
            let size = header.block_size(index);
            let read = self.registry.get(&type_name);
            let failure = match read.map(|read| read(stream, &ctx)) {
                Some(Ok(obj)) => {
                    debug!(index, type_name = %type_name, "block decoded");
                    blocks.set(index, obj);
                    None
                }
                Some(Err(err)) => {
                    warn!(index, type_name = %type_name, error = %err, "block failed to decode");
                    Some(DecodeDiagnostic::BlockFailed {
                        index,
                        type_name,
                        message: err.to_string(),
                    })
                }
                None => {
                    warn!(index, type_name = %type_name, "unknown block type");
                    Some(DecodeDiagnostic::UnknownBlockType { index, type_name })
                }
            };
            let decoded = failure.is_none();
            if let Some(diagnostic) = failure {
                diagnostics.push(diagnostic);
                if size.is_none() {
                    give_up(index + 1, num_blocks, diagnostics);
                    return false;
                }
            }

            if let Some(size) = size {
                let end = start + u64::from(size);
                let consumed = stream.position().saturating_sub(start);
                if decoded && consumed != u64::from(size) {
                    debug!(index, declared = size, consumed, "block size mismatch");
                    diagnostics.push(DecodeDiagnostic::SizeMismatch {
                        index,
                        declared: size,
                        consumed,
                    });
                }
                if stream.seek_to(end).is_err() {
                    warn!(index, end, "block size runs past end of stream");
                    give_up(index + 1, num_blocks, diagnostics);
                    return false;
                }
            }
        }
        true
    }
}

/// Most blocks the rest of the stream can hold. An inline type name takes at least four
/// bytes; otherwise the header's type table, already read, holds one entry per block.
fn block_capacity(header: &Header, remaining: u64) -> usize {
    if header.has_inline_type_names() {
        usize::try_from(remaining / 4).unwrap_or(usize::MAX)
    } else {
        header.block_type_index.len()
    }
}

fn give_up(first_index: usize, num_blocks: usize, diagnostics: &mut Vec<DecodeDiagnostic>) {
    if first_index < num_blocks {
        diagnostics.push(DecodeDiagnostic::Unreachable {
            first_index,
            count: num_blocks - first_index,
        });
    }
}

fn read_roots(stream: &mut dyn NifStream, diagnostics: &mut Vec<DecodeDiagnostic>) -> Vec<Ref> {
    let Ok(declared) = stream.read_u32() else {
        diagnostics.push(DecodeDiagnostic::TruncatedRoots {
            read: 0,
            declared: 0,
        });
        return Vec::new();
    };
    let mut roots = Vec::new();
    for _ in 0..declared {
        match stream.read_i32() {
            Ok(raw) => roots.push(Ref::from_raw(raw)),
            Err(_) => {
                diagnostics.push(DecodeDiagnostic::TruncatedRoots {
                    read: roots.len(),
                    declared,
                });
                break;
            }
        }
    }
    roots
}
