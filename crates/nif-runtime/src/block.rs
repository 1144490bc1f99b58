use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::NifResult;
use crate::stream::{NifStream, NifString};

/// Version context threaded through every generated constructor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadContext {
    pub version: u32,
    pub user_version: u32,
    pub user_version_2: u32,
}

impl ReadContext {
    pub fn new(version: u32, user_version: u32, user_version_2: u32) -> Self {
        ReadContext {
            version,
            user_version,
            user_version_2,
        }
    }
}

/// A value that can be constructed from the stream.
///
/// Generated compounds implement this so generic compounds can read their template
/// parameter; `arg` is the constructor argument threaded down from the enclosing record.
pub trait Readable: Sized {
    fn read(stream: &mut dyn NifStream, ctx: &ReadContext, arg: i64) -> NifResult<Self>;
}

macro_rules! readable_primitive {
    ($($ty:ty => $method:ident),* $(,)?) => {
        $(
            impl Readable for $ty {
                fn read(stream: &mut dyn NifStream, _ctx: &ReadContext, _arg: i64) -> NifResult<Self> {
                    stream.$method()
                }
            }
        )*
    };
}

readable_primitive!(
    u8 => read_u8,
    i8 => read_i8,
    u16 => read_u16,
    i16 => read_i16,
    u32 => read_u32,
    i32 => read_i32,
    u64 => read_u64,
    i64 => read_i64,
    f32 => read_f32,
    char => read_char,
);

impl Readable for bool {
    fn read(stream: &mut dyn NifStream, ctx: &ReadContext, _arg: i64) -> NifResult<Self> {
        stream.read_bool(ctx.version)
    }
}

impl Readable for NifString {
    fn read(stream: &mut dyn NifStream, ctx: &ReadContext, _arg: i64) -> NifResult<Self> {
        stream.read_string(ctx)
    }
}

/// A decoded block.
///
/// Every generated object type implements this; `base` exposes the embedded supertype
/// record so callers can view a block as any of its ancestors.
pub trait NiObject: Any + fmt::Debug {
    fn block_type(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn base(&self) -> Option<&dyn NiObject> {
        None
    }
}

impl dyn NiObject {
    pub fn is<T: NiObject>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: NiObject>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Finds `T` among this block and its embedded supertypes.
    pub fn find<T: NiObject>(&self) -> Option<&T> {
        let mut cur: Option<&dyn NiObject> = Some(self);
        while let Some(obj) = cur {
            if let Some(hit) = obj.downcast_ref::<T>() {
                return Some(hit);
            }
            cur = obj.base();
        }
        None
    }

    /// Type tags from the block itself up to the root of its hierarchy.
    pub fn lineage(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        let mut cur: Option<&dyn NiObject> = Some(self);
        while let Some(obj) = cur {
            out.push(obj.block_type());
            cur = obj.base();
        }
        out
    }
}

pub type BlockReadFn = fn(&mut dyn NifStream, &ReadContext) -> NifResult<Box<dyn NiObject>>;

/// Type tag to constructor table.
///
/// Built once from generated code (one entry per concrete object type) and only read
/// while decoding.
#[derive(Clone, Default)]
pub struct BlockRegistry {
    entries: BTreeMap<&'static str, BlockReadFn>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `read` under `type_name`, returning the constructor it replaced.
    pub fn register(&mut self, type_name: &'static str, read: BlockReadFn) -> Option<BlockReadFn> {
        self.entries.insert(type_name, read)
    }

    pub fn get(&self, type_name: &str) -> Option<BlockReadFn> {
        self.entries.get(type_name).copied()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ByteStream;

    #[derive(Debug, Default)]
    struct Base {
        flags: u16,
    }

    impl NiObject for Base {
        fn block_type(&self) -> &'static str {
            "Base"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug, Default)]
    struct Leaf {
        base: Base,
        value: u32,
    }

    impl NiObject for Leaf {
        fn block_type(&self) -> &'static str {
            "Leaf"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn base(&self) -> Option<&dyn NiObject> {
            Some(&self.base)
        }
    }

    fn read_leaf(s: &mut dyn NifStream, _ctx: &ReadContext) -> NifResult<Box<dyn NiObject>> {
        let flags = s.read_u16()?;
        let value = s.read_u32()?;
        Ok(Box::new(Leaf {
            base: Base { flags },
            value,
        }))
    }

    #[test]
    fn find_walks_supertypes() {
        let leaf: Box<dyn NiObject> = Box::new(Leaf {
            base: Base { flags: 3 },
            value: 9,
        });
        assert_eq!(leaf.find::<Leaf>().map(|l| l.value), Some(9));
        assert_eq!(leaf.find::<Base>().map(|b| b.flags), Some(3));
        assert!(leaf.downcast_ref::<Base>().is_none());
        assert_eq!(leaf.lineage(), vec!["Leaf", "Base"]);
    }

    #[test]
    fn registry_dispatches_by_tag() {
        let mut reg = BlockRegistry::new();
        assert!(reg.register("Leaf", read_leaf).is_none());
        assert!(reg.contains("Leaf"));
        assert!(!reg.contains("Base"));

        let bytes = [3u8, 0, 9, 0, 0, 0];
        let mut s = ByteStream::new(&bytes);
        let read = reg.get("Leaf").unwrap();
        let obj = read(&mut s, &ReadContext::default()).unwrap();
        assert_eq!(obj.block_type(), "Leaf");
        assert_eq!(reg.type_names().collect::<Vec<_>>(), vec!["Leaf"]);
    }

    #[test]
    fn bool_reads_honour_context_version() {
        let bytes = [1u8, 0, 0, 0];
        let mut s = ByteStream::new(&bytes);
        let ctx = ReadContext::new(0x0303_000D, 0, 0);
        assert!(bool::read(&mut s, &ctx, 0).unwrap());
        assert!(s.is_empty());
    }
}
