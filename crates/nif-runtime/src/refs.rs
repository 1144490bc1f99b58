//! Nullable indices into the block array.
//!
//! `Ref` conventionally points at a child (usually a later block) and `Ptr` at a parent
//! (usually an earlier one). Both decode identically: a signed 32-bit index where any
//! negative value is null. Neither is ever turned into a native reference; they are
//! resolved through [`crate::BlockArray::get`] on demand.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::block::{ReadContext, Readable};
use crate::error::NifResult;
use crate::stream::NifStream;

macro_rules! block_index_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name<T: ?Sized = dyn crate::block::NiObject> {
            index: i32,
            _pointee: PhantomData<fn() -> Box<T>>,
        }

        impl<T: ?Sized> $name<T> {
            pub const NULL: Self = Self::from_raw(-1);

            pub const fn from_raw(index: i32) -> Self {
                Self {
                    index,
                    _pointee: PhantomData,
                }
            }

            pub const fn raw(self) -> i32 {
                self.index
            }

            pub const fn is_null(self) -> bool {
                self.index < 0
            }

            /// The array index, or `None` for the null sentinel.
            pub fn index(self) -> Option<usize> {
                usize::try_from(self.index).ok()
            }

            /// Forgets the pointee type.
            pub const fn erase(self) -> $name {
                $name::from_raw(self.index)
            }
        }

        impl<T: ?Sized> Clone for $name<T> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T: ?Sized> Copy for $name<T> {}

        impl<T: ?Sized> Default for $name<T> {
            fn default() -> Self {
                Self::NULL
            }
        }

        impl<T: ?Sized> PartialEq for $name<T> {
            fn eq(&self, other: &Self) -> bool {
                self.index == other.index
            }
        }

        impl<T: ?Sized> Eq for $name<T> {}

        impl<T: ?Sized> Hash for $name<T> {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.index.hash(state);
            }
        }

        impl<T: ?Sized> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_null() {
                    write!(f, "{}(null)", stringify!($name))
                } else {
                    write!(f, "{}({})", stringify!($name), self.index)
                }
            }
        }

        impl<T: ?Sized> Readable for $name<T> {
            fn read(stream: &mut dyn NifStream, _ctx: &ReadContext, _arg: i64) -> NifResult<Self> {
                Ok(Self::from_raw(stream.read_i32()?))
            }
        }
    };
}

block_index_type!(
    /// Reference to a (conventionally later) block, owned by the referencing block.
    Ref
);

block_index_type!(
    /// Back pointer to a (conventionally earlier) block.
    Ptr
);
