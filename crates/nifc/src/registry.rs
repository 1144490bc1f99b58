//! The primitive type registry.
//!
//! [`TypeRegistry`] maps schema type names to what they denote; [`TypeRules`] turns a
//! resolved [`TypeRef`] into target text (representation, single read, array read,
//! default literal). Both emitters go through the same rules, so a type that cannot be
//! read as an array fails the same way for every target.

use std::collections::BTreeMap;
use std::fmt;

use nif_targets::TargetId;

use crate::compile::{CompileError, CompileErrorKind};
use crate::emit_common::{c_type_ident, rust_type_ident, sanitize};
use crate::model::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Primitive {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F16,
    Char,
    Ref,
    Ptr,
    String,
    SizedString,
    ShortString,
    LineString,
    HeaderString,
    ByteBlob,
}

impl Primitive {
    pub const ALL: [Primitive; 20] = [
        Primitive::Bool,
        Primitive::U8,
        Primitive::I8,
        Primitive::U16,
        Primitive::I16,
        Primitive::U32,
        Primitive::I32,
        Primitive::U64,
        Primitive::I64,
        Primitive::F32,
        Primitive::F16,
        Primitive::Char,
        Primitive::Ref,
        Primitive::Ptr,
        Primitive::String,
        Primitive::SizedString,
        Primitive::ShortString,
        Primitive::LineString,
        Primitive::HeaderString,
        Primitive::ByteBlob,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Primitive::Bool => "bool",
            Primitive::U8 => "u8",
            Primitive::I8 => "i8",
            Primitive::U16 => "u16",
            Primitive::I16 => "i16",
            Primitive::U32 => "u32",
            Primitive::I32 => "i32",
            Primitive::U64 => "u64",
            Primitive::I64 => "i64",
            Primitive::F32 => "f32",
            Primitive::F16 => "f16",
            Primitive::Char => "char",
            Primitive::Ref => "ref",
            Primitive::Ptr => "ptr",
            Primitive::String => "string",
            Primitive::SizedString => "sized_string",
            Primitive::ShortString => "short_string",
            Primitive::LineString => "line_string",
            Primitive::HeaderString => "header_string",
            Primitive::ByteBlob => "byte_blob",
        }
    }

    pub fn parse(s: &str) -> Option<Primitive> {
        Primitive::ALL.into_iter().find(|p| p.as_str() == s.trim())
    }

    pub fn is_integer(self) -> bool {
        self.int_range().is_some()
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Primitive::I8 | Primitive::I16 | Primitive::I32 | Primitive::I64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Primitive::F32 | Primitive::F16)
    }

    /// Width of the inline length prefix a count of this type folds into.
    pub fn prefix_width(self) -> Option<PrefixWidth> {
        match self {
            Primitive::U8 | Primitive::I8 => Some(PrefixWidth::U8),
            Primitive::U16 | Primitive::I16 => Some(PrefixWidth::U16),
            Primitive::U32 | Primitive::I32 => Some(PrefixWidth::U32),
            _ => None,
        }
    }

    /// Byte size inside a packed record; `None` for variable-width encodings.
    pub fn packed_size(self) -> Option<usize> {
        match self {
            Primitive::U8 | Primitive::I8 | Primitive::Char => Some(1),
            Primitive::U16 | Primitive::I16 | Primitive::F16 => Some(2),
            Primitive::U32 | Primitive::I32 | Primitive::F32 => Some(4),
            Primitive::U64 | Primitive::I64 => Some(8),
            _ => None,
        }
    }

    /// True when a field of this type can appear in a schema expression.
    pub fn is_scalar(self) -> bool {
        self.is_integer()
            || self.is_float()
            || matches!(
                self,
                Primitive::Bool | Primitive::Char | Primitive::Ref | Primitive::Ptr
            )
    }

    pub fn has_array_rule(self) -> bool {
        !matches!(
            self,
            Primitive::LineString | Primitive::HeaderString | Primitive::ByteBlob
        )
    }

    fn int_range(self) -> Option<(i128, i128)> {
        Some(match self {
            Primitive::U8 => (0, i128::from(u8::MAX)),
            Primitive::I8 => (i128::from(i8::MIN), i128::from(i8::MAX)),
            Primitive::U16 => (0, i128::from(u16::MAX)),
            Primitive::I16 => (i128::from(i16::MIN), i128::from(i16::MAX)),
            Primitive::U32 => (0, i128::from(u32::MAX)),
            Primitive::I32 => (i128::from(i32::MIN), i128::from(i32::MAX)),
            Primitive::U64 => (0, i128::from(u64::MAX)),
            Primitive::I64 => (i128::from(i64::MIN), i128::from(i64::MAX)),
            _ => return None,
        })
    }

    /// The narrowest integer type holding every value of both `self` and `other`.
    pub fn common_integer(self, other: Primitive) -> Option<Primitive> {
        let (a_lo, a_hi) = self.int_range()?;
        let (b_lo, b_hi) = other.int_range()?;
        let (lo, hi) = (a_lo.min(b_lo), a_hi.max(b_hi));
        Some(
            [
                Primitive::U8,
                Primitive::I8,
                Primitive::U16,
                Primitive::I16,
                Primitive::U32,
                Primitive::I32,
                Primitive::U64,
                Primitive::I64,
            ]
            .into_iter()
            .find(|p| p.int_range().is_some_and(|(l, h)| l <= lo && hi <= h))
            .unwrap_or(Primitive::I64),
        )
    }

    /// True when `value` fits this integer type (wrapping `u64` literals included).
    pub fn admits_int(self, value: i64) -> bool {
        match self {
            Primitive::U64 => true,
            Primitive::Bool => value == 0 || value == 1,
            Primitive::Char => (0..=255).contains(&value),
            _ => self
                .int_range()
                .is_some_and(|(lo, hi)| (lo..=hi).contains(&i128::from(value))),
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefixWidth {
    U8,
    U16,
    U32,
}

impl PrefixWidth {
    pub fn bits(self) -> u32 {
        match self {
            PrefixWidth::U8 => 8,
            PrefixWidth::U16 => 16,
            PrefixWidth::U32 => 32,
        }
    }
}

/// A field type after name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Basic {
        name: String,
        prim: Primitive,
    },
    Enum {
        id: EntityId,
        name: String,
        storage: Primitive,
    },
    Compound {
        id: EntityId,
        name: String,
        template: Option<Box<TypeRef>>,
    },
    /// `Ref`/`Ptr` with an optional pointee object name.
    Link {
        ptr: bool,
        target: Option<String>,
    },
    /// `#T#` inside a generic compound.
    Template,
}

impl TypeRef {
    pub fn primitive(&self) -> Option<Primitive> {
        match self {
            TypeRef::Basic { prim, .. } => Some(*prim),
            TypeRef::Enum { storage, .. } => Some(*storage),
            TypeRef::Link { ptr: false, .. } => Some(Primitive::Ref),
            TypeRef::Link { ptr: true, .. } => Some(Primitive::Ptr),
            TypeRef::Compound { .. } | TypeRef::Template => None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.primitive().is_some_and(Primitive::is_scalar)
    }

    pub fn has_array_rule(&self) -> bool {
        match self {
            TypeRef::Basic { prim, .. } => prim.has_array_rule(),
            _ => true,
        }
    }

    pub fn mentions_template(&self) -> bool {
        match self {
            TypeRef::Template => true,
            TypeRef::Compound {
                template: Some(t), ..
            } => t.mentions_template(),
            _ => false,
        }
    }

    /// Replaces `#T#` with `arg`.
    pub fn substitute(&self, arg: &TypeRef) -> TypeRef {
        match self {
            TypeRef::Template => arg.clone(),
            TypeRef::Compound { id, name, template } => TypeRef::Compound {
                id: *id,
                name: name.clone(),
                template: template.as_ref().map(|t| Box::new(t.substitute(arg))),
            },
            other => other.clone(),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Basic { name, .. } | TypeRef::Enum { name, .. } => f.write_str(name),
            TypeRef::Compound {
                name,
                template: Some(t),
                ..
            } => write!(f, "{name}<{t}>"),
            TypeRef::Compound { name, .. } => f.write_str(name),
            TypeRef::Link { ptr, target } => {
                f.write_str(if *ptr { "Ptr" } else { "Ref" })?;
                match target {
                    Some(t) => write!(f, "<{t}>"),
                    None => Ok(()),
                }
            }
            TypeRef::Template => f.write_str("#T#"),
        }
    }
}

/// A validated default value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
}

impl Literal {
    pub fn as_i64(self) -> i64 {
        match self {
            Literal::Int(v) => v,
            Literal::Float(v) => v as i64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeEntry {
    Basic(Primitive),
    Enum { id: EntityId, storage: Primitive },
    Compound { id: EntityId, generic: bool },
    Object { id: EntityId },
}

pub const TEMPLATE_PARAM: &str = "#T#";

/// Schema type name table. Filled entity by entity while the model is built.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    entries: BTreeMap<String, TypeEntry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, entry: TypeEntry) -> Result<(), CompileError> {
        if name == TEMPLATE_PARAM || self.entries.contains_key(name) {
            return Err(CompileError::new(
                CompileErrorKind::Schema,
                format!("type {name:?} is declared more than once"),
            ));
        }
        self.entries.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<TypeEntry> {
        self.entries.get(name).copied()
    }

    /// Resolves a field's `type`/`template` pair.
    pub fn resolve(
        &self,
        ty: &str,
        template: Option<&str>,
        in_generic: bool,
    ) -> Result<TypeRef, CompileError> {
        if ty == TEMPLATE_PARAM {
            if !in_generic {
                return Err(schema_err(format!(
                    "{TEMPLATE_PARAM} used outside a generic compound"
                )));
            }
            return no_template(ty, template).map(|_| TypeRef::Template);
        }
        let entry = self.get(ty).ok_or_else(|| {
            CompileError::new(
                CompileErrorKind::Registry,
                format!("no registry entry for type {ty:?}"),
            )
        })?;
        match entry {
            TypeEntry::Basic(prim @ (Primitive::Ref | Primitive::Ptr)) => {
                let target = match template {
                    None => None,
                    Some(t) => match self.get(t) {
                        Some(TypeEntry::Object { .. }) => Some(t.to_string()),
                        _ => {
                            return Err(schema_err(format!(
                                "{ty} template {t:?} is not a niobject"
                            )))
                        }
                    },
                };
                Ok(TypeRef::Link {
                    ptr: prim == Primitive::Ptr,
                    target,
                })
            }
            TypeEntry::Basic(prim) => no_template(ty, template).map(|_| TypeRef::Basic {
                name: ty.to_string(),
                prim,
            }),
            TypeEntry::Enum { id, storage } => no_template(ty, template).map(|_| TypeRef::Enum {
                id,
                name: ty.to_string(),
                storage,
            }),
            TypeEntry::Compound { id, generic: false } => {
                no_template(ty, template).map(|_| TypeRef::Compound {
                    id,
                    name: ty.to_string(),
                    template: None,
                })
            }
            TypeEntry::Compound { id, generic: true } => {
                let Some(t) = template else {
                    return Err(schema_err(format!(
                        "generic compound {ty} needs a template argument"
                    )));
                };
                let arg = self.resolve_template_arg(t, in_generic)?;
                Ok(TypeRef::Compound {
                    id,
                    name: ty.to_string(),
                    template: Some(Box::new(arg)),
                })
            }
            TypeEntry::Object { .. } => Err(schema_err(format!(
                "niobject {ty} can only be reached through Ref or Ptr"
            ))),
        }
    }

    fn resolve_template_arg(&self, t: &str, in_generic: bool) -> Result<TypeRef, CompileError> {
        let arg = self.resolve(t, None, in_generic).map_err(|e| {
            CompileError::new(e.kind, format!("template argument: {}", e.message))
        })?;
        let allowed = match &arg {
            TypeRef::Template | TypeRef::Enum { .. } => true,
            TypeRef::Compound { template, .. } => template.is_none(),
            TypeRef::Basic { prim, .. } => {
                prim.is_integer()
                    || matches!(
                        prim,
                        Primitive::Bool | Primitive::F32 | Primitive::Char | Primitive::String
                    )
            }
            TypeRef::Link { .. } => false,
        };
        if !allowed {
            return Err(CompileError::new(
                CompileErrorKind::Registry,
                format!("type {t:?} cannot be a template argument"),
            ));
        }
        Ok(arg)
    }
}

fn schema_err(message: String) -> CompileError {
    CompileError::new(CompileErrorKind::Schema, message)
}

fn no_template(ty: &str, template: Option<&str>) -> Result<(), CompileError> {
    match template {
        None => Ok(()),
        Some(t) => Err(schema_err(format!(
            "type {ty} takes no template argument (got {t:?})"
        ))),
    }
}

/// The length operand of an array read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayLen<'a> {
    /// An `int64` expression already rendered for the target.
    Expr(&'a str),
    /// A length read inline, right before the elements.
    Prefix(PrefixWidth),
}

/// Per-target type information.
///
/// For Rust, reads are expressions that evaluate to the value and `dst` is ignored. For
/// C, reads are statements that store into the lvalue `dst` and set `count` for arrays.
pub trait TypeRules {
    fn target(&self) -> TargetId;
    fn repr(&self, ty: &TypeRef) -> Result<String, CompileError>;
    fn read_one(&self, ty: &TypeRef, dst: &str, arg: &str) -> Result<String, CompileError>;
    fn read_array(
        &self,
        ty: &TypeRef,
        len: ArrayLen<'_>,
        dst: &str,
        count: &str,
        arg: &str,
    ) -> Result<String, CompileError>;
    fn default_literal(&self, ty: &TypeRef, value: Literal) -> Result<String, CompileError>;
}

pub fn rules_for(target: TargetId) -> &'static dyn TypeRules {
    match target {
        TargetId::Rust => &RustRules,
        TargetId::C => &CRules,
    }
}

fn no_array_rule(ty: &TypeRef) -> CompileError {
    CompileError::new(
        CompileErrorKind::Registry,
        format!("type {ty} has no array read rule"),
    )
}

fn no_default(target: TargetId, ty: &TypeRef) -> CompileError {
    CompileError::new(
        CompileErrorKind::Emit,
        format!("{target}: type {ty} has no default literal"),
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RustRules;

impl RustRules {
    pub fn prefix_variant(width: PrefixWidth) -> &'static str {
        match width {
            PrefixWidth::U8 => "nif_runtime::LengthPrefix::U8",
            PrefixWidth::U16 => "nif_runtime::LengthPrefix::U16",
            PrefixWidth::U32 => "nif_runtime::LengthPrefix::U32",
        }
    }

    /// `read_array` around an already rendered element expression.
    pub fn array_expr(one: &str, len: ArrayLen<'_>) -> String {
        match len {
            ArrayLen::Expr(len) => {
                format!("nif_runtime::read_array(stream, {len}, |stream| Ok({one}))?")
            }
            ArrayLen::Prefix(width) => format!(
                "nif_runtime::read_prefixed_array(stream, {}, |stream| Ok({one}))?",
                Self::prefix_variant(width)
            ),
        }
    }

    fn prim_repr(prim: Primitive) -> &'static str {
        match prim {
            Primitive::Bool => "bool",
            Primitive::U8 => "u8",
            Primitive::I8 => "i8",
            Primitive::U16 => "u16",
            Primitive::I16 => "i16",
            Primitive::U32 => "u32",
            Primitive::I32 => "i32",
            Primitive::U64 => "u64",
            Primitive::I64 => "i64",
            Primitive::F32 | Primitive::F16 => "f32",
            Primitive::Char => "char",
            Primitive::Ref => "nif_runtime::Ref",
            Primitive::Ptr => "nif_runtime::Ptr",
            Primitive::String => "nif_runtime::NifString",
            Primitive::SizedString
            | Primitive::ShortString
            | Primitive::LineString
            | Primitive::HeaderString => "String",
            Primitive::ByteBlob => "Vec<u8>",
        }
    }

    fn prim_read(prim: Primitive) -> &'static str {
        match prim {
            Primitive::Bool => "stream.read_bool(ctx.version)?",
            Primitive::U8 => "stream.read_u8()?",
            Primitive::I8 => "stream.read_i8()?",
            Primitive::U16 => "stream.read_u16()?",
            Primitive::I16 => "stream.read_i16()?",
            Primitive::U32 => "stream.read_u32()?",
            Primitive::I32 => "stream.read_i32()?",
            Primitive::U64 => "stream.read_u64()?",
            Primitive::I64 => "stream.read_i64()?",
            Primitive::F32 => "stream.read_f32()?",
            Primitive::F16 => "stream.read_f16()?",
            Primitive::Char => "stream.read_char()?",
            Primitive::Ref => "nif_runtime::Ref::from_raw(stream.read_i32()?)",
            Primitive::Ptr => "nif_runtime::Ptr::from_raw(stream.read_i32()?)",
            Primitive::String => "stream.read_string(ctx)?",
            Primitive::SizedString => "stream.read_sized_string()?",
            Primitive::ShortString => "stream.read_short_string()?",
            Primitive::LineString | Primitive::HeaderString => "stream.read_line_string()?",
            Primitive::ByteBlob => {
                "{ let n = stream.read_u32()?; stream.read_counted_bytes(u64::from(n), \"byte blob\")? }"
            }
        }
    }
}

impl TypeRules for RustRules {
    fn target(&self) -> TargetId {
        TargetId::Rust
    }

    fn repr(&self, ty: &TypeRef) -> Result<String, CompileError> {
        Ok(match ty {
            TypeRef::Basic { prim, .. } => Self::prim_repr(*prim).to_string(),
            TypeRef::Enum { name, .. } => rust_type_ident(name),
            TypeRef::Compound {
                name,
                template: Some(t),
                ..
            } => format!("{}<{}>", rust_type_ident(name), self.repr(t)?),
            TypeRef::Compound { name, .. } => rust_type_ident(name),
            TypeRef::Link { ptr, target } => {
                let head = if *ptr { "nif_runtime::Ptr" } else { "nif_runtime::Ref" };
                match target {
                    Some(t) => format!("{head}<{}>", rust_type_ident(t)),
                    None => head.to_string(),
                }
            }
            TypeRef::Template => "T".to_string(),
        })
    }

    fn read_one(&self, ty: &TypeRef, _dst: &str, arg: &str) -> Result<String, CompileError> {
        Ok(match ty {
            TypeRef::Basic { prim, .. } => Self::prim_read(*prim).to_string(),
            TypeRef::Enum { name, storage, .. } => {
                format!("{}({})", rust_type_ident(name), Self::prim_read(*storage))
            }
            TypeRef::Compound {
                template: Some(_), ..
            } => format!("<{}>::read(stream, ctx, {arg})?", self.repr(ty)?),
            TypeRef::Compound { name, .. } => {
                format!("{}::read(stream, ctx, {arg})?", rust_type_ident(name))
            }
            TypeRef::Link { ptr: false, .. } => Self::prim_read(Primitive::Ref).to_string(),
            TypeRef::Link { ptr: true, .. } => Self::prim_read(Primitive::Ptr).to_string(),
            TypeRef::Template => format!("T::read(stream, ctx, {arg})?"),
        })
    }

    fn read_array(
        &self,
        ty: &TypeRef,
        len: ArrayLen<'_>,
        dst: &str,
        _count: &str,
        arg: &str,
    ) -> Result<String, CompileError> {
        if !ty.has_array_rule() {
            return Err(no_array_rule(ty));
        }
        let one = self.read_one(ty, dst, arg)?;
        Ok(Self::array_expr(&one, len))
    }

    fn default_literal(&self, ty: &TypeRef, value: Literal) -> Result<String, CompileError> {
        let prim = ty.primitive().ok_or_else(|| no_default(self.target(), ty))?;
        let lit = match (prim, value) {
            (Primitive::Bool, v) => (v.as_i64() != 0).to_string(),
            (Primitive::F32 | Primitive::F16, v) => {
                let f = match v {
                    Literal::Int(i) => i as f64,
                    Literal::Float(f) => f,
                };
                format!("{f:?}_f32")
            }
            (Primitive::Char, v) => format!("{}_u8 as char", v.as_i64()),
            (Primitive::U64, v) => (v.as_i64() as u64).to_string(),
            (p, v) if p.is_integer() => v.as_i64().to_string(),
            _ => return Err(no_default(self.target(), ty)),
        };
        Ok(match ty {
            TypeRef::Enum { name, .. } => format!("{}({lit})", rust_type_ident(name)),
            _ => lit,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CRules;

impl CRules {
    pub fn prefix_type(width: PrefixWidth) -> &'static str {
        match width {
            PrefixWidth::U8 => "uint8_t",
            PrefixWidth::U16 => "uint16_t",
            PrefixWidth::U32 => "uint32_t",
        }
    }

    pub fn prefix_reader(width: PrefixWidth) -> &'static str {
        match width {
            PrefixWidth::U8 => "nif_read_u8",
            PrefixWidth::U16 => "nif_read_u16",
            PrefixWidth::U32 => "nif_read_u32",
        }
    }

    pub fn prim_repr(prim: Primitive) -> &'static str {
        match prim {
            Primitive::Bool => "bool",
            Primitive::U8 => "uint8_t",
            Primitive::I8 => "int8_t",
            Primitive::U16 => "uint16_t",
            Primitive::I16 => "int16_t",
            Primitive::U32 => "uint32_t",
            Primitive::I32 => "int32_t",
            Primitive::U64 => "uint64_t",
            Primitive::I64 => "int64_t",
            Primitive::F32 | Primitive::F16 => "float",
            Primitive::Char => "char",
            Primitive::Ref | Primitive::Ptr => "nif_ref_t",
            Primitive::String => "nif_string_t",
            Primitive::SizedString
            | Primitive::ShortString
            | Primitive::LineString
            | Primitive::HeaderString => "nif_text_t",
            Primitive::ByteBlob => "nif_bytes_t",
        }
    }

    fn prim_read(prim: Primitive, dst: &str) -> String {
        let call = match prim {
            Primitive::Bool => return format!("NIF_TRY(nif_read_bool(s, ctx, &{dst}));"),
            Primitive::String => return format!("NIF_TRY(nif_read_string(s, ctx, &{dst}));"),
            Primitive::U8 => "nif_read_u8",
            Primitive::I8 => "nif_read_i8",
            Primitive::U16 => "nif_read_u16",
            Primitive::I16 => "nif_read_i16",
            Primitive::U32 => "nif_read_u32",
            Primitive::I32 | Primitive::Ref | Primitive::Ptr => "nif_read_i32",
            Primitive::U64 => "nif_read_u64",
            Primitive::I64 => "nif_read_i64",
            Primitive::F32 => "nif_read_f32",
            Primitive::F16 => "nif_read_f16",
            Primitive::Char => "nif_read_char",
            Primitive::SizedString => "nif_read_sized_string",
            Primitive::ShortString => "nif_read_short_string",
            Primitive::LineString | Primitive::HeaderString => "nif_read_line_string",
            Primitive::ByteBlob => "nif_read_byte_blob",
        };
        format!("NIF_TRY({call}(s, &{dst}));")
    }

    /// Name of the monomorphized C type for a concrete compound instance.
    pub fn compound_ident(name: &str, template: Option<&TypeRef>) -> Result<String, CompileError> {
        match template {
            None => Ok(c_type_ident(name)),
            Some(TypeRef::Template) => Err(CompileError::new(
                CompileErrorKind::Internal,
                format!("C backend saw an unsubstituted template in {name}"),
            )),
            Some(t) => Ok(c_type_ident(&format!("{}_{}", sanitize(name), Self::mono_suffix(t)?))),
        }
    }

    /// Keywords are escaped on the whole identifier, never inside the suffix.
    fn mono_suffix(ty: &TypeRef) -> Result<String, CompileError> {
        match ty {
            TypeRef::Basic { name, .. } | TypeRef::Enum { name, .. } => Ok(sanitize(name)),
            TypeRef::Compound {
                name,
                template: None,
                ..
            } => Ok(sanitize(name)),
            TypeRef::Compound {
                name,
                template: Some(t),
                ..
            } => Ok(format!("{}_{}", sanitize(name), Self::mono_suffix(t)?)),
            TypeRef::Link { ptr, .. } => Ok(if *ptr { "Ptr" } else { "Ref" }.to_string()),
            TypeRef::Template => Err(CompileError::new(
                CompileErrorKind::Internal,
                "C backend saw an unsubstituted template".to_string(),
            )),
        }
    }
}

impl TypeRules for CRules {
    fn target(&self) -> TargetId {
        TargetId::C
    }

    fn repr(&self, ty: &TypeRef) -> Result<String, CompileError> {
        match ty {
            TypeRef::Basic { prim, .. } => Ok(Self::prim_repr(*prim).to_string()),
            TypeRef::Enum { name, .. } => Ok(c_type_ident(name)),
            TypeRef::Compound { name, template, .. } => {
                Self::compound_ident(name, template.as_deref())
            }
            TypeRef::Link { .. } => Ok("nif_ref_t".to_string()),
            TypeRef::Template => Err(CompileError::new(
                CompileErrorKind::Internal,
                "C backend saw an unsubstituted template".to_string(),
            )),
        }
    }

    fn read_one(&self, ty: &TypeRef, dst: &str, arg: &str) -> Result<String, CompileError> {
        match ty {
            TypeRef::Basic { prim, .. } => Ok(Self::prim_read(*prim, dst)),
            TypeRef::Enum { storage, .. } => Ok(Self::prim_read(*storage, dst)),
            TypeRef::Link { .. } => Ok(Self::prim_read(Primitive::Ref, dst)),
            TypeRef::Compound { .. } => Ok(format!(
                "NIF_TRY({}_read(s, ctx, {arg}, &{dst}));",
                self.repr(ty)?
            )),
            TypeRef::Template => Err(CompileError::new(
                CompileErrorKind::Internal,
                "C backend saw an unsubstituted template".to_string(),
            )),
        }
    }

    fn read_array(
        &self,
        ty: &TypeRef,
        len: ArrayLen<'_>,
        dst: &str,
        count: &str,
        arg: &str,
    ) -> Result<String, CompileError> {
        if !ty.has_array_rule() {
            return Err(no_array_rule(ty));
        }
        let one = self.read_one(ty, &format!("({dst})[nif_i]"), arg)?;
        Ok(match len {
            ArrayLen::Expr(len) => format!("NIF_READ_ARRAY(s, {len}, {dst}, {count}, {one});"),
            ArrayLen::Prefix(width) => format!(
                "NIF_READ_PREFIXED_ARRAY(s, {}, {}, {dst}, {count}, {one});",
                Self::prefix_type(width),
                Self::prefix_reader(width)
            ),
        })
    }

    fn default_literal(&self, ty: &TypeRef, value: Literal) -> Result<String, CompileError> {
        let prim = ty.primitive().ok_or_else(|| no_default(self.target(), ty))?;
        Ok(match (prim, value) {
            (Primitive::Bool, v) => (v.as_i64() != 0).to_string(),
            (Primitive::F32 | Primitive::F16, v) => {
                let f = match v {
                    Literal::Int(i) => i as f64,
                    Literal::Float(f) => f,
                };
                format!("{f:?}f")
            }
            (Primitive::Char, v) => v.as_i64().to_string(),
            (Primitive::U64, v) => format!("{}ull", v.as_i64() as u64),
            (Primitive::I64, v) => format!("{}LL", v.as_i64()),
            (p, v) if p.is_integer() && p.is_signed() => v.as_i64().to_string(),
            (p, v) if p.is_integer() => format!("{}u", v.as_i64()),
            _ => return Err(no_default(self.target(), ty)),
        })
    }
}
