//! Rust backend.
//!
//! Emits one module against `nif_runtime`: enums and bitflags as transparent
//! newtypes, compounds and objects as structs with a `read` constructor, objects embed
//! their supertype as `base`, and `block_registry()` maps type tags to constructors.

use std::collections::BTreeSet;

use crate::compile::{CompileError, CompileErrorKind};
use crate::emit_common::{
    banner, c_escape_c_string, const_ident, doc_line, rust_field_ident, rust_type_ident,
    Layouts, Members, Writer,
};
use crate::expr::{BinaryOp, Expr, UnaryOp, USER_VERSION_2_IDENT, USER_VERSION_IDENT, VERSION_IDENT};
use crate::guard::VersionGate;
use crate::ir::{Node, Program, Test};
use crate::model::{packed_layout, EnumDef, Entity, EntityKind, Field, Record};
use crate::registry::{ArrayLen, PrefixWidth, Primitive, RustRules, TypeRef, TypeRules};

pub fn emit(program: &Program) -> Result<String, CompileError> {
    let layouts = Layouts::build(program, &RustRules, rust_field_ident, field_repr)?;
    let mut e = RustEmitter {
        program,
        layouts,
        w: Writer::new(),
    };
    e.header();
    for entity in &program.model.entities {
        if let EntityKind::Enum(def) = &entity.kind {
            e.enumeration(entity, def)?;
        }
    }
    for entity in &program.model.entities {
        if let EntityKind::Compound(record) = &entity.kind {
            e.record(entity, record)?;
        }
    }
    for entity in &program.model.entities {
        if let EntityKind::Object(record) = &entity.kind {
            e.record(entity, record)?;
        }
    }
    e.dispatch();
    Ok(e.w.finish())
}

/// Runtime names are always path-qualified; schema types routinely reuse them (`NiObject`).
const READ_PARAMS: &str =
    "stream: &mut dyn nif_runtime::NifStream, ctx: &nif_runtime::ReadContext";
const READ_RESULT: &str = "nif_runtime::NifResult<Self>";

fn field_repr(rules: &dyn TypeRules, f: &Field) -> Result<String, CompileError> {
    let one = rules.repr(&f.ty)?;
    Ok(match (f.arr1.is_some(), f.arr2.is_some()) {
        (false, _) => one,
        (true, false) => format!("Vec<{one}>"),
        (true, true) => format!("Vec<Vec<{one}>>"),
    })
}

/// `value` (of type `ty`) widened to `i64`.
fn widen(value: &str, ty: &TypeRef) -> String {
    match ty {
        TypeRef::Enum { .. } => format!("({value}.0 as i64)"),
        TypeRef::Link { .. } => format!("i64::from({value}.raw())"),
        TypeRef::Basic {
            prim: Primitive::Char,
            ..
        } => format!("i64::from(u32::from({value}))"),
        _ => format!("({value} as i64)"),
    }
}

struct RustEmitter<'p> {
    program: &'p Program,
    layouts: Layouts<'p>,
    w: Writer,
}

impl RustEmitter<'_> {
    fn header(&mut self) {
        self.w.line(&format!("// {}", banner(self.program)));
        self.w.line(
            "#![allow(clippy::all, dead_code, non_camel_case_types, non_snake_case, unused_mut, unused_parens, unused_variables)]",
        );
        let mut seen = BTreeSet::new();
        let versions: Vec<_> = self
            .program
            .model
            .versions
            .iter()
            .filter(|(id, _)| seen.insert(const_ident(id)))
            .collect();
        if !versions.is_empty() {
            self.w.blank();
            for (id, num) in versions {
                self.w.line(&format!("/// {num}"));
                self.w
                    .line(&format!("pub const {}: u32 = 0x{:08X};", const_ident(id), num.raw()));
            }
        }
    }

    fn doc(&mut self, doc: &Option<String>) {
        if let Some(d) = doc.as_deref().map(doc_line).filter(|d| !d.is_empty()) {
            self.w.line(&format!("/// {d}"));
        }
    }

    fn enumeration(&mut self, entity: &Entity, def: &EnumDef) -> Result<(), CompileError> {
        let name = rust_type_ident(&entity.name);
        let storage = RustRules.repr(&TypeRef::Basic {
            name: def.storage_name.clone(),
            prim: def.storage,
        })?;
        self.w.blank();
        self.doc(&entity.doc);
        self.w.line("#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]");
        self.w.line("#[repr(transparent)]");
        self.w.line(&format!("pub struct {name}(pub {storage});"));
        self.w.blank();
        self.w.open_block(&format!("impl {name}"));
        let mut seen = BTreeSet::new();
        for opt in &def.options {
            let mut ident = const_ident(&opt.name);
            while !seen.insert(ident.clone()) {
                ident.push('_');
            }
            self.doc(&opt.doc);
            let value = enum_value(def, opt.value);
            self.w
                .line(&format!("pub const {ident}: {name} = {name}({value});"));
        }
        if def.bitflags {
            self.w.blank();
            self.w.open_block(&format!("pub const fn bits(self) -> {storage}"));
            self.w.line("self.0");
            self.w.close_block();
            self.w.blank();
            self.w.line("/// True when every bit of `other` is set.");
            self.w
                .open_block(&format!("pub const fn contains(self, other: {name}) -> bool"));
            self.w.line("self.0 & other.0 == other.0");
            self.w.close_block();
        }
        self.w.close_block();
        if def.bitflags {
            self.w.blank();
            self.w.open_block(&format!("impl std::ops::BitOr for {name}"));
            self.w.line("type Output = Self;");
            self.w.blank();
            self.w.open_block("fn bitor(self, rhs: Self) -> Self");
            self.w.line("Self(self.0 | rhs.0)");
            self.w.close_block();
            self.w.close_block();
        }
        let read = RustRules.read_one(
            &TypeRef::Enum {
                id: entity.id,
                name: entity.name.clone(),
                storage: def.storage,
            },
            "",
            "0",
        )?;
        self.w.blank();
        self.w.open_block(&format!("impl nif_runtime::Readable for {name}"));
        self.w.open_block(&format!("fn read({READ_PARAMS}, _arg: i64) -> {READ_RESULT}"));
        self.w.line(&format!("Ok({read})"));
        self.w.close_block();
        self.w.close_block();
        Ok(())
    }

    fn record(&mut self, entity: &Entity, record: &Record) -> Result<(), CompileError> {
        let program = self.program;
        let members = self
            .layouts
            .members(entity.id)
            .cloned()
            .ok_or_else(|| internal(format!("{} has no member layout", entity.name)))?;
        let name = rust_type_ident(&entity.name);
        let (params, bounds, ty) = if record.generic {
            (
                "<T: nif_runtime::Readable>".to_string(),
                "<T: nif_runtime::Readable + Default>".to_string(),
                format!("{name}<T>"),
            )
        } else {
            (String::new(), String::new(), name.clone())
        };
        let base = record
            .inherit
            .map(|sup| rust_type_ident(&program.model.entity(sup).name));
        let marker = record.generic
            && !members
                .list
                .iter()
                .any(|m| record.fields[m.field].ty.mentions_template());
        let manual_default = members.has_defaults();

        self.w.blank();
        self.doc(&entity.doc);
        if manual_default {
            self.w.line("#[derive(Debug, Clone)]");
        } else {
            self.w.line("#[derive(Debug, Clone, Default)]");
        }
        self.w.open_block(&format!("pub struct {name}{params}"));
        if let Some(b) = &base {
            self.w.line(&format!("pub base: {b},"));
        }
        for m in &members.list {
            self.doc(&record.fields[m.field].doc);
            self.w.line(&format!("pub {}: {},", m.ident, m.repr));
        }
        if marker {
            self.w.line("_marker: std::marker::PhantomData<T>,");
        }
        self.w.close_block();

        if manual_default {
            self.w.blank();
            self.w.open_block(&format!("impl{bounds} Default for {ty}"));
            self.w.open_block("fn default() -> Self");
            self.w.open_block("Self");
            if base.is_some() {
                self.w.line("base: Default::default(),");
            }
            for m in &members.list {
                let value = match &m.default {
                    Some((t, lit)) => RustRules.default_literal(t, *lit)?,
                    None => "Default::default()".to_string(),
                };
                self.w.line(&format!("{}: {value},", m.ident));
            }
            if marker {
                self.w.line("_marker: std::marker::PhantomData,");
            }
            self.w.close_block();
            self.w.close_block();
            self.w.close_block();
        }

        self.w.blank();
        self.w.open_block(&format!("impl{bounds} {ty}"));
        self.w.open_block(&format!("pub fn read({READ_PARAMS}, arg: i64) -> {READ_RESULT}"));
        match &base {
            Some(b) => self.w.line(&format!(
                "let mut this = Self {{ base: {b}::read(stream, ctx, arg)?, ..Self::default() }};"
            )),
            None => self.w.line("let mut this = Self::default();"),
        }
        if record.packed {
            self.packed_reads(record, &members)?;
        } else {
            let compact = program.record(entity.id).cloned().unwrap_or_default();
            let cx = Cx {
                record,
                members: &members,
                entity,
            };
            self.nodes(&cx, &compact.nodes)?;
        }
        self.w.line("Ok(this)");
        self.w.close_block();
        self.w.close_block();

        self.w.blank();
        self.w.open_block(&format!("impl{bounds} nif_runtime::Readable for {ty}"));
        self.w.open_block(&format!("fn read({READ_PARAMS}, arg: i64) -> {READ_RESULT}"));
        self.w.line("Self::read(stream, ctx, arg)");
        self.w.close_block();
        self.w.close_block();

        if entity.is_object() {
            self.w.blank();
            self.w.open_block(&format!("impl nif_runtime::NiObject for {name}"));
            self.w.open_block("fn block_type(&self) -> &'static str");
            self.w
                .line(&format!("\"{}\"", c_escape_c_string(&entity.name)));
            self.w.close_block();
            self.w.blank();
            self.w.open_block("fn as_any(&self) -> &dyn std::any::Any");
            self.w.line("self");
            self.w.close_block();
            if base.is_some() {
                self.w.blank();
                self.w.open_block("fn base(&self) -> Option<&dyn nif_runtime::NiObject>");
                self.w.line("Some(&self.base)");
                self.w.close_block();
            }
            self.w.close_block();
        }
        Ok(())
    }

    fn packed_reads(&mut self, record: &Record, members: &Members) -> Result<(), CompileError> {
        let (size, offsets) = packed_layout(record);
        self.w
            .line(&format!("let packed = stream.read_packed({size})?;"));
        for (i, field) in record.fields.iter().enumerate() {
            let Some(m) = members.of_field(i) else {
                continue;
            };
            let off = offsets[i];
            let (prim, wrap) = match &field.ty {
                TypeRef::Basic { prim, .. } => (*prim, None),
                TypeRef::Enum { name, storage, .. } => (*storage, Some(rust_type_ident(name))),
                other => {
                    return Err(internal(format!("packed field of type {other}")));
                }
            };
            let get = match prim {
                Primitive::U8 => format!("packed.u8_at({off})"),
                Primitive::I8 => format!("packed.i8_at({off})"),
                Primitive::U16 => format!("packed.u16_at({off})"),
                Primitive::I16 => format!("packed.i16_at({off})"),
                Primitive::U32 => format!("packed.u32_at({off})"),
                Primitive::I32 => format!("packed.i32_at({off})"),
                Primitive::U64 => format!("packed.u64_at({off})"),
                Primitive::I64 => format!("packed.i64_at({off})"),
                Primitive::F32 => format!("packed.f32_at({off})"),
                Primitive::F16 => format!("packed.f16_at({off})"),
                Primitive::Char => format!("char::from(packed.u8_at({off}))"),
                other => return Err(internal(format!("packed field of primitive {other}"))),
            };
            let value = match wrap {
                Some(w) => format!("{w}({get})"),
                None if m.widens(field).is_some() => format!("{get} as {}", m.repr),
                None => get,
            };
            self.w.line(&format!("this.{} = {value};", m.ident));
        }
        Ok(())
    }

    fn nodes(&mut self, cx: &Cx<'_>, nodes: &[Node]) -> Result<(), CompileError> {
        for node in nodes {
            self.node(cx, node)?;
        }
        Ok(())
    }

    fn node(&mut self, cx: &Cx<'_>, node: &Node) -> Result<(), CompileError> {
        match node {
            Node::Read(read) => {
                let field = &cx.record.fields[read.field];
                let member = cx.members.of_field(read.field).ok_or_else(|| {
                    internal(format!("{}: field {:?} has no member", cx.entity.name, field.name))
                })?;
                let value = self
                    .read_value(cx, field, read.prefix.as_ref().map(|p| p.width))
                    .map_err(|e| {
                        CompileError::new(
                            e.kind,
                            format!(
                                "{} {}: field {:?}: {}",
                                cx.entity.kind_str(),
                                cx.entity.name,
                                field.name,
                                e.message
                            ),
                        )
                    })?;
                match value {
                    ReadValue::Expr(v) if member.widens(field).is_some() => self
                        .w
                        .line(&format!("this.{} = {v} as {};", member.ident, member.repr)),
                    ReadValue::Expr(v) => self.w.line(&format!("this.{} = {v};", member.ident)),
                    ReadValue::Block(lines) => {
                        self.w.open_block(&format!("this.{} =", member.ident));
                        for l in lines {
                            self.w.line(&l);
                        }
                        self.w.close_block_with("};");
                    }
                }
            }
            Node::Gate { body, .. } => {
                self.w.open_block("if stream.read_bool(ctx.version)?");
                self.nodes(cx, body)?;
                self.w.close_block();
            }
            Node::If { arms, otherwise } => {
                for (i, arm) in arms.iter().enumerate() {
                    let test = match &arm.test {
                        Test::Version(g) => version_test(g),
                        Test::Cond(e) => self.render_bool(cx, e)?,
                    };
                    if i == 0 {
                        self.w.open_block(&format!("if {test}"));
                    } else {
                        self.w.close_block_with(&format!("}} else if {test} {{"));
                        self.w.indent += 1;
                    }
                    self.nodes(cx, &arm.body)?;
                }
                if let Some(body) = otherwise {
                    self.w.close_block_with("} else {");
                    self.w.indent += 1;
                    self.nodes(cx, body)?;
                }
                self.w.close_block();
            }
            Node::Switch {
                on,
                cases,
                otherwise,
            } => {
                let on = self.render_int(cx, on)?;
                self.w.open_block(&format!("match {on}"));
                for case in cases {
                    self.w.open_block(&format!("{} =>", case.value));
                    self.nodes(cx, &case.body)?;
                    self.w.close_block();
                }
                match otherwise {
                    Some(body) => {
                        self.w.open_block("_ =>");
                        self.nodes(cx, body)?;
                        self.w.close_block();
                    }
                    None => self.w.line("_ => {}"),
                }
                self.w.close_block();
            }
        }
        Ok(())
    }

    fn read_value(
        &self,
        cx: &Cx<'_>,
        field: &Field,
        prefix: Option<PrefixWidth>,
    ) -> Result<ReadValue, CompileError> {
        let arg = match &field.arg {
            Some(a) => self.render_int(cx, a)?,
            None => "0".to_string(),
        };
        let Some(arr1) = &field.arr1 else {
            return Ok(ReadValue::Expr(RustRules.read_one(&field.ty, "", &arg)?));
        };
        if let Some(width) = prefix {
            return Ok(ReadValue::Expr(RustRules.read_array(
                &field.ty,
                ArrayLen::Prefix(width),
                "",
                "",
                &arg,
            )?));
        }
        let rows = self.render_int(cx, arr1)?;
        let Some(arr2) = &field.arr2 else {
            return Ok(ReadValue::Expr(RustRules.read_array(
                &field.ty,
                ArrayLen::Expr(&rows),
                "",
                "",
                &arg,
            )?));
        };
        let inner = RustRules.read_array(&field.ty, ArrayLen::Expr("cols"), "", "", &arg)?;
        let inner = inner.trim_end_matches('?');
        if field.jagged {
            let lens = arr2
                .as_ident()
                .ok_or_else(|| internal("jagged array without a lengths field".to_string()))?;
            let (path, lens_field) = self.layouts.access(cx.record, lens)?;
            let n = widen("(*n)", &lens_field.ty);
            Ok(ReadValue::Block(vec![
                "let mut row = 0usize;".to_string(),
                format!("nif_runtime::read_array(stream, {rows}, |stream| {{"),
                format!("    let cols = this.{path}.get(row).map_or(0, |n| {n});"),
                "    row += 1;".to_string(),
                format!("    {inner}"),
                "})?".to_string(),
            ]))
        } else {
            let cols = self.render_int(cx, arr2)?;
            Ok(ReadValue::Block(vec![
                format!("let cols = {cols};"),
                format!("nif_runtime::read_array(stream, {rows}, |stream| {inner})?"),
            ]))
        }
    }

    fn render_int(&self, cx: &Cx<'_>, e: &Expr) -> Result<String, CompileError> {
        Ok(match e {
            Expr::Int(v) if *v < 0 => format!("({v}_i64)"),
            Expr::Int(v) => format!("{v}_i64"),
            Expr::Version(v) => format!("0x{v:08X}_i64"),
            Expr::Arg => "arg".to_string(),
            Expr::Ident(name) => match name.as_str() {
                VERSION_IDENT => "i64::from(ctx.version)".to_string(),
                USER_VERSION_IDENT => "i64::from(ctx.user_version)".to_string(),
                USER_VERSION_2_IDENT => "i64::from(ctx.user_version_2)".to_string(),
                _ => {
                    let (path, field) = self.layouts.access(cx.record, name)?;
                    widen(&format!("this.{path}"), &field.ty)
                }
            },
            Expr::Unary(UnaryOp::Neg, inner) => {
                format!("{}.wrapping_neg()", self.render_int(cx, inner)?)
            }
            Expr::Unary(UnaryOp::Not, _) => format!("i64::from({})", self.render_bool(cx, e)?),
            Expr::Binary(op, _, _) if op.is_boolean() => {
                format!("i64::from({})", self.render_bool(cx, e)?)
            }
            Expr::Binary(op, l, r) => {
                let a = self.render_int(cx, l)?;
                let b = self.render_int(cx, r)?;
                match op {
                    BinaryOp::Mul => format!("{a}.wrapping_mul({b})"),
                    BinaryOp::Div => format!("{a}.checked_div({b}).unwrap_or(0)"),
                    BinaryOp::Rem => format!("{a}.checked_rem({b}).unwrap_or(0)"),
                    BinaryOp::Add => format!("{a}.wrapping_add({b})"),
                    BinaryOp::Sub => format!("{a}.wrapping_sub({b})"),
                    BinaryOp::Shl => format!("{a}.wrapping_shl({b} as u32)"),
                    BinaryOp::Shr => format!("{a}.wrapping_shr({b} as u32)"),
                    BinaryOp::BitAnd => format!("({a} & {b})"),
                    BinaryOp::BitXor => format!("({a} ^ {b})"),
                    BinaryOp::BitOr => format!("({a} | {b})"),
                    other => {
                        return Err(internal(format!("operator {} as integer", other.as_str())))
                    }
                }
            }
        })
    }

    fn render_bool(&self, cx: &Cx<'_>, e: &Expr) -> Result<String, CompileError> {
        Ok(match e {
            Expr::Unary(UnaryOp::Not, inner) => format!("!{}", self.render_bool(cx, inner)?),
            Expr::Binary(op @ (BinaryOp::And | BinaryOp::Or), l, r) => format!(
                "({} {} {})",
                self.render_bool(cx, l)?,
                op.as_str(),
                self.render_bool(cx, r)?
            ),
            Expr::Binary(op, l, r) if op.is_boolean() => format!(
                "({} {} {})",
                self.render_int(cx, l)?,
                op.as_str(),
                self.render_int(cx, r)?
            ),
            _ => format!("({} != 0)", self.render_int(cx, e)?),
        })
    }

    fn dispatch(&mut self) {
        let names = self.program.model.dispatch_names();
        self.w.blank();
        self.w.open_block(&format!(
            "fn read_block<T: nif_runtime::NiObject + nif_runtime::Readable>({READ_PARAMS}) -> nif_runtime::NifResult<Box<dyn nif_runtime::NiObject>>"
        ));
        self.w.line("Ok(Box::new(T::read(stream, ctx, 0)?))");
        self.w.close_block();
        self.w.blank();
        self.w.line("/// Constructors of every concrete block type, keyed by type tag.");
        self.w.open_block("pub fn block_registry() -> nif_runtime::BlockRegistry");
        self.w.line("let mut registry = nif_runtime::BlockRegistry::new();");
        for name in names {
            self.w.line(&format!(
                "registry.register(\"{}\", read_block::<{}>);",
                c_escape_c_string(name),
                rust_type_ident(name)
            ));
        }
        self.w.line("registry");
        self.w.close_block();
    }
}

/// The record a node tree belongs to.
struct Cx<'a> {
    record: &'a Record,
    members: &'a Members,
    entity: &'a Entity,
}

enum ReadValue {
    Expr(String),
    /// Lines of a block expression.
    Block(Vec<String>),
}

fn enum_value(def: &EnumDef, value: i64) -> String {
    if def.bitflags && value > 0 && value & (value - 1) == 0 {
        return format!("1 << {}", value.trailing_zeros());
    }
    match def.storage {
        Primitive::U64 => (value as u64).to_string(),
        _ => value.to_string(),
    }
}

fn version_test(g: &VersionGate) -> String {
    let mut parts = Vec::new();
    if let Some(v) = g.since {
        parts.push(format!("ctx.version >= 0x{:08X}", v.raw()));
    }
    if let Some(v) = g.until {
        parts.push(format!("ctx.version <= 0x{:08X}", v.raw()));
    }
    if let Some(v) = g.user_version {
        parts.push(format!("ctx.user_version == {v}"));
    }
    if let Some(v) = g.user_version_2 {
        parts.push(format!("ctx.user_version_2 == {v}"));
    }
    if parts.is_empty() {
        "true".to_string()
    } else {
        parts.join(" && ")
    }
}

fn internal(message: String) -> CompileError {
    CompileError::new(CompileErrorKind::Internal, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact::compact_model;
    use crate::model::build_test_model;

    fn emit_schema(entries: &str) -> String {
        let json = format!(
            r#"{{"schema_version": "nifschema.schema@0.1.0", "entries": [
                {{"kind": "version", "id": "V20_2_0_7", "num": "20.2.0.7"}},
                {{"kind": "basic", "name": "bool", "primitive": "bool"}},
                {{"kind": "basic", "name": "byte", "primitive": "u8"}},
                {{"kind": "basic", "name": "ushort", "primitive": "u16"}},
                {{"kind": "basic", "name": "uint", "primitive": "u32"}},
                {{"kind": "basic", "name": "float", "primitive": "f32"}},
                {{"kind": "basic", "name": "string", "primitive": "string"}},
                {{"kind": "basic", "name": "Ref", "primitive": "ref"}},
                {entries}
            ]}}"#
        );
        let model = build_test_model(&json).unwrap();
        emit(&compact_model(model).unwrap()).unwrap()
    }

    #[test]
    fn banner_and_version_constants() {
        let out = emit_schema(r#"{"kind": "compound", "name": "Empty"}"#);
        assert!(out.starts_with("// @generated by nifc from nifschema.schema@0.1.0"));
        assert!(out.contains("pub const V20_2_0_7: u32 = 0x14020007;"));
        assert!(!out.contains("use nif_runtime"));
    }

    #[test]
    fn enums_and_bitflags_are_newtypes() {
        let out = emit_schema(
            r#"{"kind": "enum", "name": "AlphaFormat", "storage": "uint",
                "options": [{"name": "ALPHA_NONE", "value": 0}, {"name": "ALPHA_BINARY", "value": 1}]},
               {"kind": "bitflags", "name": "VertexAttribute", "storage": "ushort",
                "options": [{"name": "None", "value": 0}, {"name": "Vertex", "value": "0x1"},
                            {"name": "Normals", "value": "0x8"}, {"name": "Both", "value": 9}]}"#,
        );
        assert!(out.contains("pub struct AlphaFormat(pub u32);"));
        assert!(out.contains("pub const ALPHA_BINARY: AlphaFormat = AlphaFormat(1);"));
        assert!(out.contains("pub const NONE: VertexAttribute = VertexAttribute(0);"));
        assert!(out.contains("pub const NORMALS: VertexAttribute = VertexAttribute(1 << 3);"));
        assert!(out.contains("pub const BOTH: VertexAttribute = VertexAttribute(9);"));
        assert!(out.contains("impl std::ops::BitOr for VertexAttribute"));
        assert!(out.contains("Ok(AlphaFormat(stream.read_u32()?))"));
    }

    #[test]
    fn folded_counts_and_gates() {
        let out = emit_schema(
            r#"{"kind": "compound", "name": "Data", "fields": [
                {"name": "Num Vertices", "type": "ushort"},
                {"name": "Vertices", "type": "float", "arr1": "Num Vertices"},
                {"name": "Has Normals", "type": "bool"},
                {"name": "Normals", "type": "float", "arr1": 3, "cond": "Has Normals"},
                {"name": "Center", "type": "float", "cond": "Has Normals"}
            ]}"#,
        );
        assert!(!out.contains("num_vertices"));
        assert!(!out.contains("has_normals"));
        assert!(out.contains(
            "this.vertices = nif_runtime::read_prefixed_array(stream, nif_runtime::LengthPrefix::U16, |stream| Ok(stream.read_f32()?))?;"
        ));
        assert_eq!(out.matches("stream.read_bool(ctx.version)?").count(), 1);
        assert!(out.contains(
            "this.normals = nif_runtime::read_array(stream, 3_i64, |stream| Ok(stream.read_f32()?))?;"
        ));
    }

    #[test]
    fn switch_and_version_branches() {
        let out = emit_schema(
            r#"{"kind": "compound", "name": "Data", "fields": [
                {"name": "Kind", "type": "uint"},
                {"name": "A", "type": "float", "cond": "Kind == 0"},
                {"name": "B", "type": "uint", "cond": "Kind == 1"},
                {"name": "Flags", "type": "ushort", "until": "20.2.0.6"},
                {"name": "Flags", "type": "uint", "since": "20.2.0.7"}
            ]}"#,
        );
        assert!(out.contains("match (this.kind as i64) {"));
        assert!(out.contains("0 => {"));
        assert!(out.contains("_ => {}"));
        assert!(out.contains("if ctx.version <= 0x14020006 {"));
        assert!(out.contains("} else {"));
        assert!(out.contains("pub flags: u32,"));
        assert!(out.contains("this.flags = stream.read_u16()? as u32;"));
        assert!(!out.contains("flags_2"));
    }

    #[test]
    fn version_variants_of_one_name_share_a_widened_member() {
        let out = emit_schema(
            r#"{"kind": "niobject", "name": "NiObject", "abstract": true},
               {"kind": "niobject", "name": "Av", "inherit": "NiObject", "abstract": true, "fields": [
                {"name": "Flags", "type": "ushort", "until": "20.2.0.6", "default": 14},
                {"name": "Flags", "type": "uint", "since": "20.2.0.7", "default": 14}]},
               {"kind": "niobject", "name": "Node", "inherit": "Av", "fields": [
                {"name": "Extra", "type": "float", "cond": "Flags & 1"}]}"#,
        );
        assert!(out.contains("pub flags: u32,"));
        assert!(!out.contains("flags_2"));
        assert!(out.contains("flags: 14,"));
        assert!(out.contains("this.flags = stream.read_u16()? as u32;"));
        assert!(out.contains("this.flags = stream.read_u32()?;"));
        assert!(out.contains("if (((this.base.flags as i64) & 1_i64) != 0) {"));
        assert!(out.contains("impl nif_runtime::NiObject for NiObject"));
    }

    #[test]
    fn objects_embed_base_and_register() {
        let out = emit_schema(
            r#"{"kind": "niobject", "name": "NiObject", "abstract": true},
               {"kind": "niobject", "name": "NiObjectNET", "inherit": "NiObject", "abstract": true,
                "fields": [{"name": "Name", "type": "string"}, {"name": "Flags", "type": "ushort", "default": 14}]},
               {"kind": "niobject", "name": "NiNode", "inherit": "NiObjectNET",
                "fields": [{"name": "Children", "type": "Ref", "template": "NiNode", "arr1": 2,
                            "cond": "Flags & 1"}]}"#,
        );
        assert!(out.contains("pub base: NiObjectNET,"));
        assert!(out.contains("pub children: Vec<nif_runtime::Ref<NiNode>>,"));
        assert!(out.contains("flags: 14,"));
        assert!(out.contains("if (((this.base.flags as i64) & 1_i64) != 0) {"));
        assert!(out.contains("impl nif_runtime::NiObject for NiNode"));
        assert!(out.contains("impl nif_runtime::NiObject for NiObject"));
        assert!(out.contains("fn base(&self) -> Option<&dyn nif_runtime::NiObject>"));
        assert!(!out.contains("impl NiObject for"));
        assert!(!out.contains("dyn NiObject>"));
        assert!(out.contains("registry.register(\"NiNode\", read_block::<NiNode>);"));
        assert!(!out.contains("registry.register(\"NiObjectNET\""));
        assert!(out.contains("let mut this = Self { base: NiObjectNET::read(stream, ctx, arg)?, ..Self::default() };"));
    }

    #[test]
    fn packed_and_generic_compounds() {
        let out = emit_schema(
            r##"{"kind": "compound", "name": "TexCoord", "packed": true,
                "fields": [{"name": "u", "type": "float"}, {"name": "v", "type": "float"}]},
               {"kind": "compound", "name": "Key", "generic": true,
                "fields": [{"name": "Time", "type": "float"}, {"name": "Value", "type": "#T#"}]},
               {"kind": "compound", "name": "Track",
                "fields": [{"name": "Keys", "type": "Key", "template": "float", "arr1": 2}]}"##,
        );
        assert!(out.contains("let packed = stream.read_packed(8)?;"));
        assert!(out.contains("this.v = packed.f32_at(4);"));
        assert!(out.contains("pub struct Key<T: nif_runtime::Readable> {"));
        assert!(out.contains("impl<T: nif_runtime::Readable + Default> Key<T> {"));
        assert!(out.contains("this.value = T::read(stream, ctx, 0)?;"));
        assert!(out.contains("pub keys: Vec<Key<f32>>,"));
    }

    #[test]
    fn jagged_arrays_read_row_by_row() {
        let out = emit_schema(
            r#"{"kind": "compound", "name": "Strips", "fields": [
                {"name": "Num Strips", "type": "ushort"},
                {"name": "Strip Lengths", "type": "ushort", "arr1": "Num Strips"},
                {"name": "Points", "type": "ushort", "arr1": "Num Strips", "arr2": "Strip Lengths"}
            ]}"#,
        );
        assert!(out.contains("let cols = this.strip_lengths.get(row).map_or(0, |n| ((*n) as i64));"));
        assert!(out.contains("nif_runtime::read_array(stream, (this.num_strips as i64), |stream| {"));
    }
}
