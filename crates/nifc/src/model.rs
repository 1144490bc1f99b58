//! The resolved schema model.
//!
//! Built in two passes over the document: the first assigns ids and registers every name
//! with the [`TypeRegistry`], the second resolves field types, guards and expressions.
//! Types resolve by name, so objects may refer to each other in any order; only
//! supertypes must be declared before their subtypes.

use std::collections::BTreeMap;

use nif_runtime::VersionNumber;
use serde::Serialize;

use crate::compile::{CompileError, CompileErrorKind};
use crate::expr::{is_reserved_ident, BinaryOp, Expr};
use crate::guard::{Guard, VersionGate};
use crate::registry::{Literal, Primitive, TypeEntry, TypeRef, TypeRegistry};
use crate::schema::{Entry, FieldEntry, Scalar, SchemaDoc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntityId(pub usize);

#[derive(Debug, Clone)]
pub struct Model {
    pub entities: Vec<Entity>,
    pub versions: Vec<(String, VersionNumber)>,
    pub types: TypeRegistry,
    pub schema_sha256: String,
    pub rules_applied: Vec<String>,
    by_name: BTreeMap<String, EntityId>,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub doc: Option<String>,
    pub kind: EntityKind,
}

#[derive(Debug, Clone)]
pub enum EntityKind {
    Basic(Primitive),
    Enum(EnumDef),
    Compound(Record),
    Object(Record),
}

impl Entity {
    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            EntityKind::Basic(_) => "basic",
            EntityKind::Enum(EnumDef { bitflags: false, .. }) => "enum",
            EntityKind::Enum(EnumDef { bitflags: true, .. }) => "bitflags",
            EntityKind::Compound(_) => "compound",
            EntityKind::Object(_) => "niobject",
        }
    }

    pub fn record(&self) -> Option<&Record> {
        match &self.kind {
            EntityKind::Compound(r) | EntityKind::Object(r) => Some(r),
            _ => None,
        }
    }

    pub fn record_mut(&mut self) -> Option<&mut Record> {
        match &mut self.kind {
            EntityKind::Compound(r) | EntityKind::Object(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self.kind, EntityKind::Object(_))
    }
}

#[derive(Debug, Clone)]
pub struct EnumDef {
    pub storage: Primitive,
    pub storage_name: String,
    pub bitflags: bool,
    pub options: Vec<EnumOption>,
}

#[derive(Debug, Clone)]
pub struct EnumOption {
    pub name: String,
    pub value: i64,
    pub doc: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Record {
    pub generic: bool,
    pub packed: bool,
    pub inherit: Option<EntityId>,
    pub is_abstract: bool,
    pub fields: Vec<Field>,
    /// Supertype's visible fields (one `base` hop further away) followed by own fields.
    pub visible: Vec<VisibleField>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleField {
    pub name: String,
    pub owner: EntityId,
    pub index: usize,
    pub depth: usize,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: TypeRef,
    pub default: Option<Literal>,
    pub arr1: Option<Expr>,
    pub arr2: Option<Expr>,
    /// `arr2` names an array field holding one length per row.
    pub jagged: bool,
    pub guard: Guard,
    pub arg: Option<Expr>,
    pub calculated: bool,
    pub doc: Option<String>,
}

impl Field {
    pub fn is_array(&self) -> bool {
        self.arr1.is_some()
    }

    /// Every expression the field reads apart from its guard.
    pub fn shape_exprs(&self) -> impl Iterator<Item = &Expr> {
        self.arr1
            .iter()
            .chain(self.arr2.iter())
            .chain(self.arg.iter())
    }

    pub fn references(&self, name: &str) -> bool {
        self.guard.references(name) || self.shape_exprs().any(|e| e.references(name))
    }
}

impl Record {
    /// The field an expression identifier names: the nearest owner wins, then the first
    /// declaration.
    pub fn resolve(&self, name: &str) -> Option<&VisibleField> {
        self.visible
            .iter()
            .filter(|v| v.name == name)
            .min_by_key(|v| v.depth)
    }
}

impl Model {
    pub fn build(doc: &SchemaDoc, schema_sha256: String) -> Result<Model, CompileError> {
        let mut model = Model {
            entities: Vec::new(),
            versions: Vec::new(),
            types: TypeRegistry::new(),
            schema_sha256,
            rules_applied: Vec::new(),
            by_name: BTreeMap::new(),
        };
        model.declare(doc)?;
        model.resolve_records(doc)?;
        Ok(model)
    }

    pub fn entity(&self, id: EntityId) -> &Entity {
        &self.entities[id.0]
    }

    pub fn by_name(&self, name: &str) -> Option<&Entity> {
        self.by_name.get(name).map(|id| self.entity(*id))
    }

    pub fn record(&self, id: EntityId) -> Option<&Record> {
        self.entity(id).record()
    }

    pub fn field(&self, v: &VisibleField) -> Option<&Field> {
        self.record(v.owner).and_then(|r| r.fields.get(v.index))
    }

    pub fn objects(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter().filter(|e| e.is_object())
    }

    /// Names of the concrete objects, in declaration order.
    pub fn dispatch_names(&self) -> Vec<&str> {
        self.objects()
            .filter(|e| e.record().is_some_and(|r| !r.is_abstract))
            .map(|e| e.name.as_str())
            .collect()
    }

    /// Every object whose supertype chain passes through `id`.
    pub fn descendants(&self, id: EntityId) -> Vec<EntityId> {
        let mut out = Vec::new();
        for e in self.objects() {
            let mut cur = e.record().and_then(|r| r.inherit);
            while let Some(sup) = cur {
                if sup == id {
                    out.push(e.id);
                    break;
                }
                cur = self.record(sup).and_then(|r| r.inherit);
            }
        }
        out
    }

    fn declare(&mut self, doc: &SchemaDoc) -> Result<(), CompileError> {
        let basics: BTreeMap<&str, Primitive> = doc
            .entries
            .iter()
            .filter_map(|e| match e {
                Entry::Basic(b) => Primitive::parse(&b.primitive).map(|p| (b.name.as_str(), p)),
                _ => None,
            })
            .collect();
        let declared_at: BTreeMap<&str, usize> = doc
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !matches!(e, Entry::Version(_)))
            .map(|(i, e)| (e.name(), i))
            .collect();

        for (pos, entry) in doc.entries.iter().enumerate() {
            let id = EntityId(self.entities.len());
            let (kind, type_entry) = match entry {
                Entry::Version(v) => {
                    let num = VersionNumber::parse(&v.num).ok_or_else(|| {
                        schema_error(format!("version {}: bad number {:?}", v.id, v.num))
                    })?;
                    self.versions.push((v.id.clone(), num));
                    continue;
                }
                Entry::Basic(b) => {
                    let prim = Primitive::parse(&b.primitive).ok_or_else(|| {
                        schema_error(format!(
                            "basic {}: unknown primitive {:?}",
                            b.name, b.primitive
                        ))
                    })?;
                    (EntityKind::Basic(prim), TypeEntry::Basic(prim))
                }
                Entry::Enum(e) | Entry::Bitflags(e) => {
                    let bitflags = matches!(entry, Entry::Bitflags(_));
                    let what = if bitflags { "bitflags" } else { "enum" };
                    let storage = basics
                        .get(e.storage.as_str())
                        .copied()
                        .filter(|p| p.is_integer())
                        .ok_or_else(|| {
                            schema_error(format!(
                                "{what} {}: storage {:?} is not an integer basic",
                                e.name, e.storage
                            ))
                        })?;
                    let mut options = Vec::with_capacity(e.options.len());
                    for opt in &e.options {
                        let value = opt.value.as_i64().ok_or_else(|| {
                            schema_error(format!(
                                "{what} {}: option {} has non-integer value {:?}",
                                e.name,
                                opt.name,
                                opt.value.to_text()
                            ))
                        })?;
                        if !storage.admits_int(value) {
                            return Err(schema_error(format!(
                                "{what} {}: option {} value {value} does not fit {}",
                                e.name, opt.name, e.storage
                            )));
                        }
                        options.push(EnumOption {
                            name: opt.name.clone(),
                            value,
                            doc: opt.doc.clone(),
                        });
                    }
                    let def = EnumDef {
                        storage,
                        storage_name: e.storage.clone(),
                        bitflags,
                        options,
                    };
                    (EntityKind::Enum(def), TypeEntry::Enum { id, storage })
                }
                Entry::Compound(c) => {
                    let record = Record {
                        generic: c.generic,
                        packed: c.packed,
                        ..Record::default()
                    };
                    (
                        EntityKind::Compound(record),
                        TypeEntry::Compound {
                            id,
                            generic: c.generic,
                        },
                    )
                }
                Entry::Object(o) => {
                    let inherit = match &o.inherit {
                        None => None,
                        Some(sup) => Some(self.supertype(&o.name, sup, pos, &declared_at, doc)?),
                    };
                    let record = Record {
                        inherit,
                        is_abstract: o.is_abstract,
                        ..Record::default()
                    };
                    (EntityKind::Object(record), TypeEntry::Object { id })
                }
            };
            let name = entry.name().to_string();
            self.types.register(&name, type_entry).map_err(|e| {
                CompileError::new(e.kind, format!("{} {name}: {}", entry.kind_str(), e.message))
            })?;
            self.by_name.insert(name.clone(), id);
            self.entities.push(Entity {
                id,
                name,
                doc: entry_doc(entry),
                kind,
            });
        }
        Ok(())
    }

    fn supertype(
        &self,
        name: &str,
        sup: &str,
        pos: usize,
        declared_at: &BTreeMap<&str, usize>,
        doc: &SchemaDoc,
    ) -> Result<EntityId, CompileError> {
        match declared_at.get(sup) {
            None => Err(schema_error(format!(
                "niobject {name}: supertype {sup} is not declared"
            ))),
            Some(&at) if at >= pos => Err(CompileError::new(
                CompileErrorKind::SupertypeOrder,
                format!("niobject {name}: supertype {sup} is declared after it"),
            )),
            Some(&at) => {
                if !matches!(doc.entries[at], Entry::Object(_)) {
                    return Err(schema_error(format!(
                        "niobject {name}: supertype {sup} is not a niobject"
                    )));
                }
                self.by_name.get(sup).copied().ok_or_else(|| {
                    CompileError::new(
                        CompileErrorKind::Internal,
                        format!("niobject {name}: supertype {sup} missing from the model"),
                    )
                })
            }
        }
    }

    fn resolve_records(&mut self, doc: &SchemaDoc) -> Result<(), CompileError> {
        for entry in &doc.entries {
            let (fields, what) = match entry {
                Entry::Compound(c) => (&c.fields, "compound"),
                Entry::Object(o) => (&o.fields, "niobject"),
                _ => continue,
            };
            let Some(id) = self.by_name.get(entry.name()).copied() else {
                continue;
            };
            let ctx = format!("{what} {}", entry.name());
            let record = self.build_record(id, fields, &ctx)?;
            if let Some(slot) = self.entities[id.0].record_mut() {
                *slot = record;
            }
        }
        Ok(())
    }

    fn build_record(
        &self,
        id: EntityId,
        entries: &[FieldEntry],
        ctx: &str,
    ) -> Result<Record, CompileError> {
        let mut record = self.record(id).cloned().unwrap_or_default();
        if let Some(sup) = record.inherit.and_then(|s| self.record(s)) {
            record.visible = sup
                .visible
                .iter()
                .map(|v| VisibleField {
                    depth: v.depth + 1,
                    ..v.clone()
                })
                .collect();
        }
        for (index, f) in entries.iter().enumerate() {
            let field = self.build_field(f, record.generic).map_err(|e| {
                CompileError::new(e.kind, format!("{ctx}: field {:?}: {}", f.name, e.message))
            })?;
            record.visible.push(VisibleField {
                name: f.name.clone(),
                owner: id,
                index,
                depth: 0,
            });
            record.fields.push(field);
        }
        let jagged: Vec<bool> = record
            .fields
            .iter()
            .map(|f| is_jagged(&record.visible, &record.fields, self, f))
            .collect();
        for (field, jagged) in record.fields.iter_mut().zip(jagged) {
            field.jagged = jagged;
        }
        self.check_expressions(&record, ctx)?;
        if record.packed {
            check_packed(&record, ctx)?;
        }
        Ok(record)
    }

    fn build_field(&self, f: &FieldEntry, in_generic: bool) -> Result<Field, CompileError> {
        let ty = self
            .types
            .resolve(&f.ty, f.template.as_deref(), in_generic)?;
        let version = |s: &Option<String>, what: &str| -> Result<Option<VersionNumber>, CompileError> {
            match s {
                None => Ok(None),
                Some(text) => VersionNumber::parse(text)
                    .map(Some)
                    .ok_or_else(|| schema_error(format!("bad {what} version {text:?}"))),
            }
        };
        let cond = f.cond.as_ref().map(|c| parse_expr(c, "cond")).transpose()?;
        let vercond = match &f.vercond {
            None => None,
            Some(text) => {
                let e = parse_expr(&Scalar::Text(text.clone()), "vercond")?;
                if let Some(bad) = e.idents().into_iter().find(|i| !is_reserved_ident(i)) {
                    return Err(CompileError::new(
                        CompileErrorKind::Expression,
                        format!("vercond may only read version identifiers, found {bad:?}"),
                    ));
                }
                Some(e)
            }
        };
        let cond = match (cond, vercond) {
            (Some(c), Some(v)) => Some(Expr::binary(BinaryOp::And, c, v)),
            (c, v) => c.or(v),
        };
        let guard = Guard {
            version: VersionGate {
                since: version(&f.since, "since")?,
                until: version(&f.until, "until")?,
                user_version: f.userver,
                user_version_2: f.userver2,
            },
            cond,
        };
        let arr1 = f.arr1.as_ref().map(|e| parse_expr(e, "arr1")).transpose()?;
        let arr2 = f.arr2.as_ref().map(|e| parse_expr(e, "arr2")).transpose()?;
        if arr2.is_some() && arr1.is_none() {
            return Err(schema_error("arr2 without arr1".to_string()));
        }
        if arr1.is_some() && !ty.has_array_rule() {
            return Err(CompileError::new(
                CompileErrorKind::Registry,
                format!("type {ty} has no array read rule"),
            ));
        }
        let default = match &f.default {
            None => None,
            Some(v) if arr1.is_some() => {
                return Err(schema_error(format!(
                    "array field cannot take default {:?}",
                    v.to_text()
                )))
            }
            Some(v) => Some(self.literal_for(&ty, v)?),
        };
        Ok(Field {
            name: f.name.clone(),
            ty,
            default,
            arr1,
            arr2,
            jagged: false,
            guard,
            arg: f.arg.as_ref().map(|e| parse_expr(e, "arg")).transpose()?,
            calculated: f.calculated,
            doc: f.doc.clone(),
        })
    }

    fn literal_for(&self, ty: &TypeRef, value: &Scalar) -> Result<Literal, CompileError> {
        let bad = || schema_error(format!("default {:?} does not fit type {ty}", value.to_text()));
        let prim = match ty {
            TypeRef::Basic { prim, .. }
                if prim.is_scalar() && !matches!(prim, Primitive::Ref | Primitive::Ptr) =>
            {
                *prim
            }
            TypeRef::Enum { id, storage, .. } => {
                let named = match (value, &self.entity(*id).kind) {
                    (Scalar::Text(t), EntityKind::Enum(def)) => def
                        .options
                        .iter()
                        .find(|o| o.name == t.trim())
                        .map(|o| o.value),
                    _ => None,
                };
                let v = named.or_else(|| value.as_i64()).ok_or_else(bad)?;
                return if storage.admits_int(v) {
                    Ok(Literal::Int(v))
                } else {
                    Err(bad())
                };
            }
            _ => {
                return Err(schema_error(format!("type {ty} cannot take a default")));
            }
        };
        match prim {
            Primitive::Bool => match value {
                Scalar::Bool(b) => Ok(Literal::Int(i64::from(*b))),
                Scalar::Text(t) if t.trim() == "true" => Ok(Literal::Int(1)),
                Scalar::Text(t) if t.trim() == "false" => Ok(Literal::Int(0)),
                other => other
                    .as_i64()
                    .filter(|v| *v == 0 || *v == 1)
                    .map(Literal::Int)
                    .ok_or_else(bad),
            },
            Primitive::F32 | Primitive::F16 => match value {
                Scalar::Int(v) => Ok(Literal::Float(*v as f64)),
                Scalar::Float(v) => Ok(Literal::Float(*v)),
                Scalar::Text(t) => t.trim().parse::<f64>().map(Literal::Float).map_err(|_| bad()),
                Scalar::Bool(_) => Err(bad()),
            },
            Primitive::Char => match value {
                Scalar::Text(t) if t.chars().count() == 1 && t.is_ascii() => {
                    Ok(Literal::Int(i64::from(t.as_bytes()[0])))
                }
                other => other
                    .as_i64()
                    .filter(|v| prim.admits_int(*v))
                    .map(Literal::Int)
                    .ok_or_else(bad),
            },
            p => value
                .as_i64()
                .filter(|v| p.admits_int(*v))
                .map(Literal::Int)
                .ok_or_else(bad),
        }
    }

    fn check_expressions(&self, record: &Record, ctx: &str) -> Result<(), CompileError> {
        for field in &record.fields {
            let mut exprs: Vec<(&str, &Expr)> = Vec::new();
            if let Some(c) = &field.guard.cond {
                exprs.push(("cond", c));
            }
            if let Some(e) = &field.arr1 {
                exprs.push(("arr1", e));
            }
            if let Some(e) = &field.arr2 {
                if !field.jagged {
                    exprs.push(("arr2", e));
                }
            }
            if let Some(e) = &field.arg {
                exprs.push(("arg", e));
            }
            for (what, expr) in exprs {
                for ident in expr.idents() {
                    if is_reserved_ident(ident) {
                        continue;
                    }
                    let target = record.resolve(ident).and_then(|v| self.field_in(record, v));
                    let problem = match target {
                        None => "names no visible field",
                        Some(t) if t.is_array() || !t.ty.is_scalar() => {
                            "names a field that is not a scalar"
                        }
                        Some(_) => continue,
                    };
                    return Err(CompileError::new(
                        CompileErrorKind::Expression,
                        format!(
                            "{ctx}: field {:?}: {what} {:?}: identifier {ident:?} {problem}",
                            field.name,
                            expr.to_string()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Looks a visible field up in `record` itself when it is the owner (its fields are
    /// not in the model yet while building).
    fn field_in<'a>(&'a self, record: &'a Record, v: &VisibleField) -> Option<&'a Field> {
        if v.depth == 0 {
            record.fields.get(v.index)
        } else {
            self.field(v)
        }
    }
}

fn is_jagged(visible: &[VisibleField], fields: &[Field], model: &Model, field: &Field) -> bool {
    let Some(name) = field.arr2.as_ref().and_then(Expr::as_ident) else {
        return false;
    };
    let Some(v) = visible
        .iter()
        .filter(|v| v.name == name)
        .min_by_key(|v| v.depth)
    else {
        return false;
    };
    let target = if v.depth == 0 {
        fields.get(v.index)
    } else {
        model.field(v)
    };
    target.is_some_and(|t| {
        t.arr1.is_some()
            && t.arr2.is_none()
            && t.ty.primitive().is_some_and(Primitive::is_integer)
    })
}

fn check_packed(record: &Record, ctx: &str) -> Result<(), CompileError> {
    if record.generic {
        return Err(schema_error(format!("{ctx}: a packed compound cannot be generic")));
    }
    for f in &record.fields {
        let fixed = match &f.ty {
            TypeRef::Basic { prim, .. } | TypeRef::Enum { storage: prim, .. } => {
                prim.packed_size().is_some()
            }
            _ => false,
        };
        if !fixed {
            return Err(schema_error(format!(
                "{ctx}: packed field {:?} has variable-width type {}",
                f.name, f.ty
            )));
        }
        if !f.guard.is_always() || f.is_array() || f.calculated {
            return Err(schema_error(format!(
                "{ctx}: packed field {:?} must be unconditional, scalar and read from the stream",
                f.name
            )));
        }
    }
    Ok(())
}

/// Byte size of a packed record, with each field's offset.
pub fn packed_layout(record: &Record) -> (usize, Vec<usize>) {
    let mut offsets = Vec::with_capacity(record.fields.len());
    let mut size = 0usize;
    for f in &record.fields {
        offsets.push(size);
        size += f.ty.primitive().and_then(Primitive::packed_size).unwrap_or(0);
    }
    (size, offsets)
}

fn parse_expr(value: &Scalar, what: &str) -> Result<Expr, CompileError> {
    let text = value.to_text();
    Expr::parse(&text).map_err(|e| {
        CompileError::new(
            CompileErrorKind::Expression,
            format!("{what} {text:?}: {e}"),
        )
    })
}

fn schema_error(message: String) -> CompileError {
    CompileError::new(CompileErrorKind::Schema, message)
}

fn entry_doc(entry: &Entry) -> Option<String> {
    match entry {
        Entry::Version(_) => None,
        Entry::Basic(b) => b.doc.clone(),
        Entry::Enum(e) | Entry::Bitflags(e) => e.doc.clone(),
        Entry::Compound(c) => c.doc.clone(),
        Entry::Object(o) => o.doc.clone(),
    }
}

#[cfg(test)]
pub(crate) fn build_test_model(json: &str) -> Result<Model, CompileError> {
    let doc = crate::schema::parse_schema(json.as_bytes())?;
    Model::build(&doc, String::new())
}
