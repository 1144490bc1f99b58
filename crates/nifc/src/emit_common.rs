//! Pieces shared by the Rust and C emitters: the line writer, identifier spelling and
//! the member layout of a record.

use std::collections::BTreeMap;

use nif_contracts::{GENERATED_BY, NIFSCHEMA_SCHEMA_VERSION};

use crate::compile::{CompileError, CompileErrorKind};
use crate::ir::{CompactRecord, Program};
use crate::model::{EntityId, Field, Record, VisibleField};
use crate::registry::{Literal, Primitive, TypeRef, TypeRules};

#[derive(Debug, Default)]
pub struct Writer {
    pub out: String,
    pub indent: usize,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&mut self, s: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(s);
        self.out.push('\n');
    }

    pub fn blank(&mut self) {
        self.out.push('\n');
    }

    /// Writes `head {` and indents.
    pub fn open_block(&mut self, head: &str) {
        if head.is_empty() {
            self.line("{");
        } else {
            self.line(&format!("{head} {{"));
        }
        self.indent += 1;
    }

    pub fn close_block(&mut self) {
        self.close_block_with("}");
    }

    /// Dedents and writes `text` (`} else {`, `};`, ...).
    pub fn close_block_with(&mut self, text: &str) {
        self.indent = self.indent.saturating_sub(1);
        self.line(text);
    }

    pub fn finish(self) -> String {
        self.out
    }
}

pub fn banner(program: &Program) -> String {
    format!(
        "@generated by {GENERATED_BY} from {NIFSCHEMA_SCHEMA_VERSION} schema sha256:{}. Do not edit.",
        program.model.schema_sha256
    )
}

const RUST_KEYWORDS: &[&str] = &[
    "abstract", "as", "async", "await", "become", "box", "break", "const", "continue", "crate",
    "do", "dyn", "else", "enum", "extern", "false", "final", "fn", "for", "if", "impl", "in",
    "let", "loop", "macro", "match", "mod", "move", "mut", "override", "priv", "pub", "ref",
    "return", "self", "static", "struct", "super", "trait", "true", "try", "type", "typeof",
    "unsafe", "unsized", "use", "virtual", "where", "while", "yield",
];

const C_KEYWORDS: &[&str] = &[
    "auto", "bool", "break", "case", "char", "const", "continue", "default", "do", "double",
    "else", "enum", "extern", "false", "float", "for", "goto", "if", "inline", "int", "long",
    "register", "restrict", "return", "short", "signed", "sizeof", "static", "struct",
    "switch", "true", "typedef", "union", "unsigned", "void", "volatile", "while",
];

pub fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Type names keep their schema spelling apart from characters no identifier allows.
pub fn rust_type_ident(name: &str) -> String {
    let ident = sanitize(name);
    if RUST_KEYWORDS.contains(&ident.as_str()) || ident == "Self" {
        format!("{ident}_")
    } else {
        ident
    }
}

pub fn c_type_ident(name: &str) -> String {
    let ident = sanitize(name);
    if C_KEYWORDS.contains(&ident.as_str()) {
        format!("{ident}_")
    } else {
        ident
    }
}

/// Splits on anything but letters and digits and at case changes, keeping acronyms whole
/// (`Num UV Sets` is `Num`, `UV`, `Sets`).
fn words(name: &str) -> Vec<String> {
    let mut out = Vec::new();
    for chunk in name.split(|c: char| !c.is_ascii_alphanumeric()) {
        let chars: Vec<char> = chunk.chars().collect();
        let mut word = String::new();
        for (i, &c) in chars.iter().enumerate() {
            if c.is_ascii_uppercase() && i > 0 {
                let prev = chars[i - 1];
                let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
                if !prev.is_ascii_uppercase() || next_lower {
                    out.push(std::mem::take(&mut word));
                }
            }
            word.push(c);
        }
        out.push(word);
    }
    out.retain(|w| !w.is_empty());
    out
}

fn snake(name: &str) -> String {
    let s = words(name)
        .iter()
        .map(|w| w.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("_");
    if s.is_empty() {
        "field".to_string()
    } else if s.starts_with(|c: char| c.is_ascii_digit()) {
        format!("f_{s}")
    } else {
        s
    }
}

pub fn rust_field_ident(name: &str) -> String {
    let s = snake(name);
    if RUST_KEYWORDS.contains(&s.as_str()) {
        format!("{s}_")
    } else {
        s
    }
}

pub fn c_field_ident(name: &str) -> String {
    let s = snake(name);
    if C_KEYWORDS.contains(&s.as_str()) {
        format!("{s}_")
    } else {
        s
    }
}

pub fn const_ident(name: &str) -> String {
    let s = words(name)
        .iter()
        .map(|w| w.to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join("_");
    if s.is_empty() {
        "VALUE".to_string()
    } else if s.starts_with(|c: char| c.is_ascii_digit()) {
        format!("V_{s}")
    } else {
        s
    }
}

pub fn c_escape_c_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(ch),
        }
    }
    out
}

/// Single-line doc text.
pub fn doc_line(doc: &str) -> String {
    doc.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One stored member of a generated record.
#[derive(Debug, Clone)]
pub struct Member {
    pub ident: String,
    pub repr: String,
    /// The first field stored in this member.
    pub field: usize,
    pub default: Option<(TypeRef, Literal)>,
    /// Integer type of a member shared by variants of different integer widths.
    pub widened: Option<Primitive>,
}

impl Member {
    /// The member's type when reading `field` into it needs a conversion.
    pub fn widens(&self, field: &Field) -> Option<Primitive> {
        self.widened
            .filter(|wide| field.ty.primitive() != Some(*wide))
    }
}

/// Member layout of one record's own fields.
#[derive(Debug, Clone, Default)]
pub struct Members {
    pub list: Vec<Member>,
    /// Own field index to member index; `None` for elided fields.
    pub by_field: Vec<Option<usize>>,
}

/// Primitive of a field that may share a widened integer member.
fn scalar_integer(field: &Field) -> Option<Primitive> {
    match &field.ty {
        TypeRef::Basic { prim, .. } if !field.is_array() && prim.is_integer() => Some(*prim),
        _ => None,
    }
}

impl Members {
    /// Fields with the same spelling share a member when their representation agrees or
    /// when both are scalar integers (the member then takes the common integer type).
    /// Other variants get a numbered member. Elided fields have no member.
    pub fn layout(
        record: &Record,
        compact: &CompactRecord,
        is_object: bool,
        rules: &dyn TypeRules,
        ident: fn(&str) -> String,
        repr: impl Fn(&Field) -> Result<String, CompileError>,
    ) -> Result<Members, CompileError> {
        let mut members = Members::default();
        let mut by_ident: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, field) in record.fields.iter().enumerate() {
            if compact.elided.contains(&i) {
                members.by_field.push(None);
                continue;
            }
            let r = repr(field)?;
            let mut base = ident(&field.name);
            if is_object && base == "base" {
                base.push('_');
            }
            let taken = by_ident.get(&base).cloned().unwrap_or_default();
            let mut merged = taken.iter().copied().find(|m| members.list[*m].repr == r);
            if let (None, Some(prim)) = (merged, scalar_integer(field)) {
                for &m in &taken {
                    let member = &members.list[m];
                    let stored = member
                        .widened
                        .or_else(|| scalar_integer(&record.fields[member.field]));
                    if let Some(wide) = stored.and_then(|p| p.common_integer(prim)) {
                        members.list[m].widened = Some(wide);
                        merged = Some(m);
                        break;
                    }
                }
            }
            let index = match merged {
                Some(m) => m,
                None => {
                    let spelled = if taken.is_empty() {
                        base.clone()
                    } else {
                        format!("{base}_{}", taken.len() + 1)
                    };
                    members.list.push(Member {
                        ident: spelled,
                        repr: r,
                        field: i,
                        default: None,
                        widened: None,
                    });
                    let m = members.list.len() - 1;
                    by_ident.entry(base).or_default().push(m);
                    m
                }
            };
            let member = &mut members.list[index];
            if member.default.is_none() {
                member.default = field.default.map(|lit| (field.ty.clone(), lit));
            }
            if let Some(wide) = member.widened {
                let ty = TypeRef::Basic {
                    name: wide.as_str().to_string(),
                    prim: wide,
                };
                member.repr = rules.repr(&ty)?;
                if let Some((t, _)) = &mut member.default {
                    *t = ty;
                }
            }
            members.by_field.push(Some(index));
        }
        Ok(members)
    }

    pub fn of_field(&self, index: usize) -> Option<&Member> {
        self.by_field
            .get(index)
            .copied()
            .flatten()
            .and_then(|m| self.list.get(m))
    }

    pub fn has_defaults(&self) -> bool {
        self.list.iter().any(|m| m.default.is_some())
    }
}

/// Member layouts of every record, computed once per emitter run.
pub struct Layouts<'p> {
    pub program: &'p Program,
    layouts: BTreeMap<EntityId, Members>,
}

impl<'p> Layouts<'p> {
    pub fn build(
        program: &'p Program,
        rules: &dyn TypeRules,
        ident: fn(&str) -> String,
        repr: impl Fn(&dyn TypeRules, &Field) -> Result<String, CompileError>,
    ) -> Result<Self, CompileError> {
        let mut layouts = BTreeMap::new();
        for entity in &program.model.entities {
            let Some(record) = entity.record() else {
                continue;
            };
            let compact = program.record(entity.id).cloned().unwrap_or_default();
            let members = Members::layout(record, &compact, entity.is_object(), rules, ident, |f| {
                repr(rules, f).map_err(|e| {
                    CompileError::new(
                        e.kind,
                        format!("{} {}: field {:?}: {}", entity.kind_str(), entity.name, f.name, e.message),
                    )
                })
            })?;
            layouts.insert(entity.id, members);
        }
        Ok(Layouts { program, layouts })
    }

    pub fn members(&self, id: EntityId) -> Option<&Members> {
        self.layouts.get(&id)
    }

    /// Member path (`base.base.flags`) and field of an identifier inside `record`.
    pub fn access(&self, record: &Record, name: &str) -> Result<(String, &'p Field), CompileError> {
        let missing = || {
            CompileError::new(
                CompileErrorKind::Internal,
                format!("identifier {name:?} has no stored member"),
            )
        };
        let v: &VisibleField = record.resolve(name).ok_or_else(missing)?;
        let field = self.program.model.field(v).ok_or_else(missing)?;
        let owner = self.program.model.record(v.owner).ok_or_else(missing)?;
        let members = self.members(v.owner).ok_or_else(missing)?;
        let member = members.of_field(v.index).ok_or_else(missing)?;
        let split = owner.fields.iter().enumerate().any(|(i, f)| {
            f.name == name
                && members
                    .of_field(i)
                    .is_some_and(|other| other.ident != member.ident)
        });
        if split {
            return Err(CompileError::new(
                CompileErrorKind::Expression,
                format!(
                    "{name:?} names fields of unrelated types in {}; expressions cannot read it",
                    self.program.model.entity(v.owner).name
                ),
            ));
        }
        let mut path = "base.".repeat(v.depth);
        path.push_str(&member.ident);
        Ok((path, field))
    }
}
