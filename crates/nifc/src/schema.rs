//! The on-disk schema document.
//!
//! A schema is one JSON object with a pinned `schema_version` and an ordered list of
//! entries. This module only decodes the document; names, types and expressions are
//! resolved by [`crate::model`].

use nif_contracts::NIFSCHEMA_SCHEMA_VERSIONS_SUPPORTED;
use serde::Deserialize;

use crate::compile::{CompileError, CompileErrorKind};

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDoc {
    pub schema_version: String,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entry {
    Version(VersionEntry),
    Basic(BasicEntry),
    Enum(EnumEntry),
    Bitflags(EnumEntry),
    Compound(CompoundEntry),
    #[serde(rename = "niobject")]
    Object(ObjectEntry),
}

impl Entry {
    pub fn name(&self) -> &str {
        match self {
            Entry::Version(v) => &v.id,
            Entry::Basic(b) => &b.name,
            Entry::Enum(e) | Entry::Bitflags(e) => &e.name,
            Entry::Compound(c) => &c.name,
            Entry::Object(o) => &o.name,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Entry::Version(_) => "version",
            Entry::Basic(_) => "basic",
            Entry::Enum(_) => "enum",
            Entry::Bitflags(_) => "bitflags",
            Entry::Compound(_) => "compound",
            Entry::Object(_) => "niobject",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionEntry {
    pub id: String,
    pub num: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BasicEntry {
    pub name: String,
    pub primitive: String,
    #[serde(default)]
    pub doc: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnumEntry {
    pub name: String,
    pub storage: String,
    #[serde(default)]
    pub options: Vec<EnumOptionEntry>,
    #[serde(default)]
    pub doc: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnumOptionEntry {
    pub name: String,
    pub value: Scalar,
    #[serde(default)]
    pub doc: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompoundEntry {
    pub name: String,
    #[serde(default)]
    pub generic: bool,
    #[serde(default)]
    pub packed: bool,
    #[serde(default)]
    pub fields: Vec<FieldEntry>,
    #[serde(default)]
    pub doc: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    #[serde(default)]
    pub inherit: Option<String>,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default)]
    pub fields: Vec<FieldEntry>,
    #[serde(default)]
    pub doc: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub default: Option<Scalar>,
    #[serde(default)]
    pub arr1: Option<Scalar>,
    #[serde(default)]
    pub arr2: Option<Scalar>,
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default)]
    pub userver: Option<u32>,
    #[serde(default)]
    pub userver2: Option<u32>,
    #[serde(default)]
    pub cond: Option<Scalar>,
    #[serde(default)]
    pub vercond: Option<String>,
    #[serde(default)]
    pub arg: Option<Scalar>,
    #[serde(default)]
    pub calculated: bool,
    #[serde(default)]
    pub doc: Option<String>,
}

/// Attribute values that schema authors write either as JSON numbers or as text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn to_text(&self) -> String {
        match self {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(v) => v.to_string(),
            Scalar::Float(v) => format!("{v:?}"),
            Scalar::Text(s) => s.trim().to_string(),
        }
    }

    /// Integer value of a numeric scalar or a decimal/`0x` text literal.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Bool(b) => Some(i64::from(*b)),
            Scalar::Int(v) => Some(*v),
            Scalar::Float(_) => None,
            Scalar::Text(s) => parse_int_literal(s),
        }
    }
}

pub fn parse_int_literal(s: &str) -> Option<i64> {
    let s = s.trim();
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok()? as i64,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if neg { value.wrapping_neg() } else { value })
}

pub fn parse_schema(bytes: &[u8]) -> Result<SchemaDoc, CompileError> {
    let doc: SchemaDoc = serde_json::from_slice(bytes).map_err(|e| {
        CompileError::new(CompileErrorKind::Schema, format!("parse schema JSON: {e}"))
    })?;
    let version = doc.schema_version.trim();
    if !NIFSCHEMA_SCHEMA_VERSIONS_SUPPORTED.contains(&version) {
        return Err(CompileError::new(
            CompileErrorKind::Schema,
            format!(
                "schema_version mismatch: expected one of {:?} got {:?}",
                NIFSCHEMA_SCHEMA_VERSIONS_SUPPORTED, doc.schema_version
            ),
        ));
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_tagged_by_kind() {
        let doc = parse_schema(
            br#"{
              "schema_version": "nifschema.schema@0.1.0",
              "entries": [
                {"kind": "basic", "name": "ushort", "primitive": "u16"},
                {"kind": "bitflags", "name": "Flags", "storage": "ushort",
                 "options": [{"name": "A", "value": "0x4"}]},
                {"kind": "niobject", "name": "NiObject", "abstract": true},
                {"kind": "compound", "name": "Pair", "fields": [
                  {"name": "Num Items", "type": "ushort", "default": 3, "arr1": 2}
                ]}
              ]
            }"#,
        )
        .unwrap();
        assert_eq!(doc.entries.len(), 4);
        assert_eq!(doc.entries[1].kind_str(), "bitflags");
        match &doc.entries[2] {
            Entry::Object(o) => assert!(o.is_abstract),
            other => panic!("unexpected entry {other:?}"),
        }
        match &doc.entries[3] {
            Entry::Compound(c) => {
                assert_eq!(c.fields[0].default, Some(Scalar::Int(3)));
                assert_eq!(c.fields[0].arr1.as_ref().map(Scalar::to_text), Some("2".into()));
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_schema_version() {
        let err = parse_schema(br#"{"schema_version": "nifschema.schema@9", "entries": []}"#)
            .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Schema);
        assert!(err.message.contains("schema_version mismatch"));
    }

    #[test]
    fn rejects_unknown_entry_kind() {
        let err = parse_schema(
            br#"{"schema_version": "nifschema.schema@0.1.0", "entries": [{"kind": "token"}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Schema);
    }

    #[test]
    fn int_literals() {
        assert_eq!(parse_int_literal("0x8000"), Some(0x8000));
        assert_eq!(parse_int_literal(" -3 "), Some(-3));
        assert_eq!(parse_int_literal("1.5"), None);
        assert_eq!(Scalar::Text("0x10".into()).as_i64(), Some(16));
    }
}
