//! Compacted read trees and the presence evaluator.
//!
//! Each compound or object becomes a tree of [`Node`]s over its own fields. Inherited
//! fields are read by the supertype's tree. [`naive_reads`] and [`tree_reads`] compute
//! the stream reads a record performs for one version context and one set of field
//! values; for a correct compaction they agree on every input.

use std::collections::{BTreeMap, BTreeSet};

use nif_contracts::NIFC_IR_SCHEMA_VERSION;
use serde::Serialize;
use serde_json::{json, Value};

use crate::compact::FoldStats;
use crate::compile::{CompileError, CompileErrorKind};
use crate::expr::{Env, Expr, USER_VERSION_2_IDENT, USER_VERSION_IDENT, VERSION_IDENT};
use crate::guard::{EvalContext, VersionGate};
use crate::model::{EntityId, EntityKind, Model, Record};
use crate::registry::PrefixWidth;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Read(Read),
    /// Reads the elided boolean `field`, then `body` when it is true.
    Gate {
        field: usize,
        name: String,
        body: Vec<Node>,
    },
    If {
        arms: Vec<Arm>,
        #[serde(skip_serializing_if = "Option::is_none")]
        otherwise: Option<Vec<Node>>,
    },
    Switch {
        on: Expr,
        cases: Vec<Case>,
        #[serde(skip_serializing_if = "Option::is_none")]
        otherwise: Option<Vec<Node>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Read {
    pub field: usize,
    pub name: String,
    /// Set when the array's count field was folded into an inline length prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<Prefix>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prefix {
    pub count_field: usize,
    pub count_name: String,
    pub width: PrefixWidth,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Arm {
    pub test: Test,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Test {
    Version(VersionGate),
    Cond(Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Case {
    pub value: i64,
    pub body: Vec<Node>,
}

/// The compacted form of one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactRecord {
    pub nodes: Vec<Node>,
    /// Own fields whose reads were folded into a prefix or a gate; they are not stored.
    pub elided: BTreeSet<usize>,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub model: Model,
    pub records: BTreeMap<EntityId, CompactRecord>,
    pub stats: FoldStats,
}

impl Program {
    pub fn record(&self, id: EntityId) -> Option<&CompactRecord> {
        self.records.get(&id)
    }

    /// JSON dump of the compacted IR, optionally limited to one entity.
    pub fn ir_json(&self, only: Option<&str>) -> Result<Value, CompileError> {
        if let Some(name) = only {
            if self.model.by_name(name).is_none() {
                return Err(CompileError::new(
                    CompileErrorKind::Schema,
                    format!("no entity named {name:?}"),
                ));
            }
        }
        let mut entities = Vec::new();
        for entity in &self.model.entities {
            if only.is_some_and(|n| n != entity.name) {
                continue;
            }
            let mut v = json!({
                "name": entity.name,
                "kind": entity.kind_str(),
            });
            match &entity.kind {
                EntityKind::Basic(prim) => {
                    v["primitive"] = json!(prim.as_str());
                }
                EntityKind::Enum(def) => {
                    v["storage"] = json!(def.storage_name);
                    v["options"] = def
                        .options
                        .iter()
                        .map(|o| json!({"name": o.name, "value": o.value}))
                        .collect();
                }
                EntityKind::Compound(r) | EntityKind::Object(r) => {
                    let compact = self.record(entity.id).cloned().unwrap_or_default();
                    if let Some(sup) = r.inherit {
                        v["inherit"] = json!(self.model.entity(sup).name);
                    }
                    v["abstract"] = json!(r.is_abstract);
                    v["generic"] = json!(r.generic);
                    v["packed"] = json!(r.packed);
                    v["fields"] = r
                        .fields
                        .iter()
                        .enumerate()
                        .map(|(i, f)| {
                            json!({
                                "name": f.name,
                                "type": f.ty.to_string(),
                                "guard": f.guard,
                                "arr1": f.arr1,
                                "arr2": f.arr2,
                                "calculated": f.calculated,
                                "elided": compact.elided.contains(&i),
                            })
                        })
                        .collect();
                    v["nodes"] = serde_json::to_value(&compact.nodes).map_err(|e| {
                        CompileError::new(
                            CompileErrorKind::Internal,
                            format!("serialize IR of {}: {e}", entity.name),
                        )
                    })?;
                }
            }
            entities.push(v);
        }
        Ok(json!({
            "schema_version": NIFC_IR_SCHEMA_VERSION,
            "schema_sha256": self.model.schema_sha256,
            "stats": self.stats,
            "entities": entities,
        }))
    }
}

/// Field values as the evaluator sees them while a record is being read.
struct ReadEnv<'a> {
    record: &'a Record,
    ctx: &'a EvalContext,
    values: &'a BTreeMap<String, i64>,
    read: BTreeSet<&'a str>,
}

impl<'a> ReadEnv<'a> {
    fn new(record: &'a Record, ctx: &'a EvalContext, values: &'a BTreeMap<String, i64>) -> Self {
        ReadEnv {
            record,
            ctx,
            values,
            read: BTreeSet::new(),
        }
    }

    fn mark(&mut self, name: &'a str, out: &mut Vec<String>) {
        self.read.insert(name);
        out.push(name.to_string());
    }
}

impl Env for ReadEnv<'_> {
    fn ident(&self, name: &str) -> i64 {
        match name {
            VERSION_IDENT => return i64::from(self.ctx.version),
            USER_VERSION_IDENT => return i64::from(self.ctx.user_version),
            USER_VERSION_2_IDENT => return i64::from(self.ctx.user_version_2),
            _ => {}
        }
        let own = self.record.fields.iter().find(|f| f.name == name);
        match own {
            Some(f) if !self.read.contains(name) => f.default.map_or(0, |d| d.as_i64()),
            _ => self.values.get(name).copied().unwrap_or(0),
        }
    }

    fn arg(&self) -> i64 {
        self.ctx.arg
    }
}

/// Stream reads of the uncompacted field list: every field tested on its own guard.
pub fn naive_reads(
    record: &Record,
    ctx: &EvalContext,
    values: &BTreeMap<String, i64>,
) -> Vec<String> {
    let mut env = ReadEnv::new(record, ctx, values);
    let mut out = Vec::new();
    for f in &record.fields {
        if f.calculated {
            continue;
        }
        if f.guard.holds(ctx, &env) {
            env.mark(&f.name, &mut out);
        }
    }
    out
}

/// Stream reads of a compacted tree, elided count and gate reads included.
pub fn tree_reads(
    record: &Record,
    nodes: &[Node],
    ctx: &EvalContext,
    values: &BTreeMap<String, i64>,
) -> Vec<String> {
    let mut env = ReadEnv::new(record, ctx, values);
    let mut out = Vec::new();
    walk(record, nodes, &mut env, &mut out);
    out
}

fn walk<'a>(record: &'a Record, nodes: &[Node], env: &mut ReadEnv<'a>, out: &mut Vec<String>) {
    for node in nodes {
        match node {
            Node::Read(read) => {
                if let Some(p) = &read.prefix {
                    if let Some(count) = record.fields.get(p.count_field) {
                        env.mark(&count.name, out);
                    }
                }
                if let Some(f) = record.fields.get(read.field) {
                    env.mark(&f.name, out);
                }
            }
            Node::Gate { field, body, .. } => {
                let Some(f) = record.fields.get(*field) else {
                    continue;
                };
                env.mark(&f.name, out);
                if env.ident(&f.name) != 0 {
                    walk(record, body, env, out);
                }
            }
            Node::If { arms, otherwise } => {
                let ctx = env.ctx;
                let taken = arms.iter().find(|arm| match &arm.test {
                    Test::Version(g) => g.admits(ctx.version, ctx.user_version, ctx.user_version_2),
                    Test::Cond(e) => e.eval(&*env) != 0,
                });
                match (taken, otherwise) {
                    (Some(arm), _) => walk(record, &arm.body, env, out),
                    (None, Some(body)) => walk(record, body, env, out),
                    (None, None) => {}
                }
            }
            Node::Switch {
                on,
                cases,
                otherwise,
            } => {
                let v = on.eval(&*env);
                match (cases.iter().find(|c| c.value == v), otherwise) {
                    (Some(case), _) => walk(record, &case.body, env, out),
                    (None, Some(body)) => walk(record, body, env, out),
                    (None, None) => {}
                }
            }
        }
    }
}

/// Names of the fields a subtree reads, elided ones included.
pub fn read_names<'a>(record: &'a Record, nodes: &[Node], out: &mut BTreeSet<&'a str>) {
    for node in nodes {
        match node {
            Node::Read(read) => {
                if let Some(f) = record.fields.get(read.field) {
                    out.insert(&f.name);
                }
                if let Some(c) = read
                    .prefix
                    .as_ref()
                    .and_then(|p| record.fields.get(p.count_field))
                {
                    out.insert(&c.name);
                }
            }
            Node::Gate { field, body, .. } => {
                if let Some(f) = record.fields.get(*field) {
                    out.insert(&f.name);
                }
                read_names(record, body, out);
            }
            Node::If { arms, otherwise } => {
                for arm in arms {
                    read_names(record, &arm.body, out);
                }
                if let Some(body) = otherwise {
                    read_names(record, body, out);
                }
            }
            Node::Switch {
                cases, otherwise, ..
            } => {
                for case in cases {
                    read_names(record, &case.body, out);
                }
                if let Some(body) = otherwise {
                    read_names(record, body, out);
                }
            }
        }
    }
}
