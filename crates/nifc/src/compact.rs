//! The condition compactor.
//!
//! Per record, three rewrites over the own (non-calculated) fields, in priority order:
//!
//! 1. count folding: `Num X` directly followed by the only field sized by it becomes an
//!    inline length-prefixed array read;
//! 2. gate folding: `Has X` directly followed by the fields conditioned on it becomes an
//!    inline boolean read guarding them;
//! 3. run merging: adjacent items with equal guards share one branch, first by version
//!    gate and then by condition, with `else`/`elseif`/`switch` arms where the guards
//!    allow it.
//!
//! Both folds run right to left, so an inner gate is folded before the gate around it.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::compile::{CompileError, CompileErrorKind};
use crate::expr::Expr;
use crate::guard::{Guard, VersionGate};
use crate::ir::{read_names, Arm, Case, CompactRecord, Node, Prefix, Program, Read, Test};
use crate::model::{Entity, EntityId, Model, Record};
use crate::registry::{Primitive, TypeRef};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FoldStats {
    pub counts_folded: usize,
    pub gates_folded: usize,
    pub gates_missed: usize,
    pub branches: usize,
    pub switches: usize,
}

/// A node together with the guard it still has to be tested against.
#[derive(Debug, Clone)]
struct Item {
    guard: Guard,
    node: Node,
}

/// Where a field mentions a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Use {
    Cond,
    Arr1,
    Other,
}

pub fn compact_model(model: Model) -> Result<Program, CompileError> {
    let mut stats = FoldStats::default();
    let mut records = BTreeMap::new();
    for entity in &model.entities {
        if let Some(record) = entity.record() {
            let compact = compact_record(&model, entity, record, &mut stats)?;
            records.insert(entity.id, compact);
        }
    }
    debug!(
        counts_folded = stats.counts_folded,
        gates_folded = stats.gates_folded,
        gates_missed = stats.gates_missed,
        branches = stats.branches,
        "compacted schema"
    );
    Ok(Program {
        model,
        records,
        stats,
    })
}

pub fn compact_record(
    model: &Model,
    entity: &Entity,
    record: &Record,
    stats: &mut FoldStats,
) -> Result<CompactRecord, CompileError> {
    let mut items: Vec<Item> = record
        .fields
        .iter()
        .enumerate()
        .filter(|(_, f)| !f.calculated)
        .map(|(i, f)| Item {
            guard: f.guard.clone(),
            node: Node::Read(Read {
                field: i,
                name: f.name.clone(),
                prefix: None,
            }),
        })
        .collect();
    let mut elided = BTreeSet::new();
    let refs = References::new(model, entity.id, record);
    fold_counts(entity, record, &refs, &mut items, &mut elided, stats)?;
    fold_gates(entity, record, &refs, &mut items, &mut elided, stats);
    let nodes = merge_versions(record, items, stats);
    Ok(CompactRecord { nodes, elided })
}

/// Every name mention in a record and in the records that inherit from it.
struct References<'a> {
    owner: EntityId,
    uses: Vec<(EntityId, usize, Use, &'a Expr)>,
}

impl<'a> References<'a> {
    fn new(model: &'a Model, owner: EntityId, record: &'a Record) -> Self {
        let mut uses = Vec::new();
        let mut add = |id: EntityId, r: &'a Record| {
            for (i, f) in r.fields.iter().enumerate() {
                if let Some(c) = &f.guard.cond {
                    uses.push((id, i, Use::Cond, c));
                }
                if let Some(e) = &f.arr1 {
                    uses.push((id, i, Use::Arr1, e));
                }
                for e in f.arr2.iter().chain(f.arg.iter()) {
                    uses.push((id, i, Use::Other, e));
                }
            }
        };
        add(owner, record);
        for d in model.descendants(owner) {
            if let Some(r) = model.record(d) {
                add(d, r);
            }
        }
        References { owner, uses }
    }

    /// True when `name` is mentioned anywhere except by own-field uses `excused` accepts.
    fn mentioned(&self, name: &str, excused: impl Fn(usize, Use) -> bool) -> bool {
        self.uses.iter().any(|(id, index, usage, expr)| {
            expr.references(name) && !(*id == self.owner && excused(*index, *usage))
        })
    }
}

fn fold_counts(
    entity: &Entity,
    record: &Record,
    refs: &References<'_>,
    items: &mut Vec<Item>,
    elided: &mut BTreeSet<usize>,
    stats: &mut FoldStats,
) -> Result<(), CompileError> {
    let mut i = items.len();
    while i >= 2 {
        i -= 1;
        let (Node::Read(count), Node::Read(consumer)) = (&items[i - 1].node, &items[i].node)
        else {
            continue;
        };
        if count.prefix.is_some() || consumer.prefix.is_some() {
            continue;
        }
        let cf = &record.fields[count.field];
        let ff = &record.fields[consumer.field];
        let named_count = cf.name.starts_with("Num") || cf.name.starts_with("Count");
        let sized_by_count = ff.arr1.as_ref().and_then(Expr::as_ident) == Some(cf.name.as_str());
        if !named_count
            || !sized_by_count
            || ff.arr2.is_some()
            || cf.is_array()
            || cf.default.is_some()
            || items[i - 1].guard != items[i].guard
        {
            continue;
        }
        let consumer_field = consumer.field;
        if refs.mentioned(&cf.name, |idx, usage| {
            idx == consumer_field && usage == Use::Arr1
        }) {
            debug!(
                entity = %entity.name,
                count = %cf.name,
                "count has more than one reader, not folded"
            );
            continue;
        }
        let width = match &cf.ty {
            TypeRef::Basic { prim, .. } => prim.prefix_width(),
            _ => None,
        };
        let Some(width) = width else {
            return Err(CompileError::new(
                CompileErrorKind::CountFoldAmbiguity,
                format!(
                    "{} {}: count {:?} of {:?} has type {}, which has no prefix width",
                    entity.kind_str(),
                    entity.name,
                    cf.name,
                    ff.name,
                    cf.ty
                ),
            ));
        };
        let prefix = Prefix {
            count_field: count.field,
            count_name: cf.name.clone(),
            width,
        };
        debug!(entity = %entity.name, count = %cf.name, array = %ff.name, "folded count");
        elided.insert(count.field);
        items.remove(i - 1);
        i -= 1;
        if let Node::Read(read) = &mut items[i].node {
            read.prefix = Some(prefix);
        }
        stats.counts_folded += 1;
    }
    Ok(())
}

fn fold_gates(
    entity: &Entity,
    record: &Record,
    refs: &References<'_>,
    items: &mut Vec<Item>,
    elided: &mut BTreeSet<usize>,
    stats: &mut FoldStats,
) {
    let mut i = items.len();
    while i > 0 {
        i -= 1;
        let Node::Read(gate) = &items[i].node else {
            continue;
        };
        let field = gate.field;
        let hf = &record.fields[field];
        let is_gate = hf.name.starts_with("Has")
            && matches!(hf.ty, TypeRef::Basic { prim: Primitive::Bool, .. })
            && hf.default.is_none()
            && !hf.is_array()
            && gate.prefix.is_none();
        if !is_gate {
            continue;
        }
        let test = Expr::ident(&hf.name);
        let mut end = i + 1;
        while end < items.len() && items[end].guard.cond.as_ref() == Some(&test) {
            end += 1;
        }
        let mut run = BTreeSet::new();
        for it in &items[i + 1..end] {
            node_fields(&it.node, &mut run);
        }
        let version = items[i].guard.version;
        let uniform = items[i + 1..end].iter().all(|it| it.guard.version == version);
        let stray = refs.mentioned(&hf.name, |idx, usage| {
            usage == Use::Cond && run.contains(&idx)
        });
        if run.is_empty() || !uniform || stray {
            if refs.mentioned(&hf.name, |_, _| false) {
                debug!(
                    entity = %entity.name,
                    gate = %hf.name,
                    "gate readers are not contiguous, left unfolded"
                );
                stats.gates_missed += 1;
            }
            continue;
        }
        let name = hf.name.clone();
        let body: Vec<Node> = items.drain(i + 1..end).map(|it| it.node).collect();
        debug!(entity = %entity.name, gate = %name, readers = body.len(), "folded gate");
        items[i].node = Node::Gate { field, name, body };
        elided.insert(field);
        stats.gates_folded += 1;
    }
}

/// Own fields whose guards a top-level item stood for before folding.
fn node_fields(node: &Node, out: &mut BTreeSet<usize>) {
    match node {
        Node::Read(r) => {
            out.insert(r.field);
            if let Some(p) = &r.prefix {
                out.insert(p.count_field);
            }
        }
        Node::Gate { field, .. } => {
            out.insert(*field);
        }
        Node::If { .. } | Node::Switch { .. } => {}
    }
}

/// Open `if` chain while merging.
struct Chain {
    arms: Vec<Arm>,
    otherwise: Option<Vec<Node>>,
}

impl Chain {
    fn finish(self, out: &mut Vec<Node>, stats: &mut FoldStats) {
        stats.branches += 1;
        if let Some((on, cases)) = as_switch(&self.arms) {
            if self.otherwise.is_none() {
                stats.switches += 1;
                out.push(Node::Switch {
                    on,
                    cases,
                    otherwise: None,
                });
                return;
            }
        }
        out.push(Node::If {
            arms: self.arms,
            otherwise: self.otherwise,
        });
    }
}

fn as_switch(arms: &[Arm]) -> Option<(Expr, Vec<Case>)> {
    if arms.len() < 2 {
        return None;
    }
    let mut on: Option<&Expr> = None;
    let mut cases = Vec::with_capacity(arms.len());
    for arm in arms {
        let Test::Cond(test) = &arm.test else {
            return None;
        };
        let (d, value) = test.eq_test()?;
        if on.is_some_and(|prev| prev != d) {
            return None;
        }
        on = Some(d);
        cases.push(Case {
            value,
            body: arm.body.clone(),
        });
    }
    on.map(|d| (d.clone(), cases))
}

/// First level: runs of equal version gates.
fn merge_versions(record: &Record, items: Vec<Item>, stats: &mut FoldStats) -> Vec<Node> {
    let mut groups: Vec<(VersionGate, Vec<Item>)> = Vec::new();
    for item in items {
        match groups.last_mut() {
            Some((gate, members)) if *gate == item.guard.version => members.push(item),
            _ => groups.push((item.guard.version, vec![item])),
        }
    }
    let mut out = Vec::new();
    let mut chain: Option<Chain> = None;
    for (gate, members) in groups {
        let members: Vec<Item> = members
            .into_iter()
            .map(|it| Item {
                guard: Guard {
                    version: VersionGate::default(),
                    cond: it.guard.cond,
                },
                node: it.node,
            })
            .collect();
        let body = merge_conds(record, members, stats);
        if gate.is_always() {
            if let Some(c) = chain.take() {
                c.finish(&mut out, stats);
            }
            out.extend(body);
            continue;
        }
        let attached = match chain.as_mut() {
            Some(c) if c.otherwise.is_none() => {
                let tests: Vec<&VersionGate> = c
                    .arms
                    .iter()
                    .filter_map(|a| match &a.test {
                        Test::Version(g) => Some(g),
                        Test::Cond(_) => None,
                    })
                    .collect();
                if tests.len() == 1 && gate.is_complement_of(tests[0]) {
                    c.otherwise = Some(body.clone());
                    true
                } else if tests.len() == c.arms.len() && tests.iter().all(|g| gate.is_disjoint_from(g)) {
                    c.arms.push(Arm {
                        test: Test::Version(gate),
                        body: body.clone(),
                    });
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if !attached {
            if let Some(c) = chain.take() {
                c.finish(&mut out, stats);
            }
            chain = Some(Chain {
                arms: vec![Arm {
                    test: Test::Version(gate),
                    body,
                }],
                otherwise: None,
            });
        }
    }
    if let Some(c) = chain.take() {
        c.finish(&mut out, stats);
    }
    out
}

/// Second level: runs of equal conditions, inside one version arm.
fn merge_conds(record: &Record, items: Vec<Item>, stats: &mut FoldStats) -> Vec<Node> {
    // A condition joins a group only while it reads nothing the group itself reads.
    let mut groups: Vec<(Option<Expr>, Vec<Node>)> = Vec::new();
    for item in items {
        let joins = match (groups.last(), &item.guard.cond) {
            (Some((Some(prev), nodes)), Some(cond)) if prev == cond => {
                let mut names = BTreeSet::new();
                read_names(record, nodes, &mut names);
                !names.iter().any(|n| cond.references(n))
            }
            (Some((None, _)), None) => true,
            _ => false,
        };
        match groups.last_mut() {
            Some((_, nodes)) if joins => nodes.push(item.node),
            _ => groups.push((item.guard.cond, vec![item.node])),
        }
    }

    let mut out = Vec::new();
    let mut chain: Option<Chain> = None;
    for (cond, body) in groups {
        let Some(cond) = cond else {
            if let Some(c) = chain.take() {
                c.finish(&mut out, stats);
            }
            out.extend(body);
            continue;
        };
        let stable = chain.as_ref().is_some_and(|c| stable_chain(record, c, &cond));
        let attached = match chain.as_mut() {
            Some(c) if c.otherwise.is_none() && stable => {
                let tests: Vec<&Expr> = c
                    .arms
                    .iter()
                    .filter_map(|a| match &a.test {
                        Test::Cond(e) => Some(e),
                        Test::Version(_) => None,
                    })
                    .collect();
                if tests.len() == 1 && cond.is_complement_of(tests[0]) {
                    c.otherwise = Some(body.clone());
                    true
                } else if tests.len() == c.arms.len() && tests.iter().all(|t| cond.is_disjoint_from(t)) {
                    c.arms.push(Arm {
                        test: Test::Cond(cond.clone()),
                        body: body.clone(),
                    });
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if !attached {
            if let Some(c) = chain.take() {
                c.finish(&mut out, stats);
            }
            chain = Some(Chain {
                arms: vec![Arm {
                    test: Test::Cond(cond),
                    body,
                }],
                otherwise: None,
            });
        }
    }
    if let Some(c) = chain.take() {
        c.finish(&mut out, stats);
    }
    out
}

/// True when neither the chain's tests nor `next` read a field the chain's arms read, so
/// every test sees the value it would have seen on its own.
fn stable_chain(record: &Record, chain: &Chain, next: &Expr) -> bool {
    let mut names = BTreeSet::new();
    for arm in &chain.arms {
        read_names(record, &arm.body, &mut names);
    }
    let touched = |e: &Expr| names.iter().any(|n| e.references(n));
    !touched(next)
        && chain.arms.iter().all(|arm| match &arm.test {
            Test::Cond(e) => !touched(e),
            Test::Version(_) => true,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::build_test_model;

    fn schema(fields: &str) -> String {
        format!(
            r#"{{"schema_version": "nifschema.schema@0.1.0", "entries": [
                {{"kind": "basic", "name": "bool", "primitive": "bool"}},
                {{"kind": "basic", "name": "byte", "primitive": "u8"}},
                {{"kind": "basic", "name": "ushort", "primitive": "u16"}},
                {{"kind": "basic", "name": "uint", "primitive": "u32"}},
                {{"kind": "basic", "name": "uint64", "primitive": "u64"}},
                {{"kind": "basic", "name": "float", "primitive": "f32"}},
                {{"kind": "compound", "name": "Rec", "fields": [{fields}]}}
            ]}}"#
        )
    }

    fn compact(fields: &str) -> Result<(CompactRecord, FoldStats), CompileError> {
        let model = build_test_model(&schema(fields))?;
        let program = compact_model(model)?;
        let id = program.model.by_name("Rec").map(|e| e.id).unwrap();
        Ok((program.record(id).cloned().unwrap(), program.stats))
    }

    #[test]
    fn count_folds_into_prefix() {
        let (rec, stats) = compact(
            r#"{"name": "Num Vertices", "type": "ushort"},
               {"name": "Vertices", "type": "float", "arr1": "Num Vertices"}"#,
        )
        .unwrap();
        assert_eq!(stats.counts_folded, 1);
        assert_eq!(rec.elided, BTreeSet::from([0]));
        match &rec.nodes[..] {
            [Node::Read(Read {
                prefix: Some(p), ..
            })] => assert_eq!(p.width, crate::registry::PrefixWidth::U16),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn shared_count_is_not_folded() {
        let (rec, stats) = compact(
            r#"{"name": "Num Vertices", "type": "ushort"},
               {"name": "Vertices", "type": "float", "arr1": "Num Vertices"},
               {"name": "Normals", "type": "float", "arr1": "Num Vertices"}"#,
        )
        .unwrap();
        assert_eq!(stats.counts_folded, 0);
        assert!(rec.elided.is_empty());
        assert_eq!(rec.nodes.len(), 3);
    }

    #[test]
    fn wide_count_is_ambiguous() {
        let err = compact(
            r#"{"name": "Num Items", "type": "uint64"},
               {"name": "Items", "type": "float", "arr1": "Num Items"}"#,
        )
        .unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::CountFoldAmbiguity);
        assert!(err.message.contains("compound Rec"));
    }

    #[test]
    fn gate_folds_over_its_readers() {
        let (rec, stats) = compact(
            r#"{"name": "Has Normals", "type": "bool"},
               {"name": "A", "type": "float", "cond": "Has Normals"},
               {"name": "B", "type": "float", "cond": "Has Normals"},
               {"name": "C", "type": "float", "cond": "Has Normals"},
               {"name": "D", "type": "uint"}"#,
        )
        .unwrap();
        assert_eq!(stats.gates_folded, 1);
        assert_eq!(stats.branches, 0);
        match &rec.nodes[..] {
            [Node::Gate { body, .. }, Node::Read(_)] => assert_eq!(body.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn interleaved_gate_is_left_alone() {
        let (rec, stats) = compact(
            r#"{"name": "Has Normals", "type": "bool"},
               {"name": "A", "type": "float", "cond": "Has Normals"},
               {"name": "B", "type": "uint"},
               {"name": "C", "type": "float", "cond": "Has Normals"}"#,
        )
        .unwrap();
        assert_eq!(stats.gates_folded, 0);
        assert_eq!(stats.gates_missed, 1);
        assert!(rec.elided.is_empty());
    }

    #[test]
    fn complementary_version_ranges_become_else() {
        let (rec, _) = compact(
            r#"{"name": "Flags", "type": "ushort", "until": "20.2.0.6"},
               {"name": "Flags", "type": "uint", "since": "20.2.0.7"}"#,
        )
        .unwrap();
        match &rec.nodes[..] {
            [Node::If {
                arms,
                otherwise: Some(other),
            }] => {
                assert_eq!(arms.len(), 1);
                assert_eq!(other.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn equal_tests_of_one_discriminant_become_switch() {
        let (rec, stats) = compact(
            r#"{"name": "Kind", "type": "uint"},
               {"name": "A", "type": "float", "cond": "Kind == 0"},
               {"name": "B", "type": "float", "cond": "Kind == 1"},
               {"name": "C", "type": "float", "cond": "Kind == 1"},
               {"name": "D", "type": "float", "cond": "Kind == 2"}"#,
        )
        .unwrap();
        assert_eq!(stats.switches, 1);
        match &rec.nodes[..] {
            [Node::Read(_), Node::Switch { cases, .. }] => {
                let shape: Vec<_> = cases.iter().map(|c| (c.value, c.body.len())).collect();
                assert_eq!(shape, vec![(0, 1), (1, 2), (2, 1)]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn groups_break_when_a_test_reads_a_grouped_field() {
        let (rec, _) = compact(
            r#"{"name": "Mode", "type": "uint"},
               {"name": "Mode", "type": "uint", "cond": "Mode == 1"},
               {"name": "X", "type": "uint", "cond": "Mode == 1"}"#,
        )
        .unwrap();
        assert_eq!(rec.nodes.len(), 3);
    }

    #[test]
    fn complement_conditions_become_else() {
        let (rec, _) = compact(
            r#"{"name": "Use External", "type": "byte"},
               {"name": "File Name", "type": "uint", "cond": "Use External != 0"},
               {"name": "Pixel Data", "type": "uint", "cond": "Use External == 0"}"#,
        )
        .unwrap();
        assert!(matches!(
            &rec.nodes[..],
            [Node::Read(_), Node::If { otherwise: Some(_), .. }]
        ));
    }
}
