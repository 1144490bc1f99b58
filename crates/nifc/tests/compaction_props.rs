use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use nifc::compile::build_program;
use nifc::guard::EvalContext;
use nifc::ir::{naive_reads, tree_reads, Node, Program};
use proptest::prelude::*;

fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn nif_program() -> &'static Program {
    static PROGRAM: OnceLock<Program> = OnceLock::new();
    PROGRAM.get_or_init(|| {
        let bytes = std::fs::read(repo_root().join("schemas/nif.json")).expect("read schema");
        build_program(&bytes, &[]).expect("compile schema")
    })
}

/// Versions on both sides of every boundary the schema uses.
const VERSIONS: &[u32] = &[
    0x0200_0000,
    0x0300_0000,
    0x0303_000D,
    0x0401_0000,
    0x0402_0200,
    0x0402_0201,
    0x0A00_0100,
    0x0A00_0102,
    0x0A00_0103,
    0x0A01_0000,
    0x0A01_0072,
    0x1400_0005,
    0x1402_0006,
    0x1402_0007,
    0x1402_0008,
];

fn values_for(names: &[String], raw: &[i64]) -> BTreeMap<String, i64> {
    names
        .iter()
        .zip(raw.iter().cycle())
        .map(|(n, v)| (n.clone(), *v))
        .collect()
}

fn all_field_names(program: &Program) -> Vec<String> {
    let mut names: Vec<String> = program
        .model
        .entities
        .iter()
        .filter_map(|e| e.record())
        .flat_map(|r| r.fields.iter().map(|f| f.name.clone()))
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Version variants of one name with different widths, and readers gated on that name.
fn variant_program() -> &'static Program {
    static PROGRAM: OnceLock<Program> = OnceLock::new();
    PROGRAM.get_or_init(|| {
        let schema = r#"{"schema_version": "nifschema.schema@0.1.0", "entries": [
            {"kind": "basic", "name": "bool", "primitive": "bool"},
            {"kind": "basic", "name": "ushort", "primitive": "u16"},
            {"kind": "basic", "name": "uint", "primitive": "u32"},
            {"kind": "basic", "name": "float", "primitive": "f32"},
            {"kind": "niobject", "name": "Av", "fields": [
                {"name": "Flags", "type": "ushort", "until": "20.2.0.6", "default": 14},
                {"name": "Flags", "type": "uint", "since": "20.2.0.7", "default": 14},
                {"name": "Num Keys", "type": "uint"},
                {"name": "Keys", "type": "float", "arr1": "Num Keys", "since": "10.0.1.0"},
                {"name": "Has Extra", "type": "bool"},
                {"name": "Extra", "type": "float", "cond": "Flags & 1"},
                {"name": "Extra Keys", "type": "float", "arr1": 2, "cond": "Has Extra"},
                {"name": "Tail", "type": "uint", "cond": "(Flags & 1) == 0", "since": "20.2.0.7"}]}
        ]}"#;
        build_program(schema.as_bytes(), &[]).expect("compile variant schema")
    })
}

proptest! {
    #[test]
    fn compacted_trees_read_what_the_field_list_reads(
        version_pick in 0usize..VERSIONS.len(),
        user_version in prop_oneof![Just(0u32), Just(11u32), Just(12u32)],
        user_version_2 in prop_oneof![Just(0u32), Just(34u32)],
        arg in 0i64..6,
        raw in prop::collection::vec(-1i64..6, 1..24),
    ) {
        let program = nif_program();
        let ctx = EvalContext {
            version: VERSIONS[version_pick],
            user_version,
            user_version_2,
            arg,
        };
        let values = values_for(&all_field_names(program), &raw);
        for entity in &program.model.entities {
            let Some(record) = entity.record() else { continue };
            let Some(compact) = program.record(entity.id) else { continue };
            let naive = naive_reads(record, &ctx, &values);
            let tree = tree_reads(record, &compact.nodes, &ctx, &values);
            prop_assert_eq!(naive, tree, "{}", entity.name);
        }
    }

    #[test]
    fn version_variants_read_in_field_order(
        version_pick in 0usize..VERSIONS.len(),
        flags in 0i64..4,
        raw in prop::collection::vec(0i64..3, 1..8),
    ) {
        let program = variant_program();
        let ctx = EvalContext {
            version: VERSIONS[version_pick],
            ..EvalContext::default()
        };
        let mut values = values_for(&all_field_names(program), &raw);
        values.insert("Flags".to_string(), flags);
        let entity = program.model.by_name("Av").expect("Av");
        let record = entity.record().expect("record");
        let compact = program.record(entity.id).expect("compacted");
        let naive = naive_reads(record, &ctx, &values);
        let tree = tree_reads(record, &compact.nodes, &ctx, &values);
        prop_assert_eq!(&naive, &tree);
        prop_assert_eq!(naive.first().map(String::as_str), Some("Flags"));
        prop_assert_eq!(naive.iter().any(|n| n == "Extra"), flags & 1 != 0);
    }

    #[test]
    fn folded_prefix_reads_exactly_the_count(
        count in 0i64..40,
        version_pick in 0usize..VERSIONS.len(),
    ) {
        let program = nif_program();
        let ctx = EvalContext {
            version: VERSIONS[version_pick],
            ..EvalContext::default()
        };
        for entity in &program.model.entities {
            let Some(record) = entity.record() else { continue };
            let Some(compact) = program.record(entity.id) else { continue };
            for node in &compact.nodes {
                let Node::Read(read) = node else { continue };
                let Some(prefix) = &read.prefix else { continue };
                // The count the prefix replaces is never stored and never read on its own.
                prop_assert!(compact.elided.contains(&prefix.count_field));
                let count_name = &record.fields[prefix.count_field].name;
                let values = BTreeMap::from([(count_name.clone(), count)]);
                let reads = tree_reads(record, std::slice::from_ref(node), &ctx, &values);
                prop_assert_eq!(reads.iter().filter(|n| *n == count_name).count(), 1);
                prop_assert_eq!(reads.len(), 2);
            }
        }
    }
}
