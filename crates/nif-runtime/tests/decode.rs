use std::any::Any;

use nif_runtime::{
    BlockRegistry, DecodeDiagnostic, DecodeError, DecodeState, NiObject, NifFile, NifResult,
    NifStream, ReadContext, Ref,
};

#[derive(Debug)]
struct TestNode {
    value: u32,
}

impl NiObject for TestNode {
    fn block_type(&self) -> &'static str {
        "TestNode"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct TestLeaf {
    base: TestNode,
    child: Ref,
}

impl NiObject for TestLeaf {
    fn block_type(&self) -> &'static str {
        "TestLeaf"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn base(&self) -> Option<&dyn NiObject> {
        Some(&self.base)
    }
}

fn read_node(s: &mut dyn NifStream, _ctx: &ReadContext) -> NifResult<Box<dyn NiObject>> {
    Ok(Box::new(TestNode {
        value: s.read_u32()?,
    }))
}

fn read_leaf(s: &mut dyn NifStream, _ctx: &ReadContext) -> NifResult<Box<dyn NiObject>> {
    let value = s.read_u32()?;
    let child = Ref::from_raw(s.read_i32()?);
    Ok(Box::new(TestLeaf {
        base: TestNode { value },
        child,
    }))
}

fn read_failing(s: &mut dyn NifStream, _ctx: &ReadContext) -> NifResult<Box<dyn NiObject>> {
    Err(DecodeError::Invalid {
        offset: s.position(),
        message: "corrupt".to_string(),
    })
}

fn registry() -> BlockRegistry {
    let mut r = BlockRegistry::new();
    r.register("TestNode", read_node);
    r.register("TestLeaf", read_leaf);
    r.register("Failing", read_failing);
    r
}

#[derive(Default)]
struct Bytes(Vec<u8>);

impl Bytes {
    fn line(&mut self, s: &str) -> &mut Self {
        self.0.extend_from_slice(s.as_bytes());
        self.0.push(b'\n');
        self
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.0.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i32(&mut self, v: i32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn sized(&mut self, s: &str) -> &mut Self {
        self.u32(s.len() as u32);
        self.0.extend_from_slice(s.as_bytes());
        self
    }

    fn raw(&mut self, b: &[u8]) -> &mut Self {
        self.0.extend_from_slice(b);
        self
    }
}

/// A 20.2.0.7 header with a type table and size table.
fn modern_header(b: &mut Bytes, types: &[&str], blocks: &[(u16, u32)]) {
    b.line("Gamebryo File Format, Version 20.2.0.7")
        .u32(0x1402_0007)
        .u8(1)
        .u32(0)
        .u32(blocks.len() as u32)
        .u16(types.len() as u16);
    for t in types {
        b.sized(t);
    }
    for (ty, _) in blocks {
        b.u16(*ty);
    }
    for (_, size) in blocks {
        b.u32(*size);
    }
    // strings, max length, groups
    b.u32(0).u32(0).u32(0);
}

fn node_value(obj: Option<&dyn NiObject>) -> Option<u32> {
    obj?.find::<TestNode>().map(|n| n.value)
}

#[test]
fn unknown_block_is_skipped_by_size() {
    let mut b = Bytes::default();
    modern_header(
        &mut b,
        &["TestNode", "Mystery", "TestLeaf"],
        &[(0, 4), (1, 6), (2, 8)],
    );
    b.u32(11).raw(&[9, 9, 9, 9, 9, 9]).u32(33).i32(0);
    b.u32(1).i32(2);

    let file = NifFile::decode(&b.0, &registry()).unwrap();
    assert_eq!(file.blocks.len(), 3);
    assert_eq!(node_value(file.blocks.get_raw(0)), Some(11));
    assert!(file.blocks.get_raw(1).is_none());
    let leaf = file
        .blocks
        .get_raw(2)
        .and_then(|o| o.downcast_ref::<TestLeaf>())
        .unwrap();
    assert_eq!(leaf.base.value, 33);
    assert_eq!(node_value(file.blocks.get(leaf.child)), Some(11));

    assert_eq!(
        file.diagnostics,
        vec![DecodeDiagnostic::UnknownBlockType {
            index: 1,
            type_name: "Mystery".to_string()
        }]
    );
    assert_eq!(file.states().last(), Some(&DecodeState::Done));
    assert_eq!(
        file.root(0).map(|r| r.lineage()),
        Some(vec!["TestLeaf", "TestNode"])
    );
}

#[test]
fn decode_visits_every_state_in_order() {
    let mut b = Bytes::default();
    modern_header(&mut b, &["TestNode"], &[(0, 4)]);
    b.u32(5).u32(0);

    let file = NifFile::decode(&b.0, &registry()).unwrap();
    assert_eq!(
        file.states(),
        &[
            DecodeState::Start,
            DecodeState::HeaderParsed,
            DecodeState::BlockTableResolved,
            DecodeState::BlocksDecoded,
            DecodeState::RootsResolved,
            DecodeState::Done,
        ]
    );
    assert_eq!(file.roots().count(), 0);
    assert!(file.diagnostics.is_empty());
}

#[test]
fn null_and_dangling_roots_resolve_to_none() {
    let mut b = Bytes::default();
    modern_header(&mut b, &["TestNode"], &[(0, 4), (0, 4), (0, 4)]);
    b.u32(1).u32(2).u32(3);
    b.u32(3).i32(-1).i32(3).i32(1);

    let file = NifFile::decode(&b.0, &registry()).unwrap();
    assert_eq!(file.root_refs().len(), 3);
    assert!(file.root(0).is_none());
    assert!(file.root(1).is_none());
    assert_eq!(node_value(file.root(2)), Some(2));
    assert!(file.root(3).is_none());
    assert!(file.diagnostics.is_empty());
}

#[test]
fn failing_block_is_replaced_and_decode_continues() {
    let mut b = Bytes::default();
    modern_header(&mut b, &["TestNode", "Failing"], &[(1, 4), (0, 4)]);
    b.u32(0xdead_beef).u32(7);
    b.u32(1).i32(1);

    let file = NifFile::decode(&b.0, &registry()).unwrap();
    assert!(file.blocks.get_raw(0).is_none());
    assert_eq!(node_value(file.root(0)), Some(7));
    assert!(matches!(
        file.diagnostics.as_slice(),
        [DecodeDiagnostic::BlockFailed { index: 0, .. }]
    ));
}

#[test]
fn declared_size_wins_over_consumed_bytes() {
    let mut b = Bytes::default();
    modern_header(&mut b, &["TestNode"], &[(0, 6), (0, 4)]);
    b.u32(1).u16(0xffff).u32(2);
    b.u32(0);

    let file = NifFile::decode(&b.0, &registry()).unwrap();
    assert_eq!(node_value(file.blocks.get_raw(1)), Some(2));
    assert_eq!(
        file.diagnostics,
        vec![DecodeDiagnostic::SizeMismatch {
            index: 0,
            declared: 6,
            consumed: 4
        }]
    );
}

#[test]
fn truncated_root_list_keeps_what_was_read() {
    let mut b = Bytes::default();
    modern_header(&mut b, &["TestNode"], &[(0, 4)]);
    b.u32(1).u32(4).i32(0);

    let file = NifFile::decode(&b.0, &registry()).unwrap();
    assert_eq!(node_value(file.root(0)), Some(1));
    assert_eq!(
        file.diagnostics,
        vec![DecodeDiagnostic::TruncatedRoots {
            read: 1,
            declared: 4
        }]
    );
}

#[test]
fn inline_type_names_before_5_0_0_1() {
    let mut b = Bytes::default();
    b.line("NetImmerse File Format, Version 4.0.0.2")
        .u32(0x0400_0002)
        .u32(2);
    b.sized("TestNode").u32(8);
    b.sized("TestLeaf").u32(9).i32(0);
    b.u32(1).i32(1);

    let file = NifFile::decode(&b.0, &registry()).unwrap();
    assert_eq!(file.header.version.to_string(), "4.0.0.2");
    assert!(file.header.block_types.is_empty());
    let root = file.root(0).unwrap();
    assert_eq!(root.block_type(), "TestLeaf");
    let child = root.downcast_ref::<TestLeaf>().unwrap().child;
    assert_eq!(node_value(file.blocks.get(child)), Some(8));
}

#[test]
fn unknown_block_without_sizes_stops_block_decoding() {
    let mut b = Bytes::default();
    b.line("NetImmerse File Format, Version 4.0.0.2")
        .u32(0x0400_0002)
        .u32(3);
    b.sized("TestNode").u32(8);
    b.sized("Mystery").u32(1).u32(2);
    b.sized("TestNode").u32(9);
    b.u32(1).i32(0);

    let file = NifFile::decode(&b.0, &registry()).unwrap();
    assert_eq!(node_value(file.blocks.get_raw(0)), Some(8));
    assert_eq!(file.blocks.null_count(), 2);
    assert_eq!(
        file.diagnostics,
        vec![
            DecodeDiagnostic::UnknownBlockType {
                index: 1,
                type_name: "Mystery".to_string()
            },
            DecodeDiagnostic::Unreachable {
                first_index: 2,
                count: 1
            },
        ]
    );
    assert!(file.root_refs().is_empty());
    assert_eq!(file.states().last(), Some(&DecodeState::Done));
}

#[test]
fn block_count_beyond_the_stream_is_not_allocated() {
    let mut b = Bytes::default();
    b.line("NetImmerse File Format, Version 4.0.0.2")
        .u32(0x0400_0002)
        .u32(u32::MAX);
    assert_eq!(b.0.len(), 48);

    let file = NifFile::decode(&b.0, &registry()).unwrap();
    assert_eq!(file.header.num_blocks, u32::MAX);
    assert!(file.blocks.is_empty());
    assert_eq!(
        file.diagnostics,
        vec![DecodeDiagnostic::Unreachable {
            first_index: 0,
            count: u32::MAX as usize
        }]
    );
    assert!(file.root_refs().is_empty());
    assert_eq!(file.states().last(), Some(&DecodeState::Done));
}

#[test]
fn block_count_is_capped_but_readable_blocks_survive() {
    let mut b = Bytes::default();
    b.line("NetImmerse File Format, Version 4.0.0.2")
        .u32(0x0400_0002)
        .u32(1_000_000);
    b.sized("TestNode").u32(8);

    let file = NifFile::decode(&b.0, &registry()).unwrap();
    assert!(file.blocks.len() <= 4);
    assert_eq!(node_value(file.blocks.get_raw(0)), Some(8));
    assert_eq!(
        file.diagnostics,
        vec![DecodeDiagnostic::Unreachable {
            first_index: 1,
            count: 999_999
        }]
    );
}

#[test]
fn block_separators_between_5_0_0_1_and_10_1_0_106() {
    let mut b = Bytes::default();
    b.line("NetImmerse File Format, Version 10.0.1.0")
        .u32(0x0A00_0100)
        .u32(2)
        .u16(1)
        .sized("TestNode")
        .u16(0)
        .u16(0)
        .u32(0);
    b.u32(0).u32(5);
    b.u32(7).u32(6);
    b.u32(1).i32(1);

    let file = NifFile::decode(&b.0, &registry()).unwrap();
    assert_eq!(node_value(file.blocks.get_raw(0)), Some(5));
    assert_eq!(node_value(file.root(0)), Some(6));
    assert_eq!(
        file.diagnostics,
        vec![DecodeDiagnostic::BadSeparator { index: 1, value: 7 }]
    );
}

#[test]
fn unrecognized_magic_is_fatal() {
    let err = NifFile::decode(b"PK\x03\x04 not a nif\n", &registry()).unwrap_err();
    assert!(matches!(err, DecodeError::BadMagic(_)));
}

#[test]
fn version_outside_window_is_fatal() {
    let mut b = Bytes::default();
    b.line("Gamebryo File Format, Version 30.0.0.0");
    let err = NifFile::decode(&b.0, &registry()).unwrap_err();
    assert!(matches!(err, DecodeError::UnsupportedVersion { .. }));

    let mut b = Bytes::default();
    b.line("Gamebryo File Format, Version 20.2.0.7").u32(0x1E00_0000);
    let err = NifFile::decode(&b.0, &registry()).unwrap_err();
    assert!(matches!(err, DecodeError::UnsupportedVersion { .. }));
}

#[test]
fn bethesda_header_supplies_user_version_2() {
    let mut b = Bytes::default();
    b.line("Gamebryo File Format, Version 20.2.0.7")
        .u32(0x1402_0007)
        .u8(1)
        .u32(12)
        .u32(1);
    // bs_version 83, author, process script, export script
    b.u32(83).u8(4).raw(b"me\0\0").u8(1).u8(0).u8(1).u8(0);
    b.u16(1).sized("TestNode").u16(0).u32(4);
    b.u32(1).u32(16).sized("Scene Root").u32(0);
    b.u32(3).u32(1).i32(0);

    let file = NifFile::decode(&b.0, &registry()).unwrap();
    let ctx = file.read_context();
    assert_eq!(ctx.user_version, 12);
    assert_eq!(ctx.user_version_2, 83);
    assert_eq!(file.header.strings, vec!["Scene Root".to_string()]);
    assert_eq!(
        file.string(&nif_runtime::NifString::Index(0)),
        Some("Scene Root")
    );
    assert_eq!(node_value(file.root(0)), Some(3));
}
