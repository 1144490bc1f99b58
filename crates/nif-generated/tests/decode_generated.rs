use nif_generated::nif::{block_registry, NiNode};
use nif_runtime::{DecodeDiagnostic, DecodeState, NiObject, NifFile};

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

    fn f32(&mut self, v: f32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn sized(&mut self, s: &str) -> &mut Self {
        self.u32(s.len() as u32);
        self.0.extend_from_slice(s.as_bytes());
        self
    }
}

/// NiNode at 20.2.0.7: NiObjectNET, NiAVObject, then the node's own lists.
fn ni_node(b: &mut Bytes, name: u32, flags: u32, translation: [f32; 3], children: &[i32]) {
    b.u32(name).u32(0).i32(-1);
    b.u32(flags);
    for t in translation {
        b.f32(t);
    }
    for i in 0..9 {
        b.f32(if i % 4 == 0 { 1.0 } else { 0.0 });
    }
    b.f32(1.0);
    // properties, collision object
    b.u32(0).i32(-1);
    b.u32(children.len() as u32);
    for c in children {
        b.i32(*c);
    }
    // effects
    b.u32(0);
}

fn node_size(children: usize) -> u32 {
    84 + 4 * children as u32
}

/// Scene root, an unknown block, and a child node; roots are the scene root, a null and a
/// dangling index.
fn scene() -> Vec<u8> {
    let mut b = Bytes::default();
    b.line("Gamebryo File Format, Version 20.2.0.7")
        .u32(0x1402_0007)
        .u8(1)
        .u32(0)
        .u32(3);
    b.u16(2).sized("NiNode").sized("NiMystery");
    b.u16(0).u16(1).u16(0);
    b.u32(node_size(1)).u32(5).u32(node_size(0));
    b.u32(1).u32(10).sized("Scene Root");
    b.u32(0);

    ni_node(&mut b, 0, 15, [1.0, 2.0, 3.0], &[2]);
    b.u8(7).u8(7).u8(7).u8(7).u8(7);
    ni_node(&mut b, u32::MAX, 14, [0.0, 0.0, -4.5], &[]);

    b.u32(3).i32(0).i32(-1).i32(3);
    b.0
}

#[test]
fn generated_registry_covers_every_concrete_block() {
    let registry = block_registry();
    for name in ["NiNode", "NiTriShapeData", "NiKeyframeData", "BSXFlags"] {
        assert!(registry.contains(name), "{name}");
    }
    for name in ["NiObject", "NiObjectNET", "NiAVObject"] {
        assert!(!registry.contains(name), "{name}");
    }
}

#[test]
fn crafted_scene_decodes_through_generated_readers() {
    let file = NifFile::decode(&scene(), &block_registry()).expect("decode");

    assert_eq!(
        file.diagnostics,
        vec![DecodeDiagnostic::UnknownBlockType {
            index: 1,
            type_name: "NiMystery".to_string()
        }]
    );
    assert_eq!(file.states().last(), Some(&DecodeState::Done));
    assert_eq!(file.blocks.len(), 3);
    assert!(file.blocks.get_raw(1).is_none());

    let roots: Vec<_> = file.roots().map(|r| r.map(|o| o.block_type())).collect();
    assert_eq!(roots, vec![Some("NiNode"), None, None]);

    let root = file
        .root(0)
        .and_then(|o| o.downcast_ref::<NiNode>())
        .expect("root node");
    assert_eq!(
        file.root(0).map(|o| o.lineage()),
        Some(vec!["NiNode", "NiAVObject", "NiObjectNET", "NiObject"])
    );
    assert_eq!(file.string(&root.base.base.name), Some("Scene Root"));
    assert_eq!(root.base.flags, 15);
    assert_eq!(root.base.translation.y, 2.0);
    assert_eq!(root.base.scale, 1.0);
    assert_eq!(root.children.len(), 1);

    let child = file
        .blocks
        .get(root.children[0])
        .and_then(|o| o.downcast_ref::<NiNode>())
        .expect("child node");
    assert_eq!(
        file.blocks.resolve(root.children[0]).map(|av| av.flags),
        Some(14)
    );
    assert_eq!(child.base.flags, 14);
    assert_eq!(child.base.translation.z, -4.5);
    assert_eq!(file.string(&child.base.base.name), None);
    assert!(child.children.is_empty());
}
