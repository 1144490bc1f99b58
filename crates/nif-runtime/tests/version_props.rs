use nif_runtime::VersionNumber;
use proptest::prelude::*;

proptest! {
    #[test]
    fn display_then_parse_is_identity(raw in any::<u32>()) {
        let v = VersionNumber::from_raw(raw);
        prop_assert_eq!(VersionNumber::parse(&v.to_string()), Some(v));
    }

    #[test]
    fn packed_order_matches_component_order(
        a in any::<[u8; 4]>(),
        b in any::<[u8; 4]>(),
    ) {
        let va = VersionNumber::new(a[0], a[1], a[2], a[3]);
        let vb = VersionNumber::new(b[0], b[1], b[2], b[3]);
        prop_assert_eq!(va.cmp(&vb), a.cmp(&b));
    }

    #[test]
    fn short_spellings_pad_with_zeros(a in any::<u8>(), b in any::<u8>()) {
        let v = VersionNumber::parse(&format!("{a}.{b}")).unwrap();
        prop_assert_eq!(v, VersionNumber::new(a, b, 0, 0));
    }
}
