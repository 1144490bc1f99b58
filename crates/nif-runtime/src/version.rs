//! Packed file version numbers.
//!
//! A version is four 8-bit components packed big-end-first into a `u32`, so the natural
//! integer order is the version order. Shorter spellings are padded with zero components
//! (`"10.1"` is `10.1.0.0`), and the historical spelling `"3.03"` denotes `3.0.3.0`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The packed value of the legacy `"3.03"` spelling.
const LEGACY_3_03: u32 = 0x0300_0300;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionNumber(u32);

impl VersionNumber {
    pub const fn from_raw(raw: u32) -> Self {
        VersionNumber(raw)
    }

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        VersionNumber(((a as u32) << 24) | ((b as u32) << 16) | ((c as u32) << 8) | d as u32)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn components(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Parses `a`, `a.b`, `a.b.c`, `a.b.c.d` (each component 0..=255) or the legacy `3.03`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s == "3.03" {
            return Some(VersionNumber(LEGACY_3_03));
        }
        let mut parts = [0u8; 4];
        let mut count = 0usize;
        for piece in s.split('.') {
            if count == 4 || piece.is_empty() || !piece.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            parts[count] = piece.parse::<u8>().ok()?;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        Some(VersionNumber(u32::from_be_bytes(parts)))
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == LEGACY_3_03 {
            return f.write_str("3.03");
        }
        let [a, b, c, d] = self.components();
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionParseError {
    value: String,
}

impl fmt::Display for VersionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid version {:?} (expected up to four dot-separated components 0..=255)",
            self.value
        )
    }
}

impl std::error::Error for VersionParseError {}

impl FromStr for VersionNumber {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionNumber::parse(s).ok_or_else(|| VersionParseError {
            value: s.to_string(),
        })
    }
}

impl From<VersionNumber> for u32 {
    fn from(v: VersionNumber) -> u32 {
        v.0
    }
}

impl Serialize for VersionNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Well-known boundaries of the container layout.
pub mod known {
    use super::VersionNumber;

    pub const V3_1_0_1: VersionNumber = VersionNumber::new(3, 1, 0, 1);
    pub const V3_3_0_13: VersionNumber = VersionNumber::new(3, 3, 0, 13);
    pub const V4_1_0_1: VersionNumber = VersionNumber::new(4, 1, 0, 1);
    pub const V5_0_0_1: VersionNumber = VersionNumber::new(5, 0, 0, 1);
    pub const V5_0_0_6: VersionNumber = VersionNumber::new(5, 0, 0, 6);
    pub const V10_0_1_2: VersionNumber = VersionNumber::new(10, 0, 1, 2);
    pub const V10_0_1_8: VersionNumber = VersionNumber::new(10, 0, 1, 8);
    pub const V10_1_0_0: VersionNumber = VersionNumber::new(10, 1, 0, 0);
    pub const V10_1_0_106: VersionNumber = VersionNumber::new(10, 1, 0, 106);
    pub const V20_0_0_3: VersionNumber = VersionNumber::new(20, 0, 0, 3);
    pub const V20_0_0_4: VersionNumber = VersionNumber::new(20, 0, 0, 4);
    pub const V20_0_0_5: VersionNumber = VersionNumber::new(20, 0, 0, 5);
    pub const V20_1_0_1: VersionNumber = VersionNumber::new(20, 1, 0, 1);
    pub const V20_2_0_5: VersionNumber = VersionNumber::new(20, 2, 0, 5);
    pub const V20_2_0_7: VersionNumber = VersionNumber::new(20, 2, 0, 7);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_four_components() {
        assert_eq!(
            VersionNumber::parse("20.2.0.7").map(VersionNumber::raw),
            Some(0x1402_0007)
        );
    }

    #[test]
    fn pads_short_forms() {
        assert_eq!(VersionNumber::parse("10.1"), VersionNumber::parse("10.1.0.0"));
        assert_eq!(VersionNumber::parse("4").map(VersionNumber::raw), Some(0x0400_0000));
    }

    #[test]
    fn legacy_spelling_round_trips() {
        let v = VersionNumber::parse("3.03").unwrap();
        assert_eq!(v.raw(), 0x0300_0300);
        assert_eq!(v.to_string(), "3.03");
        assert!(v > VersionNumber::parse("3.0").unwrap());
        assert!(v < VersionNumber::parse("3.1").unwrap());
    }

    #[test]
    fn rejects_malformed() {
        for s in ["", "1..2", "1.2.3.4.5", "256.0", "a.b", "1.-2", " . "] {
            assert_eq!(VersionNumber::parse(s), None, "{s:?}");
        }
    }

    #[test]
    fn renders_dotted_quad() {
        assert_eq!(VersionNumber::new(10, 0, 1, 2).to_string(), "10.0.1.2");
        assert_eq!(known::V20_2_0_7.to_string(), "20.2.0.7");
    }
}
