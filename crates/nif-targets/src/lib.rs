//! Shared registry of emitter backends.
//!
//! Both the compiler library and its CLI (and project manifests) name backends through
//! this crate, so the set of targets is closed and spelled one way everywhere.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetId {
    #[default]
    Rust,
    C,
}

impl TargetId {
    pub const ALL: [TargetId; 2] = [TargetId::Rust, TargetId::C];

    pub fn as_str(self) -> &'static str {
        match self {
            TargetId::Rust => "rust",
            TargetId::C => "c",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rust" | "rs" => Some(TargetId::Rust),
            "c" => Some(TargetId::C),
            _ => None,
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TargetParseError {
    value: String,
}

impl fmt::Display for TargetParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid target {:?} (expected one of: rust, c)",
            self.value
        )
    }
}

impl std::error::Error for TargetParseError {}

impl FromStr for TargetId {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetId::parse(s).ok_or_else(|| TargetParseError {
            value: s.trim().to_string(),
        })
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for TargetId {
    fn value_variants<'a>() -> &'a [Self] {
        &TargetId::ALL
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            TargetId::Rust => Some(clap::builder::PossibleValue::new("rust").alias("rs")),
            TargetId::C => Some(clap::builder::PossibleValue::new("c")),
        }
    }
}
