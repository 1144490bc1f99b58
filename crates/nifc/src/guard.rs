use std::fmt;

use nif_runtime::VersionNumber;
use serde::Serialize;

use crate::expr::{Env, Expr};

/// The version half of a field guard: an inclusive version interval plus optional
/// user-version equalities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct VersionGate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<VersionNumber>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<VersionNumber>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_version_2: Option<u32>,
}

impl VersionGate {
    pub fn is_always(&self) -> bool {
        *self == VersionGate::default()
    }

    pub fn admits(&self, version: u32, user_version: u32, user_version_2: u32) -> bool {
        self.since.map_or(true, |v| version >= v.raw())
            && self.until.map_or(true, |v| version <= v.raw())
            && self.user_version.map_or(true, |v| user_version == v)
            && self.user_version_2.map_or(true, |v| user_version_2 == v)
    }

    /// True when no version context satisfies both gates.
    pub fn is_disjoint_from(&self, other: &VersionGate) -> bool {
        let below = |until: Option<VersionNumber>, since: Option<VersionNumber>| {
            matches!((until, since), (Some(u), Some(s)) if u < s)
        };
        below(self.until, other.since)
            || below(other.until, self.since)
            || matches!((self.user_version, other.user_version), (Some(a), Some(b)) if a != b)
            || matches!((self.user_version_2, other.user_version_2), (Some(a), Some(b)) if a != b)
    }

    /// True for `[..=u]` against `[u+1..]` (either order) with no user-version tests.
    pub fn is_complement_of(&self, other: &VersionGate) -> bool {
        if self.user_version.is_some()
            || self.user_version_2.is_some()
            || other.user_version.is_some()
            || other.user_version_2.is_some()
        {
            return false;
        }
        let splits = |lo: &VersionGate, hi: &VersionGate| match (lo.since, lo.until, hi.since, hi.until)
        {
            (None, Some(u), Some(s), None) => u.raw().checked_add(1) == Some(s.raw()),
            _ => false,
        };
        splits(self, other) || splits(other, self)
    }
}

impl fmt::Display for VersionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_always() {
            return f.write_str("always");
        }
        let mut parts = Vec::new();
        match (self.since, self.until) {
            (Some(s), Some(u)) => parts.push(format!("{s}..={u}")),
            (Some(s), None) => parts.push(format!("{s}..")),
            (None, Some(u)) => parts.push(format!("..={u}")),
            (None, None) => {}
        }
        if let Some(v) = self.user_version {
            parts.push(format!("uv={v}"));
        }
        if let Some(v) = self.user_version_2 {
            parts.push(format!("uv2={v}"));
        }
        f.write_str(&parts.join(" "))
    }
}

/// The full presence condition of one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Guard {
    pub version: VersionGate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cond: Option<Expr>,
}

impl Guard {
    pub fn is_always(&self) -> bool {
        self.version.is_always() && self.cond.is_none()
    }

    pub fn references(&self, name: &str) -> bool {
        self.cond.as_ref().is_some_and(|c| c.references(name))
    }

    pub fn holds(&self, ctx: &EvalContext, env: &dyn Env) -> bool {
        self.version
            .admits(ctx.version, ctx.user_version, ctx.user_version_2)
            && self.cond.as_ref().map_or(true, |c| c.eval(env) != 0)
    }
}

/// The file-level numbers a guard is tested against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalContext {
    pub version: u32,
    pub user_version: u32,
    pub user_version_2: u32,
    pub arg: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Option<VersionNumber> {
        VersionNumber::parse(s)
    }

    #[test]
    fn admits_inclusive_bounds() {
        let g = VersionGate {
            since: v("10.0.1.0"),
            until: v("20.0.0.5"),
            ..VersionGate::default()
        };
        assert!(g.admits(0x0A00_0100, 0, 0));
        assert!(g.admits(0x1400_0005, 0, 0));
        assert!(!g.admits(0x1400_0006, 0, 0));
        let uv = VersionGate {
            user_version: Some(12),
            ..VersionGate::default()
        };
        assert!(uv.admits(0, 12, 0));
        assert!(!uv.admits(0, 11, 0));
    }

    #[test]
    fn split_ranges_are_complements() {
        let lo = VersionGate {
            until: v("20.2.0.6"),
            ..VersionGate::default()
        };
        let hi = VersionGate {
            since: v("20.2.0.7"),
            ..VersionGate::default()
        };
        assert!(lo.is_complement_of(&hi));
        assert!(hi.is_complement_of(&lo));
        assert!(lo.is_disjoint_from(&hi));
        let later = VersionGate {
            since: v("20.2.0.8"),
            ..VersionGate::default()
        };
        assert!(!lo.is_complement_of(&later));
        assert!(lo.is_disjoint_from(&later));
    }

    #[test]
    fn user_versions_make_gates_disjoint() {
        let a = VersionGate {
            user_version: Some(11),
            ..VersionGate::default()
        };
        let b = VersionGate {
            user_version: Some(12),
            ..VersionGate::default()
        };
        assert!(a.is_disjoint_from(&b));
        assert!(!a.is_complement_of(&b));
        assert!(!a.is_disjoint_from(&VersionGate::default()));
    }

    #[test]
    fn display_is_compact() {
        let g = VersionGate {
            since: v("10.1.0.0"),
            user_version_2: Some(34),
            ..VersionGate::default()
        };
        assert_eq!(g.to_string(), "10.1.0.0.. uv2=34");
        assert_eq!(VersionGate::default().to_string(), "always");
    }
}
