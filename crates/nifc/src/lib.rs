//! Versioned binary-schema compiler for NIF files.
//!
//! A declarative schema document becomes a [`model::Model`], the compactor folds counts
//! and `Has…` gates and merges guard runs into a read tree per record, and one emitter per
//! [`nif_targets::TargetId`] prints decoder source against the decode contract.

pub mod compact;
pub mod compile;
pub mod emit_c;
pub mod emit_common;
pub mod emit_rust;
pub mod expr;
pub mod guard;
pub mod ir;
pub mod model;
pub mod project;
pub mod registry;
pub mod rules;
pub mod schema;
pub mod util;
