use std::fmt;

use nif_targets::TargetId;
use serde::Serialize;
use tracing::info;

use crate::compact::{self, FoldStats};
use crate::emit_c;
use crate::emit_rust;
use crate::ir::Program;
use crate::model::Model;
use crate::rules::ExceptionRule;
use crate::schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum CompileErrorKind {
    Schema,
    Registry,
    SupertypeOrder,
    CountFoldAmbiguity,
    Expression,
    ExceptionRule,
    Emit,
    Internal,
}

impl CompileErrorKind {
    pub const ALL: [CompileErrorKind; 8] = [
        CompileErrorKind::Schema,
        CompileErrorKind::Registry,
        CompileErrorKind::SupertypeOrder,
        CompileErrorKind::CountFoldAmbiguity,
        CompileErrorKind::Expression,
        CompileErrorKind::ExceptionRule,
        CompileErrorKind::Emit,
        CompileErrorKind::Internal,
    ];

    pub fn code_str(self) -> &'static str {
        match self {
            CompileErrorKind::Schema => "NIFC0001",
            CompileErrorKind::Registry => "NIFC0002",
            CompileErrorKind::SupertypeOrder => "NIFC0003",
            CompileErrorKind::CountFoldAmbiguity => "NIFC0004",
            CompileErrorKind::Expression => "NIFC0005",
            CompileErrorKind::ExceptionRule => "NIFC0006",
            CompileErrorKind::Emit => "NIFC0007",
            CompileErrorKind::Internal => "NIFC0901",
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            CompileErrorKind::Schema => "malformed schema document",
            CompileErrorKind::Registry => "type has no rule for the requested read",
            CompileErrorKind::SupertypeOrder => "supertype referenced before its declaration",
            CompileErrorKind::CountFoldAmbiguity => "array count has no usable prefix width",
            CompileErrorKind::Expression => "invalid schema expression",
            CompileErrorKind::ExceptionRule => "exception rule does not match the schema",
            CompileErrorKind::Emit => "construct cannot be expressed in the target",
            CompileErrorKind::Internal => "internal nifc bug",
        }
    }

    pub fn default_help(self) -> Option<&'static str> {
        match self {
            CompileErrorKind::SupertypeOrder => {
                Some("Move the supertype's entry above every object that inherits from it.")
            }
            CompileErrorKind::CountFoldAmbiguity => Some(
                "Declare the count as an 8, 16 or 32-bit integer, or give the array an explicit length expression.",
            ),
            CompileErrorKind::Registry => Some(
                "Line, header and byte-blob strings cannot be read as arrays; wrap them in a compound.",
            ),
            CompileErrorKind::Internal => {
                Some("This is a bug in nifc. Please report it with the schema that triggered it.")
            }
            _ => None,
        }
    }
}

/// A schema authoring error. Aborts the whole compiler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}: {}", self.kind.code_str(), self.kind, self.message)?;
        if let Some(help) = self.kind.default_help() {
            write!(f, "\n  help: {help}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

pub fn render_diagnostics_md() -> String {
    let mut out = String::new();
    out.push_str("# nifc diagnostics catalog\n\n");
    out.push_str("This document is generated from `crates/nifc/src/compile.rs`.\n\n");
    out.push_str("| Code | Kind | Message | Help |\n");
    out.push_str("| ---- | ---- | ------- | ---- |\n");
    for kind in CompileErrorKind::ALL {
        out.push_str(&format!(
            "| {} | {:?} | {} | {} |\n",
            kind.code_str(),
            kind,
            kind.default_message(),
            kind.default_help().unwrap_or("")
        ));
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub target: TargetId,
    pub rules: Vec<ExceptionRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompileReport {
    pub entities: usize,
    pub objects: usize,
    pub dispatch_entries: usize,
    pub folds: FoldStats,
    pub rules_applied: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub source: String,
    pub report: CompileReport,
}

/// Schema bytes to model to compacted IR. Shared by every backend and by `nifc ir`.
pub fn build_program(schema_bytes: &[u8], rules: &[ExceptionRule]) -> Result<Program, CompileError> {
    let doc = schema::parse_schema(schema_bytes)?;
    let mut model = Model::build(&doc, crate::util::sha256_hex(schema_bytes))?;
    crate::rules::apply_rules(&mut model, rules)?;
    compact::compact_model(model)
}

pub fn compile_schema(
    schema_bytes: &[u8],
    options: &CompileOptions,
) -> Result<CompileOutput, CompileError> {
    let program = build_program(schema_bytes, &options.rules)?;
    compile_program(&program, options.target)
}

pub fn compile_program(program: &Program, target: TargetId) -> Result<CompileOutput, CompileError> {
    let source = match target {
        TargetId::Rust => emit_rust::emit(program)?,
        TargetId::C => emit_c::emit(program)?,
    };
    let report = CompileReport {
        entities: program.model.entities.len(),
        objects: program.model.objects().count(),
        dispatch_entries: program.model.dispatch_names().len(),
        folds: program.stats.clone(),
        rules_applied: program.model.rules_applied.clone(),
    };
    info!(
        target = %target,
        bytes = source.len(),
        dispatch_entries = report.dispatch_entries,
        "emitted artifact"
    );
    Ok(CompileOutput { source, report })
}
