//! `nifgen.json` project manifests: one schema, the exception rules that apply to it and
//! the artifacts to emit from it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nif_contracts::NIFGEN_PROJECT_SCHEMA_VERSIONS_SUPPORTED;
use nif_targets::TargetId;
use serde::Deserialize;
use tracing::info;

use crate::compile::{build_program, compile_program, CompileReport};
use crate::rules::ExceptionRule;
use crate::util::is_safe_relative_path;

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectManifest {
    pub schema_version: String,
    /// Schema document, relative to the manifest's directory.
    pub schema: String,
    pub targets: Vec<TargetSpec>,
    #[serde(default)]
    pub rules: Vec<ExceptionRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetSpec {
    pub target: TargetId,
    /// Output file, relative to the manifest's directory.
    pub out: String,
}

impl ProjectManifest {
    pub fn schema_path(&self, base: &Path) -> PathBuf {
        base.join(&self.schema)
    }

    pub fn out_path(&self, base: &Path, spec: &TargetSpec) -> PathBuf {
        base.join(&spec.out)
    }
}

fn validate_rel_path(field: &str, raw: &str) -> Result<()> {
    if raw.is_empty() {
        anyhow::bail!("{field} must be non-empty");
    }
    if !is_safe_relative_path(Path::new(raw)) {
        anyhow::bail!(
            "{field} must be a relative path without '..' segments, got {:?}",
            raw
        );
    }
    Ok(())
}

pub fn load_project_manifest(path: &Path) -> Result<ProjectManifest> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("read project: {}", path.display()))?;
    parse_project_manifest_bytes(&bytes, path)
}

pub fn parse_project_manifest_bytes(bytes: &[u8], path: &Path) -> Result<ProjectManifest> {
    let mut m: ProjectManifest = serde_json::from_slice(bytes)
        .with_context(|| format!("parse project JSON: {}", path.display()))?;

    m.schema_version = m.schema_version.trim().to_string();
    m.schema = m.schema.trim().to_string();
    for spec in &mut m.targets {
        spec.out = spec.out.trim().to_string();
    }

    if !NIFGEN_PROJECT_SCHEMA_VERSIONS_SUPPORTED.contains(&m.schema_version.as_str()) {
        anyhow::bail!(
            "project.schema_version mismatch: expected one of {:?} got {:?}",
            NIFGEN_PROJECT_SCHEMA_VERSIONS_SUPPORTED,
            m.schema_version
        );
    }
    validate_rel_path("project.schema", &m.schema)?;
    if m.targets.is_empty() {
        anyhow::bail!("project.targets must list at least one target");
    }
    let mut outs = BTreeSet::new();
    for (idx, spec) in m.targets.iter().enumerate() {
        validate_rel_path(&format!("project.targets[{idx}].out"), &spec.out)?;
        if !outs.insert(spec.out.as_str()) {
            anyhow::bail!("project.targets[{idx}].out repeats {:?}", spec.out);
        }
    }
    Ok(m)
}

/// Writes `src` to `path`, or with `check` fails when the file on disk differs.
pub fn write_or_check(path: &Path, src: &str, check: bool) -> Result<()> {
    if check {
        let cur = std::fs::read_to_string(path)
            .with_context(|| format!("read existing output: {}", path.display()))?;
        if cur != src {
            anyhow::bail!("generated output differs: {}", path.display());
        }
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir: {}", parent.display()))?;
    }
    std::fs::write(path, src.as_bytes())
        .with_context(|| format!("write output: {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub target: TargetId,
    pub out: PathBuf,
    pub report: CompileReport,
}

/// Compiles the manifest's schema once and emits every listed target.
pub fn build_project(manifest_path: &Path, check: bool) -> Result<Vec<BuildOutcome>> {
    let m = load_project_manifest(manifest_path)?;
    let base = manifest_path.parent().unwrap_or_else(|| Path::new(""));
    let schema_path = m.schema_path(base);
    let schema = std::fs::read(&schema_path)
        .with_context(|| format!("read schema: {}", schema_path.display()))?;
    let program = build_program(&schema, &m.rules)
        .with_context(|| format!("compile schema: {}", schema_path.display()))?;

    let mut outcomes = Vec::with_capacity(m.targets.len());
    for (idx, spec) in m.targets.iter().enumerate() {
        let out = m.out_path(base, spec);
        let compiled = compile_program(&program, spec.target)
            .with_context(|| format!("project.targets[{idx}] ({})", spec.target))?;
        write_or_check(&out, &compiled.source, check)?;
        info!(target = %spec.target, out = %out.display(), check, "project target done");
        outcomes.push(BuildOutcome {
            target: spec.target,
            out,
            report: compiled.report,
        });
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<ProjectManifest> {
        parse_project_manifest_bytes(json.as_bytes(), Path::new("nifgen.json"))
    }

    #[test]
    fn parses_targets_and_rules() {
        let m = parse(
            r#"{"schema_version": " nifgen.project@0.1.0 ", "schema": "nif.json",
                "targets": [{"target": "rust", "out": "gen/nif.rs"}, {"target": "c", "out": "gen/nif.h"}],
                "rules": [{"rule": "force_abstract", "entity": "NiExtraData"}]}"#,
        )
        .unwrap();
        assert_eq!(m.schema_version, "nifgen.project@0.1.0");
        assert_eq!(m.targets[1].target, TargetId::C);
        assert_eq!(m.rules.len(), 1);
        assert_eq!(
            m.out_path(Path::new("proj"), &m.targets[0]),
            Path::new("proj").join("gen/nif.rs")
        );
    }

    #[test]
    fn rejects_bad_manifests() {
        for json in [
            r#"{"schema_version": "nifgen.project@9.9.9", "schema": "nif.json", "targets": [{"target": "rust", "out": "a.rs"}]}"#,
            r#"{"schema_version": "nifgen.project@0.1.0", "schema": "../nif.json", "targets": [{"target": "rust", "out": "a.rs"}]}"#,
            r#"{"schema_version": "nifgen.project@0.1.0", "schema": "nif.json", "targets": [{"target": "rust", "out": "/tmp/a.rs"}]}"#,
            r#"{"schema_version": "nifgen.project@0.1.0", "schema": "nif.json", "targets": []}"#,
            r#"{"schema_version": "nifgen.project@0.1.0", "schema": "nif.json", "targets": [{"target": "go", "out": "a.go"}]}"#,
            r#"{"schema_version": "nifgen.project@0.1.0", "schema": "nif.json",
                "targets": [{"target": "rust", "out": "a"}, {"target": "c", "out": "a"}]}"#,
        ] {
            assert!(parse(json).is_err(), "{json}");
        }
    }

    #[test]
    fn check_mode_compares_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/nif.rs");
        assert!(write_or_check(&path, "x", true).is_err());
        write_or_check(&path, "x", false).unwrap();
        write_or_check(&path, "x", true).unwrap();
        let err = write_or_check(&path, "y", true).unwrap_err();
        assert!(format!("{err:#}").contains("generated output differs"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x");
    }
}
