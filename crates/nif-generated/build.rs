use std::path::PathBuf;

use anyhow::Context;
use nif_targets::TargetId;
use nifc::compile::{compile_schema, CompileOptions};

fn main() -> anyhow::Result<()> {
    let manifest_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR")?);
    let schema = manifest_dir.join("../../schemas/nif.json");
    println!("cargo:rerun-if-changed={}", schema.display());

    let bytes = std::fs::read(&schema).with_context(|| format!("read {}", schema.display()))?;
    let options = CompileOptions {
        target: TargetId::Rust,
        rules: Vec::new(),
    };
    let out = compile_schema(&bytes, &options)?;

    // `include!` cannot carry inner attributes; the wrapping module repeats them.
    let source: String = out
        .source
        .lines()
        .filter(|l| !l.starts_with("#!["))
        .flat_map(|l| [l, "\n"])
        .collect();
    let dest = PathBuf::from(std::env::var("OUT_DIR")?).join("nif.rs");
    std::fs::write(&dest, source).with_context(|| format!("write {}", dest.display()))?;
    Ok(())
}
