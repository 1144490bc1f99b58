use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nif_targets::TargetId;
use tracing_subscriber::EnvFilter;

use nifc::compile::{self, CompileOptions};
use nifc::project;

#[derive(Parser)]
#[command(name = "nifc")]
#[command(about = "NIF schema compiler (schema -> Rust/C decoders).", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Compile one schema for one target.
    Compile {
        #[arg(long)]
        schema: PathBuf,
        #[arg(long, value_enum, default_value_t = TargetId::Rust)]
        target: TargetId,
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
        /// If set, fail if the output differs; do not write.
        #[arg(long, default_value_t = false, requires = "out")]
        check: bool,
    },
    /// Build every target of a nifgen.json project.
    Build {
        #[arg(long)]
        project: PathBuf,
        /// If set, fail if any output differs; do not write.
        #[arg(long, default_value_t = false)]
        check: bool,
    },
    /// Print the compacted IR as JSON.
    Ir {
        #[arg(long)]
        schema: PathBuf,
        #[arg(long)]
        entity: Option<String>,
    },
    /// Print the catalog of compile error codes.
    Diagnostics,
}

fn main() -> ExitCode {
    init_tracing();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("NIFC_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Compile {
            schema,
            target,
            out,
            check,
        } => {
            let bytes = read_schema(&schema)?;
            let options = CompileOptions {
                target,
                rules: Vec::new(),
            };
            let output = compile::compile_schema(&bytes, &options)
                .with_context(|| format!("compile schema: {}", schema.display()))?;
            match out {
                Some(path) => project::write_or_check(&path, &output.source, check)?,
                None => print!("{}", output.source),
            }
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Build { project, check } => {
            let outcomes = project::build_project(&project, check)?;
            for o in outcomes {
                eprintln!(
                    "{} {} ({} dispatch entries, {} counts folded, {} gates folded)",
                    if check { "checked" } else { "wrote" },
                    o.out.display(),
                    o.report.dispatch_entries,
                    o.report.folds.counts_folded,
                    o.report.folds.gates_folded
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Ir { schema, entity } => {
            let bytes = read_schema(&schema)?;
            let program = compile::build_program(&bytes, &[])
                .with_context(|| format!("compile schema: {}", schema.display()))?;
            let ir = program.ir_json(entity.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&ir)?);
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Diagnostics => {
            print!("{}", compile::render_diagnostics_md());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn read_schema(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read schema: {}", path.display()))
}
