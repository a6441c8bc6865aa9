use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cnpjload::{
    config::{Durability, EtlConfig, InputSpec, RerunPolicy},
    export::{self, ProspectFilter},
    pipeline::Pipeline,
};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::{task, time::Instant};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cnpjload", version, about = "Load the CNPJ open-data files into SQLite")]
struct Cli {
    /// YAML configuration; command-line flags override it.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load every input, then build indexes and run ANALYZE.
    Load(RunArgs),
    /// Transform the inputs without touching the database.
    Check(RunArgs),
    /// Write the prospecting join as a `;`-separated CSV.
    Export(ExportArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Inputs as `table=path-or-glob`, e.g. `empresas=data/Empresas*.zip`.
    inputs: Vec<String>,

    #[arg(long)]
    db: Option<PathBuf>,

    #[arg(long)]
    block_size: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long, value_enum)]
    durability: Option<Durability>,

    #[arg(long, value_enum)]
    rerun: Option<RerunPolicy>,

    /// Decode and insert on a single thread.
    #[arg(long)]
    no_prefetch: bool,

    /// Write the run report as JSON.
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[arg(long)]
    db: Option<PathBuf>,

    #[arg(long, short, default_value = "resultado_final.csv")]
    out: PathBuf,

    /// Municipality codes, comma separated.
    #[arg(long, value_delimiter = ',')]
    municipio: Vec<i64>,

    /// Registration status codes, comma separated.
    #[arg(long, value_delimiter = ',')]
    situacao: Vec<i64>,

    /// CNAE codes, comma separated.
    #[arg(long, value_delimiter = ',')]
    cnae: Vec<i64>,
}

fn load_config(path: Option<&Path>) -> Result<EtlConfig> {
    match path {
        Some(p) => EtlConfig::from_yaml_file(p)
            .with_context(|| format!("loading config {}", p.display())),
        None => Ok(EtlConfig::default()),
    }
}

fn apply_overrides(config: &mut EtlConfig, args: &RunArgs) -> Result<()> {
    if let Some(db) = &args.db {
        config.database = db.clone();
    }
    if let Some(n) = args.block_size {
        config.block_size = n;
    }
    if let Some(n) = args.batch_size {
        config.batch_size = n;
    }
    if let Some(d) = args.durability {
        config.durability = d;
    }
    if let Some(r) = args.rerun {
        config.rerun = r;
    }
    if args.no_prefetch {
        config.prefetch = false;
    }
    if !args.inputs.is_empty() {
        config.inputs = args
            .inputs
            .iter()
            .map(|s| InputSpec::parse(s))
            .collect::<cnpjload::error::Result<Vec<_>>>()?;
    }
    if config.inputs.is_empty() {
        anyhow::bail!("no inputs: pass `table=path` arguments or list them under `inputs:` in the config");
    }
    Ok(())
}

fn write_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    fs::write(path, json).with_context(|| format!("writing report {}", path.display()))?;
    info!(path = %path.display(), "report written");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    let start = Instant::now();

    // ─── 2) dispatch; the pipeline is blocking I/O end to end ─────────
    match cli.command {
        Command::Load(args) => {
            apply_overrides(&mut config, &args)?;
            let mut pipeline = Pipeline::new(config)?;
            let report = task::spawn_blocking(move || pipeline.run())
                .await
                .context("load task panicked")?;
            let report = match report {
                Ok(r) => r,
                Err(e) if e.is_input_error() => {
                    error!(error = %e, "load stopped on bad input; the database keeps every committed batch");
                    return Err(e.into());
                }
                Err(e) => {
                    error!(error = %e, "load failed in the store; the database keeps every committed batch");
                    return Err(e.into());
                }
            };
            if let Some(path) = &args.report {
                write_report(path, &report)?;
            }
            info!(
                inserted = report.inserted(),
                dropped = report.transform().dropped,
                elapsed = ?start.elapsed(),
                "done"
            );
        }
        Command::Check(args) => {
            apply_overrides(&mut config, &args)?;
            let pipeline = Pipeline::new(config)?;
            let reports = task::spawn_blocking(move || pipeline.check())
                .await
                .context("check task panicked")??;
            for r in &reports {
                info!(
                    table = %r.table,
                    file = %r.file,
                    records = r.transform.records,
                    kept = r.transform.transformed,
                    dropped = r.transform.dropped,
                    nulled = r.transform.nulled,
                    "checked"
                );
            }
            if let Some(path) = &args.report {
                write_report(path, &reports)?;
            }
        }
        Command::Export(args) => {
            let db = args.db.unwrap_or(config.database);
            let filter = ProspectFilter {
                municipios: args.municipio,
                situacoes: args.situacao,
                cnaes: args.cnae,
            };
            let out = args.out;
            let rows = task::spawn_blocking(move || export::export_to_path(&db, &filter, &out))
                .await
                .context("export task panicked")??;
            info!(rows, elapsed = ?start.elapsed(), "export done");
        }
    }
    Ok(())
}
