//! SC Risk CLI
//!
//! Builds leakage-free safety car forecasting datasets from per-session
//! race telemetry.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use sc_risk_core::{
    config::{FailurePolicy, PipelineConfig},
    core::{FeatureAssembler, TableFormat, TimeGrid},
    ingest::{self, SessionInput},
    VERSION,
};

#[derive(Parser)]
#[command(name = "sc-risk")]
#[command(version = VERSION)]
#[command(about = "Safety car risk dataset builder", long_about = None)]
struct Cli {
    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the labeled, partitioned master table
    Build {
        /// Directory (or single file) of session documents
        #[arg(long, short)]
        input: PathBuf,

        /// Output directory
        #[arg(long, short)]
        output: PathBuf,

        /// Configuration file (defaults to the user config path)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Master table format
        #[arg(long, value_enum, default_value = "csv")]
        format: OutputFormat,

        /// Abort on the first failing session instead of excluding it
        #[arg(long)]
        fail_fast: bool,

        /// Worker threads (0 = one per core)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Print detected intervention intervals for a session document
    Events {
        /// Session document
        #[arg(long, short)]
        input: PathBuf,

        /// Configuration file (defaults to the user config path)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Check session documents without building
    Validate {
        /// Directory (or single file) of session documents
        #[arg(long, short)]
        input: PathBuf,
    },

    /// Show configuration
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

impl From<OutputFormat> for TableFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Csv => TableFormat::Csv,
            OutputFormat::Json => TableFormat::Json,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Build {
            input,
            output,
            config,
            format,
            fail_fast,
            workers,
        } => cmd_build(
            &input,
            &output,
            config.as_deref(),
            format.into(),
            fail_fast,
            workers,
        ),
        Commands::Events { input, config } => cmd_events(&input, config.as_deref()),
        Commands::Validate { input } => cmd_validate(&input),
        Commands::Config { init } => cmd_config(init),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load_from(path)
            .with_context(|| format!("failed to load config from {path:?}")),
        None => PipelineConfig::load().context("failed to load config"),
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {path:?}"))
}

fn cmd_build(
    input: &Path,
    output: &Path,
    config_path: Option<&Path>,
    format: TableFormat,
    fail_fast: bool,
    workers: Option<usize>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if fail_fast {
        config.build.failure_policy = FailurePolicy::Abort;
    }
    if let Some(workers) = workers {
        config.build.workers = workers;
    }

    let sessions = ingest::load_sessions(input)
        .with_context(|| format!("failed to load sessions from {input:?}"))?;
    println!("Loaded {} session(s) from {:?}", sessions.len(), input);

    let assembler = FeatureAssembler::new(&config)?;
    let build = assembler.build(&sessions)?;

    std::fs::create_dir_all(output)
        .with_context(|| format!("failed to create output directory {output:?}"))?;

    let table_path = output.join(match format {
        TableFormat::Csv => "master_table.csv",
        TableFormat::Json => "master_table.json",
    });
    build
        .master
        .save(&table_path, format)
        .with_context(|| format!("failed to write {table_path:?}"))?;
    build
        .manifest
        .save(&output.join("manifest.json"))
        .context("failed to write manifest")?;
    write_json(&output.join("split_plan.json"), &build.plan)?;
    write_json(
        &output.join("session_summaries.json"),
        &build.manifest.summaries,
    )?;

    println!();
    println!("{}", build.manifest.summary());
    println!();
    println!("Wrote {:?}", table_path);
    Ok(())
}

fn cmd_events(input: &Path, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let assembler = FeatureAssembler::new(&config)?;
    let labeler = assembler.labeler();

    let sessions = ingest::load_session_file(input)
        .with_context(|| format!("failed to load {input:?}"))?;

    for session in &sessions {
        let prepared = session.prepared()?;
        let meta = &prepared.session;
        let grid = TimeGrid::build(meta, &config.grid)?;
        let messages = prepared.race_control.as_deref().unwrap_or_default();
        let labels = labeler.label(&grid, messages, meta.end);

        println!("Session {} ({})", meta.session_id, meta.group_key);
        println!("  {} -> {}", meta.start, meta.end);
        println!(
            "  Grid points: {} ({} positive)",
            grid.len(),
            labels.positive_count()
        );

        if labels.events.is_empty() {
            println!("  No interventions detected");
        }
        for event in &labels.events {
            println!(
                "  {:?}: +{}s to +{}s ({} detection(s))",
                event.kind,
                (event.start - meta.start).num_seconds(),
                (event.end - meta.start).num_seconds(),
                event.detections
            );
        }
        for message in &labels.ambiguous {
            println!(
                "  Ambiguous at +{}s: {}",
                (message.timestamp - meta.start).num_seconds(),
                message.message
            );
        }
        if labels.unpaired_ends > 0 {
            println!("  Unpaired end markers: {}", labels.unpaired_ends);
        }
        println!();
    }
    Ok(())
}

fn cmd_validate(input: &Path) -> Result<()> {
    let sessions: Vec<SessionInput> = ingest::load_sessions(input)
        .with_context(|| format!("failed to load sessions from {input:?}"))?;

    println!("Validating {} session(s) from {:?}", sessions.len(), input);
    println!();

    let mut seen = BTreeSet::new();
    let mut problems = 0usize;
    for session in &sessions {
        let id = &session.session.session_id;
        if !seen.insert(id.as_str()) {
            println!("  {id}: duplicate session id");
            problems += 1;
            continue;
        }
        if let Err(e) = session.session.validate() {
            println!("  {id}: {e}");
            problems += 1;
            continue;
        }

        let missing = session.missing_streams();
        if missing.is_empty() {
            println!("  {id}: ok ({} records)", session.record_count());
        } else {
            let names: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
            println!(
                "  {id}: ok ({} records, missing {})",
                session.record_count(),
                names.join(", ")
            );
        }
    }

    println!();
    if problems > 0 {
        bail!("{problems} session(s) failed validation");
    }
    println!("All sessions valid.");
    Ok(())
}

fn cmd_config(init: bool) -> Result<()> {
    let path = PipelineConfig::config_path();

    if init {
        PipelineConfig::default()
            .save_to(&path)
            .with_context(|| format!("failed to write {path:?}"))?;
        println!("Wrote default configuration to {path:?}");
        return Ok(());
    }

    let config = PipelineConfig::load().context("failed to load config")?;

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {path:?}");
    println!("Fingerprint: {}", config.fingerprint());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
