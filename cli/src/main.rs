//! bugsmc - run the bundled OpenBUGS example models and summarize the posterior.

use anyhow::{bail, Context, Result};
use bugsmc_core::diagnostics::{compute_diagnostics, DiagnosticsReport};
use bugsmc_core::models::{check_reference, ModelKind, ReferenceCheck};
use bugsmc_core::sampler::{sample, SamplerConfig, SamplerKind};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bugsmc")]
#[command(version)]
#[command(about = "OpenBUGS example models sampled with adaptive Metropolis or HMC")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Default log level (RUST_LOG overrides it)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Air: Berkson measurement error
    Air(RunArgs),

    /// Surgical: institutional ranking
    Surgical(RunArgs),

    /// List the bundled models
    List,
}

#[derive(Args)]
struct RunArgs {
    /// Sampler configuration file (TOML); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Total iterations per chain, burn-in included
    #[arg(short = 'n', long)]
    iterations: Option<usize>,

    /// Burn-in iterations discarded from the trace
    #[arg(short, long)]
    burn: Option<usize>,

    /// Keep every k-th iteration after burn-in
    #[arg(short, long)]
    thin: Option<usize>,

    #[arg(long)]
    chains: Option<usize>,

    #[arg(short, long)]
    seed: Option<u64>,

    /// Worker threads for chains (0 = rayon default)
    #[arg(long)]
    threads: Option<usize>,

    #[arg(long, value_enum)]
    sampler: Option<SamplerArg>,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Compare posterior means with the reference results
    #[arg(long)]
    check: bool,

    /// Allowed deviation for --check, in reference standard deviations
    #[arg(long, default_value_t = 0.5)]
    tolerance: f64,

    /// Show a progress line on stderr while sampling
    #[arg(long)]
    progress: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum SamplerArg {
    Metropolis,
    Hmc,
}

impl From<SamplerArg> for SamplerKind {
    fn from(arg: SamplerArg) -> Self {
        match arg {
            SamplerArg::Metropolis => SamplerKind::Metropolis,
            SamplerArg::Hmc => SamplerKind::Hmc,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    model: &'a str,
    sampler: String,
    summary: &'a DiagnosticsReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    checks: Option<&'a [ReferenceCheck]>,
}

fn setup_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level '{}'", level))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_config(args: &RunArgs) -> Result<SamplerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => SamplerConfig::default(),
    };

    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if let Some(burn) = args.burn {
        config.burn = burn;
    }
    if let Some(thin) = args.thin {
        config.thin = thin;
    }
    if let Some(chains) = args.chains {
        config.num_chains = chains;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(threads) = args.threads {
        config.num_threads = threads;
    }
    if let Some(sampler) = args.sampler {
        config.kind = sampler.into();
    }
    if args.progress {
        config.progress = true;
    }

    config.validate()?;
    Ok(config)
}

fn validate_tolerance(tolerance: f64) -> Result<()> {
    if !tolerance.is_finite() || tolerance < 0.0 {
        bail!(
            "--tolerance must be a non-negative number of standard deviations, got {}",
            tolerance
        );
    }
    Ok(())
}

/// Error naming every node whose check failed.
fn ensure_checks_passed(checks: &[ReferenceCheck]) -> Result<()> {
    let failed: Vec<&str> = checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.node.as_str())
        .collect();
    if !failed.is_empty() {
        bail!("posterior out of reference range for: {}", failed.join(", "));
    }
    Ok(())
}

fn run(kind: ModelKind, args: &RunArgs) -> Result<()> {
    validate_tolerance(args.tolerance)?;
    let config = load_config(args)?;
    let model = kind
        .build()
        .with_context(|| format!("failed to build model '{}'", kind))?;
    info!(
        "Sampling {} with {}: {} iterations, {} burn-in, thin {}",
        kind, config.kind, config.iterations, config.burn, config.thin
    );

    let result = sample(&model.graph, &config).context("sampling failed")?;
    let report = compute_diagnostics(
        &result.samples,
        &result.trace_names,
        &result.accept_rates,
        result.divergences,
    );

    let checks = if args.check {
        Some(check_reference(&report, &model.reference, args.tolerance)?)
    } else {
        None
    };

    match args.format {
        OutputFormat::Table => {
            println!("{}", kind.description());
            println!();
            println!("{}", report.to_table());
            if let Some(checks) = &checks {
                println!();
                println!("Reference check (tolerance {} sd):", args.tolerance);
                for c in checks {
                    println!(
                        "  {:<10} mean {:>10.4}  reference {:>10.4} ± {:<8.4} {:>5.2} sd  {}",
                        c.node,
                        c.posterior_mean,
                        c.reference_mean,
                        c.reference_sd,
                        c.deviation,
                        if c.passed { "ok" } else { "FAIL" }
                    );
                }
            }
        }
        OutputFormat::Json => {
            let output = JsonOutput {
                model: model.name,
                sampler: config.kind.to_string(),
                summary: &report,
                checks: checks.as_deref(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    match &checks {
        Some(checks) => ensure_checks_passed(checks),
        None => Ok(()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    match &cli.command {
        Commands::Air(args) => run(ModelKind::Air, args),
        Commands::Surgical(args) => run(ModelKind::Surgical, args),
        Commands::List => {
            for kind in ModelKind::ALL {
                println!("{:<10} {}", kind.name(), kind.description());
            }
            Ok(())
        }
    }
}
