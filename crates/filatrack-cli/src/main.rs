//! filatrack CLI: batch filament tracking over a frame bundle.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use filatrack::{FilamentTask, TaskContext, TrackerConfig};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "filatrack")]
#[command(about = "Track curvilinear filaments through a time-lapse image bundle")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track every seed through the bundle and write one archive per filament.
    Track(CliTrackArgs),

    /// Print the default configuration as JSON.
    ShowConfig,
}

#[derive(Debug, Clone, Args)]
struct CliTrackArgs {
    /// Bundle directory (enhanced/, binaries/, skeletons/, gvf_*/, branching_coords.json).
    #[arg(long)]
    bundle: PathBuf,

    /// Seed polylines: a JSON object of name -> [[x, y], ...] or a directory of x,y CSV files.
    #[arg(long)]
    seeds: PathBuf,

    /// Output directory for per-filament archives, per-frame CSV tables and summary.json.
    #[arg(long)]
    out: PathBuf,

    /// Tracker configuration (JSON). Missing fields use defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker count (default: available processors).
    #[arg(long)]
    workers: Option<usize>,

    /// Run filaments one after another in-process.
    #[arg(long)]
    sequential: bool,

    /// Override the maximum relaxation iterations per frame.
    #[arg(long)]
    max_iter: Option<usize>,

    /// Print only the completed/failed counts, not the failed filaments.
    #[arg(long)]
    quiet: bool,
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Track(args) => run_track(&args),
        Commands::ShowConfig => run_show_config(),
    }
}

// ── show-config ───────────────────────────────────────────────────────

fn run_show_config() -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(&TrackerConfig::default())?);
    Ok(())
}

// ── track ─────────────────────────────────────────────────────────────

fn load_config(args: &CliTrackArgs) -> CliResult<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading config: {}", path.display());
            TrackerConfig::from_json_file(path)?
        }
        None => TrackerConfig::default(),
    };
    if let Some(n) = args.workers {
        config.parallel.workers = Some(n);
    }
    if args.sequential {
        config.parallel.enabled = false;
    }
    if let Some(n) = args.max_iter {
        config.evolution.max_iter = n;
    }
    config.validate()?;
    Ok(config)
}

fn run_track(args: &CliTrackArgs) -> CliResult<()> {
    let config = load_config(args)?;

    tracing::info!("Loading bundle: {}", args.bundle.display());
    let bundle = Arc::new(filatrack::load_bundle(&args.bundle)?);

    tracing::info!("Loading seeds: {}", args.seeds.display());
    let seeds = filatrack::load_seeds(&args.seeds)?;
    let tasks = FilamentTask::from_seeds(seeds);
    tracing::info!("{} filaments to track", tasks.len());

    let ctx = TaskContext::new(bundle, config, Some(args.out.clone()));
    let report = filatrack::run_batch(&tasks, &ctx)?;

    let summary = args.out.join("summary.json");
    filatrack::io::write_json(&summary, &report)?;
    tracing::info!("Summary written to {}", summary.display());

    if !args.quiet {
        for f in &report.failed {
            println!("failed  {:>4}  {}  [{}] {}", f.index, f.name, f.kind, f.reason);
        }
    }
    println!(
        "{} completed, {} failed",
        report.completed.len(),
        report.failed.len()
    );
    Ok(())
}
