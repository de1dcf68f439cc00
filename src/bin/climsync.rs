use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use climsync::app::App;
use climsync::config::{ConfigLoader, ResolvedConfig};
use climsync::domain::{FunctionalId, NearestMode};
use climsync::error::SyncError;
use climsync::output::{JsonOutput, LogProgress};
use climsync::probe::SystemProbe;
use climsync::transfer::DeleteScope;

#[derive(Parser)]
#[command(name = "climsync")]
#[command(about = "Replica-aware metadata pipeline and transfer lifecycle for climate archives")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    nearest_mode: Option<NearestMode>,

    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the post-search pipeline and print the kept records")]
    Filter(InputArgs),
    #[command(about = "Filter search results and queue the files for download")]
    Install(InputArgs),
    #[command(about = "Mark transfers for deletion")]
    Remove(RemoveArgs),
    #[command(about = "Delete transfers marked for deletion")]
    Sweep(SweepArgs),
    #[command(about = "Purge error and waiting transfers and orphaned datasets")]
    Reset,
    #[command(about = "Show dataset versions, oldest first, with the latest one")]
    Latest(InputArgs),
}

#[derive(Args)]
struct InputArgs {
    /// Search results as a JSON array or JSON lines.
    input: Utf8PathBuf,
}

#[derive(Args)]
struct RemoveArgs {
    #[arg(required = true)]
    ids: Vec<String>,
}

#[derive(Args)]
struct SweepArgs {
    #[arg(long)]
    limit: Option<usize>,

    /// Keep local files and drop only the catalog rows.
    #[arg(long)]
    metadata_only: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::Configuration(_) | SyncError::ConfigRead(_) | SyncError::ConfigParse(_) => 2,
        SyncError::NotFound(_) => 2,
        SyncError::Probe { .. }
        | SyncError::ProbeHttp(_)
        | SyncError::ProbeStatus { .. }
        | SyncError::ProbeResponse(_) => 3,
        SyncError::Version { .. } | SyncError::Fatal(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(mode) = cli.nearest_mode {
        config.nearest_mode = mode;
    }
    let app = build_app(config)?;
    let sink = LogProgress;

    match cli.command {
        Commands::Filter(args) => {
            let input = app.load_records(&args.input)?;
            let result = app.filter(input, &sink)?;
            JsonOutput::print_filter(&result).into_diagnostic()?;
        }
        Commands::Install(args) => {
            let input = app.load_records(&args.input)?;
            let result = app.install(input, &sink)?;
            JsonOutput::print_install(&result).into_diagnostic()?;
        }
        Commands::Remove(args) => {
            let ids = args
                .ids
                .iter()
                .map(|id| id.parse::<FunctionalId>())
                .collect::<Result<Vec<_>, _>>()?;
            let result = app.remove(&ids, &sink)?;
            JsonOutput::print_remove(&result).into_diagnostic()?;
        }
        Commands::Sweep(args) => {
            let scope = if args.metadata_only {
                DeleteScope::MetadataOnly
            } else {
                DeleteScope::DataAndMetadata
            };
            let result = app.sweep(args.limit, scope, &sink)?;
            JsonOutput::print_sweep(&result).into_diagnostic()?;
        }
        Commands::Reset => {
            let result = app.reset(&sink)?;
            JsonOutput::print_reset(&result).into_diagnostic()?;
        }
        Commands::Latest(args) => {
            let input = app.load_records(&args.input)?;
            let result = app.latest(&input, &sink)?;
            JsonOutput::print_latest(&result).into_diagnostic()?;
        }
    }

    Ok(())
}

fn build_app(config: ResolvedConfig) -> Result<App<SystemProbe>, SyncError> {
    let probe = SystemProbe::new(&config.probe)?;
    Ok(App::new(config, probe))
}
