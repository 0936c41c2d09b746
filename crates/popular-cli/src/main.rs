#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{CliError, OutputMode};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "popular: rolling-window view tallies for categories, courses and modules",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: ./popular.toml, then the user config dir).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Database file, overriding `[storage] database`.
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Output format.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true, hide = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Derive the output mode from flags.
    fn output_mode(&self) -> OutputMode {
        output::resolve_output_mode(self.format, self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Tally",
        about = "Catch tallies up with the view log",
        long_about = "Fold views logged since the last successful run into the tallies. \
                      Rebuilds from scratch when no run has completed yet or the tally settings changed.",
        after_help = "EXAMPLES:\n    # Scheduled run\n    popular run\n\n    # Pin the reference time\n    popular run --now 1700000000\n\n    # Emit the run report as JSON\n    popular run --json"
    )]
    Run(cmd::run::RunArgs),

    #[command(
        next_help_heading = "Tally",
        about = "Rebuild every tally from the log",
        long_about = "Purge all tallies and last visits, then recompute them from the whole view log.",
        after_help = "EXAMPLES:\n    # Full rebuild\n    popular rebuild\n\n    # Emit machine-readable output\n    popular rebuild --json"
    )]
    Rebuild(cmd::run::RebuildArgs),

    #[command(
        next_help_heading = "Read",
        about = "Most viewed content of a kind",
        long_about = "Rank committed tallies of one kind by a window, joined with live host names.",
        after_help = "EXAMPLES:\n    # Ten most viewed courses this week\n    popular top course --window week\n\n    # Raw ranking by id, no limit\n    popular top module --window all --ids -n 0"
    )]
    Top(cmd::top::TopArgs),

    #[command(
        next_help_heading = "Read",
        about = "Dump tallies of a kind",
        after_help = "EXAMPLES:\n    # Every course tally\n    popular tallies course\n\n    # One module\n    popular tallies module --id 9 --json"
    )]
    Tallies(cmd::tallies::TalliesArgs),

    #[command(
        next_help_heading = "Read",
        about = "Last visits on one content node",
        after_help = "EXAMPLES:\n    # Who last viewed course 5, most recent first\n    popular visits course 5"
    )]
    Visits(cmd::visits::VisitsArgs),

    #[command(
        next_help_heading = "Host Data",
        about = "Load view log, identity and user records",
        long_about = "Load JSON-lines host records: views, identities (upsert or remove) and users.",
        after_help = "EXAMPLES:\n    # Load a file\n    popular ingest views.jsonl\n\n    # Load from stdin\n    cat views.jsonl | popular ingest -"
    )]
    Ingest(cmd::ingest::IngestArgs),

    #[command(next_help_heading = "Privacy", about = "Export or erase personal data")]
    Privacy {
        #[command(subcommand)]
        command: cmd::privacy::PrivacyCommand,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("POPULAR_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "popular=debug,info"
        } else {
            "popular=info,warn"
        })
    });

    let format = env::var("POPULAR_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry.with(fmt::layer().compact().with_writer(std::io::stderr)).init();
        }
    }
}

fn dispatch(cli: &Cli, output: OutputMode) -> anyhow::Result<()> {
    let working_dir = env::current_dir()?;
    let ctx = cmd::Context::load(cli.config.as_deref(), cli.db.clone(), output, &working_dir)?;
    debug!(db = %ctx.db_path.display(), "resolved context");

    match &cli.command {
        Commands::Run(args) => cmd::run::run_tally(args, &ctx),
        Commands::Rebuild(args) => cmd::run::run_rebuild(args, &ctx),
        Commands::Top(args) => cmd::top::run_top(args, &ctx),
        Commands::Tallies(args) => cmd::tallies::run_tallies(args, &ctx),
        Commands::Visits(args) => cmd::visits::run_visits(args, &ctx),
        Commands::Ingest(args) => cmd::ingest::run_ingest(args, &ctx),
        Commands::Privacy { command } => cmd::privacy::run_privacy(command, &ctx),
    }
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    if cli.verbose {
        debug!("Verbose mode enabled");
    }
    let output = cli.output_mode();

    match dispatch(&cli, output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let cli_error = CliError::from(&err);
            if output::render_error(output, &cli_error).is_err() {
                eprintln!("error: {err:#}");
            }
            ExitCode::from(cli_error.exit_code())
        }
    }
}
