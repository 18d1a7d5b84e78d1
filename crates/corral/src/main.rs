//! CLI entry point for corral.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use corral_core::ProjectId;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

mod commands;

const CONFIG_FILE: &str = "config.toml";

/// Cache of git working copies shared by concurrent clients.
#[derive(Parser, Debug)]
#[command(
    name = "corral",
    version,
    about = "corral: concurrency-safe cache of git working copies"
)]
struct Cli {
    /// Configuration file (defaults to the user config directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log more (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a remote to a ready working copy, cloning or refreshing it.
    Get {
        /// Tenant owning the working copy.
        #[arg(long)]
        owner: String,
        /// Remote URL.
        #[arg(long)]
        url: String,
        /// Branch to track (remote default when omitted).
        #[arg(long, conflicts_with = "commit")]
        branch: Option<String>,
        /// Commit to pin.
        #[arg(long)]
        commit: Option<String>,
        /// Fetch complete history.
        #[arg(long)]
        full: bool,
    },

    /// List cached working copies.
    Ls {
        #[arg(long, value_enum, default_value_t = LsFormat::Table)]
        format: LsFormat,
    },

    /// Remove one cached working copy.
    Evict {
        /// Project id printed by `get`.
        project: ProjectId,
    },

    /// Remove every working copy idle for longer than the TTL.
    Gc,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LsFormat {
    Table,
    Json,
}

fn main() -> ExitCode {
    let Cli { config, verbose, cmd } = Cli::parse();
    install_tracing(verbose);

    match run(config, cmd) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(hint) = err
                .downcast_ref::<corral_core::Error>()
                .and_then(corral_core::Error::hint)
            {
                eprintln!("hint: {hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(config: Option<PathBuf>, cmd: Command) -> Result<()> {
    let path = config.unwrap_or_else(default_config_path);
    let config = corral_app::CorralConfig::load_with_env(&path)?;
    let cache = commands::open_cache(config)?;
    let mut stdout = std::io::stdout().lock();
    commands::run(cmd, &cache, &mut stdout)
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map_or_else(|| PathBuf::from(".corral"), |dir| dir.join("corral"))
        .join(CONFIG_FILE)
}

fn install_tracing(verbose: u8) {
    // RUST_LOG wins; otherwise INFO, raised by -v.
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_span_events(FmtSpan::NONE)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
