use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Instrument;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod cli;
mod config;
mod db;
mod fetch;
mod page;
mod run;

use crate::config::{CfaConfig, FileConfig, RunConfig};

#[derive(Parser)]
#[command(name = "cfa")]
#[command(about = "Codeforces achievements, with a heads-up when yours change")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.cfa)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Use the local API and a one minute refresh interval
    #[arg(long, global = true)]
    local: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an instance in the foreground
    Run(RunCliArgs),

    /// Print the achievements box of a profile once
    Show(ShowArgs),

    /// Print the shared state
    State(StateArgs),

    /// Clear the shared state
    Reset(ResetArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Parser)]
struct RunCliArgs {
    /// Logged in user to watch for achievement changes
    #[arg(short, long)]
    user: Option<String>,

    /// Profile to show achievements for
    #[arg(short, long)]
    profile: Option<String>,

    /// Start with the page hidden
    #[arg(long)]
    hidden: bool,
}

#[derive(Parser)]
struct ShowArgs {
    handle: String,
}

#[derive(Parser)]
struct StateArgs {
    /// Print raw key/value pairs
    #[arg(long)]
    raw: bool,
}

#[derive(Parser)]
struct ResetArgs {
    /// Skip confirmation prompt
    #[arg(short, long)]
    force: bool,

    /// Delete the store file instead of clearing keys (stop instances first)
    #[arg(long)]
    hard: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "cfa=debug,cfa_notify=debug,info"
    } else {
        "cfa=info,cfa_notify=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = CfaConfig::new(cli.data_dir.clone())?;
    let fc: FileConfig = config::load_config(&config.data_dir, cli.local).extract()?;
    let rc = RunConfig::from_file(&fc);

    match cli.command {
        Commands::Run(args) => {
            let span = tracing::info_span!("instance", id = %Uuid::new_v4().simple());
            let args = run::RunArgs {
                user: args.user,
                profile: args.profile,
                hidden: args.hidden,
            };
            run::run_command(&config, &rc, args).instrument(span).await
        }
        Commands::Show(args) => cli::show_command(&rc, &args.handle).await,
        Commands::State(args) => cli::state_command(&config, &rc, args.raw).await,
        Commands::Reset(args) => cli::reset_command(&config, &rc, args.force, args.hard).await,
        Commands::Config => cli::config_command(&config, &fc),
    }
}
