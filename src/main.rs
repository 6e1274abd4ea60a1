mod classifier;
mod cli;
mod dedupe;
mod error;
mod extract;
mod fmt;
mod ledger;
mod models;
mod normalizer;
mod pipeline;
mod settings;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, FlagsCommands};
use models::FlagStatus;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Ingest { file, org, account } => cli::ingest::run(&file, &org, &account),
        Commands::History { org, limit } => cli::history::run(&org, limit),
        Commands::Flags { command } => match command {
            FlagsCommands::List { org } => cli::flags::list(&org),
            FlagsCommands::Confirm { id } => cli::flags::resolve(id, FlagStatus::Confirmed),
            FlagsCommands::Dismiss { id } => cli::flags::resolve(id, FlagStatus::Dismissed),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
