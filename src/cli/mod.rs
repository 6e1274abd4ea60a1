pub mod flags;
pub mod history;
pub mod ingest;
pub mod init;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tally",
    about = "Bank statement ingestion: classify, normalize, and dedupe into a transaction ledger."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Set up tally: choose a data directory and initialize the ledger.
    Init {
        /// Path for tally data (default: ~/Documents/tally)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Ingest a statement file into the ledger.
    Ingest {
        /// Path to CSV or JSON statement file
        file: String,
        /// Organization the statement belongs to
        #[arg(long)]
        org: String,
        /// Account number or label on the statement
        #[arg(long)]
        account: String,
    },
    /// Show recent import batches.
    History {
        #[arg(long)]
        org: String,
        /// How many batches to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Review queued duplicate flags.
    Flags {
        #[command(subcommand)]
        command: FlagsCommands,
    },
}

#[derive(Subcommand)]
pub enum FlagsCommands {
    /// List pending duplicate flags.
    List {
        #[arg(long)]
        org: String,
    },
    /// Confirm a flag: the candidate really was a duplicate.
    Confirm { id: i64 },
    /// Dismiss a flag: the candidate was a distinct transaction.
    Dismiss { id: i64 },
}
