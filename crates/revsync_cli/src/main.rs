//! RevSync CLI
//!
//! Command-line tools for RevSync replication.
//!
//! # Commands
//!
//! - `push` - Push a JSON document set to a remote database
//! - `changes` - Tail a remote change feed
//! - `checkpoint-id` - Compute a replication checkpoint document id

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// RevSync command-line replication tools.
#[derive(Parser)]
#[command(name = "revsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a JSON array of documents to a remote database
    Push {
        /// Remote database URL (may embed user:password)
        #[arg(short, long)]
        remote: String,

        /// File holding a JSON array of document objects
        #[arg(short, long)]
        docs: PathBuf,

        /// Create the remote database first
        #[arg(long)]
        create_target: bool,

        /// Keep pushing until interrupted
        #[arg(short, long)]
        continuous: bool,

        /// Access token appended to upload requests
        #[arg(long)]
        access_token: Option<String>,

        /// Extra request header (name=value), repeatable
        #[arg(long = "header", value_parser = parse_key_val)]
        headers: Vec<(String, String)>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print a remote change feed as JSON lines
    Changes {
        /// Remote database URL (may embed user:password)
        #[arg(short, long)]
        remote: String,

        /// Feed mode (normal, longpoll, continuous)
        #[arg(short, long, default_value = "normal")]
        mode: String,

        /// Start after this sequence token
        #[arg(short, long)]
        since: Option<String>,

        /// Server-side filter name
        #[arg(long)]
        filter: Option<String>,

        /// Filter parameter (name=value), repeatable
        #[arg(long = "filter-param", value_parser = parse_key_val)]
        filter_params: Vec<(String, String)>,
    },

    /// Compute the checkpoint document id of a replication
    CheckpointId {
        /// Private UUID of the local store
        #[arg(short, long)]
        uuid: String,

        /// Remote database URL
        #[arg(short, long)]
        remote: String,

        /// Compute the push checkpoint (pull otherwise)
        #[arg(short, long)]
        push: bool,
    },

    /// Show version information
    Version,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{s}`"))?;
    Ok((key.to_string(), value.to_string()))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Push {
            remote,
            docs,
            create_target,
            continuous,
            access_token,
            headers,
            format,
        } => {
            let options = commands::push::PushOptions {
                remote,
                docs,
                create_target,
                continuous,
                access_token,
                headers,
            };
            commands::push::run(options, &format)?;
        }
        Commands::Changes {
            remote,
            mode,
            since,
            filter,
            filter_params,
        } => {
            commands::changes::run(&remote, &mode, since, filter, filter_params)?;
        }
        Commands::CheckpointId { uuid, remote, push } => {
            commands::checkpoint_id::run(&uuid, &remote, push);
        }
        Commands::Version => {
            println!("RevSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
