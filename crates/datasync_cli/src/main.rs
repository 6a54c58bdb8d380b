//! Datasync CLI
//!
//! Runs the relay server and inspects datasync stores.
//!
//! # Commands
//!
//! - `serve` - Run the relay server on a store file
//! - `inspect` - Display statistics of a device or server store
//! - `compact` - Rewrite a store file without superseded entries

mod commands;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Datasync relay server and store tools.
#[derive(Parser)]
#[command(name = "datasync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:4242")]
        bind: SocketAddr,

        /// Maximum number of frames processed concurrently
        #[arg(short, long, default_value = "64")]
        workers: usize,

        /// Seconds a connection may take to register
        #[arg(long, default_value = "30")]
        handshake_timeout: u64,
    },

    /// Display store statistics
    Inspect {
        /// List keys with unsynchronized changes
        #[arg(long)]
        pending: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Rewrite the store file without superseded entries
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            bind,
            workers,
            handshake_timeout,
        } => {
            let path = cli.path.ok_or("Store path required for serve")?;
            commands::serve::run(&path, bind, workers, handshake_timeout)?;
        }
        Commands::Inspect { pending, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, pending, &format)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("datasync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("protocol v{}", datasync_server::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
