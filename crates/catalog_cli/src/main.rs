//! Catalog CLI
//!
//! Command-line tools for the catalog sync engine.
//!
//! # Commands
//!
//! - `hash` - Print the canonical hash of a JSON document
//! - `inspect` - List and check the record files of a snapshot archive
//! - `sync` - Run one synchronization cycle against a catalog API

mod client;
mod commands;

use catalog_content::Space;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Catalog content synchronization tools.
#[derive(Parser)]
#[command(name = "catalogctl")]
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
    /// Print the canonical hash of a JSON document
    Hash {
        /// Path to the document
        file: PathBuf,

        /// Also print the canonical serialization
        #[arg(short, long)]
        canonical: bool,

        /// Sanitize the document the way ingested content is
        #[arg(short, long)]
        sanitize: bool,
    },

    /// List and check the record files of a snapshot archive
    Inspect {
        /// Path to the zip archive
        archive: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run one synchronization cycle against a catalog API
    Sync {
        /// Catalog API base URL
        #[arg(long)]
        api_url: String,

        /// Catalog context
        #[arg(long)]
        context: String,

        /// Consumer name
        #[arg(long)]
        consumer: String,

        /// Directory holding consumer state and content between runs
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Space the catalog content is written to
        #[arg(long, default_value = "standard")]
        space: Space,

        /// Documents per bulk write
        #[arg(long, default_value = "999")]
        batch_size: usize,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,

        /// Overall snapshot deadline in seconds
        #[arg(long)]
        snapshot_deadline: Option<u64>,

        /// Concurrent registration requests
        #[arg(long, default_value = "8")]
        concurrency: usize,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Hash {
            file,
            canonical,
            sanitize,
        } => {
            commands::hash::run(&file, canonical, sanitize)?;
        }
        Commands::Inspect { archive, format } => {
            commands::inspect::run(&archive, &format)?;
        }
        Commands::Sync {
            api_url,
            context,
            consumer,
            data_dir,
            space,
            batch_size,
            timeout,
            snapshot_deadline,
            concurrency,
        } => {
            let args = commands::sync::SyncArgs {
                api_url,
                context,
                consumer,
                data_dir,
                space,
                batch_size,
                timeout,
                snapshot_deadline,
                concurrency,
            };
            commands::sync::run(args)?;
        }
        Commands::Version => {
            println!("catalogctl v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
