//! ringlog CLI
//!
//! Command-line tools for ringlog files.
//!
//! # Commands
//!
//! - `inspect` - Display the recovered state of a log file
//! - `verify` - Recover every stream and report inconsistencies
//!
//! Both commands only read the file; nothing is repaired or scrubbed.

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// ringlog command-line log tools.
#[derive(Parser)]
#[command(name = "ringlog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format of `inspect`.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the recovered state of a log file
    Inspect {
        /// Path to the log file
        file: PathBuf,

        /// List every stream extent
        #[arg(short, long)]
        streams: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Recover every stream of a log file and report problems
    Verify {
        /// Path to the log file
        file: PathBuf,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect {
            file,
            streams,
            format,
        } => {
            commands::inspect::run(&file, streams, format).await?;
        }
        Commands::Verify { file } => {
            commands::verify::run(&file).await?;
        }
        Commands::Version => {
            println!("ringlog CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("ringlog core v{}", ringlog_core::VERSION);
            println!(
                "on-disk format v{}",
                ringlog_core::format::FORMAT_VERSION
            );
        }
    }

    Ok(())
}
