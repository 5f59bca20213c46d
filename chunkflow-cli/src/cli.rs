//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Split a file into chunks and hash every chunk on the worker pool
    Process {
        /// File to process
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Chunk size in bytes
        #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,

        /// Category that plans the chunks
        #[arg(long, value_name = "NAME", default_value = "chunk")]
        plan_category: String,

        /// Category that hashes the chunks
        #[arg(long, value_name = "NAME", default_value = "hash")]
        hash_category: String,

        /// Print pool status after processing
        #[arg(long)]
        show_status: bool,
    },

    /// Serve an execution context over stdin/stdout (internal use)
    #[command(hide = true)]
    Worker,

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },

    /// Generate a sample configuration file
    Generate {
        /// Output file path
        #[arg(long, value_name = "PATH")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration in use
    Show {
        /// Path to configuration file (optional, uses default loading logic)
        #[arg(long, value_name = "PATH")]
        config_file: Option<PathBuf>,

        /// Output format: yaml, json
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        format: String,
    },
}

pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
