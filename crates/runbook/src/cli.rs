//! Command-line arguments

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "runbook")]
#[command(about = "Run automation scripts with shell, SSH, file and HTTP operations", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Functions to invoke after top-level code, in order (default: main)
    pub entry_points: Vec<String>,

    /// Script file (default: ./Runbook, then ./Runbook.rhai)
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Secrets file (JSON, or TOML with a .toml extension)
    #[arg(short, long)]
    pub secrets: Option<PathBuf>,

    /// Configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t)]
    pub log_format: LogFormat,

    /// Shell used by sh()
    #[arg(long)]
    pub shell: Option<String>,

    /// Engine operation limit per run (0 = unlimited)
    #[arg(long)]
    pub max_operations: Option<u64>,
}
