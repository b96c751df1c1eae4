use crate::tracing::LogLevel;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hoard")]
#[command(about = "Inspect and prune a content-addressed artifact cache")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        short = 'l',
        long,
        global = true,
        help = "Set logging level",
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    #[arg(long, global = true, help = "Output logs in JSON format")]
    pub json: bool,

    #[arg(
        short = 'c',
        long,
        global = true,
        env = "HOARD_CONFIG",
        help = "TOML settings file; HOARD_* environment variables take precedence"
    )]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Override the cache policy (off, temporary, user)")]
    pub policy: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct Selection {
    #[arg(long, help = "Only entries with this owner")]
    pub owner: Option<String>,

    #[arg(long, help = "Only entries whose path contains this text")]
    pub path_contains: Option<String>,

    #[arg(long, value_name = "DAYS", help = "Only entries unused for this many days")]
    pub older_than: Option<u32>,

    #[arg(long, help = "Only orphaned entries")]
    pub orphans: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Show the active policy, directory and limits")]
    Info {
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },
    #[command(about = "Print the total size of tracked entries")]
    Size {
        #[arg(long, help = "Print the size in bytes")]
        bytes: bool,
    },
    #[command(about = "List tracked entries, most recently used first")]
    Entries {
        #[command(flatten)]
        selection: Selection,
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },
    #[command(about = "Delete cache entries")]
    Purge {
        #[command(flatten)]
        selection: Selection,
        #[arg(long, help = "Evict every entry that is not being built")]
        all: bool,
    },
    #[command(about = "Enforce the configured size limits now")]
    CheckSize,
    #[command(about = "Print the cache directory")]
    Directory,
}

pub fn parse() -> Cli {
    Cli::parse()
}
