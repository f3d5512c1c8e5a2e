use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "spoolbox")]
#[command(about = "Directory based file transfer", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll the configured directory and deliver each file
    Consume(ConsumeArgs),
    /// Write stdin or a file through the producer settings
    Write(WriteArgs),
    /// Inspect the persistent idempotent repository
    #[command(subcommand)]
    Repo(RepoCommand),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(clap::Args, Debug)]
pub struct ConsumeArgs {
    /// Relay every file into this directory instead of only logging it
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Run a single poll cycle and exit
    #[arg(long)]
    pub once: bool,
}

#[derive(clap::Args, Debug)]
pub struct WriteArgs {
    /// File to write; reads stdin when omitted
    pub input: Option<PathBuf>,

    /// Destination file name (defaults to the input's name)
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    /// List recorded keys
    List {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Forget one key so the file can be consumed again
    Evict { key: String },
    /// Forget every key
    Clear,
}
