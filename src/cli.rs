use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "federation",
    version,
    about = "A master agent orchestrating concurrent worker agents"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Model name (e.g. "claude-sonnet-4-20250514", "llama3.2")
    #[arg(short, long, global = true)]
    pub model: Option<String>,

    /// Shared workspace directory path
    #[arg(short, long, global = true)]
    pub workspace: Option<PathBuf>,

    /// Path to config file (layered above the workspace config)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Ceiling on master completion calls per turn
    #[arg(long, global = true)]
    pub max_iterations: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Handle a single message and print the final answer
    Run {
        /// The message for the master agent
        message: String,
    },
    /// Interactive session: one master turn per input line
    Chat,
    /// List the configured worker templates
    Templates,
}
