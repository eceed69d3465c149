use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gd_core::ModelPreference;

#[derive(Parser)]
#[command(name = "gdd", about = "AI grading dispatch engine", version)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, default_value = "dispatch.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the dispatch engine until interrupted
    Run {
        /// Seconds between queue status log lines
        #[arg(long, default_value_t = 10)]
        status_interval: u64,
    },
    /// Grade one file and print the result as JSON
    Grade {
        /// File with the text to grade
        #[arg(long)]
        file: PathBuf,
        /// JSON rubric file
        #[arg(long)]
        rubric: PathBuf,
        /// Session id to group jobs under
        #[arg(long, default_value = "cli")]
        session: String,
        /// User id recorded on the job
        #[arg(long, default_value = "cli")]
        user: String,
        /// Override the configured model preference for this session
        /// (auto, force-local, force-cloud)
        #[arg(long)]
        preference: Option<ModelPreference>,
    },
    /// Print the credential health snapshot from the coordination store
    Health,
    /// Validate the configuration and exit
    Check,
}
