//! Command-line arguments

use anvil_foundation::AnvilConfig;
use anvil_runtime::RuntimeConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// anvil - isolated workspaces for one project across local, worktree, ssh and docker
#[derive(Parser, Debug)]
#[command(name = "anvil")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Project directory (defaults to the current directory)
    #[arg(short, long, global = true)]
    pub project: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command inside a workspace
    Exec {
        workspace: String,

        /// Use this runtime instead of the registered one
        /// (local, worktree, ssh:<host[:port]>, docker[:<image>])
        #[arg(long)]
        runtime: Option<String>,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Create a workspace
    Create {
        name: String,

        /// Branch to start from (detected when omitted)
        #[arg(long)]
        trunk: Option<String>,

        /// local, worktree, ssh:<host[:port]>, docker[:<image>]
        #[arg(long)]
        runtime: Option<String>,
    },
    /// Duplicate a workspace
    Fork {
        source: String,
        new: String,

        /// Fail instead of creating from trunk when the backend cannot fork
        #[arg(long)]
        no_fallback: bool,
    },
    /// Delete a workspace
    Delete {
        name: String,

        /// Delete even with uncommitted changes
        #[arg(short, long)]
        force: bool,
    },
    /// Rename a workspace
    Rename { old: String, new: String },
    /// Copy ignored files selected by the sync file between two workspaces
    SyncIgnored { source: String, dest: String },
    /// List workspaces of the project
    List,
}

/// `docker` without an image picks the configured default
pub fn parse_runtime(raw: &str, settings: &AnvilConfig) -> anvil_foundation::Result<RuntimeConfig> {
    if raw.trim().eq_ignore_ascii_case("docker") {
        return Ok(RuntimeConfig::docker(settings.docker.default_image()));
    }
    raw.parse()
}
