use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "buildvigil-agent", version)]
#[command(about = "Buildvigil deployment agent - reconciles services against the control plane")]
pub struct Cli {
    /// Config file path (defaults to /etc/buildvigil/config.json)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Show verbose debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent daemon
    Run {
        /// Apply firewall rules per the server's security mode (requires root)
        #[arg(long)]
        apply_firewall: bool,
    },
    /// Show the status of all managed services
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show captured logs for a service
    Logs {
        /// Service ID
        service: String,
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "100")]
        tail: u32,
        /// Follow log output
        #[arg(short, long)]
        follow: bool,
    },
    /// Manage encrypted service secrets
    #[command(subcommand)]
    Secret(SecretCommands),
}

#[derive(Subcommand)]
pub enum SecretCommands {
    /// Add or overwrite a secret
    Add {
        /// Service ID the secret belongs to
        #[arg(long)]
        service: String,
        /// Secret name (injected as an environment variable on deploy)
        #[arg(long)]
        name: String,
        /// Secret value; prompted for when omitted
        #[arg(long)]
        value: Option<String>,
    },
    /// List secret names for a service
    List {
        /// Service ID
        #[arg(long)]
        service: String,
    },
    /// Delete a secret
    Delete {
        /// Service ID
        #[arg(long)]
        service: String,
        /// Secret name
        #[arg(long)]
        name: String,
    },
}
