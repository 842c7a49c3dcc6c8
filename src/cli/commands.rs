//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Keel - declarative infrastructure provisioning.
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Directory for local state (overrides `state.path`).
    #[arg(long, global = true, env = "KEEL_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// The deployment file argument shared by every command.
#[derive(Args, Debug, Clone)]
pub struct DeploymentArg {
    /// Path to the deployment file (searched upwards from the current
    /// directory if omitted).
    pub file: Option<PathBuf>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse and validate the deployment file without touching state.
    Validate {
        /// Deployment file.
        #[command(flatten)]
        deployment: DeploymentArg,

        /// Show warnings as well as errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show the actions needed to converge recorded state.
    Plan {
        /// Deployment file.
        #[command(flatten)]
        deployment: DeploymentArg,

        /// Show changed attributes for every action.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Apply the plan.
    Apply {
        /// Deployment file.
        #[command(flatten)]
        deployment: DeploymentArg,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete every recorded resource.
    Destroy {
        /// Deployment file.
        #[command(flatten)]
        deployment: DeploymentArg,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// List resources whose recorded state differs from the deployment file.
    Drift {
        /// Deployment file.
        #[command(flatten)]
        deployment: DeploymentArg,
    },

    /// Print recorded stack outputs.
    Output {
        /// Deployment file.
        #[command(flatten)]
        deployment: DeploymentArg,

        /// Print a single output value.
        #[arg(long)]
        name: Option<String>,
    },

    /// Inspect or unlock recorded state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show recorded state.
    Show {
        /// Deployment file.
        #[command(flatten)]
        deployment: DeploymentArg,
    },

    /// Release the deployment lock.
    Unlock {
        /// Deployment file.
        #[command(flatten)]
        deployment: DeploymentArg,

        /// Lock ID to release.
        #[arg(long)]
        lock_id: Option<String>,

        /// Remove the lock whoever holds it.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Commands {
    /// The deployment file argument of this command.
    #[must_use]
    pub const fn deployment(&self) -> &DeploymentArg {
        match self {
            Self::Validate { deployment, .. }
            | Self::Plan { deployment, .. }
            | Self::Apply { deployment, .. }
            | Self::Destroy { deployment, .. }
            | Self::Drift { deployment }
            | Self::Output { deployment, .. }
            | Self::State {
                command:
                    StateCommands::Show { deployment } | StateCommands::Unlock { deployment, .. },
            } => deployment,
        }
    }
}
