//! Command-line interface for the `keel` binary.
//!
//! Argument definitions live in `commands`, rendering of plans, reports and
//! state in `output`.

mod commands;
mod output;

pub use commands::{Cli, Commands, DeploymentArg, OutputFormat, StateCommands};
pub use output::OutputFormatter;
