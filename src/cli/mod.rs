//! Command-line interface definitions for the `topogen` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{ArgAction, Parser, Subcommand};

/// Top-level CLI for the `topogen` binary.
#[derive(Debug, Parser)]
#[command(
    name = "topogen",
    about = "Generate infrastructure templates from an application topology",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Raise log verbosity: -v for info, -vv for debug.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub(crate) verbose: u8,
    /// Project root holding the manifest and receiving generated files.
    #[arg(long, value_name = "DIR", global = true)]
    pub(crate) project: Option<String>,
    /// Deployment environment name.
    #[arg(short, long, value_name = "NAME", global = true)]
    pub(crate) environment: Option<String>,
    /// Deployment region.
    #[arg(long, value_name = "REGION", global = true)]
    pub(crate) location: Option<String>,
    /// Fail instead of prompting when a decision is needed.
    #[arg(long, global = true)]
    pub(crate) no_prompt: bool,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `topogen` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Generate every artifact and merge it into the project.
    #[command(name = "init", about = "Generate every artifact and merge it into the project")]
    Init,
    /// Write the shared infrastructure artifacts into a fresh directory.
    #[command(
        name = "render",
        about = "Write the shared infrastructure artifacts into a fresh directory"
    )]
    Render(RenderCommand),
    /// Show which generated files are new, unchanged or conflicting.
    #[command(
        name = "preview",
        about = "Show which generated files are new, unchanged or conflicting"
    )]
    Preview,
    /// List the services declared by the topology.
    #[command(name = "services", about = "List the services declared by the topology")]
    Services,
}

/// Arguments for the `topogen render` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RenderCommand {
    /// Directory receiving the `infra/` tree.
    #[arg(long, value_name = "DIR")]
    pub(crate) out: String,
}
