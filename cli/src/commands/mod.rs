//! CLI command definitions and dispatch.

mod build;
mod version;

use clap::{Parser, Subcommand};

/// Inlay: inject a directory into a base image and publish it.
#[derive(Parser)]
#[command(name = "inlay", version, about)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a directory and publish it
    Build(build::BuildArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
