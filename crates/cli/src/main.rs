//! Entry point for the shapeshift CLI, an x86-64 instruction mutation tool.
//!
//! Parses the command line, sets up logging on stderr and dispatches to the decode, mutate
//! and dispatch subcommands.
use clap::Parser;
use shapeshift_cli::commands::{Cmd, Command};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Command-line interface for shapeshift.
#[derive(Parser)]
#[command(name = "shapeshift")]
#[command(about = "Shapeshift: x86-64 instruction-level code mutation")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command.execute() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
