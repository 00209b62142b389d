//! Subcommands of the `shapeshift` binary.

use clap::Subcommand;
use std::error::Error;

pub mod decode;
pub mod dispatch;
pub mod mutate;

/// The subcommands, one variant per command.
#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Decode machine code into a listing
    Decode(decode::DecodeArgs),

    /// Rewrite machine code with the mutation catalog
    Mutate(mutate::MutateArgs),

    /// Emit a virtual dispatch stub for one table slot
    Dispatch(dispatch::DispatchArgs),
}

/// A parsed subcommand that can run to completion.
pub trait Command {
    /// Runs the command, printing its results to stdout.
    fn execute(self) -> Result<(), Box<dyn Error>>;
}

impl Command for Cmd {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        match self {
            Cmd::Decode(args) => args.execute(),
            Cmd::Mutate(args) => args.execute(),
            Cmd::Dispatch(args) => args.execute(),
        }
    }
}
