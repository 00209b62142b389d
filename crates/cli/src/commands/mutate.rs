//! The `mutate` subcommand: runs the rewriter over a buffer and prints the result.
//!
//! Settings come from an optional JSON file and are then overridden by the flags given on
//! the command line. The file holds a `mutation` table (probability, per-rule overrides,
//! scratch register, virtual call switch) and an optional `rewrite` table.

use crate::input::{input_to_bytes, parse_address, parse_address_list};
use clap::Args;
use serde::{Deserialize, Serialize};
use shapeshift_transform::dispatch::{BufferAllocator, DispatchTable, VirtualDispatch};
use shapeshift_transform::{MutationConfig, MutationContext, RewriteConfig, RewriteStats, Rewriter};
use shapeshift_utils::errors::CliError;
use std::error::Error;
use std::fs;
use tracing::info;

/// Arguments for the `mutate` subcommand.
#[derive(Debug, Args)]
pub struct MutateArgs {
    /// Input as a hex string (0x...) or a file prefixed with @
    pub input: String,
    /// Seed for the mutation gates (default: 42)
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Probability applied to every rule without an override
    #[arg(long)]
    probability: Option<f64>,
    /// Output budget as a multiple of the input length
    #[arg(long)]
    max_expansion: Option<f64>,
    /// Address of the first input byte
    #[arg(long, value_parser = parse_address)]
    base_address: Option<u64>,
    /// JSON file with `mutation` and `rewrite` settings
    #[arg(long)]
    config: Option<String>,
    /// Comma-separated call targets for the virtual dispatch table; enables the virtual
    /// call rule
    #[arg(long)]
    table: Option<String>,
    /// Write the raw rewritten bytes to this file
    #[arg(long)]
    output: Option<String>,
    /// Path to emit the rewrite statistics as JSON
    #[arg(long)]
    emit: Option<String>,
}

/// Contents of a `--config` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutateFile {
    /// Catalog settings
    pub mutation: MutationConfig,
    /// Driver settings; defaults apply when absent
    #[serde(default)]
    pub rewrite: RewriteConfig,
}

/// Statistics document written by `--emit`.
#[derive(Debug, Serialize)]
struct Report<'a> {
    seed: u64,
    mutation: &'a MutationConfig,
    rewrite: &'a RewriteConfig,
    stats: &'a RewriteStats,
    expansion_ratio: f64,
}

impl MutateArgs {
    /// Merges the config file (if any) with the command-line overrides.
    fn settings(&self) -> Result<(MutationConfig, RewriteConfig), CliError> {
        let file = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| CliError::FileRead {
                    path: path.clone(),
                    source,
                })?;
                Some(serde_json::from_str::<MutateFile>(&text)?)
            }
            None => None,
        };

        let (mut mutation, mut rewrite) = match (file, self.probability) {
            (Some(file), _) => (file.mutation, file.rewrite),
            (None, Some(p)) => (MutationConfig::new(p), RewriteConfig::default()),
            (None, None) => {
                return Err(CliError::InvalidArgument(
                    "either --probability or --config is required".into(),
                ))
            }
        };
        if let Some(p) = self.probability {
            mutation.probability = p;
        }
        if let Some(max) = self.max_expansion {
            rewrite.max_expansion = max;
        }
        if let Some(base) = self.base_address {
            rewrite.base_address = base;
        }
        if self.table.is_some() {
            mutation.virtual_call = true;
        }
        Ok((mutation, rewrite))
    }
}

impl super::Command for MutateArgs {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        let bytes = input_to_bytes(&self.input)?;
        let (mutation, rewrite) = self.settings()?;

        let mut context = MutationContext::new(mutation.clone(), self.seed)?;
        if let Some(list) = &self.table {
            let targets = parse_address_list(list)?;
            if targets.is_empty() {
                let err = CliError::InvalidArgument("--table needs at least one target".into());
                return Err(err.into());
            }
            info!(slots = targets.len(), "attaching dispatch table");
            let table = DispatchTable::new(targets);
            let dispatch = VirtualDispatch::new(table, BufferAllocator::new());
            context.attach_dispatch(dispatch);
        }

        let mut rewriter = Rewriter::new(context, rewrite.clone())?;
        let out = rewriter.rewrite(&bytes)?;

        if let Some(path) = &self.output {
            fs::write(path, &out.bytes)?;
        }
        if let Some(path) = &self.emit {
            let report = Report {
                seed: self.seed,
                mutation: &mutation,
                rewrite: &rewrite,
                stats: &out.stats,
                expansion_ratio: out.stats.expansion_ratio(),
            };
            fs::write(path, serde_json::to_string_pretty(&report)?)?;
        }
        println!("0x{}", hex::encode(&out.bytes));
        Ok(())
    }
}
