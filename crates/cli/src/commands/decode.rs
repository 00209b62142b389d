//! The `decode` subcommand: a linear listing of the supported instructions in a buffer.
//!
//! Bytes that do not decode are shown as `.byte` lines and skipped one at a time, the same
//! way the rewriter walks its input.

use crate::input::input_to_bytes;
use clap::Args;
use serde::Serialize;
use shapeshift_core::decoder::{decode_at, Instruction};
use std::error::Error;

/// Arguments for the `decode` subcommand.
#[derive(Debug, Args)]
pub struct DecodeArgs {
    /// Input as a hex string (0x...) or a file prefixed with @
    pub input: String,
    /// Print the listing as JSON records instead of text
    #[arg(long)]
    json: bool,
}

/// One row of the listing.
#[derive(Debug, Serialize)]
pub struct ListingEntry {
    /// Offset from the start of the input
    pub offset: usize,
    /// The consumed bytes as hex
    pub bytes: String,
    /// `None` for a byte that did not decode
    pub instruction: Option<Instruction>,
    /// Why the byte did not decode
    pub error: Option<String>,
}

/// Walks `bytes` from the start, one entry per instruction or undecodable byte.
pub fn listing(bytes: &[u8]) -> Vec<ListingEntry> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let entry = match decode_at(bytes, offset) {
            Ok(ins) => {
                let end = offset + usize::from(ins.size);
                ListingEntry {
                    offset,
                    bytes: hex::encode(&bytes[offset..end]),
                    instruction: Some(ins),
                    error: None,
                }
            }
            Err(err) => ListingEntry {
                offset,
                bytes: hex::encode(&bytes[offset..=offset]),
                instruction: None,
                error: Some(err.to_string()),
            },
        };
        offset += entry.bytes.len() / 2;
        entries.push(entry);
    }
    entries
}

impl super::Command for DecodeArgs {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        let bytes = input_to_bytes(&self.input)?;
        let entries = listing(&bytes);

        if self.json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
            return Ok(());
        }
        for entry in &entries {
            match &entry.instruction {
                Some(ins) => println!("{:08x}  {:<30} {ins}", entry.offset, entry.bytes),
                None => {
                    let (offset, bytes) = (entry.offset, &entry.bytes);
                    println!("{offset:08x}  {bytes:<30} .byte 0x{bytes}");
                }
            }
        }
        Ok(())
    }
}
