//! The `dispatch` subcommand: emits the stub for one slot of a dispatch table.
//!
//! The table lives in this process and the stub is written to a heap buffer, so the printed
//! addresses are only meaningful for inspection.

use super::decode::listing;
use crate::input::parse_address_list;
use clap::Args;
use shapeshift_transform::dispatch::{BufferAllocator, DispatchTable, VirtualDispatch};
use shapeshift_utils::errors::{CliError, DispatchError};
use std::error::Error;

/// Arguments for the `dispatch` subcommand.
#[derive(Debug, Args)]
pub struct DispatchArgs {
    /// Comma-separated call targets, one per slot
    #[arg(long)]
    table: String,
    /// Slot whose stub is emitted
    #[arg(long, default_value_t = 0)]
    slot: usize,
    /// Print a listing of the stub after its bytes
    #[arg(long)]
    disasm: bool,
}

impl super::Command for DispatchArgs {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        let targets = parse_address_list(&self.table)?;
        if targets.is_empty() {
            let err = CliError::InvalidArgument("--table needs at least one target".into());
            return Err(err.into());
        }
        let table = DispatchTable::new(targets);
        let mut dispatch = VirtualDispatch::new(table, BufferAllocator::new());
        let address = dispatch.stub_for_slot(self.slot).map_err(CliError::Dispatch)?;
        let region = dispatch
            .cache()
            .region(self.slot)
            .ok_or_else(|| {
                CliError::Dispatch(DispatchError::SlotOutOfRange {
                    index: self.slot,
                    len: dispatch.table().len(),
                })
            })?;

        println!("table  0x{:x}", dispatch.table().base());
        println!("stub   0x{address:x}");
        println!("0x{}", hex::encode(region.bytes()));
        if self.disasm {
            for entry in listing(region.bytes()) {
                if let Some(ins) = entry.instruction {
                    println!("{:02x}  {:<30} {ins}", entry.offset, entry.bytes);
                }
            }
        }
        Ok(())
    }
}
