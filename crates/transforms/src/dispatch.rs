//! Virtual dispatch: a slot table plus generated stubs that call through it.
//!
//! A stub loads the table base into `r11`, the slot index into `r10d`, fetches the target
//! from `[r11 + r10*8]` and calls it inside 0x28 bytes of shadow space. Only caller-saved
//! registers are touched.

use rand::seq::SliceRandom;
use rand::Rng;
use shapeshift_core::decoder::{Instruction, MemOperand};
use shapeshift_core::encoder::encode_into;
use shapeshift_core::opcode::Opcode;
use shapeshift_core::operand::{OperandKind, Reg};
use shapeshift_utils::errors::DispatchError;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Size of the executable region requested for one stub.
pub const STUB_REGION_LEN: usize = 64;

/// Shadow space plus alignment reserved around the inner call.
const SHADOW_SPACE: u64 = 0x28;

/// Filler for the unused tail of a stub region (`int3`).
const TRAP: u8 = 0xCC;

/// Table of call targets.
///
/// The slots live in a boxed slice, so [`DispatchTable::base`] stays valid for the table's
/// lifetime even when the table itself moves.
#[derive(Debug, PartialEq, Eq)]
pub struct DispatchTable {
    slots: Box<[u64]>,
}

impl DispatchTable {
    /// Keeps the targets in the given slot order.
    pub fn new(targets: Vec<u64>) -> Self {
        Self {
            slots: targets.into_boxed_slice(),
        }
    }

    /// Builds a table with the targets in random slot order.
    pub fn shuffled<R: Rng + ?Sized>(mut targets: Vec<u64>, rng: &mut R) -> Self {
        targets.shuffle(rng);
        Self::new(targets)
    }

    /// Address of slot 0.
    pub fn base(&self) -> u64 {
        self.slots.as_ptr() as u64
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All targets in slot order.
    pub fn slots(&self) -> &[u64] {
        &self.slots
    }

    /// Target stored in `slot`.
    pub fn get(&self, slot: usize) -> Option<u64> {
        self.slots.get(slot).copied()
    }

    /// First slot holding `target`.
    pub fn slot_of(&self, target: u64) -> Option<usize> {
        self.slots.iter().position(|&t| t == target)
    }
}

/// A block of memory the host made executable.
#[derive(Debug)]
pub struct ExecutableRegion {
    address: u64,
    bytes: Box<[u8]>,
}

impl ExecutableRegion {
    /// Wraps a buffer; its heap address becomes the region address.
    pub fn from_buffer(bytes: Box<[u8]>) -> Self {
        Self {
            address: bytes.as_ptr() as u64,
            bytes,
        }
    }

    /// A region whose address is assigned by the host rather than the buffer.
    pub fn at(address: u64, len: usize) -> Self {
        Self {
            address,
            bytes: vec![0; len].into_boxed_slice(),
        }
    }

    /// Where the region starts in the host address space.
    pub const fn address(&self) -> u64 {
        self.address
    }

    /// Region size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the region has no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Current contents.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Copies `code` to the start of the region and traps the rest.
    pub fn write(&mut self, code: &[u8]) -> Result<(), DispatchError> {
        if code.len() > self.bytes.len() {
            return Err(DispatchError::RegionTooSmall {
                needed: code.len(),
                available: self.bytes.len(),
            });
        }
        let (head, tail) = self.bytes.split_at_mut(code.len());
        head.copy_from_slice(code);
        tail.fill(TRAP);
        Ok(())
    }
}

/// Source of executable memory, supplied by the host.
pub trait ExecutableAllocator {
    /// Hands out a region of at least `len` bytes, or fails with `Allocation`.
    fn allocate_executable(&mut self, len: usize) -> Result<ExecutableRegion, DispatchError>;
}

/// Heap-backed allocator with an optional byte budget.
///
/// The memory is not actually executable; the allocator exists for tests and dry runs.
#[derive(Debug, Clone)]
pub struct BufferAllocator {
    remaining: usize,
    allocations: usize,
}

impl BufferAllocator {
    /// An allocator without a limit.
    pub const fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Fails every request once `limit` bytes have been handed out.
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            remaining: limit,
            allocations: 0,
        }
    }

    /// Number of successful allocations.
    pub const fn allocations(&self) -> usize {
        self.allocations
    }
}

impl Default for BufferAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutableAllocator for BufferAllocator {
    fn allocate_executable(&mut self, len: usize) -> Result<ExecutableRegion, DispatchError> {
        if len > self.remaining {
            return Err(DispatchError::Allocation { size: len });
        }
        self.remaining -= len;
        self.allocations += 1;
        Ok(ExecutableRegion::from_buffer(vec![0; len].into_boxed_slice()))
    }
}

/// The records of a stub calling slot `index` of the table at `table_base`.
pub fn stub_template(table_base: u64, index: u32) -> [Instruction; 7] {
    [
        Instruction::reg_imm(Opcode::MovRegImm, Reg::R11, table_base).wide(),
        Instruction::reg_imm(Opcode::MovRegImm, Reg::R10, u64::from(index)),
        Instruction::load(Reg::RAX, MemOperand::indexed(Reg::R11, Reg::R10, 3)).wide(),
        Instruction::reg_imm(Opcode::SubRegImm, Reg::RSP, SHADOW_SPACE).wide(),
        Instruction::reg(Opcode::CallReg, Reg::RAX),
        Instruction::reg_imm(Opcode::AddRegImm, Reg::RSP, SHADOW_SPACE).wide(),
        Instruction::new(Opcode::Ret, OperandKind::NONE),
    ]
}

/// Machine code for a stub calling slot `index` of the table at `table_base`.
pub fn emit_virtual_call(table_base: u64, index: u32) -> Result<Vec<u8>, DispatchError> {
    let mut code = Vec::with_capacity(STUB_REGION_LEN);
    for ins in &stub_template(table_base, index) {
        encode_into(ins, &mut code)?;
    }
    debug!(
        table = table_base,
        index,
        len = code.len(),
        "emitted virtual dispatch stub"
    );
    Ok(code)
}

/// Stubs emitted so far, one per slot.
#[derive(Debug, Default)]
pub struct DispatchCache {
    regions: BTreeMap<usize, ExecutableRegion>,
}

impl DispatchCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of the stub for `slot`, emitting it on first use.
    pub fn fragment_for(
        &mut self,
        table: &DispatchTable,
        slot: usize,
        allocator: &mut dyn ExecutableAllocator,
    ) -> Result<u64, DispatchError> {
        if let Some(region) = self.regions.get(&slot) {
            return Ok(region.address());
        }
        let out_of_range = DispatchError::SlotOutOfRange {
            index: slot,
            len: table.len(),
        };
        if slot >= table.len() {
            return Err(out_of_range);
        }
        let index = u32::try_from(slot).map_err(|_| out_of_range)?;

        let code = emit_virtual_call(table.base(), index)?;
        let mut region = allocator.allocate_executable(STUB_REGION_LEN)?;
        region.write(&code)?;
        let address = region.address();
        self.regions.insert(slot, region);
        Ok(address)
    }

    /// The stub emitted for `slot`, if any.
    pub fn region(&self, slot: usize) -> Option<&ExecutableRegion> {
        self.regions.get(&slot)
    }

    /// Number of stubs emitted.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether no stub has been emitted yet.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// A dispatch table together with the allocator and cache used for its stubs.
pub struct VirtualDispatch {
    table: DispatchTable,
    allocator: Box<dyn ExecutableAllocator + Send>,
    cache: DispatchCache,
}

impl VirtualDispatch {
    /// Dispatches through `table`, placing stubs in memory from `allocator`.
    pub fn new(
        table: DispatchTable,
        allocator: impl ExecutableAllocator + Send + 'static,
    ) -> Self {
        Self {
            table,
            allocator: Box::new(allocator),
            cache: DispatchCache::new(),
        }
    }

    /// The table stubs index into.
    pub const fn table(&self) -> &DispatchTable {
        &self.table
    }

    /// Stubs emitted so far.
    pub const fn cache(&self) -> &DispatchCache {
        &self.cache
    }

    /// Stub address for `target`, or `None` when the table has no slot for it.
    pub fn stub_for(&mut self, target: u64) -> Result<Option<u64>, DispatchError> {
        match self.table.slot_of(target) {
            Some(slot) => self.stub_for_slot(slot).map(Some),
            None => Ok(None),
        }
    }

    /// Stub address for `slot`, emitting it on first use.
    pub fn stub_for_slot(&mut self, slot: usize) -> Result<u64, DispatchError> {
        self.cache
            .fragment_for(&self.table, slot, self.allocator.as_mut())
    }
}

impl fmt::Debug for VirtualDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualDispatch")
            .field("table", &self.table)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
