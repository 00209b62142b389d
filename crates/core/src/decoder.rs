//! shapeshift's single entry-point for turning byte sequences into instruction records.

use crate::modrm::{ModRm, Sib, RM_DISP32, RM_SIB, SIB_NO_INDEX};
use crate::opcode::{Condition, ImmWidth, Opcode};
use crate::operand::{OperandKind, OperandWidth, Reg, Rex};
use serde::{Deserialize, Serialize};
use shapeshift_utils::errors::DecodeError;
use std::fmt;

/// Memory operand of a ModRM form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemOperand {
    /// `None` means disp32-only addressing (RIP-relative without SIB, absolute with it).
    pub base: Option<Reg>,
    /// Index register, never `rsp`.
    pub index: Option<Reg>,
    /// Raw 2-bit SIB scale: the index is multiplied by `1 << scale`.
    pub scale: u8,
    /// Signed displacement.
    pub disp: i32,
}

impl MemOperand {
    /// `[base]`
    pub const fn base(base: Reg) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 0,
            disp: 0,
        }
    }

    /// `[base + index * (1 << scale)]`
    pub const fn indexed(base: Reg, index: Reg, scale: u8) -> Self {
        Self {
            base: Some(base),
            index: Some(index),
            scale: scale & 0x03,
            disp: 0,
        }
    }

    /// `[rip + disp]`
    pub const fn rip(disp: i32) -> Self {
        Self {
            base: None,
            index: None,
            scale: 0,
            disp,
        }
    }

    /// Returns a copy with the displacement replaced.
    pub const fn with_disp(mut self, disp: i32) -> Self {
        self.disp = disp;
        self
    }

    /// Addressing flags a canonical encoding of this operand carries.
    pub fn kind(&self) -> OperandKind {
        let mut kind = OperandKind::MEMORY;
        let base_low3 = self.base.map(Reg::low3);
        if self.index.is_some() || base_low3 == Some(RM_SIB) {
            kind |= OperandKind::SIB;
        }
        match self.base {
            None => {
                kind |= OperandKind::DISPLACEMENT | OperandKind::DISP32;
                if self.index.is_none() {
                    kind |= OperandKind::RIP_RELATIVE;
                }
            }
            Some(_) if i8::try_from(self.disp).is_err() => {
                kind |= OperandKind::DISPLACEMENT | OperandKind::DISP32;
            }
            Some(base) if self.disp != 0 || base.low3() == RM_DISP32 => {
                kind |= OperandKind::DISPLACEMENT;
            }
            Some(_) => {}
        }
        kind
    }
}

impl fmt::Display for MemOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        let mut wrote = false;
        match self.base {
            Some(base) => {
                write!(f, "{base}")?;
                wrote = true;
            }
            None if self.index.is_none() => {
                f.write_str("rip")?;
                wrote = true;
            }
            None => {}
        }
        if let Some(index) = self.index {
            if wrote {
                f.write_str("+")?;
            }
            write!(f, "{index}*{}", 1u8 << self.scale)?;
            wrote = true;
        }
        if self.disp != 0 || !wrote {
            if wrote {
                if self.disp < 0 {
                    write!(f, "-{:#x}", self.disp.unsigned_abs())?;
                } else {
                    write!(f, "+{:#x}", self.disp)?;
                }
            } else {
                write!(f, "{:#x}", self.disp)?;
            }
        }
        f.write_str("]")
    }
}

/// Represents a single decoded instruction.
///
/// Records are plain values: every rewrite stage produces a fresh record instead of patching
/// one in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Instruction form.
    pub opcode: Opcode,
    /// Which of the fields below carry meaning.
    pub operands: OperandKind,
    /// First register operand: the destination, or the base of a memory destination.
    pub op1: Option<Reg>,
    /// Second register operand.
    pub op2: Option<Reg>,
    /// Relative displacements are sign-extended, 32-bit data immediates zero-extended.
    pub imm: u64,
    /// Memory displacement, valid only with `MEMORY`.
    pub disp: i32,
    /// SIB scale exponent, valid only with `MEMORY`.
    pub scale: u8,
    /// Memory index register.
    pub index: Option<Reg>,
    /// Memory base register; `None` with `MEMORY` means disp32-only addressing.
    pub base: Option<Reg>,
    /// REX prefix, as read or as requested. The encoder adds any extension bits the
    /// registers need.
    pub rex: Rex,
    /// Encoded length in bytes. Zero for records built by hand until they are encoded.
    pub size: u8,
}

impl Instruction {
    /// A record with only the opcode and operand kind filled in.
    pub const fn new(opcode: Opcode, operands: OperandKind) -> Self {
        Self {
            opcode,
            operands,
            op1: None,
            op2: None,
            imm: 0,
            disp: 0,
            scale: 0,
            index: None,
            base: None,
            rex: Rex::NONE,
            size: 0,
        }
    }

    /// `op reg, imm`
    pub fn reg_imm(opcode: Opcode, reg: Reg, imm: u64) -> Self {
        Self {
            op1: Some(reg),
            imm,
            ..Self::new(opcode, OperandKind::REGISTER | OperandKind::IMMEDIATE)
        }
    }

    /// Register-register form. `op1` sits in ModRM `rm`, `op2` in ModRM `reg`, except for
    /// `MovRegMem` where the roles are reversed.
    pub fn reg_reg(opcode: Opcode, op1: Reg, op2: Reg) -> Self {
        Self {
            op1: Some(op1),
            op2: Some(op2),
            ..Self::new(opcode, OperandKind::REGISTER)
        }
    }

    /// Single register form (`setcc r8`, `call r64`).
    pub fn reg(opcode: Opcode, reg: Reg) -> Self {
        Self {
            op1: Some(reg),
            ..Self::new(opcode, OperandKind::REGISTER)
        }
    }

    /// Immediate-only form: `push`, relative branches. `imm` is stored as given.
    pub fn imm(opcode: Opcode, imm: u64) -> Self {
        Self {
            imm,
            ..Self::new(opcode, OperandKind::IMMEDIATE)
        }
    }

    /// Relative branch with a signed displacement.
    pub fn branch(opcode: Opcode, rel: i64) -> Self {
        Self::imm(opcode, rel as u64)
    }

    /// `mov [mem], reg` (89 /r with a memory operand)
    pub fn store(reg: Reg, mem: MemOperand) -> Self {
        Self {
            op1: mem.base,
            op2: Some(reg),
            ..Self::new(Opcode::MovMemReg, OperandKind::REGISTER | mem.kind()).with_memory(mem)
        }
    }

    /// `mov reg, [mem]` (8B /r with a memory operand)
    pub fn load(reg: Reg, mem: MemOperand) -> Self {
        Self {
            op1: Some(reg),
            op2: mem.base,
            ..Self::new(Opcode::MovRegMem, OperandKind::REGISTER | mem.kind()).with_memory(mem)
        }
    }

    /// `mov [mem], imm32` (C7 /0)
    pub fn store_imm(mem: MemOperand, imm: u64) -> Self {
        Self {
            op1: mem.base,
            imm,
            ..Self::new(Opcode::MovMemImm, OperandKind::IMMEDIATE | mem.kind()).with_memory(mem)
        }
    }

    /// Replaces the prefix.
    pub const fn with_rex(mut self, rex: Rex) -> Self {
        self.rex = rex;
        self
    }

    /// Forces `REX.W`, keeping any other prefix bits.
    pub const fn wide(self) -> Self {
        let rex = self.rex.with_w();
        self.with_rex(rex)
    }

    const fn with_memory(mut self, mem: MemOperand) -> Self {
        self.base = mem.base;
        self.index = mem.index;
        self.scale = mem.scale;
        self.disp = mem.disp;
        self
    }

    /// The memory operand, if the record has one.
    pub fn memory(&self) -> Option<MemOperand> {
        self.operands.is_memory().then_some(MemOperand {
            base: self.base,
            index: self.index,
            scale: self.scale,
            disp: self.disp,
        })
    }

    /// Effective operand width, from the opcode's fixed width or `REX.W`.
    pub const fn operand_width(&self) -> OperandWidth {
        match self.opcode {
            Opcode::TestReg8 | Opcode::Setcc(_) => OperandWidth::Byte,
            Opcode::PushImm | Opcode::CallReg | Opcode::CallRel32 | Opcode::Ret => {
                OperandWidth::Qword
            }
            _ if self.rex.w() => OperandWidth::Qword,
            _ => OperandWidth::Dword,
        }
    }

    /// Width of the immediate field this record encodes.
    pub const fn imm_width(&self) -> ImmWidth {
        self.opcode.imm_width(self.rex.w())
    }

    /// Signed view of `imm` for relative branches.
    pub const fn rel(&self) -> i64 {
        self.imm as i64
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.operand_width();
        let rex_present = self.effective_rex().is_present();
        let reg = |r: Option<Reg>| {
            r.map_or("?", |r| match width {
                OperandWidth::Byte => r.byte_name(rex_present),
                _ => r.name(width),
            })
        };
        let ptr = if self.rex.w() { "qword" } else { "dword" };
        match self.opcode {
            Opcode::MovRegImm
            | Opcode::AddRegImm
            | Opcode::SubRegImm
            | Opcode::XorRegImm => write!(f, "{} {}, {:#x}", self.opcode, reg(self.op1), self.imm),
            Opcode::AddAccImm | Opcode::SubAccImm => {
                write!(f, "{} {}, {:#x}", self.opcode, Reg::RAX.name(width), self.imm)
            }
            Opcode::MovMemReg => match self.memory() {
                Some(mem) => write!(f, "mov {mem}, {}", reg(self.op2)),
                None => write!(f, "mov {}, {}", reg(self.op1), reg(self.op2)),
            },
            Opcode::MovRegMem => match self.memory() {
                Some(mem) => write!(f, "mov {}, {mem}", reg(self.op1)),
                None => write!(f, "mov {}, {}", reg(self.op1), reg(self.op2)),
            },
            Opcode::MovMemImm => match self.memory() {
                Some(mem) => write!(f, "mov {ptr} {mem}, {:#x}", self.imm),
                None => write!(f, "mov {ptr} ?, {:#x}", self.imm),
            },
            Opcode::AddRegReg
            | Opcode::SubRegReg
            | Opcode::XorRegReg
            | Opcode::XchgRegReg
            | Opcode::TestReg8 => {
                write!(f, "{} {}, {}", self.opcode, reg(self.op1), reg(self.op2))
            }
            Opcode::Setcc(_) | Opcode::CallReg => write!(f, "{} {}", self.opcode, reg(self.op1)),
            Opcode::PushImm => write!(f, "push {:#x}", self.imm),
            Opcode::JccShort(_)
            | Opcode::JccNear(_)
            | Opcode::JmpRel32
            | Opcode::JmpRel8
            | Opcode::CallRel32 => {
                let rel = self.rel();
                if rel < 0 {
                    write!(f, "{} -{:#x}", self.opcode, rel.unsigned_abs())
                } else {
                    write!(f, "{} +{rel:#x}", self.opcode)
                }
            }
            Opcode::Ret => f.write_str("ret"),
        }
    }
}

/// Bounds-checked cursor over the input.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let chunk = self.bytes.get(self.pos..end).ok_or(DecodeError::Truncated {
            needed: end,
            available: self.bytes.len(),
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(chunk);
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.take::<1>().map(|[b]| b)
    }

    fn i8(&mut self) -> Result<i8, DecodeError> {
        self.u8().map(|b| b as i8)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        self.take::<4>().map(i32::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    fn imm(&mut self, width: ImmWidth) -> Result<u64, DecodeError> {
        Ok(match width {
            ImmWidth::None => 0,
            ImmWidth::Rel8 => self.i8()? as i64 as u64,
            ImmWidth::Rel32 => self.i32()? as i64 as u64,
            ImmWidth::Imm32 => u64::from(self.u32()?),
            ImmWidth::Imm64 => self.u64()?,
        })
    }
}

/// Decodes the instruction at the start of `bytes`.
///
/// The consumed length is [`Instruction::size`]. Nothing is consumed on failure.
pub fn decode(bytes: &[u8]) -> Result<Instruction, DecodeError> {
    let first = *bytes.first().ok_or(DecodeError::Empty)?;
    let mut reader = Reader::new(bytes);

    // 1. Optional REX prefix
    let rex = match Rex::from_byte(first) {
        Some(rex) => {
            reader.pos = 1;
            rex
        }
        None => Rex::NONE,
    };

    // 2. Opcode, ModRM, SIB, displacement, immediate
    let primary = reader.u8()?;
    let mut ins = decode_body(primary, rex, &mut reader)?;

    // 3. Record prefix and consumed length
    ins.rex = rex;
    ins.size = reader.pos as u8;
    Ok(ins)
}

/// Decodes the instruction starting at `offset`.
pub fn decode_at(bytes: &[u8], offset: usize) -> Result<Instruction, DecodeError> {
    decode(bytes.get(offset..).unwrap_or_default())
}

fn decode_body(primary: u8, rex: Rex, r: &mut Reader<'_>) -> Result<Instruction, DecodeError> {
    let unsupported = DecodeError::Unsupported {
        opcode: u16::from(primary),
    };
    let ins = match primary {
        0xB8..=0xBF => {
            let reg = Reg::from_parts(primary, rex.b());
            let imm = r.imm(Opcode::MovRegImm.imm_width(rex.w()))?;
            Instruction::reg_imm(Opcode::MovRegImm, reg, imm)
        }
        0x70..=0x7F => {
            let opcode = Opcode::JccShort(Condition::from_nibble(primary));
            Instruction::imm(opcode, r.imm(ImmWidth::Rel8)?)
        }
        0xE8 => Instruction::imm(Opcode::CallRel32, r.imm(ImmWidth::Rel32)?),
        0xE9 => Instruction::imm(Opcode::JmpRel32, r.imm(ImmWidth::Rel32)?),
        0xEB => Instruction::imm(Opcode::JmpRel8, r.imm(ImmWidth::Rel8)?),
        0x68 => Instruction::imm(Opcode::PushImm, r.imm(ImmWidth::Imm32)?),
        0xC3 => Instruction::new(Opcode::Ret, OperandKind::NONE),
        0x05 | 0x2D => {
            let opcode = if primary == 0x05 {
                Opcode::AddAccImm
            } else {
                Opcode::SubAccImm
            };
            Instruction::reg_imm(opcode, Reg::RAX, r.imm(ImmWidth::Imm32)?)
        }
        Opcode::ESCAPE => decode_escape(rex, r)?,
        0x89 | 0x8B => {
            let modrm = ModRm::from(r.u8()?);
            let reg = Reg::from_parts(modrm.reg, rex.r());
            if modrm.is_direct() {
                let rm = Reg::from_parts(modrm.rm, rex.b());
                if primary == 0x89 {
                    Instruction::reg_reg(Opcode::MovMemReg, rm, reg)
                } else {
                    Instruction::reg_reg(Opcode::MovRegMem, reg, rm)
                }
            } else {
                let (mem, kind) = decode_memory(modrm, rex, r)?;
                let mut ins = if primary == 0x89 {
                    Instruction::store(reg, mem)
                } else {
                    Instruction::load(reg, mem)
                };
                ins.operands = OperandKind::REGISTER | kind;
                ins
            }
        }
        0xC7 => {
            let modrm = ModRm::from(r.u8()?);
            if modrm.is_direct() || modrm.reg != 0 {
                return Err(unsupported_form(primary.into(), modrm));
            }
            let (mem, kind) = decode_memory(modrm, rex, r)?;
            let mut ins = Instruction::store_imm(mem, r.imm(ImmWidth::Imm32)?);
            ins.operands = OperandKind::IMMEDIATE | kind;
            ins
        }
        0x01 | 0x29 | 0x31 | 0x87 | 0x84 => {
            let opcode = match primary {
                0x01 => Opcode::AddRegReg,
                0x29 => Opcode::SubRegReg,
                0x31 => Opcode::XorRegReg,
                0x87 => Opcode::XchgRegReg,
                _ => Opcode::TestReg8,
            };
            let modrm = direct_modrm(primary.into(), r)?;
            Instruction::reg_reg(
                opcode,
                Reg::from_parts(modrm.rm, rex.b()),
                Reg::from_parts(modrm.reg, rex.r()),
            )
        }
        0x81 => {
            let modrm = direct_modrm(primary.into(), r)?;
            let opcode = match modrm.reg {
                0 => Opcode::AddRegImm,
                5 => Opcode::SubRegImm,
                6 => Opcode::XorRegImm,
                _ => return Err(unsupported_form(primary.into(), modrm)),
            };
            let reg = Reg::from_parts(modrm.rm, rex.b());
            Instruction::reg_imm(opcode, reg, r.imm(ImmWidth::Imm32)?)
        }
        0xFF => {
            let modrm = direct_modrm(primary.into(), r)?;
            if modrm.reg != 2 {
                return Err(unsupported_form(primary.into(), modrm));
            }
            Instruction::reg(Opcode::CallReg, Reg::from_parts(modrm.rm, rex.b()))
        }
        _ => return Err(unsupported),
    };
    Ok(ins)
}

fn decode_escape(rex: Rex, r: &mut Reader<'_>) -> Result<Instruction, DecodeError> {
    let second = r.u8()?;
    let opcode = (u16::from(Opcode::ESCAPE) << 8) | u16::from(second);
    match second {
        0x80..=0x8F => {
            let jcc = Opcode::JccNear(Condition::from_nibble(second));
            Ok(Instruction::imm(jcc, r.imm(ImmWidth::Rel32)?))
        }
        0x90..=0x9F => {
            let modrm = direct_modrm(opcode, r)?;
            let setcc = Opcode::Setcc(Condition::from_nibble(second));
            Ok(Instruction::reg(setcc, Reg::from_parts(modrm.rm, rex.b())))
        }
        _ => Err(DecodeError::Unsupported { opcode }),
    }
}

/// Reads a ModRM byte that must select register-direct addressing.
fn direct_modrm(opcode: u16, r: &mut Reader<'_>) -> Result<ModRm, DecodeError> {
    let modrm = ModRm::from(r.u8()?);
    if !modrm.is_direct() {
        return Err(unsupported_form(opcode, modrm));
    }
    Ok(modrm)
}

const fn unsupported_form(opcode: u16, modrm: ModRm) -> DecodeError {
    DecodeError::UnsupportedForm {
        opcode,
        modrm: modrm.to_byte(),
    }
}

/// Reads the SIB byte and displacement of a memory ModRM form.
fn decode_memory(
    modrm: ModRm,
    rex: Rex,
    r: &mut Reader<'_>,
) -> Result<(MemOperand, OperandKind), DecodeError> {
    let mut kind = OperandKind::MEMORY;
    let mut mem = MemOperand::default();

    if modrm.rm == RM_SIB {
        let sib = Sib::from(r.u8()?);
        kind |= OperandKind::SIB;
        mem.scale = sib.scale;
        mem.index = (sib.index != SIB_NO_INDEX || rex.x())
            .then(|| Reg::from_parts(sib.index, rex.x()));
        // raw field test: base 101 with mod 00 is disp32 with no base, whatever REX.B says
        mem.base = (modrm.mode != 0 || sib.base != RM_DISP32)
            .then(|| Reg::from_parts(sib.base, rex.b()));
    } else if modrm.mode == 0 && modrm.rm == RM_DISP32 {
        kind |= OperandKind::RIP_RELATIVE;
    } else {
        mem.base = Some(Reg::from_parts(modrm.rm, rex.b()));
    }

    mem.disp = match modrm.mode {
        1 => i32::from(r.i8()?),
        2 => r.i32()?,
        _ if mem.base.is_none() => r.i32()?,
        _ => return Ok((mem, kind)),
    };
    kind |= OperandKind::DISPLACEMENT;
    if modrm.mode != 1 {
        kind |= OperandKind::DISP32;
    }
    Ok((mem, kind))
}
