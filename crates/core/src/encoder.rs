//! Record to bytes: REX, opcode, ModRM, SIB, displacement and immediate, in that order.

use crate::decoder::{Instruction, MemOperand};
use crate::modrm::{ModRm, Sib, RM_DISP32, RM_SIB, SIB_NO_INDEX};
use crate::opcode::{ImmWidth, Opcode};
use crate::operand::{OperandKind, Reg, Rex};
use shapeshift_utils::errors::EncodeError;

/// Architectural limit on the length of one instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// What follows the opcode bytes, with registers already resolved.
#[derive(Debug, Clone, Copy)]
enum Operands {
    /// No ModRM byte.
    Bare,
    /// Register in the low 3 opcode bits (`B8+r`).
    Embedded(Reg),
    /// `mod == 11`: `reg` is a register or an opcode extension.
    Direct { reg: Reg, rm: Reg },
    Memory { reg: Reg, mem: MemOperand },
}

impl Operands {
    /// REX extension bits the registers of this form require.
    fn required_rex(&self) -> u8 {
        let bit = |reg: Option<Reg>, mask: u8| match reg {
            Some(reg) if reg.is_extended() => mask,
            _ => 0,
        };
        match self {
            Self::Bare => 0,
            Self::Embedded(reg) => bit(Some(*reg), 0x01),
            Self::Direct { reg, rm } => bit(Some(*reg), 0x04) | bit(Some(*rm), 0x01),
            Self::Memory { reg, mem } => {
                bit(Some(*reg), 0x04) | bit(mem.index, 0x02) | bit(mem.base, 0x01)
            }
        }
    }
}

/// Encodes one record into a fresh buffer.
pub fn encode(ins: &Instruction) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::with_capacity(MAX_INSTRUCTION_LEN);
    encode_into(ins, &mut bytes)?;
    Ok(bytes)
}

/// Appends the encoding of `ins` to `out` and returns the number of bytes written.
///
/// On error `out` is left as it was.
pub fn encode_into(ins: &Instruction, out: &mut Vec<u8>) -> Result<usize, EncodeError> {
    let start = out.len();
    let result = emit(ins, out);
    if result.is_err() {
        out.truncate(start);
    }
    result.map(|()| out.len() - start)
}

/// Length of the encoding of `ins`.
pub fn encoded_len(ins: &Instruction) -> Result<usize, EncodeError> {
    encode(ins).map(|bytes| bytes.len())
}

fn emit(ins: &Instruction, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    let unsupported = EncodeError::Unsupported {
        opcode: ins.opcode.to_u16(),
        operands: ins.operands.bits(),
    };
    if !ins.opcode.accepts(ins.operands) {
        return Err(unsupported);
    }
    let operands = resolve(ins)?;

    // 1. REX: the record's own prefix plus whatever the registers need
    let required = operands.required_rex();
    if ins.rex.is_present() || required != 0 {
        out.push(0x40 | ins.rex.raw() | required);
    }
    let rex_w = ins.rex.w();

    // 2. Opcode bytes
    match operands {
        Operands::Embedded(reg) => out.push(ins.opcode.primary() | reg.low3()),
        _ => out.push(ins.opcode.primary()),
    }
    if let Some(second) = ins.opcode.secondary() {
        out.push(second);
    }

    // 3. ModRM, SIB, displacement
    match operands {
        Operands::Bare | Operands::Embedded(_) => {}
        Operands::Direct { reg, rm } => out.push(ModRm::direct(reg.low3(), rm.low3()).to_byte()),
        Operands::Memory { reg, mem } => {
            if mem.index.is_some_and(|index| index == Reg::RSP) {
                return Err(unsupported);
            }
            emit_memory(reg, &mem, ins.operands, out);
        }
    }

    // 4. Immediate
    emit_imm(ins.imm, ins.opcode.imm_width(rex_w), out)
}

/// Maps the record's fields onto this form's operand slots.
fn resolve(ins: &Instruction) -> Result<Operands, EncodeError> {
    let op1 = || ins.op1.ok_or(EncodeError::MissingOperand("op1"));
    let op2 = || ins.op2.ok_or(EncodeError::MissingOperand("op2"));
    let extension = |digit: u8| Reg::from_parts(digit, false);
    let memory = || {
        ins.memory()
            .ok_or(EncodeError::MissingOperand("memory operand"))
    };

    Ok(match ins.opcode {
        Opcode::MovRegImm => Operands::Embedded(op1()?),
        Opcode::MovMemReg if ins.operands.is_memory() => Operands::Memory {
            reg: op2()?,
            mem: memory()?,
        },
        Opcode::MovRegMem if ins.operands.is_memory() => Operands::Memory {
            reg: op1()?,
            mem: memory()?,
        },
        Opcode::MovRegMem => Operands::Direct {
            reg: op1()?,
            rm: op2()?,
        },
        Opcode::MovMemReg
        | Opcode::AddRegReg
        | Opcode::SubRegReg
        | Opcode::XorRegReg
        | Opcode::XchgRegReg
        | Opcode::TestReg8 => Operands::Direct {
            reg: op2()?,
            rm: op1()?,
        },
        Opcode::MovMemImm => Operands::Memory {
            reg: extension(0),
            mem: memory()?,
        },
        Opcode::AddRegImm | Opcode::SubRegImm | Opcode::XorRegImm | Opcode::CallReg => {
            let digit = ins.opcode.extension().unwrap_or_default();
            Operands::Direct {
                reg: extension(digit),
                rm: op1()?,
            }
        }
        Opcode::Setcc(_) => Operands::Direct {
            reg: extension(0),
            rm: op1()?,
        },
        Opcode::AddAccImm | Opcode::SubAccImm => {
            if ins.op1.is_some_and(|reg| reg != Reg::RAX) {
                return Err(EncodeError::Unsupported {
                    opcode: ins.opcode.to_u16(),
                    operands: ins.operands.bits(),
                });
            }
            Operands::Bare
        }
        Opcode::PushImm
        | Opcode::JccShort(_)
        | Opcode::JccNear(_)
        | Opcode::JmpRel32
        | Opcode::JmpRel8
        | Opcode::CallRel32
        | Opcode::Ret => Operands::Bare,
    })
}

/// Writes ModRM, optional SIB and displacement for a memory operand.
///
/// The displacement width recorded in `kind` is kept, so a decoded `[rax+0x00]` or a disp32
/// that fits in 8 bits re-encodes to its original bytes. Without those flags the shortest
/// form is chosen: a zero displacement is omitted unless the base's raw field is `101`
/// (rbp/r13).
fn emit_memory(reg: Reg, mem: &MemOperand, kind: OperandKind, out: &mut Vec<u8>) {
    let index_field = mem.index.map_or(SIB_NO_INDEX, Reg::low3);
    let wants_sib = mem.index.is_some()
        || kind.contains(OperandKind::SIB)
        || mem.base.is_some_and(|base| base.low3() == RM_SIB);

    let Some(base) = mem.base else {
        if wants_sib {
            out.push(ModRm::new(0, reg.low3(), RM_SIB).to_byte());
            out.push(Sib::new(mem.scale, index_field, RM_DISP32).to_byte());
        } else {
            out.push(ModRm::new(0, reg.low3(), RM_DISP32).to_byte());
        }
        out.extend_from_slice(&mem.disp.to_le_bytes());
        return;
    };

    let mode = if kind.contains(OperandKind::DISP32) || i8::try_from(mem.disp).is_err() {
        2
    } else if kind.contains(OperandKind::DISPLACEMENT)
        || mem.disp != 0
        || base.low3() == RM_DISP32
    {
        1
    } else {
        0
    };
    let rm = if wants_sib { RM_SIB } else { base.low3() };
    out.push(ModRm::new(mode, reg.low3(), rm).to_byte());
    if wants_sib {
        out.push(Sib::new(mem.scale, index_field, base.low3()).to_byte());
    }
    match mode {
        1 => out.push(mem.disp as u8),
        2 => out.extend_from_slice(&mem.disp.to_le_bytes()),
        _ => {}
    }
}

fn emit_imm(imm: u64, width: ImmWidth, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    let out_of_range = |bits| EncodeError::ImmediateOutOfRange { imm, bits };
    match width {
        ImmWidth::None => {}
        ImmWidth::Rel8 => {
            let rel = i8::try_from(imm as i64).map_err(|_| out_of_range(8))?;
            out.push(rel as u8);
        }
        ImmWidth::Rel32 => {
            let rel = i32::try_from(imm as i64).map_err(|_| out_of_range(32))?;
            out.extend_from_slice(&rel.to_le_bytes());
        }
        ImmWidth::Imm32 => {
            // zero-extended and sign-extended 32-bit values both fit the field
            let value = u32::try_from(imm)
                .or_else(|_| i32::try_from(imm as i64).map(|v| v as u32))
                .map_err(|_| out_of_range(32))?;
            out.extend_from_slice(&value.to_le_bytes());
        }
        ImmWidth::Imm64 => out.extend_from_slice(&imm.to_le_bytes()),
    }
    Ok(())
}

/// Re-encodes `ins` and stores the resulting length in `size`.
pub fn with_size(mut ins: Instruction) -> Result<Instruction, EncodeError> {
    ins.size = encoded_len(&ins)? as u8;
    Ok(ins)
}

impl Instruction {
    /// Prefix the encoder will actually emit for this record.
    pub fn effective_rex(&self) -> Rex {
        let required = resolve(self).map_or(0, |ops| ops.required_rex());
        if self.rex.is_present() || required != 0 {
            Rex::from_byte(0x40 | self.rex.raw() | required).unwrap_or(self.rex)
        } else {
            Rex::NONE
        }
    }
}
