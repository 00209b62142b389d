//! In-place rewrites: one record in, one record out.

use crate::util::RuleKind;
use crate::InPlaceRule;
use shapeshift_core::decoder::Instruction;
use shapeshift_core::opcode::Opcode;
use shapeshift_core::operand::{OperandKind, Rex};

/// `mov r, 0` → `xor r, r` at 64-bit width.
///
/// `xor` also writes the flags, which `mov` leaves alone.
#[derive(Debug, Clone, Copy)]
pub struct ZeroMove;

impl InPlaceRule for ZeroMove {
    fn kind(&self) -> RuleKind {
        RuleKind::ZeroMove
    }

    fn matches(&self, ins: &Instruction) -> bool {
        ins.opcode == Opcode::MovRegImm
            && ins.operands.form() == OperandKind::REGISTER | OperandKind::IMMEDIATE
            && ins.imm == 0
            && ins.op1.is_some()
    }

    fn rewrite(&self, ins: &Instruction) -> Option<Instruction> {
        let reg = ins.op1?;
        Some(Instruction::reg_reg(Opcode::XorRegReg, reg, reg).with_rex(Rex::W))
    }
}

/// Register-direct `mov r/m, r` (89) → `mov r, r/m` (8B).
///
/// The two register fields trade places, and so do `REX.R` and `REX.B`. The memory form of
/// 89 is a store and has no 8B equivalent, so it never matches.
#[derive(Debug, Clone, Copy)]
pub struct StoreToLoad;

impl InPlaceRule for StoreToLoad {
    fn kind(&self) -> RuleKind {
        RuleKind::StoreToLoad
    }

    fn matches(&self, ins: &Instruction) -> bool {
        ins.opcode == Opcode::MovMemReg
            && ins.operands.form() == OperandKind::REGISTER
            && ins.op1.is_some()
            && ins.op2.is_some()
    }

    fn rewrite(&self, ins: &Instruction) -> Option<Instruction> {
        let (dst, src) = (ins.op1?, ins.op2?);
        Some(Instruction::reg_reg(Opcode::MovRegMem, dst, src).with_rex(ins.rex.swap_r_b()))
    }
}

/// `xor r, r` → `mov r32, 0`, which zero-extends into the full register.
///
/// `mov` does not write the flags, so they keep whatever earlier code left instead of the
/// cleared CF/OF and set ZF that `xor` produces. Only apply it where the flags are dead.
#[derive(Debug, Clone, Copy)]
pub struct XorZero;

impl InPlaceRule for XorZero {
    fn kind(&self) -> RuleKind {
        RuleKind::XorZero
    }

    fn matches(&self, ins: &Instruction) -> bool {
        ins.opcode == Opcode::XorRegReg
            && ins.operands.form() == OperandKind::REGISTER
            && ins.op1.is_some()
            && ins.op1 == ins.op2
    }

    fn rewrite(&self, ins: &Instruction) -> Option<Instruction> {
        Some(Instruction::reg_imm(Opcode::MovRegImm, ins.op1?, 0))
    }
}

/// In-place rules in priority order.
pub static CATALOG: [&dyn InPlaceRule; 3] = [&ZeroMove, &StoreToLoad, &XorZero];
