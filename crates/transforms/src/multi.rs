//! Expansion rules: one record in, up to [`MutationBatch::CAPACITY`] records out.

use crate::batch::MutationBatch;
use crate::mba::{sign_extend_imm32, xor_decompose};
use crate::util::RuleKind;
use crate::{ExpansionRule, Site};
use shapeshift_core::decoder::{Instruction, MemOperand};
use shapeshift_core::encoder::encoded_len;
use shapeshift_core::opcode::{Condition, Opcode};
use shapeshift_core::operand::{OperandKind, OperandWidth, Reg, Rex};
use shapeshift_utils::errors::TransformError;

fn is_reg_imm(ins: &Instruction) -> bool {
    ins.operands.form() == OperandKind::REGISTER | OperandKind::IMMEDIATE
}

/// Length of the original encoding, re-encoding hand-built records.
fn original_len(ins: &Instruction) -> Result<i64, TransformError> {
    let len = match ins.size {
        0 => encoded_len(ins)?,
        size => usize::from(size),
    };
    Ok(len as i64)
}

/// `push imm32` → `sub rsp, 8; mov qword [rsp], imm32`.
///
/// The store sign-extends its immediate exactly like `push`. `sub` writes the flags.
#[derive(Debug, Clone, Copy)]
pub struct PushExpand;

impl ExpansionRule for PushExpand {
    fn kind(&self) -> RuleKind {
        RuleKind::PushExpand
    }

    fn matches(&self, ins: &Instruction, _site: &Site<'_>) -> bool {
        ins.opcode == Opcode::PushImm && ins.operands.form() == OperandKind::IMMEDIATE
    }

    fn expand(
        &self,
        ins: &Instruction,
        _site: &mut Site<'_>,
    ) -> Result<MutationBatch, TransformError> {
        let reserve = Instruction::reg_imm(Opcode::SubRegImm, Reg::RSP, 8).with_rex(Rex::W);
        let store = Instruction::store_imm(MemOperand::base(Reg::RSP), ins.imm).with_rex(Rex::W);
        MutationBatch::from_rule(self.kind(), &[reserve, store])
    }
}

/// `xchg a, b` → `xor a, b; xor b, a; xor a, b`.
///
/// `xchg a, a` is skipped: the xor swap would zero the register.
#[derive(Debug, Clone, Copy)]
pub struct XchgSwap;

impl ExpansionRule for XchgSwap {
    fn kind(&self) -> RuleKind {
        RuleKind::XchgSwap
    }

    fn matches(&self, ins: &Instruction, _site: &Site<'_>) -> bool {
        ins.opcode == Opcode::XchgRegReg
            && ins.operands.form() == OperandKind::REGISTER
            && ins.op1.is_some()
            && ins.op2.is_some()
            && ins.op1 != ins.op2
    }

    fn expand(
        &self,
        ins: &Instruction,
        _site: &mut Site<'_>,
    ) -> Result<MutationBatch, TransformError> {
        let (Some(a), Some(b)) = (ins.op1, ins.op2) else {
            return Ok(MutationBatch::empty());
        };
        let rex = if ins.rex.w() { Rex::W } else { Rex::NONE };
        let xor = |dst, src| Instruction::reg_reg(Opcode::XorRegReg, dst, src).with_rex(rex);
        MutationBatch::from_rule(self.kind(), &[xor(a, b), xor(b, a), xor(a, b)])
    }
}

/// `add/sub acc, imm32` → masked load of the scratch register, unmask, then the register
/// form of the same operation.
///
/// The scratch register is clobbered. Width follows the original: without `REX.W` the
/// 32-bit forms zero the upper half, which the original does too.
#[derive(Debug, Clone, Copy)]
pub struct AccumulatorMba {
    kind: RuleKind,
    source: Opcode,
    combine: Opcode,
}

impl AccumulatorMba {
    /// `add rax, imm32` through `add rax, scratch`.
    pub const ADD: Self = Self {
        kind: RuleKind::AddMba,
        source: Opcode::AddAccImm,
        combine: Opcode::AddRegReg,
    };

    /// `sub rax, imm32` through `sub rax, scratch`.
    pub const SUB: Self = Self {
        kind: RuleKind::SubMba,
        source: Opcode::SubAccImm,
        combine: Opcode::SubRegReg,
    };
}

impl ExpansionRule for AccumulatorMba {
    fn kind(&self) -> RuleKind {
        self.kind
    }

    fn matches(&self, ins: &Instruction, site: &Site<'_>) -> bool {
        ins.opcode == self.source && is_reg_imm(ins) && site.config.scratch != Reg::RAX
    }

    fn expand(
        &self,
        ins: &Instruction,
        site: &mut Site<'_>,
    ) -> Result<MutationBatch, TransformError> {
        let scratch = site.config.scratch;
        let width = ins.operand_width();
        let (value, rex) = match width {
            OperandWidth::Qword => (sign_extend_imm32(ins.imm), Rex::W),
            _ => (ins.imm, Rex::NONE),
        };
        let [load, unmask] = xor_decompose(Reg::RAX, scratch, value, width, &mut *site.rng);
        let combine = Instruction::reg_reg(self.combine, Reg::RAX, scratch).with_rex(rex);
        MutationBatch::from_rule(self.kind, &[load, unmask, combine])
    }
}

/// `mov r32, imm32` → `mov r32, imm ^ m; xor r32, m`.
///
/// The trailing `xor` writes the flags.
#[derive(Debug, Clone, Copy)]
pub struct MovImmMba;

impl ExpansionRule for MovImmMba {
    fn kind(&self) -> RuleKind {
        RuleKind::MovImmMba
    }

    fn matches(&self, ins: &Instruction, _site: &Site<'_>) -> bool {
        ins.opcode == Opcode::MovRegImm && !ins.rex.w() && is_reg_imm(ins) && ins.op1.is_some()
    }

    fn expand(
        &self,
        ins: &Instruction,
        site: &mut Site<'_>,
    ) -> Result<MutationBatch, TransformError> {
        let Some(reg) = ins.op1 else {
            return Ok(MutationBatch::empty());
        };
        let records = xor_decompose(reg, reg, ins.imm, OperandWidth::Dword, &mut *site.rng);
        MutationBatch::from_rule(self.kind(), &records)
    }
}

/// `jcc rel32` → `set<!cc> al; test al, al; jnz +5; jmp rel32`.
///
/// The final displacement is corrected by the length difference so the absolute target does
/// not move. `al` and the flags are clobbered. A branch whose corrected displacement leaves
/// the rel32 range is not rewritten.
#[derive(Debug, Clone, Copy)]
pub struct JccInvert;

impl JccInvert {
    /// Length of the `jmp rel32` the `jnz` skips.
    const JMP_LEN: i64 = 5;

    fn sequence(ins: &Instruction) -> Result<Option<[Instruction; 4]>, TransformError> {
        let Opcode::JccNear(cc) = ins.opcode else {
            return Ok(None);
        };
        let head = [
            Instruction::reg(Opcode::Setcc(cc.inverse()), Reg::RAX),
            Instruction::reg_reg(Opcode::TestReg8, Reg::RAX, Reg::RAX),
            Instruction::branch(Opcode::JccNear(Condition::Ne), Self::JMP_LEN),
        ];
        let mut replacement_len = Self::JMP_LEN;
        for record in &head {
            replacement_len += encoded_len(record)? as i64;
        }
        let rel = ins.rel() + original_len(ins)? - replacement_len;
        if i32::try_from(rel).is_err() {
            return Ok(None);
        }
        let jmp = Instruction::branch(Opcode::JmpRel32, rel);
        Ok(Some([head[0], head[1], head[2], jmp]))
    }
}

impl ExpansionRule for JccInvert {
    fn kind(&self) -> RuleKind {
        RuleKind::JccInvert
    }

    fn matches(&self, ins: &Instruction, _site: &Site<'_>) -> bool {
        matches!(ins.opcode, Opcode::JccNear(_))
            && ins.operands.form() == OperandKind::IMMEDIATE
            && matches!(Self::sequence(ins), Ok(Some(_)))
    }

    fn expand(
        &self,
        ins: &Instruction,
        _site: &mut Site<'_>,
    ) -> Result<MutationBatch, TransformError> {
        match Self::sequence(ins)? {
            Some(records) => MutationBatch::from_rule(self.kind(), &records),
            None => Ok(MutationBatch::empty()),
        }
    }
}

/// `call rel32` → `mov rax, stub; call rax`, where the stub calls the same target through
/// the dispatch table.
///
/// Only applies when enabled in the configuration, a dispatch table is attached, the site
/// address is known and the target has a table slot. `rax` is clobbered before the call.
#[derive(Debug, Clone, Copy)]
pub struct VirtualCall;

impl VirtualCall {
    fn target(ins: &Instruction, site: &Site<'_>) -> Option<u64> {
        let address = site.address?;
        let len = original_len(ins).ok()?;
        Some(address.wrapping_add(len as u64).wrapping_add(ins.imm))
    }
}

impl ExpansionRule for VirtualCall {
    fn kind(&self) -> RuleKind {
        RuleKind::VirtualCall
    }

    fn matches(&self, ins: &Instruction, site: &Site<'_>) -> bool {
        if ins.opcode != Opcode::CallRel32 || !site.config.virtual_call {
            return false;
        }
        let Some(dispatch) = site.dispatch.as_deref() else {
            return false;
        };
        Self::target(ins, site).is_some_and(|target| dispatch.table().slot_of(target).is_some())
    }

    fn expand(
        &self,
        ins: &Instruction,
        site: &mut Site<'_>,
    ) -> Result<MutationBatch, TransformError> {
        let target = Self::target(ins, site);
        let (Some(target), Some(dispatch)) = (target, site.dispatch.as_deref_mut()) else {
            return Ok(MutationBatch::empty());
        };
        let Some(stub) = dispatch.stub_for(target)? else {
            return Ok(MutationBatch::empty());
        };
        let load = Instruction::reg_imm(Opcode::MovRegImm, Reg::RAX, stub).with_rex(Rex::W);
        let call = Instruction::reg(Opcode::CallReg, Reg::RAX);
        MutationBatch::from_rule(self.kind(), &[load, call])
    }
}

/// Expansion rules in priority order.
pub static CATALOG: [&dyn ExpansionRule; 7] = [
    &PushExpand,
    &XchgSwap,
    &AccumulatorMba::ADD,
    &AccumulatorMba::SUB,
    &MovImmMba,
    &JccInvert,
    &VirtualCall,
];
