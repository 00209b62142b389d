use shapeshift_core::decoder::{Instruction, MemOperand};
use shapeshift_core::encoder::{encode, encode_into, encoded_len};
use shapeshift_core::opcode::{Condition, Opcode};
use shapeshift_core::operand::{OperandKind, Reg, Rex};
use shapeshift_utils::errors::EncodeError;

#[test]
fn encode_zero_idiom() {
    let ins = Instruction::reg_reg(Opcode::XorRegReg, Reg::RAX, Reg::RAX).with_rex(Rex::W);
    assert_eq!(encode(&ins).unwrap(), vec![0x48, 0x31, 0xC0]);
}

#[test]
fn encode_synthesises_rex_for_extended_registers() {
    // xor r9d, r8d without any prefix supplied
    let ins = Instruction::reg_reg(Opcode::XorRegReg, Reg::R9, Reg::R8);
    assert_eq!(encode(&ins).unwrap(), vec![0x45, 0x31, 0xC1]);
}

#[test]
fn encode_setcc_and_test() {
    let set = Instruction::reg(Opcode::Setcc(Condition::Ne), Reg::RAX);
    assert_eq!(encode(&set).unwrap(), vec![0x0F, 0x95, 0xC0]);
    let test = Instruction::reg_reg(Opcode::TestReg8, Reg::RAX, Reg::RAX);
    assert_eq!(encode(&test).unwrap(), vec![0x84, 0xC0]);
}

#[test]
fn encode_memory_forms() {
    let disp8 = Instruction::load(Reg::RAX, MemOperand::base(Reg::RBP).with_disp(-8)).wide();
    assert_eq!(encode(&disp8).unwrap(), vec![0x48, 0x8B, 0x45, 0xF8]);

    let disp32 = Instruction::store(Reg::RDX, MemOperand::base(Reg::RBX).with_disp(0x1000));
    assert_eq!(encode(&disp32).unwrap(), vec![0x89, 0x93, 0x00, 0x10, 0x00, 0x00]);

    let rip = Instruction::load(Reg::RCX, MemOperand::rip(0x20));
    assert_eq!(encode(&rip).unwrap(), vec![0x8B, 0x0D, 0x20, 0x00, 0x00, 0x00]);

    let r12 = Instruction::store(Reg::RAX, MemOperand::base(Reg::R12)).wide();
    assert_eq!(encode(&r12).unwrap(), vec![0x49, 0x89, 0x04, 0x24]);
}

#[test]
fn encode_rejects_rsp_index() {
    let ins = Instruction::load(Reg::RAX, MemOperand::indexed(Reg::RBX, Reg::RSP, 0));
    assert!(matches!(encode(&ins), Err(EncodeError::Unsupported { .. })));
}

#[test]
fn encode_checks_immediate_ranges() {
    let short = Instruction::branch(Opcode::JmpRel8, 200);
    assert!(matches!(
        encode(&short),
        Err(EncodeError::ImmediateOutOfRange { bits: 8, .. })
    ));
    let back = Instruction::branch(Opcode::JmpRel8, -128);
    assert_eq!(encode(&back).unwrap(), vec![0xEB, 0x80]);

    let sign_extended = Instruction::reg_imm(Opcode::AddRegImm, Reg::RBX, u64::MAX).wide();
    assert_eq!(
        encode(&sign_extended).unwrap(),
        vec![0x48, 0x81, 0xC3, 0xFF, 0xFF, 0xFF, 0xFF]
    );
    let too_wide = Instruction::reg_imm(Opcode::AddRegImm, Reg::RBX, 1 << 32);
    assert!(matches!(
        encode(&too_wide),
        Err(EncodeError::ImmediateOutOfRange { bits: 32, .. })
    ));
}

#[test]
fn encode_requires_operands() {
    let ins = Instruction::new(Opcode::XorRegReg, OperandKind::REGISTER);
    assert!(matches!(encode(&ins), Err(EncodeError::MissingOperand(_))));
    let wrong_form = Instruction::new(Opcode::Ret, OperandKind::IMMEDIATE);
    assert!(matches!(encode(&wrong_form), Err(EncodeError::Unsupported { .. })));
}

#[test]
fn encode_into_appends() {
    let mut out = vec![0x90];
    let ret = Instruction::new(Opcode::Ret, OperandKind::NONE);
    assert_eq!(encode_into(&ret, &mut out).unwrap(), 1);
    assert_eq!(out, vec![0x90, 0xC3]);
}

#[test]
fn encoded_len_matches_encode() {
    let records = [
        Instruction::reg_imm(Opcode::MovRegImm, Reg::R11, 1).wide(),
        Instruction::imm(Opcode::PushImm, 7),
        Instruction::branch(Opcode::JccNear(Condition::E), 0),
        Instruction::store_imm(MemOperand::base(Reg::RSP), 1).wide(),
    ];
    for ins in &records {
        assert_eq!(encoded_len(ins).unwrap(), encode(ins).unwrap().len(), "{ins}");
    }
}
