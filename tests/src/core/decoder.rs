use shapeshift_core::decoder::{decode, decode_at, MemOperand};
use shapeshift_core::opcode::{Condition, Opcode};
use shapeshift_core::operand::{OperandKind, Reg};
use shapeshift_utils::errors::DecodeError;

#[test]
fn decode_every_near_condition() {
    for second in 0x80u8..=0x8F {
        let ins = decode(&[0x0F, second, 0x10, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(ins.opcode, Opcode::JccNear(Condition::from_nibble(second)));
        assert_eq!(ins.size, 6);
        assert_eq!(ins.rel(), 0x10);
    }
}

#[test]
fn decode_near_branch_sign_extends() {
    let ins = decode(&[0xE9, 0xFB, 0xFF, 0xFF, 0xFF]).unwrap();
    assert_eq!(ins.opcode, Opcode::JmpRel32);
    assert_eq!(ins.rel(), -5);
}

#[test]
fn decode_walks_a_buffer() {
    // xor eax, eax ; push 1 ; ret
    let code = [0x31, 0xC0, 0x68, 0x01, 0x00, 0x00, 0x00, 0xC3];
    let mut offset = 0;
    let mut opcodes = Vec::new();
    while offset < code.len() {
        let ins = decode_at(&code, offset).unwrap();
        opcodes.push(ins.opcode);
        offset += usize::from(ins.size);
    }
    assert_eq!(opcodes, vec![Opcode::XorRegReg, Opcode::PushImm, Opcode::Ret]);
    assert_eq!(decode_at(&code, code.len()), Err(DecodeError::Empty));
    assert_eq!(decode_at(&code, 100), Err(DecodeError::Empty));
}

#[test]
fn decode_keeps_bare_rex() {
    let ins = decode(&[0x40, 0xC3]).unwrap();
    assert_eq!(ins.opcode, Opcode::Ret);
    assert_eq!(ins.rex.raw(), 0x40);
    assert_eq!(ins.size, 2);
}

#[test]
fn decode_rex_extends_both_fields() {
    // mov r9, r8 via 8B: reg = r9 (REX.R), rm = r8 (REX.B)
    let ins = decode(&[0x4D, 0x8B, 0xC8]).unwrap();
    assert_eq!(ins.opcode, Opcode::MovRegMem);
    assert_eq!((ins.op1, ins.op2), (Some(Reg::R9), Some(Reg::R8)));
    assert!(ins.rex.w());
}

#[test]
fn decode_sib_with_index_and_disp8() {
    // mov eax, [rbx+rsi*4+0x10]
    let ins = decode(&[0x8B, 0x44, 0xB3, 0x10]).unwrap();
    let mem = ins.memory().unwrap();
    assert_eq!(mem, MemOperand::indexed(Reg::RBX, Reg::RSI, 2).with_disp(0x10));
    assert!(ins.operands.contains(OperandKind::SIB));
    assert!(ins.operands.contains(OperandKind::DISPLACEMENT));
    assert_eq!(ins.size, 4);
}

#[test]
fn decode_rsp_base_needs_sib() {
    // mov [rsp], ecx
    let ins = decode(&[0x89, 0x0C, 0x24]).unwrap();
    assert_eq!(ins.memory().unwrap(), MemOperand::base(Reg::RSP));
    assert_eq!(ins.op2, Some(Reg::RCX));
    assert_eq!(ins.to_string(), "mov [rsp], ecx");
}

#[test]
fn decode_absolute_address() {
    // mov eax, [0x1000]
    let ins = decode(&[0x8B, 0x04, 0x25, 0x00, 0x10, 0x00, 0x00]).unwrap();
    let mem = ins.memory().unwrap();
    assert_eq!((mem.base, mem.index, mem.disp), (None, None, 0x1000));
    assert!(!ins.operands.contains(OperandKind::RIP_RELATIVE));
    assert_eq!(ins.size, 7);
}

#[test]
fn decode_store_imm_to_memory() {
    let ins = decode(&[0x48, 0xC7, 0x04, 0x24, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
    assert_eq!(ins.opcode, Opcode::MovMemImm);
    assert_eq!(ins.imm, 0xFFFF_FFFF);
    assert_eq!(ins.to_string(), "mov qword [rsp], 0xffffffff");
}

#[test]
fn decode_rejects_unlisted_extensions() {
    // cmp r/m32, imm32 (81 /7)
    assert_eq!(
        decode(&[0x81, 0xF8, 1, 0, 0, 0]),
        Err(DecodeError::UnsupportedForm {
            opcode: 0x81,
            modrm: 0xF8
        })
    );
    // jmp r/m64 (FF /4)
    assert!(matches!(
        decode(&[0xFF, 0xE0]),
        Err(DecodeError::UnsupportedForm { opcode: 0xFF, .. })
    ));
    // mov r32, imm32 spelled C7 /0 with a register destination
    assert!(matches!(
        decode(&[0xC7, 0xC0, 1, 0, 0, 0]),
        Err(DecodeError::UnsupportedForm { opcode: 0xC7, .. })
    ));
    // add with a memory operand
    assert!(matches!(
        decode(&[0x01, 0x03]),
        Err(DecodeError::UnsupportedForm { opcode: 0x01, .. })
    ));
    assert_eq!(
        decode(&[0x0F, 0x05]),
        Err(DecodeError::Unsupported { opcode: 0x0F05 })
    );
}

#[test]
fn decode_reports_missing_bytes_after_rex() {
    assert!(matches!(decode(&[0x48]), Err(DecodeError::Truncated { .. })));
    assert_eq!(
        decode(&[0x48, 0xB8, 1, 2, 3]),
        Err(DecodeError::Truncated {
            needed: 10,
            available: 5
        })
    );
}
