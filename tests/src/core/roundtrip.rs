//! Every supported form decodes and re-encodes to the same bytes, and every record the
//! encoder accepts decodes back to itself.

use shapeshift_core::decoder::{decode, Instruction, MemOperand};
use shapeshift_core::encoder::{encode, encoded_len, with_size};
use shapeshift_core::operand::Reg;

const SAMPLES: &[&str] = &[
    "b844332211",           // mov eax, imm32
    "49bb8877665544332211", // mov r11, imm64
    "4c89c8",               // mov rax, r9
    "4c8bc8",               // mov r9, rax
    "488b4510",             // mov rax, [rbp+0x10]
    "8b44b310",             // mov eax, [rbx+rsi*4+0x10]
    "48890c24",             // mov [rsp], rcx
    "8b0d20000000",         // mov ecx, [rip+0x20]
    "48c7042478563412",     // mov qword [rsp], imm32
    "0510000000",           // add eax, imm32
    "482d10000000",         // sub rax, imm32
    "01d8",                 // add eax, ebx
    "4d29c1",               // sub r9, r8
    "31c0",                 // xor eax, eax
    "4887d8",               // xchg rax, rbx
    "84c0",                 // test al, al
    "4881c408000000",       // add rsp, 8
    "81eb10000000",         // sub ebx, 0x10
    "4181f0ffffffff",       // xor r8d, imm32
    "6801000000",           // push 1
    "74fe",                 // je -2
    "0f8500010000",         // jne +0x100
    "0f9fc1",               // setg cl
    "e9fbffffff",           // jmp -5
    "eb00",                 // jmp +0
    "e800000000",           // call +0
    "ffd0",                 // call rax
    "41ffd3",               // call r11
    "c3",                   // ret
];

#[test]
fn supported_forms_round_trip() {
    for sample in SAMPLES {
        let bytes = hex::decode(sample).unwrap();
        let ins = decode(&bytes).unwrap_or_else(|e| panic!("{sample}: {e}"));
        assert_eq!(usize::from(ins.size), bytes.len(), "{sample}");
        assert_eq!(encode(&ins).unwrap(), bytes, "{sample} ({ins})");
    }
}

/// Encodings no canonical encoder picks: they must still survive a round trip byte for byte.
const WIDE_DISPLACEMENTS: &[&str] = &[
    "488b4000",               // mov rax, [rax+0x00]
    "8b8310000000",           // mov eax, [rbx+0x00000010]
    "8b8500000000",           // mov eax, [rbp+0x00000000]
    "8b4500",                 // mov eax, [rbp+0x00]
    "418b4500",               // mov eax, [r13+0x00]
    "4c8b6c2400",             // mov r13, [rsp+0x00]
    "8984b310000000",         // mov [rbx+rsi*4+0x00000010], eax
    "c744240001000000",       // mov dword [rsp+0x00], 1
    "48c7801000000002000000", // mov qword [rax+0x00000010], 2
];

#[test]
fn wide_displacements_round_trip() {
    for sample in WIDE_DISPLACEMENTS {
        let bytes = hex::decode(sample).unwrap();
        let ins = decode(&bytes).unwrap_or_else(|e| panic!("{sample}: {e}"));
        assert_eq!(usize::from(ins.size), bytes.len(), "{sample}");
        assert_eq!(encode(&ins).unwrap(), bytes, "{sample} ({ins})");
    }
}

const DISPLACEMENTS: [i32; 9] = [0, 1, -1, 127, -128, 128, -129, 0x1000, i32::MIN];

fn registers() -> impl Iterator<Item = Reg> {
    (0..16).filter_map(Reg::new)
}

/// `decode(encode(rec))` gives back `rec` with its size and emitted prefix filled in.
fn assert_record_round_trips(rec: Instruction) {
    let bytes = encode(&rec).unwrap_or_else(|e| panic!("{rec}: {e}"));
    let expected = with_size(rec.with_rex(rec.effective_rex())).unwrap();
    assert_eq!(usize::from(expected.size), encoded_len(&rec).unwrap());
    let decoded = decode(&bytes).unwrap_or_else(|e| panic!("{rec}: {e}"));
    assert_eq!(decoded, expected, "{rec} -> {}", hex::encode(&bytes));
    assert_eq!(usize::from(decoded.size), bytes.len());
}

#[test]
fn based_memory_records_round_trip() {
    for reg in registers() {
        for base in registers() {
            for disp in DISPLACEMENTS {
                let mem = MemOperand::base(base).with_disp(disp);
                for rec in [Instruction::load(reg, mem), Instruction::store(reg, mem)] {
                    assert_record_round_trips(rec);
                    assert_record_round_trips(rec.wide());
                }
            }
        }
    }
}

#[test]
fn indexed_memory_records_round_trip() {
    for index in registers().filter(|&r| r != Reg::RSP) {
        for base in registers() {
            for scale in 0..4 {
                for disp in DISPLACEMENTS {
                    let mem = MemOperand::indexed(base, index, scale).with_disp(disp);
                    assert_record_round_trips(Instruction::load(Reg::RDX, mem).wide());
                    assert_record_round_trips(Instruction::store(Reg::R9, mem));
                    assert_record_round_trips(Instruction::store_imm(mem, 0x7fff_ffff));
                }
            }
        }
    }
}

#[test]
fn rip_relative_records_round_trip() {
    for reg in registers() {
        for disp in DISPLACEMENTS {
            assert_record_round_trips(Instruction::load(reg, MemOperand::rip(disp)).wide());
            assert_record_round_trips(Instruction::store(reg, MemOperand::rip(disp)));
        }
    }
}
