//! A register machine for the supported instruction forms, used to check that rewrites
//! preserve behavior.
//!
//! Only the state the tests compare is modelled: the sixteen general registers, the
//! arithmetic flags and a sparse byte-addressed memory. Byte registers always name the low
//! byte (`ah`..`bh` are not modelled).

use shapeshift_core::decoder::{decode_at, Instruction, MemOperand};
use shapeshift_core::encoder::encoded_len;
use shapeshift_core::opcode::{Condition, Opcode};
use shapeshift_core::operand::{OperandWidth, Reg};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Flags {
    pub(crate) cf: bool,
    pub(crate) zf: bool,
    pub(crate) sf: bool,
    pub(crate) of: bool,
    pub(crate) pf: bool,
}

/// Where execution went after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Next,
    Jump(u64),
    /// `call`/`ret`; the machine stops there
    Leave(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Machine {
    pub(crate) regs: [u64; 16],
    pub(crate) flags: Flags,
    pub(crate) mem: BTreeMap<u64, u8>,
}

fn mask(width: OperandWidth) -> u64 {
    match width {
        OperandWidth::Byte => 0xFF,
        OperandWidth::Dword => 0xFFFF_FFFF,
        OperandWidth::Qword => u64::MAX,
    }
}

fn bits(width: OperandWidth) -> u32 {
    u32::from(width.bits())
}

/// The immediate as the processor sees it at `width`: 32-bit immediates are sign-extended
/// into 64-bit operations.
fn imm_at(ins: &Instruction, width: OperandWidth) -> u64 {
    match width {
        OperandWidth::Qword if ins.opcode != Opcode::MovRegImm => {
            ins.imm as u32 as i32 as i64 as u64
        }
        _ => ins.imm & mask(width),
    }
}

impl Machine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A machine with every register set to a distinct, recognisable value.
    pub(crate) fn seeded(seed: u64) -> Self {
        let mut m = Self::new();
        for (i, reg) in m.regs.iter_mut().enumerate() {
            *reg = seed
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .rotate_left(i as u32 * 5)
                ^ (i as u64) << 56;
        }
        m.regs[usize::from(Reg::RSP.index())] = 0x7FFF_0000;
        m
    }

    pub(crate) fn get(&self, reg: Reg) -> u64 {
        self.regs[usize::from(reg.index())]
    }

    pub(crate) fn set(&mut self, reg: Reg, value: u64) {
        self.regs[usize::from(reg.index())] = value;
    }

    fn read(&self, reg: Reg, width: OperandWidth) -> u64 {
        self.get(reg) & mask(width)
    }

    /// 32-bit writes zero the upper half; byte writes keep the rest of the register.
    fn write(&mut self, reg: Reg, width: OperandWidth, value: u64) {
        let merged = match width {
            OperandWidth::Byte => (self.get(reg) & !0xFF) | (value & 0xFF),
            _ => value & mask(width),
        };
        self.set(reg, merged);
    }

    pub(crate) fn load(&self, addr: u64, width: OperandWidth) -> u64 {
        (0..bits(width) / 8).fold(0, |acc, i| {
            let byte = self.mem.get(&addr.wrapping_add(u64::from(i))).copied();
            acc | u64::from(byte.unwrap_or(0)) << (8 * i)
        })
    }

    pub(crate) fn store(&mut self, addr: u64, width: OperandWidth, value: u64) {
        for i in 0..bits(width) / 8 {
            self.mem
                .insert(addr.wrapping_add(u64::from(i)), (value >> (8 * i)) as u8);
        }
    }

    fn address(&self, mem: &MemOperand, next_pc: u64) -> u64 {
        let base = match (mem.base, mem.index) {
            (Some(base), _) => self.get(base),
            (None, None) => next_pc,
            (None, Some(_)) => 0,
        };
        let index = mem.index.map_or(0, |i| self.get(i) << mem.scale);
        base.wrapping_add(index)
            .wrapping_add(i64::from(mem.disp) as u64)
    }

    fn logic_flags(&mut self, result: u64, width: OperandWidth) {
        let result = result & mask(width);
        self.flags = Flags {
            cf: false,
            of: false,
            zf: result == 0,
            sf: (result >> (bits(width) - 1)) & 1 == 1,
            pf: (result as u8).count_ones() % 2 == 0,
        };
    }

    fn add(&mut self, a: u64, b: u64, width: OperandWidth) -> u64 {
        let m = mask(width);
        let (a, b) = (a & m, b & m);
        let wide = u128::from(a) + u128::from(b);
        let result = (wide as u64) & m;
        let sign = 1u64 << (bits(width) - 1);
        self.logic_flags(result, width);
        self.flags.cf = wide > u128::from(m);
        self.flags.of = (a & sign) == (b & sign) && (result & sign) != (a & sign);
        result
    }

    fn sub(&mut self, a: u64, b: u64, width: OperandWidth) -> u64 {
        let m = mask(width);
        let (a, b) = (a & m, b & m);
        let result = a.wrapping_sub(b) & m;
        let sign = 1u64 << (bits(width) - 1);
        self.logic_flags(result, width);
        self.flags.cf = b > a;
        self.flags.of = (a & sign) != (b & sign) && (result & sign) != (a & sign);
        result
    }

    pub(crate) fn condition(&self, cc: Condition) -> bool {
        let f = self.flags;
        match cc {
            Condition::O => f.of,
            Condition::No => !f.of,
            Condition::B => f.cf,
            Condition::Ae => !f.cf,
            Condition::E => f.zf,
            Condition::Ne => !f.zf,
            Condition::Be => f.cf || f.zf,
            Condition::A => !f.cf && !f.zf,
            Condition::S => f.sf,
            Condition::Ns => !f.sf,
            Condition::P => f.pf,
            Condition::Np => !f.pf,
            Condition::L => f.sf != f.of,
            Condition::Ge => f.sf == f.of,
            Condition::Le => f.zf || f.sf != f.of,
            Condition::G => !f.zf && f.sf == f.of,
        }
    }

    /// Executes one record whose successor starts at `next_pc`.
    pub(crate) fn execute(&mut self, ins: &Instruction, next_pc: u64) -> Flow {
        let width = ins.operand_width();
        let op1 = ins.op1.unwrap_or(Reg::RAX);
        let op2 = ins.op2.unwrap_or(Reg::RAX);
        let target = next_pc.wrapping_add(ins.imm);

        match ins.opcode {
            Opcode::MovRegImm => self.write(op1, width, imm_at(ins, width)),
            Opcode::MovRegMem => match ins.memory() {
                Some(mem) => {
                    let value = self.load(self.address(&mem, next_pc), width);
                    self.write(op1, width, value);
                }
                None => self.write(op1, width, self.read(op2, width)),
            },
            Opcode::MovMemReg => match ins.memory() {
                Some(mem) => {
                    let addr = self.address(&mem, next_pc);
                    self.store(addr, width, self.read(op2, width));
                }
                None => self.write(op1, width, self.read(op2, width)),
            },
            Opcode::MovMemImm => {
                if let Some(mem) = ins.memory() {
                    let addr = self.address(&mem, next_pc);
                    self.store(addr, width, imm_at(ins, width));
                }
            }
            Opcode::AddAccImm => {
                let v = self.add(self.read(Reg::RAX, width), imm_at(ins, width), width);
                self.write(Reg::RAX, width, v);
            }
            Opcode::SubAccImm => {
                let v = self.sub(self.read(Reg::RAX, width), imm_at(ins, width), width);
                self.write(Reg::RAX, width, v);
            }
            Opcode::AddRegImm => {
                let v = self.add(self.read(op1, width), imm_at(ins, width), width);
                self.write(op1, width, v);
            }
            Opcode::SubRegImm => {
                let v = self.sub(self.read(op1, width), imm_at(ins, width), width);
                self.write(op1, width, v);
            }
            Opcode::XorRegImm => {
                let v = self.read(op1, width) ^ imm_at(ins, width);
                self.logic_flags(v, width);
                self.write(op1, width, v);
            }
            Opcode::AddRegReg => {
                let v = self.add(self.read(op1, width), self.read(op2, width), width);
                self.write(op1, width, v);
            }
            Opcode::SubRegReg => {
                let v = self.sub(self.read(op1, width), self.read(op2, width), width);
                self.write(op1, width, v);
            }
            Opcode::XorRegReg => {
                let v = self.read(op1, width) ^ self.read(op2, width);
                self.logic_flags(v, width);
                self.write(op1, width, v);
            }
            Opcode::XchgRegReg => {
                let (a, b) = (self.read(op1, width), self.read(op2, width));
                self.write(op1, width, b);
                self.write(op2, width, a);
            }
            Opcode::TestReg8 => {
                let v = self.read(op1, width) & self.read(op2, width);
                self.logic_flags(v, width);
            }
            Opcode::Setcc(cc) => self.write(op1, width, u64::from(self.condition(cc))),
            Opcode::PushImm => {
                let rsp = self.get(Reg::RSP).wrapping_sub(8);
                self.set(Reg::RSP, rsp);
                self.store(rsp, OperandWidth::Qword, imm_at(ins, OperandWidth::Qword));
            }
            Opcode::JccShort(cc) | Opcode::JccNear(cc) => {
                if self.condition(cc) {
                    return Flow::Jump(target);
                }
            }
            Opcode::JmpRel32 | Opcode::JmpRel8 => return Flow::Jump(target),
            Opcode::CallRel32 => return Flow::Leave(target),
            Opcode::CallReg => return Flow::Leave(self.get(op1)),
            Opcode::Ret => return Flow::Leave(0),
        }
        Flow::Next
    }

    /// Executes hand-built records back to back, laid out from address zero.
    pub(crate) fn run_records(&mut self, records: &[Instruction]) {
        let mut pc = 0u64;
        for ins in records {
            let len = encoded_len(ins).unwrap_or(0) as u64;
            pc += len;
            self.execute(ins, pc);
        }
    }

    /// Executes `code` loaded at `base` until control leaves it, returning the exit address.
    pub(crate) fn run(&mut self, code: &[u8], base: u64) -> u64 {
        let mut pc = base;
        for _ in 0..1024 {
            let Some(offset) = pc.checked_sub(base).filter(|&o| o < code.len() as u64) else {
                return pc;
            };
            let ins = decode_at(code, offset as usize).unwrap();
            let next = pc + u64::from(ins.size);
            pc = match self.execute(&ins, next) {
                Flow::Next => next,
                Flow::Jump(target) => target,
                Flow::Leave(target) => return target,
            };
        }
        panic!("no exit after 1024 steps");
    }
}

#[test]
fn dword_write_clears_upper_half() {
    let mut m = Machine::new();
    m.set(Reg::RBX, u64::MAX);
    m.execute(&Instruction::reg_imm(Opcode::MovRegImm, Reg::RBX, 5), 0);
    assert_eq!(m.get(Reg::RBX), 5);
}

#[test]
fn jcc_follows_flags() {
    // sub eax, 1 ; je +2 ; ret
    let code = [0x2D, 0x01, 0x00, 0x00, 0x00, 0x74, 0x02, 0xC3];
    let mut m = Machine::new();
    m.set(Reg::RAX, 1);
    assert_eq!(m.run(&code, 0x100), 0x100 + 9);
    m.set(Reg::RAX, 5);
    assert_eq!(m.run(&code, 0x100), 0);
}
