//! Module defining the supported x86-64 instruction forms.
//!
//! `Opcode` is a closed enumeration over every form the decoder accepts and the encoder emits.
//! Single-byte forms and the `0x0F` escape forms are distinct variants, and the forms that
//! share a primary byte (`0x81`, `0xFF`) are told apart by their ModRM sub-field, so nothing
//! downstream has to compare raw opcode ranges.
use crate::operand::OperandKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition code carried in the low nibble of `Jcc`/`SETcc` opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    /// Overflow (OF=1)
    O,
    /// No overflow (OF=0)
    No,
    /// Below, unsigned (CF=1)
    B,
    /// Above or equal, unsigned (CF=0)
    Ae,
    /// Equal (ZF=1)
    E,
    /// Not equal (ZF=0)
    Ne,
    /// Below or equal, unsigned (CF=1 or ZF=1)
    Be,
    /// Above, unsigned (CF=0 and ZF=0)
    A,
    /// Sign (SF=1)
    S,
    /// No sign (SF=0)
    Ns,
    /// Parity even (PF=1)
    P,
    /// Parity odd (PF=0)
    Np,
    /// Less, signed (SF!=OF)
    L,
    /// Greater or equal, signed (SF=OF)
    Ge,
    /// Less or equal, signed (ZF=1 or SF!=OF)
    Le,
    /// Greater, signed (ZF=0 and SF=OF)
    G,
}

impl Condition {
    const ALL: [Self; 16] = [
        Self::O,
        Self::No,
        Self::B,
        Self::Ae,
        Self::E,
        Self::Ne,
        Self::Be,
        Self::A,
        Self::S,
        Self::Ns,
        Self::P,
        Self::Np,
        Self::L,
        Self::Ge,
        Self::Le,
        Self::G,
    ];

    /// Reads the condition from the low nibble of an opcode byte.
    pub const fn from_nibble(byte: u8) -> Self {
        Self::ALL[(byte & 0x0F) as usize]
    }

    /// The 4-bit condition field.
    pub const fn nibble(self) -> u8 {
        self as u8
    }

    /// The logically opposite condition. Conditions come in pairs that differ in bit 0.
    pub const fn inverse(self) -> Self {
        Self::from_nibble(self.nibble() ^ 0x01)
    }

    /// Mnemonic suffix, as in `j<suffix>` and `set<suffix>`.
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::O => "o",
            Self::No => "no",
            Self::B => "b",
            Self::Ae => "ae",
            Self::E => "e",
            Self::Ne => "ne",
            Self::Be => "be",
            Self::A => "a",
            Self::S => "s",
            Self::Ns => "ns",
            Self::P => "p",
            Self::Np => "np",
            Self::L => "l",
            Self::Ge => "ge",
            Self::Le => "le",
            Self::G => "g",
        }
    }
}

/// Width of the immediate field an instruction form carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmWidth {
    /// No immediate field
    None,
    /// Signed 8-bit branch displacement
    Rel8,
    /// Signed 32-bit branch displacement
    Rel32,
    /// 32-bit data immediate
    Imm32,
    /// 64-bit data immediate (`mov r64, imm64` only)
    Imm64,
}

impl ImmWidth {
    /// Number of immediate bytes in the encoding.
    pub const fn byte_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Rel8 => 1,
            Self::Rel32 | Self::Imm32 => 4,
            Self::Imm64 => 8,
        }
    }
}

/// Enumeration of supported instruction forms with their byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// `B8+r id` / `REX.W B8+r io`
    MovRegImm,
    /// `89 /r`: `mov r/m, r`
    MovMemReg,
    /// `8B /r`: `mov r, r/m`
    MovRegMem,
    /// `C7 /0 id`: `mov r/m, imm32`, memory destination only
    MovMemImm,
    /// `05 id`: `add eax/rax, imm32`
    AddAccImm,
    /// `2D id`: `sub eax/rax, imm32`
    SubAccImm,
    /// `01 /r`
    AddRegReg,
    /// `29 /r`
    SubRegReg,
    /// `31 /r`
    XorRegReg,
    /// `87 /r`
    XchgRegReg,
    /// `84 /r`: `test r/m8, r8`
    TestReg8,
    /// `81 /0 id`
    AddRegImm,
    /// `81 /5 id`
    SubRegImm,
    /// `81 /6 id`
    XorRegImm,
    /// `68 id`
    PushImm,
    /// `70+cc rel8`
    JccShort(Condition),
    /// `0F 80+cc rel32`
    JccNear(Condition),
    /// `0F 90+cc /r`
    Setcc(Condition),
    /// `E9 rel32`
    JmpRel32,
    /// `EB rel8`
    JmpRel8,
    /// `E8 rel32`
    CallRel32,
    /// `FF /2`: `call r64`
    CallReg,
    /// `C3`
    Ret,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MovRegImm | Self::MovMemReg | Self::MovRegMem | Self::MovMemImm => {
                f.write_str("mov")
            }
            Self::AddAccImm | Self::AddRegReg | Self::AddRegImm => f.write_str("add"),
            Self::SubAccImm | Self::SubRegReg | Self::SubRegImm => f.write_str("sub"),
            Self::XorRegReg | Self::XorRegImm => f.write_str("xor"),
            Self::XchgRegReg => f.write_str("xchg"),
            Self::TestReg8 => f.write_str("test"),
            Self::PushImm => f.write_str("push"),
            Self::JccShort(cc) | Self::JccNear(cc) => write!(f, "j{}", cc.suffix()),
            Self::Setcc(cc) => write!(f, "set{}", cc.suffix()),
            Self::JmpRel32 | Self::JmpRel8 => f.write_str("jmp"),
            Self::CallRel32 | Self::CallReg => f.write_str("call"),
            Self::Ret => f.write_str("ret"),
        }
    }
}

impl Opcode {
    /// Escape byte introducing the two-byte opcode map.
    pub const ESCAPE: u8 = 0x0F;

    /// The 16-bit identifier: single-byte opcodes in the low byte, escape forms as
    /// `0x0F00 | second_byte`. Forms sharing a primary byte share an identifier and differ in
    /// [`Opcode::extension`].
    pub const fn to_u16(self) -> u16 {
        match self.secondary() {
            Some(second) => ((Self::ESCAPE as u16) << 8) | second as u16,
            None => self.primary() as u16,
        }
    }

    /// The first opcode byte (after any REX prefix).
    pub const fn primary(self) -> u8 {
        match self {
            Self::MovRegImm => 0xB8,
            Self::MovMemReg => 0x89,
            Self::MovRegMem => 0x8B,
            Self::MovMemImm => 0xC7,
            Self::AddAccImm => 0x05,
            Self::SubAccImm => 0x2D,
            Self::AddRegReg => 0x01,
            Self::SubRegReg => 0x29,
            Self::XorRegReg => 0x31,
            Self::XchgRegReg => 0x87,
            Self::TestReg8 => 0x84,
            Self::AddRegImm | Self::SubRegImm | Self::XorRegImm => 0x81,
            Self::PushImm => 0x68,
            Self::JccShort(cc) => 0x70 | cc.nibble(),
            Self::JccNear(_) | Self::Setcc(_) => Self::ESCAPE,
            Self::JmpRel32 => 0xE9,
            Self::JmpRel8 => 0xEB,
            Self::CallRel32 => 0xE8,
            Self::CallReg => 0xFF,
            Self::Ret => 0xC3,
        }
    }

    /// The byte following the escape for two-byte forms.
    pub const fn secondary(self) -> Option<u8> {
        match self {
            Self::JccNear(cc) => Some(0x80 | cc.nibble()),
            Self::Setcc(cc) => Some(0x90 | cc.nibble()),
            _ => None,
        }
    }

    /// Whether the form is encoded behind the `0x0F` escape.
    pub const fn is_two_byte(self) -> bool {
        self.secondary().is_some()
    }

    /// The fixed ModRM `reg` sub-field for forms that use it as an opcode extension.
    pub const fn extension(self) -> Option<u8> {
        match self {
            Self::MovMemImm | Self::AddRegImm => Some(0),
            Self::SubRegImm => Some(5),
            Self::XorRegImm => Some(6),
            Self::CallReg => Some(2),
            _ => None,
        }
    }

    /// Width of the immediate field, given whether `REX.W` is set.
    pub const fn imm_width(self, rex_w: bool) -> ImmWidth {
        match self {
            Self::MovRegImm if rex_w => ImmWidth::Imm64,
            Self::MovRegImm
            | Self::MovMemImm
            | Self::AddAccImm
            | Self::SubAccImm
            | Self::AddRegImm
            | Self::SubRegImm
            | Self::XorRegImm
            | Self::PushImm => ImmWidth::Imm32,
            Self::JccShort(_) | Self::JmpRel8 => ImmWidth::Rel8,
            Self::JccNear(_) | Self::JmpRel32 | Self::CallRel32 => ImmWidth::Rel32,
            _ => ImmWidth::None,
        }
    }

    /// The operand kinds (form part only) this opcode accepts.
    pub fn accepts(self, operands: OperandKind) -> bool {
        use OperandKind as K;
        let form = operands.form();
        match self {
            Self::MovRegImm
            | Self::AddAccImm
            | Self::SubAccImm
            | Self::AddRegImm
            | Self::SubRegImm
            | Self::XorRegImm => form == K::REGISTER | K::IMMEDIATE,
            Self::MovMemReg | Self::MovRegMem => {
                form == K::REGISTER || form == K::REGISTER | K::MEMORY
            }
            Self::MovMemImm => form == K::MEMORY | K::IMMEDIATE,
            Self::AddRegReg
            | Self::SubRegReg
            | Self::XorRegReg
            | Self::XchgRegReg
            | Self::TestReg8
            | Self::Setcc(_)
            | Self::CallReg => form == K::REGISTER,
            Self::PushImm
            | Self::JccShort(_)
            | Self::JccNear(_)
            | Self::JmpRel32
            | Self::JmpRel8
            | Self::CallRel32 => form == K::IMMEDIATE,
            Self::Ret => form == K::NONE,
        }
    }

    /// Checks if the opcode transfers control.
    pub const fn is_control_flow(self) -> bool {
        matches!(
            self,
            Self::JccShort(_)
                | Self::JccNear(_)
                | Self::JmpRel32
                | Self::JmpRel8
                | Self::CallRel32
                | Self::CallReg
                | Self::Ret
        )
    }

    /// Whether the immediate is a signed branch displacement.
    pub const fn is_relative(self) -> bool {
        matches!(self.imm_width(false), ImmWidth::Rel8 | ImmWidth::Rel32)
    }
}
