//! Register, prefix and operand-kind building blocks shared by the decoder and encoder.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// A general-purpose register index in `0..=15`, matching the hardware encoding.
///
/// The "no register" sentinel is `Option::<Reg>::None`, so an absent operand can never be
/// used as a real register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Reg(u8);

impl Reg {
    /// `rax`
    pub const RAX: Self = Self(0);
    /// `rcx`
    pub const RCX: Self = Self(1);
    /// `rdx`
    pub const RDX: Self = Self(2);
    /// `rbx`
    pub const RBX: Self = Self(3);
    /// `rsp`
    pub const RSP: Self = Self(4);
    /// `rbp`
    pub const RBP: Self = Self(5);
    /// `rsi`
    pub const RSI: Self = Self(6);
    /// `rdi`
    pub const RDI: Self = Self(7);
    /// `r8`
    pub const R8: Self = Self(8);
    /// `r9`
    pub const R9: Self = Self(9);
    /// `r10`
    pub const R10: Self = Self(10);
    /// `r11`
    pub const R11: Self = Self(11);
    /// `r12`
    pub const R12: Self = Self(12);
    /// `r13`
    pub const R13: Self = Self(13);
    /// `r14`
    pub const R14: Self = Self(14);
    /// `r15`
    pub const R15: Self = Self(15);

    /// Returns the register with the given index, or `None` outside `0..=15`.
    pub const fn new(index: u8) -> Option<Self> {
        if index < 16 {
            Some(Self(index))
        } else {
            None
        }
    }

    /// Combines a 3-bit ModRM/SIB/opcode field with its REX extension bit.
    pub const fn from_parts(low3: u8, extended: bool) -> Self {
        Self((low3 & 0x07) | if extended { 0x08 } else { 0 })
    }

    /// Hardware register number, `0..=15`.
    pub const fn index(self) -> u8 {
        self.0
    }

    /// The 3 bits that go into the ModRM, SIB or opcode byte.
    pub const fn low3(self) -> u8 {
        self.0 & 0x07
    }

    /// Whether encoding this register needs a REX extension bit.
    pub const fn is_extended(self) -> bool {
        self.0 >= 8
    }

    /// Register name at the given operand width.
    pub fn name(self, width: OperandWidth) -> &'static str {
        const Q: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        const D: [&str; 16] = [
            "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d",
            "r12d", "r13d", "r14d", "r15d",
        ];
        const B: [&str; 16] = [
            "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b",
            "r12b", "r13b", "r14b", "r15b",
        ];
        let i = self.0 as usize;
        match width {
            OperandWidth::Qword => Q[i],
            OperandWidth::Dword => D[i],
            OperandWidth::Byte => B[i],
        }
    }

    /// Byte register name as encoded with or without a REX prefix. Without one, indices 4..=7
    /// select the high bytes `ah`, `ch`, `dh` and `bh` instead of `spl`..`dil`.
    pub fn byte_name(self, rex_present: bool) -> &'static str {
        const HIGH: [&str; 4] = ["ah", "ch", "dh", "bh"];
        match self.0 {
            4..=7 if !rex_present => HIGH[usize::from(self.0 - 4)],
            _ => self.name(OperandWidth::Byte),
        }
    }
}

impl TryFrom<u8> for Reg {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("register index {value} out of range 0..=15"))
    }
}

impl From<Reg> for u8 {
    fn from(reg: Reg) -> Self {
        reg.0
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name(OperandWidth::Qword))
    }
}

/// Effective operand width of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperandWidth {
    /// 8 bits (`setcc`, `test r8, r8`)
    Byte,
    /// 32 bits, the default without `REX.W`
    Dword,
    /// 64 bits
    Qword,
}

impl OperandWidth {
    /// Width in bits.
    pub const fn bits(self) -> u8 {
        match self {
            Self::Byte => 8,
            Self::Dword => 32,
            Self::Qword => 64,
        }
    }
}

/// Raw REX prefix byte.
///
/// `0` means no prefix was present; otherwise the value is in `0x40..=0x4F`. The raw byte is
/// kept (rather than only the low nibble) so that a bare `0x40` survives a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rex(u8);

impl Rex {
    /// No prefix.
    pub const NONE: Self = Self(0);
    /// `REX.W`: 64-bit operand size.
    pub const W: Self = Self(0x48);

    const W_BIT: u8 = 0x08;
    const R_BIT: u8 = 0x04;
    const X_BIT: u8 = 0x02;
    const B_BIT: u8 = 0x01;

    /// Interprets `byte` as a REX prefix if it is one.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        if byte & 0xF0 == 0x40 {
            Some(Self(byte))
        } else {
            None
        }
    }

    /// Builds a prefix from its four bits.
    pub const fn from_bits(w: bool, r: bool, x: bool, b: bool) -> Self {
        Self(
            0x40 | if w { Self::W_BIT } else { 0 }
                | if r { Self::R_BIT } else { 0 }
                | if x { Self::X_BIT } else { 0 }
                | if b { Self::B_BIT } else { 0 },
        )
    }

    /// The prefix byte, or `0` when absent.
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Whether a prefix byte is emitted.
    pub const fn is_present(self) -> bool {
        self.0 != 0
    }

    /// The W/R/X/B nibble.
    pub const fn bits(self) -> u8 {
        self.0 & 0x0F
    }

    /// 64-bit operand size.
    pub const fn w(self) -> bool {
        self.0 & Self::W_BIT != 0
    }

    /// Extends ModRM `reg`.
    pub const fn r(self) -> bool {
        self.0 & Self::R_BIT != 0
    }

    /// Extends SIB `index`.
    pub const fn x(self) -> bool {
        self.0 & Self::X_BIT != 0
    }

    /// Extends ModRM `rm`, SIB `base` or the opcode register field.
    pub const fn b(self) -> bool {
        self.0 & Self::B_BIT != 0
    }

    /// Returns a copy with `REX.W` set.
    pub const fn with_w(self) -> Self {
        Self(0x40 | self.0 | Self::W_BIT)
    }

    /// Returns a copy with `REX.R` and `REX.B` exchanged.
    ///
    /// Used when the two register operands of a form trade ModRM fields.
    pub const fn swap_r_b(self) -> Self {
        if !self.is_present() {
            return self;
        }
        let r = self.0 & Self::R_BIT;
        let b = self.0 & Self::B_BIT;
        Self((self.0 & !(Self::R_BIT | Self::B_BIT)) | (b << 2) | (r >> 2))
    }
}

impl fmt::Display for Rex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_present() {
            return f.write_str("-");
        }
        write!(f, "0x{:02x}", self.0)
    }
}

/// Bitmask describing which fields of an [`Instruction`](crate::decoder::Instruction) are
/// populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OperandKind(u8);

impl OperandKind {
    /// No operands.
    pub const NONE: Self = Self(0x00);
    /// At least one register operand.
    pub const REGISTER: Self = Self(0x01);
    /// An immediate or relative displacement in `imm`.
    pub const IMMEDIATE: Self = Self(0x02);
    /// A ModRM memory operand.
    pub const MEMORY: Self = Self(0x04);
    /// The memory operand is `[rip + disp32]`.
    pub const RIP_RELATIVE: Self = Self(0x08);
    /// The memory operand carries a displacement field.
    pub const DISPLACEMENT: Self = Self(0x10);
    /// The memory operand is encoded with a SIB byte.
    pub const SIB: Self = Self(0x20);
    /// Pointer operand. Part of the form mask; no supported form sets it.
    pub const POINTER: Self = Self(0x40);
    /// The displacement is encoded in 32 bits, even when it would fit in 8.
    pub const DISP32: Self = Self(0x80);

    /// The flags that identify an instruction form, as opposed to addressing details.
    const FORM_MASK: u8 = 0x01 | 0x02 | 0x04 | 0x40;

    /// Raw flag bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every flag of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The register/immediate/memory/pointer part of the mask.
    pub const fn form(self) -> Self {
        Self(self.0 & Self::FORM_MASK)
    }

    /// Shorthand for `contains(MEMORY)`.
    pub const fn is_memory(self) -> bool {
        self.contains(Self::MEMORY)
    }
}

impl BitOr for OperandKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OperandKind {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for OperandKind {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for OperandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(OperandKind, &str); 8] = [
            (OperandKind::REGISTER, "reg"),
            (OperandKind::IMMEDIATE, "imm"),
            (OperandKind::MEMORY, "mem"),
            (OperandKind::RIP_RELATIVE, "rip"),
            (OperandKind::DISPLACEMENT, "disp"),
            (OperandKind::DISP32, "disp32"),
            (OperandKind::SIB, "sib"),
            (OperandKind::POINTER, "ptr"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}
