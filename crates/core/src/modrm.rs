//! ModRM and SIB byte layouts.

/// `mod` value selecting register-direct addressing.
pub const MODE_DIRECT: u8 = 0b11;
/// ModRM `rm` value announcing a SIB byte (when `mod != 11`).
pub const RM_SIB: u8 = 0b100;
/// ModRM `rm` / SIB `base` value that means "disp32, no base" when `mod == 00`.
pub const RM_DISP32: u8 = 0b101;
/// SIB `index` value meaning "no index" (without `REX.X`).
pub const SIB_NO_INDEX: u8 = 0b100;

/// Addressing byte: `mod(2) | reg(3) | rm(3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    /// Addressing mode, `0..=3`.
    pub mode: u8,
    /// Register or opcode extension.
    pub reg: u8,
    /// Register or memory selector.
    pub rm: u8,
}

impl ModRm {
    /// Packs the fields, masking each to its width.
    pub const fn new(mode: u8, reg: u8, rm: u8) -> Self {
        Self {
            mode: mode & 0x03,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Register-direct form (`mod == 11`).
    pub const fn direct(reg: u8, rm: u8) -> Self {
        Self::new(MODE_DIRECT, reg, rm)
    }

    /// Whether `rm` names a register rather than memory.
    pub const fn is_direct(self) -> bool {
        self.mode == MODE_DIRECT
    }

    /// The encoded byte.
    pub const fn to_byte(self) -> u8 {
        (self.mode << 6) | (self.reg << 3) | self.rm
    }
}

impl From<u8> for ModRm {
    fn from(byte: u8) -> Self {
        Self::new(byte >> 6, byte >> 3, byte)
    }
}

/// Scaled-index byte: `scale(2) | index(3) | base(3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sib {
    /// Index multiplier as a power of two.
    pub scale: u8,
    /// Index register field.
    pub index: u8,
    /// Base register field.
    pub base: u8,
}

impl Sib {
    /// Packs the fields, masking each to its width.
    pub const fn new(scale: u8, index: u8, base: u8) -> Self {
        Self {
            scale: scale & 0x03,
            index: index & 0x07,
            base: base & 0x07,
        }
    }

    /// The encoded byte.
    pub const fn to_byte(self) -> u8 {
        (self.scale << 6) | (self.index << 3) | self.base
    }
}

impl From<u8> for Sib {
    fn from(byte: u8) -> Self {
        Self::new(byte >> 6, byte >> 3, byte)
    }
}
