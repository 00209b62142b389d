//! Mixed boolean-arithmetic rewrites of immediates.
//!
//! A constant `v` is materialised as `mov temp, v ^ m` followed by `xor temp, m` for a random
//! 32-bit mask `m`. At 64-bit width `81 /6` sign-extends its immediate, so the load is masked
//! with the sign-extended mask.

use rand::Rng;
use shapeshift_core::decoder::Instruction;
use shapeshift_core::opcode::Opcode;
use shapeshift_core::operand::{OperandWidth, Reg};
use tracing::trace;

/// Splits `imm` into a masked load of `temp` and the unmasking `xor`.
///
/// `target` is the register the caller will combine `temp` into; only the caller emits that
/// final record.
pub fn xor_decompose<R: Rng + ?Sized>(
    target: Reg,
    temp: Reg,
    imm: u64,
    width: OperandWidth,
    rng: &mut R,
) -> [Instruction; 2] {
    let mask: u32 = rng.random();
    trace!(%target, %temp, mask, "xor decomposition");
    xor_decompose_with_mask(temp, imm, width, mask)
}

/// Deterministic core of [`xor_decompose`].
pub fn xor_decompose_with_mask(
    temp: Reg,
    imm: u64,
    width: OperandWidth,
    mask: u32,
) -> [Instruction; 2] {
    match width {
        OperandWidth::Qword => {
            let wide_mask = mask as i32 as i64 as u64;
            [
                Instruction::reg_imm(Opcode::MovRegImm, temp, imm ^ wide_mask).wide(),
                Instruction::reg_imm(Opcode::XorRegImm, temp, u64::from(mask)).wide(),
            ]
        }
        OperandWidth::Dword | OperandWidth::Byte => [
            Instruction::reg_imm(Opcode::MovRegImm, temp, u64::from(imm as u32 ^ mask)),
            Instruction::reg_imm(Opcode::XorRegImm, temp, u64::from(mask)),
        ],
    }
}

/// Sign-extends the 32-bit immediate of a `REX.W` arithmetic form.
pub const fn sign_extend_imm32(imm: u64) -> u64 {
    imm as u32 as i32 as i64 as u64
}
