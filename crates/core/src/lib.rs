//! x86-64 instruction codec for the supported subset: records, decoder and encoder.
//!
//! [`decode`] turns bytes into an [`Instruction`]; [`encode`] turns a record back into bytes.
//! Decoded records re-encode to the bytes they came from.

pub mod decoder;
pub mod encoder;
pub mod modrm;
pub mod opcode;
pub mod operand;

pub use decoder::{decode, decode_at, Instruction, MemOperand};
pub use encoder::{encode, encode_into, encoded_len, MAX_INSTRUCTION_LEN};
pub use opcode::{Condition, ImmWidth, Opcode};
pub use operand::{OperandKind, OperandWidth, Reg, Rex};
