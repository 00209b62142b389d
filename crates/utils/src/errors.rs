//! Error enums for each stage: decoding, encoding, dispatch emission, mutation and the CLI.
use thiserror::Error;

/// Custom error type for decoding operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The input slice was empty.
    #[error("no bytes to decode")]
    Empty,

    /// The opcode byte is outside the supported table.
    #[error("unsupported opcode 0x{opcode:02x}")]
    Unsupported {
        /// Opcode identifier, `0x0Fxx` for escape forms
        opcode: u16,
    },

    /// The opcode is known but the ModRM sub-field or mode selects a form the table lacks.
    #[error("unsupported form of opcode 0x{opcode:02x}: modrm 0x{modrm:02x}")]
    UnsupportedForm {
        /// Opcode identifier
        opcode: u16,
        /// The offending ModRM byte
        modrm: u8,
    },

    /// The instruction runs past the end of the input.
    #[error("truncated instruction: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the instruction needs
        needed: usize,
        /// Bytes left in the input
        available: usize,
    },
}

/// Errors that can occur during the encoding process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The opcode/operand-kind combination has no table entry.
    #[error("unsupported instruction form: opcode 0x{opcode:04x}, operands 0x{operands:02x}")]
    Unsupported {
        /// Opcode identifier
        opcode: u16,
        /// Raw operand-kind bits
        operands: u8,
    },

    /// A register the form requires was left empty.
    #[error("missing operand: {0}")]
    MissingOperand(&'static str),

    /// The immediate does not fit the width the form encodes.
    #[error("immediate 0x{imm:x} does not fit in {bits} bits")]
    ImmediateOutOfRange {
        /// The rejected value
        imm: u64,
        /// Width of the immediate field
        bits: u8,
    },
}

/// Errors raised while building or emitting a virtual dispatch fragment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The host refused the executable-memory request.
    #[error("executable allocation of {size} bytes failed")]
    Allocation {
        /// Requested size in bytes
        size: usize,
    },

    /// The fragment does not fit the region it was written to.
    #[error("fragment of {needed} bytes exceeds region of {available} bytes")]
    RegionTooSmall {
        /// Fragment length
        needed: usize,
        /// Region length
        available: usize,
    },

    /// The requested slot is not part of the dispatch table.
    #[error("slot {index} out of range for table of {len} entries")]
    SlotOutOfRange {
        /// Requested slot
        index: usize,
        /// Number of table entries
        len: usize,
    },

    /// Encoding one of the template records failed.
    #[error("dispatch template encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

/// Error type for transform operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    /// Decoding an input instruction failed.
    #[error("instruction decoding failed: {0}")]
    Decode(#[from] DecodeError),
    /// A replacement record did not encode.
    #[error("instruction encoding failed: {0}")]
    Encode(#[from] EncodeError),
    /// Building the virtual call stub failed.
    #[error("virtual dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
    /// A rule tried to push more records than a batch holds.
    #[error("mutation batch holds at most {capacity} instructions")]
    BatchOverflow {
        /// Maximum records per batch
        capacity: usize,
    },
    /// The encoded replacement is larger than the room the caller allows.
    #[error("replacement of {needed} bytes exceeds remaining capacity of {available} bytes")]
    CapacityExceeded {
        /// Encoded length of the replacement
        needed: usize,
        /// Bytes the caller allows
        available: usize,
    },
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors surfaced by the command-line front end.
#[derive(Debug, Error)]
pub enum CliError {
    /// Input was not valid hex.
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
    /// An input file could not be read.
    #[error("could not read file '{path}': {source}")]
    FileRead {
        /// The path as given on the command line
        path: String,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },
    /// Any other I/O failure.
    #[error("file error: {0}")]
    File(#[from] std::io::Error),
    /// Decoding failed.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// Encoding failed.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    /// Mutation or rewriting failed.
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),
    /// Dispatch stub emission failed.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    /// JSON input or output failed.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    /// A command-line value is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
