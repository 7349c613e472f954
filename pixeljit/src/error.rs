//! Compile-error taxonomy.
//!
//! Every error aborts the compilation; there is no localised recovery.

use pixeljit_asm::AsmError;
use thiserror::Error;

/// Fatal compilation failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompileError {
    /// Malformed source text or an unknown identifier, with the byte
    /// position it was noticed at.
    #[error("parse error at byte {pos}: {msg}")]
    Parse {
        /// Byte offset into the expression string.
        pos: usize,
        /// What the parser expected or rejected.
        msg: String,
    },
    /// An opcode received operands of a type it cannot coerce.
    #[error("type error: {0}")]
    Type(String),
    /// The register file is exhausted. The message carries the full
    /// register map (opcode name per register, or reserved/empty) for
    /// debugging.
    #[error("out of registers compiling {op}\n{map}")]
    OutOfRegisters {
        /// Opcode that failed to allocate.
        op: &'static str,
        /// One line per register describing its occupant.
        map: String,
    },
    /// The image shape violates a compile-time precondition.
    #[error("shape error: {0}")]
    Shape(String),
    /// The assembler rejected the emitted code.
    #[error(transparent)]
    Asm(#[from] AsmError),
}
