use thiserror::Error;

/// Failures surfaced by the assembler and the object writer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AsmError {
    /// A branch target was never bound with [`crate::Assembler::label`].
    #[error("unbound label `{0}`")]
    UnboundLabel(String),
    /// The same label name was bound twice.
    #[error("label `{0}` bound twice")]
    DuplicateLabel(String),
    /// Branches remain unpatched; `finalize` must run before the code is
    /// read or written out.
    #[error("code buffer has unresolved branches; call finalize first")]
    PendingFixups,
    /// A branch displacement does not fit in 32 bits.
    #[error("branch to `{0}` out of range")]
    BranchOutOfRange(String),
    /// Writing the object file failed.
    #[error("failed to write object file: {0}")]
    Io(#[from] std::io::Error),
}
