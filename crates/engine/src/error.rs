//! Engine errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The architectural tag-violation trap. Raised when a BLOCK policy
    /// fires, when a policy needs an operand the instruction does not have,
    /// or when a tag access names an unsupported memory width. The host is
    /// expected to route this through its exception path; the instruction
    /// does not retire.
    #[error("tag violation at pc={pc:#x}")]
    TagViolation { pc: u64 },

    /// The host's functional step or tag storage faulted.
    #[error("host fault at pc={pc:#x}: {reason}")]
    HostFault { pc: u64, reason: String },
}
