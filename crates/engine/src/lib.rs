//! rvtap-engine: tag-propagation and policy-enforcement engine for RISC-V
//! hosts.
//!
//! This crate provides:
//! - Byte-granular tag propagation over registers and memory, driven by an
//!   ordered list of wildcard-masked policies per context
//! - A per-context state machine (enforcement flag, privilege bits, stack
//!   watermark) selected by a field in the privileged status register
//! - Actions: block, allow, get-tag, stack scrubbing, debug traces
//! - Benchmark counters for comparing policy designs
//!
//! The host simulator stays in charge of functional execution; it hands each
//! retired instruction to [`TagEngine::execute_insn`] and services tag and
//! register callbacks through the [`Host`] trait.

pub mod builtin;
pub mod context;
pub mod counters;
pub mod engine;
pub mod error;
pub mod host;
pub mod insn;
pub mod mock;
pub mod operand;
pub mod policy;

pub use context::{ContextState, ContextStore, MAX_CONTEXTS};
pub use counters::Counters;
pub use engine::{TagEngine, BENCH_CONTEXT_ID};
pub use error::EngineError;
pub use host::{status, Host, MemWidth};
pub use insn::{Insn, InsnKind};
pub use mock::MockHost;
pub use operand::{Operand, OperandRole};
pub use policy::{Action, Policy, PolicyEntry, WIRE_BYTES};
