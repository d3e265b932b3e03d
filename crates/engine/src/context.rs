//! Per-context enforcement state.
//!
//! A context is a bag of policies plus mutable control state, selected by the
//! 7-bit id field in the privileged status register. Context 0 always exists
//! and never enforces; it doubles as the prototype that unseen ids are cloned
//! from.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::policy::PolicyEntry;

/// Ids are 7 bits wide, so the store never holds more than 128 states.
pub const MAX_CONTEXTS: usize = 1 << 7;

/// Mutable state of one enforcement context.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContextState {
    /// Whether policies of this context are evaluated at all.
    pub enabled: bool,
    /// Privilege byte matched and mutated by policies.
    pub priv_bits: u8,
    /// Lowest stack-pointer value observed while this context was active.
    /// Zero means "not yet observed". Monotone non-increasing except when a
    /// GC scrub resets it to the current stack pointer.
    pub lowest_sp_addr: u64,
    /// Installed policies, in insertion order. Append-only.
    pub policies: Vec<PolicyEntry>,
}

/// Growable array of contexts indexed by id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextStore {
    states: Vec<ContextState>,
}

impl ContextStore {
    /// Create a store holding only the default context.
    pub fn new() -> Self {
        Self {
            states: vec![ContextState::default()],
        }
    }

    /// Number of contexts materialized so far.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        false // context 0 always exists
    }

    /// Access a context, materializing it (and every id below it) from the
    /// default context if it has not been seen before.
    pub fn ensure(&mut self, id: usize) -> &mut ContextState {
        while id >= self.states.len() {
            let prototype = self.states[0].clone();
            self.states.push(prototype);
        }
        &mut self.states[id]
    }

    /// Read-only view of a materialized context.
    pub fn get(&self, id: usize) -> Option<&ContextState> {
        self.states.get(id)
    }

    /// Reserve the next free id for allocation into the status register.
    ///
    /// Returns 0 (the non-enforcing default) when the 7-bit id space is
    /// exhausted. The caller is responsible for writing the id back into the
    /// status register and for materializing it via [`ensure`].
    ///
    /// [`ensure`]: ContextStore::ensure
    pub fn next_id(&self) -> usize {
        let id = self.states.len();
        if id >= MAX_CONTEXTS {
            warn!("context table full, falling back to context 0");
            return 0;
        }
        id
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}
