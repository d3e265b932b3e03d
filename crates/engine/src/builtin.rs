//! Canned policies for common tag disciplines.
//!
//! The engine itself is policy-neutral; the disciplines a deployment wants
//! (return-address integrity, stack scrubbing) are expressed as ordinary
//! policies installed at startup through the normal wire path.
//!
//! Policies can only write the destination tag of an instruction, so the
//! return-address discipline tracks the link tag through destinations: the
//! stack slot a link register is spilled to keeps the tag, a clobbering
//! store scrubs it, and a reload marks the receiving register as having
//! round-tripped through memory.

use crate::insn::InsnKind;
use crate::policy::{Action, Policy};

/// Tag marking a live link address produced by JAL.
pub const TAG_RET_FROM_JAL: u8 = 1;

/// Tag marking a link address that has round-tripped through memory.
pub const TAG_RET_FROM_MEM: u8 = 2;

/// Both return-address tag bits.
pub const TAG_RET_BITS: u8 = TAG_RET_FROM_JAL | TAG_RET_FROM_MEM;

/// Tag link-register writes of direct calls with [`TAG_RET_FROM_JAL`].
pub fn tag_jal_link() -> Policy {
    Policy {
        insn_type: InsnKind::Jal,
        tag_out_tomodify: 0xFF,
        tag_out_set: TAG_RET_FROM_JAL,
        ..Policy::default()
    }
}

/// Propagate a tag across register moves (`mv` / ADDI-zero).
pub fn propagate_on_copy(tag: u8) -> Policy {
    Policy {
        insn_type: InsnKind::Copy,
        tag_arg1_mask: 0xFF,
        tag_arg1_match: tag,
        tag_out_tomodify: 0xFF,
        tag_out_set: tag,
        ..Policy::default()
    }
}

/// When a link-tagged register is spilled, keep the link tag on the stack
/// slot.
pub fn tag_spilled_link() -> Policy {
    Policy {
        insn_type: InsnKind::Store64,
        tag_arg1_mask: TAG_RET_FROM_JAL,
        tag_arg1_match: TAG_RET_FROM_JAL,
        tag_out_tomodify: 0xFF,
        tag_out_set: TAG_RET_FROM_JAL,
        ..Policy::default()
    }
}

/// A store of an untagged value over a slot scrubs the slot's return bits;
/// an overwritten spill no longer passes as a return address.
pub fn untag_clobbered_slot() -> Policy {
    Policy {
        insn_type: InsnKind::Store64,
        tag_arg1_mask: TAG_RET_BITS,
        tag_arg1_match: 0,
        tag_out_tomodify: TAG_RET_BITS,
        tag_out_set: 0,
        ..Policy::default()
    }
}

/// Reloading a link-tagged slot marks the receiving register with
/// [`TAG_RET_FROM_MEM`].
pub fn tag_reloaded_link() -> Policy {
    Policy {
        insn_type: InsnKind::Load64,
        tag_arg1_mask: TAG_RET_FROM_JAL,
        tag_arg1_match: TAG_RET_FROM_JAL,
        tag_out_tomodify: 0xFF,
        tag_out_set: TAG_RET_FROM_MEM,
        ..Policy::default()
    }
}

/// Block stores whose source register carries `tag`.
pub fn block_tagged_store(tag: u8) -> Policy {
    Policy {
        insn_type: InsnKind::Store,
        tag_arg1_mask: tag,
        tag_arg1_match: tag,
        action: Action::BLOCK,
        ..Policy::default()
    }
}

/// Block returns through an address whose register tag says it was reloaded
/// from memory.
pub fn block_memory_return() -> Policy {
    Policy {
        insn_type: InsnKind::Return,
        tag_arg1_mask: TAG_RET_FROM_MEM,
        tag_arg1_match: TAG_RET_FROM_MEM,
        action: Action::BLOCK,
        ..Policy::default()
    }
}

/// Scrub stale stack tags on every function return.
pub fn gc_on_return() -> Policy {
    Policy {
        insn_type: InsnKind::Return,
        action: Action::GC,
        ..Policy::default()
    }
}

/// Answer GETTAG for tag commands.
pub fn gettag_on_tagcmd() -> Policy {
    Policy {
        insn_type: InsnKind::TagCmd,
        action: Action::GETTAG,
        ..Policy::default()
    }
}

/// The return-address-integrity discipline, in evaluation order: tag link
/// addresses at the JAL, follow them through copies, spills, clobbers, and
/// reloads, scrub the stack on return, and block any return through an
/// address that round-tripped through memory.
pub fn return_integrity_set() -> Vec<Policy> {
    vec![
        tag_jal_link(),
        propagate_on_copy(TAG_RET_FROM_JAL),
        tag_spilled_link(),
        untag_clobbered_slot(),
        tag_reloaded_link(),
        gc_on_return(),
        block_memory_return(),
    ]
}
