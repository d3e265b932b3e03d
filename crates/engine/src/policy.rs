//! Policy records and their packed wire format.
//!
//! A policy travels from the guest as three 64-bit operand words holding a
//! 24-byte packed record. Every field is byte-wide; a zero mask means the
//! corresponding predicate is "don't care". The value predicates
//! (`rs1val`/`rs2val`) therefore constrain only the low byte of the register
//! value.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::insn::InsnKind;

bitflags! {
    /// Effects a fired policy requests. Composes bitwise across policies;
    /// `BLOCK` and `ALLOW` terminate matching.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Action: u8 {
        const BLOCK = 0x01;
        const ALLOW = 0x02;
        const GETTAG = 0x04;
        const GC = 0x08;
        const DEBUG_LINE = 0x10;
        const DEBUG_DETAIL = 0x20;
    }
}

impl Default for Action {
    fn default() -> Self {
        Action::empty()
    }
}

/// Serialize [`Action`] as its raw bit pattern.
mod action_bits {
    use super::Action;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(action: &Action, ser: S) -> Result<S::Ok, S::Error> {
        action.bits().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Action, D::Error> {
        Ok(Action::from_bits_retain(u8::deserialize(de)?))
    }
}

/// Byte offsets of the packed record inside the three wire words.
///
/// This table is the single definition of the layout; both directions of the
/// codec index through it. Guests installing policies must agree on it.
mod wire {
    pub const INSN_TYPE: usize = 0;
    pub const RS1_MASK: usize = 1;
    pub const RS1_MATCH: usize = 2;
    pub const RS2_MASK: usize = 3;
    pub const RS2_MATCH: usize = 4;
    pub const PRIV_MASK: usize = 5;
    pub const PRIV_MATCH: usize = 6;
    pub const RS1VAL_MASK: usize = 7;
    pub const RS1VAL_MATCH: usize = 8;
    pub const RS2VAL_MASK: usize = 9;
    pub const RS2VAL_MATCH: usize = 10;
    pub const TAG_ARG1_MASK: usize = 11;
    pub const TAG_ARG1_MATCH: usize = 12;
    pub const TAG_ARG2_MASK: usize = 13;
    pub const TAG_ARG2_MATCH: usize = 14;
    pub const TAG_OUT_MASK: usize = 15;
    pub const TAG_OUT_MATCH: usize = 16;
    pub const TAG_OUT_TOMODIFY: usize = 17;
    pub const TAG_OUT_SET: usize = 18;
    pub const PRIV_TOMODIFY: usize = 19;
    pub const PRIV_SET: usize = 20;
    pub const IGNORE_COUNT: usize = 21;
    pub const ACTION: usize = 22;
    // Byte 23 is reserved and encoded as zero.

    pub const LEN: usize = 24;
}

/// Number of bytes in the packed record.
pub const WIRE_BYTES: usize = wire::LEN;

/// One enforcement rule.
///
/// Fields default to "don't care" (zero mask); construct with struct-update
/// syntax over [`Policy::default`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Operation kind this rule applies to. Must equal the classifier output.
    pub insn_type: InsnKind,
    pub rs1_mask: u8,
    pub rs1_match: u8,
    pub rs2_mask: u8,
    pub rs2_match: u8,
    pub priv_mask: u8,
    pub priv_match: u8,
    pub rs1val_mask: u8,
    pub rs1val_match: u8,
    pub rs2val_mask: u8,
    pub rs2val_match: u8,
    pub tag_arg1_mask: u8,
    pub tag_arg1_match: u8,
    pub tag_arg2_mask: u8,
    pub tag_arg2_match: u8,
    pub tag_out_mask: u8,
    pub tag_out_match: u8,
    /// Bits of the destination tag to clear when this rule fires.
    pub tag_out_tomodify: u8,
    /// Bits of the destination tag to set when this rule fires.
    pub tag_out_set: u8,
    /// Bits of the context's privilege byte to clear when this rule fires.
    pub priv_tomodify: u8,
    /// Bits of the context's privilege byte to set when this rule fires.
    pub priv_set: u8,
    /// Number of matches to swallow before the rule fires.
    pub ignore_count: u8,
    #[serde(with = "action_bits")]
    pub action: Action,
}

impl Policy {
    /// Pack into the 24-byte wire record.
    pub fn to_bytes(&self) -> [u8; WIRE_BYTES] {
        let mut b = [0u8; WIRE_BYTES];
        b[wire::INSN_TYPE] = self.insn_type.to_wire();
        b[wire::RS1_MASK] = self.rs1_mask;
        b[wire::RS1_MATCH] = self.rs1_match;
        b[wire::RS2_MASK] = self.rs2_mask;
        b[wire::RS2_MATCH] = self.rs2_match;
        b[wire::PRIV_MASK] = self.priv_mask;
        b[wire::PRIV_MATCH] = self.priv_match;
        b[wire::RS1VAL_MASK] = self.rs1val_mask;
        b[wire::RS1VAL_MATCH] = self.rs1val_match;
        b[wire::RS2VAL_MASK] = self.rs2val_mask;
        b[wire::RS2VAL_MATCH] = self.rs2val_match;
        b[wire::TAG_ARG1_MASK] = self.tag_arg1_mask;
        b[wire::TAG_ARG1_MATCH] = self.tag_arg1_match;
        b[wire::TAG_ARG2_MASK] = self.tag_arg2_mask;
        b[wire::TAG_ARG2_MATCH] = self.tag_arg2_match;
        b[wire::TAG_OUT_MASK] = self.tag_out_mask;
        b[wire::TAG_OUT_MATCH] = self.tag_out_match;
        b[wire::TAG_OUT_TOMODIFY] = self.tag_out_tomodify;
        b[wire::TAG_OUT_SET] = self.tag_out_set;
        b[wire::PRIV_TOMODIFY] = self.priv_tomodify;
        b[wire::PRIV_SET] = self.priv_set;
        b[wire::IGNORE_COUNT] = self.ignore_count;
        b[wire::ACTION] = self.action.bits();
        b
    }

    /// Unpack from the 24-byte wire record.
    pub fn from_bytes(b: &[u8; WIRE_BYTES]) -> Self {
        Self {
            insn_type: InsnKind::from_wire(b[wire::INSN_TYPE]),
            rs1_mask: b[wire::RS1_MASK],
            rs1_match: b[wire::RS1_MATCH],
            rs2_mask: b[wire::RS2_MASK],
            rs2_match: b[wire::RS2_MATCH],
            priv_mask: b[wire::PRIV_MASK],
            priv_match: b[wire::PRIV_MATCH],
            rs1val_mask: b[wire::RS1VAL_MASK],
            rs1val_match: b[wire::RS1VAL_MATCH],
            rs2val_mask: b[wire::RS2VAL_MASK],
            rs2val_match: b[wire::RS2VAL_MATCH],
            tag_arg1_mask: b[wire::TAG_ARG1_MASK],
            tag_arg1_match: b[wire::TAG_ARG1_MATCH],
            tag_arg2_mask: b[wire::TAG_ARG2_MASK],
            tag_arg2_match: b[wire::TAG_ARG2_MATCH],
            tag_out_mask: b[wire::TAG_OUT_MASK],
            tag_out_match: b[wire::TAG_OUT_MATCH],
            tag_out_tomodify: b[wire::TAG_OUT_TOMODIFY],
            tag_out_set: b[wire::TAG_OUT_SET],
            priv_tomodify: b[wire::PRIV_TOMODIFY],
            priv_set: b[wire::PRIV_SET],
            ignore_count: b[wire::IGNORE_COUNT],
            action: Action::from_bits_retain(b[wire::ACTION]),
        }
    }

    /// Pack into the three little-endian operand words of `add_policy`.
    pub fn to_words(&self) -> [u64; 3] {
        let b = self.to_bytes();
        [
            u64::from_le_bytes(b[0..8].try_into().unwrap()),
            u64::from_le_bytes(b[8..16].try_into().unwrap()),
            u64::from_le_bytes(b[16..24].try_into().unwrap()),
        ]
    }

    /// Unpack from the three operand words of `add_policy`.
    pub fn from_words(words: [u64; 3]) -> Self {
        let mut b = [0u8; WIRE_BYTES];
        b[0..8].copy_from_slice(&words[0].to_le_bytes());
        b[8..16].copy_from_slice(&words[1].to_le_bytes());
        b[16..24].copy_from_slice(&words[2].to_le_bytes());
        Self::from_bytes(&b)
    }
}

/// A policy installed in a context, with its running match count.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub policy: Policy,
    /// Matches seen so far, including swallowed ones. Monotone.
    pub match_count: u64,
}

impl PolicyEntry {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            match_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_policy() -> Policy {
        Policy {
            insn_type: InsnKind::Store,
            rs1_mask: 0x1F,
            rs1_match: 0x06,
            rs2_mask: 0x1F,
            rs2_match: 0x07,
            priv_mask: 0x03,
            priv_match: 0x01,
            rs1val_mask: 0xF0,
            rs1val_match: 0x40,
            rs2val_mask: 0x0F,
            rs2val_match: 0x05,
            tag_arg1_mask: 0x01,
            tag_arg1_match: 0x01,
            tag_arg2_mask: 0x02,
            tag_arg2_match: 0x00,
            tag_out_mask: 0xFF,
            tag_out_match: 0x00,
            tag_out_tomodify: 0xFF,
            tag_out_set: 0x02,
            priv_tomodify: 0x01,
            priv_set: 0x01,
            ignore_count: 3,
            action: Action::BLOCK | Action::DEBUG_LINE,
        }
    }

    #[test]
    fn words_round_trip_bit_exact() {
        let policy = dense_policy();
        let words = policy.to_words();
        assert_eq!(Policy::from_words(words), policy);
        // And the re-encoding is word-for-word identical.
        assert_eq!(Policy::from_words(words).to_words(), words);
    }

    #[test]
    fn default_is_all_dont_care() {
        let policy = Policy::default();
        assert_eq!(policy.insn_type, InsnKind::Unknown);
        assert_eq!(policy.to_words(), [0, 0, 0]);
        assert!(policy.action.is_empty());
    }

    #[test]
    fn field_offsets_are_stable() {
        // insn_type is the low byte of word a, action byte 6 of word c.
        let policy = Policy {
            insn_type: InsnKind::Copy,
            action: Action::GC,
            ..Policy::default()
        };
        let [a, b, c] = policy.to_words();
        assert_eq!(a & 0xFF, InsnKind::Copy.to_wire() as u64);
        assert_eq!(b, 0);
        assert_eq!((c >> 48) & 0xFF, Action::GC.bits() as u64);
    }

    #[test]
    fn unknown_action_bits_survive_decode() {
        let mut b = [0u8; WIRE_BYTES];
        b[22] = 0xC1; // BLOCK plus two undefined bits
        let policy = Policy::from_bytes(&b);
        assert!(policy.action.contains(Action::BLOCK));
        assert_eq!(policy.to_bytes()[22], 0xC1);
    }

    #[test]
    fn serde_json_round_trip() {
        let policy = dense_policy();
        let json = serde_json::to_string(&policy).unwrap();
        let back: Policy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
