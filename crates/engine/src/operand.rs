//! Operand resolution: which register or memory location a policy predicate
//! refers to, per (operation kind, role).
//!
//! Resolution is invoked lazily, only when a policy actually references the
//! role's tag; asking for a role the instruction does not have is a
//! tag-violation trap at that moment, not before.

use tracing::warn;

use crate::error::EngineError;
use crate::host::{Host, MemWidth};
use crate::insn::{Insn, InsnKind};

/// The three operand slots a policy can constrain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandRole {
    Arg1,
    Arg2,
    Out,
}

/// A resolved operand location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    /// Register index. Index 0 reads tag 0 and swallows writes.
    Reg(u8),
    /// Memory address; the access width comes from the instruction.
    Mem(u64),
}

/// Resolve `(kind, role)` to a location.
///
/// Memory addresses use the I-immediate for loads, the S-immediate for
/// stores, and the cleared-bit-0 I-immediate form for indirect jumps. JAL has
/// no taggable target: branch targets are not tagged, so its `Arg1` is a trap
/// just like the roles that do not exist at all.
pub fn resolve<H: Host>(
    host: &H,
    insn: Insn,
    kind: InsnKind,
    role: OperandRole,
    pc: u64,
) -> Result<Operand, EngineError> {
    use InsnKind::*;
    use OperandRole::*;

    let operand = match kind {
        // arg1 = MEM, arg2 = n/a, out = REG
        Load | Load64 => match role {
            Arg1 => {
                let base = host.read_reg(insn.rs1());
                Some(Operand::Mem(base.wrapping_add(insn.i_imm() as u64)))
            }
            Arg2 => None,
            Out => Some(Operand::Reg(insn.rd())),
        },
        // arg1 = REG, arg2 = n/a, out = MEM
        Store | Store64 => match role {
            Arg1 => Some(Operand::Reg(insn.rs2())),
            Arg2 => None,
            Out => {
                let base = host.read_reg(insn.rs1());
                Some(Operand::Mem(base.wrapping_add(insn.s_imm() as u64)))
            }
        },
        // arg1 = RS1, arg2 = RS2, out = RD
        Op | TagCmd => match role {
            Arg1 => Some(Operand::Reg(insn.rs1())),
            Arg2 => Some(Operand::Reg(insn.rs2())),
            Out => Some(Operand::Reg(insn.rd())),
        },
        // arg1 = RS1, arg2 = n/a, out = RD
        OpImm | Copy => match role {
            Arg1 => Some(Operand::Reg(insn.rs1())),
            Arg2 => None,
            Out => Some(Operand::Reg(insn.rd())),
        },
        // arg1 = (untagged branch target), arg2 = n/a, out = RD
        Jal => match role {
            Arg1 | Arg2 => None,
            Out => Some(Operand::Reg(insn.rd())),
        },
        // arg1 = RS1, arg2 = jump target in memory, out = RD
        Jalr | Return => match role {
            Arg1 => Some(Operand::Reg(insn.rs1())),
            Arg2 => {
                let base = host.read_reg(insn.rs1());
                Some(Operand::Mem(base.wrapping_add(insn.i_imm() as u64) & !1))
            }
            Out => Some(Operand::Reg(insn.rd())),
        },
        Unknown | TagPolicy => None,
    };

    operand.ok_or_else(|| {
        warn!(
            pc,
            bits = insn.bits(),
            ?kind,
            ?role,
            "policy referenced an operand the instruction does not have"
        );
        EngineError::TagViolation { pc }
    })
}

/// Tag access width for a load's width sub-code (funct3 0..=6, signed and
/// unsigned variants). Anything else traps.
pub fn load_width(funct3: u8, pc: u64) -> Result<MemWidth, EngineError> {
    match funct3 {
        0 | 4 => Ok(MemWidth::Byte),
        1 | 5 => Ok(MemWidth::Half),
        2 | 6 => Ok(MemWidth::Word),
        3 => Ok(MemWidth::Double),
        _ => {
            warn!(pc, funct3, "unrecognized load width for tag access");
            Err(EngineError::TagViolation { pc })
        }
    }
}

/// Tag access width for a store's width sub-code (funct3 0..=3).
pub fn store_width(funct3: u8, pc: u64) -> Result<MemWidth, EngineError> {
    match funct3 {
        0 => Ok(MemWidth::Byte),
        1 => Ok(MemWidth::Half),
        2 => Ok(MemWidth::Word),
        3 => Ok(MemWidth::Double),
        _ => {
            warn!(pc, funct3, "unrecognized store width for tag access");
            Err(EngineError::TagViolation { pc })
        }
    }
}

/// Width table for a memory operand of `(kind, insn)`. Stores use the store
/// table; everything else (loads, and the jump-target probe of JALR/RETURN,
/// whose width sub-code is zero) uses the load table.
pub fn width_for(kind: InsnKind, insn: Insn, pc: u64) -> Result<MemWidth, EngineError> {
    match kind {
        InsnKind::Store | InsnKind::Store64 => store_width(insn.funct3(), pc),
        _ => load_width(insn.funct3(), pc),
    }
}
