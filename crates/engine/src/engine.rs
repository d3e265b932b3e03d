//! The tag engine: policy matching, action dispatch, and tag propagation.
//!
//! `execute_insn` is invoked by the host in place of its normal retire step.
//! Per instruction it classifies the operation, evaluates the current
//! context's policy list in insertion order, performs the requested actions,
//! writes the updated destination tag, runs the host's functional step, and
//! finally tracks the stack-pointer watermark.
//!
//! Ordering matters: every tag write and privilege update happens before the
//! functional step, so a host trap inside the step never observes half of an
//! engine mutation. The one intentional exception is `BLOCK`, which traps
//! before the step so the instruction does not retire.

use tracing::{debug, info, warn};

use crate::context::{ContextState, ContextStore};
use crate::counters::Counters;
use crate::error::EngineError;
use crate::host::{status, Host, MemWidth};
use crate::insn::{reg, Insn, InsnKind};
use crate::operand::{resolve, width_for, Operand, OperandRole};
use crate::policy::{Action, Policy, PolicyEntry};

/// Context id pinned while benchmark mode is active, so counter runs are
/// isolated from whatever the status register holds.
pub const BENCH_CONTEXT_ID: usize = 42;

/// The policy matching and tag propagation engine.
///
/// Single-threaded by construction: the host invokes it serially, once per
/// retired instruction.
#[derive(Debug, Default)]
pub struct TagEngine {
    contexts: ContextStore,
    counters: Counters,
    benchmark_mode: bool,
}

impl TagEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter state collected since the last `start_benchmark`.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Inspect a context, if it has been materialized.
    pub fn context(&self, id: usize) -> Option<&ContextState> {
        self.contexts.get(id)
    }

    pub fn benchmark_mode(&self) -> bool {
        self.benchmark_mode
    }

    /// Resolve the current context id from the status register.
    ///
    /// With `add_if_needed`, a zero id allocates the next free id and writes
    /// it back into the status register; exhaustion of the 7-bit id space
    /// falls back to the non-enforcing context 0.
    fn context_id<H: Host>(&mut self, host: &mut H, add_if_needed: bool) -> usize {
        let mut id = if self.benchmark_mode {
            BENCH_CONTEXT_ID
        } else {
            status::context_id(host.status_reg()) as usize
        };
        if add_if_needed && id == 0 {
            id = self.contexts.next_id();
            if id == 0 {
                return 0;
            }
            let sr = host.status_reg();
            host.set_status_reg(status::with_context_id(sr, id as u8));
        }
        self.contexts.ensure(id);
        id
    }

    /// Read the tag of an operand role, resolving it first. Register index 0
    /// reads tag 0.
    fn read_role_tag<H: Host>(
        &mut self,
        host: &mut H,
        insn: Insn,
        kind: InsnKind,
        role: OperandRole,
        pc: u64,
    ) -> Result<u8, EngineError> {
        match resolve(host, insn, kind, role, pc)? {
            Operand::Reg(reg::ZERO) => Ok(0),
            Operand::Reg(idx) => Ok(host.read_reg_tag(idx)),
            Operand::Mem(addr) => {
                let width = width_for(kind, insn, pc)?;
                host.load_mem_tag(addr, width)
            }
        }
    }

    /// Write the tag of an operand role. Register index 0 swallows the write.
    fn write_role_tag<H: Host>(
        &mut self,
        host: &mut H,
        insn: Insn,
        kind: InsnKind,
        role: OperandRole,
        pc: u64,
        tag: u8,
    ) -> Result<(), EngineError> {
        match resolve(host, insn, kind, role, pc)? {
            Operand::Reg(reg::ZERO) => Ok(()),
            Operand::Reg(idx) => {
                host.write_reg_tag(idx, tag);
                Ok(())
            }
            Operand::Mem(addr) => {
                let width = width_for(kind, insn, pc)?;
                host.store_mem_tag(addr, width, tag)
            }
        }
    }

    /// Evaluate the current context's policies against one instruction.
    ///
    /// Returns the accumulated action and the exit rule index: the index of
    /// the policy that terminated matching, or the list length if every
    /// policy was evaluated, or `None` when matching was skipped entirely
    /// (context 0, enforcement off, supervisor mode).
    ///
    /// Operand tags are loaded lazily, at most once per role, the first time
    /// a policy references them; the destination tag is written back at most
    /// once, at the end, and only if some fired policy changed it.
    fn determine_action<H: Host>(
        &mut self,
        host: &mut H,
        insn: Insn,
        pc: u64,
    ) -> Result<(Action, Option<usize>), EngineError> {
        let context_id = self.context_id(host, false);
        let supervisor = host.status_reg() & status::SUPERVISOR != 0;
        if context_id == 0 || !self.contexts.ensure(context_id).enabled || supervisor {
            return Ok((Action::empty(), None));
        }

        let kind = InsnKind::of(insn);
        let mut action = Action::empty();
        let (mut tag_arg1, mut tag_arg2, mut tag_out) = (0u8, 0u8, 0u8);
        let mut tag_out_updated = 0u8;
        let (mut loaded_arg1, mut loaded_arg2, mut loaded_out) = (false, false, false);
        let mut has_match = false;

        let policy_count = self.contexts.ensure(context_id).policies.len();
        let mut exit_rule = policy_count;

        for i in 0..policy_count {
            let policy = self.contexts.ensure(context_id).policies[i].policy;

            let mut matched = kind == policy.insn_type;
            if matched && policy.rs1_mask != 0 {
                matched = insn.rs1() & policy.rs1_mask == policy.rs1_match;
            }
            if matched && policy.rs2_mask != 0 {
                matched = insn.rs2() & policy.rs2_mask == policy.rs2_match;
            }
            if matched && policy.priv_mask != 0 {
                let priv_bits = self.contexts.ensure(context_id).priv_bits;
                matched = priv_bits & policy.priv_mask == policy.priv_match;
            }
            if matched && policy.rs1val_mask != 0 {
                let val = host.read_reg(insn.rs1()) as u8;
                matched = val & policy.rs1val_mask == policy.rs1val_match;
            }
            if matched && policy.rs2val_mask != 0 {
                let val = host.read_reg(insn.rs2()) as u8;
                matched = val & policy.rs2val_mask == policy.rs2val_match;
            }
            if matched && policy.tag_arg1_mask != 0 {
                if !loaded_arg1 {
                    loaded_arg1 = true;
                    tag_arg1 = self.read_role_tag(host, insn, kind, OperandRole::Arg1, pc)?;
                    if self.benchmark_mode {
                        self.counters.tag_read += 1;
                    }
                }
                matched = tag_arg1 & policy.tag_arg1_mask == policy.tag_arg1_match;
            }
            if matched && policy.tag_arg2_mask != 0 {
                if !loaded_arg2 {
                    loaded_arg2 = true;
                    tag_arg2 = self.read_role_tag(host, insn, kind, OperandRole::Arg2, pc)?;
                    if self.benchmark_mode {
                        self.counters.tag_read += 1;
                    }
                }
                matched = tag_arg2 & policy.tag_arg2_mask == policy.tag_arg2_match;
            }
            if matched && (policy.tag_out_mask != 0 || policy.tag_out_tomodify != 0) {
                if !loaded_out {
                    loaded_out = true;
                    tag_out = self.read_role_tag(host, insn, kind, OperandRole::Out, pc)?;
                    tag_out_updated = tag_out;
                    if self.benchmark_mode {
                        self.counters.tag_read += 1;
                    }
                }
                matched = tag_out & policy.tag_out_mask == policy.tag_out_match;
            }

            if !matched {
                continue;
            }

            has_match = true;
            let entry = &mut self.contexts.ensure(context_id).policies[i];
            entry.match_count += 1;
            if entry.match_count <= policy.ignore_count as u64 {
                continue;
            }

            tag_out_updated = (tag_out_updated & !policy.tag_out_tomodify) | policy.tag_out_set;
            if policy.priv_tomodify != 0 {
                let ctx = self.contexts.ensure(context_id);
                ctx.priv_bits = (ctx.priv_bits & !policy.priv_tomodify) | policy.priv_set;
                debug!(context_id, priv_bits = ctx.priv_bits, "privilege bits updated");
            }

            action |= policy.action;
            if policy.action == Action::BLOCK || policy.action == Action::ALLOW {
                exit_rule = i;
                break;
            }
        }

        let wrote = loaded_out && tag_out != tag_out_updated;
        if wrote {
            self.write_role_tag(host, insn, kind, OperandRole::Out, pc, tag_out_updated)?;
        }

        if self.benchmark_mode {
            self.counters
                .record_traffic(loaded_arg1, loaded_arg2, loaded_out, wrote, has_match);
        }

        Ok((action, Some(exit_rule)))
    }

    /// Drive one instruction through matching, actions, the host's
    /// functional step, and stack-pointer tracking.
    ///
    /// `func` is the host's functional step for this fetch; it runs exactly
    /// once unless a BLOCK policy fired, in which case the instruction does
    /// not retire and the tag-violation trap propagates.
    pub fn execute_insn<H, F>(
        &mut self,
        host: &mut H,
        pc: u64,
        insn: Insn,
        func: F,
    ) -> Result<u64, EngineError>
    where
        H: Host,
        F: FnOnce(&mut H, Insn, u64) -> Result<u64, EngineError>,
    {
        let kind = InsnKind::of(insn);

        // GETTAG reports the destination tag as it was before any policy of
        // this instruction fired, so snapshot it ahead of matching.
        let mut before_tag = 0u8;
        if kind == InsnKind::TagCmd && insn.rd() != reg::ZERO {
            before_tag = if insn.rs2() == reg::ZERO {
                0
            } else {
                host.read_reg_tag(insn.rs2())
            };
        }

        let (action, exit_rule) = self.determine_action(host, insn, pc)?;

        if !self.benchmark_mode {
            if action.contains(Action::DEBUG_LINE) {
                info!(
                    pc = format_args!("{pc:#x}"),
                    insn = %host.disassemble(insn),
                    "DEBUG"
                );
            }
            if action.contains(Action::DEBUG_DETAIL) {
                let context_id = self.context_id(host, true);
                info!(
                    pc = format_args!("{pc:#x}"),
                    insn = %host.disassemble(insn),
                    ?exit_rule,
                    context_id,
                    operands = %describe_operands(host, insn),
                    policies = %self.dump_policies(context_id),
                    "policy debug detail"
                );
            }
            if action.contains(Action::BLOCK) {
                let context_id = self.context_id(host, true);
                warn!(
                    pc = format_args!("{pc:#x}"),
                    insn = %host.disassemble(insn),
                    context_id,
                    policies = %self.dump_policies(context_id),
                    "instruction blocked by policy"
                );
                return Err(EngineError::TagViolation { pc });
            }
        }

        if action.contains(Action::GC) {
            let context_id = self.context_id(host, false);
            let cur_sp = host.read_reg(reg::SP);
            let lowest = self.contexts.ensure(context_id).lowest_sp_addr;
            // First word of each end is left alone: scrub [lowest-8, sp-8).
            let clean_from = lowest.wrapping_sub(8);
            let clean_to = cur_sp.wrapping_sub(8);
            let mut addr = clean_from;
            while addr < clean_to {
                host.store_mem_tag(addr, MemWidth::Double, 0)?;
                addr += 8;
            }
            debug!(
                context_id,
                clean_from = format_args!("{clean_from:#x}"),
                clean_to = format_args!("{clean_to:#x}"),
                "stack tags scrubbed"
            );
            self.contexts.ensure(context_id).lowest_sp_addr = cur_sp;
        }

        // Every TAGCMD with a destination writes it: the pre-match tag if
        // GETTAG fired, the plain RS2 value otherwise.
        if kind == InsnKind::TagCmd && insn.rd() != reg::ZERO {
            if action.contains(Action::GETTAG) {
                debug!(
                    pc = format_args!("{pc:#x}"),
                    rs2 = insn.rs2(),
                    tag = before_tag,
                    "GETTAG"
                );
                host.write_reg(insn.rd(), before_tag as u64);
            } else {
                let val = host.read_reg(insn.rs2());
                host.write_reg(insn.rd(), val);
            }
        }

        let res = func(host, insn, pc)?;

        // Track the lowest stack pointer this context has seen, for GC.
        if insn.rd() == reg::SP && host.status_reg() & status::SUPERVISOR == 0 {
            let context_id = self.context_id(host, false);
            if context_id != 0 {
                let cur_sp = host.read_reg(reg::SP);
                let ctx = self.contexts.ensure(context_id);
                if cur_sp < ctx.lowest_sp_addr || ctx.lowest_sp_addr == 0 {
                    ctx.lowest_sp_addr = cur_sp;
                    debug!(
                        context_id,
                        cur_sp = format_args!("{cur_sp:#x}"),
                        "new lowest stack pointer"
                    );
                }
            }
        }

        Ok(res)
    }

    /// Append a policy, decoded from the three wire words, to the current
    /// context (allocating one if the status field is zero).
    pub fn add_policy<H: Host>(&mut self, host: &mut H, a: u64, b: u64, c: u64) {
        let context_id = self.context_id(host, true);
        let policy = Policy::from_words([a, b, c]);
        debug!(context_id, ?policy, "policy installed");
        self.contexts
            .ensure(context_id)
            .policies
            .push(PolicyEntry::new(policy));
    }

    /// Install an in-memory policy through the same wire path as
    /// [`add_policy`](TagEngine::add_policy).
    pub fn install_policy<H: Host>(&mut self, host: &mut H, policy: &Policy) {
        let [a, b, c] = policy.to_words();
        self.add_policy(host, a, b, c);
    }

    /// Run a tag command. Command 0 enables enforcement on the current
    /// context; other values are reserved.
    pub fn run_tag_command<H: Host>(&mut self, host: &mut H, cmd: u64) {
        let context_id = self.context_id(host, true);
        if cmd == 0 {
            self.contexts.ensure(context_id).enabled = true;
            info!(context_id, "tag enforcement enabled");
        } else {
            info!(cmd, context_id, "unhandled tag command");
        }
        debug!(policies = %self.dump_policies(context_id), "policy table");
    }

    /// Enter benchmark mode: counters reset, user-visible side effects
    /// suppressed, context pinned to [`BENCH_CONTEXT_ID`]. Idempotent.
    pub fn start_benchmark(&mut self) {
        if self.benchmark_mode {
            return;
        }
        info!("benchmark started");
        self.counters.reset();
        self.benchmark_mode = true;
    }

    /// Leave benchmark mode and emit the counter CSV line. Returns `None` if
    /// benchmark mode was not active.
    pub fn stop_benchmark(&mut self) -> Option<String> {
        if !self.benchmark_mode {
            return None;
        }
        self.benchmark_mode = false;
        debug!(policies = %self.dump_policies(BENCH_CONTEXT_ID), "benchmark policy table");
        let line = self.counters.csv_line();
        info!("{line}");
        Some(line)
    }

    /// Render a context's policy table, one row per entry.
    pub fn dump_policies(&self, context_id: usize) -> String {
        use std::fmt::Write as _;

        let empty = Vec::new();
        let entries = self
            .contexts
            .get(context_id)
            .map(|ctx| &ctx.policies)
            .unwrap_or(&empty);
        let mut out = String::new();
        let _ = writeln!(out, "Policy Count: {}\n------", entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let p = &entry.policy;
            let _ = writeln!(
                out,
                "{:3} |{:5} |{:3}{:4} |{:4}",
                i,
                p.insn_type.to_wire(),
                p.rs1val_match,
                p.action.bits(),
                entry.match_count
            );
        }
        out.push_str("------");
        out
    }
}

/// One-line operand summary for the DEBUG_DETAIL trace.
fn describe_operands<H: Host>(host: &H, insn: Insn) -> String {
    let rs1_val = host.read_reg(insn.rs1());
    let rs2_val = host.read_reg(insn.rs2());
    format!(
        "RS1: {:2}, RS2: {:2}, IMM: {:8}, RS1VAL: {:8} ({:#10x}), RS2VAL: {:8} ({:#10x})",
        insn.rs1(),
        insn.rs2(),
        insn.i_imm(),
        rs1_val,
        rs1_val,
        rs2_val,
        rs2_val
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::{assemble_add, assemble_tagcmd};
    use crate::mock::MockHost;

    fn step_nop(_host: &mut MockHost, _insn: Insn, pc: u64) -> Result<u64, EngineError> {
        Ok(pc + 4)
    }

    #[test]
    fn add_policy_allocates_context_id() {
        let mut engine = TagEngine::new();
        let mut host = MockHost::new();
        assert_eq!(status::context_id(host.status_reg()), 0);

        engine.add_policy(&mut host, 0, 0, 0);
        // Fresh id 1 written back into the status register.
        assert_eq!(status::context_id(host.status_reg()), 1);
        assert_eq!(engine.context(1).unwrap().policies.len(), 1);
        // Context 0 stays empty.
        assert!(engine.context(0).unwrap().policies.is_empty());
    }

    #[test]
    fn tag_command_zero_enables_enforcement() {
        let mut engine = TagEngine::new();
        let mut host = MockHost::new();
        engine.run_tag_command(&mut host, 0);
        let id = status::context_id(host.status_reg()) as usize;
        assert_ne!(id, 0);
        assert!(engine.context(id).unwrap().enabled);
    }

    #[test]
    fn unknown_tag_command_changes_nothing() {
        let mut engine = TagEngine::new();
        let mut host = MockHost::new();
        engine.run_tag_command(&mut host, 7);
        let id = status::context_id(host.status_reg()) as usize;
        assert!(!engine.context(id).unwrap().enabled);
    }

    #[test]
    fn disabled_context_is_transparent() {
        let mut engine = TagEngine::new();
        let mut host = MockHost::new();
        host.status = status::with_context_id(0, 3);
        host.reg_tags[6] = 0xAA;

        let insn = assemble_add(5, 6, 7);
        let next = engine.execute_insn(&mut host, 0x100, insn, step_nop).unwrap();
        assert_eq!(next, 0x104);
        assert_eq!(host.tag_loads, 0);
        assert_eq!(host.tag_stores, 0);
    }

    #[test]
    fn supervisor_mode_is_transparent() {
        let mut engine = TagEngine::new();
        let mut host = MockHost::new();
        engine.run_tag_command(&mut host, 0);
        // Enabled context, but the hart is in supervisor mode.
        host.status |= status::SUPERVISOR;
        engine.install_policy(
            &mut host,
            &Policy {
                insn_type: InsnKind::Op,
                action: Action::BLOCK,
                ..Policy::default()
            },
        );

        let insn = assemble_add(5, 6, 7);
        assert!(engine
            .execute_insn(&mut host, 0x100, insn, step_nop)
            .is_ok());
    }

    #[test]
    fn context_zero_never_enforces() {
        let mut engine = TagEngine::new();
        let mut host = MockHost::new();
        // Hostile external state: context 0 flagged enabled and holding a
        // BLOCK-everything policy. Id 0 still short-circuits matching.
        let ctx = engine.contexts.ensure(0);
        ctx.enabled = true;
        ctx.policies.push(PolicyEntry::new(Policy {
            insn_type: InsnKind::Op,
            action: Action::BLOCK,
            ..Policy::default()
        }));

        let insn = assemble_add(5, 6, 7);
        assert!(engine
            .execute_insn(&mut host, 0x100, insn, step_nop)
            .is_ok());
        assert_eq!(engine.context(0).unwrap().policies[0].match_count, 0);
    }

    #[test]
    fn tagcmd_destination_gets_rs2_value_without_gettag() {
        let mut engine = TagEngine::new();
        let mut host = MockHost::new();
        host.regs[9] = 0xDEAD;
        let insn = assemble_tagcmd(8, 0, 9);
        engine.execute_insn(&mut host, 0, insn, step_nop).unwrap();
        assert_eq!(host.regs[8], 0xDEAD);
    }

    #[test]
    fn stop_benchmark_without_start_is_none() {
        let mut engine = TagEngine::new();
        assert!(engine.stop_benchmark().is_none());
        engine.start_benchmark();
        assert!(engine.benchmark_mode());
        let line = engine.stop_benchmark().unwrap();
        assert!(line.starts_with("RESULT,"));
        assert!(engine.stop_benchmark().is_none());
    }

    #[test]
    fn dump_policies_lists_entries() {
        let mut engine = TagEngine::new();
        let mut host = MockHost::new();
        engine.install_policy(
            &mut host,
            &Policy {
                insn_type: InsnKind::Store,
                action: Action::BLOCK,
                ..Policy::default()
            },
        );
        let id = status::context_id(host.status_reg()) as usize;
        let dump = engine.dump_policies(id);
        assert!(dump.starts_with("Policy Count: 1"));
        assert!(dump.contains("------"));
    }
}
