//! Shared setup for the integration tests.
#![allow(dead_code)]

use rvtap_engine::{status, EngineError, Host, Insn, MockHost, TagEngine};

/// Engine plus host with one freshly allocated, enforcing context.
pub fn enforced() -> (TagEngine, MockHost) {
    let mut engine = TagEngine::new();
    let mut host = MockHost::new();
    engine.run_tag_command(&mut host, 0);
    assert_ne!(status::context_id(host.status_reg()), 0);
    (engine, host)
}

/// Functional step that just advances the pc.
pub fn step_nop(_host: &mut MockHost, _insn: Insn, pc: u64) -> Result<u64, EngineError> {
    Ok(pc + 4)
}

/// Functional step that writes a register, then advances the pc.
pub fn step_write_reg(
    rd: u8,
    val: u64,
) -> impl FnOnce(&mut MockHost, Insn, u64) -> Result<u64, EngineError> {
    move |host, _insn, pc| {
        host.write_reg(rd, val);
        Ok(pc + 4)
    }
}
