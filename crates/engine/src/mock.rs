//! A scripted in-memory host for tests and benches.
//!
//! Real deployments wire the engine into a simulator; everything here exists
//! so the engine's observable behavior (tag reads, tag writes, status-register
//! traffic) can be asserted on without one.

use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::host::{Host, MemWidth};
use crate::insn::Insn;

/// Minimal host: 32 registers with tag shadows, sparse memory tags, a status
/// register, and counters over the tag traffic the engine generates.
#[derive(Debug, Default)]
pub struct MockHost {
    pub regs: [u64; 32],
    pub reg_tags: [u8; 32],
    /// Sparse tag storage keyed by address; absent means tag 0.
    pub mem_tags: BTreeMap<u64, u8>,
    pub status: u64,
    /// Number of memory-tag loads the engine issued.
    pub tag_loads: u64,
    /// Number of memory-tag stores the engine issued.
    pub tag_stores: u64,
    /// Widths observed on memory-tag accesses, in order.
    pub widths_seen: Vec<MemWidth>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience: the tag at `addr`, 0 if never written.
    pub fn mem_tag(&self, addr: u64) -> u8 {
        self.mem_tags.get(&addr).copied().unwrap_or(0)
    }
}

impl Host for MockHost {
    fn read_reg(&self, idx: u8) -> u64 {
        if idx == 0 {
            0
        } else {
            self.regs[idx as usize]
        }
    }

    fn write_reg(&mut self, idx: u8, val: u64) {
        if idx != 0 {
            self.regs[idx as usize] = val;
        }
    }

    fn read_reg_tag(&self, idx: u8) -> u8 {
        if idx == 0 {
            0
        } else {
            self.reg_tags[idx as usize]
        }
    }

    fn write_reg_tag(&mut self, idx: u8, tag: u8) {
        if idx != 0 {
            self.reg_tags[idx as usize] = tag;
        }
    }

    fn load_mem_tag(&mut self, addr: u64, width: MemWidth) -> Result<u8, EngineError> {
        self.tag_loads += 1;
        self.widths_seen.push(width);
        Ok(self.mem_tag(addr))
    }

    fn store_mem_tag(&mut self, addr: u64, width: MemWidth, tag: u8) -> Result<(), EngineError> {
        self.tag_stores += 1;
        self.widths_seen.push(width);
        self.mem_tags.insert(addr, tag);
        Ok(())
    }

    fn status_reg(&self) -> u64 {
        self.status
    }

    fn set_status_reg(&mut self, val: u64) {
        self.status = val;
    }

    fn disassemble(&self, insn: Insn) -> String {
        format!("insn {:#010x}", insn.bits())
    }
}
