//! Benchmark counters.
//!
//! When benchmark mode is on, the engine tallies instruction and tag-traffic
//! counts so competing policy designs can be compared under identical
//! workloads. The `needs` histogram classifies each instruction by which
//! operand tags the matcher actually touched.

use serde::{Deserialize, Serialize};

/// Counter record emitted as one CSV line on `stop_benchmark`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Instructions that reached the matcher.
    pub insns: u64,
    /// Instructions on which at least one policy matched (fired or swallowed).
    pub match_insns: u64,
    /// Operand tag reads issued.
    pub tag_read: u64,
    /// Destination tag writebacks issued.
    pub tag_write: u64,
    /// Histogram over `(loaded_arg1, loaded_arg2, loaded_out, wrote)`.
    pub needs: [u64; 16],
}

impl Counters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record the per-instruction tag-traffic summary.
    pub fn record_traffic(
        &mut self,
        loaded_arg1: bool,
        loaded_arg2: bool,
        loaded_out: bool,
        wrote: bool,
        matched: bool,
    ) {
        let bits = ((loaded_arg1 as usize) << 3)
            | ((loaded_arg2 as usize) << 2)
            | ((loaded_out as usize) << 1)
            | (wrote as usize);
        if wrote {
            self.tag_write += 1;
        }
        self.insns += 1;
        self.needs[bits] += 1;
        if matched {
            self.match_insns += 1;
        }
    }

    /// Render the `RESULT,...` CSV line.
    pub fn csv_line(&self) -> String {
        let mut line = format!(
            "RESULT,{},{},{},{}",
            self.insns, self.match_insns, self.tag_read, self.tag_write
        );
        for bucket in &self.needs {
            line.push_str(&format!(",{}", bucket));
        }
        line
    }
}
