//! Block translator for the DSP.
//!
//! Guest code is compiled a block at a time into ops for x86-64, which a [`host::Backend`]
//! turns into machine code, or on other hosts runs through [`host::HostCpu`]. Blocks are
//! linked directly to each other when the cycle budget allows it.

pub mod blocks;
pub mod codegen;
pub mod compiler;
pub mod dispatcher;
pub mod host;
pub mod regcache;

use dsp::DspError;

pub use blocks::BlockState;
pub use dispatcher::{Breakpoints, Jit, JitStats, StopReason};

/// Smallest code cache, in backend units
const MIN_CODE_CAPACITY: usize = 4096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JitConfig {
    /// Guest instructions per block
    pub max_block_size: usize,
    /// Let idle loop blocks report a large cycle count
    pub idle_skip: bool,
    /// Emit direct jumps between blocks
    pub link_blocks: bool,
    /// Keep the accumulators in fixed host registers
    pub pin_composites: bool,
    /// Compiled code size before the whole cache is thrown away: bytes of machine code, or
    /// ops when `native_code` is off
    pub code_capacity: usize,
    /// Emit machine code. Only available on x86-64 hosts.
    pub native_code: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            max_block_size: 250,
            idle_skip: true,
            link_blocks: true,
            pin_composites: true,
            code_capacity: 1 << 20,
            native_code: cfg!(target_arch = "x86_64"),
        }
    }
}

impl JitConfig {
    pub fn validate(&self) -> Result<(), DspError> {
        if self.max_block_size == 0 {
            return Err(DspError::InvalidConfig("max_block_size must be at least 1".into()));
        }
        if self.max_block_size > u16::MAX as usize {
            return Err(DspError::InvalidConfig(format!("max_block_size {} is too large", self.max_block_size)));
        }
        if self.code_capacity < MIN_CODE_CAPACITY {
            return Err(DspError::InvalidConfig(format!(
                "code_capacity {} is below the minimum of {}",
                self.code_capacity, MIN_CODE_CAPACITY
            )));
        }
        if self.native_code && !cfg!(target_arch = "x86_64") {
            return Err(DspError::InvalidConfig("native_code needs an x86-64 host".into()));
        }
        Ok(())
    }
}
