use std::collections::BTreeSet;

use dsp::interpreter;
use dsp::{DspContext, DspError};

use crate::blocks::{BlockInfo, BlockState, BlockTable};
use crate::codegen::JitTable;
use crate::compiler::Compiler;
use crate::host::{self, Backend, CodePtr};
use crate::JitConfig;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct JitStats {
    pub dispatches: u64,
    pub blocks_compiled: u64,
    pub links_taken: u64,
    pub invalidations: u64,
    pub fallbacks: u64,
    pub arena_resets: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    BudgetExhausted,
    Halted,
    /// An external interrupt arrived; the next run services it
    Interrupted,
    Breakpoint(u16),
}

/// Guest addresses the debugger wants to stop at
#[derive(Clone, Debug, Default)]
pub struct Breakpoints(BTreeSet<u16>);

impl Breakpoints {
    pub fn new() -> Breakpoints {
        Breakpoints::default()
    }

    pub fn add(&mut self, addr: u16) {
        self.0.insert(addr);
    }

    pub fn remove(&mut self, addr: u16) -> bool {
        self.0.remove(&addr)
    }

    pub fn contains(&self, addr: u16) -> bool {
        self.0.contains(&addr)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if a breakpoint lies after `start`, up to and including `end`
    fn any_after(&self, start: u16, end: u16) -> bool {
        match start.checked_add(1) {
            Some(first) if first <= end => self.0.range(first..=end).next().is_some(),
            _ => false,
        }
    }
}

impl FromIterator<u16> for Breakpoints {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        Breakpoints(iter.into_iter().collect())
    }
}

/// Owns everything compiled code depends on: the backend holding the code, and the block table.
pub struct Jit {
    config: JitConfig,
    table: JitTable,
    backend: Box<dyn Backend>,
    blocks: BlockTable,
    stats: JitStats,
}

impl Jit {
    pub fn new(config: JitConfig) -> Result<Jit, DspError> {
        Jit::with_table(config, JitTable::new())
    }

    pub fn with_table(config: JitConfig, table: JitTable) -> Result<Jit, DspError> {
        config.validate()?;
        let backend = host::new_backend(config.native_code)?;
        Ok(Jit { config, table, backend, blocks: BlockTable::new(), stats: JitStats::default() })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    pub fn block_state(&self, addr: u16) -> BlockState {
        self.blocks.state(addr)
    }

    pub fn blocks(&self) -> &BlockTable {
        &self.blocks
    }

    /// Compiles the block at `addr` and makes it the table entry, replacing whatever was there
    pub fn compile(&mut self, ctx: &DspContext, addr: u16) -> CodePtr {
        if self.backend.code_size() >= self.config.code_capacity {
            log::debug!("Code cache full at {}, starting over", self.backend.code_size());
            self.clear();
        }

        let block = Compiler::new(ctx, &self.blocks, &self.table, &self.config, addr).compile();
        let installed = self.backend.commit(block.code, block.link_offset);
        let entry = installed.entry;
        let link_entry = installed.link_entry;

        let recompile = self.blocks.insert(BlockInfo {
            start: block.start,
            end: block.end,
            size: block.size,
            entry,
            link_entry,
            unresolved: block.unresolved,
            links: block.links,
        });
        if !recompile.is_empty() {
            log::debug!("{:04x} is linkable, recompiling {:04x?}", addr, recompile);
        }

        self.stats.blocks_compiled += 1;
        self.stats.fallbacks += block.fallbacks as u64;
        entry
    }

    /// Drops every block overlapping `start..=end`, and everything linked into them
    pub fn invalidate_range(&mut self, start: u16, end: u16) {
        let dropped = self.blocks.invalidate_range(start, end);
        if dropped > 0 {
            log::debug!("Invalidated {:04x}..={:04x}: {} blocks", start, end, dropped);
        }
        self.stats.invalidations += dropped as u64;
    }

    /// Throws away all compiled code
    pub fn clear(&mut self) {
        self.backend.clear();
        self.blocks.clear();
        self.stats.arena_resets += 1;
    }

    fn poll_signals(&mut self, ctx: &mut DspContext) {
        if ctx.signals().take_code_reset() {
            log::debug!("Code reset requested");
            self.clear();
        }
        for (start, end) in ctx.take_invalidations() {
            self.invalidate_range(start, end);
        }
    }

    /// Runs the block at the current PC once, compiling it first if needed.
    /// Returns the cycles it reported.
    pub fn step_block(&mut self, ctx: &mut DspContext) -> u32 {
        let pc = ctx.pc;
        let entry = match self.blocks.state(pc) {
            BlockState::Compiled(entry) => entry,
            BlockState::Stub | BlockState::Recompile => self.compile(ctx, pc),
        };
        log::trace!("Dispatch {:04x}", pc);
        self.stats.dispatches += 1;

        let links = self.backend.links_taken();
        let cycles = self.backend.run(entry, ctx);
        self.stats.links_taken += self.backend.links_taken() - links;
        cycles
    }

    /// Services a pending external interrupt and primes the budget. Returns false if halted,
    /// in which case the whole budget is left in `cycles_left`.
    fn begin_run(&mut self, ctx: &mut DspContext, cycles: i32) -> bool {
        self.poll_signals(ctx);
        if ctx.signals().take_interrupt() || ctx.external_interrupt_waiting {
            ctx.service_external_interrupt();
        }
        ctx.cycles_left = cycles;
        !ctx.is_halted()
    }

    /// Runs compiled code until the budget is used up, the DSP halts or an interrupt arrives.
    ///
    /// Returns the budget left over. Blocks run to completion, so this goes negative when the
    /// last block overshoots.
    pub fn run_for_cycles(&mut self, ctx: &mut DspContext, cycles: i32) -> i32 {
        if !self.begin_run(ctx, cycles) {
            return 0;
        }
        let signals = ctx.signals();
        while ctx.cycles_left > 0 && !ctx.is_halted() && !signals.interrupt_pending() {
            self.poll_signals(ctx);
            let used = self.step_block(ctx);
            ctx.cycles_left -= used as i32;
        }
        ctx.cycles_left
    }

    /// Debugger variant of `run_for_cycles`. Links are not followed, and a block with a
    /// breakpoint inside it is single stepped through the interpreter instead. The budget
    /// left over is in `ctx.cycles_left`.
    pub fn run_until_breakpoint(&mut self, ctx: &mut DspContext, cycles: i32, breakpoints: &Breakpoints) -> StopReason {
        if !self.begin_run(ctx, cycles) {
            return StopReason::Halted;
        }
        let signals = ctx.signals();
        self.backend.set_links(false);

        let mut first = true;
        let reason = loop {
            if ctx.is_halted() {
                break StopReason::Halted;
            }
            if signals.interrupt_pending() {
                break StopReason::Interrupted;
            }
            if ctx.cycles_left <= 0 {
                break StopReason::BudgetExhausted;
            }
            let pc = ctx.pc;
            // the breakpoint we were stopped at is stepped over
            if !first && breakpoints.contains(pc) {
                break StopReason::Breakpoint(pc);
            }
            first = false;

            self.poll_signals(ctx);
            if matches!(self.blocks.state(pc), BlockState::Stub | BlockState::Recompile) {
                self.compile(ctx, pc);
            }
            if breakpoints.any_after(pc, self.blocks.end(pc)) {
                interpreter::step(ctx);
                ctx.cycles_left -= 1;
            } else {
                let used = self.step_block(ctx);
                ctx.cycles_left -= used as i32;
            }
        };

        self.backend.set_links(true);
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoint_ranges() {
        let bps: Breakpoints = [0x10, 0x20].into_iter().collect();
        assert!(bps.any_after(0x0f, 0x10));
        assert!(!bps.any_after(0x10, 0x1f));
        assert!(bps.any_after(0x10, 0x20));
        assert!(!bps.any_after(0x30, 0x20));
        assert!(!bps.any_after(0xffff, 0xffff));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = JitConfig { max_block_size: 0, ..JitConfig::default() };
        assert!(matches!(Jit::new(config), Err(DspError::InvalidConfig(_))));
    }

    #[test]
    fn full_arena_is_reset() {
        let mut ctx = DspContext::default();
        ctx.write_iram(0, &[0x0000; 64]);
        let config = JitConfig { max_block_size: 1, code_capacity: 4096, ..JitConfig::default() };
        let mut jit = Jit::new(config).unwrap();
        while jit.backend.code_size() < 4096 {
            jit.compile(&ctx, 0);
        }
        jit.compile(&ctx, 0);
        assert_eq!(jit.stats().arena_resets, 1);
        assert!(matches!(jit.block_state(0), BlockState::Compiled(_)));
    }
}
