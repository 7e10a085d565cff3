//! Translates one guest block into host ops.
//!
//! The compiler walks guest instructions from a start address, asks the generator table for
//! code, and falls back to single instruction interpreter calls for anything without a
//! generator. Every exit flushes the register cache, so blocks always hand back a fully
//! written guest context.

use dsp::opcodes::{self, Inst, OpInfo};
use dsp::regs::{Condition, Reg};
use dsp::DspContext;

use crate::blocks::BlockTable;
use crate::codegen::load_store::write_reg;
use crate::codegen::{flags, Emit, JitTable};
use crate::host::{Cond, Emitter, Helper, HostReg, Op, Operand, Slot};
use crate::regcache::{CacheReg, PinPolicy, RegCache};
use crate::JitConfig;

/// Cycles an idle loop block reports, so the dispatcher burns through the budget quickly
pub const IDLE_SKIP_CYCLES: u32 = 0x1000;

const RAX: HostReg = HostReg::Rax;
const RCX: HostReg = HostReg::Rcx;

/// A block that has been translated but not yet committed to a backend
pub struct CompiledBlock {
    pub code: Emitter,
    /// Offset of the entry used by direct links, past the prologue
    pub link_offset: usize,
    pub start: u16,
    pub end: u16,
    pub size: u16,
    pub unresolved: Vec<u16>,
    pub links: Vec<u16>,
    /// Instructions handed to the interpreter
    pub fallbacks: u32,
}

pub struct Compiler<'a> {
    ctx: &'a DspContext,
    blocks: &'a BlockTable,
    table: &'a JitTable,
    config: &'a JitConfig,
    pub(crate) code: Emitter,
    pub(crate) cache: RegCache,
    start: u16,
    end: u16,
    count: u16,
    deferred: Vec<(Reg, HostReg)>,
    unresolved: Vec<u16>,
    links: Vec<u16>,
    fallbacks: u32,
}

impl<'a> Compiler<'a> {
    pub fn new(
        ctx: &'a DspContext,
        blocks: &'a BlockTable,
        table: &'a JitTable,
        config: &'a JitConfig,
        start: u16,
    ) -> Compiler<'a> {
        let policy = if config.pin_composites { PinPolicy::accumulators() } else { PinPolicy::none() };
        Compiler {
            ctx,
            blocks,
            table,
            config,
            code: Emitter::new(),
            cache: RegCache::new(policy),
            start,
            end: start,
            count: 0,
            deferred: Vec::new(),
            unresolved: Vec::new(),
            links: Vec::new(),
            fallbacks: 0,
        }
    }

    pub fn compile(mut self) -> CompiledBlock {
        let entry = self.cache.entry_state();
        self.cache.reconcile(&mut self.code, &entry);
        let link_offset = self.code.len();

        let ctx = self.ctx;
        let analyzer = &ctx.analyzer;
        let mut pc = self.start;
        loop {
            if analyzer.check_exceptions(pc) {
                self.emit_exception_check(pc);
            }

            let (inst, info) = Inst::fetch(&ctx.mem, pc);
            let next = inst.next(info);
            self.count += 1;
            self.end = next.wrapping_sub(1);

            let emitted = self.emit_instruction(inst, info, next);
            if emitted == Emit::Exit {
                break;
            }

            let fell_back = emitted == Emit::Decline;
            if fell_back && info.branch {
                if info.uncond_branch {
                    self.emit_exit();
                    break;
                }
                self.emit_pc_check(next);
            }

            if analyzer.is_loop_end(inst.addr) && !info.uncond_branch {
                self.call_helper(Helper::HandleLoop(inst.addr), &[]);
                self.exit_if_rax();
            }

            pc = next;
            if self.count as usize >= self.config.max_block_size || analyzer.is_idle_skip(pc) {
                self.code.store(Slot::Pc, pc as i64);
                self.emit_link(pc);
                self.emit_exit();
                break;
            }
        }

        let size = self.count.max(1);
        log::debug!(
            "Compiled block {:04x}..={:04x}: {} instructions, {} host ops, {} fallbacks",
            self.start,
            self.end,
            size,
            self.code.len(),
            self.fallbacks
        );
        CompiledBlock {
            code: self.code,
            link_offset,
            start: self.start,
            end: self.end,
            size,
            unresolved: self.unresolved,
            links: self.links,
            fallbacks: self.fallbacks,
        }
    }

    /// Emits the extension, the main opcode and the deferred extension writes
    fn emit_instruction(&mut self, inst: Inst, info: &OpInfo, next: u16) -> Emit {
        let mut ext_fell_back = false;
        if info.extended {
            let emitted = match self.table.ext(inst.ext()) {
                Some(gen) => gen(self, inst),
                None => Emit::Decline,
            };
            if emitted == Emit::Decline {
                debug_assert!(self.deferred.is_empty());
                self.cache.flush_all(&mut self.code);
                self.call_helper(Helper::InterpretExt(inst), &[]);
                ext_fell_back = true;
            }
        }

        let emitted = match self.table.main(inst.opc) {
            Some(gen) => gen(self, inst),
            None => Emit::Decline,
        };
        if emitted == Emit::Decline {
            self.emit_fallback(inst, info, next);
        }

        if emitted == Emit::Exit {
            debug_assert!(self.deferred.is_empty() && !ext_fell_back, "extended opcode ended a block");
            return emitted;
        }
        for (reg, value) in std::mem::take(&mut self.deferred) {
            write_reg(self, reg, value);
            self.cache.release_scratch(value);
        }
        if ext_fell_back {
            self.cache.flush_all(&mut self.code);
            self.code.emit(Op::Call(Helper::ApplyWriteBackLog));
        }
        emitted
    }

    /// Runs one instruction through the interpreter with the guest context fully written back
    fn emit_fallback(&mut self, inst: Inst, info: &OpInfo, next: u16) {
        log::trace!("{:04x}: {:04x} falls back to the interpreter", inst.addr, inst.opc);
        self.fallbacks += 1;
        if info.branch || info.reads_pc {
            self.code.store(Slot::Pc, next as i64);
        }
        self.cache.flush_all(&mut self.code);
        let saved = self.cache.push_regs(&mut self.code);
        self.code.emit(Op::Call(Helper::Interpret(inst)));
        self.cache.pop_regs(&mut self.code, saved);
    }

    /// Polls pending exceptions before the instruction at `addr`. Leaves the block only when
    /// an exception was taken.
    fn emit_exception_check(&mut self, addr: u16) {
        let skip = self.code.new_label();
        self.code.load(RAX, Slot::Exceptions);
        self.code.test(RAX, RAX);
        self.code.jump(Cond::Eq, skip);

        let state = self.cache.snapshot();
        self.cache.flush_all(&mut self.code);
        self.code.store(Slot::Pc, addr as i64);
        self.code.emit(Op::Call(Helper::CheckExceptions));
        let resume = self.code.new_label();
        self.code.test(RAX, RAX);
        self.code.jump(Cond::Eq, resume);
        self.emit_exit_with(self.count as u32);
        self.code.bind(resume);
        self.cache.reconcile(&mut self.code, &state);
        self.code.bind(skip);
    }

    /// After an interpreted conditional branch, leaves the block if the branch was taken
    fn emit_pc_check(&mut self, next: u16) {
        self.code.load(RAX, Slot::Pc);
        self.code.cmp(RAX, next as i64);
        let stay = self.code.new_label();
        self.code.jump(Cond::Eq, stay);
        let state = self.cache.snapshot();
        self.emit_exit();
        self.cache.restore(state);
        self.code.bind(stay);
    }

    /// Exits when the last helper call returned non-zero in RAX
    fn exit_if_rax(&mut self) {
        self.code.test(RAX, RAX);
        let stay = self.code.new_label();
        self.code.jump(Cond::Eq, stay);
        let state = self.cache.snapshot();
        self.emit_exit();
        self.cache.restore(state);
        self.code.bind(stay);
    }

    /// Cycles reported by exits of this block
    fn exit_cycles(&self) -> u32 {
        if self.config.idle_skip && self.ctx.analyzer.is_idle_skip(self.start) {
            IDLE_SKIP_CYCLES
        } else {
            self.count as u32
        }
    }

    fn emit_exit_with(&mut self, cycles: u32) {
        self.cache.flush_all(&mut self.code);
        self.code.mov(RAX, cycles as i64);
        self.code.emit(Op::Exit);
    }

    /// Writes back the cache and returns to the dispatcher. PC must already be stored.
    pub(crate) fn emit_exit(&mut self) {
        let cycles = self.exit_cycles();
        self.emit_exit_with(cycles);
    }

    /// True when the interpreter would handle the loop ending at `inst` after it falls through
    pub(crate) fn handles_loop(&self, inst: Inst) -> bool {
        self.ctx.analyzer.is_loop_end(inst.addr) && !opcodes::lookup(inst.opc).uncond_branch
    }

    /// Leaves the block after `inst` stored the PC it goes to. When that PC is the fall through
    /// address of a loop end instruction, the loop is handled first.
    pub(crate) fn emit_exit_after(&mut self, inst: Inst) {
        if self.handles_loop(inst) {
            let next = inst.addr.wrapping_add(opcodes::lookup(inst.opc).size);
            self.cache.flush_all(&mut self.code);
            let skip = self.code.new_label();
            self.code.load(RAX, Slot::Pc);
            self.code.cmp(RAX, next as i64);
            self.code.jump(Cond::Ne, skip);
            self.code.emit(Op::Call(Helper::HandleLoop(inst.addr)));
            self.code.bind(skip);
        }
        self.emit_exit();
    }

    /// Exit towards a statically known target, linking to it when possible
    pub(crate) fn emit_branch_exit(&mut self, target: u16) {
        self.code.store(Slot::Pc, target as i64);
        self.emit_link(target);
        self.emit_exit();
    }

    /// Jumps straight into `target` when it is linkable and the budget covers both blocks
    fn emit_link(&mut self, target: u16) {
        if !self.config.link_blocks || (self.start..=self.end).contains(&target) {
            return;
        }
        match self.blocks.link_target(target) {
            Some((entry, size)) => {
                let state = self.cache.entry_state();
                self.cache.reconcile(&mut self.code, &state);
                let skip = self.code.new_label();
                self.code.load(RCX, Slot::CyclesLeft);
                self.code.cmp(RCX, (self.count as i64) + (size as i64));
                self.code.jump(Cond::Lt, skip);
                self.code.emit(Op::LinkJump { block: target, entry, cost: self.count });
                self.code.bind(skip);
                if !self.links.contains(&target) {
                    self.links.push(target);
                }
            }
            None => {
                if !self.unresolved.contains(&target) {
                    self.unresolved.push(target);
                }
            }
        }
    }

    /// Emits `arm` guarded by `cond`. Exits taken inside the arm do not affect the cache state
    /// of the fall through path.
    pub(crate) fn conditional(&mut self, cond: Condition, arm: impl FnOnce(&mut Self) -> Emit) -> Emit {
        if cond == Condition::Always {
            return arm(self);
        }
        flags::condition_to_rax(self, cond);
        let skip = self.code.new_label();
        self.code.test(RAX, RAX);
        self.code.jump(Cond::Eq, skip);
        let state = self.cache.snapshot();
        match arm(self) {
            Emit::Exit => self.cache.restore(state),
            _ => self.cache.reconcile(&mut self.code, &state),
        }
        self.code.bind(skip);
        Emit::Continue
    }

    pub(crate) fn acquire(&mut self, reg: impl Into<CacheReg>, load: bool) -> HostReg {
        self.cache.acquire(&mut self.code, reg.into(), load)
    }

    pub(crate) fn release(&mut self, reg: impl Into<CacheReg>, dirty: bool) {
        self.cache.release(&mut self.code, reg.into(), dirty)
    }

    pub(crate) fn scratch(&mut self) -> HostReg {
        self.cache.acquire_scratch(&mut self.code)
    }

    pub(crate) fn free_scratch(&mut self, host: HostReg) {
        self.cache.release_scratch(host)
    }

    /// Queues a register write to happen after the main opcode. `value` stays reserved until then.
    pub(crate) fn defer_write(&mut self, reg: Reg, value: HostReg) {
        self.deferred.push((reg, value));
    }

    /// Calls a helper that does not touch the register file, preserving cached registers
    pub(crate) fn call_helper(&mut self, helper: Helper, args: &[(HostReg, Operand)]) {
        let saved = self.cache.push_regs(&mut self.code);
        for &(dst, src) in args {
            self.code.mov(dst, src);
        }
        self.code.emit(Op::Call(helper));
        self.cache.pop_regs(&mut self.code, saved);
    }

    pub(crate) fn mem(&self) -> &dsp::memory::Memory {
        &self.ctx.mem
    }
}
