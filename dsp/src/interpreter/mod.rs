//! Reference interpreter. The JIT falls back to these functions one instruction at a time,
//! and the debugger single steps with them.

pub mod ext;
pub mod ops;

use crate::context::DspContext;
use crate::opcodes::{lookup_ext, Inst};
use crate::regs::{Reg, StackId};

/// Executes one instruction, including the exception poll before it and loop handling after it.
pub fn step(ctx: &mut DspContext) {
    if ctx.analyzer.check_exceptions(ctx.pc) {
        ctx.check_exceptions();
    }

    let (inst, info) = Inst::fetch(&ctx.mem, ctx.pc);
    let next = inst.next(info);
    ctx.pc = next;

    if info.extended {
        execute_ext(ctx, inst);
    }
    (info.interp)(ctx, inst);
    if info.extended {
        apply_write_back_log(ctx);
    }

    if ctx.analyzer.is_loop_end(inst.addr) && !info.uncond_branch && ctx.pc == next {
        handle_loop(ctx, inst.addr);
    }
}

/// Runs the main half of an instruction. PC must already point past it.
pub fn execute_main(ctx: &mut DspContext, inst: Inst) {
    let info = crate::opcodes::lookup(inst.opc);
    (info.interp)(ctx, inst);
}

/// Runs the extension half of an instruction, staging its writes in the write back log
pub fn execute_ext(ctx: &mut DspContext, inst: Inst) {
    (lookup_ext(inst.ext()).interp)(ctx, inst);
}

pub fn apply_write_back_log(ctx: &mut DspContext) {
    for (reg, value) in ctx.write_back.take() {
        ctx.regs.write(reg, value);
    }
}

/// Called after the instruction at a loop end address falls through.
/// Returns true if the loop went around again, with PC set to the loop start.
pub fn handle_loop(ctx: &mut DspContext, addr: u16) -> bool {
    let loop_address = ctx.regs.get(Reg::St2);
    let counter = ctx.regs.get(Reg::St3);
    if loop_address == 0 || counter == 0 || loop_address != addr {
        return false;
    }

    let counter = counter - 1;
    ctx.regs.set(Reg::St3, counter);
    if counter > 0 {
        ctx.pc = ctx.regs.get(Reg::St0);
        true
    } else {
        ctx.regs.pop_stack(StackId::Call);
        ctx.regs.pop_stack(StackId::LoopAddress);
        ctx.regs.pop_stack(StackId::LoopCounter);
        false
    }
}

/// Interpreter only run loop. Returns the unused part of the budget.
pub fn run_cycles(ctx: &mut DspContext, cycles: i32) -> i32 {
    if ctx.signals().take_interrupt() || ctx.external_interrupt_waiting {
        ctx.service_external_interrupt();
    }
    if ctx.is_halted() {
        return 0;
    }

    let mut left = cycles;
    while left > 0 && !ctx.is_halted() {
        step(ctx);
        left -= 1;
    }
    left
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::sr;

    fn context(code: &[u16]) -> DspContext {
        let mut ctx = DspContext::default();
        ctx.write_iram(0, code);
        ctx
    }

    fn run_until_halt(ctx: &mut DspContext) {
        for _ in 0..1000 {
            if ctx.is_halted() {
                return;
            }
            step(ctx);
        }
        panic!("program did not halt");
    }

    #[test]
    fn add_sets_flags() {
        // SET40; LRI $ac0.m, #5; LRI $ac1.m, #-5; ADD $ac0, $ac1; HALT
        let mut ctx = context(&[0x8f00, 0x009e, 0x0005, 0x009f, 0xfffb, 0x4c00, 0x0021]);
        run_until_halt(&mut ctx);
        assert_eq!(ctx.regs.acc(0), 0);
        assert_eq!(ctx.regs.acc(1), -0x5_0000);
        let flags = ctx.regs.sr();
        assert_ne!(flags & sr::ARITH_ZERO, 0);
        assert_ne!(flags & sr::CARRY, 0);
        assert_eq!(flags & sr::OVERFLOW, 0);
        assert_eq!(ctx.pc, 6);
    }

    #[test]
    fn call_and_return() {
        // CALL 0x0004; HALT; NOP; LRIS $ax0.h, #3; RET
        let mut ctx = context(&[0x02bf, 0x0004, 0x0021, 0x0000, 0x0a03, 0x02df]);
        run_until_halt(&mut ctx);
        assert_eq!(ctx.regs.get(Reg::Axh0), 3);
        assert_eq!(ctx.pc, 2);
        assert_eq!(ctx.regs.stack_depth(StackId::Call), 0);
    }

    #[test]
    fn hardware_loop() {
        // LOOPI #3; INC $ac0; HALT
        let mut ctx = context(&[0x1003, 0x7600, 0x0021]);
        run_until_halt(&mut ctx);
        assert_eq!(ctx.regs.acc(0), 3);
        assert_eq!(ctx.regs.stack_depth(StackId::LoopCounter), 0);

        // LOOPI #0 skips the body
        let mut ctx = context(&[0x1000, 0x7600, 0x0021]);
        run_until_halt(&mut ctx);
        assert_eq!(ctx.regs.acc(0), 0);
    }

    #[test]
    fn block_loop() {
        // BLOOPI #2, 0x0003; INC $ac0; INC $ac1; HALT
        let mut ctx = context(&[0x1102, 0x0003, 0x7600, 0x7700, 0x0021]);
        run_until_halt(&mut ctx);
        assert_eq!(ctx.regs.acc(0), 2);
        assert_eq!(ctx.regs.acc(1), 2);
    }

    #[test]
    fn conditional_skip() {
        // CLR $acc0; IFZ; LRIS $ax0.l, #1; IFNZ; LRIS $ax1.l, #1; HALT
        let mut ctx = context(&[0x8100, 0x0275, 0x0801, 0x0274, 0x0901, 0x0021]);
        run_until_halt(&mut ctx);
        assert_eq!(ctx.regs.get(Reg::Axl0), 1);
        assert_eq!(ctx.regs.get(Reg::Axl1), 0);
    }

    #[test]
    fn extension_reads_before_main_writes() {
        // LRI $ac0.m, #7; CLR'MV $ax0.l, $ac0.m; HALT
        let mut ctx = context(&[0x009e, 0x0007, 0x8112, 0x0021]);
        run_until_halt(&mut ctx);
        assert_eq!(ctx.regs.get(Reg::Axl0), 7);
        assert_eq!(ctx.regs.acc(0), 0);
    }

    #[test]
    fn halted_context_runs_nothing() {
        let mut ctx = context(&[0x0021]);
        assert_eq!(run_cycles(&mut ctx, 10), 9);
        assert_eq!(run_cycles(&mut ctx, 10), 0);
    }
}
