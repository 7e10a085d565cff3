use std::sync::{Arc, OnceLock};

use dsp::hw::{Hardware, Mailboxes};
use dsp::regs::{sr, Reg};
use dsp::{DspContext, DspSignals};
use jit::compiler::IDLE_SKIP_CYCLES;
use jit::{BlockState, Breakpoints, Jit, JitConfig, StopReason};

fn load(code: &[(u16, &[u16])]) -> DspContext {
    let mut ctx = DspContext::default();
    for &(addr, words) in code {
        ctx.write_iram(addr, words);
    }
    ctx
}

fn jit() -> Jit {
    Jit::new(JitConfig::default()).unwrap()
}

fn restart(ctx: &mut DspContext) {
    ctx.pc = 0;
    ctx.set_halt(false);
}

/// A: NOP; NOP; JMP 0x10 (3 cycles), B: NOP; NOP; HALT (3 cycles)
fn linked_pair() -> DspContext {
    load(&[(0x00, &[0x0000, 0x0000, 0x029f, 0x0010]), (0x10, &[0x0000, 0x0000, 0x0021])])
}

#[test]
fn waiting_block_is_recompiled_with_a_link() {
    let mut ctx = linked_pair();
    let mut jit = jit();
    jit.run_for_cycles(&mut ctx, 100);
    assert!(ctx.is_halted());
    assert_eq!(ctx.pc, 0x12);
    // A was compiled before B existed and waits for it
    assert_eq!(jit.block_state(0x00), BlockState::Recompile);
    assert!(matches!(jit.block_state(0x10), BlockState::Compiled(_)));
    assert_eq!(jit.stats().links_taken, 0);

    restart(&mut ctx);
    assert_eq!(jit.run_for_cycles(&mut ctx, 6), 0);
    assert!(ctx.is_halted());
    assert_eq!(jit.stats().links_taken, 1);
    assert_eq!(jit.blocks().linked_from(0x10), vec![0x00]);
}

#[test]
fn link_needs_budget_for_both_blocks() {
    let mut ctx = linked_pair();
    let mut jit = jit();
    jit.run_for_cycles(&mut ctx, 100);
    restart(&mut ctx);
    jit.compile(&ctx, 0);

    // one cycle short of A + B
    assert_eq!(jit.run_for_cycles(&mut ctx, 5), -1);
    assert!(ctx.is_halted());
    assert_eq!(jit.stats().links_taken, 0);
    assert_eq!(jit.stats().dispatches, 4);
}

#[test]
fn links_charge_the_linking_block_on_either_backend() {
    for native_code in [false, cfg!(target_arch = "x86_64")] {
        let mut ctx = linked_pair();
        let mut jit = Jit::new(JitConfig { native_code, ..JitConfig::default() }).unwrap();
        jit.run_for_cycles(&mut ctx, 100);
        restart(&mut ctx);
        assert_eq!(jit.run_for_cycles(&mut ctx, 6), 0, "native code: {}", native_code);
        assert_eq!(jit.stats().links_taken, 1, "native code: {}", native_code);
        assert_eq!(jit.stats().dispatches, 3, "native code: {}", native_code);
    }
}

#[test]
fn rewriting_a_target_invalidates_its_linkers() {
    let mut ctx = linked_pair();
    let mut jit = jit();
    jit.run_for_cycles(&mut ctx, 100);
    restart(&mut ctx);
    jit.run_for_cycles(&mut ctx, 100);
    assert_eq!(jit.blocks().linked_from(0x10), vec![0x00]);

    // CLR $AC0 in place of B's second NOP
    ctx.write_iram(0x11, &[0x8100]);
    ctx.regs.set_acc(0, 0x1234);
    restart(&mut ctx);
    jit.run_for_cycles(&mut ctx, 100);

    assert_eq!(jit.stats().invalidations, 2);
    assert!(ctx.is_halted());
    assert_eq!(ctx.regs.acc(0), 0);
    assert!(ctx.regs.sr_flag(sr::ARITH_ZERO));
}

#[test]
fn explicit_invalidation_and_clear() {
    let mut ctx = linked_pair();
    let mut jit = jit();
    jit.run_for_cycles(&mut ctx, 100);
    jit.invalidate_range(0x12, 0x20);
    assert_eq!(jit.block_state(0x10), BlockState::Stub);
    assert_eq!(jit.block_state(0x00), BlockState::Recompile);

    jit.compile(&ctx, 0x10);
    jit.clear();
    assert_eq!(jit.block_state(0x10), BlockState::Stub);
    assert_eq!(jit.stats().arena_resets, 1);

    ctx.signals().request_code_reset();
    restart(&mut ctx);
    jit.run_for_cycles(&mut ctx, 100);
    assert_eq!(jit.stats().arena_resets, 2);
    assert!(ctx.is_halted());
}

/// NOP; NOP; then the idle loop LRS $AC0.M, @CMBH; ANDCF $AC0.M, #0x8000; JLNZ 0x0002
const IDLE_PROGRAM: &[u16] = &[0x0000, 0x0000, 0x26fe, 0x02c0, 0x8000, 0x029c, 0x0002];

#[test]
fn idle_loop_gets_its_own_block() {
    for idle_skip in [true, false] {
        let mut ctx = load(&[(0, IDLE_PROGRAM)]);
        assert!(ctx.analyzer.is_idle_skip(2));
        let mut jit = Jit::new(JitConfig { idle_skip, ..JitConfig::default() }).unwrap();

        assert_eq!(jit.step_block(&mut ctx), 2);
        assert_eq!(ctx.pc, 2);
        assert_eq!(jit.blocks().size(0), 2);

        let idle = jit.step_block(&mut ctx);
        assert_eq!(ctx.pc, 2);
        if idle_skip {
            assert_eq!(idle, IDLE_SKIP_CYCLES);
        } else {
            assert_eq!(idle, 3);
        }
    }
}

#[test]
fn mail_releases_the_idle_loop() {
    let mailboxes = Mailboxes::new();
    let mut ctx = DspContext::new(Box::new(mailboxes.clone()));
    let mut code = IDLE_PROGRAM.to_vec();
    code.push(0x0021);
    ctx.write_iram(0, &code);

    let mut jit = jit();
    let left = jit.run_for_cycles(&mut ctx, 10_000);
    assert!(left <= 0);
    assert!(!ctx.is_halted());
    assert_eq!(ctx.pc, 2);

    mailboxes.send_to_dsp(0x1234_5678);
    jit.run_for_cycles(&mut ctx, 10_000);
    assert!(ctx.is_halted());
    assert_eq!(ctx.pc, 7);
    assert_eq!(ctx.regs.get(Reg::Acm0), 0x9234);
}

#[test]
fn runs_are_deterministic() {
    let code: &[u16] = &[
        0x0e05, // LRIS $AC0.M, #5
        0x009f, 0x0001, // LRI $AC1.M, #1
        0x5c00, // SUB $AC0, $AC1
        0x0294, 0x0003, // JNZ 0x0003
        0x0021, // HALT
    ];
    let run = || {
        let mut ctx = load(&[(0, code)]);
        let mut jit = jit();
        let mut slices = Vec::new();
        while !ctx.is_halted() {
            slices.push(jit.run_for_cycles(&mut ctx, 4));
        }
        (slices, jit.stats(), ctx.regs.clone())
    };
    assert_eq!(run(), run());
}

#[test]
fn halted_dsp_does_not_run() {
    let mut ctx = load(&[(0, &[0x0021])]);
    let mut jit = jit();
    jit.run_for_cycles(&mut ctx, 10);
    assert!(ctx.is_halted());
    assert_eq!(jit.run_for_cycles(&mut ctx, 10), 0);
    assert_eq!(jit.stats().dispatches, 1);
}

#[test]
fn halted_debugger_run_leaves_the_whole_budget() {
    let mut ctx = load(&[(0, &[0x0021])]);
    let mut jit = jit();
    jit.run_for_cycles(&mut ctx, 10);
    assert!(ctx.is_halted());
    ctx.cycles_left = -3;
    assert_eq!(jit.run_until_breakpoint(&mut ctx, 10, &Breakpoints::new()), StopReason::Halted);
    assert_eq!(ctx.cycles_left, 10);
    assert_eq!(jit.stats().dispatches, 1);
}

/// SBSET #11 (SR.EIE); JMP 0x0001 spinning, with HALT at the external interrupt vector
fn interrupt_program(enable: bool) -> DspContext {
    let first = if enable { 0x1305 } else { 0x0000 };
    load(&[(0, &[first, 0x029f, 0x0001]), (14, &[0x0021])])
}

#[test]
fn external_interrupt_is_serviced_at_run_boundary() {
    let mut ctx = interrupt_program(true);
    let mut jit = jit();
    jit.run_for_cycles(&mut ctx, 50);
    assert!(!ctx.is_halted());
    assert!(ctx.regs.sr_flag(sr::EXT_INT_ENABLE));

    ctx.signals().request_interrupt();
    jit.run_for_cycles(&mut ctx, 50);
    assert!(ctx.is_halted());
    assert_eq!(ctx.pc, 14);
    assert_eq!(ctx.regs.get(Reg::St0), 1);
    assert!(!ctx.regs.sr_flag(sr::EXT_INT_ENABLE));
}

#[test]
fn masked_interrupt_waits() {
    let mut ctx = interrupt_program(false);
    let mut jit = jit();
    ctx.signals().request_interrupt();
    jit.run_for_cycles(&mut ctx, 50);
    assert!(ctx.external_interrupt_waiting);
    assert!(!ctx.is_halted());

    ctx.regs.set_sr(sr::EXT_INT_ENABLE);
    jit.run_for_cycles(&mut ctx, 50);
    assert!(!ctx.external_interrupt_waiting);
    assert!(ctx.is_halted());
}

/// Raises the external interrupt whenever the DSP writes a hardware register
struct Doorbell(Arc<OnceLock<Arc<DspSignals>>>);

impl Hardware for Doorbell {
    fn read(&mut self, _addr: u16) -> u16 {
        0
    }

    fn write(&mut self, _addr: u16, _value: u16) {
        if let Some(signals) = self.0.get() {
            signals.request_interrupt();
        }
    }
}

#[test]
fn interrupt_raised_mid_run_stops_the_run() {
    let cell = Arc::new(OnceLock::new());
    let mut ctx = DspContext::new(Box::new(Doorbell(cell.clone())));
    let _ = cell.set(ctx.signals());
    // SBSET #11; SI @DMBH, #1; JMP 0x0003
    ctx.write_iram(0, &[0x1305, 0x16fc, 0x0001, 0x029f, 0x0003]);
    ctx.write_iram(14, &[0x0021]);

    let mut jit = jit();
    assert_eq!(jit.run_until_breakpoint(&mut ctx, 100, &Breakpoints::new()), StopReason::Interrupted);
    assert_eq!(ctx.pc, 3);
    assert_eq!(ctx.cycles_left, 97);

    assert_eq!(jit.run_for_cycles(&mut ctx, 100), 99);
    assert!(ctx.is_halted());
    assert_eq!(ctx.pc, 14);
    assert_eq!(ctx.regs.get(Reg::St0), 3);
}

#[test]
fn breakpoints_inside_a_block_are_single_stepped() {
    let mut ctx = load(&[(0, &[0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0021])]);
    let mut jit = jit();
    let breakpoints: Breakpoints = [3].into_iter().collect();

    assert_eq!(jit.run_until_breakpoint(&mut ctx, 100, &breakpoints), StopReason::Breakpoint(3));
    assert_eq!(ctx.pc, 3);
    assert_eq!(ctx.cycles_left, 97);

    assert_eq!(jit.run_until_breakpoint(&mut ctx, 100, &breakpoints), StopReason::Halted);
    assert_eq!(ctx.pc, 5);
    assert_eq!(ctx.cycles_left, 97);
}

#[test]
fn debugger_runs_stop_when_the_budget_does() {
    let mut ctx = load(&[(0, &[0x0000, 0x0000])]);
    let mut jit = jit();
    assert_eq!(jit.run_until_breakpoint(&mut ctx, 2, &Breakpoints::new()), StopReason::BudgetExhausted);
    assert!(ctx.cycles_left <= 0);
}
