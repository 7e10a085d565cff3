//! Whole programs must leave the DSP in the same state whether they run compiled or
//! interpreted, under every translator configuration.

use dsp::interpreter;
use dsp::DspContext;
use jit::codegen::JitTable;
use jit::{Jit, JitConfig};

const BUDGET: i32 = 100_000;

fn load(code: &[u16]) -> DspContext {
    let mut ctx = DspContext::default();
    ctx.write_iram(0, code);
    ctx
}

fn configs() -> Vec<(&'static str, JitConfig, JitTable)> {
    let base = JitConfig::default();
    vec![
        ("default", base.clone(), JitTable::new()),
        ("unpinned", JitConfig { pin_composites: false, ..base.clone() }, JitTable::new()),
        ("unlinked", JitConfig { link_blocks: false, ..base.clone() }, JitTable::new()),
        ("single", JitConfig { max_block_size: 1, ..base.clone() }, JitTable::new()),
        ("portable", JitConfig { native_code: false, ..base.clone() }, JitTable::new()),
        ("interpreted", base, JitTable::interpreter_only()),
    ]
}

fn check(code: &[u16], data: &[u16]) {
    let mut expected = load(code);
    interpreter::run_cycles(&mut expected, BUDGET);
    assert!(expected.is_halted(), "program does not halt under the interpreter");

    for (name, config, table) in configs() {
        let mut ctx = load(code);
        let mut jit = Jit::with_table(config, table).unwrap();
        jit.run_for_cycles(&mut ctx, BUDGET);
        assert!(ctx.is_halted(), "{}: program did not halt", name);
        assert_eq!(ctx.pc, expected.pc, "{}: pc", name);
        assert_eq!(ctx.regs, expected.regs, "{}: registers", name);
        for &addr in data {
            assert_eq!(ctx.mem.read_data(addr), expected.mem.read_data(addr), "{}: dram {:04x}", name, addr);
        }
    }
}

#[test]
fn countdown_with_flags_and_memory() {
    check(
        &[
            0x0e03, // LRIS $AC0.M, #3
            0x009f, 0x0001, // LRI $AC1.M, #1
            0x5c00, // SUB $AC0, $AC1
            0x0294, 0x0003, // JNZ 0x0003
            0x0200, 0x7fff, // ADDI $AC0, #0x7fff
            0x0260, 0x00f0, // ORI $AC0, #0x00f0
            0x02c0, 0x00f0, // ANDCF $AC0, #0x00f0
            0x027d, // IFLZ
            0x7700, // INC $AC1
            0xb100, // TST $AC0
            0x00fe, 0x0010, // SR @0x0010, $AC0.M
            0x00da, 0x0010, // LR $AX0.H, @0x0010
            0x4900, // ADDAX $AC1, $AX0
            0x0021, // HALT
        ],
        &[0x0010],
    );
}

#[test]
fn loops_calls_and_extensions() {
    check(
        &[
            0x1004, // LOOPI #4
            0x7612, // INC $AC0 : MV $AX0.L, $AC0.M
            0x1103, 0x0005, // BLOOPI #3, 0x0005
            0x0502, // ADDIS $AC1, #2
            0x7b00, // DEC $AC1
            0x02bf, 0x000a, // CALL 0x000a
            0x0021, // HALT
            0x0000, // NOP
            0x8140, // CLR $AC0 : L $AX0.L, @$AR0
            0x8f00, // SET40
            0x0eff, // LRIS $AC0.M, #-1
            0x02df, // RET
        ],
        &[],
    );
}

#[test]
fn forty_bit_mode_and_register_moves() {
    check(
        &[
            0x009e, 0x8000, // LRI $AC0.M, #0x8000
            0x8f00, // SET40
            0x009f, 0x8000, // LRI $AC1.M, #0x8000
            0x1fde, // MRR $AC0.M, $AC0.M
            0x1f1f, // MRR $AX0.L, $AC1.M
            0x0098, 0x1234, // LRI $AX0.L, #0x1234
            0x009a, 0xfedc, // LRI $AX0.H, #0xfedc
            0x4800, // ADDAX $AC0, $AX0
            0x0090, 0x00f3, // LRI $AC0.H, #0x00f3
            0x6d00, // MOV $AC1, $AC0
            0x0280, 0x0001, // CMPI $AC0, #1
            0x0601, // CMPIS $AC0, #1
            0x0220, 0xffff, // XORI $AC0, #0xffff
            0x0240, 0x0f0f, // ANDI $AC0, #0x0f0f
            0x02a0, 0x0001, // ANDF $AC0, #1
            0x8400, // CLRP
            0x8e00, // SET16
            0x1306, // SBSET #12
            0x1206, // SBCLR #12
            0x0021, // HALT
        ],
        &[],
    );
}

#[test]
fn conditional_returns_and_register_jumps() {
    check(
        &[
            0x0080, 0x0009, // LRI $AR0, #0x0009
            0x02b5, 0x000c, // CALLZ 0x000c, not taken
            0x8100, // CLR $AC0
            0x02b5, 0x000c, // CALLZ 0x000c
            0x170f, // JMPR $AR0
            0x0021, // HALT (skipped)
            0x0021, // HALT
            0x0000, // NOP
            0x0000, // NOP
            0x0401, // ADDIS $AC0, #1
            0x02d4, // RETNZ
            0x0021, // HALT (not reached)
        ],
        &[],
    );
}

#[test]
fn ifcc_taken_at_loop_end_goes_around() {
    check(
        &[
            0x1103, 0x0003, // BLOOPI #3, 0x0003
            0x7600, // INC $AC0
            0x0274, // IFNZ, loop end
            0x0000, // NOP
            0x0021, // HALT
        ],
        &[],
    );
}

#[test]
fn ifcc_at_loop_end_taken_then_skipping() {
    check(
        &[
            0x009c, 0x0002, // LRI $AC0.L, #2
            0x1104, 0x0006, // BLOOPI #4, 0x0006
            0x7700, // INC $AC1
            0x7a00, // DEC $AC0
            0x0274, // IFNZ, loop end: executes once, then skips out of the loop
            0x0501, // ADDIS $AC1, #1
            0x0021, // HALT
        ],
        &[],
    );
}

#[test]
fn jcc_at_loop_end_falls_through_then_leaves() {
    check(
        &[
            0x009c, 0x0002, // LRI $AC0.L, #2
            0x1104, 0x0007, // BLOOPI #4, 0x0007
            0x7700, // INC $AC1
            0x7a00, // DEC $AC0
            0x0000, // NOP
            0x0295, 0x000a, // JZ 0x000a, loop end
            0x0021, // HALT (not reached)
            0x0501, // ADDIS $AC1, #1
            0x0021, // HALT
        ],
        &[],
    );
}

#[test]
fn jcc_at_loop_end_onto_the_next_instruction() {
    check(
        &[
            0x009c, 0x0003, // LRI $AC0.L, #3
            0x1103, 0x0005, // BLOOPI #3, 0x0005
            0x7a00, // DEC $AC0
            0x0294, 0x0007, // JNZ 0x0007, loop end: taken twice, to the fall through address
            0x7700, // INC $AC1
            0x0021, // HALT
        ],
        &[],
    );
}

#[test]
fn retcc_at_loop_end() {
    check(
        &[
            0x02bf, 0x0004, // CALL 0x0004
            0x7700, // INC $AC1
            0x0021, // HALT
            0x009c, 0x0002, // LRI $AC0.L, #2
            0x1104, 0x0009, // BLOOPI #4, 0x0009
            0x7a00, // DEC $AC0
            0x02d5, // RETZ, loop end: not taken, taken to the loop start, not taken
            0x0021, // HALT (not reached)
        ],
        &[],
    );
}

#[test]
fn jrcc_at_loop_end() {
    check(
        &[
            0x0080, 0x0008, // LRI $AR0, #0x0008
            0x1103, 0x0007, // BLOOPI #3, 0x0007
            0x7700, // INC $AC1
            0x7600, // INC $AC0
            0x0000, // NOP
            0x1704, // JRNZ $AR0, loop end: always taken, to the fall through address
            0x0080, 0x0010, // LRI $AR0, #0x0010
            0x1103, 0x000d, // BLOOPI #3, 0x000d
            0x7a00, // DEC $AC0
            0x1705, // JRZ $AR0, loop end: not taken twice, then taken out of the loop
            0x0021, // HALT (not reached)
            0x0021, // HALT (not reached)
            0x7700, // INC $AC1
            0x0021, // HALT
        ],
        &[],
    );
}
