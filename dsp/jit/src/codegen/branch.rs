use dsp::analyzer::inst_size;
use dsp::opcodes::Inst;
use dsp::regs::{Reg, StackId};

use super::Emit;
use crate::compiler::Compiler;
use crate::host::{Helper, Operand, Slot, ARG0, RET_REG};

/// Taken path of a branch to `inst.imm`. A target right after a loop end still completes the
/// loop iteration, so that case skips linking.
fn taken_exit(c: &mut Compiler<'_>, inst: Inst) {
    let target = inst.imm;
    if target == inst.addr.wrapping_add(2) && c.handles_loop(inst) {
        c.code.store(Slot::Pc, target as i64);
        c.emit_exit_after(inst);
    } else {
        c.emit_branch_exit(target);
    }
}

/// Jcc/JMP: the taken path stores the target and tries to link to it
pub fn jcc(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    c.conditional(inst.cond(), |c| {
        taken_exit(c, inst);
        Emit::Exit
    })
}

pub fn callcc(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let ret = inst.addr.wrapping_add(2);
    c.conditional(inst.cond(), |c| {
        c.call_helper(Helper::PushStack(StackId::Call), &[(ARG0, Operand::Imm(ret as i64))]);
        taken_exit(c, inst);
        Emit::Exit
    })
}

pub fn retcc(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    c.conditional(inst.cond(), |c| {
        c.call_helper(Helper::PopStack(StackId::Call), &[]);
        c.code.store(Slot::Pc, RET_REG);
        c.emit_exit_after(inst);
        Emit::Exit
    })
}

/// JMPR/JRcc $arR
pub fn jrcc(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let reg = Reg::from_index((inst.opc >> 5) & 7);
    c.conditional(inst.cond(), |c| {
        let target = c.acquire(reg, true);
        c.code.store(Slot::Pc, target);
        c.release(reg, false);
        c.emit_exit_after(inst);
        Emit::Exit
    })
}

/// IFcc skips the next instruction when the condition fails. The block always ends after it,
/// with PC set to whichever instruction comes next. At a loop end only the executed path
/// completes the iteration.
pub fn ifcc(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let next = inst.addr.wrapping_add(1);
    let skipped = next.wrapping_add(inst_size(c.mem(), next));
    c.code.store(Slot::Pc, skipped as i64);
    c.conditional(inst.cond(), |c| {
        c.code.store(Slot::Pc, next as i64);
        Emit::Continue
    });
    c.emit_exit_after(inst);
    Emit::Exit
}
