use dsp::opcodes::{Inst, MrrOp, RegOp, ShortImmOp};
use dsp::regs::{sr, Reg};

use super::Emit;
use crate::compiler::Compiler;
use crate::host::{AluOp, Cond, ExtendKind, Helper, HostReg, Op, Operand, ARG0, ARG1, RET_REG};
use crate::regcache::CacheReg;

const RCX: HostReg = HostReg::Rcx;
const RDX: HostReg = HostReg::Rdx;

/// Copies the 16-bit value of `reg` into `dst`, zero extended
pub(crate) fn read_reg(c: &mut Compiler<'_>, reg: Reg, dst: HostReg) {
    let host = c.acquire(reg, true);
    c.code.mov(dst, host);
    c.code.extend(ExtendKind::Zx16, dst);
    c.release(reg, false);
}

/// Architectural register write of the low 16 bits of `src`, minus the stack push.
///
/// AC.M writes check SR at run time: in 40-bit mode the value is sign extended through AC.H
/// and AC.L is cleared.
pub(crate) fn write_reg(c: &mut Compiler<'_>, reg: Reg, src: HostReg) {
    debug_assert!(src != RCX);
    match reg {
        Reg::Acm0 | Reg::Acm1 => {
            let acc = CacheReg::Acc(reg.index() as u8 - Reg::Acm0 as u8);
            let value = c.acquire(acc, true);
            let flags = c.acquire(Reg::Sr, true);
            c.code.test(flags, sr::MODE_40BIT as i64);
            c.release(Reg::Sr, false);

            let narrow = c.code.new_label();
            let done = c.code.new_label();
            c.code.jump(Cond::Eq, narrow);
            c.code.mov(RCX, src);
            c.code.extend(ExtendKind::Sx16, RCX);
            c.code.alu(AluOp::Shl, RCX, 16);
            c.code.mov(value, RCX);
            c.code.jump(Cond::Always, done);
            c.code.bind(narrow);
            c.code.alu(AluOp::Ror, value, 16);
            c.code.emit(Op::Insert16 { dst: value, src });
            c.code.alu(AluOp::Rol, value, 16);
            c.code.bind(done);
            c.release(acc, true);
        }
        _ if CacheReg::from(reg).slice_of().is_some() => {
            let host = c.acquire(reg, true);
            c.code.emit(Op::Insert16 { dst: host, src });
            c.release(reg, true);
        }
        _ => {
            let host = c.acquire(reg, false);
            c.code.mov(host, src);
            c.code.extend(ExtendKind::Zx16, host);
            c.release(reg, true);
        }
    }
}

fn reg_field(inst: Inst) -> Reg {
    Reg::from_index(RegOp::from(inst.opc).reg() as u16)
}

pub fn lri(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let reg = reg_field(inst);
    if reg.is_stack() {
        return Emit::Decline;
    }
    c.code.mov(RDX, inst.imm as i64);
    write_reg(c, reg, RDX);
    Emit::Continue
}

pub fn lris(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let op = ShortImmOp::from(inst.opc);
    let reg = Reg::from_index(0x18 + op.reg() as u16);
    c.code.mov(RDX, op.imm() as i8 as u16 as i64);
    write_reg(c, reg, RDX);
    Emit::Continue
}

pub fn mrr(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let op = MrrOp::from(inst.opc);
    let src = Reg::from_index(op.src() as u16);
    let dst = Reg::from_index(op.dst() as u16);
    if src.is_stack() || dst.is_stack() {
        return Emit::Decline;
    }
    read_reg(c, src, RDX);
    write_reg(c, dst, RDX);
    Emit::Continue
}

pub fn lr(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let reg = reg_field(inst);
    if reg.is_stack() {
        return Emit::Decline;
    }
    c.call_helper(Helper::ReadData, &[(ARG0, Operand::Imm(inst.imm as i64))]);
    c.code.mov(RDX, RET_REG);
    write_reg(c, reg, RDX);
    Emit::Continue
}

pub fn sr(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let reg = reg_field(inst);
    if reg.is_stack() {
        return Emit::Decline;
    }
    read_reg(c, reg, RDX);
    c.call_helper(
        Helper::WriteData,
        &[(ARG1, Operand::Reg(RDX)), (ARG0, Operand::Imm(inst.imm as i64))],
    );
    Emit::Continue
}

pub fn si(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let addr = inst.opc as u8 as i8 as u16;
    c.call_helper(
        Helper::WriteData,
        &[(ARG0, Operand::Imm(addr as i64)), (ARG1, Operand::Imm(inst.imm as i64))],
    );
    Emit::Continue
}
