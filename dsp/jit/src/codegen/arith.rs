use dsp::opcodes::Inst;
use dsp::regs::Reg;

use super::flags::{self, Carry};
use super::Emit;
use crate::compiler::Compiler;
use crate::host::{AluOp, Cond, ExtendKind, HostReg, Operand};
use crate::regcache::CacheReg;

const RAX: HostReg = HostReg::Rax;
const RDX: HostReg = HostReg::Rdx;

/// Value CLRP leaves in the packed product
const PROD_CLEARED: i64 = 0x0010_00ff_fff0_0000;

#[inline(always)]
fn acc_bit8(inst: Inst) -> u8 {
    ((inst.opc >> 8) & 1) as u8
}

#[inline(always)]
fn acc_bit11(inst: Inst) -> u8 {
    ((inst.opc >> 11) & 1) as u8
}

fn imm16_mid(inst: Inst) -> Operand {
    Operand::Imm((inst.imm as i16 as i64) << 16)
}

fn imm8_mid(inst: Inst) -> Operand {
    Operand::Imm((inst.opc as u8 as i8 as i64) << 16)
}

/// acc = wrap40(acc +/- operand) with full flags
fn add_to_acc(c: &mut Compiler<'_>, acc: u8, operand: Operand, kind: Carry) {
    let dst = c.acquire(CacheReg::Acc(acc), true);
    c.code.mov(RAX, dst);
    let op = if kind == Carry::Add { AluOp::Add } else { AluOp::Sub };
    c.code.alu(op, dst, operand);
    c.code.extend(ExtendKind::Sx40, dst);
    flags::arith_flags(c, RAX, operand, dst, kind);
    c.release(CacheReg::Acc(acc), true);
}

fn compare_acc(c: &mut Compiler<'_>, acc: u8, operand: Operand) {
    let value = c.acquire(CacheReg::Acc(acc), true);
    c.code.mov(RAX, value);
    c.code.mov(RDX, value);
    c.code.alu(AluOp::Sub, RDX, operand);
    c.code.extend(ExtendKind::Sx40, RDX);
    flags::arith_flags(c, RAX, operand, RDX, Carry::Sub);
    c.release(CacheReg::Acc(acc), false);
}

pub fn addi(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    add_to_acc(c, acc_bit8(inst), imm16_mid(inst), Carry::Add);
    Emit::Continue
}

pub fn addis(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    add_to_acc(c, acc_bit8(inst), imm8_mid(inst), Carry::Add);
    Emit::Continue
}

pub fn cmpi(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    compare_acc(c, acc_bit8(inst), imm16_mid(inst));
    Emit::Continue
}

pub fn cmpis(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    compare_acc(c, acc_bit8(inst), imm8_mid(inst));
    Emit::Continue
}

/// ANDI/ORI/XORI work on the middle word only; flags come from it and the whole accumulator
fn logic_mid(c: &mut Compiler<'_>, inst: Inst, op: AluOp) -> Emit {
    let reg = Reg::acm(acc_bit8(inst) as usize);
    let imm = inst.imm as i64;
    let mid = c.acquire(reg, true);
    let operand = if op == AluOp::And { imm | !0xffff } else { imm };
    c.code.alu(op, mid, operand);

    c.code.mov(RAX, mid);
    c.code.alu(AluOp::Rol, RAX, 16);
    c.code.mov(RDX, mid);
    c.code.extend(ExtendKind::Sx16, RDX);
    let sr = c.acquire(Reg::Sr, true);
    flags::update_sr16(c, sr, RDX, RAX);
    c.release(Reg::Sr, true);

    c.release(reg, true);
    Emit::Continue
}

pub fn andi(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    logic_mid(c, inst, AluOp::And)
}

pub fn ori(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    logic_mid(c, inst, AluOp::Or)
}

pub fn xori(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    logic_mid(c, inst, AluOp::Xor)
}

fn test_mid(c: &mut Compiler<'_>, inst: Inst, complement: bool) -> Emit {
    let reg = Reg::acm(acc_bit8(inst) as usize);
    let mid = c.acquire(reg, true);
    c.code.mov(RAX, mid);
    c.code.alu(AluOp::And, RAX, inst.imm as i64);
    if complement {
        c.code.cmp(RAX, inst.imm as i64);
    } else {
        c.code.test(RAX, RAX);
    }
    c.release(reg, false);
    flags::logic_zero_from(c, Cond::Eq);
    Emit::Continue
}

pub fn andf(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    test_mid(c, inst, false)
}

pub fn andcf(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    test_mid(c, inst, true)
}

// Extended arithmetic

pub fn add(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let dst = acc_bit8(inst);
    let src = c.acquire(CacheReg::Acc(1 - dst), true);
    add_to_acc(c, dst, src.into(), Carry::Add);
    c.release(CacheReg::Acc(1 - dst), false);
    Emit::Continue
}

pub fn sub(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let dst = acc_bit8(inst);
    let src = c.acquire(CacheReg::Acc(1 - dst), true);
    add_to_acc(c, dst, src.into(), Carry::Sub);
    c.release(CacheReg::Acc(1 - dst), false);
    Emit::Continue
}

pub fn addax(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let ax = CacheReg::Ax(((inst.opc >> 9) & 1) as u8);
    let src = c.acquire(ax, true);
    add_to_acc(c, acc_bit8(inst), src.into(), Carry::Add);
    c.release(ax, false);
    Emit::Continue
}

pub fn inc(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    add_to_acc(c, acc_bit8(inst), Operand::Imm(1), Carry::Add);
    Emit::Continue
}

pub fn dec(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    add_to_acc(c, acc_bit8(inst), Operand::Imm(1), Carry::Sub);
    Emit::Continue
}

pub fn mov(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let dst = acc_bit8(inst);
    let src = c.acquire(CacheReg::Acc(1 - dst), true);
    let value = c.acquire(CacheReg::Acc(dst), false);
    c.code.mov(value, src);
    flags::result_flags(c, value);
    c.release(CacheReg::Acc(dst), true);
    c.release(CacheReg::Acc(1 - dst), false);
    Emit::Continue
}

pub fn clr(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let acc = CacheReg::Acc(acc_bit11(inst));
    let value = c.acquire(acc, false);
    c.code.mov(value, 0);
    flags::result_flags(c, value);
    c.release(acc, true);
    Emit::Continue
}

pub fn tst(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let acc = CacheReg::Acc(acc_bit11(inst));
    let value = c.acquire(acc, true);
    flags::result_flags(c, value);
    c.release(acc, false);
    Emit::Continue
}

pub fn clrp(c: &mut Compiler<'_>, _inst: Inst) -> Emit {
    let prod = c.acquire(CacheReg::Prod, false);
    c.code.mov(prod, PROD_CLEARED);
    c.release(CacheReg::Prod, true);
    Emit::Continue
}
