//! SR flag computation and condition evaluation in host code.
//!
//! All routines use RAX and RCX as temporaries; callers keep their operands elsewhere.

use dsp::regs::{sr, Condition, Reg};

use crate::compiler::Compiler;
use crate::host::{AluOp, Cond, ExtendKind, HostReg, Operand};

const RAX: HostReg = HostReg::Rax;
const RCX: HostReg = HostReg::Rcx;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Carry {
    Add,
    Sub,
}

/// Sets RAX to 1 if `cond` holds for the current SR, 0 otherwise
pub(crate) fn condition_to_rax(c: &mut Compiler<'_>, cond: Condition) {
    if cond == Condition::Always {
        c.code.mov(RAX, 1);
        return;
    }
    let flags = c.acquire(Reg::Sr, true);

    match cond {
        Condition::Ge | Condition::L | Condition::G | Condition::Le => {
            // less = overflow != sign
            sr_bit(c, flags, RAX, 1);
            sr_bit(c, flags, RCX, 3);
            c.code.alu(AluOp::Xor, RAX, RCX);
            if matches!(cond, Condition::G | Condition::Le) {
                sr_bit(c, flags, RCX, 2);
                c.code.alu(AluOp::Or, RAX, RCX);
            }
        }
        Condition::Nz | Condition::Z => sr_bit(c, flags, RAX, 2),
        Condition::Nc | Condition::C => sr_bit(c, flags, RAX, 0),
        Condition::NotOverS32 | Condition::OverS32 => sr_bit(c, flags, RAX, 4),
        Condition::A | Condition::NotA => {
            sr_bit(c, flags, RAX, 4);
            sr_bit(c, flags, RCX, 5);
            c.code.alu(AluOp::Or, RAX, RCX);
            sr_bit(c, flags, RCX, 2);
            c.code.alu(AluOp::Xor, RCX, 1);
            c.code.alu(AluOp::And, RAX, RCX);
        }
        Condition::LogicNotZero | Condition::LogicZero => sr_bit(c, flags, RAX, 6),
        Condition::Overflow => sr_bit(c, flags, RAX, 1),
        Condition::Always => unreachable!(),
    }

    let inverted = matches!(
        cond,
        Condition::Ge
            | Condition::G
            | Condition::Nz
            | Condition::Nc
            | Condition::NotOverS32
            | Condition::NotA
            | Condition::LogicNotZero
    );
    if inverted {
        c.code.alu(AluOp::Xor, RAX, 1);
    }
    c.release(Reg::Sr, false);
}

/// Flags of `res = old + operand` or `res = old - operand`, with `res` already wrapped to 40 bits
pub(crate) fn arith_flags(c: &mut Compiler<'_>, old: HostReg, operand: Operand, res: HostReg, kind: Carry) {
    debug_assert!(res != RAX && res != RCX);
    let overflow = c.scratch();

    c.code.mov(RCX, old);
    c.code.alu(AluOp::Xor, RCX, res);
    match kind {
        Carry::Add => c.code.mov(overflow, operand),
        Carry::Sub => {
            c.code.mov(overflow, 0);
            c.code.alu(AluOp::Sub, overflow, operand);
        }
    }
    c.code.alu(AluOp::Xor, overflow, res);
    c.code.alu(AluOp::And, RCX, overflow);
    c.code.test(RCX, RCX);
    c.code.setcc(overflow, Cond::Sign);

    c.code.cmp(old, res);
    let carry = if kind == Carry::Add { Cond::Above } else { Cond::AboveEq };
    c.code.setcc(RCX, carry);

    let flags = c.acquire(Reg::Sr, true);
    update_sr64(c, flags, res, Some(RCX), Some(overflow));
    c.release(Reg::Sr, true);
    c.free_scratch(overflow);
}

/// Flags of a result with carry and overflow clear
pub(crate) fn result_flags(c: &mut Compiler<'_>, res: HostReg) {
    let flags = c.acquire(Reg::Sr, true);
    update_sr64(c, flags, res, None, None);
    c.release(Reg::Sr, true);
}

/// `carry` and `overflow` hold 0 or 1 and are consumed first, so either may be RCX
pub(crate) fn update_sr64(
    c: &mut Compiler<'_>,
    flags: HostReg,
    value: HostReg,
    carry: Option<HostReg>,
    overflow: Option<HostReg>,
) {
    c.code.alu(AluOp::And, flags, !(sr::CMP_MASK as i64));
    if let Some(carry) = carry {
        c.code.alu(AluOp::Or, flags, carry);
    }
    if let Some(overflow) = overflow {
        c.code.alu(AluOp::Shl, overflow, 1);
        c.code.alu(AluOp::Or, flags, overflow);
        c.code.alu(AluOp::Shl, overflow, 6);
        c.code.alu(AluOp::Or, flags, overflow);
    }

    c.code.test(value, value);
    set_flag(c, flags, Cond::Eq, 2);
    c.code.test(value, value);
    set_flag(c, flags, Cond::Sign, 3);

    c.code.mov(RAX, value);
    c.code.extend(ExtendKind::Sx32, RAX);
    c.code.cmp(RAX, value);
    set_flag(c, flags, Cond::Ne, 4);

    top_bits_agree(c, flags, value, 30);
}

/// Flags of a middle word result. `mid` holds it sign extended, `full` the whole accumulator.
pub(crate) fn update_sr16(c: &mut Compiler<'_>, flags: HostReg, mid: HostReg, full: HostReg) {
    debug_assert!(mid != RAX && mid != RCX && full != RCX);
    c.code.alu(AluOp::And, flags, !(sr::CMP_MASK as i64));

    c.code.mov(RCX, full);
    c.code.extend(ExtendKind::Sx32, RCX);
    c.code.cmp(RCX, full);
    c.code.setcc(RCX, Cond::Ne);
    c.code.alu(AluOp::Shl, RCX, 4);
    c.code.alu(AluOp::Or, flags, RCX);

    c.code.test(mid, mid);
    set_flag(c, flags, Cond::Eq, 2);
    c.code.test(mid, mid);
    set_flag(c, flags, Cond::Sign, 3);

    top_bits_agree(c, flags, mid, 14);
}

/// LZ from the host flags of the preceding compare
pub(crate) fn logic_zero_from(c: &mut Compiler<'_>, cond: Cond) {
    c.code.setcc(RCX, cond);
    let flags = c.acquire(Reg::Sr, true);
    c.code.alu(AluOp::And, flags, !(sr::LOGIC_ZERO as i64));
    c.code.alu(AluOp::Shl, RCX, 6);
    c.code.alu(AluOp::Or, flags, RCX);
    c.release(Reg::Sr, true);
}

fn sr_bit(c: &mut Compiler<'_>, flags: HostReg, dst: HostReg, n: i64) {
    c.code.mov(dst, flags);
    c.code.alu(AluOp::Shr, dst, n);
    c.code.alu(AluOp::And, dst, 1);
}

fn set_flag(c: &mut Compiler<'_>, flags: HostReg, cond: Cond, bit: i64) {
    c.code.setcc(RAX, cond);
    c.code.alu(AluOp::Shl, RAX, bit);
    c.code.alu(AluOp::Or, flags, RAX);
}

/// TB: bits `low` and `low + 1` of `value` are equal
fn top_bits_agree(c: &mut Compiler<'_>, flags: HostReg, value: HostReg, low: i64) {
    c.code.mov(RAX, value);
    c.code.alu(AluOp::Shr, RAX, low);
    c.code.mov(RCX, RAX);
    c.code.alu(AluOp::Shr, RCX, 1);
    c.code.alu(AluOp::Xor, RAX, RCX);
    c.code.alu(AluOp::And, RAX, 1);
    c.code.alu(AluOp::Xor, RAX, 1);
    c.code.alu(AluOp::Shl, RAX, 5);
    c.code.alu(AluOp::Or, flags, RAX);
}
