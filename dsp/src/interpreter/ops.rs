use common::util::wrap40;

use crate::analyzer::inst_size;
use crate::context::{DspContext, CR_HALT};
use crate::opcodes::{IndirectOp, Inst, MrrOp, RegOp, ShortImmOp};
use crate::regs::{
    is_carry_add, is_carry_sub, is_over_s32, is_overflow, sr, update_sr16, update_sr64, Reg, StackId,
};

#[inline(always)]
fn acc_bit8(inst: Inst) -> usize {
    ((inst.opc >> 8) & 1) as usize
}

#[inline(always)]
fn acc_bit11(inst: Inst) -> usize {
    ((inst.opc >> 11) & 1) as usize
}

fn set_flags64(ctx: &mut DspContext, value: i64, carry: bool, overflow: bool) {
    let mut flags = ctx.regs.sr();
    update_sr64(&mut flags, value, carry, overflow);
    ctx.regs.set_sr(flags);
}

fn set_flags16(ctx: &mut DspContext, acc: usize) {
    let mut flags = ctx.regs.sr();
    let mid = ctx.regs.get(Reg::acm(acc)) as i16;
    update_sr16(&mut flags, mid, is_over_s32(ctx.regs.acc(acc)));
    ctx.regs.set_sr(flags);
}

fn add_acc(ctx: &mut DspContext, acc: usize, operand: i64) {
    let old = ctx.regs.acc(acc);
    let res = wrap40(old.wrapping_add(operand));
    ctx.regs.set_acc(acc, res);
    set_flags64(ctx, res, is_carry_add(old, res), is_overflow(old, operand, res));
}

fn sub_acc(ctx: &mut DspContext, acc: usize, operand: i64) {
    let old = ctx.regs.acc(acc);
    let res = wrap40(old.wrapping_sub(operand));
    ctx.regs.set_acc(acc, res);
    set_flags64(ctx, res, is_carry_sub(old, res), is_overflow(old, operand.wrapping_neg(), res));
}

fn compare_acc(ctx: &mut DspContext, acc: usize, operand: i64) {
    let old = ctx.regs.acc(acc);
    let res = wrap40(old.wrapping_sub(operand));
    set_flags64(ctx, res, is_carry_sub(old, res), is_overflow(old, operand.wrapping_neg(), res));
}

fn step_ar(ctx: &mut DspContext, ar: usize, mode: u8) {
    let value = match mode {
        0 => return,
        1 => ctx.regs.decrement_ar(ar),
        2 => ctx.regs.increment_ar(ar),
        _ => {
            let ix = ctx.regs.get(Reg::from_index(4 + ar as u16)) as i16;
            ctx.regs.increase_ar(ar, ix)
        }
    };
    ctx.regs.set(Reg::from_index(ar as u16), value);
}

pub fn unknown(_ctx: &mut DspContext, inst: Inst) {
    log::warn!("Unknown opcode {:04x} at {:04x}", inst.opc, inst.addr);
}

pub fn nop(_ctx: &mut DspContext, _inst: Inst) {}

// Address register arithmetic

pub fn dar(ctx: &mut DspContext, inst: Inst) {
    step_ar(ctx, (inst.opc & 3) as usize, 1);
}

pub fn iar(ctx: &mut DspContext, inst: Inst) {
    step_ar(ctx, (inst.opc & 3) as usize, 2);
}

pub fn subarn(ctx: &mut DspContext, inst: Inst) {
    let ar = (inst.opc & 3) as usize;
    let ix = ctx.regs.get(Reg::from_index(4 + ar as u16)) as i16;
    let value = ctx.regs.increase_ar(ar, ix.wrapping_neg());
    ctx.regs.set(Reg::from_index(ar as u16), value);
}

pub fn addarn(ctx: &mut DspContext, inst: Inst) {
    let ar = (inst.opc & 3) as usize;
    let ix = ctx.regs.get(Reg::from_index(4 + ((inst.opc >> 2) & 3))) as i16;
    let value = ctx.regs.increase_ar(ar, ix);
    ctx.regs.set(Reg::from_index(ar as u16), value);
}

// Control flow

pub fn halt(ctx: &mut DspContext, inst: Inst) {
    ctx.control |= CR_HALT;
    ctx.pc = inst.addr;
}

fn start_loop(ctx: &mut DspContext, end: u16, count: u16) {
    if count != 0 {
        let start = ctx.pc;
        ctx.regs.push_stack(StackId::Call, start);
        ctx.regs.push_stack(StackId::LoopAddress, end);
        ctx.regs.push_stack(StackId::LoopCounter, count);
    } else {
        ctx.pc = end.wrapping_add(inst_size(&ctx.mem, end));
    }
}

pub fn loop_reg(ctx: &mut DspContext, inst: Inst) {
    let count = ctx.regs.read(Reg::from_index(RegOp::from(inst.opc).reg() as u16));
    let end = ctx.pc;
    start_loop(ctx, end, count);
}

pub fn loopi(ctx: &mut DspContext, inst: Inst) {
    let end = ctx.pc;
    start_loop(ctx, end, inst.opc & 0xff);
}

pub fn bloop_reg(ctx: &mut DspContext, inst: Inst) {
    let count = ctx.regs.read(Reg::from_index(RegOp::from(inst.opc).reg() as u16));
    start_loop(ctx, inst.imm, count);
}

pub fn bloopi(ctx: &mut DspContext, inst: Inst) {
    start_loop(ctx, inst.imm, inst.opc & 0xff);
}

pub fn ifcc(ctx: &mut DspContext, inst: Inst) {
    if !inst.cond().check(ctx.regs.sr()) {
        ctx.pc = ctx.pc.wrapping_add(inst_size(&ctx.mem, ctx.pc));
    }
}

pub fn jcc(ctx: &mut DspContext, inst: Inst) {
    if inst.cond().check(ctx.regs.sr()) {
        ctx.pc = inst.imm;
    }
}

pub fn callcc(ctx: &mut DspContext, inst: Inst) {
    if inst.cond().check(ctx.regs.sr()) {
        ctx.regs.push_stack(StackId::Call, ctx.pc);
        ctx.pc = inst.imm;
    }
}

pub fn retcc(ctx: &mut DspContext, inst: Inst) {
    if inst.cond().check(ctx.regs.sr()) {
        ctx.pc = ctx.regs.pop_stack(StackId::Call);
    }
}

pub fn rti(ctx: &mut DspContext, _inst: Inst) {
    let flags = ctx.regs.pop_stack(StackId::Data);
    ctx.regs.set_sr(flags);
    ctx.pc = ctx.regs.pop_stack(StackId::Call);
}

pub fn jrcc(ctx: &mut DspContext, inst: Inst) {
    if inst.cond().check(ctx.regs.sr()) {
        ctx.pc = ctx.regs.get(Reg::from_index((inst.opc >> 5) & 7));
    }
}

pub fn callrcc(ctx: &mut DspContext, inst: Inst) {
    if inst.cond().check(ctx.regs.sr()) {
        let target = ctx.regs.get(Reg::from_index((inst.opc >> 5) & 7));
        ctx.regs.push_stack(StackId::Call, ctx.pc);
        ctx.pc = target;
    }
}

pub fn sbclr(ctx: &mut DspContext, inst: Inst) {
    let bit = (inst.opc & 7) + 6;
    ctx.regs.set_sr(ctx.regs.sr() & !(1 << bit));
}

pub fn sbset(ctx: &mut DspContext, inst: Inst) {
    let bit = (inst.opc & 7) + 6;
    ctx.regs.set_sr(ctx.regs.sr() | (1 << bit));
}

pub fn set16(ctx: &mut DspContext, _inst: Inst) {
    ctx.regs.set_sr(ctx.regs.sr() & !sr::MODE_40BIT);
}

pub fn set40(ctx: &mut DspContext, _inst: Inst) {
    ctx.regs.set_sr(ctx.regs.sr() | sr::MODE_40BIT);
}

// Loads and stores

pub fn lri(ctx: &mut DspContext, inst: Inst) {
    let reg = Reg::from_index(RegOp::from(inst.opc).reg() as u16);
    ctx.regs.write(reg, inst.imm);
}

pub fn lris(ctx: &mut DspContext, inst: Inst) {
    let op = ShortImmOp::from(inst.opc);
    let reg = Reg::from_index(0x18 + op.reg() as u16);
    ctx.regs.write(reg, op.imm() as i8 as u16);
}

pub fn lr(ctx: &mut DspContext, inst: Inst) {
    let reg = Reg::from_index(RegOp::from(inst.opc).reg() as u16);
    let value = ctx.mem.read_data(inst.imm);
    ctx.regs.write(reg, value);
}

pub fn sr(ctx: &mut DspContext, inst: Inst) {
    let reg = Reg::from_index(RegOp::from(inst.opc).reg() as u16);
    let value = ctx.regs.read(reg);
    ctx.mem.write_data(inst.imm, value);
}

pub fn si(ctx: &mut DspContext, inst: Inst) {
    let addr = inst.opc as u8 as i8 as u16;
    ctx.mem.write_data(addr, inst.imm);
}

pub fn lrs(ctx: &mut DspContext, inst: Inst) {
    let op = ShortImmOp::from(inst.opc);
    let addr = (ctx.regs.get(Reg::Cr) << 8) | op.imm() as u16;
    let value = ctx.mem.read_data(addr);
    ctx.regs.write(Reg::from_index(0x18 + op.reg() as u16), value);
}

pub fn srs(ctx: &mut DspContext, inst: Inst) {
    let op = ShortImmOp::from(inst.opc);
    let addr = (ctx.regs.get(Reg::Cr) << 8) | op.imm() as u16;
    let value = ctx.regs.get(Reg::from_index(0x18 + op.reg() as u16));
    ctx.mem.write_data(addr, value);
}

pub fn lrr(ctx: &mut DspContext, inst: Inst) {
    let op = IndirectOp::from(inst.opc);
    let ar = op.ar() as usize;
    let value = ctx.mem.read_data(ctx.regs.get(Reg::from_index(ar as u16)));
    ctx.regs.write(Reg::from_index(op.reg() as u16), value);
    step_ar(ctx, ar, op.mode());
}

pub fn srr(ctx: &mut DspContext, inst: Inst) {
    let op = IndirectOp::from(inst.opc);
    let ar = op.ar() as usize;
    let value = ctx.regs.read(Reg::from_index(op.reg() as u16));
    let addr = ctx.regs.get(Reg::from_index(ar as u16));
    ctx.mem.write_data(addr, value);
    step_ar(ctx, ar, op.mode());
}

pub fn ilrr(ctx: &mut DspContext, inst: Inst) {
    let ar = (inst.opc & 3) as usize;
    let value = ctx.mem.read_instruction(ctx.regs.get(Reg::from_index(ar as u16)));
    ctx.regs.write(Reg::acm(acc_bit8(inst)), value);
    step_ar(ctx, ar, ((inst.opc >> 2) & 3) as u8);
}

pub fn mrr(ctx: &mut DspContext, inst: Inst) {
    let op = MrrOp::from(inst.opc);
    let value = ctx.regs.read(Reg::from_index(op.src() as u16));
    ctx.regs.write(Reg::from_index(op.dst() as u16), value);
}

// Accumulator immediates

pub fn addi(ctx: &mut DspContext, inst: Inst) {
    add_acc(ctx, acc_bit8(inst), (inst.imm as i16 as i64) << 16);
}

pub fn addis(ctx: &mut DspContext, inst: Inst) {
    add_acc(ctx, acc_bit8(inst), (inst.opc as u8 as i8 as i64) << 16);
}

pub fn cmpi(ctx: &mut DspContext, inst: Inst) {
    compare_acc(ctx, acc_bit8(inst), (inst.imm as i16 as i64) << 16);
}

pub fn cmpis(ctx: &mut DspContext, inst: Inst) {
    compare_acc(ctx, acc_bit8(inst), (inst.opc as u8 as i8 as i64) << 16);
}

fn logic_mid(ctx: &mut DspContext, inst: Inst, f: fn(u16, u16) -> u16) {
    let acc = acc_bit8(inst);
    let mid = ctx.regs.get(Reg::acm(acc));
    ctx.regs.set(Reg::acm(acc), f(mid, inst.imm));
    set_flags16(ctx, acc);
}

pub fn xori(ctx: &mut DspContext, inst: Inst) {
    logic_mid(ctx, inst, |a, b| a ^ b);
}

pub fn andi(ctx: &mut DspContext, inst: Inst) {
    logic_mid(ctx, inst, |a, b| a & b);
}

pub fn ori(ctx: &mut DspContext, inst: Inst) {
    logic_mid(ctx, inst, |a, b| a | b);
}

fn set_logic_zero(ctx: &mut DspContext, zero: bool) {
    let flags = ctx.regs.sr();
    ctx.regs.set_sr(if zero { flags | sr::LOGIC_ZERO } else { flags & !sr::LOGIC_ZERO });
}

pub fn andf(ctx: &mut DspContext, inst: Inst) {
    let mid = ctx.regs.get(Reg::acm(acc_bit8(inst)));
    set_logic_zero(ctx, mid & inst.imm == 0);
}

pub fn andcf(ctx: &mut DspContext, inst: Inst) {
    let mid = ctx.regs.get(Reg::acm(acc_bit8(inst)));
    set_logic_zero(ctx, mid & inst.imm == inst.imm);
}

// Extended arithmetic

pub fn clr(ctx: &mut DspContext, inst: Inst) {
    ctx.regs.set_acc(acc_bit11(inst), 0);
    set_flags64(ctx, 0, false, false);
}

pub fn tst(ctx: &mut DspContext, inst: Inst) {
    let value = ctx.regs.acc(acc_bit11(inst));
    set_flags64(ctx, value, false, false);
}

pub fn add(ctx: &mut DspContext, inst: Inst) {
    let dst = acc_bit8(inst);
    let other = ctx.regs.acc(1 - dst);
    add_acc(ctx, dst, other);
}

pub fn sub(ctx: &mut DspContext, inst: Inst) {
    let dst = acc_bit8(inst);
    let other = ctx.regs.acc(1 - dst);
    sub_acc(ctx, dst, other);
}

pub fn addax(ctx: &mut DspContext, inst: Inst) {
    let ax = ctx.regs.ax(((inst.opc >> 9) & 1) as usize);
    add_acc(ctx, acc_bit8(inst), ax);
}

pub fn addp(ctx: &mut DspContext, inst: Inst) {
    let prod = long_prod(ctx);
    add_acc(ctx, acc_bit8(inst), prod);
}

pub fn inc(ctx: &mut DspContext, inst: Inst) {
    add_acc(ctx, acc_bit8(inst), 1);
}

pub fn dec(ctx: &mut DspContext, inst: Inst) {
    sub_acc(ctx, acc_bit8(inst), 1);
}

pub fn mov(ctx: &mut DspContext, inst: Inst) {
    let dst = acc_bit8(inst);
    let value = ctx.regs.acc(1 - dst);
    ctx.regs.set_acc(dst, value);
    set_flags64(ctx, value, false, false);
}

pub fn movr(ctx: &mut DspContext, inst: Inst) {
    let src = Reg::from_index(0x18 + ((inst.opc >> 9) & 3));
    let value = (ctx.regs.get(src) as i16 as i64) << 16;
    ctx.regs.set_acc(acc_bit8(inst), value);
    set_flags64(ctx, value, false, false);
}

/// The product as one value: the two middle parts are summed
pub fn long_prod(ctx: &DspContext) -> i64 {
    let high = ctx.regs.get(Reg::ProdH) as u8 as i8 as i64;
    let mid = ctx.regs.get(Reg::ProdM1) as i64 + ctx.regs.get(Reg::ProdM2) as i64;
    (high << 32) + ((mid << 16) | ctx.regs.get(Reg::ProdL) as i64)
}

pub fn clrp(ctx: &mut DspContext, _inst: Inst) {
    ctx.regs.set_prod_raw(0x0010_00ff_fff0_0000);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(opc: u16, imm: u16) -> Inst {
        Inst { opc, imm, addr: 0 }
    }

    #[test]
    fn andcf_and_andf() {
        let mut ctx = DspContext::default();
        ctx.regs.set(Reg::Acm1, 0x8001);
        andcf(&mut ctx, inst(0x03c0, 0x8000));
        assert!(ctx.regs.sr_flag(sr::LOGIC_ZERO));
        andf(&mut ctx, inst(0x03a0, 0x8000));
        assert!(!ctx.regs.sr_flag(sr::LOGIC_ZERO));
        andf(&mut ctx, inst(0x03a0, 0x0002));
        assert!(ctx.regs.sr_flag(sr::LOGIC_ZERO));
    }

    #[test]
    fn cleared_product_sums_to_zero() {
        let mut ctx = DspContext::default();
        clrp(&mut ctx, inst(0x8400, 0));
        assert_eq!(long_prod(&ctx), 0);
        ctx.regs.set_acc(0, 0x1234);
        addp(&mut ctx, inst(0x4e00, 0));
        assert_eq!(ctx.regs.acc(0), 0x1234);
    }

    #[test]
    fn compare_leaves_accumulator() {
        let mut ctx = DspContext::default();
        ctx.regs.set_acc(0, 0x3_0000);
        cmpi(&mut ctx, inst(0x0280, 0x0003));
        assert_eq!(ctx.regs.acc(0), 0x3_0000);
        assert!(ctx.regs.sr_flag(sr::ARITH_ZERO));
        cmpis(&mut ctx, inst(0x0604, 0));
        assert!(ctx.regs.sr_flag(sr::SIGN));
    }

    #[test]
    fn indirect_loads_step_address() {
        let mut ctx = DspContext::default();
        ctx.mem.write_data(0x0100, 0xbeef);
        ctx.regs.set(Reg::Ar1, 0x0100);
        ctx.regs.set(Reg::Wr1, 0xffff);
        // LRRI $ax0.h, @$ar1
        lrr(&mut ctx, inst(0x193a, 0));
        assert_eq!(ctx.regs.get(Reg::Axh0), 0xbeef);
        assert_eq!(ctx.regs.get(Reg::Ar1), 0x0101);
    }
}
