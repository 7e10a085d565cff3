use crate::context::DspContext;
use crate::opcodes::Inst;
use crate::regs::Reg;

// Extension opcodes never write registers directly. Everything goes through the write back
// log so the main opcode sees the values from before the instruction.

fn ar_of(inst: Inst) -> usize {
    (inst.opc & 3) as usize
}

pub fn nop(_ctx: &mut DspContext, _inst: Inst) {}

pub fn dr(ctx: &mut DspContext, inst: Inst) {
    let ar = ar_of(inst);
    let value = ctx.regs.decrement_ar(ar);
    ctx.write_back.push(Reg::from_index(ar as u16), value);
}

pub fn ir(ctx: &mut DspContext, inst: Inst) {
    let ar = ar_of(inst);
    let value = ctx.regs.increment_ar(ar);
    ctx.write_back.push(Reg::from_index(ar as u16), value);
}

pub fn nr(ctx: &mut DspContext, inst: Inst) {
    let ar = ar_of(inst);
    let ix = ctx.regs.get(Reg::from_index(4 + ar as u16)) as i16;
    let value = ctx.regs.increase_ar(ar, ix);
    ctx.write_back.push(Reg::from_index(ar as u16), value);
}

/// MV $axD.D, $acS.S
pub fn mv(ctx: &mut DspContext, inst: Inst) {
    let src = Reg::from_index(0x1c + (inst.opc & 3));
    let dst = Reg::from_index(0x18 + ((inst.opc >> 2) & 3));
    ctx.write_back.push(dst, ctx.regs.get(src));
}

fn load(ctx: &mut DspContext, inst: Inst, post_index: bool) {
    let ar = ar_of(inst);
    let dst = Reg::from_index(0x18 + ((inst.opc >> 3) & 7));
    let value = ctx.mem.read_data(ctx.regs.get(Reg::from_index(ar as u16)));
    ctx.write_back.push(dst, value);
    let next = if post_index {
        let ix = ctx.regs.get(Reg::from_index(4 + ar as u16)) as i16;
        ctx.regs.increase_ar(ar, ix)
    } else {
        ctx.regs.increment_ar(ar)
    };
    ctx.write_back.push(Reg::from_index(ar as u16), next);
}

/// L $axD.D, @$arS
pub fn l(ctx: &mut DspContext, inst: Inst) {
    load(ctx, inst, false);
}

/// LN $axD.D, @$arS
pub fn ln(ctx: &mut DspContext, inst: Inst) {
    load(ctx, inst, true);
}
