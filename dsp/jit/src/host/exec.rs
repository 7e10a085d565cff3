use common::util::sign_extend;
use dsp::interpreter;
use dsp::DspContext;

use super::{AluOp, Backend, CodeArena, CodePtr, Cond, Emitter, ExtendKind, Helper, HostReg, Installed, Op, Operand};
use super::{Slot, Target, ARG0, ARG1, RET_REG};

/// Value left in caller saved registers after a helper call
const POISON: u64 = 0xdead_beef_dead_beef;

#[derive(Default, Copy, Clone, Debug)]
struct Flags {
    zf: bool,
    sf: bool,
    cf: bool,
    of: bool,
}

impl Flags {
    fn check(&self, cond: Cond) -> bool {
        match cond {
            Cond::Always => true,
            Cond::Eq => self.zf,
            Cond::Ne => !self.zf,
            Cond::Lt => self.sf != self.of,
            Cond::Ge => self.sf == self.of,
            Cond::Le => self.zf || self.sf != self.of,
            Cond::Gt => !self.zf && self.sf == self.of,
            Cond::Below => self.cf,
            Cond::AboveEq => !self.cf,
            Cond::Above => !self.cf && !self.zf,
            Cond::BelowEq => self.cf || self.zf,
            Cond::Sign => self.sf,
            Cond::NotSign => !self.sf,
        }
    }
}

/// Runs compiled code against a guest context.
pub struct HostCpu {
    regs: [u64; 16],
    flags: Flags,
    stack: Vec<u64>,
    /// When false, `LinkJump` falls through to the block's own exit
    pub allow_links: bool,
    pub links_taken: u64,
}

impl HostCpu {
    pub fn new() -> HostCpu {
        HostCpu {
            regs: [0; 16],
            flags: Flags::default(),
            stack: Vec::new(),
            allow_links: true,
            links_taken: 0,
        }
    }

    pub fn reg(&self, reg: HostReg) -> u64 {
        self.regs[reg.index()]
    }

    #[inline(always)]
    fn operand(&self, operand: Operand) -> u64 {
        match operand {
            Operand::Reg(reg) => self.regs[reg.index()],
            Operand::Imm(imm) => imm as u64,
        }
    }

    fn read_slot(ctx: &DspContext, slot: Slot) -> u64 {
        match slot {
            Slot::Reg(reg) => ctx.regs.get(reg) as u64,
            Slot::Pc => ctx.pc as u64,
            Slot::CyclesLeft => ctx.cycles_left as i64 as u64,
            Slot::Exceptions => ctx.exceptions as u64,
        }
    }

    fn write_slot(ctx: &mut DspContext, slot: Slot, value: u64) {
        match slot {
            Slot::Reg(reg) => ctx.regs.store_slot(reg.index(), value as u16),
            Slot::Pc => ctx.pc = value as u16,
            Slot::CyclesLeft => ctx.cycles_left = value as i32,
            Slot::Exceptions => ctx.exceptions = value as u8,
        }
    }

    fn call(&mut self, helper: Helper, ctx: &mut DspContext) {
        let arg0 = self.reg(ARG0);
        let arg1 = self.reg(ARG1);
        let result = match helper {
            Helper::Interpret(inst) => {
                interpreter::execute_main(ctx, inst);
                0
            }
            Helper::InterpretExt(inst) => {
                interpreter::execute_ext(ctx, inst);
                0
            }
            Helper::ApplyWriteBackLog => {
                interpreter::apply_write_back_log(ctx);
                0
            }
            Helper::CheckExceptions => ctx.check_exceptions() as u64,
            Helper::ReadData => ctx.mem.read_data(arg0 as u16) as u64,
            Helper::WriteData => {
                ctx.mem.write_data(arg0 as u16, arg1 as u16);
                0
            }
            Helper::PushStack(id) => {
                ctx.regs.push_stack(id, arg0 as u16);
                0
            }
            Helper::PopStack(id) => ctx.regs.pop_stack(id) as u64,
            Helper::HandleLoop(addr) => interpreter::handle_loop(ctx, addr) as u64,
        };
        for reg in HostReg::ALL {
            if reg.is_caller_saved() {
                self.regs[reg.index()] = POISON;
            }
        }
        self.regs[RET_REG.index()] = result;
    }

    /// Runs from `entry` until an `Exit`, returning the cycle count it reports.
    pub fn run(&mut self, arena: &CodeArena, entry: CodePtr, ctx: &mut DspContext) -> u32 {
        let mut ip = entry.0;
        loop {
            let op = match arena.get(CodePtr(ip)) {
                Some(op) => *op,
                None => panic!("execution ran off the end of the code arena at {}", ip),
            };
            ip += 1;

            match op {
                Op::Mov { dst, src } => self.regs[dst.index()] = self.operand(src),
                Op::Xchg { a, b } => self.regs.swap(a.index(), b.index()),
                Op::Load { dst, slot } => self.regs[dst.index()] = Self::read_slot(ctx, slot),
                Op::LoadLow { dst, slot } => {
                    let value = Self::read_slot(ctx, slot) & 0xffff;
                    let reg = &mut self.regs[dst.index()];
                    *reg = (*reg & !0xffff) | value;
                }
                Op::Store { slot, src } => {
                    let value = self.operand(src);
                    Self::write_slot(ctx, slot, value);
                }
                Op::Alu { op, dst, src } => {
                    let a = self.regs[dst.index()];
                    let b = self.operand(src);
                    let shift = (b & 63) as u32;
                    self.regs[dst.index()] = match op {
                        AluOp::Add => a.wrapping_add(b),
                        AluOp::Sub => a.wrapping_sub(b),
                        AluOp::And => a & b,
                        AluOp::Or => a | b,
                        AluOp::Xor => a ^ b,
                        AluOp::Shl => a << shift,
                        AluOp::Shr => a >> shift,
                        AluOp::Sar => ((a as i64) >> shift) as u64,
                        AluOp::Rol => a.rotate_left(shift),
                        AluOp::Ror => a.rotate_right(shift),
                    };
                }
                Op::Extend { kind, dst } => {
                    let v = self.regs[dst.index()];
                    self.regs[dst.index()] = match kind {
                        ExtendKind::Sx8 => v as u8 as i8 as i64 as u64,
                        ExtendKind::Sx16 => v as u16 as i16 as i64 as u64,
                        ExtendKind::Sx32 => v as u32 as i32 as i64 as u64,
                        ExtendKind::Sx40 => sign_extend(v, 40) as u64,
                        ExtendKind::Zx16 => v & 0xffff,
                    };
                }
                Op::Insert16 { dst, src } => {
                    let low = self.regs[src.index()] & 0xffff;
                    let reg = &mut self.regs[dst.index()];
                    *reg = (*reg & !0xffff) | low;
                }
                Op::Cmp { lhs, rhs } => {
                    let a = self.regs[lhs.index()];
                    let b = self.operand(rhs);
                    let res = a.wrapping_sub(b);
                    self.flags = Flags {
                        zf: res == 0,
                        sf: (res as i64) < 0,
                        cf: a < b,
                        of: (((a ^ b) & (a ^ res)) as i64) < 0,
                    };
                }
                Op::Test { lhs, rhs } => {
                    let res = self.regs[lhs.index()] & self.operand(rhs);
                    self.flags = Flags { zf: res == 0, sf: (res as i64) < 0, cf: false, of: false };
                }
                Op::SetCc { dst, cond } => self.regs[dst.index()] = self.flags.check(cond) as u64,
                Op::Jump { cond, target } => {
                    if self.flags.check(cond) {
                        ip = match target {
                            Target::Code(ptr) => ptr.0,
                            Target::Label(label) => panic!("unresolved label {:?} in committed code", label),
                        };
                    }
                }
                Op::Call(helper) => self.call(helper, ctx),
                Op::Push(reg) => self.stack.push(self.regs[reg.index()]),
                Op::Pop(reg) => {
                    self.regs[reg.index()] = match self.stack.pop() {
                        Some(value) => value,
                        None => panic!("host stack underflow"),
                    };
                }
                Op::LinkJump { block, entry, cost } => {
                    if self.allow_links {
                        log::trace!("link to {:04x}", block);
                        ctx.cycles_left -= cost as i32;
                        self.links_taken += 1;
                        ip = entry.0;
                    }
                }
                Op::Exit => {
                    debug_assert!(self.stack.is_empty(), "host stack not balanced at exit");
                    return self.regs[RET_REG.index()] as u32;
                }
            }
        }
    }
}

impl Default for HostCpu {
    fn default() -> Self {
        HostCpu::new()
    }
}

/// Keeps blocks as ops and runs them on a [`HostCpu`]
#[derive(Default)]
pub struct Portable {
    arena: CodeArena,
    cpu: HostCpu,
}

impl Portable {
    pub fn new() -> Portable {
        Portable::default()
    }
}

impl Backend for Portable {
    fn commit(&mut self, code: Emitter, link_offset: usize) -> Installed {
        let entry = self.arena.commit(code);
        Installed { entry, link_entry: CodePtr(entry.0 + link_offset) }
    }

    fn run(&mut self, entry: CodePtr, ctx: &mut DspContext) -> u32 {
        self.cpu.run(&self.arena, entry, ctx)
    }

    fn code_size(&self) -> usize {
        self.arena.len()
    }

    fn clear(&mut self) {
        self.arena.clear();
    }

    fn set_links(&mut self, allowed: bool) {
        self.cpu.allow_links = allowed;
    }

    fn links_taken(&self) -> u64 {
        self.cpu.links_taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsp::regs::Reg;
    use HostReg::*;

    fn run(code: Emitter, ctx: &mut DspContext) -> (HostCpu, u32) {
        let mut arena = CodeArena::new();
        let entry = arena.commit(code);
        let mut cpu = HostCpu::new();
        let cycles = cpu.run(&arena, entry, ctx);
        (cpu, cycles)
    }

    #[test]
    fn loads_merge_and_stores_truncate() {
        let mut ctx = DspContext::default();
        ctx.regs.set(Reg::Acl0, 0xbeef);
        let mut code = Emitter::new();
        code.mov(Rbx, -1);
        code.emit(Op::LoadLow { dst: Rbx, slot: Slot::Reg(Reg::Acl0) });
        code.store(Slot::Reg(Reg::Ar0), Rbx);
        code.mov(Rax, 7);
        code.emit(Op::Exit);
        let (cpu, cycles) = run(code, &mut ctx);
        assert_eq!(cpu.reg(Rbx), 0xffff_ffff_ffff_beef);
        assert_eq!(ctx.regs.get(Reg::Ar0), 0xbeef);
        assert_eq!(cycles, 7);
    }

    #[test]
    fn compare_flags() {
        let mut ctx = DspContext::default();
        let mut code = Emitter::new();
        code.mov(Rbx, 5);
        code.cmp(Rbx, 7);
        code.setcc(Rsi, Cond::Lt);
        code.setcc(Rdi, Cond::Below);
        code.setcc(R12, Cond::Above);
        code.mov(Rbx, i64::MIN);
        code.cmp(Rbx, 1);
        code.setcc(R13, Cond::Lt);
        code.emit(Op::Exit);
        let (cpu, _) = run(code, &mut ctx);
        assert_eq!(cpu.reg(Rsi), 1);
        assert_eq!(cpu.reg(Rdi), 1);
        assert_eq!(cpu.reg(R12), 0);
        // signed overflow makes MIN - 1 compare less
        assert_eq!(cpu.reg(R13), 1);
    }

    #[test]
    fn helper_calls_clobber_caller_saved() {
        let mut ctx = DspContext::default();
        ctx.mem.write_data(0x0010, 0x1234);
        let mut code = Emitter::new();
        code.mov(Rbx, 1);
        code.mov(R8, 2);
        code.mov(ARG0, 0x10);
        code.emit(Op::Call(Helper::ReadData));
        code.emit(Op::Exit);
        let (cpu, cycles) = run(code, &mut ctx);
        assert_eq!(cycles, 0x1234);
        assert_eq!(cpu.reg(Rbx), 1);
        assert_eq!(cpu.reg(R8), POISON);
    }

    #[test]
    fn declined_link_falls_through() {
        let mut ctx = DspContext::default();
        ctx.cycles_left = 100;
        let mut code = Emitter::new();
        code.emit(Op::LinkJump { block: 0x20, entry: CodePtr(3), cost: 4 });
        code.mov(Rax, 1);
        code.emit(Op::Exit);
        code.mov(Rax, 2);
        code.emit(Op::Exit);

        let mut arena = CodeArena::new();
        let entry = arena.commit(code);
        let mut cpu = HostCpu::new();
        assert_eq!(cpu.run(&arena, entry, &mut ctx), 2);
        assert_eq!(ctx.cycles_left, 96);
        assert_eq!(cpu.links_taken, 1);

        cpu.allow_links = false;
        assert_eq!(cpu.run(&arena, entry, &mut ctx), 1);
        assert_eq!(ctx.cycles_left, 96);
    }

    #[test]
    fn portable_link_entries_follow_the_arena() {
        let mut backend = Portable::new();
        let mut first = Emitter::new();
        first.mov(Rax, 1);
        first.emit(Op::Exit);
        backend.commit(first, 0);

        let mut code = Emitter::new();
        code.mov(Rbx, 5);
        code.mov(Rax, 3);
        code.emit(Op::Exit);
        let block = backend.commit(code, 1);
        assert_eq!(block, Installed { entry: CodePtr(2), link_entry: CodePtr(3) });
        assert_eq!(backend.code_size(), 5);

        let mut ctx = DspContext::default();
        assert_eq!(backend.run(block.link_entry, &mut ctx), 3);
        backend.clear();
        assert_eq!(backend.code_size(), 0);
    }
}
