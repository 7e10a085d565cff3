//! Native x86-64 backend.
//!
//! Ops lower one to one onto machine code in a single growing buffer. Every run goes through a
//! small trampoline that saves the callee saved registers, points `CTX_REG` at the context and
//! jumps to the block. `Exit` jumps back to the trampoline's epilogue, which returns `RET_REG`.
//!
//! Helpers are reached through `extern "sysv64"` thunks: `ARG0` and `ARG1` stay where the ops
//! put them, the context goes in RDX and the helper's own parameter (an instruction, a stack or
//! a loop address) in RCX.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::mem;

use dynasmrt::x64::Assembler;
use dynasmrt::{dynasm, AssemblyOffset, DynamicLabel, DynasmApi, DynasmLabelApi};

use dsp::interpreter;
use dsp::opcodes::Inst;
use dsp::regs::StackId;
use dsp::{DspContext, DspError};

use super::{AluOp, Backend, CodePtr, Cond, Emitter, ExtendKind, Helper, HostReg, Installed, Label, Op, Operand};
use super::{Slot, Target, CTX_REG};

const CTX: u8 = CTX_REG as u8;

type Trampoline = unsafe extern "sysv64" fn(*mut DspContext, *const u8) -> u64;
type Thunk = extern "sysv64" fn(u64, u64, *mut DspContext, u64) -> u64;

/// Shared with compiled code, which reads `allowed` and bumps `taken` on every link
#[repr(C)]
struct LinkState {
    allowed: u64,
    taken: u64,
}

pub struct X64Backend {
    asm: Assembler,
    trampoline: AssemblyOffset,
    exit: DynamicLabel,
    /// Where `code_size` counts from
    base: usize,
    links: Box<UnsafeCell<LinkState>>,
    /// Link entries of committed blocks, by buffer offset
    link_labels: HashMap<usize, DynamicLabel>,
}

impl X64Backend {
    pub fn new() -> Result<X64Backend, DspError> {
        let mut asm = Assembler::new()?;
        let trampoline = asm.offset();
        let exit = asm.new_dynamic_label();
        dynasm!(asm
            ; .arch x64
            ; push rbx
            ; push rbp
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; sub rsp, 8
            ; mov Rq(CTX), rdi
            ; jmp rsi
            ; =>exit
            ; add rsp, 8
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; pop rbp
            ; pop rbx
            ; ret
        );
        asm.commit().map_err(|e| DspError::Assemble(e.to_string()))?;
        let base = asm.offset().0;
        Ok(X64Backend {
            asm,
            trampoline,
            exit,
            base,
            links: Box::new(UnsafeCell::new(LinkState { allowed: 1, taken: 0 })),
            link_labels: HashMap::new(),
        })
    }

    fn lower(&mut self, op: Op, labels: &HashMap<Label, DynamicLabel>) {
        match op {
            Op::Mov { dst, src } => self.mov(dst, src),
            Op::Xchg { a, b } => dynasm!(self.asm ; .arch x64 ; xchg Rq(a as u8), Rq(b as u8)),
            Op::Load { dst, slot } => {
                let (d, off) = (dst as u8, slot_offset(slot));
                match slot {
                    Slot::Reg(_) | Slot::Pc => dynasm!(self.asm ; .arch x64 ; movzx Rq(d), WORD [Rq(CTX) + off]),
                    Slot::CyclesLeft => dynasm!(self.asm ; .arch x64 ; movsxd Rq(d), DWORD [Rq(CTX) + off]),
                    Slot::Exceptions => dynasm!(self.asm ; .arch x64 ; movzx Rq(d), BYTE [Rq(CTX) + off]),
                }
            }
            Op::LoadLow { dst, slot } => {
                let (d, off) = (dst as u8, slot_offset(slot));
                match slot {
                    Slot::Exceptions => dynasm!(self.asm
                        ; .arch x64
                        ; and Rq(d), -0x10000
                        ; mov Rb(d), BYTE [Rq(CTX) + off]
                    ),
                    _ => dynasm!(self.asm ; .arch x64 ; mov Rw(d), WORD [Rq(CTX) + off]),
                }
            }
            Op::Store { slot, src } => self.store(slot, src),
            Op::Alu { op, dst, src } => self.alu(op, dst, src),
            Op::Extend { kind, dst } => {
                let d = dst as u8;
                match kind {
                    ExtendKind::Sx8 => dynasm!(self.asm ; .arch x64 ; movsx Rq(d), Rb(d)),
                    ExtendKind::Sx16 => dynasm!(self.asm ; .arch x64 ; movsx Rq(d), Rw(d)),
                    ExtendKind::Sx32 => dynasm!(self.asm ; .arch x64 ; movsxd Rq(d), Rd(d)),
                    ExtendKind::Sx40 => dynasm!(self.asm ; .arch x64 ; shl Rq(d), 24 ; sar Rq(d), 24),
                    ExtendKind::Zx16 => dynasm!(self.asm ; .arch x64 ; movzx Rq(d), Rw(d)),
                }
            }
            Op::Insert16 { dst, src } => dynasm!(self.asm ; .arch x64 ; mov Rw(dst as u8), Rw(src as u8)),
            Op::Cmp { lhs, rhs } => match rhs {
                Operand::Reg(r) => dynasm!(self.asm ; .arch x64 ; cmp Rq(lhs as u8), Rq(r as u8)),
                Operand::Imm(imm) => match i32::try_from(imm) {
                    Ok(imm) => dynasm!(self.asm ; .arch x64 ; cmp Rq(lhs as u8), imm),
                    Err(_) => self.with_wide_imm(lhs, imm, |asm, l, t| dynasm!(asm ; .arch x64 ; cmp Rq(l), Rq(t))),
                },
            },
            Op::Test { lhs, rhs } => match rhs {
                Operand::Reg(r) => dynasm!(self.asm ; .arch x64 ; test Rq(lhs as u8), Rq(r as u8)),
                Operand::Imm(imm) => match i32::try_from(imm) {
                    Ok(imm) => dynasm!(self.asm ; .arch x64 ; test Rq(lhs as u8), imm),
                    Err(_) => self.with_wide_imm(lhs, imm, |asm, l, t| dynasm!(asm ; .arch x64 ; test Rq(l), Rq(t))),
                },
            },
            Op::SetCc { dst, cond } => self.setcc(dst, cond),
            Op::Jump { cond, target } => {
                let label = match target {
                    Target::Label(label) => match labels.get(&label) {
                        Some(label) => *label,
                        None => panic!("jump to unbound label {:?}", label),
                    },
                    Target::Code(ptr) => self.link_label(ptr),
                };
                self.jump(cond, label);
            }
            Op::Call(helper) => self.call(helper),
            Op::Push(reg) => dynasm!(self.asm ; .arch x64 ; push Rq(reg as u8)),
            Op::Pop(reg) => dynasm!(self.asm ; .arch x64 ; pop Rq(reg as u8)),
            Op::LinkJump { entry, cost, .. } => {
                let target = self.link_label(entry);
                let links = self.links.get() as i64;
                let off = DspContext::CYCLES_LEFT_OFFSET as i32;
                dynasm!(self.asm
                    ; .arch x64
                    ; push rax
                    ; mov rax, QWORD links
                    ; cmp QWORD [rax], 0
                    ; je >declined
                    ; add QWORD [rax + 8], 1
                    ; pop rax
                    ; sub DWORD [Rq(CTX) + off], cost as i32
                    ; jmp =>target
                    ; declined:
                    ; pop rax
                );
            }
            Op::Exit => {
                let exit = self.exit;
                dynasm!(self.asm ; .arch x64 ; jmp =>exit);
            }
        }
    }

    fn link_label(&self, ptr: CodePtr) -> DynamicLabel {
        match self.link_labels.get(&ptr.0) {
            Some(label) => *label,
            None => panic!("no committed link entry at {:#x}", ptr.0),
        }
    }

    fn mov(&mut self, dst: HostReg, src: Operand) {
        let d = dst as u8;
        match src {
            Operand::Reg(s) => dynasm!(self.asm ; .arch x64 ; mov Rq(d), Rq(s as u8)),
            Operand::Imm(imm) => match i32::try_from(imm) {
                Ok(imm) => dynasm!(self.asm ; .arch x64 ; mov Rq(d), imm),
                Err(_) => dynasm!(self.asm ; .arch x64 ; mov Rq(d), QWORD imm),
            },
        }
    }

    fn store(&mut self, slot: Slot, src: Operand) {
        let off = slot_offset(slot);
        match (slot, src) {
            (Slot::Reg(_) | Slot::Pc, Operand::Reg(s)) => dynasm!(self.asm ; .arch x64 ; mov WORD [Rq(CTX) + off], Rw(s as u8)),
            (Slot::Reg(_) | Slot::Pc, Operand::Imm(imm)) => dynasm!(self.asm ; .arch x64 ; mov WORD [Rq(CTX) + off], imm as i16),
            (Slot::CyclesLeft, Operand::Reg(s)) => dynasm!(self.asm ; .arch x64 ; mov DWORD [Rq(CTX) + off], Rd(s as u8)),
            (Slot::CyclesLeft, Operand::Imm(imm)) => dynasm!(self.asm ; .arch x64 ; mov DWORD [Rq(CTX) + off], imm as i32),
            (Slot::Exceptions, Operand::Reg(s)) => dynasm!(self.asm ; .arch x64 ; mov BYTE [Rq(CTX) + off], Rb(s as u8)),
            (Slot::Exceptions, Operand::Imm(imm)) => dynasm!(self.asm ; .arch x64 ; mov BYTE [Rq(CTX) + off], imm as i8),
        }
    }

    fn alu(&mut self, op: AluOp, dst: HostReg, src: Operand) {
        let d = dst as u8;
        match (op, src) {
            (AluOp::Shl | AluOp::Shr | AluOp::Sar | AluOp::Rol | AluOp::Ror, Operand::Imm(imm)) => {
                let n = (imm & 63) as i8;
                match op {
                    AluOp::Shl => dynasm!(self.asm ; .arch x64 ; shl Rq(d), n),
                    AluOp::Shr => dynasm!(self.asm ; .arch x64 ; shr Rq(d), n),
                    AluOp::Sar => dynasm!(self.asm ; .arch x64 ; sar Rq(d), n),
                    AluOp::Rol => dynasm!(self.asm ; .arch x64 ; rol Rq(d), n),
                    _ => dynasm!(self.asm ; .arch x64 ; ror Rq(d), n),
                }
            }
            (AluOp::Shl | AluOp::Shr | AluOp::Sar | AluOp::Rol | AluOp::Ror, Operand::Reg(count)) => {
                assert_eq!(count, HostReg::Rcx, "variable shift counts must be in rcx");
                match op {
                    AluOp::Shl => dynasm!(self.asm ; .arch x64 ; shl Rq(d), cl),
                    AluOp::Shr => dynasm!(self.asm ; .arch x64 ; shr Rq(d), cl),
                    AluOp::Sar => dynasm!(self.asm ; .arch x64 ; sar Rq(d), cl),
                    AluOp::Rol => dynasm!(self.asm ; .arch x64 ; rol Rq(d), cl),
                    _ => dynasm!(self.asm ; .arch x64 ; ror Rq(d), cl),
                }
            }
            (_, Operand::Reg(s)) => self.alu_rr(op, d, s as u8),
            (_, Operand::Imm(imm)) => match i32::try_from(imm) {
                Ok(imm) => match op {
                    AluOp::Add => dynasm!(self.asm ; .arch x64 ; add Rq(d), imm),
                    AluOp::Sub => dynasm!(self.asm ; .arch x64 ; sub Rq(d), imm),
                    AluOp::And => dynasm!(self.asm ; .arch x64 ; and Rq(d), imm),
                    AluOp::Or => dynasm!(self.asm ; .arch x64 ; or Rq(d), imm),
                    _ => dynasm!(self.asm ; .arch x64 ; xor Rq(d), imm),
                },
                Err(_) => {
                    let t = scratch_for(dst) as u8;
                    dynasm!(self.asm ; .arch x64 ; push Rq(t) ; mov Rq(t), QWORD imm);
                    self.alu_rr(op, d, t);
                    dynasm!(self.asm ; .arch x64 ; pop Rq(t));
                }
            },
        }
    }

    fn alu_rr(&mut self, op: AluOp, d: u8, s: u8) {
        match op {
            AluOp::Add => dynasm!(self.asm ; .arch x64 ; add Rq(d), Rq(s)),
            AluOp::Sub => dynasm!(self.asm ; .arch x64 ; sub Rq(d), Rq(s)),
            AluOp::And => dynasm!(self.asm ; .arch x64 ; and Rq(d), Rq(s)),
            AluOp::Or => dynasm!(self.asm ; .arch x64 ; or Rq(d), Rq(s)),
            AluOp::Xor => dynasm!(self.asm ; .arch x64 ; xor Rq(d), Rq(s)),
            _ => unreachable!("shifts take their count in rcx"),
        }
    }

    /// Runs `f` with a 64-bit immediate held in a register other than `lhs`
    fn with_wide_imm(&mut self, lhs: HostReg, imm: i64, f: impl FnOnce(&mut Assembler, u8, u8)) {
        let t = scratch_for(lhs) as u8;
        dynasm!(self.asm ; .arch x64 ; push Rq(t) ; mov Rq(t), QWORD imm);
        f(&mut self.asm, lhs as u8, t);
        // pop leaves the flags alone
        dynasm!(self.asm ; .arch x64 ; pop Rq(t));
    }

    fn setcc(&mut self, dst: HostReg, cond: Cond) {
        let d = dst as u8;
        match cond {
            Cond::Always => {
                dynasm!(self.asm ; .arch x64 ; mov Rq(d), 1);
                return;
            }
            Cond::Eq => dynasm!(self.asm ; .arch x64 ; sete Rb(d)),
            Cond::Ne => dynasm!(self.asm ; .arch x64 ; setne Rb(d)),
            Cond::Lt => dynasm!(self.asm ; .arch x64 ; setl Rb(d)),
            Cond::Ge => dynasm!(self.asm ; .arch x64 ; setge Rb(d)),
            Cond::Le => dynasm!(self.asm ; .arch x64 ; setle Rb(d)),
            Cond::Gt => dynasm!(self.asm ; .arch x64 ; setg Rb(d)),
            Cond::Below => dynasm!(self.asm ; .arch x64 ; setb Rb(d)),
            Cond::AboveEq => dynasm!(self.asm ; .arch x64 ; setae Rb(d)),
            Cond::Above => dynasm!(self.asm ; .arch x64 ; seta Rb(d)),
            Cond::BelowEq => dynasm!(self.asm ; .arch x64 ; setbe Rb(d)),
            Cond::Sign => dynasm!(self.asm ; .arch x64 ; sets Rb(d)),
            Cond::NotSign => dynasm!(self.asm ; .arch x64 ; setns Rb(d)),
        }
        dynasm!(self.asm ; .arch x64 ; movzx Rq(d), Rb(d));
    }

    fn jump(&mut self, cond: Cond, label: DynamicLabel) {
        match cond {
            Cond::Always => dynasm!(self.asm ; .arch x64 ; jmp =>label),
            Cond::Eq => dynasm!(self.asm ; .arch x64 ; je =>label),
            Cond::Ne => dynasm!(self.asm ; .arch x64 ; jne =>label),
            Cond::Lt => dynasm!(self.asm ; .arch x64 ; jl =>label),
            Cond::Ge => dynasm!(self.asm ; .arch x64 ; jge =>label),
            Cond::Le => dynasm!(self.asm ; .arch x64 ; jle =>label),
            Cond::Gt => dynasm!(self.asm ; .arch x64 ; jg =>label),
            Cond::Below => dynasm!(self.asm ; .arch x64 ; jb =>label),
            Cond::AboveEq => dynasm!(self.asm ; .arch x64 ; jae =>label),
            Cond::Above => dynasm!(self.asm ; .arch x64 ; ja =>label),
            Cond::BelowEq => dynasm!(self.asm ; .arch x64 ; jbe =>label),
            Cond::Sign => dynasm!(self.asm ; .arch x64 ; js =>label),
            Cond::NotSign => dynasm!(self.asm ; .arch x64 ; jns =>label),
        }
    }

    /// Calls the helper's thunk with the stack aligned to 16 bytes. Blocks push and pop freely
    /// around calls, so the alignment is fixed up here rather than tracked.
    fn call(&mut self, helper: Helper) {
        let (thunk, param) = thunk(helper);
        let thunk = thunk as usize as i64;
        let param = param as i64;
        dynasm!(self.asm
            ; .arch x64
            ; mov rdx, Rq(CTX)
            ; mov rcx, QWORD param
            ; mov rax, rsp
            ; and rsp, -16
            ; push rax
            ; push rax
            ; mov rax, QWORD thunk
            ; call rax
            ; pop rsp
        );
    }
}

impl Backend for X64Backend {
    fn commit(&mut self, code: Emitter, link_offset: usize) -> Installed {
        let entry = self.asm.offset().0;
        let mut labels = HashMap::new();
        let mut bound: Vec<(usize, DynamicLabel)> = Vec::new();
        for (label, at) in code.bound_labels() {
            let dynamic = self.asm.new_dynamic_label();
            labels.insert(label, dynamic);
            bound.push((at, dynamic));
        }
        bound.sort_by_key(|&(at, _)| at);

        let link = self.asm.new_dynamic_label();
        let mut link_entry = entry;
        let mut pending = bound.into_iter().peekable();
        let ops = code.ops();
        for index in 0..=ops.len() {
            while let Some((_, label)) = pending.next_if(|&(at, _)| at == index) {
                dynasm!(self.asm ; .arch x64 ; =>label);
            }
            if index == link_offset {
                link_entry = self.asm.offset().0;
                dynasm!(self.asm ; .arch x64 ; =>link);
            }
            if let Some(&op) = ops.get(index) {
                self.lower(op, &labels);
            }
        }

        if let Err(e) = self.asm.commit() {
            panic!("block at {:#x} failed to assemble: {}", entry, e);
        }
        self.link_labels.insert(link_entry, link);
        Installed { entry: CodePtr(entry), link_entry: CodePtr(link_entry) }
    }

    fn run(&mut self, entry: CodePtr, ctx: &mut DspContext) -> u32 {
        let reader = self.asm.reader();
        let code = reader.lock();
        let target = code.ptr(AssemblyOffset(entry.0));
        unsafe {
            let trampoline: Trampoline = mem::transmute(code.ptr(self.trampoline));
            trampoline(ctx, target) as u32
        }
    }

    fn code_size(&self) -> usize {
        self.asm.offset().0 - self.base
    }

    /// Starts a fresh buffer. If no memory can be mapped the old one keeps growing.
    fn clear(&mut self) {
        match X64Backend::new() {
            Ok(fresh) => {
                let allowed = self.links.get_mut().allowed;
                let taken = self.links.get_mut().taken;
                *self = fresh;
                *self.links.get_mut() = LinkState { allowed, taken };
            }
            Err(e) => {
                log::warn!("Could not map a fresh code buffer, reusing the old one: {}", e);
                self.base = self.asm.offset().0;
                self.link_labels.clear();
            }
        }
    }

    fn set_links(&mut self, allowed: bool) {
        self.links.get_mut().allowed = allowed as u64;
    }

    fn links_taken(&self) -> u64 {
        unsafe { (*self.links.get()).taken }
    }
}

fn slot_offset(slot: Slot) -> i32 {
    let offset = match slot {
        Slot::Reg(reg) => DspContext::REGS_OFFSET + 2 * reg.index(),
        Slot::Pc => DspContext::PC_OFFSET,
        Slot::CyclesLeft => DspContext::CYCLES_LEFT_OFFSET,
        Slot::Exceptions => DspContext::EXCEPTIONS_OFFSET,
    };
    offset as i32
}

fn scratch_for(reg: HostReg) -> HostReg {
    if reg == HostReg::Rax {
        HostReg::Rcx
    } else {
        HostReg::Rax
    }
}

fn pack_inst(inst: Inst) -> u64 {
    inst.opc as u64 | (inst.imm as u64) << 16 | (inst.addr as u64) << 32
}

fn unpack_inst(packed: u64) -> Inst {
    Inst { opc: packed as u16, imm: (packed >> 16) as u16, addr: (packed >> 32) as u16 }
}

fn thunk(helper: Helper) -> (Thunk, u64) {
    match helper {
        Helper::Interpret(inst) => (interpret as Thunk, pack_inst(inst)),
        Helper::InterpretExt(inst) => (interpret_ext as Thunk, pack_inst(inst)),
        Helper::ApplyWriteBackLog => (apply_write_back_log as Thunk, 0),
        Helper::CheckExceptions => (check_exceptions as Thunk, 0),
        Helper::ReadData => (read_data as Thunk, 0),
        Helper::WriteData => (write_data as Thunk, 0),
        Helper::PushStack(id) => (push_stack as Thunk, id as u64),
        Helper::PopStack(id) => (pop_stack as Thunk, id as u64),
        Helper::HandleLoop(addr) => (handle_loop as Thunk, addr as u64),
    }
}

extern "sysv64" fn interpret(_: u64, _: u64, ctx: *mut DspContext, inst: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    interpreter::execute_main(ctx, unpack_inst(inst));
    0
}

extern "sysv64" fn interpret_ext(_: u64, _: u64, ctx: *mut DspContext, inst: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    interpreter::execute_ext(ctx, unpack_inst(inst));
    0
}

extern "sysv64" fn apply_write_back_log(_: u64, _: u64, ctx: *mut DspContext, _: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    interpreter::apply_write_back_log(ctx);
    0
}

extern "sysv64" fn check_exceptions(_: u64, _: u64, ctx: *mut DspContext, _: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    ctx.check_exceptions() as u64
}

extern "sysv64" fn read_data(addr: u64, _: u64, ctx: *mut DspContext, _: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    ctx.mem.read_data(addr as u16) as u64
}

extern "sysv64" fn write_data(addr: u64, value: u64, ctx: *mut DspContext, _: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    ctx.mem.write_data(addr as u16, value as u16);
    0
}

extern "sysv64" fn push_stack(value: u64, _: u64, ctx: *mut DspContext, stack: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    ctx.regs.push_stack(StackId::ALL[stack as usize & 3], value as u16);
    0
}

extern "sysv64" fn pop_stack(_: u64, _: u64, ctx: *mut DspContext, stack: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    ctx.regs.pop_stack(StackId::ALL[stack as usize & 3]) as u64
}

extern "sysv64" fn handle_loop(_: u64, _: u64, ctx: *mut DspContext, addr: u64) -> u64 {
    let ctx = unsafe { &mut *ctx };
    interpreter::handle_loop(ctx, addr as u16) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Portable, ARG0, ARG1};
    use dsp::regs::Reg;
    use HostReg::*;

    fn both(build: impl Fn(&mut Emitter)) -> [(DspContext, u32); 2] {
        let mut backends: [Box<dyn Backend>; 2] = [Box::new(Portable::new()), Box::new(X64Backend::new().unwrap())];
        backends.each_mut().map(|backend| {
            let mut ctx = DspContext::default();
            ctx.regs.set(Reg::Acl0, 0xbeef);
            ctx.cycles_left = 100;
            let mut code = Emitter::new();
            build(&mut code);
            let block = backend.commit(code, 0);
            let cycles = backend.run(block.entry, &mut ctx);
            (ctx, cycles)
        })
    }

    /// Reports `reg` through the exit cycle count
    fn exit_with(code: &mut Emitter, reg: HostReg) {
        code.mov(Rax, reg);
        code.emit(Op::Exit);
    }

    #[test]
    fn slots_are_addressed_in_place() {
        let [(portable, a), (native, b)] = both(|code| {
            code.mov(Rbx, -1);
            code.emit(Op::LoadLow { dst: Rbx, slot: Slot::Reg(Reg::Acl0) });
            code.store(Slot::Reg(Reg::Ar0), Rbx);
            code.store(Slot::Pc, 0x1_0123);
            code.store(Slot::Exceptions, 0x42);
            code.load(Rbp, Slot::CyclesLeft);
            code.alu(AluOp::Sub, Rbp, 130);
            code.store(Slot::CyclesLeft, Rbp);
            code.load(R12, Slot::CyclesLeft);
            exit_with(code, R12);
        });
        assert_eq!(native.regs.get(Reg::Ar0), 0xbeef);
        assert_eq!(native.pc, 0x0123);
        assert_eq!(native.exceptions, 0x42);
        assert_eq!(native.cycles_left, -30);
        assert_eq!(b as i32, -30);
        assert_eq!((a, portable.pc, portable.cycles_left), (b, native.pc, native.cycles_left));
    }

    #[test]
    fn wide_immediates_and_extends() {
        let [(_, a), (_, b)] = both(|code| {
            code.mov(Rbx, 0x0010_00ff_fff0_0000);
            code.alu(AluOp::Xor, Rbx, 0x7f00_0000_0000_0001);
            code.alu(AluOp::Ror, Rbx, 16);
            code.extend(ExtendKind::Sx40, Rbx);
            code.mov(R13, 0x8000);
            code.extend(ExtendKind::Sx16, R13);
            code.alu(AluOp::Add, Rbx, R13);
            code.alu(AluOp::Shr, Rbx, 8);
            exit_with(code, Rbx);
        });
        assert_eq!(a, b);
    }

    #[test]
    fn conditions_match_the_portable_flags() {
        for (lhs, rhs) in [(5i64, 7i64), (7, 5), (i64::MIN, 1), (-1, -1), (0, 0x1_0000_0000)] {
            let [(_, a), (_, b)] = both(|code| {
                code.mov(Rbx, 0);
                let conds = [Cond::Eq, Cond::Ne, Cond::Lt, Cond::Ge, Cond::Le, Cond::Gt, Cond::Below, Cond::AboveEq];
                for (bit, cond) in conds.into_iter().enumerate() {
                    code.mov(Rsi, lhs);
                    code.cmp(Rsi, rhs);
                    code.setcc(Rdi, cond);
                    code.alu(AluOp::Shl, Rdi, bit as i64);
                    code.alu(AluOp::Or, Rbx, Rdi);
                }
                code.mov(Rsi, lhs);
                code.test(Rsi, Rsi);
                code.setcc(Rdi, Cond::Sign);
                code.alu(AluOp::Shl, Rdi, 8);
                code.alu(AluOp::Or, Rbx, Rdi);
                exit_with(code, Rbx);
            });
            assert_eq!(a, b, "{} vs {}", lhs, rhs);
        }
    }

    #[test]
    fn labels_branch_forward_and_back() {
        let [(_, a), (_, b)] = both(|code| {
            let top = code.new_label();
            let done = code.new_label();
            code.mov(Rbx, 0);
            code.mov(R12, 10);
            code.bind(top);
            code.alu(AluOp::Add, Rbx, R12);
            code.alu(AluOp::Sub, R12, 1);
            code.test(R12, R12);
            code.jump(Cond::Eq, done);
            code.jump(Cond::Always, top);
            code.bind(done);
            exit_with(code, Rbx);
        });
        assert_eq!((a, b), (55, 55));
    }

    #[test]
    fn helper_calls_reach_the_context() {
        let [(portable, a), (native, b)] = both(|code| {
            code.emit(Op::Push(Rbx));
            code.mov(ARG0, 0x0010);
            code.mov(ARG1, 0x1234);
            code.emit(Op::Call(Helper::WriteData));
            code.emit(Op::Pop(Rbx));
            code.mov(ARG0, 0x0abc);
            code.emit(Op::Call(Helper::PushStack(StackId::Data)));
            code.mov(ARG0, 0x0010);
            code.emit(Op::Call(Helper::ReadData));
            code.emit(Op::Exit);
        });
        assert_eq!((a, b), (0x1234, 0x1234));
        assert_eq!(native.regs.get(Reg::St1), 0x0abc);
        assert_eq!(portable.regs.get(Reg::St1), native.regs.get(Reg::St1));
    }

    #[test]
    fn links_charge_the_budget_unless_disabled() {
        let mut backend = X64Backend::new().unwrap();
        let mut target = Emitter::new();
        target.mov(Rax, 9);
        target.mov(Rax, 2);
        target.emit(Op::Exit);
        let linked = backend.commit(target, 1);
        assert_ne!(linked.entry, linked.link_entry);

        let mut code = Emitter::new();
        code.emit(Op::LinkJump { block: 0x20, entry: linked.link_entry, cost: 4 });
        code.mov(Rax, 1);
        code.emit(Op::Exit);
        let block = backend.commit(code, 0);

        let mut ctx = DspContext::default();
        ctx.cycles_left = 100;
        assert_eq!(backend.run(block.entry, &mut ctx), 2);
        assert_eq!(ctx.cycles_left, 96);
        assert_eq!(backend.links_taken(), 1);

        backend.set_links(false);
        assert_eq!(backend.run(block.entry, &mut ctx), 1);
        assert_eq!(ctx.cycles_left, 96);
        assert_eq!(backend.links_taken(), 1);
    }

    #[test]
    fn clear_starts_an_empty_buffer() {
        let mut backend = X64Backend::new().unwrap();
        let mut code = Emitter::new();
        code.mov(Rax, 3);
        code.emit(Op::Exit);
        backend.commit(code, 0);
        assert!(backend.code_size() > 0);
        backend.clear();
        assert_eq!(backend.code_size(), 0);
        assert!(backend.link_labels.is_empty());
    }
}
