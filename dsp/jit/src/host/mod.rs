//! The host side of the translator.
//!
//! Blocks are compiled into ops for x86-64: sixteen 64-bit registers, a flags register, a
//! stack, and calls out to helper functions that clobber the caller saved registers. A
//! [`Backend`] turns finished blocks into something runnable. On x86-64 hosts that is machine
//! code ([`X64Backend`]); elsewhere the ops are interpreted by [`HostCpu`] through [`Portable`].

use std::fmt;

use dsp::opcodes::Inst;
use dsp::regs::{Reg, StackId};
use dsp::{DspContext, DspError};

mod emitter;
mod exec;
#[cfg(target_arch = "x86_64")]
mod x64;

pub use emitter::{CodeArena, Emitter, Label};
pub use exec::{HostCpu, Portable};
#[cfg(target_arch = "x86_64")]
pub use x64::X64Backend;

/// Where a committed block can be entered
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Installed {
    pub entry: CodePtr,
    /// Past the entry reconcile. Linking blocks jump here.
    pub link_entry: CodePtr,
}

/// Holds committed blocks and runs them
pub trait Backend {
    /// Installs a finished block. `link_offset` is the op index of its link entry.
    fn commit(&mut self, code: Emitter, link_offset: usize) -> Installed;

    /// Runs from `entry` until an `Exit`, returning the cycle count it reports
    fn run(&mut self, entry: CodePtr, ctx: &mut DspContext) -> u32;

    /// Size of everything committed since the last `clear`: bytes for machine code, ops for
    /// the portable executor
    fn code_size(&self) -> usize;

    /// Drops all committed code. Earlier `CodePtr`s become invalid.
    fn clear(&mut self);

    /// When disabled, `LinkJump` falls through to the block's own exit
    fn set_links(&mut self, allowed: bool);

    fn links_taken(&self) -> u64;
}

#[cfg(target_arch = "x86_64")]
fn native_backend() -> Result<Box<dyn Backend>, DspError> {
    Ok(Box::new(X64Backend::new()?))
}

#[cfg(not(target_arch = "x86_64"))]
fn native_backend() -> Result<Box<dyn Backend>, DspError> {
    Err(DspError::InvalidConfig("native code needs an x86-64 host".into()))
}

pub fn new_backend(native: bool) -> Result<Box<dyn Backend>, DspError> {
    if native {
        native_backend()
    } else {
        Ok(Box::new(Portable::new()))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum HostReg {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

pub const HOST_REG_NAMES: [&'static str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi",
    "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

impl HostReg {
    pub const ALL: [HostReg; 16] = [
        HostReg::Rax, HostReg::Rcx, HostReg::Rdx, HostReg::Rbx,
        HostReg::Rsp, HostReg::Rbp, HostReg::Rsi, HostReg::Rdi,
        HostReg::R8, HostReg::R9, HostReg::R10, HostReg::R11,
        HostReg::R12, HostReg::R13, HostReg::R14, HostReg::R15,
    ];

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        HOST_REG_NAMES[self.index()]
    }

    /// Registers a helper call is free to clobber
    pub fn is_caller_saved(self) -> bool {
        matches!(
            self,
            HostReg::Rax | HostReg::Rcx | HostReg::Rdx | HostReg::Rsi | HostReg::Rdi
                | HostReg::R8 | HostReg::R9 | HostReg::R10 | HostReg::R11
        )
    }
}

impl fmt::Display for HostReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Holds the context pointer. Never allocated.
pub const CTX_REG: HostReg = HostReg::R15;
/// Return value of helpers, and the cycle count handed back by `Exit`
pub const RET_REG: HostReg = HostReg::Rax;
pub const ARG0: HostReg = HostReg::Rdi;
pub const ARG1: HostReg = HostReg::Rsi;

/// Guest state addressable directly from host code
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    Reg(Reg),
    Pc,
    CyclesLeft,
    Exceptions,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Reg(reg) => write!(f, "[{}]", reg.name()),
            Slot::Pc => f.write_str("[pc]"),
            Slot::CyclesLeft => f.write_str("[cycles_left]"),
            Slot::Exceptions => f.write_str("[exceptions]"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Reg(HostReg),
    Imm(i64),
}

impl From<HostReg> for Operand {
    fn from(reg: HostReg) -> Self {
        Operand::Reg(reg)
    }
}

impl From<i64> for Operand {
    fn from(imm: i64) -> Self {
        Operand::Imm(imm)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{}", reg),
            Operand::Imm(imm) => write!(f, "{:#x}", imm),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExtendKind {
    Sx8,
    Sx16,
    Sx32,
    Sx40,
    Zx16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cond {
    Always,
    Eq,
    Ne,
    /// Signed
    Lt,
    Ge,
    Le,
    Gt,
    /// Unsigned
    Below,
    AboveEq,
    Above,
    BelowEq,
    Sign,
    NotSign,
}

/// Functions compiled code may call. Arguments are passed in `ARG0`/`ARG1`, results come back in
/// `RET_REG`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Helper {
    /// Main half of one instruction through the interpreter
    Interpret(Inst),
    /// Extension half of one instruction; writes land in the write back log
    InterpretExt(Inst),
    ApplyWriteBackLog,
    /// Returns 1 if an exception was taken
    CheckExceptions,
    ReadData,
    WriteData,
    PushStack(StackId),
    PopStack(StackId),
    /// Returns 1 if the loop ending at this address goes around again
    HandleLoop(u16),
}

/// Absolute position in a backend's code: an op index or a byte offset
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodePtr(pub usize);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Label(Label),
    Code(CodePtr),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Mov { dst: HostReg, src: Operand },
    Xchg { a: HostReg, b: HostReg },
    /// Zero extending load of a guest slot
    Load { dst: HostReg, slot: Slot },
    /// Loads into the low 16 bits, keeping the rest of `dst`
    LoadLow { dst: HostReg, slot: Slot },
    Store { slot: Slot, src: Operand },
    Alu { op: AluOp, dst: HostReg, src: Operand },
    Extend { kind: ExtendKind, dst: HostReg },
    /// Replaces the low 16 bits of `dst` with those of `src`
    Insert16 { dst: HostReg, src: HostReg },
    Cmp { lhs: HostReg, rhs: Operand },
    Test { lhs: HostReg, rhs: Operand },
    SetCc { dst: HostReg, cond: Cond },
    Jump { cond: Cond, target: Target },
    Call(Helper),
    Push(HostReg),
    Pop(HostReg),
    /// Charges `cost` cycles and continues in another block's link entry
    LinkJump { block: u16, entry: CodePtr, cost: u16 },
    /// Returns to the dispatcher with the cycle count in `RET_REG`
    Exit,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Mov { dst, src } => write!(f, "mov {}, {}", dst, src),
            Op::Xchg { a, b } => write!(f, "xchg {}, {}", a, b),
            Op::Load { dst, slot } => write!(f, "load {}, {}", dst, slot),
            Op::LoadLow { dst, slot } => write!(f, "loadlo {}, {}", dst, slot),
            Op::Store { slot, src } => write!(f, "store {}, {}", slot, src),
            Op::Alu { op, dst, src } => write!(f, "{} {}, {}", format!("{:?}", op).to_lowercase(), dst, src),
            Op::Extend { kind, dst } => write!(f, "{} {}", format!("{:?}", kind).to_lowercase(), dst),
            Op::Insert16 { dst, src } => write!(f, "ins16 {}, {}", dst, src),
            Op::Cmp { lhs, rhs } => write!(f, "cmp {}, {}", lhs, rhs),
            Op::Test { lhs, rhs } => write!(f, "test {}, {}", lhs, rhs),
            Op::SetCc { dst, cond } => write!(f, "set{:?} {}", cond, dst),
            Op::Jump { cond, target: Target::Label(label) } => write!(f, "j{:?} {:?}", cond, label),
            Op::Jump { cond, target: Target::Code(ptr) } => write!(f, "j{:?} @{}", cond, ptr.0),
            Op::Call(helper) => write!(f, "call {:?}", helper),
            Op::Push(reg) => write!(f, "push {}", reg),
            Op::Pop(reg) => write!(f, "pop {}", reg),
            Op::LinkJump { block, entry, cost } => write!(f, "link {:04x} @{} cost {}", block, entry.0, cost),
            Op::Exit => f.write_str("exit"),
        }
    }
}

/// One op per line, for logs and tests
pub fn disasm(ops: &[Op]) -> String {
    ops.iter().map(|op| format!("{}\n", op)).collect()
}
