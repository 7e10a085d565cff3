use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::analyzer::Analyzer;
use crate::hw::Hardware;
use crate::memory::Memory;
use crate::regs::{sr, Reg, RegFile, StackId};

pub const CR_EXTERNAL_INT: u16 = 0x0002;
pub const CR_HALT: u16 = 0x0004;

/// Exception 7 is the external interrupt, and is only gated by SR.EIE when it is raised
pub const EXP_INT: u8 = 7;

/// Flags other threads may raise. Only ever polled between blocks.
#[derive(Debug, Default)]
pub struct DspSignals {
    external_interrupt: AtomicBool,
    reset_code: AtomicBool,
}

impl DspSignals {
    pub fn request_interrupt(&self) {
        self.external_interrupt.store(true, Ordering::Release);
    }

    pub fn interrupt_pending(&self) -> bool {
        self.external_interrupt.load(Ordering::Acquire)
    }

    pub fn take_interrupt(&self) -> bool {
        self.external_interrupt.swap(false, Ordering::AcqRel)
    }

    /// Ask for the whole code cache to be thrown away, e.g. after a bulk IRAM upload
    pub fn request_code_reset(&self) {
        self.reset_code.store(true, Ordering::Release);
    }

    pub fn take_code_reset(&self) -> bool {
        self.reset_code.swap(false, Ordering::AcqRel)
    }
}

/// Extension writes are staged here and applied after the main opcode has run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBackLog {
    entries: Vec<(Reg, u16)>,
}

impl WriteBackLog {
    pub fn push(&mut self, reg: Reg, value: u16) {
        debug_assert!(self.entries.len() < 4, "write back log overflow");
        self.entries.push((reg, value));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn take(&mut self) -> Vec<(Reg, u16)> {
        std::mem::take(&mut self.entries)
    }
}

/// The complete guest machine state. Every core operation takes this by `&mut`.
pub struct DspContext {
    pub regs: RegFile,
    pub pc: u16,
    pub control: u16,
    /// Pending exception bits, bit n for exception n
    pub exceptions: u8,
    pub mem: Memory,
    pub analyzer: Analyzer,
    pub write_back: WriteBackLog,
    /// Budget of the current dispatcher run. Compiled code reads and decrements it when it links.
    pub cycles_left: i32,
    /// External interrupt that arrived while SR.EIE was clear
    pub external_interrupt_waiting: bool,
    invalidations: Vec<(u16, u16)>,
    signals: Arc<DspSignals>,
}

impl DspContext {
    // Field offsets for compiled code, which reads and writes these in place
    pub const REGS_OFFSET: usize = std::mem::offset_of!(DspContext, regs) + RegFile::RAW_OFFSET;
    pub const PC_OFFSET: usize = std::mem::offset_of!(DspContext, pc);
    pub const EXCEPTIONS_OFFSET: usize = std::mem::offset_of!(DspContext, exceptions);
    pub const CYCLES_LEFT_OFFSET: usize = std::mem::offset_of!(DspContext, cycles_left);

    pub fn new(hw: Box<dyn Hardware>) -> DspContext {
        let mem = Memory::new(hw);
        let analyzer = Analyzer::analyze(&mem);
        let mut regs = RegFile::new();
        // Short loads and stores address the hardware page until microcode says otherwise
        regs.set(Reg::Cr, 0x00ff);
        DspContext {
            regs,
            pc: 0,
            control: 0,
            exceptions: 0,
            mem,
            analyzer,
            write_back: WriteBackLog::default(),
            cycles_left: 0,
            external_interrupt_waiting: false,
            invalidations: Vec::new(),
            signals: Arc::new(DspSignals::default()),
        }
    }

    pub fn signals(&self) -> Arc<DspSignals> {
        self.signals.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.control & CR_HALT != 0
    }

    pub fn set_halt(&mut self, halt: bool) {
        if halt {
            self.control |= CR_HALT;
        } else {
            self.control &= !CR_HALT;
        }
    }

    /// Writes words into instruction RAM, re-runs the analyzer and queues an invalidation
    /// for the covered range.
    pub fn write_iram(&mut self, addr: u16, words: &[u16]) {
        if words.is_empty() {
            return;
        }
        let mut changed = false;
        for (offset, &word) in words.iter().enumerate() {
            changed |= self.mem.write_instruction(addr.wrapping_add(offset as u16), word);
        }
        if changed {
            self.analyzer = Analyzer::analyze(&self.mem);
            let end = addr.wrapping_add(words.len() as u16 - 1);
            self.invalidations.push((addr, end));
        }
    }

    /// Ranges of instruction memory rewritten since the last call
    pub fn take_invalidations(&mut self) -> Vec<(u16, u16)> {
        std::mem::take(&mut self.invalidations)
    }

    pub fn raise_exception(&mut self, exception: u8) {
        self.exceptions |= 1 << exception;
    }

    /// Latches an external interrupt if SR.EIE allows it, otherwise holds it until it does.
    pub fn service_external_interrupt(&mut self) {
        if self.regs.sr_flag(sr::EXT_INT_ENABLE) {
            self.external_interrupt_waiting = false;
            self.control &= !CR_EXTERNAL_INT;
            self.raise_exception(EXP_INT);
            self.check_exceptions();
        } else {
            self.external_interrupt_waiting = true;
            self.control |= CR_EXTERNAL_INT;
        }
    }

    /// Takes the highest priority pending exception that is enabled.
    /// Returns true if the PC was redirected to a vector.
    pub fn check_exceptions(&mut self) -> bool {
        if self.exceptions == 0 {
            return false;
        }
        for i in (1..=7u8).rev() {
            if self.exceptions & (1 << i) == 0 {
                continue;
            }
            if i != EXP_INT && !self.regs.sr_flag(sr::INT_ENABLE) {
                continue;
            }
            log::trace!("Taking exception {} at pc {:04x}", i, self.pc);
            self.regs.push_stack(StackId::Call, self.pc);
            self.regs.push_stack(StackId::Data, self.regs.sr());
            self.pc = i as u16 * 2;
            self.exceptions &= !(1 << i);
            let mask = if i == EXP_INT { sr::EXT_INT_ENABLE } else { sr::INT_ENABLE };
            self.regs.set_sr(self.regs.sr() & !mask);
            return true;
        }
        false
    }
}

impl Default for DspContext {
    fn default() -> Self {
        DspContext::new(Box::new(crate::hw::Mailboxes::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_priority_and_masking() {
        let mut ctx = DspContext::default();
        ctx.pc = 0x0123;
        ctx.raise_exception(3);
        assert!(!ctx.check_exceptions());
        assert_eq!(ctx.pc, 0x0123);

        ctx.regs.set_sr(sr::INT_ENABLE | sr::CARRY);
        ctx.raise_exception(5);
        assert!(ctx.check_exceptions());
        assert_eq!(ctx.pc, 10);
        assert_eq!(ctx.exceptions, 1 << 3);
        assert_eq!(ctx.regs.get(Reg::St0), 0x0123);
        assert_eq!(ctx.regs.get(Reg::St1), sr::INT_ENABLE | sr::CARRY);
        assert!(!ctx.regs.sr_flag(sr::INT_ENABLE));
    }

    #[test]
    fn field_offsets_address_the_fields() {
        let mut ctx = DspContext::default();
        ctx.regs.set(Reg::Sr, 0x1234);
        ctx.pc = 0x0abc;
        ctx.cycles_left = -7;
        ctx.exceptions = 0x81;
        let base = &ctx as *const DspContext as *const u8;
        unsafe {
            let sr = base.add(DspContext::REGS_OFFSET + 2 * Reg::Sr.index()) as *const u16;
            assert_eq!(sr.read_unaligned(), 0x1234);
            assert_eq!((base.add(DspContext::PC_OFFSET) as *const u16).read_unaligned(), 0x0abc);
            assert_eq!((base.add(DspContext::CYCLES_LEFT_OFFSET) as *const i32).read_unaligned(), -7);
            assert_eq!(*base.add(DspContext::EXCEPTIONS_OFFSET), 0x81);
        }
    }

    #[test]
    fn external_interrupt_waits_for_enable() {
        let mut ctx = DspContext::default();
        ctx.pc = 0x40;
        ctx.service_external_interrupt();
        assert!(ctx.external_interrupt_waiting);
        assert_eq!(ctx.pc, 0x40);

        ctx.regs.set_sr(sr::EXT_INT_ENABLE);
        ctx.service_external_interrupt();
        assert!(!ctx.external_interrupt_waiting);
        assert_eq!(ctx.pc, 14);
        assert!(!ctx.regs.sr_flag(sr::EXT_INT_ENABLE));
    }

    #[test]
    fn iram_writes_queue_invalidations() {
        let mut ctx = DspContext::default();
        ctx.write_iram(0x10, &[0x0021, 0x0000]);
        assert_eq!(ctx.take_invalidations(), vec![(0x10, 0x11)]);
        ctx.write_iram(0x10, &[0x0021]);
        assert!(ctx.take_invalidations().is_empty());
    }
}
