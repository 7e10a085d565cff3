use modular_bitfield::{bitfield, specifiers::*};

use crate::memory::{Memory, IRAM_SIZE, IROM_BASE, IROM_SIZE};
use crate::opcodes::{self, lookup, lookup_ext};

#[bitfield(bits = 8)]
#[derive(Debug, Copy, Clone)]
pub struct CodeFlags {
    pub start_of_inst: bool,
    pub idle_skip: bool,
    pub loop_end: bool,
    pub check_exceptions: bool,
    pub updates_sr: bool,
    #[skip]
    unused: B3,
}

/// Known mailbox polling loops. 0xffff matches any word.
const IDLE_SKIP_SIGS: [[u16; 5]; 8] = [
    // LRS $AC0.M, @DMBH; ANDCF $AC0.M, #0x8000; JLZ self
    [0x26fc, 0x02c0, 0x8000, 0x029d, 0xffff],
    [0x27fc, 0x03c0, 0x8000, 0x029d, 0xffff],
    // LRS $AC0.M, @DMBH; ANDF $AC0.M, #0x8000; JLNZ self
    [0x26fc, 0x02a0, 0x8000, 0x029c, 0xffff],
    [0x27fc, 0x03a0, 0x8000, 0x029c, 0xffff],
    // LRS $AC0.M, @CMBH; ANDCF $AC0.M, #0x8000; JLNZ self
    [0x26fe, 0x02c0, 0x8000, 0x029c, 0xffff],
    [0x27fe, 0x03c0, 0x8000, 0x029c, 0xffff],
    // LRS $AC0.M, @CMBH; ANDF $AC0.M, #0x8000; JLZ self
    [0x26fe, 0x02a0, 0x8000, 0x029d, 0xffff],
    [0x27fe, 0x03a0, 0x8000, 0x029d, 0xffff],
];

/// Per address code flags for both instruction memory regions.
pub struct Analyzer {
    iram: Box<[CodeFlags]>,
    irom: Box<[CodeFlags]>,
}

impl Analyzer {
    pub fn empty() -> Analyzer {
        Analyzer {
            iram: vec![CodeFlags::new(); IRAM_SIZE].into_boxed_slice(),
            irom: vec![CodeFlags::new(); IROM_SIZE].into_boxed_slice(),
        }
    }

    pub fn analyze(mem: &Memory) -> Analyzer {
        let mut analyzer = Analyzer::empty();
        analyzer.analyze_range(mem, 0, IRAM_SIZE as u16);
        analyzer.analyze_range(mem, IROM_BASE, IROM_SIZE as u16);
        analyzer
    }

    fn analyze_range(&mut self, mem: &Memory, base: u16, len: u16) {
        let end = base.wrapping_add(len);
        let mut addr = base;
        while addr != end {
            let opc = mem.read_instruction(addr);
            let info = lookup(opc);
            let next = addr.wrapping_add(info.size);

            self.update(addr, |f| {
                f.set_start_of_inst(true);
                f.set_updates_sr(info.updates_sr);
            });

            let loads = info.loads || (info.extended && lookup_ext(opc as u8).loads);
            if loads {
                self.update(next, |f| f.set_check_exceptions(true));
            }

            match info.name {
                "LOOP" | "LOOPI" => self.update(next, |f| f.set_loop_end(true)),
                "BLOOP" | "BLOOPI" => {
                    let loop_end = mem.read_instruction(addr.wrapping_add(1));
                    self.update(loop_end, |f| f.set_loop_end(true));
                }
                _ => {}
            }

            if IDLE_SKIP_SIGS.iter().any(|sig| Self::matches(mem, addr, sig)) {
                self.update(addr, |f| f.set_idle_skip(true));
            }

            addr = next;
            // A two word instruction at the end of the region would step past it
            if next.wrapping_sub(base) > len {
                break;
            }
        }
    }

    fn matches(mem: &Memory, addr: u16, sig: &[u16]) -> bool {
        sig.iter().enumerate().all(|(i, &word)| {
            word == 0xffff || mem.read_instruction(addr.wrapping_add(i as u16)) == word
        })
    }

    fn slot(&mut self, addr: u16) -> Option<&mut CodeFlags> {
        match addr >> 12 {
            0x0 => self.iram.get_mut(addr as usize),
            0x8 => self.irom.get_mut(addr as usize - IROM_BASE as usize),
            _ => None,
        }
    }

    fn update(&mut self, addr: u16, f: impl FnOnce(&mut CodeFlags)) {
        if let Some(flags) = self.slot(addr) {
            f(flags)
        }
    }

    pub fn flags(&self, addr: u16) -> CodeFlags {
        let flags = match addr >> 12 {
            0x0 => self.iram.get(addr as usize),
            0x8 => self.irom.get(addr as usize - IROM_BASE as usize),
            _ => None,
        };
        flags.copied().unwrap_or_else(CodeFlags::new)
    }

    /// Overrides the flags at one address. Hand written test programs use this.
    pub fn set_flags(&mut self, addr: u16, flags: CodeFlags) {
        self.update(addr, |f| *f = flags);
    }

    pub fn is_idle_skip(&self, addr: u16) -> bool {
        self.flags(addr).idle_skip()
    }

    pub fn is_loop_end(&self, addr: u16) -> bool {
        self.flags(addr).loop_end()
    }

    pub fn check_exceptions(&self, addr: u16) -> bool {
        self.flags(addr).check_exceptions()
    }
}

/// Size of the instruction at `addr`, as the skip logic of IF and LOOP sees it
pub fn inst_size(mem: &Memory, addr: u16) -> u16 {
    opcodes::lookup(mem.read_instruction(addr)).size
}
