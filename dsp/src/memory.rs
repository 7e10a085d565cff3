use crate::hw::{Hardware, Mailboxes};

pub const IRAM_SIZE: usize = 0x1000;
pub const IROM_SIZE: usize = 0x1000;
pub const DRAM_SIZE: usize = 0x1000;
pub const COEF_SIZE: usize = 0x0800;

pub const IROM_BASE: u16 = 0x8000;
pub const COEF_BASE: u16 = 0x1000;
pub const HW_BASE: u16 = 0xff00;

/// DSP memory. Instruction and data memory are separate address spaces of 16-bit words.
pub struct Memory {
    iram: Box<[u16; IRAM_SIZE]>,
    irom: Box<[u16; IROM_SIZE]>,
    dram: Box<[u16; DRAM_SIZE]>,
    coef: Box<[u16; COEF_SIZE]>,
    hw: Box<dyn Hardware>,
}

impl Memory {
    pub fn new(hw: Box<dyn Hardware>) -> Memory {
        Memory {
            iram: Box::new([0; IRAM_SIZE]),
            irom: Box::new([0; IROM_SIZE]),
            dram: Box::new([0; DRAM_SIZE]),
            coef: Box::new([0; COEF_SIZE]),
            hw,
        }
    }

    #[inline(always)]
    pub fn read_instruction(&self, addr: u16) -> u16 {
        match addr >> 12 {
            0x0 => self.iram[addr as usize & (IRAM_SIZE - 1)],
            0x8 => self.irom[addr as usize & (IROM_SIZE - 1)],
            _ => 0,
        }
    }

    /// Returns true if the stored word changed
    pub fn write_instruction(&mut self, addr: u16, value: u16) -> bool {
        match addr >> 12 {
            0x0 => {
                let slot = &mut self.iram[addr as usize & (IRAM_SIZE - 1)];
                let changed = *slot != value;
                *slot = value;
                changed
            }
            _ => {
                log::warn!("Instruction write to unwritable address {:04x}", addr);
                false
            }
        }
    }

    pub fn load_irom(&mut self, words: &[u16]) {
        let len = words.len().min(IROM_SIZE);
        self.irom[..len].copy_from_slice(&words[..len]);
    }

    pub fn load_coef(&mut self, words: &[u16]) {
        let len = words.len().min(COEF_SIZE);
        self.coef[..len].copy_from_slice(&words[..len]);
    }

    pub fn read_data(&mut self, addr: u16) -> u16 {
        match addr >> 12 {
            0x0 => self.dram[addr as usize & (DRAM_SIZE - 1)],
            0x1 if (addr as usize) < COEF_BASE as usize + COEF_SIZE => {
                self.coef[addr as usize & (COEF_SIZE - 1)]
            }
            0xf if addr >= HW_BASE => self.hw.read(addr),
            _ => {
                log::warn!("Data read from unmapped address {:04x}", addr);
                0
            }
        }
    }

    pub fn write_data(&mut self, addr: u16, value: u16) {
        match addr >> 12 {
            0x0 => self.dram[addr as usize & (DRAM_SIZE - 1)] = value,
            0xf if addr >= HW_BASE => self.hw.write(addr, value),
            _ => log::warn!("Data write to unwritable address {:04x} = {:04x}", addr, value),
        }
    }

    pub fn hardware(&mut self) -> &mut dyn Hardware {
        self.hw.as_mut()
    }
}

impl Default for Memory {
    fn default() -> Self {
        Memory::new(Box::new(Mailboxes::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_map() {
        let mut mem = Memory::default();
        assert!(mem.write_instruction(0x0010, 0x1234));
        assert!(!mem.write_instruction(0x0010, 0x1234));
        assert_eq!(mem.read_instruction(0x0010), 0x1234);
        assert!(!mem.write_instruction(0x8000, 1));

        mem.load_irom(&[0xaaaa, 0xbbbb]);
        assert_eq!(mem.read_instruction(0x8001), 0xbbbb);
        assert_eq!(mem.read_instruction(0x4000), 0);

        mem.write_data(0x0020, 0x5555);
        assert_eq!(mem.read_data(0x0020), 0x5555);
        mem.load_coef(&[7]);
        assert_eq!(mem.read_data(0x1000), 7);
        assert_eq!(mem.read_data(0x1800), 0);
        mem.write_data(0x1000, 9);
        assert_eq!(mem.read_data(0x1000), 7);

        mem.write_data(0xff80, 0x4242);
        assert_eq!(mem.read_data(0xff80), 0x4242);
    }
}
