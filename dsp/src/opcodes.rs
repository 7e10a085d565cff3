use std::sync::OnceLock;

use modular_bitfield::{bitfield, specifiers::*};

use crate::context::DspContext;
use crate::interpreter::{ext, ops};
use crate::memory::Memory;

/// A decoded instruction: the opcode word, its immediate word (zero for one word instructions)
/// and the address it was fetched from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Inst {
    pub opc: u16,
    pub imm: u16,
    pub addr: u16,
}

impl Inst {
    pub fn fetch(mem: &Memory, addr: u16) -> (Inst, &'static OpInfo) {
        let opc = mem.read_instruction(addr);
        let info = lookup(opc);
        let imm = if info.size == 2 { mem.read_instruction(addr.wrapping_add(1)) } else { 0 };
        (Inst { opc, imm, addr }, info)
    }

    pub fn next(&self, info: &OpInfo) -> u16 {
        self.addr.wrapping_add(info.size)
    }

    #[inline(always)]
    pub fn cond(&self) -> crate::regs::Condition {
        crate::regs::Condition::from_bits(self.opc)
    }

    /// Low byte, the extension opcode of extended instructions
    #[inline(always)]
    pub fn ext(&self) -> u8 {
        self.opc as u8
    }
}

pub type InterpFn = fn(&mut DspContext, Inst);

pub struct OpInfo {
    pub name: &'static str,
    pub opcode: u16,
    pub mask: u16,
    pub size: u16,
    /// Low byte holds an extension opcode
    pub extended: bool,
    pub branch: bool,
    pub uncond_branch: bool,
    pub reads_pc: bool,
    pub updates_sr: bool,
    /// Reads data memory, so the following instruction polls for exceptions
    pub loads: bool,
    pub interp: InterpFn,
}

pub struct ExtInfo {
    pub name: &'static str,
    pub opcode: u8,
    pub mask: u8,
    pub loads: bool,
    pub interp: InterpFn,
}

#[bitfield(bits = 16)]
#[derive(Debug, Copy, Clone)]
pub struct RegOp {
    pub reg: B5,
    #[skip]
    op: B11,
}

#[bitfield(bits = 16)]
#[derive(Debug, Copy, Clone)]
pub struct MrrOp {
    pub src: B5,
    pub dst: B5,
    #[skip]
    op: B6,
}

#[bitfield(bits = 16)]
#[derive(Debug, Copy, Clone)]
pub struct ShortImmOp {
    pub imm: B8,
    pub reg: B3,
    #[skip]
    op: B5,
}

#[bitfield(bits = 16)]
#[derive(Debug, Copy, Clone)]
pub struct IndirectOp {
    pub reg: B5,
    pub ar: B2,
    pub mode: B2,
    #[skip]
    op: B7,
}

#[bitfield(bits = 16)]
#[derive(Debug, Copy, Clone)]
pub struct AccImmOp {
    #[skip]
    sub: B8,
    pub acc: B1,
    #[skip]
    op: B7,
}

impl From<u16> for RegOp {
    fn from(opc: u16) -> Self {
        RegOp::from_bytes(opc.to_le_bytes())
    }
}
impl From<u16> for MrrOp {
    fn from(opc: u16) -> Self {
        MrrOp::from_bytes(opc.to_le_bytes())
    }
}
impl From<u16> for ShortImmOp {
    fn from(opc: u16) -> Self {
        ShortImmOp::from_bytes(opc.to_le_bytes())
    }
}
impl From<u16> for IndirectOp {
    fn from(opc: u16) -> Self {
        IndirectOp::from_bytes(opc.to_le_bytes())
    }
}
impl From<u16> for AccImmOp {
    fn from(opc: u16) -> Self {
        AccImmOp::from_bytes(opc.to_le_bytes())
    }
}

macro_rules! op {
    ($name:literal, $opcode:literal, $mask:literal, $size:literal, $interp:path $(, $flag:ident)*) => {{
        #[allow(unused_mut)]
        let mut info = OpInfo {
            name: $name,
            opcode: $opcode,
            mask: $mask,
            size: $size,
            extended: false,
            branch: false,
            uncond_branch: false,
            reads_pc: false,
            updates_sr: false,
            loads: false,
            interp: $interp,
        };
        $( info.$flag = true; )*
        info
    }};
}

pub static OPCODES: [OpInfo; 59] = [
    op!("NOP",     0x0000, 0xfffc, 1, ops::nop),
    op!("DAR",     0x0004, 0xfffc, 1, ops::dar),
    op!("IAR",     0x0008, 0xfffc, 1, ops::iar),
    op!("SUBARN",  0x000c, 0xfffc, 1, ops::subarn),
    op!("ADDARN",  0x0010, 0xfff0, 1, ops::addarn),
    op!("HALT",    0x0021, 0xffff, 1, ops::halt, branch, uncond_branch),
    op!("LOOP",    0x0040, 0xffe0, 1, ops::loop_reg, branch, uncond_branch, reads_pc),
    op!("BLOOP",   0x0060, 0xffe0, 2, ops::bloop_reg, branch, uncond_branch, reads_pc),
    op!("LRI",     0x0080, 0xffe0, 2, ops::lri),
    op!("LR",      0x00c0, 0xffe0, 2, ops::lr, loads),
    op!("SR",      0x00e0, 0xffe0, 2, ops::sr),
    op!("ADDI",    0x0200, 0xfeff, 2, ops::addi, updates_sr),
    op!("ILRR",    0x0210, 0xfef0, 1, ops::ilrr),
    op!("XORI",    0x0220, 0xfeff, 2, ops::xori, updates_sr),
    op!("ANDI",    0x0240, 0xfeff, 2, ops::andi, updates_sr),
    op!("ORI",     0x0260, 0xfeff, 2, ops::ori, updates_sr),
    op!("IF",      0x027f, 0xffff, 1, ops::nop),
    op!("IFcc",    0x0270, 0xfff0, 1, ops::ifcc, branch, reads_pc),
    op!("CMPI",    0x0280, 0xfeff, 2, ops::cmpi, updates_sr),
    op!("JMP",     0x029f, 0xffff, 2, ops::jcc, branch, uncond_branch),
    op!("Jcc",     0x0290, 0xfff0, 2, ops::jcc, branch),
    op!("ANDF",    0x02a0, 0xfeff, 2, ops::andf, updates_sr),
    op!("CALL",    0x02bf, 0xffff, 2, ops::callcc, branch, uncond_branch, reads_pc),
    op!("CALLcc",  0x02b0, 0xfff0, 2, ops::callcc, branch, reads_pc),
    op!("ANDCF",   0x02c0, 0xfeff, 2, ops::andcf, updates_sr),
    op!("RET",     0x02df, 0xffff, 1, ops::retcc, branch, uncond_branch),
    op!("RETcc",   0x02d0, 0xfff0, 1, ops::retcc, branch),
    op!("RTI",     0x02ff, 0xffff, 1, ops::rti, branch, uncond_branch, updates_sr),
    op!("ADDIS",   0x0400, 0xfe00, 1, ops::addis, updates_sr),
    op!("CMPIS",   0x0600, 0xfe00, 1, ops::cmpis, updates_sr),
    op!("LRIS",    0x0800, 0xf800, 1, ops::lris),
    op!("LOOPI",   0x1000, 0xff00, 1, ops::loopi, branch, uncond_branch, reads_pc),
    op!("BLOOPI",  0x1100, 0xff00, 2, ops::bloopi, branch, uncond_branch, reads_pc),
    op!("SBCLR",   0x1200, 0xff00, 1, ops::sbclr),
    op!("SBSET",   0x1300, 0xff00, 1, ops::sbset),
    op!("SI",      0x1600, 0xff00, 2, ops::si),
    op!("JMPR",    0x170f, 0xff1f, 1, ops::jrcc, branch, uncond_branch),
    op!("JRcc",    0x1700, 0xff10, 1, ops::jrcc, branch),
    op!("CALLR",   0x171f, 0xff1f, 1, ops::callrcc, branch, uncond_branch, reads_pc),
    op!("CALLRcc", 0x1710, 0xff10, 1, ops::callrcc, branch, reads_pc),
    op!("LRR",     0x1800, 0xfe00, 1, ops::lrr, loads),
    op!("SRR",     0x1a00, 0xfe00, 1, ops::srr),
    op!("MRR",     0x1c00, 0xfc00, 1, ops::mrr),
    op!("LRS",     0x2000, 0xf800, 1, ops::lrs, loads),
    op!("SRS",     0x2800, 0xf800, 1, ops::srs),
    op!("ADDAX",   0x4800, 0xfc00, 1, ops::addax, extended, updates_sr),
    op!("ADD",     0x4c00, 0xfe00, 1, ops::add, extended, updates_sr),
    op!("SUB",     0x5c00, 0xfe00, 1, ops::sub, extended, updates_sr),
    op!("MOVR",    0x6000, 0xf800, 1, ops::movr, extended, updates_sr),
    op!("MOV",     0x6c00, 0xfe00, 1, ops::mov, extended, updates_sr),
    op!("INC",     0x7600, 0xfe00, 1, ops::inc, extended, updates_sr),
    op!("DEC",     0x7a00, 0xfe00, 1, ops::dec, extended, updates_sr),
    op!("NX",      0x8000, 0xf700, 1, ops::nop, extended),
    op!("CLR",     0x8100, 0xf700, 1, ops::clr, extended, updates_sr),
    op!("SET16",   0x8e00, 0xff00, 1, ops::set16, extended),
    op!("SET40",   0x8f00, 0xff00, 1, ops::set40, extended),
    op!("TST",     0xb100, 0xf700, 1, ops::tst, extended, updates_sr),
    op!("ADDP",    0x4e00, 0xfe00, 1, ops::addp, extended, updates_sr),
    op!("CLRP",    0x8400, 0xff00, 1, ops::clrp, extended),
];

pub static UNKNOWN: OpInfo = op!("UNKNOWN", 0x0000, 0x0000, 1, ops::unknown);

pub static EXT_OPCODES: [ExtInfo; 7] = [
    ExtInfo { name: "NOP", opcode: 0x00, mask: 0xfc, loads: false, interp: ext::nop },
    ExtInfo { name: "DR", opcode: 0x04, mask: 0xfc, loads: false, interp: ext::dr },
    ExtInfo { name: "IR", opcode: 0x08, mask: 0xfc, loads: false, interp: ext::ir },
    ExtInfo { name: "NR", opcode: 0x0c, mask: 0xfc, loads: false, interp: ext::nr },
    ExtInfo { name: "MV", opcode: 0x10, mask: 0xf0, loads: false, interp: ext::mv },
    ExtInfo { name: "L", opcode: 0x40, mask: 0xc4, loads: true, interp: ext::l },
    ExtInfo { name: "LN", opcode: 0x44, mask: 0xc4, loads: true, interp: ext::ln },
];

pub static EXT_UNKNOWN: ExtInfo =
    ExtInfo { name: "UNKNOWN", opcode: 0x00, mask: 0x00, loads: false, interp: ext::nop };

const NO_ENTRY: u8 = 0xff;

fn main_index() -> &'static [u8] {
    static TABLE: OnceLock<Box<[u8]>> = OnceLock::new();
    TABLE.get_or_init(|| {
        (0..=0xffffu32)
            .map(|opc| {
                OPCODES
                    .iter()
                    .position(|op| opc as u16 & op.mask == op.opcode)
                    .map_or(NO_ENTRY, |idx| idx as u8)
            })
            .collect()
    })
}

fn ext_index() -> &'static [u8; 256] {
    static TABLE: OnceLock<[u8; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        std::array::from_fn(|ext| {
            EXT_OPCODES
                .iter()
                .position(|op| ext as u8 & op.mask == op.opcode)
                .map_or(NO_ENTRY, |idx| idx as u8)
        })
    })
}

/// Index into OPCODES, or None for unknown opcodes
pub fn lookup_index(opc: u16) -> Option<usize> {
    match main_index()[opc as usize] {
        NO_ENTRY => None,
        idx => Some(idx as usize),
    }
}

pub fn lookup(opc: u16) -> &'static OpInfo {
    lookup_index(opc).map_or(&UNKNOWN, |idx| &OPCODES[idx])
}

pub fn lookup_ext_index(ext: u8) -> Option<usize> {
    match ext_index()[ext as usize] {
        NO_ENTRY => None,
        idx => Some(idx as usize),
    }
}

pub fn lookup_ext(ext: u8) -> &'static ExtInfo {
    lookup_ext_index(ext).map_or(&EXT_UNKNOWN, |idx| &EXT_OPCODES[idx])
}

pub fn index_by_name(name: &str) -> Option<usize> {
    OPCODES.iter().position(|op| op.name == name)
}

pub fn ext_index_by_name(name: &str) -> Option<usize> {
    EXT_OPCODES.iter().position(|op| op.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode() {
        assert_eq!(lookup(0x0000).name, "NOP");
        assert_eq!(lookup(0x0021).name, "HALT");
        assert_eq!(lookup(0x009e).name, "LRI");
        assert_eq!(lookup(0x029f).name, "JMP");
        assert_eq!(lookup(0x0295).name, "Jcc");
        assert_eq!(lookup(0x02c0).name, "ANDCF");
        assert_eq!(lookup(0x03a0).name, "ANDF");
        assert_eq!(lookup(0x0214).name, "ILRR");
        assert_eq!(lookup(0x1c3e).name, "MRR");
        assert_eq!(lookup(0x26fc).name, "LRS");
        assert_eq!(lookup(0x4c00).name, "ADD");
        assert_eq!(lookup(0x4d10).name, "ADD");
        assert_eq!(lookup(0x8900).name, "CLR");
        assert_eq!(lookup(0x1aff).name, "SRR");
        assert_eq!(lookup(0xffff).name, "UNKNOWN");
        assert_eq!(lookup_ext(0x13).name, "MV");
        assert_eq!(lookup_ext(0x7b).name, "L");
        assert_eq!(lookup_ext(0x20).name, "UNKNOWN");

        assert!(lookup(0x029f).uncond_branch);
        assert!(!lookup(0x029d).uncond_branch);
        assert!(lookup(0x4c00).extended);
    }

    #[test]
    fn formats() {
        let mrr = MrrOp::from(0x1c3e);
        assert_eq!(mrr.dst(), 0x01);
        assert_eq!(mrr.src(), 0x1e);
        let lris = ShortImmOp::from(0x0e80);
        assert_eq!(lris.reg(), 6);
        assert_eq!(lris.imm(), 0x80);
        assert_eq!(AccImmOp::from(0x0340).acc(), 1);
        let lrr = IndirectOp::from(0x1983);
        assert_eq!(lrr.mode(), 3);
        assert_eq!(lrr.ar(), 0);
        assert_eq!(lrr.reg(), 3);
    }
}
