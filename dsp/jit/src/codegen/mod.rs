//! Per opcode code generators.
//!
//! A generator either emits host code for an instruction and says how the block continues, or
//! declines before emitting anything, in which case the compiler falls back to the interpreter.

use dsp::opcodes::{self, Inst, EXT_OPCODES, OPCODES};
use dsp::regs::{sr, Reg};

use crate::compiler::Compiler;
use crate::host::AluOp;

pub(crate) mod arith;
pub(crate) mod branch;
pub(crate) mod ext;
pub(crate) mod flags;
pub(crate) mod load_store;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Emit {
    /// Execution continues with the next instruction of the block
    Continue,
    /// Every path out of the instruction has exited; the block ends here
    Exit,
    /// Nothing was emitted; use the interpreter
    Decline,
}

pub type Generator = fn(&mut Compiler<'_>, Inst) -> Emit;

const MAIN_GENERATORS: &[(&str, Generator)] = &[
    ("NOP", nop),
    ("NX", nop),
    ("IF", nop),
    ("SBSET", sbset),
    ("SBCLR", sbclr),
    ("SET16", set16),
    ("SET40", set40),
    ("LRI", load_store::lri),
    ("LRIS", load_store::lris),
    ("MRR", load_store::mrr),
    ("LR", load_store::lr),
    ("SR", load_store::sr),
    ("SI", load_store::si),
    ("ADDI", arith::addi),
    ("ADDIS", arith::addis),
    ("CMPI", arith::cmpi),
    ("CMPIS", arith::cmpis),
    ("ANDI", arith::andi),
    ("ORI", arith::ori),
    ("XORI", arith::xori),
    ("ANDF", arith::andf),
    ("ANDCF", arith::andcf),
    ("ADD", arith::add),
    ("SUB", arith::sub),
    ("ADDAX", arith::addax),
    ("INC", arith::inc),
    ("DEC", arith::dec),
    ("MOV", arith::mov),
    ("CLR", arith::clr),
    ("TST", arith::tst),
    ("CLRP", arith::clrp),
    ("JMP", branch::jcc),
    ("Jcc", branch::jcc),
    ("CALL", branch::callcc),
    ("CALLcc", branch::callcc),
    ("RET", branch::retcc),
    ("RETcc", branch::retcc),
    ("IFcc", branch::ifcc),
    ("JMPR", branch::jrcc),
    ("JRcc", branch::jrcc),
];

const EXT_GENERATORS: &[(&str, Generator)] = &[("NOP", ext::nop), ("MV", ext::mv)];

/// Generators by opcode table index. Missing entries fall back to the interpreter.
#[derive(Clone)]
pub struct JitTable {
    main: Vec<Option<Generator>>,
    ext: Vec<Option<Generator>>,
}

impl JitTable {
    pub fn new() -> JitTable {
        let mut table = JitTable::interpreter_only();
        for &(name, gen) in MAIN_GENERATORS {
            if let Some(idx) = opcodes::index_by_name(name) {
                table.main[idx] = Some(gen);
            }
        }
        for &(name, gen) in EXT_GENERATORS {
            if let Some(idx) = opcodes::ext_index_by_name(name) {
                table.ext[idx] = Some(gen);
            }
        }
        table
    }

    pub fn interpreter_only() -> JitTable {
        JitTable { main: vec![None; OPCODES.len()], ext: vec![None; EXT_OPCODES.len()] }
    }

    /// Removes the generator of a main opcode. Returns false for unknown names.
    pub fn disable(&mut self, name: &str) -> bool {
        match opcodes::index_by_name(name) {
            Some(idx) => {
                self.main[idx] = None;
                true
            }
            None => false,
        }
    }

    pub fn disable_ext(&mut self, name: &str) -> bool {
        match opcodes::ext_index_by_name(name) {
            Some(idx) => {
                self.ext[idx] = None;
                true
            }
            None => false,
        }
    }

    pub fn main(&self, opc: u16) -> Option<Generator> {
        opcodes::lookup_index(opc).and_then(|idx| self.main[idx])
    }

    pub fn ext(&self, ext: u8) -> Option<Generator> {
        opcodes::lookup_ext_index(ext).and_then(|idx| self.ext[idx])
    }

    pub fn generated(&self) -> usize {
        self.main.iter().filter(|gen| gen.is_some()).count()
    }
}

impl Default for JitTable {
    fn default() -> Self {
        JitTable::new()
    }
}

fn nop(_c: &mut Compiler<'_>, _inst: Inst) -> Emit {
    Emit::Continue
}

fn update_sr(c: &mut Compiler<'_>, op: AluOp, mask: u16) -> Emit {
    let flags = c.acquire(Reg::Sr, true);
    let operand = match op {
        AluOp::And => !(mask as i64),
        _ => mask as i64,
    };
    c.code.alu(op, flags, operand);
    c.release(Reg::Sr, true);
    Emit::Continue
}

fn sbset(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    update_sr(c, AluOp::Or, 1 << ((inst.opc & 7) + 6))
}

fn sbclr(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    update_sr(c, AluOp::And, 1 << ((inst.opc & 7) + 6))
}

fn set16(c: &mut Compiler<'_>, _inst: Inst) -> Emit {
    update_sr(c, AluOp::And, sr::MODE_40BIT)
}

fn set40(c: &mut Compiler<'_>, _inst: Inst) -> Emit {
    update_sr(c, AluOp::Or, sr::MODE_40BIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lookup_and_disable() {
        let mut table = JitTable::new();
        assert!(table.main(0x4c00).is_some());
        assert!(table.main(0x1983).is_none());
        assert!(table.main(0xffff).is_none());
        assert!(table.ext(0x13).is_some());
        assert!(table.ext(0x7b).is_none());

        let before = table.generated();
        assert!(table.disable("ADD"));
        assert!(!table.disable("FROB"));
        assert!(table.main(0x4c00).is_none());
        assert_eq!(table.generated(), before - 1);
        assert!(table.disable_ext("MV"));
        assert!(table.ext(0x13).is_none());
    }

    #[test]
    fn every_generator_names_a_real_opcode() {
        for (name, _) in MAIN_GENERATORS {
            assert!(opcodes::index_by_name(name).is_some(), "{}", name);
        }
        for (name, _) in EXT_GENERATORS {
            assert!(opcodes::ext_index_by_name(name).is_some(), "{}", name);
        }
    }
}
