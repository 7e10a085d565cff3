//! Extension generators. Writes are deferred until the main opcode has been emitted, so the
//! main opcode still sees the old register values.

use dsp::opcodes::Inst;
use dsp::regs::Reg;

use super::load_store::read_reg;
use super::Emit;
use crate::compiler::Compiler;

pub fn nop(_c: &mut Compiler<'_>, _inst: Inst) -> Emit {
    Emit::Continue
}

/// MV $axD.D, $acS.S
pub fn mv(c: &mut Compiler<'_>, inst: Inst) -> Emit {
    let src = Reg::from_index(0x1c + (inst.opc & 3));
    let dst = Reg::from_index(0x18 + ((inst.opc >> 2) & 3));
    let value = c.scratch();
    read_reg(c, src, value);
    c.defer_write(dst, value);
    Emit::Continue
}
