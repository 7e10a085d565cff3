use super::{AluOp, CodePtr, Cond, ExtendKind, HostReg, Op, Operand, Slot, Target};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// Collects the ops of one block. Labels are block local and resolved when the block is
/// committed.
#[derive(Default)]
pub struct Emitter {
    ops: Vec<Op>,
    labels: Vec<Option<usize>>,
}

impl Emitter {
    pub fn new() -> Emitter {
        Emitter::default()
    }

    #[inline(always)]
    pub fn emit(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Binds `label` to the next op emitted
    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.labels[label.0 as usize];
        assert!(slot.is_none(), "label {:?} bound twice", label);
        *slot = Some(self.ops.len());
    }

    /// Block relative offset of a bound label
    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Every bound label with the op index it points at
    pub(crate) fn bound_labels(&self) -> impl Iterator<Item = (Label, usize)> + '_ {
        self.labels.iter().enumerate().filter_map(|(i, at)| at.map(|at| (Label(i as u32), at)))
    }

    pub fn mov(&mut self, dst: HostReg, src: impl Into<Operand>) {
        self.emit(Op::Mov { dst, src: src.into() });
    }

    pub fn load(&mut self, dst: HostReg, slot: Slot) {
        self.emit(Op::Load { dst, slot });
    }

    pub fn store(&mut self, slot: Slot, src: impl Into<Operand>) {
        self.emit(Op::Store { slot, src: src.into() });
    }

    pub fn alu(&mut self, op: AluOp, dst: HostReg, src: impl Into<Operand>) {
        self.emit(Op::Alu { op, dst, src: src.into() });
    }

    pub fn extend(&mut self, kind: ExtendKind, dst: HostReg) {
        self.emit(Op::Extend { kind, dst });
    }

    pub fn cmp(&mut self, lhs: HostReg, rhs: impl Into<Operand>) {
        self.emit(Op::Cmp { lhs, rhs: rhs.into() });
    }

    pub fn test(&mut self, lhs: HostReg, rhs: impl Into<Operand>) {
        self.emit(Op::Test { lhs, rhs: rhs.into() });
    }

    pub fn setcc(&mut self, dst: HostReg, cond: Cond) {
        self.emit(Op::SetCc { dst, cond });
    }

    pub fn jump(&mut self, cond: Cond, label: Label) {
        self.emit(Op::Jump { cond, target: Target::Label(label) });
    }

    /// Rotates right by `amount` bits, skipping no-op rotations
    pub fn rotate(&mut self, dst: HostReg, amount: u8) {
        if amount % 64 != 0 {
            self.alu(AluOp::Ror, dst, (amount % 64) as i64);
        }
    }

    /// Resolves labels against `base`, the arena position the block will start at
    fn finish(self, base: usize) -> Vec<Op> {
        let labels = self.labels;
        self.ops
            .into_iter()
            .map(|op| match op {
                Op::Jump { cond, target: Target::Label(label) } => {
                    let offset = labels[label.0 as usize]
                        .unwrap_or_else(|| panic!("jump to unbound label {:?}", label));
                    Op::Jump { cond, target: Target::Code(CodePtr(base + offset)) }
                }
                op => op,
            })
            .collect()
    }
}

/// Append-only store of compiled code. Positions stay valid until `clear`.
#[derive(Default)]
pub struct CodeArena {
    ops: Vec<Op>,
}

impl CodeArena {
    pub fn new() -> CodeArena {
        CodeArena::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Appends a finished block, returning where it starts
    pub fn commit(&mut self, code: Emitter) -> CodePtr {
        let base = self.ops.len();
        let ops = code.finish(base);
        self.ops.extend(ops);
        CodePtr(base)
    }

    #[inline(always)]
    pub fn get(&self, ptr: CodePtr) -> Option<&Op> {
        self.ops.get(ptr.0)
    }

    pub fn slice(&self, start: CodePtr, len: usize) -> &[Op] {
        let end = (start.0 + len).min(self.ops.len());
        &self.ops[start.0.min(end)..end]
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}
