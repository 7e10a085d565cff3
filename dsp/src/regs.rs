use common::util::{sext8, sign_extend, wrap40};

/// Primary DSP registers, in hardware index order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Reg {
    Ar0 = 0x00,
    Ar1,
    Ar2,
    Ar3,
    Ix0,
    Ix1,
    Ix2,
    Ix3,
    Wr0,
    Wr1,
    Wr2,
    Wr3,
    St0,
    St1,
    St2,
    St3,
    Ach0,
    Ach1,
    Cr,
    Sr,
    ProdL,
    ProdM1,
    ProdH,
    ProdM2,
    Axl0,
    Axl1,
    Axh0,
    Axh1,
    Acl0,
    Acl1,
    Acm0,
    Acm1,
}

pub const REG_NAMES: [&'static str; 32] = [
    "ar0", "ar1", "ar2", "ar3",
    "ix0", "ix1", "ix2", "ix3",
    "wr0", "wr1", "wr2", "wr3",
    "st0", "st1", "st2", "st3",
    "ac0.h", "ac1.h", "cr", "sr",
    "prod.l", "prod.m1", "prod.h", "prod.m2",
    "ax0.l", "ax1.l", "ax0.h", "ax1.h",
    "ac0.l", "ac1.l", "ac0.m", "ac1.m",
];

impl Reg {
    pub const ALL: [Reg; 32] = [
        Reg::Ar0, Reg::Ar1, Reg::Ar2, Reg::Ar3,
        Reg::Ix0, Reg::Ix1, Reg::Ix2, Reg::Ix3,
        Reg::Wr0, Reg::Wr1, Reg::Wr2, Reg::Wr3,
        Reg::St0, Reg::St1, Reg::St2, Reg::St3,
        Reg::Ach0, Reg::Ach1, Reg::Cr, Reg::Sr,
        Reg::ProdL, Reg::ProdM1, Reg::ProdH, Reg::ProdM2,
        Reg::Axl0, Reg::Axl1, Reg::Axh0, Reg::Axh1,
        Reg::Acl0, Reg::Acl1, Reg::Acm0, Reg::Acm1,
    ];

    /// Decodes a 5 bit register field
    #[inline(always)]
    pub fn from_index(idx: u16) -> Reg {
        Reg::ALL[(idx & 0x1f) as usize]
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        REG_NAMES[self.index()]
    }

    pub fn is_stack(self) -> bool {
        matches!(self, Reg::St0 | Reg::St1 | Reg::St2 | Reg::St3)
    }

    pub fn acm(acc: usize) -> Reg {
        if acc == 0 { Reg::Acm0 } else { Reg::Acm1 }
    }

    pub fn acl(acc: usize) -> Reg {
        if acc == 0 { Reg::Acl0 } else { Reg::Acl1 }
    }

    pub fn ach(acc: usize) -> Reg {
        if acc == 0 { Reg::Ach0 } else { Reg::Ach1 }
    }

    pub fn axl(ax: usize) -> Reg {
        if ax == 0 { Reg::Axl0 } else { Reg::Axl1 }
    }

    pub fn axh(ax: usize) -> Reg {
        if ax == 0 { Reg::Axh0 } else { Reg::Axh1 }
    }
}

pub mod sr {
    pub const CARRY: u16 = 0x0001;
    pub const OVERFLOW: u16 = 0x0002;
    pub const ARITH_ZERO: u16 = 0x0004;
    pub const SIGN: u16 = 0x0008;
    pub const OVER_S32: u16 = 0x0010;
    pub const TOP2BITS: u16 = 0x0020;
    pub const LOGIC_ZERO: u16 = 0x0040;
    pub const OVERFLOW_STICKY: u16 = 0x0080;
    pub const INT_ENABLE: u16 = 0x0200;
    pub const EXT_INT_ENABLE: u16 = 0x0800;
    pub const MODE_40BIT: u16 = 0x4000;

    /// Bits cleared by every flag update
    pub const CMP_MASK: u16 = 0x003f;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StackId {
    Call = 0,
    Data = 1,
    LoopAddress = 2,
    LoopCounter = 3,
}

impl StackId {
    pub const ALL: [StackId; 4] = [StackId::Call, StackId::Data, StackId::LoopAddress, StackId::LoopCounter];

    pub fn reg(self) -> Reg {
        Reg::from_index(Reg::St0 as u16 + self as u16)
    }
}

pub const STACK_DEPTH: usize = 32;
const STACK_MASK: u8 = (STACK_DEPTH - 1) as u8;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Stack {
    data: [u16; STACK_DEPTH],
    ptr: u8,
}

/// Architectural register file.
///
/// The 32 primary registers live in one contiguous array so compiled code can address them by
/// index. The ST registers mirror the top of their hardware stacks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegFile {
    raw: [u16; 32],
    stacks: [Stack; 4],
}

impl RegFile {
    /// Byte offset of the raw slots, for code that addresses them in place
    pub const RAW_OFFSET: usize = std::mem::offset_of!(RegFile, raw);

    pub fn new() -> RegFile {
        RegFile {
            raw: [0; 32],
            stacks: std::array::from_fn(|_| Stack { data: [0; STACK_DEPTH], ptr: 0 }),
        }
    }

    pub fn raw(&self) -> &[u16; 32] {
        &self.raw
    }

    /// Raw slot access, no side effects beyond keeping the stored form canonical
    #[inline(always)]
    pub fn get(&self, reg: Reg) -> u16 {
        self.raw[reg.index()]
    }

    #[inline(always)]
    pub fn set(&mut self, reg: Reg, value: u16) {
        match reg {
            Reg::Ach0 | Reg::Ach1 => self.raw[reg.index()] = sext8(value),
            Reg::St0 | Reg::St1 | Reg::St2 | Reg::St3 => {
                let stack = &mut self.stacks[reg.index() - Reg::St0.index()];
                stack.data[stack.ptr as usize] = value;
                self.raw[reg.index()] = value;
            }
            _ => self.raw[reg.index()] = value,
        }
    }

    /// Stores straight into the slot without canonicalizing. Used by compiled code stores.
    #[inline(always)]
    pub fn store_slot(&mut self, idx: usize, value: u16) {
        self.raw[idx & 0x1f] = value;
    }

    /// Architectural register read: reading a stack register pops it
    pub fn read(&mut self, reg: Reg) -> u16 {
        match reg {
            Reg::St0 | Reg::St1 | Reg::St2 | Reg::St3 => {
                self.pop_stack(StackId::ALL[reg.index() - Reg::St0.index()])
            }
            _ => self.get(reg),
        }
    }

    /// Architectural register write: stack registers push, and AC.M sign extends in 40-bit mode
    pub fn write(&mut self, reg: Reg, value: u16) {
        match reg {
            Reg::St0 | Reg::St1 | Reg::St2 | Reg::St3 => {
                self.push_stack(StackId::ALL[reg.index() - Reg::St0.index()], value)
            }
            Reg::Acm0 | Reg::Acm1 if self.sr() & sr::MODE_40BIT != 0 => {
                let acc = reg.index() - Reg::Acm0.index();
                self.set_acc(acc, (value as i16 as i64) << 16);
            }
            _ => self.set(reg, value),
        }
    }

    pub fn push_stack(&mut self, id: StackId, value: u16) {
        let stack = &mut self.stacks[id as usize];
        stack.ptr = (stack.ptr + 1) & STACK_MASK;
        stack.data[stack.ptr as usize] = value;
        self.raw[id.reg().index()] = value;
    }

    pub fn pop_stack(&mut self, id: StackId) -> u16 {
        let stack = &mut self.stacks[id as usize];
        let value = stack.data[stack.ptr as usize];
        stack.ptr = stack.ptr.wrapping_sub(1) & STACK_MASK;
        self.raw[id.reg().index()] = stack.data[stack.ptr as usize];
        value
    }

    pub fn stack_depth(&self, id: StackId) -> u8 {
        self.stacks[id as usize].ptr
    }

    #[inline(always)]
    pub fn sr(&self) -> u16 {
        self.raw[Reg::Sr.index()]
    }

    #[inline(always)]
    pub fn set_sr(&mut self, value: u16) {
        self.raw[Reg::Sr.index()] = value;
    }

    pub fn sr_flag(&self, bit: u16) -> bool {
        self.sr() & bit != 0
    }

    /// 40-bit accumulator, sign extended
    pub fn acc(&self, acc: usize) -> i64 {
        let h = self.get(Reg::ach(acc)) as u64;
        let m = self.get(Reg::acm(acc)) as u64;
        let l = self.get(Reg::acl(acc)) as u64;
        sign_extend((h << 32) | (m << 16) | l, 40)
    }

    pub fn set_acc(&mut self, acc: usize, value: i64) {
        let value = wrap40(value) as u64;
        self.set(Reg::acl(acc), value as u16);
        self.set(Reg::acm(acc), (value >> 16) as u16);
        self.set(Reg::ach(acc), (value >> 32) as u16);
    }

    /// 32-bit secondary accumulator, sign extended
    pub fn ax(&self, ax: usize) -> i64 {
        let h = self.get(Reg::axh(ax)) as u64;
        let l = self.get(Reg::axl(ax)) as u64;
        sign_extend((h << 16) | l, 32)
    }

    pub fn set_ax(&mut self, ax: usize, value: i64) {
        self.set(Reg::axl(ax), value as u16);
        self.set(Reg::axh(ax), (value >> 16) as u16);
    }

    /// Product register as its four raw parts, packed l | m1 << 16 | h << 32 | m2 << 48
    pub fn prod_raw(&self) -> u64 {
        (self.get(Reg::ProdL) as u64)
            | (self.get(Reg::ProdM1) as u64) << 16
            | (self.get(Reg::ProdH) as u64) << 32
            | (self.get(Reg::ProdM2) as u64) << 48
    }

    pub fn set_prod_raw(&mut self, value: u64) {
        self.set(Reg::ProdL, value as u16);
        self.set(Reg::ProdM1, (value >> 16) as u16);
        self.set(Reg::ProdH, (value >> 32) as u16);
        self.set(Reg::ProdM2, (value >> 48) as u16);
    }

    pub fn increment_ar(&mut self, idx: usize) -> u16 {
        let ar = self.raw[idx] as u32;
        let wr = self.raw[8 + idx] as u32;
        let mut nar = ar + 1;
        if (nar ^ ar) > ((wr | 1) << 1) {
            nar = nar.wrapping_sub(wr + 1);
        }
        nar as u16
    }

    pub fn decrement_ar(&mut self, idx: usize) -> u16 {
        let ar = self.raw[idx] as u32;
        let wr = self.raw[8 + idx] as u32;
        let mut nar = ar + wr;
        if ((nar ^ ar) & ((wr | 1) << 1)) > wr {
            nar = nar.wrapping_sub(wr + 1);
        }
        nar as u16
    }

    /// Adds a signed step to an address register, wrapping within its WR window
    pub fn increase_ar(&mut self, idx: usize, step: i16) -> u16 {
        let ar = self.raw[idx] as u32;
        let wr = self.raw[8 + idx] as u32;
        let ix = step as i32 as u32;
        let mx = (wr | 1) << 1;
        let mut nar = ar.wrapping_add(ix);
        let dar = (nar ^ ar ^ ix) & mx;
        if step >= 0 {
            if dar > wr {
                nar = nar.wrapping_sub(wr + 1);
            }
        } else if ((nar.wrapping_add(wr + 1) ^ nar) & dar) <= wr {
            nar = nar.wrapping_add(wr + 1);
        }
        nar as u16
    }
}

impl Default for RegFile {
    fn default() -> Self {
        RegFile::new()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    Ge = 0x0,
    L,
    G,
    Le,
    Nz,
    Z,
    Nc,
    C,
    NotOverS32,
    OverS32,
    A,
    NotA,
    LogicNotZero,
    LogicZero,
    Overflow,
    Always,
}

impl Condition {
    pub fn from_bits(bits: u16) -> Condition {
        use Condition::*;
        [Ge, L, G, Le, Nz, Z, Nc, C, NotOverS32, OverS32, A, NotA, LogicNotZero, LogicZero, Overflow, Always]
            [(bits & 0xf) as usize]
    }

    pub fn check(self, sr_value: u16) -> bool {
        let flag = |bit: u16| sr_value & bit != 0;
        let less = flag(sr::OVERFLOW) != flag(sr::SIGN);
        let zero = flag(sr::ARITH_ZERO);
        let cond_a = (flag(sr::OVER_S32) || flag(sr::TOP2BITS)) && !zero;
        match self {
            Condition::Ge => !less,
            Condition::L => less,
            Condition::G => !less && !zero,
            Condition::Le => less || zero,
            Condition::Nz => !zero,
            Condition::Z => zero,
            Condition::Nc => !flag(sr::CARRY),
            Condition::C => flag(sr::CARRY),
            Condition::NotOverS32 => !flag(sr::OVER_S32),
            Condition::OverS32 => flag(sr::OVER_S32),
            Condition::A => cond_a,
            Condition::NotA => !cond_a,
            Condition::LogicNotZero => !flag(sr::LOGIC_ZERO),
            Condition::LogicZero => flag(sr::LOGIC_ZERO),
            Condition::Overflow => flag(sr::OVERFLOW),
            Condition::Always => true,
        }
    }
}

#[inline(always)]
pub fn is_carry_add(old: i64, res: i64) -> bool {
    old as u64 > res as u64
}

#[inline(always)]
pub fn is_carry_sub(old: i64, res: i64) -> bool {
    old as u64 >= res as u64
}

#[inline(always)]
pub fn is_overflow(a: i64, b: i64, res: i64) -> bool {
    ((a ^ res) & (b ^ res)) < 0
}

#[inline(always)]
pub fn is_over_s32(value: i64) -> bool {
    value != value as i32 as i64
}

/// Flag update for 40-bit results
pub fn update_sr64(sr_value: &mut u16, value: i64, carry: bool, overflow: bool) {
    *sr_value &= !sr::CMP_MASK;
    if carry {
        *sr_value |= sr::CARRY;
    }
    if overflow {
        *sr_value |= sr::OVERFLOW | sr::OVERFLOW_STICKY;
    }
    if value == 0 {
        *sr_value |= sr::ARITH_ZERO;
    }
    if value < 0 {
        *sr_value |= sr::SIGN;
    }
    if is_over_s32(value) {
        *sr_value |= sr::OVER_S32;
    }
    let top = value & 0xc000_0000;
    if top == 0 || top == 0xc000_0000 {
        *sr_value |= sr::TOP2BITS;
    }
}

/// Flag update for results computed on the middle word
pub fn update_sr16(sr_value: &mut u16, value: i16, over_s32: bool) {
    *sr_value &= !sr::CMP_MASK;
    if value == 0 {
        *sr_value |= sr::ARITH_ZERO;
    }
    if value < 0 {
        *sr_value |= sr::SIGN;
    }
    if over_s32 {
        *sr_value |= sr::OVER_S32;
    }
    let top = (value as u16) >> 14;
    if top == 0 || top == 3 {
        *sr_value |= sr::TOP2BITS;
    }
}
