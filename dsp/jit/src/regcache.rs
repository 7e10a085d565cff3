//! Guest register cache.
//!
//! Tracks which guest registers live in which host registers while a block is being compiled.
//! The accumulators, the AX pairs and the product register are cached whole as composites;
//! their 16-bit parts are reached by rotating the composite so the wanted part sits in the low
//! 16 bits. Everything here runs at compile time and only emits code.

use std::fmt;

use common::util::RegMask16;
use dsp::regs::Reg;

use crate::host::{AluOp, Emitter, ExtendKind, HostReg, Op, Slot};

/// 32 primary registers plus the five composites
pub const NUM_CACHE_REGS: usize = 37;

/// Hosts the cache hands out, in preference order
const ALLOC_ORDER: [HostReg; 11] = [
    HostReg::Rbx, HostReg::Rbp, HostReg::R12, HostReg::R13, HostReg::R14,
    HostReg::Rsi, HostReg::Rdi,
    HostReg::R8, HostReg::R9, HostReg::R10, HostReg::R11,
];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheReg {
    Primary(Reg),
    /// 40-bit accumulator, held sign extended
    Acc(u8),
    /// 32-bit AX pair, held sign extended
    Ax(u8),
    /// The four product parts packed l | m1 << 16 | h << 32 | m2 << 48
    Prod,
}

impl CacheReg {
    pub fn index(self) -> usize {
        match self {
            CacheReg::Primary(reg) => reg.index(),
            CacheReg::Acc(i) => 32 + (i & 1) as usize,
            CacheReg::Ax(i) => 34 + (i & 1) as usize,
            CacheReg::Prod => 36,
        }
    }

    pub fn from_index(idx: usize) -> CacheReg {
        match idx {
            0..=31 => CacheReg::Primary(Reg::from_index(idx as u16)),
            32 | 33 => CacheReg::Acc(idx as u8 - 32),
            34 | 35 => CacheReg::Ax(idx as u8 - 34),
            _ => CacheReg::Prod,
        }
    }

    /// Composite holding this register, and the bit offset of the slice within it
    pub fn slice_of(self) -> Option<(CacheReg, u8)> {
        let CacheReg::Primary(reg) = self else {
            return None;
        };
        let parent = match reg {
            Reg::Acl0 => (CacheReg::Acc(0), 0),
            Reg::Acm0 => (CacheReg::Acc(0), 16),
            Reg::Ach0 => (CacheReg::Acc(0), 32),
            Reg::Acl1 => (CacheReg::Acc(1), 0),
            Reg::Acm1 => (CacheReg::Acc(1), 16),
            Reg::Ach1 => (CacheReg::Acc(1), 32),
            Reg::Axl0 => (CacheReg::Ax(0), 0),
            Reg::Axh0 => (CacheReg::Ax(0), 16),
            Reg::Axl1 => (CacheReg::Ax(1), 0),
            Reg::Axh1 => (CacheReg::Ax(1), 16),
            Reg::ProdL => (CacheReg::Prod, 0),
            Reg::ProdM1 => (CacheReg::Prod, 16),
            Reg::ProdH => (CacheReg::Prod, 32),
            Reg::ProdM2 => (CacheReg::Prod, 48),
            _ => return None,
        };
        Some(parent)
    }

    /// The register that actually owns a host, and the rotation needed to reach `self`
    pub fn root(self) -> (CacheReg, u8) {
        self.slice_of().unwrap_or((self, 0))
    }

    fn normalize(self) -> Option<ExtendKind> {
        match self {
            CacheReg::Acc(_) => Some(ExtendKind::Sx40),
            CacheReg::Ax(_) => Some(ExtendKind::Sx32),
            _ => None,
        }
    }
}

impl From<Reg> for CacheReg {
    fn from(reg: Reg) -> Self {
        CacheReg::Primary(reg)
    }
}

impl fmt::Display for CacheReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheReg::Primary(reg) => f.write_str(reg.name()),
            CacheReg::Acc(i) => write!(f, "ac{}", i),
            CacheReg::Ax(i) => write!(f, "ax{}", i),
            CacheReg::Prod => f.write_str("prod"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GuestLoc {
    pub host: Option<HostReg>,
    /// Host copy is newer than memory
    pub dirty: bool,
    /// How far the host copy is currently rotated right
    pub shift: u8,
    last_use: u64,
}

/// Where every guest register lives at one point of a block. Cloned for snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheState {
    guests: [GuestLoc; NUM_CACHE_REGS],
    hosts: [Option<CacheReg>; 16],
}

impl CacheState {
    /// Everything in memory
    pub fn in_memory() -> CacheState {
        CacheState { guests: [GuestLoc::default(); NUM_CACHE_REGS], hosts: [None; 16] }
    }

    pub fn location(&self, reg: CacheReg) -> GuestLoc {
        self.guests[reg.index()]
    }
}

/// Composites that always live in a fixed host register between instructions
#[derive(Clone, Debug, Default)]
pub struct PinPolicy {
    pins: Vec<(CacheReg, HostReg)>,
}

impl PinPolicy {
    pub fn none() -> PinPolicy {
        PinPolicy::default()
    }

    pub fn accumulators() -> PinPolicy {
        PinPolicy {
            pins: vec![
                (CacheReg::Acc(0), HostReg::R8),
                (CacheReg::Acc(1), HostReg::R9),
                (CacheReg::Ax(0), HostReg::R10),
                (CacheReg::Ax(1), HostReg::R11),
            ],
        }
    }

    pub fn host_for(&self, reg: CacheReg) -> Option<HostReg> {
        self.pins.iter().find(|(guest, _)| *guest == reg).map(|(_, host)| *host)
    }

    fn reserved(&self) -> RegMask16 {
        let mut mask = RegMask16::default();
        for (_, host) in &self.pins {
            mask.set(host.index());
        }
        mask
    }
}

/// Host registers pushed around a helper call
#[must_use]
pub struct SavedRegs(Vec<HostReg>);

pub struct RegCache {
    state: CacheState,
    in_use: [bool; NUM_CACHE_REGS],
    scratch: RegMask16,
    policy: PinPolicy,
    reserved: RegMask16,
    tick: u64,
}

impl RegCache {
    pub fn new(policy: PinPolicy) -> RegCache {
        RegCache {
            state: CacheState::in_memory(),
            in_use: [false; NUM_CACHE_REGS],
            scratch: RegMask16::default(),
            reserved: policy.reserved(),
            policy,
            tick: 0,
        }
    }

    pub fn state(&self) -> &CacheState {
        &self.state
    }

    /// The state every block starts in after its prologue, and the one links jump in with
    pub fn entry_state(&self) -> CacheState {
        let mut state = CacheState::in_memory();
        for &(guest, host) in &self.policy.pins {
            state.guests[guest.index()].host = Some(host);
            state.hosts[host.index()] = Some(guest);
        }
        state
    }

    /// Makes `reg` available in a host register and marks it in use until `release`.
    ///
    /// For a slice the composite is brought in and rotated so the slice is in the low 16 bits.
    /// With `load` false a whole register is mapped without reading memory, for callers that
    /// overwrite all of it.
    pub fn acquire(&mut self, code: &mut Emitter, reg: CacheReg, load: bool) -> HostReg {
        let (root, shift) = reg.root();
        if let CacheReg::Primary(r) = root {
            assert!(!r.is_stack(), "stack register {} cannot be cached", r.name());
        }
        let idx = root.index();
        debug_assert!(!self.in_use[idx], "{} acquired while already in use", root);

        let host = match self.state.guests[idx].host {
            Some(host) => host,
            None => {
                let host = self.allocate(code, root);
                if load || root != reg {
                    emit_load(code, root, host);
                }
                self.map(root, host);
                host
            }
        };
        self.rotate_to(code, root, shift);
        self.in_use[idx] = true;
        self.tick += 1;
        self.state.guests[idx].last_use = self.tick;
        host
    }

    /// Ends a use. A dirty composite is rotated back and renormalized.
    pub fn release(&mut self, code: &mut Emitter, reg: CacheReg, dirty: bool) {
        let (root, _) = reg.root();
        let idx = root.index();
        debug_assert!(self.in_use[idx], "{} released while not in use", root);
        self.in_use[idx] = false;
        if !dirty {
            return;
        }
        self.state.guests[idx].dirty = true;
        if let Some(kind) = root.normalize() {
            self.rotate_to(code, root, 0);
            if let Some(host) = self.state.guests[idx].host {
                code.extend(kind, host);
            }
        }
    }

    /// A host register holding no guest value, reserved until `release_scratch`
    pub fn acquire_scratch(&mut self, code: &mut Emitter) -> HostReg {
        let host = self.find_host(code);
        self.scratch.set(host.index());
        host
    }

    pub fn release_scratch(&mut self, host: HostReg) {
        debug_assert!(self.scratch.contains(host.index()), "{} is not a scratch register", host);
        self.scratch.clear(host.index());
    }

    /// Writes back everything dirty and forgets all mappings
    pub fn flush_all(&mut self, code: &mut Emitter) {
        for idx in 0..NUM_CACHE_REGS {
            if self.state.guests[idx].host.is_some() {
                debug_assert!(!self.in_use[idx], "flush while {} is in use", CacheReg::from_index(idx));
                self.evict(code, CacheReg::from_index(idx));
            }
        }
    }

    /// Saves the live caller saved registers ahead of a helper call
    pub fn push_regs(&mut self, code: &mut Emitter) -> SavedRegs {
        let saved: Vec<HostReg> = HostReg::ALL
            .iter()
            .copied()
            .filter(|host| host.is_caller_saved())
            .filter(|host| self.state.hosts[host.index()].is_some() || self.scratch.contains(host.index()))
            .collect();
        for &host in &saved {
            code.emit(Op::Push(host));
        }
        SavedRegs(saved)
    }

    pub fn pop_regs(&mut self, code: &mut Emitter, saved: SavedRegs) {
        for &host in saved.0.iter().rev() {
            code.emit(Op::Pop(host));
        }
    }

    pub fn snapshot(&self) -> CacheState {
        debug_assert!(self.in_use.iter().all(|used| !used), "snapshot with registers in use");
        debug_assert!(self.scratch.is_empty(), "snapshot with live scratch registers");
        self.state.clone()
    }

    /// Takes back a snapshot without emitting anything. Only valid on a path that has exited.
    pub fn restore(&mut self, state: CacheState) {
        self.state = state;
    }

    /// Emits the moves, spills, loads and rotations that turn the current state into `target`.
    /// Reconciling to the state already held emits nothing.
    pub fn reconcile(&mut self, code: &mut Emitter, target: &CacheState) {
        debug_assert!(self.in_use.iter().all(|used| !used), "reconcile with registers in use");
        debug_assert!(self.scratch.is_empty(), "reconcile with live scratch registers");

        for idx in 0..NUM_CACHE_REGS {
            if self.state.guests[idx].host.is_some() && target.guests[idx].host.is_none() {
                self.evict(code, CacheReg::from_index(idx));
            }
        }

        for idx in 0..NUM_CACHE_REGS {
            let want = target.guests[idx];
            if self.state.guests[idx].host.is_none() || want.host.is_none() {
                continue;
            }
            let guest = CacheReg::from_index(idx);
            if self.state.guests[idx].dirty && !want.dirty {
                self.write_back(code, guest);
            }
            self.rotate_to(code, guest, want.shift);
            self.state.guests[idx].dirty = want.dirty;
        }

        while let Some(idx) = (0..NUM_CACHE_REGS).find(|&idx| {
            matches!((self.state.guests[idx].host, target.guests[idx].host), (Some(a), Some(b)) if a != b)
        }) {
            let guest = CacheReg::from_index(idx);
            let (Some(from), Some(to)) = (self.state.guests[idx].host, target.guests[idx].host) else {
                break;
            };
            match self.state.hosts[to.index()] {
                None => {
                    code.mov(to, from);
                    self.state.hosts[from.index()] = None;
                }
                Some(other) => {
                    code.emit(Op::Xchg { a: from, b: to });
                    self.state.hosts[from.index()] = Some(other);
                    self.state.guests[other.index()].host = Some(from);
                }
            }
            self.state.hosts[to.index()] = Some(guest);
            self.state.guests[idx].host = Some(to);
        }

        for idx in 0..NUM_CACHE_REGS {
            let want = target.guests[idx];
            if let (None, Some(host)) = (self.state.guests[idx].host, want.host) {
                let guest = CacheReg::from_index(idx);
                debug_assert!(self.state.hosts[host.index()].is_none(), "{} still occupied", host);
                emit_load(code, guest, host);
                self.map(guest, host);
                self.rotate_to(code, guest, want.shift);
                self.state.guests[idx].dirty = want.dirty;
            }
        }

        for idx in 0..NUM_CACHE_REGS {
            self.state.guests[idx].last_use = target.guests[idx].last_use;
        }
        debug_assert_eq!(self.state, *target);
    }

    fn is_free(&self, host: HostReg) -> bool {
        !self.reserved.contains(host.index())
            && !self.scratch.contains(host.index())
            && self.state.hosts[host.index()].is_none()
    }

    fn allocate(&mut self, code: &mut Emitter, root: CacheReg) -> HostReg {
        match self.policy.host_for(root) {
            Some(host) => {
                debug_assert!(self.state.hosts[host.index()].is_none(), "pinned {} is occupied", host);
                host
            }
            None => self.find_host(code),
        }
    }

    /// First free host in preference order, or the least recently used evictable one
    fn find_host(&mut self, code: &mut Emitter) -> HostReg {
        if let Some(host) = ALLOC_ORDER.iter().copied().find(|&host| self.is_free(host)) {
            return host;
        }
        let victim = ALLOC_ORDER
            .iter()
            .copied()
            .filter(|host| !self.reserved.contains(host.index()) && !self.scratch.contains(host.index()))
            .filter_map(|host| self.state.hosts[host.index()].map(|guest| (host, guest)))
            .filter(|(_, guest)| !self.in_use[guest.index()])
            .min_by_key(|(_, guest)| self.state.guests[guest.index()].last_use);
        match victim {
            Some((host, guest)) => {
                log::trace!("evicting {} from {}", guest, host);
                self.evict(code, guest);
                host
            }
            None => panic!("register cache exhausted"),
        }
    }

    fn map(&mut self, guest: CacheReg, host: HostReg) {
        self.state.hosts[host.index()] = Some(guest);
        let loc = &mut self.state.guests[guest.index()];
        loc.host = Some(host);
        loc.dirty = false;
        loc.shift = 0;
    }

    fn evict(&mut self, code: &mut Emitter, guest: CacheReg) {
        self.write_back(code, guest);
        if let Some(host) = self.state.guests[guest.index()].host {
            self.state.hosts[host.index()] = None;
        }
        self.state.guests[guest.index()] = GuestLoc::default();
    }

    fn write_back(&mut self, code: &mut Emitter, guest: CacheReg) {
        let loc = self.state.guests[guest.index()];
        let Some(host) = loc.host else {
            return;
        };
        if !loc.dirty {
            return;
        }
        self.rotate_to(code, guest, 0);
        emit_store(code, guest, host);
        self.state.guests[guest.index()].dirty = false;
    }

    fn rotate_to(&mut self, code: &mut Emitter, guest: CacheReg, shift: u8) {
        let loc = &mut self.state.guests[guest.index()];
        let Some(host) = loc.host else {
            return;
        };
        if loc.shift != shift {
            code.rotate(host, (shift + 64 - loc.shift) % 64);
            loc.shift = shift;
        }
    }
}

fn emit_load(code: &mut Emitter, guest: CacheReg, host: HostReg) {
    let low = |code: &mut Emitter, reg: Reg| {
        code.alu(AluOp::Shl, host, 16);
        code.emit(Op::LoadLow { dst: host, slot: Slot::Reg(reg) });
    };
    match guest {
        CacheReg::Primary(reg) => code.load(host, Slot::Reg(reg)),
        CacheReg::Acc(i) => {
            let i = i as usize;
            code.load(host, Slot::Reg(Reg::ach(i)));
            code.extend(ExtendKind::Sx8, host);
            low(code, Reg::acm(i));
            low(code, Reg::acl(i));
        }
        CacheReg::Ax(i) => {
            let i = i as usize;
            code.load(host, Slot::Reg(Reg::axh(i)));
            code.extend(ExtendKind::Sx16, host);
            low(code, Reg::axl(i));
        }
        CacheReg::Prod => {
            code.load(host, Slot::Reg(Reg::ProdM2));
            low(code, Reg::ProdH);
            low(code, Reg::ProdM1);
            low(code, Reg::ProdL);
        }
    }
}

/// Stores a composite part by part, rotating through it and back to where it started
fn emit_store(code: &mut Emitter, guest: CacheReg, host: HostReg) {
    let parts: &[Reg] = match guest {
        CacheReg::Primary(reg) => {
            code.store(Slot::Reg(reg), host);
            return;
        }
        CacheReg::Acc(0) => &[Reg::Acl0, Reg::Acm0, Reg::Ach0],
        CacheReg::Acc(_) => &[Reg::Acl1, Reg::Acm1, Reg::Ach1],
        CacheReg::Ax(0) => &[Reg::Axl0, Reg::Axh0],
        CacheReg::Ax(_) => &[Reg::Axl1, Reg::Axh1],
        CacheReg::Prod => &[Reg::ProdL, Reg::ProdM1, Reg::ProdH, Reg::ProdM2],
    };
    for (i, &part) in parts.iter().enumerate() {
        if i > 0 {
            code.rotate(host, 16);
        }
        code.store(Slot::Reg(part), host);
    }
    code.rotate(host, (64 - 16 * (parts.len() as u8 - 1)) % 64);
}
