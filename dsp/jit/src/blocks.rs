//! Block table and link bookkeeping.
//!
//! One entry per guest address. A block becomes a link target only once every block it wants
//! to link to has been compiled; until then it waits on them and gets recompiled when the last
//! of them shows up.

use std::collections::{BTreeSet, HashMap};

use crate::host::CodePtr;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockState {
    Stub,
    Compiled(CodePtr),
    Recompile,
}

#[derive(Copy, Clone, Debug)]
struct BlockEntry {
    state: BlockState,
    link_entry: Option<CodePtr>,
    size: u16,
    end: u16,
}

impl Default for BlockEntry {
    fn default() -> Self {
        BlockEntry { state: BlockState::Stub, link_entry: None, size: 0, end: 0 }
    }
}

/// What the table needs to know about a freshly compiled block
pub struct BlockInfo {
    pub start: u16,
    pub end: u16,
    pub size: u16,
    pub entry: CodePtr,
    pub link_entry: CodePtr,
    /// Link targets that were not linkable at compile time
    pub unresolved: Vec<u16>,
    /// Blocks this one jumps into directly
    pub links: Vec<u16>,
}

pub struct BlockTable {
    entries: Box<[BlockEntry]>,
    /// block -> targets it is waiting on
    unresolved: HashMap<u16, Vec<u16>>,
    /// target -> blocks waiting on it
    waiters: HashMap<u16, BTreeSet<u16>>,
    /// target -> blocks holding a direct link into it
    linked_from: HashMap<u16, BTreeSet<u16>>,
    /// block -> targets it links into
    links_to: HashMap<u16, Vec<u16>>,
}

impl BlockTable {
    pub fn new() -> BlockTable {
        BlockTable {
            entries: vec![BlockEntry::default(); 0x10000].into_boxed_slice(),
            unresolved: HashMap::new(),
            waiters: HashMap::new(),
            linked_from: HashMap::new(),
            links_to: HashMap::new(),
        }
    }

    #[inline(always)]
    pub fn state(&self, addr: u16) -> BlockState {
        self.entries[addr as usize].state
    }

    pub fn size(&self, addr: u16) -> u16 {
        self.entries[addr as usize].size
    }

    /// Last address covered by the block starting at `addr`
    pub fn end(&self, addr: u16) -> u16 {
        self.entries[addr as usize].end
    }

    /// Link entry and size of `addr`, if it can be linked to
    pub fn link_target(&self, addr: u16) -> Option<(CodePtr, u16)> {
        let entry = &self.entries[addr as usize];
        match entry.state {
            BlockState::Compiled(_) => entry.link_entry.map(|link| (link, entry.size)),
            _ => None,
        }
    }

    pub fn waiters(&self, addr: u16) -> Vec<u16> {
        self.waiters.get(&addr).map(|set| set.iter().copied().collect()).unwrap_or_default()
    }

    pub fn linked_from(&self, addr: u16) -> Vec<u16> {
        self.linked_from.get(&addr).map(|set| set.iter().copied().collect()).unwrap_or_default()
    }

    /// Records a compiled block. Returns the blocks that were waiting on it and have been
    /// marked for recompilation.
    pub fn insert(&mut self, block: BlockInfo) -> Vec<u16> {
        let start = block.start;
        self.forget(start);

        let linkable = block.unresolved.is_empty();
        self.entries[start as usize] = BlockEntry {
            state: BlockState::Compiled(block.entry),
            link_entry: linkable.then_some(block.link_entry),
            size: block.size,
            end: block.end,
        };

        for &target in &block.unresolved {
            self.waiters.entry(target).or_default().insert(start);
        }
        if !linkable {
            self.unresolved.insert(start, block.unresolved);
        }
        for &target in &block.links {
            self.linked_from.entry(target).or_default().insert(start);
        }
        if !block.links.is_empty() {
            self.links_to.insert(start, block.links);
        }

        if !linkable {
            return Vec::new();
        }
        let waiting: Vec<u16> = self.waiters.remove(&start).map(|set| set.into_iter().collect()).unwrap_or_default();
        for &waiter in &waiting {
            if waiter != start {
                self.reset(waiter, BlockState::Recompile);
            }
        }
        waiting
    }

    /// Drops the block at `addr` and every block that links into it, transitively.
    /// Returns how many blocks were dropped.
    pub fn invalidate(&mut self, addr: u16) -> usize {
        if self.state(addr) == BlockState::Stub {
            return 0;
        }
        self.reset(addr, BlockState::Stub)
    }

    /// Invalidates every block overlapping `start..=end`
    pub fn invalidate_range(&mut self, start: u16, end: u16) -> usize {
        let hit: Vec<u16> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.state != BlockState::Stub)
            .filter(|&(addr, entry)| addr as u16 <= end && entry.end >= start)
            .map(|(addr, _)| addr as u16)
            .collect();
        hit.into_iter().map(|addr| self.invalidate(addr)).sum()
    }

    pub fn clear(&mut self) {
        self.entries.fill(BlockEntry::default());
        self.unresolved.clear();
        self.waiters.clear();
        self.linked_from.clear();
        self.links_to.clear();
    }

    pub fn compiled(&self) -> usize {
        self.entries.iter().filter(|entry| matches!(entry.state, BlockState::Compiled(_))).count()
    }

    /// Resets `addr` to `state`, cascading to stubs for every block linked into it
    fn reset(&mut self, addr: u16, state: BlockState) -> usize {
        let mut dropped = 0;
        let mut work = vec![(addr, state)];
        while let Some((addr, state)) = work.pop() {
            let was = self.entries[addr as usize].state;
            if was == BlockState::Stub || (was == state && state == BlockState::Recompile) {
                continue;
            }
            self.forget(addr);
            self.entries[addr as usize] = BlockEntry { state, ..BlockEntry::default() };
            dropped += 1;

            if let Some(linkers) = self.linked_from.remove(&addr) {
                if !linkers.is_empty() {
                    log::debug!("{:04x} invalidated, dropping {} blocks linked into it", addr, linkers.len());
                }
                work.extend(linkers.into_iter().map(|linker| (linker, BlockState::Stub)));
            }
        }
        dropped
    }

    /// Removes `addr` from the bookkeeping of the blocks it was waiting on or linked into
    fn forget(&mut self, addr: u16) {
        if let Some(targets) = self.unresolved.remove(&addr) {
            for target in targets {
                if let Some(set) = self.waiters.get_mut(&target) {
                    set.remove(&addr);
                }
            }
        }
        if let Some(targets) = self.links_to.remove(&addr) {
            for target in targets {
                if let Some(set) = self.linked_from.get_mut(&target) {
                    set.remove(&addr);
                }
            }
        }
    }
}

impl Default for BlockTable {
    fn default() -> Self {
        BlockTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(start: u16, end: u16, unresolved: &[u16], links: &[u16]) -> BlockInfo {
        BlockInfo {
            start,
            end,
            size: end - start + 1,
            entry: CodePtr(start as usize * 10),
            link_entry: CodePtr(start as usize * 10 + 4),
            unresolved: unresolved.to_vec(),
            links: links.to_vec(),
        }
    }

    #[test]
    fn waiters_are_marked_for_recompile() {
        let mut table = BlockTable::new();
        assert!(table.insert(block(0x10, 0x12, &[0x20], &[])).is_empty());
        assert_eq!(table.link_target(0x10), None);
        assert_eq!(table.waiters(0x20), vec![0x10]);

        let recompile = table.insert(block(0x20, 0x21, &[], &[]));
        assert_eq!(recompile, vec![0x10]);
        assert_eq!(table.state(0x10), BlockState::Recompile);
        assert_eq!(table.link_target(0x20), Some((CodePtr(0x20 * 10 + 4), 2)));
        assert!(table.waiters(0x20).is_empty());
    }

    #[test]
    fn invalidation_cascades_through_links() {
        let mut table = BlockTable::new();
        table.insert(block(0x30, 0x31, &[], &[]));
        table.insert(block(0x20, 0x22, &[], &[0x30]));
        table.insert(block(0x10, 0x11, &[], &[0x20]));
        table.insert(block(0x40, 0x41, &[], &[]));
        assert_eq!(table.linked_from(0x30), vec![0x20]);

        assert_eq!(table.invalidate_range(0x31, 0x31), 3);
        assert_eq!(table.state(0x30), BlockState::Stub);
        assert_eq!(table.state(0x20), BlockState::Stub);
        assert_eq!(table.state(0x10), BlockState::Stub);
        assert!(matches!(table.state(0x40), BlockState::Compiled(_)));
        assert!(table.linked_from(0x30).is_empty());
        assert!(table.linked_from(0x20).is_empty());
    }

    #[test]
    fn range_overlap() {
        let mut table = BlockTable::new();
        table.insert(block(0x10, 0x14, &[], &[]));
        table.insert(block(0x15, 0x18, &[], &[]));
        assert_eq!(table.invalidate_range(0x00, 0x0f), 0);
        assert_eq!(table.invalidate_range(0x14, 0x14), 1);
        assert_eq!(table.compiled(), 1);
        assert_eq!(table.end(0x15), 0x18);
    }

    #[test]
    fn recompiling_replaces_bookkeeping() {
        let mut table = BlockTable::new();
        table.insert(block(0x10, 0x11, &[0x50], &[]));
        table.insert(block(0x10, 0x11, &[], &[0x60]));
        assert!(table.waiters(0x50).is_empty());
        assert_eq!(table.linked_from(0x60), vec![0x10]);
        assert!(table.link_target(0x10).is_some());
    }
}
