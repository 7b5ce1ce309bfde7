// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process backing store for paged-out page content
//! OWNERS: @kernel-mm-team
//! PUBLIC API: BackingStore (trait), MemoryBackingStore
//! DEPENDS_ON: alloc::collections::BTreeMap
//! INVARIANTS: Slot indices are the paged-out descriptor indices of the owning process;
//!             a slot is only read after it was written
//!
//! The kernel implementation sits on a per-process swap file. Slot `n` lives
//! at byte offset `n * PAGE_SIZE`.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::mm::PAGE_SIZE;
use crate::types::{Pid, VirtAddr};

/// Storage for the content of paged-out pages.
///
/// Failures inside the store are fatal to the kernel and are reported by
/// panicking in the implementation; the swap engine has no recovery path.
pub trait BackingStore {
    /// Saves one page into `slot` of `pid`'s region.
    fn write_page(&mut self, pid: Pid, slot: usize, va: VirtAddr, page: &[u8; PAGE_SIZE]);
    /// Loads the page stored in `slot` of `pid`'s region.
    fn read_page(&mut self, pid: Pid, slot: usize, va: VirtAddr, page: &mut [u8; PAGE_SIZE]);
    /// Gives `child` a copy of every slot `parent` holds (fork).
    fn inherit(&mut self, parent: Pid, child: Pid);
    /// Drops `pid`'s region.
    fn release(&mut self, pid: Pid);
}

struct StoredPage {
    va: VirtAddr,
    bytes: Box<[u8; PAGE_SIZE]>,
}

impl Clone for StoredPage {
    fn clone(&self) -> Self {
        Self { va: self.va, bytes: Box::new(*self.bytes) }
    }
}

/// RAM-backed store used by hosted builds and bring-up.
#[derive(Default)]
pub struct MemoryBackingStore {
    slots: BTreeMap<(Pid, usize), StoredPage>,
    writes: usize,
    reads: usize,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of page writes since creation.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Number of page reads since creation.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Number of slots currently holding data for `pid`.
    pub fn slots_held(&self, pid: Pid) -> usize {
        self.slots.keys().filter(|(owner, _)| *owner == pid).count()
    }
}

impl BackingStore for MemoryBackingStore {
    fn write_page(&mut self, pid: Pid, slot: usize, va: VirtAddr, page: &[u8; PAGE_SIZE]) {
        self.writes += 1;
        self.slots.insert((pid, slot), StoredPage { va, bytes: Box::new(*page) });
    }

    fn read_page(&mut self, pid: Pid, slot: usize, va: VirtAddr, page: &mut [u8; PAGE_SIZE]) {
        let Some(stored) = self.slots.get(&(pid, slot)) else {
            panic!("vm: pid {} read of empty swap slot {}", pid, slot);
        };
        assert_eq!(stored.va, va, "vm: pid {} swap slot {} holds another page", pid, slot);
        page.copy_from_slice(&stored.bytes[..]);
        self.reads += 1;
    }

    fn inherit(&mut self, parent: Pid, child: Pid) {
        let copies: alloc::vec::Vec<(usize, StoredPage)> = self
            .slots
            .range((parent, 0)..=(parent, usize::MAX))
            .map(|((_, slot), page)| (*slot, page.clone()))
            .collect();
        for (slot, page) in copies {
            self.slots.insert((child, slot), page);
        }
    }

    fn release(&mut self, pid: Pid) {
        self.slots.retain(|(owner, _), _| *owner != pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(fill: u8) -> [u8; PAGE_SIZE] {
        [fill; PAGE_SIZE]
    }

    #[test]
    fn write_then_read_returns_content() {
        let mut store = MemoryBackingStore::new();
        let pid = Pid::from_raw(3);
        store.write_page(pid, 2, VirtAddr::new(0x5000), &page(0x5A));
        let mut out = page(0);
        store.read_page(pid, 2, VirtAddr::new(0x5000), &mut out);
        assert!(out.iter().all(|b| *b == 0x5A));
        assert_eq!((store.writes(), store.reads()), (1, 1));
    }

    #[test]
    fn inherit_copies_and_release_drops() {
        let mut store = MemoryBackingStore::new();
        let parent = Pid::from_raw(3);
        let child = Pid::from_raw(4);
        store.write_page(parent, 0, VirtAddr::new(0), &page(1));
        store.write_page(parent, 1, VirtAddr::new(0x1000), &page(2));
        store.inherit(parent, child);
        store.write_page(parent, 0, VirtAddr::new(0), &page(9));

        let mut out = page(0);
        store.read_page(child, 0, VirtAddr::new(0), &mut out);
        assert_eq!(out[0], 1);
        assert_eq!(store.slots_held(child), 2);

        store.release(parent);
        assert_eq!(store.slots_held(parent), 0);
        assert_eq!(store.slots_held(child), 2);
    }

    #[test]
    #[should_panic(expected = "empty swap slot")]
    fn reading_unwritten_slot_panics() {
        let mut store = MemoryBackingStore::new();
        let mut out = page(0);
        store.read_page(Pid::from_raw(3), 0, VirtAddr::new(0), &mut out);
    }
}
