// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process resident / paged-out page bookkeeping
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MemoryRecord, PageDescriptor, SlotState, MemoryStats
//! DEPENDS_ON: config::{VmConfig, MAX_RESIDENT_PAGES, MAX_PAGED_OUT_PAGES}
//! INVARIANTS: used resident descriptors == resident_count; used paged-out descriptors == paged_out_count;
//!             descriptors are keyed by (owning table root, page address), never by address alone
//!
//! Both arenas are fixed-capacity arrays addressed by slot index. The index of
//! a paged-out descriptor doubles as the backing-store slot holding its bytes.

use crate::config::{VmConfig, MAX_PAGED_OUT_PAGES, MAX_RESIDENT_PAGES};
use crate::types::{Pid, PhysAddr, VirtAddr};

/// Occupancy of a descriptor slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Unused,
    Used,
}

/// Tracking record for one user page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageDescriptor {
    pub state: SlotState,
    /// Page-aligned user address.
    pub va: VirtAddr,
    /// Root of the page table the page belongs to.
    pub owner: PhysAddr,
    /// Aging counter maintained by NFUA / LAPA.
    pub age: u32,
    /// Insertion order used by second-chance FIFO.
    pub order: u64,
}

impl PageDescriptor {
    pub const UNUSED: Self =
        Self { state: SlotState::Unused, va: VirtAddr::new(0), owner: PhysAddr::new(0), age: 0, order: 0 };

    #[inline]
    pub fn is_used(&self) -> bool {
        self.state == SlotState::Used
    }

    #[inline]
    fn tracks(&self, owner: PhysAddr, va: VirtAddr) -> bool {
        self.is_used() && self.owner == owner && self.va == va
    }
}

/// Counter snapshot, used by diagnostics and the page-fault-count syscall.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub resident: usize,
    pub paged_out: usize,
    pub faults: u64,
    pub page_outs: u64,
}

/// Bounded residency bookkeeping owned by one process.
#[derive(Clone, Debug)]
pub struct MemoryRecord {
    resident: [PageDescriptor; MAX_RESIDENT_PAGES],
    paged_out: [PageDescriptor; MAX_PAGED_OUT_PAGES],
    resident_limit: usize,
    paged_out_limit: usize,
    resident_count: usize,
    paged_out_count: usize,
    next_order: u64,
    faults: u64,
    page_outs: u64,
}

impl MemoryRecord {
    pub fn new(config: VmConfig) -> Self {
        Self {
            resident: [PageDescriptor::UNUSED; MAX_RESIDENT_PAGES],
            paged_out: [PageDescriptor::UNUSED; MAX_PAGED_OUT_PAGES],
            resident_limit: config.max_resident(),
            paged_out_limit: config.max_paged_out(),
            resident_count: 0,
            paged_out_count: 0,
            next_order: 0,
            faults: 0,
            page_outs: 0,
        }
    }

    pub fn resident_count(&self) -> usize {
        self.resident_count
    }

    pub fn paged_out_count(&self) -> usize {
        self.paged_out_count
    }

    /// Resident plus paged-out pages.
    pub fn total(&self) -> usize {
        self.resident_count + self.paged_out_count
    }

    pub fn faults(&self) -> u64 {
        self.faults
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            resident: self.resident_count,
            paged_out: self.paged_out_count,
            faults: self.faults,
            page_outs: self.page_outs,
        }
    }

    /// Hands out the next insertion order. Never reset for the lifetime of
    /// the process.
    pub fn next_order(&mut self) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        order
    }

    /// First unused resident slot, or `None` when the resident set is full.
    /// `None` is the normal trigger for eviction.
    pub fn free_resident_slot(&self) -> Option<usize> {
        self.resident[..self.resident_limit].iter().position(|d| !d.is_used())
    }

    /// Records a newly resident page in the first free slot.
    pub fn register_resident(&mut self, owner: PhysAddr, va: VirtAddr, age: u32) -> Option<usize> {
        let slot = self.free_resident_slot()?;
        let order = self.next_order();
        self.install_resident(slot, owner, va, age, order);
        Some(slot)
    }

    /// Writes `slot` unconditionally. Used both for free slots and for
    /// reusing a victim's slot during page-in.
    pub fn install_resident(&mut self, slot: usize, owner: PhysAddr, va: VirtAddr, age: u32, order: u64) {
        let desc = &mut self.resident[slot];
        if !desc.is_used() {
            self.resident_count += 1;
        }
        *desc = PageDescriptor { state: SlotState::Used, va, owner, age, order };
    }

    pub fn resident(&self, slot: usize) -> &PageDescriptor {
        &self.resident[slot]
    }

    pub fn resident_mut(&mut self, slot: usize) -> &mut PageDescriptor {
        &mut self.resident[slot]
    }

    /// Used resident descriptors with their slot index, in slot order.
    pub fn resident_slots(&self) -> impl Iterator<Item = (usize, &PageDescriptor)> + '_ {
        self.resident[..self.resident_limit].iter().enumerate().filter(|(_, d)| d.is_used())
    }

    /// Mutable variant of [`MemoryRecord::resident_slots`].
    pub fn resident_slots_mut(&mut self) -> impl Iterator<Item = (usize, &mut PageDescriptor)> + '_ {
        self.resident[..self.resident_limit].iter_mut().enumerate().filter(|(_, d)| d.is_used())
    }

    pub fn find_resident(&self, owner: PhysAddr, va: VirtAddr) -> Option<usize> {
        self.resident.iter().position(|d| d.tracks(owner, va))
    }

    /// Clears `slot` and returns what it held.
    pub fn release_resident_slot(&mut self, slot: usize) -> PageDescriptor {
        let desc = core::mem::replace(&mut self.resident[slot], PageDescriptor::UNUSED);
        if desc.is_used() {
            self.resident_count -= 1;
        }
        desc
    }

    /// Forgets a resident page. Returns false if it was not tracked.
    pub fn release_resident(&mut self, owner: PhysAddr, va: VirtAddr) -> bool {
        match self.find_resident(owner, va) {
            Some(slot) => {
                self.release_resident_slot(slot);
                true
            }
            None => false,
        }
    }

    /// Reserves a paged-out slot for `va`; the index is its backing-store slot.
    pub fn claim_paged_out(&mut self, owner: PhysAddr, va: VirtAddr) -> Option<usize> {
        let slot = self.paged_out[..self.paged_out_limit].iter().position(|d| !d.is_used())?;
        self.paged_out[slot] = PageDescriptor { state: SlotState::Used, va, owner, age: 0, order: 0 };
        self.paged_out_count += 1;
        Some(slot)
    }

    pub fn find_paged_out(&self, owner: PhysAddr, va: VirtAddr) -> Option<usize> {
        self.paged_out.iter().position(|d| d.tracks(owner, va))
    }

    pub fn release_paged_out_slot(&mut self, slot: usize) {
        if self.paged_out[slot].is_used() {
            self.paged_out[slot] = PageDescriptor::UNUSED;
            self.paged_out_count -= 1;
        }
    }

    /// Forgets a paged-out page and returns the backing-store slot it held.
    pub fn release_paged_out(&mut self, owner: PhysAddr, va: VirtAddr) -> Option<usize> {
        let slot = self.find_paged_out(owner, va)?;
        self.release_paged_out_slot(slot);
        Some(slot)
    }

    pub(crate) fn note_fault(&mut self) {
        self.faults += 1;
    }

    pub(crate) fn note_page_out(&mut self) {
        self.page_outs += 1;
    }

    /// Record for a forked child: every descriptor of `parent_table` is
    /// rebound to `child_table` at the same slot, so paged-out pages keep
    /// their positional backing-store layout. Counters restart for the child;
    /// the insertion-order clock carries over.
    pub fn fork_for(&self, parent_table: PhysAddr, child_table: PhysAddr) -> Self {
        let mut child = self.clone();
        child.faults = 0;
        child.page_outs = 0;
        child.resident_count = 0;
        child.paged_out_count = 0;
        for desc in child.resident.iter_mut() {
            rebind(desc, parent_table, child_table, &mut child.resident_count);
        }
        for desc in child.paged_out.iter_mut() {
            rebind(desc, parent_table, child_table, &mut child.paged_out_count);
        }
        child
    }

    /// Logs every used descriptor.
    pub fn dump(&self, pid: Pid) {
        log_debug!(target: "swap", "pid {} resident={} paged_out={}", pid, self.resident_count, self.paged_out_count);
        for (slot, desc) in self.resident_slots() {
            log_debug!(
                target: "swap",
                "  mem[{}] va={} age={:#010x} order={}",
                slot,
                desc.va,
                desc.age,
                desc.order
            );
        }
        for (slot, desc) in self.paged_out.iter().enumerate().filter(|(_, d)| d.is_used()) {
            log_debug!(target: "swap", "  file[{}] va={}", slot, desc.va);
        }
    }
}

fn rebind(desc: &mut PageDescriptor, from: PhysAddr, to: PhysAddr, count: &mut usize) {
    if desc.is_used() && desc.owner == from {
        desc.owner = to;
        *count += 1;
    } else {
        *desc = PageDescriptor::UNUSED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PAGE_SIZE;

    const ROOT_A: PhysAddr = PhysAddr::new(0x8000_0000);
    const ROOT_B: PhysAddr = PhysAddr::new(0x8000_1000);

    fn page(n: usize) -> VirtAddr {
        VirtAddr::new(n * PAGE_SIZE)
    }

    fn small() -> MemoryRecord {
        MemoryRecord::new(VmConfig::new(3, 5).expect("budget"))
    }

    #[test]
    fn register_until_full() {
        let mut rec = small();
        for n in 0..3 {
            assert_eq!(rec.register_resident(ROOT_A, page(n), 0), Some(n));
        }
        assert_eq!(rec.free_resident_slot(), None);
        assert_eq!(rec.register_resident(ROOT_A, page(3), 0), None);
        assert_eq!(rec.resident_count(), 3);
        let orders: alloc::vec::Vec<u64> = rec.resident_slots().map(|(_, d)| d.order).collect();
        assert_eq!(orders, [0, 1, 2]);
    }

    #[test]
    fn lookups_are_keyed_by_owner() {
        let mut rec = small();
        rec.register_resident(ROOT_A, page(1), 0);
        rec.register_resident(ROOT_B, page(1), 0);
        assert!(rec.release_resident(ROOT_B, page(1)));
        assert_eq!(rec.find_resident(ROOT_A, page(1)), Some(0));
        assert_eq!(rec.find_resident(ROOT_B, page(1)), None);
        assert!(!rec.release_resident(ROOT_B, page(1)));
        assert_eq!(rec.resident_count(), 1);
    }

    #[test]
    fn paged_out_slots_are_bounded() {
        let mut rec = small();
        assert_eq!(rec.claim_paged_out(ROOT_A, page(0)), Some(0));
        assert_eq!(rec.claim_paged_out(ROOT_A, page(1)), Some(1));
        assert_eq!(rec.claim_paged_out(ROOT_A, page(2)), None);
        assert_eq!(rec.release_paged_out(ROOT_A, page(0)), Some(0));
        assert_eq!(rec.claim_paged_out(ROOT_A, page(2)), Some(0));
        assert_eq!(rec.paged_out_count(), 2);
        assert_eq!(rec.total(), 2);
    }

    #[test]
    fn order_counter_survives_release() {
        let mut rec = small();
        rec.register_resident(ROOT_A, page(0), 0);
        rec.release_resident(ROOT_A, page(0));
        let slot = rec.register_resident(ROOT_A, page(0), 0).expect("slot");
        assert_eq!(rec.resident(slot).order, 1);
    }

    #[test]
    fn fork_rebinds_owner_and_keeps_slots() {
        let mut rec = small();
        rec.register_resident(ROOT_A, page(0), 7);
        rec.claim_paged_out(ROOT_A, page(4));
        rec.claim_paged_out(ROOT_A, page(5));
        rec.release_paged_out(ROOT_A, page(4));
        rec.note_fault();

        let child = rec.fork_for(ROOT_A, ROOT_B);
        assert_eq!(child.find_resident(ROOT_B, page(0)), Some(0));
        assert_eq!(child.resident(0).age, 7);
        assert_eq!(child.find_paged_out(ROOT_B, page(5)), Some(1));
        assert_eq!(child.find_paged_out(ROOT_A, page(5)), None);
        assert_eq!(child.stats(), MemoryStats { resident: 1, paged_out: 1, faults: 0, page_outs: 0 });
    }
}
