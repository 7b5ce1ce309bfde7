// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-in / page-out and the page-fault entry point
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace::handle_page_fault
//! DEPENDS_ON: mm::{PageTable, frame, VmContext}, swap::{residency, policy, store}
//! INVARIANTS: Page-in reads the faulting page before the victim is written out;
//!             every PTE state change is followed by a full TLB flush;
//!             a frame is freed only after its PTE stopped referencing it
//!
//! During exec a process owns two tables whose descriptors share one
//! record. [`Tables`] resolves a descriptor's owner back to the table that
//! holds its PTE.

use super::policy::{AccessBits, EvictionPolicy};
use super::residency::MemoryRecord;
use super::FaultError;
use crate::mm::frame::{frame_bytes, zero_frame};
use crate::mm::pte::USER_RWX;
use crate::mm::{AddressSpace, PageFlags, PageTable, Pte, PteState, VmContext, MAX_VA, PAGE_SIZE};
use crate::types::{Pid, PhysAddr, VirtAddr};

/// The page tables of one process, keyed by root.
pub(crate) struct Tables<'a> {
    current: &'a mut PageTable,
    staged: Option<&'a mut PageTable>,
    cleared: bool,
}

impl<'a> Tables<'a> {
    pub(crate) fn new(current: &'a mut PageTable, staged: Option<&'a mut PageTable>) -> Self {
        Self { current, staged, cleared: false }
    }

    /// Whether an accessed bit was cleared since the last call. A cleared
    /// bit needs a TLB flush before hardware sets it again.
    pub(crate) fn take_cleared(&mut self) -> bool {
        core::mem::take(&mut self.cleared)
    }

    pub(crate) fn by_root(&mut self, root: PhysAddr) -> &mut PageTable {
        if self.current.root() == root {
            return &mut *self.current;
        }
        match self.staged.as_deref_mut() {
            Some(table) if table.root() == root => table,
            _ => panic!("vm: descriptor refers to unknown page table {}", root),
        }
    }
}

impl AccessBits for Tables<'_> {
    fn take_accessed(&mut self, owner: PhysAddr, va: VirtAddr) -> bool {
        let accessed = self.by_root(owner).take_accessed(va);
        self.cleared |= accessed;
        accessed
    }
}

/// Per-call view over the process state the engine mutates.
pub(crate) struct Swapper<'s, 'c, P: EvictionPolicy> {
    pub(crate) pid: Pid,
    pub(crate) tables: Tables<'s>,
    pub(crate) record: &'s mut MemoryRecord,
    pub(crate) policy: &'s mut P,
    pub(crate) ctx: &'s mut VmContext<'c>,
}

impl<P: EvictionPolicy> Swapper<'_, '_, P> {
    fn select_victim(&mut self) -> usize {
        let slot = self.policy.select_victim(self.record, &mut self.tables);
        if self.tables.take_cleared() {
            self.ctx.tlb.flush_all();
        }
        slot
    }

    /// Asks the policy for a victim and pages it out, leaving its resident
    /// slot free. Returns the freed slot.
    pub(crate) fn evict_one(&mut self) -> usize {
        let slot = self.select_victim();
        let victim = self.record.release_resident_slot(slot);
        log_debug!(target: "swap", "pid {} evicts {} ({})", self.pid, victim.va, P::NAME);
        self.page_out(victim.owner, victim.va);
        slot
    }

    /// Moves a resident page to the backing store: the content goes to a
    /// fresh paged-out slot, the PTE becomes paged-out and the frame is freed.
    /// The caller has already dropped the page's resident descriptor.
    pub(crate) fn page_out(&mut self, owner: PhysAddr, va: VirtAddr) {
        let table = self.tables.by_root(owner);
        let Some(pte) = table.walk(va) else {
            panic!("vm: missing PTE for {} during page-out", va);
        };
        let PteState::Resident { frame, flags } = pte.state() else {
            panic!("vm: page-out of non-resident {} ({:#x})", va, pte.bits());
        };
        let Some(slot) = self.record.claim_paged_out(owner, va) else {
            panic!("vm: pid {} has no free paged-out slot for {}", self.pid, va);
        };
        // SAFETY: the frame is mapped only by this PTE and nothing else borrows it.
        self.ctx.store.write_page(self.pid, slot, va, unsafe { frame_bytes(frame) });
        *pte = Pte::paged_out(flags);
        self.ctx.tlb.flush_all();
        self.ctx.frames.free(frame);
        self.record.note_page_out();
        log_trace!(target: "swap", "pid {} page-out {} -> slot {}", self.pid, va, slot);
    }

    /// Unmaps `[start, end)` from the table rooted at `owner`. Frames are
    /// freed and resident or paged-out descriptors dropped; a dropped
    /// paged-out descriptor gives its backing-store slot back.
    pub(crate) fn release_range(&mut self, owner: PhysAddr, start: usize, end: usize) {
        if end <= start {
            return;
        }
        let record = &mut *self.record;
        let frames = &mut *self.ctx.frames;
        let npages = (end - start) / PAGE_SIZE;
        self.tables.by_root(owner).unmap_pages(VirtAddr::new(start), npages, |va, pte| match pte.state() {
            PteState::Resident { frame, .. } => {
                frames.free(frame);
                record.release_resident(owner, va);
            }
            _ => {
                record.release_paged_out(owner, va);
            }
        });
        self.ctx.tlb.flush_all();
    }

    /// Brings the paged-out page containing `fault_va` back into memory,
    /// evicting a victim when the resident set is full.
    pub(crate) fn page_in(&mut self, owner: PhysAddr, fault_va: VirtAddr) -> Result<(), FaultError> {
        let va = fault_va.page_floor();
        self.record.note_fault();
        let Some(frame) = self.ctx.frames.alloc() else {
            log_warn!(target: "swap", "pid {} page-in of {}: out of frames", self.pid, va);
            return Err(FaultError::OutOfMemory);
        };
        zero_frame(frame);
        let Some(stored) = self.record.find_paged_out(owner, va) else {
            panic!("vm: pid {} has no backing slot for paged-out {}", self.pid, va);
        };

        // The new page takes over the victim's descriptor; the victim's
        // content is written out only after the new page has been read in.
        let (slot, victim) = match self.record.free_resident_slot() {
            Some(slot) => (slot, None),
            None => {
                let slot = self.select_victim();
                (slot, Some(*self.record.resident(slot)))
            }
        };
        let order = self.record.next_order();
        self.record.install_resident(slot, owner, va, P::INITIAL_AGE, order);

        let table = self.tables.by_root(owner);
        let Some(pte) = table.walk(va) else {
            panic!("vm: missing PTE for {} during page-in", va);
        };
        if pte.is_valid() {
            panic!("vm: page-in of already resident {}", va);
        }
        let flags = (pte.flags() | USER_RWX) - PageFlags::ACCESSED - PageFlags::DIRTY;
        if table.remap_pages(va, PAGE_SIZE, frame, flags).is_err() {
            panic!("vm: page-in remap failed for {}", va);
        }
        self.ctx.tlb.flush_all();

        // SAFETY: the frame was just allocated and is referenced by one PTE only.
        self.ctx.store.read_page(self.pid, stored, va, unsafe { frame_bytes(frame) });
        self.record.release_paged_out_slot(stored);

        if let Some(victim) = victim {
            log_debug!(target: "swap", "pid {} evicts {} ({})", self.pid, victim.va, P::NAME);
            self.page_out(victim.owner, victim.va);
        }
        log_trace!(target: "swap", "pid {} page-in {} <- slot {}", self.pid, va, stored);
        Ok(())
    }
}

impl<P: EvictionPolicy> AddressSpace<P> {
    /// Services a page fault at `va` on the current table.
    ///
    /// Returns [`FaultError::NotPagedOut`] for any fault the swap layer does
    /// not own; the trap handler treats those as ordinary bad accesses.
    pub fn handle_page_fault(&mut self, ctx: &mut VmContext<'_>, va: VirtAddr) -> Result<(), FaultError> {
        if va.raw() >= MAX_VA {
            return Err(FaultError::NotPagedOut);
        }
        let page = va.page_floor();
        match self.page_table().entry(page) {
            // Guard pages stay inaccessible even when paged out.
            Some(pte) if pte.is_paged_out() && pte.flags().contains(PageFlags::USER) => {}
            _ => return Err(FaultError::NotPagedOut),
        }
        let owner = self.page_table().root();
        self.swapper(ctx).page_in(owner, page)
    }
}
