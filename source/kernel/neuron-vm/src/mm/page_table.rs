// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table implementation with lazy allocation of intermediate levels.
//!
//! A virtual address splits into three 9-bit indices and a 12-bit offset:
//!
//! ```text
//!   38..30  level-2 index
//!   29..21  level-1 index
//!   20..12  level-0 index
//!   11..0   byte offset
//! ```
//!
//! Table pages are frames obtained from the caller's [`FrameAllocator`]; the
//! table never frees anything on drop, teardown goes through [`PageTable::free_walk`].

use super::frame::{zero_frame, FrameAllocator};
use super::pte::{PageFlags, Pte, PteState};
use super::{MapError, MAX_VA, PAGE_SIZE};
use crate::types::{PhysAddr, VirtAddr};

/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;

type TablePage = [Pte; PT_ENTRIES];

/// Three-level Sv39 page table allocating intermediate levels on demand.
#[derive(Debug, PartialEq, Eq)]
pub struct PageTable {
    root: PhysAddr,
}

impl PageTable {
    /// Creates an empty table with a fresh, zeroed root page.
    pub fn new(frames: &mut dyn FrameAllocator) -> Result<Self, MapError> {
        let root = frames.alloc().ok_or(MapError::OutOfMemory)?;
        zero_frame(root);
        Ok(Self { root })
    }

    /// Physical address of the root page; also identifies the table in
    /// residency bookkeeping.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Returns the SATP value selecting this table in Sv39 mode.
    pub fn satp(&self) -> usize {
        const MODE_SV39: usize = 8;
        (MODE_SV39 << 60) | (self.root.raw() >> 12)
    }

    /// Returns a copy of the leaf entry for `va`, if its tables exist.
    pub fn entry(&self, va: VirtAddr) -> Option<Pte> {
        // SAFETY: the non-allocating walk never writes.
        let pte = unsafe { self.walk_raw(va, None) }.ok()?;
        // SAFETY: `walk_raw` returned a pointer into a live table page.
        Some(unsafe { *pte })
    }

    /// Returns the leaf entry for `va` without creating missing levels.
    ///
    /// Panics if `va` is at or above [`MAX_VA`].
    pub fn walk(&mut self, va: VirtAddr) -> Option<&mut Pte> {
        // SAFETY: `&mut self` guarantees exclusive access to the table pages.
        let pte = unsafe { self.walk_raw(va, None) }.ok()?;
        Some(unsafe { &mut *pte })
    }

    /// Returns the leaf entry for `va`, allocating and zeroing missing levels.
    ///
    /// Panics if `va` is at or above [`MAX_VA`].
    pub fn walk_alloc(&mut self, va: VirtAddr, frames: &mut dyn FrameAllocator) -> Result<&mut Pte, MapError> {
        // SAFETY: `&mut self` guarantees exclusive access to the table pages.
        let pte = unsafe { self.walk_raw(va, Some(frames)) }?;
        Ok(unsafe { &mut *pte })
    }

    /// Installs leaf mappings for `[va, va + size)` starting at frame `pa`.
    ///
    /// `va` and `size` need not be page aligned. Panics if a target leaf is
    /// already in use: a remap is always a bookkeeping bug.
    pub fn map_pages(
        &mut self,
        va: VirtAddr,
        size: usize,
        pa: PhysAddr,
        flags: PageFlags,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), MapError> {
        if !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        assert!(size != 0, "vm: map_pages with zero size at {}", va);
        let mut addr = va.page_floor();
        let last = va.add(size - 1).page_floor();
        let mut frame = pa;
        loop {
            let pte = self.walk_alloc(addr, frames)?;
            if !pte.is_unmapped() {
                panic!("vm: remap of {} ({:#x})", addr, pte.bits());
            }
            *pte = Pte::resident(frame, flags);
            if addr == last {
                return Ok(());
            }
            addr = addr.add(PAGE_SIZE);
            frame = frame.add(PAGE_SIZE);
        }
    }

    /// Overwrites leaf mappings for `[va, va + size)`. Never allocates; a
    /// missing intermediate table yields [`MapError::NotMapped`].
    pub fn remap_pages(&mut self, va: VirtAddr, size: usize, pa: PhysAddr, flags: PageFlags) -> Result<(), MapError> {
        if !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        assert!(size != 0, "vm: remap_pages with zero size at {}", va);
        let mut addr = va.page_floor();
        let last = va.add(size - 1).page_floor();
        let mut frame = pa;
        loop {
            let pte = self.walk(addr).ok_or(MapError::NotMapped)?;
            *pte = Pte::resident(frame, flags);
            if addr == last {
                return Ok(());
            }
            addr = addr.add(PAGE_SIZE);
            frame = frame.add(PAGE_SIZE);
        }
    }

    /// Clears `npages` leaves starting at the page-aligned `va`.
    ///
    /// Every leaf must be resident or paged-out. `on_unmap` receives each
    /// removed entry so the caller can free frames and release bookkeeping.
    pub fn unmap_pages(&mut self, va: VirtAddr, npages: usize, mut on_unmap: impl FnMut(VirtAddr, Pte)) {
        assert!(va.is_page_aligned(), "vm: unmap of unaligned {}", va);
        for index in 0..npages {
            let addr = va.add(index * PAGE_SIZE);
            let Some(pte) = self.walk(addr) else {
                panic!("vm: unmap walk failed at {}", addr);
            };
            let old = *pte;
            match old.state() {
                PteState::Resident { .. } | PteState::PagedOut { .. } => {}
                PteState::Unmapped => panic!("vm: unmap of unmapped {}", addr),
                PteState::Table(_) => panic!("vm: unmap of non-leaf {}", addr),
                PteState::Invalid(bits) => panic!("vm: unmap of corrupt entry {:#x} at {}", bits, addr),
            }
            *pte = Pte::EMPTY;
            on_unmap(addr, old);
        }
    }

    /// Frees every table page. All leaves must already be unmapped.
    pub fn free_walk(self, frames: &mut dyn FrameAllocator) {
        // SAFETY: consuming `self` ends all other access to the table pages.
        unsafe { free_level(self.root, frames) };
    }

    /// Looks up the frame behind a resident, user-accessible page.
    pub fn translate_user(&self, va: VirtAddr) -> Option<PhysAddr> {
        if va.raw() >= MAX_VA {
            return None;
        }
        match self.entry(va)?.state() {
            PteState::Resident { frame, flags } if flags.contains(PageFlags::USER) => Some(frame),
            _ => None,
        }
    }

    /// Adds `flags` to an existing leaf (resident or paged-out).
    pub fn set_leaf_flags(&mut self, va: VirtAddr, flags: PageFlags) -> Result<(), MapError> {
        let pte = self.leaf_mut(va)?;
        *pte = pte.with_flags(flags);
        Ok(())
    }

    /// Removes `flags` from an existing leaf (resident or paged-out).
    pub fn clear_leaf_flags(&mut self, va: VirtAddr, flags: PageFlags) -> Result<(), MapError> {
        let pte = self.leaf_mut(va)?;
        *pte = pte.without_flags(flags);
        Ok(())
    }

    /// Marks a page inaccessible from user mode (stack guard page).
    pub fn clear_user(&mut self, va: VirtAddr) {
        if self.clear_leaf_flags(va, PageFlags::USER).is_err() {
            panic!("vm: clear_user on missing page {}", va);
        }
    }

    /// Returns whether the hardware accessed bit of a resident page was set,
    /// clearing it. Panics if the page has no resident entry.
    pub fn take_accessed(&mut self, va: VirtAddr) -> bool {
        let Some(pte) = self.walk(va).filter(|pte| pte.is_leaf()) else {
            panic!("vm: missing resident PTE for {} during swap bookkeeping", va);
        };
        let accessed = pte.flags().contains(PageFlags::ACCESSED);
        if accessed {
            *pte = pte.without_flags(PageFlags::ACCESSED);
        }
        accessed
    }

    fn leaf_mut(&mut self, va: VirtAddr) -> Result<&mut Pte, MapError> {
        let pte = self.walk(va).ok_or(MapError::NotMapped)?;
        match pte.state() {
            PteState::Resident { .. } | PteState::PagedOut { .. } => Ok(pte),
            _ => Err(MapError::NotMapped),
        }
    }

    /// # Safety
    ///
    /// The caller must hold exclusive access to the table when it intends to
    /// write through the returned pointer, or allocation is requested.
    unsafe fn walk_raw(&self, va: VirtAddr, mut frames: Option<&mut dyn FrameAllocator>) -> Result<*mut Pte, MapError> {
        if va.raw() >= MAX_VA {
            panic!("vm: walk beyond MAX_VA: {}", va);
        }
        let mut table = self.root;
        for level in [2, 1] {
            let slot = entry_ptr(table, level, va);
            // SAFETY: `slot` points into a live table page owned by this PageTable.
            match unsafe { *slot }.state() {
                PteState::Table(child) => table = child,
                PteState::Unmapped => {
                    let Some(frames) = frames.as_mut() else {
                        return Err(MapError::NotMapped);
                    };
                    let child = frames.alloc().ok_or(MapError::OutOfMemory)?;
                    zero_frame(child);
                    // SAFETY: allocation implies the caller holds the table exclusively.
                    unsafe { *slot = Pte::table(child) };
                    table = child;
                }
                other => panic!("vm: unexpected {:?} at level {} for {}", other, level, va),
            }
        }
        Ok(entry_ptr(table, 0, va))
    }
}

/// # Safety
///
/// `table` must be a table page no longer reachable by anyone else.
unsafe fn free_level(table: PhysAddr, frames: &mut dyn FrameAllocator) {
    // SAFETY: exclusive per the contract above.
    let entries = unsafe { &mut *table.as_mut_ptr::<TablePage>() };
    for pte in entries.iter_mut() {
        match pte.state() {
            PteState::Unmapped => {}
            PteState::Table(child) => {
                if child.is_null() {
                    panic!("vm: free_walk found a table entry without a child");
                }
                // SAFETY: the child is only reachable through this entry.
                unsafe { free_level(child, frames) };
                *pte = Pte::EMPTY;
            }
            other => panic!("vm: free_walk found live leaf {:?}", other),
        }
    }
    frames.free(table);
}

#[inline]
fn entry_ptr(table: PhysAddr, level: usize, va: VirtAddr) -> *mut Pte {
    table.as_mut_ptr::<TablePage>().cast::<Pte>().wrapping_add(index(level, va))
}

#[inline]
fn index(level: usize, va: VirtAddr) -> usize {
    (va.raw() >> (12 + 9 * level)) & (PT_ENTRIES - 1)
}
