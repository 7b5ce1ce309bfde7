// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Structured view over raw Sv39 page-table entries.
//!
//! Raw entries are only built through the constructors below, which keep the
//! resident and paged-out states mutually exclusive.

use bitflags::bitflags;

use crate::types::PhysAddr;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// Software bit (RSW): page content lives in the backing store.
        const PAGED_OUT = 1 << 9;
    }
}

/// Permissions that make an entry a leaf.
pub const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Permissions given to anonymous user pages (heap growth, paged-in pages).
pub const USER_RWX: PageFlags = PageFlags::READ
    .union(PageFlags::WRITE)
    .union(PageFlags::EXECUTE)
    .union(PageFlags::USER);

const FLAG_BITS: usize = 10;
const PPN_MASK: usize = (1 << 44) - 1;

/// Decoded state of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PteState {
    /// All bits clear.
    Unmapped,
    /// Points at the next level of the tree.
    Table(PhysAddr),
    /// Leaf backed by a frame.
    Resident { frame: PhysAddr, flags: PageFlags },
    /// Leaf whose content lives in the backing store; no frame.
    PagedOut { flags: PageFlags },
    /// Any other bit pattern: a corrupted entry.
    Invalid(usize),
}

/// A single Sv39 page-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(usize);

impl Pte {
    pub const EMPTY: Self = Self(0);

    /// Leaf entry for a resident page. `PAGED_OUT` is dropped and `VALID` forced.
    pub fn resident(frame: PhysAddr, flags: PageFlags) -> Self {
        let flags = (flags - PageFlags::PAGED_OUT) | PageFlags::VALID;
        Self(Self::ppn_bits(frame) | flags.bits())
    }

    /// Leaf entry for a paged-out page. The frame field is cleared and
    /// `VALID` dropped; permission bits are preserved for the later page-in.
    pub fn paged_out(flags: PageFlags) -> Self {
        let flags = (flags - PageFlags::VALID) | PageFlags::PAGED_OUT;
        Self(flags.bits())
    }

    /// Non-leaf entry pointing at a child table.
    pub fn table(child: PhysAddr) -> Self {
        Self(Self::ppn_bits(child) | PageFlags::VALID.bits())
    }

    /// Rebuilds an entry from its raw encoding.
    pub const fn from_bits(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn bits(self) -> usize {
        self.0
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Frame number field converted back to an address.
    pub fn frame(self) -> PhysAddr {
        PhysAddr::new(((self.0 >> FLAG_BITS) & PPN_MASK) << 12)
    }

    pub const fn is_unmapped(self) -> bool {
        self.0 == 0
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PageFlags::VALID)
    }

    pub fn is_paged_out(self) -> bool {
        self.flags().contains(PageFlags::PAGED_OUT)
    }

    /// Valid entry carrying leaf permissions.
    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().intersects(LEAF_PERMS)
    }

    pub fn state(self) -> PteState {
        let flags = self.flags();
        if self.0 == 0 {
            return PteState::Unmapped;
        }
        match (flags.contains(PageFlags::VALID), flags.contains(PageFlags::PAGED_OUT)) {
            (true, false) if flags.intersects(LEAF_PERMS) => PteState::Resident { frame: self.frame(), flags },
            (true, false) => PteState::Table(self.frame()),
            (false, true) if self.frame().is_null() => PteState::PagedOut { flags },
            _ => PteState::Invalid(self.0),
        }
    }

    /// Returns the entry with `flags` added, leaving frame and state bits alone.
    #[must_use]
    pub fn with_flags(self, flags: PageFlags) -> Self {
        let extra = flags - PageFlags::VALID - PageFlags::PAGED_OUT;
        Self(self.0 | extra.bits())
    }

    /// Returns the entry with `flags` removed, leaving frame and state bits alone.
    #[must_use]
    pub fn without_flags(self, flags: PageFlags) -> Self {
        let gone = flags - PageFlags::VALID - PageFlags::PAGED_OUT;
        Self(self.0 & !gone.bits())
    }

    fn ppn_bits(pa: PhysAddr) -> usize {
        debug_assert!(pa.is_page_aligned(), "pte: unaligned frame {}", pa);
        ((pa.raw() >> 12) & PPN_MASK) << FLAG_BITS
    }
}
