// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address and process newtypes shared by the page-table and swap code
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, PhysAddr, Pid
//! DEPENDS_ON: mm::PAGE_SIZE
//! INVARIANTS: Page rounding never wraps; Pid 1 and 2 are the bootstrap processes
//!
//! The newtypes keep virtual addresses, frame addresses and process ids from
//! being mixed at call sites. They are `Copy` and compile down to `usize`/`u32`.

use crate::mm::PAGE_SIZE;
use core::fmt;

/// User virtual address. Range checks happen in the page-table walker, which
/// treats anything at or above [`crate::mm::MAX_VA`] as a kernel bug.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Rounds down to the start of the containing page.
    #[inline]
    pub const fn page_floor(self) -> Self {
        Self(page_round_down(self.0))
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Offset of this address within its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 % PAGE_SIZE
    }

    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Physical address of a frame (or of a byte inside one).
///
/// Kernel memory is identity mapped, so a `PhysAddr` can be dereferenced
/// directly once it is known to name an allocated frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    #[inline]
    pub(crate) fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Process identifier.
///
/// **Invariant**: PIDs `1..=RESERVED_PIDS` are the bootstrap processes
/// (init and the first shell) and are never subject to residency limits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// The first process, created from the embedded init image.
    pub const INIT: Self = Self(1);
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

/// Rounds `addr` down to a page boundary.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to a page boundary, saturating at the last full page.
#[inline]
pub fn page_round_up(addr: usize) -> usize {
    let rem = addr % PAGE_SIZE;
    if rem == 0 {
        addr
    } else {
        addr.checked_add(PAGE_SIZE - rem).unwrap_or(usize::MAX & !(PAGE_SIZE - 1))
    }
}
