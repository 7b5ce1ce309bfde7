// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame allocation seam and a region-backed implementation
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator, RegionFrameAllocator, zero_frame, frame_bytes
//! DEPENDS_ON: linked_list_allocator::Heap
//! INVARIANTS: Frames are PAGE_SIZE bytes, PAGE_SIZE aligned and identity mapped

use core::alloc::Layout;
use core::ptr::NonNull;

use linked_list_allocator::Heap;

use super::PAGE_SIZE;
use crate::types::PhysAddr;

/// Source of physical frames. Allocation and release are atomic from the
/// caller's point of view.
pub trait FrameAllocator {
    /// Returns a fresh frame, or `None` when physical memory is exhausted.
    /// The content is unspecified.
    fn alloc(&mut self) -> Option<PhysAddr>;
    /// Returns `frame` to the pool.
    fn free(&mut self, frame: PhysAddr);
}

const FRAME_LAYOUT: Layout = match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
    Ok(layout) => layout,
    Err(_) => panic!("frame layout"),
};

/// Junk written into released frames so stale references show up quickly.
const FREE_POISON: u8 = 0x01;

/// Frame allocator carving page-aligned frames out of one contiguous region.
pub struct RegionFrameAllocator {
    heap: Heap,
    in_use: usize,
    limit: Option<usize>,
}

impl RegionFrameAllocator {
    /// Creates an allocator over `len` bytes starting at `start`.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes, identity mapped, not
    /// used by anything else and outlive the allocator.
    pub unsafe fn new(start: *mut u8, len: usize) -> Self {
        // SAFETY: forwarded from the caller.
        let heap = unsafe { Heap::new(start, len) };
        Self { heap, in_use: 0, limit: None }
    }

    /// Number of frames currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Caps the number of frames that may be outstanding at once.
    /// Bring-up uses this to exercise the out-of-memory unwinding paths.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }
}

impl FrameAllocator for RegionFrameAllocator {
    fn alloc(&mut self) -> Option<PhysAddr> {
        if self.limit.is_some_and(|limit| self.in_use >= limit) {
            return None;
        }
        let ptr = self.heap.allocate_first_fit(FRAME_LAYOUT).ok()?;
        self.in_use += 1;
        Some(PhysAddr::new(ptr.as_ptr() as usize))
    }

    fn free(&mut self, frame: PhysAddr) {
        let Some(ptr) = NonNull::new(frame.as_mut_ptr::<u8>()) else {
            panic!("vm: free of null frame");
        };
        assert!(frame.is_page_aligned(), "vm: free of unaligned frame {}", frame);
        // SAFETY: `frame` came from `alloc` on this heap with FRAME_LAYOUT.
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), FREE_POISON, PAGE_SIZE);
            self.heap.deallocate(ptr, FRAME_LAYOUT);
        }
        self.in_use -= 1;
    }
}

/// Borrows the bytes of an allocated frame.
///
/// # Safety
///
/// `frame` must be an allocated, identity-mapped frame with no other live
/// borrow for the returned lifetime.
pub unsafe fn frame_bytes<'a>(frame: PhysAddr) -> &'a mut [u8; PAGE_SIZE] {
    // SAFETY: guaranteed by the caller.
    unsafe { &mut *frame.as_mut_ptr::<[u8; PAGE_SIZE]>() }
}

/// Fills an allocated frame with zeroes.
pub fn zero_frame(frame: PhysAddr) {
    // SAFETY: callers only pass frames they just obtained from an allocator.
    unsafe { core::ptr::write_bytes(frame.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
}
