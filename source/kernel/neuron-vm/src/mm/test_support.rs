// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Shared host fixture for unit tests that drive address spaces
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; a heap-backed frame region, RAM swap store and counting TLB.

use alloc::vec;
use alloc::vec::Vec;

use super::{CountingTlb, RegionFrameAllocator, VmContext, PAGE_SIZE};
use crate::swap::MemoryBackingStore;

pub(crate) struct Rig {
    _region: Vec<u8>,
    pub(crate) frames: RegionFrameAllocator,
    pub(crate) store: MemoryBackingStore,
    pub(crate) tlb: CountingTlb,
}

impl Rig {
    /// A rig with room for `pages` frames.
    pub(crate) fn new(pages: usize) -> Self {
        // One spare page so alignment never costs a frame.
        let mut region = vec![0u8; (pages + 1) * PAGE_SIZE];
        // SAFETY: the region is owned by the rig and outlives the allocator.
        let frames = unsafe { RegionFrameAllocator::new(region.as_mut_ptr(), region.len()) };
        Self { _region: region, frames, store: MemoryBackingStore::new(), tlb: CountingTlb::new() }
    }

    pub(crate) fn ctx(&mut self) -> VmContext<'_> {
        VmContext::new(&mut self.frames, &mut self.store, &self.tlb)
    }
}
