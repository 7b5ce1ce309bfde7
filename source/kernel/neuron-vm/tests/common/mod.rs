// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared host harness for neuron-vm integration tests
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; a heap-backed "physical memory" region plus RAM swap store.

#![allow(dead_code)]

use neuron_vm::mm::CountingTlb;
use neuron_vm::{
    AddressSpace, EvictionPolicy, MemoryBackingStore, Pid, RegionFrameAllocator, VirtAddr, VmConfig, VmContext,
    PAGE_SIZE,
};

pub struct Machine {
    _region: Vec<u8>,
    pub frames: RegionFrameAllocator,
    pub store: MemoryBackingStore,
    pub tlb: CountingTlb,
}

impl Machine {
    pub fn new(pages: usize) -> Self {
        let mut region = vec![0u8; (pages + 1) * PAGE_SIZE];
        // SAFETY: the region is owned by the machine and outlives the allocator.
        let frames = unsafe { RegionFrameAllocator::new(region.as_mut_ptr(), region.len()) };
        Self { _region: region, frames, store: MemoryBackingStore::new(), tlb: CountingTlb::new() }
    }

    pub fn ctx(&mut self) -> VmContext<'_> {
        VmContext::new(&mut self.frames, &mut self.store, &self.tlb)
    }

    pub fn spawn<P: EvictionPolicy>(&mut self, pid: u32, config: VmConfig) -> AddressSpace<P> {
        AddressSpace::new(Pid::from_raw(pid), config, &mut self.ctx()).expect("address space")
    }
}

pub fn page(n: usize) -> VirtAddr {
    VirtAddr::new(n * PAGE_SIZE)
}

/// Page-sized pattern unique to `tag`.
pub fn pattern(tag: u8) -> Vec<u8> {
    (0..PAGE_SIZE).map(|i| tag.wrapping_mul(31).wrapping_add(i as u8)).collect()
}

pub fn write_page<P: EvictionPolicy>(vm: &mut AddressSpace<P>, ctx: &mut VmContext<'_>, n: usize, tag: u8) {
    vm.copy_out(ctx, page(n), &pattern(tag)).expect("copy out");
}

pub fn read_page<P: EvictionPolicy>(vm: &mut AddressSpace<P>, ctx: &mut VmContext<'_>, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; PAGE_SIZE];
    vm.copy_in(ctx, &mut buf, page(n)).expect("copy in");
    buf
}

/// Simulates a user reference: the hardware would set the accessed bit.
pub fn touch<P: EvictionPolicy>(vm: &mut AddressSpace<P>, n: usize) {
    vm.page_table_mut().set_leaf_flags(page(n), neuron_vm::PageFlags::ACCESSED).expect("resident page");
}

pub fn is_paged_out<P: EvictionPolicy>(vm: &AddressSpace<P>, n: usize) -> bool {
    vm.page_table().entry(page(n)).is_some_and(|pte| pte.is_paged_out())
}
