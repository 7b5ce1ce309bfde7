// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Demand-paged user virtual memory for the NEURON kernel (Sv39)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit + proptest (mm, swap) and host integration tests (tests/)
//! PUBLIC API: PageTable, AddressSpace, MemoryRecord, EvictionPolicy, FrameAllocator, BackingStore, Tlb
//! DEPENDS_ON: bitflags, spin, linked_list_allocator, riscv (sfence.vma), static_assertions
//! INVARIANTS: A leaf PTE is unmapped, resident or paged-out, never two at once;
//!             resident + paged-out pages per process stay within VmConfig::max_total

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod config;
pub mod mm;
pub mod swap;
pub mod types;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod uart;

pub use config::{tracking_enabled, ActivePolicy, VmConfig};
pub use mm::{
    AddressSpace, FrameAllocator, MapError, PageFlags, PageTable, Pte, PteState, RegionFrameAllocator, Tlb,
    VmContext, VmError, MAX_VA, PAGE_SIZE,
};
pub use swap::{BackingStore, EvictionPolicy, FaultError, MemoryBackingStore, MemoryRecord, MemoryStats};
pub use types::{Pid, PhysAddr, VirtAddr};
