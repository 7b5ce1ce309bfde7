// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Demand paging: residency tracking, replacement policies, page-in/page-out
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MemoryRecord, EvictionPolicy, BackingStore, MemoryBackingStore, FaultError
//! DEPENDS_ON: mm::{PageTable, FrameAllocator, Tlb}
//! INVARIANTS: A page is tracked in exactly one of the resident / paged-out arenas while mapped

pub mod engine;
pub mod policy;
pub mod residency;
pub mod store;

pub use policy::{AccessBits, EvictionPolicy};
pub use residency::{MemoryRecord, MemoryStats, PageDescriptor, SlotState};
pub use store::{BackingStore, MemoryBackingStore};

/// Outcome of a page fault the swap layer could not service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// The faulting address has no paged-out entry; the trap handler kills
    /// the process as for any other bad access.
    NotPagedOut,
    /// No frame was available to bring the page back.
    OutOfMemory,
}
