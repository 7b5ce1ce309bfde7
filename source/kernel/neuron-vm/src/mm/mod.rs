// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives for Sv39.

pub mod address_space;
pub mod frame;
pub mod page_table;
pub mod pte;
pub mod tlb;

pub use address_space::AddressSpace;
pub use frame::{FrameAllocator, RegionFrameAllocator};
pub use page_table::PageTable;
pub use pte::{PageFlags, Pte, PteState};
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use tlb::SfenceVma;
pub use tlb::{CountingTlb, Tlb};

use crate::swap::BackingStore;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// One past the highest user virtual address. Sv39 allows 39 bits, but the
/// top bit would require sign extension, so it is left unused.
pub const MAX_VA: usize = 1 << (9 + 9 + 9 + 12 - 1);

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// A page-table page could not be allocated.
    OutOfMemory,
    /// An intermediate table on the path does not exist.
    NotMapped,
    /// Physical address was not page aligned.
    Unaligned,
}

/// Errors reported by address-space operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// Physical memory ran out; the operation was rolled back.
    OutOfMemory,
    /// The process would exceed its total page budget and has been marked
    /// for termination.
    ProcessTooLarge,
    /// A user address was not mapped or not user accessible.
    BadAddress,
    /// No terminating NUL within the requested bound.
    StringTooLong,
    /// An exec image was already staged, or none was staged when required.
    ExecState,
    /// Underlying map operation failed.
    Mapping(MapError),
}

impl From<MapError> for VmError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::OutOfMemory => Self::OutOfMemory,
            other => Self::Mapping(other),
        }
    }
}

/// External collaborators an address space operates against.
///
/// The kernel builds one per operation from its global frame allocator, the
/// file-system backed swap store and the hart's TLB.
pub struct VmContext<'a> {
    pub frames: &'a mut dyn FrameAllocator,
    pub store: &'a mut dyn BackingStore,
    pub tlb: &'a dyn Tlb,
}

impl<'a> VmContext<'a> {
    pub fn new(frames: &'a mut dyn FrameAllocator, store: &'a mut dyn BackingStore, tlb: &'a dyn Tlb) -> Self {
        Self { frames, store, tlb }
    }
}

#[cfg(test)]
pub(crate) mod test_support;
#[cfg(test)]
mod tests_prop;
