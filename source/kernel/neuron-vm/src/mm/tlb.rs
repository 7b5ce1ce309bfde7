// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Translation-cache maintenance.

use core::sync::atomic::{AtomicUsize, Ordering};

/// TLB management operations.
pub trait Tlb {
    /// Flushes the entire translation cache.
    fn flush_all(&self);
}

/// `sfence.vma` on the executing hart.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub struct SfenceVma;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl Tlb for SfenceVma {
    #[allow(unused_unsafe)]
    fn flush_all(&self) {
        // SAFETY: a full fence has no preconditions beyond running in S-mode.
        unsafe { riscv::asm::sfence_vma_all() };
    }
}

/// Counts flushes instead of touching hardware. Used by hosted builds, where
/// there is no MMU behind the page tables.
#[derive(Default)]
pub struct CountingTlb {
    flushes: AtomicUsize,
}

impl CountingTlb {
    pub const fn new() -> Self {
        Self { flushes: AtomicUsize::new(0) }
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl Tlb for CountingTlb {
    fn flush_all(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}
