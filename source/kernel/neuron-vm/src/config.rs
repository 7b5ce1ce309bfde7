// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Build-time policy selection and residency limits
//! OWNERS: @kernel-mm-team
//! PUBLIC API: ActivePolicy, VmConfig, tracking_enabled(), MAX_* capacities
//! DEPENDS_ON: swap::policy, static_assertions
//! INVARIANTS: At most one `policy-*` feature; MAX_RESIDENT_PAGES <= MAX_TOTAL_PAGES
//!
//! The replacement policy is a cargo feature, not a runtime switch: the chosen
//! type is monomorphized into `AddressSpace`, so production kernels carry no
//! policy dispatch at all. Tests instantiate the other policies directly.

use static_assertions::const_assert;

use crate::swap::policy::EvictionPolicy;
use crate::types::Pid;

/// Capacity of the per-process resident descriptor arena.
pub const MAX_RESIDENT_PAGES: usize = 16;
/// Upper bound on resident + paged-out pages of one process.
pub const MAX_TOTAL_PAGES: usize = 32;
/// Capacity of the per-process paged-out descriptor arena (and backing-store slots).
pub const MAX_PAGED_OUT_PAGES: usize = MAX_TOTAL_PAGES - MAX_RESIDENT_PAGES;
/// PIDs up to and including this value are bootstrap processes and never tracked.
pub const RESERVED_PIDS: u32 = 2;

const_assert!(MAX_RESIDENT_PAGES > 0);
const_assert!(MAX_RESIDENT_PAGES <= MAX_TOTAL_PAGES);

const SELECTED_POLICIES: usize = cfg!(feature = "policy-scfifo") as usize
    + cfg!(feature = "policy-nfua") as usize
    + cfg!(feature = "policy-lapa") as usize
    + cfg!(feature = "policy-first-slot") as usize
    + cfg!(feature = "policy-none") as usize;

const_assert!(SELECTED_POLICIES <= 1);

#[cfg(feature = "policy-scfifo")]
pub type ActivePolicy = crate::swap::policy::SecondChanceFifo;
#[cfg(feature = "policy-nfua")]
pub type ActivePolicy = crate::swap::policy::NotFrequentlyUsed;
#[cfg(feature = "policy-lapa")]
pub type ActivePolicy = crate::swap::policy::LeastAccessed;
#[cfg(feature = "policy-first-slot")]
pub type ActivePolicy = crate::swap::policy::FirstSlot;
#[cfg(feature = "policy-none")]
pub type ActivePolicy = crate::swap::policy::Unrestricted;
#[cfg(not(any(
    feature = "policy-scfifo",
    feature = "policy-nfua",
    feature = "policy-lapa",
    feature = "policy-first-slot",
    feature = "policy-none"
)))]
pub type ActivePolicy = crate::swap::policy::Unconfigured;

/// Reports whether the built kernel enforces residency limits at all.
///
/// Callers use this to keep legacy unrestricted behaviour when the kernel is
/// built with `policy-none`.
pub const fn tracking_enabled() -> bool {
    <ActivePolicy as EvictionPolicy>::TRACKS
}

/// Returns true when `pid` is subject to residency tracking.
#[inline]
pub const fn pid_is_tracked(pid: Pid) -> bool {
    pid.as_raw() > RESERVED_PIDS
}

/// Per-address-space page budget.
///
/// Budgets may be smaller than the compiled capacities (bring-up and tests
/// shrink them to force eviction early) but never larger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    max_resident: usize,
    max_total: usize,
}

impl VmConfig {
    /// Budget matching the compiled capacities.
    pub const DEFAULT: Self = Self { max_resident: MAX_RESIDENT_PAGES, max_total: MAX_TOTAL_PAGES };

    /// Builds a budget, rejecting values the descriptor arenas cannot hold.
    pub const fn new(max_resident: usize, max_total: usize) -> Option<Self> {
        if max_resident == 0 || max_resident > MAX_RESIDENT_PAGES || max_total < max_resident {
            return None;
        }
        if max_total - max_resident > MAX_PAGED_OUT_PAGES {
            return None;
        }
        Some(Self { max_resident, max_total })
    }

    pub const fn max_resident(&self) -> usize {
        self.max_resident
    }

    pub const fn max_total(&self) -> usize {
        self.max_total
    }

    pub const fn max_paged_out(&self) -> usize {
        self.max_total - self.max_resident
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
