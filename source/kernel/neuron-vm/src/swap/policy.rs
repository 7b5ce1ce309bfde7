// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page replacement policies
//! OWNERS: @kernel-mm-team
//! PUBLIC API: EvictionPolicy, AccessBits, SecondChanceFifo, NotFrequentlyUsed, LeastAccessed,
//!             FirstSlot, Unrestricted, Unconfigured, AGE_MSB
//! DEPENDS_ON: swap::residency::MemoryRecord
//! INVARIANTS: select_victim is only called on a full resident set and returns a used slot;
//!             every policy terminates in a bounded number of scans
//!
//! Exactly one policy is compiled in (see `config::ActivePolicy`). Policies
//! see hardware access bits only through [`AccessBits`], which reads and
//! clears the bit of the page a descriptor names.

use super::residency::MemoryRecord;
use crate::types::{PhysAddr, VirtAddr};

/// Bit OR-ed into an aging counter when the page was referenced since the
/// previous tick.
pub const AGE_MSB: u32 = 0x8000_0000;

/// Access-bit reader over the page tables a process currently owns.
pub trait AccessBits {
    /// Returns and clears the accessed bit of the resident page `va` in the
    /// table rooted at `owner`.
    fn take_accessed(&mut self, owner: PhysAddr, va: VirtAddr) -> bool;
}

/// A page replacement policy.
pub trait EvictionPolicy: Default {
    /// Name used in diagnostics.
    const NAME: &'static str;
    /// Whether residency is tracked at all. When false, processes may grow
    /// without limit and nothing is ever paged out.
    const TRACKS: bool = true;
    /// Aging counter given to a page when it becomes resident.
    const INITIAL_AGE: u32 = 0;

    /// Periodic aging hook, driven by the scheduler tick.
    fn age(&mut self, _record: &mut MemoryRecord, _bits: &mut dyn AccessBits) {}

    /// Picks the resident slot to evict from a full resident set.
    fn select_victim(&mut self, record: &mut MemoryRecord, bits: &mut dyn AccessBits) -> usize;
}

/// Folds access bits into every resident aging counter: shift right, then
/// set the MSB for pages referenced since the last pass.
pub fn age_counters(record: &mut MemoryRecord, bits: &mut dyn AccessBits) {
    for (_, desc) in record.resident_slots_mut() {
        desc.age >>= 1;
        if bits.take_accessed(desc.owner, desc.va) {
            desc.age |= AGE_MSB;
        }
    }
}

fn empty_resident_set(policy: &str) -> ! {
    panic!("vm: {} asked for a victim with no resident pages", policy)
}

/// Second-chance FIFO: the oldest page is evicted unless it was referenced,
/// in which case its bit is cleared and it moves to the back of the queue.
#[derive(Clone, Copy, Debug, Default)]
pub struct SecondChanceFifo;

impl SecondChanceFifo {
    fn oldest(record: &MemoryRecord) -> usize {
        let mut best: Option<(usize, u64)> = None;
        for (slot, desc) in record.resident_slots() {
            if best.map_or(true, |(_, order)| desc.order < order) {
                best = Some((slot, desc.order));
            }
        }
        match best {
            Some((slot, _)) => slot,
            None => empty_resident_set(Self::NAME),
        }
    }
}

impl EvictionPolicy for SecondChanceFifo {
    const NAME: &'static str = "scfifo";

    fn select_victim(&mut self, record: &mut MemoryRecord, bits: &mut dyn AccessBits) -> usize {
        // One pass clears every accessed bit, so the page at the head on the
        // extra round is unreferenced.
        let rounds = record.resident_count() + 1;
        for _ in 0..rounds {
            let slot = Self::oldest(record);
            let desc = *record.resident(slot);
            if !bits.take_accessed(desc.owner, desc.va) {
                return slot;
            }
            let order = record.next_order();
            record.resident_mut(slot).order = order;
            log_trace!(target: "policy", "scfifo: second chance for {}", desc.va);
        }
        Self::oldest(record)
    }
}

/// Not-frequently-used with aging: evicts the smallest counter.
#[derive(Clone, Copy, Debug, Default)]
pub struct NotFrequentlyUsed;

impl EvictionPolicy for NotFrequentlyUsed {
    const NAME: &'static str = "nfua";

    fn age(&mut self, record: &mut MemoryRecord, bits: &mut dyn AccessBits) {
        age_counters(record, bits);
    }

    fn select_victim(&mut self, record: &mut MemoryRecord, bits: &mut dyn AccessBits) -> usize {
        age_counters(record, bits);
        let mut best: Option<(usize, u32)> = None;
        for (slot, desc) in record.resident_slots() {
            if best.map_or(true, |(_, age)| desc.age < age) {
                best = Some((slot, desc.age));
            }
        }
        match best {
            Some((slot, _)) => slot,
            None => empty_resident_set(Self::NAME),
        }
    }
}

/// Least-accessed-page with aging: evicts the counter with the fewest set
/// bits, the smaller counter winning ties.
#[derive(Clone, Copy, Debug, Default)]
pub struct LeastAccessed;

impl EvictionPolicy for LeastAccessed {
    const NAME: &'static str = "lapa";
    const INITIAL_AGE: u32 = u32::MAX;

    fn age(&mut self, record: &mut MemoryRecord, bits: &mut dyn AccessBits) {
        age_counters(record, bits);
    }

    fn select_victim(&mut self, record: &mut MemoryRecord, bits: &mut dyn AccessBits) -> usize {
        age_counters(record, bits);
        let mut best: Option<(usize, (u32, u32))> = None;
        for (slot, desc) in record.resident_slots() {
            let key = (desc.age.count_ones(), desc.age);
            if best.map_or(true, |(_, best_key)| key < best_key) {
                best = Some((slot, key));
            }
        }
        match best {
            Some((slot, _)) => slot,
            None => empty_resident_set(Self::NAME),
        }
    }
}

/// Debug policy: always the first resident slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstSlot;

impl EvictionPolicy for FirstSlot {
    const NAME: &'static str = "first-slot";

    fn select_victim(&mut self, record: &mut MemoryRecord, _bits: &mut dyn AccessBits) -> usize {
        match record.resident_slots().next() {
            Some((slot, _)) => slot,
            None => empty_resident_set(Self::NAME),
        }
    }
}

/// Tracking disabled: processes grow without bound and never page out.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unrestricted;

impl EvictionPolicy for Unrestricted {
    const NAME: &'static str = "none";
    const TRACKS: bool = false;

    fn select_victim(&mut self, _record: &mut MemoryRecord, _bits: &mut dyn AccessBits) -> usize {
        panic!("vm: eviction requested with residency tracking disabled")
    }
}

/// Stands in when no policy feature is enabled. Tracking stays on so the
/// first eviction reports the misconfiguration.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unconfigured;

impl EvictionPolicy for Unconfigured {
    const NAME: &'static str = "unconfigured";

    fn select_victim(&mut self, _record: &mut MemoryRecord, _bits: &mut dyn AccessBits) -> usize {
        panic!("vm: unrecognized paging policy")
    }
}
