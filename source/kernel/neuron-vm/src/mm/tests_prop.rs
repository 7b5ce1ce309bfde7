// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for page tables and address-space growth
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Map/translate agreement for arbitrary user pages
//!   - Budget invariant under random grow/shrink/fault sequences
//!   - Content survives arbitrary paging traffic
//!   - PTE constructors keep resident and paged-out exclusive
//!   - LAPA ordering: popcount first, raw value second
//!
//! TEST_SCENARIOS:
//!   - mapped_pages_translate_to_their_frames(): every mapped page resolves to its own frame
//!   - budget_holds_under_random_resizing(): resident <= max_resident, total <= max_total
//!   - bytes_survive_paging(): data written before eviction reads back unchanged
//!   - pte_states_are_exclusive(): no flag combination yields a resident paged-out entry
//!   - lapa_picks_minimal_popcount(): victim minimises (popcount, value) after one aging pass

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use proptest::prelude::*;

use super::frame::FrameAllocator;
use super::pte::USER_RWX;
use super::test_support::Rig;
use super::{AddressSpace, PageFlags, PageTable, Pte, PteState, VmError, PAGE_SIZE};
use crate::config::VmConfig;
use crate::swap::policy::{AccessBits, LeastAccessed, NotFrequentlyUsed, SecondChanceFifo};
use crate::swap::{EvictionPolicy, MemoryRecord};
use crate::types::{Pid, PhysAddr, VirtAddr};

const MAX_PAGE_INDEX: usize = 1 << 20;

struct NoAccess;

impl AccessBits for NoAccess {
    fn take_accessed(&mut self, _owner: PhysAddr, _va: VirtAddr) -> bool {
        false
    }
}

#[derive(Clone, Debug)]
enum Op {
    Resize(usize),
    Touch(usize),
    Tick,
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (0usize..=10).prop_map(Op::Resize),
            (0usize..10).prop_map(Op::Touch),
            Just(Op::Tick),
        ],
        1..40,
    )
}

fn check_budget<P: EvictionPolicy>(ops: &[Op]) -> Result<(), TestCaseError> {
    let config = VmConfig::new(3, 8).expect("budget");
    let mut rig = Rig::new(64);
    let mut ctx = rig.ctx();
    let mut vm = AddressSpace::<P>::new(Pid::from_raw(5), config, &mut ctx).expect("space");
    for op in ops {
        match *op {
            Op::Resize(pages) if pages * PAGE_SIZE >= vm.size() => match vm.grow(&mut ctx, pages * PAGE_SIZE) {
                Ok(_) => {}
                Err(VmError::ProcessTooLarge) => {
                    prop_assert!(pages > config.max_total());
                    break;
                }
                Err(err) => return Err(TestCaseError::fail(alloc::format!("grow: {:?}", err))),
            },
            Op::Resize(pages) => {
                vm.shrink(&mut ctx, pages * PAGE_SIZE);
            }
            Op::Touch(page) if page * PAGE_SIZE < vm.size() => {
                let mut byte = [0u8; 1];
                vm.copy_in(&mut ctx, &mut byte, VirtAddr::new(page * PAGE_SIZE)).expect("copy in");
                let _ = vm.page_table_mut().set_leaf_flags(VirtAddr::new(page * PAGE_SIZE), PageFlags::ACCESSED);
            }
            Op::Touch(_) => {}
            Op::Tick => vm.age_tick(&ctx),
        }
        let stats = vm.stats();
        prop_assert!(stats.resident <= config.max_resident());
        prop_assert!(stats.resident + stats.paged_out <= config.max_total());
        prop_assert_eq!(stats.resident + stats.paged_out, vm.size().div_ceil(PAGE_SIZE));
    }
    vm.destroy(&mut ctx);
    drop(ctx);
    prop_assert_eq!(rig.frames.in_use(), 0);
    Ok(())
}

proptest! {
    #[test]
    fn mapped_pages_translate_to_their_frames(pages in prop::collection::btree_set(0usize..MAX_PAGE_INDEX, 1..12)) {
        let mut rig = Rig::new(64);
        let mut table = PageTable::new(&mut rig.frames).expect("root");
        let mut mapped = Vec::new();
        for page in &pages {
            let frame = rig.frames.alloc().expect("frame");
            let va = VirtAddr::new(page * PAGE_SIZE);
            table.map_pages(va, PAGE_SIZE, frame, USER_RWX, &mut rig.frames).expect("map");
            mapped.push((va, frame));
        }
        let frames: BTreeSet<_> = mapped.iter().map(|(_, frame)| *frame).collect();
        prop_assert_eq!(frames.len(), mapped.len());
        for (va, frame) in &mapped {
            prop_assert_eq!(table.translate_user(va.add(123)), Some(*frame));
        }
        for (va, frame) in mapped {
            table.unmap_pages(va, 1, |_, _| {});
            rig.frames.free(frame);
        }
        table.free_walk(&mut rig.frames);
        prop_assert_eq!(rig.frames.in_use(), 0);
    }

    #[test]
    fn budget_holds_under_random_resizing(ops in arb_ops()) {
        check_budget::<SecondChanceFifo>(&ops)?;
        check_budget::<NotFrequentlyUsed>(&ops)?;
        check_budget::<LeastAccessed>(&ops)?;
    }

    #[test]
    fn bytes_survive_paging(order in Just((0u8..8).collect::<Vec<_>>()).prop_shuffle()) {
        let config = VmConfig::new(2, 8).expect("budget");
        let mut rig = Rig::new(64);
        let mut ctx = rig.ctx();
        let mut vm = AddressSpace::<SecondChanceFifo>::new(Pid::from_raw(9), config, &mut ctx).expect("space");
        vm.grow(&mut ctx, 8 * PAGE_SIZE).expect("grow");
        for page in 0..8u8 {
            vm.copy_out(&mut ctx, VirtAddr::new(page as usize * PAGE_SIZE + 7), &[page; 16]).expect("write");
        }
        for page in order {
            let mut buf = [0u8; 16];
            vm.copy_in(&mut ctx, &mut buf, VirtAddr::new(page as usize * PAGE_SIZE + 7)).expect("read");
            prop_assert_eq!(buf, [page; 16]);
        }
        vm.destroy(&mut ctx);
    }

    #[test]
    fn pte_states_are_exclusive(frame in 1usize..(1 << 30), bits in 0usize..1024) {
        let flags = PageFlags::from_bits_truncate(bits);
        let frame = PhysAddr::new(frame * PAGE_SIZE);
        let resident = Pte::resident(frame, flags | PageFlags::READ);
        prop_assert!(resident.is_valid() && !resident.is_paged_out());
        prop_assert_eq!(resident.frame(), frame);
        let out = Pte::paged_out(flags);
        prop_assert!(!out.is_valid() && out.is_paged_out());
        let decodes_paged_out = matches!(out.state(), PteState::PagedOut { .. });
        prop_assert!(decodes_paged_out);
        let valid_stays_resident = !matches!(resident.with_flags(PageFlags::PAGED_OUT).state(), PteState::PagedOut { .. });
        prop_assert!(valid_stays_resident);
    }

    #[test]
    fn lapa_picks_minimal_popcount(ages in prop::collection::vec(any::<u32>(), 1..16)) {
        let mut record = MemoryRecord::new(VmConfig::new(ages.len(), ages.len()).expect("budget"));
        let owner = PhysAddr::new(0x8000_0000);
        for (n, age) in ages.iter().enumerate() {
            let slot = record.register_resident(owner, VirtAddr::new(n * PAGE_SIZE), *age).expect("slot");
            prop_assert_eq!(slot, n);
        }
        let victim = LeastAccessed.select_victim(&mut record, &mut NoAccess);
        let key = |age: u32| ((age >> 1).count_ones(), age >> 1);
        let best = ages.iter().map(|age| key(*age)).min().expect("non-empty");
        prop_assert_eq!(key(ages[victim]), best);
        prop_assert!(ages[..victim].iter().all(|age| key(*age) > best));
    }
}
