// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process user address space with residency limits
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace (new/load_init/grow/shrink/fork/destroy, exec_*, copy_*, age_tick)
//! DEPENDS_ON: mm::PageTable, swap::{MemoryRecord, EvictionPolicy, engine}
//! INVARIANTS: [0, size) is fully mapped (resident or paged-out);
//!             tracked processes never exceed VmConfig::max_total pages;
//!             failed growth or copy leaves no partially mapped pages behind
//!
//! The user heap starts at address zero and grows upwards. Bootstrap
//! processes (pid <= RESERVED_PIDS) and builds with tracking disabled keep
//! every page resident and are never size-limited.

use core::mem;

use super::frame::{frame_bytes, zero_frame, FrameAllocator};
use super::pte::USER_RWX;
use super::{PageFlags, PageTable, Pte, PteState, VmContext, VmError, MAX_VA, PAGE_SIZE};
use crate::config::{pid_is_tracked, ActivePolicy, VmConfig};
use crate::swap::engine::{Swapper, Tables};
use crate::swap::{EvictionPolicy, MemoryRecord, MemoryStats};
use crate::types::{page_round_up, Pid, PhysAddr, VirtAddr};

/// Image being assembled by exec before it replaces the current one.
struct StagedImage {
    table: PageTable,
    size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    Current,
    Staged,
}

/// User address space of one process.
pub struct AddressSpace<P: EvictionPolicy = ActivePolicy> {
    pid: Pid,
    config: VmConfig,
    table: PageTable,
    staged: Option<StagedImage>,
    size: usize,
    record: MemoryRecord,
    policy: P,
    killed: bool,
}

impl<P: EvictionPolicy> AddressSpace<P> {
    /// Creates an empty address space for `pid`.
    pub fn new(pid: Pid, config: VmConfig, ctx: &mut VmContext<'_>) -> Result<Self, VmError> {
        let table = PageTable::new(ctx.frames)?;
        Ok(Self {
            pid,
            config,
            table,
            staged: None,
            size: 0,
            record: MemoryRecord::new(config),
            policy: P::default(),
            killed: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Bytes of user memory, starting at address zero.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }

    pub fn record(&self) -> &MemoryRecord {
        &self.record
    }

    pub fn stats(&self) -> MemoryStats {
        self.record.stats()
    }

    /// Page faults serviced for this process.
    pub fn fault_count(&self) -> u64 {
        self.record.faults()
    }

    /// Set when growth pushed the process past its page budget. The owner
    /// must terminate the process.
    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Whether residency limits apply to this process.
    pub fn is_tracked(&self) -> bool {
        P::TRACKS && pid_is_tracked(self.pid)
    }

    /// Logs the residency record.
    pub fn dump(&self) {
        self.record.dump(self.pid);
    }

    /// Loads the first user image: one page at address zero holding `code`.
    pub fn load_init(&mut self, ctx: &mut VmContext<'_>, code: &[u8]) -> Result<(), VmError> {
        assert!(code.len() < PAGE_SIZE, "vm: init image of {} bytes exceeds a page", code.len());
        assert!(self.size == 0, "vm: init image loaded into a populated address space");
        self.grow(ctx, PAGE_SIZE)?;
        self.copy_out(ctx, VirtAddr::new(0), code)
    }

    /// Grows the process to `new_size` bytes with zeroed, user RWX pages.
    ///
    /// Returns the resulting size; a `new_size` below the current size
    /// changes nothing. On failure every page added by this call is unmapped
    /// again. [`VmError::ProcessTooLarge`] additionally marks the process
    /// killed.
    pub fn grow(&mut self, ctx: &mut VmContext<'_>, new_size: usize) -> Result<usize, VmError> {
        let old = self.size;
        self.grow_target(Target::Current, ctx, old, new_size)?;
        self.size = old.max(new_size);
        Ok(self.size)
    }

    /// Shrinks the process to `new_size` bytes, releasing frames, residency
    /// descriptors and backing-store slots of the removed pages.
    pub fn shrink(&mut self, ctx: &mut VmContext<'_>, new_size: usize) -> usize {
        if new_size >= self.size {
            return self.size;
        }
        let start = page_round_up(new_size);
        let end = page_round_up(self.size);
        let root = self.table.root();
        self.swapper(ctx).release_range(root, start, end);
        self.size = new_size;
        self.size
    }

    /// Duplicates this address space for `child`.
    ///
    /// Resident pages are copied into fresh frames; paged-out pages stay
    /// paged-out in the child and the backing store hands the child a copy
    /// of the parent's slots.
    pub fn fork(&self, ctx: &mut VmContext<'_>, child: Pid) -> Result<Self, VmError> {
        let mut table = PageTable::new(ctx.frames)?;
        if let Err(err) = copy_pages(&self.table, &mut table, self.size, ctx.frames) {
            table.free_walk(ctx.frames);
            log_warn!(target: "vm", "fork of pid {} failed: {:?}", self.pid, err);
            return Err(err);
        }
        let record = self.record.fork_for(self.table.root(), table.root());
        ctx.store.inherit(self.pid, child);
        log_debug!(target: "vm", "pid {} forked into {} ({} bytes)", self.pid, child, self.size);
        Ok(Self {
            pid: child,
            config: self.config,
            table,
            staged: None,
            size: self.size,
            record,
            policy: P::default(),
            killed: false,
        })
    }

    /// Unmaps everything, frees every table page and drops the process'
    /// backing-store region.
    pub fn destroy(mut self, ctx: &mut VmContext<'_>) {
        self.drop_staged(ctx);
        let root = self.table.root();
        let end = page_round_up(self.size);
        self.swapper(ctx).release_range(root, 0, end);
        debug_assert_eq!(self.record.total(), 0, "vm: descriptors outlived their pages");
        let Self { pid, table, .. } = self;
        table.free_walk(ctx.frames);
        ctx.store.release(pid);
    }

    /// Starts building a replacement image. The current image stays live
    /// until [`AddressSpace::exec_commit`].
    pub fn exec_begin(&mut self, ctx: &mut VmContext<'_>) -> Result<(), VmError> {
        if self.staged.is_some() {
            return Err(VmError::ExecState);
        }
        let table = PageTable::new(ctx.frames)?;
        self.staged = Some(StagedImage { table, size: 0 });
        Ok(())
    }

    /// Grows the staged image. Its pages count against the same budget as
    /// the live image and may evict pages of either.
    pub fn exec_grow(&mut self, ctx: &mut VmContext<'_>, new_size: usize) -> Result<usize, VmError> {
        let old = self.staged.as_ref().map(|image| image.size).ok_or(VmError::ExecState)?;
        self.grow_target(Target::Staged, ctx, old, new_size)?;
        let image = self.staged.as_mut().ok_or(VmError::ExecState)?;
        image.size = old.max(new_size);
        Ok(image.size)
    }

    /// Staged table, for marking guard pages while loading.
    pub fn exec_table_mut(&mut self) -> Option<&mut PageTable> {
        self.staged.as_mut().map(|image| &mut image.table)
    }

    /// Copies `src` into the staged image.
    pub fn exec_copy_out(&mut self, ctx: &mut VmContext<'_>, dst: VirtAddr, src: &[u8]) -> Result<(), VmError> {
        self.copy_out_to(Target::Staged, ctx, dst, src)
    }

    /// Replaces the live image with the staged one and tears the old one down.
    pub fn exec_commit(&mut self, ctx: &mut VmContext<'_>) -> Result<(), VmError> {
        let Some(image) = self.staged.as_mut() else {
            return Err(VmError::ExecState);
        };
        mem::swap(&mut self.table, &mut image.table);
        mem::swap(&mut self.size, &mut image.size);
        self.drop_staged(ctx);
        log_debug!(target: "vm", "pid {} exec committed ({} bytes)", self.pid, self.size);
        Ok(())
    }

    /// Throws the staged image away, leaving the live image untouched.
    pub fn exec_abort(&mut self, ctx: &mut VmContext<'_>) -> Result<(), VmError> {
        if self.staged.is_none() {
            return Err(VmError::ExecState);
        }
        self.drop_staged(ctx);
        Ok(())
    }

    /// Frame behind a resident user page of the live image.
    pub fn translate_user(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.table.translate_user(va.page_floor())
    }

    /// Marks a live page inaccessible from user mode.
    pub fn clear_user(&mut self, ctx: &VmContext<'_>, va: VirtAddr) {
        self.table.clear_user(va.page_floor());
        ctx.tlb.flush_all();
    }

    /// Copies `src` to user address `dst`, faulting in paged-out pages.
    pub fn copy_out(&mut self, ctx: &mut VmContext<'_>, dst: VirtAddr, src: &[u8]) -> Result<(), VmError> {
        self.copy_out_to(Target::Current, ctx, dst, src)
    }

    /// Fills `dst` from user address `src`, faulting in paged-out pages.
    pub fn copy_in(&mut self, ctx: &mut VmContext<'_>, dst: &mut [u8], src: VirtAddr) -> Result<(), VmError> {
        let mut src = src;
        let mut done = 0;
        while done < dst.len() {
            let frame = self.user_frame(Target::Current, ctx, src.page_floor())?;
            let offset = src.page_offset();
            let n = (PAGE_SIZE - offset).min(dst.len() - done);
            // SAFETY: the frame is mapped by this address space and not otherwise borrowed.
            let bytes = unsafe { frame_bytes(frame) };
            dst[done..done + n].copy_from_slice(&bytes[offset..offset + n]);
            done += n;
            src = src.page_floor().add(PAGE_SIZE);
        }
        Ok(())
    }

    /// Copies a NUL-terminated string from user address `src` into `dst`,
    /// terminator included. Returns the string length without the NUL.
    pub fn copy_in_str(&mut self, ctx: &mut VmContext<'_>, dst: &mut [u8], src: VirtAddr) -> Result<usize, VmError> {
        let mut src = src;
        let mut copied = 0;
        while copied < dst.len() {
            let frame = self.user_frame(Target::Current, ctx, src.page_floor())?;
            let offset = src.page_offset();
            let n = (PAGE_SIZE - offset).min(dst.len() - copied);
            // SAFETY: as in `copy_in`.
            let bytes = unsafe { frame_bytes(frame) };
            for &byte in &bytes[offset..offset + n] {
                dst[copied] = byte;
                if byte == 0 {
                    return Ok(copied);
                }
                copied += 1;
            }
            src = src.page_floor().add(PAGE_SIZE);
        }
        Err(VmError::StringTooLong)
    }

    /// Scheduler-tick hook: lets the aging policies sample access bits.
    pub fn age_tick(&mut self, ctx: &VmContext<'_>) {
        if !self.is_tracked() {
            return;
        }
        let mut tables = Tables::new(&mut self.table, self.staged.as_mut().map(|image| &mut image.table));
        self.policy.age(&mut self.record, &mut tables);
        if tables.take_cleared() {
            ctx.tlb.flush_all();
        }
    }

    pub(crate) fn swapper<'s, 'c>(&'s mut self, ctx: &'s mut VmContext<'c>) -> Swapper<'s, 'c, P> {
        Swapper {
            pid: self.pid,
            tables: Tables::new(&mut self.table, self.staged.as_mut().map(|image| &mut image.table)),
            record: &mut self.record,
            policy: &mut self.policy,
            ctx,
        }
    }

    fn table_for(&self, target: Target) -> Result<&PageTable, VmError> {
        match target {
            Target::Current => Ok(&self.table),
            Target::Staged => self.staged.as_ref().map(|image| &image.table).ok_or(VmError::ExecState),
        }
    }

    fn grow_target(
        &mut self,
        target: Target,
        ctx: &mut VmContext<'_>,
        old: usize,
        new: usize,
    ) -> Result<(), VmError> {
        if new <= old {
            return Ok(());
        }
        if page_round_up(new) > MAX_VA {
            return Err(VmError::BadAddress);
        }
        let root = self.table_for(target)?.root();
        let tracked = self.is_tracked();
        let max_total = self.config.max_total();
        let pid = self.pid;
        let start = page_round_up(old);

        let outcome = {
            let mut swapper = self.swapper(ctx);
            let mut addr = start;
            let outcome = loop {
                if addr >= new {
                    break Ok(());
                }
                let va = VirtAddr::new(addr);
                let Some(frame) = swapper.ctx.frames.alloc() else {
                    break Err(VmError::OutOfMemory);
                };
                zero_frame(frame);
                if let Err(err) = swapper.tables.by_root(root).map_pages(va, PAGE_SIZE, frame, USER_RWX, swapper.ctx.frames)
                {
                    swapper.ctx.frames.free(frame);
                    break Err(err.into());
                }
                addr += PAGE_SIZE;
                if !tracked {
                    continue;
                }
                if swapper.record.total() >= max_total {
                    break Err(VmError::ProcessTooLarge);
                }
                if swapper.record.free_resident_slot().is_none() {
                    swapper.evict_one();
                }
                if swapper.record.register_resident(root, va, P::INITIAL_AGE).is_none() {
                    panic!("vm: pid {} has no resident slot after eviction", pid);
                }
            };
            if outcome.is_err() {
                swapper.release_range(root, start, addr);
            }
            outcome
        };

        match outcome {
            Err(VmError::ProcessTooLarge) => {
                log_error!(target: "vm", "pid {} exceeds {} pages; killing", pid, max_total);
                self.killed = true;
            }
            Err(err) => log_warn!(target: "vm", "pid {} growth to {:#x} failed: {:?}", pid, new, err),
            Ok(()) => {}
        }
        outcome
    }

    fn drop_staged(&mut self, ctx: &mut VmContext<'_>) {
        let Some(image) = self.staged.as_ref() else {
            return;
        };
        let root = image.table.root();
        let end = page_round_up(image.size);
        self.swapper(ctx).release_range(root, 0, end);
        if let Some(image) = self.staged.take() {
            image.table.free_walk(ctx.frames);
        }
    }

    fn copy_out_to(
        &mut self,
        target: Target,
        ctx: &mut VmContext<'_>,
        dst: VirtAddr,
        src: &[u8],
    ) -> Result<(), VmError> {
        let mut dst = dst;
        let mut src = src;
        while !src.is_empty() {
            let frame = self.user_frame(target, ctx, dst.page_floor())?;
            let offset = dst.page_offset();
            let n = (PAGE_SIZE - offset).min(src.len());
            // SAFETY: the frame is mapped by this address space and not otherwise borrowed.
            let bytes = unsafe { frame_bytes(frame) };
            bytes[offset..offset + n].copy_from_slice(&src[..n]);
            src = &src[n..];
            dst = dst.page_floor().add(PAGE_SIZE);
        }
        Ok(())
    }

    /// Resolves a user page to its frame, paging it in first if needed.
    fn user_frame(&mut self, target: Target, ctx: &mut VmContext<'_>, page: VirtAddr) -> Result<PhysAddr, VmError> {
        if page.raw() >= MAX_VA {
            return Err(VmError::BadAddress);
        }
        let table = self.table_for(target)?;
        if let Some(frame) = table.translate_user(page) {
            return Ok(frame);
        }
        match table.entry(page) {
            Some(pte) if pte.is_paged_out() && pte.flags().contains(PageFlags::USER) => {}
            _ => return Err(VmError::BadAddress),
        }
        let root = table.root();
        self.swapper(ctx).page_in(root, page).map_err(|_| VmError::OutOfMemory)?;
        self.table_for(target)?.translate_user(page).ok_or(VmError::BadAddress)
    }
}

/// Copies `[0, size)` of `src` into the empty table `dst`. On failure the
/// pages already copied are unmapped and their frames freed.
fn copy_pages(src: &PageTable, dst: &mut PageTable, size: usize, frames: &mut dyn FrameAllocator) -> Result<(), VmError> {
    let mut addr = 0;
    let outcome = loop {
        if addr >= size {
            break Ok(());
        }
        let va = VirtAddr::new(addr);
        let Some(pte) = src.entry(va) else {
            panic!("vm: fork source has no PTE for {}", va);
        };
        let copied = match pte.state() {
            PteState::Resident { frame, flags } => copy_frame(dst, va, frame, flags, frames),
            PteState::PagedOut { flags } => match dst.walk_alloc(va, frames) {
                Ok(slot) => {
                    *slot = Pte::paged_out(flags);
                    Ok(())
                }
                Err(err) => Err(err.into()),
            },
            other => panic!("vm: fork source page {} not present ({:?})", va, other),
        };
        if let Err(err) = copied {
            break Err(err);
        }
        addr += PAGE_SIZE;
    };
    if outcome.is_err() && addr > 0 {
        dst.unmap_pages(VirtAddr::new(0), addr / PAGE_SIZE, |_, pte| {
            if let PteState::Resident { frame, .. } = pte.state() {
                frames.free(frame);
            }
        });
    }
    outcome
}

fn copy_frame(
    dst: &mut PageTable,
    va: VirtAddr,
    src: PhysAddr,
    flags: PageFlags,
    frames: &mut dyn FrameAllocator,
) -> Result<(), VmError> {
    let frame = frames.alloc().ok_or(VmError::OutOfMemory)?;
    // SAFETY: both frames are allocated; `frame` is not yet visible to anyone.
    unsafe { frame_bytes(frame).copy_from_slice(frame_bytes(src)) };
    if let Err(err) = dst.map_pages(va, PAGE_SIZE, frame, flags, frames) {
        frames.free(frame);
        return Err(err.into());
    }
    Ok(())
}
