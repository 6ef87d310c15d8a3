//! Thread Stacks and Thread Control Blocks
//!
//! ## Key Operations
//!
//! - [`VirtualMemoryManager::alloc_thread_stack`]: reserve a stack with a
//!   two-page guard region at the low end and an optional tail view
//! - [`VirtualMemoryManager::create_user_stack`] / [`VirtualMemoryManager::free_user_stack`]
//! - [`VirtualMemoryManager::alloc_first_teb`], [`VirtualMemoryManager::alloc_teb`],
//!   [`VirtualMemoryManager::free_teb`]: fixed-size control blocks carved
//!   from 32-block reservations
//!
//! The running thread's stack is registered with
//! [`VirtualMemoryManager::set_running_stack`]; releasing it is postponed
//! until [`VirtualMemoryManager::exit_thread_stack`].

use log::{trace, warn};

use super::vm_user::zero_bits_win_to_64;
use super::{VProt, ViewKind, VirtualMemoryManager, VmState};
use crate::config::GRANULARITY;
use crate::error::{status_of, VmError, VmResult};
use crate::types::{FreeType, NtStatus, PageProtection, ProcessHandle};

/// Control blocks per reservation
pub const TEB_BLOCKS: usize = 32;

/// Bounds of a thread stack; the stack grows down from `base`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadStack {
    /// Start of the reservation, including the guard region
    pub deallocation: usize,
    /// One past the highest usable byte
    pub base: usize,
    /// Lowest accessible address
    pub limit: usize,
    /// Bytes committed for overflow handling once the guard runs out
    pub guaranteed_bytes: usize,
}

/// Control block allocator state
#[derive(Debug, Default)]
pub struct TebBlocks {
    /// Current reservation
    block: usize,
    /// Blocks of `block` not yet handed out
    pos: usize,
    free: Vec<usize>,
    peb: usize,
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? / align * align)
}

impl VmState {
    fn reserve_teb_block(&mut self) -> VmResult<usize> {
        let total = TEB_BLOCKS * self.config.teb_size;
        let id = self.map_view(None, total, true, VProt::READ | VProt::WRITE, ViewKind::empty(), 0)?;
        let base = self.view(id)?.base;
        trace!("teb block {:#x}-{:#x}", base, base + total);
        Ok(base)
    }

    /// Commit `[addr, addr+size)` read-write inside its private view
    fn commit_read_write(&mut self, addr: usize, size: usize) -> VmResult<()> {
        let id = self.views.find(addr, size).ok_or(VmError::NotMappedView)?;
        self.set_protection(id, addr, size, PageProtection::READWRITE)
    }

    fn alloc_first_teb(&mut self) -> VmResult<(usize, usize)> {
        if self.tebs.peb != 0 {
            return Err(VmError::InvalidParameter);
        }
        let teb_size = self.config.teb_size;
        let peb_size = self.page_size();
        let block = self.reserve_teb_block()?;
        let teb = block + (TEB_BLOCKS - 2) * teb_size;
        let peb = block + TEB_BLOCKS * teb_size - peb_size;
        self.commit_read_write(teb, teb_size)?;
        self.commit_read_write(peb, peb_size)?;
        self.tebs = TebBlocks {
            block,
            pos: TEB_BLOCKS - 2,
            free: Vec::with_capacity(TEB_BLOCKS),
            peb,
        };
        Ok((teb, peb))
    }

    fn alloc_teb(&mut self) -> VmResult<usize> {
        let teb_size = self.config.teb_size;
        if let Some(teb) = self.tebs.free.pop() {
            let zeros = vec![0u8; teb_size];
            if let Err(err) = self.backend.write_memory(teb, &zeros) {
                self.tebs.free.push(teb);
                return Err(err.into());
            }
            return Ok(teb);
        }
        if self.tebs.pos == 0 {
            self.tebs.block = self.reserve_teb_block()?;
            self.tebs.pos = TEB_BLOCKS;
        }
        self.tebs.pos -= 1;
        let teb = self.tebs.block + self.tebs.pos * teb_size;
        if let Err(err) = self.commit_read_write(teb, teb_size) {
            self.tebs.pos += 1;
            return Err(err);
        }
        Ok(teb)
    }

    /// Reserve a stack and arm its guard region
    ///
    /// The stack proper gets `max(reserve, commit)` bytes, at least the
    /// configured minimum, rounded to 64K. A non-zero `extra` is carved
    /// off the top as its own view so the stack can be released without it.
    pub(crate) fn alloc_thread_stack(
        &mut self,
        reserve: usize,
        commit: usize,
        extra: usize,
        zero_bits: u32,
    ) -> VmResult<ThreadStack> {
        let page = self.page_size();
        let reserve = if reserve == 0 { self.config.default_stack_reserve } else { reserve };
        let commit = if commit == 0 { self.config.default_stack_commit } else { commit };
        let size = reserve.max(commit).max(self.config.min_stack_size);
        let size = align_up(size, GRANULARITY).ok_or(VmError::NoMemory)?;
        let extra = self.round_page(extra);
        let total = size.checked_add(extra).ok_or(VmError::NoMemory)?;

        let rw = VProt::READ | VProt::WRITE | VProt::COMMITTED;
        let id = self.map_view(None, total, false, rw, ViewKind::empty(), zero_bits)?;
        let base = self.view(id)?.base;

        // Inaccessible bottom page, guard page above it.
        self.pages.set_range(base, page, VProt::COMMITTED);
        self.pages.set_range(base + page, page, rw | VProt::GUARD);
        self.mprotect_range(base, 2 * page, VProt::empty(), VProt::empty());

        if extra != 0 {
            self.views.resize(id, size);
            if let Err(err) = self.create_view(base + size, extra, rw, ViewKind::empty()) {
                let _ = self.backend.unmap(base + size, extra);
                self.delete_view(id);
                return Err(err);
            }
        }
        trace!("thread stack {:#x}-{:#x} extra {:#x}", base, base + size, extra);
        Ok(ThreadStack {
            deallocation: base,
            base: base + size,
            limit: base + 2 * page,
            guaranteed_bytes: self.config.guaranteed_stack_bytes,
        })
    }
}

impl VirtualMemoryManager {
    // ========================================================================
    // Control Blocks
    // ========================================================================

    /// Reserve the first control block reservation
    ///
    /// The first block sits two slots from the top; the process block
    /// takes the last page of the reservation.
    pub fn alloc_first_teb(&self, teb: &mut usize, peb: &mut usize) -> NtStatus {
        let result = self.lock().alloc_first_teb();
        if let Ok((t, p)) = result {
            *teb = t;
            *peb = p;
        }
        status_of(result)
    }

    /// Hand out a zeroed, committed control block
    pub fn alloc_teb(&self, teb: &mut usize) -> NtStatus {
        let result = self.lock().alloc_teb();
        if let Ok(addr) = result {
            *teb = addr;
        }
        status_of(result)
    }

    pub fn free_teb(&self, teb: usize) {
        let mut state = self.lock();
        if !state.tebs.free.contains(&teb) {
            state.tebs.free.push(teb);
        }
    }

    // ========================================================================
    // Stacks
    // ========================================================================

    /// Reserve a thread stack
    ///
    /// # Arguments
    ///
    /// * `reserve` - Reservation size, or 0 for the default
    /// * `commit` - Commit size, or 0 for the default
    /// * `extra` - Bytes to split off the top into their own view
    /// * `stack` - Receives the stack bounds
    pub fn alloc_thread_stack(
        &self,
        reserve: usize,
        commit: usize,
        extra: usize,
        stack: &mut ThreadStack,
    ) -> NtStatus {
        let result = self.lock().alloc_thread_stack(reserve, commit, extra, 0);
        if let Ok(bounds) = result {
            *stack = bounds;
        }
        status_of(result)
    }

    /// Reserve a stack with alignment-rounded sizes
    pub fn create_user_stack(
        &self,
        commit: usize,
        reserve: usize,
        zero_bits: usize,
        commit_align: usize,
        reserve_align: usize,
        stack: &mut ThreadStack,
    ) -> NtStatus {
        if commit_align == 0 || reserve_align == 0 {
            return NtStatus::INVALID_PARAMETER;
        }
        let (Some(reserve), Some(commit)) = (align_up(reserve, reserve_align), align_up(commit, commit_align))
        else {
            return NtStatus::INVALID_PARAMETER;
        };
        let Some(zero_bits) = zero_bits_win_to_64(zero_bits) else {
            return NtStatus::INVALID_PARAMETER_3;
        };
        let result = self.lock().alloc_thread_stack(reserve, commit, 0, zero_bits);
        if let Ok(bounds) = result {
            *stack = bounds;
        }
        status_of(result)
    }

    /// Release a stack made by [`create_user_stack`](Self::create_user_stack)
    pub fn free_user_stack(&self, deallocation: usize) -> NtStatus {
        let mut addr = deallocation;
        let mut size = 0;
        self.free_virtual_memory(ProcessHandle::Current, &mut addr, &mut size, FreeType::RELEASE)
    }

    /// Register the stack of the thread driving this manager
    pub fn set_running_stack(&self, stack: Option<ThreadStack>) {
        let mut state = self.lock();
        state.stack = stack;
        state.stack_release_deferred = false;
    }

    pub fn running_stack(&self) -> Option<ThreadStack> {
        self.lock().stack
    }

    /// Thread exit: perform a release of the running stack postponed earlier
    pub fn exit_thread_stack(&self) -> NtStatus {
        let mut state = self.lock();
        let Some(stack) = state.stack.take() else {
            return NtStatus::SUCCESS;
        };
        if !std::mem::take(&mut state.stack_release_deferred) {
            return NtStatus::SUCCESS;
        }
        match state.views.find(stack.deallocation, 0) {
            Some(id) => {
                warn!("releasing stack {:#x}-{:#x} on exit", stack.deallocation, stack.base);
                state.delete_view(id);
                NtStatus::SUCCESS
            }
            None => NtStatus::NOT_MAPPED_VIEW,
        }
    }
}
