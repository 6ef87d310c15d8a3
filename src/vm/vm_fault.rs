//! VM Fault - Guard, Write-Watch and Copy-on-Write Resolution
//!
//! Decides what a hardware fault on a managed page means and, where the
//! fault is an expected one, repairs the page so the access can be
//! retried.
//!
//! ## Fault Kinds
//!
//! - **Guard**: first touch of a guard page disarms it and reports a
//!   guard-page violation; guard pages inside the running stack grow the
//!   stack instead
//! - **Write-watch**: first write to a watched page records it as written
//! - **Copy-on-write**: first write to a write-copy page gives the page a
//!   private, writable copy
//! - **System read**: a read of a readable page in a system view whose
//!   host mapping has gone away is repaired with fresh anonymous memory
//!
//! Everything else is an access violation.

use core::sync::atomic::{AtomicU64, Ordering};

use log::{error, trace, warn};

use super::pmap::{Placement, UnixProt};
use super::vm_prot::{VProt, ViewKind};
use super::{VirtualMemoryManager, VmState};
use crate::types::NtStatus;

// ============================================================================
// Fault Result
// ============================================================================

/// Kind of access that faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}

/// Outcome of [`VirtualMemoryManager::handle_fault`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    /// Page repaired; retry the access
    Handled,
    /// A guard page was hit and disarmed
    GuardPage,
    /// Stack grew into its guaranteed zone
    StackOverflow,
    /// Not an expected fault
    AccessViolation,
    /// Fault raised while the manager lock was already held
    Nested,
}

impl FaultStatus {
    pub fn status(self) -> NtStatus {
        match self {
            FaultStatus::Handled => NtStatus::SUCCESS,
            FaultStatus::GuardPage => NtStatus::GUARD_PAGE_VIOLATION,
            FaultStatus::StackOverflow => NtStatus::STACK_OVERFLOW,
            FaultStatus::AccessViolation | FaultStatus::Nested => NtStatus::ACCESS_VIOLATION,
        }
    }
}

/// Outcome of [`VirtualMemoryManager::handle_stack_fault`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackFault {
    /// Guard moved one page down
    Handled,
    /// Guaranteed zone committed; the thread is out of stack
    Overflow,
    /// Not a guard page of the running stack
    NotApplicable,
}

impl StackFault {
    pub fn status(self) -> NtStatus {
        match self {
            StackFault::Handled => NtStatus::SUCCESS,
            StackFault::Overflow => NtStatus::STACK_OVERFLOW,
            StackFault::NotApplicable => NtStatus::ACCESS_VIOLATION,
        }
    }
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Fault statistics counters
#[derive(Debug)]
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Guard pages disarmed
    pub guard: AtomicU64,
    /// Write-watch hits
    pub write_watch: AtomicU64,
    /// Copy-on-write faults
    pub cow: AtomicU64,
    /// Stack guard moves
    pub stack_growth: AtomicU64,
    /// Stack overflows reported
    pub stack_overflow: AtomicU64,
    /// Faults left unresolved
    pub failures: AtomicU64,
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            guard: AtomicU64::new(0),
            write_watch: AtomicU64::new(0),
            cow: AtomicU64::new(0),
            stack_growth: AtomicU64::new(0),
            stack_overflow: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_guard(&self) {
        self.guard.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_write_watch(&self) {
        self.write_watch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cow(&self) {
        self.cow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_stack_growth(&self) {
        self.stack_growth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_stack_overflow(&self) {
        self.stack_overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// What a single fault resolution did, for the counters
#[derive(Debug, Default, Clone, Copy)]
struct FaultTrace {
    write_watch: bool,
    cow: bool,
}

// ============================================================================
// Resolution
// ============================================================================

impl VmState {
    fn is_system_range(&self, base: usize, size: usize) -> bool {
        self.views
            .find(base, size)
            .and_then(|id| self.views.get(id))
            .is_some_and(|v| v.kind.contains(ViewKind::SYSTEM))
    }

    /// Give a copy-on-write page in a shared host mapping its own copy
    fn make_page_private(&mut self, page: usize) -> bool {
        let size = self.page_size();
        if let Err(err) = self.backend.read_memory(page, &mut self.scratch[..size]) {
            error!("cannot read page {:#x} for private copy: {}", page, err);
            return false;
        }
        match self.backend.map_anon(Placement::Fixed(page), size, UnixProt::RW) {
            Ok(addr) if addr == page => {}
            Ok(addr) => {
                error!("private copy of {:#x} landed at {:#x}", page, addr);
                return false;
            }
            Err(err) => {
                error!("cannot map private copy of {:#x}: {}", page, err);
                return false;
            }
        }
        if let Err(err) = self.backend.write_memory(page, &self.scratch[..size]) {
            error!("cannot fill private copy of {:#x}: {}", page, err);
            return false;
        }
        self.mprotect_range(page, size, VProt::empty(), VProt::empty());
        true
    }

    fn resolve_fault(
        &mut self,
        addr: usize,
        access: FaultAccess,
        on_fault_stack: bool,
        what: &mut FaultTrace,
    ) -> FaultStatus {
        let page_size = self.page_size();
        let page = self.trunc_page(addr);
        let vprot = self.pages.get(page);

        if !on_fault_stack && vprot.contains(VProt::GUARD) {
            if self.in_running_stack(page) {
                return match self.grow_thread_stack(page) {
                    StackFault::Handled => FaultStatus::Handled,
                    StackFault::Overflow => FaultStatus::StackOverflow,
                    StackFault::NotApplicable => FaultStatus::AccessViolation,
                };
            }
            self.pages.set_bits_range(page, page_size, VProt::empty(), VProt::GUARD);
            self.mprotect_range(page, page_size, VProt::empty(), VProt::empty());
            return FaultStatus::GuardPage;
        }

        match access {
            FaultAccess::Write => {
                if vprot.contains(VProt::WRITEWATCH) {
                    self.pages.set_bits_range(page, page_size, VProt::empty(), VProt::WRITEWATCH);
                    self.mprotect_range(page, page_size, VProt::empty(), VProt::empty());
                    what.write_watch = true;
                }
                if vprot.contains(VProt::WRITECOPY | VProt::COMMITTED) {
                    self.pages.set_bits_range(
                        page,
                        page_size,
                        VProt::WRITE | VProt::WRITTEN,
                        VProt::WRITECOPY,
                    );
                    let private_host_mapping = self
                        .views
                        .find(page, page_size)
                        .and_then(|id| self.views.get(id))
                        .is_some_and(|v| v.vprot.contains(VProt::WRITECOPY));
                    if private_host_mapping {
                        self.mprotect_range(page, page_size, VProt::empty(), VProt::empty());
                    } else if !self.make_page_private(page) {
                        self.pages.set_range(page, page_size, vprot);
                        return FaultStatus::AccessViolation;
                    }
                    what.cow = true;
                }
                if self.pages.get(page).unix().contains(UnixProt::WRITE) {
                    return FaultStatus::Handled;
                }
            }
            FaultAccess::Read
                if vprot.unix().contains(UnixProt::READ) && self.is_system_range(page, page_size) =>
            {
                let unix = vprot.unix();
                self.mprotect_range(page, page_size, VProt::empty(), VProt::empty());
                if self.backend.is_resident(page) {
                    return FaultStatus::Handled;
                }
                if self.backend.map_anon(Placement::Fixed(page), page_size, unix) == Ok(page) {
                    return FaultStatus::Handled;
                }
                self.pages
                    .set_bits_range(page, page_size, VProt::empty(), VProt::READ | VProt::EXEC);
            }
            _ => {}
        }
        FaultStatus::AccessViolation
    }

    /// Move the running stack's guard page one page down
    pub(crate) fn grow_thread_stack(&mut self, page: usize) -> StackFault {
        let Some(stack) = self.stack else {
            return StackFault::NotApplicable;
        };
        let page_size = self.page_size();
        let per_step = if self.config.is_64bit() { 2 } else { 1 };
        let guaranteed = stack.guaranteed_bytes.max(page_size * per_step);

        self.pages.set_bits_range(page, page_size, VProt::empty(), VProt::GUARD);
        self.mprotect_range(page, page_size, VProt::empty(), VProt::empty());

        let (limit, result) = if page >= stack.deallocation + page_size + guaranteed {
            let below = page - page_size;
            self.pages
                .set_bits_range(below, page_size, VProt::COMMITTED | VProt::GUARD, VProt::empty());
            self.mprotect_range(below, page_size, VProt::empty(), VProt::empty());
            trace!("stack guard moved to {:#x}", below);
            (page, StackFault::Handled)
        } else {
            let zone = stack.deallocation + page_size;
            self.pages
                .set_bits_range(zone, guaranteed, VProt::COMMITTED, VProt::GUARD);
            self.mprotect_range(zone, guaranteed, VProt::empty(), VProt::empty());
            warn!(
                "stack overflow at {:#x}, stack {:#x}-{:#x}",
                page, stack.deallocation, stack.base
            );
            (zone, StackFault::Overflow)
        };
        if let Some(running) = self.stack.as_mut() {
            running.limit = limit;
        }
        result
    }
}

impl VirtualMemoryManager {
    /// Resolve a fault at `addr`
    ///
    /// # Arguments
    ///
    /// * `addr` - Faulting address
    /// * `access` - Kind of access attempted
    /// * `on_fault_stack` - Running on the dedicated fault stack; guard
    ///   pages are left armed and a held lock is treated as a nested fault
    ///
    /// # Returns
    ///
    /// [`FaultStatus::Handled`] when the access should be retried.
    pub fn handle_fault(&self, addr: usize, access: FaultAccess, on_fault_stack: bool) -> FaultStatus {
        self.stats.incr_total();

        let mut state = if on_fault_stack {
            match self.try_lock() {
                Some(state) => state,
                None => {
                    error!("nested fault at {:#x} while the manager is busy", addr);
                    self.stats.incr_failures();
                    return FaultStatus::Nested;
                }
            }
        } else {
            self.lock()
        };

        let mut what = FaultTrace::default();
        let status = state.resolve_fault(addr, access, on_fault_stack, &mut what);
        drop(state);

        trace!("fault at {:#x} ({:?}): {:?}", addr, access, status);
        if what.write_watch {
            self.stats.incr_write_watch();
        }
        if what.cow {
            self.stats.incr_cow();
        }
        match status {
            FaultStatus::Handled => {}
            FaultStatus::GuardPage => self.stats.incr_guard(),
            FaultStatus::StackOverflow => self.stats.incr_stack_overflow(),
            FaultStatus::AccessViolation | FaultStatus::Nested => self.stats.incr_failures(),
        }
        status
    }

    /// Resolve a fault on the running thread's stack
    ///
    /// Only guard pages inside `[deallocation, base)` of the running stack
    /// are handled; anything else is left to [`handle_fault`](Self::handle_fault).
    pub fn handle_stack_fault(&self, addr: usize) -> StackFault {
        let mut state = self.lock();
        if !state.in_running_stack(addr) {
            return StackFault::NotApplicable;
        }
        let page = state.trunc_page(addr);
        if !state.pages.get(page).contains(VProt::GUARD) {
            return StackFault::NotApplicable;
        }
        let result = state.grow_thread_stack(page);
        drop(state);

        match result {
            StackFault::Handled => self.stats.incr_stack_growth(),
            StackFault::Overflow => self.stats.incr_stack_overflow(),
            StackFault::NotApplicable => {}
        }
        result
    }
}
