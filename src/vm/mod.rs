//! Process Virtual Memory - Views, Pages and Free Space
//!
//! Shadow bookkeeping of every mapping in the process, kept in step with
//! the host address space through a [`MemoryBackend`].
//!
//! ## Components
//!
//! - [`vm_pages`]: one protection byte per page
//! - [`vm_ranges`]: free address ranges at allocation granularity
//! - [`vm_map`]: the view registry
//! - [`vm_placement`]: address selection and host mapping
//! - [`vm_image`]: PE image and data section mapping
//! - [`vm_fault`]: guard, write-watch and copy-on-write fault resolution
//! - [`vm_stack`]: thread stacks and thread control blocks
//! - [`vm_user`]: the NT-style operation surface
//!
//! ## Locking
//!
//! All state lives in one [`VmState`] behind a `spin` mutex owned by the
//! [`VirtualMemoryManager`]. Faults are resolved under the same lock from
//! signal context, where a parking mutex cannot be taken. Ordinary calls
//! may hold the lock across file I/O, so waiters yield their time slice
//! instead of spinning. The fault path never allocates a view record.

use std::sync::Arc;

use log::{error, log_enabled, trace, Level};
use spin::mutex::{Mutex, MutexGuard};
use spin::relax::Yield;

use crate::config::{VmConfig, GRANULARITY_MASK};
use crate::error::{OsError, VmError, VmResult};
use crate::reserved::ReservedAreas;
use crate::server::{ServerChannel, ServerReply, ServerRequest};
use crate::types::PageProtection;

pub mod pmap;
pub mod vm_fault;
pub mod vm_image;
pub mod vm_map;
pub mod vm_pages;
pub mod vm_placement;
pub mod vm_prot;
pub mod vm_ranges;
pub mod vm_stack;
pub mod vm_user;

pub use pmap::{MemoryBackend, UnixProt};
pub use vm_fault::{FaultAccess, FaultStats, FaultStatus, StackFault};
pub use vm_map::{View, ViewId};
pub use vm_prot::{VProt, ViewKind};
pub use vm_stack::ThreadStack;

use vm_map::ViewMap;
use vm_pages::PageTable;
use vm_ranges::FreeRanges;
use vm_stack::TebBlocks;

/// `[addr, addr+size)` reaches past `limit`
pub(crate) fn is_beyond_limit(addr: usize, size: usize, limit: usize) -> bool {
    addr >= limit || addr.checked_add(size).map_or(true, |end| end > limit)
}

// ============================================================================
// VM State
// ============================================================================

/// Everything guarded by the manager lock
pub struct VmState {
    pub(crate) config: VmConfig,
    pub(crate) backend: Arc<dyn MemoryBackend>,
    pub(crate) server: Arc<dyn ServerChannel>,
    pub(crate) pages: PageTable,
    pub(crate) free: FreeRanges,
    pub(crate) views: ViewMap,
    pub(crate) reserved: Box<dyn ReservedAreas>,
    pub(crate) address_space_start: usize,
    pub(crate) address_space_limit: usize,
    pub(crate) user_space_limit: usize,
    pub(crate) working_set_limit: usize,
    pub(crate) force_exec: bool,
    /// Range a placement probe found occupied by a foreign mapping
    pub(crate) last_already_mapped: Option<(usize, usize)>,
    /// One page, used to replace a shared page with a private copy
    pub(crate) scratch: Box<[u8]>,
    /// Stack of the thread driving this manager
    pub(crate) stack: Option<ThreadStack>,
    /// Release of the running stack was requested and postponed
    pub(crate) stack_release_deferred: bool,
    pub(crate) tebs: TebBlocks,
}

impl VmState {
    pub(crate) fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub(crate) fn trunc_page(&self, addr: usize) -> usize {
        self.config.trunc_page(addr)
    }

    pub(crate) fn round_page(&self, addr: usize) -> usize {
        self.config.round_page(addr)
    }

    pub(crate) fn view(&self, id: ViewId) -> VmResult<View> {
        self.views.get(id).copied().ok_or(VmError::NotMappedView)
    }

    /// `(base, size)` of a view, for free-range neighbour clipping
    fn extent(&self, id: Option<ViewId>) -> Option<(usize, usize)> {
        id.and_then(|id| self.views.get(id)).map(|v| (v.base, v.size))
    }

    /// Whether `addr` is inside the running thread's stack reservation
    pub(crate) fn in_running_stack(&self, addr: usize) -> bool {
        self.stack
            .as_ref()
            .is_some_and(|s| addr >= s.deallocation && addr < s.base)
    }

    // ========================================================================
    // View Lifecycle
    // ========================================================================

    /// Record a new view over an already mapped range
    ///
    /// Overlapping system views are dropped; any other overlap means the
    /// bookkeeping is out of step with the host and the view is refused.
    pub(crate) fn create_view(
        &mut self,
        base: usize,
        size: usize,
        vprot: VProt,
        kind: ViewKind,
    ) -> VmResult<ViewId> {
        while let Some(id) = self.views.find_range(base, size) {
            let old = self.view(id)?;
            if !old.is_system() {
                error!(
                    "view {:#x}-{:#x} overlaps {:#x}-{:#x}",
                    base,
                    base + size - 1,
                    old.base,
                    old.end() - 1
                );
                return Err(VmError::ConflictingAddresses);
            }
            trace!("overlapping system view {:#x}-{:#x}, deleting", old.base, old.end() - 1);
            self.delete_view(id);
        }

        self.pages.alloc_range(base, size)?;
        let id = self.views.insert(View {
            base,
            size,
            vprot,
            kind,
        });
        self.pages.set_range(base, size, vprot);
        self.free.remove_range(base, size);
        self.dump_view(id);

        if self.force_exec {
            let unix = vprot.unix();
            if unix.contains(UnixProt::READ) && !unix.contains(UnixProt::EXEC) {
                trace!("forcing exec permission on {:#x}-{:#x}", base, base + size - 1);
                let _ = self.backend.protect(base, size, unix | UnixProt::EXEC);
            }
        }
        Ok(id)
    }

    /// Drop a view and give its range back
    pub(crate) fn delete_view(&mut self, id: ViewId) {
        let Some(view) = self.views.get(id).copied() else {
            return;
        };
        trace!("deleting view {:#x}-{:#x}", view.base, view.end() - 1);
        if !view.is_system() {
            self.unmap_area(view.base, view.size);
        }
        self.pages.set_range(view.base, view.size, VProt::empty());
        let (prev, next) = self.views.neighbours(id);
        let (prev, next) = (self.extent(prev), self.extent(next));
        self.views.remove(id);
        self.free.insert_range(view.base, view.size, prev, next);
    }

    fn dump_view(&self, id: ViewId) {
        if !log_enabled!(Level::Trace) {
            return;
        }
        let Some(view) = self.views.get(id).copied() else {
            return;
        };
        let label = if view.is_system() {
            if view.kind.contains(ViewKind::IMAGE) {
                " (builtin image)"
            } else {
                " (system)"
            }
        } else if view.kind.contains(ViewKind::IMAGE) {
            " (image)"
        } else if view.kind.contains(ViewKind::FILE) {
            " (file)"
        } else if view.is_valloc() {
            " (valloc)"
        } else {
            ""
        };
        trace!("View: {:#x} - {:#x}{}", view.base, view.end() - 1, label);
        if view.is_system() {
            return;
        }
        let page = self.page_size();
        let mut start = view.base;
        let mut prot = self.pages.get(start);
        let mut addr = start + page;
        while addr < view.end() {
            let next = self.pages.get(addr);
            if next != prot {
                trace!("      {:#x} - {:#x} {}", start, addr - 1, prot.display());
                start = addr;
                prot = next;
            }
            addr += page;
        }
        trace!("      {:#x} - {:#x} {}", start, addr - 1, prot.display());
    }

    // ========================================================================
    // Host Protection
    // ========================================================================

    /// `protect`, adding execute when forced
    pub(crate) fn mprotect_exec(&self, base: usize, size: usize, prot: UnixProt) -> Result<(), OsError> {
        if self.force_exec && prot.contains(UnixProt::READ) && !prot.contains(UnixProt::EXEC) {
            trace!("forcing exec permission on {:#x}-{:#x}", base, base + size - 1);
            match self.backend.protect(base, size, prot | UnixProt::EXEC) {
                Ok(()) => return Ok(()),
                // Write+exec may be refused; plain write is still fine.
                Err(err) if !prot.contains(UnixProt::WRITE) => return Err(err),
                Err(_) => {}
            }
        }
        self.backend.protect(base, size, prot)
    }

    /// Push the recorded protection of a range to the host, coalescing runs
    ///
    /// `set` and `clear` adjust the recorded bytes for this call only.
    pub(crate) fn mprotect_range(&self, base: usize, size: usize, set: VProt, clear: VProt) {
        let page = self.page_size();
        let start = self.trunc_page(base);
        let count = (self.round_page(base + size) - start) / page;
        if count == 0 {
            return;
        }
        let unix_at = |addr: usize| ((self.pages.get(addr) & !clear) | set).unix();

        let mut run_start = start;
        let mut run_prot = unix_at(start);
        for i in 1..count {
            let addr = start + i * page;
            let prot = unix_at(addr);
            if prot != run_prot {
                let _ = self.mprotect_exec(run_start, addr - run_start, run_prot);
                run_start = addr;
                run_prot = prot;
            }
        }
        let _ = self.mprotect_exec(run_start, start + count * page - run_start, run_prot);
    }

    /// Apply `vprot` to pages of a view; false if the host refused
    pub(crate) fn set_prot(&mut self, id: ViewId, base: usize, size: usize, vprot: VProt) -> bool {
        let Some(view) = self.views.get(id).copied() else {
            return false;
        };

        if view.vprot.contains(VProt::WRITEWATCH) {
            // Pages keep their watch bit; the host protection is derived.
            self.pages.set_bits_range(
                base,
                size,
                vprot.difference(VProt::WRITEWATCH),
                !vprot & !(VProt::WRITEWATCH | VProt::WRITTEN),
            );
            self.mprotect_range(base, size, VProt::empty(), VProt::empty());
            return true;
        }

        // Stack guard pages are armed by the fault handler itself.
        if vprot.contains(VProt::GUARD) && self.in_running_stack(base) {
            self.pages.set_range(base, size, vprot);
            let _ = self.backend.protect(base, size, vprot.unix());
            return true;
        }

        let mut unix = vprot.unix();
        if vprot.contains(VProt::WRITECOPY) && view.vprot.contains(VProt::WRITECOPY) {
            // Check that the page can become writable later.
            unix |= UnixProt::WRITE;
        }
        if self.mprotect_exec(base, size, unix).is_err() {
            return false;
        }
        self.pages.set_bits_range(base, size, vprot, !vprot & !VProt::WRITTEN);
        if vprot.contains(VProt::WRITECOPY) {
            self.mprotect_range(base, size, VProt::empty(), VProt::empty());
        }
        true
    }

    /// Change protection of committed pages from a Win32 value
    pub(crate) fn set_protection(
        &mut self,
        id: ViewId,
        base: usize,
        size: usize,
        protect: PageProtection,
    ) -> VmResult<()> {
        let view = self.view(id)?;
        let vprot = VProt::from_win32(protect, view.kind.contains(ViewKind::IMAGE))?;
        if view.is_valloc() {
            if vprot.contains(VProt::WRITECOPY) {
                return Err(VmError::InvalidPageProtection);
            }
        } else {
            let access = vprot & (VProt::READ | VProt::WRITE | VProt::EXEC);
            if !view.vprot.contains(access) {
                return Err(VmError::InvalidPageProtection);
            }
        }
        if !self.set_prot(id, base, size, vprot | VProt::COMMITTED) {
            return Err(VmError::AccessDenied);
        }
        Ok(())
    }

    // ========================================================================
    // Commit State and Write Watches
    // ========================================================================

    /// Length of the run of pages sharing `base`'s commit state
    pub(crate) fn get_committed_size(&mut self, id: ViewId, base: usize) -> (usize, VProt) {
        let Some(view) = self.views.get(id).copied() else {
            return (0, VProt::empty());
        };
        let mut vprot = self.pages.get(base);

        if view.kind.contains(ViewKind::RESERVE) {
            let request = ServerRequest::GetMappingCommittedRange {
                base: view.base,
                offset: base - view.base,
            };
            return match self.server.call(request) {
                Ok(ServerReply::CommittedRange { size, committed }) => {
                    let size = size.min(view.end() - base);
                    if committed {
                        vprot |= VProt::COMMITTED;
                        self.pages.set_bits_range(base, size, VProt::COMMITTED, VProt::empty());
                    }
                    (size, vprot)
                }
                _ => (0, vprot),
            };
        }

        let page = self.page_size();
        let mut end = base + page;
        while end < view.end() && !(self.pages.get(end) ^ vprot).contains(VProt::COMMITTED) {
            end += page;
        }
        (end - base, vprot)
    }

    /// Whether `[base, base+size)` is inside a write-watched view
    pub(crate) fn is_write_watch_range(&self, base: usize, size: usize) -> bool {
        self.views
            .find(base, size)
            .and_then(|id| self.views.get(id))
            .is_some_and(|v| v.vprot.contains(VProt::WRITEWATCH))
    }

    /// Record the first `accessed` bytes as written and restore protection
    pub(crate) fn update_write_watches(&mut self, base: usize, size: usize, accessed: usize) {
        trace!("updating watch {:#x}-{:#x}-{:#x}", base, base + accessed, base + size);
        self.pages.set_bits_range(
            base,
            accessed,
            VProt::WRITE,
            VProt::WRITEWATCH | VProt::WRITECOPY,
        );
        self.mprotect_range(base, size, VProt::empty(), VProt::empty());
    }

    pub(crate) fn reset_write_watches(&mut self, base: usize, size: usize) {
        self.pages.set_bits_range(base, size, VProt::WRITEWATCH, VProt::empty());
        self.mprotect_range(base, size, VProt::empty(), VProt::empty());
    }

    /// Make a range writable for a kernel-style copy
    ///
    /// Returns whether watches or copy-on-write were lifted; the caller
    /// must then call [`update_write_watches`](Self::update_write_watches).
    pub(crate) fn check_write_access(&self, base: usize, size: usize) -> VmResult<bool> {
        let page = self.page_size();
        let start = self.trunc_page(base);
        let end = self.round_page(base + size);
        let mut has_write_watch = false;

        let mut addr = start;
        while addr < end {
            let mut vprot = self.pages.get(addr);
            if vprot.contains(VProt::WRITEWATCH) {
                has_write_watch = true;
            }
            if vprot.contains(VProt::WRITECOPY) {
                vprot = vprot.difference(VProt::WRITECOPY) | VProt::WRITE;
                has_write_watch = true;
            }
            if !vprot.difference(VProt::WRITEWATCH).unix().contains(UnixProt::WRITE) {
                return Err(VmError::InvalidUserBuffer);
            }
            addr += page;
        }
        if has_write_watch {
            self.mprotect_range(
                start,
                end - start,
                VProt::WRITE,
                VProt::WRITEWATCH | VProt::WRITECOPY,
            );
        }
        Ok(has_write_watch)
    }
}

// ============================================================================
// Virtual Memory Manager
// ============================================================================

/// Process-wide virtual memory manager
///
/// Construct one per process with [`VirtualMemoryManager::new`]; tests
/// build isolated instances over a
/// [`SimulatedBackend`](pmap::SimulatedBackend).
pub struct VirtualMemoryManager {
    state: Mutex<VmState, Yield>,
    pub stats: FaultStats,
}

impl VirtualMemoryManager {
    pub fn new(
        config: VmConfig,
        backend: Arc<dyn MemoryBackend>,
        reserved: Box<dyn ReservedAreas>,
        server: Arc<dyn ServerChannel>,
    ) -> VmResult<Self> {
        let page_size = config.page_size;
        if !page_size.is_power_of_two() || backend.page_size() != page_size {
            error!(
                "page size {:#x} does not match backend page size {:#x}",
                page_size,
                backend.page_size()
            );
            return Err(VmError::InvalidParameter);
        }

        let mut address_space_start = config.address_space_start;
        if let Some((start, end)) = config.preload_reserve {
            trace!("preload reserve {:#x}-{:#x}", start, end);
            if start != 0 {
                address_space_start = address_space_start.min(start);
            }
        }

        let state = VmState {
            pages: PageTable::for_config(&config)?,
            free: FreeRanges::new(GRANULARITY_MASK, config.free_range_capacity),
            views: ViewMap::with_capacity(config.view_capacity),
            reserved,
            address_space_start,
            address_space_limit: config.address_space_limit,
            user_space_limit: config.user_space_limit,
            working_set_limit: config.working_set_limit,
            force_exec: config.force_exec,
            last_already_mapped: None,
            scratch: vec![0u8; page_size].into_boxed_slice(),
            stack: None,
            stack_release_deferred: false,
            tebs: TebBlocks::default(),
            backend,
            server,
            config,
        };
        trace!(
            "address space {:#x}-{:#x}, user limit {:#x}",
            state.address_space_start,
            state.address_space_limit,
            state.user_space_limit
        );
        Ok(Self {
            state: Mutex::new(state),
            stats: FaultStats::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, VmState> {
        self.state.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, VmState>> {
        self.state.try_lock()
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn config(&self) -> VmConfig {
        self.lock().config.clone()
    }

    /// Snapshot of every view in address order
    pub fn views(&self) -> Vec<View> {
        self.lock().views.iter().map(|(_, view)| *view).collect()
    }

    /// Snapshot of the free-range index as `(base, end)` pairs
    pub fn free_ranges(&self) -> Vec<(usize, usize)> {
        self.lock()
            .free
            .ranges()
            .iter()
            .map(|r| (r.base, r.end))
            .collect()
    }

    /// Snapshot of the reserved areas as `(start, size)` pairs
    pub fn reserved_ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        self.lock().reserved.enumerate(false, &mut |start, size| {
            ranges.push((start, size));
            false
        });
        ranges
    }

    /// Recorded protection byte of the page containing `addr`
    pub fn page_protection(&self, addr: usize) -> VProt {
        self.lock().pages.get(addr)
    }

    pub fn view_count(&self) -> usize {
        self.lock().views.len()
    }
}
