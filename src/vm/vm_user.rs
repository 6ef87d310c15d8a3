//! VM User Interface - NT Virtual Memory Calls
//!
//! The operation surface exposed to the system call layer. Every call
//! takes plain values plus `&mut` in/out parameters and returns an
//! [`NtStatus`]; out parameters are only written on success.
//!
//! ## Key Operations
//!
//! - `allocate_virtual_memory`: reserve, commit or reset pages
//! - `free_virtual_memory`: release a whole allocation or decommit part of it
//! - `protect_virtual_memory`: change protection of committed pages
//! - `query_virtual_memory`: describe the region containing an address
//! - `map_view_of_section` / `unmap_view_of_section`: data files and images
//! - `get_write_watch` / `reset_write_watch`
//!
//! Operations on another process are shipped to the server as a
//! [`RemoteCall`]; the receiving side runs them through
//! [`VirtualMemoryManager::execute_remote`].

use std::os::fd::RawFd;
use std::sync::Arc;

use log::{error, trace, warn};

use super::pmap::{Share, UnixProt};
use super::{is_beyond_limit, VProt, ViewKind, VirtualMemoryManager, VmState};
use crate::config::{GRANULARITY, GRANULARITY_MASK};
use crate::error::{status_of, VmError, VmResult};
use crate::server::{RemoteCall, RemoteResult, ServerChannel, ServerReply, ServerRequest};
use crate::types::{
    AllocationType, FreeType, MemState, MemType, MemoryBasicInformation, NtStatus,
    PageProtection, ProcessHandle, Section, SectionAttributes, SystemBasicInformation,
    WriteWatchFlags,
};

/// Lowest address any allocation may use
const LOWEST_USER_ADDRESS: usize = 0x10000;

/// Convert a Win32 zero-bits argument to a 64-bit leading-zero count
///
/// Values below 32 count zero bits above bit 31; larger values are a mask
/// of the usable address bits. 22..=31 are invalid.
pub fn zero_bits_win_to_64(zero_bits: usize) -> Option<u32> {
    match zero_bits {
        0 => Some(0),
        1..=21 => Some(32 + zero_bits as u32),
        22..=31 => None,
        mask => Some((mask as u64).leading_zeros()),
    }
}

// ============================================================================
// Locked Operations
// ============================================================================

impl VmState {
    fn virtual_alloc(
        &mut self,
        addr: usize,
        size: usize,
        zero_bits: u32,
        alloc_type: AllocationType,
        protect: PageProtection,
    ) -> VmResult<(usize, usize)> {
        if is_beyond_limit(0, size, self.working_set_limit) {
            return Err(VmError::WorkingSetLimitRange);
        }
        let page_mask = self.config.page_mask();

        let (base, size) = if addr != 0 {
            let base = if alloc_type.contains(AllocationType::RESERVE) {
                addr & !GRANULARITY_MASK
            } else {
                addr & !page_mask
            };
            let end = addr
                .checked_add(size)
                .and_then(|end| end.checked_add(page_mask))
                .ok_or(VmError::InvalidParameter)?
                & !page_mask;
            let size = end - base;
            // Low 64K and kernel space are off limits.
            if base < LOWEST_USER_ADDRESS || is_beyond_limit(base, size, self.address_space_limit) {
                return Err(VmError::InvalidParameter);
            }
            (Some(base), size)
        } else {
            (None, self.round_page(size))
        };

        let operations = AllocationType::COMMIT | AllocationType::RESERVE | AllocationType::RESET;
        if !alloc_type.intersects(operations) || !AllocationType::all().contains(alloc_type) {
            warn!("called with wrong alloc type flags ({:#010x})", alloc_type.bits());
            return Err(VmError::InvalidParameter);
        }

        if alloc_type.contains(AllocationType::RESERVE) || base.is_none() {
            let mut vprot = VProt::from_win32(protect, false)?;
            if alloc_type.contains(AllocationType::COMMIT) {
                vprot |= VProt::COMMITTED;
            }
            if alloc_type.contains(AllocationType::WRITE_WATCH) {
                vprot |= VProt::WRITEWATCH;
            }
            let kind = if protect.contains(PageProtection::NOCACHE) {
                ViewKind::NOCACHE
            } else {
                ViewKind::empty()
            };
            if vprot.contains(VProt::WRITECOPY) {
                return Err(VmError::InvalidPageProtection);
            }
            let top_down = alloc_type.contains(AllocationType::TOP_DOWN);
            let id = self.map_view(base, size, top_down, vprot, kind, zero_bits)?;
            return Ok((self.view(id)?.base, size));
        }

        // Non-zero base from here on.
        let base = addr & !page_mask;
        let id = self.views.find(base, size).ok_or(VmError::NotMappedView)?;
        if alloc_type.contains(AllocationType::RESET) {
            self.backend.advise_dont_need(base, size)?;
            return Ok((base, size));
        }
        let view = self.view(id)?;
        if view.kind.contains(ViewKind::FILE) {
            return Err(VmError::AlreadyCommitted);
        }
        self.set_protection(id, base, size, protect)?;
        if view.kind.contains(ViewKind::RESERVE) {
            let request = ServerRequest::AddMappingCommittedRange {
                base: view.base,
                offset: base - view.base,
                size,
            };
            if let Err(status) = self.server.call(request) {
                warn!("server did not record committed range {:#x}-{:#x}: {:?}", base, base + size, status);
            }
        }
        Ok((base, size))
    }

    fn virtual_free(&mut self, addr: usize, size: usize, free_type: FreeType) -> VmResult<(usize, usize)> {
        let page_mask = self.config.page_mask();
        let base = addr & !page_mask;
        let size = addr.wrapping_add(size).wrapping_add(page_mask) & !page_mask;
        let size = size.wrapping_sub(base);
        // A null base never names the low area.
        if base == 0 {
            return Err(VmError::InvalidParameter);
        }
        let id = self.views.find(base, size).ok_or(VmError::InvalidParameter)?;
        let view = self.view(id)?;
        if !view.is_valloc() {
            return Err(VmError::InvalidParameter);
        }

        if free_type == FreeType::RELEASE {
            if size != 0 || base != view.base {
                return Err(VmError::InvalidParameter);
            }
            if self.stack.is_some_and(|s| s.deallocation == view.base) {
                if self.stack_release_deferred {
                    return Err(VmError::InvalidParameter);
                }
                warn!("tried to deallocate the running thread stack {:#x}, deferring", view.base);
                self.stack_release_deferred = true;
                return Ok((base, view.size));
            }
            self.delete_view(id);
            Ok((base, view.size))
        } else if free_type == FreeType::DECOMMIT {
            // A zero size runs to the end of the view.
            let size = if size == 0 { view.end() - base } else { size };
            self.decommit_pages(id, base - view.base, size)?;
            Ok((base, size))
        } else {
            warn!("called with wrong free type flags ({:#010x})", free_type.bits());
            Err(VmError::InvalidParameter)
        }
    }

    fn virtual_protect(
        &mut self,
        addr: usize,
        size: usize,
        protect: PageProtection,
    ) -> VmResult<(usize, usize, PageProtection)> {
        let base = self.trunc_page(addr);
        let size = self.round_page(addr.wrapping_add(size)).wrapping_sub(base);
        let id = self.views.find(base, size).ok_or(VmError::InvalidParameter)?;
        let view = self.view(id)?;

        // Every page must be committed.
        let (committed, vprot) = self.get_committed_size(id, base);
        if committed < size || !vprot.contains(VProt::COMMITTED) {
            return Err(VmError::NotCommitted);
        }
        let old = vprot.win32(view.kind);
        self.set_protection(id, base, size, protect)?;
        Ok((base, size, old))
    }

    fn basic_memory_info(&mut self, addr: usize) -> VmResult<MemoryBasicInformation> {
        let base = self.trunc_page(addr);
        if is_beyond_limit(base, 1, self.working_set_limit) {
            return Err(VmError::InvalidParameter);
        }

        let mut alloc_base = 0;
        let mut alloc_end = self.working_set_limit;
        let mut found = None;
        if let Some(id) = self.views.at_or_below(base) {
            let view = self.view(id)?;
            if base < view.end() {
                found = Some(id);
            } else {
                alloc_base = view.end();
            }
        }
        if found.is_none() {
            if let Some(next) = self.views.above(base).and_then(|id| self.views.get(id)) {
                alloc_end = next.base;
            }
        }

        let mut info = MemoryBasicInformation {
            base_address: base,
            allocation_base: alloc_base,
            region_size: alloc_end - base,
            ..Default::default()
        };

        let Some(id) = found else {
            let start_limit = self.address_space_start;
            let hit = self.reserved.enumerate(false, &mut |start, size| {
                let end = start + size;
                if info.base_address + info.region_size <= start {
                    return false;
                }
                if info.base_address >= end {
                    if info.allocation_base < end {
                        info.allocation_base = end;
                    }
                    return false;
                }
                if info.base_address >= start || start <= start_limit {
                    info.state = MemState::Free;
                    info.protect = PageProtection::NOACCESS;
                    info.allocation_base = 0;
                    info.allocation_protect = PageProtection::empty();
                    info.kind = MemType::None;
                    if info.base_address + info.region_size > end {
                        info.region_size = end - info.base_address;
                    }
                } else {
                    // Something outside our reservations lives here.
                    info.region_size = start - info.base_address;
                    info.state = MemState::Reserve;
                    info.protect = PageProtection::NOACCESS;
                    info.allocation_protect = PageProtection::NOACCESS;
                    info.kind = MemType::Private;
                }
                true
            });
            if !hit && !self.config.is_64bit() && base >= self.address_space_start {
                // Outside every reserved area of a 32-bit layout: opaque.
                info.state = MemState::Reserve;
                info.protect = PageProtection::NOACCESS;
                info.allocation_protect = PageProtection::NOACCESS;
                info.kind = MemType::Private;
            } else if !hit {
                info.state = MemState::Free;
                info.protect = PageProtection::NOACCESS;
                info.allocation_base = 0;
                info.allocation_protect = PageProtection::empty();
                info.kind = MemType::None;
            }
            return Ok(info);
        };

        let view = self.view(id)?;
        let (range_size, vprot) = self.get_committed_size(id, base);
        let committed = vprot.contains(VProt::COMMITTED);
        info.allocation_base = view.base;
        info.state = if committed { MemState::Commit } else { MemState::Reserve };
        info.protect = if committed {
            vprot.win32(view.kind)
        } else {
            PageProtection::empty()
        };
        info.allocation_protect = view.vprot.win32(view.kind);
        info.kind = if view.kind.contains(ViewKind::IMAGE) {
            MemType::Image
        } else if view.is_valloc() {
            MemType::Private
        } else {
            MemType::Mapped
        };
        let page = self.page_size();
        let ignored = VProt::WRITEWATCH | VProt::WRITTEN;
        let mut ptr = base;
        while ptr < base + range_size && ((self.pages.get(ptr) ^ vprot) & !ignored).is_empty() {
            ptr += page;
        }
        info.region_size = ptr - base;
        Ok(info)
    }

    fn unmap_section(&mut self, addr: usize) -> VmResult<()> {
        let id = self.views.find(addr, 0).ok_or(VmError::NotMappedView)?;
        let view = self.view(id)?;
        if view.is_valloc() {
            return Err(VmError::NotMappedView);
        }
        if !view.is_system() {
            if let Err(status) = self.server.call(ServerRequest::UnmapView { base: view.base }) {
                error!("failed to unmap {:#x} {:?}", view.base, status);
                return Err(VmError::Server(status));
            }
        }
        self.delete_view(id);
        Ok(())
    }

    fn map_shared(&mut self, fd: RawFd, addr: usize, size: usize, protect: PageProtection) -> VmResult<(usize, usize)> {
        let rounded = self.round_page(size);
        if rounded < size {
            return Err(VmError::InvalidParameter);
        }
        let vprot = VProt::from_win32(protect, false)? | VProt::COMMITTED;
        let base = (addr != 0).then_some(addr);
        let id = self.map_view(base, rounded, false, vprot, ViewKind::empty(), 0)?;
        let view = self.view(id)?;

        let mut prot = vprot.unix();
        if self.force_exec && vprot.contains(VProt::READ) {
            trace!("forcing exec permission on mapping {:#x}-{:#x}", view.base, view.end() - 1);
            prot |= UnixProt::EXEC;
        }
        if let Err(err) = self.backend.map_file(view.base, rounded, prot, Share::Shared, fd, 0) {
            error!("mapping shared memory {:#x} {:#x} failed", view.base, rounded);
            self.delete_view(id);
            return Err(err.into());
        }
        Ok((view.base, rounded))
    }

    fn same_mapping(&self, addr1: usize, addr2: usize) -> NtStatus {
        let first = self.views.find(addr1, 0).and_then(|id| Some((id, *self.views.get(id)?)));
        let second = self.views.find(addr2, 0).and_then(|id| Some((id, *self.views.get(id)?)));
        let (Some((id1, view1)), Some((id2, view2))) = (first, second) else {
            return NtStatus::INVALID_ADDRESS;
        };
        if view1.is_valloc() || view2.is_valloc() {
            return NtStatus::CONFLICTING_ADDRESSES;
        }
        if id1 == id2 {
            return NtStatus::SUCCESS;
        }
        if view1.is_system() || view2.is_system() {
            return NtStatus::NOT_SAME_DEVICE;
        }
        let request = ServerRequest::IsSameMapping {
            base1: view1.base,
            base2: view2.base,
        };
        match self.server.call(request) {
            Ok(_) => NtStatus::SUCCESS,
            Err(status) => status,
        }
    }

    /// Copy readable pages of a non-system view, stopping at the first that is not
    fn read_uninterrupted(&self, addr: usize, buf: &mut [u8]) -> usize {
        let Some(view) = self.views.find(addr, buf.len()).and_then(|id| self.views.get(id)) else {
            return 0;
        };
        if view.is_system() {
            return 0;
        }
        let page = self.page_size();
        let mut done = 0;
        while done < buf.len() && self.pages.get(addr + done).unix().contains(UnixProt::READ) {
            let at = addr + done;
            let block = (buf.len() - done).min(page - (at & (page - 1)));
            if self.backend.read_memory(at, &mut buf[done..done + block]).is_err() {
                break;
            }
            done += block;
        }
        done
    }

    fn write_uninterrupted(&mut self, addr: usize, data: &[u8]) -> VmResult<()> {
        let has_write_watch = self.check_write_access(addr, data.len())?;
        let result = self.backend.write_memory(addr, data);
        if has_write_watch {
            let written = if result.is_ok() { data.len() } else { 0 };
            self.update_write_watches(addr, data.len(), written);
        }
        result.map_err(VmError::from)
    }
}

// ============================================================================
// Public Operations
// ============================================================================

fn queue_apc(server: &dyn ServerChannel, process: u32, call: RemoteCall) -> Result<RemoteResult, NtStatus> {
    trace!("queueing {:?} for process {}", call, process);
    match server.call(ServerRequest::QueueApc { process, call })? {
        ServerReply::Apc(result) => Ok(result),
        _ => Err(NtStatus::UNSUCCESSFUL),
    }
}

impl VirtualMemoryManager {
    fn server(&self) -> Arc<dyn ServerChannel> {
        Arc::clone(&self.lock().server)
    }

    /// Reserve, commit or reset pages
    ///
    /// # Arguments
    /// * `process` - Target process
    /// * `addr` - In: requested address or 0; out: base of the range
    /// * `zero_bits` - Win32 zero-bits argument
    /// * `size` - In: requested size; out: rounded size
    /// * `alloc_type` - `MEM_*` operation and modifiers
    /// * `protect` - Page protection for reserved or committed pages
    pub fn allocate_virtual_memory(
        &self,
        process: ProcessHandle,
        addr: &mut usize,
        zero_bits: usize,
        size: &mut usize,
        alloc_type: AllocationType,
        protect: PageProtection,
    ) -> NtStatus {
        trace!(
            "{:?} {:#x} {:#x} {:#x} {:#x}",
            process,
            *addr,
            *size,
            alloc_type.bits(),
            protect.bits()
        );
        if alloc_type.contains(AllocationType::WRITE_WATCH) && !self.lock().config.write_watch_enabled {
            return NtStatus::NOT_SUPPORTED;
        }
        if *size == 0 {
            return NtStatus::INVALID_PARAMETER;
        }
        let Some(zero_bits_64) = zero_bits_win_to_64(zero_bits) else {
            return NtStatus::INVALID_PARAMETER_3;
        };
        if zero_bits >= 32 && !self.lock().config.is_64bit() {
            return NtStatus::INVALID_PARAMETER_3;
        }

        if let ProcessHandle::Other(pid) = process {
            let call = RemoteCall::Alloc {
                addr: *addr,
                size: *size,
                zero_bits,
                op_type: alloc_type,
                prot: protect,
            };
            return match queue_apc(&*self.server(), pid, call) {
                Ok(RemoteResult::Alloc { status, addr: a, size: s }) => {
                    if status == NtStatus::SUCCESS {
                        *addr = a;
                        *size = s;
                    }
                    status
                }
                Ok(_) => NtStatus::UNSUCCESSFUL,
                Err(status) => status,
            };
        }

        let result = self.lock().virtual_alloc(*addr, *size, zero_bits_64, alloc_type, protect);
        if let Ok((base, len)) = result {
            *addr = base;
            *size = len;
        }
        status_of(result)
    }

    /// Release a whole allocation or decommit part of it
    ///
    /// Release requires the allocation base and a zero size.
    pub fn free_virtual_memory(
        &self,
        process: ProcessHandle,
        addr: &mut usize,
        size: &mut usize,
        free_type: FreeType,
    ) -> NtStatus {
        trace!("{:?} {:#x} {:#x} {:#x}", process, *addr, *size, free_type.bits());
        if let ProcessHandle::Other(pid) = process {
            let call = RemoteCall::Free {
                addr: *addr,
                size: *size,
                op_type: free_type,
            };
            return match queue_apc(&*self.server(), pid, call) {
                Ok(RemoteResult::Free { status, addr: a, size: s }) => {
                    if status == NtStatus::SUCCESS {
                        *addr = a;
                        *size = s;
                    }
                    status
                }
                Ok(_) => NtStatus::UNSUCCESSFUL,
                Err(status) => status,
            };
        }

        let result = self.lock().virtual_free(*addr, *size, free_type);
        if let Ok((base, len)) = result {
            *addr = base;
            *size = len;
        }
        status_of(result)
    }

    /// Change the protection of committed pages
    ///
    /// `old` receives the previous protection of the first page.
    pub fn protect_virtual_memory(
        &self,
        process: ProcessHandle,
        addr: &mut usize,
        size: &mut usize,
        protect: PageProtection,
        old: &mut PageProtection,
    ) -> NtStatus {
        trace!("{:?} {:#x} {:#x} {:#x}", process, *addr, *size, protect.bits());
        if let ProcessHandle::Other(pid) = process {
            let call = RemoteCall::Protect {
                addr: *addr,
                size: *size,
                prot: protect,
            };
            return match queue_apc(&*self.server(), pid, call) {
                Ok(RemoteResult::Protect { status, addr: a, size: s, old: o }) => {
                    if status == NtStatus::SUCCESS {
                        *addr = a;
                        *size = s;
                        *old = o;
                    }
                    status
                }
                Ok(_) => NtStatus::UNSUCCESSFUL,
                Err(status) => status,
            };
        }

        let mut state = self.lock();
        let result = state.virtual_protect(*addr, *size, protect);
        if let Ok((base, len, previous)) = result {
            trace!("protected {:#x}-{:#x}", base, base + len);
            *addr = base;
            *size = len;
            *old = previous;
        }
        status_of(result)
    }

    /// Describe the region containing `addr`
    pub fn query_virtual_memory(
        &self,
        process: ProcessHandle,
        addr: usize,
        info: &mut MemoryBasicInformation,
    ) -> NtStatus {
        if let ProcessHandle::Other(pid) = process {
            return match queue_apc(&*self.server(), pid, RemoteCall::Query { addr }) {
                Ok(RemoteResult::Query { status, info: remote }) => {
                    if status == NtStatus::SUCCESS {
                        *info = remote;
                    }
                    status
                }
                Ok(_) => NtStatus::UNSUCCESSFUL,
                Err(status) => status,
            };
        }

        let result = self.lock().basic_memory_info(addr);
        if let Ok(found) = result {
            *info = found;
        }
        status_of(result)
    }

    /// Pin pages in memory
    pub fn lock_virtual_memory(&self, process: ProcessHandle, addr: &mut usize, size: &mut usize) -> NtStatus {
        if let ProcessHandle::Other(pid) = process {
            let call = RemoteCall::Lock { addr: *addr, size: *size };
            return self.remote_range(pid, call, addr, size);
        }
        let state = self.lock();
        let base = state.trunc_page(*addr);
        *size = state.round_page(addr.wrapping_add(*size)).wrapping_sub(base);
        *addr = base;
        match state.backend.lock(*addr, *size) {
            Ok(()) => NtStatus::SUCCESS,
            Err(_) => NtStatus::ACCESS_DENIED,
        }
    }

    pub fn unlock_virtual_memory(&self, process: ProcessHandle, addr: &mut usize, size: &mut usize) -> NtStatus {
        if let ProcessHandle::Other(pid) = process {
            let call = RemoteCall::Unlock { addr: *addr, size: *size };
            return self.remote_range(pid, call, addr, size);
        }
        let state = self.lock();
        let base = state.trunc_page(*addr);
        *size = state.round_page(addr.wrapping_add(*size)).wrapping_sub(base);
        *addr = base;
        match state.backend.unlock(*addr, *size) {
            Ok(()) => NtStatus::SUCCESS,
            Err(_) => NtStatus::ACCESS_DENIED,
        }
    }

    /// Write dirty pages of a file view back; a zero size means the whole view
    pub fn flush_virtual_memory(&self, process: ProcessHandle, addr: &mut usize, size: &mut usize) -> NtStatus {
        if let ProcessHandle::Other(pid) = process {
            let call = RemoteCall::Flush { addr: *addr, size: *size };
            return self.remote_range(pid, call, addr, size);
        }
        let state = self.lock();
        let base = state.trunc_page(*addr);
        let Some(view) = state.views.find(base, *size).and_then(|id| state.views.get(id)) else {
            return NtStatus::INVALID_PARAMETER;
        };
        if *size == 0 {
            *size = view.size;
        }
        *addr = base;
        match state.backend.sync(base, *size) {
            Ok(()) => NtStatus::SUCCESS,
            Err(_) => NtStatus::NOT_MAPPED_DATA,
        }
    }

    fn remote_range(&self, pid: u32, call: RemoteCall, addr: &mut usize, size: &mut usize) -> NtStatus {
        match queue_apc(&*self.server(), pid, call) {
            Ok(
                RemoteResult::Lock { status, addr: a, size: s }
                | RemoteResult::Unlock { status, addr: a, size: s }
                | RemoteResult::Flush { status, addr: a, size: s },
            ) => {
                if status == NtStatus::SUCCESS {
                    *addr = a;
                    *size = s;
                }
                status
            }
            Ok(_) => NtStatus::UNSUCCESSFUL,
            Err(status) => status,
        }
    }

    // ========================================================================
    // Write Watches
    // ========================================================================

    /// Collect pages written since the last reset
    ///
    /// At most `min(*count, addresses.len())` addresses are returned;
    /// with [`WriteWatchFlags::RESET`] the reported pages are re-armed.
    pub fn get_write_watch(
        &self,
        flags: WriteWatchFlags,
        base: usize,
        size: usize,
        addresses: &mut [usize],
        count: &mut usize,
        granularity: &mut usize,
    ) -> NtStatus {
        let mut state = self.lock();
        let page = state.page_size();
        let start = state.trunc_page(base);
        let size = state.round_page(base.wrapping_add(size)).wrapping_sub(start);
        if *count == 0 || size == 0 {
            return NtStatus::INVALID_PARAMETER;
        }
        if !WriteWatchFlags::all().contains(flags) {
            return NtStatus::INVALID_PARAMETER;
        }
        trace!("{:#x}-{:#x} {}", start, start + size, *count);
        if !state.is_write_watch_range(start, size) {
            return NtStatus::INVALID_PARAMETER;
        }

        let capacity = (*count).min(addresses.len());
        let end = start + size;
        let mut pos = 0;
        let mut addr = start;
        while pos < capacity && addr < end {
            if !state.pages.get(addr).contains(VProt::WRITEWATCH) {
                addresses[pos] = addr;
                pos += 1;
            }
            addr += page;
        }
        if flags.contains(WriteWatchFlags::RESET) {
            state.reset_write_watches(start, addr - start);
        }
        *count = pos;
        *granularity = page;
        NtStatus::SUCCESS
    }

    pub fn reset_write_watch(&self, base: usize, size: usize) -> NtStatus {
        let mut state = self.lock();
        let start = state.trunc_page(base);
        let size = state.round_page(base.wrapping_add(size)).wrapping_sub(start);
        if size == 0 {
            return NtStatus::INVALID_PARAMETER;
        }
        if !state.is_write_watch_range(start, size) {
            return NtStatus::INVALID_PARAMETER;
        }
        state.reset_write_watches(start, size);
        NtStatus::SUCCESS
    }

    // ========================================================================
    // Sections
    // ========================================================================

    /// Map a view of a data or image section
    ///
    /// Images are placed at their preferred base when possible and report
    /// [`NtStatus::IMAGE_NOT_AT_BASE`] otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn map_view_of_section(
        &self,
        section: &Section,
        process: ProcessHandle,
        addr: &mut usize,
        zero_bits: usize,
        offset: u64,
        size: &mut usize,
        alloc_type: AllocationType,
        protect: PageProtection,
    ) -> NtStatus {
        trace!(
            "fd={} process={:?} addr={:#x} off={:#x} size={:#x} access={:#x}",
            section.fd,
            process,
            *addr,
            offset,
            *size,
            protect.bits()
        );
        let Some(zero_bits_64) = zero_bits_win_to_64(zero_bits) else {
            return NtStatus::INVALID_PARAMETER_4;
        };
        if zero_bits >= 32 && !self.lock().config.is_64bit() {
            return NtStatus::INVALID_PARAMETER_4;
        }
        // An address and zero bits must agree.
        if *addr != 0 && zero_bits != 0 && zero_bits < 32 && (*addr as u64) >> (32 - zero_bits) != 0 {
            return NtStatus::INVALID_PARAMETER_4;
        }
        if *addr != 0 && zero_bits >= 32 && *addr & !zero_bits != 0 {
            return NtStatus::INVALID_PARAMETER_4;
        }
        if offset & GRANULARITY_MASK as u64 != 0 || *addr & GRANULARITY_MASK != 0 {
            return NtStatus::MAPPED_ALIGNMENT;
        }

        if let ProcessHandle::Other(pid) = process {
            let call = RemoteCall::MapView {
                section: *section,
                addr: *addr,
                size: *size,
                offset,
                zero_bits,
                alloc_type,
                prot: protect,
            };
            return match queue_apc(&*self.server(), pid, call) {
                Ok(RemoteResult::MapView { status, addr: a, size: s }) => {
                    if status.is_success() {
                        *addr = a;
                        *size = s;
                    }
                    status
                }
                Ok(_) => NtStatus::UNSUCCESSFUL,
                Err(status) => status,
            };
        }

        let top_down = alloc_type.contains(AllocationType::TOP_DOWN);
        let mut state = self.lock();
        if section.attributes.contains(SectionAttributes::IMAGE) {
            let result = state.map_image(section.fd, section.shared_fd, top_down, zero_bits_64, false);
            return match result {
                Ok(mapped) => {
                    *addr = mapped.base;
                    *size = mapped.size;
                    if mapped.at_base {
                        NtStatus::SUCCESS
                    } else {
                        NtStatus::IMAGE_NOT_AT_BASE
                    }
                }
                Err(err) => err.into(),
            };
        }

        if let Err(err) = check_section_access(section.protection, protect) {
            return err.into();
        }
        let base = (*addr != 0).then_some(*addr);
        let result = state.map_data_section(section, base, *size, offset, protect, top_down, zero_bits_64);
        if let Ok(mapped) = result {
            *addr = mapped.base;
            *size = mapped.size;
        }
        status_of(result)
    }

    /// Destroy a file or image view
    pub fn unmap_view_of_section(&self, process: ProcessHandle, addr: usize) -> NtStatus {
        if let ProcessHandle::Other(pid) = process {
            return match queue_apc(&*self.server(), pid, RemoteCall::UnmapView { addr }) {
                Ok(result) => result.status(),
                Err(status) => status,
            };
        }
        status_of(self.lock().unmap_section(addr))
    }

    /// Map a shared file as one committed private view
    pub fn map_shared_memory(
        &self,
        fd: RawFd,
        addr: &mut usize,
        size: &mut usize,
        protect: PageProtection,
    ) -> NtStatus {
        let result = self.lock().map_shared(fd, *addr, *size, protect);
        if let Ok((base, len)) = result {
            *addr = base;
            *size = len;
        }
        status_of(result)
    }

    /// Whether the views containing two addresses map the same file
    pub fn are_mapped_files_the_same(&self, addr1: usize, addr2: usize) -> NtStatus {
        trace!("{:#x} {:#x}", addr1, addr2);
        self.lock().same_mapping(addr1, addr2)
    }

    /// Record an image loaded by someone else at `module`
    pub fn create_builtin_view(&self, module: usize) -> NtStatus {
        status_of(self.lock().create_builtin_view(module))
    }

    // ========================================================================
    // Memory Access
    // ========================================================================

    /// Copy out of a non-system view without faulting; returns bytes copied
    pub fn uninterrupted_read_memory(&self, addr: usize, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        self.lock().read_uninterrupted(addr, buf)
    }

    /// Copy into memory without faulting, lifting watches and copy-on-write
    pub fn uninterrupted_write_memory(&self, addr: usize, data: &[u8]) -> NtStatus {
        if data.is_empty() {
            return NtStatus::SUCCESS;
        }
        status_of(self.lock().write_uninterrupted(addr, data))
    }

    /// Read from a file into a buffer that may be watched or copy-on-write
    pub fn locked_read(&self, fd: RawFd, offset: u64, addr: usize, size: usize, read: &mut usize) -> NtStatus {
        let mut state = self.lock();
        let has_write_watch = match state.check_write_access(addr, size) {
            Ok(flag) => flag,
            Err(err) => return err.into(),
        };
        let result = state.backend.read_file_to(fd, offset, addr, size);
        if has_write_watch {
            let done = *result.as_ref().unwrap_or(&0);
            state.update_write_watches(addr, size, done);
        }
        match result {
            Ok(n) => {
                *read = n;
                NtStatus::SUCCESS
            }
            Err(err) => VmError::from(err).into(),
        }
    }

    /// Read another process's memory, or this one's without faulting
    pub fn read_process_memory(
        &self,
        process: ProcessHandle,
        addr: usize,
        buf: &mut [u8],
        bytes_read: &mut usize,
    ) -> NtStatus {
        *bytes_read = 0;
        match process {
            ProcessHandle::Current => {
                let n = self.uninterrupted_read_memory(addr, buf);
                *bytes_read = n;
                if n == buf.len() {
                    NtStatus::SUCCESS
                } else {
                    NtStatus::PARTIAL_COPY
                }
            }
            ProcessHandle::Other(pid) => {
                let request = ServerRequest::ReadProcessMemory {
                    process: pid,
                    addr,
                    size: buf.len(),
                };
                match self.server().call(request) {
                    Ok(ServerReply::Bytes(bytes)) => {
                        let n = bytes.len().min(buf.len());
                        buf[..n].copy_from_slice(&bytes[..n]);
                        *bytes_read = n;
                        if n == buf.len() {
                            NtStatus::SUCCESS
                        } else {
                            NtStatus::PARTIAL_COPY
                        }
                    }
                    Ok(_) => NtStatus::UNSUCCESSFUL,
                    Err(status) => status,
                }
            }
        }
    }

    pub fn write_process_memory(
        &self,
        process: ProcessHandle,
        addr: usize,
        data: &[u8],
        bytes_written: &mut usize,
    ) -> NtStatus {
        *bytes_written = 0;
        match process {
            ProcessHandle::Current => {
                if self.uninterrupted_write_memory(addr, data) != NtStatus::SUCCESS {
                    return NtStatus::PARTIAL_COPY;
                }
                *bytes_written = data.len();
                NtStatus::SUCCESS
            }
            ProcessHandle::Other(pid) => {
                let request = ServerRequest::WriteProcessMemory {
                    process: pid,
                    addr,
                    data: data.to_vec(),
                };
                match self.server().call(request) {
                    Ok(ServerReply::Written(n)) => {
                        *bytes_written = n;
                        if n == data.len() {
                            NtStatus::SUCCESS
                        } else {
                            NtStatus::PARTIAL_COPY
                        }
                    }
                    Ok(_) => NtStatus::UNSUCCESSFUL,
                    Err(status) => status,
                }
            }
        }
    }

    // ========================================================================
    // Process State
    // ========================================================================

    /// Whether `[addr, addr+size)` lies in a view visible to the application
    pub fn is_valid_code_address(&self, addr: usize, size: usize) -> bool {
        let state = self.lock();
        state
            .views
            .find(addr, size)
            .and_then(|id| state.views.get(id))
            .is_some_and(|view| !view.is_system())
    }

    /// Force execute permission on every readable mapping
    pub fn set_force_exec(&self, enable: bool) {
        let mut state = self.lock();
        if state.force_exec == enable {
            return;
        }
        state.force_exec = enable;
        let views: Vec<_> = state.views.iter().map(|(_, view)| *view).collect();
        for view in views {
            // File mappings are always accessible.
            let commit = if view.is_valloc() {
                VProt::empty()
            } else {
                VProt::COMMITTED
            };
            state.mprotect_range(view.base, view.size, commit, VProt::empty());
        }
    }

    pub fn system_info(&self) -> SystemBasicInformation {
        let state = self.lock();
        SystemBasicInformation {
            page_size: state.page_size(),
            allocation_granularity: GRANULARITY,
            lowest_user_address: LOWEST_USER_ADDRESS,
            highest_user_address: state.user_space_limit - 1,
        }
    }

    /// Open the whole address space to a large-address-aware process
    pub fn set_large_address_space(&self, large_address_aware: bool) {
        if !large_address_aware {
            return;
        }
        let mut state = self.lock();
        state.user_space_limit = state.address_space_limit;
        state.working_set_limit = state.address_space_limit;
    }

    // ========================================================================
    // Remote Calls
    // ========================================================================

    /// Run a call queued by another process against this one
    pub fn execute_remote(&self, call: RemoteCall) -> RemoteResult {
        let me = ProcessHandle::Current;
        match call {
            RemoteCall::Alloc {
                mut addr,
                mut size,
                zero_bits,
                op_type,
                prot,
            } => {
                let status = self.allocate_virtual_memory(me, &mut addr, zero_bits, &mut size, op_type, prot);
                RemoteResult::Alloc { status, addr, size }
            }
            RemoteCall::Free {
                mut addr,
                mut size,
                op_type,
            } => {
                let status = self.free_virtual_memory(me, &mut addr, &mut size, op_type);
                RemoteResult::Free { status, addr, size }
            }
            RemoteCall::Protect {
                mut addr,
                mut size,
                prot,
            } => {
                let mut old = PageProtection::empty();
                let status = self.protect_virtual_memory(me, &mut addr, &mut size, prot, &mut old);
                RemoteResult::Protect { status, addr, size, old }
            }
            RemoteCall::Query { addr } => {
                let mut info = MemoryBasicInformation::default();
                let status = self.query_virtual_memory(me, addr, &mut info);
                RemoteResult::Query { status, info }
            }
            RemoteCall::Lock { mut addr, mut size } => {
                let status = self.lock_virtual_memory(me, &mut addr, &mut size);
                RemoteResult::Lock { status, addr, size }
            }
            RemoteCall::Unlock { mut addr, mut size } => {
                let status = self.unlock_virtual_memory(me, &mut addr, &mut size);
                RemoteResult::Unlock { status, addr, size }
            }
            RemoteCall::Flush { mut addr, mut size } => {
                let status = self.flush_virtual_memory(me, &mut addr, &mut size);
                RemoteResult::Flush { status, addr, size }
            }
            RemoteCall::MapView {
                section,
                mut addr,
                mut size,
                offset,
                zero_bits,
                alloc_type,
                prot,
            } => {
                let status = self.map_view_of_section(
                    &section, me, &mut addr, zero_bits, offset, &mut size, alloc_type, prot,
                );
                RemoteResult::MapView { status, addr, size }
            }
            RemoteCall::UnmapView { addr } => RemoteResult::UnmapView {
                status: self.unmap_view_of_section(me, addr),
            },
        }
    }
}

/// A view may not ask for access its section was not created with
fn check_section_access(section: PageProtection, requested: PageProtection) -> VmResult<()> {
    let max = VProt::from_win32(section, false)?;
    let want = VProt::from_win32(requested, false)?;
    let denied = (want.contains(VProt::WRITE) && !max.contains(VProt::WRITE))
        || (want.contains(VProt::WRITECOPY) && !max.intersects(VProt::WRITE | VProt::WRITECOPY))
        || (want.contains(VProt::EXEC) && !max.contains(VProt::EXEC));
    if denied {
        return Err(VmError::AccessDenied);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::reserved::ReservedAreaList;
    use crate::server::LocalServer;
    use crate::vm::pmap::{MemoryBackend, SimulatedBackend};
    use crate::vm::ThreadStack;

    const PAGE: usize = 0x1000;
    const ME: ProcessHandle = ProcessHandle::Current;
    const RW: PageProtection = PageProtection::READWRITE;
    const RESERVE: AllocationType = AllocationType::RESERVE;
    const COMMIT: AllocationType = AllocationType::COMMIT;

    struct Fixture {
        vm: VirtualMemoryManager,
        sim: Arc<SimulatedBackend>,
        server: Arc<LocalServer>,
    }

    fn fixture_with(config: VmConfig, reserved: ReservedAreaList) -> Fixture {
        let sim = Arc::new(SimulatedBackend::new(PAGE));
        let server = Arc::new(LocalServer::new());
        let vm = VirtualMemoryManager::new(config, sim.clone(), Box::new(reserved), server.clone()).unwrap();
        Fixture { vm, sim, server }
    }

    fn fixture() -> Fixture {
        fixture_with(VmConfig::wide(PAGE), ReservedAreaList::new())
    }

    fn alloc(vm: &VirtualMemoryManager, addr: usize, size: usize, ty: AllocationType, prot: PageProtection) -> (NtStatus, usize, usize) {
        let (mut a, mut s) = (addr, size);
        let status = vm.allocate_virtual_memory(ME, &mut a, 0, &mut s, ty, prot);
        (status, a, s)
    }

    fn release(vm: &VirtualMemoryManager, addr: usize) -> NtStatus {
        let (mut a, mut s) = (addr, 0);
        vm.free_virtual_memory(ME, &mut a, &mut s, FreeType::RELEASE)
    }

    fn query(vm: &VirtualMemoryManager, addr: usize) -> MemoryBasicInformation {
        let mut info = MemoryBasicInformation::default();
        assert_eq!(vm.query_virtual_memory(ME, addr, &mut info), NtStatus::SUCCESS);
        info
    }

    #[test]
    fn test_zero_bits_conversion() {
        assert_eq!(zero_bits_win_to_64(0), Some(0));
        assert_eq!(zero_bits_win_to_64(1), Some(33));
        assert_eq!(zero_bits_win_to_64(21), Some(53));
        assert_eq!(zero_bits_win_to_64(22), None);
        assert_eq!(zero_bits_win_to_64(31), None);
        assert_eq!(zero_bits_win_to_64(0x7fff_ffff), Some(33));
        assert_eq!(zero_bits_win_to_64(0xffff_ffff), Some(32));
    }

    #[test]
    fn test_allocate_reserve_commit() {
        let f = fixture();
        let (status, base, size) = alloc(&f.vm, 0, 0x10000, RESERVE | COMMIT, RW);
        assert_eq!(status, NtStatus::SUCCESS);
        assert_eq!(base & GRANULARITY_MASK, 0);
        assert_eq!(size, 0x10000);

        let info = query(&f.vm, base);
        assert_eq!(info.base_address, base);
        assert_eq!(info.allocation_base, base);
        assert_eq!(info.region_size, 0x10000);
        assert_eq!(info.state, MemState::Commit);
        assert_eq!(info.protect, RW);
        assert_eq!(info.kind, MemType::Private);
    }

    #[test]
    fn test_release_then_reserve_same_address() {
        let f = fixture();
        let base = 0x2000_0000;
        assert_eq!(alloc(&f.vm, base, 0x10000, RESERVE, RW).0, NtStatus::SUCCESS);
        assert_eq!(release(&f.vm, base), NtStatus::SUCCESS);
        assert_eq!(query(&f.vm, base).state, MemState::Free);
        let (status, again, _) = alloc(&f.vm, base, 0x10000, RESERVE, RW);
        assert_eq!(status, NtStatus::SUCCESS);
        assert_eq!(again, base);
    }

    #[test]
    fn test_release_requires_exact_base() {
        let f = fixture();
        let (_, base, _) = alloc(&f.vm, 0, 0x20000, RESERVE, RW);
        let before = f.vm.views();
        assert_eq!(release(&f.vm, base + PAGE), NtStatus::INVALID_PARAMETER);
        let (mut a, mut s) = (base, PAGE);
        assert_eq!(
            f.vm.free_virtual_memory(ME, &mut a, &mut s, FreeType::RELEASE),
            NtStatus::INVALID_PARAMETER
        );
        assert_eq!(release(&f.vm, 0x7000_0000), NtStatus::INVALID_PARAMETER);
        assert_eq!(f.vm.views(), before);
    }

    #[test]
    fn test_fixed_reserve_conflicts() {
        let f = fixture();
        let base = 0x3000_0000;
        assert_eq!(alloc(&f.vm, base, 0x10000, RESERVE, RW).0, NtStatus::SUCCESS);
        assert_eq!(alloc(&f.vm, base, 0x10000, RESERVE, RW).0, NtStatus::CONFLICTING_ADDRESSES);
        assert_eq!(alloc(&f.vm, 0x1000, 0x1000, RESERVE, RW).0, NtStatus::INVALID_PARAMETER);
    }

    #[test]
    fn test_allocate_argument_checks() {
        let f = fixture();
        assert_eq!(alloc(&f.vm, 0, 0, RESERVE, RW).0, NtStatus::INVALID_PARAMETER);
        assert_eq!(
            alloc(&f.vm, 0, 0x1000, AllocationType::TOP_DOWN, RW).0,
            NtStatus::INVALID_PARAMETER
        );
        assert_eq!(
            alloc(&f.vm, 0, 0x1000, RESERVE, PageProtection::WRITECOPY).0,
            NtStatus::INVALID_PAGE_PROTECTION
        );
        assert_eq!(
            alloc(&f.vm, 0, 0x1000, RESERVE, PageProtection::from_bits_retain(0x3)).0,
            NtStatus::INVALID_PAGE_PROTECTION
        );
        let (mut a, mut s) = (0, 0x1000);
        assert_eq!(
            f.vm.allocate_virtual_memory(ME, &mut a, 25, &mut s, RESERVE, RW),
            NtStatus::INVALID_PARAMETER_3
        );
        assert_eq!(f.vm.view_count(), 0);
    }

    #[test]
    fn test_write_watch_can_be_disabled() {
        let config = VmConfig {
            write_watch_enabled: false,
            ..VmConfig::wide(PAGE)
        };
        let f = fixture_with(config, ReservedAreaList::new());
        let ty = RESERVE | COMMIT | AllocationType::WRITE_WATCH;
        assert_eq!(alloc(&f.vm, 0, 0x1000, ty, RW).0, NtStatus::NOT_SUPPORTED);
    }

    #[test]
    fn test_protect_round_trip() {
        let f = fixture();
        let (_, base, _) = alloc(&f.vm, 0, 0x10000, RESERVE, PageProtection::NOACCESS);
        assert_eq!(alloc(&f.vm, base, 0x2000, COMMIT, RW).0, NtStatus::SUCCESS);

        let (mut a, mut s) = (base + 0x10, 0x1000);
        let mut old = PageProtection::empty();
        let status = f
            .vm
            .protect_virtual_memory(ME, &mut a, &mut s, PageProtection::READONLY, &mut old);
        assert_eq!(status, NtStatus::SUCCESS);
        assert_eq!((a, s), (base, 0x1000));
        assert_eq!(old, RW);

        let info = query(&f.vm, base);
        assert_eq!(info.state, MemState::Commit);
        assert_eq!(info.protect, PageProtection::READONLY);
        assert_eq!(info.region_size, 0x1000);
        assert_eq!(f.sim.prot_at(base), Some(UnixProt::READ));
        assert_eq!(query(&f.vm, base + 0x2000).state, MemState::Reserve);
    }

    #[test]
    fn test_protect_mixed_commit_changes_nothing() {
        let f = fixture();
        let (_, base, _) = alloc(&f.vm, 0, 0x4000, RESERVE, RW);
        alloc(&f.vm, base, 0x2000, COMMIT, RW);
        let before: Vec<_> = (0..4).map(|i| f.vm.page_protection(base + i * PAGE)).collect();

        let (mut a, mut s) = (base, 0x4000);
        let mut old = PageProtection::empty();
        assert_eq!(
            f.vm.protect_virtual_memory(ME, &mut a, &mut s, PageProtection::READONLY, &mut old),
            NtStatus::NOT_COMMITTED
        );
        let after: Vec<_> = (0..4).map(|i| f.vm.page_protection(base + i * PAGE)).collect();
        assert_eq!(before, after);
        assert_eq!(f.sim.prot_at(base), Some(UnixProt::RW));
    }

    #[test]
    fn test_decommit_and_reset() {
        let f = fixture();
        let (_, base, _) = alloc(&f.vm, 0, 0x4000, RESERVE | COMMIT, RW);
        assert_eq!(f.vm.uninterrupted_write_memory(base + 0x1000, &[7; 4]), NtStatus::SUCCESS);

        let (mut a, mut s) = (base, 0x4000);
        assert_eq!(alloc(&f.vm, base, 0x4000, AllocationType::RESET, RW).0, NtStatus::SUCCESS);
        let mut byte = [0u8; 1];
        f.sim.read_memory(base + 0x1000, &mut byte).unwrap();
        assert_eq!(byte, [0]);

        let (mut da, mut ds) = (base + 0x1000, 0x1000);
        assert_eq!(
            f.vm.free_virtual_memory(ME, &mut da, &mut ds, FreeType::DECOMMIT),
            NtStatus::SUCCESS
        );
        assert_eq!(query(&f.vm, base + 0x1000).state, MemState::Reserve);
        assert_eq!(query(&f.vm, base).region_size, 0x1000);
        assert_eq!(f.sim.prot_at(base + 0x1000), Some(UnixProt::NONE));
        assert_eq!(
            f.vm.free_virtual_memory(ME, &mut a, &mut s, FreeType::RELEASE | FreeType::DECOMMIT),
            NtStatus::INVALID_PARAMETER
        );
    }

    #[test]
    fn test_commit_outside_view() {
        let f = fixture();
        assert_eq!(alloc(&f.vm, 0x4000_0000, 0x1000, COMMIT, RW).0, NtStatus::NOT_MAPPED_VIEW);
    }

    #[test]
    fn test_write_watch_tracking() {
        let f = fixture();
        let ty = RESERVE | COMMIT | AllocationType::WRITE_WATCH;
        let (_, base, _) = alloc(&f.vm, 0, 0x4000, ty, RW);
        assert_eq!(f.sim.prot_at(base), Some(UnixProt::READ));
        assert_eq!(f.vm.uninterrupted_write_memory(base + 0x2004, &[1, 2]), NtStatus::SUCCESS);

        let mut addresses = [0usize; 8];
        let (mut count, mut granularity) = (addresses.len(), 0);
        let status = f.vm.get_write_watch(
            WriteWatchFlags::RESET,
            base,
            0x4000,
            &mut addresses,
            &mut count,
            &mut granularity,
        );
        assert_eq!(status, NtStatus::SUCCESS);
        assert_eq!(&addresses[..count], &[base + 0x2000]);
        assert_eq!(granularity, PAGE);

        count = addresses.len();
        f.vm.get_write_watch(
            WriteWatchFlags::empty(),
            base,
            0x4000,
            &mut addresses,
            &mut count,
            &mut granularity,
        );
        assert_eq!(count, 0);
        assert_eq!(f.vm.reset_write_watch(base, 0x4000), NtStatus::SUCCESS);
    }

    #[test]
    fn test_write_watch_requires_watched_range() {
        let f = fixture();
        let (_, base, _) = alloc(&f.vm, 0, 0x1000, RESERVE | COMMIT, RW);
        let mut addresses = [0usize; 1];
        let (mut count, mut granularity) = (1, 0);
        assert_eq!(
            f.vm.get_write_watch(WriteWatchFlags::empty(), base, 0x1000, &mut addresses, &mut count, &mut granularity),
            NtStatus::INVALID_PARAMETER
        );
        assert_eq!(f.vm.reset_write_watch(base, 0x1000), NtStatus::INVALID_PARAMETER);
        assert_eq!(f.vm.reset_write_watch(base, 0), NtStatus::INVALID_PARAMETER);
    }

    #[test]
    fn test_query_free_and_reserved_areas() {
        let reserved = ReservedAreaList::from_ranges([(0x5000_0000, 0x10_0000)]);
        let f = fixture_with(VmConfig::wide(PAGE), reserved);

        let info = query(&f.vm, 0x5000_8000);
        assert_eq!(info.state, MemState::Free);
        assert_eq!(info.allocation_base, 0);

        let info = query(&f.vm, 0x4000_0000);
        assert_eq!(info.state, MemState::Reserve);
        assert_eq!(info.kind, MemType::Private);
        assert_eq!(info.region_size, 0x1000_0000);

        let mut info = MemoryBasicInformation::default();
        assert_eq!(
            f.vm.query_virtual_memory(ME, usize::MAX, &mut info),
            NtStatus::INVALID_PARAMETER
        );
    }

    #[test]
    fn test_query_outside_reservations_on_narrow_layout() {
        let f = fixture_with(VmConfig::narrow(PAGE), ReservedAreaList::new());
        let info = query(&f.vm, 0x2000_0000);
        assert_eq!(info.state, MemState::Reserve);
        assert_eq!(info.protect, PageProtection::NOACCESS);
        assert_eq!(info.allocation_protect, PageProtection::NOACCESS);
        assert_eq!(info.kind, MemType::Private);

        // Below the address-space start nothing is hidden.
        let info = query(&f.vm, 0x10000);
        assert_eq!(info.state, MemState::Free);
        assert_eq!(info.kind, MemType::None);
    }

    #[test]
    fn test_lock_and_flush() {
        let f = fixture();
        let (_, base, _) = alloc(&f.vm, 0, 0x2000, RESERVE | COMMIT, RW);
        let (mut a, mut s) = (base + 0x10, 0x10);
        assert_eq!(f.vm.lock_virtual_memory(ME, &mut a, &mut s), NtStatus::SUCCESS);
        assert_eq!((a, s), (base, PAGE));
        assert!(f.sim.is_locked(base));
        assert_eq!(f.vm.unlock_virtual_memory(ME, &mut a, &mut s), NtStatus::SUCCESS);
        assert!(!f.sim.is_locked(base));

        let (mut a, mut s) = (base, 0);
        assert_eq!(f.vm.flush_virtual_memory(ME, &mut a, &mut s), NtStatus::SUCCESS);
        assert_eq!(s, 0x2000);
        let (mut a, mut s) = (0x6000_0000, 0);
        assert_eq!(f.vm.flush_virtual_memory(ME, &mut a, &mut s), NtStatus::INVALID_PARAMETER);
    }

    /// Local server that will not track committed ranges
    struct NoCommitTracking(LocalServer);

    impl ServerChannel for NoCommitTracking {
        fn call(&self, request: ServerRequest) -> Result<ServerReply, NtStatus> {
            match request {
                ServerRequest::AddMappingCommittedRange { .. } => Err(NtStatus::UNSUCCESSFUL),
                other => self.0.call(other),
            }
        }
    }

    #[test]
    fn test_commit_in_reserved_section_survives_server_refusal() {
        let sim = Arc::new(SimulatedBackend::new(PAGE));
        let vm = VirtualMemoryManager::new(
            VmConfig::wide(PAGE),
            sim.clone(),
            Box::new(ReservedAreaList::new()),
            Arc::new(NoCommitTracking(LocalServer::new())),
        )
        .unwrap();
        let fd = sim.create_file(&[0u8; 0x4000]);
        let section = Section::pagefile(fd, 0x4000, RW, true);
        let (mut addr, mut size) = (0, 0);
        let status = vm.map_view_of_section(&section, ME, &mut addr, 0, 0, &mut size, AllocationType::empty(), RW);
        assert_eq!(status, NtStatus::SUCCESS);
        assert_eq!(query(&vm, addr).state, MemState::Reserve);

        let (status, base, committed) = alloc(&vm, addr + PAGE, PAGE, COMMIT, RW);
        assert_eq!(status, NtStatus::SUCCESS);
        assert_eq!((base, committed), (addr + PAGE, PAGE));
        let info = query(&vm, addr + PAGE);
        assert_eq!(info.state, MemState::Commit);
        assert_eq!(info.protect, RW);
    }

    #[test]
    fn test_map_data_view_and_unmap() {
        let f = fixture();
        let fd = f.sim.create_file(&[3u8; 0x20000]);
        let section = Section::file(fd, 0x20000, RW);

        let (mut addr, mut size) = (0, 0);
        let status = f.vm.map_view_of_section(&section, ME, &mut addr, 0, 0x10000, &mut size, AllocationType::empty(), RW);
        assert_eq!(status, NtStatus::SUCCESS);
        assert_eq!(size, 0x10000);
        assert!(f.server.registered(addr).is_some());
        assert_eq!(query(&f.vm, addr).kind, MemType::Mapped);

        // Private allocations are not views of a section.
        let (_, private, _) = alloc(&f.vm, 0, 0x1000, RESERVE, RW);
        assert_eq!(f.vm.unmap_view_of_section(ME, private), NtStatus::NOT_MAPPED_VIEW);
        assert_eq!(f.vm.unmap_view_of_section(ME, addr), NtStatus::SUCCESS);
        assert_eq!(f.server.view_count(), 0);
        assert_eq!(f.vm.unmap_view_of_section(ME, addr), NtStatus::NOT_MAPPED_VIEW);
    }

    #[test]
    fn test_map_view_argument_checks() {
        let f = fixture();
        let fd = f.sim.create_file(&[0u8; 0x20000]);
        let section = Section::file(fd, 0x20000, PageProtection::READONLY);
        let map = |addr: usize, zero_bits: usize, offset: u64, prot: PageProtection| {
            let (mut a, mut s) = (addr, 0);
            f.vm.map_view_of_section(&section, ME, &mut a, zero_bits, offset, &mut s, AllocationType::empty(), prot)
        };
        assert_eq!(map(0, 25, 0, PageProtection::READONLY), NtStatus::INVALID_PARAMETER_4);
        assert_eq!(map(0x1_0000_0000, 1, 0, PageProtection::READONLY), NtStatus::INVALID_PARAMETER_4);
        assert_eq!(map(0x1_0000_0000, 0xffff_ffff, 0, PageProtection::READONLY), NtStatus::INVALID_PARAMETER_4);
        assert_eq!(map(0, 0, 0x1000, PageProtection::READONLY), NtStatus::MAPPED_ALIGNMENT);
        assert_eq!(map(0x1000_1000, 0, 0, PageProtection::READONLY), NtStatus::MAPPED_ALIGNMENT);
        assert_eq!(map(0, 0, 0, RW), NtStatus::ACCESS_DENIED);
        assert_eq!(map(0, 0, 0, PageProtection::EXECUTE_READ), NtStatus::ACCESS_DENIED);
        assert_eq!(map(0, 0, 0, PageProtection::READONLY), NtStatus::SUCCESS);
    }

    #[test]
    fn test_same_mapped_files() {
        let f = fixture();
        let fd = f.sim.create_file(&[0u8; 0x10000]);
        let other = f.sim.create_file(&[0u8; 0x10000]);
        let map = |fd| {
            let section = Section::file(fd, 0x10000, RW);
            let (mut a, mut s) = (0, 0);
            f.vm.map_view_of_section(&section, ME, &mut a, 0, 0, &mut s, AllocationType::empty(), RW);
            a
        };
        let (a, b, c) = (map(fd), map(fd), map(other));
        assert_eq!(f.vm.are_mapped_files_the_same(a, a + 0x10), NtStatus::SUCCESS);
        assert_eq!(f.vm.are_mapped_files_the_same(a, b), NtStatus::SUCCESS);
        assert_eq!(f.vm.are_mapped_files_the_same(a, c), NtStatus::NOT_SAME_DEVICE);
        assert_eq!(f.vm.are_mapped_files_the_same(a, 0x10), NtStatus::INVALID_ADDRESS);
        let (_, private, _) = alloc(&f.vm, 0, 0x1000, RESERVE, RW);
        assert_eq!(f.vm.are_mapped_files_the_same(a, private), NtStatus::CONFLICTING_ADDRESSES);
    }

    #[test]
    fn test_map_shared_memory() {
        let f = fixture();
        let fd = f.sim.create_file(&[9u8; 0x3000]);
        let (mut addr, mut size) = (0, 0x2800);
        assert_eq!(f.vm.map_shared_memory(fd, &mut addr, &mut size, RW), NtStatus::SUCCESS);
        assert_eq!(size, 0x3000);
        assert!(f.sim.is_shared(addr));
        assert_eq!(query(&f.vm, addr).state, MemState::Commit);

        let (mut addr, mut size) = (0, usize::MAX);
        assert_eq!(
            f.vm.map_shared_memory(fd, &mut addr, &mut size, RW),
            NtStatus::INVALID_PARAMETER
        );
    }

    #[test]
    fn test_cross_process_refused_by_local_server() {
        let f = fixture();
        let other = ProcessHandle::Other(42);
        let (mut a, mut s) = (0, 0x1000);
        assert_eq!(
            f.vm.allocate_virtual_memory(other, &mut a, 0, &mut s, RESERVE, RW),
            NtStatus::NOT_SUPPORTED
        );
        assert_eq!(f.vm.unmap_view_of_section(other, 0x1000_0000), NtStatus::NOT_SUPPORTED);
        let mut buf = [0u8; 4];
        let mut n = 1;
        assert_eq!(f.vm.read_process_memory(other, 0x1000, &mut buf, &mut n), NtStatus::NOT_SUPPORTED);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_execute_remote_runs_locally() {
        let f = fixture();
        let result = f.vm.execute_remote(RemoteCall::Alloc {
            addr: 0,
            size: 0x1000,
            zero_bits: 0,
            op_type: RESERVE | COMMIT,
            prot: RW,
        });
        let RemoteResult::Alloc { status, addr, size } = result else {
            panic!("unexpected result {:?}", result);
        };
        assert_eq!(status, NtStatus::SUCCESS);
        assert_eq!(size, 0x1000);
        let RemoteResult::Query { info, .. } = f.vm.execute_remote(RemoteCall::Query { addr }) else {
            panic!("query result");
        };
        assert_eq!(info.state, MemState::Commit);
        let freed = f.vm.execute_remote(RemoteCall::Free {
            addr,
            size: 0,
            op_type: FreeType::RELEASE,
        });
        assert_eq!(freed.status(), NtStatus::SUCCESS);
    }

    #[test]
    fn test_uninterrupted_access() {
        let f = fixture();
        let (_, base, _) = alloc(&f.vm, 0, 0x3000, RESERVE | COMMIT, RW);
        let (mut a, mut s) = (base + 0x2000, 0x1000);
        let mut old = PageProtection::empty();
        f.vm.protect_virtual_memory(ME, &mut a, &mut s, PageProtection::NOACCESS, &mut old);

        assert_eq!(f.vm.uninterrupted_write_memory(base + 0xffe, &[1, 2, 3, 4]), NtStatus::SUCCESS);
        let mut buf = [0u8; 0x2000];
        let n = f.vm.uninterrupted_read_memory(base + 0x1000, &mut buf);
        assert_eq!(n, 0x1000);
        assert_eq!(&buf[..2], &[3, 4]);

        let mut n = 0;
        assert_eq!(
            f.vm.read_process_memory(ME, base + 0x1000, &mut buf, &mut n),
            NtStatus::PARTIAL_COPY
        );
        assert_eq!(n, 0x1000);
        assert_eq!(
            f.vm.uninterrupted_write_memory(base + 0x2000, &[1]),
            NtStatus::INVALID_USER_BUFFER
        );
        let mut written = 0;
        assert_eq!(
            f.vm.write_process_memory(ME, base, &[5; 8], &mut written),
            NtStatus::SUCCESS
        );
        assert_eq!(written, 8);
    }

    #[test]
    fn test_locked_read_into_watched_buffer() {
        let f = fixture();
        let fd = f.sim.create_file(b"payload");
        let ty = RESERVE | COMMIT | AllocationType::WRITE_WATCH;
        let (_, base, _) = alloc(&f.vm, 0, 0x2000, ty, RW);
        let mut read = 0;
        assert_eq!(f.vm.locked_read(fd, 0, base, 7, &mut read), NtStatus::SUCCESS);
        assert_eq!(read, 7);
        let mut buf = [0u8; 7];
        f.sim.read_memory(base, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
        assert!(!f.vm.page_protection(base).contains(VProt::WRITEWATCH));
        assert!(f.vm.page_protection(base + PAGE).contains(VProt::WRITEWATCH));
    }

    #[test]
    fn test_code_address_and_force_exec() {
        let f = fixture();
        let (_, base, _) = alloc(&f.vm, 0, 0x1000, RESERVE | COMMIT, RW);
        assert!(f.vm.is_valid_code_address(base, 0x1000));
        assert!(!f.vm.is_valid_code_address(base + 0x1000, 1));

        f.vm.set_force_exec(true);
        assert_eq!(f.sim.prot_at(base), Some(UnixProt::RWX));
        f.vm.set_force_exec(false);
        assert_eq!(f.sim.prot_at(base), Some(UnixProt::RW));
    }

    #[test]
    fn test_system_info_and_large_address_space() {
        let f = fixture_with(VmConfig::narrow(PAGE), ReservedAreaList::new());
        let info = f.vm.system_info();
        assert_eq!(info.page_size, PAGE);
        assert_eq!(info.allocation_granularity, GRANULARITY);
        assert_eq!(info.lowest_user_address, 0x10000);
        assert_eq!(info.highest_user_address, 0x7ffe_ffff);

        f.vm.set_large_address_space(false);
        assert_eq!(f.vm.system_info().highest_user_address, 0x7ffe_ffff);
        f.vm.set_large_address_space(true);
        assert_eq!(f.vm.system_info().highest_user_address, 0xbfff_ffff);
    }

    #[test]
    fn test_running_stack_release_is_deferred() {
        let f = fixture();
        let mut stack = ThreadStack::default();
        assert_eq!(f.vm.alloc_thread_stack(0, 0, 0, &mut stack), NtStatus::SUCCESS);
        f.vm.set_running_stack(Some(stack));
        assert_eq!(release(&f.vm, stack.deallocation), NtStatus::SUCCESS);
        assert_eq!(query(&f.vm, stack.deallocation).allocation_base, stack.deallocation);
        assert_eq!(release(&f.vm, stack.deallocation), NtStatus::INVALID_PARAMETER);
    }
}
