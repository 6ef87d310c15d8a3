//! Placement - Address Selection and Host Mapping
//!
//! Turns a mapping request into a host mapping plus a view.
//!
//! ## Dynamic Placement
//!
//! - Large address spaces (or a zero-bits ceiling): walk the free-range
//!   index, top-down or bottom-up, probing candidates with no-replace
//!   mappings and stepping around foreign mappings with a doubling
//!   stride. Reserved areas met on the way are searched from the inside.
//! - Otherwise: look for room inside the reserved areas first, then let
//!   the host choose and trim the result to allocation granularity.
//!
//! ## Fixed Placement
//!
//! A fixed range is classified against the reserved areas: inside one it
//! replaces the reservation, outside it must not collide with anything,
//! and a straddling range is mapped in two halves.

use std::os::fd::RawFd;

use log::{error, trace, warn};

use super::pmap::{MemoryBackend, Placement, Share, UnixProt};
use super::{is_beyond_limit, VProt, ViewId, ViewKind, VmState};
use crate::config::GRANULARITY_MASK;
use crate::error::{OsError, VmError, VmResult};
use crate::reserved::{area_boundary, ReservedAreas, ReservedState};

/// Address ceiling for a 64-bit zero-bits count
pub(crate) fn zero_bits_mask(zero_bits: u32) -> usize {
    (u64::MAX >> zero_bits.min(63)) as usize
}

fn round_down(addr: usize) -> usize {
    addr & !GRANULARITY_MASK
}

fn round_up(addr: usize) -> Option<usize> {
    Some(addr.checked_add(GRANULARITY_MASK)? & !GRANULARITY_MASK)
}

// ============================================================================
// Free Area Search
// ============================================================================

/// State of one dynamic placement over the free-range index
struct FreeAreaSearch<'a> {
    backend: &'a dyn MemoryBackend,
    reserved: &'a dyn ReservedAreas,
    size: usize,
    /// Probe stride; negative when searching downwards
    step: isize,
    prot: UnixProt,
    top_down: bool,
    map_area_start: usize,
    map_area_end: usize,
    result: Option<usize>,
    /// First probe that hit a foreign mapping
    already_mapped: Option<(usize, usize)>,
}

impl FreeAreaSearch<'_> {
    /// Probe `start`, `start+step`, `start+3*step`, ... inside `[base, end)`
    fn try_map_free_area(&mut self, base: usize, end: usize, mut step: isize, mut start: usize) -> Option<usize> {
        let size = self.size;
        while start != 0 && base <= start && start.checked_add(size).is_some_and(|e| e <= end) {
            match self.backend.map_anon(Placement::NoReplace(start), size, self.prot) {
                Ok(ptr) if ptr == start => return Some(ptr),
                Ok(ptr) => {
                    // Host ignored the placement; give it back.
                    let _ = self.backend.unmap(ptr, size);
                }
                Err(OsError::AlreadyMapped) => {}
                Err(err) => {
                    error!("probe at {:#x}, size {:#x} failed: {}", start, size, err);
                    return None;
                }
            }
            let stride = step.unsigned_abs();
            if self.already_mapped.is_none() && step != 0 {
                self.already_mapped = Some((start, stride.min(end - start)));
            }
            if step == 0 || (step > 0 && end - start < stride) || (step < 0 && start - base < stride) {
                break;
            }
            start = if step > 0 { start + stride } else { start - stride };
            step = step.saturating_mul(2);
        }
        None
    }

    /// Reserved-area visitor: try the gap before the area, then the area
    fn in_reserved_or_between(&mut self, start: usize, size: usize) -> bool {
        let end = start + size;
        let want = self.size;

        if self.top_down {
            if self.map_area_start >= end {
                return true;
            }
            if self.map_area_end <= start {
                return false;
            }
            let intersect_start = start.max(self.map_area_start);
            let intersect_end = end.min(self.map_area_end);
            if self.map_area_end - intersect_end >= want {
                let alloc_start = round_down(self.map_area_end - want);
                if let Some(ptr) = self.try_map_free_area(intersect_end, alloc_start + want, self.step, alloc_start) {
                    self.result = Some(ptr);
                    return true;
                }
            }
            if intersect_end - intersect_start >= want {
                let alloc_start = round_down(intersect_end - want);
                if alloc_start >= intersect_start {
                    self.map_in_reserved(alloc_start);
                    return true;
                }
            }
            self.map_area_end = intersect_start;
            self.map_area_end - self.map_area_start < want
        } else {
            if self.map_area_end <= start {
                return true;
            }
            if self.map_area_start >= end {
                return false;
            }
            let intersect_start = start.max(self.map_area_start);
            let intersect_end = end.min(self.map_area_end);
            if intersect_start - self.map_area_start >= want {
                if let Some(alloc_start) = round_up(self.map_area_start) {
                    if let Some(ptr) = self.try_map_free_area(self.map_area_start, intersect_start, self.step, alloc_start) {
                        self.result = Some(ptr);
                        return true;
                    }
                }
            }
            if intersect_end - intersect_start >= want {
                if let Some(alloc_start) = round_up(intersect_start) {
                    if alloc_start.checked_add(want).is_some_and(|e| e <= intersect_end) {
                        self.map_in_reserved(alloc_start);
                        return true;
                    }
                }
            }
            self.map_area_start = intersect_end;
            self.map_area_end - self.map_area_start < want
        }
    }

    fn map_in_reserved(&mut self, alloc_start: usize) {
        match self.backend.map_anon(Placement::Fixed(alloc_start), self.size, self.prot) {
            Ok(ptr) if ptr == alloc_start => self.result = Some(ptr),
            _ => error!(
                "could not map in reserved area, alloc_start {:#x}, size {:#x}",
                alloc_start, self.size
            ),
        }
    }

    /// Search `[base, end)`, reserved areas first
    fn in_range(&mut self, base: usize, end: usize) -> Option<usize> {
        if base >= end {
            return None;
        }
        let size = self.size;
        self.map_area_start = base;
        self.map_area_end = end;

        if self.top_down {
            let start = round_down(end.checked_sub(size)?);
            if start >= end || start < base {
                return None;
            }
        } else {
            let start = round_up(base)?;
            if start == 0 || start >= end || end - start < size {
                return None;
            }
        }

        self.result = None;
        let reserved = self.reserved;
        reserved.enumerate(self.top_down, &mut |start, len| self.in_reserved_or_between(start, len));
        if self.result.is_some() {
            return self.result;
        }

        if self.top_down {
            let start = round_down(self.map_area_end.checked_sub(size)?);
            if start >= self.map_area_end || start < self.map_area_start {
                return None;
            }
            self.try_map_free_area(self.map_area_start, start + size, self.step, start)
        } else {
            let start = round_up(self.map_area_start)?;
            if start == 0 || start >= self.map_area_end || self.map_area_end - start < size {
                return None;
            }
            self.try_map_free_area(start, self.map_area_end, self.step, start)
        }
    }
}

// ============================================================================
// Placement on the VM State
// ============================================================================

impl VmState {
    /// First granularity-aligned free slot of `size` bytes in `[base, end)`
    pub(crate) fn find_reserved_free_area(
        &self,
        base: usize,
        end: usize,
        size: usize,
        top_down: bool,
    ) -> Option<usize> {
        let ranges = self.free.ranges();
        let base = round_up(base)?;
        let end = round_down(end.checked_sub(size)?) + size;

        let fits = |start: usize, range: &super::vm_ranges::FreeRange| {
            start >= range.base && start < range.end && range.end - start >= size
        };
        let out_of_bounds = |start: usize| start >= end || start < base || end.wrapping_sub(start) < size;

        if top_down {
            let mut start = end.wrapping_sub(size);
            let mut idx = self.free.lower_bound(start);
            let mut range = *ranges.get(idx)?;
            if range.end - start < size {
                start = round_down(range.end.wrapping_sub(size));
            }
            loop {
                if out_of_bounds(start) {
                    return None;
                }
                if fits(start, &range) {
                    return Some(start);
                }
                idx = idx.checked_sub(1)?;
                range = ranges[idx];
                start = round_down(range.end.wrapping_sub(size));
            }
        } else {
            let mut start = base;
            let mut idx = self.free.lower_bound(start);
            let mut range = *ranges.get(idx)?;
            if start < range.base {
                start = round_up(range.base)?;
            }
            loop {
                if out_of_bounds(start) {
                    return None;
                }
                if fits(start, &range) {
                    return Some(start);
                }
                idx += 1;
                range = *ranges.get(idx)?;
                start = round_up(range.base)?;
            }
        }
    }

    /// Free slot inside a reserved area, honoring the preload reserve
    fn alloc_reserved_area(&self, size: usize, top_down: bool, limit: usize) -> Option<usize> {
        let preload = self.config.preload_reserve;
        let mut result = None;
        self.reserved.enumerate(top_down, &mut |area_start, area_size| {
            let mut start = area_start.max(self.address_space_start);
            let mut end = area_start + area_size;
            if is_beyond_limit(start, end.saturating_sub(start), limit) {
                end = limit;
            }
            if start >= end {
                return false;
            }
            if let Some((reserve_start, reserve_end)) = preload {
                if reserve_end >= start {
                    if reserve_end >= end {
                        if reserve_start <= start {
                            return false;
                        }
                        if reserve_start < end {
                            end = reserve_start;
                        }
                    } else if reserve_start <= start {
                        start = reserve_end;
                    } else {
                        result = self.find_reserved_free_area(start, reserve_start, size, top_down);
                        if result.is_some() {
                            return true;
                        }
                        start = reserve_end;
                    }
                }
            }
            result = self.find_reserved_free_area(start, end, size, top_down);
            result.is_some()
        });
        result
    }

    /// Walk the free-range index for `size` bytes below `limit`
    fn alloc_free_area(&mut self, limit: usize, size: usize, top_down: bool, prot: UnixProt) -> Option<usize> {
        let granularity = GRANULARITY_MASK + 1;
        let reserve = self.config.rounded_preload_reserve();
        let limit = round_down(limit);
        trace!("limit {:#x}, size {:#x}, top_down {}", limit, size, top_down);

        let mut search = FreeAreaSearch {
            backend: &*self.backend,
            reserved: &*self.reserved,
            size,
            step: if top_down {
                -(granularity as isize)
            } else {
                granularity as isize
            },
            prot,
            top_down,
            map_area_start: 0,
            map_area_end: 0,
            result: None,
            already_mapped: None,
        };

        let ranges = self.free.ranges();
        let mut candidates: Box<dyn Iterator<Item = _>> = if top_down {
            Box::new(ranges.iter().rev())
        } else {
            Box::new(ranges.iter())
        };

        let mut result = None;
        for range in &mut candidates {
            let mut base = range.base.max(self.address_space_start);
            let mut end = range.end.min(limit);
            if base >= end || end - base < size {
                continue;
            }
            if let Some((reserve_start, reserve_end)) = reserve {
                if reserve_end >= base {
                    if reserve_end >= end {
                        if reserve_start <= base {
                            continue;
                        }
                        if reserve_start < end {
                            end = reserve_start;
                        }
                    } else if reserve_start <= base {
                        base = reserve_end;
                    } else if top_down {
                        // Split by the preload reserve; upper part first.
                        result = search.in_range(reserve_end, end);
                        if result.is_some() {
                            break;
                        }
                        end = reserve_start;
                    } else {
                        result = search.in_range(base, reserve_start);
                        if result.is_some() {
                            break;
                        }
                        base = reserve_end;
                    }
                }
            }
            result = search.in_range(base, end);
            if result.is_some() {
                break;
            }
        }
        let already_mapped = search.already_mapped;
        drop(candidates);
        self.last_already_mapped = already_mapped;
        result
    }

    /// Map `[base, base+size)` exactly, respecting reserved areas
    pub(crate) fn map_fixed_area(&mut self, base: usize, size: usize, vprot: VProt) -> VmResult<()> {
        let unix = vprot.unix();
        match self.reserved.is_in_reserved(base, size) {
            ReservedState::Straddle => {
                let Some(boundary) = area_boundary(&*self.reserved, base, size) else {
                    error!("no reserved boundary in {:#x}-{:#x}", base, base + size);
                    return Err(VmError::ConflictingAddresses);
                };
                let lower = boundary - base;
                self.map_fixed_area(base, lower, vprot)?;
                if let Err(err) = self.map_fixed_area(boundary, size - lower, vprot) {
                    self.unmap_area(base, lower);
                    return Err(err);
                }
            }
            ReservedState::Outside => {
                let ptr = match self.backend.map_anon(Placement::NoReplace(base), size, unix) {
                    Ok(ptr) => ptr,
                    Err(OsError::AlreadyMapped) => return Err(VmError::ConflictingAddresses),
                    Err(OsError::OutOfMemory) => return Err(VmError::NoMemory),
                    Err(_) => return Err(VmError::InvalidParameter),
                };
                if ptr != base {
                    // Placed elsewhere: something already lives at `base`.
                    if is_beyond_limit(ptr, size, self.user_space_limit) {
                        self.add_reserved_area(ptr, size);
                    } else {
                        let _ = self.backend.unmap(ptr, size);
                    }
                    return Err(VmError::ConflictingAddresses);
                }
            }
            ReservedState::Inside => {
                if self.views.find_range(base, size).is_some() {
                    return Err(VmError::ConflictingAddresses);
                }
                match self.backend.map_anon(Placement::Fixed(base), size, unix) {
                    Ok(ptr) if ptr == base => {}
                    _ => return Err(VmError::InvalidParameter),
                }
            }
        }
        if is_beyond_limit(base, size, self.working_set_limit) {
            self.working_set_limit = self.address_space_limit;
        }
        Ok(())
    }

    /// Give a range back: to its reservation, or to the host
    pub(crate) fn unmap_area(&mut self, addr: usize, size: usize) {
        match self.reserved.is_in_reserved(addr, size) {
            ReservedState::Straddle => match area_boundary(&*self.reserved, addr, size) {
                Some(boundary) => {
                    let lower = boundary - addr;
                    self.unmap_area(addr, lower);
                    self.unmap_area(boundary, size - lower);
                }
                None => error!("no reserved boundary in {:#x}-{:#x}", addr, addr + size),
            },
            ReservedState::Inside => {
                let _ = self.backend.reserve_fixed(addr, size);
            }
            ReservedState::Outside => {
                if is_beyond_limit(addr, size, self.user_space_limit) {
                    self.add_reserved_area(addr, size);
                } else {
                    let _ = self.backend.unmap(addr, size);
                }
            }
        }
    }

    /// Turn a range above the user limit into a reservation
    pub(crate) fn add_reserved_area(&mut self, addr: usize, size: usize) {
        trace!("adding {:#x}-{:#x}", addr, addr + size);
        let (mut addr, mut size) = (addr, size);
        if addr < self.user_space_limit {
            let below = self.user_space_limit - addr;
            let _ = self.backend.unmap(addr, below);
            size -= below;
            addr = self.user_space_limit;
        }
        let _ = self.backend.reserve_fixed(addr, size);
        self.reserved.add(addr, size);
    }

    /// Release the unaligned head and the unwanted tail of a host placement
    fn unmap_extra_space(&self, ptr: usize, total: usize, wanted: usize) -> usize {
        let (mut ptr, mut total) = (ptr, total);
        if ptr & GRANULARITY_MASK != 0 {
            let extra = GRANULARITY_MASK + 1 - (ptr & GRANULARITY_MASK);
            let _ = self.backend.unmap(ptr, extra);
            ptr += extra;
            total -= extra;
        }
        if total > wanted {
            let _ = self.backend.unmap(ptr + wanted, total - wanted);
        }
        ptr
    }

    /// Map memory and create a view over it
    ///
    /// # Arguments
    /// * `base` - Fixed address, or `None` to choose one
    /// * `size` - Page-aligned length
    /// * `top_down` - Prefer high addresses when choosing
    /// * `vprot` - Protection byte for every page
    /// * `kind` - What backs the view
    /// * `zero_bits` - Leading address bits that must be zero
    pub(crate) fn map_view(
        &mut self,
        base: Option<usize>,
        size: usize,
        top_down: bool,
        vprot: VProt,
        kind: ViewKind,
        zero_bits: u32,
    ) -> VmResult<ViewId> {
        let unix = vprot.unix();
        let ptr = match base {
            Some(base) => {
                if is_beyond_limit(base, size, self.address_space_limit) {
                    return Err(VmError::WorkingSetLimitRange);
                }
                self.map_fixed_area(base, size, vprot)?;
                base
            }
            None => {
                let limit = zero_bits_mask(zero_bits) & self.user_space_limit;
                if self.config.large_address_space || zero_bits != 0 {
                    self.last_already_mapped = None;
                    let ptr = self
                        .alloc_free_area(limit, size, top_down, unix)
                        .ok_or(VmError::NoMemory)?;
                    trace!("got mem in free area {:#x}-{:#x}", ptr, ptr + size);
                    if let Some((addr, len)) = self.last_already_mapped.take() {
                        let (start, end) = self.free.rounded(addr, len);
                        if ptr > end || ptr + size < start {
                            trace!("excluding foreign mapping {:#x}-{:#x}", start, end);
                            self.free.remove_range(start, end - start);
                        }
                    }
                    ptr
                } else if let Some(ptr) = self.alloc_reserved_area(size, top_down, limit) {
                    trace!("got mem in reserved area {:#x}-{:#x}", ptr, ptr + size);
                    match self.backend.map_anon(Placement::Fixed(ptr), size, unix) {
                        Ok(got) if got == ptr => ptr,
                        _ => return Err(VmError::InvalidParameter),
                    }
                } else {
                    let view_size = size + GRANULARITY_MASK + 1;
                    let ptr = loop {
                        let ptr = match self.backend.map_anon(Placement::Anywhere, view_size, unix) {
                            Ok(ptr) => ptr,
                            Err(OsError::OutOfMemory) => return Err(VmError::NoMemory),
                            Err(_) => return Err(VmError::InvalidParameter),
                        };
                        trace!("got mem with anon mmap {:#x}-{:#x}", ptr, ptr + view_size);
                        if !is_beyond_limit(ptr, view_size, limit) {
                            break ptr;
                        }
                        self.add_reserved_area(ptr, view_size);
                    };
                    self.unmap_extra_space(ptr, view_size, size)
                }
            }
        };

        match self.create_view(ptr, size, vprot, kind) {
            Ok(id) => Ok(id),
            Err(err) => {
                self.unmap_area(ptr, size);
                Err(err)
            }
        }
    }

    /// Map part of a file into an existing view
    ///
    /// Falls back to reading the file into anonymous memory when the
    /// host refuses a private file mapping (unaligned offset, `noexec`
    /// mount, device without mmap). `removable` forces that fallback for
    /// private mappings of files on removable media.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn map_file_into_view(
        &mut self,
        id: ViewId,
        fd: RawFd,
        start: usize,
        size: usize,
        offset: u64,
        vprot: VProt,
        removable: bool,
    ) -> VmResult<()> {
        let view = self.view(id)?;
        let addr = view.base + start;
        let mut prot = (vprot | VProt::COMMITTED).unix();
        if self.force_exec && vprot.contains(VProt::READ) {
            prot |= UnixProt::EXEC;
        }
        let share = if vprot.contains(VProt::WRITECOPY) {
            Share::Private
        } else {
            Share::Shared
        };
        trace!(
            "fd {} offset {:#x} -> {:#x}-{:#x} {}",
            fd,
            offset,
            addr,
            addr + size,
            vprot.display()
        );

        if !removable || share == Share::Shared {
            match self.backend.map_file(addr, size, prot, share, fd, offset) {
                Ok(()) => {
                    self.pages.set_range(addr, size, vprot);
                    return Ok(());
                }
                Err(OsError::InvalidArgument) if share == Share::Shared => {
                    return Err(VmError::InvalidParameter);
                }
                // Unaligned private offset; read it in instead.
                Err(OsError::InvalidArgument) => {}
                Err(OsError::NoDevice) if vprot.contains(VProt::WRITE) => {
                    error!("shared writable mmap not supported, broken filesystem?");
                    return Err(VmError::NotSupported);
                }
                Err(OsError::NoDevice) => {}
                Err(OsError::PermissionDenied) if share == Share::Shared => {
                    if prot.contains(UnixProt::EXEC) {
                        error!("failed to set exec permission on file map, noexec filesystem?");
                    }
                    return Err(VmError::AccessDenied);
                }
                Err(OsError::PermissionDenied) => {
                    if prot.contains(UnixProt::EXEC) {
                        warn!("failed to set exec permission on file map, noexec filesystem?");
                    }
                }
                Err(err) => {
                    error!("mmap error {} for fd {} at {:#x}", err, fd, addr);
                    return Err(VmError::Os(err));
                }
            }
        }

        warn!("reading fd {} into {:#x}-{:#x} instead of mapping", fd, addr, addr + size);
        match self.backend.map_anon(Placement::Fixed(addr), size, UnixProt::RW) {
            Ok(ptr) if ptr == addr => {}
            Ok(_) => return Err(VmError::NoMemory),
            Err(err) => return Err(err.into()),
        }
        self.backend.read_file_to(fd, offset, addr, size)?;
        if prot != UnixProt::RW {
            let _ = self.backend.protect(addr, size, prot);
        }
        self.pages.set_range(addr, size, vprot);
        Ok(())
    }

    /// Replace pages with fresh inaccessible memory and mark them uncommitted
    pub(crate) fn decommit_pages(&mut self, id: ViewId, start: usize, size: usize) -> VmResult<()> {
        let view = self.view(id)?;
        let size = if size == 0 { view.size } else { size };
        let addr = view.base + start;
        match self.backend.map_anon(Placement::Fixed(addr), size, UnixProt::NONE) {
            Ok(ptr) if ptr == addr => {
                self.pages.set_bits_range(addr, size, VProt::empty(), VProt::COMMITTED);
                Ok(())
            }
            _ => Err(VmError::NoMemory),
        }
    }
}
