//! Externally reserved address ranges
//!
//! Ranges owned by a loader or preloader outside the manager's control.
//! Dynamic placement never lands on them unless it deliberately looks
//! for space inside one; fixed placement may enter them.

use log::trace;

/// Where a range lies relative to the reserved areas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedState {
    /// Touches no reserved area
    Outside,
    /// Entirely inside one reserved area
    Inside,
    /// Partly reserved
    Straddle,
}

/// Reservation enumerator consumed by the placement code
pub trait ReservedAreas: Send {
    /// Visit every area in address order (descending if `top_down`);
    /// stops at, and returns, the first `true` from the callback
    fn enumerate(&self, top_down: bool, f: &mut dyn FnMut(usize, usize) -> bool) -> bool;

    fn is_in_reserved(&self, addr: usize, size: usize) -> ReservedState;

    fn add(&mut self, addr: usize, size: usize);

    fn remove(&mut self, addr: usize, size: usize);

    fn is_empty(&self) -> bool {
        !self.enumerate(false, &mut |_, _| true)
    }
}

/// First reservation edge strictly inside `[base, base+size)`
pub fn area_boundary(areas: &dyn ReservedAreas, base: usize, size: usize) -> Option<usize> {
    let end = base + size;
    let mut boundary = None;
    areas.enumerate(false, &mut |start, len| {
        let area_end = start + len;
        if base >= area_end {
            return false;
        }
        if start >= end {
            return true;
        }
        if base >= start {
            if end > area_end {
                boundary = Some(area_end);
                return true;
            }
            return false;
        }
        boundary = Some(start);
        true
    });
    boundary
}

// ============================================================================
// Reserved Area List
// ============================================================================

/// Sorted, coalesced list of reserved areas
#[derive(Debug, Clone, Default)]
pub struct ReservedAreaList {
    /// (start, end) pairs, disjoint and non-adjacent
    areas: Vec<(usize, usize)>,
}

impl ReservedAreaList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let mut list = Self::new();
        for (start, size) in ranges {
            list.add(start, size);
        }
        list
    }

    pub fn ranges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.areas.iter().map(|&(start, end)| (start, end - start))
    }
}

impl ReservedAreas for ReservedAreaList {
    fn enumerate(&self, top_down: bool, f: &mut dyn FnMut(usize, usize) -> bool) -> bool {
        if top_down {
            self.areas.iter().rev().any(|&(start, end)| f(start, end - start))
        } else {
            self.areas.iter().any(|&(start, end)| f(start, end - start))
        }
    }

    fn is_in_reserved(&self, addr: usize, size: usize) -> ReservedState {
        let end = addr.saturating_add(size);
        for &(start, area_end) in &self.areas {
            if area_end <= addr {
                continue;
            }
            if start >= end {
                break;
            }
            if start <= addr && area_end >= end {
                return ReservedState::Inside;
            }
            return ReservedState::Straddle;
        }
        ReservedState::Outside
    }

    fn add(&mut self, addr: usize, size: usize) {
        if size == 0 {
            return;
        }
        let mut start = addr;
        let mut end = addr.saturating_add(size);
        trace!("adding reserved area {:#x}-{:#x}", start, end);
        // Absorb every area that overlaps or touches the new one.
        let first = self.areas.partition_point(|&(_, e)| e < start);
        let mut last = first;
        while last < self.areas.len() && self.areas[last].0 <= end {
            start = start.min(self.areas[last].0);
            end = end.max(self.areas[last].1);
            last += 1;
        }
        self.areas.drain(first..last);
        self.areas.insert(first, (start, end));
    }

    fn remove(&mut self, addr: usize, size: usize) {
        if size == 0 {
            return;
        }
        let end = addr.saturating_add(size);
        trace!("removing reserved area {:#x}-{:#x}", addr, end);
        let mut kept = Vec::with_capacity(self.areas.len() + 1);
        for &(start, area_end) in &self.areas {
            if area_end <= addr || start >= end {
                kept.push((start, area_end));
                continue;
            }
            if start < addr {
                kept.push((start, addr));
            }
            if area_end > end {
                kept.push((end, area_end));
            }
        }
        self.areas = kept;
    }
}
