//! Free-Range Index
//!
//! Sorted, disjoint `[base, end)` intervals of address space not covered
//! by any view, at allocation-granularity boundaries. Creating a view
//! carves its rounded extent out of the index; destroying one merges the
//! extent back in.
//!
//! The index starts as the single interval `[0, usize::MAX)`.

use log::{error, warn};

/// One free interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRange {
    pub base: usize,
    pub end: usize,
}

impl FreeRange {
    pub fn size(&self) -> usize {
        self.end - self.base
    }
}

/// Sorted complement of all views
#[derive(Debug, Clone)]
pub struct FreeRanges {
    ranges: Vec<FreeRange>,
    granularity_mask: usize,
    /// Length past which fragmentation is reported
    capacity: usize,
}

impl FreeRanges {
    pub fn new(granularity_mask: usize, capacity: usize) -> Self {
        let mut ranges = Vec::with_capacity(capacity.min(256));
        ranges.push(FreeRange {
            base: 0,
            end: usize::MAX,
        });
        Self {
            ranges,
            granularity_mask,
            capacity,
        }
    }

    pub fn ranges(&self) -> &[FreeRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Index of the first range whose end is at or above `addr`
    pub fn lower_bound(&self, addr: usize) -> usize {
        self.ranges.partition_point(|r| r.end < addr)
    }

    /// Granularity-rounded extent of `[base, base+size)`
    pub fn rounded(&self, base: usize, size: usize) -> (usize, usize) {
        let mask = self.granularity_mask;
        let end = base.saturating_add(size).saturating_add(mask) & !mask;
        (base & !mask, end)
    }

    fn check_capacity(&self) {
        if self.ranges.len() > self.capacity {
            error!("Free range sequence is full, trouble ahead!");
        }
    }

    /// Carve a newly created view out of the index
    pub fn remove_range(&mut self, base: usize, size: usize) {
        let (view_base, view_end) = self.rounded(base, size);
        let idx = self.lower_bound(view_base);
        let Some(&range) = self.ranges.get(idx) else {
            error!("no free range at or above {:#x}", view_base);
            return;
        };
        let next_base = self.ranges.get(idx + 1).map_or(usize::MAX, |r| r.base);

        // Thread stacks shrink a view and map another on its tail, so the
        // rounded extent may already be out of the index.
        if (range.end > view_base && range.base >= view_end)
            || (range.end == view_base && next_base >= view_end)
        {
            warn!("range {:#x} - {:#x} is already mapped", view_base, view_end);
            return;
        }

        if range.base > view_base || range.end < view_end {
            error!("range {:#x} - {:#x} is already partially mapped", view_base, view_end);
            return;
        }

        if range.base < view_base && range.end > view_end {
            // Split in two.
            self.ranges[idx].end = view_base;
            self.ranges.insert(
                idx + 1,
                FreeRange {
                    base: view_end,
                    end: range.end,
                },
            );
            self.check_capacity();
            return;
        }

        let slot = &mut self.ranges[idx];
        if slot.base < view_base {
            slot.end = view_base;
        } else {
            slot.base = view_end;
        }
        if slot.base >= slot.end {
            self.ranges.remove(idx);
        }
    }

    /// Return a destroyed view's extent to the index
    ///
    /// `prev` and `next` are the neighbouring views as `(base, size)`;
    /// any part of the extent their rounded extents still cover stays out.
    pub fn insert_range(
        &mut self,
        base: usize,
        size: usize,
        prev: Option<(usize, usize)>,
        next: Option<(usize, usize)>,
    ) {
        let (mut view_base, mut view_end) = self.rounded(base, size);

        if let Some((prev_base, prev_size)) = prev {
            let (_, prev_end) = self.rounded(prev_base, prev_size);
            if prev_end > view_base {
                warn!("range {:#x} - {:#x} is still mapped", view_base, prev_end.min(view_end));
                view_base = prev_end;
            }
        }
        if let Some((next_base, next_size)) = next {
            let (next_base, _) = self.rounded(next_base, next_size);
            if next_base < view_end {
                warn!("range {:#x} - {:#x} is still mapped", next_base.max(view_base), view_end);
                view_end = next_base;
            }
        }
        if view_base >= view_end {
            return;
        }

        let idx = self.lower_bound(view_base);
        let range = self.ranges.get(idx).copied();

        if let Some(range) = range {
            if range.base <= view_base && range.end >= view_end {
                warn!("range {:#x} - {:#x} is already unmapped", view_base, view_end);
                return;
            }
            if range.base < view_end && range.end > view_base {
                error!("range {:#x} - {:#x} is already partially unmapped", view_base, view_end);
                return;
            }
        }

        let next_base = self.ranges.get(idx + 1).map(|r| r.base);
        match range {
            Some(range) if range.end == view_base && next_base == Some(view_end) => {
                // Merge with the following range.
                self.ranges[idx].end = self.ranges[idx + 1].end;
                self.ranges.remove(idx + 1);
            }
            Some(range) if range.end == view_base => self.ranges[idx].end = view_end,
            Some(range) if range.base == view_end => self.ranges[idx].base = view_base,
            _ => {
                self.ranges.insert(
                    idx,
                    FreeRange {
                        base: view_base,
                        end: view_end,
                    },
                );
                self.check_capacity();
            }
        }
    }

    /// Whether `[base, base+size)` lies inside one free range
    pub fn is_free(&self, base: usize, size: usize) -> bool {
        let end = base.saturating_add(size);
        self.ranges
            .get(self.lower_bound(base))
            .is_some_and(|r| r.base <= base && r.end >= end && r.end != base)
    }
}
