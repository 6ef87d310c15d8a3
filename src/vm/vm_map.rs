//! View Registry
//!
//! Ordered storage of [`View`] records keyed by base address. Records
//! live in an arena of slots; released slots are chained into a free
//! list and reused, and the arena is grown up front so the fault path
//! never has to allocate a record.
//!
//! Only the bookkeeping lives here. Creating or destroying a view also
//! touches the page table, the free-range index and the host mapping;
//! that orchestration is in the parent module.

use std::collections::BTreeMap;

use super::vm_prot::{VProt, ViewKind};

// ============================================================================
// View
// ============================================================================

/// Handle to a view record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewId(pub u32);

/// One contiguous, homogeneously flagged mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View {
    /// Page-aligned start
    pub base: usize,
    /// Multiple of the page size
    pub size: usize,
    /// View-wide protection; pages may diverge
    pub vprot: VProt,
    pub kind: ViewKind,
}

impl View {
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn contains(&self, addr: usize, size: usize) -> bool {
        addr >= self.base && addr - self.base <= self.size && size <= self.size - (addr - self.base)
    }

    pub fn overlaps(&self, addr: usize, size: usize) -> bool {
        self.base < addr.saturating_add(size) && addr < self.end()
    }

    pub fn is_valloc(&self) -> bool {
        self.kind.is_valloc()
    }

    pub fn is_system(&self) -> bool {
        self.kind.contains(ViewKind::SYSTEM)
    }
}

// ============================================================================
// Arena
// ============================================================================

#[derive(Debug, Clone)]
enum Slot {
    Live(View),
    /// Next free slot
    Free(Option<ViewId>),
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub created: u64,
    pub destroyed: u64,
    pub max_live: usize,
    pub grows: u64,
}

/// Arena-backed, base-ordered view registry
#[derive(Debug)]
pub struct ViewMap {
    slots: Vec<Slot>,
    free_head: Option<ViewId>,
    by_base: BTreeMap<usize, ViewId>,
    pub stats: RegistryStats,
}

impl ViewMap {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut map = Self {
            slots: Vec::new(),
            free_head: None,
            by_base: BTreeMap::new(),
            stats: RegistryStats::default(),
        };
        map.free_head = Some(map.grow(capacity.max(1)));
        map
    }

    /// Add `count` free slots to the arena, chained ahead of the old free list
    fn grow(&mut self, count: usize) -> ViewId {
        let first = self.slots.len();
        self.slots.reserve(count);
        for i in first..first + count {
            let next = if i + 1 < first + count {
                Some(ViewId((i + 1) as u32))
            } else {
                self.free_head
            };
            self.slots.push(Slot::Free(next));
        }
        self.stats.grows += 1;
        ViewId(first as u32)
    }

    pub fn len(&self) -> usize {
        self.by_base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_base.is_empty()
    }

    /// Free slots remaining before the arena must grow
    pub fn spare(&self) -> usize {
        self.slots.len() - self.by_base.len()
    }

    pub fn insert(&mut self, view: View) -> ViewId {
        let id = match self.free_head {
            Some(id) => id,
            None => self.grow(self.slots.len()),
        };
        if let Slot::Free(next) = self.slots[id.0 as usize] {
            self.free_head = next;
        }
        self.slots[id.0 as usize] = Slot::Live(view);
        self.by_base.insert(view.base, id);
        self.stats.created += 1;
        self.stats.max_live = self.stats.max_live.max(self.by_base.len());
        id
    }

    pub fn remove(&mut self, id: ViewId) -> Option<View> {
        let view = *self.get(id)?;
        self.by_base.remove(&view.base);
        self.slots[id.0 as usize] = Slot::Free(self.free_head);
        self.free_head = Some(id);
        self.stats.destroyed += 1;
        Some(view)
    }

    pub fn get(&self, id: ViewId) -> Option<&View> {
        match self.slots.get(id.0 as usize) {
            Some(Slot::Live(view)) => Some(view),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: ViewId) -> Option<&mut View> {
        match self.slots.get_mut(id.0 as usize) {
            Some(Slot::Live(view)) => Some(view),
            _ => None,
        }
    }

    /// Change a view's size in place; the base stays put
    pub fn resize(&mut self, id: ViewId, size: usize) {
        if let Some(view) = self.get_mut(id) {
            view.size = size;
        }
    }

    /// View containing all of `[addr, addr+size)`
    pub fn find(&self, addr: usize, size: usize) -> Option<ViewId> {
        let (_, &id) = self.by_base.range(..=addr).next_back()?;
        let view = self.get(id)?;
        if addr >= view.end() {
            return None;
        }
        view.contains(addr, size).then_some(id)
    }

    /// Lowest view overlapping any of `[addr, addr+size)`
    pub fn find_range(&self, addr: usize, size: usize) -> Option<ViewId> {
        self.overlapping(addr, size).next()
    }

    /// Views overlapping `[addr, addr+size)`, in address order
    pub fn overlapping(&self, addr: usize, size: usize) -> impl Iterator<Item = ViewId> + '_ {
        let end = addr.saturating_add(size);
        let before = self
            .by_base
            .range(..addr)
            .next_back()
            .map(|(_, &id)| id)
            .filter(move |&id| self.get(id).is_some_and(|v| v.end() > addr));
        let inside = self.by_base.range(addr..end).map(|(_, &id)| id);
        before.into_iter().chain(inside)
    }

    /// Views immediately below and above `id`
    pub fn neighbours(&self, id: ViewId) -> (Option<ViewId>, Option<ViewId>) {
        let Some(view) = self.get(id) else {
            return (None, None);
        };
        let prev = self.by_base.range(..view.base).next_back().map(|(_, &id)| id);
        let next = self
            .by_base
            .range(view.base.saturating_add(1)..)
            .next()
            .map(|(_, &id)| id);
        (prev, next)
    }

    /// Last view starting at or below `addr`
    pub fn at_or_below(&self, addr: usize) -> Option<ViewId> {
        self.by_base.range(..=addr).next_back().map(|(_, &id)| id)
    }

    /// First view starting above `addr`
    pub fn above(&self, addr: usize) -> Option<ViewId> {
        self.by_base
            .range(addr.saturating_add(1)..)
            .next()
            .map(|(_, &id)| id)
    }

    /// All views in address order
    pub fn iter(&self) -> impl Iterator<Item = (ViewId, &View)> + '_ {
        self.by_base
            .values()
            .filter_map(move |&id| self.get(id).map(|view| (id, view)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(base: usize, size: usize) -> View {
        View {
            base,
            size,
            vprot: VProt::READ,
            kind: ViewKind::empty(),
        }
    }

    #[test]
    fn test_insert_find() {
        let mut map = ViewMap::with_capacity(4);
        let a = map.insert(view(0x10000, 0x10000));
        let b = map.insert(view(0x30000, 0x2000));
        assert_eq!(map.find(0x10000, 0), Some(a));
        assert_eq!(map.find(0x1f000, 0x1000), Some(a));
        assert_eq!(map.find(0x1f000, 0x2000), None);
        assert_eq!(map.find(0x20000, 0), None);
        assert_eq!(map.find(0x31000, 0x1000), Some(b));
        assert_eq!(map.find(0x32000, 0), None);
    }

    #[test]
    fn test_find_range() {
        let mut map = ViewMap::with_capacity(4);
        let a = map.insert(view(0x10000, 0x10000));
        let b = map.insert(view(0x30000, 0x10000));
        assert_eq!(map.find_range(0x1f000, 0x20000), Some(a));
        assert_eq!(map.find_range(0x20000, 0x10000), None);
        assert_eq!(map.find_range(0x20000, 0x10001), Some(b));
        assert_eq!(map.overlapping(0, 0x100000).count(), 2);
    }

    #[test]
    fn test_slots_recycled() {
        let mut map = ViewMap::with_capacity(2);
        let a = map.insert(view(0x10000, 0x1000));
        let _b = map.insert(view(0x20000, 0x1000));
        assert_eq!(map.spare(), 0);
        map.remove(a);
        assert_eq!(map.get(a), None);
        let c = map.insert(view(0x30000, 0x1000));
        assert_eq!(c, a);
        assert_eq!(map.stats.grows, 1);
    }

    #[test]
    fn test_arena_grows_by_doubling() {
        let mut map = ViewMap::with_capacity(2);
        for i in 0..5 {
            map.insert(view(0x10000 * (i + 1), 0x1000));
        }
        assert_eq!(map.len(), 5);
        assert_eq!(map.spare(), 3);
        assert_eq!(map.stats.grows, 3);
    }

    #[test]
    fn test_neighbours() {
        let mut map = ViewMap::with_capacity(4);
        let a = map.insert(view(0x10000, 0x1000));
        let b = map.insert(view(0x20000, 0x1000));
        let c = map.insert(view(0x30000, 0x1000));
        assert_eq!(map.neighbours(b), (Some(a), Some(c)));
        assert_eq!(map.neighbours(a), (None, Some(b)));
        assert_eq!(map.above(0x20000), Some(c));
        assert_eq!(map.at_or_below(0x2ffff), Some(b));
    }

    #[test]
    fn test_iter_in_order() {
        let mut map = ViewMap::with_capacity(4);
        map.insert(view(0x30000, 0x1000));
        map.insert(view(0x10000, 0x1000));
        let bases: Vec<_> = map.iter().map(|(_, v)| v.base).collect();
        assert_eq!(bases, vec![0x10000, 0x30000]);
    }
}
