//! Page Protection Table
//!
//! One [`VProt`] byte per page of the address space. Two storage layouts
//! sit behind [`ProtectionStore`]:
//!
//! - [`FlatStore`]: a single array sized for the whole space, suited to
//!   32-bit address spaces
//! - [`SparseStore`]: a directory of lazily allocated chunks of
//!   `1 << 20` pages; lookups in an absent chunk read as zero without
//!   allocating
//!
//! Chunks are allocated when a view is created. If a chunk still has to
//! be allocated while a fault is being resolved and the allocation fails,
//! the process aborts: there is no way to report a partial failure from
//! inside a synchronous fault.

use log::error;

use super::vm_prot::VProt;
use crate::config::{TableLayout, VmConfig};
use crate::error::{VmError, VmResult};

/// Pages per second-level chunk
pub const CHUNK_SHIFT: u32 = 20;
const CHUNK_PAGES: usize = 1 << CHUNK_SHIFT;
const CHUNK_MASK: usize = CHUNK_PAGES - 1;

/// Backing storage for protection bytes, indexed by page number
pub trait ProtectionStore: Send {
    fn get(&self, page: usize) -> u8;

    /// Store a byte; the page's storage must exist
    fn set(&mut self, page: usize, value: u8);

    /// Make storage exist for `count` pages from `first`
    fn alloc(&mut self, first: usize, count: usize) -> VmResult<()>;

    fn is_allocated(&self, page: usize) -> bool;
}

// ============================================================================
// Flat Store
// ============================================================================

/// One byte per page, allocated up front
pub struct FlatStore {
    bytes: Vec<u8>,
}

impl FlatStore {
    pub fn new(pages: usize) -> VmResult<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(pages).map_err(|_| VmError::NoMemory)?;
        bytes.resize(pages, 0);
        Ok(Self { bytes })
    }
}

impl ProtectionStore for FlatStore {
    fn get(&self, page: usize) -> u8 {
        self.bytes.get(page).copied().unwrap_or(0)
    }

    fn set(&mut self, page: usize, value: u8) {
        if let Some(byte) = self.bytes.get_mut(page) {
            *byte = value;
        }
    }

    fn alloc(&mut self, first: usize, count: usize) -> VmResult<()> {
        match first.checked_add(count) {
            Some(end) if end <= self.bytes.len() => Ok(()),
            _ => Err(VmError::NoMemory),
        }
    }

    fn is_allocated(&self, page: usize) -> bool {
        page < self.bytes.len()
    }
}

// ============================================================================
// Sparse Store
// ============================================================================

/// Two-level table: a directory of optional chunks
pub struct SparseStore {
    chunks: Vec<Option<Box<[u8]>>>,
}

impl SparseStore {
    pub fn new(pages: usize) -> Self {
        let count = (pages >> CHUNK_SHIFT) + 1;
        let mut chunks = Vec::with_capacity(count);
        chunks.resize_with(count, || None);
        Self { chunks }
    }

    fn alloc_chunk() -> VmResult<Box<[u8]>> {
        let mut chunk = Vec::new();
        chunk
            .try_reserve_exact(CHUNK_PAGES)
            .map_err(|_| VmError::NoMemory)?;
        chunk.resize(CHUNK_PAGES, 0);
        Ok(chunk.into_boxed_slice())
    }

    pub fn allocated_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }
}

impl ProtectionStore for SparseStore {
    fn get(&self, page: usize) -> u8 {
        match self.chunks.get(page >> CHUNK_SHIFT) {
            Some(Some(chunk)) => chunk[page & CHUNK_MASK],
            _ => 0,
        }
    }

    fn set(&mut self, page: usize, value: u8) {
        let Some(slot) = self.chunks.get_mut(page >> CHUNK_SHIFT) else {
            return;
        };
        if slot.is_none() {
            if value == 0 {
                return;
            }
            match Self::alloc_chunk() {
                Ok(chunk) => *slot = Some(chunk),
                Err(_) => {
                    error!("out of memory for page protection chunk {:#x}", page >> CHUNK_SHIFT);
                    std::process::abort();
                }
            }
        }
        if let Some(chunk) = slot {
            chunk[page & CHUNK_MASK] = value;
        }
    }

    fn alloc(&mut self, first: usize, count: usize) -> VmResult<()> {
        if count == 0 {
            return Ok(());
        }
        let last = first.checked_add(count - 1).ok_or(VmError::NoMemory)?;
        let (lo, hi) = (first >> CHUNK_SHIFT, last >> CHUNK_SHIFT);
        if hi >= self.chunks.len() {
            return Err(VmError::NoMemory);
        }
        for slot in &mut self.chunks[lo..=hi] {
            if slot.is_none() {
                *slot = Some(Self::alloc_chunk()?);
            }
        }
        Ok(())
    }

    fn is_allocated(&self, page: usize) -> bool {
        matches!(self.chunks.get(page >> CHUNK_SHIFT), Some(Some(_)))
    }
}

// ============================================================================
// Page Table
// ============================================================================

/// Address-level view over a [`ProtectionStore`]
pub struct PageTable {
    store: Box<dyn ProtectionStore>,
    page_shift: u32,
}

impl PageTable {
    pub fn new(store: Box<dyn ProtectionStore>, page_shift: u32) -> Self {
        Self { store, page_shift }
    }

    /// Layout chosen by the configuration
    pub fn for_config(config: &VmConfig) -> VmResult<Self> {
        let pages = config.address_space_limit >> config.page_shift();
        let store: Box<dyn ProtectionStore> = match config.table_layout {
            TableLayout::Flat => Box::new(FlatStore::new(pages)?),
            TableLayout::TwoLevel => Box::new(SparseStore::new(pages)),
        };
        Ok(Self::new(store, config.page_shift()))
    }

    fn page_range(&self, addr: usize, size: usize) -> core::ops::Range<usize> {
        let first = addr >> self.page_shift;
        let mask = (1usize << self.page_shift) - 1;
        let last = addr.saturating_add(size).saturating_add(mask) >> self.page_shift;
        first..last
    }

    pub fn get(&self, addr: usize) -> VProt {
        VProt::from_bits_retain(self.store.get(addr >> self.page_shift))
    }

    /// Ensure storage exists for every page of the range
    pub fn alloc_range(&mut self, addr: usize, size: usize) -> VmResult<()> {
        let pages = self.page_range(addr, size);
        self.store.alloc(pages.start, pages.len())
    }

    /// Overwrite every page touched by the range
    pub fn set_range(&mut self, addr: usize, size: usize, vprot: VProt) {
        for page in self.page_range(addr, size) {
            self.store.set(page, vprot.bits());
        }
    }

    /// Read-modify-write every page touched by the range
    pub fn set_bits_range(&mut self, addr: usize, size: usize, set: VProt, clear: VProt) {
        if set.is_empty() && clear.is_empty() {
            return;
        }
        for page in self.page_range(addr, size) {
            let old = VProt::from_bits_retain(self.store.get(page));
            self.store.set(page, ((old & !clear) | set).bits());
        }
    }

    /// Whether the range's storage exists
    pub fn is_allocated(&self, addr: usize, size: usize) -> bool {
        self.page_range(addr, size).all(|page| self.store.is_allocated(page))
    }
}
