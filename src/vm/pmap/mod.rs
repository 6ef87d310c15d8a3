//! Host Mapping Primitives
//!
//! The layer beneath the view registry: everything that actually changes
//! the process address space goes through a [`MemoryBackend`].
//!
//! ## Implementations
//!
//! - [`HostBackend`]: `mmap`/`mprotect`/`madvise`/`mlock`/`mincore`/`msync`
//!   on the running process
//! - [`SimulatedBackend`]: an in-process page model with simulated files,
//!   used to exercise the manager without touching real mappings
//!
//! Every primitive is expected to either succeed at exactly the requested
//! address (for fixed requests) or fail without side effects.

use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use std::os::fd::RawFd;

use crate::error::OsError;

pub mod host;
pub mod sim;

pub use host::HostBackend;
pub use sim::SimulatedBackend;

bitflags! {
    /// Host page protection (`PROT_*`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UnixProt: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

impl UnixProt {
    pub const NONE: Self = Self::empty();
    pub const RW: Self = Self::READ.union(Self::WRITE);
    pub const RWX: Self = Self::RW.union(Self::EXEC);
}

/// Where an anonymous mapping may be placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Host chooses the address
    Anywhere,
    /// Exactly this address, failing with `AlreadyMapped` if anything is there
    NoReplace(usize),
    /// Exactly this address, replacing whatever is there
    Fixed(usize),
}

/// Sharing mode of a file mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Share {
    Private,
    Shared,
}

/// Identity of a backing file (device, inode)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

/// Mapping primitives consumed by the manager
pub trait MemoryBackend: Send + Sync {
    fn page_size(&self) -> usize;

    /// Map zero-filled anonymous memory, returning the address used
    fn map_anon(&self, placement: Placement, len: usize, prot: UnixProt) -> Result<usize, OsError>;

    /// Replace `[addr, addr+len)` with an inaccessible, unbacked reservation
    fn reserve_fixed(&self, addr: usize, len: usize) -> Result<(), OsError>;

    /// Map a file at exactly `addr`
    fn map_file(
        &self,
        addr: usize,
        len: usize,
        prot: UnixProt,
        share: Share,
        fd: RawFd,
        offset: u64,
    ) -> Result<(), OsError>;

    fn unmap(&self, addr: usize, len: usize) -> Result<(), OsError>;

    fn protect(&self, addr: usize, len: usize, prot: UnixProt) -> Result<(), OsError>;

    /// Discard contents while keeping the mapping
    fn advise_dont_need(&self, addr: usize, len: usize) -> Result<(), OsError>;

    fn lock(&self, addr: usize, len: usize) -> Result<(), OsError>;

    fn unlock(&self, addr: usize, len: usize) -> Result<(), OsError>;

    /// Whether the page containing `addr` is resident
    fn is_resident(&self, addr: usize) -> bool;

    fn sync(&self, addr: usize, len: usize) -> Result<(), OsError>;

    /// Positional read into a local buffer
    fn read_file(&self, fd: RawFd, offset: u64, buf: &mut [u8]) -> Result<usize, OsError>;

    /// Positional read straight into mapped memory
    fn read_file_to(&self, fd: RawFd, offset: u64, addr: usize, len: usize) -> Result<usize, OsError>;

    fn file_size(&self, fd: RawFd) -> Result<u64, OsError>;

    fn file_id(&self, fd: RawFd) -> Result<FileId, OsError>;

    /// Copy out of mapped memory; the range must be readable
    fn read_memory(&self, addr: usize, buf: &mut [u8]) -> Result<(), OsError>;

    /// Copy into mapped memory; the range must be writable
    fn write_memory(&self, addr: usize, data: &[u8]) -> Result<(), OsError>;
}

// ============================================================================
// Backend Statistics
// ============================================================================

/// Primitive call counters
#[derive(Debug, Default)]
pub struct BackendStats {
    pub maps: AtomicU64,
    pub unmaps: AtomicU64,
    pub protects: AtomicU64,
    pub failures: AtomicU64,
}

impl BackendStats {
    pub const fn new() -> Self {
        Self {
            maps: AtomicU64::new(0),
            unmaps: AtomicU64::new(0),
            protects: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn incr_maps(&self) {
        self.maps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_unmaps(&self) {
        self.unmaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_protects(&self) {
        self.protects.fetch_add(1, Ordering::Relaxed);
    }

    /// Pass a result through, counting failures
    pub fn track<T>(&self, result: Result<T, OsError>) -> Result<T, OsError> {
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.maps.load(Ordering::Relaxed),
            self.unmaps.load(Ordering::Relaxed),
            self.protects.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }
}
