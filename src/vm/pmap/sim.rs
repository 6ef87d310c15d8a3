//! Simulated backend: a page-granular model of a process address space
//!
//! Pages carry their own protection and either private contents or a
//! reference into a simulated file. Accesses through [`MemoryBackend`]
//! honor protections the way the host MMU would, so a write to a
//! read-only page reports `BadAddress` instead of landing. Tests use
//! [`SimulatedBackend::access`] to discover which page would fault.

use std::collections::BTreeMap;
use std::os::fd::RawFd;

use spin::Mutex;

use super::{BackendStats, FileId, MemoryBackend, Placement, Share, UnixProt};
use crate::error::OsError;

const DEFAULT_MMAP_TOP: usize = 0x7f00_0000_0000;
const MMAP_FLOOR: usize = 0x10000;

/// A simulated file
struct SimFile {
    data: Vec<u8>,
    id: FileId,
    /// Error every `map_file` of this file reports
    map_error: Option<OsError>,
}

#[derive(Clone)]
enum Backing {
    /// Anonymous or private file copy; `None` reads as zeros
    Private(Option<Box<[u8]>>),
    /// Live view of a file
    Shared { fd: RawFd, offset: u64 },
}

#[derive(Clone)]
struct SimPage {
    prot: UnixProt,
    backing: Backing,
    resident: bool,
    locked: bool,
}

struct SimState {
    pages: BTreeMap<usize, SimPage>,
    files: BTreeMap<RawFd, SimFile>,
    next_fd: RawFd,
    mmap_top: usize,
    fail_next_anon: Option<OsError>,
}

/// In-process model of the host mapping primitives
pub struct SimulatedBackend {
    page_size: usize,
    state: Mutex<SimState>,
    pub stats: BackendStats,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(0x1000)
    }
}

impl SimulatedBackend {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            state: Mutex::new(SimState {
                pages: BTreeMap::new(),
                files: BTreeMap::new(),
                next_fd: 100,
                mmap_top: DEFAULT_MMAP_TOP,
                fail_next_anon: None,
            }),
            stats: BackendStats::new(),
        }
    }

    /// Move the top of the range used for host-chosen placements
    pub fn with_mmap_top(self, top: usize) -> Self {
        self.state.lock().mmap_top = top;
        self
    }

    // ========================================================================
    // Test Controls
    // ========================================================================

    /// Register a file and return its descriptor
    pub fn create_file(&self, data: &[u8]) -> RawFd {
        let mut state = self.state.lock();
        let fd = state.next_fd;
        state.next_fd += 1;
        state.files.insert(
            fd,
            SimFile {
                data: data.to_vec(),
                id: FileId { dev: 0x5157, ino: fd as u64 },
                map_error: None,
            },
        );
        fd
    }

    /// Open another descriptor for the same file
    pub fn dup_file(&self, fd: RawFd) -> Option<RawFd> {
        let mut state = self.state.lock();
        let file = state.files.get(&fd)?;
        let copy = SimFile {
            data: file.data.clone(),
            id: file.id,
            map_error: file.map_error,
        };
        let new_fd = state.next_fd;
        state.next_fd += 1;
        state.files.insert(new_fd, copy);
        Some(new_fd)
    }

    pub fn file_contents(&self, fd: RawFd) -> Option<Vec<u8>> {
        self.state.lock().files.get(&fd).map(|f| f.data.clone())
    }

    /// Make every mapping of `fd` fail, as on a `noexec` mount
    pub fn set_file_map_error(&self, fd: RawFd, err: Option<OsError>) {
        if let Some(file) = self.state.lock().files.get_mut(&fd) {
            file.map_error = err;
        }
    }

    /// Fail the next anonymous mapping request
    pub fn fail_next_anon(&self, err: OsError) {
        self.state.lock().fail_next_anon = Some(err);
    }

    /// Map an inaccessible foreign region the manager knows nothing about
    pub fn occupy(&self, addr: usize, len: usize) {
        let mut state = self.state.lock();
        self.insert_pages(&mut state, addr, len, UnixProt::NONE, |_| Backing::Private(None));
    }

    /// Evict a page so it reads as non-resident
    pub fn drop_page(&self, addr: usize) {
        let page = self.trunc(addr);
        if let Some(p) = self.state.lock().pages.get_mut(&page) {
            p.resident = false;
        }
    }

    pub fn is_mapped(&self, addr: usize) -> bool {
        self.state.lock().pages.contains_key(&self.trunc(addr))
    }

    pub fn is_locked(&self, addr: usize) -> bool {
        self.state
            .lock()
            .pages
            .get(&self.trunc(addr))
            .is_some_and(|p| p.locked)
    }

    pub fn prot_at(&self, addr: usize) -> Option<UnixProt> {
        self.state.lock().pages.get(&self.trunc(addr)).map(|p| p.prot)
    }

    /// Whether the page is backed by a live file view
    pub fn is_shared(&self, addr: usize) -> bool {
        self.state
            .lock()
            .pages
            .get(&self.trunc(addr))
            .is_some_and(|p| matches!(p.backing, Backing::Shared { .. }))
    }

    pub fn mapped_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Probe an access, returning the first address that would fault
    pub fn access(&self, addr: usize, len: usize, write: bool) -> Result<(), usize> {
        let need = if write { UnixProt::WRITE } else { UnixProt::READ };
        let state = self.state.lock();
        let end = addr.checked_add(len).ok_or(addr)?;
        let mut page = self.trunc(addr);
        while page < end {
            match state.pages.get(&page) {
                Some(p) if p.prot.contains(need) => {}
                _ => return Err(page.max(addr)),
            }
            page += self.page_size;
        }
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn trunc(&self, addr: usize) -> usize {
        addr & !(self.page_size - 1)
    }

    fn page_count(&self, len: usize) -> usize {
        len.div_ceil(self.page_size)
    }

    fn check_fixed(&self, addr: usize, len: usize) -> Result<(), OsError> {
        if len == 0 || addr & (self.page_size - 1) != 0 || addr.checked_add(len).is_none() {
            return Err(OsError::InvalidArgument);
        }
        Ok(())
    }

    fn any_mapped(&self, state: &SimState, addr: usize, len: usize) -> bool {
        state.pages.range(addr..addr.saturating_add(len)).next().is_some()
    }

    fn all_mapped(&self, state: &SimState, addr: usize, len: usize) -> bool {
        let start = self.trunc(addr);
        let count = self.page_count(addr + len - start);
        state.pages.range(start..start + count * self.page_size).count() == count
    }

    fn find_hole(&self, state: &SimState, len: usize) -> Option<usize> {
        let mut candidate = state.mmap_top.checked_sub(len)?;
        loop {
            if candidate < MMAP_FLOOR {
                return None;
            }
            match state.pages.range(candidate..candidate + len).next() {
                None => return Some(candidate),
                Some((&occupied, _)) => candidate = self.trunc(occupied.checked_sub(len)?),
            }
        }
    }

    fn insert_pages(
        &self,
        state: &mut SimState,
        addr: usize,
        len: usize,
        prot: UnixProt,
        backing: impl Fn(usize) -> Backing,
    ) {
        for i in 0..self.page_count(len) {
            let page = addr + i * self.page_size;
            state.pages.insert(
                page,
                SimPage {
                    prot,
                    backing: backing(i),
                    resident: true,
                    locked: false,
                },
            );
        }
    }

    fn read_page(&self, state: &SimState, page: &SimPage, offset: usize, out: &mut [u8]) {
        match &page.backing {
            Backing::Private(None) => out.fill(0),
            Backing::Private(Some(data)) => out.copy_from_slice(&data[offset..offset + out.len()]),
            Backing::Shared { fd, offset: file_offset } => {
                out.fill(0);
                if let Some(file) = state.files.get(fd) {
                    let start = (*file_offset as usize).saturating_add(offset);
                    if start < file.data.len() {
                        let n = out.len().min(file.data.len() - start);
                        out[..n].copy_from_slice(&file.data[start..start + n]);
                    }
                }
            }
        }
    }

    fn write_page(state: &mut SimState, page_addr: usize, page_size: usize, offset: usize, data: &[u8]) {
        let Some(page) = state.pages.get_mut(&page_addr) else {
            return;
        };
        page.resident = true;
        match &mut page.backing {
            Backing::Private(slot) => {
                let buf = slot.get_or_insert_with(|| vec![0u8; page_size].into_boxed_slice());
                buf[offset..offset + data.len()].copy_from_slice(data);
            }
            Backing::Shared { fd, offset: file_offset } => {
                let (fd, start) = (*fd, *file_offset as usize + offset);
                if let Some(file) = state.files.get_mut(&fd) {
                    if file.data.len() < start + data.len() {
                        file.data.resize(start + data.len(), 0);
                    }
                    file.data[start..start + data.len()].copy_from_slice(data);
                }
            }
        }
    }

    /// Copy memory, checking each page for `need`
    fn copy_out(&self, state: &SimState, addr: usize, buf: &mut [u8], need: UnixProt) -> Result<(), OsError> {
        let mut done = 0;
        while done < buf.len() {
            let cur = addr + done;
            let page_addr = self.trunc(cur);
            let offset = cur - page_addr;
            let n = (self.page_size - offset).min(buf.len() - done);
            let page = state.pages.get(&page_addr).ok_or(OsError::BadAddress)?;
            if !page.prot.contains(need) {
                return Err(OsError::BadAddress);
            }
            self.read_page(state, page, offset, &mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn copy_in(&self, state: &mut SimState, addr: usize, data: &[u8]) -> Result<(), OsError> {
        let end = addr.checked_add(data.len()).ok_or(OsError::BadAddress)?;
        let mut page = self.trunc(addr);
        while page < end {
            match state.pages.get(&page) {
                Some(p) if p.prot.contains(UnixProt::WRITE) => {}
                _ => return Err(OsError::BadAddress),
            }
            page += self.page_size;
        }
        let mut done = 0;
        while done < data.len() {
            let cur = addr + done;
            let page_addr = self.trunc(cur);
            let offset = cur - page_addr;
            let n = (self.page_size - offset).min(data.len() - done);
            Self::write_page(state, page_addr, self.page_size, offset, &data[done..done + n]);
            done += n;
        }
        Ok(())
    }
}

impl MemoryBackend for SimulatedBackend {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map_anon(&self, placement: Placement, len: usize, prot: UnixProt) -> Result<usize, OsError> {
        self.stats.incr_maps();
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next_anon.take() {
            return self.stats.track(Err(err));
        }
        let len = self.page_count(len) * self.page_size;
        if len == 0 {
            return self.stats.track(Err(OsError::InvalidArgument));
        }
        let addr = match placement {
            Placement::Anywhere => self.find_hole(&state, len),
            Placement::NoReplace(addr) => {
                self.stats.track(self.check_fixed(addr, len))?;
                if self.any_mapped(&state, addr, len) {
                    return self.stats.track(Err(OsError::AlreadyMapped));
                }
                Some(addr)
            }
            Placement::Fixed(addr) => {
                self.stats.track(self.check_fixed(addr, len))?;
                Some(addr)
            }
        };
        let addr = self.stats.track(addr.ok_or(OsError::OutOfMemory))?;
        self.insert_pages(&mut state, addr, len, prot, |_| Backing::Private(None));
        Ok(addr)
    }

    fn reserve_fixed(&self, addr: usize, len: usize) -> Result<(), OsError> {
        self.map_anon(Placement::Fixed(addr), len, UnixProt::NONE).map(|_| ())
    }

    fn map_file(
        &self,
        addr: usize,
        len: usize,
        prot: UnixProt,
        share: Share,
        fd: RawFd,
        offset: u64,
    ) -> Result<(), OsError> {
        self.stats.incr_maps();
        let mut state = self.state.lock();
        self.stats.track(self.check_fixed(addr, len))?;
        if offset as usize & (self.page_size - 1) != 0 {
            return self.stats.track(Err(OsError::InvalidArgument));
        }
        let file = state.files.get(&fd).ok_or(OsError::Other(libc::EBADF));
        let file = self.stats.track(file)?;
        if let Some(err) = file.map_error {
            return self.stats.track(Err(err));
        }
        let data = match share {
            Share::Private => file.data.clone(),
            Share::Shared => Vec::new(),
        };
        let page_size = self.page_size;
        match share {
            Share::Shared => {
                self.insert_pages(&mut state, addr, len, prot, |i| Backing::Shared {
                    fd,
                    offset: offset + (i * page_size) as u64,
                });
            }
            Share::Private => {
                self.insert_pages(&mut state, addr, len, prot, |i| {
                    let start = offset as usize + i * page_size;
                    if start >= data.len() {
                        return Backing::Private(None);
                    }
                    let mut buf = vec![0u8; page_size];
                    let n = page_size.min(data.len() - start);
                    buf[..n].copy_from_slice(&data[start..start + n]);
                    Backing::Private(Some(buf.into_boxed_slice()))
                });
            }
        }
        Ok(())
    }

    fn unmap(&self, addr: usize, len: usize) -> Result<(), OsError> {
        self.stats.incr_unmaps();
        self.stats.track(self.check_fixed(addr, len))?;
        let mut state = self.state.lock();
        let pages: Vec<usize> = state.pages.range(addr..addr + len).map(|(&a, _)| a).collect();
        for page in pages {
            state.pages.remove(&page);
        }
        Ok(())
    }

    fn protect(&self, addr: usize, len: usize, prot: UnixProt) -> Result<(), OsError> {
        self.stats.incr_protects();
        let mut state = self.state.lock();
        if len == 0 {
            return Ok(());
        }
        if !self.all_mapped(&state, addr, len) {
            return self.stats.track(Err(OsError::OutOfMemory));
        }
        for (_, page) in state.pages.range_mut(self.trunc(addr)..addr + len) {
            page.prot = prot;
        }
        Ok(())
    }

    fn advise_dont_need(&self, addr: usize, len: usize) -> Result<(), OsError> {
        let mut state = self.state.lock();
        if !self.all_mapped(&state, addr, len) {
            return Err(OsError::OutOfMemory);
        }
        for (_, page) in state.pages.range_mut(self.trunc(addr)..addr + len) {
            if let Backing::Private(data) = &mut page.backing {
                *data = None;
                page.resident = false;
            }
        }
        Ok(())
    }

    fn lock(&self, addr: usize, len: usize) -> Result<(), OsError> {
        let mut state = self.state.lock();
        if len == 0 || !self.all_mapped(&state, addr, len) {
            return Err(OsError::OutOfMemory);
        }
        for (_, page) in state.pages.range_mut(self.trunc(addr)..addr + len) {
            page.locked = true;
            page.resident = true;
        }
        Ok(())
    }

    fn unlock(&self, addr: usize, len: usize) -> Result<(), OsError> {
        let mut state = self.state.lock();
        if len == 0 || !self.all_mapped(&state, addr, len) {
            return Err(OsError::OutOfMemory);
        }
        for (_, page) in state.pages.range_mut(self.trunc(addr)..addr + len) {
            page.locked = false;
        }
        Ok(())
    }

    fn is_resident(&self, addr: usize) -> bool {
        self.state
            .lock()
            .pages
            .get(&self.trunc(addr))
            .is_some_and(|p| p.resident)
    }

    fn sync(&self, addr: usize, len: usize) -> Result<(), OsError> {
        let state = self.state.lock();
        if len != 0 && !self.all_mapped(&state, addr, len) {
            return Err(OsError::OutOfMemory);
        }
        Ok(())
    }

    fn read_file(&self, fd: RawFd, offset: u64, buf: &mut [u8]) -> Result<usize, OsError> {
        let state = self.state.lock();
        let file = state.files.get(&fd).ok_or(OsError::Other(libc::EBADF))?;
        let start = offset as usize;
        if start >= file.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(file.data.len() - start);
        buf[..n].copy_from_slice(&file.data[start..start + n]);
        Ok(n)
    }

    fn read_file_to(&self, fd: RawFd, offset: u64, addr: usize, len: usize) -> Result<usize, OsError> {
        let mut state = self.state.lock();
        let file = state.files.get(&fd).ok_or(OsError::Other(libc::EBADF))?;
        let start = offset as usize;
        if start >= file.data.len() || len == 0 {
            return Ok(0);
        }
        let n = len.min(file.data.len() - start);
        let chunk = file.data[start..start + n].to_vec();
        self.copy_in(&mut state, addr, &chunk)?;
        Ok(n)
    }

    fn file_size(&self, fd: RawFd) -> Result<u64, OsError> {
        let state = self.state.lock();
        let file = state.files.get(&fd).ok_or(OsError::Other(libc::EBADF))?;
        Ok(file.data.len() as u64)
    }

    fn file_id(&self, fd: RawFd) -> Result<FileId, OsError> {
        let state = self.state.lock();
        state
            .files
            .get(&fd)
            .map(|f| f.id)
            .ok_or(OsError::Other(libc::EBADF))
    }

    fn read_memory(&self, addr: usize, buf: &mut [u8]) -> Result<(), OsError> {
        let state = self.state.lock();
        self.copy_out(&state, addr, buf, UnixProt::READ)
    }

    fn write_memory(&self, addr: usize, data: &[u8]) -> Result<(), OsError> {
        let mut state = self.state.lock();
        self.copy_in(&mut state, addr, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 0x1000;

    #[test]
    fn test_anywhere_is_top_down() {
        let sim = SimulatedBackend::new(PAGE).with_mmap_top(0x100000);
        let a = sim.map_anon(Placement::Anywhere, PAGE, UnixProt::RW).unwrap();
        let b = sim.map_anon(Placement::Anywhere, PAGE, UnixProt::RW).unwrap();
        assert_eq!(a, 0x100000 - PAGE);
        assert_eq!(b, a - PAGE);
    }

    #[test]
    fn test_no_replace_conflict() {
        let sim = SimulatedBackend::new(PAGE);
        sim.occupy(0x40000, PAGE);
        assert_eq!(
            sim.map_anon(Placement::NoReplace(0x40000), PAGE, UnixProt::RW),
            Err(OsError::AlreadyMapped)
        );
        assert_eq!(sim.map_anon(Placement::Fixed(0x40000), PAGE, UnixProt::RW), Ok(0x40000));
    }

    #[test]
    fn test_protection_enforced() {
        let sim = SimulatedBackend::new(PAGE);
        let addr = sim.map_anon(Placement::Fixed(0x30000), PAGE * 2, UnixProt::READ).unwrap();
        assert_eq!(sim.write_memory(addr, &[1]), Err(OsError::BadAddress));
        assert_eq!(sim.access(addr + 0x10, 4, true), Err(addr + 0x10));
        sim.protect(addr + PAGE, PAGE, UnixProt::RW).unwrap();
        assert_eq!(sim.access(addr, PAGE * 2, true), Err(addr));
        sim.write_memory(addr + PAGE, &[7, 8]).unwrap();
        let mut buf = [0u8; 2];
        sim.read_memory(addr + PAGE, &mut buf).unwrap();
        assert_eq!(buf, [7, 8]);
    }

    #[test]
    fn test_shared_and_private_file_views() {
        let sim = SimulatedBackend::new(PAGE);
        let fd = sim.create_file(&[0xaa; PAGE]);
        sim.map_file(0x60000, PAGE, UnixProt::RW, Share::Shared, fd, 0).unwrap();
        sim.map_file(0x70000, PAGE, UnixProt::RW, Share::Private, fd, 0).unwrap();
        sim.write_memory(0x70000, &[1]).unwrap();
        assert_eq!(sim.file_contents(fd).unwrap()[0], 0xaa);
        sim.write_memory(0x60000, &[2]).unwrap();
        assert_eq!(sim.file_contents(fd).unwrap()[0], 2);
    }

    #[test]
    fn test_unaligned_file_offset_rejected() {
        let sim = SimulatedBackend::new(PAGE);
        let fd = sim.create_file(&[0; 0x3000]);
        assert_eq!(
            sim.map_file(0x60000, PAGE, UnixProt::READ, Share::Private, fd, 0x200),
            Err(OsError::InvalidArgument)
        );
    }

    #[test]
    fn test_read_file_to_needs_write() {
        let sim = SimulatedBackend::new(PAGE);
        let fd = sim.create_file(b"abcdef");
        sim.map_anon(Placement::Fixed(0x80000), PAGE, UnixProt::READ).unwrap();
        assert_eq!(sim.read_file_to(fd, 0, 0x80000, 6), Err(OsError::BadAddress));
        sim.protect(0x80000, PAGE, UnixProt::RW).unwrap();
        assert_eq!(sim.read_file_to(fd, 2, 0x80000, 6), Ok(4));
    }

    #[test]
    fn test_dont_need_clears_private() {
        let sim = SimulatedBackend::new(PAGE);
        sim.map_anon(Placement::Fixed(0x90000), PAGE, UnixProt::RW).unwrap();
        sim.write_memory(0x90000, &[9]).unwrap();
        sim.advise_dont_need(0x90000, PAGE).unwrap();
        let mut buf = [1u8];
        sim.read_memory(0x90000, &mut buf).unwrap();
        assert_eq!(buf, [0]);
        assert!(!sim.is_resident(0x90000));
    }
}
