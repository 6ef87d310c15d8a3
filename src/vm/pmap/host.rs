//! Host backend over the process's real address space

use core::ptr;
use std::os::fd::RawFd;

use libc::{c_int, c_void};

use super::{BackendStats, FileId, MemoryBackend, Placement, Share, UnixProt};
use crate::error::OsError;

#[cfg(target_os = "linux")]
const MAP_FIXED_NOREPLACE: c_int = libc::MAP_FIXED_NOREPLACE;
// Without kernel support the request degrades to a hint; callers compare the result.
#[cfg(not(target_os = "linux"))]
const MAP_FIXED_NOREPLACE: c_int = 0;

#[cfg(target_os = "linux")]
const MAP_NORESERVE: c_int = libc::MAP_NORESERVE;
#[cfg(not(target_os = "linux"))]
const MAP_NORESERVE: c_int = 0;

/// Mapping primitives backed by `libc`
pub struct HostBackend {
    page_size: usize,
    pub stats: BackendStats,
}

impl HostBackend {
    /// Create the host backend
    ///
    /// # Safety
    ///
    /// The manager using this backend treats the whole process address
    /// space as its own: fixed mappings replace whatever is there, and
    /// `read_memory`/`write_memory` dereference the addresses they are
    /// given. Only one manager may own the host address space, and it
    /// must only be handed addresses it placed itself.
    pub unsafe fn new() -> Self {
        // SAFETY: sysconf has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            page_size: if page_size > 0 { page_size as usize } else { 0x1000 },
            stats: BackendStats::new(),
        }
    }

    fn mmap(
        &self,
        addr: usize,
        len: usize,
        prot: UnixProt,
        flags: c_int,
        fd: RawFd,
        offset: u64,
    ) -> Result<usize, OsError> {
        self.stats.incr_maps();
        // SAFETY: fixed requests only target ranges the owning manager controls.
        let ret = unsafe {
            libc::mmap(
                addr as *mut c_void,
                len,
                prot.bits() as c_int,
                flags,
                fd,
                offset as libc::off_t,
            )
        };
        if ret == libc::MAP_FAILED {
            return self.stats.track(Err(OsError::last()));
        }
        Ok(ret as usize)
    }
}

fn check(ret: c_int) -> Result<(), OsError> {
    if ret == 0 {
        Ok(())
    } else {
        Err(OsError::last())
    }
}

impl MemoryBackend for HostBackend {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map_anon(&self, placement: Placement, len: usize, prot: UnixProt) -> Result<usize, OsError> {
        let anon = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        let (addr, flags) = match placement {
            Placement::Anywhere => (0, anon),
            Placement::NoReplace(addr) => (addr, anon | MAP_FIXED_NOREPLACE),
            Placement::Fixed(addr) => (addr, anon | libc::MAP_FIXED),
        };
        self.mmap(addr, len, prot, flags, -1, 0)
    }

    fn reserve_fixed(&self, addr: usize, len: usize) -> Result<(), OsError> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_NORESERVE | libc::MAP_FIXED;
        self.mmap(addr, len, UnixProt::NONE, flags, -1, 0).map(|_| ())
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
        let share = match share {
            Share::Private => libc::MAP_PRIVATE,
            Share::Shared => libc::MAP_SHARED,
        };
        self.mmap(addr, len, prot, share | libc::MAP_FIXED, fd, offset).map(|_| ())
    }

    fn unmap(&self, addr: usize, len: usize) -> Result<(), OsError> {
        self.stats.incr_unmaps();
        // SAFETY: see `HostBackend::new`.
        self.stats.track(check(unsafe { libc::munmap(addr as *mut c_void, len) }))
    }

    fn protect(&self, addr: usize, len: usize, prot: UnixProt) -> Result<(), OsError> {
        self.stats.incr_protects();
        // SAFETY: see `HostBackend::new`.
        let ret = unsafe { libc::mprotect(addr as *mut c_void, len, prot.bits() as c_int) };
        self.stats.track(check(ret))
    }

    fn advise_dont_need(&self, addr: usize, len: usize) -> Result<(), OsError> {
        // SAFETY: see `HostBackend::new`.
        check(unsafe { libc::madvise(addr as *mut c_void, len, libc::MADV_DONTNEED) })
    }

    fn lock(&self, addr: usize, len: usize) -> Result<(), OsError> {
        // SAFETY: mlock does not access the memory.
        check(unsafe { libc::mlock(addr as *const c_void, len) })
    }

    fn unlock(&self, addr: usize, len: usize) -> Result<(), OsError> {
        // SAFETY: munlock does not access the memory.
        check(unsafe { libc::munlock(addr as *const c_void, len) })
    }

    fn is_resident(&self, addr: usize) -> bool {
        let page = addr & !(self.page_size - 1);
        let mut vec = [0u8; 1];
        // SAFETY: mincore writes one byte per page into `vec`.
        let ret = unsafe { libc::mincore(page as *mut c_void, self.page_size, vec.as_mut_ptr() as *mut _) };
        ret == 0 && vec[0] & 1 != 0
    }

    fn sync(&self, addr: usize, len: usize) -> Result<(), OsError> {
        // SAFETY: msync does not dereference the range from user space.
        check(unsafe { libc::msync(addr as *mut c_void, len, libc::MS_ASYNC) })
    }

    fn read_file(&self, fd: RawFd, offset: u64, buf: &mut [u8]) -> Result<usize, OsError> {
        // SAFETY: `buf` is a valid writable slice.
        let ret = unsafe {
            libc::pread(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), offset as libc::off_t)
        };
        if ret < 0 {
            return Err(OsError::last());
        }
        Ok(ret as usize)
    }

    fn read_file_to(&self, fd: RawFd, offset: u64, addr: usize, len: usize) -> Result<usize, OsError> {
        // SAFETY: the kernel reports EFAULT for unwritable destinations.
        let ret = unsafe { libc::pread(fd, addr as *mut c_void, len, offset as libc::off_t) };
        if ret < 0 {
            return Err(OsError::last());
        }
        Ok(ret as usize)
    }

    fn file_size(&self, fd: RawFd) -> Result<u64, OsError> {
        let mut st = core::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fstat initializes `st` on success.
        check(unsafe { libc::fstat(fd, st.as_mut_ptr()) })?;
        // SAFETY: checked above.
        Ok(unsafe { st.assume_init() }.st_size as u64)
    }

    fn file_id(&self, fd: RawFd) -> Result<FileId, OsError> {
        let mut st = core::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fstat initializes `st` on success.
        check(unsafe { libc::fstat(fd, st.as_mut_ptr()) })?;
        // SAFETY: checked above.
        let st = unsafe { st.assume_init() };
        Ok(FileId {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
        })
    }

    fn read_memory(&self, addr: usize, buf: &mut [u8]) -> Result<(), OsError> {
        if addr == 0 {
            return Err(OsError::BadAddress);
        }
        // SAFETY: the caller has checked the range is mapped readable.
        unsafe { ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn write_memory(&self, addr: usize, data: &[u8]) -> Result<(), OsError> {
        if addr == 0 {
            return Err(OsError::BadAddress);
        }
        // SAFETY: the caller has checked the range is mapped writable.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
        Ok(())
    }
}
