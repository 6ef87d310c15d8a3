//! Page protection encoding
//!
//! Every page carries one [`VProt`] byte: access rights plus the
//! committed/guard/write-watch state that the host protection cannot
//! express. Views additionally carry a [`ViewKind`] describing what
//! backs them. This module converts between the byte, host `PROT_*`
//! values and Win32 `PAGE_*` values.

use bitflags::bitflags;
use core::fmt;

use crate::error::{VmError, VmResult};
use crate::types::PageProtection;
use crate::vm::pmap::UnixProt;

bitflags! {
    /// Per-page protection and state byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VProt: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXEC = 0x04;
        const WRITECOPY = 0x08;
        const GUARD = 0x10;
        const COMMITTED = 0x20;
        /// Write-watch armed; the next write faults
        const WRITEWATCH = 0x40;
        /// Copy-on-write page already written
        const WRITTEN = 0x80;
    }
}

bitflags! {
    /// What backs a view
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ViewKind: u32 {
        /// Mapped by someone else; bookkeeping only
        const SYSTEM = 0x0200;
        const FILE = 0x0080_0000;
        const IMAGE = 0x0100_0000;
        const RESERVE = 0x0400_0000;
        const COMMIT = 0x0800_0000;
        const NOCACHE = 0x1000_0000;
    }
}

impl VProt {
    /// Access bits only
    pub const ACCESS: Self = Self::READ
        .union(Self::WRITE)
        .union(Self::EXEC)
        .union(Self::WRITECOPY);

    /// Host protection for a page in this state
    pub fn unix(self) -> UnixProt {
        let mut prot = UnixProt::NONE;
        if !self.contains(VProt::COMMITTED) || self.contains(VProt::GUARD) {
            return prot;
        }
        if self.contains(VProt::READ) {
            prot |= UnixProt::READ;
        }
        if self.contains(VProt::WRITE) {
            prot |= UnixProt::RW;
        }
        if self.contains(VProt::WRITECOPY) {
            // Unwritten copy-on-write pages fault on the first write.
            prot |= UnixProt::READ;
            if self.contains(VProt::WRITTEN) {
                prot |= UnixProt::WRITE;
            }
        }
        if self.contains(VProt::EXEC) {
            prot |= UnixProt::READ | UnixProt::EXEC;
        }
        if self.contains(VProt::WRITEWATCH) {
            prot.remove(UnixProt::WRITE);
        }
        prot
    }

    /// Win32 protection reported for a page in this state
    pub fn win32(self, kind: ViewKind) -> PageProtection {
        let mut access = self & VProt::ACCESS;
        if access.contains(VProt::WRITECOPY) && self.contains(VProt::WRITTEN) {
            access.remove(VProt::WRITECOPY);
            access.insert(VProt::WRITE);
        }
        let mut ret = if access.contains(VProt::WRITECOPY) {
            if access.contains(VProt::EXEC) {
                PageProtection::EXECUTE_WRITECOPY
            } else {
                PageProtection::WRITECOPY
            }
        } else {
            match (
                access.contains(VProt::READ),
                access.contains(VProt::WRITE),
                access.contains(VProt::EXEC),
            ) {
                (false, false, false) => PageProtection::NOACCESS,
                (true, false, false) => PageProtection::READONLY,
                (_, true, false) => PageProtection::READWRITE,
                (false, false, true) => PageProtection::EXECUTE,
                (true, false, true) => PageProtection::EXECUTE_READ,
                (_, true, true) => PageProtection::EXECUTE_READWRITE,
            }
        };
        if self.contains(VProt::GUARD) {
            ret |= PageProtection::GUARD;
        }
        if kind.contains(ViewKind::NOCACHE) {
            ret |= PageProtection::NOCACHE;
        }
        ret
    }

    /// Parse a Win32 protection; images turn writable into copy-on-write
    pub fn from_win32(protect: PageProtection, image: bool) -> VmResult<Self> {
        let write = if image { VProt::WRITECOPY } else { VProt::WRITE };
        let mut vprot = match protect.access() {
            x if x == PageProtection::READONLY.bits() => VProt::READ,
            x if x == PageProtection::READWRITE.bits() => VProt::READ | write,
            x if x == PageProtection::WRITECOPY.bits() => VProt::READ | VProt::WRITECOPY,
            x if x == PageProtection::EXECUTE.bits() => VProt::EXEC,
            x if x == PageProtection::EXECUTE_READ.bits() => VProt::EXEC | VProt::READ,
            x if x == PageProtection::EXECUTE_READWRITE.bits() => VProt::EXEC | VProt::READ | write,
            x if x == PageProtection::EXECUTE_WRITECOPY.bits() => {
                VProt::EXEC | VProt::READ | VProt::WRITECOPY
            }
            x if x == PageProtection::NOACCESS.bits() => VProt::empty(),
            _ => return Err(VmError::InvalidPageProtection),
        };
        if protect.contains(PageProtection::GUARD) {
            vprot |= VProt::GUARD;
        }
        Ok(vprot)
    }

    /// Protection of an image section from its characteristics
    pub fn from_section(characteristics: u32, builtin: bool) -> Self {
        let mut vprot = VProt::empty();
        if characteristics & IMAGE_SCN_MEM_READ != 0 {
            vprot |= VProt::READ;
        }
        if characteristics & IMAGE_SCN_MEM_WRITE != 0 {
            vprot |= if builtin { VProt::WRITE } else { VProt::WRITECOPY };
        }
        if characteristics & IMAGE_SCN_MEM_EXECUTE != 0 {
            vprot |= VProt::EXEC;
        }
        vprot
    }

    /// Compact four-letter state for trace dumps
    pub fn display(self) -> ProtStr {
        ProtStr(self)
    }
}

pub const IMAGE_SCN_MEM_SHARED: u32 = 0x1000_0000;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

impl ViewKind {
    /// Private allocation, as opposed to a mapped section
    pub fn is_valloc(self) -> bool {
        !self.intersects(ViewKind::FILE | ViewKind::RESERVE | ViewKind::COMMIT)
    }
}

/// `c`/`g`/`H` state, then `r`, `w`/`W`, `x`
pub struct ProtStr(VProt);

impl fmt::Display for ProtStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.0;
        let state = if !p.contains(VProt::COMMITTED) {
            '-'
        } else if p.contains(VProt::GUARD) {
            'g'
        } else if p.contains(VProt::WRITEWATCH) {
            'H'
        } else {
            'c'
        };
        let read = if p.contains(VProt::READ) { 'r' } else { '-' };
        let write = if p.contains(VProt::WRITECOPY) {
            'W'
        } else if p.contains(VProt::WRITE) {
            'w'
        } else {
            '-'
        };
        let exec = if p.contains(VProt::EXEC) { 'x' } else { '-' };
        write!(f, "{}{}{}{}", state, read, write, exec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: VProt = VProt::COMMITTED;

    #[test]
    fn test_unix_requires_commit() {
        assert_eq!((VProt::READ | VProt::WRITE).unix(), UnixProt::NONE);
        assert_eq!((C | VProt::READ | VProt::GUARD).unix(), UnixProt::NONE);
        assert_eq!((C | VProt::WRITE).unix(), UnixProt::RW);
        assert_eq!((C | VProt::EXEC).unix(), UnixProt::READ | UnixProt::EXEC);
    }

    #[test]
    fn test_unix_copy_on_write_is_lazy() {
        assert_eq!((C | VProt::READ | VProt::WRITECOPY).unix(), UnixProt::READ);
        assert_eq!((C | VProt::WRITECOPY | VProt::WRITTEN).unix(), UnixProt::RW);
    }

    #[test]
    fn test_unix_write_watch_strips_write() {
        assert_eq!((C | VProt::READ | VProt::WRITE | VProt::WRITEWATCH).unix(), UnixProt::READ);
    }

    #[test]
    fn test_win32_table() {
        let k = ViewKind::empty();
        assert_eq!(VProt::empty().win32(k), PageProtection::NOACCESS);
        assert_eq!(VProt::READ.win32(k), PageProtection::READONLY);
        assert_eq!(VProt::WRITE.win32(k), PageProtection::READWRITE);
        assert_eq!((VProt::READ | VProt::EXEC).win32(k), PageProtection::EXECUTE_READ);
        assert_eq!((VProt::WRITE | VProt::EXEC).win32(k), PageProtection::EXECUTE_READWRITE);
        assert_eq!((VProt::READ | VProt::WRITECOPY).win32(k), PageProtection::WRITECOPY);
        assert_eq!(
            (VProt::EXEC | VProt::WRITECOPY).win32(k),
            PageProtection::EXECUTE_WRITECOPY
        );
        assert_eq!(
            (VProt::READ | VProt::WRITECOPY | VProt::WRITTEN).win32(k),
            PageProtection::READWRITE
        );
        assert_eq!(
            (VProt::READ | VProt::GUARD).win32(ViewKind::NOCACHE),
            PageProtection::READONLY | PageProtection::GUARD | PageProtection::NOCACHE
        );
    }

    #[test]
    fn test_from_win32() {
        assert_eq!(
            VProt::from_win32(PageProtection::READWRITE, false),
            Ok(VProt::READ | VProt::WRITE)
        );
        assert_eq!(
            VProt::from_win32(PageProtection::READWRITE, true),
            Ok(VProt::READ | VProt::WRITECOPY)
        );
        assert_eq!(
            VProt::from_win32(PageProtection::READONLY | PageProtection::GUARD, false),
            Ok(VProt::READ | VProt::GUARD)
        );
        assert_eq!(VProt::from_win32(PageProtection::NOACCESS, false), Ok(VProt::empty()));
        assert_eq!(
            VProt::from_win32(PageProtection::READONLY | PageProtection::READWRITE, false),
            Err(VmError::InvalidPageProtection)
        );
        assert_eq!(
            VProt::from_win32(PageProtection::empty(), false),
            Err(VmError::InvalidPageProtection)
        );
    }

    #[test]
    fn test_section_flags() {
        let data = IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;
        assert_eq!(VProt::from_section(data, false), VProt::READ | VProt::WRITECOPY);
        assert_eq!(VProt::from_section(data, true), VProt::READ | VProt::WRITE);
        let code = IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_EXECUTE;
        assert_eq!(VProt::from_section(code, false), VProt::READ | VProt::EXEC);
    }

    #[test]
    fn test_valloc_kind() {
        assert!(ViewKind::empty().is_valloc());
        assert!(ViewKind::SYSTEM.is_valloc());
        assert!(!ViewKind::FILE.is_valloc());
        assert!(!(ViewKind::IMAGE | ViewKind::FILE).is_valloc());
    }

    #[test]
    fn test_prot_str() {
        let p = C | VProt::READ | VProt::WRITECOPY;
        assert_eq!(p.display().to_string(), "crW-");
        assert_eq!((VProt::READ | VProt::EXEC).display().to_string(), "-r-x");
        assert_eq!((C | VProt::GUARD | VProt::READ).display().to_string(), "gr--");
    }
}
