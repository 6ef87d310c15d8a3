//! Common types shared by the operation surface and its collaborators
//!
//! Status codes, Win32-style protection and allocation flags, and the
//! plain value records returned by queries.

use bitflags::bitflags;
use core::fmt;
use std::os::fd::RawFd;

// ============================================================================
// Status Codes
// ============================================================================

/// NT status value returned by every public operation
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NtStatus(pub u32);

impl NtStatus {
    pub const SUCCESS: Self = Self(0x0000_0000);
    pub const WORKING_SET_LIMIT_RANGE: Self = Self(0x4000_0002);
    pub const IMAGE_NOT_AT_BASE: Self = Self(0x4000_0003);
    pub const GUARD_PAGE_VIOLATION: Self = Self(0x8000_0001);
    pub const PARTIAL_COPY: Self = Self(0x8000_000D);
    pub const UNSUCCESSFUL: Self = Self(0xC000_0001);
    pub const ACCESS_VIOLATION: Self = Self(0xC000_0005);
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D);
    pub const NO_MEMORY: Self = Self(0xC000_0017);
    pub const CONFLICTING_ADDRESSES: Self = Self(0xC000_0018);
    pub const NOT_MAPPED_VIEW: Self = Self(0xC000_0019);
    pub const INVALID_VIEW_SIZE: Self = Self(0xC000_001F);
    pub const ALREADY_COMMITTED: Self = Self(0xC000_0021);
    pub const ACCESS_DENIED: Self = Self(0xC000_0022);
    pub const NOT_COMMITTED: Self = Self(0xC000_002D);
    pub const INVALID_PAGE_PROTECTION: Self = Self(0xC000_0045);
    pub const INVALID_IMAGE_FORMAT: Self = Self(0xC000_007B);
    pub const NOT_MAPPED_DATA: Self = Self(0xC000_0088);
    pub const NOT_SUPPORTED: Self = Self(0xC000_00BB);
    pub const NOT_SAME_DEVICE: Self = Self(0xC000_00D4);
    pub const INVALID_USER_BUFFER: Self = Self(0xC000_00E8);
    pub const INVALID_PARAMETER_3: Self = Self(0xC000_00F1);
    pub const INVALID_PARAMETER_4: Self = Self(0xC000_00F2);
    pub const STACK_OVERFLOW: Self = Self(0xC000_00FD);
    pub const INVALID_ADDRESS: Self = Self(0xC000_0141);
    pub const MAPPED_ALIGNMENT: Self = Self(0xC000_0220);

    /// Success and informational codes
    pub const fn is_success(self) -> bool {
        self.0 < 0x8000_0000
    }

    pub const fn is_error(self) -> bool {
        self.0 >= 0xC000_0000
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::SUCCESS => "STATUS_SUCCESS",
            Self::WORKING_SET_LIMIT_RANGE => "STATUS_WORKING_SET_LIMIT_RANGE",
            Self::IMAGE_NOT_AT_BASE => "STATUS_IMAGE_NOT_AT_BASE",
            Self::GUARD_PAGE_VIOLATION => "STATUS_GUARD_PAGE_VIOLATION",
            Self::PARTIAL_COPY => "STATUS_PARTIAL_COPY",
            Self::UNSUCCESSFUL => "STATUS_UNSUCCESSFUL",
            Self::ACCESS_VIOLATION => "STATUS_ACCESS_VIOLATION",
            Self::INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
            Self::NO_MEMORY => "STATUS_NO_MEMORY",
            Self::CONFLICTING_ADDRESSES => "STATUS_CONFLICTING_ADDRESSES",
            Self::NOT_MAPPED_VIEW => "STATUS_NOT_MAPPED_VIEW",
            Self::INVALID_VIEW_SIZE => "STATUS_INVALID_VIEW_SIZE",
            Self::ALREADY_COMMITTED => "STATUS_ALREADY_COMMITTED",
            Self::ACCESS_DENIED => "STATUS_ACCESS_DENIED",
            Self::NOT_COMMITTED => "STATUS_NOT_COMMITTED",
            Self::INVALID_PAGE_PROTECTION => "STATUS_INVALID_PAGE_PROTECTION",
            Self::INVALID_IMAGE_FORMAT => "STATUS_INVALID_IMAGE_FORMAT",
            Self::NOT_MAPPED_DATA => "STATUS_NOT_MAPPED_DATA",
            Self::NOT_SUPPORTED => "STATUS_NOT_SUPPORTED",
            Self::NOT_SAME_DEVICE => "STATUS_NOT_SAME_DEVICE",
            Self::INVALID_USER_BUFFER => "STATUS_INVALID_USER_BUFFER",
            Self::INVALID_PARAMETER_3 => "STATUS_INVALID_PARAMETER_3",
            Self::INVALID_PARAMETER_4 => "STATUS_INVALID_PARAMETER_4",
            Self::STACK_OVERFLOW => "STATUS_STACK_OVERFLOW",
            Self::INVALID_ADDRESS => "STATUS_INVALID_ADDRESS",
            Self::MAPPED_ALIGNMENT => "STATUS_MAPPED_ALIGNMENT",
            _ => return None,
        })
    }
}

impl fmt::Debug for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "NtStatus({:#010x})", self.0),
        }
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Protection and Allocation Flags
// ============================================================================

bitflags! {
    /// Win32 page protection (`PAGE_*`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageProtection: u32 {
        const NOACCESS = 0x01;
        const READONLY = 0x02;
        const READWRITE = 0x04;
        const WRITECOPY = 0x08;
        const EXECUTE = 0x10;
        const EXECUTE_READ = 0x20;
        const EXECUTE_READWRITE = 0x40;
        const EXECUTE_WRITECOPY = 0x80;
        const GUARD = 0x100;
        const NOCACHE = 0x200;
    }
}

impl PageProtection {
    /// The access part, without the GUARD/NOCACHE modifiers
    pub fn access(self) -> u32 {
        self.bits() & 0xff
    }
}

bitflags! {
    /// `MEM_*` allocation type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocationType: u32 {
        const COMMIT = 0x1000;
        const RESERVE = 0x2000;
        const RESET = 0x80000;
        const TOP_DOWN = 0x100000;
        const WRITE_WATCH = 0x200000;
    }
}

bitflags! {
    /// `MEM_*` free type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FreeType: u32 {
        const DECOMMIT = 0x4000;
        const RELEASE = 0x8000;
    }
}

bitflags! {
    /// Flags for the write-watch query
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteWatchFlags: u32 {
        const RESET = 0x01;
    }
}

// ============================================================================
// Query Records
// ============================================================================

/// Region state reported by a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemState {
    Commit,
    Reserve,
    #[default]
    Free,
}

impl MemState {
    pub fn bits(self) -> u32 {
        match self {
            MemState::Commit => 0x1000,
            MemState::Reserve => 0x2000,
            MemState::Free => 0x10000,
        }
    }
}

/// Region type reported by a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemType {
    #[default]
    None,
    Private,
    Mapped,
    Image,
}

impl MemType {
    pub fn bits(self) -> u32 {
        match self {
            MemType::None => 0,
            MemType::Private => 0x20000,
            MemType::Mapped => 0x40000,
            MemType::Image => 0x1000000,
        }
    }
}

/// Result of a basic memory query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryBasicInformation {
    pub base_address: usize,
    pub allocation_base: usize,
    pub allocation_protect: PageProtection,
    pub region_size: usize,
    pub state: MemState,
    pub protect: PageProtection,
    pub kind: MemType,
}

/// Address space geometry reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemBasicInformation {
    pub page_size: usize,
    pub allocation_granularity: usize,
    pub lowest_user_address: usize,
    pub highest_user_address: usize,
}

// ============================================================================
// Sections
// ============================================================================

bitflags! {
    /// Section object attributes (`SEC_*`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SectionAttributes: u32 {
        const FILE = 0x0080_0000;
        const IMAGE = 0x0100_0000;
        const RESERVE = 0x0400_0000;
        const COMMIT = 0x0800_0000;
        const NOCACHE = 0x1000_0000;
    }
}

/// A mappable section, identified by its backing descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub fd: RawFd,
    /// Section length; for images this is the file length
    pub size: u64,
    pub attributes: SectionAttributes,
    /// Maximum protection of the section object
    pub protection: PageProtection,
    /// Backing for shared writable image sections
    pub shared_fd: Option<RawFd>,
}

impl Section {
    /// Data section over a whole file
    pub fn file(fd: RawFd, size: u64, protection: PageProtection) -> Self {
        Self {
            fd,
            size,
            attributes: SectionAttributes::FILE | SectionAttributes::COMMIT,
            protection,
            shared_fd: None,
        }
    }

    /// Anonymous section backed by a paging file
    pub fn pagefile(fd: RawFd, size: u64, protection: PageProtection, reserve_only: bool) -> Self {
        let attributes = if reserve_only {
            SectionAttributes::RESERVE
        } else {
            SectionAttributes::COMMIT
        };
        Self {
            fd,
            size,
            attributes,
            protection,
            shared_fd: None,
        }
    }

    /// Executable image section
    pub fn image(fd: RawFd, size: u64, shared_fd: Option<RawFd>) -> Self {
        Self {
            fd,
            size,
            attributes: SectionAttributes::IMAGE,
            protection: PageProtection::EXECUTE_WRITECOPY,
            shared_fd,
        }
    }
}

// ============================================================================
// Process Handle
// ============================================================================

/// Target process of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessHandle {
    /// The calling process; executed locally
    Current,
    /// Another process; forwarded through the server
    Other(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(NtStatus::SUCCESS.is_success());
        assert!(NtStatus::IMAGE_NOT_AT_BASE.is_success());
        assert!(!NtStatus::GUARD_PAGE_VIOLATION.is_success());
        assert!(!NtStatus::GUARD_PAGE_VIOLATION.is_error());
        assert!(NtStatus::ACCESS_VIOLATION.is_error());
    }

    #[test]
    fn test_status_debug() {
        assert_eq!(format!("{:?}", NtStatus::NOT_COMMITTED), "STATUS_NOT_COMMITTED");
        assert_eq!(format!("{:?}", NtStatus(0xC000_1234)), "NtStatus(0xc0001234)");
    }

    #[test]
    fn test_protection_access() {
        let prot = PageProtection::READWRITE | PageProtection::GUARD;
        assert_eq!(prot.access(), 0x04);
    }

    #[test]
    fn test_mem_bits() {
        assert_eq!(MemState::Commit.bits(), 0x1000);
        assert_eq!(MemType::Image.bits(), 0x1000000);
    }
}
