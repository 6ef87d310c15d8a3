//! Error types for internal operations
//!
//! Internal paths return `Result<T, VmError>`; the public surface converts
//! to [`NtStatus`] at the boundary.

use thiserror::Error;

use crate::types::NtStatus;

/// Failure reported by a [`MemoryBackend`](crate::vm::pmap::MemoryBackend) primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OsError {
    #[error("address range already mapped")]
    AlreadyMapped,

    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("mapping not supported by device")]
    NoDevice,

    #[error("permission denied")]
    PermissionDenied,

    #[error("bad address")]
    BadAddress,

    #[error("os error {0}")]
    Other(i32),
}

impl OsError {
    /// Classify a raw `errno`
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EEXIST => OsError::AlreadyMapped,
            libc::ENOMEM => OsError::OutOfMemory,
            libc::EINVAL => OsError::InvalidArgument,
            libc::ENODEV | libc::ENOEXEC => OsError::NoDevice,
            libc::EACCES | libc::EPERM => OsError::PermissionDenied,
            libc::EFAULT => OsError::BadAddress,
            other => OsError::Other(other),
        }
    }

    /// Current thread's `errno`
    pub fn last() -> Self {
        Self::from_errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

/// Internal virtual memory error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("invalid parameter")]
    InvalidParameter,

    #[error("conflicting addresses")]
    ConflictingAddresses,

    #[error("no memory")]
    NoMemory,

    #[error("range not committed")]
    NotCommitted,

    #[error("range already committed")]
    AlreadyCommitted,

    #[error("operation not supported")]
    NotSupported,

    #[error("invalid page protection")]
    InvalidPageProtection,

    #[error("address is not within a mapped view")]
    NotMappedView,

    #[error("access denied")]
    AccessDenied,

    #[error("invalid image format")]
    InvalidImageFormat,

    #[error("address beyond working set limit")]
    WorkingSetLimitRange,

    #[error("invalid view size")]
    InvalidViewSize,

    #[error("mapped data could not be flushed")]
    NotMappedData,

    #[error("buffer is not writable")]
    InvalidUserBuffer,

    #[error("server refused the request: {0}")]
    Server(NtStatus),

    #[error("host mapping failed: {0}")]
    Os(#[from] OsError),
}

impl From<VmError> for NtStatus {
    fn from(err: VmError) -> Self {
        match err {
            VmError::InvalidParameter => NtStatus::INVALID_PARAMETER,
            VmError::ConflictingAddresses => NtStatus::CONFLICTING_ADDRESSES,
            VmError::NoMemory => NtStatus::NO_MEMORY,
            VmError::NotCommitted => NtStatus::NOT_COMMITTED,
            VmError::AlreadyCommitted => NtStatus::ALREADY_COMMITTED,
            VmError::NotSupported => NtStatus::NOT_SUPPORTED,
            VmError::InvalidPageProtection => NtStatus::INVALID_PAGE_PROTECTION,
            VmError::NotMappedView => NtStatus::NOT_MAPPED_VIEW,
            VmError::AccessDenied => NtStatus::ACCESS_DENIED,
            VmError::InvalidImageFormat => NtStatus::INVALID_IMAGE_FORMAT,
            VmError::WorkingSetLimitRange => NtStatus::WORKING_SET_LIMIT_RANGE,
            VmError::InvalidViewSize => NtStatus::INVALID_VIEW_SIZE,
            VmError::NotMappedData => NtStatus::NOT_MAPPED_DATA,
            VmError::InvalidUserBuffer => NtStatus::INVALID_USER_BUFFER,
            VmError::Server(status) => status,
            VmError::Os(OsError::OutOfMemory) => NtStatus::NO_MEMORY,
            VmError::Os(OsError::InvalidArgument) => NtStatus::INVALID_PARAMETER,
            VmError::Os(OsError::PermissionDenied) => NtStatus::ACCESS_DENIED,
            VmError::Os(OsError::BadAddress) => NtStatus::ACCESS_VIOLATION,
            VmError::Os(_) => NtStatus::UNSUCCESSFUL,
        }
    }
}

/// Result alias for internal operations
pub type VmResult<T> = Result<T, VmError>;

/// Collapse an internal result into a status
pub(crate) fn status_of<T>(result: VmResult<T>) -> NtStatus {
    match result {
        Ok(_) => NtStatus::SUCCESS,
        Err(err) => err.into(),
    }
}
