//! ntvm - NT-style process virtual memory on top of POSIX mmap
//!
//! Implements the reserve/commit/protect/query model of the NT virtual
//! memory API, file and PE image sections, write watches, guard pages and
//! copy-on-write, by keeping a shadow of the process address space and
//! driving the host through a [`MemoryBackend`].
//!
//! ## Layout
//!
//! - [`vm`]: views, page protections, placement, faults and the operation surface
//! - [`types`]: NT status codes, flags and information structures
//! - [`server`]: the channel to the process server
//! - [`reserved`]: externally owned address reservations
//! - [`config`]: address-space geometry and policy switches
//! - [`error`]: internal error kinds
//!
//! One [`VirtualMemoryManager`] owns a process. [`init`] installs the
//! process-wide instance for signal handlers to reach; tests construct their
//! own managers over a [`SimulatedBackend`].

#![allow(clippy::new_without_default)]

pub mod config;
pub mod error;
pub mod reserved;
pub mod server;
pub mod types;
pub mod vm;

pub use config::{TableLayout, VmConfig, GRANULARITY};
pub use error::{OsError, VmError, VmResult};
pub use reserved::{ReservedAreaList, ReservedAreas};
pub use server::{LocalServer, RemoteCall, RemoteResult, ServerChannel, ServerReply, ServerRequest};
pub use types::{
    AllocationType, FreeType, MemState, MemType, MemoryBasicInformation, NtStatus, PageProtection,
    ProcessHandle, Section, SectionAttributes, SystemBasicInformation, WriteWatchFlags,
};
pub use vm::pmap::{HostBackend, SimulatedBackend};
pub use vm::vm_user::zero_bits_win_to_64;
pub use vm::{
    FaultAccess, FaultStatus, MemoryBackend, StackFault, ThreadStack, VProt, View, ViewKind,
    VirtualMemoryManager,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Global State
// ============================================================================

static MANAGER: spin::Once<VirtualMemoryManager> = spin::Once::new();

/// Install the process-wide manager
///
/// Only the first call installs; later calls return the existing manager
/// and drop `manager`.
pub fn init(manager: VirtualMemoryManager) -> &'static VirtualMemoryManager {
    if let Some(existing) = MANAGER.get() {
        log::warn!("virtual memory manager already installed");
        return existing;
    }
    MANAGER.call_once(|| {
        log::trace!("installing process virtual memory manager");
        manager
    })
}

/// The process-wide manager, if [`init`] has run
pub fn manager() -> Option<&'static VirtualMemoryManager> {
    MANAGER.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_installs_once() {
        let make = || {
            VirtualMemoryManager::new(
                VmConfig::wide(0x1000),
                Arc::new(SimulatedBackend::new(0x1000)),
                Box::new(ReservedAreaList::new()),
                Arc::new(LocalServer::new()),
            )
            .unwrap()
        };
        let first = init(make()) as *const VirtualMemoryManager;
        let second = init(make()) as *const VirtualMemoryManager;
        assert_eq!(first, second);
        assert!(manager().is_some());
    }
}
