//! Registry server channel
//!
//! Mappings that other processes must be able to discover are registered
//! with a server, and operations on other processes are shipped to it as
//! asynchronous procedure calls. The manager only needs a synchronous
//! request/reply exchange; [`LocalServer`] serves a single process.

use std::collections::BTreeMap;

use log::trace;
use spin::Mutex;

use crate::types::{
    AllocationType, FreeType, MemoryBasicInformation, NtStatus, PageProtection, Section,
};
use crate::vm::pmap::FileId;

// ============================================================================
// Remote Calls
// ============================================================================

/// An operation to run inside another process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCall {
    Alloc {
        addr: usize,
        size: usize,
        zero_bits: usize,
        op_type: AllocationType,
        prot: PageProtection,
    },
    Free {
        addr: usize,
        size: usize,
        op_type: FreeType,
    },
    Protect {
        addr: usize,
        size: usize,
        prot: PageProtection,
    },
    Query {
        addr: usize,
    },
    Lock {
        addr: usize,
        size: usize,
    },
    Unlock {
        addr: usize,
        size: usize,
    },
    Flush {
        addr: usize,
        size: usize,
    },
    MapView {
        section: Section,
        addr: usize,
        size: usize,
        offset: u64,
        zero_bits: usize,
        alloc_type: AllocationType,
        prot: PageProtection,
    },
    UnmapView {
        addr: usize,
    },
}

/// Result of a [`RemoteCall`]; every variant carries the call's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteResult {
    Alloc { status: NtStatus, addr: usize, size: usize },
    Free { status: NtStatus, addr: usize, size: usize },
    Protect { status: NtStatus, addr: usize, size: usize, old: PageProtection },
    Query { status: NtStatus, info: MemoryBasicInformation },
    Lock { status: NtStatus, addr: usize, size: usize },
    Unlock { status: NtStatus, addr: usize, size: usize },
    Flush { status: NtStatus, addr: usize, size: usize },
    MapView { status: NtStatus, addr: usize, size: usize },
    UnmapView { status: NtStatus },
}

impl RemoteResult {
    pub fn status(&self) -> NtStatus {
        match *self {
            RemoteResult::Alloc { status, .. }
            | RemoteResult::Free { status, .. }
            | RemoteResult::Protect { status, .. }
            | RemoteResult::Query { status, .. }
            | RemoteResult::Lock { status, .. }
            | RemoteResult::Unlock { status, .. }
            | RemoteResult::Flush { status, .. }
            | RemoteResult::MapView { status, .. }
            | RemoteResult::UnmapView { status } => status,
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Fixed-layout request sent to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRequest {
    /// Register a view of a section
    MapView {
        file: FileId,
        base: usize,
        size: usize,
        start: u64,
        image: bool,
    },
    UnmapView {
        base: usize,
    },
    /// Whether two views map the same section
    IsSameMapping {
        base1: usize,
        base2: usize,
    },
    /// Commit state of a reserve-only section at `offset`
    GetMappingCommittedRange {
        base: usize,
        offset: usize,
    },
    AddMappingCommittedRange {
        base: usize,
        offset: usize,
        size: usize,
    },
    QueueApc {
        process: u32,
        call: RemoteCall,
    },
    ReadProcessMemory {
        process: u32,
        addr: usize,
        size: usize,
    },
    WriteProcessMemory {
        process: u32,
        addr: usize,
        data: Vec<u8>,
    },
}

/// Fixed-layout reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerReply {
    Done,
    CommittedRange { size: usize, committed: bool },
    Apc(RemoteResult),
    Bytes(Vec<u8>),
    Written(usize),
}

/// Synchronous request/reply channel to the server
pub trait ServerChannel: Send + Sync {
    fn call(&self, request: ServerRequest) -> Result<ServerReply, NtStatus>;
}

// ============================================================================
// Local Server
// ============================================================================

#[derive(Debug, Clone)]
struct Registration {
    file: FileId,
    size: usize,
    image: bool,
    /// Committed (offset, end) ranges of a reserve-only section
    committed: Vec<(usize, usize)>,
}

/// Single-process server: keeps the view registry, refuses other processes
#[derive(Debug, Default)]
pub struct LocalServer {
    views: Mutex<BTreeMap<usize, Registration>>,
}

impl LocalServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// File registered for the view at `base`
    pub fn registered(&self, base: usize) -> Option<FileId> {
        self.views.lock().get(&base).map(|r| r.file)
    }

    pub fn is_image(&self, base: usize) -> bool {
        self.views.lock().get(&base).is_some_and(|r| r.image)
    }

    pub fn view_count(&self) -> usize {
        self.views.lock().len()
    }

    fn committed_range(reg: &Registration, offset: usize) -> (usize, bool) {
        for &(start, end) in &reg.committed {
            if offset < start {
                return (start - offset, false);
            }
            if offset < end {
                return (end - offset, true);
            }
        }
        (reg.size.saturating_sub(offset), false)
    }

    fn add_committed(reg: &mut Registration, offset: usize, size: usize) {
        let mut start = offset;
        let mut end = (offset + size).min(reg.size);
        let mut merged = Vec::with_capacity(reg.committed.len() + 1);
        for &(s, e) in &reg.committed {
            if e < start || s > end {
                merged.push((s, e));
            } else {
                start = start.min(s);
                end = end.max(e);
            }
        }
        merged.push((start, end));
        merged.sort_unstable();
        reg.committed = merged;
    }
}

impl ServerChannel for LocalServer {
    fn call(&self, request: ServerRequest) -> Result<ServerReply, NtStatus> {
        trace!("server request {:?}", request);
        let mut views = self.views.lock();
        match request {
            ServerRequest::MapView {
                file,
                base,
                size,
                start: _,
                image,
            } => {
                views.insert(
                    base,
                    Registration {
                        file,
                        size,
                        image,
                        committed: Vec::new(),
                    },
                );
                Ok(ServerReply::Done)
            }
            ServerRequest::UnmapView { base } => {
                views.remove(&base).ok_or(NtStatus::NOT_MAPPED_VIEW)?;
                Ok(ServerReply::Done)
            }
            ServerRequest::IsSameMapping { base1, base2 } => {
                let first = views.get(&base1).ok_or(NtStatus::INVALID_ADDRESS)?;
                let second = views.get(&base2).ok_or(NtStatus::INVALID_ADDRESS)?;
                if first.file == second.file {
                    Ok(ServerReply::Done)
                } else {
                    Err(NtStatus::NOT_SAME_DEVICE)
                }
            }
            ServerRequest::GetMappingCommittedRange { base, offset } => {
                let reg = views.get(&base).ok_or(NtStatus::INVALID_PARAMETER)?;
                let (size, committed) = Self::committed_range(reg, offset);
                Ok(ServerReply::CommittedRange { size, committed })
            }
            ServerRequest::AddMappingCommittedRange { base, offset, size } => {
                let reg = views.get_mut(&base).ok_or(NtStatus::INVALID_PARAMETER)?;
                Self::add_committed(reg, offset, size);
                Ok(ServerReply::Done)
            }
            ServerRequest::QueueApc { .. }
            | ServerRequest::ReadProcessMemory { .. }
            | ServerRequest::WriteProcessMemory { .. } => Err(NtStatus::NOT_SUPPORTED),
        }
    }
}
