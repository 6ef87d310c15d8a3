//! Cross-process operations through a loopback server
//!
//! The caller's manager ships every operation on process 7 to the
//! server, which runs it against a second manager standing in for the
//! target process.

mod common;

use std::sync::Arc;

use common::*;
use ntvm::*;

const TARGET: ProcessHandle = ProcessHandle::Other(7);
const RW: PageProtection = PageProtection::READWRITE;

/// Server that owns the target process's manager
struct Loopback {
    target: Arc<VirtualMemoryManager>,
    local: LocalServer,
}

impl ServerChannel for Loopback {
    fn call(&self, request: ServerRequest) -> Result<ServerReply, NtStatus> {
        match request {
            ServerRequest::QueueApc { process: 7, call } => Ok(ServerReply::Apc(self.target.execute_remote(call))),
            ServerRequest::ReadProcessMemory { process: 7, addr, size } => {
                let mut buf = vec![0u8; size];
                let mut read = 0;
                self.target.read_process_memory(ME, addr, &mut buf, &mut read);
                buf.truncate(read);
                Ok(ServerReply::Bytes(buf))
            }
            ServerRequest::WriteProcessMemory { process: 7, addr, data } => {
                let mut written = 0;
                match self.target.write_process_memory(ME, addr, &data, &mut written) {
                    NtStatus::SUCCESS => Ok(ServerReply::Written(written)),
                    status => Err(status),
                }
            }
            other => self.local.call(other),
        }
    }
}

struct Pair {
    caller: VirtualMemoryManager,
    target: Arc<VirtualMemoryManager>,
    target_sim: Arc<SimulatedBackend>,
}

fn pair() -> Pair {
    let target_sim = Arc::new(SimulatedBackend::new(PAGE));
    let target = Arc::new(
        VirtualMemoryManager::new(
            VmConfig::wide(PAGE),
            target_sim.clone(),
            Box::new(ReservedAreaList::new()),
            Arc::new(LocalServer::new()),
        )
        .expect("target manager"),
    );
    let server = Arc::new(Loopback {
        target: target.clone(),
        local: LocalServer::new(),
    });
    let caller = VirtualMemoryManager::new(
        VmConfig::wide(PAGE),
        Arc::new(SimulatedBackend::new(PAGE)),
        Box::new(ReservedAreaList::new()),
        server,
    )
    .expect("caller manager");
    Pair {
        caller,
        target,
        target_sim,
    }
}

#[test]
fn test_remote_allocate_protect_query_free() {
    let p = pair();
    let (mut addr, mut size) = (0, 0x3000);
    let ty = AllocationType::RESERVE | AllocationType::COMMIT;
    assert_eq!(
        p.caller.allocate_virtual_memory(TARGET, &mut addr, 0, &mut size, ty, RW),
        NtStatus::SUCCESS
    );
    assert_eq!(size, 0x3000);
    assert_eq!(p.caller.view_count(), 0);
    assert_eq!(p.target.view_count(), 1);

    let (mut a, mut s) = (addr, 0x1000);
    let mut old = PageProtection::empty();
    assert_eq!(
        p.caller
            .protect_virtual_memory(TARGET, &mut a, &mut s, PageProtection::READONLY, &mut old),
        NtStatus::SUCCESS
    );
    assert_eq!(old, RW);

    let mut info = MemoryBasicInformation::default();
    assert_eq!(p.caller.query_virtual_memory(TARGET, addr, &mut info), NtStatus::SUCCESS);
    assert_eq!(info.protect, PageProtection::READONLY);
    assert_eq!(info.allocation_base, addr);

    let (mut a, mut s) = (addr, 0x1000);
    assert_eq!(p.caller.lock_virtual_memory(TARGET, &mut a, &mut s), NtStatus::SUCCESS);
    assert!(p.target_sim.is_locked(addr));
    assert_eq!(p.caller.unlock_virtual_memory(TARGET, &mut a, &mut s), NtStatus::SUCCESS);

    let (mut a, mut s) = (addr + PAGE, 0);
    assert_eq!(
        p.caller.free_virtual_memory(TARGET, &mut a, &mut s, FreeType::RELEASE),
        NtStatus::INVALID_PARAMETER
    );
    let (mut a, mut s) = (addr, 0);
    assert_eq!(
        p.caller.free_virtual_memory(TARGET, &mut a, &mut s, FreeType::RELEASE),
        NtStatus::SUCCESS
    );
    assert_eq!(p.target.view_count(), 0);
}

#[test]
fn test_remote_section_views() {
    let p = pair();
    let fd = p.target_sim.create_file(&[4u8; 0x10000]);
    let section = Section::file(fd, 0x10000, RW);
    let (mut addr, mut size) = (0, 0);
    assert_eq!(
        p.caller.map_view_of_section(&section, TARGET, &mut addr, 0, 0, &mut size, AllocationType::empty(), RW),
        NtStatus::SUCCESS
    );
    assert_eq!(size, 0x10000);
    assert_eq!(p.target.view_count(), 1);

    let (mut a, mut s) = (addr, 0);
    assert_eq!(p.caller.flush_virtual_memory(TARGET, &mut a, &mut s), NtStatus::SUCCESS);
    assert_eq!(s, 0x10000);

    assert_eq!(p.caller.unmap_view_of_section(TARGET, addr), NtStatus::SUCCESS);
    assert_eq!(p.target.view_count(), 0);
}

#[test]
fn test_remote_memory_copies() {
    let p = pair();
    let (mut addr, mut size) = (0, 0x2000);
    let ty = AllocationType::RESERVE | AllocationType::COMMIT;
    assert_eq!(
        p.target.allocate_virtual_memory(ME, &mut addr, 0, &mut size, ty, RW),
        NtStatus::SUCCESS
    );

    let mut written = 0;
    assert_eq!(
        p.caller.write_process_memory(TARGET, addr + 0x10, b"remote", &mut written),
        NtStatus::SUCCESS
    );
    assert_eq!(written, 6);

    let mut buf = [0u8; 6];
    let mut read = 0;
    assert_eq!(
        p.caller.read_process_memory(TARGET, addr + 0x10, &mut buf, &mut read),
        NtStatus::SUCCESS
    );
    assert_eq!(&buf, b"remote");

    let mut big = vec![0u8; 0x3000];
    assert_eq!(
        p.caller.read_process_memory(TARGET, addr, &mut big, &mut read),
        NtStatus::PARTIAL_COPY
    );
    assert_eq!(read, 0);
}
