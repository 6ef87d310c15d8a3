//! Smoke tests against the real address space
//!
//! Every placement goes through no-replace mappings, so these managers
//! never clobber memory they did not place themselves.

#![cfg(target_os = "linux")]

use std::io::Write;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use ntvm::*;

const ME: ProcessHandle = ProcessHandle::Current;
const RW: PageProtection = PageProtection::READWRITE;

fn host_manager() -> VirtualMemoryManager {
    // SAFETY: the manager only touches ranges it placed itself.
    let backend = unsafe { HostBackend::new() };
    let page = backend.page_size();
    VirtualMemoryManager::new(
        VmConfig::wide(page),
        Arc::new(backend),
        Box::new(ReservedAreaList::new()),
        Arc::new(LocalServer::new()),
    )
    .expect("host manager")
}

#[test]
fn test_host_anonymous_lifecycle() {
    let vm = host_manager();
    let (mut addr, mut size) = (0, 0x10000);
    let ty = AllocationType::RESERVE | AllocationType::COMMIT;
    assert_eq!(vm.allocate_virtual_memory(ME, &mut addr, 0, &mut size, ty, RW), NtStatus::SUCCESS);
    assert_eq!(addr % GRANULARITY, 0);

    let mut n = 0;
    assert_eq!(vm.write_process_memory(ME, addr + 0x100, b"hello", &mut n), NtStatus::SUCCESS);
    let mut buf = [0u8; 5];
    assert_eq!(vm.read_process_memory(ME, addr + 0x100, &mut buf, &mut n), NtStatus::SUCCESS);
    assert_eq!(&buf, b"hello");

    let (mut a, mut s) = (addr, 0x1000);
    let mut old = PageProtection::empty();
    assert_eq!(
        vm.protect_virtual_memory(ME, &mut a, &mut s, PageProtection::READONLY, &mut old),
        NtStatus::SUCCESS
    );
    assert_eq!(old, RW);
    let mut info = MemoryBasicInformation::default();
    assert_eq!(vm.query_virtual_memory(ME, addr, &mut info), NtStatus::SUCCESS);
    assert_eq!(info.protect, PageProtection::READONLY);
    assert_eq!(vm.uninterrupted_write_memory(addr, b"x"), NtStatus::INVALID_USER_BUFFER);

    let (mut a, mut s) = (addr, 0);
    assert_eq!(vm.free_virtual_memory(ME, &mut a, &mut s, FreeType::RELEASE), NtStatus::SUCCESS);
    assert_eq!(vm.query_virtual_memory(ME, addr, &mut info), NtStatus::SUCCESS);
    assert_eq!(info.state, MemState::Free);
}

#[test]
fn test_host_file_section() {
    let vm = host_manager();
    let mut file = tempfile::tempfile().expect("temp file");
    let contents: Vec<u8> = (0..0x20000u32).map(|i| (i % 251) as u8).collect();
    file.write_all(&contents).expect("write backing file");

    let section = Section::file(file.as_raw_fd(), contents.len() as u64, PageProtection::READONLY);
    let (mut addr, mut size) = (0, 0);
    let status = vm.map_view_of_section(
        &section,
        ME,
        &mut addr,
        0,
        0x10000,
        &mut size,
        AllocationType::empty(),
        PageProtection::READONLY,
    );
    assert_eq!(status, NtStatus::SUCCESS);
    assert_eq!(size, 0x10000);

    let mut buf = [0u8; 16];
    assert_eq!(vm.uninterrupted_read_memory(addr + 0x20, &mut buf), 16);
    assert_eq!(&buf[..], &contents[0x10020..0x10030]);

    let mut info = MemoryBasicInformation::default();
    vm.query_virtual_memory(ME, addr, &mut info);
    assert_eq!(info.kind, MemType::Mapped);
    assert_eq!(vm.unmap_view_of_section(ME, addr), NtStatus::SUCCESS);
    assert_eq!(vm.view_count(), 0);
}

#[test]
fn test_host_write_watch() {
    let vm = host_manager();
    let page = vm.system_info().page_size;
    let (mut addr, mut size) = (0, 4 * page);
    let ty = AllocationType::RESERVE | AllocationType::COMMIT | AllocationType::WRITE_WATCH;
    assert_eq!(vm.allocate_virtual_memory(ME, &mut addr, 0, &mut size, ty, RW), NtStatus::SUCCESS);

    assert_eq!(vm.uninterrupted_write_memory(addr + 2 * page, &[1, 2, 3]), NtStatus::SUCCESS);
    let mut addresses = [0usize; 4];
    let (mut count, mut granularity) = (4, 0);
    assert_eq!(
        vm.get_write_watch(WriteWatchFlags::RESET, addr, size, &mut addresses, &mut count, &mut granularity),
        NtStatus::SUCCESS
    );
    assert_eq!(&addresses[..count], &[addr + 2 * page]);
    assert_eq!(granularity, page);
}
