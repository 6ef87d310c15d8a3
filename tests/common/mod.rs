//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use ntvm::*;

pub const PAGE: usize = 0x1000;
pub const ME: ProcessHandle = ProcessHandle::Current;

pub const SCN_CODE: u32 = 0x0000_0020;
pub const SCN_EXECUTE: u32 = 0x2000_0000;
pub const SCN_READ: u32 = 0x4000_0000;
pub const SCN_WRITE: u32 = 0x8000_0000;
pub const CODE: u32 = SCN_CODE | SCN_READ | SCN_EXECUTE;
pub const DATA: u32 = SCN_READ | SCN_WRITE;

/// A manager over the simulated backend, plus handles to its collaborators
pub struct Fixture {
    pub vm: VirtualMemoryManager,
    pub sim: Arc<SimulatedBackend>,
    pub server: Arc<LocalServer>,
}

pub fn fixture_with(config: VmConfig, reserved: ReservedAreaList) -> Fixture {
    let sim = Arc::new(SimulatedBackend::new(PAGE));
    let server = Arc::new(LocalServer::new());
    let vm = VirtualMemoryManager::new(config, sim.clone(), Box::new(reserved), server.clone())
        .expect("manager");
    Fixture { vm, sim, server }
}

pub fn fixture() -> Fixture {
    fixture_with(VmConfig::wide(PAGE), ReservedAreaList::new())
}

impl Fixture {
    pub fn alloc(&self, addr: usize, size: usize, ty: AllocationType, prot: PageProtection) -> Result<(usize, usize), NtStatus> {
        let (mut a, mut s) = (addr, size);
        match self.vm.allocate_virtual_memory(ME, &mut a, 0, &mut s, ty, prot) {
            NtStatus::SUCCESS => Ok((a, s)),
            status => Err(status),
        }
    }

    pub fn release(&self, addr: usize) -> NtStatus {
        let (mut a, mut s) = (addr, 0);
        self.vm.free_virtual_memory(ME, &mut a, &mut s, FreeType::RELEASE)
    }

    pub fn protect(&self, addr: usize, size: usize, prot: PageProtection) -> Result<PageProtection, NtStatus> {
        let (mut a, mut s) = (addr, size);
        let mut old = PageProtection::empty();
        match self.vm.protect_virtual_memory(ME, &mut a, &mut s, prot, &mut old) {
            NtStatus::SUCCESS => Ok(old),
            status => Err(status),
        }
    }

    pub fn query(&self, addr: usize) -> MemoryBasicInformation {
        let mut info = MemoryBasicInformation::default();
        assert_eq!(self.vm.query_virtual_memory(ME, addr, &mut info), NtStatus::SUCCESS);
        info
    }

    pub fn map_section(&self, section: &Section, addr: usize, prot: PageProtection) -> Result<(usize, usize), NtStatus> {
        let (mut a, mut s) = (addr, 0);
        let status = self
            .vm
            .map_view_of_section(section, ME, &mut a, 0, 0, &mut s, AllocationType::empty(), prot);
        if status.is_success() {
            Ok((a, s))
        } else {
            Err(status)
        }
    }

    pub fn read(&self, addr: usize, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.sim.read_memory(addr, &mut buf).expect("readable");
        buf
    }
}

// ============================================================================
// PE Images
// ============================================================================

/// One section of a test image
pub struct Sec {
    pub va: u32,
    pub vsize: u32,
    pub raw: u32,
    pub raw_size: u32,
    pub flags: u32,
}

/// PE32+ image with headers in the first 0x400 bytes
///
/// Raw data of section `i` is filled with `0x10 + i`.
pub fn build_image(base: u64, size: u32, align: u32, entry: u32, secs: &[Sec]) -> Vec<u8> {
    let file_len = secs
        .iter()
        .map(|s| (s.raw + s.raw_size) as usize)
        .max()
        .unwrap_or(0)
        .max(0x400);
    let mut f = vec![0u8; file_len];
    f[0..2].copy_from_slice(b"MZ");
    f[0x3c..0x40].copy_from_slice(&0x80u32.to_le_bytes());

    let nt = 0x80;
    f[nt..nt + 4].copy_from_slice(b"PE\0\0");
    f[nt + 4..nt + 6].copy_from_slice(&0x8664u16.to_le_bytes());
    f[nt + 6..nt + 8].copy_from_slice(&(secs.len() as u16).to_le_bytes());
    f[nt + 20..nt + 22].copy_from_slice(&240u16.to_le_bytes());

    let opt = nt + 24;
    f[opt..opt + 2].copy_from_slice(&0x20bu16.to_le_bytes());
    f[opt + 16..opt + 20].copy_from_slice(&entry.to_le_bytes());
    f[opt + 24..opt + 32].copy_from_slice(&base.to_le_bytes());
    f[opt + 32..opt + 36].copy_from_slice(&align.to_le_bytes());
    f[opt + 36..opt + 40].copy_from_slice(&align.min(0x200).to_le_bytes());
    f[opt + 56..opt + 60].copy_from_slice(&size.to_le_bytes());
    f[opt + 60..opt + 64].copy_from_slice(&0x400u32.to_le_bytes());

    let table = opt + 240;
    for (i, s) in secs.iter().enumerate() {
        let h = table + i * 40;
        f[h..h + 6].copy_from_slice(b".sect0");
        f[h + 5] = b'0' + i as u8;
        f[h + 8..h + 12].copy_from_slice(&s.vsize.to_le_bytes());
        f[h + 12..h + 16].copy_from_slice(&s.va.to_le_bytes());
        f[h + 16..h + 20].copy_from_slice(&s.raw_size.to_le_bytes());
        f[h + 20..h + 24].copy_from_slice(&s.raw.to_le_bytes());
        f[h + 36..h + 40].copy_from_slice(&s.flags.to_le_bytes());
        for b in &mut f[s.raw as usize..(s.raw + s.raw_size) as usize] {
            *b = 0x10 + i as u8;
        }
    }
    f
}

/// Header page, one read-execute page and one read-write page
pub fn two_section_image(base: u64) -> Vec<u8> {
    build_image(
        base,
        0x3000,
        0x1000,
        0x1010,
        &[
            Sec { va: 0x1000, vsize: 0x800, raw: 0x400, raw_size: 0x200, flags: CODE },
            Sec { va: 0x2000, vsize: 0x1000, raw: 0x600, raw_size: 0x200, flags: DATA },
        ],
    )
}
