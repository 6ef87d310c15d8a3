//! Section Mapping - PE Images and Data Files
//!
//! ## Key Operations
//!
//! - [`ImageInfo::parse`]: read the DOS/NT headers and section table
//!   through a bounded reader
//! - `map_image`: lay a PE image out section by section, or flat when
//!   its sections are not page aligned
//! - `map_data_section`: map a window of a data file or paging section
//! - `create_builtin_view`: record an image someone else already mapped
//!
//! Nothing in the image is trusted to size a buffer: headers are read
//! into fixed arrays and the section table is capped at
//! [`MAX_SECTIONS`] entries. Any failure once the view exists tears the
//! whole view down.

use std::os::fd::RawFd;
use std::sync::Arc;

use heapless::Vec as BoundedVec;
use log::{error, trace, warn};

use super::pmap::{Share, UnixProt};
use super::vm_prot::{IMAGE_SCN_MEM_SHARED, IMAGE_SCN_MEM_WRITE};
use super::{VProt, ViewId, ViewKind, VmState};
use crate::error::{OsError, VmError, VmResult};
use crate::server::ServerRequest;
use crate::types::{PageProtection, Section, SectionAttributes};

/// Largest section table accepted
pub const MAX_SECTIONS: usize = 96;

const DOS_MAGIC: u16 = 0x5a4d;
const NT_SIGNATURE: u32 = 0x0000_4550;
const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;
const DOS_HEADER_SIZE: usize = 64;
const FILE_HEADER_END: usize = 24;
const OPTIONAL_HEADER_MAX: usize = 240;
const SECTION_HEADER_SIZE: usize = 40;
/// File positions are rounded to sectors regardless of the file alignment
const SECTOR_ALIGN: usize = 0x1ff;

// ============================================================================
// Header Parsing
// ============================================================================

fn le16(bytes: &[u8], off: usize) -> VmResult<u16> {
    match bytes.get(off..off + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(VmError::InvalidImageFormat),
    }
}

fn le32(bytes: &[u8], off: usize) -> VmResult<u32> {
    match bytes.get(off..off + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(VmError::InvalidImageFormat),
    }
}

fn le64(bytes: &[u8], off: usize) -> VmResult<u64> {
    let lo = le32(bytes, off)? as u64;
    let hi = le32(bytes, off + 4)? as u64;
    Ok(lo | (hi << 32))
}

/// One entry of the section table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageSection {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl ImageSection {
    fn parse(raw: &[u8]) -> VmResult<Self> {
        let mut name = [0u8; 8];
        name.copy_from_slice(raw.get(..8).ok_or(VmError::InvalidImageFormat)?);
        Ok(Self {
            name,
            virtual_size: le32(raw, 8)?,
            virtual_address: le32(raw, 12)?,
            size_of_raw_data: le32(raw, 16)?,
            pointer_to_raw_data: le32(raw, 20)?,
            characteristics: le32(raw, 36)?,
        })
    }

    fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    fn is_shared_write(&self) -> bool {
        self.characteristics & IMAGE_SCN_MEM_SHARED != 0
            && self.characteristics & IMAGE_SCN_MEM_WRITE != 0
    }
}

/// Image geometry taken from the PE headers
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub image_base: u64,
    pub entry_point: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub image_size: u32,
    pub header_size: u32,
    /// Import directory as `(rva, size)`
    pub imports: Option<(u32, u32)>,
    pub sections: BoundedVec<ImageSection, MAX_SECTIONS>,
    /// End of the NT headers, from the start of the image
    nt_end: usize,
    /// End of the section table
    table_end: usize,
}

impl ImageInfo {
    /// Parse headers through `read(offset, buf)`, which must fill `buf`
    pub fn parse(read: &mut dyn FnMut(usize, &mut [u8]) -> VmResult<()>) -> VmResult<Self> {
        let mut dos = [0u8; DOS_HEADER_SIZE];
        read(0, &mut dos)?;
        if le16(&dos, 0)? != DOS_MAGIC {
            return Err(VmError::InvalidImageFormat);
        }
        let nt_offset = le32(&dos, 0x3c)? as usize;

        let mut nt = [0u8; FILE_HEADER_END + OPTIONAL_HEADER_MAX];
        read(nt_offset, &mut nt[..FILE_HEADER_END])?;
        if le32(&nt, 0)? != NT_SIGNATURE {
            return Err(VmError::InvalidImageFormat);
        }
        let section_count = le16(&nt, 6)? as usize;
        let optional_size = le16(&nt, 20)? as usize;
        if section_count > MAX_SECTIONS {
            warn!("too many sections ({})", section_count);
            return Err(VmError::InvalidImageFormat);
        }

        let optional_len = optional_size.min(OPTIONAL_HEADER_MAX);
        read(nt_offset + FILE_HEADER_END, &mut nt[FILE_HEADER_END..FILE_HEADER_END + optional_len])?;
        let opt = &nt[FILE_HEADER_END..FILE_HEADER_END + optional_len];
        let (image_base, directories, full_size) = match le16(opt, 0)? {
            PE32_MAGIC => (le32(opt, 28)? as u64, 96, 224),
            PE32_PLUS_MAGIC => (le64(opt, 24)?, 112, 240),
            _ => return Err(VmError::InvalidImageFormat),
        };
        let imports = match (le32(opt, directories + 8), le32(opt, directories + 12)) {
            (Ok(rva), Ok(size)) if rva != 0 && size != 0 => Some((rva, size)),
            _ => None,
        };

        let table = nt_offset + FILE_HEADER_END + optional_size;
        let mut sections = BoundedVec::new();
        let mut raw = [0u8; SECTION_HEADER_SIZE];
        for i in 0..section_count {
            read(table + i * SECTION_HEADER_SIZE, &mut raw)?;
            sections
                .push(ImageSection::parse(&raw)?)
                .map_err(|_| VmError::InvalidImageFormat)?;
        }

        Ok(Self {
            image_base,
            entry_point: le32(opt, 16)?,
            section_alignment: le32(opt, 32)?,
            file_alignment: le32(opt, 36)?,
            image_size: le32(opt, 56)?,
            header_size: le32(opt, 60)?,
            imports,
            sections,
            nt_end: nt_offset + FILE_HEADER_END + full_size,
            table_end: table + section_count * SECTION_HEADER_SIZE,
        })
    }
}

/// Where a section mapping landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedSection {
    pub base: usize,
    pub size: usize,
    /// Image placed at its preferred base; always true for data sections
    pub at_base: bool,
}

// ============================================================================
// Image Mapping
// ============================================================================

impl VmState {
    /// `round_page(addr + size) - trunc_page(addr)`
    fn round_size(&self, addr: usize, size: usize) -> usize {
        self.round_page(addr + size) - self.trunc_page(addr)
    }

    /// Fill `[addr, addr+len)` with zeros, lifting protection as needed
    fn zero_fill(&self, addr: usize, len: usize) -> VmResult<()> {
        if len == 0 {
            return Ok(());
        }
        let start = self.trunc_page(addr);
        let _ = self.backend.protect(start, self.round_page(addr + len) - start, UnixProt::RW);
        let zeros = vec![0u8; len];
        self.backend.write_memory(addr, &zeros)?;
        Ok(())
    }

    fn map_pe_header(&self, base: usize, size: usize, fd: RawFd, removable: &mut bool) -> VmResult<()> {
        if size == 0 {
            return Err(VmError::InvalidImageFormat);
        }
        let len = self.round_page(size);
        if !*removable {
            match self.backend.map_file(base, len, UnixProt::RWX, Share::Private, fd, 0) {
                Ok(()) => return Ok(()),
                Err(OsError::PermissionDenied) => warn!("noexec file system, falling back to read"),
                Err(OsError::NoDevice) => {
                    warn!("file system doesn't support mmap, falling back to read")
                }
                Err(err) => return Err(err.into()),
            }
            *removable = true;
        }
        // Protections are set properly once the sections are in.
        let _ = self.backend.protect(base, len, UnixProt::RW);
        self.backend.read_file_to(fd, 0, base, size)?;
        Ok(())
    }

    fn map_image_into_view(
        &mut self,
        id: ViewId,
        image: &ImageInfo,
        fd: RawFd,
        shared_fd: Option<RawFd>,
        file_size: usize,
        removable: bool,
    ) -> VmResult<()> {
        let page_mask = self.config.page_mask();
        let view = self.view(id)?;
        let (base, mut total) = (view.base, view.size);
        let mut removable = removable;

        let header_size = (image.header_size as usize).min(file_size);
        if header_size > total {
            return Err(VmError::InvalidImageFormat);
        }
        self.map_pe_header(base, header_size, fd, &mut removable)?;
        let header_end = self.round_page(header_size);
        self.zero_fill(base + header_size, header_end - header_size)?;
        if image.nt_end > header_end || image.table_end > header_end {
            return Err(VmError::InvalidImageFormat);
        }

        if image.section_alignment as usize & page_mask != 0 {
            // Unaligned sections: the file is mapped as it is.
            total = total.min(self.round_page(file_size));
            let flat = VProt::COMMITTED | VProt::READ | VProt::WRITECOPY;
            self.map_file_into_view(id, fd, 0, total, 0, flat, removable)
                .map_err(|_| VmError::InvalidImageFormat)?;
            if image.file_alignment != image.section_alignment {
                return Err(VmError::InvalidImageFormat);
            }
            if image
                .sections
                .iter()
                .any(|s| s.virtual_address != s.pointer_to_raw_data)
            {
                return Err(VmError::InvalidImageFormat);
            }
            self.set_prot(id, base, total, flat | VProt::EXEC);
            return Ok(());
        }

        let mut pos: u64 = 0;
        for sec in &image.sections {
            let va = sec.virtual_address as usize;
            let map_size = if sec.virtual_size == 0 {
                self.round_page(sec.size_of_raw_data as usize)
            } else {
                self.round_page(sec.virtual_size as usize)
            };
            let raw_ptr = sec.pointer_to_raw_data as usize;
            let file_start = raw_ptr & !SECTOR_ALIGN;
            let file_len =
                ((sec.size_of_raw_data as usize + (raw_ptr & SECTOR_ALIGN) + SECTOR_ALIGN) & !SECTOR_ALIGN)
                    .min(map_size);

            let end = va.checked_add(self.round_size(va, map_size));
            if va > total || end.map_or(true, |end| end > total) {
                warn!("section {} too large ({:#x}+{:#x}/{:#x})", sec.name(), va, map_size, total);
                return Err(VmError::InvalidImageFormat);
            }

            if sec.is_shared_write() {
                trace!(
                    "mapping shared section {} at {:#x} off {:#x} ({:#x}) size {:#x} ({:#x})",
                    sec.name(),
                    base + va,
                    raw_ptr,
                    pos,
                    file_len,
                    map_size
                );
                let Some(shared) = shared_fd else {
                    error!("no shared backing for section {}", sec.name());
                    return Err(VmError::InvalidImageFormat);
                };
                let rw = VProt::COMMITTED | VProt::READ | VProt::WRITE;
                if self.map_file_into_view(id, shared, va, map_size, pos, rw, false).is_err() {
                    error!("could not map shared section {}", sec.name());
                    return Err(VmError::InvalidImageFormat);
                }
                // The import table is patched per process.
                if let Some((rva, size)) = image.imports {
                    let rva = rva as usize;
                    if rva >= va && rva < va + map_size {
                        let start = rva & !page_mask;
                        let stop = (start + self.round_size(rva, size as usize)).min(va + map_size);
                        if stop > start {
                            let cow = VProt::COMMITTED | VProt::READ | VProt::WRITECOPY;
                            let offset = pos + (start - va) as u64;
                            if let Err(err) = self.map_file_into_view(id, shared, start, stop - start, offset, cow, false) {
                                warn!("import pages {:#x}-{:#x} stay shared: {}", start, stop, err);
                            }
                        }
                    }
                }
                pos += map_size as u64;
                continue;
            }

            trace!(
                "mapping section {} at {:#x} off {:#x} size {:#x} virt {:#x} flags {:#x}",
                sec.name(),
                base + va,
                raw_ptr,
                sec.size_of_raw_data,
                sec.virtual_size,
                sec.characteristics
            );
            if raw_ptr == 0 || file_len == 0 {
                continue;
            }
            let file_end = file_start + file_len;
            let cow = VProt::COMMITTED | VProt::READ | VProt::WRITECOPY;
            if raw_ptr >= file_size
                || file_end > (file_size + SECTOR_ALIGN) & !SECTOR_ALIGN
                || self
                    .map_file_into_view(id, fd, va, file_len, file_start as u64, cow, removable)
                    .is_err()
            {
                error!("could not map section {}, file probably truncated", sec.name());
                return Err(VmError::InvalidImageFormat);
            }

            if file_len & page_mask != 0 {
                let end = self.round_page(file_len).min(map_size);
                trace!("clearing {:#x} - {:#x}", base + va + file_len, base + va + end);
                self.zero_fill(base + va + file_len, end - file_len)?;
            }
        }

        self.set_prot(id, base, header_end, VProt::COMMITTED | VProt::READ);
        for sec in &image.sections {
            let va = sec.virtual_address as usize;
            let len = if sec.virtual_size != 0 {
                sec.virtual_size
            } else {
                sec.size_of_raw_data
            };
            let size = self.round_size(va, len as usize);
            let mut vprot = VProt::COMMITTED | VProt::from_section(sec.characteristics, false);
            let entry = image.entry_point as usize;
            if entry >= va && entry < va + size {
                // Entry point patched into a data section.
                vprot |= VProt::EXEC;
            }
            if !self.set_prot(id, base + va, size, vprot) && vprot.contains(VProt::EXEC) {
                error!(
                    "failed to set {:#x} protection on section {}, noexec filesystem?",
                    sec.characteristics,
                    sec.name()
                );
            }
        }
        Ok(())
    }

    /// Map a PE image from `fd`
    pub(crate) fn map_image(
        &mut self,
        fd: RawFd,
        shared_fd: Option<RawFd>,
        top_down: bool,
        zero_bits: u32,
        removable: bool,
    ) -> VmResult<MappedSection> {
        let backend = Arc::clone(&self.backend);
        let file_size = usize::try_from(backend.file_size(fd)?).map_err(|_| VmError::InvalidParameter)?;
        let image = ImageInfo::parse(&mut |offset, buf| match backend.read_file(fd, offset as u64, buf) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(_) => Err(VmError::InvalidImageFormat),
            Err(err) => Err(err.into()),
        })?;
        let total = self.round_page(image.image_size as usize);
        if total == 0 {
            return Err(VmError::InvalidImageFormat);
        }

        let vprot = VProt::COMMITTED | VProt::READ | VProt::EXEC | VProt::WRITECOPY;
        let kind = ViewKind::IMAGE | ViewKind::FILE;
        let preferred = usize::try_from(image.image_base).ok();
        let placed = match preferred {
            Some(base) if base >= self.address_space_start && base & self.config.page_mask() == 0 => {
                self.map_view(Some(base), total, top_down, vprot, kind, zero_bits).ok()
            }
            _ => None,
        };
        let id = match placed {
            Some(id) => id,
            None => self.map_view(None, total, top_down, vprot, kind, zero_bits)?,
        };
        let base = self.view(id)?.base;
        trace!("mapped PE file at {:#x}-{:#x}", base, base + total);

        let registered = self
            .map_image_into_view(id, &image, fd, shared_fd, file_size, removable)
            .and_then(|()| {
                let file = backend.file_id(fd)?;
                self.server
                    .call(ServerRequest::MapView {
                        file,
                        base,
                        size: total,
                        start: 0,
                        image: true,
                    })
                    .map_err(VmError::Server)?;
                Ok(())
            });
        if let Err(err) = registered {
            self.delete_view(id);
            return Err(err);
        }
        Ok(MappedSection {
            base,
            size: total,
            at_base: preferred == Some(base),
        })
    }

    // ========================================================================
    // Data Sections
    // ========================================================================

    /// Map `size` bytes of a data or paging section from `offset`
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn map_data_section(
        &mut self,
        section: &Section,
        base: Option<usize>,
        size: usize,
        offset: u64,
        protect: PageProtection,
        top_down: bool,
        zero_bits: u32,
    ) -> VmResult<MappedSection> {
        if offset >= section.size {
            return Err(VmError::InvalidParameter);
        }
        let remaining = section.size - offset;
        let size = if size != 0 {
            if size as u64 > remaining {
                return Err(VmError::InvalidViewSize);
            }
            size
        } else {
            usize::try_from(remaining).map_err(|_| VmError::InvalidParameter)?
        };
        let size = self.round_page(size);
        if size == 0 {
            return Err(VmError::InvalidParameter);
        }

        let kind = ViewKind::from_bits_truncate(section.attributes.bits());
        let mut vprot = VProt::from_win32(protect, false)?;
        if !section.attributes.contains(SectionAttributes::RESERVE) {
            vprot |= VProt::COMMITTED;
        }
        let id = self.map_view(base, size, top_down, vprot, kind, zero_bits)?;
        let view_base = self.view(id)?.base;
        trace!("fd {} size {:#x} offset {:#x}", section.fd, size, offset);

        let removable = false;
        let mapped = self
            .map_file_into_view(id, section.fd, 0, size, offset, vprot, removable)
            .and_then(|()| {
                let file = self.backend.file_id(section.fd)?;
                self.server
                    .call(ServerRequest::MapView {
                        file,
                        base: view_base,
                        size,
                        start: offset,
                        image: false,
                    })
                    .map_err(VmError::Server)?;
                Ok(())
            });
        if let Err(err) = mapped {
            error!("mapping {:#x} {:#x} {:#x} failed", view_base, size, offset);
            self.delete_view(id);
            return Err(err);
        }
        Ok(MappedSection {
            base: view_base,
            size,
            at_base: true,
        })
    }

    // ========================================================================
    // Builtin Images
    // ========================================================================

    /// Record an image already mapped at `module` as a system view
    pub(crate) fn create_builtin_view(&mut self, module: usize) -> VmResult<ViewId> {
        let backend = Arc::clone(&self.backend);
        let image = ImageInfo::parse(&mut |offset, buf| {
            backend
                .read_memory(module + offset, buf)
                .map_err(|_| VmError::InvalidImageFormat)
        })?;
        let base = self.trunc_page(module);
        let size = self.round_size(module, image.image_size as usize);
        let kind = ViewKind::IMAGE | ViewKind::FILE | ViewKind::SYSTEM;
        let vprot = VProt::COMMITTED | VProt::READ | VProt::WRITECOPY | VProt::EXEC;
        let id = self.create_view(base, size, vprot, kind)?;
        trace!("created {:#x}-{:#x}", base, base + size);

        // The header is always read-only.
        let page = self.page_size();
        self.pages.set_range(base, page, VProt::COMMITTED | VProt::READ);
        for sec in &image.sections {
            let va = sec.virtual_address as usize;
            if va >= size {
                continue;
            }
            let len = (sec.virtual_size as usize).min(size - va);
            let flags = VProt::COMMITTED | VProt::from_section(sec.characteristics, true);
            self.pages.set_range(base + va, len, flags);
        }
        Ok(id)
    }
}
