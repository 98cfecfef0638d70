//! Two-pass ELF32 segment placement.
//!
//! Pass one walks the program headers and proves the whole layout is
//! acceptable (inside permitted RAM, no overlaps, bounded count) without
//! touching a byte of memory. Pass two copies file data and zeros BSS
//! tails. The split is what gives all-or-nothing behavior: a rejected
//! image leaves RAM exactly as it was.
//!
//! File data moves through a stack-local 512-byte buffer; bigger buffers
//! buy nothing on an SPI-bound transport.

use crate::error::BootError;

use super::{ElfHeader, ProgramHeader, EHDR_SIZE, PF_X, PHDR_SIZE};

use crc::crc32::{self, Hasher32};
use heapless::Vec;

/// Chunk size for the copy and verify loops.
const LOAD_BUFFER_SIZE: usize = 512;

/// Most PT_LOAD segments the loader will place.
pub const MAX_SEGMENTS: usize = 16;

/// Read-at-offset access to the image file.
///
/// The orchestrator injects this (backed by a FAT32 cursor in practice;
/// tests back it with a byte slice).
pub trait ImageRead {
    /// Reads up to `buf.len()` bytes at `offset`. Returns the count read.
    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, BootError>;

    /// Total file size in bytes.
    fn size(&mut self) -> u32;
}

/// Write access to the placement target.
///
/// Production uses [`DirectMemory`]; tests substitute a checked buffer so
/// placement invariants are observable on the host.
pub trait Memory {
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), BootError>;
    fn zero(&mut self, addr: u32, len: u32) -> Result<(), BootError>;
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), BootError>;
}

/// Raw physical-address access.
pub struct DirectMemory(());

impl DirectMemory {
    /// # Safety
    ///
    /// Every address handed to the loader must be backed by real,
    /// writable RAM that nothing else (this loader's own stack and
    /// statics included) is using. Region validation enforces the former;
    /// the platform's memory map has to guarantee the latter.
    pub unsafe fn new() -> Self {
        Self(())
    }
}

impl Memory for DirectMemory {
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), BootError> {
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), addr as usize as *mut u8, data.len());
        }
        Ok(())
    }

    fn zero(&mut self, addr: u32, len: u32) -> Result<(), BootError> {
        unsafe {
            core::ptr::write_bytes(addr as usize as *mut u8, 0, len as usize);
        }
        Ok(())
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), BootError> {
        unsafe {
            core::ptr::copy_nonoverlapping(addr as usize as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }
}

bitflags::bitflags! {
    /// Capabilities of a memory region offered to the loader.
    pub struct MemFlags: u32 {
        const READ  = 0x0001;
        const WRITE = 0x0002;
        const EXEC  = 0x0004;
        const RAM   = 0x0010;
        const FLASH = 0x0020;
    }
}

/// A region segments may be placed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub base: u32,
    pub size: u32,
    pub flags: MemFlags,
}

impl MemRegion {
    /// Whether `[addr, addr + size)` lies entirely inside this region.
    fn contains(&self, addr: u32, size: u32) -> bool {
        let end = match addr.checked_add(size) {
            Some(end) => end,
            None => return false,
        };
        let region_end = self.base + self.size;

        addr >= self.base && end <= region_end
    }
}

fn addr_valid(regions: &[MemRegion], addr: u32, size: u32) -> bool {
    // Placement must land in a region that is both writable and RAM.
    let required = MemFlags::WRITE | MemFlags::RAM;

    regions
        .iter()
        .filter(|r| r.flags.contains(required))
        .any(|r| r.contains(addr, size))
}

fn ranges_overlap(a_start: u32, a_size: u32, b_start: u32, b_size: u32) -> bool {
    let a_end = a_start + a_size;
    let b_end = b_start + b_size;

    a_start < b_end && b_start < a_end
}

/// Loader behavior knobs plus the permitted placement targets.
#[derive(Debug, Clone, Copy)]
pub struct LoaderConfig<'a> {
    pub regions: &'a [MemRegion],
    pub validate_addresses: bool,
    pub zero_bss: bool,
    pub verify: bool,
}

impl<'a> LoaderConfig<'a> {
    pub fn new(regions: &'a [MemRegion]) -> Self {
        Self {
            regions,
            validate_addresses: true,
            zero_bss: true,
            verify: false,
        }
    }
}

/// One placed segment, for diagnostics and the handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub vaddr: u32,
    pub size: u32,
    pub flags: u32,
    pub loaded: bool,
}

/// Everything the handoff builder needs to know about a successful load.
#[derive(Debug, Clone, Default)]
pub struct LoadResult {
    pub entry: u32,
    /// Lowest placed address.
    pub load_base: u32,
    /// One past the highest placed address.
    pub load_end: u32,
    /// Sum of segment memory sizes.
    pub total_size: u32,
    pub segments: Vec<SegmentInfo, MAX_SEGMENTS>,
    pub bytes_copied: u32,
    pub bytes_zeroed: u32,
    /// CRC32 over the image's file bytes; 0 unless verification ran.
    pub image_crc32: u32,
}

fn read_exact<R: ImageRead>(image: &mut R, offset: u32, buf: &mut [u8]) -> Result<(), BootError> {
    match image.read_at(offset, buf) {
        Ok(n) if n == buf.len() => Ok(()),
        Ok(_) => Err(BootError::Read),
        Err(_) => Err(BootError::Read),
    }
}

fn read_phdr<R: ImageRead>(
    image: &mut R,
    ehdr: &ElfHeader,
    index: u16,
) -> Result<ProgramHeader, BootError> {
    let mut buf = [0u8; PHDR_SIZE];
    let offset = ehdr.phoff + index as u32 * PHDR_SIZE as u32;
    read_exact(image, offset, &mut buf)?;
    Ok(ProgramHeader::parse(&buf))
}

/// Validates and places an ELF32 image.
///
/// On error, no memory outside the loader's own stack has been written
/// (validation happens strictly before placement); the one exception is a
/// mid-copy I/O failure, which can leave already-validated segments
/// partially written.
pub fn load<R: ImageRead, M: Memory>(
    config: &LoaderConfig<'_>,
    image: &mut R,
    mem: &mut M,
) -> Result<LoadResult, BootError> {
    let mut result = LoadResult::default();

    // Header.
    let mut ehdr_buf = [0u8; EHDR_SIZE];
    read_exact(image, 0, &mut ehdr_buf)?;

    let ehdr = ElfHeader::parse(&ehdr_buf);
    ehdr.validate()?;

    result.entry = ehdr.entry;
    result.load_base = u32::MAX;
    result.load_end = 0;

    // Pass 1: prove the layout before touching memory.
    let mut accepted: Vec<(u32, u32), MAX_SEGMENTS> = Vec::new();

    for i in 0..ehdr.phnum {
        let phdr = read_phdr(image, &ehdr, i)?;

        if !phdr.is_load() || phdr.memsz == 0 {
            continue;
        }

        // A segment wrapping the address space can never be valid.
        if phdr.vaddr.checked_add(phdr.memsz).is_none() {
            return Err(BootError::AddrInvalid);
        }

        if config.validate_addresses && !addr_valid(config.regions, phdr.vaddr, phdr.memsz) {
            return Err(BootError::AddrInvalid);
        }

        for &(vaddr, memsz) in accepted.iter() {
            if ranges_overlap(phdr.vaddr, phdr.memsz, vaddr, memsz) {
                return Err(BootError::AddrOverlap);
            }
        }

        accepted
            .push((phdr.vaddr, phdr.memsz))
            .map_err(|_| BootError::TooLarge)?;

        result.load_base = result.load_base.min(phdr.vaddr);
        result.load_end = result.load_end.max(phdr.vaddr + phdr.memsz);
        result.total_size += phdr.memsz;
    }

    if accepted.is_empty() {
        return Err(BootError::NoLoadable);
    }

    // Pass 2: copy, zero, optionally verify.
    let mut digest = crc32::Digest::new(crc32::IEEE);

    for i in 0..ehdr.phnum {
        let phdr = read_phdr(image, &ehdr, i)?;

        if !phdr.is_load() || phdr.memsz == 0 {
            continue;
        }

        let info = place_segment(config, image, mem, &phdr, &mut result, &mut digest)?;

        // Capacity matches pass 1's acceptance cap.
        let _ = result.segments.push(info);
    }

    if config.verify {
        result.image_crc32 = digest.sum32();
    }

    Ok(result)
}

fn place_segment<R: ImageRead, M: Memory>(
    config: &LoaderConfig<'_>,
    image: &mut R,
    mem: &mut M,
    phdr: &ProgramHeader,
    result: &mut LoadResult,
    digest: &mut crc32::Digest,
) -> Result<SegmentInfo, BootError> {
    let mut buffer = [0u8; LOAD_BUFFER_SIZE];

    let mut info = SegmentInfo {
        vaddr: phdr.vaddr,
        size: phdr.memsz,
        flags: phdr.flags,
        loaded: false,
    };

    // File-backed bytes.
    let mut file_offset = phdr.offset;
    let mut dest = phdr.vaddr;
    let mut remaining = phdr.filesz;

    while remaining > 0 {
        let chunk = (remaining as usize).min(LOAD_BUFFER_SIZE);

        read_exact(image, file_offset, &mut buffer[..chunk])?;
        mem.write(dest, &buffer[..chunk])?;

        file_offset += chunk as u32;
        dest += chunk as u32;
        remaining -= chunk as u32;
        result.bytes_copied += chunk as u32;
    }

    // BSS tail.
    if config.zero_bss && phdr.memsz > phdr.filesz {
        let bss = phdr.memsz - phdr.filesz;
        mem.zero(dest, bss)?;
        result.bytes_zeroed += bss;
    }

    // Optional read-back comparison (file bytes only; the zeroed tail is
    // not re-checked).
    if config.verify && phdr.filesz > 0 {
        let mut placed = [0u8; LOAD_BUFFER_SIZE];

        let mut file_offset = phdr.offset;
        let mut addr = phdr.vaddr;
        let mut remaining = phdr.filesz;

        while remaining > 0 {
            let chunk = (remaining as usize).min(LOAD_BUFFER_SIZE);

            read_exact(image, file_offset, &mut buffer[..chunk])?;
            mem.read(addr, &mut placed[..chunk])?;

            if buffer[..chunk] != placed[..chunk] {
                return Err(BootError::LoadFailed);
            }

            digest.write(&buffer[..chunk]);

            file_offset += chunk as u32;
            addr += chunk as u32;
            remaining -= chunk as u32;
        }
    }

    info.loaded = true;
    Ok(info)
}

/// Post-load checks on a successful result.
///
/// The entry point must land inside the loaded span. A missing
/// executable-flagged segment is only worth a warning; some toolchains
/// never set PF_X.
pub fn validate_loaded(result: &LoadResult) -> Result<(), BootError> {
    if result.entry < result.load_base || result.entry >= result.load_end {
        return Err(BootError::NoEntry);
    }

    if !result.segments.iter().any(|s| s.flags & PF_X != 0) {
        log::warn!("elf: no executable segment flagged; continuing anyway");
    }

    Ok(())
}
