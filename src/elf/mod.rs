//! ELF32 image views.
//!
//! Just enough of the format to validate and place a statically linked
//! little-endian ARM executable: the 52-byte file header and the 32-byte
//! program headers. No sections, no relocations, no dynamic anything.

use crate::error::BootError;

use core::convert::TryInto;

pub mod loader;

pub const MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u8 = 1;

pub const ET_EXEC: u16 = 2;
pub const EM_ARM: u16 = 40;

pub const PT_LOAD: u32 = 1;

pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;
pub const PF_R: u32 = 0x4;

/// Size of the ELF32 file header on disk.
pub const EHDR_SIZE: usize = 52;
/// Size of an ELF32 program header on disk.
pub const PHDR_SIZE: usize = 32;

/// Sanity cap on the program header count.
pub const MAX_PHDRS: u16 = 64;

/// The first 52 bytes of the image, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfHeader {
    pub ident: [u8; 16],
    pub e_type: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    pub fn parse(bytes: &[u8; EHDR_SIZE]) -> Self {
        macro_rules! e {
            ($ty:tt, $offset:literal) => {
                $ty::from_le_bytes(
                    bytes[$offset..($offset + core::mem::size_of::<$ty>())]
                        .try_into()
                        .unwrap(),
                )
            };
        }

        Self {
            ident: bytes[0..16].try_into().unwrap(),
            e_type: e!(u16, 16),
            machine: e!(u16, 18),
            version: e!(u32, 20),
            entry: e!(u32, 24),
            phoff: e!(u32, 28),
            shoff: e!(u32, 32),
            flags: e!(u32, 36),
            ehsize: e!(u16, 40),
            phentsize: e!(u16, 42),
            phnum: e!(u16, 44),
        }
    }

    /// The acceptance ladder: a statically linked ELF32 LSB ARM executable
    /// with a sane program header table. Each rung gets its own error so
    /// the failure surface says exactly what was wrong.
    pub fn validate(&self) -> Result<(), BootError> {
        if self.ident[0..4] != MAGIC {
            return Err(BootError::NotElf);
        }
        if self.ident[4] != ELFCLASS32 {
            return Err(BootError::NotElf32);
        }
        if self.ident[5] != ELFDATA2LSB {
            return Err(BootError::NotLe);
        }
        if self.ident[6] != EV_CURRENT || self.version != EV_CURRENT as u32 {
            return Err(BootError::BadVersion);
        }
        if self.e_type != ET_EXEC {
            return Err(BootError::NotExec);
        }
        if self.machine != EM_ARM {
            return Err(BootError::NotArm);
        }
        if self.entry == 0 {
            return Err(BootError::NoEntry);
        }
        if self.phoff == 0 || self.phnum == 0 {
            return Err(BootError::NoPhdrs);
        }
        if self.phentsize as usize != PHDR_SIZE {
            return Err(BootError::BadPhdrSize);
        }
        if self.phnum > MAX_PHDRS {
            return Err(BootError::TooManyPhdrs);
        }

        Ok(())
    }
}

/// One 32-byte program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

impl ProgramHeader {
    pub fn parse(bytes: &[u8; PHDR_SIZE]) -> Self {
        macro_rules! e {
            ($offset:literal) => {
                u32::from_le_bytes(bytes[$offset..$offset + 4].try_into().unwrap())
            };
        }

        Self {
            p_type: e!(0),
            offset: e!(4),
            vaddr: e!(8),
            paddr: e!(12),
            filesz: e!(16),
            memsz: e!(20),
            flags: e!(24),
            align: e!(28),
        }
    }

    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }
}
