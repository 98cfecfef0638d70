//! Shared test scaffolding: a RAM-backed block device, a minimal FAT32
//! image builder, and an ELF32 image builder.

#![allow(dead_code)]

use generic_array::GenericArray;

use mboot::elf::loader::{ImageRead, Memory};
use mboot::error::BootError;
use mboot::storage::{BlockDevice, Sector};

// ---------------------------------------------------------------------------
// Block device over a Vec of sectors.

pub struct RamDisk {
    pub sectors: Vec<[u8; 512]>,
}

impl RamDisk {
    pub fn new(count: usize) -> Self {
        Self {
            sectors: vec![[0u8; 512]; count],
        }
    }
}

impl BlockDevice for RamDisk {
    type Error = &'static str;

    fn read_sector(&mut self, lba: u32, buf: &mut Sector) -> Result<(), Self::Error> {
        let s = self.sectors.get(lba as usize).ok_or("lba out of range")?;
        buf.as_mut_slice().copy_from_slice(s);
        Ok(())
    }

    fn sector_count(&self) -> u32 {
        self.sectors.len() as u32
    }
}

/// A device whose reads always fail, for the error paths.
pub struct BrokenDisk;

impl BlockDevice for BrokenDisk {
    type Error = &'static str;

    fn read_sector(&mut self, _lba: u32, _buf: &mut Sector) -> Result<(), Self::Error> {
        Err("io")
    }

    fn sector_count(&self) -> u32 {
        0
    }
}

// ---------------------------------------------------------------------------
// FAT32 image builder.
//
// Fixed geometry: 2 reserved sectors, 1 FAT of 16 sectors (2048 cluster
// entries), root directory at cluster 2, configurable sectors-per-cluster.

const RESERVED_SECTORS: u32 = 2;
const SECTORS_PER_FAT: u32 = 16;
const CLUSTER_ENTRIES: usize = (SECTORS_PER_FAT as usize * 512) / 4;

const EOC: u32 = 0x0FFF_FFFF;

pub struct FatImage {
    spc: u32,
    fat: Vec<u32>,
    data: Vec<Vec<u8>>,
    short_counter: u32,
}

impl FatImage {
    pub fn new(sectors_per_cluster: u32) -> Self {
        let mut img = Self {
            spc: sectors_per_cluster,
            fat: vec![0; CLUSTER_ENTRIES],
            data: vec![Vec::new(); CLUSTER_ENTRIES],
            short_counter: 0,
        };
        img.fat[0] = 0x0FFF_FFF8;
        img.fat[1] = EOC;

        let root = img.alloc();
        assert_eq!(root, 2);

        img
    }

    pub fn cluster_size(&self) -> u32 {
        self.spc * 512
    }

    pub fn root(&self) -> u32 {
        2
    }

    fn alloc(&mut self) -> u32 {
        let c = self.fat.iter().position(|&e| e == 0).expect("image full") as u32;
        self.fat[c as usize] = EOC;
        self.data[c as usize] = vec![0u8; self.cluster_size() as usize];
        c
    }

    /// Stores `content` in a fresh chain; returns its first cluster
    /// (0 for empty content).
    pub fn store(&mut self, content: &[u8]) -> u32 {
        if content.is_empty() {
            return 0;
        }

        let cluster_size = self.cluster_size() as usize;
        let mut first = 0;
        let mut prev = 0;

        for chunk in content.chunks(cluster_size) {
            let c = self.alloc();
            self.data[c as usize][..chunk.len()].copy_from_slice(chunk);
            if prev == 0 {
                first = c;
            } else {
                self.fat[prev as usize] = c;
            }
            prev = c;
        }

        first
    }

    fn short_name_for(&mut self, name: &str) -> ([u8; 11], bool) {
        let mut short = [b' '; 11];

        // An all-uppercase 8.3 name can live without LFN entries.
        let fits = |n: &str| {
            let mut parts = n.rsplitn(2, '.');
            let (base, ext) = match (parts.next(), parts.next()) {
                (Some(e), Some(b)) => (b, e),
                _ => (n, ""),
            };
            !base.is_empty()
                && base.len() <= 8
                && ext.len() <= 3
                && n.bytes()
                    .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'.')
        };

        if fits(name) {
            let mut parts = name.rsplitn(2, '.');
            let (base, ext) = match (parts.next(), parts.next()) {
                (Some(e), Some(b)) => (b, e),
                _ => (name, ""),
            };
            short[..base.len()].copy_from_slice(base.as_bytes());
            short[8..8 + ext.len()].copy_from_slice(ext.as_bytes());
            (short, false)
        } else {
            // Unique tail so collisions can't mask LFN bugs.
            self.short_counter += 1;
            let tag = format!("LN{:04}~1   ", self.short_counter);
            short.copy_from_slice(&tag.as_bytes()[..11]);
            (short, true)
        }
    }

    fn lfn_checksum(short: &[u8; 11]) -> u8 {
        short.iter().fold(0u8, |sum, &b| {
            ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b)
        })
    }

    /// Finds (or allocates) space for `count` consecutive entries in the
    /// directory chain and returns (cluster, byte offset).
    fn dir_slot(&mut self, dir: u32, count: usize) -> (u32, usize) {
        let cluster_size = self.cluster_size() as usize;
        let mut c = dir;

        loop {
            let used = self.data[c as usize]
                .chunks(32)
                .take_while(|e| e[0] != 0)
                .count()
                * 32;

            if used + count * 32 <= cluster_size {
                return (c, used);
            }

            // Mark the unusable tail slots deleted so a reader scans on
            // into the next cluster instead of seeing end-of-directory.
            let mut off = used;
            while off < cluster_size {
                self.data[c as usize][off] = 0xE5;
                off += 32;
            }

            let next = self.fat[c as usize];
            if next == EOC {
                let fresh = self.alloc();
                self.fat[c as usize] = fresh;
                return (fresh, 0);
            }
            c = next;
        }
    }

    pub fn add_entry(
        &mut self,
        dir: u32,
        name: &str,
        attr: u8,
        first_cluster: u32,
        size: u32,
    ) {
        let (short, needs_lfn) = self.short_name_for(name);
        let lfn_count = if needs_lfn { (name.len() + 12) / 13 } else { 0 };

        let (cluster, mut offset) = self.dir_slot(dir, lfn_count + 1);

        if needs_lfn {
            let checksum = Self::lfn_checksum(&short);
            for seq in (1..=lfn_count).rev() {
                let mut e = [0u8; 32];
                e[0] = seq as u8 | if seq == lfn_count { 0x40 } else { 0 };
                e[11] = 0x0F;
                e[13] = checksum;

                const UNITS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
                for (k, &off) in UNITS.iter().enumerate() {
                    let idx = (seq - 1) * 13 + k;
                    let unit: u16 = if idx < name.len() {
                        name.as_bytes()[idx] as u16
                    } else if idx == name.len() {
                        0x0000
                    } else {
                        0xFFFF
                    };
                    e[off..off + 2].copy_from_slice(&unit.to_le_bytes());
                }

                self.data[cluster as usize][offset..offset + 32].copy_from_slice(&e);
                offset += 32;
            }
        }

        let mut e = [0u8; 32];
        e[..11].copy_from_slice(&short);
        e[11] = attr;
        e[20..22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
        e[26..28].copy_from_slice(&(first_cluster as u16).to_le_bytes());
        e[28..32].copy_from_slice(&size.to_le_bytes());
        self.data[cluster as usize][offset..offset + 32].copy_from_slice(&e);
    }

    pub fn add_file(&mut self, dir: u32, name: &str, content: &[u8]) -> u32 {
        let first = self.store(content);
        self.add_entry(dir, name, 0x20, first, content.len() as u32);
        first
    }

    pub fn add_dir(&mut self, parent: u32, name: &str) -> u32 {
        let c = self.alloc();
        self.add_entry(parent, name, 0x10, c, 0);
        c
    }

    pub fn add_volume_label(&mut self, label: &str) {
        let mut short = [b' '; 11];
        short[..label.len()].copy_from_slice(label.as_bytes());

        let (cluster, offset) = self.dir_slot(2, 1);
        let mut e = [0u8; 32];
        e[..11].copy_from_slice(&short);
        e[11] = 0x08;
        self.data[cluster as usize][offset..offset + 32].copy_from_slice(&e);
    }

    /// Renders the image as a superfloppy (boot sector at LBA 0).
    pub fn build(self) -> RamDisk {
        self.build_at(0)
    }

    /// Renders the image behind an MBR with the volume at `offset`
    /// sectors (offset 0 means superfloppy, no MBR).
    pub fn build_at(self, offset: u32) -> RamDisk {
        let highest = self
            .data
            .iter()
            .enumerate()
            .rev()
            .find(|(_, d)| !d.is_empty())
            .map(|(i, _)| i as u32)
            .unwrap_or(2);

        let data_start = offset + RESERVED_SECTORS + SECTORS_PER_FAT;
        let total = data_start + (highest - 1) * self.spc;
        let mut disk = RamDisk::new(total as usize);

        if offset != 0 {
            let mbr = &mut disk.sectors[0];
            mbr[446 + 4] = 0x0C;
            mbr[446 + 8..446 + 12].copy_from_slice(&offset.to_le_bytes());
            mbr[510] = 0x55;
            mbr[511] = 0xAA;
        }

        {
            let bs = &mut disk.sectors[offset as usize];
            bs[0] = 0xEB;
            bs[0x00B..0x00D].copy_from_slice(&512u16.to_le_bytes());
            bs[0x00D] = self.spc as u8;
            bs[0x00E..0x010].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
            bs[0x010] = 1;
            bs[0x020..0x024].copy_from_slice(&total.to_le_bytes());
            bs[0x024..0x028].copy_from_slice(&SECTORS_PER_FAT.to_le_bytes());
            bs[0x02C..0x030].copy_from_slice(&2u32.to_le_bytes());
            bs[510] = 0x55;
            bs[511] = 0xAA;
        }

        for (i, entry) in self.fat.iter().enumerate() {
            let lba = offset + RESERVED_SECTORS + (i as u32 * 4) / 512;
            let at = (i * 4) % 512;
            disk.sectors[lba as usize][at..at + 4].copy_from_slice(&entry.to_le_bytes());
        }

        for (c, data) in self.data.iter().enumerate().skip(2) {
            if data.is_empty() {
                continue;
            }
            let first = data_start + (c as u32 - 2) * self.spc;
            for (s, chunk) in data.chunks(512).enumerate() {
                disk.sectors[(first + s as u32) as usize][..chunk.len()].copy_from_slice(chunk);
            }
        }

        disk
    }
}

// ---------------------------------------------------------------------------
// ELF32 builder.

pub struct ElfSegment {
    pub p_type: u32,
    pub vaddr: u32,
    pub memsz: u32,
    pub flags: u32,
    pub data: Vec<u8>,
}

pub struct ElfBuilder {
    pub entry: u32,
    segments: Vec<ElfSegment>,
}

pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;
pub const PF_R: u32 = 0x4;

impl ElfBuilder {
    pub fn new(entry: u32) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    pub fn segment(self, vaddr: u32, data: &[u8], memsz: u32) -> Self {
        self.segment_with_flags(vaddr, data, memsz, PF_R | PF_W | PF_X)
    }

    pub fn segment_with_flags(mut self, vaddr: u32, data: &[u8], memsz: u32, flags: u32) -> Self {
        self.segments.push(ElfSegment {
            p_type: 1, // PT_LOAD
            vaddr,
            memsz,
            flags,
            data: data.to_vec(),
        });
        self
    }

    /// A non-loadable program header, to check the loader skips them.
    pub fn note_segment(mut self) -> Self {
        self.segments.push(ElfSegment {
            p_type: 4, // PT_NOTE
            vaddr: 0,
            memsz: 0,
            flags: 0,
            data: b"noise".to_vec(),
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len();
        let phoff = 52u32;
        let mut data_off = phoff + (phnum as u32) * 32;

        let mut out = vec![0u8; data_off as usize];

        // File header.
        out[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        out[4] = 1; // ELFCLASS32
        out[5] = 1; // ELFDATA2LSB
        out[6] = 1; // EV_CURRENT
        out[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out[18..20].copy_from_slice(&40u16.to_le_bytes()); // EM_ARM
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..28].copy_from_slice(&self.entry.to_le_bytes());
        out[28..32].copy_from_slice(&phoff.to_le_bytes());
        out[40..42].copy_from_slice(&52u16.to_le_bytes());
        out[42..44].copy_from_slice(&32u16.to_le_bytes());
        out[44..46].copy_from_slice(&(phnum as u16).to_le_bytes());

        for (i, seg) in self.segments.iter().enumerate() {
            let p = 52 + i * 32;
            out[p..p + 4].copy_from_slice(&seg.p_type.to_le_bytes());
            out[p + 4..p + 8].copy_from_slice(&data_off.to_le_bytes());
            out[p + 8..p + 12].copy_from_slice(&seg.vaddr.to_le_bytes());
            out[p + 16..p + 20].copy_from_slice(&(seg.data.len() as u32).to_le_bytes());
            out[p + 20..p + 24].copy_from_slice(&seg.memsz.to_le_bytes());
            out[p + 24..p + 28].copy_from_slice(&seg.flags.to_le_bytes());

            data_off += seg.data.len() as u32;
        }

        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }

        out
    }
}

// ---------------------------------------------------------------------------
// Loader seams backed by host memory.

pub struct SliceImage<'a> {
    pub data: &'a [u8],
}

impl<'a> ImageRead for SliceImage<'a> {
    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, BootError> {
        let off = offset as usize;
        if off >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - off);
        buf[..n].copy_from_slice(&self.data[off..off + n]);
        Ok(n)
    }

    fn size(&mut self) -> u32 {
        self.data.len() as u32
    }
}

/// A chunk of fake RAM at `base`. Out-of-range access panics: the loader
/// has no business outside its regions.
pub struct BufferMemory {
    pub base: u32,
    pub mem: Vec<u8>,
}

impl BufferMemory {
    pub fn new(base: u32, size: usize) -> Self {
        Self::filled(base, size, 0)
    }

    pub fn filled(base: u32, size: usize, fill: u8) -> Self {
        Self {
            base,
            mem: vec![fill; size],
        }
    }

    fn range(&self, addr: u32, len: usize) -> std::ops::Range<usize> {
        let start = addr
            .checked_sub(self.base)
            .expect("write below RAM base") as usize;
        let end = start.checked_add(len).expect("length overflow");
        assert!(end <= self.mem.len(), "write past RAM end");
        start..end
    }

    pub fn at(&self, addr: u32, len: usize) -> &[u8] {
        &self.mem[self.range(addr, len)]
    }
}

impl Memory for BufferMemory {
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), BootError> {
        let r = self.range(addr, data.len());
        self.mem[r].copy_from_slice(data);
        Ok(())
    }

    fn zero(&mut self, addr: u32, len: u32) -> Result<(), BootError> {
        let r = self.range(addr, len as usize);
        for b in &mut self.mem[r] {
            *b = 0;
        }
        Ok(())
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), BootError> {
        let r = self.range(addr, buf.len());
        buf.copy_from_slice(&self.mem[r]);
        Ok(())
    }
}

/// Deterministic filler for file contents.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 13) as u8).collect()
}

pub fn sector() -> Sector {
    GenericArray::default()
}
