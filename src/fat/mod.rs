//! Read-only FAT32.
//!
//! [`Volume`] owns the block device and the geometry derived at mount time;
//! [`file::FileCursor`] is a position into one file's cluster chain. Path
//! resolution (with long-filename reassembly) lives in [`dir`], cluster
//! chain arithmetic in [`table`].

use crate::error::BootError;
use crate::storage::{BlockDevice, Sector, SECTOR_SIZE};

use boot_sector::BiosParameterBlock;

pub mod boot_sector;
pub mod table;
pub mod dir;
pub mod file;

pub use dir::DirEntry;
pub use file::{FileCursor, FileIo};

/// A mounted FAT32 volume. Geometry is computed once at mount and never
/// changes afterwards.
#[derive(Debug)]
pub struct Volume<D: BlockDevice> {
    device: D,

    partition_start: u32,
    reserved_sectors: u16,
    fat_count: u8,
    sectors_per_fat: u32,
    sectors_per_cluster: u8,
    root_cluster: u32,

    // Derived:
    fat_start: u32,
    data_start: u32,
    cluster_size: u32,
}

impl<D: BlockDevice> Volume<D> {
    /// Mounts the volume: locates the partition (MBR entry or superfloppy),
    /// validates the boot sector, and derives the geometry.
    pub fn mount(mut device: D) -> Result<Self, BootError> {
        let mut sector: Sector = Default::default();

        device
            .read_sector(0, &mut sector)
            .map_err(|_| BootError::Io)?;
        let partition_start = boot_sector::partition_start(&sector)?;

        device
            .read_sector(partition_start, &mut sector)
            .map_err(|_| BootError::Io)?;
        if !boot_sector::has_signature(&sector) {
            return Err(BootError::NotFat32);
        }

        let bpb = BiosParameterBlock::read(&sector);

        if bpb.bytes_per_sector as usize != SECTOR_SIZE {
            return Err(BootError::NotFat32);
        }
        if bpb.sectors_per_cluster == 0 || bpb.fat_count == 0 || bpb.sectors_per_fat == 0 {
            return Err(BootError::Invalid);
        }

        let fat_start = partition_start + bpb.reserved_sectors as u32;
        let data_start = fat_start + bpb.fat_count as u32 * bpb.sectors_per_fat;
        let cluster_size = bpb.sectors_per_cluster as u32 * SECTOR_SIZE as u32;

        log::debug!(
            "fat: mounted at lba {}, cluster size {} B, root cluster {}",
            partition_start,
            cluster_size,
            bpb.root_cluster
        );

        Ok(Self {
            device,

            partition_start,
            reserved_sectors: bpb.reserved_sectors,
            fat_count: bpb.fat_count,
            sectors_per_fat: bpb.sectors_per_fat,
            sectors_per_cluster: bpb.sectors_per_cluster,
            root_cluster: bpb.root_cluster,

            fat_start,
            data_start,
            cluster_size,
        })
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    pub fn root_cluster(&self) -> u32 {
        self.root_cluster
    }

    pub fn partition_start(&self) -> u32 {
        self.partition_start
    }

    pub fn fat_start(&self) -> u32 {
        self.fat_start
    }

    pub fn data_start(&self) -> u32 {
        self.data_start
    }

    pub(crate) fn sectors_per_cluster(&self) -> u32 {
        self.sectors_per_cluster as u32
    }

    /// First sector of a (data-region) cluster.
    pub(crate) fn cluster_to_sector(&self, cluster: u32) -> u32 {
        self.data_start + (cluster - 2) * self.sectors_per_cluster as u32
    }

    pub(crate) fn read_sector(&mut self, lba: u32, buf: &mut Sector) -> Result<(), BootError> {
        self.device.read_sector(lba, buf).map_err(|e| {
            log::warn!("fat: sector {} read failed: {:?}", lba, e);
            BootError::Io
        })
    }

    /// True if `path` resolves to anything.
    pub fn exists(&mut self, path: &str) -> bool {
        self.open(path).is_ok()
    }
}
