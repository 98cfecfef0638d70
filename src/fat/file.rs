//! File cursors: a position in one file's cluster chain.

use crate::elf::loader::ImageRead;
use crate::error::BootError;
use crate::storage::{BlockDevice, Sector, SECTOR_SIZE};

use super::dir::{Attributes, DirEntry, ATTR_DIRECTORY};
use super::{table, Volume};

/// An open file (or directory). Holds no reference to the volume; reads and
/// seeks go through [`Volume::read`]/[`Volume::seek`] so the volume keeps
/// exclusive ownership of the device.
///
/// Invariant: `position <= size`, and `current_cluster` is the cluster
/// containing byte `position` — or an end-of-chain sentinel once
/// `position == size` lands exactly on a cluster boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCursor {
    start_cluster: u32,
    current_cluster: u32,
    size: u32,
    position: u32,
    attr: Attributes,
}

impl FileCursor {
    pub(crate) fn from_entry(entry: &DirEntry) -> Self {
        Self {
            start_cluster: entry.first_cluster,
            current_cluster: entry.first_cluster,
            size: entry.size,
            position: 0,
            attr: entry.attr,
        }
    }

    /// A cursor over a directory's cluster chain (directories carry no
    /// size in their entries).
    pub(crate) fn directory(cluster: u32) -> Self {
        Self {
            start_cluster: cluster,
            current_cluster: cluster,
            size: 0,
            position: 0,
            attr: Attributes(ATTR_DIRECTORY),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn tell(&self) -> u32 {
        self.position
    }

    pub fn is_dir(&self) -> bool {
        self.attr.is_dir()
    }

    pub fn start_cluster(&self) -> u32 {
        self.start_cluster
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Reads up to `out.len()` bytes at the cursor, clamped to end-of-file.
    /// Returns the byte count actually read.
    pub fn read(&mut self, file: &mut FileCursor, out: &mut [u8]) -> Result<usize, BootError> {
        let remaining = (file.size - file.position) as usize;
        let want = out.len().min(remaining);
        if want == 0 {
            return Ok(0);
        }

        let mut sector: Sector = Default::default();
        let mut done = 0;

        while done < want {
            if table::is_end_of_chain(file.current_cluster) {
                break;
            }

            let cluster_offset = file.position % self.cluster_size();
            let sector_in_cluster = cluster_offset / SECTOR_SIZE as u32;
            let offset_in_sector = (cluster_offset % SECTOR_SIZE as u32) as usize;

            let lba = self.cluster_to_sector(file.current_cluster) + sector_in_cluster;
            self.read_sector(lba, &mut sector)?;

            let chunk = (SECTOR_SIZE - offset_in_sector).min(want - done);
            out[done..done + chunk]
                .copy_from_slice(&sector[offset_in_sector..offset_in_sector + chunk]);

            done += chunk;
            file.position += chunk as u32;

            // Crossing a cluster boundary steps the chain.
            if file.position % self.cluster_size() == 0 {
                file.current_cluster = self.next_cluster(file.current_cluster)?;
            }
        }

        Ok(done)
    }

    /// Repositions the cursor, clamping to end-of-file. Walks the chain
    /// from the start cluster, so it is O(offset / cluster_size) FAT reads.
    pub fn seek(&mut self, file: &mut FileCursor, offset: u32) -> Result<(), BootError> {
        let offset = offset.min(file.size);
        let steps = offset / self.cluster_size();

        file.current_cluster = self.walk_chain(file.start_cluster, steps)?;
        file.position = offset;
        Ok(())
    }
}

/// A cursor plus its volume, packaged as the loader's read-at-offset
/// capability.
pub struct FileIo<'v, D: BlockDevice> {
    volume: &'v mut Volume<D>,
    file: FileCursor,
}

impl<'v, D: BlockDevice> FileIo<'v, D> {
    pub fn new(volume: &'v mut Volume<D>, file: FileCursor) -> Self {
        Self { volume, file }
    }
}

impl<'v, D: BlockDevice> ImageRead for FileIo<'v, D> {
    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, BootError> {
        self.volume.seek(&mut self.file, offset)?;
        self.volume.read(&mut self.file, buf)
    }

    fn size(&mut self) -> u32 {
        self.file.size()
    }
}
