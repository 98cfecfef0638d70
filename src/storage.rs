//! The sector-read capability the filesystem is built on.
//!
//! One trait, one job: hand back 512-byte sectors by LBA. The SD driver
//! implements it for real hardware; tests implement it over a RAM image.

use core::fmt::Debug;

use generic_array::GenericArray;
use typenum::consts::U512;

/// A 512-byte sector, the only block size this loader speaks.
pub type Sector = GenericArray<u8, U512>;

pub const SECTOR_SIZE: usize = 512;

/// Implementors of this trait provide read access to a sector-based
/// storage medium.
///
/// Not reentrant; the whole core is single-threaded and the volume owns
/// its device exclusively.
pub trait BlockDevice {
    type Error: Debug;

    /// Reads the sector at `lba` into `buf`.
    ///
    /// This function should never panic but can return errors for the
    /// appropriate cases (i.e. out of range, transport failure).
    fn read_sector(&mut self, lba: u32, buf: &mut Sector) -> Result<(), Self::Error>;

    /// Returns the number of sectors on the medium.
    fn sector_count(&self) -> u32;

    /// Reads `count` consecutive sectors starting at `lba`.
    ///
    /// This has a default implementation that just loops `read_sector`;
    /// implementations that can do better for their medium (e.g. CMD18
    /// multi-block reads) should provide their own.
    #[inline]
    fn read_sectors(&mut self, lba: u32, bufs: &mut [Sector]) -> Result<(), Self::Error> {
        for (i, buf) in bufs.iter_mut().enumerate() {
            self.read_sector(lba + i as u32, buf)?;
        }
        Ok(())
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    type Error = D::Error;

    fn read_sector(&mut self, lba: u32, buf: &mut Sector) -> Result<(), Self::Error> {
        (**self).read_sector(lba, buf)
    }

    fn sector_count(&self) -> u32 {
        (**self).sector_count()
    }
}
