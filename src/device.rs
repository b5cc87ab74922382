//! Block-device boundary.
//!
//! The engine talks to storage exclusively through [`BlockDevice`]. All
//! transfers are whole 512-byte sectors; multi-sector transfers exist so
//! file I/O can stream cluster runs without bouncing through a cache.
//! Whatever concurrency or timeout handling the device needs lives behind
//! this trait — a stuck call blocks the engine.

use crate::error::{Error, Result};

/// Fixed sector size of the engine. Volumes reporting anything else are
/// rejected at mount.
pub const SECTOR_SIZE: usize = 512;

bitflags::bitflags! {
    /// Status bits reported by a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceStatus: u8 {
        /// Device has not been initialized (or lost its initialization).
        const NOT_READY = 1 << 0;
        /// Medium is present but write-protected.
        const WRITE_PROTECTED = 1 << 1;
    }
}

/// Control operations beyond plain sector transfers.
#[derive(Debug, PartialEq, Eq)]
pub enum Ioctl<'a> {
    /// Flush any device-side write cache.
    Sync,
    /// Report total sector count.
    SectorCount(&'a mut u64),
    /// Report sector size in bytes.
    SectorSize(&'a mut u32),
    /// Report erase-block size in sectors (1 if unknown).
    BlockSize(&'a mut u32),
    /// Hint that sectors `start..=end` no longer hold live data.
    Trim { start: u64, end: u64 },
}

/// One physical drive, addressed by sector.
pub trait BlockDevice {
    /// Bring the device to a ready state. Returns the resulting status.
    fn initialize(&mut self) -> DeviceStatus;

    /// Current status without side effects.
    fn status(&self) -> DeviceStatus;

    /// Read `buf.len() / 512` sectors starting at `sector`.
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf.len() / 512` sectors starting at `sector`.
    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()>;

    /// Control call. Implementations must support `SectorCount` and
    /// `SectorSize`; the rest may be no-ops.
    fn ioctl(&mut self, cmd: Ioctl) -> Result<()>;
}

/// Query the device's total sector count.
pub(crate) fn sector_count<D: BlockDevice>(dev: &mut D) -> Result<u64> {
    let mut n = 0u64;
    dev.ioctl(Ioctl::SectorCount(&mut n))?;
    if n == 0 { return Err(Error::InvalidParameter); }
    Ok(n)
}

/// Query the device's sector size and reject anything but 512.
pub(crate) fn check_sector_size<D: BlockDevice>(dev: &mut D) -> Result<()> {
    let mut sz = 0u32;
    dev.ioctl(Ioctl::SectorSize(&mut sz))?;
    if sz as usize != SECTOR_SIZE {
        return Err(Error::NoFilesystem);
    }
    Ok(())
}

/// Query the erase-block size, falling back to 1 sector.
pub(crate) fn block_size<D: BlockDevice>(dev: &mut D) -> u32 {
    let mut n = 1u32;
    if dev.ioctl(Ioctl::BlockSize(&mut n)).is_err() || n == 0 || !n.is_power_of_two() {
        n = 1;
    }
    n
}
