//! Shared test harness: an in-memory block device and volume builders.

#![allow(dead_code)]

use fatcore::{
    BlockDevice, DeviceStatus, Error, FormatKind, FormatOptions, Ioctl, MountOptions, Result,
    Volume, SECTOR_SIZE,
};

/// Byte-vector backed disk. Out-of-range transfers fail like a real device.
pub struct RamDisk {
    data: Vec<u8>,
    write_protected: bool,
}

impl RamDisk {
    pub fn new(sectors: u64) -> RamDisk {
        RamDisk {
            data: vec![0u8; sectors as usize * SECTOR_SIZE],
            write_protected: false,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> RamDisk {
        assert_eq!(data.len() % SECTOR_SIZE, 0);
        RamDisk { data, write_protected: false }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn set_write_protected(&mut self, on: bool) {
        self.write_protected = on;
    }

    fn range(&self, sector: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = sector as usize * SECTOR_SIZE;
        if len % SECTOR_SIZE != 0 || start + len > self.data.len() {
            return Err(Error::Disk);
        }
        Ok(start..start + len)
    }
}

impl BlockDevice for RamDisk {
    fn initialize(&mut self) -> DeviceStatus {
        self.status()
    }

    fn status(&self) -> DeviceStatus {
        if self.write_protected {
            DeviceStatus::WRITE_PROTECTED
        } else {
            DeviceStatus::empty()
        }
    }

    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let r = self.range(sector, buf.len())?;
        buf.copy_from_slice(&self.data[r]);
        Ok(())
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        if self.write_protected {
            return Err(Error::WriteProtected);
        }
        let r = self.range(sector, buf.len())?;
        self.data[r].copy_from_slice(buf);
        Ok(())
    }

    fn ioctl(&mut self, cmd: Ioctl) -> Result<()> {
        match cmd {
            Ioctl::SectorCount(n) => *n = (self.data.len() / SECTOR_SIZE) as u64,
            Ioctl::SectorSize(s) => *s = SECTOR_SIZE as u32,
            Ioctl::BlockSize(b) => *b = 1,
            Ioctl::Sync | Ioctl::Trim { .. } => {}
        }
        Ok(())
    }
}

/// Format a fresh disk and mount it.
pub fn fresh_volume(sectors: u64, opts: FormatOptions) -> Volume<RamDisk> {
    let mut dev = RamDisk::new(sectors);
    fatcore::format_volume(&mut dev, &opts).expect("format");
    Volume::mount(dev, MountOptions::default()).expect("mount")
}

/// Partition-table-free volume of the given family.
pub fn superfloppy(kind: FormatKind, sectors: u64) -> Volume<RamDisk> {
    fresh_volume(sectors, FormatOptions { kind, superfloppy: true, ..FormatOptions::default() })
}

/// Remount the same disk from scratch, forcing a fresh free-space scan.
pub fn recycle(vol: Volume<RamDisk>) -> Volume<RamDisk> {
    let dev = vol.unmount().expect("unmount");
    Volume::mount(dev, MountOptions::default()).expect("remount")
}

/// Deterministic byte pattern for file payloads.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
