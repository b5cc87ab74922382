//! Portable FAT12/16/32 and exFAT filesystem engine.
//!
//! Operates directly on a block-addressable device through the
//! [`BlockDevice`] trait: volume mounting (with MBR/GPT partition
//! discovery), path resolution, directory enumeration and mutation,
//! random-access file I/O, and from-empty volume formatting. One
//! [`Volume`] instance owns one mounted volume; the caller serializes all
//! operations against it (distinct volumes are fully independent).
//!
//! The crate is `core`-only: every buffer is fixed-size (one sector window
//! per volume, one sector cache per open file), so it runs on targets with
//! no OS filesystem at all.
// No_std when not testing (host tests use std for the fatfs reference
// implementation and in-memory disks).
#![cfg_attr(not(test), no_std)]

pub mod device;
pub mod dir;
pub mod error;
pub mod fat;
pub mod file;
pub mod format;
pub mod volume;

pub use device::{BlockDevice, DeviceStatus, Ioctl, SECTOR_SIZE};
pub use dir::{Attributes, DirHandle, FileInfo, VolumeLabel, MAX_NAME_CHARS};
pub use error::{Error, Result};
pub use file::{FileHandle, OpenMode};
pub use format::{FormatKind, FormatOptions, create_partitions, format_volume};
pub use volume::{FsKind, MountOptions, Volume};

/// Broken-down local time used for directory entry stamps.
///
/// The engine has no clock of its own; [`MountOptions::clock`] supplies
/// one. Without it every stamp is [`Timestamp::DEFAULT`], mirroring an
/// RTC-less build of the original driver family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub min: u8,
    pub sec: u8,
}

impl Timestamp {
    /// Stamp used when no clock is configured.
    pub const DEFAULT: Timestamp = Timestamp {
        year: 2025,
        month: 1,
        day: 1,
        hour: 0,
        min: 0,
        sec: 0,
    };

    /// Pack into FAT on-disk form: `(date, time)`.
    ///
    /// Date: bits 15..9 year-1980, 8..5 month, 4..0 day.
    /// Time: bits 15..11 hour, 10..5 minute, 4..0 second/2.
    pub fn to_fat(self) -> (u16, u16) {
        let year = self.year.clamp(1980, 2107) - 1980;
        let date = (year << 9) | ((self.month as u16 & 0x0F) << 5) | (self.day as u16 & 0x1F);
        let time = ((self.hour as u16 & 0x1F) << 11)
            | ((self.min as u16 & 0x3F) << 5)
            | ((self.sec as u16 / 2) & 0x1F);
        (date, time)
    }

    /// Unpack from FAT on-disk form.
    pub fn from_fat(date: u16, time: u16) -> Timestamp {
        Timestamp {
            year: 1980 + (date >> 9),
            month: ((date >> 5) & 0x0F) as u8,
            day: (date & 0x1F) as u8,
            hour: (time >> 11) as u8,
            min: ((time >> 5) & 0x3F) as u8,
            sec: ((time & 0x1F) * 2) as u8,
        }
    }

    /// exFAT packs date and time into one little-endian dword, date high.
    pub fn to_exfat(self) -> u32 {
        let (date, time) = self.to_fat();
        ((date as u32) << 16) | time as u32
    }

    pub fn from_exfat(v: u32) -> Timestamp {
        Timestamp::from_fat((v >> 16) as u16, v as u16)
    }
}
