//! Volume manager: discovers a FAT/exFAT volume on a block device, parses
//! its boot sector, and owns the mounted-volume record every other layer
//! works through.
//!
//! All structural reads and writes funnel through a single sector-sized
//! window per volume; flushing a window that lies inside the primary FAT
//! mirrors the write to every secondary FAT copy.

use crate::device::{self, BlockDevice, DeviceStatus, Ioctl, SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::Timestamp;

// ─── Little-endian field access ────────────────────────────────────────────────

pub(crate) fn ld16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

pub(crate) fn ld32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

pub(crate) fn ld64(b: &[u8], off: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(v)
}

pub(crate) fn st16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn st32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn st64(b: &mut [u8], off: usize, v: u64) {
    b[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

// ─── Constants ─────────────────────────────────────────────────────────────────

/// Marker for "no sector resident" in the window / file caches.
pub(crate) const NO_SECTOR: u64 = u64::MAX;

/// Marker for "free cluster count unknown, scan required".
pub(crate) const FREE_UNKNOWN: u32 = u32::MAX;

/// Smallest volume the mount path accepts, in sectors.
const MIN_VOL_SECTORS: u64 = 128;

/// FSInfo signatures (FAT32).
const FSI_LEAD_SIG: u32 = 0x4161_5252;
const FSI_STRUCT_SIG: u32 = 0x6141_7272;
const FSI_TRAIL_SIG: u32 = 0xAA55_0000;

/// Filesystem kind of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Fat12,
    Fat16,
    Fat32,
    ExFat,
}

impl FsKind {
    pub fn is_exfat(self) -> bool {
        self == FsKind::ExFat
    }
}

/// Options for [`Volume::mount`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// 1-based partition ordinal to mount. `None` scans sector 0 first and
    /// then every partition-table entry in order, accepting the first
    /// usable FAT/exFAT boot sector.
    pub partition: Option<u32>,
    /// Clock used to stamp directory entries. `None` stamps everything
    /// with [`Timestamp::DEFAULT`].
    pub clock: Option<fn() -> Timestamp>,
}

// ─── Boot sector classification ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootKind {
    /// Valid exFAT VBR.
    ExFat,
    /// Valid FAT/FAT32 boot sector (or the legacy heuristic matched).
    Fat,
    /// 0xAA55 present but not a FAT boot sector: possibly a partition table.
    ValidBs,
    /// Nothing recognizable.
    Invalid,
}

/// Classify one 512-byte sector 0 image.
fn classify_boot(b: &[u8]) -> BootKind {
    let signed = ld16(b, 510) == 0xAA55;
    if signed && &b[3..11] == b"EXFAT   " {
        return BootKind::ExFat;
    }
    if signed && (&b[54..57] == b"FAT" || &b[82..87] == b"FAT32") {
        return BootKind::Fat;
    }
    // Legacy FAT boot sectors may lack both the signature and the type
    // string; accept them when the BPB numbers are plausible.
    let bps = ld16(b, 11);
    let spc = b[13];
    let plausible = matches!(bps, 512 | 1024 | 2048 | 4096)
        && spc != 0
        && spc.is_power_of_two()
        && ld16(b, 14) != 0
        && matches!(b[16], 1 | 2)
        && ld16(b, 17) != 0
        && (ld16(b, 19) as u32 >= 128 || ld32(b, 32) >= 0x10000)
        && ld16(b, 22) != 0;
    if plausible {
        return BootKind::Fat;
    }
    if signed { BootKind::ValidBs } else { BootKind::Invalid }
}

// ─── Partition table scan ──────────────────────────────────────────────────────

/// Microsoft Basic Data partition type GUID, on-disk byte order.
pub(crate) const BASIC_DATA_GUID: [u8; 16] = [
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
];

/// Collect candidate partition start sectors from an MBR sector.
fn mbr_candidates(b: &[u8], out: &mut [u64; 8]) -> usize {
    let mut n = 0;
    for i in 0..4 {
        let e = 446 + i * 16;
        let ptype = b[e + 4];
        let start = ld32(b, e + 8) as u64;
        let size = ld32(b, e + 12);
        if ptype != 0 && size != 0 && start != 0 {
            out[n] = start;
            n += 1;
        }
    }
    n
}

/// Collect candidate partition start sectors from a GPT, validating the
/// header length and CRC and matching the Basic Data type GUID.
fn gpt_candidates<D: BlockDevice>(dev: &mut D, out: &mut [u64; 8]) -> Result<usize> {
    let mut hdr = [0u8; SECTOR_SIZE];
    dev.read_sectors(1, &mut hdr)?;
    if &hdr[0..8] != b"EFI PART" {
        return Ok(0);
    }
    let hdr_size = ld32(&hdr, 12) as usize;
    if !(92..=SECTOR_SIZE).contains(&hdr_size) {
        return Ok(0);
    }
    let stored_crc = ld32(&hdr, 16);
    let mut scratch = [0u8; SECTOR_SIZE];
    scratch[..hdr_size].copy_from_slice(&hdr[..hdr_size]);
    st32(&mut scratch, 16, 0);
    if crate::format::crc32(&scratch[..hdr_size]) != stored_crc {
        log::warn!("GPT header CRC mismatch, ignoring table");
        return Ok(0);
    }
    let entry_lba = ld64(&hdr, 72);
    let n_entries = ld32(&hdr, 80);
    let entry_size = ld32(&hdr, 84) as usize;
    if entry_size != 128 {
        return Ok(0);
    }
    let per_sector = SECTOR_SIZE / entry_size;
    let mut found = 0;
    let mut sec = [0u8; SECTOR_SIZE];
    for i in 0..n_entries as usize {
        if found == out.len() {
            break;
        }
        if i % per_sector == 0 {
            dev.read_sectors(entry_lba + (i / per_sector) as u64, &mut sec)?;
        }
        let e = (i % per_sector) * entry_size;
        if sec[e..e + 16] == BASIC_DATA_GUID {
            out[found] = ld64(&sec, e + 32);
            found += 1;
        }
    }
    Ok(found)
}

/// Locate a FAT/exFAT boot sector on the device: sector 0 itself
/// (superfloppy), or the first usable entry of an MBR/GPT table, or the
/// caller-forced partition ordinal.
fn find_volume<D: BlockDevice>(
    dev: &mut D,
    forced: Option<u32>,
    boot: &mut [u8; SECTOR_SIZE],
) -> Result<u64> {
    dev.read_sectors(0, boot)?;
    let kind0 = classify_boot(boot);
    if forced.is_none() && matches!(kind0, BootKind::ExFat | BootKind::Fat) {
        return Ok(0);
    }
    if kind0 == BootKind::Invalid {
        return Err(Error::NoFilesystem);
    }

    let mut cand = [0u64; 8];
    let n = if boot[446 + 4] == 0xEE {
        gpt_candidates(dev, &mut cand)?
    } else {
        mbr_candidates(boot, &mut cand)
    };

    if let Some(ord) = forced {
        if ord == 0 || ord as usize > n {
            return Err(Error::NoFilesystem);
        }
        let base = cand[ord as usize - 1];
        dev.read_sectors(base, boot)?;
        return match classify_boot(boot) {
            BootKind::ExFat | BootKind::Fat => Ok(base),
            _ => Err(Error::NoFilesystem),
        };
    }
    for &base in cand.iter().take(n) {
        dev.read_sectors(base, boot)?;
        if matches!(classify_boot(boot), BootKind::ExFat | BootKind::Fat) {
            return Ok(base);
        }
    }
    Err(Error::NoFilesystem)
}

// ─── Volume record ─────────────────────────────────────────────────────────────

/// One mounted FAT/exFAT volume.
///
/// Owns the device and a single sector window. Not internally locked: the
/// caller serializes all operations against one volume (§ concurrency
/// model); distinct volumes share nothing.
pub struct Volume<D: BlockDevice> {
    pub(crate) dev: D,
    pub(crate) kind: FsKind,
    pub(crate) mount_id: u16,
    pub(crate) clock: Option<fn() -> Timestamp>,

    /// Sectors per cluster.
    pub(crate) csize: u32,
    pub(crate) n_fats: u8,
    /// Sectors per FAT copy.
    pub(crate) fat_size: u32,
    /// FAT12/16 fixed root directory entry count (0 otherwise).
    pub(crate) n_root_entries: u16,
    /// Total FAT entries = cluster count + 2.
    pub(crate) n_entries: u32,

    pub(crate) vol_base: u64,
    pub(crate) fat_base: u64,
    /// FAT12/16 fixed root directory start sector (0 otherwise).
    pub(crate) root_base: u64,
    pub(crate) data_base: u64,
    /// exFAT allocation bitmap start sector (0 otherwise).
    pub(crate) bitmap_base: u64,
    /// Root directory start cluster (FAT32/exFAT; 0 for FAT12/16).
    pub(crate) root_cluster: u32,
    pub(crate) vol_sectors: u64,

    /// Last allocated cluster, the allocation search hint.
    pub(crate) last_cluster: u32,
    /// Free cluster count; [`FREE_UNKNOWN`] until scanned.
    pub(crate) free_count: u32,
    /// FAT32 FSInfo sector (absolute; 0 = none) and its dirty flag.
    pub(crate) fsi_sector: u64,
    pub(crate) fsi_dirty: bool,

    win: [u8; SECTOR_SIZE],
    win_sector: u64,
    win_dirty: bool,
}

impl<D: BlockDevice> Volume<D> {
    // ─── Mounting ──────────────────────────────────────────────────────────────

    /// Mount the volume found on `dev`.
    pub fn mount(mut dev: D, opts: MountOptions) -> Result<Volume<D>> {
        let status = dev.initialize();
        if status.contains(DeviceStatus::NOT_READY) {
            return Err(Error::NotReady);
        }
        device::check_sector_size(&mut dev)?;

        let mut boot = [0u8; SECTOR_SIZE];
        let base = find_volume(&mut dev, opts.partition, &mut boot)?;

        let mut vol = Volume {
            dev,
            kind: FsKind::Fat12,
            mount_id: 1,
            clock: opts.clock,
            csize: 0,
            n_fats: 0,
            fat_size: 0,
            n_root_entries: 0,
            n_entries: 0,
            vol_base: base,
            fat_base: 0,
            root_base: 0,
            data_base: 0,
            bitmap_base: 0,
            root_cluster: 0,
            vol_sectors: 0,
            last_cluster: 0,
            free_count: FREE_UNKNOWN,
            fsi_sector: 0,
            fsi_dirty: false,
            win: [0u8; SECTOR_SIZE],
            win_sector: NO_SECTOR,
            win_dirty: false,
        };
        vol.init_from_boot(&boot)?;
        log::debug!(
            "mounted {:?} at sector {}: {} clusters of {} sectors",
            vol.kind,
            vol.vol_base,
            vol.n_entries - 2,
            vol.csize,
        );
        Ok(vol)
    }

    /// Re-run volume discovery on the same device, e.g. after a media
    /// change. Bumps the mount identifier so existing handles return
    /// `InvalidObject`.
    pub fn remount(&mut self) -> Result<()> {
        self.win_sector = NO_SECTOR;
        self.win_dirty = false;
        let status = self.dev.initialize();
        if status.contains(DeviceStatus::NOT_READY) {
            return Err(Error::NotReady);
        }
        let mut boot = [0u8; SECTOR_SIZE];
        let base = find_volume(&mut self.dev, None, &mut boot)?;
        self.vol_base = base;
        self.bitmap_base = 0;
        self.fsi_sector = 0;
        self.last_cluster = 0;
        self.free_count = FREE_UNKNOWN;
        self.init_from_boot(&boot)?;
        self.mount_id = self.mount_id.wrapping_add(1).max(1);
        Ok(())
    }

    /// Flush all pending state and give the device back.
    pub fn unmount(mut self) -> Result<D> {
        self.sync_fs()?;
        Ok(self.dev)
    }

    fn init_from_boot(&mut self, boot: &[u8; SECTOR_SIZE]) -> Result<()> {
        match classify_boot(boot) {
            BootKind::ExFat => self.init_exfat(boot),
            BootKind::Fat => self.init_fat(boot),
            _ => Err(Error::NoFilesystem),
        }
    }

    fn init_fat(&mut self, b: &[u8; SECTOR_SIZE]) -> Result<()> {
        if ld16(b, 11) as usize != SECTOR_SIZE {
            return Err(Error::NoFilesystem);
        }
        let csize = b[13] as u32;
        if csize == 0 || !csize.is_power_of_two() {
            return Err(Error::NoFilesystem);
        }
        let n_rsv = ld16(b, 14) as u64;
        let n_fats = b[16];
        if n_rsv == 0 || !matches!(n_fats, 1 | 2) {
            return Err(Error::NoFilesystem);
        }
        let n_root = ld16(b, 17);
        if (n_root as usize * 32) % SECTOR_SIZE != 0 {
            return Err(Error::NoFilesystem);
        }
        let total16 = ld16(b, 19) as u64;
        let vol_sectors = if total16 != 0 { total16 } else { ld32(b, 32) as u64 };
        if vol_sectors < MIN_VOL_SECTORS {
            return Err(Error::NoFilesystem);
        }
        let fat16_size = ld16(b, 22) as u32;
        let fat_size = if fat16_size != 0 { fat16_size } else { ld32(b, 36) };
        if fat_size == 0 {
            return Err(Error::NoFilesystem);
        }

        let root_sectors = (n_root as u64 * 32) / SECTOR_SIZE as u64;
        let sys_sectors = n_rsv + n_fats as u64 * fat_size as u64 + root_sectors;
        if vol_sectors < sys_sectors {
            return Err(Error::NoFilesystem);
        }
        let n_clusters = ((vol_sectors - sys_sectors) / csize as u64) as u32;
        if n_clusters == 0 {
            return Err(Error::NoFilesystem);
        }
        let kind = if n_clusters <= 0xFF5 {
            FsKind::Fat12
        } else if n_clusters <= 0xFFF5 {
            FsKind::Fat16
        } else {
            FsKind::Fat32
        };
        let n_entries = n_clusters + 2;

        // The reported FAT must actually cover every entry.
        let needed_bytes = match kind {
            FsKind::Fat12 => (n_entries as u64 * 3).div_ceil(2),
            FsKind::Fat16 => n_entries as u64 * 2,
            _ => n_entries as u64 * 4,
        };
        if fat_size as u64 * (SECTOR_SIZE as u64) < needed_bytes {
            return Err(Error::NoFilesystem);
        }

        // FAT32 stores the root as a cluster chain and has no fixed table.
        if kind == FsKind::Fat32 {
            if n_root != 0 || fat16_size != 0 {
                return Err(Error::NoFilesystem);
            }
            self.root_cluster = ld32(b, 44);
            if self.root_cluster < 2 || self.root_cluster >= n_entries {
                return Err(Error::NoFilesystem);
            }
            let fsi = ld16(b, 48) as u64;
            if fsi != 0 && fsi != 0xFFFF {
                self.fsi_sector = self.vol_base + fsi;
            }
        } else {
            if n_root == 0 {
                return Err(Error::NoFilesystem);
            }
            self.root_cluster = 0;
        }

        self.kind = kind;
        self.csize = csize;
        self.n_fats = n_fats;
        self.fat_size = fat_size;
        self.n_root_entries = if kind == FsKind::Fat32 { 0 } else { n_root };
        self.n_entries = n_entries;
        self.fat_base = self.vol_base + n_rsv;
        self.root_base = self.fat_base + n_fats as u64 * fat_size as u64;
        self.data_base = self.root_base + root_sectors;
        self.vol_sectors = vol_sectors;

        if self.fsi_sector != 0 {
            self.load_fsinfo()?;
        }
        Ok(())
    }

    fn init_exfat(&mut self, b: &[u8; SECTOR_SIZE]) -> Result<()> {
        if b[11..64].iter().any(|&x| x != 0) {
            return Err(Error::NoFilesystem);
        }
        if ld16(b, 104) != 0x0100 {
            // FileSystemRevision other than 1.00
            return Err(Error::NoFilesystem);
        }
        if b[108] as usize != SECTOR_SIZE.trailing_zeros() as usize {
            return Err(Error::NoFilesystem);
        }
        let spc_shift = b[109];
        if spc_shift > 16 {
            return Err(Error::NoFilesystem);
        }
        if b[110] != 1 {
            return Err(Error::NoFilesystem);
        }
        let vol_sectors = ld64(b, 72);
        if vol_sectors < MIN_VOL_SECTORS {
            return Err(Error::NoFilesystem);
        }
        let fat_off = ld32(b, 80) as u64;
        let fat_size = ld32(b, 84);
        let heap_off = ld32(b, 88) as u64;
        let n_clusters = ld32(b, 92);
        let root = ld32(b, 96);
        if fat_off < 24 || fat_size == 0 || n_clusters == 0 {
            return Err(Error::NoFilesystem);
        }
        let n_entries = n_clusters + 2;
        if (fat_size as u64 * SECTOR_SIZE as u64) < n_entries as u64 * 4 {
            return Err(Error::NoFilesystem);
        }
        if root < 2 || root >= n_entries {
            return Err(Error::NoFilesystem);
        }

        self.kind = FsKind::ExFat;
        self.csize = 1 << spc_shift;
        self.n_fats = 1;
        self.fat_size = fat_size;
        self.n_root_entries = 0;
        self.n_entries = n_entries;
        self.fat_base = self.vol_base + fat_off;
        self.root_base = 0;
        self.data_base = self.vol_base + heap_off;
        self.root_cluster = root;
        self.vol_sectors = vol_sectors;

        // The allocation bitmap is authoritative for cluster state; find
        // its 0x81 entry in the root directory.
        let mut clst = root;
        'search: loop {
            let base = self.cluster_sector(clst);
            for s in 0..self.csize as u64 {
                self.move_window(base + s)?;
                for e in 0..SECTOR_SIZE / 32 {
                    let off = e * 32;
                    match self.win[off] {
                        0x00 => break 'search,
                        0x81 => {
                            let bcl = ld32(&self.win, off + 20);
                            if bcl < 2 || bcl >= self.n_entries {
                                return Err(Error::NoFilesystem);
                            }
                            self.bitmap_base = self.cluster_sector(bcl);
                            break 'search;
                        }
                        _ => {}
                    }
                }
            }
            match crate::fat::chain_next_raw(self, clst)? {
                Some(next) => clst = next,
                None => break,
            }
        }
        if self.bitmap_base == 0 {
            return Err(Error::NoFilesystem);
        }
        Ok(())
    }

    fn load_fsinfo(&mut self) -> Result<()> {
        self.move_window(self.fsi_sector)?;
        let w = &self.win;
        if ld32(w, 0) == FSI_LEAD_SIG && ld32(w, 484) == FSI_STRUCT_SIG && ld32(w, 508) == FSI_TRAIL_SIG
        {
            let free = ld32(w, 488);
            let next = ld32(w, 492);
            if free <= self.n_entries - 2 {
                self.free_count = free;
            }
            if (2..self.n_entries).contains(&next) {
                self.last_cluster = next;
            }
        }
        Ok(())
    }

    // ─── Sector window ─────────────────────────────────────────────────────────

    /// Make `sector` resident in the window, flushing the old content
    /// first when dirty.
    pub(crate) fn move_window(&mut self, sector: u64) -> Result<()> {
        if sector == self.win_sector {
            return Ok(());
        }
        self.flush_window()?;
        self.dev.read_sectors(sector, &mut self.win)?;
        self.win_sector = sector;
        Ok(())
    }

    /// Write the window back if dirty, mirroring FAT-area sectors to every
    /// secondary FAT copy.
    pub(crate) fn flush_window(&mut self) -> Result<()> {
        if !self.win_dirty {
            return Ok(());
        }
        self.dev.write_sectors(self.win_sector, &self.win)?;
        let fat_end = self.fat_base + self.fat_size as u64;
        if (self.fat_base..fat_end).contains(&self.win_sector) {
            for copy in 1..self.n_fats as u64 {
                let mirror = self.win_sector + copy * self.fat_size as u64;
                self.dev.write_sectors(mirror, &self.win)?;
            }
        }
        self.win_dirty = false;
        Ok(())
    }

    /// Read-only view of the resident sector.
    pub(crate) fn win(&self) -> &[u8; SECTOR_SIZE] {
        &self.win
    }

    /// Mutable view of the resident sector; marks the window dirty.
    pub(crate) fn win_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        self.win_dirty = true;
        &mut self.win
    }

    /// Zero a sector run directly, keeping the window coherent.
    pub(crate) fn clear_sectors(&mut self, start: u64, count: u64) -> Result<()> {
        self.flush_window()?;
        if (start..start + count).contains(&self.win_sector) {
            self.win_sector = NO_SECTOR;
        }
        let zero = [0u8; SECTOR_SIZE];
        for s in 0..count {
            self.dev.write_sectors(start + s, &zero)?;
        }
        Ok(())
    }

    /// Flush the window, persist FSInfo, and ask the device to sync.
    pub(crate) fn sync_fs(&mut self) -> Result<()> {
        self.flush_window()?;
        if self.kind == FsKind::Fat32 && self.fsi_dirty && self.fsi_sector != 0 {
            let mut sec = [0u8; SECTOR_SIZE];
            st32(&mut sec, 0, FSI_LEAD_SIG);
            st32(&mut sec, 484, FSI_STRUCT_SIG);
            st32(&mut sec, 488, self.free_count);
            st32(&mut sec, 492, self.last_cluster);
            st32(&mut sec, 508, FSI_TRAIL_SIG);
            self.dev.write_sectors(self.fsi_sector, &sec)?;
            self.fsi_dirty = false;
        }
        self.dev.ioctl(Ioctl::Sync)?;
        Ok(())
    }

    // ─── Shared helpers ────────────────────────────────────────────────────────

    /// First sector of a data cluster.
    pub(crate) fn cluster_sector(&self, clst: u32) -> u64 {
        self.data_base + (clst as u64 - 2) * self.csize as u64
    }

    /// Whether `clst` addresses a real data cluster on this volume.
    pub(crate) fn valid_cluster(&self, clst: u32) -> bool {
        (2..self.n_entries).contains(&clst)
    }

    /// Cluster size in bytes.
    pub(crate) fn cluster_bytes(&self) -> u32 {
        self.csize * SECTOR_SIZE as u32
    }

    pub(crate) fn now(&self) -> Timestamp {
        match self.clock {
            Some(f) => f(),
            None => Timestamp::DEFAULT,
        }
    }

    /// Guard used by every handle-taking operation.
    pub(crate) fn validate_id(&self, mount_id: u16) -> Result<()> {
        if mount_id != self.mount_id {
            return Err(Error::InvalidObject);
        }
        if self.dev.status().contains(DeviceStatus::NOT_READY) {
            return Err(Error::NotReady);
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.dev.status().contains(DeviceStatus::WRITE_PROTECTED) {
            return Err(Error::WriteProtected);
        }
        Ok(())
    }

    /// Filesystem kind of this volume.
    pub fn kind(&self) -> FsKind {
        self.kind
    }

    /// Number of free clusters, scanning the FAT or bitmap when the cached
    /// count is unknown.
    pub fn free_clusters(&mut self) -> Result<u32> {
        if self.free_count != FREE_UNKNOWN {
            return Ok(self.free_count);
        }
        let n = crate::fat::scan_free(self)?;
        self.free_count = n;
        if self.kind == FsKind::Fat32 {
            self.fsi_dirty = true;
        }
        Ok(n)
    }

    /// Adjust the cached free count if it is known.
    pub(crate) fn note_free_delta(&mut self, delta: i64) {
        if self.free_count != FREE_UNKNOWN {
            let n = (self.free_count as i64 + delta).clamp(0, (self.n_entries - 2) as i64);
            self.free_count = n as u32;
            if self.kind == FsKind::Fat32 {
                self.fsi_dirty = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_boot() -> [u8; SECTOR_SIZE] {
        [0u8; SECTOR_SIZE]
    }

    #[test]
    fn classify_rejects_garbage() {
        assert_eq!(classify_boot(&blank_boot()), BootKind::Invalid);
    }

    #[test]
    fn classify_sees_exfat_oem() {
        let mut b = blank_boot();
        b[3..11].copy_from_slice(b"EXFAT   ");
        st16(&mut b, 510, 0xAA55);
        assert_eq!(classify_boot(&b), BootKind::ExFat);
    }

    #[test]
    fn classify_sees_fat32_string() {
        let mut b = blank_boot();
        b[82..87].copy_from_slice(b"FAT32");
        st16(&mut b, 510, 0xAA55);
        assert_eq!(classify_boot(&b), BootKind::Fat);
    }

    #[test]
    fn classify_legacy_heuristic_without_signature() {
        // A believable FAT16 BPB with no 0xAA55 and no "FAT" string.
        let mut b = blank_boot();
        st16(&mut b, 11, 512);
        b[13] = 4;
        st16(&mut b, 14, 1);
        b[16] = 2;
        st16(&mut b, 17, 512);
        st16(&mut b, 19, 32768);
        st16(&mut b, 22, 64);
        assert_eq!(classify_boot(&b), BootKind::Fat);
    }

    #[test]
    fn classify_partition_table_is_valid_bs() {
        let mut b = blank_boot();
        b[446 + 4] = 0x0C;
        st32(&mut b, 446 + 8, 2048);
        st32(&mut b, 446 + 12, 100000);
        st16(&mut b, 510, 0xAA55);
        assert_eq!(classify_boot(&b), BootKind::ValidBs);
        let mut out = [0u64; 8];
        assert_eq!(mbr_candidates(&b, &mut out), 1);
        assert_eq!(out[0], 2048);
    }

    #[test]
    fn mbr_scan_skips_empty_slots() {
        let mut b = blank_boot();
        // slot 1 empty, slot 2 used
        let e = 446 + 16;
        b[e + 4] = 0x07;
        st32(&mut b, e + 8, 4096);
        st32(&mut b, e + 12, 8192);
        let mut out = [0u64; 8];
        assert_eq!(mbr_candidates(&b, &mut out), 1);
        assert_eq!(out[0], 4096);
    }
}
