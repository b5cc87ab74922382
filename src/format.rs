//! Volume formatter: geometry derivation, boot-sector/FAT/root writers,
//! the exFAT VBR set with its system clusters, and partition table
//! creation. Writes raw sectors and bypasses the mount state machine.

use crate::device::{self, BlockDevice, DeviceStatus, SECTOR_SIZE};
use crate::dir::upcase;
use crate::error::{Error, Result};
use crate::volume::{st16, st32, st64, BASIC_DATA_GUID, FsKind};

// ─── CRC-32 ────────────────────────────────────────────────────────────────────

const fn make_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = make_crc_table();

fn crc32_feed(mut state: u32, data: &[u8]) -> u32 {
    for &b in data {
        state = (state >> 8) ^ CRC32_TABLE[((state ^ b as u32) & 0xFF) as usize];
    }
    state
}

/// CRC-32 (IEEE, reflected) as used by GPT structures.
pub(crate) fn crc32(data: &[u8]) -> u32 {
    !crc32_feed(0xFFFF_FFFF, data)
}

// ─── Options ───────────────────────────────────────────────────────────────────

/// Filesystem family to format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatKind {
    /// Pick FAT12/16/32 or exFAT from the volume size.
    #[default]
    Any,
    /// Classic FAT only (sub-type still derived from the cluster count).
    Fat,
    Fat32,
    ExFat,
}

/// Formatting parameters. `Default` leaves everything derived.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub kind: FormatKind,
    /// Cluster size in sectors; 0 = derive from the volume size. Must be a
    /// power of two (≤ 128 for classic FAT).
    pub au_sectors: u32,
    /// FAT copies, 1 or 2 (classic FAT only).
    pub n_fats: u8,
    /// FAT12/16 root directory entries; 0 = 512.
    pub n_root_entries: u16,
    /// Lay the volume out at sector 0 with no partition table.
    pub superfloppy: bool,
}

impl Default for FormatOptions {
    fn default() -> FormatOptions {
        FormatOptions {
            kind: FormatKind::Any,
            au_sectors: 0,
            n_fats: 1,
            n_root_entries: 0,
            superfloppy: false,
        }
    }
}

/// exFAT is picked for requests at or past this many sectors (32 GB).
const EXFAT_AUTO_SECTORS: u64 = 0x0400_0000;
/// FAT32 is picked for volumes at or past this many sectors (512 MB).
const FAT32_AUTO_SECTORS: u64 = 0x0010_0000;

// ─── Entry points ──────────────────────────────────────────────────────────────

/// Format the device (or its first partition region) with a fresh volume.
pub fn format_volume<D: BlockDevice>(dev: &mut D, opts: &FormatOptions) -> Result<()> {
    let status = dev.initialize();
    if status.contains(DeviceStatus::NOT_READY) {
        return Err(Error::NotReady);
    }
    if status.contains(DeviceStatus::WRITE_PROTECTED) {
        return Err(Error::WriteProtected);
    }
    device::check_sector_size(dev)?;
    let total = device::sector_count(dev)?;
    if total < 128 {
        return Err(Error::MkfsAborted);
    }

    let gpt = total > u32::MAX as u64;
    let blk = device::block_size(dev) as u64;
    let base = if opts.superfloppy {
        0
    } else if gpt {
        2048.max(blk)
    } else {
        63.max(blk)
    };
    let tail = if gpt && !opts.superfloppy { 33 } else { 0 };
    if total <= base + tail + 128 {
        return Err(Error::MkfsAborted);
    }
    let sz_vol = total - base - tail;

    let exfat = match opts.kind {
        FormatKind::ExFat => true,
        FormatKind::Fat | FormatKind::Fat32 => false,
        FormatKind::Any => sz_vol >= EXFAT_AUTO_SECTORS || opts.au_sectors > 128,
    };
    let kind = if exfat {
        format_exfat(dev, base, sz_vol, opts)?
    } else {
        format_fat(dev, base, sz_vol, opts)?
    };

    if !opts.superfloppy {
        let ptype = mbr_part_type(kind, sz_vol);
        if gpt {
            write_gpt(dev, total, &[(base, sz_vol)])?;
        } else {
            write_mbr(dev, &[(base, sz_vol, ptype)])?;
        }
    }
    let _ = dev.ioctl(crate::device::Ioctl::Sync);
    log::info!("formatted {sz_vol} sectors at {base} as {kind:?}");
    Ok(())
}

/// Divide the device into partitions and write the table. Sizes are in
/// sectors; values up to 100 are percentages of the usable space. GPT is
/// used for devices past the 32-bit sector ceiling or more than 4 entries.
pub fn create_partitions<D: BlockDevice>(dev: &mut D, sizes: &[u64]) -> Result<()> {
    let status = dev.initialize();
    if status.contains(DeviceStatus::NOT_READY) {
        return Err(Error::NotReady);
    }
    if status.contains(DeviceStatus::WRITE_PROTECTED) {
        return Err(Error::WriteProtected);
    }
    device::check_sector_size(dev)?;
    let total = device::sector_count(dev)?;
    if sizes.is_empty() || sizes.len() > 128 {
        return Err(Error::InvalidParameter);
    }

    let gpt = total > u32::MAX as u64 || sizes.len() > 4;
    let first = if gpt { 34u64 } else { 63u64 };
    let tail = if gpt { 33u64 } else { 0 };
    if total <= first + tail {
        return Err(Error::InvalidParameter);
    }
    let usable = total - first - tail;

    let mut parts = [(0u64, 0u64); 128];
    let mut next = first;
    let mut n = 0usize;
    for &req in sizes {
        let sz = if req <= 100 { usable * req / 100 } else { req };
        if sz == 0 || next + sz > total - tail {
            break;
        }
        parts[n] = (next, sz);
        next += sz;
        n += 1;
    }
    if n == 0 {
        return Err(Error::InvalidParameter);
    }

    if gpt {
        write_gpt(dev, total, &parts[..n])?;
    } else {
        let mut mparts = [(0u64, 0u64, 0u8); 4];
        for i in 0..n {
            mparts[i] = (parts[i].0, parts[i].1, 0x07);
        }
        write_mbr(dev, &mparts[..n])?;
    }
    let _ = dev.ioctl(crate::device::Ioctl::Sync);
    log::info!("created {n} partition(s), {}", if gpt { "GPT" } else { "MBR" });
    Ok(())
}

// ─── Classic FAT geometry ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FatGeometry {
    kind: FsKind,
    /// Sectors per cluster.
    au: u32,
    sz_rsv: u32,
    /// Sectors per FAT copy.
    sz_fat: u32,
    n_fats: u8,
    n_root: u16,
    n_clst: u32,
}

fn default_au(sz_vol: u64) -> u32 {
    const LIMITS: [(u64, u32); 6] = [
        (0x0002_0000, 1),  // ≤ 64 MB
        (0x0008_0000, 4),  // ≤ 256 MB
        (0x0010_0000, 8),  // ≤ 512 MB
        (0x0100_0000, 16), // ≤ 8 GB
        (0x0800_0000, 32), // ≤ 64 GB
        (u64::MAX, 64),
    ];
    for &(lim, au) in LIMITS.iter() {
        if sz_vol <= lim {
            return au;
        }
    }
    64
}

/// Derive cluster size, FAT sub-type and the area sizes for a classic FAT
/// volume. Retries with the next cluster size whenever the derived cluster
/// count falls outside the sub-type's valid range.
fn derive_fat_geometry(sz_vol: u64, opts: &FormatOptions) -> Result<FatGeometry> {
    let n_fats = if opts.n_fats == 2 { 2u8 } else { 1 };
    let n_root = if opts.n_root_entries != 0 { opts.n_root_entries } else { 512 };
    let mut au = if opts.au_sectors != 0 { opts.au_sectors } else { default_au(sz_vol) };
    if !au.is_power_of_two() || au > 128 {
        return Err(Error::InvalidParameter);
    }
    let mut want32 =
        opts.kind == FormatKind::Fat32 || (opts.kind == FormatKind::Any && sz_vol >= FAT32_AUTO_SECTORS);
    // Set once FAT16 overflows into FAT32, so a FAT32 shortfall cannot
    // flip back and loop.
    let mut bounced = false;

    loop {
        let estimate = sz_vol / au as u64;
        let (kind, sz_rsv, sz_dir) = if want32 {
            (FsKind::Fat32, 32u32, 0u32)
        } else {
            let kind = if estimate <= 0xFF5 { FsKind::Fat12 } else { FsKind::Fat16 };
            (kind, 1, (n_root as u32 * 32).div_ceil(SECTOR_SIZE as u32))
        };

        // Two passes settle the FAT size / cluster count interdependence.
        let mut n_clst = estimate;
        let mut sz_fat = 0u64;
        for _ in 0..2 {
            let entry_bytes = match kind {
                FsKind::Fat12 => (n_clst + 2) * 3 / 2 + 1,
                FsKind::Fat16 => (n_clst + 2) * 2,
                _ => (n_clst + 2) * 4,
            };
            sz_fat = entry_bytes.div_ceil(SECTOR_SIZE as u64);
            let sys = sz_rsv as u64 + sz_fat * n_fats as u64 + sz_dir as u64;
            if sz_vol <= sys {
                return Err(Error::MkfsAborted);
            }
            n_clst = (sz_vol - sys) / au as u64;
        }

        match kind {
            FsKind::Fat32 => {
                if n_clst > 0x0FFF_FFF5 {
                    if au < 128 {
                        au *= 2;
                        continue;
                    }
                    return Err(Error::MkfsAborted);
                }
                if n_clst < 65525 {
                    // Too few clusters for FAT32: shrink the cluster, or
                    // fall back to FAT16 when the family is free.
                    if opts.kind != FormatKind::Fat32 && !bounced {
                        want32 = false;
                        continue;
                    }
                    if au > 1 && opts.au_sectors == 0 {
                        au /= 2;
                        continue;
                    }
                    return Err(Error::MkfsAborted);
                }
            }
            FsKind::Fat12 | FsKind::Fat16 => {
                if n_clst > 0xFFF5 {
                    // Grow the cluster first; switching straight to FAT32
                    // could land below its minimum and bounce back here.
                    if au < 128 && opts.au_sectors == 0 {
                        au *= 2;
                        continue;
                    }
                    if opts.kind == FormatKind::Any {
                        want32 = true;
                        bounced = true;
                        continue;
                    }
                    return Err(Error::MkfsAborted);
                }
                if n_clst == 0 {
                    return Err(Error::MkfsAborted);
                }
                // The settled count may have crossed the 12/16 boundary.
                let settled = if n_clst <= 0xFF5 { FsKind::Fat12 } else { FsKind::Fat16 };
                if settled != kind {
                    continue;
                }
            }
            FsKind::ExFat => return Err(Error::Internal),
        }

        return Ok(FatGeometry {
            kind,
            au,
            sz_rsv,
            sz_fat: sz_fat as u32,
            n_fats,
            n_root: if kind == FsKind::Fat32 { 0 } else { n_root },
            n_clst: n_clst as u32,
        });
    }
}

// ─── Classic FAT writer ────────────────────────────────────────────────────────

fn volume_serial(sz_vol: u64, base: u64) -> u32 {
    let mut x = sz_vol ^ (base << 32) ^ 0x9E37_79B9_7F4A_7C15;
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 27;
    (x ^ (x >> 32)) as u32
}

fn zero_sectors<D: BlockDevice>(dev: &mut D, start: u64, count: u64) -> Result<()> {
    let zero = [0u8; SECTOR_SIZE];
    for s in 0..count {
        dev.write_sectors(start + s, &zero)?;
    }
    Ok(())
}

fn format_fat<D: BlockDevice>(
    dev: &mut D,
    base: u64,
    sz_vol: u64,
    opts: &FormatOptions,
) -> Result<FsKind> {
    let g = derive_fat_geometry(sz_vol, opts)?;
    let serial = volume_serial(sz_vol, base);

    let mut b = [0u8; SECTOR_SIZE];
    b[0] = 0xEB;
    b[1] = 0xFE;
    b[2] = 0x90;
    b[3..11].copy_from_slice(b"MSDOS5.0");
    st16(&mut b, 11, SECTOR_SIZE as u16);
    b[13] = g.au as u8;
    st16(&mut b, 14, g.sz_rsv as u16);
    b[16] = g.n_fats;
    st16(&mut b, 17, g.n_root);
    if g.kind != FsKind::Fat32 && sz_vol < 0x1_0000 {
        st16(&mut b, 19, sz_vol as u16);
    } else {
        st32(&mut b, 32, sz_vol as u32);
    }
    b[21] = 0xF8;
    st16(&mut b, 24, 63);
    st16(&mut b, 26, 255);
    st32(&mut b, 28, base as u32);
    if g.kind == FsKind::Fat32 {
        st32(&mut b, 36, g.sz_fat);
        st32(&mut b, 44, 2); // root cluster
        st16(&mut b, 48, 1); // FSInfo
        st16(&mut b, 50, 6); // backup boot
        b[64] = 0x80;
        b[66] = 0x29;
        st32(&mut b, 67, serial);
        b[71..82].copy_from_slice(b"NO NAME    ");
        b[82..90].copy_from_slice(b"FAT32   ");
    } else {
        st16(&mut b, 22, g.sz_fat as u16);
        b[36] = 0x80;
        b[38] = 0x29;
        st32(&mut b, 39, serial);
        b[43..54].copy_from_slice(b"NO NAME    ");
        b[54..62].copy_from_slice(if g.kind == FsKind::Fat12 {
            b"FAT12   "
        } else {
            b"FAT16   "
        });
    }
    st16(&mut b, 510, 0xAA55);
    dev.write_sectors(base, &b)?;

    if g.kind == FsKind::Fat32 {
        dev.write_sectors(base + 6, &b)?;
        let mut fsi = [0u8; SECTOR_SIZE];
        st32(&mut fsi, 0, 0x4161_5252);
        st32(&mut fsi, 484, 0x6141_7272);
        st32(&mut fsi, 488, g.n_clst - 1); // root takes cluster 2
        st32(&mut fsi, 492, 2);
        st16(&mut fsi, 510, 0xAA55);
        dev.write_sectors(base + 1, &fsi)?;
        dev.write_sectors(base + 7, &fsi)?;
        // The other reserved sectors must not look like boot sectors.
        zero_sectors(dev, base + 2, 4)?;
        zero_sectors(dev, base + 8, 4)?;
    }

    // FAT copies: zeroed, with the reserved entries seeded.
    let fat_base = base + g.sz_rsv as u64;
    for copy in 0..g.n_fats as u64 {
        let start = fat_base + copy * g.sz_fat as u64;
        zero_sectors(dev, start, g.sz_fat as u64)?;
        let mut f = [0u8; SECTOR_SIZE];
        match g.kind {
            FsKind::Fat12 => {
                f[0] = 0xF8;
                f[1] = 0xFF;
                f[2] = 0xFF;
            }
            FsKind::Fat16 => {
                st16(&mut f, 0, 0xFFF8);
                st16(&mut f, 2, 0xFFFF);
            }
            _ => {
                st32(&mut f, 0, 0x0FFF_FFF8);
                st32(&mut f, 4, 0xFFFF_FFFF);
                st32(&mut f, 8, 0x0FFF_FFFF); // root directory chain
            }
        }
        dev.write_sectors(start, &f)?;
    }

    // Root directory area (FAT32: the root's first cluster).
    let dir_base = fat_base + g.n_fats as u64 * g.sz_fat as u64;
    let dir_sectors = if g.kind == FsKind::Fat32 {
        g.au as u64
    } else {
        (g.n_root as u64 * 32).div_ceil(SECTOR_SIZE as u64)
    };
    zero_sectors(dev, dir_base, dir_sectors)?;

    Ok(g.kind)
}

// ─── exFAT writer ──────────────────────────────────────────────────────────────

/// Rolling checksum over the 11 VBR sectors; the volume-flags and
/// percent-in-use bytes of sector 0 are excluded.
fn vbr_sum(mut sum: u32, sector_index: u64, b: &[u8; SECTOR_SIZE]) -> u32 {
    for (i, &byte) in b.iter().enumerate() {
        if sector_index == 0 && matches!(i, 106 | 107 | 112) {
            continue;
        }
        sum = sum.rotate_right(1).wrapping_add(byte as u32);
    }
    sum
}

/// Generate the run-length-compressed up-case table. Identity runs of 128
/// units or more collapse to a `0xFFFF, length` pair.
fn build_upcase(out: &mut [u16]) -> usize {
    let mut n = 0usize;
    let mut si = 0u32;
    while si < 0x1_0000 {
        let wc = upcase(si as u16);
        if wc as u32 != si {
            out[n] = wc;
            n += 1;
            si += 1;
            continue;
        }
        let mut j = 1u32;
        while si + j < 0x1_0000 && upcase((si + j) as u16) as u32 == si + j {
            j += 1;
        }
        if j >= 128 {
            out[n] = 0xFFFF;
            out[n + 1] = j as u16;
            n += 2;
        } else {
            for k in 0..j {
                out[n] = (si + k) as u16;
                n += 1;
            }
        }
        si += j;
    }
    n
}

fn format_exfat<D: BlockDevice>(
    dev: &mut D,
    base: u64,
    sz_vol: u64,
    opts: &FormatOptions,
) -> Result<FsKind> {
    if sz_vol < 0x1000 {
        return Err(Error::MkfsAborted);
    }
    let au = if opts.au_sectors != 0 {
        opts.au_sectors
    } else if sz_vol >= 0x0400_0000 {
        256
    } else if sz_vol >= 0x0008_0000 {
        64
    } else {
        8
    };
    if !au.is_power_of_two() || au > 32768 {
        return Err(Error::InvalidParameter);
    }
    let cb = au as u64 * SECTOR_SIZE as u64;

    // Reserved area holds both 12-sector VBR copies.
    let sz_rsv = 32u64;
    let mut n_clst = sz_vol / au as u64;
    let mut sz_fat = 0u64;
    let mut heap_ofs = 0u64;
    for _ in 0..2 {
        sz_fat = ((n_clst + 2) * 4).div_ceil(SECTOR_SIZE as u64);
        heap_ofs = (sz_rsv + sz_fat).div_ceil(au as u64) * au as u64;
        if heap_ofs >= sz_vol {
            return Err(Error::MkfsAborted);
        }
        n_clst = (sz_vol - heap_ofs) / au as u64;
    }
    if n_clst < 16 || n_clst > 0xFFFF_FFF5 {
        return Err(Error::MkfsAborted);
    }

    // System clusters: allocation bitmap, up-case table, root directory.
    let bitmap_bytes = n_clst.div_ceil(8);
    let nb = bitmap_bytes.div_ceil(cb);
    let mut upcase_buf = [0u16; 1024];
    let upcase_units = build_upcase(&mut upcase_buf);
    let upcase_bytes = (upcase_units * 2) as u64;
    let nu = upcase_bytes.div_ceil(cb);
    let root_clst = 2 + nb + nu;
    if nb + nu + 1 + 2 > n_clst {
        return Err(Error::MkfsAborted);
    }

    let fat_start = base + sz_rsv;
    let heap_start = base + heap_ofs;

    // FAT: zeroed, then the reserved entries and system chains.
    zero_sectors(dev, fat_start, sz_fat)?;
    let eoc = 0xFFFF_FFFFu32;
    let seeded = root_clst + 1; // entries 0..=root_clst are non-free
    let mut s = 0u64;
    while s * 128 < seeded {
        let mut f = [0u8; SECTOR_SIZE];
        for slot in 0..128u64 {
            let c = s * 128 + slot;
            let v = if c == 0 {
                0xFFFF_FFF8
            } else if c == 1 {
                eoc
            } else if c < 2 + nb {
                if c + 1 == 2 + nb { eoc } else { c as u32 + 1 }
            } else if c < 2 + nb + nu {
                if c + 1 == 2 + nb + nu { eoc } else { c as u32 + 1 }
            } else if c == root_clst {
                eoc
            } else {
                0
            };
            st32(&mut f, (slot * 4) as usize, v);
        }
        dev.write_sectors(fat_start + s, &f)?;
        s += 1;
    }

    // Allocation bitmap: system clusters in use, everything else free.
    let sys = nb + nu + 1;
    zero_sectors(dev, heap_start, nb * au as u64)?;
    let full = sys / 8;
    let rest = (sys % 8) as u8;
    let mut written = 0u64;
    let mut sec = heap_start;
    while written < full + 1 {
        let mut bmp = [0u8; SECTOR_SIZE];
        let mut any = false;
        for i in 0..SECTOR_SIZE as u64 {
            let byte = written + i;
            if byte < full {
                bmp[i as usize] = 0xFF;
                any = true;
            } else if byte == full && rest != 0 {
                bmp[i as usize] = (1u8 << rest) - 1;
                any = true;
            }
        }
        if any {
            dev.write_sectors(sec, &bmp)?;
        }
        written += SECTOR_SIZE as u64;
        sec += 1;
    }

    // Up-case table data.
    let upcase_start = heap_start + nb * au as u64;
    zero_sectors(dev, upcase_start, nu * au as u64)?;
    let mut off = 0usize;
    let mut sec = upcase_start;
    while off < upcase_units {
        let mut t = [0u8; SECTOR_SIZE];
        let n = (upcase_units - off).min(SECTOR_SIZE / 2);
        for i in 0..n {
            st16(&mut t, i * 2, upcase_buf[off + i]);
        }
        dev.write_sectors(sec, &t)?;
        off += n;
        sec += 1;
    }
    let mut upcase_sum = 0u32;
    for &u in &upcase_buf[..upcase_units] {
        upcase_sum = table_sum_step(upcase_sum, u);
    }

    // Root directory: bitmap and up-case entries in the first two slots.
    let root_start = heap_start + (root_clst - 2) * au as u64;
    zero_sectors(dev, root_start, au as u64)?;
    let mut r = [0u8; SECTOR_SIZE];
    r[0] = 0x81;
    st32(&mut r, 20, 2);
    st64(&mut r, 24, bitmap_bytes);
    r[32] = 0x82;
    st32(&mut r, 32 + 4, upcase_sum);
    st32(&mut r, 32 + 20, (2 + nb) as u32);
    st64(&mut r, 32 + 24, upcase_bytes);
    dev.write_sectors(root_start, &r)?;

    // VBR: boot sector, 8 extended boot sectors, 2 reserved, checksum
    // sector; two copies.
    let mut boot = [0u8; SECTOR_SIZE];
    boot[0] = 0xEB;
    boot[1] = 0x76;
    boot[2] = 0x90;
    boot[3..11].copy_from_slice(b"EXFAT   ");
    st64(&mut boot, 64, base);
    st64(&mut boot, 72, sz_vol);
    st32(&mut boot, 80, sz_rsv as u32);
    st32(&mut boot, 84, sz_fat as u32);
    st32(&mut boot, 88, heap_ofs as u32);
    st32(&mut boot, 92, n_clst as u32);
    st32(&mut boot, 96, root_clst as u32);
    st32(&mut boot, 100, volume_serial(sz_vol, base));
    st16(&mut boot, 104, 0x0100);
    boot[108] = 9;
    boot[109] = au.trailing_zeros() as u8;
    boot[110] = 1;
    boot[111] = 0x80;
    st16(&mut boot, 510, 0xAA55);

    let mut ext = [0u8; SECTOR_SIZE];
    st16(&mut ext, 510, 0xAA55);
    let blank = [0u8; SECTOR_SIZE];

    let mut sum = 0u32;
    sum = vbr_sum(sum, 0, &boot);
    for i in 1..=8 {
        sum = vbr_sum(sum, i, &ext);
    }
    sum = vbr_sum(sum, 9, &blank);
    sum = vbr_sum(sum, 10, &blank);
    let mut sumsec = [0u8; SECTOR_SIZE];
    for i in 0..SECTOR_SIZE / 4 {
        st32(&mut sumsec, i * 4, sum);
    }

    for copy in 0..2u64 {
        let at = base + copy * 12;
        dev.write_sectors(at, &boot)?;
        for i in 1..=8 {
            dev.write_sectors(at + i, &ext)?;
        }
        dev.write_sectors(at + 9, &blank)?;
        dev.write_sectors(at + 10, &blank)?;
        dev.write_sectors(at + 11, &sumsec)?;
    }

    Ok(FsKind::ExFat)
}

fn table_sum_step(sum: u32, unit: u16) -> u32 {
    let mut s = sum;
    for b in unit.to_le_bytes() {
        s = s.rotate_right(1).wrapping_add(b as u32);
    }
    s
}

// ─── Partition tables ──────────────────────────────────────────────────────────

fn mbr_part_type(kind: FsKind, sz_vol: u64) -> u8 {
    match kind {
        FsKind::Fat12 => 0x01,
        FsKind::Fat16 => {
            if sz_vol < 0x1_0000 {
                0x04
            } else {
                0x06
            }
        }
        FsKind::Fat32 => 0x0C,
        FsKind::ExFat => 0x07,
    }
}

fn chs(out: &mut [u8], lba: u64) {
    if lba >= 255 * 63 * 1024 {
        out[0] = 0xFE;
        out[1] = 0xFF;
        out[2] = 0xFF;
        return;
    }
    let c = lba / (255 * 63);
    let h = (lba / 63) % 255;
    let s = lba % 63 + 1;
    out[0] = h as u8;
    out[1] = (s as u8) | (((c >> 8) as u8) << 6);
    out[2] = c as u8;
}

fn write_mbr<D: BlockDevice>(dev: &mut D, parts: &[(u64, u64, u8)]) -> Result<()> {
    let mut b = [0u8; SECTOR_SIZE];
    for (i, &(start, size, ptype)) in parts.iter().enumerate().take(4) {
        let e = 446 + i * 16;
        chs(&mut b[e + 1..e + 4], start);
        b[e + 4] = ptype;
        chs(&mut b[e + 5..e + 8], start + size - 1);
        st32(&mut b, e + 8, start as u32);
        st32(&mut b, e + 12, size as u32);
    }
    st16(&mut b, 510, 0xAA55);
    dev.write_sectors(0, &b)
}

fn pseudo_guid(seed: u64) -> [u8; 16] {
    fn mix(mut x: u64) -> u64 {
        x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
        x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        x ^ (x >> 31)
    }
    let a = mix(seed);
    let b = mix(a ^ seed.rotate_left(32));
    let mut g = [0u8; 16];
    g[..8].copy_from_slice(&a.to_le_bytes());
    g[8..].copy_from_slice(&b.to_le_bytes());
    g[7] = (g[7] & 0x0F) | 0x40;
    g[8] = (g[8] & 0x3F) | 0x80;
    g
}

/// Write a GPT: protective MBR, primary and backup headers, and the two
/// entry arrays, each CRC32-protected.
fn write_gpt<D: BlockDevice>(dev: &mut D, total: u64, parts: &[(u64, u64)]) -> Result<()> {
    const N_ENTRIES: u64 = 128;
    const ENTRY_SIZE: usize = 128;
    let entry_sectors = N_ENTRIES * ENTRY_SIZE as u64 / SECTOR_SIZE as u64; // 32

    // Protective MBR.
    let mut b = [0u8; SECTOR_SIZE];
    b[446 + 4] = 0xEE;
    chs(&mut b[446 + 1..446 + 4], 1);
    chs(&mut b[446 + 5..446 + 8], total.min(u32::MAX as u64) - 1);
    st32(&mut b, 446 + 8, 1);
    st32(&mut b, 446 + 12, (total - 1).min(u32::MAX as u64) as u32);
    st16(&mut b, 510, 0xAA55);
    dev.write_sectors(0, &b)?;

    // Entry arrays, primary at LBA 2 and backup in the last 32+1 sectors.
    let mut entries_crc = 0xFFFF_FFFFu32;
    let per_sector = SECTOR_SIZE / ENTRY_SIZE;
    for s in 0..entry_sectors {
        let mut sec = [0u8; SECTOR_SIZE];
        for slot in 0..per_sector {
            let idx = s as usize * per_sector + slot;
            if idx >= parts.len() {
                continue;
            }
            let (start, size) = parts[idx];
            let e = slot * ENTRY_SIZE;
            sec[e..e + 16].copy_from_slice(&BASIC_DATA_GUID);
            sec[e + 16..e + 32].copy_from_slice(&pseudo_guid(total ^ ((idx as u64) << 48)));
            st64(&mut sec, e + 32, start);
            st64(&mut sec, e + 40, start + size - 1);
        }
        entries_crc = crc32_feed(entries_crc, &sec);
        dev.write_sectors(2 + s, &sec)?;
        dev.write_sectors(total - 33 + s, &sec)?;
    }
    let entries_crc = !entries_crc;

    let mut hdr = [0u8; SECTOR_SIZE];
    hdr[..8].copy_from_slice(b"EFI PART");
    st32(&mut hdr, 8, 0x0001_0000);
    st32(&mut hdr, 12, 92);
    st64(&mut hdr, 24, 1);
    st64(&mut hdr, 32, total - 1);
    st64(&mut hdr, 40, 2 + entry_sectors);
    st64(&mut hdr, 48, total - 34);
    hdr[56..72].copy_from_slice(&pseudo_guid(total));
    st64(&mut hdr, 72, 2);
    st32(&mut hdr, 80, N_ENTRIES as u32);
    st32(&mut hdr, 84, ENTRY_SIZE as u32);
    st32(&mut hdr, 88, entries_crc);
    let hdr_crc = crc32(&hdr[..92]);
    st32(&mut hdr, 16, hdr_crc);
    dev.write_sectors(1, &hdr)?;

    // Backup header mirrors the primary with the roles swapped.
    st32(&mut hdr, 16, 0);
    st64(&mut hdr, 24, total - 1);
    st64(&mut hdr, 32, 1);
    st64(&mut hdr, 72, total - 33);
    let backup_crc = crc32(&hdr[..92]);
    st32(&mut hdr, 16, backup_crc);
    dev.write_sectors(total - 1, &hdr)?;
    Ok(())
}

// ─── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_reference_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn geometry_small_volume_is_fat12() {
        let g = derive_fat_geometry(2880, &FormatOptions::default()).unwrap();
        assert_eq!(g.kind, FsKind::Fat12);
        assert_eq!(g.au, 1);
    }

    #[test]
    fn geometry_16mb_is_fat16() {
        let g = derive_fat_geometry(32768, &FormatOptions::default()).unwrap();
        assert_eq!(g.kind, FsKind::Fat16);
        assert!(g.n_clst > 0xFF5 && g.n_clst <= 0xFFF5);
    }

    #[test]
    fn geometry_large_volume_is_fat32() {
        // 1 GB.
        let g = derive_fat_geometry(0x0020_0000, &FormatOptions::default()).unwrap();
        assert_eq!(g.kind, FsKind::Fat32);
        assert!(g.n_clst >= 65525);
    }

    #[test]
    fn geometry_forced_fat32_below_auto_threshold() {
        let opts = FormatOptions { kind: FormatKind::Fat32, ..FormatOptions::default() };
        // 64 MB: only reaches 65525 clusters with 1-sector clusters.
        let g = derive_fat_geometry(0x0002_0000, &opts).unwrap();
        assert_eq!(g.kind, FsKind::Fat32);
        assert!(g.n_clst >= 65525);
    }

    #[test]
    fn geometry_rejects_bad_cluster_size() {
        let opts = FormatOptions { au_sectors: 3, ..FormatOptions::default() };
        assert!(matches!(
            derive_fat_geometry(32768, &opts),
            Err(Error::InvalidParameter)
        ));
    }

    #[test]
    fn geometry_aborts_on_tiny_volume() {
        assert!(matches!(
            derive_fat_geometry(8, &FormatOptions::default()),
            Err(Error::MkfsAborted)
        ));
    }

    #[test]
    fn upcase_table_expands_back_to_function() {
        let mut buf = [0u16; 1024];
        let n = build_upcase(&mut buf);
        assert!(n > 0 && n < buf.len());
        // Decompress and compare against the case-fold function.
        let mut si = 0u32;
        let mut i = 0usize;
        while i < n {
            if buf[i] == 0xFFFF && i + 1 < n {
                si += buf[i + 1] as u32;
                i += 2;
            } else {
                assert_eq!(buf[i], upcase(si as u16), "unit {si:#x}");
                si += 1;
                i += 1;
            }
        }
        assert_eq!(si, 0x1_0000);
    }

    #[test]
    fn vbr_checksum_ignores_volatile_bytes() {
        let mut b = [0u8; SECTOR_SIZE];
        b[0] = 0xEB;
        let sum = vbr_sum(0, 0, &b);
        b[106] = 0xFF;
        b[112] = 0x55;
        assert_eq!(vbr_sum(0, 0, &b), sum);
        b[50] = 1;
        assert_ne!(vbr_sum(0, 0, &b), sum);
    }
}
