//! File I/O: open handles, buffered read/write with a multi-sector fast
//! path, seeking, truncation, and metadata write-back.

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::dir::{ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_READ_ONLY, EntryLoc, FileInfo, PathTarget, XDirBuf};
use crate::error::{Error, Result};
use crate::fat::{self, Chain, ChainStatus, ClusterStatus};
use crate::volume::{ld16, st16, st32, st64, Volume, NO_SECTOR};

bitflags::bitflags! {
    /// File access and creation disposition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        /// Fail when the file already exists.
        const CREATE_NEW = 0x04;
        /// Create, truncating any existing file.
        const CREATE_ALWAYS = 0x08;
        /// Open, creating the file when missing.
        const OPEN_ALWAYS = 0x10;
        /// Open or create, positioned at the end.
        const OPEN_APPEND = 0x30;
    }
}

impl OpenMode {
    fn creates(self) -> bool {
        self.intersects(OpenMode::CREATE_NEW | OpenMode::CREATE_ALWAYS | OpenMode::OPEN_ALWAYS)
    }
}

/// An open file. Plain data: dropping it without [`Volume::close`] loses
/// nothing but unflushed writes.
pub struct FileHandle {
    pub(crate) mount_id: u16,
    mode: OpenMode,
    chain: Chain,
    loc: EntryLoc,
    size: u64,
    fptr: u64,
    /// Cluster holding `fptr` and its ordinal within the chain.
    clst: u32,
    clst_idx: u32,
    /// Private one-sector data cache.
    buf: [u8; SECTOR_SIZE],
    buf_sector: u64,
    buf_dirty: bool,
    modified: bool,
}

impl FileHandle {
    /// Current file position.
    pub fn tell(&self) -> u64 {
        self.fptr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn eof(&self) -> bool {
        self.fptr >= self.size
    }
}

impl<D: BlockDevice> Volume<D> {
    // ─── Open and close ────────────────────────────────────────────────────────

    /// Open a file by path.
    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle> {
        if !mode.intersects(OpenMode::READ | OpenMode::WRITE) {
            return Err(Error::InvalidParameter);
        }
        if mode.contains(OpenMode::WRITE) || mode.creates() {
            self.check_writable()?;
        }

        let mut fi = FileInfo::new();
        let (mut dp, target, nb) = self.follow_path(path, &mut fi)?;
        let (loc, size, chain) = match target {
            PathTarget::Root => return Err(Error::InvalidName),
            PathTarget::Found(o) => {
                if mode.contains(OpenMode::CREATE_NEW) {
                    return Err(Error::Exist);
                }
                if o.attr & ATTR_DIRECTORY != 0 {
                    return Err(Error::NoFile);
                }
                // Truncating dispositions count as writes here too.
                if o.attr & ATTR_READ_ONLY != 0
                    && mode.intersects(OpenMode::WRITE | OpenMode::CREATE_ALWAYS)
                {
                    return Err(Error::Denied);
                }
                if mode.contains(OpenMode::CREATE_ALWAYS) {
                    // Truncate in place: free the data, zero the entry.
                    if o.sclust != 0 {
                        let mut chain = self.obj_chain(&o);
                        fat::remove_chain(self, &mut chain, o.sclust, 0)?;
                    }
                    self.store_file_entry(&o.loc, &Chain::empty(), 0)?;
                    (o.loc, 0, Chain::empty())
                } else {
                    (o.loc, o.size, self.obj_chain(&o))
                }
            }
            PathTarget::Missing => {
                if !mode.creates() {
                    return Err(Error::NoFile);
                }
                let loc = self.register(&mut dp, &nb, ATTR_ARCHIVE)?;
                (loc, 0, Chain::empty())
            }
        };

        let mut fh = FileHandle {
            mount_id: self.mount_id,
            mode,
            chain,
            loc,
            size,
            fptr: 0,
            clst: 0,
            clst_idx: 0,
            buf: [0; SECTOR_SIZE],
            buf_sector: NO_SECTOR,
            buf_dirty: false,
            modified: false,
        };
        if mode.contains(OpenMode::OPEN_APPEND) {
            fh.fptr = fh.size;
        }
        Ok(fh)
    }

    /// Flush and, when opened for writing, sync metadata, then discard the
    /// handle.
    pub fn close(&mut self, mut fh: FileHandle) -> Result<()> {
        if fh.mode.contains(OpenMode::WRITE) {
            self.sync(&mut fh)
        } else {
            self.validate_id(fh.mount_id)
        }
    }

    // ─── Data transfer ─────────────────────────────────────────────────────────

    /// Read up to `buf.len()` bytes at the file position. Returns the bytes
    /// read, which is short only at end of file.
    pub fn read(&mut self, fh: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        self.validate_id(fh.mount_id)?;
        if !fh.mode.contains(OpenMode::READ) {
            return Err(Error::Denied);
        }
        let remain = fh.size.saturating_sub(fh.fptr);
        let total = (buf.len() as u64).min(remain) as usize;
        let mut done = 0usize;
        while done < total {
            let sector = match self.map_cluster(fh, false)? {
                Some(s) => s,
                None => return Err(Error::Internal),
            };
            let ofs = (fh.fptr % SECTOR_SIZE as u64) as usize;
            let left = total - done;
            if ofs == 0 && left >= SECTOR_SIZE {
                // Whole sectors, clipped at the cluster boundary.
                let cb = self.cluster_bytes() as u64;
                let in_cluster = ((cb - fh.fptr % cb) / SECTOR_SIZE as u64) as usize;
                let n = (left / SECTOR_SIZE).min(in_cluster);
                self.drop_file_cache(fh, sector, n as u64)?;
                self.dev
                    .read_sectors(sector, &mut buf[done..done + n * SECTOR_SIZE])?;
                done += n * SECTOR_SIZE;
                fh.fptr += (n * SECTOR_SIZE) as u64;
            } else {
                self.load_file_sector(fh, sector, false)?;
                let n = (SECTOR_SIZE - ofs).min(left);
                buf[done..done + n].copy_from_slice(&fh.buf[ofs..ofs + n]);
                done += n;
                fh.fptr += n as u64;
            }
        }
        Ok(done)
    }

    /// Write `data` at the file position, allocating clusters as needed.
    /// Returns the bytes written; a short count means the volume filled up.
    pub fn write(&mut self, fh: &mut FileHandle, data: &[u8]) -> Result<usize> {
        self.validate_id(fh.mount_id)?;
        if !fh.mode.contains(OpenMode::WRITE) {
            return Err(Error::Denied);
        }
        self.check_writable()?;
        if fh.fptr > fh.size {
            // A previous seek ran past the end: zero the gap first.
            let target = fh.fptr;
            self.zero_fill(fh, target)?;
        }
        self.write_inner(fh, data)
    }

    fn write_inner(&mut self, fh: &mut FileHandle, data: &[u8]) -> Result<usize> {
        let mut done = 0usize;
        while done < data.len() {
            let sector = match self.map_cluster(fh, true)? {
                Some(s) => s,
                // Volume full: report the short write.
                None => break,
            };
            let ofs = (fh.fptr % SECTOR_SIZE as u64) as usize;
            let left = data.len() - done;
            if ofs == 0 && left >= SECTOR_SIZE {
                let cb = self.cluster_bytes() as u64;
                let in_cluster = ((cb - fh.fptr % cb) / SECTOR_SIZE as u64) as usize;
                let n = (left / SECTOR_SIZE).min(in_cluster);
                self.drop_file_cache(fh, sector, n as u64)?;
                self.dev
                    .write_sectors(sector, &data[done..done + n * SECTOR_SIZE])?;
                done += n * SECTOR_SIZE;
                fh.fptr += (n * SECTOR_SIZE) as u64;
            } else {
                self.load_file_sector(fh, sector, true)?;
                let n = (SECTOR_SIZE - ofs).min(left);
                fh.buf[ofs..ofs + n].copy_from_slice(&data[done..done + n]);
                fh.buf_dirty = true;
                done += n;
                fh.fptr += n as u64;
            }
            if fh.fptr > fh.size {
                fh.size = fh.fptr;
            }
            fh.modified = true;
        }
        Ok(done)
    }

    /// Append zeros until the file reaches `target` bytes.
    fn zero_fill(&mut self, fh: &mut FileHandle, target: u64) -> Result<()> {
        let zeros = [0u8; SECTOR_SIZE];
        fh.fptr = fh.size;
        while fh.size < target {
            let n = (target - fh.size).min(SECTOR_SIZE as u64) as usize;
            if self.write_inner(fh, &zeros[..n])? < n {
                return Err(Error::Denied);
            }
        }
        Ok(())
    }

    // ─── Position and size ─────────────────────────────────────────────────────

    /// Move the file position. Positions past the end are clamped unless the
    /// file is writable, in which case the write path fills the gap.
    pub fn seek(&mut self, fh: &mut FileHandle, ofs: u64) -> Result<()> {
        self.validate_id(fh.mount_id)?;
        fh.fptr = if fh.mode.contains(OpenMode::WRITE) {
            ofs
        } else {
            ofs.min(fh.size)
        };
        Ok(())
    }

    /// Cut the file at the current position, freeing the tail clusters.
    pub fn truncate(&mut self, fh: &mut FileHandle) -> Result<()> {
        self.validate_id(fh.mount_id)?;
        if !fh.mode.contains(OpenMode::WRITE) {
            return Err(Error::Denied);
        }
        self.check_writable()?;
        if fh.fptr >= fh.size {
            return Ok(());
        }
        self.flush_file_cache(fh)?;

        if fh.fptr == 0 {
            if fh.chain.start != 0 {
                let start = fh.chain.start;
                let mut chain = fh.chain;
                fat::remove_chain(self, &mut chain, start, 0)?;
                fh.chain = chain;
            }
        } else {
            // Walk to the last kept cluster and drop everything after it.
            let cb = self.cluster_bytes() as u64;
            let keep = fh.fptr.div_ceil(cb) as u32;
            let mut clst = fh.chain.start;
            for _ in 1..keep {
                clst = match fat::next_cluster(self, &fh.chain, clst)? {
                    ClusterStatus::Next(n) => n,
                    _ => return Err(Error::Internal),
                };
            }
            if let ClusterStatus::Next(n) = fat::next_cluster(self, &fh.chain, clst)? {
                let mut chain = fh.chain;
                fat::remove_chain(self, &mut chain, n, clst)?;
                fh.chain = chain;
            }
        }
        fh.size = fh.fptr;
        fh.clst = 0;
        fh.clst_idx = 0;
        fh.buf_sector = NO_SECTOR;
        fh.buf_dirty = false;
        fh.modified = true;
        Ok(())
    }

    // ─── Flushing ──────────────────────────────────────────────────────────────

    /// Flush cached data and write the directory entry back.
    pub fn sync(&mut self, fh: &mut FileHandle) -> Result<()> {
        self.validate_id(fh.mount_id)?;
        self.flush_file_cache(fh)?;
        if fh.modified {
            let chain = fh.chain;
            let size = fh.size;
            self.store_file_entry(&fh.loc, &chain, size)?;
            fh.modified = false;
        }
        self.sync_fs()
    }

    /// Write an object's chain and size into its directory entry, stamping
    /// the modification time.
    fn store_file_entry(&mut self, loc: &EntryLoc, chain: &Chain, size: u64) -> Result<()> {
        if self.kind.is_exfat() {
            let mut xb: XDirBuf = [0; 19 * 32];
            self.load_xdir(loc, &mut xb)?;
            let attrs = ld16(&xb, 4) | ATTR_ARCHIVE as u16;
            st16(&mut xb, 4, attrs);
            st32(&mut xb, 12, self.now().to_exfat());
            xb[21] = 0;
            xb[33] = 0x01
                | if chain.stat == ChainStatus::Contiguous && chain.start != 0 {
                    0x02
                } else {
                    0
                };
            st64(&mut xb, 32 + 8, size);
            st32(&mut xb, 32 + 20, chain.start);
            st64(&mut xb, 32 + 24, size);
            self.store_xdir(loc, &mut xb)
        } else {
            let (date, time) = self.now().to_fat();
            let start = chain.start;
            self.update_fat_entry(loc, |e| {
                e[11] |= ATTR_ARCHIVE;
                st16(e, 26, (start & 0xFFFF) as u16);
                st16(e, 20, (start >> 16) as u16);
                st32(e, 28, size as u32);
                st16(e, 22, time);
                st16(e, 24, date);
            })
        }
    }

    fn flush_file_cache(&mut self, fh: &mut FileHandle) -> Result<()> {
        if fh.buf_dirty {
            self.dev.write_sectors(fh.buf_sector, &fh.buf)?;
            fh.buf_dirty = false;
        }
        Ok(())
    }

    /// Invalidate the private cache before a direct multi-sector transfer
    /// over `[sector, sector + n)`, flushing it first when dirty.
    fn drop_file_cache(&mut self, fh: &mut FileHandle, sector: u64, n: u64) -> Result<()> {
        if fh.buf_sector >= sector && fh.buf_sector < sector + n {
            self.flush_file_cache(fh)?;
            fh.buf_sector = NO_SECTOR;
        }
        Ok(())
    }

    /// Bring `sector` into the handle's cache. With `writing`, a sector that
    /// lies entirely past the current size is zeroed instead of read.
    fn load_file_sector(&mut self, fh: &mut FileHandle, sector: u64, writing: bool) -> Result<()> {
        if fh.buf_sector == sector {
            return Ok(());
        }
        self.flush_file_cache(fh)?;
        if writing && fh.fptr - fh.fptr % SECTOR_SIZE as u64 >= fh.size {
            fh.buf = [0; SECTOR_SIZE];
        } else {
            self.dev.read_sectors(sector, &mut fh.buf)?;
        }
        fh.buf_sector = sector;
        Ok(())
    }

    /// Resolve the absolute sector for the file position, extending the
    /// chain when `alloc` is set. `Ok(None)` means the volume is full.
    fn map_cluster(&mut self, fh: &mut FileHandle, alloc: bool) -> Result<Option<u64>> {
        let cb = self.cluster_bytes() as u64;
        let idx = (fh.fptr / cb) as u32;

        if fh.chain.start == 0 {
            if !alloc {
                return Err(Error::Internal);
            }
            let mut chain = fh.chain;
            let c = match fat::create_chain(self, &mut chain, 0)? {
                Some(c) => c,
                None => return Ok(None),
            };
            fh.chain = chain;
            fh.clst = c;
            fh.clst_idx = 0;
        }
        if fh.clst == 0 || fh.clst_idx > idx {
            fh.clst = fh.chain.start;
            fh.clst_idx = 0;
        }
        while fh.clst_idx < idx {
            match fat::next_cluster(self, &fh.chain, fh.clst)? {
                ClusterStatus::Next(n) => fh.clst = n,
                ClusterStatus::Eoc if alloc => {
                    let mut chain = fh.chain;
                    let c = match fat::create_chain(self, &mut chain, fh.clst)? {
                        Some(c) => c,
                        None => return Ok(None),
                    };
                    fh.chain = chain;
                    fh.clst = c;
                }
                _ => return Err(Error::Internal),
            }
            fh.clst_idx += 1;
        }
        Ok(Some(
            self.cluster_sector(fh.clst) + (fh.fptr % cb) / SECTOR_SIZE as u64,
        ))
    }
}
