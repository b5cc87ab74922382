//! Directory engine: 8.3 + long-name metadata for classic FAT, entry sets
//! for exFAT, and the path-based metadata operations built on both.

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::fat::{self, Chain, ChainStatus, ClusterStatus};
use crate::volume::{ld16, ld32, ld64, st16, st32, st64, FsKind, Volume};
use crate::Timestamp;

/// Longest object name, in UTF-16 units.
pub const MAX_NAME_CHARS: usize = 255;

const ENTRY_SIZE: u32 = 32;
const DELETED: u8 = 0xE5;

// Classic FAT short-entry field offsets.
const DIR_ATTR: usize = 11;
const DIR_NT: usize = 12;
const DIR_CRT_TIME: usize = 14;
const DIR_CRT_DATE: usize = 16;
const DIR_CLUST_HI: usize = 20;
const DIR_MOD_TIME: usize = 22;
const DIR_MOD_DATE: usize = 24;
const DIR_CLUST_LO: usize = 26;
const DIR_SIZE: usize = 28;

pub(crate) const ATTR_READ_ONLY: u8 = 0x01;
pub(crate) const ATTR_VOLUME: u8 = 0x08;
pub(crate) const ATTR_DIRECTORY: u8 = 0x10;
pub(crate) const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_LFN: u8 = 0x0F;

// Windows NT case hints in the short entry.
const NT_BODY_LOWER: u8 = 0x08;
const NT_EXT_LOWER: u8 = 0x10;

// Name-status flags produced by [`create_name`].
const NS_LOSS: u8 = 0x01;
const NS_LFN: u8 = 0x02;
const NS_DOT: u8 = 0x04;

// Long-name entries carry 13 UTF-16 units at fixed sub-offsets.
const LFN_CHARS: usize = 13;
const LFN_ORD_LAST: u8 = 0x40;
const LFN_OFS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
/// 20 long-name entries of 13 units; more than `MAX_NAME_CHARS` because the
/// last entry may run past the name limit.
const LFN_BUF: usize = 20 * LFN_CHARS;

// exFAT directory entry types.
const XT_LABEL: u8 = 0x83;
const XT_FILE: u8 = 0x85;
const XT_STREAM: u8 = 0xC0;
const XT_NAME: u8 = 0xC1;
const X_IN_USE: u8 = 0x80;
const X_NAME_CHARS: usize = 15;
/// Largest entry set: file + stream + 17 name entries.
const X_SET_MAX: usize = 19;
/// NoFatChain bit in the stream entry's general secondary flags.
const X_NO_FAT_CHAIN: u8 = 0x02;

/// Scratch for one complete exFAT entry set.
pub(crate) type XDirBuf = [u8; X_SET_MAX * 32];

bitflags::bitflags! {
    /// Object attribute bits, as stored on disk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

// ─── Name preparation ──────────────────────────────────────────────────────────

/// One path segment, prepared for directory lookup and registration.
#[derive(Clone)]
pub(crate) struct NameBuf {
    pub lfn: [u16; MAX_NAME_CHARS],
    pub lfn_len: usize,
    pub sfn: [u8; 11],
    /// NS_* flags.
    pub ns: u8,
    /// NT case hints for the short entry.
    nt: u8,
}

impl NameBuf {
    pub(crate) fn new() -> NameBuf {
        NameBuf { lfn: [0; MAX_NAME_CHARS], lfn_len: 0, sfn: [b' '; 11], ns: 0, nt: 0 }
    }
}

/// Short-name characters kept during 8.3 reduction, besides `[A-Z0-9]`.
/// Anything else is dropped, which marks the name lossy.
const SFN_KEEP: &[u8] = b"!#$&'()@^_`{}~";

/// Prepare one path segment: validate it, encode the long name, and derive
/// the 8.3 reduction with its loss/case flags.
pub(crate) fn create_name(seg: &str) -> Result<NameBuf> {
    let mut nb = NameBuf::new();

    if seg == "." || seg == ".." {
        nb.ns = NS_DOT;
        nb.sfn[0] = b'.';
        nb.lfn[0] = b'.' as u16;
        nb.lfn_len = 1;
        if seg == ".." {
            nb.sfn[1] = b'.';
            nb.lfn[1] = b'.' as u16;
            nb.lfn_len = 2;
        }
        return Ok(nb);
    }

    let mut len = 0usize;
    for u in seg.encode_utf16() {
        if len >= MAX_NAME_CHARS {
            return Err(Error::InvalidName);
        }
        if u < 0x20 || matches!(u, 0x22 | 0x2A | 0x3A | 0x3C | 0x3E | 0x3F | 0x5C | 0x7C) {
            return Err(Error::InvalidName);
        }
        nb.lfn[len] = u;
        len += 1;
    }
    // Trailing dots and spaces are not part of the name.
    while len > 0 && matches!(nb.lfn[len - 1], 0x20 | 0x2E) {
        len -= 1;
    }
    if len == 0 {
        return Err(Error::InvalidName);
    }
    nb.lfn_len = len;

    let dot = nb.lfn[..len].iter().rposition(|&u| u == 0x2E);
    let (body_end, ext_start) = match dot {
        Some(i) => (i, i + 1),
        None => (len, len),
    };

    fn pack(part: &[u16], out: &mut [u8], lossy: &mut bool, lower: &mut bool, upper: &mut bool) {
        let mut n = 0;
        for &u in part {
            let b = match u {
                0x30..=0x39 => u as u8,
                0x41..=0x5A => {
                    *upper = true;
                    u as u8
                }
                0x61..=0x7A => {
                    *lower = true;
                    u as u8 - 0x20
                }
                _ if u < 0x80 && SFN_KEEP.contains(&(u as u8)) => u as u8,
                _ => {
                    *lossy = true;
                    continue;
                }
            };
            if n == out.len() {
                *lossy = true;
                break;
            }
            out[n] = b;
            n += 1;
        }
    }

    let mut sfn = [b' '; 11];
    let mut lossy = false;
    let (mut b_lo, mut b_up, mut e_lo, mut e_up) = (false, false, false, false);
    pack(&nb.lfn[..body_end], &mut sfn[..8], &mut lossy, &mut b_lo, &mut b_up);
    pack(&nb.lfn[ext_start..len], &mut sfn[8..11], &mut lossy, &mut e_lo, &mut e_up);
    if sfn[0] == b' ' {
        // Body reduced to nothing (e.g. a leading-dot name).
        lossy = true;
    }

    if lossy {
        nb.ns = NS_LOSS | NS_LFN;
    } else if (b_lo && b_up) || (e_lo && e_up) {
        // Mixed case fits the 8.3 slot only after folding; keep the long name.
        nb.ns = NS_LFN;
    } else {
        if b_lo {
            nb.nt |= NT_BODY_LOWER;
        }
        if e_lo {
            nb.nt |= NT_EXT_LOWER;
        }
    }
    nb.sfn = sfn;
    Ok(nb)
}

/// Derive the `~n` numbered variant of a lossy short name. After a few
/// sequential collisions the number switches to a hash of the long name so
/// crowded directories do not degenerate into a linear probe.
fn gen_num_name(dst: &mut [u8; 11], src: &[u8; 11], lfn: &[u16], seq: u32) {
    *dst = *src;
    let mut seq = seq;
    if seq > 5 {
        let mut sreg = seq;
        for &u in lfn {
            let mut wc = u as u32;
            for _ in 0..16 {
                sreg = (sreg << 1) + (wc & 1);
                wc >>= 1;
                if sreg & 0x1_0000 != 0 {
                    sreg ^= 0x11021;
                }
            }
        }
        seq = sreg & 0xFFFF;
    }

    // "~" plus hexadecimal digits, packed at the tail of the body.
    let mut ns = [0u8; 8];
    let mut i = 7usize;
    loop {
        let d = (seq % 16) as u8;
        ns[i] = if d > 9 { d - 10 + b'A' } else { d + b'0' };
        seq /= 16;
        if seq == 0 {
            break;
        }
        i -= 1;
    }
    i -= 1;
    ns[i] = b'~';

    let mut j = 0;
    while j < i && src[j] != b' ' {
        dst[j] = src[j];
        j += 1;
    }
    let mut k = i;
    while j < 8 {
        dst[j] = if k < 8 {
            let c = ns[k];
            k += 1;
            c
        } else {
            b' '
        };
        j += 1;
    }
}

/// Short-entry checksum stored in every long-name entry of a set.
pub(crate) fn sfn_sum(name: &[u8]) -> u8 {
    name.iter().fold(0u8, |s, &b| s.rotate_right(1).wrapping_add(b))
}

/// Case fold one UTF-16 unit (ASCII plus Latin-1).
pub(crate) fn upcase(u: u16) -> u16 {
    match u {
        0x61..=0x7A => u - 0x20,
        0xE0..=0xFE if u != 0xF7 => u - 0x20,
        _ => u,
    }
}

fn name_eq_ci(a: &[u16], b: &[u16]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| upcase(x) == upcase(y))
}

/// exFAT name hash over the upcased name.
pub(crate) fn xname_hash(name: &[u16]) -> u16 {
    let mut sum: u16 = 0;
    for &u in name {
        for b in upcase(u).to_le_bytes() {
            sum = sum.rotate_right(1).wrapping_add(b as u16);
        }
    }
    sum
}

/// exFAT entry-set checksum; bytes 2..4 of the first entry hold the
/// checksum itself and are skipped.
pub(crate) fn xdir_sum(set: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for (i, &b) in set.iter().enumerate() {
        if i == 2 || i == 3 {
            continue;
        }
        sum = sum.rotate_right(1).wrapping_add(b as u16);
    }
    sum
}

/// Copy one long-name entry's 13 units into the assembly buffer at the slot
/// for sequence number `seq`. Returns the units before the terminator.
fn lfn_part(e: &[u8; 32], buf: &mut [u16; LFN_BUF], seq: u8) -> usize {
    let base = (seq as usize - 1) * LFN_CHARS;
    for (i, &o) in LFN_OFS.iter().enumerate() {
        buf[base + i] = ld16(e, o);
    }
    for i in 0..LFN_CHARS {
        if buf[base + i] == 0 {
            return i;
        }
    }
    LFN_CHARS
}

/// Fill one long-name entry's unit slots for sequence number `seq`: name
/// units, one terminator, then 0xFFFF padding.
fn put_lfn_part(e: &mut [u8; 32], lfn: &[u16], seq: usize) {
    let base = (seq - 1) * LFN_CHARS;
    for (i, &o) in LFN_OFS.iter().enumerate() {
        let v = match (base + i).cmp(&lfn.len()) {
            core::cmp::Ordering::Less => lfn[base + i],
            core::cmp::Ordering::Equal => 0x0000,
            core::cmp::Ordering::Greater => 0xFFFF,
        };
        st16(e, o, v);
    }
}

// ─── Object records ────────────────────────────────────────────────────────────

/// Where an object's directory entries live, for later update or removal.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryLoc {
    /// Chain of the containing directory.
    pub dir_chain: Chain,
    /// Byte offset of the set's first entry within that directory.
    pub entry_ofs: u32,
    /// Entries in the set: long-name run plus short entry, or the exFAT
    /// entry-set length.
    pub n_ent: u8,
    /// Absolute sector of the anchor entry (the short entry on classic FAT,
    /// the file entry on exFAT).
    pub short_sector: u64,
}

/// On-disk facts about one located object.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObjInfo {
    pub attr: u8,
    pub sclust: u32,
    pub size: u64,
    /// exFAT NoFatChain: the data is a literal +1 cluster run.
    pub contiguous: bool,
    pub modified: Timestamp,
    pub loc: EntryLoc,
}

/// Read cursor over one directory.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DirCursor {
    pub chain: Chain,
    /// Byte offset of the current entry.
    pub offset: u32,
    /// Cluster holding `offset`; 0 in the fixed FAT12/16 root.
    pub clst: u32,
    /// Absolute sector holding `offset`.
    pub sector: u64,
    /// exFAT: the directory's byte size, from its stream entry.
    pub size: u64,
    /// exFAT: this directory's own entry set (None for the root).
    pub self_loc: Option<EntryLoc>,
}

/// Outcome of resolving a path.
pub(crate) enum PathTarget {
    Root,
    Found(ObjInfo),
    /// Only the final segment is missing; the cursor is its parent.
    Missing,
}

/// Snapshot of one directory entry, as returned by [`Volume::read_dir`].
#[derive(Debug, Clone)]
pub struct FileInfo {
    name: [u8; MAX_NAME_CHARS * 3],
    name_len: u16,
    alt: [u8; 12],
    alt_len: u8,
    pub size: u64,
    pub attr: Attributes,
    pub modified: Timestamp,
}

impl FileInfo {
    pub(crate) fn new() -> FileInfo {
        FileInfo {
            name: [0; MAX_NAME_CHARS * 3],
            name_len: 0,
            alt: [0; 12],
            alt_len: 0,
            size: 0,
            attr: Attributes::empty(),
            modified: Timestamp::DEFAULT,
        }
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }

    /// 8.3 short name; empty on exFAT, which has no short names.
    pub fn short_name(&self) -> &str {
        core::str::from_utf8(&self.alt[..self.alt_len as usize]).unwrap_or("")
    }

    pub fn is_dir(&self) -> bool {
        self.attr.contains(Attributes::DIRECTORY)
    }

    fn clear(&mut self) {
        self.name_len = 0;
        self.alt_len = 0;
        self.size = 0;
        self.attr = Attributes::empty();
        self.modified = Timestamp::DEFAULT;
    }

    fn push_char(&mut self, c: char) {
        let mut b = [0u8; 4];
        let s = c.encode_utf8(&mut b);
        let n = self.name_len as usize;
        if n + s.len() <= self.name.len() {
            self.name[n..n + s.len()].copy_from_slice(s.as_bytes());
            self.name_len += s.len() as u16;
        }
    }

    fn set_name_utf16(&mut self, units: &[u16]) {
        for r in core::char::decode_utf16(units.iter().copied()) {
            self.push_char(r.unwrap_or(char::REPLACEMENT_CHARACTER));
        }
    }

    fn set_name_sfn(&mut self, e: &[u8; 32]) {
        let nt = e[DIR_NT];
        for i in 0..8 {
            let mut b = if i == 0 && e[0] == 0x05 { DELETED } else { e[i] };
            if b == b' ' {
                break;
            }
            if nt & NT_BODY_LOWER != 0 && b.is_ascii_uppercase() {
                b += 0x20;
            }
            self.push_char(b as char);
        }
        if e[8] != b' ' {
            self.push_char('.');
            for i in 8..11 {
                let mut b = e[i];
                if b == b' ' {
                    break;
                }
                if nt & NT_EXT_LOWER != 0 && b.is_ascii_uppercase() {
                    b += 0x20;
                }
                self.push_char(b as char);
            }
        }
    }

    fn set_alt_sfn(&mut self, e: &[u8; 32]) {
        let mut n = 0;
        for i in 0..8 {
            let b = if i == 0 && e[0] == 0x05 { DELETED } else { e[i] };
            if b == b' ' {
                break;
            }
            self.alt[n] = b;
            n += 1;
        }
        if e[8] != b' ' {
            self.alt[n] = b'.';
            n += 1;
            for i in 8..11 {
                if e[i] == b' ' {
                    break;
                }
                self.alt[n] = e[i];
                n += 1;
            }
        }
        self.alt_len = n as u8;
    }
}

/// Read position in an open directory.
pub struct DirHandle {
    pub(crate) mount_id: u16,
    pub(crate) cursor: DirCursor,
    finished: bool,
}

/// Volume label, up to 11 characters.
#[derive(Debug, Clone, Copy)]
pub struct VolumeLabel {
    buf: [u8; 33],
    len: u8,
}

impl VolumeLabel {
    fn empty() -> VolumeLabel {
        VolumeLabel { buf: [0; 33], len: 0 }
    }

    fn push_char(&mut self, c: char) {
        let mut b = [0u8; 4];
        let s = c.encode_utf8(&mut b);
        let n = self.len as usize;
        if n + s.len() <= self.buf.len() {
            self.buf[n..n + s.len()].copy_from_slice(s.as_bytes());
            self.len += s.len() as u8;
        }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("")
    }
}

// ─── Cursor movement ───────────────────────────────────────────────────────────

impl<D: BlockDevice> Volume<D> {
    /// Cursor over the root directory.
    pub(crate) fn root_dir(&self) -> DirCursor {
        let chain = Chain::fragmented(self.root_cluster);
        DirCursor { chain, offset: 0, clst: chain.start, sector: 0, size: 0, self_loc: None }
    }

    pub(crate) fn dir_rewind(&mut self, dp: &mut DirCursor) -> Result<()> {
        dp.offset = 0;
        dp.clst = dp.chain.start;
        dp.sector = if dp.clst == 0 {
            if self.n_root_entries == 0 {
                return Err(Error::Internal);
            }
            self.root_base
        } else {
            if !self.valid_cluster(dp.clst) {
                return Err(Error::Internal);
            }
            self.cluster_sector(dp.clst)
        };
        Ok(())
    }

    /// Advance the cursor one entry. `Ok(false)` at end of table; with
    /// `stretch`, a cluster is appended and zeroed instead.
    pub(crate) fn dir_next(&mut self, dp: &mut DirCursor, stretch: bool) -> Result<bool> {
        let ofs = dp.offset + ENTRY_SIZE;

        // Fixed FAT12/16 root: a flat table that cannot grow.
        if dp.clst == 0 {
            if ofs >= self.n_root_entries as u32 * ENTRY_SIZE {
                return Ok(false);
            }
            dp.offset = ofs;
            if ofs % SECTOR_SIZE as u32 == 0 {
                dp.sector += 1;
            }
            return Ok(true);
        }

        if ofs % SECTOR_SIZE as u32 == 0 {
            if ofs % self.cluster_bytes() == 0 {
                match fat::next_cluster(self, &dp.chain, dp.clst)? {
                    ClusterStatus::Next(n) => {
                        dp.clst = n;
                        dp.sector = self.cluster_sector(n);
                    }
                    ClusterStatus::Eoc => {
                        if !stretch {
                            return Ok(false);
                        }
                        self.check_writable()?;
                        let mut chain = dp.chain;
                        let new = match fat::create_chain(self, &mut chain, dp.clst)? {
                            Some(c) => c,
                            // No room left for the table to grow.
                            None => return Err(Error::Denied),
                        };
                        dp.chain = chain;
                        self.clear_sectors(self.cluster_sector(new), self.csize as u64)?;
                        if self.kind.is_exfat() {
                            dp.size += self.cluster_bytes() as u64;
                            self.sync_dir_stream(dp)?;
                        }
                        dp.clst = new;
                        dp.sector = self.cluster_sector(new);
                    }
                    _ => return Err(Error::Internal),
                }
            } else {
                dp.sector += 1;
            }
        }
        dp.offset = ofs;
        Ok(true)
    }

    /// Position the cursor on the entry at byte offset `ofs`.
    fn dir_seek(&mut self, dp: &mut DirCursor, ofs: u32) -> Result<()> {
        self.dir_rewind(dp)?;
        if dp.clst == 0 {
            if ofs >= self.n_root_entries as u32 * ENTRY_SIZE {
                return Err(Error::Internal);
            }
            dp.offset = ofs;
            dp.sector = self.root_base + (ofs / SECTOR_SIZE as u32) as u64;
            return Ok(());
        }
        let cb = self.cluster_bytes();
        let mut clst = dp.clst;
        for _ in 0..ofs / cb {
            clst = match fat::next_cluster(self, &dp.chain, clst)? {
                ClusterStatus::Next(n) => n,
                _ => return Err(Error::Internal),
            };
        }
        dp.clst = clst;
        dp.offset = ofs;
        dp.sector = self.cluster_sector(clst) + ((ofs % cb) / SECTOR_SIZE as u32) as u64;
        Ok(())
    }

    fn cursor_at(&mut self, loc: &EntryLoc) -> Result<DirCursor> {
        let mut dp = DirCursor {
            chain: loc.dir_chain,
            offset: 0,
            clst: 0,
            sector: 0,
            size: 0,
            self_loc: None,
        };
        self.dir_seek(&mut dp, loc.entry_ofs)?;
        Ok(dp)
    }

    fn read_entry(&mut self, sector: u64, offset: u32) -> Result<[u8; 32]> {
        self.move_window(sector)?;
        let o = offset as usize % SECTOR_SIZE;
        let mut e = [0u8; 32];
        e.copy_from_slice(&self.win()[o..o + 32]);
        Ok(e)
    }

    fn write_entry(&mut self, sector: u64, offset: u32, e: &[u8; 32]) -> Result<()> {
        self.move_window(sector)?;
        let o = offset as usize % SECTOR_SIZE;
        self.win_mut()[o..o + 32].copy_from_slice(e);
        Ok(())
    }

    /// Cursor into a subdirectory described by `obj`. A start cluster of 0
    /// (a `..` entry pointing at the root) maps back to the root cursor.
    pub(crate) fn sub_dir(&self, obj: &ObjInfo) -> DirCursor {
        if obj.sclust == 0 {
            return self.root_dir();
        }
        let chain = self.obj_chain(obj);
        DirCursor {
            chain,
            offset: 0,
            clst: chain.start,
            sector: 0,
            size: obj.size,
            self_loc: Some(obj.loc),
        }
    }

    /// Chain view of an object's data.
    pub(crate) fn obj_chain(&self, obj: &ObjInfo) -> Chain {
        if obj.sclust == 0 {
            Chain::empty()
        } else if self.kind.is_exfat() && obj.contiguous {
            let cb = self.cluster_bytes() as u64;
            let n = obj.size.div_ceil(cb).max(1) as u32;
            Chain::contiguous(obj.sclust, n)
        } else {
            Chain::fragmented(obj.sclust)
        }
    }

    // ─── Classic FAT read and find ─────────────────────────────────────────────

    /// Read the next real entry (no labels, no dot entries) at or after the
    /// cursor, leaving the cursor on the short entry. `Ok(None)` at the end.
    fn dir_read_fat(&mut self, dp: &mut DirCursor, fi: &mut FileInfo) -> Result<Option<ObjInfo>> {
        let mut lbuf = [0u16; LFN_BUF];
        let mut llen = 0usize;
        let mut ord: u8 = 0xFF;
        let mut sum: u8 = 0;
        let mut set_start = dp.offset;
        loop {
            let e = self.read_entry(dp.sector, dp.offset)?;
            let c = e[0];
            if c == 0 {
                return Ok(None);
            }
            let attr = e[DIR_ATTR] & 0x3F;
            if c == DELETED {
                ord = 0xFF;
            } else if attr == ATTR_LFN {
                if c & LFN_ORD_LAST != 0 {
                    let seq = c & 0x3F;
                    if seq == 0 || seq as usize > LFN_BUF / LFN_CHARS {
                        ord = 0xFF;
                    } else {
                        set_start = dp.offset;
                        sum = e[13];
                        let part = lfn_part(&e, &mut lbuf, seq);
                        llen = (seq as usize - 1) * LFN_CHARS + part;
                        ord = seq - 1;
                    }
                } else if ord != 0xFF && ord != 0 && c == ord && e[13] == sum {
                    lfn_part(&e, &mut lbuf, ord);
                    ord -= 1;
                } else {
                    ord = 0xFF;
                }
            } else if attr & ATTR_VOLUME != 0 || c == b'.' {
                ord = 0xFF;
            } else {
                let have_lfn = ord == 0 && llen > 0 && sum == sfn_sum(&e[..11]);
                if !have_lfn {
                    set_start = dp.offset;
                }
                let n_ent = ((dp.offset - set_start) / ENTRY_SIZE + 1) as u8;
                let loc = EntryLoc {
                    dir_chain: dp.chain,
                    entry_ofs: set_start,
                    n_ent,
                    short_sector: dp.sector,
                };
                fi.clear();
                if have_lfn {
                    fi.set_name_utf16(&lbuf[..llen.min(MAX_NAME_CHARS)]);
                } else {
                    fi.set_name_sfn(&e);
                }
                fi.set_alt_sfn(&e);
                let obj = self.fat_obj(&e, loc);
                fi.size = obj.size;
                fi.attr = Attributes::from_bits_truncate(obj.attr);
                fi.modified = obj.modified;
                return Ok(Some(obj));
            }
            if !self.dir_next(dp, false)? {
                return Ok(None);
            }
        }
    }

    /// Find `nb` in the directory, matching the long name case-insensitively
    /// or the 8.3 name exactly.
    fn dir_find_fat(
        &mut self,
        dp: &mut DirCursor,
        nb: &NameBuf,
        fi: &mut FileInfo,
    ) -> Result<Option<ObjInfo>> {
        self.dir_rewind(dp)?;
        let mut lbuf = [0u16; LFN_BUF];
        let mut llen = 0usize;
        let mut ord: u8 = 0xFF;
        let mut sum: u8 = 0;
        let mut set_start = dp.offset;
        loop {
            let e = self.read_entry(dp.sector, dp.offset)?;
            let c = e[0];
            if c == 0 {
                return Ok(None);
            }
            let attr = e[DIR_ATTR] & 0x3F;
            if c == DELETED {
                ord = 0xFF;
            } else if attr == ATTR_LFN {
                if c & LFN_ORD_LAST != 0 {
                    let seq = c & 0x3F;
                    if seq == 0 || seq as usize > LFN_BUF / LFN_CHARS {
                        ord = 0xFF;
                    } else {
                        set_start = dp.offset;
                        sum = e[13];
                        let part = lfn_part(&e, &mut lbuf, seq);
                        llen = (seq as usize - 1) * LFN_CHARS + part;
                        ord = seq - 1;
                    }
                } else if ord != 0xFF && ord != 0 && c == ord && e[13] == sum {
                    lfn_part(&e, &mut lbuf, ord);
                    ord -= 1;
                } else {
                    ord = 0xFF;
                }
            } else if attr & ATTR_VOLUME != 0 {
                ord = 0xFF;
            } else {
                let have_lfn = ord == 0 && llen > 0 && sum == sfn_sum(&e[..11]);
                let m_lfn = have_lfn && name_eq_ci(&lbuf[..llen], &nb.lfn[..nb.lfn_len]);
                let m_sfn = nb.ns & NS_LOSS == 0 && e[..11] == nb.sfn;
                if m_lfn || m_sfn {
                    if !have_lfn {
                        set_start = dp.offset;
                    }
                    let n_ent = ((dp.offset - set_start) / ENTRY_SIZE + 1) as u8;
                    let loc = EntryLoc {
                        dir_chain: dp.chain,
                        entry_ofs: set_start,
                        n_ent,
                        short_sector: dp.sector,
                    };
                    fi.clear();
                    if have_lfn {
                        fi.set_name_utf16(&lbuf[..llen.min(MAX_NAME_CHARS)]);
                    } else {
                        fi.set_name_sfn(&e);
                    }
                    fi.set_alt_sfn(&e);
                    let obj = self.fat_obj(&e, loc);
                    fi.size = obj.size;
                    fi.attr = Attributes::from_bits_truncate(obj.attr);
                    fi.modified = obj.modified;
                    return Ok(Some(obj));
                }
                ord = 0xFF;
            }
            if !self.dir_next(dp, false)? {
                return Ok(None);
            }
        }
    }

    /// Find an exact 8.3 name, ignoring long-name metadata.
    fn dir_find_sfn(&mut self, dp: &mut DirCursor, sfn: &[u8; 11]) -> Result<bool> {
        self.dir_rewind(dp)?;
        loop {
            let e = self.read_entry(dp.sector, dp.offset)?;
            if e[0] == 0 {
                return Ok(false);
            }
            let attr = e[DIR_ATTR] & 0x3F;
            if e[0] != DELETED && attr != ATTR_LFN && attr & ATTR_VOLUME == 0 && e[..11] == *sfn {
                return Ok(true);
            }
            if !self.dir_next(dp, false)? {
                return Ok(false);
            }
        }
    }

    fn fat_obj(&self, e: &[u8; 32], loc: EntryLoc) -> ObjInfo {
        let hi = if self.kind == FsKind::Fat32 {
            (ld16(e, DIR_CLUST_HI) as u32) << 16
        } else {
            0
        };
        ObjInfo {
            attr: e[DIR_ATTR] & 0x3F,
            sclust: hi | ld16(e, DIR_CLUST_LO) as u32,
            size: ld32(e, DIR_SIZE) as u64,
            contiguous: false,
            modified: Timestamp::from_fat(ld16(e, DIR_MOD_DATE), ld16(e, DIR_MOD_TIME)),
            loc,
        }
    }

    // ─── exFAT read and find ───────────────────────────────────────────────────

    /// Load the entry set starting at the cursor's 0x85 entry, leaving the
    /// cursor on the set's last entry. Validates shape and checksum.
    fn load_xset_here(&mut self, dp: &mut DirCursor, xb: &mut XDirBuf) -> Result<usize> {
        let e = self.read_entry(dp.sector, dp.offset)?;
        let n_sec = e[1] as usize;
        if n_sec < 2 || n_sec + 1 > X_SET_MAX {
            log::warn!("entry set with {n_sec} secondaries at offset {}", dp.offset);
            return Err(Error::Internal);
        }
        xb[..32].copy_from_slice(&e);
        for i in 1..=n_sec {
            if !self.dir_next(dp, false)? {
                return Err(Error::Internal);
            }
            let e = self.read_entry(dp.sector, dp.offset)?;
            xb[i * 32..(i + 1) * 32].copy_from_slice(&e);
        }
        let n_ent = n_sec + 1;
        if xb[32] != XT_STREAM || ld16(xb, 2) != xdir_sum(&xb[..n_ent * 32]) {
            log::warn!("corrupt entry set at offset {}", dp.offset);
            return Err(Error::Internal);
        }
        Ok(n_ent)
    }

    fn dir_read_ex(&mut self, dp: &mut DirCursor, fi: &mut FileInfo) -> Result<Option<ObjInfo>> {
        loop {
            let t = self.read_entry(dp.sector, dp.offset)?[0];
            if t == 0 {
                return Ok(None);
            }
            if t == XT_FILE {
                let set_ofs = dp.offset;
                let set_sec = dp.sector;
                let mut xb: XDirBuf = [0; X_SET_MAX * 32];
                let n_ent = self.load_xset_here(dp, &mut xb)?;
                let loc = EntryLoc {
                    dir_chain: dp.chain,
                    entry_ofs: set_ofs,
                    n_ent: n_ent as u8,
                    short_sector: set_sec,
                };
                let obj = xset_obj(&xb, loc);
                let mut units = [0u16; MAX_NAME_CHARS];
                let n = xset_name(&xb, n_ent, &mut units);
                fi.clear();
                fi.set_name_utf16(&units[..n]);
                fi.size = obj.size;
                fi.attr = Attributes::from_bits_truncate(obj.attr);
                fi.modified = obj.modified;
                return Ok(Some(obj));
            }
            if !self.dir_next(dp, false)? {
                return Ok(None);
            }
        }
    }

    fn dir_find_ex(
        &mut self,
        dp: &mut DirCursor,
        nb: &NameBuf,
        fi: &mut FileInfo,
    ) -> Result<Option<ObjInfo>> {
        self.dir_rewind(dp)?;
        let hash = xname_hash(&nb.lfn[..nb.lfn_len]);
        loop {
            let t = self.read_entry(dp.sector, dp.offset)?[0];
            if t == 0 {
                return Ok(None);
            }
            if t == XT_FILE {
                let set_ofs = dp.offset;
                let set_sec = dp.sector;
                let mut xb: XDirBuf = [0; X_SET_MAX * 32];
                let n_ent = self.load_xset_here(dp, &mut xb)?;
                if ld16(&xb, 32 + 4) == hash {
                    let mut units = [0u16; MAX_NAME_CHARS];
                    let n = xset_name(&xb, n_ent, &mut units);
                    if name_eq_ci(&units[..n], &nb.lfn[..nb.lfn_len]) {
                        let loc = EntryLoc {
                            dir_chain: dp.chain,
                            entry_ofs: set_ofs,
                            n_ent: n_ent as u8,
                            short_sector: set_sec,
                        };
                        let obj = xset_obj(&xb, loc);
                        fi.clear();
                        fi.set_name_utf16(&units[..n]);
                        fi.size = obj.size;
                        fi.attr = Attributes::from_bits_truncate(obj.attr);
                        fi.modified = obj.modified;
                        return Ok(Some(obj));
                    }
                }
            }
            if !self.dir_next(dp, false)? {
                return Ok(None);
            }
        }
    }

    /// Re-read an object's entry set.
    pub(crate) fn load_xdir(&mut self, loc: &EntryLoc, xb: &mut XDirBuf) -> Result<usize> {
        let mut dp = self.cursor_at(loc)?;
        for i in 0..loc.n_ent as usize {
            let e = self.read_entry(dp.sector, dp.offset)?;
            xb[i * 32..(i + 1) * 32].copy_from_slice(&e);
            if i + 1 < loc.n_ent as usize && !self.dir_next(&mut dp, false)? {
                return Err(Error::Internal);
            }
        }
        Ok(loc.n_ent as usize)
    }

    /// Write an entry set back, recomputing its checksum.
    pub(crate) fn store_xdir(&mut self, loc: &EntryLoc, xb: &mut XDirBuf) -> Result<()> {
        let n = loc.n_ent as usize;
        let sum = xdir_sum(&xb[..n * 32]);
        st16(xb, 2, sum);
        let mut dp = self.cursor_at(loc)?;
        for i in 0..n {
            let mut e = [0u8; 32];
            e.copy_from_slice(&xb[i * 32..(i + 1) * 32]);
            self.write_entry(dp.sector, dp.offset, &e)?;
            if i + 1 < n && !self.dir_next(&mut dp, false)? {
                return Err(Error::Internal);
            }
        }
        Ok(())
    }

    /// Push a stretched directory's new size and chain shape into its own
    /// stream entry. The root has no entry set and needs nothing.
    fn sync_dir_stream(&mut self, dp: &DirCursor) -> Result<()> {
        let loc = match dp.self_loc {
            Some(l) => l,
            None => return Ok(()),
        };
        let mut xb: XDirBuf = [0; X_SET_MAX * 32];
        self.load_xdir(&loc, &mut xb)?;
        xb[33] = 0x01
            | if dp.chain.stat == ChainStatus::Contiguous {
                X_NO_FAT_CHAIN
            } else {
                0
            };
        st32(&mut xb, 32 + 20, dp.chain.start);
        st64(&mut xb, 32 + 8, dp.size);
        st64(&mut xb, 32 + 24, dp.size);
        self.store_xdir(&loc, &mut xb)
    }

    // ─── Registration and removal ──────────────────────────────────────────────

    /// Reserve a run of `n_ent` free entries, stretching the directory when
    /// the table ends. The cursor is left on the run's first entry.
    fn dir_alloc(&mut self, dp: &mut DirCursor, n_ent: u32) -> Result<u32> {
        self.dir_rewind(dp)?;
        let mut run = 0u32;
        let mut start = 0u32;
        loop {
            let c = self.read_entry(dp.sector, dp.offset)?[0];
            let free = if self.kind.is_exfat() {
                c & X_IN_USE == 0
            } else {
                c == DELETED || c == 0
            };
            if free {
                if run == 0 {
                    start = dp.offset;
                }
                run += 1;
                if run == n_ent {
                    break;
                }
            } else {
                run = 0;
            }
            if !self.dir_next(dp, true)? {
                return Err(Error::Denied);
            }
        }
        self.dir_seek(dp, start)?;
        Ok(start)
    }

    /// Write the entries for a new object: long-name run plus short entry.
    /// Resolves short-name collisions with `~n` numbering.
    fn dir_register_fat(&mut self, dp: &mut DirCursor, nb: &NameBuf, attr: u8) -> Result<EntryLoc> {
        if nb.ns & NS_DOT != 0 {
            return Err(Error::InvalidName);
        }
        self.check_writable()?;

        let mut sfn = nb.sfn;
        if nb.ns & NS_LOSS != 0 {
            let mut n = 1u32;
            loop {
                gen_num_name(&mut sfn, &nb.sfn, &nb.lfn[..nb.lfn_len], n);
                let mut probe = *dp;
                if !self.dir_find_sfn(&mut probe, &sfn)? {
                    break;
                }
                n += 1;
                if n == 100 {
                    return Err(Error::Denied);
                }
            }
        }

        let n_lfn = if nb.ns & (NS_LFN | NS_LOSS) != 0 {
            nb.lfn_len.div_ceil(LFN_CHARS)
        } else {
            0
        };
        let start = self.dir_alloc(dp, (n_lfn + 1) as u32)?;

        let sum = sfn_sum(&sfn);
        for i in (1..=n_lfn).rev() {
            let mut e = [0u8; 32];
            e[0] = i as u8 | if i == n_lfn { LFN_ORD_LAST } else { 0 };
            put_lfn_part(&mut e, &nb.lfn[..nb.lfn_len], i);
            e[DIR_ATTR] = ATTR_LFN;
            e[13] = sum;
            self.write_entry(dp.sector, dp.offset, &e)?;
            if !self.dir_next(dp, false)? {
                return Err(Error::Internal);
            }
        }

        let (date, time) = self.now().to_fat();
        let mut e = [0u8; 32];
        e[..11].copy_from_slice(&sfn);
        e[DIR_ATTR] = attr;
        e[DIR_NT] = if nb.ns & NS_LOSS != 0 { 0 } else { nb.nt };
        st16(&mut e, DIR_CRT_TIME, time);
        st16(&mut e, DIR_CRT_DATE, date);
        st16(&mut e, DIR_MOD_TIME, time);
        st16(&mut e, DIR_MOD_DATE, date);
        self.write_entry(dp.sector, dp.offset, &e)?;

        Ok(EntryLoc {
            dir_chain: dp.chain,
            entry_ofs: start,
            n_ent: (n_lfn + 1) as u8,
            short_sector: dp.sector,
        })
    }

    /// Write a complete exFAT entry set for a new object.
    fn dir_register_ex(
        &mut self,
        dp: &mut DirCursor,
        nb: &NameBuf,
        attr: u8,
        sclust: u32,
        size: u64,
        contiguous: bool,
    ) -> Result<EntryLoc> {
        if nb.ns & NS_DOT != 0 {
            return Err(Error::InvalidName);
        }
        self.check_writable()?;

        let n_names = nb.lfn_len.div_ceil(X_NAME_CHARS);
        let n_ent = 2 + n_names;
        let mut xb: XDirBuf = [0; X_SET_MAX * 32];
        xb[0] = XT_FILE;
        xb[1] = (n_ent - 1) as u8;
        st16(&mut xb, 4, attr as u16);
        let ts = self.now().to_exfat();
        st32(&mut xb, 8, ts);
        st32(&mut xb, 12, ts);
        st32(&mut xb, 16, ts);
        xb[32] = XT_STREAM;
        xb[33] = 0x01 | if contiguous && sclust != 0 { X_NO_FAT_CHAIN } else { 0 };
        xb[32 + 3] = nb.lfn_len as u8;
        st16(&mut xb, 32 + 4, xname_hash(&nb.lfn[..nb.lfn_len]));
        st64(&mut xb, 32 + 8, size);
        st32(&mut xb, 32 + 20, sclust);
        st64(&mut xb, 32 + 24, size);
        for i in 0..n_names {
            let base = (2 + i) * 32;
            xb[base] = XT_NAME;
            for j in 0..X_NAME_CHARS {
                let k = i * X_NAME_CHARS + j;
                if k < nb.lfn_len {
                    st16(&mut xb, base + 2 + j * 2, nb.lfn[k]);
                }
            }
        }
        let sum = xdir_sum(&xb[..n_ent * 32]);
        st16(&mut xb, 2, sum);

        let start = self.dir_alloc(dp, n_ent as u32)?;
        let anchor = dp.sector;
        for i in 0..n_ent {
            let mut e = [0u8; 32];
            e.copy_from_slice(&xb[i * 32..(i + 1) * 32]);
            self.write_entry(dp.sector, dp.offset, &e)?;
            if i + 1 < n_ent && !self.dir_next(dp, false)? {
                return Err(Error::Internal);
            }
        }

        Ok(EntryLoc {
            dir_chain: dp.chain,
            entry_ofs: start,
            n_ent: n_ent as u8,
            short_sector: anchor,
        })
    }

    /// Mark every entry of a set unused.
    pub(crate) fn dir_remove(&mut self, loc: &EntryLoc) -> Result<()> {
        self.check_writable()?;
        let mut dp = self.cursor_at(loc)?;
        for i in 0..loc.n_ent {
            let mut e = self.read_entry(dp.sector, dp.offset)?;
            if self.kind.is_exfat() {
                e[0] &= !X_IN_USE;
            } else {
                e[0] = DELETED;
            }
            self.write_entry(dp.sector, dp.offset, &e)?;
            if i + 1 < loc.n_ent && !self.dir_next(&mut dp, false)? {
                return Err(Error::Internal);
            }
        }
        Ok(())
    }

    /// Patch an object's short entry in place.
    pub(crate) fn update_fat_entry(
        &mut self,
        loc: &EntryLoc,
        f: impl FnOnce(&mut [u8; 32]),
    ) -> Result<()> {
        let sofs = loc.entry_ofs + (loc.n_ent as u32 - 1) * ENTRY_SIZE;
        self.move_window(loc.short_sector)?;
        let o = sofs as usize % SECTOR_SIZE;
        let mut e = [0u8; 32];
        e.copy_from_slice(&self.win()[o..o + 32]);
        f(&mut e);
        self.win_mut()[o..o + 32].copy_from_slice(&e);
        Ok(())
    }

    // ─── Path resolution ───────────────────────────────────────────────────────

    /// Walk `path` from the root. On `Found`, `fi` describes the object.
    /// On `Missing` the final segment does not exist and the returned cursor
    /// is its parent, ready for registration.
    pub(crate) fn follow_path(
        &mut self,
        path: &str,
        fi: &mut FileInfo,
    ) -> Result<(DirCursor, PathTarget, NameBuf)> {
        let mut dp = self.root_dir();
        let trimmed = path.trim_start_matches('/');
        let mut segs = trimmed.split('/').filter(|s| !s.is_empty()).peekable();
        if segs.peek().is_none() {
            return Ok((dp, PathTarget::Root, NameBuf::new()));
        }
        loop {
            let seg = match segs.next() {
                Some(s) => s,
                None => return Err(Error::Internal),
            };
            let nb = create_name(seg)?;
            if self.kind.is_exfat() && nb.ns & NS_DOT != 0 {
                // exFAT directories carry no dot entries.
                return Err(Error::InvalidName);
            }
            let obj = if self.kind.is_exfat() {
                self.dir_find_ex(&mut dp, &nb, fi)?
            } else {
                self.dir_find_fat(&mut dp, &nb, fi)?
            };
            match obj {
                None => {
                    return if segs.peek().is_none() {
                        Ok((dp, PathTarget::Missing, nb))
                    } else {
                        Err(Error::NoPath)
                    };
                }
                Some(o) => {
                    if segs.peek().is_none() {
                        return Ok((dp, PathTarget::Found(o), nb));
                    }
                    if o.attr & ATTR_DIRECTORY == 0 {
                        return Err(Error::NoPath);
                    }
                    dp = self.sub_dir(&o);
                }
            }
        }
    }

    /// Register `nb` in `dp` for a new object with no data yet.
    pub(crate) fn register(&mut self, dp: &mut DirCursor, nb: &NameBuf, attr: u8) -> Result<EntryLoc> {
        if self.kind.is_exfat() {
            self.dir_register_ex(dp, nb, attr, 0, 0, false)
        } else {
            self.dir_register_fat(dp, nb, attr)
        }
    }

    // ─── Metadata operations ───────────────────────────────────────────────────

    /// Look up `path` and return a snapshot of its entry.
    pub fn stat(&mut self, path: &str) -> Result<FileInfo> {
        let mut fi = FileInfo::new();
        let (_, target, _) = self.follow_path(path, &mut fi)?;
        match target {
            PathTarget::Found(_) => Ok(fi),
            PathTarget::Root => Err(Error::InvalidName),
            PathTarget::Missing => Err(Error::NoFile),
        }
    }

    /// Open a directory for enumeration.
    pub fn open_dir(&mut self, path: &str) -> Result<DirHandle> {
        let mut fi = FileInfo::new();
        let (_, target, _) = self.follow_path(path, &mut fi)?;
        let mut cursor = match target {
            PathTarget::Root => self.root_dir(),
            PathTarget::Found(o) if o.attr & ATTR_DIRECTORY != 0 => self.sub_dir(&o),
            PathTarget::Found(_) | PathTarget::Missing => return Err(Error::NoPath),
        };
        self.dir_rewind(&mut cursor)?;
        Ok(DirHandle { mount_id: self.mount_id, cursor, finished: false })
    }

    /// Return the next entry, or `None` at the end. Dot entries and the
    /// volume label are not reported.
    pub fn read_dir(&mut self, dh: &mut DirHandle) -> Result<Option<FileInfo>> {
        self.validate_id(dh.mount_id)?;
        if dh.finished {
            return Ok(None);
        }
        let mut fi = FileInfo::new();
        let obj = if self.kind.is_exfat() {
            self.dir_read_ex(&mut dh.cursor, &mut fi)?
        } else {
            self.dir_read_fat(&mut dh.cursor, &mut fi)?
        };
        match obj {
            None => {
                dh.finished = true;
                Ok(None)
            }
            Some(_) => {
                if !self.dir_next(&mut dh.cursor, false)? {
                    dh.finished = true;
                }
                Ok(Some(fi))
            }
        }
    }

    pub fn close_dir(&mut self, dh: DirHandle) -> Result<()> {
        self.validate_id(dh.mount_id)
    }

    /// Create a directory, including its initial cluster (and, on classic
    /// FAT, its dot entries).
    pub fn create_dir(&mut self, path: &str) -> Result<()> {
        self.check_writable()?;
        let mut fi = FileInfo::new();
        let (mut dp, target, nb) = self.follow_path(path, &mut fi)?;
        match target {
            PathTarget::Root | PathTarget::Found(_) => return Err(Error::Exist),
            PathTarget::Missing => {}
        }

        let mut chain = Chain::empty();
        let new = match fat::create_chain(self, &mut chain, 0)? {
            Some(c) => c,
            None => return Err(Error::Denied),
        };
        self.clear_sectors(self.cluster_sector(new), self.csize as u64)?;

        if self.kind.is_exfat() {
            let cb = self.cluster_bytes() as u64;
            self.dir_register_ex(
                &mut dp,
                &nb,
                ATTR_DIRECTORY,
                new,
                cb,
                chain.stat == ChainStatus::Contiguous,
            )?;
        } else {
            let parent = if dp.chain.start == self.root_cluster { 0 } else { dp.chain.start };
            let (date, time) = self.now().to_fat();
            let mut dot = [0u8; 32];
            dot[..11].copy_from_slice(b".          ");
            dot[DIR_ATTR] = ATTR_DIRECTORY;
            st16(&mut dot, DIR_MOD_TIME, time);
            st16(&mut dot, DIR_MOD_DATE, date);
            st16(&mut dot, DIR_CLUST_LO, (new & 0xFFFF) as u16);
            st16(&mut dot, DIR_CLUST_HI, (new >> 16) as u16);
            let mut dotdot = dot;
            dotdot[1] = b'.';
            st16(&mut dotdot, DIR_CLUST_LO, (parent & 0xFFFF) as u16);
            st16(&mut dotdot, DIR_CLUST_HI, (parent >> 16) as u16);
            let sec = self.cluster_sector(new);
            self.move_window(sec)?;
            self.win_mut()[..32].copy_from_slice(&dot);
            self.win_mut()[32..64].copy_from_slice(&dotdot);

            let loc = self.dir_register_fat(&mut dp, &nb, ATTR_DIRECTORY)?;
            self.update_fat_entry(&loc, |e| {
                st16(e, DIR_CLUST_LO, (new & 0xFFFF) as u16);
                st16(e, DIR_CLUST_HI, (new >> 16) as u16);
            })?;
        }
        self.sync_fs()
    }

    /// Remove a file or an empty directory.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.check_writable()?;
        let mut fi = FileInfo::new();
        let (_, target, nb) = self.follow_path(path, &mut fi)?;
        if nb.ns & NS_DOT != 0 {
            return Err(Error::InvalidName);
        }
        let obj = match target {
            PathTarget::Found(o) => o,
            PathTarget::Root => Err(Error::InvalidName)?,
            PathTarget::Missing => Err(Error::NoFile)?,
        };
        if obj.attr & ATTR_READ_ONLY != 0 {
            return Err(Error::Denied);
        }
        if obj.attr & ATTR_DIRECTORY != 0 {
            let mut sub = self.sub_dir(&obj);
            self.dir_rewind(&mut sub)?;
            let mut scratch = FileInfo::new();
            let occupied = if self.kind.is_exfat() {
                self.dir_read_ex(&mut sub, &mut scratch)?
            } else {
                self.dir_read_fat(&mut sub, &mut scratch)?
            };
            if occupied.is_some() {
                return Err(Error::Denied);
            }
        }
        self.dir_remove(&obj.loc)?;
        if obj.sclust != 0 {
            let mut chain = self.obj_chain(&obj);
            fat::remove_chain(self, &mut chain, obj.sclust, 0)?;
        }
        self.sync_fs()
    }

    /// Rename or move an object. The new path must not exist.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        self.check_writable()?;
        let mut fi = FileInfo::new();
        let (_, target, onb) = self.follow_path(old, &mut fi)?;
        if onb.ns & NS_DOT != 0 {
            return Err(Error::InvalidName);
        }
        let obj = match target {
            PathTarget::Found(o) => o,
            PathTarget::Root => Err(Error::InvalidName)?,
            PathTarget::Missing => Err(Error::NoFile)?,
        };

        let (mut ndp, ntarget, nnb) = self.follow_path(new, &mut fi)?;
        match ntarget {
            PathTarget::Missing => {}
            PathTarget::Root | PathTarget::Found(_) => return Err(Error::Exist),
        }

        if self.kind.is_exfat() {
            let loc = self.dir_register_ex(
                &mut ndp,
                &nnb,
                obj.attr,
                obj.sclust,
                obj.size,
                obj.contiguous,
            )?;
            // Carry the original timestamps over to the new set.
            let mut old_xb: XDirBuf = [0; X_SET_MAX * 32];
            let mut new_xb: XDirBuf = [0; X_SET_MAX * 32];
            self.load_xdir(&obj.loc, &mut old_xb)?;
            self.load_xdir(&loc, &mut new_xb)?;
            new_xb[8..22].copy_from_slice(&old_xb[8..22]);
            self.store_xdir(&loc, &mut new_xb)?;
        } else {
            let loc = self.dir_register_fat(&mut ndp, &nnb, obj.attr)?;
            let (mdate, mtime) = obj.modified.to_fat();
            let size = obj.size as u32;
            let sclust = obj.sclust;
            self.update_fat_entry(&loc, |e| {
                st16(e, DIR_CLUST_LO, (sclust & 0xFFFF) as u16);
                st16(e, DIR_CLUST_HI, (sclust >> 16) as u16);
                st32(e, DIR_SIZE, size);
                st16(e, DIR_MOD_TIME, mtime);
                st16(e, DIR_MOD_DATE, mdate);
            })?;
            if obj.attr & ATTR_DIRECTORY != 0 && obj.sclust != 0 {
                // The moved directory's `..` entry must follow its new parent.
                let parent = if ndp.chain.start == self.root_cluster { 0 } else { ndp.chain.start };
                let sec = self.cluster_sector(obj.sclust);
                self.move_window(sec)?;
                let w = self.win_mut();
                st16(w, 32 + DIR_CLUST_LO, (parent & 0xFFFF) as u16);
                st16(w, 32 + DIR_CLUST_HI, (parent >> 16) as u16);
            }
        }
        self.dir_remove(&obj.loc)?;
        self.sync_fs()
    }

    /// Change the attribute bits selected by `mask`.
    pub fn set_attributes(&mut self, path: &str, attr: Attributes, mask: Attributes) -> Result<()> {
        self.check_writable()?;
        let changeable = Attributes::READ_ONLY
            | Attributes::HIDDEN
            | Attributes::SYSTEM
            | Attributes::ARCHIVE;
        let mask = mask & changeable;
        let mut fi = FileInfo::new();
        let (_, target, _) = self.follow_path(path, &mut fi)?;
        let obj = match target {
            PathTarget::Found(o) => o,
            PathTarget::Root => Err(Error::InvalidName)?,
            PathTarget::Missing => Err(Error::NoFile)?,
        };
        if self.kind.is_exfat() {
            let mut xb: XDirBuf = [0; X_SET_MAX * 32];
            self.load_xdir(&obj.loc, &mut xb)?;
            let cur = ld16(&xb, 4);
            let v = (cur & !(mask.bits() as u16)) | (attr.bits() & mask.bits()) as u16;
            st16(&mut xb, 4, v);
            self.store_xdir(&obj.loc, &mut xb)?;
        } else {
            self.update_fat_entry(&obj.loc, |e| {
                e[DIR_ATTR] = (e[DIR_ATTR] & !mask.bits()) | (attr.bits() & mask.bits());
            })?;
        }
        self.sync_fs()
    }

    /// Set the modification timestamp.
    pub fn set_timestamp(&mut self, path: &str, ts: Timestamp) -> Result<()> {
        self.check_writable()?;
        let mut fi = FileInfo::new();
        let (_, target, _) = self.follow_path(path, &mut fi)?;
        let obj = match target {
            PathTarget::Found(o) => o,
            PathTarget::Root => Err(Error::InvalidName)?,
            PathTarget::Missing => Err(Error::NoFile)?,
        };
        if self.kind.is_exfat() {
            let mut xb: XDirBuf = [0; X_SET_MAX * 32];
            self.load_xdir(&obj.loc, &mut xb)?;
            st32(&mut xb, 12, ts.to_exfat());
            xb[21] = 0;
            self.store_xdir(&obj.loc, &mut xb)?;
        } else {
            let (date, time) = ts.to_fat();
            self.update_fat_entry(&obj.loc, |e| {
                st16(e, DIR_MOD_TIME, time);
                st16(e, DIR_MOD_DATE, date);
            })?;
        }
        self.sync_fs()
    }

    // ─── Volume label ──────────────────────────────────────────────────────────

    /// Find the label entry in the root, if any.
    fn find_label(&mut self) -> Result<Option<(u64, u32, [u8; 32])>> {
        let mut dp = self.root_dir();
        self.dir_rewind(&mut dp)?;
        loop {
            let e = self.read_entry(dp.sector, dp.offset)?;
            let hit = if self.kind.is_exfat() {
                if e[0] == 0 {
                    return Ok(None);
                }
                e[0] == XT_LABEL
            } else {
                let c = e[0];
                if c == 0 {
                    return Ok(None);
                }
                let attr = e[DIR_ATTR] & 0x3F;
                c != DELETED && attr & ATTR_VOLUME != 0 && attr != ATTR_LFN
            };
            if hit {
                return Ok(Some((dp.sector, dp.offset, e)));
            }
            if !self.dir_next(&mut dp, false)? {
                return Ok(None);
            }
        }
    }

    /// Read the volume label; empty when none is set.
    pub fn label(&mut self) -> Result<VolumeLabel> {
        let mut out = VolumeLabel::empty();
        let e = match self.find_label()? {
            Some((_, _, e)) => e,
            None => return Ok(out),
        };
        if self.kind.is_exfat() {
            let n = (e[1] as usize).min(11);
            let mut units = [0u16; 11];
            for (i, u) in units.iter_mut().enumerate().take(n) {
                *u = ld16(&e, 2 + i * 2);
            }
            for r in core::char::decode_utf16(units[..n].iter().copied()) {
                out.push_char(r.unwrap_or(char::REPLACEMENT_CHARACTER));
            }
        } else {
            let mut end = 11;
            while end > 0 && e[end - 1] == b' ' {
                end -= 1;
            }
            for i in 0..end {
                let b = if i == 0 && e[0] == 0x05 { DELETED } else { e[i] };
                out.push_char(b as char);
            }
        }
        Ok(out)
    }

    /// Set or clear (empty string) the volume label.
    pub fn set_label(&mut self, label: &str) -> Result<()> {
        self.check_writable()?;
        if self.kind.is_exfat() {
            let mut units = [0u16; 11];
            let mut n = 0usize;
            for u in label.encode_utf16() {
                if n >= 11 {
                    return Err(Error::InvalidName);
                }
                units[n] = u;
                n += 1;
            }
            let found = self.find_label()?;
            match found {
                Some((sec, ofs, mut e)) => {
                    if n == 0 {
                        e[0] = XT_LABEL & !X_IN_USE;
                    } else {
                        e = [0u8; 32];
                        e[0] = XT_LABEL;
                        e[1] = n as u8;
                        for (i, &u) in units[..n].iter().enumerate() {
                            st16(&mut e, 2 + i * 2, u);
                        }
                    }
                    self.write_entry(sec, ofs, &e)?;
                }
                None if n > 0 => {
                    let mut dp = self.root_dir();
                    self.dir_alloc(&mut dp, 1)?;
                    let mut e = [0u8; 32];
                    e[0] = XT_LABEL;
                    e[1] = n as u8;
                    for (i, &u) in units[..n].iter().enumerate() {
                        st16(&mut e, 2 + i * 2, u);
                    }
                    self.write_entry(dp.sector, dp.offset, &e)?;
                }
                None => {}
            }
        } else {
            let mut name = [b' '; 11];
            let mut n = 0usize;
            for c in label.chars() {
                if n >= 11 {
                    return Err(Error::InvalidName);
                }
                let b = c.to_ascii_uppercase();
                if !b.is_ascii()
                    || matches!(b, '"' | '*' | '+' | ',' | '.' | '/' | ':' | ';' | '<' | '=' | '>' | '?' | '[' | ']' | '|' | '\\')
                    || (b as u32) < 0x20
                {
                    return Err(Error::InvalidName);
                }
                name[n] = b as u8;
                n += 1;
            }
            let found = self.find_label()?;
            match found {
                Some((sec, ofs, mut e)) => {
                    if n == 0 {
                        e[0] = DELETED;
                    } else {
                        e[..11].copy_from_slice(&name);
                    }
                    self.write_entry(sec, ofs, &e)?;
                }
                None if n > 0 => {
                    let mut dp = self.root_dir();
                    self.dir_alloc(&mut dp, 1)?;
                    let (date, time) = self.now().to_fat();
                    let mut e = [0u8; 32];
                    e[..11].copy_from_slice(&name);
                    e[DIR_ATTR] = ATTR_VOLUME;
                    st16(&mut e, DIR_MOD_TIME, time);
                    st16(&mut e, DIR_MOD_DATE, date);
                    self.write_entry(dp.sector, dp.offset, &e)?;
                }
                None => {}
            }
        }
        self.sync_fs()
    }
}

fn xset_obj(xb: &XDirBuf, loc: EntryLoc) -> ObjInfo {
    ObjInfo {
        attr: (ld16(xb, 4) & 0x3F) as u8,
        sclust: ld32(xb, 32 + 20),
        size: ld64(xb, 32 + 24),
        contiguous: xb[33] & X_NO_FAT_CHAIN != 0,
        modified: Timestamp::from_exfat(ld32(xb, 12)),
        loc,
    }
}

/// Extract the name units of a loaded entry set.
fn xset_name(xb: &XDirBuf, n_ent: usize, out: &mut [u16; MAX_NAME_CHARS]) -> usize {
    let len = (xb[32 + 3] as usize).min(MAX_NAME_CHARS);
    let mut k = 0;
    for i in 2..n_ent {
        if xb[i * 32] != XT_NAME {
            break;
        }
        for j in 0..X_NAME_CHARS {
            if k >= len {
                return k;
            }
            out[k] = ld16(xb, i * 32 + 2 + j * 2);
            k += 1;
        }
    }
    k
}

// ─── Tests ─────────────────────────────────────────────────────────────────────
