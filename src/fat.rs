//! Cluster allocator: FAT-table entries in their three on-disk widths,
//! the exFAT allocation bitmap, and chain create/extend/free.
//!
//! Classic FAT chains live entirely in the table. exFAT chains start life
//! contiguous (bitmap bits only, no FAT entries); the table is written
//! only once a chain becomes fragmented.

use crate::device::{BlockDevice, Ioctl, SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::volume::{ld16, ld32, st16, st32, FsKind, Volume};

const SECTOR_SIZE_U64: u64 = SECTOR_SIZE as u64;

/// Decoded state of one FAT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClusterStatus {
    Free,
    Next(u32),
    Eoc,
    Bad,
}

/// Allocation layout of an exFAT object's cluster chain. Classic FAT
/// objects always use `Fragmented` (the table is authoritative there).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainStatus {
    /// No clusters allocated yet.
    Undetermined,
    /// Clusters are a literal +1 run; no FAT entries exist.
    Contiguous,
    /// Chain is linked through the FAT table.
    Fragmented,
}

/// Cluster-chain view of one object, carried by open files/directories.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Chain {
    pub start: u32,
    /// Length in clusters; meaningful while `stat == Contiguous`.
    pub n_clusters: u32,
    pub stat: ChainStatus,
}

impl Chain {
    pub(crate) fn empty() -> Chain {
        Chain { start: 0, n_clusters: 0, stat: ChainStatus::Undetermined }
    }

    /// Chain rooted at `start` that is linked through the FAT.
    pub(crate) fn fragmented(start: u32) -> Chain {
        Chain { start, n_clusters: 0, stat: ChainStatus::Fragmented }
    }

    pub(crate) fn contiguous(start: u32, n_clusters: u32) -> Chain {
        Chain { start, n_clusters, stat: ChainStatus::Contiguous }
    }
}

/// End-of-chain mark to store for this volume's table width.
pub(crate) fn eoc_mark(kind: FsKind) -> u32 {
    match kind {
        FsKind::Fat12 => 0xFFF,
        FsKind::Fat16 => 0xFFFF,
        FsKind::Fat32 => 0x0FFF_FFFF,
        FsKind::ExFat => 0xFFFF_FFFF,
    }
}

/// Classify a raw table value for a volume with `n_entries` total entries.
fn classify(kind: FsKind, n_entries: u32, v: u32) -> ClusterStatus {
    let (bad, eoc_min) = match kind {
        FsKind::Fat12 => (0xFF7, 0xFF8),
        FsKind::Fat16 => (0xFFF7, 0xFFF8),
        FsKind::Fat32 => (0x0FFF_FFF7, 0x0FFF_FFF8),
        FsKind::ExFat => (0xFFFF_FFF7, 0xFFFF_FFF8),
    };
    if v == 0 {
        ClusterStatus::Free
    } else if v == bad {
        ClusterStatus::Bad
    } else if v >= eoc_min {
        ClusterStatus::Eoc
    } else if (2..n_entries).contains(&v) {
        ClusterStatus::Next(v)
    } else {
        // 1, or a pointer outside the cluster heap: structure is corrupt.
        ClusterStatus::Bad
    }
}

// ─── Raw FAT table access ──────────────────────────────────────────────────────

/// Read the table entry for `clst`, normalized to the entry width.
pub(crate) fn fat_get<D: BlockDevice>(vol: &mut Volume<D>, clst: u32) -> Result<u32> {
    if !vol.valid_cluster(clst) {
        return Err(Error::Internal);
    }
    match vol.kind {
        FsKind::Fat12 => {
            // Packed 12-bit pairs; the two bytes of an entry may straddle
            // a sector boundary, which costs a second window move.
            let bc = clst as u64 + (clst as u64 / 2);
            vol.move_window(vol.fat_base + bc / SECTOR_SIZE as u64)?;
            let lo = vol.win()[(bc % SECTOR_SIZE as u64) as usize];
            let bc = bc + 1;
            vol.move_window(vol.fat_base + bc / SECTOR_SIZE as u64)?;
            let hi = vol.win()[(bc % SECTOR_SIZE as u64) as usize];
            let v = ((hi as u32) << 8) | lo as u32;
            Ok(if clst & 1 != 0 { v >> 4 } else { v & 0xFFF })
        }
        FsKind::Fat16 => {
            let bc = clst as u64 * 2;
            vol.move_window(vol.fat_base + bc / SECTOR_SIZE as u64)?;
            Ok(ld16(vol.win(), (bc % SECTOR_SIZE as u64) as usize) as u32)
        }
        FsKind::Fat32 => {
            let bc = clst as u64 * 4;
            vol.move_window(vol.fat_base + bc / SECTOR_SIZE as u64)?;
            Ok(ld32(vol.win(), (bc % SECTOR_SIZE as u64) as usize) & 0x0FFF_FFFF)
        }
        FsKind::ExFat => {
            let bc = clst as u64 * 4;
            vol.move_window(vol.fat_base + bc / SECTOR_SIZE_U64)?;
            Ok(ld32(vol.win(), (bc % SECTOR_SIZE as u64) as usize))
        }
    }
}

/// Write the table entry for `clst`. FAT32 preserves the reserved top
/// nibble of the dword.
pub(crate) fn fat_put<D: BlockDevice>(vol: &mut Volume<D>, clst: u32, val: u32) -> Result<()> {
    if !vol.valid_cluster(clst) {
        return Err(Error::Internal);
    }
    match vol.kind {
        FsKind::Fat12 => {
            let bc = clst as u64 + (clst as u64 / 2);
            vol.move_window(vol.fat_base + bc / SECTOR_SIZE_U64)?;
            let off = (bc % SECTOR_SIZE_U64) as usize;
            let odd = clst & 1 != 0;
            {
                let w = vol.win_mut();
                w[off] = if odd { (w[off] & 0x0F) | ((val as u8) << 4) } else { val as u8 };
            }
            let bc = bc + 1;
            vol.move_window(vol.fat_base + bc / SECTOR_SIZE_U64)?;
            let off = (bc % SECTOR_SIZE_U64) as usize;
            {
                let w = vol.win_mut();
                w[off] = if odd { (val >> 4) as u8 } else { (w[off] & 0xF0) | ((val >> 8) as u8 & 0x0F) };
            }
            Ok(())
        }
        FsKind::Fat16 => {
            let bc = clst as u64 * 2;
            vol.move_window(vol.fat_base + bc / SECTOR_SIZE_U64)?;
            st16(vol.win_mut(), (bc % SECTOR_SIZE_U64) as usize, val as u16);
            Ok(())
        }
        FsKind::Fat32 => {
            let bc = clst as u64 * 4;
            vol.move_window(vol.fat_base + bc / SECTOR_SIZE_U64)?;
            let off = (bc % SECTOR_SIZE_U64) as usize;
            let keep = ld32(vol.win(), off) & 0xF000_0000;
            st32(vol.win_mut(), off, keep | (val & 0x0FFF_FFFF));
            Ok(())
        }
        FsKind::ExFat => {
            let bc = clst as u64 * 4;
            vol.move_window(vol.fat_base + bc / SECTOR_SIZE_U64)?;
            st32(vol.win_mut(), (bc % SECTOR_SIZE_U64) as usize, val);
            Ok(())
        }
    }
}

/// Follow one link of a FAT-table chain, ignoring any contiguous-chain
/// emulation. `Ok(None)` at end of chain.
pub(crate) fn chain_next_raw<D: BlockDevice>(
    vol: &mut Volume<D>,
    clst: u32,
) -> Result<Option<u32>> {
    let v = fat_get(vol, clst)?;
    match classify(vol.kind, vol.n_entries, v) {
        ClusterStatus::Next(n) => Ok(Some(n)),
        ClusterStatus::Eoc => Ok(None),
        ClusterStatus::Free | ClusterStatus::Bad => {
            log::warn!("broken cluster chain at {clst} (entry {v:#x})");
            Err(Error::Internal)
        }
    }
}

/// Follow one link of an object's chain, emulating the implicit +1 run of
/// a contiguous exFAT object.
pub(crate) fn next_cluster<D: BlockDevice>(
    vol: &mut Volume<D>,
    chain: &Chain,
    clst: u32,
) -> Result<ClusterStatus> {
    if vol.kind == FsKind::ExFat && chain.stat == ChainStatus::Contiguous {
        if clst < chain.start || clst >= chain.start + chain.n_clusters {
            return Err(Error::Internal);
        }
        if clst + 1 == chain.start + chain.n_clusters {
            return Ok(ClusterStatus::Eoc);
        }
        return Ok(ClusterStatus::Next(clst + 1));
    }
    let v = fat_get(vol, clst)?;
    Ok(classify(vol.kind, vol.n_entries, v))
}

// ─── exFAT allocation bitmap ───────────────────────────────────────────────────

pub(crate) fn bitmap_get<D: BlockDevice>(vol: &mut Volume<D>, clst: u32) -> Result<bool> {
    if !vol.valid_cluster(clst) {
        return Err(Error::Internal);
    }
    let i = (clst - 2) as u64;
    vol.move_window(vol.bitmap_base + i / 8 / SECTOR_SIZE_U64)?;
    let byte = vol.win()[((i / 8) % SECTOR_SIZE_U64) as usize];
    Ok(byte & (1 << (i % 8)) != 0)
}

pub(crate) fn bitmap_set<D: BlockDevice>(
    vol: &mut Volume<D>,
    clst: u32,
    in_use: bool,
) -> Result<()> {
    if !vol.valid_cluster(clst) {
        return Err(Error::Internal);
    }
    let i = (clst - 2) as u64;
    vol.move_window(vol.bitmap_base + i / 8 / SECTOR_SIZE_U64)?;
    let off = ((i / 8) % SECTOR_SIZE_U64) as usize;
    let mask = 1u8 << (i % 8);
    let cur = vol.win()[off] & mask != 0;
    if cur == in_use {
        // Setting a set bit (or clearing a clear one) means the bitmap and
        // the caller's view of the heap disagree.
        return Err(Error::Internal);
    }
    let w = vol.win_mut();
    if in_use {
        w[off] |= mask;
    } else {
        w[off] &= !mask;
    }
    Ok(())
}

/// Scan the bitmap for a run of `count` free clusters, starting at the
/// hint and wrapping once around the heap. Tracks a running candidate
/// start and restarts the run whenever an in-use bit is hit.
pub(crate) fn find_bitmap<D: BlockDevice>(
    vol: &mut Volume<D>,
    from: u32,
    count: u32,
) -> Result<Option<u32>> {
    let total = vol.n_entries - 2;
    let mut clst = if vol.valid_cluster(from) { from } else { 2 };
    let mut run_start = clst;
    let mut run_len = 0u32;
    for _ in 0..=total {
        if bitmap_get(vol, clst)? {
            run_len = 0;
        } else {
            if run_len == 0 {
                run_start = clst;
            }
            run_len += 1;
            if run_len == count {
                return Ok(Some(run_start));
            }
        }
        clst += 1;
        if clst >= vol.n_entries {
            clst = 2;
            // A run cannot wrap across the heap end.
            run_len = 0;
        }
        if clst == if vol.valid_cluster(from) { from } else { 2 } {
            break;
        }
    }
    Ok(None)
}

// ─── Chain operations ──────────────────────────────────────────────────────────

/// Allocate a new cluster: start a chain (`prev == 0`) or extend one after
/// `prev`. Returns `Ok(None)` when the volume is full, so callers can stop
/// short instead of failing the whole operation.
pub(crate) fn create_chain<D: BlockDevice>(
    vol: &mut Volume<D>,
    chain: &mut Chain,
    prev: u32,
) -> Result<Option<u32>> {
    if prev != 0 && !vol.valid_cluster(prev) {
        return Err(Error::Internal);
    }

    if vol.kind == FsKind::ExFat {
        return create_chain_exfat(vol, chain, prev);
    }

    // Classic FAT: walk the table from the hint, wrapping once.
    let start_hint = if vol.valid_cluster(vol.last_cluster) {
        vol.last_cluster + 1
    } else if prev != 0 {
        prev + 1
    } else {
        2
    };
    let mut clst = if vol.valid_cluster(start_hint) { start_hint } else { 2 };
    let total = vol.n_entries - 2;
    for _ in 0..total {
        let v = fat_get(vol, clst)?;
        if classify(vol.kind, vol.n_entries, v) == ClusterStatus::Free {
            fat_put(vol, clst, eoc_mark(vol.kind))?;
            if prev != 0 {
                fat_put(vol, prev, clst)?;
            }
            if chain.start == 0 {
                chain.start = clst;
            }
            chain.stat = ChainStatus::Fragmented;
            vol.last_cluster = clst;
            vol.note_free_delta(-1);
            return Ok(Some(clst));
        }
        clst += 1;
        if clst >= vol.n_entries {
            clst = 2;
        }
    }
    Ok(None)
}

fn create_chain_exfat<D: BlockDevice>(
    vol: &mut Volume<D>,
    chain: &mut Chain,
    prev: u32,
) -> Result<Option<u32>> {
    // Fast path: extend a contiguous run in place when its next neighbor
    // is still free.
    if chain.stat == ChainStatus::Contiguous && prev != 0 {
        if prev != chain.start + chain.n_clusters - 1 {
            return Err(Error::Internal);
        }
        let next = prev + 1;
        if vol.valid_cluster(next) && !bitmap_get(vol, next)? {
            bitmap_set(vol, next, true)?;
            chain.n_clusters += 1;
            vol.last_cluster = next;
            vol.note_free_delta(-1);
            return Ok(Some(next));
        }
        // The run can no longer grow in place: materialize it in the FAT
        // and fall through to a fragmented allocation.
        for c in chain.start..chain.start + chain.n_clusters {
            let link = if c + 1 == chain.start + chain.n_clusters {
                eoc_mark(FsKind::ExFat)
            } else {
                c + 1
            };
            fat_put(vol, c, link)?;
        }
        chain.stat = ChainStatus::Fragmented;
    }

    let hint = if vol.valid_cluster(vol.last_cluster) { vol.last_cluster + 1 } else { 2 };
    let found = match find_bitmap(vol, hint, 1)? {
        Some(c) => c,
        None => return Ok(None),
    };
    bitmap_set(vol, found, true)?;
    if prev == 0 {
        // New object: no FAT entries until it fragments.
        chain.start = found;
        chain.n_clusters = 1;
        chain.stat = ChainStatus::Contiguous;
    } else {
        fat_put(vol, found, eoc_mark(FsKind::ExFat))?;
        fat_put(vol, prev, found)?;
        chain.stat = ChainStatus::Fragmented;
    }
    vol.last_cluster = found;
    vol.note_free_delta(-1);
    Ok(Some(found))
}

/// Hand a freed cluster run `first..=last` to the device as a trim hint.
/// Advisory; a device without trim support just rejects the ioctl.
fn trim_run<D: BlockDevice>(vol: &mut Volume<D>, first: u32, last: u32) {
    let start = vol.cluster_sector(first);
    let end = vol.cluster_sector(last) + vol.csize as u64 - 1;
    let _ = vol.dev.ioctl(Ioctl::Trim { start, end });
}

/// Free the chain from `start` to its end. `prev` is the cluster that
/// preceded `start` (0 when the whole chain goes); the remaining head is
/// terminated there, and on exFAT the head's contiguity is re-derived.
pub(crate) fn remove_chain<D: BlockDevice>(
    vol: &mut Volume<D>,
    chain: &mut Chain,
    start: u32,
    prev: u32,
) -> Result<()> {
    if !vol.valid_cluster(start) {
        return Err(Error::Internal);
    }

    if prev != 0 && vol.kind != FsKind::ExFat {
        fat_put(vol, prev, eoc_mark(vol.kind))?;
    }

    if vol.kind == FsKind::ExFat && chain.stat == ChainStatus::Contiguous {
        // Bitmap-only chain: clear the tail run in one sweep.
        let end = chain.start + chain.n_clusters;
        if start < chain.start || start >= end {
            return Err(Error::Internal);
        }
        for c in start..end {
            bitmap_set(vol, c, false)?;
            vol.note_free_delta(1);
        }
        trim_run(vol, start, end - 1);
        chain.n_clusters = start - chain.start;
        if prev == 0 {
            *chain = Chain::empty();
        }
        return Ok(());
    }

    let mut clst = start;
    let mut run_first = start;
    loop {
        let next = match chain_next_raw(vol, clst) {
            Ok(n) => n,
            Err(e) => return Err(e),
        };
        fat_put(vol, clst, 0)?;
        if vol.kind == FsKind::ExFat {
            bitmap_set(vol, clst, false)?;
        }
        vol.note_free_delta(1);
        match next {
            Some(n) if n == clst + 1 => clst = n,
            Some(n) => {
                trim_run(vol, run_first, clst);
                run_first = n;
                clst = n;
            }
            None => {
                trim_run(vol, run_first, clst);
                break;
            }
        }
    }

    if prev == 0 {
        *chain = Chain::empty();
        return Ok(());
    }
    if vol.kind == FsKind::ExFat {
        fat_put(vol, prev, eoc_mark(FsKind::ExFat))?;
        // The surviving head may have become a literal +1 run again.
        let mut c = chain.start;
        let mut contiguous = true;
        let mut len = 1u32;
        while c != prev {
            match chain_next_raw(vol, c)? {
                Some(n) if n == c + 1 => {
                    c = n;
                    len += 1;
                }
                Some(n) => {
                    contiguous = false;
                    c = n;
                    len += 1;
                }
                None => return Err(Error::Internal),
            }
        }
        if contiguous {
            chain.stat = ChainStatus::Contiguous;
            chain.n_clusters = len;
        } else {
            chain.stat = ChainStatus::Fragmented;
        }
    }
    Ok(())
}

/// Full free-cluster scan: bitmap for exFAT, the table otherwise.
pub(crate) fn scan_free<D: BlockDevice>(vol: &mut Volume<D>) -> Result<u32> {
    let mut free = 0u32;
    match vol.kind {
        FsKind::ExFat => {
            for clst in 2..vol.n_entries {
                if !bitmap_get(vol, clst)? {
                    free += 1;
                }
            }
        }
        FsKind::Fat12 => {
            for clst in 2..vol.n_entries {
                if fat_get(vol, clst)? == 0 {
                    free += 1;
                }
            }
        }
        FsKind::Fat16 | FsKind::Fat32 => {
            let width = if vol.kind == FsKind::Fat16 { 2u64 } else { 4u64 };
            for clst in 2..vol.n_entries {
                let bc = clst as u64 * width;
                vol.move_window(vol.fat_base + bc / SECTOR_SIZE_U64)?;
                let off = (bc % SECTOR_SIZE_U64) as usize;
                let v = if width == 2 {
                    ld16(vol.win(), off) as u32
                } else {
                    ld32(vol.win(), off) & 0x0FFF_FFFF
                };
                if v == 0 {
                    free += 1;
                }
            }
        }
    }
    Ok(free)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_fat16_ranges() {
        let n = 100;
        assert_eq!(classify(FsKind::Fat16, n, 0), ClusterStatus::Free);
        assert_eq!(classify(FsKind::Fat16, n, 5), ClusterStatus::Next(5));
        assert_eq!(classify(FsKind::Fat16, n, 0xFFF7), ClusterStatus::Bad);
        assert_eq!(classify(FsKind::Fat16, n, 0xFFF8), ClusterStatus::Eoc);
        assert_eq!(classify(FsKind::Fat16, n, 0xFFFF), ClusterStatus::Eoc);
        //.. and a link outside the heap is corruption, not a link.
        assert_eq!(classify(FsKind::Fat16, n, 5000), ClusterStatus::Bad);
    }

    #[test]
    fn classify_fat32_ignores_reserved_nibble_values() {
        let n = 0x1000;
        assert_eq!(classify(FsKind::Fat32, n, 0x0FFF_FFFF), ClusterStatus::Eoc);
        assert_eq!(classify(FsKind::Fat32, n, 0x0FFF_FFF7), ClusterStatus::Bad);
        assert_eq!(classify(FsKind::Fat32, n, 0x123), ClusterStatus::Next(0x123));
    }

    #[test]
    fn classify_reserved_entry_is_bad() {
        assert_eq!(classify(FsKind::Fat12, 100, 1), ClusterStatus::Bad);
    }

    #[test]
    fn eoc_marks_match_table_width() {
        assert_eq!(eoc_mark(FsKind::Fat12), 0xFFF);
        assert_eq!(eoc_mark(FsKind::Fat16), 0xFFFF);
        assert_eq!(eoc_mark(FsKind::Fat32), 0x0FFF_FFFF);
        assert_eq!(eoc_mark(FsKind::ExFat), 0xFFFF_FFFF);
    }
}
