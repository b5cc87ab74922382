//! exFAT-specific behavior: long Unicode names, contiguous chains and
//! their materialization into the FAT, directories, and labels.

mod common;

use common::{pattern, recycle, superfloppy};
use fatcore::{Error, FormatKind, FsKind, OpenMode};

const RW_CREATE: OpenMode = OpenMode::READ.union(OpenMode::WRITE).union(OpenMode::CREATE_ALWAYS);

#[test]
fn long_unicode_name_round_trips() {
    let mut vol = superfloppy(FormatKind::ExFat, 0x0001_0000);
    assert_eq!(vol.kind(), FsKind::ExFat);

    // 100 three-byte characters plus an extension: far past one name entry.
    let stem: String = std::iter::repeat('語').take(100).collect();
    let path = format!("/{stem}.txt");
    let mut fh = vol.open(&path, RW_CREATE).unwrap();
    vol.write(&mut fh, b"unicode body").unwrap();
    vol.close(fh).unwrap();

    let info = vol.stat(&path).unwrap();
    assert_eq!(info.name(), format!("{stem}.txt"));
    assert_eq!(info.size, 12);
    assert_eq!(info.short_name(), "");

    // Case-insensitive lookup through the up-case table.
    let mut vol = recycle(vol);
    assert_eq!(vol.stat(&format!("/{stem}.TXT")).unwrap().size, 12);
}

#[test]
fn name_at_the_length_limit() {
    let mut vol = superfloppy(FormatKind::ExFat, 0x0001_0000);
    let name: String = std::iter::repeat('x').take(fatcore::MAX_NAME_CHARS).collect();
    let fh = vol.open(&format!("/{name}"), RW_CREATE).unwrap();
    vol.close(fh).unwrap();
    assert_eq!(vol.stat(&format!("/{name}")).unwrap().name(), name);

    let over: String = std::iter::repeat('x').take(fatcore::MAX_NAME_CHARS + 1).collect();
    assert!(matches!(vol.open(&format!("/{over}"), RW_CREATE), Err(Error::InvalidName)));
}

#[test]
fn interleaved_growth_fragments_and_reads_back() {
    let mut vol = superfloppy(FormatKind::ExFat, 0x0001_0000);
    let mut a = vol.open("/a.bin", RW_CREATE).unwrap();
    let mut b = vol.open("/b.bin", RW_CREATE).unwrap();

    // Alternating appends force at least one file off its contiguous run,
    // which must materialize its chain into the FAT.
    let cb = 4096usize;
    for i in 0..12u8 {
        vol.write(&mut a, &pattern(cb, i)).unwrap();
        vol.write(&mut b, &pattern(cb, i.wrapping_add(0x80))).unwrap();
    }
    vol.close(a).unwrap();
    vol.close(b).unwrap();

    let mut vol = recycle(vol);
    for (path, seed) in [("/a.bin", 0u8), ("/b.bin", 0x80u8)] {
        let mut fh = vol.open(path, OpenMode::READ).unwrap();
        assert_eq!(fh.size(), (12 * cb) as u64);
        let mut got = vec![0u8; 12 * cb];
        assert_eq!(vol.read(&mut fh, &mut got).unwrap(), 12 * cb);
        for i in 0..12u8 {
            let at = i as usize * cb;
            assert_eq!(&got[at..at + cb], &pattern(cb, seed.wrapping_add(i))[..], "{path} chunk {i}");
        }
        vol.close(fh).unwrap();
    }
}

#[test]
fn directories_grow_and_enumerate() {
    let mut vol = superfloppy(FormatKind::ExFat, 0x0001_0000);
    vol.create_dir("/sub").unwrap();

    // Enough entry sets to stretch the directory past its first cluster.
    for i in 0..120 {
        let fh = vol
            .open(&format!("/sub/file with a longish name {i:03}.dat"), RW_CREATE)
            .unwrap();
        vol.close(fh).unwrap();
    }

    let mut dh = vol.open_dir("/sub").unwrap();
    let mut seen = 0;
    while let Some(info) = vol.read_dir(&mut dh).unwrap() {
        assert!(info.name().starts_with("file with a longish name "));
        seen += 1;
    }
    vol.close_dir(dh).unwrap();
    assert_eq!(seen, 120);

    // The stretched directory still enumerates after a fresh mount.
    let mut vol = recycle(vol);
    let mut dh = vol.open_dir("/sub").unwrap();
    let mut seen = 0;
    while vol.read_dir(&mut dh).unwrap().is_some() {
        seen += 1;
    }
    vol.close_dir(dh).unwrap();
    assert_eq!(seen, 120);
}

#[test]
fn rename_and_remove() {
    let mut vol = superfloppy(FormatKind::ExFat, 0x0001_0000);
    vol.create_dir("/d").unwrap();
    let mut fh = vol.open("/d/old name.bin", RW_CREATE).unwrap();
    vol.write(&mut fh, &pattern(9000, 6)).unwrap();
    vol.close(fh).unwrap();

    vol.rename("/d/old name.bin", "/d/new name.bin").unwrap();
    assert!(matches!(vol.stat("/d/old name.bin"), Err(Error::NoFile)));
    let mut fh = vol.open("/d/new name.bin", OpenMode::READ).unwrap();
    let mut got = vec![0u8; 9000];
    assert_eq!(vol.read(&mut fh, &mut got).unwrap(), 9000);
    assert_eq!(got, pattern(9000, 6));
    vol.close(fh).unwrap();

    assert!(matches!(vol.remove("/d"), Err(Error::Denied)));
    vol.remove("/d/new name.bin").unwrap();
    vol.remove("/d").unwrap();
}

#[test]
fn truncate_updates_bitmap_accounting() {
    let mut vol = superfloppy(FormatKind::ExFat, 0x0001_0000);
    let before = vol.free_clusters().unwrap();
    let cb = 4096u64;

    let mut fh = vol.open("/t.bin", RW_CREATE).unwrap();
    vol.write(&mut fh, &pattern(20_000, 8)).unwrap();
    assert_eq!(vol.free_clusters().unwrap(), before - 20_000u64.div_ceil(cb) as u32);

    vol.seek(&mut fh, 5000).unwrap();
    vol.truncate(&mut fh).unwrap();
    vol.close(fh).unwrap();
    assert_eq!(vol.free_clusters().unwrap(), before - 5000u64.div_ceil(cb) as u32);

    let mut vol = recycle(vol);
    assert_eq!(vol.free_clusters().unwrap(), before - 5000u64.div_ceil(cb) as u32);
}

#[test]
fn dot_segments_are_rejected() {
    let mut vol = superfloppy(FormatKind::ExFat, 0x0001_0000);
    vol.create_dir("/a").unwrap();
    assert!(matches!(vol.stat("/a/../a"), Err(Error::InvalidName)));
}

#[test]
fn label_entry_round_trips() {
    let mut vol = superfloppy(FormatKind::ExFat, 0x0001_0000);
    assert_eq!(vol.label().unwrap().as_str(), "");
    vol.set_label("Datenträger").unwrap();
    assert_eq!(vol.label().unwrap().as_str(), "Datenträger");
    let mut vol = recycle(vol);
    assert_eq!(vol.label().unwrap().as_str(), "Datenträger");
    vol.set_label("").unwrap();
    assert_eq!(vol.label().unwrap().as_str(), "");
}
