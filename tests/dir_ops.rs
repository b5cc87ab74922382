//! Directory creation, enumeration, renaming, attributes, and labels.

mod common;

use common::superfloppy;
use fatcore::{Attributes, Error, FormatKind, OpenMode};

const RW_CREATE: OpenMode = OpenMode::READ.union(OpenMode::WRITE).union(OpenMode::CREATE_ALWAYS);

fn touch(vol: &mut fatcore::Volume<common::RamDisk>, path: &str, body: &[u8]) {
    let mut fh = vol.open(path, RW_CREATE).unwrap();
    vol.write(&mut fh, body).unwrap();
    vol.close(fh).unwrap();
}

fn list(vol: &mut fatcore::Volume<common::RamDisk>, path: &str) -> Vec<String> {
    let mut dh = vol.open_dir(path).unwrap();
    let mut names = Vec::new();
    while let Some(info) = vol.read_dir(&mut dh).unwrap() {
        names.push(info.name().to_string());
    }
    vol.close_dir(dh).unwrap();
    names
}

#[test]
fn nested_directories() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    vol.create_dir("/a").unwrap();
    vol.create_dir("/a/b").unwrap();
    touch(&mut vol, "/a/b/f.txt", b"deep");

    assert!(vol.stat("/a").unwrap().is_dir());
    assert!(vol.stat("/a/b").unwrap().is_dir());
    assert_eq!(vol.stat("/a/b/f.txt").unwrap().size, 4);
    assert_eq!(list(&mut vol, "/a"), ["b"]);
    assert_eq!(list(&mut vol, "/a/b"), ["f.txt"]);

    assert!(matches!(vol.create_dir("/a"), Err(Error::Exist)));
    assert!(matches!(vol.create_dir("/missing/x"), Err(Error::NoPath)));
}

#[test]
fn long_names_keep_their_case() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    touch(&mut vol, "/MixedCase File.txt", b"x");
    let info = vol.stat("/MixedCase File.txt").unwrap();
    assert_eq!(info.name(), "MixedCase File.txt");
    // Lookup folds case.
    assert_eq!(vol.stat("/mixedcase file.TXT").unwrap().size, 1);
}

#[test]
fn lossy_names_get_numbered_short_names() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    touch(&mut vol, "/a-very-long-name.txt", b"1");
    touch(&mut vol, "/a-very-long-also.txt", b"2");

    let one = vol.stat("/a-very-long-name.txt").unwrap();
    let two = vol.stat("/a-very-long-also.txt").unwrap();
    assert_eq!(one.short_name(), "AVERYL~1.TXT");
    assert_eq!(two.short_name(), "AVERYL~2.TXT");
    // The short alias resolves to the same file.
    assert_eq!(vol.stat("/AVERYL~1.TXT").unwrap().name(), "a-very-long-name.txt");
}

#[test]
fn rename_moves_a_subtree() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    vol.create_dir("/a").unwrap();
    vol.create_dir("/a/b").unwrap();
    touch(&mut vol, "/a/b/f.txt", b"payload");

    vol.rename("/a/b", "/a/d").unwrap();
    assert!(matches!(vol.stat("/a/b"), Err(Error::NoFile)));
    assert_eq!(vol.stat("/a/d/f.txt").unwrap().size, 7);
    assert_eq!(list(&mut vol, "/a"), ["d"]);
}

#[test]
fn rename_across_directories() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    vol.create_dir("/src").unwrap();
    vol.create_dir("/dst").unwrap();
    touch(&mut vol, "/src/f.bin", &common::pattern(5000, 2));

    vol.rename("/src/f.bin", "/dst/renamed.bin").unwrap();
    assert!(list(&mut vol, "/src").is_empty());
    let info = vol.stat("/dst/renamed.bin").unwrap();
    assert_eq!(info.size, 5000);

    let mut fh = vol.open("/dst/renamed.bin", OpenMode::READ).unwrap();
    let mut buf = vec![0u8; 5000];
    assert_eq!(vol.read(&mut fh, &mut buf).unwrap(), 5000);
    assert_eq!(buf, common::pattern(5000, 2));
    vol.close(fh).unwrap();
}

#[test]
fn rename_onto_existing_fails() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    touch(&mut vol, "/a.txt", b"a");
    touch(&mut vol, "/b.txt", b"b");
    assert!(matches!(vol.rename("/a.txt", "/b.txt"), Err(Error::Exist)));
}

#[test]
fn remove_rules() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    vol.create_dir("/d").unwrap();
    touch(&mut vol, "/d/f.txt", b"x");

    assert!(matches!(vol.remove("/d"), Err(Error::Denied)));
    vol.remove("/d/f.txt").unwrap();
    vol.remove("/d").unwrap();
    assert!(matches!(vol.stat("/d"), Err(Error::NoFile)));
    assert!(matches!(vol.remove("/d"), Err(Error::NoFile)));
}

#[test]
fn removing_a_file_frees_its_clusters() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    let before = vol.free_clusters().unwrap();
    touch(&mut vol, "/big.bin", &common::pattern(50_000, 4));
    assert!(vol.free_clusters().unwrap() < before);
    vol.remove("/big.bin").unwrap();
    assert_eq!(vol.free_clusters().unwrap(), before);
}

#[test]
fn read_only_attribute_blocks_mutation() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    touch(&mut vol, "/locked.txt", b"x");
    vol.set_attributes("/locked.txt", Attributes::READ_ONLY, Attributes::READ_ONLY)
        .unwrap();
    assert!(vol.stat("/locked.txt").unwrap().attr.contains(Attributes::READ_ONLY));

    assert!(matches!(
        vol.open("/locked.txt", OpenMode::READ | OpenMode::WRITE),
        Err(Error::Denied)
    ));
    assert!(matches!(vol.remove("/locked.txt"), Err(Error::Denied)));

    vol.set_attributes("/locked.txt", Attributes::empty(), Attributes::READ_ONLY)
        .unwrap();
    vol.remove("/locked.txt").unwrap();
}

#[test]
fn read_only_attribute_blocks_create_always_truncation() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    touch(&mut vol, "/locked.txt", b"hello, locked");
    vol.set_attributes("/locked.txt", Attributes::READ_ONLY, Attributes::READ_ONLY)
        .unwrap();

    // Truncating dispositions are writes even without the WRITE flag.
    assert!(matches!(
        vol.open("/locked.txt", OpenMode::READ | OpenMode::CREATE_ALWAYS),
        Err(Error::Denied)
    ));
    assert_eq!(vol.stat("/locked.txt").unwrap().size, 13);

    // Plain reads are still fine.
    let mut fh = vol.open("/locked.txt", OpenMode::READ).unwrap();
    let mut buf = [0u8; 13];
    assert_eq!(vol.read(&mut fh, &mut buf).unwrap(), 13);
    assert_eq!(&buf, b"hello, locked");
    vol.close(fh).unwrap();
}

#[test]
fn timestamps_stick() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    touch(&mut vol, "/t.txt", b"x");
    let ts = fatcore::Timestamp { year: 2001, month: 2, day: 3, hour: 4, min: 5, sec: 6 };
    vol.set_timestamp("/t.txt", ts).unwrap();
    assert_eq!(vol.stat("/t.txt").unwrap().modified, ts);
}

#[test]
fn volume_label_round_trip() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    assert_eq!(vol.label().unwrap().as_str(), "");
    vol.set_label("MYDISK").unwrap();
    assert_eq!(vol.label().unwrap().as_str(), "MYDISK");
    // The label never shows up as a directory entry.
    assert!(list(&mut vol, "/").is_empty());
    vol.set_label("").unwrap();
    assert_eq!(vol.label().unwrap().as_str(), "");
}

#[test]
fn dot_segments_resolve_in_paths() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    vol.create_dir("/a").unwrap();
    touch(&mut vol, "/a/f.txt", b"x");
    assert_eq!(vol.stat("/a/./f.txt").unwrap().size, 1);
    assert_eq!(vol.stat("/a/../a/f.txt").unwrap().size, 1);
}

#[test]
fn illegal_names_are_rejected() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    for bad in ["/a:b.txt", "/que?.txt", "/pipe|.txt", "/star*.txt"] {
        assert!(matches!(vol.open(bad, RW_CREATE), Err(Error::InvalidName)), "{bad}");
    }
}
