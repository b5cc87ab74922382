//! Cross-checks against the `fatfs` crate: volumes formatted and written
//! by this engine must read back under an independent implementation, and
//! the other way around.

mod common;

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use common::{pattern, superfloppy, RamDisk};
use fatcore::{FormatKind, FsKind, MountOptions, OpenMode, Volume};

const RW_CREATE: OpenMode = OpenMode::READ.union(OpenMode::WRITE).union(OpenMode::CREATE_ALWAYS);

#[test]
fn fatfs_reads_our_fat16_volume() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    let mut fh = vol.open("/hello.txt", RW_CREATE).unwrap();
    vol.write(&mut fh, b"hello world").unwrap();
    vol.close(fh).unwrap();
    vol.create_dir("/sub").unwrap();
    let mut fh = vol.open("/sub/Mixed Case Name.bin", RW_CREATE).unwrap();
    vol.write(&mut fh, &pattern(33_000, 1)).unwrap();
    vol.close(fh).unwrap();
    vol.set_label("FATCORE").unwrap();

    let raw = vol.unmount().unwrap().into_vec();
    let fs = fatfs::FileSystem::new(Cursor::new(raw), fatfs::FsOptions::new()).unwrap();
    assert_eq!(fs.fat_type(), fatfs::FatType::Fat16);

    let root = fs.root_dir();
    let mut body = String::new();
    root.open_file("hello.txt").unwrap().read_to_string(&mut body).unwrap();
    assert_eq!(body, "hello world");

    let sub = root.open_dir("sub").unwrap();
    let names: Vec<String> = sub
        .iter()
        .map(|e| e.unwrap().file_name())
        .filter(|n| n != "." && n != "..")
        .collect();
    assert_eq!(names, ["Mixed Case Name.bin"]);

    let mut got = Vec::new();
    sub.open_file("Mixed Case Name.bin").unwrap().read_to_end(&mut got).unwrap();
    assert_eq!(got, pattern(33_000, 1));
}

#[test]
fn fatfs_reads_our_fat32_volume() {
    let mut vol = superfloppy(FormatKind::Fat32, 0x0002_0000);
    let body = pattern(100_000, 9);
    let mut fh = vol.open("/payload.bin", RW_CREATE).unwrap();
    vol.write(&mut fh, &body).unwrap();
    vol.close(fh).unwrap();

    let raw = vol.unmount().unwrap().into_vec();
    let fs = fatfs::FileSystem::new(Cursor::new(raw), fatfs::FsOptions::new()).unwrap();
    assert_eq!(fs.fat_type(), fatfs::FatType::Fat32);
    let mut got = Vec::new();
    fs.root_dir()
        .open_file("payload.bin")
        .unwrap()
        .read_to_end(&mut got)
        .unwrap();
    assert_eq!(got, body);
}

#[test]
fn we_read_a_fatfs_formatted_volume() {
    let mut raw = vec![0u8; 32768 * 512];
    {
        let mut cur = Cursor::new(&mut raw[..]);
        fatfs::format_volume(&mut cur, fatfs::FormatVolumeOptions::new()).unwrap();
        let fs = fatfs::FileSystem::new(Cursor::new(&mut raw[..]), fatfs::FsOptions::new()).unwrap();
        let root = fs.root_dir();
        let mut f = root.create_file("From Fatfs.txt").unwrap();
        f.write_all(b"written elsewhere").unwrap();
        root.create_dir("nested").unwrap();
        let mut f = root.create_file("nested/deep.bin").unwrap();
        f.write_all(&pattern(5000, 3)).unwrap();
    }

    let mut vol = Volume::mount(RamDisk::from_vec(raw), MountOptions::default()).unwrap();
    assert!(matches!(vol.kind(), FsKind::Fat12 | FsKind::Fat16));

    let info = vol.stat("/From Fatfs.txt").unwrap();
    assert_eq!(info.name(), "From Fatfs.txt");
    assert_eq!(info.size, 17);
    let mut fh = vol.open("/From Fatfs.txt", OpenMode::READ).unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(vol.read(&mut fh, &mut buf).unwrap(), 17);
    assert_eq!(&buf[..17], b"written elsewhere");
    vol.close(fh).unwrap();

    let mut fh = vol.open("/nested/deep.bin", OpenMode::READ).unwrap();
    let mut got = vec![0u8; 5000];
    assert_eq!(vol.read(&mut fh, &mut got).unwrap(), 5000);
    assert_eq!(got, pattern(5000, 3));
    vol.close(fh).unwrap();
}

#[test]
fn edits_made_by_fatfs_are_visible_to_us() {
    // Round trip: we format and write, fatfs edits, we read the edit.
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    let mut fh = vol.open("/shared.txt", RW_CREATE).unwrap();
    vol.write(&mut fh, b"first").unwrap();
    vol.close(fh).unwrap();
    let mut raw = vol.unmount().unwrap().into_vec();

    {
        let fs = fatfs::FileSystem::new(Cursor::new(&mut raw[..]), fatfs::FsOptions::new()).unwrap();
        let mut f = fs.root_dir().open_file("shared.txt").unwrap();
        f.seek(SeekFrom::End(0)).unwrap();
        f.write_all(b" second").unwrap();
    }

    let mut vol = Volume::mount(RamDisk::from_vec(raw), MountOptions::default()).unwrap();
    let mut fh = vol.open("/shared.txt", OpenMode::READ).unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(vol.read(&mut fh, &mut buf).unwrap(), 12);
    assert_eq!(&buf[..12], b"first second");
    vol.close(fh).unwrap();
}
