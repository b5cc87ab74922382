//! File create/read/write/seek/truncate behavior on classic FAT.

mod common;

use common::{pattern, recycle, superfloppy};
use fatcore::{Error, FormatKind, FormatOptions, OpenMode};

const RW_CREATE: OpenMode = OpenMode::READ.union(OpenMode::WRITE).union(OpenMode::CREATE_ALWAYS);

#[test]
fn hello_round_trip() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    let mut fh = vol.open("/hello.txt", RW_CREATE).unwrap();
    assert_eq!(vol.write(&mut fh, b"hello world").unwrap(), 11);
    vol.close(fh).unwrap();

    let mut fh = vol.open("/hello.txt", OpenMode::READ).unwrap();
    assert_eq!(fh.size(), 11);
    let mut buf = [0u8; 32];
    assert_eq!(vol.read(&mut fh, &mut buf).unwrap(), 11);
    assert_eq!(&buf[..11], b"hello world");
    assert!(fh.eof());
    assert_eq!(vol.read(&mut fh, &mut buf).unwrap(), 0);
    vol.close(fh).unwrap();

    let info = vol.stat("/hello.txt").unwrap();
    assert_eq!(info.size, 11);
    assert!(!info.is_dir());
}

#[test]
fn contents_survive_remount() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    let body = pattern(100_000, 3);
    let mut fh = vol.open("/big.bin", RW_CREATE).unwrap();
    assert_eq!(vol.write(&mut fh, &body).unwrap(), body.len());
    vol.close(fh).unwrap();

    let mut vol = recycle(vol);
    let mut fh = vol.open("/big.bin", OpenMode::READ).unwrap();
    // Odd-sized chunks walk both the buffered and the whole-sector paths.
    let mut got = Vec::new();
    let mut chunk = [0u8; 700];
    loop {
        let n = vol.read(&mut fh, &mut chunk).unwrap();
        if n == 0 {
            break;
        }
        got.extend_from_slice(&chunk[..n]);
    }
    vol.close(fh).unwrap();
    assert_eq!(got, body);
}

#[test]
fn seek_and_partial_read() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    let body = pattern(10_000, 9);
    let mut fh = vol.open("/p.bin", RW_CREATE).unwrap();
    vol.write(&mut fh, &body).unwrap();
    vol.seek(&mut fh, 4321).unwrap();
    let mut buf = [0u8; 100];
    assert_eq!(vol.read(&mut fh, &mut buf).unwrap(), 100);
    assert_eq!(&buf[..], &body[4321..4421]);
    assert_eq!(fh.tell(), 4421);
    vol.close(fh).unwrap();
}

#[test]
fn read_only_seek_clamps_to_size() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    let mut fh = vol.open("/s.bin", RW_CREATE).unwrap();
    vol.write(&mut fh, &[1, 2, 3]).unwrap();
    vol.close(fh).unwrap();

    let mut fh = vol.open("/s.bin", OpenMode::READ).unwrap();
    vol.seek(&mut fh, 1 << 20).unwrap();
    assert_eq!(fh.tell(), 3);
    vol.close(fh).unwrap();
}

#[test]
fn write_past_end_zero_fills_the_gap() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    let mut fh = vol.open("/gap.bin", RW_CREATE).unwrap();
    vol.write(&mut fh, b"head").unwrap();
    vol.seek(&mut fh, 50_000).unwrap();
    vol.write(&mut fh, b"tail").unwrap();
    assert_eq!(fh.size(), 50_004);
    vol.close(fh).unwrap();

    let mut fh = vol.open("/gap.bin", OpenMode::READ).unwrap();
    let mut all = vec![0xFFu8; 50_004];
    assert_eq!(vol.read(&mut fh, &mut all).unwrap(), 50_004);
    assert_eq!(&all[..4], b"head");
    assert!(all[4..50_000].iter().all(|&b| b == 0));
    assert_eq!(&all[50_000..], b"tail");
    vol.close(fh).unwrap();
}

#[test]
fn truncate_mid_file_releases_clusters() {
    // 4096-byte clusters; truncating a 20000-byte file at 5000 keeps two
    // clusters and frees three.
    let opts = FormatOptions {
        kind: FormatKind::Fat,
        au_sectors: 8,
        superfloppy: true,
        ..FormatOptions::default()
    };
    let mut vol = common::fresh_volume(65536, opts);
    let before = vol.free_clusters().unwrap();

    let body = pattern(20_000, 5);
    let mut fh = vol.open("/t.bin", RW_CREATE).unwrap();
    vol.write(&mut fh, &body).unwrap();
    assert_eq!(vol.free_clusters().unwrap(), before - 5);

    vol.seek(&mut fh, 5000).unwrap();
    vol.truncate(&mut fh).unwrap();
    assert_eq!(fh.size(), 5000);
    assert_eq!(vol.free_clusters().unwrap(), before - 2);
    vol.close(fh).unwrap();

    let mut vol = recycle(vol);
    assert_eq!(vol.free_clusters().unwrap(), before - 2);
    let mut fh = vol.open("/t.bin", OpenMode::READ).unwrap();
    let mut buf = vec![0u8; 8000];
    assert_eq!(vol.read(&mut fh, &mut buf).unwrap(), 5000);
    assert_eq!(&buf[..5000], &body[..5000]);
    vol.close(fh).unwrap();
}

#[test]
fn truncate_to_zero_frees_the_chain() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    let before = vol.free_clusters().unwrap();
    let mut fh = vol.open("/z.bin", RW_CREATE).unwrap();
    vol.write(&mut fh, &pattern(30_000, 1)).unwrap();
    vol.seek(&mut fh, 0).unwrap();
    vol.truncate(&mut fh).unwrap();
    vol.close(fh).unwrap();
    assert_eq!(vol.free_clusters().unwrap(), before);
    assert_eq!(vol.stat("/z.bin").unwrap().size, 0);
}

#[test]
fn full_volume_gives_short_write() {
    let mut vol = superfloppy(FormatKind::Fat, 2880);
    let mut fh = vol.open("/fill.bin", RW_CREATE).unwrap();
    let chunk = [0x5Au8; 4096];
    let mut total = 0u64;
    loop {
        let n = vol.write(&mut fh, &chunk).unwrap();
        total += n as u64;
        if n < chunk.len() {
            break;
        }
    }
    assert_eq!(vol.free_clusters().unwrap(), 0);
    assert_eq!(fh.size(), total);
    // Still full: nothing more is accepted, but nothing is lost either.
    assert_eq!(vol.write(&mut fh, &chunk).unwrap(), 0);
    vol.close(fh).unwrap();

    let info = vol.stat("/fill.bin").unwrap();
    assert_eq!(info.size, total);

    vol.remove("/fill.bin").unwrap();
    assert!(vol.free_clusters().unwrap() > 0);
}

#[test]
fn append_mode_positions_at_end() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    let mut fh = vol.open("/log.txt", RW_CREATE).unwrap();
    vol.write(&mut fh, b"one").unwrap();
    vol.close(fh).unwrap();

    let mut fh = vol.open("/log.txt", OpenMode::WRITE | OpenMode::OPEN_APPEND).unwrap();
    assert_eq!(fh.tell(), 3);
    vol.write(&mut fh, b"two").unwrap();
    vol.close(fh).unwrap();
    assert_eq!(vol.stat("/log.txt").unwrap().size, 6);
}

#[test]
fn open_modes_enforce_their_contracts() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    assert!(matches!(vol.open("/nope.txt", OpenMode::READ), Err(Error::NoFile)));

    let fh = vol
        .open("/a.txt", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    vol.close(fh).unwrap();
    assert!(matches!(
        vol.open("/a.txt", OpenMode::WRITE | OpenMode::CREATE_NEW),
        Err(Error::Exist)
    ));

    // CREATE_ALWAYS truncates what exists.
    let mut fh = vol.open("/a.txt", RW_CREATE).unwrap();
    assert_eq!(fh.size(), 0);
    vol.write(&mut fh, b"x").unwrap();
    vol.close(fh).unwrap();

    // A read-only handle rejects writes.
    let mut fh = vol.open("/a.txt", OpenMode::READ).unwrap();
    assert!(matches!(vol.write(&mut fh, b"y"), Err(Error::Denied)));
    vol.close(fh).unwrap();

    assert!(matches!(vol.open("/a.txt", OpenMode::empty()), Err(Error::InvalidParameter)));
}

#[test]
fn stale_handle_is_rejected_after_remount() {
    let mut vol = superfloppy(FormatKind::Fat, 32768);
    let mut fh = vol.open("/x.txt", RW_CREATE).unwrap();
    vol.write(&mut fh, b"x").unwrap();
    vol.sync(&mut fh).unwrap();
    vol.remount().unwrap();
    let mut buf = [0u8; 4];
    assert!(matches!(vol.read(&mut fh, &mut buf), Err(Error::InvalidObject)));
}
