//! Option strings through to mount table entries and back.

use std::path::Path;

use nfsfuse_mount::{MountFlags, MountTable, options};

#[test]
fn test_recorded_options_reparse_to_same_flags() {
    let dir = tempfile::tempdir().unwrap();
    let table = MountTable::new(dir.path().join("mtab"));

    let parsed = options::parse("ro,nosuid,nodev,noatime,vers=3,actimeo=5").unwrap();
    table
        .record_mount(
            "server:/export",
            Path::new("/mnt/nfs"),
            "fuse.nfs",
            parsed.flags,
            &parsed.extra,
        )
        .unwrap();

    let entries = table.entries().unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.source, "server:/export");
    assert_eq!(entry.options, "ro,nosuid,nodev,noatime,vers=3,actimeo=5");

    let reparsed = options::parse(&entry.options).unwrap();
    assert_eq!(reparsed.flags, parsed.flags);
    assert_eq!(reparsed.extra, parsed.extra);
}

#[test]
fn test_mount_point_with_spaces() {
    let dir = tempfile::tempdir().unwrap();
    let table = MountTable::new(dir.path().join("mtab"));
    let mp = Path::new("/mnt/my share");

    table
        .record_mount("h:/e", mp, "fuse.nfs", MountFlags::empty(), "")
        .unwrap();
    let raw = std::fs::read_to_string(dir.path().join("mtab")).unwrap();
    assert_eq!(raw, "h:/e /mnt/my\\040share fuse.nfs rw 0 0\n");

    table.remove_mount(mp).unwrap();
    assert!(table.entries().unwrap().is_empty());
}

#[test]
fn test_concurrent_recorders_do_not_lose_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mtab");

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let table = MountTable::new(&path);
            std::thread::spawn(move || {
                let mp = format!("/mnt/{i}");
                table
                    .record_mount("h:/e", Path::new(&mp), "fuse.nfs", MountFlags::empty(), "")
                    .unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(MountTable::new(&path).entries().unwrap().len(), 8);
}
