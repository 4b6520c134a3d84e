//! End-to-end scenarios: format, reopen, growth through all three map
//! tiers, deletion, and the durability contract across shutdown.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blockfs::{Error, FileDisk, FileSys, MemDisk, SectorDevice};

const DISK_SECTORS: u32 = 4096;

fn fresh_fs() -> (Arc<MemDisk>, FileSys) {
    let _ = env_logger::builder().is_test(true).try_init();
    let disk = Arc::new(MemDisk::new(DISK_SECTORS));
    let fs = FileSys::init(disk.clone() as Arc<dyn SectorDevice>, true);
    (disk, fs)
}

#[test]
fn format_write_shutdown_reopen() {
    let (disk, fs) = fresh_fs();
    fs.create("/a", 0).unwrap();
    {
        let h = fs.open("/a").unwrap();
        assert_eq!(h.write_at(b"hello", 0), 5);
        h.close();
    }
    fs.done();

    let fs = FileSys::init(disk as Arc<dyn SectorDevice>, false);
    let h = fs.open("/a").unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(h.read_at(&mut buf, 0), 5);
    assert_eq!(&buf, b"hello");
    assert_eq!(h.length(), 5);
    h.close();
    fs.done();
}

#[test]
fn persistence_on_a_disk_image() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("fs.img");

    {
        let disk = Arc::new(FileDisk::create(&image, 1024).unwrap());
        let fs = FileSys::init(disk as Arc<dyn SectorDevice>, true);
        fs.mkdir("/boot").unwrap();
        fs.create("/boot/kernel", 0).unwrap();
        let h = fs.open("/boot/kernel").unwrap();
        h.write_at(&[0x7f; 2000], 0);
        h.close();
        fs.done();
    }

    let disk = Arc::new(FileDisk::open(&image).unwrap());
    let fs = FileSys::init(disk as Arc<dyn SectorDevice>, false);
    let h = fs.open("/boot/kernel").unwrap();
    assert_eq!(h.length(), 2000);
    let mut buf = vec![0u8; 2000];
    assert_eq!(h.read_at(&mut buf, 0), 2000);
    assert!(buf.iter().all(|&b| b == 0x7f));
    h.close();
    fs.done();
}

#[test]
fn cross_sector_write_allocates_two_data_sectors() {
    let (_disk, fs) = fresh_fs();
    fs.create("/b", 0).unwrap();
    let h = fs.open("/b").unwrap();

    let base = fs.used_sectors();
    assert_eq!(h.write_at(&[0u8; 700], 0), 700);
    assert_eq!(h.length(), 700);
    // Two data sectors, no index sectors.
    assert_eq!(fs.used_sectors(), base + 2);
    h.close();
    fs.done();
}

#[test]
fn indirect_growth_and_sparse_zeroes() {
    let (_disk, fs) = fresh_fs();
    fs.create("/c", 0).unwrap();
    let h = fs.open("/c").unwrap();

    let base = fs.used_sectors();
    assert_eq!(h.write_at(b"x", 5 * 512), 1);
    assert_eq!(h.length(), 5 * 512 + 1);
    // One index sector plus one data sector; the hole costs nothing.
    assert_eq!(fs.used_sectors(), base + 2);

    let mut buf = [0xffu8; 1];
    assert_eq!(h.read_at(&mut buf, 0), 1);
    assert_eq!(buf[0], 0);
    h.close();
    fs.done();
}

#[test]
fn doubly_indirect_growth() {
    let _ = env_logger::builder().is_test(true).try_init();
    let disk = Arc::new(MemDisk::new(32768));
    let fs = FileSys::init(disk as Arc<dyn SectorDevice>, true);
    fs.create("/d", 0).unwrap();
    let h = fs.open("/d").unwrap();

    let base = fs.used_sectors();
    assert_eq!(h.write_at(b"y", (5 + 2 * 128) * 512), 1);
    // Doubly-indirect root, one first-level index sector, one data sector.
    assert_eq!(fs.used_sectors(), base + 3);
    h.close();
    fs.done();
}

#[test]
fn sparse_growth_reads_back_zero_filled() {
    let (_disk, fs) = fresh_fs();
    fs.create("/s", 0).unwrap();
    let h = fs.open("/s").unwrap();

    assert_eq!(h.write_at(b"end", 100_000), 3);
    assert_eq!(h.length(), 100_003);

    let mut buf = [0xaau8; 64];
    assert_eq!(h.read_at(&mut buf, 50_000), 64);
    assert!(buf.iter().all(|&b| b == 0));

    // Straddle the zero gap and the written tail.
    let mut buf = [0xaau8; 5];
    assert_eq!(h.read_at(&mut buf, 99_998), 5);
    assert_eq!(&buf, b"\0\0end");
    h.close();
    fs.done();
}

#[test]
fn remove_while_open_defers_reclaim() {
    let (_disk, fs) = fresh_fs();
    let base = fs.used_sectors();

    fs.create("/a", 0).unwrap();
    let h = fs.open("/a").unwrap();
    h.write_at(b"hello", 0);

    fs.remove("/a").unwrap();
    // Gone from the namespace, data still alive through the open handle.
    assert_eq!(fs.open("/a").unwrap_err(), Error::NotFound);
    let mut buf = [0u8; 5];
    assert_eq!(h.read_at(&mut buf, 0), 5);
    assert_eq!(&buf, b"hello");

    // Last close releases the sectors and the inumber.
    h.close();
    assert_eq!(fs.used_sectors(), base);
    fs.done();
}

#[test]
fn reopen_identity_releases_once() {
    let (_disk, fs) = fresh_fs();
    let base = fs.used_sectors();

    fs.create("/two", 0).unwrap();
    let h1 = fs.open("/two").unwrap();
    let h2 = fs.open("/two").unwrap();
    assert_eq!(h1.inumber(), h2.inumber());

    h1.write_at(b"shared", 0);
    let mut buf = [0u8; 6];
    assert_eq!(h2.read_at(&mut buf, 0), 6);
    assert_eq!(&buf, b"shared");

    fs.remove("/two").unwrap();
    h1.close();
    // Still open through h2.
    assert!(fs.used_sectors() > base);
    h2.close();
    assert_eq!(fs.used_sectors(), base);
    fs.done();
}

#[test]
fn concurrent_growth_converges_on_one_mapping() {
    let (_disk, fs) = fresh_fs();
    fs.create("/g", 0).unwrap();
    let h = Arc::new(fs.open("/g").unwrap());
    let base = fs.used_sectors();

    let mut workers = Vec::new();
    for _ in 0..2 {
        let h = Arc::clone(&h);
        workers.push(thread::spawn(move || {
            assert_eq!(h.write_at(b"Z", 4096), 1);
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    // Byte 4096 sits in the single-indirect tier: exactly one index sector
    // and one data sector exist afterwards, however the writers interleave.
    assert_eq!(fs.used_sectors(), base + 2);
    let mut buf = [0u8; 1];
    assert_eq!(h.read_at(&mut buf, 4096), 1);
    assert_eq!(&buf, b"Z");

    drop(h);
    fs.done();
}

#[test]
fn deny_write_excludes_all_handles() {
    let (_disk, fs) = fresh_fs();
    fs.create("/x", 0).unwrap();
    let h1 = fs.open("/x").unwrap();
    let h2 = fs.open("/x").unwrap();

    h1.write_at(b"keep", 0);
    h1.deny_write();
    // Idempotent per handle.
    h1.deny_write();

    assert_eq!(h1.write_at(b"drop", 0), 0);
    assert_eq!(h2.write_at(b"drop", 0), 0);
    assert_eq!(h1.length(), 4);

    h1.allow_write();
    assert_eq!(h2.write_at(b"over", 0), 4);

    let mut buf = [0u8; 4];
    h2.read_at(&mut buf, 0);
    assert_eq!(&buf, b"over");
    h1.close();
    h2.close();
    fs.done();
}

#[test]
fn flush_writes_each_dirty_sector_once() {
    let (disk, fs) = fresh_fs();
    fs.create("/f", 0).unwrap();
    let h = fs.open("/f").unwrap();
    h.write_at(&[3u8; 1024], 0);

    fs.flush();
    let writes = disk.write_count();
    // Nothing became dirty since; a second pass writes nothing.
    fs.flush();
    assert_eq!(disk.write_count(), writes);

    // Touch one sector and only a handful of writes follow (the data
    // sector and the inode table sector), not a full rewrite.
    h.write_at(&[4u8; 10], 0);
    fs.flush();
    assert!(disk.write_count() > writes);
    assert!(disk.write_count() <= writes + 2);
    h.close();
    fs.done();
}

#[test]
fn read_ahead_warms_the_next_sector() {
    let (disk, fs) = fresh_fs();
    fs.create("/r", 0).unwrap();
    {
        let h = fs.open("/r").unwrap();
        h.write_at(&[9u8; 3 * 512], 0);
        h.close();
    }
    fs.done();

    // Cold cache.
    let fs = FileSys::init(disk.clone() as Arc<dyn SectorDevice>, false);
    let h = fs.open("/r").unwrap();
    let mut buf = [0u8; 512];
    assert_eq!(h.read_at(&mut buf, 0), 512);

    // Give the prefetch worker a moment to pull in the next sector, then
    // check that reading it costs no further device read.
    thread::sleep(Duration::from_millis(50));
    let mut settled = disk.read_count();
    for _ in 0..100 {
        thread::sleep(Duration::from_millis(10));
        let now = disk.read_count();
        if now == settled {
            break;
        }
        settled = now;
    }
    assert_eq!(h.read_at(&mut buf, 512), 512);
    assert_eq!(disk.read_count(), settled, "second sector was not prefetched");
    assert!(buf.iter().all(|&b| b == 9));
    h.close();
    fs.done();
}

#[test]
fn directories_nest_and_list() {
    let (_disk, fs) = fresh_fs();
    fs.mkdir("/usr").unwrap();
    fs.mkdir("/usr/lib").unwrap();
    fs.create("/usr/lib/libc", 0).unwrap();
    fs.create("/usr/init", 0).unwrap();

    assert_eq!(fs.mkdir("/usr").unwrap_err(), Error::Exists);
    assert_eq!(fs.create("/usr/lib", 0).unwrap_err(), Error::Exists);
    assert_eq!(fs.open("/usr/nope").unwrap_err(), Error::NotFound);
    assert_eq!(fs.open("/usr/init/x").unwrap_err(), Error::NotDir);

    let d = fs.open("/usr").unwrap();
    assert!(d.is_dir());
    let mut names = Vec::new();
    while let Some(name) = d.readdir() {
        names.push(name.to_string());
    }
    names.sort();
    assert_eq!(names, vec!["init", "lib"]);
    d.close();

    // A populated directory refuses removal until emptied.
    assert_eq!(fs.remove("/usr/lib").unwrap_err(), Error::NotEmpty);
    fs.remove("/usr/lib/libc").unwrap();
    fs.remove("/usr/lib").unwrap();
    fs.done();
}

#[test]
fn chdir_scopes_relative_paths_per_thread() {
    let (_disk, fs) = fresh_fs();
    let fs = Arc::new(fs);
    fs.mkdir("/deep").unwrap();
    fs.chdir("/deep").unwrap();
    fs.create("here", 0).unwrap();
    assert!(fs.open("/deep/here").is_ok());

    // Another thread still resolves from the root.
    let other = Arc::clone(&fs);
    thread::spawn(move || {
        assert_eq!(other.open("here").unwrap_err(), Error::NotFound);
        other.create("top", 0).unwrap();
    })
    .join()
    .unwrap();
    assert!(fs.open("/top").is_ok());

    // ".." entries walk upward.
    fs.create("../sibling", 0).unwrap();
    assert!(fs.open("/sibling").is_ok());

    Arc::try_unwrap(fs).ok().expect("fs still shared").done();
}

#[test]
fn trailing_slash_basename_is_rejected() {
    let (_disk, fs) = fresh_fs();
    assert_eq!(fs.create("/a/", 0).unwrap_err(), Error::BadName);
    assert_eq!(fs.mkdir("/a/b/").unwrap_err(), Error::BadName);
    // The pure root path is the one legal "empty" basename.
    let root = fs.open("/").unwrap();
    assert!(root.is_dir());
    assert_eq!(root.inumber(), 0);
    root.close();
    fs.done();
}

#[test]
fn random_io_matches_shadow_model() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let (_disk, fs) = fresh_fs();
    let fs = Arc::new(fs);

    let mut workers = Vec::new();
    for t in 0..4u64 {
        let fs = Arc::clone(&fs);
        workers.push(thread::spawn(move || {
            let path = format!("/t{}", t);
            fs.create(&path, 0).unwrap();
            let h = fs.open(&path).unwrap();
            let mut rng = StdRng::seed_from_u64(t);
            let mut shadow = vec![0u8; 100_000];

            for _ in 0..50 {
                let ofs = rng.gen_range(0..90_000usize);
                let len = rng.gen_range(1..=2048usize);
                let byte = rng.gen::<u8>();
                assert_eq!(h.write_at(&vec![byte; len], ofs as u32), len);
                for b in &mut shadow[ofs..ofs + len] {
                    *b = byte;
                }
            }

            let len = h.length() as usize;
            let mut data = vec![0u8; len];
            assert_eq!(h.read_at(&mut data, 0), len);
            assert_eq!(&data[..], &shadow[..len]);
            h.close();
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    Arc::try_unwrap(fs).ok().expect("fs still shared").done();
}
