//! Block device interface.
//!
//! The file system treats its device as an opaque synchronous sector store:
//! everything it needs is the sector count and whole-sector read/write. All
//! device access goes through the buffer cache; nothing above the cache
//! touches a `SectorDevice` directly.
//!
//! Two implementations are provided: [`MemDisk`], a RAM-backed disk with I/O
//! counters used heavily by the tests, and [`FileDisk`], backed by an
//! ordinary host file.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::param::SECTOR_SIZE;

/// A synchronous store of fixed-size sectors.
///
/// I/O failure is fatal to the file system; implementations panic rather
/// than report errors.
pub trait SectorDevice: Send + Sync {
    /// Number of sectors on the device.
    fn sectors(&self) -> u32;

    /// Reads sector `sector` into `buf`.
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);

    /// Writes `buf` to sector `sector`.
    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]);
}

/// RAM-backed sector device.
///
/// Counts device reads and writes so tests can observe cache behavior
/// (hit rates, write-back coalescing, read-ahead).
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    sectors: u32,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDisk {
    pub fn new(sectors: u32) -> MemDisk {
        MemDisk {
            data: Mutex::new(vec![0; sectors as usize * SECTOR_SIZE]),
            sectors,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of sector reads served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of sector writes served so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl SectorDevice for MemDisk {
    fn sectors(&self) -> u32 {
        self.sectors
    }

    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        assert!(sector < self.sectors, "MemDisk::read: sector out of range");
        let data = self.data.lock().unwrap();
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        assert!(sector < self.sectors, "MemDisk::write: sector out of range");
        let mut data = self.data.lock().unwrap();
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sector device backed by a host file.
pub struct FileDisk {
    file: Mutex<File>,
    sectors: u32,
}

impl FileDisk {
    /// Creates (or truncates) a disk image of `sectors` sectors at `path`.
    pub fn create<P: AsRef<Path>>(path: P, sectors: u32) -> io::Result<FileDisk> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(sectors as u64 * SECTOR_SIZE as u64)?;
        Ok(FileDisk {
            file: Mutex::new(file),
            sectors,
        })
    }

    /// Opens an existing disk image. The image length must be a whole
    /// number of sectors.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<FileDisk> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        assert_eq!(
            len % SECTOR_SIZE as u64,
            0,
            "FileDisk::open: image is not sector-aligned"
        );
        Ok(FileDisk {
            file: Mutex::new(file),
            sectors: (len / SECTOR_SIZE as u64) as u32,
        })
    }
}

impl SectorDevice for FileDisk {
    fn sectors(&self) -> u32 {
        self.sectors
    }

    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        assert!(sector < self.sectors, "FileDisk::read: sector out of range");
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .expect("FileDisk::read: seek failed");
        file.read_exact(buf).expect("FileDisk::read: read failed");
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        assert!(sector < self.sectors, "FileDisk::write: sector out of range");
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .expect("FileDisk::write: seek failed");
        file.write_all(buf).expect("FileDisk::write: write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memdisk_round_trip() {
        let disk = MemDisk::new(8);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 0xab;
        buf[SECTOR_SIZE - 1] = 0xcd;
        disk.write(3, &buf);

        let mut out = [0u8; SECTOR_SIZE];
        disk.read(3, &mut out);
        assert_eq!(buf[..], out[..]);
        assert_eq!(disk.read_count(), 1);
        assert_eq!(disk.write_count(), 1);
    }

    #[test]
    fn filedisk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let mut buf = [0u8; SECTOR_SIZE];
        buf[7] = 42;
        {
            let disk = FileDisk::create(&path, 16).unwrap();
            disk.write(9, &buf);
        }

        let disk = FileDisk::open(&path).unwrap();
        assert_eq!(disk.sectors(), 16);
        let mut out = [0u8; SECTOR_SIZE];
        disk.read(9, &mut out);
        assert_eq!(out[7], 42);
    }
}
