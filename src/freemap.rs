//! Free-map.
//!
//! A bitmap with one bit per device sector, recording which sectors are
//! allocated. The bitmap lives on disk immediately after the inode table
//! and is held in memory, as the same bytes, in an external cache run: the
//! cache keeps it coherent with the device through the periodic flush and
//! writes it back when the map is closed.

use std::sync::{Arc, Mutex};

use log::debug;

use crate::cache::{BufCache, ExternalRun};
use crate::param::{INODE_TABLE_SECTORS, SECTOR_SIZE};

fn test_bit(bits: &[u8], i: u32) -> bool {
    bits[i as usize / 8] & (1 << (i % 8)) != 0
}

fn set_bit(bits: &mut [u8], i: u32) {
    bits[i as usize / 8] |= 1 << (i % 8);
}

fn clear_bit(bits: &mut [u8], i: u32) {
    bits[i as usize / 8] &= !(1 << (i % 8));
}

pub struct FreeMap {
    cache: Arc<BufCache>,
    /// One bit per device sector.
    bit_cnt: u32,
    /// Sectors occupied by the bitmap itself.
    map_sectors: u32,
    map: Mutex<Option<Arc<ExternalRun>>>,
}

impl FreeMap {
    /// Computes the bitmap geometry for a device of `device_sectors`
    /// sectors. Does not touch the device; call `open` or `create` first.
    pub fn new(cache: Arc<BufCache>, device_sectors: u32) -> Arc<FreeMap> {
        let bytes = (device_sectors as usize + 7) / 8;
        let map_sectors = ((bytes + SECTOR_SIZE - 1) / SECTOR_SIZE) as u32;
        assert!(
            INODE_TABLE_SECTORS + map_sectors < device_sectors,
            "device too small for inode table and free map"
        );
        Arc::new(FreeMap {
            cache,
            bit_cnt: device_sectors,
            map_sectors,
            map: Mutex::new(None),
        })
    }

    /// First sector of the on-disk bitmap.
    pub fn start(&self) -> u32 {
        INODE_TABLE_SECTORS
    }

    /// Number of sectors the bitmap occupies.
    pub fn sectors(&self) -> u32 {
        self.map_sectors
    }

    /// Reads the bitmap from the device.
    pub fn open(&self) {
        let mut map = self.map.lock().unwrap();
        assert!(map.is_none(), "free map already open");
        *map = Some(self.cache.read_external(self.start(), self.map_sectors as usize));
    }

    /// Format path: builds a fresh bitmap with only the reserved prefix
    /// (inode table plus the bitmap itself) marked used, then flags it
    /// dirty so the marks reach the device.
    pub fn create(&self) {
        let mut map = self.map.lock().unwrap();
        assert!(map.is_none(), "free map already open");
        let run = self.cache.read_external(self.start(), self.map_sectors as usize);
        run.with_data(|bits| {
            for byte in bits.iter_mut() {
                *byte = 0;
            }
            for i in 0..INODE_TABLE_SECTORS + self.map_sectors {
                set_bit(bits, i);
            }
        });
        self.cache.dirty_external(self.start());
        *map = Some(run);
        debug!(
            "free map created: {} sectors reserved",
            INODE_TABLE_SECTORS + self.map_sectors
        );
    }

    /// Writes the bitmap back and releases it.
    pub fn close(&self) {
        let mut map = self.map.lock().unwrap();
        if map.take().is_some() {
            self.cache.free_external(self.start());
        }
    }

    /// Allocates `cnt` consecutive sectors, returning the first. `None`
    /// means no run of `cnt` free sectors exists: the file system is out of
    /// space.
    pub fn allocate(&self, cnt: u32) -> Option<u32> {
        let map = self.map.lock().unwrap();
        let run = map.as_ref().expect("free map not open");
        let first = run.with_data(|bits| {
            let mut i = 0;
            'scan: while i + cnt <= self.bit_cnt {
                for j in 0..cnt {
                    if test_bit(bits, i + j) {
                        i += j + 1;
                        continue 'scan;
                    }
                }
                for j in 0..cnt {
                    set_bit(bits, i + j);
                }
                return Some(i);
            }
            None
        });
        if first.is_some() {
            self.cache.dirty_external(self.start());
        }
        first
    }

    /// Makes `cnt` sectors starting at `sector` available again. All of
    /// them must currently be allocated.
    pub fn release(&self, sector: u32, cnt: u32) {
        let map = self.map.lock().unwrap();
        let run = map.as_ref().expect("free map not open");
        run.with_data(|bits| {
            for i in sector..sector + cnt {
                assert!(test_bit(bits, i), "release: sector {} already free", i);
                clear_bit(bits, i);
            }
        });
        self.cache.dirty_external(self.start());
    }

    /// Number of allocated sectors, reserved prefix included.
    pub fn used(&self) -> u32 {
        let map = self.map.lock().unwrap();
        let run = map.as_ref().expect("free map not open");
        run.with_data(|bits| (0..self.bit_cnt).filter(|&i| test_bit(bits, i)).count() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemDisk, SectorDevice};

    fn setup(sectors: u32) -> (Arc<MemDisk>, Arc<BufCache>, Arc<FreeMap>) {
        let disk = Arc::new(MemDisk::new(sectors));
        let cache = BufCache::new(disk.clone() as Arc<dyn SectorDevice>);
        let map = FreeMap::new(Arc::clone(&cache), sectors);
        (disk, cache, map)
    }

    #[test]
    fn create_reserves_prefix() {
        let (_disk, _cache, map) = setup(1024);
        map.create();
        assert_eq!(map.used(), INODE_TABLE_SECTORS + map.sectors());
        // The first allocation lands right after the reserved prefix.
        assert_eq!(map.allocate(1), Some(INODE_TABLE_SECTORS + map.sectors()));
    }

    #[test]
    fn allocate_release_round_trip() {
        let (_disk, _cache, map) = setup(1024);
        map.create();
        let base = map.used();
        let a = map.allocate(3).unwrap();
        let b = map.allocate(1).unwrap();
        assert_eq!(map.used(), base + 4);
        map.release(a, 3);
        map.release(b, 1);
        assert_eq!(map.used(), base);
    }

    #[test]
    fn allocate_finds_released_hole() {
        let (_disk, _cache, map) = setup(1024);
        map.create();
        let a = map.allocate(2).unwrap();
        let _b = map.allocate(2).unwrap();
        map.release(a, 2);
        // First fit returns the hole.
        assert_eq!(map.allocate(2), Some(a));
    }

    #[test]
    fn exhaustion_returns_none() {
        let (_disk, _cache, map) = setup(256);
        map.create();
        while map.allocate(1).is_some() {}
        assert_eq!(map.used(), 256);
        assert_eq!(map.allocate(1), None);
        map.release(200, 1);
        assert_eq!(map.allocate(1), Some(200));
    }

    #[test]
    fn marks_survive_close_and_open() {
        let (_disk, cache, map) = setup(1024);
        map.create();
        let a = map.allocate(5).unwrap();
        map.close();

        let map = FreeMap::new(cache, 1024);
        map.open();
        assert_eq!(map.used(), INODE_TABLE_SECTORS + map.sectors() + 5);
        map.release(a, 5);
        assert_eq!(map.used(), INODE_TABLE_SECTORS + map.sectors());
    }
}
