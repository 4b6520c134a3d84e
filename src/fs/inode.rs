//! Inodes.
//!
//! An inode describes a single unnamed file: its type, byte length, and the
//! map from file blocks to device sectors. On-disk inodes live in a fixed
//! table at the front of the device, addressed by *inumber* (their linear
//! position in the table).
//!
//! The sector map is a three-tier tree held in eight slots: five direct
//! slots, two single-indirect slots naming index sectors of 128 children
//! each, and one doubly-indirect slot. A slot value of zero means "not
//! allocated"; sectors materialize on demand the first time a byte in their
//! range is touched, which is also how writes past end-of-file grow a file.
//!
//! In memory, an open inode is a reference-counted handle in a process-wide
//! open set, one handle per inumber: opening an inumber twice yields the
//! same handle. The handle does **not** cache the on-disk record. Every
//! operation that needs it re-reads it through the buffer cache, so
//! concurrent handles always observe the latest length; mutations of the
//! record happen under the handle's `data_lock`.
//!
//! Lock summary:
//! * `open_inodes_lock` guards the open set and, with each handle's
//!   `open_lock`, the open count. Closing takes both so a concurrent open
//!   cannot resurrect a handle that is tearing down.
//! * `data_lock` serializes record mutation (length growth, direct-slot
//!   allocation).
//! * Index-sector slot allocation is serialized by write-pinning the index
//!   sector itself in the cache, so two writers cannot both allocate a
//!   sector for one slot and leak one of them.
//! * `dir_lock` is a reentrant lock the directory layer wraps around
//!   multi-step entry scans.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use log::trace;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::BufCache;
use crate::freemap::FreeMap;
use crate::lock::Semaphore;
use crate::param::{INODE_TABLE_SECTORS, PRI_INODE, PRI_META, PRI_NORMAL, SECTOR_SIZE};
use crate::{Error, Result};

/// First single-indirect slot in the on-disk array.
const SID_INDEX: usize = 5;
/// The doubly-indirect slot.
const DID_INDEX: usize = 7;
const MAX_INDEX: usize = 8;

/// Number of sector indices held by one index sector.
const PTRS_PER_SECTOR: u32 = (SECTOR_SIZE / mem::size_of::<u32>()) as u32;

/// File block indices below these limits fall in the direct,
/// single-indirect, and doubly-indirect tiers respectively.
const DIRECT_LIMIT: u32 = SID_INDEX as u32;
const SID_LIMIT: u32 = DIRECT_LIMIT + (DID_INDEX - SID_INDEX) as u32 * PTRS_PER_SECTOR;
const DID_LIMIT: u32 = SID_LIMIT + (MAX_INDEX - DID_INDEX) as u32 * PTRS_PER_SECTOR * PTRS_PER_SECTOR;

/// Largest representable file.
pub const MAX_FILE_SIZE: u32 = DID_LIMIT * SECTOR_SIZE as u32;

const INODES_PER_SECTOR: u32 = (SECTOR_SIZE / mem::size_of::<DiskInode>()) as u32;

/// Size of the inode table in inumbers.
pub const MAX_INODES: u32 = INODES_PER_SECTOR * INODE_TABLE_SECTORS;

/// On-disk inode. Records must not straddle a sector boundary.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub(crate) struct DiskInode {
    is_dir: u8,
    _pad0: [u8; 3],
    /// Distinguishes a free table slot from an allocated one.
    in_use: u8,
    _pad1: [u8; 3],
    /// File size in bytes.
    length: i32,
    /// Direct, single-indirect, and doubly-indirect sector slots.
    arr: [u32; MAX_INDEX],
}

const_assert!(mem::size_of::<DiskInode>() == 44);
const_assert!(mem::size_of::<DiskInode>() <= SECTOR_SIZE);

fn record_sector(inumber: u32) -> u32 {
    inumber / INODES_PER_SECTOR
}

fn record_ofs(inumber: u32) -> usize {
    (inumber % INODES_PER_SECTOR) as usize * mem::size_of::<DiskInode>()
}

fn read_record(cache: &BufCache, inumber: u32) -> DiskInode {
    let sector = record_sector(inumber);
    assert!(sector < INODE_TABLE_SECTORS, "inumber out of table");
    let mut rec = DiskInode::default();
    cache.read(sector, rec.as_bytes_mut(), record_ofs(inumber), PRI_INODE);
    rec
}

fn write_record(cache: &BufCache, inumber: u32, rec: &DiskInode) {
    let sector = record_sector(inumber);
    assert!(sector < INODE_TABLE_SECTORS, "inumber out of table");
    cache.write(sector, rec.as_bytes(), record_ofs(inumber), PRI_INODE);
}

/// The process-wide inode table: the open set plus inumber allocation.
pub struct Itable {
    cache: Arc<BufCache>,
    freemap: Arc<FreeMap>,
    open_inodes: Mutex<Vec<Arc<Inode>>>,
    inumber_lock: Mutex<()>,
}

impl Itable {
    pub fn new(cache: Arc<BufCache>, freemap: Arc<FreeMap>) -> Arc<Itable> {
        Arc::new(Itable {
            cache,
            freemap,
            open_inodes: Mutex::new(Vec::new()),
            inumber_lock: Mutex::new(()),
        })
    }

    /// Claims the first free inumber, marking its table slot in use.
    pub fn assign_inumber(&self) -> Result<u32> {
        // Inumber 0 is the root directory and is never assigned.
        for inumber in 1..MAX_INODES {
            let _guard = self.inumber_lock.lock().unwrap();
            let mut rec = read_record(&self.cache, inumber);
            if rec.in_use == 0 {
                rec.in_use = 1;
                write_record(&self.cache, inumber, &rec);
                return Ok(inumber);
            }
        }
        Err(Error::NoInodes)
    }

    /// Returns `inumber`'s table slot to the free pool.
    pub fn release_inumber(&self, inumber: u32) {
        write_record(&self.cache, inumber, &DiskInode::default());
    }

    /// Writes a fresh on-disk inode of `length` bytes with an empty sector
    /// array. Data sectors materialize on first touch.
    pub fn create(&self, inumber: u32, length: u32, is_dir: bool) {
        let rec = DiskInode {
            is_dir: is_dir as u8,
            in_use: 1,
            length: length as i32,
            ..DiskInode::default()
        };
        write_record(&self.cache, inumber, &rec);
    }

    /// Lays out a file of `length` bytes whose data *and* index sectors are
    /// numbered consecutively from `start_sector`, each index sector
    /// immediately preceding its children. Returns the number of sectors
    /// used. The caller owns the sectors (nothing is reserved in the
    /// free-map here) and fills the data sectors itself.
    pub fn create_seq(&self, inumber: u32, length: u32, start_sector: u32) -> Result<u32> {
        let data_cnt = (length + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32;
        if data_cnt > DID_LIMIT {
            return Err(Error::TooLarge);
        }
        let mut rec = DiskInode {
            in_use: 1,
            length: length as i32,
            ..DiskInode::default()
        };
        let mut next = start_sector;
        let mut block = 0;

        while block < data_cnt && block < DIRECT_LIMIT {
            rec.arr[block as usize] = next;
            next += 1;
            block += 1;
        }
        for slot in SID_INDEX..MAX_INDEX {
            if block >= data_cnt {
                break;
            }
            rec.arr[slot] = next;
            if slot < DID_INDEX {
                next = self.layout_index(next, &mut block, data_cnt);
            } else {
                // Doubly-indirect: a sector of index-sector numbers.
                let did = next;
                next += 1;
                self.cache.add(did, PRI_META);
                let mut entries = [0u8; SECTOR_SIZE];
                let mut n = 0;
                while block < data_cnt {
                    entries[n * 4..n * 4 + 4].copy_from_slice(&next.to_le_bytes());
                    n += 1;
                    next = self.layout_index(next, &mut block, data_cnt);
                }
                self.cache.write(did, &entries, 0, PRI_META);
            }
        }

        write_record(&self.cache, inumber, &rec);
        Ok(next - start_sector)
    }

    /// Writes one index sector at `index_sector` whose children are the
    /// consecutive sectors that follow it, and advances `block` past them.
    fn layout_index(&self, index_sector: u32, block: &mut u32, data_cnt: u32) -> u32 {
        let mut next = index_sector + 1;
        self.cache.add(index_sector, PRI_META);
        let mut entries = [0u8; SECTOR_SIZE];
        let mut n = 0;
        while *block < data_cnt && n < PTRS_PER_SECTOR as usize {
            entries[n * 4..n * 4 + 4].copy_from_slice(&next.to_le_bytes());
            next += 1;
            *block += 1;
            n += 1;
        }
        self.cache.write(index_sector, &entries, 0, PRI_META);
        next
    }

    /// Opens `inumber`, returning the existing handle if one is open.
    pub fn open(self: &Arc<Itable>, inumber: u32) -> Arc<Inode> {
        let mut open_inodes = self.open_inodes.lock().unwrap();
        if let Some(inode) = open_inodes.iter().find(|inode| inode.inumber == inumber) {
            return inode.reopen();
        }
        let inode = Arc::new(Inode {
            inumber,
            itable: Arc::downgrade(self),
            cache: Arc::clone(&self.cache),
            freemap: Arc::clone(&self.freemap),
            open_cnt: Mutex::new(1),
            removed: AtomicBool::new(false),
            deny_write_cnt: Mutex::new(0),
            data_lock: Mutex::new(()),
            dir_sem: Semaphore::new(1),
            dir_owner: spin::Mutex::new(None),
        });
        open_inodes.push(Arc::clone(&inode));
        inode
    }
}

/// An open inode handle.
pub struct Inode {
    inumber: u32,
    itable: Weak<Itable>,
    cache: Arc<BufCache>,
    freemap: Arc<FreeMap>,
    /// Number of openers; the handle leaves the open set when it reaches 0.
    open_cnt: Mutex<u32>,
    /// Deleted; sectors and inumber are released at last close.
    removed: AtomicBool,
    /// 0: writes ok, >0: `write_at` refuses in one shot.
    deny_write_cnt: Mutex<u32>,
    /// Serializes mutation of the on-disk record.
    data_lock: Mutex<()>,
    dir_sem: Semaphore,
    dir_owner: spin::Mutex<Option<ThreadId>>,
}

impl Inode {
    pub fn inumber(&self) -> u32 {
        self.inumber
    }

    /// Takes another reference to this handle.
    pub fn reopen(self: &Arc<Inode>) -> Arc<Inode> {
        let mut cnt = self.open_cnt.lock().unwrap();
        debug_assert!(*cnt > 0, "reopen of a closed handle");
        *cnt += 1;
        Arc::clone(self)
    }

    /// Drops one reference. The last close removes the handle from the open
    /// set; if the inode was removed, its sectors and inumber are released.
    pub fn close(&self) {
        let last = {
            // Hold the open-set lock across the decrement so a concurrent
            // `Itable::open` cannot revive a handle that is tearing down.
            let itable = self.itable.upgrade();
            let open_inodes = itable
                .as_ref()
                .map(|itable| itable.open_inodes.lock().unwrap());
            let mut cnt = self.open_cnt.lock().unwrap();
            assert!(*cnt > 0, "close of a closed handle");
            *cnt -= 1;
            if *cnt == 0 {
                if let Some(mut open_inodes) = open_inodes {
                    open_inodes.retain(|inode| inode.inumber != self.inumber);
                }
                true
            } else {
                false
            }
        };
        if !last {
            return;
        }
        if self.removed.load(Ordering::Relaxed) {
            trace!("inode {}: releasing on last close", self.inumber);
            self.release_sectors();
            write_record(&self.cache, self.inumber, &DiskInode::default());
        } else {
            // The sectors named directly in the record will not be needed
            // soon; make them preferred eviction victims.
            let rec = read_record(&self.cache, self.inumber);
            for &sector in rec.arr.iter() {
                if sector != 0 {
                    self.cache.close(sector);
                }
            }
        }
    }

    /// Marks the inode for deletion at the last close.
    pub fn remove(&self) {
        self.removed.store(true, Ordering::Relaxed);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Relaxed)
    }

    pub fn is_dir(&self) -> bool {
        read_record(&self.cache, self.inumber).is_dir != 0
    }

    /// Byte length of the inode's data.
    pub fn length(&self) -> u32 {
        read_record(&self.cache, self.inumber).length.max(0) as u32
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes read, short at end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> usize {
        let mut offset = offset;
        let mut bytes_read = 0;
        while bytes_read < buf.len() {
            let sector_ofs = offset as usize % SECTOR_SIZE;

            // Bytes left in the file, bytes left in the sector, lesser of
            // the two, capped by what the caller asked for.
            let inode_left = self.length().saturating_sub(offset) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - bytes_read).min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }

            let sector = match self.byte_to_sector(offset) {
                Some(sector) => sector,
                None => break,
            };
            self.cache
                .read(sector, &mut buf[bytes_read..bytes_read + chunk], sector_ofs, PRI_NORMAL);

            offset += chunk as u32;
            bytes_read += chunk;
        }

        // Read ahead: if the byte past the last one consumed is still
        // inside the file, prefetch the sector that starts there.
        let next = (offset as u64 + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64
            * SECTOR_SIZE as u64;
        if next < self.length() as u64 {
            if let Some(sector) = self.peek_sector(next as u32) {
                self.cache.fetch_async(sector);
            }
        }

        bytes_read
    }

    /// Writes `buf` starting at `offset`, growing the file as needed.
    /// Returns the number of bytes written: 0 while writes are denied,
    /// short when the device fills up or the offset passes the largest
    /// representable file.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> usize {
        if *self.deny_write_cnt.lock().unwrap() > 0 {
            return 0;
        }
        let mut offset = offset;
        let mut bytes_written = 0;
        while bytes_written < buf.len() {
            let sector_ofs = offset as usize % SECTOR_SIZE;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - bytes_written).min(sector_left);

            let sector = match self.byte_to_sector(offset) {
                Some(sector) => sector,
                None => break,
            };
            self.cache
                .write(sector, &buf[bytes_written..bytes_written + chunk], sector_ofs, PRI_NORMAL);

            // Grow the recorded length last, so a sector is never
            // reachable before it exists zero-filled in the cache.
            {
                let _guard = self.data_lock.lock().unwrap();
                let mut rec = read_record(&self.cache, self.inumber);
                let end = (offset + chunk as u32) as i32;
                if end > rec.length {
                    rec.length = end;
                    write_record(&self.cache, self.inumber, &rec);
                }
            }

            offset += chunk as u32;
            bytes_written += chunk;
        }
        bytes_written
    }

    /// Disables writes through every handle of this inode.
    /// May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut cnt = self.deny_write_cnt.lock().unwrap();
        *cnt += 1;
        assert!(*cnt <= *self.open_cnt.lock().unwrap());
    }

    /// Re-enables writes. Must be called once per `deny_write`, before the
    /// caller closes its handle.
    pub fn allow_write(&self) {
        let mut cnt = self.deny_write_cnt.lock().unwrap();
        assert!(*cnt > 0);
        *cnt -= 1;
    }

    /// Acquires the directory lock unless this thread already holds it.
    /// Returns the previous ownership state, to be handed back to
    /// `set_lock_dir`.
    pub fn lock_dir(&self) -> bool {
        let me = thread::current().id();
        if *self.dir_owner.lock() == Some(me) {
            return true;
        }
        self.dir_sem.down();
        *self.dir_owner.lock() = Some(me);
        false
    }

    /// Releases the directory lock if `prev` says this call was the
    /// outermost acquisition.
    pub fn set_lock_dir(&self, prev: bool) {
        if prev {
            return;
        }
        debug_assert_eq!(*self.dir_owner.lock(), Some(thread::current().id()));
        *self.dir_owner.lock() = None;
        self.dir_sem.up();
    }

    pub(crate) fn itable(&self) -> Arc<Itable> {
        self.itable.upgrade().expect("inode outlived its table")
    }

    /// Returns the device sector holding byte `pos`, allocating it (and any
    /// missing index sectors on the way) on demand. `None` means `pos` is
    /// beyond the largest representable file, or allocation failed for lack
    /// of space.
    fn byte_to_sector(&self, pos: u32) -> Option<u32> {
        let index = pos / SECTOR_SIZE as u32;
        if index < DIRECT_LIMIT {
            self.fixup_depth(0, 0, index, 0)
        } else if index < SID_LIMIT {
            self.fixup_depth(SID_INDEX, DIRECT_LIMIT, index, 1)
        } else if index < DID_LIMIT {
            self.fixup_depth(DID_INDEX, SID_LIMIT, index, 2)
        } else {
            None
        }
    }

    /// Resolves file block `index` through `depth` levels of indirection
    /// starting at array slot `start_slot`, allocating missing sectors at
    /// every step.
    fn fixup_depth(&self, start_slot: usize, prev_limit: u32, index: u32, depth: u32) -> Option<u32> {
        let index = index - prev_limit;

        let mut slot = index;
        for _ in 0..depth {
            slot /= PTRS_PER_SECTOR;
        }
        let mut sector = self.fixup_arr(start_slot + slot as usize, depth != 0)?;

        for level in 0..depth {
            let mut child = index;
            for _ in level + 1..depth {
                child /= PTRS_PER_SECTOR;
            }
            sector = self.fixup_disk(sector, child % PTRS_PER_SECTOR, level < depth - 1)?;
        }
        Some(sector)
    }

    /// Returns the sector in record slot `slot`, allocating one under
    /// `data_lock` if the slot is empty.
    fn fixup_arr(&self, slot: usize, meta: bool) -> Option<u32> {
        let _guard = self.data_lock.lock().unwrap();
        let mut rec = read_record(&self.cache, self.inumber);
        if rec.arr[slot] == 0 {
            let sector = self.freemap.allocate(1)?;
            let pri = if meta { PRI_META } else { PRI_NORMAL };
            self.cache.add(sector, pri);
            rec.arr[slot] = sector;
            write_record(&self.cache, self.inumber, &rec);
        }
        Some(rec.arr[slot])
    }

    /// Returns entry `child` of index sector `parent`, allocating one if the
    /// entry is empty. The parent sector stays write-pinned for the whole
    /// read-allocate-write sequence: that pin is what makes concurrent
    /// writers agree on a single sector per entry.
    fn fixup_disk(&self, parent: u32, child: u32, meta: bool) -> Option<u32> {
        self.cache.lock(parent);
        let mut bytes = [0u8; 4];
        self.cache.read(parent, &mut bytes, child as usize * 4, PRI_META);
        let mut sector = u32::from_le_bytes(bytes);
        if sector == 0 {
            sector = match self.freemap.allocate(1) {
                Some(sector) => sector,
                None => {
                    self.cache.unlock(parent);
                    return None;
                }
            };
            let pri = if meta { PRI_META } else { PRI_NORMAL };
            // The child becomes reachable only once its zero fill exists.
            self.cache.add(sector, pri);
            self.cache.write(parent, &sector.to_le_bytes(), child as usize * 4, pri);
        }
        self.cache.unlock(parent);
        Some(sector)
    }

    /// Like `byte_to_sector` but never allocates; `None` for holes. Used by
    /// the read-ahead probe.
    fn peek_sector(&self, pos: u32) -> Option<u32> {
        let index = pos / SECTOR_SIZE as u32;
        let (start_slot, prev_limit, depth) = if index < DIRECT_LIMIT {
            (0, 0, 0)
        } else if index < SID_LIMIT {
            (SID_INDEX, DIRECT_LIMIT, 1)
        } else if index < DID_LIMIT {
            (DID_INDEX, SID_LIMIT, 2)
        } else {
            return None;
        };
        let index = index - prev_limit;

        let mut slot = index;
        for _ in 0..depth {
            slot /= PTRS_PER_SECTOR;
        }
        let rec = read_record(&self.cache, self.inumber);
        let mut sector = rec.arr[start_slot + slot as usize];

        for level in 0..depth {
            if sector == 0 {
                return None;
            }
            let mut child = index;
            for _ in level + 1..depth {
                child /= PTRS_PER_SECTOR;
            }
            let mut bytes = [0u8; 4];
            self.cache
                .read(sector, &mut bytes, (child % PTRS_PER_SECTOR) as usize * 4, PRI_META);
            sector = u32::from_le_bytes(bytes);
        }
        if sector == 0 {
            None
        } else {
            Some(sector)
        }
    }

    /// Frees every sector reachable from the record, depth-first: data
    /// sectors, then the index sectors naming them.
    fn release_sectors(&self) {
        let rec = read_record(&self.cache, self.inumber);
        for slot in 0..SID_INDEX {
            self.release_tree(rec.arr[slot], 0);
        }
        for slot in SID_INDEX..DID_INDEX {
            self.release_tree(rec.arr[slot], 1);
        }
        for slot in DID_INDEX..MAX_INDEX {
            self.release_tree(rec.arr[slot], 2);
        }
    }

    /// Frees `from` and, through `depth` levels of indirection, every
    /// sector it references. Unassigned entries are skipped.
    fn release_tree(&self, from: u32, depth: u32) {
        if from == 0 {
            return;
        }
        if depth > 0 {
            for child in 0..PTRS_PER_SECTOR {
                let mut bytes = [0u8; 4];
                self.cache.read(from, &mut bytes, child as usize * 4, PRI_META);
                self.release_tree(u32::from_le_bytes(bytes), depth - 1);
            }
        }
        self.cache.remove(from);
        self.freemap.release(from, 1);
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("inumber", &self.inumber)
            .finish()
    }
}
