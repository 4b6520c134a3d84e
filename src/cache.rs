//! Buffer cache.
//!
//! The buffer cache is a fixed pool of sector-sized slots holding cached
//! copies of device sectors. It is the only path to the block device:
//! caching sectors in memory reduces device traffic and provides the
//! synchronization point for sectors shared by multiple threads.
//!
//! Interface:
//! * `read` / `write` copy a sub-sector range out of or into a slot,
//!   populating it from the device on a miss. Writes are buffered
//!   (write-back); a background flusher writes dirty slots out periodically.
//! * `add` inserts a freshly zero-filled slot, used when a sector has just
//!   been allocated and its on-device content is garbage.
//! * `lock` / `unlock` write-pin a sector across a multi-step update, such
//!   as the read-check-allocate-write sequence on an index sector. Reads
//!   and writes of the pinned sector by the owning thread go through
//!   without re-acquiring the slot lock.
//! * `fetch_async` queues a prefetch served by a background worker.
//! * `close` hints that a sector is unlikely to be needed again; `remove`
//!   additionally drops its dirty state so a freed sector is never written
//!   back.
//! * `read_external` / `dirty_external` / `free_external` manage runs of
//!   sectors cached in caller-sized buffers outside the fixed pool (the
//!   free-map bitmap lives in one).
//!
//! Replacement is a clock sweep over the pool seeded by per-access
//! priorities, so inode-table and index sectors survive more passes than
//! ordinary data. Sectors in the closed index are evicted first, and a
//! sector revived out of the closed index costs no I/O.

use std::cell::UnsafeCell;
use std::collections::{HashMap, VecDeque};
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use array_macro::array;
use log::{debug, trace};
use scopeguard::defer;

use crate::device::SectorDevice;
use crate::lock::{Rwlock, Semaphore};
use crate::param::{FLUSH_INTERVAL, MAX_FETCH_REQUESTS, NUM_SLOTS, PRI_META, PRI_NORMAL, SECTOR_SIZE};

struct SlotInner {
    /// The slot has been bound to a sector at least once; `sector` and
    /// `data` are meaningful.
    valid: bool,
    /// Sector currently held.
    sector: u32,
    data: [u8; SECTOR_SIZE],
}

struct Slot {
    rw: Rwlock,
    /// Clock counter; 0 means evictable, otherwise the sweep decrements.
    /// Seeded with the access priority on every touch.
    accessed: AtomicU32,
    /// Slot content is newer than the device.
    dirty: AtomicBool,
    /// Pins against eviction. Incremented only under the index lock, so the
    /// sweep (which also runs under it) sees a stable zero before taking a
    /// victim.
    refs: AtomicU32,
    /// Thread holding the write pin taken by `lock`, if any.
    owner: spin::Mutex<Option<ThreadId>>,
    inner: UnsafeCell<SlotInner>,
}

// Slot data is guarded by `rw`; the accessors below state the requirement.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Slot {
        Slot {
            rw: Rwlock::new(),
            accessed: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            refs: AtomicU32::new(0),
            owner: spin::Mutex::new(None),
            inner: UnsafeCell::new(SlotInner {
                valid: false,
                sector: 0,
                data: [0; SECTOR_SIZE],
            }),
        }
    }

    /// # Safety
    ///
    /// A read or write pin on `self.rw` must be held.
    unsafe fn inner(&self) -> &SlotInner {
        &*self.inner.get()
    }

    /// # Safety
    ///
    /// The write pin on `self.rw` must be held.
    #[allow(clippy::mut_from_ref)]
    unsafe fn inner_mut(&self) -> &mut SlotInner {
        &mut *self.inner.get()
    }
}

/// Sector-keyed slot indexes, all under the one cache lock.
struct Indexes {
    /// Sectors currently in use by the file system.
    active: HashMap<u32, usize>,
    /// Sectors released by their last user; preferred eviction source.
    closed: HashMap<u32, usize>,
    /// Slots never yet bound to a sector.
    free: Vec<usize>,
    /// Clock hand.
    hand: usize,
}

/// A run of sectors cached outside the fixed pool, in a buffer sized by the
/// client. The free-map keeps its whole bitmap in one of these; the run
/// participates in periodic and final flushes like any slot.
pub struct ExternalRun {
    start: u32,
    sectors: usize,
    data: Mutex<Box<[u8]>>,
    dirty: AtomicBool,
}

impl ExternalRun {
    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn sectors(&self) -> usize {
        self.sectors
    }

    /// Runs `f` on the cached bytes. The run's lock is held for the
    /// duration, excluding the flusher.
    pub fn with_data<R, F: FnOnce(&mut [u8]) -> R>(&self, f: F) -> R {
        let mut data = self.data.lock().unwrap();
        f(&mut data)
    }
}

#[derive(Clone, Copy)]
enum Pin {
    Read,
    Write,
}

pub struct BufCache {
    dev: Arc<dyn SectorDevice>,
    slots: [Slot; NUM_SLOTS],
    index: Mutex<Indexes>,
    /// Serializes the device I/O pair of an eviction swap (victim
    /// write-back, then new-sector read).
    evict_lock: Mutex<()>,
    externals: Mutex<Vec<Arc<ExternalRun>>>,
    fetchq: spin::Mutex<VecDeque<u32>>,
    fetch_sem: Semaphore,
    done: Mutex<bool>,
    tick: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BufCache {
    pub fn new(dev: Arc<dyn SectorDevice>) -> Arc<BufCache> {
        Arc::new(BufCache {
            dev,
            slots: array![_ => Slot::new(); NUM_SLOTS],
            index: Mutex::new(Indexes {
                active: HashMap::new(),
                closed: HashMap::new(),
                free: (0..NUM_SLOTS).rev().collect(),
                hand: 0,
            }),
            evict_lock: Mutex::new(()),
            externals: Mutex::new(Vec::new()),
            fetchq: spin::Mutex::new(VecDeque::new()),
            fetch_sem: Semaphore::new(0),
            done: Mutex::new(false),
            tick: Condvar::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Starts the background flusher and prefetch workers.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();
        assert!(workers.is_empty(), "BufCache::start: already started");

        let cache = Arc::clone(self);
        workers.push(
            thread::Builder::new()
                .name("bufcache-flush".into())
                .spawn(move || cache.flush_loop())
                .expect("BufCache::start: spawn failed"),
        );
        let cache = Arc::clone(self);
        workers.push(
            thread::Builder::new()
                .name("bufcache-fetch".into())
                .spawn(move || cache.fetch_loop())
                .expect("BufCache::start: spawn failed"),
        );
    }

    /// Stops the workers, then synchronously flushes everything dirty.
    pub fn shutdown(&self) {
        {
            let mut done = self.done.lock().unwrap();
            *done = true;
        }
        self.tick.notify_all();
        self.fetch_sem.up();
        for worker in self.workers.lock().unwrap().drain(..) {
            worker.join().expect("BufCache::shutdown: worker panicked");
        }
        self.flush_all();
    }

    /// Copies `buf.len()` bytes out of `sector` starting at byte `ofs`.
    pub fn read(&self, sector: u32, buf: &mut [u8], ofs: usize, priority: u32) {
        assert!(ofs + buf.len() <= SECTOR_SIZE);
        if let Some(idx) = self.owned_slot(sector) {
            // Recursive access under this thread's own write pin.
            let inner = unsafe { self.slots[idx].inner() };
            buf.copy_from_slice(&inner.data[ofs..ofs + buf.len()]);
            self.slots[idx].accessed.store(priority, Ordering::Relaxed);
            return;
        }
        let idx = self.get(sector, Pin::Read, false, priority);
        defer! { self.release(idx, Pin::Read); }
        // SAFETY: read pin held.
        let inner = unsafe { self.slots[idx].inner() };
        buf.copy_from_slice(&inner.data[ofs..ofs + buf.len()]);
    }

    /// Copies `buf` into `sector` starting at byte `ofs` and marks the slot
    /// dirty. The device is updated later, by the flusher or at eviction.
    pub fn write(&self, sector: u32, buf: &[u8], ofs: usize, priority: u32) {
        assert!(ofs + buf.len() <= SECTOR_SIZE);
        if let Some(idx) = self.owned_slot(sector) {
            // SAFETY: this thread holds the write pin taken by `lock`.
            let inner = unsafe { self.slots[idx].inner_mut() };
            inner.data[ofs..ofs + buf.len()].copy_from_slice(buf);
            self.slots[idx].dirty.store(true, Ordering::Relaxed);
            self.slots[idx].accessed.store(priority, Ordering::Relaxed);
            return;
        }
        let idx = self.get(sector, Pin::Write, false, priority);
        defer! { self.release(idx, Pin::Write); }
        // SAFETY: write pin held.
        let inner = unsafe { self.slots[idx].inner_mut() };
        inner.data[ofs..ofs + buf.len()].copy_from_slice(buf);
        self.slots[idx].dirty.store(true, Ordering::Relaxed);
    }

    /// Inserts `sector` as a zero-filled dirty slot without reading the
    /// device. Used right after allocating the sector, whose on-device
    /// content is garbage.
    pub fn add(&self, sector: u32, priority: u32) {
        let idx = self.get(sector, Pin::Write, true, priority);
        self.release(idx, Pin::Write);
    }

    /// Write-pins `sector` until `unlock`. While pinned, the sector cannot
    /// be evicted, read, or written by any other thread; this thread's own
    /// `read`/`write` calls on it go through without re-acquiring the lock.
    pub fn lock(&self, sector: u32) {
        let idx = self.get(sector, Pin::Write, false, PRI_META);
        *self.slots[idx].owner.lock() = Some(thread::current().id());
    }

    pub fn unlock(&self, sector: u32) {
        let idx = self
            .owned_slot(sector)
            .expect("BufCache::unlock: sector not pinned by this thread");
        *self.slots[idx].owner.lock() = None;
        self.release(idx, Pin::Write);
    }

    /// Queues a prefetch of `sector`. Returns immediately; the request is
    /// dropped if the queue is full.
    pub fn fetch_async(&self, sector: u32) {
        let mut fetchq = self.fetchq.lock();
        if fetchq.len() >= MAX_FETCH_REQUESTS {
            trace!("fetch_async: queue full, dropping sector {}", sector);
            return;
        }
        fetchq.push_back(sector);
        drop(fetchq);
        self.fetch_sem.up();
    }

    /// Hints that `sector` is unlikely to be reused: moves it to the closed
    /// index, making it the preferred eviction victim. Dirty content is
    /// still written back.
    pub fn close(&self, sector: u32) {
        let mut index = self.index.lock().unwrap();
        if let Some(idx) = index.active.remove(&sector) {
            index.closed.insert(sector, idx);
        }
    }

    /// Like `close`, but also drops the slot's dirty state. Used when
    /// `sector` is being freed: its content must not reach the device.
    pub fn remove(&self, sector: u32) {
        let mut index = self.index.lock().unwrap();
        let idx = index
            .active
            .remove(&sector)
            .or_else(|| index.closed.remove(&sector));
        if let Some(idx) = idx {
            self.slots[idx].dirty.store(false, Ordering::Relaxed);
            index.closed.insert(sector, idx);
        }
    }

    /// Reads `sectors` device sectors starting at `start` into a
    /// caller-sized buffer outside the fixed pool. The run stays attached
    /// to the cache (and is flushed when dirty) until `free_external`.
    pub fn read_external(&self, start: u32, sectors: usize) -> Arc<ExternalRun> {
        let mut data = vec![0u8; sectors * SECTOR_SIZE].into_boxed_slice();
        for i in 0..sectors {
            let buf: &mut [u8; SECTOR_SIZE] = (&mut data
                [i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
                .try_into()
                .unwrap();
            self.dev.read(start + i as u32, buf);
        }
        let run = Arc::new(ExternalRun {
            start,
            sectors,
            data: Mutex::new(data),
            dirty: AtomicBool::new(false),
        });
        self.externals.lock().unwrap().push(Arc::clone(&run));
        run
    }

    /// Marks the external run starting at `start` dirty.
    pub fn dirty_external(&self, start: u32) {
        let externals = self.externals.lock().unwrap();
        for run in externals.iter() {
            if run.start == start {
                run.dirty.store(true, Ordering::Relaxed);
                return;
            }
        }
        panic!("dirty_external: no run starts at sector {}", start);
    }

    /// Detaches the external run starting at `start`, writing it back first
    /// if dirty.
    pub fn free_external(&self, start: u32) {
        let run = {
            let mut externals = self.externals.lock().unwrap();
            let pos = externals
                .iter()
                .position(|run| run.start == start)
                .expect("free_external: no run starts at given sector");
            externals.swap_remove(pos)
        };
        self.flush_external(&run);
    }

    /// Synchronously writes out every dirty slot and external run.
    pub fn flush_all(&self) {
        let mut flushed = 0;
        for slot in self.slots.iter() {
            slot.rw.acquire_read();
            // SAFETY: read pin held.
            let inner = unsafe { slot.inner() };
            if inner.valid && slot.dirty.swap(false, Ordering::Relaxed) {
                self.dev.write(inner.sector, &inner.data);
                flushed += 1;
            }
            slot.rw.release_read();
        }
        let externals = self.externals.lock().unwrap().clone();
        for run in externals.iter() {
            self.flush_external(run);
        }
        if flushed > 0 {
            debug!("flush: wrote {} sectors", flushed);
        }
    }

    fn flush_external(&self, run: &ExternalRun) {
        if !run.dirty.swap(false, Ordering::Relaxed) {
            return;
        }
        let data = run.data.lock().unwrap();
        for i in 0..run.sectors {
            let buf: &[u8; SECTOR_SIZE] = (&data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
                .try_into()
                .unwrap();
            self.dev.write(run.start + i as u32, buf);
        }
    }

    /// Returns the slot this thread has write-pinned for `sector` via
    /// `lock`, if any.
    fn owned_slot(&self, sector: u32) -> Option<usize> {
        let me = thread::current().id();
        let index = self.index.lock().unwrap();
        let idx = *index
            .active
            .get(&sector)
            .or_else(|| index.closed.get(&sector))?;
        let owner = *self.slots[idx].owner.lock();
        if owner == Some(me) {
            Some(idx)
        } else {
            None
        }
    }

    /// Returns the slot bound to `sector` with the requested pin held and
    /// the slot's eviction refcount raised. On a miss the slot is populated
    /// from the device, or zero-filled and marked dirty when `zero` is set.
    fn get(&self, sector: u32, pin: Pin, zero: bool, priority: u32) -> usize {
        let mut index = self.index.lock().unwrap();

        // Hit, or revival out of the closed index (no I/O either way).
        let hit = index.active.get(&sector).copied().or_else(|| {
            let idx = index.closed.remove(&sector)?;
            index.active.insert(sector, idx);
            Some(idx)
        });
        if let Some(idx) = hit {
            let slot = &self.slots[idx];
            slot.refs.fetch_add(1, Ordering::Relaxed);
            drop(index);
            match pin {
                Pin::Read => slot.rw.acquire_read(),
                Pin::Write => slot.rw.acquire_write(),
            }
            if zero {
                debug_assert!(matches!(pin, Pin::Write));
                // SAFETY: write pin held.
                let inner = unsafe { slot.inner_mut() };
                inner.data = [0; SECTOR_SIZE];
                slot.dirty.store(true, Ordering::Relaxed);
            }
            slot.accessed.store(priority, Ordering::Relaxed);
            return idx;
        }

        // Miss: take a victim. `evict` leaves the slot write-pinned,
        // refs-pinned, and rebound to `sector` in the active index.
        let (idx, write_back) = self.evict(&mut index, sector);
        drop(index);
        let slot = &self.slots[idx];
        {
            let _serial = self.evict_lock.lock().unwrap();
            if let Some(old_sector) = write_back {
                // SAFETY: write pin held.
                let inner = unsafe { slot.inner() };
                self.dev.write(old_sector, &inner.data);
            }
            // SAFETY: write pin held.
            let inner = unsafe { slot.inner_mut() };
            inner.valid = true;
            inner.sector = sector;
            if zero {
                inner.data = [0; SECTOR_SIZE];
                slot.dirty.store(true, Ordering::Relaxed);
            } else {
                self.dev.read(sector, &mut inner.data);
            }
        }
        slot.accessed.store(priority, Ordering::Relaxed);
        if let Pin::Read = pin {
            slot.rw.demote();
        }
        idx
    }

    fn release(&self, idx: usize, pin: Pin) {
        match pin {
            Pin::Read => self.slots[idx].rw.release_read(),
            Pin::Write => self.slots[idx].rw.release_write(),
        }
        self.slots[idx].refs.fetch_sub(1, Ordering::Relaxed);
    }

    /// Picks an eviction victim and rebinds it to `new_sector`. Called with
    /// the index lock held; returns the slot (write-pinned, refs = 1) and
    /// the old sector to write back if the victim was dirty.
    fn evict(&self, index: &mut Indexes, new_sector: u32) -> (usize, Option<u32>) {
        // Unbound slots first.
        if let Some(idx) = index.free.pop() {
            let slot = &self.slots[idx];
            slot.rw.acquire_write();
            slot.refs.store(1, Ordering::Relaxed);
            index.active.insert(new_sector, idx);
            return (idx, None);
        }

        // Closed index next: its sectors were given up by their last user.
        let victim = index.closed.iter().find_map(|(&old, &idx)| {
            let slot = &self.slots[idx];
            if slot.refs.load(Ordering::Relaxed) == 0 && slot.rw.try_acquire_write() {
                Some((old, idx))
            } else {
                None
            }
        });
        if let Some((old, idx)) = victim {
            index.closed.remove(&old);
            let slot = &self.slots[idx];
            slot.refs.store(1, Ordering::Relaxed);
            index.active.insert(new_sector, idx);
            let dirty = slot.dirty.swap(false, Ordering::Relaxed);
            trace!("evict: closed sector {} -> {}", old, new_sector);
            return (idx, if dirty { Some(old) } else { None });
        }

        // Clock sweep with second chances.
        loop {
            index.hand = (index.hand + 1) % NUM_SLOTS;
            let idx = index.hand;
            let slot = &self.slots[idx];
            if slot.refs.load(Ordering::Relaxed) != 0 || !slot.rw.try_acquire_write() {
                continue;
            }
            let accessed = slot.accessed.load(Ordering::Relaxed);
            if accessed > 0 {
                slot.accessed.store(accessed - 1, Ordering::Relaxed);
                slot.rw.release_write();
                continue;
            }
            // SAFETY: write pin held.
            let old = unsafe { slot.inner() }.sector;
            let unbound = index.active.remove(&old).is_some() || index.closed.remove(&old).is_some();
            debug_assert!(unbound, "evict: victim slot not indexed");
            slot.refs.store(1, Ordering::Relaxed);
            index.active.insert(new_sector, idx);
            let dirty = slot.dirty.swap(false, Ordering::Relaxed);
            trace!("evict: swept sector {} -> {}", old, new_sector);
            return (idx, if dirty { Some(old) } else { None });
        }
    }

    fn flush_loop(&self) {
        let mut done = self.done.lock().unwrap();
        loop {
            let (guard, _) = self.tick.wait_timeout(done, FLUSH_INTERVAL).unwrap();
            done = guard;
            if *done {
                return;
            }
            drop(done);
            self.flush_all();
            done = self.done.lock().unwrap();
            // A shutdown signalled during the flush would otherwise wait
            // out one more full tick.
            if *done {
                return;
            }
        }
    }

    fn fetch_loop(&self) {
        loop {
            self.fetch_sem.down();
            if *self.done.lock().unwrap() {
                return;
            }
            let sector = match self.fetchq.lock().pop_front() {
                Some(sector) => sector,
                None => continue,
            };
            // A write-pinned sector is mid-update; do not touch it.
            let pinned = {
                let index = self.index.lock().unwrap();
                index
                    .active
                    .get(&sector)
                    .map(|&idx| self.slots[idx].owner.lock().is_some())
                    .unwrap_or(false)
            };
            if pinned {
                trace!("prefetch: sector {} is pinned, skipping", sector);
                continue;
            }
            let idx = self.get(sector, Pin::Read, false, PRI_NORMAL);
            self.release(idx, Pin::Read);
        }
    }
}
