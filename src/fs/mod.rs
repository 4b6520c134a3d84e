//! File system implementation. Four layers:
//!   + Buffer cache: every device access, write-back, eviction, read-ahead.
//!   + Free-map: allocator for raw device sectors.
//!   + Inodes: table slots, the sector map, reading, writing, growth.
//!   + Directories and names: inodes with special contents (lists of other
//!     inodes) and paths like `/usr/lib/fs.rs` for convenient naming.
//!
//! This module ties the layers into a [`FileSys`], the object a host embeds:
//! it owns the device, drives formatting and teardown, resolves paths, and
//! hands out [`File`] handles. Each layer's mechanics live in its own
//! module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use arrayvec::ArrayString;
use log::debug;

use crate::cache::BufCache;
use crate::device::SectorDevice;
use crate::freemap::FreeMap;
use crate::param::{INODE_TABLE_SECTORS, NAME_MAX, PRI_INODE, ROOT_DIR_INUMBER};
use crate::{Error, Result};

pub mod dir;
pub mod inode;
pub mod path;

use self::dir::Dir;
use self::inode::{Inode, Itable, MAX_FILE_SIZE};
use self::path::Path;

/// An instance of the file system on one device.
pub struct FileSys {
    dev: Arc<dyn SectorDevice>,
    cache: Arc<BufCache>,
    freemap: Arc<FreeMap>,
    itable: Arc<Itable>,
    /// Working directory of each thread that has called `chdir`; threads
    /// absent from the map resolve relative paths from the root.
    cwds: Mutex<HashMap<ThreadId, Dir>>,
}

impl FileSys {
    /// Brings the file system up on `dev`, formatting it first when
    /// `format` is set.
    pub fn init(dev: Arc<dyn SectorDevice>, format: bool) -> FileSys {
        let cache = BufCache::new(Arc::clone(&dev));
        cache.start();
        let freemap = FreeMap::new(Arc::clone(&cache), dev.sectors());
        let itable = Itable::new(Arc::clone(&cache), Arc::clone(&freemap));
        let fs = FileSys {
            dev,
            cache,
            freemap,
            itable,
            cwds: Mutex::new(HashMap::new()),
        };
        if format {
            fs.format();
        }
        fs.freemap.open();
        fs
    }

    /// Shuts the file system down, writing out everything unwritten, in
    /// reverse order of `init`. All `File` handles must be closed first.
    pub fn done(self) {
        for (_, dir) in self.cwds.lock().unwrap().drain() {
            dir.close();
        }
        self.freemap.close();
        self.cache.shutdown();
    }

    /// Synchronously writes all dirty state to the device without shutting
    /// down.
    pub fn flush(&self) {
        self.cache.flush_all();
    }

    /// Number of allocated sectors, reserved prefix included. Test and
    /// introspection aid.
    pub fn used_sectors(&self) -> u32 {
        self.freemap.used()
    }

    /// Creates a file of `initial_size` bytes (sparse; sectors materialize
    /// on first write) at `path`.
    pub fn create(&self, path: &str, initial_size: u32) -> Result<()> {
        if initial_size > MAX_FILE_SIZE {
            return Err(Error::TooLarge);
        }
        let (dir, base) = self.resolve(path)?;
        let result = (|| {
            let inumber = self.itable.assign_inumber()?;
            self.itable.create(inumber, initial_size, false);
            if let Err(err) = dir.add(base, inumber) {
                self.itable.release_inumber(inumber);
                return Err(err);
            }
            Ok(())
        })();
        dir.close();
        result
    }

    /// Opens the file or directory at `path`.
    pub fn open(&self, path: &str) -> Result<File> {
        let (dir, base) = self.resolve(path)?;
        let inode = dir.lookup(base);
        dir.close();
        Ok(File::new(inode?))
    }

    /// Deletes the file or empty directory at `path`. An inode that is
    /// still open elsewhere keeps its data until the last handle closes.
    pub fn remove(&self, path: &str) -> Result<()> {
        let (dir, base) = self.resolve(path)?;
        let result = dir.remove(base);
        dir.close();
        result
    }

    /// Creates an empty directory at `path`.
    pub fn mkdir(&self, path: &str) -> Result<()> {
        let (dir, base) = self.resolve(path)?;
        let result = (|| {
            let inumber = self.itable.assign_inumber()?;
            let parent = dir.inode().inumber();
            let made = Dir::create(&self.itable, inumber, parent)
                .and_then(|()| dir.add(base, inumber));
            if let Err(err) = made {
                // Free whatever the half-built directory allocated.
                let inode = self.itable.open(inumber);
                inode.remove();
                inode.close();
                return Err(err);
            }
            Ok(())
        })();
        dir.close();
        result
    }

    /// Changes the calling thread's working directory.
    pub fn chdir(&self, path: &str) -> Result<()> {
        let (dir, base) = self.resolve(path)?;
        let inode = dir.lookup(base);
        dir.close();
        let inode = inode?;
        if !inode.is_dir() {
            inode.close();
            return Err(Error::NotDir);
        }
        let old = self
            .cwds
            .lock()
            .unwrap()
            .insert(thread::current().id(), Dir::open(inode));
        if let Some(old) = old {
            old.close();
        }
        Ok(())
    }

    /// Splits `path` into its final component and an open handle on the
    /// directory that should contain it. Every intermediate component must
    /// resolve to a directory.
    fn resolve<'p>(&self, path: &'p str) -> Result<(Dir, &'p str)> {
        let path = Path::new(path);
        if path.is_empty() {
            return Err(Error::NotFound);
        }
        let base = path.file_name().ok_or(Error::BadName)?;

        let mut dir = if path.is_absolute() {
            Dir::open_root(&self.itable)
        } else {
            self.cwd()
        };
        let mut walk = path.dir_name();
        while let Some((rest, name)) = walk.skipelem() {
            walk = rest;
            let next = match dir.lookup(name) {
                Ok(next) => next,
                Err(err) => {
                    dir.close();
                    return Err(err);
                }
            };
            if !next.is_dir() {
                next.close();
                dir.close();
                return Err(Error::NotDir);
            }
            dir.close();
            dir = Dir::open(next);
        }
        Ok((dir, base))
    }

    /// A fresh handle on the calling thread's working directory.
    fn cwd(&self) -> Dir {
        let mut cwds = self.cwds.lock().unwrap();
        let dir = cwds
            .entry(thread::current().id())
            .or_insert_with(|| Dir::open_root(&self.itable));
        dir.reopen()
    }

    fn format(&self) {
        debug!("formatting: {} sectors", self.dev.sectors());
        // A zeroed table slot is a free inumber, so zero-fill the whole
        // table through the cache.
        for sector in 0..INODE_TABLE_SECTORS {
            self.cache.add(sector, PRI_INODE);
        }
        self.freemap.create();
        Dir::create(&self.itable, ROOT_DIR_INUMBER, ROOT_DIR_INUMBER)
            .expect("root directory creation failed");
        self.freemap.close();
    }
}

/// An open file or directory: an inode handle plus a byte position.
///
/// Closing is dropping; `close` exists to make the point of release
/// explicit in calling code.
pub struct File {
    inode: Arc<Inode>,
    pos: Mutex<u32>,
    denied: AtomicBool,
}

impl File {
    fn new(inode: Arc<Inode>) -> File {
        File {
            inode,
            pos: Mutex::new(0),
            denied: AtomicBool::new(false),
        }
    }

    /// Reads from the current position, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut pos = self.pos.lock().unwrap();
        let n = self.inode.read_at(buf, *pos);
        *pos += n as u32;
        n
    }

    /// Writes at the current position, advancing it.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut pos = self.pos.lock().unwrap();
        let n = self.inode.write_at(buf, *pos);
        *pos += n as u32;
        n
    }

    /// Reads at `offset` without touching the position.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> usize {
        self.inode.read_at(buf, offset)
    }

    /// Writes at `offset` without touching the position.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> usize {
        self.inode.write_at(buf, offset)
    }

    pub fn seek(&self, pos: u32) {
        *self.pos.lock().unwrap() = pos;
    }

    pub fn tell(&self) -> u32 {
        *self.pos.lock().unwrap()
    }

    pub fn length(&self) -> u32 {
        self.inode.length()
    }

    pub fn is_dir(&self) -> bool {
        self.inode.is_dir()
    }

    pub fn inumber(&self) -> u32 {
        self.inode.inumber()
    }

    /// Next entry name of an open directory, advancing the position.
    /// `None` on a non-directory or at the end.
    pub fn readdir(&self) -> Option<ArrayString<NAME_MAX>> {
        if !self.inode.is_dir() {
            return None;
        }
        let mut pos = self.pos.lock().unwrap();
        dir::read_next(&self.inode, &mut *pos)
    }

    /// Pins the file's content against writes through any handle. At most
    /// one veto per handle; undone by `allow_write` or at close.
    pub fn deny_write(&self) {
        if !self.denied.swap(true, Ordering::SeqCst) {
            self.inode.deny_write();
        }
    }

    /// Withdraws this handle's write veto, if it holds one.
    pub fn allow_write(&self) {
        if self.denied.swap(false, Ordering::SeqCst) {
            self.inode.allow_write();
        }
    }

    pub fn close(self) {}
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("inumber", &self.inode.inumber())
            .field("pos", &self.tell())
            .finish()
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.denied.load(Ordering::SeqCst) {
            self.inode.allow_write();
        }
        self.inode.close();
    }
}
