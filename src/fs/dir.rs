//! Directories.
//!
//! A directory is an ordinary file whose payload is a packed array of
//! fixed-size entries, each naming an inumber. Every directory begins with
//! the entries `"."` (itself) and `".."` (its parent); those two never show
//! up in `readdir` and keep path resolution free of special cases.
//!
//! Multi-step entry scans take the backing inode's reentrant directory
//! lock, so `add` can call `lookup` for its duplicate check without
//! deadlocking against itself, and no scan observes a half-updated entry.

use std::mem;
use std::str;
use std::sync::{Arc, Mutex};

use arrayvec::ArrayString;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::fs::inode::{Inode, Itable};
use crate::param::{NAME_MAX, ROOT_DIR_INUMBER};
use crate::{Error, Result};

/// A single directory entry.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
struct DirEntry {
    /// Inumber of the named inode.
    inumber: u32,
    /// NUL-terminated file name.
    name: [u8; NAME_MAX + 1],
    /// In use or free?
    in_use: u8,
}

const_assert!(mem::size_of::<DirEntry>() == 20);

const ENTRY_SIZE: usize = mem::size_of::<DirEntry>();

impl DirEntry {
    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        debug_assert!(!bytes.is_empty() && bytes.len() <= NAME_MAX);
        self.name = [0; NAME_MAX + 1];
        self.name[..bytes.len()].copy_from_slice(bytes);
    }

    fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_MAX + 1);
        str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

/// Reads the entry at byte offset `ofs`, or `None` at end of file.
fn read_entry(inode: &Inode, ofs: u32) -> Option<DirEntry> {
    let mut entry = DirEntry::default();
    if inode.read_at(entry.as_bytes_mut(), ofs) == ENTRY_SIZE {
        Some(entry)
    } else {
        None
    }
}

/// Advances `pos` to just past the next live entry (skipping `"."` and
/// `".."`) and returns its name, or `None` when the directory is exhausted.
pub(crate) fn read_next(inode: &Inode, pos: &mut u32) -> Option<ArrayString<NAME_MAX>> {
    let prev = inode.lock_dir();
    let mut found = None;
    while let Some(entry) = read_entry(inode, *pos) {
        *pos += ENTRY_SIZE as u32;
        let name = entry.name();
        if entry.in_use != 0 && name != "." && name != ".." {
            found = ArrayString::from(name).ok();
            break;
        }
    }
    inode.set_lock_dir(prev);
    found
}

/// An open directory: an inode handle plus a read position.
pub struct Dir {
    inode: Arc<Inode>,
    pos: Mutex<u32>,
}

impl Dir {
    /// Creates an empty directory at `inumber` and populates `"."` and
    /// `".."`.
    pub fn create(itable: &Arc<Itable>, inumber: u32, parent: u32) -> Result<()> {
        itable.create(inumber, 2 * ENTRY_SIZE as u32, true);
        let dir = Dir::open(itable.open(inumber));
        let result = dir
            .add(".", inumber)
            .and_then(|()| dir.add("..", parent));
        dir.close();
        result
    }

    /// Wraps an already-open inode, taking ownership of the reference.
    pub fn open(inode: Arc<Inode>) -> Dir {
        Dir {
            inode,
            pos: Mutex::new(0),
        }
    }

    pub fn open_root(itable: &Arc<Itable>) -> Dir {
        Dir::open(itable.open(ROOT_DIR_INUMBER))
    }

    /// A second handle onto the same directory, with its own position.
    pub fn reopen(&self) -> Dir {
        Dir::open(self.inode.reopen())
    }

    pub fn close(self) {
        self.inode.close();
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Looks `name` up and opens its inode. Fails on a removed directory,
    /// so a deleted but still-open directory cannot acquire new children.
    pub fn lookup(&self, name: &str) -> Result<Arc<Inode>> {
        let prev = self.inode.lock_dir();
        let result = if self.inode.is_removed() {
            Err(Error::Removed)
        } else {
            match self.find(name) {
                Some((entry, _)) => Ok(self.inode.itable().open(entry.inumber)),
                None => Err(Error::NotFound),
            }
        };
        self.inode.set_lock_dir(prev);
        result
    }

    /// Adds `name` -> `inumber`, reusing a free slot if one exists.
    pub fn add(&self, name: &str, inumber: u32) -> Result<()> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(Error::BadName);
        }
        let prev = self.inode.lock_dir();
        let result = self.add_locked(name, inumber);
        self.inode.set_lock_dir(prev);
        result
    }

    fn add_locked(&self, name: &str, inumber: u32) -> Result<()> {
        if self.inode.is_removed() {
            return Err(Error::Removed);
        }
        if self.find(name).is_some() {
            return Err(Error::Exists);
        }

        // First free slot, or end of file if none. A short read can only
        // mean end of file here.
        let mut ofs = 0;
        while let Some(entry) = read_entry(&self.inode, ofs) {
            if entry.in_use == 0 {
                break;
            }
            ofs += ENTRY_SIZE as u32;
        }

        let mut entry = DirEntry::default();
        entry.in_use = 1;
        entry.inumber = inumber;
        entry.set_name(name);
        if self.inode.write_at(entry.as_bytes(), ofs) == ENTRY_SIZE {
            Ok(())
        } else {
            Err(Error::NoSpace)
        }
    }

    /// Removes the entry for `name` and marks its inode for deletion at
    /// last close. Refuses to remove a non-empty directory.
    pub fn remove(&self, name: &str) -> Result<()> {
        let prev = self.inode.lock_dir();
        let result = self.remove_locked(name);
        self.inode.set_lock_dir(prev);
        result
    }

    fn remove_locked(&self, name: &str) -> Result<()> {
        let (entry, ofs) = self.find(name).ok_or(Error::NotFound)?;
        let inode = self.inode.itable().open(entry.inumber);

        if inode.is_dir() {
            let dir = Dir::open(inode.reopen());
            let empty = dir.is_empty();
            dir.close();
            if !empty {
                inode.close();
                return Err(Error::NotEmpty);
            }
        }

        let mut cleared = entry;
        cleared.in_use = 0;
        if self.inode.write_at(cleared.as_bytes(), ofs) != ENTRY_SIZE {
            inode.close();
            return Err(Error::NoSpace);
        }
        inode.remove();
        inode.close();
        Ok(())
    }

    /// Returns the next entry name, advancing this handle's position.
    pub fn readdir(&self) -> Option<ArrayString<NAME_MAX>> {
        let mut pos = self.pos.lock().unwrap();
        read_next(&self.inode, &mut *pos)
    }

    /// A directory is empty when nothing but `"."` and `".."` is live.
    pub fn is_empty(&self) -> bool {
        let prev = self.inode.lock_dir();
        let mut empty = true;
        let mut ofs = 0;
        while let Some(entry) = read_entry(&self.inode, ofs) {
            ofs += ENTRY_SIZE as u32;
            let name = entry.name();
            if entry.in_use != 0 && name != "." && name != ".." {
                empty = false;
                break;
            }
        }
        self.inode.set_lock_dir(prev);
        empty
    }

    /// Scans for a live entry named `name`, returning it and its offset.
    fn find(&self, name: &str) -> Option<(DirEntry, u32)> {
        let prev = self.inode.lock_dir();
        let mut found = None;
        let mut ofs = 0;
        while let Some(entry) = read_entry(&self.inode, ofs) {
            if entry.in_use != 0 && entry.name() == name {
                found = Some((entry, ofs));
                break;
            }
            ofs += ENTRY_SIZE as u32;
        }
        self.inode.set_lock_dir(prev);
        found
    }
}
