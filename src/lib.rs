//! A Unix-style block file system for embedding in a small kernel or host
//! process.
//!
//! The device is a flat array of 512-byte sectors; on top of it sit, bottom
//! up:
//!
//! * [`cache`] — a fixed pool of resident sectors mediating every device
//!   access, with write-back, clock eviction, read-ahead, and a periodic
//!   background flush.
//! * [`freemap`] — a bitmap over all sectors, recording which are in use.
//! * [`fs::inode`] — the on-disk inode table and the per-file sector map
//!   (five direct slots, two single-indirect, one doubly-indirect), with
//!   on-demand allocation: writing past end of file grows the file.
//! * [`fs::dir`] and [`fs::path`] — directories as ordinary files full of
//!   name entries, and `/`-separated path resolution over them.
//!
//! [`FileSys`] ties the layers together; [`File`] is an open handle. The
//! environment provides a [`SectorDevice`], threads, and a heap; nothing
//! else is assumed.
//!
//! Durability is on orderly shutdown: `FileSys::done` flushes everything,
//! and a later `FileSys::init(dev, false)` sees it. There is no journal;
//! a crash mid-run may lose buffered writes.

use thiserror::Error;

pub mod cache;
pub mod device;
pub mod freemap;
pub mod fs;
pub mod lock;
pub mod param;

pub use device::{FileDisk, MemDisk, SectorDevice};
pub use fs::{File, FileSys};

/// Why a file system operation could not be carried out.
///
/// Short reads and writes are not errors; `read_at`/`write_at` report them
/// through their byte counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// The free-map has no run of sectors left to allocate.
    #[error("no free sectors")]
    NoSpace,
    /// Path lookup failed.
    #[error("no such file or directory")]
    NotFound,
    /// Every inode table slot is taken.
    #[error("inode table exhausted")]
    NoInodes,
    /// The directory already has an entry by that name.
    #[error("entry already exists")]
    Exists,
    /// Only empty directories can be removed.
    #[error("directory not empty")]
    NotEmpty,
    /// A path component other than the last did not name a directory.
    #[error("not a directory")]
    NotDir,
    /// Empty, over-long, or otherwise unusable file name.
    #[error("invalid file name")]
    BadName,
    /// The directory was removed; it accepts no lookups or new entries.
    #[error("directory removed")]
    Removed,
    /// Size beyond what the sector map can address.
    #[error("file too large")]
    TooLarge,
}

pub type Result<T> = std::result::Result<T, Error>;
