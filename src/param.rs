use std::time::Duration;

/// Size of a device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of resident sectors in the buffer cache.
pub const NUM_SLOTS: usize = 64;

/// Size of the on-disk inode table, in sectors. The table starts at
/// sector 0; the free-map bitmap follows it.
pub const INODE_TABLE_SECTORS: u32 = 100;

/// Inumber of the root directory.
pub const ROOT_DIR_INUMBER: u32 = 0;

/// Maximum length of a file name component.
/// This is the traditional UNIX maximum length.
pub const NAME_MAX: usize = 14;

/// Cache priority of inode-table sectors.
pub const PRI_INODE: u32 = 3;

/// Cache priority of index (indirect) sectors.
pub const PRI_META: u32 = 2;

/// Cache priority of ordinary data sectors.
pub const PRI_NORMAL: u32 = 1;

/// Period of the background write-back pass.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on queued prefetch requests; further requests are dropped.
pub const MAX_FETCH_REQUESTS: usize = NUM_SLOTS;
