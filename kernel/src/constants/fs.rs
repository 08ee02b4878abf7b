//! Filesystem configuration constants.

pub const MAX_FDS: usize = 32;

/// Size of the buffer used to pull a file from disk into the ramfs.
pub const READ_THROUGH_SCRATCH: usize = 65_536;

pub const SECTOR_SIZE: usize = 512;
pub const DISK_DIR_START_SECTOR: u64 = 1;
pub const DISK_DATA_START_SECTOR: u64 = 128;
pub const DISK_DIR_ENTRIES: usize = 128;
pub const DISK_NAME_LEN: usize = 64;
pub const DISK_DIR_ENTRY_SIZE: usize = DISK_NAME_LEN + 8;
/// Fixed extent reserved for every file on disk.
pub const DISK_FILE_SECTORS: u64 = READ_THROUGH_SCRATCH as u64 / SECTOR_SIZE as u64;
pub const DISK_TOTAL_SECTORS: u64 =
    DISK_DATA_START_SECTOR + DISK_DIR_ENTRIES as u64 * DISK_FILE_SECTORS;

pub const UNIT_DIR: &str = "/etc/systemd/system";
pub const UNIT_SUFFIX: &str = ".service";
