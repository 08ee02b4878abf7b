use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::result::Result;
use lazy_static::lazy_static;
use spin::Mutex;

pub mod block;
pub mod diskfs;
pub mod fdtab;
pub mod glob;
pub mod path;
pub mod ramfs;

pub use diskfs::DiskFs;
pub use fdtab::{FdTable, OpenFlags};
pub use glob::glob_match;
pub use path::{cwd, resolve_path, set_cwd};
pub use ramfs::RamFs;

use crate::constants::fs::{DISK_TOTAL_SECTORS, SECTOR_SIZE, UNIT_DIR};
use block::MemoryBlockDevice;

// Define error types for the filesystem operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    InvalidName,
    IOError,
    NotSupported,
    NoSpace,
    IsDirectory,
    NotDirectory,
    NotEmpty,
    BadDescriptor,
    TooManyOpenFiles,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "no such file or directory"),
            FsError::AlreadyExists => write!(f, "already exists"),
            FsError::InvalidName => write!(f, "invalid name"),
            FsError::IOError => write!(f, "I/O error"),
            FsError::NotSupported => write!(f, "not supported"),
            FsError::NoSpace => write!(f, "no space left"),
            FsError::IsDirectory => write!(f, "is a directory"),
            FsError::NotDirectory => write!(f, "not a directory"),
            FsError::NotEmpty => write!(f, "directory not empty"),
            FsError::BadDescriptor => write!(f, "bad file descriptor"),
            FsError::TooManyOpenFiles => write!(f, "too many open files"),
        }
    }
}

/// Represents a block device that can be read from and written to
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<(), FsError>;
    fn write_block(&mut self, block_num: u64, buf: &[u8]) -> Result<(), FsError>;
    fn block_size(&self) -> usize;
    fn total_blocks(&self) -> u64;
}

/// File metadata information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,
    pub is_dir: bool,
}

/// Seek positions for file operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

// Lock order: FDTAB, then RAMFS, then DISKFS.
lazy_static! {
    pub static ref FDTAB: Mutex<FdTable> = Mutex::new(FdTable::new());
}
pub static RAMFS: Mutex<RamFs> = Mutex::new(RamFs::new());
pub static DISKFS: Mutex<Option<DiskFs>> = Mutex::new(None);

/// Directories every boot starts with.
const SKELETON: &[&str] = &["/home", "/tmp", UNIT_DIR];

/// Bring up the filesystem on a fresh in-memory disk image.
pub fn init() -> Result<(), FsError> {
    init_with_device(Some(Box::new(MemoryBlockDevice::new(
        DISK_TOTAL_SECTORS,
        SECTOR_SIZE,
    ))))
}

/// Reset ramfs and descriptors, mount `device` if given and pull its files in.
pub fn init_with_device(device: Option<Box<dyn BlockDevice>>) -> Result<(), FsError> {
    let mut fds = FDTAB.lock();
    let mut ramfs = RAMFS.lock();
    let mut diskfs = DISKFS.lock();

    fds.reset();
    ramfs.clear();
    for dir in SKELETON {
        ramfs.mkdir_all(dir)?;
    }
    path::set_cwd("/");

    *diskfs = match device {
        Some(device) => match DiskFs::mount(device) {
            Ok(disk) => {
                disk.load_into(&mut ramfs);
                Some(disk)
            }
            Err(err) => {
                log::warn!("filesys: disk not mounted: {}", err);
                None
            }
        },
        None => None,
    };
    log::info!("filesys: ready, disk {}", if diskfs.is_some() { "mounted" } else { "absent" });
    Ok(())
}

pub fn with_ramfs<F, R>(f: F) -> R
where
    F: FnOnce(&mut RamFs) -> R,
{
    let mut guard = RAMFS.lock();
    f(&mut guard)
}

/// Run `f` on the mounted disk, `None` without one.
pub fn with_diskfs<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut DiskFs) -> R,
{
    let mut guard = DISKFS.lock();
    guard.as_mut().map(f)
}

pub fn open(path: &str, flags: OpenFlags) -> Result<usize, FsError> {
    let mut fds = FDTAB.lock();
    let mut ramfs = RAMFS.lock();
    let mut disk = DISKFS.lock();
    fds.open(&mut ramfs, disk.as_mut(), path, flags)
}

pub fn close(fd: usize) -> Result<(), FsError> {
    FDTAB.lock().close(fd)
}

pub fn read(fd: usize, buf: &mut [u8]) -> Result<usize, FsError> {
    let mut fds = FDTAB.lock();
    let ramfs = RAMFS.lock();
    fds.read(&ramfs, fd, buf)
}

pub fn write(fd: usize, buf: &[u8]) -> Result<usize, FsError> {
    let mut fds = FDTAB.lock();
    let mut ramfs = RAMFS.lock();
    let mut disk = DISKFS.lock();
    fds.write(&mut ramfs, disk.as_mut(), fd, buf)
}

pub fn seek(fd: usize, to: SeekFrom) -> Result<u64, FsError> {
    let mut fds = FDTAB.lock();
    let ramfs = RAMFS.lock();
    fds.seek(&ramfs, fd, to)
}

pub fn stat(path: &str) -> Result<FileMetadata, FsError> {
    let mut ramfs = RAMFS.lock();
    let mut disk = DISKFS.lock();
    fdtab::stat(&mut ramfs, disk.as_mut(), path)
}

/// Whole contents of a file, read through a descriptor.
pub fn read_file(path: &str) -> Result<Vec<u8>, FsError> {
    let fd = open(path, OpenFlags::RDONLY)?;
    let mut data = Vec::new();
    let mut chunk = [0u8; SECTOR_SIZE];
    let result = loop {
        match read(fd, &mut chunk) {
            Ok(0) => break Ok(()),
            Ok(count) => data.extend_from_slice(&chunk[..count]),
            Err(err) => break Err(err),
        }
    };
    close(fd)?;
    result.map(|()| data)
}

/// Create or replace (or append to) a file through a descriptor, so the
/// contents reach the disk too.
pub fn write_file(path: &str, data: &[u8], append: bool) -> Result<usize, FsError> {
    let mode = if append { OpenFlags::APPEND } else { OpenFlags::TRUNC };
    let fd = open(path, OpenFlags::WRONLY | OpenFlags::CREAT | mode)?;
    let result = write(fd, data);
    close(fd)?;
    result
}

/// Remove from ramfs, then drop whatever the disk holds for the same path.
pub fn remove(path: &str, recursive: bool) -> Result<usize, FsError> {
    let mut ramfs = RAMFS.lock();
    let removed = if recursive {
        ramfs.remove_recursive(path)?
    } else {
        ramfs.remove(path).map(|()| 1)?
    };
    if let Some(disk) = DISKFS.lock().as_mut() {
        if let Err(err) = disk.remove_tree(path) {
            log::warn!("filesys: {} left on disk: {}", path, err);
        }
    }
    Ok(removed)
}

/// Move a file or tree. Files that end up under `to` are re-stored on disk
/// under their new names.
pub fn rename(from: &str, to: &str) -> Result<(), FsError> {
    let mut ramfs = RAMFS.lock();
    ramfs.rename(from, to)?;
    if let Some(disk) = DISKFS.lock().as_mut() {
        let mut prefix = String::from(to.trim_end_matches('/'));
        prefix.push('/');
        let result = disk.remove_tree(from).and_then(|_| {
            ramfs
                .files()
                .filter(|(name, _)| *name == to || name.starts_with(&prefix))
                .try_for_each(|(name, data)| disk.store(name, data))
        });
        if let Err(err) = result {
            log::warn!("filesys: rename of {} not persisted: {}", from, err);
        }
    }
    Ok(())
}

/// Persist every ramfs file to disk. Returns how many were written.
pub fn sync() -> Result<usize, FsError> {
    let ramfs = RAMFS.lock();
    let mut disk = DISKFS.lock();
    let disk = disk.as_mut().ok_or(FsError::NotSupported)?;
    Ok(disk.sync_from(&ramfs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::fs::{DISK_DATA_START_SECTOR, DISK_FILE_SECTORS};
    use crate::test_support::lock_globals;

    fn small_device() -> Box<dyn BlockDevice> {
        let sectors = DISK_DATA_START_SECTOR + 8 * DISK_FILE_SECTORS;
        Box::new(MemoryBlockDevice::new(sectors, SECTOR_SIZE))
    }

    #[test]
    fn test_skeleton_after_init() {
        let _guard = lock_globals();
        init_with_device(None).unwrap();
        assert!(with_ramfs(|fs| fs.is_dir(UNIT_DIR)));
        assert_eq!(stat("/tmp"), Ok(FileMetadata { size: 0, is_dir: true }));
        assert_eq!(cwd(), "/");
    }

    #[test]
    fn test_file_helpers_reach_disk() {
        let _guard = lock_globals();
        init_with_device(Some(small_device())).unwrap();

        assert_eq!(write_file("/tmp/a", b"one\n", false), Ok(4));
        assert_eq!(write_file("/tmp/a", b"two\n", true), Ok(4));
        assert_eq!(read_file("/tmp/a").unwrap(), b"one\ntwo\n");
        assert_eq!(with_diskfs(|disk| disk.size("/tmp/a")), Some(Ok(8)));

        // Dropped from ramfs only: a later open reads it back from disk.
        with_ramfs(|fs| fs.remove("/tmp/a")).unwrap();
        assert_eq!(read_file("/tmp/a").unwrap(), b"one\ntwo\n");

        // Removed through the facade: gone from both.
        assert_eq!(remove("/tmp/a", false), Ok(1));
        assert_eq!(read_file("/tmp/a"), Err(FsError::NotFound));
        assert_eq!(FDTAB.lock().open_count(), 0);
    }

    #[test]
    fn test_sync_then_recursive_remove() {
        let _guard = lock_globals();
        init_with_device(Some(small_device())).unwrap();
        with_ramfs(|fs| fs.store("/home/notes", b"kept")).unwrap();
        assert_eq!(sync(), Ok(1));
        assert_eq!(remove("/home", true), Ok(2));
        assert_eq!(stat("/home/notes"), Err(FsError::NotFound));
    }

    #[test]
    fn test_rename_moves_disk_copies() {
        let _guard = lock_globals();
        init_with_device(Some(small_device())).unwrap();
        write_file("/tmp/old", b"data", false).unwrap();
        rename("/tmp/old", "/home/new").unwrap();

        assert_eq!(with_diskfs(|disk| disk.size("/tmp/old")), Some(Err(FsError::NotFound)));
        assert_eq!(with_diskfs(|disk| disk.size("/home/new")), Some(Ok(4)));
        assert_eq!(read_file("/home/new").unwrap(), b"data");
        assert_eq!(rename("/tmp/old", "/tmp/x"), Err(FsError::NotFound));
    }
}
