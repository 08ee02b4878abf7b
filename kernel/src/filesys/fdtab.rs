//! File descriptor table over ramfs, with read-through from and
//! write-through to the disk store.

use alloc::{string::String, vec};
use bitflags::bitflags;

use super::diskfs::DiskFs;
use super::path::{normalize, parent};
use super::ramfs::RamFs;
use super::{FileMetadata, FsError, SeekFrom};
use crate::constants::fs::{MAX_FDS, READ_THROUGH_SCRATCH};

bitflags! {
    /// Open flags. Access modes are recorded but not enforced.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0x000;
        const WRONLY = 0x001;
        const RDWR = 0x002;
        const CREAT = 0x040;
        const TRUNC = 0x200;
        const APPEND = 0x400;
    }
}

#[derive(Debug, Clone)]
struct FileDesc {
    path: String,
    pos: usize,
    flags: OpenFlags,
}

pub struct FdTable {
    slots: [Option<FileDesc>; MAX_FDS],
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Make sure `path` is in ramfs, pulling it from disk if it is only there.
fn read_through(ramfs: &mut RamFs, disk: Option<&mut DiskFs>, path: &str) -> Result<bool, FsError> {
    if ramfs.exists(path) {
        return Ok(true);
    }
    let Some(disk) = disk else {
        return Ok(false);
    };

    let mut scratch = vec![0u8; READ_THROUGH_SCRATCH];
    let Ok(count) = disk.read(path, &mut scratch, 0) else {
        return Ok(false);
    };
    ramfs.mkdir_all(parent(path))?;
    ramfs.store(path, &scratch[..count])?;
    log::debug!("fdtab: pulled {} ({} bytes) from disk", path, count);
    Ok(true)
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable {
            slots: core::array::from_fn(|_| None),
        }
    }

    fn desc(&self, fd: usize) -> Result<&FileDesc, FsError> {
        self.slots
            .get(fd)
            .and_then(Option::as_ref)
            .ok_or(FsError::BadDescriptor)
    }

    fn desc_mut(&mut self, fd: usize) -> Result<&mut FileDesc, FsError> {
        self.slots
            .get_mut(fd)
            .and_then(Option::as_mut)
            .ok_or(FsError::BadDescriptor)
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn open(
        &mut self,
        ramfs: &mut RamFs,
        disk: Option<&mut DiskFs>,
        path: &str,
        flags: OpenFlags,
    ) -> Result<usize, FsError> {
        let fd = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::TooManyOpenFiles)?;
        let path = normalize("/", path);
        if ramfs.is_dir(&path) {
            return Err(FsError::IsDirectory);
        }

        let mut disk = disk;
        if read_through(ramfs, disk.as_deref_mut(), &path)? {
            if flags.contains(OpenFlags::TRUNC) {
                ramfs.truncate(&path)?;
                if let Some(disk) = disk.as_deref_mut() {
                    if disk.truncate(&path).is_err() {
                        log::debug!("fdtab: {} not on disk yet", path);
                    }
                }
            }
        } else if flags.contains(OpenFlags::CREAT) {
            ramfs.create(&path)?;
        } else {
            return Err(FsError::NotFound);
        }

        let pos = if flags.contains(OpenFlags::APPEND) {
            ramfs.get_size(&path)?
        } else {
            0
        };
        self.slots[fd] = Some(FileDesc { path, pos, flags });
        Ok(fd)
    }

    pub fn close(&mut self, fd: usize) -> Result<(), FsError> {
        self.desc(fd)?;
        self.slots[fd] = None;
        Ok(())
    }

    pub fn read(&mut self, ramfs: &RamFs, fd: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let desc = self.desc_mut(fd)?;
        let count = ramfs.read(&desc.path, buf, desc.pos)?;
        desc.pos += count;
        Ok(count)
    }

    /// Write at the descriptor position. Disk failures are logged, not returned.
    pub fn write(
        &mut self,
        ramfs: &mut RamFs,
        disk: Option<&mut DiskFs>,
        fd: usize,
        buf: &[u8],
    ) -> Result<usize, FsError> {
        let desc = self.desc_mut(fd)?;
        let count = ramfs.write(&desc.path, buf, desc.pos)?;

        if let Some(disk) = disk {
            let persisted = disk
                .create(&desc.path)
                .and_then(|()| disk.write(&desc.path, buf, desc.pos));
            match persisted {
                Ok(written) if written == count => {}
                Ok(written) => log::warn!(
                    "fdtab: {} persisted {} of {} bytes",
                    desc.path,
                    written,
                    count
                ),
                Err(err) => log::warn!("fdtab: write-through of {} failed: {}", desc.path, err),
            }
        }

        desc.pos += count;
        Ok(count)
    }

    /// Move the position. Negative results clamp to 0; past the end is allowed.
    pub fn seek(&mut self, ramfs: &RamFs, fd: usize, to: SeekFrom) -> Result<u64, FsError> {
        let desc = self.desc_mut(fd)?;
        let size = ramfs.get_size(&desc.path)? as i64;
        let target = match to {
            SeekFrom::Start(offset) => i64::try_from(offset).unwrap_or(i64::MAX),
            SeekFrom::Current(delta) => (desc.pos as i64).saturating_add(delta),
            SeekFrom::End(delta) => size.saturating_add(delta),
        };
        desc.pos = target.max(0) as usize;
        Ok(desc.pos as u64)
    }

    pub fn position(&self, fd: usize) -> Result<usize, FsError> {
        self.desc(fd).map(|desc| desc.pos)
    }

    pub fn flags(&self, fd: usize) -> Result<OpenFlags, FsError> {
        self.desc(fd).map(|desc| desc.flags)
    }

    /// Forget every descriptor.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}

/// Size and kind of `path`, pulling it from disk first if needed.
pub fn stat(ramfs: &mut RamFs, disk: Option<&mut DiskFs>, path: &str) -> Result<FileMetadata, FsError> {
    let path = normalize("/", path);
    if ramfs.is_dir(&path) {
        return Ok(FileMetadata { size: 0, is_dir: true });
    }
    if !read_through(ramfs, disk, &path)? {
        return Err(FsError::NotFound);
    }
    Ok(FileMetadata {
        size: ramfs.get_size(&path)? as u64,
        is_dir: false,
    })
}
