//! Flat persistent store over a block device.
//!
//! Layout, in 512-byte sectors:
//!
//! * sector 0: unused
//! * sectors 1..: directory table of `DISK_DIR_ENTRIES` records of
//!   `{ name: [u8; 64] NUL padded, size: u32 LE, start_sector: u32 LE }`
//! * sector 128 onwards: file data, a fixed extent of `DISK_FILE_SECTORS`
//!   per directory slot
//!
//! Names are absolute ramfs paths; there are no directories on disk.

use alloc::{boxed::Box, string::String, vec, vec::Vec};

use super::path::parent;
use super::ramfs::RamFs;
use super::{BlockDevice, FsError};
use crate::constants::fs::{
    DISK_DATA_START_SECTOR, DISK_DIR_ENTRIES, DISK_DIR_ENTRY_SIZE, DISK_DIR_START_SECTOR,
    DISK_FILE_SECTORS, DISK_NAME_LEN, SECTOR_SIZE,
};

const TABLE_BYTES: usize = DISK_DIR_ENTRIES * DISK_DIR_ENTRY_SIZE;
const TABLE_SECTORS: u64 = TABLE_BYTES.div_ceil(SECTOR_SIZE) as u64;
/// Largest file a slot can hold.
pub const DISK_FILE_CAPACITY: usize = DISK_FILE_SECTORS as usize * SECTOR_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
struct DiskEntry {
    name: String,
    size: u32,
    start_sector: u32,
}

impl DiskEntry {
    fn decode(raw: &[u8]) -> Option<DiskEntry> {
        let name = &raw[..DISK_NAME_LEN];
        let len = name.iter().position(|&b| b == 0).unwrap_or(DISK_NAME_LEN);
        if len == 0 {
            return None;
        }
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        Some(DiskEntry {
            name: String::from_utf8_lossy(&name[..len]).into_owned(),
            size: word(DISK_NAME_LEN),
            start_sector: word(DISK_NAME_LEN + 4),
        })
    }

    fn encode(&self, raw: &mut [u8]) {
        raw.fill(0);
        raw[..self.name.len()].copy_from_slice(self.name.as_bytes());
        raw[DISK_NAME_LEN..DISK_NAME_LEN + 4].copy_from_slice(&self.size.to_le_bytes());
        raw[DISK_NAME_LEN + 4..DISK_DIR_ENTRY_SIZE].copy_from_slice(&self.start_sector.to_le_bytes());
    }
}

pub struct DiskFs {
    device: Box<dyn BlockDevice>,
    /// In-memory copy of the directory table, one slot per record.
    dir: Vec<Option<DiskEntry>>,
}

impl DiskFs {
    /// Read the directory table from `device`.
    pub fn mount(device: Box<dyn BlockDevice>) -> Result<DiskFs, FsError> {
        if device.block_size() != SECTOR_SIZE {
            return Err(FsError::NotSupported);
        }
        if device.total_blocks() < DISK_DATA_START_SECTOR {
            return Err(FsError::NoSpace);
        }

        let mut table = vec![0u8; TABLE_SECTORS as usize * SECTOR_SIZE];
        for (i, sector) in table.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            device.read_block(DISK_DIR_START_SECTOR + i as u64, sector)?;
        }
        let dir: Vec<Option<DiskEntry>> = table[..TABLE_BYTES]
            .chunks_exact(DISK_DIR_ENTRY_SIZE)
            .map(DiskEntry::decode)
            .collect();

        let fs = DiskFs { device, dir };
        log::info!("diskfs: mounted, {} files found", fs.file_count());
        Ok(fs)
    }

    pub fn file_count(&self) -> usize {
        self.dir.iter().flatten().count()
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.dir
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|entry| entry.name == name))
    }

    fn entry(&self, name: &str) -> Result<(usize, &DiskEntry), FsError> {
        let slot = self.find(name).ok_or(FsError::NotFound)?;
        let entry = self.dir[slot].as_ref().ok_or(FsError::NotFound)?;
        Ok((slot, entry))
    }

    fn save_dir(&mut self) -> Result<(), FsError> {
        let mut table = vec![0u8; TABLE_SECTORS as usize * SECTOR_SIZE];
        for (slot, raw) in self.dir.iter().zip(table.chunks_exact_mut(DISK_DIR_ENTRY_SIZE)) {
            if let Some(entry) = slot {
                entry.encode(raw);
            }
        }
        for (i, sector) in table.chunks_exact(SECTOR_SIZE).enumerate() {
            self.device.write_block(DISK_DIR_START_SECTOR + i as u64, sector)?;
        }
        Ok(())
    }

    /// Make sure `name` has a directory slot. Existing files are left alone.
    pub fn create(&mut self, name: &str) -> Result<(), FsError> {
        if self.find(name).is_some() {
            return Ok(());
        }
        if name.is_empty() || name.len() >= DISK_NAME_LEN || name.contains('\0') {
            return Err(FsError::InvalidName);
        }
        let slot = self
            .dir
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::NoSpace)?;
        self.dir[slot] = Some(DiskEntry {
            name: String::from(name),
            size: 0,
            start_sector: (DISK_DATA_START_SECTOR + slot as u64 * DISK_FILE_SECTORS) as u32,
        });
        self.save_dir()
    }

    /// Write `buf` at `offset` inside the file's extent.
    pub fn write(&mut self, name: &str, buf: &[u8], offset: usize) -> Result<usize, FsError> {
        let (slot, entry) = self.entry(name)?;
        let end = offset.checked_add(buf.len()).ok_or(FsError::NoSpace)?;
        if end > DISK_FILE_CAPACITY {
            return Err(FsError::NoSpace);
        }
        let (start, size) = (entry.start_sector as u64, entry.size as usize);
        self.write_span(start, offset, buf)?;

        if end > size {
            if let Some(entry) = self.dir[slot].as_mut() {
                entry.size = end as u32;
            }
            self.save_dir()?;
        }
        Ok(buf.len())
    }

    /// Copy up to `buf.len()` bytes from `offset`; 0 at or past the end.
    pub fn read(&self, name: &str, buf: &mut [u8], offset: usize) -> Result<usize, FsError> {
        let (_, entry) = self.entry(name)?;
        let size = entry.size as usize;
        if offset >= size {
            return Ok(0);
        }
        let count = buf.len().min(size - offset);
        self.read_span(entry.start_sector as u64, offset, &mut buf[..count])?;
        Ok(count)
    }

    pub fn size(&self, name: &str) -> Result<usize, FsError> {
        self.entry(name).map(|(_, entry)| entry.size as usize)
    }

    /// Replace the whole file with `data`.
    pub fn store(&mut self, name: &str, data: &[u8]) -> Result<(), FsError> {
        self.create(name)?;
        self.truncate(name)?;
        self.write(name, data, 0).map(|_| ())
    }

    pub fn truncate(&mut self, name: &str) -> Result<(), FsError> {
        let (slot, _) = self.entry(name)?;
        if let Some(entry) = self.dir[slot].as_mut() {
            entry.size = 0;
        }
        self.save_dir()
    }

    pub fn remove(&mut self, name: &str) -> Result<(), FsError> {
        let (slot, _) = self.entry(name)?;
        self.dir[slot] = None;
        self.save_dir()
    }

    /// Drop `path` and every file stored below it. Returns how many went.
    pub fn remove_tree(&mut self, path: &str) -> Result<usize, FsError> {
        let mut prefix = String::from(path.trim_end_matches('/'));
        prefix.push('/');
        let mut removed = 0;
        for slot in self.dir.iter_mut() {
            let doomed = slot
                .as_ref()
                .is_some_and(|entry| entry.name == path || entry.name.starts_with(&prefix));
            if doomed {
                *slot = None;
                removed += 1;
            }
        }
        if removed > 0 {
            self.save_dir()?;
        }
        Ok(removed)
    }

    /// Names and sizes of every stored file, in slot order.
    pub fn files(&self) -> impl Iterator<Item = (&str, usize)> {
        self.dir
            .iter()
            .flatten()
            .map(|entry| (entry.name.as_str(), entry.size as usize))
    }

    /// Copy every stored file into `ramfs`, creating parent directories.
    pub fn load_into(&self, ramfs: &mut RamFs) -> usize {
        let mut loaded = 0;
        for (name, size) in self.files() {
            let mut data = vec![0u8; size];
            let result = self
                .read(name, &mut data, 0)
                .and_then(|_| ramfs.mkdir_all(parent(name)))
                .and_then(|()| ramfs.store(name, &data));
            match result {
                Ok(()) => loaded += 1,
                Err(err) => log::warn!("diskfs: could not load {}: {}", name, err),
            }
        }
        log::info!("diskfs: loaded {} files into ramfs", loaded);
        loaded
    }

    /// Persist every ramfs file. Returns how many were written.
    pub fn sync_from(&mut self, ramfs: &RamFs) -> usize {
        let mut synced = 0;
        for (name, data) in ramfs.files() {
            match self.store(name, data) {
                Ok(()) => synced += 1,
                Err(err) => log::warn!("diskfs: could not sync {}: {}", name, err),
            }
        }
        synced
    }

    fn write_span(&mut self, start_sector: u64, offset: usize, data: &[u8]) -> Result<(), FsError> {
        let mut sector = [0u8; SECTOR_SIZE];
        let mut done = 0;
        while done < data.len() {
            let at = offset + done;
            let lba = start_sector + (at / SECTOR_SIZE) as u64;
            let skip = at % SECTOR_SIZE;
            let count = (SECTOR_SIZE - skip).min(data.len() - done);
            if count < SECTOR_SIZE {
                self.device.read_block(lba, &mut sector)?;
            }
            sector[skip..skip + count].copy_from_slice(&data[done..done + count]);
            self.device.write_block(lba, &sector)?;
            done += count;
        }
        Ok(())
    }

    fn read_span(&self, start_sector: u64, offset: usize, out: &mut [u8]) -> Result<(), FsError> {
        let mut sector = [0u8; SECTOR_SIZE];
        let mut done = 0;
        while done < out.len() {
            let at = offset + done;
            let lba = start_sector + (at / SECTOR_SIZE) as u64;
            let skip = at % SECTOR_SIZE;
            let count = (SECTOR_SIZE - skip).min(out.len() - done);
            self.device.read_block(lba, &mut sector)?;
            out[done..done + count].copy_from_slice(&sector[skip..skip + count]);
            done += count;
        }
        Ok(())
    }
}
