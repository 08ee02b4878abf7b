//! In-memory filesystem keyed by normalised absolute path.
//!
//! Directories are explicit nodes; `/` always exists. A path is a file or a
//! directory, never both. Callers pass absolute paths; anything else is
//! normalised against `/`.

use alloc::{collections::BTreeMap, string::String, vec, vec::Vec};
use core::ops::Bound;

use super::path::{normalize, parent};
use super::FsError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(Vec<u8>),
    Dir,
}

/// One immediate child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Default)]
pub struct RamFs {
    nodes: BTreeMap<String, Node>,
}

fn key(path: &str) -> String {
    normalize("/", path)
}

/// Prefix shared by everything strictly below `dir`.
fn child_prefix(dir: &str) -> String {
    let mut prefix = String::from(dir);
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

impl RamFs {
    pub const fn new() -> RamFs {
        RamFs {
            nodes: BTreeMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn exists(&self, path: &str) -> bool {
        let path = key(path);
        path == "/" || self.nodes.contains_key(&path)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let path = key(path);
        path == "/" || matches!(self.nodes.get(&path), Some(Node::Dir))
    }

    /// Fail unless the parent of `path` is an existing directory.
    fn check_parent(&self, path: &str) -> Result<(), FsError> {
        let dir = parent(path);
        if self.is_dir(dir) {
            Ok(())
        } else if self.exists(dir) {
            Err(FsError::NotDirectory)
        } else {
            Err(FsError::NotFound)
        }
    }

    /// New empty file. The parent directory must exist.
    pub fn create(&mut self, path: &str) -> Result<(), FsError> {
        let path = key(path);
        if self.exists(&path) {
            return Err(FsError::AlreadyExists);
        }
        self.check_parent(&path)?;
        self.nodes.insert(path, Node::File(Vec::new()));
        Ok(())
    }

    /// New directory, creating missing parents along the way.
    pub fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        let path = key(path);
        if self.exists(&path) {
            return Err(FsError::AlreadyExists);
        }
        self.mkdir_all(&path)
    }

    /// Like `mkdir`, but an existing directory is fine.
    pub fn mkdir_all(&mut self, path: &str) -> Result<(), FsError> {
        let path = key(path);
        let mut at = 0;
        while at + 1 < path.len() {
            let end = path[at + 1..].find('/').map_or(path.len(), |i| i + at + 1);
            let prefix = &path[..end];
            match self.nodes.get(prefix) {
                Some(Node::Dir) => {}
                Some(Node::File(_)) => return Err(FsError::NotDirectory),
                None => {
                    self.nodes.insert(String::from(prefix), Node::Dir);
                }
            }
            at = end;
        }
        Ok(())
    }

    fn file_mut(&mut self, path: &str) -> Result<&mut Vec<u8>, FsError> {
        match self.nodes.get_mut(&key(path)) {
            Some(Node::File(data)) => Ok(data),
            Some(Node::Dir) => Err(FsError::IsDirectory),
            None if key(path) == "/" => Err(FsError::IsDirectory),
            None => Err(FsError::NotFound),
        }
    }

    fn file(&self, path: &str) -> Result<&Vec<u8>, FsError> {
        let path = key(path);
        match self.nodes.get(&path) {
            Some(Node::File(data)) => Ok(data),
            Some(Node::Dir) => Err(FsError::IsDirectory),
            None if path == "/" => Err(FsError::IsDirectory),
            None => Err(FsError::NotFound),
        }
    }

    /// Write `buf` at `offset`, growing the file (zero filled) as needed.
    pub fn write(&mut self, path: &str, buf: &[u8], offset: usize) -> Result<usize, FsError> {
        let data = self.file_mut(path)?;
        let end = offset.checked_add(buf.len()).ok_or(FsError::NoSpace)?;
        if end > data.len() {
            data.try_reserve(end - data.len()).map_err(|_| FsError::NoSpace)?;
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    /// Copy from `offset` into `buf`; 0 at or past the end.
    pub fn read(&self, path: &str, buf: &mut [u8], offset: usize) -> Result<usize, FsError> {
        let data = self.file(path)?;
        if offset >= data.len() {
            return Ok(0);
        }
        let count = buf.len().min(data.len() - offset);
        buf[..count].copy_from_slice(&data[offset..offset + count]);
        Ok(count)
    }

    /// Whole contents of a file.
    pub fn contents(&self, path: &str) -> Result<&[u8], FsError> {
        self.file(path).map(Vec::as_slice)
    }

    /// Replace a file's contents, creating it if needed.
    pub fn store(&mut self, path: &str, data: &[u8]) -> Result<(), FsError> {
        match self.create(path) {
            Ok(()) | Err(FsError::AlreadyExists) => {}
            Err(err) => return Err(err),
        }
        let file = self.file_mut(path)?;
        file.clear();
        file.extend_from_slice(data);
        Ok(())
    }

    pub fn truncate(&mut self, path: &str) -> Result<(), FsError> {
        self.file_mut(path)?.clear();
        Ok(())
    }

    /// File size in bytes; directories report 0.
    pub fn get_size(&self, path: &str) -> Result<usize, FsError> {
        match self.file(path) {
            Ok(data) => Ok(data.len()),
            Err(FsError::IsDirectory) => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn has_children(&self, dir: &str) -> bool {
        let prefix = child_prefix(dir);
        self.nodes
            .range::<str, _>((Bound::Excluded(prefix.as_str()), Bound::Unbounded))
            .next()
            .is_some_and(|(path, _)| path.starts_with(&prefix))
    }

    /// Remove a file or an empty directory.
    pub fn remove(&mut self, path: &str) -> Result<(), FsError> {
        let path = key(path);
        if path == "/" {
            return Err(FsError::InvalidName);
        }
        match self.nodes.get(&path) {
            None => Err(FsError::NotFound),
            Some(Node::Dir) if self.has_children(&path) => Err(FsError::NotEmpty),
            Some(_) => {
                self.nodes.remove(&path);
                Ok(())
            }
        }
    }

    /// Remove `path` and everything below it. Returns how many nodes went.
    pub fn remove_recursive(&mut self, path: &str) -> Result<usize, FsError> {
        let path = key(path);
        if path == "/" {
            return Err(FsError::InvalidName);
        }
        let prefix = child_prefix(&path);
        let before = self.nodes.len();
        self.nodes
            .retain(|name, _| *name != path && !name.starts_with(&prefix));
        match before - self.nodes.len() {
            0 => Err(FsError::NotFound),
            removed => Ok(removed),
        }
    }

    /// Move a file or a whole directory tree.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError> {
        let (from, to) = (key(from), key(to));
        if from == "/" || !self.nodes.contains_key(&from) {
            return Err(FsError::NotFound);
        }
        if self.exists(&to) {
            return Err(FsError::AlreadyExists);
        }
        let prefix = child_prefix(&from);
        if to.starts_with(&prefix) {
            return Err(FsError::InvalidName);
        }
        self.check_parent(&to)?;

        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|name| **name == from || name.starts_with(&prefix))
            .cloned()
            .collect();
        for name in moved {
            if let Some(node) = self.nodes.remove(&name) {
                let mut target = to.clone();
                target.push_str(&name[from.len()..]);
                self.nodes.insert(target, node);
            }
        }
        Ok(())
    }

    /// Immediate children of `dir`, in name order.
    pub fn entries(&self, dir: &str) -> Result<Vec<Entry>, FsError> {
        let dir = key(dir);
        if !self.exists(&dir) {
            return Err(FsError::NotFound);
        }
        if !self.is_dir(&dir) {
            return Err(FsError::NotDirectory);
        }
        let prefix = child_prefix(&dir);
        Ok(self
            .nodes
            .range::<str, _>((Bound::Excluded(prefix.as_str()), Bound::Unbounded))
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter(|(path, _)| !path[prefix.len()..].contains('/'))
            .map(|(path, node)| Entry {
                name: String::from(&path[prefix.len()..]),
                is_dir: *node == Node::Dir,
            })
            .collect())
    }

    /// Newline-separated children of `dir`; directories carry a trailing `/`.
    pub fn list(&self, dir: &str) -> Result<String, FsError> {
        let mut out = String::new();
        for entry in self.entries(dir)? {
            out.push_str(&entry.name);
            if entry.is_dir {
                out.push('/');
            }
            out.push('\n');
        }
        Ok(out)
    }

    /// Absolute paths of every file, in order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.nodes.iter().filter_map(|(path, node)| match node {
            Node::File(data) => Some((path.as_str(), data.as_slice())),
            Node::Dir => None,
        })
    }

    /// Bytes held in file contents, and the node count.
    pub fn usage(&self) -> (usize, usize) {
        let bytes = self.files().map(|(_, data)| data.len()).sum();
        (bytes, self.nodes.len())
    }

    /// Serialise every node except `path` itself into the file at `path`.
    ///
    /// Each record is `name_len: u32 LE, name, data_len: u32 LE, data`;
    /// directories are stored with a trailing `/` and no data. A zero
    /// `name_len` ends the stream.
    pub fn export(&mut self, path: &str) -> Result<usize, FsError> {
        let target = key(path);
        let mut image = Vec::new();
        for (name, node) in self.nodes.iter().filter(|(name, _)| **name != target) {
            let (name_bytes, data): (Vec<u8>, &[u8]) = match node {
                Node::Dir => {
                    let mut dir = name.clone().into_bytes();
                    dir.push(b'/');
                    (dir, &[])
                }
                Node::File(data) => (name.clone().into_bytes(), data),
            };
            image.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
            image.extend_from_slice(&name_bytes);
            image.extend_from_slice(&(data.len() as u32).to_le_bytes());
            image.extend_from_slice(data);
        }
        image.extend_from_slice(&0u32.to_le_bytes());
        self.store(&target, &image)?;
        Ok(image.len())
    }

    /// Load records written by `export`, replacing files that already exist.
    /// Returns how many records were applied; a truncated tail is ignored.
    pub fn import(&mut self, path: &str) -> Result<usize, FsError> {
        let image = self.contents(path)?.to_vec();
        let mut at = 0;
        let mut applied = 0;
        let next_u32 = |at: &mut usize| -> Option<usize> {
            let bytes = image.get(*at..*at + 4)?;
            *at += 4;
            Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
        };

        let mut records = vec![];
        while let Some(name_len) = next_u32(&mut at) {
            if name_len == 0 {
                break;
            }
            let Some(name) = image.get(at..at + name_len) else {
                break;
            };
            let name = String::from_utf8_lossy(name).into_owned();
            at += name_len;
            let Some(data_len) = next_u32(&mut at) else {
                break;
            };
            let Some(data) = image.get(at..at + data_len) else {
                break;
            };
            at += data_len;
            records.push((name, data));
        }

        for (name, data) in records {
            let result = if name.ends_with('/') {
                self.mkdir_all(&name)
            } else {
                self.mkdir_all(parent(&key(&name)))
                    .and_then(|()| self.store(&name, data))
            };
            match result {
                Ok(()) => applied += 1,
                Err(err) => log::warn!("ramfs: import of {} failed: {}", name, err),
            }
        }
        Ok(applied)
    }
}
