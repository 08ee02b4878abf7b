//! File and directory commands.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use super::{CommandResult, Invocation, StdOut};
use crate::errors::KernelError;
use crate::filesys::{
    self,
    glob::has_wildcards,
    glob_match,
    path::{file_name, normalize, parent},
    ramfs::Entry,
    resolve_path, FsError, OpenFlags, RamFs,
};

/// Target given as argument `i`, or the working directory.
fn target_or_cwd(inv: &Invocation<'_>, i: usize) -> String {
    inv.arg(i).map(resolve_path).unwrap_or_else(filesys::cwd)
}

/// If the last component of `path` is a pattern, the entries of its parent
/// that match it.
fn glob_entries(path: &str) -> Result<Option<(String, Vec<Entry>)>, FsError> {
    let pattern = file_name(path);
    if !has_wildcards(pattern) {
        return Ok(None);
    }
    let dir = String::from(parent(path));
    let mut entries = filesys::with_ramfs(|fs| fs.entries(&dir))?;
    entries.retain(|entry| glob_match(pattern, &entry.name));
    Ok(Some((dir, entries)))
}

fn entry_line(out: &mut StdOut, depth: usize, entry: &Entry) {
    for _ in 0..depth {
        out.write_bytes(b"  ");
    }
    let _ = writeln!(out, "{}{}", entry.name, if entry.is_dir { "/" } else { "" });
}

pub fn cat(inv: &mut Invocation<'_>) -> CommandResult {
    let argv = inv.argv;
    if argv.len() < 2 {
        let stdin = inv.stdin;
        inv.out.write_bytes(stdin);
        return Ok(());
    }
    for arg in &argv[1..] {
        let data = filesys::read_file(&resolve_path(arg))?;
        inv.out.write_bytes(&data);
    }
    Ok(())
}

/// There is no pager on a serial line; the whole file goes out.
pub fn more(inv: &mut Invocation<'_>) -> CommandResult {
    cat(inv)
}

pub fn ls(inv: &mut Invocation<'_>) -> CommandResult {
    let target = target_or_cwd(inv, 1);
    if let Some((_, entries)) = glob_entries(&target)? {
        if entries.is_empty() {
            return Err(KernelError::NotFound);
        }
        for entry in &entries {
            entry_line(inv.out, 0, entry);
        }
        return Ok(());
    }

    if filesys::stat(&target)?.is_dir {
        let listing = filesys::with_ramfs(|fs| fs.list(&target))?;
        inv.print(&listing);
    } else {
        inv.print(file_name(&target));
        inv.print("\n");
    }
    Ok(())
}

fn walk(fs: &RamFs, dir: &str, depth: usize, out: &mut StdOut) -> Result<(), FsError> {
    for entry in fs.entries(dir)? {
        if out.is_full() {
            break;
        }
        entry_line(out, depth, &entry);
        if entry.is_dir {
            walk(fs, &normalize(dir, &entry.name), depth + 1, out)?;
        }
    }
    Ok(())
}

pub fn tree(inv: &mut Invocation<'_>) -> CommandResult {
    let target = target_or_cwd(inv, 1);
    let out = &mut *inv.out;
    if let Some((dir, entries)) = glob_entries(&target)? {
        filesys::with_ramfs(|fs| -> Result<(), FsError> {
            for entry in &entries {
                entry_line(out, 0, entry);
                if entry.is_dir {
                    walk(fs, &normalize(&dir, &entry.name), 1, out)?;
                }
            }
            Ok(())
        })?;
        return Ok(());
    }

    if filesys::stat(&target)?.is_dir {
        filesys::with_ramfs(|fs| walk(fs, &target, 0, out))?;
    } else {
        let _ = writeln!(out, "{}", file_name(&target));
    }
    Ok(())
}

pub fn stat(inv: &mut Invocation<'_>) -> CommandResult {
    let path = resolve_path(inv.arg(1).ok_or(KernelError::Invalid)?);
    let meta = filesys::stat(&path)?;
    let kind = if meta.is_dir { "directory" } else { "file" };
    let _ = write!(inv.out, "path: {}\nsize: {}\ntype: {}\n", path, meta.size, kind);
    Ok(())
}

pub fn mkdir(inv: &mut Invocation<'_>) -> CommandResult {
    let argv = inv.argv;
    if argv.len() < 2 {
        return Err(KernelError::Invalid);
    }
    for arg in &argv[1..] {
        let path = resolve_path(arg);
        filesys::with_ramfs(|fs| fs.mkdir(&path))?;
    }
    inv.print("ok\n");
    Ok(())
}

pub fn rmdir(inv: &mut Invocation<'_>) -> CommandResult {
    let path = resolve_path(inv.arg(1).ok_or(KernelError::Invalid)?);
    if !filesys::stat(&path)?.is_dir {
        return Err(FsError::NotDirectory.into());
    }
    filesys::remove(&path, false)?;
    inv.print("ok\n");
    Ok(())
}

pub fn rm(inv: &mut Invocation<'_>) -> CommandResult {
    let argv = inv.argv;
    let (flags, paths): (Vec<&String>, Vec<&String>) =
        argv[1..].iter().partition(|arg| arg.starts_with('-') && arg.len() > 1);
    let recursive = flags.iter().any(|flag| flag.contains('r') || flag.contains('R'));
    if paths.is_empty() {
        return Err(KernelError::Invalid);
    }
    for path in paths {
        filesys::remove(&resolve_path(path), recursive)?;
    }
    inv.print("ok\n");
    Ok(())
}

/// `dst`, or `dst/<name of src>` when `dst` is a directory.
fn destination(src: &str, dst: &str) -> String {
    let dst = resolve_path(dst);
    match filesys::stat(&dst) {
        Ok(meta) if meta.is_dir => normalize(&dst, file_name(src)),
        _ => dst,
    }
}

pub fn cp(inv: &mut Invocation<'_>) -> CommandResult {
    let (Some(src), Some(dst)) = (inv.arg(1), inv.arg(2)) else {
        return Err(KernelError::Invalid);
    };
    let src = resolve_path(src);
    let data = filesys::read_file(&src)?;
    filesys::write_file(&destination(&src, dst), &data, false)?;
    inv.print("ok\n");
    Ok(())
}

pub fn mv(inv: &mut Invocation<'_>) -> CommandResult {
    let (Some(src), Some(dst)) = (inv.arg(1), inv.arg(2)) else {
        return Err(KernelError::Invalid);
    };
    let src = resolve_path(src);
    // A file that only lives on disk has to be pulled in before ramfs can move it.
    filesys::stat(&src)?;
    filesys::rename(&src, &destination(&src, dst))?;
    inv.print("ok\n");
    Ok(())
}

pub fn touch(inv: &mut Invocation<'_>) -> CommandResult {
    let argv = inv.argv;
    if argv.len() < 2 {
        return Err(KernelError::Invalid);
    }
    for arg in &argv[1..] {
        let fd = filesys::open(&resolve_path(arg), OpenFlags::WRONLY | OpenFlags::CREAT)?;
        filesys::close(fd)?;
    }
    inv.print("ok\n");
    Ok(())
}

/// `write <file> <words...>`: replace the file with the words joined by spaces.
pub fn write(inv: &mut Invocation<'_>) -> CommandResult {
    let argv = inv.argv;
    if argv.len() < 2 {
        return Err(KernelError::Invalid);
    }
    let text = argv[2..].join(" ");
    filesys::write_file(&resolve_path(&argv[1]), text.as_bytes(), false)?;
    inv.print("wrote\n");
    Ok(())
}

pub fn sync(inv: &mut Invocation<'_>) -> CommandResult {
    let count = filesys::sync()?;
    let _ = writeln!(inv.out, "synced {} files", count);
    Ok(())
}

pub fn ramfs_export(inv: &mut Invocation<'_>) -> CommandResult {
    let path = resolve_path(inv.arg(1).ok_or(KernelError::Invalid)?);
    let bytes = filesys::with_ramfs(|fs| fs.export(&path))?;
    log::debug!("ramfs-export: {} bytes to {}", bytes, path);
    inv.print("exported\n");
    Ok(())
}

pub fn ramfs_import(inv: &mut Invocation<'_>) -> CommandResult {
    let path = resolve_path(inv.arg(1).ok_or(KernelError::Invalid)?);
    // Pull the archive through the descriptor layer so one kept only on disk works too.
    filesys::stat(&path)?;
    let records = filesys::with_ramfs(|fs| fs.import(&path))?;
    log::debug!("ramfs-import: {} records from {}", records, path);
    inv.print("imported\n");
    Ok(())
}
