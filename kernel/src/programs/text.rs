//! Text filters. Each reads a file when one is named and stdin otherwise.

use alloc::borrow::Cow;
use alloc::string::String;

use super::{parse_number, CommandResult, Invocation};
use crate::constants::shell::{CLEAR_SCREEN, DEFAULT_LINES};
use crate::errors::KernelError;
use crate::filesys::{self, resolve_path};

/// Expand `\n`, `\t`, `\r`, `\\` and `\0`; any other escaped byte stands for itself.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

pub fn echo(inv: &mut Invocation<'_>) -> CommandResult {
    let argv = inv.argv;
    let (escapes, words) = match argv.get(1).map(String::as_str) {
        Some("-e") => (true, &argv[2..]),
        _ => (false, argv.get(1..).unwrap_or(&[])),
    };
    let mut line = words.join(" ");
    if escapes {
        line = unescape(&line);
    }
    line.push('\n');
    inv.print(&line);
    Ok(())
}

/// Line count and optional file from `-n N`, `-N` and a path, in any order.
fn line_args(inv: &Invocation<'_>) -> Result<(usize, Option<String>), KernelError> {
    let mut lines = DEFAULT_LINES;
    let mut file = None;
    let mut args = inv.argv.iter().skip(1).map(String::as_str);
    while let Some(arg) = args.next() {
        match arg.strip_prefix('-') {
            Some("n") => lines = parse_number(args.next())?,
            Some(count) if !count.is_empty() => lines = parse_number(Some(count))?,
            _ => file = Some(resolve_path(arg)),
        }
    }
    Ok((lines, file))
}

/// File contents, or stdin when no file was named.
fn input<'a>(inv: &Invocation<'a>, file: Option<&str>) -> Result<Cow<'a, [u8]>, KernelError> {
    match file {
        Some(path) => Ok(Cow::Owned(filesys::read_file(path)?)),
        None => Ok(Cow::Borrowed(inv.stdin)),
    }
}

pub fn head(inv: &mut Invocation<'_>) -> CommandResult {
    let (lines, file) = line_args(inv)?;
    let data = input(inv, file.as_deref())?;
    let end = data
        .iter()
        .enumerate()
        .filter(|&(_, &b)| b == b'\n')
        .nth(lines.wrapping_sub(1))
        .map_or(data.len(), |(i, _)| i + 1);
    let end = if lines == 0 { 0 } else { end };
    inv.out.write_bytes(&data[..end]);
    Ok(())
}

pub fn tail(inv: &mut Invocation<'_>) -> CommandResult {
    let (lines, file) = line_args(inv)?;
    let data = input(inv, file.as_deref())?;
    // A trailing newline closes the last line rather than starting an empty one.
    let body = data.strip_suffix(b"\n").unwrap_or(&data[..]);
    let start = if lines == 0 {
        data.len()
    } else {
        body.iter()
            .enumerate()
            .rev()
            .filter(|&(_, &b)| b == b'\n')
            .nth(lines - 1)
            .map_or(0, |(i, _)| i + 1)
    };
    inv.out.write_bytes(&data[start..]);
    Ok(())
}

/// Lines containing the pattern as a substring.
pub fn grep(inv: &mut Invocation<'_>) -> CommandResult {
    let argv = inv.argv;
    let pattern = argv.get(1).ok_or(KernelError::Invalid)?.as_bytes();
    let file = argv.get(2).map(|path| resolve_path(path));
    let data = input(inv, file.as_deref())?;
    for line in data.split(|&b| b == b'\n' || b == b'\r') {
        if line.is_empty() || !contains(line, pattern) {
            continue;
        }
        if inv.out.write_bytes(line) < line.len() || inv.out.write_bytes(b"\n") == 0 {
            break;
        }
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

pub fn clear(inv: &mut Invocation<'_>) -> CommandResult {
    inv.out.write_bytes(CLEAR_SCREEN);
    Ok(())
}
