//! Command registry.
//!
//! Every program is a handler over its argument vector, the previous pipeline
//! stage's output, and a bounded output buffer. Handlers never print; the
//! shell decides whether the buffer goes to the console, the next stage, or
//! a file.

use alloc::{string::String, vec::Vec};
use core::fmt;
use futures::future::BoxFuture;

use crate::constants::shell::SHELL_BUF_SIZE;
use crate::errors::KernelError;

mod files;
mod system;
mod tasks;
mod text;

pub type CommandResult = Result<(), KernelError>;

/// Everything a handler gets to see.
pub struct Invocation<'a> {
    pub argv: &'a [String],
    pub stdin: &'a [u8],
    pub out: &'a mut StdOut,
}

impl Invocation<'_> {
    /// Positional argument `i`, counting the program name as 0.
    pub fn arg(&self, i: usize) -> Option<&str> {
        self.argv.get(i).map(String::as_str)
    }

    pub fn args(&self) -> impl Iterator<Item = &str> {
        self.argv.iter().skip(1).map(String::as_str)
    }

    pub fn print(&mut self, s: &str) {
        self.out.write_bytes(s.as_bytes());
    }
}

#[derive(Clone, Copy)]
pub enum Handler {
    /// Finishes without yielding.
    Now(fn(&mut Invocation<'_>) -> CommandResult),
    /// May await the scheduler, e.g. to sleep or wait on another task.
    Later(for<'a> fn(Invocation<'a>) -> BoxFuture<'a, CommandResult>),
}

pub struct Program {
    pub name: &'static str,
    pub help: &'static str,
    pub handler: Handler,
}

/// Output of one pipeline stage. Writes past the capacity are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdOut {
    buf: Vec<u8>,
    cap: usize,
}

impl StdOut {
    pub fn with_capacity(cap: usize) -> StdOut {
        StdOut { buf: Vec::new(), cap }
    }

    /// Append as much of `bytes` as fits. Returns how much did.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> usize {
        let room = self.cap - self.buf.len();
        let count = bytes.len().min(room);
        self.buf.extend_from_slice(&bytes[..count]);
        count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() == self.cap
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for StdOut {
    fn default() -> StdOut {
        StdOut::with_capacity(SHELL_BUF_SIZE)
    }
}

impl fmt::Write for StdOut {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

static PROGRAMS: &[Program] = &[
    Program { name: "cat", help: "print files or stdin", handler: Handler::Now(files::cat) },
    Program { name: "clear", help: "clear the screen", handler: Handler::Now(text::clear) },
    Program { name: "cp", help: "copy a file", handler: Handler::Now(files::cp) },
    Program { name: "echo", help: "print arguments, -e for escapes", handler: Handler::Now(text::echo) },
    Program { name: "free", help: "page and heap usage", handler: Handler::Now(system::free) },
    Program { name: "grep", help: "lines containing a pattern", handler: Handler::Now(text::grep) },
    Program { name: "head", help: "first lines, -n N", handler: Handler::Now(text::head) },
    Program { name: "help", help: "list commands", handler: Handler::Now(help) },
    Program { name: "kill", help: "stop a task by pid", handler: Handler::Now(tasks::kill) },
    Program { name: "loglevel", help: "show or set the log level", handler: Handler::Now(system::loglevel) },
    Program { name: "ls", help: "list a directory or glob", handler: Handler::Now(files::ls) },
    Program { name: "mkdir", help: "create directories", handler: Handler::Now(files::mkdir) },
    Program { name: "more", help: "page through a file", handler: Handler::Now(files::more) },
    Program { name: "mv", help: "move or rename", handler: Handler::Now(files::mv) },
    Program { name: "ps", help: "list tasks", handler: Handler::Now(tasks::ps) },
    Program { name: "ramfs-export", help: "pack the ramfs into a file", handler: Handler::Now(files::ramfs_export) },
    Program { name: "ramfs-import", help: "unpack a ramfs archive", handler: Handler::Now(files::ramfs_import) },
    Program { name: "rm", help: "remove files, -r for trees", handler: Handler::Now(files::rm) },
    Program { name: "rmdir", help: "remove an empty directory", handler: Handler::Now(files::rmdir) },
    Program { name: "sleep", help: "pause for N seconds", handler: Handler::Later(tasks::sleep) },
    Program { name: "stat", help: "size and type of a path", handler: Handler::Now(files::stat) },
    Program { name: "sync", help: "flush the ramfs to disk", handler: Handler::Now(files::sync) },
    Program { name: "systemctl", help: "manage service units", handler: Handler::Now(system::systemctl) },
    Program { name: "tail", help: "last lines, -n N", handler: Handler::Now(text::tail) },
    Program { name: "touch", help: "create empty files", handler: Handler::Now(files::touch) },
    Program { name: "tree", help: "recursive listing", handler: Handler::Now(files::tree) },
    Program { name: "wait", help: "wait for a task to finish", handler: Handler::Later(tasks::wait) },
    Program { name: "write", help: "write text to a file", handler: Handler::Now(files::write) },
];

pub fn lookup(name: &str) -> Option<&'static Program> {
    PROGRAMS.iter().find(|program| program.name == name)
}

pub fn list() -> &'static [Program] {
    PROGRAMS
}

/// Run `argv` against the registry.
///
/// Returns the number of bytes written to `out` on success and a negative
/// status on failure. Anything the handler wrote before failing stays in
/// `out`.
pub async fn dispatch(argv: &[String], stdin: &[u8], out: &mut StdOut) -> isize {
    let Some(name) = argv.first() else {
        return 0;
    };
    let Some(program) = lookup(name) else {
        out.write_bytes(b"unknown command\n");
        return KernelError::NotFound.status();
    };

    let result = match program.handler {
        Handler::Now(run) => run(&mut Invocation { argv, stdin, out: &mut *out }),
        Handler::Later(run) => run(Invocation { argv, stdin, out: &mut *out }).await,
    };
    match result {
        Ok(()) => out.len() as isize,
        Err(err) => {
            log::debug!("{}: {}", name, err);
            err.status()
        }
    }
}

fn help(inv: &mut Invocation<'_>) -> CommandResult {
    use core::fmt::Write;
    for (name, help) in crate::shell::BUILTINS {
        let _ = writeln!(inv.out, "{:<14}{}", name, help);
    }
    for program in PROGRAMS {
        let _ = writeln!(inv.out, "{:<14}{}", program.name, program.help);
    }
    Ok(())
}

/// Parse a decimal argument, rejecting anything else.
pub(crate) fn parse_number<T: core::str::FromStr>(arg: Option<&str>) -> Result<T, KernelError> {
    arg.and_then(|s| s.parse().ok()).ok_or(KernelError::Invalid)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use alloc::string::ToString;
    use core::future::Future;
    use core::pin::pin;
    use core::task::{Context, Poll};
    use futures::task::noop_waker_ref;

    pub fn argv(line: &str) -> Vec<String> {
        line.split_whitespace().map(ToString::to_string).collect()
    }

    /// Run a handler that never yields, outside the scheduler.
    pub fn run_now(line: &str, stdin: &[u8]) -> (isize, String) {
        let argv = argv(line);
        let mut out = StdOut::default();
        let mut cx = Context::from_waker(noop_waker_ref());
        let status = match pin!(dispatch(&argv, stdin, &mut out)).poll(&mut cx) {
            Poll::Ready(status) => status,
            Poll::Pending => panic!("{} yielded", line),
        };
        (status, String::from_utf8_lossy(out.as_bytes()).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::run_now;
    use super::*;
    use core::fmt::Write;

    #[test]
    fn test_stdout_truncates_at_capacity() {
        let mut out = StdOut::with_capacity(4);
        assert_eq!(out.write_bytes(b"abc"), 3);
        assert_eq!(out.write_bytes(b"def"), 1);
        assert!(out.is_full());
        write!(out, "more").unwrap();
        assert_eq!(out.as_bytes(), b"abcd");
    }

    #[test]
    fn test_registry_is_sorted_and_unique() {
        let names: Vec<&str> = list().iter().map(|p| p.name).collect();
        assert!(names.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(lookup("cat").is_some());
        assert!(lookup("cd").is_none());
    }

    #[test]
    fn test_dispatch_statuses() {
        assert_eq!(run_now("", b""), (0, String::new()));
        assert_eq!(run_now("echo hi", b""), (3, String::from("hi\n")));

        let (status, text) = run_now("frobnicate", b"");
        assert_eq!(status, KernelError::NotFound.status());
        assert_eq!(text, "unknown command\n");
    }

    #[test]
    fn test_help_lists_builtins_and_programs() {
        let (status, text) = run_now("help", b"");
        assert!(status > 0);
        assert!(text.lines().any(|line| line.starts_with("cd")));
        assert!(text.lines().any(|line| line.starts_with("systemctl")));
    }
}
