//! Service units.
//!
//! A unit is a file under `/etc/systemd/system` whose `ExecStart=` line is a
//! shell command, optionally ending in `> target` or `>> target`. Starting a
//! unit runs that command once as a task of its own; the unit counts as
//! active while the task is alive.

use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::fmt::Write;
use spin::Mutex;

use crate::constants::fs::{UNIT_DIR, UNIT_SUFFIX};
use crate::devices::console::SerialTerminal;
use crate::errors::KernelError;
use crate::filesys::{
    self,
    path::{file_name, normalize, parent},
    resolve_path,
};
use crate::sched::{self, Pid};
use crate::shell::{self, Job, Redirect};

const EXEC_KEY: &str = "ExecStart=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub name: String,
    pub path: String,
    /// Command line without its redirection.
    pub exec: String,
    pub output: Option<Redirect>,
    pub enabled: bool,
    /// Task running the unit, 0 when stopped.
    pub pid: Pid,
}

impl Unit {
    pub fn is_active(&self) -> bool {
        self.pid != 0 && sched::exists(self.pid)
    }
}

static UNITS: Mutex<Vec<Unit>> = Mutex::new(Vec::new());

/// Unit name from a path or argument: the file name up to its first dot.
pub fn unit_name(arg: &str) -> &str {
    let base = file_name(arg.trim_end_matches('/'));
    base.split('.').next().unwrap_or(base)
}

/// Where the unit file for `arg` lives. Bare names map into the unit directory.
pub fn unit_path(arg: &str) -> String {
    if arg.contains('/') {
        return resolve_path(arg);
    }
    let name = arg.strip_suffix(UNIT_SUFFIX).unwrap_or(arg);
    format!("{}/{}{}", UNIT_DIR, name, UNIT_SUFFIX)
}

/// Pull the command and its redirection out of a unit file.
pub fn parse_unit(text: &str) -> Result<(String, Option<Redirect>), KernelError> {
    let exec = text
        .lines()
        .find_map(|line| line.trim_start().strip_prefix(EXEC_KEY))
        .map(str::trim)
        .filter(|exec| !exec.is_empty())
        .ok_or(KernelError::Invalid)?;

    let Some(at) = exec.find('>') else {
        return Ok((exec.to_string(), None));
    };
    let (command, rest) = exec.split_at(at);
    let (append, target) = match rest.strip_prefix(">>") {
        Some(target) => (true, target),
        None => (false, &rest[1..]),
    };
    let target = target.trim().trim_matches(|c: char| c == '"' || c == '\'');
    let output = (!target.is_empty()).then(|| Redirect {
        path: normalize("/", target),
        append,
    });
    Ok((command.trim_end().to_string(), output))
}

/// Read the unit at `path` into the table, replacing an older copy but
/// keeping its running task and enable flag. Returns the unit name.
pub fn load_unit(path: &str) -> Result<String, KernelError> {
    let text = filesys::read_file(path)?;
    let text = core::str::from_utf8(&text).map_err(|_| KernelError::Invalid)?;
    let (exec, output) = parse_unit(text)?;
    let name = unit_name(path).to_string();

    let mut units = UNITS.lock();
    match units.iter_mut().find(|unit| unit.name == name) {
        Some(unit) => {
            unit.path = path.to_string();
            unit.exec = exec;
            unit.output = output;
        }
        None => units.push(Unit {
            name: name.clone(),
            path: path.to_string(),
            exec,
            output,
            enabled: false,
            pid: 0,
        }),
    }
    log::debug!("services: loaded {} from {}", name, path);
    Ok(name)
}

/// Load every file in the unit directory. Returns how many parsed.
pub fn load_all() -> usize {
    let entries = match filesys::with_ramfs(|fs| fs.entries(UNIT_DIR)) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("services: cannot list {}: {}", UNIT_DIR, err);
            return 0;
        }
    };
    entries
        .iter()
        .filter(|entry| !entry.is_dir)
        .filter(|entry| {
            let path = format!("{}/{}", UNIT_DIR, entry.name);
            match load_unit(&path) {
                Ok(_) => true,
                Err(err) => {
                    log::warn!("services: skipping {}: {}", path, err);
                    false
                }
            }
        })
        .count()
}

/// Forget every unit and load the unit directory afresh.
pub fn init() -> usize {
    UNITS.lock().clear();
    let count = load_all();
    log::info!("services: {} units loaded", count);
    count
}

/// Apply `f` to the unit called `arg`, loading its file first if it is not known yet.
fn with_unit<F, R>(arg: &str, f: F) -> Result<R, KernelError>
where
    F: FnOnce(&mut Unit) -> R,
{
    let name = unit_name(arg).to_string();
    if !UNITS.lock().iter().any(|unit| unit.name == name) {
        load_unit(&unit_path(arg))?;
    }
    let mut units = UNITS.lock();
    let unit = units
        .iter_mut()
        .find(|unit| unit.name == name)
        .ok_or(KernelError::NotFound)?;
    Ok(f(unit))
}

async fn run_unit(name: String, job: Job) -> i32 {
    let command = job.stages.first().map(|argv| argv.join(" ")).unwrap_or_default();
    log::info!("services: {} running `{}`", name, command);
    if let Some(output) = &job.redirect {
        if let Err(err) = filesys::with_ramfs(|fs| fs.mkdir_all(parent(&output.path))) {
            log::warn!("services: {}: no directory for {}: {}", name, output.path, err);
        }
    }
    let status = shell::run_job(&job, &mut SerialTerminal).await;

    let me = sched::current_pid();
    if let Some(unit) = UNITS.lock().iter_mut().find(|unit| unit.name == name) {
        if Some(unit.pid) == me {
            unit.pid = 0;
        }
    }
    log::info!("services: {} finished with status {}", name, status);
    i32::try_from(status).unwrap_or(i32::MIN)
}

/// Start the unit unless it is already running. Returns its task.
pub fn start(arg: &str) -> Result<Pid, KernelError> {
    let (name, exec, output, running) = with_unit(arg, |unit| {
        let running = unit.is_active().then_some(unit.pid);
        (unit.name.clone(), unit.exec.clone(), unit.output.clone(), running)
    })?;
    if let Some(pid) = running {
        return Ok(pid);
    }

    let mut job = shell::parse(&exec)
        .map_err(|err| {
            log::warn!("services: {}: bad ExecStart: {}", name, err);
            KernelError::Invalid
        })?
        .ok_or(KernelError::Invalid)?;
    if output.is_some() {
        job.redirect = output;
    }
    job.background = false;

    let pid = sched::spawn_isolated(&name, run_unit(name.clone(), job))
        .ok_or(KernelError::OutOfMemory)?;
    with_unit(&name, |unit| unit.pid = pid)?;
    Ok(pid)
}

/// Kill the unit's task if it has one.
pub fn stop(arg: &str) -> Result<(), KernelError> {
    let pid = with_unit(arg, |unit| core::mem::take(&mut unit.pid))?;
    if pid != 0 {
        if let Err(err) = sched::kill(pid) {
            log::debug!("services: pid {} already gone: {}", pid, err);
        }
    }
    Ok(())
}

pub fn restart(arg: &str) -> Result<Pid, KernelError> {
    stop(arg)?;
    start(arg)
}

/// Re-read the unit file.
pub fn reload(arg: &str) -> Result<(), KernelError> {
    let path = with_unit(arg, |unit| unit.path.clone())?;
    load_unit(&path).map(|_| ())
}

pub fn set_enabled(arg: &str, enabled: bool) -> Result<(), KernelError> {
    with_unit(arg, |unit| unit.enabled = enabled)
}

pub fn is_active(arg: &str) -> bool {
    with_unit(arg, |unit| unit.is_active()).unwrap_or(false)
}

/// Human-readable state of one unit.
pub fn status(arg: &str) -> Result<String, KernelError> {
    with_unit(arg, |unit| {
        let mut text = String::new();
        let _ = writeln!(text, "Name: {}", unit.name);
        let _ = writeln!(text, "Unit: {}", unit.path);
        let _ = write!(text, "Exec: {}", unit.exec);
        if let Some(output) = &unit.output {
            let _ = write!(text, " {} {}", if output.append { ">>" } else { ">" }, output.path);
        }
        let _ = writeln!(text);
        let _ = writeln!(text, "Enabled: {}", if unit.enabled { "yes" } else { "no" });
        match unit.is_active() {
            true => {
                let _ = writeln!(text, "Active: running (pid {})", unit.pid);
            }
            false => {
                let _ = writeln!(text, "Active: inactive");
            }
        }
        text
    })
}

/// One line per loaded unit.
pub fn list() -> String {
    let units = UNITS.lock();
    let mut text = String::new();
    let _ = writeln!(text, "{:<16}{:<10}{}", "UNIT", "ACTIVE", "ENABLED");
    for unit in units.iter() {
        let active = if unit.is_active() { "running" } else { "inactive" };
        let enabled = if unit.enabled { "yes" } else { "no" };
        let _ = writeln!(text, "{:<16}{:<10}{}", unit.name, active, enabled);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::console;
    use crate::test_support::lock_globals;
    use std::sync::MutexGuard;

    fn setup() -> MutexGuard<'static, ()> {
        let guard = lock_globals();
        sched::init();
        console::init();
        filesys::init_with_device(None).unwrap();
        init();
        guard
    }

    fn install(name: &str, body: &str) {
        let path = format!("{}/{}{}", UNIT_DIR, name, UNIT_SUFFIX);
        filesys::write_file(&path, body.as_bytes(), false).unwrap();
    }

    #[test]
    fn test_names_and_paths() {
        assert_eq!(unit_name("/etc/systemd/system/motd.service"), "motd");
        assert_eq!(unit_name("motd"), "motd");
        assert_eq!(unit_path("motd"), "/etc/systemd/system/motd.service");
        assert_eq!(unit_path("motd.service"), "/etc/systemd/system/motd.service");
    }

    #[test]
    fn test_parse_unit() {
        let (exec, output) = parse_unit("[Service]\nExecStart=echo hi > \"var/log/hi\"\n").unwrap();
        assert_eq!(exec, "echo hi");
        assert_eq!(output, Some(Redirect { path: "/var/log/hi".into(), append: false }));

        let (exec, output) = parse_unit("ExecStart= ps >> /tmp/ps.log").unwrap();
        assert_eq!(exec, "ps");
        assert_eq!(output, Some(Redirect { path: "/tmp/ps.log".into(), append: true }));

        assert_eq!(parse_unit("ExecStart=free").unwrap(), ("free".into(), None));
        assert_eq!(parse_unit("Description=nothing"), Err(KernelError::Invalid));
        assert_eq!(parse_unit("ExecStart=   "), Err(KernelError::Invalid));
    }

    #[test]
    fn test_start_runs_once_into_target() {
        let _guard = setup();
        install("greet", "ExecStart=echo hello > /var/greet\n");
        assert_eq!(load_all(), 1);

        let pid = start("greet").unwrap();
        assert!(is_active("greet"));
        assert_eq!(start("greet"), Ok(pid));
        sched::run_until_idle();

        assert!(!is_active("greet"));
        assert_eq!(filesys::read_file("/var/greet").unwrap(), b"hello\n");
        assert!(status("greet").unwrap().ends_with("Active: inactive\n"));
    }

    #[test]
    fn test_stop_kills_running_unit() {
        let _guard = setup();
        install("nap", "ExecStart=sleep 10");
        let pid = start("nap").unwrap();
        sched::dispatch_next();
        assert!(status("nap").unwrap().contains("Active: running"));

        stop("nap").unwrap();
        sched::run_until_idle();
        assert!(!sched::exists(pid));
        assert!(!is_active("nap"));
        stop("nap").unwrap();
    }

    #[test]
    fn test_status_enable_and_list() {
        let _guard = setup();
        install("motd", "ExecStart=echo hi >> /tmp/motd");
        set_enabled("motd", true).unwrap();
        assert_eq!(
            status("motd").unwrap(),
            "Name: motd\nUnit: /etc/systemd/system/motd.service\nExec: echo hi >> /tmp/motd\nEnabled: yes\nActive: inactive\n"
        );
        assert_eq!(list(), "UNIT            ACTIVE    ENABLED\nmotd            inactive  yes\n");
        assert_eq!(status("ghost"), Err(KernelError::NotFound));
    }

    #[test]
    fn test_reload_picks_up_edits() {
        let _guard = setup();
        install("job", "ExecStart=echo one > /tmp/out");
        start("job").unwrap();
        sched::run_until_idle();
        install("job", "ExecStart=echo two > /tmp/out");
        reload("job").unwrap();
        restart("job").unwrap();
        sched::run_until_idle();
        assert_eq!(filesys::read_file("/tmp/out").unwrap(), b"two\n");
    }
}
