//! Task control commands.

use alloc::boxed::Box;
use core::fmt::Write;
use futures::future::BoxFuture;

use super::{parse_number, CommandResult, Invocation};
use crate::constants::sched::{MAX_TASKS, TICKS_PER_SECOND};
use crate::errors::KernelError;
use crate::sched::{self, Pid, TaskStat};

pub fn ps(inv: &mut Invocation<'_>) -> CommandResult {
    let mut rows = [TaskStat::default(); MAX_TASKS];
    let count = sched::stats(&mut rows);
    let total = sched::total_runs().max(1);
    let now = sched::ticks();

    let _ = writeln!(inv.out, "{:>5} {:<16}{:>5} {:>8} {:>6} {}", "PID", "NAME", "STATE", "RUNS", "%CPU", "AGE");
    for row in &rows[..count] {
        let tenths = row.runs * 1000 / total;
        let _ = writeln!(
            inv.out,
            "{:>5} {:<16}{:>5} {:>8} {:>4}.{} {}",
            row.pid,
            row.name_str(),
            if row.runnable { "R" } else { "S" },
            row.runs,
            tenths / 10,
            tenths % 10,
            now.saturating_sub(row.start_tick),
        );
    }
    Ok(())
}

pub fn kill(inv: &mut Invocation<'_>) -> CommandResult {
    let pid: Pid = parse_number(inv.arg(1))?;
    match sched::kill(pid) {
        Ok(()) => {
            inv.print("killed\n");
            Ok(())
        }
        Err(err) => {
            inv.print("no such pid\n");
            Err(err)
        }
    }
}

/// `sleep <seconds>`; Ctrl-C or `kill` cut it short.
pub fn sleep(inv: Invocation<'_>) -> BoxFuture<'_, CommandResult> {
    Box::pin(async move {
        let seconds: u64 = parse_number(inv.arg(1))?;
        sched::sleep(seconds.saturating_mul(TICKS_PER_SECOND)).await
    })
}

/// `wait <pid>`: block until the task is gone. Returns at once for an unknown pid.
pub fn wait(inv: Invocation<'_>) -> BoxFuture<'_, CommandResult> {
    Box::pin(async move {
        let pid: Pid = parse_number(inv.arg(1))?;
        if pid == 0 {
            return Err(KernelError::Invalid);
        }
        sched::wait(pid).await
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::{argv, run_now};
    use super::super::{dispatch, StdOut};
    use super::*;
    use crate::test_support::lock_globals;
    use alloc::{string::String, sync::Arc};
    use spin::Mutex;

    /// Run `line` as its own task; the result shows up once the task is done.
    fn spawn_line(line: &str) -> (Pid, Arc<Mutex<Option<(isize, String)>>>) {
        let slot = Arc::new(Mutex::new(None));
        let (sink, argv) = (slot.clone(), argv(line));
        let pid = sched::spawn("cmd", async move {
            let mut out = StdOut::default();
            let status = dispatch(&argv, b"", &mut out).await;
            *sink.lock() = Some((status, String::from_utf8_lossy(out.as_bytes()).into_owned()));
            0
        })
        .unwrap();
        (pid, slot)
    }

    #[test]
    fn test_sleep_takes_ticks_per_second() {
        let _guard = lock_globals();
        sched::init();
        let (pid, slot) = spawn_line("sleep 1");
        let mut dispatched = 0;
        while sched::exists(pid) {
            sched::dispatch_next();
            dispatched += 1;
        }
        assert!(dispatched as u64 > TICKS_PER_SECOND);
        assert_eq!(*slot.lock(), Some((0, String::new())));
    }

    #[test]
    fn test_kill_interrupts_sleep() {
        let _guard = lock_globals();
        sched::init();
        let (pid, slot) = spawn_line("sleep 100");
        sched::dispatch_next();

        let (status, text) = run_now(&alloc::format!("kill {}", pid), b"");
        assert_eq!(text, "killed\n");
        assert!(status > 0);
        sched::run_until_idle();
        assert!(!sched::exists(pid));
        assert_eq!(*slot.lock(), Some((KernelError::Interrupted.status(), String::new())));

        let (status, text) = run_now(&alloc::format!("kill {}", pid), b"");
        assert_eq!(text, "no such pid\n");
        assert_eq!(status, KernelError::NotFound.status());
        assert!(run_now("kill abc", b"").0 < 0);
    }

    #[test]
    fn test_wait_returns_after_target_exits() {
        let _guard = lock_globals();
        sched::init();
        let (sleeper, _) = spawn_line("sleep 1");
        let (waiter, slot) = spawn_line(&alloc::format!("wait {}", sleeper));
        while sched::exists(waiter) {
            sched::dispatch_next();
        }
        assert!(!sched::exists(sleeper));
        assert_eq!(*slot.lock(), Some((0, String::new())));
    }

    #[test]
    fn test_ps_lists_live_tasks() {
        let _guard = lock_globals();
        sched::init();
        let (pid, _) = spawn_line("sleep 5");
        sched::dispatch_next();

        let (_, text) = run_now("ps", b"");
        let mut lines = text.lines();
        assert!(lines.next().unwrap().contains("PID"));
        let row = lines.next().unwrap();
        let fields: alloc::vec::Vec<&str> = row.split_whitespace().collect();
        assert_eq!(fields[0], alloc::format!("{}", pid));
        assert_eq!(fields[1], "cmd");
        assert_eq!(fields[4], "100.0");
        assert!(lines.next().is_none());
    }
}
