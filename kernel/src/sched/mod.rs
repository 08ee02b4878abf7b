//! Cooperative scheduler.
//!
//! Tasks are futures polled round-robin from a fixed table; a task gives up
//! the CPU only at an `.await` on one of the primitives in this module. Each
//! poll is one scheduler tick.

use alloc::boxed::Box;
use core::future::Future;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::constants::sched::{MAX_TASKS, SIGNAL_INTERRUPT};
use crate::errors::KernelError;
use crate::memory::paging;

mod futures;
mod runner;
mod task;

pub use self::futures::{block_current, exit, sleep, wait, yield_now, Block, Exit, Sleep, YieldNow};
pub use runner::{dispatch_next, Scheduler};
pub use task::{Pid, TaskFuture, TaskStat, TaskState};

use task::Task;

// global task table must be thread-safe
lazy_static! {
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

/// Start with an empty task table.
pub fn init() {
    *SCHEDULER.lock() = Scheduler::new();
    log::info!("scheduler ready, {} slots", MAX_TASKS);
}

/// Add a task running in the kernel address space.
pub fn spawn(name: &str, entry: impl Future<Output = i32> + Send + 'static) -> Option<Pid> {
    let task = Task::new(name, Box::pin(entry), None, false);
    let pid = SCHEDULER.lock().insert(task);
    match pid {
        Some(pid) => log::debug!("sched: spawned {} as pid {}", name, pid),
        None => log::warn!("sched: task table full, cannot spawn {}", name),
    }
    pid
}

/// Add a task with an address space of its own, falling back to the kernel's
/// when paging is not up.
pub fn spawn_isolated(name: &str, entry: impl Future<Output = i32> + Send + 'static) -> Option<Pid> {
    let Some(root) = paging::create_user_pgd() else {
        return spawn(name, entry);
    };
    let task = Task::new(name, Box::pin(entry), Some(root), true);
    let pid = SCHEDULER.lock().insert(task);
    if pid.is_none() {
        paging::destroy_user_pgd(root);
    }
    pid
}

pub fn exists(pid: Pid) -> bool {
    SCHEDULER.lock().exists(pid)
}

/// Interrupt `pid` and retire it once it has had a chance to notice.
pub fn kill(pid: Pid) -> Result<(), KernelError> {
    if SCHEDULER.lock().signal(pid, true) {
        Ok(())
    } else {
        Err(KernelError::NotFound)
    }
}

/// Raise the interrupt bit without retiring the task.
pub fn interrupt(pid: Pid) -> Result<(), KernelError> {
    if SCHEDULER.lock().signal(pid, false) {
        Ok(())
    } else {
        Err(KernelError::NotFound)
    }
}

pub fn unblock(pid: Pid) {
    SCHEDULER.lock().unblock(pid);
}

pub fn current_pid() -> Option<Pid> {
    SCHEDULER.lock().current().map(|task| task.pid)
}

/// Whether the running task has been asked to stop.
pub fn signal_pending() -> bool {
    SCHEDULER
        .lock()
        .current()
        .is_some_and(|task| task.signal & SIGNAL_INTERRUPT != 0)
}

pub fn clear_signal() {
    if let Some(task) = SCHEDULER.lock().current_mut() {
        task.signal &= !SIGNAL_INTERRUPT;
    }
}

pub fn ticks() -> u64 {
    SCHEDULER.lock().tick()
}

/// Fill `out` with one row per live task, returning how many were written.
pub fn stats(out: &mut [TaskStat]) -> usize {
    SCHEDULER.lock().stats(out)
}

pub fn total_runs() -> u64 {
    SCHEDULER.lock().total_runs()
}

pub(crate) fn mark_current_blocked() {
    if let Some(task) = SCHEDULER.lock().current_mut() {
        task.state = TaskState::Blocked;
    }
}

fn mark_current_exited(code: i32) {
    if let Some(task) = SCHEDULER.lock().current_mut() {
        task.exit_code = Some(code);
        task.state = TaskState::Exited;
    }
}

/// Dispatch forever.
pub fn run() -> ! {
    loop {
        if !dispatch_next() {
            core::hint::spin_loop();
        }
    }
}

/// Dispatch until no task is runnable.
pub fn run_until_idle() {
    while dispatch_next() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::lock_globals;
    use alloc::{sync::Arc, vec::Vec};
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pids_are_unique_and_nonzero() {
        let _guard = lock_globals();
        init();
        let mut pids = Vec::new();
        for _ in 0..8 {
            pids.push(spawn("t", async { 0 }).unwrap());
        }
        run_until_idle();
        for _ in 0..8 {
            pids.push(spawn("", async { 0 }).unwrap());
        }
        assert!(pids.iter().all(|&pid| pid != 0));
        let mut sorted = pids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), pids.len());
    }

    #[test]
    fn test_round_robin_interleaves() {
        let _guard = lock_globals();
        init();
        let trace = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3u8 {
            let trace = trace.clone();
            spawn("rr", async move {
                for _ in 0..3 {
                    trace.lock().push(id);
                    yield_now().await;
                }
                0
            });
        }
        run_until_idle();
        assert_eq!(*trace.lock(), [0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_lone_task_keeps_running_after_yield() {
        let _guard = lock_globals();
        init();
        let pid = spawn("solo", async {
            for _ in 0..5 {
                yield_now().await;
            }
            7
        })
        .unwrap();
        run_until_idle();
        assert!(!exists(pid));
        assert_eq!(ticks(), 6);
    }

    #[test]
    fn test_exit_never_returns() {
        let _guard = lock_globals();
        init();
        let polls = Arc::new(AtomicUsize::new(0));
        let seen = polls.clone();
        let pid = spawn("quitter", async move {
            seen.fetch_add(1, Ordering::SeqCst);
            match exit(3).await {}
        })
        .unwrap();
        run_until_idle();
        assert!(!exists(pid));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kill_stops_a_sleeper() {
        let _guard = lock_globals();
        init();
        let pid = spawn("sleeper", async {
            match sleep(1_000_000).await {
                Ok(()) => 0,
                Err(_) => -1,
            }
        })
        .unwrap();
        // Let it start sleeping.
        dispatch_next();
        assert!(exists(pid));

        kill(pid).unwrap();
        dispatch_next();
        assert!(!exists(pid));
        assert_eq!(kill(pid), Err(KernelError::NotFound));
    }

    #[test]
    fn test_kill_retires_task_that_ignores_signal() {
        let _guard = lock_globals();
        init();
        let pid = spawn("stubborn", async {
            loop {
                yield_now().await;
            }
        })
        .unwrap();
        dispatch_next();
        kill(pid).unwrap();
        dispatch_next();
        assert!(!exists(pid));
        let mut rows = [TaskStat {
            pid: 0,
            runs: 0,
            start_tick: 0,
            runnable: false,
            name: [0; 16],
        }; 4];
        assert_eq!(stats(&mut rows), 0);
    }

    #[test]
    fn test_block_and_unblock() {
        let _guard = lock_globals();
        init();
        let done = Arc::new(AtomicUsize::new(0));
        let flag = done.clone();
        let pid = spawn("parked", async move {
            block_current().await;
            flag.store(1, Ordering::SeqCst);
            0
        })
        .unwrap();

        run_until_idle();
        assert!(exists(pid));
        let mut rows = [TaskStat {
            pid: 0,
            runs: 0,
            start_tick: 0,
            runnable: true,
            name: [0; 16],
        }; 4];
        assert_eq!(stats(&mut rows), 1);
        assert!(!rows[0].runnable);
        assert_eq!(rows[0].name_str(), "parked");

        unblock(pid);
        run_until_idle();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!exists(pid));
    }

    #[test]
    fn test_wait_returns_when_target_exits() {
        let _guard = lock_globals();
        init();
        let target = spawn("short", async {
            sleep(3).await.map_or(-1, |()| 0)
        })
        .unwrap();
        let waited = Arc::new(AtomicUsize::new(0));
        let flag = waited.clone();
        spawn("waiter", async move {
            if wait(target).await.is_ok() {
                flag.store(1, Ordering::SeqCst);
            }
            0
        });
        run_until_idle();
        assert_eq!(waited.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_report_runs_and_start_tick() {
        let _guard = lock_globals();
        init();
        let first = spawn("a", async {
            block_current().await;
            0
        })
        .unwrap();
        let second = spawn("b", async {
            block_current().await;
            0
        })
        .unwrap();
        run_until_idle();

        let mut rows = [TaskStat {
            pid: 0,
            runs: 0,
            start_tick: 0,
            runnable: false,
            name: [0; 16],
        }; 4];
        assert_eq!(stats(&mut rows), 2);
        assert_eq!((rows[0].pid, rows[0].runs, rows[0].start_tick), (first, 1, 1));
        assert_eq!((rows[1].pid, rows[1].runs, rows[1].start_tick), (second, 1, 2));
        assert_eq!(total_runs(), 2);
    }

    #[test]
    fn test_table_full() {
        let _guard = lock_globals();
        init();
        for _ in 0..MAX_TASKS {
            assert!(spawn("filler", async { 0 }).is_some());
        }
        assert!(spawn("overflow", async { 0 }).is_none());
        run_until_idle();
        // Exited slots are reclaimed on demand.
        assert!(spawn("again", async { 0 }).is_some());
    }
}
