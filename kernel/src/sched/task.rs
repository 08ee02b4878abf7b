use alloc::{boxed::Box, sync::Arc};
use arrayvec::ArrayString;
use core::{
    fmt::Write,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU32, Ordering},
};
use futures::task::ArcWake;

use crate::constants::sched::{TASK_NAME_LEN, TASK_NAME_MAX};

pub type Pid = u32;

/// A task body. Its output is the exit code.
pub type TaskFuture = Pin<Box<dyn Future<Output = i32> + Send + 'static>>;

pub type TaskName = ArrayString<TASK_NAME_MAX>;

// pid counter must be thread-safe
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

pub(super) fn next_pid() -> Pid {
    NEXT_PID.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    Blocked,
    Exited,
}

pub struct Task {
    pub pid: Pid,
    pub name: TaskName,
    pub state: TaskState,
    pub runs: u64,
    pub start_tick: u64,
    pub signal: u32,
    /// Set by `kill`; the runner retires the task after its next poll.
    pub kill_pending: bool,
    /// Address-space root, `None` for the kernel's.
    pub root: Option<usize>,
    pub owns_root: bool,
    pub exit_code: Option<i32>,
    pub(super) waker: Arc<TaskWaker>,
    /// Taken out while the task is being polled.
    pub(super) future: Option<TaskFuture>,
}

impl Task {
    pub(super) fn new(name: &str, future: TaskFuture, root: Option<usize>, owns_root: bool) -> Task {
        let pid = next_pid();
        Task {
            pid,
            name: task_name(name, pid),
            state: TaskState::Runnable,
            runs: 0,
            start_tick: 0,
            signal: 0,
            kill_pending: false,
            root,
            owns_root,
            exit_code: None,
            waker: Arc::new(TaskWaker { pid }),
            future: Some(future),
        }
    }

    pub fn is_live(&self) -> bool {
        self.state != TaskState::Exited
    }
}

/// Truncate to `TASK_NAME_MAX` bytes on a character boundary, or `task<pid>` when empty.
fn task_name(name: &str, pid: Pid) -> TaskName {
    let mut out = TaskName::new();
    if name.is_empty() {
        let _ = write!(out, "task{}", pid);
        return out;
    }
    for ch in name.chars() {
        if out.try_push(ch).is_err() {
            break;
        }
    }
    out
}

/// Wakes a task by pid; a blocked task becomes runnable again.
pub(super) struct TaskWaker {
    pid: Pid,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc: &Arc<Self>) {
        super::unblock(arc.pid);
    }
}

/// One row of `stats`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TaskStat {
    pub pid: Pid,
    pub runs: u64,
    pub start_tick: u64,
    pub runnable: bool,
    /// Zero padded.
    pub name: [u8; TASK_NAME_LEN],
}

impl TaskStat {
    pub(super) fn of(task: &Task) -> TaskStat {
        let mut name = [0u8; TASK_NAME_LEN];
        name[..task.name.len()].copy_from_slice(task.name.as_bytes());
        TaskStat {
            pid: task.pid,
            runs: task.runs,
            start_tick: task.start_tick,
            runnable: task.state == TaskState::Runnable,
            name,
        }
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(TASK_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }
}
