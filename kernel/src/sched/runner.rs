use alloc::sync::Arc;
use core::task::{Context, Poll};
use futures::task::waker_ref;

use super::task::{Pid, Task, TaskFuture, TaskStat, TaskState, TaskWaker};
use super::SCHEDULER;
use crate::constants::sched::{MAX_TASKS, SIGNAL_INTERRUPT};
use crate::memory::paging;

/// Fixed task table plus round-robin cursor.
pub struct Scheduler {
    slots: [Option<Task>; MAX_TASKS],
    /// Slot being polled right now.
    current: Option<usize>,
    /// Slot dispatched last; the next scan starts after it.
    last: usize,
    tick: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            slots: core::array::from_fn(|_| None),
            current: None,
            last: MAX_TASKS - 1,
            tick: 0,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Install a task in the first empty or exited slot.
    pub fn insert(&mut self, task: Task) -> Option<Pid> {
        let slot = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().map_or(true, |task| !task.is_live()))?;
        let pid = task.pid;
        self.slots[slot] = Some(task);
        Some(pid)
    }

    fn live(&self, pid: Pid) -> Option<&Task> {
        self.slots
            .iter()
            .flatten()
            .find(|task| task.pid == pid && task.is_live())
    }

    fn live_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|task| task.pid == pid && task.is_live())
    }

    pub fn exists(&self, pid: Pid) -> bool {
        pid != 0 && self.live(pid).is_some()
    }

    pub fn current(&self) -> Option<&Task> {
        self.slots[self.current?].as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Task> {
        self.slots[self.current?].as_mut()
    }

    /// Raise the interrupt bit; a blocked target is made runnable so it sees it.
    pub fn signal(&mut self, pid: Pid, kill: bool) -> bool {
        let Some(task) = self.live_mut(pid) else {
            return false;
        };
        task.signal |= SIGNAL_INTERRUPT;
        task.kill_pending |= kill;
        if task.state == TaskState::Blocked {
            task.state = TaskState::Runnable;
        }
        true
    }

    pub fn unblock(&mut self, pid: Pid) {
        if let Some(task) = self.live_mut(pid) {
            if task.state == TaskState::Blocked {
                task.state = TaskState::Runnable;
            }
        }
    }

    pub fn stats(&self, out: &mut [TaskStat]) -> usize {
        let mut count = 0;
        for task in self.slots.iter().flatten().filter(|task| task.is_live()) {
            if count == out.len() {
                break;
            }
            out[count] = TaskStat::of(task);
            count += 1;
        }
        count
    }

    pub fn total_runs(&self) -> u64 {
        self.slots.iter().flatten().map(|task| task.runs).sum()
    }

    /// Next runnable slot in round-robin order after `last`, wrapping back to `last` itself.
    fn pick_next(&self) -> Option<usize> {
        (1..=MAX_TASKS)
            .map(|step| (self.last + step) % MAX_TASKS)
            .find(|&slot| {
                self.slots[slot].as_ref().is_some_and(|task| {
                    task.state == TaskState::Runnable && task.future.is_some()
                })
            })
    }

    /// Mark the chosen slot current and hand out what is needed to poll it.
    fn begin_dispatch(&mut self) -> Option<Dispatch> {
        let slot = self.pick_next()?;
        self.tick += 1;
        let tick = self.tick;
        self.last = slot;
        self.current = Some(slot);

        let task = self.slots[slot].as_mut()?;
        if task.runs == 0 {
            task.start_tick = tick;
        }
        task.runs += 1;
        Some(Dispatch {
            slot,
            root: task.root,
            waker: task.waker.clone(),
            future: task.future.take()?,
        })
    }

    /// Put the task back after a poll, or retire it.
    fn end_dispatch(&mut self, slot: usize, future: TaskFuture, result: Poll<i32>) -> Retired {
        self.current = None;
        let Some(task) = self.slots[slot].as_mut() else {
            return Retired::default();
        };

        match result {
            Poll::Ready(code) => {
                task.exit_code = Some(code);
                task.state = TaskState::Exited;
            }
            Poll::Pending if task.kill_pending => {
                task.exit_code = Some(-1);
                task.state = TaskState::Exited;
            }
            Poll::Pending if task.state == TaskState::Exited => {}
            Poll::Pending => {
                task.future = Some(future);
                return Retired::default();
            }
        }

        log::debug!("sched: pid {} exited with {:?}", task.pid, task.exit_code);
        Retired {
            future: Some(future),
            root: task.owns_root.then_some(task.root).flatten(),
        }
    }
}

struct Dispatch {
    slot: usize,
    root: Option<usize>,
    waker: Arc<TaskWaker>,
    future: TaskFuture,
}

/// What an exited task leaves behind, released outside the scheduler lock.
#[derive(Default)]
struct Retired {
    future: Option<TaskFuture>,
    root: Option<usize>,
}

/// Poll the next runnable task once. Returns false when nothing was runnable.
pub fn dispatch_next() -> bool {
    let Some(dispatch) = SCHEDULER.lock().begin_dispatch() else {
        return false;
    };
    let Dispatch {
        slot,
        root,
        waker,
        mut future,
    } = dispatch;

    if let Some(root) = root.or_else(paging::kernel_root) {
        paging::switch(root);
    }

    let waker = waker_ref(&waker);
    let mut context = Context::from_waker(&waker);
    let result = future.as_mut().poll(&mut context);

    let retired = SCHEDULER.lock().end_dispatch(slot, future, result);
    drop(retired.future);
    if let Some(root) = retired.root {
        if let Some(kernel) = paging::kernel_root() {
            paging::switch(kernel);
        }
        paging::destroy_user_pgd(root);
    }
    true
}
