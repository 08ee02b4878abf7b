use core::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use super::task::Pid;
use crate::errors::KernelError;

/// Gives up the CPU once; the task stays runnable.
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Parks the task until something wakes it (`unblock`, a waker, or a signal).
pub struct Block {
    parked: bool,
}

impl Future for Block {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.parked {
            return Poll::Ready(());
        }
        self.parked = true;
        super::mark_current_blocked();
        Poll::Pending
    }
}

pub fn block_current() -> Block {
    Block { parked: false }
}

/// Ends the current task. The runner drops it after this poll, so it never resolves.
pub struct Exit {
    code: i32,
}

impl Future for Exit {
    type Output = Infallible;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Infallible> {
        super::mark_current_exited(self.code);
        Poll::Pending
    }
}

pub fn exit(code: i32) -> Exit {
    Exit { code }
}

/// Waits a number of scheduler ticks, giving up early if the task is signalled.
pub struct Sleep {
    remaining: u64,
}

impl Sleep {
    pub fn new(ticks: u64) -> Sleep {
        Sleep { remaining: ticks }
    }
}

impl Future for Sleep {
    type Output = Result<(), KernelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if super::signal_pending() {
            return Poll::Ready(Err(KernelError::Interrupted));
        }
        if self.remaining == 0 {
            return Poll::Ready(Ok(()));
        }
        self.remaining -= 1;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

pub fn sleep(ticks: u64) -> Sleep {
    Sleep::new(ticks)
}

/// Yield until `pid` is gone.
pub async fn wait(pid: Pid) -> Result<(), KernelError> {
    while super::exists(pid) {
        if super::signal_pending() {
            return Err(KernelError::Interrupted);
        }
        yield_now().await;
    }
    Ok(())
}
