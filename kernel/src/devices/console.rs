//! Console input.
//!
//! A pump task moves bytes from the UART receive FIFO into a fixed ring; the
//! shell drains the ring through [`read_line`]. Ctrl-C is routed to the
//! foreground task as an interrupt before it is queued.

use alloc::string::String;
use core::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU32, Ordering},
    task::{Context, Poll, Waker},
};
use crossbeam_queue::ArrayQueue;
use lazy_static::lazy_static;
use spin::Mutex;

use super::serial::SERIAL1;
use crate::constants::devices::{CONSOLE_QUEUE_SIZE, CTRL_C};
use crate::constants::shell::MAX_LINE;
use crate::errors::KernelError;
use crate::sched::{self, Pid};

lazy_static! {
    static ref INPUT: ArrayQueue<u8> = ArrayQueue::new(CONSOLE_QUEUE_SIZE);
}

/// Task that receives Ctrl-C, 0 for none.
static FOREGROUND: AtomicU32 = AtomicU32::new(0);

/// Waker of the task parked in `read_byte`.
static READER: Mutex<Option<Waker>> = Mutex::new(None);

/// Somewhere to send console output.
pub trait Terminal: Send {
    fn write_bytes(&mut self, bytes: &[u8]);

    fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }
}

/// The UART.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialTerminal;

impl Terminal for SerialTerminal {
    fn write_bytes(&mut self, bytes: &[u8]) {
        SERIAL1.lock().write_bytes(bytes);
    }
}

/// Drop queued input and forget the foreground task.
pub fn init() {
    while INPUT.pop().is_some() {}
    FOREGROUND.store(0, Ordering::SeqCst);
    READER.lock().take();
}

pub fn set_foreground(pid: Pid) {
    FOREGROUND.store(pid, Ordering::SeqCst);
}

pub fn foreground() -> Pid {
    FOREGROUND.load(Ordering::SeqCst)
}

/// Queue one received byte and wake the reader.
pub fn push_byte(byte: u8) {
    if byte == CTRL_C {
        let pid = foreground();
        if pid != 0 && sched::interrupt(pid).is_err() {
            log::debug!("console: foreground pid {} is gone", pid);
        }
    }
    if INPUT.push(byte).is_err() {
        log::warn!("console: input ring full, byte dropped");
    }
    if let Some(waker) = READER.lock().take() {
        waker.wake();
    }
}

pub fn push_bytes(bytes: &[u8]) {
    for &byte in bytes {
        push_byte(byte);
    }
}

/// Body of the pump task: poll the UART once per tick.
pub async fn pump() -> i32 {
    loop {
        // Release the UART before queueing; push_byte may log to it.
        loop {
            let received = SERIAL1.lock().try_receive();
            let Some(byte) = received else { break };
            push_byte(byte);
        }
        sched::yield_now().await;
    }
}

pub struct ReadByte;

impl Future for ReadByte {
    type Output = u8;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u8> {
        if let Some(byte) = INPUT.pop() {
            return Poll::Ready(byte);
        }
        *READER.lock() = Some(cx.waker().clone());
        if let Some(byte) = INPUT.pop() {
            READER.lock().take();
            return Poll::Ready(byte);
        }
        sched::mark_current_blocked();
        Poll::Pending
    }
}

/// Next input byte, blocking the task while the ring is empty.
pub fn read_byte() -> ReadByte {
    ReadByte
}

/// Read one line with echo and backspace handling.
///
/// Ctrl-C abandons the line, clears the caller's interrupt bit and returns
/// `Interrupted`.
pub async fn read_line<T: Terminal + ?Sized>(term: &mut T) -> Result<String, KernelError> {
    let mut line = String::new();
    loop {
        match read_byte().await {
            CTRL_C => {
                term.write_bytes(b"^C\n");
                sched::clear_signal();
                return Err(KernelError::Interrupted);
            }
            b'\r' | b'\n' => {
                term.write_bytes(b"\n");
                return Ok(line);
            }
            0x08 | 0x7f => {
                if line.pop().is_some() {
                    term.write_bytes(b"\x08 \x08");
                }
            }
            byte @ 0x20..=0x7e if line.len() < MAX_LINE => {
                line.push(byte as char);
                term.write_bytes(&[byte]);
            }
            _ => {}
        }
    }
}
