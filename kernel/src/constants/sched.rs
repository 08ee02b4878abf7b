//! Scheduler configuration constants.

/// Size of the fixed task table.
pub const MAX_TASKS: usize = 32;

/// Longest task name kept; the stats record pads it to `TASK_NAME_LEN` bytes.
pub const TASK_NAME_MAX: usize = 15;
pub const TASK_NAME_LEN: usize = 16;

/// Scheduler ticks per second of wall time, as assumed by `sleep`.
pub const TICKS_PER_SECOND: u64 = 50;

/// Signal word bit raised by `kill` and Ctrl-C.
pub const SIGNAL_INTERRUPT: u32 = 1 << 0;
