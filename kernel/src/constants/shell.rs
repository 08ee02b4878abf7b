//! Shell and command configuration constants.

/// Per-stage stdout buffer handed to command handlers.
pub const SHELL_BUF_SIZE: usize = 2048;
pub const MAX_LINE: usize = 256;
pub const MAX_ARGS: usize = 32;
pub const MAX_PIPELINE: usize = 4;

pub const PROMPT_PREFIX: &str = "myras::";

pub const CLEAR_SCREEN: &[u8] = b"\x1b[2J\x1b[H";

/// Default line count for head and tail.
pub const DEFAULT_LINES: usize = 10;
