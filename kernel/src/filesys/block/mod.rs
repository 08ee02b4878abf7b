//! Block devices backing the disk filesystem.

pub mod memory;

pub use memory::MemoryBlockDevice;
