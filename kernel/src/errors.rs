//! Kernel-wide error kinds.
//!
//! Subsystems keep their own precise error enums and fold into
//! [`KernelError`] at the boundaries where callers only care about the kind,
//! such as command handlers reporting a negative status to the shell.

use crate::filesys::FsError;
use crate::memory::heap::HeapError;
use crate::memory::paging::MapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    NotFound,
    Invalid,
    Interrupted,
    Unsupported,
    Fatal,
}

impl KernelError {
    /// Negative status handed back through the command contract.
    pub fn status(self) -> isize {
        match self {
            KernelError::OutOfMemory => -12,
            KernelError::NotFound => -2,
            KernelError::Invalid => -22,
            KernelError::Interrupted => -4,
            KernelError::Unsupported => -38,
            KernelError::Fatal => -5,
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::NotFound => write!(f, "not found"),
            KernelError::Invalid => write!(f, "invalid argument"),
            KernelError::Interrupted => write!(f, "interrupted"),
            KernelError::Unsupported => write!(f, "not impl"),
            KernelError::Fatal => write!(f, "fatal error"),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound => KernelError::NotFound,
            FsError::NoSpace => KernelError::OutOfMemory,
            FsError::NotSupported => KernelError::Unsupported,
            FsError::IOError => KernelError::Fatal,
            FsError::AlreadyExists
            | FsError::InvalidName
            | FsError::IsDirectory
            | FsError::NotDirectory
            | FsError::NotEmpty
            | FsError::BadDescriptor
            | FsError::TooManyOpenFiles => KernelError::Invalid,
        }
    }
}

impl From<MapError> for KernelError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => KernelError::OutOfMemory,
            MapError::AddressOverflow => KernelError::Invalid,
            MapError::BlockInTheWay | MapError::NoKernelRoot => KernelError::Fatal,
        }
    }
}

impl From<HeapError> for KernelError {
    fn from(err: HeapError) -> Self {
        match err {
            HeapError::DoubleFree | HeapError::InvalidPointer => KernelError::Invalid,
            HeapError::Corrupted => KernelError::Fatal,
        }
    }
}
