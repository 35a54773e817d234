//! Error types for the EmberOS kernel
//!
//! One crate-wide [`KernelError`] with struct-style variants carrying
//! enough context to log, plus the memory-subsystem taxonomy in
//! [`MmError`]. Corruption is deliberately *not* representable as a
//! recoverable error: the allocators panic on canary or magic mismatch
//! because the state of the heap is unknown afterwards.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    Mm(MmError),

    /// A fault could not be resolved by any handler
    FaultUnhandled { addr: usize, user_mode: bool },

    /// Generic errors
    InvalidArgument {
        name: &'static str,
    },
    PermissionDenied {
        operation: &'static str,
    },
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Memory-subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// Allocator cannot satisfy the request
    OutOfMemory { requested: usize },
    /// Zero size, bad order, or a range that overflows the address space
    InvalidSize { size: usize },
    /// Address outside the managed range
    InvalidAddress { addr: usize },
    /// Free pointer not aligned for its recorded order
    MisalignedFree { addr: usize, order: usize },
    /// No mapping covers the address
    UnmappedMemory { addr: usize },
    /// Refcount/state says the object is already free
    DoubleFree { addr: usize },
    /// Mapping already exists where one was being installed
    AlreadyMapped { addr: usize },
    /// Requested VMA range overlaps an existing one
    VmaOverlap { start: usize, end: usize },
    /// Access not permitted by the covering VMA
    BadAccess { addr: usize },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mm(e) => write!(f, "memory error: {}", e),
            Self::FaultUnhandled { addr, user_mode } => {
                write!(
                    f,
                    "unhandled {} fault at {:#x}",
                    if *user_mode { "user" } else { "kernel" },
                    addr
                )
            }
            Self::InvalidArgument { name } => write!(f, "invalid argument '{}'", name),
            Self::PermissionDenied { operation } => {
                write!(f, "permission denied for operation: {}", operation)
            }
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
        }
    }
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: requested {} bytes", requested)
            }
            Self::InvalidSize { size } => write!(f, "invalid size: {}", size),
            Self::InvalidAddress { addr } => write!(f, "invalid address: {:#x}", addr),
            Self::MisalignedFree { addr, order } => {
                write!(f, "misaligned free of {:#x} for order {}", addr, order)
            }
            Self::UnmappedMemory { addr } => write!(f, "unmapped memory at {:#x}", addr),
            Self::DoubleFree { addr } => write!(f, "double free of {:#x}", addr),
            Self::AlreadyMapped { addr } => write!(f, "address {:#x} is already mapped", addr),
            Self::VmaOverlap { start, end } => {
                write!(f, "vma [{:#x}, {:#x}) overlaps an existing area", start, end)
            }
            Self::BadAccess { addr } => write!(f, "access not permitted at {:#x}", addr),
        }
    }
}

impl From<MmError> for KernelError {
    fn from(err: MmError) -> Self {
        Self::Mm(err)
    }
}
