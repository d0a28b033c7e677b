//! Kernel error types
//!
//! Every recoverable failure in the kernel is reported through these enums.
//! Fatal conditions (frame exhaustion, heap corruption, unresolvable page
//! faults) are not errors; they panic with a diagnostic and halt.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Early / physical memory errors
    Memory(MemoryError),

    /// Page-table pool errors
    Pool(PoolError),

    /// Kernel heap errors
    Heap(HeapError),

    /// Task management errors
    Task(TaskError),

    /// Signal delivery errors
    Signal(SignalError),

    /// Subsystem not initialized (called before init())
    NotInitialized { subsystem: &'static str },
}

/// Early allocation and frame allocator errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The boot loader did not provide a memory map
    NoMemoryMap,
    /// The placement cursor wrapped around the address space
    PlacementOverflow { requested: usize },
    /// A frame range did not fit the managed frame count
    InvalidFrameRange { start: usize, end: usize },
}

/// Page-table pool errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Pool is full and cannot expand past its maximum size
    Exhausted,
    /// Freed pointer does not belong to the pool
    OutOfRange { addr: usize },
    /// Freed slot was already free
    DoubleFree { index: usize },
    /// Bitmap population does not match the allocation counter
    Inconsistent { counted: usize, recorded: usize },
}

/// Kernel heap errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// Growth would exceed the maximum heap size, or a page could not be
    /// created for the new extent
    OutOfMemory { requested: usize },
    /// Zero-sized allocation request
    ZeroSize,
    /// Pointer handed to realloc lies outside the heap
    OutOfBounds { addr: usize },
}

/// Task management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// No task with this pid
    NotFound { pid: u32 },
    /// The kernel task (and pid 1) cannot be killed or signalled
    Protected { pid: u32 },
    /// The task table has no free slot
    TableFull,
    /// Tasking has not been initialized yet
    NoCurrentTask,
}

/// Signal delivery errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    /// Signal number outside the handler table
    InvalidSignal { signum: i32 },
    /// No handler registered for this signal
    NotRegistered { signum: i32 },
    /// The target task's pending queue is full; the signal was dropped
    QueueFull { pid: u32 },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(e) => write!(f, "memory error: {}", e),
            Self::Pool(e) => write!(f, "page-table pool error: {}", e),
            Self::Heap(e) => write!(f, "heap error: {}", e),
            Self::Task(e) => write!(f, "task error: {}", e),
            Self::Signal(e) => write!(f, "signal error: {}", e),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemoryMap => write!(f, "no memory map provided by boot loader"),
            Self::PlacementOverflow { requested } => {
                write!(f, "placement cursor overflow ({} bytes requested)", requested)
            }
            Self::InvalidFrameRange { start, end } => {
                write!(f, "invalid frame range {}..{}", start, end)
            }
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "pool exhausted"),
            Self::OutOfRange { addr } => write!(f, "address 0x{:x} not in pool", addr),
            Self::DoubleFree { index } => write!(f, "double free of pool slot {}", index),
            Self::Inconsistent { counted, recorded } => {
                write!(f, "bitmap holds {} slots, counter says {}", counted, recorded)
            }
        }
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of heap memory ({} bytes requested)", requested)
            }
            Self::ZeroSize => write!(f, "zero-sized allocation"),
            Self::OutOfBounds { addr } => write!(f, "pointer 0x{:x} outside the heap", addr),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { pid } => write!(f, "task {} not found", pid),
            Self::Protected { pid } => write!(f, "task {} is protected", pid),
            Self::TableFull => write!(f, "task table full"),
            Self::NoCurrentTask => write!(f, "tasking not initialized"),
        }
    }
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSignal { signum } => write!(f, "invalid signal {}", signum),
            Self::NotRegistered { signum } => write!(f, "no handler for signal {}", signum),
            Self::QueueFull { pid } => write!(f, "signal queue full for task {}", pid),
        }
    }
}

// Conversion implementations
impl From<MemoryError> for KernelError {
    fn from(err: MemoryError) -> Self {
        Self::Memory(err)
    }
}

impl From<PoolError> for KernelError {
    fn from(err: PoolError) -> Self {
        Self::Pool(err)
    }
}

impl From<HeapError> for KernelError {
    fn from(err: HeapError) -> Self {
        Self::Heap(err)
    }
}

impl From<TaskError> for KernelError {
    fn from(err: TaskError) -> Self {
        Self::Task(err)
    }
}

impl From<SignalError> for KernelError {
    fn from(err: SignalError) -> Self {
        Self::Signal(err)
    }
}
