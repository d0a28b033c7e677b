//! Helium kernel library
//!
//! A small 32-bit x86 teaching kernel: physical frame allocator, two-level
//! paging with a pre-allocated page-table pool, a growable first-fit heap,
//! and a tick-driven cooperative task layer with fork, kill/wait and
//! signals.
//!
//! The crate is `no_std` on the bare-metal target. Hosted builds link `std`
//! and run the unit tests with the standard harness; the arch layer swaps
//! in inert stand-ins there.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod serial;

pub mod arch;
pub mod boot;
pub mod error;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod task;

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod testutil;

/// Kernel allocations (`alloc` users included) are served by the kernel
/// heap, falling back to the bump allocator before the heap exists.
#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;
