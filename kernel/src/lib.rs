//! Cinder kernel library.
//!
//! Core of a 64-bit x86-64 kernel booting via UEFI: recursive-mapping
//! paging, block-list frame allocation with a legacy DMA zone, an AVL
//! best-fit kernel heap, an APIC interrupt fabric with MSI, a cooperative
//! round-robin scheduler on a 1 ms tick, and an xHCI controller core with
//! HID input.
//!
//! The crate builds for bare metal and for the host: on the host the
//! system allocator stands in for the kernel heap so the unit-test suite
//! runs under the standard `#[test]` harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: use the system allocator so unit tests can allocate
// normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

// Bare metal: the AVL best-fit kernel heap is the global allocator.
#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_ALLOCATOR: mm::heap::LockedKernelHeap = mm::heap::LockedKernelHeap::new();

#[macro_use]
pub mod print;

pub mod acpi;
pub mod boot;
pub mod drivers;
pub mod error;
pub mod interrupts;
pub mod logger;
pub mod mm;
pub mod panic;
pub mod pci;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod timer;

// Re-exports for the kernel binary and tests.
pub use error::{KernelError, KernelResult};
pub use mm::{PageTableEntry, PteFlags, PAGE_SIZE};
pub use sched::{TaskContext, TaskManager};

/// Heap allocation failure in a no_std kernel is unrecoverable; the
/// alloc_error_handler ABI requires divergence.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic::halt(format_args!("allocation error: {:?}", layout))
}
