//! Memory management: physical frames, recursive paging, heaps, and the
//! per-address-space user window.
//!
//! Bring-up order matters: the Pager works immediately (the loader installs
//! the recursive slot before jumping to the kernel), the frame allocator
//! consumes the UEFI map, then the kernel heap and IO heap attach on top.

pub mod frame_allocator;
pub mod heap;
pub mod io_heap;
pub mod layout;
pub mod page_fault;
pub mod page_table;
pub mod pager;
pub mod user;

pub use frame_allocator::{DmaStatus, FrameAllocator, FRAME_ALLOCATOR};
pub use layout::{MemoryZone, PAGE_SIZE};
pub use page_table::{PageTableEntry, PteFlags};

use crate::error::KernelResult;

/// Bytes of conventional memory currently free (SC-2 observability hook).
pub fn query_memory_usage() -> u64 {
    FRAME_ALLOCATOR.lock().available_memory()
}

/// Stage-1 memory bring-up: frame allocator from the boot map, then the
/// IO heap. The kernel heap needs no explicit init (its arena extends on
/// first allocation).
///
/// # Safety
///
/// Runs exactly once, after the loader-data block is published.
pub unsafe fn init(loader: &crate::boot::LoaderInfo) -> KernelResult<()> {
    // SAFETY: Single bring-up call, loader data published by the caller.
    unsafe {
        frame_allocator::init(loader)?;
        io_heap::init()?;
    }
    Ok(())
}
