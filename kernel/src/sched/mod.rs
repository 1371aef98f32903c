//! Cooperative round-robin scheduling.
//!
//! Single processor, 1 ms tick, arbitration every 10 ms or on an explicit
//! yield. Tasks own their address space and kernel stack; the ring never
//! goes empty once the first task is admitted.

pub mod dispatcher;
pub mod manager;
pub mod percpu;
pub mod task;

pub use dispatcher::yield_now;
pub use manager::{SwitchTarget, TaskManager};
pub use task::{KernelTaskEntry, TaskContext};

use crate::error::KernelResult;

/// Spawn a kernel task on the current CPU's ring.
///
/// # Safety
///
/// Memory management must be live; the call temporarily uses the
/// secondary recursive slot.
pub unsafe fn spawn_kernel_task(
    entry: KernelTaskEntry,
    argument: u64,
    blockable: bool,
) -> KernelResult<u64> {
    // SAFETY: Contract forwarded.
    let context = unsafe { task::create_kernel_context(entry, argument)? };
    let id = crate::interrupts::without_interrupts(|| {
        percpu::current().tasks().add_task(context, blockable)
    });
    if id.is_err() {
        // SAFETY: The fresh space is still attached to the secondary slot.
        unsafe {
            let _ = crate::mm::pager::free_secondary_recursive_mapping();
        }
    }
    id
}

/// Park the given task until another task unblocks it.
///
/// The ring lock is shared with ISRs (device ISRs unblock their consumer
/// tasks), so the task side holds it with interrupts off.
pub fn block_task(id: u64) -> KernelResult<()> {
    crate::interrupts::without_interrupts(|| percpu::current().tasks().block_task(id))
}

/// Resume a parked task. Callable from ISRs and tasks alike.
pub fn unblock_task(id: u64) -> KernelResult<()> {
    crate::interrupts::without_interrupts(|| percpu::current().tasks().unblock_task(id))
}

/// Id of the task currently running on this CPU.
pub fn current_task_id() -> u64 {
    crate::interrupts::without_interrupts(|| percpu::current().tasks().current_task_id())
}
