//! Task contexts.
//!
//! A task's context is the triple `{cr3, ip, sp}`: its private page-table
//! root, the entry point it started at, and the stack pointer holding its
//! saved state. Kernel tasks get a fresh address space from the Pager with
//! an on-demand stack; the topmost stack page is pre-committed and seeded
//! with an interrupt frame so the first switch into the task "returns"
//! straight into its entry function.

use crate::{
    error::{KernelError, KernelResult},
    mm::{
        frame_allocator::FRAME_ALLOCATOR,
        layout::{KERNEL_STACK, PAGE_SIZE},
        page_table::PteFlags,
        pager::{self, Space},
        user,
    },
};

/// Saved execution state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TaskContext {
    /// Page-table root (physical).
    pub cr3: u64,
    /// Entry instruction pointer.
    pub ip: u64,
    /// Saved stack pointer.
    pub sp: u64,
}

impl TaskContext {
    /// Whether every field is populated (the task manager rejects null
    /// contexts).
    pub fn is_valid(&self) -> bool {
        self.cr3 != 0 && self.ip != 0 && self.sp != 0
    }
}

/// Entry signature for kernel tasks: one argument, never returns.
pub type KernelTaskEntry = extern "C" fn(u64) -> !;

/// Bytes in the seeded initial frame: 15 GPRs plus the 5-word interrupt
/// frame.
const INITIAL_FRAME_BYTES: u64 = (15 + 5) * 8;

/// Offset of the RDI slot (the argument register) inside the GPR block.
/// Push order is rax..rbp, r8..r15, so rdi sits ninth from the bottom.
const RDI_SLOT: usize = 9;

/// RFLAGS for a fresh task: interrupts enabled, reserved bit 1 set.
const INITIAL_RFLAGS: u64 = 0x202;

/// Build a fresh kernel task context.
///
/// # Safety
///
/// Pager and frame allocator must be live. The call temporarily occupies
/// the secondary recursive slot.
pub unsafe fn create_kernel_context(
    entry: KernelTaskEntry,
    argument: u64,
) -> KernelResult<TaskContext> {
    // SAFETY: Bring-up contract forwarded; the secondary slot is ours for
    // the duration of the call (single CPU).
    let cr3 = unsafe { pager::derive_fresh_cr3()? };

    let result = unsafe { seed_stack(entry, argument) };
    match result {
        Ok(sp) => Ok(TaskContext {
            cr3,
            ip: entry as usize as u64,
            sp,
        }),
        Err(e) => {
            // Roll the half-built space back.
            // SAFETY: The secondary slot still points at the new space.
            unsafe {
                let _ = pager::free_secondary_recursive_mapping();
            }
            Err(e)
        }
    }
}

/// Commit the top stack page in the secondary space and write the initial
/// interrupt frame; returns the task's starting stack pointer.
///
/// # Safety
///
/// The secondary slot must be attached to the task's fresh space.
unsafe fn seed_stack(entry: KernelTaskEntry, argument: u64) -> KernelResult<u64> {
    // SAFETY: Per-space bookkeeping window in the fresh space.
    unsafe {
        user::UserVmem::prepare(Space::Secondary)?;
    }

    let top_page = KERNEL_STACK.end() - PAGE_SIZE as u64;
    let frame = FRAME_ALLOCATOR
        .lock()
        .allocate()
        .ok_or(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
        })?;
    // SAFETY: Fresh frame over the reserved stack page of the new space.
    unsafe {
        pager::map_page(
            frame,
            top_page,
            PteFlags::WRITABLE | PteFlags::GLOBAL | PteFlags::NO_EXECUTE,
            Space::Secondary,
        )?;
    }

    // The new stack page is not visible in the current space; write the
    // frame through a transient window.
    // SAFETY: Transient mapping over the frame just installed.
    let window = unsafe {
        pager::map_general(frame, 1, PteFlags::WRITABLE | PteFlags::NO_EXECUTE)?
    };
    // SAFETY: The window covers one full page.
    unsafe {
        core::ptr::write_bytes(window as *mut u8, 0, PAGE_SIZE);

        let stack_top = KERNEL_STACK.end();
        let sp = stack_top - INITIAL_FRAME_BYTES;
        let image = (window + PAGE_SIZE as u64 - INITIAL_FRAME_BYTES) as *mut u64;

        // 15 GPRs (r15 lowest), then RIP, CS, RFLAGS, RSP, SS. The entry
        // function starts with call-style alignment (rsp ≡ 8 mod 16).
        for slot in 0..15 {
            image.add(slot).write(0);
        }
        image.add(RDI_SLOT).write(argument);
        image.add(15).write(entry as usize as u64);
        image.add(16).write(current_code_selector());
        image.add(17).write(INITIAL_RFLAGS);
        image.add(18).write(stack_top - 8);
        image.add(19).write(current_stack_selector());

        pager::unmap_general(window, 1);
        Ok(sp)
    }
}

fn current_code_selector() -> u64 {
    use x86_64::instructions::segmentation::{Segment, CS};
    CS::get_reg().0 as u64
}

fn current_stack_selector() -> u64 {
    use x86_64::instructions::segmentation::{Segment, SS};
    SS::get_reg().0 as u64
}

/// Tear down a terminated task's address space, returning every frame it
/// owned.
///
/// # Safety
///
/// The task must not be running and nothing may hold references into its
/// address space.
pub unsafe fn destroy_context(context: &TaskContext) -> KernelResult<()> {
    if context.cr3 == pager::current_cr3() {
        return Err(KernelError::InvalidParameter { name: "cr3" });
    }
    // SAFETY: Contract forwarded; the secondary slot is free on this CPU.
    unsafe {
        pager::update_secondary_mapping(context.cr3);
        pager::free_secondary_recursive_mapping()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_validity() {
        assert!(!TaskContext {
            cr3: 0,
            ip: 1,
            sp: 1
        }
        .is_valid());
        assert!(!TaskContext {
            cr3: 1,
            ip: 0,
            sp: 1
        }
        .is_valid());
        assert!(!TaskContext {
            cr3: 1,
            ip: 1,
            sp: 0
        }
        .is_valid());
        assert!(TaskContext {
            cr3: 0x1000,
            ip: 0xFFFF_8000_0010_0000,
            sp: 0xFFFF_FF80_000F_F000
        }
        .is_valid());
    }

    #[test]
    fn test_initial_frame_geometry() {
        // The seeded frame must leave sp inside the stack zone and room
        // for the iretq words above the GPR block.
        let sp = KERNEL_STACK.end() - INITIAL_FRAME_BYTES;
        assert!(KERNEL_STACK.contains(sp));
        assert_eq!(INITIAL_FRAME_BYTES % 16, 0);
        assert_eq!(RDI_SLOT, 9);
    }
}
