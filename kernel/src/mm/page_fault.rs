//! Page-fault narrowing and demand-page commit.
//!
//! The only fault the kernel resolves is a non-present access to a PTE
//! carrying the on-demand bit: a frame is allocated and installed with the
//! placeholder's attribute bits preserved. Everything else is fatal —
//! protection violations, huge-page faults, and plain unmapped addresses
//! (the swap-index bits are reserved but never consumed).

use crate::mm::{
    frame_allocator::FRAME_ALLOCATOR,
    layout::{PAGE_SIZE, PRIMARY_RECURSIVE_INDEX},
    page_table::{recursive, PageTableEntry},
    pager,
};

/// Page-fault error-code bits (architectural).
pub mod error_code {
    /// Set when the fault was a protection violation (page was present).
    pub const PRESENT: u64 = 1 << 0;
    /// Set when the access was a write.
    pub const WRITE: u64 = 1 << 1;
    /// Set when the access originated in user mode.
    pub const USER: u64 = 1 << 2;
    /// Set when an instruction fetch faulted.
    pub const INSTRUCTION_FETCH: u64 = 1 << 4;
}

/// Resolution of a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// A demand page was committed; the faulting access can retry.
    Committed { frame: u64 },
    /// Present-bit faults are protection violations: fatal.
    FatalProtection,
    /// The walk hit a huge mapping: fatal by policy.
    FatalHugePage,
    /// No mapping and no on-demand placeholder: fatal (no swap support).
    FatalUnmapped,
    /// The frame allocator is exhausted: fatal for a kernel-half fault.
    FatalOutOfMemory,
}

/// Classify the faulting address without committing anything (pure helper
/// for the handler and the tests).
pub fn classify(error: u64, pte: PageTableEntry, huge_level: bool) -> FaultResolution {
    if error & error_code::PRESENT != 0 {
        return FaultResolution::FatalProtection;
    }
    if huge_level {
        return FaultResolution::FatalHugePage;
    }
    if !pte.is_on_demand() {
        return FaultResolution::FatalUnmapped;
    }
    FaultResolution::Committed { frame: 0 }
}

/// Handle a #PF for `cr2` with the given error code.
///
/// # Safety
///
/// Must run on the faulting CPU with the primary recursive slot live.
pub unsafe fn handle(error: u64, cr2: u64) -> FaultResolution {
    if error & error_code::PRESENT != 0 {
        return FaultResolution::FatalProtection;
    }

    let slot = PRIMARY_RECURSIVE_INDEX;

    // Walk the parents manually so a missing level reads as unmapped
    // rather than a wild recursive access.
    // SAFETY: The PML4 is always reachable through the primary slot.
    let pml4e = unsafe { recursive::read(recursive::pml4e_address(slot, cr2)) };
    if !pml4e.is_present() {
        return FaultResolution::FatalUnmapped;
    }
    // SAFETY: Parent present (and so on at each level below).
    let pdpte = unsafe { recursive::read(recursive::pdpte_address(slot, cr2)) };
    if !pdpte.is_present() {
        return FaultResolution::FatalUnmapped;
    }
    if pdpte.is_huge() {
        return FaultResolution::FatalHugePage;
    }
    // SAFETY: See above.
    let pde = unsafe { recursive::read(recursive::pde_address(slot, cr2)) };
    if !pde.is_present() {
        return FaultResolution::FatalUnmapped;
    }
    if pde.is_huge() {
        return FaultResolution::FatalHugePage;
    }

    let pte_addr = recursive::pte_address(slot, cr2);
    // SAFETY: All parents present.
    let pte = unsafe { recursive::read(pte_addr) };
    if !pte.is_on_demand() {
        return FaultResolution::FatalUnmapped;
    }

    let frame = match FRAME_ALLOCATOR.lock().allocate() {
        Some(f) => f,
        None => return FaultResolution::FatalOutOfMemory,
    };

    let committed = PageTableEntry::committed(pte, frame);
    // SAFETY: Installing the committed entry over the placeholder we just
    // read; the flush makes the new frame visible before the retry.
    unsafe {
        recursive::write(pte_addr, committed);
    }
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new_truncate(cr2));

    // Demand pages are handed out zeroed. Read-only placeholders are
    // zeroed through a transient window instead of the faulting address.
    let page = cr2 & !(PAGE_SIZE as u64 - 1);
    use crate::mm::page_table::PteFlags;
    // SAFETY: The leaf was just installed; either path writes exactly one
    // frame the allocator handed us.
    unsafe {
        if committed.flags().contains(PteFlags::WRITABLE) {
            core::ptr::write_bytes(page as *mut u8, 0, PAGE_SIZE);
        } else if let Ok(window) =
            pager::map_general(frame, 1, PteFlags::WRITABLE | PteFlags::NO_EXECUTE)
        {
            core::ptr::write_bytes(window as *mut u8, 0, PAGE_SIZE);
            pager::unmap_general(window, 1);
        }
    }

    log::trace!(target: "mm", "demand page committed: {:#x} -> {:#x}", page, frame);
    FaultResolution::Committed { frame }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::page_table::PteFlags;

    #[test]
    fn test_present_fault_is_protection_violation() {
        let pte = PageTableEntry::new(0x1000, PteFlags::PRESENT);
        assert_eq!(
            classify(error_code::PRESENT | error_code::WRITE, pte, false),
            FaultResolution::FatalProtection
        );
    }

    #[test]
    fn test_huge_level_fault_is_fatal() {
        let pte = PageTableEntry::zero();
        assert_eq!(
            classify(0, pte, true),
            FaultResolution::FatalHugePage
        );
    }

    #[test]
    fn test_unmapped_without_placeholder_is_fatal() {
        assert_eq!(
            classify(error_code::WRITE, PageTableEntry::zero(), false),
            FaultResolution::FatalUnmapped
        );
        // Swap-index bits alone (without the on-demand bit) stay fatal.
        let swap_reserved = PageTableEntry::from_raw(0xABC << 52);
        assert_eq!(
            classify(0, swap_reserved, false),
            FaultResolution::FatalUnmapped
        );
    }

    #[test]
    fn test_on_demand_placeholder_resolves() {
        let pte = PageTableEntry::new(0, PteFlags::ON_DEMAND | PteFlags::WRITABLE);
        assert!(matches!(
            classify(error_code::WRITE, pte, false),
            FaultResolution::Committed { .. }
        ));
    }
}
