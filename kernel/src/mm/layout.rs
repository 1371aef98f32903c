//! Fixed virtual-memory layout.
//!
//! The kernel half (bit 63 set) is carved at compile time into the zones
//! below. Everything from the kernel image up to the general mapping window
//! lives inside PML4 slot 256; the heap spans slots 258..509; the two
//! recursive slots and the per-task window occupy the top three slots.

/// Size of a page / frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Bytes covered by one PDE (2 MiB huge page).
pub const PDE_COVERAGE: u64 = 0x20_0000;

/// Bytes covered by one PDPTE (1 GiB huge page).
pub const PDPTE_COVERAGE: u64 = 0x4000_0000;

/// Bytes covered by one PML4 entry.
pub const PML4E_COVERAGE: u64 = 0x80_0000_0000;

/// Number of entries in any page-table level.
pub const TABLE_ENTRIES: usize = 512;

/// PML4 slot that maps the running address space onto itself.
pub const PRIMARY_RECURSIVE_INDEX: usize = 510;

/// PML4 slot pointed at a foreign address space for cross-space edits.
pub const SECONDARY_RECURSIVE_INDEX: usize = 509;

/// A contiguous virtual (or physical) zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryZone {
    /// First byte of the zone.
    pub start: u64,
    /// Zone length in bytes.
    pub limit: u64,
}

impl MemoryZone {
    /// One-past-the-end address.
    pub const fn end(&self) -> u64 {
        self.start + self.limit
    }

    /// Whether `addr` falls inside the zone.
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Number of whole pages in the zone.
    pub const fn pages(&self) -> u64 {
        self.limit / PAGE_SIZE as u64
    }
}

/// Legacy DMA zone: identity-mapped first 16 MiB of physical memory.
pub const DMA_ZONE: MemoryZone = MemoryZone {
    start: 0,
    limit: 0x0100_0000,
};

/// User half of every address space: above the DMA identity map, up to the
/// coverage of PML4 slot 0.
pub const USER_MEMORY: MemoryZone = MemoryZone {
    start: DMA_ZONE.end(),
    limit: PML4E_COVERAGE - DMA_ZONE.limit,
};

/// Default user stack: topmost 2 MiB of the user half.
pub const USER_STACK: MemoryZone = MemoryZone {
    start: USER_MEMORY.end() - 0x20_0000,
    limit: 0x20_0000,
};

/// Kernel image load region.
pub const KERNEL_IMAGE: MemoryZone = MemoryZone {
    start: 0xFFFF_8000_0000_0000,
    limit: 0x0100_0000,
};

/// Loader-provided console font.
pub const LOADER_FONT: MemoryZone = MemoryZone {
    start: KERNEL_IMAGE.end(),
    limit: 0x0010_0000,
};

/// Loader-data handoff block (see `boot`).
pub const LOADER_DATA: MemoryZone = MemoryZone {
    start: LOADER_FONT.end(),
    limit: 0x0010_0000,
};

/// EFI runtime-services code and data remapped by the loader.
pub const EFI_RUNTIME: MemoryZone = MemoryZone {
    start: LOADER_DATA.end(),
    limit: 0x0800_0000,
};

/// GOP framebuffer window.
pub const GOP_FRAMEBUFFER: MemoryZone = MemoryZone {
    start: EFI_RUNTIME.end(),
    limit: 0x0800_0000,
};

/// ACPI NVS tables preserved across boot.
pub const ACPI_NVS: MemoryZone = MemoryZone {
    start: GOP_FRAMEBUFFER.end(),
    limit: 0x0800_0000,
};

/// Frame-allocator metadata window (grows page by page).
pub const PHYSICAL_MEMORY_MAP: MemoryZone = MemoryZone {
    start: 0xFFFF_8001_0000_0000,
    limit: 0x1_0000_0000,
};

/// Transient kernel mapping window for MMIO and cross-space copies.
pub const GENERAL_MAPPING: MemoryZone = MemoryZone {
    start: PHYSICAL_MEMORY_MAP.end(),
    limit: KERNEL_IMAGE.start + PML4E_COVERAGE - PHYSICAL_MEMORY_MAP.end(),
};

/// Kernel-heap bookkeeping pages (one PML4 slot).
pub const KERNEL_HEAP_MANAGEMENT: MemoryZone = MemoryZone {
    start: GENERAL_MAPPING.end(),
    limit: PML4E_COVERAGE,
};

/// Kernel heap arena: slots 258 through 508 inclusive.
pub const KERNEL_HEAP: MemoryZone = MemoryZone {
    start: KERNEL_HEAP_MANAGEMENT.end(),
    limit: (TABLE_ENTRIES as u64 / 2 - 5) * PML4E_COVERAGE,
};

/// Window exposed by the secondary recursive slot.
pub const SECONDARY_RECURSIVE: MemoryZone = MemoryZone {
    start: 0xFFFF_FE80_0000_0000,
    limit: PML4E_COVERAGE,
};

/// Window exposed by the primary recursive slot.
pub const PRIMARY_RECURSIVE: MemoryZone = MemoryZone {
    start: 0xFFFF_FF00_0000_0000,
    limit: PML4E_COVERAGE,
};

/// Per-task private window (top PML4 slot).
pub const TASK_MEMORY: MemoryZone = MemoryZone {
    start: PRIMARY_RECURSIVE.end(),
    limit: PML4E_COVERAGE,
};

/// Unmapped page below every kernel stack.
pub const KERNEL_STACK_GUARD: MemoryZone = MemoryZone {
    start: TASK_MEMORY.start,
    limit: PAGE_SIZE as u64,
};

/// Per-task kernel stack.
pub const KERNEL_STACK: MemoryZone = MemoryZone {
    start: KERNEL_STACK_GUARD.end(),
    limit: 0x0010_0000 - 2 * PAGE_SIZE as u64,
};

/// Reserve page above the kernel stack.
pub const KERNEL_STACK_RESERVE: MemoryZone = MemoryZone {
    start: KERNEL_STACK.end(),
    limit: PAGE_SIZE as u64,
};

/// Per-address-space user-vmem bookkeeping.
pub const USER_VMEM_MANAGEMENT: MemoryZone = MemoryZone {
    start: 0xFFFF_FF80_0110_0000,
    limit: PML4E_COVERAGE - (0xFFFF_FF80_0110_0000 % PML4E_COVERAGE),
};

#[cfg(test)]
mod tests {
    use super::*;

    fn pml4_index(addr: u64) -> usize {
        ((addr >> 39) & 0x1FF) as usize
    }

    #[test]
    fn test_zones_are_page_aligned() {
        for zone in [
            DMA_ZONE,
            KERNEL_IMAGE,
            LOADER_FONT,
            LOADER_DATA,
            EFI_RUNTIME,
            GOP_FRAMEBUFFER,
            ACPI_NVS,
            PHYSICAL_MEMORY_MAP,
            GENERAL_MAPPING,
            KERNEL_HEAP_MANAGEMENT,
            KERNEL_HEAP,
            TASK_MEMORY,
        ] {
            assert_eq!(zone.start % PAGE_SIZE as u64, 0);
            assert_eq!(zone.limit % PAGE_SIZE as u64, 0);
        }
    }

    #[test]
    fn test_early_zones_fill_one_pml4_slot() {
        // Everything from the kernel image through the general mapping
        // window must stay inside slot 256 so one shared PML4E covers it.
        assert_eq!(pml4_index(KERNEL_IMAGE.start), 256);
        assert_eq!(GENERAL_MAPPING.end(), KERNEL_IMAGE.start + PML4E_COVERAGE);
    }

    #[test]
    fn test_heap_spans_up_to_secondary_slot() {
        assert_eq!(pml4_index(KERNEL_HEAP.start), 258);
        assert_eq!(KERNEL_HEAP.end(), SECONDARY_RECURSIVE.start);
        assert_eq!(pml4_index(SECONDARY_RECURSIVE.start), SECONDARY_RECURSIVE_INDEX);
        assert_eq!(pml4_index(PRIMARY_RECURSIVE.start), PRIMARY_RECURSIVE_INDEX);
        assert_eq!(pml4_index(TASK_MEMORY.start), 511);
    }

    #[test]
    fn test_task_window_structure() {
        assert_eq!(KERNEL_STACK_GUARD.pages(), 1);
        assert_eq!(KERNEL_STACK_RESERVE.pages(), 1);
        assert_eq!(
            KERNEL_STACK_GUARD.limit + KERNEL_STACK.limit + KERNEL_STACK_RESERVE.limit,
            0x0010_0000
        );
    }

    #[test]
    fn test_user_half_excludes_dma_zone() {
        assert_eq!(USER_MEMORY.start, DMA_ZONE.end());
        assert!(USER_MEMORY.contains(USER_STACK.start));
        assert_eq!(USER_STACK.end(), USER_MEMORY.end());
    }
}
