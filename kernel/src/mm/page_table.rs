//! Page-table entries and recursive-mapping arithmetic.
//!
//! Two PML4 slots point back at page-table structure: the primary slot at
//! the running address space's own PML4, the secondary slot at a foreign
//! PML4 for cross-space edits. Given those, the entry mapping any canonical
//! address is itself addressable by constant arithmetic — no walk needed.
//! [`recursive`] implements that arithmetic for both slots.

use bitflags::bitflags;

use super::layout::{PRIMARY_RECURSIVE_INDEX, SECONDARY_RECURSIVE_INDEX};

/// Mask extracting the physical address from an entry (bits 51:12).
pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Page-table entry bits.
    ///
    /// `ON_DEMAND` is a software encoding valid only while `PRESENT` is
    /// clear: the backing frame is allocated on first touch. The remaining
    /// high software bits are reserved for a swap index and never consumed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT         = 1 << 0;
        const WRITABLE        = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const WRITE_THROUGH   = 1 << 3;
        const NO_CACHE        = 1 << 4;
        const ACCESSED        = 1 << 5;
        const DIRTY           = 1 << 6;
        /// PS in PDEs/PDPTEs; PAT in PTEs.
        const HUGE_PAGE       = 1 << 7;
        const GLOBAL          = 1 << 8;
        /// Software: allocate the frame on first touch (non-present only).
        const ON_DEMAND       = 1 << 11;
        const NO_EXECUTE      = 1 << 63;
    }
}

/// Flag set preserved when a demand page is committed: the fault handler
/// re-installs these from the placeholder entry, plus `PRESENT`.
pub const ON_DEMAND_PRESERVED: PteFlags = PteFlags::WRITABLE
    .union(PteFlags::USER_ACCESSIBLE)
    .union(PteFlags::WRITE_THROUGH)
    .union(PteFlags::NO_CACHE)
    .union(PteFlags::HUGE_PAGE)
    .union(PteFlags::GLOBAL)
    .union(PteFlags::NO_EXECUTE);

/// A 64-bit page-table entry at any level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An all-zero (unused) entry.
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Construct from a raw 64-bit value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Construct from a physical address and flags.
    pub fn new(phys: u64, flags: PteFlags) -> Self {
        Self((phys & ADDRESS_MASK) | flags.bits())
    }

    /// Raw 64-bit value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Physical address field.
    pub const fn address(&self) -> u64 {
        self.0 & ADDRESS_MASK
    }

    /// Flag bits (everything outside the address field).
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !ADDRESS_MASK)
    }

    /// Whether the entry is completely clear.
    pub const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    /// Whether the present bit is set.
    pub fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// Whether this non-present entry requests map-on-demand.
    pub fn is_on_demand(&self) -> bool {
        !self.is_present() && self.flags().contains(PteFlags::ON_DEMAND)
    }

    /// Whether this PDE/PDPTE maps a huge page.
    pub fn is_huge(&self) -> bool {
        self.is_present() && self.flags().contains(PteFlags::HUGE_PAGE)
    }

    /// Entry installed when a demand page is committed: the placeholder's
    /// preserved attribute bits carry over, `ON_DEMAND` is dropped,
    /// `PRESENT` is added, and `frame` becomes the backing address.
    pub fn committed(placeholder: Self, frame: u64) -> Self {
        let kept = placeholder.flags() & ON_DEMAND_PRESERVED;
        Self::new(frame, kept | PteFlags::PRESENT)
    }

    /// Replace only the attribute bits, keeping the address.
    pub fn with_flags(&self, flags: PteFlags) -> Self {
        Self(self.address() | flags.bits())
    }
}

/// Recursive-mapping address computation.
///
/// With recursive slot `r`, the page-table pages of a canonical address `v`
/// appear at fixed virtual addresses built by substituting `r` for the
/// leading walk indices:
///
/// - PTE of `v`:    `[r, v47:39, v38:30, v29:21]` + offset `v20:12 * 8`
/// - PDE of `v`:    `[r, r, v47:39, v38:30]`      + offset `v29:21 * 8`
/// - PDPTE of `v`:  `[r, r, r, v47:39]`           + offset `v38:30 * 8`
/// - PML4E of `v`:  `[r, r, r, r]`                + offset `v47:39 * 8`
pub mod recursive {
    use super::PageTableEntry;

    /// Canonical sign-extension for kernel-half recursive slots.
    const SIGN: u64 = 0xFFFF_0000_0000_0000;

    const fn slot_base(slot: usize) -> u64 {
        SIGN | (slot as u64) << 39
    }

    /// Virtual address of the PTE mapping `v`.
    pub const fn pte_address(slot: usize, v: u64) -> u64 {
        slot_base(slot) | ((v >> 9) & 0x7F_FFFF_FFF8)
    }

    /// Virtual address of the PDE mapping `v`.
    pub const fn pde_address(slot: usize, v: u64) -> u64 {
        slot_base(slot) | (slot as u64) << 30 | ((v >> 18) & 0x3FFF_FFF8)
    }

    /// Virtual address of the PDPTE mapping `v`.
    pub const fn pdpte_address(slot: usize, v: u64) -> u64 {
        slot_base(slot) | (slot as u64) << 30 | (slot as u64) << 21 | ((v >> 27) & 0x1F_FFF8)
    }

    /// Virtual address of the PML4E mapping `v`.
    pub const fn pml4e_address(slot: usize, v: u64) -> u64 {
        slot_base(slot)
            | (slot as u64) << 30
            | (slot as u64) << 21
            | (slot as u64) << 12
            | ((v >> 36) & 0xFF8)
    }

    /// Virtual address of the PML4 page itself.
    pub const fn pml4_address(slot: usize) -> u64 {
        slot_base(slot) | (slot as u64) << 30 | (slot as u64) << 21 | (slot as u64) << 12
    }

    /// Read an entry through the recursive window.
    ///
    /// # Safety
    ///
    /// The recursive slot must be installed and the parent structures of the
    /// addressed entry must be present.
    pub unsafe fn read(entry_addr: u64) -> PageTableEntry {
        // SAFETY: Forwarded; the address was computed by the functions above
        // against an installed recursive slot.
        unsafe { core::ptr::read_volatile(entry_addr as *const PageTableEntry) }
    }

    /// Write an entry through the recursive window.
    ///
    /// # Safety
    ///
    /// Same as [`read`], plus the caller is responsible for TLB shootdown.
    pub unsafe fn write(entry_addr: u64, entry: PageTableEntry) {
        // SAFETY: Forwarded from the caller.
        unsafe { core::ptr::write_volatile(entry_addr as *mut PageTableEntry, entry) }
    }
}

/// PTE address of `v` through the primary (running) address space.
pub const fn primary_pte_address(v: u64) -> u64 {
    recursive::pte_address(PRIMARY_RECURSIVE_INDEX, v)
}

/// PTE address of `v` through the secondary (foreign) address space.
pub const fn secondary_pte_address(v: u64) -> u64 {
    recursive::pte_address(SECONDARY_RECURSIVE_INDEX, v)
}

#[cfg(test)]
mod tests {
    use alloc::collections::BTreeMap;

    use super::super::layout::PRIMARY_RECURSIVE_INDEX;
    use super::*;

    #[test]
    fn test_entry_field_extraction() {
        let e = PageTableEntry::new(0x1234_5000, PteFlags::PRESENT | PteFlags::WRITABLE);
        assert_eq!(e.address(), 0x1234_5000);
        assert!(e.is_present());
        assert!(!e.is_huge());
        assert!(e.flags().contains(PteFlags::WRITABLE));
    }

    #[test]
    fn test_on_demand_requires_non_present() {
        let placeholder = PageTableEntry::new(0, PteFlags::ON_DEMAND | PteFlags::WRITABLE);
        assert!(placeholder.is_on_demand());
        let committed = PageTableEntry::committed(placeholder, 0xABC000);
        assert!(committed.is_present());
        assert!(!committed.is_on_demand());
        assert!(committed.flags().contains(PteFlags::WRITABLE));
        assert_eq!(committed.address(), 0xABC000);
        // A present entry never reports on-demand even with bit 11 set.
        let weird = PageTableEntry::new(0, PteFlags::PRESENT | PteFlags::ON_DEMAND);
        assert!(!weird.is_on_demand());
    }

    #[test]
    fn test_commit_preserves_attribute_bits() {
        let placeholder = PageTableEntry::new(
            0,
            PteFlags::ON_DEMAND
                | PteFlags::USER_ACCESSIBLE
                | PteFlags::NO_CACHE
                | PteFlags::GLOBAL
                | PteFlags::NO_EXECUTE,
        );
        let committed = PageTableEntry::committed(placeholder, 0x7000);
        let f = committed.flags();
        assert!(f.contains(PteFlags::USER_ACCESSIBLE));
        assert!(f.contains(PteFlags::NO_CACHE));
        assert!(f.contains(PteFlags::GLOBAL));
        assert!(f.contains(PteFlags::NO_EXECUTE));
        assert!(!f.contains(PteFlags::ON_DEMAND));
    }

    /// Software MMU over a synthetic 4-level table tree: translates a
    /// virtual address to (physical page, offset).
    struct SoftMmu {
        tables: BTreeMap<u64, [u64; 512]>,
        root: u64,
    }

    impl SoftMmu {
        fn translate(&self, v: u64) -> Option<u64> {
            let mut table = self.root;
            for level in 0..4 {
                let shift = 39 - level * 9;
                let index = ((v >> shift) & 0x1FF) as usize;
                let entry = self.tables.get(&table)?[index];
                if entry & 1 == 0 {
                    return None;
                }
                table = entry & ADDRESS_MASK;
            }
            Some(table | (v & 0xFFF))
        }
    }

    /// Property: for canonical `v`, the recursive PTE/PDE/PDPTE/PML4E
    /// addresses translate (through a software walk of a live tree with the
    /// recursive slot installed) to the exact bytes of the corresponding
    /// entries.
    #[test]
    fn test_recursive_addresses_agree_with_software_walk() {
        let r = PRIMARY_RECURSIVE_INDEX;
        let v: u64 = 0xFFFF_8000_1234_5000;
        let (i4, i3, i2, i1) = (
            ((v >> 39) & 0x1FF) as usize,
            ((v >> 30) & 0x1FF) as usize,
            ((v >> 21) & 0x1FF) as usize,
            ((v >> 12) & 0x1FF) as usize,
        );

        // Physical table addresses (arbitrary, page aligned).
        let (pml4, pdpt, pd, pt, frame) = (0x1000u64, 0x2000, 0x3000, 0x4000, 0x5000);
        let mut tables: BTreeMap<u64, [u64; 512]> = BTreeMap::new();
        let mut t4 = [0u64; 512];
        t4[i4] = pdpt | 0x3;
        t4[r] = pml4 | 0x3; // recursive slot
        let mut t3 = [0u64; 512];
        t3[i3] = pd | 0x3;
        let mut t2 = [0u64; 512];
        t2[i2] = pt | 0x3;
        let mut t1 = [0u64; 512];
        t1[i1] = frame | 0x3;
        tables.insert(pml4, t4);
        tables.insert(pdpt, t3);
        tables.insert(pd, t2);
        tables.insert(pt, t1);
        let mmu = SoftMmu { tables, root: pml4 };

        assert_eq!(
            mmu.translate(recursive::pte_address(r, v)),
            Some(pt | (i1 as u64) * 8)
        );
        assert_eq!(
            mmu.translate(recursive::pde_address(r, v)),
            Some(pd | (i2 as u64) * 8)
        );
        assert_eq!(
            mmu.translate(recursive::pdpte_address(r, v)),
            Some(pdpt | (i3 as u64) * 8)
        );
        assert_eq!(
            mmu.translate(recursive::pml4e_address(r, v)),
            Some(pml4 | (i4 as u64) * 8)
        );
        assert_eq!(mmu.translate(recursive::pml4_address(r)), Some(pml4));
    }

    #[test]
    fn test_recursive_addresses_are_canonical_kernel_half() {
        for v in [0x0u64, 0x7FFF_FFFF_F000, 0xFFFF_8000_0000_0000, 0xFFFF_FFFF_FFFF_F000] {
            for addr in [
                primary_pte_address(v),
                secondary_pte_address(v),
                recursive::pde_address(PRIMARY_RECURSIVE_INDEX, v),
                recursive::pml4e_address(PRIMARY_RECURSIVE_INDEX, v),
            ] {
                // Bit 63 set and bits 63:48 uniform.
                assert_eq!(addr >> 48, 0xFFFF, "non-canonical {addr:#x} for {v:#x}");
                assert_eq!(addr % 8, 0);
            }
        }
    }
}
