//! Virtual-memory manager over the recursive mapping.
//!
//! All page-table edits go through the recursive windows computed by
//! [`super::page_table::recursive`]: the primary slot for the running
//! address space, the secondary slot for a foreign one. Intermediate tables
//! are allocated from the frame allocator on demand and never freed for
//! kernel mappings (kernel-lifetime assumption); user-space teardown walks
//! and frees everything via [`free_secondary_recursive_mapping`].

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::{instructions::tlb, VirtAddr};

use crate::{
    error::{KernelError, KernelResult},
    mm::{
        frame_allocator::FRAME_ALLOCATOR,
        layout::{
            self, DMA_ZONE, GENERAL_MAPPING, KERNEL_STACK, PAGE_SIZE, PDE_COVERAGE,
            PDPTE_COVERAGE, PRIMARY_RECURSIVE_INDEX, SECONDARY_RECURSIVE_INDEX, TABLE_ENTRIES,
        },
        page_table::{recursive, PageTableEntry, PteFlags},
    },
};

/// Which recursive slot an operation edits through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// The running address space.
    Primary,
    /// The address space currently attached to the secondary slot.
    Secondary,
}

impl Space {
    const fn slot(self) -> usize {
        match self {
            Space::Primary => PRIMARY_RECURSIVE_INDEX,
            Space::Secondary => SECONDARY_RECURSIVE_INDEX,
        }
    }
}

/// Intermediate-table flags for kernel-half mappings.
const TABLE_FLAGS: PteFlags = PteFlags::PRESENT.union(PteFlags::WRITABLE);

/// Intermediate-table flags for user-half mappings.
const USER_TABLE_FLAGS: PteFlags = TABLE_FLAGS.union(PteFlags::USER_ACCESSIBLE);

fn invlpg(virt: u64) {
    tlb::flush(VirtAddr::new_truncate(virt));
}

/// Zero a freshly installed table page through the recursive window.
///
/// # Safety
///
/// `table_page` must be the recursive-window address of a just-installed,
/// TLB-flushed table page.
unsafe fn zero_table(table_page: u64) {
    // SAFETY: The caller installed a fresh frame at this window address.
    unsafe {
        core::ptr::write_bytes(table_page as *mut u64, 0, TABLE_ENTRIES);
    }
}

/// Walk down to the PT of `virt`, installing missing intermediate tables
/// with frames drawn from `frames`.
///
/// # Safety
///
/// The recursive slot for `space` must be installed; `frames` must yield
/// unused frames.
unsafe fn ensure_tables(
    space: Space,
    virt: u64,
    user: bool,
    frames: &mut dyn FnMut() -> Option<u64>,
) -> KernelResult<()> {
    let slot = space.slot();
    let table_flags = if user { USER_TABLE_FLAGS } else { TABLE_FLAGS };

    // (entry address, table page the entry opens up)
    let levels = [
        (
            recursive::pml4e_address(slot, virt),
            recursive::pdpte_address(slot, virt) & !0xFFF,
        ),
        (
            recursive::pdpte_address(slot, virt),
            recursive::pde_address(slot, virt) & !0xFFF,
        ),
        (
            recursive::pde_address(slot, virt),
            recursive::pte_address(slot, virt) & !0xFFF,
        ),
    ];

    for (entry_addr, child_page) in levels {
        // SAFETY: entry_addr is a recursive-window address whose parents
        // were ensured by the previous iterations (or are the PML4 itself).
        let entry = unsafe { recursive::read(entry_addr) };
        if entry.is_present() {
            if entry.is_huge() {
                return Err(KernelError::InvalidParameter { name: "virt" });
            }
            continue;
        }
        let frame = frames().ok_or(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
        })?;
        // SAFETY: Installing a fresh table; child window address flushed
        // before the zeroing store.
        unsafe {
            recursive::write(entry_addr, PageTableEntry::new(frame, table_flags));
            invlpg(child_page);
            zero_table(child_page);
        }
    }
    Ok(())
}

/// Pull one frame from the global allocator.
fn allocate_frame() -> Option<u64> {
    FRAME_ALLOCATOR.lock().allocate()
}

/// Map `virt` (one page) in the frame-allocator metadata window, drawing
/// the leaf frame and any missing table frames from `frames` instead of the
/// global allocator (whose lock the caller already holds).
///
/// # Safety
///
/// `virt` must lie in the metadata window; `frames` must yield unused
/// frames.
pub unsafe fn map_window_page(
    virt: u64,
    frames: &mut dyn FnMut() -> Option<u64>,
) -> KernelResult<()> {
    // SAFETY: Forwarded from the caller.
    unsafe {
        ensure_tables(Space::Primary, virt, false, frames)?;
    }
    let leaf = frames().ok_or(KernelError::OutOfMemory {
        requested: PAGE_SIZE,
    })?;
    let pte = recursive::pte_address(PRIMARY_RECURSIVE_INDEX, virt);
    // SAFETY: Tables ensured above; leaf frame is fresh.
    unsafe {
        recursive::write(
            pte,
            PageTableEntry::new(leaf, TABLE_FLAGS | PteFlags::GLOBAL | PteFlags::NO_EXECUTE),
        );
    }
    invlpg(virt);
    Ok(())
}

/// Install a 4 KiB (or huge) leaf mapping.
///
/// # Safety
///
/// `phys` must reference memory the caller owns; `virt` must not be live
/// elsewhere. Secondary mappings require the secondary slot attached.
pub unsafe fn map_page(phys: u64, virt: u64, flags: PteFlags, space: Space) -> KernelResult<()> {
    let user = flags.contains(PteFlags::USER_ACCESSIBLE);
    if flags.contains(PteFlags::HUGE_PAGE) {
        // 2 MiB leaf: stop the walk at the PDE.
        if phys % PDE_COVERAGE != 0 || virt % PDE_COVERAGE != 0 {
            return Err(KernelError::InvalidParameter { name: "alignment" });
        }
        let slot = space.slot();
        // Ensure PML4E + PDPTE only.
        // SAFETY: Same contract as ensure_tables; the PDE level is written
        // as the leaf below.
        unsafe {
            ensure_tables_to_pd(space, virt, user)?;
            recursive::write(
                recursive::pde_address(slot, virt),
                PageTableEntry::new(phys, flags | PteFlags::PRESENT),
            );
        }
        if space == Space::Primary {
            invlpg(virt);
        }
        return Ok(());
    }

    // SAFETY: Forwarded contract.
    unsafe {
        ensure_tables(space, virt, user, &mut allocate_frame)?;
        recursive::write(
            recursive::pte_address(space.slot(), virt),
            PageTableEntry::new(phys, flags | PteFlags::PRESENT),
        );
    }
    if space == Space::Primary {
        invlpg(virt);
    }
    Ok(())
}

/// Ensure PML4E and PDPTE exist for a 2 MiB mapping of `virt`.
///
/// # Safety
///
/// Same contract as [`ensure_tables`].
unsafe fn ensure_tables_to_pd(space: Space, virt: u64, user: bool) -> KernelResult<()> {
    let slot = space.slot();
    let table_flags = if user { USER_TABLE_FLAGS } else { TABLE_FLAGS };
    let levels = [
        (
            recursive::pml4e_address(slot, virt),
            recursive::pdpte_address(slot, virt) & !0xFFF,
        ),
        (
            recursive::pdpte_address(slot, virt),
            recursive::pde_address(slot, virt) & !0xFFF,
        ),
    ];
    for (entry_addr, child_page) in levels {
        // SAFETY: Forwarded from the caller.
        let entry = unsafe { recursive::read(entry_addr) };
        if entry.is_present() {
            if entry.is_huge() {
                return Err(KernelError::InvalidParameter { name: "virt" });
            }
            continue;
        }
        let frame = allocate_frame().ok_or(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
        })?;
        // SAFETY: Fresh table install, flush before zeroing.
        unsafe {
            recursive::write(entry_addr, PageTableEntry::new(frame, table_flags));
            invlpg(child_page);
            zero_table(child_page);
        }
    }
    Ok(())
}

/// Remove a 4 KiB leaf mapping; returns the previously mapped frame, if
/// any. Intermediate tables are retained.
///
/// # Safety
///
/// The caller must own the mapping and tolerate the TLB shootdown.
pub unsafe fn unmap_page(virt: u64, space: Space) -> Option<u64> {
    let pte_addr = recursive::pte_address(space.slot(), virt);
    // SAFETY: Caller guarantees the mapping (and therefore its parent
    // tables) exists in the addressed space.
    let entry = unsafe { recursive::read(pte_addr) };
    // SAFETY: Zeroing a leaf we own.
    unsafe {
        recursive::write(pte_addr, PageTableEntry::zero());
    }
    if space == Space::Primary {
        invlpg(virt);
    }
    entry.is_present().then(|| entry.address())
}

/// Install non-present on-demand placeholders over `pages` pages starting
/// at `start`. The backing frame is allocated at first touch by the
/// page-fault handler.
///
/// # Safety
///
/// Same contract as [`map_page`].
pub unsafe fn map_on_demand(
    start: u64,
    pages: u64,
    flags: PteFlags,
    space: Space,
) -> KernelResult<()> {
    let user = flags.contains(PteFlags::USER_ACCESSIBLE);
    for i in 0..pages {
        let virt = start + i * PAGE_SIZE as u64;
        // SAFETY: Forwarded contract.
        unsafe {
            ensure_tables(space, virt, user, &mut allocate_frame)?;
            recursive::write(
                recursive::pte_address(space.slot(), virt),
                PageTableEntry::new(0, (flags | PteFlags::ON_DEMAND) - PteFlags::PRESENT),
            );
        }
    }
    Ok(())
}

/// Rewrite the attribute bits of an existing mapped range, invalidating
/// each page.
///
/// # Safety
///
/// Every page in the range must have a PTE (present or on-demand).
pub unsafe fn change_flags(
    start: u64,
    pages: u64,
    flags: PteFlags,
    space: Space,
) -> KernelResult<()> {
    for i in 0..pages {
        let virt = start + i * PAGE_SIZE as u64;
        let pte_addr = recursive::pte_address(space.slot(), virt);
        // SAFETY: Caller guarantees the PTE exists.
        let entry = unsafe { recursive::read(pte_addr) };
        if entry.is_unused() {
            return Err(KernelError::NotFound { resource: "mapping" });
        }
        // SAFETY: Attribute rewrite of an entry we just read.
        unsafe {
            recursive::write(pte_addr, entry.with_flags(flags));
        }
        if space == Space::Primary {
            invlpg(virt);
        }
    }
    Ok(())
}

/// Scan hint for the general-mapping window.
static GENERAL_NEXT: AtomicU64 = AtomicU64::new(GENERAL_MAPPING.start);

/// Map `pages` physically contiguous pages starting at `phys` somewhere in
/// the general window; returns the chosen base. Used for transient MMIO
/// windows.
///
/// # Safety
///
/// `phys` must reference MMIO or memory the caller owns.
pub unsafe fn map_general(phys: u64, pages: u64, flags: PteFlags) -> KernelResult<u64> {
    let start_hint = GENERAL_NEXT.load(Ordering::Relaxed);
    let mut base = start_hint;
    let mut found = 0u64;

    while base + pages * PAGE_SIZE as u64 <= GENERAL_MAPPING.end() {
        let virt = base + found * PAGE_SIZE as u64;
        // SAFETY: Kernel-half window; frames from the global allocator.
        unsafe {
            ensure_tables(Space::Primary, virt, false, &mut allocate_frame)?;
        }
        // SAFETY: Tables ensured above.
        let entry = unsafe { recursive::read(recursive::pte_address(PRIMARY_RECURSIVE_INDEX, virt)) };
        if entry.is_unused() {
            found += 1;
            if found == pages {
                for i in 0..pages {
                    let v = base + i * PAGE_SIZE as u64;
                    // SAFETY: All PTEs in [base, base+pages) verified unused.
                    unsafe {
                        recursive::write(
                            recursive::pte_address(PRIMARY_RECURSIVE_INDEX, v),
                            PageTableEntry::new(
                                phys + i * PAGE_SIZE as u64,
                                flags | PteFlags::PRESENT,
                            ),
                        );
                    }
                    invlpg(v);
                }
                GENERAL_NEXT.store(base + pages * PAGE_SIZE as u64, Ordering::Relaxed);
                return Ok(base);
            }
        } else {
            base = virt + PAGE_SIZE as u64;
            found = 0;
        }
    }
    Err(KernelError::OutOfMemory {
        requested: (pages as usize) * PAGE_SIZE,
    })
}

/// Release a transient general-window mapping (the PTEs only; the physical
/// target is the caller's).
///
/// # Safety
///
/// `base` must come from [`map_general`] with the same page count.
pub unsafe fn unmap_general(base: u64, pages: u64) {
    for i in 0..pages {
        let virt = base + i * PAGE_SIZE as u64;
        // SAFETY: map_general installed these PTEs.
        unsafe {
            recursive::write(
                recursive::pte_address(PRIMARY_RECURSIVE_INDEX, virt),
                PageTableEntry::zero(),
            );
        }
        invlpg(virt);
    }
}

/// Translate `virt` to its physical backing, honoring 1 GiB and 2 MiB
/// leaves. `None` when any level is non-present.
///
/// # Safety
///
/// The recursive slot for `space` must be installed.
pub unsafe fn physical_of(virt: u64, space: Space) -> Option<u64> {
    let slot = space.slot();
    // SAFETY: The PML4 page is always present under the recursive slot.
    let pml4e = unsafe { recursive::read(recursive::pml4e_address(slot, virt)) };
    if !pml4e.is_present() {
        return None;
    }
    // SAFETY: Parent checked present above (each subsequent level likewise).
    let pdpte = unsafe { recursive::read(recursive::pdpte_address(slot, virt)) };
    if !pdpte.is_present() {
        return None;
    }
    if pdpte.is_huge() {
        return Some(pdpte.address() + (virt & (PDPTE_COVERAGE - 1)));
    }
    // SAFETY: See above.
    let pde = unsafe { recursive::read(recursive::pde_address(slot, virt)) };
    if !pde.is_present() {
        return None;
    }
    if pde.is_huge() {
        return Some(pde.address() + (virt & (PDE_COVERAGE - 1)));
    }
    // SAFETY: See above.
    let pte = unsafe { recursive::read(recursive::pte_address(slot, virt)) };
    pte.is_present()
        .then(|| pte.address() + (virt & (PAGE_SIZE as u64 - 1)))
}

/// Attach `cr3` to the secondary recursive slot of the running space.
///
/// # Safety
///
/// `cr3` must be a live PML4 whose own secondary slot already self-refers
/// (as arranged by [`derive_fresh_cr3`]).
pub unsafe fn update_secondary_mapping(cr3: u64) {
    let slot_addr = recursive::pml4e_address(
        PRIMARY_RECURSIVE_INDEX,
        layout::SECONDARY_RECURSIVE.start,
    );
    // SAFETY: Editing our own PML4 through the primary window.
    unsafe {
        recursive::write(slot_addr, PageTableEntry::new(cr3, TABLE_FLAGS));
    }
    tlb::flush_all();
}

/// Build a fresh address space: new PML4 sharing the kernel half, private
/// user half, self-referential recursive slots, and on-demand kernel-stack
/// pages above an unmapped guard. Returns the new CR3. The secondary slot
/// is left attached to the new space.
///
/// # Safety
///
/// Must run with the Pager live; the caller takes ownership of the
/// returned CR3 (freed via [`free_secondary_recursive_mapping`]).
pub unsafe fn derive_fresh_cr3() -> KernelResult<u64> {
    let pml4_frame = allocate_frame().ok_or(KernelError::OutOfMemory {
        requested: PAGE_SIZE,
    })?;

    // SAFETY: The fresh frame becomes the secondary PML4; flushed before
    // the window is touched.
    unsafe {
        update_secondary_mapping(pml4_frame);
        zero_table(recursive::pml4_address(SECONDARY_RECURSIVE_INDEX));
    }

    // Share the kernel half: every kernel PML4E except the recursive slots
    // and the per-task window (slot 511).
    for index in 256..TABLE_ENTRIES {
        if index == PRIMARY_RECURSIVE_INDEX
            || index == SECONDARY_RECURSIVE_INDEX
            || index == 511
        {
            continue;
        }
        let virt_covered = 0xFFFF_0000_0000_0000u64 | (index as u64) << 39;
        let src = recursive::pml4e_address(PRIMARY_RECURSIVE_INDEX, virt_covered);
        let dst = recursive::pml4e_address(SECONDARY_RECURSIVE_INDEX, virt_covered);
        // SAFETY: Copying entries between the two live PML4 windows.
        unsafe {
            let entry = recursive::read(src);
            recursive::write(dst, entry);
        }
    }

    // Recursive slots self-refer so the space works both as primary (when
    // running) and as a secondary edit target.
    for slot in [PRIMARY_RECURSIVE_INDEX, SECONDARY_RECURSIVE_INDEX] {
        let virt_covered = 0xFFFF_0000_0000_0000u64 | (slot as u64) << 39;
        let dst = recursive::pml4e_address(SECONDARY_RECURSIVE_INDEX, virt_covered);
        // SAFETY: Self-reference install in the fresh PML4.
        unsafe {
            recursive::write(dst, PageTableEntry::new(pml4_frame, TABLE_FLAGS));
        }
    }

    // Identity-map the DMA zone as eight uncached 2 MiB pages.
    let dma_flags =
        PteFlags::WRITABLE | PteFlags::NO_CACHE | PteFlags::HUGE_PAGE | PteFlags::NO_EXECUTE;
    let mut dma = DMA_ZONE.start;
    while dma < DMA_ZONE.end() {
        // SAFETY: Identity leaf over the architecturally reserved low zone.
        unsafe {
            map_page(dma, dma, dma_flags, Space::Secondary)?;
        }
        dma += PDE_COVERAGE;
    }

    // Kernel stack: on-demand pages above the guard (which stays absent).
    // SAFETY: Fresh slot-511 tables in the secondary space.
    unsafe {
        map_on_demand(
            KERNEL_STACK.start,
            KERNEL_STACK.pages(),
            PteFlags::WRITABLE | PteFlags::GLOBAL | PteFlags::NO_EXECUTE,
            Space::Secondary,
        )?;
    }

    Ok(pml4_frame)
}

/// Tear down the address space attached to the secondary slot: free every
/// present page table and leaf frame of the user half and the per-task
/// window, then detach the slot.
///
/// # Safety
///
/// The secondary slot must be attached to a space no CPU is running on and
/// no other thread references.
pub unsafe fn free_secondary_recursive_mapping() -> KernelResult<()> {
    let slot = SECONDARY_RECURSIVE_INDEX;
    let mut fa = FRAME_ALLOCATOR.lock();

    // User half plus the per-task slot 511.
    let pml4_indices = (0..256usize).chain([511usize]);
    for i4 in pml4_indices {
        let base4 = if i4 >= 256 {
            0xFFFF_0000_0000_0000u64 | (i4 as u64) << 39
        } else {
            (i4 as u64) << 39
        };
        // SAFETY: Reading through the attached secondary window.
        let pml4e = unsafe { recursive::read(recursive::pml4e_address(slot, base4)) };
        if !pml4e.is_present() {
            continue;
        }
        for i3 in 0..TABLE_ENTRIES {
            let base3 = base4 + (i3 as u64) * PDPTE_COVERAGE;
            // SAFETY: Parent present.
            let pdpte = unsafe { recursive::read(recursive::pdpte_address(slot, base3)) };
            if !pdpte.is_present() {
                continue;
            }
            if pdpte.is_huge() {
                if !DMA_ZONE.contains(pdpte.address()) {
                    let _ = fa.free_run(pdpte.address(), 512 * 512);
                }
                continue;
            }
            for i2 in 0..TABLE_ENTRIES {
                let base2 = base3 + (i2 as u64) * PDE_COVERAGE;
                // SAFETY: Parent present.
                let pde = unsafe { recursive::read(recursive::pde_address(slot, base2)) };
                if !pde.is_present() {
                    continue;
                }
                if pde.is_huge() {
                    if !DMA_ZONE.contains(pde.address()) {
                        let _ = fa.free_run(pde.address(), 512);
                    }
                    continue;
                }
                for i1 in 0..TABLE_ENTRIES {
                    let base1 = base2 + (i1 as u64) * PAGE_SIZE as u64;
                    // SAFETY: Parent present.
                    let pte = unsafe { recursive::read(recursive::pte_address(slot, base1)) };
                    if pte.is_present() && !DMA_ZONE.contains(pte.address()) {
                        let _ = fa.free(pte.address());
                    }
                }
                let _ = fa.free(pde.address());
            }
            let _ = fa.free(pdpte.address());
        }
        let _ = fa.free(pml4e.address());
    }

    // Free the PML4 frame itself and detach the slot.
    let own_pml4e = recursive::pml4e_address(
        PRIMARY_RECURSIVE_INDEX,
        layout::SECONDARY_RECURSIVE.start,
    );
    // SAFETY: Reading our own PML4 entry for the secondary slot.
    let secondary = unsafe { recursive::read(own_pml4e) };
    if secondary.is_present() {
        let _ = fa.free(secondary.address());
        // SAFETY: Clearing the slot in our own PML4.
        unsafe {
            recursive::write(own_pml4e, PageTableEntry::zero());
        }
    }
    drop(fa);
    tlb::flush_all();
    Ok(())
}

/// Current CR3 (page-table root physical address).
pub fn current_cr3() -> u64 {
    let (frame, _) = x86_64::registers::control::Cr3::read_raw();
    frame.start_address().as_u64()
}
