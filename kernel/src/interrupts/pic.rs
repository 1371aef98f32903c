//! Legacy 8259 PIC quiesce.
//!
//! When the MADT reports `PCAT_COMPAT`, the dual 8259 exists and powers up
//! mapped over the CPU-exception range. It is remapped directly above the
//! exceptions and then fully masked; the I/O APIC handles everything from
//! there. The PIC stays dormant — its two spurious vectors resolve to the
//! default stubs, which ignore unprovided vectors.

/// Remapped master PIC base vector (directly above the exceptions).
pub const PIC_MASTER_OFFSET: u8 = 0x20;

/// Remapped slave PIC base vector.
pub const PIC_SLAVE_OFFSET: u8 = 0x28;

/// Remap the 8259 pair above the exception range and mask every line.
///
/// # Safety
///
/// Must run once, with interrupts disabled, before the I/O APIC takes
/// over.
pub unsafe fn remap_and_mask() {
    // SAFETY: The offsets avoid the exception range, and this is the only
    // code touching the standard 8259 ports, once, during bring-up.
    unsafe {
        let mut pics = pic8259::ChainedPics::new(PIC_MASTER_OFFSET, PIC_SLAVE_OFFSET);
        pics.initialize();
        pics.disable();
    }
    log::info!(
        target: "irq",
        "8259 remapped to {:#x}/{:#x} and masked",
        PIC_MASTER_OFFSET,
        PIC_SLAVE_OFFSET
    );
}
