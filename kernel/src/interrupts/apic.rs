//! Local APIC and I/O APIC programming.
//!
//! The Local APIC delivers to the local CPU; each I/O APIC discovered in
//! the MADT routes external lines. Both register windows are mapped
//! uncached through the general mapping window. Every CPU gets a unique
//! power-of-two logical-destination ID so MSI and redirection entries can
//! target it in logical mode.

use alloc::vec::Vec;

use x86_64::registers::model_specific::Msr;

use crate::{
    acpi::{IoApicEntry, MadtInfo, Polarity, TriggerMode},
    error::{KernelError, KernelResult},
    mm::{page_table::PteFlags, pager},
    sync::GlobalState,
};

/// IA32_APIC_BASE MSR.
const IA32_APIC_BASE_MSR: u32 = 0x1B;

/// Global xAPIC enable bit in IA32_APIC_BASE.
const IA32_APIC_BASE_ENABLE: u64 = 1 << 11;

// ---------------------------------------------------------------------------
// Local APIC register offsets
// ---------------------------------------------------------------------------

const LAPIC_ID: u32 = 0x020;
const LAPIC_EOI: u32 = 0x0B0;
const LAPIC_LDR: u32 = 0x0D0;
const LAPIC_DFR: u32 = 0x0E0;
const LAPIC_SVR: u32 = 0x0F0;
const LAPIC_ESR: u32 = 0x280;
const LAPIC_LVT_TIMER: u32 = 0x320;
const LAPIC_TIMER_INIT_COUNT: u32 = 0x380;
const LAPIC_TIMER_CUR_COUNT: u32 = 0x390;
const LAPIC_TIMER_DIV: u32 = 0x3E0;

/// LVT mask bit.
const LVT_MASK: u32 = 1 << 16;

/// LVT timer periodic mode (bits 18:17 = 01).
const TIMER_MODE_PERIODIC: u32 = 0b01 << 17;

/// Spurious vector: 0xFF, with the software-enable bit and every other
/// defined SVR bit raised.
const SVR_VALUE: u32 = 0x1FF;

// ---------------------------------------------------------------------------
// Local APIC
// ---------------------------------------------------------------------------

/// Per-CPU Local APIC handle over its uncached MMIO window.
pub struct LocalApic {
    base: u64,
}

impl LocalApic {
    fn read(&self, offset: u32) -> u32 {
        // SAFETY: Offsets are architectural LAPIC registers inside the
        // mapped window; volatile keeps the access ordered.
        unsafe { core::ptr::read_volatile((self.base + offset as u64) as *const u32) }
    }

    fn write(&self, offset: u32, value: u32) {
        // SAFETY: As in `read`.
        unsafe { core::ptr::write_volatile((self.base + offset as u64) as *mut u32, value) }
    }

    /// Physical APIC ID of this CPU.
    pub fn id(&self) -> u8 {
        (self.read(LAPIC_ID) >> 24) as u8
    }

    /// Signal end-of-interrupt.
    pub fn send_eoi(&self) {
        self.write(LAPIC_EOI, 0);
    }

    /// Start the LAPIC timer in periodic mode.
    pub fn setup_timer(&self, vector: u8, divide: u8, initial_count: u32) {
        self.write(LAPIC_TIMER_INIT_COUNT, 0);
        self.write(LAPIC_TIMER_DIV, divide as u32);
        self.write(LAPIC_LVT_TIMER, TIMER_MODE_PERIODIC | vector as u32);
        self.write(LAPIC_TIMER_INIT_COUNT, initial_count);
    }

    /// Stop the LAPIC timer.
    pub fn stop_timer(&self) {
        self.write(LAPIC_TIMER_INIT_COUNT, 0);
        self.write(LAPIC_LVT_TIMER, LVT_MASK);
    }

    /// Current countdown value.
    pub fn timer_count(&self) -> u32 {
        self.read(LAPIC_TIMER_CUR_COUNT)
    }
}

// ---------------------------------------------------------------------------
// I/O APIC
// ---------------------------------------------------------------------------

const IOREGSEL: u64 = 0x00;
const IOWIN: u64 = 0x10;
const IOAPIC_REG_ID: u32 = 0x00;
const IOAPIC_REG_VER: u32 = 0x01;
const IOAPIC_REDTBL_BASE: u32 = 0x10;

/// A 64-bit I/O APIC redirection entry.
///
/// Bits 7:0 vector; 10:8 delivery mode; 11 destination mode; 13 polarity
/// (1 = active low); 15 trigger (1 = level); 16 mask; 63:56 destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectionEntry {
    raw: u64,
}

impl RedirectionEntry {
    /// Masked fixed-delivery entry carrying `vector`.
    pub const fn new(vector: u8) -> Self {
        Self {
            raw: vector as u64 | 1 << 16,
        }
    }

    pub fn set_logical_destination(&mut self, logical_id: u8) {
        self.raw |= 1 << 11;
        self.raw = (self.raw & !(0xFFu64 << 56)) | (logical_id as u64) << 56;
    }

    pub fn set_polarity(&mut self, polarity: Polarity) {
        match polarity {
            Polarity::ActiveLow => self.raw |= 1 << 13,
            _ => self.raw &= !(1 << 13),
        }
    }

    pub fn set_trigger(&mut self, trigger: TriggerMode) {
        match trigger {
            TriggerMode::Level => self.raw |= 1 << 15,
            _ => self.raw &= !(1 << 15),
        }
    }

    pub fn set_masked(&mut self, masked: bool) {
        if masked {
            self.raw |= 1 << 16;
        } else {
            self.raw &= !(1 << 16);
        }
    }

    pub fn vector(&self) -> u8 {
        self.raw as u8
    }

    pub fn is_masked(&self) -> bool {
        self.raw & (1 << 16) != 0
    }

    pub fn low(&self) -> u32 {
        self.raw as u32
    }

    pub fn high(&self) -> u32 {
        (self.raw >> 32) as u32
    }
}

/// One I/O APIC with its GSI window.
pub struct IoApic {
    base: u64,
    gsi_base: u32,
    entries: u8,
}

impl IoApic {
    fn read_register(&self, reg: u32) -> u32 {
        // SAFETY: IOREGSEL/IOWIN indirect access inside the mapped window;
        // volatile keeps select and data ordered.
        unsafe {
            core::ptr::write_volatile((self.base + IOREGSEL) as *mut u32, reg);
            core::ptr::read_volatile((self.base + IOWIN) as *const u32)
        }
    }

    fn write_register(&self, reg: u32, value: u32) {
        // SAFETY: As in `read_register`.
        unsafe {
            core::ptr::write_volatile((self.base + IOREGSEL) as *mut u32, reg);
            core::ptr::write_volatile((self.base + IOWIN) as *mut u32, value);
        }
    }

    fn max_redirection_entries(&self) -> u8 {
        (((self.read_register(IOAPIC_REG_VER) >> 16) & 0xFF) + 1) as u8
    }

    fn write_redirection(&self, pin: u8, entry: RedirectionEntry) {
        let reg = IOAPIC_REDTBL_BASE + pin as u32 * 2;
        // High dword first so a transient state cannot unmask early.
        self.write_register(reg + 1, entry.high());
        self.write_register(reg, entry.low());
    }

    /// Whether `gsi` falls in this controller's window.
    fn owns_gsi(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi < self.gsi_base + self.entries as u32
    }
}

// ---------------------------------------------------------------------------
// Fabric state
// ---------------------------------------------------------------------------

struct ApicFabric {
    lapic: LocalApic,
    ioapics: Vec<IoApic>,
    overrides: MadtInfo,
    /// This CPU's logical destination ID (power-of-two bitmask).
    logical_id: u8,
}

// SAFETY: MMIO base addresses are plain integers; the GlobalState lock
// serializes all register access.
unsafe impl Send for ApicFabric {}

static FABRIC: GlobalState<ApicFabric> = GlobalState::new();

/// All fabric access goes through here: the ISR EOI path takes the same
/// lock, so task-side sections must hold it with interrupts off.
fn with_fabric<R>(f: impl FnOnce(&ApicFabric) -> R) -> Option<R> {
    crate::interrupts::without_interrupts(|| FABRIC.with(f))
}

fn cpuid_has_apic() -> bool {
    // SAFETY: CPUID leaf 1 is unconditionally available in long mode.
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf.edx & (1 << 9) != 0
}

/// Bring up the BSP's Local APIC and every MADT-listed I/O APIC.
///
/// # Safety
///
/// Runs once on the BSP with interrupts disabled; the Pager must be live.
pub unsafe fn init(madt: &MadtInfo) -> KernelResult<()> {
    if !cpuid_has_apic() {
        return Err(KernelError::DeviceError {
            device: "LAPIC",
            code: 0,
        });
    }

    // Verify the global xAPIC enable; firmware leaves it set on the BSP.
    let mut base_msr = Msr::new(IA32_APIC_BASE_MSR);
    // SAFETY: Architectural MSR read in ring 0.
    let base_value = unsafe { base_msr.read() };
    if base_value & IA32_APIC_BASE_ENABLE == 0 {
        // SAFETY: Setting the architectural enable bit back.
        unsafe {
            base_msr.write(base_value | IA32_APIC_BASE_ENABLE);
        }
    }

    let lapic_phys = madt.lapic_address & !0xFFF;
    // SAFETY: MMIO mapping of the architectural LAPIC page, uncached.
    let lapic_virt = unsafe {
        pager::map_general(
            lapic_phys,
            1,
            PteFlags::WRITABLE | PteFlags::NO_CACHE | PteFlags::NO_EXECUTE,
        )?
    };
    let lapic = LocalApic { base: lapic_virt };

    // Spurious vector 0xFF with every defined SVR bit set, then a clean
    // error-status and in-service state.
    lapic.write(LAPIC_SVR, SVR_VALUE);
    lapic.write(LAPIC_ESR, 0);
    lapic.write(LAPIC_ESR, 0);
    lapic.send_eoi();

    // Unique logical destination: BSP gets bit 0; secondaries would take
    // the next free bit of the flat-model byte.
    let logical_id = 1u8;
    lapic.write(LAPIC_DFR, 0xFFFF_FFFF);
    lapic.write(LAPIC_LDR, (logical_id as u32) << 24);

    log::info!(
        target: "irq",
        "LAPIC id {} at {:#x}, logical id {:#04b}",
        lapic.id(),
        lapic_phys,
        logical_id
    );

    let mut ioapics = Vec::new();
    for entry in &madt.ioapics {
        // SAFETY: MADT-reported MMIO window, uncached.
        let virt = unsafe {
            pager::map_general(
                entry.address as u64 & !0xFFF,
                1,
                PteFlags::WRITABLE | PteFlags::NO_CACHE | PteFlags::NO_EXECUTE,
            )?
        };
        let mut ioapic = IoApic {
            base: virt,
            gsi_base: entry.gsi_base,
            entries: 0,
        };
        ioapic.write_register(IOAPIC_REG_ID, (entry.id as u32) << 24);
        ioapic.entries = ioapic.max_redirection_entries();
        // Everything starts masked.
        for pin in 0..ioapic.entries {
            ioapic.write_redirection(pin, RedirectionEntry::new(0xFF));
        }
        log::info!(
            target: "irq",
            "I/O APIC {}: GSI {}..{} at {:#x}",
            entry.id,
            entry.gsi_base,
            entry.gsi_base + ioapic.entries as u32,
            entry.address
        );
        ioapics.push(ioapic);
    }

    FABRIC
        .init(ApicFabric {
            lapic,
            ioapics,
            overrides: madt.clone(),
            logical_id,
        })
        .map_err(|_| KernelError::AlreadyExists { resource: "APIC" })
}

/// Route an ISA IRQ to `vector` on this CPU, honoring MADT overrides.
pub fn setup_irq(isa_irq: u8, vector: u8, masked: bool) -> KernelResult<()> {
    with_fabric(|fabric| {
            let (gsi, polarity, trigger) = fabric.overrides.resolve_isa_irq(isa_irq);
            let ioapic = fabric
                .ioapics
                .iter()
                .find(|io| io.owns_gsi(gsi))
                .ok_or(KernelError::NotFound { resource: "GSI" })?;
            let mut entry = RedirectionEntry::new(vector);
            entry.set_logical_destination(fabric.logical_id);
            entry.set_polarity(polarity);
            entry.set_trigger(trigger);
            entry.set_masked(masked);
            ioapic.write_redirection((gsi - ioapic.gsi_base) as u8, entry);
            log::debug!(
                target: "irq",
                "ISA IRQ {} -> GSI {} vector {:#x} ({:?}/{:?}{})",
                isa_irq,
                gsi,
                vector,
                polarity,
                trigger,
                if masked { ", masked" } else { "" }
            );
            Ok(())
        })
        .unwrap_or(Err(KernelError::NotInitialized { subsystem: "APIC" }))
}

/// Mask or unmask a previously routed ISA IRQ.
pub fn set_irq_masked(isa_irq: u8, vector: u8, masked: bool) -> KernelResult<()> {
    setup_irq(isa_irq, vector, masked)
}

/// Signal end-of-interrupt on the local CPU.
pub fn send_eoi() {
    let _ = with_fabric(|fabric| fabric.lapic.send_eoi());
}

/// Physical LAPIC MMIO base (for MSI address construction).
pub fn lapic_physical_base() -> u64 {
    with_fabric(|fabric| fabric.overrides.lapic_address & !0xFFF)
        .unwrap_or(0xFEE0_0000)
}

/// This CPU's logical destination ID.
pub fn logical_id() -> u8 {
    with_fabric(|fabric| fabric.logical_id).unwrap_or(1)
}

/// Program the LAPIC timer (periodic) on this CPU.
pub fn setup_lapic_timer(vector: u8, divide: u8, initial_count: u32) -> KernelResult<()> {
    with_fabric(|fabric| {
            fabric.lapic.setup_timer(vector, divide, initial_count);
            Ok(())
        })
        .unwrap_or(Err(KernelError::NotInitialized { subsystem: "APIC" }))
}

/// Stop the LAPIC timer on this CPU.
pub fn stop_lapic_timer() {
    let _ = with_fabric(|fabric| fabric.lapic.stop_timer());
}

/// Current LAPIC timer countdown value, if the fabric is up.
pub fn with_timer_count() -> Option<u32> {
    with_fabric(|fabric| fabric.lapic.timer_count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirection_entry_encoding() {
        let mut entry = RedirectionEntry::new(0x42);
        assert_eq!(entry.vector(), 0x42);
        assert!(entry.is_masked());

        entry.set_logical_destination(0b0000_0001);
        entry.set_polarity(Polarity::ActiveLow);
        entry.set_trigger(TriggerMode::Level);
        entry.set_masked(false);

        assert_eq!(entry.low() & 0xFF, 0x42);
        assert_ne!(entry.low() & (1 << 11), 0, "logical destination mode");
        assert_ne!(entry.low() & (1 << 13), 0, "active low");
        assert_ne!(entry.low() & (1 << 15), 0, "level triggered");
        assert_eq!(entry.low() & (1 << 16), 0, "unmasked");
        assert_eq!(entry.high() >> 24, 0b0000_0001, "destination byte");
    }

    #[test]
    fn test_redirection_entry_edge_high_clears_bits() {
        let mut entry = RedirectionEntry::new(0x30);
        entry.set_polarity(Polarity::ActiveLow);
        entry.set_trigger(TriggerMode::Level);
        entry.set_polarity(Polarity::ActiveHigh);
        entry.set_trigger(TriggerMode::Edge);
        assert_eq!(entry.low() & (1 << 13), 0);
        assert_eq!(entry.low() & (1 << 15), 0);
    }

    #[test]
    fn test_svr_value_carries_spurious_vector() {
        assert_eq!(SVR_VALUE & 0xFF, 0xFF);
        assert_ne!(SVR_VALUE & (1 << 8), 0, "software enable");
    }
}
