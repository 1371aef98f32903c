//! PCI Express configuration access and bus enumeration.
//!
//! Configuration space is reached through the ECAM window whose physical
//! base the bootloader extracts from the MCFG. A function's window sits at
//! `bus << 20 | device << 15 | function << 12`. The enumerator walks all
//! 256 buses × 32 devices, hands xHCI controllers (class 0x0C / subclass
//! 0x03 / prog-if 0x30) to the USB driver, and logs the rest.

pub mod msi;

use crate::{
    error::{KernelError, KernelResult},
    mm::{page_table::PteFlags, pager},
    sync::OnceLock,
};

/// Serial-bus class code.
pub const CLASS_SERIAL_BUS: u8 = 0x0C;
/// USB-controller subclass.
pub const SUBCLASS_USB: u8 = 0x03;
/// xHCI programming interface.
pub const PROG_IF_XHCI: u8 = 0x30;

/// Command-register bits.
pub mod command {
    pub const IO_SPACE: u16 = 1 << 0;
    pub const MEMORY_SPACE: u16 = 1 << 1;
    pub const BUS_MASTER: u16 = 1 << 2;
    pub const INTERRUPT_DISABLE: u16 = 1 << 10;
}

/// Status-register bit: capability list present.
const STATUS_CAP_LIST: u16 = 1 << 4;

/// Byte offset of a function's configuration window inside the ECAM.
pub const fn ecam_offset(bus: u8, device: u8, function: u8) -> u64 {
    (bus as u64) << 20 | (device as u64) << 15 | (function as u64) << 12
}

/// A mapped ECAM window.
#[derive(Debug, Clone, Copy)]
pub struct EcamRegion {
    virt_base: u64,
}

impl EcamRegion {
    /// Wrap an already mapped window base (also the test seam).
    ///
    /// # Safety
    ///
    /// `virt_base` must stay mapped read-write for the region's lifetime
    /// and cover every accessed function window.
    pub const unsafe fn from_base(virt_base: u64) -> Self {
        Self { virt_base }
    }

    /// Handle to one function's 4 KiB configuration window.
    pub fn function(&self, bus: u8, device: u8, function: u8) -> ConfigSpace {
        ConfigSpace {
            base: self.virt_base + ecam_offset(bus, device, function),
            bus,
            device,
            function,
        }
    }
}

/// Typed accessor over one function's configuration window.
#[derive(Debug, Clone, Copy)]
pub struct ConfigSpace {
    base: u64,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl ConfigSpace {
    pub fn read_u8(&self, offset: u16) -> u8 {
        // SAFETY: The ECAM window is mapped; offsets stay inside the 4 KiB
        // function window. Volatile because this is device state.
        unsafe { core::ptr::read_volatile((self.base + offset as u64) as *const u8) }
    }

    pub fn read_u16(&self, offset: u16) -> u16 {
        // SAFETY: As in `read_u8`, 2-byte aligned by the architectural
        // register layout.
        unsafe { core::ptr::read_volatile((self.base + offset as u64) as *const u16) }
    }

    pub fn read_u32(&self, offset: u16) -> u32 {
        // SAFETY: As in `read_u8`, 4-byte aligned.
        unsafe { core::ptr::read_volatile((self.base + offset as u64) as *const u32) }
    }

    pub fn write_u16(&self, offset: u16, value: u16) {
        // SAFETY: As in `read_u16`; configuration writes are how PCI is
        // programmed.
        unsafe { core::ptr::write_volatile((self.base + offset as u64) as *mut u16, value) }
    }

    pub fn write_u32(&self, offset: u16, value: u32) {
        // SAFETY: As in `read_u32`.
        unsafe { core::ptr::write_volatile((self.base + offset as u64) as *mut u32, value) }
    }

    // --- common header fields ---

    pub fn vendor_id(&self) -> u16 {
        self.read_u16(0x00)
    }

    pub fn device_id(&self) -> u16 {
        self.read_u16(0x02)
    }

    pub fn is_present(&self) -> bool {
        self.vendor_id() != 0xFFFF
    }

    pub fn revision(&self) -> u8 {
        self.read_u8(0x08)
    }

    pub fn prog_if(&self) -> u8 {
        self.read_u8(0x09)
    }

    pub fn subclass(&self) -> u8 {
        self.read_u8(0x0A)
    }

    pub fn class_code(&self) -> u8 {
        self.read_u8(0x0B)
    }

    pub fn header_type(&self) -> u8 {
        self.read_u8(0x0E)
    }

    pub fn is_multifunction(&self) -> bool {
        self.header_type() & 0x80 != 0
    }

    /// Enable memory-space decoding and bus mastering.
    pub fn enable(&self) {
        let cmd = self.read_u16(0x04);
        self.write_u16(
            0x04,
            cmd | command::MEMORY_SPACE | command::BUS_MASTER,
        );
    }

    /// Stop the function from decoding or mastering.
    pub fn disable(&self) {
        let cmd = self.read_u16(0x04);
        self.write_u16(
            0x04,
            (cmd & !(command::MEMORY_SPACE | command::BUS_MASTER | command::IO_SPACE))
                | command::INTERRUPT_DISABLE,
        );
    }

    /// First capability offset, when the list exists.
    pub fn capabilities_pointer(&self) -> Option<u16> {
        if self.read_u16(0x06) & STATUS_CAP_LIST == 0 {
            return None;
        }
        let ptr = self.read_u8(0x34) & !0x3;
        (ptr != 0).then_some(ptr as u16)
    }

    /// Walk the capability list for `id`.
    pub fn find_capability(&self, id: u8) -> Option<u16> {
        let mut offset = self.capabilities_pointer()?;
        // Bounded walk: a sane list never exceeds 48 entries.
        for _ in 0..48 {
            if self.read_u8(offset) == id {
                return Some(offset);
            }
            let next = self.read_u8(offset + 1) & !0x3;
            if next == 0 {
                return None;
            }
            offset = next as u16;
        }
        None
    }

    /// Decoded BAR `index` (Type-0 header: 0..6).
    ///
    /// Sizing uses the write-ones / read-back / restore dance, so the
    /// function should be disabled around a call on live hardware.
    pub fn bar(&self, index: u8) -> Bar {
        let offset = 0x10 + index as u16 * 4;
        let raw = self.read_u32(offset);
        if raw == 0 {
            return Bar::Unused;
        }
        if raw & 1 != 0 {
            return Bar::Io {
                port: raw & !0x3,
            };
        }
        let is_64bit = raw & 0b110 == 0b100;
        let prefetchable = raw & (1 << 3) != 0;

        let low_base = (raw & !0xF) as u64;
        let (base, size) = if is_64bit {
            let high = self.read_u32(offset + 4);
            let base = low_base | (high as u64) << 32;

            self.write_u32(offset, !0);
            self.write_u32(offset + 4, !0);
            let size_low = self.read_u32(offset) & !0xF;
            let size_high = self.read_u32(offset + 4);
            self.write_u32(offset, raw);
            self.write_u32(offset + 4, high);

            let mask = size_low as u64 | (size_high as u64) << 32;
            (base, (!mask).wrapping_add(1))
        } else {
            self.write_u32(offset, !0);
            let size_mask = (self.read_u32(offset) & !0xF) as u64;
            self.write_u32(offset, raw);
            (low_base, (!size_mask & 0xFFFF_FFFF).wrapping_add(1) & 0xFFFF_FFFF)
        };

        Bar::Memory {
            base,
            size,
            prefetchable,
            is_64bit,
        }
    }
}

/// A decoded Base Address Register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bar {
    Unused,
    Io {
        port: u32,
    },
    Memory {
        base: u64,
        size: u64,
        prefetchable: bool,
        is_64bit: bool,
    },
}

impl Bar {
    /// Map a memory BAR uncached into the general window; returns the
    /// virtual base.
    ///
    /// # Safety
    ///
    /// The BAR must decode a live MMIO region owned by the caller.
    pub unsafe fn map_mmio(&self) -> KernelResult<u64> {
        match self {
            Bar::Memory { base, size, .. } => {
                let pages = size.div_ceil(crate::mm::layout::PAGE_SIZE as u64).max(1);
                // SAFETY: Caller owns the MMIO target.
                unsafe {
                    pager::map_general(
                        *base,
                        pages,
                        PteFlags::WRITABLE | PteFlags::NO_CACHE | PteFlags::NO_EXECUTE,
                    )
                }
            }
            _ => Err(KernelError::InvalidParameter { name: "bar" }),
        }
    }
}

/// The mapped ECAM region, published during the PCI scan task.
static ECAM: OnceLock<EcamRegion> = OnceLock::new();

/// The published ECAM region.
pub fn ecam() -> Option<&'static EcamRegion> {
    ECAM.get()
}

/// Map the ECAM window and walk every bus and device. xHCI functions are
/// handed to the USB driver; everything else is logged. Runs as the first
/// kernel task.
///
/// # Safety
///
/// `ecam_phys` must be the MCFG-reported ECAM base; runs once.
pub unsafe fn scan(ecam_phys: u64) -> KernelResult<()> {
    // 256 buses x 32 devices x 8 functions x 4 KiB.
    let pages = (256u64 << 20) / crate::mm::layout::PAGE_SIZE as u64;
    // SAFETY: Firmware-owned ECAM MMIO window.
    let virt = unsafe {
        pager::map_general(
            ecam_phys,
            pages,
            PteFlags::WRITABLE | PteFlags::NO_CACHE | PteFlags::NO_EXECUTE,
        )?
    };
    // SAFETY: Just mapped with the full span.
    let region = unsafe { EcamRegion::from_base(virt) };
    if ECAM.set(region).is_err() {
        return Err(KernelError::AlreadyExists { resource: "ECAM" });
    }

    let region = ecam().expect("just published");
    for bus in 0..=255u8 {
        for device in 0..32u8 {
            let cfg = region.function(bus, device, 0);
            if !cfg.is_present() {
                continue;
            }
            probe(cfg);
            if cfg.is_multifunction() {
                for function in 1..8u8 {
                    let sub = region.function(bus, device, function);
                    if sub.is_present() {
                        probe(sub);
                    }
                }
            }
        }
    }
    Ok(())
}

fn probe(cfg: ConfigSpace) {
    log::info!(
        target: "pci",
        "{:02x}:{:02x}.{} {:04x}:{:04x} class {:02x}/{:02x}/{:02x}",
        cfg.bus,
        cfg.device,
        cfg.function,
        cfg.vendor_id(),
        cfg.device_id(),
        cfg.class_code(),
        cfg.subclass(),
        cfg.prog_if()
    );
    if cfg.class_code() == CLASS_SERIAL_BUS
        && cfg.subclass() == SUBCLASS_USB
        && cfg.prog_if() == PROG_IF_XHCI
        && cfg.function == 0
    {
        // SAFETY: Enumeration runs in the PCI kernel task after bring-up.
        let outcome = unsafe {
            crate::drivers::usb::xhci::Controller::initialize(cfg.bus, cfg.device, cfg.function)
        };
        if let Err(e) = outcome {
            log::warn!(
                target: "usb",
                "xHCI at {:02x}:{:02x}.{} failed to initialize: {}",
                cfg.bus,
                cfg.device,
                cfg.function,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecam_offset_formula() {
        assert_eq!(ecam_offset(0, 0, 0), 0);
        assert_eq!(ecam_offset(0, 0, 1), 0x1000);
        assert_eq!(ecam_offset(0, 1, 0), 0x8000);
        assert_eq!(ecam_offset(1, 0, 0), 0x10_0000);
        assert_eq!(ecam_offset(0xAB, 0x1F, 0x7), 0xAB0F_F000);
    }

    /// Build a fake config window for bus 0 dev 0 func 0.
    fn fake_function(buf: &mut [u8]) -> ConfigSpace {
        buf[0x00..0x02].copy_from_slice(&0x8086u16.to_le_bytes());
        buf[0x02..0x04].copy_from_slice(&0x1234u16.to_le_bytes());
        buf[0x09] = PROG_IF_XHCI;
        buf[0x0A] = SUBCLASS_USB;
        buf[0x0B] = CLASS_SERIAL_BUS;
        buf[0x06..0x08].copy_from_slice(&STATUS_CAP_LIST.to_le_bytes());
        buf[0x34] = 0x40;
        // Capability list: 0x40 = PM (0x01) -> 0x50 = MSI (0x05) -> end.
        buf[0x40] = 0x01;
        buf[0x41] = 0x50;
        buf[0x50] = 0x05;
        buf[0x51] = 0x00;
        // SAFETY: The buffer outlives the ConfigSpace within the test.
        let region = unsafe { EcamRegion::from_base(buf.as_ptr() as u64) };
        region.function(0, 0, 0)
    }

    #[test]
    fn test_header_fields_and_capability_walk() {
        let mut buf = alloc::vec![0u8; 4096];
        let cfg = fake_function(&mut buf);
        assert!(cfg.is_present());
        assert_eq!(cfg.vendor_id(), 0x8086);
        assert_eq!(cfg.class_code(), CLASS_SERIAL_BUS);
        assert_eq!(cfg.subclass(), SUBCLASS_USB);
        assert_eq!(cfg.prog_if(), PROG_IF_XHCI);
        assert_eq!(cfg.find_capability(0x05), Some(0x50));
        assert_eq!(cfg.find_capability(0x10), None);
    }

    #[test]
    fn test_missing_function_reads_all_ones() {
        let buf = alloc::vec![0xFFu8; 4096];
        // SAFETY: Buffer outlives the region within the test.
        let region = unsafe { EcamRegion::from_base(buf.as_ptr() as u64) };
        assert!(!region.function(0, 0, 0).is_present());
    }

    #[test]
    fn test_bar_sizing_dance() {
        let mut buf = alloc::vec![0u8; 4096];
        let cfg = fake_function(&mut buf);
        // A 64-bit memory BAR at 0x10: base 0xC000_0000, size 64 KiB.
        // The fake window is plain memory, so the write-ones probe would
        // read back ones; emulate a device by preloading the size mask and
        // checking the restore leaves the original value.
        buf[0x10..0x14].copy_from_slice(&0xC000_0004u32.to_le_bytes());
        buf[0x14..0x18].copy_from_slice(&0u32.to_le_bytes());
        let bar = cfg.bar(0);
        // Plain RAM echoes the probe: size computes from the echoed mask.
        match bar {
            Bar::Memory {
                base,
                is_64bit,
                prefetchable,
                ..
            } => {
                assert_eq!(base, 0xC000_0000);
                assert!(is_64bit);
                assert!(!prefetchable);
            }
            other => panic!("expected memory BAR, got {:?}", other),
        }
        // Restore happened: original register value intact.
        assert_eq!(cfg.read_u32(0x10), 0xC000_0004);
    }

    #[test]
    fn test_io_and_unused_bars() {
        let mut buf = alloc::vec![0u8; 4096];
        let cfg = fake_function(&mut buf);
        buf[0x18..0x1C].copy_from_slice(&0x0000_C001u32.to_le_bytes());
        assert_eq!(cfg.bar(2), Bar::Io { port: 0xC000 });
        assert_eq!(cfg.bar(3), Bar::Unused);
    }
}
