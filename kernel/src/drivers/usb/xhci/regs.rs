//! xHCI register blocks.
//!
//! The capability header at BAR0 advertises the offsets of the
//! Operational, Runtime, and Doorbell blocks; everything is accessed
//! through volatile reads and writes over the uncached MMIO mapping.
//! PORTSC needs care: several bits are write-1-to-clear, so blind
//! read-modify-write sequences go through [`PortSc::preserve_rw1c`].

use bitflags::bitflags;

/// Capability registers (read-only).
#[derive(Debug, Clone, Copy)]
pub struct CapabilityRegs {
    base: u64,
}

/// Operational registers.
#[derive(Debug, Clone, Copy)]
pub struct OperationalRegs {
    base: u64,
}

/// Runtime registers (interrupter sets).
#[derive(Debug, Clone, Copy)]
pub struct RuntimeRegs {
    base: u64,
}

/// Doorbell array.
#[derive(Debug, Clone, Copy)]
pub struct DoorbellRegs {
    base: u64,
}

/// All four blocks, derived from the capability header.
#[derive(Debug, Clone, Copy)]
pub struct Registers {
    pub cap: CapabilityRegs,
    pub op: OperationalRegs,
    pub rt: RuntimeRegs,
    pub db: DoorbellRegs,
    /// MMIO base (extended capabilities are offsets from here).
    mmio_base: u64,
}

fn read32(addr: u64) -> u32 {
    // SAFETY: Callers only pass addresses inside the mapped MMIO window.
    unsafe { core::ptr::read_volatile(addr as *const u32) }
}

fn write32(addr: u64, value: u32) {
    // SAFETY: As in `read32`.
    unsafe { core::ptr::write_volatile(addr as *mut u32, value) }
}

fn read64(addr: u64) -> u64 {
    // 64-bit registers are two ordered dword accesses (some controllers
    // reject 8-byte MMIO).
    read32(addr) as u64 | (read32(addr + 4) as u64) << 32
}

fn write64(addr: u64, value: u64) {
    write32(addr, value as u32);
    write32(addr + 4, (value >> 32) as u32);
}

impl Registers {
    /// Derive the blocks from the mapped BAR0 window.
    ///
    /// # Safety
    ///
    /// `mmio_base` must be an uncached mapping covering the controller's
    /// register file.
    pub unsafe fn from_mmio(mmio_base: u64) -> Self {
        let cap = CapabilityRegs { base: mmio_base };
        let op = OperationalRegs {
            base: mmio_base + cap.cap_length() as u64,
        };
        let rt = RuntimeRegs {
            base: mmio_base + (cap.rtsoff() & !0x1F) as u64,
        };
        let db = DoorbellRegs {
            base: mmio_base + (cap.dboff() & !0x3) as u64,
        };
        Self {
            cap,
            op,
            rt,
            db,
            mmio_base,
        }
    }

    /// First extended capability, if advertised.
    pub fn extended_capabilities(&self) -> ExtendedCapabilityIter {
        let offset_dwords = (self.cap.hccparams1() >> 16) & 0xFFFF;
        ExtendedCapabilityIter {
            mmio_base: self.mmio_base,
            next: if offset_dwords == 0 {
                0
            } else {
                offset_dwords as u64 * 4
            },
        }
    }
}

impl CapabilityRegs {
    pub fn cap_length(&self) -> u8 {
        read32(self.base) as u8
    }

    pub fn hci_version(&self) -> u16 {
        (read32(self.base) >> 16) as u16
    }

    pub fn hcsparams1(&self) -> u32 {
        read32(self.base + 0x04)
    }

    pub fn hcsparams2(&self) -> u32 {
        read32(self.base + 0x08)
    }

    pub fn hccparams1(&self) -> u32 {
        read32(self.base + 0x10)
    }

    pub fn dboff(&self) -> u32 {
        read32(self.base + 0x14)
    }

    pub fn rtsoff(&self) -> u32 {
        read32(self.base + 0x18)
    }

    /// Device slots the controller supports.
    pub fn max_slots(&self) -> u8 {
        self.hcsparams1() as u8
    }

    /// Root-hub ports.
    pub fn max_ports(&self) -> u8 {
        (self.hcsparams1() >> 24) as u8
    }

    /// Scratchpad buffers the controller demands (split hi/lo fields).
    pub fn max_scratchpad_buffers(&self) -> u16 {
        let p2 = self.hcsparams2();
        let hi = (p2 >> 21) & 0x1F;
        let lo = (p2 >> 27) & 0x1F;
        ((hi << 5) | lo) as u16
    }

    /// Whether the controller uses 64-byte context structures.
    pub fn context_size_64(&self) -> bool {
        self.hccparams1() & (1 << 2) != 0
    }
}

bitflags! {
    /// USBCMD bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        const RUN_STOP       = 1 << 0;
        const HOST_RESET     = 1 << 1;
        const INTERRUPTER_EN = 1 << 2;
    }
}

bitflags! {
    /// USBSTS bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        const HC_HALTED       = 1 << 0;
        const EVENT_INTERRUPT = 1 << 3;
        const PORT_CHANGE     = 1 << 4;
        const NOT_READY       = 1 << 11;
    }
}

impl OperationalRegs {
    pub fn usbcmd(&self) -> UsbCmd {
        UsbCmd::from_bits_retain(read32(self.base))
    }

    pub fn set_usbcmd(&self, value: UsbCmd) {
        write32(self.base, value.bits());
    }

    pub fn usbsts(&self) -> UsbSts {
        UsbSts::from_bits_retain(read32(self.base + 0x04))
    }

    /// Acknowledge write-1-to-clear status bits.
    pub fn ack_status(&self, bits: UsbSts) {
        write32(self.base + 0x04, bits.bits());
    }

    pub fn set_crcr(&self, value: u64) {
        write64(self.base + 0x18, value);
    }

    pub fn set_dcbaap(&self, value: u64) {
        write64(self.base + 0x30, value);
    }

    pub fn config(&self) -> u32 {
        read32(self.base + 0x38)
    }

    pub fn set_max_slots_enabled(&self, slots: u8) {
        let config = self.config();
        write32(self.base + 0x38, (config & !0xFF) | slots as u32);
    }

    /// PORTSC of root-hub port `port` (1-based).
    pub fn portsc(&self, port: u8) -> PortSc {
        PortSc::from_bits_retain(read32(self.port_base(port)))
    }

    pub fn set_portsc(&self, port: u8, value: PortSc) {
        write32(self.port_base(port), value.bits());
    }

    fn port_base(&self, port: u8) -> u64 {
        self.base + 0x400 + 0x10 * (port as u64 - 1)
    }
}

bitflags! {
    /// PORTSC bits the port state machine uses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortSc: u32 {
        /// Current connect status (RO).
        const CCS = 1 << 0;
        /// Port enabled/disabled (RW1C-disable).
        const PED = 1 << 1;
        /// Port reset (write 1 to start).
        const PR  = 1 << 4;
        /// Port power.
        const PP  = 1 << 9;
        /// Connect status change (RW1C).
        const CSC = 1 << 17;
        /// Port enable change (RW1C).
        const PEC = 1 << 18;
        /// Port reset change (RW1C).
        const PRC = 1 << 21;
    }
}

impl PortSc {
    /// All write-1-to-clear change bits plus PED (writing 1 disables the
    /// port).
    const RW1C: u32 = PortSc::PED.bits()
        | PortSc::CSC.bits()
        | PortSc::PEC.bits()
        | PortSc::PRC.bits();

    /// Port speed ID field (bits 13:10).
    pub fn speed_id(&self) -> u8 {
        ((self.bits() >> 10) & 0xF) as u8
    }

    /// A register image safe to write back without clearing change bits
    /// or disabling the port.
    pub fn preserve_rw1c(&self) -> PortSc {
        PortSc::from_bits_retain(self.bits() & !Self::RW1C)
    }
}

impl RuntimeRegs {
    fn interrupter(&self, index: u16) -> u64 {
        self.base + 0x20 + 32 * index as u64
    }

    pub fn iman(&self, index: u16) -> u32 {
        read32(self.interrupter(index))
    }

    /// IMAN write: bit 0 (pending) is RW1C, bit 1 enables delivery.
    pub fn set_iman(&self, index: u16, value: u32) {
        write32(self.interrupter(index), value);
    }

    pub fn imod(&self, index: u16) -> u32 {
        read32(self.interrupter(index) + 0x04)
    }

    pub fn set_erstsz(&self, index: u16, size: u16) {
        write32(self.interrupter(index) + 0x08, size as u32);
    }

    pub fn set_erstba(&self, index: u16, value: u64) {
        write64(self.interrupter(index) + 0x10, value);
    }

    /// ERDP write: bit 3 (event handler busy) is RW1C and set here to
    /// re-arm the interrupter.
    pub fn set_erdp(&self, index: u16, dequeue: u64) {
        write64(self.interrupter(index) + 0x18, dequeue | (1 << 3));
    }
}

impl DoorbellRegs {
    /// Ring doorbell `slot` with `target` (0 = command ring, else DCI).
    pub fn ring(&self, slot: u8, target: u8) {
        write32(self.base + 4 * slot as u64, target as u32);
    }
}

/// Iterator over the extended capability list.
pub struct ExtendedCapabilityIter {
    mmio_base: u64,
    /// Byte offset of the next capability, 0 when exhausted.
    next: u64,
}

/// One extended capability header.
#[derive(Debug, Clone, Copy)]
pub struct ExtendedCapability {
    pub id: u8,
    /// Byte address of the capability's first dword.
    pub base: u64,
}

/// Extended capability id: supported protocol.
pub const XCAP_SUPPORTED_PROTOCOL: u8 = 2;

impl Iterator for ExtendedCapabilityIter {
    type Item = ExtendedCapability;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == 0 {
            return None;
        }
        let base = self.mmio_base + self.next;
        let dword = read32(base);
        let cap = ExtendedCapability {
            id: dword as u8,
            base,
        };
        let next_offset = ((dword >> 8) & 0xFF) as u64 * 4;
        self.next = if next_offset == 0 {
            0
        } else {
            self.next + next_offset
        };
        Some(cap)
    }
}

/// Decoded supported-protocol capability: which ports speak which USB
/// major revision, and the slot type Enable Slot wants for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedProtocol {
    pub major_revision: u8,
    pub minor_revision: u8,
    /// First compatible port (1-based).
    pub port_offset: u8,
    pub port_count: u8,
    pub slot_type: u8,
}

impl SupportedProtocol {
    /// Decode from a capability base address.
    pub fn decode(cap: &ExtendedCapability) -> Self {
        let d0 = read32(cap.base);
        let d2 = read32(cap.base + 8);
        let d3 = read32(cap.base + 12);
        Self {
            major_revision: (d0 >> 24) as u8,
            minor_revision: (d0 >> 16) as u8,
            port_offset: d2 as u8,
            port_count: (d2 >> 8) as u8,
            slot_type: (d3 & 0x1F) as u8,
        }
    }

    /// Whether `port` (1-based) belongs to this protocol's range.
    pub fn covers_port(&self, port: u8) -> bool {
        port >= self.port_offset && port < self.port_offset + self.port_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_portsc_preserves_rw1c_bits() {
        let live = PortSc::CCS | PortSc::PED | PortSc::PP | PortSc::CSC | PortSc::PRC;
        let safe = live.preserve_rw1c();
        assert!(safe.contains(PortSc::CCS));
        assert!(safe.contains(PortSc::PP));
        assert!(!safe.contains(PortSc::PED), "PED write-1 would disable");
        assert!(!safe.contains(PortSc::CSC));
        assert!(!safe.contains(PortSc::PRC));
    }

    #[test]
    fn test_portsc_speed_field() {
        let raw = PortSc::from_bits_retain(3 << 10);
        assert_eq!(raw.speed_id(), 3);
    }

    #[test]
    fn test_scratchpad_count_field_split() {
        // hi = 1, lo = 2 -> (1 << 5) | 2 = 34. Build HCSPARAMS2 image and
        // decode through a fake capability block.
        let mut regs = [0u32; 16];
        regs[0] = 0x20; // CAPLENGTH
        regs[2] = (1 << 21) | (2 << 27); // HCSPARAMS2
        let cap = CapabilityRegs {
            base: regs.as_ptr() as u64,
        };
        assert_eq!(cap.max_scratchpad_buffers(), 34);
    }

    #[test]
    fn test_register_block_derivation() {
        let mut regs = alloc::vec![0u32; 0x100];
        regs[0] = 0x0100_0020; // CAPLENGTH 0x20, HCIVERSION 0x100
        regs[1] = (8 << 24) | (1 << 8) | 16; // 8 ports, 1 interrupter, 16 slots
        regs[5] = 0x40; // DBOFF
        regs[6] = 0x80; // RTSOFF
        let base = regs.as_ptr() as u64;
        // SAFETY: Buffer stands in for the MMIO window within the test.
        let r = unsafe { Registers::from_mmio(base) };
        assert_eq!(r.cap.max_slots(), 16);
        assert_eq!(r.cap.max_ports(), 8);
        assert_eq!(r.op.base, base + 0x20);
        assert_eq!(r.rt.base, base + 0x80);
        assert_eq!(r.db.base, base + 0x40);
    }

    #[test]
    fn test_supported_protocol_decoding() {
        // A USB 3.0 protocol capability covering ports 3..=4, slot type 0.
        let cap_mem = [
            0x0300_0002u32, // id 2, next 0, minor 0, major 3
            0x2055_4253,    // "USB "
            (2u32 << 8) | 3, // port offset 3, count 2
            0,
        ];
        let cap = ExtendedCapability {
            id: 2,
            base: cap_mem.as_ptr() as u64,
        };
        let proto = SupportedProtocol::decode(&cap);
        assert_eq!(proto.major_revision, 3);
        assert_eq!(proto.port_offset, 3);
        assert_eq!(proto.port_count, 2);
        assert!(proto.covers_port(3));
        assert!(proto.covers_port(4));
        assert!(!proto.covers_port(2));
        assert!(!proto.covers_port(5));
    }

    #[test]
    fn test_extended_capability_walk() {
        // Two capabilities: id 1 at +0x40 (next = 4 dwords), id 2 at +0x50.
        let mut mem = alloc::vec![0u32; 0x40];
        mem[0x10] = (4 << 8) | 1;
        mem[0x14] = 2;
        let base = mem.as_ptr() as u64;
        let iter = ExtendedCapabilityIter {
            mmio_base: base,
            next: 0x40,
        };
        let caps: alloc::vec::Vec<_> = iter.map(|c| c.id).collect();
        assert_eq!(caps, alloc::vec![1, 2]);
    }
}
