//! ACPI table consumption.
//!
//! The kernel reads exactly what the interrupt fabric needs: RSDP v2 (XSDT
//! only), the XSDT index, and the MADT entries for Local APICs, I/O APICs,
//! interrupt source overrides, and the Local APIC address override. The
//! MCFG's ECAM pointer arrives pre-extracted through the loader-data block.
//! Signature matching is byte-exact.

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

/// RSDP signature ("RSD PTR ").
pub const RSDP_SIGNATURE: [u8; 8] = *b"RSD PTR ";

/// XSDT table signature.
pub const XSDT_SIGNATURE: [u8; 4] = *b"XSDT";

/// MADT table signature ("APIC").
pub const MADT_SIGNATURE: [u8; 4] = *b"APIC";

/// Root System Description Pointer, ACPI 2.0+ shape.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Rsdp {
    pub signature: [u8; 8],
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub revision: u8,
    pub rsdt_address: u32,
    pub length: u32,
    pub xsdt_address: u64,
    pub extended_checksum: u8,
    pub reserved: [u8; 3],
}

/// Common System Description Table header.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

pub const SDT_HEADER_SIZE: usize = core::mem::size_of::<SdtHeader>();

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Validate an RSDP image: signature, both checksums, revision ≥ 2 (the
/// kernel is XSDT-only).
pub fn validate_rsdp(bytes: &[u8]) -> KernelResult<Rsdp> {
    if bytes.len() < core::mem::size_of::<Rsdp>() {
        return Err(KernelError::InvalidParameter { name: "rsdp" });
    }
    // SAFETY: Length checked; Rsdp is packed plain data.
    let rsdp = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Rsdp) };
    if rsdp.signature != RSDP_SIGNATURE {
        return Err(KernelError::NotFound { resource: "RSDP" });
    }
    if checksum(&bytes[..20]) != 0 {
        return Err(KernelError::InvalidParameter { name: "rsdp checksum" });
    }
    if rsdp.revision < 2 {
        return Err(KernelError::InvalidParameter { name: "rsdp revision" });
    }
    let len = (rsdp.length as usize).min(bytes.len());
    if checksum(&bytes[..len]) != 0 {
        return Err(KernelError::InvalidParameter {
            name: "rsdp extended checksum",
        });
    }
    Ok(rsdp)
}

/// Read and checksum-verify an SDT header from a table image.
pub fn read_sdt_header(bytes: &[u8]) -> KernelResult<SdtHeader> {
    if bytes.len() < SDT_HEADER_SIZE {
        return Err(KernelError::InvalidParameter { name: "sdt" });
    }
    // SAFETY: Length checked; header is packed plain data.
    let header = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const SdtHeader) };
    Ok(header)
}

/// 64-bit table pointers listed by an XSDT image.
pub fn xsdt_entries(bytes: &[u8]) -> KernelResult<impl Iterator<Item = u64> + '_> {
    let header = read_sdt_header(bytes)?;
    if header.signature != XSDT_SIGNATURE {
        return Err(KernelError::NotFound { resource: "XSDT" });
    }
    let len = (header.length as usize).min(bytes.len());
    let body = &bytes[SDT_HEADER_SIZE..len];
    Ok(body.chunks_exact(8).map(|c| {
        let mut v = [0u8; 8];
        v.copy_from_slice(c);
        u64::from_le_bytes(v)
    }))
}

// ---------------------------------------------------------------------------
// MADT
// ---------------------------------------------------------------------------

/// MADT flag bit: dual-8259 present.
const PCAT_COMPAT: u32 = 1 << 0;

/// One Local APIC entry (MADT type 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalApicEntry {
    pub processor_id: u8,
    pub apic_id: u8,
    pub enabled: bool,
}

/// One I/O APIC entry (MADT type 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApicEntry {
    pub id: u8,
    pub address: u32,
    pub gsi_base: u32,
}

/// Interrupt pin polarity from the MADT flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Conforms to the bus (active high for ISA).
    Conforming,
    ActiveHigh,
    ActiveLow,
}

/// Trigger mode from the MADT flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Conforms to the bus (edge for ISA).
    Conforming,
    Edge,
    Level,
}

/// One interrupt source override (MADT type 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqOverride {
    /// ISA source IRQ.
    pub source: u8,
    /// Global System Interrupt it is redirected to.
    pub gsi: u32,
    pub polarity: Polarity,
    pub trigger: TriggerMode,
}

impl IrqOverride {
    /// Effective polarity (ISA conformance: active high).
    pub fn effective_polarity(&self) -> Polarity {
        match self.polarity {
            Polarity::Conforming => Polarity::ActiveHigh,
            p => p,
        }
    }

    /// Effective trigger (ISA conformance: edge).
    pub fn effective_trigger(&self) -> TriggerMode {
        match self.trigger {
            TriggerMode::Conforming => TriggerMode::Edge,
            t => t,
        }
    }
}

/// Everything the interrupt fabric needs from the MADT.
#[derive(Debug, Clone)]
pub struct MadtInfo {
    pub lapic_address: u64,
    pub pcat_compat: bool,
    pub lapics: Vec<LocalApicEntry>,
    pub ioapics: Vec<IoApicEntry>,
    pub overrides: Vec<IrqOverride>,
}

impl MadtInfo {
    /// Resolve an ISA IRQ to its GSI and conformance-resolved attributes.
    pub fn resolve_isa_irq(&self, irq: u8) -> (u32, Polarity, TriggerMode) {
        for ovr in &self.overrides {
            if ovr.source == irq {
                return (
                    ovr.gsi,
                    ovr.effective_polarity(),
                    ovr.effective_trigger(),
                );
            }
        }
        (irq as u32, Polarity::ActiveHigh, TriggerMode::Edge)
    }

    /// Number of processors the firmware reports usable.
    pub fn usable_processor_count(&self) -> usize {
        self.lapics.iter().filter(|l| l.enabled).count().max(1)
    }
}

fn decode_polarity(flags: u16) -> Polarity {
    match flags & 0b11 {
        0b01 => Polarity::ActiveHigh,
        0b11 => Polarity::ActiveLow,
        _ => Polarity::Conforming,
    }
}

fn decode_trigger(flags: u16) -> TriggerMode {
    match (flags >> 2) & 0b11 {
        0b01 => TriggerMode::Edge,
        0b11 => TriggerMode::Level,
        _ => TriggerMode::Conforming,
    }
}

/// Parse a MADT image.
pub fn parse_madt(bytes: &[u8]) -> KernelResult<MadtInfo> {
    let header = read_sdt_header(bytes)?;
    if header.signature != MADT_SIGNATURE {
        return Err(KernelError::NotFound { resource: "MADT" });
    }
    let len = (header.length as usize).min(bytes.len());
    if len < SDT_HEADER_SIZE + 8 {
        return Err(KernelError::InvalidParameter { name: "madt" });
    }

    let mut info = MadtInfo {
        lapic_address: u32::from_le_bytes(
            bytes[SDT_HEADER_SIZE..SDT_HEADER_SIZE + 4].try_into().unwrap(),
        ) as u64,
        pcat_compat: u32::from_le_bytes(
            bytes[SDT_HEADER_SIZE + 4..SDT_HEADER_SIZE + 8].try_into().unwrap(),
        ) & PCAT_COMPAT
            != 0,
        lapics: Vec::new(),
        ioapics: Vec::new(),
        overrides: Vec::new(),
    };

    let mut cursor = SDT_HEADER_SIZE + 8;
    while cursor + 2 <= len {
        let entry_type = bytes[cursor];
        let entry_len = bytes[cursor + 1] as usize;
        if entry_len < 2 || cursor + entry_len > len {
            break;
        }
        let entry = &bytes[cursor..cursor + entry_len];
        match entry_type {
            0 if entry_len >= 8 => {
                let flags = u32::from_le_bytes(entry[4..8].try_into().unwrap());
                info.lapics.push(LocalApicEntry {
                    processor_id: entry[2],
                    apic_id: entry[3],
                    enabled: flags & 1 != 0,
                });
            }
            1 if entry_len >= 12 => {
                info.ioapics.push(IoApicEntry {
                    id: entry[2],
                    address: u32::from_le_bytes(entry[4..8].try_into().unwrap()),
                    gsi_base: u32::from_le_bytes(entry[8..12].try_into().unwrap()),
                });
            }
            2 if entry_len >= 10 => {
                let flags = u16::from_le_bytes(entry[8..10].try_into().unwrap());
                info.overrides.push(IrqOverride {
                    source: entry[3],
                    gsi: u32::from_le_bytes(entry[4..8].try_into().unwrap()),
                    polarity: decode_polarity(flags),
                    trigger: decode_trigger(flags),
                });
            }
            5 if entry_len >= 12 => {
                info.lapic_address = u64::from_le_bytes(entry[4..12].try_into().unwrap());
            }
            _ => {}
        }
        cursor += entry_len;
    }

    Ok(info)
}

// ---------------------------------------------------------------------------
// Table discovery from the boot handoff
// ---------------------------------------------------------------------------

/// Map and borrow a physical table image.
///
/// # Safety
///
/// `phys` must point at a well-formed SDT the firmware placed in reserved
/// memory.
unsafe fn table_bytes(phys: u64) -> KernelResult<&'static [u8]> {
    use crate::mm::{layout::PAGE_SIZE, page_table::PteFlags, pager};

    let page = phys & !(PAGE_SIZE as u64 - 1);
    let offset = (phys - page) as usize;
    // Map two pages first so the header (which may straddle) is readable.
    // SAFETY: Firmware-reserved memory the caller vouches for.
    let window = unsafe { pager::map_general(page, 2, PteFlags::NO_EXECUTE)? };
    // SAFETY: Header mapped just above.
    let header = unsafe {
        core::slice::from_raw_parts((window + offset as u64) as *const u8, SDT_HEADER_SIZE)
    };
    let length = read_sdt_header(header)?.length as usize;

    let pages_needed = (offset + length + PAGE_SIZE - 1) / PAGE_SIZE;
    if pages_needed > 2 {
        // SAFETY: Same physical target, wider window.
        unsafe {
            pager::unmap_general(window, 2);
            let wide = pager::map_general(page, pages_needed as u64, PteFlags::NO_EXECUTE)?;
            return Ok(core::slice::from_raw_parts(
                (wide + offset as u64) as *const u8,
                length,
            ));
        }
    }
    // SAFETY: Entire table inside the mapped window.
    Ok(unsafe { core::slice::from_raw_parts((window + offset as u64) as *const u8, length) })
}

/// Locate and parse the MADT starting from the loader-provided RSDP.
///
/// # Safety
///
/// Pager must be live; the RSDP pointer must come from the loader-data
/// block.
pub unsafe fn load_madt(rsdp_phys: u64) -> KernelResult<MadtInfo> {
    use crate::mm::{layout::PAGE_SIZE, page_table::PteFlags, pager};

    let page = rsdp_phys & !(PAGE_SIZE as u64 - 1);
    let offset = (rsdp_phys - page) as usize;
    // SAFETY: Firmware memory per the caller's contract.
    let window = unsafe { pager::map_general(page, 2, PteFlags::NO_EXECUTE)? };
    // SAFETY: RSDP mapped just above.
    let rsdp_bytes = unsafe {
        core::slice::from_raw_parts(
            (window + offset as u64) as *const u8,
            core::mem::size_of::<Rsdp>(),
        )
    };
    let rsdp = validate_rsdp(rsdp_bytes)?;

    // SAFETY: XSDT address from a validated RSDP.
    let xsdt = unsafe { table_bytes(rsdp.xsdt_address)? };
    for entry in xsdt_entries(xsdt)? {
        // SAFETY: Table pointers from a checksummed XSDT.
        let table = unsafe { table_bytes(entry)? };
        if read_sdt_header(table)?.signature == MADT_SIGNATURE {
            let madt = parse_madt(table)?;
            log::info!(
                target: "acpi",
                "MADT: {} LAPIC(s), {} I/O APIC(s), {} override(s), 8259 {}",
                madt.lapics.len(),
                madt.ioapics.len(),
                madt.overrides.len(),
                if madt.pcat_compat { "present" } else { "absent" }
            );
            return Ok(madt);
        }
    }
    Err(KernelError::NotFound { resource: "MADT" })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finish_table(mut bytes: Vec<u8>, signature: [u8; 4]) -> Vec<u8> {
        bytes[0..4].copy_from_slice(&signature);
        let len = bytes.len() as u32;
        bytes[4..8].copy_from_slice(&len.to_le_bytes());
        bytes[9] = 0;
        let sum = bytes.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        bytes[9] = 0u8.wrapping_sub(sum);
        bytes
    }

    fn synthetic_madt() -> Vec<u8> {
        let mut t = alloc::vec![0u8; SDT_HEADER_SIZE];
        // Local APIC address + flags (PCAT_COMPAT set).
        t.extend_from_slice(&0xFEE0_0000u32.to_le_bytes());
        t.extend_from_slice(&1u32.to_le_bytes());
        // Type 0: processor LAPIC (enabled).
        t.extend_from_slice(&[0, 8, 0, 0]);
        t.extend_from_slice(&1u32.to_le_bytes());
        // Type 0: second processor (disabled).
        t.extend_from_slice(&[0, 8, 1, 1]);
        t.extend_from_slice(&0u32.to_le_bytes());
        // Type 1: I/O APIC at 0xFEC0_0000, GSI base 0.
        t.extend_from_slice(&[1, 12, 2, 0]);
        t.extend_from_slice(&0xFEC0_0000u32.to_le_bytes());
        t.extend_from_slice(&0u32.to_le_bytes());
        // Type 2: ISA IRQ 0 -> GSI 2, conforming.
        t.extend_from_slice(&[2, 10, 0, 0]);
        t.extend_from_slice(&2u32.to_le_bytes());
        t.extend_from_slice(&0u16.to_le_bytes());
        // Type 2: ISA IRQ 9 -> GSI 9, active low + level.
        t.extend_from_slice(&[2, 10, 0, 9]);
        t.extend_from_slice(&9u32.to_le_bytes());
        t.extend_from_slice(&0b1111u16.to_le_bytes());
        // Type 5: 64-bit LAPIC address override.
        t.extend_from_slice(&[5, 12, 0, 0]);
        t.extend_from_slice(&0x1_FEE0_0000u64.to_le_bytes());
        finish_table(t, MADT_SIGNATURE)
    }

    #[test]
    fn test_madt_entry_parsing() {
        let madt = parse_madt(&synthetic_madt()).unwrap();
        assert!(madt.pcat_compat);
        assert_eq!(madt.lapics.len(), 2);
        assert!(madt.lapics[0].enabled);
        assert!(!madt.lapics[1].enabled);
        assert_eq!(madt.usable_processor_count(), 1);
        assert_eq!(
            madt.ioapics[0],
            IoApicEntry {
                id: 2,
                address: 0xFEC0_0000,
                gsi_base: 0
            }
        );
        // Type 5 override wins over the 32-bit field.
        assert_eq!(madt.lapic_address, 0x1_FEE0_0000);
    }

    #[test]
    fn test_isa_override_resolution() {
        let madt = parse_madt(&synthetic_madt()).unwrap();
        // IRQ 0 redirected to GSI 2, conforming resolves to high/edge.
        assert_eq!(
            madt.resolve_isa_irq(0),
            (2, Polarity::ActiveHigh, TriggerMode::Edge)
        );
        // IRQ 9 keeps its explicit low/level attributes.
        assert_eq!(
            madt.resolve_isa_irq(9),
            (9, Polarity::ActiveLow, TriggerMode::Level)
        );
        // Identity for sources without an override.
        assert_eq!(
            madt.resolve_isa_irq(4),
            (4, Polarity::ActiveHigh, TriggerMode::Edge)
        );
    }

    #[test]
    fn test_signature_is_byte_exact() {
        let mut bad = synthetic_madt();
        bad[0] = b'a';
        assert!(parse_madt(&bad).is_err());
    }

    #[test]
    fn test_rsdp_validation() {
        let mut rsdp = alloc::vec![0u8; core::mem::size_of::<Rsdp>()];
        rsdp[0..8].copy_from_slice(&RSDP_SIGNATURE);
        rsdp[15] = 2; // revision
        let len = rsdp.len() as u32;
        rsdp[20..24].copy_from_slice(&len.to_le_bytes());
        rsdp[24..32].copy_from_slice(&0xE_0000u64.to_le_bytes()); // xsdt
        // Fix the v1 checksum (bytes 0..20) via byte 8.
        let sum20 = rsdp[..20].iter().fold(0u8, |a, b| a.wrapping_add(*b));
        rsdp[8] = 0u8.wrapping_sub(sum20);
        // Fix the extended checksum via byte 32.
        let sum = rsdp.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        rsdp[32] = 0u8.wrapping_sub(sum);

        let parsed = validate_rsdp(&rsdp).unwrap();
        assert_eq!({ parsed.xsdt_address }, 0xE_0000);

        // Revision 0 (ACPI 1.0) is rejected: XSDT only.
        let mut v1 = rsdp.clone();
        v1[15] = 0;
        let sum20 = {
            v1[8] = 0;
            v1[..20].iter().fold(0u8, |a, b| a.wrapping_add(*b))
        };
        v1[8] = 0u8.wrapping_sub(sum20);
        assert!(validate_rsdp(&v1).is_err());
    }

    #[test]
    fn test_xsdt_entry_iteration() {
        let mut t = alloc::vec![0u8; SDT_HEADER_SIZE];
        t.extend_from_slice(&0x1000u64.to_le_bytes());
        t.extend_from_slice(&0x2000u64.to_le_bytes());
        let xsdt = finish_table(t, XSDT_SIGNATURE);
        let entries: Vec<u64> = xsdt_entries(&xsdt).unwrap().collect();
        assert_eq!(entries, alloc::vec![0x1000, 0x2000]);
    }
}
