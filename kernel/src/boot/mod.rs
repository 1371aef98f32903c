//! Boot handoff consumed from the UEFI loader.
//!
//! The loader leaves a single "loader-data" page at a fixed virtual address
//! ([`crate::mm::layout::LOADER_DATA`]). It begins with eight 64-bit offsets
//! into the loader-data region, locating in order: the DMA bitmap, the UEFI
//! memory map, the map's byte size, the map's descriptor stride, the ACPI
//! RSDP pointer, the first ECAM base from the MCFG, the EFI runtime-services
//! table pointer, and the basic graphics block.

use crate::{mm::layout, sync::OnceLock};

pub mod efi;

/// Number of pages tracked by the DMA bitmap (16 MiB / 4 KiB).
pub const DMA_BITMAP_PAGES: usize = 4096;

/// Byte size of the loader's DMA bitmap.
pub const DMA_BITMAP_BYTES: usize = DMA_BITMAP_PAGES / 8;

/// Header at the very start of the loader-data region. All fields are byte
/// offsets from the region base.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LoaderDataHeader {
    pub dma_bitmap_offset: u64,
    pub mmap_offset: u64,
    pub mmap_size_offset: u64,
    pub mmap_desc_size_offset: u64,
    pub acpi_rsdp_offset: u64,
    pub pcie_ecam0_offset: u64,
    pub rt_services_offset: u64,
    pub gfx_data_offset: u64,
}

/// UEFI memory descriptor, per the UEFI specification. The loader reports
/// the actual stride separately; firmware routinely uses a larger one.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EfiMemoryDescriptor {
    pub typ: u32,
    pub _pad: u32,
    pub physical_start: u64,
    pub virtual_start: u64,
    pub number_of_pages: u64,
    pub attribute: u64,
}

/// UEFI memory descriptor types the frame allocator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EfiMemoryType {
    LoaderCode = 1,
    LoaderData = 2,
    BootServicesCode = 3,
    BootServicesData = 4,
    ConventionalMemory = 7,
}

impl EfiMemoryDescriptor {
    /// Whether this descriptor's frames become kernel-owned conventional
    /// memory once boot services have exited.
    pub fn is_reclaimable(&self) -> bool {
        matches!(
            self.typ,
            t if t == EfiMemoryType::LoaderCode as u32
                || t == EfiMemoryType::LoaderData as u32
                || t == EfiMemoryType::BootServicesCode as u32
                || t == EfiMemoryType::BootServicesData as u32
                || t == EfiMemoryType::ConventionalMemory as u32
        )
    }
}

/// Basic graphics block handed over by the loader (GOP mode data).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BasicGraphics {
    pub framebuffer_base: u64,
    pub framebuffer_size: u64,
    pub horizontal_resolution: u32,
    pub vertical_resolution: u32,
    pub pixels_per_scanline: u32,
    pub pixel_format: u32,
}

/// Typed view over the loader-data region.
#[derive(Debug, Clone, Copy)]
pub struct LoaderInfo {
    base: u64,
    header: LoaderDataHeader,
}

impl LoaderInfo {
    /// Read the handoff block at the fixed loader-data address.
    ///
    /// # Safety
    ///
    /// The loader must have populated the region before the kernel entry
    /// ran; callers invoke this exactly once during Stage-1 boot.
    pub unsafe fn from_fixed_address() -> Self {
        // SAFETY: Forwarded precondition; the loader-data zone is mapped by
        // the loader before the kernel starts.
        unsafe { Self::from_base(layout::LOADER_DATA.start) }
    }

    /// Read the handoff block at an arbitrary base (test seam).
    ///
    /// # Safety
    ///
    /// `base` must point at a populated loader-data image at least one page
    /// long, valid for the lifetime of the returned value.
    pub unsafe fn from_base(base: u64) -> Self {
        // SAFETY: Caller guarantees a populated header at `base`; the
        // image itself carries no alignment promise.
        let header = unsafe { core::ptr::read_unaligned(base as *const LoaderDataHeader) };
        Self { base, header }
    }

    fn at(&self, offset: u64) -> u64 {
        self.base + offset
    }

    /// Loader-built DMA bitmap (one bit per page of the first 16 MiB).
    pub fn dma_bitmap(&self) -> &'static [u8] {
        // SAFETY: The loader reserves DMA_BITMAP_BYTES at this offset; the
        // loader-data region is never unmapped.
        unsafe {
            core::slice::from_raw_parts(
                self.at(self.header.dma_bitmap_offset) as *const u8,
                DMA_BITMAP_BYTES,
            )
        }
    }

    fn read_u64(&self, offset: u64) -> u64 {
        // SAFETY: All header offsets point inside the loader-data region.
        unsafe { core::ptr::read_unaligned(self.at(offset) as *const u64) }
    }

    /// Iterate the UEFI memory map with the loader-advertised stride.
    pub fn memory_map(&self) -> MemoryMapIter {
        MemoryMapIter {
            cursor: self.at(self.header.mmap_offset),
            remaining: self.read_u64(self.header.mmap_size_offset),
            stride: self.read_u64(self.header.mmap_desc_size_offset),
        }
    }

    /// Physical address of the ACPI RSDP.
    pub fn acpi_rsdp(&self) -> u64 {
        self.read_u64(self.header.acpi_rsdp_offset)
    }

    /// Physical base of the first ECAM region from the MCFG.
    pub fn pcie_ecam0(&self) -> u64 {
        self.read_u64(self.header.pcie_ecam0_offset)
    }

    /// Virtual pointer to the EFI runtime-services table.
    pub fn runtime_services(&self) -> *const efi::RuntimeServices {
        self.read_u64(self.header.rt_services_offset) as *const efi::RuntimeServices
    }

    /// Loader graphics block.
    pub fn graphics(&self) -> BasicGraphics {
        // SAFETY: The loader writes a BasicGraphics at this offset.
        unsafe {
            core::ptr::read_unaligned(self.at(self.header.gfx_data_offset) as *const BasicGraphics)
        }
    }
}

/// Iterator over UEFI memory descriptors.
///
/// Adjacent descriptors of the same type are not merged here; the previous
/// cursor is checked against null before any merge peeks, and the frame
/// allocator handles coalescing on its own.
pub struct MemoryMapIter {
    cursor: u64,
    remaining: u64,
    stride: u64,
}

impl Iterator for MemoryMapIter {
    type Item = EfiMemoryDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining < self.stride || self.stride == 0 {
            return None;
        }
        // SAFETY: cursor stays within mmap_offset..mmap_offset+mmap_size,
        // which the loader populated with descriptors of `stride` bytes.
        let desc = unsafe { core::ptr::read_unaligned(self.cursor as *const EfiMemoryDescriptor) };
        self.cursor += self.stride;
        self.remaining -= self.stride;
        Some(desc)
    }
}

/// Boot artifacts, published once during Stage-1 and read-only afterwards.
static LOADER_INFO: OnceLock<LoaderInfo> = OnceLock::new();

/// Publish the handoff block. Called exactly once from the kernel entry.
pub fn publish(info: LoaderInfo) {
    if LOADER_INFO.set(info).is_err() {
        log::warn!(target: "boot", "loader info published twice; keeping first");
    }
}

/// The published handoff block.
pub fn loader_info() -> Option<&'static LoaderInfo> {
    LOADER_INFO.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a synthetic loader-data image with two descriptors.
    fn synthetic_image() -> alloc::vec::Vec<u8> {
        let mut img = alloc::vec![0u8; 4096];
        let header = LoaderDataHeader {
            dma_bitmap_offset: 0x100,
            mmap_offset: 0x400,
            mmap_size_offset: 0x3F0,
            mmap_desc_size_offset: 0x3F8,
            acpi_rsdp_offset: 0x3E0,
            pcie_ecam0_offset: 0x3E8,
            rt_services_offset: 0x3D0,
            gfx_data_offset: 0x800,
        };
        // SAFETY: img is at least header-sized and writable.
        unsafe {
            core::ptr::write_unaligned(img.as_mut_ptr() as *mut LoaderDataHeader, header);
        }
        let stride = 48u64;
        img[0x3F0..0x3F8].copy_from_slice(&(2 * stride).to_le_bytes());
        img[0x3F8..0x400].copy_from_slice(&stride.to_le_bytes());
        img[0x3E0..0x3E8].copy_from_slice(&0xE_0000u64.to_le_bytes());
        img[0x3E8..0x3F0].copy_from_slice(&0xB000_0000u64.to_le_bytes());

        let descs = [
            EfiMemoryDescriptor {
                typ: EfiMemoryType::ConventionalMemory as u32,
                _pad: 0,
                physical_start: 0x1_0000_0000,
                virtual_start: 0,
                number_of_pages: 0x4_0000,
                attribute: 0,
            },
            EfiMemoryDescriptor {
                typ: 11, // MMIO: not reclaimable
                _pad: 0,
                physical_start: 0xFEC0_0000,
                virtual_start: 0,
                number_of_pages: 16,
                attribute: 0,
            },
        ];
        for (i, d) in descs.iter().enumerate() {
            // SAFETY: offsets stay inside the 4096-byte image.
            unsafe {
                core::ptr::write_unaligned(
                    img.as_mut_ptr().add(0x400 + i * stride as usize) as *mut EfiMemoryDescriptor,
                    *d,
                );
            }
        }
        img
    }

    #[test]
    fn test_memory_map_iteration_honors_stride() {
        let img = synthetic_image();
        // SAFETY: img holds a populated loader-data image.
        let info = unsafe { LoaderInfo::from_base(img.as_ptr() as u64) };
        let descs: alloc::vec::Vec<_> = info.memory_map().collect();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].physical_start, 0x1_0000_0000);
        assert!(descs[0].is_reclaimable());
        assert!(!descs[1].is_reclaimable());
    }

    #[test]
    fn test_pointers_read_back() {
        let img = synthetic_image();
        // SAFETY: img holds a populated loader-data image.
        let info = unsafe { LoaderInfo::from_base(img.as_ptr() as u64) };
        assert_eq!(info.acpi_rsdp(), 0xE_0000);
        assert_eq!(info.pcie_ecam0(), 0xB000_0000);
    }
}
