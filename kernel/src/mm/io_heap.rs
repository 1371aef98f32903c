//! IOHeap: first-fit allocator for buffers shared with device DMA.
//!
//! The heap manages a 16 MiB physically contiguous region mapped uncached
//! into the general window, so every payload has a virtual address the CPU
//! can use and a physical address a controller can DMA to, related by a
//! constant offset. The free list is singly linked and address-ordered;
//! every allocation may request an alignment up to one page. Small leading
//! padding before a payload is recorded in a 32-bit header field so `free`
//! can recover the node address. Coalescing is with the immediate successor
//! only.

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Managed region size.
pub const IO_HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Largest honored alignment.
pub const MAX_ALIGN: usize = 4096;

/// Free-list node stored at the start of each free range.
#[repr(C)]
struct IoFreeNode {
    /// Range size in bytes, node included.
    size: usize,
    next: *mut IoFreeNode,
}

/// Header immediately preceding every payload.
#[repr(C)]
struct IoHeader {
    /// Whole chunk size in bytes (from node base to chunk end).
    size: u32,
    /// Leading padding: bytes from the node base to this header.
    padding: u32,
}

const NODE_SIZE: usize = core::mem::size_of::<IoFreeNode>();
const HEADER_SIZE: usize = core::mem::size_of::<IoHeader>();

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// IOHeap state.
pub struct IoHeap {
    head: *mut IoFreeNode,
    virt_base: usize,
    phys_base: u64,
    size: usize,
}

// SAFETY: All node pointers stay inside the region the heap owns; access is
// serialized by the IO_HEAP spinlock.
unsafe impl Send for IoHeap {}

impl IoHeap {
    const fn empty() -> Self {
        Self {
            head: core::ptr::null_mut(),
            virt_base: 0,
            phys_base: 0,
            size: 0,
        }
    }

    /// Attach the heap to its mapped region.
    ///
    /// # Safety
    ///
    /// `[virt, virt+size)` must be mapped read-write over the physically
    /// contiguous range starting at `phys`, owned exclusively by this heap.
    pub unsafe fn attach(&mut self, virt: usize, phys: u64, size: usize) {
        self.virt_base = virt;
        self.phys_base = phys;
        self.size = size;
        let node = virt as *mut IoFreeNode;
        // SAFETY: The region is ours and at least node-sized.
        unsafe {
            (*node).size = size;
            (*node).next = core::ptr::null_mut();
        }
        self.head = node;
    }

    /// Physical address backing a payload inside the region.
    pub fn physical_of(&self, virt: usize) -> KernelResult<u64> {
        if virt < self.virt_base || virt >= self.virt_base + self.size {
            return Err(KernelError::OutOfBounds {
                index: virt,
                limit: self.virt_base + self.size,
            });
        }
        Ok(self.phys_base + (virt - self.virt_base) as u64)
    }

    /// Allocate `size` bytes with the given alignment (≤ one page).
    /// First fit over the address-ordered free list.
    pub fn allocate(&mut self, size: usize, align: usize) -> KernelResult<*mut u8> {
        if size == 0 || align == 0 || !align.is_power_of_two() || align > MAX_ALIGN {
            return Err(KernelError::InvalidParameter { name: "align" });
        }
        let size = align_up(size, 8);

        let mut prev: *mut IoFreeNode = core::ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            // SAFETY: List nodes are live free ranges owned by the heap.
            unsafe {
                let node_base = cur as usize;
                let node_size = (*cur).size;
                let payload = align_up(node_base + HEADER_SIZE, align);
                let padding = payload - HEADER_SIZE - node_base;
                let used_end = payload + size;

                if padding <= u32::MAX as usize && used_end <= node_base + node_size {
                    let next = (*cur).next;

                    // Trailing remainder becomes a new node when it can
                    // hold one; otherwise it rides along with the chunk.
                    let remainder = node_base + node_size - used_end;
                    let (chunk_size, replacement) = if remainder >= NODE_SIZE {
                        let tail = used_end as *mut IoFreeNode;
                        (*tail).size = remainder;
                        (*tail).next = next;
                        (node_size - remainder, tail)
                    } else {
                        (node_size, next)
                    };

                    if prev.is_null() {
                        self.head = replacement;
                    } else {
                        (*prev).next = replacement;
                    }

                    let header = (payload - HEADER_SIZE) as *mut IoHeader;
                    (*header).size = chunk_size as u32;
                    (*header).padding = padding as u32;
                    return Ok(payload as *mut u8);
                }
                prev = cur;
                cur = (*cur).next;
            }
        }
        Err(KernelError::OutOfMemory { requested: size })
    }

    /// Free a payload returned by [`Self::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from this heap and not be freed twice.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: The header sits immediately below the payload; padding
        // recovers the original node base.
        unsafe {
            let header = (ptr as usize - HEADER_SIZE) as *const IoHeader;
            let node_base = ptr as usize - HEADER_SIZE - (*header).padding as usize;
            let mut size = (*header).size as usize;

            // Find the insertion point (address-ordered).
            let mut prev: *mut IoFreeNode = core::ptr::null_mut();
            let mut cur = self.head;
            while !cur.is_null() && (cur as usize) < node_base {
                prev = cur;
                cur = (*cur).next;
            }

            // Coalesce with the immediate successor when adjacent.
            let next = if !cur.is_null() && cur as usize == node_base + size {
                size += (*cur).size;
                (*cur).next
            } else {
                cur
            };

            let node = node_base as *mut IoFreeNode;
            (*node).size = size;
            (*node).next = next;
            if prev.is_null() {
                self.head = node;
            } else {
                (*prev).next = node;
            }
        }
    }

    /// Sum of free bytes (diagnostics and tests).
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            // SAFETY: Live list nodes.
            unsafe {
                total += (*cur).size;
                cur = (*cur).next;
            }
        }
        total
    }
}

/// Global IOHeap.
pub static IO_HEAP: Mutex<IoHeap> = Mutex::new(IoHeap::empty());

/// Bring up the global IOHeap: allocate a physically contiguous 16 MiB run
/// and map it uncached into the general window.
///
/// # Safety
///
/// Requires the frame allocator and Pager to be live. Runs once.
pub unsafe fn init() -> KernelResult<()> {
    use crate::mm::{
        frame_allocator::FRAME_ALLOCATOR,
        layout::PAGE_SIZE,
        page_table::PteFlags,
    };

    let pages = (IO_HEAP_SIZE / PAGE_SIZE) as u64;
    let phys = FRAME_ALLOCATOR
        .lock()
        .allocate_run(pages)
        .ok_or(KernelError::OutOfMemory {
            requested: IO_HEAP_SIZE,
        })?;
    // SAFETY: The run was just allocated; uncached mapping for DMA sharing.
    let virt = unsafe {
        super::pager::map_general(
            phys,
            pages,
            PteFlags::WRITABLE | PteFlags::NO_CACHE | PteFlags::NO_EXECUTE,
        )?
    };

    let mut heap = IO_HEAP.lock();
    if heap.size != 0 {
        return Err(KernelError::AlreadyExists { resource: "IO heap" });
    }
    // SAFETY: Freshly mapped exclusive region.
    unsafe {
        heap.attach(virt as usize, phys, IO_HEAP_SIZE);
    }
    log::info!(target: "mm", "IO heap: 16 MiB at {:#x} (phys {:#x})", virt, phys);
    Ok(())
}

/// Allocate zeroed DMA-visible pages; returns `(virt, phys)`.
pub fn alloc_dma_pages(pages: usize) -> KernelResult<(*mut u8, u64)> {
    let bytes = pages * crate::mm::layout::PAGE_SIZE;
    let mut heap = IO_HEAP.lock();
    let virt = heap.allocate(bytes, MAX_ALIGN)?;
    let phys = heap.physical_of(virt as usize)?;
    drop(heap);
    // SAFETY: Freshly allocated exclusive range of `bytes` bytes.
    unsafe {
        core::ptr::write_bytes(virt, 0, bytes);
    }
    Ok((virt, phys))
}

/// Free a buffer returned by [`alloc_dma_pages`] or the IOHeap.
pub fn free_dma(virt: *mut u8) {
    // SAFETY: Contract forwarded to IoHeap::free.
    unsafe {
        IO_HEAP.lock().free(virt);
    }
}

/// Owned, zeroed, page-aligned DMA allocation released on drop.
pub struct DmaBuffer {
    virt: *mut u8,
    phys: u64,
    bytes: usize,
}

// SAFETY: The buffer is an exclusive IO-heap allocation.
unsafe impl Send for DmaBuffer {}
// SAFETY: Shared access hands out raw pointers only; the users serialize.
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocate `pages` zeroed DMA-visible pages.
    pub fn pages(pages: usize) -> KernelResult<Self> {
        let (virt, phys) = alloc_dma_pages(pages)?;
        Ok(Self {
            virt,
            phys,
            bytes: pages * crate::mm::layout::PAGE_SIZE,
        })
    }

    pub fn virt(&self) -> *mut u8 {
        self.virt
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        free_dma(self.virt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap(bytes: usize) -> (alloc::vec::Vec<u64>, IoHeap) {
        let mut buf = alloc::vec![0u64; bytes / 8];
        let mut heap = IoHeap::empty();
        // SAFETY: Buffer outlives the heap within the test.
        unsafe {
            heap.attach(buf.as_mut_ptr() as usize, 0x10_0000, bytes);
        }
        (buf, heap)
    }

    #[test]
    fn test_first_fit_and_physical_translation() {
        let (_buf, mut heap) = test_heap(64 * 1024);
        let a = heap.allocate(256, 8).unwrap();
        let b = heap.allocate(256, 8).unwrap();
        assert!(b > a);
        let pa = heap.physical_of(a as usize).unwrap();
        let pb = heap.physical_of(b as usize).unwrap();
        assert_eq!(pb - pa, (b as usize - a as usize) as u64);
        assert!(pa >= 0x10_0000);
    }

    #[test]
    fn test_alignment_and_padding_recovery() {
        let (_buf, mut heap) = test_heap(64 * 1024);
        let total = heap.free_bytes();
        // Force leading padding by asking for page alignment.
        let p = heap.allocate(512, 4096).unwrap();
        assert_eq!(p as usize % 4096, 0);
        // SAFETY: Just allocated.
        unsafe { heap.free(p) };
        // The padded leading bytes came back with the chunk.
        let q = heap.allocate(512, 8).unwrap();
        // SAFETY: Just allocated.
        unsafe { heap.free(q) };
        assert_eq!(heap.free_bytes(), total);
    }

    #[test]
    fn test_successor_coalescing() {
        let (_buf, mut heap) = test_heap(32 * 1024);
        let a = heap.allocate(1024, 8).unwrap();
        let b = heap.allocate(1024, 8).unwrap();
        let c = heap.allocate(1024, 8).unwrap();
        // Free front-to-back: each free coalesces with the node after it.
        // SAFETY: Allocated above.
        unsafe {
            heap.free(c);
            heap.free(b);
            heap.free(a);
        }
        // Everything merged into one node again: a full-size alloc works.
        let total = heap.free_bytes();
        let whole = heap.allocate(total - HEADER_SIZE - 8, 8);
        assert!(whole.is_ok());
    }

    #[test]
    fn test_rejected_parameters() {
        let (_buf, mut heap) = test_heap(4096);
        assert!(heap.allocate(0, 8).is_err());
        assert!(heap.allocate(64, 3).is_err());
        assert!(heap.allocate(64, 2 * MAX_ALIGN).is_err());
        assert!(heap.physical_of(0x1).is_err());
    }

    #[test]
    fn test_exhaustion() {
        let (_buf, mut heap) = test_heap(4096);
        assert!(matches!(
            heap.allocate(8192, 8),
            Err(KernelError::OutOfMemory { .. })
        ));
    }
}
