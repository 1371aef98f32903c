//! Physical frame allocator.
//!
//! Conventional memory above the legacy DMA zone is tracked as an
//! address-ordered array of `(start, pages)` free blocks living in a
//! dedicated virtual window that grows one page at a time. The first 16 MiB
//! are tracked separately by a 4096-bit bitmap seeded from the loader, with
//! page 0 pinned allocated so a null pointer can never alias a usable frame.
//!
//! The allocator itself is not interrupt-safe; every caller goes through the
//! [`FRAME_ALLOCATOR`] spinlock.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    mm::layout::{DMA_ZONE, PAGE_SIZE, PHYSICAL_MEMORY_MAP},
};

/// DMA-zone page count (16 MiB / 4 KiB).
const DMA_PAGES: usize = 4096;

/// Words in the DMA bitmap.
const DMA_BITMAP_WORDS: usize = DMA_PAGES / 64;

/// Free blocks added to the metadata window per mapped page.
const BLOCKS_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<FreeBlock>();

/// Mask of valid physical address bits. Refined from CPUID at bring-up;
/// defaults to the common 48-bit MAXPHYADDR.
static PHYSICAL_ADDRESS_MASK: AtomicU64 = AtomicU64::new((1 << 48) - 1);

/// Set the MAXPHYADDR-derived mask (called once during bring-up).
pub fn set_max_physical_address_bits(bits: u8) {
    let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
    PHYSICAL_ADDRESS_MASK.store(mask, Ordering::Relaxed);
}

/// Filter a raw physical address down to a frame base:
/// `addr & (2^MAXPHYADDR - 1) & !0xFFF`.
pub fn filter_address(addr: u64) -> u64 {
    addr & PHYSICAL_ADDRESS_MASK.load(Ordering::Relaxed) & !0xFFF
}

/// One contiguous run of free frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FreeBlock {
    /// Physical address of the first frame.
    pub start: u64,
    /// Number of 4 KiB frames in the run.
    pub pages: u64,
}

impl FreeBlock {
    const fn end(&self) -> u64 {
        self.start + self.pages * PAGE_SIZE as u64
    }
}

/// Answer of [`FrameAllocator::query_dma`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaStatus {
    Free,
    Allocated,
    OutOfRange,
}

/// How the block array gets more room when it fills up.
enum MetadataBacking {
    /// Fixed storage handed in by the caller (host tests).
    Fixed,
    /// The reserved metadata window; growing maps one more frame into it,
    /// taking that frame from the allocator itself.
    Window,
}

/// Physical frame allocator state.
pub struct FrameAllocator {
    /// Address-ordered block array (ascending start).
    blocks: *mut FreeBlock,
    /// Blocks that fit in the currently mapped storage.
    capacity: usize,
    /// Live blocks.
    count: usize,
    backing: MetadataBacking,
    /// Bytes of conventional memory currently free (excludes the DMA zone).
    available: u64,
    /// DMA-zone occupancy, one bit per page; set = allocated.
    dma_bitmap: [u64; DMA_BITMAP_WORDS],
}

// SAFETY: The raw block pointer refers to storage owned exclusively by the
// allocator (the metadata window or a test buffer); all access is serialized
// by the FRAME_ALLOCATOR spinlock.
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    /// Empty allocator; storage attaches during [`init`] or via
    /// [`Self::with_storage`].
    pub const fn empty() -> Self {
        Self {
            blocks: core::ptr::null_mut(),
            capacity: 0,
            count: 0,
            backing: MetadataBacking::Fixed,
            available: 0,
            dma_bitmap: [u64::MAX; DMA_BITMAP_WORDS],
        }
    }

    /// Allocator over caller-provided block storage (test seam; no window
    /// growth).
    pub fn with_storage(storage: &mut [FreeBlock]) -> Self {
        let mut fa = Self::empty();
        fa.blocks = storage.as_mut_ptr();
        fa.capacity = storage.len();
        fa
    }

    /// Seed the DMA bitmap from the loader image and pin page 0.
    pub fn load_dma_bitmap(&mut self, image: &[u8]) {
        for (i, chunk) in image.chunks_exact(8).take(DMA_BITMAP_WORDS).enumerate() {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            self.dma_bitmap[i] = u64::from_le_bytes(word);
        }
        // Page 0 stays allocated forever.
        self.dma_bitmap[0] |= 1;
    }

    fn block_at(&self, index: usize) -> FreeBlock {
        debug_assert!(index < self.count);
        // SAFETY: index < count <= capacity and the storage is owned.
        unsafe { *self.blocks.add(index) }
    }

    fn set_block(&mut self, index: usize, block: FreeBlock) {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity; storage is owned.
        unsafe { *self.blocks.add(index) = block }
    }

    /// Make room for one more block, growing the metadata window if this
    /// allocator owns it.
    fn ensure_capacity(&mut self) -> KernelResult<()> {
        if self.count < self.capacity {
            return Ok(());
        }
        if matches!(self.backing, MetadataBacking::Fixed) {
            return Err(KernelError::OutOfMemory {
                requested: core::mem::size_of::<FreeBlock>(),
            });
        }
        let next_page =
            PHYSICAL_MEMORY_MAP.start + (self.capacity * core::mem::size_of::<FreeBlock>()) as u64;
        if next_page >= PHYSICAL_MEMORY_MAP.end() {
            return Err(KernelError::OutOfMemory {
                requested: PAGE_SIZE,
            });
        }
        // SAFETY: next_page lies inside the reserved metadata window and
        // every frame fed to the mapping comes from the free pool this
        // allocator owns.
        unsafe {
            super::pager::map_window_page(next_page, &mut || self.take_any_frame().ok())?;
        }
        self.capacity += BLOCKS_PER_PAGE;
        Ok(())
    }

    /// Take the topmost frame of the last block without capacity checks
    /// (used to feed page-table allocation while growing the window).
    fn take_any_frame(&mut self) -> KernelResult<u64> {
        if self.count == 0 {
            return Err(KernelError::OutOfMemory {
                requested: PAGE_SIZE,
            });
        }
        let mut last = self.block_at(self.count - 1);
        last.pages -= 1;
        let frame = last.start + last.pages * PAGE_SIZE as u64;
        if last.pages == 0 {
            self.count -= 1;
        } else {
            let idx = self.count - 1;
            self.set_block(idx, last);
        }
        self.available -= PAGE_SIZE as u64;
        Ok(frame)
    }

    /// Insert a free run, merging with adjacent neighbors. Blocks stay
    /// address-ordered and disjoint.
    fn insert_block(&mut self, start: u64, pages: u64) -> KernelResult<()> {
        if pages == 0 {
            return Err(KernelError::InvalidParameter { name: "pages" });
        }
        let end = start + pages * PAGE_SIZE as u64;

        // Binary search for insertion point.
        let mut lo = 0usize;
        let mut hi = self.count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.block_at(mid).start < start {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let pos = lo;

        // Reject overlap with either neighbor.
        if pos > 0 && self.block_at(pos - 1).end() > start {
            return Err(KernelError::InvalidParameter { name: "start" });
        }
        if pos < self.count && self.block_at(pos).start < end {
            return Err(KernelError::InvalidParameter { name: "start" });
        }

        let merge_prev = pos > 0 && self.block_at(pos - 1).end() == start;
        let merge_next = pos < self.count && self.block_at(pos).start == end;

        match (merge_prev, merge_next) {
            (true, true) => {
                let mut prev = self.block_at(pos - 1);
                let next = self.block_at(pos);
                prev.pages += pages + next.pages;
                self.set_block(pos - 1, prev);
                self.remove_block(pos);
            }
            (true, false) => {
                let mut prev = self.block_at(pos - 1);
                prev.pages += pages;
                self.set_block(pos - 1, prev);
            }
            (false, true) => {
                let mut next = self.block_at(pos);
                next.start = start;
                next.pages += pages;
                self.set_block(pos, next);
            }
            (false, false) => {
                self.ensure_capacity()?;
                // Shift the tail up by one slot.
                let mut i = self.count;
                while i > pos {
                    let b = self.block_at(i - 1);
                    self.set_block(i, b);
                    i -= 1;
                }
                self.set_block(pos, FreeBlock { start, pages });
                self.count += 1;
            }
        }

        self.available += pages * PAGE_SIZE as u64;
        Ok(())
    }

    fn remove_block(&mut self, index: usize) {
        for i in index..self.count - 1 {
            let b = self.block_at(i + 1);
            self.set_block(i, b);
        }
        self.count -= 1;
    }

    /// Register a run of conventional frames during bring-up, splitting it
    /// against the DMA-zone boundary (the bitmap governs the low part).
    pub fn insert_region(&mut self, start: u64, pages: u64) -> KernelResult<()> {
        let start = filter_address(start);
        let end = start + pages * PAGE_SIZE as u64;
        if end <= DMA_ZONE.end() {
            return Ok(());
        }
        let clipped_start = start.max(DMA_ZONE.end());
        let clipped_pages = (end - clipped_start) / PAGE_SIZE as u64;
        self.insert_block(clipped_start, clipped_pages)
    }

    /// Pop one frame (the last block's topmost frame).
    pub fn allocate(&mut self) -> Option<u64> {
        self.take_any_frame().ok()
    }

    /// Allocate `n` physically contiguous frames.
    pub fn allocate_run(&mut self, n: u64) -> Option<u64> {
        self.allocate_aligned_run(n, PAGE_SIZE as u64)
    }

    /// Allocate one naturally aligned 2 MiB block.
    pub fn allocate_2mb(&mut self) -> Option<u64> {
        self.allocate_aligned_run(512, 0x20_0000)
    }

    /// Allocate one naturally aligned 1 GiB block.
    pub fn allocate_1gb(&mut self) -> Option<u64> {
        self.allocate_aligned_run(512 * 512, 0x4000_0000)
    }

    /// Allocate `n` contiguous frames whose base is `align`-aligned.
    pub fn allocate_aligned_run(&mut self, n: u64, align: u64) -> Option<u64> {
        if n == 0 {
            return None;
        }
        let bytes = n * PAGE_SIZE as u64;
        for i in (0..self.count).rev() {
            let block = self.block_at(i);
            let aligned = (block.start + align - 1) & !(align - 1);
            if aligned + bytes > block.end() {
                continue;
            }
            // Take [aligned, aligned + bytes), keeping the flanks free.
            let lead_pages = (aligned - block.start) / PAGE_SIZE as u64;
            let tail_pages = (block.end() - (aligned + bytes)) / PAGE_SIZE as u64;

            match (lead_pages, tail_pages) {
                (0, 0) => self.remove_block(i),
                (0, t) => self.set_block(
                    i,
                    FreeBlock {
                        start: aligned + bytes,
                        pages: t,
                    },
                ),
                (l, 0) => self.set_block(
                    i,
                    FreeBlock {
                        start: block.start,
                        pages: l,
                    },
                ),
                (l, t) => {
                    self.set_block(
                        i,
                        FreeBlock {
                            start: block.start,
                            pages: l,
                        },
                    );
                    self.available -= bytes;
                    // Reinsert the tail; bookkeeping for the taken middle is
                    // already done, so bail out on metadata exhaustion only.
                    if self.insert_block(aligned + bytes, t).is_err() {
                        self.available += t * PAGE_SIZE as u64;
                    }
                    return Some(aligned);
                }
            }
            self.available -= bytes;
            return Some(aligned);
        }
        None
    }

    /// Return one frame to the pool.
    pub fn free(&mut self, frame: u64) -> KernelResult<()> {
        self.free_run(frame, 1)
    }

    /// Return `n` contiguous frames to the pool.
    pub fn free_run(&mut self, frame: u64, n: u64) -> KernelResult<()> {
        let frame = filter_address(frame);
        if DMA_ZONE.contains(frame) {
            return Err(KernelError::InvalidParameter { name: "frame" });
        }
        self.insert_block(frame, n)
    }

    /// Allocate `n` contiguous pages from the legacy DMA zone.
    pub fn allocate_dma(&mut self, n: usize) -> Option<u64> {
        if n == 0 || n > DMA_PAGES {
            return None;
        }
        let mut run = 0usize;
        let mut start = 0usize;
        for page in 0..DMA_PAGES {
            if self.dma_bitmap[page / 64] & (1 << (page % 64)) == 0 {
                if run == 0 {
                    start = page;
                }
                run += 1;
                if run == n {
                    for p in start..start + n {
                        self.dma_bitmap[p / 64] |= 1 << (p % 64);
                    }
                    return Some((start * PAGE_SIZE) as u64);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Release `n` DMA-zone pages.
    pub fn free_dma(&mut self, addr: u64, n: usize) -> KernelResult<()> {
        let first = (addr / PAGE_SIZE as u64) as usize;
        if addr % PAGE_SIZE as u64 != 0 || first + n > DMA_PAGES || first == 0 {
            return Err(KernelError::InvalidParameter { name: "addr" });
        }
        for p in first..first + n {
            self.dma_bitmap[p / 64] &= !(1 << (p % 64));
        }
        Ok(())
    }

    /// DMA-zone occupancy of `addr`.
    pub fn query_dma(&self, addr: u64) -> DmaStatus {
        if !DMA_ZONE.contains(addr) {
            return DmaStatus::OutOfRange;
        }
        let page = (addr / PAGE_SIZE as u64) as usize;
        if self.dma_bitmap[page / 64] & (1 << (page % 64)) != 0 {
            DmaStatus::Allocated
        } else {
            DmaStatus::Free
        }
    }

    /// Bytes of conventional memory currently free.
    pub fn available_memory(&self) -> u64 {
        self.available
    }

    /// Number of live free blocks (diagnostics and tests).
    pub fn block_count(&self) -> usize {
        self.count
    }

    /// Snapshot block `i` (diagnostics and tests).
    pub fn block(&self, i: usize) -> Option<FreeBlock> {
        (i < self.count).then(|| self.block_at(i))
    }
}

/// Global frame allocator.
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::empty());

/// Bring up the global allocator from the boot memory map.
///
/// # Safety
///
/// Must run exactly once, after the Pager is live, with the loader-data
/// block published. Consumes descriptors the firmware has already released.
pub unsafe fn init(loader: &crate::boot::LoaderInfo) -> KernelResult<()> {
    let mut fa = FRAME_ALLOCATOR.lock();
    if fa.capacity != 0 {
        return Err(KernelError::AlreadyExists {
            resource: "frame allocator",
        });
    }
    fa.backing = MetadataBacking::Window;
    fa.blocks = PHYSICAL_MEMORY_MAP.start as *mut FreeBlock;
    fa.load_dma_bitmap(loader.dma_bitmap());

    // Bootstrap the first metadata page: steal a frame from the first
    // usable descriptor above the DMA zone.
    let mut bootstrap: Option<(u64, u64)> = None;
    for desc in loader.memory_map() {
        if !desc.is_reclaimable() {
            continue;
        }
        let start = filter_address(desc.physical_start).max(DMA_ZONE.end());
        let end = filter_address(desc.physical_start) + desc.number_of_pages * PAGE_SIZE as u64;
        if end > start {
            bootstrap = Some((start, (end - start) / PAGE_SIZE as u64));
            break;
        }
    }
    let (first_start, first_pages) = bootstrap.ok_or(KernelError::OutOfMemory {
        requested: PAGE_SIZE,
    })?;

    // Seed frames for the first window page (and any missing intermediate
    // tables) come off the top of the first usable region.
    let mut seed_cursor = first_start + first_pages * PAGE_SIZE as u64;
    let mut seeds_taken = 0u64;
    // SAFETY: The window page is reserved for the allocator and every seed
    // frame comes straight from the firmware map.
    unsafe {
        super::pager::map_window_page(PHYSICAL_MEMORY_MAP.start, &mut || {
            if seed_cursor <= first_start + PAGE_SIZE as u64 {
                return None;
            }
            seed_cursor -= PAGE_SIZE as u64;
            seeds_taken += 1;
            Some(seed_cursor)
        })?;
    }
    fa.capacity = BLOCKS_PER_PAGE;

    let mut seeded = false;
    for desc in loader.memory_map() {
        if !desc.is_reclaimable() {
            continue;
        }
        let start = filter_address(desc.physical_start);
        let mut pages = desc.number_of_pages;
        if !seeded && start.max(DMA_ZONE.end()) == first_start {
            // Drop the frames sacrificed for the bootstrap mapping.
            pages = pages.saturating_sub(seeds_taken);
            seeded = true;
        }
        if pages == 0 {
            continue;
        }
        fa.insert_region(start, pages)?;
    }

    log::info!(
        target: "mm",
        "frame allocator: {} MiB conventional in {} blocks",
        fa.available_memory() / (1024 * 1024),
        fa.block_count()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator_with(blocks: usize) -> (alloc::vec::Vec<FreeBlock>, FrameAllocator) {
        let mut storage = alloc::vec![FreeBlock { start: 0, pages: 0 }; blocks];
        let fa = FrameAllocator::with_storage(&mut storage);
        (storage, fa)
    }

    #[test]
    fn test_balanced_sequences_restore_available_memory() {
        let (_s, mut fa) = allocator_with(64);
        fa.insert_region(0x1_0000_0000, 1024).unwrap();
        let baseline = fa.available_memory();

        let mut held = alloc::vec::Vec::new();
        for _ in 0..100 {
            held.push(fa.allocate().unwrap());
        }
        let run = fa.allocate_run(37).unwrap();
        for f in held.drain(..) {
            fa.free(f).unwrap();
        }
        fa.free_run(run, 37).unwrap();

        assert_eq!(fa.available_memory(), baseline);
        // Full merge back to a single block: no frame appears twice.
        assert_eq!(fa.block_count(), 1);
        assert_eq!(
            fa.block(0).unwrap(),
            FreeBlock {
                start: 0x1_0000_0000,
                pages: 1024
            }
        );
    }

    #[test]
    fn test_no_frame_handed_out_twice() {
        let (_s, mut fa) = allocator_with(64);
        fa.insert_region(0x2000_0000, 256).unwrap();
        let mut seen = alloc::collections::BTreeSet::new();
        while let Some(f) = fa.allocate() {
            assert!(seen.insert(f), "frame {f:#x} returned twice");
        }
        assert_eq!(seen.len(), 256);
        assert_eq!(fa.available_memory(), 0);
    }

    #[test]
    fn test_dma_zone_never_surfaces_from_general_allocator() {
        let (_s, mut fa) = allocator_with(64);
        // Region straddling the 16 MiB boundary: low part is clipped.
        fa.insert_region(0x0080_0000, 0x1800).unwrap(); // 8 MiB .. 32 MiB
        let mut frames = alloc::vec::Vec::new();
        while let Some(f) = fa.allocate() {
            assert!(f >= DMA_ZONE.end(), "DMA frame {f:#x} leaked");
            frames.push(f);
        }
        assert_eq!(frames.len(), 0x1000); // only the 16 MiB above the zone
    }

    #[test]
    fn test_dma_bitmap_allocate_and_query_agree() {
        let (_s, mut fa) = allocator_with(8);
        // All-free loader bitmap.
        let image = alloc::vec![0u8; DMA_PAGES / 8];
        fa.load_dma_bitmap(&image);

        // Page 0 is pinned.
        assert_eq!(fa.query_dma(0), DmaStatus::Allocated);

        let a = fa.allocate_dma(4).unwrap();
        assert_eq!(a, PAGE_SIZE as u64); // first free page is 1
        for i in 0..4 {
            assert_eq!(
                fa.query_dma(a + i * PAGE_SIZE as u64),
                DmaStatus::Allocated
            );
        }
        assert_eq!(fa.query_dma(a + 4 * PAGE_SIZE as u64), DmaStatus::Free);
        assert_eq!(fa.query_dma(DMA_ZONE.end()), DmaStatus::OutOfRange);

        fa.free_dma(a, 4).unwrap();
        assert_eq!(fa.query_dma(a), DmaStatus::Free);
        // Page 0 can never be freed.
        assert!(fa.free_dma(0, 1).is_err());
    }

    #[test]
    fn test_aligned_runs_split_blocks() {
        let (_s, mut fa) = allocator_with(64);
        fa.insert_region(0x0110_0000, 0x800).unwrap(); // 17 MiB, unaligned base
        let two_mb = fa.allocate_2mb().unwrap();
        assert_eq!(two_mb % 0x20_0000, 0);
        // Flanks remain free.
        assert!(fa.available_memory() > 0);
        fa.free_run(two_mb, 512).unwrap();
        assert_eq!(fa.block_count(), 1);
    }

    #[test]
    fn test_metadata_exhaustion_is_reported() {
        let (_s, mut fa) = allocator_with(2);
        fa.insert_region(0x1000_0000, 16).unwrap();
        fa.insert_region(0x3000_0000, 16).unwrap();
        // A third disjoint block does not fit in fixed storage.
        assert!(matches!(
            fa.insert_region(0x5000_0000, 16),
            Err(KernelError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_filter_address_masks_offset_bits() {
        assert_eq!(filter_address(0x1234_5678), 0x1234_5000);
        assert_eq!(filter_address(0xFFFF_FFFF_FFFF_FFFF) & 0xFFF, 0);
    }

    #[test]
    fn test_double_free_detected_as_overlap() {
        let (_s, mut fa) = allocator_with(8);
        fa.insert_region(0x1000_0000, 8).unwrap();
        let f = fa.allocate().unwrap();
        fa.free(f).unwrap();
        assert!(fa.free(f).is_err());
    }
}
