//! Kernel heap: AVL-tree best-fit allocator.
//!
//! Free chunks double as tree nodes (the node struct lives in the unused
//! bytes of the chunk), keyed by chunk address so adjacent ranges merge by
//! plain arithmetic on free. Allocation walks the tree for the best fit;
//! returned blocks carry a header recording the chunk's effective size and
//! the payload offset. The arena lives in the reserved kernel-heap region
//! and grows by asking the Pager for more on-demand pages.

use core::alloc::{GlobalAlloc, Layout};

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    mm::layout::{KERNEL_HEAP, PAGE_SIZE},
};

/// Minimum payload alignment.
const MIN_ALIGN: usize = 8;

/// Arena growth granularity (bytes).
const GROW_STEP: usize = 64 * 1024;

/// Free-chunk tree node, stored inside the chunk itself.
#[repr(C)]
struct FreeNode {
    /// Chunk size in bytes, node included.
    size: usize,
    left: *mut FreeNode,
    right: *mut FreeNode,
    height: i32,
}

/// Smallest chunk worth tracking.
const MIN_CHUNK: usize = core::mem::size_of::<FreeNode>();

/// Header preceding every allocated payload.
#[repr(C)]
struct Header {
    /// Effective chunk size (from chunk base to chunk end).
    size: usize,
    /// Payload offset from the chunk base (recovers the base on free).
    offset: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<Header>();

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// ---------------------------------------------------------------------------
// AVL primitives (address-keyed, intrusive)
// ---------------------------------------------------------------------------

unsafe fn height(node: *mut FreeNode) -> i32 {
    if node.is_null() {
        0
    } else {
        // SAFETY: Non-null nodes are live free chunks owned by the heap.
        unsafe { (*node).height }
    }
}

unsafe fn fix_height(node: *mut FreeNode) {
    // SAFETY: Caller passes a live node.
    unsafe {
        (*node).height = 1 + height((*node).left).max(height((*node).right));
    }
}

unsafe fn balance_factor(node: *mut FreeNode) -> i32 {
    // SAFETY: Caller passes a live node.
    unsafe { height((*node).left) - height((*node).right) }
}

unsafe fn rotate_right(root: *mut FreeNode) -> *mut FreeNode {
    // SAFETY: AVL rotation over live nodes; the left child exists whenever
    // the balance factor demands this rotation.
    unsafe {
        let pivot = (*root).left;
        (*root).left = (*pivot).right;
        (*pivot).right = root;
        fix_height(root);
        fix_height(pivot);
        pivot
    }
}

unsafe fn rotate_left(root: *mut FreeNode) -> *mut FreeNode {
    // SAFETY: Mirror of rotate_right.
    unsafe {
        let pivot = (*root).right;
        (*root).right = (*pivot).left;
        (*pivot).left = root;
        fix_height(root);
        fix_height(pivot);
        pivot
    }
}

unsafe fn rebalance(node: *mut FreeNode) -> *mut FreeNode {
    // SAFETY: Standard AVL rebalance over live nodes.
    unsafe {
        fix_height(node);
        let bf = balance_factor(node);
        if bf > 1 {
            if balance_factor((*node).left) < 0 {
                (*node).left = rotate_left((*node).left);
            }
            rotate_right(node)
        } else if bf < -1 {
            if balance_factor((*node).right) > 0 {
                (*node).right = rotate_right((*node).right);
            }
            rotate_left(node)
        } else {
            node
        }
    }
}

unsafe fn insert(root: *mut FreeNode, node: *mut FreeNode) -> *mut FreeNode {
    if root.is_null() {
        return node;
    }
    // SAFETY: Live nodes; addresses are unique (chunks are disjoint).
    unsafe {
        if (node as usize) < (root as usize) {
            (*root).left = insert((*root).left, node);
        } else {
            (*root).right = insert((*root).right, node);
        }
        rebalance(root)
    }
}

/// Detach the minimum node of `root`'s subtree; returns (new_root, min).
unsafe fn detach_min(root: *mut FreeNode) -> (*mut FreeNode, *mut FreeNode) {
    // SAFETY: Live subtree.
    unsafe {
        if (*root).left.is_null() {
            return ((*root).right, root);
        }
        let (new_left, min) = detach_min((*root).left);
        (*root).left = new_left;
        (rebalance(root), min)
    }
}

/// Remove the node at exactly `addr`; returns (new_root, removed?).
unsafe fn remove(root: *mut FreeNode, addr: usize) -> (*mut FreeNode, bool) {
    if root.is_null() {
        return (root, false);
    }
    // SAFETY: Live subtree; intrusive delete relinks node pointers rather
    // than moving keys (the node is the chunk).
    unsafe {
        if addr < root as usize {
            let (new_left, removed) = remove((*root).left, addr);
            (*root).left = new_left;
            (rebalance(root), removed)
        } else if addr > root as usize {
            let (new_right, removed) = remove((*root).right, addr);
            (*root).right = new_right;
            (rebalance(root), removed)
        } else {
            let left = (*root).left;
            let right = (*root).right;
            if left.is_null() {
                (right, true)
            } else if right.is_null() {
                (left, true)
            } else {
                let (new_right, succ) = detach_min(right);
                (*succ).left = left;
                (*succ).right = new_right;
                (rebalance(succ), true)
            }
        }
    }
}

/// Best-fit walk: smallest chunk with `size >= required` (lowest address on
/// ties).
unsafe fn find_best_fit(root: *mut FreeNode, required: usize) -> *mut FreeNode {
    if root.is_null() {
        return core::ptr::null_mut();
    }
    // SAFETY: Live subtree.
    unsafe {
        let mut best = if (*root).size >= required {
            root
        } else {
            core::ptr::null_mut()
        };
        for child in [(*root).left, (*root).right] {
            let candidate = find_best_fit(child, required);
            if candidate.is_null() {
                continue;
            }
            if best.is_null()
                || (*candidate).size < (*best).size
                || ((*candidate).size == (*best).size && (candidate as usize) < (best as usize))
            {
                best = candidate;
            }
        }
        best
    }
}

/// Greatest node with address < `addr`.
unsafe fn predecessor(root: *mut FreeNode, addr: usize) -> *mut FreeNode {
    let mut best = core::ptr::null_mut();
    let mut cur = root;
    while !cur.is_null() {
        // SAFETY: Live subtree.
        unsafe {
            if (cur as usize) < addr {
                best = cur;
                cur = (*cur).right;
            } else {
                cur = (*cur).left;
            }
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

/// How the arena acquires more address space.
enum Backing {
    /// Fixed buffer (host tests); never grows.
    Fixed,
    /// The reserved kernel-heap region, extended via on-demand pages.
    Demand,
}

/// Kernel heap state.
pub struct KernelHeap {
    root: *mut FreeNode,
    backing: Backing,
    /// Next unbacked arena address (Demand mode).
    arena_next: u64,
    /// Bytes currently free.
    free_bytes: usize,
}

// SAFETY: All node pointers refer to arena memory owned exclusively by the
// heap; access is serialized by the KERNEL_HEAP_ALLOCATOR spinlock.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    /// Empty heap in Demand mode (the arena extends on first use).
    pub const fn empty() -> Self {
        Self {
            root: core::ptr::null_mut(),
            backing: Backing::Demand,
            arena_next: KERNEL_HEAP.start,
            free_bytes: 0,
        }
    }

    /// Heap over a fixed caller-provided buffer (test seam).
    ///
    /// # Safety
    ///
    /// The buffer must outlive the heap and not be used elsewhere.
    pub unsafe fn with_buffer(base: *mut u8, size: usize) -> Self {
        let mut heap = Self::empty();
        heap.backing = Backing::Fixed;
        // SAFETY: The caller hands over the buffer exclusively.
        unsafe {
            heap.insert_free(base as usize, size & !(MIN_ALIGN - 1));
        }
        heap
    }

    /// Insert a free range, merging with the adjacent neighbors.
    ///
    /// # Safety
    ///
    /// `[base, base+size)` must be arena memory owned by the heap and not
    /// referenced by any live allocation.
    unsafe fn insert_free(&mut self, mut base: usize, mut size: usize) {
        debug_assert!(size >= MIN_CHUNK);
        // Only the newly freed bytes count; merged neighbors are already in
        // the tally.
        self.free_bytes += size;
        // SAFETY: Tree ops over live nodes.
        unsafe {
            // Merge with the exact successor.
            let succ_addr = base + size;
            let (new_root, removed) = remove(self.root, succ_addr);
            if removed {
                self.root = new_root;
                size += (*(succ_addr as *mut FreeNode)).size;
            }
            // Merge with a touching predecessor.
            let pred = predecessor(self.root, base);
            if !pred.is_null() && pred as usize + (*pred).size == base {
                let pred_addr = pred as usize;
                let (new_root, _) = remove(self.root, pred_addr);
                self.root = new_root;
                size += (*pred).size;
                base = pred_addr;
            }

            let node = base as *mut FreeNode;
            (*node).size = size;
            (*node).left = core::ptr::null_mut();
            (*node).right = core::ptr::null_mut();
            (*node).height = 1;
            self.root = insert(self.root, node);
        }
    }

    /// Extend the arena by at least `want` bytes (Demand mode only).
    fn grow(&mut self, want: usize) -> KernelResult<()> {
        match self.backing {
            Backing::Fixed => Err(KernelError::OutOfMemory { requested: want }),
            Backing::Demand => {
                let bytes = align_up(want.max(GROW_STEP), PAGE_SIZE);
                if self.arena_next + bytes as u64 > KERNEL_HEAP.end() {
                    return Err(KernelError::OutOfMemory { requested: want });
                }
                let base = self.arena_next;
                // SAFETY: The kernel-heap region is reserved for this arena;
                // placeholders commit on first touch.
                unsafe {
                    super::pager::map_on_demand(
                        base,
                        (bytes / PAGE_SIZE) as u64,
                        super::page_table::PteFlags::WRITABLE
                            | super::page_table::PteFlags::GLOBAL
                            | super::page_table::PteFlags::NO_EXECUTE,
                        super::pager::Space::Primary,
                    )?;
                }
                self.arena_next += bytes as u64;
                // SAFETY: Freshly reserved arena range.
                unsafe {
                    self.insert_free(base as usize, bytes);
                }
                Ok(())
            }
        }
    }

    /// Allocate per `layout`; minimum alignment is 8 bytes.
    pub fn allocate(&mut self, layout: Layout) -> KernelResult<*mut u8> {
        let align = layout.align().max(MIN_ALIGN);
        let need = align_up(layout.size().max(1), MIN_ALIGN);
        // Worst case: header + payload + slack to reach the alignment.
        let required = HEADER_SIZE + need + (align - MIN_ALIGN);
        let required = required.max(MIN_CHUNK);

        // SAFETY: Tree walks over live nodes.
        let mut node = unsafe { find_best_fit(self.root, required) };
        if node.is_null() {
            self.grow(required)?;
            // SAFETY: As above.
            node = unsafe { find_best_fit(self.root, required) };
            if node.is_null() {
                return Err(KernelError::OutOfMemory {
                    requested: layout.size(),
                });
            }
        }

        // SAFETY: node is a live free chunk; it leaves the tree before its
        // bytes are reused.
        unsafe {
            let chunk_base = node as usize;
            let chunk_size = (*node).size;
            let (new_root, removed) = remove(self.root, chunk_base);
            debug_assert!(removed);
            self.root = new_root;
            self.free_bytes -= chunk_size;

            let payload = align_up(chunk_base + HEADER_SIZE, align);
            let used_end = payload + need;
            debug_assert!(used_end <= chunk_base + chunk_size);

            // Keep at least MIN_CHUNK so the chunk is representable as a
            // free node again when it comes back.
            let keep = (used_end - chunk_base).max(MIN_CHUNK);
            let remainder = chunk_size - keep.min(chunk_size);
            let effective = if remainder >= MIN_CHUNK {
                self.insert_free(chunk_base + keep, remainder);
                keep
            } else {
                chunk_size
            };

            let header = (payload - HEADER_SIZE) as *mut Header;
            (*header).size = effective;
            (*header).offset = payload - chunk_base;

            Ok(payload as *mut u8)
        }
    }

    /// Free a pointer previously returned by [`Self::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from this heap and not be freed twice.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: The header sits immediately below every payload.
        unsafe {
            let header = (ptr as usize - HEADER_SIZE) as *const Header;
            let chunk_base = ptr as usize - (*header).offset;
            let size = (*header).size;
            self.insert_free(chunk_base, size);
        }
    }

    /// Bytes currently free in the arena.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }
}

/// Spinlocked heap usable as the global allocator.
pub struct LockedKernelHeap {
    inner: Mutex<KernelHeap>,
}

impl LockedKernelHeap {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(KernelHeap::empty()),
        }
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, KernelHeap> {
        self.inner.lock()
    }
}

impl Default for LockedKernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: allocate/free uphold GlobalAlloc's contract: distinct live
// allocations never overlap, and layouts round-trip through the header.
unsafe impl GlobalAlloc for LockedKernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner
            .lock()
            .allocate(layout)
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: GlobalAlloc guarantees ptr came from alloc above.
        unsafe {
            self.inner.lock().free(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap(bytes: usize) -> (alloc::vec::Vec<u64>, KernelHeap) {
        let mut buf = alloc::vec![0u64; bytes / 8];
        // SAFETY: The buffer outlives the heap within each test.
        let heap = unsafe { KernelHeap::with_buffer(buf.as_mut_ptr() as *mut u8, bytes) };
        (buf, heap)
    }

    #[test]
    fn test_alloc_free_roundtrip_restores_free_bytes() {
        let (_buf, mut heap) = test_heap(64 * 1024);
        let baseline = heap.free_bytes();

        let layout = Layout::from_size_align(100, 8).unwrap();
        let mut ptrs = alloc::vec::Vec::new();
        for _ in 0..50 {
            ptrs.push(heap.allocate(layout).unwrap());
        }
        for p in ptrs.drain(..) {
            // SAFETY: Just allocated above.
            unsafe { heap.free(p) };
        }
        assert_eq!(heap.free_bytes(), baseline);
    }

    #[test]
    fn test_allocations_do_not_overlap() {
        let (_buf, mut heap) = test_heap(32 * 1024);
        let layout = Layout::from_size_align(48, 8).unwrap();
        let mut ranges: alloc::vec::Vec<(usize, usize)> = alloc::vec::Vec::new();
        for _ in 0..100 {
            let p = heap.allocate(layout).unwrap() as usize;
            for &(s, e) in &ranges {
                assert!(p + 48 <= s || p >= e, "overlap at {p:#x}");
            }
            ranges.push((p, p + 48));
        }
    }

    #[test]
    fn test_best_fit_prefers_tight_chunk() {
        let (_buf, mut heap) = test_heap(16 * 1024);
        // Carve three holes of different sizes: free order scrambles them.
        let big = heap
            .allocate(Layout::from_size_align(2048, 8).unwrap())
            .unwrap();
        let sep1 = heap
            .allocate(Layout::from_size_align(64, 8).unwrap())
            .unwrap();
        let small = heap
            .allocate(Layout::from_size_align(256, 8).unwrap())
            .unwrap();
        let sep2 = heap
            .allocate(Layout::from_size_align(64, 8).unwrap())
            .unwrap();
        // SAFETY: Allocated above.
        unsafe {
            heap.free(big);
            heap.free(small);
        }
        // A 200-byte request must land in the 256-byte hole, not the big one.
        let p = heap
            .allocate(Layout::from_size_align(200, 8).unwrap())
            .unwrap();
        assert_eq!(p, small);
        // SAFETY: Allocated above.
        unsafe {
            heap.free(p);
            heap.free(sep1);
            heap.free(sep2);
        }
    }

    #[test]
    fn test_free_merges_adjacent_ranges() {
        let (_buf, mut heap) = test_heap(16 * 1024);
        let baseline = heap.free_bytes();
        let layout = Layout::from_size_align(512, 8).unwrap();
        let a = heap.allocate(layout).unwrap();
        let b = heap.allocate(layout).unwrap();
        let c = heap.allocate(layout).unwrap();
        // Free in scrambled order; the ranges must coalesce completely.
        // SAFETY: Allocated above.
        unsafe {
            heap.free(b);
            heap.free(a);
            heap.free(c);
        }
        assert_eq!(heap.free_bytes(), baseline);
        // A request close to the whole arena succeeds only if merged.
        let whole = heap.allocate(Layout::from_size_align(baseline - 64, 8).unwrap());
        assert!(whole.is_ok());
    }

    #[test]
    fn test_large_alignment_honored() {
        let (_buf, mut heap) = test_heap(64 * 1024);
        for align in [16usize, 64, 256, 4096] {
            let p = heap
                .allocate(Layout::from_size_align(32, align).unwrap())
                .unwrap();
            assert_eq!(p as usize % align, 0, "align {align}");
            // SAFETY: Allocated above.
            unsafe { heap.free(p) };
        }
    }

    #[test]
    fn test_exhaustion_reports_out_of_memory() {
        let (_buf, mut heap) = test_heap(4096);
        let r = heap.allocate(Layout::from_size_align(8192, 8).unwrap());
        assert!(matches!(r, Err(KernelError::OutOfMemory { .. })));
    }
}
