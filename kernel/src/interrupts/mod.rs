//! Interrupt fabric: vector reservation and provider dispatch.
//!
//! Vectors are a fixed resource shared by devices. A 256-bit pool records
//! reservations — `[0, 32)` belongs to the CPU, `0x21` to the software
//! yield — and each reserved vector maps to at most one
//! [`InterruptProvider`]. The common dispatcher (entered from the assembly
//! stubs in [`idt`]) routes by vector number.

pub mod apic;
pub mod idt;
pub mod pic;

use spin::{Mutex, RwLock};

use crate::error::{KernelError, KernelResult};

/// Vector used for cooperative software yield (`int 0x21`).
pub const YIELD_VECTOR: u8 = 0x21;

/// First vector available to devices.
pub const FIRST_EXTERNAL_VECTOR: u8 = 32;

/// A device-side interrupt handler.
///
/// `stack` points at the saved general-purpose registers below the CPU
/// interrupt frame; `error_code` is zero for external interrupts.
pub trait InterruptProvider: Send + Sync {
    fn handle_irq(&self, stack: *mut u8, error_code: u64);
}

/// 256-bit reservation pool.
pub struct VectorPool {
    bitmap: [u64; 4],
}

impl VectorPool {
    /// Pool with the CPU-exception range and the yield vector reserved.
    pub const fn new() -> Self {
        let mut bitmap = [0u64; 4];
        // Vectors [0, 32) are CPU exceptions.
        bitmap[0] = 0xFFFF_FFFF;
        // 0x21 is the software yield.
        bitmap[0] |= 1 << (YIELD_VECTOR as u64);
        Self { bitmap }
    }

    /// Reserve the lowest free vector.
    pub fn reserve(&mut self) -> Option<u8> {
        for (word, bits) in self.bitmap.iter_mut().enumerate() {
            if *bits != u64::MAX {
                let bit = bits.trailing_ones() as usize;
                *bits |= 1 << bit;
                return Some((word * 64 + bit) as u8);
            }
        }
        None
    }

    /// Reserve a specific vector.
    pub fn reserve_specific(&mut self, vector: u8) -> KernelResult<()> {
        let (word, bit) = (vector as usize / 64, vector as usize % 64);
        if self.bitmap[word] & (1 << bit) != 0 {
            return Err(KernelError::AlreadyExists { resource: "vector" });
        }
        self.bitmap[word] |= 1 << bit;
        Ok(())
    }

    /// Release a reserved vector (never the exception range).
    pub fn release(&mut self, vector: u8) {
        if vector < FIRST_EXTERNAL_VECTOR || vector == YIELD_VECTOR {
            return;
        }
        let (word, bit) = (vector as usize / 64, vector as usize % 64);
        self.bitmap[word] &= !(1 << bit);
    }

    /// Whether a vector is currently reserved.
    pub fn is_reserved(&self, vector: u8) -> bool {
        self.bitmap[vector as usize / 64] & (1 << (vector as usize % 64)) != 0
    }
}

impl Default for VectorPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Global vector pool.
static VECTORS: Mutex<VectorPool> = Mutex::new(VectorPool::new());

/// Per-vector providers. Reads happen in interrupt context; writes only at
/// registration time.
static PROVIDERS: RwLock<[Option<&'static dyn InterruptProvider>; 256]> =
    RwLock::new([None; 256]);

/// Run `f` with interrupts disabled. Task-side critical sections over any
/// lock an ISR also takes must go through here: on a single processor, an
/// ISR spinning on a lock its interrupted task holds would never make
/// progress. On the host (tests) interrupts are not ours to touch.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::without_interrupts(f)
    }
    #[cfg(not(target_os = "none"))]
    {
        f()
    }
}

/// Reserve the lowest free vector.
pub fn reserve_interrupt() -> Option<u8> {
    VECTORS.lock().reserve()
}

/// Return a vector to the pool and drop its provider.
pub fn release_interrupt(vector: u8) {
    without_interrupts(|| PROVIDERS.write()[vector as usize] = None);
    VECTORS.lock().release(vector);
}

/// Attach a provider to a reserved vector.
pub fn register_provider(
    vector: u8,
    provider: &'static dyn InterruptProvider,
) -> KernelResult<()> {
    if !VECTORS.lock().is_reserved(vector) {
        return Err(KernelError::InvalidParameter { name: "vector" });
    }
    without_interrupts(|| {
        let mut providers = PROVIDERS.write();
        if providers[vector as usize].is_some() {
            return Err(KernelError::AlreadyExists {
                resource: "interrupt provider",
            });
        }
        providers[vector as usize] = Some(provider);
        Ok(())
    })
}

/// Detach the provider of a vector (the reservation stays).
pub fn unregister_provider(vector: u8) {
    without_interrupts(|| PROVIDERS.write()[vector as usize] = None);
}

/// Common dispatcher, called from the assembly entry with interrupts
/// disabled.
pub fn dispatch(vector: u8, stack: *mut u8, error_code: u64) {
    if vector == 14 {
        // #PF narrows its own response.
        let cr2 = x86_64::registers::control::Cr2::read_raw();
        // SAFETY: Running on the faulting CPU inside the #PF handler.
        let resolution = unsafe { crate::mm::page_fault::handle(error_code, cr2) };
        match resolution {
            crate::mm::page_fault::FaultResolution::Committed { .. } => return,
            fatal => crate::panic::halt(format_args!(
                "page fault at {:#x}: {:?} (error {:#x})",
                cr2, fatal, error_code
            )),
        }
    }
    if vector < FIRST_EXTERNAL_VECTOR {
        crate::panic::halt(format_args!(
            "CPU exception {} (error {:#x})",
            vector, error_code
        ));
    }

    let provider = PROVIDERS.read()[vector as usize];
    match provider {
        Some(p) => p.handle_irq(stack, error_code),
        None => log::trace!(target: "irq", "spurious vector {:#x}", vector),
    }
}

/// Assembly-side entry point.
///
/// # Safety
///
/// Called only from the interrupt stubs.
#[no_mangle]
unsafe extern "C" fn interrupt_dispatch(vector: u64, stack: *mut u8, error_code: u64) {
    dispatch(vector as u8, stack, error_code);
}

/// Interrupt bring-up: IDT load, PIC quiesce (when the MADT reports one),
/// LAPIC and I/O APIC programming.
///
/// # Safety
///
/// Runs once on the BSP, before interrupts are enabled.
pub unsafe fn init(madt: &crate::acpi::MadtInfo) -> KernelResult<()> {
    idt::init();
    if madt.pcat_compat {
        // SAFETY: Single bring-up call.
        unsafe {
            pic::remap_and_mask();
        }
    }
    // SAFETY: Single bring-up call on the BSP.
    unsafe {
        apic::init(madt)?;
    }
    log::info!(target: "irq", "interrupt fabric initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reserves_exceptions_and_yield() {
        let pool = VectorPool::new();
        for v in 0..32 {
            assert!(pool.is_reserved(v));
        }
        assert!(pool.is_reserved(YIELD_VECTOR));
        assert!(!pool.is_reserved(34));
    }

    #[test]
    fn test_reserve_returns_lowest_free() {
        let mut pool = VectorPool::new();
        // 0x20 is the first free vector (0x21 is the yield).
        assert_eq!(pool.reserve(), Some(0x20));
        assert_eq!(pool.reserve(), Some(0x22));
        assert_eq!(pool.reserve(), Some(0x23));
        pool.release(0x22);
        assert_eq!(pool.reserve(), Some(0x22));
    }

    #[test]
    fn test_exception_range_cannot_be_released() {
        let mut pool = VectorPool::new();
        pool.release(14);
        assert!(pool.is_reserved(14));
        pool.release(YIELD_VECTOR);
        assert!(pool.is_reserved(YIELD_VECTOR));
    }

    #[test]
    fn test_specific_reservation_conflicts() {
        let mut pool = VectorPool::new();
        assert!(pool.reserve_specific(0x30).is_ok());
        assert!(pool.reserve_specific(0x30).is_err());
        pool.release(0x30);
        assert!(pool.reserve_specific(0x30).is_ok());
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = VectorPool::new();
        let mut granted = 0;
        while pool.reserve().is_some() {
            granted += 1;
        }
        // 256 minus 32 exceptions minus the yield vector.
        assert_eq!(granted, 256 - 32 - 1);
    }
}
