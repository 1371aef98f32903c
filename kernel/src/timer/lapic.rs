//! Local APIC timer driver.
//!
//! The LAPIC timer's input clock is implementation-defined, so bring-up
//! calibrates it against a 10 ms one-shot on PIT channel 2, then programs
//! periodic mode for a 1 ms tick. Preferred over the PIT once calibrated:
//! no I/O APIC hop, per-CPU delivery.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::{
    error::{KernelError, KernelResult},
    interrupts::{self, apic, idt, InterruptProvider},
    timer::SystemTimer,
};

/// Divide-configuration value for divide-by-16.
const DIVIDE_BY_16: u8 = 0x03;

/// Calibration window length.
const CALIBRATION_MS: u32 = 10;

/// LAPIC-timer-backed [`SystemTimer`].
pub struct LapicTimer {
    ticks: AtomicU64,
    enable_count: AtomicUsize,
    vector: AtomicU8,
    initialized: AtomicBool,
    handler: AtomicU64,
    /// Calibrated counts per millisecond at divide-by-16.
    counts_per_ms: AtomicU32,
}

impl LapicTimer {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            enable_count: AtomicUsize::new(0),
            vector: AtomicU8::new(0),
            initialized: AtomicBool::new(false),
            handler: AtomicU64::new(0),
            counts_per_ms: AtomicU32::new(0),
        }
    }
}

impl Default for LapicTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Global LAPIC timer instance.
pub static LAPIC_TIMER: LapicTimer = LapicTimer::new();

impl InterruptProvider for LapicTimer {
    fn handle_irq(&self, _stack: *mut u8, _error_code: u64) {
        self.signal_irq();
        let handler = self.handler.load(Ordering::Relaxed);
        if handler != 0 {
            // SAFETY: The word was stored from a `fn()` in `set_handler`.
            let f: fn() = unsafe { core::mem::transmute(handler as *const ()) };
            f();
        }
        self.send_eoi();
    }
}

impl SystemTimer for LapicTimer {
    fn initialize(&'static self) -> KernelResult<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(KernelError::AlreadyExists {
                resource: "LAPIC timer",
            });
        }
        let vector = interrupts::reserve_interrupt().ok_or(KernelError::OutOfMemory {
            requested: 1,
        })?;
        self.vector.store(vector, Ordering::Relaxed);
        interrupts::register_provider(vector, self)?;

        // Calibrate: free-run from the maximum count for a PIT-timed
        // window, then read back how far it got.
        apic::setup_lapic_timer(vector, DIVIDE_BY_16, u32::MAX)?;
        // SAFETY: Bring-up runs with interrupts disabled and owns channel 2.
        unsafe {
            super::pit::busy_wait_ms(CALIBRATION_MS);
        }
        let remaining = read_current_count();
        apic::stop_lapic_timer();

        let elapsed = u32::MAX - remaining;
        let counts_per_ms = (elapsed / CALIBRATION_MS).max(1);
        self.counts_per_ms.store(counts_per_ms, Ordering::Relaxed);
        log::info!(
            target: "timer",
            "LAPIC timer: {} counts/ms (div 16) on vector {:#x}",
            counts_per_ms,
            vector
        );
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enable_count.load(Ordering::Relaxed) > 0
    }

    fn enable(&self) -> KernelResult<()> {
        if self.enable_count.fetch_add(1, Ordering::AcqRel) == 0 {
            let counts = self.counts_per_ms.load(Ordering::Relaxed);
            if counts == 0 {
                return Err(KernelError::NotInitialized {
                    subsystem: "LAPIC timer",
                });
            }
            apic::setup_lapic_timer(self.vector.load(Ordering::Relaxed), DIVIDE_BY_16, counts)?;
        }
        Ok(())
    }

    fn disable(&self) {
        if self.enable_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            apic::stop_lapic_timer();
        }
    }

    unsafe fn reattach_irq(&self, entry: u64) -> KernelResult<()> {
        let vector = self.vector.load(Ordering::Relaxed);
        if vector == 0 {
            return Err(KernelError::NotInitialized {
                subsystem: "LAPIC timer",
            });
        }
        // SAFETY: Contract forwarded to the caller.
        unsafe {
            idt::set_raw_handler(vector, entry);
        }
        Ok(())
    }

    fn release_irq(&self) {
        let vector = self.vector.load(Ordering::Relaxed);
        if vector != 0 {
            idt::restore_default_handler(vector);
        }
    }

    fn signal_irq(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    fn send_eoi(&self) {
        apic::send_eoi();
    }

    fn set_handler(&self, handler: fn()) {
        self.handler.store(handler as usize as u64, Ordering::Relaxed);
    }

    fn get_count_millis(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn get_count_micros(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed) * 1000
    }
}

/// Read the LAPIC timer's current-count register through the fabric.
fn read_current_count() -> u32 {
    // The fabric owns the MMIO window; a missing fabric reads as zero so
    // calibration degrades to the 1-count floor instead of faulting.
    crate::interrupts::apic::with_timer_count().unwrap_or(0)
}
