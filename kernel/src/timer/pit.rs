//! 8254 PIT driver.
//!
//! Channel 0 runs in rate-generator mode with a reload of 1193
//! (1.193182 MHz / 1193 ≈ 1 kHz), edge-triggered on ISA IRQ 0 through the
//! I/O APIC. Channel 2 doubles as a one-shot busy-wait used to calibrate
//! the Local APIC timer.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use x86_64::instructions::port::Port;

use crate::{
    error::{KernelError, KernelResult},
    interrupts::{self, idt, InterruptProvider},
    timer::SystemTimer,
};

/// PIT oscillator frequency in Hz.
const PIT_FREQUENCY: u32 = 1_193_182;

/// Channel-0 reload for a ~1 ms period.
const CHANNEL0_RELOAD: u16 = 1193;

/// Nanoseconds per tick at the 1193 reload (for the microsecond counter).
const NANOS_PER_TICK: u64 = 1193 * 1_000_000_000 / PIT_FREQUENCY as u64;

const CHANNEL0_DATA: u16 = 0x40;
const CHANNEL2_DATA: u16 = 0x42;
const PIT_COMMAND: u16 = 0x43;
/// Port B: channel-2 gate and output status.
const PORT_B: u16 = 0x61;

/// ISA source line of channel 0.
const PIT_ISA_IRQ: u8 = 0;

/// PIT-backed [`SystemTimer`].
pub struct Pit {
    ticks: AtomicU64,
    enable_count: AtomicUsize,
    vector: AtomicU8,
    initialized: AtomicBool,
    handler: AtomicU64,
}

impl Pit {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            enable_count: AtomicUsize::new(0),
            vector: AtomicU8::new(0),
            initialized: AtomicBool::new(false),
            handler: AtomicU64::new(0),
        }
    }

    fn vector(&self) -> u8 {
        self.vector.load(Ordering::Relaxed)
    }
}

impl Default for Pit {
    fn default() -> Self {
        Self::new()
    }
}

/// Global PIT instance.
pub static PIT: Pit = Pit::new();

impl InterruptProvider for Pit {
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

impl SystemTimer for Pit {
    fn initialize(&'static self) -> KernelResult<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(KernelError::AlreadyExists { resource: "PIT" });
        }
        let vector = interrupts::reserve_interrupt().ok_or(KernelError::OutOfMemory {
            requested: 1,
        })?;
        self.vector.store(vector, Ordering::Relaxed);
        interrupts::register_provider(vector, self)?;

        // Channel 0, lobyte/hibyte, mode 2 (rate generator), binary.
        // SAFETY: Architectural PIT command/data ports; single bring-up
        // caller.
        unsafe {
            let mut cmd: Port<u8> = Port::new(PIT_COMMAND);
            let mut ch0: Port<u8> = Port::new(CHANNEL0_DATA);
            cmd.write(0b0011_0100);
            ch0.write(CHANNEL0_RELOAD as u8);
            ch0.write((CHANNEL0_RELOAD >> 8) as u8);
        }

        // Routed but masked until the first `enable`.
        interrupts::apic::setup_irq(PIT_ISA_IRQ, vector, true)?;
        log::info!(target: "timer", "PIT: 1 ms tick on vector {:#x}", vector);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enable_count.load(Ordering::Relaxed) > 0
    }

    fn enable(&self) -> KernelResult<()> {
        if self.enable_count.fetch_add(1, Ordering::AcqRel) == 0 {
            interrupts::apic::set_irq_masked(PIT_ISA_IRQ, self.vector(), false)?;
        }
        Ok(())
    }

    fn disable(&self) {
        if self.enable_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = interrupts::apic::set_irq_masked(PIT_ISA_IRQ, self.vector(), true);
        }
    }

    unsafe fn reattach_irq(&self, entry: u64) -> KernelResult<()> {
        let vector = self.vector();
        if vector == 0 {
            return Err(KernelError::NotInitialized { subsystem: "PIT" });
        }
        // SAFETY: Contract forwarded to the caller.
        unsafe {
            idt::set_raw_handler(vector, entry);
        }
        Ok(())
    }

    fn release_irq(&self) {
        let vector = self.vector();
        if vector != 0 {
            idt::restore_default_handler(vector);
        }
    }

    fn signal_irq(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    fn send_eoi(&self) {
        interrupts::apic::send_eoi();
    }

    fn set_handler(&self, handler: fn()) {
        self.handler.store(handler as usize as u64, Ordering::Relaxed);
    }

    fn get_count_millis(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn get_count_micros(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed) * NANOS_PER_TICK / 1000
    }
}

/// Busy-wait approximately `ms` milliseconds on PIT channel 2 (one-shot).
/// Used to calibrate the Local APIC timer before any IRQ-driven clock
/// exists.
///
/// # Safety
///
/// Interrupts must be disabled and channel 2 otherwise unused.
pub unsafe fn busy_wait_ms(ms: u32) {
    let count = ((PIT_FREQUENCY / 1000) * ms).min(0xFFFF) as u16;

    // SAFETY: Architectural PIT channel-2 and port-B access; the caller
    // guarantees exclusivity.
    unsafe {
        let mut cmd: Port<u8> = Port::new(PIT_COMMAND);
        let mut ch2: Port<u8> = Port::new(CHANNEL2_DATA);
        let mut port_b: Port<u8> = Port::new(PORT_B);

        // Gate high, speaker off.
        let b = port_b.read();
        port_b.write((b & !0x02) | 0x01);

        // Channel 2, lobyte/hibyte, mode 0, binary.
        cmd.write(0b1011_0000);
        ch2.write(count as u8);
        ch2.write((count >> 8) as u8);

        // Pulse the gate to start counting.
        let b = port_b.read();
        port_b.write(b & !0x01);
        port_b.write(b | 0x01);

        // OUT2 (bit 5) rises when the count expires.
        while port_b.read() & 0x20 == 0 {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_counter_advances_monotonically() {
        let pit = Pit::new();
        assert_eq!(pit.get_count_millis(), 0);
        for _ in 0..250 {
            pit.signal_irq();
        }
        assert_eq!(pit.get_count_millis(), 250);
        // Microseconds track the true ~0.99985 ms period.
        let us = pit.get_count_micros();
        assert!(us > 249_000 && us < 250_100, "got {us}");
    }

    #[test]
    fn test_enable_reference_counting() {
        let pit = Pit::new();
        assert!(!pit.is_enabled());
        pit.enable_count.fetch_add(1, Ordering::Relaxed);
        assert!(pit.is_enabled());
        pit.enable_count.fetch_add(1, Ordering::Relaxed);
        pit.enable_count.fetch_sub(1, Ordering::Relaxed);
        assert!(pit.is_enabled(), "still one reference outstanding");
        pit.enable_count.fetch_sub(1, Ordering::Relaxed);
        assert!(!pit.is_enabled());
    }
}
