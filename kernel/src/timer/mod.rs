//! Periodic system timer abstraction.
//!
//! The scheduler needs a 1 ms tick and a monotonic millisecond counter; the
//! hardware behind it is either channel 0 of the 8254 PIT routed through
//! the I/O APIC, or the Local APIC timer. Both implement [`SystemTimer`].
//! The counter advances by the tick period on every IRQ and is never reset
//! while the kernel is up (it would take ≈584 million years to wrap, so
//! naive arithmetic on deadlines is fine).

pub mod lapic;
pub mod pit;

use crate::error::KernelResult;

/// A periodic tick source.
pub trait SystemTimer: Send + Sync {
    /// One-time hardware setup: vector reservation, routing, divisor
    /// programming. The timer starts disabled (masked).
    fn initialize(&'static self) -> KernelResult<()>;

    /// Whether ticks are currently delivered.
    fn is_enabled(&self) -> bool;

    /// Enable tick delivery. Reference-counted: every `enable` must be
    /// paired with a `disable`, and delivery stops at zero.
    fn enable(&self) -> KernelResult<()>;

    /// Drop one enable reference.
    fn disable(&self);

    /// Point the timer's IDT gate at a replacement entry (the scheduler's
    /// context-switch stub). The replacement must call [`Self::signal_irq`]
    /// and [`Self::send_eoi`] itself.
    ///
    /// # Safety
    ///
    /// `entry` must uphold the architectural interrupt-frame contract.
    unsafe fn reattach_irq(&self, entry: u64) -> KernelResult<()>;

    /// Restore the timer's own IRQ entry.
    fn release_irq(&self);

    /// Advance the monotonic counter by one period. Called from the ISR
    /// (the timer's own, or a replacement installed via `reattach_irq`).
    fn signal_irq(&self);

    /// Acknowledge the interrupt at the controller.
    fn send_eoi(&self);

    /// Install a brief tick callback run inside the ISR.
    fn set_handler(&self, handler: fn());

    /// Monotonic milliseconds since `initialize`.
    fn get_count_millis(&self) -> u64;

    /// Monotonic microseconds since `initialize`.
    fn get_count_micros(&self) -> u64;
}

/// Busy-wait until `deadline_ms` (used before the scheduler exists).
pub fn busy_wait_until(timer: &dyn SystemTimer, deadline_ms: u64) {
    while timer.get_count_millis() < deadline_ms {
        core::hint::spin_loop();
    }
}
