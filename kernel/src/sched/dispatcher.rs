//! Context-switch dispatcher and its interrupt stubs.
//!
//! The timer gate and the software-yield gate (`int 0x21`) both enter an
//! assembly stub that saves the general-purpose registers on the current
//! kernel stack and calls [`scheduler_irq_dispatcher`] with an output slot
//! for the switch decision. A null decision resumes the interrupted task;
//! otherwise the stub loads the new CR3, swaps stacks, and `iretq`s into
//! the incoming task. The save completes before the dispatcher reads the
//! stack pointer, and CR3 is written before any access through the new
//! address space.

use crate::{error::KernelResult, sched::percpu, timer::SystemTimer};

/// Milliseconds between rescheduling opportunities. The ISR itself runs
/// every tick; arbitration only happens at this boundary.
pub const RESCHEDULE_INTERVAL_MS: u64 = 10;

/// Output slot the stub hands to the dispatcher.
#[repr(C)]
pub struct SwitchResult {
    pub cr3: u64,
    pub rsp: u64,
}

core::arch::global_asm!(
    r#"
.section .text

.macro SCHED_SAVE_GPRS
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
.endm

// Timer tick entry.
.align 16
.global scheduler_timer_entry
scheduler_timer_entry:
    SCHED_SAVE_GPRS
    mov rdx, 0
    jmp scheduler_switch_tail

// Software-yield entry (int 0x21).
.align 16
.global scheduler_yield_entry
scheduler_yield_entry:
    SCHED_SAVE_GPRS
    mov rdx, 1
    jmp scheduler_switch_tail

// Shared arbitrate/restore path. On entry every GPR is saved and
// rdx = 1 for a software yield, 0 for a timer tick.
.align 16
scheduler_switch_tail:
    sub rsp, 16             // SwitchResult {{ cr3, rsp }}
    mov rdi, rsp
    lea rsi, [rsp + 16]     // saved-register block = outgoing stack pointer
    cld
    call scheduler_irq_dispatcher
    mov rax, [rsp]          // SwitchResult.cr3
    mov rcx, [rsp + 8]      // SwitchResult.rsp
    add rsp, 16
    test rax, rax
    jz 2f
    mov cr3, rax            // address space first, stack second
    mov rsp, rcx
2:
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    iretq
"#
);

extern "C" {
    static scheduler_timer_entry: u8;
    static scheduler_yield_entry: u8;
}

/// Address of the timer-tick switch stub.
pub fn timer_entry_address() -> u64 {
    // SAFETY: Taking the address of a linker symbol.
    unsafe { &scheduler_timer_entry as *const u8 as u64 }
}

/// Address of the software-yield switch stub.
pub fn yield_entry_address() -> u64 {
    // SAFETY: Taking the address of a linker symbol.
    unsafe { &scheduler_yield_entry as *const u8 as u64 }
}

/// The arbitration decision, shared by both stub flavors.
///
/// Timer ticks advance the clock, acknowledge the interrupt, and only
/// reschedule every [`RESCHEDULE_INTERVAL_MS`]. Yields skip the clock and
/// the EOI (nothing is in service) but always arbitrate — through the same
/// non-blocking lock, so a contended ring simply resumes the caller.
#[no_mangle]
extern "C" fn scheduler_irq_dispatcher(result: *mut SwitchResult, stack_context: u64, yielded: u64) {
    if result.is_null() {
        return;
    }
    // SAFETY: The stub passes a stack slot it owns.
    unsafe {
        (*result).cr3 = 0;
        (*result).rsp = 0;
    }

    let cpu = percpu::current();
    let arbitrate = if yielded != 0 {
        true
    } else {
        let timer = cpu.timer();
        timer.signal_irq();
        timer.send_eoi();
        timer.get_count_millis() % RESCHEDULE_INTERVAL_MS == 0
    };

    if !arbitrate {
        return;
    }
    if let Some(target) = cpu.tasks().task_switch(stack_context) {
        // SAFETY: See above.
        unsafe {
            (*result).cr3 = target.cr3;
            (*result).rsp = target.sp;
        }
    }
}

/// Hand the timer and yield gates to the scheduler and start preemption.
///
/// # Safety
///
/// The per-CPU table and its timer must be initialized; runs once on the
/// BSP.
pub unsafe fn initialize() -> KernelResult<()> {
    x86_64::instructions::interrupts::disable();
    let cpu = percpu::current();
    // SAFETY: The stubs uphold the interrupt-frame contract by
    // construction.
    unsafe {
        cpu.timer().reattach_irq(timer_entry_address())?;
        crate::interrupts::idt::set_raw_handler(
            crate::interrupts::YIELD_VECTOR,
            yield_entry_address(),
        );
    }
    cpu.timer().enable()?;
    log::info!(target: "sched", "[CPU {}] scheduler dispatching", cpu.id());
    x86_64::instructions::interrupts::enable();
    Ok(())
}

/// Cooperative yield: arbitrate now instead of waiting for the tick.
#[cfg(target_os = "none")]
pub fn yield_now() {
    // SAFETY: Vector 0x21 is permanently reserved for the yield gate; the
    // stub preserves every register. The default memory clobber keeps
    // shared state re-read after the task resumes.
    unsafe {
        core::arch::asm!("int 0x21");
    }
}

/// Host stand-in: tests drive the scheduler's data structures directly.
#[cfg(not(target_os = "none"))]
pub fn yield_now() {}
