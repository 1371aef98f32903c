//! IDT with uniform vector stubs.
//!
//! All 256 gates point at 16-byte assembly stubs that push the vector
//! number (and a dummy error code where the CPU pushes none), save the
//! general-purpose registers, and enter the common dispatcher. The
//! scheduler later swaps individual gates to its own entry via
//! [`set_raw_handler`].

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::{structures::idt::InterruptDescriptorTable, VirtAddr};

core::arch::global_asm!(
    r#"
.section .text
.align 16
.global interrupt_vector_stubs
interrupt_vector_stubs:
.set vector_index, 0
.rept 256
    .align 16
    // Vectors where the CPU pushes an error code keep it; the rest get a
    // dummy so the frame layout is uniform.
    .if (vector_index == 8) || (vector_index == 10) || (vector_index == 11) || (vector_index == 12) || (vector_index == 13) || (vector_index == 14) || (vector_index == 17) || (vector_index == 21) || (vector_index == 29) || (vector_index == 30)
    push vector_index
    .else
    push 0
    push vector_index
    .endif
    jmp interrupt_stub_common
.set vector_index, vector_index + 1
.endr

.align 16
.global interrupt_stub_common
interrupt_stub_common:
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
    mov rdi, [rsp + 15*8]   // vector number
    mov rsi, rsp            // saved-register block
    mov rdx, [rsp + 16*8]   // error code
    cld
    call interrupt_dispatch
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
    add rsp, 16             // vector + error code
    iretq
"#
);

extern "C" {
    /// Start of the 256 × 16-byte stub array.
    static interrupt_vector_stubs: u8;
}

/// Byte stride between consecutive stubs.
const STUB_STRIDE: usize = 16;

/// Address of the stub for `vector`.
pub fn stub_address(vector: u8) -> u64 {
    // SAFETY: Taking the address of a linker symbol.
    let base = unsafe { &interrupt_vector_stubs as *const u8 as u64 };
    base + (vector as u64) * STUB_STRIDE as u64
}

lazy_static! {
    /// The IDT, guarded so [`set_raw_handler`] can retarget single gates.
    static ref IDT: Mutex<&'static mut InterruptDescriptorTable> = {
        // The table must outlive the kernel; leak a heap allocation.
        let idt = alloc::boxed::Box::leak(alloc::boxed::Box::new(
            InterruptDescriptorTable::new(),
        ));
        install_stubs(idt);
        Mutex::new(idt)
    };
}

fn install_stubs(idt: &mut InterruptDescriptorTable) {
    // Exception gates carry typed entries in the x86_64 crate; point each
    // at its stub so everything funnels through the common dispatcher.
    macro_rules! gate {
        ($field:expr, $vector:expr) => {
            // SAFETY: The stub address is valid kernel text with the
            // uniform frame discipline the dispatcher expects.
            unsafe {
                $field.set_handler_addr(VirtAddr::new(stub_address($vector)));
            }
        };
    }
    gate!(idt.divide_error, 0);
    gate!(idt.debug, 1);
    gate!(idt.non_maskable_interrupt, 2);
    gate!(idt.breakpoint, 3);
    gate!(idt.overflow, 4);
    gate!(idt.bound_range_exceeded, 5);
    gate!(idt.invalid_opcode, 6);
    gate!(idt.device_not_available, 7);
    gate!(idt.double_fault, 8);
    gate!(idt.invalid_tss, 10);
    gate!(idt.segment_not_present, 11);
    gate!(idt.stack_segment_fault, 12);
    gate!(idt.general_protection_fault, 13);
    gate!(idt.page_fault, 14);
    gate!(idt.x87_floating_point, 16);
    gate!(idt.alignment_check, 17);
    gate!(idt.machine_check, 18);
    gate!(idt.simd_floating_point, 19);
    gate!(idt.virtualization, 20);
    gate!(idt.cp_protection_exception, 21);

    for vector in 32..=255u8 {
        gate!(idt[vector], vector);
    }
}

/// Load the IDT on this CPU.
pub fn init() {
    let idt = IDT.lock();
    // SAFETY: The table is leaked at construction, so it lives for the
    // rest of the kernel's lifetime regardless of the guard.
    unsafe {
        idt.load_unsafe();
    }
}

/// Retarget one external gate at a raw entry point (used by the scheduler
/// to claim the timer and yield vectors).
///
/// # Safety
///
/// `addr` must be an interrupt entry that preserves the architectural
/// frame contract.
pub unsafe fn set_raw_handler(vector: u8, addr: u64) {
    let mut idt = IDT.lock();
    // SAFETY: Contract forwarded to the caller.
    unsafe {
        idt[vector].set_handler_addr(VirtAddr::new(addr));
    }
}

/// Restore an external gate to its default stub.
pub fn restore_default_handler(vector: u8) {
    // SAFETY: The default stub upholds the frame contract by construction.
    unsafe {
        set_raw_handler(vector, stub_address(vector));
    }
}
