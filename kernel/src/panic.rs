//! Fatal-error paths.
//!
//! Panic is one-way control flow: no unwinding is assumed anywhere in the
//! kernel. [`halt`] dumps a register snapshot and parks the CPU with
//! interrupts off; [`shutdown`] prints the reason and asks the EFI runtime
//! for a platform shutdown after a short wall-clock grace period (falling
//! back to a fixed busy-wait when the time service misbehaves).

use core::fmt;

/// Snapshot of the architectural state at the moment of a fatal error.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegisterSnapshot {
    pub gprs: [u64; 16],
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub gdtr_base: u64,
    pub gdtr_limit: u16,
    pub idtr_base: u64,
    pub idtr_limit: u16,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub dr: [u64; 6],
}

const GPR_NAMES: [&str; 16] = [
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

impl RegisterSnapshot {
    /// Capture the current CPU state.
    ///
    /// Must run in ring 0; only used on the panic path.
    #[cfg(target_os = "none")]
    pub fn capture() -> Self {
        use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
        use x86_64::instructions::tables::{sgdt, sidt};
        use x86_64::registers::control::{Cr0, Cr2, Cr3, Cr4};
        use x86_64::registers::model_specific::Msr;

        let mut snapshot = Self::default();
        // SAFETY: Plain register moves with no side effects.
        unsafe {
            core::arch::asm!(
                "mov {0}, rax", "mov {1}, rbx", "mov {2}, rcx", "mov {3}, rdx",
                out(reg) snapshot.gprs[0], out(reg) snapshot.gprs[1],
                out(reg) snapshot.gprs[2], out(reg) snapshot.gprs[3],
                options(nomem, nostack, preserves_flags)
            );
            core::arch::asm!(
                "mov {0}, rsi", "mov {1}, rdi", "mov {2}, rbp", "mov {3}, rsp",
                out(reg) snapshot.gprs[4], out(reg) snapshot.gprs[5],
                out(reg) snapshot.gprs[6], out(reg) snapshot.gprs[7],
                options(nomem, nostack, preserves_flags)
            );
            core::arch::asm!(
                "mov {0}, r8", "mov {1}, r9", "mov {2}, r10", "mov {3}, r11",
                out(reg) snapshot.gprs[8], out(reg) snapshot.gprs[9],
                out(reg) snapshot.gprs[10], out(reg) snapshot.gprs[11],
                options(nomem, nostack, preserves_flags)
            );
            core::arch::asm!(
                "mov {0}, r12", "mov {1}, r13", "mov {2}, r14", "mov {3}, r15",
                out(reg) snapshot.gprs[12], out(reg) snapshot.gprs[13],
                out(reg) snapshot.gprs[14], out(reg) snapshot.gprs[15],
                options(nomem, nostack, preserves_flags)
            );
            // Debug registers: DR0-3 plus status/control.
            core::arch::asm!(
                "mov {0}, dr0", "mov {1}, dr1", "mov {2}, dr2", "mov {3}, dr3",
                out(reg) snapshot.dr[0], out(reg) snapshot.dr[1],
                out(reg) snapshot.dr[2], out(reg) snapshot.dr[3],
                options(nomem, nostack)
            );
            core::arch::asm!(
                "mov {0}, dr6", "mov {1}, dr7",
                out(reg) snapshot.dr[4], out(reg) snapshot.dr[5],
                options(nomem, nostack)
            );
            core::arch::asm!("mov {0}, cr8", out(reg) snapshot.cr8, options(nomem, nostack));
            snapshot.efer = Msr::new(0xC000_0080).read();
        }
        snapshot.cs = CS::get_reg().0;
        snapshot.ss = SS::get_reg().0;
        snapshot.ds = DS::get_reg().0;
        snapshot.es = ES::get_reg().0;
        let gdtr = sgdt();
        snapshot.gdtr_base = gdtr.base.as_u64();
        snapshot.gdtr_limit = gdtr.limit;
        let idtr = sidt();
        snapshot.idtr_base = idtr.base.as_u64();
        snapshot.idtr_limit = idtr.limit;
        snapshot.cr0 = Cr0::read_raw();
        snapshot.cr2 = Cr2::read_raw();
        snapshot.cr3 = {
            let (frame, flags) = Cr3::read_raw();
            frame.start_address().as_u64() | flags as u64
        };
        snapshot.cr4 = Cr4::read_raw();
        snapshot
    }
}

impl fmt::Display for RegisterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (chunk, names) in self.gprs.chunks(4).zip(GPR_NAMES.chunks(4)) {
            for (value, name) in chunk.iter().zip(names) {
                write!(f, "{:>3}={:016x} ", name, value)?;
            }
            writeln!(f)?;
        }
        writeln!(
            f,
            "cs={:04x} ss={:04x} ds={:04x} es={:04x}",
            self.cs, self.ss, self.ds, self.es
        )?;
        writeln!(
            f,
            "gdtr={:016x}/{:04x} idtr={:016x}/{:04x}",
            self.gdtr_base, self.gdtr_limit, self.idtr_base, self.idtr_limit
        )?;
        writeln!(
            f,
            "cr0={:016x} cr2={:016x} cr3={:016x}",
            self.cr0, self.cr2, self.cr3
        )?;
        writeln!(
            f,
            "cr4={:016x} cr8={:016x} efer={:016x}",
            self.cr4, self.cr8, self.efer
        )?;
        writeln!(
            f,
            "dr0={:016x} dr1={:016x} dr2={:016x}",
            self.dr[0], self.dr[1], self.dr[2]
        )?;
        write!(
            f,
            "dr3={:016x} dr6={:016x} dr7={:016x}",
            self.dr[3], self.dr[4], self.dr[5]
        )
    }
}

/// Fatal stop: dump the register snapshot and park with interrupts off.
#[cfg(target_os = "none")]
pub fn halt(reason: fmt::Arguments) -> ! {
    x86_64::instructions::interrupts::disable();
    crate::kprintln!("\n*** KERNEL PANIC: {} ***", reason);
    crate::kprintln!("{}", RegisterSnapshot::capture());
    loop {
        x86_64::instructions::hlt();
    }
}

/// Host stand-in so shared code type-checks under the test harness.
#[cfg(not(target_os = "none"))]
pub fn halt(reason: fmt::Arguments) -> ! {
    panic!("kernel halt: {}", reason);
}

/// Fallback busy-wait iterations when the EFI time service fails.
const SHUTDOWN_FALLBACK_SPINS: u64 = 2_000_000_000;

/// Grace period before the platform powers off.
const SHUTDOWN_GRACE_SECONDS: u8 = 3;

/// Print the reason, wait a moment so it can be read, then ask the EFI
/// runtime to shut the platform down. Halts if no runtime services were
/// handed over.
#[cfg(target_os = "none")]
pub fn shutdown(reason: fmt::Arguments) -> ! {
    use crate::boot::efi::{EfiTime, ResetType};

    x86_64::instructions::interrupts::disable();
    crate::kprintln!("\n*** SHUTDOWN: {} ***", reason);

    let runtime = crate::boot::loader_info().map(|info| info.runtime_services());
    let Some(runtime) = runtime.filter(|p| !p.is_null()) else {
        halt(format_args!("shutdown without runtime services"));
    };

    // Wall-clock grace period via GetTime; a failing time service gets the
    // fixed busy-wait instead.
    let mut waited = false;
    let mut start = EfiTime::default();
    // SAFETY: The runtime-services table was remapped by the loader and
    // these are post-ExitBootServices-callable members.
    unsafe {
        if ((*runtime).get_time)(&mut start, core::ptr::null_mut()) == 0 {
            let target = (start.second as u32 + SHUTDOWN_GRACE_SECONDS as u32) % 60;
            let mut now = start;
            loop {
                if ((*runtime).get_time)(&mut now, core::ptr::null_mut()) != 0 {
                    break;
                }
                if now.second as u32 == target {
                    waited = true;
                    break;
                }
                core::hint::spin_loop();
            }
        }
    }
    if !waited {
        for _ in 0..SHUTDOWN_FALLBACK_SPINS {
            core::hint::spin_loop();
        }
    }

    // SAFETY: ResetSystem(Shutdown) is the documented way off the machine.
    unsafe { ((*runtime).reset_system)(ResetType::Shutdown, 0, 0, core::ptr::null()) }
}

/// Host stand-in.
#[cfg(not(target_os = "none"))]
pub fn shutdown(reason: fmt::Arguments) -> ! {
    panic!("kernel shutdown: {}", reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_formats_every_register_class() {
        let mut snapshot = RegisterSnapshot::default();
        snapshot.gprs[0] = 0xDEAD_BEEF;
        snapshot.cr2 = 0xFFFF_8000_0000_1000;
        snapshot.dr[5] = 0x400;
        let mut text = alloc::string::String::new();
        core::fmt::write(&mut text, format_args!("{}", snapshot)).unwrap();
        assert!(text.contains("rax=00000000deadbeef"));
        assert!(text.contains("cr2=ffff800000001000"));
        assert!(text.contains("dr7=0000000000000400"));
        assert!(text.contains("gdtr="));
    }
}
