//! Kernel binary entry.
//!
//! The UEFI loader drops the machine into long mode with the kernel image
//! mapped high, the recursive PML4 slot installed, and the loader-data
//! page populated, then jumps here. Bring-up order follows the dependency
//! chain: serial/logging → memory → ACPI → interrupt fabric → timer →
//! per-CPU state → scheduler → first kernel task (PCI scan) → idle.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    use cinder_kernel::{
        acpi, boot, interrupts, kprintln, logger, mm, panic, pci, sched, serial,
        timer::{pit::PIT, SystemTimer},
        KernelResult,
    };

    /// Loader-to-kernel entry point.
    #[no_mangle]
    pub extern "C" fn kernel_entry() -> ! {
        serial::init();
        logger::init(log::LevelFilter::Info);
        kprintln!("Cinder v{}", env!("CARGO_PKG_VERSION"));

        if let Err(e) = bring_up() {
            panic::shutdown(format_args!("bring-up failed: {}", e));
        }

        // The boot flow becomes the idle task; everything else happens in
        // kernel tasks and ISRs. The shell reads `/Devices/keyboard`
        // through the VFS layered above this core.
        kprintln!("> ");
        loop {
            x86_64::instructions::hlt();
        }
    }

    fn bring_up() -> KernelResult<()> {
        // SAFETY: The loader populated the block before jumping here.
        let loader = unsafe { boot::LoaderInfo::from_fixed_address() };
        boot::publish(loader);
        let loader = boot::loader_info().expect("just published");

        // Refine the physical-address filter from CPUID.
        // SAFETY: CPUID leaf 0x8000_0008 exists on every long-mode CPU.
        let phys_bits = unsafe { core::arch::x86_64::__cpuid(0x8000_0008).eax as u8 };
        mm::frame_allocator::set_max_physical_address_bits(phys_bits);

        // SAFETY: Single bring-up call on the BSP.
        unsafe {
            mm::init(loader)?;
        }

        // SAFETY: RSDP pointer comes from the loader-data block.
        let madt = unsafe { acpi::load_madt(loader.acpi_rsdp())? };

        // SAFETY: Single bring-up call with interrupts disabled.
        unsafe {
            interrupts::init(&madt)?;
        }

        sched::percpu::init(&madt, &PIT)?;
        PIT.initialize()?;

        // Admit the running boot flow as the first task so the ring is
        // never empty; its context fields are placeholders overwritten at
        // the first switch away from it.
        let boot_context = cinder_kernel::TaskContext {
            cr3: mm::pager::current_cr3(),
            ip: kernel_entry as usize as u64,
            sp: mm::layout::KERNEL_STACK.end(),
        };
        sched::percpu::current().tasks().add_task(boot_context, false)?;

        // The PCI scan (and through it every xHCI controller) runs as the
        // first spawned kernel task.
        // SAFETY: Memory and scheduling are live; the task owns its space.
        unsafe {
            sched::spawn_kernel_task(pci_scan_task, loader.pcie_ecam0(), true)?;
        }

        // SAFETY: Per-CPU table and timer are initialized above.
        unsafe {
            sched::dispatcher::initialize()?;
        }
        Ok(())
    }

    /// First kernel task: walk the PCI bus and hand controllers to their
    /// drivers, then park forever.
    extern "C" fn pci_scan_task(ecam_base: u64) -> ! {
        // SAFETY: The ECAM base comes from the loader's MCFG extraction;
        // this task runs once.
        if let Err(e) = unsafe { pci::scan(ecam_base) } {
            log::error!(target: "pci", "bus scan failed: {}", e);
        }
        loop {
            let id = sched::current_task_id();
            let _ = sched::block_task(id);
            sched::yield_now();
        }
    }

    /// Panic plumbing: Rust panics funnel into the fatal path.
    #[panic_handler]
    fn rust_panic(info: &core::panic::PanicInfo) -> ! {
        panic::halt(format_args!("{}", info))
    }
}

/// The kernel only runs bare-metal; the host build exists for the test
/// harness.
#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("cinder-kernel is a bare-metal image; run the test suite instead");
}
