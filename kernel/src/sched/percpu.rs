//! Per-CPU state.
//!
//! One [`Processor`] is allocated for every Local APIC the MADT reports,
//! keeping the structure multi-processor-ready, but only the bootstrap
//! processor is ever brought up; `current()` resolves to the BSP.

use alloc::vec::Vec;

use crate::{
    error::{KernelError, KernelResult},
    sched::manager::TaskManager,
    sync::OnceLock,
    timer::SystemTimer,
};

/// Per-CPU state block.
pub struct Processor {
    id: u32,
    apic_id: u8,
    tasks: TaskManager,
    timer: &'static dyn SystemTimer,
}

impl Processor {
    /// Logical processor index.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Firmware-reported APIC id.
    pub fn apic_id(&self) -> u8 {
        self.apic_id
    }

    /// This CPU's task ring.
    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// This CPU's tick source.
    pub fn timer(&self) -> &'static dyn SystemTimer {
        self.timer
    }

    /// Spin until `millis` milliseconds have passed, yielding between
    /// checks so other tasks keep running.
    pub fn spin_wait_millis(&self, millis: u64) {
        let deadline = self.timer.get_count_millis() + millis;
        while self.timer.get_count_millis() < deadline {
            super::dispatcher::yield_now();
        }
    }
}

/// All detected processors; index 0 is the BSP.
static PROCESSORS: OnceLock<Vec<Processor>> = OnceLock::new();

/// Build the processor table from the MADT. Storage is allocated for every
/// reported Local APIC even though only the BSP runs.
pub fn init(madt: &crate::acpi::MadtInfo, timer: &'static dyn SystemTimer) -> KernelResult<()> {
    let mut table = Vec::new();
    for (index, lapic) in madt.lapics.iter().filter(|l| l.enabled).enumerate() {
        table.push(Processor {
            id: index as u32,
            apic_id: lapic.apic_id,
            tasks: TaskManager::new(),
            timer,
        });
    }
    if table.is_empty() {
        // Firmware reported nothing usable; the CPU we run on still
        // exists.
        table.push(Processor {
            id: 0,
            apic_id: 0,
            tasks: TaskManager::new(),
            timer,
        });
    }
    let count = table.len();
    PROCESSORS.set(table).map_err(|_| KernelError::AlreadyExists {
        resource: "processor table",
    })?;
    log::info!(
        target: "sched",
        "{} processor(s) detected, bootstrap processor online",
        count
    );
    Ok(())
}

/// The running CPU's state block (BSP-only bring-up).
pub fn current() -> &'static Processor {
    &PROCESSORS
        .get()
        .expect("processor table initialized during bring-up")[0]
}

/// Whether the per-CPU table exists yet.
pub fn is_initialized() -> bool {
    PROCESSORS.get().is_some()
}
