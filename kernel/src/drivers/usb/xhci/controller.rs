//! xHCI host controller core.
//!
//! Bring-up follows the architectural sequence: reset and wait for
//! controller-ready, size the slot table, program the DCBAA, command ring,
//! and event ring, hand out scratchpad pages if demanded, arm the primary
//! interrupter over MSI, then start the controller and spawn the
//! port-update task. The ISR is the only event-ring consumer; command
//! completions land in an atomic slot the command sender polls.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use spin::Mutex;

use crate::{
    drivers::usb::PortSpeed,
    error::{KernelError, KernelResult},
    interrupts::{self, InterruptProvider},
    mm::{frame_allocator::FRAME_ALLOCATOR, io_heap, layout::PAGE_SIZE, page_table::PteFlags, pager},
    pci, sched,
    timer::SystemTimer,
};

use super::{
    device::{Device, DeviceInformation},
    regs::{PortSc, Registers, SupportedProtocol, UsbCmd, UsbSts, XCAP_SUPPORTED_PROTOCOL},
    ring::{EventRing, ProducerRing},
    trb::{CompletionCode, Trb, TrbType},
};

/// Host-reset deadline.
const RESET_TIMEOUT_MS: u64 = 1000;

/// Command-completion deadline.
const COMMAND_TIMEOUT_MS: u64 = 200;

/// Port-power settle time after Run/Stop.
const PORT_POWER_SETTLE_MS: u64 = 200;

/// Completion slot shared between the command sender and the ISR.
struct CommandCompletionSlot {
    /// The event's status word; non-zero once the ISR stored the event.
    status: AtomicU32,
    /// Remaining event words, published before `status`.
    words: [AtomicU32; 3],
}

impl CommandCompletionSlot {
    const fn new() -> Self {
        Self {
            status: AtomicU32::new(0),
            words: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    fn reset(&self) {
        self.status.store(0, Ordering::SeqCst);
    }

    /// ISR side: copy the CommandCompletion event, status word last with
    /// sequentially consistent ordering.
    fn publish(&self, event: &Trb) {
        self.words[0].store(event.words[0], Ordering::SeqCst);
        self.words[1].store(event.words[1], Ordering::SeqCst);
        self.words[2].store(event.words[3], Ordering::SeqCst);
        self.status.store(event.words[2], Ordering::SeqCst);
    }

    /// Sender side: the completion, once `status` reads non-zero.
    fn take(&self) -> Option<Trb> {
        let status = self.status.load(Ordering::SeqCst);
        if status == 0 {
            return None;
        }
        // The acquire-equivalent load above orders these plain reads.
        Some(Trb {
            words: [
                self.words[0].load(Ordering::Relaxed),
                self.words[1].load(Ordering::Relaxed),
                status,
                self.words[2].load(Ordering::Relaxed),
            ],
        })
    }
}

/// Per-root-hub-port tracking.
struct PortState {
    /// Set by the ISR on a Port Status Change event.
    dirty: AtomicBool,
    /// Slot bound to the port (0 = none).
    slot: AtomicU8,
}

/// Scratchpad memory handed to the controller.
struct Scratchpad {
    array: io_heap::DmaBuffer,
    frames: Vec<u64>,
}

/// One xHCI controller instance.
pub struct Controller {
    cfg: pci::ConfigSpace,
    regs: Registers,
    max_slots: u8,
    max_ports: u8,
    context_64: bool,

    dcbaa: io_heap::DmaBuffer,
    command_ring: Mutex<ProducerRing>,
    completion: CommandCompletionSlot,
    event_ring: Mutex<EventRing>,
    scratchpad: Option<Scratchpad>,
    protocols: Vec<SupportedProtocol>,

    ports: Vec<PortState>,
    port_task_id: AtomicU64,
    vector: AtomicU8,

    /// Device arena indexed by slot id; devices hold only a non-owning
    /// back-reference to the controller.
    devices: Mutex<Vec<Option<Arc<Device>>>>,
}

// SAFETY: MMIO handles are plain addresses; all mutable state is behind
// locks or atomics.
unsafe impl Send for Controller {}
// SAFETY: See above.
unsafe impl Sync for Controller {}

impl Controller {
    /// Whether the controller demands 64-byte contexts.
    pub fn context_size_64(&self) -> bool {
        self.context_64
    }

    /// Ring a device endpoint doorbell.
    pub fn ring_device_doorbell(&self, slot_id: u8, dci: u8) {
        self.regs.db.ring(slot_id, dci);
    }

    /// Bring up the controller at the given PCI address. On any failure
    /// the function releases everything it acquired and disables the PCI
    /// function.
    ///
    /// # Safety
    ///
    /// Runs in the PCI-scan kernel task after interrupts, timer, and
    /// memory are live; at most once per function.
    pub unsafe fn initialize(bus: u8, device: u8, function: u8) -> KernelResult<()> {
        let ecam = pci::ecam().ok_or(KernelError::NotInitialized { subsystem: "ECAM" })?;
        let cfg = ecam.function(bus, device, function);

        let bar0 = cfg.bar(0);
        cfg.enable();
        // SAFETY: BAR0 decodes the controller's register file.
        let mmio = unsafe { bar0.map_mmio() }.inspect_err(|_| cfg.disable())?;
        // SAFETY: Just mapped uncached over the full BAR.
        let regs = unsafe { Registers::from_mmio(mmio) };

        match unsafe { Self::bring_up(cfg, regs) } {
            Ok(()) => Ok(()),
            Err(e) => {
                // Abandon the controller: quiesce and power it down.
                regs.op.set_usbcmd(UsbCmd::empty());
                cfg.disable();
                Err(e)
            }
        }
    }

    /// The fallible part of bring-up; resources acquired here release
    /// through drop glue on error.
    ///
    /// # Safety
    ///
    /// As [`Self::initialize`].
    unsafe fn bring_up(cfg: pci::ConfigSpace, regs: Registers) -> KernelResult<()> {
        // 1. Reset and wait for controller-ready.
        Self::reset_host(&regs)?;

        let max_slots = regs.cap.max_slots();
        let max_ports = regs.cap.max_ports();
        let context_64 = regs.cap.context_size_64();
        log::info!(
            target: "usb",
            "xHCI {:02x}:{:02x}.{}: version {:x}, {} slots, {} ports, {} contexts",
            cfg.bus,
            cfg.device,
            cfg.function,
            regs.cap.hci_version(),
            max_slots,
            max_ports,
            if context_64 { 64 } else { 32 }
        );

        // 2. Enable every slot the hardware has.
        regs.op.set_max_slots_enabled(max_slots);

        // 3. Device Context Base Address Array.
        let dcbaa_bytes = (max_slots as usize + 1) * 8;
        let dcbaa = io_heap::DmaBuffer::pages(dcbaa_bytes.div_ceil(PAGE_SIZE))?;
        regs.op.set_dcbaap(dcbaa.phys());

        // 4. Command ring, software cycle starting at 1.
        let command_ring = ProducerRing::allocate()?;
        regs.op.set_crcr(command_ring.physical_base() | 1);

        // 5. Event ring: single segment plus its trailing ERST.
        let event_ring = EventRing::allocate()?;
        regs.rt.set_erstsz(0, 1);
        regs.rt.set_erdp(0, event_ring.physical_base());
        regs.rt.set_erstba(0, event_ring.erst_physical());

        // 6. Scratchpad pages, when demanded.
        let scratchpad = Self::allocate_scratchpad(&regs, &dcbaa)?;

        // 7. Port protocol map from the extended capabilities.
        let protocols: Vec<SupportedProtocol> = regs
            .extended_capabilities()
            .filter(|c| c.id == XCAP_SUPPORTED_PROTOCOL)
            .map(|c| SupportedProtocol::decode(&c))
            .collect();

        let mut ports = Vec::with_capacity(max_ports as usize);
        for _ in 0..max_ports {
            ports.push(PortState {
                dirty: AtomicBool::new(true),
                slot: AtomicU8::new(0),
            });
        }

        let mut devices = Vec::with_capacity(max_slots as usize + 1);
        devices.resize_with(max_slots as usize + 1, || None);

        let controller: &'static Controller =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(Controller {
                cfg,
                regs,
                max_slots,
                max_ports,
                context_64,
                dcbaa,
                command_ring: Mutex::new(command_ring),
                completion: CommandCompletionSlot::new(),
                event_ring: Mutex::new(event_ring),
                scratchpad,
                protocols,
                ports,
                port_task_id: AtomicU64::new(0),
                vector: AtomicU8::new(0),
                devices: Mutex::new(devices),
            }));

        // 8. Primary interrupter + MSI.
        let vector = interrupts::reserve_interrupt().ok_or(KernelError::OutOfMemory {
            requested: 1,
        })?;
        controller.vector.store(vector, Ordering::Relaxed);
        interrupts::register_provider(vector, controller)?;
        let msi = pci::msi::get_msi(cfg).ok_or(KernelError::DeviceError {
            device: "xHCI MSI capability",
            code: 0,
        })?;
        msi.configure(vector, 1)?;
        // IMAN: enable + acknowledge any stale pending; IMODI keeps its
        // reset default of 4000 (≈1 ms coalescing).
        controller.regs.rt.set_iman(0, 0b11);
        log::debug!(
            target: "usb",
            "xHCI interrupter: vector {:#x}, IMODI {}",
            vector,
            controller.regs.rt.imod(0)
        );

        // 9. Run, enable interrupts, let port power settle, then hand the
        // ports to their task.
        controller
            .regs
            .op
            .set_usbcmd(UsbCmd::RUN_STOP | UsbCmd::INTERRUPTER_EN);
        sched::percpu::current().spin_wait_millis(PORT_POWER_SETTLE_MS);

        // SAFETY: Memory and scheduler are live per the caller's contract.
        let task_id = unsafe {
            sched::spawn_kernel_task(port_update_task, controller as *const Controller as u64, true)?
        };
        controller.port_task_id.store(task_id, Ordering::Relaxed);
        log::info!(target: "usb", "xHCI ready; port task {}", task_id);
        Ok(())
    }

    /// HCRST followed by a bounded CNR poll.
    fn reset_host(regs: &Registers) -> KernelResult<()> {
        // Stop the controller before resetting it.
        regs.op.set_usbcmd(UsbCmd::empty());
        let timer = sched::percpu::current().timer();
        let halt_deadline = timer.get_count_millis() + 50;
        while !regs.op.usbsts().contains(UsbSts::HC_HALTED) {
            if timer.get_count_millis() > halt_deadline {
                break;
            }
            core::hint::spin_loop();
        }

        regs.op.set_usbcmd(UsbCmd::HOST_RESET);
        let deadline = timer.get_count_millis() + RESET_TIMEOUT_MS;
        loop {
            let cmd_clear = !regs.op.usbcmd().contains(UsbCmd::HOST_RESET);
            let ready = !regs.op.usbsts().contains(UsbSts::NOT_READY);
            if cmd_clear && ready {
                return Ok(());
            }
            if timer.get_count_millis() > deadline {
                return Err(KernelError::Timeout {
                    operation: "xHCI host reset",
                    duration_ms: RESET_TIMEOUT_MS,
                });
            }
            core::hint::spin_loop();
        }
    }

    /// Scratchpad array in DCBAA slot 0, one 4 KiB frame per advertised
    /// buffer, each zeroed through a transient uncached window.
    fn allocate_scratchpad(
        regs: &Registers,
        dcbaa: &io_heap::DmaBuffer,
    ) -> KernelResult<Option<Scratchpad>> {
        let count = regs.cap.max_scratchpad_buffers();
        if count == 0 {
            return Ok(None);
        }
        let array_bytes = count as usize * 8;
        let array = io_heap::DmaBuffer::pages(array_bytes.div_ceil(PAGE_SIZE))?;

        let mut frames = Vec::with_capacity(count as usize);
        for index in 0..count {
            let frame = FRAME_ALLOCATOR
                .lock()
                .allocate()
                .ok_or(KernelError::OutOfMemory {
                    requested: PAGE_SIZE,
                })?;
            // SAFETY: Fresh frame; transient uncached window for zeroing.
            unsafe {
                let window = pager::map_general(
                    frame,
                    1,
                    PteFlags::WRITABLE | PteFlags::NO_CACHE | PteFlags::NO_EXECUTE,
                )?;
                core::ptr::write_bytes(window as *mut u8, 0, PAGE_SIZE);
                pager::unmap_general(window, 1);
            }
            // SAFETY: The array buffer holds `count` u64 slots.
            unsafe {
                (array.virt() as *mut u64).add(index as usize).write_volatile(frame);
            }
            frames.push(frame);
        }

        // SAFETY: DCBAA slot 0 is reserved for the scratchpad array.
        unsafe {
            (dcbaa.virt() as *mut u64).write_volatile(array.phys());
        }
        log::debug!(target: "usb", "scratchpad: {} page(s)", count);
        Ok(Some(Scratchpad { array, frames }))
    }

    // -----------------------------------------------------------------
    // Command ring protocol
    // -----------------------------------------------------------------

    /// Submit one command and wait for its completion event.
    ///
    /// Callers serialize through the command lock; the completion slot is
    /// zeroed before the doorbell rings and filled by the ISR. `None` on
    /// timeout — the lock is released and the ring stays usable for the
    /// next command.
    pub fn send_command(&self, trb: Trb) -> Option<Trb> {
        let mut ring = self.command_ring.lock();
        self.completion.reset();
        let submitted = ring.push(trb);
        self.regs.db.ring(0, 0);

        let timer = sched::percpu::current().timer();
        let deadline = timer.get_count_millis() + COMMAND_TIMEOUT_MS;
        loop {
            if let Some(event) = self.completion.take() {
                if event.pointer() == submitted {
                    return Some(event);
                }
                // A stale completion (e.g. from a timed-out predecessor):
                // drop it and keep waiting for ours.
                self.completion.reset();
            }
            if timer.get_count_millis() > deadline {
                log::warn!(
                    target: "usb",
                    "command {:?} timed out after {} ms",
                    trb.trb_type(),
                    COMMAND_TIMEOUT_MS
                );
                return None;
            }
            if sched::percpu::is_initialized() {
                sched::yield_now();
            } else {
                core::hint::spin_loop();
            }
        }
    }

    /// Enable Slot: returns the assigned slot id.
    pub fn enable_slot(&self, slot_type: u8) -> KernelResult<u8> {
        let completion = self
            .send_command(Trb::enable_slot(slot_type))
            .ok_or(KernelError::Timeout {
                operation: "Enable Slot",
                duration_ms: COMMAND_TIMEOUT_MS,
            })?;
        if completion.completion_code() != CompletionCode::Success {
            return Err(KernelError::DeviceError {
                device: "Enable Slot",
                code: completion.completion_code() as u32,
            });
        }
        let slot = completion.slot_id();
        if slot == 0 || slot > self.max_slots {
            return Err(KernelError::DeviceError {
                device: "Enable Slot",
                code: slot as u32,
            });
        }
        Ok(slot)
    }

    /// Disable Slot (best effort; the device is going away regardless).
    pub fn disable_slot(&self, slot_id: u8) {
        let _ = self.send_command(Trb::disable_slot(slot_id));
        // SAFETY: Slot entries are u64 slots inside the DCBAA buffer.
        unsafe {
            (self.dcbaa.virt() as *mut u64)
                .add(slot_id as usize)
                .write_volatile(0);
        }
    }

    // -----------------------------------------------------------------
    // Port lifecycle
    // -----------------------------------------------------------------

    /// Protocol covering a root-hub port.
    fn protocol_for_port(&self, port: u8) -> Option<&SupportedProtocol> {
        self.protocols.iter().find(|p| p.covers_port(port))
    }

    /// Walk every port flagged dirty and run its state machine.
    fn update_ports(&'static self) {
        for port in 1..=self.max_ports {
            let state = &self.ports[port as usize - 1];
            if !state.dirty.swap(false, Ordering::AcqRel) {
                continue;
            }
            if let Err(e) = self.process_port(port) {
                log::debug!(target: "usb", "port {}: {}", port, e);
            }
        }
    }

    fn process_port(&'static self, port: u8) -> KernelResult<()> {
        let sc = self.regs.op.portsc(port);
        let state = &self.ports[port as usize - 1];

        if !sc.contains(PortSc::PP) {
            log::debug!(target: "usb", "port {}: unpowered", port);
            return Ok(());
        }

        if !sc.contains(PortSc::CCS) {
            // Disconnect: tear down whatever was bound to the port.
            let slot = state.slot.swap(0, Ordering::AcqRel);
            if slot != 0 {
                let device = interrupts::without_interrupts(|| {
                    self.devices.lock()[slot as usize].take()
                });
                if let Some(device) = device {
                    device.destroy();
                }
                self.disable_slot(slot);
            }
            // Acknowledge the connect change.
            self.regs
                .op
                .set_portsc(port, sc.preserve_rw1c() | PortSc::CSC);
            return Ok(());
        }

        let protocol = self.protocol_for_port(port);
        let usb2 = protocol.map(|p| p.major_revision == 2).unwrap_or(true);

        if usb2 && !sc.contains(PortSc::PED) {
            if sc.contains(PortSc::PRC) {
                // Reset finished; acknowledge and fall through on the next
                // status read.
                self.regs
                    .op
                    .set_portsc(port, sc.preserve_rw1c() | PortSc::PRC | PortSc::CSC);
            } else {
                // Kick off the reset; PRC arrives via a later event.
                log::debug!(target: "usb", "port {}: starting reset", port);
                self.regs
                    .op
                    .set_portsc(port, sc.preserve_rw1c() | PortSc::PR);
                return Ok(());
            }
        } else if !usb2 {
            // USB 3 ports train on their own: wait for both enabled and
            // connect-change before proceeding.
            if !(sc.contains(PortSc::PED) && sc.contains(PortSc::CSC)) {
                return Ok(());
            }
            self.regs
                .op
                .set_portsc(port, sc.preserve_rw1c() | PortSc::CSC);
        }

        let sc = self.regs.op.portsc(port);
        if !sc.contains(PortSc::PED) || state.slot.load(Ordering::Acquire) != 0 {
            return Ok(());
        }

        // Reset complete: take a slot and enumerate.
        let slot_type = protocol.map(|p| p.slot_type).unwrap_or(0);
        let slot = self.enable_slot(slot_type)?;
        log::debug!(target: "usb", "port {}: slot {} enabled", port, slot);

        let speed = PortSpeed::from_speed_id(sc.speed_id());
        let device = Arc::new(Device::new(
            self,
            DeviceInformation {
                route_string: 0,
                root_hub_port: port,
                slot_id: slot,
                speed,
            },
        )?);

        // Bind the output context before any command references the slot.
        // SAFETY: Slot entries are u64 slots inside the DCBAA buffer.
        unsafe {
            (self.dcbaa.virt() as *mut u64)
                .add(slot as usize)
                .write_volatile(device.output_context_physical());
        }
        interrupts::without_interrupts(|| {
            self.devices.lock()[slot as usize] = Some(device.clone());
        });
        state.slot.store(slot, Ordering::Release);

        if let Err(e) = device.initialize() {
            // A failed device leaves the slot disabled; the controller
            // continues serving the other ports.
            log::debug!(target: "usb", "port {}: initialization failed: {}", port, e);
            device.destroy();
            interrupts::without_interrupts(|| {
                self.devices.lock()[slot as usize] = None;
            });
            state.slot.store(0, Ordering::Release);
            self.disable_slot(slot);
            return Err(e);
        }
        Ok(())
    }
}

impl InterruptProvider for Controller {
    /// Event-ring consumer. Acknowledges EINT, drains every event whose
    /// cycle matches, and rewrites ERDP (with EHB) after consumption.
    fn handle_irq(&self, _stack: *mut u8, _error_code: u64) {
        self.regs.op.ack_status(UsbSts::EVENT_INTERRUPT);
        self.regs.rt.set_iman(0, 0b11);

        let mut unblock_ports = false;
        let mut events = self.event_ring.lock();
        while let Some(event) = events.pop() {
            match event.trb_type() {
                TrbType::CommandCompletion => self.completion.publish(&event),
                TrbType::PortStatusChange => {
                    let port = event.port_id();
                    if (1..=self.max_ports).contains(&port) {
                        self.ports[port as usize - 1]
                            .dirty
                            .store(true, Ordering::Release);
                        unblock_ports = true;
                    }
                }
                TrbType::TransferEvent => {
                    let slot = event.slot_id() as usize;
                    let device = {
                        let devices = self.devices.lock();
                        devices.get(slot).and_then(|d| d.clone())
                    };
                    match device {
                        Some(device) => device.signal_transfer_complete(&event),
                        None => log::trace!(
                            target: "usb",
                            "transfer event for empty slot {}",
                            slot
                        ),
                    }
                }
                other => {
                    log::trace!(target: "usb", "event {:?} ignored", other);
                }
            }
        }
        self.regs.rt.set_erdp(0, events.dequeue_pointer());
        drop(events);

        if unblock_ports {
            let task = self.port_task_id.load(Ordering::Relaxed);
            if task != 0 {
                let _ = sched::unblock_task(task);
            }
        }
        crate::interrupts::apic::send_eoi();
    }
}

/// The per-controller port-update kernel task: process dirty ports, then
/// block until the ISR flags more work.
extern "C" fn port_update_task(controller_ptr: u64) -> ! {
    // SAFETY: The spawner passes a leaked &'static Controller.
    let controller = unsafe { &*(controller_ptr as *const Controller) };
    loop {
        controller.update_ports();
        let id = sched::current_task_id();
        let _ = sched::block_task(id);
        sched::yield_now();
    }
}

// Keep the PCI handle alive in the struct for teardown paths even though
// steady-state operation only touches MMIO.
impl Controller {
    /// PCI location (diagnostics).
    pub fn pci_location(&self) -> (u8, u8, u8) {
        (self.cfg.bus, self.cfg.device, self.cfg.function)
    }

    /// Scratchpad pages currently lent to the controller.
    pub fn scratchpad_pages(&self) -> usize {
        self.scratchpad
            .as_ref()
            .map(|s| {
                debug_assert!(s.array.len() >= s.frames.len() * 8);
                s.frames.len()
            })
            .unwrap_or(0)
    }
}
