//! Attached USB devices.
//!
//! A `Device` is created when a root-hub port finishes reset and a slot is
//! enabled for it. Enumeration runs over the default control endpoint:
//! two Address Device commands (the legacy blocked attempt first), the
//! 18-byte device descriptor, every configuration in two passes, then
//! activation of the first configuration a class driver claims. Teardown
//! follows the drain pattern: mark unavailable, wait for the busy count to
//! reach zero, release.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::{
    drivers::usb::{
        class, descriptors,
        descriptors::{Configuration, DeviceDescriptor, Endpoint, EndpointType},
        request, request_type, PortSpeed, UsbDriver,
    },
    error::{KernelError, KernelResult},
    mm::io_heap,
    sched,
    timer::SystemTimer,
};

use super::{
    context::{endpoint_dci, ContextWrapper, EndpointContextType},
    ring::ProducerRing,
    trb::{CompletionCode, Trb},
    Controller,
};

/// Deadline for one control or interrupt transfer.
const TRANSFER_TIMEOUT_MS: u64 = 1000;

/// Endpoint rings a device can carry besides EP0 (DCIs 2..=31).
const ENDPOINT_RING_SLOTS: usize = 30;

/// Identity of an attached device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInformation {
    /// 20-bit hub route string (0 for root-port devices).
    pub route_string: u32,
    /// Root-hub port the device hangs off (1-based).
    pub root_hub_port: u8,
    /// Controller-assigned slot.
    pub slot_id: u8,
    pub speed: PortSpeed,
}

/// Result slot for the transfer the device is currently awaiting.
struct TransferSlot {
    /// Device-visible address of the awaited TRB (0 = idle).
    awaiting: AtomicU64,
    /// Event status word; non-zero once the ISR delivered it.
    status: AtomicU32,
    /// The full event TRB, valid once `status` is non-zero.
    event: Mutex<Trb>,
}

impl TransferSlot {
    const fn new() -> Self {
        Self {
            awaiting: AtomicU64::new(0),
            status: AtomicU32::new(0),
            event: Mutex::new(Trb::zeroed()),
        }
    }
}

/// One attached USB device.
pub struct Device {
    controller: &'static Controller,
    info: DeviceInformation,
    contexts: ContextWrapper,
    control_ring: Mutex<ProducerRing>,
    endpoint_rings: [Mutex<Option<ProducerRing>>; ENDPOINT_RING_SLOTS],

    transfer_lock: Mutex<()>,
    transfer: TransferSlot,

    descriptor: Mutex<DeviceDescriptor>,
    configurations: Mutex<Vec<Configuration>>,
    /// Drivers are held as `Arc`s so the ISR and task sides can snapshot
    /// the list under a brief interrupt-free section and call hooks with
    /// no lock held.
    drivers: Mutex<Vec<Arc<dyn UsbDriver>>>,

    state_lock: Mutex<()>,
    unavailable: AtomicBool,
    busy_count: AtomicUsize,
}

impl Device {
    /// Build the device record for an enabled slot.
    pub fn new(controller: &'static Controller, info: DeviceInformation) -> KernelResult<Self> {
        let contexts = ContextWrapper::create(controller.context_size_64())?;
        let control_ring = ProducerRing::allocate()?;
        Ok(Self {
            controller,
            info,
            contexts,
            control_ring: Mutex::new(control_ring),
            endpoint_rings: [const { Mutex::new(None) }; ENDPOINT_RING_SLOTS],
            transfer_lock: Mutex::new(()),
            transfer: TransferSlot::new(),
            descriptor: Mutex::new(DeviceDescriptor::default()),
            configurations: Mutex::new(Vec::new()),
            drivers: Mutex::new(Vec::new()),
            state_lock: Mutex::new(()),
            unavailable: AtomicBool::new(false),
            busy_count: AtomicUsize::new(0),
        })
    }

    pub fn info(&self) -> &DeviceInformation {
        &self.info
    }

    /// Device-visible address of the output context (for the DCBAA).
    pub fn output_context_physical(&self) -> u64 {
        self.contexts.output_physical()
    }

    pub fn device_descriptor(&self) -> DeviceDescriptor {
        *self.descriptor.lock()
    }

    // -----------------------------------------------------------------
    // Busy/unavailable drain pattern
    // -----------------------------------------------------------------

    /// Open an access window; fails once teardown has begun.
    pub fn set_busy(&self) -> KernelResult<()> {
        let _guard = self.state_lock.lock();
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KernelError::Unavailable);
        }
        self.busy_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Close an access window.
    pub fn release_busy(&self) {
        self.busy_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Begin teardown: refuse new accesses, then wait (yielding) until the
    /// in-flight ones drain.
    pub fn set_unavailable(&self) {
        {
            let _guard = self.state_lock.lock();
            self.unavailable.store(true, Ordering::SeqCst);
        }
        while self.busy_count.load(Ordering::SeqCst) != 0 {
            sched::yield_now();
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------
    // Transfer plumbing
    // -----------------------------------------------------------------

    /// Ring the device's doorbell for `dci`.
    fn ring_doorbell(&self, dci: u8) {
        self.controller.ring_device_doorbell(self.info.slot_id, dci);
    }

    /// Snapshot the driver list without holding its lock past the copy.
    fn drivers_snapshot(&self) -> Vec<Arc<dyn UsbDriver>> {
        crate::interrupts::without_interrupts(|| self.drivers.lock().clone())
    }

    /// Route a transfer event: the device's own awaited TRB first, then
    /// any driver's. Called from the controller ISR.
    pub fn signal_transfer_complete(&self, event: &Trb) {
        let pointer = event.pointer();
        if pointer != 0 && pointer == self.transfer.awaiting.load(Ordering::SeqCst) {
            *self.transfer.event.lock() = *event;
            // Status word last: the waiting task's acquire of this store
            // fences the event copy above.
            self.transfer.status.store(event.words[2], Ordering::SeqCst);
            return;
        }
        for driver in self.drivers_snapshot() {
            if driver.awaiting_trb() == pointer {
                driver.handle_event(self, event);
                return;
            }
        }
        log::debug!(
            target: "usb",
            "slot {}: unmatched transfer event for {:#x}",
            self.info.slot_id,
            pointer
        );
    }

    /// Wait for the awaited transfer to complete, with the standard
    /// deadline.
    fn await_transfer(&self) -> KernelResult<Trb> {
        let timer = sched::percpu::current().timer();
        let deadline = timer.get_count_millis() + TRANSFER_TIMEOUT_MS;
        while self.transfer.status.load(Ordering::SeqCst) == 0 {
            if timer.get_count_millis() > deadline {
                self.transfer.awaiting.store(0, Ordering::SeqCst);
                return Err(KernelError::Timeout {
                    operation: "USB transfer",
                    duration_ms: TRANSFER_TIMEOUT_MS,
                });
            }
            sched::yield_now();
        }
        self.transfer.awaiting.store(0, Ordering::SeqCst);
        let event = *self.transfer.event.lock();
        if event.completion_code().is_ok() {
            Ok(event)
        } else {
            Err(KernelError::DeviceError {
                device: "USB transfer",
                code: event.completion_code() as u32,
            })
        }
    }

    /// Issue one control request on the default endpoint. `buffer` is a
    /// `(physical, length)` pair for the data stage.
    pub fn send_request(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        buffer: Option<(u64, u16)>,
    ) -> KernelResult<()> {
        self.set_busy()?;
        let result = self.send_request_inner(bm_request_type, b_request, w_value, w_index, buffer);
        self.release_busy();
        result
    }

    fn send_request_inner(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        buffer: Option<(u64, u16)>,
    ) -> KernelResult<()> {
        let _guard = self.transfer_lock.lock();
        let device_to_host = bm_request_type & 0x80 != 0;
        let w_length = buffer.map(|(_, len)| len).unwrap_or(0);

        let awaited = {
            let mut ring = self.control_ring.lock();
            ring.push(Trb::setup_stage(
                bm_request_type,
                b_request,
                w_value,
                w_index,
                w_length,
            ));
            if let Some((phys, len)) = buffer {
                ring.push(Trb::data_stage(phys, len, device_to_host));
            }
            // Status stage runs opposite the data direction (IN status
            // for OUT/no-data requests).
            let status_in = !device_to_host || w_length == 0;
            ring.push(Trb::status_stage(status_in))
        };

        self.transfer.status.store(0, Ordering::SeqCst);
        self.transfer.awaiting.store(awaited, Ordering::SeqCst);
        self.ring_doorbell(1);
        self.await_transfer().map(|_| ())
    }

    /// GET_DESCRIPTOR into a DMA buffer; returns the bytes read.
    fn get_descriptor(
        &self,
        recipient_interface: bool,
        descriptor_type: u8,
        index: u8,
        language_or_interface: u16,
        buffer: &io_heap::DmaBuffer,
        length: u16,
    ) -> KernelResult<()> {
        let bm = if recipient_interface {
            request_type::INTERFACE_IN
        } else {
            request_type::DEVICE_IN
        };
        self.send_request(
            bm,
            request::GET_DESCRIPTOR,
            (descriptor_type as u16) << 8 | index as u16,
            language_or_interface,
            Some((buffer.phys(), length)),
        )
    }

    // -----------------------------------------------------------------
    // Enumeration
    // -----------------------------------------------------------------

    /// Full enumeration: address the device, read its identity, pick and
    /// activate a configuration, bring up the matching class driver.
    pub fn initialize(&self) -> KernelResult<()> {
        self.address_device()?;
        self.fetch_device_descriptor()?;
        self.log_product_strings();
        self.fetch_configurations()?;
        self.activate_driver_configuration()?;
        self.post_initialization()
    }

    /// Two Address Device commands: the blocked (BSR=1) legacy attempt
    /// first, a retry without blocking if the hardware refuses it, and a
    /// final unblocked command to put SET_ADDRESS on the wire.
    fn address_device(&self) -> KernelResult<()> {
        let mps = self
            .info
            .speed
            .default_max_packet_size()
            .ok_or(KernelError::InvalidParameter { name: "speed" })?;

        self.contexts.reset_input();
        {
            let mut icc = self.contexts.input_control();
            icc.add(0);
            icc.add(1);
        }
        {
            let mut slot = self.contexts.input_slot();
            slot.set_route_string(self.info.route_string);
            slot.set_root_hub_port(self.info.root_hub_port);
            slot.set_speed(self.info.speed.speed_id());
            slot.set_context_entries(1);
        }
        {
            let ring = self.control_ring.lock();
            let mut ep0 = self.contexts.input_endpoint(1);
            ep0.set_endpoint_type(EndpointContextType::Control);
            ep0.set_max_packet_size(mps);
            ep0.set_error_count(3);
            ep0.set_tr_dequeue_pointer(ring.physical_base(), ring.cycle());
            ep0.set_average_trb_length(8);
        }

        let input = self.contexts.input_physical();
        let slot_id = self.info.slot_id;

        let blocked = self
            .controller
            .send_command(Trb::address_device(input, slot_id, true))
            .ok_or(KernelError::Timeout {
                operation: "Address Device (BSR)",
                duration_ms: 200,
            })?;
        if blocked.completion_code() != CompletionCode::Success {
            // Controllers that reject the blocked form take the direct
            // one; failure here is final.
            let retried = self
                .controller
                .send_command(Trb::address_device(input, slot_id, false))
                .ok_or(KernelError::Timeout {
                    operation: "Address Device",
                    duration_ms: 200,
                })?;
            if retried.completion_code() != CompletionCode::Success {
                return Err(KernelError::DeviceError {
                    device: "Address Device",
                    code: retried.completion_code() as u32,
                });
            }
        }

        let addressed = self
            .controller
            .send_command(Trb::address_device(input, slot_id, false))
            .ok_or(KernelError::Timeout {
                operation: "Address Device",
                duration_ms: 200,
            })?;
        if addressed.completion_code() != CompletionCode::Success {
            return Err(KernelError::DeviceError {
                device: "Address Device",
                code: addressed.completion_code() as u32,
            });
        }
        log::debug!(
            target: "usb",
            "slot {}: addressed (USB address {})",
            slot_id,
            self.contexts.output_slot().usb_device_address()
        );
        Ok(())
    }

    /// Read and validate the 18-byte device descriptor (8-byte-aligned
    /// buffer).
    fn fetch_device_descriptor(&self) -> KernelResult<()> {
        let buffer = io_heap::DmaBuffer::pages(1)?;
        self.get_descriptor(
            false,
            crate::drivers::usb::descriptor_type::DEVICE,
            0,
            0,
            &buffer,
            DeviceDescriptor::SIZE as u16,
        )?;
        // SAFETY: The DMA buffer is page-sized and the transfer wrote at
        // most DESCRIPTOR_SIZE bytes.
        let bytes = unsafe {
            core::slice::from_raw_parts(buffer.virt(), DeviceDescriptor::SIZE)
        };
        let descriptor = DeviceDescriptor::parse(bytes)?;
        log::info!(
            target: "usb",
            "slot {}: {:04x}:{:04x} class {:02x} ({} configuration(s))",
            self.info.slot_id,
            descriptor.vendor_id,
            descriptor.product_id,
            descriptor.device_class,
            descriptor.num_configurations
        );
        *self.descriptor.lock() = descriptor;
        Ok(())
    }

    /// Best-effort fetch of the manufacturer/product strings for the log.
    fn log_product_strings(&self) {
        let descriptor = self.device_descriptor();
        for (label, index) in [
            ("manufacturer", descriptor.manufacturer_index),
            ("product", descriptor.product_index),
        ] {
            if index == 0 {
                continue;
            }
            if let Ok(text) = self.get_string(index) {
                log::info!(target: "usb", "slot {}: {} \"{}\"", self.info.slot_id, label, text);
            }
        }
    }

    /// Fetch a UTF-16LE string descriptor and narrow it for logging.
    fn get_string(&self, index: u8) -> KernelResult<alloc::string::String> {
        let buffer = io_heap::DmaBuffer::pages(1)?;
        // Prefetch the 2-byte header for the real length.
        self.get_descriptor(
            false,
            crate::drivers::usb::descriptor_type::STRING,
            index,
            0x0409, // US English
            &buffer,
            2,
        )?;
        // SAFETY: Two header bytes were just transferred.
        let length = unsafe { *buffer.virt() } as u16;
        if length < 2 {
            return Err(KernelError::InvalidParameter { name: "string" });
        }
        self.get_descriptor(
            false,
            crate::drivers::usb::descriptor_type::STRING,
            index,
            0x0409,
            &buffer,
            length,
        )?;
        // SAFETY: `length` bytes were transferred into the page buffer.
        let units = unsafe {
            core::slice::from_raw_parts(buffer.virt().add(2) as *const u16, (length as usize - 2) / 2)
        };
        Ok(units
            .iter()
            .map(|&u| char::from_u32(u as u32).unwrap_or('?'))
            .collect())
    }

    /// Fetch every configuration in two passes: a 4-byte prefetch for
    /// `wTotalLength`, then the full parse.
    fn fetch_configurations(&self) -> KernelResult<()> {
        let count = self.device_descriptor().num_configurations;
        let buffer = io_heap::DmaBuffer::pages(4)?;
        let mut configurations = Vec::new();

        for index in 0..count {
            self.get_descriptor(
                false,
                crate::drivers::usb::descriptor_type::CONFIGURATION,
                index,
                0,
                &buffer,
                4,
            )?;
            // SAFETY: Four prefix bytes were transferred.
            let prefix = unsafe { core::slice::from_raw_parts(buffer.virt(), 4) };
            let total = descriptors::configuration_total_length(prefix)?;
            let total = (total as usize).min(buffer.len()) as u16;

            self.get_descriptor(
                false,
                crate::drivers::usb::descriptor_type::CONFIGURATION,
                index,
                0,
                &buffer,
                total,
            )?;
            // SAFETY: `total` bytes were transferred.
            let bytes = unsafe { core::slice::from_raw_parts(buffer.virt(), total as usize) };
            configurations.push(descriptors::parse_configuration(bytes)?);
        }

        *self.configurations.lock() = configurations;
        Ok(())
    }

    /// Activate the first configuration containing a function a driver
    /// claims (HID only, today), then program its endpoints.
    fn activate_driver_configuration(&self) -> KernelResult<()> {
        let configurations = self.configurations.lock().clone();
        let chosen = configurations
            .iter()
            .find(|c| c.find_function(class::HID).is_some())
            .ok_or(KernelError::NotFound {
                resource: "driver-supported configuration",
            })?;

        self.send_request(
            request_type::DEVICE_OUT,
            request::SET_CONFIGURATION,
            chosen.value as u16,
            0,
            None,
        )?;
        log::debug!(
            target: "usb",
            "slot {}: configuration {} active",
            self.info.slot_id,
            chosen.value
        );

        // Program every endpoint of every interface of every matching
        // function.
        for function in chosen.functions.iter().filter(|f| f.class == class::HID) {
            for interface in &function.interfaces {
                for endpoint in &interface.endpoints {
                    self.configure_endpoint(endpoint)?;
                }
            }
        }

        // Hand the matching function to its driver.
        let function = chosen
            .find_function(class::HID)
            .expect("checked above")
            .clone();
        let driver: Arc<dyn UsbDriver> =
            Arc::new(crate::drivers::usb::hid::HidDriver::probe(self, &function)?);
        crate::interrupts::without_interrupts(|| self.drivers.lock().push(driver));
        Ok(())
    }

    /// Allocate the endpoint's transfer ring and issue Configure Endpoint.
    fn configure_endpoint(&self, endpoint: &Endpoint) -> KernelResult<()> {
        let dci = endpoint_dci(endpoint.number, endpoint.device_to_host);
        let interval =
            convert_endpoint_interval(self.info.speed, endpoint.endpoint_type, endpoint.interval)?;

        let ring = ProducerRing::allocate()?;
        let ring_phys = ring.physical_base();
        let ring_cycle = ring.cycle();

        self.contexts.reset_input();
        {
            let mut icc = self.contexts.input_control();
            icc.add(0);
            icc.add(dci);
        }
        {
            // The slot context rides along with updated context entries.
            let previous_entries = self.contexts.output_slot().context_entries();
            let mut slot = self.contexts.input_slot();
            slot.set_route_string(self.info.route_string);
            slot.set_root_hub_port(self.info.root_hub_port);
            slot.set_speed(self.info.speed.speed_id());
            slot.set_context_entries(previous_entries.max(dci));
        }
        {
            let mut ep = self.contexts.input_endpoint(dci);
            ep.set_endpoint_type(endpoint_context_type(endpoint));
            ep.set_max_packet_size(endpoint.max_packet_size);
            ep.set_error_count(3);
            ep.set_interval(interval);
            ep.set_tr_dequeue_pointer(ring_phys, ring_cycle);
            ep.set_average_trb_length(endpoint.max_packet_size.min(1024));
            ep.set_max_esit_payload(endpoint.max_packet_size);
        }

        let completion = self
            .controller
            .send_command(Trb::configure_endpoint(
                self.contexts.input_physical(),
                self.info.slot_id,
            ))
            .ok_or(KernelError::Timeout {
                operation: "Configure Endpoint",
                duration_ms: 200,
            })?;
        if completion.completion_code() != CompletionCode::Success {
            return Err(KernelError::DeviceError {
                device: "Configure Endpoint",
                code: completion.completion_code() as u32,
            });
        }

        *self.endpoint_rings[dci as usize - 2].lock() = Some(ring);
        log::debug!(
            target: "usb",
            "slot {}: endpoint DCI {} configured (interval {})",
            self.info.slot_id,
            dci,
            interval
        );
        Ok(())
    }

    /// Run every attached driver's post-initialization hook (no lock held
    /// while a hook runs; hooks arm transfers whose completions need the
    /// same list).
    fn post_initialization(&self) -> KernelResult<()> {
        for driver in self.drivers_snapshot() {
            driver.post_initialization(self)?;
        }
        Ok(())
    }

    /// Arm a Normal TRB on an endpoint ring; returns the TRB's
    /// device-visible address for event matching.
    pub fn submit_normal(&self, dci: u8, buffer_phys: u64, length: u32) -> KernelResult<u64> {
        if !(2..=31).contains(&dci) {
            return Err(KernelError::OutOfBounds {
                index: dci as usize,
                limit: 31,
            });
        }
        let mut guard = self.endpoint_rings[dci as usize - 2].lock();
        let ring = guard.as_mut().ok_or(KernelError::NotFound {
            resource: "endpoint ring",
        })?;
        let trb = ring.push(Trb::normal(buffer_phys, length));
        drop(guard);
        self.ring_doorbell(dci);
        Ok(trb)
    }

    /// Tear the device down: drain accesses, release drivers, detach from
    /// the DCBAA.
    pub fn destroy(&self) {
        self.set_unavailable();
        for driver in self.drivers_snapshot() {
            driver.release();
        }
        crate::interrupts::without_interrupts(|| self.drivers.lock().clear());
        log::info!(target: "usb", "slot {}: device released", self.info.slot_id);
    }
}

/// Endpoint-context type for a parsed endpoint descriptor.
fn endpoint_context_type(endpoint: &Endpoint) -> EndpointContextType {
    match (endpoint.endpoint_type, endpoint.device_to_host) {
        (EndpointType::Control, _) => EndpointContextType::Control,
        (EndpointType::Isochronous, false) => EndpointContextType::IsochOut,
        (EndpointType::Isochronous, true) => EndpointContextType::IsochIn,
        (EndpointType::Bulk, false) => EndpointContextType::BulkOut,
        (EndpointType::Bulk, true) => EndpointContextType::BulkIn,
        (EndpointType::Interrupt, false) => EndpointContextType::InterruptOut,
        (EndpointType::Interrupt, true) => EndpointContextType::InterruptIn,
    }
}

fn floor_log2(value: u32) -> u8 {
    (31 - value.leading_zeros()) as u8
}

/// Translate a descriptor's `bInterval` into the xHCI interval exponent.
///
/// - LS/FS interrupt: `log2(interval · 8)` clamped to `[3, 10]`
/// - HS/SS interrupt: `clamp(interval, 1, 16) - 1`
/// - Isochronous: LS rejected; FS `interval - 1 + 3`; HS/SS `interval - 1`
/// - Bulk/control: HS uses `log2(interval)`, everything else 0
pub fn convert_endpoint_interval(
    speed: PortSpeed,
    endpoint_type: EndpointType,
    interval: u8,
) -> KernelResult<u8> {
    let value = match endpoint_type {
        EndpointType::Interrupt => match speed {
            PortSpeed::Low | PortSpeed::Full => {
                floor_log2((interval as u32).max(1) * 8).clamp(3, 10)
            }
            _ => interval.clamp(1, 16) - 1,
        },
        EndpointType::Isochronous => match speed {
            PortSpeed::Low => {
                return Err(KernelError::InvalidParameter {
                    name: "isochronous on low speed",
                })
            }
            PortSpeed::Full => interval.saturating_sub(1) + 3,
            _ => interval.saturating_sub(1),
        },
        EndpointType::Bulk | EndpointType::Control => {
            if speed == PortSpeed::High && interval > 0 {
                floor_log2(interval as u32)
            } else {
                0
            }
        }
    };
    Ok(value)
}

// The Device is shared between the port-update task and the ISR through an
// Arc; every mutable path is behind one of its internal locks.
//
// SAFETY: See above; raw ring/context pointers are owned by this device.
unsafe impl Send for Device {}
// SAFETY: See above.
unsafe impl Sync for Device {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_interval_low_full_speed() {
        // FS keyboard with bInterval = 10 ms: log2(80) = 6.
        assert_eq!(
            convert_endpoint_interval(PortSpeed::Full, EndpointType::Interrupt, 10).unwrap(),
            6
        );
        // Clamped below: 1 ms -> log2(8) = 3.
        assert_eq!(
            convert_endpoint_interval(PortSpeed::Low, EndpointType::Interrupt, 1).unwrap(),
            3
        );
        // Clamped above: 255 ms -> 10.
        assert_eq!(
            convert_endpoint_interval(PortSpeed::Full, EndpointType::Interrupt, 255).unwrap(),
            10
        );
    }

    #[test]
    fn test_interrupt_interval_high_super_speed() {
        assert_eq!(
            convert_endpoint_interval(PortSpeed::High, EndpointType::Interrupt, 4).unwrap(),
            3
        );
        // Clamp range [1, 16].
        assert_eq!(
            convert_endpoint_interval(PortSpeed::SuperGen1, EndpointType::Interrupt, 0).unwrap(),
            0
        );
        assert_eq!(
            convert_endpoint_interval(PortSpeed::High, EndpointType::Interrupt, 200).unwrap(),
            15
        );
    }

    #[test]
    fn test_isochronous_intervals() {
        assert!(
            convert_endpoint_interval(PortSpeed::Low, EndpointType::Isochronous, 1).is_err()
        );
        assert_eq!(
            convert_endpoint_interval(PortSpeed::Full, EndpointType::Isochronous, 1).unwrap(),
            3
        );
        assert_eq!(
            convert_endpoint_interval(PortSpeed::High, EndpointType::Isochronous, 4).unwrap(),
            3
        );
    }

    #[test]
    fn test_bulk_control_intervals() {
        assert_eq!(
            convert_endpoint_interval(PortSpeed::High, EndpointType::Bulk, 8).unwrap(),
            3
        );
        assert_eq!(
            convert_endpoint_interval(PortSpeed::High, EndpointType::Bulk, 0).unwrap(),
            0
        );
        assert_eq!(
            convert_endpoint_interval(PortSpeed::SuperGen1, EndpointType::Control, 8).unwrap(),
            0
        );
    }

    #[test]
    fn test_endpoint_context_type_mapping() {
        let ep = |t, d| Endpoint {
            number: 1,
            device_to_host: d,
            endpoint_type: t,
            max_packet_size: 8,
            interval: 1,
        };
        assert_eq!(
            endpoint_context_type(&ep(EndpointType::Interrupt, true)),
            EndpointContextType::InterruptIn
        );
        assert_eq!(
            endpoint_context_type(&ep(EndpointType::Bulk, false)),
            EndpointContextType::BulkOut
        );
        assert_eq!(
            endpoint_context_type(&ep(EndpointType::Control, false)),
            EndpointContextType::Control
        );
    }
}
