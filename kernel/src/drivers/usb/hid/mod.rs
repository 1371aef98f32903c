//! HID class driver.
//!
//! Probing locates the HID class descriptor in the interface extras, pulls
//! the report descriptor over the control endpoint, and parses it into the
//! interface-device tree (keyboards, today). Post-initialization arms a
//! Normal TRB on the interrupt IN endpoint; every completion dispatches
//! the report to the interface devices and re-arms the transfer.

pub mod keyboard;
pub mod report;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::{
    drivers::{
        keyboard::KEYBOARD,
        usb::{
            descriptor_type,
            descriptors::{EndpointType, Function},
            request_type,
            xhci::{context::endpoint_dci, trb::Trb, Device},
            UsbDriver,
        },
    },
    error::{KernelError, KernelResult},
    mm::io_heap,
};

use keyboard::{HidKeyboard, KeyboardSchema};
use report::parse_report_descriptor;

/// HID class request: GET_DESCRIPTOR directed at the interface.
const HID_GET_DESCRIPTOR: u8 = 6;

/// Interface devices the parser can instantiate.
enum InterfaceDevice {
    Keyboard(HidKeyboard),
}

impl InterfaceDevice {
    fn process_report(&self, report: &[u8]) {
        match self {
            InterfaceDevice::Keyboard(keyboard) => keyboard.process_report(report),
        }
    }

    /// Report id this device consumes (0 when ids are unused).
    fn report_id(&self) -> u8 {
        match self {
            InterfaceDevice::Keyboard(keyboard) => keyboard.schema().report_id,
        }
    }
}

/// One bound HID function.
pub struct HidDriver {
    /// DCI of the interrupt IN endpoint feeding reports.
    interrupt_dci: u8,
    /// Interface number for the class GET_DESCRIPTOR.
    interface_number: u8,
    /// Report buffer shared with the controller.
    buffer: io_heap::DmaBuffer,
    /// Wire size of one transfer.
    transfer_size: usize,
    /// Reports carry a leading id byte.
    has_report_ids: bool,
    devices: Vec<InterfaceDevice>,
    /// TRB currently armed on the interrupt endpoint (0 = idle).
    armed_trb: AtomicU64,
    /// Guards re-arming against teardown.
    armed_lock: Mutex<()>,
}

impl HidDriver {
    /// Probe a HID function: fetch and parse its report descriptor and
    /// build the interface-device tree. Fails when the function carries
    /// nothing the kernel can drive.
    pub fn probe(device: &Device, function: &Function) -> KernelResult<HidDriver> {
        let interface = function
            .interfaces
            .first()
            .ok_or(KernelError::NotFound { resource: "interface" })?;

        // The HID class descriptor rides in the interface extras and
        // advertises the report descriptor's length.
        let hid_descriptor = interface
            .extra
            .iter()
            .find(|d| d.descriptor_type == descriptor_type::HID)
            .ok_or(KernelError::NotFound {
                resource: "HID descriptor",
            })?;
        if hid_descriptor.bytes.len() < 9 || hid_descriptor.bytes[6] != descriptor_type::HID_REPORT
        {
            return Err(KernelError::InvalidParameter {
                name: "HID descriptor",
            });
        }
        let report_length =
            u16::from_le_bytes([hid_descriptor.bytes[7], hid_descriptor.bytes[8]]);

        let interrupt_in = interface
            .endpoints
            .iter()
            .find(|e| e.device_to_host && e.endpoint_type == EndpointType::Interrupt)
            .copied()
            .ok_or(KernelError::NotFound {
                resource: "interrupt IN endpoint",
            })?;

        // Pull the report descriptor into an IO-heap buffer.
        let descriptor_buffer = io_heap::DmaBuffer::pages(1)?;
        device.send_request(
            request_type::INTERFACE_IN,
            HID_GET_DESCRIPTOR,
            (descriptor_type::HID_REPORT as u16) << 8,
            interface.number as u16,
            Some((descriptor_buffer.phys(), report_length)),
        )?;
        // SAFETY: The transfer wrote `report_length` bytes into the page.
        let descriptor_bytes = unsafe {
            core::slice::from_raw_parts(descriptor_buffer.virt(), report_length as usize)
        };
        let parsed = parse_report_descriptor(descriptor_bytes)?;

        let mut devices = Vec::new();
        for application in &parsed.applications {
            if let Some(schema) = KeyboardSchema::from_application(application) {
                log::info!(
                    target: "usb",
                    "slot {}: HID keyboard ({} key slots)",
                    device.info().slot_id,
                    schema.key_slots
                );
                devices.push(InterfaceDevice::Keyboard(HidKeyboard::new(
                    schema, &KEYBOARD,
                )));
            } else {
                log::debug!(
                    target: "usb",
                    "slot {}: unhandled HID application {:#x}/{:#x}",
                    device.info().slot_id,
                    application.usage_page,
                    application.usage
                );
            }
        }
        if devices.is_empty() {
            return Err(KernelError::NotFound {
                resource: "supported HID application",
            });
        }

        // With report ids, each transfer carries the id byte up front.
        let transfer_size = parsed
            .transfer_buffer_size()
            .max(interrupt_in.max_packet_size as usize)
            .min(crate::mm::PAGE_SIZE);
        let buffer = io_heap::DmaBuffer::pages(1)?;

        Ok(HidDriver {
            interrupt_dci: endpoint_dci(interrupt_in.number, true),
            interface_number: interface.number,
            buffer,
            transfer_size,
            has_report_ids: parsed.has_report_ids,
            devices,
            armed_trb: AtomicU64::new(0),
            armed_lock: Mutex::new(()),
        })
    }

    /// Queue the next interrupt IN transfer.
    fn arm(&self, device: &Device) -> KernelResult<()> {
        let _guard = self.armed_lock.lock();
        if device.is_unavailable() {
            return Err(KernelError::Unavailable);
        }
        let trb = device.submit_normal(
            self.interrupt_dci,
            self.buffer.phys(),
            self.transfer_size as u32,
        )?;
        self.armed_trb.store(trb, Ordering::SeqCst);
        Ok(())
    }

    /// Split an incoming transfer into (device report id, payload).
    fn split_report<'a>(&self, raw: &'a [u8]) -> (u8, &'a [u8]) {
        if self.has_report_ids && !raw.is_empty() {
            (raw[0], &raw[1..])
        } else {
            (0, raw)
        }
    }
}

impl UsbDriver for HidDriver {
    fn awaiting_trb(&self) -> u64 {
        self.armed_trb.load(Ordering::SeqCst)
    }

    fn handle_event(&self, device: &Device, event: &Trb) {
        self.armed_trb.store(0, Ordering::SeqCst);
        if !event.completion_code().is_ok() {
            log::debug!(
                target: "usb",
                "slot {}: interrupt transfer failed: {:?}",
                device.info().slot_id,
                event.completion_code()
            );
            return;
        }
        let received = self
            .transfer_size
            .saturating_sub(event.transfer_length() as usize);
        // SAFETY: The controller wrote `received` bytes into our buffer.
        let raw = unsafe { core::slice::from_raw_parts(self.buffer.virt(), received) };
        let (report_id, payload) = self.split_report(raw);
        for interface_device in &self.devices {
            if interface_device.report_id() == report_id {
                interface_device.process_report(payload);
            }
        }
        // Keep the pipeline hot.
        if let Err(e) = self.arm(device) {
            log::debug!(
                target: "usb",
                "slot {}: interrupt IN re-arm failed: {}",
                device.info().slot_id,
                e
            );
        }
    }

    fn post_initialization(&self, device: &Device) -> KernelResult<()> {
        log::debug!(
            target: "usb",
            "slot {}: HID interface {} live on DCI {}",
            device.info().slot_id,
            self.interface_number,
            self.interrupt_dci
        );
        self.arm(device)
    }

    fn release(&self) {
        let _guard = self.armed_lock.lock();
        self.armed_trb.store(0, Ordering::SeqCst);
    }
}
