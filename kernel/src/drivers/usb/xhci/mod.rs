//! xHCI host-controller driver.
//!
//! Layered bottom-up: [`trb`] defines the 16-byte blocks, [`ring`] the
//! producer/consumer cycle discipline, [`regs`] the MMIO register file,
//! [`context`] the slot/endpoint context structures, [`controller`] the
//! bring-up state machine and event ISR, and [`device`] per-slot
//! enumeration over the default control endpoint.

pub mod context;
pub mod controller;
pub mod device;
pub mod regs;
pub mod ring;
pub mod trb;

pub use controller::Controller;
pub use device::{convert_endpoint_interval, Device, DeviceInformation};
