//! USB core types shared by the xHCI driver and the class drivers.

pub mod descriptors;
pub mod hid;
pub mod xhci;

use crate::error::KernelResult;

/// USB device classes the enumerator recognizes.
pub mod class {
    /// Human Interface Device.
    pub const HID: u8 = 0x03;
    pub const MASS_STORAGE: u8 = 0x08;
    pub const HUB: u8 = 0x09;
}

/// Standard request codes.
pub mod request {
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_CONFIGURATION: u8 = 9;
}

/// Standard descriptor types.
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const INTERFACE_ASSOCIATION: u8 = 11;
    pub const HID: u8 = 0x21;
    pub const HID_REPORT: u8 = 0x22;
}

/// bmRequestType values used by the core.
pub mod request_type {
    /// Device-to-host, standard, device recipient.
    pub const DEVICE_IN: u8 = 0x80;
    /// Host-to-device, standard, device recipient.
    pub const DEVICE_OUT: u8 = 0x00;
    /// Device-to-host, standard, interface recipient.
    pub const INTERFACE_IN: u8 = 0x81;
}

/// Port speed as reported in PORTSC / the slot context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpeed {
    Invalid,
    Low,
    Full,
    High,
    SuperGen1,
    SuperPlus,
}

impl PortSpeed {
    /// Decode a protocol-defined speed ID (1..=7 for the standard
    /// mappings).
    pub fn from_speed_id(id: u8) -> Self {
        match id {
            1 => Self::Full,
            2 => Self::Low,
            3 => Self::High,
            4 => Self::SuperGen1,
            5..=7 => Self::SuperPlus,
            _ => Self::Invalid,
        }
    }

    /// Slot-context speed field value.
    pub fn speed_id(&self) -> u8 {
        match self {
            Self::Full => 1,
            Self::Low => 2,
            Self::High => 3,
            Self::SuperGen1 => 4,
            Self::SuperPlus => 5,
            Self::Invalid => 0,
        }
    }

    /// Default control-endpoint max packet size before the device
    /// descriptor is read (LS 8, FS 64, HS 64, SS 512).
    pub fn default_max_packet_size(&self) -> Option<u16> {
        match self {
            Self::Low => Some(8),
            Self::Full | Self::High => Some(64),
            Self::SuperGen1 | Self::SuperPlus => Some(512),
            Self::Invalid => None,
        }
    }

    /// USB 2 family (needs the PR reset handshake) vs USB 3 (reset is
    /// handled by link training).
    pub fn is_usb2(&self) -> bool {
        matches!(self, Self::Low | Self::Full | Self::High)
    }
}

/// Driver plugin points resolved per USB function.
///
/// A driver attaches to a device during configuration activation; the
/// transfer-event path consults [`UsbDriver::awaiting_trb`] to route
/// completions that do not belong to the device's own control transfers.
pub trait UsbDriver: Send + Sync {
    /// Device-visible address of the TRB this driver is waiting on (0 when
    /// idle).
    fn awaiting_trb(&self) -> u64;

    /// A transfer event matching [`Self::awaiting_trb`] arrived.
    fn handle_event(&self, device: &xhci::Device, event: &xhci::trb::Trb);

    /// Endpoints are configured; start the driver's pipeline.
    fn post_initialization(&self, device: &xhci::Device) -> KernelResult<()>;

    /// The device is going away; stop referencing it.
    fn release(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_control_packet_sizes() {
        assert_eq!(PortSpeed::Low.default_max_packet_size(), Some(8));
        assert_eq!(PortSpeed::Full.default_max_packet_size(), Some(64));
        assert_eq!(PortSpeed::High.default_max_packet_size(), Some(64));
        assert_eq!(PortSpeed::SuperGen1.default_max_packet_size(), Some(512));
        assert_eq!(PortSpeed::Invalid.default_max_packet_size(), None);
    }

    #[test]
    fn test_speed_id_roundtrip() {
        for id in 1..=4u8 {
            assert_eq!(PortSpeed::from_speed_id(id).speed_id(), id);
        }
        assert_eq!(PortSpeed::from_speed_id(0), PortSpeed::Invalid);
    }

    #[test]
    fn test_usb2_family() {
        assert!(PortSpeed::Low.is_usb2());
        assert!(PortSpeed::High.is_usb2());
        assert!(!PortSpeed::SuperGen1.is_usb2());
    }
}
