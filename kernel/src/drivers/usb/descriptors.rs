//! USB descriptor parsing.
//!
//! A configuration's byte stream parses top-down into a tree of Function →
//! Interface → Endpoint descriptors. Interface Association descriptors
//! create explicit Function groupings; interfaces outside any IAD each
//! form their own single-interface Function. Unknown interior descriptors
//! attach to the current interface's `extra` list (that is where the HID
//! class descriptor travels). A zero-length descriptor aborts parsing.

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

use super::descriptor_type;

/// The 18-byte device descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size_ep0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;

    /// Parse and validate an 18-byte device descriptor image.
    pub fn parse(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < Self::SIZE
            || (bytes[0] as usize) < Self::SIZE
            || bytes[1] != descriptor_type::DEVICE
        {
            return Err(KernelError::InvalidParameter {
                name: "device descriptor",
            });
        }
        Ok(Self {
            usb_version: u16::from_le_bytes([bytes[2], bytes[3]]),
            device_class: bytes[4],
            device_subclass: bytes[5],
            device_protocol: bytes[6],
            max_packet_size_ep0: bytes[7],
            vendor_id: u16::from_le_bytes([bytes[8], bytes[9]]),
            product_id: u16::from_le_bytes([bytes[10], bytes[11]]),
            device_version: u16::from_le_bytes([bytes[12], bytes[13]]),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_number_index: bytes[16],
            num_configurations: bytes[17],
        })
    }
}

/// Endpoint transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// One parsed endpoint descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Endpoint number (address bits 3:0).
    pub number: u8,
    /// Device-to-host direction (address bit 7).
    pub device_to_host: bool,
    pub endpoint_type: EndpointType,
    pub max_packet_size: u16,
    /// Raw bInterval from the descriptor.
    pub interval: u8,
}

/// An unrecognized interior descriptor carried along for class drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraDescriptor {
    pub descriptor_type: u8,
    pub bytes: Vec<u8>,
}

/// One interface (a single alternate setting).
#[derive(Debug, Clone, Default)]
pub struct Interface {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<Endpoint>,
    pub extra: Vec<ExtraDescriptor>,
}

/// A function: one or more interfaces grouped by an IAD, or a lone
/// interface.
#[derive(Debug, Clone, Default)]
pub struct Function {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub interfaces: Vec<Interface>,
}

/// One parsed configuration.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub value: u8,
    pub num_interfaces: u8,
    pub self_powered: bool,
    pub remote_wakeup: bool,
    /// Units of 2 mA (bus-powered devices).
    pub max_power: u8,
    pub total_length: u16,
    pub functions: Vec<Function>,
}

impl Configuration {
    /// The first function whose class matches, if any.
    pub fn find_function(&self, class: u8) -> Option<&Function> {
        self.functions.iter().find(|f| f.class == class)
    }
}

/// Read `wTotalLength` from a 4-byte (or longer) configuration prefix.
pub fn configuration_total_length(prefix: &[u8]) -> KernelResult<u16> {
    if prefix.len() < 4 || prefix[1] != descriptor_type::CONFIGURATION {
        return Err(KernelError::InvalidParameter {
            name: "configuration prefix",
        });
    }
    Ok(u16::from_le_bytes([prefix[2], prefix[3]]))
}

/// Parse a full configuration byte stream into its descriptor tree.
pub fn parse_configuration(bytes: &[u8]) -> KernelResult<Configuration> {
    if bytes.len() < 9 || bytes[0] < 9 || bytes[1] != descriptor_type::CONFIGURATION {
        return Err(KernelError::InvalidParameter {
            name: "configuration descriptor",
        });
    }

    let mut config = Configuration {
        value: bytes[5],
        num_interfaces: bytes[4],
        self_powered: bytes[7] & (1 << 6) != 0,
        remote_wakeup: bytes[7] & (1 << 5) != 0,
        max_power: bytes[8],
        total_length: u16::from_le_bytes([bytes[2], bytes[3]]),
        functions: Vec::new(),
    };

    let limit = (config.total_length as usize).min(bytes.len());
    let mut cursor = bytes[0] as usize;

    // Parser state: the function an open IAD groups interfaces into, and
    // how many interfaces it still claims.
    let mut open_iad: Option<(Function, u8)> = None;

    while cursor + 2 <= limit {
        let length = bytes[cursor] as usize;
        if length == 0 {
            // A zero-length descriptor would loop forever: abort.
            return Err(KernelError::InvalidParameter {
                name: "descriptor length",
            });
        }
        if cursor + length > limit {
            break;
        }
        let descriptor = &bytes[cursor..cursor + length];
        let dtype = descriptor[1];

        match dtype {
            descriptor_type::INTERFACE_ASSOCIATION if length >= 8 => {
                // Close any previous grouping first.
                if let Some((function, _)) = open_iad.take() {
                    config.functions.push(function);
                }
                open_iad = Some((
                    Function {
                        class: descriptor[4],
                        subclass: descriptor[5],
                        protocol: descriptor[6],
                        interfaces: Vec::new(),
                    },
                    descriptor[3],
                ));
            }
            descriptor_type::INTERFACE if length >= 9 => {
                let interface = Interface {
                    number: descriptor[2],
                    alternate_setting: descriptor[3],
                    class: descriptor[5],
                    subclass: descriptor[6],
                    protocol: descriptor[7],
                    endpoints: Vec::new(),
                    extra: Vec::new(),
                };
                // A full IAD group closes when the next interface outside
                // it begins.
                if matches!(open_iad.as_ref(), Some((_, 0))) {
                    let (function, _) = open_iad.take().expect("checked above");
                    config.functions.push(function);
                }
                match open_iad.as_mut() {
                    Some((function, remaining)) => {
                        function.interfaces.push(interface);
                        if interface_is_primary(descriptor) {
                            *remaining -= 1;
                        }
                    }
                    None => {
                        // Lone interface: its own function.
                        config.functions.push(Function {
                            class: interface.class,
                            subclass: interface.subclass,
                            protocol: interface.protocol,
                            interfaces: alloc::vec![interface],
                        });
                    }
                }
            }
            descriptor_type::ENDPOINT if length >= 7 => {
                let endpoint = Endpoint {
                    number: descriptor[2] & 0x0F,
                    device_to_host: descriptor[2] & 0x80 != 0,
                    endpoint_type: match descriptor[3] & 0x3 {
                        0 => EndpointType::Control,
                        1 => EndpointType::Isochronous,
                        2 => EndpointType::Bulk,
                        _ => EndpointType::Interrupt,
                    },
                    max_packet_size: u16::from_le_bytes([descriptor[4], descriptor[5]]),
                    interval: descriptor[6],
                };
                if let Some(interface) = current_interface(&mut config, &mut open_iad) {
                    interface.endpoints.push(endpoint);
                }
            }
            _ => {
                // Unknown interior descriptor: attach to the current
                // interface for class drivers to find.
                if let Some(interface) = current_interface(&mut config, &mut open_iad) {
                    interface.extra.push(ExtraDescriptor {
                        descriptor_type: dtype,
                        bytes: descriptor.to_vec(),
                    });
                }
            }
        }
        cursor += length;
    }

    if let Some((function, _)) = open_iad.take() {
        config.functions.push(function);
    }
    Ok(config)
}

/// Alternate setting 0 counts toward an IAD's interface total; alternates
/// ride along with their primary.
fn interface_is_primary(descriptor: &[u8]) -> bool {
    descriptor[3] == 0
}

/// The interface descriptors currently being filled (last of the open IAD
/// function, or of the last lone function).
fn current_interface<'a>(
    config: &'a mut Configuration,
    open_iad: &'a mut Option<(Function, u8)>,
) -> Option<&'a mut Interface> {
    if let Some((function, _)) = open_iad.as_mut() {
        return function.interfaces.last_mut();
    }
    config.functions.last_mut()?.interfaces.last_mut()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_header(total: u16, interfaces: u8) -> Vec<u8> {
        alloc::vec![
            9,
            descriptor_type::CONFIGURATION,
            total as u8,
            (total >> 8) as u8,
            interfaces,
            1,    // bConfigurationValue
            0,    // iConfiguration
            0xA0, // bus powered, remote wakeup
            50,   // 100 mA
        ]
    }

    fn interface_desc(number: u8, alt: u8, class: u8, endpoints: u8) -> Vec<u8> {
        alloc::vec![9, descriptor_type::INTERFACE, number, alt, endpoints, class, 1, 1, 0]
    }

    fn endpoint_desc(address: u8, attributes: u8, mps: u16, interval: u8) -> Vec<u8> {
        alloc::vec![
            7,
            descriptor_type::ENDPOINT,
            address,
            attributes,
            mps as u8,
            (mps >> 8) as u8,
            interval,
        ]
    }

    fn hid_class_desc() -> Vec<u8> {
        alloc::vec![9, descriptor_type::HID, 0x11, 0x01, 0, 1, 0x22, 63, 0]
    }

    fn keyboard_configuration() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(config_header(0, 1));
        bytes.extend(interface_desc(0, 0, super::super::class::HID, 1));
        bytes.extend(hid_class_desc());
        bytes.extend(endpoint_desc(0x81, 0x03, 8, 10));
        let total = bytes.len() as u16;
        bytes[2] = total as u8;
        bytes[3] = (total >> 8) as u8;
        bytes
    }

    #[test]
    fn test_prefetch_reads_total_length() {
        let bytes = keyboard_configuration();
        assert_eq!(
            configuration_total_length(&bytes[..4]).unwrap(),
            bytes.len() as u16
        );
        assert!(configuration_total_length(&[9, 4, 0, 0]).is_err());
    }

    #[test]
    fn test_keyboard_configuration_tree() {
        let config = parse_configuration(&keyboard_configuration()).unwrap();
        assert_eq!(config.value, 1);
        assert!(config.remote_wakeup);
        assert!(!config.self_powered);
        assert_eq!(config.functions.len(), 1);

        let function = &config.functions[0];
        assert_eq!(function.class, super::super::class::HID);
        assert_eq!(function.interfaces.len(), 1);

        let interface = &function.interfaces[0];
        assert_eq!(interface.endpoints.len(), 1);
        assert_eq!(interface.extra.len(), 1);
        assert_eq!(interface.extra[0].descriptor_type, descriptor_type::HID);

        let ep = interface.endpoints[0];
        assert_eq!(ep.number, 1);
        assert!(ep.device_to_host);
        assert_eq!(ep.endpoint_type, EndpointType::Interrupt);
        assert_eq!(ep.max_packet_size, 8);
        assert_eq!(ep.interval, 10);
    }

    #[test]
    fn test_iad_groups_interfaces() {
        let mut bytes = Vec::new();
        bytes.extend(config_header(0, 3));
        // IAD: first interface 0, count 2, class 0x0E (video).
        bytes.extend(alloc::vec![8, descriptor_type::INTERFACE_ASSOCIATION, 0, 2, 0x0E, 1, 0, 0]);
        bytes.extend(interface_desc(0, 0, 0x0E, 0));
        bytes.extend(interface_desc(1, 0, 0x0E, 1));
        bytes.extend(endpoint_desc(0x82, 0x02, 512, 0));
        // A lone interface after the group.
        bytes.extend(interface_desc(2, 0, super::super::class::HID, 0));
        let total = bytes.len() as u16;
        bytes[2] = total as u8;
        bytes[3] = (total >> 8) as u8;

        let config = parse_configuration(&bytes).unwrap();
        assert_eq!(config.functions.len(), 2);
        assert_eq!(config.functions[0].class, 0x0E);
        assert_eq!(config.functions[0].interfaces.len(), 2);
        assert_eq!(config.functions[0].interfaces[1].endpoints.len(), 1);
        assert_eq!(config.functions[1].class, super::super::class::HID);
        assert!(config.find_function(super::super::class::HID).is_some());
        assert!(config.find_function(0x08).is_none());
    }

    #[test]
    fn test_zero_length_descriptor_aborts() {
        let mut bytes = keyboard_configuration();
        // Corrupt the HID descriptor's length to zero.
        bytes[9] = 0;
        assert!(parse_configuration(&bytes).is_err());
    }

    #[test]
    fn test_device_descriptor_parse_and_validate() {
        let mut raw = [0u8; 18];
        raw[0] = 18;
        raw[1] = descriptor_type::DEVICE;
        raw[2..4].copy_from_slice(&0x0200u16.to_le_bytes());
        raw[7] = 64;
        raw[8..10].copy_from_slice(&0x046Du16.to_le_bytes());
        raw[10..12].copy_from_slice(&0xC31Cu16.to_le_bytes());
        raw[17] = 1;
        let desc = DeviceDescriptor::parse(&raw).unwrap();
        assert_eq!(desc.usb_version, 0x0200);
        assert_eq!(desc.vendor_id, 0x046D);
        assert_eq!(desc.max_packet_size_ep0, 64);
        assert_eq!(desc.num_configurations, 1);

        // Wrong type byte rejected.
        raw[1] = descriptor_type::CONFIGURATION;
        assert!(DeviceDescriptor::parse(&raw).is_err());
    }
}
