//! HID report-descriptor parsing.
//!
//! The parser walks the descriptor item by item, maintaining the HID
//! global and local state tables, and flattens Input/Output main items
//! into [`ReportField`]s grouped per report ID. The subset understood is
//! what the USB HID 1.11 grammar requires for the devices the kernel
//! drives: Global tags Usage Page / Logical Min / Logical Max / Report
//! Size / Report ID / Report Count; Local tags Usage / Usage Min / Usage
//! Max. All Main tags are accepted structurally, but Feature items are
//! rejected.

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

/// Item type field (prefix bits 3:2).
const TYPE_MAIN: u8 = 0;
const TYPE_GLOBAL: u8 = 1;
const TYPE_LOCAL: u8 = 2;

/// Main tags (prefix bits 7:4).
const MAIN_INPUT: u8 = 8;
const MAIN_OUTPUT: u8 = 9;
const MAIN_COLLECTION: u8 = 10;
const MAIN_FEATURE: u8 = 11;
const MAIN_END_COLLECTION: u8 = 12;

/// Global tags.
const GLOBAL_USAGE_PAGE: u8 = 0;
const GLOBAL_LOGICAL_MIN: u8 = 1;
const GLOBAL_LOGICAL_MAX: u8 = 2;
const GLOBAL_REPORT_SIZE: u8 = 7;
const GLOBAL_REPORT_ID: u8 = 8;
const GLOBAL_REPORT_COUNT: u8 = 9;

/// Local tags.
const LOCAL_USAGE: u8 = 0;
const LOCAL_USAGE_MIN: u8 = 1;
const LOCAL_USAGE_MAX: u8 = 2;

/// Main-item data bit 1: variable (bitmap) vs array.
const MAIN_FLAG_VARIABLE: u32 = 1 << 1;

/// Usage assignment of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageSpan {
    /// Explicit usage list (repeated `Usage` items).
    List(Vec<u16>),
    /// `Usage Minimum` / `Usage Maximum` range.
    Range { min: u16, max: u16 },
    /// No local usages (padding fields).
    None,
}

/// One flattened Input or Output item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportField {
    pub report_id: u8,
    pub usage_page: u16,
    pub usages: UsageSpan,
    pub logical_min: i32,
    pub logical_max: i32,
    /// Bits per element.
    pub size: u8,
    /// Elements in the field.
    pub count: u16,
    pub is_input: bool,
    /// Variable (one usage per bit/element) vs array (element = usage
    /// index).
    pub is_variable: bool,
}

/// Top-level collection of one application (keyed by its usage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationCollection {
    pub usage_page: u16,
    pub usage: u16,
    pub fields: Vec<ReportField>,
}

/// The parsed descriptor.
#[derive(Debug, Clone, Default)]
pub struct ParsedReportDescriptor {
    pub applications: Vec<ApplicationCollection>,
    /// Set when a `Report ID` item appeared: every wire report is then
    /// prefixed by its id byte.
    pub has_report_ids: bool,
    /// Largest single report payload in bytes (excluding the id byte).
    pub max_report_bytes: usize,
}

impl ParsedReportDescriptor {
    /// Flat view over every field (property-test surface).
    pub fn all_fields(&self) -> impl Iterator<Item = &ReportField> {
        self.applications.iter().flat_map(|a| a.fields.iter())
    }

    /// Wire size of the interrupt transfer buffer: the largest report,
    /// plus the id byte when reports are id-prefixed.
    pub fn transfer_buffer_size(&self) -> usize {
        self.max_report_bytes + self.has_report_ids as usize
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct GlobalState {
    usage_page: u16,
    logical_min: i32,
    logical_max: i32,
    report_size: u8,
    report_id: u8,
    report_count: u16,
}

#[derive(Debug, Clone, Default)]
struct LocalState {
    usages: Vec<u16>,
    usage_min: Option<u16>,
    usage_max: Option<u16>,
}

impl LocalState {
    fn take_span(&mut self) -> UsageSpan {
        let span = match (self.usage_min, self.usage_max) {
            (Some(min), Some(max)) => UsageSpan::Range { min, max },
            _ if !self.usages.is_empty() => UsageSpan::List(core::mem::take(&mut self.usages)),
            _ => UsageSpan::None,
        };
        *self = LocalState::default();
        span
    }
}

fn item_data(bytes: &[u8]) -> (u32, i32) {
    let mut unsigned = 0u32;
    for (i, b) in bytes.iter().enumerate() {
        unsigned |= (*b as u32) << (8 * i);
    }
    let signed = match bytes.len() {
        1 => bytes[0] as i8 as i32,
        2 => i16::from_le_bytes([bytes[0], bytes[1]]) as i32,
        4 => unsigned as i32,
        _ => 0,
    };
    (unsigned, signed)
}

/// Parse a report descriptor.
pub fn parse_report_descriptor(bytes: &[u8]) -> KernelResult<ParsedReportDescriptor> {
    let mut result = ParsedReportDescriptor::default();
    let mut global = GlobalState::default();
    let mut local = LocalState::default();

    // Stack of open collections; fields land on the innermost
    // application's accumulator.
    let mut collection_depth = 0usize;
    let mut open_application: Option<ApplicationCollection> = None;
    // Bits accumulated per report id to size the transfer buffer.
    let mut report_bits: alloc::collections::BTreeMap<u8, usize> =
        alloc::collections::BTreeMap::new();

    let mut cursor = 0usize;
    while cursor < bytes.len() {
        let prefix = bytes[cursor];
        if prefix == 0xFE {
            // Long items carry their own length byte; skip the payload.
            if cursor + 2 >= bytes.len() {
                return Err(KernelError::InvalidParameter {
                    name: "report descriptor",
                });
            }
            cursor += 3 + bytes[cursor + 1] as usize;
            continue;
        }
        let size = match prefix & 0x3 {
            0 => 0,
            1 => 1,
            2 => 2,
            _ => 4,
        };
        let item_type = (prefix >> 2) & 0x3;
        let tag = prefix >> 4;
        if cursor + 1 + size > bytes.len() {
            return Err(KernelError::InvalidParameter {
                name: "report descriptor",
            });
        }
        let data = &bytes[cursor + 1..cursor + 1 + size];
        let (unsigned, signed) = item_data(data);
        cursor += 1 + size;

        match item_type {
            TYPE_GLOBAL => match tag {
                GLOBAL_USAGE_PAGE => global.usage_page = unsigned as u16,
                GLOBAL_LOGICAL_MIN => global.logical_min = signed,
                GLOBAL_LOGICAL_MAX => global.logical_max = signed,
                GLOBAL_REPORT_SIZE => global.report_size = unsigned as u8,
                GLOBAL_REPORT_ID => {
                    global.report_id = unsigned as u8;
                    result.has_report_ids = true;
                }
                GLOBAL_REPORT_COUNT => global.report_count = unsigned as u16,
                _ => {}
            },
            TYPE_LOCAL => match tag {
                LOCAL_USAGE => local.usages.push(unsigned as u16),
                LOCAL_USAGE_MIN => local.usage_min = Some(unsigned as u16),
                LOCAL_USAGE_MAX => local.usage_max = Some(unsigned as u16),
                _ => {}
            },
            TYPE_MAIN => {
                match tag {
                    MAIN_COLLECTION => {
                        if collection_depth == 0 {
                            // Application collections key the device tree.
                            let usage = local.usages.first().copied().unwrap_or(0);
                            open_application = Some(ApplicationCollection {
                                usage_page: global.usage_page,
                                usage,
                                fields: Vec::new(),
                            });
                        }
                        collection_depth += 1;
                        local = LocalState::default();
                    }
                    MAIN_END_COLLECTION => {
                        if collection_depth == 0 {
                            return Err(KernelError::InvalidParameter {
                                name: "end collection",
                            });
                        }
                        collection_depth -= 1;
                        if collection_depth == 0 {
                            if let Some(app) = open_application.take() {
                                result.applications.push(app);
                            }
                        }
                        local = LocalState::default();
                    }
                    MAIN_INPUT | MAIN_OUTPUT => {
                        let field = ReportField {
                            report_id: global.report_id,
                            usage_page: global.usage_page,
                            usages: local.take_span(),
                            logical_min: global.logical_min,
                            logical_max: global.logical_max,
                            size: global.report_size,
                            count: global.report_count,
                            is_input: tag == MAIN_INPUT,
                            is_variable: unsigned & MAIN_FLAG_VARIABLE != 0,
                        };
                        if field.is_input {
                            let bits = report_bits.entry(field.report_id).or_default();
                            *bits += field.size as usize * field.count as usize;
                        }
                        match open_application.as_mut() {
                            Some(app) => app.fields.push(field),
                            None => {
                                return Err(KernelError::InvalidParameter {
                                    name: "main item outside collection",
                                })
                            }
                        }
                    }
                    MAIN_FEATURE => {
                        // Feature reports are not consumed by any driver.
                        return Err(KernelError::InvalidParameter {
                            name: "feature item",
                        });
                    }
                    _ => {
                        local = LocalState::default();
                    }
                }
            }
            _ => {}
        }
    }

    result.max_report_bytes = report_bits
        .values()
        .map(|bits| bits.div_ceil(8))
        .max()
        .unwrap_or(0);
    Ok(result)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// The classic boot-protocol keyboard report descriptor.
    pub(crate) fn keyboard_descriptor() -> Vec<u8> {
        alloc::vec![
            0x05, 0x01, // Usage Page (Generic Desktop)
            0x09, 0x06, // Usage (Keyboard)
            0xA1, 0x01, // Collection (Application)
            0x05, 0x07, //   Usage Page (Key Codes)
            0x19, 0xE0, //   Usage Minimum (224)
            0x29, 0xE7, //   Usage Maximum (231)
            0x15, 0x00, //   Logical Minimum (0)
            0x25, 0x01, //   Logical Maximum (1)
            0x75, 0x01, //   Report Size (1)
            0x95, 0x08, //   Report Count (8)
            0x81, 0x02, //   Input (Data, Variable, Absolute) -- modifiers
            0x95, 0x01, //   Report Count (1)
            0x75, 0x08, //   Report Size (8)
            0x81, 0x01, //   Input (Constant) -- reserved byte
            0x95, 0x05, //   Report Count (5)
            0x75, 0x01, //   Report Size (1)
            0x05, 0x08, //   Usage Page (LEDs)
            0x19, 0x01, //   Usage Minimum (1)
            0x29, 0x05, //   Usage Maximum (5)
            0x91, 0x02, //   Output (Data, Variable, Absolute) -- LEDs
            0x95, 0x01, //   Report Count (1)
            0x75, 0x03, //   Report Size (3)
            0x91, 0x01, //   Output (Constant) -- LED padding
            0x95, 0x06, //   Report Count (6)
            0x75, 0x08, //   Report Size (8)
            0x15, 0x00, //   Logical Minimum (0)
            0x25, 0x65, //   Logical Maximum (101)
            0x05, 0x07, //   Usage Page (Key Codes)
            0x19, 0x00, //   Usage Minimum (0)
            0x29, 0x65, //   Usage Maximum (101)
            0x81, 0x00, //   Input (Data, Array) -- key slots
            0xC0, // End Collection
        ]
    }

    #[test]
    fn test_keyboard_descriptor_structure() {
        let parsed = parse_report_descriptor(&keyboard_descriptor()).unwrap();
        assert_eq!(parsed.applications.len(), 1);
        assert!(!parsed.has_report_ids);

        let app = &parsed.applications[0];
        assert_eq!(app.usage_page, 0x01);
        assert_eq!(app.usage, 0x06);

        // Modifier bitmap, reserved byte, LED output, LED pad, key array.
        assert_eq!(app.fields.len(), 5);

        let modifiers = &app.fields[0];
        assert!(modifiers.is_input);
        assert!(modifiers.is_variable);
        assert_eq!(modifiers.usage_page, 0x07);
        assert_eq!(modifiers.size, 1);
        assert_eq!(modifiers.count, 8);
        assert_eq!(modifiers.usages, UsageSpan::Range { min: 224, max: 231 });

        let keys = &app.fields[4];
        assert!(keys.is_input);
        assert!(!keys.is_variable);
        assert_eq!(keys.size, 8);
        assert_eq!(keys.count, 6);
        assert_eq!(keys.logical_max, 101);

        // 8 modifier bits + 8 reserved bits + 6 key bytes = 8 bytes.
        assert_eq!(parsed.max_report_bytes, 8);
        assert_eq!(parsed.transfer_buffer_size(), 8);
    }

    /// Property-test surface: the `(page, usage-span, size, count)` tuples
    /// the parser emits for the reference keyboard descriptor.
    #[test]
    fn test_emitted_field_tuples_match_reference() {
        let parsed = parse_report_descriptor(&keyboard_descriptor()).unwrap();
        let tuples: Vec<(u16, u8, u16, bool)> = parsed
            .all_fields()
            .map(|f| (f.usage_page, f.size, f.count, f.is_input))
            .collect();
        assert_eq!(
            tuples,
            alloc::vec![
                (0x07, 1, 8, true),  // modifiers
                (0x07, 8, 1, true),  // reserved
                (0x08, 1, 5, false), // LEDs
                (0x08, 3, 1, false), // LED padding
                (0x07, 8, 6, true),  // key slots
            ]
        );
    }

    #[test]
    fn test_report_ids_grow_transfer_buffer() {
        let mut desc = alloc::vec![
            0x05, 0x01, // Usage Page (Generic Desktop)
            0x09, 0x06, // Usage (Keyboard)
            0xA1, 0x01, // Collection (Application)
            0x85, 0x02, //   Report ID (2)
            0x75, 0x08, //   Report Size (8)
            0x95, 0x04, //   Report Count (4)
            0x05, 0x07, //   Usage Page (Key Codes)
            0x19, 0x00, //   Usage Minimum (0)
            0x29, 0x65, //   Usage Maximum (101)
            0x81, 0x00, //   Input (Array)
            0xC0,
        ];
        let parsed = parse_report_descriptor(&desc).unwrap();
        assert!(parsed.has_report_ids);
        assert_eq!(parsed.max_report_bytes, 4);
        // Id byte rides in front of every report.
        assert_eq!(parsed.transfer_buffer_size(), 5);

        // Same descriptor without the Report ID item.
        desc.drain(6..8);
        let parsed = parse_report_descriptor(&desc).unwrap();
        assert!(!parsed.has_report_ids);
        assert_eq!(parsed.transfer_buffer_size(), 4);
    }

    #[test]
    fn test_feature_items_rejected() {
        let desc = alloc::vec![
            0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, // keyboard collection
            0x75, 0x08, 0x95, 0x01, // size 8, count 1
            0xB1, 0x02, // Feature (Data, Variable)
            0xC0,
        ];
        assert!(parse_report_descriptor(&desc).is_err());
    }

    #[test]
    fn test_unbalanced_end_collection_rejected() {
        let desc = alloc::vec![0xC0u8];
        assert!(parse_report_descriptor(&desc).is_err());
    }

    #[test]
    fn test_truncated_item_rejected() {
        // Prefix promises 2 data bytes, stream ends after 1.
        let desc = alloc::vec![0x06u8, 0x01];
        assert!(parse_report_descriptor(&desc).is_err());
    }

    #[test]
    fn test_explicit_usage_list() {
        let desc = alloc::vec![
            0x05, 0x0C, // Usage Page (Consumer)
            0x09, 0x01, // Usage (Consumer Control)
            0xA1, 0x01, // Collection (Application)
            0x09, 0xE9, //   Usage (Volume Up)
            0x09, 0xEA, //   Usage (Volume Down)
            0x15, 0x00, 0x25, 0x01, // logical 0..1
            0x75, 0x01, 0x95, 0x02, // size 1, count 2
            0x81, 0x02, //   Input (Variable)
            0xC0,
        ];
        let parsed = parse_report_descriptor(&desc).unwrap();
        let field = parsed.all_fields().next().unwrap();
        assert_eq!(field.usages, UsageSpan::List(alloc::vec![0xE9, 0xEA]));
    }
}
