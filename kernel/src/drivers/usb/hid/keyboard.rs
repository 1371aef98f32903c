//! HID keyboard interface device.
//!
//! Decodes keyboard input reports against the schema extracted from the
//! report descriptor (a modifier bitmap plus an array of key slots),
//! tracks which usages are held, and emits one [`BasicKeyPacket`] per
//! press and release into the keyboard sink.

use spin::Mutex;

use crate::drivers::keyboard::{BasicKeyPacket, KeyFlags, KeyQueue};

use super::report::{ApplicationCollection, ReportField, UsageSpan};

/// Generic Desktop usage page.
const PAGE_GENERIC_DESKTOP: u16 = 0x01;
/// Keyboard/Keypad usage page.
const PAGE_KEY_CODES: u16 = 0x07;
/// Keyboard application usage.
const USAGE_KEYBOARD: u16 = 0x06;

/// First modifier usage (Left Ctrl).
const MODIFIER_USAGE_BASE: u16 = 224;

/// Largest key array the decoder tracks.
const MAX_KEY_SLOTS: usize = 16;

/// Wire schema of one keyboard report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyboardSchema {
    pub report_id: u8,
    /// Bit offset of the 8-bit modifier bitmap, when present.
    pub modifier_bit_offset: Option<usize>,
    /// Bit offset of the key array.
    pub key_bit_offset: usize,
    /// Key slots in the array.
    pub key_slots: usize,
}

impl KeyboardSchema {
    /// Extract the schema from a parsed application collection, when it
    /// is a keyboard.
    pub fn from_application(app: &ApplicationCollection) -> Option<Self> {
        if app.usage_page != PAGE_GENERIC_DESKTOP || app.usage != USAGE_KEYBOARD {
            return None;
        }

        let mut bit_offset = 0usize;
        let mut modifier_bit_offset = None;
        let mut key_field: Option<(usize, &ReportField)> = None;

        for field in app.fields.iter().filter(|f| f.is_input) {
            if field.usage_page == PAGE_KEY_CODES
                && field.is_variable
                && field.size == 1
                && matches!(
                    field.usages,
                    UsageSpan::Range {
                        min: MODIFIER_USAGE_BASE,
                        ..
                    }
                )
            {
                modifier_bit_offset = Some(bit_offset);
            } else if field.usage_page == PAGE_KEY_CODES
                && !field.is_variable
                && field.size == 8
                && key_field.is_none()
            {
                key_field = Some((bit_offset, field));
            }
            bit_offset += field.size as usize * field.count as usize;
        }

        let (key_bit_offset, field) = key_field?;
        Some(Self {
            report_id: field.report_id,
            modifier_bit_offset,
            key_bit_offset,
            key_slots: (field.count as usize).min(MAX_KEY_SLOTS),
        })
    }
}

/// Held-key tracking between reports.
#[derive(Debug, Default)]
struct KeyboardState {
    held: [u8; MAX_KEY_SLOTS],
    held_count: usize,
}

/// A keyboard attached through the HID pipeline.
pub struct HidKeyboard {
    schema: KeyboardSchema,
    state: Mutex<KeyboardState>,
    sink: &'static KeyQueue,
}

impl HidKeyboard {
    pub fn new(schema: KeyboardSchema, sink: &'static KeyQueue) -> Self {
        Self {
            schema,
            state: Mutex::new(KeyboardState::default()),
            sink,
        }
    }

    pub fn schema(&self) -> &KeyboardSchema {
        &self.schema
    }

    /// Flags for the current modifier byte.
    fn modifier_flags(modifiers: u8) -> KeyFlags {
        let mut flags = KeyFlags::empty();
        // HID modifier bit order: LCtrl, LShift, LAlt, LGui, RCtrl,
        // RShift, RAlt, RGui.
        if modifiers & 0x01 != 0 {
            flags |= KeyFlags::LEFT_CTRL;
        }
        if modifiers & 0x02 != 0 {
            flags |= KeyFlags::LEFT_SHIFT;
        }
        if modifiers & 0x04 != 0 {
            flags |= KeyFlags::LEFT_ALT;
        }
        if modifiers & 0x10 != 0 {
            flags |= KeyFlags::RIGHT_CTRL;
        }
        if modifiers & 0x20 != 0 {
            flags |= KeyFlags::RIGHT_SHIFT;
        }
        if modifiers & 0x40 != 0 {
            flags |= KeyFlags::RIGHT_ALT;
        }
        flags
    }

    /// Decode one report (report-id byte already stripped) and emit the
    /// press/release packets it implies.
    pub fn process_report(&self, report: &[u8]) {
        let modifiers = match self.schema.modifier_bit_offset {
            Some(bits) if bits / 8 < report.len() => report[bits / 8],
            _ => 0,
        };

        let key_base = self.schema.key_bit_offset / 8;
        let mut current = [0u8; MAX_KEY_SLOTS];
        let mut current_count = 0usize;
        for slot in 0..self.schema.key_slots {
            let Some(&usage) = report.get(key_base + slot) else {
                break;
            };
            // Usage 0 is "no key"; 1..=3 are error rollover codes.
            if usage > 3 {
                current[current_count] = usage;
                current_count += 1;
            }
        }

        let flags = Self::modifier_flags(modifiers);
        let mut state = self.state.lock();

        // Presses: in the new set, not in the held set.
        for &usage in &current[..current_count] {
            if !state.held[..state.held_count].contains(&usage) {
                self.sink.push_packet(BasicKeyPacket::new(
                    usage as u16,
                    usage as u16,
                    flags | KeyFlags::KEY_PRESSED,
                ));
            }
        }
        // Releases: previously held, gone now.
        for i in 0..state.held_count {
            let usage = state.held[i];
            if !current[..current_count].contains(&usage) {
                self.sink
                    .push_packet(BasicKeyPacket::new(usage as u16, usage as u16, flags));
            }
        }

        state.held = current;
        state.held_count = current_count;
    }
}

#[cfg(test)]
mod tests {
    use super::super::report::parse_report_descriptor;
    use super::*;

    fn boot_keyboard(sink: &'static KeyQueue) -> HidKeyboard {
        let parsed =
            parse_report_descriptor(&super::super::report::tests::keyboard_descriptor()).unwrap();
        let schema = KeyboardSchema::from_application(&parsed.applications[0]).unwrap();
        HidKeyboard::new(schema, sink)
    }

    fn leaked_queue() -> &'static KeyQueue {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(KeyQueue::new()))
    }

    #[test]
    fn test_schema_extraction_from_boot_descriptor() {
        let parsed =
            parse_report_descriptor(&super::super::report::tests::keyboard_descriptor()).unwrap();
        let schema = KeyboardSchema::from_application(&parsed.applications[0]).unwrap();
        assert_eq!(schema.modifier_bit_offset, Some(0));
        // Modifiers (8 bits) + reserved byte (8 bits) = key array at bit 16.
        assert_eq!(schema.key_bit_offset, 16);
        assert_eq!(schema.key_slots, 6);
        assert_eq!(schema.report_id, 0);
    }

    /// SC-6: left shift + 'a' produces one packet with
    /// `LEFT_SHIFT | KEY_PRESSED` and the HID usage for 'A' (0x04).
    #[test]
    fn test_shift_a_keystroke() {
        let sink = leaked_queue();
        let keyboard = boot_keyboard(sink);

        keyboard.process_report(&[0x02, 0x00, 0x04, 0, 0, 0, 0, 0]);

        let mut out = [BasicKeyPacket::new(0, 0, KeyFlags::empty()); 4];
        assert_eq!(sink.read_packets(&mut out), 1);
        assert_eq!(out[0].keypoint, 0x04);
        assert_eq!(
            out[0].flags(),
            KeyFlags::LEFT_SHIFT | KeyFlags::KEY_PRESSED
        );
    }

    #[test]
    fn test_release_emits_unpressed_packet() {
        let sink = leaked_queue();
        let keyboard = boot_keyboard(sink);

        keyboard.process_report(&[0x00, 0x00, 0x04, 0, 0, 0, 0, 0]);
        keyboard.process_report(&[0x00, 0x00, 0x00, 0, 0, 0, 0, 0]);

        let mut out = [BasicKeyPacket::new(0, 0, KeyFlags::empty()); 4];
        assert_eq!(sink.read_packets(&mut out), 2);
        assert!(out[0].flags().contains(KeyFlags::KEY_PRESSED));
        assert!(!out[1].flags().contains(KeyFlags::KEY_PRESSED));
        assert_eq!(out[1].keypoint, 0x04);
    }

    #[test]
    fn test_held_key_not_repeated() {
        let sink = leaked_queue();
        let keyboard = boot_keyboard(sink);

        keyboard.process_report(&[0x00, 0x00, 0x04, 0, 0, 0, 0, 0]);
        keyboard.process_report(&[0x00, 0x00, 0x04, 0x05, 0, 0, 0, 0]);

        let mut out = [BasicKeyPacket::new(0, 0, KeyFlags::empty()); 4];
        // One press for 0x04, one press for 0x05 -- no repeat of 0x04.
        assert_eq!(sink.read_packets(&mut out), 2);
        assert_eq!(out[0].keypoint, 0x04);
        assert_eq!(out[1].keypoint, 0x05);
    }

    #[test]
    fn test_rollover_codes_ignored() {
        let sink = leaked_queue();
        let keyboard = boot_keyboard(sink);
        // Phantom-state report: all slots carry the rollover code 1.
        keyboard.process_report(&[0x00, 0x00, 1, 1, 1, 1, 1, 1]);
        assert_eq!(sink.pending(), 0);
    }

    #[test]
    fn test_right_modifiers_map() {
        assert_eq!(
            HidKeyboard::modifier_flags(0x20),
            KeyFlags::RIGHT_SHIFT
        );
        assert_eq!(
            HidKeyboard::modifier_flags(0x11),
            KeyFlags::LEFT_CTRL | KeyFlags::RIGHT_CTRL
        );
    }
}
