//! Transfer Request Blocks.
//!
//! Every unit moving through an xHCI ring is a 16-byte TRB with a single
//! producer/consumer cycle bit (word 3, bit 0) and a type field (word 3,
//! bits 15:10). Builders cover the command and transfer TRBs the kernel
//! issues; accessors cover the three event kinds the ISR consumes.

/// TRB type codes (xHCI table 6-91).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrbType {
    Reserved = 0,
    Normal = 1,
    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Isoch = 5,
    Link = 6,
    EventData = 7,
    NoOpTransfer = 8,
    EnableSlot = 9,
    DisableSlot = 10,
    AddressDevice = 11,
    ConfigureEndpoint = 12,
    EvaluateContext = 13,
    NoOpCommand = 23,
    TransferEvent = 32,
    CommandCompletion = 33,
    PortStatusChange = 34,
    BandwidthRequest = 35,
    Doorbell = 36,
    HostController = 37,
    DeviceNotification = 38,
    MfIndexWrap = 39,
}

impl TrbType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Normal,
            2 => Self::SetupStage,
            3 => Self::DataStage,
            4 => Self::StatusStage,
            5 => Self::Isoch,
            6 => Self::Link,
            7 => Self::EventData,
            8 => Self::NoOpTransfer,
            9 => Self::EnableSlot,
            10 => Self::DisableSlot,
            11 => Self::AddressDevice,
            12 => Self::ConfigureEndpoint,
            13 => Self::EvaluateContext,
            23 => Self::NoOpCommand,
            32 => Self::TransferEvent,
            33 => Self::CommandCompletion,
            34 => Self::PortStatusChange,
            35 => Self::BandwidthRequest,
            36 => Self::Doorbell,
            37 => Self::HostController,
            38 => Self::DeviceNotification,
            39 => Self::MfIndexWrap,
            _ => Self::Reserved,
        }
    }
}

/// Completion codes reported in event TRBs (xHCI table 6-90).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionCode {
    Invalid = 0,
    Success = 1,
    DataBufferError = 2,
    BabbleDetected = 3,
    UsbTransactionError = 4,
    TrbError = 5,
    StallError = 6,
    ResourceError = 7,
    BandwidthError = 8,
    NoSlotsAvailable = 9,
    SlotNotEnabled = 11,
    EndpointNotEnabled = 12,
    ShortPacket = 13,
    RingUnderrun = 14,
    RingOverrun = 15,
    ParameterError = 17,
    ContextStateError = 19,
    EventRingFull = 21,
    CommandRingStopped = 24,
    CommandAborted = 25,
    Stopped = 26,
    StoppedLengthInvalid = 27,
    Unknown = 0xFF,
}

impl CompletionCode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Invalid,
            1 => Self::Success,
            2 => Self::DataBufferError,
            3 => Self::BabbleDetected,
            4 => Self::UsbTransactionError,
            5 => Self::TrbError,
            6 => Self::StallError,
            7 => Self::ResourceError,
            8 => Self::BandwidthError,
            9 => Self::NoSlotsAvailable,
            11 => Self::SlotNotEnabled,
            12 => Self::EndpointNotEnabled,
            13 => Self::ShortPacket,
            14 => Self::RingUnderrun,
            15 => Self::RingOverrun,
            17 => Self::ParameterError,
            19 => Self::ContextStateError,
            21 => Self::EventRingFull,
            24 => Self::CommandRingStopped,
            25 => Self::CommandAborted,
            26 => Self::Stopped,
            27 => Self::StoppedLengthInvalid,
            _ => Self::Unknown,
        }
    }

    /// Success or the benign short-packet case.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success | Self::ShortPacket)
    }
}

/// A 16-byte TRB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(16))]
pub struct Trb {
    pub words: [u32; 4],
}

impl Trb {
    pub const fn zeroed() -> Self {
        Self { words: [0; 4] }
    }

    pub fn cycle(&self) -> bool {
        self.words[3] & 1 != 0
    }

    pub fn set_cycle(&mut self, cycle: bool) {
        if cycle {
            self.words[3] |= 1;
        } else {
            self.words[3] &= !1;
        }
    }

    pub fn trb_type(&self) -> TrbType {
        TrbType::from_raw(((self.words[3] >> 10) & 0x3F) as u8)
    }

    fn set_type(&mut self, t: TrbType) {
        self.words[3] = (self.words[3] & !(0x3F << 10)) | ((t as u32) << 10);
    }

    fn set_pointer(&mut self, pointer: u64) {
        self.words[0] = pointer as u32;
        self.words[1] = (pointer >> 32) as u32;
    }

    /// 64-bit parameter (event pointers, segment pointers).
    pub fn pointer(&self) -> u64 {
        self.words[0] as u64 | (self.words[1] as u64) << 32
    }

    // --- event accessors ---

    /// Completion code of an event TRB.
    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode::from_raw((self.words[2] >> 24) as u8)
    }

    /// Slot id of an event TRB.
    pub fn slot_id(&self) -> u8 {
        (self.words[3] >> 24) as u8
    }

    /// Endpoint DCI of a transfer event.
    pub fn endpoint_id(&self) -> u8 {
        ((self.words[3] >> 16) & 0x1F) as u8
    }

    /// Residual transfer length of a transfer event.
    pub fn transfer_length(&self) -> u32 {
        self.words[2] & 0xFF_FFFF
    }

    /// Port id of a port-status-change event.
    pub fn port_id(&self) -> u8 {
        (self.words[0] >> 24) as u8
    }

    // --- command builders ---

    /// Link TRB closing a ring segment back to `segment_base`, with the
    /// toggle-cycle bit set.
    pub fn link(segment_base: u64, cycle: bool) -> Self {
        let mut trb = Self::zeroed();
        trb.set_pointer(segment_base);
        trb.set_type(TrbType::Link);
        trb.words[3] |= 1 << 1; // toggle cycle
        trb.set_cycle(cycle);
        trb
    }

    /// No-op command (liveness checks).
    pub fn no_op_command() -> Self {
        let mut trb = Self::zeroed();
        trb.set_type(TrbType::NoOpCommand);
        trb
    }

    /// Enable Slot for the given protocol slot type.
    pub fn enable_slot(slot_type: u8) -> Self {
        let mut trb = Self::zeroed();
        trb.set_type(TrbType::EnableSlot);
        trb.words[3] |= ((slot_type & 0x1F) as u32) << 16;
        trb
    }

    /// Disable Slot.
    pub fn disable_slot(slot_id: u8) -> Self {
        let mut trb = Self::zeroed();
        trb.set_type(TrbType::DisableSlot);
        trb.words[3] |= (slot_id as u32) << 24;
        trb
    }

    /// Address Device. `bsr` blocks the SET_ADDRESS from reaching the
    /// wire (legacy first attempt).
    pub fn address_device(input_context: u64, slot_id: u8, bsr: bool) -> Self {
        let mut trb = Self::zeroed();
        trb.set_pointer(input_context);
        trb.set_type(TrbType::AddressDevice);
        trb.words[3] |= (slot_id as u32) << 24;
        if bsr {
            trb.words[3] |= 1 << 9;
        }
        trb
    }

    /// Configure Endpoint.
    pub fn configure_endpoint(input_context: u64, slot_id: u8) -> Self {
        let mut trb = Self::zeroed();
        trb.set_pointer(input_context);
        trb.set_type(TrbType::ConfigureEndpoint);
        trb.words[3] |= (slot_id as u32) << 24;
        trb
    }

    // --- transfer builders ---

    /// Setup Stage with immediate data.
    pub fn setup_stage(
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        w_length: u16,
    ) -> Self {
        let mut trb = Self::zeroed();
        trb.words[0] =
            bm_request_type as u32 | (b_request as u32) << 8 | (w_value as u32) << 16;
        trb.words[1] = w_index as u32 | (w_length as u32) << 16;
        trb.words[2] = 8; // setup packets are always 8 bytes
        trb.set_type(TrbType::SetupStage);
        trb.words[3] |= 1 << 6; // immediate data
        // Transfer type: 0 = no data, 2 = OUT data, 3 = IN data.
        let trt = if w_length == 0 {
            0
        } else if bm_request_type & 0x80 != 0 {
            3
        } else {
            2
        };
        trb.words[3] |= trt << 16;
        trb
    }

    /// Data Stage.
    pub fn data_stage(buffer: u64, length: u16, device_to_host: bool) -> Self {
        let mut trb = Self::zeroed();
        trb.set_pointer(buffer);
        trb.words[2] = length as u32;
        trb.set_type(TrbType::DataStage);
        if device_to_host {
            trb.words[3] |= 1 << 16;
        }
        trb
    }

    /// Status Stage with interrupt-on-completion.
    pub fn status_stage(device_to_host: bool) -> Self {
        let mut trb = Self::zeroed();
        trb.set_type(TrbType::StatusStage);
        trb.words[3] |= 1 << 5; // IOC
        if device_to_host {
            trb.words[3] |= 1 << 16;
        }
        trb
    }

    /// Normal TRB with interrupt-on-completion and interrupt-on-short.
    pub fn normal(buffer: u64, length: u32) -> Self {
        let mut trb = Self::zeroed();
        trb.set_pointer(buffer);
        trb.words[2] = length & 0x1_FFFF;
        trb.set_type(TrbType::Normal);
        trb.words[3] |= (1 << 5) | (1 << 2); // IOC | ISP
        trb
    }

    /// Whether this link TRB toggles the consumer cycle.
    pub fn toggles_cycle(&self) -> bool {
        self.words[3] & (1 << 1) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_bit_roundtrip() {
        let mut trb = Trb::zeroed();
        assert!(!trb.cycle());
        trb.set_cycle(true);
        assert!(trb.cycle());
        trb.set_cycle(false);
        assert!(!trb.cycle());
    }

    #[test]
    fn test_link_trb_encoding() {
        let link = Trb::link(0x1234_5670, true);
        assert_eq!(link.trb_type(), TrbType::Link);
        assert_eq!(link.pointer(), 0x1234_5670);
        assert!(link.toggles_cycle());
        assert!(link.cycle());
    }

    #[test]
    fn test_enable_slot_carries_slot_type() {
        let trb = Trb::enable_slot(5);
        assert_eq!(trb.trb_type(), TrbType::EnableSlot);
        assert_eq!((trb.words[3] >> 16) & 0x1F, 5);
    }

    #[test]
    fn test_address_device_bsr_flag() {
        let with = Trb::address_device(0x8000, 3, true);
        let without = Trb::address_device(0x8000, 3, false);
        assert_ne!(with.words[3] & (1 << 9), 0);
        assert_eq!(without.words[3] & (1 << 9), 0);
        assert_eq!(with.slot_id(), 3);
        assert_eq!(with.pointer(), 0x8000);
    }

    #[test]
    fn test_setup_stage_transfer_type() {
        // IN data phase.
        let get = Trb::setup_stage(0x80, 6, 0x0100, 0, 18);
        assert_eq!((get.words[3] >> 16) & 0x3, 3);
        assert_eq!(get.words[2], 8);
        // OUT data phase.
        let set_report = Trb::setup_stage(0x21, 9, 0x0200, 0, 1);
        assert_eq!((set_report.words[3] >> 16) & 0x3, 2);
        // No data phase.
        let set_cfg = Trb::setup_stage(0x00, 9, 1, 0, 0);
        assert_eq!((set_cfg.words[3] >> 16) & 0x3, 0);
    }

    #[test]
    fn test_event_field_extraction() {
        // Synthesize a transfer event: code Success, slot 2, DCI 3,
        // 5 residual bytes.
        let mut event = Trb::zeroed();
        event.words[0] = 0xDEAD_BEE0;
        event.words[2] = (1 << 24) | 5;
        event.words[3] = (2 << 24) | (3 << 16) | ((TrbType::TransferEvent as u32) << 10) | 1;
        assert_eq!(event.trb_type(), TrbType::TransferEvent);
        assert_eq!(event.completion_code(), CompletionCode::Success);
        assert_eq!(event.slot_id(), 2);
        assert_eq!(event.endpoint_id(), 3);
        assert_eq!(event.transfer_length(), 5);
        assert_eq!(event.pointer(), 0xDEAD_BEE0);
    }

    #[test]
    fn test_completion_code_classes() {
        assert!(CompletionCode::Success.is_ok());
        assert!(CompletionCode::ShortPacket.is_ok());
        assert!(!CompletionCode::StallError.is_ok());
        assert_eq!(CompletionCode::from_raw(9), CompletionCode::NoSlotsAvailable);
        assert_eq!(CompletionCode::from_raw(200), CompletionCode::Unknown);
    }
}
