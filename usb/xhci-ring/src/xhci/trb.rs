use std::convert::TryFrom;
use std::fmt;
use std::sync::atomic::{fence, Ordering};

use common::io::{Io, Mmio};
use log::trace;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbType {
    Reserved,
    /* Transfer */
    Normal,
    SetupStage,
    DataStage,
    StatusStage,
    Isoch,
    Link,
    EventData,
    NoOp,
    /* Command */
    EnableSlot,
    DisableSlot,
    AddressDevice,
    ConfigureEndpoint,
    EvaluateContext,
    ResetEndpoint,
    StopEndpoint,
    SetTrDequeuePointer,
    ResetDevice,
    ForceEvent,
    NegotiateBandwidth,
    SetLatencyToleranceValue,
    GetPortBandwidth,
    ForceHeader,
    NoOpCmd,
    /* Reserved */
    GetExtendedProperty,
    SetExtendedProperty,
    Rsv26,
    Rsv27,
    Rsv28,
    Rsv29,
    Rsv30,
    Rsv31,
    /* Events */
    Transfer,
    CommandCompletion,
    PortStatusChange,
    BandwidthRequest,
    Doorbell,
    HostController,
    DeviceNotification,
    MfindexWrap,
    /* Reserved from 40 to 47, vendor defined from 48 to 63 */
}

/// First vendor defined TRB type.
pub const TRB_VENDOR_DEFINED_LOW: u8 = 48;
/// Command completion event of NEC controllers.
pub const TRB_NEC_CMD_COMP: u8 = 48;

impl TryFrom<u8> for TrbType {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, u8> {
        use TrbType::*;

        const TYPES: [TrbType; 40] = [
            Reserved,
            Normal,
            SetupStage,
            DataStage,
            StatusStage,
            Isoch,
            Link,
            EventData,
            NoOp,
            EnableSlot,
            DisableSlot,
            AddressDevice,
            ConfigureEndpoint,
            EvaluateContext,
            ResetEndpoint,
            StopEndpoint,
            SetTrDequeuePointer,
            ResetDevice,
            ForceEvent,
            NegotiateBandwidth,
            SetLatencyToleranceValue,
            GetPortBandwidth,
            ForceHeader,
            NoOpCmd,
            GetExtendedProperty,
            SetExtendedProperty,
            Rsv26,
            Rsv27,
            Rsv28,
            Rsv29,
            Rsv30,
            Rsv31,
            Transfer,
            CommandCompletion,
            PortStatusChange,
            BandwidthRequest,
            Doorbell,
            HostController,
            DeviceNotification,
            MfindexWrap,
        ];
        TYPES.get(usize::from(raw)).copied().ok_or(raw)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrbCompletionCode {
    Invalid = 0x00,
    Success = 0x01,
    DataBuffer = 0x02,
    BabbleDetected = 0x03,
    UsbTransaction = 0x04,
    Trb = 0x05,
    Stall = 0x06,
    Resource = 0x07,
    Bandwidth = 0x08,
    NoSlotsAvailable = 0x09,
    InvalidStreamType = 0x0A,
    SlotNotEnabled = 0x0B,
    EndpointNotEnabled = 0x0C,
    ShortPacket = 0x0D,
    RingUnderrun = 0x0E,
    RingOverrun = 0x0F,
    VfEventRingFull = 0x10,
    Parameter = 0x11,
    BandwidthOverrun = 0x12,
    ContextState = 0x13,
    NoPingResponse = 0x14,
    EventRingFull = 0x15,
    IncompatibleDevice = 0x16,
    MissedService = 0x17,
    CommandRingStopped = 0x18,
    CommandAborted = 0x19,
    Stopped = 0x1A,
    StoppedLengthInvalid = 0x1B,
    StoppedShortPacket = 0x1C,
    MaxExitLatencyTooLarge = 0x1D,
    Rsv30 = 0x1E,
    IsochBuffer = 0x1F,
    EventLost = 0x20,
    Undefined = 0x21,
    InvalidStreamId = 0x22,
    SecondaryBandwidth = 0x23,
    SplitTransaction = 0x24,
    /* Values from 37 to 191 are reserved */
    /* 192 to 223 are vendor defined errors */
    /* 224 to 255 are vendor defined information */
}

pub const VENDOR_INFO_CODE_LOW: u8 = 224;

impl TrbCompletionCode {
    /// Vendor defined information codes report success with extra information.
    pub fn is_vendor_info(raw: u8) -> bool {
        raw >= VENDOR_INFO_CODE_LOW
    }
}

impl TryFrom<u8> for TrbCompletionCode {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, u8> {
        use TrbCompletionCode::*;

        const CODES: [TrbCompletionCode; 37] = [
            Invalid,
            Success,
            DataBuffer,
            BabbleDetected,
            UsbTransaction,
            Trb,
            Stall,
            Resource,
            Bandwidth,
            NoSlotsAvailable,
            InvalidStreamType,
            SlotNotEnabled,
            EndpointNotEnabled,
            ShortPacket,
            RingUnderrun,
            RingOverrun,
            VfEventRingFull,
            Parameter,
            BandwidthOverrun,
            ContextState,
            NoPingResponse,
            EventRingFull,
            IncompatibleDevice,
            MissedService,
            CommandRingStopped,
            CommandAborted,
            Stopped,
            StoppedLengthInvalid,
            StoppedShortPacket,
            MaxExitLatencyTooLarge,
            Rsv30,
            IsochBuffer,
            EventLost,
            Undefined,
            InvalidStreamId,
            SecondaryBandwidth,
            SplitTransaction,
        ];
        CODES.get(usize::from(raw)).copied().ok_or(raw)
    }
}

/// Transfer Type field of a Setup Stage TRB (XHCI 6.4.1.2.1).
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferKind {
    NoData,
    Reserved,
    Out,
    In,
}

pub const TRB_CYCLE: u32 = 1 << 0;
pub const TRB_ENT: u32 = 1 << 1;
pub const TRB_ISP: u32 = 1 << 2;
pub const TRB_CHAIN: u32 = 1 << 4;
pub const TRB_IOC: u32 = 1 << 5;
pub const TRB_IDT: u32 = 1 << 6;
pub const TRB_TSP: u32 = 1 << 9;
pub const TRB_BEI: u32 = 1 << 9;
pub const TRB_DIR_IN: u32 = 1 << 16;
pub const TRB_SIA: u32 = 1 << 31;
pub const LINK_TOGGLE: u32 = 1 << 1;

pub const TRB_MAX_BUFF_SHIFT: u32 = 16;
pub const TRB_MAX_BUFF_SIZE: u32 = 1 << TRB_MAX_BUFF_SHIFT;
/// The transfer length field of transfer TRBs is 17 bits wide.
pub const TRB_LEN_MASK: u32 = 0x1_FFFF;

pub const TRB_STATUS_COMPLETION_CODE_SHIFT: u8 = 24;
pub const TRB_STATUS_COMPLETION_CODE_MASK: u32 = 0xFF00_0000;

pub const TRB_STATUS_COMPLETION_PARAM_SHIFT: u8 = 0;
pub const TRB_STATUS_COMPLETION_PARAM_MASK: u32 = 0x00FF_FFFF;

pub const TRB_STATUS_TRANSFER_LENGTH_SHIFT: u8 = 0;
pub const TRB_STATUS_TRANSFER_LENGTH_MASK: u32 = 0x00FF_FFFF;

pub const TRB_CONTROL_TRB_TYPE_SHIFT: u8 = 10;
pub const TRB_CONTROL_TRB_TYPE_MASK: u32 = 0x0000_FC00;


pub const TRB_CONTROL_ENDPOINT_ID_MASK: u32 = 0x001F_0000;
pub const TRB_CONTROL_ENDPOINT_ID_SHIFT: u8 = 16;

pub const TRB_CONTROL_SUSPEND_BIT: u32 = 1 << 23;

pub const fn trb_type(ty: TrbType) -> u32 {
    (ty as u32) << TRB_CONTROL_TRB_TYPE_SHIFT
}
pub const fn trb_len(len: u32) -> u32 {
    len & TRB_LEN_MASK
}
/// TD Size, the number of packets remaining after this TRB, saturating at 31.
pub fn trb_td_size(packets: u32) -> u32 {
    packets.min(31) << 17
}
pub const fn trb_intr_target(interrupter: u32) -> u32 {
    (interrupter & 0x3FF) << 22
}
pub const fn trb_tx_type(kind: TransferKind) -> u32 {
    (kind as u32) << 16
}
/// Transfer Burst Count of an Isoch TRB.
pub const fn trb_tbc(bursts: u32) -> u32 {
    (bursts & 0x3) << 7
}
/// Transfer Last Burst Packet Count of an Isoch TRB.
pub const fn trb_tlbpc(packets: u32) -> u32 {
    (packets & 0xF) << 16
}
pub const fn trb_frame_id(frame: u32) -> u32 {
    (frame & 0x7FF) << 20
}

#[repr(C, align(16))]
pub struct Trb {
    pub data_low: Mmio<u32>,
    pub data_high: Mmio<u32>,
    pub status: Mmio<u32>,
    pub control: Mmio<u32>,
}
impl Clone for Trb {
    fn clone(&self) -> Self {
        Self::from_fields(self.fields())
    }
}
impl Default for Trb {
    fn default() -> Self {
        Self::from_fields([0; 4])
    }
}

impl Trb {
    pub fn from_fields(fields: [u32; 4]) -> Self {
        Self {
            data_low: Mmio::new(fields[0]),
            data_high: Mmio::new(fields[1]),
            status: Mmio::new(fields[2]),
            control: Mmio::new(fields[3]),
        }
    }

    pub fn fields(&self) -> [u32; 4] {
        [
            self.data_low.read(),
            self.data_high.read(),
            self.status.read(),
            self.control.read(),
        ]
    }

    pub fn set(&mut self, data: u64, status: u32, control: u32) {
        self.data_low.write(data as u32);
        self.data_high.write((data >> 32) as u32);
        self.status.write(status);
        self.control.write(control);
    }

    /// Copies `fields` into this slot such that the control dword, which holds the cycle bit,
    /// becomes visible last.
    pub fn publish(&mut self, fields: [u32; 4]) {
        self.data_low.write(fields[0]);
        self.data_high.write(fields[1]);
        self.status.write(fields[2]);
        fence(Ordering::Release);
        self.control.write(fields[3]);
    }

    pub fn read_data(&self) -> u64 {
        (self.data_low.read() as u64) | ((self.data_high.read() as u64) << 32)
    }

    pub fn completion_code(&self) -> u8 {
        (self.status.read() >> TRB_STATUS_COMPLETION_CODE_SHIFT) as u8
    }
    pub fn completion_param(&self) -> u32 {
        self.status.read() & TRB_STATUS_COMPLETION_PARAM_MASK
    }
    fn has_completion_trb_pointer(&self) -> bool {
        let code = self.completion_code();
        code != TrbCompletionCode::RingUnderrun as u8
            && code != TrbCompletionCode::RingOverrun as u8
            && code != TrbCompletionCode::VfEventRingFull as u8
    }
    pub fn completion_trb_pointer(&self) -> Option<u64> {
        if self.has_completion_trb_pointer() {
            Some(self.read_data())
        } else {
            None
        }
    }
    pub fn transfer_event_trb_pointer(&self) -> Option<u64> {
        debug_assert_eq!(self.trb_type(), TrbType::Transfer as u8);

        if self.has_completion_trb_pointer() {
            Some(self.read_data())
        } else {
            None
        }
    }

    pub fn port_status_change_port_id(&self) -> u8 {
        debug_assert_eq!(self.trb_type(), TrbType::PortStatusChange as u8);
        ((self.read_data() >> 24) & 0xFF) as u8
    }
    pub fn device_notification_type(&self) -> u8 {
        ((self.data_low.read() >> 4) & 0xF) as u8
    }

    pub fn event_slot(&self) -> u8 {
        (self.control.read() >> 24) as u8
    }
    /// Returns the number of bytes that should have been transmitted, but weren't.
    pub fn transfer_length(&self) -> u32 {
        self.status.read() & TRB_STATUS_TRANSFER_LENGTH_MASK
    }
    /// The length field of a transfer TRB.
    pub fn buffer_length(&self) -> u32 {
        self.status.read() & TRB_LEN_MASK
    }
    pub fn endpoint_id(&self) -> u8 {
        ((self.control.read() & TRB_CONTROL_ENDPOINT_ID_MASK) >> TRB_CONTROL_ENDPOINT_ID_SHIFT)
            as u8
    }
    pub fn trb_type(&self) -> u8 {
        ((self.control.read() & TRB_CONTROL_TRB_TYPE_MASK) >> TRB_CONTROL_TRB_TYPE_SHIFT) as u8
    }
    pub fn trb_type_checked(&self) -> Option<TrbType> {
        TrbType::try_from(self.trb_type()).ok()
    }

    pub fn cycle(&self) -> bool {
        self.control.readf(TRB_CYCLE)
    }
    pub fn set_cycle(&mut self, cycle: bool) {
        self.control.writef(TRB_CYCLE, cycle);
    }
    pub fn toggle_cycle(&mut self) {
        let control = self.control.read();
        self.control.write(control ^ TRB_CYCLE);
    }
    pub fn chain(&self) -> bool {
        self.control.readf(TRB_CHAIN)
    }

    pub fn is_link(&self) -> bool {
        self.trb_type() == TrbType::Link as u8
    }
    pub fn link_toggles_cycle(&self) -> bool {
        self.control.readf(LINK_TOGGLE)
    }
    pub fn is_noop(&self) -> bool {
        self.trb_type() == TrbType::NoOp as u8 || self.trb_type() == TrbType::NoOpCmd as u8
    }

    /// Turns this TRB into a no-op of `noop` type, preserving its cycle bit. Link TRBs only lose
    /// their chain bit.
    pub fn to_noop(&mut self, noop: TrbType) {
        if self.is_link() {
            self.control.writef(TRB_CHAIN, false);
        } else {
            let cycle = self.control.read() & TRB_CYCLE;
            self.data_low.write(0);
            self.data_high.write(0);
            self.status.write(0);
            self.control.write(cycle | trb_type(noop));
        }
    }

    pub fn link(&mut self, address: u64, toggle: bool, chain: bool, cycle: bool) {
        self.set(
            address,
            0,
            trb_type(TrbType::Link)
                | (u32::from(chain) << 4)
                | (u32::from(toggle) << 1)
                | u32::from(cycle),
        );
    }

    pub fn no_op_cmd(&mut self, cycle: bool) {
        self.set(0, 0, trb_type(TrbType::NoOpCmd) | (cycle as u32));
    }

    pub fn enable_slot(&mut self, slot_type: u8, cycle: bool) {
        trace!("Enabling slot with type {}", slot_type);
        self.set(
            0,
            0,
            (((slot_type as u32) & 0x1F) << 16) | trb_type(TrbType::EnableSlot) | (cycle as u32),
        );
    }
    pub fn disable_slot(&mut self, slot: u8, cycle: bool) {
        self.set(
            0,
            0,
            (u32::from(slot) << 24) | trb_type(TrbType::DisableSlot) | u32::from(cycle),
        );
    }

    pub fn address_device(&mut self, slot_id: u8, input_ctx_ptr: u64, bsr: bool, cycle: bool) {
        self.set(
            input_ctx_ptr & !0xF,
            0,
            (u32::from(slot_id) << 24)
                | trb_type(TrbType::AddressDevice)
                | (u32::from(bsr) << 9)
                | u32::from(cycle),
        );
    }
    pub fn configure_endpoint(
        &mut self,
        slot_id: u8,
        input_ctx_ptr: u64,
        deconfigure: bool,
        cycle: bool,
    ) {
        self.set(
            input_ctx_ptr & !0xF,
            0,
            (u32::from(slot_id) << 24)
                | trb_type(TrbType::ConfigureEndpoint)
                | (u32::from(deconfigure) << 9)
                | u32::from(cycle),
        );
    }
    pub fn evaluate_context(&mut self, slot_id: u8, input_ctx_ptr: u64, cycle: bool) {
        self.set(
            input_ctx_ptr & !0xF,
            0,
            (u32::from(slot_id) << 24) | trb_type(TrbType::EvaluateContext) | u32::from(cycle),
        );
    }
    pub fn reset_endpoint(&mut self, slot_id: u8, endp_num_xhc: u8, tsp: bool, cycle: bool) {
        debug_assert_eq!(endp_num_xhc & 0x1F, endp_num_xhc);
        self.set(
            0,
            0,
            (u32::from(slot_id) << 24)
                | (u32::from(endp_num_xhc) << 16)
                | trb_type(TrbType::ResetEndpoint)
                | (u32::from(tsp) << 9)
                | u32::from(cycle),
        );
    }
    /// The deque_ptr has to contain the DCS bit (bit 0).
    pub fn set_tr_deque_ptr(
        &mut self,
        deque_ptr: u64,
        cycle: bool,
        stream_id: u16,
        endp_num_xhc: u8,
        slot: u8,
    ) {
        debug_assert_eq!(deque_ptr & 0xFFFF_FFFF_FFFF_FFF1, deque_ptr);
        debug_assert_eq!(endp_num_xhc & 0x1F, endp_num_xhc);

        self.set(
            deque_ptr,
            u32::from(stream_id) << 16,
            (u32::from(slot) << 24)
                | (u32::from(endp_num_xhc) << 16)
                | trb_type(TrbType::SetTrDequeuePointer)
                | u32::from(cycle),
        )
    }
    pub fn stop_endpoint(&mut self, slot_id: u8, endp_num_xhc: u8, suspend: bool, cycle: bool) {
        debug_assert_eq!(endp_num_xhc & 0x1F, endp_num_xhc);
        self.set(
            0,
            0,
            (u32::from(slot_id) << 24)
                | (u32::from(suspend) << 23)
                | (u32::from(endp_num_xhc) << 16)
                | trb_type(TrbType::StopEndpoint)
                | u32::from(cycle),
        );
    }
    pub fn reset_device(&mut self, slot_id: u8, cycle: bool) {
        self.set(
            0,
            0,
            (u32::from(slot_id) << 24) | trb_type(TrbType::ResetDevice) | u32::from(cycle),
        );
    }

    /// Setup Stage TRB with the 8 byte request as immediate data.
    pub fn setup(&mut self, setup: u64, transfer: TransferKind, cycle: bool) {
        self.set(
            setup,
            trb_len(8) | trb_intr_target(0),
            trb_tx_type(transfer) | trb_type(TrbType::SetupStage) | TRB_IDT | (cycle as u32),
        );
    }

    pub fn data(&mut self, buffer: u64, length: u32, td_size: u32, input: bool, cycle: bool) {
        self.set(
            buffer,
            trb_len(length) | trb_td_size(td_size) | trb_intr_target(0),
            (u32::from(input) << 16)
                | (u32::from(input) << 2)
                | trb_type(TrbType::DataStage)
                | (cycle as u32),
        );
    }

    pub fn status(
        &mut self,
        interrupter: u16,
        input: bool,
        ioc: bool,
        ch: bool,
        ent: bool,
        cycle: bool,
    ) {
        self.set(
            0,
            u32::from(interrupter) << 22,
            (u32::from(input) << 16)
                | trb_type(TrbType::StatusStage)
                | (u32::from(ioc) << 5)
                | (u32::from(ch) << 4)
                | (u32::from(ent) << 1)
                | (cycle as u32),
        );
    }
    #[allow(clippy::too_many_arguments)]
    pub fn normal(
        &mut self,
        buffer: u64,
        len: u32,
        cycle: bool,
        estimated_td_size: u32,
        interrupter: u8,
        ent: bool,
        isp: bool,
        chain: bool,
        ioc: bool,
        idt: bool,
        bei: bool,
    ) {
        // NOTE: The no snoop flag has been omitted.
        self.set(
            buffer,
            trb_len(len) | trb_td_size(estimated_td_size) | trb_intr_target(interrupter.into()),
            u32::from(cycle)
                | (u32::from(ent) << 1)
                | (u32::from(isp) << 2)
                | (u32::from(chain) << 4)
                | (u32::from(ioc) << 5)
                | (u32::from(idt) << 6)
                | (u32::from(bei) << 9)
                | trb_type(TrbType::Normal),
        )
    }
    pub fn is_command_trb(&self) -> bool {
        let valid_trb_types = [
            TrbType::NoOpCmd as u8,
            TrbType::EnableSlot as u8,
            TrbType::DisableSlot as u8,
            TrbType::AddressDevice as u8,
            TrbType::ConfigureEndpoint as u8,
            TrbType::EvaluateContext as u8,
            TrbType::ResetEndpoint as u8,
            TrbType::StopEndpoint as u8,
            TrbType::SetTrDequeuePointer as u8,
            TrbType::ResetDevice as u8,
            TrbType::ForceEvent as u8,
            TrbType::NegotiateBandwidth as u8,
            TrbType::SetLatencyToleranceValue as u8,
            TrbType::GetPortBandwidth as u8,
            TrbType::ForceHeader as u8,
            TrbType::GetExtendedProperty as u8,
            TrbType::SetExtendedProperty as u8,
        ];
        valid_trb_types.contains(&self.trb_type())
    }
}

impl fmt::Debug for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Trb {{ data: {:>016X}, status: {:>08X}, control: {:>08X} }}",
            self.read_data(),
            self.status.read(),
            self.control.read()
        )
    }
}

impl fmt::Display for Trb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({:>016X}, {:>08X}, {:>08X})",
            self.read_data(),
            self.status.read(),
            self.control.read()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn trb_layout() {
        assert_eq!(mem::size_of::<Trb>(), 16);
        assert_eq!(mem::align_of::<Trb>(), 16);
    }

    #[test]
    fn noop_keeps_cycle() {
        let mut trb = Trb::default();
        trb.normal(0x1000, 512, true, 0, 0, false, true, true, false, false, false);
        trb.to_noop(TrbType::NoOp);
        assert_eq!(trb.fields(), [0, 0, 0, trb_type(TrbType::NoOp) | TRB_CYCLE]);

        let mut link = Trb::default();
        link.link(0x2000, true, true, false);
        link.to_noop(TrbType::NoOp);
        assert!(link.is_link());
        assert!(!link.chain());
        assert!(link.link_toggles_cycle());
    }

    #[test]
    fn command_fields() {
        let mut trb = Trb::default();
        trb.stop_endpoint(3, 2, false, true);
        assert_eq!(trb.event_slot(), 3);
        assert_eq!(trb.endpoint_id(), 2);
        assert_eq!(trb.trb_type_checked(), Some(TrbType::StopEndpoint));
        assert!(trb.cycle());
        assert!(trb.is_command_trb());
    }

    #[test]
    fn decode_codes() {
        assert_eq!(
            TrbCompletionCode::try_from(0x24),
            Ok(TrbCompletionCode::SplitTransaction)
        );
        assert_eq!(TrbCompletionCode::try_from(0x25), Err(0x25));
        assert_eq!(TrbType::try_from(33), Ok(TrbType::CommandCompletion));
        assert_eq!(TrbType::try_from(48), Err(48));
        assert!(TrbCompletionCode::is_vendor_info(230));
    }
}
