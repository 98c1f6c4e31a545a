//! NOP, SNACK, asynchronous message and Reject headers

use super::{get_lun, get_u16, get_u32, put_lun, put_u16, put_u32, Header, PduParser};
use crate::error::ProtocolError;

/// NOP-Out (0x00)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NopOutParser {
    pub lun: u64,
    pub target_transfer_tag: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

impl PduParser for NopOutParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.lun = get_lun(header);
        self.target_transfer_tag = get_u32(header, 20);
        self.cmd_sn = get_u32(header, 24);
        self.exp_stat_sn = get_u32(header, 28);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        put_lun(header, self.lun);
        put_u32(header, 20, self.target_transfer_tag);
        put_u32(header, 24, self.cmd_sn);
        put_u32(header, 28, self.exp_stat_sn);
    }

    fn logical_unit_number(&self) -> Option<u64> {
        Some(self.lun)
    }

    fn cmd_sn(&self) -> Option<u32> {
        Some(self.cmd_sn)
    }

    fn exp_stat_sn(&self) -> Option<u32> {
        Some(self.exp_stat_sn)
    }
}

/// NOP-In (0x20)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NopInParser {
    pub lun: u64,
    pub target_transfer_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

impl PduParser for NopInParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.lun = get_lun(header);
        self.target_transfer_tag = get_u32(header, 20);
        self.stat_sn = get_u32(header, 24);
        self.exp_cmd_sn = get_u32(header, 28);
        self.max_cmd_sn = get_u32(header, 32);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        put_lun(header, self.lun);
        put_u32(header, 20, self.target_transfer_tag);
        put_u32(header, 24, self.stat_sn);
        put_u32(header, 28, self.exp_cmd_sn);
        put_u32(header, 32, self.max_cmd_sn);
    }

    fn logical_unit_number(&self) -> Option<u64> {
        Some(self.lun)
    }

    fn stat_sn(&self) -> Option<u32> {
        Some(self.stat_sn)
    }

    fn command_window(&self) -> Option<(u32, u32)> {
        Some((self.exp_cmd_sn, self.max_cmd_sn))
    }
}

/// SNACK types (RFC 3720 Section 10.16.1)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnackType {
    #[default]
    DataR2t = 0,
    Status = 1,
    DataAck = 2,
    RData = 3,
}

impl TryFrom<u8> for SnackType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SnackType::DataR2t),
            1 => Ok(SnackType::Status),
            2 => Ok(SnackType::DataAck),
            3 => Ok(SnackType::RData),
            other => Err(ProtocolError::invalid("SNACK type", other)),
        }
    }
}

/// SNACK Request (0x10)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnackRequestParser {
    pub snack_type: SnackType,
    pub lun: u64,
    pub target_transfer_tag: u32,
    pub exp_stat_sn: u32,
    pub beg_run: u32,
    pub run_length: u32,
}

impl PduParser for SnackRequestParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.snack_type = SnackType::try_from(header[1] & 0x0F)?;
        self.lun = get_lun(header);
        self.target_transfer_tag = get_u32(header, 20);
        self.exp_stat_sn = get_u32(header, 28);
        self.beg_run = get_u32(header, 40);
        self.run_length = get_u32(header, 44);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        header[1] |= self.snack_type as u8;
        put_lun(header, self.lun);
        put_u32(header, 20, self.target_transfer_tag);
        put_u32(header, 28, self.exp_stat_sn);
        put_u32(header, 40, self.beg_run);
        put_u32(header, 44, self.run_length);
    }

    fn logical_unit_number(&self) -> Option<u64> {
        Some(self.lun)
    }

    fn exp_stat_sn(&self) -> Option<u32> {
        Some(self.exp_stat_sn)
    }
}

/// Asynchronous events (RFC 3720 Section 10.9.1)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsyncEvent {
    #[default]
    ScsiAsyncEvent = 0,
    LogoutRequest = 1,
    ConnectionDrop = 2,
    SessionDrop = 3,
    NegotiationRequest = 4,
    VendorSpecific = 255,
}

impl TryFrom<u8> for AsyncEvent {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AsyncEvent::ScsiAsyncEvent),
            1 => Ok(AsyncEvent::LogoutRequest),
            2 => Ok(AsyncEvent::ConnectionDrop),
            3 => Ok(AsyncEvent::SessionDrop),
            4 => Ok(AsyncEvent::NegotiationRequest),
            255 => Ok(AsyncEvent::VendorSpecific),
            other => Err(ProtocolError::invalid("AsyncEvent", other)),
        }
    }
}

/// Asynchronous Message (0x32)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsynchronousMessageParser {
    pub lun: u64,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub async_event: AsyncEvent,
    pub async_vcode: u8,
    pub parameter1: u16,
    pub parameter2: u16,
    pub parameter3: u16,
}

impl PduParser for AsynchronousMessageParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.lun = get_lun(header);
        self.stat_sn = get_u32(header, 24);
        self.exp_cmd_sn = get_u32(header, 28);
        self.max_cmd_sn = get_u32(header, 32);
        self.async_event = AsyncEvent::try_from(header[36])?;
        self.async_vcode = header[37];
        self.parameter1 = get_u16(header, 38);
        self.parameter2 = get_u16(header, 40);
        self.parameter3 = get_u16(header, 42);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        put_lun(header, self.lun);
        put_u32(header, 24, self.stat_sn);
        put_u32(header, 28, self.exp_cmd_sn);
        put_u32(header, 32, self.max_cmd_sn);
        header[36] = self.async_event as u8;
        header[37] = self.async_vcode;
        put_u16(header, 38, self.parameter1);
        put_u16(header, 40, self.parameter2);
        put_u16(header, 42, self.parameter3);
    }

    fn logical_unit_number(&self) -> Option<u64> {
        Some(self.lun)
    }

    fn stat_sn(&self) -> Option<u32> {
        Some(self.stat_sn)
    }

    fn command_window(&self) -> Option<(u32, u32)> {
        Some((self.exp_cmd_sn, self.max_cmd_sn))
    }
}

/// Reject reason codes (RFC 3720 Section 10.17.1)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectReason {
    Reserved = 0x01,
    DataDigestError = 0x02,
    SnackReject = 0x03,
    #[default]
    ProtocolError = 0x04,
    CommandNotSupported = 0x05,
    ImmediateCommandReject = 0x06,
    TaskInProgress = 0x07,
    InvalidDataAck = 0x08,
    InvalidPduField = 0x09,
    LongOperationReject = 0x0A,
    NegotiationReset = 0x0B,
    WaitingForLogout = 0x0C,
}

impl TryFrom<u8> for RejectReason {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => RejectReason::Reserved,
            0x02 => RejectReason::DataDigestError,
            0x03 => RejectReason::SnackReject,
            0x04 => RejectReason::ProtocolError,
            0x05 => RejectReason::CommandNotSupported,
            0x06 => RejectReason::ImmediateCommandReject,
            0x07 => RejectReason::TaskInProgress,
            0x08 => RejectReason::InvalidDataAck,
            0x09 => RejectReason::InvalidPduField,
            0x0A => RejectReason::LongOperationReject,
            0x0B => RejectReason::NegotiationReset,
            0x0C => RejectReason::WaitingForLogout,
            other => return Err(ProtocolError::invalid("Reject reason", other)),
        })
    }
}

/// Reject (0x3F); the data segment carries the offending header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RejectParser {
    pub reason: RejectReason,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data_sn_or_r2t_sn: u32,
}

impl PduParser for RejectParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.reason = RejectReason::try_from(header[2])?;
        self.stat_sn = get_u32(header, 24);
        self.exp_cmd_sn = get_u32(header, 28);
        self.max_cmd_sn = get_u32(header, 32);
        self.data_sn_or_r2t_sn = get_u32(header, 36);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        header[2] = self.reason as u8;
        put_u32(header, 24, self.stat_sn);
        put_u32(header, 28, self.exp_cmd_sn);
        put_u32(header, 32, self.max_cmd_sn);
        put_u32(header, 36, self.data_sn_or_r2t_sn);
    }

    fn stat_sn(&self) -> Option<u32> {
        Some(self.stat_sn)
    }

    fn command_window(&self) -> Option<(u32, u32)> {
        Some((self.exp_cmd_sn, self.max_cmd_sn))
    }
}
