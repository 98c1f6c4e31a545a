//! Opcode-specific parts of the Basic Header Segment
//!
//! Each opcode owns bytes 1-3, 8-15 and 20-47 of the BHS. A [`Parser`]
//! variant holds those fields for one opcode; [`recognize`] is the closed
//! table mapping an opcode to the constructor of its variant.

mod control;
mod login;
mod scsi;

pub use control::{
    AsyncEvent, AsynchronousMessageParser, NopInParser, NopOutParser, RejectParser, RejectReason,
    SnackRequestParser, SnackType,
};
pub use login::{
    LoginRequestParser, LoginResponseParser, LoginStage, LogoutReason, LogoutRequestParser,
    LogoutResponseParser, TextRequestParser, TextResponseParser,
};
pub use scsi::{
    DataInParser, DataOutParser, Ready2TransferParser, ScsiCommandParser, ScsiResponseParser,
    TaskAttribute, TaskManagementFunction, TaskManagementFunctionRequestParser,
    TaskManagementFunctionResponseParser, TmfResponse,
};

use crate::error::ProtocolError;
use crate::pdu::{Opcode, BHS_SIZE};
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// Header bytes as handed to a parser
pub type Header = [u8; BHS_SIZE];

/// Opcode-specific header handling
pub trait PduParser: fmt::Debug {
    /// Pull this opcode's fields out of the header
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError>;

    /// Write this opcode's fields into a header whose other bytes are set
    fn serialize(&self, header: &mut Header);

    /// Cross-field rules that a single field decode can't see
    fn check_integrity(&self, _final_flag: bool) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Raw LUN field, for PDUs that carry one
    fn logical_unit_number(&self) -> Option<u64> {
        None
    }

    fn cmd_sn(&self) -> Option<u32> {
        None
    }

    fn exp_stat_sn(&self) -> Option<u32> {
        None
    }

    fn stat_sn(&self) -> Option<u32> {
        None
    }

    /// ExpCmdSN and MaxCmdSN carried by target PDUs
    fn command_window(&self) -> Option<(u32, u32)> {
        None
    }
}

/// Opcode-specific fields of one PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parser {
    NopOut(NopOutParser),
    ScsiCommand(ScsiCommandParser),
    TaskManagementRequest(TaskManagementFunctionRequestParser),
    LoginRequest(LoginRequestParser),
    TextRequest(TextRequestParser),
    DataOut(DataOutParser),
    LogoutRequest(LogoutRequestParser),
    SnackRequest(SnackRequestParser),
    NopIn(NopInParser),
    ScsiResponse(ScsiResponseParser),
    TaskManagementResponse(TaskManagementFunctionResponseParser),
    LoginResponse(LoginResponseParser),
    TextResponse(TextResponseParser),
    DataIn(DataInParser),
    LogoutResponse(LogoutResponseParser),
    Ready2Transfer(Ready2TransferParser),
    AsyncMessage(AsynchronousMessageParser),
    Reject(RejectParser),
}

/// Constructor of an empty parser variant
pub type ParserConstructor = fn() -> Parser;

/// Parser constructor for an opcode
pub fn recognize(opcode: Opcode) -> ParserConstructor {
    match opcode {
        Opcode::NopOut => || Parser::NopOut(NopOutParser::default()),
        Opcode::ScsiCommand => || Parser::ScsiCommand(ScsiCommandParser::default()),
        Opcode::TaskManagementRequest => {
            || Parser::TaskManagementRequest(TaskManagementFunctionRequestParser::default())
        }
        Opcode::LoginRequest => || Parser::LoginRequest(LoginRequestParser::default()),
        Opcode::TextRequest => || Parser::TextRequest(TextRequestParser::default()),
        Opcode::ScsiDataOut => || Parser::DataOut(DataOutParser::default()),
        Opcode::LogoutRequest => || Parser::LogoutRequest(LogoutRequestParser::default()),
        Opcode::SnackRequest => || Parser::SnackRequest(SnackRequestParser::default()),
        Opcode::NopIn => || Parser::NopIn(NopInParser::default()),
        Opcode::ScsiResponse => || Parser::ScsiResponse(ScsiResponseParser::default()),
        Opcode::TaskManagementResponse => {
            || Parser::TaskManagementResponse(TaskManagementFunctionResponseParser::default())
        }
        Opcode::LoginResponse => || Parser::LoginResponse(LoginResponseParser::default()),
        Opcode::TextResponse => || Parser::TextResponse(TextResponseParser::default()),
        Opcode::ScsiDataIn => || Parser::DataIn(DataInParser::default()),
        Opcode::LogoutResponse => || Parser::LogoutResponse(LogoutResponseParser::default()),
        Opcode::Ready2Transfer => || Parser::Ready2Transfer(Ready2TransferParser::default()),
        Opcode::AsyncMessage => || Parser::AsyncMessage(AsynchronousMessageParser::default()),
        Opcode::Reject => || Parser::Reject(RejectParser::default()),
    }
}

impl Parser {
    /// Decode and check the opcode-specific fields of `header`
    pub fn decode(opcode: Opcode, header: &Header, final_flag: bool) -> Result<Parser, ProtocolError> {
        let mut parser = recognize(opcode)();
        parser.as_dyn_mut().deserialize(header)?;
        parser.as_dyn().check_integrity(final_flag)?;
        Ok(parser)
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Parser::NopOut(_) => Opcode::NopOut,
            Parser::ScsiCommand(_) => Opcode::ScsiCommand,
            Parser::TaskManagementRequest(_) => Opcode::TaskManagementRequest,
            Parser::LoginRequest(_) => Opcode::LoginRequest,
            Parser::TextRequest(_) => Opcode::TextRequest,
            Parser::DataOut(_) => Opcode::ScsiDataOut,
            Parser::LogoutRequest(_) => Opcode::LogoutRequest,
            Parser::SnackRequest(_) => Opcode::SnackRequest,
            Parser::NopIn(_) => Opcode::NopIn,
            Parser::ScsiResponse(_) => Opcode::ScsiResponse,
            Parser::TaskManagementResponse(_) => Opcode::TaskManagementResponse,
            Parser::LoginResponse(_) => Opcode::LoginResponse,
            Parser::TextResponse(_) => Opcode::TextResponse,
            Parser::DataIn(_) => Opcode::ScsiDataIn,
            Parser::LogoutResponse(_) => Opcode::LogoutResponse,
            Parser::Ready2Transfer(_) => Opcode::Ready2Transfer,
            Parser::AsyncMessage(_) => Opcode::AsyncMessage,
            Parser::Reject(_) => Opcode::Reject,
        }
    }

    fn as_dyn(&self) -> &dyn PduParser {
        match self {
            Parser::NopOut(p) => p,
            Parser::ScsiCommand(p) => p,
            Parser::TaskManagementRequest(p) => p,
            Parser::LoginRequest(p) => p,
            Parser::TextRequest(p) => p,
            Parser::DataOut(p) => p,
            Parser::LogoutRequest(p) => p,
            Parser::SnackRequest(p) => p,
            Parser::NopIn(p) => p,
            Parser::ScsiResponse(p) => p,
            Parser::TaskManagementResponse(p) => p,
            Parser::LoginResponse(p) => p,
            Parser::TextResponse(p) => p,
            Parser::DataIn(p) => p,
            Parser::LogoutResponse(p) => p,
            Parser::Ready2Transfer(p) => p,
            Parser::AsyncMessage(p) => p,
            Parser::Reject(p) => p,
        }
    }

    fn as_dyn_mut(&mut self) -> &mut dyn PduParser {
        match self {
            Parser::NopOut(p) => p,
            Parser::ScsiCommand(p) => p,
            Parser::TaskManagementRequest(p) => p,
            Parser::LoginRequest(p) => p,
            Parser::TextRequest(p) => p,
            Parser::DataOut(p) => p,
            Parser::LogoutRequest(p) => p,
            Parser::SnackRequest(p) => p,
            Parser::NopIn(p) => p,
            Parser::ScsiResponse(p) => p,
            Parser::TaskManagementResponse(p) => p,
            Parser::LoginResponse(p) => p,
            Parser::TextResponse(p) => p,
            Parser::DataIn(p) => p,
            Parser::LogoutResponse(p) => p,
            Parser::Ready2Transfer(p) => p,
            Parser::AsyncMessage(p) => p,
            Parser::Reject(p) => p,
        }
    }

    pub fn serialize(&self, header: &mut Header) {
        self.as_dyn().serialize(header)
    }

    pub fn check_integrity(&self, final_flag: bool) -> Result<(), ProtocolError> {
        self.as_dyn().check_integrity(final_flag)
    }

    /// Logical unit number addressed by this PDU, decoded from the LUN field
    pub fn lun(&self) -> Option<u64> {
        self.as_dyn().logical_unit_number().map(lun::decode)
    }

    pub fn cmd_sn(&self) -> Option<u32> {
        self.as_dyn().cmd_sn()
    }

    pub fn exp_stat_sn(&self) -> Option<u32> {
        self.as_dyn().exp_stat_sn()
    }

    pub fn stat_sn(&self) -> Option<u32> {
        self.as_dyn().stat_sn()
    }

    pub fn command_window(&self) -> Option<(u32, u32)> {
        self.as_dyn().command_window()
    }
}

/// SAM LUN field encoding (single level, peripheral or flat addressing)
pub mod lun {
    const FLAT_SPACE: u64 = 0x4000;

    /// Encode a logical unit number into the 8-byte LUN field
    pub fn encode(lun: u64) -> u64 {
        if lun < 256 {
            lun << 48
        } else {
            (FLAT_SPACE | (lun & 0x3FFF)) << 48
        }
    }

    /// Logical unit number from the 8-byte LUN field
    pub fn decode(field: u64) -> u64 {
        (field >> 48) & 0x3FFF
    }
}

pub(crate) fn get_u16(header: &Header, offset: usize) -> u16 {
    BigEndian::read_u16(&header[offset..offset + 2])
}

pub(crate) fn put_u16(header: &mut Header, offset: usize, value: u16) {
    BigEndian::write_u16(&mut header[offset..offset + 2], value)
}

pub(crate) fn get_u32(header: &Header, offset: usize) -> u32 {
    BigEndian::read_u32(&header[offset..offset + 4])
}

pub(crate) fn put_u32(header: &mut Header, offset: usize, value: u32) {
    BigEndian::write_u32(&mut header[offset..offset + 4], value)
}

pub(crate) fn get_lun(header: &Header) -> u64 {
    BigEndian::read_u64(&header[8..16])
}

pub(crate) fn put_lun(header: &mut Header, value: u64) {
    BigEndian::write_u64(&mut header[8..16], value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DigestType;
    use crate::pdu::ProtocolDataUnit;

    /// Serialize, parse back, and compare both the value and the bytes
    fn assert_roundtrip(pdu: ProtocolDataUnit) {
        let bytes = pdu.serialize();
        let parsed = ProtocolDataUnit::deserialize(&bytes, DigestType::None, DigestType::None)
            .unwrap_or_else(|e| panic!("{} failed to parse: {}", pdu.opcode().name(), e));
        assert_eq!(parsed, pdu, "{} changed across a round trip", pdu.opcode().name());
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn test_every_opcode_roundtrips() {
        let mut cdb = [0u8; 16];
        cdb[0] = 0x28;
        cdb[8] = 8;

        let parsers = vec![
            Parser::NopOut(NopOutParser {
                lun: lun::encode(1),
                target_transfer_tag: 0xFFFF_FFFF,
                cmd_sn: 5,
                exp_stat_sn: 6,
            }),
            Parser::ScsiCommand(ScsiCommandParser {
                read: true,
                write: false,
                task_attribute: TaskAttribute::Ordered,
                lun: lun::encode(3),
                expected_data_transfer_length: 4096,
                cmd_sn: 100,
                exp_stat_sn: 7,
                cdb,
            }),
            Parser::TaskManagementRequest(TaskManagementFunctionRequestParser {
                function: TaskManagementFunction::AbortTask,
                lun: lun::encode(0),
                referenced_task_tag: 0x33,
                cmd_sn: 9,
                exp_stat_sn: 2,
                ref_cmd_sn: 8,
                exp_data_sn: 0,
            }),
            Parser::LoginRequest(LoginRequestParser {
                continue_flag: false,
                current_stage: LoginStage::SecurityNegotiation,
                next_stage: LoginStage::LoginOperationalNegotiation,
                version_max: 0,
                version_min: 0,
                isid: [0x80, 1, 2, 3, 4, 5],
                tsih: 0,
                cid: 1,
                cmd_sn: 1,
                exp_stat_sn: 0,
            }),
            Parser::TextRequest(TextRequestParser {
                continue_flag: false,
                lun: 0,
                target_transfer_tag: 0xFFFF_FFFF,
                cmd_sn: 3,
                exp_stat_sn: 4,
            }),
            Parser::DataOut(DataOutParser {
                lun: lun::encode(2),
                target_transfer_tag: 12,
                exp_stat_sn: 4,
                data_sn: 1,
                buffer_offset: 8192,
            }),
            Parser::LogoutRequest(LogoutRequestParser {
                reason: LogoutReason::CloseConnection,
                cid: 2,
                cmd_sn: 44,
                exp_stat_sn: 45,
            }),
            Parser::SnackRequest(SnackRequestParser {
                snack_type: SnackType::Status,
                lun: 0,
                target_transfer_tag: 0xFFFF_FFFF,
                exp_stat_sn: 10,
                beg_run: 3,
                run_length: 2,
            }),
            Parser::NopIn(NopInParser {
                lun: 0,
                target_transfer_tag: 0xFFFF_FFFF,
                stat_sn: 1,
                exp_cmd_sn: 2,
                max_cmd_sn: 33,
            }),
            Parser::ScsiResponse(ScsiResponseParser {
                residual_underflow: true,
                response: 0,
                status: 0x02,
                stat_sn: 17,
                exp_cmd_sn: 18,
                max_cmd_sn: 50,
                residual_count: 512,
                ..Default::default()
            }),
            Parser::TaskManagementResponse(TaskManagementFunctionResponseParser {
                response: TmfResponse::TaskDoesNotExist,
                stat_sn: 4,
                exp_cmd_sn: 5,
                max_cmd_sn: 6,
            }),
            Parser::LoginResponse(LoginResponseParser {
                continue_flag: false,
                current_stage: LoginStage::LoginOperationalNegotiation,
                next_stage: LoginStage::FullFeaturePhase,
                version_max: 0,
                version_active: 0,
                isid: [0x80, 1, 2, 3, 4, 5],
                tsih: 12,
                stat_sn: 1,
                exp_cmd_sn: 2,
                max_cmd_sn: 33,
                status_class: 0,
                status_detail: 0,
            }),
            Parser::TextResponse(TextResponseParser {
                continue_flag: true,
                lun: 0,
                target_transfer_tag: 0x10,
                stat_sn: 5,
                exp_cmd_sn: 6,
                max_cmd_sn: 7,
            }),
            Parser::DataIn(DataInParser {
                status_flag: true,
                status: 0,
                lun: lun::encode(1),
                target_transfer_tag: 0xFFFF_FFFF,
                stat_sn: 8,
                exp_cmd_sn: 9,
                max_cmd_sn: 40,
                data_sn: 2,
                buffer_offset: 16384,
                residual_count: 0,
                ..Default::default()
            }),
            Parser::LogoutResponse(LogoutResponseParser {
                response: 0,
                stat_sn: 9,
                exp_cmd_sn: 10,
                max_cmd_sn: 11,
                time2wait: 2,
                time2retain: 20,
            }),
            Parser::Ready2Transfer(Ready2TransferParser {
                lun: lun::encode(1),
                target_transfer_tag: 1,
                stat_sn: 2,
                exp_cmd_sn: 3,
                max_cmd_sn: 4,
                r2t_sn: 5,
                buffer_offset: 65536,
                desired_data_transfer_length: 65536,
            }),
            Parser::AsyncMessage(AsynchronousMessageParser {
                lun: 0,
                stat_sn: 3,
                exp_cmd_sn: 4,
                max_cmd_sn: 5,
                async_event: AsyncEvent::LogoutRequest,
                async_vcode: 0,
                parameter1: 0,
                parameter2: 0,
                parameter3: 10,
            }),
            Parser::Reject(RejectParser {
                reason: RejectReason::ProtocolError,
                stat_sn: 6,
                exp_cmd_sn: 7,
                max_cmd_sn: 8,
                data_sn_or_r2t_sn: 0,
            }),
        ];

        assert_eq!(parsers.len(), 18);
        for parser in parsers {
            let pdu = ProtocolDataUnit::new(parser).with_final(true).with_itt(0x1234);
            assert_roundtrip(pdu);
        }
    }

    #[test]
    fn test_recognize_matches_opcode() {
        for raw in [0x00u8, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x10, 0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x31, 0x32, 0x3F] {
            let opcode = Opcode::try_from(raw).unwrap();
            assert_eq!(recognize(opcode)().opcode(), opcode);
        }
    }

    #[test]
    fn test_lun_field_encoding() {
        assert_eq!(lun::encode(1), 0x0001_0000_0000_0000);
        assert_eq!(lun::decode(lun::encode(1)), 1);
        assert_eq!(lun::decode(lun::encode(300)), 300);
        assert_eq!(lun::encode(300) >> 62, 0b01);
    }
}
