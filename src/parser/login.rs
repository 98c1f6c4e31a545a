//! Login, Text and Logout headers
//!
//! In Login PDUs the F bit of byte 1 is the Transit flag. It is kept in the
//! BHS `final_flag` like every other opcode's F bit, so these parsers only
//! handle the Continue flag and the stage codes.

use super::{get_lun, get_u16, get_u32, put_lun, put_u16, put_u32, Header, PduParser};
use crate::error::ProtocolError;
use crate::pdu::flags;

/// Login stage codes carried in CSG and NSG
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LoginStage {
    #[default]
    SecurityNegotiation = 0,
    LoginOperationalNegotiation = 1,
    FullFeaturePhase = 3,
}

impl TryFrom<u8> for LoginStage {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LoginStage::SecurityNegotiation),
            1 => Ok(LoginStage::LoginOperationalNegotiation),
            3 => Ok(LoginStage::FullFeaturePhase),
            other => Err(ProtocolError::invalid("login stage", other)),
        }
    }
}

fn read_stages(byte1: u8) -> Result<(bool, LoginStage, LoginStage), ProtocolError> {
    let continue_flag = byte1 & flags::CONTINUE_LOGIN != 0;
    let current = LoginStage::try_from((byte1 >> 2) & 0x03)?;
    let next = LoginStage::try_from(byte1 & 0x03)?;
    Ok((continue_flag, current, next))
}

fn write_stages(header: &mut Header, continue_flag: bool, current: LoginStage, next: LoginStage) {
    if continue_flag {
        header[1] |= flags::CONTINUE_LOGIN;
    }
    header[1] |= ((current as u8) << 2) | next as u8;
}

fn check_stages(transit: bool, continue_flag: bool, current: LoginStage, next: LoginStage) -> Result<(), ProtocolError> {
    if transit && continue_flag {
        return Err(ProtocolError::invalid("login T and C flags", 0x03u8));
    }
    if transit && next <= current {
        return Err(ProtocolError::invalid("login NSG", next as u8));
    }
    Ok(())
}

/// Login Request (0x03)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginRequestParser {
    pub continue_flag: bool,
    pub current_stage: LoginStage,
    pub next_stage: LoginStage,
    pub version_max: u8,
    pub version_min: u8,
    pub isid: [u8; 6],
    pub tsih: u16,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

impl PduParser for LoginRequestParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        let (continue_flag, current, next) = read_stages(header[1])?;
        self.continue_flag = continue_flag;
        self.current_stage = current;
        self.next_stage = next;
        self.version_max = header[2];
        self.version_min = header[3];
        self.isid.copy_from_slice(&header[8..14]);
        self.tsih = get_u16(header, 14);
        self.cid = get_u16(header, 20);
        self.cmd_sn = get_u32(header, 24);
        self.exp_stat_sn = get_u32(header, 28);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        write_stages(header, self.continue_flag, self.current_stage, self.next_stage);
        header[2] = self.version_max;
        header[3] = self.version_min;
        header[8..14].copy_from_slice(&self.isid);
        put_u16(header, 14, self.tsih);
        put_u16(header, 20, self.cid);
        put_u32(header, 24, self.cmd_sn);
        put_u32(header, 28, self.exp_stat_sn);
    }

    fn check_integrity(&self, final_flag: bool) -> Result<(), ProtocolError> {
        check_stages(final_flag, self.continue_flag, self.current_stage, self.next_stage)
    }

    fn cmd_sn(&self) -> Option<u32> {
        Some(self.cmd_sn)
    }

    fn exp_stat_sn(&self) -> Option<u32> {
        Some(self.exp_stat_sn)
    }
}

/// Login Response (0x23)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginResponseParser {
    pub continue_flag: bool,
    pub current_stage: LoginStage,
    pub next_stage: LoginStage,
    pub version_max: u8,
    pub version_active: u8,
    pub isid: [u8; 6],
    pub tsih: u16,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub status_class: u8,
    pub status_detail: u8,
}

impl LoginResponseParser {
    /// Class and detail as one code, e.g. 0x0203
    pub fn status(&self) -> u16 {
        u16::from_be_bytes([self.status_class, self.status_detail])
    }

    pub fn set_status(&mut self, status: u16) {
        let [class, detail] = status.to_be_bytes();
        self.status_class = class;
        self.status_detail = detail;
    }
}

impl PduParser for LoginResponseParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        let (continue_flag, current, next) = read_stages(header[1])?;
        self.continue_flag = continue_flag;
        self.current_stage = current;
        self.next_stage = next;
        self.version_max = header[2];
        self.version_active = header[3];
        self.isid.copy_from_slice(&header[8..14]);
        self.tsih = get_u16(header, 14);
        self.stat_sn = get_u32(header, 24);
        self.exp_cmd_sn = get_u32(header, 28);
        self.max_cmd_sn = get_u32(header, 32);
        self.status_class = header[36];
        self.status_detail = header[37];
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        write_stages(header, self.continue_flag, self.current_stage, self.next_stage);
        header[2] = self.version_max;
        header[3] = self.version_active;
        header[8..14].copy_from_slice(&self.isid);
        put_u16(header, 14, self.tsih);
        put_u32(header, 24, self.stat_sn);
        put_u32(header, 28, self.exp_cmd_sn);
        put_u32(header, 32, self.max_cmd_sn);
        header[36] = self.status_class;
        header[37] = self.status_detail;
    }

    fn check_integrity(&self, final_flag: bool) -> Result<(), ProtocolError> {
        check_stages(final_flag, self.continue_flag, self.current_stage, self.next_stage)
    }

    fn stat_sn(&self) -> Option<u32> {
        Some(self.stat_sn)
    }

    fn command_window(&self) -> Option<(u32, u32)> {
        Some((self.exp_cmd_sn, self.max_cmd_sn))
    }
}

/// Text Request (0x04)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextRequestParser {
    pub continue_flag: bool,
    pub lun: u64,
    pub target_transfer_tag: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

impl PduParser for TextRequestParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.continue_flag = header[1] & flags::CONTINUE != 0;
        self.lun = get_lun(header);
        self.target_transfer_tag = get_u32(header, 20);
        self.cmd_sn = get_u32(header, 24);
        self.exp_stat_sn = get_u32(header, 28);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        if self.continue_flag {
            header[1] |= flags::CONTINUE;
        }
        put_lun(header, self.lun);
        put_u32(header, 20, self.target_transfer_tag);
        put_u32(header, 24, self.cmd_sn);
        put_u32(header, 28, self.exp_stat_sn);
    }

    fn check_integrity(&self, final_flag: bool) -> Result<(), ProtocolError> {
        if final_flag && self.continue_flag {
            return Err(ProtocolError::invalid("text F and C flags", 0x03u8));
        }
        Ok(())
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

/// Text Response (0x24)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextResponseParser {
    pub continue_flag: bool,
    pub lun: u64,
    pub target_transfer_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

impl PduParser for TextResponseParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.continue_flag = header[1] & flags::CONTINUE != 0;
        self.lun = get_lun(header);
        self.target_transfer_tag = get_u32(header, 20);
        self.stat_sn = get_u32(header, 24);
        self.exp_cmd_sn = get_u32(header, 28);
        self.max_cmd_sn = get_u32(header, 32);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        if self.continue_flag {
            header[1] |= flags::CONTINUE;
        }
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

/// Logout reason codes (RFC 3720 Section 10.14.1)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogoutReason {
    #[default]
    CloseSession = 0,
    CloseConnection = 1,
    RemoveConnectionForRecovery = 2,
}

impl TryFrom<u8> for LogoutReason {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LogoutReason::CloseSession),
            1 => Ok(LogoutReason::CloseConnection),
            2 => Ok(LogoutReason::RemoveConnectionForRecovery),
            other => Err(ProtocolError::invalid("logout reason", other)),
        }
    }
}

/// Logout Request (0x06)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogoutRequestParser {
    pub reason: LogoutReason,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

impl PduParser for LogoutRequestParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.reason = LogoutReason::try_from(header[1] & 0x7F)?;
        self.cid = get_u16(header, 20);
        self.cmd_sn = get_u32(header, 24);
        self.exp_stat_sn = get_u32(header, 28);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        header[1] |= self.reason as u8;
        put_u16(header, 20, self.cid);
        put_u32(header, 24, self.cmd_sn);
        put_u32(header, 28, self.exp_stat_sn);
    }

    fn cmd_sn(&self) -> Option<u32> {
        Some(self.cmd_sn)
    }

    fn exp_stat_sn(&self) -> Option<u32> {
        Some(self.exp_stat_sn)
    }
}

/// Logout Response (0x26)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogoutResponseParser {
    pub response: u8,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub time2wait: u16,
    pub time2retain: u16,
}

impl PduParser for LogoutResponseParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.response = header[2];
        self.stat_sn = get_u32(header, 24);
        self.exp_cmd_sn = get_u32(header, 28);
        self.max_cmd_sn = get_u32(header, 32);
        self.time2wait = get_u16(header, 40);
        self.time2retain = get_u16(header, 42);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        header[2] = self.response;
        put_u32(header, 24, self.stat_sn);
        put_u32(header, 28, self.exp_cmd_sn);
        put_u32(header, 32, self.max_cmd_sn);
        put_u16(header, 40, self.time2wait);
        put_u16(header, 42, self.time2retain);
    }

    fn stat_sn(&self) -> Option<u32> {
        Some(self.stat_sn)
    }

    fn command_window(&self) -> Option<(u32, u32)> {
        Some((self.exp_cmd_sn, self.max_cmd_sn))
    }
}
