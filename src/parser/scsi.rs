//! SCSI command, response, data transfer and task management headers

use super::{get_lun, get_u32, put_lun, put_u32, Header, PduParser};
use crate::error::ProtocolError;
use crate::pdu::{flags, RESERVED_TAG};

/// Task attribute in the ATTR bits of a SCSI Command
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskAttribute {
    #[default]
    Untagged = 0,
    Simple = 1,
    Ordered = 2,
    HeadOfQueue = 3,
    Aca = 4,
}

impl TryFrom<u8> for TaskAttribute {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskAttribute::Untagged),
            1 => Ok(TaskAttribute::Simple),
            2 => Ok(TaskAttribute::Ordered),
            3 => Ok(TaskAttribute::HeadOfQueue),
            4 => Ok(TaskAttribute::Aca),
            other => Err(ProtocolError::invalid("task attribute", other)),
        }
    }
}

/// SCSI Command (0x01)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScsiCommandParser {
    pub read: bool,
    pub write: bool,
    pub task_attribute: TaskAttribute,
    pub lun: u64,
    pub expected_data_transfer_length: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub cdb: [u8; 16],
}

impl PduParser for ScsiCommandParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.read = header[1] & flags::READ != 0;
        self.write = header[1] & flags::WRITE != 0;
        self.task_attribute = TaskAttribute::try_from(header[1] & flags::ATTRIBUTE_MASK)?;
        self.lun = get_lun(header);
        self.expected_data_transfer_length = get_u32(header, 20);
        self.cmd_sn = get_u32(header, 24);
        self.exp_stat_sn = get_u32(header, 28);
        self.cdb.copy_from_slice(&header[32..48]);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        if self.read {
            header[1] |= flags::READ;
        }
        if self.write {
            header[1] |= flags::WRITE;
        }
        header[1] |= self.task_attribute as u8;
        put_lun(header, self.lun);
        put_u32(header, 20, self.expected_data_transfer_length);
        put_u32(header, 24, self.cmd_sn);
        put_u32(header, 28, self.exp_stat_sn);
        header[32..48].copy_from_slice(&self.cdb);
    }

    fn check_integrity(&self, final_flag: bool) -> Result<(), ProtocolError> {
        if !self.write && !final_flag {
            return Err(ProtocolError::invalid("SCSI command W and F flags", 0u8));
        }
        if self.expected_data_transfer_length != 0 && !self.read && !self.write {
            return Err(ProtocolError::invalid(
                "expected data transfer length",
                self.expected_data_transfer_length,
            ));
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

/// SCSI Response (0x21)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScsiResponseParser {
    pub bidi_read_overflow: bool,
    pub bidi_read_underflow: bool,
    pub residual_overflow: bool,
    pub residual_underflow: bool,
    /// iSCSI service response, 0 = command completed at target
    pub response: u8,
    pub status: u8,
    pub snack_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub exp_data_sn: u32,
    pub bidi_read_residual_count: u32,
    pub residual_count: u32,
}

impl PduParser for ScsiResponseParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.bidi_read_overflow = header[1] & flags::BIDI_OVERFLOW != 0;
        self.bidi_read_underflow = header[1] & flags::BIDI_UNDERFLOW != 0;
        self.residual_overflow = header[1] & flags::RESIDUAL_OVERFLOW != 0;
        self.residual_underflow = header[1] & flags::RESIDUAL_UNDERFLOW != 0;
        self.response = header[2];
        self.status = header[3];
        self.snack_tag = get_u32(header, 20);
        self.stat_sn = get_u32(header, 24);
        self.exp_cmd_sn = get_u32(header, 28);
        self.max_cmd_sn = get_u32(header, 32);
        self.exp_data_sn = get_u32(header, 36);
        self.bidi_read_residual_count = get_u32(header, 40);
        self.residual_count = get_u32(header, 44);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        for (set, bit) in [
            (self.bidi_read_overflow, flags::BIDI_OVERFLOW),
            (self.bidi_read_underflow, flags::BIDI_UNDERFLOW),
            (self.residual_overflow, flags::RESIDUAL_OVERFLOW),
            (self.residual_underflow, flags::RESIDUAL_UNDERFLOW),
        ] {
            if set {
                header[1] |= bit;
            }
        }
        header[2] = self.response;
        header[3] = self.status;
        put_u32(header, 20, self.snack_tag);
        put_u32(header, 24, self.stat_sn);
        put_u32(header, 28, self.exp_cmd_sn);
        put_u32(header, 32, self.max_cmd_sn);
        put_u32(header, 36, self.exp_data_sn);
        put_u32(header, 40, self.bidi_read_residual_count);
        put_u32(header, 44, self.residual_count);
    }

    fn check_integrity(&self, _final_flag: bool) -> Result<(), ProtocolError> {
        if self.residual_overflow && self.residual_underflow {
            return Err(ProtocolError::invalid("residual O and U flags", 0x06u8));
        }
        if self.bidi_read_overflow && self.bidi_read_underflow {
            return Err(ProtocolError::invalid("bidirectional o and u flags", 0x18u8));
        }
        Ok(())
    }

    fn stat_sn(&self) -> Option<u32> {
        Some(self.stat_sn)
    }

    fn command_window(&self) -> Option<(u32, u32)> {
        Some((self.exp_cmd_sn, self.max_cmd_sn))
    }
}

/// SCSI Data-In (0x25)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataInParser {
    pub acknowledge: bool,
    pub residual_overflow: bool,
    pub residual_underflow: bool,
    /// S bit: this PDU also carries the command status
    pub status_flag: bool,
    pub status: u8,
    pub lun: u64,
    pub target_transfer_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub residual_count: u32,
}

impl PduParser for DataInParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.acknowledge = header[1] & flags::ACKNOWLEDGE != 0;
        self.residual_overflow = header[1] & flags::RESIDUAL_OVERFLOW != 0;
        self.residual_underflow = header[1] & flags::RESIDUAL_UNDERFLOW != 0;
        self.status_flag = header[1] & flags::STATUS != 0;
        self.status = header[3];
        self.lun = get_lun(header);
        self.target_transfer_tag = get_u32(header, 20);
        self.stat_sn = get_u32(header, 24);
        self.exp_cmd_sn = get_u32(header, 28);
        self.max_cmd_sn = get_u32(header, 32);
        self.data_sn = get_u32(header, 36);
        self.buffer_offset = get_u32(header, 40);
        self.residual_count = get_u32(header, 44);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        for (set, bit) in [
            (self.acknowledge, flags::ACKNOWLEDGE),
            (self.residual_overflow, flags::RESIDUAL_OVERFLOW),
            (self.residual_underflow, flags::RESIDUAL_UNDERFLOW),
            (self.status_flag, flags::STATUS),
        ] {
            if set {
                header[1] |= bit;
            }
        }
        header[3] = self.status;
        put_lun(header, self.lun);
        put_u32(header, 20, self.target_transfer_tag);
        put_u32(header, 24, self.stat_sn);
        put_u32(header, 28, self.exp_cmd_sn);
        put_u32(header, 32, self.max_cmd_sn);
        put_u32(header, 36, self.data_sn);
        put_u32(header, 40, self.buffer_offset);
        put_u32(header, 44, self.residual_count);
    }

    fn check_integrity(&self, final_flag: bool) -> Result<(), ProtocolError> {
        if self.status_flag && !final_flag {
            return Err(ProtocolError::invalid("Data-In S flag without F", 0x01u8));
        }
        if self.residual_overflow && self.residual_underflow {
            return Err(ProtocolError::invalid("residual O and U flags", 0x06u8));
        }
        Ok(())
    }

    fn logical_unit_number(&self) -> Option<u64> {
        Some(self.lun)
    }

    fn stat_sn(&self) -> Option<u32> {
        // StatSN is only meaningful when the S bit is set
        self.status_flag.then_some(self.stat_sn)
    }

    fn command_window(&self) -> Option<(u32, u32)> {
        Some((self.exp_cmd_sn, self.max_cmd_sn))
    }
}

/// SCSI Data-Out (0x05)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataOutParser {
    pub lun: u64,
    pub target_transfer_tag: u32,
    pub exp_stat_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
}

impl PduParser for DataOutParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.lun = get_lun(header);
        self.target_transfer_tag = get_u32(header, 20);
        self.exp_stat_sn = get_u32(header, 28);
        self.data_sn = get_u32(header, 36);
        self.buffer_offset = get_u32(header, 40);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        put_lun(header, self.lun);
        put_u32(header, 20, self.target_transfer_tag);
        put_u32(header, 28, self.exp_stat_sn);
        put_u32(header, 36, self.data_sn);
        put_u32(header, 40, self.buffer_offset);
    }

    fn logical_unit_number(&self) -> Option<u64> {
        Some(self.lun)
    }

    fn exp_stat_sn(&self) -> Option<u32> {
        Some(self.exp_stat_sn)
    }
}

/// Ready To Transfer (0x31)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ready2TransferParser {
    pub lun: u64,
    pub target_transfer_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub r2t_sn: u32,
    pub buffer_offset: u32,
    pub desired_data_transfer_length: u32,
}

impl PduParser for Ready2TransferParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.lun = get_lun(header);
        self.target_transfer_tag = get_u32(header, 20);
        self.stat_sn = get_u32(header, 24);
        self.exp_cmd_sn = get_u32(header, 28);
        self.max_cmd_sn = get_u32(header, 32);
        self.r2t_sn = get_u32(header, 36);
        self.buffer_offset = get_u32(header, 40);
        self.desired_data_transfer_length = get_u32(header, 44);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        put_lun(header, self.lun);
        put_u32(header, 20, self.target_transfer_tag);
        put_u32(header, 24, self.stat_sn);
        put_u32(header, 28, self.exp_cmd_sn);
        put_u32(header, 32, self.max_cmd_sn);
        put_u32(header, 36, self.r2t_sn);
        put_u32(header, 40, self.buffer_offset);
        put_u32(header, 44, self.desired_data_transfer_length);
    }

    fn check_integrity(&self, _final_flag: bool) -> Result<(), ProtocolError> {
        if self.desired_data_transfer_length == 0 {
            return Err(ProtocolError::invalid("desired data transfer length", 0u32));
        }
        if self.target_transfer_tag == RESERVED_TAG {
            return Err(ProtocolError::invalid("target transfer tag", RESERVED_TAG));
        }
        Ok(())
    }

    fn logical_unit_number(&self) -> Option<u64> {
        Some(self.lun)
    }

    fn command_window(&self) -> Option<(u32, u32)> {
        Some((self.exp_cmd_sn, self.max_cmd_sn))
    }
}

/// Task management functions (RFC 3720 Section 10.5.1)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskManagementFunction {
    #[default]
    AbortTask = 1,
    AbortTaskSet = 2,
    ClearAca = 3,
    ClearTaskSet = 4,
    LogicalUnitReset = 5,
    TargetWarmReset = 6,
    TargetColdReset = 7,
    TaskReassign = 8,
}

impl TryFrom<u8> for TaskManagementFunction {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => TaskManagementFunction::AbortTask,
            2 => TaskManagementFunction::AbortTaskSet,
            3 => TaskManagementFunction::ClearAca,
            4 => TaskManagementFunction::ClearTaskSet,
            5 => TaskManagementFunction::LogicalUnitReset,
            6 => TaskManagementFunction::TargetWarmReset,
            7 => TaskManagementFunction::TargetColdReset,
            8 => TaskManagementFunction::TaskReassign,
            other => return Err(ProtocolError::invalid("task management function", other)),
        })
    }
}

/// Task Management Function Request (0x02)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskManagementFunctionRequestParser {
    pub function: TaskManagementFunction,
    pub lun: u64,
    pub referenced_task_tag: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub ref_cmd_sn: u32,
    pub exp_data_sn: u32,
}

impl PduParser for TaskManagementFunctionRequestParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.function = TaskManagementFunction::try_from(header[1] & 0x7F)?;
        self.lun = get_lun(header);
        self.referenced_task_tag = get_u32(header, 20);
        self.cmd_sn = get_u32(header, 24);
        self.exp_stat_sn = get_u32(header, 28);
        self.ref_cmd_sn = get_u32(header, 32);
        self.exp_data_sn = get_u32(header, 36);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        header[1] |= self.function as u8;
        put_lun(header, self.lun);
        put_u32(header, 20, self.referenced_task_tag);
        put_u32(header, 24, self.cmd_sn);
        put_u32(header, 28, self.exp_stat_sn);
        put_u32(header, 32, self.ref_cmd_sn);
        put_u32(header, 36, self.exp_data_sn);
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

/// Task management response codes (RFC 3720 Section 10.6.1)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TmfResponse {
    #[default]
    FunctionComplete = 0,
    TaskDoesNotExist = 1,
    LunDoesNotExist = 2,
    TaskStillAllegiant = 3,
    AllegianceReassignmentNotSupported = 4,
    FunctionNotSupported = 5,
    AuthorizationFailed = 6,
    FunctionRejected = 255,
}

impl TryFrom<u8> for TmfResponse {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => TmfResponse::FunctionComplete,
            1 => TmfResponse::TaskDoesNotExist,
            2 => TmfResponse::LunDoesNotExist,
            3 => TmfResponse::TaskStillAllegiant,
            4 => TmfResponse::AllegianceReassignmentNotSupported,
            5 => TmfResponse::FunctionNotSupported,
            6 => TmfResponse::AuthorizationFailed,
            255 => TmfResponse::FunctionRejected,
            other => return Err(ProtocolError::invalid("task management response", other)),
        })
    }
}

/// Task Management Function Response (0x22)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskManagementFunctionResponseParser {
    pub response: TmfResponse,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
}

impl PduParser for TaskManagementFunctionResponseParser {
    fn deserialize(&mut self, header: &Header) -> Result<(), ProtocolError> {
        self.response = TmfResponse::try_from(header[2])?;
        self.stat_sn = get_u32(header, 24);
        self.exp_cmd_sn = get_u32(header, 28);
        self.max_cmd_sn = get_u32(header, 32);
        Ok(())
    }

    fn serialize(&self, header: &mut Header) {
        header[2] = self.response as u8;
        put_u32(header, 24, self.stat_sn);
        put_u32(header, 28, self.exp_cmd_sn);
        put_u32(header, 32, self.max_cmd_sn);
    }

    fn stat_sn(&self) -> Option<u32> {
        Some(self.stat_sn)
    }

    fn command_window(&self) -> Option<(u32, u32)> {
        Some((self.exp_cmd_sn, self.max_cmd_sn))
    }
}
