//! SCSI block device trait and command handling
//!
//! This module defines the interface that storage backends must implement
//! and the static command registry that executes CDBs against them per the
//! SCSI Block Commands (SBC) specification.

use crate::error::ScsiResult;
use crate::parser::lun;
use byteorder::{BigEndian, ByteOrder};
use std::sync::RwLock;

/// Results of [`ScsiBlockDevice::check_bounds`]
pub mod bounds {
    pub const OK: u8 = 0;
    /// LBA negative or past the last block
    pub const BAD_LBA: u8 = 1;
    /// Transfer length negative or running past the last block
    pub const BAD_LENGTH: u8 = 2;
}

/// SCSI block device trait
///
/// Implement this trait to provide a storage backend for a logical unit.
/// Reads take `&self` and may run concurrently; writes and flushes take
/// `&mut self` and are serialized by the logical unit.
pub trait ScsiBlockDevice: Send + Sync {
    /// Fill `buf` starting at `lba`; `buf.len()` is a multiple of the block size
    fn read(&self, lba: u64, buf: &mut [u8]) -> ScsiResult<()>;

    /// Write `buf` starting at `lba`; `buf.len()` is a multiple of the block size
    fn write(&mut self, lba: u64, buf: &[u8]) -> ScsiResult<()>;

    /// Get total capacity in logical blocks
    fn block_count(&self) -> u64;

    /// Get block size in bytes (typically 512 or 4096)
    fn block_size(&self) -> u32;

    /// Flush any pending writes to stable storage
    fn flush(&mut self) -> ScsiResult<()> {
        Ok(())
    }

    /// Get vendor identification (8 chars max)
    fn vendor_id(&self) -> &str {
        "ISCSI   "
    }

    /// Get product identification (16 chars max)
    fn product_id(&self) -> &str {
        "Virtual Disk    "
    }

    /// Get product revision (4 chars max)
    fn product_rev(&self) -> &str {
        "1.0 "
    }

    /// Unit serial number reported in VPD page 0x80
    fn serial_number(&self) -> &str {
        "ISCSI00000000001"
    }

    /// Validate an access before touching the medium. See [`bounds`].
    fn check_bounds(&self, lba: i64, transfer_length: i32) -> u8 {
        let blocks = self.block_count() as i64;
        if lba < 0 || lba >= blocks {
            bounds::BAD_LBA
        } else if transfer_length < 0 || lba + transfer_length as i64 > blocks {
            bounds::BAD_LENGTH
        } else {
            bounds::OK
        }
    }
}

/// SCSI command opcodes (subset needed for basic block storage)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Read6 = 0x08,
    Write6 = 0x0A,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    StartStopUnit = 0x1B,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    Verify10 = 0x2F,
    SynchronizeCache10 = 0x35,
    ModeSense10 = 0x5A,
    Read16 = 0x88,
    Write16 = 0x8A,
    Verify16 = 0x8F,
    SynchronizeCache16 = 0x91,
    ServiceActionIn16 = 0x9E, // READ CAPACITY 16 uses this
    ReportLuns = 0xA0,
}

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const WRITE_PROTECTED: u8 = 0x27;
    pub const INTERNAL_TARGET_FAILURE: u8 = 0x44;
    pub const OVERLAPPED_COMMANDS_ATTEMPTED: u8 = 0x4E;
}

/// SCSI sense data (fixed format)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,        // Additional Sense Code
    pub ascq: u8,       // Additional Sense Code Qualifier
    pub information: u32,
    /// CDB byte the error refers to (sense-key specific field pointer)
    pub field_pointer: Option<u16>,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: 0,
            field_pointer: None,
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.information = info;
        self
    }

    pub fn with_field_pointer(mut self, byte: u16) -> Self {
        self.field_pointer = Some(byte);
        self
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];

        // Response code: 0x70 = current error, fixed format
        data[0] = 0x70;
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);

        // Additional sense length
        data[7] = 10; // Remaining bytes after this field

        data[12] = self.asc;
        data[13] = self.ascq;

        if let Some(pointer) = self.field_pointer {
            // SKSV, C/D = CDB
            data[15] = 0xC0;
            BigEndian::write_u16(&mut data[16..18], pointer);
        }

        data
    }

    /// Create sense data for invalid/unsupported command opcode
    pub fn invalid_command() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE, 0)
    }

    pub fn invalid_field(byte: u16) -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0).with_field_pointer(byte)
    }

    /// Create sense data for LBA out of range
    pub fn lba_out_of_range(lba: u32) -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0).with_info(lba)
    }

    /// Create sense data for medium error
    pub fn medium_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::UNRECOVERED_READ_ERROR, 0x00)
    }

    /// Create sense data for write protected
    pub fn write_protected() -> Self {
        SenseData::new(sense_key::DATA_PROTECT, asc::WRITE_PROTECTED, 0)
    }

    pub fn target_failure() -> Self {
        SenseData::new(sense_key::HARDWARE_ERROR, asc::INTERNAL_TARGET_FAILURE, 0)
    }

    pub fn lun_not_supported() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LOGICAL_UNIT_NOT_SUPPORTED, 0)
    }

    /// A second command arrived with a task tag already in use
    pub fn overlapped_commands() -> Self {
        SenseData::new(sense_key::ABORTED_COMMAND, asc::OVERLAPPED_COMMANDS_ATTEMPTED, 0)
    }
}

/// Result of SCSI command execution
#[derive(Debug, Clone)]
pub struct ScsiResponse {
    /// SCSI status code
    pub status: u8,
    /// Response data (for read commands)
    pub data: Vec<u8>,
    /// Sense data (for CHECK CONDITION status)
    pub sense: Option<SenseData>,
}

impl ScsiResponse {
    /// Create a GOOD status response with data
    pub fn good(data: Vec<u8>) -> Self {
        ScsiResponse {
            status: scsi_status::GOOD,
            data,
            sense: None,
        }
    }

    /// Create a GOOD status response without data
    pub fn good_no_data() -> Self {
        ScsiResponse::good(Vec::new())
    }

    /// Create a CHECK CONDITION response with sense data
    pub fn check_condition(sense: SenseData) -> Self {
        ScsiResponse {
            status: scsi_status::CHECK_CONDITION,
            data: Vec::new(),
            sense: Some(sense),
        }
    }

    /// Status-only response such as TASK SET FULL
    pub fn status(status: u8) -> Self {
        ScsiResponse {
            status,
            data: Vec::new(),
            sense: None,
        }
    }

    /// Cut data to an allocation length
    fn truncated(mut self, alloc_len: usize) -> Self {
        self.data.truncate(alloc_len);
        self
    }
}

/// Which way data moves for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    /// Target to initiator (Data-In)
    Read,
    /// Initiator to target (Data-Out)
    Write,
}

/// Everything a command handler may touch
pub struct CommandContext<'a> {
    pub cdb: &'a [u8],
    pub device: &'a RwLock<Box<dyn ScsiBlockDevice>>,
    /// LUNs of the target, for REPORT LUNS
    pub luns: &'a [u64],
    /// Data received for write commands
    pub data_out: &'a [u8],
    /// Expected data transfer length from the initiator, if bounded
    pub expected_length: Option<u32>,
}

pub type CommandHandler = fn(&CommandContext<'_>) -> ScsiResponse;

/// One entry of the command registry
pub struct CommandDescriptor {
    pub opcode: u8,
    pub name: &'static str,
    pub direction: DataDirection,
    /// Shortest CDB the handler accepts
    pub cdb_length: usize,
    pub handler: CommandHandler,
}

macro_rules! command {
    ($op:expr, $name:expr, $dir:ident, $len:expr, $handler:path) => {
        CommandDescriptor {
            opcode: $op as u8,
            name: $name,
            direction: DataDirection::$dir,
            cdb_length: $len,
            handler: $handler,
        }
    };
}

static COMMANDS: &[CommandDescriptor] = &[
    command!(ScsiOpcode::TestUnitReady, "TEST UNIT READY", None, 6, test_unit_ready),
    command!(ScsiOpcode::RequestSense, "REQUEST SENSE", Read, 6, request_sense),
    command!(ScsiOpcode::Read6, "READ(6)", Read, 6, read_blocks),
    command!(ScsiOpcode::Write6, "WRITE(6)", Write, 6, write_blocks),
    command!(ScsiOpcode::Inquiry, "INQUIRY", Read, 6, inquiry),
    command!(ScsiOpcode::ModeSense6, "MODE SENSE(6)", Read, 6, mode_sense_6),
    command!(ScsiOpcode::StartStopUnit, "START STOP UNIT", None, 6, test_unit_ready),
    command!(ScsiOpcode::ReadCapacity10, "READ CAPACITY(10)", Read, 10, read_capacity_10),
    command!(ScsiOpcode::Read10, "READ(10)", Read, 10, read_blocks),
    command!(ScsiOpcode::Write10, "WRITE(10)", Write, 10, write_blocks),
    command!(ScsiOpcode::Verify10, "VERIFY(10)", None, 10, test_unit_ready),
    command!(ScsiOpcode::SynchronizeCache10, "SYNCHRONIZE CACHE(10)", None, 10, synchronize_cache),
    command!(ScsiOpcode::ModeSense10, "MODE SENSE(10)", Read, 10, mode_sense_10),
    command!(ScsiOpcode::Read16, "READ(16)", Read, 16, read_blocks),
    command!(ScsiOpcode::Write16, "WRITE(16)", Write, 16, write_blocks),
    command!(ScsiOpcode::Verify16, "VERIFY(16)", None, 16, test_unit_ready),
    command!(ScsiOpcode::SynchronizeCache16, "SYNCHRONIZE CACHE(16)", None, 16, synchronize_cache),
    command!(ScsiOpcode::ServiceActionIn16, "SERVICE ACTION IN(16)", Read, 16, service_action_in_16),
    command!(ScsiOpcode::ReportLuns, "REPORT LUNS", Read, 12, report_luns),
];

/// Find the handler for a CDB opcode
pub fn lookup(opcode: u8) -> Option<&'static CommandDescriptor> {
    COMMANDS.iter().find(|c| c.opcode == opcode)
}

/// Run a CDB through the registry
pub fn execute(ctx: &CommandContext<'_>) -> ScsiResponse {
    let Some(&opcode) = ctx.cdb.first() else {
        return ScsiResponse::check_condition(SenseData::invalid_command());
    };
    match lookup(opcode) {
        Some(command) if ctx.cdb.len() >= command.cdb_length => (command.handler)(ctx),
        Some(_) => ScsiResponse::check_condition(SenseData::invalid_field(0)),
        None => {
            log::debug!("Unsupported SCSI opcode 0x{:02x}", opcode);
            ScsiResponse::check_condition(SenseData::invalid_command())
        }
    }
}

/// LBA and block count of a READ or WRITE CDB
pub fn transfer_extent(cdb: &[u8]) -> Option<(u64, u32)> {
    match *cdb.first()? {
        0x08 | 0x0A if cdb.len() >= 6 => {
            let lba = (BigEndian::read_u24(&cdb[1..4]) & 0x1F_FFFF) as u64;
            // zero means 256 blocks
            let length = if cdb[4] == 0 { 256 } else { cdb[4] as u32 };
            Some((lba, length))
        }
        0x28 | 0x2A if cdb.len() >= 10 => Some((
            BigEndian::read_u32(&cdb[2..6]) as u64,
            BigEndian::read_u16(&cdb[7..9]) as u32,
        )),
        0x88 | 0x8A if cdb.len() >= 16 => Some((
            BigEndian::read_u64(&cdb[2..10]),
            BigEndian::read_u32(&cdb[10..14]),
        )),
        _ => None,
    }
}

/// CHECK CONDITION for a READ/WRITE outside the medium, if it is
pub fn check_extent(cdb: &[u8], device: &dyn ScsiBlockDevice) -> Option<ScsiResponse> {
    let (lba, length) = transfer_extent(cdb)?;
    let lba_field: u16 = if cdb[0] == 0x08 || cdb[0] == 0x0A { 1 } else { 2 };
    let length_field = length_field(cdb[0]);
    let lba = i64::try_from(lba).unwrap_or(-1);
    let length = i32::try_from(length).unwrap_or(-1);
    match device.check_bounds(lba, length) {
        bounds::OK => None,
        bounds::BAD_LBA => Some(ScsiResponse::check_condition(
            SenseData::lba_out_of_range(lba as u32).with_field_pointer(lba_field),
        )),
        _ => Some(ScsiResponse::check_condition(
            SenseData::lba_out_of_range(lba as u32).with_field_pointer(length_field),
        )),
    }
}

/// CDB byte holding the transfer length of a READ or WRITE
fn length_field(opcode: u8) -> u16 {
    match opcode {
        0x08 | 0x0A => 4,
        0x28 | 0x2A => 7,
        _ => 10,
    }
}

/// CHECK CONDITION for a READ/WRITE moving more bytes than the initiator
/// expects to transfer. Checked before any buffer is sized from the CDB.
pub fn check_transfer_length(cdb: &[u8], block_size: u32, expected: Option<u32>) -> Option<ScsiResponse> {
    let expected = expected?;
    let (_, blocks) = transfer_extent(cdb)?;
    let bytes = blocks as u64 * block_size as u64;
    if bytes <= expected as u64 {
        return None;
    }
    log::warn!(
        "SCSI 0x{:02x} moves {} bytes but the initiator expects {}",
        cdb[0],
        bytes,
        expected
    );
    Some(ScsiResponse::check_condition(SenseData::invalid_field(length_field(cdb[0]))))
}

/// Bytes a WRITE expects from the initiator
pub fn data_out_length(cdb: &[u8], block_size: u32) -> usize {
    transfer_extent(cdb)
        .map(|(_, blocks)| blocks as usize * block_size as usize)
        .unwrap_or(0)
}

/// NACA bit of the CDB control byte
pub fn naca(cdb: &[u8]) -> bool {
    let control = match cdb.first().map(|op| op >> 5) {
        Some(0) => 5,
        Some(1) | Some(2) => 9,
        Some(4) => 15,
        Some(5) => 11,
        _ => return false,
    };
    cdb.get(control).map(|c| c & 0x04 != 0).unwrap_or(false)
}

fn target_failure(what: &str) -> ScsiResponse {
    log::error!("{} lock poisoned", what);
    ScsiResponse::check_condition(SenseData::target_failure())
}

fn pad_ascii(dest: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    for (i, slot) in dest.iter_mut().enumerate() {
        *slot = bytes.get(i).copied().unwrap_or(b' ');
    }
}

/// TEST UNIT READY, and the commands that only need a ready unit
fn test_unit_ready(_ctx: &CommandContext<'_>) -> ScsiResponse {
    // Device is always ready
    ScsiResponse::good_no_data()
}

/// REQUEST SENSE - 0x03
fn request_sense(ctx: &CommandContext<'_>) -> ScsiResponse {
    let alloc_len = ctx.cdb[4] as usize;
    // no deferred errors are kept
    let sense = SenseData::new(sense_key::NO_SENSE, asc::NO_ADDITIONAL_SENSE, 0);
    ScsiResponse::good(sense.to_bytes()).truncated(alloc_len)
}

/// INQUIRY (0x12)
fn inquiry(ctx: &CommandContext<'_>) -> ScsiResponse {
    let evpd = ctx.cdb[1] & 0x01;
    let page_code = ctx.cdb[2];
    let alloc_len = BigEndian::read_u16(&ctx.cdb[3..5]) as usize;

    let device = match ctx.device.read() {
        Ok(device) => device,
        Err(_) => return target_failure("device"),
    };

    if evpd != 0 {
        return inquiry_vpd(page_code, &**device).truncated(alloc_len);
    }
    if page_code != 0 {
        return ScsiResponse::check_condition(SenseData::invalid_field(2));
    }

    // Standard INQUIRY response
    let mut data = vec![0u8; 36];

    // Peripheral device type: 0x00 = Direct access block device (disk)
    data[0] = 0x00;
    // Version: 0x05 = SPC-3
    data[2] = 0x05;
    // Response data format 2, HiSup
    data[3] = 0x12;
    data[4] = (data.len() - 5) as u8;
    data[7] = 0x02; // CmdQue = 1 (command queuing supported)

    pad_ascii(&mut data[8..16], device.vendor_id());
    pad_ascii(&mut data[16..32], device.product_id());
    pad_ascii(&mut data[32..36], device.product_rev());

    ScsiResponse::good(data).truncated(alloc_len)
}

/// INQUIRY VPD pages
fn inquiry_vpd(page_code: u8, device: &dyn ScsiBlockDevice) -> ScsiResponse {
    match page_code {
        0x00 => {
            // Supported VPD pages
            ScsiResponse::good(vec![0x00, 0x00, 0x00, 3, 0x00, 0x80, 0x83])
        }
        0x80 => {
            // Unit Serial Number
            let serial = device.serial_number().as_bytes();
            let mut data = vec![0x00, 0x80, 0x00, serial.len() as u8];
            data.extend_from_slice(serial);
            ScsiResponse::good(data)
        }
        0x83 => {
            // Device Identification: one NAA descriptor
            let mut naa = [0u8; 8];
            naa[0] = 0x60;
            let serial = device.serial_number().as_bytes();
            for (slot, b) in naa[1..].iter_mut().zip(serial.iter().rev()) {
                *slot = *b;
            }
            let mut data = vec![0x00, 0x83, 0x00, 0x00];
            data.extend_from_slice(&[0x01, 0x03, 0x00, 0x08]); // binary, NAA, length 8
            data.extend_from_slice(&naa);
            data[3] = (data.len() - 4) as u8;
            ScsiResponse::good(data)
        }
        _ => ScsiResponse::check_condition(SenseData::invalid_field(2)),
    }
}

/// READ CAPACITY (10) - 0x25
fn read_capacity_10(ctx: &CommandContext<'_>) -> ScsiResponse {
    let device = match ctx.device.read() {
        Ok(device) => device,
        Err(_) => return target_failure("device"),
    };
    let last_lba = device.block_count().saturating_sub(1);

    // Response is 8 bytes: last LBA (4 bytes) + block size (4 bytes)
    let mut data = vec![0u8; 8];
    // 0xFFFFFFFF tells the initiator to use READ CAPACITY 16
    BigEndian::write_u32(&mut data[0..4], u32::try_from(last_lba).unwrap_or(u32::MAX));
    BigEndian::write_u32(&mut data[4..8], device.block_size());
    ScsiResponse::good(data)
}

/// SERVICE ACTION IN (16) - only READ CAPACITY 16
fn service_action_in_16(ctx: &CommandContext<'_>) -> ScsiResponse {
    if ctx.cdb[1] & 0x1F != 0x10 {
        return ScsiResponse::check_condition(SenseData::invalid_field(1));
    }
    let alloc_len = BigEndian::read_u32(&ctx.cdb[10..14]) as usize;

    let device = match ctx.device.read() {
        Ok(device) => device,
        Err(_) => return target_failure("device"),
    };
    let mut data = vec![0u8; 32];
    BigEndian::write_u64(&mut data[0..8], device.block_count().saturating_sub(1));
    BigEndian::write_u32(&mut data[8..12], device.block_size());
    ScsiResponse::good(data).truncated(alloc_len)
}

/// READ (6/10/16)
fn read_blocks(ctx: &CommandContext<'_>) -> ScsiResponse {
    let Some((lba, blocks)) = transfer_extent(ctx.cdb) else {
        return ScsiResponse::check_condition(SenseData::invalid_command());
    };
    let device = match ctx.device.read() {
        Ok(device) => device,
        Err(_) => return target_failure("device"),
    };
    if blocks == 0 {
        return ScsiResponse::good_no_data();
    }
    if let Some(failure) = check_extent(ctx.cdb, &**device) {
        return failure;
    }
    if let Some(failure) = check_transfer_length(ctx.cdb, device.block_size(), ctx.expected_length) {
        return failure;
    }

    let Ok(length) = usize::try_from(blocks as u64 * device.block_size() as u64) else {
        return ScsiResponse::check_condition(SenseData::invalid_field(length_field(ctx.cdb[0])));
    };
    let mut data = vec![0u8; length];
    match device.read(lba, &mut data) {
        Ok(()) => ScsiResponse::good(data),
        Err(e) => {
            log::warn!("Read of {} blocks at LBA {} failed: {}", blocks, lba, e);
            ScsiResponse::check_condition(SenseData::medium_error())
        }
    }
}

/// WRITE (6/10/16)
fn write_blocks(ctx: &CommandContext<'_>) -> ScsiResponse {
    let Some((lba, blocks)) = transfer_extent(ctx.cdb) else {
        return ScsiResponse::check_condition(SenseData::invalid_command());
    };
    let mut device = match ctx.device.write() {
        Ok(device) => device,
        Err(_) => return target_failure("device"),
    };
    if blocks == 0 {
        return ScsiResponse::good_no_data();
    }
    if let Some(failure) = check_extent(ctx.cdb, &**device) {
        return failure;
    }
    if let Some(failure) = check_transfer_length(ctx.cdb, device.block_size(), ctx.expected_length) {
        return failure;
    }

    let expected = blocks as usize * device.block_size() as usize;
    if ctx.data_out.len() < expected {
        log::warn!(
            "Write data too short: got {}, need {}",
            ctx.data_out.len(),
            expected
        );
        return ScsiResponse::check_condition(SenseData::new(sense_key::ABORTED_COMMAND, 0x0C, 0x0D));
    }
    match device.write(lba, &ctx.data_out[..expected]) {
        Ok(()) => ScsiResponse::good_no_data(),
        Err(e) => {
            log::warn!("Write of {} blocks at LBA {} failed: {}", blocks, lba, e);
            ScsiResponse::check_condition(SenseData::new(sense_key::MEDIUM_ERROR, 0x0C, 0x00))
        }
    }
}

/// MODE SENSE (6) - 0x1A
fn mode_sense_6(ctx: &CommandContext<'_>) -> ScsiResponse {
    let alloc_len = ctx.cdb[4] as usize;

    // Minimal mode parameter header, no pages
    let mut data = vec![0u8; 4];
    data[0] = 3; // Mode data length (excluding this byte)
    ScsiResponse::good(data).truncated(alloc_len)
}

/// MODE SENSE (10) - 0x5A
fn mode_sense_10(ctx: &CommandContext<'_>) -> ScsiResponse {
    let alloc_len = BigEndian::read_u16(&ctx.cdb[7..9]) as usize;

    let mut data = vec![0u8; 8];
    BigEndian::write_u16(&mut data[0..2], 6); // Mode data length
    ScsiResponse::good(data).truncated(alloc_len)
}

/// SYNCHRONIZE CACHE - 0x35 / 0x91
fn synchronize_cache(ctx: &CommandContext<'_>) -> ScsiResponse {
    let mut device = match ctx.device.write() {
        Ok(device) => device,
        Err(_) => return target_failure("device"),
    };
    match device.flush() {
        Ok(()) => ScsiResponse::good_no_data(),
        Err(e) => {
            log::warn!("Flush failed: {}", e);
            ScsiResponse::check_condition(SenseData::medium_error())
        }
    }
}

/// REPORT LUNS - 0xA0
fn report_luns(ctx: &CommandContext<'_>) -> ScsiResponse {
    let alloc_len = BigEndian::read_u32(&ctx.cdb[6..10]) as usize;

    let mut data = vec![0u8; 8 + ctx.luns.len() * 8];
    BigEndian::write_u32(&mut data[0..4], (ctx.luns.len() * 8) as u32);
    for (i, &number) in ctx.luns.iter().enumerate() {
        BigEndian::write_u64(&mut data[8 + i * 8..16 + i * 8], lun::encode(number));
    }
    ScsiResponse::good(data).truncated(alloc_len)
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDevice;

    fn device(blocks: u64) -> RwLock<Box<dyn ScsiBlockDevice>> {
        RwLock::new(Box::new(MemoryDevice::new(blocks, 512)))
    }

    fn run(cdb: &[u8], device: &RwLock<Box<dyn ScsiBlockDevice>>, data_out: &[u8]) -> ScsiResponse {
        execute(&CommandContext {
            cdb,
            device,
            luns: &[0],
            data_out,
            expected_length: None,
        })
    }

    #[test]
    fn test_test_unit_ready() {
        let device = device(1000);
        let response = run(&[0x00, 0, 0, 0, 0, 0], &device, &[]);
        assert_eq!(response.status, scsi_status::GOOD);
    }

    #[test]
    fn test_inquiry() {
        let device = device(1000);
        let response = run(&[0x12, 0, 0, 0, 96, 0], &device, &[]);
        assert_eq!(response.status, scsi_status::GOOD);
        assert_eq!(response.data.len(), 36);
        assert_eq!(response.data[0], 0x00); // Block device
        assert_eq!(&response.data[8..16], b"ISCSI   ");
    }

    #[test]
    fn test_inquiry_vpd_pages() {
        let device = device(1000);
        let response = run(&[0x12, 0x01, 0x00, 0, 255, 0], &device, &[]);
        assert_eq!(response.data, vec![0x00, 0x00, 0x00, 3, 0x00, 0x80, 0x83]);

        let response = run(&[0x12, 0x01, 0x80, 0, 255, 0], &device, &[]);
        assert_eq!(&response.data[4..], b"ISCSI00000000001");

        let response = run(&[0x12, 0x01, 0x83, 0, 255, 0], &device, &[]);
        assert_eq!(response.data[3], 12);
        assert_eq!(response.data[8], 0x60);

        let response = run(&[0x12, 0x01, 0xB1, 0, 255, 0], &device, &[]);
        assert_eq!(response.status, scsi_status::CHECK_CONDITION);
    }

    #[test]
    fn test_read_capacity_10() {
        let device = device(1000);
        let response = run(&[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], &device, &[]);
        assert_eq!(response.status, scsi_status::GOOD);
        assert_eq!(BigEndian::read_u32(&response.data[0..4]), 999); // last LBA
        assert_eq!(BigEndian::read_u32(&response.data[4..8]), 512);
    }

    #[test]
    fn test_read_capacity_16() {
        let device = device(1000);
        let cdb = [0x9E, 0x10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 32, 0, 0];
        let response = run(&cdb, &device, &[]);
        assert_eq!(response.status, scsi_status::GOOD);
        assert_eq!(BigEndian::read_u64(&response.data[0..8]), 999);
        assert_eq!(BigEndian::read_u32(&response.data[8..12]), 512);
    }

    #[test]
    fn test_write_then_read_10() {
        let device = device(100);
        let payload: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        // WRITE(10): LBA=5, 2 blocks
        let response = run(&[0x2A, 0, 0, 0, 0, 5, 0, 0, 2, 0], &device, &payload);
        assert_eq!(response.status, scsi_status::GOOD);

        let response = run(&[0x28, 0, 0, 0, 0, 5, 0, 0, 2, 0], &device, &[]);
        assert_eq!(response.status, scsi_status::GOOD);
        assert_eq!(response.data, payload);
    }

    #[test]
    fn test_read_6_zero_length_means_256() {
        assert_eq!(transfer_extent(&[0x08, 0x01, 0x02, 0x03, 0, 0]), Some((0x010203, 256)));
        let device = device(100);
        let response = run(&[0x08, 0, 0, 0, 0, 0], &device, &[]);
        assert_eq!(response.status, scsi_status::CHECK_CONDITION);
    }

    #[test]
    fn test_read_10_out_of_range() {
        let device = device(100);
        // LBA=200 is past the end
        let response = run(&[0x28, 0, 0, 0, 0, 200, 0, 0, 1, 0], &device, &[]);
        assert_eq!(response.status, scsi_status::CHECK_CONDITION);
        let sense = response.sense.unwrap();
        assert_eq!(sense.asc, asc::LBA_OUT_OF_RANGE);
        assert_eq!(sense.field_pointer, Some(2));

        // starts inside, runs past the end
        let response = run(&[0x28, 0, 0, 0, 0, 99, 0, 0, 2, 0], &device, &[]);
        assert_eq!(response.sense.unwrap().field_pointer, Some(7));
    }

    #[test]
    fn test_short_write_data() {
        let device = device(100);
        let response = run(&[0x2A, 0, 0, 0, 0, 0, 0, 0, 2, 0], &device, &[0u8; 512]);
        assert_eq!(response.status, scsi_status::CHECK_CONDITION);
    }

    #[test]
    fn test_mode_sense() {
        let device = device(1000);
        let response = run(&[0x1A, 0, 0x3F, 0, 255, 0], &device, &[]);
        assert_eq!(response.status, scsi_status::GOOD);
        assert_eq!(response.data.len(), 4);

        let response = run(&[0x5A, 0, 0x3F, 0, 0, 0, 0, 0, 255, 0], &device, &[]);
        assert_eq!(response.status, scsi_status::GOOD);
        assert_eq!(response.data.len(), 8);
    }

    #[test]
    fn test_report_luns() {
        let device = device(1000);
        let cdb = [0xA0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0];
        let response = execute(&CommandContext {
            cdb: &cdb,
            device: &device,
            luns: &[0, 1],
            data_out: &[],
            expected_length: None,
        });
        assert_eq!(response.status, scsi_status::GOOD);
        assert_eq!(response.data.len(), 24);
        assert_eq!(BigEndian::read_u32(&response.data[0..4]), 16);
        assert_eq!(BigEndian::read_u64(&response.data[16..24]), 1 << 48);
    }

    #[test]
    fn test_request_sense() {
        let device = device(1000);
        let response = run(&[0x03, 0, 0, 0, 18, 0], &device, &[]);
        assert_eq!(response.status, scsi_status::GOOD);
        assert_eq!(response.data.len(), 18);
    }

    #[test]
    fn test_synchronize_cache() {
        let device = device(1000);
        let response = run(&[0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0], &device, &[]);
        assert_eq!(response.status, scsi_status::GOOD);
    }

    #[test]
    fn test_unsupported_command() {
        let device = device(1000);
        let response = run(&[0xFF, 0, 0, 0, 0, 0], &device, &[]);
        assert_eq!(response.status, scsi_status::CHECK_CONDITION);
        let sense = response.sense.unwrap();
        assert_eq!(sense.sense_key, sense_key::ILLEGAL_REQUEST);
        assert_eq!(sense.asc, asc::INVALID_COMMAND_OPERATION_CODE);
        let bytes = sense.to_bytes();
        assert_eq!(bytes[2], sense_key::ILLEGAL_REQUEST);
        assert_eq!(bytes[12], asc::INVALID_COMMAND_OPERATION_CODE);
    }

    #[test]
    fn test_sense_data_serialization() {
        let sense = SenseData::invalid_field(4);
        let data = sense.to_bytes();
        assert_eq!(data.len(), 18);
        assert_eq!(data[0], 0x70); // Current error, fixed format
        assert_eq!(data[2], sense_key::ILLEGAL_REQUEST);
        assert_eq!(data[12], asc::INVALID_FIELD_IN_CDB);
        assert_eq!(data[15], 0xC0);
        assert_eq!(BigEndian::read_u16(&data[16..18]), 4);
    }

    #[test]
    fn test_transfer_extent() {
        let cdb = [0x28, 0, 0, 0, 0, 100, 0, 0, 10, 0]; // LBA=100, length=10
        assert_eq!(transfer_extent(&cdb), Some((100, 10)));
        let cdb = [0x88, 0, 0, 0, 0, 0, 0, 0, 0, 100, 0, 0, 0, 10, 0, 0];
        assert_eq!(transfer_extent(&cdb), Some((100, 10)));
        assert_eq!(transfer_extent(&[0x12, 0, 0, 0, 0, 0]), None);
        assert_eq!(data_out_length(&[0x2A, 0, 0, 0, 0, 0, 0, 0, 3, 0], 512), 1536);
    }

    #[test]
    fn test_naca_bit() {
        assert!(naca(&[0x00, 0, 0, 0, 0, 0x04]));
        assert!(!naca(&[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0]));
        assert!(naca(&[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0x04]));
    }

    #[test]
    fn test_registry_is_unique() {
        for (i, a) in COMMANDS.iter().enumerate() {
            assert!(COMMANDS[i + 1..].iter().all(|b| b.opcode != a.opcode), "{} listed twice", a.name);
        }
        assert_eq!(lookup(0x2A).map(|c| c.direction), Some(DataDirection::Write));
    }

    /// Claims a terabyte-scale medium without backing it
    struct SparseDevice;

    impl ScsiBlockDevice for SparseDevice {
        fn read(&self, _lba: u64, buf: &mut [u8]) -> ScsiResult<()> {
            buf.fill(0);
            Ok(())
        }

        fn write(&mut self, _lba: u64, _buf: &[u8]) -> ScsiResult<()> {
            Ok(())
        }

        fn block_count(&self) -> u64 {
            1 << 40
        }

        fn block_size(&self) -> u32 {
            512
        }
    }

    #[test]
    fn test_read_longer_than_expected_length_is_refused() {
        let device: RwLock<Box<dyn ScsiBlockDevice>> = RwLock::new(Box::new(SparseDevice));
        // READ(16) of 0x7FFFFFFF blocks at LBA 0
        let mut cdb = [0u8; 16];
        cdb[0] = 0x88;
        BigEndian::write_u32(&mut cdb[10..14], 0x7FFF_FFFF);
        let response = execute(&CommandContext {
            cdb: &cdb,
            device: &device,
            luns: &[0],
            data_out: &[],
            expected_length: Some(512),
        });
        assert_eq!(response.status, scsi_status::CHECK_CONDITION);
        assert!(response.data.is_empty());
        let sense = response.sense.unwrap();
        assert_eq!(sense.sense_key, sense_key::ILLEGAL_REQUEST);
        assert_eq!(sense.asc, asc::INVALID_FIELD_IN_CDB);
        assert_eq!(sense.field_pointer, Some(10));

        // a read that fits the expected length goes through
        BigEndian::write_u32(&mut cdb[10..14], 1);
        let response = execute(&CommandContext {
            cdb: &cdb,
            device: &device,
            luns: &[0],
            data_out: &[],
            expected_length: Some(512),
        });
        assert_eq!(response.status, scsi_status::GOOD);
        assert_eq!(response.data.len(), 512);
    }

    #[test]
    fn test_check_transfer_length() {
        let read_10 = [0x28, 0, 0, 0, 0, 0, 0, 0, 4, 0];
        assert!(check_transfer_length(&read_10, 512, None).is_none());
        assert!(check_transfer_length(&read_10, 512, Some(2048)).is_none());
        let refused = check_transfer_length(&read_10, 512, Some(2047)).unwrap();
        assert_eq!(refused.sense.unwrap().field_pointer, Some(7));
        // not a READ or WRITE
        assert!(check_transfer_length(&[0x00; 6], 512, Some(0)).is_none());
    }
}
