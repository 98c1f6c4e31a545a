//! iSCSI PDU (Protocol Data Unit) parsing and serialization
//!
//! This module handles the binary protocol format for iSCSI PDUs
//! based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720
//!
//! A PDU is the 48-byte Basic Header Segment, zero or more Additional Header
//! Segments, an optional header digest, the data segment padded to four
//! bytes, and an optional data digest. Everything that depends on the opcode
//! lives in the [`Parser`] variant held by the BHS.

use crate::digest::DigestType;
use crate::error::{IscsiError, ProtocolError, ScsiResult};
use crate::parser::{Parser, PduParser};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::io::{Cursor, Read, Write};

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Largest value the 24-bit DataSegmentLength field can carry
pub const MAX_DATA_SEGMENT_LENGTH: usize = 0x00FF_FFFF;

/// Reserved tag value meaning "no task" (ITT) or "no transfer" (TTT)
pub const RESERVED_TAG: u32 = 0xFFFF_FFFF;

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (initiator → target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;
    pub const SNACK_REQUEST: u8 = 0x10;

    // Target opcodes (target → initiator)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const TASK_MANAGEMENT_RESPONSE: u8 = 0x22;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const ASYNC_MESSAGE: u8 = 0x32;
    pub const REJECT: u8 = 0x3F;
}

/// iSCSI PDU flags (commonly used across PDU types)
pub mod flags {
    pub const IMMEDIATE: u8 = 0x40;
    pub const FINAL: u8 = 0x80;
    pub const CONTINUE: u8 = 0x40;

    // SCSI command flags
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;
    pub const ATTRIBUTE_MASK: u8 = 0x07;

    // Login flags
    pub const TRANSIT: u8 = 0x80;
    pub const CONTINUE_LOGIN: u8 = 0x40;

    // SCSI Response / Data-In residual flags
    pub const BIDI_OVERFLOW: u8 = 0x10;
    pub const BIDI_UNDERFLOW: u8 = 0x08;
    pub const RESIDUAL_OVERFLOW: u8 = 0x04;
    pub const RESIDUAL_UNDERFLOW: u8 = 0x02;

    // Data-In
    pub const ACKNOWLEDGE: u8 = 0x40;
    pub const STATUS: u8 = 0x01;
}

/// Login status classes (RFC 3720 Section 10.13.5)
pub mod login_status {
    pub const SUCCESS: u8 = 0x00;
    pub const REDIRECTION: u8 = 0x01;
    pub const INITIATOR_ERROR: u8 = 0x02;
    pub const TARGET_ERROR: u8 = 0x03;

    // Status detail codes, class in the high byte
    pub const SUCCESS_ACCEPT: u16 = 0x0000;
    pub const TARGET_MOVED_TEMPORARILY: u16 = 0x0101;
    pub const TARGET_MOVED_PERMANENTLY: u16 = 0x0102;
    pub const INITIATOR_ERROR_GENERIC: u16 = 0x0200;
    pub const AUTH_FAILURE: u16 = 0x0201;
    pub const AUTHORIZATION_FAILURE: u16 = 0x0202;
    pub const TARGET_NOT_FOUND: u16 = 0x0203;
    pub const TARGET_REMOVED: u16 = 0x0204;
    pub const UNSUPPORTED_VERSION: u16 = 0x0205;
    pub const TOO_MANY_CONNECTIONS: u16 = 0x0206;
    pub const MISSING_PARAMETER: u16 = 0x0207;
    pub const CANT_INCLUDE_IN_SESSION: u16 = 0x0208;
    pub const SESSION_TYPE_NOT_SUPPORTED: u16 = 0x0209;
    pub const SESSION_DOES_NOT_EXIST: u16 = 0x020A;
    pub const INVALID_DURING_LOGIN: u16 = 0x020B;
    pub const TARGET_ERROR_GENERIC: u16 = 0x0300;
    pub const SERVICE_UNAVAILABLE: u16 = 0x0301;
    pub const OUT_OF_RESOURCES: u16 = 0x0302;
}

/// Logout response codes
pub mod logout_response {
    pub const SUCCESS: u8 = 0;
    pub const CID_NOT_FOUND: u8 = 1;
    pub const CONNECTION_RECOVERY_NOT_SUPPORTED: u8 = 2;
    pub const CLEANUP_FAILED: u8 = 3;
}

/// The 6-bit operation code of a PDU
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    NopOut = opcode::NOP_OUT,
    ScsiCommand = opcode::SCSI_COMMAND,
    TaskManagementRequest = opcode::TASK_MANAGEMENT_REQUEST,
    LoginRequest = opcode::LOGIN_REQUEST,
    TextRequest = opcode::TEXT_REQUEST,
    ScsiDataOut = opcode::SCSI_DATA_OUT,
    LogoutRequest = opcode::LOGOUT_REQUEST,
    SnackRequest = opcode::SNACK_REQUEST,
    NopIn = opcode::NOP_IN,
    ScsiResponse = opcode::SCSI_RESPONSE,
    TaskManagementResponse = opcode::TASK_MANAGEMENT_RESPONSE,
    LoginResponse = opcode::LOGIN_RESPONSE,
    TextResponse = opcode::TEXT_RESPONSE,
    ScsiDataIn = opcode::SCSI_DATA_IN,
    LogoutResponse = opcode::LOGOUT_RESPONSE,
    Ready2Transfer = opcode::R2T,
    AsyncMessage = opcode::ASYNC_MESSAGE,
    Reject = opcode::REJECT,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value & 0x3F {
            opcode::NOP_OUT => Opcode::NopOut,
            opcode::SCSI_COMMAND => Opcode::ScsiCommand,
            opcode::TASK_MANAGEMENT_REQUEST => Opcode::TaskManagementRequest,
            opcode::LOGIN_REQUEST => Opcode::LoginRequest,
            opcode::TEXT_REQUEST => Opcode::TextRequest,
            opcode::SCSI_DATA_OUT => Opcode::ScsiDataOut,
            opcode::LOGOUT_REQUEST => Opcode::LogoutRequest,
            opcode::SNACK_REQUEST => Opcode::SnackRequest,
            opcode::NOP_IN => Opcode::NopIn,
            opcode::SCSI_RESPONSE => Opcode::ScsiResponse,
            opcode::TASK_MANAGEMENT_RESPONSE => Opcode::TaskManagementResponse,
            opcode::LOGIN_RESPONSE => Opcode::LoginResponse,
            opcode::TEXT_RESPONSE => Opcode::TextResponse,
            opcode::SCSI_DATA_IN => Opcode::ScsiDataIn,
            opcode::LOGOUT_RESPONSE => Opcode::LogoutResponse,
            opcode::R2T => Opcode::Ready2Transfer,
            opcode::ASYNC_MESSAGE => Opcode::AsyncMessage,
            opcode::REJECT => Opcode::Reject,
            other => return Err(ProtocolError::UnsupportedOperationCode(other)),
        })
    }
}

impl Opcode {
    /// Name for logs
    pub fn name(self) -> &'static str {
        match self {
            Opcode::NopOut => "NOP-Out",
            Opcode::ScsiCommand => "SCSI Command",
            Opcode::TaskManagementRequest => "Task Management Request",
            Opcode::LoginRequest => "Login Request",
            Opcode::TextRequest => "Text Request",
            Opcode::ScsiDataOut => "SCSI Data-Out",
            Opcode::LogoutRequest => "Logout Request",
            Opcode::SnackRequest => "SNACK Request",
            Opcode::NopIn => "NOP-In",
            Opcode::ScsiResponse => "SCSI Response",
            Opcode::TaskManagementResponse => "Task Management Response",
            Opcode::LoginResponse => "Login Response",
            Opcode::TextResponse => "Text Response",
            Opcode::ScsiDataIn => "SCSI Data-In",
            Opcode::LogoutResponse => "Logout Response",
            Opcode::Ready2Transfer => "Ready To Transfer",
            Opcode::AsyncMessage => "Async Message",
            Opcode::Reject => "Reject",
        }
    }

    /// Sent by initiators (as opposed to targets)
    pub fn is_initiator_opcode(self) -> bool {
        (self as u8) < 0x20
    }
}

/// Basic Header Segment (BHS) - 48 bytes
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///     /              |               |               |               |
///    |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///    +---------------+---------------+---------------+---------------+
///   4|TotalAHSLength | DataSegmentLength                             |
///    +---------------+---------------+---------------+---------------+
///   8| LUN or Opcode-specific fields                                 |
///    +                                                               +
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Initiator Task Tag                                            |
///    +---------------+---------------+---------------+---------------+
///  20| Opcode-specific fields (28 bytes)                             |
///    +                                                               +
///  ...
///  44|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
///
/// For Login PDUs the F bit position carries the Transit flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicHeaderSegment {
    /// Immediate delivery flag (bit 6 of byte 0)
    pub immediate: bool,
    /// Final flag (bit 7 of byte 1)
    pub final_flag: bool,
    /// Total AHS length in 4-byte words
    pub total_ahs_length: u8,
    /// Data segment length in bytes, excluding padding
    pub data_segment_length: u32,
    /// Initiator Task Tag (bytes 16-19)
    pub initiator_task_tag: u32,
    /// Opcode-specific fields
    pub parser: Parser,
}

impl BasicHeaderSegment {
    pub fn new(parser: Parser) -> Self {
        BasicHeaderSegment {
            immediate: false,
            final_flag: false,
            total_ahs_length: 0,
            data_segment_length: 0,
            initiator_task_tag: 0,
            parser,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.parser.opcode()
    }

    /// Decode the first 48 bytes of `buf`
    pub fn decode(buf: &[u8]) -> ScsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::BufferUnderflow {
                needed: BHS_SIZE,
                available: buf.len(),
            });
        }
        let mut header = [0u8; BHS_SIZE];
        header.copy_from_slice(&buf[..BHS_SIZE]);

        let mut cursor = Cursor::new(&header[..]);

        // Byte 0: reserved bit, Immediate flag and Opcode
        let byte0 = cursor.read_u8()?;
        if byte0 & 0x80 != 0 {
            return Err(IscsiError::MalformedHeader(format!(
                "reserved bit set in first header byte 0x{:02x}",
                byte0
            )));
        }
        let immediate = byte0 & flags::IMMEDIATE != 0;
        let opcode = Opcode::try_from(byte0 & 0x3F)?;

        // Byte 1: F bit, the rest belongs to the parser
        let final_flag = cursor.read_u8()? & flags::FINAL != 0;

        // Byte 4: Total AHS Length, bytes 5-7: Data Segment Length
        cursor.set_position(4);
        let total_ahs_length = cursor.read_u8()?;
        let data_segment_length = cursor.read_u24::<BigEndian>()?;

        // Bytes 16-19: Initiator Task Tag
        cursor.set_position(16);
        let initiator_task_tag = cursor.read_u32::<BigEndian>()?;

        let parser = Parser::decode(opcode, &header, final_flag)?;

        Ok(BasicHeaderSegment {
            immediate,
            final_flag,
            total_ahs_length,
            data_segment_length,
            initiator_task_tag,
            parser,
        })
    }

    /// Encode into a fresh 48-byte header; reserved fields are zero
    pub fn encode(&self) -> [u8; BHS_SIZE] {
        let mut header = [0u8; BHS_SIZE];

        header[0] = (self.opcode() as u8) | if self.immediate { flags::IMMEDIATE } else { 0 };
        if self.final_flag {
            header[1] |= flags::FINAL;
        }
        header[4] = self.total_ahs_length;
        BigEndian::write_u24(&mut header[5..8], self.data_segment_length & 0x00FF_FFFF);
        BigEndian::write_u32(&mut header[16..20], self.initiator_task_tag);

        self.parser.serialize(&mut header);
        header
    }
}

/// Types of Additional Header Segment (RFC 3720 Section 10.2.2)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AhsType {
    ExtendedCdb = 1,
    ExpectedBidirectionalReadDataLength = 2,
}

impl TryFrom<u8> for AhsType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AhsType::ExtendedCdb),
            2 => Ok(AhsType::ExpectedBidirectionalReadDataLength),
            other => Err(ProtocolError::invalid("AHSType", other)),
        }
    }
}

/// Additional Header Segment
///
/// `specific` holds everything after the type byte, starting with the
/// reserved byte, so its length is exactly the AHSLength field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalHeaderSegment {
    pub ahs_type: AhsType,
    pub specific: Vec<u8>,
}

impl AdditionalHeaderSegment {
    /// Extended CDB AHS carrying CDB bytes beyond the 16 in the BHS
    pub fn extended_cdb(overflow: &[u8]) -> Self {
        let mut specific = Vec::with_capacity(overflow.len() + 1);
        specific.push(0);
        specific.extend_from_slice(overflow);
        AdditionalHeaderSegment {
            ahs_type: AhsType::ExtendedCdb,
            specific,
        }
    }

    /// Expected bidirectional read data length AHS
    pub fn bidirectional_read_length(length: u32) -> Self {
        let mut specific = vec![0u8; 5];
        BigEndian::write_u32(&mut specific[1..5], length);
        AdditionalHeaderSegment {
            ahs_type: AhsType::ExpectedBidirectionalReadDataLength,
            specific,
        }
    }

    /// Read data length, if this is a bidirectional read length AHS
    pub fn read_data_length(&self) -> Option<u32> {
        match self.ahs_type {
            AhsType::ExpectedBidirectionalReadDataLength if self.specific.len() == 5 => {
                Some(BigEndian::read_u32(&self.specific[1..5]))
            }
            _ => None,
        }
    }

    /// Bytes on the wire, padded to a multiple of four
    pub fn wire_len(&self) -> usize {
        pad4(3 + self.specific.len())
    }

    fn write_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&(self.specific.len() as u16).to_be_bytes());
        out.push(self.ahs_type as u8);
        out.extend_from_slice(&self.specific);
        out.resize(start + self.wire_len(), 0);
    }

    /// Parse one AHS from the front of `buf`, returning it and its wire length
    fn read_from(buf: &[u8]) -> ScsiResult<(Self, usize)> {
        if buf.len() < 4 {
            return Err(IscsiError::MalformedHeader(format!(
                "{} bytes left in AHS area, need at least 4",
                buf.len()
            )));
        }
        let length = BigEndian::read_u16(&buf[0..2]) as usize;
        let ahs_type = AhsType::try_from(buf[2])?;
        let wire_len = pad4(3 + length);
        if wire_len > buf.len() {
            return Err(IscsiError::MalformedHeader(format!(
                "AHS length {} overruns the {} byte AHS area",
                length,
                buf.len()
            )));
        }
        Ok((
            AdditionalHeaderSegment {
                ahs_type,
                specific: buf[3..3 + length].to_vec(),
            },
            wire_len,
        ))
    }
}

/// Round up to the next multiple of four
pub fn pad4(len: usize) -> usize {
    len.div_ceil(4) * 4
}

/// A complete iSCSI PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDataUnit {
    pub bhs: BasicHeaderSegment,
    pub ahs: Vec<AdditionalHeaderSegment>,
    /// Data segment without padding
    pub data: Vec<u8>,
    pub header_digest: DigestType,
    pub data_digest: DigestType,
}

impl ProtocolDataUnit {
    /// Empty PDU around a parser, no digests
    pub fn new(parser: Parser) -> Self {
        ProtocolDataUnit {
            bhs: BasicHeaderSegment::new(parser),
            ahs: Vec::new(),
            data: Vec::new(),
            header_digest: DigestType::None,
            data_digest: DigestType::None,
        }
    }

    pub fn with_itt(mut self, itt: u32) -> Self {
        self.bhs.initiator_task_tag = itt;
        self
    }

    pub fn with_final(mut self, final_flag: bool) -> Self {
        self.bhs.final_flag = final_flag;
        self
    }

    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.bhs.immediate = immediate;
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.bhs.data_segment_length = data.len() as u32;
        self.data = data;
        self
    }

    pub fn with_ahs(mut self, ahs: AdditionalHeaderSegment) -> Self {
        self.ahs.push(ahs);
        self.bhs.total_ahs_length = (self.ahs.iter().map(|a| a.wire_len()).sum::<usize>() / 4) as u8;
        self
    }

    pub fn with_digests(mut self, header: DigestType, data: DigestType) -> Self {
        self.header_digest = header;
        self.data_digest = data;
        self
    }

    pub fn opcode(&self) -> Opcode {
        self.bhs.opcode()
    }

    pub fn parser(&self) -> &Parser {
        &self.bhs.parser
    }

    pub fn itt(&self) -> u32 {
        self.bhs.initiator_task_tag
    }

    fn ahs_len(&self) -> usize {
        self.ahs.iter().map(|a| a.wire_len()).sum()
    }

    fn data_digest_len(&self) -> usize {
        if self.data.is_empty() {
            0
        } else {
            self.data_digest.size()
        }
    }

    /// Bytes this PDU takes on the wire
    pub fn size(&self) -> usize {
        BHS_SIZE
            + self.ahs_len()
            + self.header_digest.size()
            + pad4(self.data.len())
            + self.data_digest_len()
    }

    /// Serialize, taking the length fields from the actual AHS and data
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());

        let mut header = self.bhs.encode();
        header[4] = (self.ahs_len() / 4) as u8;
        BigEndian::write_u24(&mut header[5..8], self.data.len().min(MAX_DATA_SEGMENT_LENGTH) as u32);
        buf.extend_from_slice(&header);

        for ahs in &self.ahs {
            ahs.write_into(&mut buf);
        }
        if let Some(digest) = self.header_digest.compute(&[&buf]) {
            buf.extend_from_slice(&digest.to_be_bytes());
        }

        if !self.data.is_empty() {
            let data_start = buf.len();
            buf.extend_from_slice(&self.data);
            buf.resize(data_start + pad4(self.data.len()), 0);
            if let Some(digest) = self.data_digest.compute(&[&buf[data_start..]]) {
                buf.extend_from_slice(&digest.to_be_bytes());
            }
        }

        buf
    }

    /// Parse one complete PDU from `buf`, validating negotiated digests
    pub fn deserialize(buf: &[u8], header_digest: DigestType, data_digest: DigestType) -> ScsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::BufferUnderflow {
                needed: BHS_SIZE,
                available: buf.len(),
            });
        }
        let needed = frame_length(&buf[..BHS_SIZE], header_digest, data_digest);
        if buf.len() < needed {
            return Err(IscsiError::BufferUnderflow {
                needed,
                available: buf.len(),
            });
        }

        let ahs_bytes = buf[4] as usize * 4;
        let data_length = BigEndian::read_u24(&buf[5..8]) as usize;
        let mut offset = BHS_SIZE + ahs_bytes;

        if header_digest.size() > 0 {
            let received = BigEndian::read_u32(&buf[offset..offset + 4]);
            let digest = digest_of(header_digest, &buf[..offset]);
            digest.validate(crate::error::DigestKind::Header, received)?;
            offset += header_digest.size();
        }

        let bhs = BasicHeaderSegment::decode(buf)?;

        let mut ahs = Vec::new();
        let mut ahs_offset = BHS_SIZE;
        while ahs_offset < BHS_SIZE + ahs_bytes {
            let (segment, len) = AdditionalHeaderSegment::read_from(&buf[ahs_offset..BHS_SIZE + ahs_bytes])?;
            ahs.push(segment);
            ahs_offset += len;
        }

        let data = buf[offset..offset + data_length].to_vec();
        if data_length > 0 && data_digest.size() > 0 {
            let padded = pad4(data_length);
            let received = BigEndian::read_u32(&buf[offset + padded..offset + padded + 4]);
            let digest = digest_of(data_digest, &buf[offset..offset + padded]);
            digest.validate(crate::error::DigestKind::Data, received)?;
        }

        Ok(ProtocolDataUnit {
            bhs,
            ahs,
            data,
            header_digest,
            data_digest,
        })
    }

    /// Write the serialized PDU to a stream
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> ScsiResult<()> {
        writer.write_all(&self.serialize())?;
        writer.flush()?;
        Ok(())
    }

    /// Read exactly one PDU from a stream
    pub fn read_from<R: Read + ?Sized>(reader: &mut R, header_digest: DigestType, data_digest: DigestType) -> ScsiResult<Self> {
        let frame = read_frame(reader, header_digest, data_digest)?;
        ProtocolDataUnit::deserialize(&frame, header_digest, data_digest)
    }
}

fn digest_of(kind: DigestType, bytes: &[u8]) -> Box<dyn crate::digest::Digest> {
    let mut digest = kind.create();
    digest.update(bytes);
    digest
}

/// Total wire length of the PDU whose BHS is `header`
pub fn frame_length(header: &[u8], header_digest: DigestType, data_digest: DigestType) -> usize {
    let ahs_bytes = header[4] as usize * 4;
    let data_length = BigEndian::read_u24(&header[5..8]) as usize;
    let data_part = if data_length > 0 {
        pad4(data_length) + data_digest.size()
    } else {
        0
    };
    BHS_SIZE + ahs_bytes + header_digest.size() + data_part
}

/// Read the raw bytes of one PDU without interpreting them
///
/// Keeps the stream aligned on PDU boundaries even when the PDU later fails
/// to decode, so the caller can answer with a Reject and carry on.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, header_digest: DigestType, data_digest: DigestType) -> ScsiResult<Vec<u8>> {
    let mut frame = vec![0u8; BHS_SIZE];
    reader.read_exact(&mut frame)?;
    let total = frame_length(&frame, header_digest, data_digest);
    frame.resize(total, 0);
    reader.read_exact(&mut frame[BHS_SIZE..])?;
    Ok(frame)
}

// ============================================================================
// Text parameters
// ============================================================================

/// Parse iSCSI text parameters (null-terminated key=value pairs)
pub fn parse_text_parameters(data: &[u8]) -> ScsiResult<Vec<(String, String)>> {
    let mut params = Vec::new();

    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }

        let s = String::from_utf8_lossy(chunk);
        match s.find('=') {
            Some(eq_pos) => {
                params.push((s[..eq_pos].to_string(), s[eq_pos + 1..].to_string()));
            }
            None => {
                return Err(IscsiError::Protocol(ProtocolError::InvalidFieldValue {
                    field: "text parameter",
                    value: chunk.len() as u64,
                }));
            }
        }
    }

    Ok(params)
}

/// Serialize text parameters to null-terminated format
pub fn serialize_text_parameters(params: &[(String, String)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in params {
        data.extend_from_slice(key.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{DataOutParser, NopOutParser, Ready2TransferParser, ScsiCommandParser};

    const R2T_VECTOR: [u8; 48] = [
        0x31, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0xd9, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0xda,
        0x00, 0x00, 0x00, 0xda, 0x00, 0x00, 0x00, 0xfa, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x10, 0x00,
    ];

    #[test]
    fn test_r2t_vector_roundtrip() {
        let pdu = ProtocolDataUnit::deserialize(&R2T_VECTOR, DigestType::None, DigestType::None).unwrap();
        assert_eq!(pdu.opcode(), Opcode::Ready2Transfer);
        assert!(pdu.bhs.final_flag);
        assert_eq!(pdu.itt(), 0xd9);

        match pdu.parser() {
            Parser::Ready2Transfer(r2t) => {
                assert_eq!(r2t.target_transfer_tag, 0x0000_0001);
                assert_eq!(r2t.stat_sn, 0x0000_00DA);
                assert_eq!(r2t.exp_cmd_sn, 0x0000_00DA);
                assert_eq!(r2t.max_cmd_sn, 0x0000_00FA);
                assert_eq!(r2t.r2t_sn, 0);
                assert_eq!(r2t.buffer_offset, 0);
                assert_eq!(r2t.desired_data_transfer_length, 0x0000_1000);
            }
            other => panic!("expected R2T parser, got {:?}", other),
        }

        assert_eq!(pdu.serialize(), R2T_VECTOR.to_vec());
    }

    #[test]
    fn test_short_buffer_is_underflow() {
        let result = BasicHeaderSegment::decode(&[0u8; 20]);
        assert!(matches!(
            result,
            Err(IscsiError::BufferUnderflow { needed: 48, available: 20 })
        ));
    }

    #[test]
    fn test_unknown_opcode() {
        let mut header = [0u8; BHS_SIZE];
        header[0] = 0x1f;
        match BasicHeaderSegment::decode(&header) {
            Err(IscsiError::Protocol(ProtocolError::UnsupportedOperationCode(0x1f))) => {}
            other => panic!("expected unsupported opcode, got {:?}", other),
        }
    }

    #[test]
    fn test_reserved_bit_is_malformed() {
        let mut header = [0u8; BHS_SIZE];
        header[0] = 0x80;
        assert!(matches!(
            BasicHeaderSegment::decode(&header),
            Err(IscsiError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_immediate_flag() {
        let pdu = ProtocolDataUnit::new(Parser::NopOut(NopOutParser {
            target_transfer_tag: RESERVED_TAG,
            ..Default::default()
        }))
        .with_immediate(true)
        .with_final(true);

        let bytes = pdu.serialize();
        assert_eq!(bytes[0], 0x40);
        assert_eq!(bytes[1], 0x80);

        let parsed = ProtocolDataUnit::deserialize(&bytes, DigestType::None, DigestType::None).unwrap();
        assert!(parsed.bhs.immediate);
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_data_padding_and_size() {
        let pdu = ProtocolDataUnit::new(Parser::DataOut(DataOutParser::default()))
            .with_final(true)
            .with_data(vec![1, 2, 3]);
        let bytes = pdu.serialize();
        assert_eq!(bytes.len(), BHS_SIZE + 4);
        assert_eq!(pdu.size(), bytes.len());
        assert_eq!(&bytes[5..8], &[0, 0, 3]);
        assert_eq!(&bytes[48..52], &[1, 2, 3, 0]);
    }

    #[test]
    fn test_digests_roundtrip_and_detect_corruption() {
        let pdu = ProtocolDataUnit::new(Parser::DataOut(DataOutParser {
            target_transfer_tag: 7,
            data_sn: 2,
            buffer_offset: 8192,
            ..Default::default()
        }))
        .with_final(true)
        .with_itt(0x10)
        .with_data(b"hello, world".to_vec())
        .with_digests(DigestType::CRC32C, DigestType::CRC32C);

        let mut bytes = pdu.serialize();
        assert_eq!(bytes.len(), pdu.size());
        assert_eq!(bytes.len(), BHS_SIZE + 4 + 12 + 4);

        let parsed = ProtocolDataUnit::deserialize(&bytes, DigestType::CRC32C, DigestType::CRC32C).unwrap();
        assert_eq!(parsed, pdu);

        // flip a data byte: data digest fails, not fatal
        bytes[BHS_SIZE + 4] ^= 0xFF;
        let err = ProtocolDataUnit::deserialize(&bytes, DigestType::CRC32C, DigestType::CRC32C).unwrap_err();
        assert!(!err.is_fatal());

        // flip a header byte: header digest fails, fatal
        bytes[BHS_SIZE + 4] ^= 0xFF;
        bytes[20] ^= 0x01;
        let err = ProtocolDataUnit::deserialize(&bytes, DigestType::CRC32C, DigestType::CRC32C).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_ahs_roundtrip() {
        let mut cdb = [0u8; 16];
        cdb[0] = 0x7F;
        let pdu = ProtocolDataUnit::new(Parser::ScsiCommand(ScsiCommandParser {
            read: true,
            write: true,
            expected_data_transfer_length: 4096,
            cdb,
            ..Default::default()
        }))
        .with_final(true)
        .with_ahs(AdditionalHeaderSegment::extended_cdb(&[1, 2, 3, 4, 5, 6, 7, 8]))
        .with_ahs(AdditionalHeaderSegment::bidirectional_read_length(512));

        assert_eq!(pdu.bhs.total_ahs_length, 3 + 2);
        let bytes = pdu.serialize();
        assert_eq!(bytes[4], 5);
        assert_eq!(&bytes[48..51], &[0, 9, 1]);

        let parsed = ProtocolDataUnit::deserialize(&bytes, DigestType::None, DigestType::None).unwrap();
        assert_eq!(parsed.ahs.len(), 2);
        assert_eq!(parsed.ahs[1].read_data_length(), Some(512));
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_read_frame_leaves_stream_aligned() {
        let first = ProtocolDataUnit::new(Parser::DataOut(DataOutParser::default()))
            .with_final(true)
            .with_data(vec![9; 5])
            .serialize();
        let mut second = R2T_VECTOR.to_vec();
        second[0] = 0x1f; // unsupported opcode, still framed by its lengths

        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        stream.extend_from_slice(&R2T_VECTOR);
        let mut reader = Cursor::new(stream);

        let frame = read_frame(&mut reader, DigestType::None, DigestType::None).unwrap();
        assert_eq!(frame, first);
        let bad = ProtocolDataUnit::read_from(&mut reader, DigestType::None, DigestType::None);
        assert!(bad.unwrap_err().as_protocol().is_some());
        let good = ProtocolDataUnit::read_from(&mut reader, DigestType::None, DigestType::None).unwrap();
        assert!(matches!(good.parser(), Parser::Ready2Transfer(Ready2TransferParser { desired_data_transfer_length: 4096, .. })));
    }

    #[test]
    fn test_parse_text_parameters() {
        let data = b"Key1=Value1\0Key2=Value2\0";
        let params = parse_text_parameters(data).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], ("Key1".to_string(), "Value1".to_string()));
        assert_eq!(params[1], ("Key2".to_string(), "Value2".to_string()));
        assert!(parse_text_parameters(b"NoEquals\0").is_err());
    }

    #[test]
    fn test_serialize_text_parameters() {
        let params = vec![
            ("Key1".to_string(), "Value1".to_string()),
            ("Key2".to_string(), "Value2".to_string()),
        ];
        let data = serialize_text_parameters(&params);
        assert_eq!(data, b"Key1=Value1\0Key2=Value2\0");
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!(Opcode::LoginRequest.name(), "Login Request");
        assert_eq!(Opcode::try_from(0x21).unwrap().name(), "SCSI Response");
        assert!(Opcode::ScsiDataOut.is_initiator_opcode());
        assert!(!Opcode::Reject.is_initiator_opcode());
    }
}
