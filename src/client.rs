//! iSCSI initiator connection
//!
//! This module provides a blocking initiator for one TCP connection. It is
//! used by the integration tests to drive the target and by
//! [`InitiatorSession`](crate::initiator::InitiatorSession) as the building
//! block of multi-connection sessions.
//!
//! # Overview
//!
//! The client provides:
//! - Login (security and operational stages) and discovery sessions
//! - READ CAPACITY, READ and WRITE with immediate data, unsolicited Data-Out
//!   and R2T-solicited bursts
//! - NOP-Out pings and logout
//! - Raw PDU transmission and reception for testing edge cases
//!
//! Every exchange is checked against the connection's
//! [`Sequencer`](crate::sequence::Sequencer), so calling `read` before the
//! capacity is known fails instead of confusing the target.
//!
//! # Example: Basic Connection and Login
//!
//! ```no_run
//! use iscsi_target::client::IscsiClient;
//!
//! # fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = IscsiClient::connect("127.0.0.1:3260")?;
//! client.login(
//!     "iqn.2025-12.local:initiator",
//!     "iqn.2025-12.local:storage.disk1",
//! )?;
//! let (blocks, block_size) = client.read_capacity()?;
//! let first = client.read(0, 1)?;
//! assert_eq!(first.len(), block_size as usize);
//! # let _ = blocks;
//! client.logout()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Raw PDU Transmission (for testing)
//!
//! ```no_run
//! use iscsi_target::client::IscsiClient;
//!
//! # fn test() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = IscsiClient::connect("127.0.0.1:3260")?;
//! client.login("iqn.2025-12.local:initiator", "iqn.2025-12.local:storage.disk1")?;
//!
//! // Header with an opcode no target knows
//! let mut header = [0u8; 48];
//! header[0] = 0x1c;
//! header[1] = 0x80;
//! client.send_raw(&header)?;
//!
//! let reject = client.recv_pdu()?;
//! # let _ = reject;
//! # Ok(())
//! # }
//! ```

use crate::digest::DigestType;
use crate::error::{decode_login_status, IscsiError, ProtocolError, ScsiResult};
use crate::login::VERSION;
use crate::parser::{
    lun, DataOutParser, LoginRequestParser, LoginStage, LogoutReason, LogoutRequestParser, NopOutParser,
    Parser, ScsiCommandParser, TaskAttribute, TextRequestParser,
};
use crate::pdu::{self, logout_response, ProtocolDataUnit, RESERVED_TAG};
use crate::scsi::{scsi_status, ScsiOpcode};
use crate::sequence::{SequenceState, Sequencer};
use crate::serial::SerialArithmeticNumber;
use crate::session::{SessionParams, SessionType};
use crate::transport;
use byteorder::{BigEndian, ByteOrder};
use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Socket read and write timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Round trips per login stage before giving up on the target
const MAX_LOGIN_ROUNDS: usize = 4;

/// Sequence counters shared by every connection of one session
#[derive(Debug)]
pub struct SessionCounters {
    cmd_sn: AtomicU32,
    max_cmd_sn: AtomicU32,
    itt: AtomicU32,
}

impl Default for SessionCounters {
    fn default() -> Self {
        SessionCounters {
            cmd_sn: AtomicU32::new(1),
            max_cmd_sn: AtomicU32::new(1),
            itt: AtomicU32::new(1),
        }
    }
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// CmdSN the next non-immediate command will carry
    pub fn cmd_sn(&self) -> u32 {
        self.cmd_sn.load(Ordering::SeqCst)
    }

    pub fn max_cmd_sn(&self) -> u32 {
        self.max_cmd_sn.load(Ordering::SeqCst)
    }

    /// Claim a CmdSN for a non-immediate command, if the window allows
    fn claim(&self) -> ScsiResult<u32> {
        let max = self.max_cmd_sn();
        let mut result = Ok(0);
        let _ = self.cmd_sn.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            if SerialArithmeticNumber::new(current).greater_than(max) {
                result = Err(IscsiError::Session(format!(
                    "command window closed: CmdSN {} beyond MaxCmdSN {}",
                    current, max
                )));
                None
            } else {
                result = Ok(current);
                Some(current.wrapping_add(1))
            }
        });
        result
    }

    fn next_itt(&self) -> u32 {
        loop {
            let itt = self.itt.fetch_add(1, Ordering::SeqCst);
            if itt != RESERVED_TAG {
                return itt;
            }
        }
    }

    /// Take a newer MaxCmdSN from a target response
    fn update_window(&self, max_cmd_sn: u32) {
        let _ = self.max_cmd_sn.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            SerialArithmeticNumber::new(max_cmd_sn)
                .greater_than(current)
                .then_some(max_cmd_sn)
        });
    }

    /// Start a fresh session at `cmd_sn` (the leading login's answer)
    fn reset(&self, exp_cmd_sn: u32, max_cmd_sn: u32) {
        self.cmd_sn.store(exp_cmd_sn, Ordering::SeqCst);
        self.max_cmd_sn.store(max_cmd_sn, Ordering::SeqCst);
    }
}

/// Status, data and sense of a finished SCSI command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScsiOutcome {
    pub status: u8,
    /// Data-In payload, trimmed to what the target sent
    pub data: Vec<u8>,
    /// Fixed-format sense data, empty unless CHECK CONDITION
    pub sense: Vec<u8>,
    pub residual_count: u32,
}

impl ScsiOutcome {
    /// Sense key of the attached sense data
    pub fn sense_key(&self) -> Option<u8> {
        self.sense.get(2).map(|b| b & 0x0F)
    }

    /// Additional sense code
    pub fn asc(&self) -> Option<u8> {
        self.sense.get(12).copied()
    }

    fn into_good(self, what: &str) -> ScsiResult<Self> {
        if self.status == scsi_status::GOOD {
            return Ok(self);
        }
        Err(IscsiError::Scsi(format!(
            "{} failed with status 0x{:02x} (sense key {:?}, ASC {:?})",
            what,
            self.status,
            self.sense_key(),
            self.asc()
        )))
    }
}

fn generate_isid() -> [u8; 6] {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let qualifier = NEXT.fetch_add(1, Ordering::SeqCst) as u16;
    let pid = std::process::id();
    // random format (T = 10b)
    [
        0x80,
        (pid >> 16) as u8,
        (pid >> 8) as u8,
        pid as u8,
        (qualifier >> 8) as u8,
        qualifier as u8,
    ]
}

/// iSCSI Client for one connection to a target
///
/// The client owns the TCP stream and performs every exchange synchronously:
/// a call returns once the target's final answer has arrived.
pub struct IscsiClient {
    stream: TcpStream,
    peer: SocketAddr,
    sequencer: Sequencer,
    params: SessionParams,
    isid: [u8; 6],
    tsih: u16,
    cid: u16,
    counters: Arc<SessionCounters>,
    exp_stat_sn: u32,
    lun: u64,
    /// (block count, block size) once READ CAPACITY has answered
    capacity: Option<(u64, u32)>,
    login_status: u16,
    logged_in: bool,
}

impl IscsiClient {
    /// Connect to an iSCSI target at the given address
    ///
    /// # Arguments
    ///
    /// * `addr` - Address and port (e.g., "127.0.0.1:3260")
    ///
    /// # Errors
    ///
    /// Returns an error if the address doesn't resolve or the TCP connection fails
    pub fn connect<A: ToSocketAddrs>(addr: A) -> ScsiResult<Self> {
        Self::open(addr, generate_isid(), 0, 0, Arc::new(SessionCounters::new()))
    }

    /// Connect a further connection of an existing session
    ///
    /// The login that follows carries `tsih` and `isid`, so the target adds
    /// the connection to that session. `counters` must be the ones of the
    /// session's other connections.
    pub fn join<A: ToSocketAddrs>(
        addr: A,
        isid: [u8; 6],
        tsih: u16,
        cid: u16,
        counters: Arc<SessionCounters>,
    ) -> ScsiResult<Self> {
        Self::open(addr, isid, tsih, cid, counters)
    }

    fn open<A: ToSocketAddrs>(
        addr: A,
        isid: [u8; 6],
        tsih: u16,
        cid: u16,
        counters: Arc<SessionCounters>,
    ) -> ScsiResult<Self> {
        let peer = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| IscsiError::Config("address resolved to nothing".to_string()))?;
        let stream = transport::connect(peer, Some(DEFAULT_TIMEOUT))?;
        log::debug!("Connected to {} (CID {})", peer, cid);

        Ok(IscsiClient {
            stream,
            peer,
            sequencer: Sequencer::new(),
            params: SessionParams::default(),
            isid,
            tsih,
            cid,
            counters,
            exp_stat_sn: 0,
            lun: 0,
            capacity: None,
            login_status: 0,
            logged_in: false,
        })
    }

    /// Parameters offered at login; change them before calling `login`
    pub fn params_mut(&mut self) -> &mut SessionParams {
        &mut self.params
    }

    /// Parameters as negotiated (or to be offered, before login)
    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Logical unit addressed by `read`, `write` and `read_capacity`
    pub fn set_lun(&mut self, lun: u64) {
        self.lun = lun;
        self.capacity = None;
    }

    /// Perform iSCSI login (security negotiation + operational negotiation)
    ///
    /// # Arguments
    ///
    /// * `initiator_name` - IQN of the initiator (e.g., "iqn.2025-12.local:initiator")
    /// * `target_name` - IQN of the target (e.g., "iqn.2025-12.local:storage.disk1")
    ///
    /// # Errors
    ///
    /// Returns an error if login fails at any phase; the login status code
    /// stays available through [`login_status`](Self::login_status).
    pub fn login(&mut self, initiator_name: &str, target_name: &str) -> ScsiResult<()> {
        self.params.initiator_name = initiator_name.to_string();
        self.params.target_name = target_name.to_string();
        self.params.session_type = SessionType::Normal;
        self.login_stages(vec![
            ("InitiatorName".to_string(), initiator_name.to_string()),
            ("TargetName".to_string(), target_name.to_string()),
            ("SessionType".to_string(), "Normal".to_string()),
            ("AuthMethod".to_string(), "None".to_string()),
        ])
    }

    /// Discover available targets at the connected portal
    ///
    /// Logs in a discovery session, asks `SendTargets=All` and logs out again.
    ///
    /// # Returns
    ///
    /// A vector of tuples containing (target_iqn, target_address)
    ///
    /// # Example
    ///
    /// ```no_run
    /// use iscsi_target::client::IscsiClient;
    ///
    /// # fn test() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut client = IscsiClient::connect("127.0.0.1:3260")?;
    /// let targets = client.discover("iqn.2025-12.local:initiator")?;
    /// for (iqn, addr) in targets {
    ///     println!("Target: {} at {}", iqn, addr);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn discover(&mut self, initiator_name: &str) -> ScsiResult<Vec<(String, String)>> {
        self.params.initiator_name = initiator_name.to_string();
        self.params.target_name.clear();
        self.params.session_type = SessionType::Discovery;
        self.login_stages(vec![
            ("InitiatorName".to_string(), initiator_name.to_string()),
            ("SessionType".to_string(), "Discovery".to_string()),
            ("AuthMethod".to_string(), "None".to_string()),
        ])?;

        let answer = self.text(vec![("SendTargets".to_string(), "All".to_string())])?;
        let mut targets = Vec::new();
        let mut current: Option<String> = None;
        for (key, value) in answer {
            match key.as_str() {
                "TargetName" => current = Some(value),
                "TargetAddress" => {
                    if let Some(iqn) = current.clone() {
                        // "host:port,portal-group-tag"
                        let addr = value.split(',').next().unwrap_or(&value).to_string();
                        targets.push((iqn, addr));
                    }
                }
                _ => log::debug!("Ignoring discovery key {}={}", key, value),
            }
        }

        self.logout()?;
        Ok(targets)
    }

    /// Security stage then operational stage, as one login
    fn login_stages(&mut self, security: Vec<(String, String)>) -> ScsiResult<()> {
        if self.logged_in {
            return Err(IscsiError::Session("already logged in".to_string()));
        }
        let mut keys = security;
        let mut rounds = 0;
        loop {
            let (next, _) = self.login_step(
                LoginStage::SecurityNegotiation,
                LoginStage::LoginOperationalNegotiation,
                std::mem::take(&mut keys),
            )?;
            if next == LoginStage::LoginOperationalNegotiation {
                break;
            }
            rounds += 1;
            if rounds >= MAX_LOGIN_ROUNDS {
                self.sequencer.close();
                return Err(IscsiError::Auth(format!(
                    "target did not leave security negotiation after {} rounds",
                    rounds
                )));
            }
        }

        let mut keys = self.params.offer_params();
        let mut rounds = 0;
        loop {
            let (next, tsih) = self.login_step(
                LoginStage::LoginOperationalNegotiation,
                LoginStage::FullFeaturePhase,
                std::mem::take(&mut keys),
            )?;
            if next == LoginStage::FullFeaturePhase {
                self.tsih = tsih;
                break;
            }
            rounds += 1;
            if rounds >= MAX_LOGIN_ROUNDS {
                self.sequencer.close();
                return Err(IscsiError::Session(format!(
                    "target did not finish operational negotiation after {} rounds",
                    rounds
                )));
            }
        }

        self.logged_in = true;
        log::info!(
            "Logged in to {} ({} session, TSIH {}, CID {}, digests {}/{})",
            self.peer,
            self.params.session_type.as_str(),
            self.tsih,
            self.cid,
            self.params.header_digest.as_str(),
            self.params.data_digest.as_str()
        );
        Ok(())
    }

    /// One Login Request / Login Response round trip, including any text
    /// continuation. Returns the stage the target moved to and its TSIH.
    fn login_step(
        &mut self,
        current: LoginStage,
        next: LoginStage,
        keys: Vec<(String, String)>,
    ) -> ScsiResult<(LoginStage, u16)> {
        self.sequencer.advance(SequenceState::LoginRequest)?;
        let itt = self.counters.next_itt();
        let mut text = Vec::new();
        let mut data = pdu::serialize_text_parameters(&keys);

        loop {
            let request = LoginRequestParser {
                continue_flag: false,
                current_stage: current,
                next_stage: next,
                version_max: VERSION,
                version_min: VERSION,
                isid: self.isid,
                tsih: self.tsih,
                cid: self.cid,
                cmd_sn: self.counters.cmd_sn(),
                exp_stat_sn: self.exp_stat_sn,
            };
            let pdu = ProtocolDataUnit::new(Parser::LoginRequest(request))
                .with_itt(itt)
                .with_immediate(true)
                .with_final(true)
                .with_data(std::mem::take(&mut data));
            pdu.write_to(&mut self.stream)?;

            // digests only start after login
            let response = self.receive(DigestType::None, DigestType::None)?;
            let Parser::LoginResponse(parser) = response.parser() else {
                self.sequencer.close();
                return Err(unexpected(&response, "Login Response"));
            };
            self.login_status = parser.status();
            if parser.status_class != 0 {
                self.sequencer.close();
                let message = decode_login_status(parser.status_class, parser.status_detail);
                log::warn!("Login to {} failed: {}", self.peer, message);
                return Err(if parser.status() == pdu::login_status::AUTH_FAILURE {
                    IscsiError::Auth(message)
                } else {
                    IscsiError::Session(format!("login failed: {}", message))
                });
            }

            text.extend_from_slice(&response.data);
            if parser.continue_flag {
                // more text pending; ask for the rest with an empty request
                continue;
            }

            self.sequencer.advance(SequenceState::LoginResponse)?;
            for (key, value) in pdu::parse_text_parameters(&text)? {
                log::debug!("Target answered {}={}", key, value);
                self.params.apply_target_param(&key, &value);
            }

            let moved = if response.bhs.final_flag {
                parser.next_stage
            } else {
                current
            };
            if moved == LoginStage::FullFeaturePhase && self.tsih == 0 {
                self.counters.reset(parser.exp_cmd_sn, parser.max_cmd_sn);
            }
            return Ok((moved, parser.tsih));
        }
    }

    /// Ask the logical unit for its size
    ///
    /// Uses READ CAPACITY(10) and falls back to READ CAPACITY(16) when the
    /// device has more blocks than 32 bits can address.
    ///
    /// # Returns
    ///
    /// (number of blocks, block size in bytes)
    pub fn read_capacity(&mut self) -> ScsiResult<(u64, u32)> {
        let mut cdb = [0u8; 10];
        cdb[0] = ScsiOpcode::ReadCapacity10 as u8;
        let outcome = self.capacity_command(&cdb, 8)?;
        if outcome.data.len() < 8 {
            return Err(IscsiError::Scsi(format!(
                "READ CAPACITY(10) returned {} bytes",
                outcome.data.len()
            )));
        }
        let last = BigEndian::read_u32(&outcome.data[0..4]);
        let block_size = BigEndian::read_u32(&outcome.data[4..8]);

        let capacity = if last == u32::MAX {
            let mut cdb = [0u8; 16];
            cdb[0] = ScsiOpcode::ServiceActionIn16 as u8;
            cdb[1] = 0x10;
            BigEndian::write_u32(&mut cdb[10..14], 32);
            let outcome = self.capacity_command(&cdb, 32)?;
            if outcome.data.len() < 12 {
                return Err(IscsiError::Scsi(format!(
                    "READ CAPACITY(16) returned {} bytes",
                    outcome.data.len()
                )));
            }
            (
                BigEndian::read_u64(&outcome.data[0..8]).wrapping_add(1),
                BigEndian::read_u32(&outcome.data[8..12]),
            )
        } else {
            (last as u64 + 1, block_size)
        };
        log::debug!("LUN {}: {} blocks of {} bytes", self.lun, capacity.0, capacity.1);
        self.capacity = Some(capacity);
        Ok(capacity)
    }

    fn capacity_command(&mut self, cdb: &[u8], length: u32) -> ScsiResult<ScsiOutcome> {
        self.sequencer.advance(SequenceState::CapacityRequest)?;
        let outcome = self.data_in_command(cdb, length);
        if outcome.is_ok() {
            self.sequencer.advance(SequenceState::CapacityResponse)?;
            self.sequencer.advance(SequenceState::WaitingForWork)?;
        }
        outcome?.into_good("READ CAPACITY")
    }

    fn block_size(&self) -> ScsiResult<u32> {
        self.capacity
            .map(|(_, block_size)| block_size)
            .ok_or_else(|| IscsiError::Session("capacity unknown; call read_capacity first".to_string()))
    }

    /// Read `blocks` blocks starting at `lba`
    pub fn read(&mut self, lba: u64, blocks: u32) -> ScsiResult<Vec<u8>> {
        let block_size = self.block_size()?;
        let cdb = rw_cdb(false, lba, blocks);
        let length = blocks
            .checked_mul(block_size)
            .ok_or_else(|| IscsiError::Scsi(format!("read of {} blocks is too long", blocks)))?;

        self.sequencer.advance(SequenceState::ReadRequest)?;
        let outcome = self.data_in_command(&cdb, length);
        if outcome.is_ok() {
            self.sequencer.advance(SequenceState::ReadResponse)?;
            self.sequencer.advance(SequenceState::WaitingForWork)?;
        }
        Ok(outcome?.into_good("READ")?.data)
    }

    /// Write `data` starting at `lba`; `data` must be whole blocks
    pub fn write(&mut self, lba: u64, data: &[u8]) -> ScsiResult<()> {
        let block_size = self.block_size()? as usize;
        if data.is_empty() || data.len() % block_size != 0 {
            return Err(IscsiError::Scsi(format!(
                "write of {} bytes is not a whole number of {} byte blocks",
                data.len(),
                block_size
            )));
        }
        let blocks = u32::try_from(data.len() / block_size)
            .map_err(|_| IscsiError::Scsi(format!("write of {} bytes is too long", data.len())))?;
        let cdb = rw_cdb(true, lba, blocks);
        self.data_out_command(&cdb, data)?.into_good("WRITE")?;
        Ok(())
    }

    /// Send any CDB that moves no data or reads at most `data_in_length`
    /// bytes, returning status and sense instead of failing on CHECK
    /// CONDITION
    pub fn send_scsi_command(&mut self, cdb: &[u8], data_in_length: u32) -> ScsiResult<ScsiOutcome> {
        self.sequencer.advance(SequenceState::ReadRequest)?;
        let outcome = self.data_in_command(cdb, data_in_length)?;
        self.sequencer.advance(SequenceState::ReadResponse)?;
        self.sequencer.advance(SequenceState::WaitingForWork)?;
        Ok(outcome)
    }

    /// Command header without a CmdSN; claim one only once nothing can fail
    fn command_pdu(&self, cdb: &[u8], read: bool, write: bool, length: u32) -> ScsiResult<ScsiCommandParser> {
        if cdb.is_empty() || cdb.len() > 16 {
            return Err(IscsiError::Scsi(format!("CDB of {} bytes (must be 1 to 16)", cdb.len())));
        }
        let mut padded = [0u8; 16];
        padded[..cdb.len()].copy_from_slice(cdb);
        Ok(ScsiCommandParser {
            read,
            write,
            task_attribute: TaskAttribute::Simple,
            lun: lun::encode(self.lun),
            expected_data_transfer_length: length,
            cmd_sn: 0,
            exp_stat_sn: self.exp_stat_sn,
            cdb: padded,
        })
    }

    fn data_in_command(&mut self, cdb: &[u8], length: u32) -> ScsiResult<ScsiOutcome> {
        self.require_login()?;
        let mut command = self.command_pdu(cdb, length > 0, false, length)?;
        command.cmd_sn = self.counters.claim()?;
        let itt = self.counters.next_itt();
        log::debug!("SCSI 0x{:02x} ITT 0x{:08x} CmdSN {} reading {} bytes", cdb[0], itt, command.cmd_sn, length);
        self.send_pdu(
            ProtocolDataUnit::new(Parser::ScsiCommand(command))
                .with_itt(itt)
                .with_final(true),
        )?;

        let mut data = vec![0u8; length as usize];
        let mut received = 0usize;
        loop {
            let response = self.receive_for(itt)?;
            match response.parser() {
                Parser::DataIn(data_in) => {
                    let start = data_in.buffer_offset as usize;
                    let end = start + response.data.len();
                    if end > data.len() {
                        return Err(IscsiError::Protocol(ProtocolError::invalid(
                            "Data-In buffer offset",
                            data_in.buffer_offset,
                        )));
                    }
                    data[start..end].copy_from_slice(&response.data);
                    received = received.max(end);
                    if data_in.status_flag {
                        data.truncate(received);
                        return Ok(ScsiOutcome {
                            status: data_in.status,
                            data,
                            sense: Vec::new(),
                            residual_count: data_in.residual_count,
                        });
                    }
                }
                Parser::ScsiResponse(status) => {
                    data.truncate(received);
                    return Ok(ScsiOutcome {
                        status: status.status,
                        data,
                        sense: sense_of(&response.data),
                        residual_count: status.residual_count,
                    });
                }
                _ => return Err(unexpected(&response, "Data-In or SCSI Response")),
            }
        }
    }

    fn data_out_command(&mut self, cdb: &[u8], data: &[u8]) -> ScsiResult<ScsiOutcome> {
        self.require_login()?;
        let total = data.len();
        let segment = (self.params.max_xmit_data_segment_length as usize).max(512);
        let first_burst = self.params.first_burst_length as usize;
        let immediate = if self.params.immediate_data {
            total.min(first_burst).min(segment)
        } else {
            0
        };
        let unsolicited_end = if self.params.initial_r2t {
            immediate
        } else {
            total.min(first_burst).max(immediate)
        };
        let unsolicited = unsolicited_end > immediate;

        let mut command = self.command_pdu(cdb, false, true, total as u32)?;
        self.sequencer.advance(SequenceState::WriteRequest)?;
        command.cmd_sn = self.counters.claim()?;
        let itt = self.counters.next_itt();
        log::debug!(
            "SCSI 0x{:02x} ITT 0x{:08x} CmdSN {} writing {} bytes ({} immediate, {} unsolicited)",
            cdb[0],
            itt,
            command.cmd_sn,
            total,
            immediate,
            unsolicited_end - immediate
        );
        self.send_pdu(
            ProtocolDataUnit::new(Parser::ScsiCommand(command))
                .with_itt(itt)
                .with_final(!unsolicited)
                .with_data(data[..immediate].to_vec()),
        )?;

        if unsolicited {
            self.sequencer.advance(SequenceState::WriteFirstBurst)?;
            self.send_burst(itt, RESERVED_TAG, data, immediate, unsolicited_end, segment)?;
        }
        self.sequencer.advance(SequenceState::WriteSecondResponse)?;

        loop {
            let response = self.receive_for(itt)?;
            match response.parser() {
                Parser::Ready2Transfer(r2t) => {
                    let start = r2t.buffer_offset as usize;
                    let end = start + r2t.desired_data_transfer_length as usize;
                    if end > total || start >= end {
                        return Err(IscsiError::Protocol(ProtocolError::invalid(
                            "R2T desired data transfer length",
                            r2t.desired_data_transfer_length,
                        )));
                    }
                    self.sequencer.advance(SequenceState::WriteSecondBurst)?;
                    self.send_burst(itt, r2t.target_transfer_tag, data, start, end, segment)?;
                    self.sequencer.advance(SequenceState::WriteSecondResponse)?;
                }
                Parser::ScsiResponse(status) => {
                    self.sequencer.advance(SequenceState::WaitingForWork)?;
                    return Ok(ScsiOutcome {
                        status: status.status,
                        data: Vec::new(),
                        sense: sense_of(&response.data),
                        residual_count: status.residual_count,
                    });
                }
                _ => return Err(unexpected(&response, "R2T or SCSI Response")),
            }
        }
    }

    /// Data-Out PDUs covering `data[start..end]`, the last one final
    fn send_burst(&mut self, itt: u32, ttt: u32, data: &[u8], start: usize, end: usize, segment: usize) -> ScsiResult<()> {
        let mut offset = start;
        let mut data_sn = 0u32;
        while offset < end {
            let stop = (offset + segment).min(end);
            let data_out = DataOutParser {
                lun: lun::encode(self.lun),
                target_transfer_tag: ttt,
                exp_stat_sn: self.exp_stat_sn,
                data_sn,
                buffer_offset: offset as u32,
            };
            self.send_pdu(
                ProtocolDataUnit::new(Parser::DataOut(data_out))
                    .with_itt(itt)
                    .with_final(stop == end)
                    .with_data(data[offset..stop].to_vec()),
            )?;
            data_sn = data_sn.wrapping_add(1);
            offset = stop;
        }
        Ok(())
    }

    /// Text request/response exchange, following continuations
    fn text(&mut self, keys: Vec<(String, String)>) -> ScsiResult<Vec<(String, String)>> {
        self.sequencer.check_idle("Text Request")?;
        self.require_login()?;
        let itt = self.counters.next_itt();
        let mut data = pdu::serialize_text_parameters(&keys);
        let mut ttt = RESERVED_TAG;
        let mut answer = Vec::new();
        loop {
            let request = TextRequestParser {
                continue_flag: false,
                lun: 0,
                target_transfer_tag: ttt,
                cmd_sn: self.counters.claim()?,
                exp_stat_sn: self.exp_stat_sn,
            };
            self.send_pdu(
                ProtocolDataUnit::new(Parser::TextRequest(request))
                    .with_itt(itt)
                    .with_final(true)
                    .with_data(std::mem::take(&mut data)),
            )?;
            let response = self.receive_for(itt)?;
            let Parser::TextResponse(parser) = response.parser() else {
                return Err(unexpected(&response, "Text Response"));
            };
            answer.extend_from_slice(&response.data);
            if response.bhs.final_flag {
                return pdu::parse_text_parameters(&answer);
            }
            ttt = parser.target_transfer_tag;
        }
    }

    /// Ping the target; returns the echoed payload
    pub fn nop(&mut self, payload: &[u8]) -> ScsiResult<Vec<u8>> {
        self.sequencer.check_idle("NOP-Out")?;
        self.require_login()?;
        let itt = self.counters.next_itt();
        let nop = NopOutParser {
            lun: 0,
            target_transfer_tag: RESERVED_TAG,
            cmd_sn: self.counters.cmd_sn(),
            exp_stat_sn: self.exp_stat_sn,
        };
        self.send_pdu(
            ProtocolDataUnit::new(Parser::NopOut(nop))
                .with_itt(itt)
                .with_immediate(true)
                .with_final(true)
                .with_data(payload.to_vec()),
        )?;
        let response = self.receive_for(itt)?;
        match response.parser() {
            Parser::NopIn(_) => Ok(response.data),
            _ => Err(unexpected(&response, "NOP-In")),
        }
    }

    /// Perform iSCSI logout, closing the whole session
    pub fn logout(&mut self) -> ScsiResult<()> {
        self.logout_with(LogoutReason::CloseSession)
    }

    /// Log out only this connection; the session's other connections stay
    pub fn logout_connection(&mut self) -> ScsiResult<()> {
        self.logout_with(LogoutReason::CloseConnection)
    }

    fn logout_with(&mut self, reason: LogoutReason) -> ScsiResult<()> {
        self.require_login()?;
        self.sequencer.advance(SequenceState::LogoutRequest)?;
        let itt = self.counters.next_itt();
        let request = LogoutRequestParser {
            reason,
            cid: self.cid,
            cmd_sn: self.counters.cmd_sn(),
            exp_stat_sn: self.exp_stat_sn,
        };
        self.send_pdu(
            ProtocolDataUnit::new(Parser::LogoutRequest(request))
                .with_itt(itt)
                .with_immediate(true)
                .with_final(true),
        )?;
        let response = self.receive_for(itt)?;
        let Parser::LogoutResponse(parser) = response.parser() else {
            return Err(unexpected(&response, "Logout Response"));
        };
        self.sequencer.advance(SequenceState::LogoutResponse)?;
        if parser.response != logout_response::SUCCESS {
            return Err(IscsiError::Session(format!(
                "logout refused with response {}",
                parser.response
            )));
        }
        log::info!(
            "Logged out of {} ({:?}, Time2Wait {} s, Time2Retain {} s)",
            self.peer,
            reason,
            parser.time2wait,
            parser.time2retain
        );
        self.close();
        Ok(())
    }

    /// Drop the connection without logging out
    pub fn close(&mut self) {
        if self.sequencer.state() != SequenceState::ConnectionClosed {
            self.sequencer.close();
        }
        self.logged_in = false;
        if let Err(e) = transport::Transport::close(&self.stream) {
            log::debug!("Closing connection to {}: {}", self.peer, e);
        }
    }

    /// Send a PDU to the target with the negotiated digests
    pub fn send_pdu(&mut self, pdu: ProtocolDataUnit) -> ScsiResult<()> {
        let pdu = pdu.with_digests(self.params.header_digest, self.params.data_digest);
        let result = transport::send(&mut self.stream, &pdu);
        if result.is_err() {
            self.sequencer.close();
        }
        result
    }

    /// Send raw bytes, e.g. a malformed PDU for edge case testing
    pub fn send_raw(&mut self, bytes: &[u8]) -> ScsiResult<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Receive the next PDU from the target with the negotiated digests
    pub fn recv_pdu(&mut self) -> ScsiResult<ProtocolDataUnit> {
        let (header_digest, data_digest) = if self.logged_in {
            (self.params.header_digest, self.params.data_digest)
        } else {
            (DigestType::None, DigestType::None)
        };
        self.receive(header_digest, data_digest)
    }

    fn receive(&mut self, header_digest: DigestType, data_digest: DigestType) -> ScsiResult<ProtocolDataUnit> {
        let pdu = match transport::receive(&mut self.stream, header_digest, data_digest) {
            Ok(pdu) => pdu,
            Err(e) => {
                if e.is_fatal() {
                    self.sequencer.close();
                }
                return Err(e);
            }
        };
        if let Some(stat_sn) = pdu.parser().stat_sn() {
            if !SerialArithmeticNumber::new(stat_sn).less_than(self.exp_stat_sn) {
                self.exp_stat_sn = stat_sn.wrapping_add(1);
            }
        }
        if let Some((_, max_cmd_sn)) = pdu.parser().command_window() {
            self.counters.update_window(max_cmd_sn);
        }
        Ok(pdu)
    }

    /// Next PDU answering `itt`; a Reject fails the request
    fn receive_for(&mut self, itt: u32) -> ScsiResult<ProtocolDataUnit> {
        loop {
            let pdu = self.recv_pdu()?;
            match pdu.parser() {
                Parser::Reject(reject) => {
                    let rejected = pdu
                        .data
                        .get(16..20)
                        .map(BigEndian::read_u32)
                        .unwrap_or(RESERVED_TAG);
                    if rejected == itt || rejected == RESERVED_TAG {
                        return Err(IscsiError::Session(format!("target rejected the request: {:?}", reject.reason)));
                    }
                    log::warn!("Reject for ITT 0x{:08x} while waiting for 0x{:08x}", rejected, itt);
                }
                Parser::AsyncMessage(message) => {
                    log::warn!("Async message from {}: {:?}", self.peer, message.async_event);
                }
                Parser::NopIn(nop) if pdu.itt() == RESERVED_TAG => {
                    log::debug!("Unsolicited NOP-In from {} (TTT 0x{:08x})", self.peer, nop.target_transfer_tag);
                }
                _ if pdu.itt() == itt => return Ok(pdu),
                _ => log::warn!(
                    "Ignoring {} for ITT 0x{:08x} while waiting for 0x{:08x}",
                    pdu.opcode().name(),
                    pdu.itt(),
                    itt
                ),
            }
        }
    }

    fn require_login(&self) -> ScsiResult<()> {
        if self.logged_in {
            Ok(())
        } else {
            Err(IscsiError::Session("Not logged in. Call login() first.".to_string()))
        }
    }

    /// Status class and detail of the last Login Response, e.g. 0x0203
    pub fn login_status(&self) -> u16 {
        self.login_status
    }

    pub fn sequence_state(&self) -> SequenceState {
        self.sequencer.state()
    }

    pub fn isid(&self) -> [u8; 6] {
        self.isid
    }

    pub fn tsih(&self) -> u16 {
        self.tsih
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }

    /// Counters to hand to `join` for further connections of this session
    pub fn counters(&self) -> Arc<SessionCounters> {
        Arc::clone(&self.counters)
    }

    /// Get the current command sequence number
    pub fn cmd_sn(&self) -> u32 {
        self.counters.cmd_sn()
    }

    /// Get the current expected status sequence number
    pub fn exp_stat_sn(&self) -> u32 {
        self.exp_stat_sn
    }

    /// Get the maximum command sequence number from target
    pub fn max_cmd_sn(&self) -> u32 {
        self.counters.max_cmd_sn()
    }

    /// Check if client is logged in (in full feature phase)
    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }
}

impl std::fmt::Debug for IscsiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IscsiClient")
            .field("peer", &self.peer)
            .field("tsih", &self.tsih)
            .field("cid", &self.cid)
            .field("state", &self.sequencer.state())
            .finish()
    }
}

/// READ/WRITE CDB, the 10-byte form when the request fits
fn rw_cdb(write: bool, lba: u64, blocks: u32) -> Vec<u8> {
    if lba <= u32::MAX as u64 && blocks <= u16::MAX as u32 {
        let mut cdb = vec![0u8; 10];
        cdb[0] = (if write { ScsiOpcode::Write10 } else { ScsiOpcode::Read10 }) as u8;
        BigEndian::write_u32(&mut cdb[2..6], lba as u32);
        BigEndian::write_u16(&mut cdb[7..9], blocks as u16);
        cdb
    } else {
        let mut cdb = vec![0u8; 16];
        cdb[0] = (if write { ScsiOpcode::Write16 } else { ScsiOpcode::Read16 }) as u8;
        BigEndian::write_u64(&mut cdb[2..10], lba);
        BigEndian::write_u32(&mut cdb[10..14], blocks);
        cdb
    }
}

/// Sense bytes out of a SCSI Response data segment (2-byte length prefix)
fn sense_of(data: &[u8]) -> Vec<u8> {
    if data.len() < 2 {
        return Vec::new();
    }
    let length = BigEndian::read_u16(&data[0..2]) as usize;
    data[2..].iter().take(length).copied().collect()
}

fn unexpected(pdu: &ProtocolDataUnit, wanted: &str) -> IscsiError {
    IscsiError::Protocol(ProtocolError::SequenceViolation {
        state: format!("waiting for {}", wanted),
        received: pdu.opcode().name().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rw_cdb_forms() {
        let cdb = rw_cdb(false, 0x1234, 8);
        assert_eq!(cdb.len(), 10);
        assert_eq!(cdb[0], 0x28);
        assert_eq!(BigEndian::read_u32(&cdb[2..6]), 0x1234);
        assert_eq!(BigEndian::read_u16(&cdb[7..9]), 8);

        let cdb = rw_cdb(true, 1 << 33, 8);
        assert_eq!(cdb.len(), 16);
        assert_eq!(cdb[0], 0x8A);
        assert_eq!(BigEndian::read_u64(&cdb[2..10]), 1 << 33);

        // too many blocks for READ(10)
        assert_eq!(rw_cdb(false, 0, 70_000)[0], 0x88);
    }

    #[test]
    fn test_sense_extraction() {
        let mut data = vec![0u8, 18];
        let mut sense = vec![0u8; 18];
        sense[0] = 0x70;
        sense[2] = 0x05;
        sense[12] = 0x21;
        data.extend_from_slice(&sense);
        data.extend_from_slice(&[0xAA, 0xBB]);

        let outcome = ScsiOutcome {
            status: scsi_status::CHECK_CONDITION,
            sense: sense_of(&data),
            ..Default::default()
        };
        assert_eq!(outcome.sense.len(), 18);
        assert_eq!(outcome.sense_key(), Some(0x05));
        assert_eq!(outcome.asc(), Some(0x21));
        assert!(outcome.into_good("READ").is_err());

        assert!(sense_of(&[]).is_empty());
    }

    #[test]
    fn test_counters_respect_window() {
        let counters = SessionCounters::new();
        counters.reset(10, 11);
        assert_eq!(counters.claim().unwrap(), 10);
        assert_eq!(counters.claim().unwrap(), 11);
        assert!(matches!(counters.claim(), Err(IscsiError::Session(_))));
        assert_eq!(counters.cmd_sn(), 12);

        // an older MaxCmdSN never shrinks the window
        counters.update_window(5);
        assert_eq!(counters.max_cmd_sn(), 11);
        counters.update_window(20);
        assert_eq!(counters.claim().unwrap(), 12);
    }

    #[test]
    fn test_itt_skips_reserved_tag() {
        let counters = SessionCounters::new();
        counters.itt.store(RESERVED_TAG, Ordering::SeqCst);
        assert_eq!(counters.next_itt(), 0);
    }

    #[test]
    fn test_isids_differ() {
        let a = generate_isid();
        let b = generate_isid();
        assert_eq!(a[0] & 0xC0, 0x80);
        assert_ne!(a, b);
    }
}
