//! iSCSI session management
//!
//! This module handles connection phases, session parameters and their
//! negotiation, command ordering, and the registry of live sessions
//! based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720

use crate::digest::DigestType;
use crate::error::{IscsiError, ProtocolError, ScsiResult};
use crate::parser::LoginStage;
use crate::pdu::Opcode;
use crate::serial::SerialArithmeticNumber;
use crate::tsih::TsihAllocator;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Commands a session accepts beyond ExpCmdSN (MaxCmdSN - ExpCmdSN + 1)
pub const DEFAULT_COMMAND_WINDOW: u32 = 32;

/// Connection phases (RFC 3720 Section 5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// Security negotiation (authentication)
    #[default]
    SecurityNegotiation,
    /// Login operational parameter negotiation
    LoginOperationalNegotiation,
    /// Full feature phase - ready for SCSI commands
    FullFeaturePhase,
    /// Logout in progress
    Logout,
    /// Nothing more is read or written
    ConnectionClosed,
}

impl ConnectionPhase {
    /// Phase named by a login stage code
    pub fn from_stage(stage: LoginStage) -> Self {
        match stage {
            LoginStage::SecurityNegotiation => ConnectionPhase::SecurityNegotiation,
            LoginStage::LoginOperationalNegotiation => ConnectionPhase::LoginOperationalNegotiation,
            LoginStage::FullFeaturePhase => ConnectionPhase::FullFeaturePhase,
        }
    }

    pub fn is_login(self) -> bool {
        matches!(
            self,
            ConnectionPhase::SecurityNegotiation | ConnectionPhase::LoginOperationalNegotiation
        )
    }

    /// Phase after a login request/response exchange.
    ///
    /// The connection only moves when both sides set Transit and name the
    /// same next stage; otherwise it stays in the request's current stage.
    pub fn after_login(
        request_csg: LoginStage,
        request_transit: bool,
        request_nsg: LoginStage,
        response_transit: bool,
        response_nsg: LoginStage,
    ) -> Self {
        if request_transit && response_transit && request_nsg == response_nsg {
            ConnectionPhase::from_stage(response_nsg)
        } else {
            ConnectionPhase::from_stage(request_csg)
        }
    }

    /// Whether a PDU with this opcode may arrive from the initiator now
    pub fn check(self, opcode: Opcode) -> Result<(), ProtocolError> {
        match self {
            ConnectionPhase::SecurityNegotiation | ConnectionPhase::LoginOperationalNegotiation => {
                if opcode == Opcode::LoginRequest {
                    Ok(())
                } else {
                    Err(ProtocolError::InvalidDuringLogin(opcode.name().to_string()))
                }
            }
            ConnectionPhase::FullFeaturePhase => {
                if opcode == Opcode::LoginRequest || !opcode.is_initiator_opcode() {
                    Err(ProtocolError::SequenceViolation {
                        state: format!("{:?}", self),
                        received: opcode.name().to_string(),
                    })
                } else {
                    Ok(())
                }
            }
            ConnectionPhase::Logout | ConnectionPhase::ConnectionClosed => {
                Err(ProtocolError::SequenceViolation {
                    state: format!("{:?}", self),
                    received: opcode.name().to_string(),
                })
            }
        }
    }
}

/// Session type (RFC 3720 Section 5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Default)]
pub enum SessionType {
    /// Normal session for SCSI commands
    #[default]
    Normal,
    /// Discovery session for target discovery (SendTargets)
    Discovery,
}

impl SessionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::Normal => "Normal",
            SessionType::Discovery => "Discovery",
        }
    }
}

/// Negotiated session parameters (RFC 3720 Section 12)
#[derive(Debug, Clone)]
pub struct SessionParams {
    // Connection parameters
    /// Maximum data segment length we can receive (default: 8192)
    pub max_recv_data_segment_length: u32,
    /// Maximum data segment length the other side can receive
    pub max_xmit_data_segment_length: u32,

    // Session parameters
    /// Maximum connections per session
    pub max_connections: u16,
    /// Maximum burst length for solicited data (default: 262144)
    pub max_burst_length: u32,
    /// First burst length for unsolicited data (default: 65536)
    pub first_burst_length: u32,
    /// Default time to wait before reconnecting (seconds)
    pub default_time2wait: u16,
    /// Default time to retain connection (seconds)
    pub default_time2retain: u16,
    /// Maximum outstanding R2T (Ready to Transfer) PDUs
    pub max_outstanding_r2t: u32,
    /// Data PDU in order (within a sequence)
    pub data_pdu_in_order: bool,
    /// Data sequence in order
    pub data_sequence_in_order: bool,
    /// Error recovery level (0-2)
    pub error_recovery_level: u8,
    /// Immediate data allowed
    pub immediate_data: bool,
    /// Initial R2T required
    pub initial_r2t: bool,

    // Digest settings
    /// Header digest (None, CRC32C)
    pub header_digest: DigestType,
    /// Data digest (None, CRC32C)
    pub data_digest: DigestType,

    // Names
    /// Session type requested by the initiator
    pub session_type: SessionType,
    /// Target name (IQN)
    pub target_name: String,
    /// Initiator name (IQN)
    pub initiator_name: String,
    /// Target alias (optional)
    pub target_alias: String,
    /// Initiator alias (optional)
    pub initiator_alias: String,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            max_recv_data_segment_length: 8192,
            max_xmit_data_segment_length: 8192,
            max_connections: 1,
            max_burst_length: 262144,
            first_burst_length: 65536,
            default_time2wait: 2,
            default_time2retain: 20,
            max_outstanding_r2t: 1,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: 0,
            immediate_data: true,
            initial_r2t: false,  // Allow immediate data without waiting for R2T
            header_digest: DigestType::None,
            data_digest: DigestType::None,
            session_type: SessionType::Normal,
            target_name: String::new(),
            initiator_name: String::new(),
            target_alias: String::new(),
            initiator_alias: String::new(),
        }
    }
}

fn yes_no(value: bool) -> String {
    if value { "Yes" } else { "No" }.to_string()
}

impl SessionParams {
    /// Apply one key offered by the initiator.
    ///
    /// Returns the value to answer with, `None` for declarative keys that get
    /// no answer, or `NotUnderstood` for keys we don't know.
    pub fn apply_initiator_param(&mut self, key: &str, value: &str) -> Option<String> {
        match key {
            "InitiatorName" => {
                self.initiator_name = value.to_string();
                None
            }
            "InitiatorAlias" => {
                self.initiator_alias = value.to_string();
                None
            }
            "TargetName" => {
                // Initiator requests specific target
                self.target_name = value.to_string();
                None
            }
            "SessionType" => {
                self.session_type = if value == "Discovery" {
                    SessionType::Discovery
                } else {
                    SessionType::Normal
                };
                None
            }
            "MaxRecvDataSegmentLength" => {
                if let Ok(v) = value.parse::<u32>() {
                    // This is initiator's max recv, which is our max xmit
                    self.max_xmit_data_segment_length = v;
                }
                None
            }
            "MaxConnections" => {
                if let Ok(v) = value.parse::<u16>() {
                    self.max_connections = v.min(self.max_connections).max(1);
                }
                Some(self.max_connections.to_string())
            }
            "MaxBurstLength" => {
                if let Ok(v) = value.parse::<u32>() {
                    self.max_burst_length = v.min(self.max_burst_length);
                }
                Some(self.max_burst_length.to_string())
            }
            "FirstBurstLength" => {
                if let Ok(v) = value.parse::<u32>() {
                    self.first_burst_length = v.min(self.first_burst_length);
                }
                Some(self.first_burst_length.to_string())
            }
            "DefaultTime2Wait" => {
                if let Ok(v) = value.parse::<u16>() {
                    self.default_time2wait = v.max(self.default_time2wait);
                }
                Some(self.default_time2wait.to_string())
            }
            "DefaultTime2Retain" => {
                if let Ok(v) = value.parse::<u16>() {
                    self.default_time2retain = v.min(self.default_time2retain);
                }
                Some(self.default_time2retain.to_string())
            }
            "MaxOutstandingR2T" => {
                if let Ok(v) = value.parse::<u32>() {
                    self.max_outstanding_r2t = v.min(self.max_outstanding_r2t);
                }
                Some(self.max_outstanding_r2t.to_string())
            }
            "DataPDUInOrder" => {
                self.data_pdu_in_order = self.data_pdu_in_order && value == "Yes";
                Some(yes_no(self.data_pdu_in_order))
            }
            "DataSequenceInOrder" => {
                self.data_sequence_in_order = self.data_sequence_in_order && value == "Yes";
                Some(yes_no(self.data_sequence_in_order))
            }
            "ErrorRecoveryLevel" => {
                if let Ok(v) = value.parse::<u8>() {
                    self.error_recovery_level = v.min(self.error_recovery_level);
                }
                Some(self.error_recovery_level.to_string())
            }
            "ImmediateData" => {
                // AND operation: only true if both want it
                self.immediate_data = self.immediate_data && (value == "Yes");
                Some(yes_no(self.immediate_data))
            }
            "InitialR2T" => {
                // OR operation: true if either wants it
                self.initial_r2t = self.initial_r2t || (value == "Yes");
                Some(yes_no(self.initial_r2t))
            }
            "HeaderDigest" => {
                self.header_digest = DigestType::select(value, self.header_digest);
                Some(self.header_digest.as_str().to_string())
            }
            "DataDigest" => {
                self.data_digest = DigestType::select(value, self.data_digest);
                Some(self.data_digest.as_str().to_string())
            }
            _ => {
                // Unknown parameter
                log::debug!("Not understood: {}={}", key, value);
                Some("NotUnderstood".to_string())
            }
        }
    }

    /// Negotiate every offered key, producing the answer list
    pub fn negotiate(&mut self, offered: &[(String, String)]) -> Vec<(String, String)> {
        let mut answers = Vec::new();
        for (key, value) in offered {
            if let Some(answer) = self.apply_initiator_param(key, value) {
                answers.push((key.clone(), answer));
            }
        }
        answers
    }

    /// Keys an initiator offers during operational negotiation
    pub fn offer_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("HeaderDigest".to_string(), self.header_digest.as_str().to_string()),
            ("DataDigest".to_string(), self.data_digest.as_str().to_string()),
        ];
        if self.session_type == SessionType::Normal {
            params.extend([
                ("MaxConnections".to_string(), self.max_connections.to_string()),
                ("InitialR2T".to_string(), yes_no(self.initial_r2t)),
                ("ImmediateData".to_string(), yes_no(self.immediate_data)),
                ("MaxBurstLength".to_string(), self.max_burst_length.to_string()),
                ("FirstBurstLength".to_string(), self.first_burst_length.to_string()),
                ("DefaultTime2Wait".to_string(), self.default_time2wait.to_string()),
                ("DefaultTime2Retain".to_string(), self.default_time2retain.to_string()),
                ("MaxOutstandingR2T".to_string(), self.max_outstanding_r2t.to_string()),
                ("DataPDUInOrder".to_string(), yes_no(self.data_pdu_in_order)),
                ("DataSequenceInOrder".to_string(), yes_no(self.data_sequence_in_order)),
                ("ErrorRecoveryLevel".to_string(), self.error_recovery_level.to_string()),
            ]);
        }
        params.push((
            "MaxRecvDataSegmentLength".to_string(),
            self.max_recv_data_segment_length.to_string(),
        ));
        params
    }

    /// Record a value answered by the target (initiator side)
    pub fn apply_target_param(&mut self, key: &str, value: &str) {
        let flag = value == "Yes";
        match key {
            "TargetAlias" => self.target_alias = value.to_string(),
            "MaxRecvDataSegmentLength" => {
                if let Ok(v) = value.parse() {
                    self.max_xmit_data_segment_length = v;
                }
            }
            "MaxConnections" => self.max_connections = value.parse().unwrap_or(self.max_connections),
            "MaxBurstLength" => self.max_burst_length = value.parse().unwrap_or(self.max_burst_length),
            "FirstBurstLength" => self.first_burst_length = value.parse().unwrap_or(self.first_burst_length),
            "DefaultTime2Wait" => self.default_time2wait = value.parse().unwrap_or(self.default_time2wait),
            "DefaultTime2Retain" => self.default_time2retain = value.parse().unwrap_or(self.default_time2retain),
            "MaxOutstandingR2T" => self.max_outstanding_r2t = value.parse().unwrap_or(self.max_outstanding_r2t),
            "ErrorRecoveryLevel" => self.error_recovery_level = value.parse().unwrap_or(self.error_recovery_level),
            "DataPDUInOrder" => self.data_pdu_in_order = flag,
            "DataSequenceInOrder" => self.data_sequence_in_order = flag,
            "ImmediateData" => self.immediate_data = flag,
            "InitialR2T" => self.initial_r2t = flag,
            "HeaderDigest" => self.header_digest = DigestType::select(value, DigestType::None),
            "DataDigest" => self.data_digest = DigestType::select(value, DigestType::None),
            _ => log::debug!("Ignoring target parameter {}={}", key, value),
        }
    }
}

/// Reorders commands into CmdSN order (RFC 3720 Section 3.2.2.1)
///
/// Non-immediate commands are delivered only when their CmdSN equals
/// ExpCmdSN. Commands further inside the window are held until the gap
/// closes; commands outside it are dropped. Immediate commands bypass the
/// window and do not advance it.
#[derive(Debug)]
pub struct CommandWindow<T> {
    exp_cmd_sn: SerialArithmeticNumber,
    size: u32,
    held: HashMap<u32, T>,
}

/// What [`CommandWindow::admit`] did with a command
#[derive(Debug)]
pub enum Admission<T> {
    /// These commands are next, in CmdSN order
    Ready(Vec<T>),
    /// Queued until the commands before it arrive
    Held,
    /// Outside the window or a duplicate
    Dropped,
}

impl<T> CommandWindow<T> {
    pub fn new(exp_cmd_sn: u32, size: u32) -> Self {
        CommandWindow {
            exp_cmd_sn: SerialArithmeticNumber::new(exp_cmd_sn),
            size: size.max(1),
            held: HashMap::new(),
        }
    }

    pub fn exp_cmd_sn(&self) -> u32 {
        self.exp_cmd_sn.value()
    }

    pub fn max_cmd_sn(&self) -> u32 {
        self.exp_cmd_sn.offset(self.size - 1).value()
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn admit(&mut self, cmd_sn: u32, immediate: bool, command: T) -> Admission<T> {
        if immediate {
            return Admission::Ready(vec![command]);
        }

        let sn = SerialArithmeticNumber::new(cmd_sn);
        if !sn.in_window(self.exp_cmd_sn, self.max_cmd_sn()) {
            log::warn!(
                "Dropping command CmdSN {} outside window [{}, {}]",
                cmd_sn,
                self.exp_cmd_sn,
                self.max_cmd_sn()
            );
            return Admission::Dropped;
        }

        if sn != self.exp_cmd_sn {
            if self.held.contains_key(&cmd_sn) {
                log::warn!("Dropping duplicate CmdSN {}", cmd_sn);
                return Admission::Dropped;
            }
            log::debug!("Holding CmdSN {} until {} arrives", cmd_sn, self.exp_cmd_sn);
            self.held.insert(cmd_sn, command);
            return Admission::Held;
        }

        let mut ready = vec![command];
        self.exp_cmd_sn.increment();
        while let Some(next) = self.held.remove(&self.exp_cmd_sn.value()) {
            ready.push(next);
            self.exp_cmd_sn.increment();
        }
        Admission::Ready(ready)
    }
}

/// Work released by the command window
pub type Delivery = Box<dyn FnOnce() + Send>;

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> ScsiResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| IscsiError::Session(format!("{} lock poisoned", what)))
}

/// iSCSI Session
///
/// Represents an active iSCSI session between an initiator and target.
/// Connections refer to it by TSIH through the [`SessionManager`].
pub struct Session {
    /// Initiator Session ID (6 bytes)
    pub isid: [u8; 6],
    /// Target Session Identifying Handle (assigned by target)
    pub tsih: u16,
    /// Negotiated parameters from the leading login
    pub params: SessionParams,
    connections: Mutex<HashSet<u16>>,
    window: Mutex<Intake>,
    turn: Mutex<u64>,
    turn_changed: Condvar,
}

/// The command window plus the ticket handed to the next released batch
struct Intake {
    window: CommandWindow<Delivery>,
    issued: u64,
}

/// Passes the turn to the next ticket, also when a job panics
struct Turn<'a> {
    session: &'a Session,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut turn = match self.session.turn.lock() {
            Ok(turn) => turn,
            Err(poisoned) => poisoned.into_inner(),
        };
        *turn += 1;
        self.session.turn_changed.notify_all();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("isid", &self.isid)
            .field("tsih", &self.tsih)
            .field("session_type", &self.params.session_type)
            .field("initiator", &self.params.initiator_name)
            .finish()
    }
}

impl Session {
    pub fn new(isid: [u8; 6], tsih: u16, params: SessionParams, exp_cmd_sn: u32) -> Self {
        Session {
            isid,
            tsih,
            params,
            connections: Mutex::new(HashSet::new()),
            window: Mutex::new(Intake {
                window: CommandWindow::new(exp_cmd_sn, DEFAULT_COMMAND_WINDOW),
                issued: 0,
            }),
            turn: Mutex::new(0),
            turn_changed: Condvar::new(),
        }
    }

    pub fn session_type(&self) -> SessionType {
        self.params.session_type
    }

    /// Check if this is a discovery session
    pub fn is_discovery(&self) -> bool {
        self.params.session_type == SessionType::Discovery
    }

    /// Current (ExpCmdSN, MaxCmdSN)
    pub fn command_window(&self) -> (u32, u32) {
        let intake = match self.window.lock() {
            Ok(intake) => intake,
            Err(poisoned) => poisoned.into_inner(),
        };
        (intake.window.exp_cmd_sn(), intake.window.max_cmd_sn())
    }

    /// Run `job` once every command before `cmd_sn` has run.
    ///
    /// Each released batch takes a ticket while the window is locked and
    /// runs when its ticket comes up, with no lock held. Jobs may call back
    /// into the session, and batches released by different connections
    /// still run in CmdSN order.
    pub fn deliver(&self, cmd_sn: u32, immediate: bool, job: Delivery) -> ScsiResult<()> {
        let (ready, ticket) = {
            let mut intake = lock(&self.window, "command window")?;
            match intake.window.admit(cmd_sn, immediate, job) {
                Admission::Ready(ready) => {
                    let ticket = intake.issued;
                    intake.issued += 1;
                    (ready, ticket)
                }
                Admission::Held | Admission::Dropped => return Ok(()),
            }
        };

        {
            let mut current = match self.turn.lock() {
                Ok(current) => current,
                Err(poisoned) => poisoned.into_inner(),
            };
            while *current != ticket {
                current = match self.turn_changed.wait(current) {
                    Ok(current) => current,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        }
        let turn = Turn { session: self };

        for job in ready {
            job();
        }
        drop(turn);
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn has_connection(&self, cid: u16) -> bool {
        self.connections.lock().map(|c| c.contains(&cid)).unwrap_or(false)
    }
}

/// Live sessions by TSIH
pub struct SessionManager {
    tsih: Arc<TsihAllocator>,
    sessions: Mutex<HashMap<u16, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(tsih: Arc<TsihAllocator>) -> Self {
        SessionManager {
            tsih,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a session for a completed leading login, with its first connection
    pub fn create(&self, isid: [u8; 6], cid: u16, params: SessionParams, exp_cmd_sn: u32) -> ScsiResult<Arc<Session>> {
        let tsih = self.tsih.allocate()?;
        let session = Arc::new(Session::new(isid, tsih, params, exp_cmd_sn));
        lock(&session.connections, "connection set")?.insert(cid);

        let mut sessions = lock(&self.sessions, "session table")?;
        sessions.insert(tsih, Arc::clone(&session));
        log::info!(
            "Created {} session TSIH {} for {}",
            session.session_type().as_str(),
            tsih,
            session.params.initiator_name
        );
        Ok(session)
    }

    pub fn get(&self, tsih: u16) -> ScsiResult<Arc<Session>> {
        lock(&self.sessions, "session table")?
            .get(&tsih)
            .cloned()
            .ok_or(IscsiError::NoSuchSession(tsih))
    }

    /// Add a connection to an existing session, honoring MaxConnections
    pub fn add_connection(&self, tsih: u16, isid: [u8; 6], cid: u16) -> ScsiResult<Arc<Session>> {
        let session = self.get(tsih)?;
        if session.isid != isid {
            return Err(IscsiError::NoSuchSession(tsih));
        }
        let mut connections = lock(&session.connections, "connection set")?;
        if !connections.contains(&cid) && connections.len() >= session.params.max_connections as usize {
            return Err(IscsiError::ResourcesExhausted(format!(
                "session {} already has {} connections",
                tsih,
                connections.len()
            )));
        }
        connections.insert(cid);
        drop(connections);
        log::info!("Connection {} joined session TSIH {}", cid, tsih);
        Ok(session)
    }

    /// Drop a connection; the last one out tears the session down.
    /// Returns true when the session ended.
    pub fn remove_connection(&self, tsih: u16, cid: u16) -> bool {
        let mut sessions = match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(session) = sessions.get(&tsih) else {
            return false;
        };

        let remaining = match session.connections.lock() {
            Ok(mut connections) => {
                connections.remove(&cid);
                connections.len()
            }
            Err(_) => 0,
        };
        if remaining > 0 {
            return false;
        }

        sessions.remove(&tsih);
        drop(sessions);
        self.tsih.release(tsih);
        log::info!("Session TSIH {} closed", tsih);
        true
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
