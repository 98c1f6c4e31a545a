//! Target side of one iSCSI connection
//!
//! Each accepted connection gets a reader thread that owns the receive half
//! of the transport. It runs the login phase, then decodes full feature
//! phase PDUs in receipt order. SCSI commands become tasks on the addressed
//! logical unit, delivered in CmdSN order through the session; Data-Out
//! PDUs are routed by Initiator Task Tag to the task waiting for them.
//!
//! Everything that writes to the initiator goes through [`ConnectionPort`],
//! which serializes writers and assigns StatSN under one lock.

use crate::digest::DigestType;
use crate::error::{IscsiError, ScsiResult};
use crate::login::{self, LoginNegotiator, LoginOutcome, LoginSettings};
use crate::logical_unit::LogicalUnit;
use crate::parser::{
    lun, DataInParser, DataOutParser, LogoutReason, LogoutRequestParser, LogoutResponseParser,
    NopInParser, NopOutParser, Parser, Ready2TransferParser, RejectParser, RejectReason,
    ScsiCommandParser, ScsiResponseParser, TaskManagementFunction,
    TaskManagementFunctionRequestParser, TaskManagementFunctionResponseParser, TextRequestParser,
    TextResponseParser, TmfResponse,
};
use crate::pdu::{self, logout_response, ProtocolDataUnit, BHS_SIZE, RESERVED_TAG};
use crate::scsi::{scsi_status, ScsiResponse, SenseData};
use crate::session::{ConnectionPhase, Delivery, Session, SessionManager, SessionParams};
use crate::task::{Command, Nexus, TargetTransportPort, Task};
use crate::task_set::TaskServiceResponse;
use crate::transport::Transport;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

/// Data segments shorter than this are never negotiated (RFC 3720 12.12)
const MIN_SEGMENT_LENGTH: usize = 512;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State shared by every connection of one target
pub struct TargetContext {
    pub settings: LoginSettings,
    pub sessions: SessionManager,
    pub luns: BTreeMap<u64, Arc<LogicalUnit>>,
    accepting: AtomicBool,
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Arc<ConnectionShared>>>,
}

impl TargetContext {
    pub fn new(settings: LoginSettings, sessions: SessionManager, luns: BTreeMap<u64, Arc<LogicalUnit>>) -> Self {
        TargetContext {
            settings,
            sessions,
            luns,
            accepting: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn lun_list(&self) -> Vec<u64> {
        self.luns.keys().copied().collect()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// New logins are refused from now on
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Close every open connection; their reader threads then exit
    pub fn close_all(&self) {
        let connections: Vec<_> = lock(&self.connections).values().cloned().collect();
        for connection in connections {
            connection.close();
        }
    }

    /// Close the connections of a session, or one of them when `cid` is given.
    /// Returns how many were closed.
    fn close_session_connections(&self, tsih: u16, cid: Option<u16>) -> usize {
        let matching: Vec<_> = lock(&self.connections)
            .values()
            .filter(|c| match c.identity() {
                Some((t, c)) => t == tsih && cid.map(|cid| cid == c).unwrap_or(true),
                None => false,
            })
            .cloned()
            .collect();
        for connection in &matching {
            connection.close();
        }
        matching.len()
    }

    fn register(&self, shared: Arc<ConnectionShared>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.connections).insert(id, shared);
        id
    }

    fn unregister(&self, id: u64) {
        lock(&self.connections).remove(&id);
    }
}

/// Writing half of a connection
struct Writer {
    transport: Box<dyn Transport>,
    stat_sn: u32,
    header_digest: DigestType,
    data_digest: DigestType,
}

impl Writer {
    /// Stamp sequence numbers and send. `advance` is true for PDUs that
    /// consume a StatSN.
    fn send(&mut self, pdu: ProtocolDataUnit, window: (u32, u32), advance: bool) -> ScsiResult<()> {
        let mut pdu = pdu.with_digests(self.header_digest, self.data_digest);
        stamp(&mut pdu.bhs.parser, self.stat_sn, window);
        pdu.write_to(&mut *self.transport)?;
        if advance {
            self.stat_sn = self.stat_sn.wrapping_add(1);
        }
        Ok(())
    }
}

/// Fill StatSN, ExpCmdSN and MaxCmdSN of a target PDU
fn stamp(parser: &mut Parser, stat_sn: u32, (exp_cmd_sn, max_cmd_sn): (u32, u32)) {
    match parser {
        Parser::NopIn(p) => {
            p.stat_sn = stat_sn;
            p.exp_cmd_sn = exp_cmd_sn;
            p.max_cmd_sn = max_cmd_sn;
        }
        Parser::ScsiResponse(p) => {
            p.stat_sn = stat_sn;
            p.exp_cmd_sn = exp_cmd_sn;
            p.max_cmd_sn = max_cmd_sn;
        }
        Parser::TaskManagementResponse(p) => {
            p.stat_sn = stat_sn;
            p.exp_cmd_sn = exp_cmd_sn;
            p.max_cmd_sn = max_cmd_sn;
        }
        Parser::TextResponse(p) => {
            p.stat_sn = stat_sn;
            p.exp_cmd_sn = exp_cmd_sn;
            p.max_cmd_sn = max_cmd_sn;
        }
        Parser::LogoutResponse(p) => {
            p.stat_sn = stat_sn;
            p.exp_cmd_sn = exp_cmd_sn;
            p.max_cmd_sn = max_cmd_sn;
        }
        Parser::Reject(p) => {
            p.stat_sn = stat_sn;
            p.exp_cmd_sn = exp_cmd_sn;
            p.max_cmd_sn = max_cmd_sn;
        }
        Parser::AsyncMessage(p) => {
            p.stat_sn = stat_sn;
            p.exp_cmd_sn = exp_cmd_sn;
            p.max_cmd_sn = max_cmd_sn;
        }
        Parser::Ready2Transfer(p) => {
            p.stat_sn = stat_sn;
            p.exp_cmd_sn = exp_cmd_sn;
            p.max_cmd_sn = max_cmd_sn;
        }
        Parser::DataIn(p) => {
            if p.status_flag {
                p.stat_sn = stat_sn;
            }
            p.exp_cmd_sn = exp_cmd_sn;
            p.max_cmd_sn = max_cmd_sn;
        }
        _ => {}
    }
}

/// One Data-Out PDU on its way to the task that reads it
struct DataOutSegment {
    offset: u32,
    data: Vec<u8>,
    final_flag: bool,
}

/// Data transfer state of one outstanding command, keyed by ITT
struct Transfer {
    lun_field: u64,
    edtl: u32,
    immediate: Vec<u8>,
    /// Unsolicited Data-Out follows the command
    unsolicited: bool,
    sender: Option<Sender<DataOutSegment>>,
    receiver: Option<Receiver<DataOutSegment>>,
    /// Bytes the command wanted to move, for the residual count
    expected: u32,
    data_sn: u32,
    r2t_sn: u32,
    terminated: bool,
}

impl Transfer {
    fn new(command: &ScsiCommandParser, final_flag: bool, immediate: Vec<u8>, initial_r2t: bool) -> Self {
        let (sender, receiver) = if command.write {
            let (sender, receiver) = mpsc::channel();
            (Some(sender), Some(receiver))
        } else {
            (None, None)
        };
        Transfer {
            lun_field: command.lun,
            edtl: command.expected_data_transfer_length,
            unsolicited: command.write && !final_flag && !initial_r2t,
            immediate,
            sender,
            receiver,
            expected: 0,
            data_sn: 0,
            r2t_sn: 0,
            terminated: false,
        }
    }
}

/// Connection state reachable from other threads
pub struct ConnectionShared {
    writer: Mutex<Writer>,
    /// Third handle on the stream, so closing never waits for a writer
    control: Mutex<Box<dyn Transport>>,
    closing: AtomicBool,
    /// (TSIH, CID) once logged in
    identity: Mutex<Option<(u16, u16)>>,
    peer: String,
}

impl ConnectionShared {
    fn identity(&self) -> Option<(u16, u16)> {
        *lock(&self.identity)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Shut the stream down; the reader sees end of file
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = lock(&self.control).close() {
            log::debug!("Closing connection from {}: {}", self.peer, e);
        }
    }
}

/// Full feature phase view of a connection, handed to tasks as their port
pub struct ConnectionPort {
    shared: Arc<ConnectionShared>,
    session: Arc<Session>,
    params: SessionParams,
    cid: u16,
    initiator_port: String,
    target_port: String,
    transfers: Mutex<HashMap<u32, Transfer>>,
    next_ttt: AtomicU32,
}

impl ConnectionPort {
    fn new(shared: Arc<ConnectionShared>, session: Arc<Session>, params: SessionParams, cid: u16) -> Self {
        let isid: String = session.isid.iter().map(|b| format!("{:02x}", b)).collect();
        let initiator_port = format!("{},i,0x{}", params.initiator_name, isid);
        let target_port = format!("{},t,0x0001", params.target_name);
        ConnectionPort {
            shared,
            session,
            params,
            cid,
            initiator_port,
            target_port,
            transfers: Mutex::new(HashMap::new()),
            next_ttt: AtomicU32::new(1),
        }
    }

    pub fn nexus(&self, lun: u64) -> Nexus {
        Nexus::itl(self.initiator_port.clone(), self.target_port.clone(), lun)
    }

    /// Send a PDU that consumes a StatSN
    fn send_status(&self, pdu: ProtocolDataUnit) -> ScsiResult<()> {
        let window = self.session.command_window();
        lock(&self.shared.writer).send(pdu, window, true)
    }

    /// Send Data-In or R2T
    fn send_data(&self, pdu: ProtocolDataUnit) -> ScsiResult<()> {
        let window = self.session.command_window();
        lock(&self.shared.writer).send(pdu, window, false)
    }

    fn reject(&self, header: &[u8], reason: RejectReason) -> ScsiResult<()> {
        log::warn!("Rejecting PDU from {}: {:?}", self.shared.peer, reason);
        reject(&self.shared, self.session.command_window(), header, reason)
    }

    fn next_ttt(&self) -> u32 {
        loop {
            let ttt = self.next_ttt.fetch_add(1, Ordering::SeqCst);
            if ttt != RESERVED_TAG {
                return ttt;
            }
        }
    }

    /// Track a new command's transfer; false while the ITT is still in use
    fn begin(&self, itt: u32, transfer: Transfer) -> bool {
        match lock(&self.transfers).entry(itt) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(transfer);
                true
            }
        }
    }

    fn route_data_out(&self, itt: u32, data_out: &DataOutParser, final_flag: bool, data: Vec<u8>) {
        let transfers = lock(&self.transfers);
        let sender = transfers.get(&itt).and_then(|t| t.sender.as_ref());
        match sender {
            Some(sender) => {
                let segment = DataOutSegment {
                    offset: data_out.buffer_offset,
                    data,
                    final_flag,
                };
                if sender.send(segment).is_err() {
                    log::debug!("Data-Out for ITT 0x{:08x} arrived after the transfer ended", itt);
                }
            }
            None => log::warn!("Dropping Data-Out for unknown ITT 0x{:08x}", itt),
        }
    }

    fn send_r2t(&self, itt: u32, offset: u32, length: u32) -> ScsiResult<()> {
        let (lun_field, r2t_sn) = {
            let mut transfers = lock(&self.transfers);
            let Some(transfer) = transfers.get_mut(&itt) else {
                return Ok(());
            };
            let r2t_sn = transfer.r2t_sn;
            transfer.r2t_sn = transfer.r2t_sn.wrapping_add(1);
            (transfer.lun_field, r2t_sn)
        };
        let r2t = Ready2TransferParser {
            lun: lun_field,
            target_transfer_tag: self.next_ttt(),
            r2t_sn,
            buffer_offset: offset,
            desired_data_transfer_length: length,
            ..Default::default()
        };
        log::debug!("R2T for ITT 0x{:08x}: {} bytes at {}", itt, length, offset);
        self.send_data(
            ProtocolDataUnit::new(Parser::Ready2Transfer(r2t))
                .with_itt(itt)
                .with_final(true),
        )
    }
}

/// Place a Data-Out segment in the command buffer; returns the end offset
fn place(buf: &mut [u8], segment: &DataOutSegment) -> usize {
    let start = (segment.offset as usize).min(buf.len());
    let end = (start + segment.data.len()).min(buf.len());
    if end - start < segment.data.len() {
        log::warn!(
            "Data-Out of {} bytes at offset {} runs past the {} byte buffer",
            segment.data.len(),
            segment.offset,
            buf.len()
        );
    }
    buf[start..end].copy_from_slice(&segment.data[..end - start]);
    end
}

/// Receive one burst; false when the transfer was terminated
fn receive_burst(receiver: &Receiver<DataOutSegment>, buf: &mut [u8], received: &mut usize) -> bool {
    loop {
        let Ok(segment) = receiver.recv() else {
            return false;
        };
        *received = (*received).max(place(buf, &segment));
        if segment.final_flag {
            return true;
        }
    }
}

impl TargetTransportPort for ConnectionPort {
    fn read_data(&self, nexus: &Nexus, _command_reference: u32, buf: &mut [u8]) -> ScsiResult<bool> {
        let Some(itt) = nexus.task_tag else {
            return Err(IscsiError::Scsi(format!("untagged data transfer for {}", nexus)));
        };
        let (edtl, immediate, unsolicited, receiver) = {
            let mut transfers = lock(&self.transfers);
            let Some(transfer) = transfers.get_mut(&itt) else {
                return Ok(false);
            };
            if transfer.terminated {
                return Ok(false);
            }
            transfer.expected = buf.len() as u32;
            (
                transfer.edtl as usize,
                std::mem::take(&mut transfer.immediate),
                transfer.unsolicited,
                transfer.receiver.take(),
            )
        };
        if buf.len() > edtl {
            return Err(IscsiError::Scsi(format!(
                "command needs {} bytes but expected data transfer length is {}",
                buf.len(),
                edtl
            )));
        }
        let Some(receiver) = receiver else {
            return Ok(false);
        };

        let mut received = immediate.len().min(buf.len());
        buf[..received].copy_from_slice(&immediate[..received]);

        if unsolicited && !receive_burst(&receiver, buf, &mut received) {
            return Ok(false);
        }
        let max_burst = (self.params.max_burst_length as usize).max(MIN_SEGMENT_LENGTH);
        while received < buf.len() {
            let length = (buf.len() - received).min(max_burst);
            self.send_r2t(itt, received as u32, length as u32)?;
            let before = received;
            if !receive_burst(&receiver, buf, &mut received) {
                return Ok(false);
            }
            if received == before {
                return Err(IscsiError::Scsi(format!("empty Data-Out burst for ITT 0x{:08x}", itt)));
            }
        }
        Ok(true)
    }

    fn write_data(&self, nexus: &Nexus, _command_reference: u32, data: &[u8]) -> ScsiResult<bool> {
        let Some(itt) = nexus.task_tag else {
            return Err(IscsiError::Scsi(format!("untagged data transfer for {}", nexus)));
        };
        let (lun_field, edtl, mut data_sn) = {
            let mut transfers = lock(&self.transfers);
            let Some(transfer) = transfers.get_mut(&itt) else {
                return Ok(false);
            };
            if transfer.terminated {
                return Ok(false);
            }
            transfer.expected = data.len() as u32;
            (transfer.lun_field, transfer.edtl as usize, transfer.data_sn)
        };

        let data = &data[..data.len().min(edtl)];
        let segment = (self.params.max_xmit_data_segment_length as usize).max(MIN_SEGMENT_LENGTH);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + segment).min(data.len());
            let data_in = DataInParser {
                lun: lun_field,
                target_transfer_tag: RESERVED_TAG,
                data_sn,
                buffer_offset: offset as u32,
                ..Default::default()
            };
            self.send_data(
                ProtocolDataUnit::new(Parser::DataIn(data_in))
                    .with_itt(itt)
                    .with_final(end == data.len())
                    .with_data(data[offset..end].to_vec()),
            )?;
            data_sn = data_sn.wrapping_add(1);
            offset = end;
        }

        let mut transfers = lock(&self.transfers);
        match transfers.get_mut(&itt) {
            Some(transfer) if !transfer.terminated => {
                transfer.data_sn = data_sn;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn write_response(&self, nexus: &Nexus, _command_reference: u32, status: u8, sense: Option<&[u8]>) {
        let Some(itt) = nexus.task_tag else {
            log::error!("Response for untagged command {}", nexus);
            return;
        };
        let transfer = lock(&self.transfers).remove(&itt);
        self.respond(itt, transfer, status, sense);
    }

    fn terminate_data_transfer(&self, nexus: &Nexus, _command_reference: u32) {
        let Some(itt) = nexus.task_tag else {
            return;
        };
        if let Some(transfer) = lock(&self.transfers).get_mut(&itt) {
            transfer.terminated = true;
            transfer.sender = None;
            transfer.receiver = None;
        }
    }
}

impl ConnectionPort {
    /// SCSI Response for `itt`; residuals come from its finished transfer
    fn respond(&self, itt: u32, transfer: Option<Transfer>, status: u8, sense: Option<&[u8]>) {
        let mut response = ScsiResponseParser {
            status,
            ..Default::default()
        };
        if let Some(transfer) = transfer {
            response.exp_data_sn = transfer.data_sn;
            if transfer.expected < transfer.edtl {
                response.residual_underflow = true;
                response.residual_count = transfer.edtl - transfer.expected;
            } else if transfer.expected > transfer.edtl {
                response.residual_overflow = true;
                response.residual_count = transfer.expected - transfer.edtl;
            }
        }
        let data = match sense {
            Some(sense) => {
                let mut data = Vec::with_capacity(sense.len() + 2);
                data.extend_from_slice(&(sense.len() as u16).to_be_bytes());
                data.extend_from_slice(sense);
                data
            }
            None => Vec::new(),
        };
        let pdu = ProtocolDataUnit::new(Parser::ScsiResponse(response))
            .with_itt(itt)
            .with_final(true)
            .with_data(data);
        if let Err(e) = self.send_status(pdu) {
            log::warn!("Response for ITT 0x{:08x} to {} failed: {}", itt, self.shared.peer, e);
        }
    }
}

fn reject(shared: &ConnectionShared, window: (u32, u32), header: &[u8], reason: RejectReason) -> ScsiResult<()> {
    let parser = RejectParser {
        reason,
        ..Default::default()
    };
    let pdu = ProtocolDataUnit::new(Parser::Reject(parser))
        .with_itt(RESERVED_TAG)
        .with_final(true)
        .with_data(header[..header.len().min(BHS_SIZE)].to_vec());
    lock(&shared.writer).send(pdu, window, true)
}

fn tmf_response(response: TaskServiceResponse) -> TmfResponse {
    match response {
        TaskServiceResponse::FunctionComplete => TmfResponse::FunctionComplete,
        TaskServiceResponse::FunctionRejected => TmfResponse::FunctionRejected,
        TaskServiceResponse::ServiceDeliveryOrTargetFailure => TmfResponse::FunctionRejected,
    }
}

/// Run a task management function against the target's logical units
fn task_management(context: &TargetContext, port: &ConnectionPort, request: &TaskManagementFunctionRequestParser) -> TmfResponse {
    let lun = lun::decode(request.lun);
    let nexus = port.nexus(lun);
    log::info!("{:?} for {} from {}", request.function, nexus, port.shared.peer);

    let lu_function = |f: &dyn Fn(&LogicalUnit) -> TaskServiceResponse| -> TmfResponse {
        match context.luns.get(&lun) {
            Some(lu) => tmf_response(f(lu)),
            None => TmfResponse::LunDoesNotExist,
        }
    };
    match request.function {
        TaskManagementFunction::AbortTask => {
            let tagged = nexus.clone().with_tag(request.referenced_task_tag);
            let response = lu_function(&|lu: &LogicalUnit| lu.abort_task(&tagged));
            if response == TmfResponse::FunctionComplete {
                lock(&port.transfers).remove(&request.referenced_task_tag);
            }
            response
        }
        TaskManagementFunction::AbortTaskSet => lu_function(&|lu: &LogicalUnit| lu.abort_task_set(&nexus)),
        TaskManagementFunction::ClearAca => lu_function(&|lu: &LogicalUnit| lu.clear_aca()),
        TaskManagementFunction::ClearTaskSet => lu_function(&|lu: &LogicalUnit| lu.clear_task_set(&nexus)),
        TaskManagementFunction::LogicalUnitReset => lu_function(&|lu: &LogicalUnit| lu.reset()),
        TaskManagementFunction::TargetWarmReset | TaskManagementFunction::TargetColdReset => {
            for lu in context.luns.values() {
                lu.reset();
            }
            TmfResponse::FunctionComplete
        }
        TaskManagementFunction::TaskReassign => TmfResponse::AllegianceReassignmentNotSupported,
    }
}

/// Reader side of one connection
pub struct Connection {
    context: Arc<TargetContext>,
    transport: Box<dyn Transport>,
    shared: Arc<ConnectionShared>,
    id: u64,
    phase: ConnectionPhase,
    port: Option<Arc<ConnectionPort>>,
    /// Text request data sent with the Continue flag
    text_pending: Vec<u8>,
}

impl Connection {
    pub fn new(context: Arc<TargetContext>, transport: Box<dyn Transport>) -> ScsiResult<Self> {
        let writer = transport.try_clone_transport()?;
        let control = transport.try_clone_transport()?;
        let shared = Arc::new(ConnectionShared {
            writer: Mutex::new(Writer {
                transport: writer,
                stat_sn: 0,
                header_digest: DigestType::None,
                data_digest: DigestType::None,
            }),
            control: Mutex::new(control),
            closing: AtomicBool::new(false),
            identity: Mutex::new(None),
            peer: transport.peer(),
        });
        let id = context.register(Arc::clone(&shared));
        Ok(Connection {
            context,
            transport,
            shared,
            id,
            phase: ConnectionPhase::SecurityNegotiation,
            port: None,
            text_pending: Vec::new(),
        })
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Serve the connection until it closes
    pub fn run(mut self) {
        log::info!("Connection from {}", self.shared.peer);
        let result = match self.login() {
            Ok(true) => self.full_feature(),
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        match result {
            Err(IscsiError::Io(e)) if self.shared.is_closing() || is_disconnect(&e) => {
                log::debug!("Connection from {} ended: {}", self.shared.peer, e)
            }
            Err(e) => log::error!("Connection from {} failed: {}", self.shared.peer, e),
            Ok(()) => {}
        }
        self.teardown();
    }

    fn login(&mut self) -> ScsiResult<bool> {
        let mut negotiator = LoginNegotiator::new(&self.context.settings);
        loop {
            let frame = pdu::read_frame(&mut *self.transport, DigestType::None, DigestType::None)?;
            let request = ProtocolDataUnit::deserialize(&frame, DigestType::None, DigestType::None)?;
            if let Err(e) = negotiator.phase().check(request.opcode()) {
                log::warn!("{} from {}", e, self.shared.peer);
                reject(&self.shared, (0, 0), &frame, e.reject_reason())?;
                return Ok(false);
            }

            let outcome = negotiator.process(
                &request,
                &self.context.settings,
                &self.context.sessions,
                self.context.is_accepting(),
            )?;
            lock(&self.shared.writer).transport.write_all(&outcome.response().serialize())?;

            match outcome {
                LoginOutcome::InProgress(_) => self.phase = negotiator.phase(),
                LoginOutcome::Rejected(_) => {
                    self.phase = ConnectionPhase::ConnectionClosed;
                    return Ok(false);
                }
                LoginOutcome::Complete { session, params, .. } => {
                    let cid = negotiator.cid();
                    {
                        let mut writer = lock(&self.shared.writer);
                        writer.stat_sn = negotiator.next_stat_sn();
                        writer.header_digest = params.header_digest;
                        writer.data_digest = params.data_digest;
                    }
                    *lock(&self.shared.identity) = Some((session.tsih, cid));
                    self.port = Some(Arc::new(ConnectionPort::new(
                        Arc::clone(&self.shared),
                        session,
                        params,
                        cid,
                    )));
                    self.phase = ConnectionPhase::FullFeaturePhase;
                    return Ok(true);
                }
            }
        }
    }

    fn full_feature(&mut self) -> ScsiResult<()> {
        let Some(port) = self.port.clone() else {
            return Ok(());
        };
        let (header_digest, data_digest) = (port.params.header_digest, port.params.data_digest);
        log::info!(
            "{} entered full feature phase (CID {}, TSIH {})",
            self.shared.peer,
            port.cid,
            port.session.tsih
        );

        while !self.shared.is_closing() {
            let frame = pdu::read_frame(&mut *self.transport, header_digest, data_digest)?;
            let request = match ProtocolDataUnit::deserialize(&frame, header_digest, data_digest) {
                Ok(request) => request,
                Err(e) => match e.as_protocol() {
                    Some(protocol) if !e.is_fatal() => {
                        log::warn!("{} from {}", protocol, self.shared.peer);
                        port.reject(&frame, protocol.reject_reason())?;
                        continue;
                    }
                    _ => return Err(e),
                },
            };
            log::debug!("Received {} ITT 0x{:08x}", request.opcode().name(), request.itt());

            if let Err(e) = self.phase.check(request.opcode()) {
                log::warn!("{} from {}", e, self.shared.peer);
                port.reject(&frame, e.reject_reason())?;
                continue;
            }
            self.dispatch(&port, &frame, request)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, port: &Arc<ConnectionPort>, frame: &[u8], request: ProtocolDataUnit) -> ScsiResult<()> {
        match request.parser() {
            Parser::ScsiCommand(command) => self.scsi_command(port, frame, &request, command),
            Parser::DataOut(data_out) => {
                port.route_data_out(request.itt(), data_out, request.bhs.final_flag, request.data.clone());
                Ok(())
            }
            Parser::NopOut(nop) => self.nop_out(port, &request, nop),
            Parser::TaskManagementRequest(tmf) => self.task_management(port, &request, tmf),
            Parser::TextRequest(text) => self.text(port, &request, text),
            Parser::LogoutRequest(logout) => self.logout(port, &request, logout),
            Parser::SnackRequest(_) => port.reject(frame, RejectReason::SnackReject),
            _ => port.reject(frame, RejectReason::ProtocolError),
        }
    }

    fn scsi_command(
        &self,
        port: &Arc<ConnectionPort>,
        frame: &[u8],
        request: &ProtocolDataUnit,
        command: &ScsiCommandParser,
    ) -> ScsiResult<()> {
        if port.session.is_discovery() {
            return port.reject(frame, RejectReason::ProtocolError);
        }
        let itt = request.itt();
        let lun = lun::decode(command.lun);
        let transfer = Transfer::new(command, request.bhs.final_flag, request.data.clone(), port.params.initial_r2t);
        if !port.begin(itt, transfer) {
            // the outstanding command keeps its transfer and runs to completion
            log::warn!("ITT 0x{:08x} reused while still outstanding", itt);
            let refusing = Arc::clone(port);
            let job: Delivery = Box::new(move || {
                let sense = SenseData::overlapped_commands().to_bytes();
                refusing.respond(itt, None, scsi_status::CHECK_CONDITION, Some(&sense));
            });
            return port.session.deliver(command.cmd_sn, request.bhs.immediate, job);
        }

        let task_command = Command::new(
            port.nexus(lun).with_tag(itt),
            command.cdb.to_vec(),
            command.task_attribute,
            command.cmd_sn,
        )
        .with_expected_length(command.expected_data_transfer_length);
        let lu = self.context.luns.get(&lun).cloned();
        let task_port: Arc<dyn TargetTransportPort> = Arc::clone(port) as Arc<dyn TargetTransportPort>;
        let job: Delivery = Box::new(move || match lu {
            Some(lu) => {
                lu.enqueue(task_port, task_command);
            }
            None => {
                log::warn!("Command for unknown LUN {}", lun);
                let nexus = task_command.nexus.clone();
                task_port.terminate_data_transfer(&nexus, task_command.command_reference);
                Task::new(task_command, task_port).reject(ScsiResponse::check_condition(SenseData::lun_not_supported()));
            }
        });
        port.session.deliver(command.cmd_sn, request.bhs.immediate, job)
    }

    fn nop_out(&self, port: &Arc<ConnectionPort>, request: &ProtocolDataUnit, nop: &NopOutParser) -> ScsiResult<()> {
        let itt = request.itt();
        if itt == RESERVED_TAG {
            // answer to a NOP-In of ours, nothing to send
            return Ok(());
        }
        let nop_in = NopInParser {
            lun: nop.lun,
            target_transfer_tag: RESERVED_TAG,
            ..Default::default()
        };
        let pdu = ProtocolDataUnit::new(Parser::NopIn(nop_in))
            .with_itt(itt)
            .with_final(true)
            .with_data(request.data.clone());
        let port = Arc::clone(port);
        let session = Arc::clone(&port.session);
        session.deliver(
            nop.cmd_sn,
            request.bhs.immediate,
            Box::new(move || {
                if let Err(e) = port.send_status(pdu) {
                    log::warn!("NOP-In to {} failed: {}", port.shared.peer, e);
                }
            }),
        )
    }

    fn task_management(
        &self,
        port: &Arc<ConnectionPort>,
        request: &ProtocolDataUnit,
        tmf: &TaskManagementFunctionRequestParser,
    ) -> ScsiResult<()> {
        let itt = request.itt();
        let context = Arc::clone(&self.context);
        let tmf = tmf.clone();
        let port = Arc::clone(port);
        let session = Arc::clone(&port.session);
        session.deliver(
            tmf.cmd_sn,
            request.bhs.immediate,
            Box::new(move || {
                let response = task_management(&context, &port, &tmf);
                let parser = TaskManagementFunctionResponseParser {
                    response,
                    ..Default::default()
                };
                let pdu = ProtocolDataUnit::new(Parser::TaskManagementResponse(parser))
                    .with_itt(itt)
                    .with_final(true);
                if let Err(e) = port.send_status(pdu) {
                    log::warn!("Task management response to {} failed: {}", port.shared.peer, e);
                }
                if tmf.function == TaskManagementFunction::TargetColdReset {
                    context.close_all();
                }
            }),
        )
    }

    fn text(&mut self, port: &Arc<ConnectionPort>, request: &ProtocolDataUnit, text: &TextRequestParser) -> ScsiResult<()> {
        let itt = request.itt();
        self.text_pending.extend_from_slice(&request.data);

        let (answer, final_flag, ttt) = if text.continue_flag {
            (Vec::new(), false, port.next_ttt())
        } else {
            let keys = pdu::parse_text_parameters(&std::mem::take(&mut self.text_pending))?;
            let mut answer = Vec::new();
            for (key, value) in keys {
                if key == "SendTargets" {
                    answer.extend(login::send_targets(&value, &self.context.settings));
                } else {
                    log::debug!("Not understood in full feature phase: {}={}", key, value);
                    answer.push((key, "NotUnderstood".to_string()));
                }
            }
            (pdu::serialize_text_parameters(&answer), true, RESERVED_TAG)
        };

        let parser = TextResponseParser {
            continue_flag: false,
            lun: text.lun,
            target_transfer_tag: ttt,
            ..Default::default()
        };
        let pdu = ProtocolDataUnit::new(Parser::TextResponse(parser))
            .with_itt(itt)
            .with_final(final_flag)
            .with_data(answer);
        let port = Arc::clone(port);
        let session = Arc::clone(&port.session);
        session.deliver(
            text.cmd_sn,
            request.bhs.immediate,
            Box::new(move || {
                if let Err(e) = port.send_status(pdu) {
                    log::warn!("Text response to {} failed: {}", port.shared.peer, e);
                }
            }),
        )
    }

    fn logout(&mut self, port: &Arc<ConnectionPort>, request: &ProtocolDataUnit, logout: &LogoutRequestParser) -> ScsiResult<()> {
        let itt = request.itt();
        let context = Arc::clone(&self.context);
        let logout = logout.clone();
        let port = Arc::clone(port);
        let session = Arc::clone(&port.session);
        session.deliver(
            logout.cmd_sn,
            request.bhs.immediate,
            Box::new(move || {
                let tsih = port.session.tsih;
                let (response, close) = match logout.reason {
                    LogoutReason::CloseSession => (logout_response::SUCCESS, Some(None)),
                    LogoutReason::CloseConnection if logout.cid == port.cid || port.session.has_connection(logout.cid) => {
                        (logout_response::SUCCESS, Some(Some(logout.cid)))
                    }
                    LogoutReason::CloseConnection => (logout_response::CID_NOT_FOUND, None),
                    LogoutReason::RemoveConnectionForRecovery => {
                        (logout_response::CONNECTION_RECOVERY_NOT_SUPPORTED, None)
                    }
                };
                log::info!(
                    "Logout ({:?}) from {}: response {}",
                    logout.reason,
                    port.shared.peer,
                    response
                );
                let parser = LogoutResponseParser {
                    response,
                    time2wait: port.params.default_time2wait,
                    time2retain: port.params.default_time2retain,
                    ..Default::default()
                };
                let pdu = ProtocolDataUnit::new(Parser::LogoutResponse(parser))
                    .with_itt(itt)
                    .with_final(true);
                if let Err(e) = port.send_status(pdu) {
                    log::warn!("Logout response to {} failed: {}", port.shared.peer, e);
                }
                if let Some(cid) = close {
                    context.close_session_connections(tsih, cid);
                }
            }),
        )?;
        if self.shared.is_closing() {
            self.phase = ConnectionPhase::Logout;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.phase = ConnectionPhase::ConnectionClosed;
        self.shared.close();
        self.context.unregister(self.id);

        let Some(port) = self.port.take() else {
            return;
        };
        if self.context.sessions.remove_connection(port.session.tsih, port.cid) {
            // I_T nexus loss: nothing of this initiator survives the session
            for lu in self.context.luns.values() {
                lu.abort_task_set(&port.nexus(lu.lun()));
            }
        }
        log::info!("Connection from {} closed", self.shared.peer);
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
