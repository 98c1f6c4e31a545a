//! Target side of the login phase
//!
//! One [`LoginNegotiator`] lives on each new connection until it reaches the
//! full feature phase. It answers each Login Request with a Login Response,
//! runs the security exchange, negotiates operational keys, and on the final
//! transit either creates the session (leading login) or joins an existing
//! one by TSIH.

use crate::auth::{AuthExchange, AuthStep, Authenticator};
use crate::error::{IscsiError, ScsiResult};
use crate::parser::{LoginResponseParser, LoginStage, Parser};
use crate::pdu::{self, login_status, ProtocolDataUnit};
use crate::session::{ConnectionPhase, SessionManager, SessionParams, SessionType, Session, DEFAULT_COMMAND_WINDOW};
use std::sync::Arc;

/// Highest and lowest iSCSI protocol version we speak
pub const VERSION: u8 = 0x00;

/// Target-wide settings consulted during login
#[derive(Debug, Clone)]
pub struct LoginSettings {
    pub target_name: String,
    pub target_alias: String,
    /// Portal advertised in SendTargets answers, `address:port,tpgt`
    pub portal: String,
    /// Starting point for every negotiation
    pub params: SessionParams,
    pub authenticator: Arc<dyn Authenticator>,
}

/// Result of processing one Login Request
#[derive(Debug)]
pub enum LoginOutcome {
    /// Still negotiating; send this response
    InProgress(ProtocolDataUnit),
    /// Send this response, then switch to the full feature phase
    Complete {
        response: ProtocolDataUnit,
        session: Arc<Session>,
        params: SessionParams,
    },
    /// Send this response, then close the connection
    Rejected(ProtocolDataUnit),
}

impl LoginOutcome {
    pub fn response(&self) -> &ProtocolDataUnit {
        match self {
            LoginOutcome::InProgress(response)
            | LoginOutcome::Complete { response, .. }
            | LoginOutcome::Rejected(response) => response,
        }
    }
}

/// Per-connection login state
pub struct LoginNegotiator {
    phase: ConnectionPhase,
    params: SessionParams,
    started: bool,
    isid: [u8; 6],
    tsih: u16,
    cid: u16,
    cmd_sn: u32,
    stat_sn: u32,
    auth: Option<Box<dyn AuthExchange>>,
    authenticated: bool,
    declared: bool,
    /// Text data of requests sent with the Continue flag
    pending: Vec<u8>,
}

impl LoginNegotiator {
    pub fn new(settings: &LoginSettings) -> Self {
        let mut params = settings.params.clone();
        params.target_name.clear();
        params.target_alias = settings.target_alias.clone();
        LoginNegotiator {
            phase: ConnectionPhase::SecurityNegotiation,
            params,
            started: false,
            isid: [0; 6],
            tsih: 0,
            cid: 0,
            cmd_sn: 0,
            stat_sn: 0,
            auth: None,
            authenticated: false,
            declared: false,
            pending: Vec::new(),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// StatSN the next response on this connection carries
    pub fn next_stat_sn(&self) -> u32 {
        self.stat_sn
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }

    /// Handle one Login Request.
    ///
    /// `accepting` is false once the target is draining; new logins then
    /// fail with SERVICE_UNAVAILABLE.
    pub fn process(
        &mut self,
        pdu: &ProtocolDataUnit,
        settings: &LoginSettings,
        sessions: &SessionManager,
        accepting: bool,
    ) -> ScsiResult<LoginOutcome> {
        let Parser::LoginRequest(request) = pdu.parser() else {
            return Err(IscsiError::Session(format!(
                "{} received during login",
                pdu.opcode().name()
            )));
        };
        let transit = pdu.bhs.final_flag;
        let itt = pdu.itt();

        if !self.started {
            self.started = true;
            self.isid = request.isid;
            self.tsih = request.tsih;
            self.cid = request.cid;
            self.cmd_sn = request.cmd_sn;
            self.phase = ConnectionPhase::from_stage(request.current_stage);
            log::debug!(
                "Login start: ISID={:02x?} TSIH={} CID={} CmdSN={}",
                self.isid,
                self.tsih,
                self.cid,
                self.cmd_sn
            );

            if !accepting {
                return Ok(self.reject(itt, request.current_stage, login_status::SERVICE_UNAVAILABLE));
            }
            if request.version_min > VERSION {
                return Ok(self.reject(itt, request.current_stage, login_status::UNSUPPORTED_VERSION));
            }
            if self.tsih != 0 && sessions.get(self.tsih).is_err() {
                return Ok(self.reject(itt, request.current_stage, login_status::SESSION_DOES_NOT_EXIST));
            }
        } else if request.isid != self.isid || request.tsih != self.tsih {
            return Ok(self.reject(itt, request.current_stage, login_status::INITIATOR_ERROR_GENERIC));
        }

        // Stage must follow from where the last exchange left us
        if ConnectionPhase::from_stage(request.current_stage) != self.phase {
            log::warn!(
                "Login request CSG {:?} while in {:?}",
                request.current_stage,
                self.phase
            );
            return Ok(self.reject(itt, request.current_stage, login_status::INITIATOR_ERROR_GENERIC));
        }

        self.pending.extend_from_slice(&pdu.data);
        if request.continue_flag {
            // More text follows; acknowledge with an empty response
            return Ok(LoginOutcome::InProgress(self.response(itt, request.current_stage, request.current_stage, false, Vec::new(), 0)));
        }
        let offered = pdu::parse_text_parameters(&std::mem::take(&mut self.pending))?;
        log::debug!("Received {} login parameters: {:?}", offered.len(), offered);

        let mut answers = Vec::new();
        if let Some(status) = self.check_names(&offered, settings) {
            return Ok(self.reject(itt, request.current_stage, status));
        }

        match request.current_stage {
            LoginStage::SecurityNegotiation => {
                match self.security_step(&offered, settings, &mut answers) {
                    Ok(()) => {}
                    Err(status) => return Ok(self.reject(itt, request.current_stage, status)),
                }
            }
            LoginStage::LoginOperationalNegotiation => {
                if !self.authenticated && !settings.authenticator.allows_skip() {
                    return Ok(self.reject(itt, request.current_stage, login_status::AUTH_FAILURE));
                }
                answers.extend(self.params.negotiate(&operational_keys(&offered)));
                self.declare(&mut answers);
            }
            LoginStage::FullFeaturePhase => {
                return Ok(self.reject(itt, request.current_stage, login_status::INITIATOR_ERROR_GENERIC));
            }
        }

        // Transit only when the stage work is done
        let stage_done = match request.current_stage {
            LoginStage::SecurityNegotiation => self.authenticated,
            _ => true,
        };
        let response_transit = transit && stage_done;
        let next_stage = if response_transit {
            request.next_stage
        } else {
            request.current_stage
        };

        self.phase = ConnectionPhase::after_login(
            request.current_stage,
            transit,
            request.next_stage,
            response_transit,
            next_stage,
        );

        if self.phase != ConnectionPhase::FullFeaturePhase {
            let data = pdu::serialize_text_parameters(&answers);
            return Ok(LoginOutcome::InProgress(self.response(itt, request.current_stage, next_stage, response_transit, data, 0)));
        }

        // Entering full feature phase: the operational stage may have been skipped
        if !self.declared {
            self.declare(&mut answers);
        }

        let session = match self.attach(sessions) {
            Ok(session) => session,
            Err(status) => return Ok(self.reject(itt, request.current_stage, status)),
        };
        self.tsih = session.tsih;

        let data = pdu::serialize_text_parameters(&answers);
        log::debug!("Sending {} response parameters: {:?}", answers.len(), answers);
        let (exp_cmd_sn, max_cmd_sn) = session.command_window();
        let mut response = self.response(itt, request.current_stage, next_stage, true, data, self.tsih);
        if let Parser::LoginResponse(parser) = &mut response.bhs.parser {
            parser.exp_cmd_sn = exp_cmd_sn;
            parser.max_cmd_sn = max_cmd_sn;
        }

        log::info!(
            "Login complete: {} CID {} in {} session TSIH {}",
            self.params.initiator_name,
            self.cid,
            self.params.session_type.as_str(),
            self.tsih
        );
        Ok(LoginOutcome::Complete {
            response,
            session,
            params: self.params.clone(),
        })
    }

    /// Declarative names; returns a failure status if they don't fit
    fn check_names(&mut self, offered: &[(String, String)], settings: &LoginSettings) -> Option<u16> {
        let first = self.params.initiator_name.is_empty();
        for (key, value) in offered {
            if matches!(key.as_str(), "InitiatorName" | "InitiatorAlias" | "TargetName" | "SessionType") {
                self.params.apply_initiator_param(key, value);
            }
        }
        if !first {
            return None;
        }

        if self.params.initiator_name.is_empty() {
            return Some(login_status::MISSING_PARAMETER);
        }
        if self.params.session_type == SessionType::Normal {
            if self.params.target_name.is_empty() {
                return Some(login_status::MISSING_PARAMETER);
            }
            if self.params.target_name != settings.target_name {
                log::warn!(
                    "Login for unknown target {} from {}",
                    self.params.target_name,
                    self.params.initiator_name
                );
                return Some(login_status::TARGET_NOT_FOUND);
            }
        }
        None
    }

    fn security_step(
        &mut self,
        offered: &[(String, String)],
        settings: &LoginSettings,
        answers: &mut Vec<(String, String)>,
    ) -> Result<(), u16> {
        if let Some((_, methods)) = offered.iter().find(|(k, _)| k == "AuthMethod") {
            match settings.authenticator.select(methods) {
                Some(method) => {
                    answers.push(("AuthMethod".to_string(), method));
                    self.auth = Some(settings.authenticator.exchange());
                }
                None => {
                    log::warn!("No acceptable AuthMethod in {}", methods);
                    return Err(login_status::AUTH_FAILURE);
                }
            }
        } else if self.auth.is_none() {
            if settings.authenticator.allows_skip() {
                self.authenticated = true;
            } else {
                return Err(login_status::AUTH_FAILURE);
            }
        }

        if let Some(exchange) = self.auth.as_mut() {
            if !self.authenticated {
                let security: Vec<_> = offered
                    .iter()
                    .filter(|(k, _)| !is_declarative(k) && k != "AuthMethod")
                    .cloned()
                    .collect();
                match exchange.step(&security) {
                    AuthStep::Continue(keys) => answers.extend(keys),
                    AuthStep::Complete(keys) => {
                        answers.extend(keys);
                        self.authenticated = true;
                    }
                    AuthStep::Failed(reason) => {
                        log::warn!("Authentication failed: {}", reason);
                        return Err(login_status::AUTH_FAILURE);
                    }
                }
            }
        }

        // Operational keys sent early are negotiated right away
        answers.extend(self.params.negotiate(&operational_keys(offered)));
        Ok(())
    }

    /// Target declarations sent once per login
    fn declare(&mut self, answers: &mut Vec<(String, String)>) {
        if self.declared {
            return;
        }
        self.declared = true;
        if self.params.session_type == SessionType::Normal && !self.params.target_alias.is_empty() {
            answers.push(("TargetAlias".to_string(), self.params.target_alias.clone()));
        }
        answers.push((
            "MaxRecvDataSegmentLength".to_string(),
            self.params.max_recv_data_segment_length.to_string(),
        ));
    }

    fn attach(&mut self, sessions: &SessionManager) -> Result<Arc<Session>, u16> {
        let result = if self.tsih == 0 {
            sessions.create(self.isid, self.cid, self.params.clone(), self.cmd_sn)
        } else {
            sessions.add_connection(self.tsih, self.isid, self.cid)
        };
        result.map_err(|e| match e {
            IscsiError::NoSuchSession(_) => login_status::SESSION_DOES_NOT_EXIST,
            IscsiError::ResourcesExhausted(_) if self.tsih != 0 => login_status::TOO_MANY_CONNECTIONS,
            IscsiError::ResourcesExhausted(_) => login_status::OUT_OF_RESOURCES,
            _ => login_status::TARGET_ERROR_GENERIC,
        })
    }

    fn response(
        &mut self,
        itt: u32,
        current_stage: LoginStage,
        next_stage: LoginStage,
        transit: bool,
        data: Vec<u8>,
        tsih: u16,
    ) -> ProtocolDataUnit {
        let stat_sn = self.stat_sn;
        self.stat_sn = self.stat_sn.wrapping_add(1);
        ProtocolDataUnit::new(Parser::LoginResponse(LoginResponseParser {
            continue_flag: false,
            current_stage,
            next_stage: if transit { next_stage } else { current_stage },
            version_max: VERSION,
            version_active: VERSION,
            isid: self.isid,
            tsih,
            stat_sn,
            exp_cmd_sn: self.cmd_sn,
            max_cmd_sn: self.cmd_sn.wrapping_add(DEFAULT_COMMAND_WINDOW - 1),
            status_class: 0,
            status_detail: 0,
        }))
        .with_itt(itt)
        .with_final(transit)
        .with_data(data)
    }

    /// Create a login reject response
    fn reject(&mut self, itt: u32, stage: LoginStage, status: u16) -> LoginOutcome {
        log::warn!(
            "Rejecting login from {}: {}",
            if self.params.initiator_name.is_empty() { "<unnamed>" } else { self.params.initiator_name.as_str() },
            crate::error::decode_login_status((status >> 8) as u8, status as u8)
        );
        let mut response = self.response(itt, stage, stage, false, Vec::new(), 0);
        if let Parser::LoginResponse(parser) = &mut response.bhs.parser {
            parser.set_status(status);
        }
        self.phase = ConnectionPhase::ConnectionClosed;
        LoginOutcome::Rejected(response)
    }
}

fn is_declarative(key: &str) -> bool {
    matches!(key, "InitiatorName" | "InitiatorAlias" | "TargetName" | "SessionType")
}

fn operational_keys(offered: &[(String, String)]) -> Vec<(String, String)> {
    offered
        .iter()
        .filter(|(k, _)| !is_declarative(k) && k != "AuthMethod" && !k.starts_with("CHAP_"))
        .cloned()
        .collect()
}

/// Answer a SendTargets text request on a discovery session
pub fn send_targets(request: &str, settings: &LoginSettings) -> Vec<(String, String)> {
    if request == "All" || request == settings.target_name || request.is_empty() {
        vec![
            ("TargetName".to_string(), settings.target_name.clone()),
            ("TargetAddress".to_string(), settings.portal.clone()),
        ]
    } else {
        Vec::new()
    }
}
