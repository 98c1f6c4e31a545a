//! Error types for iSCSI operations
//!
//! Two families are kept apart. [`ProtocolError`] describes a bad PDU that the
//! protocol lets us answer on the wire (usually with a Reject), so the
//! connection survives it. [`IscsiError`] is the crate error; apart from the
//! `Protocol` variant its kinds end the connection or the caller's request.

use crate::parser::RejectReason;
use std::fmt;
use thiserror::Error;

/// Which digest of a PDU failed to validate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    Header,
    Data,
}

impl fmt::Display for DigestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestKind::Header => write!(f, "header"),
            DigestKind::Data => write!(f, "data"),
        }
    }
}

/// Recoverable protocol violations, answered with a Reject or a login status
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Unsupported operation code 0x{0:02x}")]
    UnsupportedOperationCode(u8),

    #[error("Invalid value 0x{value:x} in field {field}")]
    InvalidFieldValue { field: &'static str, value: u64 },

    #[error("{kind} digest mismatch: received 0x{expected:08x}, computed 0x{computed:08x}")]
    DigestMismatch {
        kind: DigestKind,
        expected: u32,
        computed: u32,
    },

    #[error("{0} is not allowed before the full feature phase")]
    InvalidDuringLogin(String),

    #[error("Unexpected {received} in state {state}")]
    SequenceViolation { state: String, received: String },
}

impl ProtocolError {
    /// Reject reason code to send back for this violation
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            ProtocolError::UnsupportedOperationCode(_) => RejectReason::CommandNotSupported,
            ProtocolError::DigestMismatch { .. } => RejectReason::DataDigestError,
            ProtocolError::InvalidFieldValue { .. }
            | ProtocolError::InvalidDuringLogin(_)
            | ProtocolError::SequenceViolation { .. } => RejectReason::ProtocolError,
        }
    }

    pub(crate) fn invalid(field: &'static str, value: impl Into<u64>) -> Self {
        ProtocolError::InvalidFieldValue {
            field,
            value: value.into(),
        }
    }
}

/// iSCSI errors
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Buffer underflow: need {needed} bytes, have {available}")]
    BufferUnderflow { needed: usize, available: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No such connection: {0}")]
    NoSuchConnection(String),

    #[error("No such session: TSIH {0}")]
    NoSuchSession(u16),

    #[error("Resources exhausted: {0}")]
    ResourcesExhausted(String),

    #[error("SCSI error: {0}")]
    Scsi(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),
}

impl IscsiError {
    /// Whether the connection that produced this error has to be closed.
    ///
    /// Protocol errors are answered on the wire, except a header digest
    /// failure: once the header is suspect the PDU boundaries are too.
    pub fn is_fatal(&self) -> bool {
        match self {
            IscsiError::Protocol(ProtocolError::DigestMismatch { kind, .. }) => {
                *kind == DigestKind::Header
            }
            IscsiError::Protocol(_) => false,
            _ => true,
        }
    }

    /// The protocol error inside, if this error can be answered with a Reject
    pub fn as_protocol(&self) -> Option<&ProtocolError> {
        match self {
            IscsiError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type used across the crate
pub type ScsiResult<T> = Result<T, IscsiError>;

/// Describe a login status class/detail pair (RFC 3720 Section 10.13.5)
///
/// Meant for logs and error messages shown to operators, so each message
/// includes a hint about what to check.
pub fn decode_login_status(class: u8, detail: u8) -> String {
    let msg = match (class, detail) {
        (0x00, 0x00) => "Login success",
        (0x01, 0x01) => {
            "Target moved temporarily: reconnect to the portal given in TargetAddress"
        }
        (0x01, 0x02) => {
            "Target moved permanently: update the initiator configuration with the new TargetAddress"
        }
        (0x02, 0x00) => "Initiator error: the target rejected the login request",
        (0x02, 0x01) => {
            "Authentication failed: check the CHAP username and password configured for this initiator"
        }
        (0x02, 0x02) => {
            "Authorization failure: the initiator is not in the target ACL \
             (with TGTD: tgtadm --mode target --op bind --initiator-address ALL)"
        }
        (0x02, 0x03) => {
            "Target not found: the requested TargetName doesn't exist; run discovery to list targets"
        }
        (0x02, 0x04) => "Target removed: the target has been removed from this portal",
        (0x02, 0x05) => "Unsupported version: no common iSCSI protocol version",
        (0x02, 0x06) => {
            "Too many connections: the session reached its maximum; raise MaxConnections or close a connection"
        }
        (0x02, 0x07) => {
            "Missing parameter: a required key was not sent (InitiatorName, and TargetName for normal sessions)"
        }
        (0x02, 0x08) => "Cannot include connection in session: the session does not accept new connections",
        (0x02, 0x09) => {
            "Session type not supported: use a discovery session with SendTargets or give a TargetName"
        }
        (0x02, 0x0A) => "Session does not exist: the TSIH in the login request is not known",
        (0x02, 0x0B) => "Invalid request during login: only Login PDUs are allowed before full feature phase",
        (0x03, 0x00) => "Target error: the target hit an internal failure",
        (0x03, 0x01) => "Service unavailable: the target is not accepting logins; Wait and retry later",
        (0x03, 0x02) => "Target out of resources: no session or connection slots left",
        _ => {
            return format!(
                "Unknown login status class 0x{:02x} detail 0x{:02x} (not defined in RFC 3720)",
                class, detail
            )
        }
    };
    msg.to_string()
}
