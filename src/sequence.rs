//! Order of PDU exchanges on an initiator connection
//!
//! Independent of the login phase machine: this one tracks which request or
//! response may come next while the client drives a connection. A login is
//! followed by a capacity query, then any number of reads and writes, then
//! a logout.

use crate::error::ProtocolError;

/// Where an initiator connection is in its exchange sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceState {
    LoginRequest,
    LoginResponse,
    CapacityRequest,
    CapacityResponse,
    WaitingForWork,
    ReadRequest,
    ReadResponse,
    WriteRequest,
    /// Unsolicited Data-Out after the command
    WriteFirstBurst,
    /// Waiting for an R2T or the final response
    WriteSecondResponse,
    /// Data-Out answering an R2T
    WriteSecondBurst,
    LogoutRequest,
    LogoutResponse,
    ConnectionClosed,
}

impl SequenceState {
    pub const INITIAL: SequenceState = SequenceState::LoginRequest;

    /// States that may legally follow this one
    pub fn successors(self) -> &'static [SequenceState] {
        use SequenceState::*;
        match self {
            LoginRequest => &[LoginResponse],
            // multi-stage logins go round again; discovery sessions log out
            LoginResponse => &[LoginRequest, CapacityRequest, LogoutRequest],
            CapacityRequest => &[CapacityResponse],
            CapacityResponse => &[WaitingForWork],
            WaitingForWork => &[ReadRequest, WriteRequest, CapacityRequest, LogoutRequest],
            ReadRequest => &[ReadResponse],
            ReadResponse => &[WaitingForWork],
            WriteRequest => &[WriteFirstBurst, WriteSecondResponse],
            WriteFirstBurst => &[WriteSecondResponse],
            WriteSecondResponse => &[WriteSecondBurst, WaitingForWork],
            WriteSecondBurst => &[WriteSecondResponse],
            LogoutRequest => &[LogoutResponse],
            LogoutResponse => &[ConnectionClosed],
            ConnectionClosed => &[],
        }
    }

    pub fn can_move_to(self, next: SequenceState) -> bool {
        self.successors().contains(&next)
    }

    /// Resting states where side requests (NOP-Out, Text) may be exchanged
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            SequenceState::LoginResponse | SequenceState::CapacityResponse | SequenceState::WaitingForWork
        )
    }
}

/// Sequence tracker for one connection
#[derive(Debug, Clone)]
pub struct Sequencer {
    state: SequenceState,
}

impl Default for Sequencer {
    fn default() -> Self {
        Sequencer {
            state: SequenceState::INITIAL,
        }
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// Move to `next`, or fail without moving if it may not follow
    pub fn advance(&mut self, next: SequenceState) -> Result<(), ProtocolError> {
        if !self.state.can_move_to(next) {
            return Err(ProtocolError::SequenceViolation {
                state: format!("{:?}", self.state),
                received: format!("{:?}", next),
            });
        }
        log::trace!("Sequence {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Check that a side request may be sent now
    pub fn check_idle(&self, what: &str) -> Result<(), ProtocolError> {
        if self.state.is_idle() {
            Ok(())
        } else {
            Err(ProtocolError::SequenceViolation {
                state: format!("{:?}", self.state),
                received: what.to_string(),
            })
        }
    }

    /// The connection is gone, whatever state it was in
    pub fn close(&mut self) {
        self.state = SequenceState::ConnectionClosed;
    }
}
