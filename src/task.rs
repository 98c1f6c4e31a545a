//! SCSI tasks and the transport port they report through
//!
//! A [`Task`] is one SCSI command bound to the port that delivered it. Its
//! lifecycle is a small state machine: `Enqueued -> Executing -> Completed`,
//! with `Aborted` reachable until the response is committed. Once a task has
//! started writing its response an abort no longer succeeds, and an aborted
//! task never writes one.

use crate::error::ScsiResult;
use crate::parser::TaskAttribute;
use crate::scsi::{self, CommandContext, DataDirection, ScsiBlockDevice, ScsiResponse, SenseData};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

/// I_T_L_Q nexus: initiator port, target port, logical unit, task tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nexus {
    pub initiator: String,
    pub target: String,
    pub lun: u64,
    /// None for an I_T_L nexus
    pub task_tag: Option<u32>,
}

impl Nexus {
    pub fn itl(initiator: impl Into<String>, target: impl Into<String>, lun: u64) -> Self {
        Nexus {
            initiator: initiator.into(),
            target: target.into(),
            lun,
            task_tag: None,
        }
    }

    pub fn with_tag(mut self, tag: u32) -> Self {
        self.task_tag = Some(tag);
        self
    }

    /// Whether both name the same I_T_L, ignoring the task tag
    pub fn same_itl(&self, other: &Nexus) -> bool {
        self.lun == other.lun && self.initiator == other.initiator && self.target == other.target
    }
}

impl fmt::Display for Nexus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} LUN {}", self.initiator, self.target, self.lun)?;
        if let Some(tag) = self.task_tag {
            write!(f, " tag 0x{:08x}", tag)?;
        }
        Ok(())
    }
}

/// A SCSI command as the logical unit sees it
#[derive(Debug, Clone)]
pub struct Command {
    pub nexus: Nexus,
    pub cdb: Vec<u8>,
    pub attribute: TaskAttribute,
    /// CmdSN of the command, echoed back to the port
    pub command_reference: u32,
    /// Bytes the initiator expects to move; None leaves transfers unbounded
    pub expected_length: Option<u32>,
}

impl Command {
    /// Untagged commands are queued as Simple
    pub fn new(nexus: Nexus, cdb: Vec<u8>, attribute: TaskAttribute, command_reference: u32) -> Self {
        let attribute = match attribute {
            TaskAttribute::Untagged => TaskAttribute::Simple,
            other => other,
        };
        Command {
            nexus,
            cdb,
            attribute,
            command_reference,
            expected_length: None,
        }
    }

    pub fn with_expected_length(mut self, length: u32) -> Self {
        self.expected_length = Some(length);
        self
    }

    pub fn opcode(&self) -> u8 {
        self.cdb.first().copied().unwrap_or(0xFF)
    }
}

/// The service delivery side of a logical unit (SAM-2 target port)
pub trait TargetTransportPort: Send + Sync {
    /// Fill `buf` with data from the initiator. `Ok(false)` means the
    /// transfer was terminated.
    fn read_data(&self, nexus: &Nexus, command_reference: u32, buf: &mut [u8]) -> ScsiResult<bool>;

    /// Send data to the initiator. `Ok(false)` means the transfer was terminated.
    fn write_data(&self, nexus: &Nexus, command_reference: u32, data: &[u8]) -> ScsiResult<bool>;

    /// Final status of the command
    fn write_response(&self, nexus: &Nexus, command_reference: u32, status: u8, sense: Option<&[u8]>);

    /// Abandon any data transfer of the command; blocked transfers return
    fn terminate_data_transfer(&self, nexus: &Nexus, command_reference: u32);
}

/// Task states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Enqueued,
    Executing,
    /// Response committed
    Completed,
    Aborted,
}

/// Events that move a task between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Start,
    Respond,
    Abort,
}

impl TaskState {
    /// The state after `event`, or None if the event is not allowed now
    pub fn next(self, event: TaskEvent) -> Option<TaskState> {
        match (self, event) {
            (TaskState::Enqueued, TaskEvent::Start) => Some(TaskState::Executing),
            (TaskState::Enqueued | TaskState::Executing, TaskEvent::Respond) => Some(TaskState::Completed),
            (TaskState::Enqueued | TaskState::Executing, TaskEvent::Abort) => Some(TaskState::Aborted),
            _ => None,
        }
    }
}

/// One command on its way through a logical unit
pub struct Task {
    command: Command,
    port: Arc<dyn TargetTransportPort>,
    state: Mutex<TaskState>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("nexus", &self.command.nexus)
            .field("opcode", &format_args!("0x{:02x}", self.command.opcode()))
            .field("attribute", &self.command.attribute)
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    pub fn new(command: Command, port: Arc<dyn TargetTransportPort>) -> Self {
        Task {
            command,
            port,
            state: Mutex::new(TaskState::Enqueued),
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn nexus(&self) -> &Nexus {
        &self.command.nexus
    }

    pub fn attribute(&self) -> TaskAttribute {
        self.command.attribute
    }

    pub fn state(&self) -> TaskState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Apply an event; false when the current state doesn't allow it
    fn transition(&self, event: TaskEvent) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        match state.next(event) {
            Some(next) => {
                *state = next;
                true
            }
            None => false,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == TaskState::Aborted
    }

    /// Abort the task unless its response is already committed
    pub fn abort(&self) -> bool {
        if !self.transition(TaskEvent::Abort) {
            return false;
        }
        log::warn!("Aborted task {}", self.command.nexus);
        self.port
            .terminate_data_transfer(&self.command.nexus, self.command.command_reference);
        true
    }

    /// Answer without executing (task set full, overlapped commands, ...)
    pub fn reject(&self, response: ScsiResponse) {
        self.respond(&response);
    }

    fn respond(&self, response: &ScsiResponse) -> bool {
        if !self.transition(TaskEvent::Respond) {
            return false;
        }
        let sense = response.sense.as_ref().map(|s| s.to_bytes());
        self.port.write_response(
            &self.command.nexus,
            self.command.command_reference,
            response.status,
            sense.as_deref(),
        );
        true
    }

    /// Execute the command against `device`.
    ///
    /// Returns true when the task ended in CHECK CONDITION with NACA set,
    /// which must establish an ACA condition on the task set.
    pub fn run(&self, device: &RwLock<Box<dyn ScsiBlockDevice>>, luns: &[u64]) -> bool {
        if !self.transition(TaskEvent::Start) {
            return false;
        }
        let nexus = &self.command.nexus;
        let reference = self.command.command_reference;
        let cdb = &self.command.cdb;
        log::debug!("Executing {:?}", self);

        let direction = scsi::lookup(self.command.opcode()).map(|c| c.direction);
        let mut data_out = Vec::new();
        if direction == Some(DataDirection::Write) {
            let expected = self.command.expected_length;
            let (failure, length) = match device.read() {
                Ok(device) => (
                    scsi::check_extent(cdb, &**device)
                        .or_else(|| scsi::check_transfer_length(cdb, device.block_size(), expected)),
                    scsi::data_out_length(cdb, device.block_size()),
                ),
                Err(_) => (Some(ScsiResponse::check_condition(SenseData::target_failure())), 0),
            };
            if let Some(failure) = failure {
                // nothing will be read; drop whatever the initiator sends
                self.port.terminate_data_transfer(nexus, reference);
                return self.finish(failure);
            }
            if length > 0 {
                data_out = vec![0u8; length];
                match self.port.read_data(nexus, reference, &mut data_out) {
                    Ok(true) => {}
                    Ok(false) => {
                        log::debug!("Data-Out terminated for {}", nexus);
                        return false;
                    }
                    Err(e) => {
                        log::warn!("Data-Out for {} failed: {}", nexus, e);
                        return self.finish(ScsiResponse::check_condition(SenseData::target_failure()));
                    }
                }
            }
        }

        let response = scsi::execute(&CommandContext {
            cdb,
            device,
            luns,
            data_out: &data_out,
            expected_length: self.command.expected_length,
        });
        self.finish(response)
    }

    fn finish(&self, response: ScsiResponse) -> bool {
        let nexus = &self.command.nexus;
        if self.is_aborted() {
            return false;
        }
        if !response.data.is_empty() {
            match self.port.write_data(nexus, self.command.command_reference, &response.data) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    log::warn!("Data-In for {} failed: {}", nexus, e);
                    return false;
                }
            }
        }
        let check_condition = response.status == scsi::scsi_status::CHECK_CONDITION;
        self.respond(&response) && check_condition && scsi::naca(&self.command.cdb)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scsi::scsi_status;
    use crate::storage::MemoryDevice;

    /// What a recording port saw
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum PortEvent {
        DataIn(u32, usize),
        Response(u32, u8),
        Terminated(u32),
    }

    /// Port that records calls and supplies fixed Data-Out bytes
    #[derive(Default)]
    pub struct RecordingPort {
        pub events: Mutex<Vec<PortEvent>>,
        pub data_out: Vec<u8>,
    }

    impl RecordingPort {
        pub fn events(&self) -> Vec<PortEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl TargetTransportPort for RecordingPort {
        fn read_data(&self, _nexus: &Nexus, _reference: u32, buf: &mut [u8]) -> ScsiResult<bool> {
            let n = buf.len().min(self.data_out.len());
            buf[..n].copy_from_slice(&self.data_out[..n]);
            Ok(n == buf.len())
        }

        fn write_data(&self, _nexus: &Nexus, reference: u32, data: &[u8]) -> ScsiResult<bool> {
            self.events.lock().unwrap().push(PortEvent::DataIn(reference, data.len()));
            Ok(true)
        }

        fn write_response(&self, _nexus: &Nexus, reference: u32, status: u8, _sense: Option<&[u8]>) {
            self.events.lock().unwrap().push(PortEvent::Response(reference, status));
        }

        fn terminate_data_transfer(&self, _nexus: &Nexus, reference: u32) {
            self.events.lock().unwrap().push(PortEvent::Terminated(reference));
        }
    }

    pub fn nexus(tag: u32) -> Nexus {
        Nexus::itl("iqn.2025-12.test:init,i,0x800000000001", "iqn.2025-12.local:disk,t,0x0001", 0).with_tag(tag)
    }

    fn device() -> RwLock<Box<dyn ScsiBlockDevice>> {
        RwLock::new(Box::new(MemoryDevice::new(64, 512)))
    }

    #[test]
    fn test_state_transitions() {
        use TaskEvent::*;
        use TaskState::*;
        assert_eq!(Enqueued.next(Start), Some(Executing));
        assert_eq!(Executing.next(Respond), Some(Completed));
        assert_eq!(Executing.next(Abort), Some(Aborted));
        assert_eq!(Completed.next(Abort), None);
        assert_eq!(Aborted.next(Respond), None);
        assert_eq!(Aborted.next(Start), None);
    }

    #[test]
    fn test_untagged_becomes_simple() {
        let command = Command::new(nexus(1), vec![0x00; 6], TaskAttribute::Untagged, 1);
        assert_eq!(command.attribute, TaskAttribute::Simple);
    }

    #[test]
    fn test_read_task_writes_data_then_status() {
        let port = Arc::new(RecordingPort::default());
        let task = Task::new(
            Command::new(nexus(1), vec![0x28, 0, 0, 0, 0, 0, 0, 0, 2, 0], TaskAttribute::Simple, 7),
            port.clone(),
        );
        assert!(!task.run(&device(), &[0]));
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(
            port.events(),
            vec![PortEvent::DataIn(7, 1024), PortEvent::Response(7, scsi_status::GOOD)]
        );
    }

    #[test]
    fn test_write_task_reads_data_out() {
        let port = Arc::new(RecordingPort {
            data_out: vec![0x5A; 512],
            ..Default::default()
        });
        let device = device();
        let task = Task::new(
            Command::new(nexus(2), vec![0x2A, 0, 0, 0, 0, 3, 0, 0, 1, 0], TaskAttribute::Simple, 8),
            port.clone(),
        );
        task.run(&device, &[0]);
        assert_eq!(port.events(), vec![PortEvent::Response(8, scsi_status::GOOD)]);

        let mut block = [0u8; 512];
        device.read().unwrap().read(3, &mut block).unwrap();
        assert!(block.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_out_of_range_write_terminates_transfer() {
        let port = Arc::new(RecordingPort::default());
        let task = Task::new(
            Command::new(nexus(3), vec![0x2A, 0, 0, 0, 0, 100, 0, 0, 1, 0], TaskAttribute::Simple, 9),
            port.clone(),
        );
        task.run(&device(), &[0]);
        assert_eq!(
            port.events(),
            vec![
                PortEvent::Terminated(9),
                PortEvent::Response(9, scsi_status::CHECK_CONDITION)
            ]
        );
    }

    #[test]
    fn test_write_longer_than_expected_length_is_refused() {
        let port = Arc::new(RecordingPort {
            data_out: vec![0x5A; 4096],
            ..Default::default()
        });
        let device = device();
        // WRITE(10) of 8 blocks while the initiator expects to send one
        let command = Command::new(nexus(7), vec![0x2A, 0, 0, 0, 0, 0, 0, 0, 8, 0], TaskAttribute::Simple, 13)
            .with_expected_length(512);
        let task = Task::new(command, port.clone());
        task.run(&device, &[0]);
        assert_eq!(
            port.events(),
            vec![
                PortEvent::Terminated(13),
                PortEvent::Response(13, scsi_status::CHECK_CONDITION)
            ]
        );

        // nothing reached the medium
        let mut block = [0u8; 512];
        device.read().unwrap().read(0, &mut block).unwrap();
        assert!(block.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_aborted_task_sends_nothing() {
        let port = Arc::new(RecordingPort::default());
        let task = Task::new(
            Command::new(nexus(4), vec![0x00; 6], TaskAttribute::Simple, 10),
            port.clone(),
        );
        assert!(task.abort());
        assert!(!task.abort());
        task.run(&device(), &[0]);
        assert_eq!(port.events(), vec![PortEvent::Terminated(10)]);
        assert_eq!(task.state(), TaskState::Aborted);
    }

    #[test]
    fn test_completed_task_cannot_abort() {
        let port = Arc::new(RecordingPort::default());
        let task = Task::new(
            Command::new(nexus(5), vec![0x00; 6], TaskAttribute::Simple, 11),
            port.clone(),
        );
        task.run(&device(), &[0]);
        assert!(!task.abort());
    }

    #[test]
    fn test_naca_check_condition_requests_aca() {
        let port = Arc::new(RecordingPort::default());
        // unsupported opcode with NACA in the control byte
        let task = Task::new(
            Command::new(nexus(6), vec![0x02, 0, 0, 0, 0, 0x04], TaskAttribute::Simple, 12),
            port,
        );
        assert!(task.run(&device(), &[0]));
    }
}
