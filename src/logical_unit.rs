//! Logical unit: a block device with its own task set and task manager

use crate::error::ScsiResult;
use crate::scsi::ScsiBlockDevice;
use crate::task::{Command, Nexus, TargetTransportPort, Task};
use crate::task_manager::{TaskManager, DEFAULT_WORKERS};
use crate::task_set::{TaskServiceResponse, TaskSet, DEFAULT_TASK_SET_CAPACITY};
use std::sync::{Arc, Mutex, RwLock};

pub struct LogicalUnit {
    lun: u64,
    device: Arc<RwLock<Box<dyn ScsiBlockDevice>>>,
    task_set: Arc<TaskSet>,
    manager: Mutex<Option<TaskManager>>,
    workers: usize,
}

impl LogicalUnit {
    pub fn new(lun: u64, device: Box<dyn ScsiBlockDevice>) -> Self {
        Self::with_capacity(lun, device, DEFAULT_TASK_SET_CAPACITY, DEFAULT_WORKERS)
    }

    pub fn with_capacity(lun: u64, device: Box<dyn ScsiBlockDevice>, capacity: usize, workers: usize) -> Self {
        LogicalUnit {
            lun,
            device: Arc::new(RwLock::new(device)),
            task_set: Arc::new(TaskSet::new(capacity)),
            manager: Mutex::new(None),
            workers,
        }
    }

    pub fn lun(&self) -> u64 {
        self.lun
    }

    pub fn device(&self) -> &Arc<RwLock<Box<dyn ScsiBlockDevice>>> {
        &self.device
    }

    pub fn task_set(&self) -> &Arc<TaskSet> {
        &self.task_set
    }

    /// Start executing tasks. `luns` is what REPORT LUNS answers with.
    pub fn start(&self, luns: Vec<u64>) -> ScsiResult<()> {
        let mut manager = match self.manager.lock() {
            Ok(manager) => manager,
            Err(poisoned) => poisoned.into_inner(),
        };
        if manager.is_some() {
            return Ok(());
        }
        let device = Arc::clone(&self.device);
        let set = Arc::clone(&self.task_set);
        let luns: Arc<[u64]> = luns.into();
        let execute = move |task: &Arc<Task>| {
            if task.run(&device, &luns) {
                log::warn!("ACA established by {}", task.nexus());
                set.establish_aca();
            }
        };
        *manager = Some(TaskManager::start(
            &format!("lu{}", self.lun),
            Arc::clone(&self.task_set),
            self.workers,
            Arc::new(execute),
        )?);
        Ok(())
    }

    /// Stop the task manager; queued tasks are aborted
    pub fn stop(&self) {
        let manager = match self.manager.lock() {
            Ok(mut manager) => manager.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut manager) = manager {
            manager.stop();
        }
        if let Ok(mut device) = self.device.write() {
            if let Err(e) = device.flush() {
                log::error!("Flush of LUN {} failed: {}", self.lun, e);
            }
        }
    }

    /// Queue a command. False when the task set refused it; the port has
    /// already been given the refusal status.
    pub fn enqueue(&self, port: Arc<dyn TargetTransportPort>, command: Command) -> bool {
        self.task_set.offer(Arc::new(Task::new(command, port)))
    }

    pub fn abort_task(&self, nexus: &Nexus) -> TaskServiceResponse {
        self.task_set.abort_task(nexus)
    }

    pub fn abort_task_set(&self, nexus: &Nexus) -> TaskServiceResponse {
        self.task_set.abort_task_set(nexus)
    }

    pub fn clear_task_set(&self, nexus: &Nexus) -> TaskServiceResponse {
        self.task_set.clear_task_set(nexus)
    }

    pub fn clear_aca(&self) -> TaskServiceResponse {
        self.task_set.clear_aca()
    }

    pub fn reset(&self) -> TaskServiceResponse {
        self.task_set.reset()
    }

    pub fn nexus_lost(&self) -> TaskServiceResponse {
        self.task_set.nexus_lost()
    }
}

impl Drop for LogicalUnit {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LogicalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalUnit")
            .field("lun", &self.lun)
            .field("tasks", &self.task_set.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::TaskAttribute;
    use crate::scsi::scsi_status;
    use crate::session::{Session, SessionParams};
    use crate::storage::MemoryDevice;
    use crate::task::tests::{nexus, PortEvent, RecordingPort};
    use std::time::Duration;

    fn wait_for(port: &RecordingPort, responses: usize) -> Vec<PortEvent> {
        for _ in 0..200 {
            let events = port.events();
            if events.iter().filter(|e| matches!(e, PortEvent::Response(..))).count() >= responses {
                return events;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        port.events()
    }

    #[test]
    fn test_executes_commands() {
        let lu = LogicalUnit::new(0, Box::new(MemoryDevice::new(64, 512)));
        lu.start(vec![0]).unwrap();
        let port = Arc::new(RecordingPort::default());

        // READ CAPACITY(10)
        let mut cdb = vec![0u8; 10];
        cdb[0] = 0x25;
        assert!(lu.enqueue(port.clone(), Command::new(nexus(7), cdb, TaskAttribute::Simple, 7)));

        let events = wait_for(&port, 1);
        assert_eq!(
            events,
            vec![PortEvent::DataIn(7, 8), PortEvent::Response(7, scsi_status::GOOD)]
        );
        lu.stop();
    }

    /// Records when each read starts and ends; reads take a while
    struct SlowDevice {
        inner: MemoryDevice,
        log: Arc<std::sync::Mutex<Vec<(&'static str, u64)>>>,
    }

    impl ScsiBlockDevice for SlowDevice {
        fn read(&self, lba: u64, buf: &mut [u8]) -> ScsiResult<()> {
            self.log.lock().unwrap().push(("start", lba));
            std::thread::sleep(Duration::from_millis(50));
            let result = self.inner.read(lba, buf);
            self.log.lock().unwrap().push(("end", lba));
            result
        }

        fn write(&mut self, lba: u64, buf: &[u8]) -> ScsiResult<()> {
            self.inner.write(lba, buf)
        }

        fn block_count(&self) -> u64 {
            self.inner.block_count()
        }

        fn block_size(&self) -> u32 {
            self.inner.block_size()
        }
    }

    fn read_10(lba: u8) -> Vec<u8> {
        let mut cdb = vec![0u8; 10];
        cdb[0] = 0x28;
        cdb[5] = lba;
        cdb[8] = 1;
        cdb
    }

    #[test]
    fn test_ordered_task_runs_between_simples() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let device = SlowDevice {
            inner: MemoryDevice::new(16, 512),
            log: Arc::clone(&log),
        };
        let lu = LogicalUnit::with_capacity(0, Box::new(device), 8, 4);
        lu.start(vec![0]).unwrap();
        let port = Arc::new(RecordingPort::default());

        let attributes = [
            (1, TaskAttribute::Simple),
            (2, TaskAttribute::Simple),
            (3, TaskAttribute::Ordered),
            (4, TaskAttribute::Simple),
        ];
        for (tag, attribute) in attributes {
            let reference = if attribute == TaskAttribute::Ordered { 100 } else { tag };
            assert!(lu.enqueue(port.clone(), Command::new(nexus(tag), read_10(tag as u8), attribute, reference)));
        }
        let events = wait_for(&port, 4);
        assert_eq!(
            events.iter().filter(|e| matches!(e, PortEvent::Response(_, scsi_status::GOOD))).count(),
            4
        );

        let log = log.lock().unwrap().clone();
        let at = |what: &str, lba: u64| log.iter().position(|&(w, l)| w == what && l == lba).unwrap();
        assert!(at("start", 3) > at("end", 1));
        assert!(at("start", 3) > at("end", 2));
        assert!(at("start", 4) > at("end", 3));
        lu.stop();
    }

    #[test]
    fn test_ordered_task_waits_for_earlier_cmd_sns() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let device = SlowDevice {
            inner: MemoryDevice::new(16, 512),
            log: Arc::clone(&log),
        };
        let lu = Arc::new(LogicalUnit::with_capacity(0, Box::new(device), 8, 4));
        lu.start(vec![0]).unwrap();
        let port = Arc::new(RecordingPort::default());
        let session = Session::new([0; 6], 1, SessionParams::default(), 98);
        let queued = Arc::new(std::sync::Mutex::new(Vec::new()));

        // (CmdSN, LBA, attribute), arriving out of CmdSN order
        let arrivals = [
            (99u32, 2u32, TaskAttribute::Simple),
            (101, 4, TaskAttribute::Simple),
            (98, 1, TaskAttribute::Simple),
            (100, 3, TaskAttribute::Ordered),
        ];
        for (cmd_sn, lba, attribute) in arrivals {
            let lu = Arc::clone(&lu);
            let port = Arc::clone(&port);
            let queued = Arc::clone(&queued);
            let command = Command::new(nexus(lba), read_10(lba as u8), attribute, cmd_sn);
            session
                .deliver(cmd_sn, false, Box::new(move || {
                    queued.lock().unwrap().push(cmd_sn);
                    assert!(lu.enqueue(port, command));
                }))
                .unwrap();
        }
        assert_eq!(*queued.lock().unwrap(), vec![98, 99, 100, 101]);

        let events = wait_for(&port, 4);
        assert_eq!(
            events.iter().filter(|e| matches!(e, PortEvent::Response(_, scsi_status::GOOD))).count(),
            4
        );
        let log = log.lock().unwrap().clone();
        let at = |what: &str, lba: u64| log.iter().position(|&(w, l)| w == what && l == lba).unwrap();
        assert!(at("start", 3) > at("end", 1));
        assert!(at("start", 3) > at("end", 2));
        assert!(at("start", 4) > at("end", 3));
        lu.stop();
    }

    #[test]
    fn test_naca_check_condition_establishes_aca() {
        let lu = LogicalUnit::new(0, Box::new(MemoryDevice::new(8, 512)));
        lu.start(vec![0]).unwrap();
        let port = Arc::new(RecordingPort::default());

        // READ(10) past the end with NACA set in the control byte
        let mut cdb = vec![0u8; 10];
        cdb[0] = 0x28;
        cdb[5] = 100;
        cdb[8] = 1;
        cdb[9] = 0x04;
        lu.enqueue(port.clone(), Command::new(nexus(1), cdb, TaskAttribute::Simple, 1));
        let events = wait_for(&port, 1);
        assert_eq!(events, vec![PortEvent::Response(1, scsi_status::CHECK_CONDITION)]);

        for _ in 0..100 {
            if lu.task_set().aca_active() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(lu.task_set().aca_active());

        // a Simple task is refused while ACA is active
        let refused = lu.enqueue(port.clone(), Command::new(nexus(2), vec![0u8; 6], TaskAttribute::Simple, 2));
        assert!(!refused);
        assert_eq!(lu.clear_aca(), TaskServiceResponse::FunctionComplete);
        assert!(!lu.task_set().aca_active());
        lu.stop();
    }
}
