//! Per logical unit task set
//!
//! Tasks wait in a dormant queue until the ordering rules of their task
//! attribute let them run, then move to the enabled list until they finish.
//! Only the head of the dormant queue is ever considered, so a blocked task
//! holds back everything queued behind it.

use crate::parser::TaskAttribute;
use crate::scsi::{scsi_status, ScsiResponse, SenseData};
use crate::task::{Nexus, Task};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Default number of tasks a logical unit accepts at once
pub const DEFAULT_TASK_SET_CAPACITY: usize = 64;

/// Outcome of a task management function (SAM-2 service response)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskServiceResponse {
    FunctionComplete,
    FunctionRejected,
    ServiceDeliveryOrTargetFailure,
}

#[derive(Default)]
struct Inner {
    dormant: VecDeque<Arc<Task>>,
    enabled: Vec<Arc<Task>>,
    aca: bool,
    closed: bool,
}

impl Inner {
    fn len(&self) -> usize {
        self.dormant.len() + self.enabled.len()
    }

    fn contains(&self, nexus: &Nexus) -> bool {
        self.dormant.iter().chain(self.enabled.iter()).any(|t| t.nexus() == nexus)
    }

    fn blocked(&self, task: &Task) -> bool {
        let attribute = task.attribute();
        if self.aca && attribute != TaskAttribute::Aca {
            return true;
        }
        match attribute {
            TaskAttribute::HeadOfQueue | TaskAttribute::Aca => false,
            TaskAttribute::Ordered => !self.enabled.is_empty(),
            TaskAttribute::Simple | TaskAttribute::Untagged => self
                .enabled
                .last()
                .map(|t| t.attribute() != TaskAttribute::Simple)
                .unwrap_or(false),
        }
    }

    /// Remove matching dormant tasks and collect matching enabled ones
    fn take_matching(&mut self, matches: impl Fn(&Task) -> bool) -> Vec<Arc<Task>> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.dormant.len());
        for task in self.dormant.drain(..) {
            if matches(&*task) {
                taken.push(task);
            } else {
                kept.push_back(task);
            }
        }
        self.dormant = kept;
        taken.extend(self.enabled.iter().filter(|t| matches(&***t)).cloned());
        taken
    }
}

/// Why an offered task was turned away
enum Refusal {
    Closed,
    AcaActive,
    Overlapped,
    Full,
}

/// Tasks of one logical unit, ordered by task attribute
pub struct TaskSet {
    capacity: usize,
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl TaskSet {
    pub fn new(capacity: usize) -> Self {
        TaskSet {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue a task. Never fails to the caller: a refused task is answered
    /// through its port and false is returned.
    pub fn offer(&self, task: Arc<Task>) -> bool {
        let refusal = {
            let mut inner = self.lock();
            if inner.closed {
                Some(Refusal::Closed)
            } else if inner.aca && task.attribute() != TaskAttribute::Aca {
                Some(Refusal::AcaActive)
            } else if inner.contains(task.nexus()) {
                Some(Refusal::Overlapped)
            } else if inner.len() >= self.capacity {
                Some(Refusal::Full)
            } else {
                match task.attribute() {
                    TaskAttribute::HeadOfQueue | TaskAttribute::Aca => inner.dormant.push_front(Arc::clone(&task)),
                    _ => inner.dormant.push_back(Arc::clone(&task)),
                }
                self.changed.notify_all();
                None
            }
        };

        // port I/O happens outside the lock
        let response = match refusal {
            None => return true,
            Some(Refusal::Closed) => ScsiResponse::status(scsi_status::BUSY),
            Some(Refusal::AcaActive) => ScsiResponse::status(scsi_status::ACA_ACTIVE),
            Some(Refusal::Overlapped) => ScsiResponse::check_condition(SenseData::overlapped_commands()),
            Some(Refusal::Full) => ScsiResponse::status(scsi_status::TASK_SET_FULL),
        };
        log::warn!(
            "Refusing task {} with status 0x{:02x}",
            task.nexus(),
            response.status
        );
        task.reject(response);
        false
    }

    /// Block until the next task may run; None once the set is closed
    pub fn take(&self) -> Option<Arc<Task>> {
        let mut inner = self.lock();
        loop {
            if inner.closed {
                return None;
            }
            let runnable = inner.dormant.front().map(|head| !inner.blocked(head)).unwrap_or(false);
            if runnable {
                if let Some(task) = inner.dormant.pop_front() {
                    inner.enabled.push(Arc::clone(&task));
                    log::debug!("Enabling {:?}", task);
                    return Some(task);
                }
            }
            inner = match self.changed.wait(inner) {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// A task taken with [`take`](Self::take) has finished running
    pub fn finished(&self, task: &Arc<Task>) {
        let mut inner = self.lock();
        inner.enabled.retain(|t| !Arc::ptr_eq(t, task));
        self.changed.notify_all();
    }

    fn abort_all(&self, tasks: Vec<Arc<Task>>) {
        for task in tasks {
            task.abort();
        }
        self.changed.notify_all();
    }

    /// ABORT TASK; succeeds whether or not the task still exists
    pub fn abort_task(&self, nexus: &Nexus) -> TaskServiceResponse {
        if nexus.task_tag.is_none() {
            return TaskServiceResponse::FunctionRejected;
        }
        let tasks = self.lock().take_matching(|t| t.nexus() == nexus);
        if tasks.is_empty() {
            log::debug!("ABORT TASK for {}: no such task", nexus);
        }
        self.abort_all(tasks);
        TaskServiceResponse::FunctionComplete
    }

    /// ABORT TASK SET: every task of the I_T_L nexus
    pub fn abort_task_set(&self, nexus: &Nexus) -> TaskServiceResponse {
        let tasks = self.lock().take_matching(|t| t.nexus().same_itl(nexus));
        log::info!("ABORT TASK SET for {}: {} tasks", nexus, tasks.len());
        self.abort_all(tasks);
        TaskServiceResponse::FunctionComplete
    }

    /// CLEAR TASK SET: every task of the I_T_L nexus, and any ACA condition
    pub fn clear_task_set(&self, nexus: &Nexus) -> TaskServiceResponse {
        let tasks = {
            let mut inner = self.lock();
            inner.aca = false;
            inner.take_matching(|t| t.nexus().same_itl(nexus))
        };
        log::info!("CLEAR TASK SET for {}: {} tasks", nexus, tasks.len());
        self.abort_all(tasks);
        TaskServiceResponse::FunctionComplete
    }

    /// Enter the ACA condition; only ACA tasks run until it is cleared
    pub fn establish_aca(&self) {
        self.lock().aca = true;
        log::warn!("ACA condition established");
    }

    pub fn clear_aca(&self) -> TaskServiceResponse {
        let mut inner = self.lock();
        inner.aca = false;
        self.changed.notify_all();
        TaskServiceResponse::FunctionComplete
    }

    pub fn aca_active(&self) -> bool {
        self.lock().aca
    }

    /// LOGICAL UNIT RESET: abort everything and clear ACA
    pub fn reset(&self) -> TaskServiceResponse {
        let tasks = {
            let mut inner = self.lock();
            inner.aca = false;
            inner.take_matching(|_| true)
        };
        log::info!("Task set reset: {} tasks aborted", tasks.len());
        self.abort_all(tasks);
        TaskServiceResponse::FunctionComplete
    }

    /// Every initiator lost its connection to this unit
    pub fn nexus_lost(&self) -> TaskServiceResponse {
        self.reset()
    }

    /// Abort everything and make [`take`](Self::take) return None
    pub fn close(&self) {
        let tasks = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.take_matching(|_| true)
        };
        self.abort_all(tasks);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
