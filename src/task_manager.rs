//! Task manager: moves runnable tasks from a task set onto worker threads
//!
//! One dispatcher thread per logical unit blocks in [`TaskSet::take`] and
//! hands each enabled task to a small pool of workers, so Simple tasks run
//! side by side while the task set enforces ordering.

use crate::error::ScsiResult;
use crate::task::Task;
use crate::task_set::TaskSet;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Default worker threads per logical unit
pub const DEFAULT_WORKERS: usize = 4;

/// Runs one enabled task; the manager marks it finished afterwards
pub type Executor = Arc<dyn Fn(&Arc<Task>) + Send + Sync>;

pub struct TaskManager {
    name: String,
    set: Arc<TaskSet>,
    dispatcher: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskManager {
    /// Spawn the dispatcher and `workers` worker threads
    pub fn start(name: &str, set: Arc<TaskSet>, workers: usize, execute: Executor) -> ScsiResult<Self> {
        let (sender, receiver) = mpsc::channel::<Arc<Task>>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let set = Arc::clone(&set);
            let execute = Arc::clone(&execute);
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", name, i))
                .spawn(move || worker(receiver, set, execute))?;
            handles.push(handle);
        }

        let dispatcher = {
            let set = Arc::clone(&set);
            thread::Builder::new()
                .name(format!("{}-manager", name))
                .spawn(move || {
                    while let Some(task) = set.take() {
                        if sender.send(task).is_err() {
                            break;
                        }
                    }
                    // dropping the sender stops the workers
                })?
        };

        log::info!("Task manager {} started with {} workers", name, handles.len());
        Ok(TaskManager {
            name: name.to_string(),
            set,
            dispatcher: Some(dispatcher),
            workers: handles,
        })
    }

    /// Close the task set, abort what is queued, and join every thread.
    /// Running tasks see their abort flag and finish without a response.
    pub fn stop(&mut self) {
        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        self.set.close();
        if dispatcher.join().is_err() {
            log::error!("Task manager {} dispatcher panicked", self.name);
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Task manager {} worker panicked", self.name);
            }
        }
        log::info!("Task manager {} stopped", self.name);
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_some()
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker(receiver: Arc<Mutex<Receiver<Arc<Task>>>>, set: Arc<TaskSet>, execute: Executor) {
    loop {
        let next = match receiver.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => return,
        };
        let Ok(task) = next else {
            return;
        };
        execute(&task);
        set.finished(&task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::TaskAttribute;
    use crate::task::tests::{nexus, RecordingPort};
    use crate::task::{Command, TargetTransportPort, TaskState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_runs_offered_tasks() {
        let set = Arc::new(TaskSet::new(16));
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let mut manager = TaskManager::start(
            "lu0",
            Arc::clone(&set),
            2,
            Arc::new(move |_task: &Arc<Task>| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let port: Arc<dyn TargetTransportPort> = Arc::new(RecordingPort::default());
        for tag in 0..5 {
            set.offer(Arc::new(Task::new(
                Command::new(nexus(tag), vec![0x00; 6], TaskAttribute::Simple, tag),
                Arc::clone(&port),
            )));
        }
        for _ in 0..100 {
            if ran.load(Ordering::SeqCst) == 5 && set.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 5);
        assert!(set.is_empty());

        manager.stop();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_stop_aborts_queued_tasks() {
        let set = Arc::new(TaskSet::new(16));
        let port: Arc<dyn TargetTransportPort> = Arc::new(RecordingPort::default());

        // an Ordered task that never finishes keeps the rest dormant
        let (release, gate) = mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        let mut manager = TaskManager::start(
            "lu1",
            Arc::clone(&set),
            1,
            Arc::new(move |_task: &Arc<Task>| {
                let _ = gate.lock().unwrap().recv_timeout(Duration::from_secs(5));
            }),
        )
        .unwrap();

        let first = Arc::new(Task::new(
            Command::new(nexus(1), vec![0x00; 6], TaskAttribute::Ordered, 1),
            Arc::clone(&port),
        ));
        let queued = Arc::new(Task::new(
            Command::new(nexus(2), vec![0x00; 6], TaskAttribute::Simple, 2),
            Arc::clone(&port),
        ));
        set.offer(Arc::clone(&first));
        set.offer(Arc::clone(&queued));
        thread::sleep(Duration::from_millis(50));

        set.close();
        assert_eq!(queued.state(), TaskState::Aborted);
        release.send(()).unwrap();
        manager.stop();
    }
}
