//! Background provisioning tasks.
//!
//! `submit` returns immediately with a task id; the job runs on a
//! spawned tokio task and publishes progress into a shared map that
//! `get` reads. A task is terminal once done or failed and is never
//! reused. Nothing a job does can escape its boundary — every failure
//! becomes `status = failed` plus a message.
//!
//! There is no cancellation and no per-VM mutual exclusion: submitting
//! two operations against the same VM concurrently is a caller error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::durations::DurationStore;
use crate::hypervisor::VmHandle;
use crate::progress::ProgressSink;
use crate::readiness::{Operation, ReadinessProber};
use crate::time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Failed,
}

/// Poll-visible state of one provisioning task.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub vm: String,
    pub op: String,
    pub status: TaskStatus,
    pub progress: String,
    pub ip: Option<String>,
    pub started: Option<f64>,
    pub finished: Option<f64>,
    pub error: Option<String>,
}

type TaskMap = Arc<Mutex<HashMap<String, Task>>>;

/// Sink that mirrors stage progress into the task map.
struct TaskSink {
    tasks: TaskMap,
    id: String,
}

impl ProgressSink for TaskSink {
    fn report(&self, message: &str) {
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        if let Some(task) = tasks.get_mut(&self.id) {
            task.progress = message.to_string();
        }
    }
}

/// Submits provisioning jobs and serves poll requests.
#[derive(Clone)]
pub struct TaskRunner {
    prober: ReadinessProber,
    durations: Arc<dyn DurationStore>,
    tasks: TaskMap,
}

impl TaskRunner {
    pub fn new(prober: ReadinessProber, durations: Arc<dyn DurationStore>) -> Self {
        Self {
            prober,
            durations,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue an operation. Returns the task id immediately.
    pub fn submit(&self, vm: VmHandle, op: Operation) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut tasks = self.tasks.lock().expect("task map poisoned");
            tasks.insert(
                id.clone(),
                Task {
                    id: id.clone(),
                    vm: vm.name().to_string(),
                    op: op.kind().to_string(),
                    status: TaskStatus::Queued,
                    progress: "Queued".to_string(),
                    ip: None,
                    started: None,
                    finished: None,
                    error: None,
                },
            );
        }

        let runner = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            runner.run_job(vm, op, job_id).await;
        });
        id
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.lock().expect("task map poisoned").get(id).cloned()
    }

    async fn run_job(&self, vm: VmHandle, op: Operation, id: String) {
        let started = time::unix_now();
        {
            let mut tasks = self.tasks.lock().expect("task map poisoned");
            if let Some(task) = tasks.get_mut(&id) {
                task.status = TaskStatus::Running;
                task.started = Some(started);
                task.progress = "Starting".to_string();
            }
        }

        let sink = TaskSink {
            tasks: Arc::clone(&self.tasks),
            id: id.clone(),
        };
        let result = self.prober.provision(&vm, &op, &sink).await;
        let finished = time::unix_now();

        let mut tasks = self.tasks.lock().expect("task map poisoned");
        let Some(task) = tasks.get_mut(&id) else {
            return;
        };
        task.finished = Some(finished);
        match result {
            Ok(outcome) => {
                task.status = TaskStatus::Done;
                task.ip = Some(outcome.ip);
                task.progress = "Complete".to_string();
                let key = match &op {
                    Operation::Revert { .. } => format!("{}_revert", vm.name()),
                    Operation::Connect if outcome.was_running => {
                        format!("{}_connect_warm", vm.name())
                    }
                    Operation::Connect => format!("{}_connect_cold", vm.name()),
                };
                self.durations.record(&key, finished - started);
                info!(vm = %vm.name(), op = op.kind(), task = %id, "task complete");
            }
            Err(e) => {
                task.status = TaskStatus::Failed;
                task.error = Some(e.to_string());
                warn!(vm = %vm.name(), op = op.kind(), task = %id, error = %e, "task failed");
            }
        }
    }
}
