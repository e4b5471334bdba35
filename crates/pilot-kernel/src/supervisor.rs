//! [`ServiceSupervisor`] – builds, launches and shuts down the Service fleet.
//!
//! Construction is fail-open: a Service that cannot be built or whose worker
//! cannot start is logged, recorded as failed in the `system` status event,
//! and skipped.  Everything else keeps running.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pilot_middleware::{CommandDispatch, EventSender, Refresh};
use pilot_services::{ServiceContext, ServiceFactory};
use pilot_types::{EventTag, PilotError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::process::{ProcessWorker, READY_TIMEOUT, WorkerLauncher};
use crate::worker::{Control, ThreadWorker};

const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Where a Service's worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// A dedicated OS thread in the supervisor's process.
    Thread,
    /// A child process running `--worker <tag>`.
    Process,
}

impl Isolation {
    /// Services wrapping native or blocking hardware stacks get their own
    /// process.
    pub fn default_for(tag: EventTag) -> Self {
        match tag {
            EventTag::Bluetooth | EventTag::Phone | EventTag::Vehicle | EventTag::Camera => {
                Isolation::Process
            }
            _ => Isolation::Thread,
        }
    }
}

/// One entry of the configured fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSpec {
    pub tag: EventTag,
    pub isolation: Isolation,
}

impl ServiceSpec {
    pub fn new(tag: EventTag, isolation: Isolation) -> Self {
        Self { tag, isolation }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Workers
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Worker {
    Thread { worker: ThreadWorker, accepts_commands: bool },
    Process(ProcessWorker),
}

impl Worker {
    fn send(&self, message: Control) -> Result<(), PilotError> {
        match self {
            Worker::Thread { worker, .. } => worker.send(message),
            Worker::Process(worker) => worker.send(message),
        }
    }

    fn accepts_commands(&self) -> bool {
        match self {
            Worker::Thread { accepts_commands, .. } => *accepts_commands,
            Worker::Process(worker) => worker.accepts_commands(),
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Worker::Thread { worker, .. } => worker.is_finished(),
            Worker::Process(worker) => worker.is_finished(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Running,
    Disabled,
    Failed(String),
}

struct Entry {
    tag: EventTag,
    status: Status,
    worker: Option<Arc<Worker>>,
}

#[derive(Serialize)]
struct ServiceStatus<'a> {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

// ────────────────────────────────────────────────────────────────────────────
// Supervisor
// ────────────────────────────────────────────────────────────────────────────

/// Owns every worker handle.  Implements [`Refresh`] so the connection
/// handler can trigger the refresh broadcast.
pub struct ServiceSupervisor {
    entries: Vec<Entry>,
    queue: EventSender,
    shutdown_grace: Duration,
}

impl fmt::Debug for ServiceSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSupervisor")
            .field("services", &self.entries.iter().map(|e| (e.tag, &e.status)).collect::<Vec<_>>())
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

impl ServiceSupervisor {
    /// Construct and launch every Service in `specs`, in order.
    ///
    /// `launcher` is required only for [`Isolation::Process`] entries; without
    /// it they run on threads instead.
    pub fn start(
        specs: &[ServiceSpec],
        factory: &dyn ServiceFactory,
        launcher: Option<&WorkerLauncher>,
        queue: EventSender,
        shutdown_grace: Duration,
    ) -> Self {
        let mut entries: Vec<Entry> = Vec::with_capacity(specs.len());
        for spec in specs {
            if entries.iter().any(|e| e.tag == spec.tag) {
                warn!(service = %spec.tag, "service configured twice, ignoring duplicate");
                continue;
            }
            let entry = Self::launch(*spec, factory, launcher, &queue);
            entries.push(entry);
        }

        let running = entries.iter().filter(|e| e.status == Status::Running).count();
        info!(running, configured = entries.len(), "services started");
        Self {
            entries,
            queue,
            shutdown_grace,
        }
    }

    fn launch(
        spec: ServiceSpec,
        factory: &dyn ServiceFactory,
        launcher: Option<&WorkerLauncher>,
        queue: &EventSender,
    ) -> Entry {
        let tag = spec.tag;
        if !factory.enabled(tag) {
            info!(service = %tag, "service disabled in settings");
            return Entry {
                tag,
                status: Status::Disabled,
                worker: None,
            };
        }

        let worker = match (spec.isolation, launcher) {
            (Isolation::Process, Some(launcher)) => {
                ProcessWorker::spawn(tag, launcher.command(tag), queue.clone(), READY_TIMEOUT).map(Worker::Process)
            }
            (isolation, _) => {
                if isolation == Isolation::Process {
                    warn!(service = %tag, "no worker launcher, running on a thread instead");
                }
                factory
                    .build(tag, ServiceContext::new(tag, queue.clone()))
                    .and_then(|service| {
                        let accepts_commands = service.accepts_commands();
                        ThreadWorker::spawn(service).map(|worker| Worker::Thread {
                            worker,
                            accepts_commands,
                        })
                    })
            }
        };

        match worker {
            Ok(worker) => {
                info!(service = %tag, isolation = ?spec.isolation, "service launched");
                Entry {
                    tag,
                    status: Status::Running,
                    worker: Some(Arc::new(worker)),
                }
            }
            Err(e) => {
                error!(service = %tag, error = %e, "failed to create service");
                Entry {
                    tag,
                    status: Status::Failed(e.to_string()),
                    worker: None,
                }
            }
        }
    }

    /// Tags of services whose worker is up.
    pub fn running(&self) -> Vec<EventTag> {
        self.entries
            .iter()
            .filter(|e| e.worker.is_some())
            .map(|e| e.tag)
            .collect()
    }

    /// The Command Dispatch Table: one entry per running Service that
    /// accepts commands.  Each handler forwards the payload to the worker.
    pub fn dispatch(&self) -> CommandDispatch {
        let mut table = CommandDispatch::new();
        for entry in &self.entries {
            let Some(worker) = entry.worker.as_ref().filter(|w| w.accepts_commands()) else {
                continue;
            };
            let worker = Arc::clone(worker);
            table.register(
                entry.tag,
                Arc::new(move |payload: Value| -> Result<(), PilotError> {
                    worker.send(Control::Command { payload })
                }),
            );
        }
        debug!(tags = ?table.tags().collect::<Vec<_>>(), "dispatch table built");
        table
    }

    /// The `system` status payload.
    pub fn status(&self) -> Value {
        let services: Vec<ServiceStatus<'_>> = self
            .entries
            .iter()
            .map(|entry| {
                let (status, error) = match (&entry.status, &entry.worker) {
                    (Status::Running, Some(worker)) if worker.is_finished() => ("exited", None),
                    (Status::Running, _) => ("running", None),
                    (Status::Disabled, _) => ("disabled", None),
                    (Status::Failed(reason), _) => ("failed", Some(reason.as_str())),
                };
                ServiceStatus {
                    name: entry.tag.as_str(),
                    status,
                    error,
                }
            })
            .collect();
        serde_json::json!({ "services": services })
    }

    /// Ask every worker to terminate, wait up to the grace period, then kill
    /// process workers that are still alive.  Thread workers that outlive
    /// the grace period are abandoned.
    pub fn shutdown(&self) {
        info!(grace_ms = self.shutdown_grace.as_millis() as u64, "stopping services");
        let workers: Vec<(EventTag, &Arc<Worker>)> = self
            .entries
            .iter()
            .filter_map(|e| e.worker.as_ref().map(|w| (e.tag, w)))
            .collect();

        for (tag, worker) in &workers {
            if let Err(e) = worker.send(Control::Terminate) {
                debug!(service = %tag, error = %e, "terminate not delivered");
            }
        }

        let deadline = Instant::now() + self.shutdown_grace;
        while Instant::now() < deadline && workers.iter().any(|(_, w)| !w.is_finished()) {
            thread::sleep(SHUTDOWN_POLL);
        }

        for (tag, worker) in &workers {
            match worker.as_ref() {
                Worker::Process(process) => process.kill(),
                Worker::Thread { worker, .. } if worker.is_finished() => worker.join_finished(),
                Worker::Thread { .. } => {
                    error!(service = %tag, "service did not stop in time, abandoning its thread");
                }
            }
        }
        info!("services stopped");
    }
}

impl Refresh for ServiceSupervisor {
    /// Publish the `system` status, then ask every running Service to
    /// re-emit its state.
    fn refresh_all(&self) {
        if let Err(e) = self.queue.push(EventTag::System, self.status()) {
            debug!(error = %e, "system status dropped");
        }
        for entry in &self.entries {
            if let Some(worker) = &entry.worker
                && let Err(e) = worker.send(Control::Refresh)
            {
                warn!(service = %entry.tag, error = %e, "refresh not delivered");
            }
        }
    }
}
