//! Process-isolated workers.
//!
//! The parent re-executes its own binary with `--worker <tag>`.  The two
//! sides talk newline-delimited JSON over the child's standard streams:
//!
//! | stream | direction | content |
//! |---|---|---|
//! | stdin  | parent → child | [`Control`] |
//! | stdout | child → parent | [`WorkerFrame`] (`ready`/`failed` once, then `event`s) |
//! | stderr | child → parent | JSON log records, re-emitted by the parent |

use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use pilot_middleware::{EventQueue, EventReceiver, EventSender};
use pilot_services::{ServiceContext, ServiceFactory};
use pilot_types::{Event, EventTag, PilotError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::worker::{Control, run_actor};

/// How long a freshly spawned worker has to construct its Service.
pub const READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Child → parent line on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerFrame {
    Ready { accepts_commands: bool },
    Failed { reason: String },
    Event { frame: Event },
}

/// Builds the command line for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerLauncher {
    /// `args` precede `--worker <tag>` (e.g. `--config <path>`).
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Launch workers from the running executable.
    pub fn current_exe(args: Vec<String>) -> Result<Self, PilotError> {
        Ok(Self::new(std::env::current_exe()?, args))
    }

    pub fn command(&self, tag: EventTag) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg("--worker").arg(tag.as_str());
        command
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Parent side
// ────────────────────────────────────────────────────────────────────────────

/// Handle on a Service running in a child process.
#[derive(Debug)]
pub struct ProcessWorker {
    tag: EventTag,
    accepts_commands: bool,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

fn creation_failed(tag: EventTag, reason: impl Into<String>) -> PilotError {
    PilotError::FailedToCreateService {
        service: tag.to_string(),
        reason: reason.into(),
    }
}

impl ProcessWorker {
    /// Spawn `command` and wait up to `ready_timeout` for its handshake.
    /// Events the child emits are pushed onto `queue`.
    ///
    /// # Errors
    ///
    /// [`PilotError::FailedToCreateService`] when the process cannot start,
    /// reports `failed`, exits early or stays silent past the timeout.
    pub fn spawn(
        tag: EventTag,
        mut command: Command,
        queue: EventSender,
        ready_timeout: Duration,
    ) -> Result<Self, PilotError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| creation_failed(tag, format!("cannot start worker process: {e}")))?;
        let stdin = child.stdin.take();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            return Err(creation_failed(tag, "worker process has no output pipes"));
        };

        let (ready_tx, ready_rx) = channel::bounded(1);
        let out_pump = thread::Builder::new()
            .name(format!("svc-{tag}-out"))
            .spawn(move || pump_stdout(tag, stdout, queue, ready_tx))?;
        let err_pump = thread::Builder::new()
            .name(format!("svc-{tag}-log"))
            .spawn(move || pump_stderr(tag, stderr))?;

        let accepts_commands = match ready_rx.recv_timeout(ready_timeout) {
            Ok(WorkerFrame::Ready { accepts_commands }) => accepts_commands,
            Ok(WorkerFrame::Failed { reason }) => {
                let _ = child.wait();
                return Err(creation_failed(tag, reason));
            }
            Ok(WorkerFrame::Event { .. }) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(creation_failed(tag, "worker emitted events before its handshake"));
            }
            Err(RecvTimeoutError::Timeout) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(creation_failed(tag, "worker did not report readiness in time"));
            }
            Err(RecvTimeoutError::Disconnected) => {
                let status = child.wait().map(|s| s.to_string()).unwrap_or_default();
                return Err(creation_failed(tag, format!("worker exited before reporting readiness ({status})")));
            }
        };
        info!(service = %tag, pid = child.id(), accepts_commands, "process worker ready");

        Ok(Self {
            tag,
            accepts_commands,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pumps: Mutex::new(vec![out_pump, err_pump]),
        })
    }

    pub fn tag(&self) -> EventTag {
        self.tag
    }

    pub fn accepts_commands(&self) -> bool {
        self.accepts_commands
    }

    /// Write one control line to the child's stdin.
    pub fn send(&self, message: Control) -> Result<(), PilotError> {
        let mut line = serde_json::to_string(&message).map_err(|e| PilotError::Channel(e.to_string()))?;
        line.push('\n');
        let mut guard = self
            .stdin
            .lock()
            .map_err(|_| PilotError::Channel(format!("{} worker stdin poisoned", self.tag)))?;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| PilotError::Channel(format!("{} worker stdin closed", self.tag)))?;
        stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.flush())
            .map_err(|e| PilotError::Channel(format!("{} worker: {e}", self.tag)))
    }

    pub fn is_finished(&self) -> bool {
        match self.child.lock() {
            Ok(mut child) => !matches!(child.try_wait(), Ok(None)),
            Err(_) => true,
        }
    }

    /// Kill the child if it is still running and reap it.
    pub fn kill(&self) {
        if let Ok(mut child) = self.child.lock() {
            if matches!(child.try_wait(), Ok(None)) {
                warn!(service = %self.tag, pid = child.id(), "killing worker process");
                let _ = child.kill();
            }
            let _ = child.wait();
        }
        self.join_pumps();
    }

    /// Join the pipe threads once the child is gone.
    pub fn join_pumps(&self) {
        if let Ok(mut stdin) = self.stdin.lock() {
            stdin.take();
        }
        if let Ok(mut pumps) = self.pumps.lock() {
            for pump in pumps.drain(..) {
                let _ = pump.join();
            }
        }
    }
}

fn pump_stdout(tag: EventTag, stdout: impl Read, queue: EventSender, ready: Sender<WorkerFrame>) {
    let mut ready = Some(ready);
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(service = %tag, error = %e, "worker stdout read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerFrame>(&line) {
            Ok(WorkerFrame::Event { frame }) => {
                if let Err(e) = queue.push_event(frame) {
                    debug!(service = %tag, error = %e, "event dropped");
                }
            }
            Ok(frame) => match ready.take() {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => warn!(service = %tag, ?frame, "unexpected handshake frame"),
            },
            Err(e) => warn!(service = %tag, error = %e, line = %line, "malformed worker frame"),
        }
    }
    debug!(service = %tag, "worker stdout closed");
}

fn pump_stderr(tag: EventTag, stderr: impl Read) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) if !line.trim().is_empty() => forward_log_line(tag, &line),
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

/// Re-emit one JSON log record written by a worker into this process's
/// subscriber.  Anything that is not a JSON record is logged verbatim.
pub fn forward_log_line(tag: EventTag, line: &str) {
    let Ok(Value::Object(mut record)) = serde_json::from_str::<Value>(line) else {
        info!(service = %tag, "{line}");
        return;
    };
    let level = record
        .get("level")
        .and_then(Value::as_str)
        .unwrap_or("INFO")
        .to_ascii_uppercase();
    let origin = record
        .get("target")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mut fields = match record.remove("fields") {
        Some(Value::Object(fields)) => fields,
        _ => serde_json::Map::new(),
    };
    let message = match fields.remove("message") {
        Some(Value::String(message)) => message,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let detail = if fields.is_empty() {
        String::new()
    } else {
        Value::Object(fields).to_string()
    };

    match level.as_str() {
        "ERROR" => error!(service = %tag, %origin, %detail, "{message}"),
        "WARN" => warn!(service = %tag, %origin, %detail, "{message}"),
        "INFO" => info!(service = %tag, %origin, %detail, "{message}"),
        "DEBUG" => debug!(service = %tag, %origin, %detail, "{message}"),
        _ => trace!(service = %tag, %origin, %detail, "{message}"),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Child side
// ────────────────────────────────────────────────────────────────────────────

fn write_frame(out: &mut impl Write, frame: &WorkerFrame) -> Result<(), PilotError> {
    let mut line = serde_json::to_string(frame).map_err(|e| PilotError::Io(e.to_string()))?;
    line.push('\n');
    out.write_all(line.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn forward_events(events: EventReceiver, mut out: impl Write) {
    while let Some(frame) = events.recv_blocking() {
        if let Err(e) = write_frame(&mut out, &WorkerFrame::Event { frame }) {
            error!(error = %e, "cannot write to the supervisor, dropping events");
            break;
        }
    }
}

fn read_controls(input: impl BufRead, control: Sender<Control>) {
    for line in input.lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Control>(&line) {
            Ok(message) => {
                let terminate = message == Control::Terminate;
                if control.send(message).is_err() || terminate {
                    break;
                }
            }
            Err(e) => warn!(error = %e, line = %line, "malformed control message"),
        }
    }
}

/// Worker-process entry point: build the Service for `tag`, report the
/// outcome on `output`, then serve control messages from `input` until told
/// to terminate or `input` closes.
///
/// # Errors
///
/// Returns the construction error after reporting it as a `failed` frame,
/// or an I/O error when `output` is unusable.
pub fn run_child<I, O>(tag: EventTag, factory: &dyn ServiceFactory, input: I, mut output: O) -> Result<(), PilotError>
where
    I: BufRead + Send + 'static,
    O: Write + Send + 'static,
{
    let (sender, receiver) = EventQueue::new().split();
    let service = match factory.build(tag, ServiceContext::new(tag, sender)) {
        Ok(service) => service,
        Err(e) => {
            error!(service = %tag, error = %e, "service construction failed");
            write_frame(&mut output, &WorkerFrame::Failed { reason: e.to_string() })?;
            return Err(e);
        }
    };
    write_frame(
        &mut output,
        &WorkerFrame::Ready {
            accepts_commands: service.accepts_commands(),
        },
    )?;

    let writer = thread::Builder::new()
        .name("worker-out".to_string())
        .spawn(move || forward_events(receiver, output))?;
    let (control_tx, control_rx) = channel::unbounded();
    // Not joined: it may stay blocked on stdin until the process exits.
    thread::Builder::new()
        .name("worker-in".to_string())
        .spawn(move || read_controls(input, control_tx))?;

    run_actor(service, control_rx);
    if writer.join().is_err() {
        error!(service = %tag, "event writer panicked");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_services::{Service, Tick};
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Instant;

    struct Echo(ServiceContext);

    impl Service for Echo {
        fn tag(&self) -> EventTag {
            self.0.tag()
        }
        fn tick(&mut self) -> Result<Tick, PilotError> {
            Ok(Tick::Idle)
        }
        fn refresh(&mut self) {
            self.0.push_to_queue(&json!({"state": "fresh"}));
        }
        fn accepts_commands(&self) -> bool {
            true
        }
        fn handle_command(&mut self, payload: Value) -> Result<(), PilotError> {
            self.0.push_to_queue(&json!({"echo": payload}));
            Ok(())
        }
    }

    struct EchoFactory;

    impl ServiceFactory for EchoFactory {
        fn build(&self, tag: EventTag, ctx: ServiceContext) -> Result<Box<dyn Service>, PilotError> {
            match tag {
                EventTag::Media => Ok(Box::new(Echo(ctx))),
                other => Err(creation_failed(other, "no such backend")),
            }
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn frames(&self) -> Vec<WorkerFrame> {
            let text = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
        }
    }

    #[test]
    fn child_reports_ready_and_streams_events() {
        let input = Cursor::new(
            b"{\"op\":\"refresh\"}\nnot json\n{\"op\":\"command\",\"payload\":\"next\"}\n{\"op\":\"terminate\"}\n".to_vec(),
        );
        let out = SharedBuf::default();
        run_child(EventTag::Media, &EchoFactory, input, out.clone()).unwrap();

        let frames = out.frames();
        assert_eq!(frames[0], WorkerFrame::Ready { accepts_commands: true });
        assert_eq!(
            frames[1],
            WorkerFrame::Event {
                frame: Event::new(EventTag::Media, json!({"state": "fresh"}))
            }
        );
        assert_eq!(
            frames[2],
            WorkerFrame::Event {
                frame: Event::new(EventTag::Media, json!({"echo": "next"}))
            }
        );
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn child_reports_construction_failure() {
        let out = SharedBuf::default();
        let result = run_child(EventTag::Vehicle, &EchoFactory, Cursor::new(Vec::new()), out.clone());
        assert!(result.is_err());
        assert!(matches!(out.frames()[0], WorkerFrame::Failed { ref reason } if reason.contains("no such backend")));
    }

    #[test]
    fn frame_wire_format() {
        let frame = WorkerFrame::Event {
            frame: Event::new(EventTag::Phone, json!({"state": "connected"})),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"kind": "event", "frame": {"type": "phone", "phone": {"state": "connected"}}})
        );
    }

    #[test]
    fn launcher_appends_worker_flag() {
        let launcher = WorkerLauncher::new("/usr/bin/pilot-drive", vec!["--config".into(), "/tmp/p.toml".into()]);
        let command = launcher.command(EventTag::Camera);
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["--config", "/tmp/p.toml", "--worker", "camera"]);
    }

    #[test]
    fn forward_log_line_accepts_any_input() {
        forward_log_line(EventTag::Media, r#"{"level":"WARN","fields":{"message":"hi","n":1},"target":"x"}"#);
        forward_log_line(EventTag::Media, "plain text");
    }

    #[cfg(unix)]
    fn sh(script: &str, arg: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script).arg(arg);
        command
    }

    #[cfg(unix)]
    #[test]
    fn parent_relays_events_and_controls() {
        let dir = tempfile::TempDir::new().unwrap();
        let seen = dir.path().join("control");
        let script = r#"
            echo '{"kind":"ready","accepts_commands":true}'
            echo '{"kind":"event","frame":{"type":"media","media":{"song":null}}}'
            echo '{"level":"WARN","fields":{"message":"from child"},"target":"t"}' >&2
            read line
            echo "$line" > "$0"
        "#;
        let queue = EventQueue::new();
        let worker = ProcessWorker::spawn(
            EventTag::Media,
            sh(script, &seen.display().to_string()),
            queue.sender(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(worker.accepts_commands());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !queue.has_pending() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(queue.pop().unwrap(), Event::new(EventTag::Media, json!({"song": null})));

        worker.send(Control::Terminate).unwrap();
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(worker.is_finished());
        worker.join_pumps();
        assert_eq!(std::fs::read_to_string(&seen).unwrap().trim(), r#"{"op":"terminate"}"#);
    }

    #[cfg(unix)]
    #[test]
    fn parent_surfaces_failed_handshake() {
        let queue = EventQueue::new();
        let err = ProcessWorker::spawn(
            EventTag::Bluetooth,
            sh(r#"echo '{"kind":"failed","reason":"bluetoothctl missing"}'"#, "x"),
            queue.sender(),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert_eq!(
            err,
            PilotError::FailedToCreateService {
                service: "bluetooth".into(),
                reason: "bluetoothctl missing".into()
            }
        );

        let err = ProcessWorker::spawn(EventTag::Bluetooth, sh("exit 3", "x"), queue.sender(), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, PilotError::FailedToCreateService { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn silent_worker_times_out_and_is_killed() {
        let queue = EventQueue::new();
        let started = Instant::now();
        let err = ProcessWorker::spawn(
            EventTag::Camera,
            sh("sleep 30", "x"),
            queue.sender(),
            Duration::from_millis(200),
        )
        .unwrap_err();
        assert!(matches!(err, PilotError::FailedToCreateService { ref reason, .. } if reason.contains("in time")));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
