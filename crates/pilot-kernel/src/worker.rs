//! The worker loop that hosts one Service, and its thread-isolated handle.
//!
//! A worker alternates between running the Service's main-loop iteration
//! when it is due and waiting for [`Control`] messages until then.  Control
//! messages are handled strictly in arrival order, so a refresh sent before
//! a command always reaches the Service first.

use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use pilot_services::{Service, Tick};
use pilot_types::{EventTag, PilotError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Delay before retrying a main-loop iteration that failed.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Shortest gap between two main-loop iterations.
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// Supervisor → worker message.  Also the line format on a process
/// worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Control {
    Refresh,
    Command { payload: Value },
    Terminate,
}

/// Drive `service` until [`Control::Terminate`] arrives or every sender of
/// `control` is gone.  Calls [`Service::terminate`] before returning.
pub fn run_actor(mut service: Box<dyn Service>, control: Receiver<Control>) {
    let tag = service.tag();
    let mut due = Some(Instant::now());
    debug!(service = %tag, "worker started");

    loop {
        let received = match due {
            Some(at) => {
                let now = Instant::now();
                if at <= now {
                    // At most one iteration before the channel is looked at.
                    due = next_due(&mut *service, now);
                    control.try_recv().map_err(|e| match e {
                        TryRecvError::Empty => RecvTimeoutError::Timeout,
                        TryRecvError::Disconnected => RecvTimeoutError::Disconnected,
                    })
                } else {
                    control.recv_timeout(at - now)
                }
            }
            None => control.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Control::Refresh) => service.refresh(),
            Ok(Control::Command { payload }) => {
                if let Err(e) = service.handle_command(payload) {
                    warn!(service = %tag, error = %e, "command failed");
                }
            }
            Ok(Control::Terminate) => {
                info!(service = %tag, "terminating");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!(service = %tag, "control channel closed");
                break;
            }
        }
    }
    service.terminate();
    debug!(service = %tag, "worker stopped");
}

fn next_due(service: &mut dyn Service, now: Instant) -> Option<Instant> {
    match service.tick() {
        Ok(Tick::After(delay)) => Some(now + delay.max(MIN_TICK)),
        Ok(Tick::Idle) => None,
        Err(e) => {
            warn!(service = %service.tag(), error = %e, "main loop iteration failed");
            Some(now + ERROR_BACKOFF)
        }
    }
}

/// A Service hosted on a dedicated, named OS thread of this process.
#[derive(Debug)]
pub struct ThreadWorker {
    tag: EventTag,
    control: Sender<Control>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadWorker {
    /// # Errors
    ///
    /// [`PilotError::Io`] when the OS refuses to spawn the thread.
    pub fn spawn(service: Box<dyn Service>) -> Result<Self, PilotError> {
        let tag = service.tag();
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name(format!("svc-{tag}"))
            .spawn(move || run_actor(service, rx))?;
        Ok(Self {
            tag,
            control: tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn tag(&self) -> EventTag {
        self.tag
    }

    pub fn send(&self, message: Control) -> Result<(), PilotError> {
        self.control
            .send(message)
            .map_err(|_| PilotError::Channel(format!("{} worker has stopped", self.tag)))
    }

    pub fn is_finished(&self) -> bool {
        match self.handle.lock() {
            Ok(guard) => guard.as_ref().is_none_or(JoinHandle::is_finished),
            Err(_) => true,
        }
    }

    /// Reap the thread if it has finished.  A panicked service is logged.
    pub fn join_finished(&self) {
        let Ok(mut guard) = self.handle.lock() else {
            return;
        };
        if guard.as_ref().is_some_and(JoinHandle::is_finished)
            && let Some(handle) = guard.take()
            && handle.join().is_err()
        {
            warn!(service = %self.tag, "worker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_middleware::EventQueue;
    use pilot_services::ServiceContext;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Counter {
        ctx: ServiceContext,
        ticks: Arc<AtomicUsize>,
        terminated: Arc<AtomicBool>,
        fail: bool,
        interval: Duration,
    }

    impl Service for Counter {
        fn tag(&self) -> EventTag {
            self.ctx.tag()
        }
        fn tick(&mut self) -> Result<Tick, PilotError> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PilotError::hardware("test", "broken"));
            }
            Ok(Tick::After(self.interval))
        }
        fn refresh(&mut self) {
            self.ctx.push_to_queue(&json!({"ticks": self.ticks.load(Ordering::SeqCst)}));
        }
        fn accepts_commands(&self) -> bool {
            true
        }
        fn handle_command(&mut self, payload: Value) -> Result<(), PilotError> {
            self.ctx.push_to_queue(&json!({"echo": payload}));
            Ok(())
        }
        fn terminate(&mut self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    fn counter(queue: &EventQueue, fail: bool) -> (Counter, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let terminated = Arc::new(AtomicBool::new(false));
        let svc = Counter {
            ctx: ServiceContext::new(EventTag::Media, queue.sender()),
            ticks: Arc::clone(&ticks),
            terminated: Arc::clone(&terminated),
            fail,
            interval: Duration::from_millis(5),
        };
        (svc, ticks, terminated)
    }

    #[test]
    fn control_messages_are_handled_in_order() {
        let queue = EventQueue::new();
        let (svc, _, terminated) = counter(&queue, false);
        let (tx, rx) = channel::unbounded();
        tx.send(Control::Refresh).unwrap();
        tx.send(Control::Command { payload: json!("next") }).unwrap();
        tx.send(Control::Terminate).unwrap();
        run_actor(Box::new(svc), rx);

        assert!(queue.pop().unwrap().payload.get("ticks").is_some());
        assert_eq!(queue.pop().unwrap().payload, json!({"echo": "next"}));
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[test]
    fn closed_channel_terminates_service() {
        let queue = EventQueue::new();
        let (svc, ticks, terminated) = counter(&queue, false);
        let (tx, rx) = channel::unbounded::<Control>();
        drop(tx);
        run_actor(Box::new(svc), rx);
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[test]
    fn failing_iteration_backs_off() {
        let queue = EventQueue::new();
        let (svc, ticks, _) = counter(&queue, true);
        let worker = ThreadWorker::spawn(Box::new(svc)).unwrap();
        thread::sleep(Duration::from_millis(200));
        // One attempt, then the one-second back-off.
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        worker.send(Control::Terminate).unwrap();
    }

    #[test]
    fn thread_worker_runs_and_stops() {
        let queue = EventQueue::new();
        let (svc, ticks, terminated) = counter(&queue, false);
        let worker = ThreadWorker::spawn(Box::new(svc)).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(ticks.load(Ordering::SeqCst) > 1);

        worker.send(Control::Terminate).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.is_finished());
        worker.join_finished();
        assert!(terminated.load(Ordering::SeqCst));
        assert!(worker.send(Control::Refresh).is_err());
    }

    #[test]
    fn zero_delay_service_still_sees_control() {
        let queue = EventQueue::new();
        let (mut svc, ticks, terminated) = counter(&queue, false);
        svc.interval = Duration::ZERO;
        let worker = ThreadWorker::spawn(Box::new(svc)).unwrap();
        thread::sleep(Duration::from_millis(20));

        worker.send(Control::Refresh).unwrap();
        worker.send(Control::Terminate).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.is_finished());
        assert!(terminated.load(Ordering::SeqCst));
        assert!(queue.pop().unwrap().payload.get("ticks").is_some());
        // Clamped to one iteration per millisecond at most.
        assert!(ticks.load(Ordering::SeqCst) < 1_000);
    }

    #[test]
    fn control_wire_format() {
        assert_eq!(serde_json::to_value(Control::Refresh).unwrap(), json!({"op": "refresh"}));
        assert_eq!(
            serde_json::from_str::<Control>(r#"{"op":"command","payload":{"a":1}}"#).unwrap(),
            Control::Command { payload: json!({"a": 1}) }
        );
    }
}
