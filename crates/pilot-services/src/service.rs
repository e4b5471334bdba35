//! The contract every Service variant implements.
//!
//! A Service owns private state and talks outward only through
//! [`ServiceContext::push_to_queue`].  It never runs its own loop: the worker
//! that hosts it (a dedicated thread or a child process) calls
//! [`Service::tick`] whenever the previously returned [`Tick`] is due and
//! interleaves refresh, command and terminate requests between iterations.
//! One iteration must return promptly; long waits belong in the returned
//! [`Tick::After`] delay.

use std::time::Duration;

use pilot_middleware::EventSender;
use pilot_types::{EventTag, PilotError};
use serde::Serialize;
use serde_json::Value;
use tracing::{trace, warn};

/// When the worker should run the next main-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Run again after the given delay.
    After(Duration),
    /// Nothing left to poll; only control messages wake the service.
    Idle,
}

impl Tick {
    pub fn millis(ms: u64) -> Self {
        Tick::After(Duration::from_millis(ms))
    }
}

/// An isolated integration producing events for one [`EventTag`].
pub trait Service: Send {
    fn tag(&self) -> EventTag;

    /// One iteration of the service's main loop.
    ///
    /// # Errors
    ///
    /// Runtime faults are reported here.  The hosting worker logs them and
    /// retries after a fixed back-off; the service is expected to have
    /// emitted its degraded state already.
    fn tick(&mut self) -> Result<Tick, PilotError>;

    /// Re-emit the current cached state without changing it.
    fn refresh(&mut self);

    /// Whether [`handle_command`](Service::handle_command) is meaningful.
    fn accepts_commands(&self) -> bool {
        false
    }

    /// Handle the payload of a UI command addressed to this service's tag.
    fn handle_command(&mut self, payload: Value) -> Result<(), PilotError> {
        let _ = payload;
        Err(PilotError::NoHandler(self.tag()))
    }

    /// Release OS resources.  Best effort; never fails.
    fn terminate(&mut self) {}
}

/// Everything a Service needs to reach the outside world.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    tag: EventTag,
    queue: EventSender,
}

impl ServiceContext {
    pub fn new(tag: EventTag, queue: EventSender) -> Self {
        Self { tag, queue }
    }

    pub fn tag(&self) -> EventTag {
        self.tag
    }

    /// Push `event` under this service's own tag.
    pub fn push_to_queue<T: Serialize + ?Sized>(&self, event: &T) {
        self.push_to_queue_as(self.tag, event);
    }

    /// Push `event` under an explicit tag.
    ///
    /// A payload that fails to serialise, or a queue that is already closed,
    /// is logged and otherwise ignored: a service never fails because the
    /// consumer went away.
    pub fn push_to_queue_as<T: Serialize + ?Sized>(&self, tag: EventTag, event: &T) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(service = %self.tag, error = %e, "event payload is not serialisable");
                return;
            }
        };
        trace!(service = %self.tag, %tag, "push_to_queue");
        if let Err(e) = self.queue.push(tag, payload) {
            warn!(service = %self.tag, error = %e, "event dropped");
        }
    }
}
