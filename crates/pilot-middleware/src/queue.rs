//! Unbounded, ordered, multi-producer/single-consumer Event Queue.
//!
//! Built on an unbounded [`crossbeam::channel`] so that:
//!
//! * every Service holds a cheap [`EventSender`] clone and `push` never
//!   blocks, never drops and never applies backpressure;
//! * exactly one [`EventReceiver`] exists.  It is not `Clone`, so the single
//!   consumer rule is enforced by the type system rather than by convention.
//!
//! The "pending" flag is the channel's own emptiness: it flips in the same
//! atomic step as the enqueue/dequeue that changes it, and a `pop` that
//! follows a `true` [`EventReceiver::has_pending`] always yields an event.
//!
//! Ordering is total FIFO over all pushes.  Nothing is promised across tags
//! beyond that; the UI groups by tag on its own.

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use pilot_types::{Event, EventTag, PilotError};
use serde_json::Value;
use tracing::{debug, trace};

/// The Event Queue: both halves of the channel, created once at start-up.
///
/// Hand [`EventQueue::sender`] clones to producers, then [`split`] off the
/// receiver for the single consumer.
///
/// [`split`]: EventQueue::split
#[derive(Debug)]
pub struct EventQueue {
    sender: EventSender,
    receiver: EventReceiver,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            sender: EventSender { tx },
            receiver: EventReceiver { rx },
        }
    }

    /// A new producer handle.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// See [`EventSender::push`].
    pub fn push(&self, tag: EventTag, payload: Value) -> Result<(), PilotError> {
        self.sender.push(tag, payload)
    }

    /// See [`EventReceiver::pop`].
    pub fn pop(&self) -> Option<Event> {
        self.receiver.pop()
    }

    /// See [`EventReceiver::has_pending`].
    pub fn has_pending(&self) -> bool {
        self.receiver.has_pending()
    }

    /// Separate the producer and consumer halves.
    pub fn split(self) -> (EventSender, EventReceiver) {
        (self.sender, self.receiver)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Producer half
// ---------------------------------------------------------------------------

/// Producer handle.  Clone it freely, one per Service (or per thread).
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<Event>,
}

impl EventSender {
    /// Append `{type: tag, <tag>: payload}` to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`PilotError::Channel`] only when the consumer half has been
    /// dropped, i.e. the process is shutting down.
    pub fn push(&self, tag: EventTag, payload: Value) -> Result<(), PilotError> {
        self.push_event(Event::new(tag, payload))
    }

    /// Append an already-built [`Event`].
    pub fn push_event(&self, event: Event) -> Result<(), PilotError> {
        trace!(tag = %event.tag, "new event");
        self.tx
            .send(event)
            .map_err(|e| PilotError::Channel(format!("event queue closed, dropped {} event", e.0.tag)))
    }
}

// ---------------------------------------------------------------------------
// Consumer half
// ---------------------------------------------------------------------------

/// The single consumer of the queue.
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<Event>,
}

impl EventReceiver {
    /// Remove and return the oldest event, or `None` when the queue is
    /// empty.  An empty queue is not an error.
    pub fn pop(&self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                debug!("event queue has no producers left");
                None
            }
        }
    }

    /// `true` iff a following [`pop`](Self::pop) returns an event.  Does not
    /// mutate the queue.
    pub fn has_pending(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Block the calling thread until an event arrives.
    ///
    /// Returns `None` once every [`EventSender`] is gone and the queue is
    /// drained.  Meant for dedicated OS threads, never for async tasks.
    pub fn recv_blocking(&self) -> Option<Event> {
        self.rx.recv().ok()
    }
}
