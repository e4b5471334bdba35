//! Command Dispatch Table.
//!
//! Maps an [`EventTag`] to the single handler of the Service that owns it.
//! Inbound UI frames are parsed, their tag looked up, and the handler invoked
//! with exactly the value stored under the tag's key.  A tag with no handler
//! is reported as [`PilotError::NoHandler`] and nothing is invoked.
//!
//! The table is filled once during start-up and read-only afterwards, so it
//! is shared behind a plain `Arc` without a lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use pilot_types::{Event, EventTag, PilotError};
use serde_json::Value;
use tracing::debug;

/// Receives the payload of a command frame addressed to one tag.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, payload: Value) -> Result<(), PilotError>;
}

impl<F> CommandHandler for F
where
    F: Fn(Value) -> Result<(), PilotError> + Send + Sync,
{
    fn handle(&self, payload: Value) -> Result<(), PilotError> {
        self(payload)
    }
}

/// Asks every live Service to re-push its complete current state.
///
/// Fired once each time a UI connection is established so a freshly loaded
/// UI is never blank.
pub trait Refresh: Send + Sync {
    fn refresh_all(&self);
}

/// `EventTag → handler` map.
#[derive(Default, Clone)]
pub struct CommandDispatch {
    handlers: HashMap<EventTag, Arc<dyn CommandHandler>>,
}

impl CommandDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `tag`, replacing any earlier one.
    pub fn register(&mut self, tag: EventTag, handler: Arc<dyn CommandHandler>) {
        if self.handlers.insert(tag, handler).is_some() {
            debug!(%tag, "command handler replaced");
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<H>(mut self, tag: EventTag, handler: H) -> Self
    where
        H: CommandHandler + 'static,
    {
        self.register(tag, Arc::new(handler));
        self
    }

    pub fn contains(&self, tag: EventTag) -> bool {
        self.handlers.contains_key(&tag)
    }

    /// Registered tags, in no particular order.
    pub fn tags(&self) -> impl Iterator<Item = EventTag> + '_ {
        self.handlers.keys().copied()
    }

    /// Route a parsed command to its handler.
    ///
    /// # Errors
    ///
    /// [`PilotError::NoHandler`] when no handler is registered for the tag,
    /// otherwise whatever the handler returns.
    pub fn dispatch(&self, event: Event) -> Result<(), PilotError> {
        let handler = self
            .handlers
            .get(&event.tag)
            .ok_or(PilotError::NoHandler(event.tag))?;
        handler.handle(event.payload)
    }

    /// Parse a raw text frame and dispatch it.  Returns the tag it was routed
    /// to.
    pub fn dispatch_frame(&self, text: &str) -> Result<EventTag, PilotError> {
        let event = Event::from_frame(text)?;
        let tag = event.tag;
        self.dispatch(event)?;
        Ok(tag)
    }
}

impl fmt::Debug for CommandDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&str> = self.handlers.keys().map(|t| t.as_str()).collect();
        tags.sort_unstable();
        f.debug_struct("CommandDispatch").field("tags", &tags).finish()
    }
}
