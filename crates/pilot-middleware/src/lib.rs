//! `pilot-middleware` – The Event Core
//!
//! Moves state changes from Services to the UI connection and commands from
//! the UI connection back to Services, without caring about their meaning.
//!
//! # Modules
//!
//! - [`queue`] – the unbounded, ordered, multi-producer/single-consumer
//!   Event Queue with its "has pending data" flag.
//! - [`dispatch`] – the Command Dispatch Table routing inbound command frames
//!   to the owning Service by [`EventTag`][pilot_types::EventTag], and the
//!   [`Refresh`][dispatch::Refresh] hook fired on every new UI connection.

pub mod dispatch;
pub mod queue;

pub use dispatch::{CommandDispatch, CommandHandler, Refresh};
pub use queue::{EventQueue, EventReceiver, EventSender};
