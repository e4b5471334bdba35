//! `pilot-cockpit` – The UI-facing network surface
//!
//! Two independent listeners:
//!
//! 1. **WebSocket** ([`CockpitServer`], default port `8000`): one duplex
//!    connection per UI client.  Outbound frames come from the Event Queue,
//!    inbound frames are commands routed through the Command Dispatch Table.
//!    Both directions use the `{"type": "<tag>", "<tag>": payload}` envelope.
//!
//! 2. **Static HTTP** ([`StaticServer`], default port `8002`): serves the
//!    compiled UI bundle from disk.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pilot_cockpit::{CockpitServer, StaticServer};
//! use pilot_middleware::{CommandDispatch, EventQueue, Refresh};
//!
//! struct Nothing;
//! impl Refresh for Nothing {
//!     fn refresh_all(&self) {}
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let (_tx, rx) = EventQueue::new().split();
//!     tokio::spawn(StaticServer::new("/usr/share/pilot-drive/web").run());
//!     CockpitServer::new(rx, CommandDispatch::new(), Arc::new(Nothing))
//!         .run()
//!         .await
//!         .expect("cockpit server failed");
//! }
//! ```

pub mod server;
pub mod static_files;

pub use server::{CockpitServer, DEFAULT_POLL_INTERVAL, DEFAULT_PORT};
pub use static_files::{DEFAULT_STATIC_PORT, StaticServer};
