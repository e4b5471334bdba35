//! `pilot-services` – the Service contract and every integration behind it.
//!
//! - [`Service`] / [`ServiceContext`] / [`Tick`] – what a worker drives.
//! - [`ServiceFactory`] – builds a variant from its [`EventTag`](pilot_types::EventTag).
//! - [`settings`] – the file-backed settings accessor and Settings Service.
//! - One module per hardware or OS integration: [`media`], [`bluetooth`],
//!   [`vehicle`], [`phone`], [`camera`], [`updater`].
//!
//! Hardware is always reached through a small trait (`MediaPlayer`,
//! `BluetoothAdapter`, `ObdConnector`, `PhoneManager`, `ButtonInput`,
//! `ReleaseSource`) so the service logic runs against mocks in tests.

pub mod bluetooth;
pub mod camera;
pub mod factory;
pub mod media;
pub mod phone;
pub mod service;
pub mod settings;
pub mod shell;
pub mod updater;
pub mod vehicle;

pub use factory::{DefaultServiceFactory, ServiceFactory};
pub use service::{Service, ServiceContext, Tick};
pub use settings::SettingsStore;

/// Version reported to the UI and compared against releases.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
