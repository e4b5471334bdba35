//! Settings Service and the settings accessor it owns.

pub mod defaults;
mod store;

pub use store::{
    CameraSettings, LoggingSettings, PhoneSettings, SettingsStore, UpdateSettings, VehicleSettings,
    VehicleStat, get_raw_settings,
};

use pilot_types::{EventTag, PilotError};
use serde_json::Value;
use tracing::info;

use crate::service::{Service, ServiceContext, Tick};

/// Serves `webSettings` to the UI and applies the UI's changes.
pub struct SettingsService {
    ctx: ServiceContext,
    store: SettingsStore,
}

impl SettingsService {
    pub fn new(ctx: ServiceContext, store: SettingsStore) -> Self {
        info!(path = %store.path().display(), locked = store.is_locked(), "settings service ready");
        Self { ctx, store }
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }
}

impl Service for SettingsService {
    fn tag(&self) -> EventTag {
        self.ctx.tag()
    }

    fn tick(&mut self) -> Result<Tick, PilotError> {
        Ok(Tick::Idle)
    }

    fn refresh(&mut self) {
        self.ctx.push_to_queue(&self.store.web_settings());
    }

    fn accepts_commands(&self) -> bool {
        true
    }

    /// `set_web_settings`.
    fn handle_command(&mut self, payload: Value) -> Result<(), PilotError> {
        self.store.set_web_settings(&payload).map(|_| ())
    }
}
