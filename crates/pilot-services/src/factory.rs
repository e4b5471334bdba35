//! Builds Service variants from an [`EventTag`] and the settings document.

use pilot_types::{EventTag, PilotError};
use tracing::debug;

use crate::bluetooth::{BluetoothService, Bluetoothctl};
use crate::camera::{CameraService, CommandPreview, SysfsGpio};
use crate::media::{MediaService, Playerctl};
use crate::phone::PhoneService;
use crate::service::{Service, ServiceContext};
use crate::settings::{SettingsService, SettingsStore};
use crate::updater::{HttpReleaseSource, UpdaterService};
use crate::vehicle::{SerialConnector, VehicleService};

/// Constructs Services for the supervisor and for process workers.
pub trait ServiceFactory: Send + Sync {
    /// # Errors
    ///
    /// [`PilotError::FailedToCreateService`] when `tag` names no Service or
    /// its dependencies are unavailable.
    fn build(&self, tag: EventTag, ctx: ServiceContext) -> Result<Box<dyn Service>, PilotError>;

    /// `false` when the settings switch the service off entirely.
    fn enabled(&self, tag: EventTag) -> bool {
        let _ = tag;
        true
    }
}

/// Production factory wiring each variant to its real backend.
#[derive(Debug, Clone)]
pub struct DefaultServiceFactory {
    settings: SettingsStore,
}

impl DefaultServiceFactory {
    pub fn new(settings: SettingsStore) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    fn construct(&self, tag: EventTag, ctx: ServiceContext) -> Result<Box<dyn Service>, PilotError> {
        let service: Box<dyn Service> = match tag {
            EventTag::Settings => Box::new(SettingsService::new(ctx, self.settings.clone())),
            EventTag::Media => Box::new(MediaService::new(ctx, Box::new(Playerctl))),
            EventTag::Bluetooth => Box::new(BluetoothService::new(ctx, Box::new(Bluetoothctl::new()?))),
            EventTag::Vehicle => Box::new(VehicleService::new(
                ctx,
                self.settings.vehicle()?,
                Box::new(SerialConnector),
            )?),
            EventTag::Phone => Box::new(PhoneService::from_settings(ctx, &self.settings.phone()?)?),
            EventTag::Camera => {
                let camera = self.settings.camera()?;
                let button = SysfsGpio::open(camera.button_pin)?;
                let preview = CommandPreview::new(&camera.preview_command)?;
                Box::new(CameraService::new(ctx, Box::new(button), Box::new(preview)))
            }
            EventTag::Updater => Box::new(UpdaterService::new(
                ctx,
                self.settings.updates()?,
                crate::VERSION,
                Box::new(HttpReleaseSource::default()),
            )),
            EventTag::System | EventTag::Web => {
                return Err(PilotError::InvalidAttribute(format!("{tag} is not a service")));
            }
        };
        Ok(service)
    }
}

impl ServiceFactory for DefaultServiceFactory {
    fn build(&self, tag: EventTag, ctx: ServiceContext) -> Result<Box<dyn Service>, PilotError> {
        debug!(service = %tag, "constructing service");
        self.construct(tag, ctx).map_err(|e| match e {
            e @ PilotError::FailedToCreateService { .. } => e,
            other => PilotError::FailedToCreateService {
                service: tag.to_string(),
                reason: other.to_string(),
            },
        })
    }

    fn enabled(&self, tag: EventTag) -> bool {
        match tag {
            EventTag::Camera => self.settings.camera().map(|c| c.enabled).unwrap_or(false),
            _ => true,
        }
    }
}
