//! Updater Service: checks the release index and installs new versions.
//!
//! The UI drives it with `"check"` and `"update"`.  After an install an
//! update record is left on disk; on the next start the service reports
//! whether the running version matches it.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use pilot_types::{EventTag, PilotError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::service::{Service, ServiceContext, Tick};
use crate::settings::UpdateSettings;
use crate::shell;

pub const UPDATE_RECORD_PATH: &str = "/tmp/pd_update.json";
const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateCommand {
    Check,
    Update,
}

/// Written before a restart so the next start can confirm the install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRecord {
    pub old_version: String,
    pub new_version: String,
}

/// Fetches the release index document.
pub trait ReleaseSource: Send {
    fn fetch(&mut self, url: &str) -> Result<Value, PilotError>;
}

/// [`ReleaseSource`] over HTTP.  The blocking client is built on first use
/// so it lives on the worker thread that drives the service.
#[derive(Default)]
pub struct HttpReleaseSource {
    client: Option<reqwest::blocking::Client>,
}

impl ReleaseSource for HttpReleaseSource {
    fn fetch(&mut self, url: &str) -> Result<Value, PilotError> {
        let client = match self.client.take() {
            Some(client) => client,
            None => reqwest::blocking::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .map_err(|e| PilotError::Update(format!("http client: {e}")))?,
        };
        debug!(url, "fetching release index");
        let result = client
            .get(url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| PilotError::Update(format!("network error getting update info: {e}")))
            .and_then(|resp| {
                resp.json::<Value>()
                    .map_err(|e| PilotError::Update(format!("error reading release page: {e}")))
            });
        self.client = Some(client);
        result
    }
}

/// `"1.4.0"` → `[1, 4, 0]`.  Pre-releases and other non-numeric versions
/// yield `None`.
pub fn semver_key(version: &str) -> Option<Vec<u64>> {
    version.split('.').map(|part| part.parse().ok()).collect()
}

/// Highest numeric version among the keys of `releases`.
pub fn latest_version(index: &Value) -> Result<String, PilotError> {
    let releases = index
        .get("releases")
        .and_then(Value::as_object)
        .ok_or_else(|| PilotError::Update("pulling releases failed".to_string()))?;
    releases
        .keys()
        .filter_map(|v| semver_key(v).map(|key| (key, v)))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, v)| v.clone())
        .ok_or_else(|| PilotError::Update("no releases published".to_string()))
}

pub struct UpdaterService {
    ctx: ServiceContext,
    settings: UpdateSettings,
    current_version: String,
    record_path: PathBuf,
    source: Box<dyn ReleaseSource>,
    status: Option<Value>,
    record_checked: bool,
}

impl UpdaterService {
    pub fn new(
        ctx: ServiceContext,
        settings: UpdateSettings,
        current_version: impl Into<String>,
        source: Box<dyn ReleaseSource>,
    ) -> Self {
        Self {
            ctx,
            settings,
            current_version: current_version.into(),
            record_path: PathBuf::from(UPDATE_RECORD_PATH),
            source,
            status: None,
            record_checked: false,
        }
    }

    pub fn with_record_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.record_path = path.into();
        self
    }

    fn emit(&mut self, status: Value) {
        self.ctx.push_to_queue(&status);
        self.status = Some(status);
    }

    fn emit_error(&mut self, message: impl Into<String>) {
        self.emit(json!({ "error": message.into() }));
    }

    fn check(&mut self) {
        let latest = match self.source.fetch(&self.settings.project_url).and_then(|index| latest_version(&index)) {
            Ok(latest) => latest,
            Err(e) => {
                warn!(error = %e, "update check failed");
                let message = match e {
                    PilotError::Update(message) => message,
                    other => other.to_string(),
                };
                self.emit_error(message);
                return;
            }
        };

        let (Some(remote), Some(local)) = (semver_key(&latest), semver_key(&self.current_version)) else {
            self.emit_error(format!("cannot compare \"{latest}\" with \"{}\"", self.current_version));
            return;
        };
        if remote == local {
            self.emit_error(format!("current version \"{}\" is the latest", self.current_version));
        } else if remote < local {
            self.emit_error(format!(
                "current version \"{}\" is larger than remote version \"{latest}\"",
                self.current_version
            ));
        } else {
            info!(version = %latest, "update available");
            self.emit(json!({"update": {"version": latest, "completed": false}}));
        }
    }

    fn update(&mut self) {
        let latest = match self.source.fetch(&self.settings.project_url).and_then(|index| latest_version(&index)) {
            Ok(latest) => latest,
            Err(e) => {
                warn!(error = %e, "update aborted");
                self.emit_error(e.to_string());
                return;
            }
        };

        info!(version = %latest, "attempting to update");
        let command_line = self.settings.install_command.replace("{version}", &latest);
        let Some((program, args)) = shell::split_command_line(&command_line) else {
            self.emit_error("no install command configured");
            return;
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match shell::run("updater", &program, &args) {
            Ok(out) if out.success => {}
            Ok(out) => {
                error!(stderr = %out.stderr.trim(), "install command failed");
                self.emit_error("an error occurred trying to update PILOT Drive");
                return;
            }
            Err(e) => {
                error!(error = %e, "install command could not run");
                self.emit_error("an error occurred trying to update PILOT Drive");
                return;
            }
        }

        let record = UpdateRecord {
            old_version: self.current_version.clone(),
            new_version: latest.clone(),
        };
        if let Err(e) = serde_json::to_string(&record)
            .map_err(|e| PilotError::Io(e.to_string()))
            .and_then(|text| fs::write(&self.record_path, text).map_err(PilotError::from))
        {
            error!(error = %e, "failed to write the update record");
        }
        self.emit(json!({"update": {"version": latest, "completed": false, "restartRequired": true}}));
    }

    /// Report an update performed before the last restart, once.
    fn check_record(&mut self) {
        if !self.record_path.exists() {
            return;
        }
        let record = fs::read_to_string(&self.record_path)
            .map_err(PilotError::from)
            .and_then(|text| {
                serde_json::from_str::<UpdateRecord>(&text).map_err(|e| PilotError::Update(e.to_string()))
            });
        match record {
            Ok(record) if record.new_version == self.current_version => {
                info!(from = %record.old_version, to = %record.new_version, "update completed");
                self.emit(json!({"update": {"version": record.new_version, "completed": true}}));
            }
            Ok(record) => warn!(
                current = %self.current_version,
                recorded = %record.new_version,
                "update record does not match the running version, possible failed update"
            ),
            Err(e) => error!(error = %e, "failed to read the update record"),
        }
        if let Err(e) = fs::remove_file(&self.record_path) {
            warn!(error = %e, "failed to remove the update record");
        }
    }
}

impl Service for UpdaterService {
    fn tag(&self) -> EventTag {
        self.ctx.tag()
    }

    fn tick(&mut self) -> Result<Tick, PilotError> {
        if !self.record_checked {
            self.record_checked = true;
            self.check_record();
        }
        Ok(Tick::Idle)
    }

    fn refresh(&mut self) {
        if let Some(status) = &self.status {
            self.ctx.push_to_queue(status);
        }
    }

    fn accepts_commands(&self) -> bool {
        true
    }

    fn handle_command(&mut self, payload: Value) -> Result<(), PilotError> {
        let command: UpdateCommand = serde_json::from_value(payload.clone())
            .map_err(|_| PilotError::InvalidAttribute(format!("unrecognized update command {payload}")))?;
        match command {
            UpdateCommand::Check => self.check(),
            UpdateCommand::Update => self.update(),
        }
        Ok(())
    }
}
