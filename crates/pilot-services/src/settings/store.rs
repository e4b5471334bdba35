//! File-backed settings accessor.
//!
//! `settings.json` holds the backend sections (`updates`, `vehicle`, `phone`,
//! `logging`, `camera`) next to the UI's own `webSettings` object.
//!
//! | File state | Result |
//! |---|---|
//! | missing or empty | defaults, written back to disk |
//! | valid JSON object | loaded as-is |
//! | anything else | defaults in memory, **write-locked** until fixed out of band |

use std::fs;
use std::path::{Path, PathBuf};

use pilot_types::PilotError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::defaults::{self, WEB_SETTINGS_ATTRIBUTE, VERSION_ATTRIBUTE};

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    settings: Map<String, Value>,
    locked: bool,
}

impl SettingsStore {
    /// Load the settings document at `path`, creating it when absent.
    ///
    /// # Errors
    ///
    /// [`PilotError::SettingsRead`] when the file exists but cannot be read,
    /// or when the defaults cannot be written for a new file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PilotError> {
        let path = path.into();
        if !path.exists() {
            info!(path = %path.display(), "no settings file, writing defaults");
            return Self::initialise(path);
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            PilotError::SettingsRead(format!("failed to read {}: {e}", path.display()))
        })?;
        if content.trim().is_empty() {
            info!(path = %path.display(), "settings file is empty, writing defaults");
            return Self::initialise(path);
        }

        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(settings)) => Ok(Self {
                path,
                settings,
                locked: false,
            }),
            Ok(other) => {
                error!(path = %path.display(), "settings file is not a JSON object ({other}); using defaults, changes will not be written");
                Ok(Self::locked_defaults(path))
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to parse settings file; using defaults, changes will not be written");
                Ok(Self::locked_defaults(path))
            }
        }
    }

    /// Compiled-in defaults bound to `path` without touching the disk.
    pub fn with_defaults(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            settings: defaults::settings(),
            locked: false,
        }
    }

    fn initialise(path: PathBuf) -> Result<Self, PilotError> {
        let store = Self::with_defaults(path);
        store.write().map_err(|e| PilotError::SettingsRead(e.to_string()))?;
        Ok(store)
    }

    fn locked_defaults(path: PathBuf) -> Self {
        Self {
            locked: true,
            ..Self::with_defaults(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `true` after a corrupt file was found; writes are skipped.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    fn validate(&self, attribute: &str, web: bool) -> Result<(), PilotError> {
        let valid = if web {
            self.web_section()
                .is_some_and(|web| web.contains_key(attribute))
        } else {
            attribute != WEB_SETTINGS_ATTRIBUTE && self.settings.contains_key(attribute)
        };
        if valid {
            Ok(())
        } else {
            Err(PilotError::InvalidAttribute(attribute.to_string()))
        }
    }

    fn web_section(&self) -> Option<&Map<String, Value>> {
        self.settings
            .get(WEB_SETTINGS_ATTRIBUTE)
            .and_then(Value::as_object)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Value of a backend section.
    pub fn get_setting(&self, attribute: &str) -> Result<&Value, PilotError> {
        self.validate(attribute, false)?;
        self.settings
            .get(attribute)
            .ok_or_else(|| PilotError::InvalidAttribute(attribute.to_string()))
    }

    /// Replace a backend section.  Only existing keys are accepted.  The
    /// change lives in memory until [`write`](Self::write).
    pub fn set_setting(&mut self, attribute: &str, value: Value) -> Result<(), PilotError> {
        self.validate(attribute, false)?;
        self.settings.insert(attribute.to_string(), value);
        Ok(())
    }

    pub fn get_web_setting(&self, attribute: &str) -> Result<&Value, PilotError> {
        self.validate(attribute, true)?;
        self.web_section()
            .and_then(|web| web.get(attribute))
            .ok_or_else(|| PilotError::InvalidAttribute(attribute.to_string()))
    }

    pub fn set_web_setting(&mut self, attribute: &str, value: Value) -> Result<(), PilotError> {
        self.validate(attribute, true)?;
        match self
            .settings
            .get_mut(WEB_SETTINGS_ATTRIBUTE)
            .and_then(Value::as_object_mut)
        {
            Some(web) => {
                web.insert(attribute.to_string(), value);
                Ok(())
            }
            None => Err(PilotError::InvalidAttribute(attribute.to_string())),
        }
    }

    /// UI settings as the UI expects them: `webSettings` plus `version`.
    pub fn web_settings(&self) -> Value {
        let mut out = Map::new();
        out.insert(
            VERSION_ATTRIBUTE.to_string(),
            Value::String(crate::VERSION.to_string()),
        );
        if let Some(web) = self.web_section() {
            out.extend(web.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Value::Object(out)
    }

    /// Apply a UI settings object.  Every key except `version` is validated
    /// and set individually; invalid keys are logged and skipped.  The file
    /// is written once when at least one key changed.
    ///
    /// Returns whether anything changed.
    pub fn set_web_settings(&mut self, web_settings: &Value) -> Result<bool, PilotError> {
        let Some(entries) = web_settings.as_object() else {
            return Err(PilotError::InvalidAttribute(format!(
                "web settings must be an object, got {web_settings}"
            )));
        };

        let mut changed = false;
        for (key, value) in entries {
            if key == VERSION_ATTRIBUTE {
                continue;
            }
            match self.set_web_setting(key, value.clone()) {
                Ok(()) => changed = true,
                Err(e) => error!(error = %e, "invalid web setting used"),
            }
        }
        if changed {
            self.write()?;
        }
        Ok(changed)
    }

    /// Typed view of a backend section.  A section missing from an older
    /// file falls back to its compiled-in default.
    pub fn section<T: DeserializeOwned>(&self, attribute: &str) -> Result<T, PilotError> {
        let value = match self.settings.get(attribute) {
            Some(value) => value.clone(),
            None => {
                debug!(attribute, "section missing from settings file, using default");
                defaults::backend_settings()
                    .remove(attribute)
                    .ok_or_else(|| PilotError::InvalidAttribute(attribute.to_string()))?
            }
        };
        serde_json::from_value(value)
            .map_err(|e| PilotError::SettingsRead(format!("section {attribute:?}: {e}")))
    }

    pub fn updates(&self) -> Result<UpdateSettings, PilotError> {
        self.section("updates")
    }

    pub fn vehicle(&self) -> Result<VehicleSettings, PilotError> {
        self.section("vehicle")
    }

    pub fn phone(&self) -> Result<PhoneSettings, PilotError> {
        self.section("phone")
    }

    pub fn logging(&self) -> Result<LoggingSettings, PilotError> {
        self.section("logging")
    }

    pub fn camera(&self) -> Result<CameraSettings, PilotError> {
        self.section("camera")
    }

    /// The whole document, without validation.
    pub fn raw(&self) -> Value {
        Value::Object(self.settings.clone())
    }

    /// Persist the document.  Skipped (with a warning) while write-locked.
    pub fn write(&self) -> Result<(), PilotError> {
        if self.locked {
            warn!(path = %self.path.display(), "settings are write-locked, not saving");
            return Ok(());
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        Value::Object(self.settings.clone())
            .serialize(&mut ser)
            .map_err(|e| PilotError::Io(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "settings written");
        Ok(())
    }
}

/// Read the settings file as-is.  No defaults, no validation.
///
/// # Errors
///
/// [`PilotError::SettingsRead`] when the file is missing, unreadable or not
/// JSON.
pub fn get_raw_settings(path: &Path) -> Result<Value, PilotError> {
    if !path.exists() {
        return Err(PilotError::SettingsRead(format!(
            "failed to find settings file at {}",
            path.display()
        )));
    }
    let content = fs::read_to_string(path)
        .map_err(|e| PilotError::SettingsRead(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| PilotError::SettingsRead(format!("failed to read settings: {e}")))
}

// ---------------------------------------------------------------------------
// Typed sections
// ---------------------------------------------------------------------------

/// Only a literal JSON `true` enables a feature.
fn strict_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(matches!(Value::deserialize(deserializer)?, Value::Bool(true)))
}

fn default_install_command() -> String {
    "pip install --upgrade pilot-drive=={version}".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettings {
    pub project_url: String,
    #[serde(default)]
    pub download_path: String,
    #[serde(default = "default_install_command")]
    pub install_command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleStat {
    pub name: String,
    pub command: String,
    /// Seconds between queries.
    pub interval: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSettings {
    #[serde(default, deserialize_with = "strict_bool")]
    pub enabled: bool,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub stats: Vec<VehicleStat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneSettings {
    #[serde(default, deserialize_with = "strict_bool")]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

fn default_log_level() -> u8 {
    20
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> String {
    defaults::DEFAULT_LOG_PATH.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSettings {
    /// Numeric level: 10 debug, 20 info, 30 warning, 40 error, 50 critical.
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    #[serde(default = "default_true")]
    pub log_to_file: bool,
    #[serde(default = "default_log_path")]
    pub log_path: String,
}

impl LoggingSettings {
    /// `logPath`, with `pilot_drive.log` appended when it names a directory.
    pub fn log_file(&self) -> PathBuf {
        if self.log_path.ends_with('/') {
            Path::new(&self.log_path).join(defaults::LOG_FILE_NAME)
        } else {
            PathBuf::from(&self.log_path)
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_to_file: true,
            log_path: default_log_path(),
        }
    }
}

fn default_preview_command() -> String {
    "libcamera-hello -t 0".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraSettings {
    #[serde(default, deserialize_with = "strict_bool")]
    pub enabled: bool,
    #[serde(default)]
    pub button_pin: u32,
    #[serde(default = "default_preview_command")]
    pub preview_command: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn settings_path(dir: &TempDir) -> PathBuf {
        dir.path().join("config").join("settings.json")
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = settings_path(&dir);
        let store = SettingsStore::open(&path).unwrap();

        assert!(path.exists());
        assert!(!store.is_locked());
        let on_disk = get_raw_settings(&path).unwrap();
        assert_eq!(on_disk["webSettings"]["selectedTheme"], "sherbet");
        assert_eq!(on_disk["logging"]["logLevel"], 20);
    }

    #[test]
    fn empty_file_is_replaced_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "").unwrap();

        let store = SettingsStore::open(&path).unwrap();
        assert!(!store.is_locked());
        assert!(get_raw_settings(&path).unwrap().get("webSettings").is_some());
    }

    #[test]
    fn corrupt_file_locks_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let mut store = SettingsStore::open(&path).unwrap();
        assert!(store.is_locked());
        assert_eq!(store.get_web_setting("selectedTheme").unwrap(), "sherbet");

        let changed = store
            .set_web_settings(&json!({"selectedTheme": "dark"}))
            .unwrap();
        assert!(changed);
        assert_eq!(store.get_web_setting("selectedTheme").unwrap(), "dark");
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn web_settings_include_version() {
        let store = SettingsStore::with_defaults("/nonexistent/settings.json");
        let web = store.web_settings();
        assert_eq!(web["version"], crate::VERSION);
        assert_eq!(web["tfHourTime"], false);
    }

    #[test]
    fn set_web_settings_skips_version_and_invalid_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let mut store = SettingsStore::open(&path).unwrap();

        let changed = store
            .set_web_settings(&json!({
                "version": "9.9.9",
                "tfHourTime": true,
                "noSuchKey": 1
            }))
            .unwrap();
        assert!(changed);

        let on_disk = get_raw_settings(&path).unwrap();
        assert_eq!(on_disk["webSettings"]["tfHourTime"], true);
        assert!(on_disk["webSettings"].get("version").is_none());
        assert!(on_disk["webSettings"].get("noSuchKey").is_none());
    }

    #[test]
    fn set_web_settings_with_only_version_writes_nothing() {
        let store_dir = TempDir::new().unwrap();
        let mut store = SettingsStore::open(store_dir.path().join("s.json")).unwrap();
        assert!(!store.set_web_settings(&json!({"version": "1.0.0"})).unwrap());
        assert!(store.set_web_settings(&json!("dark")).is_err());
    }

    #[test]
    fn backend_attribute_validation() {
        let mut store = SettingsStore::with_defaults("/nonexistent/settings.json");
        assert!(store.get_setting("phone").is_ok());
        assert_eq!(
            store.get_setting("webSettings"),
            Err(PilotError::InvalidAttribute("webSettings".to_string()))
        );
        assert!(store.set_setting("bogus", json!(1)).is_err());
        store
            .set_setting("phone", json!({"enabled": true, "type": "android"}))
            .unwrap();
        assert!(store.phone().unwrap().enabled);
        assert!(store.get_web_setting("phone").is_err());
    }

    #[test]
    fn enabled_flags_are_strict_booleans() {
        let mut store = SettingsStore::with_defaults("/nonexistent/settings.json");
        for loose in [json!("true"), json!(1), json!({}), Value::Null] {
            store
                .set_setting("phone", json!({"enabled": loose, "type": "android"}))
                .unwrap();
            assert!(!store.phone().unwrap().enabled);
        }
    }

    #[test]
    fn typed_sections_have_defaults() {
        let store = SettingsStore::with_defaults("/nonexistent/settings.json");
        let vehicle = store.vehicle().unwrap();
        assert!(!vehicle.enabled);
        assert_eq!(vehicle.port, None);
        assert_eq!(vehicle.stats.len(), 4);
        assert_eq!(vehicle.stats[0].command, "SPEED");

        let camera = store.camera().unwrap();
        assert_eq!(camera.button_pin, 0);
        assert_eq!(store.updates().unwrap().download_path, "/tmp/");
    }

    #[test]
    fn missing_section_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"webSettings": {"tfHourTime": true}}"#).unwrap();
        let store = SettingsStore::open(&path).unwrap();
        assert_eq!(store.logging().unwrap(), LoggingSettings::default());
    }

    #[test]
    fn log_path_directory_gets_file_name() {
        let logging = LoggingSettings {
            log_path: "/var/log/pilot/".to_string(),
            ..LoggingSettings::default()
        };
        assert_eq!(logging.log_file(), PathBuf::from("/var/log/pilot/pilot_drive.log"));
        assert_eq!(
            LoggingSettings::default().log_file(),
            PathBuf::from(defaults::DEFAULT_LOG_PATH)
        );
    }

    #[test]
    fn raw_settings_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.json");
        assert!(matches!(get_raw_settings(&path), Err(PilotError::SettingsRead(_))));
        fs::write(&path, "nope").unwrap();
        assert!(matches!(get_raw_settings(&path), Err(PilotError::SettingsRead(_))));
    }
}
