//! Application config – reads/writes `/etc/pilot-drive/config/pilot-drive.toml`.
//!
//! This is the process-level wiring (ports, paths, which services run and
//! how they are isolated).  User-facing preferences live in `settings.json`
//! and are owned by the Settings Service.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pilot_kernel::{Isolation, ServiceSpec};
use pilot_types::{EventTag, PilotError};
use serde::{Deserialize, Serialize};
use tracing::error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pilot-drive/config/pilot-drive.toml";

/// One configured Service.  `isolation` defaults per tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<Isolation>,
}

impl ServiceEntry {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            isolation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// UI WebSocket port.
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// Static UI HTTP port.
    #[serde(default = "default_static_port")]
    pub static_port: u16,

    /// Directory holding the compiled UI.
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,

    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,

    /// Producer sleep when the Event Queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long workers get to stop before they are killed or abandoned.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_services")]
    pub services: Vec<ServiceEntry>,
}

fn default_ws_port() -> u16 {
    pilot_cockpit::DEFAULT_PORT
}
fn default_static_port() -> u16 {
    pilot_cockpit::DEFAULT_STATIC_PORT
}
fn default_static_dir() -> PathBuf {
    PathBuf::from("/usr/share/pilot-drive/web")
}
fn default_settings_path() -> PathBuf {
    PathBuf::from(pilot_services::settings::defaults::DEFAULT_SETTINGS_PATH)
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_shutdown_grace_ms() -> u64 {
    3000
}
fn default_services() -> Vec<ServiceEntry> {
    ["settings", "media", "bluetooth", "vehicle", "phone", "camera", "updater"]
        .into_iter()
        .map(ServiceEntry::named)
        .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ws_port: default_ws_port(),
            static_port: default_static_port(),
            static_dir: default_static_dir(),
            settings_path: default_settings_path(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            services: default_services(),
        }
    }
}

impl AppConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// The fleet to launch.  Unknown names are logged as creation failures
    /// and skipped.
    pub fn service_specs(&self) -> Vec<ServiceSpec> {
        self.services
            .iter()
            .filter_map(|entry| match entry.name.parse::<EventTag>() {
                Ok(tag) => Some(ServiceSpec::new(
                    tag,
                    entry.isolation.unwrap_or_else(|| Isolation::default_for(tag)),
                )),
                Err(e) => {
                    let e = PilotError::FailedToCreateService {
                        service: entry.name.clone(),
                        reason: e.to_string(),
                    };
                    error!(error = %e, "skipping configured service");
                    None
                }
            })
            .collect()
    }
}

/// `explicit`, else the built-in default path.  `--config` and
/// `PILOT_CONFIG` both arrive here through the CLI parser.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), Path::to_path_buf)
}

/// Load the config at `path`; a missing file yields defaults.  Environment
/// overrides are applied either way.
pub fn load_from(path: &Path) -> Result<AppConfig, PilotError> {
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(path)
            .map_err(|e| PilotError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| PilotError::Config(format!("failed to parse {}: {e}", path.display())))?
    } else {
        AppConfig::default()
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Apply `PILOT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PILOT_WS_PORT` | `ws_port` |
/// | `PILOT_STATIC_PORT` | `static_port` |
/// | `PILOT_STATIC_DIR` | `static_dir` |
/// | `PILOT_SETTINGS_PATH` | `settings_path` |
pub fn apply_env_overrides(cfg: &mut AppConfig) {
    if let Ok(v) = std::env::var("PILOT_WS_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.ws_port = port;
    }
    if let Ok(v) = std::env::var("PILOT_STATIC_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.static_port = port;
    }
    if let Ok(v) = std::env::var("PILOT_STATIC_DIR")
        && !v.is_empty()
    {
        cfg.static_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("PILOT_SETTINGS_PATH")
        && !v.is_empty()
    {
        cfg.settings_path = PathBuf::from(v);
    }
}

/// Write the config, creating the parent directory.
pub fn save_to(cfg: &AppConfig, path: &Path) -> Result<(), PilotError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| PilotError::Config(format!("failed to create {}: {e}", parent.display())))?;
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| PilotError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw).map_err(|e| PilotError::Config(format!("failed to write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.ws_port, 8000);
        assert_eq!(cfg.static_port, 8002);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(50));
        assert_eq!(cfg.shutdown_grace(), Duration::from_secs(3));
        assert_eq!(cfg.services.len(), 7);
    }

    #[test]
    fn roundtrip_through_disk() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config").join("pilot-drive.toml");
        let mut cfg = AppConfig::default();
        cfg.poll_interval_ms = 75;
        cfg.services = vec![ServiceEntry {
            name: "media".into(),
            isolation: Some(Isolation::Process),
        }];
        save_to(&cfg, &path).expect("save");
        let loaded = load_from(&path).expect("load");
        assert_eq!(loaded.poll_interval_ms, 75);
        assert_eq!(loaded.services[0].isolation, Some(Isolation::Process));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = load_from(&dir.path().join("absent.toml")).expect("no error");
        assert_eq!(cfg.services, default_services());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("pilot-drive.toml");
        fs::write(&path, "static_dir = \"/srv/ui\"\n[[services]]\nname = \"settings\"\n").unwrap();
        let cfg = load_from(&path).expect("load");
        assert_eq!(cfg.static_dir, PathBuf::from("/srv/ui"));
        assert_eq!(cfg.shutdown_grace_ms, 3000);
        assert_eq!(cfg.services, vec![ServiceEntry::named("settings")]);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("pilot-drive.toml");
        fs::write(&path, "ws_port = \"eight thousand\"").unwrap();
        assert!(matches!(load_from(&path), Err(PilotError::Config(_))));
    }

    #[test]
    fn service_specs_apply_default_isolation_and_skip_unknown() {
        let cfg = AppConfig {
            services: vec![
                ServiceEntry::named("camera"),
                ServiceEntry::named("warp-drive"),
                ServiceEntry {
                    name: "vehicle".into(),
                    isolation: Some(Isolation::Thread),
                },
            ],
            ..AppConfig::default()
        };
        assert_eq!(
            cfg.service_specs(),
            vec![
                ServiceSpec::new(EventTag::Camera, Isolation::Process),
                ServiceSpec::new(EventTag::Vehicle, Isolation::Thread),
            ]
        );
    }

    #[test]
    fn config_path_prefers_explicit() {
        assert_eq!(config_path(None), PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(config_path(Some(Path::new("/tmp/x.toml"))), PathBuf::from("/tmp/x.toml"));
    }

    #[test]
    fn apply_env_overrides_changes_ports_and_paths() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe {
            std::env::set_var("PILOT_STATIC_PORT", "9100");
            std::env::set_var("PILOT_SETTINGS_PATH", "/tmp/settings.json");
        }
        let mut cfg = AppConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.static_port, 9100);
        assert_eq!(cfg.settings_path, PathBuf::from("/tmp/settings.json"));
        unsafe {
            std::env::remove_var("PILOT_STATIC_PORT");
            std::env::remove_var("PILOT_SETTINGS_PATH");
        }
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_port() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("PILOT_WS_PORT", "not-a-port") };
        let mut cfg = AppConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.ws_port, 8000);
        unsafe { std::env::remove_var("PILOT_WS_PORT") };
    }
}
