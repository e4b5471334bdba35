//! Compiled-in settings written on first start and used whenever the
//! settings file cannot be read.

use serde_json::{Map, Value, json};

/// Key of the UI settings section inside `settings.json`.
pub const WEB_SETTINGS_ATTRIBUTE: &str = "webSettings";

/// Key the UI expects next to its settings but which is never persisted.
pub const VERSION_ATTRIBUTE: &str = "version";

pub const DEFAULT_SETTINGS_PATH: &str = "/etc/pilot-drive/config/settings.json";
pub const DEFAULT_LOG_PATH: &str = "/etc/pilot-drive/logging/pilot_drive.log";
pub const LOG_FILE_NAME: &str = "pilot_drive.log";

pub fn web_settings() -> Value {
    json!({
        "tfHourTime": false,
        "metricUnits": false,
        "selectedTheme": "sherbet",
        "themes": [
            {
                "name": "dark",
                "accent": [131, 52, 45],
                "primary": [28, 30, 33],
                "secondary": [215, 208, 200]
            },
            {
                "name": "light",
                "accent": [221, 113, 98],
                "primary": [236, 241, 250],
                "secondary": [112, 121, 137]
            },
            {
                "name": "sherbet",
                "accent": [182, 215, 168],
                "primary": [234, 153, 153],
                "secondary": [249, 203, 156]
            }
        ]
    })
}

pub fn vehicle_stats() -> Value {
    json!([
        {"name": "Speed", "command": "SPEED", "interval": 0.5, "unit": "MPH"},
        {"name": "RPM", "command": "RPM", "interval": 0.5, "unit": "RPMs"},
        {"name": "Fuel Level", "command": "FUEL_LEVEL", "interval": 10, "unit": "percent"},
        {"name": "Voltage", "command": "CONTROL_MODULE_VOLTAGE", "interval": 3, "unit": "V"}
    ])
}

/// Every backend section, without `webSettings`.
pub fn backend_settings() -> Map<String, Value> {
    let value = json!({
        "updates": {
            "projectUrl": "https://pypi.org/pypi/pilot-drive/json",
            "downloadPath": "/tmp/",
            "installCommand": "pip install --upgrade pilot-drive=={version}"
        },
        "vehicle": {"enabled": false, "port": null, "stats": vehicle_stats()},
        "phone": {"enabled": false, "type": null},
        "logging": {
            "logLevel": 20,
            "logToFile": true,
            "logPath": DEFAULT_LOG_PATH
        },
        "camera": {"enabled": false, "buttonPin": 0, "previewCommand": "libcamera-hello -t 0"}
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// The complete default document.
pub fn settings() -> Map<String, Value> {
    let mut map = backend_settings();
    map.insert(WEB_SETTINGS_ATTRIBUTE.to_string(), web_settings());
    map
}
