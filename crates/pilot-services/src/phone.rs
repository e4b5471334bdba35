//! Phone Service: connection state and notifications of a tethered phone.
//!
//! Android is reached over ADB: `adb get-state` gives the link state and
//! `dumpsys notification --noredact` the live notification records.

use std::cmp::Reverse;

use pilot_types::{EventTag, PilotError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::service::{Service, ServiceContext, Tick};
use crate::settings::PhoneSettings;
use crate::shell;

const POLL_MS: u64 = 1000;
const COMPONENT: &str = "phone";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhoneKind {
    Android,
    Ios,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhoneState {
    Connected,
    Disconnected,
    /// ADB cannot access a locked device.
    Locked,
    /// The device has not trusted this host yet.
    Untrusted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub device: Option<String>,
    pub app_id: String,
    pub app_name: String,
    pub title: String,
    pub time: i64,
    pub body: Option<String>,
}

/// What the UI receives on the `phone` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhoneContainer {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: Option<PhoneKind>,
    pub state: PhoneState,
    pub notifications: Vec<Notification>,
}

/// Platform-specific access to the phone.
pub trait PhoneManager: Send {
    fn state(&mut self) -> PhoneState;
    fn notifications(&mut self) -> Result<Vec<Notification>, PilotError>;
}

/// Map the first line of `adb get-state` output.
pub fn parse_adb_state(output: &str) -> Option<PhoneState> {
    let line = output.lines().next().unwrap_or_default().trim();
    match line {
        "device" => Some(PhoneState::Connected),
        l if l.starts_with("error: no devices/emulators found") => Some(PhoneState::Disconnected),
        l if l.starts_with("error: insufficient permissions") => Some(PhoneState::Locked),
        l if l.starts_with("error: device unauthorized") => Some(PhoneState::Untrusted),
        _ => None,
    }
}

#[derive(Default)]
struct PartialNotification {
    id: Option<i64>,
    app_id: Option<String>,
    title: Option<String>,
    body: Option<String>,
    time: Option<i64>,
}

/// Extract the value after `prefix`: either `String (…)`/`SpannableString
/// (…)` contents or the first whitespace-delimited token.
fn field_value(rest: &str) -> Option<String> {
    if let Some(start) = rest.find("String (") {
        let inner = &rest[start + "String (".len()..];
        let end = inner.rfind(')')?;
        return Some(inner[..end].to_string());
    }
    rest.split_whitespace().next().map(str::to_string)
}

/// Match a line against an indentation-anchored `key=` prefix.
fn strip_field<'a>(line: &'a str, indent: usize, key: &str) -> Option<&'a str> {
    let rest = line.get(indent..)?;
    if !line[..indent].bytes().all(|b| b == b' ') {
        return None;
    }
    rest.strip_prefix(key)
}

/// Parse `dumpsys notification --noredact` into notifications.  Records
/// missing an id, package, title or time are skipped.
pub fn parse_dumpsys(dump: &str, device: Option<&str>) -> Vec<Notification> {
    dump.split("NotificationRecord")
        .skip(1)
        .filter_map(|record| {
            let mut n = PartialNotification::default();
            for line in record.lines() {
                if let Some(v) = strip_field(line, 6, "uid=") {
                    n.id = field_value(v).and_then(|s| s.parse().ok());
                } else if let Some(v) = strip_field(line, 6, "opPkg=") {
                    n.app_id = field_value(v);
                } else if let Some(v) = strip_field(line, 16, "android.title=") {
                    n.title = field_value(v);
                } else if let Some(v) = strip_field(line, 16, "android.text=") {
                    n.body = field_value(v);
                } else if let Some(v) = strip_field(line, 6, "mRankingTimeMs=") {
                    n.time = field_value(v).and_then(|s| s.parse().ok());
                }
            }
            let app_id = n.app_id?;
            Some(Notification {
                id: n.id?,
                device: device.map(str::to_string),
                app_name: app_id.clone(),
                app_id,
                title: n.title?,
                time: n.time?,
                body: n.body,
            })
        })
        .collect()
}

/// Device name from `dumpsys bluetooth_manager`.
pub fn parse_device_name(dump: &str) -> Option<String> {
    dump.lines()
        .find_map(|line| line.trim().strip_prefix("name: "))
        .map(|name| name.trim().to_string())
}

/// [`PhoneManager`] over the `adb` CLI.
#[derive(Debug)]
pub struct AdbManager;

impl AdbManager {
    /// # Errors
    ///
    /// [`PilotError::Hardware`] when `adb` is not installed.
    pub fn new() -> Result<Self, PilotError> {
        shell::run(COMPONENT, "adb", &["version"])?;
        Ok(Self)
    }
}

impl PhoneManager for AdbManager {
    fn state(&mut self) -> PhoneState {
        let output = match shell::run(COMPONENT, "adb", &["get-state"]) {
            Ok(out) => out.combined(),
            Err(e) => {
                error!(error = %e, "adb get-state failed");
                return PhoneState::Disconnected;
            }
        };
        parse_adb_state(&output).unwrap_or_else(|| {
            error!(output = %output.trim(), "failed to detect ADB state, falling back to disconnected");
            PhoneState::Disconnected
        })
    }

    fn notifications(&mut self) -> Result<Vec<Notification>, PilotError> {
        let dump = shell::run_checked(COMPONENT, "adb", &["shell", "dumpsys", "notification", "--noredact"])?;
        let device = shell::run_checked(COMPONENT, "adb", &["shell", "dumpsys", "bluetooth_manager"])
            .ok()
            .and_then(|out| parse_device_name(&out));
        if device.is_none() {
            debug!("failed to get device name");
        }
        Ok(parse_dumpsys(&dump, device.as_deref()))
    }
}

pub struct PhoneService {
    ctx: ServiceContext,
    kind: Option<PhoneKind>,
    manager: Option<Box<dyn PhoneManager>>,
    state: PhoneState,
    notifications: Vec<Notification>,
    announced: bool,
}

impl PhoneService {
    /// Resolve the configured phone type.  `enabled` must be a literal
    /// `true`; only Android is supported.
    pub fn kind_from_settings(settings: &PhoneSettings) -> Result<Option<PhoneKind>, PilotError> {
        if !settings.enabled {
            return Ok(None);
        }
        match settings.kind.as_deref() {
            Some("android") => Ok(Some(PhoneKind::Android)),
            Some("ios") => Err(PilotError::FailedToCreateService {
                service: COMPONENT.to_string(),
                reason: "iOS phones are not supported".to_string(),
            }),
            other => Err(PilotError::SettingsRead(format!("invalid phone type provided: {other:?}"))),
        }
    }

    /// Build the service from settings with the default manager.
    pub fn from_settings(ctx: ServiceContext, settings: &PhoneSettings) -> Result<Self, PilotError> {
        let kind = Self::kind_from_settings(settings)?;
        let manager: Option<Box<dyn PhoneManager>> = match kind {
            Some(PhoneKind::Android) => Some(Box::new(AdbManager::new()?)),
            _ => None,
        };
        Ok(Self::new(ctx, kind, manager))
    }

    /// `manager` is `None` for a disabled phone.
    pub fn new(ctx: ServiceContext, kind: Option<PhoneKind>, manager: Option<Box<dyn PhoneManager>>) -> Self {
        Self {
            ctx,
            kind,
            manager,
            state: PhoneState::Disconnected,
            notifications: Vec::new(),
            announced: false,
        }
    }

    fn container(&self) -> PhoneContainer {
        PhoneContainer {
            enabled: self.manager.is_some(),
            kind: self.kind,
            state: self.state,
            notifications: self.notifications.clone(),
        }
    }

    fn push_container(&self) {
        self.ctx.push_to_queue(&self.container());
    }
}

impl Service for PhoneService {
    fn tag(&self) -> EventTag {
        self.ctx.tag()
    }

    fn tick(&mut self) -> Result<Tick, PilotError> {
        let Some(manager) = self.manager.as_mut() else {
            self.push_container();
            return Ok(Tick::Idle);
        };

        let mut changed = !self.announced;
        self.announced = true;

        let state = manager.state();
        if state != self.state {
            info!(from = ?self.state, to = ?state, "phone state changed");
            self.state = state;
            if state == PhoneState::Disconnected {
                self.notifications.clear();
            }
            changed = true;
        }

        // A failed notification read keeps the previous list; the state
        // change is still published before the error goes up.
        let mut fault = None;
        if state == PhoneState::Connected {
            match manager.notifications() {
                Ok(mut latest) => {
                    latest.sort_by_key(|n| Reverse(n.time));
                    if latest != self.notifications {
                        self.notifications = latest;
                        changed = true;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "phone notifications unavailable, keeping previous list");
                    fault = Some(e);
                }
            }
        }

        if changed {
            self.push_container();
        }
        match fault {
            Some(e) => Err(e),
            None => Ok(Tick::millis(POLL_MS)),
        }
    }

    fn refresh(&mut self) {
        self.push_container();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_middleware::EventQueue;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    const DUMP: &str = "Current Notification List:
  NotificationRecord(0x0a1b: pkg=com.whatsapp user=UserHandle{0} id=1 tag=null)
      uid=10123 userId=0
      opPkg=com.whatsapp
      mRankingTimeMs=1700000000500
    extras={
                android.title=String (Alice)
                android.text=SpannableString (See you at 6)
    }
  NotificationRecord(0x0c2d: pkg=com.android.mms user=UserHandle{0} id=2 tag=null)
      uid=10077 userId=0
      opPkg=com.android.mms
      mRankingTimeMs=1700000009000
    extras={
                android.title=String (Bob)
    }
  NotificationRecord(0x0d3e: pkg=android user=UserHandle{0} id=3 tag=null)
      uid=1000 userId=0
      opPkg=android
";

    #[test]
    fn adb_states() {
        assert_eq!(parse_adb_state("device\n"), Some(PhoneState::Connected));
        assert_eq!(
            parse_adb_state("error: no devices/emulators found\n"),
            Some(PhoneState::Disconnected)
        );
        assert_eq!(
            parse_adb_state("error: insufficient permissions for device: user in plugdev group"),
            Some(PhoneState::Locked)
        );
        assert_eq!(
            parse_adb_state("error: device unauthorized.\nThis adb server's $ADB_VENDOR_KEYS is not set"),
            Some(PhoneState::Untrusted)
        );
        assert_eq!(parse_adb_state("bootloader"), None);
    }

    #[test]
    fn parses_notification_dump() {
        let notifs = parse_dumpsys(DUMP, Some("Pixel"));
        assert_eq!(notifs.len(), 2);
        assert_eq!(notifs[0].id, 10123);
        assert_eq!(notifs[0].app_id, "com.whatsapp");
        assert_eq!(notifs[0].title, "Alice");
        assert_eq!(notifs[0].body.as_deref(), Some("See you at 6"));
        assert_eq!(notifs[0].device.as_deref(), Some("Pixel"));
        assert_eq!(notifs[1].body, None);
        assert_eq!(notifs[1].time, 1_700_000_009_000);
    }

    #[test]
    fn misindented_fields_are_ignored() {
        let dump = "NotificationRecord(x)\n       uid=1\n      opPkg=a\n      mRankingTimeMs=1\n                android.title=t\n";
        assert!(parse_dumpsys(dump, None).is_empty());
    }

    #[test]
    fn device_name() {
        assert_eq!(
            parse_device_name("Bluetooth Status\n  enabled: true\n  name: Pixel 7\n"),
            Some("Pixel 7".to_string())
        );
    }

    #[test]
    fn phone_type_resolution() {
        let off = PhoneSettings { enabled: false, kind: Some("ios".into()) };
        assert_eq!(PhoneService::kind_from_settings(&off).unwrap(), None);

        let android = PhoneSettings { enabled: true, kind: Some("android".into()) };
        assert_eq!(
            PhoneService::kind_from_settings(&android).unwrap(),
            Some(PhoneKind::Android)
        );

        let ios = PhoneSettings { enabled: true, kind: Some("ios".into()) };
        assert!(matches!(
            PhoneService::kind_from_settings(&ios),
            Err(PilotError::FailedToCreateService { .. })
        ));

        let missing = PhoneSettings { enabled: true, kind: None };
        assert!(PhoneService::kind_from_settings(&missing).is_err());
    }

    #[derive(Clone)]
    struct MockManager {
        state: Arc<Mutex<PhoneState>>,
        notifications: Arc<Mutex<Vec<Notification>>>,
        fail_next: Arc<Mutex<bool>>,
    }

    impl MockManager {
        fn new(state: PhoneState, notifications: Vec<Notification>) -> Self {
            Self {
                state: Arc::new(Mutex::new(state)),
                notifications: Arc::new(Mutex::new(notifications)),
                fail_next: Arc::new(Mutex::new(false)),
            }
        }
    }

    impl PhoneManager for MockManager {
        fn state(&mut self) -> PhoneState {
            *self.state.lock().unwrap()
        }
        fn notifications(&mut self) -> Result<Vec<Notification>, PilotError> {
            if std::mem::take(&mut *self.fail_next.lock().unwrap()) {
                return Err(PilotError::hardware(COMPONENT, "adb shell hiccup"));
            }
            Ok(self.notifications.lock().unwrap().clone())
        }
    }

    #[test]
    fn disabled_phone_reports_disabled() {
        let queue = EventQueue::new();
        let mut svc = PhoneService::new(ServiceContext::new(EventTag::Phone, queue.sender()), None, None);
        assert_eq!(svc.tick().unwrap(), Tick::Idle);
        assert_eq!(
            queue.pop().unwrap().payload,
            json!({"enabled": false, "type": null, "state": "disconnected", "notifications": []})
        );
    }

    #[test]
    fn android_loop_tracks_state_and_notifications() {
        let queue = EventQueue::new();
        let manager = MockManager::new(PhoneState::Disconnected, parse_dumpsys(DUMP, None));
        let mut svc = PhoneService::new(
            ServiceContext::new(EventTag::Phone, queue.sender()),
            Some(PhoneKind::Android),
            Some(Box::new(manager.clone())),
        );

        svc.tick().unwrap();
        let first = queue.pop().unwrap().payload;
        assert_eq!(first["type"], "android");
        assert_eq!(first["state"], "disconnected");
        svc.tick().unwrap();
        assert!(!queue.has_pending());

        *manager.state.lock().unwrap() = PhoneState::Connected;
        svc.tick().unwrap();
        let connected = queue.pop().unwrap().payload;
        assert_eq!(connected["state"], "connected");
        // Newest first.
        assert_eq!(connected["notifications"][0]["title"], "Bob");
        assert_eq!(connected["notifications"][1]["title"], "Alice");

        *manager.state.lock().unwrap() = PhoneState::Disconnected;
        svc.tick().unwrap();
        let gone = queue.pop().unwrap().payload;
        assert_eq!(gone["notifications"], json!([]));

        svc.refresh();
        assert_eq!(queue.pop().unwrap().payload, gone);
    }

    #[test]
    fn notification_failure_still_announces_connection() {
        let queue = EventQueue::new();
        let manager = MockManager::new(PhoneState::Connected, parse_dumpsys(DUMP, None));
        *manager.fail_next.lock().unwrap() = true;
        let mut svc = PhoneService::new(
            ServiceContext::new(EventTag::Phone, queue.sender()),
            Some(PhoneKind::Android),
            Some(Box::new(manager.clone())),
        );

        assert!(matches!(svc.tick(), Err(PilotError::Hardware { .. })));
        let first = queue.pop().unwrap().payload;
        assert_eq!(first["state"], "connected");
        assert_eq!(first["notifications"], json!([]));

        svc.tick().unwrap();
        let listed = queue.pop().unwrap().payload;
        assert_eq!(listed["state"], "connected");
        assert_eq!(listed["notifications"][0]["title"], "Bob");
    }
}
