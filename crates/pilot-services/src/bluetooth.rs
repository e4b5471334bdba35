//! Bluetooth Service: adapter power/discovery state and known devices.

use std::process::{Child, Command, Stdio};

use pilot_types::{EventTag, PilotError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::service::{Service, ServiceContext, Tick};
use crate::shell;

const POLL_MS: u64 = 2000;
const COMPONENT: &str = "bluetooth";
const DISCOVERY_TIMEOUT_SECS: &str = "60";

/// Commands the UI sends on the `bluetooth` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BluetoothCommand {
    #[serde(rename = "start-discovery")]
    StartDiscovery,
    #[serde(rename = "stop-discovery")]
    StopDiscovery,
    #[serde(rename = "on-power")]
    PowerOn,
    #[serde(rename = "off-power")]
    PowerOff,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub alias: String,
    pub address: String,
    pub connected: bool,
}

/// Snapshot pushed to the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterState {
    pub hostname: String,
    pub address: String,
    pub powered: bool,
    pub discovering: bool,
    pub devices: Vec<Device>,
}

/// Access to the local Bluetooth controller.
pub trait BluetoothAdapter: Send {
    fn snapshot(&mut self) -> Result<AdapterState, PilotError>;
    fn set_power(&mut self, on: bool) -> Result<(), PilotError>;
    fn set_discovery(&mut self, on: bool) -> Result<(), PilotError>;
    /// Stop anything left running.
    fn release(&mut self) {}
}

/// [`BluetoothAdapter`] driven through `bluetoothctl`.
#[derive(Debug)]
pub struct Bluetoothctl {
    scan: Option<Child>,
}

impl Bluetoothctl {
    /// # Errors
    ///
    /// [`PilotError::Hardware`] when `bluetoothctl` is not installed.
    pub fn new() -> Result<Self, PilotError> {
        shell::run_checked(COMPONENT, "bluetoothctl", &["--version"])?;
        Ok(Self { scan: None })
    }

    fn stop_scan(&mut self) {
        if let Some(mut child) = self.scan.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl BluetoothAdapter for Bluetoothctl {
    fn snapshot(&mut self) -> Result<AdapterState, PilotError> {
        let show = shell::run_checked(COMPONENT, "bluetoothctl", &["show"])?;
        let mut state = parse_show(&show);

        let listing = shell::run_checked(COMPONENT, "bluetoothctl", &["devices"])?;
        for (address, name) in parse_devices(&listing) {
            let info = shell::run(COMPONENT, "bluetoothctl", &["info", &address])?;
            let (alias, connected) = parse_info(&info.stdout);
            state.devices.push(Device {
                alias: alias.unwrap_or_else(|| name.clone()),
                name,
                address,
                connected,
            });
        }

        let scan_finished = self
            .scan
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(Some(_))));
        if scan_finished {
            self.scan = None;
        }
        Ok(state)
    }

    fn set_power(&mut self, on: bool) -> Result<(), PilotError> {
        let arg = if on { "on" } else { "off" };
        shell::run_checked(COMPONENT, "bluetoothctl", &["power", arg]).map(|_| ())
    }

    fn set_discovery(&mut self, on: bool) -> Result<(), PilotError> {
        self.stop_scan();
        if on {
            // `scan on` only lasts as long as the bluetoothctl session.
            let child = Command::new("bluetoothctl")
                .args(["--timeout", DISCOVERY_TIMEOUT_SECS, "scan", "on"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| PilotError::hardware(COMPONENT, format!("failed to start discovery: {e}")))?;
            self.scan = Some(child);
        } else {
            shell::run_checked(COMPONENT, "bluetoothctl", &["scan", "off"])?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.stop_scan();
    }
}

fn yes(value: &str) -> bool {
    value.trim() == "yes"
}

/// Parse `bluetoothctl show`.
pub fn parse_show(text: &str) -> AdapterState {
    let mut state = AdapterState::default();
    let mut name = String::new();
    let mut alias = String::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Controller ") {
            state.address = rest.split_whitespace().next().unwrap_or_default().to_string();
        } else if let Some((key, value)) = line.split_once(':') {
            match key {
                "Name" => name = value.trim().to_string(),
                "Alias" => alias = value.trim().to_string(),
                "Powered" => state.powered = yes(value),
                "Discovering" => state.discovering = yes(value),
                _ => {}
            }
        }
    }
    state.hostname = if !alias.is_empty() && alias != name { alias } else { name };
    state
}

/// Parse `bluetoothctl devices` into `(address, name)` pairs.
pub fn parse_devices(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("Device ")?;
            let (address, name) = rest.split_once(' ').unwrap_or((rest, ""));
            Some((address.to_string(), name.trim().to_string()))
        })
        .collect()
}

/// Parse `bluetoothctl info <addr>` into `(alias, connected)`.
pub fn parse_info(text: &str) -> (Option<String>, bool) {
    let mut alias = None;
    let mut connected = false;
    for line in text.lines() {
        if let Some((key, value)) = line.trim().split_once(':') {
            match key {
                "Alias" => alias = Some(value.trim().to_string()),
                "Connected" => connected = yes(value),
                _ => {}
            }
        }
    }
    (alias, connected)
}

pub struct BluetoothService {
    ctx: ServiceContext,
    adapter: Box<dyn BluetoothAdapter>,
    state: Option<AdapterState>,
}

impl BluetoothService {
    pub fn new(ctx: ServiceContext, adapter: Box<dyn BluetoothAdapter>) -> Self {
        Self {
            ctx,
            adapter,
            state: None,
        }
    }

    /// Read the adapter and publish on change.  An unreadable adapter is
    /// published once as powered off with no devices.
    fn poll(&mut self) -> Result<(), PilotError> {
        match self.adapter.snapshot() {
            Ok(snapshot) => {
                self.publish(snapshot);
                Ok(())
            }
            Err(e) => {
                self.publish(AdapterState::default());
                Err(e)
            }
        }
    }

    fn publish(&mut self, snapshot: AdapterState) {
        if self.state.as_ref() != Some(&snapshot) {
            self.ctx.push_to_queue(&snapshot);
            self.state = Some(snapshot);
        }
    }
}

impl Service for BluetoothService {
    fn tag(&self) -> EventTag {
        self.ctx.tag()
    }

    fn tick(&mut self) -> Result<Tick, PilotError> {
        self.poll()?;
        Ok(Tick::millis(POLL_MS))
    }

    fn refresh(&mut self) {
        if let Some(state) = &self.state {
            self.ctx.push_to_queue(state);
        }
    }

    fn accepts_commands(&self) -> bool {
        true
    }

    fn handle_command(&mut self, payload: Value) -> Result<(), PilotError> {
        let command: BluetoothCommand = serde_json::from_value(payload.clone()).map_err(|_| {
            PilotError::InvalidAttribute(format!("unknown bluetooth command {payload}"))
        })?;
        info!(?command, "bluetooth command");
        match command {
            BluetoothCommand::StartDiscovery => self.adapter.set_discovery(true)?,
            BluetoothCommand::StopDiscovery => self.adapter.set_discovery(false)?,
            BluetoothCommand::PowerOn => self.adapter.set_power(true)?,
            BluetoothCommand::PowerOff => self.adapter.set_power(false)?,
        }
        if let Err(e) = self.poll() {
            warn!(error = %e, "bluetooth state unavailable after command");
        }
        Ok(())
    }

    fn terminate(&mut self) {
        self.adapter.release();
    }
}
