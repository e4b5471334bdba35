//! OBD-II mode 01 over an ELM327 serial adapter.
//!
//! Only the handful of PIDs the head unit displays are supported.  Each is
//! decoded with the SAE J1979 formula into a metric quantity.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::str::FromStr;
use std::time::{Duration, Instant};

use pilot_types::PilotError;
use serde::Serialize;
use tracing::{debug, info};

use super::{ObdConnector, ObdLink};

const COMPONENT: &str = "vehicle";
const BAUD_RATE: u32 = 38_400;
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// `ATZ` and the first protocol search can take several seconds.
const RESPONSE_DEADLINE: Duration = Duration::from_secs(6);
const PROMPT: u8 = b'>';
const INIT_SEQUENCE: [&str; 6] = ["ATZ", "ATE0", "ATL0", "ATS1", "ATH0", "ATSP0"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObdCommand {
    Speed,
    Rpm,
    FuelLevel,
    ControlModuleVoltage,
    ShortFuelTrim1,
    LongFuelTrim1,
    CoolantTemp,
    IntakeTemp,
    ThrottlePos,
    EngineLoad,
}

impl ObdCommand {
    pub const ALL: [ObdCommand; 10] = [
        ObdCommand::Speed,
        ObdCommand::Rpm,
        ObdCommand::FuelLevel,
        ObdCommand::ControlModuleVoltage,
        ObdCommand::ShortFuelTrim1,
        ObdCommand::LongFuelTrim1,
        ObdCommand::CoolantTemp,
        ObdCommand::IntakeTemp,
        ObdCommand::ThrottlePos,
        ObdCommand::EngineLoad,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ObdCommand::Speed => "SPEED",
            ObdCommand::Rpm => "RPM",
            ObdCommand::FuelLevel => "FUEL_LEVEL",
            ObdCommand::ControlModuleVoltage => "CONTROL_MODULE_VOLTAGE",
            ObdCommand::ShortFuelTrim1 => "SHORT_FUEL_TRIM_1",
            ObdCommand::LongFuelTrim1 => "LONG_FUEL_TRIM_1",
            ObdCommand::CoolantTemp => "COOLANT_TEMP",
            ObdCommand::IntakeTemp => "INTAKE_TEMP",
            ObdCommand::ThrottlePos => "THROTTLE_POS",
            ObdCommand::EngineLoad => "ENGINE_LOAD",
        }
    }

    /// Mode 01 PID.
    pub fn pid(self) -> u8 {
        match self {
            ObdCommand::EngineLoad => 0x04,
            ObdCommand::CoolantTemp => 0x05,
            ObdCommand::ShortFuelTrim1 => 0x06,
            ObdCommand::LongFuelTrim1 => 0x07,
            ObdCommand::Rpm => 0x0C,
            ObdCommand::Speed => 0x0D,
            ObdCommand::IntakeTemp => 0x0F,
            ObdCommand::ThrottlePos => 0x11,
            ObdCommand::FuelLevel => 0x2F,
            ObdCommand::ControlModuleVoltage => 0x42,
        }
    }

    fn data_len(self) -> usize {
        match self {
            ObdCommand::Rpm | ObdCommand::ControlModuleVoltage => 2,
            _ => 1,
        }
    }

    pub fn units(self) -> &'static str {
        match self {
            ObdCommand::Speed => "kilometer_per_hour",
            ObdCommand::Rpm => "revolutions_per_minute",
            ObdCommand::ControlModuleVoltage => "volt",
            ObdCommand::CoolantTemp | ObdCommand::IntakeTemp => "degree_Celsius",
            ObdCommand::FuelLevel
            | ObdCommand::ShortFuelTrim1
            | ObdCommand::LongFuelTrim1
            | ObdCommand::ThrottlePos
            | ObdCommand::EngineLoad => "percent",
        }
    }

    /// The request line sent to the adapter, e.g. `010D`.
    pub fn request(self) -> String {
        format!("01{:02X}", self.pid())
    }

    /// Apply the PID formula to the data bytes `A`, `B`.
    pub fn decode(self, data: &[u8]) -> Option<f64> {
        let a = f64::from(*data.first()?);
        let b = || data.get(1).copied().map(f64::from);
        let value = match self {
            ObdCommand::Speed => a,
            ObdCommand::Rpm => (256.0 * a + b()?) / 4.0,
            ObdCommand::ControlModuleVoltage => (256.0 * a + b()?) / 1000.0,
            ObdCommand::ShortFuelTrim1 | ObdCommand::LongFuelTrim1 => a * 100.0 / 128.0 - 100.0,
            ObdCommand::CoolantTemp | ObdCommand::IntakeTemp => a - 40.0,
            ObdCommand::FuelLevel | ObdCommand::ThrottlePos | ObdCommand::EngineLoad => {
                a * 100.0 / 255.0
            }
        };
        Some(value)
    }
}

impl fmt::Display for ObdCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ObdCommand {
    type Err = PilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObdCommand::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| PilotError::InvalidAttribute(format!("OBD command {s:?} is not supported")))
    }
}

/// One decoded value as shown by the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub quantity: f64,
    pub units: &'static str,
    /// Power of the unit.
    pub magnitude: i32,
}

impl Reading {
    pub fn new(command: ObdCommand, quantity: f64) -> Self {
        Self {
            quantity,
            units: command.units(),
            magnitude: 1,
        }
    }
}

fn hex_bytes(line: &str) -> Option<Vec<u8>> {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() || !compact.is_ascii() || compact.len() % 2 != 0 {
        return None;
    }
    (0..compact.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&compact[i..i + 2], 16).ok())
        .collect()
}

/// Decode the adapter's reply to `command`.
///
/// Returns `Ok(None)` when the vehicle does not answer that PID (`NO DATA`)
/// and an error when the reply is unusable.
pub fn parse_response(command: ObdCommand, raw: &str) -> Result<Option<f64>, PilotError> {
    let mut answered = false;
    for line in raw.split(['\r', '\n']) {
        let line = line.trim().trim_start_matches(PROMPT as char).trim();
        if line.is_empty() || line.starts_with("SEARCHING") {
            continue;
        }
        let upper = line.to_ascii_uppercase();
        if upper.contains("NO DATA") {
            answered = true;
            continue;
        }
        if upper.contains("UNABLE TO CONNECT") || upper.contains("ERROR") || upper == "?" {
            return Err(PilotError::hardware(COMPONENT, format!("{command}: {line}")));
        }
        let Some(bytes) = hex_bytes(line) else {
            continue;
        };
        if bytes.len() >= 2 && bytes[0] == 0x41 && bytes[1] == command.pid() {
            let data = &bytes[2..];
            if data.len() < command.data_len() {
                return Err(PilotError::hardware(COMPONENT, format!("{command}: short reply {line:?}")));
            }
            return Ok(command.decode(data));
        }
    }
    if answered {
        Ok(None)
    } else {
        Err(PilotError::hardware(COMPONENT, format!("{command}: unexpected reply {raw:?}")))
    }
}

/// A live ELM327 session.
pub struct Elm327 {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl Elm327 {
    /// Open `path`, initialise the adapter and check that an ECU answers.
    pub fn open(path: &str) -> Result<Self, PilotError> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| PilotError::hardware(COMPONENT, format!("{path}: {e}")))?;
        let mut elm = Self {
            port,
            name: path.to_string(),
        };
        for cmd in INIT_SEQUENCE {
            elm.send(cmd)?;
        }
        let probe = elm.send("0100")?;
        if !probe.to_ascii_uppercase().contains("41 00") && !probe.contains("4100") {
            return Err(PilotError::hardware(
                COMPONENT,
                format!("{path}: no ECU answered ({})", probe.trim()),
            ));
        }
        info!(port = path, "ELM327 link established");
        Ok(elm)
    }

    fn io_error(&self, e: std::io::Error) -> PilotError {
        PilotError::hardware(COMPONENT, format!("{}: {e}", self.name))
    }

    /// Send one line and collect the reply up to the `>` prompt.
    fn send(&mut self, cmd: &str) -> Result<String, PilotError> {
        debug!(cmd, "elm327 >");
        self.port
            .write_all(format!("{cmd}\r").as_bytes())
            .map_err(|e| self.io_error(e))?;
        self.port.flush().map_err(|e| self.io_error(e))?;

        let deadline = Instant::now() + RESPONSE_DEADLINE;
        let mut reply = Vec::new();
        let mut buf = [0u8; 128];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    reply.extend_from_slice(&buf[..n]);
                    if reply.contains(&PROMPT) {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(self.io_error(e)),
            }
            if Instant::now() >= deadline {
                return Err(PilotError::hardware(
                    COMPONENT,
                    format!("{}: no prompt after {cmd}", self.name),
                ));
            }
        }
        let text = String::from_utf8_lossy(&reply).into_owned();
        debug!(reply = %text.trim(), "elm327 <");
        Ok(text)
    }
}

impl ObdLink for Elm327 {
    fn query(&mut self, command: ObdCommand) -> Result<Option<Reading>, PilotError> {
        let raw = self.send(&command.request())?;
        match parse_response(command, &raw) {
            Ok(value) => Ok(value.map(|v| Reading::new(command, v))),
            // A garbled reply is not a dead link.
            Err(e) => {
                debug!(error = %e, "unusable OBD reply");
                Ok(None)
            }
        }
    }
}

/// Opens [`Elm327`] sessions on real serial ports.  Without a configured
/// port every enumerated port is tried in turn.
#[derive(Debug, Default)]
pub struct SerialConnector;

impl ObdConnector for SerialConnector {
    fn connect(&mut self, port: Option<&str>) -> Result<Box<dyn ObdLink>, PilotError> {
        if let Some(path) = port {
            return Ok(Box::new(Elm327::open(path)?));
        }
        let ports = serialport::available_ports()
            .map_err(|e| PilotError::hardware(COMPONENT, format!("port enumeration failed: {e}")))?;
        for candidate in ports {
            match Elm327::open(&candidate.port_name) {
                Ok(elm) => return Ok(Box::new(elm)),
                Err(e) => debug!(port = %candidate.port_name, error = %e, "not an OBD adapter"),
            }
        }
        Err(PilotError::hardware(COMPONENT, "no OBD adapter found"))
    }
}
