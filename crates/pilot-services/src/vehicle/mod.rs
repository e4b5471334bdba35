//! Vehicle Service: OBD-II telemetry.
//!
//! Every half second the service either (re)connects to the adapter or
//! queries the fields whose interval has come round.  The emitted state is
//! `{enabled, connected, failures, stats: [{name, value}]}`; `failures` is
//! raised when the configured port does not exist or the adapter cannot be
//! reached, and cleared by the next successful connection.

mod elm327;

pub use elm327::{Elm327, ObdCommand, Reading, SerialConnector, parse_response};

use std::path::Path;

use pilot_types::{EventTag, PilotError};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::service::{Service, ServiceContext, Tick};
use crate::settings::VehicleSettings;

const TICK_MS: u64 = 500;

/// An open diagnostic link.
pub trait ObdLink: Send {
    /// Query one PID.  `Ok(None)` when the vehicle does not support it; an
    /// error means the link is gone.
    fn query(&mut self, command: ObdCommand) -> Result<Option<Reading>, PilotError>;
}

/// Opens [`ObdLink`]s.
pub trait ObdConnector: Send {
    fn connect(&mut self, port: Option<&str>) -> Result<Box<dyn ObdLink>, PilotError>;
}

#[derive(Debug, Clone)]
struct QueriedField {
    name: String,
    command: ObdCommand,
    /// Query every N ticks.
    every: u64,
    last: Option<Reading>,
}

#[derive(Serialize)]
struct Stat<'a> {
    name: &'a str,
    value: &'a Reading,
}

#[derive(Serialize)]
struct VehicleState<'a> {
    enabled: bool,
    connected: bool,
    failures: bool,
    stats: Vec<Stat<'a>>,
}

pub struct VehicleService {
    ctx: ServiceContext,
    enabled: bool,
    port: Option<String>,
    fields: Vec<QueriedField>,
    connector: Box<dyn ObdConnector>,
    link: Option<Box<dyn ObdLink>>,
    failures: bool,
    port_error_logged: bool,
    ticks: u64,
}

impl VehicleService {
    /// # Errors
    ///
    /// [`PilotError::InvalidAttribute`] for an unsupported OBD command or a
    /// non-positive interval in `vehicle.stats`.
    pub fn new(
        ctx: ServiceContext,
        settings: VehicleSettings,
        connector: Box<dyn ObdConnector>,
    ) -> Result<Self, PilotError> {
        let fields = settings
            .stats
            .iter()
            .map(|stat| {
                let command = stat.command.parse::<ObdCommand>()?;
                if !(stat.interval > 0.0) {
                    return Err(PilotError::InvalidAttribute(format!(
                        "interval of {:?} must be positive",
                        stat.name
                    )));
                }
                let every = ((stat.interval * 1000.0) / TICK_MS as f64).round().max(1.0) as u64;
                Ok(QueriedField {
                    name: stat.name.clone(),
                    command,
                    every,
                    last: None,
                })
            })
            .collect::<Result<Vec<_>, PilotError>>()?;

        Ok(Self {
            ctx,
            enabled: settings.enabled,
            port: settings.port.filter(|p| !p.trim().is_empty()),
            fields,
            connector,
            link: None,
            failures: false,
            port_error_logged: false,
            ticks: 0,
        })
    }

    fn push_info(&self) {
        let state = VehicleState {
            enabled: self.enabled,
            connected: self.link.is_some(),
            failures: self.failures,
            stats: self
                .fields
                .iter()
                .filter_map(|f| {
                    f.last.as_ref().map(|value| Stat {
                        name: &f.name,
                        value,
                    })
                })
                .collect(),
        };
        self.ctx.push_to_queue(&state);
    }

    fn mark_failed(&mut self) {
        if !self.failures {
            self.failures = true;
            self.push_info();
        }
    }

    fn try_connect(&mut self) {
        if let Some(port) = &self.port
            && !Path::new(port).exists()
        {
            if !self.port_error_logged {
                error!(port = %port, "invalid serial port specified, will keep trying to connect");
                self.port_error_logged = true;
            }
            self.mark_failed();
            return;
        }

        match self.connector.connect(self.port.as_deref()) {
            Ok(link) => {
                info!(port = ?self.port, "OBD connection made");
                self.link = Some(link);
                self.failures = false;
                self.port_error_logged = false;
                self.ticks = 0;
                self.push_info();
            }
            Err(e) => {
                if !self.port_error_logged {
                    warn!(error = %e, "OBD connection failed, retrying");
                    self.port_error_logged = true;
                }
                self.mark_failed();
            }
        }
    }

    fn query_fields(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let ticks = self.ticks;
        let mut updated = false;
        let mut lost = false;
        for field in self.fields.iter_mut().filter(|f| ticks % f.every == 0) {
            match link.query(field.command) {
                Ok(Some(reading)) => {
                    field.last = Some(reading);
                    updated = true;
                }
                Ok(None) => error!(field = %field.name, "failed to query"),
                Err(e) => {
                    warn!(error = %e, "OBD link lost");
                    lost = true;
                    break;
                }
            }
        }

        if lost {
            self.link = None;
            self.push_info();
            return;
        }
        self.ticks = ticks.wrapping_add(1);
        if updated {
            self.push_info();
        }
    }
}

impl Service for VehicleService {
    fn tag(&self) -> EventTag {
        self.ctx.tag()
    }

    fn tick(&mut self) -> Result<Tick, PilotError> {
        if !self.enabled {
            self.push_info();
            return Ok(Tick::Idle);
        }
        if self.link.is_none() {
            self.try_connect();
        } else {
            self.query_fields();
        }
        Ok(Tick::millis(TICK_MS))
    }

    fn refresh(&mut self) {
        self.push_info();
    }

    fn terminate(&mut self) {
        self.link = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::VehicleStat;
    use pilot_middleware::EventQueue;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    type Script = Arc<Mutex<VecDeque<Result<Option<Reading>, PilotError>>>>;

    struct ScriptedLink {
        replies: Script,
    }

    impl ObdLink for ScriptedLink {
        fn query(&mut self, command: ObdCommand) -> Result<Option<Reading>, PilotError> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Some(Reading::new(command, 1.0))))
        }
    }

    #[derive(Clone, Default)]
    struct MockConnector {
        fail: Arc<Mutex<bool>>,
        attempts: Arc<Mutex<u32>>,
        replies: Script,
    }

    impl ObdConnector for MockConnector {
        fn connect(&mut self, _port: Option<&str>) -> Result<Box<dyn ObdLink>, PilotError> {
            *self.attempts.lock().unwrap() += 1;
            if *self.fail.lock().unwrap() {
                return Err(PilotError::hardware("vehicle", "no adapter"));
            }
            Ok(Box::new(ScriptedLink {
                replies: Arc::clone(&self.replies),
            }))
        }
    }

    fn settings(port: Option<String>) -> VehicleSettings {
        VehicleSettings {
            enabled: true,
            port,
            stats: vec![
                VehicleStat {
                    name: "Speed".into(),
                    command: "SPEED".into(),
                    interval: 0.5,
                    unit: None,
                },
                VehicleStat {
                    name: "Fuel Level".into(),
                    command: "FUEL_LEVEL".into(),
                    interval: 1.0,
                    unit: None,
                },
            ],
        }
    }

    fn drain(queue: &EventQueue) -> Vec<Value> {
        std::iter::from_fn(|| queue.pop()).map(|e| e.payload).collect()
    }

    #[test]
    fn unknown_command_fails_construction() {
        let mut bad = settings(None);
        bad.stats[0].command = "WARP_DRIVE".into();
        let queue = EventQueue::new();
        let result = VehicleService::new(
            ServiceContext::new(EventTag::Vehicle, queue.sender()),
            bad,
            Box::new(MockConnector::default()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn missing_port_reports_failure_once() {
        let queue = EventQueue::new();
        let connector = MockConnector::default();
        let mut svc = VehicleService::new(
            ServiceContext::new(EventTag::Vehicle, queue.sender()),
            settings(Some("/dev/definitely-not-here".into())),
            Box::new(connector.clone()),
        )
        .unwrap();

        for _ in 0..3 {
            assert_eq!(svc.tick().unwrap(), Tick::millis(500));
        }
        let events = drain(&queue);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["failures"], true);
        assert_eq!(events[0]["connected"], false);
        assert_eq!(*connector.attempts.lock().unwrap(), 0);
    }

    #[test]
    fn connects_and_queries_on_interval() {
        let port = tempfile::NamedTempFile::new().unwrap();
        let queue = EventQueue::new();
        let connector = MockConnector::default();
        let mut svc = VehicleService::new(
            ServiceContext::new(EventTag::Vehicle, queue.sender()),
            settings(Some(port.path().display().to_string())),
            Box::new(connector.clone()),
        )
        .unwrap();

        svc.tick().unwrap();
        let connected = drain(&queue);
        assert_eq!(connected.last().unwrap()["connected"], true);

        // tick 0: both fields, tick 1: speed only.
        svc.tick().unwrap();
        let first = drain(&queue);
        assert_eq!(first[0]["stats"].as_array().unwrap().len(), 2);
        assert_eq!(first[0]["stats"][0]["name"], "Speed");
        assert_eq!(first[0]["stats"][1]["value"]["units"], "percent");

        connector
            .replies
            .lock()
            .unwrap()
            .push_back(Ok(Some(Reading::new(ObdCommand::Speed, 88.0))));
        svc.tick().unwrap();
        let second = drain(&queue);
        assert_eq!(second[0]["stats"][0]["value"]["quantity"], 88.0);
        assert!(connector.replies.lock().unwrap().is_empty());
    }

    #[test]
    fn link_error_drops_connection_and_reconnects() {
        let queue = EventQueue::new();
        let connector = MockConnector::default();
        let mut svc = VehicleService::new(
            ServiceContext::new(EventTag::Vehicle, queue.sender()),
            settings(None),
            Box::new(connector.clone()),
        )
        .unwrap();
        svc.tick().unwrap();
        drain(&queue);

        connector
            .replies
            .lock()
            .unwrap()
            .push_back(Err(PilotError::hardware("vehicle", "unplugged")));
        svc.tick().unwrap();
        let events = drain(&queue);
        assert_eq!(events.last().unwrap()["connected"], false);

        *connector.fail.lock().unwrap() = true;
        svc.tick().unwrap();
        svc.tick().unwrap();
        let events = drain(&queue);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["failures"], true);

        *connector.fail.lock().unwrap() = false;
        svc.tick().unwrap();
        let events = drain(&queue);
        assert_eq!(events[0]["connected"], true);
        assert_eq!(events[0]["failures"], false);
    }

    #[test]
    fn disabled_vehicle_idles() {
        let queue = EventQueue::new();
        let mut off = settings(None);
        off.enabled = false;
        let mut svc = VehicleService::new(
            ServiceContext::new(EventTag::Vehicle, queue.sender()),
            off,
            Box::new(MockConnector::default()),
        )
        .unwrap();
        assert_eq!(svc.tick().unwrap(), Tick::Idle);
        assert_eq!(queue.pop().unwrap().payload["enabled"], false);
        svc.refresh();
        assert!(queue.pop().is_some());
    }
}
