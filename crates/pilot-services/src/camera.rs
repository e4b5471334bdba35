//! Camera Service: a push button on a GPIO pin toggles the backup camera
//! preview.

use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use pilot_types::{EventTag, PilotError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::service::{Service, ServiceContext, Tick};
use crate::shell;

const COMPONENT: &str = "camera";
const POLL_MS: u64 = 20;
const BOUNCE: Duration = Duration::from_millis(400);
const GPIO_ROOT: &str = "/sys/class/gpio";

/// A digital input with edge detection.
pub trait ButtonInput: Send {
    /// `true` when a rising edge happened since the previous call.
    fn rising_edge(&mut self) -> Result<bool, PilotError>;
    fn release(&mut self) {}
}

/// The thing the button toggles.
pub trait Preview: Send {
    fn start(&mut self) -> Result<(), PilotError>;
    fn stop(&mut self);
}

/// A GPIO pin driven through the sysfs interface.
#[derive(Debug)]
pub struct SysfsGpio {
    pin: u32,
    root: PathBuf,
    last: bool,
}

impl SysfsGpio {
    /// Export `pin` and configure it as an input.
    pub fn open(pin: u32) -> Result<Self, PilotError> {
        Self::open_at(GPIO_ROOT, pin)
    }

    pub fn open_at(root: impl Into<PathBuf>, pin: u32) -> Result<Self, PilotError> {
        let root = root.into();
        let dir = root.join(format!("gpio{pin}"));
        if !dir.exists() {
            fs::write(root.join("export"), pin.to_string())
                .map_err(|e| PilotError::hardware(COMPONENT, format!("export gpio{pin}: {e}")))?;
        }
        fs::write(dir.join("direction"), "in")
            .map_err(|e| PilotError::hardware(COMPONENT, format!("gpio{pin} direction: {e}")))?;
        let mut gpio = Self { pin, root, last: false };
        gpio.last = gpio.read()?;
        Ok(gpio)
    }

    fn read(&self) -> Result<bool, PilotError> {
        let path = self.root.join(format!("gpio{}", self.pin)).join("value");
        let value = fs::read_to_string(&path)
            .map_err(|e| PilotError::hardware(COMPONENT, format!("{}: {e}", path.display())))?;
        Ok(value.trim() == "1")
    }
}

impl ButtonInput for SysfsGpio {
    fn rising_edge(&mut self) -> Result<bool, PilotError> {
        let now = self.read()?;
        let rising = now && !self.last;
        self.last = now;
        Ok(rising)
    }

    fn release(&mut self) {
        if let Err(e) = fs::write(self.root.join("unexport"), self.pin.to_string()) {
            debug!(pin = self.pin, error = %e, "gpio unexport failed");
        }
    }
}

/// Preview shown by running an external viewer until it is killed.
#[derive(Debug)]
pub struct CommandPreview {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
}

impl CommandPreview {
    pub fn new(command_line: &str) -> Result<Self, PilotError> {
        let (program, args) = shell::split_command_line(command_line).ok_or_else(|| {
            PilotError::InvalidAttribute("camera preview command is empty".to_string())
        })?;
        Ok(Self {
            program,
            args,
            child: None,
        })
    }
}

impl Preview for CommandPreview {
    fn start(&mut self) -> Result<(), PilotError> {
        self.stop();
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PilotError::hardware(COMPONENT, format!("failed to start {}: {e}", self.program)))?;
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct CameraState {
    active: bool,
}

pub struct CameraService {
    ctx: ServiceContext,
    button: Box<dyn ButtonInput>,
    preview: Box<dyn Preview>,
    active: bool,
    last_toggle: Option<Instant>,
}

impl CameraService {
    pub fn new(ctx: ServiceContext, button: Box<dyn ButtonInput>, preview: Box<dyn Preview>) -> Self {
        Self {
            ctx,
            button,
            preview,
            active: false,
            last_toggle: None,
        }
    }

    fn push_state(&self) {
        self.ctx.push_to_queue(&CameraState { active: self.active });
    }

    /// Flip the preview on or off.
    pub fn toggle(&mut self) -> Result<(), PilotError> {
        if self.active {
            self.preview.stop();
            self.active = false;
        } else {
            self.preview.start()?;
            self.active = true;
        }
        info!(active = self.active, "camera preview toggled");
        self.push_state();
        Ok(())
    }
}

impl Service for CameraService {
    fn tag(&self) -> EventTag {
        self.ctx.tag()
    }

    fn tick(&mut self) -> Result<Tick, PilotError> {
        if self.button.rising_edge()? {
            let now = Instant::now();
            let bounced = self
                .last_toggle
                .is_some_and(|at| now.duration_since(at) < BOUNCE);
            if bounced {
                debug!("button bounce ignored");
            } else {
                self.last_toggle = Some(now);
                if let Err(e) = self.toggle() {
                    warn!(error = %e, "camera toggle failed");
                }
            }
        }
        Ok(Tick::millis(POLL_MS))
    }

    fn refresh(&mut self) {
        self.push_state();
    }

    fn terminate(&mut self) {
        self.preview.stop();
        self.active = false;
        self.button.release();
    }
}
