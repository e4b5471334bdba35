//! Media Service: current track metadata and track control.
//!
//! Metadata comes from a [`MediaPlayer`] backend.  The default backend drives
//! `playerctl`, which speaks MPRIS to whatever player is active, including
//! the BlueZ AVRCP player of a connected phone.

use std::str::FromStr;

use pilot_types::{EventTag, PilotError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::service::{Service, ServiceContext, Tick};
use crate::shell;

const POLL_MS: u64 = 1000;
const COMPONENT: &str = "media";

/// `title\tartist\talbum\tlength(µs)\tposition(µs)\tstatus\tartUrl`
const PLAYERCTL_FORMAT: &str = "{{title}}\t{{artist}}\t{{album}}\t{{mpris:length}}\t{{position}}\t{{status}}\t{{mpris:artUrl}}";

/// Track control actions sent by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackControl {
    Play,
    Pause,
    Next,
    Prev,
}

impl FromStr for TrackControl {
    type Err = PilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "play" => Ok(TrackControl::Play),
            "pause" => Ok(TrackControl::Pause),
            "next" => Ok(TrackControl::Next),
            "prev" => Ok(TrackControl::Prev),
            other => Err(PilotError::InvalidAttribute(format!(
                "unknown track control {other:?}"
            ))),
        }
    }
}

/// Metadata of the track currently loaded in the player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// Seconds.
    pub duration: Option<f64>,
    /// Seconds.
    pub position: Option<f64>,
    pub is_playing: bool,
    pub cover: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaState {
    pub source: &'static str,
    pub song: Option<Song>,
}

/// A source of track metadata that also accepts track control.
pub trait MediaPlayer: Send {
    /// The current track, or `None` when no player is available.
    fn current(&mut self) -> Result<Option<Song>, PilotError>;

    fn control(&mut self, action: TrackControl) -> Result<(), PilotError>;
}

/// [`MediaPlayer`] backed by the `playerctl` CLI.
#[derive(Debug, Default)]
pub struct Playerctl;

impl MediaPlayer for Playerctl {
    fn current(&mut self) -> Result<Option<Song>, PilotError> {
        let out = shell::run(COMPONENT, "playerctl", &["metadata", "--format", PLAYERCTL_FORMAT])?;
        if !out.success {
            // "No players found" is the normal idle state.
            debug!(stderr = %out.stderr.trim(), "no media player");
            return Ok(None);
        }
        Ok(parse_playerctl(&out.stdout))
    }

    fn control(&mut self, action: TrackControl) -> Result<(), PilotError> {
        let verb = match action {
            TrackControl::Play => "play",
            TrackControl::Pause => "pause",
            TrackControl::Next => "next",
            TrackControl::Prev => "previous",
        };
        shell::run_checked(COMPONENT, "playerctl", &[verb]).map(|_| ())
    }
}

fn non_empty(field: Option<&str>) -> Option<String> {
    field
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn micros_to_secs(field: Option<&str>) -> Option<f64> {
    field
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(|us| us / 1_000_000.0)
}

/// Parse one line of [`PLAYERCTL_FORMAT`] output.
pub fn parse_playerctl(line: &str) -> Option<Song> {
    let line = line.lines().next()?;
    let fields: Vec<&str> = line.split('\t').collect();
    let get = |i: usize| fields.get(i).copied();
    let song = Song {
        title: non_empty(get(0)),
        artist: non_empty(get(1)),
        album: non_empty(get(2)),
        duration: micros_to_secs(get(3)),
        position: micros_to_secs(get(4)),
        is_playing: get(5).is_some_and(|s| s.trim() == "Playing"),
        cover: non_empty(get(6)),
    };
    if song.title.is_none() && song.artist.is_none() && song.album.is_none() {
        return None;
    }
    Some(song)
}

pub struct MediaService {
    ctx: ServiceContext,
    player: Box<dyn MediaPlayer>,
    state: Option<MediaState>,
}

impl MediaService {
    pub fn new(ctx: ServiceContext, player: Box<dyn MediaPlayer>) -> Self {
        Self {
            ctx,
            player,
            state: None,
        }
    }

    /// `track_control` for the UI's `media` command.
    pub fn track_control(&mut self, action: TrackControl) -> Result<(), PilotError> {
        info!(?action, "track control");
        self.player.control(action)
    }
}

impl Service for MediaService {
    fn tag(&self) -> EventTag {
        self.ctx.tag()
    }

    fn tick(&mut self) -> Result<Tick, PilotError> {
        let song = match self.player.current() {
            Ok(song) => song,
            Err(e) => {
                warn!(error = %e, "media player unavailable");
                None
            }
        };
        let state = MediaState {
            source: "bluetooth",
            song,
        };
        if self.state.as_ref() != Some(&state) {
            self.ctx.push_to_queue(&state);
            self.state = Some(state);
        }
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
        let action = payload
            .as_str()
            .ok_or_else(|| PilotError::InvalidAttribute(format!("track control must be a string, got {payload}")))?
            .parse::<TrackControl>()?;
        self.track_control(action)
    }
}
