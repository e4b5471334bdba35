//! Setup wizard (`--install`).
//!
//! Writes the application config and seeds `settings.json` with the
//! hardware options.  With `--default` every prompt takes its default.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use colored::Colorize;
use pilot_services::SettingsStore;
use pilot_types::PilotError;
use serde_json::{Value, json};

use crate::config;

const PHONE_TYPES: &[&str] = &["android"];

/// Where the wizard reads answers from.
pub enum Answers<'a> {
    Interactive(&'a mut dyn BufRead),
    Defaults,
}

/// What the wizard produced.
#[derive(Debug)]
pub struct Installed {
    pub config_path: PathBuf,
    pub settings_path: PathBuf,
}

/// Run the wizard and write both files.
pub fn run(config_path: &Path, mut answers: Answers<'_>, out: &mut dyn Write) -> Result<Installed, PilotError> {
    writeln!(out)?;
    writeln!(out, "{}", "  ╔══════════════════════════════════════╗".bold().cyan())?;
    writeln!(out, "{}", "  ║        PILOT Drive installer         ║".bold().cyan())?;
    writeln!(out, "{}", "  ╚══════════════════════════════════════╝".bold().cyan())?;
    writeln!(out)?;

    let mut cfg = config::load_from(config_path)?;

    // ── Server ────────────────────────────────────────────────────────────
    cfg.ws_port = prompt_parsed(&mut answers, out, "  UI WebSocket port", cfg.ws_port)?;
    cfg.static_port = prompt_parsed(&mut answers, out, "  Static UI HTTP port", cfg.static_port)?;
    cfg.static_dir = PathBuf::from(prompt_line(
        &mut answers,
        out,
        "  Static UI directory",
        &cfg.static_dir.display().to_string(),
    )?);
    cfg.settings_path = PathBuf::from(prompt_line(
        &mut answers,
        out,
        "  Settings file",
        &cfg.settings_path.display().to_string(),
    )?);

    let mut store = SettingsStore::open(&cfg.settings_path)?;

    // ── Vehicle ───────────────────────────────────────────────────────────
    writeln!(out, "\n  {}", "Vehicle (OBD-II)".bold())?;
    let vehicle = store.vehicle().ok();
    let enabled = prompt_yes_no(
        &mut answers,
        out,
        "  Enable vehicle statistics?",
        vehicle.as_ref().is_some_and(|v| v.enabled),
    )?;
    let port = if enabled {
        let current = vehicle.as_ref().and_then(|v| v.port.as_deref());
        json!(prompt_line(&mut answers, out, "  Serial port", current.unwrap_or("/dev/ttyUSB0"))?)
    } else {
        Value::Null
    };
    merge_section(&mut store, "vehicle", json!({ "enabled": enabled, "port": port }))?;

    // ── Phone ─────────────────────────────────────────────────────────────
    writeln!(out, "\n  {}", "Phone notifications".bold())?;
    let enabled = prompt_yes_no(&mut answers, out, "  Enable phone notifications?", false)?;
    let kind = if enabled {
        let kind = prompt_line(&mut answers, out, "  Phone type (android)", PHONE_TYPES[0])?.to_ascii_lowercase();
        if PHONE_TYPES.contains(&kind.as_str()) {
            json!(kind)
        } else {
            writeln!(out, "  {} unsupported phone type {kind:?}, using android", "!".yellow())?;
            json!(PHONE_TYPES[0])
        }
    } else {
        Value::Null
    };
    merge_section(&mut store, "phone", json!({ "enabled": enabled, "type": kind }))?;

    // ── Camera ────────────────────────────────────────────────────────────
    writeln!(out, "\n  {}", "Backup camera".bold())?;
    let camera = store.camera().ok();
    let enabled = prompt_yes_no(
        &mut answers,
        out,
        "  Enable backup camera?",
        camera.as_ref().is_some_and(|c| c.enabled),
    )?;
    let mut section = json!({ "enabled": enabled });
    if enabled {
        let pin = prompt_parsed(
            &mut answers,
            out,
            "  Reverse-gear GPIO pin",
            camera.as_ref().map_or(0, |c| c.button_pin),
        )?;
        section["buttonPin"] = json!(pin);
    }
    merge_section(&mut store, "camera", section)?;

    store.write()?;
    config::save_to(&cfg, config_path)?;

    writeln!(
        out,
        "\n  {} Config saved to {}",
        "✓".green().bold(),
        config_path.display().to_string().bold()
    )?;
    writeln!(
        out,
        "  {} Settings saved to {}\n",
        "✓".green().bold(),
        cfg.settings_path.display().to_string().bold()
    )?;

    Ok(Installed {
        config_path: config_path.to_path_buf(),
        settings_path: cfg.settings_path,
    })
}

/// Overlay `changes` onto an existing backend section.
fn merge_section(store: &mut SettingsStore, attribute: &str, changes: Value) -> Result<(), PilotError> {
    let mut section = store.get_setting(attribute)?.clone();
    match (section.as_object_mut(), changes) {
        (Some(current), Value::Object(changes)) => current.extend(changes),
        (_, changes) => section = changes,
    }
    store.set_setting(attribute, section)
}

// ─────────────────────────────────────────────────────────────────────────────
// Prompts
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(answers: &mut Answers<'_>, out: &mut dyn Write, msg: &str, default: &str) -> Result<String, PilotError> {
    write!(out, "{msg} [{default}]: ")?;
    let input = match answers {
        Answers::Defaults => {
            writeln!(out)?;
            return Ok(default.to_string());
        }
        Answers::Interactive(input) => input,
    };
    out.flush()?;
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            Ok(if t.is_empty() { default.to_string() } else { t })
        }
        Err(_) => Ok(default.to_string()),
    }
}

fn prompt_parsed<T>(answers: &mut Answers<'_>, out: &mut dyn Write, msg: &str, default: T) -> Result<T, PilotError>
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    let raw = prompt_line(answers, out, msg, &default.to_string())?;
    match raw.parse() {
        Ok(value) => Ok(value),
        Err(_) => {
            writeln!(out, "  {} {raw:?} is not valid, keeping {default}", "!".yellow())?;
            Ok(default)
        }
    }
}

fn prompt_yes_no(answers: &mut Answers<'_>, out: &mut dyn Write, msg: &str, default: bool) -> Result<bool, PilotError> {
    let hint = if default { "y" } else { "n" };
    let raw = prompt_line(answers, out, msg, hint)?;
    Ok(match raw.to_ascii_lowercase().as_str() {
        "y" | "yes" => true,
        "n" | "no" => false,
        _ => default,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use std::fs;
    use std::io::{self, Cursor};
    use tempfile::TempDir;

    fn config_file(dir: &TempDir) -> (PathBuf, PathBuf) {
        let config = dir.path().join("config").join("pilot-drive.toml");
        let settings = dir.path().join("config").join("settings.json");
        let cfg = AppConfig {
            settings_path: settings.clone(),
            ..AppConfig::default()
        };
        config::save_to(&cfg, &config).unwrap();
        (config, settings)
    }

    #[test]
    fn defaults_mode_writes_both_files() {
        let dir = TempDir::new().unwrap();
        let (config_path, _) = config_file(&dir);
        let mut out = Vec::new();

        let installed = run(&config_path, Answers::Defaults, &mut out).unwrap();
        assert_eq!(installed.config_path, config_path);

        let raw = fs::read_to_string(&config_path).unwrap();
        assert!(raw.contains("static_dir = \"/usr/share/pilot-drive/web\""));

        let settings: Value = serde_json::from_str(&fs::read_to_string(&installed.settings_path).unwrap()).unwrap();
        assert_eq!(settings["vehicle"]["enabled"], false);
        assert_eq!(settings["phone"]["type"], Value::Null);
        assert_eq!(settings["camera"]["enabled"], false);
        assert_eq!(settings["camera"]["previewCommand"], "libcamera-hello -t 0");
    }

    #[test]
    fn interactive_answers_are_applied() {
        let dir = TempDir::new().unwrap();
        let (config_path, settings_path) = config_file(&dir);
        let answers = format!(
            "9000\n\n\n{}\ny\n/dev/ttyACM0\nyes\nANDROID\ny\n17\n",
            settings_path.display()
        );
        let mut input = Cursor::new(answers.into_bytes());
        let mut out = Vec::new();

        run(&config_path, Answers::Interactive(&mut input), &mut out).unwrap();

        let cfg = config::load_from(&config_path).unwrap();
        assert_eq!(cfg.ws_port, 9000);
        let settings: Value = serde_json::from_str(&fs::read_to_string(&settings_path).unwrap()).unwrap();
        assert_eq!(settings["vehicle"]["enabled"], true);
        assert_eq!(settings["vehicle"]["port"], "/dev/ttyACM0");
        assert!(settings["vehicle"]["stats"].as_array().is_some_and(|s| !s.is_empty()));
        assert_eq!(settings["phone"], json!({"enabled": true, "type": "android"}));
        assert_eq!(settings["camera"]["buttonPin"], 17);
    }

    #[test]
    fn invalid_number_keeps_default() {
        let mut input = Cursor::new(b"eighty\n".to_vec());
        let mut answers = Answers::Interactive(&mut input);
        let mut out = Vec::new();
        assert_eq!(prompt_parsed(&mut answers, &mut out, "port", 8000u16).unwrap(), 8000);
        assert!(String::from_utf8_lossy(&out).contains("not valid"));
    }

    #[test]
    fn yes_no_accepts_words_and_falls_back() {
        let mut input = Cursor::new(b"YES\nmaybe\n\n".to_vec());
        let mut answers = Answers::Interactive(&mut input);
        let mut out = Vec::new();
        assert!(prompt_yes_no(&mut answers, &mut out, "a", false).unwrap());
        assert!(!prompt_yes_no(&mut answers, &mut out, "b", false).unwrap());
        assert!(prompt_yes_no(&mut answers, &mut out, "c", true).unwrap());
    }

    /// A terminal that has gone away.
    struct ClosedOutput;

    impl Write for ClosedOutput {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "terminal closed"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_failure_aborts_before_saving() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("pilot-drive.toml");
        let result = run(&config_path, Answers::Defaults, &mut ClosedOutput);
        assert!(matches!(result, Err(PilotError::Io(_))));
        assert!(!config_path.exists());
    }
}
