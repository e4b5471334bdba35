//! Thin wrapper over `std::process::Command` for the CLI tools several
//! integrations drive (`playerctl`, `bluetoothctl`, `adb`, preview and
//! install commands).

use std::process::{Command, Stdio};

use pilot_types::PilotError;
use tracing::trace;

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    /// stdout followed by stderr, the way a shell shows them.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        text
    }
}

/// Run `program args…` to completion.
///
/// # Errors
///
/// [`PilotError::Hardware`] attributed to `component` when the program cannot
/// be started at all (usually: not installed).  A non-zero exit status is
/// not an error here; inspect [`Output::success`].
pub fn run(component: &str, program: &str, args: &[&str]) -> Result<Output, PilotError> {
    trace!(component, program, ?args, "exec");
    let out = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| PilotError::hardware(component, format!("failed to run {program}: {e}")))?;
    Ok(Output {
        success: out.status.success(),
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    })
}

/// Run a command and require a zero exit status.
pub fn run_checked(component: &str, program: &str, args: &[&str]) -> Result<String, PilotError> {
    let out = run(component, program, args)?;
    if out.success {
        Ok(out.stdout)
    } else {
        Err(PilotError::hardware(
            component,
            format!("{program} {} failed: {}", args.join(" "), out.combined().trim()),
        ))
    }
}

/// Split a configured command line into program and arguments on
/// whitespace.  No quoting rules.
pub fn split_command_line(line: &str) -> Option<(String, Vec<String>)> {
    let mut parts = line.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}
