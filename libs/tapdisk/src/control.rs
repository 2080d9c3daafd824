//! Adapter for the `tap-ctl` control tool.
//!
//! Every tapdisk operation is a short-lived `tap-ctl` invocation. Calls block
//! until the tool exits; there is no retry and no timeout here.

use std::path::{Path, PathBuf};
use std::process::Command;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::TapdiskError;

/// Default location of the tap-ctl binary.
pub const DEFAULT_TAP_CTL: &str = "/usr/sbin/tap-ctl";

/// The seam between lifecycle logic and the external control tool.
pub trait ControlTool: Send + Sync {
    /// Run the tool with exactly `args`, returning its standard output.
    fn run(&self, args: &[&str]) -> Result<String, TapdiskError>;

    /// Send SIGQUIT to a tapdisk process.
    ///
    /// Used to reap a tapdisk that was spawned but never got a device.
    fn terminate(&self, pid: u32) -> Result<(), TapdiskError> {
        let raw = i32::try_from(pid).map_err(|_| TapdiskError::Signal {
            pid,
            source: nix::Error::EINVAL,
        })?;
        kill(Pid::from_raw(raw), Signal::SIGQUIT)
            .map_err(|source| TapdiskError::Signal { pid, source })
    }
}

/// `tap-ctl` executed as a subprocess.
#[derive(Debug, Clone)]
pub struct TapCtl {
    program: PathBuf,
}

impl TapCtl {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Default for TapCtl {
    fn default() -> Self {
        Self::new(DEFAULT_TAP_CTL)
    }
}

impl ControlTool for TapCtl {
    fn run(&self, args: &[&str]) -> Result<String, TapdiskError> {
        run_command(&self.program, args)
    }
}

/// Run an external command and return its standard output.
///
/// A non-zero exit becomes [`TapdiskError::ToolInvocation`] carrying the
/// trimmed stderr.
pub fn run_command(program: &Path, args: &[&str]) -> Result<String, TapdiskError> {
    let command = format!("{} {}", program.display(), args.join(" "));
    debug!(command = %command, "Running command");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| TapdiskError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(
            command = %command,
            exit_code = ?output.status.code(),
            stderr = %stderr,
            "Command failed"
        );
        return Err(TapdiskError::ToolInvocation {
            command,
            exit_code: output.status.code(),
            stderr,
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    debug!(command = %command, stdout = %stdout.trim(), "Command succeeded");
    Ok(stdout)
}
