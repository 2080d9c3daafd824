//! Test doubles shared by the tapdp crates.
//!
//! [`FakeTapCtl`] simulates `tap-ctl` in memory: it hands out pids and
//! minors, tracks which image each tapdisk has open and whether it is paused,
//! prints `list` output in tap-ctl's format and records every invocation.
//! Failures can be injected per command.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use tapdp_tapdisk::tapdisk::BLKTAP2_PREFIX;
use tapdp_tapdisk::{ControlTool, TapdiskError};

/// State of one simulated tapdisk process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeProcess {
    pub pid: u32,
    pub minor: Option<u32>,
    /// `driver:path` as passed to `open -a`.
    pub image: Option<String>,
    pub direct_io: bool,
    pub paused: bool,
    pub secondary: Option<String>,
}

#[derive(Debug)]
struct FakeState {
    next_pid: u32,
    next_minor: u32,
    processes: BTreeMap<u32, FakeProcess>,
    calls: Vec<String>,
    failures: HashMap<String, (i32, String)>,
    allocate_output: Option<String>,
    terminated: Vec<u32>,
}

/// In-memory `tap-ctl`.
#[derive(Debug)]
pub struct FakeTapCtl {
    device_prefix: String,
    state: Mutex<FakeState>,
}

impl Default for FakeTapCtl {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTapCtl {
    pub fn new() -> Self {
        Self::with_device_prefix(BLKTAP2_PREFIX)
    }

    pub fn with_device_prefix(prefix: &str) -> Self {
        Self {
            device_prefix: prefix.to_string(),
            state: Mutex::new(FakeState {
                next_pid: 1000,
                next_minor: 0,
                processes: BTreeMap::new(),
                calls: Vec::new(),
                failures: HashMap::new(),
                allocate_output: None,
                terminated: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every invocation of `command` exit with `exit_code`.
    pub fn fail_on(&self, command: &str, exit_code: i32, stderr: &str) {
        self.state()
            .failures
            .insert(command.to_string(), (exit_code, stderr.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Replace what `allocate` prints.
    pub fn set_allocate_output(&self, output: &str) {
        self.state().allocate_output = Some(output.to_string());
    }

    /// Every invocation so far, arguments joined by spaces.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn processes(&self) -> Vec<FakeProcess> {
        self.state().processes.values().cloned().collect()
    }

    pub fn process(&self, pid: u32) -> Option<FakeProcess> {
        self.state().processes.get(&pid).cloned()
    }

    /// Pids that received SIGQUIT through [`ControlTool::terminate`].
    pub fn terminated(&self) -> Vec<u32> {
        self.state().terminated.clone()
    }

    /// Simulate a tapdisk dying behind the manager's back.
    pub fn crash(&self, pid: u32) {
        self.state().processes.remove(&pid);
    }
}

fn failure(args: &[&str], exit_code: i32, stderr: &str) -> TapdiskError {
    TapdiskError::ToolInvocation {
        command: format!("tap-ctl {}", args.join(" ")),
        exit_code: Some(exit_code),
        stderr: stderr.to_string(),
    }
}

fn flag<'a>(args: &[&'a str], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| *arg == name)
        .and_then(|i| args.get(i + 1).copied())
}

fn target<'s>(
    state: &'s mut FakeState,
    args: &[&str],
) -> Result<&'s mut FakeProcess, TapdiskError> {
    let pid: u32 = flag(args, "-p")
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| failure(args, 22, "missing -p"))?;
    let minor: u32 = flag(args, "-m")
        .and_then(|m| m.parse().ok())
        .ok_or_else(|| failure(args, 22, "missing -m"))?;
    match state.processes.get_mut(&pid) {
        Some(process) if process.minor == Some(minor) || args[0] == "attach" => Ok(process),
        _ => Err(failure(args, 2, "no such tapdisk")),
    }
}

impl ControlTool for FakeTapCtl {
    fn run(&self, args: &[&str]) -> Result<String, TapdiskError> {
        let mut state = self.state();
        state.calls.push(args.join(" "));

        let command = args.first().copied().unwrap_or_default();
        if let Some((code, stderr)) = state.failures.get(command).cloned() {
            return Err(failure(args, code, &stderr));
        }

        match command {
            "spawn" => {
                let pid = state.next_pid;
                state.next_pid += 1;
                state.processes.insert(
                    pid,
                    FakeProcess {
                        pid,
                        minor: None,
                        image: None,
                        direct_io: true,
                        paused: false,
                        secondary: None,
                    },
                );
                Ok(format!("{}\n", pid))
            }
            "allocate" => {
                if let Some(output) = state.allocate_output.clone() {
                    return Ok(output);
                }
                let minor = state.next_minor;
                state.next_minor += 1;
                Ok(format!("{}{}\n", self.device_prefix, minor))
            }
            "attach" => {
                let minor = flag(args, "-m").and_then(|m| m.parse().ok());
                let process = target(&mut state, args)?;
                process.minor = minor;
                Ok(String::new())
            }
            "open" => {
                let image = flag(args, "-a")
                    .ok_or_else(|| failure(args, 22, "missing -a"))?
                    .to_string();
                let direct_io = !args.contains(&"-D");
                let process = target(&mut state, args)?;
                if process.image.is_some() {
                    return Err(failure(args, 16, "device busy"));
                }
                process.image = Some(image);
                process.direct_io = direct_io;
                Ok(String::new())
            }
            "close" => {
                let process = target(&mut state, args)?;
                if process.image.take().is_none() {
                    return Err(failure(args, 22, "no image open"));
                }
                Ok(String::new())
            }
            "pause" => {
                target(&mut state, args)?.paused = true;
                Ok(String::new())
            }
            "unpause" => {
                let secondary = flag(args, "-2").map(str::to_string);
                let process = target(&mut state, args)?;
                process.paused = false;
                process.secondary = secondary;
                Ok(String::new())
            }
            "destroy" => {
                let pid = target(&mut state, args)?.pid;
                state.processes.remove(&pid);
                Ok(String::new())
            }
            "list" => {
                let mut out = String::new();
                for process in state.processes.values() {
                    let minor = process
                        .minor
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "-1".to_string());
                    out.push_str(&format!(
                        "pid={} minor={} state={}",
                        process.pid,
                        minor,
                        if process.paused { 1 } else { 0 }
                    ));
                    if let Some(image) = &process.image {
                        out.push_str(&format!(" args={}", image));
                    }
                    out.push('\n');
                }
                Ok(out)
            }
            _ => Err(failure(args, 22, "unknown command")),
        }
    }

    fn terminate(&self, pid: u32) -> Result<(), TapdiskError> {
        let mut state = self.state();
        state.terminated.push(pid);
        match state.processes.remove(&pid) {
            Some(_) => Ok(()),
            None => Err(TapdiskError::Signal {
                pid,
                source: nix::Error::ESRCH,
            }),
        }
    }
}
