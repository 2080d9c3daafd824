//! Error types for tapdisk operations.

use std::io;

use thiserror::Error;

use crate::mirror::MirrorError;

/// Errors from driving tapdisks through the control tool.
#[derive(Debug, Error)]
pub enum TapdiskError {
    /// The control tool ran and exited non-zero.
    #[error("{command} exited with {}: {stderr}", exit_display(.exit_code))]
    ToolInvocation {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The control tool could not be executed at all.
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A tapdisk was spawned but could not be given a device minor.
    #[error("tap-ctl allocate returned unexpected output for pid {pid}: {output:?}")]
    Allocation { pid: u32, output: String },

    /// The control tool printed something that is not what the command promises.
    #[error("tap-ctl {command} returned unexpected output: {output:?}")]
    UnexpectedOutput { command: String, output: String },

    /// The operation needs a device minor the tapdisk does not have.
    #[error("tapdisk {pid} has no allocated minor")]
    Unallocated { pid: u32 },

    /// A signal could not be delivered to a tapdisk process.
    #[error("failed to signal tapdisk {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },

    /// Best-effort mirror operation failed.
    #[error("mirror: {0}")]
    Mirror(#[from] MirrorError),
}

impl TapdiskError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            TapdiskError::ToolInvocation { .. } => "tool_invocation_failed",
            TapdiskError::Spawn { .. } => "tool_spawn_failed",
            TapdiskError::Allocation { .. } => "allocation_failed",
            TapdiskError::UnexpectedOutput { .. } => "unexpected_tool_output",
            TapdiskError::Unallocated { .. } => "unallocated",
            TapdiskError::Signal { .. } => "signal_failed",
            TapdiskError::Mirror(_) => "mirror_failed",
        }
    }
}

fn exit_display(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}
