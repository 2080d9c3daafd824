//! Error types for datapath operations.

use std::path::PathBuf;

use tapdp_tapdisk::TapdiskError;
use thiserror::Error;

use crate::metadata::MetadataError;
use crate::volume::ActivationError;

/// Datapath errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum DatapathError {
    /// The URI could not be parsed.
    #[error("invalid volume URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// The URI scheme names no known image format.
    #[error("unsupported URI scheme '{0}' (expected vhd* or raw*)")]
    UnsupportedScheme(String),

    /// The volume's backing path does not exist.
    #[error("volume does not exist: {}", .0.display())]
    VolumeNotFound(PathBuf),

    /// The record points at a tapdisk that is no longer running.
    #[error("record for {volume_id} refers to tapdisk pid={pid} minor={minor:?} which is not running")]
    StaleRecord {
        volume_id: String,
        pid: u32,
        minor: Option<u32>,
    },

    #[error(transparent)]
    Tapdisk(#[from] TapdiskError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("volume activation failed: {0}")]
    Activation(#[from] ActivationError),
}

impl DatapathError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DatapathError::InvalidUri { .. } => "invalid_uri",
            DatapathError::UnsupportedScheme(_) => "unsupported_scheme",
            DatapathError::VolumeNotFound(_) => "volume_does_not_exist",
            DatapathError::StaleRecord { .. } => "stale_record",
            DatapathError::Tapdisk(e) => e.reason_code(),
            DatapathError::Metadata(e) => e.reason_code(),
            DatapathError::Activation(e) => e.reason_code(),
        }
    }
}
