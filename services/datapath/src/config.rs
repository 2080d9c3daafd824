//! Configuration for the datapath.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use tapdp_tapdisk::control::DEFAULT_TAP_CTL;
use tapdp_tapdisk::tapdisk::BLKTAP2_PREFIX;

/// How volumes are made available before a tapdisk is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationMode {
    /// Volumes are LVM logical volumes that need activating.
    Lvm,
    /// Volumes are plain files; nothing to activate.
    None,
}

impl FromStr for ActivationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lvm" => Ok(Self::Lvm),
            "none" => Ok(Self::None),
            other => Err(format!("unknown activation mode '{}' (expected lvm or none)", other)),
        }
    }
}

impl fmt::Display for ActivationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lvm => f.write_str("lvm"),
            Self::None => f.write_str("none"),
        }
    }
}

/// Datapath configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the tap-ctl binary.
    pub tap_ctl: PathBuf,

    /// Path to the vhd-util binary (parent lookup).
    pub vhd_util: PathBuf,

    /// Path to the lvm binary.
    pub lvm: PathBuf,

    /// Root of the per-volume tapdisk records.
    pub metadata_dir: PathBuf,

    /// Per-VG scsid files and parent activation markers live under here.
    pub run_dir: PathBuf,

    /// Block device prefix tap-ctl allocates under.
    pub device_prefix: String,

    /// Volume activation mode.
    pub activation: ActivationMode,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tap_ctl: PathBuf::from(DEFAULT_TAP_CTL),
            vhd_util: PathBuf::from("/usr/bin/vhd-util"),
            lvm: PathBuf::from("/sbin/lvm"),
            metadata_dir: PathBuf::from("/var/run/nonpersistent/dp-tapdisk"),
            run_dir: PathBuf::from("/var/run/nonpersistent"),
            device_prefix: BLKTAP2_PREFIX.to_string(),
            activation: ActivationMode::Lvm,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let activation = match lookup("TAPDP_ACTIVATION") {
            Some(mode) => mode
                .parse()
                .map_err(anyhow::Error::msg)
                .context("invalid TAPDP_ACTIVATION")?,
            None => defaults.activation,
        };

        Ok(Self {
            tap_ctl: lookup("TAPDP_TAP_CTL")
                .map(PathBuf::from)
                .unwrap_or(defaults.tap_ctl),
            vhd_util: lookup("TAPDP_VHD_UTIL")
                .map(PathBuf::from)
                .unwrap_or(defaults.vhd_util),
            lvm: lookup("TAPDP_LVM").map(PathBuf::from).unwrap_or(defaults.lvm),
            metadata_dir: lookup("TAPDP_METADATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.metadata_dir),
            run_dir: lookup("TAPDP_RUN_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.run_dir),
            device_prefix: lookup("TAPDP_DEVICE_PREFIX").unwrap_or(defaults.device_prefix),
            activation,
            log_level: lookup("TAPDP_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }
}
