//! Volume activation.
//!
//! Before a tapdisk can open a volume on shared LVM storage the logical
//! volume has to be active on this host, and for a VHD its parent too. The
//! LVM and vhd-util work sits behind small traits so the activation sequence
//! can be tested without either tool.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tapdp_tapdisk::{run_command, ImageFormat, TapdiskError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// File under `<run_dir>/<vg>/` holding the SCSI id of the VG's device.
pub const SCSID_FILE: &str = "scsid";

/// Directory of SCSI-id named device links.
const BY_SCSID: &str = "/dev/disk/by-scsid";

/// Length of a parent LV name (a UUID) at the end of vhd-util output.
const PARENT_NAME_LEN: usize = 36;

/// Volume activation errors.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("{} is not a logical volume path (/dev/<vg>/<lv>)", .0.display())]
    NotLogicalVolume(PathBuf),

    #[error("failed to read scsid from {}: {source}", .path.display())]
    Scsid {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("logical volume {lv} not found in volume group {vg}")]
    LogicalVolumeNotFound { vg: String, lv: String },

    #[error(transparent)]
    Tool(#[from] TapdiskError),

    #[error("unexpected output from {command}: {output:?}")]
    UnexpectedOutput { command: String, output: String },

    #[error("failed to create activation marker {}: {source}", .path.display())]
    Marker {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ActivationError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ActivationError::NotLogicalVolume(_) => "not_logical_volume",
            ActivationError::Scsid { .. } => "scsid_unreadable",
            ActivationError::LogicalVolumeNotFound { .. } => "logical_volume_not_found",
            ActivationError::Tool(_) => "activation_tool_failed",
            ActivationError::UnexpectedOutput { .. } => "unexpected_tool_output",
            ActivationError::Marker { .. } => "activation_marker_failed",
        }
    }
}

/// Makes a volume available to open.
pub trait VolumeActivator: Send + Sync {
    fn activate(&self, path: &Path, format: ImageFormat) -> Result<(), ActivationError>;
}

/// For volumes that are plain files.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopActivator;

impl VolumeActivator for NoopActivator {
    fn activate(&self, path: &Path, _format: ImageFormat) -> Result<(), ActivationError> {
        debug!(path = %path.display(), "Activation disabled; nothing to do");
        Ok(())
    }
}

/// Access mode for a volume group. Activation only ever reads VG metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenMode::Read => f.write_str("r"),
        }
    }
}

/// Entry point to LVM.
pub trait VolumeGroups: Send + Sync {
    /// Open `vg` on the device with SCSI id `scsid`.
    fn open(&self, vg: &str, mode: OpenMode, scsid: &str) -> Result<Box<dyn VolumeGroup>, ActivationError>;
}

pub trait VolumeGroup {
    fn resolve(&self, lv: &str) -> Result<Box<dyn LogicalVolume>, ActivationError>;

    fn close(self: Box<Self>) -> Result<(), ActivationError>;
}

pub trait LogicalVolume {
    fn name(&self) -> &str;

    fn activate(&self) -> Result<(), ActivationError>;
}

/// Finds the parent of a layered image.
pub trait ParentLocator: Send + Sync {
    /// Name of the parent LV, or `None` for an image without a parent.
    fn parent_of(&self, path: &Path) -> Result<Option<String>, ActivationError>;
}

/// LVM through the `lvm` command.
///
/// Every command is restricted to the VG's device with `--devices`, and
/// read-only opens add `--readonly` to the queries.
#[derive(Debug, Clone)]
pub struct LvmCommand {
    program: PathBuf,
}

impl LvmCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl VolumeGroups for LvmCommand {
    fn open(&self, vg: &str, mode: OpenMode, scsid: &str) -> Result<Box<dyn VolumeGroup>, ActivationError> {
        let group = LvmVolumeGroup {
            program: self.program.clone(),
            vg: vg.to_string(),
            device: format!("{}/{}", BY_SCSID, scsid),
            mode,
        };
        let output = group.query(&["vgs", "--noheadings", "-o", "vg_name", vg])?;
        if output.trim() != vg {
            return Err(ActivationError::UnexpectedOutput {
                command: "vgs".to_string(),
                output,
            });
        }
        debug!(vg = %vg, mode = %mode, device = %group.device, "Opened volume group");
        Ok(Box::new(group))
    }
}

struct LvmVolumeGroup {
    program: PathBuf,
    vg: String,
    device: String,
    mode: OpenMode,
}

impl LvmVolumeGroup {
    fn query(&self, args: &[&str]) -> Result<String, ActivationError> {
        let mut args = args.to_vec();
        args.extend(["--devices", self.device.as_str()]);
        match self.mode {
            OpenMode::Read => args.push("--readonly"),
        }
        Ok(run_command(&self.program, &args)?)
    }
}

impl VolumeGroup for LvmVolumeGroup {
    fn resolve(&self, lv: &str) -> Result<Box<dyn LogicalVolume>, ActivationError> {
        let target = format!("{}/{}", self.vg, lv);
        let found = match self.query(&["lvs", "--noheadings", "-o", "lv_name", &target]) {
            Ok(output) => output.trim() == lv,
            Err(ActivationError::Tool(TapdiskError::ToolInvocation { .. })) => false,
            Err(e) => return Err(e),
        };
        if !found {
            return Err(ActivationError::LogicalVolumeNotFound {
                vg: self.vg.clone(),
                lv: lv.to_string(),
            });
        }
        Ok(Box::new(LvmLogicalVolume {
            program: self.program.clone(),
            target,
            name: lv.to_string(),
            device: self.device.clone(),
        }))
    }

    fn close(self: Box<Self>) -> Result<(), ActivationError> {
        // Nothing is held between lvm invocations.
        debug!(vg = %self.vg, "Closed volume group");
        Ok(())
    }
}

struct LvmLogicalVolume {
    program: PathBuf,
    target: String,
    name: String,
    device: String,
}

impl LogicalVolume for LvmLogicalVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn activate(&self) -> Result<(), ActivationError> {
        run_command(
            &self.program,
            &["lvchange", "-ay", &self.target, "--devices", &self.device],
        )?;
        Ok(())
    }
}

/// `vhd-util query -n <path> -P`.
#[derive(Debug, Clone)]
pub struct VhdUtil {
    program: PathBuf,
}

impl VhdUtil {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ParentLocator for VhdUtil {
    fn parent_of(&self, path: &Path) -> Result<Option<String>, ActivationError> {
        let path = path.to_string_lossy();
        let output = run_command(&self.program, &["query", "-n", &path, "-P"])?;
        parse_parent(&output)
    }
}

/// Parent LV name from `vhd-util query -P` output.
///
/// An image without a parent reports "... has no parent". Otherwise the
/// output ends with the parent's device path, whose last 36 characters,
/// once device-mapper's doubled dashes are folded, are the parent LV name.
pub fn parse_parent(output: &str) -> Result<Option<String>, ActivationError> {
    let output = output.trim_end();
    if output.ends_with("parent") {
        return Ok(None);
    }

    let folded = output.replace("--", "-");
    let start = folded
        .char_indices()
        .rev()
        .nth(PARENT_NAME_LEN - 1)
        .map(|(i, _)| i)
        .ok_or_else(|| ActivationError::UnexpectedOutput {
            command: "vhd-util query".to_string(),
            output: output.to_string(),
        })?;
    Ok(Some(folded[start..].to_string()))
}

/// Activates `/dev/<vg>/<lv>` volumes, and the parent LV of VHDs.
///
/// A parent is activated once per host: a marker file named after it under
/// `<run_dir>/<vg>/` records that it has been done.
pub struct LvmActivator {
    groups: Arc<dyn VolumeGroups>,
    parents: Arc<dyn ParentLocator>,
    run_dir: PathBuf,
}

impl LvmActivator {
    pub fn new(
        groups: Arc<dyn VolumeGroups>,
        parents: Arc<dyn ParentLocator>,
        run_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            groups,
            parents,
            run_dir: run_dir.into(),
        }
    }

    /// Split `/dev/<vg>/<lv>` into its VG and LV names.
    pub fn split_path(path: &Path) -> Result<(String, String), ActivationError> {
        let not_lv = || ActivationError::NotLogicalVolume(path.to_path_buf());

        let names: Vec<&str> = path
            .components()
            .map(|component| match component {
                Component::RootDir => Some("/"),
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect::<Option<_>>()
            .ok_or_else(not_lv)?;
        match names.as_slice() {
            ["/", "dev", vg, lv] => Ok((vg.to_string(), lv.to_string())),
            _ => Err(not_lv()),
        }
    }

    fn scsid(&self, vg: &str) -> Result<String, ActivationError> {
        let path = self.run_dir.join(vg).join(SCSID_FILE);
        let scsid = fs::read_to_string(&path).map_err(|source| ActivationError::Scsid {
            path: path.clone(),
            source,
        })?;
        Ok(scsid.trim().to_string())
    }

    /// Open the VG, activate one LV, close the VG.
    fn activate_lv(&self, vg: &str, lv: &str, scsid: &str) -> Result<(), ActivationError> {
        let group = self.groups.open(vg, OpenMode::Read, scsid)?;
        let result = group.resolve(lv).and_then(|volume| {
            volume.activate()?;
            info!(vg = %vg, lv = %volume.name(), "Activated logical volume");
            Ok(())
        });
        match (result, group.close()) {
            (Err(e), close) => {
                if let Err(close_err) = close {
                    warn!(vg = %vg, error = %close_err, "Failed to close volume group");
                }
                Err(e)
            }
            (Ok(()), close) => close,
        }
    }

    fn activate_parent(&self, path: &Path, vg: &str, scsid: &str) -> Result<(), ActivationError> {
        let Some(parent) = self.parents.parent_of(path)? else {
            debug!(path = %path.display(), "Image has no parent");
            return Ok(());
        };

        let marker = self.run_dir.join(vg).join(&parent);
        if marker.exists() {
            debug!(vg = %vg, parent = %parent, "Parent already activated");
            return Ok(());
        }

        self.activate_lv(vg, &parent, scsid)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&marker)
            .map_err(|source| ActivationError::Marker {
                path: marker.clone(),
                source,
            })?;
        Ok(())
    }
}

impl VolumeActivator for LvmActivator {
    fn activate(&self, path: &Path, format: ImageFormat) -> Result<(), ActivationError> {
        let (vg, lv) = Self::split_path(path)?;
        let scsid = self.scsid(&vg)?;
        debug!(vg = %vg, lv = %lv, scsid = %scsid, "Activating volume");

        self.activate_lv(&vg, &lv, &scsid)?;
        if format == ImageFormat::Vhd {
            self.activate_parent(path, &vg, &scsid)?;
        }
        Ok(())
    }
}
