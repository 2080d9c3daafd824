//! The datapath operations.
//!
//! Each operation takes a volume URI, works out which tapdisk serves the
//! volume from its record, drives the tapdisk and writes the record back.
//! Operations on the same URI must be serialised by the caller.

use std::path::PathBuf;
use std::sync::Arc;

use serde::ser::SerializeTuple;
use serde::{Serialize, Serializer};
use tapdp_tapdisk::{
    ImageDescriptor, ListedTapdisk, TapCtl, Tapdisk, TapdiskManager, TapdiskPaths,
};
use tracing::{debug, info, warn};

use crate::config::{ActivationMode, Config};
use crate::error::DatapathError;
use crate::metadata::{FileMetadataStore, MetadataError, MetadataStore, TapdiskRecord};
use crate::uri::VolumeUri;
use crate::volume::{LvmActivator, LvmCommand, NoopActivator, VhdUtil, VolumeActivator};

/// Result alias for datapath operations.
pub type Result<T> = std::result::Result<T, DatapathError>;

/// How the guest reaches an attached volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Implementation {
    /// A tapdisk block device.
    Tapdisk3(PathBuf),
}

impl Serialize for Implementation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Implementation::Tapdisk3(device) => {
                let mut tuple = serializer.serialize_tuple(2)?;
                tuple.serialize_element("Tapdisk3")?;
                tuple.serialize_element(device)?;
                tuple.end()
            }
        }
    }
}

/// Returned by attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachInfo {
    /// Backend domain serving the device; always dom0.
    pub domain_uuid: String,
    pub implementation: Implementation,
}

impl AttachInfo {
    fn tapdisk3(device: PathBuf) -> Self {
        Self {
            domain_uuid: "0".to_string(),
            implementation: Implementation::Tapdisk3(device),
        }
    }
}

/// Volume lifecycle on top of tapdisks and their records.
pub struct Datapath {
    tapdisks: TapdiskManager,
    store: Arc<dyn MetadataStore>,
    activator: Arc<dyn VolumeActivator>,
}

impl Datapath {
    pub fn new(
        tapdisks: TapdiskManager,
        store: Arc<dyn MetadataStore>,
        activator: Arc<dyn VolumeActivator>,
    ) -> Self {
        Self {
            tapdisks,
            store,
            activator,
        }
    }

    /// Wire up the real tools and the file-backed store.
    pub fn from_config(config: &Config) -> Self {
        let paths = TapdiskPaths::default().with_device_prefix(config.device_prefix.clone());
        let tapdisks =
            TapdiskManager::new(Arc::new(TapCtl::new(config.tap_ctl.clone()))).with_paths(paths);
        let store = Arc::new(FileMetadataStore::new(config.metadata_dir.clone()));
        let activator: Arc<dyn VolumeActivator> = match config.activation {
            ActivationMode::Lvm => Arc::new(LvmActivator::new(
                Arc::new(LvmCommand::new(config.lvm.clone())),
                Arc::new(VhdUtil::new(config.vhd_util.clone())),
                config.run_dir.clone(),
            )),
            ActivationMode::None => Arc::new(NoopActivator),
        };
        Self::new(tapdisks, store, activator)
    }

    pub fn tapdisks(&self) -> &TapdiskManager {
        &self.tapdisks
    }

    /// Activate the volume and give it a fresh tapdisk with a block device.
    ///
    /// No image is opened yet. Every attach spawns a new tapdisk; attaching
    /// a volume twice is a caller error.
    pub fn attach(&self, uri: &str, domain: &str) -> Result<AttachInfo> {
        let uri = existing_volume(uri)?;
        let volume_id = uri.volume_id();
        let format = uri.image_format()?;
        let direct_io = uri.direct_io().unwrap_or(true);

        self.activator.activate(uri.path(), format)?;
        let tapdisk = self.tapdisks.spawn()?;
        let device = self.tapdisks.block_device(&tapdisk)?;

        let record = TapdiskRecord::new(tapdisk, direct_io);
        if let Err(e) = self.store.save(&volume_id, &record) {
            if let Err(destroy_err) = self.tapdisks.destroy(&record.tapdisk) {
                warn!(
                    volume = %volume_id,
                    pid = record.tapdisk.pid,
                    error = %destroy_err,
                    "Failed to destroy tapdisk after failing to record it"
                );
            }
            return Err(e.into());
        }

        info!(
            volume = %volume_id,
            domain = %domain,
            pid = record.tapdisk.pid,
            device = %device.display(),
            "Volume attached"
        );
        Ok(AttachInfo::tapdisk3(device))
    }

    /// Open the volume's image in its tapdisk.
    ///
    /// `o_direct` in the URI overrides the preference given at attach.
    pub fn activate(&self, uri: &str, domain: &str) -> Result<()> {
        let uri = existing_volume(uri)?;
        let volume_id = uri.volume_id();
        let image = ImageDescriptor::new(uri.path(), uri.image_format()?);

        let mut record = self.store.load(&volume_id)?;
        self.reconcile(&volume_id, &mut record)?;

        if record.tapdisk.image.as_ref() == Some(&image) {
            debug!(volume = %volume_id, "Image already open");
            return Ok(());
        }

        let direct_io = uri.direct_io().unwrap_or(record.direct_io);
        self.tapdisks.open(&mut record.tapdisk, image, direct_io)?;
        self.store.save(&volume_id, &record)?;

        info!(
            volume = %volume_id,
            domain = %domain,
            pid = record.tapdisk.pid,
            direct_io = direct_io,
            "Volume activated"
        );
        Ok(())
    }

    /// Close the image but keep the tapdisk and its record.
    pub fn deactivate(&self, uri: &str, domain: &str) -> Result<()> {
        let uri = VolumeUri::parse(uri)?;
        let volume_id = uri.volume_id();

        let mut record = self.store.load(&volume_id)?;
        self.reconcile(&volume_id, &mut record)?;

        if record.tapdisk.image.is_none() {
            debug!(volume = %volume_id, "No image open");
            return Ok(());
        }

        self.tapdisks.close(&mut record.tapdisk)?;
        self.store.save(&volume_id, &record)?;

        info!(
            volume = %volume_id,
            domain = %domain,
            pid = record.tapdisk.pid,
            "Volume deactivated"
        );
        Ok(())
    }

    /// Destroy the tapdisk and forget the record.
    ///
    /// A volume without a record is already detached. A record whose tapdisk
    /// has gone away is forgotten.
    pub fn detach(&self, uri: &str, domain: &str) -> Result<()> {
        let uri = VolumeUri::parse(uri)?;
        let volume_id = uri.volume_id();

        let record = match self.store.load(&volume_id) {
            Ok(record) => record,
            Err(MetadataError::RecordNotFound { .. }) => {
                debug!(volume = %volume_id, "No record; already detached");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if self.tapdisks.is_live(&record.tapdisk)? {
            self.tapdisks.destroy(&record.tapdisk)?;
        } else {
            warn!(
                volume = %volume_id,
                pid = record.tapdisk.pid,
                minor = ?record.tapdisk.minor,
                "Recorded tapdisk is not running; forgetting record"
            );
        }
        self.store.forget(&volume_id)?;

        info!(
            volume = %volume_id,
            domain = %domain,
            pid = record.tapdisk.pid,
            "Volume detached"
        );
        Ok(())
    }

    /// Check that the volume exists.
    pub fn open(&self, uri: &str, persistent: bool) -> Result<()> {
        let uri = existing_volume(uri)?;
        debug!(volume = %uri.volume_id(), persistent = persistent, "Volume opened");
        Ok(())
    }

    /// Check that the volume exists.
    pub fn close(&self, uri: &str) -> Result<()> {
        let uri = existing_volume(uri)?;
        debug!(volume = %uri.volume_id(), "Volume closed");
        Ok(())
    }

    /// The volume's record.
    pub fn record(&self, uri: &str) -> Result<TapdiskRecord> {
        let uri = VolumeUri::parse(uri)?;
        Ok(self.store.load(&uri.volume_id())?)
    }

    /// Check the recorded tapdisk is running and bring the record's image
    /// in line with what the process has open.
    ///
    /// The record lags the process when an earlier invocation died between
    /// the tool call and the save.
    fn reconcile(&self, volume_id: &str, record: &mut TapdiskRecord) -> Result<()> {
        let live = self.live_entry(volume_id, &record.tapdisk)?;
        if live.image == record.tapdisk.image {
            return Ok(());
        }

        warn!(
            volume = %volume_id,
            pid = record.tapdisk.pid,
            recorded = ?record.tapdisk.image,
            live = ?live.image,
            "Record out of date with running tapdisk; updating"
        );
        record.tapdisk.image = live.image;
        self.store.save(volume_id, record)?;
        Ok(())
    }

    fn live_entry(&self, volume_id: &str, tapdisk: &Tapdisk) -> Result<ListedTapdisk> {
        self.tapdisks
            .find_live(tapdisk)?
            .ok_or_else(|| DatapathError::StaleRecord {
                volume_id: volume_id.to_string(),
                pid: tapdisk.pid,
                minor: tapdisk.minor,
            })
    }
}

/// Parse `uri` and check its backing path exists.
fn existing_volume(uri: &str) -> Result<VolumeUri> {
    let uri = VolumeUri::parse(uri)?;
    if !uri.path().exists() {
        return Err(DatapathError::VolumeNotFound(uri.path().to_path_buf()));
    }
    Ok(uri)
}
