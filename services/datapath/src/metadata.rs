//! Host-local tapdisk records.
//!
//! Each attached volume has one record, `<root>/<volume-id>/meta.json`,
//! naming the tapdisk that serves it. Nothing is cached in memory: every
//! operation reads the record it needs, and the record on disk is the only
//! thing that survives a restart.

use std::fs::{self, DirBuilder};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tapdp_tapdisk::{ImageDescriptor, Tapdisk};
use thiserror::Error;
use tracing::debug;

/// File name of a record inside its volume directory.
pub const RECORD_FILE: &str = "meta.json";

/// Schema version written to, and required of, every record.
pub const RECORD_VERSION: u32 = 1;

/// Metadata store errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("no tapdisk record for volume {volume_id}")]
    RecordNotFound { volume_id: String },

    #[error("corrupt tapdisk record for volume {volume_id}: {reason}")]
    CorruptRecord { volume_id: String, reason: String },

    #[error("invalid volume id '{0}'")]
    InvalidVolumeId(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MetadataError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            MetadataError::RecordNotFound { .. } => "record_not_found",
            MetadataError::CorruptRecord { .. } => "corrupt_record",
            MetadataError::InvalidVolumeId(_) => "invalid_volume_id",
            MetadataError::Io { .. } => "metadata_io",
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        MetadataError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What is remembered about a volume's tapdisk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TapdiskRecord {
    pub tapdisk: Tapdisk,
    /// Direct I/O preference given at attach time.
    pub direct_io: bool,
}

impl TapdiskRecord {
    pub fn new(tapdisk: Tapdisk, direct_io: bool) -> Self {
        Self { tapdisk, direct_io }
    }
}

/// On-disk form of a [`TapdiskRecord`].
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    version: u32,
    pid: u32,
    minor: Option<u32>,
    image: Option<ImageDescriptor>,
    secondary: Option<String>,
    direct_io: bool,
    saved_at: DateTime<Utc>,
}

impl From<&TapdiskRecord> for StoredRecord {
    fn from(record: &TapdiskRecord) -> Self {
        Self {
            version: RECORD_VERSION,
            pid: record.tapdisk.pid,
            minor: record.tapdisk.minor,
            image: record.tapdisk.image.clone(),
            secondary: record.tapdisk.secondary.clone(),
            direct_io: record.direct_io,
            saved_at: Utc::now(),
        }
    }
}

impl From<StoredRecord> for TapdiskRecord {
    fn from(stored: StoredRecord) -> Self {
        Self {
            tapdisk: Tapdisk {
                pid: stored.pid,
                minor: stored.minor,
                image: stored.image,
                secondary: stored.secondary,
            },
            direct_io: stored.direct_io,
        }
    }
}

/// Persistence for tapdisk records, keyed by volume id.
pub trait MetadataStore: Send + Sync {
    /// Create or replace the record.
    fn save(&self, volume_id: &str, record: &TapdiskRecord) -> Result<(), MetadataError>;

    fn load(&self, volume_id: &str) -> Result<TapdiskRecord, MetadataError>;

    /// Remove the record. Removing a missing record succeeds.
    fn forget(&self, volume_id: &str) -> Result<(), MetadataError>;
}

/// Records as JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    root: PathBuf,
}

impl FileMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a volume's record.
    ///
    /// Volume ids are usually absolute paths; they are nested under the root
    /// rather than joined, so `/dev/vg/lv` lands in `<root>/dev/vg/lv`.
    pub fn record_dir(&self, volume_id: &str) -> Result<PathBuf, MetadataError> {
        let invalid = || MetadataError::InvalidVolumeId(volume_id.to_string());

        let mut dir = self.root.clone();
        let mut depth = 0;
        for component in Path::new(volume_id).components() {
            match component {
                Component::Normal(part) => {
                    dir.push(part);
                    depth += 1;
                }
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => return Err(invalid()),
            }
        }
        if depth == 0 {
            return Err(invalid());
        }
        Ok(dir)
    }

    fn record_path(&self, volume_id: &str) -> Result<PathBuf, MetadataError> {
        Ok(self.record_dir(volume_id)?.join(RECORD_FILE))
    }
}

impl MetadataStore for FileMetadataStore {
    fn save(&self, volume_id: &str, record: &TapdiskRecord) -> Result<(), MetadataError> {
        let dir = self.record_dir(volume_id)?;
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .map_err(|e| MetadataError::io(&dir, e))?;

        let json = serde_json::to_vec_pretty(&StoredRecord::from(record)).map_err(|e| {
            MetadataError::CorruptRecord {
                volume_id: volume_id.to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| MetadataError::io(&dir, e))?;
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))
            .map_err(|e| MetadataError::io(temp.path(), e))?;
        temp.write_all(&json)
            .map_err(|e| MetadataError::io(temp.path(), e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| MetadataError::io(temp.path(), e))?;

        let path = dir.join(RECORD_FILE);
        temp.persist(&path)
            .map_err(|e| MetadataError::io(&path, e.error))?;

        debug!(
            volume = %volume_id,
            pid = record.tapdisk.pid,
            minor = ?record.tapdisk.minor,
            "Saved tapdisk record"
        );
        Ok(())
    }

    fn load(&self, volume_id: &str) -> Result<TapdiskRecord, MetadataError> {
        let path = self.record_path(volume_id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MetadataError::RecordNotFound {
                    volume_id: volume_id.to_string(),
                });
            }
            Err(e) => return Err(MetadataError::io(&path, e)),
        };

        let corrupt = |reason: String| MetadataError::CorruptRecord {
            volume_id: volume_id.to_string(),
            reason,
        };

        // Check the version before the shape, so a future schema is reported
        // as such rather than as a missing field.
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        match value.get("version").and_then(serde_json::Value::as_u64) {
            Some(version) if version == u64::from(RECORD_VERSION) => {}
            Some(version) => return Err(corrupt(format!("unsupported version {}", version))),
            None => return Err(corrupt("missing version".to_string())),
        }
        let stored: StoredRecord =
            serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;

        Ok(stored.into())
    }

    fn forget(&self, volume_id: &str) -> Result<(), MetadataError> {
        let path = self.record_path(volume_id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(volume = %volume_id, "Forgot tapdisk record");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MetadataError::io(&path, e)),
        }
    }
}
