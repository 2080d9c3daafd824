//! tapdp datapath library.
//!
//! Exposes volumes (VHD or raw images, usually on LVM) to guests as tapdisk
//! block devices, keyed by a volume URI such as
//! `vhd:///dev/VG_XenStorage-1/volume-1?o_direct=false`.
//!
//! ## Lifecycle
//!
//! ```text
//! attach   -> activate LV (and parent), spawn tapdisk, record it
//! activate -> open the image in the recorded tapdisk
//! deactivate -> close the image, keep the tapdisk
//! detach   -> destroy the tapdisk, forget the record
//! ```
//!
//! The per-volume record under the metadata directory is the only state
//! that survives between invocations.
//!
//! ## Modules
//!
//! - `config`: environment-driven configuration
//! - `datapath`: the attach/activate/deactivate/detach/open/close operations
//! - `metadata`: host-local tapdisk records
//! - `uri`: volume URI parsing
//! - `volume`: LVM activation of volumes and their parents

pub mod config;
pub mod datapath;
pub mod error;
pub mod metadata;
pub mod uri;
pub mod volume;

pub use config::{ActivationMode, Config};
pub use datapath::{AttachInfo, Datapath, Implementation};
pub use error::DatapathError;
pub use metadata::{FileMetadataStore, MetadataError, MetadataStore, TapdiskRecord};
pub use uri::VolumeUri;
pub use volume::{LvmActivator, NoopActivator, VolumeActivator};
