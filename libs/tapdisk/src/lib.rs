//! tapdisk process lifecycle management.
//!
//! A tapdisk is a user-space process that serves a disk image file (raw or
//! VHD) as a kernel block device. This crate drives tapdisks through the
//! `tap-ctl` control tool:
//!
//! ```text
//! spawn -> allocate -> attach -> open -> (pause/unpause)* -> close -> destroy
//! ```
//!
//! ## Modules
//!
//! - `image`: image descriptors and path canonicalisation
//! - `control`: the `tap-ctl` adapter and the `ControlTool` seam
//! - `list`: tolerant parser for `tap-ctl list` output
//! - `tapdisk`: per-process lifecycle operations
//! - `mirror`: descriptor passing to a tapdisk's NBD control sockets
//!
//! Nothing here keeps an in-memory registry of tapdisks. The live set is
//! always recovered from `tap-ctl list`; callers persist what they need.

pub mod control;
pub mod error;
pub mod image;
pub mod list;
pub mod mirror;
pub mod tapdisk;

pub use control::{run_command, ControlTool, TapCtl};
pub use error::TapdiskError;
pub use image::{canonical_path, ImageDescriptor, ImageFormat};
pub use list::{parse_line, parse_list, ListedTapdisk};
pub use mirror::{MirrorChannel, MirrorError, UnixFdChannel, UnsupportedChannel};
pub use tapdisk::{Tapdisk, TapdiskManager, TapdiskPaths};
