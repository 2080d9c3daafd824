//! Disk image descriptors.
//!
//! tap-ctl reports the files it serves with symlinks resolved, so every path
//! that is compared against its output goes through [`canonical_path`] first.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// On-disk format of a backing image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Flat file served through the aio driver.
    Raw,
    /// Copy-on-write VHD, possibly with a parent chain.
    Vhd,
}

impl ImageFormat {
    /// Driver prefix used in tap-ctl `-a` arguments and `list` output.
    pub fn driver(&self) -> &'static str {
        match self {
            Self::Raw => "aio",
            Self::Vhd => "vhd",
        }
    }

    fn from_driver(driver: &str) -> Option<Self> {
        match driver {
            "aio" => Some(Self::Raw),
            "vhd" => Some(Self::Vhd),
            _ => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("raw"),
            Self::Vhd => f.write_str("vhd"),
        }
    }
}

/// A backing file and its format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub path: PathBuf,
    pub format: ImageFormat,
}

impl ImageDescriptor {
    /// Create a descriptor, canonicalising the path.
    pub fn new<P: AsRef<Path>>(path: P, format: ImageFormat) -> Self {
        Self {
            path: canonical_path(path),
            format,
        }
    }

    pub fn raw<P: AsRef<Path>>(path: P) -> Self {
        Self::new(path, ImageFormat::Raw)
    }

    pub fn vhd<P: AsRef<Path>>(path: P) -> Self {
        Self::new(path, ImageFormat::Vhd)
    }

    /// Parse a `driver:path` argument as printed by tap-ctl.
    ///
    /// Returns `None` for drivers other than `aio` and `vhd`.
    pub fn from_tool_arg(arg: &str) -> Option<Self> {
        let (driver, path) = arg.split_once(':')?;
        let format = ImageFormat::from_driver(driver)?;
        if path.is_empty() {
            return None;
        }
        Some(Self::new(path, format))
    }

    /// The `driver:path` argument passed to `tap-ctl open -a`.
    pub fn tool_arg(&self) -> String {
        format!("{}:{}", self.format.driver(), self.path.display())
    }
}

impl fmt::Display for ImageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tool_arg())
    }
}

/// Resolve a path to its canonical absolute form.
///
/// Existing paths are resolved through the filesystem. Paths that do not
/// exist (yet, or any more) are normalised lexically against the current
/// directory, so this never fails.
pub fn canonical_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalised = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalised.pop();
            }
            other => normalised.push(other.as_os_str()),
        }
    }
    normalised
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_arg_formatting() {
        let raw = ImageDescriptor::raw("/srv/images/disk.img");
        assert_eq!(raw.tool_arg(), "aio:/srv/images/disk.img");

        let vhd = ImageDescriptor::vhd("/srv/images/disk.vhd");
        assert_eq!(vhd.tool_arg(), "vhd:/srv/images/disk.vhd");
        assert_eq!(vhd.to_string(), vhd.tool_arg());
    }

    #[test]
    fn test_from_tool_arg() {
        let image = ImageDescriptor::from_tool_arg("vhd:/srv/a.vhd").unwrap();
        assert_eq!(image.format, ImageFormat::Vhd);
        assert_eq!(image.path, PathBuf::from("/srv/a.vhd"));

        let image = ImageDescriptor::from_tool_arg("aio:/srv/a.img").unwrap();
        assert_eq!(image.format, ImageFormat::Raw);

        assert!(ImageDescriptor::from_tool_arg("qcow:/srv/a.qcow2").is_none());
        assert!(ImageDescriptor::from_tool_arg("vhd:").is_none());
        assert!(ImageDescriptor::from_tool_arg("/srv/a.vhd").is_none());
    }

    #[test]
    fn test_canonical_path_lexical_fallback() {
        let path = canonical_path("/nonexistent-tapdp/a/./b/../c.vhd");
        assert_eq!(path, PathBuf::from("/nonexistent-tapdp/a/c.vhd"));
    }

    #[test]
    fn test_canonical_path_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("disk.vhd");
        std::fs::write(&target, b"").unwrap();
        let link = dir.path().join("link.vhd");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        assert_eq!(canonical_path(&link), canonical_path(&target));
        assert_eq!(
            canonical_path(dir.path().join("sub/../disk.vhd")),
            canonical_path(&target)
        );
    }

    #[test]
    fn test_format_serde_names() {
        assert_eq!(serde_json::to_string(&ImageFormat::Vhd).unwrap(), "\"vhd\"");
        assert_eq!(serde_json::to_string(&ImageFormat::Raw).unwrap(), "\"raw\"");
    }
}
