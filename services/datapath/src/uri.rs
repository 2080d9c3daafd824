//! Volume URIs.
//!
//! A volume URI names the backing file and its format:
//!
//! ```text
//! vhd:///dev/VG_XenStorage-1/volume-1?o_direct=false
//! raw+file:///srv/images/disk.img
//! ```
//!
//! The scheme prefix (`vhd...` or `raw...`) selects the image format, the
//! path is the backing file and the optional `o_direct` parameter chooses
//! between direct and buffered I/O.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tapdp_tapdisk::ImageFormat;

use crate::error::DatapathError;

/// Values of `o_direct` that select direct I/O. Anything else is buffered.
const TRUTHY: [&str; 5] = ["true", "t", "on", "1", "yes"];

/// A parsed volume URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeUri {
    raw: String,
    scheme: String,
    path: PathBuf,
    query: Vec<(String, String)>,
}

impl VolumeUri {
    pub fn parse(uri: &str) -> Result<Self, DatapathError> {
        let invalid = |reason: &str| DatapathError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = uri.split_once(':').ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty() {
            return Err(invalid("missing scheme"));
        }

        let rest = rest.split_once('#').map_or(rest, |(before, _)| before);
        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, query),
            None => (rest, ""),
        };

        // Skip the authority, if any; only the path names the volume.
        let path = match location.strip_prefix("//") {
            Some(authority_and_path) => authority_and_path
                .find('/')
                .map_or("", |i| &authority_and_path[i..]),
            None => location,
        };
        if path.is_empty() {
            return Err(invalid("missing path"));
        }

        let query = query
            .split('&')
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                // Parameters without a value are ignored.
                (!key.is_empty() && !value.is_empty())
                    .then(|| (key.to_string(), value.to_string()))
            })
            .collect();

        Ok(Self {
            raw: uri.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            path: PathBuf::from(path),
            query,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Key of this volume's tapdisk record.
    pub fn volume_id(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// First value of a query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Image format selected by the scheme prefix.
    pub fn image_format(&self) -> Result<ImageFormat, DatapathError> {
        match self.scheme.get(..3) {
            Some("vhd") => Ok(ImageFormat::Vhd),
            Some("raw") => Ok(ImageFormat::Raw),
            _ => Err(DatapathError::UnsupportedScheme(self.scheme.clone())),
        }
    }

    /// The `o_direct` parameter, if given.
    pub fn direct_io(&self) -> Option<bool> {
        self.param("o_direct").map(|value| TRUTHY.contains(&value))
    }
}

impl FromStr for VolumeUri {
    type Err = DatapathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VolumeUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
