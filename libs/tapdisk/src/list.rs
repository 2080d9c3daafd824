//! Parser for `tap-ctl list` output.
//!
//! Each line describes one tapdisk:
//!
//! ```text
//! pid=4242 minor=3 state=0 args=vhd:/dev/VG_XenStorage-1/volume-1
//! ```
//!
//! tap-ctl lists tapdisks that are only partly set up (no minor yet, no
//! image yet), and its output has changed between versions. Lines are
//! therefore parsed field by field and anything unrecognised is left absent
//! instead of failing the whole listing.

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::image::ImageDescriptor;
use crate::tapdisk::Tapdisk;

/// One tapdisk as reported by `tap-ctl list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListedTapdisk {
    pub pid: Option<u32>,
    pub minor: Option<u32>,
    pub image: Option<ImageDescriptor>,
}

impl ListedTapdisk {
    /// Whether this tapdisk has `path` open. `path` must already be canonical.
    pub fn serves(&self, path: &Path) -> bool {
        self.image.as_ref().is_some_and(|image| image.path == path)
    }

    /// Whether this entry is the tapdisk identified by `pid` and `minor`.
    pub fn is(&self, pid: u32, minor: Option<u32>) -> bool {
        self.pid == Some(pid) && (minor.is_none() || self.minor == minor)
    }

    /// Convert to a lifecycle handle. Entries without a pid cannot be driven.
    pub fn into_tapdisk(self) -> Option<Tapdisk> {
        let pid = self.pid?;
        let mut tapdisk = Tapdisk::new(pid, self.minor);
        tapdisk.image = self.image;
        Some(tapdisk)
    }
}

/// Parse a single line of `tap-ctl list` output.
///
/// Returns `None` only for blank lines.
pub fn parse_line(line: &str) -> Option<ListedTapdisk> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }

    let mut listed = ListedTapdisk {
        pid: prefixed_number(tokens[0], "pid="),
        ..Default::default()
    };

    if let Some(token) = tokens.get(1) {
        listed.minor = prefixed_number(token, "minor=");
    }

    if tokens.len() >= 4 {
        listed.image = line
            .split_once("args=")
            .and_then(|(_, args)| ImageDescriptor::from_tool_arg(args.trim()));
    }

    Some(listed)
}

/// Parse the full output of `tap-ctl list`.
pub fn parse_list(output: &str) -> Vec<ListedTapdisk> {
    let listed: Vec<ListedTapdisk> = output.lines().filter_map(parse_line).collect();
    debug!(count = listed.len(), "Parsed tap-ctl list output");
    listed
}

fn prefixed_number(token: &str, prefix: &str) -> Option<u32> {
    token.strip_prefix(prefix)?.parse().ok()
}
