//! Backend command status codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Completion status of one backend command.
///
/// Handlers report these through the command completion; the I/O bridge
/// translates anything other than `Ok` into an `io error` at the
/// filesystem surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmdStatus {
    /// Command completed successfully.
    Ok,
    /// The I/O range falls outside the device.
    Range,
    /// Backend read failure.
    ReadError,
    /// Backend write failure.
    WriteError,
    /// Backend out of resources.
    NoResource,
}

impl CmdStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, CmdStatus::Ok)
    }
}

impl fmt::Display for CmdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmdStatus::Ok => "ok",
            CmdStatus::Range => "range",
            CmdStatus::ReadError => "read error",
            CmdStatus::WriteError => "write error",
            CmdStatus::NoResource => "no resource",
        };
        f.write_str(s)
    }
}
