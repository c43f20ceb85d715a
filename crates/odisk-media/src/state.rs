use std::fmt;

use serde::Serialize;

/// Readiness of a disk's medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiskState {
    /// Medium present and readable.
    Ready,
    /// Drive present but the medium is spinning up or busy.
    NotReady,
    /// Drive tray is mechanically open.
    Open,
    /// No medium present.
    Empty,
}

impl DiskState {
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::NotReady => "NOT_READY",
            Self::Open => "OPEN",
            Self::Empty => "EMPTY",
        }
    }
}

impl fmt::Display for DiskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
