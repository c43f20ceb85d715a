use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Errors raised by [`crate::Disk`] operations.
///
/// Range failures are precondition violations of [`crate::Disk::read`]; device failures come from
/// external tools that could not be run, timed out, or printed something we could not interpret.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("end address {end} lies beyond a medium of {size} bytes")]
    RangeOutOfBounds { end: u64, size: u64 },

    #[error("start address exceeds end address {start} > {end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("device query via {tool} failed: {reason}")]
    DeviceQueryFailed { tool: String, reason: String },

    #[error("{0} is not implemented for this medium")]
    NotImplemented(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DiskError {
    pub(crate) fn query_failed(tool: &str, reason: impl Into<String>) -> Self {
        Self::DeviceQueryFailed {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error is a violation of the byte-range preconditions.
    pub fn is_range_error(&self) -> bool {
        matches!(
            self,
            Self::RangeOutOfBounds { .. } | Self::InvalidRange { .. }
        )
    }
}

/// Errors raised while enumerating backing media.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot enumerate images under {root:?}: {source}")]
    ImageRoot {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("image enumeration task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
