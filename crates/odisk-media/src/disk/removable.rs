use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use super::{Disk, DiskKind};
use crate::{DiskState, Result};

/// sysfs reports block device sizes in 512-byte sectors regardless of the logical block size.
const SYSFS_SECTOR_SIZE: u64 = 512;

/// Removable block device such as a USB stick or card reader (`/dev/sdX`).
///
/// Readiness comes from sysfs: the device is ready when its node exists and
/// `<sysfs_root>/<name>/size` reports a non-zero sector count. Volume labels are not read yet
/// (that needs partition-table parsing), so [`Disk::label`] is always `None`.
pub struct RemovableDrive {
    device: PathBuf,
    sysfs_root: PathBuf,
    cache: Mutex<RemovableCache>,
}

#[derive(Debug)]
struct RemovableCache {
    state: DiskState,
    size: Option<u64>,
}

impl RemovableDrive {
    pub fn new(device: impl Into<PathBuf>, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            sysfs_root: sysfs_root.into(),
            cache: Mutex::new(RemovableCache {
                state: DiskState::Empty,
                size: None,
            }),
        }
    }

    fn size_attribute(&self) -> Option<PathBuf> {
        let name = self.device.file_name()?;
        Some(self.sysfs_root.join(name).join("size"))
    }

    async fn read_sectors(&self) -> std::io::Result<u64> {
        let Some(path) = self.size_attribute() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no device name in {}", self.device.display()),
            ));
        };
        let raw = fs::read_to_string(&path).await?;
        raw.trim().parse::<u64>().map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: {err}", path.display()),
            )
        })
    }
}

impl fmt::Debug for RemovableDrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemovableDrive")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Disk for RemovableDrive {
    fn kind(&self) -> DiskKind {
        DiskKind::RemovableDrive
    }

    fn filename(&self) -> &Path {
        &self.device
    }

    async fn state(&self) -> Result<DiskState> {
        let mut cache = self.cache.lock().await;

        let present = fs::try_exists(&self.device).await.unwrap_or(false);
        let observed = if present && matches!(self.read_sectors().await, Ok(n) if n > 0) {
            DiskState::Ready
        } else {
            DiskState::Empty
        };

        if observed != cache.state {
            tracing::info!(
                device = %self.device.display(),
                from = %cache.state,
                to = %observed,
                "removable media state changed"
            );
            cache.size = None;
            cache.state = observed;
        }
        Ok(observed)
    }

    async fn size(&self) -> Result<u64> {
        let mut cache = self.cache.lock().await;
        if let Some(size) = cache.size {
            return Ok(size);
        }
        let sectors = self.read_sectors().await?;
        let size = sectors.checked_mul(SYSFS_SECTOR_SIZE).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("sector count {sectors} overflows a byte size"),
            )
        })?;
        cache.size = Some(size);
        Ok(size)
    }

    async fn label(&self) -> Option<String> {
        tracing::debug!(device = %self.device.display(), "removable drive labels are not implemented");
        None
    }
}
