use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::OnceCell;

use super::{Disk, DiskKind};
use crate::{probe, CommandRunner, DiskState, Result};

pub(crate) const ISOINFO: &str = "isoinfo";

/// Disk backed by an image file.
///
/// Ready for as long as the file exists. Size and label are resolved once and then kept for the
/// lifetime of the instance; the registry builds fresh instances on every enumeration pass.
pub struct ImageDisk {
    filename: PathBuf,
    runner: Arc<dyn CommandRunner>,
    size: OnceCell<u64>,
    label: OnceCell<Option<String>>,
}

impl ImageDisk {
    pub fn new(filename: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            filename: filename.into(),
            runner,
            size: OnceCell::new(),
            label: OnceCell::new(),
        }
    }
}

impl fmt::Debug for ImageDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageDisk")
            .field("filename", &self.filename)
            .field("size", &self.size.get())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Disk for ImageDisk {
    fn kind(&self) -> DiskKind {
        DiskKind::Image
    }

    fn filename(&self) -> &Path {
        &self.filename
    }

    async fn state(&self) -> Result<DiskState> {
        if fs::try_exists(&self.filename).await? {
            Ok(DiskState::Ready)
        } else {
            Ok(DiskState::Empty)
        }
    }

    async fn size(&self) -> Result<u64> {
        let size = self
            .size
            .get_or_try_init(|| async { Ok::<_, std::io::Error>(fs::metadata(&self.filename).await?.len()) })
            .await?;
        Ok(*size)
    }

    async fn label(&self) -> Option<String> {
        self.label
            .get_or_init(|| async {
                let path = self.filename.to_string_lossy();
                match self.runner.run(ISOINFO, &["-d", "-i", &path]).await {
                    Ok(output) => probe::parse_volume_descriptor(&output).label,
                    Err(err) => {
                        tracing::debug!(filename = %self.filename.display(), error = %err, "no volume label");
                        None
                    }
                }
            })
            .await
            .clone()
    }
}
