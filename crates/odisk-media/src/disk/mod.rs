mod image;
mod optical;
mod removable;

use std::fmt;
use std::io::SeekFrom;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

use crate::{DiskError, DiskState, Result};

pub use image::ImageDisk;
pub use optical::OpticalDrive;
pub use removable::RemovableDrive;

/// `end` sentinel for [`Disk::read`] meaning "through the last byte of the medium".
pub const READ_TO_END: u64 = 0;

pub type BoxedAsyncRead = Pin<Box<dyn AsyncRead + Send>>;

/// An inclusive byte range (`start..=end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Length of this range in bytes.
    pub fn len(self) -> u64 {
        // `end` is inclusive.
        debug_assert!(self.start <= self.end);
        self.end - self.start + 1
    }

    pub fn is_empty(self) -> bool {
        self.start > self.end
    }
}

/// Resolve a requested `[start, end]` read against a medium of `size` bytes.
///
/// `end == READ_TO_END` is replaced by the last byte. The bounds check happens before the
/// ordering check, so `start > end` with an out-of-bounds `end` reports
/// [`DiskError::RangeOutOfBounds`]. A zero-length medium has no readable byte at all.
pub fn resolve_read_range(start: u64, end: u64, size: u64) -> Result<ByteRange> {
    let Some(last) = size.checked_sub(1) else {
        return Err(DiskError::RangeOutOfBounds { end, size });
    };
    let end = if end == READ_TO_END { last } else { end };

    if end > last {
        return Err(DiskError::RangeOutOfBounds { end, size });
    }
    if start > end {
        return Err(DiskError::InvalidRange { start, end });
    }
    Ok(ByteRange { start, end })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskKind {
    Image,
    OpticalDrive,
    RemovableDrive,
}

impl fmt::Display for DiskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Image => "image",
            Self::OpticalDrive => "optical_drive",
            Self::RemovableDrive => "removable_drive",
        })
    }
}

/// Wire representation of a disk, as listed by the image API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskSummary {
    pub filename: String,
    pub kind: DiskKind,
    /// `None` when the device could not be queried.
    pub state: Option<DiskState>,
    pub size: Option<u64>,
    pub label: Option<String>,
}

/// A readable block medium.
///
/// `size()` is only meaningful while `state()` reports [`DiskState::Ready`]; callers are expected
/// to check readiness first. Implementations that cache `size`/`label` drop those caches whenever
/// they observe a state transition.
#[async_trait]
pub trait Disk: Send + Sync + fmt::Debug {
    fn kind(&self) -> DiskKind;

    /// Path of the backing file or device node.
    fn filename(&self) -> &Path;

    async fn state(&self) -> Result<DiskState>;

    async fn size(&self) -> Result<u64>;

    /// Volume label, absent when the medium has none or it cannot be determined.
    async fn label(&self) -> Option<String>;

    /// Check `[start, end]` like [`Disk::read`] and return a reader over exactly that range.
    async fn open_range(&self, start: u64, end: u64) -> Result<(ByteRange, BoxedAsyncRead)> {
        let size = self.size().await?;
        let range = resolve_read_range(start, end, size)?;
        let reader = open_file_range(self.filename(), range).await?;
        Ok((range, reader))
    }

    /// Read the inclusive byte range `[start, end]`; `end == READ_TO_END` reads to the end.
    async fn read(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let (range, mut reader) = self.open_range(start, end).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        if buf.len() as u64 != range.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "short read from {}: wanted {} bytes, got {}",
                    self.filename().display(),
                    range.len(),
                    buf.len()
                ),
            )
            .into());
        }
        Ok(buf)
    }

    async fn erase(&self) -> Result<()> {
        Err(DiskError::NotImplemented("erase"))
    }

    async fn eject(&self) -> Result<()> {
        Err(DiskError::NotImplemented("eject"))
    }

    /// Snapshot of this disk for the image API. Size and label are only resolved when ready.
    async fn summary(&self) -> DiskSummary {
        let state = match self.state().await {
            Ok(state) => Some(state),
            Err(err) => {
                tracing::warn!(filename = %self.filename().display(), error = %err, "state query failed");
                None
            }
        };
        let (size, label) = if state == Some(DiskState::Ready) {
            (self.size().await.ok(), self.label().await)
        } else {
            (None, None)
        };

        DiskSummary {
            filename: self.filename().display().to_string(),
            kind: self.kind(),
            state,
            size,
            label,
        }
    }
}

/// Seek-then-take reader over `range` of the file or device node at `path`.
pub(crate) async fn open_file_range(path: &Path, range: ByteRange) -> Result<BoxedAsyncRead> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    Ok(Box::pin(file.take(range.len())))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::{CommandRunner, DiskError, Result};

    /// [`CommandRunner`] replaying queued outputs per program.
    ///
    /// When a program's queue runs dry the last reply is repeated; a program with no queue at all
    /// fails as if it were not installed.
    #[derive(Default)]
    pub(crate) struct ScriptedRunner {
        replies: Mutex<HashMap<String, VecDeque<Result<String>>>>,
        last: Mutex<HashMap<String, String>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub(crate) fn push(&self, program: &str, output: &str) {
            self.replies
                .lock()
                .unwrap()
                .entry(program.to_string())
                .or_default()
                .push_back(Ok(output.to_string()));
        }

        pub(crate) fn push_failure(&self, program: &str) {
            self.replies
                .lock()
                .unwrap()
                .entry(program.to_string())
                .or_default()
                .push_back(Err(DiskError::query_failed(program, "exited with 1")));
        }

        pub(crate) fn calls(&self, program: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.as_str() == program)
                .count()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, _args: &[&str]) -> Result<String> {
            self.calls.lock().unwrap().push(program.to_string());
            let next = self
                .replies
                .lock()
                .unwrap()
                .get_mut(program)
                .and_then(VecDeque::pop_front);
            match next {
                Some(Ok(output)) => {
                    self.last
                        .lock()
                        .unwrap()
                        .insert(program.to_string(), output.clone());
                    Ok(output)
                }
                Some(Err(err)) => Err(err),
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .get(program)
                    .cloned()
                    .ok_or_else(|| DiskError::query_failed(program, "not installed")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_keeps_in_bounds_ranges() {
        assert_eq!(
            resolve_read_range(0, 99, 1000).unwrap(),
            ByteRange { start: 0, end: 99 }
        );
        assert_eq!(
            resolve_read_range(999, 999, 1000).unwrap(),
            ByteRange {
                start: 999,
                end: 999
            }
        );
    }

    #[test]
    fn zero_end_reads_to_last_byte() {
        assert_eq!(
            resolve_read_range(10, READ_TO_END, 1000).unwrap(),
            ByteRange { start: 10, end: 999 }
        );
        assert_eq!(
            resolve_read_range(0, READ_TO_END, 1).unwrap(),
            ByteRange { start: 0, end: 0 }
        );
    }

    #[test]
    fn bounds_are_checked_before_ordering() {
        assert!(matches!(
            resolve_read_range(0, 1000, 1000),
            Err(DiskError::RangeOutOfBounds {
                end: 1000,
                size: 1000
            })
        ));
        // Both preconditions are violated; the bounds check reports first.
        assert!(matches!(
            resolve_read_range(2000, 1500, 1000),
            Err(DiskError::RangeOutOfBounds { .. })
        ));
        assert!(matches!(
            resolve_read_range(500, 100, 1000),
            Err(DiskError::InvalidRange {
                start: 500,
                end: 100
            })
        ));
        assert!(matches!(
            resolve_read_range(1000, READ_TO_END, 1000),
            Err(DiskError::InvalidRange {
                start: 1000,
                end: 999
            })
        ));
    }

    #[test]
    fn empty_medium_has_no_readable_bytes() {
        assert!(matches!(
            resolve_read_range(0, READ_TO_END, 0),
            Err(DiskError::RangeOutOfBounds { size: 0, .. })
        ));
    }
}
