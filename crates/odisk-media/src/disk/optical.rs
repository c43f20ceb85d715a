use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::image::ISOINFO;
use super::{Disk, DiskKind};
use crate::probe::{self, VolumeDescriptor};
use crate::{CommandRunner, DiskError, DiskState, Result};

const SETCD: &str = "setcd";

/// Physical optical drive.
///
/// Every [`Disk::state`] call asks the drive via `setcd -i`; size and label are read from the
/// volume descriptor with `isoinfo -d` and cached until the next observed state transition.
///
/// All tool invocations for one drive go through a single async mutex, so at most one query is
/// in flight per device while different drives proceed in parallel.
pub struct OpticalDrive {
    device: PathBuf,
    runner: Arc<dyn CommandRunner>,
    cache: Mutex<DriveCache>,
}

#[derive(Debug)]
struct DriveCache {
    state: DiskState,
    size: Option<u64>,
    /// `Some(None)` records a successful probe that found no label.
    label: Option<Option<String>>,
}

impl DriveCache {
    fn invalidate(&mut self) {
        self.size = None;
        self.label = None;
    }

    fn absorb(&mut self, desc: &VolumeDescriptor) {
        if self.size.is_none() {
            self.size = desc.byte_size();
        }
        if self.label.is_none() {
            self.label = Some(desc.label.clone());
        }
    }
}

impl OpticalDrive {
    pub fn new(device: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            device: device.into(),
            runner,
            cache: Mutex::new(DriveCache {
                state: DiskState::Empty,
                size: None,
                label: None,
            }),
        }
    }

    async fn read_volume_descriptor(&self) -> Result<VolumeDescriptor> {
        let device = self.device.to_string_lossy();
        let output = self.runner.run(ISOINFO, &["-d", "-i", &device]).await?;
        Ok(probe::parse_volume_descriptor(&output))
    }
}

impl fmt::Debug for OpticalDrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpticalDrive")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Disk for OpticalDrive {
    fn kind(&self) -> DiskKind {
        DiskKind::OpticalDrive
    }

    fn filename(&self) -> &Path {
        &self.device
    }

    async fn state(&self) -> Result<DiskState> {
        let mut cache = self.cache.lock().await;

        let device = self.device.to_string_lossy();
        let output = self.runner.run(SETCD, &["-i", &device]).await?;
        let observed = probe::parse_drive_status(&output).unwrap_or(cache.state);

        if observed != cache.state {
            tracing::info!(
                device = %self.device.display(),
                from = %cache.state,
                to = %observed,
                "drive state changed"
            );
            cache.invalidate();
            cache.state = observed;
        }
        Ok(observed)
    }

    async fn size(&self) -> Result<u64> {
        let mut cache = self.cache.lock().await;
        if let Some(size) = cache.size {
            return Ok(size);
        }

        let desc = self.read_volume_descriptor().await?;
        cache.absorb(&desc);
        cache.size.ok_or_else(|| {
            DiskError::query_failed(ISOINFO, "volume size or logical block size not reported")
        })
    }

    async fn label(&self) -> Option<String> {
        let mut cache = self.cache.lock().await;
        if let Some(label) = &cache.label {
            return label.clone();
        }

        match self.read_volume_descriptor().await {
            Ok(desc) => {
                cache.absorb(&desc);
                desc.label
            }
            Err(err) => {
                tracing::debug!(device = %self.device.display(), error = %err, "no volume label");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::test_support::ScriptedRunner;

    const DISC_FOUND: &str = "/dev/sr0:\n  Disc found in drive: data disc type 1\n";
    const NO_DISC: &str = "/dev/sr0:\n  No disc is inserted\n";
    const TRAY_OPEN: &str = "/dev/sr0:\n  CD tray is open\n";
    const NOT_READY: &str = "/dev/sr0:\n  Drive is not ready\n";

    fn isoinfo(label: &str, blocks: u64) -> String {
        format!("Volume id: {label}\nLogical block size is: 2048\nVolume size is: {blocks}\n")
    }

    fn drive() -> (OpticalDrive, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner::default());
        (OpticalDrive::new("/dev/sr0", runner.clone()), runner)
    }

    #[tokio::test]
    async fn walks_through_all_states() {
        let (drive, runner) = drive();
        for output in [TRAY_OPEN, NOT_READY, DISC_FOUND, NO_DISC] {
            runner.push(SETCD, output);
        }

        assert_eq!(drive.state().await.unwrap(), DiskState::Open);
        assert_eq!(drive.state().await.unwrap(), DiskState::NotReady);
        assert_eq!(drive.state().await.unwrap(), DiskState::Ready);
        assert_eq!(drive.state().await.unwrap(), DiskState::Empty);
    }

    #[tokio::test]
    async fn unrecognised_output_keeps_previous_state() {
        let (drive, runner) = drive();
        runner.push(SETCD, DISC_FOUND);
        runner.push(SETCD, "/dev/sr0:\n  ???\n");

        assert_eq!(drive.state().await.unwrap(), DiskState::Ready);
        assert_eq!(drive.state().await.unwrap(), DiskState::Ready);
    }

    #[tokio::test]
    async fn failed_query_is_reported() {
        let (drive, runner) = drive();
        runner.push_failure(SETCD);
        assert!(matches!(
            drive.state().await,
            Err(DiskError::DeviceQueryFailed { ref tool, .. }) if tool == SETCD
        ));
    }

    #[tokio::test]
    async fn size_is_blocks_times_block_size_and_cached() {
        let (drive, runner) = drive();
        runner.push(SETCD, DISC_FOUND);
        runner.push(ISOINFO, &isoinfo("FIRST", 100));

        assert_eq!(drive.state().await.unwrap(), DiskState::Ready);
        assert_eq!(drive.size().await.unwrap(), 100 * 2048);
        assert_eq!(drive.label().await.as_deref(), Some("FIRST"));
        assert_eq!(drive.size().await.unwrap(), 100 * 2048);
        assert_eq!(runner.calls(ISOINFO), 1);
    }

    #[tokio::test]
    async fn leaving_ready_invalidates_size_and_label() {
        let (drive, runner) = drive();
        runner.push(SETCD, DISC_FOUND);
        runner.push(SETCD, NO_DISC);
        runner.push(SETCD, DISC_FOUND);
        runner.push(ISOINFO, &isoinfo("FIRST", 100));
        runner.push(ISOINFO, &isoinfo("SECOND", 300));

        assert_eq!(drive.state().await.unwrap(), DiskState::Ready);
        assert_eq!(drive.size().await.unwrap(), 100 * 2048);
        assert_eq!(drive.label().await.as_deref(), Some("FIRST"));

        assert_eq!(drive.state().await.unwrap(), DiskState::Empty);
        assert_eq!(drive.state().await.unwrap(), DiskState::Ready);

        assert_eq!(drive.size().await.unwrap(), 300 * 2048);
        assert_eq!(drive.label().await.as_deref(), Some("SECOND"));
        assert_eq!(runner.calls(ISOINFO), 2);
    }

    #[tokio::test]
    async fn unchanged_state_keeps_cache() {
        let (drive, runner) = drive();
        runner.push(SETCD, DISC_FOUND);
        runner.push(ISOINFO, &isoinfo("DISC", 10));

        drive.state().await.unwrap();
        drive.size().await.unwrap();
        drive.state().await.unwrap();
        drive.size().await.unwrap();
        assert_eq!(runner.calls(ISOINFO), 1);
    }

    #[tokio::test]
    async fn missing_size_fields_are_a_query_failure() {
        let (drive, runner) = drive();
        runner.push(ISOINFO, "Volume id: ODD\n");
        assert!(matches!(
            drive.size().await,
            Err(DiskError::DeviceQueryFailed { .. })
        ));
        assert_eq!(drive.label().await.as_deref(), Some("ODD"));
    }

    #[tokio::test]
    async fn label_failure_is_not_cached() {
        let (drive, runner) = drive();
        runner.push_failure(ISOINFO);
        runner.push(ISOINFO, &isoinfo("LATE", 1));

        assert_eq!(drive.label().await, None);
        assert_eq!(drive.label().await.as_deref(), Some("LATE"));
    }

    /// Answers every query slowly and records how many run at once, per device and overall.
    #[derive(Default)]
    struct SlowTools {
        in_flight: std::sync::Mutex<(std::collections::HashMap<String, usize>, usize)>,
        max_per_device: std::sync::Mutex<std::collections::HashMap<String, usize>>,
        max_overall: std::sync::atomic::AtomicUsize,
    }

    impl SlowTools {
        fn max_for(&self, device: &str) -> usize {
            self.max_per_device.lock().unwrap().get(device).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl CommandRunner for SlowTools {
        async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
            let device = args.last().copied().unwrap_or_default().to_string();
            {
                let mut guard = self.in_flight.lock().unwrap();
                let (per_device, overall) = &mut *guard;
                let count = per_device.entry(device.clone()).or_insert(0);
                *count += 1;
                *overall += 1;
                let mut max = self.max_per_device.lock().unwrap();
                let seen = max.entry(device.clone()).or_insert(0);
                *seen = (*seen).max(*count);
                self.max_overall
                    .fetch_max(*overall, std::sync::atomic::Ordering::SeqCst);
            }

            tokio::time::sleep(std::time::Duration::from_millis(50)).await;

            {
                let mut guard = self.in_flight.lock().unwrap();
                let (per_device, overall) = &mut *guard;
                if let Some(count) = per_device.get_mut(&device) {
                    *count -= 1;
                }
                *overall -= 1;
            }
            Ok(match program {
                SETCD => DISC_FOUND.to_string(),
                _ => isoinfo("SLOW", 4),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queries_against_one_drive_never_overlap() {
        let tools = Arc::new(SlowTools::default());
        let drive = OpticalDrive::new("/dev/sr0", tools.clone());

        let (a, b, c, d) = tokio::join!(drive.state(), drive.state(), drive.size(), drive.label());
        assert_eq!(a.unwrap(), DiskState::Ready);
        assert_eq!(b.unwrap(), DiskState::Ready);
        assert_eq!(c.unwrap(), 4 * 2048);
        assert_eq!(d.as_deref(), Some("SLOW"));

        assert_eq!(tools.max_for("/dev/sr0"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn different_drives_are_queried_in_parallel() {
        let tools = Arc::new(SlowTools::default());
        let first = OpticalDrive::new("/dev/sr0", tools.clone());
        let second = OpticalDrive::new("/dev/sr1", tools.clone());

        let (a, b) = tokio::join!(first.state(), second.state());
        assert_eq!(a.unwrap(), DiskState::Ready);
        assert_eq!(b.unwrap(), DiskState::Ready);

        assert_eq!(tools.max_for("/dev/sr0"), 1);
        assert_eq!(tools.max_for("/dev/sr1"), 1);
        assert_eq!(tools.max_overall.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
