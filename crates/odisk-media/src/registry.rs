use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{watch, Mutex};
use walkdir::WalkDir;

use crate::disk::{Disk, ImageDisk, OpticalDrive, RemovableDrive};
use crate::{probe, CommandRunner, RegistryError};

/// File extensions (compared case-insensitively) recognised as disk images.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["iso", "img", "dmg"];

const WODIM: &str = "wodim";
const DEFAULT_SYSFS_BLOCK_ROOT: &str = "/sys/block";

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext)))
}

/// Recursively list image files under `root`, sorted by path.
///
/// Failing to read `root` itself is an error; unreadable entries below it are skipped.
pub fn list_images(root: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    let mut images = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(RegistryError::ImageRoot {
                    root: root.to_path_buf(),
                    source: err,
                })
            }
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable entry under image root");
                continue;
            }
        };
        if entry.file_type().is_file() && is_image_file(entry.path()) {
            images.push(entry.into_path());
        }
    }
    images.sort();
    Ok(images)
}

/// Optical drive device nodes reported by `wodim --devices`, sorted.
pub async fn list_optical_drives(runner: &dyn CommandRunner) -> crate::Result<Vec<String>> {
    let output = runner.run(WODIM, &["--devices"]).await?;
    Ok(probe::parse_device_list(&output))
}

/// Removable SCSI-disk block devices with media, as `/dev/<name>` paths, sorted.
///
/// A device qualifies when `<sysfs_root>/<name>/removable` is non-zero, its `device/uevent`
/// names the `sd` driver and its `size` is non-zero. Anything unreadable is skipped.
pub async fn list_removable_drives(sysfs_root: &Path) -> Vec<PathBuf> {
    let mut dir = match tokio::fs::read_dir(sysfs_root).await {
        Ok(dir) => dir,
        Err(err) => {
            tracing::debug!(root = %sysfs_root.display(), error = %err, "no block devices listed");
            return Vec::new();
        }
    };

    let mut devices = Vec::new();
    while let Ok(Some(entry)) = dir.next_entry().await {
        let base = entry.path();
        let removable = read_trimmed(&base.join("removable")).await;
        if removable.as_deref().unwrap_or("0") == "0" {
            continue;
        }
        let driver_is_sd = read_trimmed(&base.join("device").join("uevent"))
            .await
            .is_some_and(|uevent| uevent.lines().any(|line| line.starts_with("DRIVER=sd")));
        if !driver_is_sd {
            continue;
        }
        if read_trimmed(&base.join("size")).await.as_deref().unwrap_or("0") == "0" {
            continue;
        }
        devices.push(Path::new("/dev").join(entry.file_name()));
    }
    devices.sort();
    devices
}

async fn read_trimmed(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub image_root: PathBuf,
    /// Also share removable drives, listed after optical drives.
    pub include_removable: bool,
    pub sysfs_root: PathBuf,
}

impl RegistryConfig {
    pub fn new(image_root: impl Into<PathBuf>) -> Self {
        Self {
            image_root: image_root.into(),
            include_removable: false,
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_BLOCK_ROOT),
        }
    }

    pub fn with_include_removable(mut self, include_removable: bool) -> Self {
        self.include_removable = include_removable;
        self
    }

    pub fn with_sysfs_root(mut self, sysfs_root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = sysfs_root.into();
        self
    }
}

/// Immutable `diskN → Disk` mapping produced by one enumeration pass.
///
/// Identifiers are positional, so they are only stable within one snapshot.
#[derive(Debug, Default)]
pub struct DiskSnapshot {
    generation: u64,
    disks: Vec<(String, Arc<dyn Disk>)>,
}

impl DiskSnapshot {
    fn new(generation: u64, disks: Vec<Arc<dyn Disk>>) -> Self {
        Self {
            generation,
            disks: disks
                .into_iter()
                .enumerate()
                .map(|(i, disk)| (format!("disk{i}"), disk))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Disk>> {
        self.disks
            .iter()
            .find(|(disk_id, _)| disk_id == id)
            .map(|(_, disk)| Arc::clone(disk))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Disk>)> {
        self.disks.iter().map(|(id, disk)| (id.as_str(), disk))
    }

    pub fn len(&self) -> usize {
        self.disks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }

    /// Membership generation this snapshot belongs to; bumps only when the disk set changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Result of the previous enumeration pass, used for change detection and to carry device-backed
/// disks (and their caches and query locks) across passes.
#[derive(Default)]
struct Enumeration {
    images: Option<Vec<PathBuf>>,
    drives: Vec<Arc<OpticalDrive>>,
    removable: Vec<Arc<RemovableDrive>>,
}

/// Enumerates image files and drives and publishes [`DiskSnapshot`]s.
///
/// Snapshot order is images, then optical drives, then (when enabled) removable drives, each
/// group sorted by path. Collaborators that only care about membership changes can
/// [`subscribe`](Self::subscribe) instead of polling.
pub struct DiskRegistry {
    config: RegistryConfig,
    runner: Arc<dyn CommandRunner>,
    enumeration: Mutex<Enumeration>,
    snapshot: RwLock<Arc<DiskSnapshot>>,
    changes: watch::Sender<u64>,
}

impl DiskRegistry {
    pub fn new(config: RegistryConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            config,
            runner,
            enumeration: Mutex::new(Enumeration::default()),
            snapshot: RwLock::new(Arc::new(DiskSnapshot::default())),
            changes,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn image_root(&self) -> &Path {
        &self.config.image_root
    }

    /// Current snapshot. Holders keep their disks alive even if a later pass replaces them.
    pub fn snapshot(&self) -> Arc<DiskSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Receiver whose value is the latest membership generation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Re-enumerate backing media and publish a new snapshot.
    ///
    /// Returns whether the set of images or drives changed since the previous pass (always
    /// `true` for the first pass). Optical drive enumeration failures degrade to "no drives".
    pub async fn refresh(&self) -> Result<bool, RegistryError> {
        let mut prev = self.enumeration.lock().await;

        let root = self.config.image_root.clone();
        let images = tokio::task::spawn_blocking(move || list_images(&root)).await??;

        let drive_paths = match list_optical_drives(self.runner.as_ref()).await {
            Ok(drives) => drives,
            Err(err) => {
                tracing::debug!(error = %err, "optical drive enumeration failed; sharing no drives");
                Vec::new()
            }
        };
        let removable_paths = if self.config.include_removable {
            list_removable_drives(&self.config.sysfs_root).await
        } else {
            Vec::new()
        };

        let changed = prev.images.as_ref() != Some(&images)
            || !same_members(&prev.drives, &drive_paths)
            || !same_members(&prev.removable, &removable_paths);

        let drives: Vec<Arc<OpticalDrive>> = drive_paths
            .iter()
            .map(|path| {
                carry_over(&prev.drives, Path::new(path)).unwrap_or_else(|| {
                    Arc::new(OpticalDrive::new(path, Arc::clone(&self.runner)))
                })
            })
            .collect();
        let removable: Vec<Arc<RemovableDrive>> = removable_paths
            .iter()
            .map(|path| {
                carry_over(&prev.removable, path).unwrap_or_else(|| {
                    Arc::new(RemovableDrive::new(path, &self.config.sysfs_root))
                })
            })
            .collect();

        let mut disks: Vec<Arc<dyn Disk>> = images
            .iter()
            .map(|path| Arc::new(ImageDisk::new(path, Arc::clone(&self.runner))) as Arc<dyn Disk>)
            .collect();
        disks.extend(drives.iter().map(|d| Arc::clone(d) as Arc<dyn Disk>));
        disks.extend(removable.iter().map(|d| Arc::clone(d) as Arc<dyn Disk>));

        let generation = *self.changes.borrow() + u64::from(changed);
        let snapshot = Arc::new(DiskSnapshot::new(generation, disks));
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);

        prev.images = Some(images);
        prev.drives = drives;
        prev.removable = removable;

        if changed {
            tracing::info!(
                generation,
                disks = snapshot.len(),
                optical_drives = prev.drives.len(),
                removable_drives = prev.removable.len(),
                "disk set changed"
            );
            self.changes.send_replace(generation);
        }
        Ok(changed)
    }
}

fn same_members<D: Disk, P: AsRef<Path>>(prev: &[Arc<D>], paths: &[P]) -> bool {
    prev.len() == paths.len()
        && prev
            .iter()
            .zip(paths)
            .all(|(disk, path)| disk.filename() == path.as_ref())
}

fn carry_over<D: Disk>(prev: &[Arc<D>], path: &Path) -> Option<Arc<D>> {
    prev.iter().find(|disk| disk.filename() == path).cloned()
}
