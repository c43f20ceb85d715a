//! Readable media shared by the remote disc server.
//!
//! Three kinds of backing media are exposed through one contract:
//!
//! - [`ImageDisk`]: a flat image file (`.iso`, `.img`, `.dmg`) under the image root
//! - [`OpticalDrive`]: a physical drive whose readiness is re-read from `setcd` on every query
//! - [`RemovableDrive`]: a removable block device, sized from sysfs
//!
//! All of them implement [`Disk`]. The [`DiskRegistry`] enumerates what is currently available
//! and hands out immutable [`DiskSnapshot`]s that map `diskN` identifiers to disks.
//!
//! Everything that shells out to external utilities goes through a [`CommandRunner`], and the raw
//! text those utilities print is only ever interpreted by the parsers in [`probe`].

mod disk;
mod error;
pub mod probe;
mod registry;
mod state;
mod tool;

pub use disk::{
    resolve_read_range, BoxedAsyncRead, ByteRange, Disk, DiskKind, DiskSummary, ImageDisk,
    OpticalDrive, RemovableDrive, READ_TO_END,
};
pub use error::{DiskError, RegistryError, Result};
pub use registry::{
    is_image_file, list_images, list_optical_drives, list_removable_drives, DiskRegistry,
    DiskSnapshot, RegistryConfig, IMAGE_EXTENSIONS,
};
pub use state::DiskState;
pub use tool::{CommandRunner, SystemCommandRunner, DEFAULT_TOOL_TIMEOUT};
