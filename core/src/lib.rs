//! NTFS volume lifecycle management: device discovery, NTFS identification,
//! mount-state tracking and mount/unmount execution.
//!
//! OS access goes through three narrow traits ([`DeviceEnumerator`],
//! [`FilesystemClassifier`], [`MountExecutor`]); the [`VolumeRegistry`] and
//! its invariants are OS-independent.

pub mod classify;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod mount;
pub mod registry;
pub mod service;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod volume;

pub use classify::{BootSectorClassifier, ClassificationResult, FilesystemClassifier, NtfsInfo};
pub use config::{Config, NtfsDriver};
pub use device::{DeviceDescriptor, DeviceEnumerator};
pub use error::{ConfigError, EnumerationError, MountError, Operation, VolumeError};
pub use events::VolumeEvent;
pub use mount::{mount_point_for, ActiveMount, MountExecutor};
pub use registry::{ScanReport, UnmountOutcome, UnreadableDevice, VolumeRegistry};
pub use service::VolumeService;
pub use volume::{FilesystemKind, MountState, Volume, VolumeId};
