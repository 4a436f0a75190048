//! Host implementations of the ntfsman capability traits.

use ntfsman_core::{BootSectorClassifier, Config, VolumeRegistry};
use std::sync::Arc;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(not(target_os = "linux"))]
pub mod unsupported;

#[cfg(target_os = "linux")]
pub use linux::{
    LinuxDeviceEnumerator as PlatformDeviceEnumerator, LinuxMountExecutor as PlatformMountExecutor,
};

#[cfg(not(target_os = "linux"))]
pub use unsupported::{
    UnsupportedDeviceEnumerator as PlatformDeviceEnumerator,
    UnsupportedMountExecutor as PlatformMountExecutor,
};

/// Registry wired to this host's devices and mount table.
pub fn host_registry(config: &Config) -> VolumeRegistry {
    VolumeRegistry::with_event_capacity(
        Arc::new(PlatformDeviceEnumerator::new()),
        Arc::new(BootSectorClassifier),
        Arc::new(PlatformMountExecutor::new(config)),
        config.event_capacity,
    )
}
