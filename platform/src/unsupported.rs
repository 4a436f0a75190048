use ntfsman_core::{
    ActiveMount, Config, DeviceDescriptor, DeviceEnumerator, EnumerationError, MountError,
    MountExecutor,
};
use std::path::{Path, PathBuf};

const UNSUPPORTED: &str = "volume mounting is only implemented for Linux";

#[derive(Default)]
pub struct UnsupportedDeviceEnumerator;

impl UnsupportedDeviceEnumerator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl DeviceEnumerator for UnsupportedDeviceEnumerator {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, EnumerationError> {
        Err(EnumerationError::Unsupported)
    }
}

pub struct UnsupportedMountExecutor;

impl UnsupportedMountExecutor {
    pub fn new(_config: &Config) -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl MountExecutor for UnsupportedMountExecutor {
    async fn mount(&self, _device_path: &str, _read_write: bool) -> Result<PathBuf, MountError> {
        Err(MountError::Unknown(UNSUPPORTED.to_string()))
    }

    async fn unmount(&self, _mount_point: &Path) -> Result<(), MountError> {
        Err(MountError::Unknown(UNSUPPORTED.to_string()))
    }

    async fn active_mounts(&self) -> Result<Vec<ActiveMount>, MountError> {
        Ok(Vec::new())
    }

    async fn free_bytes(&self, _mount_point: &Path) -> Result<u64, MountError> {
        Err(MountError::Unknown(UNSUPPORTED.to_string()))
    }
}
