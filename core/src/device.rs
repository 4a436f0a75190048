use serde::{Deserialize, Serialize};

use crate::EnumerationError;

/// A block device or partition as reported by the OS, before any
/// filesystem inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_path: String,
    pub size_bytes: u64,
    /// 1-based partition number, 0 for a whole disk.
    pub partition_index: u32,
}

impl DeviceDescriptor {
    pub fn new(device_path: impl Into<String>, size_bytes: u64, partition_index: u32) -> Self {
        Self {
            device_path: device_path.into(),
            size_bytes,
            partition_index,
        }
    }
}

/// Lists attached storage devices.
///
/// Every call re-queries the OS and returns a finished snapshot.
#[async_trait::async_trait]
pub trait DeviceEnumerator: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, EnumerationError>;
}
