use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::MountError;

// Namespace for name-based volume ids. Changing it changes every id.
const VOLUME_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6e74_6673_6d61_6e00_8f1c_2d4b_9a37_e051);

/// Stable identity of a volume, derived from its device path so a rescan
/// recognizes the same partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeId(Uuid);

impl VolumeId {
    pub fn from_device_path(device_path: &str) -> Self {
        Self(Uuid::new_v5(&VOLUME_ID_NAMESPACE, device_path.as_bytes()))
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesystemKind {
    Ntfs,
}

/// Where a volume is in its mount lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MountState {
    Unmounted,
    Mounting,
    Mounted { mount_point: PathBuf, read_write: bool },
    Unmounting,
    Failed { reason: MountError },
    Removed,
}

impl MountState {
    /// A mount or unmount is running for this device.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Mounting | Self::Unmounting)
    }

    pub fn is_mounted(&self) -> bool {
        matches!(self, Self::Mounted { .. })
    }

    pub fn failed(reason: MountError) -> Self {
        Self::Failed { reason }
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmounted => f.write_str("unmounted"),
            Self::Mounting => f.write_str("mounting"),
            Self::Mounted { mount_point, read_write } => write!(
                f,
                "mounted at {} ({})",
                mount_point.display(),
                if *read_write { "read-write" } else { "read-only" }
            ),
            Self::Unmounting => f.write_str("unmounting"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
            Self::Removed => f.write_str("removed"),
        }
    }
}

/// An NTFS partition tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub device_path: String,
    pub label: String,
    pub filesystem_kind: FilesystemKind,
    pub size_bytes: u64,
    /// Only known while mounted.
    pub free_bytes: Option<u64>,
    pub mount_state: MountState,
}

impl Volume {
    pub(crate) fn discovered(device_path: &str, label: String, size_bytes: u64) -> Self {
        Self {
            id: VolumeId::from_device_path(device_path),
            device_path: device_path.to_string(),
            label,
            filesystem_kind: FilesystemKind::Ntfs,
            size_bytes,
            free_bytes: None,
            mount_state: MountState::Unmounted,
        }
    }

    pub fn mount_point(&self) -> Option<&Path> {
        match &self.mount_state {
            MountState::Mounted { mount_point, .. } => Some(mount_point),
            _ => None,
        }
    }

    /// Human-readable name: the label, or the device path when unlabeled.
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.device_path
        } else {
            &self.label
        }
    }

    pub(crate) fn set_mounted(
        &mut self,
        mount_point: PathBuf,
        read_write: bool,
        free: Option<u64>,
    ) {
        self.mount_state = MountState::Mounted { mount_point, read_write };
        self.free_bytes = free.map(|bytes| bytes.min(self.size_bytes));
    }

    pub(crate) fn set_state(&mut self, state: MountState) {
        if !state.is_mounted() {
            self.free_bytes = None;
        }
        self.mount_state = state;
    }
}
