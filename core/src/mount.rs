use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::MountError;

/// An entry of the OS mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveMount {
    pub device_path: String,
    pub mount_point: PathBuf,
    pub read_write: bool,
}

/// Performs OS-level mounts. The only component allowed to change the
/// host's mount table.
///
/// `mount` returns only once the mount is visible in the mount table.
/// `unmount` must never force: open handles are reported as
/// [`MountError::DeviceBusy`].
#[async_trait::async_trait]
pub trait MountExecutor: Send + Sync {
    async fn mount(&self, device_path: &str, read_write: bool) -> Result<PathBuf, MountError>;

    async fn unmount(&self, mount_point: &Path) -> Result<(), MountError>;

    /// Current OS mount table, used to reconcile volume state on scan.
    async fn active_mounts(&self) -> Result<Vec<ActiveMount>, MountError>;

    async fn free_bytes(&self, mount_point: &Path) -> Result<u64, MountError>;
}

/// Mount point for a device under `root`: the device node's file name.
///
/// `/dev/sdb1` under `/mnt/ntfsman` becomes `/mnt/ntfsman/sdb1`.
pub fn mount_point_for(root: &Path, device_path: &str) -> PathBuf {
    let name: String = device_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(device_path)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = match name.trim_start_matches('.') {
        "" => "volume".to_string(),
        trimmed => trimmed.to_string(),
    };
    root.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_point_uses_device_name() {
        let root = Path::new("/mnt/ntfsman");
        assert_eq!(mount_point_for(root, "/dev/sdb1"), PathBuf::from("/mnt/ntfsman/sdb1"));
        assert_eq!(
            mount_point_for(root, "/dev/mapper/usb drive"),
            PathBuf::from("/mnt/ntfsman/usb_drive")
        );
    }

    #[test]
    fn mount_point_never_escapes_root() {
        let root = Path::new("/mnt/ntfsman");
        assert_eq!(mount_point_for(root, "/dev/.."), PathBuf::from("/mnt/ntfsman/volume"));
        assert_eq!(mount_point_for(root, ""), PathBuf::from("/mnt/ntfsman/volume"));
    }
}
