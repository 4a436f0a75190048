use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::volume::MountState;

/// Listing the host's block devices failed as a whole.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnumerationError {
    #[error("Permission denied while listing devices: {0}")]
    PermissionDenied(String),

    #[error("Device enumeration is not supported on this platform")]
    Unsupported,

    #[error("Device query failed: {0}")]
    Query(String),
}

/// Failure reported by a [`MountExecutor`](crate::MountExecutor).
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum MountError {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Device is already mounted")]
    AlreadyMounted,

    #[error("Device is busy")]
    DeviceBusy,

    #[error("Device not found")]
    NotFound,

    #[error("Read-write NTFS mounting is not supported on this host")]
    UnsupportedReadWrite,

    #[error("Mount operation failed: {0}")]
    Unknown(String),
}

impl MountError {
    /// Busy and permission failures may succeed once the cause is gone.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeviceBusy | Self::PermissionDenied)
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied => {
                "Permission denied. Mounting requires root (CAP_SYS_ADMIN).".to_string()
            }
            Self::AlreadyMounted => {
                "The device is already mounted. Rescan to pick up its mount point.".to_string()
            }
            Self::DeviceBusy => {
                "The volume is in use. Close open files on it and try again.".to_string()
            }
            Self::NotFound => "The device is no longer attached.".to_string(),
            Self::UnsupportedReadWrite => {
                "No NTFS driver with safe write support is available; mount read-only instead."
                    .to_string()
            }
            Self::Unknown(detail) => format!("An error occurred: {}", detail),
        }
    }
}

/// Which lifecycle operation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Mount,
    Unmount,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mount => f.write_str("mount"),
            Self::Unmount => f.write_str("unmount"),
        }
    }
}

/// Error returned by registry lifecycle operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VolumeError {
    #[error(
        "Cannot {operation} {device_path}: volume is {}",
        .current.as_ref().map_or_else(|| "unknown".to_string(), ToString::to_string)
    )]
    InvalidState {
        device_path: String,
        operation: Operation,
        current: Option<MountState>,
    },

    #[error(transparent)]
    Mount(#[from] MountError),
}

impl VolumeError {
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    pub fn mount_error(&self) -> Option<&MountError> {
        match self {
            Self::Mount(err) => Some(err),
            Self::InvalidState { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_names_the_current_state() {
        let err = VolumeError::InvalidState {
            device_path: "/dev/sdb1".to_string(),
            operation: Operation::Mount,
            current: Some(MountState::Mounting),
        };
        assert_eq!(err.to_string(), "Cannot mount /dev/sdb1: volume is mounting");

        let unknown = VolumeError::InvalidState {
            device_path: "/dev/sdz9".to_string(),
            operation: Operation::Unmount,
            current: None,
        };
        assert!(unknown.to_string().ends_with("volume is unknown"));
        assert!(unknown.is_invalid_state());
    }

    #[test]
    fn mount_error_serializes_with_kind_tag() {
        let json = serde_json::to_string(&MountError::DeviceBusy).unwrap();
        assert_eq!(json, r#"{"kind":"DeviceBusy"}"#);
        let json = serde_json::to_string(&MountError::Unknown("EIO".into())).unwrap();
        assert_eq!(json, r#"{"kind":"Unknown","detail":"EIO"}"#);
    }

    #[test]
    fn busy_is_retryable() {
        assert!(MountError::DeviceBusy.is_retryable());
        assert!(!MountError::NotFound.is_retryable());
        assert!(MountError::PermissionDenied.user_message().contains("root"));
    }
}
