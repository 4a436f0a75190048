use serde::{Deserialize, Serialize};

use crate::Volume;

/// Change notification emitted by the registry.
///
/// Events for one device arrive in transition order; nothing is promised
/// across devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum VolumeEvent {
    VolumeChanged(Volume),
    /// Carries the device path of the dropped volume.
    VolumeRemoved(String),
}

impl VolumeEvent {
    pub fn device_path(&self) -> &str {
        match self {
            Self::VolumeChanged(volume) => &volume.device_path,
            Self::VolumeRemoved(device_path) => device_path,
        }
    }
}
