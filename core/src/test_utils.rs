/// Test utilities: an in-memory host that NEVER touches real hardware.
use crate::{
    mount_point_for, ActiveMount, ClassificationResult, DeviceDescriptor, DeviceEnumerator,
    EnumerationError, FilesystemClassifier, MountError, MountExecutor, NtfsInfo, VolumeRegistry,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Root under which [`FakeHost`] places its mount points.
pub const FAKE_MOUNT_ROOT: &str = "/mnt/fake";

/// Fake devices, filesystem signatures and mount table in one place.
///
/// Implements all three host traits so a registry can be built with
/// [`FakeHost::registry`]. Failures are injected per device.
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    devices: Vec<(DeviceDescriptor, ClassificationResult)>,
    mounts: Vec<ActiveMount>,
    mount_failures: HashMap<String, MountError>,
    unmount_failures: HashMap<String, MountError>,
    enumeration_error: Option<EnumerationError>,
    mount_table_error: Option<MountError>,
    free_bytes: Option<u64>,
    gates: HashMap<String, Arc<Notify>>,
    classify_gates: HashMap<String, Arc<Notify>>,
    enumerate_calls: usize,
    classify_calls: usize,
    mount_calls: usize,
    unmount_calls: usize,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn registry(self: &Arc<Self>) -> VolumeRegistry {
        VolumeRegistry::new(self.clone(), self.clone(), self.clone())
    }

    pub fn add_ntfs(&self, device_path: &str, label: &str, size_bytes: u64) {
        let info = NtfsInfo {
            label: label.to_string(),
            size_bytes,
            serial_number: 0,
            bytes_per_sector: 512,
            cluster_size: 4096,
        };
        self.add_device(device_path, size_bytes, ClassificationResult::Ntfs(info));
    }

    pub fn add_device(&self, device_path: &str, size_bytes: u64, result: ClassificationResult) {
        let mut state = self.state.lock().unwrap();
        state.devices.retain(|(d, _)| d.device_path != device_path);
        let index = state.devices.len() as u32 + 1;
        state
            .devices
            .push((DeviceDescriptor::new(device_path, size_bytes, index), result));
    }

    /// Unplug a device. Its mounts are left in the table, as a real kernel
    /// would until lazily cleaned up.
    pub fn remove_device(&self, device_path: &str) {
        let mut state = self.state.lock().unwrap();
        state.devices.retain(|(d, _)| d.device_path != device_path);
    }

    pub fn relabel(&self, device_path: &str, label: &str) {
        let mut state = self.state.lock().unwrap();
        for (_, result) in state.devices.iter_mut().filter(|(d, _)| d.device_path == device_path) {
            if let ClassificationResult::Ntfs(info) = result {
                info.label = label.to_string();
            }
        }
    }

    /// Record a mount made behind the registry's back.
    pub fn mount_externally(&self, device_path: &str, mount_point: &str, read_write: bool) {
        let mut state = self.state.lock().unwrap();
        state.mounts.push(ActiveMount {
            device_path: device_path.to_string(),
            mount_point: PathBuf::from(mount_point),
            read_write,
        });
    }

    pub fn fail_mount(&self, device_path: &str, error: MountError) {
        let mut state = self.state.lock().unwrap();
        state.mount_failures.insert(device_path.to_string(), error);
    }

    pub fn fail_unmount(&self, device_path: &str, error: MountError) {
        let mut state = self.state.lock().unwrap();
        state.unmount_failures.insert(device_path.to_string(), error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.mount_failures.clear();
        state.unmount_failures.clear();
    }

    pub fn fail_enumeration(&self, error: Option<EnumerationError>) {
        self.state.lock().unwrap().enumeration_error = error;
    }

    pub fn fail_mount_table(&self, error: Option<MountError>) {
        self.state.lock().unwrap().mount_table_error = error;
    }

    pub fn set_free_bytes(&self, bytes: u64) {
        self.state.lock().unwrap().free_bytes = Some(bytes);
    }

    /// Make mounts of `device_path` wait until the returned gate is notified.
    pub fn hold_mounts(&self, device_path: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        let mut state = self.state.lock().unwrap();
        state.gates.insert(device_path.to_string(), gate.clone());
        gate
    }

    /// Make the next classification of `device_path` wait until the returned
    /// gate is notified. Later classifications run freely.
    pub fn hold_classification(&self, device_path: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        let mut state = self.state.lock().unwrap();
        state.classify_gates.insert(device_path.to_string(), gate.clone());
        gate
    }

    pub fn is_mounted(&self, device_path: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.mounts.iter().any(|m| m.device_path == device_path)
    }

    pub fn enumerate_calls(&self) -> usize {
        self.state.lock().unwrap().enumerate_calls
    }

    pub fn classify_calls(&self) -> usize {
        self.state.lock().unwrap().classify_calls
    }

    pub fn mount_calls(&self) -> usize {
        self.state.lock().unwrap().mount_calls
    }

    pub fn unmount_calls(&self) -> usize {
        self.state.lock().unwrap().unmount_calls
    }
}

#[async_trait::async_trait]
impl DeviceEnumerator for FakeHost {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, EnumerationError> {
        let mut state = self.state.lock().unwrap();
        state.enumerate_calls += 1;
        if let Some(error) = &state.enumeration_error {
            return Err(error.clone());
        }
        Ok(state.devices.iter().map(|(d, _)| d.clone()).collect())
    }
}

#[async_trait::async_trait]
impl FilesystemClassifier for FakeHost {
    async fn classify(&self, device: &DeviceDescriptor) -> ClassificationResult {
        let gate = {
            let mut state = self.state.lock().unwrap();
            state.classify_calls += 1;
            state.classify_gates.remove(&device.device_path)
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let state = self.state.lock().unwrap();
        state
            .devices
            .iter()
            .find(|(d, _)| d.device_path == device.device_path)
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| {
                ClassificationResult::Unreadable(format!("{} vanished", device.device_path))
            })
    }
}

#[async_trait::async_trait]
impl MountExecutor for FakeHost {
    async fn mount(&self, device_path: &str, read_write: bool) -> Result<PathBuf, MountError> {
        let gate = {
            let mut state = self.state.lock().unwrap();
            state.mount_calls += 1;
            state.gates.get(device_path).cloned()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        // Let concurrent callers interleave with an in-flight mount.
        tokio::task::yield_now().await;

        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.mount_failures.get(device_path) {
            return Err(error.clone());
        }
        if !state.devices.iter().any(|(d, _)| d.device_path == device_path) {
            return Err(MountError::NotFound);
        }
        if state.mounts.iter().any(|m| m.device_path == device_path) {
            return Err(MountError::AlreadyMounted);
        }
        let mount_point = mount_point_for(Path::new(FAKE_MOUNT_ROOT), device_path);
        state.mounts.push(ActiveMount {
            device_path: device_path.to_string(),
            mount_point: mount_point.clone(),
            read_write,
        });
        Ok(mount_point)
    }

    async fn unmount(&self, mount_point: &Path) -> Result<(), MountError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        state.unmount_calls += 1;
        let position = state
            .mounts
            .iter()
            .position(|m| m.mount_point == mount_point)
            .ok_or(MountError::NotFound)?;
        if let Some(error) = state.unmount_failures.get(&state.mounts[position].device_path) {
            return Err(error.clone());
        }
        state.mounts.remove(position);
        Ok(())
    }

    async fn active_mounts(&self) -> Result<Vec<ActiveMount>, MountError> {
        let state = self.state.lock().unwrap();
        match &state.mount_table_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.mounts.clone()),
        }
    }

    async fn free_bytes(&self, mount_point: &Path) -> Result<u64, MountError> {
        let state = self.state.lock().unwrap();
        let mount = state
            .mounts
            .iter()
            .find(|m| m.mount_point == mount_point)
            .ok_or(MountError::NotFound)?;
        if let Some(bytes) = state.free_bytes {
            return Ok(bytes);
        }
        let size = state
            .devices
            .iter()
            .find(|(d, _)| d.device_path == mount.device_path)
            .map_or(0, |(d, _)| d.size_bytes);
        Ok(size / 2)
    }
}
