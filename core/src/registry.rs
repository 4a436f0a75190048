//! The authoritative set of known NTFS volumes.
//!
//! Each device path owns an independently locked slot. The slot map lock is
//! only held to look up, insert or remove slots, and a slot lock is never
//! held while the executor is mounting or unmounting, so unrelated devices
//! never wait on each other.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    ActiveMount, ClassificationResult, DeviceDescriptor, DeviceEnumerator, EnumerationError,
    FilesystemClassifier, MountError, MountExecutor, MountState, NtfsInfo, Operation, Volume,
    VolumeError, VolumeEvent,
};

pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Outcome of one scan pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Visible volumes, sorted by device path.
    pub volumes: Vec<Volume>,
    /// Devices whose signature could not be read this pass.
    pub unreadable: Vec<UnreadableDevice>,
    /// Set when device enumeration failed; `volumes` is then the previous view.
    pub error: Option<EnumerationError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadableDevice {
    pub device_path: String,
    pub reason: String,
}

/// Result of unmounting one device during [`VolumeRegistry::unmount_all`].
pub type UnmountOutcome = (String, Result<Volume, VolumeError>);

struct VolumeSlot {
    volume: Volume,
    // Last known OS mount. Survives `Failed` so a busy unmount can be retried.
    os_mount: Option<ActiveMount>,
    // Bumped on every mount/unmount transition. A scan only reconciles the
    // mount state when this is unchanged since it read the mount table.
    generation: u64,
}

impl VolumeSlot {
    fn transition(&mut self, state: MountState) {
        self.volume.set_state(state);
        self.generation += 1;
    }
}

type SlotRef = Arc<Mutex<VolumeSlot>>;

pub struct VolumeRegistry {
    enumerator: Arc<dyn DeviceEnumerator>,
    classifier: Arc<dyn FilesystemClassifier>,
    executor: Arc<dyn MountExecutor>,
    slots: RwLock<HashMap<String, SlotRef>>,
    events: broadcast::Sender<VolumeEvent>,
}

impl VolumeRegistry {
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        classifier: Arc<dyn FilesystemClassifier>,
        executor: Arc<dyn MountExecutor>,
    ) -> Self {
        Self::with_event_capacity(enumerator, classifier, executor, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(
        enumerator: Arc<dyn DeviceEnumerator>,
        classifier: Arc<dyn FilesystemClassifier>,
        executor: Arc<dyn MountExecutor>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            enumerator,
            classifier,
            executor,
            slots: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Receive `VolumeChanged` / `VolumeRemoved` notifications.
    ///
    /// A receiver that falls more than the event capacity behind sees
    /// `RecvError::Lagged` and should rescan.
    pub fn subscribe(&self) -> broadcast::Receiver<VolumeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: VolumeEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Rediscover devices and merge them into the registry.
    pub async fn scan(&self) -> ScanReport {
        let descriptors = match self.enumerator.list_devices().await {
            Ok(descriptors) => descriptors,
            Err(error) => {
                warn!("Device enumeration failed: {}", error);
                return ScanReport {
                    volumes: self.volumes().await,
                    unreadable: Vec::new(),
                    error: Some(error),
                };
            }
        };

        // Taken before the mount table so transitions that finish while the
        // table goes stale are detected in `merge`.
        let generations = self.generations().await;
        let mounts = match self.executor.active_mounts().await {
            Ok(mounts) => Some(mounts),
            Err(e) => {
                warn!("Mount table unavailable, keeping current mount states: {}", e);
                None
            }
        };

        let classifier = &self.classifier;
        let classified = join_all(
            descriptors
                .iter()
                .map(|device| async move { (device, classifier.classify(device).await) }),
        )
        .await;

        let mut present = HashSet::new();
        let mut unreadable = Vec::new();
        for (device, result) in classified {
            match result {
                ClassificationResult::Ntfs(info) => {
                    present.insert(device.device_path.clone());
                    let seen = generations.get(&device.device_path).copied();
                    self.merge(device, info, mounts.as_deref(), seen).await;
                }
                ClassificationResult::NotNtfs => {
                    debug!(device = %device.device_path, "not NTFS");
                }
                ClassificationResult::Unreadable(reason) => {
                    warn!("Skipping unreadable device {}: {}", device.device_path, reason);
                    // A known volume stays as it is until the device is really gone.
                    present.insert(device.device_path.clone());
                    unreadable.push(UnreadableDevice {
                        device_path: device.device_path.clone(),
                        reason,
                    });
                }
            }
        }

        self.drop_missing(&present).await;

        ScanReport {
            volumes: self.volumes().await,
            unreadable,
            error: None,
        }
    }

    async fn merge(
        &self,
        device: &DeviceDescriptor,
        info: NtfsInfo,
        mounts: Option<&[ActiveMount]>,
        seen: Option<u64>,
    ) {
        let path = &device.device_path;
        let os_mount =
            mounts.and_then(|mounts| mounts.iter().find(|m| &m.device_path == path).cloned());
        let free = match &os_mount {
            Some(mount) => self.query_free(&mount.mount_point).await,
            None => None,
        };

        let existing = {
            let mut slots = self.slots.write().await;
            match slots.get(path) {
                Some(slot) => slot.clone(),
                None => {
                    let mut volume = Volume::discovered(path, info.label, info.size_bytes);
                    if let Some(mount) = &os_mount {
                        volume.set_mounted(mount.mount_point.clone(), mount.read_write, free);
                    }
                    info!("Discovered NTFS volume {} ({})", path, volume.mount_state);
                    // Emitted under the map lock so nobody can act on the slot first.
                    self.emit(VolumeEvent::VolumeChanged(volume.clone()));
                    let slot = VolumeSlot {
                        volume,
                        os_mount,
                        generation: 0,
                    };
                    slots.insert(path.clone(), Arc::new(Mutex::new(slot)));
                    return;
                }
            }
        };

        let mut slot = existing.lock().await;
        if slot.volume.mount_state.is_in_flight() {
            debug!(
                device = %path,
                state = %slot.volume.mount_state,
                "operation in flight, leaving volume untouched"
            );
            return;
        }

        let before = slot.volume.clone();
        slot.volume.label = info.label;
        slot.volume.size_bytes = info.size_bytes;
        // A mount or unmount that settled after the table was read is newer.
        let current = seen == Some(slot.generation);
        if !current {
            debug!(device = %path, "mount state changed during scan, keeping it");
        }
        let mounts = mounts.filter(|_| current);
        match (mounts, &os_mount) {
            (Some(_), Some(mount)) => {
                slot.volume.set_mounted(mount.mount_point.clone(), mount.read_write, free);
                slot.os_mount = Some(mount.clone());
            }
            (Some(_), None) => {
                slot.volume.set_state(MountState::Unmounted);
                slot.os_mount = None;
            }
            (None, _) => {
                let size = slot.volume.size_bytes;
                slot.volume.free_bytes = slot.volume.free_bytes.map(|bytes| bytes.min(size));
            }
        }

        if slot.volume != before {
            debug!(device = %path, state = %slot.volume.mount_state, "volume updated by scan");
            self.emit(VolumeEvent::VolumeChanged(slot.volume.clone()));
        }
    }

    async fn drop_missing(&self, present: &HashSet<String>) {
        let mut slots = self.slots.write().await;
        let mut gone = Vec::new();
        for (path, slot) in slots.iter() {
            if present.contains(path) {
                continue;
            }
            let mut slot = slot.lock().await;
            if slot.volume.mount_state.is_in_flight() {
                debug!(device = %path, "device missing but operation in flight, keeping it");
                continue;
            }
            info!("Volume {} removed", path);
            slot.volume.set_state(MountState::Removed);
            slot.os_mount = None;
            self.emit(VolumeEvent::VolumeRemoved(path.clone()));
            gone.push(path.clone());
        }
        for path in gone {
            slots.remove(&path);
        }
    }

    /// Mount a volume known from the last scan.
    ///
    /// Only an `Unmounted` volume (or a `Failed` one the OS does not hold
    /// mounted) can be mounted; anything else, including an unknown device,
    /// is `InvalidState`. Concurrent calls for the same device race on the
    /// slot lock and exactly one of them reaches the executor.
    pub async fn request_mount(
        &self,
        device_path: &str,
        read_write: bool,
    ) -> Result<Volume, VolumeError> {
        let slot = self
            .slot(device_path)
            .await
            .ok_or_else(|| invalid_state(device_path, Operation::Mount, None))?;

        {
            let mut slot = slot.lock().await;
            let ready = match &slot.volume.mount_state {
                MountState::Unmounted => true,
                MountState::Failed { .. } => slot.os_mount.is_none(),
                _ => false,
            };
            if !ready {
                let current = slot.volume.mount_state.clone();
                return Err(invalid_state(device_path, Operation::Mount, Some(current)));
            }
            slot.transition(MountState::Mounting);
            self.emit(VolumeEvent::VolumeChanged(slot.volume.clone()));
        }

        info!(device = device_path, read_write, "Mounting volume");
        let result = self.executor.mount(device_path, read_write).await;
        let free = match &result {
            Ok(mount_point) => self.query_free(mount_point).await,
            Err(_) => None,
        };

        let mut slot = slot.lock().await;
        match result {
            Ok(mount_point) => {
                info!("Mounted {} at {}", device_path, mount_point.display());
                slot.os_mount = Some(ActiveMount {
                    device_path: device_path.to_string(),
                    mount_point: mount_point.clone(),
                    read_write,
                });
                slot.volume.set_mounted(mount_point, read_write, free);
                slot.generation += 1;
                self.emit(VolumeEvent::VolumeChanged(slot.volume.clone()));
                Ok(slot.volume.clone())
            }
            Err(err) => {
                warn!("Mounting {} failed: {}", device_path, err);
                slot.transition(MountState::failed(err.clone()));
                self.emit(VolumeEvent::VolumeChanged(slot.volume.clone()));
                Err(VolumeError::Mount(err))
            }
        }
    }

    /// Unmount a mounted volume. A busy volume ends up `Failed(DeviceBusy)`
    /// while staying mounted at the OS level.
    pub async fn request_unmount(&self, device_path: &str) -> Result<Volume, VolumeError> {
        let slot = self
            .slot(device_path)
            .await
            .ok_or_else(|| invalid_state(device_path, Operation::Unmount, None))?;

        let mounted = {
            let mut slot = slot.lock().await;
            let mounted = match (&slot.volume.mount_state, &slot.os_mount) {
                (MountState::Mounted { mount_point, read_write }, _) => ActiveMount {
                    device_path: device_path.to_string(),
                    mount_point: mount_point.clone(),
                    read_write: *read_write,
                },
                (MountState::Failed { .. }, Some(os_mount)) => os_mount.clone(),
                (state, _) => {
                    let current = state.clone();
                    return Err(invalid_state(device_path, Operation::Unmount, Some(current)));
                }
            };
            slot.transition(MountState::Unmounting);
            self.emit(VolumeEvent::VolumeChanged(slot.volume.clone()));
            mounted
        };

        info!(
            device = device_path,
            mount_point = %mounted.mount_point.display(),
            "Unmounting volume"
        );
        let result = self.executor.unmount(&mounted.mount_point).await;

        let mut slot = slot.lock().await;
        match result {
            Ok(()) => {
                info!("Unmounted {}", device_path);
                slot.os_mount = None;
                slot.transition(MountState::Unmounted);
                self.emit(VolumeEvent::VolumeChanged(slot.volume.clone()));
                Ok(slot.volume.clone())
            }
            Err(err) => {
                warn!("Unmounting {} failed: {}", device_path, err);
                // Anything but NotFound means the OS still holds the mount.
                slot.os_mount = match err {
                    MountError::NotFound => None,
                    _ => Some(mounted),
                };
                slot.transition(MountState::failed(err.clone()));
                self.emit(VolumeEvent::VolumeChanged(slot.volume.clone()));
                Err(VolumeError::Mount(err))
            }
        }
    }

    /// Unmount every mounted volume concurrently. One failure does not stop
    /// the others; outcomes are reported per device path.
    pub async fn unmount_all(&self) -> Vec<UnmountOutcome> {
        let targets: Vec<String> = self
            .volumes()
            .await
            .into_iter()
            .filter(|volume| volume.mount_state.is_mounted())
            .map(|volume| volume.device_path)
            .collect();

        join_all(targets.into_iter().map(|device_path| async move {
            let result = self.request_unmount(&device_path).await;
            (device_path, result)
        }))
        .await
    }

    /// Current visible volumes, sorted by device path.
    pub async fn volumes(&self) -> Vec<Volume> {
        let slots: Vec<SlotRef> = self.slots.read().await.values().cloned().collect();
        let mut volumes = Vec::with_capacity(slots.len());
        for slot in slots {
            let slot = slot.lock().await;
            if slot.volume.mount_state != MountState::Removed {
                volumes.push(slot.volume.clone());
            }
        }
        volumes.sort_by(|a, b| a.device_path.cmp(&b.device_path));
        volumes
    }

    pub async fn volume(&self, device_path: &str) -> Option<Volume> {
        let slot = self.slot(device_path).await?;
        let slot = slot.lock().await;
        (slot.volume.mount_state != MountState::Removed).then(|| slot.volume.clone())
    }

    async fn generations(&self) -> HashMap<String, u64> {
        let slots: Vec<(String, SlotRef)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(path, slot)| (path.clone(), slot.clone()))
            .collect();
        let mut generations = HashMap::with_capacity(slots.len());
        for (path, slot) in slots {
            generations.insert(path, slot.lock().await.generation);
        }
        generations
    }

    async fn slot(&self, device_path: &str) -> Option<SlotRef> {
        self.slots.read().await.get(device_path).cloned()
    }

    async fn query_free(&self, mount_point: &Path) -> Option<u64> {
        match self.executor.free_bytes(mount_point).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!("free space of {} unavailable: {}", mount_point.display(), e);
                None
            }
        }
    }
}

fn invalid_state(
    device_path: &str,
    operation: Operation,
    current: Option<MountState>,
) -> VolumeError {
    VolumeError::InvalidState {
        device_path: device_path.to_string(),
        operation,
        current,
    }
}
