//! Background execution for callers that must not block, such as a UI
//! thread. Every call returns immediately with a `JoinHandle`; the work runs
//! on the given tokio runtime.

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::{ScanReport, UnmountOutcome, Volume, VolumeError, VolumeEvent, VolumeRegistry};

#[derive(Clone)]
pub struct VolumeService {
    registry: Arc<VolumeRegistry>,
    runtime: Handle,
}

impl VolumeService {
    pub fn new(registry: Arc<VolumeRegistry>, runtime: Handle) -> Self {
        Self { registry, runtime }
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VolumeEvent> {
        self.registry.subscribe()
    }

    pub fn scan(&self) -> JoinHandle<ScanReport> {
        let registry = self.registry.clone();
        self.runtime.spawn(async move { registry.scan().await })
    }

    pub fn mount(
        &self,
        device_path: impl Into<String>,
        read_write: bool,
    ) -> JoinHandle<Result<Volume, VolumeError>> {
        let registry = self.registry.clone();
        let device_path = device_path.into();
        self.runtime
            .spawn(async move { registry.request_mount(&device_path, read_write).await })
    }

    pub fn unmount(
        &self,
        device_path: impl Into<String>,
    ) -> JoinHandle<Result<Volume, VolumeError>> {
        let registry = self.registry.clone();
        let device_path = device_path.into();
        self.runtime
            .spawn(async move { registry.request_unmount(&device_path).await })
    }

    pub fn unmount_all(&self) -> JoinHandle<Vec<UnmountOutcome>> {
        let registry = self.registry.clone();
        self.runtime.spawn(async move { registry.unmount_all().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeHost;
    use crate::MountState;

    #[test]
    fn operations_run_off_the_calling_thread() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let host = FakeHost::new();
        host.add_ntfs("/dev/sdb1", "Backup", 1_000_000);
        let service = VolumeService::new(Arc::new(host.registry()), runtime.handle().clone());
        let mut events = service.subscribe();

        // Called from a plain thread, like a UI event loop would.
        let scan = service.scan();
        let report = runtime.block_on(scan).unwrap();
        assert_eq!(report.volumes.len(), 1);

        let mounted = runtime.block_on(service.mount("/dev/sdb1", false)).unwrap().unwrap();
        assert!(matches!(mounted.mount_state, MountState::Mounted { read_write: false, .. }));

        let first = events.try_recv().unwrap();
        assert_eq!(first.device_path(), "/dev/sdb1");
    }
}
