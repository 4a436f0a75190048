use super::mountinfo::{parse_mountinfo, MountInfo, MOUNTINFO_PATH};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::statvfs::statvfs;
use ntfsman_core::{mount_point_for, ActiveMount, Config, MountError, MountExecutor, NtfsDriver};
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

const KERNEL_DRIVER: &str = "ntfs3";
/// Read-only driver of older kernels.
const LEGACY_DRIVER: &str = "ntfs";
const FUSE_HELPER: &str = "ntfs-3g";

/// Mounts NTFS volumes with the kernel `ntfs3` driver or the `ntfs-3g`
/// helper. Needs `CAP_SYS_ADMIN`.
pub struct LinuxMountExecutor {
    mount_root: PathBuf,
    driver: NtfsDriver,
    allow_read_write: bool,
    options: Vec<String>,
    mountinfo: PathBuf,
}

impl LinuxMountExecutor {
    pub fn new(config: &Config) -> Self {
        Self {
            mount_root: config.mount_root.clone(),
            driver: config.driver,
            allow_read_write: config.allow_read_write,
            options: config.mount_options.clone(),
            mountinfo: PathBuf::from(MOUNTINFO_PATH),
        }
    }

    async fn read_mountinfo(&self) -> Result<Vec<MountInfo>, MountError> {
        let content = tokio::fs::read_to_string(&self.mountinfo)
            .await
            .map_err(|e| io_error(&self.mountinfo, e))?;
        Ok(parse_mountinfo(&content))
    }

    async fn kernel_mount(
        &self,
        device: &str,
        target: &Path,
        fstype: &'static str,
        read_write: bool,
    ) -> Result<(), Errno> {
        let device = device.to_string();
        let target = target.to_path_buf();
        let data = self.options.join(",");
        let result = tokio::task::spawn_blocking(move || {
            let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
            if !read_write {
                flags |= MsFlags::MS_RDONLY;
            }
            let data = (!data.is_empty()).then_some(data.as_str());
            mount(Some(device.as_str()), target.as_path(), Some(fstype), flags, data)
        })
        .await;
        // A panicked blocking task is reported like an I/O failure.
        result.unwrap_or(Err(Errno::EIO))
    }

    async fn fuse_mount(
        &self,
        device: &str,
        target: &Path,
        read_write: bool,
    ) -> Result<(), MountError> {
        let helper = which::which(FUSE_HELPER)
            .map_err(|_| MountError::Unknown(format!("{} is not installed", FUSE_HELPER)))?;
        let mut options = vec![if read_write { "rw" } else { "ro" }.to_string()];
        options.extend(self.options.iter().cloned());

        let output = Command::new(&helper)
            .arg("-o")
            .arg(options.join(","))
            .arg(device)
            .arg(target)
            .output()
            .await
            .map_err(|e| io_error(&helper, e))?;
        if output.status.success() {
            return Ok(());
        }
        Err(fuse_error(&String::from_utf8_lossy(&output.stderr), read_write))
    }

    async fn mount_with_driver(
        &self,
        device: &str,
        target: &Path,
        read_write: bool,
    ) -> Result<&'static str, MountError> {
        match self.driver {
            NtfsDriver::Fuse => self
                .fuse_mount(device, target, read_write)
                .await
                .map(|_| FUSE_HELPER),
            NtfsDriver::Kernel => self
                .kernel_mount(device, target, KERNEL_DRIVER, read_write)
                .await
                .map(|_| KERNEL_DRIVER)
                .map_err(|errno| mount_errno(errno, read_write)),
            NtfsDriver::Auto => {
                match self.kernel_mount(device, target, KERNEL_DRIVER, read_write).await {
                    Ok(()) => Ok(KERNEL_DRIVER),
                    Err(Errno::ENODEV) => self.fallback_mount(device, target, read_write).await,
                    Err(errno) => Err(mount_errno(errno, read_write)),
                }
            }
        }
    }

    /// The kernel lacks `ntfs3`: try `ntfs-3g`, then the read-only legacy driver.
    async fn fallback_mount(
        &self,
        device: &str,
        target: &Path,
        read_write: bool,
    ) -> Result<&'static str, MountError> {
        debug!("Kernel has no {} driver, falling back", KERNEL_DRIVER);
        if which::which(FUSE_HELPER).is_ok() {
            return self
                .fuse_mount(device, target, read_write)
                .await
                .map(|_| FUSE_HELPER);
        }
        if read_write {
            return Err(MountError::UnsupportedReadWrite);
        }
        match self.kernel_mount(device, target, LEGACY_DRIVER, false).await {
            Ok(()) => Ok(LEGACY_DRIVER),
            Err(Errno::ENODEV) => Err(MountError::Unknown("No NTFS driver available".to_string())),
            Err(errno) => Err(mount_errno(errno, false)),
        }
    }

    async fn remove_mount_point(&self, target: &Path) {
        if !target.starts_with(&self.mount_root) {
            return;
        }
        // Only succeeds on an empty directory, which is all we want to remove.
        if let Err(e) = tokio::fs::remove_dir(target).await {
            debug!("Leaving mount point {}: {}", target.display(), e);
        }
    }
}

#[async_trait::async_trait]
impl MountExecutor for LinuxMountExecutor {
    async fn mount(&self, device_path: &str, read_write: bool) -> Result<PathBuf, MountError> {
        if read_write && !self.allow_read_write {
            return Err(MountError::UnsupportedReadWrite);
        }

        let canonical = tokio::fs::canonicalize(device_path)
            .await
            .map_err(|e| io_error(Path::new(device_path), e))?;
        let canonical = canonical.to_string_lossy();
        let already = self
            .read_mountinfo()
            .await?
            .iter()
            .any(|m| m.source == device_path || m.source == canonical);
        if already {
            return Err(MountError::AlreadyMounted);
        }

        let target = mount_point_for(&self.mount_root, device_path);
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| io_error(&target, e))?;

        match self.mount_with_driver(device_path, &target, read_write).await {
            Ok(driver) => {
                info!("Mounted {} at {} with {}", device_path, target.display(), driver);
                Ok(target)
            }
            Err(e) => {
                self.remove_mount_point(&target).await;
                Err(e)
            }
        }
    }

    async fn unmount(&self, mount_point: &Path) -> Result<(), MountError> {
        let target = mount_point.to_path_buf();
        tokio::task::spawn_blocking(move || umount2(target.as_path(), MntFlags::empty()))
            .await
            .map_err(|e| MountError::Unknown(format!("unmount task failed: {}", e)))?
            .map_err(unmount_errno)?;
        self.remove_mount_point(mount_point).await;
        Ok(())
    }

    async fn active_mounts(&self) -> Result<Vec<ActiveMount>, MountError> {
        Ok(self
            .read_mountinfo()
            .await?
            .into_iter()
            .filter(|m| m.source.starts_with("/dev/"))
            .map(|m| ActiveMount {
                device_path: m.source,
                mount_point: m.mount_point,
                read_write: m.read_write,
            })
            .collect())
    }

    async fn free_bytes(&self, mount_point: &Path) -> Result<u64, MountError> {
        let target = mount_point.to_path_buf();
        let stats = tokio::task::spawn_blocking(move || statvfs(target.as_path()))
            .await
            .map_err(|e| MountError::Unknown(format!("statvfs task failed: {}", e)))?
            .map_err(|errno| match errno {
                Errno::ENOENT | Errno::ENOTDIR => MountError::NotFound,
                Errno::EACCES | Errno::EPERM => MountError::PermissionDenied,
                other => {
                    MountError::Unknown(format!("statvfs {}: {}", mount_point.display(), other))
                }
            })?;
        Ok(stats.blocks_available() as u64 * stats.fragment_size() as u64)
    }
}

fn mount_errno(errno: Errno, read_write: bool) -> MountError {
    match errno {
        Errno::EPERM | Errno::EACCES => MountError::PermissionDenied,
        Errno::EBUSY => MountError::AlreadyMounted,
        Errno::ENOENT | Errno::ENXIO | Errno::ENOTBLK => MountError::NotFound,
        Errno::EROFS if read_write => MountError::UnsupportedReadWrite,
        other => MountError::Unknown(format!("mount: {}", other)),
    }
}

fn unmount_errno(errno: Errno) -> MountError {
    match errno {
        Errno::EBUSY => MountError::DeviceBusy,
        Errno::EPERM => MountError::PermissionDenied,
        Errno::EINVAL | Errno::ENOENT => MountError::NotFound,
        other => MountError::Unknown(format!("umount: {}", other)),
    }
}

fn io_error(path: &Path, error: io::Error) -> MountError {
    match error.kind() {
        io::ErrorKind::PermissionDenied => MountError::PermissionDenied,
        io::ErrorKind::NotFound => MountError::NotFound,
        _ => MountError::Unknown(format!("{}: {}", path.display(), error)),
    }
}

/// Map `ntfs-3g` stderr to a mount error.
fn fuse_error(stderr: &str, read_write: bool) -> MountError {
    let message = stderr.to_lowercase();
    let refuses_writes = message.contains("hibernat")
        || message.contains("unclean")
        || message.contains("read-only");
    if read_write && refuses_writes {
        return MountError::UnsupportedReadWrite;
    }
    if message.contains("permission denied") || message.contains("operation not permitted") {
        return MountError::PermissionDenied;
    }
    if message.contains("already mounted") || message.contains("busy") {
        return MountError::AlreadyMounted;
    }
    if message.contains("no such file") {
        return MountError::NotFound;
    }
    let first = stderr.lines().find(|l| !l.trim().is_empty()).unwrap_or("unknown error");
    warn!("{} failed: {}", FUSE_HELPER, stderr.trim());
    MountError::Unknown(format!("{}: {}", FUSE_HELPER, first.trim()))
}
