pub mod device;
pub mod mount;
pub mod mountinfo;

pub use device::LinuxDeviceEnumerator;
pub use mount::LinuxMountExecutor;
