use ntfsman_core::{DeviceDescriptor, DeviceEnumerator, EnumerationError};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

const SYS_CLASS_BLOCK: &str = "/sys/class/block";

/// Lists block devices through `lsblk`, or straight from sysfs when `lsblk`
/// cannot be run.
pub struct LinuxDeviceEnumerator {
    sys_block: PathBuf,
}

impl Default for LinuxDeviceEnumerator {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from(SYS_CLASS_BLOCK),
        }
    }
}

impl LinuxDeviceEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_skipped(name: &str) -> bool {
        name.starts_with("ram") || name.starts_with("zram")
    }

    /// Partition number from sysfs, 0 for whole disks.
    fn partition_index(&self, kernel_name: &str) -> u32 {
        fs::read_to_string(self.sys_block.join(kernel_name).join("partition"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Parse `KEY="value"` pairs as printed by `lsblk -P`.
    fn parse_pairs(line: &str) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        let mut current_key = String::new();
        let mut current_value = String::new();
        let mut in_quotes = false;
        let mut escape_next = false;

        for ch in line.chars() {
            if escape_next {
                current_value.push(ch);
                escape_next = false;
                continue;
            }
            match ch {
                '\\' if in_quotes => escape_next = true,
                '"' => {
                    in_quotes = !in_quotes;
                    if !in_quotes && !current_key.is_empty() {
                        let key = std::mem::take(&mut current_key);
                        fields.insert(key, std::mem::take(&mut current_value));
                    }
                }
                '=' | ' ' if !in_quotes => {}
                _ if in_quotes => current_value.push(ch),
                _ => current_key.push(ch),
            }
        }
        fields
    }

    fn descriptors_from_lsblk(&self, output: &str) -> Vec<DeviceDescriptor> {
        let mut devices = Vec::new();
        for line in output.lines() {
            let fields = Self::parse_pairs(line);
            let kind = fields.get("TYPE").map(String::as_str).unwrap_or("");
            if !matches!(kind, "disk" | "part" | "loop") {
                continue;
            }
            let name = match fields.get("NAME") {
                Some(name) if !name.is_empty() => name,
                _ => continue,
            };
            if Self::is_skipped(name) {
                continue;
            }
            let size = fields.get("SIZE").and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
            if size == 0 {
                continue;
            }
            let kernel_name = fields.get("KNAME").unwrap_or(name);
            devices.push(DeviceDescriptor::new(
                format!("/dev/{}", name),
                size,
                self.partition_index(kernel_name),
            ));
        }
        devices
    }

    async fn list_with_lsblk(&self) -> io::Result<Vec<DeviceDescriptor>> {
        let output = Command::new("lsblk")
            .args(["-b", "-P", "-o", "NAME,KNAME,SIZE,TYPE"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "lsblk exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(self.descriptors_from_lsblk(&String::from_utf8_lossy(&output.stdout)))
    }

    fn list_from_sysfs(&self) -> Result<Vec<DeviceDescriptor>, EnumerationError> {
        let entries = fs::read_dir(&self.sys_block).map_err(|e| sysfs_error(&self.sys_block, e))?;

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| sysfs_error(&self.sys_block, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if Self::is_skipped(&name) {
                continue;
            }

            // sysfs sizes are in 512-byte sectors regardless of the device
            let size = fs::read_to_string(entry.path().join("size"))
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(0)
                * 512;
            if size == 0 {
                continue;
            }
            let index = self.partition_index(&name);
            devices.push(DeviceDescriptor::new(format!("/dev/{}", name), size, index));
        }
        Ok(devices)
    }
}

fn sysfs_error(path: &Path, error: io::Error) -> EnumerationError {
    match error.kind() {
        io::ErrorKind::PermissionDenied => {
            EnumerationError::PermissionDenied(path.display().to_string())
        }
        io::ErrorKind::NotFound => EnumerationError::Unsupported,
        _ => EnumerationError::Query(format!("Failed to read {}: {}", path.display(), error)),
    }
}

#[async_trait::async_trait]
impl DeviceEnumerator for LinuxDeviceEnumerator {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, EnumerationError> {
        let mut devices = match self.list_with_lsblk().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("lsblk unavailable ({}), reading {}", e, self.sys_block.display());
                self.list_from_sysfs()?
            }
        };
        devices.sort_by(|a, b| a.device_path.cmp(&b.device_path));
        debug!("Enumerated {} block devices", devices.len());
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_sysfs(entries: &[(&str, u64, Option<u32>)]) -> TempDir {
        let root = TempDir::new().unwrap();
        for (name, sectors, partition) in entries {
            let dir = root.path().join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("size"), format!("{}\n", sectors)).unwrap();
            if let Some(index) = partition {
                fs::write(dir.join("partition"), format!("{}\n", index)).unwrap();
            }
        }
        root
    }

    #[test]
    fn test_parse_lsblk_pairs() {
        let line = r#"NAME="sdb1" KNAME="sdb1" SIZE="500107862016" TYPE="part""#;
        let fields = LinuxDeviceEnumerator::parse_pairs(line);
        assert_eq!(fields["NAME"], "sdb1");
        assert_eq!(fields["SIZE"], "500107862016");
        assert_eq!(fields["TYPE"], "part");
    }

    #[test]
    fn test_parse_lsblk_escaped_quote() {
        let fields = LinuxDeviceEnumerator::parse_pairs(r#"NAME="odd\"name" TYPE="disk""#);
        assert_eq!(fields["NAME"], "odd\"name");
    }

    #[test]
    fn test_lsblk_rows_filtered() {
        let sysfs = fake_sysfs(&[("sdb1", 0, Some(1)), ("nvme0n1p3", 0, Some(3))]);
        let enumerator = LinuxDeviceEnumerator {
            sys_block: sysfs.path().to_path_buf(),
        };
        let output = concat!(
            "NAME=\"sdb\" KNAME=\"sdb\" SIZE=\"1000204886016\" TYPE=\"disk\"\n",
            "NAME=\"sdb1\" KNAME=\"sdb1\" SIZE=\"1000203837440\" TYPE=\"part\"\n",
            "NAME=\"sr0\" KNAME=\"sr0\" SIZE=\"1073741312\" TYPE=\"rom\"\n",
            "NAME=\"zram0\" KNAME=\"zram0\" SIZE=\"8589934592\" TYPE=\"disk\"\n",
            "NAME=\"loop7\" KNAME=\"loop7\" SIZE=\"0\" TYPE=\"loop\"\n",
            "NAME=\"nvme0n1p3\" KNAME=\"nvme0n1p3\" SIZE=\"255013683200\" TYPE=\"part\"\n",
        );

        let devices = enumerator.descriptors_from_lsblk(output);

        let paths: Vec<_> = devices.iter().map(|d| d.device_path.as_str()).collect();
        assert_eq!(paths, vec!["/dev/sdb", "/dev/sdb1", "/dev/nvme0n1p3"]);
        assert_eq!(devices[0].partition_index, 0);
        assert_eq!(devices[1].partition_index, 1);
        assert_eq!(devices[2].partition_index, 3);
        assert_eq!(devices[2].size_bytes, 255_013_683_200);
    }

    #[test]
    fn test_sysfs_fallback() {
        let sysfs = fake_sysfs(&[
            ("sdc", 1_953_525_168, None),
            ("sdc1", 1_953_521_664, Some(1)),
            ("ram0", 8192, None),
            ("sr0", 0, None),
        ]);
        let enumerator = LinuxDeviceEnumerator {
            sys_block: sysfs.path().to_path_buf(),
        };

        let mut devices = enumerator.list_from_sysfs().unwrap();
        devices.sort_by(|a, b| a.device_path.cmp(&b.device_path));

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_path, "/dev/sdc");
        assert_eq!(devices[0].size_bytes, 1_953_525_168 * 512);
        assert_eq!(devices[1].device_path, "/dev/sdc1");
        assert_eq!(devices[1].partition_index, 1);
    }

    #[test]
    fn test_missing_sysfs_is_unsupported() {
        let enumerator = LinuxDeviceEnumerator {
            sys_block: PathBuf::from("/nonexistent/sys/class/block"),
        };
        assert_eq!(enumerator.list_from_sysfs().unwrap_err(), EnumerationError::Unsupported);
    }
}
