//! NTFS identification from on-disk signature data.
//!
//! Only sector 0 and MFT record 3 (`$Volume`) are read; the device is always
//! opened read-only.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use tracing::debug;

use crate::DeviceDescriptor;

const BOOT_SECTOR_SIZE: usize = 512;
const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

const MFT_ENTRY_VOLUME: u64 = 3;
const FILE_RECORD_MAGIC: &[u8; 4] = b"FILE";
const ATTR_VOLUME_NAME: u32 = 0x60;
const ATTR_END: u32 = 0xFFFF_FFFF;
// Update sequence stride is fixed at 512 regardless of sector size.
const FIXUP_STRIDE: usize = 512;

/// What a device turned out to hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassificationResult {
    NotNtfs,
    Ntfs(NtfsInfo),
    Unreadable(String),
}

/// Label and geometry of an NTFS volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtfsInfo {
    pub label: String,
    pub size_bytes: u64,
    pub serial_number: u64,
    pub bytes_per_sector: u16,
    pub cluster_size: u32,
}

/// Determines the filesystem on a device.
///
/// Must never write to the device. A device that disappears between
/// enumeration and classification is `Unreadable`, not an error.
#[async_trait::async_trait]
pub trait FilesystemClassifier: Send + Sync {
    async fn classify(&self, device: &DeviceDescriptor) -> ClassificationResult;
}

/// Classifier reading the boot sector straight from the device node.
#[derive(Debug, Clone, Copy, Default)]
pub struct BootSectorClassifier;

#[async_trait::async_trait]
impl FilesystemClassifier for BootSectorClassifier {
    async fn classify(&self, device: &DeviceDescriptor) -> ClassificationResult {
        let path = device.device_path.clone();
        tokio::task::spawn_blocking(move || classify_path(&path))
            .await
            .unwrap_or_else(|e| {
                ClassificationResult::Unreadable(format!("classifier task failed: {}", e))
            })
    }
}

fn classify_path(path: &str) -> ClassificationResult {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return ClassificationResult::Unreadable(format!("{} vanished", path));
        }
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return ClassificationResult::Unreadable(format!("permission denied opening {}", path));
        }
        Err(e) => return ClassificationResult::Unreadable(format!("cannot open {}: {}", path, e)),
    };
    let result = classify_reader(&mut file);
    debug!(device = path, ?result, "classified device");
    result
}

/// Classify any seekable byte source holding a filesystem image.
pub fn classify_reader<R: Read + Seek>(reader: &mut R) -> ClassificationResult {
    let mut sector = [0u8; BOOT_SECTOR_SIZE];
    if let Err(e) = reader.seek(SeekFrom::Start(0)).and_then(|_| reader.read_exact(&mut sector)) {
        return match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                ClassificationResult::Unreadable("device is smaller than a boot sector".to_string())
            }
            _ => ClassificationResult::Unreadable(format!("failed to read boot sector: {}", e)),
        };
    }

    let Some(boot) = NtfsBootSector::parse(&sector) else {
        return ClassificationResult::NotNtfs;
    };

    let label = match boot.read_volume_label(reader) {
        Ok(label) => label.unwrap_or_default(),
        Err(e) => {
            debug!("volume label unavailable: {}", e);
            String::new()
        }
    };

    ClassificationResult::Ntfs(NtfsInfo {
        label,
        size_bytes: boot.size_bytes,
        serial_number: boot.serial_number,
        bytes_per_sector: boot.bytes_per_sector,
        cluster_size: boot.cluster_size,
    })
}

/// The fields of an NTFS boot sector this crate relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtfsBootSector {
    pub bytes_per_sector: u16,
    pub cluster_size: u32,
    pub size_bytes: u64,
    pub mft_lcn: u64,
    pub mft_record_size: u32,
    pub serial_number: u64,
}

impl NtfsBootSector {
    /// Returns `None` unless the sector is a plausible NTFS boot sector.
    pub fn parse(sector: &[u8]) -> Option<Self> {
        if sector.len() < BOOT_SECTOR_SIZE {
            return None;
        }
        if sector[0x1FE..0x200] != BOOT_SIGNATURE || &sector[0x03..0x0B] != NTFS_OEM_ID {
            return None;
        }

        let bytes_per_sector = LittleEndian::read_u16(&sector[0x0B..0x0D]);
        if ![512, 1024, 2048, 4096].contains(&bytes_per_sector) {
            return None;
        }

        // Values above 0x80 encode 2^-n sectors, used for clusters past 64 KiB.
        let raw_spc = sector[0x0D];
        let sectors_per_cluster: u32 = match raw_spc {
            0 => return None,
            1..=0x80 if raw_spc.is_power_of_two() => u32::from(raw_spc),
            0x81..=0xFF => {
                let shift = 256 - u32::from(raw_spc);
                if shift > 16 {
                    return None;
                }
                1 << shift
            }
            _ => return None,
        };
        let cluster_size = u32::from(bytes_per_sector).checked_mul(sectors_per_cluster)?;

        if LittleEndian::read_u16(&sector[0x0E..0x10]) != 0 {
            return None;
        }

        let total_sectors = LittleEndian::read_u64(&sector[0x28..0x30]);
        let size_bytes = total_sectors.checked_mul(u64::from(bytes_per_sector))?;
        let total_clusters = size_bytes / u64::from(cluster_size);

        let mft_lcn = LittleEndian::read_u64(&sector[0x30..0x38]);
        if mft_lcn == 0 || mft_lcn >= total_clusters {
            return None;
        }

        let raw_record = sector[0x40] as i8;
        let mft_record_size = if raw_record > 0 {
            cluster_size.checked_mul(raw_record as u32)?
        } else {
            let shift = u32::from(raw_record.unsigned_abs());
            if shift > 16 {
                return None;
            }
            1 << shift
        };
        if mft_record_size < FIXUP_STRIDE as u32 {
            return None;
        }

        Some(Self {
            bytes_per_sector,
            cluster_size,
            size_bytes,
            mft_lcn,
            mft_record_size,
            serial_number: LittleEndian::read_u64(&sector[0x48..0x50]),
        })
    }

    /// Byte offset of an MFT record, assuming the first records are contiguous.
    fn mft_record_offset(&self, record: u64) -> Option<u64> {
        self.mft_lcn
            .checked_mul(u64::from(self.cluster_size))?
            .checked_add(record.checked_mul(u64::from(self.mft_record_size))?)
    }

    /// Read the `$VOLUME_NAME` attribute of `$Volume`.
    ///
    /// `Ok(None)` means the record is readable but carries no usable name.
    pub fn read_volume_label<R: Read + Seek>(&self, reader: &mut R) -> io::Result<Option<String>> {
        let offset = self
            .mft_record_offset(MFT_ENTRY_VOLUME)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "MFT offset overflows"))?;
        reader.seek(SeekFrom::Start(offset))?;
        let mut record = vec![0u8; self.mft_record_size as usize];
        reader.read_exact(&mut record)?;
        Ok(volume_name_from_record(&mut record))
    }
}

/// Undo the update sequence protection of an MFT record in place.
///
/// Returns false when the record is torn or the sequence array is malformed.
fn apply_fixups(record: &mut [u8]) -> bool {
    let usa_offset = LittleEndian::read_u16(&record[0x04..0x06]) as usize;
    let usa_count = LittleEndian::read_u16(&record[0x06..0x08]) as usize;
    if usa_count == 0 || usa_offset + usa_count * 2 > record.len() {
        return false;
    }

    let usn = [record[usa_offset], record[usa_offset + 1]];
    for i in 1..usa_count {
        let end = i * FIXUP_STRIDE;
        if end > record.len() || record[end - 2..end] != usn[..] {
            return false;
        }
        let entry = usa_offset + i * 2;
        record[end - 2] = record[entry];
        record[end - 1] = record[entry + 1];
    }
    true
}

fn volume_name_from_record(record: &mut [u8]) -> Option<String> {
    if record.len() < 0x18 || &record[0..4] != FILE_RECORD_MAGIC {
        return None;
    }
    if !apply_fixups(record) {
        debug!("torn $Volume record");
        return None;
    }

    let mut offset = LittleEndian::read_u16(&record[0x14..0x16]) as usize;
    while offset + 8 <= record.len() {
        let attr_type = LittleEndian::read_u32(&record[offset..]);
        if attr_type == ATTR_END {
            break;
        }
        let length = LittleEndian::read_u32(&record[offset + 4..]) as usize;
        if length < 0x18 || offset + length > record.len() {
            break;
        }

        // Resident only; a volume name never lives outside the record.
        if attr_type == ATTR_VOLUME_NAME && record[offset + 8] == 0 {
            let value_len = LittleEndian::read_u32(&record[offset + 0x10..]) as usize;
            let value_off = LittleEndian::read_u16(&record[offset + 0x14..]) as usize;
            let start = offset + value_off;
            let end = start + value_len;
            if end > offset + length {
                return None;
            }
            let units: Vec<u16> = record[start..end]
                .chunks_exact(2)
                .map(LittleEndian::read_u16)
                .collect();
            return Some(String::from_utf16_lossy(&units));
        }
        offset += length;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    const SECTOR: usize = 512;
    const CLUSTER: usize = 4096;
    const RECORD: usize = 1024;
    const MFT_LCN: usize = 4;

    fn boot_sector(total_sectors: u64) -> Vec<u8> {
        let mut sector = vec![0u8; SECTOR];
        sector[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        sector[0x03..0x0B].copy_from_slice(NTFS_OEM_ID);
        LittleEndian::write_u16(&mut sector[0x0B..], SECTOR as u16);
        sector[0x0D] = (CLUSTER / SECTOR) as u8;
        sector[0x15] = 0xF8;
        LittleEndian::write_u64(&mut sector[0x28..], total_sectors);
        LittleEndian::write_u64(&mut sector[0x30..], MFT_LCN as u64);
        LittleEndian::write_u64(&mut sector[0x38..], 16);
        // -10: 2^10 byte records
        sector[0x40] = 0xF6;
        sector[0x44] = 0x01;
        LittleEndian::write_u64(&mut sector[0x48..], 0x1234_5678_9ABC_DEF0);
        sector[0x1FE] = 0x55;
        sector[0x1FF] = 0xAA;
        sector
    }

    fn volume_record(label: &str) -> Vec<u8> {
        let mut record = vec![0u8; RECORD];
        record[0..4].copy_from_slice(FILE_RECORD_MAGIC);
        LittleEndian::write_u16(&mut record[0x04..], 0x30);
        LittleEndian::write_u16(&mut record[0x06..], 3);
        LittleEndian::write_u16(&mut record[0x14..], 0x38);

        let name: Vec<u8> = label.encode_utf16().flat_map(u16::to_le_bytes).collect();
        let attr_len = (0x18 + name.len() + 7) & !7;
        let attr = 0x38;
        LittleEndian::write_u32(&mut record[attr..], ATTR_VOLUME_NAME);
        LittleEndian::write_u32(&mut record[attr + 4..], attr_len as u32);
        LittleEndian::write_u32(&mut record[attr + 0x10..], name.len() as u32);
        LittleEndian::write_u16(&mut record[attr + 0x14..], 0x18);
        record[attr + 0x18..attr + 0x18 + name.len()].copy_from_slice(&name);
        LittleEndian::write_u32(&mut record[attr + attr_len..], ATTR_END);

        // Protect the tail of each 512-byte block with USN 0x0007.
        record[0x30..0x32].copy_from_slice(&[0x07, 0x00]);
        for i in 1..3 {
            let end = i * FIXUP_STRIDE;
            let entry = 0x30 + i * 2;
            record[entry] = record[end - 2];
            record[entry + 1] = record[end - 1];
            record[end - 2..end].copy_from_slice(&[0x07, 0x00]);
        }
        record
    }

    fn ntfs_image(label: &str) -> Vec<u8> {
        let total_sectors = 2048u64;
        let mut image = vec![0u8; total_sectors as usize * SECTOR];
        image[..SECTOR].copy_from_slice(&boot_sector(total_sectors));
        let offset = MFT_LCN * CLUSTER + 3 * RECORD;
        image[offset..offset + RECORD].copy_from_slice(&volume_record(label));
        image
    }

    #[test]
    fn detects_ntfs_with_label_and_geometry() {
        let result = classify_reader(&mut Cursor::new(ntfs_image("Backup")));
        assert_eq!(
            result,
            ClassificationResult::Ntfs(NtfsInfo {
                label: "Backup".to_string(),
                size_bytes: 2048 * 512,
                serial_number: 0x1234_5678_9ABC_DEF0,
                bytes_per_sector: 512,
                cluster_size: 4096,
            })
        );
    }

    #[test]
    fn unicode_labels_survive() {
        match classify_reader(&mut Cursor::new(ntfs_image("Données"))) {
            ClassificationResult::Ntfs(info) => assert_eq!(info.label, "Données"),
            other => panic!("expected NTFS, got {:?}", other),
        }
    }

    #[test]
    fn torn_volume_record_leaves_label_empty() {
        let mut image = ntfs_image("Backup");
        let offset = MFT_LCN * CLUSTER + 3 * RECORD;
        image[offset + 510] = 0x99;
        match classify_reader(&mut Cursor::new(image)) {
            ClassificationResult::Ntfs(info) => assert!(info.label.is_empty()),
            other => panic!("expected NTFS, got {:?}", other),
        }
    }

    #[test]
    fn fat32_is_not_ntfs() {
        let mut sector = vec![0u8; SECTOR];
        sector[0x03..0x0B].copy_from_slice(b"MSDOS5.0");
        sector[0x52..0x57].copy_from_slice(b"FAT32");
        sector[0x1FE] = 0x55;
        sector[0x1FF] = 0xAA;
        assert_eq!(classify_reader(&mut Cursor::new(sector)), ClassificationResult::NotNtfs);
    }

    #[test]
    fn blank_device_is_not_ntfs() {
        let image = vec![0u8; 4096];
        assert_eq!(classify_reader(&mut Cursor::new(image)), ClassificationResult::NotNtfs);
    }

    #[test]
    fn short_device_is_unreadable() {
        let result = classify_reader(&mut Cursor::new(vec![0u8; 100]));
        assert!(matches!(result, ClassificationResult::Unreadable(_)));
    }

    #[test]
    fn rejects_mft_outside_volume() {
        let mut sector = boot_sector(2048);
        LittleEndian::write_u64(&mut sector[0x30..], 10_000);
        assert_eq!(NtfsBootSector::parse(&sector), None);
    }

    #[test]
    fn large_cluster_encoding() {
        let mut sector = boot_sector(1 << 24);
        // -8: 256 sectors of 512 bytes
        sector[0x0D] = 0xF8;
        let boot = NtfsBootSector::parse(&sector).expect("valid boot sector");
        assert_eq!(boot.cluster_size, 128 * 1024);
        assert_eq!(boot.mft_record_size, 1024);
    }

    #[test]
    fn classification_is_idempotent() {
        let image = ntfs_image("Backup");
        let first = classify_reader(&mut Cursor::new(image.clone()));
        let second = classify_reader(&mut Cursor::new(image));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn classifies_image_file_on_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&ntfs_image("Archive")).unwrap();
        file.flush().unwrap();

        let device = DeviceDescriptor::new(file.path().to_string_lossy(), 2048 * 512, 1);
        match BootSectorClassifier.classify(&device).await {
            ClassificationResult::Ntfs(info) => assert_eq!(info.label, "Archive"),
            other => panic!("expected NTFS, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn vanished_device_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("sdz1");
        let device = DeviceDescriptor::new(missing.to_string_lossy(), 0, 1);
        let result = BootSectorClassifier.classify(&device).await;
        assert!(matches!(
            result,
            ClassificationResult::Unreadable(reason) if reason.contains("vanished")
        ));
    }
}
