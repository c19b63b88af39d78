// NTFS boot sector (LBA 0, backup copy in the last sector of the volume)

use crate::structures::NTFS_SIGNATURE;
use byteorder::{ByteOrder, LittleEndian};
use ntfsrw_core::{NtfsError, Result};

pub const BOOT_SECTOR_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mftmirr_lcn: u64,
    pub clusters_per_mft_record: i8,
    pub clusters_per_index_buffer: i8,
    pub volume_serial: u64,
}

impl BootSector {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < BOOT_SECTOR_SIZE {
            return Err(NtfsError::FormatCorruption("boot sector truncated".to_string()));
        }
        if &data[3..11] != NTFS_SIGNATURE {
            return Err(NtfsError::FormatCorruption(format!(
                "not an NTFS volume (OEM id {})",
                hex::encode(&data[3..11])
            )));
        }
        let signature = LittleEndian::read_u16(&data[0x1FE..]);
        if signature != 0xAA55 {
            return Err(NtfsError::FormatCorruption(format!(
                "invalid boot sector signature 0x{:04X}",
                signature
            )));
        }

        let boot = Self {
            bytes_per_sector: LittleEndian::read_u16(&data[0x0B..]),
            sectors_per_cluster: data[0x0D],
            total_sectors: LittleEndian::read_u64(&data[0x28..]),
            mft_lcn: LittleEndian::read_u64(&data[0x30..]),
            mftmirr_lcn: LittleEndian::read_u64(&data[0x38..]),
            clusters_per_mft_record: data[0x40] as i8,
            clusters_per_index_buffer: data[0x44] as i8,
            volume_serial: LittleEndian::read_u64(&data[0x48..]),
        };
        boot.validate()?;
        Ok(boot)
    }

    pub fn validate(&self) -> Result<()> {
        if ![512, 1024, 2048, 4096].contains(&self.bytes_per_sector) {
            return Err(NtfsError::FormatCorruption(format!(
                "invalid bytes per sector: {}",
                self.bytes_per_sector
            )));
        }
        let spc = self.sectors_per_cluster;
        if spc == 0 || !spc.is_power_of_two() {
            return Err(NtfsError::FormatCorruption(format!("invalid sectors per cluster: {}", spc)));
        }
        if self.clusters_per_mft_record == 0 || self.clusters_per_index_buffer == 0 {
            return Err(NtfsError::FormatCorruption("zero record or index size".to_string()));
        }
        let record_size = self.mft_record_size();
        if !(512..=65536).contains(&record_size) {
            return Err(NtfsError::FormatCorruption(format!("invalid record size {}", record_size)));
        }
        if self.total_clusters() == 0 || self.mft_lcn >= self.total_clusters() || self.mftmirr_lcn >= self.total_clusters() {
            return Err(NtfsError::FormatCorruption(format!(
                "MFT at {} / mirror at {} outside {} clusters",
                self.mft_lcn,
                self.mftmirr_lcn,
                self.total_clusters()
            )));
        }
        Ok(())
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / self.sectors_per_cluster as u64
    }

    pub fn mft_record_size(&self) -> u32 {
        decode_size(self.clusters_per_mft_record, self.bytes_per_cluster())
    }

    pub fn index_buffer_size(&self) -> u32 {
        decode_size(self.clusters_per_index_buffer, self.bytes_per_cluster())
    }

    pub fn to_bytes(&self) -> [u8; BOOT_SECTOR_SIZE] {
        let mut data = [0u8; BOOT_SECTOR_SIZE];
        data[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        data[3..11].copy_from_slice(NTFS_SIGNATURE);
        LittleEndian::write_u16(&mut data[0x0B..], self.bytes_per_sector);
        data[0x0D] = self.sectors_per_cluster;
        data[0x15] = 0xF8;
        LittleEndian::write_u16(&mut data[0x18..], 63);
        LittleEndian::write_u16(&mut data[0x1A..], 255);
        // Extended BPB marker expected by Windows
        data[0x24] = 0x80;
        data[0x26] = 0x80;
        LittleEndian::write_u64(&mut data[0x28..], self.total_sectors);
        LittleEndian::write_u64(&mut data[0x30..], self.mft_lcn);
        LittleEndian::write_u64(&mut data[0x38..], self.mftmirr_lcn);
        data[0x40] = self.clusters_per_mft_record as u8;
        data[0x44] = self.clusters_per_index_buffer as u8;
        LittleEndian::write_u64(&mut data[0x48..], self.volume_serial);
        LittleEndian::write_u16(&mut data[0x1FE..], 0xAA55);
        data
    }
}

/// Sizes of at least a cluster are stored as a cluster count, smaller ones as
/// a negative power of two in bytes.
pub fn decode_size(encoded: i8, cluster_size: u32) -> u32 {
    if encoded > 0 {
        encoded as u32 * cluster_size
    } else {
        1u32 << (-(encoded as i32)) as u32
    }
}

pub fn encode_size(bytes: u32, cluster_size: u32) -> i8 {
    if bytes >= cluster_size {
        (bytes / cluster_size) as i8
    } else {
        -(bytes.trailing_zeros() as i8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BootSector {
        BootSector {
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            total_sectors: 204800,
            mft_lcn: 4,
            mftmirr_lcn: 20,
            clusters_per_mft_record: encode_size(1024, 4096),
            clusters_per_index_buffer: encode_size(4096, 4096),
            volume_serial: 0x1122_3344_5566_7788,
        }
    }

    #[test]
    fn test_size_encoding() {
        assert_eq!(encode_size(1024, 4096), -10);
        assert_eq!(decode_size(-10, 4096), 1024);
        assert_eq!(encode_size(4096, 4096), 1);
        assert_eq!(encode_size(4096, 512), 8);
        assert_eq!(decode_size(8, 512), 4096);
    }

    #[test]
    fn test_boot_sector_layout() {
        let boot = sample();
        let bytes = boot.to_bytes();
        assert_eq!(&bytes[3..11], b"NTFS    ");
        assert_eq!(bytes[0x40], 0xF6);
        assert_eq!(&bytes[0x1FE..], &[0x55, 0xAA]);

        let parsed = BootSector::parse(&bytes).unwrap();
        assert_eq!(parsed, boot);
        assert_eq!(parsed.bytes_per_cluster(), 4096);
        assert_eq!(parsed.mft_record_size(), 1024);
        assert_eq!(parsed.total_clusters(), 25600);
    }

    #[test]
    fn test_rejects_foreign_volume() {
        let mut bytes = sample().to_bytes();
        bytes[3..11].copy_from_slice(b"EXFAT   ");
        assert!(matches!(BootSector::parse(&bytes), Err(NtfsError::FormatCorruption(_))));

        let mut bytes = sample().to_bytes();
        bytes[0x0D] = 3;
        assert!(BootSector::parse(&bytes).is_err());
    }
}
