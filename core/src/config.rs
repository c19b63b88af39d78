use crate::error::{NtfsError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runtime knobs for an opened volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VolumeConfig {
    /// Refuse every write through the engine.
    pub read_only: bool,
    /// Metadata records kept in the record cache.
    pub record_cache_capacity: usize,
    /// Index blocks kept in the block cache.
    pub block_cache_capacity: usize,
    /// Rewrite `$MFTMirr` from `$MFT` when they disagree at open.
    pub repair_mirror: bool,
    /// Byte budget for index root nodes. `None` derives it from the record size.
    pub index_root_budget: Option<u32>,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            record_cache_capacity: 256,
            block_cache_capacity: 128,
            repair_mirror: true,
            index_root_budget: None,
        }
    }
}

impl VolumeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: VolumeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.record_cache_capacity == 0 || self.block_cache_capacity == 0 {
            return Err(NtfsError::Configuration(
                "cache capacities must be at least 1".to_string(),
            ));
        }
        if let Some(budget) = self.index_root_budget {
            if budget < 64 {
                return Err(NtfsError::Configuration(format!(
                    "index root budget {} is too small to hold an entry",
                    budget
                )));
            }
        }
        Ok(())
    }
}

/// Geometry used when laying out a fresh volume image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FormatOptions {
    pub sector_size: u32,
    pub cluster_size: u32,
    pub record_size: u32,
    pub index_block_size: u32,
    /// Records preallocated in `$MFT`; the table grows on demand past this.
    pub initial_mft_records: u32,
    pub label: Option<String>,
    /// Volume serial number; random when absent.
    pub serial: Option<u64>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            sector_size: 512,
            cluster_size: 4096,
            record_size: 1024,
            index_block_size: 4096,
            initial_mft_records: 64,
            label: None,
            serial: None,
        }
    }
}

impl FormatOptions {
    pub fn validate(&self) -> Result<()> {
        let pow2 = |v: u32| v != 0 && v.is_power_of_two();
        if self.sector_size != 512 && self.sector_size != 4096 {
            return Err(NtfsError::Configuration(format!(
                "unsupported sector size {}",
                self.sector_size
            )));
        }
        if !pow2(self.cluster_size) || self.cluster_size < self.sector_size || self.cluster_size > 65536 {
            return Err(NtfsError::Configuration(format!(
                "cluster size {} must be a power of two between the sector size and 64K",
                self.cluster_size
            )));
        }
        if !pow2(self.record_size) || self.record_size < 1024 || self.record_size > 4096 {
            return Err(NtfsError::Configuration(format!(
                "record size {} must be 1K, 2K or 4K",
                self.record_size
            )));
        }
        if !pow2(self.index_block_size) || self.index_block_size < 512 || self.index_block_size > 65536 {
            return Err(NtfsError::Configuration(format!(
                "index block size {} must be a power of two between 512 and 64K",
                self.index_block_size
            )));
        }
        if self.initial_mft_records < 16 {
            return Err(NtfsError::Configuration(
                "at least 16 records are needed for the system files".to_string(),
            ));
        }
        if let Some(label) = &self.label {
            if label.encode_utf16().count() > 128 {
                return Err(NtfsError::Configuration("volume label longer than 128 characters".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        VolumeConfig::default().validate().unwrap();
        FormatOptions::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = VolumeConfig::from_json_str(r#"{"read_only": true, "index_root_budget": 256}"#).unwrap();
        assert!(config.read_only);
        assert_eq!(config.index_root_budget, Some(256));
        assert_eq!(config.record_cache_capacity, 256);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(VolumeConfig::from_json_str(r#"{"block_cache_capacity": 0}"#).is_err());
        assert!(VolumeConfig::from_json_str("not json").is_err());

        let options = FormatOptions { cluster_size: 3000, ..Default::default() };
        assert!(matches!(options.validate(), Err(NtfsError::Configuration(_))));
        let options = FormatOptions { initial_mft_records: 8, ..Default::default() };
        assert!(options.validate().is_err());
    }
}
