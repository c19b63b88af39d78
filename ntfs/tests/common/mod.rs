// Shared fixtures for the integration tests

#![allow(dead_code)]

use ntfsrw::{format, AttrKey, FormatOptions, MemoryDevice, NtfsFile, Volume, VolumeConfig};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::Once;

pub const VOLUME_BYTES: usize = 32 << 20;

static LOGGING: Once = Once::new();

pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn fresh_volume() -> Volume {
    fresh_volume_with(FormatOptions::default(), VolumeConfig::default())
}

pub fn fresh_volume_with(options: FormatOptions, config: VolumeConfig) -> Volume {
    init_logging();
    format(Box::new(MemoryDevice::new(VOLUME_BYTES)), &options, config).expect("Failed to format volume")
}

/// Close the volume and open its device again from scratch.
pub fn reopen(volume: Volume) -> Volume {
    Volume::open(volume.into_device(), VolumeConfig::default()).expect("Failed to reopen volume")
}

pub fn data_key() -> AttrKey {
    AttrKey::unnamed(ntfsrw::structures::ATTR_TYPE_DATA)
}

/// A plain file with an empty resident $DATA.
pub fn new_data_file(volume: &mut Volume) -> NtfsFile {
    let mut file = NtfsFile::create(volume, false, ntfsrw::structures::FILE_ATTRIBUTE_ARCHIVE)
        .expect("Failed to create file");
    file.add_resident_attribute(volume, &data_key(), Vec::new())
        .expect("Failed to add $DATA");
    file
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}
