// Volumes closed and opened again, including damaged metadata

mod common;

use ntfsrw::directory::{self, DIRECTORY_INDEX_NAME};
use ntfsrw::structures::{to_utf16, FILE_ATTRIBUTE_ARCHIVE, MFT_RECORD_MFT, MFT_RECORD_ROOT};
use ntfsrw::{
    format, BlockDevice, CollationRule, FileDevice, FormatOptions, Index, IndexEntry, NtfsFile, Volume,
    VolumeConfig,
};

#[test]
fn files_and_indexes_survive_reopen() {
    let mut volume = common::fresh_volume();
    let key = common::data_key();
    let mut rng = common::rng(11);
    let payload = common::random_bytes(&mut rng, 100_000);

    let mut root = NtfsFile::open(&mut volume, MFT_RECORD_ROOT).expect("Failed to open root");
    let mut file = directory::create_child(&mut volume, &mut root, "payload.bin", false, FILE_ATTRIBUTE_ARCHIVE)
        .expect("Failed to create file");
    file.add_resident_attribute(&mut volume, &key, Vec::new()).expect("Failed to add $DATA");
    file.write_attribute(&mut volume, &key, 0, &payload).expect("Failed to write payload");

    let mut docs = directory::create_child(&mut volume, &mut root, "docs", true, 0).expect("Failed to create dir");
    for n in 0..50 {
        directory::create_child(&mut volume, &mut docs, &format!("note-{:02}.txt", n), false, 0)
            .expect("Failed to create note");
    }
    let docs_number = docs.number();
    let free = volume.free_clusters();

    let mut volume = common::reopen(volume);
    assert_eq!(volume.free_clusters(), free);

    let mut root = NtfsFile::open(&mut volume, MFT_RECORD_ROOT).expect("Failed to open root");
    let entry = directory::find_entry(&mut volume, &mut root, "PAYLOAD.BIN")
        .expect("Failed to look up payload")
        .expect("payload.bin missing after reopen");
    let file = NtfsFile::open_reference(&mut volume, entry.reference).expect("Failed to open payload");
    assert_eq!(file.read_all(&mut volume, &key).expect("Failed to read payload"), payload);

    let mut docs = NtfsFile::open(&mut volume, docs_number).expect("Failed to open docs");
    let names: Vec<String> = directory::list(&mut volume, &mut docs)
        .expect("Failed to list docs")
        .iter()
        .map(|e| e.name.name_string())
        .collect();
    assert_eq!(names.len(), 50);
    assert_eq!(names[0], "note-00.txt");
    assert_eq!(names[49], "note-49.txt");
    Index::open(&mut volume, &mut docs, &to_utf16(DIRECTORY_INDEX_NAME))
        .expect("Failed to open $I30")
        .check()
        .expect("$I30 inconsistent after reopen");
}

#[test]
fn custom_index_survives_reopen() {
    let mut volume = common::fresh_volume();
    let mut file = common::new_data_file(&mut volume);
    let name = to_utf16("$O");
    {
        let mut index = Index::create(&mut volume, &mut file, &name, 0, CollationRule::UnsignedLong)
            .expect("Failed to create index");
        for n in 0u32..500 {
            index
                .put(IndexEntry::new(n.to_le_bytes().to_vec(), (n as u64).to_le_bytes().to_vec()))
                .expect("Failed to insert");
        }
    }
    let number = file.number();

    let mut volume = common::reopen(volume);
    let mut file = NtfsFile::open(&mut volume, number).expect("Failed to reopen file");
    let mut index = Index::open(&mut volume, &mut file, &name).expect("Failed to reopen index");
    index.check().expect("Index inconsistent after reopen");
    let found = index.find(&321u32.to_le_bytes()).expect("Failed to look up").expect("key 321 missing");
    assert_eq!(found.value, 321u64.to_le_bytes().to_vec());
    assert_eq!(index.entries().expect("Failed to list").len(), 500);
}

#[test]
fn damaged_boot_sector_falls_back_to_backup() {
    let volume = common::fresh_volume();
    let serial = volume.boot_sector().volume_serial;
    let mut device = volume.into_device();
    device.write_at(0, &[0u8; 512]).expect("Failed to damage boot sector");

    let volume = Volume::open(device, VolumeConfig::default()).expect("Failed to open with backup boot sector");
    assert_eq!(volume.boot_sector().volume_serial, serial);
    assert_eq!(volume.total_clusters(), (common::VOLUME_BYTES as u64 - 512) / volume.cluster_size());
}

#[test]
fn damaged_mft_record_is_restored_from_mirror() {
    let volume = common::fresh_volume();
    let geometry = *volume.geometry();
    let offset = geometry.mft_lcn * geometry.cluster_size as u64;
    let mut device = volume.into_device();
    let mut original = vec![0u8; geometry.record_size as usize];
    device.read_at(offset, &mut original).expect("Failed to read record 0");
    device.write_at(offset, &vec![0xEEu8; geometry.record_size as usize]).expect("Failed to damage record 0");

    let mut volume = Volume::open(device, VolumeConfig::default()).expect("Failed to open through the mirror");
    let record = volume.read_record(MFT_RECORD_MFT).expect("Failed to read restored record 0");
    assert!(record.header.in_use());

    let mut device = volume.into_device();
    let mut repaired = vec![0u8; geometry.record_size as usize];
    device.read_at(offset, &mut repaired).expect("Failed to read record 0");
    assert_eq!(repaired, original);
}

#[test]
fn read_only_volume_refuses_writes() {
    let volume = common::fresh_volume();
    let config = VolumeConfig { read_only: true, ..VolumeConfig::default() };
    let mut volume = Volume::open(volume.into_device(), config).expect("Failed to open read-only");
    let mut root = NtfsFile::open(&mut volume, MFT_RECORD_ROOT).expect("Failed to open root");
    assert!(directory::list(&mut volume, &mut root).expect("Failed to list root").len() > 10);
    let result = directory::create_child(&mut volume, &mut root, "nope", false, 0);
    assert!(result.is_err());
}

#[test]
fn image_file_round_trip() {
    common::init_logging();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("volume.img");
    let key = common::data_key();

    let device = FileDevice::create(&path, 8 << 20).expect("Failed to create image");
    let options = FormatOptions { label: Some("IMAGE".to_string()), ..FormatOptions::default() };
    let mut volume = format(Box::new(device), &options, VolumeConfig::default()).expect("Failed to format image");
    let mut file = common::new_data_file(&mut volume);
    file.write_attribute(&mut volume, &key, 0, b"kept on disk").expect("Failed to write");
    let number = file.number();
    volume.sync().expect("Failed to sync");
    drop(volume);

    let device = FileDevice::open(&path, false).expect("Failed to open image");
    let config = VolumeConfig { read_only: true, ..VolumeConfig::default() };
    let mut volume = Volume::open(Box::new(device), config).expect("Failed to open image");
    let file = NtfsFile::open(&mut volume, number).expect("Failed to open file");
    assert_eq!(file.read_all(&mut volume, &key).expect("Failed to read"), b"kept on disk");
}
