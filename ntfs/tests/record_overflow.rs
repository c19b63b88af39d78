// Files whose attributes outgrow a single MFT record

mod common;

use ntfsrw::structures::{ATTR_TYPE_ATTRIBUTE_LIST, ATTR_TYPE_DATA};
use ntfsrw::{AttrKey, NtfsFile};

const STREAMS: usize = 60;

fn stream_key(n: usize) -> AttrKey {
    AttrKey::new(ATTR_TYPE_DATA, &format!("stream-{:02}", n))
}

fn stream_value(n: usize) -> Vec<u8> {
    (0..16).map(|i| (n * 16 + i) as u8).collect()
}

#[test]
fn named_streams_spill_into_extension_records() {
    let mut volume = common::fresh_volume();
    let mut file = common::new_data_file(&mut volume);
    let number = file.number();

    for n in 0..STREAMS {
        file.add_resident_attribute(&mut volume, &stream_key(n), stream_value(n))
            .expect("Failed to add stream");
    }

    let list = AttrKey::unnamed(ATTR_TYPE_ATTRIBUTE_LIST);
    assert!(file.has_attribute(&list), "no attribute list after {} streams", STREAMS);
    let records = file.record_numbers();
    println!("{} streams occupy records {:?}", STREAMS, records);
    assert!(records.len() > 1);
    assert_eq!(records[0], number);
    for &record in &records {
        assert!(volume.is_record_allocated(record));
    }

    // Small streams stay resident; they were moved, not converted
    for n in 0..STREAMS {
        assert!(file.is_resident(&stream_key(n)).expect("Failed to query stream"));
    }

    let mut volume = common::reopen(volume);
    let file = NtfsFile::open(&mut volume, number).expect("Failed to reopen file");
    let mut reopened_records = file.record_numbers();
    reopened_records.sort_unstable();
    let mut expected_records = records.clone();
    expected_records.sort_unstable();
    assert_eq!(reopened_records, expected_records);
    for n in 0..STREAMS {
        let data = file.read_all(&mut volume, &stream_key(n)).expect("Failed to read stream");
        assert_eq!(data, stream_value(n), "stream {}", n);
    }
    assert!(file.read_all(&mut volume, &common::data_key()).expect("Failed to read $DATA").is_empty());
}

#[test]
fn growing_a_spilled_stream_keeps_every_other_stream() {
    let mut volume = common::fresh_volume();
    let mut file = common::new_data_file(&mut volume);
    for n in 0..STREAMS {
        file.add_resident_attribute(&mut volume, &stream_key(n), stream_value(n))
            .expect("Failed to add stream");
    }

    let mut rng = common::rng(7);
    let big = common::random_bytes(&mut rng, 300 * 1024);
    let key = stream_key(STREAMS / 2);
    file.write_attribute(&mut volume, &key, 0, &big).expect("Failed to grow stream");
    assert!(!file.is_resident(&key).expect("Failed to query stream"));
    assert_eq!(file.read_all(&mut volume, &key).expect("Failed to read stream"), big);

    for n in (0..STREAMS).filter(|&n| n != STREAMS / 2) {
        let data = file.read_all(&mut volume, &stream_key(n)).expect("Failed to read stream");
        assert_eq!(data, stream_value(n), "stream {}", n);
    }
}

#[test]
fn removing_streams_and_deleting_releases_records() {
    let mut volume = common::fresh_volume();
    let mut file = common::new_data_file(&mut volume);
    for n in 0..STREAMS {
        file.add_resident_attribute(&mut volume, &stream_key(n), stream_value(n))
            .expect("Failed to add stream");
    }
    let records = file.record_numbers();

    for n in 0..STREAMS / 2 {
        file.remove_attribute(&mut volume, &stream_key(n)).expect("Failed to remove stream");
    }
    assert!(!file.has_attribute(&stream_key(0)));
    for n in STREAMS / 2..STREAMS {
        let data = file.read_all(&mut volume, &stream_key(n)).expect("Failed to read stream");
        assert_eq!(data, stream_value(n));
    }

    let free_before = volume.free_clusters();
    file.delete(&mut volume).expect("Failed to delete file");
    for record in records {
        assert!(!volume.is_record_allocated(record), "record {} still in use", record);
    }
    assert!(volume.free_clusters() >= free_before);
}
