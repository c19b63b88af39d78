// Sparse and compressed data streams

mod common;

use common::data_key;
use ntfsrw::{Compressor, Lznt1, NtfsFile};

const TEN_MB: u64 = 10_000_000;

#[test]
fn sparse_file_stores_only_touched_clusters() {
    let mut volume = common::fresh_volume();
    let key = data_key();
    let mut file = common::new_data_file(&mut volume);
    let free_before = volume.free_clusters();

    file.write_attribute(&mut volume, &key, 0, &[0x42]).expect("Failed to write first byte");
    file.set_sparse(&mut volume, &key, true).expect("Failed to mark sparse");
    file.set_attribute_length(&mut volume, &key, TEN_MB).expect("Failed to grow file");
    file.write_attribute(&mut volume, &key, 9_999_999, &[1, 2, 3, 4]).expect("Failed to write tail");

    let cluster_size = volume.cluster_size();
    let touched = 9_999_999 / cluster_size;
    let clusters = (file.attribute_length(&key).expect("No length") + cluster_size - 1) / cluster_size;
    for vcn in 0..clusters {
        let stored = file.is_cluster_stored(&key, vcn).expect("Failed to query cluster");
        assert_eq!(stored, vcn == 0 || vcn == touched, "cluster {}", vcn);
    }
    assert_eq!(file.stored_clusters(&key).expect("Failed to count clusters"), 2);
    assert_eq!(volume.free_clusters(), free_before - 2);

    let mut head = vec![0xFFu8; 8192];
    file.read_attribute(&mut volume, &key, 0, &mut head).expect("Failed to read head");
    assert_eq!(head[0], 0x42);
    assert!(head[1..].iter().all(|&b| b == 0));

    let mut middle = vec![0xFFu8; 4096];
    file.read_attribute(&mut volume, &key, 5_000_000, &mut middle).expect("Failed to read middle");
    assert!(middle.iter().all(|&b| b == 0));

    // Reads stop at the end of the stream
    let mut tail = vec![0xFFu8; 8];
    let n = file.read_attribute(&mut volume, &key, 9_999_996, &mut tail).expect("Failed to read tail");
    assert_eq!(n, 7);
    assert_eq!(&tail[..n], &[0, 0, 0, 1, 2, 3, 4]);
    assert_eq!(file.attribute_length(&key).expect("No length"), TEN_MB + 3);
}

#[test]
fn entropy_grows_a_compression_unit() {
    let mut volume = common::fresh_volume();
    let key = data_key();
    let mut file = common::new_data_file(&mut volume);
    file.set_compressed(&mut volume, &key, true).expect("Failed to mark compressed");

    let mut expected: Vec<u8> = b"compressible ".iter().copied().cycle().take(64 * 1024).collect();
    file.write_attribute(&mut volume, &key, 0, &expected).expect("Failed to write pattern");
    let stored_before = file.stored_clusters(&key).expect("Failed to count clusters");
    assert!(stored_before < 16, "pattern did not compress: {} clusters", stored_before);

    let mut rng = common::rng(0xD);
    let noise = common::random_bytes(&mut rng, 8 * 1024);
    file.write_attribute(&mut volume, &key, 0, &noise).expect("Failed to write noise");
    expected[..noise.len()].copy_from_slice(&noise);

    let stored_after = file.stored_clusters(&key).expect("Failed to count clusters");
    println!("compression unit: {} clusters before, {} after", stored_before, stored_after);
    assert!(stored_after > stored_before);
    assert!(stored_after <= 16);

    let reopened = ntfsrw::NtfsFile::open(&mut volume, file.number()).expect("Failed to reopen file");
    let data = reopened.read_all(&mut volume, &key).expect("Failed to read back");
    assert_eq!(data, expected);

    // A single high-entropy byte must also survive the recompression
    file.write_attribute(&mut volume, &key, 0, &[0xA7]).expect("Failed to write byte");
    expected[0] = 0xA7;
    assert_eq!(file.read_all(&mut volume, &key).expect("Failed to read back"), expected);
}

#[test]
fn compressed_file_spanning_units_round_trips() {
    let mut volume = common::fresh_volume();
    let key = data_key();
    let mut file = common::new_data_file(&mut volume);
    file.set_compressed(&mut volume, &key, true).expect("Failed to mark compressed");

    let mut rng = common::rng(3);
    let mut expected = vec![0u8; 200 * 1024];
    for (i, chunk) in expected.chunks_mut(16 * 1024).enumerate() {
        if i % 2 == 0 {
            chunk.copy_from_slice(&common::random_bytes(&mut rng, chunk.len()));
        }
    }
    file.write_attribute(&mut volume, &key, 0, &expected).expect("Failed to write");
    assert_eq!(file.read_all(&mut volume, &key).expect("Failed to read back"), expected);

    file.set_attribute_length(&mut volume, &key, 70_000).expect("Failed to truncate");
    expected.truncate(70_000);
    assert_eq!(file.read_all(&mut volume, &key).expect("Failed to read back"), expected);
}

#[test]
fn clearing_sparse_ranges_releases_clusters() {
    let mut volume = common::fresh_volume();
    let key = data_key();
    let mut file = common::new_data_file(&mut volume);
    file.set_sparse(&mut volume, &key, true).expect("Failed to mark sparse");
    file.write_attribute(&mut volume, &key, 0, &vec![9u8; 64 * 1024]).expect("Failed to write");
    let stored = file.stored_clusters(&key).expect("Failed to count clusters");
    assert_eq!(stored, 16);

    // Truncating and growing again leaves a hole where the data was
    file.set_attribute_length(&mut volume, &key, 4096).expect("Failed to truncate");
    file.set_attribute_length(&mut volume, &key, 64 * 1024).expect("Failed to grow");
    assert_eq!(file.stored_clusters(&key).expect("Failed to count clusters"), 1);
    let data = file.read_all(&mut volume, &key).expect("Failed to read back");
    assert!(data[..4096].iter().all(|&b| b == 9));
    assert!(data[4096..].iter().all(|&b| b == 0));
}

const UNIT_BYTES: usize = 64 * 1024;
const FLIP_AT: usize = 60_000;

fn clusters_for_unit(plaintext: &[u8]) -> usize {
    let (_, compressed) = Lznt1.compress(plaintext).expect("Failed to compress");
    (compressed.len() + 4095) / 4096
}

/// A unit of `prefix` random bytes followed by zeros.
fn unit_with_prefix(noise: &[u8], prefix: usize) -> Vec<u8> {
    let mut unit = vec![0u8; UNIT_BYTES];
    unit[..prefix].copy_from_slice(&noise[..prefix]);
    unit
}

fn flipped(unit: &[u8]) -> Vec<u8> {
    let mut unit = unit.to_vec();
    unit[FLIP_AT] = 0xA7;
    unit
}

#[test]
fn one_byte_write_needs_one_more_cluster() {
    let mut rng = common::rng(0xD1);
    let noise = common::random_bytes(&mut rng, UNIT_BYTES);

    // Find a unit whose compressed form sits just below a cluster boundary,
    // so that one extra literal byte pushes it over
    let (mut lo, mut hi) = (8 * 1024, 16 * 1024);
    let target = clusters_for_unit(&unit_with_prefix(&noise, lo)) + 1;
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        if clusters_for_unit(&unit_with_prefix(&noise, mid)) >= target {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    let unit = (lo.saturating_sub(24)..=lo)
        .rev()
        .map(|prefix| unit_with_prefix(&noise, prefix))
        .find(|unit| clusters_for_unit(&flipped(unit)) > clusters_for_unit(unit))
        .expect("no unit sits on a cluster boundary");
    let expected_before = clusters_for_unit(&unit) as u64;

    let mut volume = common::fresh_volume();
    let key = data_key();
    let mut file = common::new_data_file(&mut volume);
    file.set_compressed(&mut volume, &key, true).expect("Failed to mark compressed");
    file.write_attribute(&mut volume, &key, 0, &unit).expect("Failed to write unit");
    let before = file.stored_clusters(&key).expect("Failed to count clusters");
    assert_eq!(before, expected_before);

    file.write_attribute(&mut volume, &key, FLIP_AT as u64, &[0xA7]).expect("Failed to write byte");
    let after = file.stored_clusters(&key).expect("Failed to count clusters");
    println!("one byte at {}: {} clusters before, {} after", FLIP_AT, before, after);
    assert_eq!(after, before + 1);

    let mut volume = common::reopen(volume);
    let file = NtfsFile::open(&mut volume, file.number()).expect("Failed to reopen file");
    assert_eq!(file.read_all(&mut volume, &key).expect("Failed to read back"), flipped(&unit));
}
