// B+tree index behaviour through the public API

mod common;

use ntfsrw::structures::{to_utf16, FILE_ATTRIBUTE_VIEW_INDEX};
use ntfsrw::{CollationRule, FormatOptions, Index, IndexEntry, NtfsError, NtfsFile, VolumeConfig};
use rand::seq::SliceRandom;
use std::collections::BTreeSet;

fn key(n: u32) -> Vec<u8> {
    n.to_le_bytes().to_vec()
}

fn key_value(entry: &IndexEntry) -> u32 {
    u32::from_le_bytes(entry.key[..4].try_into().expect("4-byte key"))
}

fn small_nodes() -> (FormatOptions, VolumeConfig) {
    let options = FormatOptions { index_block_size: 1024, ..FormatOptions::default() };
    let config = VolumeConfig { index_root_budget: Some(128), ..VolumeConfig::default() };
    (options, config)
}

#[test]
fn sequential_keys_depose_and_divide() {
    let (options, config) = small_nodes();
    let mut volume = common::fresh_volume_with(options, config);
    let mut file = NtfsFile::create(&mut volume, false, FILE_ATTRIBUTE_VIEW_INDEX).expect("Failed to create file");
    let mut index = Index::create(&mut volume, &mut file, &to_utf16("$Q"), 0, CollationRule::UnsignedLong)
        .expect("Failed to create index");

    for n in 0u32..10_000 {
        index
            .put(IndexEntry::new(key(n), (n * 3).to_le_bytes().to_vec()))
            .expect("Failed to insert key");
    }

    let stats = index.stats();
    println!("index stats after 10k inserts: {:?}", stats);
    assert!(stats.deposes >= 1, "root never deposed");
    assert!(stats.divides > 1, "blocks never divided");

    let entries = index.entries().expect("Failed to walk index");
    let keys: Vec<u32> = entries.iter().map(key_value).collect();
    assert_eq!(keys, (0..10_000).collect::<Vec<u32>>());
    assert_eq!(entries[1234].value, (1234u32 * 3).to_le_bytes().to_vec());
    index.check().expect("Index invariants broken");
}

#[test]
fn shuffled_inserts_and_removals_stay_sorted() {
    let (options, config) = small_nodes();
    let mut volume = common::fresh_volume_with(options, config);
    let mut file = NtfsFile::create(&mut volume, false, FILE_ATTRIBUTE_VIEW_INDEX).expect("Failed to create file");
    let mut index = Index::create(&mut volume, &mut file, &to_utf16("$O"), 0, CollationRule::UnsignedLong)
        .expect("Failed to create index");

    let mut rng = common::rng(7);
    let mut keys: Vec<u32> = (0..2_000).map(|n| n * 7 + 3).collect();
    keys.shuffle(&mut rng);
    for &n in &keys {
        index.put(IndexEntry::new(key(n), vec![0xEE; 8])).expect("Failed to insert key");
    }
    index.check().expect("Index invariants broken after inserts");

    // Drop the lowest 1200 keys in random order so whole leaves empty out
    keys.sort_unstable();
    let (low, kept) = keys.split_at(1_200);
    let mut gone = low.to_vec();
    gone.shuffle(&mut rng);
    for &n in &gone {
        let removed = index.remove(&key(n)).expect("Failed to remove key");
        assert_eq!(key_value(&removed), n);
    }
    index.check().expect("Index invariants broken after removals");

    let expected: BTreeSet<u32> = kept.iter().copied().collect();
    let actual: Vec<u32> = index.entries().expect("Failed to walk index").iter().map(key_value).collect();
    assert_eq!(actual, expected.into_iter().collect::<Vec<u32>>());
    for &n in gone.iter().take(50) {
        assert!(index.find(&key(n)).expect("Lookup failed").is_none());
    }
    for &n in kept.iter().take(50) {
        assert!(index.find(&key(n)).expect("Lookup failed").is_some());
    }
    let stats = index.stats();
    assert!(stats.blocks_freed > 0, "removals never freed a block: {:?}", stats);
}

#[test]
fn removing_twice_reports_not_found_and_changes_nothing() {
    let mut volume = common::fresh_volume();
    let mut file = NtfsFile::create(&mut volume, false, FILE_ATTRIBUTE_VIEW_INDEX).expect("Failed to create file");
    let mut index = Index::create(&mut volume, &mut file, &to_utf16("$SII"), 0, CollationRule::UnsignedLong)
        .expect("Failed to create index");
    for n in 0..300 {
        index.put(IndexEntry::new(key(n), vec![1; 4])).expect("Failed to insert key");
    }

    index.remove(&key(150)).expect("First removal failed");
    let before = index.entries().expect("Failed to walk index");
    assert!(matches!(index.remove(&key(150)), Err(NtfsError::NotFound(_))));
    assert_eq!(index.entries().expect("Failed to walk index"), before);
}

#[test]
fn emptying_the_tree_returns_every_block() {
    let (options, config) = small_nodes();
    let mut volume = common::fresh_volume_with(options, config);
    let mut file = NtfsFile::create(&mut volume, false, FILE_ATTRIBUTE_VIEW_INDEX).expect("Failed to create file");
    let mut index = Index::create(&mut volume, &mut file, &to_utf16("$Q"), 0, CollationRule::UnsignedLong)
        .expect("Failed to create index");
    for n in 0..1_000 {
        index.put(IndexEntry::new(key(n), vec![2; 4])).expect("Failed to insert key");
    }
    for n in (0..1_000).rev() {
        index.remove(&key(n)).expect("Failed to remove key");
    }
    assert!(index.entries().expect("Failed to walk index").is_empty());
    index.check().expect("Index invariants broken");
    drop(index);

    let ia = ntfsrw::AttrKey::new(ntfsrw::structures::ATTR_TYPE_INDEX_ALLOCATION, "$Q");
    assert_eq!(file.attribute_length(&ia).expect("No $INDEX_ALLOCATION"), 0);
}

#[test]
fn security_hash_index_orders_by_hash_then_id() {
    let mut volume = common::fresh_volume();
    let mut file = NtfsFile::create(&mut volume, false, FILE_ATTRIBUTE_VIEW_INDEX).expect("Failed to create file");
    let mut index = Index::create(&mut volume, &mut file, &to_utf16("$SDH"), 0, CollationRule::SecurityHash)
        .expect("Failed to create index");
    let sdh = |hash: u32, id: u32| [hash.to_le_bytes(), id.to_le_bytes()].concat();
    for (hash, id) in [(9, 2), (3, 7), (9, 1), (1, 100)] {
        index.put(IndexEntry::new(sdh(hash, id), vec![0; 20])).expect("Failed to insert key");
    }
    let order: Vec<Vec<u8>> = index.entries().expect("Failed to walk index").into_iter().map(|e| e.key).collect();
    assert_eq!(order, vec![sdh(1, 100), sdh(3, 7), sdh(9, 1), sdh(9, 2)]);
}
