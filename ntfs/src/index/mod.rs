// B+tree indexes: an $INDEX_ROOT in the record, INDX blocks in
// $INDEX_ALLOCATION, and a $BITMAP of the blocks in use
//
// Root value layout:
//   0x00  indexed attribute type (0 for view indexes)
//   0x04  collation rule
//   0x08  index block size
//   0x0C  clusters (or 512-byte units) per block
//   0x10  index header + entries

pub mod collation;
pub mod entry;

mod block;
mod tree;

pub use collation::CollationRule;
pub use entry::{EntryFormat, IndexEntry, IndexNode};
pub use tree::TreeOutcome;

use crate::attributes::AttrKey;
use crate::bitmap::Bitmap;
use crate::file::NtfsFile;
use crate::structures::*;
use crate::volume::{BlockKey, Volume};
use byteorder::{ByteOrder, LittleEndian};
use entry::INDEX_HEADER_SIZE;
use log::{debug, trace};
use ntfsrw_core::{NtfsError, Result};
use std::collections::BTreeSet;

pub const ROOT_HEADER_SIZE: usize = 0x10;

// Bitmap attribute grows eight bytes at a time
const BITMAP_GROWTH_BITS: u64 = 64;

/// Structural changes made through one `Index` handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub deposes: u64,
    pub divides: u64,
    pub lifts: u64,
    pub blocks_freed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeId {
    Root,
    Block(u64),
}

pub struct Index<'a> {
    volume: &'a mut Volume,
    file: &'a mut NtfsFile,
    name: Vec<u16>,
    rule: CollationRule,
    format: EntryFormat,
    indexed_type: u32,
    block_size: usize,
    vcn_unit: u64,
    stats: IndexStats,
}

fn root_value(indexed_type: u32, rule: CollationRule, block_size: usize, cluster_size: u64, format: EntryFormat) -> Vec<u8> {
    let mut value = vec![0u8; ROOT_HEADER_SIZE];
    LittleEndian::write_u32(&mut value[0x00..], indexed_type);
    LittleEndian::write_u32(&mut value[0x04..], rule.as_u32());
    LittleEndian::write_u32(&mut value[0x08..], block_size as u32);
    value[0x0C] = if block_size as u64 >= cluster_size {
        (block_size as u64 / cluster_size) as u8
    } else {
        (block_size / 512) as u8
    };
    value.extend(IndexNode::leaf().serialize(format, INDEX_HEADER_SIZE, 0));
    value
}

impl<'a> Index<'a> {
    /// Add an empty index named `name` to `file`.
    pub fn create(
        volume: &'a mut Volume,
        file: &'a mut NtfsFile,
        name: &[u16],
        indexed_type: u32,
        rule: CollationRule,
    ) -> Result<Self> {
        let key = AttrKey { type_code: ATTR_TYPE_INDEX_ROOT, name: name.to_vec() };
        if file.has_attribute(&key) {
            return Err(NtfsError::LogicalMisuse(format!(
                "record {} already has index {}",
                file.number(),
                from_utf16(name)
            )));
        }
        let block_size = volume.index_block_size() as usize;
        let format = if indexed_type == ATTR_TYPE_FILE_NAME { EntryFormat::FileName } else { EntryFormat::View };
        let value = root_value(indexed_type, rule, block_size, volume.cluster_size(), format);
        file.insert_resident(&key, value)?;
        file.update_record_in_mft(volume)?;
        debug!("Created index {} in record {} ({:?})", from_utf16(name), file.number(), rule);
        Self::open(volume, file, name)
    }

    pub fn open(volume: &'a mut Volume, file: &'a mut NtfsFile, name: &[u16]) -> Result<Self> {
        let key = AttrKey { type_code: ATTR_TYPE_INDEX_ROOT, name: name.to_vec() };
        let value = file.resident_value(&key)?;
        if value.len() < ROOT_HEADER_SIZE + INDEX_HEADER_SIZE {
            return Err(NtfsError::FormatCorruption(format!(
                "index root {} of record {} is only {} bytes",
                from_utf16(name),
                file.number(),
                value.len()
            )));
        }
        let indexed_type = LittleEndian::read_u32(&value[0x00..]);
        let rule = CollationRule::from_u32(LittleEndian::read_u32(&value[0x04..]))?;
        let block_size = LittleEndian::read_u32(&value[0x08..]) as usize;
        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(NtfsError::FormatCorruption(format!(
                "index {} of record {} has block size {}",
                from_utf16(name),
                file.number(),
                block_size
            )));
        }
        let cluster_size = volume.cluster_size();
        let vcn_unit = if block_size as u64 >= cluster_size { cluster_size } else { 512 };
        let format = if indexed_type == ATTR_TYPE_FILE_NAME { EntryFormat::FileName } else { EntryFormat::View };
        Ok(Self {
            volume,
            file,
            name: name.to_vec(),
            rule,
            format,
            indexed_type,
            block_size,
            vcn_unit,
            stats: IndexStats::default(),
        })
    }

    pub fn name(&self) -> &[u16] {
        &self.name
    }

    pub fn rule(&self) -> CollationRule {
        self.rule
    }

    pub fn format(&self) -> EntryFormat {
        self.format
    }

    pub fn indexed_type(&self) -> u32 {
        self.indexed_type
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }

    fn root_key(&self) -> AttrKey {
        AttrKey { type_code: ATTR_TYPE_INDEX_ROOT, name: self.name.clone() }
    }

    fn alloc_key(&self) -> AttrKey {
        AttrKey { type_code: ATTR_TYPE_INDEX_ALLOCATION, name: self.name.clone() }
    }

    fn bitmap_key(&self) -> AttrKey {
        AttrKey { type_code: ATTR_TYPE_BITMAP, name: self.name.clone() }
    }

    fn cache_key(&self, vcn: u64) -> BlockKey {
        (self.file.number(), self.name.clone(), vcn)
    }

    // Public operations

    /// Exact-match lookup. The returned entry never carries a child pointer.
    pub fn find(&mut self, key: &[u8]) -> Result<Option<IndexEntry>> {
        self.lookup(key)
    }

    /// Insert `entry`, or replace the value of the entry with an equal key.
    /// Returns true when an existing entry was replaced.
    pub fn put(&mut self, entry: IndexEntry) -> Result<bool> {
        if entry.is_end {
            return Err(NtfsError::InvalidInput("cannot insert an End entry".to_string()));
        }
        entry.check_value(self.format)?;
        let entry = IndexEntry { child: None, ..entry };
        self.volume.begin_transaction();
        let result = self.put_inner(entry);
        self.volume.end_transaction();
        result
    }

    fn put_inner(&mut self, entry: IndexEntry) -> Result<bool> {
        let outcome = self.insert_into(NodeId::Root, entry, 0)?;
        self.file.update_record_in_mft(self.volume)?;
        Ok(outcome == TreeOutcome::Replaced)
    }

    /// Remove the entry matching `key` and return it.
    pub fn remove(&mut self, key: &[u8]) -> Result<IndexEntry> {
        self.volume.begin_transaction();
        let result = self.remove_inner(key);
        self.volume.end_transaction();
        result
    }

    fn remove_inner(&mut self, key: &[u8]) -> Result<IndexEntry> {
        let mut pending = Vec::new();
        let (removed, _) = self.remove_from(NodeId::Root, key, &mut pending, 0)?;
        let removed = removed.ok_or_else(|| {
            NtfsError::NotFound(format!("key {} in index {}", hex::encode(key), from_utf16(&self.name)))
        })?;
        if !pending.is_empty() {
            trace!("Reinserting {} entries displaced by the removal", pending.len());
        }
        for entry in pending {
            self.insert_into(NodeId::Root, entry, 0)?;
        }
        self.file.update_record_in_mft(self.volume)?;
        Ok(removed)
    }

    /// Every entry in collation order.
    pub fn entries(&mut self) -> Result<Vec<IndexEntry>> {
        let mut out = Vec::new();
        self.collect(NodeId::Root, &mut out, 0)?;
        Ok(out)
    }

    /// Walk the whole tree: node shape, strict key order, and every child
    /// block marked in use exactly once.
    pub fn check(&mut self) -> Result<()> {
        let bitmap = if self.file.has_attribute(&self.bitmap_key()) { Some(self.load_bitmap()?) } else { None };
        let mut seen = BTreeSet::new();
        self.check_node(NodeId::Root, bitmap.as_ref(), &mut seen, 0)?;
        if let Some(bitmap) = &bitmap {
            let marked = bitmap.count_set();
            if marked != seen.len() as u64 {
                return Err(NtfsError::FormatCorruption(format!(
                    "index {} marks {} blocks in use but the tree reaches {}",
                    from_utf16(&self.name),
                    marked,
                    seen.len()
                )));
            }
        }
        let entries = self.entries()?;
        let upcase = self.volume.upcase();
        for pair in entries.windows(2) {
            if self.rule.compare(&pair[0].key, &pair[1].key, upcase) != std::cmp::Ordering::Less {
                return Err(NtfsError::FormatCorruption(format!(
                    "index {} keys out of order: {} before {}",
                    from_utf16(&self.name),
                    hex::encode(&pair[0].key),
                    hex::encode(&pair[1].key)
                )));
            }
        }
        Ok(())
    }

    fn check_node(
        &mut self,
        id: NodeId,
        bitmap: Option<&Bitmap>,
        seen: &mut BTreeSet<u64>,
        depth: usize,
    ) -> Result<()> {
        tree::check_depth(depth)?;
        let node = self.load(id)?;
        node.check()?;
        for child in node.entries.iter().filter_map(|e| e.child) {
            let number = self.block_number(child);
            if !bitmap.map(|b| b.get(number)).unwrap_or(false) {
                return Err(NtfsError::FormatCorruption(format!(
                    "index block at VCN {} is referenced but not marked in use",
                    child
                )));
            }
            if !seen.insert(number) {
                return Err(NtfsError::FormatCorruption(format!(
                    "index block at VCN {} is referenced twice",
                    child
                )));
            }
            self.check_node(NodeId::Block(child), bitmap, seen, depth + 1)?;
        }
        Ok(())
    }

    fn collect(&mut self, id: NodeId, out: &mut Vec<IndexEntry>, depth: usize) -> Result<()> {
        tree::check_depth(depth)?;
        let node = self.load(id)?;
        for entry in node.entries {
            if let Some(child) = entry.child {
                self.collect(NodeId::Block(child), out, depth + 1)?;
            }
            if !entry.is_end {
                out.push(IndexEntry { child: None, ..entry });
            }
        }
        Ok(())
    }

    /// Move every root entry into a new block so the root shrinks to a
    /// single End entry. False when the root has no real entries to move.
    pub fn depose_root(&mut self) -> Result<bool> {
        let root = self.load(NodeId::Root)?;
        if root.real_len() == 0 {
            return Ok(false);
        }
        self.depose(root)?;
        Ok(true)
    }

    /// Remove the index and everything it allocated from the file.
    pub fn destroy(self) -> Result<()> {
        let keys = [self.root_key(), self.alloc_key(), self.bitmap_key()];
        let Index { volume, file, name, .. } = self;
        for key in keys {
            if file.has_attribute(&key) {
                file.drop_attribute(volume, &key)?;
            }
        }
        volume.invalidate_index_blocks(file.number(), &name);
        file.update_record_in_mft(volume)?;
        debug!("Destroyed index {} of record {}", from_utf16(&name), file.number());
        Ok(())
    }

    // Node storage

    pub(crate) fn load(&mut self, id: NodeId) -> Result<IndexNode> {
        match id {
            NodeId::Root => {
                let value = self.file.resident_value(&self.root_key())?;
                IndexNode::parse(&value[ROOT_HEADER_SIZE..], self.format)
            }
            NodeId::Block(vcn) => {
                let bytes = self.read_block_bytes(vcn)?;
                block::decode_block(&bytes, self.format)
            }
        }
    }

    pub(crate) fn store(&mut self, id: NodeId, node: &IndexNode) -> Result<()> {
        node.check()?;
        match id {
            NodeId::Root => {
                let key = self.root_key();
                let mut value = self.file.resident_value(&key)?[..ROOT_HEADER_SIZE].to_vec();
                value.extend(node.serialize(self.format, INDEX_HEADER_SIZE, 0));
                self.file.set_resident_value(&key, value)
            }
            NodeId::Block(vcn) => self.write_block(vcn, node),
        }
    }

    /// Whether `node` can be stored at `id` without restructuring.
    pub(crate) fn fits(&self, id: NodeId, node: &IndexNode) -> bool {
        match id {
            NodeId::Root => {
                ROOT_HEADER_SIZE + node.index_len(INDEX_HEADER_SIZE, self.format) <= self.volume.index_root_budget()
            }
            NodeId::Block(_) => {
                node.index_len(block::entries_offset(self.block_size), self.format)
                    <= block::node_budget(self.block_size)
            }
        }
    }

    fn block_offset(&self, vcn: u64) -> u64 {
        vcn * self.vcn_unit
    }

    fn block_number(&self, vcn: u64) -> u64 {
        vcn * self.vcn_unit / self.block_size as u64
    }

    fn block_vcn(&self, number: u64) -> u64 {
        number * self.block_size as u64 / self.vcn_unit
    }

    fn read_block_bytes(&mut self, vcn: u64) -> Result<Vec<u8>> {
        let cache_key = self.cache_key(vcn);
        if let Some(bytes) = self.volume.cached_block(&cache_key) {
            return Ok(bytes);
        }
        let key = self.alloc_key();
        let offset = self.block_offset(vcn);
        let mut bytes = vec![0u8; self.block_size];
        let n = self.file.read_attribute(self.volume, &key, offset, &mut bytes)?;
        if n != self.block_size {
            return Err(NtfsError::FormatCorruption(format!(
                "index block at VCN {} lies beyond the end of {}",
                vcn, key
            )));
        }
        block::unprotect_block(&mut bytes, vcn)?;
        self.volume.cache_block(cache_key, bytes.clone());
        Ok(bytes)
    }

    fn write_block(&mut self, vcn: u64, node: &IndexNode) -> Result<()> {
        let cache_key = self.cache_key(vcn);
        let previous = self.volume.cached_block(&cache_key).map(|b| block::block_usn(&b)).unwrap_or(0);
        let mut bytes = block::encode_block(node, self.format, vcn, self.block_size, previous)?;
        let (disk, usn) = block::protect_block(&bytes)?;
        LittleEndian::write_u16(&mut bytes[block::BLOCK_USA_OFFSET..], usn);
        let key = self.alloc_key();
        let offset = self.block_offset(vcn);
        self.file.write_data(self.volume, &key, offset, &disk)?;
        self.volume.cache_block(cache_key, bytes);
        trace!("Stored index block VCN {} ({} entries, USN {})", vcn, node.entries.len(), usn);
        Ok(())
    }

    // Block allocation

    fn ensure_allocation(&mut self) -> Result<()> {
        let alloc = self.alloc_key();
        if !self.file.has_attribute(&alloc) {
            self.file.insert_non_resident(self.volume, &alloc, 0)?;
        }
        let bitmap = self.bitmap_key();
        if !self.file.has_attribute(&bitmap) {
            self.file.insert_resident(&bitmap, vec![0u8; (BITMAP_GROWTH_BITS / 8) as usize])?;
        }
        Ok(())
    }

    fn load_bitmap(&mut self) -> Result<Bitmap> {
        let key = self.bitmap_key();
        let bytes = self.file.read_all(self.volume, &key)?;
        let len = bytes.len() as u64 * 8;
        Ok(Bitmap::from_bytes(bytes, len))
    }

    fn store_bitmap(&mut self, bitmap: &Bitmap) -> Result<()> {
        let key = self.bitmap_key();
        if (bitmap.as_bytes().len() as u64) < self.file.attribute_length(&key)? {
            self.file.set_length_data(self.volume, &key, bitmap.as_bytes().len() as u64)?;
        }
        self.file.write_data(self.volume, &key, 0, bitmap.as_bytes())
    }

    pub(crate) fn allocate_block(&mut self) -> Result<u64> {
        self.ensure_allocation()?;
        let mut bitmap = self.load_bitmap()?;
        let number = match bitmap.find_clear(0) {
            Some(number) => number,
            None => {
                let number = bitmap.len();
                bitmap.resize(number + BITMAP_GROWTH_BITS);
                number
            }
        };
        bitmap.set(number);
        self.store_bitmap(&bitmap)?;

        let alloc = self.alloc_key();
        let end = (number + 1) * self.block_size as u64;
        if self.file.attribute_length(&alloc)? < end {
            self.file.set_length_data(self.volume, &alloc, end)?;
        }
        let vcn = self.block_vcn(number);
        let cache_key = self.cache_key(vcn);
        self.volume.invalidate_block(&cache_key);
        trace!("Allocated index block {} (VCN {}) in {}", number, vcn, from_utf16(&self.name));
        Ok(vcn)
    }

    pub(crate) fn free_block(&mut self, vcn: u64) -> Result<()> {
        let mut bitmap = self.load_bitmap()?;
        let number = self.block_number(vcn);
        if !bitmap.get(number) {
            return Err(NtfsError::FormatCorruption(format!(
                "freeing index block at VCN {} which is not in use",
                vcn
            )));
        }
        bitmap.clear(number);
        self.store_bitmap(&bitmap)?;
        let cache_key = self.cache_key(vcn);
        self.volume.invalidate_block(&cache_key);
        self.stats.blocks_freed += 1;

        // Hand back the space past the last block still in use
        let used = (0..bitmap.len()).rev().find(|&b| bitmap.get(b)).map(|b| b + 1).unwrap_or(0);
        let alloc = self.alloc_key();
        let keep = used * self.block_size as u64;
        if keep < self.file.attribute_length(&alloc)? {
            self.file.set_length_data(self.volume, &alloc, keep)?;
        }
        trace!("Freed index block {} (VCN {}) in {}", number, vcn, from_utf16(&self.name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::format;
    use ntfsrw_core::{FormatOptions, MemoryDevice, VolumeConfig};

    fn volume(block_size: u32) -> Volume {
        let options = FormatOptions { index_block_size: block_size, ..FormatOptions::default() };
        format(Box::new(MemoryDevice::new(16 << 20)), &options, VolumeConfig::default()).unwrap()
    }

    fn key(n: u32) -> Vec<u8> {
        n.to_le_bytes().to_vec()
    }

    fn view_file(volume: &mut Volume) -> NtfsFile {
        let mut file = NtfsFile::create(volume, false, FILE_ATTRIBUTE_VIEW_INDEX).unwrap();
        Index::create(volume, &mut file, &to_utf16("$Q"), 0, CollationRule::UnsignedLong).unwrap();
        file
    }

    #[test]
    fn test_empty_index_lookup() {
        let mut volume = volume(4096);
        let mut file = view_file(&mut volume);
        let mut index = Index::open(&mut volume, &mut file, &to_utf16("$Q")).unwrap();
        assert_eq!(index.find(&key(1)).unwrap(), None);
        assert!(index.entries().unwrap().is_empty());
        index.check().unwrap();
    }

    #[test]
    fn test_put_find_and_replace() {
        let mut volume = volume(4096);
        let mut file = view_file(&mut volume);
        let mut index = Index::open(&mut volume, &mut file, &to_utf16("$Q")).unwrap();
        assert!(!index.put(IndexEntry::new(key(7), b"seven".to_vec())).unwrap());
        assert!(index.put(IndexEntry::new(key(7), b"SEVEN".to_vec())).unwrap());
        assert_eq!(index.find(&key(7)).unwrap().unwrap().value, b"SEVEN".to_vec());
        assert!(matches!(
            index.put(IndexEntry::new(key(7), b"longer".to_vec())),
            Err(NtfsError::LogicalMisuse(_))
        ));
    }

    #[test]
    fn test_root_deposes_into_a_block() {
        let mut volume = volume(4096);
        let mut file = view_file(&mut volume);
        let mut index = Index::open(&mut volume, &mut file, &to_utf16("$Q")).unwrap();
        for n in 0..40 {
            index.put(IndexEntry::new(key(n), vec![0; 8])).unwrap();
        }
        assert!(index.stats().deposes >= 1);
        index.check().unwrap();
        let keys: Vec<Vec<u8>> = index.entries().unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, (0..40).map(key).collect::<Vec<_>>());
    }

    #[test]
    fn test_blocks_divide_and_collapse() {
        let mut volume = volume(1024);
        let mut file = view_file(&mut volume);
        let mut index = Index::open(&mut volume, &mut file, &to_utf16("$Q")).unwrap();
        for n in (0..600).rev() {
            index.put(IndexEntry::new(key(n), vec![1; 4])).unwrap();
        }
        assert!(index.stats().divides > 0);
        index.check().unwrap();
        for n in 0..600 {
            index.remove(&key(n)).unwrap();
        }
        assert!(index.entries().unwrap().is_empty());
        assert!(index.stats().blocks_freed > 0);
        index.check().unwrap();
    }

    #[test]
    fn test_remove_missing_key() {
        let mut volume = volume(4096);
        let mut file = view_file(&mut volume);
        let mut index = Index::open(&mut volume, &mut file, &to_utf16("$Q")).unwrap();
        index.put(IndexEntry::new(key(1), vec![])).unwrap();
        assert!(matches!(index.remove(&key(2)), Err(NtfsError::NotFound(_))));
        assert_eq!(index.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_destroy_releases_blocks() {
        let mut volume = volume(1024);
        let free = volume.free_clusters();
        let mut file = view_file(&mut volume);
        {
            let mut index = Index::open(&mut volume, &mut file, &to_utf16("$Q")).unwrap();
            for n in 0..300 {
                index.put(IndexEntry::new(key(n), vec![2; 4])).unwrap();
            }
            index.destroy().unwrap();
        }
        assert!(!file.has_attribute(&AttrKey::new(ATTR_TYPE_INDEX_ROOT, "$Q")));
        file.delete(&mut volume).unwrap();
        assert_eq!(volume.free_clusters(), free);
    }
}
