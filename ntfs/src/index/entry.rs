// Index entries and the node (index header + entry chain) that holds them
//
// Entry layout:
//   0x00  file reference (file-name indexes) or data offset u16 / data length u16
//   0x08  entry length u16
//   0x0A  key length u16
//   0x0C  flags u16 (NODE, END)
//   0x10  key, then view data
//   end-8 child VCN when NODE is set

use crate::structures::{align8, FileReference};
use byteorder::{ByteOrder, LittleEndian};
use ntfsrw_core::{NtfsError, Result};

pub const ENTRY_NODE: u16 = 0x0001;
pub const ENTRY_END: u16 = 0x0002;
const ENTRY_HEADER_SIZE: usize = 0x10;

pub const INDEX_HEADER_SIZE: usize = 0x10;
const INDEX_HAS_CHILDREN: u8 = 0x01;

/// How an entry stores its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFormat {
    /// Value is the 8-byte file reference in the entry header
    FileName,
    /// Value is data placed after the key
    View,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub child: Option<u64>,
    pub is_end: bool,
}

impl IndexEntry {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { key, value, child: None, is_end: false }
    }

    pub fn end(child: Option<u64>) -> Self {
        Self { key: Vec::new(), value: Vec::new(), child, is_end: true }
    }

    /// File reference of a file-name index entry.
    pub fn file_reference(&self) -> Option<FileReference> {
        (self.value.len() == 8).then(|| FileReference(LittleEndian::read_u64(&self.value)))
    }

    pub fn encoded_len(&self, format: EntryFormat) -> usize {
        let body = match format {
            EntryFormat::FileName => ENTRY_HEADER_SIZE + self.key.len(),
            EntryFormat::View => ENTRY_HEADER_SIZE + self.key.len() + self.value.len(),
        };
        align8(body) + if self.child.is_some() { 8 } else { 0 }
    }

    pub fn check_value(&self, format: EntryFormat) -> Result<()> {
        if format == EntryFormat::FileName && !self.is_end && self.value.len() != 8 {
            return Err(NtfsError::InvalidInput(format!(
                "file-name index values are 8-byte references, got {} bytes",
                self.value.len()
            )));
        }
        if self.key.len() > u16::MAX as usize || self.value.len() > u16::MAX as usize {
            return Err(NtfsError::InvalidInput("index entry too large".to_string()));
        }
        Ok(())
    }

    pub fn serialize(&self, format: EntryFormat, out: &mut Vec<u8>) {
        let start = out.len();
        let length = self.encoded_len(format);
        out.resize(start + length, 0);
        let buf = &mut out[start..];
        match format {
            EntryFormat::FileName => {
                if !self.is_end {
                    buf[0..8].copy_from_slice(&self.value);
                }
            }
            EntryFormat::View => {
                if !self.is_end {
                    LittleEndian::write_u16(&mut buf[0x00..], (ENTRY_HEADER_SIZE + self.key.len()) as u16);
                    LittleEndian::write_u16(&mut buf[0x02..], self.value.len() as u16);
                }
            }
        }
        LittleEndian::write_u16(&mut buf[0x08..], length as u16);
        LittleEndian::write_u16(&mut buf[0x0A..], self.key.len() as u16);
        let mut flags = 0;
        if self.child.is_some() {
            flags |= ENTRY_NODE;
        }
        if self.is_end {
            flags |= ENTRY_END;
        }
        LittleEndian::write_u16(&mut buf[0x0C..], flags);
        let key_end = ENTRY_HEADER_SIZE + self.key.len();
        buf[ENTRY_HEADER_SIZE..key_end].copy_from_slice(&self.key);
        if format == EntryFormat::View {
            buf[key_end..key_end + self.value.len()].copy_from_slice(&self.value);
        }
        if let Some(child) = self.child {
            LittleEndian::write_u64(&mut buf[length - 8..], child);
        }
    }

    /// Parse one entry; returns it with its length.
    pub fn parse(data: &[u8], format: EntryFormat) -> Result<(Self, usize)> {
        if data.len() < ENTRY_HEADER_SIZE {
            return Err(NtfsError::FormatCorruption("index entry header truncated".to_string()));
        }
        let length = LittleEndian::read_u16(&data[0x08..]) as usize;
        let key_len = LittleEndian::read_u16(&data[0x0A..]) as usize;
        let flags = LittleEndian::read_u16(&data[0x0C..]);
        if length < ENTRY_HEADER_SIZE || length % 8 != 0 || length > data.len() {
            return Err(NtfsError::FormatCorruption(format!(
                "index entry length {} with {} bytes left",
                length,
                data.len()
            )));
        }
        let is_end = flags & ENTRY_END != 0;
        let child_bytes = if flags & ENTRY_NODE != 0 { 8 } else { 0 };
        let payload_end = length - child_bytes;
        let key_end = ENTRY_HEADER_SIZE + key_len;
        if key_end > payload_end {
            return Err(NtfsError::FormatCorruption(format!(
                "index key of {} bytes overruns a {}-byte entry",
                key_len, length
            )));
        }
        let key = data[ENTRY_HEADER_SIZE..key_end].to_vec();
        let value = if is_end {
            Vec::new()
        } else {
            match format {
                EntryFormat::FileName => data[0..8].to_vec(),
                EntryFormat::View => {
                    let offset = LittleEndian::read_u16(&data[0x00..]) as usize;
                    let len = LittleEndian::read_u16(&data[0x02..]) as usize;
                    if offset + len > payload_end {
                        return Err(NtfsError::FormatCorruption(format!(
                            "view data at {}+{} overruns a {}-byte entry",
                            offset, len, length
                        )));
                    }
                    data[offset..offset + len].to_vec()
                }
            }
        };
        let child = (child_bytes != 0).then(|| LittleEndian::read_u64(&data[length - 8..]));
        Ok((Self { key, value, child, is_end }, length))
    }
}

/// The entries of one node. The last entry is always the End entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNode {
    pub entries: Vec<IndexEntry>,
}

impl IndexNode {
    pub fn leaf() -> Self {
        Self { entries: vec![IndexEntry::end(None)] }
    }

    pub fn has_children(&self) -> bool {
        self.entries.last().map(|e| e.child.is_some()).unwrap_or(false)
    }

    /// Real entries (everything but End).
    pub fn real_len(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    pub fn is_empty_leaf(&self) -> bool {
        self.real_len() == 0 && !self.has_children()
    }

    /// `Some(child)` when the node is nothing but an End entry pointing down.
    pub fn lone_child(&self) -> Option<u64> {
        if self.real_len() == 0 {
            self.entries.last().and_then(|e| e.child)
        } else {
            None
        }
    }

    pub fn entries_len(&self, format: EntryFormat) -> usize {
        self.entries.iter().map(|e| e.encoded_len(format)).sum()
    }

    /// Bytes from the index header to the end of the last entry.
    pub fn index_len(&self, entries_offset: usize, format: EntryFormat) -> usize {
        entries_offset + self.entries_len(format)
    }

    /// Exactly one End entry, last, and child pointers on all entries or none.
    pub fn check(&self) -> Result<()> {
        let ends = self.entries.iter().filter(|e| e.is_end).count();
        if ends != 1 || !self.entries.last().map(|e| e.is_end).unwrap_or(false) {
            return Err(NtfsError::FormatCorruption(format!(
                "index node with {} End entries (must be exactly one, last)",
                ends
            )));
        }
        let with_child = self.entries.iter().filter(|e| e.child.is_some()).count();
        if with_child != 0 && with_child != self.entries.len() {
            return Err(NtfsError::FormatCorruption(format!(
                "index node mixes {} child pointers among {} entries",
                with_child,
                self.entries.len()
            )));
        }
        Ok(())
    }

    /// Parse from the start of an index header.
    pub fn parse(data: &[u8], format: EntryFormat) -> Result<Self> {
        if data.len() < INDEX_HEADER_SIZE {
            return Err(NtfsError::FormatCorruption("index header truncated".to_string()));
        }
        let entries_offset = LittleEndian::read_u32(&data[0x00..]) as usize;
        let index_len = LittleEndian::read_u32(&data[0x04..]) as usize;
        if entries_offset < INDEX_HEADER_SIZE || index_len < entries_offset || index_len > data.len() {
            return Err(NtfsError::FormatCorruption(format!(
                "index header: entries at {}, length {}, {} bytes available",
                entries_offset,
                index_len,
                data.len()
            )));
        }
        let mut entries = Vec::new();
        let mut at = entries_offset;
        loop {
            if at >= index_len {
                return Err(NtfsError::FormatCorruption("index node has no End entry".to_string()));
            }
            let (entry, len) = IndexEntry::parse(&data[at..index_len], format)?;
            at += len;
            let end = entry.is_end;
            entries.push(entry);
            if end {
                break;
            }
        }
        if at != index_len {
            return Err(NtfsError::FormatCorruption(format!(
                "index header declares {} bytes but the entries end at {}",
                index_len, at
            )));
        }
        let node = Self { entries };
        node.check()?;
        Ok(node)
    }

    /// Index header plus entries; `allocated` of zero means "exactly used".
    pub fn serialize(&self, format: EntryFormat, entries_offset: usize, allocated: usize) -> Vec<u8> {
        let index_len = self.index_len(entries_offset, format);
        let mut out = vec![0u8; entries_offset];
        LittleEndian::write_u32(&mut out[0x00..], entries_offset as u32);
        LittleEndian::write_u32(&mut out[0x04..], index_len as u32);
        let allocated = if allocated == 0 { index_len } else { allocated };
        LittleEndian::write_u32(&mut out[0x08..], allocated as u32);
        out[0x0C] = if self.has_children() { INDEX_HAS_CHILDREN } else { 0 };
        for entry in &self.entries {
            entry.serialize(format, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_node() -> IndexNode {
        IndexNode {
            entries: vec![
                IndexEntry::new(1u32.to_le_bytes().to_vec(), b"one".to_vec()),
                IndexEntry::new(2u32.to_le_bytes().to_vec(), b"two!".to_vec()),
                IndexEntry::end(None),
            ],
        }
    }

    #[test]
    fn test_view_node_round_trip() {
        let node = view_node();
        let bytes = node.serialize(EntryFormat::View, INDEX_HEADER_SIZE, 0);
        assert_eq!(LittleEndian::read_u32(&bytes[0x04..]) as usize, bytes.len());
        assert_eq!(IndexNode::parse(&bytes, EntryFormat::View).unwrap(), node);
    }

    #[test]
    fn test_file_name_entry_keeps_reference_in_header() {
        let reference = FileReference::new(42, 3);
        let mut entry = IndexEntry::new(vec![0xAB; 0x4A], reference.0.to_le_bytes().to_vec());
        entry.child = Some(7);
        let mut out = Vec::new();
        entry.serialize(EntryFormat::FileName, &mut out);
        assert_eq!(out.len(), align8(0x10 + 0x4A) + 8);
        assert_eq!(LittleEndian::read_u64(&out[0..]), reference.0);
        let (parsed, len) = IndexEntry::parse(&out, EntryFormat::FileName).unwrap();
        assert_eq!(len, out.len());
        assert_eq!(parsed.file_reference(), Some(reference));
        assert_eq!(parsed.child, Some(7));
    }

    #[test]
    fn test_missing_end_is_corruption() {
        let node = view_node();
        let mut bytes = node.serialize(EntryFormat::View, INDEX_HEADER_SIZE, 0);
        let last = bytes.len() - 0x10;
        LittleEndian::write_u16(&mut bytes[last + 0x0C..], 0);
        assert!(matches!(IndexNode::parse(&bytes, EntryFormat::View), Err(NtfsError::FormatCorruption(_))));
    }

    #[test]
    fn test_check_rejects_mixed_children() {
        let mut node = view_node();
        node.entries[0].child = Some(3);
        assert!(node.check().is_err());
        for e in node.entries.iter_mut() {
            e.child = Some(3);
        }
        node.check().unwrap();
        assert!(node.has_children());
    }
}
