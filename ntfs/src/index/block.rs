// INDX blocks: fixup-protected index nodes stored in $INDEX_ALLOCATION
//
//   0x00  "INDX"
//   0x04  USA offset, USA count
//   0x08  LSN
//   0x10  VCN of this block
//   0x18  index header
//   0x28  update sequence array

use super::entry::{EntryFormat, IndexNode};
use crate::fixup::{apply_fixup, protect, usa_count_for};
use crate::structures::{align8, INDEX_BLOCK_SIGNATURE};
use byteorder::{ByteOrder, LittleEndian};
use ntfsrw_core::{NtfsError, Result};

pub const BLOCK_HEADER_SIZE: usize = 0x18;
pub const BLOCK_USA_OFFSET: usize = 0x28;

/// Offset of the first entry, relative to the index header.
pub fn entries_offset(block_size: usize) -> usize {
    align8(BLOCK_USA_OFFSET + usa_count_for(block_size) as usize * 2) - BLOCK_HEADER_SIZE
}

/// Largest index length a node may reach inside one block.
pub fn node_budget(block_size: usize) -> usize {
    block_size - BLOCK_HEADER_SIZE
}

/// Check signature and VCN, then undo the fixups in place.
pub fn unprotect_block(data: &mut [u8], vcn: u64) -> Result<()> {
    if data.len() < BLOCK_USA_OFFSET || &data[0..4] != INDEX_BLOCK_SIGNATURE {
        return Err(NtfsError::FormatCorruption(format!(
            "index block at VCN {} has signature {}",
            vcn,
            hex::encode(&data[..data.len().min(4)])
        )));
    }
    let usa_offset = LittleEndian::read_u16(&data[0x04..]);
    let usa_count = LittleEndian::read_u16(&data[0x06..]);
    if usa_count != usa_count_for(data.len()) {
        return Err(NtfsError::FormatCorruption(format!(
            "index block at VCN {} has {} fixup entries for {} bytes",
            vcn,
            usa_count,
            data.len()
        )));
    }
    apply_fixup(data, usa_offset, usa_count)?;
    let stored = LittleEndian::read_u64(&data[0x10..]);
    if stored != vcn {
        return Err(NtfsError::FormatCorruption(format!(
            "index block read at VCN {} claims VCN {}",
            vcn, stored
        )));
    }
    Ok(())
}

pub fn decode_block(data: &[u8], format: EntryFormat) -> Result<IndexNode> {
    IndexNode::parse(&data[BLOCK_HEADER_SIZE..], format)
}

/// Lay a node out as an unprotected block. `usn` goes in the USA slot so
/// the next protect continues the sequence.
pub fn encode_block(node: &IndexNode, format: EntryFormat, vcn: u64, block_size: usize, usn: u16) -> Result<Vec<u8>> {
    let offset = entries_offset(block_size);
    let budget = node_budget(block_size);
    let header = node.serialize(format, offset, budget);
    if header.len() > budget {
        return Err(NtfsError::CapacityExhausted(format!(
            "index node of {} bytes does not fit a {}-byte block",
            header.len(),
            block_size
        )));
    }
    let mut block = vec![0u8; block_size];
    block[0..4].copy_from_slice(INDEX_BLOCK_SIGNATURE);
    LittleEndian::write_u16(&mut block[0x04..], BLOCK_USA_OFFSET as u16);
    LittleEndian::write_u16(&mut block[0x06..], usa_count_for(block_size));
    LittleEndian::write_u64(&mut block[0x10..], vcn);
    // The USA sits inside the gap the header leaves before the entries
    block[BLOCK_HEADER_SIZE..BLOCK_USA_OFFSET].copy_from_slice(&header[..BLOCK_USA_OFFSET - BLOCK_HEADER_SIZE]);
    let entries_at = BLOCK_HEADER_SIZE + offset;
    block[entries_at..BLOCK_HEADER_SIZE + header.len()].copy_from_slice(&header[offset..]);
    LittleEndian::write_u16(&mut block[BLOCK_USA_OFFSET..], usn);
    Ok(block)
}

/// Fixup-protect a copy for disk; returns it with the USN used.
pub fn protect_block(block: &[u8]) -> Result<(Vec<u8>, u16)> {
    let mut disk = block.to_vec();
    let usn = protect(&mut disk, BLOCK_USA_OFFSET as u16, usa_count_for(block.len()))?;
    Ok((disk, usn))
}

pub fn block_usn(block: &[u8]) -> u16 {
    LittleEndian::read_u16(&block[BLOCK_USA_OFFSET..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::entry::IndexEntry;

    fn node() -> IndexNode {
        let mut entries: Vec<IndexEntry> = (0..20u32)
            .map(|i| IndexEntry::new(i.to_le_bytes().to_vec(), vec![i as u8; 8]))
            .collect();
        entries.push(IndexEntry::end(None));
        IndexNode { entries }
    }

    #[test]
    fn test_block_round_trip_through_fixups() {
        let block = encode_block(&node(), EntryFormat::View, 6, 1024, 0).unwrap();
        let (mut disk, usn) = protect_block(&block).unwrap();
        assert_eq!(usn, 1);
        assert_eq!(LittleEndian::read_u16(&disk[510..]), 1);
        unprotect_block(&mut disk, 6).unwrap();
        assert_eq!(decode_block(&disk, EntryFormat::View).unwrap(), node());
    }

    #[test]
    fn test_wrong_vcn_is_corruption() {
        let block = encode_block(&node(), EntryFormat::View, 6, 1024, 0).unwrap();
        let (mut disk, _) = protect_block(&block).unwrap();
        assert!(matches!(unprotect_block(&mut disk, 8), Err(NtfsError::FormatCorruption(_))));
    }

    #[test]
    fn test_oversized_node_is_rejected() {
        let mut entries: Vec<IndexEntry> = (0..100u32)
            .map(|i| IndexEntry::new(i.to_le_bytes().to_vec(), vec![0; 16]))
            .collect();
        entries.push(IndexEntry::end(None));
        let big = IndexNode { entries };
        assert!(encode_block(&big, EntryFormat::View, 0, 1024, 0).is_err());
    }

    #[test]
    fn test_entries_offset_clears_the_usa() {
        assert_eq!(entries_offset(4096), 0x28);
        assert_eq!(entries_offset(1024), 0x18);
    }
}
