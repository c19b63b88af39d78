// NTFS Attribute List support
// One entry per attribute extent of a file whose metadata spans several
// MFT records; the list itself lives in the base record

use crate::attributes::AttrKey;
use crate::structures::{align8, read_utf16, FileReference};
use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use ntfsrw_core::{NtfsError, Result};

const ENTRY_HEADER_SIZE: usize = 0x1A;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeListEntry {
    pub type_code: u32,
    pub name: Vec<u16>,
    pub start_vcn: u64,
    /// Record holding the extent
    pub reference: FileReference,
    pub attribute_id: u16,
}

impl AttributeListEntry {
    pub fn key(&self) -> AttrKey {
        AttrKey { type_code: self.type_code, name: self.name.clone() }
    }

    pub fn encoded_len(&self) -> usize {
        align8(ENTRY_HEADER_SIZE + self.name.len() * 2)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let length = self.encoded_len();
        out.resize(start + length, 0);
        let buf = &mut out[start..];
        LittleEndian::write_u32(&mut buf[0x00..], self.type_code);
        LittleEndian::write_u16(&mut buf[0x04..], length as u16);
        buf[0x06] = self.name.len() as u8;
        buf[0x07] = ENTRY_HEADER_SIZE as u8;
        LittleEndian::write_u64(&mut buf[0x08..], self.start_vcn);
        LittleEndian::write_u64(&mut buf[0x10..], self.reference.0);
        LittleEndian::write_u16(&mut buf[0x18..], self.attribute_id);
        for (i, unit) in self.name.iter().enumerate() {
            LittleEndian::write_u16(&mut buf[ENTRY_HEADER_SIZE + i * 2..], *unit);
        }
    }
}

/// Parse the value of an `$ATTRIBUTE_LIST` attribute.
pub fn parse_attribute_list(data: &[u8]) -> Result<Vec<AttributeListEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset + ENTRY_HEADER_SIZE <= data.len() {
        let entry = &data[offset..];
        let record_length = LittleEndian::read_u16(&entry[0x04..]) as usize;
        if record_length < ENTRY_HEADER_SIZE || offset + record_length > data.len() {
            return Err(NtfsError::FormatCorruption(format!(
                "attribute list entry at {} declares length {}",
                offset, record_length
            )));
        }
        let name_length = entry[0x06] as usize;
        let name_offset = entry[0x07] as usize;
        if name_offset + name_length * 2 > record_length {
            return Err(NtfsError::FormatCorruption(format!(
                "attribute list entry at {} has its name outside the entry",
                offset
            )));
        }
        let parsed = AttributeListEntry {
            type_code: LittleEndian::read_u32(&entry[0x00..]),
            name: read_utf16(&entry[name_offset..], name_length)?,
            start_vcn: LittleEndian::read_u64(&entry[0x08..]),
            reference: FileReference(LittleEndian::read_u64(&entry[0x10..])),
            attribute_id: LittleEndian::read_u16(&entry[0x18..]),
        };
        trace!(
            "Attribute list entry: type=0x{:X}, record={}, VCN={}",
            parsed.type_code,
            parsed.reference,
            parsed.start_vcn
        );
        entries.push(parsed);
        offset += record_length;
    }

    Ok(entries)
}

/// Encode entries in on-disk order (type, name, start VCN).
pub fn encode_attribute_list(entries: &[AttributeListEntry]) -> Vec<u8> {
    let mut sorted: Vec<&AttributeListEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        (a.type_code, &a.name, a.start_vcn).cmp(&(b.type_code, &b.name, b.start_vcn))
    });
    let mut out = Vec::with_capacity(entries.iter().map(|e| e.encoded_len()).sum());
    for entry in sorted {
        entry.encode(&mut out);
    }
    out
}

/// Distinct records referenced by the list, in ascending order.
pub fn referenced_records(entries: &[AttributeListEntry]) -> Vec<FileReference> {
    let mut records: Vec<FileReference> = entries.iter().map(|e| e.reference).collect();
    records.sort_unstable_by_key(|r| r.record());
    records.dedup();
    records
}
