// FILE records: the fixed-size MFT entries holding a file's attributes
// Header, update sequence array, attribute chain and 0xFFFFFFFF end marker

use crate::attributes::AttributeRecord;
use crate::fixup::{apply_fixup, protect, usa_count_for};
use crate::structures::*;
use byteorder::{ByteOrder, LittleEndian};
use log::{trace, warn};
use ntfsrw_core::{NtfsError, Result};

pub const RECORD_USA_OFFSET: usize = 0x30;
const END_MARKER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordHeader {
    pub usn: u16,
    pub lsn: u64,
    pub sequence: u16,
    pub link_count: u16,
    pub flags: u16,
    /// Base record for secondary records, null for base records
    pub base_reference: FileReference,
    pub next_attribute_id: u16,
}

impl RecordHeader {
    pub fn in_use(&self) -> bool {
        self.flags & MFT_RECORD_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & MFT_RECORD_IS_DIRECTORY != 0
    }

    pub fn take_attribute_id(&mut self) -> u16 {
        let id = self.next_attribute_id;
        self.next_attribute_id = self.next_attribute_id.wrapping_add(1);
        id
    }
}

/// Offset of the first attribute in a record of `record_size` bytes.
pub fn attributes_offset(record_size: usize) -> usize {
    align8(RECORD_USA_OFFSET + usa_count_for(record_size) as usize * 2)
}

/// Bytes used by a record holding attributes of the given encoded lengths.
pub fn used_size(record_size: usize, attribute_bytes: usize) -> usize {
    attributes_offset(record_size) + attribute_bytes + END_MARKER_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub number: u64,
    pub header: RecordHeader,
    pub attributes: Vec<AttributeRecord>,
}

impl FileRecord {
    pub fn new(number: u64, sequence: u16, flags: u16) -> Self {
        Self {
            number,
            header: RecordHeader { sequence, flags, ..Default::default() },
            attributes: Vec::new(),
        }
    }

    pub fn reference(&self) -> FileReference {
        FileReference::new(self.number, self.header.sequence)
    }

    pub fn is_base(&self) -> bool {
        self.header.base_reference.is_null()
    }

    pub fn used_size(&self, record_size: usize) -> usize {
        used_size(record_size, self.attributes.iter().map(|a| a.encoded_len()).sum())
    }

    pub fn find(&self, type_code: u32, name: &[u16]) -> Option<&AttributeRecord> {
        self.attributes.iter().find(|a| a.type_code == type_code && a.name == name)
    }

    pub fn find_mut(&mut self, type_code: u32, name: &[u16]) -> Option<&mut AttributeRecord> {
        self.attributes.iter_mut().find(|a| a.type_code == type_code && a.name == name)
    }

    /// Parse a record read from disk. The buffer must be exactly one record.
    pub fn parse(number: u64, mut data: Vec<u8>) -> Result<Self> {
        if data.len() < RECORD_USA_OFFSET + 8 {
            return Err(NtfsError::FormatCorruption(format!("record {} too small", number)));
        }
        if &data[0..4] != FILE_RECORD_SIGNATURE {
            return Err(NtfsError::FormatCorruption(format!(
                "record {} has signature {} instead of FILE",
                number,
                hex::encode(&data[0..4])
            )));
        }
        let usa_offset = LittleEndian::read_u16(&data[0x04..]);
        let usa_count = LittleEndian::read_u16(&data[0x06..]);
        apply_fixup(&mut data, usa_offset, usa_count)?;

        let attrs_offset = LittleEndian::read_u16(&data[0x14..]) as usize;
        let bytes_used = LittleEndian::read_u32(&data[0x18..]) as usize;
        let bytes_allocated = LittleEndian::read_u32(&data[0x1C..]) as usize;
        if bytes_allocated != data.len() || bytes_used > data.len() || attrs_offset >= bytes_used {
            return Err(NtfsError::FormatCorruption(format!(
                "record {} declares {} used / {} allocated bytes (attributes at {}) in a {}-byte slot",
                number,
                bytes_used,
                bytes_allocated,
                attrs_offset,
                data.len()
            )));
        }
        let stored_number = LittleEndian::read_u32(&data[0x2C..]) as u64;
        if stored_number != number & 0xFFFF_FFFF {
            warn!("Record {} claims to be record {}", number, stored_number);
        }

        let header = RecordHeader {
            usn: LittleEndian::read_u16(&data[usa_offset as usize..]),
            lsn: LittleEndian::read_u64(&data[0x08..]),
            sequence: LittleEndian::read_u16(&data[0x10..]),
            link_count: LittleEndian::read_u16(&data[0x12..]),
            flags: LittleEndian::read_u16(&data[0x16..]),
            base_reference: FileReference(LittleEndian::read_u64(&data[0x20..])),
            next_attribute_id: LittleEndian::read_u16(&data[0x28..]),
        };

        let mut attributes = Vec::new();
        let mut offset = attrs_offset;
        loop {
            if offset + 4 > bytes_used {
                return Err(NtfsError::FormatCorruption(format!(
                    "record {} has no end marker within {} bytes",
                    number, bytes_used
                )));
            }
            if LittleEndian::read_u32(&data[offset..]) == ATTR_TYPE_END {
                break;
            }
            let (attr, length) = AttributeRecord::parse(&data[offset..bytes_used])?;
            attributes.push(attr);
            offset += length;
        }
        if offset + END_MARKER_SIZE != bytes_used {
            return Err(NtfsError::FormatCorruption(format!(
                "record {} declares {} used bytes but its attributes end at {}",
                number,
                bytes_used,
                offset + END_MARKER_SIZE
            )));
        }

        trace!("Parsed record {} with {} attributes", number, attributes.len());
        Ok(Self { number, header, attributes })
    }

    /// Serialize and fixup-protect the record, bumping its USN.
    pub fn serialize(&mut self, record_size: usize) -> Result<Vec<u8>> {
        let used = self.used_size(record_size);
        if used > record_size {
            return Err(NtfsError::FormatCorruption(format!(
                "record {} needs {} bytes but records hold {}",
                self.number, used, record_size
            )));
        }
        self.attributes.sort_by(|a, b| {
            (a.type_code, &a.name, a.lowest_vcn()).cmp(&(b.type_code, &b.name, b.lowest_vcn()))
        });

        let usa_count = usa_count_for(record_size);
        let attrs_offset = attributes_offset(record_size);
        let mut out = Vec::with_capacity(record_size);
        out.resize(attrs_offset, 0);
        out[0..4].copy_from_slice(FILE_RECORD_SIGNATURE);
        LittleEndian::write_u16(&mut out[0x04..], RECORD_USA_OFFSET as u16);
        LittleEndian::write_u16(&mut out[0x06..], usa_count);
        LittleEndian::write_u64(&mut out[0x08..], self.header.lsn);
        LittleEndian::write_u16(&mut out[0x10..], self.header.sequence);
        LittleEndian::write_u16(&mut out[0x12..], self.header.link_count);
        LittleEndian::write_u16(&mut out[0x14..], attrs_offset as u16);
        LittleEndian::write_u16(&mut out[0x16..], self.header.flags);
        LittleEndian::write_u32(&mut out[0x18..], used as u32);
        LittleEndian::write_u32(&mut out[0x1C..], record_size as u32);
        LittleEndian::write_u64(&mut out[0x20..], self.header.base_reference.0);
        LittleEndian::write_u16(&mut out[0x28..], self.header.next_attribute_id);
        LittleEndian::write_u32(&mut out[0x2C..], self.number as u32);
        LittleEndian::write_u16(&mut out[RECORD_USA_OFFSET..], self.header.usn);

        for attr in &self.attributes {
            attr.serialize(&mut out);
        }
        out.extend_from_slice(&ATTR_TYPE_END.to_le_bytes());
        out.resize(record_size, 0);

        self.header.usn = protect(&mut out, RECORD_USA_OFFSET as u16, usa_count)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_runs::RunSpan;

    fn sample() -> FileRecord {
        let mut record = FileRecord::new(42, 3, MFT_RECORD_IN_USE);
        record.header.link_count = 1;
        let mut si = AttributeRecord::resident(
            ATTR_TYPE_STANDARD_INFORMATION,
            &[],
            StandardInformation::new(5, 0).to_bytes(),
        );
        si.id = record.header.take_attribute_id();
        let mut data = AttributeRecord::non_resident(ATTR_TYPE_DATA, &[], 0);
        data.id = record.header.take_attribute_id();
        let body = data.non_resident_body_mut().unwrap();
        body.runs = vec![RunSpan::new(Some(500), 3)];
        body.allocated_size = 3 * 4096;
        body.data_size = 10_000;
        body.initialized_size = 10_000;
        record.attributes = vec![data, si];
        record
    }

    #[test]
    fn test_layout_offsets() {
        assert_eq!(attributes_offset(1024), 0x38);
        assert_eq!(attributes_offset(4096), 0x48);
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let mut record = sample();
        let bytes = record.serialize(1024).unwrap();
        assert_eq!(bytes.len(), 1024);
        assert_eq!(&bytes[0..4], b"FILE");
        assert_eq!(record.header.usn, 1);
        // Sorted by type on the way out
        assert_eq!(record.attributes[0].type_code, ATTR_TYPE_STANDARD_INFORMATION);

        let parsed = FileRecord::parse(42, bytes).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.reference(), FileReference::new(42, 3));
    }

    #[test]
    fn test_torn_write_detected() {
        let mut record = sample();
        let mut bytes = record.serialize(1024).unwrap();
        bytes[1022] ^= 0xFF;
        assert!(matches!(FileRecord::parse(42, bytes), Err(NtfsError::FormatCorruption(_))));
    }

    #[test]
    fn test_used_size_mismatch_detected() {
        let mut record = sample();
        let mut bytes = record.serialize(1024).unwrap();
        // Declared used size is covered by the fixup of the first stride only
        let used = LittleEndian::read_u32(&bytes[0x18..]);
        LittleEndian::write_u32(&mut bytes[0x18..], used + 8);
        assert!(matches!(FileRecord::parse(42, bytes), Err(NtfsError::FormatCorruption(_))));
    }

    #[test]
    fn test_bad_signature() {
        let mut record = sample();
        let mut bytes = record.serialize(1024).unwrap();
        bytes[0..4].copy_from_slice(b"BAAD");
        let err = FileRecord::parse(42, bytes).unwrap_err();
        assert!(err.to_string().contains("42414144"));
    }

    #[test]
    fn test_overfull_record_rejected() {
        let mut record = FileRecord::new(20, 1, MFT_RECORD_IN_USE);
        record.attributes.push(AttributeRecord::resident(ATTR_TYPE_DATA, &[], vec![0; 1000]));
        assert!(record.serialize(1024).is_err());
    }
}
