// NTFS attribute records: the common header plus either an inline value
// (resident) or a run list with size fields (non-resident)

use crate::data_runs::{decode_run_list, encode_run_list, runs_to_spans, spans_encoded_len, spans_to_runs, RunSpan};
use crate::structures::*;
use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use ntfsrw_core::{NtfsError, Result};

pub const RESIDENT_HEADER_SIZE: usize = 0x18;
pub const NON_RESIDENT_HEADER_SIZE: usize = 0x40;
pub const COMPRESSED_HEADER_SIZE: usize = 0x48;

/// Identifies a logical attribute within a file: type plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttrKey {
    pub type_code: u32,
    pub name: Vec<u16>,
}

impl AttrKey {
    pub fn new(type_code: u32, name: &str) -> Self {
        Self { type_code, name: to_utf16(name) }
    }

    pub fn unnamed(type_code: u32) -> Self {
        Self { type_code, name: Vec::new() }
    }
}

impl std::fmt::Display for AttrKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", attribute_type_name(self.type_code))
        } else {
            write!(f, "{}:{}", attribute_type_name(self.type_code), from_utf16(&self.name))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentBody {
    pub data: Vec<u8>,
    pub indexed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonResidentBody {
    pub start_vcn: u64,
    /// log2 of clusters per compression unit; 0 when uncompressed.
    pub compression_unit: u8,
    pub allocated_size: u64,
    pub data_size: u64,
    pub initialized_size: u64,
    /// Clusters actually stored, in bytes. Written for sparse and compressed attributes.
    pub compressed_size: u64,
    pub runs: Vec<RunSpan>,
}

impl NonResidentBody {
    pub fn empty(compression_unit: u8) -> Self {
        Self {
            start_vcn: 0,
            compression_unit,
            allocated_size: 0,
            data_size: 0,
            initialized_size: 0,
            compressed_size: 0,
            runs: Vec::new(),
        }
    }

    pub fn cluster_count(&self) -> u64 {
        self.runs.iter().map(|r| r.length).sum()
    }

    /// Highest VCN mapped by this extent; `u64::MAX` (-1) when empty.
    pub fn last_vcn(&self) -> u64 {
        (self.start_vcn + self.cluster_count()).wrapping_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeBody {
    Resident(ResidentBody),
    NonResident(NonResidentBody),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRecord {
    pub type_code: u32,
    pub name: Vec<u16>,
    pub flags: u16,
    pub id: u16,
    pub body: AttributeBody,
}

impl AttributeRecord {
    pub fn resident(type_code: u32, name: &[u16], data: Vec<u8>) -> Self {
        Self {
            type_code,
            name: name.to_vec(),
            flags: 0,
            id: 0,
            body: AttributeBody::Resident(ResidentBody {
                data,
                indexed: type_code == ATTR_TYPE_FILE_NAME,
            }),
        }
    }

    pub fn non_resident(type_code: u32, name: &[u16], flags: u16) -> Self {
        let cu = if flags & ATTR_FLAG_COMPRESSED != 0 { DEFAULT_COMPRESSION_UNIT } else { 0 };
        Self {
            type_code,
            name: name.to_vec(),
            flags,
            id: 0,
            body: AttributeBody::NonResident(NonResidentBody::empty(cu)),
        }
    }

    pub fn key(&self) -> AttrKey {
        AttrKey { type_code: self.type_code, name: self.name.clone() }
    }

    pub fn matches(&self, key: &AttrKey) -> bool {
        self.type_code == key.type_code && self.name == key.name
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.body, AttributeBody::Resident(_))
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & ATTR_FLAG_COMPRESSED != 0
    }

    pub fn is_sparse(&self) -> bool {
        self.flags & ATTR_FLAG_SPARSE != 0
    }

    pub fn resident_data(&self) -> Option<&[u8]> {
        match &self.body {
            AttributeBody::Resident(r) => Some(&r.data),
            AttributeBody::NonResident(_) => None,
        }
    }

    pub fn non_resident_body(&self) -> Option<&NonResidentBody> {
        match &self.body {
            AttributeBody::NonResident(nr) => Some(nr),
            AttributeBody::Resident(_) => None,
        }
    }

    pub fn non_resident_body_mut(&mut self) -> Option<&mut NonResidentBody> {
        match &mut self.body {
            AttributeBody::NonResident(nr) => Some(nr),
            AttributeBody::Resident(_) => None,
        }
    }

    /// First VCN of this extent (0 for resident attributes).
    pub fn lowest_vcn(&self) -> u64 {
        self.non_resident_body().map(|nr| nr.start_vcn).unwrap_or(0)
    }

    fn non_resident_header_size(&self) -> usize {
        if self.flags & (ATTR_FLAG_COMPRESSED | ATTR_FLAG_SPARSE) != 0 {
            COMPRESSED_HEADER_SIZE
        } else {
            NON_RESIDENT_HEADER_SIZE
        }
    }

    /// Size of the serialized record, always a multiple of 8.
    pub fn encoded_len(&self) -> usize {
        match &self.body {
            AttributeBody::Resident(r) => {
                align8(align8(RESIDENT_HEADER_SIZE + self.name.len() * 2) + r.data.len())
            }
            AttributeBody::NonResident(nr) => {
                align8(align8(self.non_resident_header_size() + self.name.len() * 2) + spans_encoded_len(&nr.runs))
            }
        }
    }

    /// Size this attribute would take as a non-resident record mapping `clusters`
    /// clusters in one run.
    pub fn non_resident_len_estimate(&self, clusters: u64) -> usize {
        let header = if self.flags & (ATTR_FLAG_COMPRESSED | ATTR_FLAG_SPARSE) != 0 {
            COMPRESSED_HEADER_SIZE
        } else {
            NON_RESIDENT_HEADER_SIZE
        };
        let runs = if clusters == 0 {
            1
        } else {
            spans_encoded_len(&[RunSpan::new(Some(u32::MAX as u64), clusters)])
        };
        align8(align8(header + self.name.len() * 2) + runs)
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let length = self.encoded_len();
        out.resize(start + length, 0);
        let buf = &mut out[start..];

        LittleEndian::write_u32(&mut buf[0x00..], self.type_code);
        LittleEndian::write_u32(&mut buf[0x04..], length as u32);
        buf[0x09] = self.name.len() as u8;
        LittleEndian::write_u16(&mut buf[0x0C..], self.flags);
        LittleEndian::write_u16(&mut buf[0x0E..], self.id);

        match &self.body {
            AttributeBody::Resident(r) => {
                let name_off = RESIDENT_HEADER_SIZE;
                let value_off = align8(name_off + self.name.len() * 2);
                buf[0x08] = 0;
                LittleEndian::write_u16(&mut buf[0x0A..], name_off as u16);
                LittleEndian::write_u32(&mut buf[0x10..], r.data.len() as u32);
                LittleEndian::write_u16(&mut buf[0x14..], value_off as u16);
                buf[0x16] = r.indexed as u8;
                write_name(buf, name_off, &self.name);
                buf[value_off..value_off + r.data.len()].copy_from_slice(&r.data);
            }
            AttributeBody::NonResident(nr) => {
                let name_off = self.non_resident_header_size();
                let runs_off = align8(name_off + self.name.len() * 2);
                buf[0x08] = 1;
                LittleEndian::write_u16(&mut buf[0x0A..], name_off as u16);
                LittleEndian::write_u64(&mut buf[0x10..], nr.start_vcn);
                LittleEndian::write_u64(&mut buf[0x18..], nr.last_vcn());
                LittleEndian::write_u16(&mut buf[0x20..], runs_off as u16);
                buf[0x22] = nr.compression_unit;
                LittleEndian::write_u64(&mut buf[0x28..], nr.allocated_size);
                LittleEndian::write_u64(&mut buf[0x30..], nr.data_size);
                LittleEndian::write_u64(&mut buf[0x38..], nr.initialized_size);
                if name_off == COMPRESSED_HEADER_SIZE {
                    LittleEndian::write_u64(&mut buf[0x40..], nr.compressed_size);
                }
                write_name(buf, name_off, &self.name);
                let runs = encode_run_list(&spans_to_runs(&nr.runs));
                buf[runs_off..runs_off + runs.len()].copy_from_slice(&runs);
            }
        }
    }

    /// Parse one attribute at the start of `data`. Returns the record and its
    /// declared length.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 0x10 {
            return Err(NtfsError::FormatCorruption("attribute header beyond record".to_string()));
        }
        let type_code = LittleEndian::read_u32(&data[0x00..]);
        let length = LittleEndian::read_u32(&data[0x04..]) as usize;
        if length < RESIDENT_HEADER_SIZE || length > data.len() || length % 8 != 0 {
            return Err(NtfsError::FormatCorruption(format!(
                "attribute 0x{:X} declares length {} with {} bytes left",
                type_code,
                length,
                data.len()
            )));
        }
        let data = &data[..length];
        let non_resident = data[0x08] != 0;
        let name_len = data[0x09] as usize;
        let name_off = LittleEndian::read_u16(&data[0x0A..]) as usize;
        let flags = LittleEndian::read_u16(&data[0x0C..]);
        let id = LittleEndian::read_u16(&data[0x0E..]);
        if name_off + name_len * 2 > length {
            return Err(NtfsError::FormatCorruption(format!(
                "attribute 0x{:X} name runs past its record",
                type_code
            )));
        }
        let name = read_utf16(&data[name_off..], name_len)?;

        let body = if !non_resident {
            let value_len = LittleEndian::read_u32(&data[0x10..]) as usize;
            let value_off = LittleEndian::read_u16(&data[0x14..]) as usize;
            if value_off + value_len > length {
                return Err(NtfsError::FormatCorruption(format!(
                    "resident value of attribute 0x{:X} ({} bytes at {}) exceeds its length {}",
                    type_code, value_len, value_off, length
                )));
            }
            AttributeBody::Resident(ResidentBody {
                data: data[value_off..value_off + value_len].to_vec(),
                indexed: data[0x16] != 0,
            })
        } else {
            if length < NON_RESIDENT_HEADER_SIZE {
                return Err(NtfsError::FormatCorruption(format!(
                    "non-resident attribute 0x{:X} shorter than its header",
                    type_code
                )));
            }
            let start_vcn = LittleEndian::read_u64(&data[0x10..]);
            let last_vcn = LittleEndian::read_u64(&data[0x18..]);
            let runs_off = LittleEndian::read_u16(&data[0x20..]) as usize;
            if runs_off >= length {
                return Err(NtfsError::FormatCorruption(format!(
                    "run list offset {} outside attribute 0x{:X}",
                    runs_off, type_code
                )));
            }
            let has_compressed_size =
                flags & (ATTR_FLAG_COMPRESSED | ATTR_FLAG_SPARSE) != 0 && runs_off >= COMPRESSED_HEADER_SIZE;
            let (runs, _) = decode_run_list(&data[runs_off..])?;
            let spans = runs_to_spans(&runs)?;
            let body = NonResidentBody {
                start_vcn,
                compression_unit: data[0x22],
                allocated_size: LittleEndian::read_u64(&data[0x28..]),
                data_size: LittleEndian::read_u64(&data[0x30..]),
                initialized_size: LittleEndian::read_u64(&data[0x38..]),
                compressed_size: if has_compressed_size { LittleEndian::read_u64(&data[0x40..]) } else { 0 },
                runs: spans,
            };
            if body.last_vcn() != last_vcn {
                return Err(NtfsError::FormatCorruption(format!(
                    "attribute 0x{:X} runs end at VCN {} but header says {}",
                    type_code,
                    body.last_vcn() as i64,
                    last_vcn as i64
                )));
            }
            AttributeBody::NonResident(body)
        };

        trace!("Parsed attribute 0x{:X} ({} bytes, resident={})", type_code, length, !non_resident);
        Ok((Self { type_code, name, flags, id, body }, length))
    }
}

fn write_name(buf: &mut [u8], offset: usize, name: &[u16]) {
    for (i, unit) in name.iter().enumerate() {
        LittleEndian::write_u16(&mut buf[offset + i * 2..], *unit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resident_layout() {
        let mut attr = AttributeRecord::resident(ATTR_TYPE_DATA, &to_utf16("ads"), b"hello".to_vec());
        attr.id = 3;
        let mut out = Vec::new();
        attr.serialize(&mut out);
        assert_eq!(out.len(), attr.encoded_len());
        assert_eq!(out.len(), 40);
        assert_eq!(LittleEndian::read_u32(&out[0x04..]), 40);
        assert_eq!(LittleEndian::read_u16(&out[0x14..]), 32);
        assert_eq!(&out[32..37], b"hello");

        let (parsed, len) = AttributeRecord::parse(&out).unwrap();
        assert_eq!(len, 40);
        assert_eq!(parsed, attr);
        assert_eq!(parsed.key().to_string(), "$DATA:ads");
    }

    #[test]
    fn test_non_resident_layout() {
        let mut attr = AttributeRecord::non_resident(ATTR_TYPE_DATA, &[], 0);
        let nr = attr.non_resident_body_mut().unwrap();
        nr.runs = vec![RunSpan::new(Some(0x1000), 16), RunSpan::new(None, 16)];
        nr.allocated_size = 32 * 4096;
        nr.data_size = 100_000;
        nr.initialized_size = 70_000;
        let mut out = Vec::new();
        attr.serialize(&mut out);
        assert_eq!(out.len(), attr.encoded_len());
        assert_eq!(LittleEndian::read_u64(&out[0x18..]), 31);
        assert_eq!(LittleEndian::read_u16(&out[0x20..]), 0x40);

        let (parsed, _) = AttributeRecord::parse(&out).unwrap();
        assert_eq!(parsed, attr);
    }

    #[test]
    fn test_empty_and_compressed_header() {
        let attr = AttributeRecord::non_resident(ATTR_TYPE_DATA, &[], ATTR_FLAG_COMPRESSED);
        assert_eq!(attr.non_resident_body().unwrap().compression_unit, 4);
        assert_eq!(attr.non_resident_body().unwrap().last_vcn(), u64::MAX);
        let mut out = Vec::new();
        attr.serialize(&mut out);
        assert_eq!(LittleEndian::read_u16(&out[0x20..]), 0x48);
        let (parsed, _) = AttributeRecord::parse(&out).unwrap();
        assert_eq!(parsed, attr);
    }

    #[test]
    fn test_declared_last_vcn_mismatch() {
        let mut attr = AttributeRecord::non_resident(ATTR_TYPE_DATA, &[], 0);
        attr.non_resident_body_mut().unwrap().runs = vec![RunSpan::new(Some(10), 4)];
        let mut out = Vec::new();
        attr.serialize(&mut out);
        LittleEndian::write_u64(&mut out[0x18..], 9);
        assert!(matches!(AttributeRecord::parse(&out), Err(NtfsError::FormatCorruption(_))));
    }

    #[test]
    fn test_length_checks() {
        let attr = AttributeRecord::resident(ATTR_TYPE_DATA, &[], vec![1; 20]);
        let mut out = Vec::new();
        attr.serialize(&mut out);
        assert!(AttributeRecord::parse(&out[..out.len() - 8]).is_err());
        // Value longer than the record
        LittleEndian::write_u32(&mut out[0x10..], 200);
        assert!(AttributeRecord::parse(&out).is_err());
    }

    #[test]
    fn test_conversion_estimate() {
        let attr = AttributeRecord::resident(ATTR_TYPE_DATA, &[], vec![0; 300]);
        assert!(attr.non_resident_len_estimate(1) < attr.encoded_len());
        let small = AttributeRecord::resident(ATTR_TYPE_DATA, &[], vec![0; 8]);
        assert!(small.non_resident_len_estimate(1) > small.encoded_len());
    }
}
