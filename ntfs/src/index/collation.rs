// Collation rules: the total orders index keys are sorted by

use crate::upcase::UpCaseTable;
use byteorder::{ByteOrder, LittleEndian};
use ntfsrw_core::{NtfsError, Result};
use std::cmp::Ordering;

// Offsets inside a $FILE_NAME key
const FILE_NAME_LENGTH_OFFSET: usize = 0x40;
const FILE_NAME_OFFSET: usize = 0x42;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollationRule {
    Binary,
    /// Case-insensitive through the upcase table, then nothing
    FileName,
    UnicodeString,
    UnsignedLong,
    Sid,
    /// Hash, then security id
    SecurityHash,
    UnsignedLongs,
}

impl CollationRule {
    pub fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            0x00 => CollationRule::Binary,
            0x01 => CollationRule::FileName,
            0x02 => CollationRule::UnicodeString,
            0x10 => CollationRule::UnsignedLong,
            0x11 => CollationRule::Sid,
            0x12 => CollationRule::SecurityHash,
            0x13 => CollationRule::UnsignedLongs,
            other => return Err(NtfsError::NotSupported(format!("collation rule {:#x}", other))),
        })
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            CollationRule::Binary => 0x00,
            CollationRule::FileName => 0x01,
            CollationRule::UnicodeString => 0x02,
            CollationRule::UnsignedLong => 0x10,
            CollationRule::Sid => 0x11,
            CollationRule::SecurityHash => 0x12,
            CollationRule::UnsignedLongs => 0x13,
        }
    }

    pub fn compare(&self, a: &[u8], b: &[u8], upcase: &UpCaseTable) -> Ordering {
        match self {
            CollationRule::Binary => a.cmp(b),
            CollationRule::FileName => upcase.compare(&file_name_units(a), &file_name_units(b)),
            CollationRule::UnicodeString => upcase.compare(&units(a), &units(b)),
            CollationRule::UnsignedLong => match (read_u32(a, 0), read_u32(b, 0)) {
                (Some(x), Some(y)) => x.cmp(&y).then(a.len().cmp(&b.len())),
                _ => a.len().cmp(&b.len()),
            },
            CollationRule::Sid => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            CollationRule::SecurityHash => {
                let hash = read_u32(a, 0).cmp(&read_u32(b, 0));
                hash.then_with(|| read_u32(a, 4).cmp(&read_u32(b, 4)))
            }
            CollationRule::UnsignedLongs => {
                let x = a.chunks_exact(4).map(LittleEndian::read_u32);
                let y = b.chunks_exact(4).map(LittleEndian::read_u32);
                x.cmp(y).then(a.len().cmp(&b.len()))
            }
        }
    }
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4).map(LittleEndian::read_u32)
}

fn units(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2).map(LittleEndian::read_u16).collect()
}

fn file_name_units(key: &[u8]) -> Vec<u16> {
    let Some(&length) = key.get(FILE_NAME_LENGTH_OFFSET) else {
        return Vec::new();
    };
    let end = (FILE_NAME_OFFSET + length as usize * 2).min(key.len());
    key.get(FILE_NAME_OFFSET..end).map(units).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::{FileNameAttribute, FileReference};

    fn name_key(name: &str) -> Vec<u8> {
        FileNameAttribute::new(FileReference::new(5, 5), name, 0, 0).to_bytes()
    }

    #[test]
    fn test_file_names_ignore_case() {
        let upcase = UpCaseTable::default();
        let rule = CollationRule::FileName;
        assert_eq!(rule.compare(&name_key("readme.TXT"), &name_key("README.txt"), &upcase), Ordering::Equal);
        assert_eq!(rule.compare(&name_key("a"), &name_key("B"), &upcase), Ordering::Less);
        assert_eq!(rule.compare(&name_key("ab"), &name_key("a"), &upcase), Ordering::Greater);
    }

    #[test]
    fn test_unsigned_long_is_numeric() {
        let upcase = UpCaseTable::default();
        let rule = CollationRule::UnsignedLong;
        assert_eq!(rule.compare(&256u32.to_le_bytes(), &255u32.to_le_bytes(), &upcase), Ordering::Greater);
        assert_eq!(rule.compare(&7u32.to_le_bytes(), &7u32.to_le_bytes(), &upcase), Ordering::Equal);
    }

    #[test]
    fn test_security_hash_breaks_ties_on_id() {
        let upcase = UpCaseTable::default();
        let key = |hash: u32, id: u32| [hash.to_le_bytes(), id.to_le_bytes()].concat();
        let rule = CollationRule::SecurityHash;
        assert_eq!(rule.compare(&key(9, 1), &key(9, 2), &upcase), Ordering::Less);
        assert_eq!(rule.compare(&key(10, 1), &key(9, 2), &upcase), Ordering::Greater);
    }

    #[test]
    fn test_unsigned_longs_elementwise() {
        let upcase = UpCaseTable::default();
        let key = |v: &[u32]| v.iter().flat_map(|x| x.to_le_bytes()).collect::<Vec<u8>>();
        let rule = CollationRule::UnsignedLongs;
        assert_eq!(rule.compare(&key(&[1, 9]), &key(&[2, 0]), &upcase), Ordering::Less);
        assert_eq!(rule.compare(&key(&[1]), &key(&[1, 0]), &upcase), Ordering::Less);
    }

    #[test]
    fn test_rule_codes_round_trip() {
        for code in [0x00, 0x01, 0x02, 0x10, 0x11, 0x12, 0x13] {
            assert_eq!(CollationRule::from_u32(code).unwrap().as_u32(), code);
        }
        assert!(CollationRule::from_u32(0x99).is_err());
    }
}
