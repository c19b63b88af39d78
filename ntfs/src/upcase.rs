// $UpCase: the 64K-entry UTF-16 upper-case table used for file name collation

use byteorder::{ByteOrder, LittleEndian};
use ntfsrw_core::{NtfsError, Result};
use std::cmp::Ordering;

pub const UPCASE_ENTRIES: usize = 0x10000;
pub const UPCASE_BYTES: usize = UPCASE_ENTRIES * 2;

#[derive(Clone)]
pub struct UpCaseTable {
    table: Vec<u16>,
}

impl std::fmt::Debug for UpCaseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpCaseTable").field("entries", &self.table.len()).finish()
    }
}

impl Default for UpCaseTable {
    /// Table derived from Unicode simple upper-case mappings of the BMP.
    fn default() -> Self {
        let table = (0..UPCASE_ENTRIES as u32)
            .map(|unit| {
                let Some(c) = char::from_u32(unit) else {
                    return unit as u16;
                };
                let mut upper = c.to_uppercase();
                match (upper.next(), upper.next()) {
                    (Some(u), None) if (u as u32) < 0x10000 => u as u32 as u16,
                    _ => unit as u16,
                }
            })
            .collect();
        Self { table }
    }
}

impl UpCaseTable {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != UPCASE_BYTES {
            return Err(NtfsError::FormatCorruption(format!(
                "$UpCase holds {} bytes, expected {}",
                data.len(),
                UPCASE_BYTES
            )));
        }
        let table = data.chunks_exact(2).map(LittleEndian::read_u16).collect();
        Ok(Self { table })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; UPCASE_BYTES];
        LittleEndian::write_u16_into(&self.table, &mut out);
        out
    }

    pub fn upcase(&self, unit: u16) -> u16 {
        self.table[unit as usize]
    }

    /// Case-insensitive ordering of two UTF-16 names. Length breaks ties.
    pub fn compare(&self, a: &[u16], b: &[u16]) -> Ordering {
        for (&x, &y) in a.iter().zip(b) {
            match self.upcase(x).cmp(&self.upcase(y)) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        a.len().cmp(&b.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::to_utf16;

    #[test]
    fn test_generated_table() {
        let table = UpCaseTable::default();
        assert_eq!(table.upcase('a' as u16), 'A' as u16);
        assert_eq!(table.upcase('Z' as u16), 'Z' as u16);
        assert_eq!(table.upcase(0x00E9), 0x00C9);
        // ß upper-cases to two characters and maps to itself
        assert_eq!(table.upcase(0x00DF), 0x00DF);
        // Surrogates are not characters
        assert_eq!(table.upcase(0xD800), 0xD800);
    }

    #[test]
    fn test_compare_ignores_case() {
        let table = UpCaseTable::default();
        assert_eq!(table.compare(&to_utf16("Readme.TXT"), &to_utf16("README.txt")), Ordering::Equal);
        assert_eq!(table.compare(&to_utf16("abc"), &to_utf16("ABD")), Ordering::Less);
        assert_eq!(table.compare(&to_utf16("ab"), &to_utf16("abc")), Ordering::Less);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let table = UpCaseTable::default();
        let bytes = table.to_bytes();
        let loaded = UpCaseTable::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.upcase('q' as u16), 'Q' as u16);
        assert!(UpCaseTable::from_bytes(&bytes[..100]).is_err());
    }
}
