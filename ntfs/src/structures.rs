// NTFS on-disk constants and the small fixed-layout attribute values
// ($STANDARD_INFORMATION, $FILE_NAME) that the engine reads and writes

use byteorder::{ByteOrder, LittleEndian};
use ntfsrw_core::{NtfsError, Result};

// Signatures
pub const NTFS_SIGNATURE: &[u8; 8] = b"NTFS    ";
pub const FILE_RECORD_SIGNATURE: &[u8; 4] = b"FILE";
pub const INDEX_BLOCK_SIGNATURE: &[u8; 4] = b"INDX";

// Fixup stride. Independent of the device sector size.
pub const FIXUP_STRIDE: usize = 512;

// Standard MFT record numbers
pub const MFT_RECORD_MFT: u64 = 0;
pub const MFT_RECORD_MFTMIRR: u64 = 1;
pub const MFT_RECORD_LOGFILE: u64 = 2;
pub const MFT_RECORD_VOLUME: u64 = 3;
pub const MFT_RECORD_ATTRDEF: u64 = 4;
pub const MFT_RECORD_ROOT: u64 = 5;
pub const MFT_RECORD_BITMAP: u64 = 6;
pub const MFT_RECORD_BOOT: u64 = 7;
pub const MFT_RECORD_BADCLUS: u64 = 8;
pub const MFT_RECORD_SECURE: u64 = 9;
pub const MFT_RECORD_UPCASE: u64 = 10;
pub const MFT_RECORD_EXTEND: u64 = 11;
/// Records below this number are reserved for system files.
pub const MFT_FIRST_USER_RECORD: u64 = 16;

// Attribute type codes
pub const ATTR_TYPE_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_TYPE_ATTRIBUTE_LIST: u32 = 0x20;
pub const ATTR_TYPE_FILE_NAME: u32 = 0x30;
pub const ATTR_TYPE_OBJECT_ID: u32 = 0x40;
pub const ATTR_TYPE_SECURITY_DESCRIPTOR: u32 = 0x50;
pub const ATTR_TYPE_VOLUME_NAME: u32 = 0x60;
pub const ATTR_TYPE_VOLUME_INFORMATION: u32 = 0x70;
pub const ATTR_TYPE_DATA: u32 = 0x80;
pub const ATTR_TYPE_INDEX_ROOT: u32 = 0x90;
pub const ATTR_TYPE_INDEX_ALLOCATION: u32 = 0xA0;
pub const ATTR_TYPE_BITMAP: u32 = 0xB0;
pub const ATTR_TYPE_REPARSE_POINT: u32 = 0xC0;
pub const ATTR_TYPE_EA_INFORMATION: u32 = 0xD0;
pub const ATTR_TYPE_EA: u32 = 0xE0;
pub const ATTR_TYPE_LOGGED_UTILITY_STREAM: u32 = 0x100;
pub const ATTR_TYPE_END: u32 = 0xFFFF_FFFF;

// MFT record flags
pub const MFT_RECORD_IN_USE: u16 = 0x0001;
pub const MFT_RECORD_IS_DIRECTORY: u16 = 0x0002;

// Attribute flags
pub const ATTR_FLAG_COMPRESSED: u16 = 0x0001;
pub const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;
pub const ATTR_FLAG_SPARSE: u16 = 0x8000;

// File attribute flags ($STANDARD_INFORMATION / $FILE_NAME)
pub const FILE_ATTRIBUTE_READONLY: u32 = 0x0001;
pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0002;
pub const FILE_ATTRIBUTE_SYSTEM: u32 = 0x0004;
pub const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x0020;
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x0080;
pub const FILE_ATTRIBUTE_SPARSE_FILE: u32 = 0x0200;
pub const FILE_ATTRIBUTE_COMPRESSED: u32 = 0x0800;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x1000_0000;
pub const FILE_ATTRIBUTE_VIEW_INDEX: u32 = 0x2000_0000;

// File name namespaces
pub const FILE_NAME_POSIX: u8 = 0x00;
pub const FILE_NAME_WIN32: u8 = 0x01;
pub const FILE_NAME_DOS: u8 = 0x02;
pub const FILE_NAME_WIN32_AND_DOS: u8 = 0x03;

// Compression unit shift used for every compressed attribute (16 clusters)
pub const DEFAULT_COMPRESSION_UNIT: u8 = 4;
// Compression is defined only up to this cluster size
pub const MAX_COMPRESSED_CLUSTER_SIZE: u32 = 4096;

/// Whether an attribute of this type may live outside its record.
pub fn can_be_non_resident(type_code: u32) -> bool {
    !matches!(
        type_code,
        ATTR_TYPE_STANDARD_INFORMATION
            | ATTR_TYPE_FILE_NAME
            | ATTR_TYPE_OBJECT_ID
            | ATTR_TYPE_VOLUME_NAME
            | ATTR_TYPE_VOLUME_INFORMATION
            | ATTR_TYPE_INDEX_ROOT
    )
}

/// Whether an attribute of this type may be moved out of the base record.
pub fn can_be_expelled(type_code: u32) -> bool {
    !matches!(
        type_code,
        ATTR_TYPE_STANDARD_INFORMATION | ATTR_TYPE_ATTRIBUTE_LIST | ATTR_TYPE_FILE_NAME
    )
}

pub fn attribute_type_name(type_code: u32) -> &'static str {
    match type_code {
        ATTR_TYPE_STANDARD_INFORMATION => "$STANDARD_INFORMATION",
        ATTR_TYPE_ATTRIBUTE_LIST => "$ATTRIBUTE_LIST",
        ATTR_TYPE_FILE_NAME => "$FILE_NAME",
        ATTR_TYPE_OBJECT_ID => "$OBJECT_ID",
        ATTR_TYPE_SECURITY_DESCRIPTOR => "$SECURITY_DESCRIPTOR",
        ATTR_TYPE_VOLUME_NAME => "$VOLUME_NAME",
        ATTR_TYPE_VOLUME_INFORMATION => "$VOLUME_INFORMATION",
        ATTR_TYPE_DATA => "$DATA",
        ATTR_TYPE_INDEX_ROOT => "$INDEX_ROOT",
        ATTR_TYPE_INDEX_ALLOCATION => "$INDEX_ALLOCATION",
        ATTR_TYPE_BITMAP => "$BITMAP",
        ATTR_TYPE_REPARSE_POINT => "$REPARSE_POINT",
        ATTR_TYPE_EA_INFORMATION => "$EA_INFORMATION",
        ATTR_TYPE_EA => "$EA",
        ATTR_TYPE_LOGGED_UTILITY_STREAM => "$LOGGED_UTILITY_STREAM",
        _ => "$UNKNOWN",
    }
}

pub fn align8(n: usize) -> usize {
    (n + 7) & !7
}

pub fn to_utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

pub fn from_utf16(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

pub fn read_utf16(bytes: &[u8], chars: usize) -> Result<Vec<u16>> {
    if bytes.len() < chars * 2 {
        return Err(NtfsError::FormatCorruption(format!(
            "name of {} characters runs past its buffer",
            chars
        )));
    }
    Ok((0..chars).map(|i| LittleEndian::read_u16(&bytes[i * 2..])).collect())
}

pub fn write_utf16(out: &mut Vec<u8>, units: &[u16]) {
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
}

/// A 48-bit record number plus 16-bit sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FileReference(pub u64);

impl FileReference {
    pub fn new(record: u64, sequence: u16) -> Self {
        FileReference((record & 0x0000_FFFF_FFFF_FFFF) | ((sequence as u64) << 48))
    }

    pub fn record(&self) -> u64 {
        self.0 & 0x0000_FFFF_FFFF_FFFF
    }

    pub fn sequence(&self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for FileReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.record(), self.sequence())
    }
}

pub const STANDARD_INFORMATION_SIZE: usize = 72;

/// `$STANDARD_INFORMATION` (NTFS 3.x layout).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StandardInformation {
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
    pub file_attributes: u32,
    pub owner_id: u32,
    pub security_id: u32,
    pub usn: u64,
}

impl StandardInformation {
    pub fn new(now: u64, file_attributes: u32) -> Self {
        Self {
            creation_time: now,
            modification_time: now,
            mft_modification_time: now,
            access_time: now,
            file_attributes,
            ..Default::default()
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        // NTFS 1.2 records carry only the first 48 bytes
        if data.len() < 48 {
            return Err(NtfsError::FormatCorruption(format!(
                "$STANDARD_INFORMATION of {} bytes",
                data.len()
            )));
        }
        let extended = data.len() >= STANDARD_INFORMATION_SIZE;
        Ok(Self {
            creation_time: LittleEndian::read_u64(&data[0x00..]),
            modification_time: LittleEndian::read_u64(&data[0x08..]),
            mft_modification_time: LittleEndian::read_u64(&data[0x10..]),
            access_time: LittleEndian::read_u64(&data[0x18..]),
            file_attributes: LittleEndian::read_u32(&data[0x20..]),
            owner_id: if extended { LittleEndian::read_u32(&data[0x30..]) } else { 0 },
            security_id: if extended { LittleEndian::read_u32(&data[0x34..]) } else { 0 },
            usn: if extended { LittleEndian::read_u64(&data[0x40..]) } else { 0 },
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; STANDARD_INFORMATION_SIZE];
        LittleEndian::write_u64(&mut data[0x00..], self.creation_time);
        LittleEndian::write_u64(&mut data[0x08..], self.modification_time);
        LittleEndian::write_u64(&mut data[0x10..], self.mft_modification_time);
        LittleEndian::write_u64(&mut data[0x18..], self.access_time);
        LittleEndian::write_u32(&mut data[0x20..], self.file_attributes);
        LittleEndian::write_u32(&mut data[0x30..], self.owner_id);
        LittleEndian::write_u32(&mut data[0x34..], self.security_id);
        LittleEndian::write_u64(&mut data[0x40..], self.usn);
        data
    }
}

/// `$FILE_NAME`, also the key of every `$I30` index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameAttribute {
    pub parent: FileReference,
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
    pub allocated_size: u64,
    pub data_size: u64,
    pub file_attributes: u32,
    pub reparse_tag: u32,
    pub namespace: u8,
    pub name: Vec<u16>,
}

impl FileNameAttribute {
    pub fn new(parent: FileReference, name: &str, now: u64, file_attributes: u32) -> Self {
        Self {
            parent,
            creation_time: now,
            modification_time: now,
            mft_modification_time: now,
            access_time: now,
            allocated_size: 0,
            data_size: 0,
            file_attributes,
            reparse_tag: 0,
            namespace: FILE_NAME_WIN32_AND_DOS,
            name: to_utf16(name),
        }
    }

    /// A key carrying only a name, for lookups.
    pub fn lookup_key(name: &str) -> Self {
        Self::new(FileReference::default(), name, 0, 0)
    }

    pub fn name_string(&self) -> String {
        from_utf16(&self.name)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 0x42 {
            return Err(NtfsError::FormatCorruption(format!("$FILE_NAME of {} bytes", data.len())));
        }
        let name_len = data[0x40] as usize;
        let name = read_utf16(&data[0x42..], name_len)?;
        Ok(Self {
            parent: FileReference(LittleEndian::read_u64(&data[0x00..])),
            creation_time: LittleEndian::read_u64(&data[0x08..]),
            modification_time: LittleEndian::read_u64(&data[0x10..]),
            mft_modification_time: LittleEndian::read_u64(&data[0x18..]),
            access_time: LittleEndian::read_u64(&data[0x20..]),
            allocated_size: LittleEndian::read_u64(&data[0x28..]),
            data_size: LittleEndian::read_u64(&data[0x30..]),
            file_attributes: LittleEndian::read_u32(&data[0x38..]),
            reparse_tag: LittleEndian::read_u32(&data[0x3C..]),
            namespace: data[0x41],
            name,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 0x42];
        LittleEndian::write_u64(&mut data[0x00..], self.parent.0);
        LittleEndian::write_u64(&mut data[0x08..], self.creation_time);
        LittleEndian::write_u64(&mut data[0x10..], self.modification_time);
        LittleEndian::write_u64(&mut data[0x18..], self.mft_modification_time);
        LittleEndian::write_u64(&mut data[0x20..], self.access_time);
        LittleEndian::write_u64(&mut data[0x28..], self.allocated_size);
        LittleEndian::write_u64(&mut data[0x30..], self.data_size);
        LittleEndian::write_u32(&mut data[0x38..], self.file_attributes);
        LittleEndian::write_u32(&mut data[0x3C..], self.reparse_tag);
        data[0x40] = self.name.len() as u8;
        data[0x41] = self.namespace;
        write_utf16(&mut data, &self.name);
        data
    }
}
