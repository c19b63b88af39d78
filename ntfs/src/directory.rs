// Directories: the $I30 file-name index and the links it holds

use crate::file::NtfsFile;
use crate::index::{CollationRule, Index, IndexEntry};
use crate::structures::*;
use crate::volume::Volume;
use log::debug;
use ntfsrw_core::{NtfsError, Result};

pub const DIRECTORY_INDEX_NAME: &str = "$I30";

const MAX_NAME_LENGTH: usize = 255;

pub fn directory_index_name() -> Vec<u16> {
    to_utf16(DIRECTORY_INDEX_NAME)
}

/// One name in a directory and the record it leads to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: FileNameAttribute,
    pub reference: FileReference,
}

impl DirectoryEntry {
    fn from_index(entry: &IndexEntry) -> Result<Self> {
        let name = FileNameAttribute::parse(&entry.key)?;
        let reference = entry.file_reference().ok_or_else(|| {
            NtfsError::FormatCorruption(format!("directory entry {} has no file reference", name.name_string()))
        })?;
        Ok(Self { name, reference })
    }

    pub fn is_directory(&self) -> bool {
        self.name.file_attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }
}

fn name_key(name: &str) -> Result<Vec<u8>> {
    let units = to_utf16(name);
    if units.is_empty() || units.len() > MAX_NAME_LENGTH {
        return Err(NtfsError::InvalidInput(format!(
            "file name must be 1 to {} UTF-16 units, got {}",
            MAX_NAME_LENGTH,
            units.len()
        )));
    }
    Ok(FileNameAttribute::lookup_key(name).to_bytes())
}

pub fn create_directory_index(volume: &mut Volume, directory: &mut NtfsFile) -> Result<()> {
    if !directory.is_directory() {
        return Err(NtfsError::LogicalMisuse(format!(
            "record {} is not a directory",
            directory.number()
        )));
    }
    Index::create(volume, directory, &directory_index_name(), ATTR_TYPE_FILE_NAME, CollationRule::FileName)?;
    Ok(())
}

/// Link `target` into `directory` under `name`. Names compare without case,
/// so "README" and "readme" collide.
pub fn add_entry(
    volume: &mut Volume,
    directory: &mut NtfsFile,
    name: &FileNameAttribute,
    target: FileReference,
) -> Result<()> {
    let mut index = Index::open(volume, directory, &directory_index_name())?;
    let key = name.to_bytes();
    if index.find(&key)?.is_some() {
        return Err(NtfsError::LogicalMisuse(format!("{} already exists", name.name_string())));
    }
    index.put(IndexEntry::new(key, target.0.to_le_bytes().to_vec()))?;
    Ok(())
}

pub fn remove_entry(volume: &mut Volume, directory: &mut NtfsFile, name: &str) -> Result<DirectoryEntry> {
    let key = name_key(name)?;
    let removed = Index::open(volume, directory, &directory_index_name())?.remove(&key)?;
    DirectoryEntry::from_index(&removed)
}

pub fn find_entry(volume: &mut Volume, directory: &mut NtfsFile, name: &str) -> Result<Option<DirectoryEntry>> {
    let key = name_key(name)?;
    let found = Index::open(volume, directory, &directory_index_name())?.find(&key)?;
    found.as_ref().map(DirectoryEntry::from_index).transpose()
}

/// All entries, in file-name collation order.
pub fn list(volume: &mut Volume, directory: &mut NtfsFile) -> Result<Vec<DirectoryEntry>> {
    Index::open(volume, directory, &directory_index_name())?
        .entries()?
        .iter()
        .map(DirectoryEntry::from_index)
        .collect()
}

/// Create a file (or directory) and link it into `parent`.
pub fn create_child(
    volume: &mut Volume,
    parent: &mut NtfsFile,
    name: &str,
    directory: bool,
    file_attributes: u32,
) -> Result<NtfsFile> {
    if find_entry(volume, parent, name)?.is_some() {
        return Err(NtfsError::LogicalMisuse(format!(
            "{} already exists in directory {}",
            name,
            parent.number()
        )));
    }
    volume.begin_transaction();
    let result = link_new_child(volume, parent, name, directory, file_attributes);
    volume.end_transaction();
    result
}

fn link_new_child(
    volume: &mut Volume,
    parent: &mut NtfsFile,
    name: &str,
    directory: bool,
    file_attributes: u32,
) -> Result<NtfsFile> {
    let mut child = NtfsFile::create(volume, directory, file_attributes)?;
    if directory {
        create_directory_index(volume, &mut child)?;
    }
    let attributes = if directory { file_attributes | FILE_ATTRIBUTE_DIRECTORY } else { file_attributes };
    let file_name = FileNameAttribute::new(parent.reference(), name, volume.transaction_time(), attributes);
    child.add_file_name(volume, &file_name)?;
    add_entry(volume, parent, &file_name, child.reference())?;
    debug!("Linked record {} as {} in directory {}", child.number(), name, parent.number());
    Ok(child)
}

/// Remove the link `name` from `parent`, which must lead to `child`.
pub fn unlink_child(volume: &mut Volume, parent: &mut NtfsFile, child: &mut NtfsFile, name: &str) -> Result<()> {
    let entry = find_entry(volume, parent, name)?
        .ok_or_else(|| NtfsError::NotFound(format!("{} in directory {}", name, parent.number())))?;
    if entry.reference != child.reference() {
        return Err(NtfsError::LogicalMisuse(format!(
            "{} in directory {} leads to {}, not {}",
            name,
            parent.number(),
            entry.reference,
            child.reference()
        )));
    }
    remove_entry(volume, parent, name)?;
    child.remove_file_name(volume, parent.reference(), &entry.name.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::format;
    use ntfsrw_core::{FormatOptions, MemoryDevice, VolumeConfig};

    fn volume() -> Volume {
        format(Box::new(MemoryDevice::new(16 << 20)), &FormatOptions::default(), VolumeConfig::default()).unwrap()
    }

    #[test]
    fn test_root_lists_system_files() {
        let mut volume = volume();
        let mut root = NtfsFile::open(&mut volume, MFT_RECORD_ROOT).unwrap();
        let names: Vec<String> = list(&mut volume, &mut root).unwrap().iter().map(|e| e.name.name_string()).collect();
        assert!(names.contains(&"$MFT".to_string()));
        assert!(names.contains(&"$UpCase".to_string()));
        assert!(names.contains(&".".to_string()));
    }

    #[test]
    fn test_create_find_and_unlink() {
        let mut volume = volume();
        let mut root = NtfsFile::open(&mut volume, MFT_RECORD_ROOT).unwrap();
        let mut child = create_child(&mut volume, &mut root, "Notes.txt", false, FILE_ATTRIBUTE_ARCHIVE).unwrap();
        assert_eq!(child.link_count(), 1);

        let found = find_entry(&mut volume, &mut root, "NOTES.TXT").unwrap().unwrap();
        assert_eq!(found.reference, child.reference());
        assert_eq!(found.name.name_string(), "Notes.txt");

        assert!(matches!(
            create_child(&mut volume, &mut root, "notes.txt", false, 0),
            Err(NtfsError::LogicalMisuse(_))
        ));

        unlink_child(&mut volume, &mut root, &mut child, "notes.txt").unwrap();
        assert_eq!(child.link_count(), 0);
        assert!(find_entry(&mut volume, &mut root, "Notes.txt").unwrap().is_none());
    }

    #[test]
    fn test_subdirectory_holds_many_names() {
        let mut volume = volume();
        let mut root = NtfsFile::open(&mut volume, MFT_RECORD_ROOT).unwrap();
        let mut sub = create_child(&mut volume, &mut root, "sub", true, 0).unwrap();
        assert!(find_entry(&mut volume, &mut root, "sub").unwrap().unwrap().is_directory());
        for n in (0..120).rev() {
            create_child(&mut volume, &mut sub, &format!("file-{:03}", n), false, 0).unwrap();
        }
        let names: Vec<String> = list(&mut volume, &mut sub).unwrap().iter().map(|e| e.name.name_string()).collect();
        let expected: Vec<String> = (0..120).map(|n| format!("file-{:03}", n)).collect();
        assert_eq!(names, expected);
        Index::open(&mut volume, &mut sub, &directory_index_name()).unwrap().check().unwrap();
    }

    #[test]
    fn test_bad_names_are_rejected() {
        let mut volume = volume();
        let mut root = NtfsFile::open(&mut volume, MFT_RECORD_ROOT).unwrap();
        assert!(matches!(find_entry(&mut volume, &mut root, ""), Err(NtfsError::InvalidInput(_))));
        let long = "x".repeat(256);
        assert!(matches!(find_entry(&mut volume, &mut root, &long), Err(NtfsError::InvalidInput(_))));
    }
}
