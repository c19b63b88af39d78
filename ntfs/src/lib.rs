// Read/write NTFS engine: data runs, fixups, cluster streams, attributes,
// the MFT, B+tree indexes and directories

// On-disk structures
pub mod boot_sector;
pub mod data_runs;
pub mod fixup;
pub mod record;
pub mod structures;
pub mod upcase;

// Attributes and their storage
pub mod attribute_list;
pub mod attributes;
pub mod buffer;
pub mod compression;
pub mod cooked_runs;
pub mod stream;

// Volume-level state
pub mod bitmap;
pub mod cache;
pub mod timestamps;
pub mod volume;

// Files, indexes, directories
pub mod directory;
pub mod file;
pub mod format;
pub mod index;

pub use attributes::{AttrKey, AttributeBody, AttributeRecord};
pub use compression::{Compressor, Lznt1};
pub use cooked_runs::{CookedRun, CookedRuns, ExtentId};
pub use data_runs::{decode_run_list, encode_run_list, DataRun, RunSpan};
pub use directory::DirectoryEntry;
pub use file::{AttributeInfo, NtfsFile};
pub use format::format;
pub use index::{CollationRule, EntryFormat, Index, IndexEntry, IndexStats, TreeOutcome};
pub use record::FileRecord;
pub use stream::StreamKind;
pub use structures::{FileNameAttribute, FileReference, StandardInformation};
pub use volume::{Geometry, Volume};

pub use ntfsrw_core::{BlockDevice, FileDevice, FormatOptions, MemoryDevice, NtfsError, Result, VolumeConfig};
