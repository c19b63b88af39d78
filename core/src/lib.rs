pub mod config;
pub mod device;
pub mod error;

pub use config::{FormatOptions, VolumeConfig};
pub use device::{BlockDevice, FileDevice, MemoryDevice};
pub use error::{NtfsError, Result};
