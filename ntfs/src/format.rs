// Fresh NTFS images
//
// Two passes. The first writes what the volume needs before it can open:
// boot sector and backup, the $MFT / $MFTMirr / $Bitmap / $Boot records and
// the cluster bitmap. The second opens the volume and builds every other
// system file through the regular engine, then links all of them into the
// root directory.

use crate::attributes::{AttrKey, AttributeRecord};
use crate::bitmap::Bitmap;
use crate::boot_sector::{encode_size, BootSector};
use crate::data_runs::RunSpan;
use crate::directory::{self, add_entry, create_directory_index};
use crate::file::NtfsFile;
use crate::index::{CollationRule, Index};
use crate::record::FileRecord;
use crate::structures::*;
use crate::timestamps::current_filetime;
use crate::upcase::UpCaseTable;
use crate::volume::{Volume, MFT_MIRROR_RECORDS};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use ntfsrw_core::{BlockDevice, FormatOptions, NtfsError, Result, VolumeConfig};

const BOOT_REGION_BYTES: u64 = 8192;
const SYSTEM_FILE_ATTRIBUTES: u32 = FILE_ATTRIBUTE_HIDDEN | FILE_ATTRIBUTE_SYSTEM;
// Room the second pass needs beyond the fixed layout ($UpCase, indexes)
const MIN_FREE_CLUSTERS_BYTES: u64 = 512 * 1024;
const NTFS_MAJOR_VERSION: u8 = 3;
const NTFS_MINOR_VERSION: u8 = 1;

/// Where the first pass puts things, in clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Layout {
    sector_size: u64,
    cluster_size: u64,
    record_size: u64,
    total_sectors: u64,
    total_clusters: u64,
    boot_clusters: u64,
    mft_lcn: u64,
    mft_clusters: u64,
    mft_records: u64,
    bitmap_lcn: u64,
    bitmap_clusters: u64,
    bitmap_bytes: u64,
    mirror_lcn: u64,
    mirror_clusters: u64,
}

fn clusters_for(bytes: u64, cluster_size: u64) -> u64 {
    (bytes + cluster_size - 1) / cluster_size
}

impl Layout {
    fn plan(options: &FormatOptions, device_size: u64) -> Result<Self> {
        let sector_size = options.sector_size as u64;
        let cluster_size = options.cluster_size as u64;
        let record_size = options.record_size as u64;
        if device_size % sector_size != 0 {
            return Err(NtfsError::InvalidInput(format!(
                "device of {} bytes is not a whole number of {}-byte sectors",
                device_size, sector_size
            )));
        }
        // The last sector holds the backup boot sector
        let total_sectors = (device_size / sector_size).saturating_sub(1);
        let total_clusters = total_sectors * sector_size / cluster_size;

        let boot_clusters = clusters_for(BOOT_REGION_BYTES, cluster_size);
        let mft_lcn = boot_clusters;
        let mft_clusters = clusters_for(options.initial_mft_records as u64 * record_size, cluster_size);
        let mft_records = mft_clusters * cluster_size / record_size;
        let bitmap_lcn = mft_lcn + mft_clusters;
        let bitmap_bytes = align8(((total_clusters + 7) / 8) as usize) as u64;
        let bitmap_clusters = clusters_for(bitmap_bytes, cluster_size);
        let mirror_clusters = clusters_for(MFT_MIRROR_RECORDS * record_size, cluster_size);
        let mirror_lcn = (total_clusters / 2).max(bitmap_lcn + bitmap_clusters);

        let layout = Self {
            sector_size,
            cluster_size,
            record_size,
            total_sectors,
            total_clusters,
            boot_clusters,
            mft_lcn,
            mft_clusters,
            mft_records,
            bitmap_lcn,
            bitmap_clusters,
            bitmap_bytes,
            mirror_lcn,
            mirror_clusters,
        };
        let reserved = boot_clusters + mft_clusters + bitmap_clusters + mirror_clusters;
        let needed = reserved + clusters_for(MIN_FREE_CLUSTERS_BYTES, cluster_size);
        if mirror_lcn + mirror_clusters > total_clusters || needed > total_clusters {
            return Err(NtfsError::CapacityExhausted(format!(
                "device of {} bytes is too small for an NTFS volume with {}-byte clusters",
                device_size, cluster_size
            )));
        }
        Ok(layout)
    }

    fn boot_sector(&self, options: &FormatOptions) -> BootSector {
        let cluster_size = self.cluster_size as u32;
        BootSector {
            bytes_per_sector: self.sector_size as u16,
            sectors_per_cluster: (self.cluster_size / self.sector_size) as u8,
            total_sectors: self.total_sectors,
            mft_lcn: self.mft_lcn,
            mftmirr_lcn: self.mirror_lcn,
            clusters_per_mft_record: encode_size(options.record_size, cluster_size),
            clusters_per_index_buffer: encode_size(options.index_block_size, cluster_size),
            volume_serial: options.serial.unwrap_or_else(rand::random),
        }
    }

    fn record_offset(&self, number: u64) -> u64 {
        self.mft_lcn * self.cluster_size + number * self.record_size
    }

    fn mirror_offset(&self, number: u64) -> u64 {
        self.mirror_lcn * self.cluster_size + number * self.record_size
    }
}

/// Lay a new, empty NTFS volume over `device` and open it.
pub fn format(mut device: Box<dyn BlockDevice>, options: &FormatOptions, config: VolumeConfig) -> Result<Volume> {
    options.validate()?;
    config.validate()?;
    if config.read_only {
        return Err(NtfsError::Configuration("cannot format with a read-only configuration".to_string()));
    }
    let layout = Layout::plan(options, device.size())?;
    info!(
        "Formatting {} bytes: {} clusters of {} bytes, MFT at LCN {} ({} records), mirror at LCN {}",
        device.size(),
        layout.total_clusters,
        layout.cluster_size,
        layout.mft_lcn,
        layout.mft_records,
        layout.mirror_lcn
    );

    write_bootstrap(device.as_mut(), &layout, options)?;
    let mut volume = Volume::open(device, config)?;
    build_system_files(&mut volume, options)?;
    volume.sync()?;
    info!("Format complete: {} of {} clusters free", volume.free_clusters(), volume.total_clusters());
    Ok(volume)
}

// First pass

fn system_name(name: &str, now: u64, data_size: u64, allocated: u64) -> FileNameAttribute {
    let root = FileReference::new(MFT_RECORD_ROOT, MFT_RECORD_ROOT as u16);
    let mut file_name = FileNameAttribute::new(root, name, now, SYSTEM_FILE_ATTRIBUTES);
    file_name.data_size = data_size;
    file_name.allocated_size = allocated;
    file_name
}

fn mapped_data(lcn: u64, clusters: u64, data_size: u64, cluster_size: u64) -> AttributeRecord {
    let mut attr = AttributeRecord::non_resident(ATTR_TYPE_DATA, &[], 0);
    if let Some(body) = attr.non_resident_body_mut() {
        body.runs = vec![RunSpan::new(Some(lcn), clusters)];
        body.allocated_size = clusters * cluster_size;
        body.data_size = data_size;
        body.initialized_size = data_size;
    }
    attr
}

/// A system record built by hand, with a name in the root directory and
/// `extra` attributes after it.
fn bootstrap_record(number: u64, name: &str, now: u64, data: AttributeRecord, extra: Vec<AttributeRecord>) -> FileRecord {
    let mut record = FileRecord::new(number, (number as u16).max(1), MFT_RECORD_IN_USE);
    record.header.link_count = 1;
    let (size, allocated) = data
        .non_resident_body()
        .map(|nr| (nr.data_size, nr.allocated_size))
        .unwrap_or_default();
    let si = StandardInformation::new(now, SYSTEM_FILE_ATTRIBUTES);
    let mut attributes = vec![
        AttributeRecord::resident(ATTR_TYPE_STANDARD_INFORMATION, &[], si.to_bytes()),
        AttributeRecord::resident(ATTR_TYPE_FILE_NAME, &[], system_name(name, now, size, allocated).to_bytes()),
        data,
    ];
    attributes.extend(extra);
    for mut attr in attributes {
        attr.id = record.header.take_attribute_id();
        record.attributes.push(attr);
    }
    record
}

fn write_record(device: &mut dyn BlockDevice, layout: &Layout, record: &mut FileRecord) -> Result<()> {
    let bytes = record.serialize(layout.record_size as usize)?;
    device.write_at(layout.record_offset(record.number), &bytes)?;
    if record.number < MFT_MIRROR_RECORDS {
        device.write_at(layout.mirror_offset(record.number), &bytes)?;
    }
    Ok(())
}

fn zero_clusters(device: &mut dyn BlockDevice, layout: &Layout, lcn: u64, count: u64) -> Result<()> {
    let zeros = vec![0u8; layout.cluster_size as usize];
    for cluster in lcn..lcn + count {
        device.write_at(cluster * layout.cluster_size, &zeros)?;
    }
    Ok(())
}

fn write_bootstrap(device: &mut dyn BlockDevice, layout: &Layout, options: &FormatOptions) -> Result<()> {
    let now = current_filetime();
    let cs = layout.cluster_size;
    zero_clusters(device, layout, 0, layout.boot_clusters)?;
    zero_clusters(device, layout, layout.mft_lcn, layout.mft_clusters)?;
    zero_clusters(device, layout, layout.bitmap_lcn, layout.bitmap_clusters)?;
    zero_clusters(device, layout, layout.mirror_lcn, layout.mirror_clusters)?;

    let boot = layout.boot_sector(options).to_bytes();
    device.write_at(0, &boot)?;
    device.write_at(layout.total_sectors * layout.sector_size, &boot)?;

    // Cluster bitmap; bits past the last cluster stay set
    let mut clusters = Bitmap::new(layout.bitmap_bytes * 8);
    clusters.set_range(0..layout.boot_clusters);
    clusters.set_range(layout.mft_lcn..layout.mft_lcn + layout.mft_clusters);
    clusters.set_range(layout.bitmap_lcn..layout.bitmap_lcn + layout.bitmap_clusters);
    clusters.set_range(layout.mirror_lcn..layout.mirror_lcn + layout.mirror_clusters);
    clusters.set_range(layout.total_clusters..layout.bitmap_bytes * 8);
    device.write_at(layout.bitmap_lcn * cs, clusters.as_bytes())?;

    let mut records = Bitmap::new(align8(((layout.mft_records + 7) / 8) as usize) as u64 * 8);
    for number in [MFT_RECORD_MFT, MFT_RECORD_MFTMIRR, MFT_RECORD_BITMAP, MFT_RECORD_BOOT] {
        records.set(number);
    }

    let mft_data = mapped_data(layout.mft_lcn, layout.mft_clusters, layout.mft_records * layout.record_size, cs);
    let mft_bitmap = AttributeRecord::resident(ATTR_TYPE_BITMAP, &[], records.as_bytes().to_vec());
    let mirror_data = mapped_data(layout.mirror_lcn, layout.mirror_clusters, MFT_MIRROR_RECORDS * layout.record_size, cs);
    let bitmap_data = mapped_data(layout.bitmap_lcn, layout.bitmap_clusters, layout.bitmap_bytes, cs);
    let boot_data = mapped_data(0, layout.boot_clusters, layout.boot_clusters * cs, cs);

    let mut built = vec![
        bootstrap_record(MFT_RECORD_MFT, "$MFT", now, mft_data, vec![mft_bitmap]),
        bootstrap_record(MFT_RECORD_MFTMIRR, "$MFTMirr", now, mirror_data, Vec::new()),
        bootstrap_record(MFT_RECORD_BITMAP, "$Bitmap", now, bitmap_data, Vec::new()),
        bootstrap_record(MFT_RECORD_BOOT, "$Boot", now, boot_data, Vec::new()),
    ];
    for record in built.iter_mut() {
        write_record(device, layout, record)?;
    }
    // The remaining system slots start out free but carry the sequence
    // number the record will have once the second pass claims it
    for number in (MFT_RECORD_LOGFILE..MFT_FIRST_USER_RECORD).filter(|n| !records.get(*n)) {
        let mut record = FileRecord::new(number, (number as u16).max(1), 0);
        write_record(device, layout, &mut record)?;
    }
    device.flush()?;
    debug!("Bootstrap records written at LCN {} and mirrored at LCN {}", layout.mft_lcn, layout.mirror_lcn);
    Ok(())
}

// Second pass

/// Link `file` into `parent` under `name`, sizes taken from its unnamed $DATA.
fn link(volume: &mut Volume, parent: &mut NtfsFile, file: &mut NtfsFile, name: &str, attributes: u32) -> Result<()> {
    let data = AttrKey::unnamed(ATTR_TYPE_DATA);
    let size = if file.has_attribute(&data) { file.attribute_length(&data)? } else { 0 };
    let allocated = (size + volume.cluster_size() - 1) / volume.cluster_size() * volume.cluster_size();
    let mut file_name = FileNameAttribute::new(parent.reference(), name, volume.transaction_time(), attributes);
    file_name.data_size = size;
    file_name.allocated_size = allocated;
    file.add_file_name(volume, &file_name)?;
    add_entry(volume, parent, &file_name, file.reference())
}

fn volume_information() -> Vec<u8> {
    let mut data = vec![0u8; 12];
    data[8] = NTFS_MAJOR_VERSION;
    data[9] = NTFS_MINOR_VERSION;
    LittleEndian::write_u16(&mut data[10..], 0);
    data
}

fn build_system_files(volume: &mut Volume, options: &FormatOptions) -> Result<()> {
    volume.begin_transaction();
    let result = build_system_files_inner(volume, options);
    volume.end_transaction();
    result
}

fn build_system_files_inner(volume: &mut Volume, options: &FormatOptions) -> Result<()> {
    let directory_attributes = SYSTEM_FILE_ATTRIBUTES | FILE_ATTRIBUTE_DIRECTORY;

    let mut root = NtfsFile::create_at(volume, MFT_RECORD_ROOT, true, SYSTEM_FILE_ATTRIBUTES)?;
    create_directory_index(volume, &mut root)?;
    let root_reference = root.reference();
    let dot = FileNameAttribute::new(root_reference, ".", volume.transaction_time(), directory_attributes);
    root.add_file_name(volume, &dot)?;
    add_entry(volume, &mut root, &dot, root_reference)?;

    let data = AttrKey::unnamed(ATTR_TYPE_DATA);

    let mut log_file = NtfsFile::create_at(volume, MFT_RECORD_LOGFILE, false, SYSTEM_FILE_ATTRIBUTES)?;
    log_file.add_resident_attribute(volume, &data, Vec::new())?;
    link(volume, &mut root, &mut log_file, "$LogFile", SYSTEM_FILE_ATTRIBUTES)?;

    let mut volume_file = NtfsFile::create_at(volume, MFT_RECORD_VOLUME, false, SYSTEM_FILE_ATTRIBUTES)?;
    let label = to_utf16(options.label.as_deref().unwrap_or(""));
    let mut label_bytes = Vec::with_capacity(label.len() * 2);
    write_utf16(&mut label_bytes, &label);
    volume_file.add_resident_attribute(volume, &AttrKey::unnamed(ATTR_TYPE_VOLUME_NAME), label_bytes)?;
    volume_file.add_resident_attribute(volume, &AttrKey::unnamed(ATTR_TYPE_VOLUME_INFORMATION), volume_information())?;
    volume_file.add_resident_attribute(volume, &data, Vec::new())?;
    link(volume, &mut root, &mut volume_file, "$Volume", SYSTEM_FILE_ATTRIBUTES)?;

    let mut attr_def = NtfsFile::create_at(volume, MFT_RECORD_ATTRDEF, false, SYSTEM_FILE_ATTRIBUTES)?;
    attr_def.add_resident_attribute(volume, &data, Vec::new())?;
    link(volume, &mut root, &mut attr_def, "$AttrDef", SYSTEM_FILE_ATTRIBUTES)?;

    // Every cluster of the volume as one hole; bad clusters would be mapped in
    let mut bad_clusters = NtfsFile::create_at(volume, MFT_RECORD_BADCLUS, false, SYSTEM_FILE_ATTRIBUTES)?;
    bad_clusters.add_resident_attribute(volume, &data, Vec::new())?;
    let bad = AttrKey::new(ATTR_TYPE_DATA, "$Bad");
    bad_clusters.add_non_resident_attribute(volume, &bad, ATTR_FLAG_SPARSE)?;
    let volume_bytes = volume.total_clusters() * volume.cluster_size();
    bad_clusters.set_attribute_length(volume, &bad, volume_bytes)?;
    link(volume, &mut root, &mut bad_clusters, "$BadClus", SYSTEM_FILE_ATTRIBUTES)?;

    let secure_attributes = SYSTEM_FILE_ATTRIBUTES | FILE_ATTRIBUTE_VIEW_INDEX;
    let mut secure = NtfsFile::create_at(volume, MFT_RECORD_SECURE, false, secure_attributes)?;
    secure.add_resident_attribute(volume, &AttrKey::new(ATTR_TYPE_DATA, "$SDS"), Vec::new())?;
    Index::create(volume, &mut secure, &to_utf16("$SDH"), 0, CollationRule::SecurityHash)?;
    Index::create(volume, &mut secure, &to_utf16("$SII"), 0, CollationRule::UnsignedLong)?;
    link(volume, &mut root, &mut secure, "$Secure", SYSTEM_FILE_ATTRIBUTES)?;

    let mut upcase_file = NtfsFile::create_at(volume, MFT_RECORD_UPCASE, false, SYSTEM_FILE_ATTRIBUTES)?;
    upcase_file.add_non_resident_attribute(volume, &data, 0)?;
    upcase_file.write_attribute(volume, &data, 0, &UpCaseTable::default().to_bytes())?;
    link(volume, &mut root, &mut upcase_file, "$UpCase", SYSTEM_FILE_ATTRIBUTES)?;

    let mut extend = NtfsFile::create_at(volume, MFT_RECORD_EXTEND, true, SYSTEM_FILE_ATTRIBUTES)?;
    create_directory_index(volume, &mut extend)?;
    link(volume, &mut root, &mut extend, "$Extend", directory_attributes)?;

    let mut object_ids = directory::create_child(volume, &mut extend, "$ObjId", false, secure_attributes)?;
    Index::create(volume, &mut object_ids, &to_utf16("$O"), 0, CollationRule::UnsignedLongs)?;
    let mut quota = directory::create_child(volume, &mut extend, "$Quota", false, secure_attributes)?;
    Index::create(volume, &mut quota, &to_utf16("$O"), 0, CollationRule::Sid)?;
    Index::create(volume, &mut quota, &to_utf16("$Q"), 0, CollationRule::UnsignedLong)?;

    for number in MFT_RECORD_EXTEND + 1..MFT_FIRST_USER_RECORD {
        NtfsFile::create_at(volume, number, false, SYSTEM_FILE_ATTRIBUTES)?;
    }

    // The hand-built records already carry their names; only the root
    // entries are missing
    for number in [MFT_RECORD_MFT, MFT_RECORD_MFTMIRR, MFT_RECORD_BITMAP, MFT_RECORD_BOOT] {
        let file = NtfsFile::open(volume, number)?;
        for file_name in file.file_names()? {
            add_entry(volume, &mut root, &file_name, file.reference())?;
        }
    }
    debug!("System files built; root holds {} names", directory::list(volume, &mut root)?.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntfsrw_core::MemoryDevice;

    fn formatted(options: &FormatOptions) -> Volume {
        format(Box::new(MemoryDevice::new(16 << 20)), options, VolumeConfig::default()).unwrap()
    }

    #[test]
    fn test_layout_for_small_device() {
        let layout = Layout::plan(&FormatOptions::default(), 16 << 20).unwrap();
        assert_eq!(layout.total_clusters, 4095);
        assert_eq!(layout.mft_lcn, 2);
        assert_eq!(layout.mft_records, 64);
        assert_eq!(layout.mirror_lcn, 2047);
        assert!(Layout::plan(&FormatOptions::default(), 64 * 1024).is_err());
    }

    #[test]
    fn test_formatted_volume_reopens() {
        let options = FormatOptions { label: Some("DATA".to_string()), serial: Some(0xABCD), ..FormatOptions::default() };
        let volume = formatted(&options);
        let free = volume.free_clusters();
        let mut volume = Volume::open(volume.into_device(), VolumeConfig::default()).unwrap();
        assert_eq!(volume.free_clusters(), free);
        assert_eq!(volume.boot_sector().volume_serial, 0xABCD);
        for number in 0..MFT_FIRST_USER_RECORD {
            assert!(volume.is_record_allocated(number), "record {}", number);
        }
        let file = NtfsFile::open(&mut volume, MFT_RECORD_VOLUME).unwrap();
        let label = file.resident_value(&AttrKey::unnamed(ATTR_TYPE_VOLUME_NAME)).unwrap();
        assert_eq!(label, &[b'D', 0, b'A', 0, b'T', 0, b'A', 0]);
    }

    #[test]
    fn test_root_reference_matches_bootstrap_names() {
        let mut volume = formatted(&FormatOptions::default());
        let root = NtfsFile::open(&mut volume, MFT_RECORD_ROOT).unwrap();
        assert_eq!(root.reference(), FileReference::new(5, 5));
        let mft = NtfsFile::open(&mut volume, MFT_RECORD_MFT).unwrap();
        assert_eq!(mft.file_names().unwrap()[0].parent, root.reference());
    }

    #[test]
    fn test_upcase_round_trips() {
        let volume = formatted(&FormatOptions::default());
        let volume = Volume::open(volume.into_device(), VolumeConfig::default()).unwrap();
        assert_eq!(volume.upcase().upcase('a' as u16), 'A' as u16);
    }

    #[test]
    fn test_extend_children() {
        let mut volume = formatted(&FormatOptions::default());
        let mut extend = NtfsFile::open(&mut volume, MFT_RECORD_EXTEND).unwrap();
        let names: Vec<String> = directory::list(&mut volume, &mut extend)
            .unwrap()
            .iter()
            .map(|e| e.name.name_string())
            .collect();
        assert_eq!(names, vec!["$ObjId".to_string(), "$Quota".to_string()]);
    }

    #[test]
    fn test_read_only_config_is_rejected() {
        let config = VolumeConfig { read_only: true, ..VolumeConfig::default() };
        let result = format(Box::new(MemoryDevice::new(16 << 20)), &FormatOptions::default(), config);
        assert!(matches!(result, Err(NtfsError::Configuration(_))));
    }
}
