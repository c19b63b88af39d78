// An opened NTFS volume: boot sector, geometry, the MFT (records, record
// bitmap, mirror), the cluster bitmap, caches and the transaction marker
// Both bitmaps are written back to disk inline with every allocation

use crate::attributes::{AttrKey, AttributeBody};
use crate::bitmap::{Bitmap, ClusterBitmap};
use crate::boot_sector::{BootSector, BOOT_SECTOR_SIZE};
use crate::cache::{CacheStats, ObjectCache};
use crate::compression::{Compressor, Lznt1};
use crate::data_runs::RunSpan;
use crate::file::NtfsFile;
use crate::record::FileRecord;
use crate::structures::*;
use crate::timestamps::TransactionMarker;
use crate::upcase::{UpCaseTable, UPCASE_BYTES};
use log::{debug, info, warn};
use ntfsrw_core::{BlockDevice, NtfsError, Result, VolumeConfig};
use std::ops::Range;

/// Records duplicated in `$MFTMirr`.
pub const MFT_MIRROR_RECORDS: u64 = 4;
/// Records added each time the MFT runs out of free entries.
const MFT_GROWTH_RECORDS: u64 = 16;

/// Index block cache key: (base record, index name, block VCN).
pub type BlockKey = (u64, Vec<u16>, u64);
/// Compression unit cache key: (base record, attribute type, name, unit).
pub type UnitKey = (u64, u32, Vec<u16>, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: u32,
    pub cluster_size: u32,
    pub record_size: u32,
    pub index_block_size: u32,
    pub total_clusters: u64,
    pub mft_lcn: u64,
    pub mftmirr_lcn: u64,
}

impl Geometry {
    pub fn from_boot(boot: &BootSector) -> Self {
        Self {
            sector_size: boot.bytes_per_sector as u32,
            cluster_size: boot.bytes_per_cluster(),
            record_size: boot.mft_record_size(),
            index_block_size: boot.index_buffer_size(),
            total_clusters: boot.total_clusters(),
            mft_lcn: boot.mft_lcn,
            mftmirr_lcn: boot.mftmirr_lcn,
        }
    }
}

#[derive(Debug, Clone)]
enum MftBitmapHome {
    Resident,
    Clusters { runs: Vec<RunSpan>, allocated: u64 },
}

#[derive(Debug, Clone)]
struct MftState {
    data_runs: Vec<RunSpan>,
    record_count: u64,
    bitmap: Bitmap,
    bitmap_home: MftBitmapHome,
}

pub struct Volume {
    device: Box<dyn BlockDevice>,
    boot: BootSector,
    geometry: Geometry,
    config: VolumeConfig,
    mft: MftState,
    clusters: ClusterBitmap,
    cluster_bitmap_runs: Vec<RunSpan>,
    records: ObjectCache<u64, FileRecord>,
    blocks: ObjectCache<BlockKey, Vec<u8>>,
    units: ObjectCache<UnitKey, Vec<u8>>,
    upcase: UpCaseTable,
    compressor: Box<dyn Compressor>,
    transaction: TransactionMarker,
}

impl Volume {
    pub fn open(mut device: Box<dyn BlockDevice>, config: VolumeConfig) -> Result<Self> {
        config.validate()?;
        let boot = read_boot_sector(device.as_mut())?;
        let geometry = Geometry::from_boot(&boot);
        let cluster_size = geometry.cluster_size as u64;
        if geometry.total_clusters * cluster_size > device.size() {
            return Err(NtfsError::FormatCorruption(format!(
                "boot sector describes {} clusters but the device holds {} bytes",
                geometry.total_clusters,
                device.size()
            )));
        }
        info!(
            "Opening NTFS volume: {} clusters of {} bytes, {}-byte records, MFT at LCN {}",
            geometry.total_clusters, geometry.cluster_size, geometry.record_size, geometry.mft_lcn
        );

        let record0 = read_mft_record_zero(device.as_mut(), &geometry)?;
        let mft = load_mft_state(device.as_mut(), &geometry, &record0)?;

        // $Bitmap lives in a regular record; read it through the MFT runs
        let record_size = geometry.record_size as usize;
        let mut raw = vec![0u8; record_size];
        read_span_bytes(device.as_mut(), cluster_size, &mft.data_runs, MFT_RECORD_BITMAP * record_size as u64, &mut raw)?;
        let bitmap_record = FileRecord::parse(MFT_RECORD_BITMAP, raw)?;
        let bitmap_data = bitmap_record
            .find(ATTR_TYPE_DATA, &[])
            .and_then(|a| a.non_resident_body())
            .ok_or_else(|| NtfsError::FormatCorruption("$Bitmap has no non-resident $DATA".to_string()))?;
        let bitmap_bytes_needed = (geometry.total_clusters + 7) / 8;
        if bitmap_data.data_size < bitmap_bytes_needed {
            return Err(NtfsError::FormatCorruption(format!(
                "$Bitmap holds {} bytes for {} clusters",
                bitmap_data.data_size, geometry.total_clusters
            )));
        }
        let cluster_bitmap_runs = bitmap_data.runs.clone();
        let mut bytes = vec![0u8; bitmap_bytes_needed as usize];
        read_span_bytes(device.as_mut(), cluster_size, &cluster_bitmap_runs, 0, &mut bytes)?;
        let clusters = ClusterBitmap::new(Bitmap::from_bytes(bytes, geometry.total_clusters));
        debug!(
            "Cluster bitmap loaded: {} of {} clusters free",
            clusters.free_clusters_count(),
            geometry.total_clusters
        );

        let mut volume = Self {
            device,
            boot,
            geometry,
            records: ObjectCache::new(config.record_cache_capacity),
            blocks: ObjectCache::new(config.block_cache_capacity),
            units: ObjectCache::new(config.block_cache_capacity),
            config,
            mft,
            clusters,
            cluster_bitmap_runs,
            upcase: UpCaseTable::default(),
            compressor: Box::new(Lznt1),
            transaction: TransactionMarker::default(),
        };
        volume.check_mirror()?;
        volume.load_upcase()?;
        Ok(volume)
    }

    fn check_mirror(&mut self) -> Result<()> {
        let record_size = self.geometry.record_size as usize;
        let cluster_size = self.cluster_size();
        for number in 0..MFT_MIRROR_RECORDS.min(self.mft.record_count) {
            let mut primary = vec![0u8; record_size];
            read_span_bytes(self.device.as_mut(), cluster_size, &self.mft.data_runs, number * record_size as u64, &mut primary)?;
            let mut mirror = vec![0u8; record_size];
            self.device.read_at(self.mirror_offset(number), &mut mirror)?;
            if primary == mirror {
                continue;
            }
            warn!("$MFTMirr disagrees with $MFT at record {}", number);
            if !self.config.repair_mirror || self.config.read_only {
                continue;
            }
            if FileRecord::parse(number, primary.clone()).is_ok() {
                self.device.write_at(self.mirror_offset(number), &primary)?;
                info!("Repaired $MFTMirr record {} from $MFT", number);
            } else {
                FileRecord::parse(number, mirror.clone())?;
                write_span_bytes(self.device.as_mut(), cluster_size, &self.mft.data_runs, number * record_size as u64, &mirror)?;
                info!("Restored $MFT record {} from $MFTMirr", number);
            }
        }
        Ok(())
    }

    fn load_upcase(&mut self) -> Result<()> {
        if !self.is_record_allocated(MFT_RECORD_UPCASE) {
            debug!("No $UpCase record, using the built-in table");
            return Ok(());
        }
        let file = NtfsFile::open(self, MFT_RECORD_UPCASE)?;
        let key = AttrKey::unnamed(ATTR_TYPE_DATA);
        if !file.has_attribute(&key) || file.attribute_length(&key)? != UPCASE_BYTES as u64 {
            warn!("$UpCase has no usable $DATA, using the built-in table");
            return Ok(());
        }
        let data = file.read_all(self, &key)?;
        self.upcase = UpCaseTable::from_bytes(&data)?;
        Ok(())
    }

    pub fn boot_sector(&self) -> &BootSector {
        &self.boot
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn cluster_size(&self) -> u64 {
        self.geometry.cluster_size as u64
    }

    pub fn record_size(&self) -> usize {
        self.geometry.record_size as usize
    }

    pub fn index_block_size(&self) -> u32 {
        self.geometry.index_block_size
    }

    /// Byte budget for the entries of an index root.
    pub fn index_root_budget(&self) -> usize {
        self.config
            .index_root_budget
            .map(|b| b as usize)
            .unwrap_or(self.record_size() / 4)
    }

    pub fn upcase(&self) -> &UpCaseTable {
        &self.upcase
    }

    pub fn compressor(&self) -> &dyn Compressor {
        self.compressor.as_ref()
    }

    pub fn set_compressor(&mut self, compressor: Box<dyn Compressor>) {
        self.compressor = compressor;
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(NtfsError::NotSupported("volume is opened read-only".to_string()));
        }
        Ok(())
    }

    // Transactions

    pub fn begin_transaction(&mut self) -> u64 {
        self.transaction.begin()
    }

    pub fn end_transaction(&mut self) {
        self.transaction.end()
    }

    /// Timestamp for metadata changes: pinned while a transaction is open.
    pub fn transaction_time(&self) -> u64 {
        self.transaction.now()
    }

    // Clusters

    pub fn total_clusters(&self) -> u64 {
        self.geometry.total_clusters
    }

    pub fn free_clusters(&self) -> u64 {
        self.clusters.free_clusters_count()
    }

    pub fn is_cluster_allocated(&self, lcn: u64) -> bool {
        self.clusters.is_allocated(lcn)
    }

    pub fn allocate_clusters(&mut self, count: u64, preferred_near: Option<u64>) -> Result<Vec<Range<u64>>> {
        self.ensure_writable()?;
        let ranges = self.clusters.allocate_clusters(count, preferred_near)?;
        for range in &ranges {
            self.persist_cluster_bitmap(range.clone())?;
        }
        Ok(ranges)
    }

    pub fn free_cluster_range(&mut self, range: Range<u64>) -> Result<()> {
        self.ensure_writable()?;
        self.clusters.free_clusters(range.clone())?;
        self.persist_cluster_bitmap(range)
    }

    fn persist_cluster_bitmap(&mut self, range: Range<u64>) -> Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        let first = (range.start / 8) as usize;
        let last = ((range.end + 7) / 8) as usize;
        let bytes = self.clusters.bitmap().as_bytes()[first..last].to_vec();
        let cluster_size = self.cluster_size();
        write_span_bytes(self.device.as_mut(), cluster_size, &self.cluster_bitmap_runs, first as u64, &bytes)
    }

    pub fn read_clusters(&mut self, lcn: u64, buf: &mut [u8]) -> Result<()> {
        self.check_cluster_range(lcn, buf.len())?;
        self.device.read_at(lcn * self.cluster_size(), buf)
    }

    pub fn write_clusters(&mut self, lcn: u64, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.check_cluster_range(lcn, data.len())?;
        self.device.write_at(lcn * self.cluster_size(), data)
    }

    fn check_cluster_range(&self, lcn: u64, len: usize) -> Result<()> {
        let count = (len as u64 + self.cluster_size() - 1) / self.cluster_size();
        if lcn + count > self.geometry.total_clusters {
            return Err(NtfsError::FormatCorruption(format!(
                "clusters {}..{} beyond the volume ({} clusters)",
                lcn,
                lcn + count,
                self.geometry.total_clusters
            )));
        }
        Ok(())
    }

    // Records

    pub fn record_count(&self) -> u64 {
        self.mft.record_count
    }

    pub fn is_record_allocated(&self, number: u64) -> bool {
        self.mft.bitmap.get(number)
    }

    fn mirror_offset(&self, number: u64) -> u64 {
        self.geometry.mftmirr_lcn * self.cluster_size() + number * self.record_size() as u64
    }

    pub fn read_record(&mut self, number: u64) -> Result<FileRecord> {
        if number >= self.mft.record_count {
            return Err(NtfsError::NotFound(format!(
                "record {} beyond the MFT ({} records)",
                number, self.mft.record_count
            )));
        }
        if let Some(record) = self.records.get(&number) {
            return Ok(record);
        }
        let record_size = self.record_size();
        let mut raw = vec![0u8; record_size];
        let cluster_size = self.cluster_size();
        read_span_bytes(self.device.as_mut(), cluster_size, &self.mft.data_runs, number * record_size as u64, &mut raw)?;
        let record = FileRecord::parse(number, raw)?;
        self.records.insert(number, record.clone());
        Ok(record)
    }

    /// Serialize and write a record (and its mirror copy). Updates the USN
    /// held in `record`.
    pub fn write_record(&mut self, record: &mut FileRecord) -> Result<()> {
        self.ensure_writable()?;
        let number = record.number;
        if number >= self.mft.record_count {
            return Err(NtfsError::NotFound(format!(
                "record {} beyond the MFT ({} records)",
                number, self.mft.record_count
            )));
        }
        let record_size = self.record_size();
        let bytes = record.serialize(record_size)?;
        let cluster_size = self.cluster_size();
        write_span_bytes(self.device.as_mut(), cluster_size, &self.mft.data_runs, number * record_size as u64, &bytes)?;
        if number < MFT_MIRROR_RECORDS {
            let offset = self.mirror_offset(number);
            self.device.write_at(offset, &bytes)?;
        }
        self.records.insert(number, record.clone());
        debug!("Wrote record {} ({} attributes)", number, record.attributes.len());
        Ok(())
    }

    /// Take the first free record at or above the first user record,
    /// growing the MFT when none is left.
    pub fn allocate_record(&mut self) -> Result<FileRecord> {
        self.ensure_writable()?;
        let number = match self.mft.bitmap.find_clear(MFT_FIRST_USER_RECORD) {
            Some(number) => number,
            None => {
                self.grow_mft()?;
                self.mft.bitmap.find_clear(MFT_FIRST_USER_RECORD).ok_or_else(|| {
                    NtfsError::CapacityExhausted("no free MFT record after growing the MFT".to_string())
                })?
            }
        };
        self.claim_record(number)
    }

    /// Take a specific record (system files).
    pub fn allocate_record_at(&mut self, number: u64) -> Result<FileRecord> {
        self.ensure_writable()?;
        while number >= self.mft.record_count {
            self.grow_mft()?;
        }
        if self.mft.bitmap.get(number) {
            return Err(NtfsError::LogicalMisuse(format!("record {} is already allocated", number)));
        }
        self.claim_record(number)
    }

    fn claim_record(&mut self, number: u64) -> Result<FileRecord> {
        let (sequence, usn) = match self.read_record(number) {
            Ok(old) if old.header.in_use() => {
                return Err(NtfsError::FormatCorruption(format!(
                    "record {} is free in the MFT bitmap but marked in use",
                    number
                )));
            }
            Ok(old) => (old.header.sequence.max(1), old.header.usn),
            Err(NtfsError::FormatCorruption(_)) => (1, 0),
            Err(e) => return Err(e),
        };
        self.mft.bitmap.set(number);
        self.persist_mft_bitmap(number / 8, 1)?;
        let mut record = FileRecord::new(number, sequence, MFT_RECORD_IN_USE);
        record.header.usn = usn;
        debug!("Allocated record {} (sequence {})", number, sequence);
        Ok(record)
    }

    /// Release a record: clear it, bump its sequence number and free its
    /// bitmap bit. Cached copies of it and its index blocks become stale.
    pub fn free_record(&mut self, number: u64) -> Result<()> {
        self.ensure_writable()?;
        if !self.mft.bitmap.get(number) {
            return Err(NtfsError::LogicalMisuse(format!("record {} is not allocated", number)));
        }
        let mut record = match self.read_record(number) {
            Ok(record) => record,
            Err(NtfsError::FormatCorruption(_)) => FileRecord::new(number, 0, 0),
            Err(e) => return Err(e),
        };
        record.header.flags &= !MFT_RECORD_IN_USE;
        record.header.sequence = match record.header.sequence.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        record.header.base_reference = FileReference::default();
        record.header.link_count = 0;
        record.header.next_attribute_id = 0;
        record.attributes.clear();
        self.write_record(&mut record)?;

        self.records.invalidate(&number);
        self.blocks.invalidate_where(|key| key.0 == number);
        self.units.invalidate_where(|key| key.0 == number);
        self.mft.bitmap.clear(number);
        self.persist_mft_bitmap(number / 8, 1)?;
        debug!("Freed record {} (next sequence {})", number, record.header.sequence);
        Ok(())
    }

    fn grow_mft(&mut self) -> Result<()> {
        let record_size = self.record_size() as u64;
        let cluster_size = self.cluster_size();
        let clusters = (MFT_GROWTH_RECORDS * record_size + cluster_size - 1) / cluster_size;
        let near = last_lcn_end(&self.mft.data_runs);
        let ranges = self.allocate_clusters(clusters, near)?;
        let zeros = vec![0u8; cluster_size as usize];
        for range in &ranges {
            for lcn in range.clone() {
                self.device.write_at(lcn * cluster_size, &zeros)?;
            }
            append_span(&mut self.mft.data_runs, range.start, range.end - range.start);
        }

        let old_count = self.mft.record_count;
        let total_bytes: u64 = self.mft.data_runs.iter().map(|s| s.length).sum::<u64>() * cluster_size;
        self.mft.record_count = total_bytes / record_size;
        self.mft.bitmap.resize(self.mft.record_count);

        let bitmap_bytes = align8(((self.mft.record_count + 7) / 8) as usize) as u64;
        if let MftBitmapHome::Clusters { mut runs, mut allocated } = self.mft.bitmap_home.clone() {
            if bitmap_bytes > allocated {
                let extra = (bitmap_bytes - allocated + cluster_size - 1) / cluster_size;
                let near = last_lcn_end(&runs);
                for range in self.allocate_clusters(extra, near)? {
                    for lcn in range.clone() {
                        self.device.write_at(lcn * cluster_size, &zeros)?;
                    }
                    append_span(&mut runs, range.start, range.end - range.start);
                    allocated += (range.end - range.start) * cluster_size;
                }
                self.mft.bitmap_home = MftBitmapHome::Clusters { runs, allocated };
            }
        }

        let mut record0 = self.read_record(MFT_RECORD_MFT)?;
        for attr in record0.attributes.iter_mut() {
            if !attr.name.is_empty() {
                continue;
            }
            match (attr.type_code, &mut attr.body) {
                (ATTR_TYPE_DATA, AttributeBody::NonResident(nr)) => {
                    nr.runs = self.mft.data_runs.clone();
                    nr.allocated_size = total_bytes;
                    nr.data_size = self.mft.record_count * record_size;
                    nr.initialized_size = nr.data_size;
                }
                (ATTR_TYPE_BITMAP, AttributeBody::Resident(r)) => {
                    let mut data = self.mft.bitmap.as_bytes().to_vec();
                    data.resize(bitmap_bytes as usize, 0);
                    r.data = data;
                }
                (ATTR_TYPE_BITMAP, AttributeBody::NonResident(nr)) => {
                    if let MftBitmapHome::Clusters { runs, allocated } = &self.mft.bitmap_home {
                        nr.runs = runs.clone();
                        nr.allocated_size = *allocated;
                    }
                    nr.data_size = bitmap_bytes;
                    nr.initialized_size = bitmap_bytes;
                }
                _ => {}
            }
        }
        self.write_record(&mut record0)?;
        let whole = self.mft.bitmap.as_bytes().len() as u64;
        self.persist_mft_bitmap(0, whole)?;
        info!("Grew $MFT from {} to {} records", old_count, self.mft.record_count);
        Ok(())
    }

    fn persist_mft_bitmap(&mut self, first_byte: u64, count: u64) -> Result<()> {
        match self.mft.bitmap_home.clone() {
            MftBitmapHome::Clusters { runs, .. } => {
                let bytes = self.mft.bitmap.as_bytes();
                let end = (first_byte + count).min(bytes.len() as u64) as usize;
                let chunk = bytes[first_byte as usize..end].to_vec();
                let cluster_size = self.cluster_size();
                write_span_bytes(self.device.as_mut(), cluster_size, &runs, first_byte, &chunk)
            }
            MftBitmapHome::Resident => {
                let mut record0 = self.read_record(MFT_RECORD_MFT)?;
                let mut data = self.mft.bitmap.as_bytes().to_vec();
                data.resize(align8(data.len()), 0);
                match record0.find_mut(ATTR_TYPE_BITMAP, &[]).map(|a| &mut a.body) {
                    Some(AttributeBody::Resident(r)) => r.data = data,
                    _ => {
                        return Err(NtfsError::FormatCorruption("$MFT lost its resident $BITMAP".to_string()));
                    }
                }
                self.write_record(&mut record0)
            }
        }
    }

    // Caches

    pub(crate) fn cached_block(&mut self, key: &BlockKey) -> Option<Vec<u8>> {
        self.blocks.get(key)
    }

    pub(crate) fn cache_block(&mut self, key: BlockKey, block: Vec<u8>) {
        self.blocks.insert(key, block);
    }

    pub(crate) fn invalidate_block(&mut self, key: &BlockKey) {
        self.blocks.invalidate(key);
    }

    pub(crate) fn invalidate_index_blocks(&mut self, record: u64, name: &[u16]) {
        self.blocks.invalidate_where(|key| key.0 == record && key.1 == name);
    }

    pub(crate) fn cached_unit(&mut self, key: &UnitKey) -> Option<Vec<u8>> {
        self.units.get(key)
    }

    pub(crate) fn cache_unit(&mut self, key: UnitKey, plaintext: Vec<u8>) {
        self.units.insert(key, plaintext);
    }

    pub(crate) fn invalidate_units(&mut self, record: u64, type_code: u32, name: &[u16]) {
        self.units
            .invalidate_where(|key| key.0 == record && key.1 == type_code && key.2 == name);
    }

    /// (record cache, index block cache) statistics.
    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        (self.records.stats(), self.blocks.stats())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.device.flush()
    }

    pub fn into_device(self) -> Box<dyn BlockDevice> {
        self.device
    }
}

fn read_boot_sector(device: &mut dyn BlockDevice) -> Result<BootSector> {
    let mut buf = [0u8; BOOT_SECTOR_SIZE];
    device.read_at(0, &mut buf)?;
    let primary = match BootSector::parse(&buf) {
        Ok(boot) => return Ok(boot),
        Err(e) => e,
    };
    warn!("Primary boot sector unusable ({}), trying the backup", primary);
    let size = device.size();
    for backup_offset in [size.saturating_sub(512), size.saturating_sub(4096)] {
        if backup_offset == 0 {
            continue;
        }
        device.read_at(backup_offset, &mut buf)?;
        if let Ok(boot) = BootSector::parse(&buf) {
            info!("Using backup boot sector at offset {}", backup_offset);
            return Ok(boot);
        }
    }
    Err(primary)
}

fn read_mft_record_zero(device: &mut dyn BlockDevice, geometry: &Geometry) -> Result<FileRecord> {
    let record_size = geometry.record_size as usize;
    let cluster_size = geometry.cluster_size as u64;
    let mut raw = vec![0u8; record_size];
    device.read_at(geometry.mft_lcn * cluster_size, &mut raw)?;
    match FileRecord::parse(MFT_RECORD_MFT, raw) {
        Ok(record) => Ok(record),
        Err(primary) => {
            warn!("$MFT record 0 unreadable ({}), falling back to $MFTMirr", primary);
            let mut raw = vec![0u8; record_size];
            device.read_at(geometry.mftmirr_lcn * cluster_size, &mut raw)?;
            FileRecord::parse(MFT_RECORD_MFT, raw).map_err(|_| primary)
        }
    }
}

fn load_mft_state(device: &mut dyn BlockDevice, geometry: &Geometry, record0: &FileRecord) -> Result<MftState> {
    if record0.find(ATTR_TYPE_ATTRIBUTE_LIST, &[]).is_some() {
        return Err(NtfsError::NotSupported("$MFT with an attribute list".to_string()));
    }
    let data = record0
        .find(ATTR_TYPE_DATA, &[])
        .and_then(|a| a.non_resident_body())
        .ok_or_else(|| NtfsError::FormatCorruption("$MFT has no non-resident $DATA".to_string()))?;
    let record_count = data.data_size / geometry.record_size as u64;
    if record_count <= MFT_RECORD_EXTEND || data.cluster_count() * (geometry.cluster_size as u64) < data.data_size {
        return Err(NtfsError::FormatCorruption(format!(
            "$MFT of {} bytes in {} clusters",
            data.data_size,
            data.cluster_count()
        )));
    }

    let bitmap_attr = record0
        .find(ATTR_TYPE_BITMAP, &[])
        .ok_or_else(|| NtfsError::FormatCorruption("$MFT has no $BITMAP".to_string()))?;
    let (bytes, bitmap_home) = match &bitmap_attr.body {
        AttributeBody::Resident(r) => (r.data.clone(), MftBitmapHome::Resident),
        AttributeBody::NonResident(nr) => {
            let mut bytes = vec![0u8; nr.data_size as usize];
            read_span_bytes(device, geometry.cluster_size as u64, &nr.runs, 0, &mut bytes)?;
            (bytes, MftBitmapHome::Clusters { runs: nr.runs.clone(), allocated: nr.allocated_size })
        }
    };
    let bitmap = Bitmap::from_bytes(bytes, record_count);
    if !bitmap.get(MFT_RECORD_MFT) {
        return Err(NtfsError::FormatCorruption("$MFT record 0 is free in its own bitmap".to_string()));
    }
    debug!("MFT: {} records, {} in use", record_count, bitmap.count_set());
    Ok(MftState { data_runs: data.runs.clone(), record_count, bitmap, bitmap_home })
}

fn last_lcn_end(spans: &[RunSpan]) -> Option<u64> {
    spans.iter().rev().find_map(|s| s.lcn.map(|lcn| lcn + s.length))
}

fn append_span(spans: &mut Vec<RunSpan>, lcn: u64, length: u64) {
    if let Some(last) = spans.last_mut() {
        if last.lcn.map(|l| l + last.length) == Some(lcn) {
            last.length += length;
            return;
        }
    }
    spans.push(RunSpan::new(Some(lcn), length));
}

/// Visit the pieces of the byte range `offset..offset+len` of a stream
/// described by `spans`: (device offset or `None` for a hole, position in
/// the range, piece length).
fn for_each_piece<F>(cluster_size: u64, spans: &[RunSpan], offset: u64, len: usize, mut f: F) -> Result<()>
where
    F: FnMut(Option<u64>, usize, usize) -> Result<()>,
{
    let end = offset + len as u64;
    let mut span_start = 0u64;
    for span in spans {
        if span_start >= end {
            break;
        }
        let span_end = span_start + span.length * cluster_size;
        if span_end > offset {
            let from = offset.max(span_start);
            let to = end.min(span_end);
            let device_offset = span.lcn.map(|lcn| lcn * cluster_size + (from - span_start));
            f(device_offset, (from - offset) as usize, (to - from) as usize)?;
        }
        span_start = span_end;
    }
    if span_start < end {
        return Err(NtfsError::FormatCorruption(format!(
            "bytes {}..{} beyond a stream of {} bytes",
            offset, end, span_start
        )));
    }
    Ok(())
}

pub(crate) fn read_span_bytes(
    device: &mut dyn BlockDevice,
    cluster_size: u64,
    spans: &[RunSpan],
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    for_each_piece(cluster_size, spans, offset, buf.len(), |device_offset, at, len| {
        match device_offset {
            Some(pos) => device.read_at(pos, &mut buf[at..at + len]),
            None => {
                buf[at..at + len].fill(0);
                Ok(())
            }
        }
    })
}

pub(crate) fn write_span_bytes(
    device: &mut dyn BlockDevice,
    cluster_size: u64,
    spans: &[RunSpan],
    offset: u64,
    data: &[u8],
) -> Result<()> {
    for_each_piece(cluster_size, spans, offset, data.len(), |device_offset, at, len| {
        match device_offset {
            Some(pos) => device.write_at(pos, &data[at..at + len]),
            None => Err(NtfsError::LogicalMisuse(format!(
                "write of {} bytes into a hole of a system stream",
                len
            ))),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntfsrw_core::MemoryDevice;

    #[test]
    fn test_span_pieces_cross_runs() {
        let mut device = MemoryDevice::new(64 * 512);
        let spans = vec![RunSpan::new(Some(10), 2), RunSpan::new(None, 1), RunSpan::new(Some(4), 1)];
        let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        // Offsets 100..1600: tail of LCN 10, all of LCN 11, hole, then LCN 4
        let head = &data[..924];
        write_span_bytes(&mut device, 512, &spans, 100, head).unwrap();
        assert_eq!(&device.as_bytes()[10 * 512 + 100..11 * 512], &data[..412]);
        assert_eq!(&device.as_bytes()[11 * 512..12 * 512], &data[412..924]);

        let mut back = vec![0xAAu8; 1200];
        device.as_bytes_mut()[4 * 512..5 * 512].fill(7);
        read_span_bytes(&mut device, 512, &spans, 100, &mut back).unwrap();
        assert_eq!(&back[..924], head);
        // The hole reads as zeros
        assert!(back[924..1200].iter().all(|&b| b == 0));

        let mut tail = vec![0u8; 10];
        read_span_bytes(&mut device, 512, &spans, 1536, &mut tail).unwrap();
        assert_eq!(tail, vec![7u8; 10]);

        assert!(write_span_bytes(&mut device, 512, &spans, 1100, &[1, 2]).is_err());
        assert!(read_span_bytes(&mut device, 512, &spans, 2000, &mut [0u8; 100]).is_err());
    }

    #[test]
    fn test_append_span_merges_contiguous() {
        let mut spans = vec![RunSpan::new(Some(5), 3)];
        append_span(&mut spans, 8, 2);
        append_span(&mut spans, 20, 1);
        assert_eq!(spans, vec![RunSpan::new(Some(5), 5), RunSpan::new(Some(20), 1)]);
        assert_eq!(last_lcn_end(&spans), Some(21));
    }

    #[test]
    fn test_mft_state_rejects_data_beyond_its_clusters() {
        let volume = crate::format::format(
            Box::new(MemoryDevice::new(16 << 20)),
            &ntfsrw_core::FormatOptions::default(),
            VolumeConfig::default(),
        )
        .unwrap();
        let geometry = *volume.geometry();
        let mut device = volume.into_device();
        let record0 = read_mft_record_zero(device.as_mut(), &geometry).unwrap();
        let state = load_mft_state(device.as_mut(), &geometry, &record0).unwrap();
        assert_eq!(state.record_count, 64);

        let mut oversized = record0.clone();
        let body = oversized.find_mut(ATTR_TYPE_DATA, &[]).and_then(|a| a.non_resident_body_mut()).unwrap();
        body.data_size = (body.cluster_count() + 1) * geometry.cluster_size as u64;
        assert!(matches!(
            load_mft_state(device.as_mut(), &geometry, &oversized),
            Err(NtfsError::FormatCorruption(_))
        ));
    }
}
