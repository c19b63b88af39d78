// Logical files: a base FILE record plus the secondary records it owns
// Attribute extents live in one arena addressed by ExtentId. An attribute is
// the set of extents sharing a type and name, ordered by first VCN; the
// extent starting at VCN 0 carries the sizes

use crate::attribute_list::{encode_attribute_list, parse_attribute_list, referenced_records, AttributeListEntry};
use crate::attributes::{AttrKey, AttributeBody, AttributeRecord, NonResidentBody, RESIDENT_HEADER_SIZE};
use crate::buffer::NonResidentBuffer;
use crate::cooked_runs::{CookedRuns, ExtentId};
use crate::index::Index;
use crate::record::{self, FileRecord, RecordHeader};
use crate::stream::StreamKind;
use crate::structures::*;
use crate::volume::Volume;
use log::{debug, info, trace};
use ntfsrw_core::{NtfsError, Result};
use std::collections::BTreeSet;

// Overflow resolution converges long before this
const MAX_OVERFLOW_ROUNDS: usize = 4096;

/// Summary of one logical attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeInfo {
    pub key: AttrKey,
    pub resident: bool,
    pub flags: u16,
    /// Value length (data size for non-resident attributes)
    pub length: u64,
    pub allocated: u64,
    pub extents: usize,
    /// Records holding the extents, base first
    pub records: Vec<u64>,
}

#[derive(Debug, Clone)]
struct RecordSlot {
    number: u64,
    header: RecordHeader,
    live: bool,
    dirty: bool,
}

impl RecordSlot {
    fn reference(&self) -> FileReference {
        FileReference::new(self.number, self.header.sequence)
    }
}

#[derive(Debug, Clone)]
struct Extent {
    slot: usize,
    attr: AttributeRecord,
}

/// One file: slot 0 is the base record, later slots are secondary records.
#[derive(Debug, Clone)]
pub struct NtfsFile {
    slots: Vec<RecordSlot>,
    extents: Vec<Option<Extent>>,
}

fn in_transaction<T>(volume: &mut Volume, f: impl FnOnce(&mut Volume) -> Result<T>) -> Result<T> {
    volume.begin_transaction();
    let result = f(volume);
    volume.end_transaction();
    result
}

impl NtfsFile {
    /// Allocate a fresh record and give it a `$STANDARD_INFORMATION`.
    pub fn create(volume: &mut Volume, directory: bool, file_attributes: u32) -> Result<Self> {
        in_transaction(volume, |volume| {
            let record = volume.allocate_record()?;
            Self::initialize(volume, record, directory, file_attributes)
        })
    }

    /// Like `create`, at a fixed record number (system files).
    pub fn create_at(volume: &mut Volume, number: u64, directory: bool, file_attributes: u32) -> Result<Self> {
        in_transaction(volume, |volume| {
            let record = volume.allocate_record_at(number)?;
            Self::initialize(volume, record, directory, file_attributes)
        })
    }

    fn initialize(volume: &mut Volume, record: FileRecord, directory: bool, file_attributes: u32) -> Result<Self> {
        let mut header = record.header;
        if directory {
            header.flags |= MFT_RECORD_IS_DIRECTORY;
        }
        let mut file = Self {
            slots: vec![RecordSlot { number: record.number, header, live: true, dirty: true }],
            extents: Vec::new(),
        };
        let si = StandardInformation::new(volume.transaction_time(), file_attributes);
        file.push_extent(0, AttributeRecord::resident(ATTR_TYPE_STANDARD_INFORMATION, &[], si.to_bytes()));
        file.update_record_in_mft(volume)?;
        debug!("Created {} record {}", if directory { "directory" } else { "file" }, record.number);
        Ok(file)
    }

    /// Load a base record and every secondary record its attribute list names.
    pub fn open(volume: &mut Volume, number: u64) -> Result<Self> {
        let base = volume.read_record(number)?;
        if !base.header.in_use() {
            return Err(NtfsError::NotFound(format!("record {} is not in use", number)));
        }
        if !base.is_base() {
            return Err(NtfsError::LogicalMisuse(format!(
                "record {} is an extension of record {}",
                number,
                base.header.base_reference.record()
            )));
        }
        let mut file = Self { slots: Vec::new(), extents: Vec::new() };
        file.adopt(base);

        let list_key = AttrKey::unnamed(ATTR_TYPE_ATTRIBUTE_LIST);
        if file.has_attribute(&list_key) {
            if number == MFT_RECORD_MFT {
                return Err(NtfsError::NotSupported("$MFT with an attribute list".to_string()));
            }
            let entries = parse_attribute_list(&file.read_all(volume, &list_key)?)?;
            let base_reference = file.reference();
            for reference in referenced_records(&entries) {
                if reference.record() == number {
                    continue;
                }
                let record = volume.read_record(reference.record())?;
                if !record.header.in_use()
                    || record.header.base_reference != base_reference
                    || record.header.sequence != reference.sequence()
                {
                    return Err(NtfsError::FormatCorruption(format!(
                        "attribute list of record {} names {}, which does not belong to it",
                        number, reference
                    )));
                }
                file.adopt(record);
            }
            for entry in &entries {
                if !file.lists_extent(entry) {
                    return Err(NtfsError::FormatCorruption(format!(
                        "attribute list of record {} names {} (id {}) in record {}, which is missing",
                        number,
                        entry.key(),
                        entry.attribute_id,
                        entry.reference.record()
                    )));
                }
            }
        }
        file.validate_runs(volume)?;
        trace!("Opened record {} ({} records, {} extents)", number, file.slots.len(), file.live().count());
        Ok(file)
    }

    /// Open through a file reference, rejecting a stale sequence number.
    pub fn open_reference(volume: &mut Volume, reference: FileReference) -> Result<Self> {
        let file = Self::open(volume, reference.record())?;
        if file.slots[0].header.sequence != reference.sequence() {
            return Err(NtfsError::NotFound(format!(
                "stale reference {} (record is at sequence {})",
                reference, file.slots[0].header.sequence
            )));
        }
        Ok(file)
    }

    fn adopt(&mut self, record: FileRecord) {
        let slot = self.slots.len();
        self.slots.push(RecordSlot { number: record.number, header: record.header, live: true, dirty: false });
        for attr in record.attributes {
            self.extents.push(Some(Extent { slot, attr }));
        }
    }

    fn lists_extent(&self, entry: &AttributeListEntry) -> bool {
        let key = entry.key();
        self.live().any(|(_, e)| {
            self.slots[e.slot].number == entry.reference.record()
                && e.attr.matches(&key)
                && e.attr.lowest_vcn() == entry.start_vcn
                && e.attr.id == entry.attribute_id
        })
    }

    fn validate_runs(&self, volume: &Volume) -> Result<()> {
        let cluster_size = volume.cluster_size();
        for key in self.keys() {
            let ids = self.extents_of(&key);
            let resident = ids.iter().filter(|id| self.attr(**id).map(|a| a.is_resident()).unwrap_or(false)).count();
            if resident == ids.len() {
                continue;
            }
            let runs = self.cooked_runs(&key)?;
            let primary = self.primary_body(&key)?;
            runs.validate(primary.allocated_size / cluster_size)?;
        }
        Ok(())
    }

    // Identity

    pub fn number(&self) -> u64 {
        self.slots[0].number
    }

    pub fn reference(&self) -> FileReference {
        self.slots[0].reference()
    }

    pub fn is_directory(&self) -> bool {
        self.slots[0].header.is_directory()
    }

    pub fn link_count(&self) -> u16 {
        self.slots[0].header.link_count
    }

    /// Base record first, then live secondary records.
    pub fn record_numbers(&self) -> Vec<u64> {
        self.slots.iter().filter(|s| s.live).map(|s| s.number).collect()
    }

    // Arena

    fn live(&self) -> impl Iterator<Item = (ExtentId, &Extent)> + '_ {
        self.extents
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (ExtentId(i), e)))
    }

    fn extent(&self, id: ExtentId) -> Result<&Extent> {
        self.extents
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| NtfsError::LogicalMisuse(format!("extent {} no longer exists", id.0)))
    }

    fn attr(&self, id: ExtentId) -> Result<&AttributeRecord> {
        Ok(&self.extent(id)?.attr)
    }

    /// Mutable access to an extent; its record gets written on the next update.
    fn touch(&mut self, id: ExtentId) -> Result<&mut AttributeRecord> {
        let slot = self.extent(id)?.slot;
        self.slots[slot].dirty = true;
        self.extents
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .map(|e| &mut e.attr)
            .ok_or_else(|| NtfsError::LogicalMisuse(format!("extent {} no longer exists", id.0)))
    }

    fn push_extent(&mut self, slot: usize, mut attr: AttributeRecord) -> ExtentId {
        attr.id = self.slots[slot].header.take_attribute_id();
        self.slots[slot].dirty = true;
        self.extents.push(Some(Extent { slot, attr }));
        ExtentId(self.extents.len() - 1)
    }

    fn remove_extent(&mut self, id: ExtentId) {
        if let Some(extent) = self.extents.get_mut(id.0).and_then(Option::take) {
            self.slots[extent.slot].dirty = true;
        }
    }

    /// Extents of one attribute in VCN order.
    fn extents_of(&self, key: &AttrKey) -> Vec<ExtentId> {
        let mut ids: Vec<(u64, ExtentId)> = self
            .live()
            .filter(|(_, e)| e.attr.matches(key))
            .map(|(id, e)| (e.attr.lowest_vcn(), id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn primary(&self, key: &AttrKey) -> Result<ExtentId> {
        self.extents_of(key)
            .first()
            .copied()
            .ok_or_else(|| NtfsError::NotFound(format!("{} in record {}", key, self.number())))
    }

    fn primary_body(&self, key: &AttrKey) -> Result<&NonResidentBody> {
        self.attr(self.primary(key)?)?
            .non_resident_body()
            .ok_or_else(|| NtfsError::LogicalMisuse(format!("{} is resident", key)))
    }

    fn keys(&self) -> Vec<AttrKey> {
        self.live().map(|(_, e)| e.attr.key()).collect::<BTreeSet<_>>().into_iter().collect()
    }

    fn slot_extents(&self, slot: usize) -> Vec<ExtentId> {
        self.live().filter(|(_, e)| e.slot == slot).map(|(id, _)| id).collect()
    }

    fn slot_used(&self, slot: usize, record_size: usize) -> usize {
        let bytes = self.live().filter(|(_, e)| e.slot == slot).map(|(_, e)| e.attr.encoded_len()).sum();
        record::used_size(record_size, bytes)
    }

    // Attribute queries

    pub fn has_attribute(&self, key: &AttrKey) -> bool {
        self.live().any(|(_, e)| e.attr.matches(key))
    }

    pub fn attributes(&self) -> Vec<AttributeInfo> {
        let mut infos = Vec::new();
        for key in self.keys() {
            let ids = self.extents_of(&key);
            let Some(first) = ids.first().and_then(|id| self.attr(*id).ok()) else {
                continue;
            };
            let (length, allocated) = match &first.body {
                AttributeBody::Resident(r) => (r.data.len() as u64, r.data.len() as u64),
                AttributeBody::NonResident(nr) => (nr.data_size, nr.allocated_size),
            };
            let mut records: Vec<u64> = ids
                .iter()
                .filter_map(|id| self.extent(*id).ok())
                .map(|e| self.slots[e.slot].number)
                .collect();
            records.sort_by_key(|n| (*n != self.number(), *n));
            records.dedup();
            infos.push(AttributeInfo {
                key,
                resident: first.is_resident(),
                flags: first.flags,
                length,
                allocated,
                extents: ids.len(),
                records,
            });
        }
        infos
    }

    pub fn attribute_length(&self, key: &AttrKey) -> Result<u64> {
        match &self.attr(self.primary(key)?)?.body {
            AttributeBody::Resident(r) => Ok(r.data.len() as u64),
            AttributeBody::NonResident(nr) => Ok(nr.data_size),
        }
    }

    pub fn is_resident(&self, key: &AttrKey) -> Result<bool> {
        Ok(self.attr(self.primary(key)?)?.is_resident())
    }

    /// Value of a resident attribute.
    pub fn resident_value(&self, key: &AttrKey) -> Result<&[u8]> {
        self.attr(self.primary(key)?)?
            .resident_data()
            .ok_or_else(|| NtfsError::LogicalMisuse(format!("{} is not resident", key)))
    }

    pub(crate) fn set_resident_value(&mut self, key: &AttrKey, data: Vec<u8>) -> Result<()> {
        let id = self.primary(key)?;
        match &mut self.touch(id)?.body {
            AttributeBody::Resident(r) => {
                r.data = data;
                Ok(())
            }
            AttributeBody::NonResident(_) => Err(NtfsError::LogicalMisuse(format!("{} is not resident", key))),
        }
    }

    pub fn standard_information(&self) -> Result<StandardInformation> {
        StandardInformation::parse(self.resident_value(&AttrKey::unnamed(ATTR_TYPE_STANDARD_INFORMATION))?)
    }

    /// Every `$FILE_NAME` of the file (hard links and DOS names included).
    pub fn file_names(&self) -> Result<Vec<FileNameAttribute>> {
        self.live()
            .filter(|(_, e)| e.attr.type_code == ATTR_TYPE_FILE_NAME)
            .filter_map(|(_, e)| e.attr.resident_data())
            .map(FileNameAttribute::parse)
            .collect()
    }

    // Cluster streams

    fn stream_kind(&self, volume: &Volume, key: &AttrKey, attr: &AttributeRecord) -> Result<StreamKind> {
        let unit_shift = attr.non_resident_body().map(|nr| nr.compression_unit).unwrap_or(0);
        if attr.is_compressed() && unit_shift > 0 {
            if volume.cluster_size() > MAX_COMPRESSED_CLUSTER_SIZE as u64 {
                return Err(NtfsError::NotSupported(format!(
                    "compressed {} on a volume with {}-byte clusters",
                    key,
                    volume.cluster_size()
                )));
            }
            return Ok(StreamKind::Compressed {
                unit_shift,
                owner: (self.number(), key.type_code, key.name.clone()),
            });
        }
        if attr.is_sparse() {
            return Ok(StreamKind::Sparse);
        }
        Ok(StreamKind::Raw)
    }

    fn cooked_runs(&self, key: &AttrKey) -> Result<CookedRuns> {
        let mut runs = CookedRuns::new();
        for id in self.extents_of(key) {
            let body = self.attr(id)?.non_resident_body().ok_or_else(|| {
                NtfsError::FormatCorruption(format!("{} mixes resident and non-resident extents", key))
            })?;
            runs.append_extent(body.start_vcn, &body.runs, id)?;
        }
        Ok(runs)
    }

    fn open_buffer(&self, volume: &Volume, key: &AttrKey) -> Result<NonResidentBuffer> {
        let primary = self.primary(key)?;
        let attr = self.attr(primary)?;
        let body = attr
            .non_resident_body()
            .ok_or_else(|| NtfsError::LogicalMisuse(format!("{} is resident", key)))?;
        let kind = self.stream_kind(volume, key, attr)?;
        let runs = self.cooked_runs(key)?;
        Ok(NonResidentBuffer::new(
            kind,
            runs,
            volume.cluster_size(),
            primary,
            body.data_size,
            body.initialized_size,
        ))
    }

    /// Write a buffer's runs back into the extents they are tagged with.
    /// Secondary extents left without runs disappear.
    fn store_buffer(&mut self, volume: &Volume, key: &AttrKey, buffer: NonResidentBuffer) -> Result<()> {
        let cluster_size = volume.cluster_size();
        let ids = self.extents_of(key);
        let primary = self.primary(key)?;
        let (runs, data_size, initialized_size) = buffer.into_parts();
        for id in ids {
            let spans = runs.extent_spans(id);
            if spans.is_none() && id != primary {
                self.remove_extent(id);
                continue;
            }
            let body = self
                .touch(id)?
                .non_resident_body_mut()
                .ok_or_else(|| NtfsError::LogicalMisuse(format!("{} is resident", key)))?;
            match spans {
                Some((start, spans)) => {
                    body.start_vcn = start;
                    body.runs = spans;
                }
                None => {
                    body.start_vcn = 0;
                    body.runs.clear();
                }
            }
            if id == primary {
                body.allocated_size = runs.end_vcn() * cluster_size;
                body.data_size = data_size;
                body.initialized_size = initialized_size;
                body.compressed_size = runs.stored_clusters() * cluster_size;
            }
        }
        Ok(())
    }

    fn fits_resident(volume: &Volume, key: &AttrKey, length: u64) -> bool {
        let record_size = volume.record_size();
        match usize::try_from(length) {
            Ok(length) => {
                let encoded = align8(align8(RESIDENT_HEADER_SIZE + key.name.len() * 2) + length);
                record::used_size(record_size, encoded) <= record_size
            }
            Err(_) => false,
        }
    }

    // Data access

    pub fn read_attribute(&self, volume: &mut Volume, key: &AttrKey, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let attr = self.attr(self.primary(key)?)?;
        if let Some(data) = attr.resident_data() {
            if offset >= data.len() as u64 {
                return Ok(0);
            }
            let start = offset as usize;
            let n = buf.len().min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            return Ok(n);
        }
        let mut buffer = self.open_buffer(volume, key)?;
        buffer.read(volume, offset, buf)
    }

    pub fn read_all(&self, volume: &mut Volume, key: &AttrKey) -> Result<Vec<u8>> {
        let length = self.attribute_length(key)?;
        let length = usize::try_from(length)
            .map_err(|_| NtfsError::NotSupported(format!("{} of {} bytes does not fit in memory", key, length)))?;
        let mut data = vec![0u8; length];
        let n = self.read_attribute(volume, key, 0, &mut data)?;
        data.truncate(n);
        Ok(data)
    }

    pub fn write_attribute(&mut self, volume: &mut Volume, key: &AttrKey, offset: u64, data: &[u8]) -> Result<()> {
        in_transaction(volume, |volume| {
            self.write_data(volume, key, offset, data)?;
            if key.type_code == ATTR_TYPE_DATA {
                self.stamp_data_change(volume.transaction_time())?;
            }
            self.update_record_in_mft(volume)
        })
    }

    /// Write without resolving record overflow.
    pub(crate) fn write_data(&mut self, volume: &mut Volume, key: &AttrKey, offset: u64, data: &[u8]) -> Result<()> {
        let id = self.primary(key)?;
        if self.attr(id)?.is_resident() {
            let end = offset
                .checked_add(data.len() as u64)
                .ok_or_else(|| NtfsError::InvalidInput(format!("write at {} overflows", offset)))?;
            if Self::fits_resident(volume, key, end) || !can_be_non_resident(key.type_code) {
                if let AttributeBody::Resident(r) = &mut self.touch(id)?.body {
                    let end = end as usize;
                    if r.data.len() < end {
                        r.data.resize(end, 0);
                    }
                    r.data[offset as usize..end].copy_from_slice(data);
                }
                return Ok(());
            }
            self.convert_extent(volume, id)?;
        }
        let mut buffer = self.open_buffer(volume, key)?;
        let result = buffer.write(volume, offset, data);
        self.store_buffer(volume, key, buffer)?;
        result
    }

    pub fn set_attribute_length(&mut self, volume: &mut Volume, key: &AttrKey, length: u64) -> Result<()> {
        in_transaction(volume, |volume| {
            self.set_length_data(volume, key, length)?;
            if key.type_code == ATTR_TYPE_DATA {
                self.stamp_data_change(volume.transaction_time())?;
            }
            self.update_record_in_mft(volume)
        })
    }

    pub(crate) fn set_length_data(&mut self, volume: &mut Volume, key: &AttrKey, length: u64) -> Result<()> {
        let id = self.primary(key)?;
        if self.attr(id)?.is_resident() {
            if Self::fits_resident(volume, key, length) || !can_be_non_resident(key.type_code) {
                if let AttributeBody::Resident(r) = &mut self.touch(id)?.body {
                    r.data.resize(length as usize, 0);
                }
                return Ok(());
            }
            self.convert_extent(volume, id)?;
        }
        let mut buffer = self.open_buffer(volume, key)?;
        let result = buffer.set_length(volume, length);
        self.store_buffer(volume, key, buffer)?;
        result
    }

    pub fn convert_to_non_resident(&mut self, volume: &mut Volume, key: &AttrKey) -> Result<()> {
        in_transaction(volume, |volume| {
            let id = self.primary(key)?;
            self.convert_extent(volume, id)?;
            self.update_record_in_mft(volume)
        })
    }

    fn convert_extent(&mut self, volume: &mut Volume, id: ExtentId) -> Result<()> {
        let attr = self.attr(id)?;
        let key = attr.key();
        let flags = attr.flags;
        let data = attr
            .resident_data()
            .ok_or_else(|| NtfsError::LogicalMisuse(format!("{} is already non-resident", key)))?
            .to_vec();
        if !can_be_non_resident(key.type_code) {
            return Err(NtfsError::LogicalMisuse(format!("{} must stay resident", key)));
        }
        let compressed = flags & ATTR_FLAG_COMPRESSED != 0;
        if compressed && volume.cluster_size() > MAX_COMPRESSED_CLUSTER_SIZE as u64 {
            return Err(NtfsError::NotSupported(format!("compressed {} with large clusters", key)));
        }
        let unit = if compressed { DEFAULT_COMPRESSION_UNIT } else { 0 };
        self.touch(id)?.body = AttributeBody::NonResident(NonResidentBody::empty(unit));
        if !data.is_empty() {
            let mut buffer = self.open_buffer(volume, &key)?;
            let result = buffer.write(volume, 0, &data);
            self.store_buffer(volume, &key, buffer)?;
            result?;
        }
        debug!("Converted {} of record {} to non-resident ({} bytes)", key, self.number(), data.len());
        Ok(())
    }

    // Adding and removing attributes

    pub fn add_resident_attribute(&mut self, volume: &mut Volume, key: &AttrKey, data: Vec<u8>) -> Result<()> {
        in_transaction(volume, |volume| {
            self.insert_resident(key, data)?;
            self.update_record_in_mft(volume)
        })
    }

    pub fn add_non_resident_attribute(&mut self, volume: &mut Volume, key: &AttrKey, flags: u16) -> Result<()> {
        in_transaction(volume, |volume| {
            self.insert_non_resident(volume, key, flags)?;
            self.update_record_in_mft(volume)
        })
    }

    fn check_new(&self, key: &AttrKey) -> Result<()> {
        if key.type_code == ATTR_TYPE_ATTRIBUTE_LIST {
            return Err(NtfsError::LogicalMisuse("the attribute list is maintained internally".to_string()));
        }
        if self.has_attribute(key) {
            return Err(NtfsError::LogicalMisuse(format!("{} already exists in record {}", key, self.number())));
        }
        Ok(())
    }

    pub(crate) fn insert_resident(&mut self, key: &AttrKey, data: Vec<u8>) -> Result<ExtentId> {
        self.check_new(key)?;
        Ok(self.push_extent(0, AttributeRecord::resident(key.type_code, &key.name, data)))
    }

    pub(crate) fn insert_non_resident(&mut self, volume: &Volume, key: &AttrKey, flags: u16) -> Result<ExtentId> {
        self.check_new(key)?;
        if !can_be_non_resident(key.type_code) {
            return Err(NtfsError::LogicalMisuse(format!("{} cannot be non-resident", key)));
        }
        if flags & ATTR_FLAG_COMPRESSED != 0 && volume.cluster_size() > MAX_COMPRESSED_CLUSTER_SIZE as u64 {
            return Err(NtfsError::NotSupported(format!("compressed {} with large clusters", key)));
        }
        Ok(self.push_extent(0, AttributeRecord::non_resident(key.type_code, &key.name, flags)))
    }

    /// Add a `$FILE_NAME` and count the new link.
    pub fn add_file_name(&mut self, volume: &mut Volume, name: &FileNameAttribute) -> Result<()> {
        in_transaction(volume, |volume| {
            self.push_extent(0, AttributeRecord::resident(ATTR_TYPE_FILE_NAME, &[], name.to_bytes()));
            self.slots[0].header.link_count += 1;
            self.update_record_in_mft(volume)
        })
    }

    /// Drop the `$FILE_NAME` linking this file into `parent` under `name`.
    pub fn remove_file_name(&mut self, volume: &mut Volume, parent: FileReference, name: &[u16]) -> Result<()> {
        let target = self
            .live()
            .filter(|(_, e)| e.attr.type_code == ATTR_TYPE_FILE_NAME)
            .find(|(_, e)| {
                e.attr
                    .resident_data()
                    .and_then(|d| FileNameAttribute::parse(d).ok())
                    .map(|f| f.parent == parent && f.name == name)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id)
            .ok_or_else(|| {
                NtfsError::NotFound(format!("name {} under {} in record {}", from_utf16(name), parent, self.number()))
            })?;
        in_transaction(volume, |volume| {
            self.remove_extent(target);
            self.slots[0].header.link_count = self.slots[0].header.link_count.saturating_sub(1);
            self.slots[0].dirty = true;
            self.update_record_in_mft(volume)
        })
    }

    pub fn remove_attribute(&mut self, volume: &mut Volume, key: &AttrKey) -> Result<()> {
        if key.type_code == ATTR_TYPE_ATTRIBUTE_LIST {
            return Err(NtfsError::LogicalMisuse("the attribute list is maintained internally".to_string()));
        }
        if !self.has_attribute(key) {
            return Err(NtfsError::LogicalMisuse(format!("no {} to remove in record {}", key, self.number())));
        }
        in_transaction(volume, |volume| {
            self.drop_attribute(volume, key)?;
            self.update_record_in_mft(volume)
        })
    }

    /// Truncate to zero, then forget every extent of the attribute.
    pub(crate) fn drop_attribute(&mut self, volume: &mut Volume, key: &AttrKey) -> Result<()> {
        let Some(&primary) = self.extents_of(key).first() else {
            return Ok(());
        };
        if !self.attr(primary)?.is_resident() {
            let mut buffer = self.open_buffer(volume, key)?;
            let result = buffer.set_length(volume, 0);
            self.store_buffer(volume, key, buffer)?;
            result?;
        }
        for id in self.extents_of(key) {
            self.remove_extent(id);
        }
        trace!("Removed {} from record {}", key, self.number());
        Ok(())
    }

    // Sparse and compressed flags

    fn set_flag(&mut self, key: &AttrKey, flag: u16, on: bool) -> Result<()> {
        for id in self.extents_of(key) {
            let attr = self.touch(id)?;
            if on {
                attr.flags |= flag;
            } else {
                attr.flags &= !flag;
            }
        }
        Ok(())
    }

    /// Mark an attribute sparse (clears may release clusters) or dense again,
    /// in which case every hole gets backed by zeroed clusters.
    pub fn set_sparse(&mut self, volume: &mut Volume, key: &AttrKey, sparse: bool) -> Result<()> {
        in_transaction(volume, |volume| {
            let id = self.primary(key)?;
            if self.attr(id)?.is_resident() {
                if !sparse {
                    return Ok(());
                }
                self.convert_extent(volume, id)?;
            }
            let attr = self.attr(id)?;
            if attr.is_sparse() == sparse {
                return Ok(());
            }
            if sparse || attr.is_compressed() {
                self.set_flag(key, ATTR_FLAG_SPARSE, sparse)?;
            } else {
                let data = self.read_all(volume, key)?;
                self.set_length_data(volume, key, 0)?;
                self.set_flag(key, ATTR_FLAG_SPARSE, false)?;
                self.write_data(volume, key, 0, &data)?;
            }
            self.set_file_attribute(FILE_ATTRIBUTE_SPARSE_FILE, sparse)?;
            debug!("{} of record {} is now {}", key, self.number(), if sparse { "sparse" } else { "dense" });
            self.update_record_in_mft(volume)
        })
    }

    /// Switch an attribute to or from compressed storage, rewriting its data.
    pub fn set_compressed(&mut self, volume: &mut Volume, key: &AttrKey, compressed: bool) -> Result<()> {
        if compressed && volume.cluster_size() > MAX_COMPRESSED_CLUSTER_SIZE as u64 {
            return Err(NtfsError::NotSupported(format!(
                "compression needs clusters of at most {} bytes",
                MAX_COMPRESSED_CLUSTER_SIZE
            )));
        }
        in_transaction(volume, |volume| {
            let id = self.primary(key)?;
            let resident = self.attr(id)?.is_resident();
            if resident && !compressed {
                return Ok(());
            }
            if !resident && self.attr(id)?.is_compressed() == compressed {
                return Ok(());
            }
            let data = self.read_all(volume, key)?;
            self.set_length_data(volume, key, 0)?;
            let id = self.primary(key)?;
            if self.attr(id)?.is_resident() {
                self.convert_extent(volume, id)?;
            }
            self.set_flag(key, ATTR_FLAG_COMPRESSED, compressed)?;
            if let Some(body) = self.touch(id)?.non_resident_body_mut() {
                body.compression_unit = if compressed { DEFAULT_COMPRESSION_UNIT } else { 0 };
            }
            if !data.is_empty() {
                self.write_data(volume, key, 0, &data)?;
            }
            self.set_file_attribute(FILE_ATTRIBUTE_COMPRESSED, compressed)?;
            debug!(
                "{} of record {} rewritten {} ({} bytes)",
                key,
                self.number(),
                if compressed { "compressed" } else { "uncompressed" },
                data.len()
            );
            self.update_record_in_mft(volume)
        })
    }

    // Cluster maps

    /// Physical `(lcn, length)` ranges of an attribute, empty when resident.
    pub fn cluster_ranges(&self, key: &AttrKey) -> Result<Vec<(u64, u64)>> {
        if self.is_resident(key)? {
            return Ok(Vec::new());
        }
        Ok(self.cooked_runs(key)?.cluster_ranges())
    }

    pub fn all_cluster_ranges(&self) -> Result<Vec<(AttrKey, Vec<(u64, u64)>)>> {
        let mut all = Vec::new();
        for key in self.keys() {
            let ranges = self.cluster_ranges(&key)?;
            if !ranges.is_empty() {
                all.push((key, ranges));
            }
        }
        Ok(all)
    }

    pub fn is_cluster_stored(&self, key: &AttrKey, vcn: u64) -> Result<bool> {
        if self.is_resident(key)? {
            return Ok(false);
        }
        Ok(self.cooked_runs(key)?.is_stored(vcn))
    }

    pub fn stored_clusters(&self, key: &AttrKey) -> Result<u64> {
        if self.is_resident(key)? {
            return Ok(0);
        }
        Ok(self.cooked_runs(key)?.stored_clusters())
    }

    // Timestamps

    fn update_standard_information(&mut self, f: impl FnOnce(&mut StandardInformation)) -> Result<()> {
        let key = AttrKey::unnamed(ATTR_TYPE_STANDARD_INFORMATION);
        if !self.has_attribute(&key) {
            return Ok(());
        }
        let mut si = StandardInformation::parse(self.resident_value(&key)?)?;
        let before = si.clone();
        f(&mut si);
        if si != before {
            self.set_resident_value(&key, si.to_bytes())?;
        }
        Ok(())
    }

    fn stamp_data_change(&mut self, now: u64) -> Result<()> {
        self.update_standard_information(|si| si.modification_time = now)
    }

    fn set_file_attribute(&mut self, bit: u32, on: bool) -> Result<()> {
        self.update_standard_information(|si| {
            if on {
                si.file_attributes |= bit;
            } else {
                si.file_attributes &= !bit;
            }
        })
    }

    // Record overflow

    /// Bring every record of the file within the record size, keep the
    /// attribute list in step, and write whatever changed.
    pub fn update_record_in_mft(&mut self, volume: &mut Volume) -> Result<()> {
        let record_size = volume.record_size();
        let now = volume.transaction_time();
        self.update_standard_information(|si| si.mft_modification_time = now)?;

        let mut rounds = 0;
        loop {
            self.sync_attribute_list(volume)?;
            let Some(slot) = (0..self.slots.len())
                .find(|&s| self.slots[s].live && self.slot_used(s, record_size) > record_size)
            else {
                break;
            };
            rounds += 1;
            if rounds > MAX_OVERFLOW_ROUNDS {
                return Err(NtfsError::FormatCorruption(format!(
                    "record {} overflow did not settle after {} rounds",
                    self.number(),
                    MAX_OVERFLOW_ROUNDS
                )));
            }
            let progressed = self.try_convert(volume, slot)?
                || self.try_shrink_index_root(volume, slot)?
                || self.try_split(volume, slot)?
                || self.try_expel(volume, slot)?;
            if !progressed {
                return Err(NtfsError::FormatCorruption(format!(
                    "record {} needs {} of {} bytes and nothing can move out",
                    self.slots[slot].number,
                    self.slot_used(slot, record_size),
                    record_size
                )));
            }
        }
        self.release_empty_secondaries(volume)?;
        self.sync_attribute_list(volume)?;
        self.flush(volume)
    }

    /// Move the resident attribute whose conversion saves the most bytes.
    fn try_convert(&mut self, volume: &mut Volume, slot: usize) -> Result<bool> {
        let cluster_size = volume.cluster_size();
        let compression_ok = cluster_size <= MAX_COMPRESSED_CLUSTER_SIZE as u64;
        let best = self
            .slot_extents(slot)
            .into_iter()
            .filter_map(|id| {
                let attr = self.attr(id).ok()?;
                let data = attr.resident_data()?;
                if !can_be_non_resident(attr.type_code) || (attr.is_compressed() && !compression_ok) {
                    return None;
                }
                let clusters = (data.len() as u64 + cluster_size - 1) / cluster_size;
                let saving = attr.encoded_len() as i64 - attr.non_resident_len_estimate(clusters) as i64;
                (saving > 0).then_some((saving, id))
            })
            .max_by_key(|(saving, id)| (*saving, std::cmp::Reverse(*id)));
        match best {
            Some((_, id)) => {
                self.convert_extent(volume, id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn try_shrink_index_root(&mut self, volume: &mut Volume, slot: usize) -> Result<bool> {
        let names: Vec<Vec<u16>> = self
            .slot_extents(slot)
            .into_iter()
            .filter_map(|id| self.attr(id).ok())
            .filter(|a| a.type_code == ATTR_TYPE_INDEX_ROOT)
            .map(|a| a.name.clone())
            .collect();
        for name in names {
            if Index::open(volume, self, &name)?.depose_root()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// A record holding one oversized run list keeps the longest prefix of
    /// runs that fits; the rest becomes a new extent elsewhere.
    fn try_split(&mut self, volume: &mut Volume, slot: usize) -> Result<bool> {
        let ids = self.slot_extents(slot);
        let &[id] = ids.as_slice() else {
            return Ok(false);
        };
        let attr = self.attr(id)?.clone();
        let Some(body) = attr.non_resident_body() else {
            return Ok(false);
        };
        if body.runs.len() < 2 {
            return Ok(false);
        }
        let record_size = volume.record_size();
        let room = record_size - record::used_size(record_size, 0);
        let mut keep = body.runs.len() - 1;
        while keep > 0 {
            let mut probe = attr.clone();
            if let Some(b) = probe.non_resident_body_mut() {
                b.runs.truncate(keep);
            }
            if probe.encoded_len() <= room {
                break;
            }
            keep -= 1;
        }
        if keep == 0 {
            return Ok(false);
        }

        let tail_runs = body.runs[keep..].to_vec();
        let tail_start = body.start_vcn + body.runs[..keep].iter().map(|r| r.length).sum::<u64>();
        if let Some(b) = self.touch(id)?.non_resident_body_mut() {
            b.runs.truncate(keep);
        }
        let tail = AttributeRecord {
            type_code: attr.type_code,
            name: attr.name.clone(),
            flags: attr.flags,
            id: 0,
            body: AttributeBody::NonResident(NonResidentBody {
                start_vcn: tail_start,
                runs: tail_runs,
                ..NonResidentBody::empty(body.compression_unit)
            }),
        };
        let home = self.find_home(volume, tail.encoded_len(), slot)?;
        self.push_extent(home, tail);
        debug!(
            "Split {} of record {}: runs from VCN {} moved to record {}",
            attr.key(),
            self.number(),
            tail_start,
            self.slots[home].number
        );
        Ok(true)
    }

    /// Move the least important attribute (highest type, then largest) out
    /// of an overflowing record.
    fn try_expel(&mut self, volume: &mut Volume, slot: usize) -> Result<bool> {
        let ids = self.slot_extents(slot);
        if slot != 0 && ids.len() < 2 {
            return Ok(false);
        }
        let victim = ids
            .into_iter()
            .filter_map(|id| self.attr(id).ok().map(|a| (id, a)))
            .filter(|(_, a)| a.type_code != ATTR_TYPE_ATTRIBUTE_LIST && (slot != 0 || can_be_expelled(a.type_code)))
            .max_by_key(|(_, a)| (a.type_code, a.encoded_len()))
            .map(|(id, a)| (id, a.encoded_len(), a.key()));
        let Some((id, length, key)) = victim else {
            return Ok(false);
        };
        let home = self.find_home(volume, length, slot)?;
        let new_id = self.slots[home].header.take_attribute_id();
        self.slots[home].dirty = true;
        self.slots[slot].dirty = true;
        if let Some(extent) = self.extents.get_mut(id.0).and_then(Option::as_mut) {
            extent.slot = home;
            extent.attr.id = new_id;
        }
        debug!(
            "Moved {} from record {} to record {}",
            key, self.slots[slot].number, self.slots[home].number
        );
        Ok(true)
    }

    /// A secondary record (other than `exclude`) with room for `length`
    /// bytes, or a newly allocated one.
    fn find_home(&mut self, volume: &mut Volume, length: usize, exclude: usize) -> Result<usize> {
        let record_size = volume.record_size();
        let existing = (1..self.slots.len()).find(|&s| {
            s != exclude && self.slots[s].live && self.slot_used(s, record_size) + length <= record_size
        });
        if let Some(slot) = existing {
            return Ok(slot);
        }
        let mut record = volume.allocate_record()?;
        record.header.base_reference = self.reference();
        self.slots.push(RecordSlot { number: record.number, header: record.header, live: true, dirty: true });
        debug!("Record {} extended into record {}", self.number(), record.number);
        Ok(self.slots.len() - 1)
    }

    fn release_empty_secondaries(&mut self, volume: &mut Volume) -> Result<()> {
        for slot in 1..self.slots.len() {
            if self.slots[slot].live && self.slot_extents(slot).is_empty() {
                volume.free_record(self.slots[slot].number)?;
                self.slots[slot].live = false;
                self.slots[slot].dirty = false;
                debug!("Released empty secondary record {} of record {}", self.slots[slot].number, self.number());
            }
        }
        Ok(())
    }

    /// Regenerate the attribute list from the arena. It exists exactly when
    /// the file uses more than one record and never lists itself.
    fn sync_attribute_list(&mut self, volume: &mut Volume) -> Result<()> {
        let list_key = AttrKey::unnamed(ATTR_TYPE_ATTRIBUTE_LIST);
        let present = self.has_attribute(&list_key);
        if !self.live().any(|(_, e)| e.slot != 0) {
            if present {
                self.drop_attribute(volume, &list_key)?;
                debug!("Record {} fits in one record again, attribute list removed", self.number());
            }
            return Ok(());
        }
        let entries: Vec<AttributeListEntry> = self
            .live()
            .filter(|(_, e)| !e.attr.matches(&list_key))
            .map(|(_, e)| AttributeListEntry {
                type_code: e.attr.type_code,
                name: e.attr.name.clone(),
                start_vcn: e.attr.lowest_vcn(),
                reference: self.slots[e.slot].reference(),
                attribute_id: e.attr.id,
            })
            .collect();
        let bytes = encode_attribute_list(&entries);
        if !present {
            if self.number() == MFT_RECORD_MFT {
                return Err(NtfsError::NotSupported("$MFT with an attribute list".to_string()));
            }
            self.push_extent(0, AttributeRecord::resident(ATTR_TYPE_ATTRIBUTE_LIST, &[], bytes));
            info!("Record {} spans {} records, attribute list created", self.number(), self.record_numbers().len());
            return Ok(());
        }
        if self.read_all(volume, &list_key)? != bytes {
            self.set_length_data(volume, &list_key, bytes.len() as u64)?;
            self.write_data(volume, &list_key, 0, &bytes)?;
        }
        Ok(())
    }

    fn flush(&mut self, volume: &mut Volume) -> Result<()> {
        // Secondary records first so the base never lists an unwritten record
        let order: Vec<usize> = (1..self.slots.len()).chain(std::iter::once(0)).collect();
        for slot in order {
            if !self.slots[slot].live || !self.slots[slot].dirty {
                continue;
            }
            let attributes = self
                .live()
                .filter(|(_, e)| e.slot == slot)
                .map(|(_, e)| e.attr.clone())
                .collect();
            let mut record = FileRecord {
                number: self.slots[slot].number,
                header: self.slots[slot].header.clone(),
                attributes,
            };
            volume.write_record(&mut record)?;
            self.slots[slot].header.usn = record.header.usn;
            self.slots[slot].dirty = false;
        }
        Ok(())
    }

    /// Release every cluster and every record of the file.
    pub fn delete(mut self, volume: &mut Volume) -> Result<()> {
        in_transaction(volume, |volume| {
            let list_key = AttrKey::unnamed(ATTR_TYPE_ATTRIBUTE_LIST);
            for key in self.keys().into_iter().filter(|k| *k != list_key) {
                self.drop_attribute(volume, &key)?;
            }
            self.drop_attribute(volume, &list_key)?;
            for slot in (0..self.slots.len()).rev() {
                if self.slots[slot].live {
                    volume.free_record(self.slots[slot].number)?;
                    self.slots[slot].live = false;
                }
            }
            info!("Deleted record {}", self.number());
            Ok(())
        })
    }
}
