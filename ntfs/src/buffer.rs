// Byte-addressed access to a non-resident attribute over its cluster stream
// Bytes at or past the initialized size read as zeros and are zero-filled on
// disk only when a later write lands beyond them

use crate::cooked_runs::{CookedRuns, ExtentId};
use crate::stream::{ClusterStream, StreamKind};
use crate::volume::Volume;
use log::trace;
use ntfsrw_core::Result;

pub struct NonResidentBuffer {
    stream: Box<dyn ClusterStream>,
    kind: StreamKind,
    cluster_size: u64,
    primary: ExtentId,
    data_size: u64,
    initialized_size: u64,
}

impl NonResidentBuffer {
    pub fn new(
        kind: StreamKind,
        runs: CookedRuns,
        cluster_size: u64,
        primary: ExtentId,
        data_size: u64,
        initialized_size: u64,
    ) -> Self {
        let stream = kind.open(runs, cluster_size);
        Self {
            stream,
            kind,
            cluster_size,
            primary,
            data_size,
            initialized_size: initialized_size.min(data_size),
        }
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn initialized_size(&self) -> u64 {
        self.initialized_size
    }

    pub fn allocated_clusters(&self) -> u64 {
        self.stream.runs().end_vcn()
    }

    pub fn is_cluster_stored(&self, vcn: u64) -> bool {
        self.stream.is_cluster_stored(vcn)
    }

    pub fn runs(&self) -> &CookedRuns {
        self.stream.runs()
    }

    /// Runs plus (data size, initialized size).
    pub fn into_parts(self) -> (CookedRuns, u64, u64) {
        (self.stream.into_runs(), self.data_size, self.initialized_size)
    }

    /// Clusters needed to hold `bytes`, rounded to whole compression units.
    fn clusters_for(&self, bytes: u64) -> u64 {
        let granule = self.kind.granule();
        let clusters = (bytes + self.cluster_size - 1) / self.cluster_size;
        (clusters + granule - 1) / granule * granule
    }

    // New runs extend whichever extent currently maps the end of the stream
    fn tail_extent(&self) -> ExtentId {
        self.stream.runs().last_extent().unwrap_or(self.primary)
    }

    fn ensure_clusters(&mut self, volume: &mut Volume, bytes: u64) -> Result<()> {
        let needed = self.clusters_for(bytes);
        if needed > self.allocated_clusters() {
            let tail = self.tail_extent();
            let allocate = self.kind == StreamKind::Raw;
            self.stream.expand_to_clusters(volume, needed, tail, allocate)?;
        }
        Ok(())
    }

    pub fn read(&mut self, volume: &mut Volume, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.data_size || buf.is_empty() {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(self.data_size - offset) as usize;
        let readable_end = (offset + len as u64).min(self.initialized_size);
        if offset >= readable_end {
            buf[..len].fill(0);
            return Ok(len);
        }

        let cs = self.cluster_size;
        let first = offset / cs;
        let last = (readable_end + cs - 1) / cs;
        let mut clusters = vec![0u8; ((last - first) * cs) as usize];
        self.stream.read_clusters(volume, first, last - first, &mut clusters)?;
        let skip = (offset - first * cs) as usize;
        let n = (readable_end - offset) as usize;
        buf[..n].copy_from_slice(&clusters[skip..skip + n]);
        buf[n..len].fill(0);
        Ok(len)
    }

    pub fn write(&mut self, volume: &mut Volume, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let cs = self.cluster_size;
        let end = offset + data.len() as u64;
        self.ensure_clusters(volume, end)?;
        if offset > self.initialized_size {
            self.zero_gap(volume, self.initialized_size, offset)?;
        }

        let first = offset / cs;
        let last = (end + cs - 1) / cs;
        let count = last - first;
        let mut clusters = vec![0u8; (count * cs) as usize];
        let base = first * cs;
        // Only the boundary clusters carry bytes that must survive
        if offset % cs != 0 {
            self.stream.read_clusters(volume, first, 1, &mut clusters[..cs as usize])?;
        }
        if end % cs != 0 && (last - 1 != first || offset % cs == 0) {
            let at = ((count - 1) * cs) as usize;
            self.stream.read_clusters(volume, last - 1, 1, &mut clusters[at..])?;
        }
        if self.initialized_size < base + clusters.len() as u64 {
            let from = self.initialized_size.saturating_sub(base) as usize;
            clusters[from..].fill(0);
        }
        let at = (offset - base) as usize;
        clusters[at..at + data.len()].copy_from_slice(data);
        let delta = self.stream.write_clusters(volume, first, count, &clusters)?;

        self.initialized_size = self.initialized_size.max(end);
        self.data_size = self.data_size.max(end);
        self.stream.runs_mut().collapse();
        trace!(
            "Wrote {} bytes at {} (clusters {}..{}, stored delta {})",
            data.len(),
            offset,
            first,
            last,
            delta
        );
        Ok(())
    }

    /// Put zeros on disk for `from..to`, which ends where a write begins.
    /// The cluster holding `to` is left to that write.
    fn zero_gap(&mut self, volume: &mut Volume, from: u64, to: u64) -> Result<()> {
        let cs = self.cluster_size;
        let write_first = to / cs;
        let mut full_start = (from + cs - 1) / cs;
        let head = from / cs;
        if from % cs != 0 && head < write_first {
            let compressed = matches!(self.kind, StreamKind::Compressed { .. });
            if compressed || self.stream.is_cluster_stored(head) {
                let mut cluster = vec![0u8; cs as usize];
                self.stream.read_clusters(volume, head, 1, &mut cluster)?;
                cluster[(from % cs) as usize..].fill(0);
                self.stream.write_clusters(volume, head, 1, &cluster)?;
            }
            full_start = head + 1;
        }
        if full_start < write_first {
            self.stream.clear_clusters(volume, full_start, write_first - full_start)?;
        }
        Ok(())
    }

    pub fn set_length(&mut self, volume: &mut Volume, length: u64) -> Result<()> {
        if length > self.data_size {
            self.ensure_clusters(volume, length)?;
        } else if length < self.data_size {
            let keep = self.clusters_for(length);
            self.stream.truncate_to_clusters(volume, keep)?;
            self.initialized_size = self.initialized_size.min(length);
        }
        self.data_size = length;
        self.stream.runs_mut().collapse();
        Ok(())
    }
}
