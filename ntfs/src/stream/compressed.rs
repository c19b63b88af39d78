// Compressed cluster stream
// Clusters are grouped into compression units (16 clusters by default).
// A unit whose clusters are all stored is plain data, one with a stored
// prefix holds compressed bytes, and one with nothing stored reads as zeros

use super::{ClusterStream, RawStream};
use crate::compression::CompressionOutcome;
use crate::cooked_runs::{CookedRuns, ExtentId};
use crate::volume::{UnitKey, Volume};
use log::trace;
use ntfsrw_core::{NtfsError, Result};

#[derive(Debug, Clone)]
pub struct CompressedStream {
    inner: RawStream,
    cluster_size: u64,
    unit_clusters: u64,
    owner: (u64, u32, Vec<u16>),
}

impl CompressedStream {
    pub fn new(runs: CookedRuns, cluster_size: u64, unit_shift: u8, owner: (u64, u32, Vec<u16>)) -> Self {
        Self {
            inner: RawStream::new(runs, cluster_size),
            cluster_size,
            unit_clusters: 1 << unit_shift,
            owner,
        }
    }

    fn unit_key(&self, unit: u64) -> UnitKey {
        (self.owner.0, self.owner.1, self.owner.2.clone(), unit)
    }

    /// First VCN and cluster count of a unit; the last unit may be short.
    fn unit_span(&self, unit: u64) -> (u64, u64) {
        let first = unit * self.unit_clusters;
        let end = (first + self.unit_clusters).min(self.inner.runs().end_vcn());
        (first, end.saturating_sub(first))
    }

    /// Stored clusters of a unit.
    pub fn stored_in_unit(&self, unit: u64) -> u64 {
        let (first, len) = self.unit_span(unit);
        (first..first + len).filter(|&vcn| self.inner.is_cluster_stored(vcn)).count() as u64
    }

    fn read_unit(&mut self, volume: &mut Volume, unit: u64) -> Result<Vec<u8>> {
        let key = self.unit_key(unit);
        if let Some(plaintext) = volume.cached_unit(&key) {
            return Ok(plaintext);
        }
        let (first, len) = self.unit_span(unit);
        let unit_bytes = (len * self.cluster_size) as usize;
        let stored = self.stored_in_unit(unit);

        let plaintext = if stored == len {
            let mut data = vec![0u8; unit_bytes];
            self.inner.read_clusters(volume, first, len, &mut data)?;
            data
        } else if stored == 0 {
            vec![0u8; unit_bytes]
        } else {
            let prefix = (first..first + len)
                .take_while(|&vcn| self.inner.is_cluster_stored(vcn))
                .count() as u64;
            if prefix != stored {
                return Err(NtfsError::FormatCorruption(format!(
                    "compression unit {} has a hole inside its compressed data",
                    unit
                )));
            }
            let mut raw = vec![0u8; (prefix * self.cluster_size) as usize];
            self.inner.read_clusters(volume, first, prefix, &mut raw)?;
            volume.compressor().decompress(&raw, unit_bytes)?
        };
        volume.cache_unit(key, plaintext.clone());
        Ok(plaintext)
    }

    fn write_unit(&mut self, volume: &mut Volume, unit: u64, plaintext: Vec<u8>) -> Result<i64> {
        let (first, len) = self.unit_span(unit);
        let (outcome, compressed) = volume.compressor().compress(&plaintext)?;
        let needed = (compressed.len() as u64 + self.cluster_size - 1) / self.cluster_size;

        let delta = match outcome {
            CompressionOutcome::AllZeros => -(self.inner.release(volume, first, len)? as i64),
            CompressionOutcome::Compressed if needed < len => {
                let mut padded = compressed;
                padded.resize((needed * self.cluster_size) as usize, 0);
                let released = self.inner.release(volume, first + needed, len - needed)? as i64;
                let allocated = self.inner.write_clusters(volume, first, needed, &padded)?;
                allocated - released
            }
            _ => self.inner.write_clusters(volume, first, len, &plaintext)?,
        };
        trace!(
            "Compression unit {} written as {:?} ({} of {} clusters, delta {})",
            unit,
            outcome,
            self.stored_in_unit(unit),
            len,
            delta
        );
        let key = self.unit_key(unit);
        volume.cache_unit(key, plaintext);
        Ok(delta)
    }

    fn units_in(&self, vcn: u64, count: u64) -> std::ops::Range<u64> {
        vcn / self.unit_clusters..(vcn + count + self.unit_clusters - 1) / self.unit_clusters
    }

    fn check_range(&self, vcn: u64, count: u64, buf_len: usize) -> Result<()> {
        if vcn + count > self.inner.runs().end_vcn() || buf_len as u64 != count * self.cluster_size {
            return Err(NtfsError::InvalidInput(format!(
                "{} bytes for clusters {}..{} of a {}-cluster stream",
                buf_len,
                vcn,
                vcn + count,
                self.inner.runs().end_vcn()
            )));
        }
        Ok(())
    }
}

impl ClusterStream for CompressedStream {
    fn read_clusters(&mut self, volume: &mut Volume, vcn: u64, count: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(vcn, count, buf.len())?;
        let cs = self.cluster_size;
        for unit in self.units_in(vcn, count) {
            let (first, len) = self.unit_span(unit);
            let from = vcn.max(first);
            let to = (vcn + count).min(first + len);
            let plaintext = self.read_unit(volume, unit)?;
            let src = ((from - first) * cs) as usize..((to - first) * cs) as usize;
            let dst = ((from - vcn) * cs) as usize;
            buf[dst..dst + src.len()].copy_from_slice(&plaintext[src]);
        }
        Ok(())
    }

    fn write_clusters(&mut self, volume: &mut Volume, vcn: u64, count: u64, data: &[u8]) -> Result<i64> {
        self.check_range(vcn, count, data.len())?;
        let cs = self.cluster_size;
        let mut delta = 0;
        for unit in self.units_in(vcn, count) {
            let (first, len) = self.unit_span(unit);
            let from = vcn.max(first);
            let to = (vcn + count).min(first + len);
            let src = ((from - vcn) * cs) as usize..((to - vcn) * cs) as usize;
            let plaintext = if from == first && to == first + len {
                data[src].to_vec()
            } else {
                let mut plaintext = self.read_unit(volume, unit)?;
                let dst = ((from - first) * cs) as usize;
                plaintext[dst..dst + src.len()].copy_from_slice(&data[src]);
                plaintext
            };
            delta += self.write_unit(volume, unit, plaintext)?;
        }
        Ok(delta)
    }

    fn clear_clusters(&mut self, volume: &mut Volume, vcn: u64, count: u64) -> Result<i64> {
        if vcn + count > self.inner.runs().end_vcn() {
            return Err(NtfsError::InvalidInput(format!(
                "clear of clusters {}..{} beyond the stream",
                vcn,
                vcn + count
            )));
        }
        let cs = self.cluster_size;
        let mut delta = 0;
        for unit in self.units_in(vcn, count) {
            let (first, len) = self.unit_span(unit);
            let from = vcn.max(first);
            let to = (vcn + count).min(first + len);
            if from == first && to == first + len {
                delta -= self.inner.release(volume, first, len)? as i64;
                let key = self.unit_key(unit);
                volume.cache_unit(key, vec![0u8; (len * cs) as usize]);
            } else {
                let mut plaintext = self.read_unit(volume, unit)?;
                plaintext[((from - first) * cs) as usize..((to - first) * cs) as usize].fill(0);
                delta += self.write_unit(volume, unit, plaintext)?;
            }
        }
        Ok(delta)
    }

    fn is_cluster_stored(&self, vcn: u64) -> bool {
        self.inner.is_cluster_stored(vcn)
    }

    fn truncate_to_clusters(&mut self, volume: &mut Volume, clusters: u64) -> Result<i64> {
        let units = (clusters + self.unit_clusters - 1) / self.unit_clusters;
        volume.invalidate_units(self.owner.0, self.owner.1, &self.owner.2);
        self.inner.truncate_to_clusters(volume, units * self.unit_clusters)
    }

    fn expand_to_clusters(&mut self, volume: &mut Volume, clusters: u64, extent: ExtentId, _allocate: bool) -> Result<i64> {
        // Units get their clusters when first written
        self.inner.expand_to_clusters(volume, clusters, extent, false)
    }

    fn runs(&self) -> &CookedRuns {
        self.inner.runs()
    }

    fn runs_mut(&mut self) -> &mut CookedRuns {
        self.inner.runs_mut()
    }

    fn into_runs(self: Box<Self>) -> CookedRuns {
        Box::new(self.inner).into_runs()
    }
}
