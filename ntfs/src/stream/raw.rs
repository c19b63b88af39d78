// Raw cluster stream: each VCN maps 1:1 to an LCN through the cooked runs
// Holes read as zeros and get backing clusters allocated on first write

use super::ClusterStream;
use crate::cooked_runs::{CookedRun, CookedRuns, ExtentId};
use crate::volume::Volume;
use log::trace;
use ntfsrw_core::{NtfsError, Result};

#[derive(Debug, Clone)]
pub struct RawStream {
    runs: CookedRuns,
    cluster_size: u64,
}

impl RawStream {
    pub fn new(runs: CookedRuns, cluster_size: u64) -> Self {
        Self { runs, cluster_size }
    }

    fn check_range(&self, vcn: u64, count: u64, buf_len: usize) -> Result<()> {
        if vcn + count > self.runs.end_vcn() {
            return Err(NtfsError::InvalidInput(format!(
                "clusters {}..{} beyond a stream of {} clusters",
                vcn,
                vcn + count,
                self.runs.end_vcn()
            )));
        }
        if buf_len as u64 != count * self.cluster_size {
            return Err(NtfsError::InvalidInput(format!(
                "buffer of {} bytes for {} clusters",
                buf_len, count
            )));
        }
        Ok(())
    }

    /// Back every hole in the range with freshly allocated clusters, placed
    /// right after the previous run where possible. Returns clusters allocated.
    pub(crate) fn fill_holes(&mut self, volume: &mut Volume, vcn: u64, count: u64) -> Result<u64> {
        let holes: Vec<CookedRun> = self
            .runs
            .pieces(vcn, count)
            .into_iter()
            .filter(|p| p.is_sparse())
            .collect();
        let mut allocated = 0;
        for hole in holes {
            let near = self.runs.lcn_hint_before(hole.vcn);
            let ranges = volume.allocate_clusters(hole.length, near)?;
            let mut replacement = Vec::with_capacity(ranges.len());
            let mut at = hole.vcn;
            for range in ranges {
                let length = range.end - range.start;
                replacement.push(CookedRun { vcn: at, lcn: Some(range.start), length, extent: hole.extent });
                at += length;
            }
            self.runs.replace_range(hole.vcn, hole.length, replacement)?;
            allocated += hole.length;
            trace!("Filled hole at VCN {} ({} clusters)", hole.vcn, hole.length);
        }
        Ok(allocated)
    }

    /// Give the stored clusters of the range back to the volume, leaving
    /// holes. Returns clusters released.
    pub(crate) fn release(&mut self, volume: &mut Volume, vcn: u64, count: u64) -> Result<u64> {
        let stored: Vec<CookedRun> = self
            .runs
            .pieces(vcn, count)
            .into_iter()
            .filter(|p| !p.is_sparse())
            .collect();
        let mut released = 0;
        for piece in stored {
            if let Some(lcn) = piece.lcn {
                volume.free_cluster_range(lcn..lcn + piece.length)?;
            }
            let hole = CookedRun { lcn: None, ..piece };
            self.runs.replace_range(piece.vcn, piece.length, vec![hole])?;
            released += piece.length;
        }
        Ok(released)
    }
}

impl ClusterStream for RawStream {
    fn read_clusters(&mut self, volume: &mut Volume, vcn: u64, count: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(vcn, count, buf.len())?;
        let cluster_size = self.cluster_size;
        for piece in self.runs.pieces(vcn, count) {
            let at = ((piece.vcn - vcn) * cluster_size) as usize;
            let len = (piece.length * cluster_size) as usize;
            match piece.lcn {
                Some(lcn) => volume.read_clusters(lcn, &mut buf[at..at + len])?,
                None => buf[at..at + len].fill(0),
            }
        }
        Ok(())
    }

    fn write_clusters(&mut self, volume: &mut Volume, vcn: u64, count: u64, data: &[u8]) -> Result<i64> {
        self.check_range(vcn, count, data.len())?;
        let allocated = self.fill_holes(volume, vcn, count)?;
        let cluster_size = self.cluster_size;
        for piece in self.runs.pieces(vcn, count) {
            let at = ((piece.vcn - vcn) * cluster_size) as usize;
            let len = (piece.length * cluster_size) as usize;
            let lcn = piece.lcn.ok_or_else(|| {
                NtfsError::FormatCorruption(format!("VCN {} still sparse after allocation", piece.vcn))
            })?;
            volume.write_clusters(lcn, &data[at..at + len])?;
        }
        Ok(allocated as i64)
    }

    fn clear_clusters(&mut self, volume: &mut Volume, vcn: u64, count: u64) -> Result<i64> {
        if vcn + count > self.runs.end_vcn() {
            return Err(NtfsError::InvalidInput(format!(
                "clear of clusters {}..{} beyond the stream",
                vcn,
                vcn + count
            )));
        }
        let zeros = vec![0u8; self.cluster_size as usize];
        for piece in self.runs.pieces(vcn, count) {
            if let Some(lcn) = piece.lcn {
                for i in 0..piece.length {
                    volume.write_clusters(lcn + i, &zeros)?;
                }
            }
        }
        Ok(0)
    }

    fn is_cluster_stored(&self, vcn: u64) -> bool {
        self.runs.is_stored(vcn)
    }

    fn truncate_to_clusters(&mut self, volume: &mut Volume, clusters: u64) -> Result<i64> {
        if clusters >= self.runs.end_vcn() {
            return Ok(0);
        }
        let mut released = 0i64;
        for run in self.runs.truncate(clusters) {
            if let Some(lcn) = run.lcn {
                volume.free_cluster_range(lcn..lcn + run.length)?;
                released += run.length as i64;
            }
        }
        Ok(-released)
    }

    fn expand_to_clusters(&mut self, volume: &mut Volume, clusters: u64, extent: ExtentId, allocate: bool) -> Result<i64> {
        let end = self.runs.end_vcn();
        if clusters <= end {
            return Ok(0);
        }
        let count = clusters - end;
        if !allocate {
            self.runs.push(CookedRun { vcn: end, lcn: None, length: count, extent })?;
            return Ok(0);
        }
        let near = self.runs.lcn_hint_before(end);
        let mut vcn = end;
        for range in volume.allocate_clusters(count, near)? {
            let length = range.end - range.start;
            self.runs.push(CookedRun { vcn, lcn: Some(range.start), length, extent })?;
            vcn += length;
        }
        Ok(count as i64)
    }

    fn runs(&self) -> &CookedRuns {
        &self.runs
    }

    fn runs_mut(&mut self) -> &mut CookedRuns {
        &mut self.runs
    }

    fn into_runs(self: Box<Self>) -> CookedRuns {
        self.runs
    }
}
