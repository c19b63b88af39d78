// Sparse cluster stream: raw I/O, but cleared ranges go back to the volume

use super::{ClusterStream, RawStream};
use crate::cooked_runs::{CookedRuns, ExtentId};
use crate::volume::Volume;
use ntfsrw_core::Result;

#[derive(Debug, Clone)]
pub struct SparseStream {
    inner: RawStream,
}

impl SparseStream {
    pub fn new(runs: CookedRuns, cluster_size: u64) -> Self {
        Self { inner: RawStream::new(runs, cluster_size) }
    }
}

impl ClusterStream for SparseStream {
    fn read_clusters(&mut self, volume: &mut Volume, vcn: u64, count: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_clusters(volume, vcn, count, buf)
    }

    fn write_clusters(&mut self, volume: &mut Volume, vcn: u64, count: u64, data: &[u8]) -> Result<i64> {
        self.inner.write_clusters(volume, vcn, count, data)
    }

    fn clear_clusters(&mut self, volume: &mut Volume, vcn: u64, count: u64) -> Result<i64> {
        Ok(-(self.inner.release(volume, vcn, count)? as i64))
    }

    fn is_cluster_stored(&self, vcn: u64) -> bool {
        self.inner.is_cluster_stored(vcn)
    }

    fn truncate_to_clusters(&mut self, volume: &mut Volume, clusters: u64) -> Result<i64> {
        self.inner.truncate_to_clusters(volume, clusters)
    }

    fn expand_to_clusters(&mut self, volume: &mut Volume, clusters: u64, extent: ExtentId, allocate: bool) -> Result<i64> {
        self.inner.expand_to_clusters(volume, clusters, extent, allocate)
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
