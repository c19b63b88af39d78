// Cluster streams: VCN-addressed I/O over an attribute's cooked runs
// Three strategies share one interface: raw (every cluster backed),
// sparse (holes may stay unallocated) and compressed (LZNT1 units)

mod compressed;
mod raw;
mod sparse;

pub use compressed::CompressedStream;
pub use raw::RawStream;
pub use sparse::SparseStream;

use crate::cooked_runs::{CookedRuns, ExtentId};
use crate::volume::Volume;
use ntfsrw_core::Result;

/// Clusters-in, clusters-out access to one attribute's data.
///
/// Every mutating call returns the net change in physically stored
/// clusters: positive when clusters were allocated, negative when they
/// were released back to the volume.
pub trait ClusterStream {
    /// Fill `buf` (exactly `count` clusters) starting at `vcn`.
    fn read_clusters(&mut self, volume: &mut Volume, vcn: u64, count: u64, buf: &mut [u8]) -> Result<()>;

    fn write_clusters(&mut self, volume: &mut Volume, vcn: u64, count: u64, data: &[u8]) -> Result<i64>;

    /// Make `count` clusters read back as zeros.
    fn clear_clusters(&mut self, volume: &mut Volume, vcn: u64, count: u64) -> Result<i64>;

    fn is_cluster_stored(&self, vcn: u64) -> bool;

    /// Drop every cluster at or beyond `clusters`.
    fn truncate_to_clusters(&mut self, volume: &mut Volume, clusters: u64) -> Result<i64>;

    /// Grow the stream to `clusters`, tagging new runs with `extent`.
    /// With `allocate` unset the new range is a hole.
    fn expand_to_clusters(&mut self, volume: &mut Volume, clusters: u64, extent: ExtentId, allocate: bool) -> Result<i64>;

    fn runs(&self) -> &CookedRuns;

    fn runs_mut(&mut self) -> &mut CookedRuns;

    fn into_runs(self: Box<Self>) -> CookedRuns;
}

/// How an attribute's clusters are laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    Raw,
    Sparse,
    Compressed {
        /// log2 of clusters per compression unit
        unit_shift: u8,
        /// (base record, attribute type, attribute name) for the unit cache
        owner: (u64, u32, Vec<u16>),
    },
}

impl StreamKind {
    /// Clusters per allocation granule: one, or a whole compression unit.
    pub fn granule(&self) -> u64 {
        match self {
            StreamKind::Compressed { unit_shift, .. } => 1 << unit_shift,
            _ => 1,
        }
    }

    pub fn open(&self, runs: CookedRuns, cluster_size: u64) -> Box<dyn ClusterStream> {
        match self {
            StreamKind::Raw => Box::new(RawStream::new(runs, cluster_size)),
            StreamKind::Sparse => Box::new(SparseStream::new(runs, cluster_size)),
            StreamKind::Compressed { unit_shift, owner } => {
                Box::new(CompressedStream::new(runs, cluster_size, *unit_shift, owner.clone()))
            }
        }
    }
}
