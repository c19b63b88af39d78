// Cooked data runs: runs resolved to absolute VCN/LCN, each tagged with the
// attribute extent (arena handle) that stores it on disk

use crate::data_runs::RunSpan;
use ntfsrw_core::{NtfsError, Result};

/// Stable handle into a file's extent arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtentId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookedRun {
    pub vcn: u64,
    pub lcn: Option<u64>,
    pub length: u64,
    pub extent: ExtentId,
}

impl CookedRun {
    pub fn end_vcn(&self) -> u64 {
        self.vcn + self.length
    }

    pub fn is_sparse(&self) -> bool {
        self.lcn.is_none()
    }

    /// Physical cluster backing `vcn`, which must lie inside this run.
    pub fn lcn_at(&self, vcn: u64) -> Option<u64> {
        self.lcn.map(|lcn| lcn + (vcn - self.vcn))
    }
}

/// The VCN-ordered run list of one attribute across all of its extents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookedRuns {
    runs: Vec<CookedRun>,
}

impl CookedRuns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an extent's spans. The extent must start where the list ends.
    pub fn append_extent(&mut self, start_vcn: u64, spans: &[RunSpan], extent: ExtentId) -> Result<()> {
        if start_vcn != self.end_vcn() {
            return Err(NtfsError::FormatCorruption(format!(
                "extent starts at VCN {} but previous runs end at {}",
                start_vcn,
                self.end_vcn()
            )));
        }
        let mut vcn = start_vcn;
        for span in spans {
            if span.length == 0 {
                continue;
            }
            self.runs.push(CookedRun { vcn, lcn: span.lcn, length: span.length, extent });
            vcn += span.length;
        }
        Ok(())
    }

    pub fn runs(&self) -> &[CookedRun] {
        &self.runs
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CookedRun> {
        self.runs.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn end_vcn(&self) -> u64 {
        self.runs.last().map(|r| r.end_vcn()).unwrap_or(0)
    }

    pub fn last_extent(&self) -> Option<ExtentId> {
        self.runs.last().map(|r| r.extent)
    }

    /// Index of the run containing `vcn`.
    pub fn find(&self, vcn: u64) -> Option<usize> {
        let idx = self.runs.partition_point(|r| r.end_vcn() <= vcn);
        (idx < self.runs.len() && self.runs[idx].vcn <= vcn).then_some(idx)
    }

    pub fn lookup(&self, vcn: u64) -> Option<&CookedRun> {
        self.find(vcn).map(|i| &self.runs[i])
    }

    /// Last physical cluster before `vcn`, for allocating nearby.
    pub fn lcn_hint_before(&self, vcn: u64) -> Option<u64> {
        let idx = self.runs.partition_point(|r| r.vcn < vcn);
        self.runs[..idx].iter().rev().find_map(|r| {
            let end = r.end_vcn().min(vcn);
            r.lcn.map(|lcn| lcn + (end - r.vcn))
        })
    }

    pub fn is_stored(&self, vcn: u64) -> bool {
        self.lookup(vcn).map(|r| !r.is_sparse()).unwrap_or(false)
    }

    pub fn stored_clusters(&self) -> u64 {
        self.runs.iter().filter(|r| !r.is_sparse()).map(|r| r.length).sum()
    }

    /// Make sure a run boundary falls at `vcn`.
    pub fn split_at(&mut self, vcn: u64) {
        if let Some(idx) = self.find(vcn) {
            let run = self.runs[idx];
            if run.vcn == vcn {
                return;
            }
            let head = vcn - run.vcn;
            self.runs[idx].length = head;
            let tail = CookedRun {
                vcn,
                lcn: run.lcn.map(|lcn| lcn + head),
                length: run.length - head,
                extent: run.extent,
            };
            self.runs.insert(idx + 1, tail);
        }
    }

    /// Runs overlapping `[start, start+count)`, clipped to that range.
    pub fn pieces(&self, start: u64, count: u64) -> Vec<CookedRun> {
        let end = start + count;
        let first = self.runs.partition_point(|r| r.end_vcn() <= start);
        self.runs[first..]
            .iter()
            .take_while(|r| r.vcn < end)
            .map(|r| {
                let from = r.vcn.max(start);
                let to = r.end_vcn().min(end);
                CookedRun { vcn: from, lcn: r.lcn_at(from), length: to - from, extent: r.extent }
            })
            .collect()
    }

    /// Replace the runs covering `[start, start+count)` with `replacement`,
    /// which must cover exactly the same VCN range.
    pub fn replace_range(&mut self, start: u64, count: u64, replacement: Vec<CookedRun>) -> Result<()> {
        let covered: u64 = replacement.iter().map(|r| r.length).sum();
        if covered != count || replacement.first().map(|r| r.vcn != start).unwrap_or(count != 0) {
            return Err(NtfsError::LogicalMisuse(format!(
                "replacement runs cover {} clusters, expected {} from VCN {}",
                covered, count, start
            )));
        }
        self.split_at(start);
        self.split_at(start + count);
        let first = self.runs.partition_point(|r| r.vcn < start);
        let last = self.runs.partition_point(|r| r.vcn < start + count);
        self.runs.splice(first..last, replacement);
        Ok(())
    }

    pub fn push(&mut self, run: CookedRun) -> Result<()> {
        if run.vcn != self.end_vcn() {
            return Err(NtfsError::LogicalMisuse(format!(
                "run at VCN {} appended after VCN {}",
                run.vcn,
                self.end_vcn()
            )));
        }
        if run.length > 0 {
            self.runs.push(run);
        }
        Ok(())
    }

    /// Drop everything at or beyond `clusters`; returns the dropped runs.
    pub fn truncate(&mut self, clusters: u64) -> Vec<CookedRun> {
        self.split_at(clusters);
        let keep = self.runs.partition_point(|r| r.vcn < clusters);
        self.runs.split_off(keep)
    }

    /// Merge neighbouring runs of the same extent: consecutive holes, and
    /// physically contiguous allocated runs.
    pub fn collapse(&mut self) {
        let mut merged: Vec<CookedRun> = Vec::with_capacity(self.runs.len());
        for run in self.runs.drain(..) {
            if run.length == 0 {
                continue;
            }
            if let Some(prev) = merged.last_mut() {
                let joinable = prev.extent == run.extent
                    && match (prev.lcn, run.lcn) {
                        (None, None) => true,
                        (Some(a), Some(b)) => a + prev.length == b,
                        _ => false,
                    };
                if joinable {
                    prev.length += run.length;
                    continue;
                }
            }
            merged.push(run);
        }
        self.runs = merged;
    }

    /// Check VCN contiguity from `start_vcn` and the total against the
    /// expected cluster count.
    pub fn validate(&self, expected_clusters: u64) -> Result<()> {
        let mut vcn = 0;
        for run in &self.runs {
            if run.vcn != vcn {
                return Err(NtfsError::FormatCorruption(format!(
                    "VCN discontinuity: run at {} where {} was expected",
                    run.vcn, vcn
                )));
            }
            vcn = run.end_vcn();
        }
        if vcn != expected_clusters {
            return Err(NtfsError::FormatCorruption(format!(
                "runs cover {} clusters but the attribute allocates {}",
                vcn, expected_clusters
            )));
        }
        Ok(())
    }

    /// Spans belonging to one extent, in VCN order, with its start VCN.
    pub fn extent_spans(&self, extent: ExtentId) -> Option<(u64, Vec<RunSpan>)> {
        let mut start = None;
        let mut spans = Vec::new();
        for run in self.runs.iter().filter(|r| r.extent == extent) {
            start.get_or_insert(run.vcn);
            spans.push(RunSpan::new(run.lcn, run.length));
        }
        start.map(|s| (s, spans))
    }

    /// Physical ranges `(lcn, length)` in VCN order.
    pub fn cluster_ranges(&self) -> Vec<(u64, u64)> {
        self.runs.iter().filter_map(|r| r.lcn.map(|lcn| (lcn, r.length))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const E0: ExtentId = ExtentId(0);
    const E1: ExtentId = ExtentId(1);

    fn sample() -> CookedRuns {
        let mut runs = CookedRuns::new();
        runs.append_extent(0, &[RunSpan::new(Some(100), 4), RunSpan::new(None, 4)], E0).unwrap();
        runs.append_extent(8, &[RunSpan::new(Some(200), 8)], E1).unwrap();
        runs
    }

    #[test]
    fn test_lookup_and_stored() {
        let runs = sample();
        assert_eq!(runs.end_vcn(), 16);
        assert_eq!(runs.lookup(2).unwrap().lcn_at(2), Some(102));
        assert!(runs.is_stored(3));
        assert!(!runs.is_stored(4));
        assert!(runs.is_stored(15));
        assert!(!runs.is_stored(16));
        assert_eq!(runs.stored_clusters(), 12);
        assert_eq!(runs.lcn_hint_before(8), Some(104));
        assert_eq!(runs.lcn_hint_before(10), Some(202));
        assert_eq!(runs.lcn_hint_before(0), None);
        runs.validate(16).unwrap();
        assert!(runs.validate(17).is_err());
    }

    #[test]
    fn test_extent_discontinuity_rejected() {
        let mut runs = sample();
        let err = runs.append_extent(20, &[RunSpan::new(Some(1), 1)], E1).unwrap_err();
        assert!(matches!(err, NtfsError::FormatCorruption(_)));
    }

    #[test]
    fn test_replace_hole_and_collapse() {
        let mut runs = sample();
        let fill = vec![CookedRun { vcn: 4, lcn: Some(104), length: 4, extent: E0 }];
        runs.replace_range(4, 4, fill).unwrap();
        runs.collapse();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs.runs()[0], CookedRun { vcn: 0, lcn: Some(100), length: 8, extent: E0 });
        runs.validate(16).unwrap();
    }

    #[test]
    fn test_collapse_respects_extent_boundary() {
        let mut runs = CookedRuns::new();
        runs.append_extent(0, &[RunSpan::new(None, 2), RunSpan::new(None, 3)], E0).unwrap();
        runs.append_extent(5, &[RunSpan::new(None, 1)], E1).unwrap();
        runs.collapse();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs.runs()[0].length, 5);
    }

    #[test]
    fn test_pieces_and_truncate() {
        let mut runs = sample();
        let pieces = runs.pieces(2, 8);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0], CookedRun { vcn: 2, lcn: Some(102), length: 2, extent: E0 });
        assert_eq!(pieces[2], CookedRun { vcn: 8, lcn: Some(200), length: 2, extent: E1 });

        let dropped = runs.truncate(10);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0], CookedRun { vcn: 10, lcn: Some(202), length: 6, extent: E1 });
        assert_eq!(runs.end_vcn(), 10);
        assert_eq!(runs.extent_spans(E1), Some((8, vec![RunSpan::new(Some(200), 2)])));
    }

    #[test]
    fn test_replace_range_checks_coverage() {
        let mut runs = sample();
        let short = vec![CookedRun { vcn: 4, lcn: Some(1), length: 2, extent: E0 }];
        assert!(matches!(runs.replace_range(4, 4, short), Err(NtfsError::LogicalMisuse(_))));
    }
}
