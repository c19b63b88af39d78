// Allocation bitmaps: the volume's $Bitmap (one bit per cluster) and the
// record table's $MFT:$BITMAP (one bit per record)

use log::debug;
use ntfsrw_core::{NtfsError, Result};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
    len: u64,
}

impl Bitmap {
    pub fn new(len: u64) -> Self {
        Self { bits: vec![0u8; ((len + 7) / 8) as usize], len }
    }

    /// Wrap on-disk bytes; bits past `len` are ignored.
    pub fn from_bytes(mut bytes: Vec<u8>, len: u64) -> Self {
        bytes.resize(((len + 7) / 8) as usize, 0);
        Self { bits: bytes, len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn get(&self, bit: u64) -> bool {
        bit < self.len && self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    pub fn set(&mut self, bit: u64) {
        if bit < self.len {
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    pub fn clear(&mut self, bit: u64) {
        if bit < self.len {
            self.bits[(bit / 8) as usize] &= !(1 << (bit % 8));
        }
    }

    pub fn set_range(&mut self, range: Range<u64>) {
        for bit in range {
            self.set(bit);
        }
    }

    pub fn clear_range(&mut self, range: Range<u64>) {
        for bit in range {
            self.clear(bit);
        }
    }

    /// Grow or shrink, keeping existing bits.
    pub fn resize(&mut self, len: u64) {
        self.bits.resize(((len + 7) / 8) as usize, 0);
        if len < self.len {
            // Drop stale bits in the last partial byte
            for bit in len..(self.bits.len() as u64 * 8).min(self.len) {
                self.bits[(bit / 8) as usize] &= !(1 << (bit % 8));
            }
        }
        self.len = len;
    }

    pub fn count_set(&self) -> u64 {
        (0..self.len).filter(|&b| self.get(b)).count() as u64
    }

    /// First clear bit at or after `start`.
    pub fn find_clear(&self, start: u64) -> Option<u64> {
        let mut bit = start;
        while bit < self.len {
            let byte = self.bits[(bit / 8) as usize];
            if byte == 0xFF && bit % 8 == 0 {
                bit += 8;
                continue;
            }
            if byte & (1 << (bit % 8)) == 0 {
                return Some(bit);
            }
            bit += 1;
        }
        None
    }

    /// Length of the clear run starting at `start`, capped at `max`.
    pub fn clear_run_len(&self, start: u64, max: u64) -> u64 {
        let mut len = 0;
        while len < max && start + len < self.len && !self.get(start + len) {
            len += 1;
        }
        len
    }

    /// First run of `count` clear bits at or after `start`.
    pub fn find_clear_run(&self, start: u64, count: u64) -> Option<u64> {
        let mut bit = self.find_clear(start)?;
        loop {
            let run = self.clear_run_len(bit, count);
            if run == count {
                return Some(bit);
            }
            bit = self.find_clear(bit + run + 1)?;
        }
    }
}

/// Free-cluster map with the allocation policy used by the cluster streams.
#[derive(Debug, Clone)]
pub struct ClusterBitmap {
    bitmap: Bitmap,
    free: u64,
    // Lowest cluster index that may be free
    search_start: u64,
}

impl ClusterBitmap {
    pub fn new(bitmap: Bitmap) -> Self {
        let free = bitmap.len() - bitmap.count_set();
        Self { bitmap, free, search_start: 0 }
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn total_clusters(&self) -> u64 {
        self.bitmap.len()
    }

    pub fn free_clusters_count(&self) -> u64 {
        self.free
    }

    pub fn is_allocated(&self, lcn: u64) -> bool {
        self.bitmap.get(lcn)
    }

    /// Allocate `count` clusters, preferring a run that starts right at
    /// `preferred_near`. May return several fragments.
    pub fn allocate_clusters(&mut self, count: u64, preferred_near: Option<u64>) -> Result<Vec<Range<u64>>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if count > self.free {
            return Err(NtfsError::CapacityExhausted(format!(
                "{} clusters requested, {} free",
                count, self.free
            )));
        }

        let mut ranges: Vec<Range<u64>> = Vec::new();
        let mut remaining = count;

        // Extend in place first
        if let Some(near) = preferred_near.filter(|&n| n < self.bitmap.len()) {
            let run = self.bitmap.clear_run_len(near, remaining);
            if run > 0 {
                self.bitmap.set_range(near..near + run);
                ranges.push(near..near + run);
                remaining -= run;
            }
        }
        // Then a single contiguous run anywhere
        if remaining > 0 {
            let from = preferred_near.unwrap_or(self.search_start);
            let start = self
                .bitmap
                .find_clear_run(from, remaining)
                .or_else(|| self.bitmap.find_clear_run(self.search_start, remaining));
            if let Some(start) = start {
                self.bitmap.set_range(start..start + remaining);
                ranges.push(start..start + remaining);
                remaining = 0;
            }
        }
        // Finally whatever fragments are left, first fit
        let mut cursor = self.search_start;
        while remaining > 0 {
            let Some(start) = self.bitmap.find_clear(cursor) else {
                for range in &ranges {
                    self.bitmap.clear_range(range.clone());
                }
                return Err(NtfsError::CapacityExhausted(format!(
                    "ran out of clusters with {} still needed",
                    remaining
                )));
            };
            let run = self.bitmap.clear_run_len(start, remaining);
            self.bitmap.set_range(start..start + run);
            ranges.push(start..start + run);
            remaining -= run;
            cursor = start + run;
        }

        self.free -= count;
        if self.bitmap.get(self.search_start) {
            self.search_start = self.bitmap.find_clear(self.search_start).unwrap_or(self.bitmap.len());
        }
        debug!("Allocated {} clusters in {} fragment(s): {:?}", count, ranges.len(), ranges);
        Ok(ranges)
    }

    pub fn free_clusters(&mut self, range: Range<u64>) -> Result<()> {
        if range.end > self.bitmap.len() {
            return Err(NtfsError::FormatCorruption(format!(
                "freeing clusters {:?} beyond the volume ({} clusters)",
                range,
                self.bitmap.len()
            )));
        }
        for lcn in range.clone() {
            if !self.bitmap.get(lcn) {
                return Err(NtfsError::FormatCorruption(format!("cluster {} freed twice", lcn)));
            }
        }
        self.bitmap.clear_range(range.clone());
        self.free += range.end - range.start;
        self.search_start = self.search_start.min(range.start);
        debug!("Freed clusters {:?}", range);
        Ok(())
    }

    /// Mark clusters in use without allocation policy (bootstrap, repair).
    pub fn mark_allocated(&mut self, range: Range<u64>) {
        for lcn in range {
            if !self.bitmap.get(lcn) && lcn < self.bitmap.len() {
                self.bitmap.set(lcn);
                self.free -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_basics() {
        let mut bm = Bitmap::new(20);
        bm.set_range(0..9);
        assert!(bm.get(8));
        assert!(!bm.get(9));
        assert_eq!(bm.find_clear(0), Some(9));
        assert_eq!(bm.count_set(), 9);
        bm.set(15);
        assert_eq!(bm.find_clear_run(9, 6), Some(9));
        assert_eq!(bm.find_clear_run(9, 7), None);
        assert_eq!(bm.find_clear_run(9, 4), Some(9));
        assert_eq!(bm.find_clear_run(10, 5), Some(10));
        assert!(!bm.get(25));
        bm.resize(12);
        assert_eq!(bm.len(), 12);
        bm.resize(20);
        assert!(!bm.get(15));
    }

    #[test]
    fn test_allocate_prefers_neighbour() {
        let mut bm = Bitmap::new(100);
        bm.set_range(0..10);
        let mut clusters = ClusterBitmap::new(bm);
        let first = clusters.allocate_clusters(5, None).unwrap();
        assert_eq!(first, vec![10..15]);
        // Some other allocation in between
        clusters.allocate_clusters(3, Some(40)).unwrap();
        let next = clusters.allocate_clusters(4, Some(15)).unwrap();
        assert_eq!(next, vec![15..19]);
        assert_eq!(clusters.free_clusters_count(), 100 - 10 - 12);
    }

    #[test]
    fn test_allocate_fragments_when_needed() {
        let mut bm = Bitmap::new(16);
        for lcn in (0..16).step_by(2) {
            bm.set(lcn);
        }
        let mut clusters = ClusterBitmap::new(bm);
        let ranges = clusters.allocate_clusters(3, None).unwrap();
        assert_eq!(ranges, vec![1..2, 3..4, 5..6]);
        assert!(matches!(
            clusters.allocate_clusters(6, None),
            Err(NtfsError::CapacityExhausted(_))
        ));
    }

    #[test]
    fn test_free_and_reuse() {
        let mut clusters = ClusterBitmap::new(Bitmap::new(32));
        let ranges = clusters.allocate_clusters(8, None).unwrap();
        assert_eq!(ranges, vec![0..8]);
        clusters.free_clusters(2..4).unwrap();
        assert!(clusters.free_clusters(2..3).is_err());
        assert_eq!(clusters.allocate_clusters(2, None).unwrap(), vec![2..4]);
        assert!(clusters.free_clusters(30..40).is_err());
    }
}
