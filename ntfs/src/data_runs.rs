// NTFS data run codec
// Mapping pairs: header nibbles give the byte widths of an unsigned cluster
// count and a signed LCN delta; a zero-width delta marks a sparse run

use ntfsrw_core::{NtfsError, Result};

/// One mapping pair as stored on disk.
///
/// `offset_delta` is relative to the previous non-sparse run's LCN and is
/// always 0 for sparse runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    pub is_sparse: bool,
    pub cluster_count: u64,
    pub offset_delta: i64,
}

impl DataRun {
    pub fn sparse(cluster_count: u64) -> Self {
        Self { is_sparse: true, cluster_count, offset_delta: 0 }
    }

    pub fn allocated(cluster_count: u64, offset_delta: i64) -> Self {
        Self { is_sparse: false, cluster_count, offset_delta }
    }

    /// Decode one run. Returns `None` at the terminator byte.
    pub fn decode(data: &[u8]) -> Result<Option<(DataRun, usize)>> {
        let header = *data
            .first()
            .ok_or_else(|| NtfsError::FormatCorruption("data run list missing terminator".to_string()))?;
        if header == 0 {
            return Ok(None);
        }

        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        if length_size == 0 || length_size > 8 || offset_size > 8 {
            return Err(NtfsError::FormatCorruption(format!("invalid data run header 0x{:02X}", header)));
        }
        let consumed = 1 + length_size + offset_size;
        if consumed > data.len() {
            return Err(NtfsError::FormatCorruption("data run extends beyond buffer".to_string()));
        }

        let cluster_count = read_le_unsigned(&data[1..1 + length_size]);
        let run = if offset_size == 0 {
            DataRun::sparse(cluster_count)
        } else {
            DataRun::allocated(cluster_count, read_le_signed(&data[1 + length_size..consumed]))
        };
        Ok(Some((run, consumed)))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let length_size = unsigned_len(self.cluster_count);
        let offset_size = if self.is_sparse { 0 } else { signed_len(self.offset_delta) };
        out.push(((offset_size as u8) << 4) | length_size as u8);
        out.extend_from_slice(&self.cluster_count.to_le_bytes()[..length_size]);
        out.extend_from_slice(&self.offset_delta.to_le_bytes()[..offset_size]);
    }

    pub fn encoded_len(&self) -> usize {
        let offset_size = if self.is_sparse { 0 } else { signed_len(self.offset_delta) };
        1 + unsigned_len(self.cluster_count) + offset_size
    }
}

/// A run in absolute coordinates: `lcn` is `None` for holes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSpan {
    pub lcn: Option<u64>,
    pub length: u64,
}

impl RunSpan {
    pub fn new(lcn: Option<u64>, length: u64) -> Self {
        Self { lcn, length }
    }
}

/// Decode a terminated run list. Returns the runs and the bytes consumed,
/// terminator included.
pub fn decode_run_list(data: &[u8]) -> Result<(Vec<DataRun>, usize)> {
    let mut runs = Vec::new();
    let mut pos = 0;
    while let Some((run, used)) = DataRun::decode(&data[pos..])? {
        runs.push(run);
        pos += used;
    }
    Ok((runs, pos + 1))
}

pub fn encode_run_list(runs: &[DataRun]) -> Vec<u8> {
    let mut out = Vec::with_capacity(run_list_len(runs));
    for run in runs {
        run.encode(&mut out);
    }
    out.push(0);
    out
}

/// Encoded size of a run list, terminator included.
pub fn run_list_len(runs: &[DataRun]) -> usize {
    runs.iter().map(DataRun::encoded_len).sum::<usize>() + 1
}

pub fn runs_to_spans(runs: &[DataRun]) -> Result<Vec<RunSpan>> {
    let mut spans = Vec::with_capacity(runs.len());
    let mut prev_lcn = 0i64;
    for run in runs {
        if run.is_sparse {
            spans.push(RunSpan::new(None, run.cluster_count));
            continue;
        }
        let lcn = prev_lcn
            .checked_add(run.offset_delta)
            .filter(|lcn| *lcn >= 0)
            .ok_or_else(|| {
                NtfsError::FormatCorruption(format!(
                    "data run delta {} from LCN {} leaves the volume",
                    run.offset_delta, prev_lcn
                ))
            })?;
        prev_lcn = lcn;
        spans.push(RunSpan::new(Some(lcn as u64), run.cluster_count));
    }
    Ok(spans)
}

pub fn spans_to_runs(spans: &[RunSpan]) -> Vec<DataRun> {
    let mut prev_lcn = 0i64;
    spans
        .iter()
        .map(|span| match span.lcn {
            None => DataRun::sparse(span.length),
            Some(lcn) => {
                let delta = lcn as i64 - prev_lcn;
                prev_lcn = lcn as i64;
                DataRun::allocated(span.length, delta)
            }
        })
        .collect()
}

/// Encoded size of the run list describing `spans`.
pub fn spans_encoded_len(spans: &[RunSpan]) -> usize {
    run_list_len(&spans_to_runs(spans))
}

fn read_le_unsigned(bytes: &[u8]) -> u64 {
    bytes.iter().enumerate().fold(0u64, |acc, (i, &b)| acc | (b as u64) << (i * 8))
}

fn read_le_signed(bytes: &[u8]) -> i64 {
    let value = read_le_unsigned(bytes) as i64;
    let bits = bytes.len() * 8;
    if bits < 64 && value & (1 << (bits - 1)) != 0 {
        value | !((1i64 << bits) - 1)
    } else {
        value
    }
}

// The count field is never empty so a zero-length run cannot look like the terminator
fn unsigned_len(value: u64) -> usize {
    (((64 - value.leading_zeros() as usize) + 7) / 8).max(1)
}

// Smallest width whose sign extension reproduces the value (adds the guard byte)
fn signed_len(value: i64) -> usize {
    (1..8)
        .find(|&n| {
            let shift = 64 - 8 * n as u32;
            (value << shift) >> shift == value
        })
        .unwrap_or(8)
}
